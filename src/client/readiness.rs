use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::transport::{Permission, Transport};

/// Whether scanning and connecting can work right now.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    NotReady(NotReadyReason),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum NotReadyReason {
    AdapterOff,
    LocationServicesOff,
    PermissionsNotGranted,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        *self == Readiness::Ready
    }
}

impl Display for Readiness {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Readiness::Ready => f.write_str("ready"),
            Readiness::NotReady(NotReadyReason::AdapterOff) => {
                f.write_str("not ready: Bluetooth is off")
            }
            Readiness::NotReady(NotReadyReason::LocationServicesOff) => {
                f.write_str("not ready: location services are off")
            }
            Readiness::NotReady(NotReadyReason::PermissionsNotGranted) => {
                f.write_str("not ready: permissions missing")
            }
        }
    }
}

/// Permissions scanning needs on `platform_version`. Older platforms gate
/// scanning behind location access.
pub fn scan_permissions(platform_version: u32, location_waiver_version: u32) -> Vec<Permission> {
    if platform_version < location_waiver_version {
        vec![Permission::FineLocation, Permission::CoarseLocation]
    } else {
        vec![Permission::BluetoothScan]
    }
}

/// Runs the readiness checks in order; the first failing one decides.
pub(crate) fn check(transport: &dyn Transport, config: &ClientConfig) -> Readiness {
    if !transport.is_adapter_enabled() {
        return Readiness::NotReady(NotReadyReason::AdapterOff);
    }

    let version = transport.platform_version();
    if version < config.location_waiver_version && !transport.is_location_enabled() {
        return Readiness::NotReady(NotReadyReason::LocationServicesOff);
    }

    let required = scan_permissions(version, config.location_waiver_version);
    if !transport.missing_permissions(&required).is_empty() {
        return Readiness::NotReady(NotReadyReason::PermissionsNotGranted);
    }

    Readiness::Ready
}
