//! The contract between this crate and the platform's Bluetooth driver.
//!
//! A driver implements [`Transport`] for adapter-wide primitives (scanning,
//! opening links, the connection registry, readiness queries) and [`Link`]
//! for the primitives of one open GATT connection. Every request returns as
//! soon as it has been handed to the radio; its outcome arrives later through
//! the [`GattCallback`] or [`ScanCallback`] the request was issued with.
//!
//! Drivers must only ever call the callbacks, never block on them. The
//! callbacks themselves never block and never call back into the driver.

use std::fmt::{Display, Formatter};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gatt::{Characteristic, Descriptor};
use crate::Address;

pub use crate::session::GattCallback;

#[cfg(test)]
pub(crate) mod fake;

/// Why the driver refused to issue a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The driver returned `false` for the request, e.g. because another
    /// request is still in flight or the link is gone.
    #[error("the request was rejected")]
    Rejected,
    /// The platform denied the call for lack of permissions.
    #[error("permission denied: {:?}", missing)]
    PermissionDenied { missing: Vec<Permission> },
    /// The radio is off or otherwise unavailable.
    #[error("the adapter is unavailable")]
    AdapterUnavailable,
    /// Anything else the driver wants to report.
    #[error("{}", message)]
    Other { message: String },
}

pub type Request = std::result::Result<(), TransportError>;

/// Runtime permissions gating Bluetooth use.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Permission {
    BluetoothScan,
    BluetoothConnect,
    FineLocation,
    CoarseLocation,
}

impl Display for Permission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Permission::BluetoothScan => "BLUETOOTH_SCAN",
            Permission::BluetoothConnect => "BLUETOOTH_CONNECT",
            Permission::FineLocation => "ACCESS_FINE_LOCATION",
            Permission::CoarseLocation => "ACCESS_COARSE_LOCATION",
        };
        f.write_str(name)
    }
}

/// Link states as reported by the driver.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl LinkState {
    /// Decodes a raw driver state. Anything unrecognised counts as
    /// disconnected.
    pub fn from_code(code: u8) -> Self {
        FromPrimitive::from_u8(code).unwrap_or(LinkState::Disconnected)
    }
}

/// ATT / GATT status codes carried by every completion callback.
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive)]
pub enum GattStatus {
    Success = 0x0000,
    InvalidHandle = 0x0001,
    ReadNotPermitted = 0x0002,
    WriteNotPermitted = 0x0003,
    InvalidPdu = 0x0004,
    InsufficientAuthentication = 0x0005,
    RequestNotSupported = 0x0006,
    InvalidOffset = 0x0007,
    InsufficientAuthorization = 0x0008,
    PrepareQueueFull = 0x0009,
    AttributeNotFound = 0x000a,
    AttributeNotLong = 0x000b,
    InsufficientEncryptionKeySize = 0x000c,
    InvalidAttributeLength = 0x000d,
    UnlikelyError = 0x000e,
    InsufficientEncryption = 0x000f,
    UnsupportedGroupType = 0x0010,
    InsufficientResources = 0x0011,
    Error = 0x0085,
    ConnectionCongested = 0x008f,
    ConnectionTimeout = 0x0093,
    Failure = 0x0101,
}

impl GattStatus {
    pub fn from_code(code: u16) -> Option<Self> {
        FromPrimitive::from_u16(code)
    }
}

pub const GATT_SUCCESS: u16 = GattStatus::Success as u16;

pub fn is_success(status: u16) -> bool {
    status == GATT_SUCCESS
}

/// Renders a status code with its name when it is a known one.
pub fn describe_status(status: u16) -> String {
    match GattStatus::from_code(status) {
        Some(known) => format!("{:?} (0x{:04x})", known, status),
        None => format!("0x{:04x}", status),
    }
}

/// How aggressively the radio should scan.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum ScanMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanSettings {
    pub mode: ScanMode,
}

/// One scan filter; a result is reported when it matches any filter. Every
/// criterion that is set on a filter must match.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ScanFilter {
    pub service_uuid: Option<Uuid>,
    pub address: Option<Address>,
    pub name: Option<String>,
}

impl ScanFilter {
    pub fn service(uuid: Uuid) -> Self {
        ScanFilter {
            service_uuid: Some(uuid),
            ..Default::default()
        }
    }

    pub fn matches(&self, result: &ScanResult) -> bool {
        self.service_uuid
            .map_or(true, |uuid| result.service_uuids.contains(&uuid))
            && self.address.map_or(true, |a| a == result.address)
            && self
                .name
                .as_ref()
                .map_or(true, |n| result.name.as_ref() == Some(n))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanResult {
    pub address: Address,
    pub name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum ScanEvent {
    Result(ScanResult),
    Failed(i32),
}

/// Identifies a running scan so that it can be stopped.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ScanId(pub u64);

/// Where the driver reports results for one scan.
#[derive(Debug, Clone)]
pub struct ScanCallback {
    id: ScanId,
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ScanCallback {
    pub(crate) fn new(id: ScanId) -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ScanCallback { id, tx }, rx)
    }

    pub fn id(&self) -> ScanId {
        self.id
    }

    pub fn on_scan_result(&self, result: ScanResult) {
        // the scan may already have been cancelled
        let _ = self.tx.send(ScanEvent::Result(result));
    }

    pub fn on_batch_scan_results(&self, results: Vec<ScanResult>) {
        for result in results {
            self.on_scan_result(result);
        }
    }

    pub fn on_scan_failed(&self, code: i32) {
        let _ = self.tx.send(ScanEvent::Failed(code));
    }
}

/// Adapter-wide primitives.
pub trait Transport: Send + Sync + 'static {
    fn is_adapter_enabled(&self) -> bool;

    fn is_location_enabled(&self) -> bool;

    /// The platform API level; decides which permissions scanning needs and
    /// whether location services matter at all.
    fn platform_version(&self) -> u32;

    /// Returns the subset of `permissions` that has not been granted.
    fn missing_permissions(&self, permissions: &[Permission]) -> Vec<Permission>;

    fn device_name(&self, address: Address) -> Result<Option<String>, TransportError>;

    fn start_scan(
        &self,
        filters: &[ScanFilter],
        settings: &ScanSettings,
        callback: ScanCallback,
    ) -> Request;

    fn stop_scan(&self, scan: ScanId) -> Request;

    /// Opens a link to `address`. The returned handle is live immediately;
    /// whether the connection succeeds is reported through `callback`.
    fn connect(
        &self,
        address: Address,
        auto_connect: bool,
        callback: GattCallback,
    ) -> Result<Box<dyn Link>, TransportError>;

    /// The driver's own view of the link to `address`, independent of any
    /// state cached by this crate.
    fn connection_state(&self, address: Address) -> Result<LinkState, TransportError>;

    fn connected_devices(&self) -> Result<Vec<Address>, TransportError>;
}

/// Primitives of one open GATT link.
pub trait Link: Send + Sync + 'static {
    fn address(&self) -> Address;

    fn discover_services(&self) -> Request;

    fn read_characteristic(&self, characteristic: &Characteristic) -> Request;

    fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8]) -> Request;

    fn read_descriptor(&self, descriptor: &Descriptor) -> Request;

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Request;

    /// Turns local delivery of notifications for `characteristic` on or off.
    /// This does not talk to the peripheral.
    fn set_characteristic_notification(
        &self,
        characteristic: &Characteristic,
        enable: bool,
    ) -> Request;

    fn request_mtu(&self, mtu: u16) -> Request;

    fn disconnect(&self) -> Request;

    /// Releases the link. No callbacks are delivered afterwards.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn status_names() {
        assert_eq!(describe_status(0), "Success (0x0000)");
        assert_eq!(describe_status(0x85), "Error (0x0085)");
        assert_eq!(describe_status(0x1234), "0x1234");
        assert!(is_success(GATT_SUCCESS));
        assert!(!is_success(133));
    }

    #[test]
    pub fn unknown_link_state_is_disconnected() {
        assert_eq!(LinkState::from_code(2), LinkState::Connected);
        assert_eq!(LinkState::from_code(42), LinkState::Disconnected);
    }

    #[test]
    pub fn scan_filter_matching() {
        let hr = crate::util::uuid_from_u16(0x180d);
        let result = ScanResult {
            address: Address::new([1, 2, 3, 4, 5, 6]),
            name: Some("Polar H10".to_owned()),
            rssi: -60,
            service_uuids: vec![hr],
        };

        assert!(ScanFilter::service(hr).matches(&result));
        assert!(!ScanFilter::service(crate::util::uuid_from_u16(0x180f)).matches(&result));
        assert!(ScanFilter::default().matches(&result));
        assert!(!ScanFilter {
            name: Some("other".to_owned()),
            ..Default::default()
        }
        .matches(&result));
    }
}
