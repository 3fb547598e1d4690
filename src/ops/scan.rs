use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::{NotReadyReason, Readiness};
use crate::ops::{Emitter, Operation, OperationKind};
use crate::result::Error;
use crate::transport::{
    Permission, ScanCallback, ScanEvent, ScanFilter, ScanId, ScanResult, ScanSettings,
    Transport, TransportError,
};

/// Reported when the driver refuses to start a scan for no specific reason.
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

/// Reports every matching advertisement until the caller stops listening,
/// the scan fails, or the adapter is turned off.
pub(crate) struct Scan {
    transport: Arc<dyn Transport>,
    id: ScanId,
    filters: Vec<ScanFilter>,
    settings: ScanSettings,
    permissions: Vec<Permission>,
    readiness: watch::Receiver<Readiness>,
}

/// Stops the scan when dropped, so it is stopped on every way out of
/// [`Scan::execute`], cancellation included.
struct StopScan {
    transport: Arc<dyn Transport>,
    id: ScanId,
}

impl Drop for StopScan {
    fn drop(&mut self) {
        debug!(scan = self.id.0, "stopping scan");
        if let Err(error) = self.transport.stop_scan(self.id) {
            warn!(scan = self.id.0, %error, "could not stop scan");
        }
    }
}

impl Scan {
    pub fn new(
        transport: Arc<dyn Transport>,
        id: ScanId,
        filters: Vec<ScanFilter>,
        settings: ScanSettings,
        permissions: Vec<Permission>,
        readiness: watch::Receiver<Readiness>,
    ) -> Self {
        Scan {
            transport,
            id,
            filters,
            settings,
            permissions,
            readiness,
        }
    }
}

fn matches(filters: &[ScanFilter], result: &ScanResult) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(result))
}

impl Operation for Scan {
    type Output = ScanResult;

    fn kind(&self) -> OperationKind {
        OperationKind::Scan
    }

    fn execute(self, emitter: Emitter<ScanResult>) -> BoxFuture<'static, ()> {
        let Scan {
            transport,
            id,
            filters,
            settings,
            permissions,
            mut readiness,
        } = self;

        async move {
            let missing = transport.missing_permissions(&permissions);
            if !missing.is_empty() {
                return emitter.error(Error::PermissionsNotGranted { missing });
            }

            let (callback, mut events) = ScanCallback::new(id);
            if let Err(error) = transport.start_scan(&filters, &settings, callback) {
                return emitter.error(match error {
                    TransportError::PermissionDenied { .. } => Error::PermissionsNotGranted {
                        missing: permissions,
                    },
                    TransportError::AdapterUnavailable => Error::AdapterOff,
                    other => {
                        warn!(scan = id.0, error = %other, "scan refused");
                        Error::ScanFailed {
                            code: SCAN_FAILED_INTERNAL_ERROR,
                        }
                    }
                });
            }

            let _stop = StopScan {
                transport: transport.clone(),
                id,
            };
            debug!(scan = id.0, filters = filters.len(), "scan started");

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(ScanEvent::Result(result)) => {
                            if matches(&filters, &result) && !emitter.next(result) {
                                return;
                            }
                        }
                        Some(ScanEvent::Failed(code)) => {
                            return emitter.error(Error::ScanFailed { code });
                        }
                        None => return,
                    },
                    changed = readiness.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let off = *readiness.borrow()
                            == Readiness::NotReady(NotReadyReason::AdapterOff);
                        if off {
                            return emitter.error(Error::AdapterOff);
                        }
                    }
                }
            }
        }
        .boxed()
    }
}
