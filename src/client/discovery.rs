use std::sync::atomic::Ordering;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;
use uuid::Uuid;

use crate::client::{scan_permissions, Client};
use crate::device::Device;
use crate::ops::scan::Scan;
use crate::result::Result;
use crate::transport::{ScanFilter, ScanId, ScanSettings};

impl Client {
    /// Scans for devices advertising any of `service_uuids`, or for every
    /// device when it is empty, with the configured scan settings.
    ///
    /// Nothing happens until the stream is first polled. The scan occupies
    /// the client queue until the stream is dropped, it fails, or the
    /// adapter is turned off.
    pub fn scan_for_devices(&self, service_uuids: &[Uuid]) -> BoxStream<'static, Result<Device>> {
        let filters = service_uuids
            .iter()
            .map(|uuid| ScanFilter::service(*uuid))
            .collect();
        self.scan(filters, self.inner.config.scan_settings.clone())
    }

    /// Like [`scan_for_devices`](Self::scan_for_devices) with explicit filters
    /// and settings. A device is reported when it matches any filter.
    pub fn scan(
        &self,
        filters: Vec<ScanFilter>,
        settings: ScanSettings,
    ) -> BoxStream<'static, Result<Device>> {
        let inner = self.inner.clone();
        let id = ScanId(inner.next_scan.fetch_add(1, Ordering::Relaxed));
        let permissions = scan_permissions(
            inner.transport.platform_version(),
            inner.config.location_waiver_version,
        );
        debug!(scan = id.0, filters = filters.len(), "scan requested");

        let scan = Scan::new(
            inner.transport.clone(),
            id,
            filters,
            settings,
            permissions,
            inner.readiness.subscribe(),
        );

        let results = inner.queue.schedule(scan);
        results
            .map(move |result| {
                result.map(|found| {
                    let device = inner.device(found.address);
                    device.learn_name(found.name);
                    device
                })
            })
            .boxed()
    }
}
