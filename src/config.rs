use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::ScanSettings;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_CONNECT_RETRIES: usize = 2;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// First platform version on which scanning no longer needs location
/// services or location permissions.
pub const DEFAULT_LOCATION_WAIVER_VERSION: u32 = 31;

/// Tunables of a [`Client`](crate::Client) and the connections it opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How many operations may wait in each queue.
    pub queue_capacity: usize,
    /// Extra attempts at connect + discover after the first one fails.
    pub connect_retries: usize,
    /// Upper bound on [`Device::connect`](crate::Device::connect), retries
    /// included.
    pub connect_timeout: Duration,
    /// Let the driver connect whenever the peripheral becomes available
    /// instead of failing when it is not around.
    pub auto_connect: bool,
    pub location_waiver_version: u32,
    pub scan_settings: ScanSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_connect: false,
            location_waiver_version: DEFAULT_LOCATION_WAIVER_VERSION,
            scan_settings: ScanSettings::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_connect_retries(mut self, retries: usize) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_location_waiver_version(mut self, version: u32) -> Self {
        self.location_waiver_version = version;
        self
    }

    pub fn with_scan_settings(mut self, settings: ScanSettings) -> Self {
        self.scan_settings = settings;
        self
    }
}
