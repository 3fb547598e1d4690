use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::ops::OperationKind;
use crate::transport::{describe_status, Permission, TransportError};
use crate::Address;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("The Bluetooth adapter is turned off.")]
    AdapterOff,
    #[error("Missing permissions: {}.", join_permissions(missing))]
    PermissionsNotGranted { missing: Vec<Permission> },
    #[error("{:?} is not a valid device address.", address)]
    InvalidAddress { address: String },
    #[error("Scan failed with error code {}.", code)]
    ScanFailed { code: i32 },
    #[error("GATT {} operation failed{}.", verb, describe_optional_status(*status))]
    GattOperationFailed {
        verb: OperationKind,
        status: Option<u16>,
    },
    #[error("Device {} disconnected (status {}).", address, describe_status(*status))]
    Disconnected { address: Address, status: u16 },
    #[error("Device {} lost its connection: {}.", address, describe_status(*status))]
    GattDisconnected { address: Address, status: u16 },
    #[error("Service {} not found.", uuid)]
    ServiceNotFound { uuid: Uuid },
    #[error("Characteristic {} not found.", uuid)]
    CharacteristicNotFound { uuid: Uuid },
    #[error("Descriptor {} not found.", uuid)]
    DescriptorNotFound { uuid: Uuid },
    #[error("Could not connect to {}: {}.", address, reason)]
    ConnectionFailed { address: Address, reason: String },
    #[error("Device {} is not connected.", address)]
    NotConnected { address: Address },
    #[error("The operation queue is full (capacity {}).", capacity)]
    QueueFull { capacity: usize },
    #[error("The operation queue has shut down.")]
    QueueClosed,
    #[error("The {} operation completed without producing a result.", kind)]
    NoResult { kind: OperationKind },
    #[error("Timed out after {:?} connecting to {}.", timeout, address)]
    Timeout { address: Address, timeout: Duration },
    #[error("No tokio runtime is available to drive the operation queues.")]
    NoRuntime,
    #[error("The Bluetooth driver refused the request: {}.", source)]
    Transport {
        #[source]
        source: TransportError,
    },
    #[error("Malformed value for {}: {}.", uuid, reason)]
    MalformedValue { uuid: Uuid, reason: String },
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PermissionDenied { missing } => Error::PermissionsNotGranted { missing },
            TransportError::AdapterUnavailable => Error::AdapterOff,
            source => Error::Transport { source },
        }
    }
}

impl Error {
    pub(crate) fn gatt(verb: OperationKind) -> Self {
        Error::GattOperationFailed { verb, status: None }
    }

    pub(crate) fn gatt_status(verb: OperationKind, status: u16) -> Self {
        Error::GattOperationFailed {
            verb,
            status: Some(status),
        }
    }

    /// Whether this error reports the end of the link, either a clean
    /// disconnection or one caused by a GATT error.
    pub fn is_disconnection(&self) -> bool {
        matches!(
            self,
            Error::Disconnected { .. } | Error::GattDisconnected { .. }
        )
    }
}

fn join_permissions(missing: &[Permission]) -> String {
    if missing.is_empty() {
        return "unspecified".to_owned();
    }

    missing
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_optional_status(status: Option<u16>) -> String {
    match status {
        Some(status) => format!(" with {}", describe_status(status)),
        None => String::new(),
    }
}
