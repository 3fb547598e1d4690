//! Operations: one type per GATT verb, executed one at a time by an
//! [`OperationQueue`](queue::OperationQueue).
//!
//! An operation registers interest in the hub stream carrying its completion
//! before it issues its request, then pushes exactly one terminal event (its
//! value(s) followed by completion, or a failure) to its [`Emitter`].

use std::fmt::{Display, Formatter};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::result::{Error, Result};
use crate::transport::{Permission, TransportError};
use crate::util::OperationId;

pub(crate) mod connect;
pub(crate) mod descriptor;
pub(crate) mod disconnect;
pub(crate) mod discover;
pub(crate) mod mtu;
pub(crate) mod queue;
pub(crate) mod read;
pub(crate) mod scan;
pub(crate) mod subscribe;
pub(crate) mod write;

pub use queue::{OperationQueue, OperationStream};
pub use subscribe::Notifications;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OperationKind {
    Scan,
    Connect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    Subscribe,
    Unsubscribe,
    RequestMtu,
    Disconnect,
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Scan => "scan",
            OperationKind::Connect => "connect",
            OperationKind::DiscoverServices => "discover services",
            OperationKind::ReadCharacteristic => "read characteristic",
            OperationKind::WriteCharacteristic => "write characteristic",
            OperationKind::ReadDescriptor => "read descriptor",
            OperationKind::WriteDescriptor => "write descriptor",
            OperationKind::Subscribe => "subscribe",
            OperationKind::Unsubscribe => "unsubscribe",
            OperationKind::RequestMtu => "request mtu",
            OperationKind::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

pub trait Operation: Send + 'static {
    type Output: Send + 'static;

    fn kind(&self) -> OperationKind;

    /// Issues the request and drives it to its terminal event. The returned
    /// future may be dropped at any await point if the caller goes away.
    fn execute(self, emitter: Emitter<Self::Output>) -> BoxFuture<'static, ()>;
}

/// The sending half of one operation's result stream.
#[derive(Debug)]
pub struct Emitter<T> {
    id: OperationId,
    kind: OperationKind,
    tx: mpsc::UnboundedSender<Result<T>>,
}

impl<T> Emitter<T> {
    pub(crate) fn new(
        id: OperationId,
        kind: OperationKind,
        tx: mpsc::UnboundedSender<Result<T>>,
    ) -> Self {
        Emitter { id, kind, tx }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Emits one value. Returns `false` once the caller has gone away.
    pub fn next(&self, value: T) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    pub fn error(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    /// Emits the only value of a single-result operation, or its failure.
    pub fn finish(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the caller has dropped the result stream.
    pub async fn cancelled(&self) {
        self.tx.closed().await
    }
}

/// Maps a refused request to the error its caller sees.
pub(crate) fn refused(verb: OperationKind, error: TransportError) -> Error {
    match error {
        TransportError::PermissionDenied { missing } => Error::PermissionsNotGranted {
            missing: if missing.is_empty() {
                vec![Permission::BluetoothConnect]
            } else {
                missing
            },
        },
        TransportError::AdapterUnavailable => Error::AdapterOff,
        TransportError::Rejected | TransportError::Other { .. } => Error::gatt(verb),
    }
}
