use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::gatt::Characteristic;
use crate::ops::{refused, Emitter, Operation, OperationKind};
use crate::result::Result;
use crate::session::Session;

/// Writes a characteristic value and yields the value the driver echoes
/// back once the peripheral has acknowledged it.
pub(crate) struct WriteCharacteristic {
    session: Arc<Session>,
    characteristic: Characteristic,
    value: Bytes,
}

impl WriteCharacteristic {
    pub fn new(session: Arc<Session>, characteristic: Characteristic, value: Bytes) -> Self {
        WriteCharacteristic {
            session,
            characteristic,
            value,
        }
    }

    async fn run(&self) -> Result<Bytes> {
        let id = self.characteristic.id();
        let mut writes = self.session.hub().characteristic_write();

        self.session
            .link()?
            .write_characteristic(&self.characteristic, &self.value)
            .map_err(|error| refused(OperationKind::WriteCharacteristic, error))?;

        let (_, echo) = writes.recv_matching(|(key, _)| *key == id).await?;
        Ok(echo)
    }
}

impl Operation for WriteCharacteristic {
    type Output = Bytes;

    fn kind(&self) -> OperationKind {
        OperationKind::WriteCharacteristic
    }

    fn execute(self, emitter: Emitter<Bytes>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}
