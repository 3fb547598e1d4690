use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::gatt::Characteristic;
use crate::ops::{refused, Emitter, Operation, OperationKind};
use crate::result::Result;
use crate::session::Session;

pub(crate) struct ReadCharacteristic {
    session: Arc<Session>,
    characteristic: Characteristic,
}

impl ReadCharacteristic {
    pub fn new(session: Arc<Session>, characteristic: Characteristic) -> Self {
        ReadCharacteristic {
            session,
            characteristic,
        }
    }

    async fn run(&self) -> Result<Bytes> {
        let id = self.characteristic.id();
        let mut reads = self.session.hub().characteristic_read();

        self.session
            .link()?
            .read_characteristic(&self.characteristic)
            .map_err(|error| refused(OperationKind::ReadCharacteristic, error))?;

        let (_, value) = reads.recv_matching(|(key, _)| *key == id).await?;
        Ok(value)
    }
}

impl Operation for ReadCharacteristic {
    type Output = Bytes;

    fn kind(&self) -> OperationKind {
        OperationKind::ReadCharacteristic
    }

    fn execute(self, emitter: Emitter<Bytes>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}
