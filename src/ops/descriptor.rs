use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::gatt::Descriptor;
use crate::ops::{refused, Emitter, Operation, OperationKind};
use crate::result::Result;
use crate::session::Session;
use crate::transport::Link;

pub(crate) struct ReadDescriptor {
    session: Arc<Session>,
    descriptor: Descriptor,
}

impl ReadDescriptor {
    pub fn new(session: Arc<Session>, descriptor: Descriptor) -> Self {
        ReadDescriptor {
            session,
            descriptor,
        }
    }

    async fn run(&self) -> Result<Bytes> {
        let uuid = self.descriptor.uuid;
        let mut reads = self.session.hub().descriptor_read();

        self.session
            .link()?
            .read_descriptor(&self.descriptor)
            .map_err(|error| refused(OperationKind::ReadDescriptor, error))?;

        let (_, value) = reads.recv_matching(|(key, _)| *key == uuid).await?;
        Ok(value)
    }
}

impl Operation for ReadDescriptor {
    type Output = Bytes;

    fn kind(&self) -> OperationKind {
        OperationKind::ReadDescriptor
    }

    fn execute(self, emitter: Emitter<Bytes>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}

pub(crate) struct WriteDescriptor {
    session: Arc<Session>,
    descriptor: Descriptor,
    value: Bytes,
}

impl WriteDescriptor {
    pub fn new(session: Arc<Session>, descriptor: Descriptor, value: Bytes) -> Self {
        WriteDescriptor {
            session,
            descriptor,
            value,
        }
    }
}

impl Operation for WriteDescriptor {
    type Output = Bytes;

    fn kind(&self) -> OperationKind {
        OperationKind::WriteDescriptor
    }

    fn execute(self, emitter: Emitter<Bytes>) -> BoxFuture<'static, ()> {
        async move {
            let result = match self.session.link() {
                Ok(link) => write(&self.session, link.as_ref(), &self.descriptor, &self.value).await,
                Err(error) => Err(error),
            };
            emitter.finish(result)
        }
        .boxed()
    }
}

/// Writes `value` to `descriptor` over `link` and waits for the write to be
/// confirmed.
pub(crate) async fn write(
    session: &Session,
    link: &dyn Link,
    descriptor: &Descriptor,
    value: &[u8],
) -> Result<Bytes> {
    let uuid = descriptor.uuid;
    let mut writes = session.hub().descriptor_write();

    link.write_descriptor(descriptor, value)
        .map_err(|error| refused(OperationKind::WriteDescriptor, error))?;

    let (_, echo) = writes.recv_matching(|(key, _)| *key == uuid).await?;
    Ok(echo)
}
