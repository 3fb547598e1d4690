use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::ops::{refused, Emitter, Operation, OperationKind};
use crate::result::Result;
use crate::session::Session;

/// Asks for a larger ATT MTU; yields the MTU the link settled on, which may
/// be smaller than requested.
pub(crate) struct RequestMtu {
    session: Arc<Session>,
    mtu: u16,
}

impl RequestMtu {
    pub fn new(session: Arc<Session>, mtu: u16) -> Self {
        RequestMtu { session, mtu }
    }

    async fn run(&self) -> Result<u16> {
        let mut changes = self.session.hub().mtu_changed();

        self.session
            .link()?
            .request_mtu(self.mtu)
            .map_err(|error| refused(OperationKind::RequestMtu, error))?;

        changes.recv().await
    }
}

impl Operation for RequestMtu {
    type Output = u16;

    fn kind(&self) -> OperationKind {
        OperationKind::RequestMtu
    }

    fn execute(self, emitter: Emitter<u16>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}
