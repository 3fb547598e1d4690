use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::gatt::Services;
use crate::ops::{refused, Emitter, Operation, OperationKind};
use crate::result::Result;
use crate::session::Session;

pub(crate) struct Discover {
    session: Arc<Session>,
}

impl Discover {
    pub fn new(session: Arc<Session>) -> Self {
        Discover { session }
    }

    pub async fn run(&self) -> Result<Services> {
        let mut discovered = self.session.hub().services_discovered();

        self.session
            .link()?
            .discover_services()
            .map_err(|error| refused(OperationKind::DiscoverServices, error))?;

        discovered.recv().await
    }
}

impl Operation for Discover {
    type Output = Services;

    fn kind(&self) -> OperationKind {
        OperationKind::DiscoverServices
    }

    fn execute(self, emitter: Emitter<Services>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}
