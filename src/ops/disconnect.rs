use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::ops::{refused, Emitter, Operation, OperationKind};
use crate::result::Result;
use crate::session::Session;
use crate::transport::{LinkState, Transport, TransportError};

/// Ends the link of a session. The session is torn down however this ends,
/// including when the operation is cancelled.
pub(crate) struct Disconnect {
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
}

struct Teardown(Arc<Session>);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

impl Disconnect {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<Session>) -> Self {
        Disconnect { transport, session }
    }

    async fn run(&self) -> Result<()> {
        let _teardown = Teardown(self.session.clone());
        let address = self.session.address();

        // ask the driver, not our cached state
        match self.transport.connection_state(address) {
            Ok(LinkState::Disconnected) => {
                debug!(%address, "already disconnected");
                return Ok(());
            }
            Ok(_) => {}
            Err(error @ TransportError::PermissionDenied { .. }) => {
                return Err(refused(OperationKind::Disconnect, error));
            }
            Err(error) => warn!(%address, %error, "could not query connection state"),
        }

        let disconnection = self.session.hub().disconnection();
        let link = match self.session.link() {
            Ok(link) => link,
            Err(_) => return Ok(()),
        };

        link.disconnect()
            .map_err(|error| refused(OperationKind::Disconnect, error))?;

        let reason = disconnection.wait().await;
        debug!(%address, %reason, "disconnected");
        if reason.is_disconnection() {
            Ok(())
        } else {
            Err(reason)
        }
    }
}

impl Operation for Disconnect {
    type Output = ();

    fn kind(&self) -> OperationKind {
        OperationKind::Disconnect
    }

    fn execute(self, emitter: Emitter<()>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}
