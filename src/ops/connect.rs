use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::debug;

use crate::gatt::Services;
use crate::ops::discover::Discover;
use crate::ops::{refused, Emitter, Operation, OperationKind};
use crate::result::{Error, Result};
use crate::session::{ConnectionState, Session};
use crate::transport::{Transport, TransportError};

/// Opens the link of a session and waits until it is connected.
pub(crate) struct Connect {
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    auto_connect: bool,
}

impl Connect {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<Session>, auto_connect: bool) -> Self {
        Connect {
            transport,
            session,
            auto_connect,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let address = self.session.address();

        let mut states = self.session.observe_state();
        let disconnection = self.session.hub().disconnection();

        let link = self
            .transport
            .connect(address, self.auto_connect, self.session.callback())
            .map_err(|error| match error {
                TransportError::PermissionDenied { .. } | TransportError::AdapterUnavailable => {
                    refused(OperationKind::Connect, error)
                }
                other => Error::ConnectionFailed {
                    address,
                    reason: other.to_string(),
                },
            })?;
        self.session.bind(link)?;
        debug!(%address, "link opened");

        tokio::select! {
            biased;

            error = disconnection.wait() => Err(error),
            connected = connected(&mut states) => {
                if connected {
                    debug!(%address, "connected");
                    Ok(())
                } else {
                    Err(Error::NotConnected { address })
                }
            }
        }
    }
}

async fn connected(states: &mut watch::Receiver<ConnectionState>) -> bool {
    loop {
        if *states.borrow_and_update() == ConnectionState::Connected {
            return true;
        }
        if states.changed().await.is_err() {
            return false;
        }
    }
}

impl Operation for Connect {
    type Output = ();

    fn kind(&self) -> OperationKind {
        OperationKind::Connect
    }

    fn execute(self, emitter: Emitter<()>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}

/// Connect followed by service discovery as one job, so nothing else on the
/// queue runs in between.
pub(crate) struct Establish {
    connect: Connect,
    discover: Discover,
}

impl Establish {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<Session>, auto_connect: bool) -> Self {
        Establish {
            discover: Discover::new(session.clone()),
            connect: Connect::new(transport, session, auto_connect),
        }
    }
}

impl Operation for Establish {
    type Output = Services;

    fn kind(&self) -> OperationKind {
        OperationKind::Connect
    }

    fn execute(self, emitter: Emitter<Services>) -> BoxFuture<'static, ()> {
        async move {
            let result = match self.connect.run().await {
                Ok(()) => self.discover.run().await,
                Err(error) => Err(error),
            };
            emitter.finish(result)
        }
        .boxed()
    }
}
