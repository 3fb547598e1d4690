use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tracing::{debug, warn};

use crate::gatt::{
    Characteristic, CharacteristicProperty, CLIENT_CHARACTERISTIC_CONFIG_UUID,
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::ops::{descriptor, refused, Emitter, Operation, OperationKind};
use crate::result::Result;
use crate::session::Session;
use crate::util::CompositeId;

/// Turns on notifications (or indications, for characteristics that only
/// indicate) and yields the handle they arrive through.
pub(crate) struct Subscribe {
    session: Arc<Session>,
    characteristic: Characteristic,
}

impl Subscribe {
    pub fn new(session: Arc<Session>, characteristic: Characteristic) -> Self {
        Subscribe {
            session,
            characteristic,
        }
    }

    async fn run(&self) -> Result<Notifications> {
        let cccd = self
            .characteristic
            .descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID)?;
        let link = self.session.link()?;

        link.set_characteristic_notification(&self.characteristic, true)
            .map_err(|error| refused(OperationKind::Subscribe, error))?;

        let value = if self
            .characteristic
            .properties
            .contains(CharacteristicProperty::Notify)
        {
            ENABLE_NOTIFICATION_VALUE
        } else {
            ENABLE_INDICATION_VALUE
        };
        if let Err(error) = descriptor::write(&self.session, link.as_ref(), cccd, &value).await {
            // undo the local enable
            if let Err(disable) = link.set_characteristic_notification(&self.characteristic, false) {
                warn!(
                    address = %self.session.address(),
                    characteristic = %self.characteristic.id(),
                    error = %disable,
                    "could not disable local notifications"
                );
            }
            return Err(error);
        }

        debug!(
            address = %self.session.address(),
            characteristic = %self.characteristic.id(),
            "notifications enabled"
        );
        Ok(Notifications::new(
            self.session.clone(),
            self.characteristic.id(),
        ))
    }
}

impl Operation for Subscribe {
    type Output = Notifications;

    fn kind(&self) -> OperationKind {
        OperationKind::Subscribe
    }

    fn execute(self, emitter: Emitter<Notifications>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}

pub(crate) struct Unsubscribe {
    session: Arc<Session>,
    characteristic: Characteristic,
}

impl Unsubscribe {
    pub fn new(session: Arc<Session>, characteristic: Characteristic) -> Self {
        Unsubscribe {
            session,
            characteristic,
        }
    }

    async fn run(&self) -> Result<()> {
        let cccd = self
            .characteristic
            .descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID)?;
        let link = self.session.link()?;

        link.set_characteristic_notification(&self.characteristic, false)
            .map_err(|error| refused(OperationKind::Unsubscribe, error))?;
        descriptor::write(&self.session, link.as_ref(), cccd, &DISABLE_NOTIFICATION_VALUE).await?;

        debug!(
            address = %self.session.address(),
            characteristic = %self.characteristic.id(),
            "notifications disabled"
        );
        Ok(())
    }
}

impl Operation for Unsubscribe {
    type Output = ();

    fn kind(&self) -> OperationKind {
        OperationKind::Unsubscribe
    }

    fn execute(self, emitter: Emitter<()>) -> BoxFuture<'static, ()> {
        async move { emitter.finish(self.run().await) }.boxed()
    }
}

struct Source {
    characteristic: CompositeId,
    session: Arc<Session>,
}

/// Where the notifications of one characteristic arrive. Clones share the
/// same source.
#[derive(Clone)]
pub struct Notifications {
    source: Arc<Source>,
}

impl Notifications {
    fn new(session: Arc<Session>, characteristic: CompositeId) -> Self {
        Notifications {
            source: Arc::new(Source {
                characteristic,
                session,
            }),
        }
    }

    pub fn characteristic(&self) -> CompositeId {
        self.source.characteristic
    }

    /// Payloads received from now on. The stream fails when the link is lost
    /// and ends after that.
    pub fn stream(&self) -> BoxStream<'static, Result<Bytes>> {
        let key = self.source.characteristic;
        let changes = self.source.session.hub().characteristic_changed();

        futures::stream::unfold(Some(changes), move |changes| async move {
            let mut changes = changes?;
            match changes.recv_matching(|(id, _)| *id == key).await {
                Ok((_, value)) => Some((Ok(value), Some(changes))),
                Err(error) => Some((Err(error), None)),
            }
        })
        .boxed()
    }
}

impl PartialEq for Notifications {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
    }
}

impl Eq for Notifications {}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications")
            .field("address", &self.source.session.address())
            .field("characteristic", &self.source.characteristic)
            .finish()
    }
}
