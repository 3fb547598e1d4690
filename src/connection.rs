//! An established connection: a connected session, its attribute table and a
//! queue of its own, so that requests to different devices never wait on
//! each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::gatt::{Characteristic, Descriptor, Services, MIN_MTU, MTU_ATT_OVERHEAD};
use crate::ops::descriptor::{ReadDescriptor, WriteDescriptor};
use crate::ops::discover::Discover;
use crate::ops::mtu::RequestMtu;
use crate::ops::read::ReadCharacteristic;
use crate::ops::subscribe::{Subscribe, Unsubscribe};
use crate::ops::write::WriteCharacteristic;
use crate::ops::{Notifications, OperationKind, OperationQueue};
use crate::result::{Error, Result};
use crate::session::{ConnectionState, EventSubscription, Session};
use crate::util::CompositeId;
use crate::Address;

type Registration = Arc<OnceCell<Notifications>>;

struct ConnectionInner {
    session: Arc<Session>,
    queue: OperationQueue,
    services: RwLock<Arc<Services>>,
    mtu: AtomicU16,
    subscriptions: Mutex<HashMap<CompositeId, Registration>>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        session: Arc<Session>,
        services: Services,
        queue_capacity: usize,
        runtime: &Handle,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            queue: OperationQueue::new(queue_capacity, runtime),
            services: RwLock::new(Arc::new(services)),
            mtu: AtomicU16::new(MIN_MTU),
            subscriptions: Mutex::new(HashMap::new()),
            session,
        });

        let changes = inner.session.hub().service_changes();
        runtime.spawn(follow_service_changes(Arc::downgrade(&inner), changes));

        Connection { inner }
    }

    pub fn address(&self) -> Address {
        self.inner.session.address()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    pub fn observe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.session.observe_state()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.session.is_terminated() && self.state() == ConnectionState::Connected
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// The attribute table as of the last discovery.
    pub fn services(&self) -> Arc<Services> {
        match self.inner.services.read() {
            Ok(services) => services.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Looks a characteristic up by UUID in any service.
    pub fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.services().characteristic(uuid).cloned()
    }

    pub async fn discover_services(&self) -> Result<Arc<Services>> {
        let services = self
            .inner
            .queue
            .schedule(Discover::new(self.inner.session.clone()))
            .single()
            .await?;

        let services = Arc::new(services);
        self.inner.store_services(services.clone());
        Ok(services)
    }

    pub async fn read(&self, characteristic: &Characteristic) -> Result<Bytes> {
        require(characteristic.is_readable(), OperationKind::ReadCharacteristic)?;

        self.inner
            .queue
            .schedule(ReadCharacteristic::new(
                self.inner.session.clone(),
                characteristic.clone(),
            ))
            .single()
            .await
    }

    /// Writes `value` and returns the value the peripheral acknowledged.
    pub async fn write(&self, characteristic: &Characteristic, value: impl Into<Bytes>) -> Result<Bytes> {
        require(characteristic.is_writable(), OperationKind::WriteCharacteristic)?;

        self.inner
            .queue
            .schedule(WriteCharacteristic::new(
                self.inner.session.clone(),
                characteristic.clone(),
                value.into(),
            ))
            .single()
            .await
    }

    /// Enables notifications for `characteristic`. Only the first call for a
    /// characteristic talks to the peripheral; every later one, concurrent
    /// or not, gets the same [`Notifications`].
    pub async fn subscribe(&self, characteristic: &Characteristic) -> Result<Notifications> {
        require(characteristic.is_notifiable(), OperationKind::Subscribe)?;

        let key = characteristic.id();
        let registration = self.inner.registration(key);

        let notifications = registration
            .get_or_try_init(|| async {
                debug!(address = %self.address(), characteristic = %key, "subscribing");
                self.inner
                    .queue
                    .schedule(Subscribe::new(
                        self.inner.session.clone(),
                        characteristic.clone(),
                    ))
                    .single()
                    .await
            })
            .await?;

        Ok(notifications.clone())
    }

    /// Disables notifications for `characteristic` and forgets its
    /// registration.
    pub async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<()> {
        require(characteristic.is_notifiable(), OperationKind::Unsubscribe)?;

        self.inner.forget(characteristic.id());
        self.inner
            .queue
            .schedule(Unsubscribe::new(
                self.inner.session.clone(),
                characteristic.clone(),
            ))
            .single()
            .await
    }

    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Bytes> {
        self.inner
            .queue
            .schedule(ReadDescriptor::new(
                self.inner.session.clone(),
                descriptor.clone(),
            ))
            .single()
            .await
    }

    pub async fn write_descriptor(&self, descriptor: &Descriptor, value: impl Into<Bytes>) -> Result<Bytes> {
        self.inner
            .queue
            .schedule(WriteDescriptor::new(
                self.inner.session.clone(),
                descriptor.clone(),
                value.into(),
            ))
            .single()
            .await
    }

    /// Negotiates the ATT MTU and returns the value the link settled on.
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        let granted = self
            .inner
            .queue
            .schedule(RequestMtu::new(self.inner.session.clone(), mtu))
            .single()
            .await?;

        self.inner.mtu.store(granted.max(MIN_MTU), Ordering::SeqCst);
        Ok(granted)
    }

    pub fn mtu(&self) -> u16 {
        self.inner.mtu.load(Ordering::SeqCst)
    }

    /// Largest value that fits in a single write with the current MTU.
    pub fn max_write_payload(&self) -> usize {
        (self.mtu() - MTU_ATT_OVERHEAD) as usize
    }
}

impl ConnectionInner {
    fn store_services(&self, services: Arc<Services>) {
        match self.services.write() {
            Ok(mut current) => *current = services,
            Err(poisoned) => *poisoned.into_inner() = services,
        }
    }

    fn registration(&self, key: CompositeId) -> Registration {
        let mut subscriptions = match self.subscriptions.lock() {
            Ok(subscriptions) => subscriptions,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscriptions.entry(key).or_default().clone()
    }

    fn forget(&self, key: CompositeId) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.remove(&key);
        }
    }
}

fn require(supported: bool, verb: OperationKind) -> Result<()> {
    if supported {
        Ok(())
    } else {
        Err(Error::gatt(verb))
    }
}

/// Keeps the attribute table current when the peripheral reports a change.
async fn follow_service_changes(
    inner: Weak<ConnectionInner>,
    mut changes: EventSubscription<Services>,
) {
    while let Ok(services) = changes.recv().await {
        match inner.upgrade() {
            Some(inner) => {
                trace!(address = %inner.session.address(), services = services.len(), "attribute table updated");
                inner.store_services(Arc::new(services));
            }
            None => return,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("mtu", &self.mtu())
            .finish()
    }
}
