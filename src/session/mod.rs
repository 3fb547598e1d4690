//! One physical link: the driver handle, its connection state, and the hub
//! that turns the driver's callbacks into streams operations can wait on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gatt::{Service, Services};
use crate::ops::OperationKind;
use crate::result::{Error, Result};
use crate::transport::{is_success, Link, LinkState};
use crate::util::CompositeId;
use crate::Address;

pub(crate) use hub::{EventHub, EventSubscription};

mod hub;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Whether the link may move from `self` to `next`. `Disconnected` only
    /// leads anywhere before a link has been opened.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Connected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

impl From<LinkState> for ConnectionState {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Connecting => ConnectionState::Connecting,
            LinkState::Connected => ConnectionState::Connected,
            LinkState::Disconnecting => ConnectionState::Disconnecting,
            LinkState::Disconnected => ConnectionState::Disconnected,
        }
    }
}

type TeardownHook = Box<dyn FnOnce(Address) + Send>;

/// Owns the link to one device for as long as it lives.
///
/// The link is released exactly once, on the first terminal disconnection
/// (or an explicit [`teardown`](Session::teardown)), after which the owner is
/// told through the teardown hook so it can forget about this session.
pub struct Session {
    address: Address,
    hub: Arc<EventHub>,
    link: Mutex<Option<Arc<dyn Link>>>,
    torn_down: AtomicBool,
    on_teardown: Mutex<Option<TeardownHook>>,
    // dropping this stops the watcher task
    _alive: oneshot::Sender<()>,
}

impl Session {
    /// Creates a session with no link yet and starts watching for its end on
    /// `runtime`.
    pub(crate) fn new(address: Address, runtime: &Handle) -> Arc<Self> {
        let (alive, dropped) = oneshot::channel();
        let session = Arc::new(Session {
            address,
            hub: Arc::new(EventHub::new(address)),
            link: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            on_teardown: Mutex::new(None),
            _alive: alive,
        });

        let disconnection = session.hub.disconnection();
        let weak = Arc::downgrade(&session);
        runtime.spawn(async move {
            tokio::select! {
                error = disconnection.wait() => {
                    if let Some(session) = weak.upgrade() {
                        debug!(address = %session.address, %error, "tearing session down");
                        session.teardown();
                    }
                }
                _ = dropped => {}
            }
        });

        session
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// The sink the driver reports this link's events to.
    pub fn callback(&self) -> GattCallback {
        GattCallback {
            address: self.address,
            hub: self.hub.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.hub.state()
    }

    /// Current state now, and every change after.
    pub fn observe_state(&self) -> watch::Receiver<ConnectionState> {
        self.hub.observe_state()
    }

    pub fn is_terminated(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst) || self.hub.terminal_error().is_some()
    }

    pub(crate) fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub(crate) fn set_teardown_hook<F>(&self, hook: F)
    where
        F: FnOnce(Address) + Send + 'static,
    {
        if let Ok(mut slot) = self.on_teardown.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Takes ownership of a freshly opened link. A session that has already
    /// ended closes the link straight away instead.
    pub(crate) fn bind(&self, link: Box<dyn Link>) -> Result<Arc<dyn Link>> {
        let link: Arc<dyn Link> = Arc::from(link);

        let mut slot = self.lock_link();
        if self.torn_down.load(Ordering::SeqCst) {
            drop(slot);
            link.close();
            return Err(self.ended());
        }

        if let Some(previous) = slot.replace(link.clone()) {
            warn!(address = %self.address, "replacing a live link");
            previous.close();
        }

        Ok(link)
    }

    /// The live link, or the error that ended it.
    pub(crate) fn link(&self) -> Result<Arc<dyn Link>> {
        match self.lock_link().as_ref() {
            Some(link) => Ok(link.clone()),
            None => Err(self.ended()),
        }
    }

    /// Releases the link and notifies the owner. Only the first call has any
    /// effect.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let link = self.lock_link().take();
        if let Some(link) = link {
            link.close();
        }

        info!(address = %self.address, "session closed");

        let hook = self.on_teardown.lock().ok().and_then(|mut hook| hook.take());
        if let Some(hook) = hook {
            hook(self.address);
        }
    }

    fn ended(&self) -> Error {
        self.hub
            .terminal_error()
            .unwrap_or(Error::NotConnected {
                address: self.address,
            })
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Link>>> {
        match self.link.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let link = match self.link.get_mut() {
            Ok(link) => link.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(link) = link {
            link.close();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Handed to the driver when a link is opened; the driver reports every
/// event of that link here. Each method only publishes and returns.
#[derive(Debug, Clone)]
pub struct GattCallback {
    address: Address,
    hub: Arc<EventHub>,
}

impl GattCallback {
    pub fn on_connection_state_changed(&self, status: u16, state: LinkState) {
        let state = ConnectionState::from(state);
        debug!(address = %self.address, status, ?state, "connection state callback");

        if is_success(status) {
            self.hub.publish_state(state);
            if state == ConnectionState::Disconnected {
                self.hub.publish_disconnection(Error::Disconnected {
                    address: self.address,
                    status,
                });
            }
        } else {
            self.hub.publish_state(ConnectionState::Disconnected);
            self.hub.publish_disconnection(Error::GattDisconnected {
                address: self.address,
                status,
            });
        }
    }

    pub fn on_services_discovered(&self, status: u16, services: Vec<Service>) {
        if is_success(status) {
            self.hub.publish_services(Services::new(services));
        } else {
            self.hub
                .publish_error(Error::gatt_status(OperationKind::DiscoverServices, status));
        }
    }

    /// The peripheral changed its attribute table; republished as a fresh
    /// discovery result.
    pub fn on_service_changed(&self, services: Vec<Service>) {
        self.hub.publish_services(Services::new(services));
    }

    pub fn on_characteristic_read(&self, status: u16, characteristic: CompositeId, value: impl Into<Bytes>) {
        if is_success(status) {
            self.hub
                .publish_characteristic_read((characteristic, value.into()));
        } else {
            self.hub
                .publish_error(Error::gatt_status(OperationKind::ReadCharacteristic, status));
        }
    }

    pub fn on_characteristic_write(&self, status: u16, characteristic: CompositeId, value: impl Into<Bytes>) {
        if is_success(status) {
            self.hub
                .publish_characteristic_write((characteristic, value.into()));
        } else {
            self.hub
                .publish_error(Error::gatt_status(OperationKind::WriteCharacteristic, status));
        }
    }

    pub fn on_characteristic_changed(&self, characteristic: CompositeId, value: impl Into<Bytes>) {
        self.hub
            .publish_characteristic_changed((characteristic, value.into()));
    }

    pub fn on_descriptor_read(&self, status: u16, descriptor: Uuid, value: impl Into<Bytes>) {
        if is_success(status) {
            self.hub.publish_descriptor_read((descriptor, value.into()));
        } else {
            self.hub
                .publish_error(Error::gatt_status(OperationKind::ReadDescriptor, status));
        }
    }

    pub fn on_descriptor_write(&self, status: u16, descriptor: Uuid, value: impl Into<Bytes>) {
        if is_success(status) {
            self.hub.publish_descriptor_write((descriptor, value.into()));
        } else {
            self.hub
                .publish_error(Error::gatt_status(OperationKind::WriteDescriptor, status));
        }
    }

    pub fn on_mtu_changed(&self, status: u16, mtu: u16) {
        if is_success(status) {
            self.hub.publish_mtu(mtu);
        } else {
            self.hub
                .publish_error(Error::gatt_status(OperationKind::RequestMtu, status));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::transport::fake::{FakeLink, LinkCall};
    use crate::util::uuid_from_u16;

    fn address() -> Address {
        Address::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01])
    }

    #[tokio::test]
    pub async fn state_follows_callbacks() {
        let session = Session::new(address(), &Handle::current());
        let callback = session.callback();
        let mut states = session.observe_state();

        callback.on_connection_state_changed(0, LinkState::Connecting);
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);
        callback.on_connection_state_changed(0, LinkState::Connected);
        assert_eq!(session.state(), ConnectionState::Connected);

        // a late observer sees the current value right away
        assert_eq!(*session.observe_state().borrow(), ConnectionState::Connected);
        assert!(!session.is_terminated());
    }

    #[tokio::test]
    pub async fn error_status_ends_the_link() {
        let session = Session::new(address(), &Handle::current());
        let callback = session.callback();
        let disconnection = session.hub().disconnection();

        callback.on_connection_state_changed(0, LinkState::Connected);
        callback.on_connection_state_changed(133, LinkState::Connected);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            disconnection.wait().await,
            Error::GattDisconnected {
                address: address(),
                status: 133
            }
        );

        // nothing leaves Disconnected
        callback.on_connection_state_changed(0, LinkState::Connected);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    pub async fn disconnecting_is_not_terminal() {
        let session = Session::new(address(), &Handle::current());
        let callback = session.callback();

        callback.on_connection_state_changed(0, LinkState::Connected);
        callback.on_connection_state_changed(0, LinkState::Disconnecting);
        assert!(!session.is_terminated());

        callback.on_connection_state_changed(0, LinkState::Disconnected);
        assert!(session.is_terminated());
        assert_eq!(
            session.hub().terminal_error(),
            Some(Error::Disconnected {
                address: address(),
                status: 0
            })
        );
    }

    #[tokio::test]
    pub async fn waiting_read_fails_on_link_loss() {
        let session = Session::new(address(), &Handle::current());
        let callback = session.callback();
        let mut reads = session.hub().characteristic_read();

        let waiter = tokio::spawn(async move { reads.recv().await });
        tokio::task::yield_now().await;
        callback.on_connection_state_changed(8, LinkState::Disconnected);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            result,
            Err(Error::GattDisconnected {
                address: address(),
                status: 8
            })
        );
    }

    #[tokio::test]
    pub async fn late_subscribers_fail_immediately() {
        let session = Session::new(address(), &Handle::current());
        session
            .callback()
            .on_connection_state_changed(0, LinkState::Disconnected);

        let mut writes = session.hub().descriptor_write();
        assert!(writes.recv().await.unwrap_err().is_disconnection());
        // and keeps failing
        assert!(writes.recv().await.unwrap_err().is_disconnection());
    }

    #[tokio::test]
    pub async fn gatt_errors_fail_request_streams_only() {
        let session = Session::new(address(), &Handle::current());
        let callback = session.callback();
        let mut reads = session.hub().characteristic_read();
        let mut notifications = session.hub().characteristic_changed();
        let id = CompositeId::new(uuid_from_u16(0x2a37), 1);

        callback.on_characteristic_read(0x02, id, vec![]);
        callback.on_characteristic_changed(id, vec![1, 2]);

        assert_eq!(
            reads.recv().await,
            Err(Error::gatt_status(OperationKind::ReadCharacteristic, 0x02))
        );
        assert_eq!(notifications.recv().await, Ok((id, Bytes::from_static(&[1, 2]))));
    }

    #[tokio::test]
    pub async fn teardown_runs_once() {
        let session = Session::new(address(), &Handle::current());
        let (link, calls) = FakeLink::detached(address());
        session.bind(Box::new(link)).unwrap();

        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();
        session.set_teardown_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session
            .callback()
            .on_connection_state_changed(0, LinkState::Disconnected);
        // the watcher task tears down; an explicit call races it harmlessly
        tokio::task::yield_now().await;
        session.teardown();
        session.teardown();

        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert_eq!(
            calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == LinkCall::Close)
                .count(),
            1
        );
        assert!(session.link().err().unwrap().is_disconnection());
    }

    #[tokio::test]
    pub async fn binding_after_teardown_closes_the_link() {
        let session = Session::new(address(), &Handle::current());
        session.teardown();

        let (link, calls) = FakeLink::detached(address());
        assert_eq!(
            session.bind(Box::new(link)).err(),
            Some(Error::NotConnected { address: address() })
        );
        assert_eq!(*calls.lock().unwrap(), vec![LinkCall::Close]);
    }
}
