use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tracing::debug;

use crate::client::ClientInner;
use crate::connection::Connection;
use crate::connector;
use crate::ops::disconnect::Disconnect;
use crate::result::{Error, Result};
use crate::session::{ConnectionState, Session};
use crate::Address;

struct DeviceInner {
    address: Address,
    name: Mutex<Option<String>>,
    client: Weak<ClientInner>,
    session: Mutex<Arc<Session>>,
}

/// A peripheral known to a [`Client`](crate::Client). Two handles are equal
/// when they refer to the same address.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Device {
    pub(crate) fn new(address: Address, client: &Arc<ClientInner>) -> Self {
        Device {
            inner: Arc::new(DeviceInner {
                address,
                name: Mutex::new(None),
                client: Arc::downgrade(client),
                session: Mutex::new(client.open_session(address)),
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    /// The name last seen in an advertisement or looked up, if any.
    pub fn name(&self) -> Option<String> {
        lock(&self.inner.name).clone()
    }

    /// Asks the driver for the device name and remembers it.
    pub fn lookup_name(&self) -> Result<Option<String>> {
        let client = self.client()?;
        let name = client.transport.device_name(self.address())?;

        if name.is_some() {
            self.learn_name(name.clone());
        }
        Ok(name.or_else(|| self.name()))
    }

    pub(crate) fn learn_name(&self, name: Option<String>) {
        if let Some(name) = name {
            *lock(&self.inner.name) = Some(name);
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session().state()
    }

    /// Follows the state of the current link to this device.
    pub fn observe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.session().observe_state()
    }

    /// The session of this device. A handle whose session has ended picks up
    /// the live session another handle for the same address opened.
    pub(crate) fn session(&self) -> Arc<Session> {
        let current = self.current_session();
        if !current.is_terminated() {
            return current;
        }

        let shared = self
            .inner
            .client
            .upgrade()
            .and_then(|client| client.live_session(self.address()));
        match shared {
            Some(shared) => {
                self.adopt(shared.clone());
                shared
            }
            None => current,
        }
    }

    pub(crate) fn current_session(&self) -> Arc<Session> {
        lock(&self.inner.session).clone()
    }

    pub(crate) fn adopt(&self, session: Arc<Session>) {
        *lock(&self.inner.session) = session;
    }

    /// The current session if it is still usable, otherwise a new one.
    pub(crate) fn current_or_open(&self, client: &Arc<ClientInner>) -> Arc<Session> {
        let mut current = lock(&self.inner.session);
        if current.is_terminated() {
            debug!(address = %self.address(), "opening a new session");
            *current = client.open_session(self.address());
        }
        current.clone()
    }

    /// Whether both handles share the same state, not just the address.
    pub(crate) fn is_same(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connects and discovers services, or returns the existing connection
    /// if the device is still connected. Concurrent calls share one link.
    ///
    /// Fails with [`Error::Timeout`] if this takes longer than the
    /// configured connect timeout, waiting for other connects included.
    pub async fn connect(&self) -> Result<Connection> {
        let client = self.client()?;
        let timeout = client.config.connect_timeout;

        match tokio::time::timeout(timeout, self.connect_exclusive(&client)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                address: self.address(),
                timeout,
            }),
        }
    }

    async fn connect_exclusive(&self, client: &Arc<ClientInner>) -> Result<Connection> {
        let _connecting = client.connecting.lock().await;
        if let Some(connection) = client.live_connection(self.address()) {
            debug!(address = %self.address(), "reusing connection");
            return Ok(connection);
        }

        let connection = connector::establish(client, self).await?;
        client.store_connection(connection.clone());
        Ok(connection)
    }

    /// Disconnects and releases the link. Succeeds if the device was not
    /// connected in the first place.
    pub async fn disconnect(&self) -> Result<()> {
        let client = self.client()?;
        client.forget_connection(self.address());

        client
            .queue
            .schedule(Disconnect::new(client.transport.clone(), self.session()))
            .single()
            .await
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        self.inner.client.upgrade().ok_or(Error::QueueClosed)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address())
            .field("name", &self.name())
            .finish()
    }
}
