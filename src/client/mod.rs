use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info};

pub use readiness::{scan_permissions, NotReadyReason, Readiness};
use readiness::check;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::device::Device;
use crate::ops::OperationQueue;
use crate::result::{Error, Result};
use crate::session::Session;
use crate::transport::{LinkState, Transport};
use crate::Address;

mod discovery;
mod readiness;

/// Entry point: discovers devices, hands out [`Device`] handles and tracks
/// whether Bluetooth is usable at all.
///
/// Connecting and disconnecting run on one queue shared by all devices of a
/// client; requests on an established [`Connection`](crate::Connection) run
/// on that connection's own queue.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: ClientConfig,
    pub(crate) runtime: Handle,
    pub(crate) queue: OperationQueue,
    devices: Mutex<HashMap<Address, Device>>,
    connections: Mutex<HashMap<Address, Connection>>,
    // held for the whole of a connect so that concurrent ones share a link
    pub(crate) connecting: AsyncMutex<()>,
    readiness: watch::Sender<Readiness>,
    next_scan: AtomicU64,
}

impl Client {
    /// Creates a client with the default configuration. Must be called from
    /// within a tokio runtime, which will run the client's queues.
    pub fn new(transport: impl Transport) -> Result<Self> {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: impl Transport, config: ClientConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let readiness = check(transport.as_ref(), &config);
        let (readiness, _) = watch::channel(readiness);

        Ok(Client {
            inner: Arc::new(ClientInner {
                queue: OperationQueue::new(config.queue_capacity, &runtime),
                transport,
                config,
                runtime,
                devices: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                connecting: AsyncMutex::new(()),
                readiness,
                next_scan: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the device with the given address, e.g. `"01:23:45:67:89:AB"`.
    /// The same device is returned for as long as it has a live session.
    pub fn get_device(&self, address: &str) -> Result<Device> {
        let address = Address::parse(address)?;
        Ok(self.inner.device(address))
    }

    pub fn device(&self, address: Address) -> Device {
        self.inner.device(address)
    }

    /// Devices the driver reports as connected, whether or not this client
    /// connected them.
    pub fn get_connected_devices(&self) -> Result<HashSet<Device>> {
        let addresses = self.inner.transport.connected_devices()?;

        Ok(addresses
            .into_iter()
            .map(|address| self.inner.device(address))
            .collect())
    }

    /// Current readiness, recomputed now.
    pub fn readiness(&self) -> Readiness {
        self.inner.refresh_readiness()
    }

    /// Recomputes readiness and publishes it if it changed. Drivers call this
    /// when the adapter, location services or permissions change.
    pub fn refresh_readiness(&self) -> Readiness {
        self.inner.refresh_readiness()
    }

    /// Readiness now and whenever it changes.
    pub fn observe_readiness(&self) -> watch::Receiver<Readiness> {
        self.inner.refresh_readiness();
        self.inner.readiness.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn cached_devices(&self) -> usize {
        self.inner.lock_devices().len()
    }
}

impl ClientInner {
    fn lock_devices(&self) -> MutexGuard<'_, HashMap<Address, Device>> {
        match self.devices.lock() {
            Ok(devices) => devices,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn device(self: &Arc<Self>, address: Address) -> Device {
        self.lock_devices()
            .entry(address)
            .or_insert_with(|| {
                debug!(%address, "new device");
                Device::new(address, self)
            })
            .clone()
    }

    /// The one session for the address of `device`, shared with whichever
    /// handle is cached for that address.
    ///
    /// A live session of the cached handle is adopted by `device`. Otherwise
    /// `device` keeps or replaces its own session and becomes the cached
    /// handle.
    pub(crate) fn session_for(self: &Arc<Self>, device: &Device) -> Arc<Session> {
        let address = device.address();
        let mut devices = self.lock_devices();

        if let Some(cached) = devices.get(&address) {
            if !cached.is_same(device) {
                let session = cached.current_session();
                if !session.is_terminated() {
                    debug!(%address, "sharing the session of the cached device");
                    device.adopt(session.clone());
                    return session;
                }
            }
        }

        let session = device.current_or_open(self);
        devices.insert(address, device.clone());
        session
    }

    pub(crate) fn live_session(&self, address: Address) -> Option<Arc<Session>> {
        self.lock_devices()
            .get(&address)
            .map(Device::current_session)
            .filter(|session| !session.is_terminated())
    }

    /// The stored connection to `address` if the driver still reports it
    /// connected.
    pub(crate) fn live_connection(&self, address: Address) -> Option<Connection> {
        let connection = self.lock_connections().get(&address).cloned()?;
        if !connection.is_connected() {
            return None;
        }

        match self.transport.connection_state(address) {
            Ok(LinkState::Connected) => Some(connection),
            _ => None,
        }
    }

    pub(crate) fn store_connection(&self, connection: Connection) {
        self.lock_connections()
            .insert(connection.address(), connection);
    }

    pub(crate) fn forget_connection(&self, address: Address) {
        self.lock_connections().remove(&address);
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<Address, Connection>> {
        match self.connections.lock() {
            Ok(connections) => connections,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drops the cached device for `address` once its session has ended.
    fn evict(&self, address: Address) {
        let mut devices = self.lock_devices();
        let ended = devices
            .get(&address)
            .map_or(false, |device| device.current_session().is_terminated());
        if ended {
            devices.remove(&address);
            drop(devices);
            self.forget_connection(address);
            info!(%address, "device evicted");
        }
    }

    /// A session for `address` that evicts its device when it ends.
    pub(crate) fn open_session(self: &Arc<Self>, address: Address) -> Arc<Session> {
        let session = Session::new(address, &self.runtime);
        let client = Arc::downgrade(self);
        session.set_teardown_hook(move |address| {
            if let Some(client) = client.upgrade() {
                client.evict(address);
            }
        });
        session
    }

    fn refresh_readiness(&self) -> Readiness {
        let readiness = check(self.transport.as_ref(), &self.config);
        self.readiness.send_if_modified(|current| {
            if *current == readiness {
                false
            } else {
                debug!(%readiness, "readiness changed");
                *current = readiness;
                true
            }
        });
        readiness
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("queue", &self.inner.queue)
            .finish()
    }
}
