use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::gatt::Services;
use crate::result::{Error, Result};
use crate::session::ConnectionState;
use crate::util::CompositeId;
use crate::Address;

const EVENT_CAPACITY: usize = 32;
const NOTIFICATION_CAPACITY: usize = 256;

pub(crate) type CharacteristicEvent = (CompositeId, Bytes);
pub(crate) type DescriptorEvent = (Uuid, Bytes);

/// Fans the callbacks of one link out to everyone waiting on them.
///
/// Each kind of callback gets its own broadcast channel. Operations never
/// subscribe to a bare channel: they get an [`EventSubscription`] that also
/// listens for the end of the link, so nobody waits on a dead link.
#[derive(Debug)]
pub(crate) struct EventHub {
    address: Address,
    state: watch::Sender<ConnectionState>,
    services_discovered: broadcast::Sender<Services>,
    characteristic_read: broadcast::Sender<CharacteristicEvent>,
    characteristic_write: broadcast::Sender<CharacteristicEvent>,
    characteristic_changed: broadcast::Sender<CharacteristicEvent>,
    descriptor_read: broadcast::Sender<DescriptorEvent>,
    descriptor_write: broadcast::Sender<DescriptorEvent>,
    mtu_changed: broadcast::Sender<u16>,
    disconnections: broadcast::Sender<Error>,
    errors: broadcast::Sender<Error>,
    // set before the terminal disconnection is broadcast
    terminal: Mutex<Option<Error>>,
}

impl EventHub {
    pub fn new(address: Address) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        EventHub {
            address,
            state,
            services_discovered: broadcast::channel(EVENT_CAPACITY).0,
            characteristic_read: broadcast::channel(EVENT_CAPACITY).0,
            characteristic_write: broadcast::channel(EVENT_CAPACITY).0,
            characteristic_changed: broadcast::channel(NOTIFICATION_CAPACITY).0,
            descriptor_read: broadcast::channel(EVENT_CAPACITY).0,
            descriptor_write: broadcast::channel(EVENT_CAPACITY).0,
            mtu_changed: broadcast::channel(EVENT_CAPACITY).0,
            disconnections: broadcast::channel(1).0,
            errors: broadcast::channel(EVENT_CAPACITY).0,
            terminal: Mutex::new(None),
        }
    }

    pub fn terminal_error(&self) -> Option<Error> {
        self.lock_terminal().clone()
    }

    fn lock_terminal(&self) -> MutexGuard<'_, Option<Error>> {
        match self.terminal.lock() {
            Ok(terminal) => terminal,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminal_error().is_some()
    }

    // ---- publishing, called from the driver's callback context ----

    pub fn publish_state(&self, next: ConnectionState) {
        if self.is_terminated() {
            debug!(address = %self.address, state = ?next, "ignoring state change after disconnection");
            return;
        }

        let current = *self.state.borrow();
        if current != next && !current.can_transition_to(next) {
            warn!(address = %self.address, from = ?current, to = ?next, "unexpected connection state transition");
        }

        trace!(address = %self.address, state = ?next, "connection state changed");
        self.state.send_replace(next);
    }

    /// Records the end of the link and tells every waiting subscriber. Only
    /// the first disconnection counts.
    pub fn publish_disconnection(&self, error: Error) {
        {
            let mut terminal = self.lock_terminal();
            if terminal.is_some() {
                debug!(address = %self.address, %error, "ignoring repeated disconnection");
                return;
            }
            *terminal = Some(error.clone());
        }

        debug!(address = %self.address, %error, "link terminated");
        let _ = self.disconnections.send(error);
    }

    pub fn publish_error(&self, error: Error) {
        if self.is_terminated() {
            return;
        }
        debug!(address = %self.address, %error, "gatt error");
        let _ = self.errors.send(error);
    }

    pub fn publish_services(&self, services: Services) {
        if !self.is_terminated() {
            let _ = self.services_discovered.send(services);
        }
    }

    pub fn publish_characteristic_read(&self, event: CharacteristicEvent) {
        if !self.is_terminated() {
            let _ = self.characteristic_read.send(event);
        }
    }

    pub fn publish_characteristic_write(&self, event: CharacteristicEvent) {
        if !self.is_terminated() {
            let _ = self.characteristic_write.send(event);
        }
    }

    pub fn publish_characteristic_changed(&self, event: CharacteristicEvent) {
        if !self.is_terminated() {
            let _ = self.characteristic_changed.send(event);
        }
    }

    pub fn publish_descriptor_read(&self, event: DescriptorEvent) {
        if !self.is_terminated() {
            let _ = self.descriptor_read.send(event);
        }
    }

    pub fn publish_descriptor_write(&self, event: DescriptorEvent) {
        if !self.is_terminated() {
            let _ = self.descriptor_write.send(event);
        }
    }

    pub fn publish_mtu(&self, mtu: u16) {
        if !self.is_terminated() {
            let _ = self.mtu_changed.send(mtu);
        }
    }

    // ---- subscribing ----

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn observe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves with the error that ended the link; immediately if it has
    /// already ended.
    pub fn disconnection(&self) -> DisconnectionSubscription {
        let receiver = self.disconnections.subscribe();
        DisconnectionSubscription {
            address: self.address,
            receiver,
            terminal: self.terminal_error(),
        }
    }

    pub fn services_discovered(&self) -> EventSubscription<Services> {
        self.merged(&self.services_discovered, true)
    }

    /// Every discovery result from now on, including those caused by the
    /// peripheral changing its attribute table. Unaffected by GATT errors.
    pub fn service_changes(&self) -> EventSubscription<Services> {
        self.merged(&self.services_discovered, false)
    }

    pub fn characteristic_read(&self) -> EventSubscription<CharacteristicEvent> {
        self.merged(&self.characteristic_read, true)
    }

    pub fn characteristic_write(&self) -> EventSubscription<CharacteristicEvent> {
        self.merged(&self.characteristic_write, true)
    }

    /// Notifications are only cut short by the end of the link; a failed
    /// request elsewhere on the link does not end them.
    pub fn characteristic_changed(&self) -> EventSubscription<CharacteristicEvent> {
        self.merged(&self.characteristic_changed, false)
    }

    pub fn descriptor_read(&self) -> EventSubscription<DescriptorEvent> {
        self.merged(&self.descriptor_read, true)
    }

    pub fn descriptor_write(&self) -> EventSubscription<DescriptorEvent> {
        self.merged(&self.descriptor_write, true)
    }

    pub fn mtu_changed(&self) -> EventSubscription<u16> {
        self.merged(&self.mtu_changed, true)
    }

    fn merged<T: Clone>(
        &self,
        events: &broadcast::Sender<T>,
        with_errors: bool,
    ) -> EventSubscription<T> {
        // subscribe first, then look at the terminal slot: a disconnection
        // published in between is seen by one or the other
        let events = events.subscribe();
        let disconnections = self.disconnections.subscribe();
        let errors = if with_errors {
            Some(self.errors.subscribe())
        } else {
            None
        };

        EventSubscription {
            address: self.address,
            events,
            disconnections,
            errors,
            failed: self.terminal_error(),
        }
    }
}

/// One subscriber's view of a hub channel, merged with link loss and, for
/// request/response channels, with reported GATT errors. Must be created
/// before the request it waits on is issued.
#[derive(Debug)]
pub(crate) struct EventSubscription<T> {
    address: Address,
    events: broadcast::Receiver<T>,
    disconnections: broadcast::Receiver<Error>,
    errors: Option<broadcast::Receiver<Error>>,
    failed: Option<Error>,
}

impl<T: Clone> EventSubscription<T> {
    /// Waits for the next event. Once this has failed it keeps failing with
    /// the same error.
    pub async fn recv(&mut self) -> Result<T> {
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }

        let result = loop {
            tokio::select! {
                biased;

                disconnection = self.disconnections.recv() => {
                    break Err(match disconnection {
                        Ok(error) => error,
                        Err(_) => Error::NotConnected { address: self.address },
                    });
                }

                error = recv_optional(&mut self.errors) => {
                    match error {
                        Ok(error) => break Err(error),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(address = %self.address, skipped, "missed gatt errors");
                        }
                        Err(RecvError::Closed) => {
                            break Err(Error::NotConnected { address: self.address });
                        }
                    }
                }

                event = self.events.recv() => {
                    match event {
                        Ok(event) => return Ok(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(address = %self.address, skipped, "event subscriber fell behind");
                        }
                        Err(RecvError::Closed) => {
                            break Err(Error::NotConnected { address: self.address });
                        }
                    }
                }
            }
        };

        if let Err(error) = &result {
            self.failed = Some(error.clone());
        }
        result
    }

    /// Waits for the first event accepted by `predicate`, discarding others.
    pub async fn recv_matching<F>(&mut self, mut predicate: F) -> Result<T>
    where
        F: FnMut(&T) -> bool,
    {
        loop {
            let event = self.recv().await?;
            if predicate(&event) {
                return Ok(event);
            }
        }
    }
}

/// Waits for the end of the link.
#[derive(Debug)]
pub(crate) struct DisconnectionSubscription {
    address: Address,
    receiver: broadcast::Receiver<Error>,
    terminal: Option<Error>,
}

impl DisconnectionSubscription {
    pub async fn wait(mut self) -> Error {
        if let Some(error) = self.terminal.take() {
            return error;
        }

        match self.receiver.recv().await {
            Ok(error) => error,
            Err(_) => Error::NotConnected {
                address: self.address,
            },
        }
    }
}

async fn recv_optional(
    receiver: &mut Option<broadcast::Receiver<Error>>,
) -> std::result::Result<Error, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => futures::future::pending().await,
    }
}
