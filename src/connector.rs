use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::ClientInner;
use crate::connection::Connection;
use crate::device::Device;
use crate::ops::connect::Establish;
use crate::result::Result;
use crate::session::Session;

/// Tears the session of an attempt down unless the attempt succeeded,
/// including when the attempt is abandoned halfway.
struct Attempt(Option<Arc<Session>>);

impl Attempt {
    fn succeeded(mut self) {
        self.0 = None;
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            session.teardown();
        }
    }
}

/// Connects to `device` and discovers its services, retrying the pair up to
/// `connect_retries` more times. Every failed attempt's session is torn down
/// before the next attempt starts; the last failure is returned.
pub(crate) async fn establish(client: &Arc<ClientInner>, device: &Device) -> Result<Connection> {
    let address = device.address();
    let attempts = client.config.connect_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let session = client.session_for(device);
        let guard = Attempt(Some(session.clone()));
        debug!(%address, attempt, attempts, "connecting");

        let result = client
            .queue
            .schedule(Establish::new(
                client.transport.clone(),
                session.clone(),
                client.config.auto_connect,
            ))
            .single()
            .await;

        match result {
            Ok(services) => {
                guard.succeeded();
                info!(%address, attempt, services = services.len(), "connected");
                return Ok(Connection::new(
                    session,
                    services,
                    client.config.queue_capacity,
                    &client.runtime,
                ));
            }
            Err(error) => {
                drop(guard);
                if attempt >= attempts {
                    warn!(%address, attempt, %error, "giving up on connection");
                    return Err(error);
                }
                debug!(%address, attempt, %error, "connection attempt failed");
            }
        }
    }
}
