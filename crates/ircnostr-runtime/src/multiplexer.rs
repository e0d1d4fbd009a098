//! IRC connection multiplexing
//!
//! Every bridge that talks to the same server with the same nick, port and
//! TLS flag shares one connection. The connection is opened on first demand,
//! re-established if it drops while still held, and closed with a QUIT once
//! the last holder lets go.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use ircnostr_core::{
    BridgeError, ChatClient, ChatConnection, ConnectionKey, Result, SHUTDOWN_REASON,
};

use crate::registry::{Lease, Shared, SharedRegistry};

/// A shared IRC connection
pub type SharedConnection = Arc<dyn ChatConnection>;

/// A holder's share of an IRC connection
pub type ConnectionLease = Lease<ConnectionKey, SharedConnection>;

/// Owns at most one live IRC connection per [`ConnectionKey`]
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    client: Arc<dyn ChatClient>,
    registry: SharedRegistry<ConnectionKey, SharedConnection>,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl ConnectionMultiplexer {
    pub fn new(client: Arc<dyn ChatClient>, connect_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            client,
            registry: SharedRegistry::new("connection"),
            connect_attempts: connect_attempts.max(1),
            retry_delay,
        }
    }

    /// Take a share of the connection for `key`, connecting if needed
    pub fn acquire(&self, key: ConnectionKey) -> ConnectionLease {
        let client = self.client.clone();
        let attempts = self.connect_attempts;
        let retry_delay = self.retry_delay;
        let driver_key = key.clone();

        self.registry.acquire(
            key,
            move |state| drive_connection(client, driver_key, attempts, retry_delay, state),
            |connection: SharedConnection| async move {
                connection.disconnect(SHUTDOWN_REASON).await;
            },
        )
    }

    /// Number of connections currently held
    pub fn active_connections(&self) -> usize {
        self.registry.live()
    }

    /// Whether every connection has been released and closed
    pub fn is_idle(&self) -> bool {
        self.registry.is_idle()
    }
}

/// Keep one connection for `key` alive until aborted
async fn drive_connection(
    client: Arc<dyn ChatClient>,
    key: ConnectionKey,
    attempts: u32,
    retry_delay: Duration,
    state: watch::Sender<Shared<SharedConnection>>,
) {
    loop {
        match connect_with_retry(client.as_ref(), &key, attempts, retry_delay).await {
            Ok(connection) => {
                info!("Connected to {} as {}", key.uri(), key.nick);
                state.send_replace(Shared::Ready(connection.clone()));

                connection.closed().await;
                warn!("Connection to {} lost, reconnecting", key.uri());
                state.send_replace(Shared::Pending);
            }
            Err(err) => {
                error!("Giving up on {}: {}", key.uri(), err);
                state.send_replace(Shared::Failed(err));
                return;
            }
        }
    }
}

async fn connect_with_retry(
    client: &dyn ChatClient,
    key: &ConnectionKey,
    attempts: u32,
    retry_delay: Duration,
) -> Result<SharedConnection> {
    let mut last_error = None;

    for attempt in 1..=attempts {
        match client.connect(key).await {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    attempt,
                    attempts,
                    key.uri(),
                    err
                );
                last_error = Some(err);
                if attempt < attempts {
                    sleep(retry_delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| BridgeError::ConnectionFailed {
        key: key.to_string(),
        reason: "no connection attempt made".to_string(),
    }))
}
