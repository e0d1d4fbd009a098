//! Channel sessions on multiplexed connections
//!
//! A session is a joined channel on one shared connection. Bridges pointing
//! at the same channel through the same connection share the session; the
//! channel is parted when the last of them leaves. Whenever the underlying
//! connection is re-established, the session joins again on the new one.

use core::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use ircnostr_core::{ChatMessage, ConnectionKey, Result, SessionKey, SHUTDOWN_REASON};

use crate::multiplexer::{ConnectionLease, ConnectionMultiplexer, SharedConnection};
use crate::registry::{Lease, Shared, SharedRegistry, SharedWatch};

/// A joined channel
#[derive(Clone)]
pub struct ChannelSession {
    connection: SharedConnection,
    channel: String,
    // Keeps the connection open until the channel has been parted
    _lease: Arc<ConnectionLease>,
}

impl ChannelSession {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Send a line to the channel
    pub async fn say(&self, text: &str) -> Result<()> {
        self.connection.say(&self.channel, text).await
    }

    /// Messages arriving in the channel from now on
    pub fn messages(&self) -> broadcast::Receiver<ChatMessage> {
        self.connection.messages(&self.channel)
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("channel", &self.channel)
            .field("connection", self._lease.key())
            .finish()
    }
}

/// A holder's share of a channel session
pub type SessionLease = Lease<SessionKey, ChannelSession>;

/// Joins and parts channels on behalf of any number of bridges
#[derive(Clone)]
pub struct SessionManager {
    multiplexer: ConnectionMultiplexer,
    registry: SharedRegistry<SessionKey, ChannelSession>,
}

impl SessionManager {
    pub fn new(multiplexer: ConnectionMultiplexer) -> Self {
        Self {
            multiplexer,
            registry: SharedRegistry::new("session"),
        }
    }

    /// Take a share of `channel` on the connection identified by `connection`
    pub fn join(&self, connection: ConnectionKey, channel: &str) -> SessionLease {
        let key = SessionKey::new(connection, channel);
        let multiplexer = self.multiplexer.clone();
        let driver_key = key.clone();

        self.registry.acquire(
            key,
            move |state| drive_session(multiplexer, driver_key, state),
            |session: ChannelSession| async move {
                match session.connection.part(&session.channel, SHUTDOWN_REASON).await {
                    Ok(()) => info!("Left {}", session.channel),
                    Err(err) => warn!("Failed to part {}: {}", session.channel, err),
                }
                // the connection lease goes with the session, after the PART
                drop(session);
            },
        )
    }

    /// Whether every session and connection has been released and closed
    pub fn is_idle(&self) -> bool {
        self.registry.is_idle() && self.multiplexer.is_idle()
    }
}

/// Follow the connection for `key` and (re-)join the channel on every new one
async fn drive_session(
    multiplexer: ConnectionMultiplexer,
    key: SessionKey,
    state: watch::Sender<Shared<ChannelSession>>,
) {
    let lease = Arc::new(multiplexer.acquire(key.connection.clone()));
    let mut upstream: SharedWatch<SharedConnection> = lease.watch();

    loop {
        let current = upstream.borrow_and_update().clone();
        match current {
            Shared::Pending => {
                state.send_if_modified(|s| {
                    if s.is_pending() {
                        false
                    } else {
                        *s = Shared::Pending;
                        true
                    }
                });
            }
            Shared::Failed(err) => {
                state.send_replace(Shared::Failed(err));
                return;
            }
            Shared::Ready(connection) => match connection.join(&key.channel).await {
                Ok(()) => {
                    info!("Joined {} on {}", key.channel, key.connection.server);
                    state.send_replace(Shared::Ready(ChannelSession {
                        connection,
                        channel: key.channel.clone(),
                        _lease: lease.clone(),
                    }));
                }
                Err(err) => {
                    warn!("Could not join {}: {}", key.channel, err);
                    state.send_replace(Shared::Failed(err));
                    return;
                }
            },
        }

        if upstream.changed().await.is_err() {
            return;
        }
    }
}
