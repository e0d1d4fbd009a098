//! Relay clients backed by `nostr-sdk`

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use nostr_sdk::{Client, Event, Filter, Keys, RelayPoolNotification, SubscriptionId};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use ircnostr_core::{EventStream, RelayClient, RelayProvider, Result};

use crate::error::NostrTransportError;

// ----------------------------------------------------------------------------
// Relay
// ----------------------------------------------------------------------------

/// A single relay, connected on first use
///
/// The `nostr-sdk` client reconnects on its own and replays open
/// subscriptions after a reconnect. Each stream returned by `subscribe` owns
/// one REQ and only yields events for it; dropping the stream closes it.
pub struct NostrRelay {
    url: Url,
    client: Client,
    connected: OnceCell<()>,
}

impl NostrRelay {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|_| NostrTransportError::InvalidRelayUrl {
            url: url.to_string(),
        })?;

        // Events are signed by the bridges themselves; the client key is
        // only used for relay authentication
        let client = Client::new(&Keys::generate());

        Ok(Self {
            url,
            client,
            connected: OnceCell::new(),
        })
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.connected
            .get_or_try_init(|| async {
                self.client.add_relay(self.url.clone()).await.map_err(|source| {
                    NostrTransportError::RelayConnectionFailed {
                        relay: self.url.to_string(),
                        source,
                    }
                })?;
                self.client.connect().await;
                info!("Connected to relay {}", self.url);
                Ok::<(), NostrTransportError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RelayClient for NostrRelay {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn subscribe(&self, filter: Filter) -> Result<EventStream> {
        self.ensure_connected().await?;

        // listen before subscribing so no event slips through
        let notifications = self.client.notifications();
        let id = self.client.subscribe(vec![filter], None).await;
        debug!("Subscription {} opened on {}", id, self.url);

        let guard = SubscriptionGuard {
            client: self.client.clone(),
            id,
            relay: self.url.to_string(),
        };
        let events = stream::unfold(
            (notifications, guard),
            |(mut notifications, guard)| async move {
                loop {
                    match notifications.recv().await {
                        // the client is shared by every subscription on this relay
                        Ok(RelayPoolNotification::Event {
                            subscription_id,
                            event,
                            ..
                        }) => {
                            if subscription_id != guard.id {
                                continue;
                            }
                            let event = Event::clone(&event);
                            return Some((Ok(event), (notifications, guard)));
                        }
                        Ok(RelayPoolNotification::Shutdown) => {
                            let err = NostrTransportError::Shutdown {
                                relay: guard.relay.clone(),
                            };
                            return Some((Err(err.into()), (notifications, guard)));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Missed {} notifications from {}", missed, guard.relay);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(events.boxed())
    }

    async fn publish(&self, event: Event) -> Result<()> {
        self.ensure_connected().await?;

        let id = event.id;
        self.client
            .send_event(event)
            .await
            .map_err(|source| NostrTransportError::EventSendFailed {
                relay: self.url.to_string(),
                source,
            })?;

        debug!("Relay {} accepted event {}", self.url, id);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Subscription Guard
// ----------------------------------------------------------------------------

/// Closes a relay subscription when the stream owning it is dropped
struct SubscriptionGuard {
    client: Client,
    id: SubscriptionId,
    relay: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("Subscription {} on {} left open, no runtime", self.id, self.relay);
            return;
        };

        let client = self.client.clone();
        let id = self.id.clone();
        let relay = self.relay.clone();
        runtime.spawn(async move {
            client.unsubscribe(id.clone()).await;
            debug!("Subscription {} closed on {}", id, relay);
        });
    }
}

// ----------------------------------------------------------------------------
// Relay Pool
// ----------------------------------------------------------------------------

/// One [`NostrRelay`] per relay URL
#[derive(Default)]
pub struct NostrRelayPool {
    relays: DashMap<String, Arc<NostrRelay>>,
}

impl NostrRelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}

impl RelayProvider for NostrRelayPool {
    fn relay(&self, url: &str) -> Result<Arc<dyn RelayClient>> {
        if let Some(relay) = self.relays.get(url) {
            return Ok(relay.value().clone());
        }

        let relay = Arc::new(NostrRelay::new(url)?);
        let relay = self.relays.entry(url.to_string()).or_insert(relay).clone();
        Ok(relay)
    }
}
