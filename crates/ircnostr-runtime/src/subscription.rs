//! Relay subscriptions that never give up
//!
//! [`EventSubscription`] turns a relay subscription into an endless stream:
//! whenever the relay refuses the subscription, errors out or ends it, the
//! subscription is opened again after a fixed delay. Events authored by the
//! bridge itself and events already delivered are dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use nostr_sdk::{Event, EventId, Filter, PublicKey};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use ircnostr_core::events::is_own_event;
use ircnostr_core::{EventStream, RelayClient};

// ----------------------------------------------------------------------------
// Seen Events
// ----------------------------------------------------------------------------

/// Bounded memory of recently delivered event ids
#[derive(Debug)]
pub struct SeenEvents {
    capacity: usize,
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl SeenEvents {
    /// Remember up to `capacity` ids; a capacity of 0 disables deduplication
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `id`, returning false if it was already seen
    pub fn insert(&mut self, id: EventId) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.ids.insert(id) {
            return false;
        }

        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Subscription
// ----------------------------------------------------------------------------

/// A restartable subscription to one relay
pub struct EventSubscription {
    relay: Arc<dyn RelayClient>,
    filter: Filter,
    own_key: PublicKey,
    retry_delay: Duration,
    seen: SeenEvents,
}

impl EventSubscription {
    pub fn new(
        relay: Arc<dyn RelayClient>,
        filter: Filter,
        own_key: PublicKey,
        retry_delay: Duration,
        seen_window: usize,
    ) -> Self {
        Self {
            relay,
            filter,
            own_key,
            retry_delay,
            seen: SeenEvents::new(seen_window),
        }
    }

    /// Endless stream of events from other authors
    ///
    /// Nothing happens until the stream is polled; dropping it closes the
    /// subscription.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        stream::unfold((self, None::<EventStream>), |(mut sub, mut current)| async move {
            loop {
                if current.is_none() {
                    match sub.relay.subscribe(sub.filter.clone()).await {
                        Ok(events) => {
                            info!("Subscribed to {}", sub.relay.url());
                            current = Some(events);
                        }
                        Err(err) => {
                            warn!(
                                "Subscription to {} failed: {}, retrying in {:?}",
                                sub.relay.url(),
                                err,
                                sub.retry_delay
                            );
                            sleep(sub.retry_delay).await;
                            continue;
                        }
                    }
                }
                let Some(events) = current.as_mut() else {
                    continue;
                };

                match events.next().await {
                    Some(Ok(event)) => {
                        if is_own_event(&event, &sub.own_key) {
                            debug!("Ignoring own event {}", event.id);
                            continue;
                        }
                        if !sub.seen.insert(event.id) {
                            debug!("Ignoring redelivered event {}", event.id);
                            continue;
                        }
                        return Some((event, (sub, current)));
                    }
                    Some(Err(err)) => {
                        warn!(
                            "Subscription to {} broke: {}, retrying in {:?}",
                            sub.relay.url(),
                            err,
                            sub.retry_delay
                        );
                    }
                    None => {
                        warn!(
                            "Subscription to {} ended, retrying in {:?}",
                            sub.relay.url(),
                            sub.retry_delay
                        );
                    }
                }

                current = None;
                sleep(sub.retry_delay).await;
            }
        })
    }
}
