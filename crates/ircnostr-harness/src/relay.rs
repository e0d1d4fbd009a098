//! Mock Nostr relays and profile lookups

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use nostr_sdk::{Event, Filter, PublicKey};
use tokio::sync::mpsc;
use tokio::time::sleep;

use ircnostr_core::{
    BridgeError, EventStream, ProfileLookup, RelayClient, RelayProvider, Result,
};

use crate::{lock, wait_until};

// ----------------------------------------------------------------------------
// Mock Relay
// ----------------------------------------------------------------------------

struct Subscriber {
    filter: Filter,
    sender: mpsc::UnboundedSender<Result<Event>>,
}

/// An in-memory relay
///
/// Published events are recorded and, unless echo is turned off, delivered
/// back to every open subscription the way a real relay would.
pub struct MockRelay {
    url: String,
    echo: bool,
    publish_delay: Duration,
    subscribers: Mutex<Vec<Subscriber>>,
    subscribe_calls: AtomicUsize,
    failing_subscriptions: AtomicUsize,
    fail_publishes: AtomicBool,
    publish_calls: AtomicUsize,
    published: Mutex<Vec<Event>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            echo: true,
            publish_delay: Duration::ZERO,
            subscribers: Mutex::new(Vec::new()),
            subscribe_calls: AtomicUsize::new(0),
            failing_subscriptions: AtomicUsize::new(0),
            fail_publishes: AtomicBool::new(false),
            publish_calls: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Take `delay` to acknowledge every publish
    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = delay;
        self
    }

    /// Do not deliver published events to subscribers
    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Refuse the next `count` subscriptions
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.failing_subscriptions.store(count, Ordering::SeqCst);
    }

    /// Reject every publish while `fail` is set
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Number of subscription attempts so far, failed ones included
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of subscriptions still open
    pub fn subscribers(&self) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.len()
    }

    /// Number of publish attempts so far, rejected ones included
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Events accepted so far, in acknowledgement order
    pub fn published(&self) -> Vec<Event> {
        lock(&self.published).clone()
    }

    /// Highest number of publishes that were ever in progress at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_for_subscribers(&self, count: usize) {
        wait_until(|| self.subscribers() >= count).await;
    }

    pub async fn wait_for_subscribe_calls(&self, count: usize) {
        wait_until(|| self.subscribe_calls() >= count).await;
    }

    pub async fn wait_for_published(&self, count: usize) {
        wait_until(|| lock(&self.published).len() >= count).await;
    }

    /// Deliver an event to every open subscription whose filter matches it
    pub async fn deliver(&self, event: Event) {
        lock(&self.subscribers).retain(|s| {
            !s.filter.match_event(&event) || s.sender.send(Ok(event.clone())).is_ok()
        });
    }

    /// End every open subscription
    pub async fn close_subscriptions(&self) {
        lock(&self.subscribers).clear();
    }

    /// Break every open subscription with an error
    pub async fn break_subscriptions(&self, reason: &str) {
        let mut subscribers = lock(&self.subscribers);
        for subscriber in subscribers.drain(..) {
            let _ = subscriber.sender.send(Err(BridgeError::Relay {
                relay: self.url.clone(),
                reason: reason.to_string(),
            }));
        }
    }
}

#[async_trait]
impl RelayClient for MockRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn subscribe(&self, filter: Filter) -> Result<EventStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failing_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BridgeError::Relay {
                relay: self.url.clone(),
                reason: "relay unreachable".to_string(),
            });
        }

        let (sender, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(Subscriber { filter, sender });
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(events.boxed())
    }

    async fn publish(&self, event: Event) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if !self.publish_delay.is_zero() {
            sleep(self.publish_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BridgeError::PublishFailed {
                relay: self.url.clone(),
                reason: "blocked".to_string(),
            });
        }

        lock(&self.published).push(event.clone());
        if self.echo {
            self.deliver(event).await;
        }
        Ok(())
    }
}

/// Hands out one [`MockRelay`] per URL
#[derive(Default)]
pub struct MockRelayPool {
    relays: DashMap<String, Arc<MockRelay>>,
}

impl MockRelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a preconfigured relay under its URL
    pub fn insert(&self, relay: MockRelay) -> Arc<MockRelay> {
        let relay = Arc::new(relay);
        self.relays.insert(relay.url.clone(), relay.clone());
        relay
    }

    /// The relay for `url`, created on first use
    pub fn get(&self, url: &str) -> Arc<MockRelay> {
        self.relays
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MockRelay::new(url)))
            .clone()
    }
}

impl RelayProvider for MockRelayPool {
    fn relay(&self, url: &str) -> Result<Arc<dyn RelayClient>> {
        Ok(self.get(url))
    }
}

// ----------------------------------------------------------------------------
// Mock Profile Lookup
// ----------------------------------------------------------------------------

/// Serves profile events from memory and counts lookups
#[derive(Default)]
pub struct MockProfileLookup {
    profiles: DashMap<PublicKey, Event>,
    lookups: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
    last_relays: Mutex<Vec<String>>,
}

impl MockProfileLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `delay` to answer every lookup
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn add_profile(&self, event: Event) {
        self.profiles.insert(event.pubkey, event);
    }

    /// Fail every lookup while `fail` is set
    pub fn fail_lookups(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Number of lookups so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Relays passed to the most recent lookup
    pub fn last_relays(&self) -> Vec<String> {
        lock(&self.last_relays).clone()
    }
}

#[async_trait]
impl ProfileLookup for MockProfileLookup {
    async fn lookup_profile(&self, public_key: PublicKey, relays: &[String]) -> Result<Option<Event>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_relays) = relays.to_vec();
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::ProfileLookup("lookup relays unreachable".to_string()));
        }
        Ok(self.profiles.get(&public_key).map(|e| e.value().clone()))
    }
}
