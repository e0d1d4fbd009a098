//! Mock IRC server
//!
//! [`MockChatClient`] hands out [`MockConnection`]s, one per `connect` call,
//! and keeps track of how many are open at once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::debug;

use ircnostr_core::{BridgeError, ChatClient, ChatConnection, ChatMessage, ConnectionKey, Result};

use crate::{lock, wait_until};

/// A command the bridge sent to the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Join(String),
    Part { channel: String, reason: String },
    Say { channel: String, text: String },
    Quit(String),
}

// ----------------------------------------------------------------------------
// Mock Client
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    max_live: AtomicUsize,
}

/// Opens mock connections and counts them
#[derive(Default)]
pub struct MockChatClient {
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    connect_delay: Duration,
    counters: Arc<Counters>,
    rejected_channels: Mutex<HashSet<String>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connection attempt
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Make every JOIN of `channel` fail on connections opened from now on
    pub fn reject_join(&self, channel: &str) {
        lock(&self.rejected_channels).insert(channel.to_lowercase());
    }

    /// Number of connection attempts so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of connections currently open
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Highest number of connections that were ever open at once
    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    /// Every connection opened so far, oldest first
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.connections).clone()
    }

    /// The most recently opened connection
    pub fn latest(&self) -> Option<Arc<MockConnection>> {
        lock(&self.connections).last().cloned()
    }

    /// Wait until `count` connections have been opened in total
    pub async fn wait_for_connections(&self, count: usize) {
        wait_until(|| lock(&self.connections).len() >= count).await;
    }

    /// Wait until no connection is open
    pub async fn wait_for_idle(&self) {
        wait_until(|| self.live() == 0).await;
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn connect(&self, key: &ConnectionKey) -> Result<Arc<dyn ChatConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            sleep(self.connect_delay).await;
        }

        let refused = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BridgeError::ConnectionFailed {
                key: key.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        let connection = Arc::new(MockConnection::new(
            key.clone(),
            self.counters.clone(),
            lock(&self.rejected_channels).clone(),
        ));
        lock(&self.connections).push(connection.clone());
        debug!("Mock connection {} opened ({} live)", key, live);
        Ok(connection)
    }
}

// ----------------------------------------------------------------------------
// Mock Connection
// ----------------------------------------------------------------------------

/// One open mock connection
pub struct MockConnection {
    key: ConnectionKey,
    counters: Arc<Counters>,
    rejected_channels: HashSet<String>,
    commands: Mutex<Vec<ChatCommand>>,
    channels: DashMap<String, broadcast::Sender<ChatMessage>>,
    link: watch::Sender<bool>,
    open: AtomicBool,
}

impl MockConnection {
    fn new(key: ConnectionKey, counters: Arc<Counters>, rejected_channels: HashSet<String>) -> Self {
        Self {
            key,
            counters,
            rejected_channels,
            commands: Mutex::new(Vec::new()),
            channels: DashMap::new(),
            link: watch::Sender::new(true),
            open: AtomicBool::new(true),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Every command received, in order
    pub fn commands(&self) -> Vec<ChatCommand> {
        lock(&self.commands).clone()
    }

    /// Lines said in `channel`, in order
    pub fn said(&self, channel: &str) -> Vec<String> {
        lock(&self.commands)
            .iter()
            .filter_map(|c| match c {
                ChatCommand::Say { channel: target, text } if target == channel => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait until the recorded commands satisfy `condition`
    pub async fn wait_for_commands(&self, condition: impl Fn(&[ChatCommand]) -> bool) {
        wait_until(|| condition(&lock(&self.commands))).await;
    }

    /// Wait until `count` lines have been said in `channel`
    pub async fn wait_for_said(&self, channel: &str, count: usize) {
        wait_until(|| self.said(channel).len() >= count).await;
    }

    /// Wait until the bridge has joined `channel`
    pub async fn wait_for_join(&self, channel: &str) {
        let join = ChatCommand::Join(channel.to_string());
        self.wait_for_commands(|commands| commands.contains(&join)).await;
    }

    /// Deliver a message from `sender` to everyone listening on `channel`.
    /// Returns the number of listeners.
    pub fn inject(&self, channel: &str, sender: &str, text: &str) -> usize {
        self.channels
            .get(&channel.to_lowercase())
            .and_then(|tx| tx.send(ChatMessage::new(sender, text)).ok())
            .unwrap_or(0)
    }

    /// Simulate the server dropping the connection
    pub fn drop_link(&self) {
        self.close();
    }

    fn record(&self, command: ChatCommand) {
        lock(&self.commands).push(command);
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.channels.clear();
            self.link.send_replace(false);
            debug!("Mock connection {} closed", self.key);
        }
    }

    fn ensure_open(&self, target: &str) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BridgeError::SendFailed {
                target: target.to_string(),
                reason: "connection closed".to_string(),
            })
        }
    }
}

#[async_trait]
impl ChatConnection for MockConnection {
    async fn join(&self, channel: &str) -> Result<()> {
        self.ensure_open(channel)?;
        self.record(ChatCommand::Join(channel.to_string()));
        if self.rejected_channels.contains(&channel.to_lowercase()) {
            return Err(BridgeError::JoinFailed {
                channel: channel.to_string(),
                reason: "banned from channel".to_string(),
            });
        }
        Ok(())
    }

    async fn part(&self, channel: &str, reason: &str) -> Result<()> {
        self.ensure_open(channel)?;
        self.record(ChatCommand::Part {
            channel: channel.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn say(&self, channel: &str, text: &str) -> Result<()> {
        self.ensure_open(channel)?;
        self.record(ChatCommand::Say {
            channel: channel.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn messages(&self, channel: &str) -> broadcast::Receiver<ChatMessage> {
        if !self.is_open() {
            // a receiver whose sender is already gone
            return broadcast::channel(1).1;
        }
        self.channels
            .entry(channel.to_lowercase())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    async fn closed(&self) {
        let mut link = self.link.subscribe();
        let _ = link.wait_for(|up| !*up).await;
    }

    async fn disconnect(&self, reason: &str) {
        if self.is_open() {
            self.record(ChatCommand::Quit(reason.to_string()));
        }
        self.close();
    }
}
