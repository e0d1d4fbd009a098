//! IRC collaborator interface
//!
//! The bridge core never speaks the IRC wire protocol itself. It drives a
//! [`ChatClient`] to open connections and a [`ChatConnection`] to join, part,
//! talk and listen.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{ChatMessage, ConnectionKey};

/// Default reason sent with PART and QUIT
pub const SHUTDOWN_REASON: &str = "Bridge shutting down";

/// Opens IRC connections
#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
    /// Perform a single connection attempt, returning once the server
    /// accepted the registration
    async fn connect(&self, key: &ConnectionKey) -> Result<Arc<dyn ChatConnection>>;
}

/// One registered IRC connection
#[async_trait]
pub trait ChatConnection: Send + Sync + 'static {
    /// Join a channel, returning once the server confirmed the join
    async fn join(&self, channel: &str) -> Result<()>;

    /// Leave a channel with a reason
    async fn part(&self, channel: &str, reason: &str) -> Result<()>;

    /// Send a PRIVMSG to a channel
    async fn say(&self, channel: &str, text: &str) -> Result<()>;

    /// Messages received in a channel from now on
    fn messages(&self, channel: &str) -> broadcast::Receiver<ChatMessage>;

    /// Completes when the connection has dropped
    async fn closed(&self);

    /// Send QUIT and close the connection
    async fn disconnect(&self, reason: &str);
}
