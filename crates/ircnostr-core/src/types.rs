//! Shared data types: connection identity, session identity and chat messages

use core::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Connection Identity
// ----------------------------------------------------------------------------

/// Identity of one IRC connection
///
/// Two bridges that share the same server, nick, port and TLS flag share one
/// live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub server: String,
    pub nick: String,
    pub secure: bool,
    pub port: u16,
}

impl ConnectionKey {
    pub fn new(server: impl Into<String>, nick: impl Into<String>, secure: bool, port: u16) -> Self {
        Self {
            server: server.into(),
            nick: nick.into(),
            secure,
            port,
        }
    }

    /// URI of the server, without a channel
    pub fn uri(&self) -> String {
        irc_uri(&self.server, self.secure, self.port, None)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.server, self.nick, self.secure, self.port)
    }
}

/// Identity of one joined channel on one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub connection: ConnectionKey,
    pub channel: String,
}

impl SessionKey {
    pub fn new(connection: ConnectionKey, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.channel)
    }
}

/// Render `irc://` or `ircs://` URIs, optionally pointing at a channel
pub fn irc_uri(server: &str, secure: bool, port: u16, channel: Option<&str>) -> String {
    let scheme = if secure { "ircs" } else { "irc" };
    match channel {
        Some(channel) => format!("{}://{}:{}/{}", scheme, server, port, channel),
        None => format!("{}://{}:{}", scheme, server, port),
    }
}

// ----------------------------------------------------------------------------
// Chat Messages
// ----------------------------------------------------------------------------

/// A message received in an IRC channel. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Nick of the sender
    pub sender: String,
    /// Message text
    pub text: String,
    /// When the bridge received the message
    pub received_at: SystemTime,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            received_at: SystemTime::now(),
        }
    }

    /// Whether the message was sent by the bridge itself, or by a nick the
    /// server derived from it (`bridge_`, `bridge1`, ...)
    pub fn is_from(&self, nick: &str) -> bool {
        self.sender.starts_with(nick)
    }
}
