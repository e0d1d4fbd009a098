//! Core definitions for the IRC/Nostr bridge
//!
//! This crate holds what every other bridge crate agrees on:
//! - Configuration (`AppConfig`, `BridgeDefinition`)
//! - The `BridgeError` type
//! - Connection and session identities, chat messages
//! - Collaborator traits for the IRC and Nostr sides
//! - Construction of the Nostr events the bridge publishes

pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod relay;
pub mod types;

pub use chat::{ChatClient, ChatConnection, SHUTDOWN_REASON};
pub use config::{AppConfig, BridgeDefinition, BridgeEntry, IrcSettings, NostrSettings, RuntimeConfig};
pub use error::{BridgeError, Result};
pub use events::{ANONYMOUS_NAME, EPHEMERAL_CHAT_KIND};
pub use relay::{EventStream, ProfileLookup, RelayClient, RelayProvider};
pub use types::{irc_uri, ChatMessage, ConnectionKey, SessionKey};

// Re-exported so dependent crates agree on one nostr-sdk version
pub use nostr_sdk;
