//! Error types for the IRC/Nostr bridge
//!
//! Every variant carries owned strings so the error can be cloned into shared
//! resource state and replayed to every lease holder of a failed connection.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors produced anywhere in the bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid private key for bridge {bridge}: {reason}")]
    InvalidKey { bridge: String, reason: String },

    #[error("Failed to connect to {key}: {reason}")]
    ConnectionFailed { key: String, reason: String },

    #[error("Connection to {key} closed")]
    ConnectionClosed { key: String },

    #[error("Failed to join {channel}: {reason}")]
    JoinFailed { channel: String, reason: String },

    #[error("Failed to send to {target}: {reason}")]
    SendFailed { target: String, reason: String },

    #[error("Relay {relay} error: {reason}")]
    Relay { relay: String, reason: String },

    #[error("Failed to publish event to {relay}: {reason}")]
    PublishFailed { relay: String, reason: String },

    #[error("Failed to sign event: {0}")]
    Signing(String),

    #[error("Profile lookup failed: {0}")]
    ProfileLookup(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
