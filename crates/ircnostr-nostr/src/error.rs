//! Error types for the Nostr transport

use ircnostr_core::BridgeError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the Nostr transport
#[derive(Error, Debug)]
pub enum NostrTransportError {
    #[error("Failed to connect to relay: {relay} - {source}")]
    RelayConnectionFailed {
        relay: String,
        #[source]
        source: nostr_sdk::client::Error,
    },

    #[error("Failed to send event to {relay}: {source}")]
    EventSendFailed {
        relay: String,
        #[source]
        source: nostr_sdk::client::Error,
    },

    #[error("Profile query failed: {0}")]
    QueryFailed(#[source] nostr_sdk::client::Error),

    #[error("Invalid relay URL: {url}")]
    InvalidRelayUrl { url: String },

    #[error("Relay pool for {relay} shut down")]
    Shutdown { relay: String },
}

impl From<NostrTransportError> for BridgeError {
    fn from(err: NostrTransportError) -> Self {
        match err {
            NostrTransportError::RelayConnectionFailed { ref relay, .. }
            | NostrTransportError::Shutdown { ref relay } => BridgeError::Relay {
                relay: relay.clone(),
                reason: err.to_string(),
            },
            NostrTransportError::EventSendFailed { ref relay, ref source } => {
                BridgeError::PublishFailed {
                    relay: relay.clone(),
                    reason: source.to_string(),
                }
            }
            NostrTransportError::QueryFailed(ref source) => {
                BridgeError::ProfileLookup(source.to_string())
            }
            NostrTransportError::InvalidRelayUrl { .. } => BridgeError::Config(err.to_string()),
        }
    }
}
