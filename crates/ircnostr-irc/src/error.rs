//! Error types for the IRC transport

use ircnostr_core::BridgeError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the IRC transport
#[derive(Error, Debug)]
pub enum IrcTransportError {
    #[error("Failed to connect to {server}: {source}")]
    ConnectionFailed {
        server: String,
        #[source]
        source: irc::error::Error,
    },

    #[error("Registration with {server} timed out")]
    RegistrationTimeout { server: String },

    #[error("Connection to {server} closed during registration")]
    ClosedDuringRegistration { server: String },

    #[error("Failed to send to {target}: {source}")]
    SendFailed {
        target: String,
        #[source]
        source: irc::error::Error,
    },
}

impl From<IrcTransportError> for BridgeError {
    fn from(err: IrcTransportError) -> Self {
        match err {
            IrcTransportError::ConnectionFailed { ref server, .. }
            | IrcTransportError::RegistrationTimeout { ref server }
            | IrcTransportError::ClosedDuringRegistration { ref server } => {
                BridgeError::ConnectionFailed {
                    key: server.clone(),
                    reason: err.to_string(),
                }
            }
            IrcTransportError::SendFailed { ref target, ref source } => BridgeError::SendFailed {
                target: target.clone(),
                reason: source.to_string(),
            },
        }
    }
}
