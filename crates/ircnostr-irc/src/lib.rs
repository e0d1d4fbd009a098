//! IRC side of the bridge
//!
//! Implements the `ChatClient`/`ChatConnection` traits from `ircnostr-core`
//! on top of the `irc` crate. One [`IrcConnection`] is one registered
//! connection to one server; a background task reads the server stream and
//! dispatches channel messages, join confirmations and registration events.

pub mod client;
pub mod error;

pub use client::{IrcClient, IrcConnection};
pub use error::IrcTransportError;
