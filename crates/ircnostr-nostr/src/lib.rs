//! Nostr side of the bridge
//!
//! Implements the `RelayClient`, `RelayProvider` and `ProfileLookup` traits
//! from `ircnostr-core` with `nostr-sdk`. Each relay URL gets one client that
//! every bridge publishing to or subscribing on that relay shares.

pub mod error;
pub mod lookup;
pub mod relay;

pub use error::NostrTransportError;
pub use lookup::NostrProfileLookup;
pub use relay::{NostrRelay, NostrRelayPool};
