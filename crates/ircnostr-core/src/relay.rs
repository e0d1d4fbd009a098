//! Nostr collaborator interface
//!
//! Relay traffic goes through [`RelayClient`] and profile lookups through
//! [`ProfileLookup`]. Signing is local and uses `nostr-sdk` directly (see
//! [`crate::events`]).

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use nostr_sdk::{Event, Filter, PublicKey};

use crate::error::Result;

/// Events delivered by a relay subscription. An `Err` item or the end of the
/// stream means the subscription is gone.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// A connection to a single relay
#[async_trait]
pub trait RelayClient: Send + Sync + 'static {
    /// Relay URL
    fn url(&self) -> &str;

    /// Open a subscription
    async fn subscribe(&self, filter: Filter) -> Result<EventStream>;

    /// Publish a signed event, returning once the relay accepted it
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Network lookup of kind-0 profile events
#[async_trait]
pub trait ProfileLookup: Send + Sync + 'static {
    /// Fetch the newest profile event of `public_key` from the lookup relays
    /// and the given pointer relays. `Ok(None)` means no relay had one.
    async fn lookup_profile(&self, public_key: PublicKey, relays: &[String]) -> Result<Option<Event>>;
}

/// Hands out one shared [`RelayClient`] per relay URL
pub trait RelayProvider: Send + Sync + 'static {
    fn relay(&self, url: &str) -> Result<Arc<dyn RelayClient>>;
}
