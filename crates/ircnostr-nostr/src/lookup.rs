//! Kind-0 profile lookups on dedicated lookup relays

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use nostr_sdk::{Client, Event, Filter, Keys, Kind, PublicKey};
use tracing::{debug, warn};
use url::Url;

use ircnostr_core::{ProfileLookup, Result};

use crate::error::NostrTransportError;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Queries relays for the newest profile of a key
///
/// Relays are added to the client the first time a lookup names them and
/// stay connected afterwards.
pub struct NostrProfileLookup {
    client: Client,
    relays: DashSet<String>,
    query_timeout: Duration,
}

impl Default for NostrProfileLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl NostrProfileLookup {
    pub fn new() -> Self {
        Self {
            client: Client::new(&Keys::generate()),
            relays: DashSet::new(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    async fn add_relays(&self, relays: &[String]) {
        let mut added = false;
        for relay in relays {
            if self.relays.contains(relay) {
                continue;
            }
            let Ok(url) = Url::parse(relay) else {
                warn!("Skipping invalid lookup relay {}", relay);
                continue;
            };
            match self.client.add_relay(url).await {
                Ok(_) => {
                    self.relays.insert(relay.clone());
                    added = true;
                }
                Err(err) => warn!("Failed to add lookup relay {}: {}", relay, err),
            }
        }

        if added {
            self.client.connect().await;
        }
    }
}

#[async_trait]
impl ProfileLookup for NostrProfileLookup {
    async fn lookup_profile(&self, public_key: PublicKey, relays: &[String]) -> Result<Option<Event>> {
        self.add_relays(relays).await;

        let filter = Filter::new().author(public_key).kind(Kind::Metadata).limit(1);
        let events = self
            .client
            .get_events_of(vec![filter], Some(self.query_timeout))
            .await
            .map_err(NostrTransportError::QueryFailed)?;
        debug!("Profile query for {} returned {} events", public_key, events.len());

        // relays may disagree, the newest replaceable event wins
        Ok(events
            .into_iter()
            .filter(|e| e.pubkey == public_key && e.kind == Kind::Metadata)
            .max_by_key(|e| e.created_at))
    }
}
