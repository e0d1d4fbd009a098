//! Profile resolution with a process-lifetime cache
//!
//! Profiles are kind-0 replaceable events. The [`ProfileStore`] keeps the
//! newest one seen per author; the [`ProfileResolver`] answers from the store
//! and falls back to a network lookup for authors it has never seen.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nostr_sdk::{Event, Kind, Metadata, PublicKey};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ircnostr_core::events::parse_profile;
use ircnostr_core::ProfileLookup;

// ----------------------------------------------------------------------------
// Profile Store
// ----------------------------------------------------------------------------

/// Newest profile event per author
#[derive(Debug, Default)]
pub struct ProfileStore {
    events: DashMap<PublicKey, Event>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a profile event unless a newer one is already known.
    /// Returns whether the event was stored.
    pub fn insert(&self, event: Event) -> bool {
        if event.kind != Kind::Metadata {
            return false;
        }

        match self.events.entry(event.pubkey) {
            Entry::Occupied(mut existing) => {
                if existing.get().created_at >= event.created_at {
                    return false;
                }
                existing.insert(event);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(event);
            }
        }
        true
    }

    pub fn has(&self, public_key: &PublicKey) -> bool {
        self.events.contains_key(public_key)
    }

    /// Parsed metadata of the stored profile
    pub fn metadata(&self, public_key: &PublicKey) -> Option<Metadata> {
        self.events.get(public_key).and_then(|e| parse_profile(e.value()))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Profile Resolver
// ----------------------------------------------------------------------------

/// Resolves authors to profiles, looking each one up at most once
pub struct ProfileResolver {
    store: Arc<ProfileStore>,
    lookup: Arc<dyn ProfileLookup>,
    lookup_relays: Vec<String>,
    in_flight: DashMap<PublicKey, Arc<Mutex<()>>>,
}

impl ProfileResolver {
    pub fn new(lookup: Arc<dyn ProfileLookup>, lookup_relays: Vec<String>) -> Self {
        Self {
            store: Arc::new(ProfileStore::new()),
            lookup,
            lookup_relays,
            in_flight: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    /// Resolve the profile of `public_key`
    ///
    /// `pointer_relays` are relays the author is known to use; they are asked
    /// along with the lookup relays. Concurrent calls for the same author
    /// share one lookup. `None` means no profile could be found; that outcome
    /// is not cached.
    pub async fn resolve(&self, public_key: PublicKey, pointer_relays: &[String]) -> Option<Metadata> {
        if let Some(metadata) = self.store.metadata(&public_key) {
            return Some(metadata);
        }

        let gate = self.in_flight.entry(public_key).or_default().clone();
        let result = {
            let _guard = gate.lock().await;
            match self.store.metadata(&public_key) {
                Some(metadata) => Some(metadata),
                None => self.fetch(public_key, pointer_relays).await,
            }
        };

        // the map and this call hold the only references when nobody waits
        self.in_flight
            .remove_if(&public_key, |_, g| Arc::strong_count(g) <= 2);
        result
    }

    async fn fetch(&self, public_key: PublicKey, pointer_relays: &[String]) -> Option<Metadata> {
        let mut relays = self.lookup_relays.clone();
        for relay in pointer_relays {
            if !relays.contains(relay) {
                relays.push(relay.clone());
            }
        }

        match self.lookup.lookup_profile(public_key, &relays).await {
            Ok(Some(event)) if event.pubkey == public_key => {
                let metadata = parse_profile(&event);
                self.store.insert(event);
                info!("Loaded profile for {}", public_key);
                metadata
            }
            Ok(Some(event)) => {
                warn!("Lookup for {} returned a profile by {}", public_key, event.pubkey);
                None
            }
            Ok(None) => {
                debug!("No profile found for {}", public_key);
                None
            }
            Err(err) => {
                warn!("Profile lookup for {} failed: {}", public_key, err);
                None
            }
        }
    }
}
