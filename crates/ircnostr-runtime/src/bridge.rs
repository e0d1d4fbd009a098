//! One bridge: an IRC channel paired with a Nostr channel topic

use std::sync::Arc;

use nostr_sdk::PublicKey;
use tracing::info;

use ircnostr_core::events::{channel_filter, decode_nsec};
use ircnostr_core::{
    AppConfig, BridgeDefinition, ChatClient, ProfileLookup, RelayProvider, Result, RuntimeConfig,
};

use crate::forward::{announce_profile, irc_to_nostr, nostr_to_irc, BridgeContext};
use crate::multiplexer::ConnectionMultiplexer;
use crate::profile::ProfileResolver;
use crate::session::SessionManager;
use crate::subscription::EventSubscription;

/// Process-wide services shared by every bridge
#[derive(Clone)]
pub struct BridgeServices {
    pub sessions: SessionManager,
    pub resolver: Arc<ProfileResolver>,
    pub relays: Arc<dyn RelayProvider>,
    pub runtime: RuntimeConfig,
}

impl BridgeServices {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        relays: Arc<dyn RelayProvider>,
        lookup: Arc<dyn ProfileLookup>,
        config: &AppConfig,
    ) -> Self {
        let runtime = config.runtime.clone();
        let multiplexer = ConnectionMultiplexer::new(
            chat,
            runtime.connect_attempts,
            runtime.connect_retry_delay(),
        );

        Self {
            sessions: SessionManager::new(multiplexer),
            resolver: Arc::new(ProfileResolver::new(lookup, config.lookup_relays.clone())),
            relays,
            runtime,
        }
    }
}

/// A validated bridge, ready to run
pub struct Bridge {
    context: BridgeContext,
    sessions: SessionManager,
    runtime: RuntimeConfig,
}

impl Bridge {
    /// Validate `definition` and derive the bridge identity
    ///
    /// A malformed definition or key only affects this bridge.
    pub fn new(definition: BridgeDefinition, services: &BridgeServices) -> Result<Self> {
        definition.validate()?;
        let keys = decode_nsec(&definition.name(), &definition.nostr.nsec)?;
        let relay = services.relays.relay(&definition.nostr.relay)?;

        Ok(Self {
            context: BridgeContext {
                definition: Arc::new(definition),
                keys,
                relay,
                resolver: services.resolver.clone(),
                colorize: services.runtime.colorize_names,
            },
            sessions: services.sessions.clone(),
            runtime: services.runtime.clone(),
        })
    }

    pub fn definition(&self) -> &BridgeDefinition {
        &self.context.definition
    }

    pub fn public_key(&self) -> PublicKey {
        self.context.keys.public_key()
    }

    /// Run both directions until the channel can no longer be joined
    ///
    /// Dropping the returned future leaves the channel, and closes the IRC
    /// connection if no other bridge uses it.
    pub async fn run(&self) -> Result<()> {
        let definition = &self.context.definition;
        info!("Starting bridge {}", definition.name());

        let session = self
            .sessions
            .join(definition.irc.connection_key(), &definition.irc.channel);

        let events = EventSubscription::new(
            self.context.relay.clone(),
            channel_filter(&definition.nostr.channel),
            self.public_key(),
            self.runtime.subscription_retry_delay(),
            self.runtime.seen_event_window,
        )
        .into_stream();

        tokio::try_join!(
            announce_profile(&self.context),
            nostr_to_irc(&self.context, events, session.watch()),
            irc_to_nostr(&self.context, session.watch()),
        )?;

        drop(session);
        Ok(())
    }
}
