//! Directional message pipelines
//!
//! - Nostr to IRC: events are forwarded concurrently, each one waiting for
//!   its author's profile and for a joined channel
//! - IRC to Nostr: channel messages are signed and published one at a time,
//!   in the order they were received
//!
//! A failure to deliver a single message is logged and the message dropped;
//! only a session that can no longer be established ends a pipeline.

use std::sync::Arc;

use futures::stream::{Stream, StreamExt, TryStreamExt};
use nostr_sdk::{Event, EventBuilder, Keys};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use ircnostr_core::events::{
    bridge_started_event, channel_active_event, display_name, irc_line, profile_event,
    relayed_chat_event, sign,
};
use ircnostr_core::{
    BridgeDefinition, BridgeError, ChatMessage, RelayClient, Result, ANONYMOUS_NAME,
};

use crate::profile::ProfileResolver;
use crate::registry::{wait_ready, Shared, SharedWatch};
use crate::session::ChannelSession;

/// Everything a bridge's pipelines share
pub struct BridgeContext {
    pub definition: Arc<BridgeDefinition>,
    pub keys: Keys,
    pub relay: Arc<dyn RelayClient>,
    pub resolver: Arc<ProfileResolver>,
    pub colorize: bool,
}

impl BridgeContext {
    /// Sign and publish a draft, logging instead of failing
    async fn publish(&self, draft: EventBuilder, what: &str) -> bool {
        let event = match sign(draft, &self.keys) {
            Ok(event) => event,
            Err(err) => {
                warn!("Could not sign {}: {}", what, err);
                return false;
            }
        };
        self.publish_signed(event, what).await
    }

    async fn publish_signed(&self, event: Event, what: &str) -> bool {
        let id = event.id;
        match self.relay.publish(event).await {
            Ok(()) => {
                debug!("Published {} {} to {}", what, id, self.relay.url());
                true
            }
            Err(err) => {
                warn!("Dropping {}: {}", what, err);
                false
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Nostr to IRC
// ----------------------------------------------------------------------------

/// Forward every event of `events` into the channel
///
/// Returns only when the channel session failed for good, or when `events`
/// ends.
pub async fn nostr_to_irc<S>(
    ctx: &BridgeContext,
    events: S,
    session: SharedWatch<ChannelSession>,
) -> Result<()>
where
    S: Stream<Item = Event> + Send,
{
    let channel = ctx.definition.irc.channel.as_str();
    let pointer_relays = [ctx.definition.nostr.relay.clone()];
    let session = &session;
    let pointer_relays = &pointer_relays;

    events
        .map(Ok::<Event, BridgeError>)
        .try_for_each_concurrent(None, |event| {
            let mut session = session.clone();
            async move {
                let (profile, ready) = tokio::join!(
                    ctx.resolver.resolve(event.pubkey, pointer_relays),
                    wait_ready(&mut session, channel),
                );
                let session = ready?;

                let name = display_name(profile.as_ref(), ANONYMOUS_NAME);
                let line = irc_line(&name, &event.content, ctx.colorize);
                match session.say(&line).await {
                    Ok(()) => info!("Forwarded event {} from {} to {}", event.id, name, channel),
                    Err(err) => warn!("Dropping event {}: {}", event.id, err),
                }
                Ok(())
            }
        })
        .await
}

// ----------------------------------------------------------------------------
// IRC to Nostr
// ----------------------------------------------------------------------------

/// Publish every channel message to the relay, strictly in order
///
/// Each time the session becomes ready (first join and every re-join after a
/// reconnect) the bridge announces itself before listening again.
pub async fn irc_to_nostr(ctx: &BridgeContext, mut session: SharedWatch<ChannelSession>) -> Result<()> {
    let definition = &ctx.definition;
    let channel = definition.irc.channel.as_str();

    loop {
        let current = wait_ready(&mut session, channel).await?;
        let mut messages = current.messages();
        info!("Bridging {} on {}", channel, definition.irc.server);

        ctx.publish(
            bridge_started_event(&definition.nostr.channel, &definition.irc.channel_uri()),
            "bridge announcement",
        )
        .await;

        let mut upstream_open = true;
        loop {
            tokio::select! {
                changed = session.changed() => {
                    if changed.is_err() {
                        return Err(BridgeError::ConnectionClosed { key: channel.to_string() });
                    }
                    if let Shared::Failed(err) = &*session.borrow() {
                        return Err(err.clone());
                    }
                    debug!("Session for {} changed", channel);
                    break;
                }
                received = messages.recv(), if upstream_open => match received {
                    Ok(message) => forward_chat_message(ctx, message).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} messages in {}", missed, channel);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Message stream for {} closed", channel);
                        upstream_open = false;
                    }
                },
            }
        }
    }
}

async fn forward_chat_message(ctx: &BridgeContext, message: ChatMessage) {
    let definition = &ctx.definition;
    if message.is_from(&definition.irc.nick) {
        debug!("Ignoring own message from {}", message.sender);
        return;
    }

    info!("Message in {} on {}", definition.irc.channel, definition.irc.server);
    let draft = relayed_chat_event(&definition.nostr.channel, &message.sender, &message.text);
    ctx.publish(draft, "chat message").await;
}

// ----------------------------------------------------------------------------
// Profile Announcement
// ----------------------------------------------------------------------------

/// Publish the configured profile followed by the channel-active marker
pub async fn announce_profile(ctx: &BridgeContext) -> Result<()> {
    let Some(metadata) = ctx.definition.nostr.profile.as_ref() else {
        return Ok(());
    };

    let event = match sign(profile_event(metadata), &ctx.keys) {
        Ok(event) => event,
        Err(err) => {
            warn!("Could not sign profile: {}", err);
            return Ok(());
        }
    };
    ctx.resolver.store().insert(event.clone());

    if ctx.publish_signed(event, "profile").await {
        info!("Published nostr profile for {}", ctx.keys.public_key());
    }
    ctx.publish(channel_active_event(&ctx.definition.nostr.channel), "channel marker")
        .await;
    Ok(())
}
