//! Nostr event construction for the bridge
//!
//! Chat lines travel as ephemeral kind-23333 events tagged with the channel
//! topic in a `d` tag. Profiles are regular kind-0 metadata events.

use nostr_sdk::prelude::*;
use nostr_sdk::{Event, EventBuilder, Filter, Keys, Kind, Metadata, PublicKey, SecretKey, Tag};

use crate::error::{BridgeError, Result};

/// Event kind used for bridged chat lines
pub const EPHEMERAL_CHAT_KIND: Kind = Kind::Custom(23333);

/// Display name used when a sender has no usable profile
pub const ANONYMOUS_NAME: &str = "anon";

/// Content of the marker published after a profile announcement
pub const CHANNEL_ACTIVE_MESSAGE: &str = "Starting IRC bridge";

const IRC_GREEN: &str = "\u{3}03";
const IRC_RESET: &str = "\u{f}";

// ----------------------------------------------------------------------------
// Keys
// ----------------------------------------------------------------------------

/// Decode a bech32 `nsec` into signing keys
pub fn decode_nsec(bridge: &str, nsec: &str) -> Result<Keys> {
    let secret_key = SecretKey::from_bech32(nsec.trim()).map_err(|e| BridgeError::InvalidKey {
        bridge: bridge.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Keys::new(secret_key))
}

/// Sign a draft event
pub fn sign(builder: EventBuilder, keys: &Keys) -> Result<Event> {
    builder
        .to_event(keys)
        .map_err(|e| BridgeError::Signing(e.to_string()))
}

// ----------------------------------------------------------------------------
// Drafts
// ----------------------------------------------------------------------------

/// Subscription filter for chat lines in a channel topic
pub fn channel_filter(topic: &str) -> Filter {
    Filter::new().kind(EPHEMERAL_CHAT_KIND).identifier(topic)
}

/// Draft chat line event for a channel topic
pub fn chat_event(topic: &str, content: impl Into<String>) -> EventBuilder {
    EventBuilder::new(EPHEMERAL_CHAT_KIND, content, [Tag::identifier(topic)])
}

/// Draft for a line relayed from IRC, attributed to its sender
pub fn relayed_chat_event(topic: &str, sender: &str, text: &str) -> EventBuilder {
    chat_event(topic, format!("{}: {}", sender, text))
}

/// Draft announcing that the bridge joined its IRC channel
pub fn bridge_started_event(topic: &str, channel_uri: &str) -> EventBuilder {
    chat_event(topic, format!("Started bridge to {}", channel_uri))
}

/// Draft marking the channel as active after a profile announcement
pub fn channel_active_event(topic: &str) -> EventBuilder {
    chat_event(topic, CHANNEL_ACTIVE_MESSAGE)
}

/// Draft kind-0 profile event
pub fn profile_event(metadata: &Metadata) -> EventBuilder {
    EventBuilder::metadata(metadata)
}

// ----------------------------------------------------------------------------
// Profiles
// ----------------------------------------------------------------------------

/// Parse the metadata carried by a kind-0 event
pub fn parse_profile(event: &Event) -> Option<Metadata> {
    if event.kind != Kind::Metadata {
        return None;
    }
    Metadata::from_json(&event.content).ok()
}

/// Pick the name to show for a profile: `display_name`, then `name`, then
/// the fallback
pub fn display_name(profile: Option<&Metadata>, fallback: &str) -> String {
    profile
        .and_then(|p| {
            p.display_name
                .as_deref()
                .filter(|n| !n.trim().is_empty())
                .or_else(|| p.name.as_deref().filter(|n| !n.trim().is_empty()))
        })
        .unwrap_or(fallback)
        .to_string()
}

/// Format a Nostr event as an IRC line
pub fn irc_line(name: &str, content: &str, colorize: bool) -> String {
    if colorize {
        format!("{}{}{}: {}", IRC_GREEN, name, IRC_RESET, content)
    } else {
        format!("{}: {}", name, content)
    }
}

/// Whether an event was authored by `own` and must not be echoed back
pub fn is_own_event(event: &Event, own: &PublicKey) -> bool {
    event.pubkey == *own
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_nsec_roundtrip() {
        let keys = Keys::generate();
        let nsec = keys.secret_key().unwrap().to_bech32().unwrap();
        let decoded = decode_nsec("test", &nsec).unwrap();
        assert_eq!(decoded.public_key(), keys.public_key());
    }

    #[test]
    fn test_decode_nsec_rejects_garbage() {
        let err = decode_nsec("test", "nsec1e20zg....").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidKey { ref bridge, .. } if bridge == "test"));

        // an npub is valid bech32 but not a secret key
        let npub = Keys::generate().public_key().to_bech32().unwrap();
        assert!(decode_nsec("test", &npub).is_err());
    }

    #[test]
    fn test_relayed_chat_event() {
        let keys = Keys::generate();
        let event = sign(relayed_chat_event("example-channel", "bob", "hi"), &keys).unwrap();
        assert_eq!(event.kind, EPHEMERAL_CHAT_KIND);
        assert_eq!(event.content, "bob: hi");
        assert_eq!(event.identifier(), Some("example-channel"));
        assert_eq!(event.pubkey, keys.public_key());
        assert!(event.verify().is_ok());
    }

    #[test]
    fn test_bridge_started_event() {
        let keys = Keys::generate();
        let event = sign(
            bridge_started_event("topic", "ircs://irc.example.com:6697/#topic"),
            &keys,
        )
        .unwrap();
        assert_eq!(event.content, "Started bridge to ircs://irc.example.com:6697/#topic");
        assert_eq!(event.identifier(), Some("topic"));
    }

    #[test]
    fn test_profile_roundtrip() {
        let keys = Keys::generate();
        let metadata = Metadata::new().name("irc-bridge").display_name("IRC Bridge");
        let event = sign(profile_event(&metadata), &keys).unwrap();
        assert_eq!(event.kind, Kind::Metadata);
        assert!(event.tags.is_empty());

        let parsed = parse_profile(&event).unwrap();
        assert_eq!(parsed.display_name.as_deref(), Some("IRC Bridge"));

        let chat = sign(chat_event("topic", "{}"), &keys).unwrap();
        assert!(parse_profile(&chat).is_none());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let full = Metadata::new().name("alice").display_name("Alice");
        assert_eq!(display_name(Some(&full), ANONYMOUS_NAME), "Alice");

        let name_only = Metadata::new().name("alice");
        assert_eq!(display_name(Some(&name_only), ANONYMOUS_NAME), "alice");

        let blank = Metadata::new().display_name(" ");
        assert_eq!(display_name(Some(&blank), ANONYMOUS_NAME), "anon");
        assert_eq!(display_name(None, ANONYMOUS_NAME), "anon");
    }

    #[test]
    fn test_irc_line() {
        assert_eq!(irc_line("Alice", "hello", false), "Alice: hello");
        assert_eq!(irc_line("Alice", "hello", true), "\u{3}03Alice\u{f}: hello");
    }

    #[test]
    fn test_own_event_detection() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let event = sign(chat_event("topic", "hello"), &keys).unwrap();
        assert!(is_own_event(&event, &keys.public_key()));
        assert!(!is_own_event(&event, &other.public_key()));
    }
}
