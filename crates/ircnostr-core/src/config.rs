//! Bridge configuration
//!
//! Configuration is read from a TOML file holding an ordered list of bridge
//! definitions plus process-wide runtime tuning:
//!
//! ```toml
//! lookup_relays = ["wss://purplepag.es"]
//!
//! [runtime]
//! subscription_retry_secs = 10
//!
//! [[bridges]]
//! [bridges.irc]
//! server = "irc.example.com"
//! port = 6697
//! secure = true
//! nick = "nostr-bridge"
//! channel = "#example-channel"
//! [bridges.nostr]
//! nsec = "nsec1..."
//! relay = "wss://relay.example.com"
//! channel = "example-channel"
//! ```

use std::path::Path;
use std::time::Duration;

use nostr_sdk::Metadata;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::error::{BridgeError, Result};
use crate::types::{irc_uri, ConnectionKey};

/// Relays queried for kind-0 profiles that are not cached yet
pub const DEFAULT_LOOKUP_RELAYS: &[&str] = &["wss://purplepag.es"];

// ----------------------------------------------------------------------------
// Bridge Definitions
// ----------------------------------------------------------------------------

/// IRC side of a bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrcSettings {
    /// IRC server to connect to
    pub server: String,
    /// IRC port to connect to
    pub port: u16,
    /// Whether to use TLS
    pub secure: bool,
    /// IRC nick to use
    pub nick: String,
    /// IRC channel to join, including the `#`
    pub channel: String,
}

impl IrcSettings {
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey::new(self.server.clone(), self.nick.clone(), self.secure, self.port)
    }

    /// `ircs://server:port/#channel`
    pub fn channel_uri(&self) -> String {
        irc_uri(&self.server, self.secure, self.port, Some(&self.channel))
    }
}

/// Nostr side of a bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NostrSettings {
    /// Private key in bech32 `nsec` form
    pub nsec: String,
    /// Relay to subscribe and publish to
    pub relay: String,
    /// Channel topic, without the `#`
    pub channel: String,
    /// Profile to announce when the bridge starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Metadata>,
}

/// One configured pairing of an IRC channel and a Nostr channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeDefinition {
    pub irc: IrcSettings,
    pub nostr: NostrSettings,
}

impl BridgeDefinition {
    /// Short human readable name used in logs
    pub fn name(&self) -> String {
        format!("{} <-> {}#{}", self.irc.channel_uri(), self.nostr.relay, self.nostr.channel)
    }

    /// Check that no required field is empty or malformed
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("irc.server", &self.irc.server),
            ("irc.nick", &self.irc.nick),
            ("irc.channel", &self.irc.channel),
            ("nostr.nsec", &self.nostr.nsec),
            ("nostr.relay", &self.nostr.relay),
            ("nostr.channel", &self.nostr.channel),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(BridgeError::Config(format!("{} must not be empty", field)));
            }
        }

        if self.irc.port == 0 {
            return Err(BridgeError::Config("irc.port must be greater than 0".to_string()));
        }

        Url::parse(&self.nostr.relay).map_err(|e| {
            BridgeError::Config(format!("Invalid relay URL {}: {}", self.nostr.relay, e))
        })?;

        Ok(())
    }
}

/// One `[[bridges]]` table of the configuration file
///
/// Entries are parsed one by one so a table with a missing or mistyped field
/// only disables its own bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEntry {
    Valid(BridgeDefinition),
    Invalid { raw: toml::Value, reason: String },
}

impl BridgeEntry {
    /// The parsed definition, or the reason it could not be parsed
    pub fn definition(&self) -> Result<&BridgeDefinition> {
        match self {
            BridgeEntry::Valid(definition) => Ok(definition),
            BridgeEntry::Invalid { reason, .. } => Err(BridgeError::Config(reason.clone())),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, BridgeEntry::Valid(_))
    }
}

impl From<BridgeDefinition> for BridgeEntry {
    fn from(definition: BridgeDefinition) -> Self {
        BridgeEntry::Valid(definition)
    }
}

impl<'de> Deserialize<'de> for BridgeEntry {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = toml::Value::deserialize(deserializer)?;
        Ok(match BridgeDefinition::deserialize(raw.clone()) {
            Ok(definition) => BridgeEntry::Valid(definition),
            Err(err) => BridgeEntry::Invalid {
                raw,
                reason: format!("Invalid bridge definition: {}", err.message()),
            },
        })
    }
}

impl Serialize for BridgeEntry {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            BridgeEntry::Valid(definition) => definition.serialize(serializer),
            BridgeEntry::Invalid { raw, .. } => raw.serialize(serializer),
        }
    }
}

// ----------------------------------------------------------------------------
// Runtime Configuration
// ----------------------------------------------------------------------------

/// Process-wide tuning for retries, restarts and shutdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Connection attempts before an IRC connection is reported as failed
    pub connect_attempts: u32,
    /// Delay between IRC connection attempts
    pub connect_retry_delay_secs: u64,
    /// Delay before resubscribing to a relay after a failure
    pub subscription_retry_secs: u64,
    /// How long shutdown waits for PART/QUIT to go out
    pub shutdown_grace_secs: u64,
    /// Restart a bridge whose pipeline failed
    pub restart_failed_bridges: bool,
    /// Delay before restarting a failed bridge
    pub restart_delay_secs: u64,
    /// Number of recently delivered event ids remembered for deduplication
    pub seen_event_window: usize,
    /// Wrap forwarded display names in IRC green
    pub colorize_names: bool,
    /// How long an IRC server may take to finish registration
    pub irc_registration_timeout_secs: u64,
    /// How long an IRC server may take to confirm a JOIN
    pub irc_join_timeout_secs: u64,
    /// How long a profile lookup waits for the lookup relays
    pub profile_query_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            connect_retry_delay_secs: 5,
            subscription_retry_secs: 10,
            shutdown_grace_secs: 5,
            restart_failed_bridges: true,
            restart_delay_secs: 10,
            seen_event_window: 1024,
            colorize_names: false,
            irc_registration_timeout_secs: 60,
            irc_join_timeout_secs: 30,
            profile_query_timeout_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_secs)
    }

    pub fn subscription_retry_delay(&self) -> Duration {
        Duration::from_secs(self.subscription_retry_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn irc_registration_timeout(&self) -> Duration {
        Duration::from_secs(self.irc_registration_timeout_secs)
    }

    pub fn irc_join_timeout(&self) -> Duration {
        Duration::from_secs(self.irc_join_timeout_secs)
    }

    pub fn profile_query_timeout(&self) -> Duration {
        Duration::from_secs(self.profile_query_timeout_secs)
    }
}

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

fn default_lookup_relays() -> Vec<String> {
    DEFAULT_LOOKUP_RELAYS.iter().map(|r| r.to_string()).collect()
}

/// Complete configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Relays used to look up unknown profiles
    #[serde(default = "default_lookup_relays")]
    pub lookup_relays: Vec<String>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Bridges, started in order
    #[serde(default)]
    pub bridges: Vec<BridgeEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lookup_relays: default_lookup_relays(),
            runtime: RuntimeConfig::default(),
            bridges: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load and validate a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Process-level validation
    ///
    /// Individual bridge entries are checked when each bridge starts, so one
    /// broken bridge only disables itself.
    pub fn validate(&self) -> Result<()> {
        if self.bridges.is_empty() {
            return Err(BridgeError::Config("At least one bridge must be configured".to_string()));
        }

        for relay in &self.lookup_relays {
            Url::parse(relay)
                .map_err(|e| BridgeError::Config(format!("Invalid lookup relay {}: {}", relay, e)))?;
        }

        if self.runtime.connect_attempts == 0 {
            return Err(BridgeError::Config(
                "runtime.connect_attempts must be greater than 0".to_string(),
            ));
        }

        let timeouts = [
            ("irc_registration_timeout_secs", self.runtime.irc_registration_timeout_secs),
            ("irc_join_timeout_secs", self.runtime.irc_join_timeout_secs),
            ("profile_query_timeout_secs", self.runtime.profile_query_timeout_secs),
        ];
        for (field, secs) in timeouts {
            if secs == 0 {
                return Err(BridgeError::Config(format!("runtime.{} must be greater than 0", field)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
[[bridges]]
[bridges.irc]
server = "irc.example.com"
port = 6697
secure = true
nick = "nostr-bridge"
channel = "#example-channel"

[bridges.nostr]
nsec = "nsec1vl029mgpspedva04g90vltkh6fvh240zqtv9k0t9af8935ke9laqsnlfe5"
relay = "wss://relay.example.com"
channel = "example-channel"

[bridges.nostr.profile]
name = "irc-bridge"
display_name = "IRC Bridge"
"##;

    #[test]
    fn test_parse_sample_config() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.bridges.len(), 1);
        assert!(config.bridges[0].is_valid());
        assert_eq!(config.lookup_relays, vec!["wss://purplepag.es".to_string()]);
        assert_eq!(config.runtime, RuntimeConfig::default());

        let bridge = config.bridges[0].definition().unwrap();
        assert_eq!(bridge.irc.port, 6697);
        assert_eq!(bridge.irc.channel_uri(), "ircs://irc.example.com:6697/#example-channel");
        let profile = bridge.nostr.profile.as_ref().unwrap();
        assert_eq!(profile.name.as_deref(), Some("irc-bridge"));
        assert_eq!(profile.display_name.as_deref(), Some("IRC Bridge"));
    }

    #[test]
    fn test_runtime_overrides() {
        let raw = format!(
            "[runtime]\nsubscription_retry_secs = 3\nrestart_failed_bridges = false\nirc_join_timeout_secs = 7\n{}",
            SAMPLE
        );
        let config = AppConfig::from_toml(&raw).unwrap();
        assert_eq!(config.runtime.subscription_retry_delay(), Duration::from_secs(3));
        assert!(!config.runtime.restart_failed_bridges);
        assert_eq!(config.runtime.irc_join_timeout(), Duration::from_secs(7));
        assert_eq!(config.runtime.connect_attempts, 10);
        assert_eq!(config.runtime.irc_registration_timeout(), Duration::from_secs(60));
        assert_eq!(config.runtime.profile_query_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let raw = format!("[runtime]\nprofile_query_timeout_secs = 0\n{}", SAMPLE);
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(matches!(err, BridgeError::Config(ref msg) if msg.contains("profile_query_timeout_secs")));
    }

    #[test]
    fn test_empty_bridge_list_rejected() {
        let err = AppConfig::from_toml("lookup_relays = []").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_missing_field_only_disables_that_bridge() {
        let broken = SAMPLE
            .replace("nick = \"nostr-bridge\"\n", "")
            .replace("#example-channel", "#other-channel");
        let raw = format!("{}\n{}", SAMPLE, broken);
        let config = AppConfig::from_toml(&raw).unwrap();
        assert_eq!(config.bridges.len(), 2);

        let first = config.bridges[0].definition().unwrap();
        assert_eq!(first.irc.channel, "#example-channel");

        assert!(!config.bridges[1].is_valid());
        match config.bridges[1].definition() {
            Err(BridgeError::Config(reason)) => assert!(reason.contains("nick"), "{}", reason),
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_unparseable_file_rejected() {
        let raw = SAMPLE.replace("port = 6697", "port = ");
        assert!(AppConfig::from_toml(&raw).is_err());
    }

    #[test]
    fn test_bridge_validation() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let mut bridge = config.bridges[0].definition().unwrap().clone();
        assert!(bridge.validate().is_ok());

        bridge.irc.port = 0;
        assert!(bridge.validate().is_err());

        let mut bridge = config.bridges[0].definition().unwrap().clone();
        bridge.nostr.relay = "not a url".to_string();
        assert!(bridge.validate().is_err());

        let mut bridge = config.bridges[0].definition().unwrap().clone();
        bridge.irc.nick = "  ".to_string();
        assert!(bridge.validate().is_err());
    }

    #[test]
    fn test_connection_key_from_settings() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let key = config.bridges[0].definition().unwrap().irc.connection_key();
        assert_eq!(key, ConnectionKey::new("irc.example.com", "nostr-bridge", true, 6697));
    }
}
