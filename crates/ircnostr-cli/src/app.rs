//! Application wiring: real IRC and Nostr collaborators plus the orchestrator

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use ircnostr_core::events::decode_nsec;
use ircnostr_core::nostr_sdk::ToBech32;
use ircnostr_core::AppConfig;
use ircnostr_irc::IrcClient;
use ircnostr_nostr::{NostrProfileLookup, NostrRelayPool};
use ircnostr_runtime::{BridgeServices, Orchestrator};

/// The running bridge process
pub struct BridgeApp {
    config: AppConfig,
    orchestrator: Orchestrator,
}

impl BridgeApp {
    pub fn new(config: AppConfig) -> Self {
        let runtime = &config.runtime;
        let chat = IrcClient::with_timeouts(runtime.irc_registration_timeout(), runtime.irc_join_timeout());
        let lookup = NostrProfileLookup::new().with_query_timeout(runtime.profile_query_timeout());
        let services = BridgeServices::new(
            Arc::new(chat),
            Arc::new(NostrRelayPool::new()),
            Arc::new(lookup),
            &config,
        );

        Self {
            config,
            orchestrator: Orchestrator::new(services),
        }
    }

    /// Start every bridge, failing only if none could be started
    pub fn start(&mut self) -> anyhow::Result<usize> {
        let started = self.orchestrator.start(&self.config.bridges);
        if started == 0 {
            anyhow::bail!("None of the {} configured bridges could be started", self.config.bridges.len());
        }
        Ok(started)
    }

    /// Run until Ctrl-C or until every bridge stopped, then shut down
    pub async fn run_until_shutdown(&mut self, grace: Duration) -> anyhow::Result<()> {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down...");
            }
            _ = self.orchestrator.wait() => {
                warn!("Every bridge has stopped");
            }
        }

        self.orchestrator.shutdown(grace).await;
        Ok(())
    }
}

/// Validate every bridge definition without connecting anywhere.
/// Returns one report line per bridge and whether all of them are usable.
pub fn check(config: &AppConfig) -> (Vec<String>, bool) {
    let mut all_valid = true;
    let lines = config
        .bridges
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let identity = entry.definition().and_then(|bridge| {
                bridge.validate()?;
                let keys = decode_nsec(&bridge.name(), &bridge.nostr.nsec)?;
                Ok((bridge.name(), keys))
            });
            match identity {
                Ok((name, keys)) => format!(
                    "[{}] {} as {}",
                    index,
                    name,
                    keys.public_key().to_bech32().unwrap_or_else(|_| keys.public_key().to_hex())
                ),
                Err(err) => {
                    all_valid = false;
                    format!("[{}] invalid: {}", index, err)
                }
            }
        })
        .collect();
    (lines, all_valid)
}
