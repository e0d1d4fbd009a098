//! Runs every configured bridge concurrently and shuts them down together

use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{error, info, info_span, warn, Instrument};

use ircnostr_core::BridgeEntry;

use crate::bridge::{Bridge, BridgeServices};

/// Owns the task of every running bridge
pub struct Orchestrator {
    services: BridgeServices,
    tasks: JoinSet<()>,
}

impl Orchestrator {
    pub fn new(services: BridgeServices) -> Self {
        Self {
            services,
            tasks: JoinSet::new(),
        }
    }

    pub fn services(&self) -> &BridgeServices {
        &self.services
    }

    /// Start every valid definition, returning how many were started
    ///
    /// Unparseable entries and invalid definitions are reported and skipped;
    /// they never prevent the other bridges from starting.
    pub fn start(&mut self, entries: &[BridgeEntry]) -> usize {
        let mut started = 0;

        for (index, entry) in entries.iter().enumerate() {
            let bridge = entry
                .definition()
                .and_then(|definition| Bridge::new(definition.clone(), &self.services));
            let bridge = match bridge {
                Ok(bridge) => bridge,
                Err(err) => {
                    error!("Bridge {} not started: {}", index, err);
                    continue;
                }
            };

            let span = info_span!("bridge", id = index, channel = %bridge.definition().irc.channel);
            let restart = self.services.runtime.restart_failed_bridges;
            let delay = self.services.runtime.restart_delay();
            self.tasks.spawn(supervise(bridge, restart, delay).instrument(span));
            started += 1;
        }

        info!("Started {} of {} bridges", started, entries.len());
        started
    }

    /// Number of bridge tasks still running
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every bridge task has ended on its own
    pub async fn wait(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    error!("Bridge task panicked: {}", err);
                }
            }
        }
    }

    /// Stop every bridge and wait up to `grace` for channels to be parted and
    /// connections closed. Returns whether everything closed in time.
    pub async fn shutdown(&mut self, grace: Duration) -> bool {
        info!("Stopping {} bridges", self.tasks.len());
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        let sessions = self.services.sessions.clone();
        let drained = timeout(grace, async move {
            while !sessions.is_idle() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();

        if drained {
            info!("All IRC sessions closed");
        } else {
            warn!("IRC sessions still open after {:?}, exiting anyway", grace);
        }
        drained
    }
}

/// Run a bridge, restarting it after fatal failures when enabled
async fn supervise(bridge: Bridge, restart: bool, delay: Duration) {
    loop {
        match bridge.run().await {
            Ok(()) => {
                info!("Bridge {} finished", bridge.definition().name());
                return;
            }
            Err(err) => {
                error!("Bridge {} failed: {}", bridge.definition().name(), err);
                if !restart {
                    return;
                }
                info!("Restarting bridge in {:?}", delay);
                sleep(delay).await;
            }
        }
    }
}
