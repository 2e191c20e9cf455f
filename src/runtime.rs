use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::task::JoinHandle;

use crate::agent::{AgentEvent, Companion};
use crate::config::AgentConfig;

pub struct CompanionRuntime {
    pub config: AgentConfig,
    pub companion: Arc<Companion>,
}

impl CompanionRuntime {
    pub fn bootstrap(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        let companion = Companion::new(config.clone(), event_tx)
            .context("failed to initialize the companion")?;

        let initiative = if config.enable_initiative { "on" } else { "off" };
        let consolidation = if config.enable_consolidation { "on" } else { "off" };
        tracing::info!(
            "Companion ready: model {}, tick {}s, initiative {}, consolidation {}",
            config.llm_model,
            config.tick_secs,
            initiative,
            consolidation
        );

        Ok(Self {
            config,
            companion: Arc::new(companion),
        })
    }

    /// Start the periodic loop on the current tokio runtime.
    pub fn spawn_companion_loop(&self) -> JoinHandle<()> {
        let companion = self.companion.clone();
        tokio::spawn(async move {
            if let Err(e) = companion.run_loop().await {
                tracing::error!("Companion loop error: {}", e);
            }
        })
    }
}
