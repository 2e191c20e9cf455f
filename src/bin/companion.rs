use anyhow::{Context, Result};
use companion::agent::AgentEvent;
use companion::config::AgentConfig;
use companion::runtime::CompanionRuntime;
use companion::telegram::spawn_telegram_bot;
use flume::{unbounded, Receiver};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion=debug")),
        )
        .init();

    let config = AgentConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = CompanionRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap companion runtime")?;

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(async {
        let companion_loop = runtime.spawn_companion_loop();

        if spawn_telegram_bot(runtime.companion.clone(), event_rx.clone()).is_none() {
            tracing::warn!("TELEGRAM_BOT_TOKEN is unset; running without a transport");
            tokio::spawn(log_events(event_rx));
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
            }
            result = companion_loop => {
                if let Err(e) = result {
                    tracing::error!("Companion loop task failed: {}", e);
                }
            }
        }
    });
    Ok(())
}

async fn log_events(events: Receiver<AgentEvent>) {
    while let Ok(event) = events.recv_async().await {
        match event {
            AgentEvent::Outbound { kind, messages } => {
                tracing::info!("[{}] {}", kind.as_str(), messages.join(" / "))
            }
            AgentEvent::Observation(text) => tracing::debug!("Companion: {}", text),
            AgentEvent::Error(text) => tracing::warn!("Companion error: {}", text),
        }
    }
}
