//! Telegram transport for the companion.
//!
//! When `TELEGRAM_BOT_TOKEN` is set, spawns long-polling tokio tasks that:
//! - Route each text message through the companion and deliver the reply
//!   fragment by fragment, with the typing indicator and human-like delays.
//! - Forward outbound agent events (initiatives, activity notices) to the
//!   authorized chat, or to the last chat that wrote to the bot.
//!
//! Optional: set `TELEGRAM_CHAT_ID` to restrict the bot to a single authorized chat.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use flume::Receiver;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::agent::typing::MessageSink;
use crate::agent::{AgentEvent, Companion};

/// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_CHARS: usize = 4096;
const MEMORIES_SHOWN: usize = 5;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    text: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
}

// ─── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Help,
    Status,
    Mood,
    Memories,
}

/// `/status@my_bot extra` -> `Status`. Unknown commands are treated as text.
fn parse_command(text: &str) -> Option<Command> {
    let first = text.split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or(name).to_lowercase();
    match name.as_str() {
        "start" => Some(Command::Start),
        "help" => Some(Command::Help),
        "status" => Some(Command::Status),
        "mood" => Some(Command::Mood),
        "memories" => Some(Command::Memories),
        _ => None,
    }
}

fn help_text() -> String {
    [
        "Just write to me, I answer like a real person would.",
        "",
        "/status - what I'm doing and how much we've talked",
        "/mood - how I feel right now",
        "/memories - what I remember about you",
        "/help - this message",
    ]
    .join("\n")
}

async fn command_reply(companion: &Companion, command: Command) -> String {
    match command {
        Command::Start => {
            let name = companion
                .persona_name()
                .await
                .unwrap_or_else(|| "your companion".to_string());
            format!("Hi! I'm {} ✨\n\n{}", name, help_text())
        }
        Command::Help => help_text(),
        Command::Status => companion.status_report().await.unwrap_or_else(|e| {
            tracing::warn!("Status report failed: {}", e);
            "I can't check my status right now 😅".to_string()
        }),
        Command::Mood => companion.mood_report().await,
        Command::Memories => companion.memories_report(MEMORIES_SHOWN).unwrap_or_else(|e| {
            tracing::warn!("Memories report failed: {}", e);
            "My memory is foggy right now 😅".to_string()
        }),
    }
}

// ─── Delivery ────────────────────────────────────────────────────────────────

/// One chat as a destination for typed-out fragments.
pub struct TelegramSink {
    client: reqwest::Client,
    api_base: String,
    chat_id: i64,
}

impl TelegramSink {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, chat_id: i64) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            chat_id,
        }
    }
}

#[async_trait]
impl MessageSink for TelegramSink {
    async fn typing(&self) -> Result<()> {
        let url = format!("{}/sendChatAction", self.api_base);
        let payload = serde_json::json!({ "chat_id": self.chat_id, "action": "typing" });
        let resp = self.client.post(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            bail!("sendChatAction failed: HTTP {}", resp.status());
        }
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        send_message(&self.client, &self.api_base, self.chat_id, text).await
    }
}

// ─── Public entry point ───────────────────────────────────────────────────────

/// Spawn the Telegram bot tasks if `TELEGRAM_BOT_TOKEN` is set.
/// Returns `None` (and consumes nothing) when the env var is absent.
pub fn spawn_telegram_bot(
    companion: Arc<Companion>,
    events: Receiver<AgentEvent>,
) -> Option<JoinHandle<()>> {
    let token = match std::env::var("TELEGRAM_BOT_TOKEN") {
        Ok(t) if !t.trim().is_empty() => t.trim().to_string(),
        _ => return None,
    };

    let allowed_chat_id: Option<i64> = std::env::var("TELEGRAM_CHAT_ID")
        .ok()
        .and_then(|s| s.trim().parse().ok());

    let api_base = format!("https://api.telegram.org/bot{}", token);
    let client = reqwest::Client::new();
    let target_chat = Arc::new(RwLock::new(allowed_chat_id));

    tokio::spawn(forward_events(
        companion.clone(),
        events,
        client.clone(),
        api_base.clone(),
        target_chat.clone(),
    ));

    Some(tokio::spawn(async move {
        tracing::info!(
            "Telegram bot active (allowed_chat_id: {:?})",
            allowed_chat_id
        );
        run_bot(companion, client, api_base, allowed_chat_id, target_chat).await;
    }))
}

// ─── Bot loop ─────────────────────────────────────────────────────────────────

async fn run_bot(
    companion: Arc<Companion>,
    client: reqwest::Client,
    api_base: String,
    allowed_chat_id: Option<i64>,
    target_chat: Arc<RwLock<Option<i64>>>,
) {
    let mut offset: i64 = 0;

    loop {
        let updates = match poll_updates(&client, &api_base, offset).await {
            Some(u) => u,
            None => continue,
        };

        for update in updates {
            offset = update.update_id + 1;

            let msg = match update.message {
                Some(m) => m,
                None => continue,
            };

            let chat_id = msg.chat.id;

            if let Some(allowed) = allowed_chat_id {
                if chat_id != allowed {
                    tracing::debug!(
                        "Telegram: ignoring message from unauthorized chat {}",
                        chat_id
                    );
                    continue;
                }
            }

            let text = match msg.text {
                Some(t) if !t.trim().is_empty() => t.trim().to_string(),
                _ => continue,
            };

            *target_chat.write().await = Some(chat_id);
            tracing::info!("Telegram [chat {}]: {:?}", chat_id, text);

            let sink = TelegramSink::new(client.clone(), api_base.clone(), chat_id);

            if let Some(command) = parse_command(&text) {
                let reply = command_reply(&companion, command).await;
                if let Err(e) = sink.send(&reply).await {
                    tracing::error!("Telegram: failed to answer {:?}: {}", command, e);
                }
                continue;
            }

            if let Err(e) = sink.typing().await {
                tracing::debug!("Telegram: typing indicator failed: {}", e);
            }
            let replies = companion.process_user_message(&text).await;
            if let Err(e) = companion.deliver(&sink, &replies).await {
                tracing::error!("Telegram: failed to deliver reply to chat {}: {}", chat_id, e);
            }
        }
    }
}

async fn forward_events(
    companion: Arc<Companion>,
    events: Receiver<AgentEvent>,
    client: reqwest::Client,
    api_base: String,
    target_chat: Arc<RwLock<Option<i64>>>,
) {
    while let Ok(event) = events.recv_async().await {
        match event {
            AgentEvent::Outbound { kind, messages } => {
                let Some(chat_id) = *target_chat.read().await else {
                    tracing::debug!("Telegram: no chat yet, dropping {} messages", kind.as_str());
                    continue;
                };
                let sink = TelegramSink::new(client.clone(), api_base.clone(), chat_id);
                if let Err(e) = companion.deliver(&sink, &messages).await {
                    tracing::warn!("Telegram: failed to send {}: {}", kind.as_str(), e);
                }
            }
            AgentEvent::Observation(text) => tracing::debug!("Companion: {}", text),
            AgentEvent::Error(text) => tracing::warn!("Companion error: {}", text),
        }
    }
    tracing::info!("Telegram: event channel closed");
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn poll_updates(
    client: &reqwest::Client,
    api_base: &str,
    offset: i64,
) -> Option<Vec<Update>> {
    let url = format!("{}/getUpdates", api_base);
    let params = serde_json::json!({
        "offset": offset,
        "timeout": 30,
        "allowed_updates": ["message"]
    });

    let resp = match client.post(&url).json(&params).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Telegram getUpdates error: {}", e);
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            return None;
        }
    };

    let body: TelegramResponse<Vec<Update>> = match resp.json().await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Telegram getUpdates parse error: {}", e);
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            return None;
        }
    };

    if !body.ok {
        tracing::warn!("Telegram API returned ok=false");
        tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
        return None;
    }

    Some(body.result.unwrap_or_default())
}

fn clip_message(text: &str) -> &str {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

async fn send_message(
    client: &reqwest::Client,
    api_base: &str,
    chat_id: i64,
    text: &str,
) -> Result<()> {
    let url = format!("{}/sendMessage", api_base);
    let payload = serde_json::json!({ "chat_id": chat_id, "text": clip_message(text) });

    let resp = client.post(&url).json(&payload).send().await?;
    if !resp.status().is_success() {
        bail!("Telegram sendMessage failed: HTTP {}", resp.status());
    }
    tracing::debug!("Telegram: sent message to chat {}", chat_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_recognised() {
        assert_eq!(parse_command("/start"), Some(Command::Start));
        assert_eq!(parse_command("/Status@companion_bot now"), Some(Command::Status));
        assert_eq!(parse_command("/memories"), Some(Command::Memories));
        assert_eq!(parse_command("/dance"), None);
        assert_eq!(parse_command("hello /mood"), None);
    }

    #[test]
    fn long_messages_are_clipped_on_char_boundaries() {
        let short = "привет";
        assert_eq!(clip_message(short), short);

        let long = "ж".repeat(MAX_MESSAGE_CHARS + 10);
        let clipped = clip_message(&long);
        assert_eq!(clipped.chars().count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn updates_deserialize() {
        let raw = r#"{"ok":true,"result":[{"update_id":7,"message":{"chat":{"id":42},"text":"hi"}},{"update_id":8}]}"#;
        let body: TelegramResponse<Vec<Update>> = serde_json::from_str(raw).expect("parse");
        assert!(body.ok);
        let updates = body.result.expect("result");
        assert_eq!(updates.len(), 2);
        let message = updates[0].message.as_ref().expect("message");
        assert_eq!(message.chat.id, 42);
        assert_eq!(message.text.as_deref(), Some("hi"));
        assert!(updates[1].message.is_none());
    }
}
