use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;

use crate::config::TypingConfig;

const VARIABILITY: f64 = 0.2;
const PAUSE_BETWEEN_SECS: (f64, f64) = (1.0, 3.0);
const THINKING_SECS: (f64, f64) = (1.5, 4.0);
const LONG_MESSAGE_CHARS: usize = 50;
const LIGHTNING_MAX_TYPING_SECS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    Lightning,
    Fast,
    Normal,
    Slow,
}

impl SpeedMode {
    pub fn wpm(&self) -> f64 {
        match self {
            SpeedMode::Lightning => 200.0,
            SpeedMode::Fast => 100.0,
            SpeedMode::Normal => 60.0,
            SpeedMode::Slow => 40.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedMode::Lightning => "lightning",
            SpeedMode::Fast => "fast",
            SpeedMode::Normal => "normal",
            SpeedMode::Slow => "slow",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "lightning" => SpeedMode::Lightning,
            "fast" => SpeedMode::Fast,
            "normal" => SpeedMode::Normal,
            "slow" => SpeedMode::Slow,
            other => {
                tracing::warn!("Unknown typing mode '{}', using normal", other);
                SpeedMode::Normal
            }
        }
    }
}

/// Where timed messages go. Telegram implements this; tests record calls.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn typing(&self) -> Result<()>;
    async fn send(&self, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessageTiming {
    pub thinking_secs: f64,
    pub typing_secs: f64,
    pub pause_after_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DelayPlan {
    pub message_count: usize,
    pub total_typing_secs: f64,
    pub total_thinking_secs: f64,
    pub total_pause_secs: f64,
    pub total_secs: f64,
    pub mode: SpeedMode,
}

pub fn emotion_modifier(emotion: &str) -> f64 {
    let emotion = emotion.to_lowercase();
    let has = |stems: &[&str]| stems.iter().any(|stem| emotion.contains(stem));

    if has(&["excit", "thrill"]) {
        1.3
    } else if has(&["angry", "anger", "irrit", "frustrat"]) {
        1.4
    } else if has(&["happy", "joy", "glad", "content"]) {
        1.2
    } else if has(&["sad", "melanchol"]) {
        0.8
    } else if has(&["tired", "sleep"]) {
        0.7
    } else {
        1.0
    }
}

pub fn energy_modifier(energy: u32) -> f64 {
    if energy >= 80 {
        1.2
    } else if energy >= 40 {
        1.0
    } else {
        0.8
    }
}

/// Mode for the current emotional state; `default` when nothing stands out.
pub fn adaptive_mode(emotion: &str, energy: u32, default: SpeedMode) -> SpeedMode {
    let emotion = emotion.to_lowercase();
    if emotion.contains("excit") {
        SpeedMode::Fast
    } else if energy < 30 || emotion.contains("tired") {
        SpeedMode::Normal
    } else if emotion.contains("anxious") || emotion.contains("sad") {
        SpeedMode::Normal
    } else {
        default
    }
}

#[derive(Clone)]
pub struct TypingSimulator {
    mode: SpeedMode,
    default_mode: SpeedMode,
    natural_pauses: bool,
    show_indicator: bool,
    log_timings: bool,
}

impl Default for TypingSimulator {
    fn default() -> Self {
        Self::from_config(&TypingConfig::default())
    }
}

impl TypingSimulator {
    pub fn from_config(config: &TypingConfig) -> Self {
        let mode = SpeedMode::from_name(&config.mode);
        tracing::info!("Typing simulator ready: mode={}", mode.as_str());
        Self {
            mode,
            default_mode: mode,
            natural_pauses: config.natural_pauses,
            show_indicator: config.show_typing_indicator,
            log_timings: config.log_typing_timings,
        }
    }

    pub fn mode(&self) -> SpeedMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SpeedMode) {
        if mode != self.mode {
            tracing::debug!("Typing mode: {} ({} wpm)", mode.as_str(), mode.wpm());
        }
        self.mode = mode;
    }

    pub fn adapt_to(&mut self, emotion: &str, energy: u32) {
        self.set_mode(adaptive_mode(emotion, energy, self.default_mode));
    }

    /// Typing time with an explicit variability factor in `[0.8, 1.2]`.
    pub fn typing_time_with(&self, message: &str, emotion: &str, energy: u32, variability: f64) -> f64 {
        let words = message.split_whitespace().count() as f64;
        let minutes = words / self.mode.wpm();
        let secs = minutes * 60.0 / (emotion_modifier(emotion) * energy_modifier(energy)) * variability;
        secs.max(1.0)
    }

    pub fn typing_time<R: Rng + ?Sized>(&self, message: &str, emotion: &str, energy: u32, rng: &mut R) -> f64 {
        let factor = 1.0 + rng.random_range(-VARIABILITY..=VARIABILITY);
        self.typing_time_with(message, emotion, energy, factor)
    }

    pub fn thinking_time<R: Rng + ?Sized>(&self, message_len: usize, rng: &mut R) -> f64 {
        let base = if message_len > LONG_MESSAGE_CHARS {
            rng.random_range(THINKING_SECS.0..=THINKING_SECS.1)
        } else {
            THINKING_SECS.0
        };
        if self.mode == SpeedMode::Lightning {
            base * 0.3
        } else {
            base
        }
    }

    pub fn pause_between<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.mode == SpeedMode::Lightning {
            PAUSE_BETWEEN_SECS.0 * 0.5
        } else {
            rng.random_range(PAUSE_BETWEEN_SECS.0..=PAUSE_BETWEEN_SECS.1)
        }
    }

    /// Per-message delays. Thinking happens once, before the first message.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        messages: &[String],
        emotion: &str,
        energy: u32,
        rng: &mut R,
    ) -> Vec<MessageTiming> {
        let last = messages.len().saturating_sub(1);
        messages
            .iter()
            .enumerate()
            .map(|(i, message)| {
                let mut typing_secs = self.typing_time(message, emotion, energy, rng);
                if self.mode == SpeedMode::Lightning {
                    typing_secs = typing_secs.min(LIGHTNING_MAX_TYPING_SECS);
                }
                let thinking_secs = if i == 0 && self.natural_pauses {
                    self.thinking_time(message.chars().count(), rng)
                } else {
                    0.0
                };
                let pause_after_secs = if i < last && self.natural_pauses {
                    self.pause_between(rng)
                } else {
                    0.0
                };
                MessageTiming {
                    thinking_secs,
                    typing_secs,
                    pause_after_secs,
                }
            })
            .collect()
    }

    pub fn summarize(&self, timings: &[MessageTiming]) -> DelayPlan {
        let round = |value: f64| (value * 10.0).round() / 10.0;
        let typing: f64 = timings.iter().map(|t| t.typing_secs).sum();
        let thinking: f64 = timings.iter().map(|t| t.thinking_secs).sum();
        let pauses: f64 = timings.iter().map(|t| t.pause_after_secs).sum();
        DelayPlan {
            message_count: timings.len(),
            total_typing_secs: round(typing),
            total_thinking_secs: round(thinking),
            total_pause_secs: round(pauses),
            total_secs: round(typing + thinking + pauses),
            mode: self.mode,
        }
    }

    pub fn delay_summary<R: Rng + ?Sized>(
        &self,
        messages: &[String],
        emotion: &str,
        energy: u32,
        rng: &mut R,
    ) -> DelayPlan {
        self.summarize(&self.plan(messages, emotion, energy, rng))
    }

    /// Deliver each fragment with thinking, typing and pause delays.
    pub async fn send_with_timing<S: MessageSink + ?Sized>(
        &self,
        sink: &S,
        messages: &[String],
        emotion: &str,
        energy: u32,
    ) -> Result<()> {
        let timings = {
            let mut rng = rand::rng();
            self.plan(messages, emotion, energy, &mut rng)
        };

        if self.log_timings {
            let summary = self.summarize(&timings);
            tracing::info!(
                "Planned delivery: {} messages in {:.1}s, mode {}",
                summary.message_count,
                summary.total_secs,
                summary.mode.as_str()
            );
        }

        for (message, timing) in messages.iter().zip(timings) {
            if self.show_indicator {
                if let Err(e) = sink.typing().await {
                    tracing::debug!("Typing indicator failed: {}", e);
                }
            }
            sleep_secs(timing.thinking_secs + timing.typing_secs).await;
            sink.send(message).await?;
            sleep_secs(timing.pause_after_secs).await;
        }
        Ok(())
    }
}

async fn sleep_secs(secs: f64) {
    if secs > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn typing(&self) -> Result<()> {
            self.events.lock().expect("events").push("typing".to_string());
            Ok(())
        }

        async fn send(&self, text: &str) -> Result<()> {
            self.events.lock().expect("events").push(format!("send:{}", text));
            Ok(())
        }
    }

    fn simulator(mode: &str) -> TypingSimulator {
        TypingSimulator::from_config(&TypingConfig {
            mode: mode.to_string(),
            ..TypingConfig::default()
        })
    }

    #[test]
    fn typing_time_formula() {
        let sim = simulator("normal");
        let message = "one two three four five six seven eight nine ten";
        // 10 words at 60 wpm = 10s, excited 1.3 with high energy 1.2
        let secs = sim.typing_time_with(message, "excited", 90, 1.0);
        assert!((secs - 10.0 / 1.56).abs() < 1e-9);
        assert_eq!(sim.typing_time_with("hi", "calm", 50, 1.0), 1.0);
    }

    #[test]
    fn modifiers_and_modes() {
        assert_eq!(emotion_modifier("very Excited"), 1.3);
        assert_eq!(emotion_modifier("sleepy"), 0.7);
        assert_eq!(emotion_modifier("curious"), 1.0);
        assert_eq!(energy_modifier(80), 1.2);
        assert_eq!(energy_modifier(39), 0.8);
        assert_eq!(SpeedMode::from_name("warp"), SpeedMode::Normal);
        assert_eq!(adaptive_mode("excited", 20, SpeedMode::Slow), SpeedMode::Fast);
        assert_eq!(adaptive_mode("calm", 20, SpeedMode::Lightning), SpeedMode::Normal);
        assert_eq!(adaptive_mode("calm", 70, SpeedMode::Lightning), SpeedMode::Lightning);
    }

    #[test]
    fn lightning_shortens_everything() {
        let sim = simulator("lightning");
        let mut rng = StdRng::seed_from_u64(3);
        let messages: Vec<String> = vec!["a fairly long first message ".repeat(4), "second".to_string()];
        let timings = sim.plan(&messages, "calm", 50, &mut rng);

        assert!(timings[0].thinking_secs <= THINKING_SECS.1 * 0.3);
        assert_eq!(timings[0].pause_after_secs, 0.5);
        assert!(timings.iter().all(|t| t.typing_secs <= 0.5));
        assert_eq!(timings[1].pause_after_secs, 0.0);
        assert_eq!(timings[1].thinking_secs, 0.0);
    }

    #[test]
    fn summary_totals() {
        let sim = simulator("fast");
        let mut rng = StdRng::seed_from_u64(11);
        let messages = vec!["hello there".to_string(), "how are you".to_string()];
        let plan = sim.delay_summary(&messages, "happy", 60, &mut rng);

        assert_eq!(plan.message_count, 2);
        assert_eq!(plan.mode, SpeedMode::Fast);
        assert_eq!(plan.total_thinking_secs, 1.5);
        assert!(plan.total_pause_secs >= 1.0 && plan.total_pause_secs <= 3.0);
        assert!(plan.total_secs >= plan.total_typing_secs + 2.4);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_in_order_with_indicator() {
        let sim = simulator("fast");
        let sink = RecordingSink::default();
        let messages = vec!["first".to_string(), "second".to_string()];

        sim.send_with_timing(&sink, &messages, "calm", 50).await.expect("send");

        let events = sink.events.lock().expect("events").clone();
        assert_eq!(events, vec!["typing", "send:first", "typing", "send:second"]);
    }
}
