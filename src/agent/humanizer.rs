use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Local;

use super::virtual_life::PlannedActivity;
use crate::llm_client::{ChatModel, ChatOptions, LlmPurpose, Message};
use crate::memory::cache::TtlCache;

pub const HUMANIZE_CACHE_TTL: Duration = Duration::from_secs(3600);
const HUMANIZE_CACHE_CAPACITY: usize = 200;
const MAX_DESCRIPTION_CHARS: usize = 50;

const FILLER_PREFIXES: [&str; 6] = [
    "i'm now ",
    "i am now ",
    "right now i'm ",
    "right now i am ",
    "at the moment i'm ",
    "currently i'm ",
];

/// Turns schedule labels like `work` into short in-character phrases.
pub struct ActivityHumanizer {
    cache: Mutex<TtlCache<String>>,
    persona_context: String,
    fallback_overrides: HashMap<String, String>,
}

impl Default for ActivityHumanizer {
    fn default() -> Self {
        Self::new("a friendly young woman", HashMap::new())
    }
}

impl ActivityHumanizer {
    pub fn new(persona_context: impl Into<String>, fallback_overrides: HashMap<String, String>) -> Self {
        Self {
            cache: Mutex::new(TtlCache::new(HUMANIZE_CACHE_CAPACITY, HUMANIZE_CACHE_TTL)),
            persona_context: persona_context.into(),
            fallback_overrides,
        }
    }

    pub fn cache_key(activity: &PlannedActivity, mood: &str) -> String {
        format!(
            "{}_{}_{}_{}",
            activity.activity_type,
            activity.start_time.with_timezone(&Local).format("%H"),
            mood,
            activity.importance
        )
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.cache.lock().ok().and_then(|mut cache| cache.get(key))
    }

    fn remember(&self, key: String, value: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, value.to_string());
        }
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        tracing::info!("Humanizer cache cleared");
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    fn prompt(&self, activity: &PlannedActivity, mood: &str, hour: u32) -> String {
        let duration_hours =
            (activity.end_time - activity.start_time).num_minutes() as f64 / 60.0;
        let mut prompt = format!(
            "{}\n\n\
             Describe what you are doing right now in your own words.\n\
             Activity type: {}\n\
             Started at: {}\n\
             Duration: {:.1} hours\n\
             Importance: {}/10\n\
             Current hour: {}\n\
             Mood: {}",
            self.persona_context,
            activity.activity_type,
            activity.start_time.with_timezone(&Local).format("%H:%M"),
            duration_hours,
            activity.importance,
            hour,
            mood
        );
        if !activity.emotional_reason.is_empty() {
            prompt.push_str(&format!("\nReason: {}", activity.emotional_reason));
        }
        prompt.push_str(
            "\n\nReply with one short phrase in the first person, at most 50 characters, \
             no quotes and no explanations. Example: sewing the sleeves of my new costume",
        );
        prompt
    }

    /// Humanized description, served from cache when possible. Never fails.
    pub async fn humanize_activity<M: ChatModel + ?Sized>(
        &self,
        model: &M,
        activity: &PlannedActivity,
        mood: &str,
        hour: u32,
    ) -> String {
        let key = Self::cache_key(activity, mood);
        if let Some(hit) = self.cached(&key) {
            tracing::debug!("Humanizer cache hit: {} -> {}", activity.activity_type, hit);
            return hit;
        }

        let messages = vec![
            Message::system(self.prompt(activity, mood, hour)),
            Message::user(format!("Humanize the activity: {}", activity.activity_type)),
        ];
        let reply = model
            .chat(LlmPurpose::Analytics, messages, ChatOptions::new(0.8, 150))
            .await;

        match reply.map(|raw| clean_response(&raw)) {
            Ok(humanized) if !humanized.is_empty() => {
                tracing::info!("Humanized {} -> {}", activity.activity_type, humanized);
                self.remember(key, &humanized);
                humanized
            }
            Ok(_) => self.fallback(&activity.activity_type),
            Err(e) => {
                tracing::warn!("Activity humanization failed: {}", e);
                self.fallback(&activity.activity_type)
            }
        }
    }

    pub fn fallback(&self, activity_type: &str) -> String {
        if let Some(text) = self.fallback_overrides.get(activity_type) {
            return text.clone();
        }
        fallback_description(activity_type)
    }
}

pub fn fallback_description(activity_type: &str) -> String {
    match activity_type {
        "hobby" => "doing what I love".to_string(),
        "work" => "working".to_string(),
        "rest" => "resting at home".to_string(),
        "social" => "hanging out with friends".to_string(),
        "cosplay" => "working on a costume".to_string(),
        "sleep" => "getting ready for bed".to_string(),
        "eat" => "having a meal".to_string(),
        "study" => "studying".to_string(),
        other => format!("doing things ({})", other),
    }
}

/// Strip quotes, explanations before a colon and filler openers; cap the length.
pub fn clean_response(raw: &str) -> String {
    let mut text = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');

    if let Some((_, after)) = text.split_once(':') {
        text = after.trim();
    }

    let lowered = text.to_lowercase();
    for prefix in FILLER_PREFIXES {
        if lowered.starts_with(prefix) {
            text = text.get(prefix.len()..).unwrap_or(text);
            break;
        }
    }

    let text = text.trim();
    if text.chars().count() > MAX_DESCRIPTION_CHARS {
        let head: String = text.chars().take(MAX_DESCRIPTION_CHARS - 3).collect();
        format!("{}...", head.trim_end())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::testing::ScriptedModel;
    use chrono::Utc;

    fn activity(kind: &str) -> PlannedActivity {
        PlannedActivity::new(kind, "technical label", Utc::now(), 2.0)
    }

    #[test]
    fn cleaning_rules() {
        assert_eq!(clean_response("\"sewing a cape\""), "sewing a cape");
        assert_eq!(
            clean_response("Sure, here it is: I'm now sketching costume ideas"),
            "sketching costume ideas"
        );
        let long = "x".repeat(80);
        let cleaned = clean_response(&long);
        assert_eq!(cleaned.chars().count(), 50);
        assert!(cleaned.ends_with("..."));
    }

    #[test]
    fn fallbacks_by_type() {
        let mut overrides = HashMap::new();
        overrides.insert("rest".to_string(), "watching anime in bed".to_string());
        let humanizer = ActivityHumanizer::new("persona", overrides);
        assert_eq!(humanizer.fallback("rest"), "watching anime in bed");
        assert_eq!(humanizer.fallback("eat"), "having a meal");
        assert_eq!(humanizer.fallback("gardening"), "doing things (gardening)");
    }

    #[tokio::test]
    async fn results_are_cached() {
        let humanizer = ActivityHumanizer::default();
        let model = ScriptedModel::new(["'painting a tiny dragon'"]);
        let hobby = activity("hobby");

        let first = humanizer.humanize_activity(&model, &hobby, "good", 15).await;
        let second = humanizer.humanize_activity(&model, &hobby, "good", 15).await;
        assert_eq!(first, "painting a tiny dragon");
        assert_eq!(second, first);
        assert_eq!(model.request_count(), 1);
        assert_eq!(humanizer.cached_count(), 1);

        let requests = model.requests.lock().expect("requests");
        assert_eq!(requests[0].0, LlmPurpose::Analytics);
        assert_eq!(requests[0].2.max_tokens, Some(150));
    }

    #[tokio::test]
    async fn failure_uses_fallback_and_is_not_cached() {
        let humanizer = ActivityHumanizer::default();
        let model = ScriptedModel::failing();
        let text = humanizer.humanize_activity(&model, &activity("work"), "tired", 10).await;
        assert_eq!(text, "working");
        assert_eq!(humanizer.cached_count(), 0);
    }
}
