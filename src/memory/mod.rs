pub mod cache;
pub mod consolidation;
pub mod short_term;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::AgentDatabase;
use cache::TtlCache;

pub const RELEVANCE_CACHE_CAPACITY: usize = 100;
pub const RELEVANCE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Separator used when the reply fragments of one turn are stored as a single string.
pub const RESPONSE_SEPARATOR: &str = " || ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Preference,
    LifeFact,
    EmotionalState,
    LifeEvent,
    UserFact,
    EmotionalConsolidated,
    EmotionalAnalysis,
    MemoryAnalysis,
    General,
}

impl MemoryType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MemoryType::Preference => "preference",
            MemoryType::LifeFact => "life_fact",
            MemoryType::EmotionalState => "emotional_state",
            MemoryType::LifeEvent => "life_event",
            MemoryType::UserFact => "user_fact",
            MemoryType::EmotionalConsolidated => "emotional_consolidated",
            MemoryType::EmotionalAnalysis => "emotional_analysis",
            MemoryType::MemoryAnalysis => "memory_analysis",
            MemoryType::General => "general",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "preference" => MemoryType::Preference,
            "life_fact" => MemoryType::LifeFact,
            "emotional_state" => MemoryType::EmotionalState,
            "life_event" => MemoryType::LifeEvent,
            "user_fact" => MemoryType::UserFact,
            "emotional_consolidated" => MemoryType::EmotionalConsolidated,
            "emotional_analysis" => MemoryType::EmotionalAnalysis,
            "memory_analysis" => MemoryType::MemoryAnalysis,
            _ => MemoryType::General,
        }
    }
}

/// How far a record has travelled through the consolidation schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationLevel {
    Immediate,
    ShortTerm,
    MediumTerm,
    LongTerm,
    Lifetime,
}

impl ConsolidationLevel {
    /// Minimum record age in days for each level, in processing order.
    pub const SCHEDULE: [(i64, ConsolidationLevel); 5] = [
        (1, ConsolidationLevel::Immediate),
        (5, ConsolidationLevel::ShortTerm),
        (30, ConsolidationLevel::MediumTerm),
        (90, ConsolidationLevel::LongTerm),
        (365, ConsolidationLevel::Lifetime),
    ];

    pub fn as_db_str(self) -> &'static str {
        match self {
            ConsolidationLevel::Immediate => "immediate",
            ConsolidationLevel::ShortTerm => "short_term",
            ConsolidationLevel::MediumTerm => "medium_term",
            ConsolidationLevel::LongTerm => "long_term",
            ConsolidationLevel::Lifetime => "lifetime",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "immediate" => Some(ConsolidationLevel::Immediate),
            "short_term" => Some(ConsolidationLevel::ShortTerm),
            "medium_term" => Some(ConsolidationLevel::MediumTerm),
            "long_term" => Some(ConsolidationLevel::LongTerm),
            "lifetime" => Some(ConsolidationLevel::Lifetime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub importance: f64,
    pub emotional_intensity: Option<f64>,
    pub emotion_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub access_count: u32,
    pub consolidation_level: Option<ConsolidationLevel>,
    pub last_consolidated: Option<DateTime<Utc>>,
    pub is_consolidated: bool,
    pub is_archived: bool,
    pub is_deeply_archived: bool,
    /// 1 (surfaces easily) to 8 (deep archive).
    pub access_difficulty: u32,
    pub source_conversation_id: Option<String>,
}

impl MemoryRecord {
    pub fn new(content: impl Into<String>, memory_type: MemoryType, importance: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            memory_type,
            content: content.into(),
            importance: importance.clamp(1.0, 10.0),
            emotional_intensity: None,
            emotion_type: None,
            created_at: now,
            last_accessed: Some(now),
            access_count: 0,
            consolidation_level: None,
            last_consolidated: None,
            is_consolidated: false,
            is_archived: false,
            is_deeply_archived: false,
            access_difficulty: 5,
            source_conversation_id: None,
        }
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>, intensity: f64) -> Self {
        self.emotion_type = Some(emotion.into());
        self.emotional_intensity = Some(intensity.clamp(1.0, 10.0));
        self
    }

    pub fn with_conversation(mut self, conversation_id: Option<&str>) -> Self {
        self.source_conversation_id = conversation_id.map(str::to_string);
        self
    }

    /// Retrieval score; unknown intensity counts as a neutral 5.
    pub fn relevance_score(&self) -> f64 {
        self.importance
            + self.emotional_intensity.unwrap_or(5.0) * 0.3
            + f64::from(self.access_count) * 0.1
    }

    /// Consolidation score; unknown intensity contributes nothing.
    pub fn total_importance(&self) -> f64 {
        self.importance
            + self.emotional_intensity.unwrap_or(0.0) * 0.3
            + f64::from(self.access_count) * 0.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_message: String,
    pub ai_responses: Vec<String>,
    pub mood_before: String,
    pub mood_after: String,
    pub timestamp: DateTime<Utc>,
    pub is_initiative: bool,
}

impl Conversation {
    pub fn joined_responses(&self) -> String {
        self.ai_responses.join(RESPONSE_SEPARATOR)
    }

    pub fn split_stored_responses(raw: &str) -> Vec<String> {
        raw.split("||")
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn first_response(&self) -> &str {
        self.ai_responses.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: f64,
}

const PREFERENCE_KEYWORDS: [&str; 6] = ["love", "like", "adore", "enjoy", "don't like", "hate"];
const WORK_KEYWORDS: [&str; 6] = ["work", "study", "job", "university", "profession", "office"];
const EMOTION_KEYWORDS: [&str; 6] = ["sad", "happy", "upset", "angry", "cheerful", "lonely"];

/// Keyword-driven fact extraction from a user message.
pub fn extract_facts(user_message: &str) -> Vec<ExtractedFact> {
    let lower = user_message.to_lowercase();
    let mut facts = Vec::new();

    if PREFERENCE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        facts.push(ExtractedFact {
            content: format!("Preferences: {}", user_message),
            memory_type: MemoryType::Preference,
            importance: 6.0,
        });
    }
    if WORK_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        facts.push(ExtractedFact {
            content: format!("Work/study: {}", user_message),
            memory_type: MemoryType::LifeFact,
            importance: 7.0,
        });
    }
    if EMOTION_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        facts.push(ExtractedFact {
            content: format!("Emotional state: {}", user_message),
            memory_type: MemoryType::EmotionalState,
            importance: 5.0,
        });
    }

    facts
}

/// First three query words longer than two characters, lowercased.
pub fn query_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .take(3)
        .filter(|word| word.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub recent_conversations: usize,
    pub total_memories: usize,
    pub last_conversation: Option<DateTime<Utc>>,
}

/// Persistent memory access for the running companion.
pub struct MemoryManager {
    db: Arc<AgentDatabase>,
    relevance_cache: Mutex<TtlCache<Vec<MemoryRecord>>>,
}

impl MemoryManager {
    pub fn new(db: Arc<AgentDatabase>) -> Self {
        Self {
            db,
            relevance_cache: Mutex::new(TtlCache::new(
                RELEVANCE_CACHE_CAPACITY,
                RELEVANCE_CACHE_TTL,
            )),
        }
    }

    pub fn database(&self) -> &Arc<AgentDatabase> {
        &self.db
    }

    fn lock_cache(&self) -> Result<std::sync::MutexGuard<'_, TtlCache<Vec<MemoryRecord>>>> {
        self.relevance_cache
            .lock()
            .map_err(|e| anyhow!("Memory cache lock poisoned: {}", e))
    }

    fn invalidate_cache(&self) -> Result<()> {
        self.lock_cache()?.clear();
        Ok(())
    }

    /// Store one exchange and any facts the user revealed in it. Returns the conversation id.
    pub fn save_conversation(
        &self,
        user_message: &str,
        responses: &[String],
        mood_before: &str,
        mood_after: &str,
        is_initiative: bool,
    ) -> Result<String> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_message: user_message.to_string(),
            ai_responses: responses.to_vec(),
            mood_before: mood_before.to_string(),
            mood_after: mood_after.to_string(),
            timestamp: Utc::now(),
            is_initiative,
        };
        self.db.save_conversation(&conversation)?;

        for fact in extract_facts(user_message) {
            if let Err(e) = self.add_memory(
                &fact.content,
                fact.memory_type,
                fact.importance,
                Some(&conversation.id),
            ) {
                tracing::warn!("Failed to store extracted fact: {}", e);
            }
        }

        Ok(conversation.id)
    }

    pub fn add_memory(
        &self,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
        conversation_id: Option<&str>,
    ) -> Result<String> {
        let record =
            MemoryRecord::new(content, memory_type, importance).with_conversation(conversation_id);
        self.db.insert_memory(&record)?;
        self.invalidate_cache()?;
        tracing::debug!(
            "Stored memory {} (importance {:.0})",
            memory_type.as_db_str(),
            record.importance
        );
        Ok(record.id)
    }

    pub fn add_emotional_memory(
        &self,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
        emotion: &str,
        intensity: f64,
        conversation_id: Option<&str>,
    ) -> Result<String> {
        let record = MemoryRecord::new(content, memory_type, importance)
            .with_emotion(emotion, intensity)
            .with_conversation(conversation_id);
        self.db.insert_memory(&record)?;
        self.invalidate_cache()?;
        tracing::debug!(
            "Stored emotional memory {}({:.1})",
            emotion,
            record.emotional_intensity.unwrap_or_default()
        );
        Ok(record.id)
    }

    /// Keyword-matched memories ordered by relevance, served from a short-lived cache.
    pub fn relevant_memories(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let cache_key = format!("{}:{}", query.trim().to_lowercase(), limit);
        if let Some(cached) = self.lock_cache()?.get(&cache_key) {
            return Ok(cached);
        }

        let keywords = query_keywords(query);
        let memories = self.db.search_memories(&keywords, limit)?;

        let touched: Vec<String> = memories
            .iter()
            .filter(|m| !m.is_consolidated)
            .map(|m| m.id.clone())
            .collect();
        self.db.mark_memories_accessed(&touched, Utc::now())?;

        self.lock_cache()?.insert(cache_key, memories.clone());
        Ok(memories)
    }

    pub fn emotional_memories(
        &self,
        emotion: Option<&str>,
        min_intensity: f64,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let memories = self
            .db
            .get_emotional_memories(emotion, min_intensity, limit)?;
        let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
        self.db.mark_memories_accessed(&ids, Utc::now())?;
        Ok(memories)
    }

    pub fn recent_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        self.db.get_recent_conversations(limit)
    }

    pub fn build_context_for_prompt(&self, query: &str) -> Result<String> {
        let memories = self.relevant_memories(query, 5)?;
        let recent = self.recent_conversations(2)?;

        let mut parts: Vec<String> = Vec::new();

        if !memories.is_empty() {
            parts.push("WHAT YOU KNOW ABOUT THE USER:".to_string());

            let consolidated: Vec<&MemoryRecord> =
                memories.iter().filter(|m| m.is_consolidated).take(2).collect();
            let regular: Vec<&MemoryRecord> =
                memories.iter().filter(|m| !m.is_consolidated).take(3).collect();

            if !consolidated.is_empty() {
                parts.push("Long-term memories:".to_string());
                parts.extend(consolidated.into_iter().map(format_memory_line));
            }
            if !regular.is_empty() {
                parts.push("Recent memories:".to_string());
                parts.extend(regular.into_iter().map(format_memory_line));
            }
        }

        if !recent.is_empty() {
            parts.push("\nRECENT DIALOGUES:".to_string());
            for conversation in recent.iter().rev() {
                parts.push(format!("User: {}", conversation.user_message));
                parts.push(format!("You: {}", conversation.first_response()));
            }
        }

        if parts.is_empty() {
            Ok("New acquaintance".to_string())
        } else {
            Ok(parts.join("\n"))
        }
    }

    pub fn conversation_summary(&self, now: DateTime<Utc>) -> Result<ConversationSummary> {
        let week_ago = now - chrono::Duration::days(7);
        let last_conversation = self
            .db
            .get_recent_conversations(1)?
            .into_iter()
            .next()
            .map(|c| c.timestamp);
        Ok(ConversationSummary {
            recent_conversations: self.db.count_conversations_since(week_ago)?,
            total_memories: self.db.count_memories()?,
            last_conversation,
        })
    }
}

fn format_memory_line(memory: &MemoryRecord) -> String {
    match &memory.emotion_type {
        Some(emotion) => format!(
            "- {} ({}: {:.1})",
            memory.content,
            emotion,
            memory.emotional_intensity.unwrap_or(5.0)
        ),
        None => format!("- {}", memory.content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_manager() -> (TempDir, MemoryManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = AgentDatabase::new(dir.path().join("memory.db")).expect("db init");
        (dir, MemoryManager::new(Arc::new(db)))
    }

    #[test]
    fn fact_extraction_tags_by_keyword() {
        let facts = extract_facts("I love cats and my job is boring");
        let kinds: Vec<MemoryType> = facts.iter().map(|f| f.memory_type).collect();
        assert_eq!(kinds, vec![MemoryType::Preference, MemoryType::LifeFact]);
        assert_eq!(facts[1].importance, 7.0);

        assert!(extract_facts("nothing to see").is_empty());
    }

    #[test]
    fn query_keywords_use_first_three_words() {
        assert_eq!(
            query_keywords("Do you remember cosplay conventions"),
            vec!["you", "remember"]
        );
        assert_eq!(
            query_keywords("cosplay wigs tonight plans"),
            vec!["cosplay", "wigs", "tonight"]
        );
    }

    #[test]
    fn save_conversation_extracts_facts_and_builds_context() {
        let (_dir, manager) = temp_manager();
        manager
            .save_conversation(
                "I love drawing anime",
                &["Oh nice!".to_string(), "What do you draw?".to_string()],
                "good",
                "joyful",
                false,
            )
            .expect("save conversation");

        let conversations = manager.recent_conversations(5).expect("recent");
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].ai_responses.len(), 2);

        let context = manager
            .build_context_for_prompt("love drawing")
            .expect("context");
        assert!(context.contains("Preferences: I love drawing anime"));
        assert!(context.contains("You: Oh nice!"));
        assert!(!context.contains("What do you draw?"));
    }

    #[test]
    fn empty_store_is_a_new_acquaintance() {
        let (_dir, manager) = temp_manager();
        let context = manager.build_context_for_prompt("hello").expect("context");
        assert_eq!(context, "New acquaintance");

        let summary = manager.conversation_summary(Utc::now()).expect("summary");
        assert_eq!(summary.recent_conversations, 0);
        assert_eq!(summary.total_memories, 0);
        assert!(summary.last_conversation.is_none());
    }

    #[test]
    fn relevant_memories_rank_and_count_access() {
        let (_dir, manager) = temp_manager();
        manager
            .add_memory("user likes tea", MemoryType::Preference, 4.0, None)
            .expect("add");
        let strong = manager
            .add_emotional_memory("user likes tea ceremonies", MemoryType::UserFact, 8.0, "joy", 12.0, None)
            .expect("add emotional");

        let found = manager.relevant_memories("likes tea", 5).expect("search");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, strong);
        assert_eq!(found[0].emotional_intensity, Some(10.0));

        let stored = manager
            .database()
            .get_memory(&strong)
            .expect("get")
            .expect("present");
        assert_eq!(stored.access_count, 1);

        // cached: access counts stay put on a repeat query
        manager.relevant_memories("likes tea", 5).expect("search");
        let stored = manager
            .database()
            .get_memory(&strong)
            .expect("get")
            .expect("present");
        assert_eq!(stored.access_count, 1);
    }

    #[test]
    fn scores_treat_missing_intensity_differently() {
        let record = MemoryRecord::new("fact", MemoryType::General, 6.0);
        assert!((record.relevance_score() - 7.5).abs() < 1e-9);
        assert!((record.total_importance() - 6.0).abs() < 1e-9);
        assert_eq!(MemoryRecord::new("x", MemoryType::General, 42.0).importance, 10.0);
    }
}
