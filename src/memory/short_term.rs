use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::MemoryType;

pub const RETENTION_DAYS: i64 = 7;
pub const KEEP_IMPORTANCE: f64 = 7.0;
pub const DEFAULT_CONTACT_HOURS: [u32; 3] = [9, 13, 19];

const POSITIVE_WORDS: [&str; 5] = ["good", "great", "glad", "happy", "fun"];
const NEGATIVE_WORDS: [&str; 5] = ["bad", "sad", "tired", "problem", "hard"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTermEntry {
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    /// Signed emotional weight; only its magnitude affects ranking.
    pub emotional_charge: f64,
    pub created_at: DateTime<Utc>,
    pub access_count: u32,
    pub last_accessed: DateTime<Utc>,
    pub decay_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStage {
    Stranger,
    Acquaintance,
    Friend,
    CloseFriend,
}

impl RelationshipStage {
    pub fn from_conversation_count(count: usize) -> Self {
        if count < 5 {
            RelationshipStage::Stranger
        } else if count < 20 {
            RelationshipStage::Acquaintance
        } else if count < 50 {
            RelationshipStage::Friend
        } else {
            RelationshipStage::CloseFriend
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipStage::Stranger => "stranger",
            RelationshipStage::Acquaintance => "acquaintance",
            RelationshipStage::Friend => "friend",
            RelationshipStage::CloseFriend => "close friend",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourPattern {
    pub frequency: u32,
    pub positive: u32,
    pub negative: u32,
}

/// Volatile tier that lives only as long as the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShortTermMemory {
    entries: Vec<ShortTermEntry>,
    hour_patterns: BTreeMap<u32, HourPattern>,
    conversation_count: usize,
}

pub fn decay_factor(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let days_old = (now - created_at).num_days().max(0) as f64;
    (1.0 - days_old * 0.1).max(0.1)
}

impl ShortTermMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ShortTermEntry] {
        &self.entries
    }

    pub fn add(
        &mut self,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
        emotional_charge: f64,
        now: DateTime<Utc>,
    ) {
        self.entries.push(ShortTermEntry {
            content: content.to_string(),
            memory_type,
            importance: importance.clamp(1.0, 10.0),
            emotional_charge,
            created_at: now,
            access_count: 0,
            last_accessed: now,
            decay_factor: 1.0,
        });
        self.consolidate(now);
    }

    /// Forget stale unimportant entries and refresh decay on the rest.
    pub fn consolidate(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        self.entries
            .retain(|entry| entry.created_at > cutoff || entry.importance >= KEEP_IMPORTANCE);
        for entry in &mut self.entries {
            entry.decay_factor = decay_factor(entry.created_at, now);
        }
    }

    pub fn relevant(
        &mut self,
        context: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<ShortTermEntry> {
        let lowered = context.to_lowercase();
        let context_words: HashSet<&str> = lowered.split_whitespace().collect();

        let mut scored: Vec<(f64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let content = entry.content.to_lowercase();
                let content_words: HashSet<&str> = content.split_whitespace().collect();
                let overlap = context_words.intersection(&content_words).count() as f64;
                let score = (overlap * 2.0
                    + entry.importance
                    + entry.emotional_charge.abs()
                    + f64::from(entry.access_count) * 0.1)
                    * entry.decay_factor;
                (score, idx)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        scored
            .into_iter()
            .take(limit)
            .map(|(_, idx)| {
                let entry = &mut self.entries[idx];
                entry.access_count += 1;
                entry.last_accessed = now;
                entry.clone()
            })
            .collect()
    }

    /// Up to three strongest entries per memory type.
    pub fn summary(&self) -> BTreeMap<String, Vec<String>> {
        let mut by_type: BTreeMap<String, Vec<&ShortTermEntry>> = BTreeMap::new();
        for entry in &self.entries {
            by_type
                .entry(entry.memory_type.as_db_str().to_string())
                .or_default()
                .push(entry);
        }

        by_type
            .into_iter()
            .map(|(kind, mut entries)| {
                entries.sort_by(|a, b| {
                    (b.importance * b.decay_factor)
                        .partial_cmp(&(a.importance * a.decay_factor))
                        .unwrap_or(Ordering::Equal)
                });
                let top = entries
                    .into_iter()
                    .take(3)
                    .map(|entry| entry.content.clone())
                    .collect();
                (kind, top)
            })
            .collect()
    }

    /// Track when and in what tone the user writes.
    pub fn record_conversation(&mut self, user_message: &str, hour: u32) {
        self.conversation_count += 1;
        let pattern = self.hour_patterns.entry(hour).or_default();
        pattern.frequency += 1;

        let lower = user_message.to_lowercase();
        if POSITIVE_WORDS.iter().any(|w| lower.contains(w)) {
            pattern.positive += 1;
        } else if NEGATIVE_WORDS.iter().any(|w| lower.contains(w)) {
            pattern.negative += 1;
        }
    }

    pub fn conversation_count(&self) -> usize {
        self.conversation_count
    }

    pub fn relationship_stage(&self) -> RelationshipStage {
        RelationshipStage::from_conversation_count(self.conversation_count)
    }

    pub fn hour_patterns(&self) -> &BTreeMap<u32, HourPattern> {
        &self.hour_patterns
    }

    /// The three busiest hours, or a default spread when nothing is known yet.
    pub fn optimal_contact_hours(&self) -> Vec<u32> {
        if self.hour_patterns.is_empty() {
            return DEFAULT_CONTACT_HOURS.to_vec();
        }
        let mut hours: Vec<(u32, u32)> = self
            .hour_patterns
            .iter()
            .map(|(hour, pattern)| (*hour, pattern.frequency))
            .collect();
        hours.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hours.into_iter().take(3).map(|(hour, _)| hour).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_entries_dropped_unless_important() {
        let now = Utc::now();
        let mut memory = ShortTermMemory::new();
        memory.add("old trivia", MemoryType::General, 3.0, 0.0, now - Duration::days(8));
        memory.add("old milestone", MemoryType::LifeEvent, 8.0, 1.0, now - Duration::days(8));
        memory.consolidate(now);

        assert_eq!(memory.entries().len(), 1);
        assert_eq!(memory.entries()[0].content, "old milestone");
        assert!((memory.entries()[0].decay_factor - 0.2).abs() < 1e-9);
    }

    #[test]
    fn decay_factor_has_floor() {
        let now = Utc::now();
        assert_eq!(decay_factor(now, now), 1.0);
        assert!((decay_factor(now - Duration::days(3), now) - 0.7).abs() < 1e-9);
        assert_eq!(decay_factor(now - Duration::days(40), now), 0.1);
    }

    #[test]
    fn relevance_prefers_overlap_and_counts_access() {
        let now = Utc::now();
        let mut memory = ShortTermMemory::new();
        memory.add("user plays guitar", MemoryType::UserFact, 5.0, 0.0, now);
        memory.add("user went hiking", MemoryType::UserFact, 5.0, -1.0, now);

        let top = memory.relevant("do you still play guitar", 1, now);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].content, "user plays guitar");
        assert_eq!(top[0].access_count, 1);
    }

    #[test]
    fn summary_groups_by_type() {
        let now = Utc::now();
        let mut memory = ShortTermMemory::new();
        for i in 0..4 {
            memory.add(&format!("fact {}", i), MemoryType::UserFact, 2.0 + i as f64, 0.0, now);
        }
        memory.add("sunset", MemoryType::LifeEvent, 4.0, 1.0, now);

        let summary = memory.summary();
        assert_eq!(summary["user_fact"], vec!["fact 3", "fact 2", "fact 1"]);
        assert_eq!(summary["life_event"], vec!["sunset"]);
    }

    #[test]
    fn stage_and_contact_hours_follow_conversations() {
        let mut memory = ShortTermMemory::new();
        assert_eq!(memory.optimal_contact_hours(), vec![9, 13, 19]);
        assert_eq!(memory.relationship_stage(), RelationshipStage::Stranger);

        for _ in 0..3 {
            memory.record_conversation("had a great day", 20);
        }
        memory.record_conversation("so tired", 8);
        memory.record_conversation("hi", 12);

        assert_eq!(memory.relationship_stage(), RelationshipStage::Acquaintance);
        assert_eq!(memory.optimal_contact_hours(), vec![20, 8, 12]);
        assert_eq!(memory.hour_patterns()[&20].positive, 3);
        assert_eq!(memory.hour_patterns()[&8].negative, 1);
        assert_eq!(
            RelationshipStage::from_conversation_count(50),
            RelationshipStage::CloseFriend
        );
    }
}
