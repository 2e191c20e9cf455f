use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::{ConsolidationLevel, MemoryRecord, MemoryType};
use crate::database::AgentDatabase;
use crate::llm_client::{ChatModel, ChatOptions, LlmPurpose, Message};

pub const ENRICHMENT_BATCH: usize = 50;
pub const PATTERN_WINDOW_DAYS: i64 = 30;
const STALE_ACCESS_DAYS: i64 = 30;

/// How strongly an emotion makes a memory stick.
pub fn emotion_impact(emotion: &str) -> f64 {
    match emotion {
        "joy" => 1.5,
        "love" => 1.8,
        "excitement" => 1.3,
        "surprise" => 1.4,
        "anger" => 1.2,
        "sadness" => 1.1,
        "fear" => 1.6,
        "disgust" => 0.8,
        "boredom" => 0.6,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionStat {
    pub emotion: String,
    pub count: usize,
    pub avg_intensity: f64,
    pub avg_importance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    High,
    Medium,
    Low,
    Minimal,
}

impl ActivityLevel {
    pub fn from_weekly_conversations(count: usize) -> Self {
        if count > 50 {
            ActivityLevel::High
        } else if count > 20 {
            ActivityLevel::Medium
        } else if count > 5 {
            ActivityLevel::Low
        } else {
            ActivityLevel::Minimal
        }
    }

    /// Age after which faint archived records move to the deep archive.
    pub fn deep_archive_days(self) -> i64 {
        match self {
            ActivityLevel::High => 365,
            ActivityLevel::Medium => 180,
            ActivityLevel::Low | ActivityLevel::Minimal => 90,
        }
    }
}

/// Closeness of the relationship as seen by the consolidation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondStage {
    Acquaintance,
    Friendship,
    Closeness,
    Deep,
}

impl BondStage {
    pub fn from_intimacy(intimacy: f64) -> Self {
        if intimacy <= 3.0 {
            BondStage::Acquaintance
        } else if intimacy <= 6.0 {
            BondStage::Friendship
        } else if intimacy <= 8.0 {
            BondStage::Closeness
        } else {
            BondStage::Deep
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BondStage::Acquaintance => "acquaintance",
            BondStage::Friendship => "friendship",
            BondStage::Closeness => "closeness",
            BondStage::Deep => "deep relationship",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub weekly_activity: usize,
    pub avg_emotional_intensity: f64,
    pub avg_importance: f64,
    pub relationship_stage: BondStage,
    pub dominant_emotions: Vec<(String, usize)>,
    pub activity_level: ActivityLevel,
}

impl Default for UserContext {
    fn default() -> Self {
        Self {
            weekly_activity: 10,
            avg_emotional_intensity: 5.0,
            avg_importance: 5.0,
            relationship_stage: BondStage::Friendship,
            dominant_emotions: Vec::new(),
            activity_level: ActivityLevel::Medium,
        }
    }
}

pub fn base_threshold(level: ConsolidationLevel) -> f64 {
    match level {
        ConsolidationLevel::Immediate => 3.0,
        ConsolidationLevel::ShortTerm => 4.0,
        ConsolidationLevel::MediumTerm => 6.0,
        ConsolidationLevel::LongTerm => 7.5,
        ConsolidationLevel::Lifetime => 9.0,
    }
}

/// Importance a record needs to take part in consolidation at `level`.
pub fn dynamic_threshold(level: ConsolidationLevel, context: &UserContext) -> f64 {
    let mut threshold = base_threshold(level);

    threshold += match context.activity_level {
        ActivityLevel::High => -1.0,
        ActivityLevel::Medium => 0.0,
        ActivityLevel::Low => 0.5,
        ActivityLevel::Minimal => 1.0,
    };

    threshold += match context.relationship_stage {
        BondStage::Acquaintance => -1.5,
        BondStage::Friendship => -0.5,
        BondStage::Closeness => 0.0,
        BondStage::Deep => 0.5,
    };

    if context.avg_emotional_intensity > 7.0 {
        threshold -= 0.5;
    } else if context.avg_emotional_intensity < 3.0 {
        threshold += 0.5;
    }

    threshold.max(1.0)
}

fn intensity_group(intensity: f64) -> &'static str {
    if intensity >= 8.0 {
        "high"
    } else if intensity >= 6.0 {
        "medium"
    } else {
        "low"
    }
}

fn emotion_of(record: &MemoryRecord) -> &str {
    record.emotion_type.as_deref().unwrap_or("calm")
}

fn intensity_of(record: &MemoryRecord) -> f64 {
    record.emotional_intensity.unwrap_or(5.0)
}

/// `date_emotion_intensityGroup_type`
pub fn group_key(record: &MemoryRecord) -> String {
    format!(
        "{}_{}_{}_{}",
        record.created_at.format("%Y-%m-%d"),
        emotion_of(record),
        intensity_group(intensity_of(record)),
        record.memory_type.as_db_str()
    )
}

pub fn group_by_emotional_context(records: Vec<MemoryRecord>) -> BTreeMap<String, Vec<MemoryRecord>> {
    let mut groups: BTreeMap<String, Vec<MemoryRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(group_key(&record)).or_default().push(record);
    }
    groups
}

/// Most frequent emotion; ties go to the one seen first.
pub fn dominant_emotion(records: &[MemoryRecord]) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for record in records {
        let emotion = emotion_of(record);
        match counts.iter_mut().find(|(name, _)| *name == emotion) {
            Some((_, count)) => *count += 1,
            None => counts.push((emotion, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (emotion, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((emotion, count));
        }
    }
    best.map(|(emotion, _)| emotion.to_string())
        .unwrap_or_else(|| "calm".to_string())
}

pub fn average_intensity(records: &[MemoryRecord]) -> f64 {
    if records.is_empty() {
        return 5.0;
    }
    records.iter().map(intensity_of).sum::<f64>() / records.len() as f64
}

/// Lines fed to the compression call, tagged with emotion and recall count.
pub fn tagged_memory_text(records: &[MemoryRecord]) -> String {
    records
        .iter()
        .map(|record| {
            let access = if record.access_count > 3 {
                format!("[access:{}]", record.access_count)
            } else {
                String::new()
            };
            format!(
                "[{}:{:.1}]{} {}",
                emotion_of(record),
                intensity_of(record),
                access,
                record.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn compression_prompt(
    level: ConsolidationLevel,
    dominant: &str,
    avg_intensity: f64,
    stage: BondStage,
) -> String {
    let base = format!(
        "You are the emotional memory of an AI companion in a relationship at the \"{}\" stage.\n\
         You are consolidating memories dominated by the emotion \"{}\" (intensity {:.1}).\n\n\
         PRINCIPLES:\n\
         - Keep the emotional colouring of the memories\n\
         - Emotionally vivid moments matter more than plain facts\n\
         - Remember how the relationship and the person have grown\n\
         - Preserve what makes the user unique",
        stage.as_str(),
        dominant,
        avg_intensity
    );

    let level_specific = match level {
        ConsolidationLevel::Immediate => {
            "First pass: keep every emotion and detail, only remove repetition.".to_string()
        }
        ConsolidationLevel::ShortTerm => format!(
            "Short-term consolidation:\n\
             - Keep the main emotional moments\n\
             - Drop small details but keep anything that affects the relationship\n\
             - Pay special attention to \"{}\", it mattered to the user",
            dominant
        ),
        ConsolidationLevel::MediumTerm => format!(
            "Medium-term consolidation:\n\
             - Compress to the key emotional patterns\n\
             - Keep how \"{}\" shaped the relationship\n\
             - Drop concrete details, keep the emotional core",
            dominant
        ),
        ConsolidationLevel::LongTerm => format!(
            "Long-term consolidation:\n\
             - Write an emotional summary of what matters most\n\
             - What does \"{}\" say about the user?\n\
             - Compress as far as possible while keeping the emotional bond",
            dominant
        ),
        ConsolidationLevel::Lifetime => format!(
            "Lifetime memory:\n\
             - Only the most important emotional milestones of the relationship\n\
             - Key personality traits seen through \"{}\"\n\
             - The moments that defined the relationship",
            dominant
        ),
    };

    let emotion_instruction = match dominant {
        "love" => "Focus on moments of tenderness and attachment, they are the core of the relationship",
        "joy" => "Keep the sources of joy, what makes the user happy",
        "excitement" => "Note what sparks the user's enthusiasm and interest",
        "anger" => "Remember conflict triggers so they can be avoided",
        "sadness" => "Keep what upsets the user so you can support them later",
        "fear" => "Note fears and worries in order to understand and help",
        "surprise" => "Remember what surprises the user for future pleasant moments",
        _ => "Keep the emotional colouring of the moment",
    };

    format!(
        "{}\n\n{}\n\nFOR THIS EMOTION: {}",
        base, level_specific, emotion_instruction
    )
}

/// Parse an `emotion:intensity` reply, clamping intensity to 1..=10.
pub fn parse_emotion_reply(reply: &str) -> Option<(String, f64)> {
    let line = reply.trim().lines().next()?.trim();
    let (emotion, intensity) = line.split_once(':')?;
    let emotion = emotion
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if emotion.is_empty() {
        return None;
    }
    let intensity: f64 = intensity
        .trim()
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;
    Some((emotion, intensity.clamp(1.0, 10.0)))
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConsolidationReport {
    pub groups_consolidated: usize,
    pub records_archived: usize,
    pub records_relevelled: usize,
    pub failed_groups: usize,
    pub deep_archived: usize,
    pub access_updates: usize,
}

impl ConsolidationReport {
    pub fn total_changes(&self) -> usize {
        self.groups_consolidated + self.records_relevelled + self.deep_archived
    }
}

pub struct MemoryConsolidator;

impl MemoryConsolidator {
    pub fn analyze_user_context(
        db: &AgentDatabase,
        intimacy: f64,
        now: DateTime<Utc>,
    ) -> Result<UserContext> {
        let week_ago = now - ChronoDuration::days(7);
        let weekly_activity = db.count_conversations_since(week_ago)?;
        let (avg_intensity, avg_importance) = db.memory_averages_since(week_ago)?;
        let dominant_emotions = db
            .emotion_stats_since(week_ago)?
            .into_iter()
            .map(|stat| (stat.emotion, stat.count))
            .collect();

        Ok(UserContext {
            weekly_activity,
            avg_emotional_intensity: avg_intensity.unwrap_or(5.0),
            avg_importance: avg_importance.unwrap_or(5.0),
            relationship_stage: BondStage::from_intimacy(intimacy),
            dominant_emotions,
            activity_level: ActivityLevel::from_weekly_conversations(weekly_activity),
        })
    }

    /// One full pass: every schedule level, then deep archive and access patterns.
    pub async fn run_cycle<M: ChatModel + ?Sized>(
        db: &AgentDatabase,
        model: &M,
        intimacy: f64,
        now: DateTime<Utc>,
    ) -> Result<ConsolidationReport> {
        let context = match Self::analyze_user_context(db, intimacy, now) {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!("User context analysis failed, using defaults: {}", e);
                UserContext::default()
            }
        };

        let mut report = ConsolidationReport::default();
        for (days, level) in ConsolidationLevel::SCHEDULE {
            Self::consolidate_level(db, model, days, level, &context, now, &mut report).await?;
        }

        let cutoff = now - ChronoDuration::days(context.activity_level.deep_archive_days());
        report.deep_archived = db.deep_archive_memories(cutoff)?;
        if report.deep_archived > 0 {
            tracing::info!(
                "Moved {} faint memories to the deep archive",
                report.deep_archived
            );
        }

        report.access_updates =
            db.refresh_access_difficulty(now - ChronoDuration::days(STALE_ACCESS_DAYS))?;

        tracing::info!(
            "Consolidation cycle done: {} group(s), {} archived, {} relevelled",
            report.groups_consolidated,
            report.records_archived,
            report.records_relevelled
        );
        Ok(report)
    }

    async fn consolidate_level<M: ChatModel + ?Sized>(
        db: &AgentDatabase,
        model: &M,
        days: i64,
        level: ConsolidationLevel,
        context: &UserContext,
        now: DateTime<Utc>,
        report: &mut ConsolidationReport,
    ) -> Result<()> {
        let cutoff = now - ChronoDuration::days(days);
        let threshold = dynamic_threshold(level, context);
        let candidates = db.consolidation_candidates(cutoff, level, threshold)?;
        if candidates.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            "Consolidating {} memories at {} (threshold {:.1})",
            candidates.len(),
            level.as_db_str(),
            threshold
        );

        for (key, group) in group_by_emotional_context(candidates) {
            if group.len() == 1 {
                db.set_memory_level(&group[0].id, level, now)?;
                report.records_relevelled += 1;
                continue;
            }

            let summary = match Self::compress_group(model, &group, level, context).await {
                Ok(summary) if !summary.trim().is_empty() => summary,
                Ok(_) => {
                    tracing::warn!("Empty compression for group {}", key);
                    report.failed_groups += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Compression failed for group {}: {}", key, e);
                    report.failed_groups += 1;
                    continue;
                }
            };

            let consolidated = build_consolidated_record(&group, summary, level, now);
            let ids: Vec<String> = group.iter().map(|m| m.id.clone()).collect();
            db.save_consolidated_group(&consolidated, &ids, level, now)?;
            report.groups_consolidated += 1;
            report.records_archived += ids.len();
            tracing::info!(
                "Stored consolidated memory: {} (importance {:.1})",
                consolidated.emotion_type.as_deref().unwrap_or("calm"),
                consolidated.importance
            );
        }

        Ok(())
    }

    async fn compress_group<M: ChatModel + ?Sized>(
        model: &M,
        group: &[MemoryRecord],
        level: ConsolidationLevel,
        context: &UserContext,
    ) -> Result<String> {
        let dominant = dominant_emotion(group);
        let avg_intensity = average_intensity(group);
        let prompt = compression_prompt(level, &dominant, avg_intensity, context.relationship_stage);
        let messages = vec![
            Message::system(prompt),
            Message::user(format!(
                "Memories to consolidate:\n{}",
                tagged_memory_text(group)
            )),
        ];

        let compressed = model
            .chat(LlmPurpose::Analytics, messages, ChatOptions::new(0.2, 250))
            .await?;
        let compressed = compressed.trim();
        if compressed.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(
            "[Emotional context: {}, intensity: {:.1}] {}",
            dominant, avg_intensity, compressed
        ))
    }

    /// Ask the model for `emotion:intensity` on records that lack one.
    pub async fn enrich_emotions<M: ChatModel + ?Sized>(
        db: &AgentDatabase,
        model: &M,
        limit: usize,
    ) -> Result<usize> {
        let pending = db.memories_missing_emotion(limit)?;
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!("Tagging emotions on {} memories", pending.len());

        let system = "Analyse the emotional context of this AI companion memory.\n\
                      Determine:\n\
                      1. The main emotion (joy, love, excitement, surprise, anger, sadness, fear, disgust, calm, boredom)\n\
                      2. Its intensity from 1 to 10\n\n\
                      Answer in the format emotion:intensity, for example joy:8 or sadness:3";

        let mut updated = 0;
        for memory in pending {
            let messages = vec![
                Message::system(system),
                Message::user(format!("Memory: {}", memory.content)),
            ];
            let reply = match model
                .chat(LlmPurpose::Analytics, messages, ChatOptions::new(0.2, 20))
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!("Emotion analysis failed for {}: {}", memory.id, e);
                    continue;
                }
            };
            match parse_emotion_reply(&reply) {
                Some((emotion, intensity)) => {
                    db.set_memory_emotion(&memory.id, &emotion, intensity)?;
                    updated += 1;
                }
                None => tracing::debug!("Unparseable emotion reply: {}", reply.trim()),
            }
        }
        Ok(updated)
    }

    /// Summarise a month of emotion statistics into an analysis memory.
    pub async fn analyze_emotional_patterns<M: ChatModel + ?Sized>(
        db: &AgentDatabase,
        model: &M,
        now: DateTime<Utc>,
    ) -> Result<Option<MemoryRecord>> {
        let stats = db.emotion_stats_since(now - ChronoDuration::days(PATTERN_WINDOW_DAYS))?;
        if stats.is_empty() {
            return Ok(None);
        }

        let mut pattern_text = String::from("The user's emotional patterns over the last month:\n");
        for stat in &stats {
            pattern_text.push_str(&format!(
                "- {}: {} times (intensity {:.1}, importance {:.1})\n",
                stat.emotion, stat.count, stat.avg_intensity, stat.avg_importance
            ));
        }

        let system = "Analyse the user's emotional patterns in conversations with an AI companion.\n\
                      Determine:\n\
                      1. Which emotions dominate?\n\
                      2. What does this say about the user's personality?\n\
                      3. How could the interaction improve?\n\
                      4. What should be watched for in the future?\n\n\
                      Answer briefly, 2-3 sentences per point.";

        let analysis = model
            .chat(
                LlmPurpose::Analytics,
                vec![Message::system(system), Message::user(pattern_text)],
                ChatOptions::new(0.3, 400),
            )
            .await?;

        let mut record = MemoryRecord::new(
            format!("Emotional analysis of the user: {}", analysis.trim()),
            MemoryType::EmotionalAnalysis,
            9.0,
        )
        .with_emotion("analytical", 7.0);
        record.is_consolidated = true;
        db.insert_memory(&record)?;
        tracing::info!("Stored emotional pattern analysis");
        Ok(Some(record))
    }

    /// Distil consolidated medium and long-term memories into what matters to the user.
    pub async fn analyze_memory_patterns<M: ChatModel + ?Sized>(
        db: &AgentDatabase,
        model: &M,
    ) -> Result<Option<MemoryRecord>> {
        let memories = db.get_consolidated_memories(
            &[ConsolidationLevel::MediumTerm, ConsolidationLevel::LongTerm],
            20,
        )?;
        if memories.is_empty() {
            return Ok(None);
        }
        let joined = memories
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let system = "Analyse an AI companion's memories about the user.\n\
                      Determine:\n\
                      1. Main interests and preferences\n\
                      2. Behaviour and communication patterns\n\
                      3. What matters to the user in the relationship\n\
                      4. How the interaction could improve\n\n\
                      Answer briefly, 2-3 sentences per point.";

        let analysis = model
            .chat(
                LlmPurpose::Analytics,
                vec![
                    Message::system(system),
                    Message::user(format!("Memories:\n{}", joined)),
                ],
                ChatOptions::new(0.3, 300),
            )
            .await?;

        let mut record = MemoryRecord::new(
            format!("Memory analysis: {}", analysis.trim()),
            MemoryType::MemoryAnalysis,
            8.0,
        );
        record.is_consolidated = true;
        db.insert_memory(&record)?;
        Ok(Some(record))
    }
}

fn build_consolidated_record(
    group: &[MemoryRecord],
    summary: String,
    level: ConsolidationLevel,
    now: DateTime<Utc>,
) -> MemoryRecord {
    let dominant = dominant_emotion(group);
    let max_importance = group
        .iter()
        .map(|m| m.importance)
        .fold(f64::MIN, f64::max);
    let importance = (max_importance * emotion_impact(&dominant)).min(10.0);
    let total_access: u32 = group.iter().map(|m| m.access_count).sum();

    let mut record = MemoryRecord::new(summary, MemoryType::EmotionalConsolidated, importance);
    record.emotion_type = Some(dominant);
    record.emotional_intensity = Some(average_intensity(group));
    record.access_count = total_access;
    record.consolidation_level = Some(level);
    record.last_consolidated = Some(now);
    record.is_consolidated = true;
    record.created_at = now;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::testing::ScriptedModel;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, AgentDatabase) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = AgentDatabase::new(dir.path().join("consolidation.db")).expect("db init");
        (dir, db)
    }

    fn memory_at(
        content: &str,
        importance: f64,
        emotion: &str,
        intensity: f64,
        created_at: DateTime<Utc>,
    ) -> MemoryRecord {
        let mut record = MemoryRecord::new(content, MemoryType::UserFact, importance)
            .with_emotion(emotion, intensity);
        record.created_at = created_at;
        record
    }

    #[test]
    fn threshold_adjusts_for_context() {
        let context = UserContext {
            activity_level: ActivityLevel::High,
            relationship_stage: BondStage::Acquaintance,
            avg_emotional_intensity: 8.0,
            ..UserContext::default()
        };
        // 3.0 - 1.0 - 1.5 - 0.5 floors at 1.0
        assert_eq!(dynamic_threshold(ConsolidationLevel::Immediate, &context), 1.0);

        let quiet = UserContext {
            activity_level: ActivityLevel::Minimal,
            relationship_stage: BondStage::Deep,
            avg_emotional_intensity: 2.0,
            ..UserContext::default()
        };
        assert_eq!(dynamic_threshold(ConsolidationLevel::LongTerm, &quiet), 9.5);
    }

    #[test]
    fn stages_and_activity_levels() {
        assert_eq!(BondStage::from_intimacy(3.0), BondStage::Acquaintance);
        assert_eq!(BondStage::from_intimacy(6.0), BondStage::Friendship);
        assert_eq!(BondStage::from_intimacy(8.0), BondStage::Closeness);
        assert_eq!(BondStage::from_intimacy(8.5), BondStage::Deep);
        assert_eq!(ActivityLevel::from_weekly_conversations(51), ActivityLevel::High);
        assert_eq!(ActivityLevel::from_weekly_conversations(21), ActivityLevel::Medium);
        assert_eq!(ActivityLevel::from_weekly_conversations(6), ActivityLevel::Low);
        assert_eq!(ActivityLevel::from_weekly_conversations(5), ActivityLevel::Minimal);
    }

    #[test]
    fn grouping_and_tagging() {
        let day = Utc::now() - ChronoDuration::days(3);
        let mut popular = memory_at("went to a concert", 6.0, "joy", 8.5, day);
        popular.access_count = 5;
        let records = vec![
            popular,
            memory_at("sang along", 5.0, "joy", 9.0, day),
            memory_at("lost a wallet", 5.0, "sadness", 6.0, day),
        ];

        assert!(group_key(&records[0]).ends_with("_joy_high_user_fact"));
        let text = tagged_memory_text(&records[..1]);
        assert_eq!(text, "[joy:8.5][access:5] went to a concert");

        let groups = group_by_emotional_context(records);
        assert_eq!(groups.len(), 2);
        assert!(groups.values().any(|g| g.len() == 2));
    }

    #[test]
    fn emotion_reply_parsing() {
        assert_eq!(parse_emotion_reply("joy:8"), Some(("joy".to_string(), 8.0)));
        assert_eq!(
            parse_emotion_reply(" Sadness : 14.5 \nextra"),
            Some(("sadness".to_string(), 10.0))
        );
        assert_eq!(parse_emotion_reply("no idea"), None);
        assert_eq!(parse_emotion_reply("fear:high"), None);
    }

    #[test]
    fn dominant_emotion_prefers_first_on_tie() {
        let now = Utc::now();
        let records = vec![
            memory_at("a", 5.0, "fear", 5.0, now),
            memory_at("b", 5.0, "joy", 5.0, now),
        ];
        assert_eq!(dominant_emotion(&records), "fear");
        assert_eq!(dominant_emotion(&[]), "calm");
    }

    #[tokio::test]
    async fn cycle_compresses_groups_and_relevels_singletons() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        let day = now - ChronoDuration::days(2);

        let a = memory_at("user adopted a cat", 7.0, "love", 8.0, day);
        let b = memory_at("user named the cat Miso", 6.0, "love", 9.0, day);
        let lone = memory_at("user started a new job", 8.0, "excitement", 5.0, day);
        for record in [&a, &b, &lone] {
            db.insert_memory(record).expect("insert");
        }

        let model = ScriptedModel::new(["The user adopted a cat called Miso."]);
        let report = MemoryConsolidator::run_cycle(&db, &model, 5.0, now)
            .await
            .expect("cycle");

        assert_eq!(report.groups_consolidated, 1);
        assert_eq!(report.records_archived, 2);
        assert_eq!(report.records_relevelled, 1);
        assert_eq!(model.request_count(), 1);

        let archived = db.get_memory(&a.id).expect("get").expect("present");
        assert!(archived.is_archived);
        let lone = db.get_memory(&lone.id).expect("get").expect("present");
        assert_eq!(lone.consolidation_level, Some(ConsolidationLevel::Immediate));
        assert!(!lone.is_archived);

        let consolidated = db
            .search_memories(&["miso".to_string()], 10)
            .expect("search")
            .into_iter()
            .find(|m| m.is_consolidated)
            .expect("consolidated record");
        assert!(consolidated
            .content
            .starts_with("[Emotional context: love, intensity: 8.5]"));
        assert_eq!(consolidated.importance, 10.0);
        assert_eq!(consolidated.memory_type, MemoryType::EmotionalConsolidated);
    }

    #[tokio::test]
    async fn failed_compression_leaves_group_untouched() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        let day = now - ChronoDuration::days(2);
        let a = memory_at("first", 7.0, "joy", 8.0, day);
        let b = memory_at("second", 7.0, "joy", 8.0, day);
        db.insert_memory(&a).expect("insert a");
        db.insert_memory(&b).expect("insert b");

        let model = ScriptedModel::failing();
        let report = MemoryConsolidator::run_cycle(&db, &model, 5.0, now)
            .await
            .expect("cycle");
        assert_eq!(report.failed_groups, 1);
        assert!(!db.get_memory(&a.id).expect("get").expect("present").is_archived);
    }

    #[tokio::test]
    async fn enrichment_and_pattern_analysis() {
        let (_dir, db) = temp_db();
        let plain = MemoryRecord::new("user finished a marathon", MemoryType::UserFact, 7.0);
        db.insert_memory(&plain).expect("insert");

        let model = ScriptedModel::new(["excitement:9", "The user thrives on challenges."]);
        let updated = MemoryConsolidator::enrich_emotions(&db, &model, ENRICHMENT_BATCH)
            .await
            .expect("enrich");
        assert_eq!(updated, 1);

        let analysis = MemoryConsolidator::analyze_emotional_patterns(&db, &model, Utc::now())
            .await
            .expect("analysis")
            .expect("record");
        assert_eq!(analysis.memory_type, MemoryType::EmotionalAnalysis);
        assert_eq!(analysis.importance, 9.0);
        assert!(analysis.is_consolidated);

        let empty = MemoryConsolidator::analyze_memory_patterns(&db, &model)
            .await
            .expect("memory patterns");
        assert!(empty.is_none());
    }
}
