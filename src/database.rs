use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::agent::planning::{FutureDesire, PlanningSession};
use crate::agent::virtual_life::{ActivityStatus, PlannedActivity};
use crate::memory::consolidation::EmotionStat;
use crate::memory::{ConsolidationLevel, Conversation, MemoryRecord, MemoryType};

const MEMORY_COLUMNS: &str = "id, memory_type, content, importance, emotional_intensity, emotion_type,
     created_at, last_accessed, access_count, consolidation_level, last_consolidated,
     is_consolidated, is_archived, is_deeply_archived, access_difficulty, source_conversation_id";

const ACTIVITY_COLUMNS: &str = "id, activity_type, description, start_time, end_time, status,
     importance, flexibility, mood_effect, energy_cost, emotional_reason, generated_by_ai,
     planning_date";

/// Fixed-width UTC timestamp so that stored values also sort correctly as text.
pub fn db_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_optional_timestamp(
    raw: Option<String>,
    column: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_timestamp(value, column)).transpose()
}

fn parse_date(raw: String, column: usize) -> rusqlite::Result<NaiveDate> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        memory_type: MemoryType::from_db(&row.get::<_, String>(1)?),
        content: row.get(2)?,
        importance: row.get(3)?,
        emotional_intensity: row.get(4)?,
        emotion_type: row.get(5)?,
        created_at: parse_timestamp(row.get(6)?, 6)?,
        last_accessed: parse_optional_timestamp(row.get(7)?, 7)?,
        access_count: row.get::<_, i64>(8)?.max(0) as u32,
        consolidation_level: row
            .get::<_, Option<String>>(9)?
            .as_deref()
            .and_then(ConsolidationLevel::from_db),
        last_consolidated: parse_optional_timestamp(row.get(10)?, 10)?,
        is_consolidated: row.get(11)?,
        is_archived: row.get(12)?,
        is_deeply_archived: row.get(13)?,
        access_difficulty: row.get::<_, i64>(14)?.max(0) as u32,
        source_conversation_id: row.get(15)?,
    })
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<PlannedActivity> {
    Ok(PlannedActivity {
        id: row.get(0)?,
        activity_type: row.get(1)?,
        description: row.get(2)?,
        start_time: parse_timestamp(row.get(3)?, 3)?,
        end_time: parse_timestamp(row.get(4)?, 4)?,
        status: ActivityStatus::from_db(&row.get::<_, String>(5)?),
        importance: row.get::<_, i64>(6)?.clamp(1, 10) as u32,
        flexibility: row.get::<_, i64>(7)?.clamp(1, 10) as u32,
        mood_effect: row.get(8)?,
        energy_cost: row.get::<_, i64>(9)?.max(0) as u32,
        emotional_reason: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        generated_by_ai: row.get(11)?,
        planning_date: row
            .get::<_, Option<String>>(12)?
            .map(|raw| parse_date(raw, 12))
            .transpose()?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let raw_response: String = row.get(2)?;
    Ok(Conversation {
        id: row.get(0)?,
        user_message: row.get(1)?,
        ai_responses: Conversation::split_stored_responses(&raw_response),
        mood_before: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        mood_after: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        timestamp: parse_timestamp(row.get(5)?, 5)?,
        is_initiative: row.get(6)?,
    })
}

pub struct AgentDatabase {
    conn: Mutex<Connection>,
}

impl AgentDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns.iter().any(|name| name == column))
    }

    /// Older stores predate archiving; add the columns the consolidation job relies on.
    fn ensure_memory_archive_columns(&self, conn: &Connection) -> Result<()> {
        let additions = [
            ("last_consolidated", "TEXT"),
            ("is_archived", "INTEGER NOT NULL DEFAULT 0"),
            ("is_deeply_archived", "INTEGER NOT NULL DEFAULT 0"),
            ("access_difficulty", "INTEGER NOT NULL DEFAULT 5"),
        ];
        for (column, definition) in additions {
            if !Self::table_has_column(conn, "memories", column)? {
                conn.execute(
                    &format!("ALTER TABLE memories ADD COLUMN {} {}", column, definition),
                    [],
                )?;
            }
        }
        Ok(())
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_message TEXT NOT NULL,
                ai_response TEXT NOT NULL,
                mood_before TEXT,
                mood_after TEXT,
                timestamp TEXT NOT NULL,
                is_initiative INTEGER NOT NULL DEFAULT 0
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversations_timestamp ON conversations(timestamp DESC)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                memory_type TEXT NOT NULL,
                content TEXT NOT NULL,
                importance REAL NOT NULL,
                emotional_intensity REAL,
                emotion_type TEXT,
                created_at TEXT NOT NULL,
                last_accessed TEXT,
                access_count INTEGER NOT NULL DEFAULT 0,
                consolidation_level TEXT,
                is_consolidated INTEGER NOT NULL DEFAULT 0,
                source_conversation_id TEXT
            )"#,
            [],
        )?;
        self.ensure_memory_archive_columns(&conn)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at)",
            [],
        )?;

        // Simulated schedule
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS virtual_activities (
                id TEXT PRIMARY KEY,
                activity_type TEXT NOT NULL,
                description TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'planned',
                importance INTEGER NOT NULL DEFAULT 5,
                flexibility INTEGER NOT NULL DEFAULT 5,
                mood_effect REAL NOT NULL DEFAULT 0,
                energy_cost INTEGER NOT NULL DEFAULT 20,
                emotional_reason TEXT,
                generated_by_ai INTEGER NOT NULL DEFAULT 0,
                planning_date TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_virtual_activities_start ON virtual_activities(status, start_time)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS planning_sessions (
                id TEXT PRIMARY KEY,
                planning_date TEXT NOT NULL,
                day_of_week TEXT NOT NULL,
                character_mood TEXT NOT NULL,
                total_activities_planned INTEGER NOT NULL,
                ai_response TEXT NOT NULL,
                success INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS future_desires (
                id TEXT PRIMARY KEY,
                desire_text TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                category TEXT NOT NULL DEFAULT 'general',
                fulfilled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Agent state
    // ========================================================================

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM agent_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO agent_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_state_time(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_state(key)?
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok()))
    }

    pub fn set_state_time(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.set_state(key, &db_timestamp(value))
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    pub fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO conversations
             (id, user_message, ai_response, mood_before, mood_after, timestamp, is_initiative)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation.id,
                conversation.user_message,
                conversation.joined_responses(),
                conversation.mood_before,
                conversation.mood_after,
                db_timestamp(conversation.timestamp),
                conversation.is_initiative,
            ],
        )?;
        Ok(())
    }

    /// Most recent first.
    pub fn get_recent_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_message, ai_response, mood_before, mood_after, timestamp, is_initiative
             FROM conversations
             ORDER BY timestamp DESC
             LIMIT ?1",
        )?;
        let conversations = stmt
            .query_map([limit.max(1)], conversation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    pub fn count_conversations(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_conversations_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE timestamp >= ?1",
            [db_timestamp(since)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Memories
    // ========================================================================

    pub fn insert_memory(&self, memory: &MemoryRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO memories ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                MEMORY_COLUMNS
            ),
            params![
                memory.id,
                memory.memory_type.as_db_str(),
                memory.content,
                memory.importance,
                memory.emotional_intensity,
                memory.emotion_type,
                db_timestamp(memory.created_at),
                memory.last_accessed.map(db_timestamp),
                memory.access_count,
                memory.consolidation_level.map(|l| l.as_db_str()),
                memory.last_consolidated.map(db_timestamp),
                memory.is_consolidated,
                memory.is_archived,
                memory.is_deeply_archived,
                memory.access_difficulty,
                memory.source_conversation_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS),
            [id],
            memory_from_row,
        );

        match result {
            Ok(memory) => Ok(Some(memory)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn count_memories(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Keyword LIKE search ordered by relevance. Deep-archived records only
    /// surface once they have been recalled often.
    pub fn search_memories(&self, keywords: &[String], limit: usize) -> Result<Vec<MemoryRecord>> {
        let mut conditions = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        for keyword in keywords {
            values.push(Value::Text(format!("%{}%", keyword.to_lowercase())));
            conditions.push(format!("LOWER(content) LIKE ?{}", values.len()));
        }
        let keyword_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("({}) AND ", conditions.join(" OR "))
        };
        values.push(Value::Integer(limit.max(1) as i64));

        let sql = format!(
            "SELECT {}
             FROM memories
             WHERE {}(is_deeply_archived = 0 OR access_count > 5)
             ORDER BY (importance + COALESCE(emotional_intensity, 5.0) * 0.3 + access_count * 0.1) DESC,
                      created_at DESC
             LIMIT ?{}",
            MEMORY_COLUMNS,
            keyword_clause,
            values.len()
        );

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let memories = stmt
            .query_map(params_from_iter(values.iter()), memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    pub fn mark_memories_accessed(&self, ids: &[String], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "UPDATE memories
             SET access_count = access_count + 1, last_accessed = ?2
             WHERE id = ?1",
        )?;
        let at = db_timestamp(at);
        for id in ids {
            stmt.execute(params![id, at])?;
        }
        Ok(())
    }

    pub fn get_emotional_memories(
        &self,
        emotion: Option<&str>,
        min_intensity: f64,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}
             FROM memories
             WHERE emotional_intensity >= ?1
               AND (?2 IS NULL OR emotion_type = ?2)
               AND (is_deeply_archived = 0 OR access_count > 5)
             ORDER BY (importance + emotional_intensity * 0.3 + access_count * 0.1) DESC,
                      created_at DESC
             LIMIT ?3",
            MEMORY_COLUMNS
        ))?;
        let memories = stmt
            .query_map(params![min_intensity, emotion, limit.max(1)], memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    // ========================================================================
    // Consolidation support
    // ========================================================================

    /// (average intensity, average importance) of emotionally tagged records.
    pub fn memory_averages_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<(Option<f64>, Option<f64>)> {
        let conn = self.lock_conn()?;
        let averages = conn.query_row(
            "SELECT AVG(emotional_intensity), AVG(importance)
             FROM memories
             WHERE created_at >= ?1 AND emotional_intensity IS NOT NULL",
            [db_timestamp(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(averages)
    }

    pub fn emotion_stats_since(&self, since: DateTime<Utc>) -> Result<Vec<EmotionStat>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT emotion_type, COUNT(*), AVG(COALESCE(emotional_intensity, 5.0)), AVG(importance)
             FROM memories
             WHERE created_at >= ?1 AND emotion_type IS NOT NULL
             GROUP BY emotion_type
             ORDER BY COUNT(*) DESC, emotion_type ASC",
        )?;
        let stats = stmt
            .query_map([db_timestamp(since)], |row| {
                Ok(EmotionStat {
                    emotion: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                    avg_intensity: row.get(2)?,
                    avg_importance: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    pub fn consolidation_candidates(
        &self,
        cutoff: DateTime<Utc>,
        level: ConsolidationLevel,
        threshold: f64,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}
             FROM memories
             WHERE created_at <= ?1
               AND (consolidation_level IS NULL OR consolidation_level != ?2)
               AND is_deeply_archived = 0
               AND is_archived = 0
               AND (importance + COALESCE(emotional_intensity, 0) * 0.3 + access_count * 0.1) >= ?3
             ORDER BY (importance + COALESCE(emotional_intensity, 0) * 0.3 + access_count * 0.1) DESC,
                      created_at ASC",
            MEMORY_COLUMNS
        ))?;
        let memories = stmt
            .query_map(
                params![db_timestamp(cutoff), level.as_db_str(), threshold],
                memory_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    /// Insert the compressed record and archive its sources in one transaction.
    pub fn save_consolidated_group(
        &self,
        consolidated: &MemoryRecord,
        original_ids: &[String],
        level: ConsolidationLevel,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO memories ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                MEMORY_COLUMNS
            ),
            params![
                consolidated.id,
                consolidated.memory_type.as_db_str(),
                consolidated.content,
                consolidated.importance,
                consolidated.emotional_intensity,
                consolidated.emotion_type,
                db_timestamp(consolidated.created_at),
                consolidated.last_accessed.map(db_timestamp),
                consolidated.access_count,
                consolidated.consolidation_level.map(|l| l.as_db_str()),
                consolidated.last_consolidated.map(db_timestamp),
                consolidated.is_consolidated,
                consolidated.is_archived,
                consolidated.is_deeply_archived,
                consolidated.access_difficulty,
                consolidated.source_conversation_id,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "UPDATE memories
                 SET consolidation_level = ?2, last_consolidated = ?3, is_archived = 1,
                     access_difficulty = 3
                 WHERE id = ?1",
            )?;
            let at = db_timestamp(at);
            for id in original_ids {
                stmt.execute(params![id, level.as_db_str(), at])?;
            }
        }
        tx.commit().context("Failed to commit consolidated memory group")?;
        Ok(())
    }

    pub fn set_memory_level(
        &self,
        id: &str,
        level: ConsolidationLevel,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE memories SET consolidation_level = ?2, last_consolidated = ?3 WHERE id = ?1",
            params![id, level.as_db_str(), db_timestamp(at)],
        )?;
        Ok(())
    }

    /// Push old, faint, rarely recalled archived records into the deep archive.
    pub fn deep_archive_memories(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE memories
             SET is_deeply_archived = 1, access_difficulty = 8
             WHERE created_at <= ?1
               AND importance < 6
               AND COALESCE(emotional_intensity, 0) < 6
               AND access_count < 2
               AND is_archived = 1
               AND is_deeply_archived = 0",
            [db_timestamp(cutoff)],
        )?;
        Ok(changed)
    }

    /// Frequently recalled records get easier to reach; stale untouched ones drift away.
    pub fn refresh_access_difficulty(&self, stale_before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let eased = conn.execute(
            "UPDATE memories
             SET access_difficulty = CASE
                 WHEN access_count > 10 THEN 1
                 WHEN access_count > 5 THEN 2
                 WHEN access_count > 2 THEN 3
                 ELSE access_difficulty
             END
             WHERE access_count > 0",
            [],
        )?;
        let drifted = conn.execute(
            "UPDATE memories
             SET access_difficulty = access_difficulty + 1
             WHERE access_count = 0
               AND (last_accessed IS NULL OR last_accessed < ?1)
               AND access_difficulty < 8",
            [db_timestamp(stale_before)],
        )?;
        Ok(eased + drifted)
    }

    pub fn memories_missing_emotion(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}
             FROM memories
             WHERE emotional_intensity IS NULL AND LENGTH(content) > 10
             ORDER BY created_at ASC
             LIMIT ?1",
            MEMORY_COLUMNS
        ))?;
        let memories = stmt
            .query_map([limit.max(1)], memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    pub fn set_memory_emotion(&self, id: &str, emotion: &str, intensity: f64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE memories SET emotion_type = ?2, emotional_intensity = ?3 WHERE id = ?1",
            params![id, emotion, intensity.clamp(1.0, 10.0)],
        )?;
        Ok(())
    }

    pub fn get_consolidated_memories(
        &self,
        levels: &[ConsolidationLevel],
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        if levels.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..levels.len())
            .map(|i| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let mut values: Vec<Value> = levels
            .iter()
            .map(|l| Value::Text(l.as_db_str().to_string()))
            .collect();
        values.push(Value::Integer(limit.max(1) as i64));

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}
             FROM memories
             WHERE is_consolidated = 1 AND consolidation_level IN ({})
             ORDER BY importance DESC, last_consolidated DESC
             LIMIT ?{}",
            MEMORY_COLUMNS,
            placeholders,
            values.len()
        ))?;
        let memories = stmt
            .query_map(params_from_iter(values.iter()), memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    // ========================================================================
    // Simulated schedule
    // ========================================================================

    pub fn insert_activity(&self, activity: &PlannedActivity) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO virtual_activities ({}, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                ACTIVITY_COLUMNS
            ),
            params![
                activity.id,
                activity.activity_type,
                activity.description,
                db_timestamp(activity.start_time),
                db_timestamp(activity.end_time),
                activity.status.as_db_str(),
                activity.importance,
                activity.flexibility,
                activity.mood_effect,
                activity.energy_cost,
                activity.emotional_reason,
                activity.generated_by_ai,
                activity.planning_date.map(|d| d.to_string()),
                db_timestamp(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_activity(&self, id: &str) -> Result<Option<PlannedActivity>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM virtual_activities WHERE id = ?1", ACTIVITY_COLUMNS),
            [id],
            activity_from_row,
        );

        match result {
            Ok(activity) => Ok(Some(activity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_activities_by_status(&self, status: ActivityStatus) -> Result<Vec<PlannedActivity>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM virtual_activities WHERE status = ?1 ORDER BY start_time ASC",
            ACTIVITY_COLUMNS
        ))?;
        let activities = stmt
            .query_map([status.as_db_str()], activity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    /// Planned activities whose start time has arrived, earliest first.
    pub fn get_due_activities(&self, now: DateTime<Utc>) -> Result<Vec<PlannedActivity>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}
             FROM virtual_activities
             WHERE status = ?1 AND start_time <= ?2
             ORDER BY start_time ASC",
            ACTIVITY_COLUMNS
        ))?;
        let activities = stmt
            .query_map(
                params![ActivityStatus::Planned.as_db_str(), db_timestamp(now)],
                activity_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    pub fn get_upcoming_activities(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PlannedActivity>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}
             FROM virtual_activities
             WHERE status = ?1 AND start_time > ?2 AND start_time <= ?3
             ORDER BY start_time ASC
             LIMIT ?4",
            ACTIVITY_COLUMNS
        ))?;
        let activities = stmt
            .query_map(
                params![
                    ActivityStatus::Planned.as_db_str(),
                    db_timestamp(after),
                    db_timestamp(until),
                    limit.max(1)
                ],
                activity_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    pub fn set_activity_status(&self, id: &str, status: ActivityStatus) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE virtual_activities SET status = ?2 WHERE id = ?1",
            params![id, status.as_db_str()],
        )?;
        Ok(())
    }

    pub fn count_ai_activities_for_date(&self, date: NaiveDate) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM virtual_activities WHERE planning_date = ?1 AND generated_by_ai = 1",
            [date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_activities_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM virtual_activities WHERE start_time >= ?1 AND start_time < ?2",
            params![db_timestamp(from), db_timestamp(to)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Planning sessions and desires
    // ========================================================================

    pub fn save_planning_session(&self, session: &PlanningSession) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO planning_sessions
             (id, planning_date, day_of_week, character_mood, total_activities_planned,
              ai_response, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.id,
                session.planning_date.to_string(),
                session.day_of_week,
                session.character_mood,
                session.total_activities_planned,
                session.ai_response,
                session.success,
                db_timestamp(session.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn has_planning_session(&self, date: NaiveDate) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM planning_sessions WHERE planning_date = ?1 AND success = 1",
            [date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_recent_planning_sessions(
        &self,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<PlanningSession>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, planning_date, day_of_week, character_mood, total_activities_planned,
                    ai_response, success, created_at
             FROM planning_sessions
             WHERE planning_date >= ?1
             ORDER BY planning_date DESC
             LIMIT ?2",
        )?;
        let sessions = stmt
            .query_map(params![since.to_string(), limit.max(1)], |row| {
                Ok(PlanningSession {
                    id: row.get(0)?,
                    planning_date: parse_date(row.get(1)?, 1)?,
                    day_of_week: row.get(2)?,
                    character_mood: row.get(3)?,
                    total_activities_planned: row.get::<_, i64>(4)?.max(0) as usize,
                    ai_response: row.get(5)?,
                    success: row.get(6)?,
                    created_at: parse_timestamp(row.get(7)?, 7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub fn add_future_desire(&self, desire: &FutureDesire) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO future_desires
             (id, desire_text, priority, category, fulfilled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                desire.id,
                desire.desire_text,
                desire.priority,
                desire.category,
                desire.fulfilled,
                db_timestamp(desire.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_pending_desires(&self, limit: usize) -> Result<Vec<FutureDesire>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, desire_text, priority, category, fulfilled, created_at
             FROM future_desires
             WHERE fulfilled = 0
             ORDER BY priority DESC, created_at ASC
             LIMIT ?1",
        )?;
        let desires = stmt
            .query_map([limit.max(1)], |row| {
                Ok(FutureDesire {
                    id: row.get(0)?,
                    desire_text: row.get(1)?,
                    priority: row.get::<_, i64>(2)?.clamp(1, 10) as u32,
                    category: row.get(3)?,
                    fulfilled: row.get(4)?,
                    created_at: parse_timestamp(row.get(5)?, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(desires)
    }

    pub fn mark_desire_fulfilled(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("UPDATE future_desires SET fulfilled = 1 WHERE id = ?1", [id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("companion_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn aged_memory(content: &str, importance: f64, age_days: i64) -> MemoryRecord {
        let mut memory = MemoryRecord::new(content, MemoryType::UserFact, importance);
        memory.created_at = Utc::now() - Duration::days(age_days);
        memory.last_accessed = Some(memory.created_at);
        memory
    }

    #[test]
    fn state_roundtrip_and_timestamps() {
        let path = temp_db_path("state");
        let db = AgentDatabase::new(&path).expect("db init");

        assert!(db.get_state("missing").expect("get").is_none());
        db.set_state("k", "v1").expect("set");
        db.set_state("k", "v2").expect("overwrite");
        assert_eq!(db.get_state("k").expect("get").as_deref(), Some("v2"));

        let now = Utc::now();
        db.set_state_time("last_run", now).expect("set time");
        let loaded = db.get_state_time("last_run").expect("get time").expect("present");
        assert!((loaded - now).num_milliseconds().abs() < 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopening_existing_store_keeps_data() {
        let path = temp_db_path("reopen");
        {
            let db = AgentDatabase::new(&path).expect("db init");
            db.insert_memory(&MemoryRecord::new("persisted", MemoryType::General, 5.0))
                .expect("insert");
        }
        let db = AgentDatabase::new(&path).expect("db reopen");
        assert_eq!(db.count_memories().expect("count"), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deep_archived_memories_hidden_until_recalled_often() {
        let path = temp_db_path("deep_archive");
        let db = AgentDatabase::new(&path).expect("db init");

        let mut hidden = MemoryRecord::new("rainy walk in the park", MemoryType::LifeEvent, 9.0);
        hidden.is_deeply_archived = true;
        let mut recalled = MemoryRecord::new("park picnic", MemoryType::LifeEvent, 2.0);
        recalled.is_deeply_archived = true;
        recalled.access_count = 6;
        db.insert_memory(&hidden).expect("insert hidden");
        db.insert_memory(&recalled).expect("insert recalled");

        let found = db
            .search_memories(&["park".to_string()], 10)
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, recalled.id);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn consolidation_group_archives_originals_atomically() {
        let path = temp_db_path("consolidation_group");
        let db = AgentDatabase::new(&path).expect("db init");

        let a = aged_memory("first", 5.0, 10);
        let b = aged_memory("second", 6.0, 10);
        db.insert_memory(&a).expect("insert a");
        db.insert_memory(&b).expect("insert b");

        let candidates = db
            .consolidation_candidates(
                Utc::now() - Duration::days(5),
                ConsolidationLevel::ShortTerm,
                4.0,
            )
            .expect("candidates");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id, b.id);

        let mut summary = MemoryRecord::new("summary", MemoryType::EmotionalConsolidated, 6.0);
        summary.is_consolidated = true;
        summary.consolidation_level = Some(ConsolidationLevel::ShortTerm);
        db.save_consolidated_group(
            &summary,
            &[a.id.clone(), b.id.clone()],
            ConsolidationLevel::ShortTerm,
            Utc::now(),
        )
        .expect("save group");

        let archived = db.get_memory(&a.id).expect("get").expect("present");
        assert!(archived.is_archived);
        assert_eq!(archived.access_difficulty, 3);
        assert_eq!(
            archived.consolidation_level,
            Some(ConsolidationLevel::ShortTerm)
        );
        assert_eq!(db.count_memories().expect("count"), 3);

        let consolidated = db
            .get_consolidated_memories(&[ConsolidationLevel::ShortTerm], 10)
            .expect("consolidated");
        assert_eq!(consolidated.len(), 1);
        assert_eq!(consolidated[0].id, summary.id);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deep_archive_and_access_difficulty_rules() {
        let path = temp_db_path("archive_rules");
        let db = AgentDatabase::new(&path).expect("db init");

        let mut faint = aged_memory("faint", 3.0, 200);
        faint.is_archived = true;
        let mut vivid = aged_memory("vivid", 3.0, 200).with_emotion("joy", 8.0);
        vivid.is_archived = true;
        let mut popular = aged_memory("popular", 5.0, 1);
        popular.access_count = 11;
        db.insert_memory(&faint).expect("insert faint");
        db.insert_memory(&vivid).expect("insert vivid");
        db.insert_memory(&popular).expect("insert popular");

        let archived = db
            .deep_archive_memories(Utc::now() - Duration::days(180))
            .expect("deep archive");
        assert_eq!(archived, 1);
        let faint = db.get_memory(&faint.id).expect("get").expect("present");
        assert!(faint.is_deeply_archived);
        assert_eq!(faint.access_difficulty, 8);

        db.refresh_access_difficulty(Utc::now() - Duration::days(30))
            .expect("refresh");
        let popular = db.get_memory(&popular.id).expect("get").expect("present");
        assert_eq!(popular.access_difficulty, 1);
        let vivid = db.get_memory(&vivid.id).expect("get").expect("present");
        assert_eq!(vivid.access_difficulty, 6);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn emotion_enrichment_targets_untagged_memories() {
        let path = temp_db_path("enrichment");
        let db = AgentDatabase::new(&path).expect("db init");

        let plain = MemoryRecord::new("user adopted a kitten", MemoryType::UserFact, 6.0);
        let tagged = MemoryRecord::new("user passed the exam", MemoryType::UserFact, 7.0)
            .with_emotion("joy", 8.0);
        let short = MemoryRecord::new("hi", MemoryType::General, 1.0);
        for memory in [&plain, &tagged, &short] {
            db.insert_memory(memory).expect("insert");
        }

        let missing = db.memories_missing_emotion(50).expect("missing");
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, plain.id);

        db.set_memory_emotion(&plain.id, "love", 14.0).expect("set");
        let updated = db.get_memory(&plain.id).expect("get").expect("present");
        assert_eq!(updated.emotion_type.as_deref(), Some("love"));
        assert_eq!(updated.emotional_intensity, Some(10.0));

        let stats = db
            .emotion_stats_since(Utc::now() - Duration::days(30))
            .expect("stats");
        assert_eq!(stats.len(), 2);

        let _ = std::fs::remove_file(&path);
    }
}
