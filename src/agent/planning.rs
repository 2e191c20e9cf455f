use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::virtual_life::{local_start, PlannedActivity};
use crate::database::AgentDatabase;
use crate::llm_client::{parse_json_response, ChatModel, ChatOptions, LlmPurpose, Message};
use crate::prompts::truncate_chars;

pub const MIN_AI_ACTIVITIES_PER_DAY: usize = 3;
pub const DAY_START_HOUR: u32 = 8;
pub const DAY_END_HOUR: u32 = 22;
const RECENT_PLANS_DAYS: i64 = 7;
const RECENT_PLANS_LIMIT: usize = 5;
const DESIRES_LIMIT: usize = 3;
const STORED_RESPONSE_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningSession {
    pub id: String,
    pub planning_date: NaiveDate,
    pub day_of_week: String,
    pub character_mood: String,
    pub total_activities_planned: usize,
    pub ai_response: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FutureDesire {
    pub id: String,
    pub desire_text: String,
    pub priority: u32,
    pub category: String,
    pub fulfilled: bool,
    pub created_at: DateTime<Utc>,
}

impl FutureDesire {
    pub fn new(desire_text: impl Into<String>, priority: u32, category: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            desire_text: desire_text.into(),
            priority: priority.clamp(1, 10),
            category: category.into(),
            fulfilled: false,
            created_at: Utc::now(),
        }
    }
}

fn default_activity_type() -> String {
    "unknown".to_string()
}

fn default_description() -> String {
    "planned activity".to_string()
}

fn default_start_hour() -> f64 {
    9.0
}

fn default_duration() -> f64 {
    1.0
}

fn default_level() -> f64 {
    5.0
}

/// One entry of the model's plan. Numbers arrive as floats often enough to accept both.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanItem {
    #[serde(default = "default_activity_type")]
    pub activity_type: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_start_hour")]
    pub start_hour: f64,
    #[serde(default)]
    pub start_minute: f64,
    #[serde(default = "default_duration")]
    pub duration_hours: f64,
    #[serde(default = "default_level")]
    pub importance: f64,
    #[serde(default = "default_level")]
    pub flexibility: f64,
    #[serde(default)]
    pub emotional_reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DayPlan {
    #[serde(default)]
    pub day_mood: String,
    #[serde(default)]
    pub activities: Vec<PlanItem>,
}

/// Everything the planning prompt is built from.
#[derive(Debug, Clone)]
pub struct PlanningContext {
    pub date: NaiveDate,
    pub weekday: String,
    pub is_weekend: bool,
    pub character_name: String,
    pub character_context: String,
    pub current_mood: String,
    pub activity_types: Vec<(String, String)>,
    pub previous_plans: String,
    pub pending_desires: Vec<FutureDesire>,
}

pub fn default_activity_types() -> Vec<(String, String)> {
    [
        ("work", "work or study"),
        ("hobby", "personal interests"),
        ("social", "time with people"),
        ("rest", "resting at home"),
        ("exercise", "physical activity"),
    ]
    .into_iter()
    .map(|(kind, label)| (kind.to_string(), label.to_string()))
    .collect()
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PlanningReport {
    pub activities_saved: usize,
    pub activities_proposed: usize,
    pub desires_fulfilled: usize,
    pub day_mood: String,
}

pub struct DailyPlanner;

impl DailyPlanner {
    pub fn should_plan_today(db: &AgentDatabase, today: NaiveDate) -> Result<bool> {
        if db.has_planning_session(today)? {
            return Ok(false);
        }
        let existing = db.count_ai_activities_for_date(today)?;
        if existing >= MIN_AI_ACTIVITIES_PER_DAY {
            tracing::info!("{} already has {} planned activities", today, existing);
            return Ok(false);
        }
        Ok(true)
    }

    pub fn build_context(
        db: &AgentDatabase,
        today: NaiveDate,
        character_name: &str,
        character_context: &str,
        current_mood: &str,
        activity_types: Vec<(String, String)>,
    ) -> Result<PlanningContext> {
        let weekday = today.weekday();
        Ok(PlanningContext {
            date: today,
            weekday: today.format("%A").to_string(),
            is_weekend: weekday.number_from_monday() >= 6,
            character_name: character_name.to_string(),
            character_context: character_context.to_string(),
            current_mood: current_mood.to_string(),
            activity_types: if activity_types.is_empty() {
                default_activity_types()
            } else {
                activity_types
            },
            previous_plans: Self::recent_plans_summary(db, today)?,
            pending_desires: db.get_pending_desires(DESIRES_LIMIT)?,
        })
    }

    fn recent_plans_summary(db: &AgentDatabase, today: NaiveDate) -> Result<String> {
        let since = today - ChronoDuration::days(RECENT_PLANS_DAYS);
        let sessions = db.get_recent_planning_sessions(since, RECENT_PLANS_LIMIT)?;
        if sessions.is_empty() {
            return Ok(String::new());
        }
        let summary = sessions
            .iter()
            .map(|s| format!("{}: {} activities", s.day_of_week, s.total_activities_planned))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("Recently: {}", summary))
    }

    pub fn planning_prompt(context: &PlanningContext) -> String {
        let day_kind = if context.is_weekend { "day off" } else { "working day" };
        let mut prompt = format!(
            "You are {}, planning your day.\n\n\
             CONTEXT:\n\
             - Day: {} ({})\n\
             - Mood: {}\n\
             - Character: {}...\n\n\
             PLANNING RULES:\n\
             1. Plan from {}:00 to {}:00 (4-7 activities)\n\
             2. Every activity has a type, description, time and duration\n\
             3. Importance (1-10) and flexibility (1-10) for each activity\n\
             4. An emotional reason (\"I want to rest\", \"I need to work\")\n\
             5. Stay true to the character!\n\n\
             ACTIVITY TYPES:",
            context.character_name,
            context.weekday,
            day_kind,
            context.current_mood,
            truncate_chars(&context.character_context, 200),
            DAY_START_HOUR,
            DAY_END_HOUR
        );
        for (kind, label) in &context.activity_types {
            prompt.push_str(&format!("\n- {} - {}", kind, label));
        }

        prompt.push_str(
            "\n\nRESPONSE FORMAT (JSON only):\n\
             ```json\n\
             {\n\
               \"day_mood\": \"overall feeling of the day\",\n\
               \"activities\": [\n\
                 {\n\
                   \"activity_type\": \"work\",\n\
                   \"description\": \"working on the project\",\n\
                   \"start_hour\": 9,\n\
                   \"start_minute\": 0,\n\
                   \"duration_hours\": 3.5,\n\
                   \"importance\": 8,\n\
                   \"flexibility\": 3,\n\
                   \"emotional_reason\": \"need to finish before the deadline\"\n\
                 }\n\
               ]\n\
             }\n\
             ```\n\n\
             IMPORTANT:\n\
             - On a day off do NOT plan work, plan rest and hobbies\n\
             - An active character plans more activities\n\
             - Flexibility 10 = easy to move, 1 = fixed\n\
             - Importance 10 = critical, 1 = can be skipped",
        );

        if !context.previous_plans.is_empty() {
            prompt.push_str(&format!(
                "\n\nPREVIOUS PLANS (for variety):\n{}",
                truncate_chars(&context.previous_plans, 300)
            ));
        }

        if !context.pending_desires.is_empty() {
            let desires = context
                .pending_desires
                .iter()
                .map(|d| format!("{} (priority: {})", d.desire_text, d.priority))
                .collect::<Vec<_>>()
                .join("; ");
            prompt.push_str(&format!(
                "\n\nPENDING DESIRES (try to include them):\n{}",
                truncate_chars(&desires, 200)
            ));
        }

        prompt
    }

    /// Clamp the model's plan into the waking window and turn it into activities.
    pub fn plan_to_activities(plan: &DayPlan, date: NaiveDate) -> Vec<PlannedActivity> {
        plan.activities
            .iter()
            .filter_map(|item| {
                let hour = (item.start_hour.round() as i64)
                    .clamp(DAY_START_HOUR as i64, DAY_END_HOUR as i64) as u32;
                let minute = (item.start_minute.round() as i64).clamp(0, 59);
                let start = local_start(date, hour)? + ChronoDuration::minutes(minute);
                let duration = item.duration_hours.clamp(0.5, 6.0);

                let mut activity = PlannedActivity::new(
                    item.activity_type.trim().to_lowercase(),
                    item.description.trim(),
                    start,
                    duration,
                )
                .with_priority(
                    item.importance.round().clamp(1.0, 10.0) as u32,
                    item.flexibility.round().clamp(1.0, 10.0) as u32,
                );
                activity.emotional_reason = item.emotional_reason.trim().to_string();
                activity.generated_by_ai = true;
                activity.planning_date = Some(date);
                Some(activity)
            })
            .collect()
    }

    /// Ask the planning model for today's schedule and store it.
    pub async fn generate_daily_plan<M: ChatModel + ?Sized>(
        db: &AgentDatabase,
        model: &M,
        context: &PlanningContext,
    ) -> Result<PlanningReport> {
        tracing::info!("Generating a plan for {}", context.date);

        let messages = vec![
            Message::system(Self::planning_prompt(context)),
            Message::user(format!(
                "Plan the day for {}",
                context.date.format("%A, %d.%m.%Y")
            )),
        ];
        let raw = model
            .chat(LlmPurpose::Planning, messages, ChatOptions::new(0.7, 800))
            .await?;

        let plan = match parse_json_response::<DayPlan>(&raw) {
            Ok(plan) if !plan.activities.is_empty() => plan,
            Ok(_) => {
                tracing::warn!("Plan for {} has no activities", context.date);
                Self::record_session(db, context, "", 0, &raw, false)?;
                return Ok(PlanningReport::default());
            }
            Err(e) => {
                tracing::warn!("Could not parse plan for {}: {}", context.date, e);
                Self::record_session(db, context, "", 0, &raw, false)?;
                return Ok(PlanningReport::default());
            }
        };

        let activities = Self::plan_to_activities(&plan, context.date);
        let mut saved = 0;
        for activity in &activities {
            match db.insert_activity(activity) {
                Ok(()) => saved += 1,
                Err(e) => tracing::warn!("Failed to save planned activity: {}", e),
            }
        }

        let day_mood = if plan.day_mood.trim().is_empty() {
            "an ordinary day".to_string()
        } else {
            plan.day_mood.trim().to_string()
        };
        Self::record_session(db, context, &day_mood, plan.activities.len(), &raw, saved > 0)?;

        let mut desires_fulfilled = 0;
        for desire in &context.pending_desires {
            if activities
                .iter()
                .any(|a| a.activity_type.eq_ignore_ascii_case(&desire.category))
            {
                db.mark_desire_fulfilled(&desire.id)?;
                desires_fulfilled += 1;
            }
        }

        tracing::info!(
            "Saved {}/{} planned activities for {}",
            saved,
            plan.activities.len(),
            context.date
        );
        Ok(PlanningReport {
            activities_saved: saved,
            activities_proposed: plan.activities.len(),
            desires_fulfilled,
            day_mood,
        })
    }

    fn record_session(
        db: &AgentDatabase,
        context: &PlanningContext,
        day_mood: &str,
        total: usize,
        raw: &str,
        success: bool,
    ) -> Result<()> {
        let character_mood = if day_mood.is_empty() {
            context.current_mood.clone()
        } else {
            format!("{} -> {}", context.current_mood, day_mood)
        };
        db.save_planning_session(&PlanningSession {
            id: uuid::Uuid::new_v4().to_string(),
            planning_date: context.date,
            day_of_week: context.weekday.clone(),
            character_mood,
            total_activities_planned: total,
            ai_response: truncate_chars(raw, STORED_RESPONSE_CHARS),
            success,
            created_at: Utc::now(),
        })
    }
}
