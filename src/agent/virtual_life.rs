use std::sync::Arc;

use anyhow::Result;
use chrono::{
    DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone, Utc,
};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::database::AgentDatabase;

pub const UPCOMING_CONTEXT_LIMIT: usize = 3;
pub const UPCOMING_WINDOW_HOURS: i64 = 24;
pub const AUTO_SCHEDULE_DAYS: i64 = 3;
const JITTER_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Planned,
    Active,
    Completed,
    Cancelled,
}

impl ActivityStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ActivityStatus::Planned => "planned",
            ActivityStatus::Active => "active",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => ActivityStatus::Active,
            "completed" => ActivityStatus::Completed,
            "cancelled" => ActivityStatus::Cancelled,
            _ => ActivityStatus::Planned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Free,
    Busy,
    Away,
}

impl Availability {
    pub fn as_str(self) -> &'static str {
        match self {
            Availability::Free => "free",
            Availability::Busy => "busy",
            Availability::Away => "away",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedActivity {
    pub id: String,
    pub activity_type: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ActivityStatus,
    pub importance: u32,
    pub flexibility: u32,
    pub mood_effect: f64,
    pub energy_cost: u32,
    pub emotional_reason: String,
    pub generated_by_ai: bool,
    pub planning_date: Option<NaiveDate>,
}

impl PlannedActivity {
    pub fn new(
        activity_type: impl Into<String>,
        description: impl Into<String>,
        start_time: DateTime<Utc>,
        duration_hours: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            activity_type: activity_type.into(),
            description: description.into(),
            start_time,
            end_time: start_time + hours(duration_hours),
            status: ActivityStatus::Planned,
            importance: 5,
            flexibility: 5,
            mood_effect: 0.0,
            energy_cost: 20,
            emotional_reason: String::new(),
            generated_by_ai: false,
            planning_date: None,
        }
    }

    pub fn with_priority(mut self, importance: u32, flexibility: u32) -> Self {
        self.importance = importance.clamp(1, 10);
        self.flexibility = flexibility.clamp(1, 10);
        self
    }

    pub fn with_effects(mut self, mood_effect: f64, energy_cost: u32) -> Self {
        self.mood_effect = mood_effect.clamp(-3.0, 3.0);
        self.energy_cost = energy_cost.min(100);
        self
    }

    pub fn hours_left(&self, now: DateTime<Utc>) -> f64 {
        (self.end_time - now).num_seconds().max(0) as f64 / 3600.0
    }

    pub fn is_important(&self) -> bool {
        self.importance >= 8
    }

    /// Hard to interrupt: important and barely movable.
    pub fn is_locked_in(&self) -> bool {
        self.importance >= 8 && self.flexibility <= 3
    }
}

fn hours(value: f64) -> ChronoDuration {
    ChronoDuration::minutes((value * 60.0).round() as i64)
}

pub fn location_for(activity_type: Option<&str>) -> &'static str {
    match activity_type {
        Some("work") | Some("study") => "at work",
        Some("social") => "out with friends",
        Some("cosplay") | Some("hobby") | Some("rest") => "at home",
        Some(_) => "out and about",
        None => "at home",
    }
}

pub fn availability_for(activity_type: Option<&str>) -> Availability {
    match activity_type {
        None => Availability::Free,
        Some("social") => Availability::Away,
        Some(_) => Availability::Busy,
    }
}

pub fn behaviour_hint(activity_type: &str) -> &'static str {
    match activity_type {
        "cosplay" => "BEHAVIOUR: absorbed in costume work, but happy to chat",
        "work" => "BEHAVIOUR: at work or study, replying when I can",
        "social" => "BEHAVIOUR: with friends, but glad to talk",
        "rest" => "BEHAVIOUR: resting and relaxed",
        "hobby" => "BEHAVIOUR: doing something I love, in a good mood",
        _ => "BEHAVIOUR: busy, but can talk",
    }
}

/// Messages announcing that an activity has begun.
pub fn start_notification(activity: &PlannedActivity) -> Vec<String> {
    vec![
        format!("By the way, I'm {} right now!", activity.description),
        format!(
            "I'll be busy with {} until {}",
            activity.activity_type,
            activity.end_time.with_timezone(&Local).format("%H:%M")
        ),
        "But you can always write to me!".to_string(),
    ]
}

pub fn end_notification(activity: &PlannedActivity) -> Vec<String> {
    vec![
        format!("I've finished {}.", activity.description),
        "Now I'm free to talk!".to_string(),
    ]
}

/// Reusable slot for the automatic schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTemplate {
    pub activity_type: String,
    pub description: String,
    pub start_hour: u32,
    pub duration_hours: f64,
    #[serde(default)]
    pub mood_effect: f64,
    #[serde(default = "default_energy_cost")]
    pub energy_cost: u32,
}

fn default_energy_cost() -> u32 {
    20
}

impl ScheduleTemplate {
    fn new(
        activity_type: &str,
        description: &str,
        start_hour: u32,
        duration_hours: f64,
        mood_effect: f64,
        energy_cost: u32,
    ) -> Self {
        Self {
            activity_type: activity_type.to_string(),
            description: description.to_string(),
            start_hour,
            duration_hours,
            mood_effect,
            energy_cost,
        }
    }
}

pub fn base_schedule() -> Vec<ScheduleTemplate> {
    vec![
        ScheduleTemplate::new("work", "working and studying", 9, 5.0, 1.0, 40),
        ScheduleTemplate::new("rest", "resting at home", 14, 1.0, 0.5, 10),
        ScheduleTemplate::new("hobby", "spending time on my hobby", 16, 2.0, 2.0, 30),
        ScheduleTemplate::new("social", "hanging out with friends", 19, 1.5, 1.5, 20),
    ]
}

/// What a single schedule check changed.
#[derive(Debug, Default, Clone)]
pub struct ActivityChanges {
    pub started: Option<PlannedActivity>,
    pub ended: Vec<PlannedActivity>,
    pub cancelled: usize,
}

impl ActivityChanges {
    pub fn status_changed(&self) -> bool {
        self.started.is_some() || !self.ended.is_empty()
    }
}

pub struct VirtualLifeManager {
    db: Arc<AgentDatabase>,
    current_activity: Option<PlannedActivity>,
}

impl VirtualLifeManager {
    /// Resume whatever activity was active when the process last stopped.
    pub fn new(db: Arc<AgentDatabase>) -> Result<Self> {
        let mut active = db.get_activities_by_status(ActivityStatus::Active)?;
        let current_activity = active.pop();
        for stale in active {
            db.set_activity_status(&stale.id, ActivityStatus::Completed)?;
        }
        if let Some(activity) = &current_activity {
            tracing::info!("Resuming activity: {}", activity.description);
        }
        Ok(Self {
            db,
            current_activity,
        })
    }

    pub fn current_activity(&self) -> Option<&PlannedActivity> {
        self.current_activity.as_ref()
    }

    pub fn location(&self) -> &'static str {
        location_for(self.current_type())
    }

    pub fn availability(&self) -> Availability {
        availability_for(self.current_type())
    }

    fn current_type(&self) -> Option<&str> {
        self.current_activity
            .as_ref()
            .map(|activity| activity.activity_type.as_str())
    }

    /// Advance the status machine to `now`.
    pub fn check_and_update_activities(&mut self, now: DateTime<Utc>) -> Result<ActivityChanges> {
        let mut changes = ActivityChanges::default();

        if let Some(current) = self.current_activity.take() {
            if now >= current.end_time {
                self.finish(current, &mut changes)?;
            } else {
                self.current_activity = Some(current);
            }
        }

        for mut activity in self.db.get_due_activities(now)? {
            if activity.end_time <= now {
                // Window passed while nobody was watching.
                self.db
                    .set_activity_status(&activity.id, ActivityStatus::Cancelled)?;
                changes.cancelled += 1;
                continue;
            }
            if let Some(previous) = self.current_activity.take() {
                self.finish(previous, &mut changes)?;
            }
            self.db
                .set_activity_status(&activity.id, ActivityStatus::Active)?;
            activity.status = ActivityStatus::Active;
            tracing::info!("Activity started: {}", activity.description);
            self.current_activity = Some(activity.clone());
            changes.started = Some(activity);
        }

        Ok(changes)
    }

    fn finish(&mut self, mut activity: PlannedActivity, changes: &mut ActivityChanges) -> Result<()> {
        self.db
            .set_activity_status(&activity.id, ActivityStatus::Completed)?;
        activity.status = ActivityStatus::Completed;
        tracing::info!("Activity finished: {}", activity.description);
        changes.ended.push(activity);
        Ok(())
    }

    pub fn context_for_ai(&self, now: DateTime<Utc>) -> Result<String> {
        let mut parts = vec![
            format!("CURRENT LOCATION: {}", self.location()),
            format!("AVAILABILITY: {}", self.availability().as_str()),
        ];

        match &self.current_activity {
            Some(activity) => {
                parts.push(format!("CURRENT ACTIVITY: {}", activity.description));
                parts.push(format!("Type: {}", activity.activity_type));
                parts.push(format!("Time left: {:.1} hours", activity.hours_left(now)));
                parts.push(format!("Importance: {}/10", activity.importance));
                if !activity.emotional_reason.is_empty() {
                    parts.push(format!("Reason: {}", activity.emotional_reason));
                }
                parts.push(behaviour_hint(&activity.activity_type).to_string());
            }
            None => parts.push("ACTIVITY: free right now".to_string()),
        }

        let upcoming = self.upcoming_activities(now, UPCOMING_WINDOW_HOURS)?;
        if !upcoming.is_empty() {
            parts.push("\nUPCOMING PLANS:".to_string());
            for plan in upcoming.iter().take(UPCOMING_CONTEXT_LIMIT) {
                let marker = if plan.is_important() { "[important]" } else { "[plan]" };
                parts.push(format!(
                    "- {} {} {}",
                    plan.start_time.with_timezone(&Local).format("%H:%M"),
                    marker,
                    plan.description
                ));
            }
        }

        Ok(parts.join("\n"))
    }

    /// Planned activities starting within the next `within_hours`.
    pub fn upcoming_activities(
        &self,
        now: DateTime<Utc>,
        within_hours: i64,
    ) -> Result<Vec<PlannedActivity>> {
        self.db
            .get_upcoming_activities(now, now + ChronoDuration::hours(within_hours), 50)
    }

    pub fn next_activity(&self, now: DateTime<Utc>) -> Result<Option<PlannedActivity>> {
        Ok(self
            .db
            .get_upcoming_activities(now, now + ChronoDuration::hours(UPCOMING_WINDOW_HOURS), 1)?
            .into_iter()
            .next())
    }

    pub fn schedule_activity(
        &self,
        activity_type: &str,
        description: &str,
        start_time: DateTime<Utc>,
        duration_hours: f64,
        mood_effect: f64,
        energy_cost: u32,
    ) -> Result<PlannedActivity> {
        let activity = PlannedActivity::new(activity_type, description, start_time, duration_hours)
            .with_effects(mood_effect, energy_cost);
        self.db.insert_activity(&activity)?;
        tracing::info!(
            "Scheduled activity: {} at {}",
            description,
            start_time.with_timezone(&Local).format("%d.%m %H:%M")
        );
        Ok(activity)
    }

    /// Sample 2-4 slots per day for the next few days, each shifted by up to half an hour.
    pub fn create_automatic_schedule<R: Rng + ?Sized>(
        &self,
        today: NaiveDate,
        extra: &[ScheduleTemplate],
        rng: &mut R,
    ) -> Result<usize> {
        let mut templates = base_schedule();
        templates.extend(extra.iter().cloned());

        let mut scheduled = 0;
        for day_offset in 1..=AUTO_SCHEDULE_DAYS {
            let date = today + ChronoDuration::days(day_offset);
            let count = rng.random_range(2..=4).min(templates.len());
            let picks: Vec<ScheduleTemplate> =
                templates.choose_multiple(rng, count).cloned().collect();

            for template in picks {
                let Some(start) = local_start(date, template.start_hour) else {
                    continue;
                };
                let jitter = ChronoDuration::minutes(rng.random_range(-JITTER_MINUTES..=JITTER_MINUTES));
                self.schedule_activity(
                    &template.activity_type,
                    &template.description,
                    start + jitter,
                    template.duration_hours,
                    template.mood_effect,
                    template.energy_cost,
                )?;
                scheduled += 1;
            }
        }

        tracing::info!(
            "Automatic schedule created for {} days ({} activities)",
            AUTO_SCHEDULE_DAYS,
            scheduled
        );
        Ok(scheduled)
    }
}

/// Local wall-clock hour on `date`, as UTC. None inside a DST gap.
pub fn local_start(date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0)?;
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn temp_manager() -> (TempDir, VirtualLifeManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(AgentDatabase::new(dir.path().join("life.db")).expect("db"));
        let manager = VirtualLifeManager::new(db).expect("manager");
        (dir, manager)
    }

    #[test]
    fn status_machine_starts_and_finishes_activities() {
        let (_dir, mut life) = temp_manager();
        let now = Utc::now();

        let first = life
            .schedule_activity("hobby", "sketching", now - ChronoDuration::minutes(10), 1.0, 1.0, 10)
            .expect("schedule first");
        let missed = life
            .schedule_activity("rest", "nap", now - ChronoDuration::hours(3), 1.0, 0.0, 5)
            .expect("schedule missed");

        let changes = life.check_and_update_activities(now).expect("check");
        assert_eq!(changes.started.as_ref().map(|a| a.id.as_str()), Some(first.id.as_str()));
        assert_eq!(changes.cancelled, 1);
        assert!(changes.status_changed());
        assert_eq!(life.availability(), Availability::Busy);
        assert_eq!(life.location(), "at home");

        let stored = life.db.get_activity(&missed.id).expect("get").expect("present");
        assert_eq!(stored.status, ActivityStatus::Cancelled);

        let later = now + ChronoDuration::hours(2);
        let changes = life.check_and_update_activities(later).expect("check later");
        assert_eq!(changes.ended.len(), 1);
        assert!(changes.started.is_none());
        assert!(life.current_activity().is_none());
        assert_eq!(life.availability(), Availability::Free);
        let stored = life.db.get_activity(&first.id).expect("get").expect("present");
        assert_eq!(stored.status, ActivityStatus::Completed);
    }

    #[test]
    fn new_activity_ends_the_current_one() {
        let (_dir, mut life) = temp_manager();
        let now = Utc::now();
        life.schedule_activity("work", "report", now - ChronoDuration::minutes(30), 3.0, 0.0, 40)
            .expect("schedule work");
        life.check_and_update_activities(now).expect("first check");

        life.schedule_activity("social", "coffee", now + ChronoDuration::minutes(5), 1.0, 1.0, 10)
            .expect("schedule social");
        let changes = life
            .check_and_update_activities(now + ChronoDuration::minutes(10))
            .expect("second check");
        assert_eq!(changes.ended.len(), 1);
        assert_eq!(changes.ended[0].description, "report");
        assert_eq!(
            changes.started.map(|a| a.description),
            Some("coffee".to_string())
        );
        assert_eq!(life.availability(), Availability::Away);
    }

    #[test]
    fn active_activity_survives_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(AgentDatabase::new(dir.path().join("life.db")).expect("db"));
        let now = Utc::now();
        {
            let mut life = VirtualLifeManager::new(db.clone()).expect("manager");
            life.schedule_activity("cosplay", "sewing", now - ChronoDuration::minutes(1), 2.0, 2.0, 30)
                .expect("schedule");
            life.check_and_update_activities(now).expect("check");
        }
        let life = VirtualLifeManager::new(db).expect("reloaded");
        assert_eq!(
            life.current_activity().map(|a| a.description.as_str()),
            Some("sewing")
        );
    }

    #[test]
    fn context_lists_current_and_upcoming_plans() {
        let (_dir, mut life) = temp_manager();
        let now = Utc::now();
        life.schedule_activity("cosplay", "sewing a cape", now - ChronoDuration::minutes(5), 2.0, 2.0, 30)
            .expect("schedule current");
        let exam = PlannedActivity::new("study", "exam", now + ChronoDuration::hours(3), 2.0)
            .with_priority(9, 2);
        life.db.insert_activity(&exam).expect("insert exam");
        life.check_and_update_activities(now).expect("check");

        let context = life.context_for_ai(now).expect("context");
        assert!(context.contains("CURRENT ACTIVITY: sewing a cape"));
        assert!(context.contains(behaviour_hint("cosplay")));
        assert!(context.contains("UPCOMING PLANS:"));
        assert!(context.contains("[important] exam"));

        let (_dir2, idle) = temp_manager();
        assert!(idle
            .context_for_ai(now)
            .expect("idle context")
            .contains("ACTIVITY: free right now"));
    }

    #[test]
    fn automatic_schedule_covers_next_days() {
        let (_dir, life) = temp_manager();
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();
        let today = now.with_timezone(&Local).date_naive();

        let extra = vec![ScheduleTemplate::new("cosplay", "photo shoot", 11, 2.0, 3.0, 25)];
        let scheduled = life
            .create_automatic_schedule(today, &extra, &mut rng)
            .expect("schedule");
        assert!((6..=12).contains(&scheduled));
        assert_eq!(
            life.db
                .count_activities_between(now, now + ChronoDuration::days(4))
                .expect("count"),
            scheduled
        );
    }

    #[test]
    fn notifications_mention_the_activity() {
        let activity = PlannedActivity::new("hobby", "painting", Utc::now(), 1.5);
        assert!(start_notification(&activity)[0].contains("painting"));
        assert_eq!(end_notification(&activity).len(), 2);
        assert_eq!(
            activity.end_time - activity.start_time,
            ChronoDuration::minutes(90)
        );
    }
}
