use chrono::Weekday;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Serialize;

use super::mood::MoodLabel;
use super::psychology::EmotionTrigger;

pub const BASE_INITIATIVE_CHANCE: f64 = 0.3;
pub const MAX_TRIGGER_BONUS: f64 = 0.5;
const RECENT_TOPIC_WINDOW: usize = 3;

/// Current or next activity as the scheduler sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityView {
    pub description: String,
    pub activity_type: String,
    pub importance: u32,
    pub flexibility: u32,
}

/// Everything one initiative roll depends on.
#[derive(Debug, Clone)]
pub struct InitiativeInputs {
    pub mood: MoodLabel,
    pub energy: u32,
    pub current_activity: Option<ActivityView>,
    pub activity_just_completed: bool,
    /// Minutes until the next planned activity and its importance.
    pub next_activity: Option<(i64, u32)>,
    pub intimacy: f64,
    pub hours_since_last_message: Option<f64>,
    pub hour: u32,
    pub weekday: Weekday,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitiativeDecision {
    pub send: bool,
    pub probability: f64,
    pub reasons: Vec<String>,
}

impl InitiativeDecision {
    pub fn reason_text(&self) -> String {
        if self.reasons.is_empty() {
            "routine check".to_string()
        } else {
            self.reasons.join(", ")
        }
    }
}

pub fn time_since_factor(hours_since: Option<f64>) -> f64 {
    match hours_since {
        None => 2.0,
        Some(h) if h < 1.0 => 0.3,
        Some(h) if h < 2.0 => 0.8,
        Some(h) if h < 4.0 => 1.0,
        Some(h) if h < 8.0 => 1.5,
        Some(_) => 2.0,
    }
}

pub fn energy_factor(energy: u32) -> f64 {
    match energy {
        80.. => 1.3,
        60..=79 => 1.1,
        40..=59 => 1.0,
        20..=39 => 0.7,
        _ => 0.4,
    }
}

pub fn activity_factor(activity: Option<&ActivityView>) -> f64 {
    let Some(activity) = activity else {
        return 1.5;
    };
    if activity.importance >= 8 && activity.flexibility <= 3 {
        0.3
    } else if activity.importance >= 7 {
        0.6
    } else if activity.importance >= 5 {
        0.9
    } else {
        1.1
    }
}

pub fn intimacy_factor(intimacy: f64) -> f64 {
    if intimacy >= 9.0 {
        1.8
    } else if intimacy >= 7.0 {
        1.4
    } else if intimacy >= 5.0 {
        1.0
    } else if intimacy >= 3.0 {
        0.8
    } else {
        0.6
    }
}

pub fn hour_factor(hour: u32) -> f64 {
    match hour {
        0..=5 => 0.2,
        6..=8 => 0.8,
        9..=11 => 1.2,
        12..=13 => 1.0,
        14..=17 => 1.3,
        18..=20 => 1.1,
        21..=22 => 0.9,
        _ => 0.5,
    }
}

pub fn weekday_factor(weekday: Weekday) -> f64 {
    match weekday {
        Weekday::Sat | Weekday::Sun => 1.2,
        Weekday::Fri => 1.15,
        _ => 1.0,
    }
}

/// Additive bonus from situational triggers, capped at `MAX_TRIGGER_BONUS`.
pub fn trigger_bonus(inputs: &InitiativeInputs) -> f64 {
    let mut bonus = 0.0;

    if inputs.activity_just_completed {
        bonus += 0.3;
        tracing::debug!("Initiative trigger: activity completed");
    }

    if let Some((minutes_until, importance)) = inputs.next_activity {
        if minutes_until > 0 && minutes_until <= 60 && importance >= 7 {
            bonus += 0.2;
            tracing::debug!("Initiative trigger: important plan soon");
        }
    }

    if let Some(hours) = inputs.hours_since_last_message {
        if hours > 12.0 && inputs.intimacy >= 7.0 {
            bonus += 0.25;
            tracing::debug!("Initiative trigger: missing the user");
        }
    }

    if inputs.mood.is_great() {
        bonus += 0.15;
    } else if inputs.mood.is_low() {
        bonus += 0.2;
    }

    f64::min(bonus, MAX_TRIGGER_BONUS)
}

/// Combine every factor into a probability and compare it against `roll` in [0, 1).
pub fn evaluate(inputs: &InitiativeInputs, roll: f64) -> InitiativeDecision {
    let mut probability = BASE_INITIATIVE_CHANCE;
    let mut reasons = Vec::new();

    let time = time_since_factor(inputs.hours_since_last_message);
    probability *= time;
    if time > 1.5 {
        reasons.push("long silence".to_string());
    } else if time < 0.5 {
        reasons.push("talked recently".to_string());
    }

    let mood = inputs.mood.initiative_multiplier();
    probability *= mood;
    if mood > 1.2 {
        reasons.push("good mood".to_string());
    } else if mood < 0.8 {
        reasons.push("bad mood".to_string());
    }

    probability *= energy_factor(inputs.energy);
    if inputs.energy < 30 {
        reasons.push("low energy".to_string());
    }

    let activity = activity_factor(inputs.current_activity.as_ref());
    probability *= activity;
    if activity < 0.5 {
        reasons.push("very busy".to_string());
    }

    probability *= intimacy_factor(inputs.intimacy);
    if inputs.intimacy >= 8.0 {
        reasons.push("close relationship".to_string());
    }

    probability *= hour_factor(inputs.hour);
    probability *= weekday_factor(inputs.weekday);

    let bonus = trigger_bonus(inputs);
    probability += bonus;
    if bonus > 0.0 {
        reasons.push("context trigger".to_string());
    }

    let probability = probability.clamp(0.0, 1.0);
    InitiativeDecision {
        send: roll < probability,
        probability,
        reasons,
    }
}

pub fn should_send_initiative<R: Rng + ?Sized>(
    inputs: &InitiativeInputs,
    rng: &mut R,
) -> InitiativeDecision {
    let decision = evaluate(inputs, rng.random::<f64>());
    tracing::info!(
        "Initiative roll: {} (p={:.0}%, {})",
        decision.send,
        decision.probability * 100.0,
        decision.reason_text()
    );
    decision
}

/// Pick a conversation opener, avoiding the last few topics used.
pub fn initiative_topic<R: Rng + ?Sized>(
    activity: Option<&ActivityView>,
    mood: MoodLabel,
    recent_topics: &[String],
    rng: &mut R,
) -> String {
    let mut topics = Vec::new();

    if let Some(activity) = activity {
        topics.push(format!("share how it's going: {}", activity.description));
        topics.push(format!("talk about what's hard about: {}", activity.description));
        topics.push(format!("ask for advice on: {}", activity.description));

        match activity.activity_type.as_str() {
            t if t.contains("cosplay") => topics.extend([
                "talk about a new cosplay".to_string(),
                "show progress on the costume".to_string(),
                "share a cosplay idea".to_string(),
            ]),
            t if t.contains("hobby") => topics.push("share a hobby moment".to_string()),
            t if t.contains("social") => topics.push("tell about meeting friends".to_string()),
            _ => {}
        }
    }

    if mood.is_great() {
        topics.push("share happy news".to_string());
        topics.push("tell what inspired me".to_string());
    } else if mood.is_low() {
        topics.push("share my feelings".to_string());
        topics.push("ask for support".to_string());
    }

    topics.extend(
        [
            "ask how their day is going",
            "tell about my day",
            "suggest doing something together",
            "recall a shared moment",
        ]
        .map(String::from),
    );

    let recent = &recent_topics[recent_topics.len().saturating_sub(RECENT_TOPIC_WINDOW)..];
    let fresh: Vec<&String> = topics.iter().filter(|t| !recent.contains(t)).collect();
    let pool: Vec<&String> = if fresh.is_empty() {
        topics.iter().collect()
    } else {
        fresh
    };

    pool.choose(rng)
        .map(|t| t.to_string())
        .unwrap_or_else(|| "ask how their day is going".to_string())
}

/// Why the per-tick gate did or did not let an initiative through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Open,
    QuietHours,
    DailyCapReached,
    TooSoon,
}

/// Quiet window that may wrap midnight, e.g. 23 -> 7.
pub fn is_quiet_hour(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        false
    } else if start > end {
        hour >= start || hour < end
    } else {
        hour >= start && hour < end
    }
}

pub struct GateLimits {
    pub quiet_start: u32,
    pub quiet_end: u32,
    pub max_daily: u32,
    pub min_hours_between: f64,
}

pub fn check_gate(
    limits: &GateLimits,
    hour: u32,
    sent_today: u32,
    hours_since_last_initiative: Option<f64>,
) -> GateVerdict {
    if is_quiet_hour(hour, limits.quiet_start, limits.quiet_end) {
        return GateVerdict::QuietHours;
    }
    if sent_today >= limits.max_daily {
        return GateVerdict::DailyCapReached;
    }
    if hours_since_last_initiative.is_some_and(|h| h < limits.min_hours_between) {
        return GateVerdict::TooSoon;
    }
    GateVerdict::Open
}

/// A small thing that happened to the character between conversations.
#[derive(Debug, Clone, PartialEq)]
pub struct LifeEvent {
    pub description: &'static str,
    pub intensity: f64,
}

impl LifeEvent {
    pub fn trigger(&self) -> EmotionTrigger {
        if self.intensity >= 0.0 {
            EmotionTrigger::PositiveInteraction
        } else {
            EmotionTrigger::Stress
        }
    }

    pub fn memory_importance(&self) -> f64 {
        (self.intensity.abs() * 3.0).floor().min(7.0)
    }
}

const WORK_EVENTS: [(&str, f64); 4] = [
    ("got an interesting task", 1.0),
    ("a colleague brought me coffee", 0.5),
    ("a tough meeting ran long", -1.0),
    ("got praised for my work", 2.0),
];

const PERSONAL_EVENTS: [(&str, f64); 4] = [
    ("saw a beautiful sunset", 1.0),
    ("a friend texted me", 1.5),
    ("found an interesting article", 0.5),
    ("the neighbours are noisy", -0.8),
];

pub fn pick_life_event<R: Rng + ?Sized>(hour: u32, rng: &mut R) -> LifeEvent {
    let events: &[(&str, f64)] = if (9..=18).contains(&hour) {
        &WORK_EVENTS
    } else {
        &PERSONAL_EVENTS
    };
    let (description, intensity) = events.choose(rng).copied().unwrap_or(events[0]);
    LifeEvent {
        description,
        intensity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn quiet_inputs() -> InitiativeInputs {
        InitiativeInputs {
            mood: MoodLabel::Normal,
            energy: 50,
            current_activity: Some(ActivityView {
                description: "meeting".to_string(),
                activity_type: "work".to_string(),
                importance: 5,
                flexibility: 5,
            }),
            activity_just_completed: false,
            next_activity: None,
            intimacy: 5.0,
            hours_since_last_message: Some(3.0),
            hour: 12,
            weekday: Weekday::Tue,
        }
    }

    #[test]
    fn neutral_inputs_scale_base_chance() {
        let decision = evaluate(&quiet_inputs(), 0.99);
        // 0.3 * 1.0 * 1.0 * 1.0 * 0.9 * 1.0 * 1.0 * 1.0
        assert!((decision.probability - 0.27).abs() < 1e-9);
        assert!(!decision.send);
        assert_eq!(decision.reason_text(), "routine check");
        assert!(evaluate(&quiet_inputs(), 0.2).send);
    }

    #[test]
    fn locked_in_activity_and_night_suppress() {
        let mut inputs = quiet_inputs();
        inputs.current_activity = Some(ActivityView {
            description: "exam".to_string(),
            activity_type: "study".to_string(),
            importance: 9,
            flexibility: 2,
        });
        inputs.hour = 3;
        inputs.hours_since_last_message = Some(0.5);
        let decision = evaluate(&inputs, 0.0);
        assert!(decision.probability < 0.01);
        assert!(decision.reasons.contains(&"very busy".to_string()));
        assert!(decision.reasons.contains(&"talked recently".to_string()));
    }

    #[test]
    fn triggers_are_capped_and_probability_clamped() {
        let inputs = InitiativeInputs {
            mood: MoodLabel::Sad,
            energy: 90,
            current_activity: None,
            activity_just_completed: true,
            next_activity: Some((30, 8)),
            intimacy: 9.5,
            hours_since_last_message: Some(20.0),
            hour: 15,
            weekday: Weekday::Sat,
        };
        assert_eq!(trigger_bonus(&inputs), MAX_TRIGGER_BONUS);
        let decision = evaluate(&inputs, 0.999);
        assert_eq!(decision.probability, 1.0);
        assert!(decision.send);
    }

    #[test]
    fn factor_tables() {
        assert_eq!(time_since_factor(None), 2.0);
        assert_eq!(time_since_factor(Some(1.5)), 0.8);
        assert_eq!(time_since_factor(Some(7.9)), 1.5);
        assert_eq!(energy_factor(80), 1.3);
        assert_eq!(energy_factor(19), 0.4);
        assert_eq!(intimacy_factor(7.0), 1.4);
        assert_eq!(hour_factor(23), 0.5);
        assert_eq!(hour_factor(21), 0.9);
        assert_eq!(weekday_factor(Weekday::Fri), 1.15);
    }

    #[test]
    fn gate_respects_quiet_hours_cap_and_spacing() {
        let limits = GateLimits {
            quiet_start: 23,
            quiet_end: 7,
            max_daily: 8,
            min_hours_between: 2.0,
        };
        assert_eq!(check_gate(&limits, 23, 0, None), GateVerdict::QuietHours);
        assert_eq!(check_gate(&limits, 6, 0, None), GateVerdict::QuietHours);
        assert_eq!(check_gate(&limits, 7, 8, None), GateVerdict::DailyCapReached);
        assert_eq!(check_gate(&limits, 10, 1, Some(1.0)), GateVerdict::TooSoon);
        assert_eq!(check_gate(&limits, 10, 1, Some(2.5)), GateVerdict::Open);
        assert!(!is_quiet_hour(12, 0, 0));
    }

    #[test]
    fn topics_skip_recent_ones() {
        let mut rng = StdRng::seed_from_u64(3);
        let recent = vec![
            "ask how their day is going".to_string(),
            "tell about my day".to_string(),
            "suggest doing something together".to_string(),
        ];
        for _ in 0..20 {
            let topic = initiative_topic(None, MoodLabel::Normal, &recent, &mut rng);
            assert_eq!(topic, "recall a shared moment");
        }

        let activity = ActivityView {
            description: "sewing".to_string(),
            activity_type: "cosplay".to_string(),
            importance: 5,
            flexibility: 5,
        };
        let topic = initiative_topic(Some(&activity), MoodLabel::Joyful, &[], &mut rng);
        assert!(!topic.is_empty());
    }

    #[test]
    fn life_events_follow_the_clock() {
        let mut rng = StdRng::seed_from_u64(11);
        let work = pick_life_event(10, &mut rng);
        assert!(WORK_EVENTS.iter().any(|(d, _)| *d == work.description));
        let evening = pick_life_event(21, &mut rng);
        assert!(PERSONAL_EVENTS.iter().any(|(d, _)| *d == evening.description));

        let praise = LifeEvent {
            description: "got praised for my work",
            intensity: 2.0,
        };
        assert_eq!(praise.memory_importance(), 6.0);
        assert_eq!(praise.trigger(), EmotionTrigger::PositiveInteraction);
    }
}
