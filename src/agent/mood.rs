use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::agent::psychology::CharacterState;

const POSITIVE_EMOTIONS: [&str; 3] = ["happy", "excited", "content"];
const NEGATIVE_EMOTIONS: [&str; 3] = ["sad", "angry", "anxious"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExternalFactors {
    pub sunny: bool,
    pub weekend: bool,
}

/// Scalar mood on a 1-10 scale.
pub fn calculate_current_mood(state: &CharacterState, external: &ExternalFactors) -> f64 {
    let t = &state.traits;
    let personality_mood = t.extraversion * 0.3
        + (10.0 - t.neuroticism) * 0.4
        + t.agreeableness * 0.2
        + t.openness * 0.1;

    let energy_factor = state.physical.energy / 100.0;
    let stress_penalty = state.physical.stress * 0.5;
    let sleep_penalty = (state.physical.sleep_debt * 0.8).min(3.0);

    let mut momentum_effect = state.momentum.intensity * 0.3;
    let emotion = state.momentum.emotion.as_str();
    if POSITIVE_EMOTIONS.contains(&emotion) {
        momentum_effect = momentum_effect.abs();
    } else if NEGATIVE_EMOTIONS.contains(&emotion) {
        momentum_effect = -momentum_effect.abs();
    }

    let mut external_bonus = 0.0;
    if external.sunny {
        external_bonus += 0.5;
    }
    if external.weekend {
        external_bonus += 0.8;
    }

    let mood = personality_mood * 0.4 + energy_factor * 3.0 + momentum_effect + external_bonus
        - stress_penalty
        - sleep_penalty;
    mood.clamp(1.0, 10.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityContext {
    MorningRoutine,
    WorkTime,
    EveningTime,
    NightTime,
}

impl ActivityContext {
    pub fn for_hour(hour: u32) -> Self {
        if (6..=9).contains(&hour) {
            ActivityContext::MorningRoutine
        } else if (9..=17).contains(&hour) {
            ActivityContext::WorkTime
        } else if (17..=22).contains(&hour) {
            ActivityContext::EveningTime
        } else {
            ActivityContext::NightTime
        }
    }

    pub fn energy_modifier(self) -> f64 {
        match self {
            ActivityContext::MorningRoutine => 0.8,
            ActivityContext::WorkTime => 0.9,
            ActivityContext::EveningTime => 0.7,
            ActivityContext::NightTime => 0.4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityContext::MorningRoutine => "morning_routine",
            ActivityContext::WorkTime => "work_time",
            ActivityContext::EveningTime => "evening_time",
            ActivityContext::NightTime => "night_time",
        }
    }
}

/// Descriptive mood words used in prompts and the initiative model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoodLabel {
    Ecstatic,
    Joyful,
    Inspired,
    Good,
    Playful,
    Normal,
    Calm,
    Thoughtful,
    Sad,
    Tired,
    Irritated,
    Depressed,
}

impl MoodLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            MoodLabel::Ecstatic => "ecstatic",
            MoodLabel::Joyful => "joyful",
            MoodLabel::Inspired => "inspired",
            MoodLabel::Good => "good",
            MoodLabel::Playful => "playful",
            MoodLabel::Normal => "normal",
            MoodLabel::Calm => "calm",
            MoodLabel::Thoughtful => "thoughtful",
            MoodLabel::Sad => "sad",
            MoodLabel::Tired => "tired",
            MoodLabel::Irritated => "irritated",
            MoodLabel::Depressed => "depressed",
        }
    }

    pub fn from_name(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ecstatic" => MoodLabel::Ecstatic,
            "joyful" => MoodLabel::Joyful,
            "inspired" => MoodLabel::Inspired,
            "good" => MoodLabel::Good,
            "playful" => MoodLabel::Playful,
            "calm" => MoodLabel::Calm,
            "thoughtful" => MoodLabel::Thoughtful,
            "sad" => MoodLabel::Sad,
            "tired" => MoodLabel::Tired,
            "irritated" => MoodLabel::Irritated,
            "depressed" => MoodLabel::Depressed,
            _ => MoodLabel::Normal,
        }
    }

    /// Weight this mood carries when deciding whether to write first.
    pub fn initiative_multiplier(self) -> f64 {
        match self {
            MoodLabel::Ecstatic => 1.5,
            MoodLabel::Joyful => 1.3,
            MoodLabel::Inspired => 1.4,
            MoodLabel::Good => 1.2,
            MoodLabel::Playful => 1.3,
            MoodLabel::Normal => 1.0,
            MoodLabel::Calm => 0.9,
            MoodLabel::Thoughtful => 0.8,
            MoodLabel::Sad => 0.7,
            MoodLabel::Tired => 0.6,
            MoodLabel::Irritated => 0.5,
            MoodLabel::Depressed => 0.4,
        }
    }

    pub fn is_great(self) -> bool {
        matches!(
            self,
            MoodLabel::Ecstatic | MoodLabel::Joyful | MoodLabel::Inspired
        )
    }

    pub fn is_low(self) -> bool {
        matches!(self, MoodLabel::Sad | MoodLabel::Depressed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoodBand {
    Excellent,
    Good,
    Normal,
    Sad,
}

impl MoodBand {
    pub fn from_value(mood: f64) -> Self {
        if mood >= 8.0 {
            MoodBand::Excellent
        } else if mood >= 6.0 {
            MoodBand::Good
        } else if mood >= 4.0 {
            MoodBand::Normal
        } else {
            MoodBand::Sad
        }
    }

    pub fn synonyms(self) -> &'static [MoodLabel] {
        match self {
            MoodBand::Excellent => &[MoodLabel::Ecstatic, MoodLabel::Joyful, MoodLabel::Inspired],
            MoodBand::Good => &[MoodLabel::Good, MoodLabel::Calm, MoodLabel::Playful],
            MoodBand::Normal => &[MoodLabel::Normal, MoodLabel::Thoughtful, MoodLabel::Calm],
            MoodBand::Sad => &[MoodLabel::Sad, MoodLabel::Tired, MoodLabel::Depressed],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MoodBand::Excellent => "excellent",
            MoodBand::Good => "good",
            MoodBand::Normal => "normal",
            MoodBand::Sad => "sad",
        }
    }
}

/// Pick a descriptive label for a band. Frustration colours a middling or low mood.
pub fn describe_mood<R: Rng + ?Sized>(band: MoodBand, emotion: &str, rng: &mut R) -> MoodLabel {
    if matches!(band, MoodBand::Normal | MoodBand::Sad)
        && matches!(emotion, "frustrated" | "angry")
    {
        return MoodLabel::Irritated;
    }
    band.synonyms()
        .choose(rng)
        .copied()
        .unwrap_or(MoodLabel::Normal)
}

/// Cheap per-tick view of the character's state, computed without an LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodSnapshot {
    pub mood_value: f64,
    pub band: MoodBand,
    pub label: MoodLabel,
    pub energy_level: u32,
    pub activity_context: ActivityContext,
    pub dominant_emotion: String,
    pub initiative_desire: i32,
    pub personality_description: String,
}

pub fn mood_snapshot<R: Rng + ?Sized>(
    state: &CharacterState,
    hour: u32,
    weekend: bool,
    rng: &mut R,
) -> MoodSnapshot {
    let mood_value = calculate_current_mood(
        state,
        &ExternalFactors {
            sunny: false,
            weekend,
        },
    );
    let activity_context = ActivityContext::for_hour(hour);
    let band = MoodBand::from_value(mood_value);
    let jitter: f64 = rng.random_range(-2.0..=2.0);
    let initiative_desire = ((mood_value * 0.8 + jitter).floor() as i32).min(10);

    MoodSnapshot {
        mood_value,
        band,
        label: describe_mood(band, &state.momentum.emotion, rng),
        energy_level: (state.physical.energy * activity_context.energy_modifier()).max(0.0) as u32,
        activity_context,
        dominant_emotion: state.momentum.emotion.clone(),
        initiative_desire,
        personality_description: state.personality_description(),
    }
}
