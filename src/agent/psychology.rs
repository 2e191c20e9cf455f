use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersonalityTraits {
    pub extraversion: f64,
    pub agreeableness: f64,
    pub conscientiousness: f64,
    pub neuroticism: f64,
    pub openness: f64,
}

impl Default for PersonalityTraits {
    fn default() -> Self {
        Self {
            extraversion: 6.5,
            agreeableness: 7.8,
            conscientiousness: 6.2,
            neuroticism: 4.1,
            openness: 8.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraitKind {
    Extraversion,
    Agreeableness,
    Conscientiousness,
    Neuroticism,
    Openness,
}

impl TraitKind {
    pub fn from_name(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "extraversion" => Some(TraitKind::Extraversion),
            "agreeableness" => Some(TraitKind::Agreeableness),
            "conscientiousness" => Some(TraitKind::Conscientiousness),
            "neuroticism" => Some(TraitKind::Neuroticism),
            "openness" => Some(TraitKind::Openness),
            _ => None,
        }
    }
}

impl PersonalityTraits {
    fn value_mut(&mut self, kind: TraitKind) -> &mut f64 {
        match kind {
            TraitKind::Extraversion => &mut self.extraversion,
            TraitKind::Agreeableness => &mut self.agreeableness,
            TraitKind::Conscientiousness => &mut self.conscientiousness,
            TraitKind::Neuroticism => &mut self.neuroticism,
            TraitKind::Openness => &mut self.openness,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiorhythmPhase {
    Peak,
    Decline,
    Low,
    Recovery,
}

impl BiorhythmPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BiorhythmPhase::Peak => "peak",
            BiorhythmPhase::Decline => "decline",
            BiorhythmPhase::Low => "low",
            BiorhythmPhase::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalState {
    /// 0-100
    pub energy: f64,
    pub health_status: String,
    /// Hours of missed sleep.
    pub sleep_debt: f64,
    /// 0-10
    pub stress: f64,
    pub biorhythm: BiorhythmPhase,
}

impl Default for PhysicalState {
    fn default() -> Self {
        Self {
            energy: 75.0,
            health_status: "normal".to_string(),
            sleep_debt: 0.0,
            stress: 3.0,
            biorhythm: BiorhythmPhase::Peak,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalMomentum {
    pub emotion: String,
    pub intensity: f64,
    /// Minutes spent in the current emotion.
    pub duration_mins: f64,
    pub decay_rate: f64,
    pub mood_baseline: f64,
}

impl Default for EmotionalMomentum {
    fn default() -> Self {
        Self {
            emotion: "calm".to_string(),
            intensity: 5.0,
            duration_mins: 0.0,
            decay_rate: 0.1,
            mood_baseline: 6.0,
        }
    }
}

/// Values that never change at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoreValues {
    pub family_importance: u8,
    pub career_ambition: u8,
    pub creativity_drive: u8,
    pub social_connection: u8,
}

impl Default for CoreValues {
    fn default() -> Self {
        Self {
            family_importance: 8,
            career_ambition: 6,
            creativity_drive: 9,
            social_connection: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionTrigger {
    PositiveInteraction,
    Accomplishment,
    Stress,
    Conflict,
    Surprise,
    Rest,
}

impl EmotionTrigger {
    /// Resulting emotion and its base intensity.
    pub fn emotion_and_base(self) -> (&'static str, f64) {
        match self {
            EmotionTrigger::PositiveInteraction => ("happy", 2.0),
            EmotionTrigger::Accomplishment => ("satisfied", 1.5),
            EmotionTrigger::Stress => ("anxious", -2.0),
            EmotionTrigger::Conflict => ("frustrated", -1.8),
            EmotionTrigger::Surprise => ("excited", 1.2),
            EmotionTrigger::Rest => ("calm", 0.5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBlock {
    Morning,
    Work,
    Evening,
    Night,
}

impl TimeBlock {
    pub fn for_hour(hour: u32) -> Self {
        if (6..=9).contains(&hour) {
            TimeBlock::Morning
        } else if (9..=17).contains(&hour) {
            TimeBlock::Work
        } else if (17..=22).contains(&hour) {
            TimeBlock::Evening
        } else {
            TimeBlock::Night
        }
    }

    pub fn habits(self) -> &'static [&'static str] {
        match self {
            TimeBlock::Morning => &["coffee", "check_phone", "plan_day"],
            TimeBlock::Work => &["emails", "meetings", "creative_work"],
            TimeBlock::Evening => &["unwind", "social_media", "prepare_tomorrow"],
            TimeBlock::Night => &["read", "reflect", "sleep"],
        }
    }
}

/// The character's full psychological state. Owned by the running companion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    pub traits: PersonalityTraits,
    pub physical: PhysicalState,
    pub momentum: EmotionalMomentum,
    pub core_values: CoreValues,
}

impl CharacterState {
    /// Blend a new emotion into the current one. Older emotions lose weight the
    /// longer they have lasted.
    pub fn update_emotional_state(&mut self, trigger: EmotionTrigger, intensity: f64) {
        let (emotion, mut base) = trigger.emotion_and_base();

        if self.traits.neuroticism > 7.0 {
            base *= 1.3;
        }
        if self.traits.extraversion > 7.0 {
            base *= 1.1;
        }

        let decay_factor = 1.0 - self.momentum.duration_mins * 0.01;
        let mixed = self.momentum.intensity * decay_factor * 0.6 + base * intensity * 0.4;

        self.momentum.emotion = emotion.to_string();
        self.momentum.intensity = mixed;
        self.momentum.duration_mins = 0.0;
    }

    pub fn decay_emotions(&mut self, minutes: f64) {
        self.momentum.duration_mins += minutes;
        self.momentum.intensity *= (-self.momentum.decay_rate * minutes).exp();

        if self.momentum.intensity < 0.5 {
            self.momentum.emotion = "calm".to_string();
            self.momentum.intensity = 0.5;
        }
    }

    pub fn personality_description(&self) -> String {
        let t = &self.traits;
        let mut labels = Vec::new();

        if t.extraversion > 7.0 {
            labels.push("sociable");
        } else if t.extraversion < 4.0 {
            labels.push("introverted");
        }
        if t.agreeableness > 7.0 {
            labels.push("kind");
        }
        if t.conscientiousness > 7.0 {
            labels.push("responsible");
        }
        if t.neuroticism > 7.0 {
            labels.push("emotional");
        } else if t.neuroticism < 4.0 {
            labels.push("calm");
        }
        if t.openness > 7.0 {
            labels.push("open to new things");
        }

        if labels.is_empty() {
            "balanced".to_string()
        } else {
            labels.join(", ")
        }
    }

    pub fn adjust_traits(&mut self, changes: &[(TraitKind, f64)]) {
        for (kind, delta) in changes {
            let value = self.traits.value_mut(*kind);
            *value = (*value + delta).clamp(0.0, 10.0);
        }
    }

    pub fn current_habit<R: Rng + ?Sized>(&self, hour: u32, rng: &mut R) -> &'static str {
        TimeBlock::for_hour(hour)
            .habits()
            .choose(rng)
            .copied()
            .unwrap_or("rest")
    }

    /// Energy follows the clock; stress builds during working hours and eases off after.
    pub fn update_physical_state(&mut self, hour: u32) {
        let (energy, phase) = match hour {
            6..=8 => (85.0, BiorhythmPhase::Recovery),
            9..=12 => (90.0, BiorhythmPhase::Peak),
            13..=17 => (75.0, BiorhythmPhase::Decline),
            18..=21 => (60.0, BiorhythmPhase::Decline),
            _ => (30.0, BiorhythmPhase::Low),
        };
        self.physical.energy = energy;
        self.physical.biorhythm = phase;

        if (9..=18).contains(&hour) {
            self.physical.stress = (self.physical.stress + 0.5).min(8.0);
        } else {
            self.physical.stress = (self.physical.stress - 0.3).max(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn positive_interaction_blends_with_current_intensity() {
        let mut state = CharacterState::default();
        state.update_emotional_state(EmotionTrigger::PositiveInteraction, 1.0);

        // 5.0 * 1.0 * 0.6 + 2.0 * 1.0 * 0.4
        assert_eq!(state.momentum.emotion, "happy");
        assert!((state.momentum.intensity - 3.8).abs() < 1e-9);
        assert_eq!(state.momentum.duration_mins, 0.0);
    }

    #[test]
    fn reactive_personalities_amplify_base_intensity() {
        let mut state = CharacterState::default();
        state.traits.neuroticism = 8.0;
        state.traits.extraversion = 8.0;
        state.momentum.intensity = 0.0;
        state.update_emotional_state(EmotionTrigger::Surprise, 1.0);

        let expected = 1.2 * 1.3 * 1.1 * 0.4;
        assert!((state.momentum.intensity - expected).abs() < 1e-9);
        assert_eq!(state.momentum.emotion, "excited");
    }

    #[test]
    fn long_lasting_emotion_carries_less_weight() {
        let mut state = CharacterState::default();
        state.momentum.duration_mins = 50.0;
        state.update_emotional_state(EmotionTrigger::Rest, 1.0);
        // 5.0 * 0.5 * 0.6 + 0.5 * 0.4
        assert!((state.momentum.intensity - 1.7).abs() < 1e-9);
    }

    #[test]
    fn decay_snaps_back_to_calm() {
        let mut state = CharacterState::default();
        state.momentum.emotion = "happy".to_string();
        state.momentum.intensity = 4.0;

        state.decay_emotions(5.0);
        assert_eq!(state.momentum.emotion, "happy");
        assert!((state.momentum.intensity - 4.0 * (-0.5f64).exp()).abs() < 1e-9);
        assert_eq!(state.momentum.duration_mins, 5.0);

        state.decay_emotions(30.0);
        assert_eq!(state.momentum.emotion, "calm");
        assert_eq!(state.momentum.intensity, 0.5);
        assert_eq!(state.momentum.duration_mins, 35.0);
    }

    #[test]
    fn personality_description_uses_thresholds() {
        let state = CharacterState::default();
        assert_eq!(state.personality_description(), "kind, open to new things");

        let mut neutral = CharacterState::default();
        neutral.traits = PersonalityTraits {
            extraversion: 5.0,
            agreeableness: 5.0,
            conscientiousness: 5.0,
            neuroticism: 5.0,
            openness: 5.0,
        };
        assert_eq!(neutral.personality_description(), "balanced");
    }

    #[test]
    fn trait_adjustments_are_clamped() {
        let mut state = CharacterState::default();
        state.adjust_traits(&[(TraitKind::Openness, 5.0), (TraitKind::Neuroticism, -9.0)]);
        assert_eq!(state.traits.openness, 10.0);
        assert_eq!(state.traits.neuroticism, 0.0);
        assert_eq!(TraitKind::from_name(" Openness "), Some(TraitKind::Openness));
        assert_eq!(TraitKind::from_name("charisma"), None);
    }

    #[test]
    fn physical_state_follows_the_clock() {
        let mut state = CharacterState::default();
        state.update_physical_state(10);
        assert_eq!(state.physical.energy, 90.0);
        assert_eq!(state.physical.stress, 3.5);

        state.physical.stress = 7.8;
        state.update_physical_state(14);
        assert_eq!(state.physical.stress, 8.0);

        state.physical.stress = 1.1;
        state.update_physical_state(2);
        assert_eq!(state.physical.energy, 30.0);
        assert_eq!(state.physical.stress, 1.0);
        assert_eq!(state.physical.biorhythm, BiorhythmPhase::Low);
    }

    #[test]
    fn habit_comes_from_the_hours_block() {
        let state = CharacterState::default();
        let mut rng = StdRng::seed_from_u64(7);
        let habit = state.current_habit(7, &mut rng);
        assert!(TimeBlock::Morning.habits().contains(&habit));
        assert_eq!(TimeBlock::for_hour(9), TimeBlock::Morning);
        assert_eq!(TimeBlock::for_hour(23), TimeBlock::Night);
    }
}
