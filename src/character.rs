use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::planning::FutureDesire;
use crate::agent::virtual_life::ScheduleTemplate;
use crate::database::AgentDatabase;

const CURRENT_CHARACTER_KEY: &str = "current_character";
const INTIMACY_STEP: f64 = 0.1;
const INTIMACY_GROWTH_CHANCE: f64 = 0.1;
const MAX_INTIMACY: f64 = 10.0;

/// Persona profile as stored in `<characters_dir>/<id>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Persona {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub personality: PersonalityProfile,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub speech: SpeechProfile,
    #[serde(default)]
    pub default_relationship: DefaultRelationship,
    #[serde(default)]
    pub behavior: BehaviorProfile,
    /// Extra entries merged into the automatic weekly schedule.
    #[serde(default)]
    pub schedule_extras: Vec<ScheduleTemplate>,
    /// Per activity type fallback phrases for the humanizer.
    #[serde(default)]
    pub humanizer_fallbacks: HashMap<String, String>,
    /// Activity types offered to the daily planner.
    #[serde(default)]
    pub planning_activity_types: Vec<ActivityTypeEntry>,
    #[serde(default)]
    pub future_desires: Vec<DesireSeed>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalityProfile {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub key_traits: Vec<String>,
    /// Emotion name -> how the persona shows it.
    #[serde(default)]
    pub emotional_patterns: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechProfile {
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub catchphrases: Vec<String>,
    #[serde(default)]
    pub text_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultRelationship {
    #[serde(rename = "type", default = "default_relationship_type")]
    pub kind: String,
    #[serde(default = "default_stage")]
    pub initial_stage: String,
    #[serde(default = "default_intimacy")]
    pub initial_intimacy: f64,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub current_dynamic: String,
    #[serde(default)]
    pub pet_names: PetNames,
}

fn default_relationship_type() -> String {
    "friends".to_string()
}

fn default_stage() -> String {
    "getting to know each other".to_string()
}

fn default_intimacy() -> f64 {
    1.0
}

impl Default for DefaultRelationship {
    fn default() -> Self {
        Self {
            kind: default_relationship_type(),
            initial_stage: default_stage(),
            initial_intimacy: default_intimacy(),
            backstory: String::new(),
            current_dynamic: String::new(),
            pet_names: PetNames::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PetNames {
    #[serde(default)]
    pub calls_partner: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorProfile {
    #[serde(default)]
    pub initiative_topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTypeEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesireSeed {
    pub text: String,
    #[serde(default = "default_desire_priority")]
    pub priority: u32,
    #[serde(default)]
    pub category: String,
}

fn default_desire_priority() -> u32 {
    5
}

/// Evolving relationship with the user, persisted per persona in `agent_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipState {
    #[serde(rename = "type")]
    pub kind: String,
    pub stage: String,
    pub intimacy_level: f64,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub current_dynamic: String,
    #[serde(default)]
    pub events: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub last_positive_interaction: Option<DateTime<Utc>>,
}

impl RelationshipState {
    pub fn from_defaults(defaults: &DefaultRelationship, now: DateTime<Utc>) -> Self {
        Self {
            kind: defaults.kind.clone(),
            stage: defaults.initial_stage.clone(),
            intimacy_level: defaults.initial_intimacy.clamp(0.0, MAX_INTIMACY),
            backstory: defaults.backstory.clone(),
            current_dynamic: defaults.current_dynamic.clone(),
            events: Vec::new(),
            created_at: now,
            last_updated: now,
            last_positive_interaction: None,
        }
    }

    pub fn is_romantic(&self) -> bool {
        let kind = self.kind.to_lowercase();
        ["romantic", "partner", "dating", "girlfriend", "boyfriend", "couple"]
            .iter()
            .any(|word| kind.contains(word))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersonaSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub file: PathBuf,
}

fn relationship_key(persona_id: &str) -> String {
    format!("relationship:{}", persona_id)
}

pub fn parse_persona(content: &str, fallback_id: &str) -> Result<Persona> {
    let mut persona: Persona =
        serde_json::from_str(content).context("Failed to parse persona JSON")?;
    if persona.id.trim().is_empty() {
        persona.id = fallback_id.to_string();
    }
    Ok(persona)
}

pub struct CharacterLoader {
    characters_dir: PathBuf,
    current: Option<Persona>,
    relationship: Option<RelationshipState>,
}

impl CharacterLoader {
    pub fn new(characters_dir: impl Into<PathBuf>) -> Self {
        Self {
            characters_dir: characters_dir.into(),
            current: None,
            relationship: None,
        }
    }

    pub fn characters_dir(&self) -> &Path {
        &self.characters_dir
    }

    pub fn list_available(&self) -> Vec<PersonaSummary> {
        let entries = match fs::read_dir(&self.characters_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot read characters dir {:?}: {}", self.characters_dir, e);
                return Vec::new();
            }
        };

        let mut personas = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| parse_persona(&content, &stem));
            match parsed {
                Ok(persona) => personas.push(PersonaSummary {
                    id: stem,
                    name: persona.name,
                    description: persona.short_description,
                    file: path,
                }),
                Err(e) => tracing::error!("Failed to load persona {:?}: {}", path, e),
            }
        }
        personas.sort_by(|a, b| a.id.cmp(&b.id));
        personas
    }

    /// Load a persona by id and restore (or start) its relationship state.
    pub fn load(&mut self, db: &AgentDatabase, persona_id: &str) -> Result<&Persona> {
        let path = self.characters_dir.join(format!("{}.json", persona_id));
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read persona from {:?}", path))?;
        let persona = parse_persona(&content, persona_id)?;
        self.install(db, persona)
    }

    /// Restore the previously selected persona, else `fallback_id`.
    pub fn load_current(&mut self, db: &AgentDatabase, fallback_id: Option<&str>) -> Result<Option<&Persona>> {
        let stored = db.get_state(CURRENT_CHARACTER_KEY)?;
        let candidates = stored.iter().map(String::as_str).chain(fallback_id);
        for id in candidates {
            if let Err(e) = self.load(db, id) {
                tracing::warn!("Persona '{}' unavailable: {}", id, e);
                continue;
            }
            return Ok(self.current.as_ref());
        }
        Ok(None)
    }

    pub fn install(&mut self, db: &AgentDatabase, persona: Persona) -> Result<&Persona> {
        let relationship = match db.get_state(&relationship_key(&persona.id))? {
            Some(raw) => serde_json::from_str(&raw).with_context(|| {
                format!("Corrupt relationship state for persona {}", persona.id)
            })?,
            None => {
                let fresh = RelationshipState::from_defaults(&persona.default_relationship, Utc::now());
                db.set_state(&relationship_key(&persona.id), &serde_json::to_string(&fresh)?)?;
                fresh
            }
        };
        db.set_state(CURRENT_CHARACTER_KEY, &persona.id)?;
        tracing::info!(
            "Persona loaded: {} (intimacy {:.1})",
            persona.name,
            relationship.intimacy_level
        );
        self.relationship = Some(relationship);
        Ok(&*self.current.insert(persona))
    }

    pub fn current(&self) -> Option<&Persona> {
        self.current.as_ref()
    }

    pub fn relationship(&self) -> Option<&RelationshipState> {
        self.relationship.as_ref()
    }

    pub fn intimacy(&self) -> f64 {
        self.relationship
            .as_ref()
            .map(|rel| rel.intimacy_level)
            .unwrap_or_else(default_intimacy)
    }

    pub fn update_relationship_progress<F>(&mut self, db: &AgentDatabase, update: F) -> Result<()>
    where
        F: FnOnce(&mut RelationshipState),
    {
        let persona_id = self
            .current
            .as_ref()
            .map(|persona| persona.id.clone())
            .ok_or_else(|| anyhow!("No persona loaded"))?;
        let relationship = self
            .relationship
            .as_mut()
            .ok_or_else(|| anyhow!("No relationship state"))?;

        update(relationship);
        relationship.intimacy_level = relationship.intimacy_level.clamp(0.0, MAX_INTIMACY);
        relationship.last_updated = Utc::now();
        db.set_state(&relationship_key(&persona_id), &serde_json::to_string(relationship)?)?;
        Ok(())
    }

    /// After a conversation that left the persona in a good mood, intimacy may grow.
    /// Returns the new level when it changed.
    pub fn record_interaction_outcome(
        &mut self,
        db: &AgentDatabase,
        mood_after: &str,
        roll: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let positive = matches!(mood_after, "happy" | "excited" | "content");
        if !positive || roll >= INTIMACY_GROWTH_CHANCE || self.relationship.is_none() {
            return Ok(None);
        }

        let mut new_level = None;
        self.update_relationship_progress(db, |rel| {
            rel.intimacy_level = (rel.intimacy_level + INTIMACY_STEP).min(MAX_INTIMACY);
            rel.last_positive_interaction = Some(now);
            new_level = Some(rel.intimacy_level);
        })?;
        if let Some(level) = new_level {
            tracing::info!("Intimacy grew to {:.1}", level);
        }
        Ok(new_level)
    }

    /// Seed the persona's long-term wishes once, when none are pending.
    pub fn seed_future_desires(&self, db: &AgentDatabase) -> Result<usize> {
        let Some(persona) = self.current.as_ref() else {
            return Ok(0);
        };
        if persona.future_desires.is_empty() || !db.get_pending_desires(1)?.is_empty() {
            return Ok(0);
        }
        for seed in &persona.future_desires {
            db.add_future_desire(&FutureDesire::new(&seed.text, seed.priority, &seed.category))?;
        }
        Ok(persona.future_desires.len())
    }

    pub fn initiative_topic<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<String> {
        self.current
            .as_ref()
            .and_then(|persona| persona.behavior.initiative_topics.choose(rng))
            .cloned()
    }

    pub fn context_for_ai(&self) -> String {
        let Some(persona) = self.current.as_ref() else {
            return "No persona loaded".to_string();
        };

        let mut parts = vec![format!("CHARACTER: {}", persona.name)];
        if let Some(age) = persona.age {
            parts.push(format!("Age: {}", age));
        }
        if !persona.personality.description.is_empty() {
            parts.push(format!("Description: {}", persona.personality.description));
        }
        if !persona.personality.key_traits.is_empty() {
            let traits: Vec<&str> = persona
                .personality
                .key_traits
                .iter()
                .take(5)
                .map(String::as_str)
                .collect();
            parts.push(format!("Traits: {}", traits.join(", ")));
        }

        if let Some(rel) = self.relationship.as_ref() {
            parts.push("\nRELATIONSHIP:".to_string());
            parts.push(format!("Type: {}", rel.kind));
            parts.push(format!("Stage: {}", rel.stage));
            parts.push(format!("Intimacy: {:.1}/10", rel.intimacy_level));
            if !rel.backstory.is_empty() {
                parts.push(format!("Backstory: {}", rel.backstory));
            }
            if !rel.current_dynamic.is_empty() {
                parts.push(format!("Current dynamic: {}", rel.current_dynamic));
            }
        }

        if !persona.speech.style.is_empty() {
            parts.push("\nSPEECH:".to_string());
            parts.push(format!("Style: {}", persona.speech.style));
            if !persona.speech.catchphrases.is_empty() {
                let phrases: Vec<&str> = persona
                    .speech
                    .catchphrases
                    .iter()
                    .take(3)
                    .map(String::as_str)
                    .collect();
                parts.push(format!("Catchphrases: {}", phrases.join(", ")));
            }
        }

        if !persona.interests.is_empty() {
            let interests: Vec<&str> = persona.interests.iter().take(4).map(String::as_str).collect();
            parts.push(format!("\nINTERESTS: {}", interests.join(", ")));
        }

        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MARIN: &str = r#"{
        "name": "Marin",
        "age": 22,
        "short_description": "cosplayer",
        "personality": {
            "description": "bubbly and warm",
            "key_traits": ["open", "cheerful", "curious", "stubborn", "kind", "loud"],
            "emotional_patterns": {"happy": "uses lots of exclamation marks"}
        },
        "interests": ["cosplay", "anime", "sewing", "photography", "games"],
        "speech": {"style": "casual", "catchphrases": ["So cool!", "No way!"]},
        "default_relationship": {
            "type": "romantic",
            "initial_intimacy": 4,
            "backstory": "met at a convention",
            "pet_names": {"calls_partner": ["sunshine"]}
        },
        "behavior": {"initiative_topics": ["share a costume idea"]},
        "future_desires": [{"text": "finish the new costume", "priority": 8, "category": "hobby"}]
    }"#;

    fn setup() -> (TempDir, AgentDatabase, CharacterLoader) {
        let dir = tempfile::tempdir().expect("tempdir");
        let characters = dir.path().join("characters");
        fs::create_dir_all(&characters).expect("characters dir");
        fs::write(characters.join("marin.json"), MARIN).expect("persona file");
        fs::write(characters.join("broken.json"), "{ not json").expect("broken file");
        let db = AgentDatabase::new(dir.path().join("agent.db")).expect("db init");
        (dir, db, CharacterLoader::new(characters))
    }

    #[test]
    fn lists_and_loads_personas() {
        let (_dir, db, mut loader) = setup();
        let available = loader.list_available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, "marin");

        let persona = loader.load(&db, "marin").expect("load");
        assert_eq!(persona.id, "marin");
        assert_eq!(persona.age, Some(22));
        assert!(loader.relationship().expect("relationship").is_romantic());
        assert_eq!(loader.intimacy(), 4.0);
        assert_eq!(db.get_state(CURRENT_CHARACTER_KEY).expect("state").as_deref(), Some("marin"));
    }

    #[test]
    fn relationship_survives_reload() {
        let (_dir, db, mut loader) = setup();
        loader.load(&db, "marin").expect("load");
        let now = Utc::now();

        assert_eq!(loader.record_interaction_outcome(&db, "sad", 0.0, now).expect("update"), None);
        assert_eq!(loader.record_interaction_outcome(&db, "happy", 0.5, now).expect("update"), None);
        let grown = loader.record_interaction_outcome(&db, "happy", 0.05, now).expect("update");
        assert!((grown.expect("grew") - 4.1).abs() < 1e-9);

        let mut reloaded = CharacterLoader::new(loader.characters_dir().to_path_buf());
        reloaded.load_current(&db, None).expect("load current");
        assert!((reloaded.intimacy() - 4.1).abs() < 1e-9);
        assert!(reloaded.relationship().expect("relationship").last_positive_interaction.is_some());
    }

    #[test]
    fn context_lists_persona_details() {
        let (_dir, db, mut loader) = setup();
        assert_eq!(loader.context_for_ai(), "No persona loaded");
        loader.load(&db, "marin").expect("load");

        let context = loader.context_for_ai();
        assert!(context.starts_with("CHARACTER: Marin"));
        assert!(context.contains("Traits: open, cheerful, curious, stubborn, kind\n"));
        assert!(context.contains("Intimacy: 4.0/10"));
        assert!(context.contains("Catchphrases: So cool!, No way!"));
        assert!(context.contains("INTERESTS: cosplay, anime, sewing, photography"));
    }

    #[test]
    fn desires_are_seeded_once() {
        let (_dir, db, mut loader) = setup();
        loader.load(&db, "marin").expect("load");
        assert_eq!(loader.seed_future_desires(&db).expect("seed"), 1);
        assert_eq!(loader.seed_future_desires(&db).expect("seed"), 0);
        assert_eq!(db.get_pending_desires(10).expect("desires")[0].priority, 8);
    }

    #[test]
    fn missing_persona_falls_back() {
        let (_dir, db, mut loader) = setup();
        assert!(loader.load(&db, "nobody").is_err());
        let loaded = loader.load_current(&db, Some("marin")).expect("load current");
        assert_eq!(loaded.map(|persona| persona.name.as_str()), Some("Marin"));
    }
}
