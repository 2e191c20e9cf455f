use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// One of lightning, fast, normal, slow.
    #[serde(default = "default_typing_mode")]
    pub mode: String,
    #[serde(default = "default_true")]
    pub show_typing_indicator: bool,
    #[serde(default = "default_true")]
    pub natural_pauses: bool,
    #[serde(default)]
    pub log_typing_timings: bool,
}

fn default_typing_mode() -> String {
    "fast".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            mode: default_typing_mode(),
            show_typing_indicator: true,
            natural_pauses: true,
            log_typing_timings: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_max_daily_initiatives")]
    pub max_daily_initiatives: u32,
    #[serde(default = "default_min_hours_between_initiatives")]
    pub min_hours_between_initiatives: f64,
    #[serde(default = "default_quiet_hours_start")]
    pub quiet_hours_start: u32,
    #[serde(default = "default_quiet_hours_end")]
    pub quiet_hours_end: u32,
    #[serde(default = "default_life_event_chance")]
    pub life_event_chance: f64,
    #[serde(default = "default_min_messages")]
    pub min_messages: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_target_sentences")]
    pub target_sentences: usize,
}

fn default_max_daily_initiatives() -> u32 {
    8
}

fn default_min_hours_between_initiatives() -> f64 {
    2.0
}

fn default_quiet_hours_start() -> u32 {
    23
}

fn default_quiet_hours_end() -> u32 {
    7
}

fn default_life_event_chance() -> f64 {
    0.15
}

fn default_min_messages() -> usize {
    3
}

fn default_max_messages() -> usize {
    7
}

fn default_target_sentences() -> usize {
    3
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            max_daily_initiatives: default_max_daily_initiatives(),
            min_hours_between_initiatives: default_min_hours_between_initiatives(),
            quiet_hours_start: default_quiet_hours_start(),
            quiet_hours_end: default_quiet_hours_end(),
            life_event_chance: default_life_event_chance(),
            min_messages: default_min_messages(),
            max_messages: default_max_messages(),
            target_sentences: default_target_sentences(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // LLM configuration (OpenAI-compatible: OpenRouter, Ollama, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,

    // Separate key pools so background jobs do not eat the dialogue quota
    #[serde(default)]
    pub dialogue_api_keys: Vec<String>,
    #[serde(default)]
    pub planning_api_keys: Vec<String>,
    #[serde(default)]
    pub analytics_api_keys: Vec<String>,
    #[serde(default)]
    pub planning_model: Option<String>,
    #[serde(default)]
    pub analytics_model: Option<String>,

    // Persona
    #[serde(default = "default_characters_dir")]
    pub characters_dir: String,
    #[serde(default)]
    pub character_id: Option<String>,

    // Memory and database
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Scheduler
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_consciousness_interval_mins")]
    pub consciousness_interval_mins: u64,
    #[serde(default = "default_true")]
    pub enable_initiative: bool,
    #[serde(default = "default_true")]
    pub enable_consolidation: bool,
    #[serde(default = "default_consolidation_interval_hours")]
    pub consolidation_interval_hours: u64,
    #[serde(default = "default_deep_consolidation_interval_hours")]
    pub deep_consolidation_interval_hours: u64,
    #[serde(default = "default_emotion_analysis_interval_hours")]
    pub emotion_analysis_interval_hours: u64,
    #[serde(default = "default_true")]
    pub enable_daily_planning: bool,

    #[serde(default)]
    pub typing: TypingConfig,

    #[serde(default)]
    pub behavior: BehaviorConfig,
}

fn default_llm_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "deepseek/deepseek-chat".to_string()
}

fn default_llm_temperature() -> f32 {
    0.85
}

fn default_llm_max_tokens() -> u32 {
    500
}

fn default_characters_dir() -> String {
    "characters".to_string()
}

fn default_database_path() -> String {
    "companion_memory.db".to_string()
}

fn default_tick_secs() -> u64 {
    60
}

fn default_consciousness_interval_mins() -> u64 {
    5
}

fn default_consolidation_interval_hours() -> u64 {
    6
}

fn default_deep_consolidation_interval_hours() -> u64 {
    24
}

fn default_emotion_analysis_interval_hours() -> u64 {
    2
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_temperature: default_llm_temperature(),
            llm_max_tokens: default_llm_max_tokens(),
            dialogue_api_keys: Vec::new(),
            planning_api_keys: Vec::new(),
            analytics_api_keys: Vec::new(),
            planning_model: None,
            analytics_model: None,
            characters_dir: default_characters_dir(),
            character_id: None,
            database_path: default_database_path(),
            tick_secs: default_tick_secs(),
            consciousness_interval_mins: default_consciousness_interval_mins(),
            enable_initiative: true,
            enable_consolidation: true,
            consolidation_interval_hours: default_consolidation_interval_hours(),
            deep_consolidation_interval_hours: default_deep_consolidation_interval_hours(),
            emotion_analysis_interval_hours: default_emotion_analysis_interval_hours(),
            enable_daily_planning: true,
            typing: TypingConfig::default(),
            behavior: BehaviorConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("companion_config.toml")
    }

    /// Load config from companion_config.toml (next to executable), falling back to env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AgentConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Directory searched for persona JSON files. Relative paths fall back to
    /// the user config dir when they do not exist in the working directory.
    pub fn resolved_characters_dir(&self) -> PathBuf {
        let configured = PathBuf::from(&self.characters_dir);
        if configured.is_absolute() || configured.exists() {
            return configured;
        }
        dirs::config_dir()
            .map(|dir| dir.join("companion").join(&self.characters_dir))
            .filter(|candidate| candidate.exists())
            .unwrap_or(configured)
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(keys) = env::var("LLM_DIALOGUE_API_KEYS") {
            config.dialogue_api_keys = split_key_list(&keys);
        }

        if let Ok(keys) = env::var("LLM_PLANNING_API_KEYS") {
            config.planning_api_keys = split_key_list(&keys);
        }

        if let Ok(keys) = env::var("LLM_ANALYTICS_API_KEYS") {
            config.analytics_api_keys = split_key_list(&keys);
        }

        if let Ok(path) = env::var("COMPANION_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(dir) = env::var("COMPANION_CHARACTERS_DIR") {
            if !dir.trim().is_empty() {
                config.characters_dir = dir;
            }
        }

        if let Ok(id) = env::var("COMPANION_CHARACTER") {
            if !id.trim().is_empty() {
                config.character_id = Some(id.trim().to_string());
            }
        }

        if let Ok(interval) = env::var("COMPANION_TICK_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.tick_secs = seconds;
            }
        }

        if let Ok(enabled) = env::var("COMPANION_ENABLE_INITIATIVE") {
            config.enable_initiative = parse_flag(&enabled);
        }

        if let Ok(enabled) = env::var("COMPANION_ENABLE_CONSOLIDATION") {
            config.enable_consolidation = parse_flag(&enabled);
        }

        if let Ok(enabled) = env::var("COMPANION_ENABLE_DAILY_PLANNING") {
            config.enable_daily_planning = parse_flag(&enabled);
        }

        if let Ok(max) = env::var("COMPANION_MAX_DAILY_INITIATIVES") {
            if let Ok(max) = max.parse() {
                config.behavior.max_daily_initiatives = max;
            }
        }

        if let Ok(mode) = env::var("COMPANION_TYPING_MODE") {
            if !mode.trim().is_empty() {
                config.typing.mode = mode.trim().to_ascii_lowercase();
            }
        }

        config
    }

    /// Model used for planning calls, defaulting to the dialogue model.
    pub fn planning_model(&self) -> &str {
        self.planning_model.as_deref().unwrap_or(&self.llm_model)
    }

    /// Model used for consolidation and analysis calls.
    pub fn analytics_model(&self) -> &str {
        self.analytics_model
            .as_deref()
            .or(self.planning_model.as_deref())
            .unwrap_or(&self.llm_model)
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

fn split_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            llm_model = "local-model"

            [behavior]
            max_daily_initiatives = 3
            "#,
        )
        .expect("parse config");

        assert_eq!(config.llm_model, "local-model");
        assert_eq!(config.behavior.max_daily_initiatives, 3);
        assert_eq!(config.behavior.min_messages, 3);
        assert_eq!(config.typing.mode, "fast");
        assert!(config.enable_consolidation);
        assert_eq!(config.consciousness_interval_mins, 5);
    }

    #[test]
    fn analytics_model_falls_back_through_planning() {
        let mut config = AgentConfig::default();
        assert_eq!(config.analytics_model(), config.llm_model);

        config.planning_model = Some("planner".to_string());
        assert_eq!(config.analytics_model(), "planner");
        assert_eq!(config.planning_model(), "planner");

        config.analytics_model = Some("analyst".to_string());
        assert_eq!(config.analytics_model(), "analyst");
    }

    #[test]
    fn key_lists_and_flags_parse() {
        assert_eq!(
            split_key_list(" a, ,b ,c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_flag("YES"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("off"));
    }
}
