pub mod humanizer;
pub mod initiative;
pub mod mood;
pub mod planning;
pub mod psychology;
pub mod typing;
pub mod virtual_life;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, Timelike, Utc, Weekday};
use flume::Sender;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::character::{CharacterLoader, Persona};
use crate::config::AgentConfig;
use crate::database::AgentDatabase;
use crate::llm_client::{ChatModel, ChatOptions, LlmPool, LlmPurpose, Message};
use crate::memory::consolidation::{MemoryConsolidator, ENRICHMENT_BATCH};
use crate::memory::short_term::ShortTermMemory;
use crate::memory::{MemoryManager, MemoryType};
use crate::prompts::{self, PromptContext, QuestionType, ReplyShape};
use humanizer::ActivityHumanizer;
use initiative::{
    check_gate, initiative_topic, pick_life_event, should_send_initiative, ActivityView,
    GateLimits, GateVerdict, InitiativeInputs,
};
use mood::{mood_snapshot, MoodSnapshot};
use planning::{DailyPlanner, FutureDesire, PlanningReport};
use psychology::{CharacterState, EmotionTrigger};
use typing::{MessageSink, TypingSimulator};
use virtual_life::{end_notification, start_notification, PlannedActivity, VirtualLifeManager};

const COMPANION_STATE_KEY: &str = "companion_state";
const CONSCIOUSNESS_LAST_RUN_STATE_KEY: &str = "consciousness_last_run_at";
const VIRTUAL_LIFE_LAST_RUN_STATE_KEY: &str = "virtual_life_last_run_at";
const CONSOLIDATION_LAST_RUN_STATE_KEY: &str = "consolidation_last_run_at";
const DEEP_CONSOLIDATION_LAST_RUN_STATE_KEY: &str = "deep_consolidation_last_run_at";
const ENRICHMENT_LAST_RUN_STATE_KEY: &str = "emotion_enrichment_last_run_at";
const PLANNING_ATTEMPT_STATE_KEY: &str = "daily_planning_attempt_at";
const COUNTERS_DATE_STATE_KEY: &str = "daily_counters_date";
const AUTO_SCHEDULE_DATE_STATE_KEY: &str = "auto_schedule_date";

const VIRTUAL_LIFE_INTERVAL_MINS: i64 = 1;
const PLANNING_RETRY_HOURS: i64 = 1;
const PLANNING_EARLIEST_HOUR: u32 = 6;
const SCHEDULE_LOOKAHEAD_HOURS: i64 = 72;
const RECENT_TOPICS_KEPT: usize = 10;
const PERSONA_TOPIC_CHANCE: f64 = 0.5;
const INITIATIVE_MARKER: &str = "[INITIATIVE]";
const INITIATIVE_MEMORY_QUERY: &str = "initiative conversation";
const DIALOGUE_TOP_P: f32 = 0.95;
const EMOTIONAL_RECALL_MIN_INTENSITY: f64 = 6.0;

/// What an outbound batch of messages is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    Initiative,
    ActivityStarted,
    ActivityEnded,
}

impl OutboundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundKind::Initiative => "initiative",
            OutboundKind::ActivityStarted => "activity_started",
            OutboundKind::ActivityEnded => "activity_ended",
        }
    }
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Messages the companion wants to send without being asked.
    Outbound {
        kind: OutboundKind,
        messages: Vec<String>,
    },
    Observation(String),
    Error(String),
}

/// Runtime state that survives restarts, stored as JSON in `agent_state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanionState {
    #[serde(default)]
    pub character: CharacterState,
    #[serde(default)]
    pub short_term: ShortTermMemory,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_initiative_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub initiatives_today: u32,
    #[serde(default)]
    pub recent_topics: Vec<String>,
    #[serde(skip)]
    pub activity_just_completed: bool,
}

pub struct Companion {
    config: AgentConfig,
    db: Arc<AgentDatabase>,
    llm: Arc<dyn ChatModel>,
    pool: Option<Arc<LlmPool>>,
    memory: MemoryManager,
    characters: RwLock<CharacterLoader>,
    life: RwLock<VirtualLifeManager>,
    humanizer: ActivityHumanizer,
    typing: RwLock<TypingSimulator>,
    state: RwLock<CompanionState>,
    event_tx: Sender<AgentEvent>,
}

impl Companion {
    pub fn new(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        let db = AgentDatabase::new(&config.database_path)
            .with_context(|| format!("Failed to open database {}", config.database_path))?;
        tracing::info!("Companion database initialized: {}", config.database_path);

        let pool = Arc::new(LlmPool::from_config(&config));
        let llm: Arc<dyn ChatModel> = pool.clone();
        Self::assemble(config, Arc::new(db), llm, Some(pool), event_tx)
    }

    /// Build around an existing database and model, without a key pool.
    pub fn with_model(
        config: AgentConfig,
        db: Arc<AgentDatabase>,
        llm: Arc<dyn ChatModel>,
        event_tx: Sender<AgentEvent>,
    ) -> Result<Self> {
        Self::assemble(config, db, llm, None, event_tx)
    }

    fn assemble(
        config: AgentConfig,
        db: Arc<AgentDatabase>,
        llm: Arc<dyn ChatModel>,
        pool: Option<Arc<LlmPool>>,
        event_tx: Sender<AgentEvent>,
    ) -> Result<Self> {
        let mut characters = CharacterLoader::new(config.resolved_characters_dir());
        let loaded = characters
            .load_current(&db, config.character_id.as_deref())?
            .is_some();
        if !loaded {
            match characters.list_available().into_iter().next() {
                Some(first) => {
                    if let Err(e) = characters.load(&db, &first.id) {
                        tracing::warn!("Failed to load persona {}: {}", first.id, e);
                    }
                }
                None => tracing::warn!(
                    "No personas found in {}, using the generic prompt",
                    characters.characters_dir().display()
                ),
            }
        }
        match characters.seed_future_desires(&db) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Seeded {} future desires from the persona", n),
            Err(e) => tracing::warn!("Failed to seed future desires: {}", e),
        }

        let humanizer = match characters.current() {
            Some(persona) => ActivityHumanizer::new(
                humanizer_persona(persona),
                persona.humanizer_fallbacks.clone(),
            ),
            None => ActivityHumanizer::default(),
        };

        let state = match db.get_state(COMPANION_STATE_KEY)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Stored companion state is unreadable, starting fresh: {}", e);
                CompanionState::default()
            }),
            None => CompanionState::default(),
        };

        let life = VirtualLifeManager::new(db.clone())?;
        let typing = TypingSimulator::from_config(&config.typing);
        let memory = MemoryManager::new(db.clone());

        Ok(Self {
            config,
            db,
            llm,
            pool,
            memory,
            characters: RwLock::new(characters),
            life: RwLock::new(life),
            humanizer,
            typing: RwLock::new(typing),
            state: RwLock::new(state),
            event_tx,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<AgentDatabase> {
        &self.db
    }

    pub async fn persona_name(&self) -> Option<String> {
        self.characters
            .read()
            .await
            .current()
            .map(|persona| persona.name.clone())
    }

    async fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn persist_state(&self) {
        let raw = {
            let state = self.state.read().await;
            serde_json::to_string(&*state)
        };
        match raw {
            Ok(raw) => {
                if let Err(e) = self.db.set_state(COMPANION_STATE_KEY, &raw) {
                    tracing::warn!("Failed to persist companion state: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize companion state: {}", e),
        }
    }

    async fn snapshot(&self, now: DateTime<Utc>) -> MoodSnapshot {
        let local = now.with_timezone(&Local);
        let state = self.state.read().await;
        let mut rng = rand::rng();
        mood_snapshot(
            &state.character,
            local.hour(),
            is_weekend(local.weekday()),
            &mut rng,
        )
    }

    // ─── Dialogue ───

    /// Answer one user message with a list of chat fragments. Never fails:
    /// internal errors turn into canned replies.
    pub async fn process_user_message(&self, text: &str) -> Vec<String> {
        match self.respond(text, Utc::now()).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!("Failed to process message: {:#}", e);
                self.emit(AgentEvent::Error(e.to_string())).await;
                prompts::error_replies()
            }
        }
    }

    async fn respond(&self, text: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let hour = now.with_timezone(&Local).hour();
        let mood_before = {
            let mut state = self.state.write().await;
            let before = state.character.momentum.emotion.clone();
            state
                .character
                .update_emotional_state(EmotionTrigger::PositiveInteraction, 1.0);
            state.short_term.record_conversation(text, hour);
            for fact in crate::memory::extract_facts(text) {
                state
                    .short_term
                    .add(&fact.content, fact.memory_type, fact.importance, 0.0, now);
            }
            before
        };

        let snapshot = self.snapshot(now).await;
        let messages = self.generate_reply(text, text, &snapshot, now).await?;

        let mood_after = self.state.read().await.character.momentum.emotion.clone();
        match self
            .memory
            .save_conversation(text, &messages, &mood_before, &mood_after, false)
        {
            Ok(conversation_id) => tracing::info!(
                "Conversation {} saved ({} messages, {} -> {})",
                conversation_id,
                messages.len(),
                mood_before,
                mood_after
            ),
            Err(e) => tracing::error!("Failed to save conversation: {:#}", e),
        }

        {
            let roll = rand::random::<f64>();
            let mut characters = self.characters.write().await;
            if let Err(e) = characters.record_interaction_outcome(&self.db, &mood_after, roll, now) {
                tracing::warn!("Failed to update relationship progress: {}", e);
            }
        }

        self.state.write().await.last_message_at = Some(now);
        self.persist_state().await;
        Ok(messages)
    }

    async fn generate_reply(
        &self,
        user_text: &str,
        memory_query: &str,
        snapshot: &MoodSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let memory_context = self.memory.build_context_for_prompt(memory_query)?;
        let life_context = self.life.read().await.context_for_ai(now)?;
        let recent_events = self.short_term_context(memory_query, now).await;
        let emotional = self.emotional_context(&snapshot.dominant_emotion);
        let shape = ReplyShape::from(&self.config.behavior);

        let prompt_context = PromptContext {
            time_label: now.with_timezone(&Local).format("%H:%M, %A").to_string(),
            mood: snapshot.label.as_str().to_string(),
            energy: snapshot.energy_level,
            emotion: snapshot.dominant_emotion.clone(),
            memory_context: join_nonempty(&[memory_context, emotional, recent_events]),
            life_context,
        };

        let (persona, system, question) = {
            let characters = self.characters.read().await;
            let system = match characters.current().zip(characters.relationship()) {
                Some(pair) => prompts::system_prompt(Some(pair), &prompt_context, shape),
                None => prompts::fallback_prompt(&prompt_context, shape),
            };
            let interests = characters
                .current()
                .map(|p| p.interests.as_slice())
                .unwrap_or(&[]);
            let question = QuestionType::classify(user_text, interests);
            (characters.current().cloned(), system, question)
        };
        let name = persona.as_ref().map(|p| p.name.as_str());
        tracing::debug!(
            "Generating a reply as {} ({})",
            name.unwrap_or("companion"),
            question.as_str()
        );

        let messages = vec![
            Message::system(system),
            Message::user(prompts::enhance_user_message(user_text, question, name)),
        ];
        let options = ChatOptions::new(self.config.llm_temperature, self.config.llm_max_tokens)
            .with_top_p(DIALOGUE_TOP_P);

        let raw = match self.llm.chat(LlmPurpose::Dialogue, messages, options).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Dialogue model failed, using fallback replies: {}", e);
                return Ok(prompts::fallback_replies(name, question));
            }
        };

        let mut replies = prompts::split_response(&raw, shape);
        if replies.is_empty() {
            return Ok(prompts::fallback_replies(name, question));
        }
        if replies.len() < shape.min_messages || prompts::is_generic(&replies, persona.as_ref()) {
            let mut rng = rand::rng();
            replies = prompts::improve_response(replies, persona.as_ref(), question, shape, &mut rng);
        }
        Ok(replies)
    }

    async fn short_term_context(&self, query: &str, now: DateTime<Utc>) -> String {
        let entries = self.state.write().await.short_term.relevant(query, 3, now);
        if entries.is_empty() {
            return String::new();
        }
        let mut lines = vec!["FRESH IN YOUR MIND:".to_string()];
        lines.extend(entries.into_iter().map(|entry| format!("- {}", entry.content)));
        lines.join("\n")
    }

    fn emotional_context(&self, emotion: &str) -> String {
        let memories = match self
            .memory
            .emotional_memories(Some(emotion), EMOTIONAL_RECALL_MIN_INTENSITY, 2)
        {
            Ok(memories) => memories,
            Err(e) => {
                tracing::warn!("Emotional recall failed: {}", e);
                return String::new();
            }
        };
        if memories.is_empty() {
            return String::new();
        }
        let mut lines = vec![format!("WHEN YOU FELT {} BEFORE:", emotion.to_uppercase())];
        lines.extend(memories.into_iter().map(|m| format!("- {}", m.content)));
        lines.join("\n")
    }

    /// Deliver fragments through a transport with human-like typing delays.
    pub async fn deliver<S: MessageSink + ?Sized>(&self, sink: &S, messages: &[String]) -> Result<()> {
        let snapshot = self.snapshot(Utc::now()).await;
        let typing = {
            let mut typing = self.typing.write().await;
            typing.adapt_to(&snapshot.dominant_emotion, snapshot.energy_level);
            typing.clone()
        };
        typing
            .send_with_timing(sink, messages, &snapshot.dominant_emotion, snapshot.energy_level)
            .await
    }

    pub fn add_future_desire(&self, text: &str, priority: u32, category: &str) -> Result<FutureDesire> {
        let desire = FutureDesire::new(text, priority, category);
        self.db.add_future_desire(&desire)?;
        tracing::info!("New future desire: {} ({})", desire.desire_text, desire.category);
        Ok(desire)
    }

    // ─── Reports ───

    pub async fn status_report(&self) -> Result<String> {
        let now = Utc::now();
        let summary = self.memory.conversation_summary(now)?;
        let name = self
            .persona_name()
            .await
            .unwrap_or_else(|| "Companion".to_string());
        let activity = self
            .life
            .read()
            .await
            .current_activity()
            .map(|a| a.description.clone())
            .unwrap_or_else(|| "free time".to_string());
        let (initiatives, last_message) = {
            let state = self.state.read().await;
            (state.initiatives_today, state.last_message_at)
        };
        let mode = self.typing.read().await.mode();

        let mut lines = vec![
            format!("{} is online", name),
            format!("Doing: {}", activity),
            format!(
                "Initiatives today: {}/{}",
                initiatives, self.config.behavior.max_daily_initiatives
            ),
            format!(
                "Conversations: {} this week, {} total",
                summary.recent_conversations,
                self.db.count_conversations()?
            ),
            format!("Memories: {}", summary.total_memories),
            format!("Typing: {}", mode.as_str()),
        ];
        if let Some(at) = last_message {
            lines.push(format!(
                "Last message: {}",
                at.with_timezone(&Local).format("%d.%m %H:%M")
            ));
        }
        Ok(lines.join("\n"))
    }

    pub async fn mood_report(&self) -> String {
        let snapshot = self.snapshot(Utc::now()).await;
        let intimacy = self.characters.read().await.intimacy();
        format!(
            "Mood: {} ({:.1}/10)\nEmotion: {}\nEnergy: {}/100\nWants to talk: {}/10\nCloseness: {:.1}/10",
            snapshot.label.as_str(),
            snapshot.mood_value,
            snapshot.dominant_emotion,
            snapshot.energy_level,
            snapshot.initiative_desire.max(0),
            intimacy
        )
    }

    pub fn memories_report(&self, limit: usize) -> Result<String> {
        let memories = self.db.search_memories(&[], limit)?;
        if memories.is_empty() {
            return Ok("I don't remember anything about you yet.".to_string());
        }
        let mut lines = vec!["What I remember:".to_string()];
        lines.extend(
            memories
                .iter()
                .map(|m| format!("- {} ({:.0}/10)", prompts::truncate_chars(&m.content, 120), m.importance)),
        );
        Ok(lines.join("\n"))
    }

    // ─── Background loop ───

    pub async fn run_loop(self: Arc<Self>) -> Result<()> {
        tracing::info!("Companion loop starting (tick every {}s)", self.config.tick_secs);
        self.emit(AgentEvent::Observation("Companion waking up...".to_string()))
            .await;

        loop {
            self.tick(Utc::now()).await;
            sleep(Duration::from_secs(self.config.tick_secs.max(1))).await;
        }
    }

    /// One pass over every periodic job. Failures are logged and skipped.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.maybe_reset_daily(now).await;

        if self.is_due(
            VIRTUAL_LIFE_LAST_RUN_STATE_KEY,
            ChronoDuration::minutes(VIRTUAL_LIFE_INTERVAL_MINS),
            now,
        ) {
            if let Err(e) = self.update_virtual_life(now).await {
                self.report_failure("Virtual life update", e).await;
            }
        }

        let consciousness_every = self.config.consciousness_interval_mins.max(1) as i64;
        let previous_cycle = self
            .db
            .get_state_time(CONSCIOUSNESS_LAST_RUN_STATE_KEY)
            .ok()
            .flatten();
        if self.is_due(
            CONSCIOUSNESS_LAST_RUN_STATE_KEY,
            ChronoDuration::minutes(consciousness_every),
            now,
        ) {
            let elapsed = elapsed_minutes(previous_cycle, now, consciousness_every);
            if let Err(e) = self.consciousness_cycle(now, elapsed).await {
                self.report_failure("Consciousness cycle", e).await;
            }
        }

        if self.config.enable_daily_planning {
            self.maybe_plan_day(now).await;
        }
        self.maybe_extend_schedule(now).await;

        if self.config.enable_consolidation {
            self.maybe_consolidate(now).await;
        }
    }

    async fn report_failure(&self, job: &str, error: anyhow::Error) {
        tracing::error!("{} failed: {:#}", job, error);
        self.emit(AgentEvent::Error(format!("{} failed: {}", job, error)))
            .await;
    }

    /// True when `interval` has passed since the stored run time; records `now` if so.
    fn is_due(&self, key: &str, interval: ChronoDuration, now: DateTime<Utc>) -> bool {
        let last_run = match self.db.get_state_time(key) {
            Ok(last_run) => last_run,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", key, e);
                None
            }
        };
        let due = last_run.map(|last| now - last >= interval).unwrap_or(true);
        if due {
            if let Err(e) = self.db.set_state_time(key, now) {
                tracing::warn!("Failed to persist {}: {}", key, e);
            }
        }
        due
    }

    async fn maybe_reset_daily(&self, now: DateTime<Utc>) {
        let today = local_date(now).to_string();
        let stored = match self.db.get_state(COUNTERS_DATE_STATE_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Failed to read the counters date: {}", e);
                return;
            }
        };
        if stored.as_deref() == Some(today.as_str()) {
            return;
        }
        if let Err(e) = self.db.set_state(COUNTERS_DATE_STATE_KEY, &today) {
            tracing::warn!("Failed to persist the counters date: {}", e);
        }

        {
            let mut state = self.state.write().await;
            state.initiatives_today = 0;
            state.short_term.consolidate(now);
        }
        if let Some(pool) = &self.pool {
            pool.reset_daily_stats();
        }
        self.humanizer.clear_cache();
        self.persist_state().await;
        tracing::info!("Daily counters reset for {}", today);
    }

    async fn update_virtual_life(&self, now: DateTime<Utc>) -> Result<()> {
        let changes = self.life.write().await.check_and_update_activities(now)?;
        if changes.cancelled > 0 {
            tracing::info!("{} missed activities cancelled", changes.cancelled);
        }
        if !changes.status_changed() {
            return Ok(());
        }

        if !changes.ended.is_empty() {
            let mut state = self.state.write().await;
            state.activity_just_completed = true;
            for activity in &changes.ended {
                apply_activity_effects(&mut state.character, activity);
            }
        }
        for activity in &changes.ended {
            self.emit(AgentEvent::Outbound {
                kind: OutboundKind::ActivityEnded,
                messages: end_notification(activity),
            })
            .await;
        }

        if let Some(mut activity) = changes.started {
            let mood = self.snapshot(now).await.label;
            let hour = now.with_timezone(&Local).hour();
            activity.description = self
                .humanizer
                .humanize_activity(self.llm.as_ref(), &activity, mood.as_str(), hour)
                .await;
            self.emit(AgentEvent::Outbound {
                kind: OutboundKind::ActivityStarted,
                messages: start_notification(&activity),
            })
            .await;
        }

        self.persist_state().await;
        Ok(())
    }

    // ─── Consciousness ───

    async fn consciousness_cycle(&self, now: DateTime<Utc>, elapsed_mins: f64) -> Result<()> {
        let hour = now.with_timezone(&Local).hour();
        let behavior = &self.config.behavior;
        let limits = GateLimits {
            quiet_start: behavior.quiet_hours_start,
            quiet_end: behavior.quiet_hours_end,
            max_daily: behavior.max_daily_initiatives,
            min_hours_between: behavior.min_hours_between_initiatives,
        };

        let verdict = {
            let mut state = self.state.write().await;
            state.character.update_physical_state(hour);
            state.character.decay_emotions(elapsed_mins);
            state.short_term.consolidate(now);
            let since_initiative = state.last_initiative_at.map(|at| hours_between(at, now));
            check_gate(&limits, hour, state.initiatives_today, since_initiative)
        };

        if verdict == GateVerdict::QuietHours {
            tracing::debug!("Quiet hours, skipping initiative and life events");
            self.persist_state().await;
            return Ok(());
        }

        if verdict == GateVerdict::Open && self.config.enable_initiative {
            let inputs = self.initiative_inputs(now).await?;
            let decision = {
                let mut rng = rand::rng();
                should_send_initiative(&inputs, &mut rng)
            };
            self.state.write().await.activity_just_completed = false;
            if decision.send {
                self.send_initiative(now, &inputs).await?;
            }
        } else {
            tracing::debug!("Initiative gate closed: {:?}", verdict);
        }

        if rand::random::<f64>() < behavior.life_event_chance {
            self.life_event(now).await;
        }

        self.persist_state().await;
        Ok(())
    }

    async fn initiative_inputs(&self, now: DateTime<Utc>) -> Result<InitiativeInputs> {
        let local = now.with_timezone(&Local);
        let snapshot = self.snapshot(now).await;
        let (current_activity, next_activity) = {
            let life = self.life.read().await;
            let current = life.current_activity().map(activity_view);
            let next = life
                .next_activity(now)?
                .map(|a| ((a.start_time - now).num_minutes(), a.importance));
            (current, next)
        };
        let intimacy = self.characters.read().await.intimacy();
        let state = self.state.read().await;

        Ok(InitiativeInputs {
            mood: snapshot.label,
            energy: snapshot.energy_level,
            current_activity,
            activity_just_completed: state.activity_just_completed,
            next_activity,
            intimacy,
            hours_since_last_message: state.last_message_at.map(|at| hours_between(at, now)),
            hour: local.hour(),
            weekday: local.weekday(),
        })
    }

    async fn send_initiative(&self, now: DateTime<Utc>, inputs: &InitiativeInputs) -> Result<()> {
        let topic = {
            let recent = self.state.read().await.recent_topics.clone();
            let characters = self.characters.read().await;
            let mut rng = rand::rng();
            let persona_topic = if rng.random_bool(PERSONA_TOPIC_CHANCE) {
                characters.initiative_topic(&mut rng)
            } else {
                None
            };
            persona_topic.unwrap_or_else(|| {
                initiative_topic(inputs.current_activity.as_ref(), inputs.mood, &recent, &mut rng)
            })
        };
        tracing::info!("Starting a conversation: {}", topic);

        let snapshot = self.snapshot(now).await;
        let prompt = format!("Write to the user first. You want to {}.", topic);
        let messages = self
            .generate_reply(&prompt, INITIATIVE_MEMORY_QUERY, &snapshot, now)
            .await?;

        self.emit(AgentEvent::Outbound {
            kind: OutboundKind::Initiative,
            messages: messages.clone(),
        })
        .await;
        self.memory.save_conversation(
            INITIATIVE_MARKER,
            &messages,
            &snapshot.dominant_emotion,
            &snapshot.dominant_emotion,
            true,
        )?;

        let mut state = self.state.write().await;
        state
            .character
            .update_emotional_state(EmotionTrigger::PositiveInteraction, 0.5);
        state.last_message_at = Some(now);
        state.last_initiative_at = Some(now);
        state.initiatives_today += 1;
        state.recent_topics.push(topic);
        let overflow = state.recent_topics.len().saturating_sub(RECENT_TOPICS_KEPT);
        state.recent_topics.drain(..overflow);
        Ok(())
    }

    async fn life_event(&self, now: DateTime<Utc>) {
        let hour = now.with_timezone(&Local).hour();
        let event = {
            let mut rng = rand::rng();
            pick_life_event(hour, &mut rng)
        };
        let mut state = self.state.write().await;
        state
            .character
            .update_emotional_state(event.trigger(), event.intensity.abs());
        state.short_term.add(
            &format!("Event: {}", event.description),
            MemoryType::LifeEvent,
            event.memory_importance(),
            event.intensity,
            now,
        );
        tracing::info!("Life event: {} ({:+.1})", event.description, event.intensity);
    }

    // ─── Schedule ───

    async fn maybe_plan_day(&self, now: DateTime<Utc>) {
        let local = now.with_timezone(&Local);
        if local.hour() < PLANNING_EARLIEST_HOUR {
            return;
        }
        let today = local.date_naive();
        match DailyPlanner::should_plan_today(&self.db, today) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!("Failed to check today's plan: {}", e);
                return;
            }
        }
        if !self.is_due(
            PLANNING_ATTEMPT_STATE_KEY,
            ChronoDuration::hours(PLANNING_RETRY_HOURS),
            now,
        ) {
            return;
        }

        match self.plan_day(today, now).await {
            Ok(report) => {
                self.emit(AgentEvent::Observation(format!(
                    "Planned {} activities for {} ({})",
                    report.activities_saved, today, report.day_mood
                )))
                .await;
            }
            Err(e) => self.report_failure("Daily planning", e).await,
        }
    }

    async fn plan_day(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<PlanningReport> {
        let snapshot = self.snapshot(now).await;
        let (name, character_context, activity_types) = {
            let characters = self.characters.read().await;
            let persona = characters.current();
            let name = persona
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "Companion".to_string());
            let activity_types = persona
                .map(|p| {
                    p.planning_activity_types
                        .iter()
                        .map(|entry| (entry.kind.clone(), entry.label.clone()))
                        .collect()
                })
                .unwrap_or_default();
            (name, characters.context_for_ai(), activity_types)
        };

        let context = DailyPlanner::build_context(
            &self.db,
            today,
            &name,
            &character_context,
            snapshot.label.as_str(),
            activity_types,
        )?;
        DailyPlanner::generate_daily_plan(&self.db, self.llm.as_ref(), &context).await
    }

    /// Fill the next days from templates when nothing is planned ahead.
    async fn maybe_extend_schedule(&self, now: DateTime<Utc>) {
        let today = local_date(now);
        let marker = today.to_string();
        match self.db.get_state(AUTO_SCHEDULE_DATE_STATE_KEY) {
            Ok(Some(stored)) if stored == marker => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Failed to read the schedule date: {}", e);
                return;
            }
        }
        if let Err(e) = self.db.set_state(AUTO_SCHEDULE_DATE_STATE_KEY, &marker) {
            tracing::warn!("Failed to persist the schedule date: {}", e);
        }

        let extras = self
            .characters
            .read()
            .await
            .current()
            .map(|p| p.schedule_extras.clone())
            .unwrap_or_default();

        let life = self.life.read().await;
        match life.upcoming_activities(now, SCHEDULE_LOOKAHEAD_HOURS) {
            Ok(upcoming) if !upcoming.is_empty() => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Failed to read upcoming activities: {}", e);
                return;
            }
        }
        let created = {
            let mut rng = rand::rng();
            life.create_automatic_schedule(today, &extras, &mut rng)
        };
        match created {
            Ok(n) => tracing::info!("Automatic schedule: {} activities added", n),
            Err(e) => tracing::warn!("Automatic schedule failed: {}", e),
        }
    }

    // ─── Memory maintenance ───

    async fn maybe_consolidate(&self, now: DateTime<Utc>) {
        let intimacy = self.characters.read().await.intimacy();
        let model = self.llm.as_ref();

        if self.is_due(
            CONSOLIDATION_LAST_RUN_STATE_KEY,
            ChronoDuration::hours(self.config.consolidation_interval_hours.max(1) as i64),
            now,
        ) {
            match MemoryConsolidator::run_cycle(&self.db, model, intimacy, now).await {
                Ok(report) if report.total_changes() > 0 => {
                    self.emit(AgentEvent::Observation(format!(
                        "Memory consolidation: {} groups, {} relevelled, {} archived",
                        report.groups_consolidated, report.records_relevelled, report.deep_archived
                    )))
                    .await;
                }
                Ok(_) => tracing::debug!("Memory consolidation found nothing to do"),
                Err(e) => self.report_failure("Memory consolidation", e).await,
            }
        }

        if self.is_due(
            DEEP_CONSOLIDATION_LAST_RUN_STATE_KEY,
            ChronoDuration::hours(self.config.deep_consolidation_interval_hours.max(1) as i64),
            now,
        ) {
            if let Err(e) = MemoryConsolidator::analyze_emotional_patterns(&self.db, model, now).await {
                self.report_failure("Emotional pattern analysis", e).await;
            }
            if let Err(e) = MemoryConsolidator::analyze_memory_patterns(&self.db, model).await {
                self.report_failure("Memory pattern analysis", e).await;
            }
        }

        if self.is_due(
            ENRICHMENT_LAST_RUN_STATE_KEY,
            ChronoDuration::hours(self.config.emotion_analysis_interval_hours.max(1) as i64),
            now,
        ) {
            match MemoryConsolidator::enrich_emotions(&self.db, model, ENRICHMENT_BATCH).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Emotion enrichment tagged {} memories", n),
                Err(e) => self.report_failure("Emotion enrichment", e).await,
            }
        }
    }
}

// ─── Helpers ───

fn humanizer_persona(persona: &Persona) -> String {
    let mut text = format!("You are {}", persona.name);
    if let Some(age) = persona.age {
        text.push_str(&format!(", {} years old", age));
    }
    if !persona.short_description.is_empty() {
        text.push_str(&format!(", {}", persona.short_description));
    }
    text.push('.');
    if !persona.interests.is_empty() {
        text.push_str(&format!(" Interests: {}.", persona.interests.join(", ")));
    }
    text
}

fn activity_view(activity: &PlannedActivity) -> ActivityView {
    ActivityView {
        description: activity.description.clone(),
        activity_type: activity.activity_type.clone(),
        importance: activity.importance,
        flexibility: activity.flexibility,
    }
}

fn apply_activity_effects(character: &mut CharacterState, activity: &PlannedActivity) {
    character.physical.energy =
        (character.physical.energy - activity.energy_cost as f64).clamp(0.0, 100.0);
    if activity.mood_effect > 0.0 {
        character.update_emotional_state(EmotionTrigger::Accomplishment, activity.mood_effect);
    } else if activity.mood_effect < 0.0 {
        character.update_emotional_state(EmotionTrigger::Stress, activity.mood_effect.abs());
    }
}

/// Minutes since the previous run, never less than the configured interval.
fn elapsed_minutes(previous: Option<DateTime<Utc>>, now: DateTime<Utc>, interval_mins: i64) -> f64 {
    previous
        .map(|at| (now - at).num_minutes())
        .unwrap_or(interval_mins)
        .max(interval_mins) as f64
}

fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_seconds().max(0) as f64 / 3600.0
}

fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

fn join_nonempty(parts: &[String]) -> String {
    parts
        .iter()
        .filter(|part| !part.trim().is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::testing::ScriptedModel;
    use std::fs;
    use tempfile::TempDir;

    const PERSONA: &str = r#"{
        "name": "Marin",
        "age": 22,
        "short_description": "cosplayer",
        "interests": ["cosplay", "anime", "sewing"],
        "speech": {"style": "casual", "catchphrases": ["So cool!"]},
        "behavior": {"initiative_topics": ["share a costume idea"]}
    }"#;

    fn companion_with(
        model: ScriptedModel,
    ) -> (TempDir, Arc<ScriptedModel>, Companion, flume::Receiver<AgentEvent>) {
        companion_configured(model, |_| {})
    }

    fn companion_configured(
        model: ScriptedModel,
        tweak: impl FnOnce(&mut AgentConfig),
    ) -> (TempDir, Arc<ScriptedModel>, Companion, flume::Receiver<AgentEvent>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let characters = dir.path().join("characters");
        fs::create_dir_all(&characters).expect("characters dir");
        fs::write(characters.join("marin.json"), PERSONA).expect("persona file");

        let mut config = AgentConfig::default();
        config.characters_dir = characters.to_string_lossy().to_string();
        config.database_path = dir.path().join("agent.db").to_string_lossy().to_string();
        tweak(&mut config);

        let db = Arc::new(AgentDatabase::new(&config.database_path).expect("db init"));
        let model = Arc::new(model);
        let (tx, rx) = flume::unbounded();
        let companion =
            Companion::with_model(config, db, model.clone(), tx).expect("companion init");
        (dir, model, companion, rx)
    }

    #[tokio::test]
    async fn replies_are_split_and_saved() {
        let (_dir, model, companion, _rx) = companion_with(ScriptedModel::new([
            "Hey, I just got back from a cosplay shoot! || The photos came out amazing, honestly. || How was your day, tell me everything?",
        ]));

        let replies = companion.process_user_message("I love sewing at work").await;
        assert_eq!(replies.len(), 3);
        assert!(replies[0].contains("cosplay"));

        let requests = model.requests.lock().expect("requests");
        assert_eq!(requests[0].0, LlmPurpose::Dialogue);
        assert_eq!(requests[0].2.top_p, Some(DIALOGUE_TOP_P));
        assert!(requests[0].1[0].content.contains("Marin"));
        drop(requests);

        let conversations = companion.memory.recent_conversations(5).expect("conversations");
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].ai_responses, replies);
        assert!(!conversations[0].is_initiative);

        let state = companion.state.read().await;
        assert!(state.last_message_at.is_some());
        assert_eq!(state.short_term.conversation_count(), 1);
        assert_eq!(state.character.momentum.emotion, "happy");
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_canned_replies() {
        let (_dir, _model, companion, _rx) = companion_with(ScriptedModel::failing());
        let replies = companion.process_user_message("what do you think?").await;
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().any(|r| r.contains("Marin")));
        assert_eq!(companion.memory.recent_conversations(5).expect("conversations").len(), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let (dir, _model, companion, _rx) =
            companion_with(ScriptedModel::new(["short answer about cosplay plans for today"]));
        companion.process_user_message("hi").await;
        let config = companion.config().clone();
        let db = companion.database().clone();
        drop(companion);

        let (tx, _rx) = flume::unbounded();
        let restored = Companion::with_model(config, db, Arc::new(ScriptedModel::default()), tx)
            .expect("companion init");
        let state = restored.state.read().await;
        assert!(state.last_message_at.is_some());
        assert_eq!(state.short_term.conversation_count(), 1);
        drop(dir);
    }

    #[tokio::test]
    async fn started_activity_is_humanized_and_announced() {
        let (_dir, _model, companion, rx) =
            companion_with(ScriptedModel::new(["sewing a tiny cape"]));
        let now = Utc::now();
        let activity = PlannedActivity::new(
            "hobby",
            "hobby block",
            now - ChronoDuration::minutes(5),
            2.0,
        );
        companion.db.insert_activity(&activity).expect("insert activity");

        companion.update_virtual_life(now).await.expect("virtual life");

        match rx.try_recv().expect("event") {
            AgentEvent::Outbound { kind, messages } => {
                assert_eq!(kind, OutboundKind::ActivityStarted);
                assert!(messages[0].contains("sewing a tiny cape"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(companion.life.read().await.current_activity().is_some());
    }

    #[tokio::test]
    async fn finished_activity_marks_completion() {
        let (_dir, _model, companion, rx) = companion_with(ScriptedModel::new(["drawing"]));
        let now = Utc::now();
        let activity = PlannedActivity::new("hobby", "drawing", now - ChronoDuration::minutes(30), 0.25)
            .with_effects(1.0, 10);
        companion.db.insert_activity(&activity).expect("insert activity");

        companion.update_virtual_life(now - ChronoDuration::minutes(20)).await.expect("start");
        let energy_before = companion.state.read().await.character.physical.energy;
        companion.update_virtual_life(now).await.expect("finish");

        let kinds: Vec<OutboundKind> = rx
            .drain()
            .filter_map(|event| match event {
                AgentEvent::Outbound { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![OutboundKind::ActivityStarted, OutboundKind::ActivityEnded]);

        let state = companion.state.read().await;
        assert!(state.activity_just_completed);
        assert!(state.character.physical.energy < energy_before);
    }

    #[tokio::test]
    async fn reply_survives_a_failed_save() {
        let (_dir, _model, companion, _rx) = companion_with(ScriptedModel::new([
            "Hey, I just got back from a cosplay shoot! || The photos came out amazing, honestly. || How was your day, tell me everything?",
        ]));
        let other = rusqlite::Connection::open(&companion.config().database_path).expect("open db");
        other
            .execute_batch(
                "CREATE TRIGGER reject_conversations BEFORE INSERT ON conversations
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .expect("trigger");

        let replies = companion.process_user_message("I love sewing at work").await;
        assert_eq!(replies.len(), 3);
        assert!(replies[0].contains("cosplay"));
        assert!(companion.memory.recent_conversations(5).expect("conversations").is_empty());
        assert!(companion.state.read().await.last_message_at.is_some());
    }

    #[test]
    fn decay_covers_the_time_actually_elapsed() {
        let now = Utc::now();
        assert_eq!(elapsed_minutes(None, now, 5), 5.0);
        assert_eq!(elapsed_minutes(Some(now - ChronoDuration::minutes(2)), now, 5), 5.0);
        assert_eq!(elapsed_minutes(Some(now - ChronoDuration::minutes(95)), now, 5), 95.0);
    }

    #[tokio::test]
    async fn late_cycle_decays_by_the_whole_gap() {
        let (_dir, _model, companion, _rx) = companion_configured(ScriptedModel::default(), |config| {
            config.enable_initiative = false;
            config.enable_daily_planning = false;
            config.enable_consolidation = false;
            config.behavior.life_event_chance = 0.0;
        });
        let now = Utc::now();
        companion
            .db
            .set_state_time(CONSCIOUSNESS_LAST_RUN_STATE_KEY, now - ChronoDuration::hours(3))
            .expect("last run");
        let intensity_before = {
            let mut state = companion.state.write().await;
            state.character.momentum.emotion = "excited".to_string();
            state.character.momentum.intensity = 8.0;
            state.character.momentum.decay_rate = 0.01;
            state.character.momentum.intensity
        };

        companion.tick(now).await;

        let state = companion.state.read().await;
        let expected = intensity_before * (-0.01f64 * 180.0).exp();
        assert!((state.character.momentum.intensity - expected).abs() < 1e-6);
    }

    #[test]
    fn due_jobs_record_their_run_time() {
        let (_dir, _model, companion, _rx) = companion_with(ScriptedModel::default());
        let now = Utc::now();
        let hour = ChronoDuration::hours(1);
        assert!(companion.is_due("test_job", hour, now));
        assert!(!companion.is_due("test_job", hour, now + ChronoDuration::minutes(30)));
        assert!(companion.is_due("test_job", hour, now + ChronoDuration::minutes(61)));
    }

    #[test]
    fn desires_are_stored() {
        let (_dir, _model, companion, _rx) = companion_with(ScriptedModel::default());
        let desire = companion
            .add_future_desire("visit a big convention", 12, "social")
            .expect("desire");
        assert_eq!(desire.priority, 10);
        let pending = companion.db.get_pending_desires(10).expect("pending");
        assert!(pending.iter().any(|d| d.desire_text == "visit a big convention"));
    }

    #[test]
    fn memories_report_lists_top_memories() {
        let (_dir, _model, companion, _rx) = companion_with(ScriptedModel::default());
        assert!(companion.memories_report(5).expect("report").contains("don't remember"));
        companion
            .memory
            .add_memory("User loves green tea", MemoryType::Preference, 7.0, None)
            .expect("memory");
        assert!(companion.memories_report(5).expect("report").contains("green tea"));
    }
}
