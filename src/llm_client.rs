use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::AgentConfig;

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

/// Sampling options for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl ChatOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
            top_p: None,
        }
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self::new(0.7, 2000)
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub total_tokens: Option<u64>,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a completion with a specific model and sampling options
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        model: &str,
        options: ChatOptions,
    ) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.api_url.trim_end_matches('/'));

        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        // Check for HTTP errors and include response body for debugging
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(Completion {
            content,
            total_tokens: completion.usage.and_then(|u| u.total_tokens),
        })
    }
}

/// Parse a JSON payload out of a model response, tolerating `</think>` preambles,
/// fenced code blocks and surrounding prose.
pub fn parse_json_response<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = if let Some(think_end) = response.rfind("</think>") {
        &response[think_end + 8..]
    } else {
        response
    };

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        if let Some(end) = after_start.find("```") {
            after_start[..end].trim()
        } else {
            cleaned
        }
    } else if let Some(start) = cleaned.find('{') {
        match cleaned.rfind('}') {
            Some(end) if end > start => &cleaned[start..=end],
            _ => cleaned,
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim()).context(format!(
        "Failed to parse JSON. Extracted: {} | Original: {}",
        json_content,
        response.chars().take(500).collect::<String>()
    ))
}

/// What a request is for. Each purpose draws from its own key pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmPurpose {
    Dialogue,
    Planning,
    Analytics,
}

impl LlmPurpose {
    pub const ALL: [LlmPurpose; 3] = [
        LlmPurpose::Dialogue,
        LlmPurpose::Planning,
        LlmPurpose::Analytics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LlmPurpose::Dialogue => "dialogue",
            LlmPurpose::Planning => "planning",
            LlmPurpose::Analytics => "analytics",
        }
    }
}

/// The seam every LLM-driven engine talks to.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(
        &self,
        purpose: LlmPurpose,
        messages: Vec<Message>,
        options: ChatOptions,
    ) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub requests: u64,
    pub tokens: u64,
    pub errors: u64,
}

/// Per-purpose client pools with random key selection and usage accounting.
pub struct LlmPool {
    pools: HashMap<LlmPurpose, Vec<LlmClient>>,
    models: HashMap<LlmPurpose, String>,
    stats: Mutex<HashMap<LlmPurpose, UsageStats>>,
}

impl LlmPool {
    pub fn from_config(config: &AgentConfig) -> Self {
        let key_pools = resolve_key_pools(config);
        let mut pools = HashMap::new();
        for (purpose, keys) in key_pools {
            tracing::info!("LLM pool {}: {} key(s)", purpose.as_str(), keys.len());
            let clients = keys
                .into_iter()
                .map(|key| {
                    LlmClient::new(config.llm_api_url.clone(), key, config.llm_model.clone())
                })
                .collect::<Vec<_>>();
            pools.insert(purpose, clients);
        }

        let mut models = HashMap::new();
        models.insert(LlmPurpose::Dialogue, config.llm_model.clone());
        models.insert(LlmPurpose::Planning, config.planning_model().to_string());
        models.insert(LlmPurpose::Analytics, config.analytics_model().to_string());

        Self {
            pools,
            models,
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn select(&self, purpose: LlmPurpose) -> Option<LlmClient> {
        let clients = self.pools.get(&purpose)?;
        if clients.len() == 1 {
            return clients.first().cloned();
        }
        clients.choose(&mut rand::rng()).cloned()
    }

    fn record(&self, purpose: LlmPurpose, tokens: Option<u64>, failed: bool) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        let entry = stats.entry(purpose).or_default();
        entry.requests += 1;
        entry.tokens += tokens.unwrap_or(0);
        if failed {
            entry.errors += 1;
        }
    }

    pub fn usage_stats(&self) -> HashMap<LlmPurpose, UsageStats> {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Clear counters; called when the day rolls over.
    pub fn reset_daily_stats(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.clear();
        }
        tracing::info!("LLM usage statistics reset");
    }
}

#[async_trait]
impl ChatModel for LlmPool {
    async fn chat(
        &self,
        purpose: LlmPurpose,
        messages: Vec<Message>,
        options: ChatOptions,
    ) -> Result<String> {
        let client = self
            .select(purpose)
            .ok_or_else(|| anyhow::anyhow!("No LLM client configured for {}", purpose.as_str()))?;
        let model = self
            .models
            .get(&purpose)
            .cloned()
            .unwrap_or_else(|| client.model().to_string());

        match client.complete(messages, &model, options).await {
            Ok(completion) => {
                self.record(purpose, completion.total_tokens, false);
                tracing::debug!("LLM {} request ok ({})", purpose.as_str(), model);
                Ok(completion.content)
            }
            Err(e) => {
                self.record(purpose, None, true);
                tracing::error!("LLM {} request failed: {}", purpose.as_str(), e);
                Err(e)
            }
        }
    }
}

/// Key pools fall back analytics -> planning -> dialogue -> primary key.
/// An empty key is kept so local endpoints without auth still work.
pub fn resolve_key_pools(config: &AgentConfig) -> HashMap<LlmPurpose, Vec<String>> {
    let dialogue = if config.dialogue_api_keys.is_empty() {
        vec![config.llm_api_key.clone().unwrap_or_default()]
    } else {
        config.dialogue_api_keys.clone()
    };
    let planning = if config.planning_api_keys.is_empty() {
        dialogue.clone()
    } else {
        config.planning_api_keys.clone()
    };
    let analytics = if config.analytics_api_keys.is_empty() {
        planning.clone()
    } else {
        config.analytics_api_keys.clone()
    };

    let mut pools = HashMap::new();
    pools.insert(LlmPurpose::Dialogue, dialogue);
    pools.insert(LlmPurpose::Planning, planning);
    pools.insert(LlmPurpose::Analytics, analytics);
    pools
}
