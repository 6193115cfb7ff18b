//! LLM client abstraction.
//!
//! Plan generation talks to an LLM through [`LlmClient`]. The HTTP client
//! speaks both Ollama and OpenAI-compatible chat APIs; the fake client
//! replays canned responses for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// LLM configuration (`[llm]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    "https://api.groq.com/openai".to_string()
}

fn default_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmConfig {
    /// API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn is_ollama_endpoint(&self) -> bool {
        self.endpoint.contains("11434") || self.endpoint.contains("ollama")
    }
}

/// LLM errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("LLM is disabled or not configured")]
    Disabled,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Invalid JSON response: {0}")]
    InvalidJson(String),

    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    #[error("LLM returned empty response")]
    EmptyResponse,
}

impl LlmError {
    /// Errors a retry could plausibly fix
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HttpError(_) | Self::Timeout(_) | Self::EmptyResponse)
    }
}

/// Prompt in, JSON value out
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// False when calls would fail with [`LlmError::Disabled`]
    fn is_available(&self) -> bool;

    async fn call_json(&self, system_prompt: &str, user_prompt: &str)
        -> Result<serde_json::Value, LlmError>;
}

/// HTTP client for Ollama or OpenAI-compatible endpoints
pub struct HttpLlmClient {
    config: LlmConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        let api_key = config.api_key();
        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.config.timeout_secs)
        } else {
            LlmError::HttpError(format!("Request failed: {}", e))
        }
    }

    async fn call_ollama(&self, prompt: &str) -> Result<serde_json::Value, LlmError> {
        let url = format!("{}/api/generate", self.config.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
            "options": { "temperature": self.config.temperature },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(LlmError::HttpError(format!("HTTP {} from Ollama", response.status())));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidJson(format!("Failed to parse response: {}", e)))?;

        let text = json
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or(LlmError::EmptyResponse)?;

        parse_model_output(text)
    }

    async fn call_openai_compatible(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<serde_json::Value, LlmError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "response_format": {"type": "json_object"},
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        if !response.status().is_success() {
            return Err(LlmError::HttpError(format!(
                "HTTP {} from OpenAI-compatible API",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidJson(format!("Failed to parse response: {}", e)))?;

        let text = json
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .ok_or(LlmError::EmptyResponse)?;

        parse_model_output(text)
    }
}

/// Model text to JSON, tolerating code fences and surrounding prose
fn parse_model_output(text: &str) -> Result<serde_json::Value, LlmError> {
    if text.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    serde_json::from_str(text.trim())
        .ok()
        .or_else(|| crate::plan::extract_json_object(text))
        .ok_or_else(|| {
            let preview: String = text.chars().take(200).collect();
            LlmError::InvalidJson(format!("LLM output is not valid JSON: {}", preview))
        })
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    fn is_available(&self) -> bool {
        self.config.enabled && (self.api_key.is_some() || self.config.is_ollama_endpoint())
    }

    async fn call_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<serde_json::Value, LlmError> {
        if !self.is_available() {
            return Err(LlmError::Disabled);
        }

        if self.config.is_ollama_endpoint() {
            let prompt = format!("{}\n\n{}", system_prompt, user_prompt);
            match self.call_ollama(&prompt).await {
                Ok(json) => return Ok(json),
                Err(e) => {
                    tracing::debug!("[LLM] Ollama API failed, trying OpenAI-compatible: {}", e);
                }
            }
        }

        self.call_openai_compatible(system_prompt, user_prompt).await
    }
}

/// Fake LLM client for testing
pub struct FakeLlmClient {
    available: bool,
    responses: Mutex<Vec<Result<serde_json::Value, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeLlmClient {
    /// Replays `responses` in order; the last one repeats
    pub fn new(responses: Vec<Result<serde_json::Value, LlmError>>) -> Self {
        Self {
            available: true,
            responses: Mutex::new(responses),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn always_valid(json: serde_json::Value) -> Self {
        Self::new(vec![Ok(json)])
    }

    pub fn always_error(error: LlmError) -> Self {
        Self::new(vec![Err(error)])
    }

    /// Client that reports itself as not configured
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// User prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn call_json(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> Result<serde_json::Value, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(user_prompt.to_string());
        }
        if !self.available {
            return Err(LlmError::Disabled);
        }

        let mut responses = self
            .responses
            .lock()
            .map_err(|_| LlmError::HttpError("fake client poisoned".to_string()))?;
        match responses.len() {
            0 => Err(LlmError::EmptyResponse),
            1 => responses[0].clone(),
            _ => responses.remove(0),
        }
    }
}
