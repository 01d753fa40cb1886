//! Assistant reasoning over the call transcript
//!
//! `RemoteReasoner` sends the full ordered transcript plus the newest
//! utterance to an OpenAI-compatible `/chat/completions` endpoint, so the
//! assistant answers with the whole call as context rather than utterance
//! by utterance.

use crate::config::env_string;
use crate::error::{CallError, CallResult};
use crate::session::{Role, Turn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_REASONING_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_REASONING_MODEL: &str = "gpt-4-turbo";
const DEFAULT_TEMPERATURE: f32 = 0.5;

const SYSTEM_PROMPT: &str = "You are Careline, a calm voice assistant on a \
simulated emergency medical call. Speak in short, plain sentences meant to \
be heard, not read. Give one or two concrete steps at a time, keep the \
caller talking, and remind them to contact their real local emergency \
number for anything life-threatening. Never diagnose; guide and reassure.";

// OpenAI-compatible request/response wire types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

/// Produces the assistant's next reply
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// `history` is the transcript so far, in sequence order; `utterance` is
    /// the newest caller text, not yet part of `history`.
    async fn reply(&self, history: &[Turn], utterance: &str) -> CallResult<String>;
}

fn build_messages(history: &[Turn], utterance: &str, system: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: "system".to_string(),
        content: system.to_string(),
    });
    for turn in history {
        messages.push(ChatMessage {
            role: match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            }
            .to_string(),
            content: turn.text.clone(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: utterance.to_string(),
    });
    messages
}

/// OpenAI-compatible chat reasoning over HTTP
pub struct RemoteReasoner {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl RemoteReasoner {
    /// Configure from `REASONING_API_URL`, `REASONING_API_KEY`, and
    /// `REASONING_MODEL`. The key is required.
    pub fn from_env() -> CallResult<Self> {
        let api_key = std::env::var("REASONING_API_KEY")
            .map_err(|_| CallError::Config("REASONING_API_KEY is not set".into()))?;
        Ok(Self::new(
            env_string("REASONING_API_URL", DEFAULT_REASONING_API_BASE),
            api_key,
            env_string("REASONING_MODEL", DEFAULT_REASONING_MODEL),
        ))
    }

    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            api_key: api_key.trim().to_string(),
            model,
            temperature: DEFAULT_TEMPERATURE,
            client,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl ReasoningClient for RemoteReasoner {
    async fn reply(&self, history: &[Turn], utterance: &str) -> CallResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: self.model.clone(),
            messages: build_messages(history, utterance, SYSTEM_PROMPT),
            temperature: Some(self.temperature),
            max_tokens: Some(512),
        };
        debug!(model = %self.model, turns = history.len(), "requesting reply");

        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::ReasoningFailed(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::ReasoningFailed(format!(
                "API error {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| CallError::ReasoningFailed(e.to_string()))?;
        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(CallError::ReasoningFailed("service returned no reply".into()));
        }

        info!(chars = text.len(), "reply received");
        Ok(text)
    }
}

/// Placeholder reasoning: echoes the utterance back with a canned frame.
/// Use for driving the call loop without a reasoning service.
#[derive(Debug, Default)]
pub struct PlaceholderReasoner {
    /// If set, return this instead of the echo.
    pub response: Option<String>,
}

impl PlaceholderReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
        }
    }
}

#[async_trait]
impl ReasoningClient for PlaceholderReasoner {
    async fn reply(&self, _history: &[Turn], utterance: &str) -> CallResult<String> {
        Ok(self.response.clone().unwrap_or_else(|| {
            format!(
                "I heard you say: {}. I'm here with you. Connect a reasoning service for real guidance.",
                utterance
            )
        }))
    }
}
