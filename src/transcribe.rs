//! Speech-to-text for captured utterances
//!
//! `RemoteTranscriber` posts the WAV artifact to an OpenAI-compatible
//! `/audio/transcriptions` endpoint. `PlaceholderTranscriber` stands in when
//! no service is configured, so the call loop can run end to end offline.

use crate::capture::AudioArtifact;
use crate::config::env_string;
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_STT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_STT_MODEL: &str = "whisper-1";

/// Converts a recorded utterance into text
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    async fn transcribe(&self, audio: &AudioArtifact) -> CallResult<String>;
}

/// OpenAI-compatible transcription over HTTP
pub struct RemoteTranscriber {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl RemoteTranscriber {
    /// Configure from `STT_API_URL`, `STT_API_KEY`, and `STT_MODEL`.
    /// The key is required; URL and model fall back to OpenAI defaults.
    pub fn from_env() -> CallResult<Self> {
        let api_key = std::env::var("STT_API_KEY")
            .map_err(|_| CallError::Config("STT_API_KEY is not set".into()))?;
        Ok(Self::new(
            env_string("STT_API_URL", DEFAULT_STT_API_BASE),
            api_key,
            env_string("STT_MODEL", DEFAULT_STT_MODEL),
        ))
    }

    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            api_key: api_key.trim().to_string(),
            model,
            client,
        }
    }
}

#[async_trait]
impl TranscriptionClient for RemoteTranscriber {
    async fn transcribe(&self, audio: &AudioArtifact) -> CallResult<String> {
        let url = format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        );
        debug!(bytes = audio.wav.len(), model = %self.model, "uploading recording");

        let part = reqwest::multipart::Part::bytes(audio.wav.clone())
            .file_name("recording.wav")
            .mime_str("audio/wav")
            .map_err(|e| CallError::TranscriptionFailed(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| CallError::TranscriptionFailed(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::TranscriptionFailed(format!(
                "API error {}: {}",
                status, body
            )));
        }

        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| CallError::TranscriptionFailed(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        if text.is_empty() {
            return Err(CallError::TranscriptionFailed(
                "service returned no text".into(),
            ));
        }

        info!(chars = text.len(), "transcription received");
        Ok(text)
    }
}

/// Placeholder transcription: returns a fixed string. Use for driving the
/// call loop without an STT service.
#[derive(Debug, Default)]
pub struct PlaceholderTranscriber {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
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
impl TranscriptionClient for PlaceholderTranscriber {
    async fn transcribe(&self, audio: &AudioArtifact) -> CallResult<String> {
        Ok(self.response.clone().unwrap_or_else(|| {
            format!(
                "[transcription placeholder: {} bytes, {:.1}s of audio. Connect an STT service.]",
                audio.wav.len(),
                audio.duration.as_secs_f32()
            )
        }))
    }
}
