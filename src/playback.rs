//! Speech playback for assistant replies
//!
//! `VoicePlayback` synthesizes text through a remote voice service and plays
//! it on a `rodio::Sink`. When synthesis or decoding fails it falls back to
//! an on-device synthesizer so the caller still hears the reply. Every
//! `speak` yields an event stream that reports `Started` once the audio is
//! audible and then exactly one terminal event, `Completed` or `Failed`.
//!
//! The rodio `OutputStream` is `!Send`, so a worker thread owns it for the
//! lifetime of the playback object; the `Sink` itself is shared across
//! threads, which is what makes `cancel` an instant kill-switch.

use crate::config::env_string;
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const DEFAULT_TTS_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_TTS_MODEL: &str = "tts-1";
const DEFAULT_TTS_VOICE: &str = "onyx";

/// Progress of one utterance through the speakers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Audio became audible
    Started,
    /// The utterance finished playing
    Completed,
    /// Both the remote synth and the local fallback failed
    Failed(String),
}

/// Plays assistant replies aloud
#[async_trait]
pub trait SpeechPlayback: Send + Sync {
    /// Begin speaking `text`. The returned stream reports `Started` and then
    /// exactly one terminal event.
    async fn speak(&self, text: &str) -> CallResult<mpsc::Receiver<PlaybackEvent>>;

    /// Stop any current playback immediately
    fn cancel(&self);
}

/// Backend that turns text into audio bytes (WAV/MP3). Return an empty vec
/// to skip playback while keeping the event flow intact.
#[async_trait]
pub trait SynthBackend: Send + Sync {
    async fn synthesize(&self, text: &str) -> CallResult<Vec<u8>>;
}

/// OpenAI-compatible speech synthesis over HTTP
#[derive(Debug, Clone)]
pub struct RemoteSynth {
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl RemoteSynth {
    /// Configure from `TTS_API_URL`, `TTS_API_KEY`, `TTS_MODEL`, and
    /// `TTS_VOICE`. The key is required.
    pub fn from_env() -> CallResult<Self> {
        let api_key = std::env::var("TTS_API_KEY")
            .map_err(|_| CallError::Config("TTS_API_KEY is not set".into()))?;
        Ok(Self::new(
            env_string("TTS_API_URL", DEFAULT_TTS_API_BASE),
            api_key,
            env_string("TTS_MODEL", DEFAULT_TTS_MODEL),
            env_string("TTS_VOICE", DEFAULT_TTS_VOICE),
        ))
    }

    pub fn new(base_url: String, api_key: String, model: String, voice: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            api_key: api_key.trim().to_string(),
            model,
            voice,
            client,
        }
    }
}

#[async_trait]
impl SynthBackend for RemoteSynth {
    async fn synthesize(&self, text: &str) -> CallResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::PlaybackFailed(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::PlaybackFailed(format!(
                "synthesis API error {}: {}",
                status, body
            )));
        }

        let bytes = res
            .bytes()
            .await
            .map_err(|e| CallError::PlaybackFailed(e.to_string()))?;
        debug!(bytes = bytes.len(), "speech synthesized");
        Ok(bytes.to_vec())
    }
}

/// Placeholder synthesis: returns empty audio so nothing plays
#[derive(Debug, Default)]
pub struct PlaceholderSynth;

#[async_trait]
impl SynthBackend for PlaceholderSynth {
    async fn synthesize(&self, _text: &str) -> CallResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Voice parameters for the on-device fallback synthesizer
#[derive(Debug, Clone)]
pub struct FallbackVoice {
    pub language: String,
    pub pitch: f32,
    pub rate: f32,
}

impl Default for FallbackVoice {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            pitch: 0.9,
            rate: 0.95,
        }
    }
}

/// On-device synthesizer used when remote synthesis fails. `speak` returns
/// once the utterance has finished.
#[async_trait]
pub trait LocalSynthesizer: Send + Sync {
    async fn speak(&self, text: &str, voice: &FallbackVoice) -> CallResult<()>;
}

/// Placeholder local synthesizer: logs the utterance and completes
#[derive(Debug, Default)]
pub struct PlaceholderLocalSynth;

#[async_trait]
impl LocalSynthesizer for PlaceholderLocalSynth {
    async fn speak(&self, text: &str, voice: &FallbackVoice) -> CallResult<()> {
        info!(language = %voice.language, chars = text.len(), "local synthesizer placeholder");
        Ok(())
    }
}

/// Remote-synth playback with on-device fallback
pub struct VoicePlayback {
    synth: Arc<dyn SynthBackend>,
    local: Arc<dyn LocalSynthesizer>,
    voice: FallbackVoice,
    sink: Arc<Sink>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl VoicePlayback {
    /// Open the default output device. The device stream lives on a worker
    /// thread until this object is dropped.
    pub fn new(synth: Arc<dyn SynthBackend>, local: Arc<dyn LocalSynthesizer>) -> CallResult<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<CallResult<Arc<Sink>>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        thread::spawn(move || {
            let (stream, handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(CallError::PlaybackFailed(e.to_string())));
                    return;
                }
            };
            let sink = match Sink::try_new(&handle) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    let _ = ready_tx.send(Err(CallError::PlaybackFailed(e.to_string())));
                    return;
                }
            };
            if ready_tx.send(Ok(Arc::clone(&sink))).is_err() {
                return;
            }
            // Keeps the !Send stream alive until shutdown
            let _ = shutdown_rx.blocking_recv();
            drop(stream);
        });

        let sink = ready_rx
            .recv()
            .map_err(|_| CallError::PlaybackFailed("output thread exited early".into()))??;
        info!("speech playback ready");

        Ok(Self {
            synth,
            local,
            voice: FallbackVoice::default(),
            sink,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn with_voice(mut self, voice: FallbackVoice) -> Self {
        self.voice = voice;
        self
    }

    async fn speak_fallback(
        local: &Arc<dyn LocalSynthesizer>,
        voice: &FallbackVoice,
        text: &str,
        events: &mpsc::Sender<PlaybackEvent>,
    ) {
        let _ = events.send(PlaybackEvent::Started).await;
        match local.speak(text, voice).await {
            Ok(()) => {
                let _ = events.send(PlaybackEvent::Completed).await;
            }
            Err(e) => {
                let _ = events.send(PlaybackEvent::Failed(e.to_string())).await;
            }
        }
    }
}

#[async_trait]
impl SpeechPlayback for VoicePlayback {
    async fn speak(&self, text: &str) -> CallResult<mpsc::Receiver<PlaybackEvent>> {
        let (events_tx, events_rx) = mpsc::channel(8);
        let synth = Arc::clone(&self.synth);
        let local = Arc::clone(&self.local);
        let voice = self.voice.clone();
        let sink = Arc::clone(&self.sink);
        let text = text.to_string();

        tokio::spawn(async move {
            let bytes = match synth.synthesize(&text).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "remote synthesis failed, using local fallback");
                    Self::speak_fallback(&local, &voice, &text, &events_tx).await;
                    return;
                }
            };

            if bytes.is_empty() {
                // Nothing to play; keep the event flow intact
                let _ = events_tx.send(PlaybackEvent::Started).await;
                let _ = events_tx.send(PlaybackEvent::Completed).await;
                return;
            }

            let source = match rodio::Decoder::new(Cursor::new(bytes)) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "audio decode failed, using local fallback");
                    Self::speak_fallback(&local, &voice, &text, &events_tx).await;
                    return;
                }
            };

            sink.set_volume(1.0);
            sink.append(source.convert_samples::<f32>());
            let _ = events_tx.send(PlaybackEvent::Started).await;

            let waiter = Arc::clone(&sink);
            let drained = tokio::task::spawn_blocking(move || waiter.sleep_until_end()).await;
            match drained {
                Ok(()) => {
                    let _ = events_tx.send(PlaybackEvent::Completed).await;
                }
                Err(e) => {
                    let _ = events_tx.send(PlaybackEvent::Failed(e.to_string())).await;
                }
            }
        });

        Ok(events_rx)
    }

    fn cancel(&self) {
        self.sink.stop();
        debug!("playback cancelled");
    }
}

impl Drop for VoicePlayback {
    fn drop(&mut self) {
        self.sink.stop();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Playback that emits the full event flow without touching any audio
/// device. Use for driving the call loop headless.
#[derive(Debug, Default)]
pub struct SilentPlayback;

#[async_trait]
impl SpeechPlayback for SilentPlayback {
    async fn speak(&self, _text: &str) -> CallResult<mpsc::Receiver<PlaybackEvent>> {
        let (tx, rx) = mpsc::channel(2);
        let _ = tx.send(PlaybackEvent::Started).await;
        let _ = tx.send(PlaybackEvent::Completed).await;
        Ok(rx)
    }

    fn cancel(&self) {}
}
