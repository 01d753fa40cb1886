//! Microphone capture for caller utterances
//!
//! Acquisition is guarded twice: a `PermissionGate` models the platform
//! microphone permission, and a busy flag refuses a second concurrent
//! acquisition. The cpal `Stream` is `!Send` on some platforms, so each
//! live capture runs on a dedicated thread that owns the stream; the
//! returned handle only carries channels into that thread. Dropping the
//! handle without `stop` releases the device and discards the audio.

use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A finished recording, encoded and ready for transcription
#[derive(Clone)]
pub struct AudioArtifact {
    /// 16-bit mono WAV bytes
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub duration: Duration,
}

impl std::fmt::Debug for AudioArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioArtifact")
            .field("wav_bytes", &self.wav.len())
            .field("sample_rate", &self.sample_rate)
            .field("duration", &self.duration)
            .finish()
    }
}

/// Platform microphone permission check
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_microphone(&self) -> bool;
}

/// Gate that always grants; for desktop hosts where the OS prompts natively
#[derive(Debug, Default)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionGate for AlwaysGranted {
    async fn request_microphone(&self) -> bool {
        true
    }
}

/// A live recording in progress
#[async_trait]
pub trait CaptureHandle: Send {
    /// Stop recording and return the encoded artifact
    async fn stop(self: Box<Self>) -> CallResult<AudioArtifact>;

    /// One-shot signal fired when the recording hits its maximum duration.
    /// Returns `None` after the first call.
    fn auto_complete(&mut self) -> Option<oneshot::Receiver<()>>;
}

/// Source of capture handles
#[async_trait]
pub trait SpeechCapture: Send + Sync {
    async fn acquire(&self) -> CallResult<Box<dyn CaptureHandle>>;
}

/// Capture parameters
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate requested from the device (default 16000)
    pub sample_rate: u32,
    /// Channel count (default 1, mono)
    pub channels: u16,
    /// Recording length at which capture completes on its own (default 120s)
    pub max_duration: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            max_duration: Duration::from_secs(120),
        }
    }
}

/// Microphone capture via cpal
pub struct CpalCapture {
    config: CaptureConfig,
    gate: Arc<dyn PermissionGate>,
    busy: Arc<AtomicBool>,
}

impl CpalCapture {
    pub fn new(config: CaptureConfig, gate: Arc<dyn PermissionGate>) -> Self {
        Self {
            config,
            gate,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl SpeechCapture for CpalCapture {
    async fn acquire(&self) -> CallResult<Box<dyn CaptureHandle>> {
        if !self.gate.request_microphone().await {
            return Err(CallError::PermissionDenied);
        }

        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(CallError::DeviceBusy);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (auto_tx, auto_rx) = oneshot::channel();

        let config = self.config.clone();
        thread::spawn(move || {
            capture_thread(config, ready_tx, stop_rx, done_tx, auto_tx);
        });

        let ready = ready_rx
            .await
            .map_err(|_| CallError::AudioStream("capture thread exited early".into()));

        match ready {
            Ok(Ok(())) => Ok(Box::new(CpalHandle {
                stop_tx: Some(stop_tx),
                done_rx: Some(done_rx),
                auto_rx: Some(auto_rx),
                busy: Arc::clone(&self.busy),
                sample_rate: self.config.sample_rate,
            })),
            Ok(Err(e)) | Err(e) => {
                self.busy.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Runs on its own thread for the lifetime of one recording; owns the stream
fn capture_thread(
    config: CaptureConfig,
    ready_tx: oneshot::Sender<CallResult<()>>,
    stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<Vec<f32>>,
    auto_tx: oneshot::Sender<()>,
) {
    let host = cpal::default_host();
    let device = match host.default_input_device() {
        Some(d) => d,
        None => {
            let _ = ready_tx.send(Err(CallError::AudioDevice(
                "no input device available".into(),
            )));
            return;
        }
    };

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let max_samples =
        (config.sample_rate as u64 * config.max_duration.as_secs()) as usize * config.channels as usize;
    let samples: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
    let auto_tx = Arc::new(Mutex::new(Some(auto_tx)));

    let buffer = Arc::clone(&samples);
    let auto = Arc::clone(&auto_tx);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _| {
            if let Ok(mut buf) = buffer.lock() {
                if buf.len() < max_samples {
                    buf.extend_from_slice(data);
                    if buf.len() >= max_samples {
                        if let Ok(mut slot) = auto.lock() {
                            if let Some(tx) = slot.take() {
                                debug!("max recording duration reached");
                                let _ = tx.send(());
                            }
                        }
                    }
                }
            }
        },
        |err| warn!(error = %err, "capture stream error"),
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.into()));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(e.into()));
        return;
    }

    if ready_tx.send(Ok(())).is_err() {
        return;
    }
    info!(sample_rate = config.sample_rate, "microphone capture started");

    // Blocks until the handle signals stop or is dropped
    let _ = stop_rx.blocking_recv();
    drop(stream);

    let recorded = samples
        .lock()
        .map(|mut buf| std::mem::take(&mut *buf))
        .unwrap_or_default();
    let _ = done_tx.send(recorded);
}

struct CpalHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<Vec<f32>>>,
    auto_rx: Option<oneshot::Receiver<()>>,
    busy: Arc<AtomicBool>,
    sample_rate: u32,
}

#[async_trait]
impl CaptureHandle for CpalHandle {
    async fn stop(mut self: Box<Self>) -> CallResult<AudioArtifact> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        let done_rx = self
            .done_rx
            .take()
            .ok_or_else(|| CallError::ChannelClosed("capture already stopped".into()))?;
        let samples = done_rx
            .await
            .map_err(|_| CallError::ChannelClosed("capture thread exited".into()))?;

        self.busy.store(false, Ordering::SeqCst);

        if samples.is_empty() {
            return Err(CallError::EmptyRecording);
        }

        let duration =
            Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);
        info!(
            samples = samples.len(),
            seconds = duration.as_secs_f64(),
            "capture stopped"
        );

        Ok(AudioArtifact {
            wav: encode_wav(&samples, self.sample_rate),
            sample_rate: self.sample_rate,
            duration,
        })
    }

    fn auto_complete(&mut self) -> Option<oneshot::Receiver<()>> {
        self.auto_rx.take()
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
            self.busy.store(false, Ordering::SeqCst);
            debug!("capture handle dropped, device released");
        }
    }
}

/// Encode f32 PCM as a 16-bit mono WAV file in memory
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;

    let mut buf = Vec::with_capacity(44 + data_len as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}
