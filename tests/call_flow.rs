//! Integration tests for the call session engine
//!
//! The engine is driven end to end with fake collaborators, so no audio
//! hardware or network access is needed.

use async_trait::async_trait;
use careline_voice::{
    encode_wav, AudioArtifact, CallEngine, CallError, CallResult, CallState, CaptureHandle,
    Collaborators, EngineConfig, PlaybackEvent, ReasoningClient, SessionEvent, SpeechCapture,
    SpeechPlayback, TranscriptionClient, Turn,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config() -> EngineConfig {
    EngineConfig {
        connect_delay: Duration::ZERO,
        greeting: "Careline here. Tell me what's happening.".to_string(),
        fallback_transcript: "I need help.".to_string(),
        fallback_reply: "Stay calm, I'm still with you.".to_string(),
        max_recording: Duration::from_secs(120),
    }
}

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

struct FakeCapture {
    deny_permission: bool,
    /// Sample count each recording yields; 0 simulates an empty recording
    samples: usize,
    /// Live acquisitions; must drop back to 0 after release
    active: Arc<AtomicUsize>,
    /// Sender for the latest handle's auto-complete signal
    auto_fire: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl FakeCapture {
    fn new(samples: usize) -> Self {
        Self {
            deny_permission: false,
            samples,
            active: Arc::new(AtomicUsize::new(0)),
            auto_fire: Arc::new(Mutex::new(None)),
        }
    }

    fn denying() -> Self {
        Self {
            deny_permission: true,
            ..Self::new(0)
        }
    }

    fn fire_auto_complete(&self) {
        if let Some(tx) = self.auto_fire.lock().unwrap().take() {
            tx.send(()).unwrap();
        }
    }
}

#[async_trait]
impl SpeechCapture for FakeCapture {
    async fn acquire(&self) -> CallResult<Box<dyn CaptureHandle>> {
        if self.deny_permission {
            return Err(CallError::PermissionDenied);
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        let (auto_tx, auto_rx) = oneshot::channel();
        *self.auto_fire.lock().unwrap() = Some(auto_tx);
        Ok(Box::new(FakeHandle {
            samples: self.samples,
            active: Arc::clone(&self.active),
            auto_rx: Some(auto_rx),
            released: false,
        }))
    }
}

struct FakeHandle {
    samples: usize,
    active: Arc<AtomicUsize>,
    auto_rx: Option<oneshot::Receiver<()>>,
    released: bool,
}

#[async_trait]
impl CaptureHandle for FakeHandle {
    async fn stop(mut self: Box<Self>) -> CallResult<AudioArtifact> {
        self.released = true;
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.samples == 0 {
            return Err(CallError::EmptyRecording);
        }
        let pcm = vec![0.1f32; self.samples];
        Ok(AudioArtifact {
            wav: encode_wav(&pcm, 16000),
            sample_rate: 16000,
            duration: Duration::from_secs_f64(self.samples as f64 / 16000.0),
        })
    }

    fn auto_complete(&mut self) -> Option<oneshot::Receiver<()>> {
        self.auto_rx.take()
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        if !self.released {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct FakeTranscriber {
    fail: bool,
    text: String,
}

impl FakeTranscriber {
    fn returning(text: &str) -> Self {
        Self {
            fail: false,
            text: text.to_string(),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::returning("")
        }
    }
}

#[async_trait]
impl TranscriptionClient for FakeTranscriber {
    async fn transcribe(&self, _audio: &AudioArtifact) -> CallResult<String> {
        if self.fail {
            return Err(CallError::TranscriptionFailed("service down".into()));
        }
        Ok(self.text.clone())
    }
}

struct FakeReasoner {
    fail: bool,
    reply: String,
    /// Transcript snapshots received, one per call
    histories: Arc<Mutex<Vec<Vec<Turn>>>>,
    /// When set, `reply` blocks until the gate is notified
    gate: Option<Arc<Notify>>,
}

impl FakeReasoner {
    fn returning(reply: &str) -> Self {
        Self {
            fail: false,
            reply: reply.to_string(),
            histories: Arc::new(Mutex::new(Vec::new())),
            gate: None,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::returning("")
        }
    }

    fn gated(reply: &str, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::returning(reply)
        }
    }
}

#[async_trait]
impl ReasoningClient for FakeReasoner {
    async fn reply(&self, history: &[Turn], _utterance: &str) -> CallResult<String> {
        self.histories.lock().unwrap().push(history.to_vec());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(CallError::ReasoningFailed("service down".into()));
        }
        Ok(self.reply.clone())
    }
}

/// Playback whose event flow is driven by the test
struct ManualPlayback {
    sessions: Arc<Mutex<Vec<mpsc::Sender<PlaybackEvent>>>>,
    spoken: Arc<Mutex<Vec<String>>>,
    cancelled: Arc<AtomicUsize>,
}

impl ManualPlayback {
    fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(Vec::new())),
            spoken: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn spoken_texts(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    /// Wait until the nth (1-based) utterance has been requested, then
    /// return a sender for its event stream
    async fn utterance(&self, n: usize) -> mpsc::Sender<PlaybackEvent> {
        let sessions = Arc::clone(&self.sessions);
        timeout(WAIT, async move {
            loop {
                if let Some(tx) = {
                    let s = sessions.lock().unwrap();
                    (s.len() >= n).then(|| s[n - 1].clone())
                } {
                    return tx;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("utterance was never spoken")
    }
}

#[async_trait]
impl SpeechPlayback for ManualPlayback {
    async fn speak(&self, text: &str) -> CallResult<mpsc::Receiver<PlaybackEvent>> {
        let (tx, rx) = mpsc::channel(4);
        self.sessions.lock().unwrap().push(tx);
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(rx)
    }

    fn cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    engine: CallEngine,
    capture: Arc<FakeCapture>,
    playback: Arc<ManualPlayback>,
    reasoner: Arc<FakeReasoner>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

fn harness(
    capture: FakeCapture,
    transcriber: FakeTranscriber,
    reasoner: FakeReasoner,
) -> Harness {
    init_logging();
    let capture = Arc::new(capture);
    let playback = Arc::new(ManualPlayback::new());
    let reasoner = Arc::new(reasoner);
    let mut engine = CallEngine::new(
        test_config(),
        Collaborators {
            capture: Arc::clone(&capture) as Arc<dyn SpeechCapture>,
            transcriber: Arc::new(transcriber),
            reasoner: Arc::clone(&reasoner) as Arc<dyn ReasoningClient>,
            playback: Arc::clone(&playback) as Arc<dyn SpeechPlayback>,
        },
    );
    let events = engine.take_events().expect("event stream already taken");
    Harness {
        engine,
        capture,
        playback,
        reasoner,
        events,
    }
}

async fn wait_for_state(engine: &CallEngine, want: CallState) {
    timeout(WAIT, async {
        while engine.state() != want {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for {:?}, still in {:?}",
            want,
            engine.state()
        )
    });
}

/// Wait until the fake capture reports exactly `want` live acquisitions
async fn wait_for_active(capture: &FakeCapture, want: usize) {
    timeout(WAIT, async {
        while capture.active.load(Ordering::SeqCst) != want {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for {} active captures, still at {}",
            want,
            capture.active.load(Ordering::SeqCst)
        )
    });
}

/// Drive a fresh call through greeting playback into Listening
async fn reach_listening(h: &Harness) {
    h.engine.start().unwrap();
    let greeting = h.playback.utterance(1).await;
    greeting.send(PlaybackEvent::Started).await.unwrap();
    wait_for_state(&h.engine, CallState::Speaking).await;
    greeting.send(PlaybackEvent::Completed).await.unwrap();
    wait_for_state(&h.engine, CallState::Listening).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_greeting_is_spoken_then_listening() {
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::returning("unused"),
        FakeReasoner::returning("unused"),
    );

    h.engine.start().unwrap();
    let greeting = h.playback.utterance(1).await;
    assert_eq!(
        h.playback.spoken_texts(),
        vec!["Careline here. Tell me what's happening.".to_string()]
    );

    greeting.send(PlaybackEvent::Started).await.unwrap();
    wait_for_state(&h.engine, CallState::Speaking).await;

    greeting.send(PlaybackEvent::Completed).await.unwrap();
    wait_for_state(&h.engine, CallState::Listening).await;

    let history = h.engine.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sequence, 1);
    assert_eq!(history[0].text, "Careline here. Tell me what's happening.");
    assert!(h.engine.timer().is_running());
    wait_for_active(&h.capture, 1).await;
}

#[tokio::test]
async fn test_successful_turn_round_trip() {
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::returning("my chest hurts"),
        FakeReasoner::returning("Sit down and take slow breaths."),
    );
    reach_listening(&h).await;

    h.engine.stop_listening().unwrap();
    wait_for_state(&h.engine, CallState::Speaking).await;

    assert_eq!(h.engine.transcript().as_deref(), Some("my chest hurts"));
    assert_eq!(
        h.engine.response_text().as_deref(),
        Some("Sit down and take slow breaths.")
    );

    // The reasoner saw the greeting but not the utterance being resolved
    let histories = h.reasoner.histories.lock().unwrap().clone();
    assert_eq!(histories.len(), 1);
    assert_eq!(histories[0].len(), 1);

    let reply = h.playback.utterance(2).await;
    reply.send(PlaybackEvent::Started).await.unwrap();
    reply.send(PlaybackEvent::Completed).await.unwrap();
    wait_for_state(&h.engine, CallState::Listening).await;

    let sequences: Vec<u64> = h.engine.history().iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_transcription_failure_uses_canned_pair() {
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::failing(),
        FakeReasoner::returning("unused"),
    );
    reach_listening(&h).await;

    h.engine.stop_listening().unwrap();
    wait_for_state(&h.engine, CallState::Speaking).await;

    assert_eq!(h.engine.transcript().as_deref(), Some("I need help."));
    assert_eq!(
        h.engine.response_text().as_deref(),
        Some("Stay calm, I'm still with you.")
    );
    // The canned reply still goes through the speakers
    assert_eq!(
        h.playback.spoken_texts().last().map(String::as_str),
        Some("Stay calm, I'm still with you.")
    );
}

#[tokio::test]
async fn test_reasoning_failure_uses_canned_pair() {
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::returning("I feel dizzy"),
        FakeReasoner::failing(),
    );
    reach_listening(&h).await;

    h.engine.stop_listening().unwrap();
    wait_for_state(&h.engine, CallState::Speaking).await;

    // The real transcript is replaced by the canned pair, not mixed with it
    assert_eq!(h.engine.transcript().as_deref(), Some("I need help."));
    assert_eq!(
        h.engine.response_text().as_deref(),
        Some("Stay calm, I'm still with you.")
    );
}

#[tokio::test]
async fn test_empty_recording_uses_canned_pair() {
    let h = harness(
        FakeCapture::new(0),
        FakeTranscriber::returning("unused"),
        FakeReasoner::returning("unused"),
    );
    reach_listening(&h).await;

    h.engine.stop_listening().unwrap();
    wait_for_state(&h.engine, CallState::Speaking).await;

    assert_eq!(h.engine.transcript().as_deref(), Some("I need help."));
}

#[tokio::test]
async fn test_auto_complete_commits_the_turn() {
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::returning("are you still there"),
        FakeReasoner::returning("Yes, I'm right here with you."),
    );
    reach_listening(&h).await;
    wait_for_active(&h.capture, 1).await;

    // Simulates the recording hitting its maximum duration
    h.capture.fire_auto_complete();
    wait_for_state(&h.engine, CallState::Speaking).await;

    assert_eq!(h.engine.transcript().as_deref(), Some("are you still there"));
}

#[tokio::test]
async fn test_end_call_cancels_playback_and_releases_capture() {
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::returning("unused"),
        FakeReasoner::returning("unused"),
    );
    reach_listening(&h).await;
    wait_for_active(&h.capture, 1).await;

    h.engine.end_call().unwrap();
    wait_for_state(&h.engine, CallState::Ended).await;

    assert!(h.engine.history().is_empty());
    assert!(!h.engine.timer().is_running());
    assert!(h.playback.cancelled.load(Ordering::SeqCst) >= 1);

    // The live capture handle is dropped and the device released
    wait_for_active(&h.capture, 0).await;

    // Hanging up again is a no-op
    h.engine.end_call().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.engine.state(), CallState::Ended);
}

#[tokio::test]
async fn test_pipeline_result_after_end_call_is_discarded() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::returning("my arm is numb"),
        FakeReasoner::gated("Too late, call ended.", Arc::clone(&gate)),
    );
    reach_listening(&h).await;

    h.engine.stop_listening().unwrap();
    wait_for_state(&h.engine, CallState::Processing).await;

    // Hang up while transcription/reasoning is still in flight
    h.engine.end_call().unwrap();
    wait_for_state(&h.engine, CallState::Ended).await;

    // Let the stranded pipeline finish; its result must not resurface
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.engine.state(), CallState::Ended);
    assert!(h.engine.history().is_empty());
    assert_eq!(h.playback.spoken_texts().len(), 1); // only the greeting
}

#[tokio::test]
async fn test_permission_denied_resets_to_idle() {
    let mut h = harness(
        FakeCapture::denying(),
        FakeTranscriber::returning("unused"),
        FakeReasoner::returning("unused"),
    );

    h.engine.start().unwrap();
    let greeting = h.playback.utterance(1).await;
    greeting.send(PlaybackEvent::Started).await.unwrap();
    greeting.send(PlaybackEvent::Completed).await.unwrap();

    // Acquisition fails, so the call resets instead of listening
    wait_for_state(&h.engine, CallState::Idle).await;
    assert!(h.engine.history().is_empty());
    assert!(!h.engine.timer().is_running());

    let saw_error = timeout(WAIT, async {
        while let Some(event) = h.events.recv().await {
            if let SessionEvent::SessionError(msg) = event {
                return msg;
            }
        }
        String::new()
    })
    .await
    .expect("no session error emitted");
    assert!(saw_error.contains("permission"));
}

#[tokio::test]
async fn test_inputs_are_single_flight() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::returning("hello"),
        FakeReasoner::gated("Hello.", Arc::clone(&gate)),
    );
    reach_listening(&h).await;

    h.engine.stop_listening().unwrap();
    wait_for_state(&h.engine, CallState::Processing).await;

    // Neither a second stop nor a start means anything mid-processing
    h.engine.stop_listening().unwrap();
    h.engine.start().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.engine.state(), CallState::Processing);

    gate.notify_one();
    wait_for_state(&h.engine, CallState::Speaking).await;
    // Exactly one utterance pair was appended after the greeting
    assert_eq!(h.engine.history().len(), 3);
}

#[tokio::test]
async fn test_primary_action_follows_the_state() {
    let h = harness(
        FakeCapture::new(16000),
        FakeTranscriber::returning("hi"),
        FakeReasoner::returning("Hi."),
    );

    // Idle: primary action places the call
    h.engine.primary_action().unwrap();
    let greeting = h.playback.utterance(1).await;
    greeting.send(PlaybackEvent::Started).await.unwrap();
    greeting.send(PlaybackEvent::Completed).await.unwrap();
    wait_for_state(&h.engine, CallState::Listening).await;

    // Listening: primary action stops the recording
    h.engine.primary_action().unwrap();
    wait_for_state(&h.engine, CallState::Speaking).await;
    assert_eq!(h.engine.transcript().as_deref(), Some("hi"));
}
