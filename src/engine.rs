//! **CallEngine** — the async driver around the session state machine
//!
//! One tokio task owns the `CallSession` and a single inbox. UI inputs and
//! the results of spawned work all arrive through that inbox, so exactly one
//! transition runs at a time and only one capture/pipeline/playback can be
//! in flight. Spawned work carries the generation it was started under;
//! results from a previous call land in the inbox and are discarded by the
//! session's generation guard.

use crate::capture::{CaptureHandle, SpeechCapture};
use crate::config::EngineConfig;
use crate::error::{CallError, CallResult};
use crate::playback::{PlaybackEvent, SpeechPlayback};
use crate::reasoning::ReasoningClient;
use crate::session::{
    primary_input_for, CallSession, CallState, Completion, Effect, SessionEvent, SessionInput, Turn,
};
use crate::timer::CallTimer;
use crate::transcribe::TranscriptionClient;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The services the engine drives. Every seam is a trait object so tests
/// and demos can swap in placeholders.
pub struct Collaborators {
    pub capture: Arc<dyn SpeechCapture>,
    pub transcriber: Arc<dyn TranscriptionClient>,
    pub reasoner: Arc<dyn ReasoningClient>,
    pub playback: Arc<dyn SpeechPlayback>,
}

enum EngineMsg {
    Input(SessionInput),
    Done {
        generation: u64,
        completion: Completion,
    },
    Acquired {
        generation: u64,
        handle: Box<dyn CaptureHandle>,
    },
    Shutdown,
}

/// Snapshot published after every transition for lock-free-ish UI reads
struct Shared {
    state: RwLock<CallState>,
    history: RwLock<Vec<Turn>>,
}

/// Public handle to a running call session
pub struct CallEngine {
    inbox: mpsc::UnboundedSender<EngineMsg>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    shared: Arc<Shared>,
    timer: CallTimer,
}

impl CallEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let (session, events_rx) = CallSession::new(config);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: RwLock::new(CallState::Idle),
            history: RwLock::new(Vec::new()),
        });
        let timer = CallTimer::new();

        let runtime = Runtime {
            session,
            collaborators,
            inbox_tx: inbox_tx.clone(),
            shared: Arc::clone(&shared),
            timer: timer.clone(),
            live_capture: None,
        };
        tokio::spawn(runtime.run(inbox_rx));

        Self {
            inbox: inbox_tx,
            events: Some(events_rx),
            shared,
            timer,
        }
    }

    /// Place a new call
    pub fn start(&self) -> CallResult<()> {
        self.send_input(SessionInput::Start)
    }

    /// Stop recording and process the caller's utterance
    pub fn stop_listening(&self) -> CallResult<()> {
        self.send_input(SessionInput::StopListening)
    }

    /// Hang up
    pub fn end_call(&self) -> CallResult<()> {
        self.send_input(SessionInput::EndCall)
    }

    /// Send whatever the primary UI button currently means, if anything
    pub fn primary_action(&self) -> CallResult<()> {
        match primary_input_for(self.state()) {
            Some(input) => self.send_input(input),
            None => Ok(()),
        }
    }

    fn send_input(&self, input: SessionInput) -> CallResult<()> {
        self.inbox
            .send(EngineMsg::Input(input))
            .map_err(|_| CallError::ChannelClosed("engine loop stopped".into()))
    }

    /// Take the session event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    pub fn state(&self) -> CallState {
        self.shared
            .state
            .read()
            .map(|s| *s)
            .unwrap_or(CallState::Idle)
    }

    pub fn history(&self) -> Vec<Turn> {
        self.shared
            .history
            .read()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Text of the caller's most recent utterance, if any
    pub fn transcript(&self) -> Option<String> {
        self.shared.history.read().ok().and_then(|h| {
            h.iter()
                .rev()
                .find(|t| t.role == crate::session::Role::User)
                .map(|t| t.text.clone())
        })
    }

    /// Text of the assistant's most recent reply, if any
    pub fn response_text(&self) -> Option<String> {
        self.shared.history.read().ok().and_then(|h| {
            h.iter()
                .rev()
                .find(|t| t.role == crate::session::Role::Assistant)
                .map(|t| t.text.clone())
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.timer.elapsed()
    }

    pub fn timer(&self) -> CallTimer {
        self.timer.clone()
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        let _ = self.inbox.send(EngineMsg::Shutdown);
    }
}

/// The engine loop's private state; lives on its own task
struct Runtime {
    session: CallSession,
    collaborators: Collaborators,
    inbox_tx: mpsc::UnboundedSender<EngineMsg>,
    shared: Arc<Shared>,
    timer: CallTimer,
    live_capture: Option<Box<dyn CaptureHandle>>,
}

impl Runtime {
    async fn run(mut self, mut inbox_rx: mpsc::UnboundedReceiver<EngineMsg>) {
        info!("call engine loop started");
        while let Some(msg) = inbox_rx.recv().await {
            let effects = match msg {
                EngineMsg::Input(input) => self.session.handle_input(input),
                EngineMsg::Done {
                    generation,
                    completion,
                } => self.session.handle_completion(generation, completion),
                EngineMsg::Acquired { generation, handle } => {
                    self.store_capture(generation, handle);
                    Vec::new()
                }
                EngineMsg::Shutdown => break,
            };

            self.publish();
            for effect in effects {
                self.execute(effect);
            }
        }
        debug!("call engine loop stopped");
    }

    fn publish(&self) {
        if let Ok(mut state) = self.shared.state.write() {
            *state = self.session.state();
        }
        if let Ok(mut history) = self.shared.history.write() {
            if history.len() != self.session.history().len() {
                *history = self.session.history().to_vec();
            }
        }
    }

    /// A capture acquisition finished. Keep the handle only if it still
    /// belongs to this generation and the session is still listening.
    fn store_capture(&mut self, generation: u64, mut handle: Box<dyn CaptureHandle>) {
        if generation != self.session.generation() || self.session.state() != CallState::Listening
        {
            debug!("dropping capture acquired for a departed session state");
            drop(handle);
            return;
        }

        if let Some(auto_rx) = handle.auto_complete() {
            let inbox = self.inbox_tx.clone();
            tokio::spawn(async move {
                if auto_rx.await.is_ok() {
                    let _ = inbox.send(EngineMsg::Done {
                        generation,
                        completion: Completion::CaptureComplete,
                    });
                }
            });
        }

        self.live_capture = Some(handle);
    }

    fn execute(&mut self, effect: Effect) {
        let generation = self.session.generation();
        let inbox = self.inbox_tx.clone();

        match effect {
            Effect::StartTimer => self.timer.start(),
            Effect::ClearTimer => self.timer.clear(),

            Effect::ScheduleConnect(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send(EngineMsg::Done {
                        generation,
                        completion: Completion::Connected,
                    });
                });
            }

            Effect::AcquireCapture => {
                let capture = Arc::clone(&self.collaborators.capture);
                tokio::spawn(async move {
                    match capture.acquire().await {
                        Ok(handle) => {
                            let _ = inbox.send(EngineMsg::Acquired { generation, handle });
                        }
                        Err(e) => {
                            let _ = inbox.send(EngineMsg::Done {
                                generation,
                                completion: Completion::CaptureFailed(e),
                            });
                        }
                    }
                });
            }

            Effect::StopCaptureAndProcess => {
                let handle = self.live_capture.take();
                let transcriber = Arc::clone(&self.collaborators.transcriber);
                let reasoner = Arc::clone(&self.collaborators.reasoner);
                let history = self.session.history().to_vec();
                let fallback_transcript = self.session.config().fallback_transcript.clone();
                let fallback_reply = self.session.config().fallback_reply.clone();
                tokio::spawn(async move {
                    let completion = resolve_turn(
                        handle,
                        transcriber,
                        reasoner,
                        history,
                        fallback_transcript,
                        fallback_reply,
                    )
                    .await;
                    let _ = inbox.send(EngineMsg::Done {
                        generation,
                        completion,
                    });
                });
            }

            Effect::DiscardCapture => {
                if let Some(handle) = self.live_capture.take() {
                    debug!("discarding live capture");
                    drop(handle);
                }
            }

            Effect::CancelPlayback => self.collaborators.playback.cancel(),

            Effect::Speak(text) => {
                let playback = Arc::clone(&self.collaborators.playback);
                tokio::spawn(async move {
                    drive_playback(playback, text, generation, inbox).await;
                });
            }
        }
    }
}

/// Run the captured utterance through transcription and reasoning. Any
/// failure along the way resolves to the canned fallback pair so the call
/// keeps moving.
async fn resolve_turn(
    handle: Option<Box<dyn CaptureHandle>>,
    transcriber: Arc<dyn TranscriptionClient>,
    reasoner: Arc<dyn ReasoningClient>,
    history: Vec<Turn>,
    fallback_transcript: String,
    fallback_reply: String,
) -> Completion {
    let outcome = async {
        let handle = handle.ok_or(CallError::EmptyRecording)?;
        let audio = handle.stop().await?;
        let transcript = transcriber.transcribe(&audio).await?;
        let reply = reasoner.reply(&history, &transcript).await?;
        Ok::<_, CallError>((transcript, reply))
    }
    .await;

    match outcome {
        Ok((transcript, reply)) => Completion::TurnResolved {
            transcript,
            reply,
            fallback: false,
        },
        Err(e) => {
            warn!(error = %e, "turn pipeline failed, falling back to canned pair");
            Completion::TurnResolved {
                transcript: fallback_transcript,
                reply: fallback_reply,
                fallback: true,
            }
        }
    }
}

/// Forward playback progress into the inbox. Whatever happens, exactly one
/// `PlaybackFinished` is posted so the session never sticks in Speaking.
async fn drive_playback(
    playback: Arc<dyn SpeechPlayback>,
    text: String,
    generation: u64,
    inbox: mpsc::UnboundedSender<EngineMsg>,
) {
    let mut events = match playback.speak(&text).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(error = %e, "playback could not start");
            let _ = inbox.send(EngineMsg::Done {
                generation,
                completion: Completion::PlaybackFinished,
            });
            return;
        }
    };

    loop {
        match events.recv().await {
            Some(PlaybackEvent::Started) => {
                let _ = inbox.send(EngineMsg::Done {
                    generation,
                    completion: Completion::PlaybackStarted,
                });
            }
            Some(PlaybackEvent::Failed(msg)) => {
                warn!(error = %msg, "playback failed");
                let _ = inbox.send(EngineMsg::Done {
                    generation,
                    completion: Completion::PlaybackFinished,
                });
                break;
            }
            Some(PlaybackEvent::Completed) | None => {
                let _ = inbox.send(EngineMsg::Done {
                    generation,
                    completion: Completion::PlaybackFinished,
                });
                break;
            }
        }
    }
}
