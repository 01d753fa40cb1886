//! Call session state machine
//!
//! The synchronous transition core of the engine. It consumes discrete
//! inputs (UI button presses) and completions (results of async work posted
//! back by the engine loop), mutates the session, and returns the effects
//! the engine must execute next. All async work lives outside this module,
//! which keeps every transition atomic and testable without a runtime.
//!
//! Completions carry the generation they were spawned under; a completion
//! whose generation no longer matches the session is discarded, so work
//! started before an end-call or reset can never touch the new session.

use crate::config::EngineConfig;
use crate::error::CallError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Phases of a call, from idle through teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call in progress
    Idle,
    /// Dialing; waiting for the simulated connect delay
    Connecting,
    /// Connected; greeting queued but not yet audible
    AwaitingGreetingPlayback,
    /// Microphone is live and capturing the caller
    Listening,
    /// Recording stopped; transcription and reasoning in flight
    Processing,
    /// Assistant reply is playing
    Speaking,
    /// Call torn down
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::AwaitingGreetingPlayback => "awaiting_greeting_playback",
            CallState::Listening => "listening",
            CallState::Processing => "processing",
            CallState::Speaking => "speaking",
            CallState::Ended => "ended",
        }
    }

    /// Whether a call is currently in progress
    pub fn is_active(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Ended)
    }
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry in the call transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    /// Monotonic position within the call, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Discrete inputs from the caller's UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    /// Place a new call
    Start,
    /// Stop recording and process the utterance
    StopListening,
    /// Hang up
    EndCall,
}

/// Results of async work, posted back into the session by the engine loop
#[derive(Debug)]
pub enum Completion {
    /// The simulated dial delay elapsed
    Connected,
    /// Capture finished on its own (max-duration auto-complete)
    CaptureComplete,
    /// The microphone could not be acquired or the stream died
    CaptureFailed(CallError),
    /// Transcription and reasoning finished for the current utterance
    TurnResolved {
        transcript: String,
        reply: String,
        /// True when the canned pair was substituted after a pipeline failure
        fallback: bool,
    },
    /// Speech playback became audible
    PlaybackStarted,
    /// Speech playback reached its terminal event
    PlaybackFinished,
}

/// Commands the engine loop must execute after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartTimer,
    ClearTimer,
    /// Post `Connected` after the simulated dial delay
    ScheduleConnect(Duration),
    /// Synthesize and play the given text
    Speak(String),
    /// Acquire the microphone and begin capturing
    AcquireCapture,
    /// Stop the live capture and run it through transcription and reasoning
    StopCaptureAndProcess,
    /// Release any live capture without processing it
    DiscardCapture,
    CancelPlayback,
}

/// Notifications published to observers (UI, tests)
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(CallState),
    TurnAppended(Turn),
    /// A fatal session error; the call has been reset
    SessionError(String),
}

/// The input the UI's primary button maps to in the given state
pub fn primary_input_for(state: CallState) -> Option<SessionInput> {
    match state {
        CallState::Idle | CallState::Ended => Some(SessionInput::Start),
        CallState::Listening => Some(SessionInput::StopListening),
        _ => None,
    }
}

/// The session itself: state, transcript, and the generation guard
pub struct CallSession {
    state: CallState,
    history: Vec<Turn>,
    next_sequence: u64,
    started_at: Option<DateTime<Utc>>,
    generation: u64,
    config: EngineConfig,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl CallSession {
    pub fn new(config: EngineConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Self {
            state: CallState::Idle,
            history: Vec::new(),
            next_sequence: 1,
            started_at: None,
            generation: 0,
            config,
            event_tx,
        };

        (session, event_rx)
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Generation tag for async work spawned right now. Completions posted
    /// back with an older tag are discarded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The input the UI's primary button should send in the current state,
    /// if the button is active at all
    pub fn primary_input(&self) -> Option<SessionInput> {
        primary_input_for(self.state)
    }

    /// Apply a UI input, returning the effects to execute
    pub fn handle_input(&mut self, input: SessionInput) -> Vec<Effect> {
        match (self.state, input) {
            (CallState::Idle | CallState::Ended, SessionInput::Start) => {
                self.generation += 1;
                self.history.clear();
                self.next_sequence = 1;
                self.started_at = Some(Utc::now());
                self.set_state(CallState::Connecting);
                vec![
                    Effect::StartTimer,
                    Effect::ScheduleConnect(self.config.connect_delay),
                ]
            }

            (CallState::Listening, SessionInput::StopListening) => {
                self.set_state(CallState::Processing);
                vec![Effect::StopCaptureAndProcess]
            }

            (CallState::Ended, SessionInput::EndCall) => Vec::new(),

            (_, SessionInput::EndCall) => {
                self.generation += 1;
                self.history.clear();
                self.next_sequence = 1;
                self.started_at = None;
                self.set_state(CallState::Ended);
                vec![
                    Effect::CancelPlayback,
                    Effect::DiscardCapture,
                    Effect::ClearTimer,
                ]
            }

            (state, input) => {
                debug!(state = state.as_str(), ?input, "input ignored in current state");
                Vec::new()
            }
        }
    }

    /// Apply the result of async work spawned under `generation`
    pub fn handle_completion(&mut self, generation: u64, completion: Completion) -> Vec<Effect> {
        if generation != self.generation {
            debug!(
                stale = generation,
                current = self.generation,
                ?completion,
                "discarding stale completion"
            );
            return Vec::new();
        }

        match (self.state, completion) {
            (CallState::Connecting, Completion::Connected) => {
                let greeting = self.config.greeting.clone();
                self.append_turn(Role::Assistant, greeting.clone());
                self.set_state(CallState::AwaitingGreetingPlayback);
                vec![Effect::Speak(greeting)]
            }

            (CallState::AwaitingGreetingPlayback, Completion::PlaybackStarted) => {
                self.set_state(CallState::Speaking);
                Vec::new()
            }

            // Ordinary turns enter Speaking as soon as the reply resolves,
            // so the audible-start notification carries no new information.
            (CallState::Speaking, Completion::PlaybackStarted) => Vec::new(),

            (
                CallState::AwaitingGreetingPlayback | CallState::Speaking,
                Completion::PlaybackFinished,
            ) => {
                self.set_state(CallState::Listening);
                vec![Effect::AcquireCapture]
            }

            (CallState::Listening, Completion::CaptureComplete) => {
                self.set_state(CallState::Processing);
                vec![Effect::StopCaptureAndProcess]
            }

            (CallState::Listening, Completion::CaptureFailed(err)) => {
                warn!(error = %err, "capture failed, resetting call");
                self.emit(SessionEvent::SessionError(err.to_string()));
                self.generation += 1;
                self.history.clear();
                self.next_sequence = 1;
                self.started_at = None;
                self.set_state(CallState::Idle);
                vec![Effect::DiscardCapture, Effect::ClearTimer]
            }

            (
                CallState::Processing,
                Completion::TurnResolved {
                    transcript,
                    reply,
                    fallback,
                },
            ) => {
                if fallback {
                    warn!("pipeline failed, substituting canned turn pair");
                }
                self.append_turn(Role::User, transcript);
                self.append_turn(Role::Assistant, reply.clone());
                self.set_state(CallState::Speaking);
                vec![Effect::Speak(reply)]
            }

            (state, completion) => {
                debug!(
                    state = state.as_str(),
                    ?completion,
                    "completion ignored in current state"
                );
                Vec::new()
            }
        }
    }

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            debug!(from = self.state.as_str(), to = state.as_str(), "state change");
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn append_turn(&mut self, role: Role, text: String) {
        let turn = Turn {
            role,
            text,
            sequence: self.next_sequence,
            timestamp: Utc::now(),
        };
        self.next_sequence += 1;
        self.history.push(turn.clone());
        self.emit(SessionEvent::TurnAppended(turn));
    }

    fn emit(&self, event: SessionEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("session event receiver dropped");
        }
    }
}
