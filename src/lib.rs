//! # Careline Voice - Emergency Call Session Engine
//!
//! This crate drives a simulated emergency-assistance voice call: microphone
//! capture, remote transcription, remote reasoning over the full transcript,
//! and spoken replies, looping until the caller hangs up. A remote fault
//! never strands the caller; the pipeline degrades to a canned reassurance
//! pair and the call keeps going.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Call Engine                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │   Capture    │ → │ Transcription│ → │  Reasoning   │      │
//! │  │    (cpal)    │   │  (HTTP STT)  │   │ (HTTP chat)  │      │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘      │
//! │         ↑                                     ↓              │
//! │  ┌──────┴───────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │ Call Session │ ← │   Playback   │ ← │  Synthesis   │      │
//! │  │(state machine)│  │   (rodio)    │   │ (HTTP TTS)   │      │
//! │  └──────────────┘   └──────────────┘   └──────────────┘      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! One engine task owns the session; UI inputs and async results funnel
//! through a single inbox, so there is never more than one capture,
//! pipeline run, or playback in flight.

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod playback;
pub mod reasoning;
pub mod session;
pub mod timer;
pub mod transcribe;

pub use capture::{
    encode_wav, AlwaysGranted, AudioArtifact, CaptureConfig, CaptureHandle, CpalCapture,
    PermissionGate, SpeechCapture,
};
pub use config::EngineConfig;
pub use engine::{CallEngine, Collaborators};
pub use error::{CallError, CallResult};
pub use playback::{
    FallbackVoice, LocalSynthesizer, PlaceholderLocalSynth, PlaceholderSynth, PlaybackEvent,
    RemoteSynth, SilentPlayback, SpeechPlayback, SynthBackend, VoicePlayback,
};
pub use reasoning::{PlaceholderReasoner, ReasoningClient, RemoteReasoner};
pub use session::{
    primary_input_for, CallSession, CallState, Completion, Effect, Role, SessionEvent,
    SessionInput, Turn,
};
pub use timer::{format_elapsed, CallTimer};
pub use transcribe::{PlaceholderTranscriber, RemoteTranscriber, TranscriptionClient};
