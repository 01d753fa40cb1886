//! Engine configuration
//!
//! Defaults cover the simulated-connect delay, the assistant greeting, and
//! the canned pair substituted when the transcription/reasoning pipeline
//! fails mid-call. Everything can be overridden from the environment.

use std::time::Duration;

/// Greeting spoken as the assistant's first turn once the call connects
pub const DEFAULT_GREETING: &str =
    "This is your Careline emergency assistant. I'm connected and listening. \
     Tell me what's happening.";

/// Transcript substituted for the caller when the pipeline fails
pub const FALLBACK_TRANSCRIPT: &str = "I need help. I'm not feeling well.";

/// Reply substituted for the assistant when the pipeline fails
pub const FALLBACK_REPLY: &str =
    "I hear you, and I'm staying on the line with you. Try to sit down, take \
     slow breaths, and unlock your door if you can. If your symptoms are \
     severe, call your local emergency number right away.";

const DEFAULT_CONNECT_DELAY_MS: u64 = 1500;
const DEFAULT_MAX_RECORDING_SECS: u64 = 120;

/// Tunable behavior for the call engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Simulated dial delay between Connecting and the greeting
    pub connect_delay: Duration,

    /// Assistant greeting appended and spoken on connect
    pub greeting: String,

    /// Caller-side text of the canned fallback pair
    pub fallback_transcript: String,

    /// Assistant-side text of the canned fallback pair
    pub fallback_reply: String,

    /// Recording length at which capture completes on its own
    pub max_recording: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_delay: Duration::from_millis(DEFAULT_CONNECT_DELAY_MS),
            greeting: DEFAULT_GREETING.to_string(),
            fallback_transcript: FALLBACK_TRANSCRIPT.to_string(),
            fallback_reply: FALLBACK_REPLY.to_string(),
            max_recording: Duration::from_secs(DEFAULT_MAX_RECORDING_SECS),
        }
    }
}

impl EngineConfig {
    /// Build the configuration from environment variables, falling back to
    /// the defaults for anything unset
    pub fn from_env() -> Self {
        Self {
            connect_delay: Duration::from_millis(env_u64(
                "CALL_CONNECT_DELAY_MS",
                DEFAULT_CONNECT_DELAY_MS,
            )),
            greeting: env_string("CALL_GREETING", DEFAULT_GREETING),
            fallback_transcript: env_string("CALL_FALLBACK_TRANSCRIPT", FALLBACK_TRANSCRIPT),
            fallback_reply: env_string("CALL_FALLBACK_REPLY", FALLBACK_REPLY),
            max_recording: Duration::from_secs(env_u64(
                "CALL_MAX_RECORDING_SECS",
                DEFAULT_MAX_RECORDING_SECS,
            )),
        }
    }
}

pub(crate) fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
