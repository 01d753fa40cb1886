//! Emergency Call Demo — the full loop with optional production services.
//!
//! - **STT**: RemoteTranscriber if `STT_API_KEY` is set, else PlaceholderTranscriber.
//! - **Reasoning**: RemoteReasoner if `REASONING_API_KEY` is set, else PlaceholderReasoner.
//! - **Voice**: RemoteSynth if `TTS_API_KEY` is set, else PlaceholderSynth (silent).
//!
//! Press Enter to place the call and again to stop recording; type `q` to
//! hang up. Set API keys in `.env` for the real services.

use careline_voice::{
    AlwaysGranted, CallEngine, CaptureConfig, Collaborators, CpalCapture, EngineConfig,
    LocalSynthesizer, PlaceholderLocalSynth, PlaceholderReasoner, PlaceholderSynth,
    PlaceholderTranscriber, ReasoningClient, RemoteReasoner, RemoteSynth, RemoteTranscriber,
    SessionEvent, SpeechCapture, SpeechPlayback, SynthBackend, TranscriptionClient, VoicePlayback,
};
use careline_voice::timer::format_elapsed;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Emergency Call Demo — capture → transcription → reasoning → speech");
    info!("Enter: place call / stop recording. q: hang up.\n");

    let config = EngineConfig::from_env();

    let capture: Arc<dyn SpeechCapture> = Arc::new(CpalCapture::new(
        CaptureConfig {
            max_duration: config.max_recording,
            ..CaptureConfig::default()
        },
        Arc::new(AlwaysGranted),
    ));

    let transcriber: Arc<dyn TranscriptionClient> = match RemoteTranscriber::from_env() {
        Ok(t) => {
            info!("STT: using remote transcription.");
            Arc::new(t)
        }
        Err(e) => {
            info!("STT fallback to placeholder: {}", e);
            Arc::new(PlaceholderTranscriber::new())
        }
    };

    let reasoner: Arc<dyn ReasoningClient> = match RemoteReasoner::from_env() {
        Ok(r) => {
            info!("Reasoning: using remote chat service.");
            Arc::new(r)
        }
        Err(e) => {
            info!("Reasoning fallback to placeholder: {}", e);
            Arc::new(PlaceholderReasoner::new())
        }
    };

    let synth: Arc<dyn SynthBackend> = match RemoteSynth::from_env() {
        Ok(s) => {
            info!("Voice: using remote synthesis.");
            Arc::new(s)
        }
        Err(e) => {
            info!("Voice fallback to placeholder (silent): {}", e);
            Arc::new(PlaceholderSynth)
        }
    };
    let local: Arc<dyn LocalSynthesizer> = Arc::new(PlaceholderLocalSynth);
    let playback: Arc<dyn SpeechPlayback> = Arc::new(VoicePlayback::new(synth, local)?);

    let mut engine = CallEngine::new(
        config,
        Collaborators {
            capture,
            transcriber,
            reasoner,
            playback,
        },
    );

    let timer = engine.timer();
    let mut events = engine
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("event stream already taken"))?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged(state) => {
                    println!("[{}] state: {}", format_elapsed(timer.elapsed()), state.as_str());
                }
                SessionEvent::TurnAppended(turn) => {
                    println!(
                        "[{}] {:?} #{}: {}",
                        format_elapsed(timer.elapsed()),
                        turn.role,
                        turn.sequence,
                        turn.text
                    );
                }
                SessionEvent::SessionError(msg) => {
                    println!("!! session error: {}", msg);
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "q" => {
                engine.end_call()?;
                break;
            }
            _ => engine.primary_action()?,
        }
    }

    info!("Call ended. Goodbye.");
    Ok(())
}
