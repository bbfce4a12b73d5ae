//! Live Conversation Demo — talk to Gemini Live through the default microphone and speaker.
//!
//! Set `GEMINI_API_KEY` (or `PAGI_LIVE__API_KEY`) in `.env`. Other settings come from
//! `config/live.toml` or `PAGI_LIVE__*` variables, see [`pagi_live::LiveConfig`].
//!
//! Press Ctrl+C to stop.

use pagi_live::{CpalBackend, LiveConfig, LiveSession, SessionState};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pagi_live=debug")),
        )
        .init();

    let config = LiveConfig::load()?;
    info!("🎙️ PAGI Live Conversation ({} / voice {})", config.model, config.voice_name);
    info!("Press Ctrl+C to stop.");

    match CpalBackend::input_device_names() {
        Ok(names) if !names.is_empty() => info!("🎤 Microphones: {}", names.join(", ")),
        Ok(_) => warn!("No microphones found"),
        Err(e) => warn!("Could not list microphones: {}", e),
    }

    let session = LiveSession::gemini(config);
    let mut states = session.subscribe();
    session.start().await?;
    info!("✅ Connected. Start talking!");

    let mut stats_tick = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, hanging up");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if let SessionState::Disconnected { cause } = state {
                    if let Some(cause) = cause {
                        warn!("Session ended: {}", cause);
                    }
                    break;
                }
            }
            _ = stats_tick.tick() => {
                let stats = session.stats();
                info!(
                    "📊 sent {} frames, received {} ({} dropped), {} interruptions",
                    stats.frames_sent, stats.frames_received, stats.frames_dropped, stats.interruptions
                );
            }
        }
    }

    session.stop().await?;
    info!("👋 Goodbye");
    Ok(())
}
