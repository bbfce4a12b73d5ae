//! Session configuration.
//!
//! [`SessionConfig`] holds the audio parameters fixed at session start (frame size,
//! capture/playback rates, channel count). [`LiveConfig`] adds the remote service
//! endpoint, credentials, model and voice, loaded from file and environment.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default Gemini Live BidiGenerateContent endpoint (API key appended as `?key=`).
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default native-audio model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Kore";

fn default_frame_size() -> usize {
    4096
}

fn default_capture_rate() -> u32 {
    16000
}

fn default_playback_rate() -> u32 {
    24000
}

fn default_channels() -> u16 {
    1
}

/// Audio parameters negotiated at session start. Immutable for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Samples per captured frame (default: 4096).
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    /// Rate of outbound audio sent to the service in Hz (default: 16000).
    #[serde(default = "default_capture_rate")]
    pub capture_sample_rate: u32,

    /// Rate of the playback timeline in Hz (default: 24000).
    #[serde(default = "default_playback_rate")]
    pub playback_sample_rate: u32,

    /// Channel count of the playback timeline (default: 1 for mono).
    #[serde(default = "default_channels")]
    pub channels: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_size: default_frame_size(),
            capture_sample_rate: default_capture_rate(),
            playback_sample_rate: default_playback_rate(),
            channels: default_channels(),
        }
    }
}

impl SessionConfig {
    /// Reject parameters the pipeline cannot honour.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.frame_size == 0 || self.frame_size > 65536 {
            return Err(VoiceError::Config(format!(
                "frame_size must be between 1 and 65536, got {}",
                self.frame_size
            )));
        }
        if self.capture_sample_rate == 0 || self.playback_sample_rate == 0 {
            return Err(VoiceError::Config(format!(
                "sample rates must be non-zero (capture {}, playback {})",
                self.capture_sample_rate, self.playback_sample_rate
            )));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(VoiceError::Config(format!(
                "channels must be 1 or 2, got {}",
                self.channels
            )));
        }
        Ok(())
    }

    /// Wall-clock length of one captured frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.capture_sample_rate as f64)
    }
}

/// Remote service settings plus the session audio parameters.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | PAGI_LIVE__ENDPOINT | Gemini BidiGenerateContent | WebSocket URL without the key |
/// | PAGI_LIVE__API_KEY (or GEMINI_API_KEY / API_KEY) | — | API key |
/// | PAGI_LIVE__MODEL | gemini-2.5-flash-native-audio-preview-09-2025 | Model id (without `models/`) |
/// | PAGI_LIVE__VOICE_NAME | Kore | Prebuilt voice |
/// | PAGI_LIVE__SESSION__FRAME_SIZE | 4096 | Samples per captured frame |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl LiveConfig {
    /// Load config from file and environment. Precedence: env `PAGI_LIVE__*` > file
    /// (`LIVE_CONFIG` path, default `config/live`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path = std::env::var("LIVE_CONFIG").unwrap_or_else(|_| "config/live".to_string());
        let session = SessionConfig::default();
        let builder = config::Config::builder()
            .set_default("endpoint", DEFAULT_ENDPOINT)?
            .set_default("model", DEFAULT_MODEL)?
            .set_default("voice_name", DEFAULT_VOICE)?
            .set_default("session.frame_size", session.frame_size as i64)?
            .set_default("session.capture_sample_rate", session.capture_sample_rate as i64)?
            .set_default("session.playback_sample_rate", session.playback_sample_rate as i64)?
            .set_default("session.channels", session.channels as i64)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PAGI_LIVE").separator("__"))
            .build()?;

        let mut live: LiveConfig = built.try_deserialize()?;
        if live.api_key.trim().is_empty() {
            live.api_key = env_api_key().unwrap_or_default();
        }
        live.session.validate()?;
        Ok(live)
    }

    /// Full WebSocket URL including the key query parameter.
    pub fn connect_url(&self) -> String {
        if self.api_key.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?key={}", self.endpoint.trim_end_matches('?'), self.api_key)
        }
    }

    /// Model resource name as the service expects it (`models/<id>`).
    pub fn model_resource(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

fn env_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_defaults() {
        let c = SessionConfig::default();
        assert_eq!(c.frame_size, 4096);
        assert_eq!(c.capture_sample_rate, 16000);
        assert_eq!(c.playback_sample_rate, 24000);
        assert_eq!(c.channels, 1);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_bad_parameters() {
        let zero_frame = SessionConfig {
            frame_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero_frame.validate(), Err(VoiceError::Config(_))));

        let surround = SessionConfig {
            channels: 6,
            ..Default::default()
        };
        assert!(surround.validate().is_err());
    }

    #[test]
    fn frame_duration_at_16k() {
        let c = SessionConfig::default();
        assert_eq!(c.frame_duration(), Duration::from_millis(256));
    }

    #[test]
    fn connect_url_appends_key() {
        let live = LiveConfig {
            api_key: "abc".into(),
            ..Default::default()
        };
        assert_eq!(live.connect_url(), format!("{}?key=abc", DEFAULT_ENDPOINT));
        assert_eq!(live.model_resource(), format!("models/{}", DEFAULT_MODEL));
    }
}
