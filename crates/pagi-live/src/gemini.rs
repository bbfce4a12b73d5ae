//! Gemini Live channel over WebSocket (BidiGenerateContent).
//!
//! Client → server: one `setup` message, then `realtimeInput.mediaChunks` per captured
//! frame. Server → client: `setupComplete`, then `serverContent` carrying inline audio,
//! `interrupted` and `turnComplete`. Server JSON may arrive as text or binary frames.

use crate::channel::{Channel, ChannelConnector, ChannelEvent, ChannelEvents};
use crate::codec::{MediaBlob, WireFrame};
use crate::config::LiveConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// -----------------------------------------------------------------------------
// Client messages
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SetupMessage {
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            setup: Setup {
                model: config.model_resource(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice_name.clone(),
                            },
                        },
                    },
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaBlob>,
}

impl RealtimeInputMessage {
    pub fn audio(frame: &WireFrame) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaBlob::from_wire(frame)],
            },
        }
    }
}

// -----------------------------------------------------------------------------
// Server messages
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<MediaBlob>,
}

impl ServerMessage {
    /// Channel events carried by this message, in the order they must be handled:
    /// audio first, then interruption, then turn completion.
    pub fn into_events(self) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        if self.setup_complete.is_some() {
            events.push(ChannelEvent::Open);
        }
        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                events.extend(
                    turn.parts
                        .into_iter()
                        .filter_map(|p| p.inline_data)
                        .map(ChannelEvent::Media),
                );
            }
            if content.interrupted {
                events.push(ChannelEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ChannelEvent::TurnComplete);
            }
        }
        if self.go_away.is_some() {
            debug!("server announced go-away");
        }
        events
    }
}

/// Parse one server frame into events.
pub fn parse_server_frame(bytes: &[u8]) -> VoiceResult<Vec<ChannelEvent>> {
    let message: ServerMessage = serde_json::from_slice(bytes)?;
    Ok(message.into_events())
}

// -----------------------------------------------------------------------------
// Channel
// -----------------------------------------------------------------------------

enum Outbound {
    Audio(WireFrame),
    Close,
}

/// Outbound half of a Gemini Live WebSocket.
pub struct GeminiChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl Channel for GeminiChannel {
    fn send(&self, frame: &WireFrame) -> VoiceResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(VoiceError::Channel("channel is closed".to_string()));
        }
        self.outbound
            .send(Outbound::Audio(frame.clone()))
            .map_err(|_| VoiceError::Channel("writer task has exited".to_string()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
            info!("🔌 Gemini Live channel closing");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Connects to the Gemini Live API.
#[derive(Debug, Clone, Default)]
pub struct GeminiConnector;

impl GeminiConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelConnector for GeminiConnector {
    async fn open(&self, config: &LiveConfig) -> VoiceResult<(Arc<dyn Channel>, ChannelEvents)> {
        if config.api_key.trim().is_empty() {
            return Err(VoiceError::ChannelOpenFailed(
                "no API key configured (PAGI_LIVE__API_KEY or GEMINI_API_KEY)".to_string(),
            ));
        }

        info!("🌐 Connecting to Gemini Live ({})", config.model);
        let (socket, _response) = tokio_tungstenite::connect_async(config.connect_url())
            .await
            .map_err(|e| VoiceError::ChannelOpenFailed(e.to_string()))?;
        let (mut write, mut read) = socket.split();

        let setup = serde_json::to_string(&SetupMessage::from_config(config))
            .map_err(|e| VoiceError::ChannelOpenFailed(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| VoiceError::ChannelOpenFailed(e.to_string()))?;

        let open = Arc::new(AtomicBool::new(true));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ChannelEvent>();

        // Writer: drains the outbound queue so `send` never waits on the socket.
        let writer_events = event_tx.clone();
        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(item) = out_rx.recv().await {
                let result = match item {
                    Outbound::Audio(frame) => {
                        match serde_json::to_string(&RealtimeInputMessage::audio(&frame)) {
                            Ok(json) => write.send(Message::Text(json)).await,
                            Err(e) => {
                                warn!("Failed to encode realtime input: {}", e);
                                continue;
                            }
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    if writer_open.swap(false, Ordering::SeqCst) {
                        let _ = writer_events.send(ChannelEvent::Error(e.to_string()));
                    }
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Gemini Live writer finished");
        });

        // Reader: turns server frames into channel events.
        let reader_open = Arc::clone(&open);
        tokio::spawn(async move {
            let terminal = loop {
                let Some(frame) = read.next().await else {
                    break ChannelEvent::Closed { reason: None };
                };
                let bytes = match frame {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Close(close)) => {
                        break ChannelEvent::Closed {
                            reason: close
                                .map(|c| format!("{} {}", c.code, c.reason))
                                .filter(|r| !r.trim().is_empty()),
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => break ChannelEvent::Error(e.to_string()),
                };
                match parse_server_frame(&bytes) {
                    Ok(events) => {
                        for event in events {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Ignoring unparsable server message: {}", e),
                }
            };
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(terminal);
            debug!("Gemini Live reader finished");
        });

        Ok((
            Arc::new(GeminiChannel {
                outbound: out_tx,
                open,
            }) as Arc<dyn Channel>,
            event_rx,
        ))
    }
}
