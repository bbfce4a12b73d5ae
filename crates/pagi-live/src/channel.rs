//! Bidirectional message channel to the remote voice service.
//!
//! The session controller only sees this interface, so it can run against the
//! Gemini Live WebSocket ([`crate::gemini::GeminiConnector`]) or a fake.

use crate::codec::{MediaBlob, WireFrame};
use crate::config::LiveConfig;
use crate::error::VoiceResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle and data signals delivered by an open channel, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The remote side is ready to stream.
    Open,
    /// One chunk of synthesized speech.
    Media(MediaBlob),
    /// Queued speech must be discarded (barge-in).
    Interrupted,
    /// The remote side finished its turn.
    TurnComplete,
    /// The channel closed; no further events follow.
    Closed { reason: Option<String> },
    /// Transport failure; no further events follow.
    Error(String),
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Outbound half of an open channel.
pub trait Channel: Send + Sync {
    /// Queue a frame for sending. Never blocks; safe to call from the capture callback.
    fn send(&self, frame: &WireFrame) -> VoiceResult<()>;

    /// Close the channel. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens channels to the remote service.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Establish the transport. The returned receiver yields [`ChannelEvent::Open`] once the
    /// remote side accepts the session.
    async fn open(&self, config: &LiveConfig) -> VoiceResult<(Arc<dyn Channel>, ChannelEvents)>;
}
