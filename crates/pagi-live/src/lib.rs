//! # PAGI Live - Full-Duplex Voice Sessions
//!
//! Streams microphone audio to a remote voice service while playing back the audio it
//! returns, gap-free and in order, with immediate barge-in when the remote side signals
//! an interruption.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          LiveSession                              │
//! │  ┌──────────────┐  ┌──────────────┐  encode   ┌──────────────┐    │
//! │  │   Audio In   │→ │   Capture    │──────────→│              │    │
//! │  │    (cpal)    │  │  (4096/16k)  │           │   Channel    │    │
//! │  └──────────────┘  └──────────────┘           │ (Gemini Live │    │
//! │  ┌──────────────┐  ┌──────────────┐  decode   │  WebSocket)  │    │
//! │  │  Audio Out   │← │   Playback   │←──────────│              │    │
//! │  │   (rodio)    │  │  Scheduler   │ Interrupt └──────────────┘    │
//! │  └──────────────┘  └──────────────┘   flush                       │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod channel;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod gemini;
pub mod playback;
pub mod session;
pub mod timeline;

pub use capture::{CapturePipeline, FrameSlicer};
pub use channel::{Channel, ChannelConnector, ChannelEvent, ChannelEvents};
pub use codec::{decode, encode, AudioFrame, MediaBlob, PlaybackBuffer, WireFrame};
pub use config::{LiveConfig, SessionConfig};
pub use device::{
    AudioBackend, CpalBackend, DeviceFault, FaultSender, InputDevice, OutputDevice, ReleaseWait,
    VirtualBackend, VirtualInputHandle, VirtualOutput,
};
pub use error::{VoiceError, VoiceResult};
pub use gemini::GeminiConnector;
pub use playback::{PlaybackScheduler, ScheduledBuffer};
pub use session::{LiveSession, SessionState, SessionStats};
pub use timeline::{BufferId, Timeline};
