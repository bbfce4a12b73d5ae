//! Live session controller — the only component with external visibility.
//!
//! ```text
//! Idle ──start──▶ Connecting ──Open──▶ Connected ──stop / close / error / fault──▶ Closing ──▶ Disconnected
//!                     │                                                                ▲
//!                     └──────── device or channel failure, stop ──────────────────────┘
//! ```
//!
//! The controller is the sole owner of the microphone, the speaker and the channel. It
//! lends the devices to the capture pipeline and the playback scheduler and tears
//! everything down exactly once, whichever path triggers it.

use crate::capture::CapturePipeline;
use crate::channel::{Channel, ChannelConnector, ChannelEvent, ChannelEvents};
use crate::codec::{self, AudioFrame, MediaBlob};
use crate::config::LiveConfig;
use crate::device::{
    AudioBackend, CpalBackend, DeviceFault, FaultSender, InputDevice, OutputDevice, ReleaseWait,
};
use crate::error::{VoiceError, VoiceResult};
use crate::gemini::GeminiConnector;
use crate::playback::PlaybackScheduler;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    /// Terminal. `cause` is set when the session ended because of an error.
    Disconnected { cause: Option<String> },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Disconnected { .. } => "disconnected",
        }
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Captured frames handed to the channel.
    pub frames_sent: u64,
    /// Inbound audio chunks received.
    pub frames_received: u64,
    /// Inbound chunks dropped because they could not be decoded.
    pub frames_dropped: u64,
    /// Barge-in signals handled.
    pub interruptions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    interruptions: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

/// Everything the session has acquired. Devices move from the bare slots into the
/// capture pipeline / scheduler once the channel opens.
#[derive(Default)]
struct Resources {
    input: Option<Box<dyn InputDevice>>,
    output: Option<Box<dyn OutputDevice>>,
    capture: Option<CapturePipeline>,
    scheduler: Option<Arc<PlaybackScheduler>>,
    channel: Option<Arc<dyn Channel>>,
}

struct Shared {
    config: LiveConfig,
    state_tx: watch::Sender<SessionState>,
    history: Mutex<Vec<SessionState>>,
    stop_tx: watch::Sender<bool>,
    resources: Mutex<Resources>,
    torn_down: AtomicBool,
    counters: Arc<Counters>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        debug!(state = state.name(), "session state");
        lock(&self.history).push(state.clone());
        self.state_tx.send_replace(state);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Hand an acquired resource to the session. Refused (value returned) once teardown
    /// has started, so the caller releases it instead of leaking it.
    fn adopt<T>(&self, value: T, put: impl FnOnce(&mut Resources, T)) -> Result<(), T> {
        let mut resources = lock(&self.resources);
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(value);
        }
        put(&mut resources, value);
        Ok(())
    }

    /// Stop capture, shut down playback, release both devices, close the channel.
    /// Runs once; later calls return immediately. A failed start skips `Closing` and
    /// lands directly in `Disconnected`. Never blocks: devices that close on their own
    /// thread hand back a wait for async callers.
    fn teardown(&self, cause: Option<String>, announce_closing: bool) -> Vec<ReleaseWait> {
        let taken = {
            let mut resources = lock(&self.resources);
            if self.torn_down.swap(true, Ordering::SeqCst) {
                return Vec::new();
            }
            std::mem::take(&mut *resources)
        };
        self.stop_tx.send_replace(true);
        if announce_closing {
            self.set_state(SessionState::Closing);
        }
        info!("🛑 Closing live session");

        let Resources {
            input,
            output,
            capture,
            scheduler,
            channel,
        } = taken;

        let mut waits = Vec::new();
        if let Some(mut capture) = capture {
            waits.extend(capture.stop());
        }
        if let Some(scheduler) = scheduler {
            waits.extend(scheduler.shutdown());
        }
        if let Some(mut output) = output {
            waits.extend(output.release());
        }
        if let Some(mut input) = input {
            waits.extend(input.release());
        }
        if let Some(channel) = channel {
            channel.close();
        }

        match &cause {
            Some(cause) => error!("Live session ended: {}", cause),
            None => info!("✅ Live session closed"),
        }
        self.set_state(SessionState::Disconnected { cause });
        waits
    }
}

/// Suspend until every released device has closed its stream.
async fn devices_closed(waits: Vec<ReleaseWait>) {
    for wait in waits {
        let _ = wait.await;
    }
}

/// One full-duplex voice conversation. Not reusable: build a new one to reconnect.
pub struct LiveSession {
    shared: Arc<Shared>,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn ChannelConnector>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl LiveSession {
    pub fn new(
        config: LiveConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                state_tx,
                history: Mutex::new(vec![SessionState::Idle]),
                stop_tx,
                resources: Mutex::new(Resources::default()),
                torn_down: AtomicBool::new(false),
                counters: Arc::new(Counters::default()),
            }),
            backend,
            connector,
            event_loop: Mutex::new(None),
        }
    }

    /// Session on the default microphone and speaker, talking to Gemini Live.
    pub fn gemini(config: LiveConfig) -> Self {
        Self::new(config, Arc::new(CpalBackend::new()), Arc::new(GeminiConnector::new()))
    }

    pub fn config(&self) -> &LiveConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Every state the session has been in, oldest first.
    pub fn history(&self) -> Vec<SessionState> {
        lock(&self.shared.history).clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// The playback scheduler, once connected.
    pub fn scheduler(&self) -> Option<Arc<PlaybackScheduler>> {
        lock(&self.shared.resources).scheduler.clone()
    }

    /// Acquire devices, open the channel and wait for it to come up.
    ///
    /// On failure the session ends in `Disconnected` with the cause and every resource
    /// acquired so far is released.
    pub async fn start(&self) -> VoiceResult<()> {
        let mut began = false;
        self.shared.state_tx.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Connecting;
                began = true;
            }
            began
        });
        if !began {
            return Err(VoiceError::SessionClosed);
        }
        lock(&self.shared.history).push(SessionState::Connecting);
        info!("🚀 Starting live session ({})", self.shared.config.model);

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        match self.connect(fault_tx).await {
            Ok((scheduler, events)) => {
                let shared = Arc::clone(&self.shared);
                let stop_rx = self.shared.stop_tx.subscribe();
                let handle = tokio::spawn(run_event_loop(shared, scheduler, events, fault_rx, stop_rx));
                *lock(&self.event_loop) = Some(handle);
                Ok(())
            }
            Err(e) => {
                let cause = match e {
                    VoiceError::SessionClosed => None,
                    ref other => Some(other.to_string()),
                };
                devices_closed(self.shared.teardown(cause, false)).await;
                Err(e)
            }
        }
    }

    /// End the session. Idempotent, and safe while `start` is still connecting.
    pub async fn stop(&self) -> VoiceResult<()> {
        self.shared.stop_tx.send_replace(true);
        devices_closed(self.shared.teardown(None, true)).await;
        let handle = lock(&self.event_loop).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Resolve once the session has reached `Disconnected`.
    pub async fn wait_closed(&self) -> SessionState {
        let mut rx = self.shared.state_tx.subscribe();
        let result = match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        result
    }

    async fn until_stopped<T>(&self, fut: impl Future<Output = VoiceResult<T>>) -> VoiceResult<T> {
        let mut stop_rx = self.shared.stop_tx.subscribe();
        tokio::select! {
            result = fut => result,
            _ = stop_rx.wait_for(|stopped| *stopped) => Err(VoiceError::SessionClosed),
        }
    }

    async fn connect(&self, faults: FaultSender) -> VoiceResult<(Arc<PlaybackScheduler>, ChannelEvents)> {
        let shared = &self.shared;
        let session_config = shared.config.session;
        session_config.validate()?;
        if shared.stop_requested() {
            return Err(VoiceError::SessionClosed);
        }

        let input = self
            .until_stopped(self.backend.acquire_input(&session_config, faults.clone()))
            .await?;
        shared
            .adopt(input, |r, d| r.input = Some(d))
            .map_err(|mut d| {
                let _ = d.release();
                VoiceError::SessionClosed
            })?;

        let output = self
            .until_stopped(self.backend.acquire_output(&session_config, faults.clone()))
            .await?;
        shared
            .adopt(output, |r, d| r.output = Some(d))
            .map_err(|mut d| {
                let _ = d.release();
                VoiceError::SessionClosed
            })?;

        let (channel, mut events) = self
            .until_stopped(self.connector.open(&shared.config))
            .await
            .map_err(|e| match e {
                VoiceError::ChannelOpenFailed(_) | VoiceError::SessionClosed => e,
                other => VoiceError::ChannelOpenFailed(other.to_string()),
            })?;
        shared
            .adopt(Arc::clone(&channel), |r, c| r.channel = Some(c))
            .map_err(|c| {
                c.close();
                VoiceError::SessionClosed
            })?;

        self.until_stopped(wait_for_open(&mut events)).await?;

        let scheduler = {
            let mut resources = lock(&shared.resources);
            if shared.torn_down.load(Ordering::SeqCst) {
                return Err(VoiceError::SessionClosed);
            }
            let (Some(input), Some(output)) = (resources.input.take(), resources.output.take()) else {
                return Err(VoiceError::SessionClosed);
            };

            let scheduler = Arc::new(PlaybackScheduler::new(output));
            resources.scheduler = Some(Arc::clone(&scheduler));

            let mut capture = CapturePipeline::new(input, session_config);
            let started = capture.start(outbound_sink(
                Arc::clone(&channel),
                Arc::clone(&shared.counters),
                faults,
            ));
            resources.capture = Some(capture);
            started?;
            shared.set_state(SessionState::Connected);
            scheduler
        };

        info!("✅ Live session connected");
        Ok((scheduler, events))
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let _ = self.shared.teardown(None, true);
    }
}

async fn wait_for_open(events: &mut ChannelEvents) -> VoiceResult<()> {
    loop {
        match events.recv().await {
            Some(ChannelEvent::Open) => return Ok(()),
            Some(ChannelEvent::Closed { reason }) => {
                return Err(VoiceError::ChannelOpenFailed(
                    reason.unwrap_or_else(|| "closed before the session opened".to_string()),
                ))
            }
            Some(ChannelEvent::Error(e)) => return Err(VoiceError::ChannelOpenFailed(e)),
            Some(other) => debug!("ignoring {:?} before open", other),
            None => {
                return Err(VoiceError::ChannelOpenFailed(
                    "channel dropped before opening".to_string(),
                ))
            }
        }
    }
}

/// Capture sink: encode and hand to the channel without waiting. The first send failure
/// on an open channel is reported as a fault; later ones, and sends racing a remote
/// close, are dropped silently (the close arrives as a channel event).
fn outbound_sink(
    channel: Arc<dyn Channel>,
    counters: Arc<Counters>,
    faults: FaultSender,
) -> impl FnMut(AudioFrame) + Send + 'static {
    let mut reported = false;
    move |frame: AudioFrame| {
        let wire = codec::encode(&frame);
        match channel.send(&wire) {
            Ok(()) => {
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) if !channel.is_open() => {}
            Err(e) if !reported => {
                reported = true;
                let _ = faults.send(DeviceFault {
                    device: "capture",
                    message: e.to_string(),
                });
            }
            Err(_) => {}
        }
    }
}

fn handle_media(shared: &Shared, scheduler: &PlaybackScheduler, blob: &MediaBlob) {
    let counters = &shared.counters;
    counters.frames_received.fetch_add(1, Ordering::Relaxed);
    let playback_rate = shared.config.session.playback_sample_rate;
    match blob.to_wire(playback_rate).and_then(|wire| scheduler.enqueue(&wire)) {
        Ok(_) => {}
        Err(VoiceError::Decode(e)) => {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping malformed audio frame: {}", e);
        }
        Err(VoiceError::SessionClosed) => debug!("audio arrived after playback shut down"),
        Err(e) => warn!("Failed to schedule audio: {}", e),
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    scheduler: Arc<PlaybackScheduler>,
    mut events: ChannelEvents,
    mut faults: mpsc::UnboundedReceiver<DeviceFault>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let cause = loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(ChannelEvent::Media(blob)) => handle_media(&shared, &scheduler, &blob),
                Some(ChannelEvent::Interrupted) => {
                    let stopped = scheduler.flush();
                    shared.counters.interruptions.fetch_add(1, Ordering::Relaxed);
                    info!("⚡ Interrupted: discarded {} queued buffers", stopped);
                }
                Some(ChannelEvent::TurnComplete) => debug!("remote turn complete"),
                Some(ChannelEvent::Open) => debug!("duplicate open signal"),
                Some(ChannelEvent::Closed { reason }) => {
                    info!("Channel closed by remote");
                    break reason.map(|r| format!("channel closed: {}", r));
                }
                Some(ChannelEvent::Error(e)) => break Some(format!("channel error: {}", e)),
                None => break Some("channel dropped".to_string()),
            },
            Some(fault) = faults.recv() => {
                break Some(format!("{} fault: {}", fault.device, fault.message));
            }
            _ = stop_rx.wait_for(|stopped| *stopped) => break None,
        }
    };
    devices_closed(shared.teardown(cause, true)).await;
}
