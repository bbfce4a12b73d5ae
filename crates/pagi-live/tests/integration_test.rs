//! Integration tests for the live session controller
//!
//! Everything runs against virtual devices and an in-process channel, except the
//! hardware test at the bottom which is ignored by default.

use async_trait::async_trait;
use pagi_live::{
    AudioBackend, Channel, ChannelConnector, ChannelEvent, ChannelEvents, CpalBackend,
    LiveConfig, LiveSession, MediaBlob, OutputDevice, SessionConfig, SessionState,
    VirtualBackend, VoiceError, VoiceResult, WireFrame,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

// -----------------------------------------------------------------------------
// In-process channel
// -----------------------------------------------------------------------------

#[derive(Default)]
struct FakeChannel {
    closed: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<WireFrame>>,
}

impl Channel for FakeChannel {
    fn send(&self, frame: &WireFrame) -> VoiceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Channel("closed".to_string()));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(VoiceError::Channel("socket reset".to_string()));
        }
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeRemote {
    opened: AtomicUsize,
    hold_open: AtomicBool,
    refuse: Mutex<Option<String>>,
    channel: Mutex<Option<Arc<FakeChannel>>>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

/// Connector whose remote side is driven by the test.
#[derive(Clone, Default)]
struct FakeConnector {
    remote: Arc<FakeRemote>,
}

impl FakeConnector {
    /// Do not signal `Open` on connect; the test does it (or never does).
    fn hold_open(&self) {
        self.remote.hold_open.store(true, Ordering::SeqCst);
    }

    fn refuse(&self, reason: &str) {
        *self.remote.refuse.lock().unwrap() = Some(reason.to_string());
    }

    fn opened(&self) -> usize {
        self.remote.opened.load(Ordering::SeqCst)
    }

    fn channel(&self) -> Arc<FakeChannel> {
        self.remote.channel.lock().unwrap().clone().expect("channel not opened")
    }

    fn emit(&self, event: ChannelEvent) {
        let events = self.remote.events.lock().unwrap();
        let _ = events.as_ref().expect("channel not opened").send(event);
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn open(&self, _config: &LiveConfig) -> VoiceResult<(Arc<dyn Channel>, ChannelEvents)> {
        if let Some(reason) = self.remote.refuse.lock().unwrap().clone() {
            return Err(VoiceError::ChannelOpenFailed(reason));
        }
        self.remote.opened.fetch_add(1, Ordering::SeqCst);

        let channel = Arc::new(FakeChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.remote.hold_open.load(Ordering::SeqCst) {
            let _ = tx.send(ChannelEvent::Open);
        }
        *self.remote.channel.lock().unwrap() = Some(Arc::clone(&channel));
        *self.remote.events.lock().unwrap() = Some(tx);
        Ok((channel, rx))
    }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(frame_size: usize) -> LiveConfig {
    LiveConfig {
        api_key: "test-key".to_string(),
        session: SessionConfig {
            frame_size,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn session(backend: &VirtualBackend, connector: &FakeConnector) -> LiveSession {
    LiveSession::new(config(4), Arc::new(backend.clone()), Arc::new(connector.clone()))
}

/// 100ms of 24kHz speech as the remote side would send it.
fn speech_chunk() -> MediaBlob {
    MediaBlob::from_wire(&WireFrame::from_samples(&vec![1000i16; 2400], 24000))
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn cause_of(state: &SessionState) -> Option<String> {
    match state {
        SessionState::Disconnected { cause } => cause.clone(),
        other => panic!("session not disconnected: {:?}", other),
    }
}

// -----------------------------------------------------------------------------
// Startup
// -----------------------------------------------------------------------------

#[tokio::test]
async fn denied_microphone_ends_session_without_opening_channel() {
    init_logging();
    let backend = VirtualBackend::new();
    backend.deny_input(true);
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);

    let result = session.start().await;
    assert!(matches!(result, Err(VoiceError::DeviceUnavailable(_))));

    let history = session.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0], SessionState::Idle);
    assert_eq!(history[1], SessionState::Connecting);
    assert!(history[2].is_terminal());
    assert!(cause_of(&session.state()).unwrap().contains("permission denied"));
    assert_eq!(connector.opened(), 0);
}

#[tokio::test]
async fn missing_speaker_releases_the_microphone() {
    let backend = VirtualBackend::new();
    backend.deny_output(true);
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);

    assert!(matches!(session.start().await, Err(VoiceError::DeviceUnavailable(_))));
    assert_eq!(backend.inputs_acquired(), 1);
    assert_eq!(backend.live_inputs(), 0);
    assert_eq!(connector.opened(), 0);
}

#[tokio::test]
async fn refused_channel_releases_devices() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    connector.refuse("401 unauthorized");
    let session = session(&backend, &connector);

    let result = session.start().await;
    assert!(matches!(result, Err(VoiceError::ChannelOpenFailed(_))));
    assert!(cause_of(&session.state()).unwrap().contains("401"));
    assert_eq!(backend.live_inputs(), 0);
    assert_eq!(backend.live_outputs(), 0);
}

#[tokio::test]
async fn channel_closing_before_open_fails_start() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    connector.hold_open();
    let session = Arc::new(session(&backend, &connector));

    let starting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.start().await })
    };
    eventually("channel open", || connector.opened() == 1).await;
    connector.emit(ChannelEvent::Closed {
        reason: Some("quota exceeded".to_string()),
    });

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(VoiceError::ChannelOpenFailed(_))));
    assert!(!connector.channel().is_open());
    assert_eq!(backend.live_inputs(), 0);
    assert_eq!(backend.live_outputs(), 0);
}

#[tokio::test]
async fn connected_session_streams_capture_frames() {
    init_logging();
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);

    assert_ok!(session.start().await);
    assert_eq!(session.state(), SessionState::Connected);

    let mic = backend.input_handle().unwrap();
    assert!(mic.is_streaming());
    mic.push(&[0.5; 10]);

    let sent = connector.channel().sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    for frame in &sent {
        assert_eq!(frame.sample_rate(), 16000);
        assert_eq!(frame.as_bytes().len(), 8);
        assert!(frame.samples().all(|s| s == 16384));
    }
    assert_eq!(session.stats().frames_sent, 2);

    assert_ok!(session.stop().await);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);

    assert_ok!(session.start().await);
    assert!(matches!(session.start().await, Err(VoiceError::SessionClosed)));
    assert_eq!(backend.inputs_acquired(), 1);
    assert_eq!(connector.opened(), 1);
    session.stop().await.unwrap();
}

// -----------------------------------------------------------------------------
// Playback
// -----------------------------------------------------------------------------

#[tokio::test]
async fn inbound_audio_plays_back_to_back_and_barge_in_flushes() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();
    let scheduler = session.scheduler().unwrap();

    for _ in 0..3 {
        connector.emit(ChannelEvent::Media(speech_chunk()));
    }
    eventually("three buffers scheduled", || scheduler.active_len() == 3).await;

    let active = scheduler.active_buffers();
    for pair in active.windows(2) {
        assert_eq!(pair[1].start_frame, pair[0].end_frame());
    }
    assert_eq!(active[2].end_frame() - active[0].start_frame, 7200);

    connector.emit(ChannelEvent::Interrupted);
    eventually("flush", || session.stats().interruptions == 1).await;
    assert_eq!(scheduler.active_len(), 0);
    assert_eq!(scheduler.schedule_clock(), None);
    assert_eq!(backend.output_timeline().unwrap().voice_count(), 0);

    // the next response starts fresh at device time
    connector.emit(ChannelEvent::Media(speech_chunk()));
    eventually("rescheduled", || scheduler.active_len() == 1).await;
    let now = backend.output_timeline().unwrap().current_frame();
    assert_eq!(scheduler.active_buffers()[0].start_frame, now);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_chunk_is_dropped_and_session_continues() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();
    let scheduler = session.scheduler().unwrap();

    connector.emit(ChannelEvent::Media(speech_chunk()));
    connector.emit(ChannelEvent::Media(MediaBlob {
        mime_type: "audio/pcm;rate=24000".to_string(),
        data: "!!!!".to_string(),
    }));
    connector.emit(ChannelEvent::Media(speech_chunk()));

    eventually("all chunks handled", || session.stats().frames_received == 3).await;
    assert_eq!(session.stats().frames_dropped, 1);
    assert_eq!(scheduler.active_len(), 2);
    let active = scheduler.active_buffers();
    assert_eq!(active[1].start_frame, active[0].end_frame());
    assert_eq!(session.state(), SessionState::Connected);

    session.stop().await.unwrap();
}

// -----------------------------------------------------------------------------
// Teardown
// -----------------------------------------------------------------------------

#[tokio::test]
async fn stop_is_idempotent_and_releases_everything() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();
    let mic = backend.input_handle().unwrap();

    assert_ok!(session.stop().await);
    assert_ok!(session.stop().await);

    assert_eq!(session.state(), SessionState::Disconnected { cause: None });
    assert!(!mic.is_streaming());
    assert_eq!(backend.live_inputs(), 0);
    assert_eq!(backend.live_outputs(), 0);
    assert!(!connector.channel().is_open());
    assert!(session.scheduler().is_none());

    let closing = session
        .history()
        .iter()
        .filter(|s| **s == SessionState::Closing)
        .count();
    assert_eq!(closing, 1);
    assert!(matches!(session.start().await, Err(VoiceError::SessionClosed)));
}

#[tokio::test]
async fn stop_waits_for_devices_without_blocking_the_runtime() {
    let backend = VirtualBackend::new();
    backend.set_release_delay(Duration::from_millis(50));
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();

    let observer = async {
        // runs while stop() is suspended on the closing devices
        (backend.live_inputs(), backend.live_outputs())
    };
    let (stopped, live_during_stop) = tokio::join!(session.stop(), observer);

    assert_ok!(stopped);
    assert_eq!(live_during_stop, (1, 1));
    assert_eq!(backend.live_inputs(), 0);
    assert_eq!(backend.live_outputs(), 0);
}

#[tokio::test]
async fn stop_before_start_completes() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    connector.hold_open();
    let session = Arc::new(session(&backend, &connector));

    let starting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.start().await })
    };
    eventually("channel open", || connector.opened() == 1).await;

    session.stop().await.unwrap();
    let result = starting.await.unwrap();
    assert!(matches!(result, Err(VoiceError::SessionClosed)));

    assert_eq!(session.state(), SessionState::Disconnected { cause: None });
    assert_eq!(backend.live_inputs(), 0);
    assert_eq!(backend.live_outputs(), 0);
    assert!(!connector.channel().is_open());

    // a late Open must not revive the session
    connector.emit(ChannelEvent::Open);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(session.state().is_terminal());
}

#[tokio::test]
async fn stop_on_idle_session() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);

    session.stop().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected { cause: None });
    assert!(matches!(session.start().await, Err(VoiceError::SessionClosed)));
    assert_eq!(backend.inputs_acquired(), 0);
}

#[tokio::test]
async fn channel_error_tears_down_with_cause() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();
    connector.emit(ChannelEvent::Media(speech_chunk()));

    connector.emit(ChannelEvent::Error("connection reset".to_string()));
    let state = tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
        .await
        .unwrap();

    assert!(cause_of(&state).unwrap().contains("connection reset"));
    assert_eq!(backend.live_inputs(), 0);
    assert_eq!(backend.live_outputs(), 0);
    assert!(!connector.channel().is_open());
    assert_eq!(backend.output_timeline().unwrap().voice_count(), 0);
}

#[tokio::test]
async fn remote_close_disconnects_cleanly() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();
    let mut states = session.subscribe();

    connector.emit(ChannelEvent::TurnComplete);
    connector.emit(ChannelEvent::Closed { reason: None });

    let state = tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| s.is_terminal()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(state, SessionState::Disconnected { cause: None });
    assert_eq!(backend.live_inputs(), 0);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn capture_racing_remote_close_is_not_a_fault() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();

    // the transport has already seen the close, the event is still in flight
    connector.channel().close();
    backend.input_handle().unwrap().push(&[0.2; 12]);
    connector.emit(ChannelEvent::Closed { reason: None });

    let state = tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
        .await
        .unwrap();
    assert_eq!(state, SessionState::Disconnected { cause: None });
    assert_eq!(session.stats().frames_sent, 0);
    assert_eq!(backend.live_inputs(), 0);
}

#[tokio::test]
async fn failing_send_is_fatal() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();

    connector.channel().fail_sends.store(true, Ordering::SeqCst);
    backend.input_handle().unwrap().push(&[0.1; 12]);

    let state = tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
        .await
        .unwrap();
    let cause = cause_of(&state).unwrap();
    assert!(cause.contains("capture"));
    assert!(cause.contains("socket reset"));
    assert_eq!(backend.live_inputs(), 0);
}

#[tokio::test]
async fn dropping_session_releases_devices() {
    let backend = VirtualBackend::new();
    let connector = FakeConnector::default();
    let session = session(&backend, &connector);
    session.start().await.unwrap();

    drop(session);
    assert_eq!(backend.live_inputs(), 0);
    assert_eq!(backend.live_outputs(), 0);
    assert!(!connector.channel().is_open());
}

// -----------------------------------------------------------------------------
// Hardware
// -----------------------------------------------------------------------------

#[tokio::test]
#[ignore] // Ignore by default since it requires audio hardware
async fn test_session_on_default_devices() {
    init_logging();

    let backend = CpalBackend::new();
    let connector = FakeConnector::default();
    let session = LiveSession::new(LiveConfig::default(), Arc::new(backend), Arc::new(connector.clone()));

    session.start().await.expect("Failed to start session");
    assert_eq!(session.state(), SessionState::Connected);

    // Let the microphone fill a few frames (4096 samples at 16kHz ≈ 256ms)
    tokio::time::sleep(Duration::from_millis(1000)).await;
    connector.emit(ChannelEvent::Media(speech_chunk()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    session.stop().await.expect("Failed to stop session");
    assert!(session.stats().frames_sent > 0);
    assert!(session.state().is_terminal());
}

#[tokio::test]
#[ignore] // Requires audio hardware
async fn test_acquire_default_output() {
    let backend = CpalBackend::new();
    let (faults, _rx) = mpsc::unbounded_channel();
    let mut output = backend
        .acquire_output(&SessionConfig::default(), faults)
        .await
        .expect("Failed to open output");
    assert_eq!(output.timeline().sample_rate(), 24000);
    output.release();
}
