//! Audio device acquisition.
//!
//! The session controller acquires devices through an [`AudioBackend`] and lends them to
//! the capture pipeline and the playback scheduler. Two backends ship here:
//!
//! - [`CpalBackend`]: microphone via CPAL, speaker via Rodio. `cpal::Stream` and
//!   `rodio::OutputStream` are `!Send` on some platforms, so each lives on its own thread
//!   and the handle returned to the caller only holds the means to stop it. Releasing
//!   never blocks: the device thread drops its stream and then fires a [`ReleaseWait`].
//! - [`VirtualBackend`]: no hardware. Input is pushed by hand and the output timeline is
//!   advanced by whoever holds it (headless runs, tests).

use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::timeline::Timeline;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use rodio::{OutputStream, Source};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Receives interleaved f32 samples at the device's native rate, on the device thread.
pub type InputCallback = Box<dyn FnMut(&[f32]) + Send>;

type CallbackSlot = Arc<Mutex<Option<InputCallback>>>;

/// Error raised inside an audio callback, funnelled to the session controller.
#[derive(Debug, Clone)]
pub struct DeviceFault {
    pub device: &'static str,
    pub message: String,
}

pub type FaultSender = mpsc::UnboundedSender<DeviceFault>;

/// Resolves once a released device has actually closed its stream.
pub type ReleaseWait = oneshot::Receiver<()>;

/// An acquired microphone.
pub trait InputDevice: Send {
    fn name(&self) -> &str;

    /// Native rate of the samples handed to the callback.
    fn sample_rate(&self) -> u32;

    /// Interleaved channel count of the samples handed to the callback.
    fn channels(&self) -> u16;

    /// Route device data to `callback`, replacing any previous one.
    fn open_stream(&mut self, callback: InputCallback) -> VoiceResult<()>;

    /// Detach the callback. No invocation is in flight or will start after return.
    fn close_stream(&mut self);

    /// Release the device without blocking. Idempotent. Returns a wait handle when the
    /// device shuts down on another thread; only the first call returns one.
    fn release(&mut self) -> Option<ReleaseWait>;
}

/// An acquired speaker, rendering a [`Timeline`].
pub trait OutputDevice: Send {
    fn name(&self) -> &str;

    fn timeline(&self) -> &Timeline;

    /// Release the device without blocking. Idempotent. See [`InputDevice::release`].
    fn release(&mut self) -> Option<ReleaseWait>;
}

/// Source of input and output devices.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn acquire_input(
        &self,
        config: &SessionConfig,
        faults: FaultSender,
    ) -> VoiceResult<Box<dyn InputDevice>>;

    async fn acquire_output(
        &self,
        config: &SessionConfig,
        faults: FaultSender,
    ) -> VoiceResult<Box<dyn OutputDevice>>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn deliver(slot: &CallbackSlot, samples: &[f32]) {
    if let Some(callback) = lock(slot).as_mut() {
        callback(samples);
    }
}

// -----------------------------------------------------------------------------
// CPAL / Rodio
// -----------------------------------------------------------------------------

/// Default host devices: CPAL microphone, Rodio speaker.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    /// Names of the host's microphones, the one a session would pick first.
    pub fn input_device_names() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let default = host.default_input_device().and_then(|d| d.name().ok());
        let names = host.input_devices()?.filter_map(|d| d.name().ok()).collect();
        Ok(default_first(names, default.as_deref()))
    }
}

fn default_first(mut names: Vec<String>, default: Option<&str>) -> Vec<String> {
    if let Some(pos) = default.and_then(|d| names.iter().position(|n| n == d)) {
        let name = names.remove(pos);
        names.insert(0, name);
    }
    names
}

struct InputFormat {
    name: String,
    sample_rate: u32,
    channels: u16,
}

/// Handle to a microphone stream running on its own thread.
pub struct CpalInput {
    format: InputFormat,
    slot: CallbackSlot,
    stop_tx: Option<std_mpsc::Sender<()>>,
    closed_rx: Option<ReleaseWait>,
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    slot: CallbackSlot,
    faults: FaultSender,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
            deliver(&slot, &scratch);
        },
        move |err| {
            warn!("Audio input stream error: {}", err);
            let _ = faults.send(DeviceFault {
                device: "input",
                message: err.to_string(),
            });
        },
        None, // No timeout
    )
}

fn open_default_input(slot: CallbackSlot, faults: FaultSender) -> VoiceResult<(Stream, InputFormat)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("📱 Using input device: {}", name);

    let supported = device.default_input_config()?;
    debug!("🔧 Default input config: {:?}", supported);

    let config: StreamConfig = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, slot, faults)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, slot, faults)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, slot, faults)?,
        other => {
            return Err(VoiceError::DeviceUnavailable(format!(
                "Unsupported input sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;

    Ok((
        stream,
        InputFormat {
            name,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        },
    ))
}

impl InputDevice for CpalInput {
    fn name(&self) -> &str {
        &self.format.name
    }

    fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    fn channels(&self) -> u16 {
        self.format.channels
    }

    fn open_stream(&mut self, callback: InputCallback) -> VoiceResult<()> {
        if self.stop_tx.is_none() {
            return Err(VoiceError::SessionClosed);
        }
        *lock(&self.slot) = Some(callback);
        Ok(())
    }

    fn close_stream(&mut self) {
        lock(&self.slot).take();
    }

    fn release(&mut self) -> Option<ReleaseWait> {
        self.close_stream();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.closed_rx.take()
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Infinite Rodio source pulling blocks from the timeline.
struct TimelineSource {
    timeline: Timeline,
    block: Vec<f32>,
    index: usize,
}

impl TimelineSource {
    fn new(timeline: Timeline) -> Self {
        // 10ms blocks keep the device clock close to what is audible
        let frames = (timeline.sample_rate() / 100).max(1) as usize;
        let len = frames * timeline.channels() as usize;
        Self {
            timeline,
            block: vec![0.0; len],
            index: len,
        }
    }
}

impl Iterator for TimelineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.index >= self.block.len() {
            self.timeline.render(&mut self.block);
            self.index = 0;
        }
        let sample = self.block[self.index];
        self.index += 1;
        Some(sample)
    }
}

impl Source for TimelineSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.timeline.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.timeline.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Handle to a Rodio output stream running on its own thread.
pub struct RodioOutput {
    timeline: Timeline,
    stop_tx: Option<std_mpsc::Sender<()>>,
    closed_rx: Option<ReleaseWait>,
}

impl OutputDevice for RodioOutput {
    fn name(&self) -> &str {
        "default output"
    }

    fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    fn release(&mut self) -> Option<ReleaseWait> {
        self.timeline.stop_all();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.closed_rx.take()
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn device_unavailable<T>(_: T) -> VoiceError {
    VoiceError::DeviceUnavailable("audio device thread exited during acquisition".to_string())
}

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn acquire_input(
        &self,
        config: &SessionConfig,
        faults: FaultSender,
    ) -> VoiceResult<Box<dyn InputDevice>> {
        info!("🎤 Acquiring microphone (capture at {}Hz)", config.capture_sample_rate);

        let slot: CallbackSlot = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<InputFormat>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        let thread_slot = Arc::clone(&slot);

        // Detached: the thread parks until released and reports back through `closed_tx`.
        thread::Builder::new()
            .name("pagi-live-input".to_string())
            .spawn(move || match open_default_input(thread_slot, faults) {
                Ok((stream, format)) => {
                    let _ = ready_tx.send(Ok(format));
                    // Park until released; dropping the stream stops capture.
                    let _ = stop_rx.recv();
                    drop(stream);
                    info!("🎤 Input device released");
                    let _ = closed_tx.send(());
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let format = ready_rx.await.map_err(device_unavailable)??;
        info!(
            "✅ Microphone ready: {} ({}Hz, {} channels)",
            format.name, format.sample_rate, format.channels
        );

        Ok(Box::new(CpalInput {
            format,
            slot,
            stop_tx: Some(stop_tx),
            closed_rx: Some(closed_rx),
        }))
    }

    async fn acquire_output(
        &self,
        config: &SessionConfig,
        _faults: FaultSender,
    ) -> VoiceResult<Box<dyn OutputDevice>> {
        info!("🔊 Initializing audio playback ({}Hz timeline)", config.playback_sample_rate);

        let timeline = Timeline::new(config.playback_sample_rate, config.channels);
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        let source_timeline = timeline.clone();

        thread::Builder::new()
            .name("pagi-live-output".to_string())
            .spawn(move || {
                let opened = OutputStream::try_default()
                    .map_err(VoiceError::from)
                    .and_then(|(stream, handle)| {
                        handle.play_raw(TimelineSource::new(source_timeline))?;
                        Ok(stream)
                    });
                match opened {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                        info!("🔊 Output device released");
                        let _ = closed_tx.send(());
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        ready_rx.await.map_err(device_unavailable)??;
        info!("✅ Audio playback initialized");

        Ok(Box::new(RodioOutput {
            timeline,
            stop_tx: Some(stop_tx),
            closed_rx: Some(closed_rx),
        }))
    }
}

// -----------------------------------------------------------------------------
// Virtual devices
// -----------------------------------------------------------------------------

#[derive(Default)]
struct VirtualState {
    deny_input: AtomicBool,
    deny_output: AtomicBool,
    input_format: Mutex<Option<(u32, u16)>>,
    inputs_acquired: AtomicUsize,
    outputs_acquired: AtomicUsize,
    inputs_live: AtomicUsize,
    outputs_live: AtomicUsize,
    last_input: Mutex<Option<CallbackSlot>>,
    last_output: Mutex<Option<Timeline>>,
    release_delay: Mutex<Duration>,
}

impl VirtualState {
    /// Mark one device released, either now or after the configured delay on a helper
    /// thread, the way a hardware stream winds down.
    fn finish_release(self: &Arc<Self>, live: fn(&VirtualState) -> &AtomicUsize) -> Option<ReleaseWait> {
        let delay = *lock(&self.release_delay);
        if delay.is_zero() {
            live(self).fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        let (closed_tx, closed_rx) = oneshot::channel();
        let state = Arc::clone(self);
        thread::spawn(move || {
            thread::sleep(delay);
            live(&state).fetch_sub(1, Ordering::SeqCst);
            let _ = closed_tx.send(());
        });
        Some(closed_rx)
    }
}

/// Hardware-free backend. Input samples are pushed through [`VirtualInputHandle`]; the
/// output timeline only advances when rendered by hand.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    state: Arc<VirtualState>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make input acquisition fail as if microphone permission was denied.
    pub fn deny_input(&self, deny: bool) {
        self.state.deny_input.store(deny, Ordering::SeqCst);
    }

    pub fn deny_output(&self, deny: bool) {
        self.state.deny_output.store(deny, Ordering::SeqCst);
    }

    /// Native format reported by virtual microphones (default: capture rate, mono).
    pub fn set_input_format(&self, sample_rate: u32, channels: u16) {
        *lock(&self.state.input_format) = Some((sample_rate, channels));
    }

    /// Make released devices take `delay` to close, reporting through a [`ReleaseWait`].
    pub fn set_release_delay(&self, delay: Duration) {
        *lock(&self.state.release_delay) = delay;
    }

    pub fn inputs_acquired(&self) -> usize {
        self.state.inputs_acquired.load(Ordering::SeqCst)
    }

    pub fn outputs_acquired(&self) -> usize {
        self.state.outputs_acquired.load(Ordering::SeqCst)
    }

    /// Inputs acquired and not yet released.
    pub fn live_inputs(&self) -> usize {
        self.state.inputs_live.load(Ordering::SeqCst)
    }

    /// Outputs acquired and not yet released.
    pub fn live_outputs(&self) -> usize {
        self.state.outputs_live.load(Ordering::SeqCst)
    }

    /// Feed handle of the most recently acquired microphone.
    pub fn input_handle(&self) -> Option<VirtualInputHandle> {
        lock(&self.state.last_input)
            .as_ref()
            .map(|slot| VirtualInputHandle {
                slot: Arc::clone(slot),
            })
    }

    /// Timeline of the most recently acquired speaker.
    pub fn output_timeline(&self) -> Option<Timeline> {
        lock(&self.state.last_output).clone()
    }
}

/// Pushes samples into a virtual microphone as if the device callback fired.
#[derive(Clone)]
pub struct VirtualInputHandle {
    slot: CallbackSlot,
}

impl VirtualInputHandle {
    pub fn push(&self, samples: &[f32]) {
        deliver(&self.slot, samples);
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

pub struct VirtualInput {
    sample_rate: u32,
    channels: u16,
    slot: CallbackSlot,
    released: bool,
    state: Arc<VirtualState>,
}

impl InputDevice for VirtualInput {
    fn name(&self) -> &str {
        "virtual input"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn open_stream(&mut self, callback: InputCallback) -> VoiceResult<()> {
        if self.released {
            return Err(VoiceError::SessionClosed);
        }
        *lock(&self.slot) = Some(callback);
        Ok(())
    }

    fn close_stream(&mut self) {
        lock(&self.slot).take();
    }

    fn release(&mut self) -> Option<ReleaseWait> {
        self.close_stream();
        if self.released {
            return None;
        }
        self.released = true;
        self.state.finish_release(|s| &s.inputs_live)
    }
}

impl Drop for VirtualInput {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

pub struct VirtualOutput {
    timeline: Timeline,
    released: bool,
    state: Arc<VirtualState>,
}

impl OutputDevice for VirtualOutput {
    fn name(&self) -> &str {
        "virtual output"
    }

    fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    fn release(&mut self) -> Option<ReleaseWait> {
        if self.released {
            return None;
        }
        self.released = true;
        self.timeline.stop_all();
        self.state.finish_release(|s| &s.outputs_live)
    }
}

impl Drop for VirtualOutput {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl VirtualOutput {
    /// Standalone speaker not tracked by any backend.
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let state = Arc::new(VirtualState::default());
        state.outputs_live.fetch_add(1, Ordering::SeqCst);
        Self {
            timeline: Timeline::new(sample_rate, channels),
            released: false,
            state,
        }
    }
}

#[async_trait]
impl AudioBackend for VirtualBackend {
    async fn acquire_input(
        &self,
        config: &SessionConfig,
        _faults: FaultSender,
    ) -> VoiceResult<Box<dyn InputDevice>> {
        if self.state.deny_input.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable(
                "microphone permission denied".to_string(),
            ));
        }
        let (sample_rate, channels) =
            lock(&self.state.input_format).unwrap_or((config.capture_sample_rate, 1));
        let slot: CallbackSlot = Arc::new(Mutex::new(None));
        *lock(&self.state.last_input) = Some(Arc::clone(&slot));
        self.state.inputs_acquired.fetch_add(1, Ordering::SeqCst);
        self.state.inputs_live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualInput {
            sample_rate,
            channels,
            slot,
            released: false,
            state: Arc::clone(&self.state),
        }))
    }

    async fn acquire_output(
        &self,
        config: &SessionConfig,
        _faults: FaultSender,
    ) -> VoiceResult<Box<dyn OutputDevice>> {
        if self.state.deny_output.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable("no output device".to_string()));
        }
        let timeline = Timeline::new(config.playback_sample_rate, config.channels);
        *lock(&self.state.last_output) = Some(timeline.clone());
        self.state.outputs_acquired.fetch_add(1, Ordering::SeqCst);
        self.state.outputs_live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualOutput {
            timeline,
            released: false,
            state: Arc::clone(&self.state),
        }))
    }
}
