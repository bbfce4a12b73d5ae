//! Playback scheduler: gap-free, in-order playback of inbound wire frames.
//!
//! Each frame is decoded and placed on the output timeline at
//! `max(next_start, device_now)`, then `next_start` advances by the buffer's length.
//! Frames arriving promptly therefore play back to back with no gap and no overlap;
//! a late frame leaves a short gap instead of being played in the past.

use crate::codec::{self, WireFrame};
use crate::device::{OutputDevice, ReleaseWait};
use crate::error::{VoiceError, VoiceResult};
use crate::timeline::{BufferId, Timeline};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info};

/// Placement of one decoded buffer on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_frame: u64,
    pub frames: u64,
    pub sample_rate: u32,
}

impl ScheduledBuffer {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }

    pub fn start_time(&self) -> f64 {
        self.start_frame as f64 / self.sample_rate as f64
    }

    pub fn duration(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }
}

#[derive(Default)]
struct SchedulerState {
    /// Next start position in frames; `None` after a flush.
    clock: Option<u64>,
    active: BTreeMap<BufferId, ScheduledBuffer>,
    next_id: BufferId,
    closed: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns scheduling state and the lent output device for the session.
pub struct PlaybackScheduler {
    state: Arc<Mutex<SchedulerState>>,
    timeline: Timeline,
    output: Mutex<Option<Box<dyn OutputDevice>>>,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputDevice>) -> Self {
        let timeline = output.timeline().clone();
        let state = Arc::new(Mutex::new(SchedulerState::default()));

        let weak: Weak<Mutex<SchedulerState>> = Arc::downgrade(&state);
        timeline.set_on_ended(Arc::new(move |id| {
            if let Some(state) = weak.upgrade() {
                if lock(&state).active.remove(&id).is_some() {
                    debug!(buffer = id, "playback buffer ended");
                }
            }
        }));

        info!(
            "🔊 Playback scheduler ready on {} ({}Hz, {} channels)",
            output.name(),
            timeline.sample_rate(),
            timeline.channels()
        );

        Self {
            state,
            timeline,
            output: Mutex::new(Some(output)),
        }
    }

    /// Decode `wire` and schedule it directly after everything already queued.
    pub fn enqueue(&self, wire: &WireFrame) -> VoiceResult<ScheduledBuffer> {
        if lock(&self.state).closed {
            return Err(VoiceError::SessionClosed);
        }
        let buffer = codec::decode(wire, self.timeline.sample_rate(), self.timeline.channels())?;

        let mut state = lock(&self.state);
        if state.closed {
            return Err(VoiceError::SessionClosed);
        }

        let id = state.next_id;
        state.next_id += 1;

        // The render thread may advance the clock at any moment; the timeline resolves
        // `max(clock, now)` under its own lock so no leading samples are skipped.
        let frames = buffer.frames();
        let start_frame = self
            .timeline
            .schedule_no_earlier_than(id, buffer.samples, state.clock.unwrap_or(0));

        let scheduled = ScheduledBuffer {
            id,
            start_frame,
            frames,
            sample_rate: buffer.sample_rate,
        };
        state.clock = Some(scheduled.end_frame());
        state.active.insert(id, scheduled);

        debug!(
            buffer = id,
            start = scheduled.start_time(),
            duration = scheduled.duration(),
            "scheduled playback buffer"
        );
        Ok(scheduled)
    }

    /// Barge-in: silence everything queued or playing and forget the schedule clock.
    /// Returns the number of buffers stopped.
    pub fn flush(&self) -> usize {
        let mut state = lock(&self.state);
        let stopped = state.active.len();
        for id in state.active.keys() {
            self.timeline.stop(*id);
        }
        state.active.clear();
        state.clock = None;
        if stopped > 0 {
            info!("⏹️ Playback flushed ({} buffers)", stopped);
        }
        stopped
    }

    /// Flush and release the output device. Idempotent. Returns the device's release
    /// wait, if it closes asynchronously.
    pub fn shutdown(&self) -> Option<ReleaseWait> {
        self.flush();
        lock(&self.state).closed = true;
        let mut output = lock(&self.output).take()?;
        info!("🔇 Playback scheduler shut down");
        output.release()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Buffers scheduled and not yet finished.
    pub fn active_len(&self) -> usize {
        lock(&self.state).active.len()
    }

    /// Snapshot of the active set in scheduling order.
    pub fn active_buffers(&self) -> Vec<ScheduledBuffer> {
        lock(&self.state).active.values().copied().collect()
    }

    /// Next start time in seconds, `None` when unset.
    pub fn schedule_clock(&self) -> Option<f64> {
        let rate = self.timeline.sample_rate() as f64;
        lock(&self.state).clock.map(|frames| frames as f64 / rate)
    }

    /// Device clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.timeline.current_time()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::device::{AudioBackend, VirtualBackend, VirtualOutput};
    use tokio::sync::mpsc;

    const RATE: u32 = 24000;

    fn scheduler() -> PlaybackScheduler {
        PlaybackScheduler::new(Box::new(VirtualOutput::new(RATE, 1)))
    }

    /// 100ms of 24kHz mono PCM.
    fn frame_100ms() -> WireFrame {
        WireFrame::from_samples(&vec![1200i16; 2400], RATE)
    }

    fn advance(timeline: &Timeline, frames: usize) {
        let mut block = vec![0.0; frames * timeline.channels() as usize];
        timeline.render(&mut block);
    }

    #[test]
    fn three_frames_play_contiguously() {
        let s = scheduler();
        let scheduled: Vec<_> = (0..3).map(|_| s.enqueue(&frame_100ms()).unwrap()).collect();

        for pair in scheduled.windows(2) {
            assert_eq!(pair[1].start_frame, pair[0].end_frame());
        }
        let span = scheduled[2].end_frame() - scheduled[0].start_frame;
        assert_eq!(span, 7200);
        assert!((span as f64 / RATE as f64 - 0.3).abs() < 1e-12);
        assert_eq!(s.active_len(), 3);
        assert!((s.schedule_clock().unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn prompt_arrivals_stay_contiguous_while_playing() {
        let s = scheduler();
        let mut previous = s.enqueue(&frame_100ms()).unwrap();
        for _ in 0..5 {
            // each frame arrives 40ms after the previous one, well inside its 100ms
            advance(s.timeline(), 960);
            let next = s.enqueue(&frame_100ms()).unwrap();
            assert_eq!(next.start_frame, previous.end_frame());
            previous = next;
        }
    }

    #[test]
    fn late_frame_anchors_to_device_time() {
        let s = scheduler();
        let first = s.enqueue(&frame_100ms()).unwrap();
        advance(s.timeline(), 6000);
        let late = s.enqueue(&frame_100ms()).unwrap();
        assert!(late.start_frame > first.end_frame());
        assert_eq!(late.start_frame, 6000);
    }

    #[test]
    fn concurrent_render_never_skips_leading_samples() {
        let s = scheduler();
        s.enqueue(&frame_100ms()).unwrap();
        s.flush();

        // the output thread keeps rendering while the next response is being enqueued
        let renderer = {
            let timeline = s.timeline().clone();
            std::thread::spawn(move || {
                let mut played = Vec::new();
                let mut block = vec![0.0; 240];
                for _ in 0..50 {
                    timeline.render(&mut block);
                    played.extend_from_slice(&block);
                }
                played
            })
        };
        let ramp: Vec<i16> = (1..=2400).map(|i| i as i16).collect();
        s.enqueue(&WireFrame::from_samples(&ramp, RATE)).unwrap();
        let mut played = renderer.join().unwrap();

        let mut tail = vec![0.0; 2400];
        s.timeline().render(&mut tail);
        played.extend_from_slice(&tail);

        let first = played.iter().copied().find(|&x| x != 0.0).unwrap();
        assert!((first - 1.0 / 32767.0).abs() < 1e-6, "first audible sample was {}", first);
        let audible = played.iter().filter(|&&x| x != 0.0).count();
        assert_eq!(audible, 2400);
    }

    #[test]
    fn enqueue_after_render_anchors_at_render_position() {
        let s = scheduler();
        advance(s.timeline(), 480);
        let ramp: Vec<i16> = (1..=4).map(|i| i as i16 * 1000).collect();
        let scheduled = s.enqueue(&WireFrame::from_samples(&ramp, RATE)).unwrap();
        assert_eq!(scheduled.start_frame, 480);

        let mut block = vec![0.0; 4];
        s.timeline().render(&mut block);
        assert!((block[0] - 1000.0 / 32767.0).abs() < 1e-6);
        assert!((block[3] - 4000.0 / 32767.0).abs() < 1e-6);
    }

    #[test]
    fn finished_buffers_leave_the_active_set() {
        let s = scheduler();
        s.enqueue(&frame_100ms()).unwrap();
        s.enqueue(&frame_100ms()).unwrap();
        advance(s.timeline(), 2400);
        assert_eq!(s.active_len(), 1);
        advance(s.timeline(), 2400);
        assert_eq!(s.active_len(), 0);
        assert_eq!(s.timeline().voice_count(), 0);
    }

    #[test]
    fn flush_stops_everything_and_resets_clock() {
        let s = scheduler();
        s.enqueue(&frame_100ms()).unwrap();
        s.enqueue(&frame_100ms()).unwrap();
        advance(s.timeline(), 1000);

        assert_eq!(s.flush(), 2);
        assert_eq!(s.active_len(), 0);
        assert_eq!(s.schedule_clock(), None);
        assert_eq!(s.timeline().voice_count(), 0);

        let mut block = vec![1.0; 480];
        s.timeline().render(&mut block);
        assert!(block.iter().all(|&x| x == 0.0), "stale audio after flush");

        let now = s.timeline().current_frame();
        let next = s.enqueue(&frame_100ms()).unwrap();
        assert_eq!(next.start_frame, now);
    }

    #[test]
    fn malformed_frame_is_skipped_between_valid_ones() {
        let s = scheduler();
        let first = s.enqueue(&frame_100ms()).unwrap();
        let bad = s.enqueue(&WireFrame::from_bytes(Vec::new(), RATE));
        assert!(matches!(bad, Err(VoiceError::Decode(_))));
        let second = s.enqueue(&frame_100ms()).unwrap();

        assert_eq!(second.start_frame, first.end_frame());
        assert_eq!(s.active_len(), 2);
    }

    #[test]
    fn inbound_rate_is_converted_to_timeline_rate() {
        let s = scheduler();
        let wire = WireFrame::from_samples(&vec![0i16; 1600], 16000);
        let scheduled = s.enqueue(&wire).unwrap();
        assert_eq!(scheduled.frames, 2400);
        assert_eq!(scheduled.sample_rate, RATE);
    }

    #[tokio::test]
    async fn shutdown_releases_output_and_rejects_enqueue() {
        let backend = VirtualBackend::new();
        let output = backend
            .acquire_output(&SessionConfig::default(), mpsc::unbounded_channel().0)
            .await
            .unwrap();
        let s = PlaybackScheduler::new(output);
        s.enqueue(&frame_100ms()).unwrap();

        s.shutdown();
        s.shutdown();
        assert!(s.is_closed());
        assert_eq!(s.active_len(), 0);
        assert_eq!(backend.live_outputs(), 0);
        assert!(matches!(s.enqueue(&frame_100ms()), Err(VoiceError::SessionClosed)));
    }

    #[test]
    fn flush_from_another_thread_while_enqueueing() {
        let s = Arc::new(scheduler());
        let producer = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    s.enqueue(&frame_100ms()).unwrap();
                }
            })
        };
        for _ in 0..50 {
            s.flush();
        }
        producer.join().unwrap();

        // whatever survived the flushes is still strictly contiguous
        let active = s.active_buffers();
        for pair in active.windows(2) {
            assert_eq!(pair[1].start_frame, pair[0].end_frame());
        }
    }
}
