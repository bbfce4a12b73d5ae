//! Sample-accurate playback timeline.
//!
//! The output device pulls blocks through [`Timeline::render`]; the device clock is the
//! number of frames rendered so far. Buffers ("voices") are placed at absolute frame
//! positions, so two buffers scheduled back to back share no frame and leave no gap.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifier of a scheduled buffer.
pub type BufferId = u64;

/// Called from the render thread when a buffer has played to its end.
pub type EndedCallback = Arc<dyn Fn(BufferId) + Send + Sync>;

struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Arc<[f32]>,
}

#[derive(Default)]
struct TimelineInner {
    position: u64,
    voices: Vec<Voice>,
}

/// Shared handle to the playback timeline (clone is cheap).
#[derive(Clone)]
pub struct Timeline {
    sample_rate: u32,
    channels: u16,
    inner: Arc<Mutex<TimelineInner>>,
    on_ended: Arc<Mutex<Option<EndedCallback>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Timeline {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            inner: Arc::new(Mutex::new(TimelineInner::default())),
            on_ended: Arc::new(Mutex::new(None)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Device clock in frames.
    pub fn current_frame(&self) -> u64 {
        lock(&self.inner).position
    }

    /// Device clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.current_frame() as f64 / self.sample_rate as f64
    }

    /// Number of buffers still held by the mixer.
    pub fn voice_count(&self) -> usize {
        lock(&self.inner).voices.len()
    }

    pub fn set_on_ended(&self, callback: EndedCallback) {
        *lock(&self.on_ended) = Some(callback);
    }

    /// Place interleaved `samples` so their first frame plays at `start_frame`.
    pub fn schedule(&self, id: BufferId, samples: Arc<[f32]>, start_frame: u64) {
        lock(&self.inner).voices.push(Voice {
            id,
            start_frame,
            samples,
        });
    }

    /// Like [`Timeline::schedule`], but never behind the render position: the buffer
    /// starts at `max(earliest, current_frame)`, read under the same lock the render
    /// thread advances the clock with. Returns the start frame actually used.
    pub fn schedule_no_earlier_than(&self, id: BufferId, samples: Arc<[f32]>, earliest: u64) -> u64 {
        let mut inner = lock(&self.inner);
        let start_frame = earliest.max(inner.position);
        inner.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        start_frame
    }

    /// Silence a buffer immediately. Returns false if it already finished.
    /// No ended notification is sent for stopped buffers.
    pub fn stop(&self, id: BufferId) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.voices.len();
        inner.voices.retain(|v| v.id != id);
        inner.voices.len() != before
    }

    pub fn stop_all(&self) {
        lock(&self.inner).voices.clear();
    }

    /// Mix the next block into `out` (interleaved) and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        let ch = self.channels as usize;
        let frames = (out.len() / ch) as u64;
        out.fill(0.0);

        let ended: Vec<BufferId> = {
            let mut inner = lock(&self.inner);
            let block_start = inner.position;
            let block_end = block_start + frames;
            let mut ended = Vec::new();

            inner.voices.retain(|voice| {
                let voice_frames = (voice.samples.len() / ch) as u64;
                let voice_end = voice.start_frame + voice_frames;
                let from = voice.start_frame.max(block_start);
                let to = voice_end.min(block_end);
                for frame in from..to {
                    let src = ((frame - voice.start_frame) as usize) * ch;
                    let dst = ((frame - block_start) as usize) * ch;
                    for c in 0..ch {
                        out[dst + c] += voice.samples[src + c];
                    }
                }
                if voice_end <= block_end {
                    ended.push(voice.id);
                    false
                } else {
                    true
                }
            });

            inner.position = block_end;
            ended
        };

        if ended.is_empty() {
            return;
        }
        let callback = lock(&self.on_ended).clone();
        if let Some(callback) = callback {
            for id in ended {
                callback(id);
            }
        }
    }
}
