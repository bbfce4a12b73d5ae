//! Capture pipeline: microphone → fixed-size [`AudioFrame`]s → sink.
//!
//! The sink runs synchronously on the device callback thread, one call per completed
//! frame, so it must return well within one frame interval.

use crate::codec::{AudioFrame, StreamResampler};
use crate::config::SessionConfig;
use crate::device::{InputDevice, ReleaseWait};
use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};

/// Turns raw interleaved device blocks into mono frames of exactly `frame_size` samples
/// at the capture rate.
pub struct FrameSlicer {
    channels: usize,
    frame_size: usize,
    capture_rate: u32,
    resampler: StreamResampler,
    mono: Vec<f32>,
    resampled: Vec<f32>,
    pending: Vec<f32>,
}

impl FrameSlicer {
    pub fn new(device_rate: u32, device_channels: u16, config: &SessionConfig) -> Self {
        Self {
            channels: device_channels.max(1) as usize,
            frame_size: config.frame_size,
            capture_rate: config.capture_sample_rate,
            resampler: StreamResampler::new(device_rate, config.capture_sample_rate),
            mono: Vec::new(),
            resampled: Vec::new(),
            pending: Vec::with_capacity(config.frame_size),
        }
    }

    /// Feed one device block; `emit` is called once per completed frame, in order.
    pub fn push(&mut self, data: &[f32], mut emit: impl FnMut(AudioFrame)) {
        self.mono.clear();
        if self.channels == 1 {
            self.mono.extend_from_slice(data);
        } else {
            let scale = 1.0 / self.channels as f32;
            self.mono.extend(
                data.chunks_exact(self.channels)
                    .map(|frame| frame.iter().sum::<f32>() * scale),
            );
        }

        self.resampled.clear();
        self.resampler.process(&self.mono, &mut self.resampled);

        let mut rest = &self.resampled[..];
        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                emit(AudioFrame::new(samples, self.capture_rate));
            }
        }
    }

    /// Samples waiting for the next frame to complete.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Owns the lent microphone for the session and drives the outbound sink.
pub struct CapturePipeline {
    config: SessionConfig,
    device: Option<Box<dyn InputDevice>>,
    running: bool,
}

impl CapturePipeline {
    pub fn new(device: Box<dyn InputDevice>, config: SessionConfig) -> Self {
        Self {
            config,
            device: Some(device),
            running: false,
        }
    }

    /// Begin delivering frames to `sink`.
    pub fn start<F>(&mut self, mut sink: F) -> VoiceResult<()>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        let device = self.device.as_mut().ok_or(VoiceError::SessionClosed)?;
        if self.running {
            return Err(VoiceError::Config("capture already started".to_string()));
        }

        let mut slicer = FrameSlicer::new(device.sample_rate(), device.channels(), &self.config);
        info!(
            "▶️ Starting capture: {} ({}Hz x{} → {}Hz, {} samples/frame)",
            device.name(),
            device.sample_rate(),
            device.channels(),
            self.config.capture_sample_rate,
            self.config.frame_size
        );

        device
            .open_stream(Box::new(move |data: &[f32]| slicer.push(data, &mut sink)))
            .map_err(|e| match e {
                VoiceError::SessionClosed | VoiceError::DeviceUnavailable(_) => e,
                other => VoiceError::DeviceUnavailable(other.to_string()),
            })?;
        self.running = true;
        Ok(())
    }

    /// Stop delivering frames and release the microphone. Idempotent. Returns the
    /// device's release wait, if it closes asynchronously.
    pub fn stop(&mut self) -> Option<ReleaseWait> {
        let Some(mut device) = self.device.take() else {
            debug!("capture already stopped");
            return None;
        };
        device.close_stream();
        self.running = false;
        info!("⏹️ Capture stopped");
        device.release()
    }

    pub fn is_running(&self) -> bool {
        self.running && self.device.is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AudioBackend, VirtualBackend};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn config(frame_size: usize) -> SessionConfig {
        SessionConfig {
            frame_size,
            ..Default::default()
        }
    }

    #[test]
    fn slicer_emits_exact_frames_across_blocks() {
        let mut slicer = FrameSlicer::new(16000, 1, &config(4));
        let mut frames = Vec::new();
        let input: Vec<f32> = (0..10).map(|i| i as f32 / 10.0).collect();
        slicer.push(&input[..3], |f| frames.push(f));
        slicer.push(&input[3..], |f| frames.push(f));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.0, 0.1, 0.2, 0.3]);
        assert_eq!(frames[1].samples, vec![0.4, 0.5, 0.6, 0.7]);
        assert!(frames.iter().all(|f| f.sample_rate == 16000));
        assert_eq!(slicer.pending(), 2);
    }

    #[test]
    fn slicer_downmixes_stereo() {
        let mut slicer = FrameSlicer::new(16000, 2, &config(2));
        let mut frames = Vec::new();
        slicer.push(&[1.0, 0.0, 0.5, 0.5], |f| frames.push(f));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![0.5, 0.5]);
    }

    #[test]
    fn slicer_resamples_device_rate() {
        let mut slicer = FrameSlicer::new(48000, 1, &config(160));
        let mut count = 0;
        // 30ms at 48kHz → 480 samples at 16kHz → 3 frames of 160
        for _ in 0..3 {
            slicer.push(&[0.25; 480], |f| {
                assert_eq!(f.len(), 160);
                count += 1;
            });
        }
        assert!(count >= 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_silences_sink() {
        let backend = VirtualBackend::new();
        let device = backend
            .acquire_input(&config(4), mpsc::unbounded_channel().0)
            .await
            .unwrap();
        let handle = backend.input_handle().unwrap();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink_frames = Arc::clone(&frames);
        let mut pipeline = CapturePipeline::new(device, config(4));
        pipeline
            .start(move |f| sink_frames.lock().unwrap().push(f))
            .unwrap();
        assert!(pipeline.is_running());

        handle.push(&[0.1; 8]);
        pipeline.stop();
        pipeline.stop();
        handle.push(&[0.1; 8]);

        assert_eq!(frames.lock().unwrap().len(), 2);
        assert!(!pipeline.is_running());
        assert_eq!(backend.live_inputs(), 0);
        assert!(matches!(pipeline.start(|_| {}), Err(VoiceError::SessionClosed)));
    }

    #[tokio::test]
    async fn stop_without_start_releases_device() {
        let backend = VirtualBackend::new();
        let device = backend
            .acquire_input(&config(4), mpsc::unbounded_channel().0)
            .await
            .unwrap();
        let pipeline = CapturePipeline::new(device, config(4));
        drop(pipeline);
        assert_eq!(backend.live_inputs(), 0);
    }
}
