//! PCM codec: f32 capture frames ⇄ 16-bit little-endian wire frames ⇄ playback buffers.
//!
//! Everything here is stateless except [`StreamResampler`], which the capture side
//! uses to convert the device's native rate across callback boundaries.

use crate::error::{VoiceError, VoiceResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Mime type of raw 16-bit PCM on the wire.
pub const PCM_MIME: &str = "audio/pcm";

/// Fixed-length block of captured samples (f32, -1.0..1.0).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Quantized PCM exchanged with the remote service: i16 little-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    data: Vec<u8>,
    sample_rate: u32,
}

impl WireFrame {
    /// Wrap raw bytes as received. Length is validated by [`decode`], not here.
    pub fn from_bytes(data: Vec<u8>, sample_rate: u32) -> Self {
        Self { data, sample_rate }
    }

    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self { data, sample_rate }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whole samples contained in the frame (a trailing odd byte is ignored).
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / self.sample_rate as f64)
    }
}

/// Decoded audio ready for the playback timeline.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    /// Interleaved samples, `frames * channels` long.
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlaybackBuffer {
    /// Length in sample frames (one sample per channel).
    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels.max(1) as usize) as u64
    }

    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Quantize one frame: `round(clamp(s, -1, 1) * 32767)`.
pub fn encode(frame: &AudioFrame) -> WireFrame {
    let mut data = Vec::with_capacity(frame.samples.len() * 2);
    for &s in &frame.samples {
        let q = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        data.extend_from_slice(&q.to_le_bytes());
    }
    WireFrame {
        data,
        sample_rate: frame.sample_rate,
    }
}

/// Reconstruct a playback buffer at `target_rate` with `channels` interleaved channels.
pub fn decode(wire: &WireFrame, target_rate: u32, channels: u16) -> VoiceResult<PlaybackBuffer> {
    if wire.data.is_empty() {
        return Err(VoiceError::Decode("empty audio frame".to_string()));
    }
    if wire.data.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "{} bytes is not a whole number of 16-bit samples",
            wire.data.len()
        )));
    }
    if wire.sample_rate == 0 || target_rate == 0 {
        return Err(VoiceError::Decode("sample rate must be non-zero".to_string()));
    }

    let mono: Vec<f32> = wire
        .samples()
        .map(|s| (s as f32 / 32767.0).max(-1.0))
        .collect();
    let mono = if wire.sample_rate == target_rate {
        mono
    } else {
        resample(&mono, wire.sample_rate, target_rate)
    };

    let channels = channels.max(1);
    let samples: Arc<[f32]> = if channels == 1 {
        mono.into()
    } else {
        mono.iter()
            .flat_map(|&s| std::iter::repeat(s).take(channels as usize))
            .collect()
    };

    Ok(PlaybackBuffer {
        samples,
        sample_rate: target_rate,
        channels,
    })
}

/// Stateless linear resampling of a mono block. Output length is `round(n * to / from)`.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as u64 * to as u64) as f64 / from as f64).round() as usize;
    let step = from as f64 / to as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Streaming linear resampler that keeps continuity between successive blocks.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    step: f64,
    passthrough: bool,
    /// Read position relative to the carried-over sample.
    pos: f64,
    prev: Option<f32>,
}

impl StreamResampler {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            step: from as f64 / to.max(1) as f64,
            passthrough: from == to,
            pos: 0.0,
            prev: None,
        }
    }

    /// Resample `input` and append the result to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.passthrough {
            out.extend_from_slice(input);
            return;
        }
        let Some(&tail) = input.last() else {
            return;
        };

        let offset = usize::from(self.prev.is_some());
        let total = input.len() + offset;
        let at = |k: usize| -> f32 {
            match self.prev {
                Some(p) if k == 0 => p,
                _ => input[k - offset],
            }
        };

        while self.pos + 1.0 < total as f64 {
            let idx = self.pos.floor() as usize;
            let frac = (self.pos - idx as f64) as f32;
            let a = at(idx);
            let b = at(idx + 1);
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        self.pos -= (total - 1) as f64;
        self.prev = Some(tail);
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.prev = None;
    }
}

/// Wire container for one audio chunk: `{ "mimeType": "audio/pcm;rate=16000", "data": "<base64>" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    pub data: String,
}

impl MediaBlob {
    pub fn from_wire(wire: &WireFrame) -> Self {
        Self {
            mime_type: format!("{};rate={}", PCM_MIME, wire.sample_rate),
            data: STANDARD.encode(&wire.data),
        }
    }

    /// Parse back into a wire frame. `default_rate` applies when the mime type has no `rate=`.
    pub fn to_wire(&self, default_rate: u32) -> VoiceResult<WireFrame> {
        let mut parts = self.mime_type.split(';').map(str::trim);
        let media = parts.next().unwrap_or_default();
        if !media.eq_ignore_ascii_case(PCM_MIME) {
            return Err(VoiceError::Decode(format!(
                "unsupported mime type '{}'",
                self.mime_type
            )));
        }

        let mut rate = default_rate;
        for param in parts {
            if let Some((key, value)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("rate") {
                    rate = value.trim().parse().map_err(|_| {
                        VoiceError::Decode(format!("invalid rate in '{}'", self.mime_type))
                    })?;
                }
            }
        }

        let data = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| VoiceError::Decode(format!("invalid base64 payload: {}", e)))?;
        Ok(WireFrame::from_bytes(data, rate))
    }
}
