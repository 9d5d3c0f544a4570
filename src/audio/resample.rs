//! Per-channel sample-rate conversion
//!
//! A connection converts every slot it reads from the producer's rate to the
//! local rate. The output length per slot is fixed for the life of the
//! connection, see [`resampled_len`].
//!
//! [`SincResampler`] (rubato windowed sinc) is the default.
//! [`LinearResampler`] is the cheap alternative and also serves equal rates,
//! where it copies.

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::AudioError;

/// Output frames produced from `frames` input frames
pub fn resampled_len(frames: usize, source_rate: u32, target_rate: u32) -> usize {
    if source_rate == 0 {
        return 0;
    }
    (frames as f64 * target_rate as f64 / source_rate as f64).round() as usize
}

/// Stateful converter for a fixed number of channels
pub trait Resampler: Send {
    /// Convert one channel's block. `output.len()` is the block's output
    /// length; state for `channel` carries into the next call.
    fn process(&mut self, channel: usize, input: &[f32], output: &mut [f32]);

    /// Forget carried state
    fn reset(&mut self);
}

/// Resampling algorithm used by consumer connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplerKind {
    #[default]
    Sinc,
    Linear,
}

/// Build the converter for one connection. Equal rates always get the
/// copying [`LinearResampler`].
pub fn build_resampler(
    kind: ResamplerKind,
    channels: usize,
    frames_per_buffer: usize,
    source_rate: u32,
    target_rate: u32,
) -> Result<Box<dyn Resampler>, AudioError> {
    if source_rate == target_rate || kind == ResamplerKind::Linear {
        return Ok(Box::new(LinearResampler::new(channels)));
    }
    let sinc = SincResampler::new(channels, frames_per_buffer, source_rate, target_rate)?;
    Ok(Box::new(sinc))
}

/// Samples a channel may hold beyond the current block before the oldest
/// are dropped
const MAX_SLACK: usize = 16;

fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    }
}

struct SincChannel {
    filter: SincFixedIn<f32>,
    pending: VecDeque<f32>,
    last: f32,
}

/// Band-limited conversion with one rubato filter per channel.
///
/// rubato emits a block length that wanders around the exact ratio, while a
/// connection needs exactly [`resampled_len`] frames per slot. Each channel
/// therefore buffers rubato's output, pads with its last sample when short
/// and drops the oldest samples once more than `MAX_SLACK` are left over.
pub struct SincResampler {
    channels: Vec<SincChannel>,
}

impl SincResampler {
    pub fn new(
        channels: usize,
        frames_per_buffer: usize,
        source_rate: u32,
        target_rate: u32,
    ) -> Result<Self, AudioError> {
        if channels == 0 || frames_per_buffer == 0 || source_rate == 0 || target_rate == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "cannot resample {} channels of {} frames from {} Hz to {} Hz",
                channels, frames_per_buffer, source_rate, target_rate
            )));
        }
        let ratio = target_rate as f64 / source_rate as f64;
        let channels = (0..channels)
            .map(|_| {
                SincFixedIn::<f32>::new(ratio, 1.0, sinc_parameters(), frames_per_buffer, 1)
                    .map(|filter| SincChannel {
                        filter,
                        pending: VecDeque::new(),
                        last: 0.0,
                    })
                    .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { channels })
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }
}

impl Resampler for SincResampler {
    fn process(&mut self, channel: usize, input: &[f32], output: &mut [f32]) {
        let Some(ch) = self.channels.get_mut(channel) else {
            output.fill(0.0);
            return;
        };

        if input.len() == ch.filter.input_frames_next() {
            let waves_in = [input];
            match ch.filter.process(&waves_in[..], None) {
                Ok(mut waves) => {
                    if let Some(wave) = waves.pop() {
                        ch.pending.extend(wave);
                    }
                }
                Err(e) => tracing::warn!("Resampling channel {} failed: {}", channel, e),
            }
        } else {
            tracing::warn!(
                "Channel {} block of {} frames, filter expects {}",
                channel,
                input.len(),
                ch.filter.input_frames_next()
            );
        }

        for out in output.iter_mut() {
            if let Some(sample) = ch.pending.pop_front() {
                ch.last = sample;
            }
            *out = ch.last;
        }
        if ch.pending.len() > MAX_SLACK {
            let excess = ch.pending.len() - MAX_SLACK;
            ch.pending.drain(..excess);
        }
    }

    fn reset(&mut self) {
        for ch in &mut self.channels {
            ch.filter.reset();
            ch.pending.clear();
            ch.last = 0.0;
        }
    }
}

/// Linear interpolation that carries the last input sample of each channel
/// across blocks, so block edges do not click
pub struct LinearResampler {
    last: Vec<f32>,
}

impl LinearResampler {
    pub fn new(channels: usize) -> Self {
        Self {
            last: vec![0.0; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.last.len()
    }
}

impl Resampler for LinearResampler {
    fn process(&mut self, channel: usize, input: &[f32], output: &mut [f32]) {
        let Some(prev) = self.last.get_mut(channel) else {
            output.fill(0.0);
            return;
        };
        if input.is_empty() {
            output.fill(*prev);
            return;
        }
        if input.len() == output.len() {
            output.copy_from_slice(input);
            *prev = input[input.len() - 1];
            return;
        }

        let last_index = input.len() as isize - 1;
        let at = |i: isize| -> f32 {
            if i < 0 {
                *prev
            } else {
                input[i.min(last_index) as usize]
            }
        };

        // Output j sits at input position (j + 1) * step - 1, where -1 is
        // the carried sample. The last output lands on the last input.
        let step = input.len() as f64 / output.len() as f64;
        for (j, out) in output.iter_mut().enumerate() {
            let pos = (j + 1) as f64 * step - 1.0;
            let base = pos.floor();
            let frac = (pos - base) as f32;
            let i = base as isize;
            let a = at(i);
            let b = at(i + 1);
            *out = a + (b - a) * frac;
        }
        *prev = input[input.len() - 1];
    }

    fn reset(&mut self) {
        self.last.fill(0.0);
    }
}
