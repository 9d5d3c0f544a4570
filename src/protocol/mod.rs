//! Wire protocol: discovery announcements and control messages

pub mod announcement;
pub mod control;
pub mod osc;

pub use announcement::Announcement;
pub use control::ControlMessage;
pub use osc::{OscArg, OscMessage};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{MAX_CHANNELS, MAX_FRAMES_PER_BUFFER, MAX_RING_SLOTS};
use crate::error::PeerError;

/// Bytes per sample in shared memory (f32)
pub const SAMPLE_BYTES: usize = 4;

/// Audio format a producer declares for its ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub frames_per_buffer: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub ring_slot_count: u32,
}

impl StreamFormat {
    pub fn validate(&self) -> Result<(), PeerError> {
        if self.frames_per_buffer == 0 || self.frames_per_buffer > MAX_FRAMES_PER_BUFFER {
            return Err(PeerError::InvalidFormat(format!(
                "frames_per_buffer {} outside 1..={}",
                self.frames_per_buffer, MAX_FRAMES_PER_BUFFER
            )));
        }
        if self.sample_rate == 0 {
            return Err(PeerError::InvalidFormat("sample_rate must be non-zero".into()));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(PeerError::InvalidFormat(format!(
                "channels {} outside 1..={}",
                self.channels, MAX_CHANNELS
            )));
        }
        if self.ring_slot_count < 2 || self.ring_slot_count > MAX_RING_SLOTS {
            return Err(PeerError::InvalidFormat(format!(
                "ring_slot_count {} outside 2..={}",
                self.ring_slot_count, MAX_RING_SLOTS
            )));
        }
        Ok(())
    }

    /// Samples in one slot, all channels
    pub fn samples_per_slot(&self) -> usize {
        self.frames_per_buffer as usize * self.channels as usize
    }

    /// Bytes in one slot
    pub fn slot_size(&self) -> usize {
        self.samples_per_slot() * SAMPLE_BYTES
    }

    /// Samples held by the whole ring
    pub fn ring_capacity_samples(&self) -> usize {
        self.samples_per_slot() * self.ring_slot_count as usize
    }

    /// Wall-clock length of one slot
    pub fn buffer_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames_per_buffer as f64 / self.sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> StreamFormat {
        StreamFormat {
            frames_per_buffer: 512,
            sample_rate: 44100,
            channels: 2,
            ring_slot_count: 3,
        }
    }

    #[test]
    fn test_sizes() {
        let f = format();
        assert!(f.validate().is_ok());
        assert_eq!(f.samples_per_slot(), 1024);
        assert_eq!(f.slot_size(), 4096);
        assert_eq!(f.ring_capacity_samples(), 3072);
        assert!((f.buffer_duration().as_secs_f64() - 512.0 / 44100.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut f = format();
        f.ring_slot_count = 1;
        assert!(f.validate().is_err());

        let mut f = format();
        f.channels = 0;
        assert!(f.validate().is_err());

        let mut f = format();
        f.sample_rate = 0;
        assert!(f.validate().is_err());

        let mut f = format();
        f.frames_per_buffer = MAX_FRAMES_PER_BUFFER + 1;
        assert!(f.validate().is_err());
    }
}
