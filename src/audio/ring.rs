//! Ring of audio slots inside one shared segment
//!
//! ```text
//! 0        4           8          12                    12+S        12+N*S
//! ├────────┼───────────┼──────────┼─────────────────────┼─── ... ────┤
//! │ index  │ published │ reserved │ slot 0              │ slot N-1   │
//! │ u32 ne │ u32 ne    │ zero     │ planar f32 per chan │            │
//! ```
//!
//! The writer fills a slot completely before storing its number in the
//! index, so a reader that sees a new index always finds a whole slot.
//! `published` counts writes (never 0 after the first) and only tells a
//! newly attached reader whether the current slot holds real data.
//! Neither side blocks or takes an OS lock.

use std::sync::atomic::{fence, Ordering};

use crate::error::ShmError;
use crate::protocol::{StreamFormat, SAMPLE_BYTES};
use crate::shm::{Backend, Segment, SegmentId, SegmentReader, SegmentWriter};

/// Bytes before slot 0
pub const HEADER_LEN: usize = 12;

const INDEX_LEN: usize = 4;

/// Index plus publish counter
const STAMP_LEN: usize = 8;

/// Geometry of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub slot_size: usize,
    pub slot_count: usize,
}

impl RingLayout {
    pub fn new(slot_size: usize, slot_count: usize) -> Result<Self, ShmError> {
        if slot_size == 0 || slot_count < 2 {
            return Err(ShmError::InvalidSize(slot_size * slot_count));
        }
        Ok(Self {
            slot_size,
            slot_count,
        })
    }

    pub fn for_format(format: &StreamFormat) -> Result<Self, ShmError> {
        Self::new(format.slot_size(), format.ring_slot_count as usize)
    }

    pub fn slot_offset(&self, slot: usize) -> usize {
        HEADER_LEN + slot * self.slot_size
    }

    /// Size of the segment holding this ring
    pub fn total_size(&self) -> usize {
        HEADER_LEN + self.slot_count * self.slot_size
    }
}

fn samples_to_bytes(samples: &[f32], out: &mut [u8]) {
    for (chunk, sample) in out.chunks_exact_mut(SAMPLE_BYTES).zip(samples) {
        chunk.copy_from_slice(&sample.to_ne_bytes());
    }
}

fn bytes_to_samples(bytes: &[u8], out: &mut [f32]) {
    for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(SAMPLE_BYTES)) {
        let mut raw = [0u8; SAMPLE_BYTES];
        raw.copy_from_slice(chunk);
        *sample = f32::from_ne_bytes(raw);
    }
}

/// Producer side of a ring. Owns the segment writer.
pub struct RingWriter {
    segment: SegmentWriter,
    layout: RingLayout,
    last_index: u32,
    published: u32,
    scratch: Vec<u8>,
}

impl RingWriter {
    /// Create the segment and zero the header
    pub fn create(id: SegmentId, layout: RingLayout, backend: Backend) -> Result<Self, ShmError> {
        let segment = SegmentWriter::create(id, layout.total_size(), backend)?;
        Self::new(segment, layout)
    }

    pub fn new(mut segment: SegmentWriter, layout: RingLayout) -> Result<Self, ShmError> {
        if segment.size() < layout.total_size() {
            return Err(ShmError::SizeMismatch {
                name: segment.id().name().to_string(),
                expected: layout.total_size(),
                actual: segment.size(),
            });
        }
        segment.write_at(0, &[0u8; HEADER_LEN])?;
        Ok(Self {
            segment,
            layout,
            last_index: 0,
            published: 0,
            scratch: vec![0u8; layout.slot_size],
        })
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn segment(&self) -> &SegmentWriter {
        &self.segment
    }

    /// Index of the most recently published slot
    pub fn current_index(&self) -> u32 {
        self.last_index
    }

    /// Copy one slot of raw bytes into the next slot and publish it
    pub fn write_slot(&mut self, data: &[u8]) -> Result<u32, ShmError> {
        if data.len() != self.layout.slot_size {
            return Err(ShmError::InvalidSize(data.len()));
        }
        let next = (self.last_index + 1) % self.layout.slot_count as u32;
        self.segment
            .write_at(self.layout.slot_offset(next as usize), data)?;
        fence(Ordering::Release);
        let published = self.published.wrapping_add(1).max(1);
        let mut stamp = [0u8; STAMP_LEN];
        stamp[..INDEX_LEN].copy_from_slice(&next.to_ne_bytes());
        stamp[INDEX_LEN..].copy_from_slice(&published.to_ne_bytes());
        self.segment.write_at(0, &stamp)?;
        self.last_index = next;
        self.published = published;
        Ok(next)
    }

    /// Publish one slot of planar samples
    pub fn write_samples(&mut self, samples: &[f32]) -> Result<u32, ShmError> {
        if samples.len() * SAMPLE_BYTES != self.layout.slot_size {
            return Err(ShmError::InvalidSize(samples.len() * SAMPLE_BYTES));
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        samples_to_bytes(samples, &mut scratch);
        let result = self.write_slot(&scratch);
        self.scratch = scratch;
        result
    }

    /// Destroy the segment
    pub fn close(&mut self) {
        self.segment.close();
    }
}

/// Consumer side of a ring. Owns the segment reader.
pub struct RingReader {
    segment: SegmentReader,
    layout: RingLayout,
    last_seen: Option<u32>,
    scratch: Vec<u8>,
}

impl RingReader {
    /// Attach to a ring. The slot current at attach is delivered by the
    /// first poll if the writer has published anything yet.
    pub fn attach(id: SegmentId, layout: RingLayout, backend: Backend) -> Result<Self, ShmError> {
        let segment = SegmentReader::attach(id, layout.total_size(), backend)?;
        Self::new(segment, layout)
    }

    pub fn new(segment: SegmentReader, layout: RingLayout) -> Result<Self, ShmError> {
        let mut reader = Self {
            segment,
            layout,
            last_seen: None,
            scratch: vec![0u8; layout.slot_size],
        };
        let mut stamp = [0u8; STAMP_LEN];
        reader.segment.read_at(0, &mut stamp)?;
        let mut published = [0u8; INDEX_LEN];
        published.copy_from_slice(&stamp[INDEX_LEN..]);
        if u32::from_ne_bytes(published) == 0 {
            // Nothing written yet: slot contents are not audio
            reader.last_seen = Some(reader.read_index()?);
        }
        Ok(reader)
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn segment(&self) -> &SegmentReader {
        &self.segment
    }

    /// Index of the last delivered slot, `None` before the first poll
    /// when the current slot is still unread
    pub fn last_seen(&self) -> Option<u32> {
        self.last_seen
    }

    fn read_index(&self) -> Result<u32, ShmError> {
        let mut raw = [0u8; INDEX_LEN];
        self.segment.read_at(0, &mut raw)?;
        Ok(u32::from_ne_bytes(raw))
    }

    /// Copy the newest slot into `out` if it was published since the last
    /// call. Returns the slot index.
    pub fn try_read_slot(&mut self, out: &mut [u8]) -> Option<u32> {
        if out.len() != self.layout.slot_size {
            return None;
        }
        let index = self.read_index().ok()?;
        if self.last_seen == Some(index) {
            return None;
        }
        if index as usize >= self.layout.slot_count {
            tracing::warn!(
                "Segment {} published slot {} outside ring of {}",
                self.segment.id(),
                index,
                self.layout.slot_count
            );
            self.last_seen = Some(index);
            return None;
        }
        fence(Ordering::Acquire);
        self.segment
            .read_at(self.layout.slot_offset(index as usize), out)
            .ok()?;
        self.last_seen = Some(index);
        Some(index)
    }

    /// Like [`try_read_slot`](Self::try_read_slot), decoding planar samples
    pub fn try_read_samples(&mut self, out: &mut [f32]) -> Option<u32> {
        if out.len() * SAMPLE_BYTES != self.layout.slot_size {
            return None;
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        let index = self.try_read_slot(&mut scratch);
        if index.is_some() {
            bytes_to_samples(&scratch, out);
        }
        self.scratch = scratch;
        index
    }

    /// Detach from the segment
    pub fn close(&mut self) {
        self.segment.close();
    }
}
