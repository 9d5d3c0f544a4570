//! Named shared memory segments
//!
//! Two capability-restricted handles share the [`Segment`] contract:
//! [`SegmentWriter`] exclusively creates a region and destroys it on close,
//! [`SegmentReader`] attaches to an existing region and only detaches.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::pages::PageTable;
use crate::constants::SEGMENT_NAME_PREFIX;
use crate::error::ShmError;

/// OS facility backing a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// One POSIX `shm_open` object mapped contiguously
    #[default]
    Mapped,
    /// One System V segment per page, addressed by integer key
    Paged,
}

/// Platform address of a segment: a name plus an integer key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentId {
    name: String,
    key: i32,
}

impl SegmentId {
    pub fn new(name: impl Into<String>, key: i32) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }

    /// Canonical id for a probed key: `audioSharing_<key>`
    pub fn from_key(key: i32) -> Self {
        Self::new(format!("{}{}", SEGMENT_NAME_PREFIX, key), key)
    }

    /// Parse an announced segment field. Accepts the full name or a bare
    /// decimal key.
    pub fn parse(s: &str) -> Result<Self, ShmError> {
        let digits = s.strip_prefix(SEGMENT_NAME_PREFIX).unwrap_or(s);
        match digits.parse::<i32>() {
            Ok(key) if key >= 0 => Ok(Self::from_key(key)),
            _ => Err(ShmError::InvalidName(s.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the name is the one [`SegmentId::parse`] derives from the key
    pub fn is_canonical(&self) -> bool {
        self.key >= 0 && *self == Self::from_key(self.key)
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    /// Name in the POSIX shared memory namespace
    pub fn posix_path(&self) -> String {
        format!("/{}", self.name)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Backend mapping owned by a segment handle
pub(crate) trait Mapping: Send {
    fn pages(&self) -> &PageTable;

    /// Unmap; with `destroy` also remove the OS object
    fn release(&mut self, destroy: bool);
}

/// Operations common to readers and writers
pub trait Segment {
    fn id(&self) -> &SegmentId;

    /// Region size in bytes
    fn size(&self) -> usize;

    fn is_opened(&self) -> bool;

    /// Release the mapping. Idempotent.
    fn close(&mut self);
}

fn create_mapping(
    backend: Backend,
    id: &SegmentId,
    size: usize,
) -> Result<Box<dyn Mapping>, ShmError> {
    #[cfg(unix)]
    {
        match backend {
            Backend::Mapped => Ok(Box::new(super::posix::PosixMapping::create(id, size)?)),
            Backend::Paged => Ok(Box::new(super::paged::PagedMapping::create(id, size)?)),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (backend, id, size);
        Err(ShmError::Unsupported)
    }
}

fn attach_mapping(
    backend: Backend,
    id: &SegmentId,
    size: usize,
) -> Result<Box<dyn Mapping>, ShmError> {
    #[cfg(unix)]
    {
        match backend {
            Backend::Mapped => Ok(Box::new(super::posix::PosixMapping::attach(id, size)?)),
            Backend::Paged => Ok(Box::new(super::paged::PagedMapping::attach(id, size)?)),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (backend, id, size);
        Err(ShmError::Unsupported)
    }
}

/// Exclusive creator of a segment
pub struct SegmentWriter {
    id: SegmentId,
    size: usize,
    backend: Backend,
    mapping: Option<Box<dyn Mapping>>,
}

impl SegmentWriter {
    /// Create a zero-filled region of exactly `size` bytes.
    ///
    /// Fails with [`ShmError::AlreadyExists`] if another writer owns the id.
    pub fn create(id: SegmentId, size: usize, backend: Backend) -> Result<Self, ShmError> {
        if size == 0 {
            return Err(ShmError::InvalidSize(size));
        }
        let mapping = create_mapping(backend, &id, size).map_err(|e| {
            tracing::debug!("Could not create segment {} ({:?}): {}", id, backend, e);
            e
        })?;
        tracing::debug!("Created segment {} ({} bytes, {:?})", id, size, backend);
        Ok(Self {
            id,
            size,
            backend,
            mapping: Some(mapping),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Copy `data` over the whole region
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), ShmError> {
        if data.len() != self.size {
            return Err(ShmError::InvalidSize(data.len()));
        }
        self.write_at(0, data)
    }

    /// Copy `data` into the region at `offset`
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        let mapping = self.mapping.as_ref().ok_or(ShmError::NotOpen)?;
        mapping.pages().copy_in(offset, data)
    }

    /// Read back part of the region
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmError> {
        let mapping = self.mapping.as_ref().ok_or(ShmError::NotOpen)?;
        mapping.pages().copy_out(offset, out)
    }
}

impl Segment for SegmentWriter {
    fn id(&self) -> &SegmentId {
        &self.id
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_opened(&self) -> bool {
        self.mapping.is_some()
    }

    fn close(&mut self) {
        if let Some(mut mapping) = self.mapping.take() {
            mapping.release(true);
            tracing::debug!("Destroyed segment {}", self.id);
        }
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read-only attachment to an existing segment
pub struct SegmentReader {
    id: SegmentId,
    size: usize,
    backend: Backend,
    mapping: Option<Box<dyn Mapping>>,
}

impl SegmentReader {
    /// Attach to an existing region of at least `size` bytes
    pub fn attach(id: SegmentId, size: usize, backend: Backend) -> Result<Self, ShmError> {
        if size == 0 {
            return Err(ShmError::InvalidSize(size));
        }
        let mapping = attach_mapping(backend, &id, size)?;
        tracing::debug!("Attached to segment {} ({} bytes, {:?})", id, size, backend);
        Ok(Self {
            id,
            size,
            backend,
            mapping: Some(mapping),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Copy the whole region into `out`
    pub fn read_all(&self, out: &mut [u8]) -> Result<(), ShmError> {
        if out.len() != self.size {
            return Err(ShmError::InvalidSize(out.len()));
        }
        self.read_at(0, out)
    }

    /// Copy `out.len()` bytes starting at `offset`
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmError> {
        let mapping = self.mapping.as_ref().ok_or(ShmError::NotOpen)?;
        mapping.pages().copy_out(offset, out)
    }
}

impl Segment for SegmentReader {
    fn id(&self) -> &SegmentId {
        &self.id
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_opened(&self) -> bool {
        self.mapping.is_some()
    }

    fn close(&mut self) {
        if let Some(mut mapping) = self.mapping.take() {
            mapping.release(false);
            tracing::debug!("Detached from segment {}", self.id);
        }
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::unique_id;
    use super::*;

    fn roundtrip(backend: Backend) {
        let id = unique_id();
        let size = 3 * 4096 + 100;
        let mut writer = SegmentWriter::create(id.clone(), size, backend).unwrap();
        let reader = SegmentReader::attach(id, size, backend).unwrap();

        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        writer.write_all(&data).unwrap();

        let mut out = vec![0u8; size];
        reader.read_all(&mut out).unwrap();
        assert_eq!(out, data);

        writer.write_at(4090, &[9u8; 12]).unwrap();
        let mut part = [0u8; 12];
        reader.read_at(4090, &mut part).unwrap();
        assert_eq!(part, [9u8; 12]);
    }

    #[test]
    fn test_mapped_roundtrip() {
        roundtrip(Backend::Mapped);
    }

    #[test]
    fn test_paged_roundtrip() {
        roundtrip(Backend::Paged);
    }

    #[test]
    fn test_second_writer_rejected() {
        let id = unique_id();
        let _first = SegmentWriter::create(id.clone(), 64, Backend::Mapped).unwrap();
        let second = SegmentWriter::create(id, 64, Backend::Mapped);
        assert!(matches!(second, Err(ShmError::AlreadyExists(_))));
    }

    #[test]
    fn test_attach_missing_fails() {
        let result = SegmentReader::attach(unique_id(), 64, Backend::Mapped);
        assert!(matches!(result, Err(ShmError::NotFound(_))));
    }

    #[test]
    fn test_attach_undersized_fails() {
        let id = unique_id();
        let _writer = SegmentWriter::create(id.clone(), 64, Backend::Mapped).unwrap();
        let result = SegmentReader::attach(id, 128, Backend::Mapped);
        assert!(matches!(result, Err(ShmError::SizeMismatch { .. })));
    }

    #[test]
    fn test_close_is_idempotent_and_destroys() {
        let id = unique_id();
        let mut writer = SegmentWriter::create(id.clone(), 64, Backend::Mapped).unwrap();
        let mut reader = SegmentReader::attach(id.clone(), 64, Backend::Mapped).unwrap();

        reader.close();
        reader.close();
        assert!(!reader.is_opened());
        assert!(matches!(reader.read_at(0, &mut [0u8; 4]), Err(ShmError::NotOpen)));

        writer.close();
        writer.close();
        assert!(!writer.is_opened());

        // Name is free again once the writer destroyed it
        let again = SegmentWriter::create(id, 64, Backend::Mapped);
        assert!(again.is_ok());
    }

    #[test]
    fn test_segment_id_parse() {
        let full = SegmentId::parse("audioSharing_1042").unwrap();
        let bare = SegmentId::parse("1042").unwrap();
        assert_eq!(full, bare);
        assert_eq!(full.key(), 1042);
        assert_eq!(full.name(), "audioSharing_1042");
        assert_eq!(full.posix_path(), "/audioSharing_1042");

        assert!(SegmentId::parse("audioSharing_x").is_err());
        assert!(SegmentId::parse("").is_err());
        assert!(SegmentId::parse("-4").is_err());

        assert!(full.is_canonical());
        assert!(unique_id().is_canonical());
        assert!(!SegmentId::new("audioSharing_01042", 1042).is_canonical());
        assert!(!SegmentId::new("other", 1042).is_canonical());
    }
}
