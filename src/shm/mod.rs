//! Shared memory transport
//!
//! Named fixed-size regions with whole-region and offset/length copies.
//! Two backends sit behind the same handles: a contiguous POSIX mapping and
//! a page-per-segment System V mapping.

mod pages;
#[cfg(unix)]
mod paged;
#[cfg(unix)]
mod posix;
pub mod segment;

pub use segment::{Backend, Segment, SegmentId, SegmentReader, SegmentWriter};

#[cfg(test)]
pub(crate) use segment::test_support;
