//! # Shared Audio Bus
//!
//! Low-latency multichannel audio sharing between processes. Samples never
//! pass through a server: a producer publishes a ring of buffers in named
//! shared memory and announces it over UDP, consumers attach directly.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── PRODUCER ─────────────────────────────┐
//! │  app writes slot ──► RingWriter ──► SegmentWriter (audioSharing_N)│
//! │                                                                   │
//! │  tick() ──► Announcement "/memorySharing" ──► UDP :2020           │
//! │  control socket :2021.. ◄── "port:<n>" / commands                 │
//! └───────────────────────────────┬───────────────────────────────────┘
//!            shared memory        │ UDP announce (every ~100ms)
//!   ┌─────────────────────────────┼─────────────────────────────────┐
//!   │ [idx|pub|rsvd|slot 0|..]    │                                 │
//!   └─────────────────────────────┼─────────────────────────────────┘
//!                                 ▼
//! ┌──────────────────────────── CONSUMER ─────────────────────────────┐
//! │  DiscoveryRegistry (receive thread + sweep)                       │
//! │     name ──► PeerConnection                                       │
//! │               ┌──────────────────────────────────────────────┐    │
//! │               │ polling thread:                              │    │
//! │               │  RingReader ─► Resampler (per ch) ─► queue   │    │
//! │               └──────────────────────────────────────────────┘    │
//! │  audio callback ──► try_pop_sample() (never blocks)               │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod peers;
pub mod protocol;
pub mod shm;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Well-known UDP port producers announce to
    pub const DEFAULT_DISCOVERY_PORT: u16 = 2020;

    /// OSC address of the discovery announcement
    pub const ANNOUNCE_ADDRESS: &str = "/memorySharing";

    /// Prefix of shared memory segment names
    pub const SEGMENT_NAME_PREFIX: &str = "audioSharing_";

    /// First segment key probed by a producer
    pub const DEFAULT_KEY_START: i32 = 1000;

    /// End (exclusive) of the probed key range
    pub const DEFAULT_KEY_END: i32 = 5000;

    /// Number of control ports probed above the discovery port
    pub const DEFAULT_CONTROL_PORT_SPAN: u16 = 1000;

    /// Default frames per ring slot
    pub const DEFAULT_FRAMES_PER_BUFFER: u32 = 512;

    /// Default producer sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default number of ring slots
    pub const DEFAULT_RING_SLOT_COUNT: u32 = 2;

    /// Default consumer queue depth in samples
    pub const DEFAULT_TARGET_QUEUE_DEPTH: usize = 512;

    /// Default overflow multiplier for queue resets
    pub const DEFAULT_OVERFLOW_MULTIPLIER: usize = 2;

    /// Default announce interval in milliseconds
    pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 100;

    /// Peer is evicted after this long without an announcement
    pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 1000;

    /// Sleep between polls when no new frame is available
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1;

    /// Time a polling thread gets to observe its stop flag
    pub const DEFAULT_CLOSE_GRACE_MS: u64 = 50;

    /// Maximum channels per stream
    pub const MAX_CHANNELS: u16 = 64;

    /// Maximum frames per ring slot
    pub const MAX_FRAMES_PER_BUFFER: u32 = 16384;

    /// Maximum ring slots
    pub const MAX_RING_SLOTS: u32 = 64;

    /// Maximum discovery datagram size
    pub const MAX_PACKET_SIZE: usize = 2048;

    /// Default HTTP port for the status API
    pub const DEFAULT_HTTP_PORT: u16 = 8080;
}
