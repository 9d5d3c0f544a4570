//! Error types for the audio sharing library

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device and output stream errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Shared memory segment errors
#[derive(Error, Debug)]
pub enum ShmError {
    #[error("Segment already exists: {0}")]
    AlreadyExists(String),

    #[error("Segment not found: {0}")]
    NotFound(String),

    #[error("Segment {name} is {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid segment size: {0}")]
    InvalidSize(usize),

    #[error("Invalid segment name: {0}")]
    InvalidName(String),

    #[error("Access out of bounds: offset {offset} + len {len} > size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("No free key in range {start}..{end}")]
    KeysExhausted { start: i32, end: i32 },

    #[error("Segment is not open")]
    NotOpen,

    #[error("Shared memory is not supported on this platform")]
    Unsupported,

    #[error("OS error on {segment}: {reason}")]
    Os { segment: String, reason: String },
}

/// Announcement and control message codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of packet")]
    UnexpectedEof,

    #[error("Invalid address pattern: {0}")]
    InvalidAddress(String),

    #[error("Unexpected address: {0}")]
    UnexpectedAddress(String),

    #[error("Missing type tag string")]
    MissingTypeTags,

    #[error("Unsupported type tag: {0}")]
    UnsupportedTag(char),

    #[error("Argument {index}: expected {expected}, found {found}")]
    ArgumentType {
        index: usize,
        expected: char,
        found: char,
    },

    #[error("Expected {expected} arguments, found {found}")]
    ArgumentCount { expected: usize, found: usize },

    #[error("String is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: i64 },

    #[error("Invalid segment name: {0}")]
    InvalidSegment(String),

    #[error("Invalid stream format: {0}")]
    InvalidFormat(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("No free port in range {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Socket option failed: {0}")]
    SocketOption(String),

    #[error("Peer return address unknown")]
    NoReturnAddress,
}

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Invalid stream format: {0}")]
    InvalidFormat(String),

    #[error("Failed to attach to {name}: {source}")]
    AttachFailed {
        name: String,
        #[source]
        source: ShmError,
    },

    #[error("Failed to spawn polling thread: {0}")]
    SpawnFailed(String),

    #[error("Connection not found: {0}")]
    NotFound(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
