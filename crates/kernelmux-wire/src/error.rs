use std::path::PathBuf;

/// Errors raised by the wire layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4B4D \"KM\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame names a channel outside the kernel channel set.
    #[error("unknown channel id {0}")]
    UnknownChannelId(u16),

    /// A channel name could not be parsed.
    #[error("unknown channel name '{0}'")]
    UnknownChannel(String),

    /// The payload does not hold a well-formed list of message parts.
    #[error("malformed message parts: {0}")]
    MalformedParts(String),

    /// The message header could not be read or rewritten.
    #[error("malformed message header: {0}")]
    MalformedHeader(String),

    /// A cell identifier would not survive a routing id round trip.
    #[error("invalid cell id '{0}': must not contain '#'")]
    InvalidCellId(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// Failed to bind to the specified socket path.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified socket path.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, WireError>;
