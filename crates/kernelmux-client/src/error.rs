use std::time::Duration;

use kernelmux_wire::{Channel, WireError};

/// Errors surfaced by kernel clients.
///
/// `Clone` so a single connection failure can be reported to every caller
/// waiting on the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Both an inclusion and an exclusion filter were supplied.
    #[error("msg_types and exclude_msg_types are mutually exclusive")]
    FilterConflict,

    /// Requests cannot be sent on this channel.
    #[error("cannot send requests on channel {0}")]
    InvalidChannel(Channel),

    /// The cell id would not survive a routing id round trip.
    #[error("invalid cell id '{0}': must not contain '#'")]
    InvalidCellId(String),

    /// The outbound queue is at capacity.
    #[error("outbound queue full ({capacity} messages)")]
    QueueFull { capacity: usize },

    /// The kernel did not answer the readiness probe in time.
    #[error("kernel did not become ready within {0:?}")]
    ProbeTimeout(Duration),

    /// The byte stream to the kernel failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message could not be built or rewritten.
    #[error("message error: {0}")]
    Message(String),

    /// The connection attempt was abandoned by an explicit disconnect.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The client has been torn down.
    #[error("kernel client is shut down")]
    Closed,

    /// No client is registered under this kernel id.
    #[error("no client registered for kernel '{0}'")]
    UnknownKernel(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::InvalidCellId(cell) => Self::InvalidCellId(cell),
            WireError::MalformedHeader(reason) => Self::Message(reason),
            other => Self::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
