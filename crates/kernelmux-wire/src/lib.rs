//! Wire layer for shared kernel connections.
//!
//! A kernel connection carries five logical channels over one byte stream.
//! Every frame on that stream is:
//! - A 2-byte magic number ("KM") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian channel ID
//!
//! The payload holds the multipart kernel message. Routing metadata travels
//! inside the header `msg_id` (see [`msg_id`]), so replies can be attributed
//! to a channel and a cell without any side table.

pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod msg_id;
#[cfg(unix)]
pub mod transport;

pub use channel::Channel;
pub use codec::{
    decode_frame, encode_frame, Envelope, KernelCodec, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC,
};
pub use error::{Result, WireError};
pub use message::{HeaderFields, RawMessage};
pub use msg_id::RoutingId;
#[cfg(unix)]
pub use transport::SocketListener;
