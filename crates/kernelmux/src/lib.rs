//! Share one kernel connection between many consumers.
//!
//! kernelmux keeps a single long-lived connection to a compute kernel and
//! routes traffic for any number of independent consumers over it. Routing
//! metadata (originating channel and cell) rides inside each request's
//! `msg_id`, so replies find their way back without a lookup table.
//!
//! # Crate Structure
//!
//! - [`wire`]: channels, routing ids, raw messages and the frame codec
//! - [`client`]: the shared kernel client, listeners, queueing and the
//!   client registry (behind the `client` feature, on by default)

/// Re-export wire types.
pub mod wire {
    pub use kernelmux_wire::*;
}

/// Re-export client types (requires `client` feature).
#[cfg(feature = "client")]
pub mod client {
    pub use kernelmux_client::*;
}
