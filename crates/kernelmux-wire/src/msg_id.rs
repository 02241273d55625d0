//! Routing identifiers.
//!
//! Outgoing request ids carry the channel they were sent on and, optionally,
//! the cell that issued them:
//!
//! ```text
//! channel:base_id#cell_id
//! channel:base_id
//! base_id                    (legacy, no routing metadata)
//! ```
//!
//! Kernels copy the request header into `parent_header` of every reply and
//! side effect, so decoding a parent id recovers the origin of a message
//! without keeping any per-request state.

use crate::channel::Channel;
use crate::error::{Result, WireError};

/// Separates the channel prefix from the base id.
pub const CHANNEL_SEPARATOR: char = ':';

/// Separates the base id from the cell id.
pub const CELL_SEPARATOR: char = '#';

/// A decoded routing identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingId {
    /// Channel the request was sent on; `None` for legacy ids.
    pub channel: Option<Channel>,
    /// Identifier without routing metadata.
    pub base_id: String,
    /// Issuing cell, if any.
    pub cell_id: Option<String>,
}

impl RoutingId {
    fn legacy(id: &str) -> Self {
        Self {
            channel: None,
            base_id: id.to_string(),
            cell_id: None,
        }
    }

    /// Re-encode this id. Legacy ids come back unchanged.
    pub fn encode(&self) -> String {
        match self.channel {
            Some(channel) => encode(channel, &self.base_id, self.cell_id.as_deref()),
            None => self.base_id.clone(),
        }
    }
}

/// Encode routing metadata into a message id.
///
/// `base_id` must not contain `#`; ids minted by the client never do.
/// Use [`validate_cell_id`] before encoding a consumer-supplied cell id.
pub fn encode(channel: Channel, base_id: &str, cell_id: Option<&str>) -> String {
    match cell_id {
        Some(cell) => format!("{channel}{CHANNEL_SEPARATOR}{base_id}{CELL_SEPARATOR}{cell}"),
        None => format!("{channel}{CHANNEL_SEPARATOR}{base_id}"),
    }
}

/// Decode a message id.
///
/// Total: any string decodes. Ids without a recognised channel prefix are
/// treated as legacy ids with no channel and no cell.
pub fn decode(id: &str) -> RoutingId {
    let Some((prefix, rest)) = id.split_once(CHANNEL_SEPARATOR) else {
        return RoutingId::legacy(id);
    };
    let Some(channel) = Channel::from_name(prefix) else {
        return RoutingId::legacy(id);
    };

    match rest.rsplit_once(CELL_SEPARATOR) {
        Some((base, cell)) => RoutingId {
            channel: Some(channel),
            base_id: base.to_string(),
            cell_id: Some(cell.to_string()),
        },
        None => RoutingId {
            channel: Some(channel),
            base_id: rest.to_string(),
            cell_id: None,
        },
    }
}

/// Reject cell ids that would not survive a round trip.
pub fn validate_cell_id(cell_id: &str) -> Result<()> {
    if cell_id.contains(CELL_SEPARATOR) {
        return Err(WireError::InvalidCellId(cell_id.to_string()));
    }
    Ok(())
}

/// Whether `id` already carries a recognised channel prefix.
pub fn is_encoded(id: &str) -> bool {
    id.split_once(CHANNEL_SEPARATOR)
        .is_some_and(|(prefix, _)| Channel::from_name(prefix).is_some())
}

/// The base id of `id`, borrowed from the input.
pub fn strip(id: &str) -> &str {
    let Some((prefix, rest)) = id.split_once(CHANNEL_SEPARATOR) else {
        return id;
    };
    if Channel::from_name(prefix).is_none() {
        return id;
    }
    match rest.rsplit_once(CELL_SEPARATOR) {
        Some((base, _)) => base,
        None => rest,
    }
}
