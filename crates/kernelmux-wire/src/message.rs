//! Multipart kernel messages.
//!
//! A kernel message is an ordered list of byte parts:
//! `[header, parent_header, metadata, content, buffers...]`. The routing
//! engine only ever inspects the header parts (and the content of `status`
//! messages); everything else is carried through untouched.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::channel::Channel;
use crate::error::{Result, WireError};
use crate::msg_id;

/// Index of the header part.
pub const HEADER: usize = 0;
/// Index of the parent header part.
pub const PARENT_HEADER: usize = 1;
/// Index of the metadata part.
pub const METADATA: usize = 2;
/// Index of the content part.
pub const CONTENT: usize = 3;

/// Header fields the routing engine reads.
///
/// Missing fields decode as empty strings; an empty parent header (`{}`)
/// therefore has an empty `msg_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HeaderFields {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: String,
}

/// An opaque multipart kernel message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    parts: Vec<Bytes>,
}

impl RawMessage {
    /// Wrap already-serialized parts.
    pub fn new(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }

    /// Serialize a message from JSON sections plus binary buffers.
    pub fn from_sections(
        header: &Value,
        parent_header: &Value,
        metadata: &Value,
        content: &Value,
        buffers: impl IntoIterator<Item = Bytes>,
    ) -> Result<Self> {
        let mut parts = Vec::with_capacity(4);
        for section in [header, parent_header, metadata, content] {
            let bytes = serde_json::to_vec(section)
                .map_err(|e| WireError::MalformedHeader(e.to_string()))?;
            parts.push(Bytes::from(bytes));
        }
        parts.extend(buffers);
        Ok(Self { parts })
    }

    /// All parts, in wire order.
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Consume the message and return its parts.
    pub fn into_parts(self) -> Vec<Bytes> {
        self.parts
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the message has no parts at all.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Total size of all parts in bytes.
    pub fn byte_len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    /// Parse the header fields. `None` when the header is missing or not JSON.
    pub fn header(&self) -> Option<HeaderFields> {
        parse_fields(self.parts.get(HEADER)?)
    }

    /// Parse the parent header fields.
    pub fn parent_header(&self) -> Option<HeaderFields> {
        parse_fields(self.parts.get(PARENT_HEADER)?)
    }

    /// The header `msg_id`, if present and non-empty.
    pub fn msg_id(&self) -> Option<String> {
        self.header()
            .map(|h| h.msg_id)
            .filter(|id| !id.is_empty())
    }

    /// The header `msg_type`, if present and non-empty.
    pub fn msg_type(&self) -> Option<String> {
        self.header()
            .map(|h| h.msg_type)
            .filter(|t| !t.is_empty())
    }

    /// The parent header `msg_id`, if present and non-empty.
    pub fn parent_msg_id(&self) -> Option<String> {
        self.parent_header()
            .map(|h| h.msg_id)
            .filter(|id| !id.is_empty())
    }

    /// `execution_state` from the content of a `status` message.
    pub fn status_execution_state(&self) -> Option<String> {
        let content = self.parts.get(CONTENT)?;
        serde_json::from_slice::<StatusContent>(content)
            .ok()
            .map(|c| c.execution_state)
    }

    /// Return a copy whose header `msg_id` is replaced by `msg_id`.
    ///
    /// Only the header part is re-serialized; every other part is shared.
    pub fn with_msg_id(&self, msg_id: &str) -> Result<Self> {
        let header = self
            .parts
            .get(HEADER)
            .ok_or_else(|| WireError::MalformedHeader("message has no header part".into()))?;
        let mut map = parse_map(header)?;
        map.insert("msg_id".into(), Value::String(msg_id.to_string()));

        let mut parts = self.parts.clone();
        if let Some(slot) = parts.get_mut(HEADER) {
            *slot = serialize_map(&map)?;
        }
        Ok(Self { parts })
    }

    /// Stamp routing metadata onto the existing header `msg_id`.
    ///
    /// A recognised channel prefix is kept as is, and so is an existing
    /// `#cell` suffix, so stamping twice never double-encodes.
    pub fn with_routing(&self, channel: Channel, cell_id: Option<&str>) -> Result<Self> {
        let current = self.msg_id().ok_or_else(|| {
            WireError::MalformedHeader("message header has no msg_id".into())
        })?;

        let mut id = if msg_id::is_encoded(&current) {
            current
        } else {
            format!("{channel}{}{current}", msg_id::CHANNEL_SEPARATOR)
        };
        if let Some(cell) = cell_id {
            msg_id::validate_cell_id(cell)?;
            if !id.contains(msg_id::CELL_SEPARATOR) {
                id.push(msg_id::CELL_SEPARATOR);
                id.push_str(cell);
            }
        }
        self.with_msg_id(&id)
    }

    /// Return a copy with routing metadata removed from the header and
    /// parent header ids. Malformed messages come back unchanged.
    pub fn strip_routing(&self) -> Self {
        match self.try_strip_routing() {
            Ok(stripped) => stripped,
            Err(err) => {
                debug!(error = %err, "leaving routing metadata on malformed message");
                self.clone()
            }
        }
    }

    fn try_strip_routing(&self) -> Result<Self> {
        let mut parts = self.parts.clone();
        for index in [HEADER, PARENT_HEADER] {
            let Some(part) = parts.get_mut(index) else {
                continue;
            };
            let mut map = parse_map(part)?;
            let base = match map.get("msg_id") {
                Some(Value::String(id)) if msg_id::is_encoded(id) => msg_id::strip(id).to_string(),
                _ => continue,
            };
            map.insert("msg_id".into(), Value::String(base));
            *part = serialize_map(&map)?;
        }
        Ok(Self { parts })
    }
}

impl From<Vec<Bytes>> for RawMessage {
    fn from(parts: Vec<Bytes>) -> Self {
        Self::new(parts)
    }
}

fn parse_fields(part: &Bytes) -> Option<HeaderFields> {
    serde_json::from_slice(part).ok()
}

fn parse_map(part: &Bytes) -> Result<Map<String, Value>> {
    serde_json::from_slice(part).map_err(|e| WireError::MalformedHeader(e.to_string()))
}

fn serialize_map(map: &Map<String, Value>) -> Result<Bytes> {
    serde_json::to_vec(map)
        .map(Bytes::from)
        .map_err(|e| WireError::MalformedHeader(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(msg_id: &str, parent_id: Option<&str>) -> RawMessage {
        let parent = match parent_id {
            Some(id) => json!({ "msg_id": id, "msg_type": "execute_request" }),
            None => json!({}),
        };
        RawMessage::from_sections(
            &json!({ "msg_id": msg_id, "msg_type": "execute_reply", "session": "s" }),
            &parent,
            &json!({}),
            &json!({ "status": "ok" }),
            [Bytes::from_static(b"\x00\x01binary")],
        )
        .unwrap()
    }

    #[test]
    fn reads_header_fields() {
        let msg = message("shell:s_1#c1", Some("shell:s_0"));
        assert_eq!(msg.len(), 5);
        assert_eq!(msg.msg_id().as_deref(), Some("shell:s_1#c1"));
        assert_eq!(msg.msg_type().as_deref(), Some("execute_reply"));
        assert_eq!(msg.parent_msg_id().as_deref(), Some("shell:s_0"));
        assert_eq!(msg.header().unwrap().session, "s");
    }

    #[test]
    fn empty_parent_has_no_id() {
        let msg = message("a", None);
        assert_eq!(msg.parent_msg_id(), None);
    }

    #[test]
    fn malformed_header_reads_as_none() {
        let msg = RawMessage::new(vec![Bytes::from_static(b"not json")]);
        assert!(msg.header().is_none());
        assert!(msg.msg_type().is_none());
        assert!(msg.parent_msg_id().is_none());
        assert!(RawMessage::default().header().is_none());
    }

    #[test]
    fn status_execution_state() {
        let msg = RawMessage::from_sections(
            &json!({ "msg_id": "k1", "msg_type": "status" }),
            &json!({}),
            &json!({}),
            &json!({ "execution_state": "busy" }),
            [],
        )
        .unwrap();
        assert_eq!(msg.status_execution_state().as_deref(), Some("busy"));
        assert_eq!(message("a", None).status_execution_state(), None);
    }

    #[test]
    fn with_routing_encodes_once() {
        let msg = message("abc", None);
        let routed = msg.with_routing(Channel::Shell, Some("cell-1")).unwrap();
        assert_eq!(routed.msg_id().as_deref(), Some("shell:abc#cell-1"));

        let again = routed.with_routing(Channel::Control, Some("cell-2")).unwrap();
        assert_eq!(again.msg_id().as_deref(), Some("shell:abc#cell-1"));

        let legacy_cell = message("abc#c0", None)
            .with_routing(Channel::Stdin, Some("c9"))
            .unwrap();
        assert_eq!(legacy_cell.msg_id().as_deref(), Some("stdin:abc#c0"));
    }

    #[test]
    fn with_routing_preserves_payload_parts() {
        let msg = message("abc", None);
        let routed = msg.with_routing(Channel::Shell, None).unwrap();
        assert_eq!(routed.parts()[1..], msg.parts()[1..]);
    }

    #[test]
    fn with_routing_rejects_bad_cell_and_missing_id() {
        let msg = message("abc", None);
        assert!(matches!(
            msg.with_routing(Channel::Shell, Some("a#b")),
            Err(WireError::InvalidCellId(_))
        ));
        let no_id = RawMessage::from_sections(&json!({}), &json!({}), &json!({}), &json!({}), [])
            .unwrap();
        assert!(matches!(
            no_id.with_routing(Channel::Shell, None),
            Err(WireError::MalformedHeader(_))
        ));
    }

    #[test]
    fn strip_routing_restores_consumer_ids() {
        let msg = message("shell:s_2#c1", Some("shell:abc#c1"));
        let stripped = msg.strip_routing();
        assert_eq!(stripped.msg_id().as_deref(), Some("s_2"));
        assert_eq!(stripped.parent_msg_id().as_deref(), Some("abc"));
        assert_eq!(stripped.parts()[2..], msg.parts()[2..]);
    }

    #[test]
    fn strip_routing_leaves_malformed_messages_alone() {
        let msg = RawMessage::new(vec![
            Bytes::from_static(b"{\"msg_id\":\"shell:a\"}"),
            Bytes::from_static(b"garbage"),
        ]);
        assert_eq!(msg.strip_routing(), msg);
    }
}
