//! Requests built by the client on behalf of consumers.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use kernelmux_wire::RawMessage;
use serde_json::{json, Map, Value};

use crate::error::Result;

/// A request to send to the kernel. The client fills in the header.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub msg_type: String,
    pub content: Value,
    pub metadata: Map<String, Value>,
    pub buffers: Vec<Bytes>,
}

impl Request {
    pub fn new(msg_type: impl Into<String>, content: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            content,
            metadata: Map::new(),
            buffers: Vec::new(),
        }
    }

    /// `execute_request` for `code` with the usual defaults.
    pub fn execute(code: impl Into<String>) -> Self {
        Self::new(
            "execute_request",
            json!({
                "code": code.into(),
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
    }

    pub fn kernel_info() -> Self {
        Self::new("kernel_info_request", json!({}))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_buffer(mut self, buffer: impl Into<Bytes>) -> Self {
        self.buffers.push(buffer.into());
        self
    }

    /// Serialize with a complete header.
    ///
    /// Execute requests issued for a cell also carry the cell id in
    /// `metadata.cellId`, unless the caller already set one.
    pub(crate) fn into_message(
        mut self,
        msg_id: &str,
        cell_id: Option<&str>,
        session: &Session,
    ) -> Result<RawMessage> {
        if let Some(cell) = cell_id {
            if self.msg_type == "execute_request" && !self.metadata.contains_key("cellId") {
                self.metadata
                    .insert("cellId".into(), Value::String(cell.to_string()));
            }
        }
        let header = session.header(msg_id, &self.msg_type);
        let message = RawMessage::from_sections(
            &header,
            &json!({}),
            &Value::Object(self.metadata),
            &self.content,
            self.buffers,
        )?;
        Ok(message)
    }
}

/// Identity stamped onto every request from one client.
#[derive(Debug)]
pub struct Session {
    id: String,
    username: String,
    version: String,
    counter: AtomicU64,
}

impl Session {
    pub fn new(username: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            username: username.into(),
            version: version.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next base id: `{session}_{counter}`. Unique for the life of the client.
    pub fn next_base_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{n}", self.id)
    }

    pub(crate) fn header(&self, msg_id: &str, msg_type: &str) -> Value {
        json!({
            "msg_id": msg_id,
            "msg_type": msg_type,
            "session": self.id,
            "username": self.username,
            "version": self.version,
        })
    }
}
