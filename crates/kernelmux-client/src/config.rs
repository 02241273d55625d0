use std::path::Path;
use std::time::Duration;

use kernelmux_wire::{Channel, DEFAULT_MAX_PAYLOAD};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Kernel client configuration.
///
/// Durations are in milliseconds so the structure maps one-to-one onto a
/// JSON config file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Give up on the readiness probe after this long.
    pub probe_timeout_ms: u64,
    /// Resend the readiness probe at this interval until it is answered.
    pub probe_retry_interval_ms: u64,
    /// Heartbeat ping interval once ready. `None` disables liveness checks.
    pub heartbeat_interval_ms: Option<u64>,
    /// Hard bound on requests waiting for the connection to become ready.
    pub queue_capacity: usize,
    /// Queue depth that triggers a warning and the queue observer.
    pub queue_high_water_mark: usize,
    /// Maximum frame payload accepted from or sent to the kernel.
    pub max_payload_size: usize,
    /// `username` placed in request headers.
    pub username: String,
    /// Messaging protocol version placed in request headers.
    pub protocol_version: String,
    /// Default listener filter, applied by `add_listener_with_config`.
    pub filters: FilterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 30_000,
            probe_retry_interval_ms: 2_000,
            heartbeat_interval_ms: Some(5_000),
            queue_capacity: 1000,
            queue_high_water_mark: 256,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            username: "kernelmux".to_string(),
            protocol_version: "5.3".to_string(),
            filters: FilterConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.probe_timeout_ms == 0 {
            return Err(ClientError::Config(
                "probe_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.probe_retry_interval_ms == 0 {
            return Err(ClientError::Config(
                "probe_retry_interval_ms must be greater than zero".into(),
            ));
        }
        if self.heartbeat_interval_ms == Some(0) {
            return Err(ClientError::Config(
                "heartbeat_interval_ms must be greater than zero when set".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ClientError::Config(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.queue_high_water_mark > self.queue_capacity {
            return Err(ClientError::Config(format!(
                "queue_high_water_mark ({}) exceeds queue_capacity ({})",
                self.queue_high_water_mark, self.queue_capacity
            )));
        }
        self.filters.validate()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_retry_interval(&self) -> Duration {
        Duration::from_millis(self.probe_retry_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }
}

/// Process-level listener filter.
///
/// Pairs are `[msg_type, channel]`, e.g. `["status", "iopub"]`. At most one
/// of the two lists may be non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    pub msg_types: Vec<(String, Channel)>,
    pub exclude_msg_types: Vec<(String, Channel)>,
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.msg_types.is_empty() && !self.exclude_msg_types.is_empty() {
            return Err(ClientError::FilterConflict);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.probe_timeout(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{ "probe_timeout_ms": 500, "heartbeat_interval_ms": null,
                 "filters": { "exclude_msg_types": [["status", "iopub"]] } }"#,
        )
        .unwrap();
        assert_eq!(config.probe_timeout_ms, 500);
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(
            config.filters.exclude_msg_types,
            vec![("status".to_string(), Channel::Iopub)]
        );
    }

    #[test]
    fn conflicting_filters_rejected() {
        let result = ClientConfig::from_json_str(
            r#"{ "filters": { "msg_types": [["stream", "iopub"]],
                              "exclude_msg_types": [["status", "iopub"]] } }"#,
        );
        assert_eq!(result, Err(ClientError::FilterConflict));
    }

    #[test]
    fn invalid_values_rejected() {
        for raw in [
            r#"{ "probe_timeout_ms": 0 }"#,
            r#"{ "queue_capacity": 0 }"#,
            r#"{ "queue_capacity": 10, "queue_high_water_mark": 11 }"#,
            r#"{ "heartbeat_interval_ms": 0 }"#,
            r#"{ "unknown_field": true }"#,
            r#"{ "filters": { "msg_types": [["status", "stdout"]] } }"#,
        ] {
            assert!(
                matches!(ClientConfig::from_json_str(raw), Err(ClientError::Config(_))),
                "{raw}"
            );
        }
    }
}
