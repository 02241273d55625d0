#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kernelmux_client::{ClientConfig, KernelClient, Listener, ListenerResult, StubKernel};
use kernelmux_wire::{Channel, RawMessage};

pub const WAIT: Duration = Duration::from_secs(3);

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        probe_timeout_ms: 2_000,
        probe_retry_interval_ms: 100,
        heartbeat_interval_ms: None,
        ..ClientConfig::default()
    }
}

pub fn no_keys() -> Vec<(String, Channel)> {
    Vec::new()
}

pub fn spawn_client(stub: &StubKernel, config: ClientConfig) -> KernelClient {
    KernelClient::spawn("k1", stub.connector(), config).expect("client should spawn")
}

pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Listener that keeps everything it is given.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<(Channel, RawMessage)>>,
}

impl Listener for Recorder {
    fn on_message(&self, channel: Channel, message: &RawMessage) -> ListenerResult {
        self.seen.lock().unwrap().push((channel, message.clone()));
        Ok(())
    }
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<(Channel, RawMessage)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<(String, Channel)> {
        self.seen()
            .into_iter()
            .map(|(channel, message)| (message.msg_type().unwrap_or_default(), channel))
            .collect()
    }

    pub fn find(&self, msg_type: &str, channel: Channel) -> Option<RawMessage> {
        self.seen()
            .into_iter()
            .find(|(c, m)| *c == channel && m.msg_type().as_deref() == Some(msg_type))
            .map(|(_, m)| m)
    }

    pub async fn wait_for(&self, msg_type: &str, channel: Channel) -> RawMessage {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(message) = self.find(msg_type, channel) {
                return message;
            }
            if Instant::now() >= deadline {
                panic!("no {msg_type} on {channel} within {WAIT:?}; saw {:?}", self.keys());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
