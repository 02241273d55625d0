//! Connection and execution state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use kernelmux_wire::{msg_id, Channel, RawMessage};
use serde::Serialize;
use tracing::{debug, trace};

/// Lifecycle of the byte stream to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Error,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the kernel last reported about code execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ExecutionState {
    Unknown = 0,
    Starting = 1,
    Idle = 2,
    Busy = 3,
    /// The client has been torn down.
    Dead = 4,
}

impl ExecutionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Unknown => "unknown",
            ExecutionState::Starting => "starting",
            ExecutionState::Idle => "idle",
            ExecutionState::Busy => "busy",
            ExecutionState::Dead => "dead",
        }
    }

    /// Parse the `execution_state` of a kernel status message.
    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(ExecutionState::Starting),
            "idle" => Some(ExecutionState::Idle),
            "busy" => Some(ExecutionState::Busy),
            _ => None,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ExecutionState::Starting,
            2 => ExecutionState::Idle,
            3 => ExecutionState::Busy,
            4 => ExecutionState::Dead,
            _ => ExecutionState::Unknown,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamps of kernel activity observed through status messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    /// Last status parented by a shell request.
    pub last_shell_status: Option<SystemTime>,
    /// Last status parented by a control request.
    pub last_control_status: Option<SystemTime>,
    /// Last time the kernel did work on behalf of a shell request.
    pub last_activity: Option<SystemTime>,
}

/// Derives the kernel execution state from iopub `status` messages.
///
/// Only statuses parented by a shell request move the state between idle and
/// busy; control requests (interrupts, debugger traffic) also produce status
/// messages and must not make a running cell look idle. A `starting` status
/// with no parent msg_id is a restart announcement and is always accepted.
#[derive(Debug)]
pub struct ExecutionStateTracker {
    state: AtomicU8,
    activity: Mutex<Activity>,
}

impl Default for ExecutionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStateTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ExecutionState::Unknown as u8),
            activity: Mutex::new(Activity::default()),
        }
    }

    /// Current execution state.
    pub fn get(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ExecutionState) -> ExecutionState {
        ExecutionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// Observe an inbound message. Returns the new state if it changed.
    ///
    /// Never fails: anything unreadable leaves the state untouched.
    pub fn on_message(&self, channel: Channel, message: &RawMessage) -> Option<ExecutionState> {
        if channel != Channel::Iopub {
            return None;
        }
        let header = message.header()?;
        if header.msg_type != "status" {
            return None;
        }
        let Some(raw_state) = message.status_execution_state() else {
            debug!(msg_id = %header.msg_id, "status message without readable execution_state");
            return None;
        };
        let Some(state) = ExecutionState::from_status(&raw_state) else {
            debug!(execution_state = %raw_state, "ignoring unrecognised execution_state");
            return None;
        };

        let parent_id = message.parent_msg_id();
        let parent_channel = parent_id
            .as_deref()
            .and_then(|id| msg_id::decode(id).channel);
        self.record_activity(parent_channel);

        let restart_announcement = state == ExecutionState::Starting && parent_id.is_none();
        if !restart_announcement && parent_channel != Some(Channel::Shell) {
            trace!(
                ?parent_channel,
                execution_state = %state,
                "ignoring status not parented by a shell request"
            );
            return None;
        }

        let previous = self.set(state);
        if previous == state {
            return None;
        }
        debug!(from = %previous, to = %state, "execution state changed");
        Some(state)
    }

    /// Snapshot of activity timestamps.
    pub fn activity(&self) -> Activity {
        *self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget activity timestamps, e.g. after a kernel restart.
    pub fn reset_activity(&self) {
        *self.activity.lock().unwrap_or_else(PoisonError::into_inner) = Activity::default();
    }

    fn record_activity(&self, parent_channel: Option<Channel>) {
        let now = SystemTime::now();
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        match parent_channel {
            Some(Channel::Shell) => {
                activity.last_shell_status = Some(now);
                activity.last_activity = Some(now);
            }
            Some(Channel::Control) => activity.last_control_status = Some(now),
            _ => {}
        }
    }
}
