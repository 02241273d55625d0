//! Kernel messaging channels.
//!
//! The set is closed: every kernel connection carries exactly these five
//! logical streams. Each has a wire id (used in frame headers) and a name
//! (used as the routing id prefix).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// A logical kernel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Requests and replies for code execution and introspection.
    Shell,
    /// Out-of-band requests (interrupt, shutdown, debug).
    Control,
    /// Broadcast side effects: status, streams, display data.
    Iopub,
    /// Input requests from the kernel to the frontend.
    Stdin,
    /// Liveness pings. Never routed to listeners.
    #[serde(rename = "hb", alias = "heartbeat")]
    Heartbeat,
}

impl Channel {
    /// Every channel, ordered by wire id.
    pub const ALL: [Channel; 5] = [
        Channel::Shell,
        Channel::Control,
        Channel::Iopub,
        Channel::Stdin,
        Channel::Heartbeat,
    ];

    /// Wire id carried in the frame header.
    pub const fn id(self) -> u16 {
        match self {
            Channel::Shell => 0,
            Channel::Control => 1,
            Channel::Iopub => 2,
            Channel::Stdin => 3,
            Channel::Heartbeat => 4,
        }
    }

    /// Resolve a wire id.
    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.get(usize::from(id)).copied()
    }

    /// Name used in routing ids and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Control => "control",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Heartbeat => "hb",
        }
    }

    /// Resolve a channel name. Both `hb` and `heartbeat` name the heartbeat channel.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "shell" => Some(Channel::Shell),
            "control" => Some(Channel::Control),
            "iopub" => Some(Channel::Iopub),
            "stdin" => Some(Channel::Stdin),
            "hb" | "heartbeat" => Some(Channel::Heartbeat),
            _ => None,
        }
    }

    /// Whether consumers may send requests on this channel.
    pub const fn accepts_requests(self) -> bool {
        matches!(self, Channel::Shell | Channel::Control | Channel::Stdin)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| WireError::UnknownChannel(s.to_string()))
    }
}
