use std::fmt;
use std::io;

use kernelmux_client::ClientError;
use kernelmux_wire::WireError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn wire_error(context: &str, err: WireError) -> CliError {
    match err {
        WireError::Bind { source, .. } | WireError::Connect { source, .. } | WireError::Io(source) => {
            io_error(context, source)
        }
        WireError::PathTooLong { .. } | WireError::InvalidCellId(_) | WireError::UnknownChannel(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        WireError::ConnectionClosed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn client_error(context: &str, err: ClientError) -> CliError {
    let code = match &err {
        ClientError::ProbeTimeout(_) => TIMEOUT,
        ClientError::Transport(_) => TRANSPORT_ERROR,
        ClientError::FilterConflict
        | ClientError::InvalidChannel(_)
        | ClientError::InvalidCellId(_)
        | ClientError::Config(_) => USAGE,
        ClientError::Message(_) => DATA_INVALID,
        ClientError::QueueFull { .. }
        | ClientError::Disconnected(_)
        | ClientError::Closed
        | ClientError::UnknownKernel(_) => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn probe_timeout_maps_to_timeout_code() {
        let err = client_error("connect failed", ClientError::ProbeTimeout(Duration::from_secs(1)));
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn bad_cell_is_a_usage_error() {
        let err = client_error("send failed", ClientError::InvalidCellId("a#b".into()));
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn missing_socket_is_a_transport_error() {
        let err = wire_error(
            "connect failed",
            WireError::Connect {
                path: "/tmp/missing.sock".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }
}
