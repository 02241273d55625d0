use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Subcommand};
use kernelmux_client::{ClientConfig, ClientError, KernelClient, SocketConnector};

use crate::exit::{client_error, CliError, CliResult, TIMEOUT, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod execute;
pub mod probe;
pub mod stub;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a stub kernel on a Unix socket.
    StubKernel(StubKernelArgs),
    /// Connect to a kernel and report its state.
    Probe(ProbeArgs),
    /// Run code on a kernel and print the messages it produces.
    Execute(ExecuteArgs),
    /// Decode a routing message id.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat, config: Option<&Path>) -> CliResult<i32> {
    match command {
        Command::StubKernel(args) => stub::run(args).await,
        Command::Probe(args) => probe::run(args, format, load_config(config)?).await,
        Command::Execute(args) => execute::run(args, format, load_config(config)?).await,
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct StubKernelArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Never answer kernel_info_request on shell.
    #[arg(long)]
    pub silent: bool,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Kernel socket path.
    pub path: PathBuf,
    /// How long to wait for the kernel to become ready (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ExecuteArgs {
    /// Kernel socket path.
    pub path: PathBuf,
    /// Code to run.
    #[arg(long)]
    pub code: String,
    /// Cell id to route the request under.
    #[arg(long)]
    pub cell: Option<String>,
    /// How long to wait for readiness and for the reply (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Message id to decode.
    pub id: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn load_config(path: Option<&Path>) -> CliResult<ClientConfig> {
    match path {
        Some(path) => ClientConfig::from_path(path)
            .map_err(|err| client_error(&format!("failed loading {}", path.display()), err)),
        None => Ok(ClientConfig::default()),
    }
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

/// Spawn a client for the socket and connect it, retrying while the socket
/// is missing or refusing connections until `timeout` passes.
pub(crate) async fn connect_client(
    path: &Path,
    mut config: ClientConfig,
    timeout: Duration,
) -> CliResult<KernelClient> {
    config.probe_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let kernel_id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kernel".to_string());
    let client = KernelClient::spawn(kernel_id, Arc::new(SocketConnector::new(path)), config)
        .map_err(|err| client_error("invalid configuration", err))?;

    let start = Instant::now();
    loop {
        match client.connect().await {
            Ok(()) => return Ok(client),
            Err(ClientError::Transport(reason)) if start.elapsed() < timeout => {
                tracing::debug!(%reason, "kernel not reachable yet; retrying");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(ClientError::Transport(reason)) => {
                return Err(CliError::new(
                    TIMEOUT,
                    format!("connect timed out after {timeout:?}: {reason}"),
                ));
            }
            Err(err) => return Err(client_error("connect failed", err)),
        }
    }
}
