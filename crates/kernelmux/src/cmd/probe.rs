use std::time::{Duration, Instant};

use kernelmux_client::{ClientConfig, ConnectionState, ExecutionState};
use serde::Serialize;

use crate::cmd::{connect_client, parse_duration, ProbeArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat};

const SETTLE: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct ProbeOutput {
    kernel_id: String,
    socket: String,
    session: String,
    connection_state: ConnectionState,
    execution_state: ExecutionState,
    ready_ms: u64,
}

pub async fn run(args: ProbeArgs, format: OutputFormat, config: ClientConfig) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let start = Instant::now();
    let client = connect_client(&args.path, config, timeout).await?;
    let ready_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    // The probe's own status messages usually trail its reply.
    let settle_until = Instant::now() + SETTLE;
    while client.execution_state() == ExecutionState::Starting && Instant::now() < settle_until {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let out = ProbeOutput {
        kernel_id: client.kernel_id().to_string(),
        socket: args.path.display().to_string(),
        session: client.session_id().to_string(),
        connection_state: client.connection_state(),
        execution_state: client.execution_state(),
        ready_ms,
    };
    client.shutdown().await;

    print_record(&out, format);
    Ok(SUCCESS)
}
