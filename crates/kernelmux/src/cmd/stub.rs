use kernelmux_client::StubKernel;
use kernelmux_wire::SocketListener;

use crate::cmd::StubKernelArgs;
use crate::exit::{io_error, wire_error, CliResult, SUCCESS};

pub async fn run(args: StubKernelArgs) -> CliResult<i32> {
    let listener = SocketListener::bind(&args.path).map_err(|err| wire_error("bind failed", err))?;
    let stub = if args.silent {
        StubKernel::silent()
    } else {
        StubKernel::new()
    };
    tracing::info!(socket = %args.path.display(), silent = args.silent, "stub kernel listening");

    tokio::select! {
        result = stub.serve_socket(&listener) => {
            result.map_err(|err| wire_error("accept failed", err))?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| io_error("signal handler setup failed", err))?;
            tracing::info!(connections = stub.connections(), "stub kernel stopping");
        }
    }

    Ok(SUCCESS)
}
