use std::sync::Arc;
use std::time::Instant;

use kernelmux_client::{ClientConfig, ListenerResult, MessageFilter, Request};
use kernelmux_wire::{Channel, RawMessage};
use tokio::sync::mpsc;

use crate::cmd::{connect_client, parse_duration, ExecuteArgs};
use crate::exit::{client_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_message, MessageOutput, OutputFormat};

pub async fn run(args: ExecuteArgs, format: OutputFormat, config: ClientConfig) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let start = Instant::now();
    let client = connect_client(&args.path, config, timeout).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<(Channel, RawMessage)>();
    client.add_listener_with_filter(
        Arc::new(move |channel: Channel, message: &RawMessage| -> ListenerResult {
            let _ = tx.send((channel, message.clone()));
            Ok(())
        }),
        MessageFilter::all(),
    );

    let id = client
        .send(Channel::Shell, Request::execute(args.code), args.cell.as_deref())
        .map_err(|err| client_error("send failed", err))?;
    tracing::debug!(msg_id = %id, "execute request sent");

    let remaining = timeout.saturating_sub(start.elapsed());
    let outcome = tokio::time::timeout(remaining, async {
        while let Some((channel, message)) = rx.recv().await {
            if message.parent_msg_id().as_deref() != Some(id.as_str()) {
                continue;
            }
            let out = MessageOutput::new(channel, &message);
            print_message(&out, format);
            if channel == Channel::Shell && out.msg_type == "execute_reply" {
                return Some(out.content["status"] == "ok");
            }
        }
        None
    })
    .await;
    client.shutdown().await;

    match outcome {
        Ok(Some(true)) => Ok(SUCCESS),
        Ok(Some(false)) => Ok(FAILURE),
        Ok(None) => Err(CliError::new(FAILURE, "connection closed before execute_reply")),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("no execute_reply within {timeout:?}"),
        )),
    }
}
