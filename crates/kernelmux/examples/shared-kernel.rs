//! Two consumers sharing one kernel connection.
//!
//! A notebook view and a variable inspector both talk to the same stub
//! kernel. Each sends requests tagged with its own cell and only listens to
//! the message types it cares about.
//!
//! Run with:
//!   cargo run --example shared-kernel

use std::sync::Arc;
use std::time::Duration;

use kernelmux::client::{
    ClientConfig, KernelClient, ListenerResult, MessageFilter, Request, StubKernel,
};
use kernelmux::wire::{msg_id, Channel, RawMessage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let stub = StubKernel::new();
    let client = KernelClient::spawn("demo", stub.connector(), ClientConfig::default())?;

    // Sent before the kernel is ready; held in the queue until it is.
    client.send(Channel::Shell, Request::execute("x = 41"), Some("cell-1"))?;

    let notebook = Arc::new(|channel: Channel, message: &RawMessage| -> ListenerResult {
        let cell = message
            .parent_msg_id()
            .and_then(|id| msg_id::decode(&id).cell_id)
            .unwrap_or_else(|| "-".to_string());
        eprintln!(
            "[notebook] {channel} {} cell={cell}",
            message.msg_type().unwrap_or_default()
        );
        Ok(())
    });
    client.add_listener(
        notebook,
        Vec::new(),
        vec![("status".to_string(), Channel::Iopub)],
    )?;

    let inspector = Arc::new(|_: Channel, message: &RawMessage| -> ListenerResult {
        eprintln!(
            "[inspector] kernel is {}",
            message.status_execution_state().unwrap_or_default()
        );
        Ok(())
    });
    client.add_listener_with_filter(
        inspector,
        MessageFilter::only([("status".to_string(), Channel::Iopub)]),
    );

    client.connect().await?;
    client.send(Channel::Shell, Request::execute("x + 1"), Some("cell-2"))?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    eprintln!("[demo] stats: {:?}", client.stats());
    client.shutdown().await;
    Ok(())
}
