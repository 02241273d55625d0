//! Shared kernel connections.
//!
//! One [`KernelClient`] owns the connection to one kernel and lets any number
//! of consumers send requests through it and listen to what comes back.
//! Requests sent before the kernel is ready are queued; inbound messages are
//! fanned out to filtered listeners; iopub status messages drive the
//! execution state.

pub mod client;
pub mod config;
mod connection;
pub mod connector;
pub mod error;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod request;
pub mod state;
pub mod stub;

pub use client::{ClientStats, KernelClient};
pub use config::{ClientConfig, FilterConfig};
#[cfg(unix)]
pub use connector::{SocketConnector, SocketDirConnectorFactory};
pub use connector::{BoxedStream, ConnectorFactory, KernelConnector, KernelStream};
pub use error::{ClientError, Result};
pub use listener::{
    DispatchReport, Listener, ListenerRegistry, ListenerResult, MessageFilter, MsgTypeKey,
};
pub use queue::{OutboundQueue, QueueObserver, QueuedMessage};
pub use registry::{KernelClientRegistry, KernelEvent};
pub use request::{Request, Session};
pub use state::{Activity, ConnectionState, ExecutionState, ExecutionStateTracker};
pub use stub::{StubConnector, StubKernel};
