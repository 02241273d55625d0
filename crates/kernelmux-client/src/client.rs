use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use kernelmux_wire::{msg_id, Channel, RawMessage};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::connection::{Command, Connection, Shared};
use crate::connector::KernelConnector;
use crate::error::{ClientError, Result};
use crate::listener::{Listener, MessageFilter, MsgTypeKey};
use crate::queue::{QueueObserver, QueuedMessage};
use crate::request::Request;
use crate::state::{Activity, ConnectionState, ExecutionState};

/// Point-in-time counters for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub connection_state: ConnectionState,
    pub execution_state: ExecutionState,
    pub queued: usize,
    pub queue_capacity: usize,
    pub queue_high_water_mark: usize,
    pub oldest_queued_ms: Option<u64>,
    pub listeners: usize,
    pub listener_failures: u64,
    pub sent: u64,
    pub received: u64,
}

/// One shared connection to one kernel.
///
/// Any number of consumers can send through and listen on the same client.
/// Requests issued before the kernel is ready are queued and written, in
/// order, as soon as it is. Dropping the client tears it down.
pub struct KernelClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    config: ClientConfig,
}

impl std::fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelClient")
            .field("kernel_id", &self.shared.kernel_id)
            .field("connection_state", &self.connection_state())
            .field("execution_state", &self.execution_state())
            .finish()
    }
}

impl KernelClient {
    /// Create a client and start its connection task. Does not connect.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        kernel_id: impl Into<String>,
        connector: Arc<dyn KernelConnector>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(kernel_id.into(), &config));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let connection = Connection::new(
            Arc::clone(&shared),
            connector,
            config.clone(),
            command_rx,
            cancel.clone(),
        );
        let task = tokio::spawn(connection.run());
        debug!(
            kernel_id = %shared.kernel_id,
            session = %shared.session.id(),
            "kernel client created"
        );

        Ok(Self {
            shared,
            commands,
            cancel,
            task: Mutex::new(Some(task)),
            config,
        })
    }

    pub fn kernel_id(&self) -> &str {
        &self.shared.kernel_id
    }

    /// Session id stamped into every request header.
    pub fn session_id(&self) -> &str {
        self.shared.session.id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a request. Returns the routing id written into its header.
    ///
    /// Never waits for the kernel: the request is either handed to the live
    /// connection or queued until the connection is ready.
    pub fn send(&self, channel: Channel, request: Request, cell_id: Option<&str>) -> Result<String> {
        check_request_channel(channel)?;
        if let Some(cell) = cell_id {
            msg_id::validate_cell_id(cell)?;
        }
        let id = msg_id::encode(channel, &self.shared.session.next_base_id(), cell_id);
        let msg_type = request.msg_type.clone();
        let message = request.into_message(&id, cell_id, &self.shared.session)?;
        self.submit(channel, message)?;
        debug!(
            kernel_id = %self.shared.kernel_id,
            %channel,
            %msg_type,
            msg_id = %id,
            "request submitted"
        );
        Ok(id)
    }

    /// Send a message built by the consumer, stamping routing metadata onto
    /// its existing `msg_id`. Returns the stamped id.
    pub fn send_raw(
        &self,
        channel: Channel,
        message: RawMessage,
        cell_id: Option<&str>,
    ) -> Result<String> {
        check_request_channel(channel)?;
        let message = message.with_routing(channel, cell_id)?;
        let id = message
            .msg_id()
            .ok_or_else(|| ClientError::Message("stamped message has no msg_id".into()))?;
        self.submit(channel, message)?;
        debug!(
            kernel_id = %self.shared.kernel_id,
            %channel,
            msg_id = %id,
            "raw request submitted"
        );
        Ok(id)
    }

    fn submit(&self, channel: Channel, message: RawMessage) -> Result<()> {
        let mut gate = self.shared.gate();
        if gate.closed {
            return Err(ClientError::Closed);
        }
        let entry = QueuedMessage::new(channel, message);
        let entry = match &gate.live {
            Some(live) => match live.send(entry) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(entry)) => entry,
            },
            None => entry,
        };
        gate.queue.push(entry)?;
        trace!(
            kernel_id = %self.shared.kernel_id,
            queued = gate.queue.len(),
            "request queued until the kernel is ready"
        );
        Ok(())
    }

    /// Register a listener with optional filters.
    ///
    /// `msg_types` and `exclude_msg_types` are mutually exclusive; passing
    /// both non-empty is [`ClientError::FilterConflict`] and registers
    /// nothing. Registering the same `Arc` again replaces its filter.
    pub fn add_listener(
        &self,
        listener: Arc<dyn Listener>,
        msg_types: impl IntoIterator<Item = MsgTypeKey>,
        exclude_msg_types: impl IntoIterator<Item = MsgTypeKey>,
    ) -> Result<()> {
        self.shared
            .listeners
            .add_filtered(listener, msg_types, exclude_msg_types)
    }

    pub fn add_listener_with_filter(&self, listener: Arc<dyn Listener>, filter: MessageFilter) {
        self.shared.listeners.add(listener, filter);
    }

    /// Register a listener using the filter from [`ClientConfig::filters`].
    pub fn add_listener_with_config(&self, listener: Arc<dyn Listener>) -> Result<()> {
        let filter = MessageFilter::from_config(&self.config.filters)?;
        self.shared.listeners.add(listener, filter);
        Ok(())
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    /// Observe the outbound queue crossing its high-water mark.
    ///
    /// The observer runs with the send path locked and must not call back
    /// into this client.
    pub fn set_queue_observer(&self, observer: Option<Arc<dyn QueueObserver>>) {
        self.shared.gate().queue.set_observer(observer);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.shared.execution.get()
    }

    pub fn activity(&self) -> Activity {
        self.shared.execution.activity()
    }

    pub fn reset_activity(&self) {
        self.shared.execution.reset_activity();
    }

    /// Watch connection state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.subscribe()
    }

    /// Whether requests are currently written straight to the kernel.
    pub fn is_available(&self) -> bool {
        self.connection_state() == ConnectionState::Ready
    }

    /// Connect and wait for the kernel to answer the readiness probe.
    ///
    /// Joins an attempt already in progress; returns at once when ready.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Close the stream. Listeners and queued requests are kept.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { reply })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Ask the connection task to send every listener a synthetic iopub
    /// `status` carrying the current execution state.
    pub fn broadcast_state(&self) -> Result<()> {
        self.commands
            .send(Command::BroadcastState)
            .map_err(|_| ClientError::Closed)
    }

    /// Tear down: stop the connection task and discard queued requests.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                debug!(kernel_id = %self.shared.kernel_id, error = %err, "connection task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> ClientStats {
        let (queued, queue_capacity, queue_high_water_mark, oldest) = {
            let gate = self.shared.gate();
            (
                gate.queue.len(),
                gate.queue.capacity(),
                gate.queue.high_water_mark(),
                gate.queue.oldest_age(),
            )
        };
        ClientStats {
            connection_state: self.connection_state(),
            execution_state: self.execution_state(),
            queued,
            queue_capacity,
            queue_high_water_mark,
            oldest_queued_ms: oldest.map(|age| age.as_millis() as u64),
            listeners: self.shared.listeners.len(),
            listener_failures: self.shared.listeners.failures(),
            sent: self.shared.sent.load(Ordering::Relaxed),
            received: self.shared.received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn check_request_channel(channel: Channel) -> Result<()> {
    if channel.accepts_requests() {
        Ok(())
    } else {
        Err(ClientError::InvalidChannel(channel))
    }
}
