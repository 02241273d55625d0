//! The task that owns a kernel connection.
//!
//! One task per client holds the framed stream and is the only writer of
//! connection and execution state and the only dispatcher of inbound
//! messages. Everything else talks to it through a command channel, the
//! shared queue gate, or the live send path.

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use kernelmux_wire::{msg_id, Channel, Envelope, KernelCodec, RawMessage, WireError};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::connector::{BoxedStream, KernelConnector};
use crate::error::{ClientError, Result};
use crate::listener::ListenerRegistry;
use crate::queue::{OutboundQueue, QueuedMessage};
use crate::request::{Request, Session};
use crate::state::{ConnectionState, ExecutionState, ExecutionStateTracker};

type Transport = Framed<BoxedStream, KernelCodec>;

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    BroadcastState,
}

/// Where `send` puts a request: the queue while not ready, the live path
/// once ready. Both sides switch under this lock, so a request is never
/// sent ahead of one that was queued before it.
pub(crate) struct Gate {
    pub queue: OutboundQueue,
    pub live: Option<mpsc::UnboundedSender<QueuedMessage>>,
    pub closed: bool,
}

/// State shared between the client handle and its connection task.
pub(crate) struct Shared {
    pub kernel_id: String,
    pub session: Session,
    pub listeners: ListenerRegistry,
    pub execution: ExecutionStateTracker,
    pub sent: AtomicU64,
    pub received: AtomicU64,
    gate: Mutex<Gate>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    pub fn new(kernel_id: String, config: &ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            kernel_id,
            session: Session::new(&config.username, &config.protocol_version),
            listeners: ListenerRegistry::new(),
            execution: ExecutionStateTracker::new(),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            gate: Mutex::new(Gate {
                queue: OutboundQueue::new(config.queue_capacity, config.queue_high_water_mark),
                live: None,
                closed: false,
            }),
            state,
        }
    }

    pub fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn publish(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                kernel_id = %self.kernel_id,
                from = %previous,
                to = %next,
                "connection state changed"
            );
        }
    }
}

struct Dialing {
    dial: BoxFuture<'static, std::result::Result<BoxedStream, WireError>>,
    deadline: Instant,
}

struct Probing {
    transport: Transport,
    probe_ids: HashSet<String>,
    deadline: Instant,
    next_retry: Instant,
}

struct Live {
    transport: Transport,
    outbound: mpsc::UnboundedReceiver<QueuedMessage>,
    heartbeat: Option<Heartbeat>,
    // Late replies to earlier probes are still kept away from listeners.
    probe_ids: HashSet<String>,
}

enum Phase {
    Idle,
    Dialing(Dialing),
    Probing(Probing),
    Live(Live),
}

struct Heartbeat {
    ticker: Interval,
    outstanding: Option<Bytes>,
    seq: u64,
}

impl Heartbeat {
    fn new(period: Duration) -> Self {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            outstanding: None,
            seq: 0,
        }
    }

    fn echoed(&mut self, message: &RawMessage) {
        if message.parts().first() == self.outstanding.as_ref() {
            self.outstanding = None;
        }
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Heartbeat>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

enum Event {
    Cancelled,
    Command(Option<Command>),
    Inbound(Option<std::result::Result<Envelope, WireError>>),
    Outbound(Option<QueuedMessage>),
    Dialed(std::result::Result<BoxedStream, WireError>),
    ProbeRetry,
    ProbeDeadline,
    HeartbeatTick,
}

pub(crate) struct Connection {
    shared: Arc<Shared>,
    connector: Arc<dyn KernelConnector>,
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    phase: Phase,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<Shared>,
        connector: Arc<dyn KernelConnector>,
        config: ClientConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            connector,
            config,
            commands,
            cancel,
            phase: Phase::Idle,
            waiters: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(kernel_id = %self.shared.kernel_id, "connection task started");
        loop {
            match self.next_event().await {
                Event::Cancelled | Event::Command(None) => break,
                Event::Command(Some(command)) => self.on_command(command),
                Event::Dialed(dialed) => self.on_dialed(dialed).await,
                Event::Inbound(Some(Ok(envelope))) => self.on_inbound(envelope).await,
                Event::Inbound(Some(Err(err))) => self.on_transport_failure(err.into()),
                Event::Inbound(None) => self.on_transport_failure(ClientError::Transport(
                    "kernel closed the connection".into(),
                )),
                Event::Outbound(Some(entry)) => self.on_outbound(entry).await,
                Event::Outbound(None) => self.on_transport_failure(ClientError::Transport(
                    "live send path closed".into(),
                )),
                Event::ProbeRetry => self.on_probe_retry().await,
                Event::ProbeDeadline => {
                    let timeout = self.config.probe_timeout();
                    self.fail_attempt(ClientError::ProbeTimeout(timeout));
                }
                Event::HeartbeatTick => self.on_heartbeat_tick().await,
            }
        }
        self.teardown();
    }

    async fn next_event(&mut self) -> Event {
        match &mut self.phase {
            Phase::Idle => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                command = self.commands.recv() => Event::Command(command),
            },
            Phase::Dialing(dialing) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                command = self.commands.recv() => Event::Command(command),
                dialed = &mut dialing.dial => Event::Dialed(dialed),
                _ = tokio::time::sleep_until(dialing.deadline) => Event::ProbeDeadline,
            },
            Phase::Probing(probing) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                command = self.commands.recv() => Event::Command(command),
                inbound = probing.transport.next() => Event::Inbound(inbound),
                _ = tokio::time::sleep_until(probing.deadline) => Event::ProbeDeadline,
                _ = tokio::time::sleep_until(probing.next_retry) => Event::ProbeRetry,
            },
            Phase::Live(live) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                command = self.commands.recv() => Event::Command(command),
                inbound = live.transport.next() => Event::Inbound(inbound),
                entry = live.outbound.recv() => Event::Outbound(entry),
                _ = heartbeat_tick(&mut live.heartbeat) => Event::HeartbeatTick,
            },
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => match self.phase {
                Phase::Live(_) => {
                    let _ = reply.send(Ok(()));
                }
                Phase::Dialing(_) | Phase::Probing(_) => self.waiters.push(reply),
                Phase::Idle => {
                    self.waiters.push(reply);
                    self.start_connect();
                }
            },
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::BroadcastState => self.broadcast_state(),
        }
    }

    /// Begin an attempt. The dial runs inside the event loop, so commands
    /// arriving meanwhile join it instead of starting another.
    fn start_connect(&mut self) {
        self.shared.publish(ConnectionState::Connecting);
        if self.shared.execution.get() == ExecutionState::Unknown {
            self.shared.execution.set(ExecutionState::Starting);
        }
        info!(
            kernel_id = %self.shared.kernel_id,
            target = %self.connector.describe(),
            "connecting to kernel"
        );

        self.phase = Phase::Dialing(Dialing {
            dial: self.connector.connect(),
            deadline: Instant::now() + self.config.probe_timeout(),
        });
    }

    async fn on_dialed(&mut self, dialed: std::result::Result<BoxedStream, WireError>) {
        let Phase::Dialing(Dialing { deadline, .. }) = mem::replace(&mut self.phase, Phase::Idle)
        else {
            return;
        };
        let stream = match dialed {
            Ok(stream) => stream,
            Err(err) => return self.fail_attempt(err.into()),
        };

        let mut probing = Probing {
            transport: Framed::new(stream, KernelCodec::new(self.config.max_payload_size)),
            probe_ids: HashSet::new(),
            deadline,
            next_retry: Instant::now() + self.config.probe_retry_interval(),
        };
        match send_probe(&self.shared, &mut probing).await {
            Ok(()) => self.phase = Phase::Probing(probing),
            Err(err) => self.fail_attempt(err),
        }
    }

    async fn on_probe_retry(&mut self) {
        let Phase::Probing(probing) = &mut self.phase else {
            return;
        };
        probing.next_retry += self.config.probe_retry_interval();
        let result = send_probe(&self.shared, probing).await;
        if let Err(err) = result {
            self.fail_attempt(err);
        }
    }

    fn fail_attempt(&mut self, err: ClientError) {
        self.phase = Phase::Idle;
        self.shared.publish(ConnectionState::Error);
        warn!(
            kernel_id = %self.shared.kernel_id,
            error = %err,
            waiters = self.waiters.len(),
            "kernel connection attempt failed"
        );
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    async fn on_inbound(&mut self, envelope: Envelope) {
        self.shared.received.fetch_add(1, Ordering::Relaxed);
        let Envelope { channel, message } = envelope;

        if channel == Channel::Heartbeat {
            if let Phase::Live(Live {
                heartbeat: Some(heartbeat),
                ..
            }) = &mut self.phase
            {
                heartbeat.echoed(&message);
            }
            return;
        }

        self.shared.execution.on_message(channel, &message);

        let from_probe = {
            let probe_ids = match &self.phase {
                Phase::Probing(probing) => &probing.probe_ids,
                Phase::Live(live) => &live.probe_ids,
                Phase::Idle | Phase::Dialing(_) => return,
            };
            message
                .parent_msg_id()
                .is_some_and(|parent| probe_ids.contains(&parent))
        };
        if !from_probe {
            self.shared.listeners.dispatch(channel, &message);
            return;
        }

        trace!(kernel_id = %self.shared.kernel_id, %channel, "probe traffic");
        let is_probe_reply = channel == Channel::Shell
            && message.msg_type().as_deref() == Some("kernel_info_reply");
        if is_probe_reply && matches!(self.phase, Phase::Probing(_)) {
            self.enter_ready().await;
        }
    }

    async fn enter_ready(&mut self) {
        let Phase::Probing(probing) = mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let Probing {
            mut transport,
            probe_ids,
            ..
        } = probing;

        let (live_tx, outbound) = mpsc::unbounded_channel();
        let mut drained = 0usize;
        loop {
            let batch = {
                let mut gate = self.shared.gate();
                if gate.queue.is_empty() {
                    gate.live = Some(live_tx);
                    self.shared.publish(ConnectionState::Ready);
                    break;
                }
                gate.queue.drain_all()
            };
            match write_batch(&self.shared, &mut transport, batch).await {
                Ok(written) => drained += written,
                Err(err) => return self.fail_attempt(err),
            }
        }

        self.phase = Phase::Live(Live {
            transport,
            outbound,
            heartbeat: self.config.heartbeat_interval().map(Heartbeat::new),
            probe_ids,
        });
        info!(
            kernel_id = %self.shared.kernel_id,
            drained,
            "kernel connection ready"
        );
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn on_outbound(&mut self, entry: QueuedMessage) {
        let Phase::Live(live) = &mut self.phase else {
            return;
        };
        let channel = entry.channel;
        let result = live.transport.send(entry.envelope()).await;
        match result {
            Ok(()) => {
                self.shared.sent.fetch_add(1, Ordering::Relaxed);
                trace!(kernel_id = %self.shared.kernel_id, %channel, "request written");
            }
            Err(err) => {
                warn!(
                    kernel_id = %self.shared.kernel_id,
                    %channel,
                    error = %err,
                    "request write failed; returning it to the queue"
                );
                self.lose_link_with(ConnectionState::Error, &err.to_string(), Some(entry));
            }
        }
    }

    async fn on_heartbeat_tick(&mut self) {
        let ping = {
            let Phase::Live(Live {
                heartbeat: Some(heartbeat),
                ..
            }) = &mut self.phase
            else {
                return;
            };
            if heartbeat.outstanding.is_some() {
                None
            } else {
                heartbeat.seq += 1;
                let payload = Bytes::from(format!("{}-{}", self.shared.session.id(), heartbeat.seq));
                heartbeat.outstanding = Some(payload.clone());
                Some(payload)
            }
        };

        let Some(payload) = ping else {
            return self.lose_link(ConnectionState::Error, "heartbeat not echoed");
        };
        let Phase::Live(live) = &mut self.phase else {
            return;
        };
        let ping = Envelope::new(Channel::Heartbeat, RawMessage::new(vec![payload]));
        let result = live.transport.send(ping).await;
        if let Err(err) = result {
            self.lose_link(ConnectionState::Error, &err.to_string());
        }
    }

    fn on_transport_failure(&mut self, err: ClientError) {
        match self.phase {
            Phase::Dialing(_) | Phase::Probing(_) => self.fail_attempt(err),
            Phase::Live(_) => self.lose_link(ConnectionState::Error, &err.to_string()),
            Phase::Idle => {}
        }
    }

    fn lose_link(&mut self, next: ConnectionState, reason: &str) {
        self.lose_link_with(next, reason, None);
    }

    /// Drop the live stream. `unsent` and every request handed to the live
    /// path but not yet written go back to the front of the queue, in order.
    fn lose_link_with(&mut self, next: ConnectionState, reason: &str, unsent: Option<QueuedMessage>) {
        let Phase::Live(mut live) = mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let (returned, queued) = {
            let mut gate = self.shared.gate();
            gate.live = None;
            live.outbound.close();
            let mut returned: Vec<QueuedMessage> = unsent.into_iter().collect();
            while let Ok(entry) = live.outbound.try_recv() {
                returned.push(entry);
            }
            let count = returned.len();
            gate.queue.requeue_front(returned);
            self.shared.publish(next);
            (count, gate.queue.len())
        };

        if next == ConnectionState::Error {
            warn!(
                kernel_id = %self.shared.kernel_id,
                reason,
                returned,
                queued,
                "kernel connection lost"
            );
        } else {
            info!(
                kernel_id = %self.shared.kernel_id,
                reason,
                returned,
                queued,
                "kernel connection closed"
            );
        }
    }

    fn disconnect(&mut self) {
        match self.phase {
            Phase::Live(_) => self.lose_link(ConnectionState::Disconnected, "disconnect requested"),
            Phase::Dialing(_) | Phase::Probing(_) => {
                self.phase = Phase::Idle;
                self.shared.publish(ConnectionState::Disconnected);
                let err = ClientError::Disconnected("disconnect requested while connecting".into());
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
                info!(kernel_id = %self.shared.kernel_id, "connection attempt abandoned");
            }
            Phase::Idle => self.shared.publish(ConnectionState::Disconnected),
        }
    }

    fn broadcast_state(&self) {
        let state = self.shared.execution.get();
        let session = &self.shared.session;
        let header = session.header(&session.next_base_id(), "status");
        let message = RawMessage::from_sections(
            &header,
            &json!({}),
            &json!({}),
            &json!({ "execution_state": state.as_str() }),
            [],
        );
        match message {
            Ok(message) => {
                let report = self.shared.listeners.dispatch(Channel::Iopub, &message);
                debug!(
                    kernel_id = %self.shared.kernel_id,
                    execution_state = %state,
                    delivered = report.delivered,
                    "broadcast execution state"
                );
            }
            Err(err) => warn!(
                kernel_id = %self.shared.kernel_id,
                error = %err,
                "failed to build execution state broadcast"
            ),
        }
    }

    fn teardown(mut self) {
        let discarded = {
            let mut gate = self.shared.gate();
            gate.closed = true;
            gate.live = None;
            gate.queue.clear()
        };
        self.phase = Phase::Idle;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Closed));
        }
        self.shared.publish(ConnectionState::Disconnected);
        self.shared.execution.set(ExecutionState::Dead);

        if discarded > 0 {
            warn!(
                kernel_id = %self.shared.kernel_id,
                discarded,
                "discarded queued requests on teardown"
            );
        }
        info!(kernel_id = %self.shared.kernel_id, "kernel client torn down");
    }
}

async fn send_probe(shared: &Shared, probing: &mut Probing) -> Result<()> {
    let id = msg_id::encode(Channel::Shell, &shared.session.next_base_id(), None);
    let message = Request::kernel_info().into_message(&id, None, &shared.session)?;
    probing
        .transport
        .send(Envelope::new(Channel::Shell, message))
        .await?;
    shared.sent.fetch_add(1, Ordering::Relaxed);
    debug!(kernel_id = %shared.kernel_id, msg_id = %id, "sent readiness probe");
    probing.probe_ids.insert(id);
    Ok(())
}

/// Write drained entries in order. On failure the failed entry and
/// everything after it return to the front of the queue.
async fn write_batch(
    shared: &Shared,
    transport: &mut Transport,
    batch: Vec<QueuedMessage>,
) -> Result<usize> {
    let mut pending = batch.into_iter();
    let mut written = 0;
    while let Some(entry) = pending.next() {
        let channel = entry.channel;
        if let Err(err) = transport.send(entry.envelope()).await {
            let mut unsent = vec![entry];
            unsent.extend(pending);
            warn!(
                kernel_id = %shared.kernel_id,
                %channel,
                returned = unsent.len(),
                error = %err,
                "write failed while draining queue"
            );
            shared.gate().queue.requeue_front(unsent);
            return Err(err.into());
        }
        shared.sent.fetch_add(1, Ordering::Relaxed);
        written += 1;
    }
    Ok(written)
}
