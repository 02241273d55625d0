//! In-process stub kernel.
//!
//! Speaks just enough of the kernel protocol to drive a client end to end:
//! answers `kernel_info_request` and `execute_request` with the usual
//! busy → reply → idle sequence, echoes heartbeats, and records everything it
//! receives. Used by the integration tests and the `stub-kernel` command.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use kernelmux_wire::{Channel, Envelope, KernelCodec, RawMessage, WireError};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::connector::{BoxedStream, KernelConnector};

const DUPLEX_BUFFER: usize = 64 * 1024;

enum StubControl {
    Emit(Envelope),
    Drop,
}

struct Inner {
    session: String,
    answer_probe: AtomicBool,
    echo_heartbeat: AtomicBool,
    refuse_connections: AtomicBool,
    received: Mutex<Vec<Envelope>>,
    arrived: Notify,
    connections: AtomicUsize,
    execution_count: AtomicU64,
    msg_counter: AtomicU64,
    control: Mutex<Option<mpsc::UnboundedSender<StubControl>>>,
}

/// A scripted kernel. Clones share state.
#[derive(Clone)]
pub struct StubKernel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StubKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubKernel")
            .field("session", &self.inner.session)
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

impl Default for StubKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl StubKernel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                session: uuid::Uuid::new_v4().simple().to_string(),
                answer_probe: AtomicBool::new(true),
                echo_heartbeat: AtomicBool::new(true),
                refuse_connections: AtomicBool::new(false),
                received: Mutex::new(Vec::new()),
                arrived: Notify::new(),
                connections: AtomicUsize::new(0),
                execution_count: AtomicU64::new(0),
                msg_counter: AtomicU64::new(0),
                control: Mutex::new(None),
            }),
        }
    }

    /// A kernel that accepts connections but never answers the shell probe.
    pub fn silent() -> Self {
        let stub = Self::new();
        stub.set_answer_probe(false);
        stub
    }

    pub fn set_answer_probe(&self, answer: bool) {
        self.inner.answer_probe.store(answer, Ordering::SeqCst);
    }

    pub fn set_echo_heartbeat(&self, echo: bool) {
        self.inner.echo_heartbeat.store(echo, Ordering::SeqCst);
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Number of connections served so far.
    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    fn received_guard(&self) -> MutexGuard<'_, Vec<Envelope>> {
        self.inner
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Every non-heartbeat envelope received, in arrival order.
    pub fn received(&self) -> Vec<Envelope> {
        self.received_guard().clone()
    }

    /// Received envelopes of one message type.
    pub fn requests(&self, msg_type: &str) -> Vec<Envelope> {
        self.received_guard()
            .iter()
            .filter(|envelope| envelope.message.msg_type().as_deref() == Some(msg_type))
            .cloned()
            .collect()
    }

    /// Wait until at least `count` requests of `msg_type` arrived, or the
    /// timeout passes. Returns what arrived either way.
    pub async fn wait_for_requests(
        &self,
        msg_type: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<Envelope> {
        let wait = async {
            loop {
                let notified = self.inner.arrived.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let found = self.requests(msg_type);
                if found.len() >= count {
                    return found;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(found) => found,
            Err(_) => self.requests(msg_type),
        }
    }

    /// Push an unsolicited message to the most recent connection.
    pub fn emit(&self, channel: Channel, message: RawMessage) -> bool {
        self.control(StubControl::Emit(Envelope::new(channel, message)))
    }

    /// Close the most recent connection from the kernel side.
    pub fn drop_connection(&self) -> bool {
        self.control(StubControl::Drop)
    }

    fn control(&self, command: StubControl) -> bool {
        self.inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(command).is_ok())
    }

    /// Build a kernel-originated message. `parent` supplies the parent
    /// header; `None` leaves it empty.
    pub fn message(&self, parent: Option<&RawMessage>, msg_type: &str, content: Value) -> RawMessage {
        let n = self.inner.msg_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let header = json!({
            "msg_id": format!("{}_{n}", self.inner.session),
            "msg_type": msg_type,
            "session": self.inner.session,
            "username": "kernel",
            "version": "5.3",
        });
        let parent_header = parent
            .and_then(|parent| parent.parts().first().cloned())
            .unwrap_or_else(|| Bytes::from_static(b"{}"));
        RawMessage::new(vec![
            Bytes::from(header.to_string()),
            parent_header,
            Bytes::from_static(b"{}"),
            Bytes::from(content.to_string()),
        ])
    }

    /// A connector whose every dial opens a fresh in-memory connection to
    /// this stub.
    pub fn connector(&self) -> Arc<StubConnector> {
        Arc::new(StubConnector { stub: self.clone() })
    }

    /// Serve kernel connections accepted on a Unix socket until the
    /// listener fails.
    #[cfg(unix)]
    pub async fn serve_socket(&self, listener: &kernelmux_wire::SocketListener) -> Result<(), WireError> {
        loop {
            let stream = listener.accept().await?;
            debug!(socket = %listener.path().display(), "stub kernel accepted connection");
            let stub = self.clone();
            tokio::spawn(async move { stub.serve(stream).await });
        }
    }

    /// Serve one connection until either side closes it.
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read, KernelCodec::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write, KernelCodec::default());
            while let Some(envelope) = out_rx.recv().await {
                if sink.send(envelope).await.is_err() {
                    break;
                }
            }
        });

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        *self
            .inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(control_tx);
        let connection = self.inner.connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(connection, "stub kernel serving");

        let mut control_open = true;
        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(envelope)) => self.handle(envelope, &out_tx),
                    Some(Err(err)) => {
                        debug!(connection, error = %err, "stub kernel read failed");
                        break;
                    }
                    None => break,
                },
                command = control_rx.recv(), if control_open => match command {
                    Some(StubControl::Emit(envelope)) => {
                        let _ = out_tx.send(envelope);
                    }
                    Some(StubControl::Drop) => {
                        writer.abort();
                        break;
                    }
                    None => control_open = false,
                },
            }
        }

        drop(out_tx);
        drop(frames);
        let _ = writer.await;
        debug!(connection, "stub kernel connection closed");
    }

    fn handle(&self, envelope: Envelope, out: &mpsc::UnboundedSender<Envelope>) {
        let channel = envelope.channel;
        if channel == Channel::Heartbeat {
            if self.inner.echo_heartbeat.load(Ordering::SeqCst) {
                let _ = out.send(envelope);
            }
            return;
        }

        let request = envelope.message.clone();
        self.received_guard().push(envelope);
        self.inner.arrived.notify_waiters();

        let Some(msg_type) = request.msg_type() else {
            trace!(%channel, "stub kernel ignoring message without header");
            return;
        };
        trace!(%channel, %msg_type, "stub kernel received request");

        let reply = match msg_type.as_str() {
            "kernel_info_request" => {
                if channel == Channel::Shell && !self.inner.answer_probe.load(Ordering::SeqCst) {
                    return;
                }
                vec![Envelope::new(
                    channel,
                    self.message(Some(&request), "kernel_info_reply", kernel_info_content()),
                )]
            }
            "execute_request" => {
                let code = request
                    .parts()
                    .get(kernelmux_wire::message::CONTENT)
                    .and_then(|raw| serde_json::from_slice::<Value>(raw).ok())
                    .and_then(|content| content.get("code")?.as_str().map(str::to_owned))
                    .unwrap_or_default();
                let count = self.inner.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
                vec![
                    Envelope::new(
                        Channel::Iopub,
                        self.message(
                            Some(&request),
                            "execute_input",
                            json!({ "code": code, "execution_count": count }),
                        ),
                    ),
                    Envelope::new(
                        Channel::Iopub,
                        self.message(
                            Some(&request),
                            "stream",
                            json!({ "name": "stdout", "text": code }),
                        ),
                    ),
                    Envelope::new(
                        channel,
                        self.message(
                            Some(&request),
                            "execute_reply",
                            json!({ "status": "ok", "execution_count": count }),
                        ),
                    ),
                ]
            }
            other => match other.strip_suffix("_request") {
                Some(base) => vec![Envelope::new(
                    channel,
                    self.message(Some(&request), &format!("{base}_reply"), json!({ "status": "ok" })),
                )],
                None => return,
            },
        };

        let _ = out.send(self.status(&request, "busy"));
        for envelope in reply {
            let _ = out.send(envelope);
        }
        let _ = out.send(self.status(&request, "idle"));
    }

    fn status(&self, parent: &RawMessage, state: &str) -> Envelope {
        Envelope::new(
            Channel::Iopub,
            self.message(Some(parent), "status", json!({ "execution_state": state })),
        )
    }
}

fn kernel_info_content() -> Value {
    json!({
        "status": "ok",
        "protocol_version": "5.3",
        "implementation": "kernelmux-stub",
        "implementation_version": env!("CARGO_PKG_VERSION"),
        "language_info": { "name": "text", "file_extension": ".txt" },
        "banner": "kernelmux stub kernel",
    })
}

/// Dials a [`StubKernel`] over an in-memory duplex stream.
#[derive(Debug, Clone)]
pub struct StubConnector {
    stub: StubKernel,
}

impl KernelConnector for StubConnector {
    fn connect(&self) -> BoxFuture<'static, Result<BoxedStream, WireError>> {
        let stub = self.stub.clone();
        Box::pin(async move {
            if stub.inner.refuse_connections.load(Ordering::SeqCst) {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "stub kernel refused the connection",
                )));
            }
            let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
            tokio::spawn(async move { stub.serve(server).await });
            Ok(Box::new(client) as BoxedStream)
        })
    }

    fn describe(&self) -> String {
        format!("stub kernel {}", self.stub.inner.session)
    }
}
