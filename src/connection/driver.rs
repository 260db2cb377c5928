//! Connection Driver
//!
//! Single responsibility: own the daemon connection and every piece of state
//! attached to it, and move it through its lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──open──▶ Handshaking ──registered──▶ Connected
//!       ▲                          │                     │                          │
//!       │                          └──────── error / close / timeout ───────────────┤
//!       │                                                                           ▼
//!       └──────────── cooldown (unless idle) ◀──────────────────────────────── Disconnecting
//!
//!  any ──close()──▶ Terminated
//! ```
//!
//! The driver runs as one task. Application calls arrive as [`Command`]s, the
//! connect attempt and the writer task report back through their own channels,
//! and all timers are deadlines the loop sleeps on, so no handler ever runs
//! concurrently with another. No handler awaits socket I/O: frames are handed
//! to the writer task, which writes them in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::events::{Event, EventHub, SpamKind};
use super::protocol::{self, WireMessage};
use super::queue::{CancelOutcome, Query, RequestQueue, Responder, ResponseSender};
use super::request_id::{RequestId, RequestIdGenerator};
use super::timers::{cooldown_after, TimerKind, Timers};
use super::transport::{self, Inbound, Outbound, WriteFailure, WsSink, WsStream};
use crate::config::{ClientConfig, IdlePolicy};
use crate::credentials::CredentialSupplier;
use crate::error::DaemonError;

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
    Terminated,
}

/// A call from the client handle.
#[derive(Debug)]
pub(crate) enum Command {
    Query {
        id: RequestId,
        message: WireMessage,
        timeout: Option<Duration>,
        reply: ResponseSender,
    },
    Cancel {
        id: RequestId,
        cause: Option<DaemonError>,
        reply: oneshot::Sender<Result<CancelOutcome, DaemonError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

type Halves = (WsSink, WsStream);

/// Result of a spawned connect attempt.
struct ConnectOutcome {
    attempt: u64,
    result: Result<Halves, DaemonError>,
}

/// The writer task of the current connection.
struct Writer {
    frames: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// Everything shared between the driver and the client handles.
pub(crate) struct Shared {
    pub ids: Arc<Mutex<RequestIdGenerator>>,
    pub events: EventHub,
    pub state: watch::Sender<ConnectionState>,
    pub terminated: Arc<AtomicBool>,
}

pub(crate) struct Driver {
    config: ClientConfig,
    credentials: Arc<dyn CredentialSupplier>,
    shared: Shared,
    commands: mpsc::UnboundedReceiver<Command>,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    write_tx: mpsc::UnboundedSender<WriteFailure>,
    write_rx: mpsc::UnboundedReceiver<WriteFailure>,

    queue: RequestQueue,
    timers: Timers,

    writer: Option<Writer>,
    stream: Option<WsStream>,
    connecting: Option<JoinHandle<()>>,
    attempt: u64,
    connected: bool,
    disconnecting: bool,
    terminated: bool,
    connect_time: Option<Instant>,
}

impl Driver {
    pub fn new(
        config: ClientConfig,
        credentials: Arc<dyn CredentialSupplier>,
        shared: Shared,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Self {
            config,
            credentials,
            shared,
            commands,
            connect_tx,
            connect_rx,
            write_tx,
            write_rx,
            queue: RequestQueue::new(),
            timers: Timers::new(),
            writer: None,
            stream: None,
            connecting: None,
            attempt: 0,
            connected: false,
            disconnecting: false,
            terminated: false,
            connect_time: None,
        }
    }

    /// Run until the client is closed or every handle is dropped.
    pub async fn run(mut self) {
        debug!(url = %self.config.url, "Connection driver started");

        if self.config.auto_connects() {
            self.connect();
        }

        while !self.terminated {
            let deadline = self.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All client handles dropped");
                        self.terminate();
                    }
                },
                Some(outcome) = self.connect_rx.recv() => self.on_connect_outcome(outcome),
                Some(failure) = self.write_rx.recv() => self.on_write_failure(failure),
                inbound = next_inbound(&mut self.stream) => self.on_inbound(inbound),
                _ = sleep_until(deadline) => self.on_timers(),
            }
        }

        debug!("Connection driver stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.timers.next_deadline(), self.queue.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.state.send_replace(state);
    }

    fn emit(&self, event: Event) {
        self.shared.events.emit(event);
    }

    fn next_id(&self) -> RequestId {
        self.shared
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_id()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Query {
                id,
                message,
                timeout,
                reply,
            } => {
                if self.terminated {
                    let _ = reply.send(Err(DaemonError::Terminated));
                    return;
                }
                if self.queue.contains(&id) {
                    let _ = reply.send(Err(DaemonError::DuplicateRequest(id.to_string())));
                    return;
                }

                debug!(request_id = %id, command = %message.command, "Request queued");
                self.timers.clear_idle();
                let query = Query::new(message, Responder::Caller(reply), timeout, Instant::now());
                self.queue.push(id, query);
                self.dispatch();
            }
            Command::Cancel { id, cause, reply } => {
                let result = self.queue.cancel(&id, cause);
                match &result {
                    Ok(outcome) => {
                        debug!(request_id = %id, outcome = ?outcome, "Request cancelled");
                        self.reschedule_idle();
                    }
                    Err(e) => debug!(request_id = %id, error = %e, "Cancel of unknown request"),
                }
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.terminate();
                let _ = reply.send(());
            }
        }
    }

    // =========================================================================
    // Connecting
    // =========================================================================

    /// Start a connect attempt unless one is pointless or already running.
    fn connect(&mut self) {
        if self.terminated
            || self.disconnecting
            || self.timers.cooldown_pending()
            || self.writer.is_some()
            || self.connecting.is_some()
        {
            return;
        }

        let connector = match self.credentials.connector() {
            Ok(connector) => connector,
            Err(e) => {
                error!(error = %e, "Failed to load transport credentials");
                self.teardown(e, true);
                return;
            }
        };

        self.attempt += 1;
        let attempt = self.attempt;
        let url = self.config.url.clone();
        let tx = self.connect_tx.clone();

        info!(url = %url, attempt = attempt, "Connecting to daemon");
        self.set_state(ConnectionState::Connecting);
        self.timers
            .arm_connect(Instant::now(), self.config.connect_timeout);

        self.connecting = Some(tokio::spawn(async move {
            let result = transport::connect(&url, connector).await;
            let _ = tx.send(ConnectOutcome { attempt, result });
        }));
    }

    fn on_connect_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.attempt != self.attempt || self.connecting.is_none() {
            debug!(attempt = outcome.attempt, "Dropping stale connect result");
            return;
        }
        self.connecting = None;

        let (sink, stream) = match outcome.result {
            Ok(halves) => halves,
            Err(e) => {
                self.teardown(e, true);
                return;
            }
        };

        self.start_writer(sink);
        self.stream = Some(stream);
        self.set_state(ConnectionState::Handshaking);

        let id = self.next_id();
        let registration = protocol::registration(&self.config.origin, id);
        debug!(request_id = %id, origin = %self.config.origin, "Registering service");

        self.queue.insert_sent(
            id,
            Query::new(
                registration.clone(),
                Responder::Handshake,
                None,
                Instant::now(),
            ),
        );
        if let Err(e) = self.write(&registration) {
            self.teardown(e, true);
        }
    }

    fn start_writer(&mut self, sink: WsSink) {
        let (frames, rx) = mpsc::unbounded_channel();
        let task = transport::spawn_writer(sink, rx, self.attempt, self.write_tx.clone());
        self.writer = Some(Writer { frames, task });
    }

    fn on_registered(&mut self) {
        self.timers.clear_connect();
        self.connected = true;
        self.connect_time = Some(Instant::now());
        self.set_state(ConnectionState::Connected);

        if let Some(period) = self.config.heartbeat_period() {
            self.timers.arm_heartbeat(Instant::now(), period);
        }
        self.reschedule_idle();

        info!(url = %self.config.url, origin = %self.config.origin, "Connected to daemon");
        self.emit(Event::Open);
        self.dispatch();
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Hand queued requests to the writer in order.
    fn dispatch(&mut self) {
        if !self.connected {
            self.connect();
            return;
        }

        while self.connected {
            let Some((id, message)) = self.queue.next_to_send() else {
                break;
            };
            match self.write(&message) {
                Ok(()) => {
                    debug!(request_id = %id, command = %message.command, "Request flushed");
                }
                Err(e @ DaemonError::MalformedMessage(_)) => {
                    self.queue.reject(&id, e);
                    self.reschedule_idle();
                }
                Err(e) => {
                    self.teardown(e, true);
                    break;
                }
            }
        }
    }

    fn write(&self, message: &WireMessage) -> Result<(), DaemonError> {
        let text = protocol::encode(message)?;
        self.send_frame(Outbound::Text(text))
    }

    fn send_frame(&self, frame: Outbound) -> Result<(), DaemonError> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| DaemonError::Transport("Not connected".into()))?;
        writer
            .frames
            .send(frame)
            .map_err(|_| DaemonError::Transport("Writer stopped".into()))
    }

    fn on_write_failure(&mut self, failure: WriteFailure) {
        if failure.attempt != self.attempt || self.writer.is_none() {
            debug!(attempt = failure.attempt, "Dropping stale write failure");
            return;
        }
        warn!(error = %failure.error, "Write to daemon failed");
        self.teardown(failure.error, true);
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Text(text) => match protocol::decode(&text) {
                Ok(message) => self.on_message(message),
                Err(e) => {
                    warn!(error = %e, "Malformed frame from daemon");
                    self.teardown(e, true);
                }
            },
            Inbound::Pong => {
                if self.connected {
                    self.emit(Event::Heartbeat);
                    if let Some(period) = self.config.heartbeat_period() {
                        self.timers.arm_heartbeat(Instant::now(), period);
                    }
                }
            }
            Inbound::Closed(reason) => {
                self.teardown(
                    DaemonError::Transport(format!("Connection closed: {}", reason)),
                    true,
                );
            }
            Inbound::Failed(e) => self.teardown(DaemonError::Transport(e), true),
        }
    }

    fn on_message(&mut self, message: WireMessage) {
        let matched = if message.ack {
            message
                .parsed_request_id()
                .filter(|id| self.queue.contains(id))
        } else {
            None
        };

        let Some(query) = matched.and_then(|id| self.queue.resolve(&id)) else {
            self.on_unsolicited(message);
            return;
        };

        if query.is_handshake() {
            if message.is_success() {
                self.on_registered();
            } else {
                let detail = message
                    .data
                    .as_ref()
                    .map_or_else(|| "no data".to_string(), |data| data.to_string());
                self.teardown(DaemonError::HandshakeFailure(detail), true);
            }
            return;
        }

        debug!(
            request_id = %message.request_id,
            command = %message.command,
            success = message.is_success(),
            elapsed_ms = query.created.elapsed().as_millis() as u64,
            "Response received"
        );

        if message.is_success() {
            query.settle(Ok(message));
        } else {
            let request = query.message.clone();
            query.settle(Err(DaemonError::remote_failure(request, message)));
        }
        self.reschedule_idle();
    }

    fn on_unsolicited(&self, message: WireMessage) {
        if !self.connected {
            debug!(command = %message.command, "Ignoring unsolicited message during handshake");
            return;
        }
        let kind = if message.ack {
            SpamKind::Ack
        } else {
            SpamKind::Request
        };
        debug!(command = %message.command, kind = ?kind, "Unsolicited message");
        self.emit(Event::Spam { kind, message });
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn reschedule_idle(&mut self) {
        if self.connected && self.queue.is_idle() {
            self.timers.schedule_idle(Instant::now(), self.config.idle);
        } else {
            self.timers.clear_idle();
        }
    }

    fn on_timers(&mut self) {
        let now = Instant::now();

        let expired = self.queue.expire(now);
        if expired > 0 {
            debug!(expired = expired, "Requests timed out");
            self.reschedule_idle();
        }

        while let Some(kind) = self.timers.take_due(now) {
            match kind {
                TimerKind::Connect => {
                    let ms = self.config.connect_timeout.as_millis() as u64;
                    warn!(timeout_ms = ms, "Connect attempt timed out");
                    self.teardown(DaemonError::ConnectTimeout(ms), true);
                }
                TimerKind::Heartbeat => {
                    if let Err(e) = self.send_frame(Outbound::Ping) {
                        self.teardown(e, true);
                    }
                }
                TimerKind::IdleMidpoint => {
                    if self.queue.is_idle() {
                        self.shared
                            .events
                            .debug("Connection idle, disconnecting if it stays idle");
                    } else {
                        self.timers.clear_idle();
                    }
                }
                TimerKind::IdleDisconnect => {
                    if self.queue.is_idle() {
                        info!("Disconnecting idle connection");
                        self.teardown(DaemonError::Idle, false);
                    }
                }
                TimerKind::Cooldown => {
                    let idle_policy = matches!(self.config.idle, IdlePolicy::After(_));
                    if idle_policy && self.queue.is_idle() {
                        debug!("Cooldown elapsed while idle, not reconnecting");
                    } else {
                        self.connect();
                    }
                }
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Drop the connection and everything tied to it.
    ///
    /// Re-entrant calls are ignored. `reconnect = false` suppresses the
    /// cooldown even when the policy would reconnect.
    fn teardown(&mut self, cause: DaemonError, reconnect: bool) {
        if self.disconnecting {
            return;
        }
        self.disconnecting = true;
        self.set_state(ConnectionState::Disconnecting);

        let was_connected = self.connected;
        let had_transport = self.writer.is_some() || self.connecting.is_some();
        let connected_for = self
            .connect_time
            .filter(|_| was_connected)
            .map(|at| at.elapsed());

        self.timers.clear_connection();
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(writer) = self.writer.take() {
            // Drops the sink even mid-write.
            writer.task.abort();
        }
        self.stream = None;
        self.connected = false;
        self.connect_time = None;

        let reject_unsent = self.terminated || !self.config.reconnects();
        let rejected = self.queue.drain_on_teardown(&cause, reject_unsent);

        if was_connected {
            warn!(error = %cause, rejected = rejected, "Daemon connection closed");
            self.emit(Event::Close(cause.clone()));
        } else if had_transport || !matches!(cause, DaemonError::Terminated) {
            warn!(error = %cause, rejected = rejected, "Daemon connect attempt failed");
            self.emit(Event::ConnectError(cause.clone()));
        }

        if reconnect && !self.terminated {
            if let Some(cooldown) = self.config.reconnect_cooldown {
                let wait = cooldown_after(cooldown, connected_for);
                debug!(
                    wait_ms = wait.as_millis() as u64,
                    queued = self.queue.unsent_len(),
                    outstanding = self.queue.len(),
                    "Reconnect scheduled"
                );
                self.timers.arm_cooldown(Instant::now(), wait);
            }
        }

        self.disconnecting = false;
        self.set_state(if self.terminated {
            ConnectionState::Terminated
        } else {
            ConnectionState::Disconnected
        });
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.timers.clear_cooldown();
        self.teardown(DaemonError::Terminated, false);
        info!(url = %self.config.url, "Daemon client terminated");
    }
}

async fn next_inbound(stream: &mut Option<WsStream>) -> Inbound {
    match stream {
        Some(stream) => transport::recv(stream).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
