//! Daemon Client Handle
//!
//! Single responsibility: the application-facing API. Every method either
//! works synchronously on state the handle owns (preparation, ids) or hands a
//! [`Command`] to the driver task.
//!
//! # Usage
//!
//! ```ignore
//! use daemon_link::{ClientConfig, DaemonClient, PlainTransport, StaticRouter};
//! use std::sync::Arc;
//!
//! let router = StaticRouter::new().with_route("get_status", "wallet");
//! let client = DaemonClient::new(
//!     ClientConfig::new("ws://localhost:55400"),
//!     Arc::new(PlainTransport),
//!     Arc::new(router),
//! );
//!
//! // Connects on demand, registers, then sends
//! let response = client.call("get_status").await?;
//! client.close().await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use super::driver::{Command, ConnectionState, Driver, Shared};
use super::events::{EventHub, EventKind, Subscription};
use super::protocol::{self, Request, WireMessage};
use super::queue::CancelOutcome;
use super::request_id::{RequestId, RequestIdGenerator};
use crate::config::{ClientConfig, Config};
use crate::credentials::{self, CredentialSupplier};
use crate::error::DaemonError;
use crate::router::CommandRouter;

/// Handle to one daemon connection.
///
/// Cheap to clone; all clones drive the same connection and share one
/// request-id counter. The connection is terminated when [`close`] is called
/// or the last clone is dropped.
///
/// [`close`]: DaemonClient::close
#[derive(Clone)]
pub struct DaemonClient {
    inner: Arc<Inner>,
}

struct Inner {
    origin: String,
    request_timeout: Option<Duration>,
    router: Arc<dyn CommandRouter>,
    ids: Arc<Mutex<RequestIdGenerator>>,
    commands: mpsc::UnboundedSender<Command>,
    events: EventHub,
    state: watch::Receiver<ConnectionState>,
    terminated: Arc<AtomicBool>,
}

impl DaemonClient {
    /// Create a client and start its driver task.
    ///
    /// Must be called from within a tokio runtime. With an indefinite idle
    /// policy and reconnection enabled the first connect starts immediately;
    /// otherwise it waits for the first request.
    pub fn new(
        config: ClientConfig,
        credentials: Arc<dyn CredentialSupplier>,
        router: Arc<dyn CommandRouter>,
    ) -> Self {
        let ids = Arc::new(Mutex::new(RequestIdGenerator::new()));
        let events = EventHub::default();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let terminated = Arc::new(AtomicBool::new(false));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            origin: config.origin.clone(),
            request_timeout: config.request_timeout,
            router,
            ids: Arc::clone(&ids),
            commands: commands_tx,
            events: events.clone(),
            state: state_rx,
            terminated: Arc::clone(&terminated),
        };

        let shared = Shared {
            ids,
            events,
            state: state_tx,
            terminated,
        };
        let driver = Driver::new(config, credentials, shared, commands_rx);
        tokio::spawn(driver.run());

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Create a client from the file configuration, using its credential source.
    pub fn from_config(config: &Config, router: Arc<dyn CommandRouter>) -> Result<Self, DaemonError> {
        let client_config = config.to_client_config()?;
        let credentials = credentials::from_config(&config.credentials)?;
        Ok(Self::new(client_config, credentials, router))
    }

    /// Fill in destination, id, and origin without sending anything.
    pub fn prepare(&self, request: impl Into<Request>) -> Result<WireMessage, DaemonError> {
        let mut ids = self
            .inner
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        protocol::prepare(
            request.into(),
            &self.inner.origin,
            self.inner.router.as_ref(),
            &mut ids,
        )
    }

    /// Queue a request with the configured request timeout.
    ///
    /// Routing failures and calls after [`close`](Self::close) fail right here;
    /// everything else is reported through the returned future.
    pub fn query(&self, request: impl Into<Request>) -> Result<PendingResponse, DaemonError> {
        self.query_with_timeout(request, self.inner.request_timeout)
    }

    /// Queue a request with its own timeout. `None` waits indefinitely.
    pub fn query_with_timeout(
        &self,
        request: impl Into<Request>,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, DaemonError> {
        if self.is_terminated() {
            return Err(DaemonError::Terminated);
        }

        let message = self.prepare(request)?;
        let id = message
            .parsed_request_id()
            .ok_or_else(|| DaemonError::UnknownRequest(message.request_id.clone()))?;

        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Query {
                id,
                message: message.clone(),
                timeout,
                reply,
            })
            .map_err(|_| DaemonError::Terminated)?;

        Ok(PendingResponse {
            id,
            request: message,
            rx,
        })
    }

    /// Send a request and wait for its response.
    pub async fn call(&self, request: impl Into<Request>) -> Result<WireMessage, DaemonError> {
        self.query(request)?.await
    }

    /// Cancel a queued or in-flight request, by id or by its pending response.
    ///
    /// The waiting caller is rejected with [`DaemonError::Cancelled`] before
    /// this returns. A request already written is not recalled; a late response
    /// to it surfaces as unsolicited traffic.
    pub async fn cancel(
        &self,
        request: impl Into<RequestId>,
        cause: Option<DaemonError>,
    ) -> Result<CancelOutcome, DaemonError> {
        let id = request.into();
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Cancel { id, cause, reply })
            .map_err(|_| DaemonError::Terminated)?;
        rx.await.unwrap_or(Err(DaemonError::Terminated))
    }

    /// Terminate the client for good.
    ///
    /// Every outstanding request is rejected with [`DaemonError::Terminated`].
    /// Calling it again does nothing.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn subscribe_to(&self, kind: EventKind) -> Subscription {
        self.inner.events.subscribe_to(kind)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

/// The eventual response to a queued request.
///
/// Resolves to the full response message on success.
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    request: WireMessage,
    rx: oneshot::Receiver<Result<WireMessage, DaemonError>>,
}

impl PendingResponse {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn request(&self) -> &WireMessage {
        &self.request
    }
}

impl From<&PendingResponse> for RequestId {
    fn from(pending: &PendingResponse) -> Self {
        pending.id
    }
}

impl Future for PendingResponse {
    type Output = Result<WireMessage, DaemonError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the driver shut down with the request unanswered.
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(DaemonError::Terminated)))
    }
}
