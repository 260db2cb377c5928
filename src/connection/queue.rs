//! Request Queue & Correlation Map
//!
//! Single responsibility: track every request from submission until it is
//! answered, times out, is cancelled, or is rejected by a teardown.
//!
//! Each request appears exactly once in `outstanding` for its whole life. The
//! `unsent` FIFO additionally holds the ids that have not been written yet, in
//! submission order, and `deadlines` indexes the ones that can time out.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::protocol::WireMessage;
use super::request_id::RequestId;
use crate::error::DaemonError;

pub(crate) type ResponseSender = oneshot::Sender<Result<WireMessage, DaemonError>>;

/// Who is waiting for the outcome.
#[derive(Debug)]
pub(crate) enum Responder {
    Caller(ResponseSender),
    /// The registration request, answered by the driver itself
    Handshake,
}

/// One queued or in-flight request.
#[derive(Debug)]
pub(crate) struct Query {
    pub message: WireMessage,
    responder: Responder,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub created: Instant,
    pub sent: bool,
}

impl Query {
    pub fn new(
        message: WireMessage,
        responder: Responder,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Self {
        let timeout = timeout.filter(|t| !t.is_zero());
        Self {
            message,
            responder,
            timeout,
            deadline: timeout.map(|t| now + t),
            created: now,
            sent: false,
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self.responder, Responder::Handshake)
    }

    /// Hand the outcome to whoever is waiting.
    pub fn settle(self, outcome: Result<WireMessage, DaemonError>) {
        if let Responder::Caller(tx) = self.responder {
            // The caller may have stopped waiting.
            let _ = tx.send(outcome);
        }
    }
}

/// What `cancel` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request had already been written to the daemon
    Flushed,
    /// The request was still queued and never left the client
    Unsent,
}

#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    unsent: VecDeque<RequestId>,
    outstanding: HashMap<RequestId, Query>,
    deadlines: BTreeSet<(Instant, RequestId)>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request behind everything already waiting.
    pub fn push(&mut self, id: RequestId, query: Query) {
        self.unsent.push_back(id);
        self.track(id, query);
    }

    /// Track a request that bypasses the FIFO and is written right away.
    pub fn insert_sent(&mut self, id: RequestId, mut query: Query) {
        query.sent = true;
        self.track(id, query);
    }

    fn track(&mut self, id: RequestId, query: Query) {
        let deadline = query.deadline;
        if let Some(replaced) = self.outstanding.insert(id, query) {
            if let Some(old) = replaced.deadline {
                self.deadlines.remove(&(old, id));
            }
        }
        if let Some(deadline) = deadline {
            self.deadlines.insert((deadline, id));
        }
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.outstanding.contains_key(id)
    }

    pub fn is_idle(&self) -> bool {
        self.unsent.is_empty() && self.outstanding.is_empty()
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    /// Take the oldest unsent request, mark it sent, and return what to write.
    pub fn next_to_send(&mut self) -> Option<(RequestId, WireMessage)> {
        while let Some(id) = self.unsent.pop_front() {
            if let Some(query) = self.outstanding.get_mut(&id) {
                query.sent = true;
                return Some((id, query.message.clone()));
            }
        }
        None
    }

    /// Remove a request because its response arrived.
    pub fn resolve(&mut self, id: &RequestId) -> Option<Query> {
        let query = self.outstanding.remove(id)?;
        if !query.sent {
            self.unsent.retain(|queued| queued != id);
        }
        if let Some(deadline) = query.deadline {
            self.deadlines.remove(&(deadline, *id));
        }
        Some(query)
    }

    /// Remove a request and reject it with `error`.
    pub fn reject(&mut self, id: &RequestId, error: DaemonError) -> Option<CancelOutcome> {
        let query = self.resolve(id)?;
        let outcome = if query.sent {
            CancelOutcome::Flushed
        } else {
            CancelOutcome::Unsent
        };
        query.settle(Err(error));
        Some(outcome)
    }

    /// Cancel a request on behalf of the application.
    pub fn cancel(
        &mut self,
        id: &RequestId,
        cause: Option<DaemonError>,
    ) -> Result<CancelOutcome, DaemonError> {
        let reason = cause.map_or_else(|| "cancelled by caller".to_string(), |c| c.to_string());
        self.reject(id, DaemonError::Cancelled(reason))
            .ok_or_else(|| DaemonError::UnknownRequest(id.to_string()))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Reject every request whose deadline has passed. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<(RequestId, DaemonError)> = self
            .deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .filter_map(|(_, id)| self.outstanding.get(id).map(|q| (*id, q)))
            .map(|(id, q)| {
                let timeout_ms = q.timeout.map_or(0, |t| t.as_millis() as u64);
                let error = DaemonError::RequestTimeout {
                    command: q.message.command.clone(),
                    timeout_ms,
                };
                (id, error)
            })
            .collect();

        let count = expired.len();
        for (id, error) in expired {
            self.reject(&id, error);
        }
        count
    }

    /// Reject what a teardown cannot carry over to the next connection.
    ///
    /// Sent requests are always rejected, since the daemon that saw them is
    /// gone. Unsent requests are rejected too when `reject_unsent` is set and
    /// otherwise stay queued for the next connection.
    pub fn drain_on_teardown(&mut self, error: &DaemonError, reject_unsent: bool) -> usize {
        let doomed: Vec<RequestId> = self
            .outstanding
            .iter()
            .filter(|(_, q)| reject_unsent || q.sent || q.is_handshake())
            .map(|(id, _)| *id)
            .collect();

        let count = doomed.len();
        for id in doomed {
            self.reject(&id, error.clone());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::request_id::RequestIdGenerator;
    use tokio::sync::oneshot::error::TryRecvError;

    fn message(command: &str, id: RequestId) -> WireMessage {
        WireMessage {
            command: command.to_string(),
            data: None,
            destination: "wallet".to_string(),
            origin: "client_ui".to_string(),
            request_id: id.to_string(),
            ack: false,
        }
    }

    fn caller(
        command: &str,
        id: RequestId,
        timeout: Option<Duration>,
    ) -> (Query, oneshot::Receiver<Result<WireMessage, DaemonError>>) {
        let (tx, rx) = oneshot::channel();
        let query = Query::new(
            message(command, id),
            Responder::Caller(tx),
            timeout,
            Instant::now(),
        );
        (query, rx)
    }

    #[test]
    fn test_fifo_order() {
        let mut ids = RequestIdGenerator::new();
        let mut queue = RequestQueue::new();
        let (a, b) = (ids.next_id(), ids.next_id());
        queue.push(a, caller("first", a, None).0);
        queue.push(b, caller("second", b, None).0);

        assert_eq!(queue.next_to_send().map(|(_, m)| m.command).as_deref(), Some("first"));
        assert_eq!(queue.next_to_send().map(|(_, m)| m.command).as_deref(), Some("second"));
        assert!(queue.next_to_send().is_none());
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_idle());
    }

    #[test]
    fn test_cancel_unsent_and_flushed() {
        let mut ids = RequestIdGenerator::new();
        let mut queue = RequestQueue::new();
        let (a, b) = (ids.next_id(), ids.next_id());
        let (qa, mut rxa) = caller("a", a, None);
        let (qb, mut rxb) = caller("b", b, None);
        queue.push(a, qa);
        queue.push(b, qb);
        queue.next_to_send();

        assert_eq!(queue.cancel(&a, None).unwrap(), CancelOutcome::Flushed);
        assert_eq!(queue.cancel(&b, None).unwrap(), CancelOutcome::Unsent);
        assert!(matches!(rxa.try_recv(), Ok(Err(DaemonError::Cancelled(_)))));
        assert!(matches!(rxb.try_recv(), Ok(Err(DaemonError::Cancelled(_)))));
        assert!(queue.is_idle());
        assert_eq!(queue.unsent_len(), 0);

        assert!(matches!(
            queue.cancel(&a, None),
            Err(DaemonError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_cancel_wraps_cause() {
        let mut ids = RequestIdGenerator::new();
        let mut queue = RequestQueue::new();
        let a = ids.next_id();
        let (qa, mut rxa) = caller("a", a, None);
        queue.push(a, qa);

        queue.cancel(&a, Some(DaemonError::Idle)).unwrap();
        match rxa.try_recv() {
            Ok(Err(DaemonError::Cancelled(reason))) => assert!(reason.contains("idle")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_rejects_once() {
        let mut ids = RequestIdGenerator::new();
        let mut queue = RequestQueue::new();
        let (a, b) = (ids.next_id(), ids.next_id());
        let (qa, mut rxa) = caller("slow", a, Some(Duration::from_millis(100)));
        let (qb, mut rxb) = caller("forever", b, None);
        queue.push(a, qa);
        queue.push(b, qb);

        let deadline = queue.next_deadline().unwrap();
        assert_eq!(queue.expire(deadline - Duration::from_millis(1)), 0);
        assert_eq!(queue.expire(deadline), 1);
        assert_eq!(queue.expire(deadline + Duration::from_secs(10)), 0);

        assert!(matches!(
            rxa.try_recv(),
            Ok(Err(DaemonError::RequestTimeout { timeout_ms: 100, .. }))
        ));
        assert!(matches!(rxb.try_recv(), Err(TryRecvError::Empty)));
        assert!(!queue.contains(&a));
        assert!(queue.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_index_follows_resolution() {
        let mut ids = RequestIdGenerator::new();
        let mut queue = RequestQueue::new();
        let (a, b) = (ids.next_id(), ids.next_id());
        let (qa, _rxa) = caller("short", a, Some(Duration::from_millis(50)));
        let (qb, mut rxb) = caller("long", b, Some(Duration::from_millis(500)));
        queue.push(a, qa);
        queue.push(b, qb);
        let short = queue.next_deadline().unwrap();

        // Answered before its deadline, so the next one is the long timeout
        queue.resolve(&a).unwrap();
        let long = queue.next_deadline().unwrap();
        assert_eq!(long - short, Duration::from_millis(450));
        assert_eq!(queue.expire(long - Duration::from_millis(1)), 0);

        queue.cancel(&b, None).unwrap();
        assert!(queue.next_deadline().is_none());
        assert_eq!(queue.expire(long + Duration::from_secs(1)), 0);
        assert!(matches!(rxb.try_recv(), Ok(Err(DaemonError::Cancelled(_)))));
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let id = RequestIdGenerator::new().next_id();
        let (query, _rx) = caller("x", id, Some(Duration::ZERO));
        assert!(query.deadline.is_none());
    }

    #[test]
    fn test_teardown_keeps_unsent_when_reconnecting() {
        let mut ids = RequestIdGenerator::new();
        let mut queue = RequestQueue::new();
        let (a, b) = (ids.next_id(), ids.next_id());
        let (qa, mut rxa) = caller("sent", a, None);
        let (qb, mut rxb) = caller("queued", b, None);
        queue.push(a, qa);
        queue.push(b, qb);
        queue.next_to_send();

        let error = DaemonError::Transport("reset".into());
        assert_eq!(queue.drain_on_teardown(&error, false), 1);
        assert!(matches!(rxa.try_recv(), Ok(Err(DaemonError::Transport(_)))));
        assert!(matches!(rxb.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(queue.next_to_send().map(|(id, _)| id), Some(b));

        assert_eq!(queue.drain_on_teardown(&DaemonError::Terminated, true), 1);
        assert!(matches!(rxb.try_recv(), Ok(Err(DaemonError::Terminated))));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_resolve_returns_query() {
        let mut ids = RequestIdGenerator::new();
        let mut queue = RequestQueue::new();
        let a = ids.next_id();
        let hs = Query::new(message("register_service", a), Responder::Handshake, None, Instant::now());
        queue.insert_sent(a, hs);

        let query = queue.resolve(&a).unwrap();
        assert!(query.is_handshake());
        assert!(query.sent);
        assert!(queue.resolve(&a).is_none());
    }
}
