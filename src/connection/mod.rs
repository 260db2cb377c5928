//! Daemon Connection Module
//!
//! One persistent, self-healing WebSocket connection to the daemon, with
//! request/response correlation on top.
//!
//! # Architecture
//!
//! The module is organized by concern, with each submodule having a single responsibility:
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `transport`  | WebSocket connect, writer task, receive               |
//! | `protocol`   | JSON envelope, request preparation                    |
//! | `request_id` | 256-bit correlation ids                               |
//! | `queue`      | Unsent FIFO and outstanding-request map               |
//! | `timers`     | Connect, heartbeat, idle, and cooldown deadlines      |
//! | `events`     | Lifecycle and diagnostic notifications                |
//! | `driver`     | The task that owns the connection and its state       |
//! | `client`     | Cloneable handle the application talks to             |
//!
//! # Key Design Principles
//!
//! ## 1. One Owner
//!
//! - The driver task owns the read half, the queue, and every timer
//! - A writer task per connection owns the send half, so a daemon that stops
//!   reading never blocks the driver
//! - Handles only send commands; nothing is shared behind a lock except the
//!   id counter, which `prepare` needs synchronously
//!
//! ## 2. Ordered Writes
//!
//! - Requests enter the driver in call order over an unbounded channel
//! - Each write completes before the next one starts
//!
//! ## 3. Failures Drive Reconnection, Not Callers
//!
//! - Transport and protocol failures tear the connection down and schedule a
//!   reconnect; callers only hear about them if their request was in flight
//! - Request-level failures (timeout, remote failure, cancel) go to the one
//!   caller that issued the request and are never retried

mod driver;
mod events;
mod protocol;
mod queue;
mod request_id;
mod timers;
mod transport;

mod client;

pub use client::{DaemonClient, PendingResponse};
pub use driver::ConnectionState;
pub use events::{Event, EventHub, EventKind, SpamKind, Subscription};
pub use protocol::{Request, WireMessage, DAEMON_SERVICE, REGISTER_COMMAND};
pub use queue::CancelOutcome;
pub use request_id::{RequestId, RequestIdGenerator, REQUEST_ID_LEN};
