//! daemon-link - Resilient client for a JSON request/response daemon
//!
//! Keeps one long-lived WebSocket to a local daemon, registers as a service so
//! the daemon routes traffic back to us, and correlates requests with the
//! responses that come back in any order.
//!
//! ## Behaviour
//!
//! | Concern        | What happens                                              |
//! |----------------|-----------------------------------------------------------|
//! | Connecting     | On first request (or at startup when staying connected)   |
//! | Registration   | `register_service` before any queued request is written   |
//! | Failures       | Teardown, then reconnect after the cooldown               |
//! | Idle           | Optional disconnect once nothing is queued or in flight   |
//! | Heartbeat      | WebSocket pings while staying connected indefinitely      |
//!
//! ## Layout
//!
//! ```text
//! src/
//! ├── connection/     # Driver, queue, timers, protocol, transport
//! ├── config.rs       # Runtime and file configuration
//! ├── credentials.rs  # TLS client certificates
//! ├── router.rs       # Command → service routing
//! └── error.rs
//! ```

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod router;

// Re-exports
pub use config::{ClientConfig, Config, CredentialConfig, CredentialSource, IdlePolicy};
pub use connection::{
    CancelOutcome, ConnectionState, DaemonClient, Event, EventKind, PendingResponse, Request,
    RequestId, SpamKind, Subscription, WireMessage,
};
pub use credentials::{CredentialSupplier, PlainTransport, PreparedTls, TlsCredentials};
pub use error::{DaemonError, RemoteFailure};
pub use router::{CommandRouter, StaticRouter};
