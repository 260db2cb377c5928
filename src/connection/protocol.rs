//! Daemon Wire Protocol
//!
//! Single responsibility: shape, encode, and decode the JSON messages the
//! daemon speaks.
//!
//! # Wire Format
//!
//! Requests and responses share one flat envelope, sent as a text frame:
//!
//! ```text
//! {
//!     "command": "get_status",       // Command name
//!     "data": { ... },               // Arbitrary payload
//!     "destination": "wallet",       // Service that owns the command
//!     "origin": "client_ui",         // Our registered service name
//!     "request_id": "00..2a",        // 64 hex digits, echoed by the response
//!     "ack": false                   // false on requests, true on responses
//! }
//! ```
//!
//! A response reports success with `data.success == true`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request_id::{RequestId, RequestIdGenerator};
use crate::error::DaemonError;
use crate::router::CommandRouter;

/// Command the client sends right after the socket opens.
pub const REGISTER_COMMAND: &str = "register_service";

/// Service name of the daemon itself.
pub const DAEMON_SERVICE: &str = "daemon";

/// One message on the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub ack: bool,
}

impl WireMessage {
    /// Whether the daemon reported success for this response.
    pub fn is_success(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|data| data.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The parsed request identifier, if the field holds one.
    pub fn parsed_request_id(&self) -> Option<RequestId> {
        self.request_id.parse().ok()
    }
}

/// A request before preparation.
///
/// Destination and request id may be left empty; `prepare` fills them in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub command: String,
    pub data: Option<Value>,
    pub destination: Option<String>,
    pub request_id: Option<RequestId>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

impl From<&str> for Request {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for Request {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}

/// Turn a request into a wire message ready for queueing.
///
/// Fails with [`DaemonError::UnknownDestination`] when no destination was given
/// and the router has no entry for the command. Ids are only drawn from the
/// generator once routing has succeeded.
pub fn prepare(
    request: Request,
    origin: &str,
    router: &dyn CommandRouter,
    ids: &mut RequestIdGenerator,
) -> Result<WireMessage, DaemonError> {
    let destination = match request.destination {
        Some(destination) => destination,
        None => router
            .destination(&request.command)
            .ok_or_else(|| DaemonError::UnknownDestination(request.command.clone()))?,
    };

    let request_id = request.request_id.unwrap_or_else(|| ids.next_id());

    Ok(WireMessage {
        command: request.command,
        data: request.data,
        destination,
        origin: origin.to_string(),
        request_id: request_id.to_string(),
        ack: false,
    })
}

/// Build the registration request announcing `origin` to the daemon.
pub fn registration(origin: &str, request_id: RequestId) -> WireMessage {
    WireMessage {
        command: REGISTER_COMMAND.to_string(),
        data: Some(serde_json::json!({ "service": origin })),
        destination: DAEMON_SERVICE.to_string(),
        origin: origin.to_string(),
        request_id: request_id.to_string(),
        ack: false,
    }
}

pub fn encode(message: &WireMessage) -> Result<String, DaemonError> {
    serde_json::to_string(message)
        .map_err(|e| DaemonError::MalformedMessage(format!("Failed to encode message: {}", e)))
}

pub fn decode(frame: &str) -> Result<WireMessage, DaemonError> {
    serde_json::from_str(frame)
        .map_err(|e| DaemonError::MalformedMessage(format!("Failed to decode message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::StaticRouter;
    use serde_json::json;

    fn router() -> StaticRouter {
        StaticRouter::new().with_route("get_status", "wallet")
    }

    #[test]
    fn test_prepare_routes_and_stamps() {
        let mut ids = RequestIdGenerator::new();
        let msg = prepare(
            Request::new("get_status").with_data(json!({"x": 1})),
            "client_ui",
            &router(),
            &mut ids,
        )
        .unwrap();

        assert_eq!(msg.destination, "wallet");
        assert_eq!(msg.origin, "client_ui");
        assert!(!msg.ack);
        assert_eq!(msg.request_id.len(), 64);
        assert_eq!(msg.data, Some(json!({"x": 1})));
    }

    #[test]
    fn test_prepare_keeps_explicit_fields() {
        let mut ids = RequestIdGenerator::new();
        let explicit = RequestIdGenerator::new().next_id();
        let msg = prepare(
            Request::new("not_routed")
                .with_destination("farmer")
                .with_request_id(explicit),
            "client_ui",
            &router(),
            &mut ids,
        )
        .unwrap();

        assert_eq!(msg.destination, "farmer");
        assert_eq!(msg.request_id, explicit.to_string());
    }

    #[test]
    fn test_prepare_unknown_command_draws_no_id() {
        let mut ids = RequestIdGenerator::new();
        let err = prepare(Request::new("nope"), "client_ui", &router(), &mut ids).unwrap_err();
        assert!(matches!(err, DaemonError::UnknownDestination(ref c) if c == "nope"));
        assert_eq!(ids.next_id().to_string(), RequestIdGenerator::new().next_id().to_string());
    }

    #[test]
    fn test_success_flag() {
        let mut msg = decode(r#"{"command":"x","data":{"success":true},"ack":true}"#).unwrap();
        assert!(msg.is_success());
        msg.data = Some(json!({"success": false}));
        assert!(!msg.is_success());
        msg.data = None;
        assert!(!msg.is_success());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("{not json"), Err(DaemonError::MalformedMessage(_))));
        assert!(matches!(decode("[1, 2]"), Err(DaemonError::MalformedMessage(_))));
        assert!(matches!(decode(r#"{"command": 7}"#), Err(DaemonError::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_broadcast_without_command() {
        let msg = decode(r#"{"data":{"height":12},"ack":true}"#).unwrap();
        assert!(msg.command.is_empty());
        assert!(msg.ack);
        assert!(msg.parsed_request_id().is_none());
    }

    #[test]
    fn test_registration_message() {
        let id = RequestIdGenerator::new().next_id();
        let msg = registration("client_ui", id);
        assert_eq!(msg.parsed_request_id(), Some(id));
        assert_eq!(msg.command, REGISTER_COMMAND);
        assert_eq!(msg.destination, DAEMON_SERVICE);
        assert_eq!(msg.data, Some(json!({"service": "client_ui"})));
    }
}
