//! WebSocket Transport Layer
//!
//! Single responsibility: open a WebSocket to the daemon, write frames to it,
//! and classify what comes off it. No knowledge of registration, correlation,
//! or reconnection.
//!
//! The send half lives in its own writer task so a daemon that stops reading
//! stalls only that task, never the connection driver.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{http::Request, protocol::Message},
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::DaemonError;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<Socket, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<Socket>;

/// What the receive half produced.
#[derive(Debug)]
pub(crate) enum Inbound {
    Text(String),
    Pong,
    Closed(String),
    Failed(String),
}

/// A frame queued for the writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Text(String),
    Ping,
}

/// Reported by a writer task whose send failed. The task exits right after.
#[derive(Debug)]
pub(crate) struct WriteFailure {
    pub attempt: u64,
    pub error: DaemonError,
}

/// Connect to a WebSocket endpoint.
///
/// Returns the split halves only once the WebSocket handshake is done.
pub async fn connect(url: &str, connector: Connector) -> Result<(WsSink, WsStream), DaemonError> {
    debug!(url = %url, "Connecting to WebSocket");

    let request = Request::builder()
        .uri(url)
        .header("Host", extract_host(url))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .map_err(|e| DaemonError::Transport(format!("Failed to build request: {}", e)))?;

    let (ws, _) = connect_async_tls_with_config(request, None, false, Some(connector))
        .await
        .map_err(|e| DaemonError::Transport(format!("WebSocket connect failed: {}", e)))?;

    debug!(url = %url, "WebSocket connected");
    Ok(ws.split())
}

pub async fn send_text(sink: &mut WsSink, text: String) -> Result<(), DaemonError> {
    sink.send(Message::Text(text))
        .await
        .map_err(|e| DaemonError::Transport(format!("Failed to send: {}", e)))
}

pub async fn send_ping(sink: &mut WsSink) -> Result<(), DaemonError> {
    sink.send(Message::Ping(Vec::new()))
        .await
        .map_err(|e| DaemonError::Transport(format!("Failed to send ping: {}", e)))
}

/// Spawn the task that owns `sink` and writes queued frames in order, one at
/// a time.
///
/// The task ends when `frames` closes or a send fails; a failure is reported
/// on `failed` tagged with `attempt`. Aborting the task drops the sink.
pub(crate) fn spawn_writer(
    mut sink: WsSink,
    mut frames: mpsc::UnboundedReceiver<Outbound>,
    attempt: u64,
    failed: mpsc::UnboundedSender<WriteFailure>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let sent = match frame {
                Outbound::Text(text) => send_text(&mut sink, text).await,
                Outbound::Ping => send_ping(&mut sink).await,
            };
            if let Err(error) = sent {
                let _ = failed.send(WriteFailure { attempt, error });
                return;
            }
        }
        let _ = sink.close().await;
    })
}

/// Receive the next frame the client cares about.
///
/// Pings are answered by tungstenite and skipped. Binary frames are accepted
/// when they hold UTF-8 text; anything else is reported as text so the
/// protocol layer rejects it as malformed.
pub(crate) async fn recv(stream: &mut WsStream) -> Inbound {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Inbound::Text(text),
            Some(Ok(Message::Binary(data))) => {
                return Inbound::Text(String::from_utf8_lossy(&data).into_owned())
            }
            Some(Ok(Message::Pong(_))) => return Inbound::Pong,
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                return Inbound::Closed(reason);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Inbound::Failed(format!("WebSocket error: {}", e)),
            None => return Inbound::Closed("stream ended".to_string()),
        }
    }
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
