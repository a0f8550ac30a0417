//! Transport seam: the abstract duplex channel the client multiplexes
//! application messages over, plus the tokio-tungstenite implementation.
//!
//! The connection task is written against [`Connector`] / [`TransportLink`],
//! so any conforming transport (real socket, in-memory mock) satisfies it.
//! No component other than the connection task may write to a link.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL},
        protocol::Message,
    },
};
use url::Url;

use crate::error::{RelayLinkError, Result};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Close code for a normal (clean) closure.
const CLOSE_CODE_NORMAL: u16 = 1000;

/// Event emitted by an open transport link.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete inbound text frame.
    Frame(String),
    /// The peer closed the connection.
    Closed {
        /// Close code, if the peer supplied one.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
        /// Whether the close completed a clean close handshake.
        was_clean: bool,
    },
    /// The transport failed. Treated like an unclean close.
    Error(String),
}

/// An open duplex frame channel.
#[async_trait]
pub trait TransportLink: Send {
    /// Transmit one text frame.
    async fn send(&mut self, text: &str) -> Result<()>;

    /// Receive the next transport event. `None` means the stream ended
    /// without a close frame, which callers treat as an unclean close.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Close the link. Best effort.
    async fn close(&mut self);
}

/// Opens transport links. The connect timeout is enforced by the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, subprotocols: &[String]) -> Result<Box<dyn TransportLink>>;
}

/// Validate an endpoint URL and map plain HTTP schemes to their WebSocket
/// equivalent.
pub(crate) fn normalize_ws_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RelayLinkError::Configuration(
            "endpoint URL is required".to_string(),
        ));
    }
    let parsed = Url::parse(trimmed).map_err(|e| {
        RelayLinkError::Configuration(format!("invalid endpoint URL '{}': {}", trimmed, e))
    })?;
    // Url::as_str() renders the scheme lowercased, so prefix slicing is safe.
    let normalized = parsed.as_str();
    match parsed.scheme() {
        "ws" | "wss" => Ok(normalized.to_string()),
        "http" => Ok(format!("ws{}", &normalized["http".len()..])),
        "https" => Ok(format!("wss{}", &normalized["https".len()..])),
        other => Err(RelayLinkError::Configuration(format!(
            "unsupported URL scheme '{}' (expected ws:// or wss://)",
            other
        ))),
    }
}

// ── WebSocket implementation ────────────────────────────────────────────────

/// The default, tokio-tungstenite backed connector.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, subprotocols: &[String]) -> Result<Box<dyn TransportLink>> {
        let mut request = url.into_client_request().map_err(|e| {
            RelayLinkError::Transport(format!("failed to build WebSocket request: {}", e))
        })?;

        if !subprotocols.is_empty() {
            let offered = subprotocols.join(", ");
            let value = HeaderValue::from_str(&offered).map_err(|e| {
                RelayLinkError::Configuration(format!("invalid subprotocol list: {}", e))
            })?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| RelayLinkError::Transport(format!("connection failed: {}", e)))?;

        Ok(Box::new(WsLink { inner: stream }))
    }
}

struct WsLink {
    inner: WsStream,
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send(&mut self, text: &str) -> Result<()> {
        self.inner
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| RelayLinkError::Transport(format!("write failed: {}", e)))
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(TransportEvent::Frame(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    // Protocol is text-framed; binary frames are not routable.
                    log::debug!("[relay-link] Ignoring binary frame ({} bytes)", data.len());
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.inner.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    let was_clean = code == Some(CLOSE_CODE_NORMAL);
                    return Some(TransportEvent::Closed {
                        code,
                        reason,
                        was_clean,
                    });
                }
                Some(Err(e)) => return Some(TransportEvent::Error(e.to_string())),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
