//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] moves JSON text frames over a WebSocket, and
//! [`WebSocketConnector`] opens one against the room-scoped endpoint
//! `{base}/ws/rooms/{room_id}?token={token}`.
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature (enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), teamsync_client::TeamSyncError> {
//! use teamsync_client::{Transport, WebSocketTransport};
//!
//! let url = "ws://localhost:8000/ws/rooms/7?token=abc";
//! let mut transport = WebSocketTransport::connect(url).await?;
//! transport.send(r#"{"type":"chat","text":"hi"}"#.to_string()).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::channel::ChannelConnector;
use crate::error::TeamSyncError;
use crate::transport::Transport;

/// Default timeout for establishing a room stream connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe; dropping its future before it
/// completes does not lose a frame.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Establish a WebSocket connection to `url` (`ws://` or `wss://`).
    ///
    /// # Errors
    ///
    /// Returns [`TeamSyncError::Io`] if the URL is invalid or the connection
    /// cannot be established. I/O error kinds are preserved.
    pub async fn connect(url: &str) -> Result<Self, TeamSyncError> {
        tracing::debug!("connecting to room stream");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            TeamSyncError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!("room stream connection established");

        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// Like [`connect`](Self::connect), failing with
    /// [`TeamSyncError::Timeout`] if the deadline elapses first.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: Duration,
    ) -> Result<Self, TeamSyncError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| TeamSyncError::Timeout)?
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<(), TeamSyncError> {
        if self.closed {
            return Err(TeamSyncError::TransportClosed);
        }
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TeamSyncError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TeamSyncError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(TeamSyncError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary frame on room stream, skipping");
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), TeamSyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| TeamSyncError::TransportSend(e.to_string()))
    }
}

// ── Connector ───────────────────────────────────────────────────────

/// Opens [`WebSocketTransport`]s against the room-scoped stream endpoint.
///
/// ```
/// use teamsync_client::WebSocketConnector;
///
/// let connector = WebSocketConnector::new("ws://localhost:8000/");
/// assert_eq!(
///     connector.room_url("12", "a b"),
///     "ws://localhost:8000/ws/rooms/12?token=a%20b"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for the socket base URL (e.g. `ws://localhost:8000`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the connection timeout. Defaults to **10 seconds**.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The endpoint URL for `room_id`, with the credential as a query parameter.
    pub fn room_url(&self, room_id: &str, token: &str) -> String {
        format!(
            "{}/ws/rooms/{}?token={}",
            self.base_url,
            urlencoding::encode(room_id),
            urlencoding::encode(token)
        )
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(
        &self,
        room_id: &str,
        token: &str,
    ) -> Result<Box<dyn Transport>, TeamSyncError> {
        let url = self.room_url(room_id, token);
        tracing::debug!(room_id = %room_id, "opening room stream");
        let transport = WebSocketTransport::connect_with_timeout(&url, self.connect_timeout).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url").await.unwrap_err();
        assert!(matches!(err, TeamSyncError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        let err = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TeamSyncError::Timeout));
    }

    /// Accept one WebSocket connection, run `handler` on it, and report the
    /// request path the client asked for.
    async fn start_mock_server<F, Fut>(
        handler: F,
    ) -> (String, tokio::sync::oneshot::Receiver<String>)
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (path_tx, path_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut path_tx = Some(path_tx);
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                if let Some(tx) = path_tx.take() {
                    let _ = tx.send(req.uri().to_string());
                }
                Ok(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();
            handler(ws).await;
        });

        (format!("ws://{addr}"), path_rx)
    }

    #[tokio::test]
    async fn connector_targets_room_endpoint_with_token() {
        let (base, path_rx) = start_mock_server(|mut ws| async move {
            ws.send(Message::Text(r#"{"type":"users_list","data":[]}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let connector = WebSocketConnector::new(base);
        let mut transport = connector.connect("33", "tok").await.unwrap();
        assert_eq!(path_rx.await.unwrap(), "/ws/rooms/33?token=tok");

        let frame = transport.recv().await.unwrap().unwrap();
        assert!(frame.contains("users_list"));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let (url, _path) = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into())).await.unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "after_binary");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed_and_close_is_idempotent() {
        let (url, _path) =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, TeamSyncError::TransportClosed));
    }

    #[tokio::test]
    async fn outbound_frames_reach_the_server() {
        let (url, _path) = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.send(r#"{"type":"chat","text":"echo"}"#.to_string()).await.unwrap();
        let echoed = transport.recv().await.unwrap().unwrap();
        assert_eq!(echoed, r#"{"type":"chat","text":"echo"}"#);
    }
}
