//! Transport abstraction for the room stream.
//!
//! The room stream carries JSON text frames in both directions. A
//! [`Transport`] moves one complete frame per call and handles framing
//! internally (WebSocket frames in the built-in implementation).
//!
//! Connection setup is not part of this trait. A
//! [`ChannelConnector`](crate::channel::ChannelConnector) knows how to reach
//! the room-scoped endpoint and returns an already-connected transport.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use teamsync_client::error::TeamSyncError;
//! use teamsync_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: String) -> Result<(), TeamSyncError> {
//!         // Write one JSON text frame
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, TeamSyncError>> {
//!         // Read the next JSON text frame; None once the peer closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), TeamSyncError> {
//!         // Shut the connection down
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::TeamSyncError;

/// A bidirectional text frame transport for the room stream.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the stream
/// channel polls it inside `tokio::select!`. Cancelling a pending `recv` and
/// calling it again must not lose a frame.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TeamSyncError::TransportSend`] if the frame could not be
    /// written, or [`TeamSyncError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, frame: String) -> Result<(), TeamSyncError>;

    /// Receive the next JSON text frame.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, TeamSyncError>>;

    /// Close the connection. Calling it more than once is allowed.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations still
    /// release their resources in that case.
    async fn close(&mut self) -> Result<(), TeamSyncError>;
}
