//! # TeamSync Client
//!
//! Async client for TeamSync team matchmaking: join a queue, get placed in a
//! room, and chat with the team over a real-time room stream.
//!
//! The core is the [`SessionController`], which reconciles three unreliable
//! signals into one view of which room (if any) the user is in:
//!
//! - the one-shot join response,
//! - a polling [`discovery`] chain that runs while the user is queued,
//! - the room [`channel`] that pushes membership snapshots and chat.
//!
//! The active room is persisted through a [`Storage`] backend, so a restarted
//! process can revalidate and resume it without queueing again.
//!
//! ## Features
//!
//! - **`transport-websocket`** (default): [`WebSocketTransport`] and
//!   [`WebSocketConnector`] for the room stream
//! - **`http-reqwest`** (default): [`HttpJsonClient`], a `reqwest` based
//!   [`JsonClient`] with bearer credential injection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(all(feature = "transport-websocket", feature = "http-reqwest"))]
//! # async fn example() -> Result<(), teamsync_client::TeamSyncError> {
//! use std::sync::Arc;
//! use teamsync_client::{
//!     FileStorage, HttpConfig, HttpJsonClient, SessionConfig, SessionController,
//!     SessionEvent, SessionServices, StoredIdentity, WebSocketConnector,
//! };
//!
//! let storage = Arc::new(FileStorage::open("./teamsync-data")?);
//! let identity = Arc::new(StoredIdentity::new(storage.clone()));
//! let client = HttpJsonClient::new(HttpConfig::new("http://localhost:8000"), identity.clone())?;
//! let services = SessionServices::new(
//!     Arc::new(client),
//!     identity,
//!     storage,
//!     Arc::new(WebSocketConnector::new("ws://localhost:8000")),
//! );
//!
//! let (controller, mut events) = SessionController::start(SessionConfig::new(), services);
//! controller.resume_from_storage()?;
//! controller.start_search()?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::TeamFormed(session) = event {
//!         println!("joined room {}", session.room_id);
//!         controller.send_message("hello team")?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod channel;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod event;
pub mod failure;
#[cfg(feature = "http-reqwest")]
pub mod http;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use api::{JsonClient, Method, RemoteService};
pub use channel::{ChannelConnector, StreamChannel};
pub use controller::{SessionConfig, SessionController, SessionServices, SessionSnapshot};
pub use discovery::{DiscoveryEngine, Probe, RoomLead};
pub use error::{Result, TeamSyncError};
pub use event::SessionEvent;
pub use failure::FailureKind;
#[cfg(feature = "http-reqwest")]
pub use http::{HttpConfig, HttpJsonClient};
pub use identity::{IdentityProvider, StoredIdentity, UserIdentity};
pub use model::{ChatMessage, Member, MemberRole, MessageOrigin, RoomSession, SessionStatus};
pub use store::{FileStorage, MemoryStorage, SessionStore, Storage};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
