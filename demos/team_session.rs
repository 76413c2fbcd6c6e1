//! # Team Session Example
//!
//! Drives a complete TeamSync session from the terminal:
//!
//! 1. Restore a persisted room, if the last run left one
//! 2. Otherwise queue for a team and wait for the match
//! 3. Chat with the team; type `/leave`, `/search`, `/cancel` or `/quit`
//!
//! ## Running
//!
//! ```sh
//! # Sign in once; the credential is stored in the data directory.
//! TEAMSYNC_USER_ID=4 TEAMSYNC_TOKEN=<jwt> cargo run --example team_session
//!
//! # Later runs reuse the stored credential and resume the room.
//! TEAMSYNC_API_URL=https://api.example.com TEAMSYNC_SOCKET_URL=wss://api.example.com \
//!     cargo run --example team_session
//! ```

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use teamsync_client::{
    FileStorage, HttpConfig, HttpJsonClient, IdentityProvider, SessionConfig, SessionController,
    SessionEvent, SessionServices, SessionStore, StoredIdentity, UserIdentity,
    WebSocketConnector,
};

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_SOCKET_URL: &str = "ws://localhost:8000";
const DEFAULT_DATA_DIR: &str = "./teamsync-data";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=teamsync_client=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let api_url = env_or("TEAMSYNC_API_URL", DEFAULT_API_URL);
    let socket_url = env_or("TEAMSYNC_SOCKET_URL", DEFAULT_SOCKET_URL);
    let data_dir = env_or("TEAMSYNC_DATA_DIR", DEFAULT_DATA_DIR);
    tracing::info!("API {api_url}, stream {socket_url}, data in {data_dir}");

    // ── Identity ────────────────────────────────────────────────────
    let storage = Arc::new(FileStorage::open(&data_dir)?);
    let identity = Arc::new(StoredIdentity::new(storage.clone()));
    if let (Ok(user_id), Ok(token)) = (
        std::env::var("TEAMSYNC_USER_ID"),
        std::env::var("TEAMSYNC_TOKEN"),
    ) {
        identity.sign_in(&UserIdentity::new(user_id), &token)?;
    }
    let Some(user) = identity.current_user() else {
        tracing::error!("Not signed in; set TEAMSYNC_USER_ID and TEAMSYNC_TOKEN");
        return Ok(());
    };
    tracing::info!("Signed in as user {}", user.id);

    // ── Controller ──────────────────────────────────────────────────
    let client = HttpJsonClient::new(HttpConfig::new(api_url), identity.clone())?;
    let stored = SessionStore::new(storage.clone()).load()?;
    let services = SessionServices::new(
        Arc::new(client),
        identity,
        storage,
        Arc::new(WebSocketConnector::new(socket_url)),
    );
    let (mut controller, mut events) = SessionController::start(SessionConfig::new(), services);

    // Queue only if there is nothing to resume. If the stored room is gone,
    // type `/search` once the resume is rejected.
    match stored {
        Some(session) => {
            tracing::info!("Resuming room {}", session.room_id);
            controller.resume_from_storage()?;
        }
        None => controller.start_search()?,
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event channel closed, exiting");
                    break;
                };
                match event {
                    SessionEvent::SearchStarted => {
                        tracing::info!("In the queue, looking for a team…");
                    }
                    SessionEvent::TeamFormed(session) => {
                        tracing::info!(
                            "Team formed in room {} with {} member(s)",
                            session.room_id,
                            session.members.len()
                        );
                    }
                    SessionEvent::Resumed(session) => {
                        tracing::info!("Back in room {}", session.room_id);
                    }
                    SessionEvent::MembersUpdated(session) => {
                        let names: Vec<&str> =
                            session.members.iter().map(|m| m.display_name.as_str()).collect();
                        tracing::info!("Members: {}", names.join(", "));
                    }
                    SessionEvent::MessageReceived(message) => {
                        println!("[{}] {}", message.sender_name, message.text);
                    }
                    SessionEvent::ChannelClosed { reason, .. } => {
                        let reason = reason.as_deref().unwrap_or("by server");
                        tracing::warn!("Room stream closed: {reason}");
                    }
                    SessionEvent::Left { room_id } => tracing::info!("Left room {room_id}"),
                    SessionEvent::AuthorizationRequired => {
                        tracing::error!("Credential rejected; sign in again");
                        break;
                    }
                    SessionEvent::Error { message } => tracing::error!("{message}"),
                    other => tracing::debug!("Event: {other:?}"),
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "/quit" => break,
                    "/leave" => controller.leave()?,
                    "/search" => controller.start_search()?,
                    "/cancel" => controller.cancel_search()?,
                    "" => {}
                    text => controller.send_message(text)?,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down…");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    // The room stays persisted; the next run resumes it.
    controller.shutdown().await;
    tracing::info!("Session controller shut down. Goodbye!");
    Ok(())
}
