//! Remote matchmaking and room service.
//!
//! [`JsonClient`] is the request seam: one authenticated JSON round-trip per
//! call. [`RemoteService`] layers the typed matchmaking and room endpoints on
//! top of it. The `http-reqwest` feature provides
//! [`HttpJsonClient`](crate::http::HttpJsonClient); tests script their own.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, TeamSyncError};
use crate::protocol::{JoinOutcome, JoinResponse, QueueStatus, RemoteRoom};

/// HTTP method of a [`JsonClient`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        })
    }
}

/// A generic authenticated JSON request client.
///
/// Implementations attach the current bearer credential on every call and
/// map non-success responses to [`TeamSyncError::Api`] carrying the status
/// and the body's `detail` field.
#[async_trait]
pub trait JsonClient: Send + Sync + 'static {
    /// Issue one request against a path relative to the service base URL.
    ///
    /// An empty success body is returned as [`Value::Null`].
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value>;
}

/// Typed access to the matchmaking and room endpoints.
#[derive(Clone)]
pub struct RemoteService {
    client: Arc<dyn JsonClient>,
}

impl RemoteService {
    /// Wrap a request client.
    pub fn new(client: Arc<dyn JsonClient>) -> Self {
        Self { client }
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T> {
        let value = self.client.request(method, path, None).await?;
        serde_json::from_value(value)
            .map_err(|e| TeamSyncError::InvalidResponse(format!("{method} {path}: {e}")))
    }

    /// `POST /matchmaking/join`.
    pub async fn join_queue(&self) -> Result<JoinOutcome> {
        let value = self
            .client
            .request(Method::Post, "/matchmaking/join", None)
            .await?;
        // Null or non-object bodies are "unrecognized", not failures.
        let response = serde_json::from_value::<JoinResponse>(value).unwrap_or_default();
        Ok(response.into_outcome())
    }

    /// `POST /matchmaking/leave`.
    pub async fn leave_queue(&self) -> Result<()> {
        self.client
            .request(Method::Post, "/matchmaking/leave", None)
            .await
            .map(drop)
    }

    /// `GET /matchmaking/status`.
    pub async fn queue_status(&self) -> Result<QueueStatus> {
        self.call(Method::Get, "/matchmaking/status").await
    }

    /// `GET /rooms/my`. A 404 (or an empty body) means no room.
    pub async fn my_room(&self) -> Result<Option<RemoteRoom>> {
        match self.client.request(Method::Get, "/rooms/my", None).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| TeamSyncError::InvalidResponse(format!("GET /rooms/my: {e}"))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `GET /rooms/`.
    pub async fn list_rooms(&self) -> Result<Vec<RemoteRoom>> {
        self.call(Method::Get, "/rooms/").await
    }

    /// `GET /rooms/{id}`. A 404 is returned as an error.
    pub async fn get_room(&self, room_id: &str) -> Result<RemoteRoom> {
        self.call(Method::Get, &format!("/rooms/{room_id}")).await
    }

    /// `POST /rooms/{id}/leave`.
    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        self.client
            .request(Method::Post, &format!("/rooms/{room_id}/leave"), None)
            .await
            .map(drop)
    }

    /// `DELETE /rooms/{id}/members/me`, the fallback removal call.
    pub async fn remove_membership(&self, room_id: &str) -> Result<()> {
        self.client
            .request(Method::Delete, &format!("/rooms/{room_id}/members/me"), None)
            .await
            .map(drop)
    }
}

impl fmt::Debug for RemoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteService").finish_non_exhaustive()
    }
}
