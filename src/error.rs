//! Error types for the TeamSync client.

use thiserror::Error;

use crate::failure::FailureKind;

/// Errors that can occur when using the TeamSync client.
#[derive(Debug, Error)]
pub enum TeamSyncError {
    /// Failed to send a frame through the stream transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the stream transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a wire payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote service answered with a non-success status.
    #[error("api error {status}: {}", detail.as_deref().unwrap_or("no detail"))]
    Api {
        /// HTTP status code.
        status: u16,
        /// Human-readable `detail` field from the response body, if any.
        detail: Option<String>,
    },

    /// The request never produced a response (DNS, connect, TLS, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The remote service answered with a payload we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The stream channel is not open.
    #[error("not connected to room channel")]
    NotConnected,

    /// No signed-in user is available.
    #[error("not signed in")]
    NotSignedIn,

    /// The identity provider is still resolving the current user.
    #[error("identity is still loading")]
    IdentityLoading,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The background controller task is no longer running.
    #[error("session controller stopped")]
    ControllerStopped,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TeamSyncError {
    /// Classify this error by the HTTP status it carries, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Api { status, .. } => Some(FailureKind::from_status(*status)),
            _ => None,
        }
    }

    /// Returns `true` when the remote service rejected the credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.failure_kind(), Some(FailureKind::Unauthorized))
    }

    /// Returns `true` when the remote service reported the resource missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self.failure_kind(), Some(FailureKind::NotFound))
    }

    /// A short human-readable reason suitable for showing to the user.
    ///
    /// Prefers the server's `detail`; falls back to a generic description.
    pub fn user_message(&self) -> String {
        match self {
            Self::Api {
                detail: Some(detail),
                ..
            } if !detail.trim().is_empty() => detail.clone(),
            Self::Api { status, .. } => FailureKind::from_status(*status).description().to_string(),
            Self::Network(_) | Self::Timeout => {
                "Could not reach the server. Check your connection and try again.".to_string()
            }
            Self::NotConnected | Self::TransportClosed => {
                "Disconnected from the room. Messages cannot be sent right now.".to_string()
            }
            Self::NotSignedIn => "You need to sign in first.".to_string(),
            Self::IdentityLoading => "Still loading your account, try again shortly.".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

#[cfg(feature = "http-reqwest")]
impl From<reqwest::Error> for TeamSyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// A specialized [`Result`] type for TeamSync client operations.
pub type Result<T> = std::result::Result<T, TeamSyncError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn api_detail_is_preferred_for_user_message() {
        let err = TeamSyncError::Api {
            status: 400,
            detail: Some("Already in queue".into()),
        };
        assert_eq!(err.user_message(), "Already in queue");
    }

    #[test]
    fn blank_detail_falls_back_to_generic_message() {
        let err = TeamSyncError::Api {
            status: 500,
            detail: Some("   ".into()),
        };
        assert_eq!(err.user_message(), FailureKind::Server.description());
    }

    #[test]
    fn status_classification() {
        let unauthorized = TeamSyncError::Api {
            status: 401,
            detail: None,
        };
        assert!(unauthorized.is_unauthorized());
        assert!(!unauthorized.is_not_found());

        let missing = TeamSyncError::Api {
            status: 404,
            detail: None,
        };
        assert!(missing.is_not_found());
        assert!(!TeamSyncError::Timeout.is_unauthorized());
    }

    #[test]
    fn display_includes_detail() {
        let err = TeamSyncError::Api {
            status: 409,
            detail: Some("conflict".into()),
        };
        assert_eq!(err.to_string(), "api error 409: conflict");
    }
}
