//! Failure classes for remote service errors.
//!
//! The matchmaking backend reports failures as an HTTP status plus an optional
//! `detail` string. [`FailureKind`] buckets the status so callers can decide
//! whether to keep polling, force re-authentication, or surface a message.

use std::fmt;

/// Coarse classification of a failed remote call, keyed by HTTP status.
///
/// Use [`description()`](FailureKind::description) for a human-readable
/// fallback when the server does not supply a `detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// 400 and other unclassified 4xx responses.
    BadRequest,
    /// 401: the credential was rejected.
    Unauthorized,
    /// 403: authenticated but not permitted.
    Forbidden,
    /// 404: the resource does not exist (yet).
    NotFound,
    /// 409: the request conflicts with current server state.
    Conflict,
    /// 422: the payload failed validation.
    Validation,
    /// 429: too many requests.
    RateLimited,
    /// 5xx responses.
    Server,
    /// Anything else (1xx/3xx, or statuses outside the HTTP range).
    Unexpected,
}

impl FailureKind {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            422 => Self::Validation,
            429 => Self::RateLimited,
            400..=499 => Self::BadRequest,
            500..=599 => Self::Server,
            _ => Self::Unexpected,
        }
    }

    /// Returns `true` if a poll that failed this way should simply try again
    /// on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound | Self::RateLimited | Self::Server)
    }

    /// Returns a human-readable description of this failure class.
    pub fn description(&self) -> &'static str {
        match self {
            Self::BadRequest => "The request could not be processed. Please try again.",
            Self::Unauthorized => "Your session has expired. Please sign in again.",
            Self::Forbidden => "You are not allowed to do that.",
            Self::NotFound => "The requested room could not be found. It may have been closed.",
            Self::Conflict => "That action conflicts with your current matchmaking state.",
            Self::Validation => "The request was rejected as invalid.",
            Self::RateLimited => "Too many requests. Please wait a moment and try again.",
            Self::Server => "The server ran into a problem. Please try again later.",
            Self::Unexpected => "Something went wrong. Please try again.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(FailureKind::from_status(401), FailureKind::Unauthorized);
        assert_eq!(FailureKind::from_status(403), FailureKind::Forbidden);
        assert_eq!(FailureKind::from_status(404), FailureKind::NotFound);
        assert_eq!(FailureKind::from_status(418), FailureKind::BadRequest);
        assert_eq!(FailureKind::from_status(503), FailureKind::Server);
        assert_eq!(FailureKind::from_status(302), FailureKind::Unexpected);
    }

    #[test]
    fn only_not_found_rate_limit_and_server_are_transient() {
        assert!(FailureKind::NotFound.is_transient());
        assert!(FailureKind::Server.is_transient());
        assert!(!FailureKind::Unauthorized.is_transient());
        assert!(!FailureKind::Validation.is_transient());
    }

    #[test]
    fn display_matches_description() {
        let kind = FailureKind::RateLimited;
        assert_eq!(kind.to_string(), kind.description());
    }
}
