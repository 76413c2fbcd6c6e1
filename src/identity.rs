//! Identity provider: who the current user is and which credential to send.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::protocol::{de_id, UserId};
use crate::store::Storage;

/// Storage key holding the bearer credential.
pub const TOKEN_KEY: &str = "token";

/// Storage key holding the serialized [`UserIdentity`].
pub const CURRENT_USER_KEY: &str = "currentUser";

/// The signed-in user, as returned by the login endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    #[serde(deserialize_with = "de_id")]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserIdentity {
    /// Create an identity with only an id.
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            username: None,
            email: None,
        }
    }

    /// Set the handle.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Source of the current user and credential.
pub trait IdentityProvider: Send + Sync {
    /// The signed-in user, if any.
    fn current_user(&self) -> Option<UserIdentity>;

    /// The bearer credential to attach to requests and the stream endpoint.
    fn token(&self) -> Option<String>;

    /// `true` while the provider is still resolving the user.
    fn is_loading(&self) -> bool {
        false
    }
}

/// Identity persisted in [`Storage`] under `token` and `currentUser`.
///
/// A user is only reported when both keys are present.
#[derive(Clone)]
pub struct StoredIdentity {
    storage: Arc<dyn Storage>,
}

impl StoredIdentity {
    /// Read identity from `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Persist a freshly issued credential and its user.
    pub fn sign_in(&self, user: &UserIdentity, token: &str) -> Result<()> {
        self.storage.set(TOKEN_KEY, token)?;
        self.storage
            .set(CURRENT_USER_KEY, &serde_json::to_string(user)?)?;
        Ok(())
    }

    /// Forget the credential and user.
    pub fn sign_out(&self) -> Result<()> {
        self.storage.remove(TOKEN_KEY)?;
        self.storage.remove(CURRENT_USER_KEY)?;
        Ok(())
    }
}

impl IdentityProvider for StoredIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.token()?;
        let raw = match self.storage.get(CURRENT_USER_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("failed to read stored user: {e}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("stored user is unreadable: {e}");
                None
            }
        }
    }

    fn token(&self) -> Option<String> {
        match self.storage.get(TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!("failed to read stored token: {e}");
                None
            }
        }
    }
}

impl std::fmt::Debug for StoredIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredIdentity").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn identity_requires_token_and_user() {
        let storage = Arc::new(MemoryStorage::new());
        let identity = StoredIdentity::new(storage.clone());
        assert_eq!(identity.current_user(), None);

        storage.set(CURRENT_USER_KEY, r#"{"id": 7, "username": "ana"}"#).unwrap();
        assert_eq!(identity.current_user(), None, "no token yet");

        storage.set(TOKEN_KEY, "tok").unwrap();
        let user = identity.current_user().unwrap();
        assert_eq!(user.id, "7");
        assert_eq!(user.username.as_deref(), Some("ana"));
    }

    #[test]
    fn sign_in_then_sign_out() {
        let identity = StoredIdentity::new(Arc::new(MemoryStorage::new()));
        let user = UserIdentity::new("u1").with_username("ana").with_name("Ana");
        identity.sign_in(&user, "secret").unwrap();
        assert_eq!(identity.current_user(), Some(user));
        assert_eq!(identity.token().as_deref(), Some("secret"));

        identity.sign_out().unwrap();
        assert_eq!(identity.current_user(), None);
        assert_eq!(identity.token(), None);
    }
}
