//! Durable local storage and the persisted room session record.
//!
//! [`Storage`] is a small string key-value interface shared by the
//! [`SessionStore`] (key `activeRoom`) and
//! [`StoredIdentity`](crate::identity::StoredIdentity) (keys `token` and
//! `currentUser`). Two backends ship with the crate: [`FileStorage`], which
//! survives process restarts, and [`MemoryStorage`].

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::Result;
use crate::model::RoomSession;

/// Storage key of the persisted [`RoomSession`].
pub const ACTIVE_ROOM_KEY: &str = "activeRoom";

/// String key-value persistence.
///
/// Implementations use interior mutability so one instance can be shared
/// (`Arc<dyn Storage>`) between the session store and the identity provider.
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

// ── File backend ────────────────────────────────────────────────────

/// One file per key inside a data directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    ///
    /// # Errors
    ///
    /// Returns [`TeamSyncError::Io`](crate::TeamSyncError::Io) if the
    /// directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Memory backend ──────────────────────────────────────────────────

/// In-process storage. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

// ── Session store ───────────────────────────────────────────────────

/// The single persisted [`RoomSession`] record.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn Storage>,
}

impl SessionStore {
    /// Wrap a storage backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Load the persisted session.
    ///
    /// A record that fails to decode is removed and reported as absent.
    pub fn load(&self) -> Result<Option<RoomSession>> {
        let Some(raw) = self.storage.get(ACTIVE_ROOM_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str::<RoomSession>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("discarding unreadable persisted session: {e}");
                self.storage.remove(ACTIVE_ROOM_KEY)?;
                Ok(None)
            }
        }
    }

    /// Persist `session`, replacing any previous record.
    pub fn save(&self, session: &RoomSession) -> Result<()> {
        let raw = serde_json::to_string(session)?;
        self.storage.set(ACTIVE_ROOM_KEY, &raw)?;
        debug!(room_id = %session.room_id, "session persisted");
        Ok(())
    }

    /// Remove the persisted record.
    pub fn clear(&self) -> Result<()> {
        self.storage.remove(ACTIVE_ROOM_KEY)?;
        debug!("persisted session cleared");
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{Member, MemberRole};

    fn sample_session() -> RoomSession {
        RoomSession::new(
            "42",
            Some("u1".into()),
            vec![Member {
                id: "u1".into(),
                display_name: "Ana".into(),
                handle: "ana".into(),
                role: MemberRole::Leader,
                avatar_ref: "seed:ana".into(),
            }],
        )
    }

    #[test]
    fn memory_store_round_trip() {
        let store = SessionStore::new(Arc::new(MemoryStorage::new()));
        assert_eq!(store.load().unwrap(), None);
        store.save(&sample_session()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample_session()));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            SessionStore::new(Arc::new(storage))
                .save(&sample_session())
                .unwrap();
        }
        let reopened = FileStorage::open(dir.path()).unwrap();
        let loaded = SessionStore::new(Arc::new(reopened)).load().unwrap();
        assert_eq!(loaded, Some(sample_session()));
    }

    #[test]
    fn file_remove_of_missing_key_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.remove("nothing-here").unwrap();
        assert_eq!(storage.get("nothing-here").unwrap(), None);
    }

    #[test]
    fn corrupt_record_is_discarded() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(ACTIVE_ROOM_KEY, "{not json").unwrap();
        let store = SessionStore::new(storage.clone());
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(storage.get(ACTIVE_ROOM_KEY).unwrap(), None);
    }
}
