//! # Session Recovery
//!
//! When a connection drops unexpectedly, the engine saves enough state to ask
//! the server to resume the same logical session on the next connection.
//!
//! ## Record Lifecycle:
//! 1. **Saved** on every non-intentional close
//! 2. **Offered** in `session.resume` on the next transport open, if it is
//!    within the TTL and belongs to the conversation being connected
//! 3. **Cleared** on intentional disconnect and when the server answers
//!    `session.resume.nak`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::EngineResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub session_id: String,
    pub conversation_id: Option<String>,
    /// Last message sequence handed to the dispatcher
    pub last_seq: Option<u64>,
    /// Last audio frame sequence handed to the scheduler
    pub last_audio_seq: Option<u64>,
    pub partial_transcript: String,
    pub partial_response: String,
    pub saved_at: DateTime<Utc>,
}

impl RecoveryRecord {
    /// Whether this record may be offered for `conversation_id` at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>, ttl: Duration, conversation_id: Option<&str>) -> bool {
        let age = now.signed_duration_since(self.saved_at);
        let Ok(age) = age.to_std() else {
            // saved in the future: clock skew, treat as fresh
            return self.conversation_id.as_deref() == conversation_id;
        };
        if age > ttl {
            debug!(age_s = age.as_secs(), ttl_s = ttl.as_secs(), "recovery record expired");
            return false;
        }
        self.conversation_id.as_deref() == conversation_id
    }
}

/// Where recovery records live between connections.
pub trait RecoveryStore: Send {
    fn load(&mut self) -> EngineResult<Option<RecoveryRecord>>;

    fn save(&mut self, record: &RecoveryRecord) -> EngineResult<()>;

    fn clear(&mut self) -> EngineResult<()>;
}

/// Keeps the record in memory. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecoveryStore {
    slot: Arc<Mutex<Option<RecoveryRecord>>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self) -> Option<RecoveryRecord> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RecoveryStore for MemoryRecoveryStore {
    fn load(&mut self) -> EngineResult<Option<RecoveryRecord>> {
        Ok(self.peek())
    }

    fn save(&mut self, record: &RecoveryRecord) -> EngineResult<()> {
        *self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(record.clone());
        Ok(())
    }

    fn clear(&mut self) -> EngineResult<()> {
        *self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

/// Keeps the record as JSON in a file, so it survives a process restart.
#[derive(Debug, Clone)]
pub struct FileRecoveryStore {
    path: PathBuf,
}

impl FileRecoveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl RecoveryStore for FileRecoveryStore {
    fn load(&mut self) -> EngineResult<Option<RecoveryRecord>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A corrupt record is as good as no record
                warn!(path = %self.path.display(), error = %e, "discarding unreadable recovery record");
                Ok(None)
            }
        }
    }

    fn save(&mut self, record: &RecoveryRecord) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn clear(&mut self) -> EngineResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(conversation: Option<&str>, saved_at: DateTime<Utc>) -> RecoveryRecord {
        RecoveryRecord {
            session_id: "sess-1".to_string(),
            conversation_id: conversation.map(str::to_string),
            last_seq: Some(41),
            last_audio_seq: Some(7),
            partial_transcript: "book a".to_string(),
            partial_response: "Sure, I".to_string(),
            saved_at,
        }
    }

    #[test]
    fn test_ttl_and_conversation_match() {
        let now = Utc::now();
        let ttl = Duration::from_secs(120);

        let fresh = record(Some("c1"), now - chrono::Duration::seconds(30));
        assert!(fresh.is_usable(now, ttl, Some("c1")));
        assert!(!fresh.is_usable(now, ttl, Some("c2")));
        assert!(!fresh.is_usable(now, ttl, None));

        let stale = record(Some("c1"), now - chrono::Duration::seconds(300));
        assert!(!stale.is_usable(now, ttl, Some("c1")));
    }

    #[test]
    fn test_file_store_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileRecoveryStore::new(dir.path().join("nested").join("recovery.json"));

        assert_eq!(store.load().unwrap(), None);
        let saved = record(None, Utc::now());
        store.save(&saved).unwrap();
        assert_eq!(store.load().unwrap(), Some(saved));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.json");
        std::fs::write(&path, "{ half a record").unwrap();
        let mut store = FileRecoveryStore::new(path);
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_memory_store_clones_share_slot() {
        let mut store = MemoryRecoveryStore::new();
        let probe = store.clone();
        store.save(&record(None, Utc::now())).unwrap();
        assert_eq!(probe.peek().unwrap().last_seq, Some(41));
        store.clear().unwrap();
        assert!(probe.peek().is_none());
    }
}
