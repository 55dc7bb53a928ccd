use crate::crypto::Cipher;
use crate::error::{Result, SealDbError};
use crate::links::Adjacency;
use crate::schema::Schema;
use crate::validation::ValidatorRecord;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Everything that is written to disk, as one JSON document before encryption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub schemas: IndexMap<String, Schema>,
    #[serde(default)]
    pub validators: IndexMap<String, ValidatorRecord>,
    #[serde(default)]
    pub links: Adjacency,
    #[serde(default, rename = "linkedTo")]
    pub linked_to: Adjacency,
}

/// Loads and saves the encrypted database file.
pub struct PersistenceCoordinator {
    path: PathBuf,
    cipher: Box<dyn Cipher>,
}

impl PersistenceCoordinator {
    pub fn new(path: impl Into<PathBuf>, cipher: Box<dyn Cipher>) -> Self {
        Self {
            path: path.into(),
            cipher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swap the cipher used by subsequent loads and saves.
    pub fn set_cipher(&mut self, cipher: Box<dyn Cipher>) -> Box<dyn Cipher> {
        std::mem::replace(&mut self.cipher, cipher)
    }

    /// Read the file. `Ok(None)` when there is no file or it is blank;
    /// [`SealDbError::CorruptState`] when it cannot be decrypted or parsed.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        self.load_from(&self.path)
    }

    /// Read another file (a backup, say) with this coordinator's cipher.
    pub fn load_from(&self, path: &Path) -> Result<Option<PersistedState>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No database file at {}; starting empty", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let plaintext = self
            .cipher
            .decrypt(&raw)
            .map_err(|e| corrupt(path, e.to_string()))?;
        let state: PersistedState = serde_json::from_slice(&plaintext)
            .map_err(|e| corrupt(path, format!("invalid JSON after decryption: {e}")))?;

        log::debug!("Loaded {} keys from {}", state.data.len(), path.display());
        Ok(Some(state))
    }

    /// Encrypt and write the whole state, replacing the file atomically.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let plaintext = serde_json::to_vec_pretty(state)?;
        let ciphertext = self.cipher.encrypt(&plaintext)?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&ciphertext)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| SealDbError::Io(e.error))?;

        log::debug!(
            "Saved {} keys to {} ({} bytes)",
            state.data.len(),
            self.path.display(),
            ciphertext.len()
        );
        Ok(())
    }
}

fn corrupt(path: &Path, reason: String) -> SealDbError {
    SealDbError::CorruptState {
        path: path.display().to_string(),
        reason,
    }
}

impl std::fmt::Debug for PersistenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceCoordinator")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmCipher;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn coordinator(path: &Path, secret: &str) -> PersistenceCoordinator {
        PersistenceCoordinator::new(path, Box::new(AesGcmCipher::new(secret).unwrap()))
    }

    fn sample_state() -> PersistedState {
        let mut state = PersistedState::default();
        state.data.insert("user:1".into(), json!({"name": "Ann", "tags": ["a"]}));
        state.data.insert("counter".into(), json!(3));
        state.schemas.insert(
            "user:".into(),
            Schema::from_value(json!({"name": {"type": "string", "required": true}})).unwrap(),
        );
        state.validators.insert(
            "isEmail".into(),
            ValidatorRecord {
                registered_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            },
        );
        state.links.entry("user:1".into()).or_default().insert("counter".into());
        state.linked_to.entry("counter".into()).or_default().insert("user:1".into());
        state
    }

    #[test]
    fn test_missing_and_blank_files_are_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        assert_eq!(coordinator(&path, "k").load().unwrap(), None);

        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(coordinator(&path, "k").load().unwrap(), None);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("dir").join("store.db");
        let state = sample_state();

        coordinator(&path, "k").save(&state).unwrap();
        assert!(path.exists());
        let raw = std::fs::read(&path).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("Ann"));

        let loaded = coordinator(&path, "k").load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_wrong_key_is_corrupt_state() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        coordinator(&path, "right").save(&sample_state()).unwrap();

        let err = coordinator(&path, "wrong").load().unwrap_err();
        assert!(matches!(err, SealDbError::CorruptState { .. }));
    }

    #[test]
    fn test_garbage_is_corrupt_state() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        std::fs::write(&path, b"definitely not ciphertext, but long enough to be split").unwrap();
        assert!(matches!(
            coordinator(&path, "k").load(),
            Err(SealDbError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_partial_document_defaults() {
        let state: PersistedState = serde_json::from_value(json!({"data": {"a": 1}})).unwrap();
        assert_eq!(state.data.len(), 1);
        assert!(state.schemas.is_empty());
        assert!(state.links.is_empty());

        let serialized = serde_json::to_value(&sample_state()).unwrap();
        assert_eq!(serialized["linkedTo"], json!({"counter": ["user:1"]}));
        assert_eq!(serialized["validators"]["isEmail"]["registeredAt"], json!("2024-05-01T12:00:00Z"));
    }
}
