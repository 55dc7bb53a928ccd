use crate::error::{Result, SealDbError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const METADATA_SUFFIX: &str = ".meta";
const BACKUP_MARKER: &str = ".backup.";
const PRE_RESTORE_MARKER: &str = ".pre-restore.";

/// Sidecar written next to a backup when metadata is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub backup_date: DateTime<Utc>,
    pub original_path: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupEntry {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub metadata: Option<BackupMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupValidation {
    fn invalid(error: &str) -> Self {
        Self {
            valid: false,
            size: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub metadata: Option<BackupMetadata>,
}

/// File-level backups of one database file. Backups are byte copies of the
/// encrypted file, so they stay encrypted under the key in use when they were taken.
#[derive(Debug, Clone)]
pub struct BackupManager {
    db_path: PathBuf,
}

impl BackupManager {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Copy the database file to `target` (default `<db>.backup.<timestamp>`).
    pub fn backup(&self, target: Option<&Path>, include_metadata: bool) -> Result<PathBuf> {
        if !self.db_path.exists() {
            return Err(SealDbError::NotFound(format!(
                "Database file {}",
                self.db_path.display()
            )));
        }

        let target = match target {
            Some(path) => path.to_path_buf(),
            None => suffixed(
                &self.db_path,
                &format!("{BACKUP_MARKER}{}", Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ")),
            ),
        };
        ensure_parent(&target)?;
        std::fs::copy(&self.db_path, &target)?;

        if include_metadata {
            let metadata = BackupMetadata {
                backup_date: Utc::now(),
                original_path: self.db_path.display().to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                kind: "full_backup".to_string(),
            };
            std::fs::write(
                suffixed(&target, METADATA_SUFFIX),
                serde_json::to_string_pretty(&metadata)?,
            )?;
        }

        log::info!("Backed up {} to {}", self.db_path.display(), target.display());
        Ok(target)
    }

    /// Replace the database file with `source`. When `backup_current` is set and a
    /// database file exists, it is first copied to `<db>.pre-restore.<millis>`,
    /// whose path is returned.
    pub fn restore(&self, source: &Path, backup_current: bool) -> Result<Option<PathBuf>> {
        if !source.exists() {
            return Err(SealDbError::NotFound(format!("Backup file {}", source.display())));
        }

        let mut safety_copy = None;
        if backup_current && self.db_path.exists() {
            let target = suffixed(
                &self.db_path,
                &format!("{PRE_RESTORE_MARKER}{}", Utc::now().timestamp_millis()),
            );
            safety_copy = Some(self.backup(Some(&target), false)?);
        }

        let bytes = std::fs::read(source)?;
        let parent = ensure_parent(&self.db_path)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.db_path).map_err(|e| SealDbError::Io(e.error))?;

        match read_metadata(source) {
            Some(meta) => log::info!(
                "Restored {} from {} (taken {} from {})",
                self.db_path.display(),
                source.display(),
                meta.backup_date,
                meta.original_path
            ),
            None => log::info!("Restored {} from {}", self.db_path.display(), source.display()),
        }
        Ok(safety_copy)
    }

    /// Backup files in `dir` (default: the database's directory), newest first.
    pub fn list_backups(&self, dir: Option<&Path>) -> Result<Vec<BackupEntry>> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => self.default_dir(),
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if filename.ends_with(METADATA_SUFFIX)
                || !(filename.contains(BACKUP_MARKER) || filename.contains(PRE_RESTORE_MARKER))
            {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let path = entry.path();
            entries.push(BackupEntry {
                filename,
                size: meta.len(),
                modified: DateTime::<Utc>::from(meta.modified()?),
                metadata: read_metadata(&path),
                path,
            });
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(entries)
    }

    /// Delete backups older than `max_age_days`, then all but the newest `max_count`.
    /// Returns how many backups were deleted.
    pub fn cleanup_backups(
        &self,
        dir: Option<&Path>,
        max_age_days: Option<u32>,
        max_count: Option<usize>,
    ) -> Result<usize> {
        let mut deleted = 0;

        if let Some(days) = max_age_days {
            let cutoff = Utc::now() - Duration::days(i64::from(days));
            for entry in self.list_backups(dir)? {
                if entry.modified < cutoff && remove_backup(&entry.path) {
                    deleted += 1;
                }
            }
        }

        if let Some(max_count) = max_count {
            for entry in self.list_backups(dir)?.into_iter().skip(max_count) {
                if remove_backup(&entry.path) {
                    deleted += 1;
                }
            }
        }

        if deleted > 0 {
            log::info!("Removed {deleted} old backups");
        }
        Ok(deleted)
    }

    pub fn validate_backup(&self, path: &Path) -> BackupValidation {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => return BackupValidation::invalid("Backup file not found"),
        };
        if meta.len() == 0 {
            return BackupValidation::invalid("Backup file is empty");
        }
        match std::fs::read(path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => {
                BackupValidation::invalid("Backup file contains no data")
            }
            Ok(_) => BackupValidation {
                valid: true,
                size: Some(meta.len()),
                error: None,
            },
            Err(e) => BackupValidation::invalid(&e.to_string()),
        }
    }

    pub fn backup_info(&self, path: &Path) -> Result<BackupInfo> {
        let validation = self.validate_backup(path);
        if !validation.valid {
            let reason = validation.error.unwrap_or_default();
            return Err(SealDbError::NotFound(format!("{} ({reason})", path.display())));
        }
        let meta = std::fs::metadata(path)?;
        Ok(BackupInfo {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: DateTime::<Utc>::from(meta.modified()?),
            metadata: read_metadata(path),
        })
    }

    fn default_dir(&self) -> PathBuf {
        match self.db_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn ensure_parent(path: &Path) -> Result<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    Ok(parent)
}

fn read_metadata(backup: &Path) -> Option<BackupMetadata> {
    let sidecar = suffixed(backup, METADATA_SUFFIX);
    let content = std::fs::read_to_string(&sidecar).ok()?;
    match serde_json::from_str(&content) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::warn!("Ignoring unreadable backup metadata {}: {e}", sidecar.display());
            None
        }
    }
}

fn remove_backup(path: &Path) -> bool {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Could not delete backup {}: {e}", path.display());
        return false;
    }
    let sidecar = suffixed(path, METADATA_SUFFIX);
    if sidecar.exists() {
        if let Err(e) = std::fs::remove_file(&sidecar) {
            log::warn!("Could not delete backup metadata {}: {e}", sidecar.display());
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::{Duration as StdDuration, SystemTime};
    use tempfile::TempDir;

    fn setup() -> (TempDir, BackupManager, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("app.db");
        std::fs::write(&db, b"ciphertext-v1").unwrap();
        let manager = BackupManager::new(&db);
        (tmp, manager, db)
    }

    fn age(path: &Path, days: u64) {
        let when = SystemTime::now() - StdDuration::from_secs(days * 24 * 60 * 60);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[test]
    fn test_backup_default_name_and_metadata() {
        let (_tmp, manager, db) = setup();
        let path = manager.backup(None, true).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("app.db.backup."));
        assert_eq!(std::fs::read(&path).unwrap(), b"ciphertext-v1");

        let meta = read_metadata(&path).unwrap();
        assert_eq!(meta.original_path, db.display().to_string());
        assert_eq!(meta.kind, "full_backup");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(suffixed(&path, ".meta")).unwrap()).unwrap();
        assert!(raw.get("backupDate").is_some());
        assert_eq!(raw["type"], "full_backup");
    }

    #[test]
    fn test_backup_requires_database_file() {
        let tmp = TempDir::new().unwrap();
        let manager = BackupManager::new(tmp.path().join("missing.db"));
        assert!(matches!(manager.backup(None, false), Err(SealDbError::NotFound(_))));
    }

    #[test]
    fn test_restore_keeps_safety_copy() {
        let (tmp, manager, db) = setup();
        let snapshot = manager.backup(Some(&tmp.path().join("snap.backup.1")), false).unwrap();
        std::fs::write(&db, b"ciphertext-v2").unwrap();

        let safety = manager.restore(&snapshot, true).unwrap().unwrap();
        assert_eq!(std::fs::read(&db).unwrap(), b"ciphertext-v1");
        assert_eq!(std::fs::read(&safety).unwrap(), b"ciphertext-v2");
        assert!(safety.to_string_lossy().contains(".pre-restore."));

        assert_eq!(manager.restore(&snapshot, false).unwrap(), None);
        assert!(matches!(
            manager.restore(&tmp.path().join("nope"), true),
            Err(SealDbError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_and_cleanup() {
        let (tmp, manager, _db) = setup();
        let old = manager.backup(Some(&tmp.path().join("app.db.backup.old")), true).unwrap();
        let mid = manager.backup(Some(&tmp.path().join("app.db.backup.mid")), false).unwrap();
        let new = manager.backup(Some(&tmp.path().join("app.db.backup.new")), false).unwrap();
        std::fs::write(tmp.path().join("unrelated.txt"), b"x").unwrap();
        age(&old, 40);
        age(&mid, 5);

        let listed = manager.list_backups(None).unwrap();
        let names: Vec<_> = listed.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["app.db.backup.new", "app.db.backup.mid", "app.db.backup.old"]);
        assert!(listed[2].metadata.is_some());

        assert_eq!(manager.cleanup_backups(None, Some(30), None).unwrap(), 1);
        assert!(!old.exists());
        assert!(!suffixed(&old, ".meta").exists());

        assert_eq!(manager.cleanup_backups(None, None, Some(1)).unwrap(), 1);
        assert!(new.exists());
        assert!(!mid.exists());
    }

    #[test]
    fn test_validate_and_info() {
        let (tmp, manager, db) = setup();
        assert!(manager.validate_backup(&db).valid);
        assert_eq!(manager.validate_backup(&db).size, Some(13));

        let empty = tmp.path().join("empty.backup.1");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(
            manager.validate_backup(&empty).error.as_deref(),
            Some("Backup file is empty")
        );

        let blank = tmp.path().join("blank.backup.1");
        std::fs::write(&blank, b"   ").unwrap();
        assert!(!manager.validate_backup(&blank).valid);
        assert!(!manager.validate_backup(&tmp.path().join("none")).valid);

        let info = manager.backup_info(&db).unwrap();
        assert_eq!(info.size, 13);
        assert_eq!(info.metadata, None);
        assert!(manager.backup_info(&blank).is_err());
    }
}
