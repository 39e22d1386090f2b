//! Resumption checkpoint persistence
//!
//! Keeps the last resumable-session URL of each file in a JSON file so a
//! restarted process resumes the same server-side sessions instead of
//! starting over. Records are written through the uploader as progress is
//! confirmed and restored into the file registry on startup.

use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::path::Path;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hauler_common::{FileId, FileRegistry};

use crate::constants::{APP_DIR_NAME, CHECKPOINT_FILE_NAME};
use crate::error::StoreError;

/// File permissions for the checkpoint file on Unix (owner read/write only)
#[cfg(unix)]
const CHECKPOINT_FILE_MODE: u32 = 0o600;

/// Persisted resumption state of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumptionRecord {
    pub file_id: FileId,
    /// Last confirmed resumable-session URL; cleared on progress reset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    /// Unix timestamp of the last change
    pub updated_at: i64,
}

/// On-disk file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointFile {
    records: Vec<ResumptionRecord>,
}

/// Resumption records indexed by file id, optionally backed by a file
#[derive(Debug, Default)]
pub struct ResumptionStore {
    path: Option<PathBuf>,
    records: HashMap<FileId, ResumptionRecord>,
    /// Whether there are unsaved changes
    dirty: bool,
}

impl ResumptionStore {
    /// Create a store that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Platform-specific default checkpoint path
    ///
    /// Returns None if the data directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join(APP_DIR_NAME).join(CHECKPOINT_FILE_NAME))
    }

    /// Open the store at the default path
    pub fn open_default() -> Result<Self, StoreError> {
        let path = Self::default_path().ok_or(StoreError::NoDataDir)?;
        Ok(Self::open(path))
    }

    /// Load records from `path`, or start empty
    ///
    /// A missing, unreadable or malformed file yields an empty store that
    /// will overwrite it on the next save.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<CheckpointFile>(&contents) {
                Ok(file) => file
                    .records
                    .into_iter()
                    .map(|r| (r.file_id.clone(), r))
                    .collect(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring malformed checkpoint file");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: Some(path),
            records,
            dirty: false,
        }
    }

    /// Record a confirmed upload URL
    ///
    /// Returns false if the stored URL was already current.
    pub fn record(&mut self, file_id: &FileId, upload_url: String) -> bool {
        let now = chrono::Utc::now().timestamp();
        match self.records.get_mut(file_id) {
            Some(record) if record.upload_url.as_deref() == Some(upload_url.as_str()) => false,
            Some(record) => {
                record.upload_url = Some(upload_url);
                record.updated_at = now;
                self.dirty = true;
                true
            }
            None => {
                self.records.insert(
                    file_id.clone(),
                    ResumptionRecord {
                        file_id: file_id.clone(),
                        upload_url: Some(upload_url),
                        updated_at: now,
                    },
                );
                self.dirty = true;
                true
            }
        }
    }

    /// Stored URL for a file
    pub fn upload_url(&self, file_id: &FileId) -> Option<&str> {
        self.records.get(file_id)?.upload_url.as_deref()
    }

    pub fn get(&self, file_id: &FileId) -> Option<&ResumptionRecord> {
        self.records.get(file_id)
    }

    /// Drop every stored URL, keeping the records themselves
    ///
    /// Returns the number of URLs cleared.
    pub fn clear_urls(&mut self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let mut cleared = 0;
        for record in self.records.values_mut() {
            if record.upload_url.take().is_some() {
                record.updated_at = now;
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.dirty = true;
        }
        cleared
    }

    /// Forget a file entirely
    pub fn remove(&mut self, file_id: &FileId) -> Option<ResumptionRecord> {
        let record = self.records.remove(file_id);
        if record.is_some() {
            self.dirty = true;
        }
        record
    }

    /// Copy stored URLs onto registered files that have none yet
    ///
    /// Returns the number of files updated.
    pub fn restore_into(&self, files: &FileRegistry) -> usize {
        let mut restored = 0;
        for id in files.ids() {
            let Some(url) = self.upload_url(&id) else {
                continue;
            };
            let has_url = files.get(&id).is_some_and(|f| f.upload_url().is_some());
            if !has_url && files.set_upload_url(&id, url.to_string()) {
                restored += 1;
            }
        }
        tracing::debug!(restored, "restored resumption records");
        restored
    }

    /// Save records to disk with restrictive permissions
    ///
    /// Only writes if there are unsaved changes and the store has a path.
    pub fn save(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = self.path.as_ref() else {
            self.dirty = false;
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut records: Vec<ResumptionRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        let json = serde_json::to_string_pretty(&CheckpointFile { records })?;
        fs::write(path, json)?;

        #[cfg(unix)]
        Self::set_checkpoint_permissions(path)?;

        self.dirty = false;
        Ok(())
    }

    #[cfg(unix)]
    fn set_checkpoint_permissions(path: &Path) -> Result<(), StoreError> {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(CHECKPOINT_FILE_MODE);
        fs::set_permissions(path, perms)?;
        Ok(())
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Check if there are unsaved changes
    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use hauler_common::UploadFile;
    use tempfile::TempDir;

    #[test]
    fn test_record_marks_dirty_only_on_change() {
        let mut store = ResumptionStore::in_memory();
        let id = FileId::new("f1");

        assert!(store.record(&id, "https://tus.example/files/1".into()));
        assert!(store.is_dirty());
        store.save().unwrap();
        assert!(!store.is_dirty());

        assert!(!store.record(&id, "https://tus.example/files/1".into()));
        assert!(!store.is_dirty());

        assert!(store.record(&id, "https://tus.example/files/2".into()));
        assert_eq!(store.upload_url(&id), Some("https://tus.example/files/2"));
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("resumption.json");

        let mut store = ResumptionStore::open(&path);
        assert!(store.is_empty());
        store.record(&FileId::new("f1"), "https://tus.example/files/1".into());
        store.record(&FileId::new("f2"), "https://tus.example/files/2".into());
        store.save().unwrap();

        let reopened = ResumptionStore::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.upload_url(&FileId::new("f2")),
            Some("https://tus.example/files/2")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resumption.json");
        let mut store = ResumptionStore::open(&path);
        store.record(&FileId::new("f1"), "u".into());
        store.save().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_malformed_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resumption.json");
        fs::write(&path, "{ not json").unwrap();

        let store = ResumptionStore::open(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_urls_keeps_records() {
        let mut store = ResumptionStore::in_memory();
        let id = FileId::new("f1");
        store.record(&id, "https://tus.example/files/1".into());
        store.save().unwrap();

        assert_eq!(store.clear_urls(), 1);
        assert!(store.is_dirty());
        assert_eq!(store.upload_url(&id), None);
        assert!(store.get(&id).is_some());

        assert_eq!(store.clear_urls(), 0);
    }

    #[test]
    fn test_restore_into_registry() {
        let files = FileRegistry::new();
        files.add(UploadFile::local("f1", "a.png", Vec::new()));
        let mut with_url = UploadFile::local("f2", "b.png", Vec::new());
        with_url.overrides = Some(hauler_common::UploadOverrides {
            upload_url: Some("https://tus.example/files/current".into()),
            ..Default::default()
        });
        files.add(with_url);

        let mut store = ResumptionStore::in_memory();
        store.record(&FileId::new("f1"), "https://tus.example/files/1".into());
        store.record(&FileId::new("f2"), "https://tus.example/files/old".into());
        store.record(&FileId::new("gone"), "https://tus.example/files/3".into());

        assert_eq!(store.restore_into(&files), 1);
        assert_eq!(
            files.get(&FileId::new("f1")).unwrap().upload_url(),
            Some("https://tus.example/files/1")
        );
        // Existing URLs win
        assert_eq!(
            files.get(&FileId::new("f2")).unwrap().upload_url(),
            Some("https://tus.example/files/current")
        );
    }

    #[test]
    fn test_remove() {
        let mut store = ResumptionStore::in_memory();
        let id = FileId::new("f1");
        store.record(&id, "u".into());
        assert!(store.remove(&id).is_some());
        assert!(store.remove(&id).is_none());
    }
}
