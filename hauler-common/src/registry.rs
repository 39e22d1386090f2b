//! Host file registry
//!
//! Thread-safe store of the files known to the host. The upload core reads
//! snapshots from here and writes back state it owns: the remote session
//! token, the resumption URL, progress and error markers.
//!
//! Update methods return false when the file is no longer registered, which
//! callers treat as "the file was removed while we were working".

use std::collections::HashMap;
use std::sync::Mutex;

use crate::file::{FileId, FileProgress, UploadFile, UploadOverrides};

#[derive(Default)]
struct Files {
    by_id: HashMap<FileId, UploadFile>,
    /// Insertion order of ids in `by_id`
    order: Vec<FileId>,
}

/// All files known to the host, indexed by id
#[derive(Default)]
pub struct FileRegistry {
    files: Mutex<Files>,
}

impl FileRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file
    pub fn add(&self, file: UploadFile) -> FileId {
        let id = file.id.clone();
        let mut files = self.files.lock().expect("file registry lock poisoned");
        if files.by_id.insert(id.clone(), file).is_none() {
            files.order.push(id.clone());
        }
        id
    }

    /// Remove a file, returning it if it existed
    pub fn remove(&self, id: &FileId) -> Option<UploadFile> {
        let mut files = self.files.lock().expect("file registry lock poisoned");
        let removed = files.by_id.remove(id);
        if removed.is_some() {
            files.order.retain(|other| other != id);
        }
        removed
    }

    /// Get a snapshot of a file
    pub fn get(&self, id: &FileId) -> Option<UploadFile> {
        self.files
            .lock()
            .expect("file registry lock poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    /// Check whether a file is still registered
    pub fn contains(&self, id: &FileId) -> bool {
        self.files
            .lock()
            .expect("file registry lock poisoned")
            .by_id
            .contains_key(id)
    }

    /// All registered ids, in insertion order
    pub fn ids(&self) -> Vec<FileId> {
        self.files
            .lock()
            .expect("file registry lock poisoned")
            .order
            .clone()
    }

    /// Number of registered files
    pub fn len(&self) -> usize {
        self.files
            .lock()
            .expect("file registry lock poisoned")
            .by_id
            .len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to a file in place
    ///
    /// Returns false if the file doesn't exist.
    pub fn update<F>(&self, id: &FileId, f: F) -> bool
    where
        F: FnOnce(&mut UploadFile),
    {
        let mut files = self.files.lock().expect("file registry lock poisoned");
        match files.by_id.get_mut(id) {
            Some(file) => {
                f(file);
                true
            }
            None => false,
        }
    }

    /// Store (or clear) the remote worker token
    pub fn set_server_token(&self, id: &FileId, token: Option<String>) -> bool {
        self.update(id, |file| file.server_token = token)
    }

    /// Set or clear the error marker
    pub fn set_error(&self, id: &FileId, error: Option<String>) -> bool {
        self.update(id, |file| file.error = error)
    }

    /// Set the paused flag
    pub fn set_paused(&self, id: &FileId, is_paused: bool) -> bool {
        self.update(id, |file| file.is_paused = is_paused)
    }

    /// Record transfer progress
    pub fn set_progress(&self, id: &FileId, progress: FileProgress) -> bool {
        self.update(id, |file| file.progress = progress)
    }

    /// Record the resumption URL, keeping every other override field
    pub fn set_upload_url(&self, id: &FileId, url: String) -> bool {
        self.update(id, |file| {
            file.overrides
                .get_or_insert_with(UploadOverrides::default)
                .upload_url = Some(url);
        })
    }

    /// Drop the resumption URL of every file that has one
    ///
    /// Other override fields are preserved. Returns the ids that were cleared.
    pub fn clear_upload_urls(&self) -> Vec<FileId> {
        let mut files = self.files.lock().expect("file registry lock poisoned");
        let Files { by_id, order } = &mut *files;
        let mut cleared = Vec::new();
        for id in order.iter() {
            if let Some(overrides) = by_id.get_mut(id).and_then(|f| f.overrides.as_mut())
                && overrides.upload_url.take().is_some()
            {
                cleared.push(id.clone());
            }
        }
        cleared
    }
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry")
            .field("files", &self.len())
            .finish()
    }
}
