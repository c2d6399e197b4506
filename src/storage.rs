//! Document persistence: a narrow `DocumentStore` trait plus a file-backed
//! implementation matching the `<name> - <file_id>.txt` on-disk convention.
//!
//! `load`/`delete` take only a `file_id`, matching the external interface
//! described for the document store collaborator ("load/save of a byte blob
//! keyed by fileId"). Since the on-disk filename also carries the document
//! name, a lookup scans the directory for the `<file_id>.txt` suffix rather
//! than requiring the caller to already know the name — this is what lets a
//! document be reopened by id alone after eviction from memory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::FileId;

/// Everything the router needs from a persistence backend. Kept behind a
/// trait so the engine never depends on the concrete on-disk layout.
pub trait DocumentStore: Send + Sync {
    /// Returns `(file_name, content)` if a blob for `file_id` exists.
    fn load(&self, file_id: &FileId) -> Result<Option<(String, String)>, EngineError>;
    fn save(&self, file_id: &FileId, file_name: &str, content: &str) -> Result<(), EngineError>;
    fn delete(&self, file_id: &FileId) -> Result<(), EngineError>;
}

pub struct FileDocumentStore {
    root: PathBuf,
    max_file_size: u64,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            root: root.into(),
            max_file_size,
        }
    }

    fn blob_path(&self, file_id: &FileId, file_name: &str) -> PathBuf {
        self.root.join(format!("{file_name} - {file_id}.txt"))
    }

    /// Scans `root` for an entry whose name ends in ` - <file_id>.txt`,
    /// returning its path and the embedded file name.
    fn find_by_id(&self, file_id: &FileId) -> Result<Option<(PathBuf, String)>, EngineError> {
        let suffix = format!(" - {file_id}.txt");
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if let Some(stripped) = name.strip_suffix(&suffix) {
                return Ok(Some((entry.path(), stripped.to_string())));
            }
        }
        Ok(None)
    }
}

impl DocumentStore for FileDocumentStore {
    fn load(&self, file_id: &FileId) -> Result<Option<(String, String)>, EngineError> {
        let Some((path, name)) = self.find_by_id(file_id)? else {
            return Ok(None);
        };
        let meta = fs::metadata(&path)?;
        if meta.len() > self.max_file_size {
            return Err(EngineError::OperationRejected {
                file_id: file_id.clone(),
                reason: format!("persisted file exceeds max_file_size ({} bytes)", self.max_file_size),
            });
        }
        Ok(Some((name, fs::read_to_string(&path)?)))
    }

    fn save(&self, file_id: &FileId, file_name: &str, content: &str) -> Result<(), EngineError> {
        if content.len() as u64 > self.max_file_size {
            return Err(EngineError::OperationRejected {
                file_id: file_id.clone(),
                reason: format!("content exceeds max_file_size ({} bytes)", self.max_file_size),
            });
        }
        ensure_dir(&self.root)?;
        // A rename (name change) between saves would otherwise leave a stale
        // blob behind under the old name.
        if let Some((old_path, old_name)) = self.find_by_id(file_id)? {
            if old_name != file_name {
                fs::remove_file(&old_path)?;
            }
        }
        let path = self.blob_path(file_id, file_name);
        fs::write(&path, content)?;
        Ok(())
    }

    fn delete(&self, file_id: &FileId) -> Result<(), EngineError> {
        match self.find_by_id(file_id)? {
            Some((path, _)) => Ok(fs::remove_file(&path)?),
            None => Ok(()),
        }
    }
}

fn ensure_dir(path: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(path)?;
    Ok(())
}
