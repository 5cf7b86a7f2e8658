//! Prescription image storage.
//!
//! Files are stored under generated names; only common image extensions
//! are accepted.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{CoreError, Result, ValidationError};

pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif"];

/// Returns the lowercased extension if it is on the allowlist.
pub fn allowed_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

pub trait AttachmentStore: Send + Sync {
    /// Store `bytes` and return the generated name to reference them by.
    fn store(&self, original_name: &str, bytes: &[u8]) -> Result<String>;

    /// Remove a stored file. Removing a missing file is not an error.
    fn delete(&self, name: &str) -> Result<()>;
}

/// Attachments kept as plain files in one directory.
pub struct FsAttachmentStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl FsAttachmentStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_bytes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of a stored attachment.
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        Ok(self.dir.join(checked_name(name)?))
    }
}

/// Generated names are a single path component; anything else is refused.
fn checked_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(name),
        _ => Err(ValidationError::invalid("attachment", format!("'{name}' is not a file name")).into()),
    }
}

impl AttachmentStore for FsAttachmentStore {
    fn store(&self, original_name: &str, bytes: &[u8]) -> Result<String> {
        let ext = allowed_extension(original_name)
            .ok_or_else(|| ValidationError::UnsupportedFileType(original_name.to_string()))?;
        if bytes.len() > self.max_bytes {
            return Err(ValidationError::FileTooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            }
            .into());
        }

        let name = format!("{}.{ext}", Uuid::new_v4());
        std::fs::write(self.dir.join(&name), bytes)?;
        tracing::debug!(%name, size = bytes.len(), "attachment stored");
        Ok(name)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_of(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }
}
