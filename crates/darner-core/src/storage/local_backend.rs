use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{DarnerError, Result};

use super::{Backend, RemoteEntry};

/// Filesystem-backed volume store: one flat directory of volume files.
///
/// Uploads complete synchronously, so the drain barrier is a no-op here; the
/// queued-upload contract only matters for networked transports.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        // Remote names are flat; anything path-like is a caller bug.
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(DarnerError::Backend(format!(
                "invalid remote object name: '{name}'"
            )));
        }
        Ok(self.root.join(name))
    }
}

impl Backend for LocalBackend {
    fn list(&self) -> Result<Vec<RemoteEntry>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DarnerError::FolderMissing)
            }
            Err(e) => return Err(e.into()),
        };

        let mut listing = Vec::new();
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            listing.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                size: if meta.is_dir() { 0 } else { meta.len() as i64 },
                is_folder: meta.is_dir(),
            });
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    fn fetch(&self, name: &str) -> Result<NamedTempFile> {
        let source = self.object_path(name)?;
        let mut temp = NamedTempFile::new()?;
        let mut file = match fs::File::open(&source) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DarnerError::Backend(format!("no such object: '{name}'")))
            }
            Err(e) => return Err(e.into()),
        };
        io::copy(&mut file, temp.as_file_mut())?;
        Ok(temp)
    }

    fn put(&self, name: &str, path: &Path) -> Result<()> {
        let dest = self.object_path(name)?;
        if !self.root.is_dir() {
            return Err(DarnerError::FolderMissing);
        }
        // Write-then-rename so a crashed put never leaves a readable partial.
        let staging = dest.with_extension("partial");
        fs::copy(path, &staging)?;
        fs::rename(&staging, &dest)?;
        Ok(())
    }

    fn delete(&self, name: &str, _size: i64) -> Result<()> {
        let target = self.object_path(name)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn create_folder(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn test(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(DarnerError::FolderMissing)
        }
    }

    fn wait_for_empty(&self) -> Result<()> {
        Ok(())
    }
}
