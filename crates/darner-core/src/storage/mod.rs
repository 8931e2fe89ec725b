pub mod local_backend;

use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{DarnerError, Result};
use crate::hash::HashAlgorithm;

/// One entry in a backend listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub size: i64,
    pub is_folder: bool,
}

/// A request in an overlapped multi-file fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub name: String,
    pub hash: Option<String>,
    pub size: Option<i64>,
}

/// A downloaded remote file with its measured identity.
pub struct FetchedFile {
    pub name: String,
    pub file: NamedTempFile,
    /// Base64 SHA-256 of the whole file.
    pub hash: String,
    pub size: i64,
}

/// Abstract remote volume store.
///
/// Implementations provide the raw transfer primitives; verification and the
/// overlapped fetch are layered on top as default methods. `put` is allowed
/// to complete asynchronously behind an internal queue; `wait_for_empty` is
/// the only drain barrier and must be issued before claiming success.
pub trait Backend: Send {
    /// Enumerate remote objects (flat; folders flagged, not recursed).
    fn list(&self) -> Result<Vec<RemoteEntry>>;

    /// Download a remote object into a temp file.
    fn fetch(&self, name: &str) -> Result<NamedTempFile>;

    /// Upload a local file under a remote name. May enqueue.
    fn put(&self, name: &str, path: &Path) -> Result<()>;

    /// Delete a remote object. `size` is advisory (quota accounting).
    fn delete(&self, name: &str, size: i64) -> Result<()>;

    /// Create the remote folder.
    fn create_folder(&self) -> Result<()>;

    /// Check the remote folder is reachable.
    fn test(&self) -> Result<()>;

    /// Block until every queued upload has durably landed.
    fn wait_for_empty(&self) -> Result<()>;

    /// Download and verify against an expected identity when one is known.
    fn get(&self, name: &str, hash: Option<&str>, size: Option<i64>) -> Result<NamedTempFile> {
        let fetched = self.get_with_info(name)?;
        if let Some(expected) = hash {
            if fetched.hash != expected {
                return Err(DarnerError::Backend(format!(
                    "hash mismatch for '{name}': expected {expected}, got {}",
                    fetched.hash
                )));
            }
        }
        if let Some(expected) = size {
            if expected >= 0 && fetched.size != expected {
                return Err(DarnerError::Backend(format!(
                    "size mismatch for '{name}': expected {expected}, got {}",
                    fetched.size
                )));
            }
        }
        Ok(fetched.file)
    }

    /// Download and measure: whole-file SHA-256 plus byte size.
    fn get_with_info(&self, name: &str) -> Result<FetchedFile> {
        let file = self.fetch(name)?;
        let (hash, size) = HashAlgorithm::Sha256.hash_file(file.path())?;
        Ok(FetchedFile {
            name: name.to_string(),
            file,
            hash,
            size,
        })
    }

    /// Fetch several files, yielding each as it completes. The default is
    /// sequential; transports with parallel channels may overlap.
    fn get_files_overlapped<'a>(
        &'a self,
        requests: Vec<FetchRequest>,
    ) -> Box<dyn Iterator<Item = Result<FetchedFile>> + 'a> {
        Box::new(
            requests
                .into_iter()
                .map(move |req| self.get_with_info(&req.name)),
        )
    }
}

impl Backend for Box<dyn Backend> {
    fn list(&self) -> Result<Vec<RemoteEntry>> {
        (**self).list()
    }
    fn fetch(&self, name: &str) -> Result<NamedTempFile> {
        (**self).fetch(name)
    }
    fn put(&self, name: &str, path: &Path) -> Result<()> {
        (**self).put(name, path)
    }
    fn delete(&self, name: &str, size: i64) -> Result<()> {
        (**self).delete(name, size)
    }
    fn create_folder(&self) -> Result<()> {
        (**self).create_folder()
    }
    fn test(&self) -> Result<()> {
        (**self).test()
    }
    fn wait_for_empty(&self) -> Result<()> {
        (**self).wait_for_empty()
    }
    fn get(&self, name: &str, hash: Option<&str>, size: Option<i64>) -> Result<NamedTempFile> {
        (**self).get(name, hash, size)
    }
    fn get_with_info(&self, name: &str) -> Result<FetchedFile> {
        (**self).get_with_info(name)
    }
    fn get_files_overlapped<'a>(
        &'a self,
        requests: Vec<FetchRequest>,
    ) -> Box<dyn Iterator<Item = Result<FetchedFile>> + 'a> {
        (**self).get_files_overlapped(requests)
    }
}
