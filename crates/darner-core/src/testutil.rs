use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::error::{DarnerError, Result};
use crate::storage::{Backend, RemoteEntry};

/// A remote operation observed by the test backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Put(String),
    Delete(String),
}

/// In-memory backend for tests. Thread-safe via Mutex.
///
/// Uploads are buffered in a queue and only become visible after
/// `wait_for_empty`, which exercises the drain discipline the repair engine
/// must follow. Every put and delete is recorded for assertions.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
    queued: Mutex<Vec<(String, Vec<u8>)>>,
    ops: Mutex<Vec<RemoteOp>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            queued: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Place an object directly into durable storage, bypassing the queue.
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.data.lock().unwrap().insert(name.to_string(), data);
    }

    pub fn remove(&self, name: &str) {
        self.data.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.lock().unwrap().contains_key(name)
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(name).cloned()
    }

    pub fn operations(&self) -> Vec<RemoteOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn puts(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                RemoteOp::Put(name) => Some(name),
                RemoteOp::Delete(_) => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                RemoteOp::Delete(name) => Some(name),
                RemoteOp::Put(_) => None,
            })
            .collect()
    }

    pub fn clear_operations(&self) {
        self.ops.lock().unwrap().clear();
    }

    /// Uploads accepted but not yet drained.
    pub fn queued_count(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    /// Snapshot of the durable store, for bit-identity assertions.
    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.data.lock().unwrap().clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn list(&self) -> Result<Vec<RemoteEntry>> {
        let map = self.data.lock().unwrap();
        let mut entries: Vec<RemoteEntry> = map
            .iter()
            .map(|(name, data)| RemoteEntry {
                name: name.clone(),
                size: data.len() as i64,
                is_folder: false,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn fetch(&self, name: &str) -> Result<NamedTempFile> {
        let map = self.data.lock().unwrap();
        let data = map
            .get(name)
            .ok_or_else(|| DarnerError::Backend(format!("no such object: '{name}'")))?;
        let mut temp = NamedTempFile::new()?;
        std::io::Write::write_all(temp.as_file_mut(), data)?;
        Ok(temp)
    }

    fn put(&self, name: &str, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        self.ops.lock().unwrap().push(RemoteOp::Put(name.to_string()));
        self.queued.lock().unwrap().push((name.to_string(), data));
        Ok(())
    }

    fn delete(&self, name: &str, _size: i64) -> Result<()> {
        self.ops
            .lock()
            .unwrap()
            .push(RemoteOp::Delete(name.to_string()));
        self.data.lock().unwrap().remove(name);
        Ok(())
    }

    fn create_folder(&self) -> Result<()> {
        Ok(())
    }

    fn test(&self) -> Result<()> {
        Ok(())
    }

    fn wait_for_empty(&self) -> Result<()> {
        let mut queued = self.queued.lock().unwrap();
        let mut data = self.data.lock().unwrap();
        for (name, bytes) in queued.drain(..) {
            data.insert(name, bytes);
        }
        Ok(())
    }
}
