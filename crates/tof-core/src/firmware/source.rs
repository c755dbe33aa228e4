//! Where firmware images and calibration blobs come from.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

/// Named blob lookup. `fetch` may block (file IO); the session never calls
/// it while holding its lock.
pub trait FirmwareSource: Send + Sync {
    /// `None` when the named blob is not available.
    fn fetch(&self, name: &str) -> Option<Vec<u8>>;
}

/// Reads blobs from a directory.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FirmwareSource for DirectorySource {
    fn fetch(&self, name: &str) -> Option<Vec<u8>> {
        let path = self.root.join(name);
        match std::fs::read(&path) {
            Ok(data) => {
                debug!(path = %path.display(), size = data.len(), "Loaded blob");
                Some(data)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Blob not found");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read blob");
                None
            }
        }
    }
}

/// In-memory blobs. Records every lookup, hit or miss.
#[derive(Default)]
pub struct MemorySource {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), data.into());
    }

    pub fn remove(&self, name: &str) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Names looked up so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FirmwareSource for MemorySource {
    fn fetch(&self, name: &str) -> Option<Vec<u8>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Source with nothing in it.
pub struct NoFirmware;

impl FirmwareSource for NoFirmware {
    fn fetch(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_records_requests() {
        let src = MemorySource::new().with_blob("a.bin", vec![1, 2]);
        assert_eq!(src.fetch("a.bin"), Some(vec![1, 2]));
        assert_eq!(src.fetch("b.bin"), None);
        assert_eq!(src.requests(), vec!["a.bin", "b.bin"]);

        src.remove("a.bin");
        assert_eq!(src.fetch("a.bin"), None);
    }

    #[test]
    fn test_directory_source_missing_file() {
        let src = DirectorySource::new(std::env::temp_dir().join("tof-core-no-such-dir"));
        assert!(src.fetch("tof8801_firmware.bin").is_none());
    }

    #[test]
    fn test_directory_source_reads_file() {
        let dir = std::env::temp_dir().join(format!("tof-core-src-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("fw.hex"), b":00000001FF\n").unwrap();

        let src = DirectorySource::new(&dir);
        assert_eq!(src.fetch("fw.hex").unwrap(), b":00000001FF\n".to_vec());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
