//! Durable per-provider checkpoints.
//!
//! Each checkpoint key maps to one small file holding the last timestamp up
//! to which that provider's events are known to be fully processed. Files are
//! replaced atomically (write temp, fsync, rename), so readers never observe
//! a partial write.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::RetryConfig;
use crate::retry::with_retries;
use crate::trace::event::Timestamp;

/// Magic bytes at the start of a checkpoint file.
const CHECKPOINT_MAGIC: [u8; 4] = *b"TFCK";

/// Current checkpoint schema version.
const CHECKPOINT_VERSION: u32 = 1;

/// Encoded checkpoint size in bytes.
const CHECKPOINT_SIZE: usize = 16;

/// Extension for checkpoint files.
const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Errors from checkpoint persistence.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt checkpoint {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

/// Durable key to timestamp map.
///
/// Callers serialize access per key; implementations need no extra locking
/// for correctness beyond what their own storage requires.
pub trait CheckpointStore: Send + Sync {
    /// Last persisted end time for `key`, or `None` if never written.
    fn last_end_time(&self, key: &str) -> Result<Option<Timestamp>, CheckpointError>;

    /// Persist a new end time for `key`.
    fn set_last_end_time(&self, key: &str, ts: Timestamp) -> Result<(), CheckpointError>;

    /// Remove the checkpoint for `key`. The next read starts from the beginning.
    fn reset(&self, key: &str) -> Result<(), CheckpointError>;
}

/// Checkpoint store backed by one file per key in a directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
    retry: RetryConfig,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, retry: RetryConfig) -> Self {
        Self {
            dir: dir.into(),
            retry,
        }
    }

    /// Directory holding the checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{CHECKPOINT_EXTENSION}", sanitize_key(key)))
    }

    fn write_once(&self, path: &Path, ts: Timestamp) -> Result<(), CheckpointError> {
        let io_err = |source: io::Error| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let tmp = path.with_extension(format!("{CHECKPOINT_EXTENSION}.tmp"));
        {
            let mut file = File::create(&tmp).map_err(io_err)?;
            file.write_all(&encode_checkpoint(ts)).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(io_err)?;
        sync_dir(&self.dir);

        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn last_end_time(&self, key: &str) -> Result<Option<Timestamp>, CheckpointError> {
        let path = self.path_for(key);
        let data = match with_retries(
            &self.retry,
            "read checkpoint",
            || fs::read(&path),
            |e: &io::Error| e.kind() != io::ErrorKind::NotFound,
        ) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };

        decode_checkpoint(&data)
            .map(Some)
            .map_err(|reason| CheckpointError::Corrupt { path, reason })
    }

    fn set_last_end_time(&self, key: &str, ts: Timestamp) -> Result<(), CheckpointError> {
        let path = self.path_for(key);
        with_retries(
            &self.retry,
            "write checkpoint",
            || self.write_once(&path, ts),
            |_| true,
        )?;
        debug!(key, end_time = %ts, "checkpoint persisted");
        Ok(())
    }

    fn reset(&self, key: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }
}

/// In-process checkpoint store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Timestamp>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn last_end_time(&self, key: &str) -> Result<Option<Timestamp>, CheckpointError> {
        Ok(self.entries.lock().get(key).copied())
    }

    fn set_last_end_time(&self, key: &str, ts: Timestamp) -> Result<(), CheckpointError> {
        self.entries.lock().insert(key.to_string(), ts);
        Ok(())
    }

    fn reset(&self, key: &str) -> Result<(), CheckpointError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

fn encode_checkpoint(ts: Timestamp) -> [u8; CHECKPOINT_SIZE] {
    let mut buf = [0u8; CHECKPOINT_SIZE];
    buf[0..4].copy_from_slice(&CHECKPOINT_MAGIC);
    buf[4..8].copy_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&ts.as_nanos().to_le_bytes());
    buf
}

/// Newer schema versions may append fields after the first 16 bytes.
fn decode_checkpoint(data: &[u8]) -> Result<Timestamp, String> {
    if data.len() < CHECKPOINT_SIZE {
        return Err(format!("{} bytes, need {CHECKPOINT_SIZE}", data.len()));
    }
    if data.get(0..4) != Some(CHECKPOINT_MAGIC.as_slice()) {
        return Err("bad magic".to_string());
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(data.get(4..8).unwrap_or(&[0; 4]));
    let version = u32::from_le_bytes(version);
    if version == 0 {
        return Err("schema version 0".to_string());
    }

    let mut nanos = [0u8; 8];
    nanos.copy_from_slice(data.get(8..16).unwrap_or(&[0; 8]));
    Ok(Timestamp(u64::from_le_bytes(nanos)))
}

/// Map a checkpoint key to a file stem. Safe bytes are kept and every other
/// byte, `%` included, becomes `%XX`, so distinct keys never share a file.
fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_absent_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), retry());
        assert_eq!(store.last_end_time("fabric").unwrap(), None);
    }

    #[test]
    fn test_set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested"), retry());
        store.set_last_end_time("fabric", Timestamp(200)).unwrap();
        assert_eq!(store.last_end_time("fabric").unwrap(), Some(Timestamp(200)));

        store.set_last_end_time("fabric", Timestamp(350)).unwrap();
        assert_eq!(store.last_end_time("fabric").unwrap(), Some(Timestamp(350)));
    }

    #[test]
    fn test_survives_new_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        FileCheckpointStore::new(dir.path(), retry())
            .set_last_end_time("lease", Timestamp(42))
            .unwrap();
        let reopened = FileCheckpointStore::new(dir.path(), retry());
        assert_eq!(reopened.last_end_time("lease").unwrap(), Some(Timestamp(42)));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), retry());
        store.set_last_end_time("fabric", Timestamp(1)).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["fabric.ckpt".to_string()]);
    }

    #[test]
    fn test_keys_are_independent_and_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), retry());
        store.set_last_end_time("a/b", Timestamp(1)).unwrap();
        store.set_last_end_time("c", Timestamp(2)).unwrap();

        assert!(store.path_for("a/b").ends_with("a%2Fb.ckpt"));
        assert_eq!(store.last_end_time("a/b").unwrap(), Some(Timestamp(1)));
        assert_eq!(store.last_end_time("c").unwrap(), Some(Timestamp(2)));
    }

    #[test]
    fn test_glob_like_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), retry());
        store.set_last_end_time("fabric_*.trc", Timestamp(500)).unwrap();

        assert_eq!(store.last_end_time("fabric_?.trc").unwrap(), None);
        assert_eq!(store.last_end_time("fabric__.trc").unwrap(), None);
        assert_eq!(store.last_end_time("fabric_%2A.trc").unwrap(), None);
        assert_eq!(
            store.last_end_time("fabric_*.trc").unwrap(),
            Some(Timestamp(500))
        );
        assert_ne!(store.path_for("fabric_*.trc"), store.path_for("fabric_%2A.trc"));
    }

    #[test]
    fn test_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), retry());
        fs::write(store.path_for("fabric"), b"garbage").unwrap();
        assert!(matches!(
            store.last_end_time("fabric"),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_newer_schema_with_extra_fields_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), retry());
        let mut data = encode_checkpoint(Timestamp(77)).to_vec();
        data[4..8].copy_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        fs::write(store.path_for("fabric"), data).unwrap();
        assert_eq!(store.last_end_time("fabric").unwrap(), Some(Timestamp(77)));
    }

    #[test]
    fn test_reset_removes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), retry());
        store.set_last_end_time("fabric", Timestamp(9)).unwrap();
        store.reset("fabric").unwrap();
        assert_eq!(store.last_end_time("fabric").unwrap(), None);
        store.reset("fabric").unwrap();
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let store = FileCheckpointStore::new(&blocker, retry());
        assert!(matches!(
            store.set_last_end_time("fabric", Timestamp(1)),
            Err(CheckpointError::Io { .. })
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.last_end_time("k").unwrap(), None);
        store.set_last_end_time("k", Timestamp(3)).unwrap();
        assert_eq!(store.last_end_time("k").unwrap(), Some(Timestamp(3)));
        store.reset("k").unwrap();
        assert_eq!(store.last_end_time("k").unwrap(), None);
    }
}
