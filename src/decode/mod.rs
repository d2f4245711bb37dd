//! Manifest-driven record decoding.
//!
//! A manifest names each task id and lists the fields its payload carries.
//! Payloads are a sequence of `u16 LE length + UTF-8 bytes` strings, one per
//! field. The [`ManifestCache`] is built once by the host and shared by
//! reference with every component that decodes.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::trace::event::{DecodedEvent, RawRecord};

/// Errors that can occur while decoding a record payload.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no manifest loaded for version {version}")]
    UnknownManifest { version: u16 },

    #[error("trace file has no manifest version")]
    MissingManifestVersion,

    #[error("unknown task id {task_id}")]
    UnknownTask { task_id: u16 },

    #[error("task {task}: payload truncated at field {field}")]
    PayloadTruncated { task: String, field: usize },

    #[error("task {task}: field {field} is not valid UTF-8")]
    InvalidUtf8 { task: String, field: usize },

    #[error("task {task}: expected {expected} fields, payload has trailing bytes")]
    TrailingBytes { task: String, expected: usize },
}

/// Decodes raw records into structured events.
pub trait Decoder: Send + Sync {
    fn decode(
        &self,
        manifest_version: Option<u16>,
        record: &RawRecord,
    ) -> Result<DecodedEvent, DecodeError>;
}

/// One manifest file.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub version: u16,
    #[serde(default)]
    pub tasks: Vec<TaskManifest>,
}

/// Description of one task's payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskManifest {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Loaded manifests keyed by version, then by task id.
#[derive(Debug, Default)]
pub struct ManifestCache {
    manifests: HashMap<u16, HashMap<u16, TaskManifest>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a single YAML manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let manifest: Manifest = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing manifest {}", path.display()))?;

        let mut cache = Self::new();
        cache.insert(manifest)?;
        Ok(cache)
    }

    /// Add a manifest. Duplicate task ids within one manifest are rejected.
    pub fn insert(&mut self, manifest: Manifest) -> Result<()> {
        let mut tasks = HashMap::with_capacity(manifest.tasks.len());
        for task in manifest.tasks {
            let id = task.id;
            if tasks.insert(id, task).is_some() {
                bail!(
                    "manifest version {}: duplicate task id {id}",
                    manifest.version
                );
            }
        }
        self.manifests.insert(manifest.version, tasks);
        Ok(())
    }

    /// Number of loaded manifest versions.
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    fn task(&self, version: u16, task_id: u16) -> Result<&TaskManifest, DecodeError> {
        let tasks = self
            .manifests
            .get(&version)
            .ok_or(DecodeError::UnknownManifest { version })?;
        tasks
            .get(&task_id)
            .ok_or(DecodeError::UnknownTask { task_id })
    }
}

impl Decoder for ManifestCache {
    fn decode(
        &self,
        manifest_version: Option<u16>,
        record: &RawRecord,
    ) -> Result<DecodedEvent, DecodeError> {
        let version = manifest_version.ok_or(DecodeError::MissingManifestVersion)?;
        let task = self.task(version, record.task_id)?;

        let mut fields = Vec::with_capacity(task.fields.len());
        let mut rest = record.payload.as_slice();

        for (idx, name) in task.fields.iter().enumerate() {
            let truncated = || DecodeError::PayloadTruncated {
                task: task.name.clone(),
                field: idx,
            };

            let len_bytes: [u8; 2] = rest
                .get(..2)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(truncated)?;
            let len = usize::from(u16::from_le_bytes(len_bytes));
            let raw = rest.get(2..2 + len).ok_or_else(truncated)?;

            let value = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8 {
                task: task.name.clone(),
                field: idx,
            })?;
            fields.push((name.clone(), value.to_string()));
            rest = rest.get(2 + len..).unwrap_or_default();
        }

        if !rest.is_empty() {
            return Err(DecodeError::TrailingBytes {
                task: task.name.clone(),
                expected: task.fields.len(),
            });
        }

        Ok(DecodedEvent {
            timestamp: record.timestamp,
            task_name: task.name.clone(),
            level: record.level,
            fields,
        })
    }
}

/// Encode field values into the payload layout understood by [`ManifestCache`].
pub fn encode_payload(values: &[&str]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.iter().map(|v| v.len() + 2).sum());
    for value in values {
        let bytes = value.as_bytes();
        let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(bytes.get(..usize::from(len)).unwrap_or_default());
    }
    buf
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::trace::event::{Level, Timestamp};

    fn cache() -> ManifestCache {
        let yaml = r#"
version: 3
tasks:
  - id: 1
    name: Replicator
    fields: [partition, message]
  - id: 2
    name: Heartbeat
"#;
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        let mut cache = ManifestCache::new();
        cache.insert(manifest).unwrap();
        cache
    }

    fn record(task_id: u16, payload: Vec<u8>) -> RawRecord {
        RawRecord::new(Timestamp(500), task_id, Level::Warning, payload)
    }

    #[test]
    fn test_decode_fields() {
        let rec = record(1, encode_payload(&["p-7", "copy started"]));
        let ev = cache().decode(Some(3), &rec).unwrap();
        assert_eq!(ev.task_name, "Replicator");
        assert_eq!(ev.level, Level::Warning);
        assert_eq!(ev.timestamp, Timestamp(500));
        assert_eq!(ev.field("partition"), Some("p-7"));
        assert_eq!(ev.field("message"), Some("copy started"));
    }

    #[test]
    fn test_decode_task_without_fields() {
        let ev = cache().decode(Some(3), &record(2, Vec::new())).unwrap();
        assert_eq!(ev.task_name, "Heartbeat");
        assert!(ev.fields.is_empty());
    }

    #[test]
    fn test_decode_unknown_task() {
        let err = cache().decode(Some(3), &record(9, Vec::new())).unwrap_err();
        assert_eq!(err, DecodeError::UnknownTask { task_id: 9 });
    }

    #[test]
    fn test_decode_unknown_manifest_version() {
        let err = cache().decode(Some(4), &record(1, Vec::new())).unwrap_err();
        assert_eq!(err, DecodeError::UnknownManifest { version: 4 });
    }

    #[test]
    fn test_decode_missing_manifest_version() {
        let err = cache().decode(None, &record(1, Vec::new())).unwrap_err();
        assert_eq!(err, DecodeError::MissingManifestVersion);
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut payload = encode_payload(&["p-7", "copy started"]);
        payload.truncate(payload.len() - 3);
        let err = cache().decode(Some(3), &record(1, payload)).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadTruncated { field: 1, .. }));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let payload = encode_payload(&["a", "b", "c"]);
        let err = cache().decode(Some(3), &record(1, payload)).unwrap_err();
        assert!(matches!(err, DecodeError::TrailingBytes { expected: 2, .. }));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&[0xff, 0xfe]);
        payload.extend_from_slice(&encode_payload(&["ok"]));
        let err = cache().decode(Some(3), &record(1, payload)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8 { field: 0, .. }));
    }

    #[test]
    fn test_duplicate_task_id_rejected() {
        let yaml = r#"
version: 1
tasks:
  - { id: 1, name: A }
  - { id: 1, name: B }
"#;
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        let err = ManifestCache::new().insert(manifest).unwrap_err();
        assert!(err.to_string().contains("duplicate task id 1"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yaml");
        std::fs::write(&path, "version: 1\ntasks:\n  - { id: 5, name: Store }\n").unwrap();
        let cache = ManifestCache::load(&path).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.decode(Some(1), &record(5, Vec::new())).is_ok());
    }
}
