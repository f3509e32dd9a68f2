//! Directory-backed primary store.
//!
//! Each batch becomes one JSON document, partitioned by capture day and host:
//!
//! ```text
//! <root>/year=YYYY/month=MM/day=DD/host_id=<host>/<batch_id>.json
//! ```
//!
//! The root is usually a mounted network share. If it is missing the store
//! is considered unreachable; it is never created here, so an unmounted share
//! does not silently fill the local disk.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use hw_common::{TelemetryBatch, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PrimaryStore, StoreError};

/// Document written for each batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBatch {
    pub schema_version: String,
    pub written_at: DateTime<Utc>,
    pub batch: TelemetryBatch,
}

/// Primary store writing one document per batch under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the document for `batch` lives.
    pub fn document_path(&self, batch: &TelemetryBatch) -> PathBuf {
        let ts = batch.timestamp();
        self.root
            .join(format!("year={}", ts.year()))
            .join(format!("month={:02}", ts.month()))
            .join(format!("day={:02}", ts.day()))
            .join(format!("host_id={}", sanitize_host(batch.host_id())))
            .join(format!("{}.json", batch.batch_id()))
    }

    /// Read back every stored document, in no particular order.
    pub fn read_all(&self) -> io::Result<Vec<StoredBatch>> {
        let mut out = Vec::new();
        if self.root.is_dir() {
            collect_documents(&self.root, &mut out)?;
        }
        Ok(out)
    }
}

impl PrimaryStore for DirectoryStore {
    fn write_batch(&self, batch: &TelemetryBatch) -> Result<(), StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "primary store root {} is not available",
                self.root.display()
            )));
        }
        batch
            .validate()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;

        let document = StoredBatch {
            schema_version: SCHEMA_VERSION.to_string(),
            written_at: Utc::now(),
            batch: batch.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| StoreError::Rejected(format!("unserializable batch: {}", e)))?;

        let path = self.document_path(batch);
        write_document(&path, &bytes).map_err(|e| {
            StoreError::Unavailable(format!("write to {} failed: {}", path.display(), e))
        })?;

        debug!(batch_id = %batch.batch_id(), path = %path.display(), "batch written to primary store");
        Ok(())
    }

    fn is_reachable(&self) -> bool {
        self.root.is_dir()
    }
}

/// Same document path on every write, so rewriting replaces the previous copy.
fn write_document(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn collect_documents(dir: &Path, out: &mut Vec<StoredBatch>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_documents(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let bytes = fs::read(&path)?;
            let doc = serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            out.push(doc);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hw_common::{LocalSnapshotId, SampleCycle, SystemSnapshot};
    use tempfile::TempDir;

    fn batch(host: &str) -> TelemetryBatch {
        TelemetryBatch::new(LocalSnapshotId(1), host, SampleCycle::default())
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path().join("not-mounted"));
        assert!(!store.is_reachable());
        let err = store.write_batch(&batch("host-a")).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(!dir.path().join("not-mounted").exists());
    }

    #[test]
    fn test_write_is_upsert_on_batch_id() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path());
        let mut b = batch("host-a");

        store.write_batch(&b).unwrap();
        b.apply_retry_state(2, Some("timeout".to_string()));
        store.write_batch(&b).unwrap();

        let docs = store.read_all().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].batch.retry_count(), 2);
        assert_eq!(docs[0].schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_document_path_partitions() {
        let store = DirectoryStore::new("/primary");
        let b = batch("edge/01");
        let path = store.document_path(&b);
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("year="));
        assert!(path_str.contains("/host_id=edge_01/"));
        assert!(path_str.ends_with(&format!("{}.json", b.batch_id())));
    }

    #[test]
    fn test_invalid_batch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path());
        let b = TelemetryBatch::new(
            LocalSnapshotId(1),
            "host-a",
            SampleCycle {
                system: Some(SystemSnapshot {
                    cpu_percent: f32::NAN,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let err = store.write_batch(&b).unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(store.read_all().unwrap().is_empty());
    }
}
