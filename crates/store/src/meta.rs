//! Checkpoint markers: `snapshot-meta.json` and `index/state-ok.json`
//!
//! Compaction records the catalog checksum in both files; `verify` later
//! recomputes the live checksum and compares it to these attestations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use engram_core::error::Result;

use crate::layout::{atomic_write, ScopePaths};

/// `snapshot-meta.json`: last compaction checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub last_ts: DateTime<Utc>,
    pub checksum: String,
    pub item_count: usize,
}

/// `index/state-ok.json`: attestation that the scope verified clean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateOk {
    pub checksum: String,
    pub ts: DateTime<Utc>,
}

pub fn load_snapshot_meta(path: &Path) -> Result<Option<SnapshotMeta>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
}

pub fn load_state_ok(path: &Path) -> Result<Option<StateOk>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
}

/// Write both checkpoint markers after a successful compaction
pub fn write_checkpoint(
    paths: &ScopePaths,
    checksum: &str,
    item_count: usize,
) -> Result<DateTime<Utc>> {
    let ts = Utc::now();
    let meta = SnapshotMeta {
        last_ts: ts,
        checksum: checksum.to_string(),
        item_count,
    };
    atomic_write(
        paths,
        &paths.snapshot_meta(),
        serde_json::to_string_pretty(&meta)?.as_bytes(),
    )?;
    let ok = StateOk {
        checksum: checksum.to_string(),
        ts,
    };
    atomic_write(
        paths,
        &paths.state_ok(),
        serde_json::to_string_pretty(&ok)?.as_bytes(),
    )?;
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::types::Scope;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = TempDir::new().unwrap();
        let paths = ScopePaths::new(dir.path(), Scope::Local);
        paths.ensure().unwrap();

        let checksum = "ab".repeat(32);
        write_checkpoint(&paths, &checksum, 7).unwrap();

        let meta = load_snapshot_meta(&paths.snapshot_meta()).unwrap().unwrap();
        assert_eq!(meta.checksum, checksum);
        assert_eq!(meta.item_count, 7);
        let ok = load_state_ok(&paths.state_ok()).unwrap().unwrap();
        assert_eq!(ok.checksum, checksum);
    }

    #[test]
    fn test_missing_markers_are_none() {
        let dir = TempDir::new().unwrap();
        let paths = ScopePaths::new(dir.path(), Scope::Local);
        paths.ensure().unwrap();
        assert!(load_snapshot_meta(&paths.snapshot_meta()).unwrap().is_none());
        assert!(load_state_ok(&paths.state_ok()).unwrap().is_none());
    }
}
