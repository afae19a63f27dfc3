//! Per-scope directory layout and atomic write discipline
//!
//! Every scope lives in its own directory. Durable artifacts are written to
//! `tmp/` with a nonce suffix, fsynced, then renamed onto their final path:
//! a crash between the tmp write and the rename leaves only an orphan that
//! init garbage-collects; a rename is atomic on the target filesystem.
//!
//! ```text
//! <scope>/
//! ├── items/                      (file backend: one JSON file per item)
//! ├── segments/                   (video backend: consolidated segment)
//! │   ├── consolidated.mp4
//! │   ├── consolidated.mvi
//! │   └── consolidated-index.json
//! ├── index/                      (inverted.json, vectors.bin, meta.json,
//! │   └── state-ok.json            state-ok marker)
//! ├── tmp/                        (staging; pending/ holds queued bodies)
//! ├── locks/                      (advisory scope.lock)
//! ├── catalog.json
//! ├── journal-optimized.ndjson
//! ├── config.json
//! └── snapshot-meta.json
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use engram_core::error::Result;
use engram_core::types::Scope;

static NONCE: AtomicU64 = AtomicU64::new(0);

/// Resolved paths for one scope directory
#[derive(Debug, Clone)]
pub struct ScopePaths {
    root: PathBuf,
    scope: Scope,
}

impl ScopePaths {
    pub fn new(base: &Path, scope: Scope) -> Self {
        ScopePaths {
            root: base.join(scope.as_str()),
            scope,
        }
    }

    /// Wrap an explicit directory (migration staging areas)
    pub fn at(root: PathBuf, scope: Scope) -> Self {
        ScopePaths { root, scope }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    pub fn item_path(&self, id: &str) -> PathBuf {
        self.items_dir().join(format!("{id}.json"))
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.root.join("segments")
    }

    pub fn segment_video(&self) -> PathBuf {
        self.segments_dir().join("consolidated.mp4")
    }

    pub fn segment_mvi(&self) -> PathBuf {
        self.segments_dir().join("consolidated.mvi")
    }

    pub fn segment_manifest(&self) -> PathBuf {
        self.segments_dir().join("consolidated-index.json")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn inverted_index(&self) -> PathBuf {
        self.index_dir().join("inverted.json")
    }

    pub fn index_meta(&self) -> PathBuf {
        self.index_dir().join("meta.json")
    }

    pub fn vectors(&self) -> PathBuf {
        self.index_dir().join("vectors.bin")
    }

    pub fn state_ok(&self) -> PathBuf {
        self.index_dir().join("state-ok.json")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.tmp_dir().join("pending")
    }

    pub fn dead_letter(&self) -> PathBuf {
        self.tmp_dir().join("failed-encodes.ndjson")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn scope_lock(&self) -> PathBuf {
        self.locks_dir().join("scope.lock")
    }

    pub fn catalog(&self) -> PathBuf {
        self.root.join("catalog.json")
    }

    pub fn journal(&self) -> PathBuf {
        self.root.join("journal-optimized.ndjson")
    }

    pub fn legacy_journal(&self) -> PathBuf {
        self.root.join("journal.ndjson")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn snapshot_meta(&self) -> PathBuf {
        self.root.join("snapshot-meta.json")
    }

    /// Create the directory tree and sweep orphaned tmp files
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.items_dir(),
            self.segments_dir(),
            self.index_dir(),
            self.tmp_dir(),
            self.pending_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        self.gc_tmp()?;
        Ok(())
    }

    /// Remove staging leftovers from interrupted writes
    ///
    /// Anything directly under `tmp/` is an unrenamed staging file and safe
    /// to drop. `tmp/pending/` is preserved: those are queued bodies that an
    /// interrupted encoding worker still owes to the segment.
    pub fn gc_tmp(&self) -> Result<()> {
        let tmp = self.tmp_dir();
        if !tmp.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&tmp)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && path.extension().map(|e| e != "ndjson").unwrap_or(true) {
                tracing::debug!(path = %path.display(), "discarding orphaned tmp file");
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    /// Fresh staging path under `tmp/`
    pub fn staging_path(&self, hint: &str) -> PathBuf {
        let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
        self.tmp_dir()
            .join(format!("{hint}.{}.{nonce}", std::process::id()))
    }
}

// ============================================================================
// Atomic writes
// ============================================================================

/// Write bytes durably: tmp file, fsync, rename onto `dest`
///
/// Never leaves a partial file at `dest`.
pub fn atomic_write(paths: &ScopePaths, dest: &Path, bytes: &[u8]) -> Result<()> {
    let staging = paths.staging_path(
        dest.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".into())
            .as_str(),
    );
    {
        let mut file = File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&staging, dest)?;
    Ok(())
}

/// Rename a fully-written staging file onto its destination
pub fn atomic_rename(staging: &Path, dest: &Path) -> Result<()> {
    fs::rename(staging, dest)?;
    Ok(())
}
