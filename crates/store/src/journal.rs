//! Optimized hash-only journal
//!
//! Append-only NDJSON log of writes. Entries carry content hashes, never
//! bodies, so the journal stays small and replay is cheap. Each id forms a
//! hash chain: an entry's `prev_hash` must equal the content hash recorded
//! by the prior entry for the same id, which lets `verify` detect lost or
//! reordered writes.
//!
//! Compaction truncates the whole file to a single snapshot marker line
//! `{"snapshot":true,"checksum":...,"ts":...}`.
//!
//! A legacy full-body `journal.ndjson` is consumed once by
//! [`Journal::migrate_legacy`] and renamed out of the way.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use engram_core::error::{Error, Result};
use engram_core::hash::content_hash;
use engram_core::types::{
    JournalMeta, JournalOp, JournalRecord, MemoryBody, MemoryId, MemoryType,
    OptimizedJournalEntry,
};

/// Actor recorded on entries written by this process
const DEFAULT_ACTOR: &str = "engram";

// ============================================================================
// Reports
// ============================================================================

/// Result of a chain verification pass
#[derive(Debug, Clone, Default)]
pub struct JournalVerifyReport {
    pub valid: bool,
    pub entries: usize,
    pub snapshots: usize,
    /// Ids whose chain broke, with a description
    pub chain_breaks: Vec<String>,
}

/// Journal size and activity counters
#[derive(Debug, Clone, Default)]
pub struct JournalStats {
    pub entries: usize,
    pub snapshots: usize,
    pub appends_since_snapshot: u64,
    pub file_bytes: u64,
}

// ============================================================================
// Journal
// ============================================================================

struct JournalInner {
    /// Last recorded content hash per id, for chain linking
    last_hash: HashMap<MemoryId, String>,
    appends_since_snapshot: u64,
    /// Timestamp of the latest snapshot marker, if any
    snapshot_ts: Option<DateTime<Utc>>,
}

/// Append-only journal for one scope
pub struct Journal {
    path: PathBuf,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Open (or create) the journal, replaying it to rebuild chain state
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut inner = JournalInner {
            last_hash: HashMap::new(),
            appends_since_snapshot: 0,
            snapshot_ts: None,
        };
        for record in read_records(&path)? {
            apply_record(&mut inner, &record);
        }
        Ok(Journal {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last journaled content hash for an id
    pub fn last_hash(&self, id: &MemoryId) -> Option<String> {
        self.inner.lock().last_hash.get(id).cloned()
    }

    /// Appends since the latest snapshot marker (compaction trigger input)
    pub fn appends_since_snapshot(&self) -> u64 {
        self.inner.lock().appends_since_snapshot
    }

    /// Timestamp of the latest snapshot marker
    pub fn snapshot_ts(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().snapshot_ts
    }

    /// Append one entry, linking it into the id's hash chain and fsyncing
    pub fn append(
        &self,
        op: JournalOp,
        id: &MemoryId,
        content_hash: &str,
        meta: JournalMeta,
    ) -> Result<OptimizedJournalEntry> {
        let mut inner = self.inner.lock();
        let entry = OptimizedJournalEntry {
            op,
            id: id.clone(),
            content_hash: content_hash.to_string(),
            prev_hash: inner.last_hash.get(id).cloned(),
            ts: Utc::now(),
            actor: DEFAULT_ACTOR.to_string(),
            meta,
        };
        let line = serde_json::to_string(&JournalRecord::Entry(entry.clone()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        inner
            .last_hash
            .insert(id.clone(), content_hash.to_string());
        inner.appends_since_snapshot += 1;
        Ok(entry)
    }

    /// All records currently on disk, oldest first
    pub fn replay(&self) -> Result<Vec<JournalRecord>> {
        read_records(&self.path)
    }

    /// Entries appended after the given timestamp (startup replay window)
    pub fn replay_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<OptimizedJournalEntry>> {
        let mut out = Vec::new();
        for record in read_records(&self.path)? {
            if let JournalRecord::Entry(entry) = record {
                if since.map(|s| entry.ts > s).unwrap_or(true) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// Verify every id's hash chain
    pub fn verify(&self) -> Result<JournalVerifyReport> {
        let mut report = JournalVerifyReport {
            valid: true,
            ..Default::default()
        };
        let mut chains: HashMap<MemoryId, String> = HashMap::new();
        for record in read_records(&self.path)? {
            match record {
                JournalRecord::Snapshot { .. } => {
                    report.snapshots += 1;
                    // A snapshot starts fresh chains
                    chains.clear();
                }
                JournalRecord::Entry(entry) => {
                    report.entries += 1;
                    let expected = chains.get(&entry.id);
                    match (&entry.prev_hash, expected) {
                        (Some(prev), Some(actual)) if prev != actual => {
                            report.valid = false;
                            report.chain_breaks.push(format!(
                                "{}: prev_hash {prev} but chain has {actual}",
                                entry.id
                            ));
                        }
                        (Some(prev), None) => {
                            report.valid = false;
                            report.chain_breaks.push(format!(
                                "{}: prev_hash {prev} but no prior entry",
                                entry.id
                            ));
                        }
                        _ => {}
                    }
                    chains.insert(entry.id.clone(), entry.content_hash.clone());
                }
            }
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<JournalStats> {
        let mut stats = JournalStats::default();
        for record in read_records(&self.path)? {
            match record {
                JournalRecord::Snapshot { .. } => stats.snapshots += 1,
                JournalRecord::Entry(_) => stats.entries += 1,
            }
        }
        stats.appends_since_snapshot = self.appends_since_snapshot();
        stats.file_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(stats)
    }

    /// Replace the whole journal with a single snapshot marker
    pub fn truncate_to_snapshot(&self, checksum: &str) -> Result<DateTime<Utc>> {
        let ts = Utc::now();
        let marker = JournalRecord::Snapshot {
            snapshot: true,
            checksum: checksum.to_string(),
            ts,
        };
        let staging = self.path.with_extension("ndjson.new");
        {
            let mut file = File::create(&staging)?;
            file.write_all(serde_json::to_string(&marker)?.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        std::fs::rename(&staging, &self.path)?;

        let mut inner = self.inner.lock();
        inner.appends_since_snapshot = 0;
        inner.snapshot_ts = Some(ts);
        // Chains restart after a snapshot; live hashes are re-seeded by the
        // caller from the compacted catalog
        inner.last_hash.clear();
        Ok(ts)
    }

    /// Seed chain state from catalog contents (after compaction or rebuild)
    pub fn seed_chains(&self, hashes: impl IntoIterator<Item = (MemoryId, String)>) {
        let mut inner = self.inner.lock();
        for (id, hash) in hashes {
            inner.last_hash.insert(id, hash);
        }
    }

    /// One-shot migration of a legacy full-body journal
    ///
    /// Legacy lines embed whole items; each is reduced to a hash-only entry
    /// and appended here, then the legacy file is renamed aside so the
    /// migration never runs twice.
    pub fn migrate_legacy(&self, legacy_path: &Path) -> Result<usize> {
        if !legacy_path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(legacy_path)?);
        let mut migrated = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "skipping unparsable legacy journal line");
                    continue;
                }
            };
            let Some(entry) = legacy_to_optimized(&value) else {
                warn!("skipping legacy journal line without id/item");
                continue;
            };
            self.append(entry.0, &entry.1, &entry.2, entry.3)?;
            migrated += 1;
        }
        let aside = legacy_path.with_extension("ndjson.migrated");
        std::fs::rename(legacy_path, &aside)?;
        info!(
            migrated,
            from = %legacy_path.display(),
            "migrated legacy journal"
        );
        Ok(migrated)
    }
}

fn apply_record(inner: &mut JournalInner, record: &JournalRecord) {
    match record {
        JournalRecord::Snapshot { ts, .. } => {
            inner.snapshot_ts = Some(*ts);
            inner.appends_since_snapshot = 0;
            inner.last_hash.clear();
        }
        JournalRecord::Entry(entry) => {
            inner
                .last_hash
                .insert(entry.id.clone(), entry.content_hash.clone());
            inner.appends_since_snapshot += 1;
        }
    }
}

/// Read all records, tolerating a torn final line
fn read_records(path: &Path) -> Result<Vec<JournalRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
    let mut records = Vec::with_capacity(lines.len());
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if i == last => {
                // A crash mid-append tears only the final line
                warn!(error = %e, "ignoring torn journal tail");
            }
            Err(e) => {
                return Err(Error::Integrity(format!(
                    "corrupt journal line {} in {}: {e}",
                    i + 1,
                    path.display()
                )));
            }
        }
    }
    Ok(records)
}

fn legacy_to_optimized(
    value: &serde_json::Value,
) -> Option<(JournalOp, MemoryId, String, JournalMeta)> {
    let id = MemoryId::parse(value.get("id")?.as_str()?).ok()?;
    let op = match value.get("op").and_then(|o| o.as_str()).unwrap_or("upsert") {
        "delete" => JournalOp::Delete,
        "link" => JournalOp::Link,
        _ => JournalOp::Upsert,
    };
    let item = value.get("item").unwrap_or(value);
    let kind = item
        .get("type")
        .and_then(|t| t.as_str())
        .and_then(|t| serde_json::from_value::<MemoryType>(serde_json::json!(t)).ok())
        .unwrap_or(MemoryType::Note);
    let scope = item
        .get("scope")
        .and_then(|s| s.as_str())
        .and_then(engram_core::types::Scope::parse)
        .unwrap_or(engram_core::types::Scope::Local);
    let field = |name: &str| {
        item.get(name)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    let body = MemoryBody {
        title: field("title"),
        text: field("text"),
        code: field("code"),
        kind,
        language: field("language"),
    };
    let hash = content_hash(&body);
    let size = serde_json::to_string(&body).map(|s| s.len() as u32).unwrap_or(0);
    Some((
        op,
        id,
        hash,
        JournalMeta {
            size,
            kind,
            scope,
            title: body.title,
        },
    ))
}

// ============================================================================
// Tests
// ============================================================================
