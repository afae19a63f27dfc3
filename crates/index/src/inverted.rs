//! Fielded inverted index with BM25 scoring
//!
//! Four fields are indexed independently (`title`, `text`, `code`, `tag`),
//! each with its own posting lists and document lengths. A query term's BM25
//! contribution is computed per field and summed under the configured field
//! weights. Postings carry token positions so quoted phrases can be checked
//! for in-order adjacency without re-reading bodies.
//!
//! Updates apply to the in-memory index immediately (queries always see the
//! latest state) and are counted in a flush buffer; the on-disk
//! `inverted.json` + `meta.json` pair is rewritten atomically when the
//! buffered operation count or elapsed time passes the configured
//! thresholds, or on an explicit flush.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use engram_core::config::{FieldWeights, IndexFlushConfig, RankingConfig};
use engram_core::error::Result;
use engram_core::tokenize::tokenize;
use engram_core::types::MemoryId;

/// Schema version of the persisted index
pub const INDEX_SCHEMA_VERSION: u32 = 2;

// ============================================================================
// Fields
// ============================================================================

/// Indexed fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Title,
    Text,
    Code,
    Tag,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Title, Field::Text, Field::Code, Field::Tag];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Text => "text",
            Field::Code => "code",
            Field::Tag => "tag",
        }
    }

    fn weight(&self, weights: &FieldWeights) -> f32 {
        match self {
            Field::Title => weights.title,
            Field::Text => weights.text,
            Field::Code => weights.code,
            Field::Tag => weights.tag,
        }
    }
}

/// The indexable text of one document
#[derive(Debug, Clone, Default)]
pub struct IndexDoc {
    pub title: Option<String>,
    pub text: Option<String>,
    pub code: Option<String>,
    pub tags: Vec<String>,
}

impl IndexDoc {
    fn field_text(&self, field: Field) -> Option<String> {
        match field {
            Field::Title => self.title.clone(),
            Field::Text => self.text.clone(),
            Field::Code => self.code.clone(),
            Field::Tag => {
                if self.tags.is_empty() {
                    None
                } else {
                    Some(self.tags.join(" "))
                }
            }
        }
    }
}

// ============================================================================
// Postings
// ============================================================================

/// One document's entry in a posting list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: MemoryId,
    pub tf: u32,
    /// Token positions of the term within the field
    pub positions: Vec<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FieldIndex {
    /// term → postings
    postings: BTreeMap<String, Vec<Posting>>,
    /// id → field length in tokens
    doc_lengths: BTreeMap<String, u32>,
}

impl FieldIndex {
    fn total_len(&self) -> u64 {
        self.doc_lengths.values().map(|&l| l as u64).sum()
    }

    fn avg_len(&self) -> f32 {
        if self.doc_lengths.is_empty() {
            0.0
        } else {
            self.total_len() as f32 / self.doc_lengths.len() as f32
        }
    }

    fn remove_doc(&mut self, id: &MemoryId) {
        self.doc_lengths.remove(id.as_str());
        self.postings.retain(|_, list| {
            list.retain(|p| &p.id != id);
            !list.is_empty()
        });
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    fields: BTreeMap<String, FieldIndex>,
    /// Lowercased full titles for the exact-title bonus
    titles: BTreeMap<String, String>,
    /// Every indexed document id
    docs: HashSet<MemoryId>,
}

impl IndexState {
    fn field(&self, field: Field) -> Option<&FieldIndex> {
        self.fields.get(field.as_str())
    }

    fn field_mut(&mut self, field: Field) -> &mut FieldIndex {
        self.fields.entry(field.as_str().to_string()).or_default()
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// `meta.json`: schema/weights stamp plus corpus statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub schema_version: u32,
    pub field_weights: FieldWeights,
    pub doc_count: usize,
    pub last_flush_ts: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    schema_version: u32,
    state: IndexState,
}

// ============================================================================
// Scoring output
// ============================================================================

/// Score breakdown for one candidate document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LexicalScore {
    pub bm25: f32,
    pub phrase_bonus: f32,
    pub exact_title_bonus: f32,
}

impl LexicalScore {
    pub fn total(&self) -> f32 {
        self.bm25 + self.phrase_bonus + self.exact_title_bonus
    }
}

/// Parsed query: bare terms plus quoted phrases
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub raw: String,
    pub terms: Vec<String>,
    pub phrases: Vec<Vec<String>>,
}

/// Split a query into terms and quoted phrases
///
/// `auth "token rotation"` yields terms `[auth, token, rotation]` and one
/// phrase `[token, rotation]`.
pub fn parse_query(q: &str) -> ParsedQuery {
    let mut phrases = Vec::new();
    let mut rest = String::new();
    let mut chars = q.char_indices().peekable();
    let mut last = 0;
    while let Some((start, c)) = chars.next() {
        if c != '"' {
            continue;
        }
        rest.push_str(&q[last..start]);
        let mut end = None;
        for (j, cj) in chars.by_ref() {
            if cj == '"' {
                end = Some(j);
                break;
            }
        }
        match end {
            Some(end) => {
                let phrase = tokenize(&q[start + 1..end]);
                rest.push(' ');
                rest.push_str(&q[start + 1..end]);
                last = end + 1;
                if phrase.len() >= 2 {
                    phrases.push(phrase);
                }
            }
            None => {
                // Unbalanced quote: treat the remainder as plain terms
                rest.push_str(&q[start + 1..]);
                last = q.len();
            }
        }
    }
    rest.push_str(&q[last..]);

    let mut seen = HashSet::new();
    let terms = tokenize(&rest)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect();
    ParsedQuery {
        raw: q.trim().to_string(),
        terms,
        phrases,
    }
}

// ============================================================================
// InvertedIndex
// ============================================================================

struct FlushBuffer {
    ops_since_flush: u32,
    last_flush: Instant,
}

/// Fielded inverted index for one scope
pub struct InvertedIndex {
    state: RwLock<IndexState>,
    buffer: Mutex<FlushBuffer>,
    flush_config: IndexFlushConfig,
    weights: FieldWeights,
    /// Set when the on-disk index was unusable (schema or weight change)
    needs_rebuild: bool,
}

impl InvertedIndex {
    /// Open from `inverted.json`/`meta.json`, detecting rebuild conditions
    ///
    /// A schema version mismatch or changed field weights marks the index
    /// [`needs_rebuild`](Self::needs_rebuild); the caller re-indexes the
    /// catalog and flushes.
    pub fn open(
        index_path: &Path,
        meta_path: &Path,
        flush_config: IndexFlushConfig,
        weights: FieldWeights,
    ) -> Result<Self> {
        let mut needs_rebuild = false;
        let state = if index_path.exists() && meta_path.exists() {
            let meta: IndexMeta = serde_json::from_slice(&std::fs::read(meta_path)?)?;
            if meta.schema_version != INDEX_SCHEMA_VERSION {
                info!(
                    on_disk = meta.schema_version,
                    current = INDEX_SCHEMA_VERSION,
                    "index schema changed; rebuild required"
                );
                needs_rebuild = true;
                IndexState::default()
            } else if meta.field_weights != weights {
                info!("field weights changed; rebuild required");
                needs_rebuild = true;
                IndexState::default()
            } else {
                let persisted: PersistedIndex =
                    serde_json::from_slice(&std::fs::read(index_path)?)?;
                persisted.state
            }
        } else {
            needs_rebuild = index_path.exists() || meta_path.exists();
            IndexState::default()
        };

        Ok(InvertedIndex {
            state: RwLock::new(state),
            buffer: Mutex::new(FlushBuffer {
                ops_since_flush: 0,
                last_flush: Instant::now(),
            }),
            flush_config,
            weights,
            needs_rebuild,
        })
    }

    /// Empty in-memory index (tests, rebuilds)
    pub fn empty(flush_config: IndexFlushConfig, weights: FieldWeights) -> Self {
        InvertedIndex {
            state: RwLock::new(IndexState::default()),
            buffer: Mutex::new(FlushBuffer {
                ops_since_flush: 0,
                last_flush: Instant::now(),
            }),
            flush_config,
            weights,
            needs_rebuild: false,
        }
    }

    /// Whether the on-disk index could not be reused
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn doc_count(&self) -> usize {
        self.state.read().docs.len()
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.state.read().docs.contains(id)
    }

    /// Every indexed document id, sorted
    pub fn doc_ids(&self) -> Vec<MemoryId> {
        let state = self.state.read();
        let mut ids: Vec<MemoryId> = state.docs.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Terms indexed for a document in a field (posting-list introspection)
    pub fn terms_for(&self, id: &MemoryId, field: Field) -> Vec<String> {
        let state = self.state.read();
        let Some(index) = state.field(field) else {
            return Vec::new();
        };
        index
            .postings
            .iter()
            .filter(|(_, list)| list.iter().any(|p| &p.id == id))
            .map(|(term, _)| term.clone())
            .collect()
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Index (or re-index) a document
    pub fn index_doc(&self, id: &MemoryId, doc: &IndexDoc) {
        let mut state = self.state.write();
        if state.docs.contains(id) {
            remove_from_state(&mut state, id);
        }
        for field in Field::ALL {
            let Some(text) = doc.field_text(field) else {
                continue;
            };
            let tokens = tokenize(&text);
            if tokens.is_empty() {
                continue;
            }
            let mut occurrences: HashMap<&str, Vec<u32>> = HashMap::new();
            for (pos, token) in tokens.iter().enumerate() {
                occurrences.entry(token.as_str()).or_default().push(pos as u32);
            }
            let index = state.field_mut(field);
            index
                .doc_lengths
                .insert(id.as_str().to_string(), tokens.len() as u32);
            for (term, positions) in occurrences {
                let list = index.postings.entry(term.to_string()).or_default();
                list.push(Posting {
                    id: id.clone(),
                    tf: positions.len() as u32,
                    positions,
                });
                // Keep postings sorted for deterministic scoring
                list.sort_by(|a, b| a.id.cmp(&b.id));
            }
        }
        if let Some(title) = &doc.title {
            state
                .titles
                .insert(id.as_str().to_string(), title.to_lowercase());
        }
        state.docs.insert(id.clone());
        drop(state);
        self.note_op();
    }

    /// Remove a document from every posting list
    pub fn remove_doc(&self, id: &MemoryId) {
        let mut state = self.state.write();
        remove_from_state(&mut state, id);
        drop(state);
        self.note_op();
    }

    /// Drop everything (precedes a rebuild)
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = IndexState::default();
    }

    fn note_op(&self) {
        self.buffer.lock().ops_since_flush += 1;
    }

    /// Buffered operations not yet persisted
    pub fn pending_ops(&self) -> u32 {
        self.buffer.lock().ops_since_flush
    }

    /// Persist if the op-count or time threshold has been reached
    ///
    /// Returns whether a flush happened.
    pub fn maybe_flush(&self, index_path: &Path, meta_path: &Path) -> Result<bool> {
        let due = {
            let buffer = self.buffer.lock();
            buffer.ops_since_flush > 0
                && (buffer.ops_since_flush >= self.flush_config.max_ops
                    || buffer.last_flush.elapsed().as_millis() as u64 >= self.flush_config.max_ms)
        };
        if !due {
            return Ok(false);
        }
        self.flush(index_path, meta_path)?;
        Ok(true)
    }

    /// Persist unconditionally: atomic rewrite of `inverted.json` + `meta.json`
    pub fn flush(&self, index_path: &Path, meta_path: &Path) -> Result<()> {
        let state = self.state.read();
        let persisted = PersistedIndex {
            schema_version: INDEX_SCHEMA_VERSION,
            state: IndexState {
                fields: state
                    .fields
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            FieldIndex {
                                postings: v.postings.clone(),
                                doc_lengths: v.doc_lengths.clone(),
                            },
                        )
                    })
                    .collect(),
                titles: state.titles.clone(),
                docs: state.docs.clone(),
            },
        };
        let meta = IndexMeta {
            schema_version: INDEX_SCHEMA_VERSION,
            field_weights: self.weights.clone(),
            doc_count: state.docs.len(),
            last_flush_ts: chrono::Utc::now(),
        };
        drop(state);

        write_atomic(index_path, serde_json::to_vec(&persisted)?.as_slice())?;
        write_atomic(meta_path, serde_json::to_vec_pretty(&meta)?.as_slice())?;

        let mut buffer = self.buffer.lock();
        buffer.ops_since_flush = 0;
        buffer.last_flush = Instant::now();
        debug!(docs = meta.doc_count, "flushed inverted index");
        Ok(())
    }

    // ========================================================================
    // Scoring
    // ========================================================================

    /// BM25 score every document matching any query term
    ///
    /// Returns per-document breakdowns, unranked; ordering and further
    /// boosts are the query pipeline's concern. Deterministic: identical
    /// input and state produce identical output (maps iterate sorted).
    pub fn score(&self, query: &ParsedQuery, ranking: &RankingConfig) -> Vec<(MemoryId, LexicalScore)> {
        let state = self.state.read();
        let n = state.docs.len() as f32;
        let mut scores: BTreeMap<MemoryId, LexicalScore> = BTreeMap::new();
        let (k1, b) = (ranking.bm25.k1, ranking.bm25.b);

        for field in Field::ALL {
            let Some(index) = state.field(field) else {
                continue;
            };
            let weight = field.weight(&ranking.field_weights);
            let avg_len = index.avg_len();
            for term in &query.terms {
                let Some(postings) = index.postings.get(term) else {
                    continue;
                };
                let df = postings.len() as f32;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                for posting in postings {
                    let len = index
                        .doc_lengths
                        .get(posting.id.as_str())
                        .copied()
                        .unwrap_or(0) as f32;
                    let tf = posting.tf as f32;
                    let norm = tf + k1 * (1.0 - b + b * len / avg_len.max(1.0));
                    let contribution = idf * tf * (k1 + 1.0) / norm;
                    scores.entry(posting.id.clone()).or_default().bm25 +=
                        weight * contribution;
                }
            }

            // Phrase bonus: all terms in order and adjacent within this field
            for phrase in &query.phrases {
                for id in phrase_matches(index, phrase) {
                    scores.entry(id).or_default().phrase_bonus = ranking.phrase.bonus;
                }
            }
        }

        // Exact-title bonus for the whole query string
        let lowered = query.raw.trim_matches('"').trim().to_lowercase();
        if !lowered.is_empty() {
            for (id_str, title) in &state.titles {
                if title == &lowered {
                    if let Ok(id) = MemoryId::parse(id_str.clone()) {
                        scores.entry(id).or_default().exact_title_bonus =
                            ranking.phrase.exact_title_bonus;
                    }
                }
            }
        }

        scores.into_iter().collect()
    }
}

fn remove_from_state(state: &mut IndexState, id: &MemoryId) {
    for index in state.fields.values_mut() {
        index.remove_doc(id);
    }
    state.titles.remove(id.as_str());
    state.docs.remove(id);
}

/// Ids whose field contains the phrase terms in order, adjacent
fn phrase_matches(index: &FieldIndex, phrase: &[String]) -> Vec<MemoryId> {
    let mut lists: Vec<&Vec<Posting>> = Vec::with_capacity(phrase.len());
    for term in phrase {
        match index.postings.get(term) {
            Some(list) => lists.push(list),
            None => return Vec::new(),
        }
    }

    // Candidates must appear in every term's postings
    let mut candidates: Vec<MemoryId> = lists[0].iter().map(|p| p.id.clone()).collect();
    for list in &lists[1..] {
        let ids: HashSet<&MemoryId> = list.iter().map(|p| &p.id).collect();
        candidates.retain(|id| ids.contains(id));
    }

    candidates
        .into_iter()
        .filter(|id| {
            let positions: Vec<&Vec<u32>> = lists
                .iter()
                .map(|list| {
                    list.iter()
                        .find(|p| &p.id == id)
                        .map(|p| &p.positions)
                        .expect("candidate appears in every list")
                })
                .collect();
            // Some start of term 0 must chain through +1 offsets
            positions[0].iter().any(|&start| {
                positions[1..]
                    .iter()
                    .enumerate()
                    .all(|(i, pos)| pos.contains(&(start + i as u32 + 1)))
            })
        })
        .collect()
}

fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let staging = dest.with_extension("json.new");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&staging, dest)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
