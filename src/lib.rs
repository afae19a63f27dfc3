//! Engram: a local-first, content-addressed memory store for coding
//! assistants.
//!
//! Items live in three scopes (global, local, committed), each backed by a
//! pluggable storage adapter: plain JSON files with an append-only journal,
//! or a video store that packs bodies as QR frames inside an MP4 segment
//! with a binary frame index. Retrieval runs a fielded BM25 index with
//! optional cosine-vector blending, and a confidence pipeline fuses
//! feedback, usage, recency, and context signals into the final ranking.
//!
//! # Quick start
//!
//! ```no_run
//! use engram::{MemoryManager, UpsertRequest};
//! use engram::types::MemoryType;
//!
//! let manager = MemoryManager::open_default()?;
//! let outcome = manager.upsert(UpsertRequest {
//!     kind: Some(MemoryType::Snippet),
//!     title: Some("Debounce".into()),
//!     code: Some("function debounce(f,w){...}".into()),
//!     language: Some("js".into()),
//!     ..Default::default()
//! })?;
//! let item = manager.get(&outcome.item.id, None)?;
//! assert_eq!(item.title.as_deref(), Some("Debounce"));
//! # Ok::<(), engram::Error>(())
//! ```

pub use engram_core::cancel::CancellationToken;
pub use engram_core::config::{self, StoreConfig};
pub use engram_core::error::{CodecErrorKind, Error, Result};
pub use engram_core::types;
pub use engram_core::types::{MemoryId, MemoryItem, MemoryItemSummary, Scope};

pub use engram_engine::{
    ContextPack, MemoryManager, PackOptions, PatchRequest, QueryContext, QueryFilters,
    QueryHit, QueryRequest, QueryResponse, ScopeFilter, UpsertOutcome, UpsertRequest,
};

/// Storage layer: adapters, journal, catalog, caches
pub mod store {
    pub use engram_store::{
        open_store, resolve_backend, Journal, JournalStats, JournalVerifyReport, ScopePaths,
        StorageAdapter, StoreStats, VerifyReport,
    };
}

/// Codec layer: QR frames, video segments, frame index
pub mod codec {
    pub use engram_codec::{frame_index, qr, video};
}

/// Index layer: BM25 and vectors
pub mod index {
    pub use engram_index::{parse_query, InvertedIndex, VectorIndex};
}
