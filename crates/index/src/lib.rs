//! Search indices for the Engram memory store.
//!
//! - [`inverted`]: fielded BM25 inverted index with phrase detection and a
//!   debounced flush buffer
//! - [`vector`]: optional dense cosine index with a pinned dimension

pub mod inverted;
pub mod vector;

pub use inverted::{parse_query, Field, IndexDoc, InvertedIndex, LexicalScore, ParsedQuery};
pub use vector::VectorIndex;
