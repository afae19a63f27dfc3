//! Core types, hashing, tokenization, and configuration for the Engram
//! memory store.
//!
//! This crate holds everything the other layers share:
//!
//! - The canonical data model ([`types`])
//! - The unified error taxonomy ([`error`])
//! - Content hashing and canonical body JSON ([`hash`])
//! - Monotonic ULID generation ([`id`])
//! - Tokenization, secret redaction, gzip helpers ([`tokenize`], [`redact`],
//!   [`compress`])
//! - Typed configuration with validation ([`config`])
//! - Cooperative cancellation ([`cancel`])

pub mod cancel;
pub mod compress;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod redact;
pub mod tokenize;
pub mod types;

pub use cancel::CancellationToken;
pub use error::{CodecErrorKind, Error, Result};
pub use types::{
    MemoryBody, MemoryId, MemoryItem, MemoryItemSummary, MemoryType, PayloadRef, Scope,
};
