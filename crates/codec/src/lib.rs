//! QR frame codec, video transcoder bridge, and binary frame index.
//!
//! This crate turns payload bytes into ordered QR frames ([`qr`]), packs
//! frame sequences into MP4 segments through an external transcoder
//! ([`video`]), and maintains the `.mvi` binary index that makes individual
//! frames seekable in O(log n) ([`frame_index`]).

pub mod frame_index;
pub mod qr;
pub mod video;

pub use frame_index::{FrameIndexEntry, FrameIndexView, FrameType};
pub use qr::{QrFrame, RgbaFrame};
