//! Round-trip seek correctness
//!
//! Encodes a multi-frame QR payload into an MP4, then extracts each frame
//! individually and verifies it decodes back to the chunk that was written
//! at that position. This guards the seek discipline: the selection filter
//! indexes from zero after the timestamp seek, so extracting frame `k` must
//! return the bytes originally encoded at frame `k`, for every `k`.

use engram_codec::frame_index::{self, FrameIndexEntry, FrameIndexView, FrameType};
use engram_codec::qr::{self, RgbaFrame};
use engram_codec::video;
use engram_core::cancel::CancellationToken;
use engram_core::config::{EccLevel, VideoOptions};
use tempfile::TempDir;

fn build_index(frame_count: u32, fps: u32, gop: u32, path: &std::path::Path) -> FrameIndexView {
    let entries: Vec<FrameIndexEntry> = (0..frame_count)
        .map(|i| {
            FrameIndexEntry::new(
                i,
                0,
                0,
                i * 1000 / fps,
                FrameType::Content,
                i % gop == 0,
            )
        })
        .collect();
    frame_index::write(&entries, path).unwrap();
    FrameIndexView::open_read(path).unwrap()
}

#[test]
fn extracted_frames_decode_to_original_chunks() {
    if !video::transcoder_available() {
        eprintln!("skipping: no transcoder on PATH");
        return;
    }
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let options = VideoOptions::default();

    // Incompressible payload spanning several chunks, so each frame carries
    // distinct content and any off-by-one misreads a neighboring chunk.
    let payload: Vec<u8> = (0..6000u32)
        .map(|i| (i.wrapping_mul(2654435761).rotate_left(7) >> 16) as u8)
        .collect();
    let frames = qr::encode(&payload, EccLevel::M).unwrap();
    assert!(frames.len() >= 3, "need a multi-frame payload for this test");

    let rgba: Vec<RgbaFrame> = frames.iter().map(RgbaFrame::from).collect();
    let mp4 = dir.path().join("segment.mp4");
    video::encode_to_mp4(&rgba, &options, &mp4, &cancel).unwrap();

    let mvi = dir.path().join("segment.mvi");
    let gop = video::gop_size(frames.len(), options.fps);
    let view = build_index(frames.len() as u32, options.fps, gop, &mvi);

    let mut recovered = Vec::new();
    for k in 0..frames.len() as u32 {
        let pixels =
            video::extract_frame(&mp4, &view, k, qr::FRAME_DIM, qr::FRAME_DIM, &cancel).unwrap();
        let extracted = RgbaFrame {
            rgba: pixels,
            width: qr::FRAME_DIM,
            height: qr::FRAME_DIM,
        };
        // Frame k must still carry chunk k's exact bytes after the lossy
        // video round trip
        let (header, body) = qr::scan_frame(&extracted).unwrap();
        let expected = &frames[k as usize];
        assert_eq!(
            header.chunk_index, expected.meta.chunk_index,
            "frame {k} decoded to the wrong chunk"
        );
        let (orig_header, orig_body) = qr::scan_frame(&RgbaFrame::from(expected)).unwrap();
        assert_eq!(header, orig_header);
        assert_eq!(body, orig_body, "frame {k} body bytes changed");
        recovered.push(extracted);
    }

    // Whole-payload reconstruction through the video layer
    assert_eq!(qr::decode(&recovered).unwrap(), payload);
}
