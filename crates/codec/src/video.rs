//! Video transcoder bridge
//!
//! Frames are streamed to an external transcoder (`ffmpeg`) as raw RGBA on
//! stdin; the transcoder emits a fragmented MP4 on stdout. Fragmented output
//! lets the subprocess stream into a pipe without needing a seekable sink;
//! all seek metadata lives in the `.mvi` frame index, not the container.
//!
//! # Seek discipline
//!
//! `extract_frame` seeks with the fast timestamp flag to the nearest
//! keyframe at or before the target, then selects by index *within the
//! post-seek stream*: the selection filter counts from zero after the seek,
//! so the selector is `target - keyframe`, never the absolute frame number.
//! Getting this wrong extracts a frame `keyframe` positions away from the
//! requested one; the round-trip test in `tests/seek.rs` guards it.

use once_cell::sync::OnceCell;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

use engram_core::cancel::{deadlines, CancellationToken};
use engram_core::config::VideoOptions;
use engram_core::error::{Error, Result};

use crate::frame_index::FrameIndexView;
use crate::qr::RgbaFrame;

// ============================================================================
// Availability
// ============================================================================

static TRANSCODER: OnceCell<Option<PathBuf>> = OnceCell::new();

/// Locate the transcoder binary on PATH (probed once per process)
pub fn probe_transcoder() -> Option<&'static Path> {
    TRANSCODER
        .get_or_init(|| {
            let found = std::env::var_os("PATH").and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join("ffmpeg"))
                    .find(|candidate| candidate.is_file())
            });
            match &found {
                Some(path) => debug!(path = %path.display(), "transcoder detected"),
                None => warn!("no transcoder on PATH; video backend unavailable"),
            }
            found
        })
        .as_deref()
}

/// Whether the video backend can operate at all
pub fn transcoder_available() -> bool {
    probe_transcoder().is_some()
}

fn transcoder() -> Result<&'static Path> {
    probe_transcoder().ok_or_else(|| {
        Error::DependencyMissing("no video transcoder (ffmpeg) found on PATH".into())
    })
}

/// Keyframe interval: at least one keyframe per second of video
pub fn gop_size(frame_count: usize, fps: u32) -> u32 {
    (frame_count as u32).clamp(1, fps.min(30))
}

// ============================================================================
// Encode
// ============================================================================

/// Encode an ordered frame sequence into an MP4 at `out_path`
///
/// All frames must share dimensions. The output file is fsynced; atomic
/// placement (tmp+rename) is the caller's concern.
pub fn encode_to_mp4(
    frames: &[RgbaFrame],
    options: &VideoOptions,
    out_path: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let first = frames
        .first()
        .ok_or_else(|| Error::InvalidInput("cannot encode an empty frame sequence".into()))?;
    let (width, height) = (first.width, first.height);
    for (i, frame) in frames.iter().enumerate() {
        if frame.width != width || frame.height != height {
            return Err(Error::InvalidInput(format!(
                "frame {i} is {}x{}, segment is {width}x{height}",
                frame.width, frame.height
            )));
        }
    }

    let gop = gop_size(frames.len(), options.fps);
    let mut child = Command::new(transcoder()?)
        .args(["-hide_banner", "-loglevel", "error"])
        .args(["-f", "rawvideo", "-pix_fmt", "rgba"])
        .args(["-s", &format!("{width}x{height}")])
        .args(["-r", &options.fps.to_string()])
        .args(["-i", "-"])
        .args(["-c:v", options.codec.encoder_name()])
        .args(["-preset", options.preset.as_str()])
        .args(["-crf", &options.crf.to_string()])
        .args(["-g", &gop.to_string()])
        .args(["-pix_fmt", "yuv420p"])
        .args(["-movflags", "+frag_keyframe+empty_moov+default_base_moof"])
        .args(["-f", "mp4", "pipe:1"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Store(format!("spawning transcoder: {e}")))?;

    // Feed raw frames from a separate thread so stdout never deadlocks on a
    // full pipe while we are still writing stdin.
    let mut stdin = child.stdin.take().expect("stdin was piped");
    let raw: Vec<Vec<u8>> = frames.iter().map(|f| f.rgba.clone()).collect();
    let feeder = std::thread::Builder::new()
        .name("engram-transcode-in".into())
        .spawn(move || -> std::io::Result<()> {
            for frame in &raw {
                stdin.write_all(frame)?;
            }
            // Drop closes the pipe and signals end of input
            Ok(())
        })
        .map_err(|e| Error::Store(format!("spawning feeder thread: {e}")))?;

    let mut mp4 = Vec::new();
    child
        .stdout
        .take()
        .expect("stdout was piped")
        .read_to_end(&mut mp4)?;

    if let Err(e) = feeder.join().expect("feeder thread must not panic") {
        // A broken pipe here usually means the transcoder already failed;
        // the exit status below carries the real diagnostic.
        debug!(error = %e, "feeder thread ended early");
    }

    wait_with_deadline(&mut child, deadlines::transcoder(frames.len()), cancel)?;
    std::fs::write(out_path, &mp4)?;
    let file = std::fs::File::open(out_path)?;
    file.sync_all()?;
    debug!(
        frames = frames.len(),
        bytes = mp4.len(),
        path = %out_path.display(),
        "encoded segment"
    );
    Ok(())
}

/// Decode an entire segment back into raw RGBA frames
///
/// Used when extending a consolidated segment: existing frames are re-read,
/// new frames appended, and the whole sequence re-encoded into a fresh file
/// that replaces the old one atomically.
pub fn read_all_frames(
    video_path: &Path,
    frame_count: u32,
    width: u32,
    height: u32,
    cancel: &CancellationToken,
) -> Result<Vec<RgbaFrame>> {
    if frame_count == 0 {
        return Ok(Vec::new());
    }
    let mut child = Command::new(transcoder()?)
        .args(["-hide_banner", "-loglevel", "error"])
        .arg("-i")
        .arg(video_path)
        .args(["-vsync", "0"])
        .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Store(format!("spawning transcoder: {e}")))?;

    let frame_bytes = (width * height * 4) as usize;
    let mut raw = Vec::with_capacity(frame_bytes * frame_count as usize);
    child
        .stdout
        .take()
        .expect("stdout was piped")
        .read_to_end(&mut raw)?;
    wait_with_deadline(&mut child, deadlines::transcoder(frame_count as usize), cancel)?;

    if raw.len() != frame_bytes * frame_count as usize {
        return Err(Error::Decode(format!(
            "segment decoded to {} bytes, expected {} for {frame_count} frames",
            raw.len(),
            frame_bytes * frame_count as usize
        )));
    }
    Ok(raw
        .chunks_exact(frame_bytes)
        .map(|chunk| RgbaFrame {
            rgba: chunk.to_vec(),
            width,
            height,
        })
        .collect())
}

// ============================================================================
// Extract
// ============================================================================

/// Extract one frame of a segment as raw RGBA bytes
///
/// Seeks to the nearest keyframe at or before `frame_number`, then decodes
/// forward. On a decode failure the extraction retries once from the
/// preceding keyframe (or stream start).
pub fn extract_frame(
    video_path: &Path,
    index: &FrameIndexView,
    frame_number: u32,
    width: u32,
    height: u32,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    index.get_frame(frame_number).ok_or_else(|| {
        Error::Decode(format!(
            "frame {frame_number} not present in index for {}",
            video_path.display()
        ))
    })?;

    let keyframe = index
        .find_nearest_keyframe(frame_number)
        .map(|e| e.frame_number)
        .unwrap_or(0);

    match run_extract(video_path, index, keyframe, frame_number, width, height, cancel) {
        Ok(rgba) => Ok(rgba),
        Err(first_err) if keyframe > 0 => {
            // Fall back to an earlier seek point and decode further forward
            let earlier = index
                .find_nearest_keyframe(keyframe - 1)
                .map(|e| e.frame_number)
                .unwrap_or(0);
            warn!(
                frame = frame_number,
                keyframe,
                retry_from = earlier,
                error = %first_err,
                "frame extraction failed, retrying from earlier keyframe"
            );
            run_extract(video_path, index, earlier, frame_number, width, height, cancel)
        }
        Err(e) => Err(e),
    }
}

fn run_extract(
    video_path: &Path,
    index: &FrameIndexView,
    seek_frame: u32,
    frame_number: u32,
    width: u32,
    height: u32,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let seek_ts_ms = index
        .get_frame(seek_frame)
        .map(|e| e.timestamp_ms)
        .unwrap_or(0);
    // The post-seek stream restarts frame numbering at zero, so the selector
    // is relative to the seek point.
    let offset = frame_number - seek_frame;

    let mut child = Command::new(transcoder()?)
        .args(["-hide_banner", "-loglevel", "error"])
        .args(["-ss", &format!("{}.{:03}", seek_ts_ms / 1000, seek_ts_ms % 1000)])
        .arg("-i")
        .arg(video_path)
        .args(["-vf", &format!("select=eq(n\\,{offset})")])
        .args(["-vsync", "0"])
        .args(["-frames:v", "1"])
        .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Store(format!("spawning transcoder: {e}")))?;

    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    child
        .stdout
        .take()
        .expect("stdout was piped")
        .read_to_end(&mut rgba)?;
    wait_with_deadline(&mut child, deadlines::transcoder(1), cancel)?;

    let expected = (width * height * 4) as usize;
    if rgba.len() != expected {
        return Err(Error::Decode(format!(
            "extracted {} bytes for frame {frame_number}, expected {expected}",
            rgba.len()
        )));
    }
    Ok(rgba)
}

// ============================================================================
// Subprocess supervision
// ============================================================================

fn wait_with_deadline(
    child: &mut Child,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(());
            }
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(Error::Store(format!(
                "transcoder exited with {status}: {}",
                stderr.trim()
            )));
        }
        if cancel.is_cancelled() || started.elapsed() > deadline {
            let _ = child.kill();
            let _ = child.wait();
            return if cancel.is_cancelled() {
                Err(Error::Cancelled("transcoder subprocess".into()))
            } else {
                Err(Error::Store(format!(
                    "transcoder exceeded deadline of {deadline:?}"
                )))
            };
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gop_keyframe_every_second_or_less() {
        assert_eq!(gop_size(5, 30), 5);
        assert_eq!(gop_size(30, 30), 30);
        assert_eq!(gop_size(500, 30), 30);
        assert_eq!(gop_size(500, 24), 24);
        assert_eq!(gop_size(0, 30), 1);
    }

    #[test]
    fn test_encode_rejects_empty_input() {
        let cancel = CancellationToken::new();
        let err = encode_to_mp4(
            &[],
            &VideoOptions::default(),
            Path::new("/tmp/never-written.mp4"),
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[test]
    fn test_encode_rejects_mismatched_dimensions() {
        // Dimension validation runs before the transcoder probe
        let cancel = CancellationToken::new();
        let frames = vec![
            RgbaFrame {
                rgba: vec![0; 16],
                width: 2,
                height: 2,
            },
            RgbaFrame {
                rgba: vec![0; 64],
                width: 4,
                height: 4,
            },
        ];
        let err = encode_to_mp4(
            &frames,
            &VideoOptions::default(),
            Path::new("/tmp/never-written.mp4"),
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }
}
