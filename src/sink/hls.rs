//! HLS encoder sink backed by a child transcoder process.
//!
//! The child reads raw frames from stdin and writes `playlist.m3u8` plus
//! fixed-length `segment_NNN.ts` files. The playlist never receives an
//! `#EXT-X-ENDLIST` tag, so players keep treating the feed as live.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

use super::{FrameSink, SinkError, SinkFactory, SinkParams};
use crate::frame::PixelFormat;

pub const PLAYLIST_NAME: &str = "playlist.m3u8";
const SEGMENT_PATTERN: &str = "segment_%03d.ts";

/// Per-slot output directory under the segment root.
pub fn slot_output_dir(root: &Path, slot_id: u32) -> PathBuf {
    root.join(format!("cctv{}", slot_id))
}

/// Public playback URL of a slot's playlist.
pub fn playlist_url(base_url: &str, slot_id: u32) -> String {
    format!(
        "{}/streams/cctv{}/{}",
        base_url.trim_end_matches('/'),
        slot_id,
        PLAYLIST_NAME
    )
}

/// Create the output directory if needed.
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create stream output dir {}", dir.display()))
}

/// Remove stale playlists and segments so a new session never mixes with old media.
///
/// Returns the number of files removed.
pub fn purge_segments(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(anyhow!(
                "failed to list stream output dir {}: {}",
                dir.display(),
                err
            ))
        }
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let stale = path.is_file()
            && matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("ts") | Some("m3u8")
            );
        if stale {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Launches one transcoder child per session.
#[derive(Clone, Debug)]
pub struct HlsEncoderFactory {
    /// Transcoder executable (an ffmpeg-compatible CLI).
    pub program: String,
    /// Target segment length in seconds.
    pub segment_secs: u32,
    /// Segments kept in the playlist; 0 keeps every segment.
    pub playlist_size: u32,
    /// x264 constant rate factor.
    pub crf: u32,
    /// How long `stop` waits for the child to exit before killing it.
    pub stop_timeout: Duration,
}

impl Default for HlsEncoderFactory {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            segment_secs: 2,
            playlist_size: 0,
            crf: 28,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl HlsEncoderFactory {
    /// Command line for a session with the given geometry.
    pub fn command_args(&self, params: &SinkParams) -> Vec<String> {
        let gop = ((params.fps * 2.0).round() as u64).max(1);
        let mut hls_flags = String::from("omit_endlist");
        if self.playlist_size > 0 {
            hls_flags.push_str("+delete_segments");
        }
        if params.resume {
            // Keep numbering after the last listed segment instead of
            // overwriting segment_000.ts under a live player.
            hls_flags.push_str("+append_list+discont_start");
        }
        let output_dir = params.output_dir.display().to_string();
        let args = [
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-vcodec".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            PixelFormat::Bgr24.ffmpeg_name().to_string(),
            "-s".to_string(),
            format!("{}x{}", params.width, params.height),
            "-r".to_string(),
            format!("{}", params.fps),
            "-i".to_string(),
            "-".to_string(),
            "-an".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "ultrafast".to_string(),
            "-tune".to_string(),
            "zerolatency".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-g".to_string(),
            gop.to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            self.segment_secs.to_string(),
            "-hls_list_size".to_string(),
            self.playlist_size.to_string(),
            "-hls_flags".to_string(),
            hls_flags,
            "-hls_segment_filename".to_string(),
            format!("{}/{}", output_dir, SEGMENT_PATTERN),
            format!("{}/{}", output_dir, PLAYLIST_NAME),
        ];
        args.to_vec()
    }
}

impl SinkFactory for HlsEncoderFactory {
    fn start(&self, params: &SinkParams) -> Result<Box<dyn FrameSink>> {
        if params.width == 0 || params.height == 0 {
            return Err(anyhow!(
                "encoder geometry {}x{} is empty",
                params.width,
                params.height
            ));
        }
        prepare_output_dir(&params.output_dir)?;
        if !params.resume {
            let removed = purge_segments(&params.output_dir)?;
            if removed > 0 {
                log::info!(
                    "HlsEncoder: removed {} stale files from {}",
                    removed,
                    params.output_dir.display()
                );
            }
        }

        let mut child = Command::new(&self.program)
            .args(self.command_args(params))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to launch encoder '{}'", self.program))?;
        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("encoder stdin was not captured"));
            }
        };
        log::info!(
            "HlsEncoder: started pid {} for {}x{} @ {} fps into {}",
            child.id(),
            params.width,
            params.height,
            params.fps,
            params.output_dir.display()
        );

        Ok(Box::new(HlsEncoder {
            params: params.clone(),
            child: Some(child),
            stdin: Some(stdin),
            stop_timeout: self.stop_timeout,
        }))
    }
}

/// A running transcoder child and the write end of its stdin pipe.
pub struct HlsEncoder {
    params: SinkParams,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stop_timeout: Duration,
}

impl FrameSink for HlsEncoder {
    fn params(&self) -> &SinkParams {
        &self.params
    }

    fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), SinkError> {
        if bytes.len() != self.params.frame_bytes() {
            return Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "frame is {} bytes, encoder expects {}",
                    bytes.len(),
                    self.params.frame_bytes()
                ),
            )));
        }
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                log::warn!("HlsEncoder: child exited with {}", status);
                self.stdin = None;
                return Err(SinkError::BrokenPipe);
            }
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(SinkError::BrokenPipe);
        };
        stdin.write_all(bytes).map_err(SinkError::from)
    }

    fn stop(&mut self) {
        // Closing stdin lets the transcoder flush the last segment and exit.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return;
        };
        let deadline = Instant::now() + self.stop_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("HlsEncoder: pid {} exited with {}", child.id(), status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("HlsEncoder: failed to poll pid {}: {}", child.id(), err);
                    break;
                }
            }
        }
        log::warn!(
            "HlsEncoder: pid {} did not exit within {:?}, killing",
            child.id(),
            self.stop_timeout
        );
        if let Err(err) = child.kill() {
            log::warn!("HlsEncoder: kill failed: {}", err);
        }
        let _ = child.wait();
    }
}

impl Drop for HlsEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}
