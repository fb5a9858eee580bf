//! Local file frame source.
//!
//! This module provides `FileSource` for ingesting frames from local video files.
//! Reaching the end of the file is reported as `ReadOutcome::EndOfStream`, which
//! ends the worker rather than triggering a reconnect.

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::{FrameSource, ReadOutcome, SourceInfo};

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "/home/ubuntu/videos/cctv1.mp4").
    pub path: String,
    /// Expected frame rate, used for stall detection.
    pub target_fps: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            target_fps: 10,
        }
    }
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        let path = std::path::Path::new(&config.path);
        if !path.is_file() {
            return Err(anyhow!("video file not found: {}", config.path));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(Self {
                backend: FileBackend::Ffmpeg(FfmpegFileSource::new(config)?),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "file ingestion requires the ingest-file-ffmpeg feature"
            ))
        }
    }

    /// Connect to the file source.
    pub fn connect(&mut self) -> Result<()> {
        match self.backend {
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(ref mut source) => source.connect(),
        }
    }
}

impl FrameSource for FileSource {
    fn info(&self) -> SourceInfo {
        match self.backend {
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(ref source) => source.info(),
        }
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        match self.backend {
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(ref mut source) => source.read_frame(),
        }
    }

    fn close(&mut self) {
        match self.backend {
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(ref mut source) => source.close(),
        }
    }

    fn is_healthy(&self) -> bool {
        match self.backend {
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(ref source) => source.is_healthy(),
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    !path.contains("://")
}
