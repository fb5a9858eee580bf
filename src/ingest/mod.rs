//! Frame ingestion sources.
//!
//! This module provides different sources for frames:
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` sources (testing and demos)
//!
//! Network sources fail routinely. A read distinguishes "no frame right now"
//! (`ReadOutcome::Pending` or an `Err`) from "the source is gone for good"
//! (`ReadOutcome::EndOfStream`); the worker decides when repeated failures
//! warrant a reconnect.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod rtsp;

use anyhow::{anyhow, Result};
use url::Url;

use crate::frame::Frame;

pub use file::{FileConfig, FileSource};
pub use rtsp::{RtspConfig, RtspSource};

/// Native stream properties reported when a source opens.
///
/// Network sources often report 0 for unknown values; see [`SourceInfo::with_defaults`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl SourceInfo {
    /// Replace unknown (zero, negative or non-finite) values with configured defaults
    /// so timing math downstream never divides by zero.
    pub fn with_defaults(self, default_fps: f64, default_width: u32, default_height: u32) -> Self {
        let fps = if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            default_fps
        };
        Self {
            width: if self.width == 0 { default_width } else { self.width },
            height: if self.height == 0 {
                default_height
            } else {
                self.height
            },
            fps,
        }
    }
}

/// Result of a single read.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// No frame available right now; the caller should retry.
    Pending,
    /// The source has no more frames (end of file).
    EndOfStream,
}

/// An open capture.
pub trait FrameSource: Send {
    /// Native resolution and frame rate, as reported by the source.
    fn info(&self) -> SourceInfo;

    /// Read the next frame. Errors are transient unless they persist.
    fn read_frame(&mut self) -> Result<ReadOutcome>;

    /// Release the capture. Must be safe to call more than once.
    fn close(&mut self);

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Opens captures from locators (URLs or local paths).
pub trait SourceOpener: Send + Sync {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>>;
}

/// Opener that dispatches on the locator scheme:
/// - `stub://` and `rtsp(s)://` to [`RtspSource`]
/// - anything without a scheme to [`FileSource`]
#[derive(Clone, Debug)]
pub struct StandardSourceOpener {
    /// Frame rate requested from sources that need one up front.
    pub target_fps: u32,
    /// Resolution used by synthetic sources that do not specify one.
    pub width: u32,
    pub height: u32,
}

impl Default for StandardSourceOpener {
    fn default() -> Self {
        Self {
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

impl SourceOpener for StandardSourceOpener {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>> {
        match locator_scheme(locator).as_deref() {
            Some("stub") | Some("rtsp") | Some("rtsps") => {
                let mut source = RtspSource::new(RtspConfig {
                    url: locator.to_string(),
                    target_fps: self.target_fps,
                    width: self.width,
                    height: self.height,
                })?;
                source.connect()?;
                Ok(Box::new(source))
            }
            Some(other) => Err(anyhow!("unsupported source scheme '{}'", other)),
            None => {
                let mut source = FileSource::new(FileConfig {
                    path: locator.to_string(),
                    target_fps: self.target_fps,
                })?;
                source.connect()?;
                Ok(Box::new(source))
            }
        }
    }
}

/// Lower-cased URL scheme, or `None` for plain paths.
///
/// Single-letter schemes are treated as Windows drive letters.
fn locator_scheme(locator: &str) -> Option<String> {
    let url = Url::parse(locator).ok()?;
    let scheme = url.scheme();
    if scheme.len() == 1 {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}
