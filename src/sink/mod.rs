//! Encoder sinks.
//!
//! A sink consumes packed frames at a fixed resolution and rate. The production
//! sink ([`HlsEncoder`]) pipes raw frames into a child transcoder that writes a
//! perpetually-live HLS playlist plus segments into the slot's output directory.
//!
//! Sinks are not self-healing: after `write_frame` reports
//! [`SinkError::BrokenPipe`] the owner must `stop` the sink and start a new one.

mod hls;

use anyhow::Result;
use std::path::PathBuf;

pub use hls::{
    playlist_url, prepare_output_dir, purge_segments, slot_output_dir, HlsEncoder,
    HlsEncoderFactory, PLAYLIST_NAME,
};

/// Geometry and destination for a sink session.
#[derive(Clone, Debug, PartialEq)]
pub struct SinkParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub output_dir: PathBuf,
    /// Continue the playlist of an earlier sink in this session instead of
    /// starting a fresh one.
    pub resume: bool,
}

impl SinkParams {
    /// Bytes of one packed BGR frame at this geometry.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Error returned by [`FrameSink::write_frame`].
#[derive(Debug)]
pub enum SinkError {
    /// The consumer is gone; the sink must be replaced.
    BrokenPipe,
    /// Any other write failure; the sink may still be usable.
    Io(std::io::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::BrokenPipe => write!(f, "encoder pipe is broken"),
            SinkError::Io(err) => write!(f, "encoder write failed: {}", err),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::BrokenPipe => None,
            SinkError::Io(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => SinkError::BrokenPipe,
            _ => SinkError::Io(err),
        }
    }
}

/// An open encoder session, exclusively owned by one worker.
pub trait FrameSink: Send {
    fn params(&self) -> &SinkParams;

    fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), SinkError>;

    /// Release the session. Must be idempotent and must tolerate a dead consumer.
    fn stop(&mut self);
}

/// Starts encoder sessions.
pub trait SinkFactory: Send + Sync {
    fn start(&self, params: &SinkParams) -> Result<Box<dyn FrameSink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_kinds_map_to_broken_pipe() {
        let err: SinkError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, SinkError::BrokenPipe));
        let err: SinkError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, SinkError::Io(_)));
    }

    #[test]
    fn frame_bytes_matches_geometry() {
        let params = SinkParams {
            width: 640,
            height: 480,
            fps: 25.0,
            output_dir: PathBuf::from("/tmp/out"),
            resume: false,
        };
        assert_eq!(params.frame_bytes(), 640 * 480 * 3);
    }
}
