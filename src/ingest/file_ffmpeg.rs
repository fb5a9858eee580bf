//! Local file frame source using FFmpeg.
//!
//! Decodes the best video stream of a local file and converts every frame to
//! packed BGR at native resolution.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use std::time::Instant;

use super::file::FileConfig;
use super::{ReadOutcome, SourceInfo};
use crate::frame::Frame;

pub(crate) struct FfmpegFileSource {
    config: FileConfig,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    info: SourceInfo,
    frame_count: u64,
    eof_sent: bool,
    finished: bool,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

impl FfmpegFileSource {
    pub(crate) fn new(config: FileConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", config.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let fps = f64::from(input_stream.avg_frame_rate());
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::BGR24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let info = SourceInfo {
            width: decoder.width(),
            height: decoder.height(),
            fps: if fps.is_finite() { fps } else { 0.0 },
        };

        Ok(Self {
            config,
            input,
            stream_index,
            decoder,
            scaler,
            info,
            frame_count: 0,
            eof_sent: false,
            finished: false,
            connected_at: None,
            last_error: None,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.connected_at = Some(Instant::now());
        log::info!(
            "FileSource: opened {} ({}x{} @ {:.2} fps, ffmpeg)",
            self.config.path,
            self.info.width,
            self.info.height,
            self.info.fps
        );
        Ok(())
    }

    pub(crate) fn info(&self) -> SourceInfo {
        self.info
    }

    pub(crate) fn read_frame(&mut self) -> Result<ReadOutcome> {
        if self.finished {
            return Ok(ReadOutcome::EndOfStream);
        }

        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut bgr_frame = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut bgr_frame)
                    .context("scale frame to BGR")?;
                let frame = video_to_frame(&bgr_frame)?;
                self.frame_count += 1;
                return Ok(ReadOutcome::Frame(frame));
            }
            if self.eof_sent {
                self.finished = true;
                log::info!(
                    "FileSource: {} ended after {} frames",
                    self.config.path,
                    self.frame_count
                );
                return Ok(ReadOutcome::EndOfStream);
            }

            let mut sent = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                if let Err(err) = self.decoder.send_packet(&packet) {
                    self.last_error = Some(err.to_string());
                    return Err(anyhow::anyhow!("send packet to ffmpeg decoder: {}", err));
                }
                sent = true;
                break;
            }
            if !sent {
                self.decoder
                    .send_eof()
                    .context("flush ffmpeg decoder")?;
                self.eof_sent = true;
            }
        }
    }

    pub(crate) fn close(&mut self) {
        self.finished = true;
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.connected_at.is_some() && self.last_error.is_none() && !self.finished
    }
}

fn video_to_frame(frame: &ffmpeg::frame::Video) -> Result<Frame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Frame::new(pixels, width, height)
}
