//! In-memory raster frames.
//!
//! A `Frame` is produced by a source, owned by exactly one worker iteration, drawn
//! on by the overlay renderer and written to the encoder sink. It is never retained
//! past that iteration.

use anyhow::{anyhow, Result};

/// Pixel layouts understood by the pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    /// Interleaved 8-bit blue, green, red (row-major, no padding).
    #[default]
    Bgr24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr24 => 3,
        }
    }

    /// Name used on the encoder command line.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "bgr24",
        }
    }
}

/// Raw frame with tightly packed rows.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    /// Wrap packed BGR bytes. The buffer length must match the dimensions exactly.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = packed_len(width, height, PixelFormat::Bgr24)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} bgr24",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format: PixelFormat::Bgr24,
        })
    }

    /// A frame filled with a single BGR colour.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Result<Self> {
        let len = packed_len(width, height, PixelFormat::Bgr24)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..(len / 3) {
            data.extend_from_slice(&bgr);
        }
        Self::new(data, width, height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Pixel at (x, y), or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride() + x as usize * 3;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }

    /// Overwrite the pixel at (x, y). Out-of-range writes are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = y as usize * self.stride() + x as usize * 3;
        self.data[offset..offset + 3].copy_from_slice(&bgr);
    }

    /// Copy out the `width` x `height` region whose top-left corner is (x, y).
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Frame> {
        if width == 0 || height == 0 {
            return Err(anyhow!("crop region {}x{} is empty", width, height));
        }
        let right = x.checked_add(width);
        let bottom = y.checked_add(height);
        match (right, bottom) {
            (Some(r), Some(b)) if r <= self.width && b <= self.height => {}
            _ => {
                return Err(anyhow!(
                    "crop region {}x{}+{}+{} exceeds frame {}x{}",
                    width,
                    height,
                    x,
                    y,
                    self.width,
                    self.height
                ))
            }
        }

        let stride = self.stride();
        let row_bytes = width as usize * 3;
        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in y as usize..(y + height) as usize {
            let start = row * stride + x as usize * 3;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Frame::new(data, width, height)
    }
}

/// Largest even dimensions not exceeding the input (H.264 needs even sizes).
pub fn even_dimensions(width: u32, height: u32) -> (u32, u32) {
    (width & !1, height & !1)
}

fn packed_len(width: u32, height: u32, format: PixelFormat) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(format.bytes_per_pixel()))
        .ok_or_else(|| anyhow!("frame dimensions {}x{} overflow", width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::new(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn crop_copies_region_rows() -> Result<()> {
        let mut frame = Frame::filled(4, 4, [0, 0, 0])?;
        frame.put_pixel(1, 1, [9, 8, 7]);
        frame.put_pixel(2, 2, [1, 2, 3]);

        let crop = frame.crop(1, 1, 2, 2)?;
        assert_eq!(crop.width, 2);
        assert_eq!(crop.height, 2);
        assert_eq!(crop.pixel(0, 0), Some([9, 8, 7]));
        assert_eq!(crop.pixel(1, 1), Some([1, 2, 3]));
        assert_eq!(crop.pixel(1, 0), Some([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn crop_outside_frame_fails() -> Result<()> {
        let frame = Frame::filled(4, 4, [0, 0, 0])?;
        assert!(frame.crop(3, 3, 2, 2).is_err());
        assert!(frame.crop(0, 0, 0, 2).is_err());
        Ok(())
    }

    #[test]
    fn even_dimensions_round_down() {
        assert_eq!(even_dimensions(641, 481), (640, 480));
        assert_eq!(even_dimensions(640, 480), (640, 480));
        assert_eq!(even_dimensions(1, 1), (0, 0));
    }
}
