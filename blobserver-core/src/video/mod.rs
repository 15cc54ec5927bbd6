//! video — frame buffers shared by sources and detectors
//!
//! Every source hands the runtime packed RGB24 frames; detectors mostly work
//! on a single luma plane derived from them.  Both buffer types are plain
//! data so they can cross thread boundaries without holding device handles.

use anyhow::{Context, Result};
use fast_image_resize as fr;

/// A single frame in packed RGB24 format, row-major, no stride padding.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// An all-black frame of the given dimensions.
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; (width * height * 3) as usize],
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * self.width + x) * 3) as usize;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Collapse to a single luma plane (BT.601 weights).
    pub fn luma(&self) -> GrayFrame {
        let mut data = Vec::with_capacity((self.width * self.height) as usize);
        for chunk in self.data.chunks_exact(3) {
            let luma = (0.299 * chunk[0] as f32
                + 0.587 * chunk[1] as f32
                + 0.114 * chunk[2] as f32) as u8;
            data.push(luma);
        }
        GrayFrame {
            data,
            width: self.width,
            height: self.height,
        }
    }

    /// Rescale to `width × height` with a SIMD convolution filter.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        let src =
            fr::images::ImageRef::new(self.width, self.height, &self.data, fr::PixelType::U8x3)
                .context("failed to create resize source")?;
        let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);

        let mut resizer = fr::Resizer::new();
        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        resizer
            .resize(&src, &mut dst, Some(&options))
            .context("frame resize failed")?;

        Ok(Frame {
            data: dst.into_vec(),
            width,
            height,
        })
    }
}

/// A single-channel 8-bit plane: luma images and detection masks.
#[derive(Debug, Clone, Default)]
pub struct GrayFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Interpolation used when rescaling a mask to a frame's dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Linear,
}

impl GrayFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; (width * height) as usize],
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.width + x) as usize]
    }

    /// Rescale to `width × height`; masks default to nearest-neighbour so
    /// binary values stay binary.
    pub fn resized(&self, width: u32, height: u32, interp: Interpolation) -> Result<GrayFrame> {
        if self.width == width && self.height == height {
            return Ok(self.clone());
        }

        let src = fr::images::ImageRef::new(self.width, self.height, &self.data, fr::PixelType::U8)
            .context("failed to create mask resize source")?;
        let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8);

        let alg = match interp {
            Interpolation::Nearest => fr::ResizeAlg::Nearest,
            Interpolation::Linear => fr::ResizeAlg::Convolution(fr::FilterType::Bilinear),
        };
        let mut resizer = fr::Resizer::new();
        let options = fr::ResizeOptions::new().resize_alg(alg);
        resizer
            .resize(&src, &mut dst, Some(&options))
            .context("mask resize failed")?;

        Ok(GrayFrame {
            data: dst.into_vec(),
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luma_of_white_is_white() {
        let mut frame = Frame::black(4, 4);
        frame.data.fill(255);
        let gray = frame.luma();
        assert_eq!(gray.width, 4);
        assert!(gray.data.iter().all(|&v| v >= 254));
    }

    #[test]
    fn mask_resize_nearest_keeps_binary_values() {
        let mut mask = GrayFrame::new(2, 2);
        mask.data = vec![0, 255, 255, 0];
        let scaled = mask.resized(4, 4, Interpolation::Nearest).unwrap();
        assert_eq!(scaled.width, 4);
        assert!(scaled.data.iter().all(|&v| v == 0 || v == 255));
    }
}
