use std::time::Instant;

use anyhow::{Result, anyhow};

/// Channels per pixel for every [`Frame`].
pub const CHANNELS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelOrder {
    Rgb,
    Bgr,
}

/// A dense 8-bit, 3-channel image. Dimensions are fixed at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    order: PixelOrder,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, order: PixelOrder) -> Result<Self> {
        Self::with_timestamp(data, width, height, order, Instant::now())
    }

    pub fn with_timestamp(
        data: Vec<u8>,
        width: u32,
        height: u32,
        order: PixelOrder,
        timestamp: Instant,
    ) -> Result<Self> {
        let expected_len = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(CHANNELS);
        if data.len() != expected_len {
            return Err(anyhow!(
                "frame buffer size mismatch: got {}, expected {} for {width}x{height}",
                data.len(),
                expected_len
            ));
        }

        Ok(Self {
            data,
            width,
            height,
            order,
            timestamp,
        })
    }

    /// A frame of one solid color, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, order: PixelOrder, pixel: [u8; 3]) -> Self {
        let data = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * CHANNELS)
            .collect();
        Self {
            data,
            width,
            height,
            order,
            timestamp: Instant::now(),
        }
    }

    pub fn from_rgb_image(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            order: PixelOrder::Rgb,
            timestamp: Instant::now(),
        }
    }

    pub fn into_rgb_image(self) -> Result<image::RgbImage> {
        let (width, height) = (self.width, self.height);
        let frame = self.into_order(PixelOrder::Rgb);
        image::RgbImage::from_raw(width, height, frame.data)
            .ok_or_else(|| anyhow!("frame buffer does not fit a {width}x{height} RGB image"))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn order(&self) -> PixelOrder {
        self.order
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn stride(&self) -> usize {
        self.width as usize * CHANNELS
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns the frame in `order`, swapping the red and blue channels when needed.
    pub fn into_order(mut self, order: PixelOrder) -> Self {
        if self.order != order {
            for px in self.data.chunks_exact_mut(CHANNELS) {
                px.swap(0, 2);
            }
            self.order = order;
        }
        self
    }

    /// Copies out the window `[top, bottom) x [left, right)`. The window must lie
    /// inside the frame.
    pub fn slice(&self, top: u32, left: u32, bottom: u32, right: u32) -> Result<Frame> {
        if top > bottom || left > right || bottom > self.height || right > self.width {
            return Err(anyhow!(
                "slice [{top}..{bottom}, {left}..{right}] outside {}x{} frame",
                self.width,
                self.height
            ));
        }

        let out_w = (right - left) as usize;
        let out_h = (bottom - top) as usize;
        let src_stride = self.stride();
        let row_len = out_w * CHANNELS;
        let mut data = Vec::with_capacity(out_h * row_len);
        for row in top as usize..bottom as usize {
            let offset = row * src_stride + left as usize * CHANNELS;
            data.extend_from_slice(&self.data[offset..offset + row_len]);
        }

        Ok(Frame {
            data,
            width: out_w as u32,
            height: out_h as u32,
            order: self.order,
            timestamp: self.timestamp,
        })
    }
}

/// Single-channel blend weights in `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    data: Vec<f32>,
    width: u32,
    height: u32,
}

impl Mask {
    pub fn new(data: Vec<f32>, width: u32, height: u32) -> Result<Self> {
        let expected_len = width as usize * height as usize;
        if data.len() != expected_len {
            return Err(anyhow!(
                "mask size mismatch: got {} values, expected {expected_len} for {width}x{height}",
                data.len()
            ));
        }
        if let Some(bad) = data.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(anyhow!("mask value {bad} outside [0, 1]"));
        }

        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            data: vec![value.clamp(0.0, 1.0); width as usize * height as usize],
            width,
            height,
        }
    }

    /// Builds a mask from 8-bit luminance, scaling by `1 / 255`.
    pub fn from_luma(data: &[u8], width: u32, height: u32) -> Result<Self> {
        Self::new(
            data.iter().map(|v| *v as f32 / 255.0).collect(),
            width,
            height,
        )
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        self.width == frame.width() && self.height == frame.height()
    }
}

/// Pixel bounds in original-frame coordinates; `bottom` and `right` are exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CropRegion {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl CropRegion {
    pub const EMPTY: CropRegion = CropRegion {
        top: 0,
        left: 0,
        bottom: 0,
        right: 0,
    };

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Clamps every bound into `[0, height] x [0, width]`, keeping `top <= bottom`
    /// and `left <= right`.
    pub fn clamped(&self, width: u32, height: u32) -> CropRegion {
        let top = self.top.min(height);
        let left = self.left.min(width);
        CropRegion {
            top,
            left,
            bottom: self.bottom.clamp(top, height),
            right: self.right.clamp(left, width),
        }
    }

    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.top <= self.bottom
            && self.left <= self.right
            && self.bottom <= height
            && self.right <= width
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CropResult {
    pub origin_frame: Frame,
    /// Aspect-normalized crop at the target size; `None` when no body was found.
    pub cropped_frame: Option<Frame>,
    pub region: CropRegion,
}

impl CropResult {
    pub fn not_found(frame: Frame) -> Self {
        Self {
            origin_frame: frame,
            cropped_frame: None,
            region: CropRegion::EMPTY,
        }
    }

    pub fn is_found(&self) -> bool {
        self.cropped_frame.is_some()
    }
}

/// Normalized `(x, y)` keypoints in `[0, 1]` of the frame they came from.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseLandmarks {
    pub points: Vec<(f32, f32)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeSource {
    Silhouette,
    Predicted,
}

/// The session's garment at the target size, plus the edge map fed to the
/// warping model.
#[derive(Clone, Debug)]
pub struct GarmentSample {
    pub image: Frame,
    pub edge: Mask,
    pub edge_source: EdgeSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_buffer_len() {
        assert!(Frame::new(vec![0; 11], 2, 2, PixelOrder::Rgb).is_err());
        assert!(Frame::new(vec![0; 12], 2, 2, PixelOrder::Rgb).is_ok());
    }

    #[test]
    fn slice_copies_window() {
        let data: Vec<u8> = (0..4 * 3 * 3).map(|v| v as u8).collect();
        let frame = Frame::new(data, 4, 3, PixelOrder::Rgb).unwrap();
        let window = frame.slice(1, 1, 3, 3).unwrap();
        assert_eq!((window.width(), window.height()), (2, 2));
        assert_eq!(&window.data()[..3], &[15, 16, 17]);
        assert_eq!(&window.data()[6..9], &[27, 28, 29]);
        assert!(frame.slice(0, 0, 4, 4).is_err());
    }

    #[test]
    fn into_order_swaps_red_and_blue() {
        let frame = Frame::filled(1, 1, PixelOrder::Bgr, [1, 2, 3]);
        let rgb = frame.into_order(PixelOrder::Rgb);
        assert_eq!(rgb.data(), &[3, 2, 1]);
        assert_eq!(rgb.order(), PixelOrder::Rgb);
    }

    #[test]
    fn mask_rejects_out_of_range_and_nan() {
        assert!(Mask::new(vec![0.0, 1.5], 2, 1).is_err());
        assert!(Mask::new(vec![0.0, f32::NAN], 2, 1).is_err());
        assert!(Mask::new(vec![0.0, 1.0], 1, 1).is_err());
        assert!(Mask::new(vec![0.0, 1.0], 2, 1).is_ok());
    }

    #[test]
    fn region_fits_checks_bounds() {
        let region = CropRegion {
            top: 0,
            left: 2,
            bottom: 4,
            right: 6,
        };
        assert!(region.fits(6, 4));
        assert!(!region.fits(5, 4));
        assert_eq!((region.width(), region.height()), (4, 4));
    }
}
