use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;

use crate::types::{Frame, Mask};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Bilinear,
    /// Keeps hard edges; used for silhouettes and masks.
    Nearest,
}

impl Interpolation {
    fn options(self) -> fir::ResizeOptions {
        let alg = match self {
            Interpolation::Bilinear => fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear),
            Interpolation::Nearest => fir::ResizeAlg::Nearest,
        };
        fir::ResizeOptions::new().resize_alg(alg)
    }
}

/// A resize to one fixed size, built once and reused for every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeTransform {
    width: u32,
    height: u32,
    interpolation: Interpolation,
}

impl ResizeTransform {
    pub fn new((width, height): (u32, u32), interpolation: Interpolation) -> Self {
        Self {
            width,
            height,
            interpolation,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn apply(&self, frame: &Frame) -> Result<Frame> {
        resize_frame(frame, self.width, self.height, self.interpolation)
    }

    /// Resizes 8-bit luminance and rescales it into a [`Mask`].
    pub fn apply_luma(&self, luma: &[u8], width: u32, height: u32) -> Result<Mask> {
        let resized = resize_luma(luma, width, height, self.width, self.height, self.interpolation)?;
        Mask::from_luma(&resized, self.width, self.height)
    }
}

pub fn resize_frame(
    frame: &Frame,
    width: u32,
    height: u32,
    interpolation: Interpolation,
) -> Result<Frame> {
    if frame.is_empty() || width == 0 || height == 0 {
        return Err(anyhow!(
            "cannot resize {}x{} frame to {width}x{height}",
            frame.width(),
            frame.height()
        ));
    }
    if frame.width() == width && frame.height() == height {
        return Ok(frame.clone());
    }

    let resized = resize_pixels(
        frame.data().to_vec(),
        (frame.width(), frame.height()),
        (width, height),
        fir::PixelType::U8x3,
        interpolation,
    )?;
    Frame::with_timestamp(resized, width, height, frame.order(), frame.timestamp)
}

pub fn resize_luma(
    luma: &[u8],
    width: u32,
    height: u32,
    dst_width: u32,
    dst_height: u32,
    interpolation: Interpolation,
) -> Result<Vec<u8>> {
    if width == 0 || height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(anyhow!(
            "cannot resize {width}x{height} luma plane to {dst_width}x{dst_height}"
        ));
    }
    if (width, height) == (dst_width, dst_height) {
        return Ok(luma.to_vec());
    }

    resize_pixels(
        luma.to_vec(),
        (width, height),
        (dst_width, dst_height),
        fir::PixelType::U8,
        interpolation,
    )
}

fn resize_pixels(
    data: Vec<u8>,
    (src_w, src_h): (u32, u32),
    (dst_w, dst_h): (u32, u32),
    pixel_type: fir::PixelType,
    interpolation: Interpolation,
) -> Result<Vec<u8>> {
    let src_image = fir::images::Image::from_vec_u8(src_w, src_h, data, pixel_type)
        .context("source buffer does not match its dimensions")?;
    let mut dst_image = fir::images::Image::new(dst_w, dst_h, pixel_type);
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, Some(&interpolation.options()))
        .context("fast resize failed")?;
    Ok(dst_image.into_vec())
}
