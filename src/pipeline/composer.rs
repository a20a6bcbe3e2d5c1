use anyhow::anyhow;
use rayon::prelude::*;

use super::{
    background::blend,
    resize::{Interpolation, resize_frame},
};
use crate::{
    error::{PipelineError, PipelineResult},
    types::{CHANNELS, CropRegion, Frame, Mask},
};

/// Whole-frame blend applied after pasting: `output * mask + backdrop * (1 - mask)`.
pub struct BackgroundBlend<'a> {
    pub mask: &'a Mask,
    pub backdrop: &'a Frame,
}

/// Pastes synthesized crops back into full frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameComposer;

impl FrameComposer {
    pub fn new() -> Self {
        Self
    }

    /// Resizes `sub_image` onto `region` of `base` and applies the optional blend.
    ///
    /// `base` is modified in place and handed back. An empty region leaves the
    /// pixels of `base` untouched (the blend still applies).
    pub fn compose(
        &self,
        mut base: Frame,
        sub_image: &Frame,
        region: CropRegion,
        blend_with: Option<BackgroundBlend<'_>>,
    ) -> PipelineResult<Frame> {
        if !region.fits(base.width(), base.height()) {
            return Err(PipelineError::Other(anyhow!(
                "region {region:?} outside {}x{} frame",
                base.width(),
                base.height()
            )));
        }

        if !region.is_empty() {
            let patch = resize_frame(
                &sub_image.clone().into_order(base.order()),
                region.width(),
                region.height(),
                Interpolation::Bilinear,
            )?;
            paste(&mut base, &patch, region);
        }

        if let Some(BackgroundBlend { mask, backdrop }) = blend_with {
            blend_frames(&mut base, mask, backdrop)?;
        }

        Ok(base)
    }
}

/// Overwrites the `region` window of `frame` row by row. `patch` must be exactly
/// the region's size.
fn paste(frame: &mut Frame, patch: &Frame, region: CropRegion) {
    let dst_stride = frame.stride();
    let row_len = patch.stride();
    let data = frame.data_mut();
    for (row, src_row) in patch.data().chunks_exact(row_len).enumerate() {
        let offset = (region.top as usize + row) * dst_stride + region.left as usize * CHANNELS;
        data[offset..offset + row_len].copy_from_slice(src_row);
    }
}

fn blend_frames(output: &mut Frame, mask: &Mask, backdrop: &Frame) -> PipelineResult<()> {
    if !mask.matches(output)
        || backdrop.width() != output.width()
        || backdrop.height() != output.height()
    {
        return Err(PipelineError::Other(anyhow!(
            "blend inputs do not match the {}x{} output",
            output.width(),
            output.height()
        )));
    }

    let backdrop = backdrop.clone().into_order(output.order());
    output
        .data_mut()
        .par_chunks_exact_mut(CHANNELS)
        .zip(backdrop.data().par_chunks_exact(CHANNELS))
        .zip(mask.data().par_iter())
        .for_each(|((px, back), weight)| {
            for (value, b) in px.iter_mut().zip(back) {
                *value = blend(*value, *b, *weight);
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelOrder;

    fn gradient(width: u32, height: u32) -> Frame {
        let data = (0..width * height * 3).map(|v| (v % 97) as u8).collect();
        Frame::new(data, width, height, PixelOrder::Rgb).unwrap()
    }

    #[test]
    fn pastes_resized_patch_into_region_only() {
        let base = gradient(20, 10);
        let original = base.clone();
        let patch = Frame::filled(4, 4, PixelOrder::Rgb, [255, 0, 0]);
        let region = CropRegion {
            top: 2,
            left: 5,
            bottom: 8,
            right: 8,
        };

        let out = FrameComposer::new().compose(base, &patch, region, None).unwrap();

        for y in 0..10u32 {
            for x in 0..20u32 {
                let idx = ((y * 20 + x) * 3) as usize;
                let inside = (2..8).contains(&y) && (5..8).contains(&x);
                if inside {
                    assert_eq!(&out.data()[idx..idx + 3], &[255, 0, 0], "({x}, {y})");
                } else {
                    assert_eq!(out.data()[idx..idx + 3], original.data()[idx..idx + 3]);
                }
            }
        }
    }

    #[test]
    fn patch_follows_base_pixel_order() {
        let base = Frame::filled(4, 4, PixelOrder::Bgr, [0, 0, 0]);
        let patch = Frame::filled(2, 2, PixelOrder::Rgb, [255, 0, 0]);
        let region = CropRegion {
            top: 0,
            left: 0,
            bottom: 4,
            right: 4,
        };
        let out = FrameComposer::new().compose(base, &patch, region, None).unwrap();
        assert_eq!(&out.data()[..3], &[0, 0, 255]);
    }

    #[test]
    fn blend_restores_backdrop_outside_mask() {
        let base = Frame::filled(4, 2, PixelOrder::Rgb, [255, 255, 255]);
        let backdrop = Frame::filled(4, 2, PixelOrder::Rgb, [10, 20, 30]);
        let mask = Mask::new(vec![1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0], 4, 2).unwrap();

        let out = FrameComposer::new()
            .compose(
                base,
                &Frame::filled(1, 1, PixelOrder::Rgb, [0, 0, 0]),
                CropRegion::EMPTY,
                Some(BackgroundBlend {
                    mask: &mask,
                    backdrop: &backdrop,
                }),
            )
            .unwrap();

        assert_eq!(&out.data()[..3], &[255, 255, 255]);
        assert_eq!(&out.data()[3..6], &[10, 20, 30]);
    }

    #[test]
    fn region_outside_frame_is_rejected() {
        let region = CropRegion {
            top: 0,
            left: 0,
            bottom: 11,
            right: 4,
        };
        let patch = Frame::filled(1, 1, PixelOrder::Rgb, [0, 0, 0]);
        assert!(
            FrameComposer::new()
                .compose(gradient(4, 10), &patch, region, None)
                .is_err()
        );
    }
}
