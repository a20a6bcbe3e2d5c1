use std::sync::Arc;

use anyhow::anyhow;
use rayon::prelude::*;

use crate::{
    error::{PipelineError, PipelineResult},
    models::Segmenter,
    types::{CHANNELS, Frame, Mask},
};

#[derive(Clone)]
pub struct BackgroundRemover {
    segmenter: Arc<dyn Segmenter>,
}

impl BackgroundRemover {
    pub fn new(segmenter: Arc<dyn Segmenter>) -> Self {
        Self { segmenter }
    }

    /// Returns the frame with its background painted white, and the mask used.
    pub fn remove_background(&self, frame: &Frame, threshold: f32) -> PipelineResult<(Frame, Mask)> {
        let mask = self
            .segmenter
            .segment(frame, threshold)
            .map_err(|err| PipelineError::inference("segmentation", err))?;

        if !mask.matches(frame) {
            return Err(PipelineError::inference(
                "segmentation",
                anyhow!(
                    "mask is {}x{} but frame is {}x{}",
                    mask.width(),
                    mask.height(),
                    frame.width(),
                    frame.height()
                ),
            ));
        }

        let foreground = whiten_background(frame, &mask)?;
        Ok((foreground, mask))
    }
}

/// `frame * mask + 255 * (1 - mask)`, rounded per channel.
pub fn whiten_background(frame: &Frame, mask: &Mask) -> PipelineResult<Frame> {
    let mut data = frame.data().to_vec();
    data.par_chunks_exact_mut(CHANNELS)
        .zip(mask.data().par_iter())
        .for_each(|(px, weight)| {
            for value in px.iter_mut() {
                *value = blend(*value, 255, *weight);
            }
        });

    Frame::with_timestamp(data, frame.width(), frame.height(), frame.order(), frame.timestamp)
        .map_err(PipelineError::Other)
}

/// `a * weight + b * (1 - weight)` rounded and clamped to a byte.
pub(crate) fn blend(a: u8, b: u8, weight: f32) -> u8 {
    let value = a as f32 * weight + b as f32 * (1.0 - weight);
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelOrder;

    struct ConstantMask(f32);

    impl Segmenter for ConstantMask {
        fn segment(&self, frame: &Frame, _threshold: f32) -> anyhow::Result<Mask> {
            Ok(Mask::filled(frame.width(), frame.height(), self.0))
        }
    }

    struct WrongSize;

    impl Segmenter for WrongSize {
        fn segment(&self, frame: &Frame, _threshold: f32) -> anyhow::Result<Mask> {
            Ok(Mask::filled(frame.width() + 1, frame.height(), 1.0))
        }
    }

    fn gradient(width: u32, height: u32) -> Frame {
        let data = (0..width * height * 3).map(|v| (v % 200) as u8).collect();
        Frame::new(data, width, height, PixelOrder::Bgr).unwrap()
    }

    #[test]
    fn all_background_mask_turns_frame_white() {
        let remover = BackgroundRemover::new(Arc::new(ConstantMask(0.0)));
        let (foreground, mask) = remover.remove_background(&gradient(16, 9), 0.5).unwrap();
        assert!(foreground.data().iter().all(|v| *v == 255));
        assert!(mask.matches(&foreground));
    }

    #[test]
    fn all_foreground_mask_keeps_frame() {
        let frame = gradient(16, 9);
        let remover = BackgroundRemover::new(Arc::new(ConstantMask(1.0)));
        let (foreground, _) = remover.remove_background(&frame, 0.5).unwrap();
        assert_eq!(foreground.data(), frame.data());
    }

    #[test]
    fn half_mask_rounds_blend() {
        // 100 * 0.5 + 255 * 0.5 = 177.5
        assert_eq!(blend(100, 255, 0.5), 178);
        assert_eq!(blend(0, 255, 1.0), 0);
    }

    #[test]
    fn mismatched_mask_is_inference_failure() {
        let remover = BackgroundRemover::new(Arc::new(WrongSize));
        let err = remover.remove_background(&gradient(4, 4), 0.5).unwrap_err();
        assert!(err.is_inference());
    }
}
