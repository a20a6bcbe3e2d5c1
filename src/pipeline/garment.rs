use image::GrayImage;

use super::resize::{Interpolation, ResizeTransform};
use crate::{
    error::{PipelineError, PipelineResult},
    types::{Frame, Mask, PixelOrder},
};

/// Brings garment references to the model input size. Built once per session.
#[derive(Clone, Debug)]
pub struct GarmentPreprocessor {
    image: ResizeTransform,
    silhouette: ResizeTransform,
}

impl GarmentPreprocessor {
    pub fn new(target_size: (u32, u32)) -> Self {
        Self {
            image: ResizeTransform::new(target_size, Interpolation::Bilinear),
            silhouette: ResizeTransform::new(target_size, Interpolation::Nearest),
        }
    }

    pub fn normalize_image(&self, garment: &Frame) -> PipelineResult<Frame> {
        let rgb = garment.clone().into_order(PixelOrder::Rgb);
        self.image.apply(&rgb).map_err(PipelineError::Other)
    }

    /// Nearest-neighbor resize; values are only rescaled from bytes to `[0, 1]`.
    pub fn normalize_silhouette(&self, silhouette: &GrayImage) -> PipelineResult<Mask> {
        let (width, height) = silhouette.dimensions();
        self.silhouette
            .apply_luma(silhouette.as_raw(), width, height)
            .map_err(PipelineError::Other)
    }
}
