use std::sync::Arc;

use super::crop::upper_body_bounds;
use crate::{
    error::{PipelineError, PipelineResult},
    models::PoseEstimator,
    types::{CropRegion, Frame},
};

/// Turns pose estimator output into the padded upper-body box of a frame.
#[derive(Clone)]
pub struct BodyLocator {
    estimator: Arc<dyn PoseEstimator>,
}

impl BodyLocator {
    pub fn new(estimator: Arc<dyn PoseEstimator>) -> Self {
        Self { estimator }
    }

    /// `Ok(None)` when nobody is in frame. Malformed landmark sets are errors.
    pub fn locate(&self, frame: &Frame) -> PipelineResult<Option<CropRegion>> {
        let landmarks = self
            .estimator
            .locate(frame)
            .map_err(|err| PipelineError::inference("pose", err))?;

        let Some(landmarks) = landmarks else {
            log::debug!("no pose detected in {}x{} frame", frame.width(), frame.height());
            return Ok(None);
        };

        upper_body_bounds(&landmarks, frame.width(), frame.height())
            .map(Some)
            .map_err(|err| PipelineError::inference("pose", err))
    }
}
