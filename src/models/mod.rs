//! Seams to the inference collaborators the pipeline drives.
//!
//! The pipeline only depends on the traits below. `ort` provides ONNX Runtime
//! backed implementations; tests plug in deterministic fakes.

mod common;
pub mod ort;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Result, anyhow};

use crate::types::{Frame, Mask, PoseLandmarks};

pub use self::ort::{OrtEdgePredictor, OrtPoseEstimator, OrtSegmenter, OrtWarpingModel};

/// Locates body keypoints. Returns `None` when no person is visible.
pub trait PoseEstimator: Send + Sync {
    fn locate(&self, frame: &Frame) -> Result<Option<PoseLandmarks>>;
}

/// Predicts per-pixel foreground probability, binarized at `threshold`.
pub trait Segmenter: Send + Sync {
    fn segment(&self, frame: &Frame, threshold: f32) -> Result<Mask>;
}

/// Predicts a garment silhouette from an RGB garment image.
pub trait EdgePredictor: Send + Sync {
    fn predict(&self, garment: &Frame) -> Result<RawMap>;
}

/// Synthesizes the garment fitted onto an RGB body crop.
pub trait WarpingModel: Send + Sync {
    fn warp(&self, body: &Frame, garment: &Frame, garment_edge: &Mask) -> Result<NormalizedImage>;
}

/// Single-channel model output in an arbitrary numeric range.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

/// Interleaved RGB model output with values in `[-1, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl NormalizedImage {
    /// Checks the image is `width x height` RGB and holds only finite values.
    pub fn validate(&self, width: u32, height: u32) -> Result<()> {
        if (self.width, self.height) != (width, height) {
            return Err(anyhow!(
                "expected {width}x{height} output, got {}x{}",
                self.width,
                self.height
            ));
        }
        let expected_len = width as usize * height as usize * 3;
        if self.data.len() != expected_len {
            return Err(anyhow!(
                "output holds {} values, expected {expected_len}",
                self.data.len()
            ));
        }
        if self.data.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("output contains non-finite values"));
        }
        Ok(())
    }
}

/// Every external model a session needs, shared read-only between sessions.
#[derive(Clone)]
pub struct Collaborators {
    pub pose: Arc<dyn PoseEstimator>,
    pub segmenter: Arc<dyn Segmenter>,
    pub edge: Arc<dyn EdgePredictor>,
    pub warp: Arc<dyn WarpingModel>,
}

#[derive(Clone, Debug)]
pub struct ModelPaths {
    pub pose: PathBuf,
    pub segmentation: PathBuf,
    pub edge: PathBuf,
    pub tryon: PathBuf,
}

const POSE_MODEL_FILENAME: &str = "pose_landmark_full.onnx";
const SEGMENTATION_MODEL_FILENAME: &str = "selfie_segmentation.onnx";
const EDGE_MODEL_FILENAME: &str = "u2netp_edge.onnx";
const TRYON_MODEL_FILENAME: &str = "dmvton_tryon.onnx";

impl Default for ModelPaths {
    fn default() -> Self {
        Self::in_dir("models")
    }
}

impl ModelPaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            pose: dir.join(POSE_MODEL_FILENAME),
            segmentation: dir.join(SEGMENTATION_MODEL_FILENAME),
            edge: dir.join(EDGE_MODEL_FILENAME),
            tryon: dir.join(TRYON_MODEL_FILENAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_image_validation() {
        let ok = NormalizedImage {
            width: 2,
            height: 1,
            data: vec![0.0; 6],
        };
        assert!(ok.validate(2, 1).is_ok());
        assert!(ok.validate(1, 2).is_err());

        let nan = NormalizedImage {
            data: vec![0.0, 0.0, f32::NAN, 0.0, 0.0, 0.0],
            ..ok.clone()
        };
        assert!(nan.validate(2, 1).is_err());

        let short = NormalizedImage {
            data: vec![0.0; 5],
            ..ok
        };
        assert!(short.validate(2, 1).is_err());
    }

    #[test]
    fn model_paths_live_in_directory() {
        let paths = ModelPaths::in_dir("/opt/tryon");
        assert!(paths.tryon.starts_with("/opt/tryon"));
        assert_eq!(
            ModelPaths::default().pose,
            PathBuf::from("models").join(POSE_MODEL_FILENAME)
        );
    }
}
