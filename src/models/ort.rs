use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result, anyhow};
use ort::session::{
    Session,
    builder::{GraphOptimizationLevel, SessionBuilder},
};
use ort::value::Tensor;

use super::{
    Collaborators, EdgePredictor, ModelPaths, NormalizedImage, PoseEstimator, RawMap, Segmenter,
    WarpingModel,
    common::{
        decode_landmarks, frame_to_nchw, mask_to_nchw, nchw_to_interleaved, prepare_letterboxed,
        prepare_stretched, project_landmarks, sigmoid,
    },
};
use crate::{
    config::Device,
    error::{PipelineError, PipelineResult},
    pipeline::resize::{Interpolation, resize_luma},
    types::{Frame, Mask, PoseLandmarks},
};

const POSE_INPUT_SIZE: u32 = 256;
const POSE_LANDMARKS: usize = 33;
const POSE_LANDMARK_STRIDE: usize = 5;
const POSE_PRESENCE_THRESHOLD: f32 = 0.5;
const SEGMENTATION_INPUT_SIZE: u32 = 256;

/// Loads all four ONNX collaborators onto `device`.
pub fn load_collaborators(paths: &ModelPaths, device: Device) -> PipelineResult<Collaborators> {
    check_device(device)?;

    let pose = OrtPoseEstimator::new(&paths.pose, device)?;
    let segmenter = OrtSegmenter::new(&paths.segmentation, device)?;
    let edge = OrtEdgePredictor::new(&paths.edge, device)?;
    let warp = OrtWarpingModel::new(&paths.tryon, device)?;
    log::info!("ONNX collaborators ready on {device} ({})", paths.tryon.display());

    Ok(Collaborators {
        pose: Arc::new(pose),
        segmenter: Arc::new(segmenter),
        edge: Arc::new(edge),
        warp: Arc::new(warp),
    })
}

fn check_device(device: Device) -> PipelineResult<()> {
    match device {
        Device::Cpu => Ok(()),
        Device::Cuda(_) if cfg!(feature = "cuda") => Ok(()),
        Device::Cuda(_) => Err(PipelineError::InvalidConfiguration(format!(
            "device {device} requested but this build lacks the `cuda` feature"
        ))),
    }
}

fn build_session(model_path: &Path, device: Device) -> Result<Session> {
    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(2)?;
    with_device(builder, device)?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ORT session from {}", model_path.display()))
}

#[cfg(feature = "cuda")]
fn with_device(builder: SessionBuilder, device: Device) -> Result<SessionBuilder> {
    use ort::execution_providers::CUDAExecutionProvider;

    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda(id) => Ok(builder.with_execution_providers([
            CUDAExecutionProvider::default().with_device_id(id).build(),
        ])?),
    }
}

#[cfg(not(feature = "cuda"))]
fn with_device(builder: SessionBuilder, device: Device) -> Result<SessionBuilder> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda(_) => Err(anyhow!("{device} unavailable without the `cuda` feature")),
    }
}

fn load(model_path: &Path, device: Device, stage: &'static str) -> PipelineResult<Mutex<Session>> {
    build_session(model_path, device)
        .map(Mutex::new)
        .map_err(|err| PipelineError::inference(stage, err))
}

fn lock<'a>(session: &'a Mutex<Session>, stage: &str) -> Result<MutexGuard<'a, Session>> {
    session
        .lock()
        .map_err(|_| anyhow!("{stage} session poisoned"))
}

/// Trailing `(height, width)` of an output shape.
fn spatial_dims(shape: &[usize]) -> Result<(usize, usize)> {
    match shape {
        [.., h, w] => Ok((*h, *w)),
        _ => Err(anyhow!("output shape {shape:?} has no spatial dimensions")),
    }
}

/// Full-frame pose landmark model; landmarks come back in letterboxed input pixels.
pub struct OrtPoseEstimator {
    session: Mutex<Session>,
}

impl OrtPoseEstimator {
    pub fn new(model_path: &Path, device: Device) -> PipelineResult<Self> {
        Ok(Self {
            session: load(model_path, device, "pose")?,
        })
    }
}

impl PoseEstimator for OrtPoseEstimator {
    fn locate(&self, frame: &Frame) -> Result<Option<PoseLandmarks>> {
        let (input, letterbox) = prepare_letterboxed(frame, POSE_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;

        let mut session = lock(&self.session, "pose")?;
        let outputs = session
            .run(ort::inputs![tensor])
            .context("failed to run pose session")?;
        if outputs.len() < 2 {
            return Err(anyhow!(
                "pose model returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let presence = outputs[1]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .ok_or_else(|| anyhow!("pose model returned an empty presence score"))?;
        let presence = if (0.0..=1.0).contains(&presence) {
            presence
        } else {
            sigmoid(presence)
        };
        if presence < POSE_PRESENCE_THRESHOLD {
            return Ok(None);
        }

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flattened: Vec<f32> = coords.iter().copied().collect();
        let landmarks = decode_landmarks(&flattened, POSE_LANDMARK_STRIDE, POSE_LANDMARKS)?;

        Ok(Some(PoseLandmarks {
            points: project_landmarks(&landmarks, &letterbox),
        }))
    }
}

/// Person segmentation model producing a foreground probability map.
pub struct OrtSegmenter {
    session: Mutex<Session>,
}

impl OrtSegmenter {
    pub fn new(model_path: &Path, device: Device) -> PipelineResult<Self> {
        Ok(Self {
            session: load(model_path, device, "segmentation")?,
        })
    }
}

impl Segmenter for OrtSegmenter {
    fn segment(&self, frame: &Frame, threshold: f32) -> Result<Mask> {
        let side = SEGMENTATION_INPUT_SIZE;
        let input = prepare_stretched(frame, side, side)?;
        let tensor = Tensor::from_array(input)?;

        let probabilities: Vec<u8> = {
            let mut session = lock(&self.session, "segmentation")?;
            let outputs = session
                .run(ort::inputs![tensor])
                .context("failed to run segmentation session")?;
            if outputs.len() < 1 {
                return Err(anyhow!("segmentation model returned no outputs"));
            }
            let scores = outputs[0].try_extract_array::<f32>()?;
            if scores.len() != (side * side) as usize {
                return Err(anyhow!(
                    "segmentation output shape {:?} does not hold a {side}x{side} map",
                    scores.shape()
                ));
            }
            if scores.iter().any(|v| !v.is_finite()) {
                return Err(anyhow!("segmentation output contains non-finite values"));
            }
            scores
                .iter()
                .map(|p| (p.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect()
        };

        let (width, height) = (frame.width(), frame.height());
        let resized = resize_luma(
            &probabilities,
            side,
            side,
            width,
            height,
            Interpolation::Bilinear,
        )?;
        let weights = resized
            .iter()
            .map(|v| if *v as f32 / 255.0 > threshold { 1.0 } else { 0.0 })
            .collect();
        Mask::new(weights, width, height)
    }
}

/// Garment silhouette predictor; output range is model specific.
pub struct OrtEdgePredictor {
    session: Mutex<Session>,
}

impl OrtEdgePredictor {
    pub fn new(model_path: &Path, device: Device) -> PipelineResult<Self> {
        Ok(Self {
            session: load(model_path, device, "edge")?,
        })
    }
}

impl EdgePredictor for OrtEdgePredictor {
    fn predict(&self, garment: &Frame) -> Result<RawMap> {
        let tensor = Tensor::from_array(frame_to_nchw(garment, true)?)?;

        let mut session = lock(&self.session, "edge")?;
        let outputs = session
            .run(ort::inputs![tensor])
            .context("failed to run edge session")?;
        if outputs.len() < 1 {
            return Err(anyhow!("edge model returned no outputs"));
        }

        let side_output = outputs[0].try_extract_array::<f32>()?;
        let (height, width) = spatial_dims(side_output.shape())?;
        // Only the first channel of the first side output is the fused prediction.
        let data: Vec<f32> = side_output.iter().copied().take(height * width).collect();
        if data.len() != height * width {
            return Err(anyhow!("edge output too short for {width}x{height}"));
        }

        Ok(RawMap {
            width: width as u32,
            height: height as u32,
            data,
        })
    }
}

/// Garment warping and synthesis model.
pub struct OrtWarpingModel {
    session: Mutex<Session>,
}

impl OrtWarpingModel {
    pub fn new(model_path: &Path, device: Device) -> PipelineResult<Self> {
        Ok(Self {
            session: load(model_path, device, "tryon")?,
        })
    }
}

impl WarpingModel for OrtWarpingModel {
    fn warp(&self, body: &Frame, garment: &Frame, garment_edge: &Mask) -> Result<NormalizedImage> {
        let body = Tensor::from_array(frame_to_nchw(body, true)?)?;
        let clothes = Tensor::from_array(frame_to_nchw(garment, true)?)?;
        let edge = Tensor::from_array(mask_to_nchw(garment_edge)?)?;

        let mut session = lock(&self.session, "tryon")?;
        let outputs = session
            .run(ort::inputs![body, clothes, edge])
            .context("failed to run tryon session")?;
        if outputs.len() < 1 {
            return Err(anyhow!("tryon model returned no outputs"));
        }

        let synthesized = outputs[0].try_extract_array::<f32>()?;
        let (height, width) = spatial_dims(synthesized.shape())?;
        let planar: Vec<f32> = synthesized.iter().copied().collect();
        let data = nchw_to_interleaved(&planar, width as u32, height as u32)?;

        Ok(NormalizedImage {
            width: width as u32,
            height: height as u32,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spatial_dims_reads_trailing_axes() {
        assert_eq!(spatial_dims(&[1, 3, 256, 192]).unwrap(), (256, 192));
        assert!(spatial_dims(&[7]).is_err());
    }

    #[test]
    fn cpu_is_always_available() {
        assert!(check_device(Device::Cpu).is_ok());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_requires_feature() {
        assert!(matches!(
            check_device(Device::Cuda(0)),
            Err(PipelineError::InvalidConfiguration(_))
        ));
    }
}
