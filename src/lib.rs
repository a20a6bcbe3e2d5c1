pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod types;

pub use config::{Device, PipelineConfig, StreamErrorPolicy};
pub use error::{CaptureError, PipelineError, PipelineResult};
pub use models::{Collaborators, ModelPaths};
pub use pipeline::{ImageOutcome, LiveStream, PipelineSession, RunSummary};
pub use types::{CropRegion, CropResult, Frame, GarmentSample, Mask, PixelOrder, PoseLandmarks};
