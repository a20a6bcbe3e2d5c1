pub mod background;
#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod composer;
pub mod compositor;
pub mod crop;
pub mod encode;
pub mod garment;
pub mod locator;
pub mod resize;
#[cfg(feature = "camera-nokhwa")]
pub mod rgb_converter;
pub mod runner;
pub mod source;
pub mod video;

// Re-exports for convenience
pub use background::BackgroundRemover;
#[cfg(feature = "camera-nokhwa")]
pub use camera::{CameraDevice, CameraSource, available_cameras};
pub use composer::{BackgroundBlend, FrameComposer};
pub use compositor::TryonCompositor;
pub use crop::FrameCropper;
pub use encode::{MULTIPART_CONTENT_TYPE, encode_jpeg, multipart_chunk};
pub use garment::GarmentPreprocessor;
pub use locator::BodyLocator;
pub use runner::{ImageOutcome, LiveStream, PipelineSession, RunSummary};
pub use source::{
    Capture, Clock, FramePacer, FrameSource, ManualClock, MemorySource, SourceCloser, SystemClock,
    ThrottledSource,
};
pub use video::{FrameSink, VideoFileSink, VideoFileSource};
