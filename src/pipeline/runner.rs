use std::{iter::FusedIterator, sync::Arc, thread, time::Duration};

use image::GrayImage;

use super::{
    background::BackgroundRemover,
    composer::{BackgroundBlend, FrameComposer},
    compositor::TryonCompositor,
    crop::FrameCropper,
    encode::{encode_jpeg, multipart_chunk},
    locator::BodyLocator,
    source::{Capture, Clock, FrameSource, SourceCloser, SystemClock, ThrottledSource},
    video::FrameSink,
};
use crate::{
    config::{PipelineConfig, StreamErrorPolicy},
    error::{PipelineError, PipelineResult},
    models::Collaborators,
    types::{CropResult, Frame, GarmentSample},
};

/// Back-off between polls when a video source has nothing ready yet.
const VIDEO_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Result of running one frame through the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageOutcome {
    /// A body was found and the garment was composited onto it.
    Composited(Frame),
    /// No body was found; the input frame, unchanged.
    PassThrough(Frame),
}

impl ImageOutcome {
    pub fn is_composited(&self) -> bool {
        matches!(self, ImageOutcome::Composited(_))
    }

    pub fn frame(&self) -> &Frame {
        match self {
            ImageOutcome::Composited(frame) | ImageOutcome::PassThrough(frame) => frame,
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            ImageOutcome::Composited(frame) | ImageOutcome::PassThrough(frame) => frame,
        }
    }
}

/// Frame counts of a finished video run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub composited: u64,
    pub passed_through: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: &ImageOutcome) {
        self.frames += 1;
        if outcome.is_composited() {
            self.composited += 1;
        } else {
            self.passed_through += 1;
        }
    }
}

/// Everything needed to try one garment on a stream of frames.
///
/// The garment and the model handles are read-only and shared between clones,
/// so one session can be cloned per concurrent stream.
#[derive(Clone)]
pub struct PipelineSession {
    config: PipelineConfig,
    garment: Arc<GarmentSample>,
    locator: BodyLocator,
    cropper: FrameCropper,
    remover: BackgroundRemover,
    compositor: TryonCompositor,
    composer: FrameComposer,
}

impl PipelineSession {
    /// Validates `config`, then prepares the garment once for the whole session.
    pub fn new(
        config: PipelineConfig,
        collaborators: Collaborators,
        garment: &Frame,
        silhouette: Option<&GrayImage>,
    ) -> PipelineResult<Self> {
        config.validate()?;

        let compositor = TryonCompositor::new(
            collaborators.edge.clone(),
            collaborators.warp.clone(),
            config.target_size,
        );
        let sample = compositor.prepare_garment(garment, silhouette)?;
        log::info!(
            "session ready: target {}x{}, edge from {:?}",
            config.target_size.0,
            config.target_size.1,
            sample.edge_source
        );

        Ok(Self {
            garment: Arc::new(sample),
            locator: BodyLocator::new(collaborators.pose.clone()),
            cropper: FrameCropper::new(config.target_size),
            remover: BackgroundRemover::new(collaborators.segmenter.clone()),
            compositor,
            composer: FrameComposer::new(),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Locates the body, synthesizes the garment on it and pastes the result
    /// back. No background blend is applied.
    pub fn process_frame(&self, frame: Frame) -> PipelineResult<ImageOutcome> {
        let bounds = self.locator.locate(&frame)?;
        let crop = self.cropper.crop(frame, bounds)?;
        self.composite(crop, None)
    }

    /// Single-image try-on. The background is neutralized before locating the
    /// body, and the original frame is blended back in outside the foreground.
    pub fn tryon_image(&self, image: Frame) -> PipelineResult<ImageOutcome> {
        let (foreground, mask) = self.remover.remove_background(&image, self.config.threshold)?;

        let bounds = self.locator.locate(&foreground)?;
        let crop = self.cropper.crop(foreground, bounds)?;
        if !crop.is_found() {
            log::debug!("no body found in image, returning it unchanged");
            return Ok(ImageOutcome::PassThrough(image));
        }

        self.composite(
            crop,
            Some(BackgroundBlend {
                mask: &mask,
                backdrop: &image,
            }),
        )
    }

    /// Runs every frame of `source` into `sink` in arrival order until the
    /// source closes. The first failing frame aborts the run.
    pub fn tryon_video<S, K>(&self, mut source: S, sink: &mut K) -> PipelineResult<RunSummary>
    where
        S: FrameSource,
        K: FrameSink + ?Sized,
    {
        let mut summary = RunSummary::default();
        loop {
            match source.capture()? {
                Capture::Frame(frame) => {
                    let outcome = self.process_frame(frame)?;
                    summary.record(&outcome);
                    sink.write_frame(outcome.frame())?;
                }
                Capture::Pending => thread::sleep(VIDEO_POLL_INTERVAL),
                Capture::Closed => break,
            }
        }
        sink.finish()?;

        log::info!(
            "video run finished: {} frames, {} composited, {} passed through",
            summary.frames,
            summary.composited,
            summary.passed_through
        );
        Ok(summary)
    }

    /// Wraps `source` in a throttle at `capture_fps` and returns the lazy
    /// multipart JPEG stream over it.
    pub fn live_stream<S: FrameSource>(&self, source: S) -> LiveStream<S> {
        self.live_stream_with_clock(source, SystemClock)
    }

    pub fn live_stream_with_clock<S: FrameSource, C: Clock>(
        &self,
        source: S,
        clock: C,
    ) -> LiveStream<S, C> {
        let source = ThrottledSource::with_clock(source, self.config.capture_fps, clock);
        log::info!("live stream started at {} fps", self.config.capture_fps);
        LiveStream {
            session: self.clone(),
            source,
            finished: false,
            frames: 0,
        }
    }

    fn composite(
        &self,
        crop: CropResult,
        blend_with: Option<BackgroundBlend<'_>>,
    ) -> PipelineResult<ImageOutcome> {
        let CropResult {
            origin_frame,
            cropped_frame,
            region,
        } = crop;
        let Some(body) = cropped_frame else {
            return Ok(ImageOutcome::PassThrough(origin_frame));
        };

        let synthesized = self.compositor.synthesize(&body, &self.garment)?;
        let composed = self
            .composer
            .compose(origin_frame, &synthesized, region, blend_with)?;
        Ok(ImageOutcome::Composited(composed))
    }
}

/// Pull-based stream of multipart JPEG chunks.
///
/// Nothing runs ahead of the consumer: each `next` call captures, processes and
/// encodes at most one frame. When the throttle has no frame ready the call
/// waits at most one tick and polls again, so closing the source ends the
/// iterator within one tick.
pub struct LiveStream<S, C = SystemClock> {
    session: PipelineSession,
    source: ThrottledSource<S, C>,
    finished: bool,
    frames: u64,
}

impl<S: FrameSource, C: Clock> LiveStream<S, C> {
    /// Switch that ends the stream from any thread.
    pub fn closer(&self) -> SourceCloser {
        self.source.closer()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames
    }

    fn encode(&self, frame: Frame) -> PipelineResult<Vec<u8>> {
        let outcome = self.session.process_frame(frame)?;
        let jpeg = encode_jpeg(outcome.frame(), self.session.config.jpeg_quality)
            .map_err(PipelineError::Encode)?;
        Ok(multipart_chunk(&jpeg))
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.source.closer().close();
            log::info!("live stream ended after {} frames", self.frames);
        }
    }
}

impl<S: FrameSource, C: Clock> Iterator for LiveStream<S, C> {
    type Item = PipelineResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            match self.source.capture() {
                Ok(Capture::Frame(frame)) => {
                    return match self.encode(frame) {
                        Ok(chunk) => {
                            self.frames += 1;
                            Some(Ok(chunk))
                        }
                        Err(err) => {
                            match self.session.config.stream_error_policy {
                                StreamErrorPolicy::Abort => {
                                    log::error!("live stream aborted: {err}");
                                    self.finish();
                                }
                                StreamErrorPolicy::SkipFrame => {
                                    log::warn!("skipping frame: {err}");
                                }
                            }
                            Some(Err(err))
                        }
                    };
                }
                Ok(Capture::Pending) => {
                    let tick = self.source.interval();
                    self.source.wait(tick);
                }
                Ok(Capture::Closed) => self.finish(),
                Err(err) => {
                    log::error!("capture failed: {err}");
                    self.finish();
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

impl<S: FrameSource, C: Clock> FusedIterator for LiveStream<S, C> {}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};

    use super::*;
    use crate::{
        models::{EdgePredictor, NormalizedImage, PoseEstimator, RawMap, Segmenter, WarpingModel},
        pipeline::source::{ManualClock, MemorySource},
        types::{Mask, PixelOrder, PoseLandmarks},
    };

    struct NoPose;
    impl PoseEstimator for NoPose {
        fn locate(&self, _frame: &Frame) -> Result<Option<PoseLandmarks>> {
            Ok(None)
        }
    }

    struct FullMask;
    impl Segmenter for FullMask {
        fn segment(&self, frame: &Frame, _threshold: f32) -> Result<Mask> {
            Ok(Mask::filled(frame.width(), frame.height(), 1.0))
        }
    }

    struct FlatEdge;
    impl EdgePredictor for FlatEdge {
        fn predict(&self, garment: &Frame) -> Result<RawMap> {
            Ok(RawMap {
                width: garment.width(),
                height: garment.height(),
                data: vec![0.0; (garment.width() * garment.height()) as usize],
            })
        }
    }

    struct FailingWarp;
    impl WarpingModel for FailingWarp {
        fn warp(&self, _body: &Frame, _garment: &Frame, _edge: &Mask) -> Result<NormalizedImage> {
            Err(anyhow!("warp unavailable"))
        }
    }

    fn session(config: PipelineConfig) -> PipelineResult<PipelineSession> {
        let collaborators = Collaborators {
            pose: Arc::new(NoPose),
            segmenter: Arc::new(FullMask),
            edge: Arc::new(FlatEdge),
            warp: Arc::new(FailingWarp),
        };
        let garment = Frame::filled(10, 10, PixelOrder::Rgb, [0, 0, 255]);
        PipelineSession::new(config, collaborators, &garment, None)
    }

    #[test]
    fn zero_target_size_is_rejected_at_construction() {
        let config = PipelineConfig {
            target_size: (0, 256),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            session(config),
            Err(PipelineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn undetected_image_passes_through() {
        let session = session(PipelineConfig::default()).unwrap();
        let image = Frame::filled(32, 24, PixelOrder::Bgr, [1, 2, 3]);
        let outcome = session.tryon_image(image.clone()).unwrap();
        assert_eq!(outcome, ImageOutcome::PassThrough(image));
    }

    #[test]
    fn summary_counts_pass_through_frames() {
        let session = session(PipelineConfig::default()).unwrap();
        let frames = (0..3).map(|v| Frame::filled(8, 8, PixelOrder::Rgb, [v; 3]));
        let mut sink: Vec<Frame> = Vec::new();

        let summary = session
            .tryon_video(MemorySource::new(frames), &mut sink)
            .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                frames: 3,
                composited: 0,
                passed_through: 3
            }
        );
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn stream_is_fused_after_source_closes() {
        let session = session(PipelineConfig::default()).unwrap();
        let frames = vec![Frame::filled(8, 8, PixelOrder::Rgb, [7; 3])];
        let mut stream =
            session.live_stream_with_clock(MemorySource::new(frames), ManualClock::new());

        let chunk = stream.next().unwrap().unwrap();
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
        assert_eq!(stream.frames_emitted(), 1);
    }
}
