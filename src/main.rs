use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use image::GrayImage;
use tryon_stream::{
    Device, Frame, ImageOutcome, ModelPaths, PipelineConfig, PipelineSession, StreamErrorPolicy,
    models::ort::load_collaborators,
    pipeline::{FrameSource, VideoFileSink, VideoFileSource},
};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Try the garment on a single image.
    Image {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
    },
    /// Try the garment on every frame of a video file.
    Video {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
        /// Size of the recorded video as WIDTHxHEIGHT; defaults to the model size.
        #[arg(long = "output-size", value_name = "WxH", value_parser = parse_size)]
        output_size: Option<(u32, u32)>,
    },
    /// Write a multipart JPEG stream of try-on frames.
    Stream {
        #[command(flatten)]
        session: SessionArgs,
        /// Camera index to capture from.
        #[arg(long = "camera", value_name = "INDEX", conflicts_with = "video")]
        camera: Option<u32>,
        /// Video file to stream instead of a camera.
        #[arg(long = "video", value_name = "PATH")]
        video: Option<PathBuf>,
        /// Destination of the byte stream; stdout when omitted.
        #[arg(long = "output", short = 'o', value_name = "PATH")]
        output: Option<PathBuf>,
        /// Stop after this many frames.
        #[arg(long = "frames", value_name = "N")]
        frames: Option<u64>,
        #[arg(long = "capture-fps", value_name = "FPS", default_value_t = tryon_stream::config::DEFAULT_CAPTURE_FPS)]
        capture_fps: u32,
        /// Keep streaming after a frame fails instead of stopping.
        #[arg(long = "skip-errors", action = clap::ArgAction::SetTrue)]
        skip_errors: bool,
    },
    /// List the cameras that can be streamed from.
    Cameras,
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Garment reference image.
    #[arg(long = "garment", value_name = "PATH")]
    garment: PathBuf,
    /// Optional garment silhouette; predicted from the garment when omitted.
    #[arg(long = "silhouette", value_name = "PATH")]
    silhouette: Option<PathBuf>,
    /// Directory holding the ONNX models.
    #[arg(long = "models", value_name = "DIR", default_value = "models")]
    models: PathBuf,
    #[arg(long = "device", value_name = "DEVICE", default_value = "cpu")]
    device: Device,
    /// Foreground probability above which a pixel counts as the subject.
    #[arg(long = "threshold", value_name = "P", default_value_t = tryon_stream::config::DEFAULT_THRESHOLD)]
    threshold: f32,
    /// Model input size as WIDTHxHEIGHT.
    #[arg(long = "size", value_name = "WxH", value_parser = parse_size, default_value = "192x256")]
    size: (u32, u32),
    #[arg(long = "fps", value_name = "FPS", default_value_t = tryon_stream::config::DEFAULT_OUTPUT_FPS)]
    fps: u32,
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = tryon_stream::config::DEFAULT_JPEG_QUALITY)]
    jpeg_quality: u8,
}

impl SessionArgs {
    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            target_size: self.size,
            threshold: self.threshold,
            output_fps: self.fps,
            jpeg_quality: self.jpeg_quality,
            device: self.device,
            ..PipelineConfig::default()
        }
    }

    fn build(&self, config: PipelineConfig) -> Result<PipelineSession> {
        // Validate before paying for model loading.
        config.validate()?;

        let garment = load_rgb(&self.garment)?;
        let silhouette = self.silhouette.as_deref().map(load_gray).transpose()?;
        let collaborators = load_collaborators(&ModelPaths::in_dir(&self.models), config.device)
            .context("failed to load models")?;

        Ok(PipelineSession::new(
            config,
            collaborators,
            &garment,
            silhouette.as_ref(),
        )?)
    }
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value:?}"))?;
    let width = w.trim().parse().map_err(|_| format!("invalid width {w:?}"))?;
    let height = h.trim().parse().map_err(|_| format!("invalid height {h:?}"))?;
    Ok((width, height))
}

fn load_rgb(path: &Path) -> Result<Frame> {
    let image = image::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Frame::from_rgb_image(image.to_rgb8()))
}

fn load_gray(path: &Path) -> Result<GrayImage> {
    let image = image::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(image.to_luma8())
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Image {
            session,
            input,
            output,
        } => run_image(&session, &input, &output),
        Command::Video {
            session,
            input,
            output,
            output_size,
        } => {
            let config = PipelineConfig {
                output_size,
                ..session.config()
            };
            run_video(&session, config, &input, &output)
        }
        Command::Stream {
            session,
            camera,
            video,
            output,
            frames,
            capture_fps,
            skip_errors,
        } => {
            let config = PipelineConfig {
                capture_fps,
                stream_error_policy: if skip_errors {
                    StreamErrorPolicy::SkipFrame
                } else {
                    StreamErrorPolicy::Abort
                },
                ..session.config()
            };
            let pipeline = session.build(config)?;
            let source = open_stream_source(camera, video.as_deref())?;
            let sink: Box<dyn Write> = match output {
                Some(path) => Box::new(BufWriter::new(
                    File::create(&path)
                        .with_context(|| format!("failed to create {}", path.display()))?,
                )),
                None => Box::new(io::stdout().lock()),
            };
            run_stream(&pipeline, source, sink, frames)
        }
        Command::Cameras => list_cameras(),
    }
}

fn run_image(args: &SessionArgs, input: &Path, output: &Path) -> Result<()> {
    let session = args.build(args.config())?;
    let image = load_rgb(input)?;

    let result = match session.tryon_image(image)? {
        ImageOutcome::Composited(frame) => frame,
        ImageOutcome::PassThrough(frame) => {
            log::warn!("no body found in {}, saving it unchanged", input.display());
            frame
        }
    };

    result
        .into_rgb_image()?
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    log::info!("wrote {}", output.display());
    Ok(())
}

fn run_video(args: &SessionArgs, config: PipelineConfig, input: &Path, output: &Path) -> Result<()> {
    let mut sink = VideoFileSink::new(output, config.output_fps, config.output_size());
    let session = args.build(config)?;
    let source = VideoFileSource::open(input)?;
    session.tryon_video(source, &mut sink)?;
    Ok(())
}

fn open_stream_source(camera: Option<u32>, video: Option<&Path>) -> Result<Box<dyn FrameSource>> {
    if let Some(path) = video {
        return Ok(Box::new(VideoFileSource::open(path)?));
    }
    open_camera(camera.unwrap_or(0))
}

#[cfg(feature = "camera-nokhwa")]
fn open_camera(index: u32) -> Result<Box<dyn FrameSource>> {
    use nokhwa::utils::CameraIndex;
    use tryon_stream::pipeline::CameraSource;

    Ok(Box::new(CameraSource::open(CameraIndex::Index(index))?))
}

#[cfg(not(feature = "camera-nokhwa"))]
fn open_camera(index: u32) -> Result<Box<dyn FrameSource>> {
    anyhow::bail!("camera {index} unavailable: built without the camera-nokhwa feature")
}

fn run_stream(
    session: &PipelineSession,
    source: Box<dyn FrameSource>,
    mut sink: Box<dyn Write>,
    limit: Option<u64>,
) -> Result<()> {
    let skip_failed = session.config().stream_error_policy == StreamErrorPolicy::SkipFrame;
    let mut stream = session.live_stream(source);
    let closer = stream.closer();
    let mut written = 0u64;

    for chunk in stream.by_ref() {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) if skip_failed && err.is_inference() => continue,
            Err(err) => return Err(err.into()),
        };

        sink.write_all(&chunk).context("failed to write stream chunk")?;
        sink.flush().context("failed to flush stream")?;
        written += 1;
        if limit.is_some_and(|limit| written >= limit) {
            closer.close();
        }
    }

    log::info!("streamed {written} frames");
    Ok(())
}

#[cfg(feature = "camera-nokhwa")]
fn list_cameras() -> Result<()> {
    let cameras = tryon_stream::pipeline::available_cameras()?;
    if cameras.is_empty() {
        println!("no cameras found");
    }
    for camera in cameras {
        println!("{}\t{}", camera.index, camera.label);
    }
    Ok(())
}

#[cfg(not(feature = "camera-nokhwa"))]
fn list_cameras() -> Result<()> {
    anyhow::bail!("built without the camera-nokhwa feature")
}
