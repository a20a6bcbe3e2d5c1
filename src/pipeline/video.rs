use std::{
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use anyhow::{Context, Result, anyhow};

use super::source::{Capture, FrameSource};
use crate::{
    error::CaptureError,
    types::{CHANNELS, Frame, PixelOrder},
};

/// Destination for composited frames, written in arrival order.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flushes and closes the sink. Called once after the last frame.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FrameSink for Vec<Frame> {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.push(frame.clone());
        Ok(())
    }
}

/// Width and height of the first video stream, via `ffprobe`.
pub fn probe_dimensions(path: &Path) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height")
        .arg("-of")
        .arg("csv=p=0:s=x")
        .arg(path)
        .output()
        .context("failed to run ffprobe")?;

    if !output.status.success() {
        return Err(anyhow!(
            "ffprobe failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    parse_dimensions(&String::from_utf8_lossy(&output.stdout))
}

fn parse_dimensions(text: &str) -> Result<(u32, u32)> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("ffprobe reported no video stream"))?;
    let (w, h) = line
        .split_once('x')
        .ok_or_else(|| anyhow!("unexpected ffprobe output {line:?}"))?;
    let width: u32 = w.trim().parse().context("invalid video width")?;
    let height: u32 = h.trim().parse().context("invalid video height")?;
    if width == 0 || height == 0 {
        return Err(anyhow!("video reports empty frame size {width}x{height}"));
    }
    Ok((width, height))
}

/// Decodes a video file through an `ffmpeg` child process, one raw RGB frame per
/// capture. End of file, and any failed read, closes the source.
pub struct VideoFileSource {
    uri: String,
    child: Child,
    stdout: Option<ChildStdout>,
    width: u32,
    height: u32,
    frames_read: u64,
}

impl VideoFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let uri = path.display().to_string();
        let open_err = |source: anyhow::Error| CaptureError::Open {
            uri: uri.clone(),
            source,
        };

        let (width, height) = probe_dimensions(path).map_err(open_err)?;

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(path)
            .arg("-an")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|err| open_err(anyhow!(err).context("failed to spawn ffmpeg")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| open_err(anyhow!("failed to capture ffmpeg stdout")))?;

        log::info!("decoding {uri} at {width}x{height}");
        Ok(Self {
            uri,
            child,
            stdout: Some(stdout),
            width,
            height,
            frames_read: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) {
        if self.stdout.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
            log::info!("{} closed after {} frames", self.uri, self.frames_read);
        }
    }
}

impl FrameSource for VideoFileSource {
    fn capture(&mut self) -> Result<Capture, CaptureError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(Capture::Closed);
        };

        let mut buffer = vec![0u8; self.width as usize * self.height as usize * CHANNELS];
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(err) => {
                if err.kind() != ErrorKind::UnexpectedEof {
                    log::warn!("read from {} failed, ending stream: {err}", self.uri);
                }
                self.close();
                return Ok(Capture::Closed);
            }
        }

        self.frames_read += 1;
        let frame = Frame::new(buffer, self.width, self.height, PixelOrder::Rgb)?;
        Ok(Capture::Frame(frame))
    }
}

impl Drop for VideoFileSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Encodes frames into a video container through an `ffmpeg` child process.
///
/// The encoder starts on the first frame, whose size fixes the input geometry;
/// output is scaled to `output_size`.
pub struct VideoFileSink {
    path: PathBuf,
    fps: u32,
    output_size: (u32, u32),
    encoder: Option<Encoder>,
    frames_written: u64,
}

struct Encoder {
    child: Child,
    stdin: Option<ChildStdin>,
    input_size: (u32, u32),
    order: PixelOrder,
}

impl VideoFileSink {
    pub fn new(path: impl Into<PathBuf>, fps: u32, output_size: (u32, u32)) -> Self {
        Self {
            path: path.into(),
            fps,
            output_size,
            encoder: None,
            frames_written: 0,
        }
    }

    fn spawn_encoder(&self, frame: &Frame) -> Result<Encoder> {
        let pix_fmt = match frame.order() {
            PixelOrder::Rgb => "rgb24",
            PixelOrder::Bgr => "bgr24",
        };
        let (out_w, out_h) = self.output_size;

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg(pix_fmt)
            .arg("-s")
            .arg(format!("{}x{}", frame.width(), frame.height()))
            .arg("-r")
            .arg(self.fps.to_string())
            .arg("-i")
            .arg("-")
            .arg("-vf")
            .arg(format!("scale={out_w}:{out_h}"))
            .arg("-c:v")
            .arg("mpeg4")
            .arg("-q:v")
            .arg("3")
            .arg(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().context("failed to spawn ffmpeg encoder")?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;

        log::info!(
            "recording {} at {} fps, {out_w}x{out_h}",
            self.path.display(),
            self.fps
        );
        Ok(Encoder {
            child,
            stdin: Some(stdin),
            input_size: (frame.width(), frame.height()),
            order: frame.order(),
        })
    }
}

impl FrameSink for VideoFileSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.encoder.is_none() {
            self.encoder = Some(self.spawn_encoder(frame)?);
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| anyhow!("encoder unavailable"))?;

        if encoder.input_size != (frame.width(), frame.height()) {
            return Err(anyhow!(
                "frame size changed mid-recording: {}x{} vs {}x{}",
                frame.width(),
                frame.height(),
                encoder.input_size.0,
                encoder.input_size.1
            ));
        }

        let frame = frame.clone().into_order(encoder.order);
        encoder
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder already finished"))?
            .write_all(frame.data())
            .context("failed to write frame to ffmpeg")?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut encoder) = self.encoder.take() else {
            log::warn!("no frames written to {}", self.path.display());
            return Ok(());
        };

        drop(encoder.stdin.take());
        let status = encoder.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            return Err(anyhow!("ffmpeg encoder exited with {status}"));
        }
        log::info!(
            "wrote {} frames to {}",
            self.frames_written,
            self.path.display()
        );
        Ok(())
    }
}

impl Drop for VideoFileSink {
    fn drop(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            drop(encoder.stdin.take());
            let _ = encoder.child.wait();
        }
    }
}
