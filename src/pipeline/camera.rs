use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{
        ApiBackend, CameraIndex, CameraInfo, FrameFormat, RequestedFormat, RequestedFormatType,
    },
};

use super::{
    rgb_converter,
    source::{Capture, FrameSource},
};
use crate::{error::CaptureError, types::Frame};

// Prefer pixel formats that are widely supported on macOS (the built-in cameras
// often reject YUYV even though Nokhwa reports it).
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

fn requested_formats() -> [RequestedFormat<'static>; 4] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestResolution,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: CameraIndex,
    pub label: String,
}

pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    let cameras = query(ApiBackend::Auto)?;
    Ok(cameras
        .into_iter()
        .map(|info| CameraDevice {
            index: info.index().clone(),
            label: format_camera_label(&info),
        })
        .collect())
}

fn format_camera_label(info: &CameraInfo) -> String {
    format!("{} ({})", info.human_name(), info.index())
}

fn build_camera(index: CameraIndex) -> Result<Camera> {
    let mut last_err = None;

    for requested in requested_formats() {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
}

/// Live camera as a [`FrameSource`].
///
/// A capture thread decodes every camera frame and keeps only the newest one;
/// `capture` never blocks and reports [`Capture::Pending`] until a fresh frame
/// has arrived.
#[derive(Debug)]
pub struct CameraSource {
    frames: Receiver<Frame>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CameraSource {
    pub fn open(index: CameraIndex) -> Result<Self, CaptureError> {
        let uri = index.to_string();
        // Fail fast before spawning the capture thread.
        build_camera(index.clone()).map_err(|source| CaptureError::Open {
            uri: uri.clone(),
            source,
        })?;

        let (frame_tx, frame_rx) = bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let stale_rx = frame_rx.clone();

        let handle = thread::spawn(move || {
            let mut camera = match build_camera(index) {
                Ok(cam) => cam,
                Err(err) => {
                    log::error!("failed to open camera {uri}: {err:?}");
                    return;
                }
            };
            log::info!("camera {uri} streaming as {:?}", camera.camera_format());

            while !stop_flag.load(Ordering::Relaxed) {
                let read_start = Instant::now();
                let buffer = match camera.frame() {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        log::warn!(
                            "camera frame read failed (after {:?}): {err:?}",
                            read_start.elapsed()
                        );
                        continue;
                    }
                };

                let frame = match rgb_converter::convert_camera_frame(&buffer) {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("failed to decode camera frame {err:?}");
                        continue;
                    }
                };

                publish_latest(&frame_tx, &stale_rx, frame);
            }

            if let Err(err) = camera.stop_stream() {
                log::warn!("failed to stop camera {uri}: {err:?}");
            }
        });

        Ok(Self {
            frames: frame_rx,
            stop,
            handle: Some(handle),
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Hands `frame` over, evicting a frame the consumer has not picked up yet.
/// The capture thread ends through the stop flag, never through the channel.
fn publish_latest(tx: &Sender<Frame>, stale: &Receiver<Frame>, frame: Frame) {
    if let Err(TrySendError::Full(frame)) = tx.try_send(frame) {
        let _ = stale.try_recv();
        let _ = tx.try_send(frame);
    }
}

impl FrameSource for CameraSource {
    fn capture(&mut self) -> Result<Capture, CaptureError> {
        match self.frames.try_recv() {
            Ok(frame) => Ok(Capture::Frame(frame)),
            Err(TryRecvError::Empty) => Ok(Capture::Pending),
            Err(TryRecvError::Disconnected) => Ok(Capture::Closed),
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}
