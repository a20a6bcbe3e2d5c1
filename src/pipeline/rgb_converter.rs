use std::convert::TryFrom;

use anyhow::{Result, anyhow};
use nokhwa::{Buffer, utils::FrameFormat};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgb, yuyv422_to_rgb,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::{CHANNELS, Frame, PixelOrder};

/// Decodes a camera buffer into a 3-channel frame. Raw BGR buffers keep their
/// order; everything else comes out as RGB.
pub fn convert_camera_frame(buffer: &Buffer) -> Result<Frame> {
    let resolution = buffer.resolution();
    let width = resolution.width_x;
    let height = resolution.height_y;
    let data = buffer.buffer();

    let (pixels, width, height, order) = match buffer.source_frame_format() {
        FrameFormat::NV12 => (nv12_to_rgb(data, width, height)?, width, height, PixelOrder::Rgb),
        FrameFormat::YUYV => (yuyv_to_rgb(data, width, height)?, width, height, PixelOrder::Rgb),
        FrameFormat::MJPEG => {
            let (pixels, w, h) = mjpeg_to_rgb(data)?;
            (pixels, w, h, PixelOrder::Rgb)
        }
        FrameFormat::RAWRGB => (packed_rgb(data, width, height)?, width, height, PixelOrder::Rgb),
        FrameFormat::RAWBGR => (packed_rgb(data, width, height)?, width, height, PixelOrder::Bgr),
        FrameFormat::GRAY => (gray_to_rgb(data, width, height)?, width, height, PixelOrder::Rgb),
    };

    Frame::new(pixels, width, height, order)
}

fn nv12_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_plane_len = width as usize * height as usize;
    let uv_plane_len = y_plane_len / 2;

    if data.len() < y_plane_len + uv_plane_len {
        return Err(anyhow!(
            "NV12 buffer too small: got {}, expected {}",
            data.len(),
            y_plane_len + uv_plane_len
        ));
    }

    let image = YuvBiPlanarImage {
        y_plane: &data[..y_plane_len],
        y_stride: width,
        uv_plane: &data[y_plane_len..y_plane_len + uv_plane_len],
        uv_stride: width,
        width,
        height,
    };
    let mut rgb = vec![0u8; y_plane_len * CHANNELS];

    yuv_nv12_to_rgb(
        &image,
        &mut rgb,
        width * CHANNELS as u32,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12→RGB failed: {err:?}"))?;

    Ok(rgb)
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize * 2;
    if data.len() < expected_len {
        return Err(anyhow!(
            "YUYV buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let packed = YuvPackedImage {
        yuy: &data[..expected_len],
        yuy_stride: width * 2,
        width,
        height,
    };
    let mut rgb = vec![0u8; width as usize * height as usize * CHANNELS];

    yuyv422_to_rgb(
        &packed,
        &mut rgb,
        width * CHANNELS as u32,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422→RGB failed: {err:?}"))?;

    Ok(rgb)
}

/// Returns the decoded pixels with the JPEG's own dimensions, which can differ
/// from the resolution the driver reports.
fn mjpeg_to_rgb(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let mut rgb = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;

    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("MJPEG decoder returned no image info"))?;
    let width = u32::from(info.width);
    let height = u32::from(info.height);
    let expected_len = usize::try_from(width)
        .and_then(|w| usize::try_from(height).map(|h| w * h * CHANNELS))
        .map_err(|_| anyhow!("MJPEG dimensions do not fit usize"))?;
    if rgb.len() < expected_len {
        return Err(anyhow!(
            "MJPEG decode produced too few bytes: got {}, expected {}",
            rgb.len(),
            expected_len
        ));
    }
    rgb.truncate(expected_len);

    Ok((rgb, width, height))
}

fn packed_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize * CHANNELS;
    if data.len() < expected_len {
        return Err(anyhow!(
            "RGB buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }
    Ok(data[..expected_len].to_vec())
}

fn gray_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize;
    if data.len() < expected_len {
        return Err(anyhow!(
            "GRAY buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgb = vec![0u8; expected_len * CHANNELS];
    rgb.par_chunks_mut(CHANNELS)
        .zip(data[..expected_len].par_iter().copied())
        .for_each(|(dst, value)| dst.fill(value));

    Ok(rgb)
}
