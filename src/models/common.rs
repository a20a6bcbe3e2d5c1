use anyhow::{Result, anyhow};
use ndarray::Array4;
use rayon::prelude::*;

use crate::{
    pipeline::resize::{Interpolation, resize_frame},
    types::{CHANNELS, Frame, Mask, PixelOrder},
};

#[derive(Clone, Debug)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

/// Scales the frame to fit a `target_size` square, pads the rest with black and
/// returns an NHWC tensor in `[0, 1]`.
pub fn prepare_letterboxed(frame: &Frame, target_size: u32) -> Result<(Array4<f32>, LetterboxInfo)> {
    let scale = target_size as f32 / (frame.width().max(frame.height()) as f32);
    let new_w = (frame.width() as f32 * scale).round().max(1.0) as u32;
    let new_h = (frame.height() as f32 * scale).round().max(1.0) as u32;

    let rgb = frame.clone().into_order(PixelOrder::Rgb);
    let resized = resize_frame(&rgb, new_w, new_h, Interpolation::Bilinear)?;

    let pad_x = ((target_size as i64 - new_w as i64) / 2).max(0) as usize;
    let pad_y = ((target_size as i64 - new_h as i64) / 2).max(0) as usize;
    let side = target_size as usize;
    let mut canvas = vec![0u8; side * side * CHANNELS];
    let dst_stride = side * CHANNELS;
    let src_stride = resized.stride();
    for row in 0..(new_h as usize) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * CHANNELS;
        let src_offset = row * src_stride;
        canvas[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized.data()[src_offset..src_offset + src_stride]);
    }

    let input = Array4::<f32>::from_shape_vec((1, side, side, CHANNELS), unit_scale(&canvas))
        .map_err(|err| anyhow!("failed to build letterboxed tensor: {err}"))?;

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: frame.width(),
        orig_h: frame.height(),
    };

    Ok((input, letterbox))
}

/// Stretches the frame to `width x height` and returns an NHWC tensor in `[0, 1]`.
pub fn prepare_stretched(frame: &Frame, width: u32, height: u32) -> Result<Array4<f32>> {
    let rgb = frame.clone().into_order(PixelOrder::Rgb);
    let resized = resize_frame(&rgb, width, height, Interpolation::Bilinear)?;
    Array4::<f32>::from_shape_vec(
        (1, height as usize, width as usize, CHANNELS),
        unit_scale(resized.data()),
    )
    .map_err(|err| anyhow!("failed to build input tensor: {err}"))
}

/// Planar `[1, 3, H, W]` tensor; `signed` maps pixels to `[-1, 1]`, otherwise `[0, 1]`.
pub fn frame_to_nchw(frame: &Frame, signed: bool) -> Result<Array4<f32>> {
    let rgb = frame.clone().into_order(PixelOrder::Rgb);
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let plane = w * h;
    let mut planar = vec![0.0f32; plane * CHANNELS];
    for (idx, px) in rgb.data().chunks_exact(CHANNELS).enumerate() {
        for c in 0..CHANNELS {
            let unit = px[c] as f32 / 255.0;
            planar[c * plane + idx] = if signed { unit * 2.0 - 1.0 } else { unit };
        }
    }
    Array4::<f32>::from_shape_vec((1, CHANNELS, h, w), planar)
        .map_err(|err| anyhow!("failed to build planar tensor: {err}"))
}

pub fn mask_to_nchw(mask: &Mask) -> Result<Array4<f32>> {
    Array4::<f32>::from_shape_vec(
        (1, 1, mask.height() as usize, mask.width() as usize),
        mask.data().to_vec(),
    )
    .map_err(|err| anyhow!("failed to build mask tensor: {err}"))
}

/// Converts `[1, 3, H, W]` output back to interleaved RGB values.
pub fn nchw_to_interleaved(planar: &[f32], width: u32, height: u32) -> Result<Vec<f32>> {
    let plane = width as usize * height as usize;
    if planar.len() != plane * CHANNELS {
        return Err(anyhow!(
            "planar output holds {} values, expected {}",
            planar.len(),
            plane * CHANNELS
        ));
    }
    let mut interleaved = vec![0.0f32; plane * CHANNELS];
    interleaved
        .par_chunks_exact_mut(CHANNELS)
        .enumerate()
        .for_each(|(idx, px)| {
            for (c, value) in px.iter_mut().enumerate() {
                *value = planar[c * plane + idx];
            }
        });
    Ok(interleaved)
}

/// Splits a flat landmark tensor into `count` rows of `stride` values, keeping x and y.
pub fn decode_landmarks(flat: &[f32], stride: usize, count: usize) -> Result<Vec<(f32, f32)>> {
    if stride < 2 || flat.len() < stride * count {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {} (stride {stride})",
            flat.len(),
            stride * count
        ));
    }

    Ok(flat
        .chunks_exact(stride)
        .take(count)
        .map(|chunk| (chunk[0], chunk[1]))
        .collect())
}

/// Maps landmarks in letterboxed input pixels back to fractions of the original frame.
pub fn project_landmarks(landmarks: &[(f32, f32)], letterbox: &LetterboxInfo) -> Vec<(f32, f32)> {
    let w = letterbox.orig_w.max(1) as f32;
    let h = letterbox.orig_h.max(1) as f32;
    landmarks
        .iter()
        .map(|(x, y)| {
            let px = (x - letterbox.pad_x) / letterbox.scale;
            let py = (y - letterbox.pad_y) / letterbox.scale;
            ((px / w).clamp(0.0, 1.0), (py / h).clamp(0.0, 1.0))
        })
        .collect()
}

fn unit_scale(pixels: &[u8]) -> Vec<f32> {
    pixels.par_iter().map(|v| *v as f32 / 255.0).collect()
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
