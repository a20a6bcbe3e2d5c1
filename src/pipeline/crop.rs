use anyhow::{Result, anyhow};

use super::resize::{Interpolation, ResizeTransform};
use crate::types::{CropRegion, CropResult, Frame, PoseLandmarks};

pub const LEFT_EYE: usize = 2;
pub const RIGHT_EYE: usize = 5;
pub const LEFT_HIP: usize = 23;
pub const RIGHT_HIP: usize = 24;

const UPPER_BODY_LANDMARKS: [usize; 4] = [LEFT_HIP, RIGHT_HIP, LEFT_EYE, RIGHT_EYE];

/// Padded upper-body box spanning both eyes and both hips.
///
/// The box is padded by a fifth of its height above and below and by its full
/// width on each side, then clamped to the frame. Fails when the landmark set is
/// too short or holds non-finite coordinates.
pub fn upper_body_bounds(landmarks: &PoseLandmarks, width: u32, height: u32) -> Result<CropRegion> {
    let mut min_x = f64::MAX;
    let mut max_x = f64::MIN;
    let mut min_y = f64::MAX;
    let mut max_y = f64::MIN;
    for idx in UPPER_BODY_LANDMARKS {
        let (x, y) = *landmarks.points.get(idx).ok_or_else(|| {
            anyhow!(
                "pose landmarks too short: need index {idx}, got {} points",
                landmarks.points.len()
            )
        })?;
        if !x.is_finite() || !y.is_finite() {
            return Err(anyhow!("landmark {idx} is not finite: ({x}, {y})"));
        }
        min_x = min_x.min(x as f64);
        max_x = max_x.max(x as f64);
        min_y = min_y.min(y as f64);
        max_y = max_y.max(y as f64);
    }

    // Landmarks far outside the frame are pulled in to one frame of slack so the
    // padding arithmetic stays in range; the final clamp is unaffected.
    let denormalize = |value: f64, extent: u32| {
        let extent = extent as f64;
        (value * extent).clamp(-extent, 2.0 * extent) as i64
    };
    let mut top = denormalize(min_y, height);
    let mut bottom = denormalize(max_y, height);
    let mut left = denormalize(min_x, width);
    let mut right = denormalize(max_x, width);

    let pad_y = (bottom - top).div_euclid(5);
    let pad_x = right - left;
    top -= pad_y;
    bottom += pad_y;
    left -= pad_x;
    right += pad_x;

    let clamp = |value: i64, extent: u32| value.clamp(0, extent as i64) as u32;
    Ok(CropRegion {
        top: clamp(top, height),
        left: clamp(left, width),
        bottom: clamp(bottom, height),
        right: clamp(right, width),
    }
    .clamped(width, height))
}

/// Largest `(x, y, width, height)` window of the target aspect ratio that fits a
/// `crop_w x crop_h` crop, centered in it.
pub fn fit_aspect(crop_w: u32, crop_h: u32, (target_w, target_h): (u32, u32)) -> (u32, u32, u32, u32) {
    let (cw, ch) = (crop_w as u64, crop_h as u64);
    let (tw, th) = (target_w as u64, target_h as u64);

    let (width, height) = if ch * tw < cw * th {
        (tw * ch / th, ch)
    } else {
        (cw, th * cw / tw)
    };

    let x = cw / 2 - width / 2;
    let y = ch / 2 - height / 2;
    (x as u32, y as u32, width as u32, height as u32)
}

/// Cuts the detected body out of a frame at the pipeline's fixed aspect ratio and
/// size, remembering where the crop came from.
#[derive(Clone, Debug)]
pub struct FrameCropper {
    target_size: (u32, u32),
    resize: ResizeTransform,
}

impl FrameCropper {
    pub fn new(target_size: (u32, u32)) -> Self {
        Self {
            target_size,
            resize: ResizeTransform::new(target_size, Interpolation::Bilinear),
        }
    }

    pub fn crop(&self, frame: Frame, bounds: Option<CropRegion>) -> Result<CropResult> {
        let Some(bounds) = bounds else {
            return Ok(CropResult::not_found(frame));
        };

        let bounds = bounds.clamped(frame.width(), frame.height());
        if bounds.is_empty() {
            log::debug!("body box {bounds:?} has no area, skipping frame");
            return Ok(CropResult::not_found(frame));
        }

        let (x, y, width, height) = fit_aspect(bounds.width(), bounds.height(), self.target_size);
        if width == 0 || height == 0 {
            log::debug!("body box {bounds:?} too small for target aspect, skipping frame");
            return Ok(CropResult::not_found(frame));
        }

        let top = bounds.top + y;
        let left = bounds.left + x;
        let region = CropRegion {
            top,
            left,
            bottom: top + height,
            right: left + width,
        };

        let window = frame.slice(region.top, region.left, region.bottom, region.right)?;
        let cropped = self.resize.apply(&window)?;

        Ok(CropResult {
            origin_frame: frame,
            cropped_frame: Some(cropped),
            region,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelOrder;

    fn landmarks(eyes: [(f32, f32); 2], hips: [(f32, f32); 2]) -> PoseLandmarks {
        let mut points = vec![(0.5, 0.5); 33];
        points[LEFT_EYE] = eyes[0];
        points[RIGHT_EYE] = eyes[1];
        points[LEFT_HIP] = hips[0];
        points[RIGHT_HIP] = hips[1];
        PoseLandmarks { points }
    }

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let data = (0..width * height * 3).map(|v| (v % 251) as u8).collect();
        Frame::new(data, width, height, PixelOrder::Bgr).unwrap()
    }

    #[test]
    fn padded_box_matches_hand_computed_reference() {
        // top = 0.15 * 480 = 72, bottom = 0.55 * 480 = 264, pad = (264 - 72) / 5 = 38
        // left = 0.40 * 640 = 256, right = 0.60 * 640 = 384, pad = 128
        let marks = landmarks([(0.45, 0.15), (0.55, 0.15)], [(0.40, 0.55), (0.60, 0.55)]);
        let bounds = upper_body_bounds(&marks, 640, 480).unwrap();
        assert_eq!(
            bounds,
            CropRegion {
                top: 34,
                left: 128,
                bottom: 302,
                right: 512,
            }
        );
    }

    #[test]
    fn padded_box_is_clamped_at_frame_edges() {
        let marks = landmarks([(0.0, 0.0), (0.9, 0.02)], [(0.05, 1.0), (0.95, 0.99)]);
        let bounds = upper_body_bounds(&marks, 640, 480).unwrap();
        assert_eq!(bounds.top, 0);
        assert_eq!(bounds.left, 0);
        assert_eq!(bounds.bottom, 480);
        assert_eq!(bounds.right, 640);
        assert!(bounds.fits(640, 480));
    }

    #[test]
    fn far_out_of_frame_landmarks_still_clamp() {
        let marks = landmarks([(-5.0 / 7.0, -1e30), (0.5, 0.1)], [(0.4, 1e30), (0.6, 0.6)]);
        let bounds = upper_body_bounds(&marks, 640, 480).unwrap();
        assert!(bounds.fits(640, 480));
        assert_eq!((bounds.top, bounds.bottom), (0, 480));
        assert_eq!(bounds.left, 0);

        let wide = landmarks([(-1e30, 0.1), (1e30, 0.1)], [(0.4, 0.6), (0.6, 0.6)]);
        let bounds = upper_body_bounds(&wide, 640, 480).unwrap();
        assert_eq!((bounds.left, bounds.right), (0, 640));
    }

    #[test]
    fn short_or_invalid_landmarks_are_rejected() {
        let short = PoseLandmarks {
            points: vec![(0.5, 0.5); 10],
        };
        assert!(upper_body_bounds(&short, 640, 480).is_err());

        let nan = landmarks([(f32::NAN, 0.1), (0.5, 0.1)], [(0.4, 0.6), (0.6, 0.6)]);
        assert!(upper_body_bounds(&nan, 640, 480).is_err());
    }

    #[test]
    fn fit_aspect_picks_height_driven_window_for_wide_crops() {
        assert_eq!(fit_aspect(384, 268, (192, 256)), (92, 0, 201, 268));
    }

    #[test]
    fn fit_aspect_picks_width_driven_window_for_tall_crops() {
        // 100 * 256 / 192 = 133
        assert_eq!(fit_aspect(100, 400, (192, 256)), (0, 134, 100, 133));
    }

    #[test]
    fn crop_maps_region_back_to_original_coordinates() {
        let cropper = FrameCropper::new((192, 256));
        let bounds = CropRegion {
            top: 34,
            left: 128,
            bottom: 302,
            right: 512,
        };
        let result = cropper.crop(gradient_frame(640, 480), Some(bounds)).unwrap();
        let cropped = result.cropped_frame.as_ref().unwrap();

        assert_eq!((cropped.width(), cropped.height()), (192, 256));
        assert_eq!(
            result.region,
            CropRegion {
                top: 34,
                left: 220,
                bottom: 302,
                right: 421,
            }
        );
        assert!(result.region.fits(640, 480));
    }

    #[test]
    fn missing_detection_passes_frame_through() {
        let frame = gradient_frame(64, 48);
        let result = FrameCropper::new((192, 256)).crop(frame.clone(), None).unwrap();
        assert!(result.cropped_frame.is_none());
        assert_eq!(result.region, CropRegion::EMPTY);
        assert_eq!(result.origin_frame, frame);
    }

    #[test]
    fn zero_area_box_is_not_found() {
        let bounds = CropRegion {
            top: 10,
            left: 10,
            bottom: 10,
            right: 40,
        };
        let result = FrameCropper::new((192, 256))
            .crop(gradient_frame(64, 48), Some(bounds))
            .unwrap();
        assert!(!result.is_found());
        assert_eq!(result.region, CropRegion::EMPTY);
    }

    #[test]
    fn sliver_too_thin_for_target_aspect_is_not_found() {
        let bounds = CropRegion {
            top: 0,
            left: 0,
            bottom: 1,
            right: 64,
        };
        let result = FrameCropper::new((192, 256))
            .crop(gradient_frame(64, 48), Some(bounds))
            .unwrap();
        assert!(!result.is_found());
    }

    #[test]
    fn cropping_is_idempotent() {
        let cropper = FrameCropper::new((192, 256));
        let frame = gradient_frame(320, 240);
        let bounds = Some(CropRegion {
            top: 20,
            left: 30,
            bottom: 200,
            right: 300,
        });
        let first = cropper.crop(frame.clone(), bounds).unwrap();
        let second = cropper.crop(frame, bounds).unwrap();
        assert_eq!(first, second);
    }
}
