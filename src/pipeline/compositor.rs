use std::sync::Arc;

use anyhow::{Result, anyhow};
use image::GrayImage;

use super::garment::GarmentPreprocessor;
use crate::{
    error::{PipelineError, PipelineResult},
    models::{EdgePredictor, NormalizedImage, RawMap, WarpingModel},
    types::{EdgeSource, Frame, GarmentSample, Mask, PixelOrder},
};

/// Runs the garment models on a normalized body crop.
#[derive(Clone)]
pub struct TryonCompositor {
    edge: Arc<dyn EdgePredictor>,
    warp: Arc<dyn WarpingModel>,
    target_size: (u32, u32),
    preprocessor: GarmentPreprocessor,
}

impl TryonCompositor {
    pub fn new(
        edge: Arc<dyn EdgePredictor>,
        warp: Arc<dyn WarpingModel>,
        target_size: (u32, u32),
    ) -> Self {
        Self {
            edge,
            warp,
            target_size,
            preprocessor: GarmentPreprocessor::new(target_size),
        }
    }

    /// Normalizes the garment and resolves its edge map: the supplied silhouette
    /// when there is one, otherwise the edge predictor's output.
    pub fn prepare_garment(
        &self,
        garment: &Frame,
        silhouette: Option<&GrayImage>,
    ) -> PipelineResult<GarmentSample> {
        let image = self.preprocessor.normalize_image(garment)?;

        let (edge, edge_source) = match silhouette {
            Some(silhouette) => (
                self.preprocessor.normalize_silhouette(silhouette)?,
                EdgeSource::Silhouette,
            ),
            None => {
                let raw = self
                    .edge
                    .predict(&image)
                    .map_err(|err| PipelineError::inference("edge", err))?;
                let edge = min_max_normalize(&raw, self.target_size)
                    .map_err(|err| PipelineError::inference("edge", err))?;
                (edge, EdgeSource::Predicted)
            }
        };

        Ok(GarmentSample {
            image,
            edge,
            edge_source,
        })
    }

    /// Returns a freshly allocated target-size image in the body crop's pixel order.
    pub fn synthesize(&self, body: &Frame, garment: &GarmentSample) -> PipelineResult<Frame> {
        let (width, height) = self.target_size;
        if (body.width(), body.height()) != self.target_size {
            return Err(PipelineError::Other(anyhow!(
                "body crop is {}x{}, expected {width}x{height}",
                body.width(),
                body.height()
            )));
        }

        let rgb_body = body.clone().into_order(PixelOrder::Rgb);
        let synthesized = self
            .warp
            .warp(&rgb_body, &garment.image, &garment.edge)
            .map_err(|err| PipelineError::inference("tryon", err))?;
        synthesized
            .validate(width, height)
            .map_err(|err| PipelineError::inference("tryon", err))?;

        let frame = Frame::with_timestamp(
            denormalize(&synthesized),
            width,
            height,
            PixelOrder::Rgb,
            body.timestamp,
        )?;
        Ok(frame.into_order(body.order()))
    }
}

/// Rescales a raw edge prediction to `[0, 1]` by its own min and max.
pub fn min_max_normalize(raw: &RawMap, (width, height): (u32, u32)) -> Result<Mask> {
    if (raw.width, raw.height) != (width, height) {
        return Err(anyhow!(
            "edge map is {}x{}, expected {width}x{height}",
            raw.width,
            raw.height
        ));
    }
    if raw.data.len() != width as usize * height as usize {
        return Err(anyhow!(
            "edge map holds {} values, expected {}",
            raw.data.len(),
            width as usize * height as usize
        ));
    }
    if raw.data.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("edge map contains non-finite values"));
    }

    let (min, max) = raw
        .data
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = max - min;
    if range <= f32::EPSILON {
        log::warn!("edge prediction is flat ({min}), using an empty edge map");
        return Ok(Mask::filled(width, height, 0.0));
    }

    Mask::new(
        raw.data
            .iter()
            .map(|v| ((v - min) / range).clamp(0.0, 1.0))
            .collect(),
        width,
        height,
    )
}

/// Maps `[-1, 1]` model output to bytes: `round((v + 1) / 2 * 255)`, clamped.
pub fn denormalize(image: &NormalizedImage) -> Vec<u8> {
    image
        .data
        .iter()
        .map(|v| (((v + 1.0) / 2.0) * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use image::Luma;

    struct RampEdge;

    impl EdgePredictor for RampEdge {
        fn predict(&self, garment: &Frame) -> Result<RawMap> {
            let len = (garment.width() * garment.height()) as usize;
            Ok(RawMap {
                width: garment.width(),
                height: garment.height(),
                data: (0..len).map(|v| -3.0 + v as f32).collect(),
            })
        }
    }

    /// Records what it was fed and answers with a constant value.
    struct ConstantWarp {
        value: f32,
        seen: Mutex<Vec<(PixelOrder, [u8; 3])>>,
    }

    impl ConstantWarp {
        fn new(value: f32) -> Self {
            Self {
                value,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl WarpingModel for ConstantWarp {
        fn warp(&self, body: &Frame, _garment: &Frame, _edge: &Mask) -> Result<NormalizedImage> {
            let first = [body.data()[0], body.data()[1], body.data()[2]];
            self.seen.lock().unwrap().push((body.order(), first));
            Ok(NormalizedImage {
                width: body.width(),
                height: body.height(),
                data: vec![self.value; body.data().len()],
            })
        }
    }

    struct NanWarp;

    impl WarpingModel for NanWarp {
        fn warp(&self, body: &Frame, _garment: &Frame, _edge: &Mask) -> Result<NormalizedImage> {
            Ok(NormalizedImage {
                width: body.width(),
                height: body.height(),
                data: vec![f32::NAN; body.data().len()],
            })
        }
    }

    const TARGET: (u32, u32) = (8, 12);

    #[test]
    fn denormalize_maps_signed_range_to_bytes() {
        let image = NormalizedImage {
            width: 1,
            height: 1,
            data: vec![-1.0, 0.0, 1.0],
        };
        assert_eq!(denormalize(&image), vec![0, 128, 255]);

        let out_of_range = NormalizedImage {
            width: 1,
            height: 1,
            data: vec![-1.5, 2.0, 0.5],
        };
        assert_eq!(denormalize(&out_of_range), vec![0, 255, 191]);
    }

    #[test]
    fn predicted_edge_is_min_max_normalized() {
        let compositor =
            TryonCompositor::new(Arc::new(RampEdge), Arc::new(ConstantWarp::new(0.0)), TARGET);
        let garment = Frame::filled(20, 20, PixelOrder::Rgb, [9, 9, 9]);
        let sample = compositor.prepare_garment(&garment, None).unwrap();

        assert_eq!(sample.edge_source, EdgeSource::Predicted);
        let data = sample.edge.data();
        assert_eq!(data[0], 0.0);
        assert_eq!(*data.last().unwrap(), 1.0);
    }

    #[test]
    fn supplied_silhouette_skips_prediction() {
        struct FailingEdge;
        impl EdgePredictor for FailingEdge {
            fn predict(&self, _garment: &Frame) -> Result<RawMap> {
                Err(anyhow!("should not be called"))
            }
        }

        let compositor =
            TryonCompositor::new(Arc::new(FailingEdge), Arc::new(ConstantWarp::new(0.0)), TARGET);
        let garment = Frame::filled(20, 20, PixelOrder::Rgb, [9, 9, 9]);
        let silhouette = GrayImage::from_pixel(4, 4, Luma([255]));
        let sample = compositor
            .prepare_garment(&garment, Some(&silhouette))
            .unwrap();

        assert_eq!(sample.edge_source, EdgeSource::Silhouette);
        assert!(sample.edge.data().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn flat_edge_prediction_becomes_empty_mask() {
        let raw = RawMap {
            width: 2,
            height: 2,
            data: vec![0.3; 4],
        };
        let mask = min_max_normalize(&raw, (2, 2)).unwrap();
        assert!(mask.data().iter().all(|v| *v == 0.0));
        assert!(min_max_normalize(&raw, (4, 1)).is_err());
    }

    #[test]
    fn synthesize_feeds_rgb_and_returns_body_order() {
        let warp = Arc::new(ConstantWarp::new(1.0));
        let compositor = TryonCompositor::new(Arc::new(RampEdge), warp.clone(), TARGET);
        let garment = compositor
            .prepare_garment(&Frame::filled(8, 12, PixelOrder::Rgb, [0, 0, 0]), None)
            .unwrap();
        let body = Frame::filled(8, 12, PixelOrder::Bgr, [10, 20, 30]);

        let output = compositor.synthesize(&body, &garment).unwrap();

        assert_eq!(output.order(), PixelOrder::Bgr);
        assert!(output.data().iter().all(|v| *v == 255));
        assert_eq!(
            warp.seen.lock().unwrap().as_slice(),
            &[(PixelOrder::Rgb, [30, 20, 10])]
        );
        // the body crop is left untouched
        assert_eq!(&body.data()[..3], &[10, 20, 30]);
    }

    #[test]
    fn nan_output_is_an_inference_failure() {
        let compositor = TryonCompositor::new(Arc::new(RampEdge), Arc::new(NanWarp), TARGET);
        let garment = compositor
            .prepare_garment(&Frame::filled(8, 12, PixelOrder::Rgb, [0, 0, 0]), None)
            .unwrap();
        let body = Frame::filled(8, 12, PixelOrder::Rgb, [0, 0, 0]);
        let err = compositor.synthesize(&body, &garment).unwrap_err();
        assert!(err.is_inference());
    }
}
