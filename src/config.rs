use std::{fmt, str::FromStr};

use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_TARGET_SIZE: (u32, u32) = (192, 256);
pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_OUTPUT_FPS: u32 = 30;
pub const DEFAULT_CAPTURE_FPS: u32 = 20;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(i32),
}

impl FromStr for Device {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse::<i32>().ok())
                .filter(|id| *id >= 0)
                .map(Device::Cuda)
                .ok_or_else(|| {
                    PipelineError::InvalidConfiguration(format!("unknown device {s:?}"))
                }),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// What a live stream does after a frame fails inference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamErrorPolicy {
    /// Yield the error, then end the stream.
    #[default]
    Abort,
    /// Yield the error and carry on with the next frame.
    SkipFrame,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Model input size as `(width, height)`.
    pub target_size: (u32, u32),
    pub threshold: f32,
    pub output_fps: u32,
    pub capture_fps: u32,
    /// Size of recorded video; falls back to `target_size`.
    pub output_size: Option<(u32, u32)>,
    pub jpeg_quality: u8,
    pub device: Device,
    pub stream_error_policy: StreamErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_size: DEFAULT_TARGET_SIZE,
            threshold: DEFAULT_THRESHOLD,
            output_fps: DEFAULT_OUTPUT_FPS,
            capture_fps: DEFAULT_CAPTURE_FPS,
            output_size: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            device: Device::Cpu,
            stream_error_policy: StreamErrorPolicy::Abort,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        let invalid =
            |msg: String| -> PipelineResult<()> { Err(PipelineError::InvalidConfiguration(msg)) };

        let (tw, th) = self.target_size;
        if tw == 0 || th == 0 {
            return invalid(format!("target size must be non-zero, got {tw}x{th}"));
        }
        if let Some((ow, oh)) = self.output_size {
            if ow == 0 || oh == 0 {
                return invalid(format!("output size must be non-zero, got {ow}x{oh}"));
            }
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return invalid(format!(
                "background threshold must be within [0, 1], got {}",
                self.threshold
            ));
        }
        if self.output_fps == 0 {
            return invalid("output fps must be positive".to_string());
        }
        if self.capture_fps == 0 {
            return invalid("capture fps must be positive".to_string());
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid(format!(
                "jpeg quality must be within 1..=100, got {}",
                self.jpeg_quality
            ));
        }

        Ok(())
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size.unwrap_or(self.target_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_target_size() {
        let config = PipelineConfig {
            target_size: (0, 256),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        for threshold in [-0.1, 1.5, f32::NAN] {
            let config = PipelineConfig {
                threshold,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "threshold {threshold}");
        }
    }

    #[test]
    fn parses_devices() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:-1".parse::<Device>().is_err());
    }
}
