//! Reader configuration from string key/value options.
//!
//! # Recognized keys
//!
//! | Key | Values |
//! |-----|--------|
//! | `format` | `rgba`, `bgra`, `rgb48le`, `rgba64le`, `bgra64le` |
//! | `threads` | CPU decode thread count, `0` for engine default |
//! | `gpu`, `pipeline` | `auto`, `metal`, `cuda`, `opencl`, `cpu` |
//! | `interop` | `opengl`, `none` |
//! | `device` | case-insensitive substring of the device name |
//! | `copy` | `1` to copy GPU frames to host memory |
//! | `scale` | `1`, `1/2`, `1/4`, `1/8` or a fraction like `0.5` |
//! | `size` | `WxH`: smallest decode that still covers this size |
//! | `continue_at_end` | `1` to keep the clip loaded after the last frame |
//!
//! Multiple options can be given as `key=value` pairs separated by `:`.

use crate::engine::{InteropKind, PipelineKind, ResolutionScale, ResourceFormat};
use crate::error::OptionsError;
use crate::video::PixelFormat;

/// Requested output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSize {
    /// Native clip resolution
    #[default]
    Native,
    /// Fixed engine downscale
    Scale(ResolutionScale),
    /// Smallest downscale covering `width` x `height`
    Fit { width: u32, height: u32 },
}

impl OutputSize {
    /// Picks the engine scale for a clip of the given native size.
    pub fn resolve(&self, width: u32, height: u32) -> ResolutionScale {
        match *self {
            OutputSize::Native => ResolutionScale::Full,
            OutputSize::Scale(scale) => scale,
            OutputSize::Fit {
                width: target_w,
                height: target_h,
            } => ResolutionScale::ALL
                .iter()
                .rev()
                .copied()
                .find(|scale| {
                    let (w, h) = scale.apply(width, height);
                    w >= target_w && h >= target_h
                })
                .unwrap_or(ResolutionScale::Full),
        }
    }
}

/// Reader configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Output pixel format
    pub format: PixelFormat,
    /// CPU decode threads, `0` leaves the engine default
    pub threads: u32,
    /// Pipeline to bind, `None` selects automatically
    pub pipeline: Option<PipelineKind>,
    pub interop: InteropKind,
    /// Case-insensitive device name filter
    pub device: Option<String>,
    /// Copy GPU-resident frames into host memory before delivery
    pub copy: bool,
    pub size: OutputSize,
    /// Keep the clip loaded after the last frame instead of unloading
    pub continue_at_end: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            format: PixelFormat::Rgba,
            threads: 0,
            pipeline: None,
            interop: InteropKind::None,
            device: None,
            copy: false,
            size: OutputSize::Native,
            continue_at_end: false,
        }
    }
}

impl ReaderOptions {
    /// Parses `key=value` pairs separated by `:`.
    pub fn parse(input: &str) -> Result<Self, OptionsError> {
        let mut options = Self::default();
        for pair in input.split(':').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            options.set(key.trim(), value.trim())?;
        }
        Ok(options)
    }

    /// Applies one option. Unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), OptionsError> {
        let invalid = || OptionsError {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key.to_ascii_lowercase().as_str() {
            "format" => {
                self.format = PixelFormat::from_name(value).ok_or_else(invalid)?;
            }
            "threads" => {
                self.threads = value.parse().map_err(|_| invalid())?;
            }
            "gpu" | "pipeline" => {
                self.pipeline = parse_pipeline(value).ok_or_else(invalid)?;
            }
            "interop" => {
                self.interop = match value.to_ascii_lowercase().as_str() {
                    "opengl" | "gl" => InteropKind::OpenGl,
                    "none" | "" => InteropKind::None,
                    _ => return Err(invalid()),
                };
            }
            "device" => {
                self.device = (!value.is_empty()).then(|| value.to_string());
            }
            "copy" => {
                self.copy = parse_flag(value).ok_or_else(invalid)?;
            }
            "scale" => {
                self.size = OutputSize::Scale(parse_scale(value).ok_or_else(invalid)?);
            }
            "size" => {
                let (w, h) = value.split_once(['x', 'X']).ok_or_else(invalid)?;
                let width = w.trim().parse().map_err(|_| invalid())?;
                let height = h.trim().parse().map_err(|_| invalid())?;
                self.size = OutputSize::Fit { width, height };
            }
            "continue_at_end" => {
                self.continue_at_end = parse_flag(value).ok_or_else(invalid)?;
            }
            other => {
                tracing::debug!("ignoring unknown reader option '{}'", other);
            }
        }
        Ok(())
    }

    /// Engine resource format producing [`Self::format`].
    pub fn resource_format(&self) -> ResourceFormat {
        self.format.to_resource().unwrap_or(ResourceFormat::RgbaU8)
    }
}

/// `Some(None)` is auto selection.
fn parse_pipeline(value: &str) -> Option<Option<PipelineKind>> {
    match value.to_ascii_lowercase().as_str() {
        "auto" | "" => Some(None),
        "metal" | "mtl" => Some(Some(PipelineKind::Metal)),
        "cuda" => Some(Some(PipelineKind::Cuda)),
        "opencl" | "ocl" | "cl" => Some(Some(PipelineKind::OpenCl)),
        "cpu" | "0" => Some(Some(PipelineKind::Cpu)),
        _ => None,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_scale(value: &str) -> Option<ResolutionScale> {
    let ratio = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse().ok()?,
    };
    ResolutionScale::ALL
        .iter()
        .copied()
        .find(|scale| (ratio - 1.0 / scale.divisor() as f64).abs() < 1e-3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let options =
            ReaderOptions::parse("format=bgra:threads=4:gpu=cuda:device=RTX:copy=1:scale=1/2")
                .unwrap();
        assert_eq!(options.format, PixelFormat::Bgra);
        assert_eq!(options.threads, 4);
        assert_eq!(options.pipeline, Some(PipelineKind::Cuda));
        assert_eq!(options.device.as_deref(), Some("RTX"));
        assert!(options.copy);
        assert_eq!(options.size, OutputSize::Scale(ResolutionScale::Half));
        assert_eq!(options.resource_format(), ResourceFormat::BgraU8);
    }

    #[test]
    fn test_pipeline_auto_and_aliases() {
        let mut options = ReaderOptions::default();
        options.set("pipeline", "opencl").unwrap();
        assert_eq!(options.pipeline, Some(PipelineKind::OpenCl));
        options.set("gpu", "auto").unwrap();
        assert_eq!(options.pipeline, None);
        options.set("interop", "opengl").unwrap();
        assert_eq!(options.interop, InteropKind::OpenGl);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut options = ReaderOptions::default();
        assert!(options.set("format", "yuv420p").is_err());
        assert!(options.set("scale", "1/3").is_err());
        assert!(options.set("size", "big").is_err());
        assert!(options.set("gpu", "vulkan").is_err());
        // unknown keys are not errors
        assert!(options.set("colorspace", "rec709").is_ok());
    }

    #[test]
    fn test_fit_size_picks_smallest_covering_scale() {
        let size = OutputSize::Fit {
            width: 1920,
            height: 1080,
        };
        assert_eq!(size.resolve(6144, 3456), ResolutionScale::Half);
        assert_eq!(size.resolve(1920, 1080), ResolutionScale::Full);
        assert_eq!(size.resolve(1280, 720), ResolutionScale::Full);
        assert_eq!(
            OutputSize::Fit {
                width: 500,
                height: 250
            }
            .resolve(4096, 2160),
            ResolutionScale::Eighth
        );
    }

    #[test]
    fn test_decimal_scale() {
        let options = ReaderOptions::parse("scale=0.25").unwrap();
        assert_eq!(options.size, OutputSize::Scale(ResolutionScale::Quarter));
    }
}
