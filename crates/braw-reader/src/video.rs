//! Frame, media info and reader-facing contract types.
//!
//! This module provides the types shared between the reader and the media
//! framework it plugs into: the frames it delivers, the stream description
//! it publishes, and the traits the framework implements to receive them.

use std::time::Duration;

use bytes::Bytes;

use crate::buffer_pool::NativeBufferRef;
use crate::engine::ResourceFormat;
use crate::seek::{SeekFlags, SeekOutcome};

/// Timestamp carried by the end-of-stream marker frame.
pub const TIMESTAMP_EOS: f64 = f64::MAX;

/// Pixel format of delivered frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// RGBA 8 bits per channel
    Rgba,
    /// BGRA 8 bits per channel
    Bgra,
    /// RGB 16 bits per channel, little endian
    Rgb48le,
    /// RGBA 16 bits per channel, little endian
    Rgba64le,
    /// BGRA 16 bits per channel, little endian
    Bgra64le,
    /// Engine format with no framework equivalent
    Unknown,
}

impl PixelFormat {
    /// Maps an engine resource format to a framework pixel format.
    pub fn from_resource(format: ResourceFormat) -> Self {
        match format {
            ResourceFormat::RgbaU8 => PixelFormat::Rgba,
            ResourceFormat::BgraU8 => PixelFormat::Bgra,
            ResourceFormat::RgbU16 => PixelFormat::Rgb48le,
            ResourceFormat::RgbaU16 => PixelFormat::Rgba64le,
            ResourceFormat::BgraU16 => PixelFormat::Bgra64le,
            _ => PixelFormat::Unknown,
        }
    }

    /// The engine resource format producing this pixel format.
    pub fn to_resource(self) -> Option<ResourceFormat> {
        match self {
            PixelFormat::Rgba => Some(ResourceFormat::RgbaU8),
            PixelFormat::Bgra => Some(ResourceFormat::BgraU8),
            PixelFormat::Rgb48le => Some(ResourceFormat::RgbU16),
            PixelFormat::Rgba64le => Some(ResourceFormat::RgbaU16),
            PixelFormat::Bgra64le => Some(ResourceFormat::BgraU16),
            PixelFormat::Unknown => None,
        }
    }

    /// Parses a format name as used in reader options.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rgba" => Some(PixelFormat::Rgba),
            "bgra" => Some(PixelFormat::Bgra),
            "rgb48" | "rgb48le" => Some(PixelFormat::Rgb48le),
            "rgba64" | "rgba64le" => Some(PixelFormat::Rgba64le),
            "bgra64" | "bgra64le" => Some(PixelFormat::Bgra64le),
            _ => None,
        }
    }

    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        1
    }

    /// Bytes per pixel, `0` for [`PixelFormat::Unknown`].
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
            PixelFormat::Rgb48le => 6,
            PixelFormat::Rgba64le | PixelFormat::Bgra64le => 8,
            PixelFormat::Unknown => 0,
        }
    }
}

/// A single plane of host pixel data.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Raw pixel data
    pub data: Bytes,
    /// Stride (bytes per row, may include padding)
    pub stride: usize,
}

/// A decoded frame with host-accessible pixel data.
#[derive(Debug, Clone)]
pub struct CpuFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
}

impl CpuFrame {
    /// Wraps a packed single-plane image.
    pub fn packed(format: PixelFormat, width: u32, height: u32, data: Bytes) -> Self {
        let stride = if height > 0 {
            data.len() / height as usize
        } else {
            width as usize * format.bytes_per_pixel()
        };
        Self {
            format,
            width,
            height,
            planes: vec![Plane { data, stride }],
        }
    }

    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }
}

/// Pixel payload of a frame.
#[derive(Debug, Clone)]
pub enum DecodedFrame {
    /// No pixels: reset and end-of-stream markers
    Empty,
    /// Host-accessible pixel data
    Cpu(CpuFrame),
    /// Pixels still resident in engine or GPU memory
    Native(NativeBufferRef),
}

impl DecodedFrame {
    pub fn as_cpu(&self) -> Option<&CpuFrame> {
        match self {
            DecodedFrame::Cpu(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&NativeBufferRef> {
        match self {
            DecodedFrame::Native(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Returns true if the pixels are not host resident.
    pub fn is_gpu_surface(&self) -> bool {
        matches!(self, DecodedFrame::Native(_))
    }
}

/// A frame delivered to the framework.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Presentation time in seconds
    pub timestamp: f64,
    /// Display duration in seconds
    pub duration: f64,
    pub frame: DecodedFrame,
    /// Frame metadata propagated from the raw frame
    pub attributes: Vec<(String, String)>,
}

impl VideoFrame {
    /// Marker telling the consumer to drop anything queued before the
    /// payload that follows (sent ahead of the first frame after a seek).
    pub fn reset(format: PixelFormat, timestamp: f64) -> Self {
        Self {
            width: 0,
            height: 0,
            format,
            timestamp,
            duration: 0.0,
            frame: DecodedFrame::Empty,
            attributes: Vec::new(),
        }
    }

    /// End-of-stream marker.
    pub fn eos() -> Self {
        Self::reset(PixelFormat::Unknown, TIMESTAMP_EOS)
    }

    pub fn is_eos(&self) -> bool {
        self.timestamp == TIMESTAMP_EOS
    }

    /// Returns true for a reset marker (empty, not end-of-stream).
    pub fn is_reset(&self) -> bool {
        matches!(self.frame, DecodedFrame::Empty) && !self.is_eos()
    }

    /// Presentation time, `None` for the end-of-stream marker.
    pub fn pts(&self) -> Option<Duration> {
        if self.is_eos() || !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(self.timestamp))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Audio sample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    Unknown,
}

impl SampleFormat {
    pub fn from_bit_depth(bits: u32) -> Self {
        match bits {
            8 => SampleFormat::U8,
            16 => SampleFormat::S16,
            24 => SampleFormat::S24,
            32 => SampleFormat::S32,
            _ => SampleFormat::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub index: u32,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub frames: u64,
    /// Stream duration in milliseconds
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamInfo {
    pub index: u32,
    pub codec: String,
    pub channels: u32,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub frames: u64,
    /// Stream duration in milliseconds
    pub duration: i64,
}

/// Stream description published on load.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub format: String,
    pub streams: u32,
    /// Overall duration in milliseconds
    pub duration: i64,
    pub video: Vec<VideoStreamInfo>,
    pub audio: Vec<AudioStreamInfo>,
}

impl MediaInfo {
    pub fn video_stream(&self) -> Option<&VideoStreamInfo> {
        self.video.first()
    }
}

/// Media status of the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Unloaded,
    Loading,
    Loaded,
    /// Last frame delivered, session still open
    AtEnd,
    /// Teardown in progress
    Unloading,
}

impl MediaStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, MediaStatus::Loaded | MediaStatus::AtEnd)
    }
}

/// Requested playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Running,
    Paused,
}

/// Notifications published by the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    /// A load selected this decoder (once per successful load)
    DecoderSelected {
        name: &'static str,
        pipeline: crate::engine::PipelineKind,
        device: String,
    },
    MediaInfoChanged(MediaInfo),
    StatusChanged(MediaStatus),
    SeekCompleted { seek_id: u64, outcome: SeekOutcome },
}

/// Downstream consumer of delivered frames.
///
/// `push` may block to apply backpressure; the calling thread is the
/// engine's callback thread. Returning `false` rejects the frame and stops
/// the read chain until playback is resumed or a seek is issued.
pub trait FrameSink: Send + Sync {
    fn push(&self, frame: VideoFrame) -> bool;

    /// Releases a producer blocked in `push`. Called before teardown.
    fn unblock(&self) {}

    /// Prepares the sink for a new session.
    fn reset(&self) {}
}

impl<F> FrameSink for F
where
    F: Fn(VideoFrame) -> bool + Send + Sync,
{
    fn push(&self, frame: VideoFrame) -> bool {
        self(frame)
    }
}

/// Lifecycle contract between the media framework and a frame reader.
pub trait FrameReader: Send + Sync {
    /// Registered decoder name.
    fn name(&self) -> &'static str;

    fn is_supported(&self, url: &str) -> bool;

    fn load(&self, url: &str) -> bool;

    fn unload(&self) -> bool;

    /// Seeks to `target` (milliseconds, or a frame delta for relative seeks).
    fn seek_to(&self, target: i64, flags: SeekFlags, seek_id: u64) -> bool;

    /// Milliseconds buffered ahead of the current position.
    fn buffered(&self) -> i64;
}
