//! Decode engine contract.
//!
//! The raw decode engine is an opaque collaborator that accepts read and
//! decode+process jobs and reports their completion through callbacks fired
//! from its own worker threads. This module describes that contract as
//! traits so the reader can be driven by the vendor engine (through an FFI
//! shim) or by [`crate::simulated::SimulatedEngine`] in tests.
//!
//! # Callback contract
//!
//! - Every submitted [`Job`] produces exactly one completion: read jobs
//!   through [`EngineCallbacks::read_complete`], decode+process jobs through
//!   [`EngineCallbacks::process_complete`].
//! - The [`JobContext`] handed to [`Job::submit`] comes back unchanged in that
//!   completion. If submission fails the context is returned in
//!   [`SubmitError`] instead.
//! - Completions never fire synchronously from inside `submit`.
//! - [`Codec::flush_jobs`] blocks until every submitted job has completed and
//!   its callback has returned, including jobs submitted by those callbacks.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{EngineError, EngineResult};
use crate::jobs::JobContext;

/// Compute backend the engine can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Software decode on CPU worker threads
    Cpu,
    /// OpenCL compute
    OpenCl,
    /// CUDA compute
    Cuda,
    /// Metal (graphics API with direct texture interop)
    Metal,
}

impl PipelineKind {
    /// All pipelines, most preferred first.
    pub const PREFERENCE_ORDER: [PipelineKind; 4] = [
        PipelineKind::Metal,
        PipelineKind::Cuda,
        PipelineKind::OpenCl,
        PipelineKind::Cpu,
    ];

    /// Rank used when the pipeline is chosen automatically. Lower is better.
    pub fn rank(self) -> usize {
        match self {
            PipelineKind::Metal => 0,
            PipelineKind::Cuda => 1,
            PipelineKind::OpenCl => 2,
            PipelineKind::Cpu => 3,
        }
    }

    /// Resource type of images processed on this pipeline.
    pub fn resource_type(self) -> ResourceType {
        match self {
            PipelineKind::Cpu => ResourceType::BufferCpu,
            PipelineKind::OpenCl => ResourceType::BufferOpenCl,
            PipelineKind::Cuda => ResourceType::BufferCuda,
            PipelineKind::Metal => ResourceType::BufferMetal,
        }
    }

    /// Returns the option name for this pipeline.
    pub fn name(self) -> &'static str {
        match self {
            PipelineKind::Cpu => "cpu",
            PipelineKind::OpenCl => "opencl",
            PipelineKind::Cuda => "cuda",
            PipelineKind::Metal => "metal",
        }
    }
}

/// Graphics API interop the pipeline is paired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InteropKind {
    #[default]
    None,
    OpenGl,
}

/// A pipeline/interop pair enumerated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineCandidate {
    pub pipeline: PipelineKind,
    pub interop: InteropKind,
}

/// Pixel layout of a processed image resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceFormat {
    RgbaU8,
    BgraU8,
    RgbU16,
    RgbaU16,
    BgraU16,
    RgbU16Planar,
    RgbF32,
    RgbF32Planar,
    BgraF32,
}

impl ResourceFormat {
    /// Bytes per pixel summed over all planes.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ResourceFormat::RgbaU8 | ResourceFormat::BgraU8 => 4,
            ResourceFormat::RgbU16 | ResourceFormat::RgbU16Planar => 6,
            ResourceFormat::RgbaU16 | ResourceFormat::BgraU16 => 8,
            ResourceFormat::RgbF32 | ResourceFormat::RgbF32Planar => 12,
            ResourceFormat::BgraF32 => 16,
        }
    }
}

/// Where a resource lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    BufferCpu,
    BufferMetal,
    BufferCuda,
    BufferOpenCl,
}

impl ResourceType {
    /// Returns true if the resource is directly readable from the host.
    pub fn is_host(self) -> bool {
        matches!(self, ResourceType::BufferCpu)
    }
}

/// Access pattern requested when allocating a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceUsage {
    ReadCpuWriteCpu,
    ReadGpuWriteGpu,
    ReadGpuWriteCpu,
    ReadCpuWriteGpu,
}

/// Decode resolution relative to the clip's native size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResolutionScale {
    #[default]
    Full,
    Half,
    Quarter,
    Eighth,
}

impl ResolutionScale {
    /// All scales, largest output first.
    pub const ALL: [ResolutionScale; 4] = [
        ResolutionScale::Full,
        ResolutionScale::Half,
        ResolutionScale::Quarter,
        ResolutionScale::Eighth,
    ];

    /// Divisor applied to each dimension.
    pub fn divisor(self) -> u32 {
        match self {
            ResolutionScale::Full => 1,
            ResolutionScale::Half => 2,
            ResolutionScale::Quarter => 4,
            ResolutionScale::Eighth => 8,
        }
    }

    /// Output dimensions for a clip of the given size.
    pub fn apply(self, width: u32, height: u32) -> (u32, u32) {
        let d = self.divisor();
        (width.div_ceil(d), height.div_ceil(d))
    }
}

/// Opaque engine resource handle (a device pointer or buffer object on GPU
/// backends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u64);

/// Native context and command queue of a bound device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceContext {
    pub context: u64,
    pub command_queue: u64,
}

/// Immutable stream geometry of an opened clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipGeometry {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub frame_count: u64,
}

/// Audio track description of a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipAudio {
    pub channels: u32,
    pub sample_rate: u32,
    pub sample_count: u64,
    pub bit_depth: u32,
}

/// Entry point into the engine library.
pub trait DecodeEngine: Send + Sync {
    /// Creates a codec instance. Each load session owns one codec.
    fn create_codec(&self) -> EngineResult<Arc<dyn Codec>>;
}

/// A codec instance: owns the worker pool that runs jobs.
pub trait Codec: Send + Sync {
    /// Installs the completion callbacks. Must happen before any submit.
    fn set_callbacks(&self, callbacks: EngineCallbacks) -> EngineResult<()>;

    /// Sets the number of CPU decode threads.
    fn set_cpu_threads(&self, threads: u32) -> EngineResult<()>;

    /// Enumerates the pipeline/interop pairs this engine supports.
    fn pipelines(&self) -> Vec<PipelineCandidate>;

    /// Enumerates devices for a pipeline/interop pair.
    fn devices(&self, candidate: PipelineCandidate) -> EngineResult<Vec<Arc<dyn PipelineDevice>>>;

    /// Binds the codec to a device. Must happen before the clip is opened.
    fn bind_device(&self, device: &Arc<dyn PipelineDevice>) -> EngineResult<()>;

    /// Pre-warms the pipeline for the first frame.
    fn prepare_pipeline(&self, device: &Arc<dyn PipelineDevice>) -> EngineResult<()>;

    /// Opens a raw clip.
    fn open_clip(&self, locator: &str) -> EngineResult<Arc<dyn Clip>>;

    /// Blocks until every submitted job has completed.
    fn flush_jobs(&self);
}

/// A compute device a codec can be bound to.
pub trait PipelineDevice: Send + Sync {
    fn name(&self) -> String;
    fn candidate(&self) -> PipelineCandidate;
    fn context(&self) -> DeviceContext;
    fn preferred_resource_format(&self) -> EngineResult<ResourceFormat>;
    fn resource_manager(&self) -> Option<Arc<dyn ResourceManager>>;
}

/// Allocation, mapping and copy of engine resources.
pub trait ResourceManager: Send + Sync {
    /// Returns host-readable bytes backing `resource`, or `None` if the
    /// backend cannot expose this resource to the host.
    fn host_pointer(
        &self,
        context: DeviceContext,
        resource: ResourceHandle,
        resource_type: ResourceType,
    ) -> EngineResult<Option<Bytes>>;

    fn create_resource(
        &self,
        context: DeviceContext,
        size_bytes: usize,
        resource_type: ResourceType,
        usage: ResourceUsage,
    ) -> EngineResult<ResourceHandle>;

    #[allow(clippy::too_many_arguments)]
    fn copy_resource(
        &self,
        context: DeviceContext,
        source: ResourceHandle,
        source_type: ResourceType,
        destination: ResourceHandle,
        destination_type: ResourceType,
        size_bytes: usize,
    ) -> EngineResult<()>;

    fn release_resource(
        &self,
        context: DeviceContext,
        resource: ResourceHandle,
        resource_type: ResourceType,
    ) -> EngineResult<()>;
}

/// An opened raw clip.
pub trait Clip: Send + Sync {
    fn geometry(&self) -> EngineResult<ClipGeometry>;

    /// Audio track, if the clip carries one.
    fn audio(&self) -> Option<ClipAudio>;

    fn create_job_read_frame(&self, index: u64) -> EngineResult<Box<dyn Job>>;
}

/// A unit of work that has not been submitted yet.
pub trait Job: Send {
    /// Submits the job. On failure the context is handed back so the caller
    /// can reclaim it.
    fn submit(self: Box<Self>, context: JobContext) -> Result<(), SubmitError>;
}

/// Failed job submission.
pub struct SubmitError {
    pub error: EngineError,
    pub context: JobContext,
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .field("frame_index", &self.context.frame_index)
            .finish()
    }
}

/// A raw (still encoded) frame delivered by a read job.
pub trait RawFrame: Send {
    fn set_resource_format(&mut self, format: ResourceFormat) -> EngineResult<()>;
    fn set_resolution_scale(&mut self, scale: ResolutionScale) -> EngineResult<()>;

    /// Frame-level metadata attributes as key/value strings.
    fn attributes(&self) -> EngineResult<Vec<(String, String)>>;

    fn create_job_decode_and_process(self: Box<Self>) -> EngineResult<Box<dyn Job>>;
}

/// A decoded and color-processed image delivered by a process job.
pub trait ProcessedImage: Send + Sync {
    fn width(&self) -> EngineResult<u32>;
    fn height(&self) -> EngineResult<u32>;
    fn resource_format(&self) -> EngineResult<ResourceFormat>;
    fn resource_type(&self) -> EngineResult<ResourceType>;
    fn resource(&self) -> EngineResult<ResourceHandle>;
    fn resource_size_bytes(&self) -> EngineResult<u32>;

    /// Pixel bytes of a CPU-resident image.
    fn cpu_data(&self) -> Option<Bytes>;

    /// Returns the image and its resource to the engine.
    fn release(self: Box<Self>);
}

type ReadCompleteFn = dyn Fn(JobContext, EngineResult<Box<dyn RawFrame>>) + Send + Sync;
type ProcessCompleteFn = dyn Fn(JobContext, EngineResult<Box<dyn ProcessedImage>>) + Send + Sync;

/// Completion callbacks installed on a codec.
#[derive(Clone)]
pub struct EngineCallbacks {
    read_complete: Arc<ReadCompleteFn>,
    process_complete: Arc<ProcessCompleteFn>,
}

impl EngineCallbacks {
    pub fn new<R, P>(read_complete: R, process_complete: P) -> Self
    where
        R: Fn(JobContext, EngineResult<Box<dyn RawFrame>>) + Send + Sync + 'static,
        P: Fn(JobContext, EngineResult<Box<dyn ProcessedImage>>) + Send + Sync + 'static,
    {
        Self {
            read_complete: Arc::new(read_complete),
            process_complete: Arc::new(process_complete),
        }
    }

    /// Reports completion of a read job.
    pub fn read_complete(&self, context: JobContext, result: EngineResult<Box<dyn RawFrame>>) {
        (self.read_complete)(context, result)
    }

    /// Reports completion of a decode+process job.
    pub fn process_complete(
        &self,
        context: JobContext,
        result: EngineResult<Box<dyn ProcessedImage>>,
    ) {
        (self.process_complete)(context, result)
    }
}

impl fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineCallbacks")
    }
}
