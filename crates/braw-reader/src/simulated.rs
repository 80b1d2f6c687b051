//! In-process decode engine.
//!
//! [`SimulatedEngine`] implements the full engine contract without the
//! vendor library: jobs run in FIFO order on one worker thread per codec,
//! completions fire from that thread, and processed images carry a byte
//! pattern derived from the frame index. It is used by the test suite and
//! the demo binary.
//!
//! A hold/release gate stops the worker before its next job so tests can
//! queue several submissions and then let them complete in a known order.
//! CPU pipelines produce host-resident images. GPU pipelines produce
//! device-resident images whose host pointer support is configurable, so
//! every step of the buffer pool's mapping chain can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::engine::{
    Clip, ClipAudio, ClipGeometry, Codec, DecodeEngine, DeviceContext, EngineCallbacks,
    InteropKind, Job, PipelineCandidate, PipelineDevice, PipelineKind, ProcessedImage, RawFrame,
    ResolutionScale, ResourceFormat, ResourceHandle, ResourceManager, ResourceType, ResourceUsage,
    SubmitError,
};
use crate::error::{EngineError, EngineResult};
use crate::jobs::JobContext;

// =========================================================================
// Configuration
// =========================================================================

/// Clip served by the simulated engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedClip {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub frame_count: u64,
    pub audio: Option<ClipAudio>,
}

impl SimulatedClip {
    pub fn new(width: u32, height: u32, frame_rate: f32, frame_count: u64) -> Self {
        Self {
            width,
            height,
            frame_rate,
            frame_count,
            audio: None,
        }
    }

    pub fn with_audio(mut self, audio: ClipAudio) -> Self {
        self.audio = Some(audio);
        self
    }
}

impl Default for SimulatedClip {
    /// Ten 16x8 frames at 10 fps (one second).
    fn default() -> Self {
        Self::new(16, 8, 10.0, 10)
    }
}

/// Which resources expose a host pointer on GPU pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostPointerSupport {
    /// Processed images themselves
    pub direct: bool,
    /// CPU-readable/GPU-writable readback resources
    pub readback: bool,
    /// CPU-only buffers
    pub host_buffer: bool,
}

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub clip: SimulatedClip,
    pub pipelines: Vec<PipelineCandidate>,
    /// Device names enumerated for GPU pipelines
    pub gpu_devices: Vec<String>,
    pub host_pointers: HostPointerSupport,
    /// `open_clip` fails
    pub fail_open: bool,
    /// Creating the read job for this index fails
    pub fail_create_read_at: Option<u64>,
    /// Read job for this index completes with an error
    pub fail_read_at: Option<u64>,
    /// Process job for this index completes with an error
    pub fail_process_at: Option<u64>,
    /// Time spent in each job
    pub job_delay: Duration,
}

impl SimulatedConfig {
    /// CPU pipeline only.
    pub fn cpu() -> Self {
        Self {
            clip: SimulatedClip::default(),
            pipelines: vec![PipelineCandidate {
                pipeline: PipelineKind::Cpu,
                interop: InteropKind::None,
            }],
            gpu_devices: Vec::new(),
            host_pointers: HostPointerSupport {
                direct: true,
                readback: true,
                host_buffer: true,
            },
            fail_open: false,
            fail_create_read_at: None,
            fail_read_at: None,
            fail_process_at: None,
            job_delay: Duration::ZERO,
        }
    }

    /// `pipeline` plus the CPU fallback, with two GPU devices and no host
    /// pointer support on device resources.
    pub fn gpu(pipeline: PipelineKind) -> Self {
        let mut config = Self::cpu();
        config.pipelines.insert(
            0,
            PipelineCandidate {
                pipeline,
                interop: InteropKind::None,
            },
        );
        config.gpu_devices = vec!["Simulated GPU 0".into(), "Simulated GPU 1".into()];
        config.host_pointers = HostPointerSupport {
            direct: false,
            readback: false,
            host_buffer: true,
        };
        config
    }

    pub fn with_clip(mut self, clip: SimulatedClip) -> Self {
        self.clip = clip;
        self
    }
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self::cpu()
    }
}

// =========================================================================
// Engine
// =========================================================================

/// Engine-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub codecs_created: u64,
    pub read_jobs: u64,
    pub process_jobs: u64,
    pub completions: u64,
    pub flushes: u64,
    pub images_created: u64,
    pub images_released: u64,
    pub resources_created: u64,
    pub resources_released: u64,
}

#[derive(Debug, Clone)]
struct SimResource {
    resource_type: ResourceType,
    data: Bytes,
    readback: bool,
}

#[derive(Default)]
struct EngineShared {
    held: Mutex<bool>,
    gate: Condvar,
    in_flight: AtomicUsize,
    codecs_created: AtomicU64,
    read_jobs: AtomicU64,
    process_jobs: AtomicU64,
    completions: AtomicU64,
    flushes: AtomicU64,
    images_created: AtomicU64,
    images_released: AtomicU64,
    resources_created: AtomicU64,
    resources_released: AtomicU64,
    next_handle: AtomicU64,
    resources: Mutex<HashMap<u64, SimResource>>,
    read_log: Mutex<Vec<u64>>,
}

impl EngineShared {
    fn wait_gate(&self) {
        let mut held = self.held.lock();
        while *held {
            self.gate.wait(&mut held);
        }
    }

    fn allocate(&self, resource: SimResource) -> ResourceHandle {
        let id = 0x1000 + self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.resources.lock().insert(id, resource);
        ResourceHandle(id)
    }
}

/// In-process implementation of [`DecodeEngine`].
#[derive(Clone)]
pub struct SimulatedEngine {
    config: Arc<SimulatedConfig>,
    shared: Arc<EngineShared>,
}

impl SimulatedEngine {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::new(EngineShared::default()),
        }
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    /// Stops workers before their next job.
    pub fn hold(&self) {
        *self.shared.held.lock() = true;
    }

    /// Lets held workers continue.
    pub fn release(&self) {
        *self.shared.held.lock() = false;
        self.shared.gate.notify_all();
    }

    /// Indices of every read job submitted, in submission order.
    pub fn read_log(&self) -> Vec<u64> {
        self.shared.read_log.lock().clone()
    }

    /// Jobs submitted whose completion callback has not returned yet.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no job is in flight.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Resources created through a resource manager and not released.
    pub fn live_readback_resources(&self) -> usize {
        self.shared
            .resources
            .lock()
            .values()
            .filter(|r| r.readback)
            .count()
    }

    pub fn counters(&self) -> EngineCounters {
        let s = &self.shared;
        EngineCounters {
            codecs_created: s.codecs_created.load(Ordering::Acquire),
            read_jobs: s.read_jobs.load(Ordering::Acquire),
            process_jobs: s.process_jobs.load(Ordering::Acquire),
            completions: s.completions.load(Ordering::Acquire),
            flushes: s.flushes.load(Ordering::Acquire),
            images_created: s.images_created.load(Ordering::Acquire),
            images_released: s.images_released.load(Ordering::Acquire),
            resources_created: s.resources_created.load(Ordering::Acquire),
            resources_released: s.resources_released.load(Ordering::Acquire),
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl DecodeEngine for SimulatedEngine {
    fn create_codec(&self) -> EngineResult<Arc<dyn Codec>> {
        self.shared.codecs_created.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(SimCodec::spawn(
            Arc::clone(&self.config),
            Arc::clone(&self.shared),
        )))
    }
}

// =========================================================================
// Codec and worker
// =========================================================================

type Task = Box<dyn FnOnce(Option<&EngineCallbacks>, JobContext) + Send>;
type Message = (Task, JobContext);

/// State shared by a codec, its jobs and its worker thread.
struct CodecCore {
    config: Arc<SimulatedConfig>,
    engine: Arc<EngineShared>,
    callbacks: Mutex<Option<EngineCallbacks>>,
    pending: Mutex<usize>,
    drained: Condvar,
    bound: Mutex<Option<PipelineCandidate>>,
}

impl CodecCore {
    /// Queues a job. Hands the context back if the worker is gone.
    fn enqueue(
        &self,
        queue: &Sender<Message>,
        task: Task,
        context: JobContext,
    ) -> Result<(), SubmitError> {
        *self.pending.lock() += 1;
        self.engine.in_flight.fetch_add(1, Ordering::AcqRel);
        queue.send((task, context)).map_err(|e| {
            self.finish();
            let (_, context) = e.into_inner();
            SubmitError {
                error: EngineError::failed("Submit"),
                context,
            }
        })
    }

    fn finish(&self) {
        self.engine.in_flight.fetch_sub(1, Ordering::AcqRel);
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn resource_type(&self) -> ResourceType {
        self.bound
            .lock()
            .map(|c| c.pipeline.resource_type())
            .unwrap_or(ResourceType::BufferCpu)
    }
}

fn worker_loop(core: Weak<CodecCore>, tasks: Receiver<Message>) {
    while let Ok((task, context)) = tasks.recv() {
        let Some(core) = core.upgrade() else {
            break;
        };
        core.engine.wait_gate();
        if !core.config.job_delay.is_zero() {
            thread::sleep(core.config.job_delay);
        }
        // run without the callbacks lock so callbacks can submit
        let callbacks = core.callbacks.lock().clone();
        task(callbacks.as_ref(), context);
        core.engine.completions.fetch_add(1, Ordering::AcqRel);
        core.finish();
    }
    tracing::trace!("simulated codec worker exiting");
}

struct SimCodec {
    core: Arc<CodecCore>,
    queue: Sender<Message>,
    devices: Mutex<HashMap<PipelineKind, Vec<Arc<dyn PipelineDevice>>>>,
}

impl SimCodec {
    fn spawn(config: Arc<SimulatedConfig>, engine: Arc<EngineShared>) -> Self {
        let core = Arc::new(CodecCore {
            config,
            engine,
            callbacks: Mutex::new(None),
            pending: Mutex::new(0),
            drained: Condvar::new(),
            bound: Mutex::new(None),
        });
        let (queue, tasks) = unbounded();
        let weak = Arc::downgrade(&core);
        thread::Builder::new()
            .name("sim-codec".into())
            .spawn(move || worker_loop(weak, tasks))
            .map(|_| ())
            .unwrap_or_else(|e| tracing::error!("failed to spawn simulated codec worker: {}", e));
        Self {
            core,
            queue,
            devices: Mutex::new(HashMap::new()),
        }
    }
}

impl Codec for SimCodec {
    fn set_callbacks(&self, callbacks: EngineCallbacks) -> EngineResult<()> {
        *self.core.callbacks.lock() = Some(callbacks);
        Ok(())
    }

    fn set_cpu_threads(&self, threads: u32) -> EngineResult<()> {
        tracing::debug!("simulated codec: {} cpu threads", threads);
        Ok(())
    }

    fn pipelines(&self) -> Vec<PipelineCandidate> {
        self.core.config.pipelines.clone()
    }

    fn devices(&self, candidate: PipelineCandidate) -> EngineResult<Vec<Arc<dyn PipelineDevice>>> {
        if !self.core.config.pipelines.contains(&candidate) {
            return Err(EngineError::failed("CreateDeviceIterator"));
        }
        let mut cache = self.devices.lock();
        let devices = cache.entry(candidate.pipeline).or_insert_with(|| {
            let names = match candidate.pipeline {
                PipelineKind::Cpu => vec!["Simulated CPU".to_string()],
                _ => self.core.config.gpu_devices.clone(),
            };
            let manager: Arc<dyn ResourceManager> = Arc::new(SimResourceManager {
                engine: Arc::clone(&self.core.engine),
                support: self.core.config.host_pointers,
            });
            names
                .into_iter()
                .enumerate()
                .map(|(i, name)| {
                    Arc::new(SimDevice {
                        name,
                        candidate,
                        context: DeviceContext {
                            context: 0x100 + i as u64,
                            command_queue: 0x200 + i as u64,
                        },
                        manager: Arc::clone(&manager),
                    }) as Arc<dyn PipelineDevice>
                })
                .collect()
        });
        Ok(devices.clone())
    }

    fn bind_device(&self, device: &Arc<dyn PipelineDevice>) -> EngineResult<()> {
        *self.core.bound.lock() = Some(device.candidate());
        Ok(())
    }

    fn prepare_pipeline(&self, device: &Arc<dyn PipelineDevice>) -> EngineResult<()> {
        tracing::trace!("simulated codec: prepared {}", device.name());
        Ok(())
    }

    fn open_clip(&self, locator: &str) -> EngineResult<Arc<dyn Clip>> {
        if self.core.config.fail_open || locator.is_empty() {
            return Err(EngineError::failed("OpenClip"));
        }
        Ok(Arc::new(SimClip {
            core: Arc::clone(&self.core),
            queue: self.queue.clone(),
        }))
    }

    fn flush_jobs(&self) {
        self.core.engine.flushes.fetch_add(1, Ordering::AcqRel);
        let mut pending = self.core.pending.lock();
        while *pending > 0 {
            self.core.drained.wait(&mut pending);
        }
    }
}

// =========================================================================
// Devices and resources
// =========================================================================

struct SimDevice {
    name: String,
    candidate: PipelineCandidate,
    context: DeviceContext,
    manager: Arc<dyn ResourceManager>,
}

impl PipelineDevice for SimDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn candidate(&self) -> PipelineCandidate {
        self.candidate
    }

    fn context(&self) -> DeviceContext {
        self.context
    }

    fn preferred_resource_format(&self) -> EngineResult<ResourceFormat> {
        Ok(match self.candidate.pipeline {
            PipelineKind::Metal => ResourceFormat::BgraU8,
            _ => ResourceFormat::RgbaU8,
        })
    }

    fn resource_manager(&self) -> Option<Arc<dyn ResourceManager>> {
        Some(Arc::clone(&self.manager))
    }
}

struct SimResourceManager {
    engine: Arc<EngineShared>,
    support: HostPointerSupport,
}

impl ResourceManager for SimResourceManager {
    fn host_pointer(
        &self,
        _context: DeviceContext,
        resource: ResourceHandle,
        resource_type: ResourceType,
    ) -> EngineResult<Option<Bytes>> {
        let resources = self.engine.resources.lock();
        let res = resources
            .get(&resource.0)
            .ok_or(EngineError::failed("GetResourceHostPointer"))?;
        let mappable = if res.resource_type != resource_type {
            false
        } else if resource_type.is_host() {
            !res.readback || self.support.host_buffer
        } else if res.readback {
            self.support.readback
        } else {
            self.support.direct
        };
        Ok(mappable.then(|| res.data.clone()))
    }

    fn create_resource(
        &self,
        _context: DeviceContext,
        size_bytes: usize,
        resource_type: ResourceType,
        usage: ResourceUsage,
    ) -> EngineResult<ResourceHandle> {
        tracing::trace!("simulated: create {:?} resource ({:?})", resource_type, usage);
        self.engine.resources_created.fetch_add(1, Ordering::AcqRel);
        Ok(self.engine.allocate(SimResource {
            resource_type,
            data: Bytes::from(vec![0u8; size_bytes]),
            readback: true,
        }))
    }

    fn copy_resource(
        &self,
        _context: DeviceContext,
        source: ResourceHandle,
        _source_type: ResourceType,
        destination: ResourceHandle,
        _destination_type: ResourceType,
        size_bytes: usize,
    ) -> EngineResult<()> {
        let mut resources = self.engine.resources.lock();
        let data = resources
            .get(&source.0)
            .map(|r| r.data.clone())
            .ok_or(EngineError::failed("CopyResource"))?;
        let dst = resources
            .get_mut(&destination.0)
            .ok_or(EngineError::failed("CopyResource"))?;
        dst.data = data.slice(..size_bytes.min(data.len()));
        Ok(())
    }

    fn release_resource(
        &self,
        _context: DeviceContext,
        resource: ResourceHandle,
        _resource_type: ResourceType,
    ) -> EngineResult<()> {
        self.engine
            .resources
            .lock()
            .remove(&resource.0)
            .ok_or(EngineError::failed("ReleaseResource"))?;
        self.engine.resources_released.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// =========================================================================
// Clip, jobs and frames
// =========================================================================

struct SimClip {
    core: Arc<CodecCore>,
    queue: Sender<Message>,
}

impl Clip for SimClip {
    fn geometry(&self) -> EngineResult<ClipGeometry> {
        let clip = &self.core.config.clip;
        Ok(ClipGeometry {
            width: clip.width,
            height: clip.height,
            frame_rate: clip.frame_rate,
            frame_count: clip.frame_count,
        })
    }

    fn audio(&self) -> Option<ClipAudio> {
        self.core.config.clip.audio
    }

    fn create_job_read_frame(&self, index: u64) -> EngineResult<Box<dyn Job>> {
        let config = &self.core.config;
        if index >= config.clip.frame_count || config.fail_create_read_at == Some(index) {
            return Err(EngineError::failed("CreateJobReadFrame"));
        }
        Ok(Box::new(ReadJob {
            index,
            core: Arc::clone(&self.core),
            queue: self.queue.clone(),
        }))
    }
}

struct ReadJob {
    index: u64,
    core: Arc<CodecCore>,
    queue: Sender<Message>,
}

impl Job for ReadJob {
    fn submit(self: Box<Self>, context: JobContext) -> Result<(), SubmitError> {
        let ReadJob { index, core, queue } = *self;
        core.engine.read_jobs.fetch_add(1, Ordering::AcqRel);
        core.engine.read_log.lock().push(index);

        let task_core = Arc::clone(&core);
        let task_queue = queue.clone();
        let task: Task = Box::new(move |callbacks: Option<&EngineCallbacks>, context: JobContext| {
            let Some(callbacks) = callbacks else {
                tracing::warn!("simulated read completed without callbacks");
                return;
            };
            let result: EngineResult<Box<dyn RawFrame>> =
                if task_core.config.fail_read_at == Some(index) {
                    Err(EngineError::failed("ReadFrame"))
                } else {
                    Ok(Box::new(SimRawFrame {
                        index,
                        format: ResourceFormat::RgbaU8,
                        scale: ResolutionScale::Full,
                        core: Arc::clone(&task_core),
                        queue: task_queue,
                    }))
                };
            callbacks.read_complete(context, result);
        });
        core.enqueue(&queue, task, context)
    }
}

struct SimRawFrame {
    index: u64,
    format: ResourceFormat,
    scale: ResolutionScale,
    core: Arc<CodecCore>,
    queue: Sender<Message>,
}

impl RawFrame for SimRawFrame {
    fn set_resource_format(&mut self, format: ResourceFormat) -> EngineResult<()> {
        self.format = format;
        Ok(())
    }

    fn set_resolution_scale(&mut self, scale: ResolutionScale) -> EngineResult<()> {
        self.scale = scale;
        Ok(())
    }

    fn attributes(&self) -> EngineResult<Vec<(String, String)>> {
        Ok(vec![
            ("frame_index".into(), self.index.to_string()),
            ("iso".into(), "800".into()),
        ])
    }

    fn create_job_decode_and_process(self: Box<Self>) -> EngineResult<Box<dyn Job>> {
        Ok(Box::new(ProcessJob { frame: *self }))
    }
}

struct ProcessJob {
    frame: SimRawFrame,
}

impl Job for ProcessJob {
    fn submit(self: Box<Self>, context: JobContext) -> Result<(), SubmitError> {
        let SimRawFrame {
            index,
            format,
            scale,
            core,
            queue,
        } = self.frame;
        core.engine.process_jobs.fetch_add(1, Ordering::AcqRel);

        let task_core = Arc::clone(&core);
        let task: Task = Box::new(move |callbacks: Option<&EngineCallbacks>, context: JobContext| {
            let Some(callbacks) = callbacks else {
                tracing::warn!("simulated process completed without callbacks");
                return;
            };
            let result: EngineResult<Box<dyn ProcessedImage>> =
                if task_core.config.fail_process_at == Some(index) {
                    Err(EngineError::failed("DecodeAndProcessFrame"))
                } else {
                    Ok(Box::new(SimImage::render(&task_core, index, format, scale)))
                };
            callbacks.process_complete(context, result);
        });
        core.enqueue(&queue, task, context)
    }
}

struct SimImage {
    width: u32,
    height: u32,
    format: ResourceFormat,
    resource_type: ResourceType,
    resource: ResourceHandle,
    data: Bytes,
    engine: Arc<EngineShared>,
}

impl SimImage {
    fn render(
        core: &CodecCore,
        index: u64,
        format: ResourceFormat,
        scale: ResolutionScale,
    ) -> Self {
        let clip = &core.config.clip;
        let (width, height) = scale.apply(clip.width, clip.height);
        let size = width as usize * height as usize * format.bytes_per_pixel();
        let data = Bytes::from(vec![pixel_value(index); size]);
        let resource_type = core.resource_type();
        let resource = core.engine.allocate(SimResource {
            resource_type,
            data: data.clone(),
            readback: false,
        });
        core.engine.images_created.fetch_add(1, Ordering::AcqRel);
        Self {
            width,
            height,
            format,
            resource_type,
            resource,
            data,
            engine: Arc::clone(&core.engine),
        }
    }
}

/// Byte every pixel of frame `index` is filled with.
pub fn pixel_value(index: u64) -> u8 {
    (index % 251) as u8 + 1
}

impl ProcessedImage for SimImage {
    fn width(&self) -> EngineResult<u32> {
        Ok(self.width)
    }

    fn height(&self) -> EngineResult<u32> {
        Ok(self.height)
    }

    fn resource_format(&self) -> EngineResult<ResourceFormat> {
        Ok(self.format)
    }

    fn resource_type(&self) -> EngineResult<ResourceType> {
        Ok(self.resource_type)
    }

    fn resource(&self) -> EngineResult<ResourceHandle> {
        Ok(self.resource)
    }

    fn resource_size_bytes(&self) -> EngineResult<u32> {
        u32::try_from(self.data.len()).map_err(|_| EngineError::failed("GetResourceSizeBytes"))
    }

    fn cpu_data(&self) -> Option<Bytes> {
        self.resource_type.is_host().then(|| self.data.clone())
    }

    fn release(self: Box<Self>) {
        self.engine.resources.lock().remove(&self.resource.0);
        self.engine.images_released.fetch_add(1, Ordering::AcqRel);
    }
}
