//! BRAW frame reader.
//!
//! [`BrawReader`] drives the engine's read → decode+process job chain one
//! frame at a time and turns the completions into timestamped frames pushed
//! into a [`FrameSink`].
//!
//! # Job chain
//!
//! `load` submits a read job for frame 0. Each read completion submits a
//! decode+process job for the same frame; each process completion delivers
//! the frame and, while playback is running and no seek is outstanding,
//! submits the read for the next frame. A rejected frame, a paused reader or
//! a failed job leaves the chain idle until `play` or a seek restarts it.
//!
//! # Seeks
//!
//! A seek submits a read job tagged with the seek id and bumps the
//! [`SeekCoordinator`], which makes every job of the previous chain stale.
//! The first frame delivered after a seek is preceded by a reset marker.
//!
//! # Locking
//!
//! Frame delivery and teardown serialize on the delivery mutex, so a frame
//! is never pushed after `unload` has started tearing the session down.
//! Reader state sits behind its own short-held mutex so `seek_to`, `play`
//! and `pause` never wait on a consumer that is applying backpressure.
//! Lock order is delivery, then state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::buffer_pool::{NativeBufferDescriptor, NativeBufferPool, SessionToken};
use crate::device::{select_and_bind, PipelineRequest, SelectedDevice};
use crate::diagnostics::{ReaderStats, StatsSnapshot};
use crate::engine::{
    Clip, ClipAudio, ClipGeometry, Codec, DecodeEngine, EngineCallbacks, InteropKind,
    PipelineKind, ProcessedImage, RawFrame, ResolutionScale, ResourceFormat, ResourceHandle,
    ResourceType, SubmitError,
};
use crate::error::{EngineError, EngineResult, OptionsError, ReaderError};
use crate::interop::{DevicePointerInterop, GlTextureInterop, InteropBackend, TextureImporter};
use crate::jobs::{JobContext, JobLedger, SeekTag};
use crate::options::ReaderOptions;
use crate::seek::{
    resolve_target, SeekCoordinator, SeekFlags, SeekOutcome, SeekResolution, SeekTarget,
};
use crate::video::{
    AudioStreamInfo, CpuFrame, DecodedFrame, FrameReader, FrameSink, MediaInfo, MediaStatus,
    PixelFormat, PlaybackState, ReaderEvent, SampleFormat, VideoFrame, VideoStreamInfo,
};

/// Seek ids handed out when the caller passes `0`.
const INTERNAL_SEEK_ID_BASE: u64 = 1 << 63;

// =========================================================================
// Media info
// =========================================================================

/// Builds the stream description published on load.
pub fn media_info_for(geometry: &ClipGeometry, audio: Option<ClipAudio>) -> MediaInfo {
    let video_duration = if geometry.frame_rate > 0.0 {
        (geometry.frame_count as f64 * 1000.0 / geometry.frame_rate as f64) as i64
    } else {
        0
    };
    let video = VideoStreamInfo {
        index: 0,
        codec: "braw".into(),
        width: geometry.width,
        height: geometry.height,
        frame_rate: geometry.frame_rate,
        frames: geometry.frame_count,
        duration: video_duration,
    };

    let audio: Vec<AudioStreamInfo> = audio
        .into_iter()
        .map(|a| AudioStreamInfo {
            index: 1,
            codec: "pcm".into(),
            channels: a.channels,
            sample_rate: a.sample_rate,
            format: SampleFormat::from_bit_depth(a.bit_depth),
            frames: a.sample_count,
            duration: if a.sample_rate > 0 {
                (a.sample_count as u128 * 1000 / a.sample_rate as u128) as i64
            } else {
                0
            },
        })
        .collect();

    let duration = audio
        .iter()
        .map(|a| a.duration)
        .fold(video.duration, i64::max);
    MediaInfo {
        format: "braw".into(),
        streams: 1 + audio.len() as u32,
        duration,
        video: vec![video],
        audio,
    }
}

// =========================================================================
// Session
// =========================================================================

/// Per-session values read on every completion.
#[derive(Debug, Clone, Copy)]
struct SessionParams {
    frame_count: u64,
    /// Video duration in milliseconds
    duration_ms: i64,
    resource_format: ResourceFormat,
    pixel_format: PixelFormat,
    scale: ResolutionScale,
    copy: bool,
    continue_at_end: bool,
}

impl SessionParams {
    fn last_index(&self) -> u64 {
        self.frame_count.saturating_sub(1)
    }

    /// Presentation time of `index` in seconds.
    fn timestamp(&self, index: u64) -> f64 {
        self.duration_ms as f64 / 1000.0 * index as f64 / self.frame_count as f64
    }

    fn frame_duration(&self) -> f64 {
        self.duration_ms as f64 / 1000.0 / self.frame_count as f64
    }

    fn position_ms(&self, index: u64) -> i64 {
        (self.duration_ms as i128 * index as i128 / self.frame_count as i128) as i64
    }
}

struct Session {
    codec: Arc<dyn Codec>,
    clip: Arc<dyn Clip>,
    device: SelectedDevice,
    media_info: MediaInfo,
    params: SessionParams,
    pool: NativeBufferPool,
    token: SessionToken,
}

struct ReaderState {
    status: MediaStatus,
    playback: PlaybackState,
    session: Option<Arc<Session>>,
    /// No playback job is in flight
    chain_idle: bool,
    /// Frame the chain resumes at
    next_index: u64,
    /// Last delivered frame
    current_index: u64,
    /// End-of-stream marker already pushed for this session
    eos_sent: bool,
}

impl ReaderState {
    fn new() -> Self {
        Self {
            status: MediaStatus::Unloaded,
            playback: PlaybackState::Stopped,
            session: None,
            chain_idle: true,
            next_index: 0,
            current_index: 0,
            eos_sent: false,
        }
    }
}

/// What a process completion does once its frame is delivered.
enum Continuation {
    /// Submit the next read
    Next { index: u64, epoch: u64 },
    /// Leave the chain idle
    Idle,
    /// Last frame: push end of stream, then unload unless looping is requested
    End { unload: bool },
}

// =========================================================================
// Reader
// =========================================================================

struct ReaderInner {
    engine: Arc<dyn DecodeEngine>,
    sink: Arc<dyn FrameSink>,
    options: Mutex<ReaderOptions>,
    texture_importer: Mutex<Option<Arc<dyn TextureImporter>>>,
    /// True from a successful load until unload starts
    active: AtomicBool,
    delivery: Mutex<()>,
    state: Mutex<ReaderState>,
    seeks: SeekCoordinator,
    next_internal_seek: AtomicU64,
    ledger: Arc<JobLedger>,
    stats: Arc<ReaderStats>,
    events_tx: Sender<ReaderEvent>,
    events_rx: Receiver<ReaderEvent>,
}

/// Frame reader for Blackmagic RAW clips.
pub struct BrawReader {
    inner: Arc<ReaderInner>,
}

impl BrawReader {
    /// Registered decoder name.
    pub const NAME: &'static str = "BRAW";

    pub fn new(
        engine: Arc<dyn DecodeEngine>,
        sink: Arc<dyn FrameSink>,
        options: ReaderOptions,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            inner: Arc::new(ReaderInner {
                engine,
                sink,
                options: Mutex::new(options),
                texture_importer: Mutex::new(None),
                active: AtomicBool::new(false),
                delivery: Mutex::new(()),
                state: Mutex::new(ReaderState::new()),
                seeks: SeekCoordinator::new(),
                next_internal_seek: AtomicU64::new(INTERNAL_SEEK_ID_BASE),
                ledger: JobLedger::new(),
                stats: Arc::new(ReaderStats::new()),
                events_tx,
                events_rx,
            }),
        }
    }

    /// Accepts an empty URL, a URL without extension, or a `.braw` file.
    pub fn supports_url(url: &str) -> bool {
        if url.is_empty() {
            return true;
        }
        match url.rsplit_once('.') {
            Some((_, ext)) => ext.eq_ignore_ascii_case("braw"),
            None => true,
        }
    }

    /// Applies a configuration option. Takes effect on the next load.
    pub fn set_option(&self, key: &str, value: &str) -> Result<(), OptionsError> {
        self.inner.options.lock().set(key, value)
    }

    pub fn options(&self) -> ReaderOptions {
        self.inner.options.lock().clone()
    }

    /// Installs the GL texture capability used with `interop=opengl`.
    pub fn set_texture_importer(&self, importer: Arc<dyn TextureImporter>) {
        *self.inner.texture_importer.lock() = Some(importer);
    }

    /// Loads a clip, returning why it failed.
    pub fn try_load(&self, url: &str) -> Result<(), ReaderError> {
        self.inner.load(url)
    }

    /// Tears the session down. Returns `false` if nothing was loaded.
    pub fn unload(&self) -> bool {
        self.inner.unload()
    }

    /// Seeks to `target`; completion is published as
    /// [`ReaderEvent::SeekCompleted`] under `seek_id`.
    pub fn seek_to(&self, target: i64, flags: SeekFlags, seek_id: u64) -> bool {
        self.inner.seek_to(target, flags, seek_id)
    }

    /// Resumes the read chain.
    pub fn play(&self) -> bool {
        self.inner.play()
    }

    /// Stops the read chain after the frame in flight.
    pub fn pause(&self) -> bool {
        self.inner.set_playback(PlaybackState::Paused)
    }

    /// Stops playback and unloads the clip.
    pub fn stop(&self) -> bool {
        self.inner.unload()
    }

    pub fn status(&self) -> MediaStatus {
        self.inner.state.lock().status
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.inner.state.lock().playback
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        let state = self.inner.state.lock();
        state.session.as_ref().map(|s| s.media_info.clone())
    }

    /// Pipeline and device name of the loaded session.
    pub fn selected_device(&self) -> Option<(PipelineKind, String)> {
        let state = self.inner.state.lock();
        state
            .session
            .as_ref()
            .map(|s| (s.device.candidate.pipeline, s.device.name.clone()))
    }

    /// Receiver for reader events. Receivers share one queue.
    pub fn events(&self) -> Receiver<ReaderEvent> {
        self.inner.events_rx.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Job context accounting across all sessions of this reader.
    pub fn ledger(&self) -> Arc<JobLedger> {
        Arc::clone(&self.inner.ledger)
    }
}

impl FrameReader for BrawReader {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_supported(&self, url: &str) -> bool {
        Self::supports_url(url)
    }

    fn load(&self, url: &str) -> bool {
        match self.inner.load(url) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("failed to load '{}': {}", url, e);
                false
            }
        }
    }

    fn unload(&self) -> bool {
        self.inner.unload()
    }

    fn seek_to(&self, target: i64, flags: SeekFlags, seek_id: u64) -> bool {
        self.inner.seek_to(target, flags, seek_id)
    }

    fn buffered(&self) -> i64 {
        0
    }
}

impl Drop for BrawReader {
    fn drop(&mut self) {
        self.inner.unload();
    }
}

// =========================================================================
// Lifecycle
// =========================================================================

impl ReaderInner {
    fn emit(&self, event: ReaderEvent) {
        tracing::trace!("reader event: {:?}", event);
        let _ = self.events_tx.try_send(event);
    }

    fn set_status(&self, state: &mut ReaderState, status: MediaStatus) {
        if state.status != status {
            tracing::debug!("media status {:?} -> {:?}", state.status, status);
            state.status = status;
            self.emit(ReaderEvent::StatusChanged(status));
        }
    }

    /// Session if the reader is loaded and not tearing down.
    fn live_session(&self) -> Option<Arc<Session>> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        self.state.lock().session.clone()
    }

    fn load(self: &Arc<Self>, url: &str) -> Result<(), ReaderError> {
        let session = {
            let mut state = self.state.lock();
            if state.session.is_some() || self.active.load(Ordering::Acquire) {
                return Err(ReaderError::AlreadyLoaded);
            }
            self.set_status(&mut state, MediaStatus::Loading);

            let options = self.options.lock().clone();
            let session = match self.open_session(url, &options) {
                Ok(session) => Arc::new(session),
                Err(e) => {
                    self.set_status(&mut state, MediaStatus::Unloaded);
                    return Err(e);
                }
            };

            self.sink.reset();
            state.session = Some(Arc::clone(&session));
            state.playback = PlaybackState::Running;
            state.chain_idle = false;
            state.next_index = 0;
            state.current_index = 0;
            state.eos_sent = false;
            self.active.store(true, Ordering::Release);

            self.emit(ReaderEvent::MediaInfoChanged(session.media_info.clone()));
            self.set_status(&mut state, MediaStatus::Loaded);
            self.emit(ReaderEvent::DecoderSelected {
                name: BrawReader::NAME,
                pipeline: session.device.candidate.pipeline,
                device: session.device.name.clone(),
            });
            session
        };

        tracing::info!(
            "loaded '{}': {}x{} @ {} fps, {} frames on {} ({})",
            url,
            session.media_info.video[0].width,
            session.media_info.video[0].height,
            session.media_info.video[0].frame_rate,
            session.params.frame_count,
            session.device.candidate.pipeline.name(),
            session.device.name
        );
        self.submit_read(&session, 0, SeekTag::NONE, self.seeks.epoch());
        Ok(())
    }

    fn open_session(
        self: &Arc<Self>,
        url: &str,
        options: &ReaderOptions,
    ) -> Result<Session, ReaderError> {
        let codec = self.engine.create_codec()?;
        if options.threads > 0 {
            if let Err(e) = codec.set_cpu_threads(options.threads) {
                tracing::warn!("failed to set {} decode threads: {}", options.threads, e);
            }
        }

        let request = PipelineRequest {
            pipeline: options.pipeline,
            interop: options.interop,
            device_filter: options.device.clone(),
        };
        let device = select_and_bind(codec.as_ref(), &request)?;

        let clip = codec
            .open_clip(url)
            .map_err(|source| ReaderError::OpenFailed {
                locator: url.to_string(),
                source,
            })?;
        let geometry = clip.geometry()?;
        if geometry.frame_count == 0 {
            return Err(ReaderError::EmptyClip);
        }
        let media_info = media_info_for(&geometry, clip.audio());

        let params = SessionParams {
            frame_count: geometry.frame_count,
            duration_ms: media_info.video[0].duration,
            resource_format: options.resource_format(),
            pixel_format: options.format,
            scale: options.size.resolve(geometry.width, geometry.height),
            copy: options.copy,
            continue_at_end: options.continue_at_end,
        };

        let token = SessionToken::new();
        let pool = NativeBufferPool::new(
            device.device.context(),
            device.device.resource_manager(),
            self.interop_backends(&device),
            token.guard(),
            Arc::clone(&self.stats),
        );

        codec.set_callbacks(self.callbacks())?;

        Ok(Session {
            codec,
            clip,
            device,
            media_info,
            params,
            pool,
            token,
        })
    }

    fn interop_backends(&self, device: &SelectedDevice) -> Vec<Arc<dyn InteropBackend>> {
        let mut backends: Vec<Arc<dyn InteropBackend>> = Vec::new();
        if device.candidate.interop == InteropKind::OpenGl {
            match self.texture_importer.lock().clone() {
                Some(importer) => backends.push(Arc::new(GlTextureInterop::new(importer))),
                None => tracing::warn!("OpenGL interop requested without a texture importer"),
            }
        }
        if matches!(
            device.candidate.pipeline,
            PipelineKind::Cuda | PipelineKind::OpenCl
        ) {
            backends.push(Arc::new(DevicePointerInterop));
        }
        backends
    }

    fn callbacks(self: &Arc<Self>) -> EngineCallbacks {
        let read = Arc::downgrade(self);
        let process = Arc::downgrade(self);
        EngineCallbacks::new(
            move |context, result| match read.upgrade() {
                Some(inner) => inner.on_read_complete(context, result),
                None => tracing::debug!("read completed after reader was dropped"),
            },
            move |context, result| match process.upgrade() {
                Some(inner) => inner.on_process_complete(context, result),
                None => {
                    if let Ok(image) = result {
                        image.release();
                    }
                }
            },
        )
    }

    fn unload(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        // a producer blocked in push holds the delivery lock
        self.sink.unblock();

        let codec = {
            let _delivery = self.delivery.lock();
            let mut state = self.state.lock();
            self.set_status(&mut state, MediaStatus::Unloading);
            state.session.as_ref().map(|s| Arc::clone(&s.codec))
        };
        if let Some(codec) = codec {
            codec.flush_jobs();
        }

        let (session, eos_sent) = {
            let _delivery = self.delivery.lock();
            let mut state = self.state.lock();
            state.playback = PlaybackState::Stopped;
            state.chain_idle = true;
            (state.session.take(), state.eos_sent)
        };
        self.seeks.reset();

        if let Some(session) = &session {
            session.pool.shutdown(&session.token);
        }
        if !eos_sent {
            self.sink.push(VideoFrame::eos());
        }
        {
            let mut state = self.state.lock();
            self.set_status(&mut state, MediaStatus::Unloaded);
        }
        tracing::info!(
            "unloaded; {} job contexts outstanding",
            self.ledger.outstanding()
        );
        drop(session);
        true
    }

    /// Unloads on a separate thread. Used from engine callbacks, where a
    /// synchronous flush would wait for the calling callback itself.
    fn unload_detached(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("braw-unload".into())
            .spawn(move || {
                inner.unload();
            });
        if let Err(e) = spawned {
            tracing::error!("failed to spawn unload thread: {}", e);
        }
    }

    fn set_playback(&self, playback: PlaybackState) -> bool {
        let mut state = self.state.lock();
        if state.session.is_none() {
            return false;
        }
        state.playback = playback;
        true
    }

    fn play(self: &Arc<Self>) -> bool {
        let restart = {
            let mut state = self.state.lock();
            let Some(session) = state.session.clone() else {
                return false;
            };
            state.playback = PlaybackState::Running;
            let restart = state.chain_idle
                && state.status == MediaStatus::Loaded
                && !self.seeks.is_seeking()
                && self.active.load(Ordering::Acquire);
            if restart {
                state.chain_idle = false;
                Some((session, state.next_index))
            } else {
                None
            }
        };
        if let Some((session, index)) = restart {
            tracing::debug!("resuming at frame {}", index);
            self.submit_read(&session, index, SeekTag::NONE, self.seeks.epoch());
        }
        true
    }

    fn seek_to(self: &Arc<Self>, target: i64, flags: SeekFlags, seek_id: u64) -> bool {
        let seek_id = if seek_id == 0 {
            self.next_internal_seek.fetch_add(1, Ordering::Relaxed)
        } else {
            seek_id
        };

        let (session, request) = {
            let mut state = self.state.lock();
            let Some(session) = state.session.clone() else {
                tracing::debug!("seek {} ignored: nothing loaded", seek_id);
                return false;
            };
            if !self.active.load(Ordering::Acquire) {
                return false;
            }
            let params = session.params;
            let resolved = resolve_target(
                target,
                flags,
                state.current_index,
                params.frame_count,
                params.duration_ms,
            );
            let index = match resolved {
                SeekTarget::Current => {
                    let position_ms = params.position_ms(state.current_index);
                    drop(state);
                    self.report_seek(seek_id, SeekOutcome::Completed { position_ms });
                    return true;
                }
                SeekTarget::Index(index) => index,
            };

            let request = self.seeks.begin(index, seek_id, flags.wait_for_decoded_frame);
            state.chain_idle = false;
            state.eos_sent = false;
            if state.status == MediaStatus::AtEnd {
                self.set_status(&mut state, MediaStatus::Loaded);
            }
            (session, request)
        };

        tracing::debug!(
            "seek {} to {} ({:?}) -> frame {}",
            seek_id,
            target,
            flags.mode,
            request.target_index
        );
        let tag = SeekTag {
            seek_id,
            wait_frame: request.wait_for_decoded_frame,
        };
        if self
            .start_read(&session, request.target_index, tag, request.epoch)
            .is_ok()
        {
            return true;
        }

        // the seek never reached the engine: withdraw it, keeping the epoch
        // so the chain it replaced stays stale
        self.seeks.cancel();
        {
            let mut state = self.state.lock();
            if request.epoch == self.seeks.epoch() {
                state.chain_idle = true;
            }
        }
        self.report_seek(seek_id, SeekOutcome::Failed);
        false
    }

    // =====================================================================
    // Job chain
    // =====================================================================

    /// Submits a read job. On failure the job is abandoned as if it had
    /// failed in the engine.
    fn submit_read(&self, session: &Session, index: u64, tag: SeekTag, epoch: u64) -> bool {
        match self.start_read(session, index, tag, epoch) {
            Ok(()) => true,
            Err(context) => {
                self.abandon(&context, tag.is_seek());
                false
            }
        }
    }

    /// Creates and submits a read job, handing the context back if the job
    /// never reached the engine.
    fn start_read(
        &self,
        session: &Session,
        index: u64,
        tag: SeekTag,
        epoch: u64,
    ) -> Result<(), JobContext> {
        let context = self.ledger.issue(index, tag, epoch);
        let job = match session.clip.create_job_read_frame(index) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("failed to create read job for frame {}: {}", index, e);
                self.stats.record_failed_job();
                return Err(context);
            }
        };
        match job.submit(context) {
            Ok(()) => {
                tracing::trace!("submitted read of frame {}", index);
                Ok(())
            }
            Err(SubmitError { error, context }) => {
                tracing::warn!("failed to submit read of frame {}: {}", index, error);
                self.stats.record_failed_job();
                Err(context)
            }
        }
    }

    /// Gives up on a job chain. `seek_pending` is true if the job still
    /// holds an unresolved seek.
    fn abandon(&self, context: &JobContext, seek_pending: bool) {
        if seek_pending {
            match self.seeks.resolve(context.epoch) {
                SeekResolution::Superseded => self.report_superseded(context.seek_id),
                SeekResolution::Current => self.report_seek(context.seek_id, SeekOutcome::Failed),
            }
        }
        // no job of the current epoch is left in flight
        let mut state = self.state.lock();
        if context.epoch == self.seeks.epoch() {
            let last = state
                .session
                .as_ref()
                .map(|s| s.params.last_index())
                .unwrap_or(0);
            state.chain_idle = true;
            state.next_index = (context.frame_index + 1).min(last);
        }
    }

    fn report_seek(&self, seek_id: u64, outcome: SeekOutcome) {
        if matches!(outcome, SeekOutcome::Completed { .. }) {
            self.stats.record_seek_completed();
        }
        tracing::debug!("seek {} finished: {:?}", seek_id, outcome);
        self.emit(ReaderEvent::SeekCompleted { seek_id, outcome });
    }

    /// Counts a seek overtaken by a newer one. No event is published.
    fn report_superseded(&self, seek_id: u64) {
        self.stats.record_seek_superseded();
        self.stats.record_stale_drop();
        tracing::debug!("seek {} superseded", seek_id);
    }

    fn on_read_complete(
        self: &Arc<Self>,
        mut context: JobContext,
        result: EngineResult<Box<dyn RawFrame>>,
    ) {
        let Some(session) = self.live_session() else {
            tracing::debug!("dropping read of frame {}: unloading", context.frame_index);
            return;
        };
        let tag = context.seek_tag();
        let index = context.frame_index;

        if tag.is_seek() && !tag.wait_frame {
            match self.seeks.resolve(context.epoch) {
                SeekResolution::Superseded => {
                    self.report_superseded(tag.seek_id);
                    return;
                }
                SeekResolution::Current => {
                    let outcome = if result.is_ok() {
                        SeekOutcome::Completed {
                            position_ms: session.params.position_ms(index),
                        }
                    } else {
                        SeekOutcome::Failed
                    };
                    self.report_seek(tag.seek_id, outcome);
                }
            }
        } else if !tag.is_seek() && self.seeks.is_stale_playback(context.epoch) {
            tracing::debug!("dropping stale read of frame {}", index);
            self.stats.record_stale_drop();
            return;
        }
        let seek_pending = tag.is_seek() && tag.wait_frame;

        let mut raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("failed to read frame {}: {}", index, e);
                self.stats.record_failed_job();
                self.abandon(&context, seek_pending);
                return;
            }
        };

        let params = session.params;
        if let Err(e) = configure(raw.as_mut(), &params) {
            tracing::warn!("failed to configure frame {}: {}", index, e);
            self.stats.record_failed_job();
            self.abandon(&context, seek_pending);
            return;
        }
        match raw.attributes() {
            Ok(attributes) => context.attributes = attributes,
            Err(e) => tracing::debug!("no attributes for frame {}: {}", index, e),
        }

        let job = match raw.create_job_decode_and_process() {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("failed to create process job for frame {}: {}", index, e);
                self.stats.record_failed_job();
                self.abandon(&context, seek_pending);
                return;
            }
        };
        if let Err(SubmitError { error, context }) = job.submit(context.successor()) {
            tracing::warn!("failed to submit process job for frame {}: {}", index, error);
            self.stats.record_failed_job();
            self.abandon(&context, seek_pending);
        }
    }

    fn on_process_complete(
        self: &Arc<Self>,
        context: JobContext,
        result: EngineResult<Box<dyn ProcessedImage>>,
    ) {
        let delivery = self.delivery.lock();
        let Some(session) = self.live_session() else {
            tracing::debug!("dropping frame {}: unloading", context.frame_index);
            if let Ok(image) = result {
                image.release();
            }
            return;
        };
        let tag = context.seek_tag();
        let index = context.frame_index;
        let params = session.params;

        let mut completed_seek = None;
        if tag.is_seek() && tag.wait_frame {
            match self.seeks.resolve(context.epoch) {
                SeekResolution::Superseded => {
                    if let Ok(image) = result {
                        image.release();
                    }
                    self.report_superseded(tag.seek_id);
                    return;
                }
                SeekResolution::Current => completed_seek = Some(tag.seek_id),
            }
        } else if self.seeks.is_stale_playback(context.epoch) {
            tracing::debug!("dropping stale frame {}", index);
            self.stats.record_stale_drop();
            if let Ok(image) = result {
                image.release();
            }
            return;
        }

        let image = match result {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("failed to decode frame {}: {}", index, e);
                self.stats.record_failed_job();
                if let Some(seek_id) = completed_seek {
                    self.report_seek(seek_id, SeekOutcome::Failed);
                }
                self.abandon(&context, false);
                return;
            }
        };

        let frame = match self.build_frame(&session, &context, image) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("failed to inspect frame {}: {}", index, e);
                self.stats.record_failed_job();
                if let Some(seek_id) = completed_seek {
                    self.report_seek(seek_id, SeekOutcome::Failed);
                }
                self.abandon(&context, false);
                return;
            }
        };

        let mut accepted = true;
        if let Some(frame) = frame {
            if tag.is_seek() {
                self.sink
                    .push(VideoFrame::reset(params.pixel_format, frame.timestamp));
            }
            accepted = self.sink.push(frame);
            if accepted {
                self.stats.record_frame_delivered();
                tracing::trace!("delivered frame {}", index);
            } else {
                self.stats.record_frame_rejected();
                tracing::debug!("sink rejected frame {}", index);
            }
        }
        if let Some(seek_id) = completed_seek {
            self.report_seek(
                seek_id,
                SeekOutcome::Completed {
                    position_ms: params.position_ms(index),
                },
            );
        }

        let continuation = {
            let mut state = self.state.lock();
            if context.epoch != self.seeks.epoch() || !self.active.load(Ordering::Acquire) {
                // a newer seek owns the chain now
                return;
            }
            state.current_index = index;
            if index >= params.last_index() {
                state.chain_idle = true;
                state.next_index = params.last_index();
                if self.seeks.is_seeking() {
                    Continuation::Idle
                } else {
                    state.eos_sent = true;
                    if params.continue_at_end {
                        self.set_status(&mut state, MediaStatus::AtEnd);
                    }
                    Continuation::End {
                        unload: !params.continue_at_end,
                    }
                }
            } else if accepted
                && state.playback == PlaybackState::Running
                && state.status == MediaStatus::Loaded
                && !self.seeks.is_seeking()
            {
                state.chain_idle = false;
                state.next_index = index + 1;
                Continuation::Next {
                    index: index + 1,
                    epoch: context.epoch,
                }
            } else {
                state.chain_idle = true;
                state.next_index = if accepted { index + 1 } else { index };
                Continuation::Idle
            }
        };

        match continuation {
            Continuation::Next { index, epoch } => {
                self.submit_read(&session, index, SeekTag::NONE, epoch);
            }
            Continuation::Idle => {}
            Continuation::End { unload } => {
                tracing::debug!("end of clip after frame {}", index);
                self.sink.push(VideoFrame::eos());
                drop(delivery);
                if unload {
                    self.unload_detached();
                }
            }
        }
    }

    /// Wraps a processed image into a frame. `Ok(None)` drops the frame but
    /// keeps the chain going.
    fn build_frame(
        &self,
        session: &Session,
        context: &JobContext,
        image: Box<dyn ProcessedImage>,
    ) -> EngineResult<Option<VideoFrame>> {
        let info = match ImageInfo::read(image.as_ref()) {
            Ok(info) => info,
            Err(e) => {
                image.release();
                return Err(e);
            }
        };
        let params = session.params;
        let index = context.frame_index;
        let format = PixelFormat::from_resource(info.format);
        if format != params.pixel_format {
            tracing::trace!("frame {} delivered as {:?}", index, format);
        }

        let payload = if info.resource_type.is_host() {
            match image.cpu_data() {
                Some(data) => {
                    image.release();
                    Some(DecodedFrame::Cpu(CpuFrame::packed(
                        format,
                        info.width,
                        info.height,
                        data,
                    )))
                }
                None => self.wrap_native(session, &info, image, true),
            }
        } else {
            self.wrap_native(session, &info, image, params.copy)
        };

        Ok(payload.map(|frame| VideoFrame {
            width: info.width,
            height: info.height,
            format,
            timestamp: params.timestamp(index),
            duration: params.frame_duration(),
            frame,
            attributes: context.attributes.clone(),
        }))
    }

    /// Hands the image to the buffer pool. With `copy` the pixels are mapped
    /// to host memory and the image is released right away.
    fn wrap_native(
        &self,
        session: &Session,
        info: &ImageInfo,
        image: Box<dyn ProcessedImage>,
        copy: bool,
    ) -> Option<DecodedFrame> {
        let descriptor = NativeBufferDescriptor {
            resource: info.resource,
            resource_type: info.resource_type,
            resource_format: info.format,
            size_bytes: info.size_bytes,
            width: info.width,
            height: info.height,
        };
        let guard = session.token.guard();
        let buffer = session.pool.get_buffer(descriptor, move || {
            if guard.run_if_alive(|| image.release()).is_none() {
                tracing::debug!("session closed before native buffer release");
            }
        });
        if !copy {
            return Some(DecodedFrame::Native(buffer));
        }
        match buffer.to_cpu_frame() {
            Ok(frame) => Some(DecodedFrame::Cpu(frame)),
            Err(e) => {
                tracing::warn!("dropping {:?} frame: {}", info.resource_type, e);
                None
            }
        }
    }
}

fn configure(raw: &mut dyn RawFrame, params: &SessionParams) -> EngineResult<()> {
    raw.set_resource_format(params.resource_format)?;
    if params.scale != ResolutionScale::Full {
        raw.set_resolution_scale(params.scale)?;
    }
    Ok(())
}

/// Accessor values of a processed image.
struct ImageInfo {
    width: u32,
    height: u32,
    format: ResourceFormat,
    resource_type: ResourceType,
    resource: ResourceHandle,
    size_bytes: usize,
}

impl ImageInfo {
    fn read(image: &dyn ProcessedImage) -> EngineResult<Self> {
        let size_bytes = usize::try_from(image.resource_size_bytes()?)
            .map_err(|_| EngineError::failed("GetResourceSizeBytes"))?;
        Ok(Self {
            width: image.width()?,
            height: image.height()?,
            format: image.resource_format()?,
            resource_type: image.resource_type()?,
            resource: image.resource()?,
            size_bytes,
        })
    }
}
