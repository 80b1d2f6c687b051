//! Native buffer pool.
//!
//! Wraps engine-resident processed images in reference-counted
//! [`NativeBuffer`]s that downstream consumers can hold past the callback
//! that produced them, and maps them to host memory on demand.
//!
//! # Host mapping
//!
//! [`NativeBuffer::map_host`] tries, in order:
//!
//! 1. the resource's own host pointer;
//! 2. a copy into the session's readback resource, allocated on first use
//!    as CPU-readable/GPU-writable on the resource's own backend;
//! 3. if that resource has no host pointer, a CPU-readable/CPU-writable
//!    host buffer instead.
//!
//! [`NativeBuffer::map`] additionally falls back to the pool's
//! [`InteropBackend`]s when no host mapping is possible.
//!
//! # Lifetime
//!
//! Each buffer runs its cleanup exactly once, on whichever thread drops the
//! last reference. Engine objects may already be gone by then, so both the
//! cleanup built by the reader and every mapping attempt go through a
//! [`LivenessGuard`] for the load session.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::diagnostics::ReaderStats;
use crate::engine::{
    DeviceContext, ResourceFormat, ResourceHandle, ResourceManager, ResourceType, ResourceUsage,
};
use crate::error::{BufferError, EngineError};
use crate::interop::{InteropBackend, InteropMapping, InteropRequest};
use crate::video::{CpuFrame, PixelFormat};

// =========================================================================
// Session liveness
// =========================================================================

/// Owned by a load session; alive until the session ends.
#[derive(Debug)]
pub struct SessionToken(Arc<RwLock<bool>>);

impl SessionToken {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(true)))
    }

    pub fn guard(&self) -> LivenessGuard {
        LivenessGuard(Arc::downgrade(&self.0))
    }

    /// Marks the session dead. Waits for guarded sections in progress.
    pub fn end(&self) {
        *self.0.write() = false;
    }

    pub fn is_alive(&self) -> bool {
        *self.0.read()
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak handle to a [`SessionToken`].
#[derive(Debug, Clone)]
pub struct LivenessGuard(Weak<RwLock<bool>>);

impl LivenessGuard {
    /// Runs `f` if the session is alive, holding off [`SessionToken::end`]
    /// until `f` returns.
    pub fn run_if_alive<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let flag = self.0.upgrade()?;
        let alive = flag.read();
        if *alive {
            Some(f())
        } else {
            None
        }
    }

    pub fn is_alive(&self) -> bool {
        self.0.upgrade().map(|flag| *flag.read()).unwrap_or(false)
    }
}

// =========================================================================
// Buffers
// =========================================================================

/// Engine-native resource handed to [`NativeBufferPool::get_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBufferDescriptor {
    pub resource: ResourceHandle,
    pub resource_type: ResourceType,
    pub resource_format: ResourceFormat,
    pub size_bytes: usize,
    pub width: u32,
    pub height: u32,
}

impl NativeBufferDescriptor {
    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::from_resource(self.resource_format)
    }
}

/// How a host mapping was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingPath {
    /// The resource's own host pointer
    Direct,
    /// Copied into the readback resource on the resource's backend
    Readback,
    /// Copied into a host-only readback buffer
    HostReadback,
}

/// Host-readable pixels of a native buffer.
#[derive(Debug, Clone)]
pub struct HostMapping {
    pub data: Bytes,
    pub stride: usize,
    pub path: MappingPath,
}

/// Any usable view of a native buffer.
#[derive(Debug, Clone)]
pub enum BufferMapping {
    Host(HostMapping),
    Interop(InteropMapping),
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Reference-counted native buffer. Share it as a [`NativeBufferRef`].
pub struct NativeBuffer {
    descriptor: NativeBufferDescriptor,
    pool: Arc<PoolShared>,
    cleanup: Mutex<Option<Cleanup>>,
}

/// Shared handle to a [`NativeBuffer`].
pub type NativeBufferRef = Arc<NativeBuffer>;

impl NativeBuffer {
    pub fn descriptor(&self) -> &NativeBufferDescriptor {
        &self.descriptor
    }

    pub fn format(&self) -> PixelFormat {
        self.descriptor.pixel_format()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.descriptor.width, self.descriptor.height)
    }

    /// Maps the buffer to host memory.
    pub fn map_host(&self) -> Result<HostMapping, BufferError> {
        self.pool
            .guard
            .run_if_alive(|| self.pool.map_host(&self.descriptor))
            .unwrap_or(Err(BufferError::SessionClosed))
    }

    /// Maps the buffer to host memory, or through an interop backend.
    pub fn map(&self) -> Result<BufferMapping, BufferError> {
        self.pool
            .guard
            .run_if_alive(|| match self.pool.map_host(&self.descriptor) {
                Ok(mapping) => Ok(BufferMapping::Host(mapping)),
                Err(BufferError::Unmappable(ty)) => self
                    .pool
                    .map_interop(&self.descriptor)
                    .map(BufferMapping::Interop)
                    .ok_or(BufferError::Unmappable(ty)),
                Err(e) => Err(e),
            })
            .unwrap_or(Err(BufferError::SessionClosed))
    }

    /// Copies the pixels into a host frame.
    pub fn to_cpu_frame(&self) -> Result<CpuFrame, BufferError> {
        let mapping = self.map_host()?;
        let (width, height) = self.dimensions();
        let mut frame = CpuFrame::packed(self.format(), width, height, mapping.data);
        if let Some(plane) = frame.planes.first_mut() {
            plane.stride = mapping.stride;
        }
        Ok(frame)
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.get_mut().take() {
            cleanup();
        }
        self.pool.stats.record_native_buffer_released();
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

// =========================================================================
// Pool
// =========================================================================

#[derive(Debug, Clone, Copy)]
struct Readback {
    handle: ResourceHandle,
    resource_type: ResourceType,
    size_bytes: usize,
    path: MappingPath,
}

struct PoolShared {
    context: DeviceContext,
    manager: Option<Arc<dyn ResourceManager>>,
    interop: Vec<Arc<dyn InteropBackend>>,
    readback: Mutex<Option<Readback>>,
    guard: LivenessGuard,
    stats: Arc<ReaderStats>,
}

/// Per-session pool of native buffers.
pub struct NativeBufferPool {
    shared: Arc<PoolShared>,
}

impl NativeBufferPool {
    /// `interop` backends are tried in order once host mapping fails.
    pub fn new(
        context: DeviceContext,
        manager: Option<Arc<dyn ResourceManager>>,
        interop: Vec<Arc<dyn InteropBackend>>,
        guard: LivenessGuard,
        stats: Arc<ReaderStats>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                context,
                manager,
                interop,
                readback: Mutex::new(None),
                guard,
                stats,
            }),
        }
    }

    /// Wraps a native resource. `cleanup` runs once, when the last reference
    /// is dropped.
    pub fn get_buffer(
        &self,
        descriptor: NativeBufferDescriptor,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> NativeBufferRef {
        self.shared.stats.record_native_buffer_created();
        Arc::new(NativeBuffer {
            descriptor,
            pool: Arc::clone(&self.shared),
            cleanup: Mutex::new(Some(Box::new(cleanup))),
        })
    }

    /// Returns true if the readback resource has been allocated.
    pub fn has_readback(&self) -> bool {
        self.shared.readback.lock().is_some()
    }

    /// Ends the load session, then releases the readback resource.
    ///
    /// Mappings still in progress finish before the session ends, and none
    /// can start afterwards, so the readback cannot be allocated again once
    /// it has been released.
    pub fn shutdown(&self, token: &SessionToken) -> bool {
        token.end();
        self.release_readback()
    }

    /// Releases the readback resource. Safe to call more than once.
    pub fn release_readback(&self) -> bool {
        let Some(readback) = self.shared.readback.lock().take() else {
            return false;
        };
        let Some(manager) = self.shared.manager.as_ref() else {
            return false;
        };
        if let Err(e) =
            manager.release_resource(self.shared.context, readback.handle, readback.resource_type)
        {
            tracing::warn!("failed to release readback resource: {}", e);
        }
        tracing::debug!("released {:?} readback resource", readback.resource_type);
        true
    }
}

impl fmt::Debug for NativeBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBufferPool")
            .field("readback", &*self.shared.readback.lock())
            .field("interop", &self.shared.interop.len())
            .finish()
    }
}

impl PoolShared {
    fn map_host(&self, desc: &NativeBufferDescriptor) -> Result<HostMapping, BufferError> {
        let manager = self.manager.as_ref().ok_or(BufferError::NoResourceManager)?;
        let stride = packed_stride(desc);

        match manager.host_pointer(self.context, desc.resource, desc.resource_type) {
            Ok(Some(data)) => {
                self.stats.record_direct_map();
                return Ok(HostMapping {
                    data: truncate(data, desc.size_bytes),
                    stride,
                    path: MappingPath::Direct,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("no direct host pointer: {}", e),
        }

        match self.read_back(manager.as_ref(), desc) {
            Ok(Some((data, path))) => {
                self.stats.record_host_copy();
                Ok(HostMapping { data, stride, path })
            }
            Ok(None) => Err(BufferError::Unmappable(desc.resource_type)),
            Err(e) => {
                tracing::warn!("readback of {:?} resource failed: {}", desc.resource_type, e);
                Err(BufferError::Unmappable(desc.resource_type))
            }
        }
    }

    fn read_back(
        &self,
        manager: &dyn ResourceManager,
        desc: &NativeBufferDescriptor,
    ) -> Result<Option<(Bytes, MappingPath)>, EngineError> {
        let mut slot = self.readback.lock();
        let readback = match *slot {
            Some(readback) => readback,
            None => {
                let readback = self.allocate_readback(manager, desc)?;
                self.stats.record_readback_allocation();
                *slot = Some(readback);
                readback
            }
        };
        if readback.size_bytes < desc.size_bytes {
            tracing::warn!(
                "readback resource holds {} bytes, frame needs {}",
                readback.size_bytes,
                desc.size_bytes
            );
            return Ok(None);
        }

        manager.copy_resource(
            self.context,
            desc.resource,
            desc.resource_type,
            readback.handle,
            readback.resource_type,
            desc.size_bytes,
        )?;
        let data = manager.host_pointer(self.context, readback.handle, readback.resource_type)?;
        Ok(data.map(|data| (truncate(data, desc.size_bytes), readback.path)))
    }

    fn allocate_readback(
        &self,
        manager: &dyn ResourceManager,
        desc: &NativeBufferDescriptor,
    ) -> Result<Readback, EngineError> {
        let handle = manager.create_resource(
            self.context,
            desc.size_bytes,
            desc.resource_type,
            ResourceUsage::ReadCpuWriteGpu,
        )?;
        if let Ok(Some(_)) = manager.host_pointer(self.context, handle, desc.resource_type) {
            tracing::debug!("allocated {:?} readback resource", desc.resource_type);
            return Ok(Readback {
                handle,
                resource_type: desc.resource_type,
                size_bytes: desc.size_bytes,
                path: MappingPath::Readback,
            });
        }

        manager.release_resource(self.context, handle, desc.resource_type)?;
        let handle = manager.create_resource(
            self.context,
            desc.size_bytes,
            ResourceType::BufferCpu,
            ResourceUsage::ReadCpuWriteCpu,
        )?;
        tracing::debug!(
            "{:?} readback has no host pointer, using host buffer",
            desc.resource_type
        );
        Ok(Readback {
            handle,
            resource_type: ResourceType::BufferCpu,
            size_bytes: desc.size_bytes,
            path: MappingPath::HostReadback,
        })
    }

    fn map_interop(&self, desc: &NativeBufferDescriptor) -> Option<InteropMapping> {
        let request = InteropRequest {
            context: self.context,
            resource: desc.resource,
            resource_type: desc.resource_type,
            format: desc.pixel_format(),
            width: desc.width,
            height: desc.height,
            size_bytes: desc.size_bytes,
        };
        for backend in &self.interop {
            match backend.map(&request) {
                Ok(Some(mapping)) => {
                    tracing::trace!("mapped {:?} through {}", desc.resource, backend.name());
                    self.stats.record_interop_map();
                    return Some(mapping);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("{} interop failed: {}", backend.name(), e),
            }
        }
        None
    }
}

fn packed_stride(desc: &NativeBufferDescriptor) -> usize {
    if desc.height > 0 && desc.size_bytes > 0 {
        desc.size_bytes / desc.height as usize
    } else {
        desc.width as usize * desc.resource_format.bytes_per_pixel()
    }
}

fn truncate(data: Bytes, len: usize) -> Bytes {
    if data.len() > len {
        data.slice(..len)
    } else {
        data
    }
}
