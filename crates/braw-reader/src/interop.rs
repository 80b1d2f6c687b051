//! Interop backends for resources that cannot be mapped to host memory.
//!
//! When neither the resource's own host pointer nor a readback copy works,
//! the buffer is handed to a capability-specific backend. A backend either
//! describes the resource as something the consumer can use directly (a
//! device pointer with its stride table, or a graphics texture) or declines.

use std::sync::Arc;

use crate::engine::{DeviceContext, ResourceHandle, ResourceType};
use crate::error::EngineResult;
use crate::video::PixelFormat;

/// Describes the native resource an interop backend is asked to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteropRequest {
    pub context: DeviceContext,
    pub resource: ResourceHandle,
    pub resource_type: ResourceType,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
}

/// A GL texture produced from a native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBinding {
    /// Texture name
    pub id: u32,
    /// Texture target (e.g. `GL_TEXTURE_2D`)
    pub target: u32,
    pub width: u32,
    pub height: u32,
}

/// Non-host view of a native resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteropMapping {
    /// Raw device pointer and per-plane strides (compute pipelines)
    DevicePointer {
        pointer: u64,
        strides: Vec<usize>,
        resource_type: ResourceType,
    },
    /// Graphics texture
    Texture(TextureBinding),
}

/// A capability that can expose a native resource without host mapping.
pub trait InteropBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `Ok(None)` if this backend does not handle the resource.
    fn map(&self, request: &InteropRequest) -> EngineResult<Option<InteropMapping>>;
}

/// Exposes CUDA and OpenCL buffers as device pointers.
///
/// The engine's resource handle on these pipelines is the device pointer
/// itself; rows are tightly packed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DevicePointerInterop;

impl InteropBackend for DevicePointerInterop {
    fn name(&self) -> &'static str {
        "device-pointer"
    }

    fn map(&self, request: &InteropRequest) -> EngineResult<Option<InteropMapping>> {
        if !matches!(
            request.resource_type,
            ResourceType::BufferCuda | ResourceType::BufferOpenCl
        ) {
            return Ok(None);
        }
        if request.resource.0 == 0 {
            return Ok(None);
        }
        let stride = if request.height > 0 {
            request.size_bytes / request.height as usize
        } else {
            request.width as usize * request.format.bytes_per_pixel()
        };
        let strides = (0..request.format.num_planes()).map(|_| stride).collect();
        Ok(Some(InteropMapping::DevicePointer {
            pointer: request.resource.0,
            strides,
            resource_type: request.resource_type,
        }))
    }
}

/// Creates GL textures from native resources. Supplied by the embedding
/// application, which owns the GL context.
pub trait TextureImporter: Send + Sync {
    fn import(&self, request: &InteropRequest) -> EngineResult<Option<TextureBinding>>;
}

/// Delegates to a [`TextureImporter`] for pipelines bound with GL interop.
pub struct GlTextureInterop {
    importer: Arc<dyn TextureImporter>,
}

impl GlTextureInterop {
    pub fn new(importer: Arc<dyn TextureImporter>) -> Self {
        Self { importer }
    }
}

impl InteropBackend for GlTextureInterop {
    fn name(&self) -> &'static str {
        "gl-texture"
    }

    fn map(&self, request: &InteropRequest) -> EngineResult<Option<InteropMapping>> {
        Ok(self
            .importer
            .import(request)?
            .map(InteropMapping::Texture))
    }
}

impl std::fmt::Debug for GlTextureInterop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GlTextureInterop")
    }
}
