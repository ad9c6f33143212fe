//! GPU resources owned by the registry.
//!
//! A [`GpuResource`] is shared as `Arc`: the registry map holds one strong
//! reference and every command buffer that recorded a command using it holds
//! another. The native handle is released when the last one goes away.

mod registry;

pub use registry::ResourceRegistry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::types::{BufferDescriptor, SamplerDescriptor, TextureDescriptor};
use crate::backend::{GpuBuffer, GpuSampler, GpuTexture};
use crate::ids::ResourceId;

/// Bytes charged against the memory budget, returned on drop.
#[derive(Debug)]
pub(crate) struct MemoryCharge {
    bytes: u64,
    usage: Arc<AtomicU64>,
}

impl MemoryCharge {
    pub(crate) fn new(bytes: u64, usage: Arc<AtomicU64>) -> Self {
        Self { bytes, usage }
    }
}

impl Drop for MemoryCharge {
    fn drop(&mut self) {
        self.usage.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct BufferResource {
    pub(crate) handle: GpuBuffer,
    pub descriptor: BufferDescriptor,
    charge: MemoryCharge,
}

#[derive(Debug)]
pub struct TextureResource {
    pub(crate) handle: GpuTexture,
    pub descriptor: TextureDescriptor,
    charge: MemoryCharge,
}

#[derive(Debug)]
pub struct SamplerResource {
    pub(crate) handle: GpuSampler,
    pub descriptor: SamplerDescriptor,
}

/// A registry-owned GPU object.
#[derive(Debug)]
pub enum GpuResource {
    Buffer(BufferResource),
    Texture(TextureResource),
    Sampler(SamplerResource),
}

/// Kind tag of a [`GpuResource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
}

impl GpuResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            GpuResource::Buffer(_) => ResourceKind::Buffer,
            GpuResource::Texture(_) => ResourceKind::Texture,
            GpuResource::Sampler(_) => ResourceKind::Sampler,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferResource> {
        match self {
            GpuResource::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn as_texture(&self) -> Option<&TextureResource> {
        match self {
            GpuResource::Texture(texture) => Some(texture),
            _ => None,
        }
    }

    pub fn as_sampler(&self) -> Option<&SamplerResource> {
        match self {
            GpuResource::Sampler(sampler) => Some(sampler),
            _ => None,
        }
    }

    /// Bytes this resource counts against the memory budget.
    pub fn memory_size(&self) -> u64 {
        match self {
            GpuResource::Buffer(buffer) => buffer.charge.bytes,
            GpuResource::Texture(texture) => texture.charge.bytes,
            GpuResource::Sampler(_) => 0,
        }
    }
}

/// A resource reference captured when a command is recorded.
///
/// `resource` is `None` when the ID did not name a live resource at record
/// time; the executor skips such commands.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub id: ResourceId,
    pub resource: Option<Arc<GpuResource>>,
}

impl ResolvedResource {
    pub fn is_resolved(&self) -> bool {
        self.resource.is_some()
    }
}
