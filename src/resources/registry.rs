//! Thread-safe registry of buffers, textures and samplers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::types::{
    BufferDescriptor, BufferUsage, DeviceCapabilities, SamplerDescriptor, TextureDescriptor,
    TextureDimension, TextureUsage,
};
use crate::backend::GpuBackend;
use crate::error::{GraphicsError, GraphicsResult};
use crate::ids::ResourceId;

use super::{
    BufferResource, GpuResource, MemoryCharge, ResolvedResource, SamplerResource,
    TextureResource,
};

/// Owns every GPU resource behind a [`ResourceId`].
///
/// IDs come from an atomic counter that never wraps back to zero, so an ID is
/// never reused while the registry lives. The map itself is guarded by a
/// single mutex that is never held across a backend call.
pub struct ResourceRegistry {
    backend: Arc<dyn GpuBackend>,
    limits: DeviceCapabilities,
    resources: Mutex<HashMap<ResourceId, Arc<GpuResource>>>,
    next_id: AtomicU64,
    memory_usage: Arc<AtomicU64>,
    memory_budget: Option<u64>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("backend", &self.backend.name())
            .field("resources", &self.len())
            .field("memory_usage", &self.memory_usage())
            .field("memory_budget", &self.memory_budget)
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new(backend: Arc<dyn GpuBackend>, memory_budget: Option<u64>) -> Self {
        Self {
            limits: backend.capabilities(),
            backend,
            resources: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            memory_usage: Arc::new(AtomicU64::new(0)),
            memory_budget,
        }
    }

    /// Create a buffer of `size` bytes, optionally filled with `data`.
    ///
    /// Initial data is written through a mapped range, which needs the usage
    /// to allow CPU writes (`MAP_WRITE` or `COPY_DST`).
    pub fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        data: Option<&[u8]>,
    ) -> GraphicsResult<ResourceId> {
        self.create_buffer_with_descriptor(BufferDescriptor::new(size, usage), data)
    }

    pub fn create_buffer_with_descriptor(
        &self,
        descriptor: BufferDescriptor,
        data: Option<&[u8]>,
    ) -> GraphicsResult<ResourceId> {
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".into(),
            ));
        }
        if descriptor.size > self.limits.max_buffer_size {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer size {} exceeds the device limit of {} bytes",
                descriptor.size, self.limits.max_buffer_size
            )));
        }
        if let Some(data) = data {
            if !descriptor.usage.supports_upload() {
                return Err(GraphicsError::InvalidParameter(format!(
                    "buffer usage {:?} cannot be mapped for writing",
                    descriptor.usage
                )));
            }
            if data.len() as u64 > descriptor.size {
                return Err(GraphicsError::InvalidParameter(format!(
                    "initial data ({} bytes) exceeds buffer size ({} bytes)",
                    data.len(),
                    descriptor.size
                )));
            }
        }

        let charge = self.reserve(descriptor.size)?;
        let handle = self.backend.create_buffer(&descriptor, data)?;
        let id = self.insert(GpuResource::Buffer(BufferResource {
            handle,
            descriptor,
            charge,
        }));
        log::debug!("Created buffer {id}");
        Ok(id)
    }

    /// Create a texture, optionally uploading its base mip level.
    ///
    /// The upload uses a row pitch of `width * bytes_per_pixel`.
    pub fn create_texture(
        &self,
        descriptor: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> GraphicsResult<ResourceId> {
        let (bytes_per_row, estimated_size) = self.validate_texture(descriptor)?;
        if let Some(data) = data {
            if !descriptor.usage.contains(TextureUsage::COPY_DST) {
                return Err(GraphicsError::InvalidParameter(
                    "texture upload needs COPY_DST usage".into(),
                ));
            }
            let required = bytes_per_row as u64 * descriptor.height as u64 * descriptor.depth as u64;
            if (data.len() as u64) < required {
                return Err(GraphicsError::InvalidParameter(format!(
                    "texture data is {} bytes, base level needs {required}",
                    data.len()
                )));
            }
        }

        let charge = self.reserve(estimated_size)?;
        let handle = self.backend.create_texture(descriptor)?;
        if let Some(data) = data {
            self.backend
                .write_texture(&handle, descriptor, data, bytes_per_row)?;
        }
        let id = self.insert(GpuResource::Texture(TextureResource {
            handle,
            descriptor: descriptor.clone(),
            charge,
        }));
        log::debug!(
            "Created texture {id} ({}x{} {:?})",
            descriptor.width,
            descriptor.height,
            descriptor.format
        );
        Ok(id)
    }

    pub fn create_sampler(&self, descriptor: &SamplerDescriptor) -> GraphicsResult<ResourceId> {
        let handle = self.backend.create_sampler(descriptor)?;
        let id = self.insert(GpuResource::Sampler(SamplerResource {
            handle,
            descriptor: descriptor.clone(),
        }));
        log::debug!("Created sampler {id}");
        Ok(id)
    }

    /// Remove `id` from the registry. Unknown IDs are ignored.
    ///
    /// Returns whether a resource was removed. Command buffers that recorded
    /// the resource keep it alive until they are recycled, so the native
    /// handle may outlive this call.
    pub fn destroy(&self, id: ResourceId) -> bool {
        let removed = self.resources.lock().remove(&id);
        match removed {
            Some(resource) => {
                let in_flight = Arc::strong_count(&resource) - 1;
                if in_flight > 0 {
                    log::debug!(
                        "Destroyed {id}; release deferred until {in_flight} pending reference(s) retire"
                    );
                } else {
                    log::debug!("Destroyed {id}");
                }
                true
            }
            None => {
                log::trace!("destroy_resource({id}) ignored, not registered");
                false
            }
        }
    }

    pub fn get(&self, id: ResourceId) -> Option<Arc<GpuResource>> {
        self.resources.lock().get(&id).cloned()
    }

    /// Resolve several IDs under a single lock acquisition.
    pub fn resolve_all(&self, ids: &[ResourceId]) -> Vec<ResolvedResource> {
        let resources = self.resources.lock();
        ids.iter()
            .map(|&id| ResolvedResource {
                id,
                resource: resources.get(&id).cloned(),
            })
            .collect()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.resources.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by live buffers and textures, including destroyed ones
    /// still referenced by in-flight frames.
    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Acquire)
    }

    pub fn memory_budget(&self) -> Option<u64> {
        self.memory_budget
    }

    /// Drop every resource. Returns how many were registered.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.resources.lock().drain().collect();
        drained.len()
    }

    /// Check a texture against the device limits.
    ///
    /// Returns the base level row pitch and the estimated size of the mip chain.
    fn validate_texture(&self, descriptor: &TextureDescriptor) -> GraphicsResult<(u32, u64)> {
        let extent = || {
            format!(
                "texture extent {}x{}x{}",
                descriptor.width, descriptor.height, descriptor.depth
            )
        };
        if descriptor.width == 0 || descriptor.height == 0 || descriptor.depth == 0 {
            return Err(GraphicsError::InvalidParameter(extent()));
        }
        let (max_extent, max_depth) = match descriptor.dimension {
            TextureDimension::D2 => (
                self.limits.max_texture_dimension_2d,
                self.limits.max_texture_array_layers,
            ),
            TextureDimension::D3 => (
                self.limits.max_texture_dimension_3d,
                self.limits.max_texture_dimension_3d,
            ),
        };
        if descriptor.width > max_extent
            || descriptor.height > max_extent
            || descriptor.depth > max_depth
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} exceeds the device limit of {max_extent}x{max_extent}x{max_depth}",
                extent()
            )));
        }

        let largest = match descriptor.dimension {
            TextureDimension::D2 => descriptor.width.max(descriptor.height),
            TextureDimension::D3 => descriptor.width.max(descriptor.height).max(descriptor.depth),
        };
        let max_mips = u32::BITS - largest.leading_zeros();
        if descriptor.mip_levels == 0 || descriptor.mip_levels > max_mips {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} mip levels, {} allows 1 to {max_mips}",
                descriptor.mip_levels,
                extent()
            )));
        }

        match (descriptor.bytes_per_row(), descriptor.estimated_size()) {
            (Some(bytes_per_row), Some(estimated_size)) => Ok((bytes_per_row, estimated_size)),
            _ => Err(GraphicsError::InvalidParameter(format!(
                "{} overflows the addressable size",
                extent()
            ))),
        }
    }

    fn insert(&self, resource: GpuResource) -> ResourceId {
        let id = ResourceId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.resources.lock().insert(id, Arc::new(resource));
        id
    }

    fn reserve(&self, bytes: u64) -> GraphicsResult<MemoryCharge> {
        let budget = self.memory_budget.unwrap_or(u64::MAX);
        self.memory_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= budget)
            })
            .map_err(|used| {
                GraphicsError::ResourceExhaustion(format!(
                    "allocating {bytes} bytes would exceed the memory budget ({used} of {budget} in use)"
                ))
            })?;
        Ok(MemoryCharge::new(bytes, Arc::clone(&self.memory_usage)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::types::TextureFormat;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(Arc::new(DummyBackend::new()), None)
    }

    #[test]
    fn test_ids_are_monotonic_and_nonzero() {
        let registry = registry();
        let a = registry.create_buffer(16, BufferUsage::VERTEX, None).unwrap();
        let b = registry
            .create_sampler(&SamplerDescriptor::default())
            .unwrap();
        assert!(a.is_valid());
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let registry = registry();
        let id = registry.create_buffer(16, BufferUsage::UNIFORM, None).unwrap();
        assert!(registry.destroy(id));
        assert!(!registry.destroy(id));
        assert!(!registry.destroy(ResourceId::INVALID));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upload_requires_writable_usage() {
        let registry = registry();
        let result = registry.create_buffer(4, BufferUsage::VERTEX, Some(&[1, 2, 3, 4]));
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));

        let id = registry
            .create_buffer(
                4,
                BufferUsage::VERTEX | BufferUsage::COPY_DST,
                Some(&[1, 2, 3, 4]),
            )
            .unwrap();
        assert!(registry.contains(id));
    }

    #[test]
    fn test_oversized_initial_data_rejected() {
        let registry = registry();
        let result = registry.create_buffer(2, BufferUsage::MAP_WRITE, Some(&[0; 8]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let registry = registry();
        assert!(registry.create_buffer(0, BufferUsage::VERTEX, None).is_err());
    }

    #[test]
    fn test_texture_data_must_cover_base_level() {
        let registry = registry();
        let desc = TextureDescriptor::new_2d(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        );
        assert!(registry.create_texture(&desc, Some(&[0; 32])).is_err());
        assert!(registry.create_texture(&desc, Some(&[0; 64])).is_ok());
    }

    #[test]
    fn test_huge_texture_is_rejected_without_allocating() {
        let backend = Arc::new(DummyBackend::new());
        let controls = backend.controls();
        let registry = ResourceRegistry::new(backend, None);
        let desc = TextureDescriptor::new_2d(
            u32::MAX,
            u32::MAX,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING,
        );

        let result = registry.create_texture(&desc, None);
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
        assert_eq!(registry.memory_usage(), 0);
        assert_eq!(controls.live_objects(), 0);
    }

    #[test]
    fn test_memory_budget_enforced_and_returned() {
        let registry = ResourceRegistry::new(Arc::new(DummyBackend::new()), Some(1024));
        let first = registry.create_buffer(768, BufferUsage::STORAGE, None).unwrap();
        assert_eq!(registry.memory_usage(), 768);

        let overflow = registry.create_buffer(512, BufferUsage::STORAGE, None);
        assert!(matches!(overflow, Err(GraphicsError::ResourceExhaustion(_))));
        assert_eq!(registry.memory_usage(), 768);

        registry.destroy(first);
        assert_eq!(registry.memory_usage(), 0);
        assert!(registry.create_buffer(512, BufferUsage::STORAGE, None).is_ok());
    }

    #[test]
    fn test_destroy_defers_release_while_referenced() {
        let backend = Arc::new(DummyBackend::new());
        let controls = backend.controls();
        let registry = ResourceRegistry::new(backend, None);

        let id = registry.create_buffer(64, BufferUsage::STORAGE, None).unwrap();
        let in_flight = registry.resolve_all(&[id]);
        assert!(in_flight[0].is_resolved());

        registry.destroy(id);
        assert!(!registry.contains(id));
        assert_eq!(controls.live_objects(), 1);

        drop(in_flight);
        assert_eq!(controls.live_objects(), 0);
    }

    #[test]
    fn test_concurrent_creation_yields_unique_ids() {
        let registry = registry();
        let mut ids: Vec<ResourceId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..50)
                            .map(|_| registry.create_buffer(4, BufferUsage::VERTEX, None).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(registry.len(), 200);
    }
}
