//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations but provides a valid
//! implementation of [`GpuBackend`] so the frame core can run headless.
//! [`DummyControls`] lets tests simulate surface loss, slow GPU completion
//! and allocation failures, and observe what the core submitted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::sync::Fence;

use super::types::*;
use super::{
    ComputePipelineDesc, EncodedCommand, EncodedFrame, GpuBackend, GpuBuffer, GpuComputePipeline,
    GpuFrameTarget, GpuRenderPipeline, GpuSampler, GpuShaderModule, GpuTexture,
    RenderPipelineDesc,
};

/// What the dummy backend executed for one command, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutedCommand {
    Draw { vertices: u32, instances: u32 },
    Dispatch { workgroups: [u32; 3] },
}

/// Shared knobs and counters of a [`DummyBackend`].
#[derive(Debug)]
pub struct DummyControls {
    surface_available: AtomicBool,
    device_lost: AtomicBool,
    surface_size: Mutex<(u32, u32)>,
    manual_fences: AtomicBool,
    fail_allocations: AtomicBool,
    pending_fences: Mutex<Vec<Fence>>,
    live_objects: AtomicU64,
    acquired_frames: AtomicU64,
    submitted_frames: AtomicU64,
    presented_frames: AtomicU64,
    executed: Mutex<Vec<ExecutedCommand>>,
}

impl Default for DummyControls {
    fn default() -> Self {
        Self {
            surface_available: AtomicBool::new(true),
            device_lost: AtomicBool::new(false),
            surface_size: Mutex::new((1280, 720)),
            manual_fences: AtomicBool::new(false),
            fail_allocations: AtomicBool::new(false),
            pending_fences: Mutex::new(Vec::new()),
            live_objects: AtomicU64::new(0),
            acquired_frames: AtomicU64::new(0),
            submitted_frames: AtomicU64::new(0),
            presented_frames: AtomicU64::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }
}

impl DummyControls {
    /// Make frame acquisition fail with [`GraphicsError::SurfaceLost`].
    pub fn set_surface_available(&self, available: bool) {
        self.surface_available.store(available, Ordering::Release);
    }

    /// Simulate losing the device: acquiring and submitting frames fail with
    /// [`GraphicsError::DeviceLost`] until cleared.
    pub fn set_device_lost(&self, lost: bool) {
        self.device_lost.store(lost, Ordering::Release);
    }

    /// Size the surface was last configured to.
    pub fn surface_size(&self) -> (u32, u32) {
        *self.surface_size.lock()
    }

    /// When enabled, submissions stay pending until [`complete_pending`](Self::complete_pending).
    pub fn set_manual_fences(&self, manual: bool) {
        self.manual_fences.store(manual, Ordering::Release);
        if !manual {
            self.complete_pending();
        }
    }

    /// Make every buffer and texture allocation fail with out-of-memory.
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Release);
    }

    /// Signal every fence of a pending submission. Returns how many were signaled.
    pub fn complete_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending_fences.lock());
        for fence in &pending {
            fence.signal();
        }
        pending.len()
    }

    pub fn pending_submissions(&self) -> usize {
        self.pending_fences.lock().len()
    }

    /// Native objects created and not yet released.
    pub fn live_objects(&self) -> u64 {
        self.live_objects.load(Ordering::Acquire)
    }

    pub fn acquired_frames(&self) -> u64 {
        self.acquired_frames.load(Ordering::Relaxed)
    }

    pub fn submitted_frames(&self) -> u64 {
        self.submitted_frames.load(Ordering::Relaxed)
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented_frames.load(Ordering::Relaxed)
    }

    /// Commands executed by every submission so far.
    pub fn executed_commands(&self) -> Vec<ExecutedCommand> {
        self.executed.lock().clone()
    }

    fn allocation(self: &Arc<Self>, kind: &'static str) -> DummyAllocation {
        self.live_objects.fetch_add(1, Ordering::AcqRel);
        DummyAllocation {
            kind,
            controls: Arc::clone(self),
        }
    }
}

/// Stand-in for a native object. Dropping it counts as the release.
pub struct DummyAllocation {
    kind: &'static str,
    controls: Arc<DummyControls>,
}

impl std::fmt::Debug for DummyAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyAllocation")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for DummyAllocation {
    fn drop(&mut self) {
        log::trace!("DummyBackend: releasing {}", self.kind);
        self.controls.live_objects.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Dummy GPU backend.
#[derive(Debug, Default)]
pub struct DummyBackend {
    controls: Arc<DummyControls>,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the shared test controls.
    pub fn controls(&self) -> Arc<DummyControls> {
        Arc::clone(&self.controls)
    }

    fn check_allocation(&self, what: &str) -> GraphicsResult<()> {
        if self.controls.fail_allocations.load(Ordering::Acquire) {
            return Err(GraphicsError::ResourceExhaustion(format!(
                "dummy backend refused to allocate {what}"
            )));
        }
        Ok(())
    }

    fn check_device(&self) -> GraphicsResult<()> {
        if self.controls.device_lost.load(Ordering::Acquire) {
            return Err(GraphicsError::DeviceLost);
        }
        Ok(())
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            adapter_name: "Dummy Adapter".to_string(),
            backend_name: self.name().to_string(),
            device_type: DeviceType::Cpu,
            max_texture_dimension_2d: 8192,
            max_texture_dimension_3d: 2048,
            max_texture_array_layers: 256,
            max_buffer_size: 1 << 30,
            supported_sample_counts: vec![1, 4],
            supports_hdr: false,
            surface_format: TextureFormat::Bgra8UnormSrgb,
            sample_count: 1,
        }
    }

    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> GraphicsResult<GpuBuffer> {
        self.check_allocation("buffer")?;
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {}, initial data: {})",
            descriptor.label,
            descriptor.size,
            contents.map_or(0, <[u8]>::len)
        );
        Ok(GpuBuffer::Dummy(self.controls.allocation("buffer")))
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> GraphicsResult<GpuTexture> {
        self.check_allocation("texture")?;
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{})",
            descriptor.label,
            descriptor.width,
            descriptor.height,
            descriptor.depth
        );
        Ok(GpuTexture::Dummy(self.controls.allocation("texture")))
    }

    fn write_texture(
        &self,
        _texture: &GpuTexture,
        descriptor: &TextureDescriptor,
        data: &[u8],
        bytes_per_row: u32,
    ) -> GraphicsResult<()> {
        log::trace!(
            "DummyBackend: writing {} bytes to texture {:?} (row pitch {})",
            data.len(),
            descriptor.label,
            bytes_per_row
        );
        Ok(())
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> GraphicsResult<GpuSampler> {
        log::trace!("DummyBackend: creating sampler {:?}", descriptor.label);
        Ok(GpuSampler::Dummy(self.controls.allocation("sampler")))
    }

    fn create_shader_module(&self, label: &str, _wgsl: &str) -> GraphicsResult<GpuShaderModule> {
        log::trace!("DummyBackend: creating shader module {label}");
        Ok(GpuShaderModule::Dummy(
            self.controls.allocation("shader module"),
        ))
    }

    fn create_render_pipeline(
        &self,
        descriptor: &RenderPipelineDesc<'_>,
    ) -> GraphicsResult<GpuRenderPipeline> {
        log::trace!("DummyBackend: creating render pipeline {}", descriptor.label);
        Ok(GpuRenderPipeline::Dummy(
            self.controls.allocation("render pipeline"),
        ))
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDesc<'_>,
    ) -> GraphicsResult<GpuComputePipeline> {
        log::trace!(
            "DummyBackend: creating compute pipeline {}",
            descriptor.label
        );
        Ok(GpuComputePipeline::Dummy(
            self.controls.allocation("compute pipeline"),
        ))
    }

    fn acquire_frame(&self) -> GraphicsResult<GpuFrameTarget> {
        self.check_device()?;
        if !self.controls.surface_available.load(Ordering::Acquire) {
            return Err(GraphicsError::SurfaceLost);
        }
        let frame_index = self.controls.acquired_frames.fetch_add(1, Ordering::Relaxed);
        Ok(GpuFrameTarget::Dummy { frame_index })
    }

    fn submit_frame(
        &self,
        target: &GpuFrameTarget,
        frame: &EncodedFrame,
        fence: &Fence,
    ) -> GraphicsResult<()> {
        self.check_device()?;
        log::trace!(
            "DummyBackend: submitting {} commands to {:?}",
            frame.commands.len(),
            target
        );
        {
            let mut executed = self.controls.executed.lock();
            executed.extend(frame.commands.iter().map(|command| match command {
                EncodedCommand::Draw(draw) => ExecutedCommand::Draw {
                    vertices: draw
                        .index
                        .as_ref()
                        .map_or(draw.vertices.len(), |index| index.indices.len())
                        as u32,
                    instances: draw.instances.len() as u32,
                },
                EncodedCommand::Dispatch(dispatch) => ExecutedCommand::Dispatch {
                    workgroups: dispatch.workgroups,
                },
            }));
        }
        self.controls.submitted_frames.fetch_add(1, Ordering::Relaxed);

        if self.controls.manual_fences.load(Ordering::Acquire) {
            self.controls.pending_fences.lock().push(fence.clone());
        } else {
            fence.signal();
        }
        Ok(())
    }

    fn present(&self, target: GpuFrameTarget) {
        log::trace!("DummyBackend: presenting {:?}", target);
        self.controls.presented_frames.fetch_add(1, Ordering::Relaxed);
    }

    fn wait_fence(&self, fence: &Fence) {
        fence.wait();
    }

    fn wait_idle(&self) {
        // Nothing runs on a device, so idle means every pending submission is done.
        self.controls.complete_pending();
    }

    fn resize(&self, width: u32, height: u32) -> GraphicsResult<()> {
        if width == 0 || height == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "surface size {width}x{height}"
            )));
        }
        *self.controls.surface_size.lock() = (width, height);
        self.controls.set_surface_available(true);
        Ok(())
    }
}
