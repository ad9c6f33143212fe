//! GPU backend abstraction layer.
//!
//! Each backend implements [`GpuBackend`], the "abstract graphics device" the
//! rest of the core talks to. Native objects are handed out wrapped in enums
//! with one variant per backend; dropping a wrapper releases the native object.
//!
//! # Available Backends
//!
//! - `dummy` (always compiled): no GPU, deterministic, used by tests
//! - `wgpu-backend` (default feature): cross-platform backend using wgpu

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub mod dummy;
pub mod types;

use std::ops::Range;
use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::config::{BackendType, RenderConfig};
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::sync::Fence;
use crate::resources::GpuResource;

use self::dummy::DummyAllocation;
use self::types::*;

/// A native window the wgpu backend can present to.
pub trait WindowTarget: HasWindowHandle + HasDisplayHandle + Send + Sync {}

impl<T: HasWindowHandle + HasDisplayHandle + Send + Sync> WindowTarget for T {}

/// Handle to a GPU buffer.
#[derive(Debug)]
pub enum GpuBuffer {
    Dummy(DummyAllocation),
    #[cfg(feature = "wgpu-backend")]
    Wgpu(wgpu::Buffer),
}

/// Handle to a GPU texture and its default view.
#[derive(Debug)]
pub enum GpuTexture {
    Dummy(DummyAllocation),
    #[cfg(feature = "wgpu-backend")]
    Wgpu {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
    },
}

/// Handle to a GPU sampler.
#[derive(Debug)]
pub enum GpuSampler {
    Dummy(DummyAllocation),
    #[cfg(feature = "wgpu-backend")]
    Wgpu(wgpu::Sampler),
}

/// Handle to a compiled shader module.
#[derive(Debug)]
pub enum GpuShaderModule {
    Dummy(DummyAllocation),
    #[cfg(feature = "wgpu-backend")]
    Wgpu(wgpu::ShaderModule),
}

/// Handle to a render pipeline.
#[derive(Debug)]
pub enum GpuRenderPipeline {
    Dummy(DummyAllocation),
    #[cfg(feature = "wgpu-backend")]
    Wgpu(wgpu::RenderPipeline),
}

/// Handle to a compute pipeline.
#[derive(Debug)]
pub enum GpuComputePipeline {
    Dummy(DummyAllocation),
    #[cfg(feature = "wgpu-backend")]
    Wgpu(wgpu::ComputePipeline),
}

/// A presentation target acquired for one frame.
///
/// Consumed by [`GpuBackend::present`]; dropping it without presenting
/// discards the frame.
#[derive(Debug)]
pub enum GpuFrameTarget {
    Dummy {
        frame_index: u64,
    },
    #[cfg(feature = "wgpu-backend")]
    Wgpu {
        texture: wgpu::SurfaceTexture,
        view: wgpu::TextureView,
        rendered: std::sync::atomic::AtomicBool,
    },
}

/// Fixed-function state and shaders for a render pipeline.
#[derive(Debug)]
pub struct RenderPipelineDesc<'a> {
    pub label: &'a str,
    pub vertex_module: &'a GpuShaderModule,
    pub vertex_entry: &'a str,
    pub fragment: Option<(&'a GpuShaderModule, &'a str)>,
    pub vertex_buffers: &'a [VertexBufferLayout],
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: BlendMode,
}

#[derive(Debug)]
pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    pub module: &'a GpuShaderModule,
    pub entry: &'a str,
}

/// Index buffer binding of an encoded draw.
#[derive(Debug)]
pub struct EncodedIndex {
    pub buffer: Arc<GpuResource>,
    pub format: IndexFormat,
    pub indices: Range<u32>,
    pub base_vertex: i32,
}

/// A draw with every reference resolved to a live native object.
#[derive(Debug)]
pub struct EncodedDraw {
    pub pipeline: Arc<GpuRenderPipeline>,
    /// Vertex buffers in slot order with their byte offsets
    pub vertex_buffers: Vec<(Arc<GpuResource>, u64)>,
    pub index: Option<EncodedIndex>,
    /// Bind group 0 entries as `(binding, resource)`
    pub bindings: Vec<(u32, Arc<GpuResource>)>,
    pub vertices: Range<u32>,
    pub instances: Range<u32>,
    pub viewport: Option<Viewport>,
    pub scissor: Option<ScissorRect>,
}

/// A compute dispatch with every reference resolved.
#[derive(Debug)]
pub struct EncodedDispatch {
    pub pipeline: Arc<GpuComputePipeline>,
    pub bindings: Vec<(u32, Arc<GpuResource>)>,
    pub workgroups: [u32; 3],
}

#[derive(Debug)]
pub enum EncodedCommand {
    Draw(EncodedDraw),
    Dispatch(EncodedDispatch),
}

/// One frame's worth of device work, in submission order.
#[derive(Debug, Default)]
pub struct EncodedFrame {
    pub clear_color: [f64; 4],
    pub commands: Vec<EncodedCommand>,
}

/// Interface every GPU backend implements.
///
/// All methods take `&self`; backends use interior mutability for surface
/// state so the engine can be shared across producer threads.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Create a buffer, writing `contents` through a mapped range when given.
    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> GraphicsResult<GpuBuffer>;

    fn create_texture(&self, descriptor: &TextureDescriptor) -> GraphicsResult<GpuTexture>;

    /// Upload the base mip level of `texture` with the given row pitch.
    fn write_texture(
        &self,
        texture: &GpuTexture,
        descriptor: &TextureDescriptor,
        data: &[u8],
        bytes_per_row: u32,
    ) -> GraphicsResult<()>;

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> GraphicsResult<GpuSampler>;

    /// Build a native module from validated WGSL.
    fn create_shader_module(&self, label: &str, wgsl: &str) -> GraphicsResult<GpuShaderModule>;

    fn create_render_pipeline(
        &self,
        descriptor: &RenderPipelineDesc<'_>,
    ) -> GraphicsResult<GpuRenderPipeline>;

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDesc<'_>,
    ) -> GraphicsResult<GpuComputePipeline>;

    /// Acquire the next presentation target.
    fn acquire_frame(&self) -> GraphicsResult<GpuFrameTarget>;

    /// Record and submit `frame` against `target`. `fence` is signaled once
    /// the GPU has finished the submission.
    fn submit_frame(
        &self,
        target: &GpuFrameTarget,
        frame: &EncodedFrame,
        fence: &Fence,
    ) -> GraphicsResult<()>;

    /// Present a previously acquired target.
    fn present(&self, target: GpuFrameTarget);

    /// Block until `fence` is signaled.
    fn wait_fence(&self, fence: &Fence);

    /// Block until all submitted work has finished.
    fn wait_idle(&self);

    /// Reconfigure the presentation surface.
    fn resize(&self, width: u32, height: u32) -> GraphicsResult<()>;
}

/// Create the backend selected by `config`.
///
/// The wgpu backend needs a window; the dummy backend ignores it.
pub fn create_backend(
    config: &RenderConfig,
    window: Option<Arc<dyn WindowTarget>>,
) -> GraphicsResult<Arc<dyn GpuBackend>> {
    match config.backend {
        BackendType::Dummy => {
            log::info!("Using dummy backend");
            Ok(Arc::new(dummy::DummyBackend::new()))
        }
        #[cfg(feature = "wgpu-backend")]
        BackendType::Wgpu => {
            let window = window.ok_or_else(|| {
                GraphicsError::Initialization("the wgpu backend needs a window".into())
            })?;
            let backend = wgpu_backend::WgpuBackend::new(window, config)?;
            log::info!("Using wgpu backend");
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "wgpu-backend"))]
        BackendType::Wgpu => {
            let _ = window;
            Err(GraphicsError::Initialization(
                "the wgpu backend was not compiled in".into(),
            ))
        }
    }
}
