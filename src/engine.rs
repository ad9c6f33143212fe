//! The render engine context.
//!
//! [`RenderEngine`] owns every core component and is the only place where
//! internal errors become `bool`, `Option` or [`ResourceId::INVALID`]
//! results. It is `Send + Sync`: the presentation thread drives frames while
//! producer threads create resources and submit commands through `&self`.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::types::{BufferUsage, DeviceCapabilities, SamplerDescriptor, TextureDescriptor};
use crate::backend::{create_backend, GpuBackend, WindowTarget};
use crate::commands::{CommandRecorder, ComputeDispatch, DrawCall};
use crate::config::RenderConfig;
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::{FramePhase, FrameScheduler};
use crate::ids::ResourceId;
use crate::pipeline::PipelineCache;
use crate::resources::ResourceRegistry;
use crate::shader::{BuiltinShader, CompiledShader, ShaderCompiler, ShaderDescriptor, ShaderStage};
use crate::stats::{RenderStats, StatsTracker};

/// Components that exist while the engine is initialized.
struct EngineCore {
    backend: Arc<dyn GpuBackend>,
    compiler: Arc<ShaderCompiler>,
    registry: Arc<ResourceRegistry>,
    pipelines: Arc<PipelineCache>,
    recorder: Arc<CommandRecorder>,
    scheduler: FrameScheduler,
    stats: Arc<StatsTracker>,
}

impl EngineCore {
    fn new(backend: Arc<dyn GpuBackend>, config: &RenderConfig) -> GraphicsResult<Self> {
        let compiler = Arc::new(ShaderCompiler::new(backend.clone()));
        compiler.initialize_builtins()?;

        let registry = Arc::new(ResourceRegistry::new(backend.clone(), config.memory_budget));
        let stats = Arc::new(StatsTracker::new());
        let pipelines = Arc::new(PipelineCache::new(backend.clone()));
        let recorder = Arc::new(CommandRecorder::new(registry.clone(), stats.clone()));
        let scheduler = FrameScheduler::new(
            backend.clone(),
            recorder.clone(),
            pipelines.clone(),
            stats.clone(),
            config,
        );
        Ok(Self {
            backend,
            compiler,
            registry,
            pipelines,
            recorder,
            scheduler,
            stats,
        })
    }

    /// Tear down in dependency order: the device must be idle before
    /// resources go, and pipelines go before the shaders they were built from.
    fn shutdown(&self) {
        self.scheduler.shutdown();
        let resources = self.registry.clear();
        let pipelines = self.pipelines.clear();
        self.compiler.release_all();
        log::info!(
            "Render core shut down ({resources} resources, {pipelines} pipelines released)"
        );
    }
}

/// Explicitly constructed rendering context.
///
/// # Example
///
/// ```ignore
/// let engine = RenderEngine::new(RenderConfig::default());
/// if !engine.initialize(window) {
///     return;
/// }
///
/// loop {
///     if !engine.begin_frame() {
///         engine.resize(width, height);
///         continue;
///     }
///     engine.submit_draw_call(draw);
///     engine.end_frame();
///     engine.present();
/// }
/// ```
pub struct RenderEngine {
    config: RenderConfig,
    core: RwLock<Option<Arc<EngineCore>>>,
}

impl std::fmt::Debug for RenderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderEngine")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl RenderEngine {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config: config.sanitized(),
            core: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    fn core(&self) -> Option<Arc<EngineCore>> {
        self.core.read().clone()
    }

    fn require_core(&self) -> GraphicsResult<Arc<EngineCore>> {
        self.core().ok_or(GraphicsError::NotInitialized)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Initialize against a native window with the configured backend.
    pub fn initialize(&self, window: Arc<dyn WindowTarget>) -> bool {
        report(self.try_initialize(Some(window)), "initialize").is_some()
    }

    /// Initialize with an already constructed backend.
    pub fn initialize_with_backend(&self, backend: Arc<dyn GpuBackend>) -> bool {
        report(self.install(|| Ok(backend)), "initialize").is_some()
    }

    /// Initialize with the configured backend. `window` may be `None` for
    /// the dummy backend.
    pub fn try_initialize(&self, window: Option<Arc<dyn WindowTarget>>) -> GraphicsResult<()> {
        self.install(|| create_backend(&self.config, window))
    }

    fn install(
        &self,
        backend: impl FnOnce() -> GraphicsResult<Arc<dyn GpuBackend>>,
    ) -> GraphicsResult<()> {
        let mut slot = self.core.write();
        if slot.is_some() {
            return Err(GraphicsError::Initialization(
                "engine is already initialized".into(),
            ));
        }
        let backend = backend()?;
        let capabilities = backend.capabilities();
        log::info!(
            "Initializing render core on {} ({}, {:?})",
            capabilities.adapter_name,
            capabilities.backend_name,
            capabilities.device_type
        );
        *slot = Some(Arc::new(EngineCore::new(backend, &self.config)?));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.core.read().is_some()
    }

    /// Wait for the device, then release resources, pipelines and shaders.
    /// Does nothing if the engine is not initialized.
    pub fn shutdown(&self) {
        let Some(core) = self.core.write().take() else {
            return;
        };
        core.shutdown();
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Open a frame. Returns `false` if the engine is not initialized, a
    /// frame is already open, or the surface could not provide a target; in
    /// the last case reconfigure the surface (see [`resize`](Self::resize))
    /// and retry.
    pub fn begin_frame(&self) -> bool {
        match self.require_core().and_then(|core| core.scheduler.begin_frame()) {
            Ok(()) => true,
            Err(err) if err.is_surface_error() => {
                log::warn!("Skipping frame: {err}");
                false
            }
            Err(GraphicsError::DeviceLost) => {
                log::error!("begin_frame failed: GPU device lost, reinitialize the engine");
                false
            }
            Err(err) => {
                log::error!("begin_frame failed: {err}");
                false
            }
        }
    }

    pub fn end_frame(&self) -> bool {
        let result = self.require_core().and_then(|core| core.scheduler.end_frame());
        report(result, "end_frame").is_some()
    }

    pub fn present(&self) -> bool {
        let result = self.require_core().and_then(|core| core.scheduler.present());
        report(result, "present").is_some()
    }

    pub fn frame_phase(&self) -> FramePhase {
        self.core()
            .map_or(FramePhase::Idle, |core| core.scheduler.phase())
    }

    /// Reconfigure the presentation surface. Only valid between frames.
    pub fn resize(&self, width: u32, height: u32) -> bool {
        let result = self
            .require_core()
            .and_then(|core| core.scheduler.resize(width, height));
        report(result, "resize").is_some()
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Create a buffer, optionally filled with `data`.
    /// Returns [`ResourceId::INVALID`] on failure.
    pub fn create_buffer(&self, size: u64, usage: BufferUsage, data: Option<&[u8]>) -> ResourceId {
        let result = self
            .require_core()
            .and_then(|core| core.registry.create_buffer(size, usage, data));
        report(result, "create_buffer").unwrap_or(ResourceId::INVALID)
    }

    pub fn create_texture(&self, descriptor: &TextureDescriptor, data: Option<&[u8]>) -> ResourceId {
        let result = self
            .require_core()
            .and_then(|core| core.registry.create_texture(descriptor, data));
        report(result, "create_texture").unwrap_or(ResourceId::INVALID)
    }

    pub fn create_sampler(&self, descriptor: &SamplerDescriptor) -> ResourceId {
        let result = self
            .require_core()
            .and_then(|core| core.registry.create_sampler(descriptor));
        report(result, "create_sampler").unwrap_or(ResourceId::INVALID)
    }

    /// Destroy a resource. Unknown IDs are ignored.
    ///
    /// The ID is dead immediately; the native object is released once no
    /// in-flight frame references it.
    pub fn destroy_resource(&self, id: ResourceId) -> bool {
        self.core().is_some_and(|core| core.registry.destroy(id))
    }

    pub fn resource_count(&self) -> usize {
        self.core().map_or(0, |core| core.registry.len())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Record a draw into the current frame. Rejected outside `begin_frame`/`end_frame`.
    pub fn submit_draw_call(&self, call: DrawCall) -> bool {
        let result = self
            .require_core()
            .and_then(|core| core.recorder.submit_draw_call(call));
        reject(result, "draw call")
    }

    pub fn submit_compute(&self, dispatch: ComputeDispatch) -> bool {
        let result = self
            .require_core()
            .and_then(|core| core.recorder.submit_compute(dispatch));
        reject(result, "compute dispatch")
    }

    // ========================================================================
    // Shaders
    // ========================================================================

    /// Compile a shader, returning the cached instance for identical descriptors.
    pub fn compile_shader(&self, descriptor: &ShaderDescriptor) -> Option<Arc<CompiledShader>> {
        self.core()?.compiler.compile_shader(descriptor)
    }

    pub fn compile_shader_from_file(
        &self,
        path: impl AsRef<Path>,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Option<Arc<CompiledShader>> {
        self.core()?
            .compiler
            .compile_shader_from_file(path, stage, entry_point)
    }

    pub fn builtin_shader(&self, builtin: BuiltinShader) -> Option<Arc<CompiledShader>> {
        self.core()?.compiler.builtin(builtin)
    }

    pub fn fullscreen_vertex_shader(&self) -> Option<Arc<CompiledShader>> {
        self.builtin_shader(BuiltinShader::FullscreenVertex)
    }

    pub fn blit_fragment_shader(&self) -> Option<Arc<CompiledShader>> {
        self.builtin_shader(BuiltinShader::BlitFragment)
    }

    pub fn clear_compute_shader(&self) -> Option<Arc<CompiledShader>> {
        self.builtin_shader(BuiltinShader::ClearCompute)
    }

    /// The shader compiler, for callbacks, hot reload and cache persistence.
    pub fn shader_compiler(&self) -> Option<Arc<ShaderCompiler>> {
        Some(self.core()?.compiler.clone())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn get_stats(&self) -> RenderStats {
        let Some(core) = self.core() else {
            return RenderStats::default();
        };
        let mut stats = core.stats.snapshot();
        let shaders = core.compiler.stats();
        stats.shaders_compiled = shaders.compiled;
        stats.shader_cache_hits = shaders.cache_hits;
        stats.shader_errors = shaders.errors;
        stats.resources = core.registry.len();
        stats.memory_usage = core.registry.memory_usage();
        stats
    }

    /// Zero the frame counters. Shader counters belong to the compiler and
    /// are kept.
    pub fn reset_stats(&self) {
        if let Some(core) = self.core() {
            core.stats.reset();
        }
    }

    pub fn get_device_capabilities(&self) -> Option<DeviceCapabilities> {
        Some(self.core()?.backend.capabilities())
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn report<T>(result: GraphicsResult<T>, operation: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            log::error!("{operation} failed: {err}");
            None
        }
    }
}

fn reject(result: GraphicsResult<()>, what: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            log::warn!("Rejected {what}: {err}");
            false
        }
    }
}
