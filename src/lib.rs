//! # Render Core
//!
//! GPU frame-rendering core: a double-buffered command submission pipeline,
//! a thread-safe resource registry and a content-addressed shader cache.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`RenderEngine`] - Explicit context owning every component below
//! - [`ShaderCompiler`] - WGSL compilation memoized by descriptor content hash
//! - [`ResourceRegistry`] - Buffers, textures and samplers behind stable IDs
//! - [`CommandRecorder`] - Draw and compute recording from any thread
//! - [`FrameScheduler`] - The `begin_frame → end_frame → present` loop
//! - Backend support: wgpu and Dummy (for testing)
//!
//! ## Example
//!
//! ```ignore
//! use render_core::{DrawCall, PipelineShaders, RenderConfig, RenderEngine};
//!
//! let engine = RenderEngine::new(RenderConfig::default());
//! engine.initialize(window);
//!
//! let shaders = PipelineShaders::graphics(
//!     engine.fullscreen_vertex_shader().unwrap(),
//!     engine.blit_fragment_shader(),
//! );
//!
//! if engine.begin_frame() {
//!     engine.submit_draw_call(
//!         DrawCall::new(shaders, 3)
//!             .with_binding(0, texture)
//!             .with_binding(1, sampler),
//!     );
//!     engine.end_frame();
//!     engine.present();
//! }
//! ```

pub mod backend;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod ids;
pub mod pipeline;
pub mod resources;
pub mod shader;
pub mod stats;

// Re-export main types for convenience
pub use backend::dummy::{DummyBackend, DummyControls};
pub use backend::types::*;
pub use backend::{create_backend, GpuBackend, WindowTarget};
pub use commands::{
    Binding, Command, CommandRecorder, ComputeDispatch, DrawCall, IndexedDraw, RenderState,
    VertexBinding,
};
pub use config::{BackendType, QualityTier, RenderConfig, MAX_FRAMES_IN_FLIGHT};
pub use engine::RenderEngine;
pub use error::{CompilationError, GraphicsError, GraphicsResult};
pub use frame::sync::{Fence, FenceStatus};
pub use frame::{FramePhase, FrameScheduler};
pub use ids::{PipelineId, ResourceId, ShaderHash};
pub use pipeline::{PipelineCache, PipelineShaders};
pub use resources::{GpuResource, ResourceKind, ResourceRegistry};
pub use shader::{
    BuiltinShader, CompiledShader, ShaderCompiler, ShaderDescriptor, ShaderLanguage, ShaderStage,
};
pub use stats::{RenderStats, StatsTracker};

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;
