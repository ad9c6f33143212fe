//! Shared fixtures for the integration tests.
//!
//! Every test runs the engine on the dummy backend and keeps its
//! [`DummyControls`] to steer surface availability and fence completion.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use render_core::{
    CompiledShader, DummyBackend, DummyControls, PipelineShaders, RenderConfig, RenderEngine,
    ShaderDescriptor, ShaderStage,
};

/// Vertex shader without inputs plus a storage-buffer compute kernel.
pub const SCENE_WGSL: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(i32(index) - 1);
    let y = f32(i32(index & 1u) * 2 - 1);
    return vec4<f32>(x, y, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.5, 0.0, 1.0);
}

@group(0) @binding(0) var<storage, read_write> values: array<u32>;

@compute @workgroup_size(64)
fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
    values[id.x] = id.x;
}
"#;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An initialized engine on the dummy backend.
pub struct TestEngine {
    pub engine: RenderEngine,
    pub controls: Arc<DummyControls>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(RenderConfig::headless())
    }

    pub fn with_config(config: RenderConfig) -> Self {
        init_logging();
        let backend = DummyBackend::new();
        let controls = backend.controls();
        let engine = RenderEngine::new(config);
        assert!(engine.initialize_with_backend(Arc::new(backend)));
        Self { engine, controls }
    }

    pub fn compile(&self, stage: ShaderStage, entry: &str) -> Arc<CompiledShader> {
        self.engine
            .compile_shader(&ShaderDescriptor::new(stage, SCENE_WGSL, entry))
            .expect("scene shader compiles")
    }

    pub fn scene_shaders(&self) -> PipelineShaders {
        PipelineShaders::graphics(
            self.compile(ShaderStage::Vertex, "vs_main"),
            Some(self.compile(ShaderStage::Fragment, "fs_main")),
        )
    }

    pub fn compute_shader(&self) -> Arc<CompiledShader> {
        self.compile(ShaderStage::Compute, "cs_main")
    }

    /// Run `record` inside one complete frame.
    pub fn frame(&self, record: impl FnOnce(&RenderEngine)) {
        assert!(self.engine.begin_frame());
        record(&self.engine);
        assert!(self.engine.end_frame());
        assert!(self.engine.present());
    }
}

/// A per-process path in the temp directory; removed on drop.
pub struct TempPath(pub PathBuf);

impl TempPath {
    pub fn new(name: &str) -> Self {
        Self(std::env::temp_dir().join(format!(
            "render-core-test-{}-{name}",
            std::process::id()
        )))
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
