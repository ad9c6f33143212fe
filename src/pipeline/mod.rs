//! Shader sets and the pipeline cache.
//!
//! Native pipelines are expensive to build, so [`PipelineCache`] creates each
//! one once. Render pipelines are keyed by [`RenderPipelineKey`] (shader set
//! hash plus fixed-function state and target format); compute pipelines by
//! the compute shader's content hash.

mod key;

pub use key::RenderPipelineKey;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use xxhash_rust::xxh3::Xxh3;

use crate::backend::types::{TextureFormat, VertexBufferLayout};
use crate::backend::{
    ComputePipelineDesc, GpuBackend, GpuComputePipeline, GpuRenderPipeline, RenderPipelineDesc,
};
use crate::commands::DrawCall;
use crate::error::{GraphicsError, GraphicsResult};
use crate::ids::{PipelineId, ShaderHash};
use crate::shader::{CompiledShader, ShaderStage};

/// The shaders a pipeline is built from.
///
/// A graphics set has a vertex shader and optionally a fragment shader; a
/// compute set has only a compute shader.
#[derive(Debug, Clone, Default)]
pub struct PipelineShaders {
    pub vertex: Option<Arc<CompiledShader>>,
    pub fragment: Option<Arc<CompiledShader>>,
    pub compute: Option<Arc<CompiledShader>>,
}

impl PipelineShaders {
    pub fn graphics(vertex: Arc<CompiledShader>, fragment: Option<Arc<CompiledShader>>) -> Self {
        Self {
            vertex: Some(vertex),
            fragment,
            compute: None,
        }
    }

    pub fn compute(shader: Arc<CompiledShader>) -> Self {
        Self {
            vertex: None,
            fragment: None,
            compute: Some(shader),
        }
    }

    /// Combined hash of the member shaders. Position matters, so a shader in
    /// the fragment slot hashes differently from the same shader elsewhere.
    pub fn hash(&self) -> ShaderHash {
        let mut hasher = Xxh3::new();
        for member in [&self.vertex, &self.fragment, &self.compute] {
            let raw = member.as_ref().map_or(0, |shader| shader.hash().raw());
            hasher.update(&raw.to_le_bytes());
        }
        ShaderHash::from_raw(hasher.digest().max(1))
    }

    /// Check that this is a well-formed graphics set and return its vertex shader.
    pub(crate) fn validate_graphics(&self) -> GraphicsResult<&Arc<CompiledShader>> {
        let vertex = self.vertex.as_ref().ok_or_else(|| {
            GraphicsError::InvalidParameter("draw call has no vertex shader".into())
        })?;
        expect_stage(vertex, ShaderStage::Vertex)?;
        if let Some(fragment) = &self.fragment {
            expect_stage(fragment, ShaderStage::Fragment)?;
        }
        if self.compute.is_some() {
            return Err(GraphicsError::InvalidParameter(
                "draw call carries a compute shader".into(),
            ));
        }
        Ok(vertex)
    }
}

fn expect_stage(shader: &CompiledShader, stage: ShaderStage) -> GraphicsResult<()> {
    if shader.stage() != stage {
        return Err(GraphicsError::InvalidParameter(format!(
            "{} is a {:?} shader, expected {stage:?}",
            shader.descriptor().label(),
            shader.stage()
        )));
    }
    Ok(())
}

/// Every location the vertex shader reads must be fed by some buffer layout.
fn check_vertex_inputs(
    vertex: &CompiledShader,
    layouts: &[VertexBufferLayout],
) -> GraphicsResult<()> {
    for input in &vertex.reflection().vertex_inputs {
        let fed = layouts
            .iter()
            .flat_map(|layout| &layout.attributes)
            .any(|attribute| attribute.location == input.location);
        if !fed {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} reads vertex location {} but no vertex buffer provides it",
                vertex.descriptor().label(),
                input.location
            )));
        }
    }
    Ok(())
}

struct CachedRenderPipeline {
    id: PipelineId,
    pipeline: Arc<GpuRenderPipeline>,
    _shaders: PipelineShaders,
}

struct CachedComputePipeline {
    id: PipelineId,
    pipeline: Arc<GpuComputePipeline>,
    _shader: Arc<CompiledShader>,
}

/// Creates native pipelines on first use and shares them afterwards.
pub struct PipelineCache {
    backend: Arc<dyn GpuBackend>,
    color_format: TextureFormat,
    sample_count: u32,
    render: Mutex<HashMap<RenderPipelineKey, CachedRenderPipeline>>,
    compute: Mutex<HashMap<ShaderHash, CachedComputePipeline>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache")
            .field("color_format", &self.color_format)
            .field("sample_count", &self.sample_count)
            .field("render", &self.render.lock().len())
            .field("compute", &self.compute.lock().len())
            .finish()
    }
}

impl PipelineCache {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        let capabilities = backend.capabilities();
        Self {
            backend,
            color_format: capabilities.surface_format,
            sample_count: capabilities.sample_count,
            render: Mutex::new(HashMap::new()),
            compute: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> PipelineId {
        PipelineId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Get or build the render pipeline for `draw`.
    ///
    /// The native pipeline is built outside the cache lock; if two threads
    /// race on the same key the first insert wins.
    pub fn render_pipeline(
        &self,
        draw: &DrawCall,
    ) -> GraphicsResult<(PipelineId, Arc<GpuRenderPipeline>)> {
        let key = RenderPipelineKey::for_draw(draw, self.color_format, self.sample_count);
        if let Some(cached) = self.render.lock().get(&key) {
            return Ok((cached.id, cached.pipeline.clone()));
        }

        let vertex = draw.shaders.validate_graphics()?;
        check_vertex_inputs(vertex, &key.vertex_layouts)?;

        let label = match &draw.shaders.fragment {
            Some(fragment) => format!("{}+{}", vertex.descriptor().label(), fragment.descriptor().label()),
            None => vertex.descriptor().label().to_string(),
        };
        let pipeline = self.backend.create_render_pipeline(&RenderPipelineDesc {
            label: &label,
            vertex_module: vertex.module(),
            vertex_entry: vertex.entry_point(),
            fragment: draw
                .shaders
                .fragment
                .as_ref()
                .map(|fragment| (fragment.module(), fragment.entry_point())),
            vertex_buffers: &key.vertex_layouts,
            topology: key.topology,
            cull_mode: key.cull_mode,
            front_face: key.front_face,
            depth_test: key.depth_test,
            depth_write: key.depth_write,
            blend: key.blend,
        })?;

        let id = self.allocate_id();
        let mut render = self.render.lock();
        let cached = render.entry(key).or_insert_with(|| {
            log::debug!("Created render pipeline {id} ({label})");
            CachedRenderPipeline {
                id,
                pipeline: Arc::new(pipeline),
                _shaders: draw.shaders.clone(),
            }
        });
        Ok((cached.id, cached.pipeline.clone()))
    }

    /// Get or build the compute pipeline for `shader`.
    pub fn compute_pipeline(
        &self,
        shader: &Arc<CompiledShader>,
    ) -> GraphicsResult<(PipelineId, Arc<GpuComputePipeline>)> {
        if let Some(cached) = self.compute.lock().get(&shader.hash()) {
            return Ok((cached.id, cached.pipeline.clone()));
        }

        expect_stage(shader, ShaderStage::Compute)?;
        let pipeline = self.backend.create_compute_pipeline(&ComputePipelineDesc {
            label: shader.descriptor().label(),
            module: shader.module(),
            entry: shader.entry_point(),
        })?;

        let id = self.allocate_id();
        let mut compute = self.compute.lock();
        let cached = compute.entry(shader.hash()).or_insert_with(|| {
            log::debug!(
                "Created compute pipeline {id} ({})",
                shader.descriptor().label()
            );
            CachedComputePipeline {
                id,
                pipeline: Arc::new(pipeline),
                _shader: shader.clone(),
            }
        });
        Ok((cached.id, cached.pipeline.clone()))
    }

    pub fn len(&self) -> usize {
        self.render.lock().len() + self.compute.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached pipeline, returning how many were released.
    pub fn clear(&self) -> usize {
        let render = std::mem::take(&mut *self.render.lock());
        let compute = std::mem::take(&mut *self.compute.lock());
        render.len() + compute.len()
    }
}
