//! Draw and compute intents recorded between `begin_frame` and `end_frame`.
//!
//! [`DrawCall`] and [`ComputeDispatch`] are plain values: resource references
//! are IDs and render state is data, so recording never touches the device.
//! When a call is accepted it becomes a [`Command`] that also captures the
//! live resources behind those IDs.

mod recorder;

pub use recorder::CommandRecorder;

use std::sync::Arc;

use crate::backend::types::{
    BlendMode, CullMode, FrontFace, IndexFormat, PrimitiveTopology, ScissorRect,
    VertexBufferLayout, Viewport,
};
use crate::ids::ResourceId;
use crate::pipeline::PipelineShaders;
use crate::resources::ResolvedResource;
use crate::shader::CompiledShader;

/// Fixed-function and dynamic state of a draw.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub blend: BlendMode,
    /// Scissor rectangle; the whole target when `None`
    pub scissor: Option<ScissorRect>,
    /// Viewport; the whole target when `None`
    pub viewport: Option<Viewport>,
}

impl RenderState {
    /// Depth tested and written, back faces culled.
    pub fn opaque_3d() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            cull_mode: CullMode::Back,
            ..Default::default()
        }
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_scissor(mut self, scissor: ScissorRect) -> Self {
        self.scissor = Some(scissor);
        self
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = Some(viewport);
        self
    }
}

/// Index buffer of an indexed draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedDraw {
    pub buffer: ResourceId,
    pub format: IndexFormat,
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
}

/// A vertex buffer bound to the next free slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexBinding {
    pub buffer: ResourceId,
    /// Byte offset into the buffer
    pub offset: u64,
    pub layout: VertexBufferLayout,
}

/// A resource bound at `binding` in bind group 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub binding: u32,
    pub resource: ResourceId,
}

/// A draw request.
#[derive(Debug, Clone)]
pub struct DrawCall {
    pub shaders: PipelineShaders,
    pub topology: PrimitiveTopology,
    pub vertex_count: u32,
    pub first_vertex: u32,
    pub instance_count: u32,
    pub first_instance: u32,
    pub index: Option<IndexedDraw>,
    pub vertex_buffers: Vec<VertexBinding>,
    pub bindings: Vec<Binding>,
    pub state: RenderState,
}

impl DrawCall {
    /// A single-instance, non-indexed triangle list draw of `vertex_count` vertices.
    pub fn new(shaders: PipelineShaders, vertex_count: u32) -> Self {
        Self {
            shaders,
            topology: PrimitiveTopology::TriangleList,
            vertex_count,
            first_vertex: 0,
            instance_count: 1,
            first_instance: 0,
            index: None,
            vertex_buffers: Vec::new(),
            bindings: Vec::new(),
            state: RenderState::default(),
        }
    }

    pub fn with_topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_first_vertex(mut self, first_vertex: u32) -> Self {
        self.first_vertex = first_vertex;
        self
    }

    pub fn with_instances(mut self, instance_count: u32, first_instance: u32) -> Self {
        self.instance_count = instance_count;
        self.first_instance = first_instance;
        self
    }

    pub fn with_vertex_buffer(
        mut self,
        buffer: ResourceId,
        offset: u64,
        layout: VertexBufferLayout,
    ) -> Self {
        self.vertex_buffers.push(VertexBinding {
            buffer,
            offset,
            layout,
        });
        self
    }

    /// Draw `index_count` indices from `buffer` instead of consecutive vertices.
    pub fn with_index_buffer(
        mut self,
        buffer: ResourceId,
        format: IndexFormat,
        index_count: u32,
    ) -> Self {
        self.index = Some(IndexedDraw {
            buffer,
            format,
            index_count,
            first_index: 0,
            base_vertex: 0,
        });
        self
    }

    pub fn with_binding(mut self, binding: u32, resource: ResourceId) -> Self {
        self.bindings.push(Binding { binding, resource });
        self
    }

    pub fn with_state(mut self, state: RenderState) -> Self {
        self.state = state;
        self
    }

    /// Vertices (or indices, for indexed draws) consumed per instance.
    pub fn element_count(&self) -> u32 {
        self.index
            .as_ref()
            .map_or(self.vertex_count, |index| index.index_count)
    }

    /// Vertices processed across every instance.
    pub fn total_vertices(&self) -> u64 {
        self.element_count() as u64 * self.instance_count as u64
    }

    /// Triangles rasterized across every instance. Zero for point and line topologies.
    pub fn triangle_count(&self) -> u64 {
        let count = self.element_count() as u64;
        let per_instance = match self.topology {
            PrimitiveTopology::TriangleList => count / 3,
            PrimitiveTopology::TriangleStrip => count.saturating_sub(2),
            PrimitiveTopology::PointList
            | PrimitiveTopology::LineList
            | PrimitiveTopology::LineStrip => 0,
        };
        per_instance * self.instance_count as u64
    }

    /// Every resource the draw references: vertex buffers in slot order, then
    /// the index buffer, then the bindings.
    pub(crate) fn resource_ids(&self) -> Vec<ResourceId> {
        self.vertex_buffers
            .iter()
            .map(|binding| binding.buffer)
            .chain(self.index.as_ref().map(|index| index.buffer))
            .chain(self.bindings.iter().map(|binding| binding.resource))
            .collect()
    }
}

/// A compute request.
#[derive(Debug, Clone)]
pub struct ComputeDispatch {
    pub shader: Arc<CompiledShader>,
    pub workgroups: [u32; 3],
    pub bindings: Vec<Binding>,
}

impl ComputeDispatch {
    pub fn new(shader: Arc<CompiledShader>, workgroups: [u32; 3]) -> Self {
        Self {
            shader,
            workgroups,
            bindings: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: u32, resource: ResourceId) -> Self {
        self.bindings.push(Binding { binding, resource });
        self
    }
}

/// A draw captured in a command buffer.
#[derive(Debug, Clone)]
pub struct RecordedDraw {
    pub call: DrawCall,
    pub vertex_buffers: Vec<ResolvedResource>,
    pub index_buffer: Option<ResolvedResource>,
    pub bindings: Vec<ResolvedResource>,
}

impl RecordedDraw {
    /// Split resources resolved in [`DrawCall::resource_ids`] order.
    pub(crate) fn new(call: DrawCall, resolved: Vec<ResolvedResource>) -> Self {
        let mut resolved = resolved.into_iter();
        let vertex_buffers = resolved.by_ref().take(call.vertex_buffers.len()).collect();
        let index_buffer = if call.index.is_some() {
            resolved.next()
        } else {
            None
        };
        let bindings = resolved.collect();
        Self {
            call,
            vertex_buffers,
            index_buffer,
            bindings,
        }
    }
}

/// A compute dispatch captured in a command buffer.
#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    pub dispatch: ComputeDispatch,
    pub bindings: Vec<ResolvedResource>,
}

/// One recorded command.
#[derive(Debug, Clone)]
pub enum Command {
    Draw(RecordedDraw),
    Compute(RecordedDispatch),
}

impl Command {
    /// IDs that did not name a live resource when the command was recorded.
    pub fn missing_resources(&self) -> Vec<ResourceId> {
        let resolved: Box<dyn Iterator<Item = &ResolvedResource>> = match self {
            Command::Draw(draw) => Box::new(
                draw.vertex_buffers
                    .iter()
                    .chain(draw.index_buffer.iter())
                    .chain(draw.bindings.iter()),
            ),
            Command::Compute(dispatch) => Box::new(dispatch.bindings.iter()),
        };
        resolved
            .filter(|resource| !resource.is_resolved())
            .map(|resource| resource.id)
            .collect()
    }

    /// Number of live resources this command keeps alive.
    pub fn retained_resources(&self) -> usize {
        match self {
            Command::Draw(draw) => draw
                .vertex_buffers
                .iter()
                .chain(draw.index_buffer.iter())
                .chain(draw.bindings.iter())
                .filter(|resource| resource.is_resolved())
                .count(),
            Command::Compute(dispatch) => dispatch
                .bindings
                .iter()
                .filter(|resource| resource.is_resolved())
                .count(),
        }
    }
}
