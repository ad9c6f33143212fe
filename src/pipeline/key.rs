//! Hashable pipeline cache keys.
//!
//! A render pipeline is identified by its shaders plus every piece of
//! fixed-function state baked into the native object. Dynamic state
//! (viewport, scissor) is set per draw and stays out of the key.

use crate::backend::types::{
    BlendMode, CullMode, FrontFace, PrimitiveTopology, TextureFormat, VertexBufferLayout,
};
use crate::commands::DrawCall;
use crate::ids::ShaderHash;

/// Identity of a render pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPipelineKey {
    pub shaders: ShaderHash,
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: BlendMode,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub color_format: TextureFormat,
    pub sample_count: u32,
}

impl RenderPipelineKey {
    pub fn for_draw(draw: &DrawCall, color_format: TextureFormat, sample_count: u32) -> Self {
        Self {
            shaders: draw.shaders.hash(),
            topology: draw.topology,
            cull_mode: draw.state.cull_mode,
            front_face: draw.state.front_face,
            depth_test: draw.state.depth_test,
            depth_write: draw.state.depth_write,
            blend: draw.state.blend,
            vertex_layouts: draw
                .vertex_buffers
                .iter()
                .map(|binding| binding.layout.clone())
                .collect(),
            color_format,
            sample_count,
        }
    }
}
