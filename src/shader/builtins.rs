//! Shaders compiled at initialization and always available.

use bytemuck::{Pod, Zeroable};

use super::{ShaderDescriptor, ShaderStage};

const FULLSCREEN_VERTEX: &str = r#"
struct FullscreenOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

// One oversized triangle covering the viewport; draw with 3 vertices.
@vertex
fn vs_fullscreen(@builtin(vertex_index) index: u32) -> FullscreenOutput {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: FullscreenOutput;
    out.position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2<f32>(uv.x, 1.0 - uv.y);
    return out;
}
"#;

const BLIT_FRAGMENT: &str = r#"
@group(0) @binding(0) var source_texture: texture_2d<f32>;
@group(0) @binding(1) var source_sampler: sampler;

@fragment
fn fs_blit(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(source_texture, source_sampler, uv);
}
"#;

const CLEAR_COMPUTE: &str = r#"
struct ClearParams {
    value: vec4<f32>,
    count: u32,
}

@group(0) @binding(0) var<uniform> params: ClearParams;
@group(0) @binding(1) var<storage, read_write> destination: array<vec4<f32>>;

@compute @workgroup_size(64)
fn cs_clear(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.count) {
        return;
    }
    destination[id.x] = params.value;
}
"#;

/// Workgroup width of [`BuiltinShader::ClearCompute`].
pub const CLEAR_WORKGROUP_SIZE: u32 = 64;

/// Uniform block consumed by [`BuiltinShader::ClearCompute`] at binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ClearParams {
    pub value: [f32; 4],
    pub count: u32,
    pub _padding: [u32; 3],
}

impl ClearParams {
    pub fn new(value: [f32; 4], count: u32) -> Self {
        Self {
            value,
            count,
            _padding: [0; 3],
        }
    }

    /// Workgroups needed to clear `count` elements.
    pub fn workgroups(&self) -> [u32; 3] {
        [self.count.div_ceil(CLEAR_WORKGROUP_SIZE), 1, 1]
    }
}

/// Shaders the compiler builds at initialization under reserved keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinShader {
    /// Fullscreen triangle vertex shader, outputs uv at location 0
    FullscreenVertex,
    /// Samples a texture (binding 0) with a sampler (binding 1)
    BlitFragment,
    /// Fills a `vec4<f32>` storage array (binding 1) with a value (binding 0)
    ClearCompute,
}

impl BuiltinShader {
    pub const ALL: [BuiltinShader; 3] = [
        BuiltinShader::FullscreenVertex,
        BuiltinShader::BlitFragment,
        BuiltinShader::ClearCompute,
    ];

    pub fn descriptor(self) -> ShaderDescriptor {
        let (stage, source, entry, label) = match self {
            BuiltinShader::FullscreenVertex => (
                ShaderStage::Vertex,
                FULLSCREEN_VERTEX,
                "vs_fullscreen",
                "builtin::fullscreen_vertex",
            ),
            BuiltinShader::BlitFragment => (
                ShaderStage::Fragment,
                BLIT_FRAGMENT,
                "fs_blit",
                "builtin::blit_fragment",
            ),
            BuiltinShader::ClearCompute => (
                ShaderStage::Compute,
                CLEAR_COMPUTE,
                "cs_clear",
                "builtin::clear_compute",
            ),
        };
        ShaderDescriptor::new(stage, source, entry).with_label(label)
    }
}
