//! Binding and vertex-input reflection over a validated naga module.

use crate::backend::types::VertexFormat;

use super::ShaderStage;

/// What kind of resource a binding slot expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    Texture,
    StorageTexture,
    Sampler { comparison: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub group: u32,
    pub binding: u32,
    pub name: Option<String>,
    pub kind: BindingKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInput {
    pub location: u32,
    pub name: Option<String>,
    /// `None` for types with no direct vertex format
    pub format: Option<VertexFormat>,
}

/// Interface of a compiled entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    /// Every resource binding declared by the module, sorted by (group, binding)
    pub bindings: Vec<ReflectedBinding>,
    /// Location-bound inputs of a vertex entry point, sorted by location
    pub vertex_inputs: Vec<VertexInput>,
    /// Workgroup size of a compute entry point
    pub workgroup_size: Option<[u32; 3]>,
}

impl ShaderReflection {
    pub fn binding(&self, group: u32, binding: u32) -> Option<&ReflectedBinding> {
        self.bindings
            .iter()
            .find(|b| b.group == group && b.binding == binding)
    }
}

/// Find `entry` for `stage` in `module`, or describe what is missing.
pub(crate) fn find_entry_point<'a>(
    module: &'a naga::Module,
    stage: ShaderStage,
    entry: &str,
) -> Result<&'a naga::EntryPoint, String> {
    let naga_stage = stage.to_naga();
    module
        .entry_points
        .iter()
        .find(|ep| ep.name == entry && ep.stage == naga_stage)
        .ok_or_else(|| {
            let available: Vec<String> = module
                .entry_points
                .iter()
                .map(|ep| format!("{} ({:?})", ep.name, ep.stage))
                .collect();
            format!(
                "no {stage:?} entry point named `{entry}`; available: [{}]",
                available.join(", ")
            )
        })
}

pub(crate) fn reflect(module: &naga::Module, entry_point: &naga::EntryPoint) -> ShaderReflection {
    let mut bindings: Vec<ReflectedBinding> = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let slot = var.binding.as_ref()?;
            let kind = binding_kind(module, var)?;
            Some(ReflectedBinding {
                group: slot.group,
                binding: slot.binding,
                name: var.name.clone(),
                kind,
            })
        })
        .collect();
    bindings.sort_by_key(|b| (b.group, b.binding));

    let mut vertex_inputs = Vec::new();
    if entry_point.stage == naga::ShaderStage::Vertex {
        for argument in &entry_point.function.arguments {
            match &argument.binding {
                Some(naga::Binding::Location { location, .. }) => {
                    vertex_inputs.push(VertexInput {
                        location: *location,
                        name: argument.name.clone(),
                        format: vertex_format(&module.types[argument.ty].inner),
                    });
                }
                Some(naga::Binding::BuiltIn(_)) => {}
                None => {
                    if let naga::TypeInner::Struct { members, .. } = &module.types[argument.ty].inner
                    {
                        for member in members {
                            if let Some(naga::Binding::Location { location, .. }) = member.binding
                            {
                                vertex_inputs.push(VertexInput {
                                    location,
                                    name: member.name.clone(),
                                    format: vertex_format(&module.types[member.ty].inner),
                                });
                            }
                        }
                    }
                }
            }
        }
    }
    vertex_inputs.sort_by_key(|input| input.location);

    let workgroup_size =
        (entry_point.stage == naga::ShaderStage::Compute).then_some(entry_point.workgroup_size);

    ShaderReflection {
        bindings,
        vertex_inputs,
        workgroup_size,
    }
}

fn binding_kind(module: &naga::Module, var: &naga::GlobalVariable) -> Option<BindingKind> {
    match var.space {
        naga::AddressSpace::Uniform => Some(BindingKind::UniformBuffer),
        naga::AddressSpace::Storage { access } => Some(BindingKind::StorageBuffer {
            read_only: !access.contains(naga::StorageAccess::STORE),
        }),
        naga::AddressSpace::Handle => {
            let mut inner = &module.types[var.ty].inner;
            if let naga::TypeInner::BindingArray { base, .. } = inner {
                inner = &module.types[*base].inner;
            }
            match inner {
                naga::TypeInner::Image {
                    class: naga::ImageClass::Storage { .. },
                    ..
                } => Some(BindingKind::StorageTexture),
                naga::TypeInner::Image { .. } => Some(BindingKind::Texture),
                naga::TypeInner::Sampler { comparison } => Some(BindingKind::Sampler {
                    comparison: *comparison,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

fn vertex_format(inner: &naga::TypeInner) -> Option<VertexFormat> {
    match *inner {
        naga::TypeInner::Scalar(scalar) if scalar.width == 4 => match scalar.kind {
            naga::ScalarKind::Float => Some(VertexFormat::Float32),
            naga::ScalarKind::Uint => Some(VertexFormat::Uint32),
            naga::ScalarKind::Sint => Some(VertexFormat::Sint32),
            _ => None,
        },
        naga::TypeInner::Vector { size, scalar }
            if scalar.kind == naga::ScalarKind::Float && scalar.width == 4 =>
        {
            match size {
                naga::VectorSize::Bi => Some(VertexFormat::Float32x2),
                naga::VectorSize::Tri => Some(VertexFormat::Float32x3),
                naga::VectorSize::Quad => Some(VertexFormat::Float32x4),
            }
        }
        _ => None,
    }
}
