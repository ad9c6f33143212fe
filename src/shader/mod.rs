//! Shader descriptors, compiled shaders and the content-addressed compiler cache.
//!
//! A [`ShaderDescriptor`] is an immutable value whose content hash is computed
//! as soon as it is built. The [`ShaderCompiler`] keys its cache on that hash,
//! so two descriptors with identical content share one [`CompiledShader`].
//!
//! Only WGSL is compiled; it is the native language of the wgpu backend.
//! Descriptors in other languages fail with a "not implemented" diagnostic.

mod builtins;
mod cache_file;
mod compiler;
mod preprocess;
mod reflect;
mod watch;

pub use builtins::{BuiltinShader, ClearParams, CLEAR_WORKGROUP_SIZE};
pub use compiler::{ErrorCallback, ReloadCallback, ShaderCacheStats, ShaderCompiler};
pub use reflect::{BindingKind, ReflectedBinding, ShaderReflection, VertexInput};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::backend::GpuShaderModule;
use crate::ids::ShaderHash;

/// Pipeline stage a shader entry point runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Name of the define the preprocessor sets for this stage.
    pub fn define_name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "VERTEX",
            ShaderStage::Fragment => "FRAGMENT",
            ShaderStage::Compute => "COMPUTE",
        }
    }

    pub(crate) fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ShaderStage::Vertex => 0,
            ShaderStage::Fragment => 1,
            ShaderStage::Compute => 2,
        }
    }
}

/// Source language of a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShaderLanguage {
    #[default]
    Wgsl,
    Glsl,
    Hlsl,
    SpirV,
}

impl ShaderLanguage {
    /// Infer the language from a file extension.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "wgsl" => Some(ShaderLanguage::Wgsl),
            "glsl" | "vert" | "frag" | "comp" => Some(ShaderLanguage::Glsl),
            "hlsl" => Some(ShaderLanguage::Hlsl),
            "spv" => Some(ShaderLanguage::SpirV),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ShaderLanguage::Wgsl => 0,
            ShaderLanguage::Glsl => 1,
            ShaderLanguage::Hlsl => 2,
            ShaderLanguage::SpirV => 3,
        }
    }
}

/// Everything needed to compile one shader entry point.
///
/// Fields are private so the content hash, computed on every construction
/// and modification, always matches the content. Defines live in a sorted
/// map: the order they were added in does not change the hash, and defining
/// a name twice keeps the last value.
#[derive(Debug, Clone)]
pub struct ShaderDescriptor {
    stage: ShaderStage,
    language: ShaderLanguage,
    source: Arc<str>,
    entry_point: String,
    defines: BTreeMap<String, String>,
    optimize: bool,
    debug: bool,
    label: Option<String>,
    hash: ShaderHash,
}

impl ShaderDescriptor {
    pub fn new(
        stage: ShaderStage,
        source: impl Into<Arc<str>>,
        entry_point: impl Into<String>,
    ) -> Self {
        let mut descriptor = Self {
            stage,
            language: ShaderLanguage::Wgsl,
            source: source.into(),
            entry_point: entry_point.into(),
            defines: BTreeMap::new(),
            optimize: true,
            debug: false,
            label: None,
            hash: ShaderHash::INVALID,
        };
        descriptor.hash = descriptor.compute_hash();
        descriptor
    }

    pub fn with_language(mut self, language: ShaderLanguage) -> Self {
        self.language = language;
        self.rehash()
    }

    /// Define `name` with a value substituted wherever the name appears.
    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.insert(name.into(), value.into());
        self.rehash()
    }

    /// Define `name` without a value, for `#ifdef` checks.
    pub fn with_flag(self, name: impl Into<String>) -> Self {
        self.with_define(name, "")
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self.rehash()
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self.rehash()
    }

    /// Label used in logs and native object names. Not part of the hash.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn language(&self) -> ShaderLanguage {
        self.language
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn defines(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defines.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn define_count(&self) -> usize {
        self.defines.len()
    }

    pub fn optimize(&self) -> bool {
        self.optimize
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.entry_point)
    }

    /// The cached content hash.
    pub fn hash(&self) -> ShaderHash {
        self.hash
    }

    /// Recompute the content hash from scratch.
    pub fn compute_hash(&self) -> ShaderHash {
        let mut hasher = Xxh3::new();
        hasher.update(&[self.stage.to_u8(), self.language.to_u8()]);
        hasher.update(&[self.optimize as u8, self.debug as u8]);
        hash_str(&mut hasher, &self.entry_point);
        hash_str(&mut hasher, &self.source);
        hasher.update(&(self.defines.len() as u64).to_le_bytes());
        for (name, value) in &self.defines {
            hash_str(&mut hasher, name);
            hash_str(&mut hasher, value);
        }
        // Zero is the invalid sentinel.
        ShaderHash::from_raw(hasher.digest().max(1))
    }

    fn rehash(mut self) -> Self {
        self.hash = self.compute_hash();
        self
    }
}

fn hash_str(hasher: &mut Xxh3, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

impl PartialEq for ShaderDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.stage == other.stage
            && self.language == other.language
            && self.optimize == other.optimize
            && self.debug == other.debug
            && self.entry_point == other.entry_point
            && self.defines == other.defines
            && self.source == other.source
    }
}

impl Eq for ShaderDescriptor {}

impl std::hash::Hash for ShaderDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash.raw());
    }
}

/// A successfully compiled shader, shared with every pipeline that uses it.
#[derive(Debug)]
pub struct CompiledShader {
    descriptor: ShaderDescriptor,
    module: GpuShaderModule,
    reflection: ShaderReflection,
    diagnostics: String,
    compile_time: Duration,
}

impl CompiledShader {
    pub fn descriptor(&self) -> &ShaderDescriptor {
        &self.descriptor
    }

    pub fn hash(&self) -> ShaderHash {
        self.descriptor.hash()
    }

    pub fn stage(&self) -> ShaderStage {
        self.descriptor.stage()
    }

    pub fn entry_point(&self) -> &str {
        self.descriptor.entry_point()
    }

    pub fn module(&self) -> &GpuShaderModule {
        &self.module
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }

    /// Non-fatal diagnostics produced while compiling, empty when clean.
    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    pub fn compile_time(&self) -> Duration {
        self.compile_time
    }
}
