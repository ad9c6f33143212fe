//! Content-addressed shader compiler.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::backend::GpuBackend;
use crate::error::{CompilationError, GraphicsError, GraphicsResult};
use crate::ids::ShaderHash;

use super::builtins::BuiltinShader;
use super::watch::ShaderWatcher;
use super::{
    cache_file, preprocess, reflect, CompiledShader, ShaderDescriptor, ShaderLanguage,
    ShaderStage,
};

/// Invoked with every failed compilation.
pub type ErrorCallback = Arc<dyn Fn(&CompilationError) + Send + Sync>;

/// Invoked with each watched file whose modification time changed.
pub type ReloadCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Result of a compilation shared by every caller that waited on it.
type CompileSlot = Arc<OnceLock<Result<Arc<CompiledShader>, CompilationError>>>;

/// Compiler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderCacheStats {
    /// Shaders compiled successfully
    pub compiled: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Failed compilations
    pub errors: u64,
    /// Time spent in successful compilations
    pub total_compile_time: Duration,
}

impl ShaderCacheStats {
    pub fn average_compile_time(&self) -> Duration {
        if self.compiled == 0 {
            return Duration::ZERO;
        }
        self.total_compile_time / self.compiled as u32
    }
}

/// Compiles [`ShaderDescriptor`]s into shared [`CompiledShader`]s, memoized
/// by content hash.
///
/// Compilation runs outside every lock. Concurrent requests for the same
/// content hash share one in-flight slot: the first caller compiles, the
/// others block on the slot and receive its result, so each hash is built
/// at most once. The only nested locking is `in_flight` then `cache`.
pub struct ShaderCompiler {
    backend: Arc<dyn GpuBackend>,
    cache: Mutex<HashMap<ShaderHash, Arc<CompiledShader>>>,
    in_flight: Mutex<HashMap<ShaderHash, CompileSlot>>,
    builtins: Mutex<HashMap<BuiltinShader, Arc<CompiledShader>>>,
    stats: Mutex<ShaderCacheStats>,
    watcher: Mutex<ShaderWatcher>,
    error_callback: RwLock<Option<ErrorCallback>>,
    reload_callback: RwLock<Option<ReloadCallback>>,
}

impl std::fmt::Debug for ShaderCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderCompiler")
            .field("backend", &self.backend.name())
            .field("cached", &self.cache_len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ShaderCompiler {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            builtins: Mutex::new(HashMap::new()),
            stats: Mutex::new(ShaderCacheStats::default()),
            watcher: Mutex::new(ShaderWatcher::default()),
            error_callback: RwLock::new(None),
            reload_callback: RwLock::new(None),
        }
    }

    /// Compile `descriptor`, returning `None` on failure.
    ///
    /// Failures are logged and passed to the error callback; they never
    /// populate the cache.
    pub fn compile_shader(&self, descriptor: &ShaderDescriptor) -> Option<Arc<CompiledShader>> {
        self.try_compile(descriptor).ok()
    }

    pub fn try_compile(
        &self,
        descriptor: &ShaderDescriptor,
    ) -> Result<Arc<CompiledShader>, CompilationError> {
        let hash = descriptor.hash();
        let slot = {
            let mut in_flight = self.in_flight.lock();
            let cached = self.cache.lock().get(&hash).cloned();
            if let Some(shader) = cached {
                drop(in_flight);
                self.stats.lock().cache_hits += 1;
                return Ok(shader);
            }
            Arc::clone(in_flight.entry(hash).or_default())
        };

        let mut compiled_here = false;
        let result = slot
            .get_or_init(|| {
                compiled_here = true;
                self.compile_uncached(descriptor, hash)
            })
            .clone();

        if compiled_here {
            let mut in_flight = self.in_flight.lock();
            if let Ok(shader) = &result {
                self.cache.lock().insert(hash, Arc::clone(shader));
            }
            in_flight.remove(&hash);
        } else if result.is_ok() {
            // Waited on another thread's compilation of the same content.
            self.stats.lock().cache_hits += 1;
        }
        result
    }

    fn compile_uncached(
        &self,
        descriptor: &ShaderDescriptor,
        hash: ShaderHash,
    ) -> Result<Arc<CompiledShader>, CompilationError> {
        self.stats.lock().cache_misses += 1;

        let start = Instant::now();
        match self.build(descriptor) {
            Ok((module, reflection, diagnostics)) => {
                let compile_time = start.elapsed();
                {
                    let mut stats = self.stats.lock();
                    stats.compiled += 1;
                    stats.total_compile_time += compile_time;
                }
                if !diagnostics.is_empty() {
                    log::warn!("Shader {}: {}", descriptor.label(), diagnostics);
                }
                log::debug!(
                    "Compiled shader {} ({:?}, {hash}) in {compile_time:?}",
                    descriptor.label(),
                    descriptor.stage()
                );
                Ok(Arc::new(CompiledShader {
                    descriptor: descriptor.clone(),
                    module,
                    reflection,
                    diagnostics,
                    compile_time,
                }))
            }
            Err(message) => Err(self.report_failure(descriptor.clone(), message)),
        }
    }

    /// Load and compile a shader file, inferring the language from its extension.
    pub fn compile_shader_from_file(
        &self,
        path: impl AsRef<Path>,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Option<Arc<CompiledShader>> {
        self.try_compile_file(path.as_ref(), stage, entry_point).ok()
    }

    pub fn try_compile_file(
        &self,
        path: &Path,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<Arc<CompiledShader>, CompilationError> {
        let language = ShaderLanguage::from_path(path);
        let source = std::fs::read_to_string(path);
        let descriptor = ShaderDescriptor::new(
            stage,
            source.as_deref().unwrap_or_default(),
            entry_point,
        )
        .with_language(language.unwrap_or_default())
        .with_label(path.display().to_string());

        let failure = match (&source, language) {
            (Err(err), _) => Some(format!("failed to read {}: {err}", path.display())),
            (Ok(_), None) => Some(format!(
                "cannot infer shader language of {}",
                path.display()
            )),
            (Ok(_), Some(_)) => None,
        };
        match failure {
            Some(message) => Err(self.report_failure(descriptor, message)),
            None => self.try_compile(&descriptor),
        }
    }

    /// Compile several descriptors; each slot is `None` where compilation failed.
    pub fn compile_shaders(
        &self,
        descriptors: &[ShaderDescriptor],
    ) -> Vec<Option<Arc<CompiledShader>>> {
        descriptors
            .iter()
            .map(|descriptor| self.compile_shader(descriptor))
            .collect()
    }

    /// Compile every built-in shader. Already cached built-ins are cache hits.
    pub fn initialize_builtins(&self) -> Result<(), CompilationError> {
        for builtin in BuiltinShader::ALL {
            let shader = self.try_compile(&builtin.descriptor())?;
            self.builtins.lock().insert(builtin, shader);
        }
        log::debug!("Built-in shaders ready");
        Ok(())
    }

    pub fn builtin(&self, builtin: BuiltinShader) -> Option<Arc<CompiledShader>> {
        self.builtins.lock().get(&builtin).cloned()
    }

    pub fn get_cached(&self, hash: ShaderHash) -> Option<Arc<CompiledShader>> {
        self.cache.lock().get(&hash).cloned()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Drop every cached shader except the built-ins. Pipelines keep the
    /// shaders they were created from alive.
    pub fn clear_cache(&self) -> usize {
        let reserved = self.reserved_hashes();
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|hash, _| reserved.contains(hash));
        before - cache.len()
    }

    /// Drop one cached shader. Built-ins cannot be invalidated.
    pub fn invalidate(&self, hash: ShaderHash) -> bool {
        if self.reserved_hashes().contains(&hash) {
            log::warn!("Refusing to invalidate built-in shader {hash}");
            return false;
        }
        self.cache.lock().remove(&hash).is_some()
    }

    pub fn stats(&self) -> ShaderCacheStats {
        self.stats.lock().clone()
    }

    pub fn set_error_callback(&self, callback: impl Fn(&CompilationError) + Send + Sync + 'static) {
        *self.error_callback.write() = Some(Arc::new(callback));
    }

    pub fn clear_error_callback(&self) {
        *self.error_callback.write() = None;
    }

    pub fn set_reload_callback(&self, callback: impl Fn(&Path) + Send + Sync + 'static) {
        *self.reload_callback.write() = Some(Arc::new(callback));
    }

    /// Start tracking `path` for hot reload.
    pub fn watch_file(&self, path: impl Into<PathBuf>) {
        self.watcher.lock().watch(path);
    }

    pub fn unwatch_file(&self, path: &Path) -> bool {
        self.watcher.lock().unwatch(path)
    }

    pub fn watched_files(&self) -> Vec<PathBuf> {
        self.watcher.lock().watched()
    }

    /// Report watched files changed since the last call and fire the reload
    /// callback for each one.
    ///
    /// The cache is left untouched; callers decide what to recompile.
    pub fn poll_changes(&self) -> Vec<PathBuf> {
        let changed = self.watcher.lock().poll();
        if changed.is_empty() {
            return changed;
        }
        let callback = self.reload_callback.read().clone();
        for path in &changed {
            log::info!("Shader file changed: {}", path.display());
            if let Some(callback) = &callback {
                callback(path);
            }
        }
        changed
    }

    /// Persist the descriptors of every cached shader. Returns the entry count.
    pub fn save_cache_to_disk(&self, path: impl AsRef<Path>) -> GraphicsResult<usize> {
        let mut descriptors: Vec<ShaderDescriptor> = self
            .cache
            .lock()
            .values()
            .map(|shader| shader.descriptor.clone())
            .collect();
        descriptors.sort_by_key(|d| d.hash());
        cache_file::write(path.as_ref(), &descriptors)?;
        log::info!(
            "Saved {} shader cache entries to {}",
            descriptors.len(),
            path.as_ref().display()
        );
        Ok(descriptors.len())
    }

    /// Recompile the shaders recorded by [`save_cache_to_disk`](Self::save_cache_to_disk).
    ///
    /// Entries whose stored hash does not match, or that fail to compile,
    /// are skipped. Returns how many entries are now cached.
    pub fn load_cache_from_disk(&self, path: impl AsRef<Path>) -> GraphicsResult<usize> {
        let entries = cache_file::read(path.as_ref())?;
        let mut restored = 0;
        for (stored_hash, descriptor) in entries {
            if descriptor.hash() != stored_hash {
                log::warn!(
                    "Skipping shader cache entry {}: stored hash {stored_hash} does not match {}",
                    descriptor.label(),
                    descriptor.hash()
                );
                continue;
            }
            if self.try_compile(&descriptor).is_ok() {
                restored += 1;
            }
        }
        log::info!(
            "Restored {restored} shader cache entries from {}",
            path.as_ref().display()
        );
        Ok(restored)
    }

    /// Drop every cached and built-in shader.
    pub(crate) fn release_all(&self) {
        self.builtins.lock().clear();
        self.cache.lock().clear();
    }

    fn reserved_hashes(&self) -> HashSet<ShaderHash> {
        self.builtins
            .lock()
            .values()
            .map(|shader| shader.hash())
            .collect()
    }

    fn report_failure(&self, descriptor: ShaderDescriptor, message: String) -> CompilationError {
        self.stats.lock().errors += 1;
        let error = CompilationError {
            descriptor,
            message,
        };
        log::error!("Shader compilation failed: {error}");
        let callback = self.error_callback.read().clone();
        if let Some(callback) = callback {
            callback(&error);
        }
        error
    }

    fn build(
        &self,
        descriptor: &ShaderDescriptor,
    ) -> Result<(crate::backend::GpuShaderModule, reflect::ShaderReflection, String), String> {
        if descriptor.language() != ShaderLanguage::Wgsl {
            return Err(GraphicsError::NotImplemented(format!(
                "{:?} sources cannot be compiled, only WGSL is supported",
                descriptor.language()
            ))
            .to_string());
        }

        let source = preprocess::preprocess(descriptor)?;
        let module = naga::front::wgsl::parse_str(&source)
            .map_err(|e| e.emit_to_string(&source))?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator
            .validate(&module)
            .map_err(|e| format!("validation error: {e}"))?;

        let entry_point =
            reflect::find_entry_point(&module, descriptor.stage(), descriptor.entry_point())?;
        let reflection = reflect::reflect(&module, entry_point);

        let unused: Vec<&str> = descriptor
            .defines()
            .map(|(name, _)| name)
            .filter(|name| !descriptor.source().contains(name))
            .collect();
        let diagnostics = if unused.is_empty() {
            String::new()
        } else {
            format!("define(s) never referenced: {}", unused.join(", "))
        };

        let module = self
            .backend
            .create_shader_module(descriptor.label(), &source)
            .map_err(|e| e.to_string())?;
        Ok((module, reflection, diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    const VERTEX: &str = r#"
@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position * SCALE, 1.0);
}
"#;

    fn compiler() -> ShaderCompiler {
        ShaderCompiler::new(Arc::new(DummyBackend::new()))
    }

    fn vertex() -> ShaderDescriptor {
        ShaderDescriptor::new(ShaderStage::Vertex, VERTEX, "vs_main").with_define("SCALE", "2.0")
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let compiler = compiler();
        let first = compiler.compile_shader(&vertex()).unwrap();
        let second = compiler.compile_shader(&vertex()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = compiler.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.compiled, 1);
    }

    #[test]
    fn test_concurrent_misses_compile_once() {
        let backend = DummyBackend::new();
        let controls = backend.controls();
        let compiler = ShaderCompiler::new(Arc::new(backend));
        let descriptor = vertex();
        let barrier = Barrier::new(8);

        let shaders: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        compiler.compile_shader(&descriptor).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(shaders.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        let stats = compiler.stats();
        assert_eq!(stats.compiled, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 7);
        assert_eq!(controls.live_objects(), 1);
    }

    #[test]
    fn test_failure_does_not_populate_cache() {
        let compiler = compiler();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        compiler.set_error_callback(move |err| {
            assert!(err.message.contains("vs_missing"));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let bad = ShaderDescriptor::new(ShaderStage::Vertex, VERTEX, "vs_missing")
            .with_define("SCALE", "1.0");
        assert!(compiler.compile_shader(&bad).is_none());
        assert!(compiler.compile_shader(&bad).is_none());

        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert_eq!(compiler.cache_len(), 0);
        assert_eq!(compiler.stats().errors, 2);
    }

    #[test]
    fn test_parse_error_reported() {
        let compiler = compiler();
        let err = compiler
            .try_compile(&ShaderDescriptor::new(
                ShaderStage::Fragment,
                "fn broken( {",
                "main",
            ))
            .unwrap_err();
        assert!(!err.message.is_empty());
    }

    #[test]
    fn test_undefined_identifier_fails_without_define() {
        let compiler = compiler();
        let descriptor = ShaderDescriptor::new(ShaderStage::Vertex, VERTEX, "vs_main");
        assert!(compiler.compile_shader(&descriptor).is_none());
    }

    #[rstest::rstest]
    #[case::glsl(ShaderLanguage::Glsl)]
    #[case::hlsl(ShaderLanguage::Hlsl)]
    #[case::spirv(ShaderLanguage::SpirV)]
    fn test_foreign_languages_not_implemented(#[case] language: ShaderLanguage) {
        let compiler = compiler();
        let err = compiler
            .try_compile(&vertex().with_language(language))
            .unwrap_err();
        assert!(err.message.starts_with("not implemented"));
    }

    #[test]
    fn test_builtins_survive_clear() {
        let compiler = compiler();
        compiler.initialize_builtins().unwrap();
        compiler.compile_shader(&vertex()).unwrap();
        assert_eq!(compiler.cache_len(), 4);

        assert_eq!(compiler.clear_cache(), 1);
        assert_eq!(compiler.cache_len(), 3);
        for builtin in BuiltinShader::ALL {
            let shader = compiler.builtin(builtin).unwrap();
            assert!(!compiler.invalidate(shader.hash()));
        }
    }

    #[test]
    fn test_builtins_compiled_once() {
        let compiler = compiler();
        compiler.initialize_builtins().unwrap();
        compiler.initialize_builtins().unwrap();
        let stats = compiler.stats();
        assert_eq!(stats.compiled, BuiltinShader::ALL.len() as u64);
        assert_eq!(stats.cache_hits, BuiltinShader::ALL.len() as u64);
    }

    #[test]
    fn test_unused_define_diagnostic() {
        let compiler = compiler();
        let shader = compiler
            .compile_shader(&vertex().with_flag("NEVER_USED"))
            .unwrap();
        assert!(shader.diagnostics().contains("NEVER_USED"));
        assert_eq!(shader.reflection().vertex_inputs.len(), 1);
    }

    #[test]
    fn test_average_compile_time() {
        let stats = ShaderCacheStats {
            compiled: 4,
            total_compile_time: Duration::from_millis(8),
            ..Default::default()
        };
        assert_eq!(stats.average_compile_time(), Duration::from_millis(2));
        assert_eq!(ShaderCacheStats::default().average_compile_time(), Duration::ZERO);
    }
}
