//! Shader cache integration tests: memoization, built-ins, error and reload
//! callbacks, and persistence.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use common::{TempPath, TestEngine, SCENE_WGSL};
use render_core::{BuiltinShader, ShaderDescriptor, ShaderStage};

#[test]
fn test_identical_descriptors_share_one_instance() {
    let t = TestEngine::new();
    let first = ShaderDescriptor::new(ShaderStage::Vertex, SCENE_WGSL, "vs_main");
    let second = ShaderDescriptor::new(ShaderStage::Vertex, SCENE_WGSL, "vs_main");

    let before = t.engine.get_stats();
    let a = t.engine.compile_shader(&first).unwrap();
    let b = t.engine.compile_shader(&second).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let after = t.engine.get_stats();
    assert_eq!(after.shaders_compiled, before.shaders_compiled + 1);
    assert_eq!(after.shader_cache_hits, before.shader_cache_hits + 1);
}

#[test]
fn test_builtins_compiled_once_per_engine() {
    let t = TestEngine::new();
    assert_eq!(
        t.engine.get_stats().shaders_compiled,
        BuiltinShader::ALL.len() as u64
    );

    // Asking for the built-in descriptor again is a cache hit.
    let again = t
        .engine
        .compile_shader(&BuiltinShader::FullscreenVertex.descriptor())
        .unwrap();
    assert!(Arc::ptr_eq(
        &again,
        &t.engine.fullscreen_vertex_shader().unwrap()
    ));
    assert_eq!(
        t.engine.get_stats().shaders_compiled,
        BuiltinShader::ALL.len() as u64
    );

    assert_eq!(
        t.engine.blit_fragment_shader().unwrap().stage(),
        ShaderStage::Fragment
    );
    assert_eq!(
        t.engine.clear_compute_shader().unwrap().stage(),
        ShaderStage::Compute
    );
}

#[test]
fn test_compilation_failures_reach_the_error_callback() {
    let t = TestEngine::new();
    let compiler = t.engine.shader_compiler().unwrap();
    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = Arc::clone(&failures);
        compiler.set_error_callback(move |error| {
            failures
                .lock()
                .unwrap()
                .push(error.descriptor.label().to_string());
        });
    }

    let broken = ShaderDescriptor::new(ShaderStage::Vertex, "fn vs_main( {", "vs_main")
        .with_label("broken");
    assert!(t.engine.compile_shader(&broken).is_none());
    let missing_entry =
        ShaderDescriptor::new(ShaderStage::Compute, SCENE_WGSL, "cs_missing").with_label("missing");
    assert!(t.engine.compile_shader(&missing_entry).is_none());

    assert_eq!(*failures.lock().unwrap(), vec!["broken", "missing"]);
    assert_eq!(t.engine.get_stats().shader_errors, 2);

    // Failures are not cached: fixing nothing and retrying fails again.
    assert!(t.engine.compile_shader(&broken).is_none());
    assert_eq!(t.engine.get_stats().shader_errors, 3);
}

#[test]
fn test_defines_select_shader_variants() {
    let t = TestEngine::new();
    let source = r#"
@fragment
fn fs_main() -> @location(0) vec4<f32> {
#ifdef TINTED
    return vec4<f32>(TINT, 1.0);
#else
    return vec4<f32>(1.0);
#endif
}
"#;
    let plain = ShaderDescriptor::new(ShaderStage::Fragment, source, "fs_main");
    let tinted = plain
        .clone()
        .with_flag("TINTED")
        .with_define("TINT", "0.5, 0.25, 0.0");
    let reordered = plain
        .clone()
        .with_define("TINT", "0.5, 0.25, 0.0")
        .with_flag("TINTED");

    let a = t.engine.compile_shader(&plain).unwrap();
    let b = t.engine.compile_shader(&tinted).unwrap();
    let c = t.engine.compile_shader(&reordered).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
}

#[test]
fn test_compile_from_file() {
    let t = TestEngine::new();
    let path = TempPath::new("scene.wgsl");
    std::fs::write(&path.0, SCENE_WGSL).unwrap();

    let shader = t
        .engine
        .compile_shader_from_file(&path.0, ShaderStage::Compute, "cs_main")
        .unwrap();
    assert_eq!(shader.entry_point(), "cs_main");

    let unknown = TempPath::new("scene.txt");
    std::fs::write(&unknown.0, SCENE_WGSL).unwrap();
    assert!(t
        .engine
        .compile_shader_from_file(&unknown.0, ShaderStage::Compute, "cs_main")
        .is_none());

    let missing = TempPath::new("missing.wgsl");
    assert!(t
        .engine
        .compile_shader_from_file(&missing.0, ShaderStage::Compute, "cs_main")
        .is_none());
}

#[test]
fn test_hot_reload_fires_callback_without_touching_cache() {
    let t = TestEngine::new();
    let compiler = t.engine.shader_compiler().unwrap();
    let path = TempPath::new("reload.wgsl");
    std::fs::write(&path.0, SCENE_WGSL).unwrap();

    let reloads = Arc::new(AtomicUsize::new(0));
    {
        let reloads = Arc::clone(&reloads);
        compiler.set_reload_callback(move |_| {
            reloads.fetch_add(1, Ordering::SeqCst);
        });
    }
    compiler.watch_file(&path.0);
    let cached = compiler.cache_len();
    assert!(compiler.poll_changes().is_empty());

    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path.0)
        .unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
    drop(file);

    // Change events are delivered from the watcher thread.
    let deadline = Instant::now() + Duration::from_secs(5);
    let changed = loop {
        let changed = compiler.poll_changes();
        if !changed.is_empty() || Instant::now() >= deadline {
            break changed;
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(changed, vec![path.0.clone()]);
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
    assert!(compiler.poll_changes().is_empty());
    assert_eq!(compiler.cache_len(), cached);

    assert!(compiler.unwatch_file(&path.0));
    assert!(compiler.watched_files().is_empty());
}

#[test]
fn test_cache_persists_across_engines() {
    let path = TempPath::new("cache.bin");
    let descriptors = [
        ShaderDescriptor::new(ShaderStage::Vertex, SCENE_WGSL, "vs_main"),
        ShaderDescriptor::new(ShaderStage::Compute, SCENE_WGSL, "cs_main").with_flag("FAST"),
    ];

    let saved = {
        let t = TestEngine::new();
        for descriptor in &descriptors {
            assert!(t.engine.compile_shader(descriptor).is_some());
        }
        t.engine
            .shader_compiler()
            .unwrap()
            .save_cache_to_disk(&path.0)
            .unwrap()
    };
    assert_eq!(saved, descriptors.len() + BuiltinShader::ALL.len());

    let t = TestEngine::new();
    let compiler = t.engine.shader_compiler().unwrap();
    assert_eq!(compiler.load_cache_from_disk(&path.0).unwrap(), saved);
    for descriptor in &descriptors {
        assert!(compiler.get_cached(descriptor.hash()).is_some());
    }
    // Built-ins were already cached, so only the two user shaders compiled.
    assert_eq!(
        t.engine.get_stats().shaders_compiled,
        (BuiltinShader::ALL.len() + descriptors.len()) as u64
    );
}

#[test]
fn test_loading_a_corrupt_cache_fails_cleanly() {
    let t = TestEngine::new();
    let path = TempPath::new("corrupt.bin");
    std::fs::write(&path.0, b"not a shader cache").unwrap();

    let compiler = t.engine.shader_compiler().unwrap();
    assert!(compiler.load_cache_from_disk(&path.0).is_err());
    assert!(compiler
        .load_cache_from_disk(TempPath::new("absent.bin").0.as_path())
        .is_err());
}
