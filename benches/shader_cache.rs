use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use render_core::{DummyBackend, ShaderCompiler, ShaderDescriptor, ShaderStage};

const SOURCE: &str = r#"
@group(0) @binding(0) var<storage, read_write> values: array<f32>;

@compute @workgroup_size(64)
fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
#ifdef SCALE
    values[id.x] = values[id.x] * SCALE;
#else
    values[id.x] = 0.0;
#endif
}
"#;

fn descriptor(defines: usize) -> ShaderDescriptor {
    (0..defines).fold(
        ShaderDescriptor::new(ShaderStage::Compute, SOURCE, "cs_main"),
        |descriptor, i| descriptor.with_define(format!("OPTION_{i}"), i.to_string()),
    )
}

// ---------------------------------------------------------------------------
// Descriptor hashing
// ---------------------------------------------------------------------------

fn bench_hash_no_defines(c: &mut Criterion) {
    let descriptor = descriptor(0);
    c.bench_function("shader_hash_no_defines", |b| {
        b.iter(|| black_box(descriptor.compute_hash()));
    });
}

fn bench_hash_16_defines(c: &mut Criterion) {
    let descriptor = descriptor(16);
    c.bench_function("shader_hash_16_defines", |b| {
        b.iter(|| black_box(descriptor.compute_hash()));
    });
}

// ---------------------------------------------------------------------------
// Cache lookups
// ---------------------------------------------------------------------------

fn bench_cache_hit(c: &mut Criterion) {
    let compiler = ShaderCompiler::new(Arc::new(DummyBackend::new()));
    let descriptor = descriptor(4).with_define("SCALE", "2.0");
    compiler.compile_shader(&descriptor).unwrap();

    c.bench_function("shader_compile_cache_hit", |b| {
        b.iter(|| black_box(compiler.compile_shader(&descriptor)));
    });
}

fn bench_cache_miss(c: &mut Criterion) {
    c.bench_function("shader_compile_cache_miss", |b| {
        b.iter_with_setup(
            || ShaderCompiler::new(Arc::new(DummyBackend::new())),
            |compiler| black_box(compiler.compile_shader(&descriptor(0))),
        );
    });
}

criterion_group!(
    benches,
    bench_hash_no_defines,
    bench_hash_16_defines,
    bench_cache_hit,
    bench_cache_miss,
);
criterion_main!(benches);
