//! Double-buffered command recording.
//!
//! Two command buffers alternate between frames. Producers append to the
//! active one; the frame scheduler seals it at `end_frame`, hands its
//! commands to the backend and puts them back so the resources they captured
//! stay alive until the buffer is reopened. A buffer is only reopened after
//! its fence reports that the GPU finished the submission that used it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::MAX_FRAMES_IN_FLIGHT;
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::sync::Fence;
use crate::resources::ResourceRegistry;
use crate::shader::ShaderStage;
use crate::stats::StatsTracker;

use super::{Command, ComputeDispatch, DrawCall, RecordedDispatch, RecordedDraw};

#[derive(Debug)]
struct CommandBuffer {
    commands: Vec<Command>,
    /// No submissions are accepted while sealed
    sealed: bool,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            sealed: true,
        }
    }
}

/// Accepts draw and compute submissions from any thread.
#[derive(Debug)]
pub struct CommandRecorder {
    registry: Arc<ResourceRegistry>,
    stats: Arc<StatsTracker>,
    buffers: [Mutex<CommandBuffer>; MAX_FRAMES_IN_FLIGHT],
    fences: [Fence; MAX_FRAMES_IN_FLIGHT],
    active: AtomicUsize,
}

impl CommandRecorder {
    pub fn new(registry: Arc<ResourceRegistry>, stats: Arc<StatsTracker>) -> Self {
        Self {
            registry,
            stats,
            buffers: Default::default(),
            fences: std::array::from_fn(|_| Fence::new_signaled()),
            // The first frame records into buffer 0.
            active: AtomicUsize::new(MAX_FRAMES_IN_FLIGHT - 1),
        }
    }

    /// Record a draw into the active command buffer.
    ///
    /// Resource IDs are resolved now; IDs that are already dead are kept as
    /// missing and the draw is skipped when the frame is encoded.
    pub fn submit_draw_call(&self, call: DrawCall) -> GraphicsResult<()> {
        call.shaders.validate_graphics()?;
        let vertices = call.total_vertices();
        let triangles = call.triangle_count();

        let resolved = self.registry.resolve_all(&call.resource_ids());
        self.push(Command::Draw(RecordedDraw::new(call, resolved)))?;

        self.stats.record_draw(vertices, triangles);
        Ok(())
    }

    /// Record a compute dispatch into the active command buffer.
    pub fn submit_compute(&self, dispatch: ComputeDispatch) -> GraphicsResult<()> {
        if dispatch.shader.stage() != ShaderStage::Compute {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} is not a compute shader",
                dispatch.shader.descriptor().label()
            )));
        }
        let ids: Vec<_> = dispatch.bindings.iter().map(|b| b.resource).collect();
        let bindings = self.registry.resolve_all(&ids);
        self.push(Command::Compute(RecordedDispatch { dispatch, bindings }))?;

        self.stats.record_dispatch();
        Ok(())
    }

    fn push(&self, command: Command) -> GraphicsResult<()> {
        let index = self.active.load(Ordering::Acquire);
        let mut buffer = self.buffers[index].lock();
        if buffer.sealed {
            return Err(GraphicsError::NotRecording);
        }
        buffer.commands.push(command);
        Ok(())
    }

    /// Whether submissions are currently accepted.
    pub fn is_recording(&self) -> bool {
        !self.buffers[self.active_index()].lock().sealed
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Commands currently held by buffer `index`, either being recorded or
    /// retained for an in-flight submission.
    pub fn retained_commands(&self, index: usize) -> usize {
        self.buffers[index].lock().commands.len()
    }

    pub(crate) fn next_index(&self) -> usize {
        (self.active_index() + 1) % MAX_FRAMES_IN_FLIGHT
    }

    pub(crate) fn fence(&self, index: usize) -> &Fence {
        &self.fences[index]
    }

    /// Recycle buffer `index` and make it the recording target.
    ///
    /// The caller must have waited on the buffer's fence. Returns the number
    /// of commands released.
    pub(crate) fn open(&self, index: usize) -> usize {
        let released = {
            let mut buffer = self.buffers[index].lock();
            let released = std::mem::take(&mut buffer.commands);
            buffer.sealed = false;
            released
        };
        self.active.store(index, Ordering::Release);
        released.len()
    }

    /// Seal the active buffer and take its commands in submission order.
    pub(crate) fn seal(&self) -> (usize, Vec<Command>) {
        let index = self.active_index();
        let mut buffer = self.buffers[index].lock();
        buffer.sealed = true;
        (index, std::mem::take(&mut buffer.commands))
    }

    /// Hand submitted commands back to their sealed buffer so the resources
    /// they reference outlive the GPU work.
    pub(crate) fn retain(&self, index: usize, commands: Vec<Command>) {
        let mut buffer = self.buffers[index].lock();
        debug_assert!(buffer.sealed);
        buffer.commands = commands;
    }

    /// Seal both buffers and drop everything they hold.
    pub(crate) fn clear_all(&self) {
        for buffer in &self.buffers {
            let mut buffer = buffer.lock();
            buffer.sealed = true;
            buffer.commands.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::types::BufferUsage;
    use crate::backend::GpuBackend;
    use crate::pipeline::PipelineShaders;
    use crate::shader::{CompiledShader, ShaderCompiler, ShaderDescriptor};

    const SOURCE: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(index), 0.0, 0.0, 1.0);
}

@group(0) @binding(0) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(1)
fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = id.x;
}
"#;

    struct Fixture {
        dummy: Arc<DummyBackend>,
        registry: Arc<ResourceRegistry>,
        stats: Arc<StatsTracker>,
        recorder: CommandRecorder,
        vertex: Arc<CompiledShader>,
        compute: Arc<CompiledShader>,
    }

    fn fixture() -> Fixture {
        let dummy = Arc::new(DummyBackend::new());
        let backend: Arc<dyn GpuBackend> = dummy.clone();
        let compiler = ShaderCompiler::new(backend.clone());
        let vertex = compiler
            .compile_shader(&ShaderDescriptor::new(ShaderStage::Vertex, SOURCE, "vs_main"))
            .unwrap();
        let compute = compiler
            .compile_shader(&ShaderDescriptor::new(ShaderStage::Compute, SOURCE, "cs_main"))
            .unwrap();
        let registry = Arc::new(ResourceRegistry::new(backend, None));
        let stats = Arc::new(StatsTracker::new());
        let recorder = CommandRecorder::new(registry.clone(), stats.clone());
        Fixture {
            dummy,
            registry,
            stats,
            recorder,
            vertex,
            compute,
        }
    }

    impl Fixture {
        fn draw(&self, vertices: u32) -> DrawCall {
            DrawCall::new(PipelineShaders::graphics(self.vertex.clone(), None), vertices)
        }
    }

    #[test]
    fn test_rejects_outside_recording() {
        let f = fixture();
        assert!(!f.recorder.is_recording());
        let result = f.recorder.submit_draw_call(f.draw(3));
        assert!(matches!(result, Err(GraphicsError::NotRecording)));
        assert_eq!(f.stats.snapshot().draw_calls, 0);
    }

    #[test]
    fn test_commands_keep_submission_order() {
        let f = fixture();
        let index = f.recorder.next_index();
        assert_eq!(index, 0);
        f.recorder.open(index);

        f.recorder.submit_draw_call(f.draw(3)).unwrap();
        f.recorder
            .submit_compute(ComputeDispatch::new(f.compute.clone(), [4, 1, 1]))
            .unwrap();
        f.recorder.submit_draw_call(f.draw(6)).unwrap();

        let (sealed, commands) = f.recorder.seal();
        assert_eq!(sealed, 0);
        assert!(matches!(&commands[0], Command::Draw(d) if d.call.vertex_count == 3));
        assert!(matches!(&commands[1], Command::Compute(_)));
        assert!(matches!(&commands[2], Command::Draw(d) if d.call.vertex_count == 6));

        assert!(f.recorder.submit_draw_call(f.draw(3)).is_err());
        let stats = f.stats.snapshot();
        assert_eq!(stats.draw_calls, 2);
        assert_eq!(stats.triangles, 3);
        assert_eq!(stats.compute_dispatches, 1);
    }

    #[test]
    fn test_wrong_stage_rejected() {
        let f = fixture();
        f.recorder.open(0);
        let missing_vertex = DrawCall::new(PipelineShaders::default(), 3);
        assert!(f.recorder.submit_draw_call(missing_vertex).is_err());
        let vertex_dispatch = ComputeDispatch::new(f.vertex.clone(), [1, 1, 1]);
        assert!(f.recorder.submit_compute(vertex_dispatch).is_err());
        assert_eq!(f.recorder.retained_commands(0), 0);
        assert_eq!(f.stats.snapshot(), Default::default());
    }

    #[test]
    fn test_retained_commands_defer_release() {
        let f = fixture();
        let controls = f.dummy.controls();
        let buffer = f
            .registry
            .create_buffer(64, BufferUsage::STORAGE, None)
            .unwrap();
        let baseline = controls.live_objects();

        f.recorder.open(0);
        f.recorder
            .submit_compute(ComputeDispatch::new(f.compute.clone(), [1, 1, 1]).with_binding(0, buffer))
            .unwrap();
        let (index, commands) = f.recorder.seal();
        f.recorder.retain(index, commands);

        assert!(f.registry.destroy(buffer));
        assert_eq!(controls.live_objects(), baseline);

        f.recorder.open(1);
        assert_eq!(controls.live_objects(), baseline);
        assert_eq!(f.recorder.open(0), 1);
        assert_eq!(controls.live_objects(), baseline - 1);
    }

    #[test]
    fn test_dead_ids_recorded_as_missing() {
        let f = fixture();
        let buffer = f
            .registry
            .create_buffer(64, BufferUsage::STORAGE, None)
            .unwrap();
        f.registry.destroy(buffer);

        f.recorder.open(0);
        f.recorder
            .submit_compute(ComputeDispatch::new(f.compute.clone(), [1, 1, 1]).with_binding(0, buffer))
            .unwrap();
        let (_, commands) = f.recorder.seal();
        assert_eq!(commands[0].missing_resources(), vec![buffer]);
    }

    #[test]
    fn test_concurrent_producers() {
        let f = fixture();
        f.recorder.open(0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        f.recorder.submit_draw_call(f.draw(3)).unwrap();
                    }
                });
            }
        });

        assert_eq!(f.recorder.retained_commands(0), 400);
        assert_eq!(f.stats.snapshot().draw_calls, 400);
        assert_eq!(f.stats.snapshot().triangles, 400);
    }
}
