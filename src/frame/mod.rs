//! Frame scheduling.
//!
//! One presentation thread drives every frame through
//! `begin_frame → record → end_frame → present`:
//!
//! | Step | Work |
//! |------|------|
//! | `begin_frame` | acquire the surface target, wait on the next buffer's fence, recycle and open it |
//! | record | producers call `submit_*` on the [`CommandRecorder`] from any thread |
//! | `end_frame` | seal the buffer, resolve pipelines, encode and submit to the backend |
//! | `present` | present the target, update frame timing, apply the fps limiter |
//!
//! # Module Contents
//!
//! - [`FrameScheduler`] - the per-frame state machine
//! - [`Fence`](sync::Fence) - CPU wait on GPU completion of a submission

pub mod sync;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::{
    EncodedCommand, EncodedDispatch, EncodedDraw, EncodedFrame, EncodedIndex, GpuBackend,
    GpuFrameTarget,
};
use crate::commands::{Command, CommandRecorder, IndexedDraw, RecordedDispatch, RecordedDraw};
use crate::config::RenderConfig;
use crate::error::{GraphicsError, GraphicsResult};
use crate::pipeline::PipelineCache;
use crate::resources::{GpuResource, ResolvedResource, ResourceKind};
use crate::stats::StatsTracker;

/// Where the current frame is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramePhase {
    /// No frame open; `begin_frame` is next
    #[default]
    Idle,
    /// Commands are being recorded
    Recording,
    /// Work was submitted; `present` is next
    Submitted,
}

#[derive(Debug, Default)]
struct FrameState {
    phase: FramePhase,
    target: Option<GpuFrameTarget>,
    frame_start: Option<Instant>,
    last_present: Option<Instant>,
}

/// Drives the begin/end/present loop over the two command buffers.
pub struct FrameScheduler {
    backend: Arc<dyn GpuBackend>,
    recorder: Arc<CommandRecorder>,
    pipelines: Arc<PipelineCache>,
    stats: Arc<StatsTracker>,
    clear_color: [f64; 4],
    frame_budget: Option<Duration>,
    state: Mutex<FrameState>,
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("backend", &self.backend.name())
            .field("phase", &self.phase())
            .field("frame_budget", &self.frame_budget)
            .finish_non_exhaustive()
    }
}

impl FrameScheduler {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        recorder: Arc<CommandRecorder>,
        pipelines: Arc<PipelineCache>,
        stats: Arc<StatsTracker>,
        config: &RenderConfig,
    ) -> Self {
        let color = config.clear_color;
        Self {
            backend,
            recorder,
            pipelines,
            stats,
            clear_color: [color.x as f64, color.y as f64, color.z as f64, color.w as f64],
            frame_budget: (config.target_fps > 0)
                .then(|| Duration::from_secs_f64(1.0 / config.target_fps as f64)),
            state: Mutex::new(FrameState::default()),
        }
    }

    pub fn phase(&self) -> FramePhase {
        self.state.lock().phase
    }

    /// Open a new frame.
    ///
    /// Fails without side effects if a frame is already open or the surface
    /// cannot provide a target. Otherwise blocks until the GPU has finished
    /// the submission that last used the next command buffer, then recycles
    /// that buffer and starts recording into it.
    pub fn begin_frame(&self) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        if state.phase != FramePhase::Idle {
            return Err(GraphicsError::FrameSequence(format!(
                "begin_frame called while the frame is {:?}",
                state.phase
            )));
        }

        let target = self.backend.acquire_frame()?;

        let next = self.recorder.next_index();
        let fence = self.recorder.fence(next);
        if !fence.is_signaled() {
            log::trace!("Waiting for command buffer {next} to retire");
        }
        self.backend.wait_fence(fence);

        let released = self.recorder.open(next);
        if released > 0 {
            log::trace!("Recycled {released} commands from buffer {next}");
        }

        state.target = Some(target);
        state.phase = FramePhase::Recording;
        state.frame_start = Some(Instant::now());
        Ok(())
    }

    /// Seal the recording buffer and submit its commands.
    ///
    /// An empty buffer submits no GPU work. Commands that cannot be encoded
    /// (dead resources, pipeline failures) are skipped with a warning; the
    /// rest execute in submission order.
    pub fn end_frame(&self) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        if state.phase != FramePhase::Recording {
            return Err(GraphicsError::FrameSequence(
                "end_frame called without begin_frame".into(),
            ));
        }

        let (index, commands) = self.recorder.seal();
        state.phase = FramePhase::Submitted;
        if commands.is_empty() {
            return Ok(());
        }

        let Some(target) = state.target.as_ref() else {
            return Err(GraphicsError::FrameSequence("no frame target".into()));
        };
        let frame = self.encode(&commands);
        let fence = self.recorder.fence(index);
        fence.reset();
        let result = self.backend.submit_frame(target, &frame, fence);
        self.recorder.retain(index, commands);

        if let Err(err) = result {
            fence.signal();
            state.target = None;
            state.phase = FramePhase::Idle;
            return Err(err);
        }
        Ok(())
    }

    /// Present the submitted frame.
    pub fn present(&self) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        if state.phase != FramePhase::Submitted {
            return Err(GraphicsError::FrameSequence(
                "present called without a completed end_frame".into(),
            ));
        }
        let target = state
            .target
            .take()
            .ok_or_else(|| GraphicsError::FrameSequence("no frame target".into()))?;
        self.backend.present(target);
        state.phase = FramePhase::Idle;

        if let (Some(budget), Some(last)) = (self.frame_budget, state.last_present) {
            let elapsed = last.elapsed();
            if elapsed < budget {
                std::thread::sleep(budget - elapsed);
            }
        }

        let now = Instant::now();
        let frame_time = state
            .last_present
            .or(state.frame_start)
            .map_or(Duration::ZERO, |since| now - since);
        state.last_present = Some(now);
        drop(state);

        self.stats.record_frame(frame_time);
        Ok(())
    }

    /// Reconfigure the surface. Only valid between frames.
    pub fn resize(&self, width: u32, height: u32) -> GraphicsResult<()> {
        let state = self.state.lock();
        if state.phase != FramePhase::Idle {
            return Err(GraphicsError::FrameSequence(
                "resize called while a frame is open".into(),
            ));
        }
        self.backend.wait_idle();
        self.backend.resize(width, height)?;
        log::info!("Surface resized to {width}x{height}");
        Ok(())
    }

    /// Abandon any open frame, wait for the device and drop recorded commands.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.target.take().is_some() {
            log::warn!("Discarding an unpresented frame at shutdown");
        }
        state.phase = FramePhase::Idle;
        self.backend.wait_idle();
        self.recorder.clear_all();
    }

    fn encode(&self, commands: &[Command]) -> EncodedFrame {
        let mut frame = EncodedFrame {
            clear_color: self.clear_color,
            commands: Vec::with_capacity(commands.len()),
        };
        for command in commands {
            let missing = command.missing_resources();
            if !missing.is_empty() {
                log::warn!("Skipping command that references destroyed resources {missing:?}");
                continue;
            }
            let encoded = match command {
                Command::Draw(draw) => self.encode_draw(draw).map(EncodedCommand::Draw),
                Command::Compute(dispatch) => {
                    self.encode_dispatch(dispatch).map(EncodedCommand::Dispatch)
                }
            };
            match encoded {
                Ok(encoded) => frame.commands.push(encoded),
                Err(err) => log::warn!("Skipping command: {err}"),
            }
        }
        frame
    }

    fn encode_draw(&self, draw: &RecordedDraw) -> GraphicsResult<EncodedDraw> {
        let call = &draw.call;
        let (_, pipeline) = self.pipelines.render_pipeline(call)?;

        let vertex_buffers = draw
            .vertex_buffers
            .iter()
            .zip(&call.vertex_buffers)
            .map(|(resolved, binding)| Ok((buffer(resolved)?, binding.offset)))
            .collect::<GraphicsResult<Vec<_>>>()?;

        let index = match (&call.index, &draw.index_buffer) {
            (Some(index), Some(resolved)) => Some(EncodedIndex {
                buffer: index_buffer(resolved, index)?,
                format: index.format,
                indices: index.first_index..index.first_index.saturating_add(index.index_count),
                base_vertex: index.base_vertex,
            }),
            _ => None,
        };

        let bindings = call
            .bindings
            .iter()
            .zip(&draw.bindings)
            .map(|(binding, resolved)| Ok((binding.binding, live(resolved)?)))
            .collect::<GraphicsResult<Vec<_>>>()?;

        Ok(EncodedDraw {
            pipeline,
            vertex_buffers,
            index,
            bindings,
            vertices: call.first_vertex..call.first_vertex.saturating_add(call.vertex_count),
            instances: call.first_instance..call.first_instance.saturating_add(call.instance_count),
            viewport: call.state.viewport,
            scissor: call.state.scissor,
        })
    }

    fn encode_dispatch(&self, recorded: &RecordedDispatch) -> GraphicsResult<EncodedDispatch> {
        let (_, pipeline) = self.pipelines.compute_pipeline(&recorded.dispatch.shader)?;
        let bindings = recorded
            .dispatch
            .bindings
            .iter()
            .zip(&recorded.bindings)
            .map(|(binding, resolved)| Ok((binding.binding, live(resolved)?)))
            .collect::<GraphicsResult<Vec<_>>>()?;
        Ok(EncodedDispatch {
            pipeline,
            bindings,
            workgroups: recorded.dispatch.workgroups,
        })
    }
}

fn live(resolved: &ResolvedResource) -> GraphicsResult<Arc<GpuResource>> {
    resolved.resource.clone().ok_or_else(|| {
        GraphicsError::InvalidParameter(format!("{} is not a live resource", resolved.id))
    })
}

fn buffer(resolved: &ResolvedResource) -> GraphicsResult<Arc<GpuResource>> {
    let resource = live(resolved)?;
    if resource.kind() != ResourceKind::Buffer {
        return Err(GraphicsError::InvalidParameter(format!(
            "{} is a {:?}, expected a buffer",
            resolved.id,
            resource.kind()
        )));
    }
    Ok(resource)
}

/// Resolve an index buffer and check it holds every index the draw reads.
fn index_buffer(resolved: &ResolvedResource, index: &IndexedDraw) -> GraphicsResult<Arc<GpuResource>> {
    let resource = buffer(resolved)?;
    let available = resource.as_buffer().map_or(0, |b| b.descriptor.size);
    let required = (index.first_index as u64 + index.index_count as u64) * index.format.size();
    if required > available {
        return Err(GraphicsError::InvalidParameter(format!(
            "{} holds {available} bytes, the draw reads {required} bytes of {:?} indices",
            resolved.id, index.format
        )));
    }
    Ok(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, ExecutedCommand};
    use crate::backend::types::{BufferUsage, IndexFormat, SamplerDescriptor};
    use crate::commands::{ComputeDispatch, DrawCall};
    use crate::pipeline::PipelineShaders;
    use crate::resources::ResourceRegistry;
    use crate::shader::{CompiledShader, ShaderCompiler, ShaderDescriptor, ShaderStage};

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
        recorder: Arc<CommandRecorder>,
        stats: Arc<StatsTracker>,
        scheduler: FrameScheduler,
        vertex: Arc<CompiledShader>,
        compute: Arc<CompiledShader>,
    }

    fn fixture(config: RenderConfig) -> Fixture {
        let dummy = Arc::new(DummyBackend::new());
        let backend: Arc<dyn GpuBackend> = dummy.clone();
        let compiler = ShaderCompiler::new(backend.clone());
        let vertex = compiler
            .compile_shader(&ShaderDescriptor::new(ShaderStage::Vertex, SOURCE, "vs_main"))
            .unwrap();
        let compute = compiler
            .compile_shader(&ShaderDescriptor::new(ShaderStage::Compute, SOURCE, "cs_main"))
            .unwrap();
        let registry = Arc::new(ResourceRegistry::new(backend.clone(), None));
        let stats = Arc::new(StatsTracker::new());
        let recorder = Arc::new(CommandRecorder::new(registry.clone(), stats.clone()));
        let pipelines = Arc::new(PipelineCache::new(backend.clone()));
        let scheduler = FrameScheduler::new(
            backend,
            recorder.clone(),
            pipelines,
            stats.clone(),
            &config,
        );
        Fixture {
            dummy,
            registry,
            recorder,
            stats,
            scheduler,
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
    fn test_out_of_order_calls_are_rejected() {
        let f = fixture(RenderConfig::headless());
        assert!(matches!(
            f.scheduler.end_frame(),
            Err(GraphicsError::FrameSequence(_))
        ));
        assert!(f.scheduler.present().is_err());

        f.scheduler.begin_frame().unwrap();
        assert!(f.scheduler.begin_frame().is_err());
        assert!(f.scheduler.present().is_err());
        assert!(f.scheduler.resize(800, 600).is_err());
        f.scheduler.end_frame().unwrap();
        f.scheduler.present().unwrap();
        assert_eq!(f.scheduler.phase(), FramePhase::Idle);
    }

    #[test]
    fn test_empty_frame_submits_nothing() {
        let f = fixture(RenderConfig::headless());
        f.scheduler.begin_frame().unwrap();
        f.scheduler.end_frame().unwrap();
        f.scheduler.present().unwrap();

        let controls = f.dummy.controls();
        assert_eq!(controls.submitted_frames(), 0);
        assert_eq!(controls.presented_frames(), 1);
        assert_eq!(f.stats.snapshot().frames, 1);
    }

    #[test]
    fn test_surface_loss_abandons_frame() {
        let f = fixture(RenderConfig::headless());
        f.dummy.controls().set_surface_available(false);
        assert!(matches!(
            f.scheduler.begin_frame(),
            Err(GraphicsError::SurfaceLost)
        ));
        assert_eq!(f.scheduler.phase(), FramePhase::Idle);
        assert!(!f.recorder.is_recording());

        f.dummy.controls().set_surface_available(true);
        f.scheduler.begin_frame().unwrap();
        assert!(f.recorder.is_recording());
    }

    #[test]
    fn test_device_loss_fails_frames() {
        let f = fixture(RenderConfig::headless());
        let controls = f.dummy.controls();

        f.scheduler.begin_frame().unwrap();
        f.recorder.submit_draw_call(f.draw(3)).unwrap();
        controls.set_device_lost(true);
        assert!(matches!(
            f.scheduler.end_frame(),
            Err(GraphicsError::DeviceLost)
        ));
        assert_eq!(f.scheduler.phase(), FramePhase::Idle);
        assert_eq!(controls.submitted_frames(), 0);

        assert!(matches!(
            f.scheduler.begin_frame(),
            Err(GraphicsError::DeviceLost)
        ));
        assert_eq!(f.scheduler.phase(), FramePhase::Idle);
    }

    #[test]
    fn test_commands_execute_in_order() {
        let f = fixture(RenderConfig::headless());
        let storage = f
            .registry
            .create_buffer(256, BufferUsage::STORAGE, None)
            .unwrap();

        f.scheduler.begin_frame().unwrap();
        f.recorder.submit_draw_call(f.draw(3)).unwrap();
        f.recorder
            .submit_compute(ComputeDispatch::new(f.compute.clone(), [2, 1, 1]).with_binding(0, storage))
            .unwrap();
        f.recorder
            .submit_draw_call(f.draw(6).with_instances(2, 0))
            .unwrap();
        f.scheduler.end_frame().unwrap();
        f.scheduler.present().unwrap();

        assert_eq!(
            f.dummy.controls().executed_commands(),
            vec![
                ExecutedCommand::Draw { vertices: 3, instances: 1 },
                ExecutedCommand::Dispatch { workgroups: [2, 1, 1] },
                ExecutedCommand::Draw { vertices: 6, instances: 2 },
            ]
        );
    }

    #[test]
    fn test_invalid_commands_are_skipped() {
        let f = fixture(RenderConfig::headless());
        let storage = f
            .registry
            .create_buffer(256, BufferUsage::STORAGE, None)
            .unwrap();
        let sampler = f
            .registry
            .create_sampler(&SamplerDescriptor::default())
            .unwrap();
        f.registry.destroy(storage);

        f.scheduler.begin_frame().unwrap();
        f.recorder
            .submit_compute(ComputeDispatch::new(f.compute.clone(), [1, 1, 1]).with_binding(0, storage))
            .unwrap();
        f.recorder
            .submit_draw_call(f.draw(3).with_vertex_buffer(sampler, 0, Default::default()))
            .unwrap();
        f.recorder.submit_draw_call(f.draw(3)).unwrap();
        f.scheduler.end_frame().unwrap();
        f.scheduler.present().unwrap();

        assert_eq!(
            f.dummy.controls().executed_commands(),
            vec![ExecutedCommand::Draw { vertices: 3, instances: 1 }]
        );
    }

    #[test]
    fn test_indexed_draw_past_buffer_end_is_skipped() {
        let f = fixture(RenderConfig::headless());
        // Six u16 indices, 12 bytes
        let indices = f
            .registry
            .create_buffer(12, BufferUsage::INDEX, None)
            .unwrap();

        f.scheduler.begin_frame().unwrap();
        f.recorder
            .submit_draw_call(f.draw(0).with_index_buffer(indices, IndexFormat::Uint16, 6))
            .unwrap();
        f.recorder
            .submit_draw_call(f.draw(0).with_index_buffer(indices, IndexFormat::Uint32, 6))
            .unwrap();
        f.recorder
            .submit_draw_call(f.draw(0).with_index_buffer(indices, IndexFormat::Uint16, 7))
            .unwrap();
        f.scheduler.end_frame().unwrap();
        f.scheduler.present().unwrap();

        assert_eq!(
            f.dummy.controls().executed_commands(),
            vec![ExecutedCommand::Draw { vertices: 6, instances: 1 }]
        );
    }

    #[test]
    fn test_begin_waits_for_buffer_fence() {
        let f = fixture(RenderConfig::headless());
        let controls = f.dummy.controls();
        controls.set_manual_fences(true);

        for _ in 0..2 {
            f.scheduler.begin_frame().unwrap();
            f.recorder.submit_draw_call(f.draw(3)).unwrap();
            f.scheduler.end_frame().unwrap();
            f.scheduler.present().unwrap();
        }
        assert_eq!(controls.pending_submissions(), 2);
        assert!(!f.recorder.fence(0).is_signaled());

        std::thread::scope(|scope| {
            let completer = scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                // Buffer 0 still holds the commands of the first frame.
                assert_eq!(f.recorder.retained_commands(0), 1);
                controls.complete_pending()
            });
            f.scheduler.begin_frame().unwrap();
            assert_eq!(completer.join().unwrap(), 2);
        });
        assert_eq!(f.recorder.active_index(), 0);
        assert_eq!(f.recorder.retained_commands(0), 0);
    }

    #[test]
    fn test_frame_limiter() {
        let f = fixture(RenderConfig::headless().with_target_fps(50));
        let start = Instant::now();
        for _ in 0..3 {
            f.scheduler.begin_frame().unwrap();
            f.scheduler.end_frame().unwrap();
            f.scheduler.present().unwrap();
        }
        // The first frame has no predecessor to pace against.
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(f.stats.snapshot().frames, 3);
    }
}
