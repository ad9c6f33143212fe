//! wgpu backend implementation.
//!
//! Renders every frame into the window surface. Draws share one depth buffer
//! and, when MSAA is active, one multisampled color target that resolves into
//! the swapchain image. Consecutive draws are grouped into a single render
//! pass; a compute dispatch between them splits the frame into separate
//! passes that load what the previous pass stored.

mod conversion;

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::RenderConfig;
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::sync::Fence;
use crate::resources::GpuResource;

use super::types::*;
use super::{
    ComputePipelineDesc, EncodedCommand, EncodedDispatch, EncodedDraw, EncodedFrame, GpuBackend,
    GpuBuffer, GpuComputePipeline, GpuFrameTarget, GpuRenderPipeline, GpuSampler,
    GpuShaderModule, GpuTexture, RenderPipelineDesc, WindowTarget,
};

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// How long [`GpuBackend::wait_fence`] polls before giving up on a fence.
const FENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fragment stage used by pipelines that only write depth.
const NULL_FRAGMENT: &str = r#"
@fragment
fn fs_null() -> @location(0) vec4<f32> {
    return vec4<f32>(0.0);
}
"#;

/// Surface configuration and the attachments sized to it.
struct SurfaceState {
    config: wgpu::SurfaceConfiguration,
    depth: Attachment,
    msaa: Option<Attachment>,
}

struct Attachment {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// wgpu-based GPU backend.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    state: Mutex<SurfaceState>,
    capabilities: DeviceCapabilities,
    surface_format: wgpu::TextureFormat,
    sample_count: u32,
    /// Cleared to when a frame is presented without being rendered
    clear_color: wgpu::Color,
    null_fragment: wgpu::ShaderModule,
    /// Error scopes are device-wide, so creation calls that open one are serialized.
    scope_lock: Mutex<()>,
    /// Set by the device lost callback; frames fail with `DeviceLost` afterwards
    device_lost: Arc<AtomicBool>,
    _instance: wgpu::Instance,
    _adapter: wgpu::Adapter,
    _window: Arc<dyn WindowTarget>,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.capabilities.adapter_name)
            .field("surface_format", &self.surface_format)
            .field("sample_count", &self.sample_count)
            .finish_non_exhaustive()
    }
}

impl WgpuBackend {
    /// Create the device and configure a surface for `window`.
    pub fn new(window: Arc<dyn WindowTarget>, config: &RenderConfig) -> GraphicsResult<Self> {
        pollster::block_on(Self::new_async(window, config))
    }

    async fn new_async(
        window: Arc<dyn WindowTarget>,
        config: &RenderConfig,
    ) -> GraphicsResult<Self> {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::all());
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| GraphicsError::Initialization(format!("surface creation: {e}")))?;

        let adapter = Self::request_adapter(&instance, &surface, config).await?;
        let info = adapter.get_info();
        log::info!("Selected GPU: {} ({:?} backend)", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("render-core device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| GraphicsError::Initialization(format!("device request: {e}")))?;

        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            log::error!("Uncaptured wgpu error: {error}");
        }));
        let device_lost = Arc::new(AtomicBool::new(false));
        let lost = Arc::clone(&device_lost);
        device.set_device_lost_callback(move |reason, message| {
            log::error!("GPU device lost ({reason:?}): {message}");
            lost.store(true, Ordering::Release);
        });

        let surface_caps = surface.get_capabilities(&adapter);
        let supports_hdr = surface_caps
            .formats
            .contains(&wgpu::TextureFormat::Rgba16Float);
        let surface_format = if config.hdr && supports_hdr {
            wgpu::TextureFormat::Rgba16Float
        } else {
            if config.hdr {
                log::warn!("HDR swapchain requested but not supported, using SDR");
            }
            surface_caps
                .formats
                .iter()
                .copied()
                .find(|f| f.is_srgb())
                .or_else(|| surface_caps.formats.first().copied())
                .ok_or_else(|| {
                    GraphicsError::Initialization("surface is incompatible with the adapter".into())
                })?
        };

        let supported_sample_counts = Self::supported_sample_counts(&adapter, surface_format);
        let sample_count = config.effective_sample_count(&supported_sample_counts);
        if config.msaa_enabled && sample_count != config.msaa_samples {
            log::warn!(
                "MSAA x{} not supported, using x{}",
                config.msaa_samples,
                sample_count
            );
        }

        let limits = device.limits();
        let (width, height) =
            clamp_extent(config.width, config.height, limits.max_texture_dimension_2d);
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode: if config.vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let state = SurfaceState {
            depth: create_attachment(&device, &surface_config, DEPTH_FORMAT, sample_count, "depth"),
            msaa: (sample_count > 1).then(|| {
                create_attachment(&device, &surface_config, surface_format, sample_count, "msaa color")
            }),
            config: surface_config,
        };

        let null_fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("null fragment"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(NULL_FRAGMENT)),
        });

        let capabilities = DeviceCapabilities {
            adapter_name: info.name.clone(),
            backend_name: format!("{:?}", info.backend),
            device_type: conversion::device_type(info.device_type),
            max_texture_dimension_2d: limits.max_texture_dimension_2d,
            max_texture_dimension_3d: limits.max_texture_dimension_3d,
            max_texture_array_layers: limits.max_texture_array_layers,
            max_buffer_size: limits.max_buffer_size,
            supported_sample_counts,
            supports_hdr,
            surface_format: conversion::texture_format_back(surface_format),
            sample_count,
        };

        Ok(Self {
            device,
            queue,
            surface,
            state: Mutex::new(state),
            capabilities,
            surface_format,
            sample_count,
            clear_color: Self::clear_color(config.clear_color.as_dvec4().to_array()),
            null_fragment,
            scope_lock: Mutex::new(()),
            device_lost,
            _instance: instance,
            _adapter: adapter,
            _window: window,
        })
    }

    async fn request_adapter(
        instance: &wgpu::Instance,
        surface: &wgpu::Surface<'static>,
        config: &RenderConfig,
    ) -> GraphicsResult<wgpu::Adapter> {
        let power_preference = if config.prefer_discrete_gpu {
            wgpu::PowerPreference::HighPerformance
        } else {
            wgpu::PowerPreference::LowPower
        };
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: Some(surface),
                force_fallback_adapter: false,
            })
            .await;

        match adapter {
            Some(adapter) => Ok(adapter),
            None if config.allow_software_fallback => {
                log::warn!("No hardware adapter found, falling back to a software adapter");
                instance
                    .request_adapter(&wgpu::RequestAdapterOptions {
                        power_preference,
                        compatible_surface: Some(surface),
                        force_fallback_adapter: true,
                    })
                    .await
                    .ok_or_else(|| GraphicsError::Initialization("no suitable adapter found".into()))
            }
            None => Err(GraphicsError::Initialization(
                "no suitable adapter found".into(),
            )),
        }
    }

    /// Sample counts usable for both the surface format and the depth buffer.
    fn supported_sample_counts(adapter: &wgpu::Adapter, format: wgpu::TextureFormat) -> Vec<u32> {
        let color = adapter
            .get_texture_format_features(format)
            .flags
            .supported_sample_counts();
        let depth = adapter
            .get_texture_format_features(DEPTH_FORMAT)
            .flags
            .supported_sample_counts();
        let mut counts: Vec<u32> = color.into_iter().filter(|c| depth.contains(c)).collect();
        if !counts.contains(&1) {
            counts.push(1);
        }
        counts.sort_unstable();
        counts
    }

    /// Run `create` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, what: &str, create: impl FnOnce() -> T) -> GraphicsResult<T> {
        let _guard = self.scope_lock.lock();
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        if let Some(error) = out_of_memory {
            return Err(GraphicsError::ResourceExhaustion(format!("{what}: {error}")));
        }
        match validation {
            Some(error) => Err(GraphicsError::ResourceCreation(format!("{what}: {error}"))),
            None => Ok(value),
        }
    }

    fn configure(&self, state: &mut SurfaceState) {
        self.surface.configure(&self.device, &state.config);
        state.depth = create_attachment(
            &self.device,
            &state.config,
            DEPTH_FORMAT,
            self.sample_count,
            "depth",
        );
        state.msaa = (self.sample_count > 1).then(|| {
            create_attachment(
                &self.device,
                &state.config,
                self.surface_format,
                self.sample_count,
                "msaa color",
            )
        });
    }

    fn bind_group(
        &self,
        layout: wgpu::BindGroupLayout,
        bindings: &[(u32, Arc<GpuResource>)],
    ) -> GraphicsResult<wgpu::BindGroup> {
        let entries = bindings
            .iter()
            .map(|(binding, resource)| {
                Ok(wgpu::BindGroupEntry {
                    binding: *binding,
                    resource: binding_resource(resource)?,
                })
            })
            .collect::<GraphicsResult<Vec<_>>>()?;
        self.scoped("bind group", || {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &layout,
                entries: &entries,
            })
        })
    }

    fn check_device(&self) -> GraphicsResult<()> {
        if self.device_lost.load(Ordering::Acquire) {
            return Err(GraphicsError::DeviceLost);
        }
        Ok(())
    }

    /// Bind group 0 of one command, `None` when it has no bindings.
    fn command_bind_group(&self, command: &EncodedCommand) -> GraphicsResult<Option<wgpu::BindGroup>> {
        let (layout, bindings) = match command {
            EncodedCommand::Draw(draw) if !draw.bindings.is_empty() => {
                (render_pipeline(&draw.pipeline)?.get_bind_group_layout(0), &draw.bindings)
            }
            EncodedCommand::Dispatch(dispatch) if !dispatch.bindings.is_empty() => (
                compute_pipeline(&dispatch.pipeline)?.get_bind_group_layout(0),
                &dispatch.bindings,
            ),
            _ => return Ok(None),
        };
        self.bind_group(layout, bindings).map(Some)
    }

    /// Bind groups for every command, in command order.
    ///
    /// A command whose bind group cannot be built gets `None` and is skipped
    /// at encode time; the rest of the frame is unaffected.
    fn bind_groups(&self, frame: &EncodedFrame) -> Vec<Option<Option<wgpu::BindGroup>>> {
        frame
            .commands
            .iter()
            .enumerate()
            .map(|(index, command)| match self.command_bind_group(command) {
                Ok(group) => Some(group),
                Err(err) => {
                    log::warn!("Skipping command {index}: bind group creation failed: {err}");
                    None
                }
            })
            .collect()
    }

    fn begin_render_pass<'e>(
        encoder: &'e mut wgpu::CommandEncoder,
        target: &'e wgpu::TextureView,
        state: &'e SurfaceState,
        clear: Option<wgpu::Color>,
    ) -> wgpu::RenderPass<'e> {
        let (view, resolve_target) = match &state.msaa {
            Some(msaa) => (&msaa.view, Some(target)),
            None => (target, None),
        };
        let (color_load, depth_load) = match clear {
            Some(color) => (wgpu::LoadOp::Clear(color), wgpu::LoadOp::Clear(1.0)),
            None => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
        };
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("frame pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target,
                ops: wgpu::Operations {
                    load: color_load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &state.depth.view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }

    fn encode_draw<'p>(
        pass: &mut wgpu::RenderPass<'p>,
        draw: &'p EncodedDraw,
        handles: DrawHandles<'p>,
        bind_group: Option<&'p wgpu::BindGroup>,
        extent: (u32, u32),
    ) {
        pass.set_pipeline(handles.pipeline);
        if let Some(group) = bind_group {
            pass.set_bind_group(0, group, &[]);
        }

        let (width, height) = extent;
        let viewport = draw
            .viewport
            .unwrap_or_else(|| Viewport::new(0.0, 0.0, width as f32, height as f32));
        pass.set_viewport(
            viewport.x,
            viewport.y,
            viewport.width,
            viewport.height,
            viewport.min_depth,
            viewport.max_depth,
        );
        let scissor = clamp_scissor(draw.scissor, width, height);
        pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);

        for (slot, (vertex_buffer, offset)) in handles.vertex_buffers.into_iter().enumerate() {
            pass.set_vertex_buffer(slot as u32, vertex_buffer.slice(offset..));
        }

        match (&draw.index, handles.index_buffer) {
            (Some(index), Some(index_buffer)) => {
                pass.set_index_buffer(index_buffer.slice(..), conversion::index_format(index.format));
                pass.draw_indexed(index.indices.clone(), index.base_vertex, draw.instances.clone());
            }
            _ => pass.draw(draw.vertices.clone(), draw.instances.clone()),
        }
    }

    fn encode_dispatch(
        encoder: &mut wgpu::CommandEncoder,
        dispatch: &EncodedDispatch,
        pipeline: &wgpu::ComputePipeline,
        bind_group: Option<&wgpu::BindGroup>,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("compute pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        if let Some(group) = bind_group {
            pass.set_bind_group(0, group, &[]);
        }
        let [x, y, z] = dispatch.workgroups;
        pass.dispatch_workgroups(x, y, z);
    }

    fn clear_color(color: [f64; 4]) -> wgpu::Color {
        wgpu::Color {
            r: color[0],
            g: color[1],
            b: color[2],
            a: color[3],
        }
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu Backend"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> GraphicsResult<GpuBuffer> {
        if let Some(data) = contents {
            if data.len() as u64 > descriptor.size {
                return Err(GraphicsError::InvalidParameter(format!(
                    "{} bytes of initial data do not fit a {} byte buffer",
                    data.len(),
                    descriptor.size
                )));
            }
        }

        // Mapped-at-creation sizes must be a multiple of COPY_BUFFER_ALIGNMENT.
        let size = match contents {
            Some(_) => wgpu::util::align_to(descriptor.size, wgpu::COPY_BUFFER_ALIGNMENT),
            None => descriptor.size,
        };
        let buffer = self.scoped("buffer", || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: descriptor.label.as_deref(),
                size,
                usage: conversion::buffer_usage(descriptor.usage),
                mapped_at_creation: contents.is_some(),
            })
        })?;

        if let Some(data) = contents {
            buffer.slice(..).get_mapped_range_mut()[..data.len()].copy_from_slice(data);
            buffer.unmap();
        }
        Ok(GpuBuffer::Wgpu(buffer))
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> GraphicsResult<GpuTexture> {
        let texture = self.scoped("texture", || {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: descriptor.label.as_deref(),
                size: wgpu::Extent3d {
                    width: descriptor.width,
                    height: descriptor.height,
                    depth_or_array_layers: descriptor.depth.max(1),
                },
                mip_level_count: descriptor.mip_levels.max(1),
                sample_count: 1,
                dimension: conversion::texture_dimension(descriptor.dimension),
                format: conversion::texture_format(descriptor.format),
                usage: conversion::texture_usage(descriptor.usage),
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuTexture::Wgpu { texture, view })
    }

    fn write_texture(
        &self,
        texture: &GpuTexture,
        descriptor: &TextureDescriptor,
        data: &[u8],
        bytes_per_row: u32,
    ) -> GraphicsResult<()> {
        let GpuTexture::Wgpu { texture, .. } = texture else {
            return Err(foreign_handle("texture"));
        };
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(descriptor.height),
            },
            wgpu::Extent3d {
                width: descriptor.width,
                height: descriptor.height,
                depth_or_array_layers: descriptor.depth.max(1),
            },
        );
        Ok(())
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> GraphicsResult<GpuSampler> {
        let sampler = self.scoped("sampler", || {
            self.device.create_sampler(&wgpu::SamplerDescriptor {
                label: descriptor.label.as_deref(),
                address_mode_u: conversion::address_mode(descriptor.address_mode_u),
                address_mode_v: conversion::address_mode(descriptor.address_mode_v),
                address_mode_w: conversion::address_mode(descriptor.address_mode_w),
                mag_filter: conversion::filter_mode(descriptor.mag_filter),
                min_filter: conversion::filter_mode(descriptor.min_filter),
                mipmap_filter: conversion::filter_mode(descriptor.mipmap_filter),
                lod_min_clamp: descriptor.lod_min_clamp,
                lod_max_clamp: descriptor.lod_max_clamp,
                compare: descriptor.compare.map(conversion::compare_function),
                anisotropy_clamp: 1,
                border_color: None,
            })
        })?;
        Ok(GpuSampler::Wgpu(sampler))
    }

    fn create_shader_module(&self, label: &str, wgsl: &str) -> GraphicsResult<GpuShaderModule> {
        let module = self.scoped(label, || {
            self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(wgsl)),
            })
        })?;
        Ok(GpuShaderModule::Wgpu(module))
    }

    fn create_render_pipeline(
        &self,
        descriptor: &RenderPipelineDesc<'_>,
    ) -> GraphicsResult<GpuRenderPipeline> {
        let GpuShaderModule::Wgpu(vertex_module) = descriptor.vertex_module else {
            return Err(foreign_handle("shader module"));
        };
        let (fragment_module, fragment_entry, write_mask) = match descriptor.fragment {
            Some((GpuShaderModule::Wgpu(module), entry)) => (module, entry, wgpu::ColorWrites::ALL),
            Some(_) => return Err(foreign_handle("shader module")),
            None => (&self.null_fragment, "fs_null", wgpu::ColorWrites::empty()),
        };

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = descriptor
            .vertex_buffers
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: conversion::vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = descriptor
            .vertex_buffers
            .iter()
            .zip(&attributes)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: conversion::step_mode(layout.step_mode),
                attributes,
            })
            .collect();

        let targets = [Some(wgpu::ColorTargetState {
            format: self.surface_format,
            blend: conversion::blend_state(descriptor.blend),
            write_mask,
        })];

        let pipeline = self.scoped(descriptor.label, || {
            self.device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(descriptor.label),
                    layout: None,
                    vertex: wgpu::VertexState {
                        module: vertex_module,
                        entry_point: descriptor.vertex_entry,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        buffers: &vertex_buffers,
                    },
                    primitive: conversion::primitive_state(
                        descriptor.topology,
                        descriptor.front_face,
                        descriptor.cull_mode,
                    ),
                    depth_stencil: Some(wgpu::DepthStencilState {
                        format: DEPTH_FORMAT,
                        depth_write_enabled: descriptor.depth_write,
                        depth_compare: if descriptor.depth_test {
                            wgpu::CompareFunction::Less
                        } else {
                            wgpu::CompareFunction::Always
                        },
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState {
                        count: self.sample_count,
                        ..Default::default()
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: fragment_module,
                        entry_point: fragment_entry,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        targets: &targets,
                    }),
                    multiview: None,
                })
        })?;
        Ok(GpuRenderPipeline::Wgpu(pipeline))
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDesc<'_>,
    ) -> GraphicsResult<GpuComputePipeline> {
        let GpuShaderModule::Wgpu(module) = descriptor.module else {
            return Err(foreign_handle("shader module"));
        };
        let pipeline = self.scoped(descriptor.label, || {
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(descriptor.label),
                    layout: None,
                    module,
                    entry_point: descriptor.entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                })
        })?;
        Ok(GpuComputePipeline::Wgpu(pipeline))
    }

    fn acquire_frame(&self) -> GraphicsResult<GpuFrameTarget> {
        self.check_device()?;
        let texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(error) => {
                let mapped = match error {
                    wgpu::SurfaceError::Lost => GraphicsError::SurfaceLost,
                    wgpu::SurfaceError::Outdated => GraphicsError::SurfaceOutdated,
                    wgpu::SurfaceError::OutOfMemory => {
                        GraphicsError::ResourceExhaustion("surface texture".into())
                    }
                    _ => GraphicsError::SurfaceTimeout,
                };
                if matches!(
                    mapped,
                    GraphicsError::SurfaceLost | GraphicsError::SurfaceOutdated
                ) {
                    let state = self.state.lock();
                    self.surface.configure(&self.device, &state.config);
                }
                return Err(mapped);
            }
        };
        if texture.suboptimal {
            log::debug!("Surface texture is suboptimal");
        }
        let view = texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuFrameTarget::Wgpu {
            texture,
            view,
            rendered: AtomicBool::new(false),
        })
    }

    fn submit_frame(
        &self,
        target: &GpuFrameTarget,
        frame: &EncodedFrame,
        fence: &Fence,
    ) -> GraphicsResult<()> {
        self.check_device()?;
        let GpuFrameTarget::Wgpu { view, rendered, .. } = target else {
            return Err(foreign_handle("frame target"));
        };

        let bind_groups = self.bind_groups(frame);
        let state = self.state.lock();
        let extent = (state.config.width, state.config.height);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            });

        let commands = &frame.commands;
        let mut clear = Some(Self::clear_color(frame.clear_color));
        let mut start = 0;
        while start < commands.len() {
            if let EncodedCommand::Dispatch(dispatch) = &commands[start] {
                if let Some(group) = &bind_groups[start] {
                    match compute_pipeline(&dispatch.pipeline) {
                        Ok(pipeline) => {
                            Self::encode_dispatch(&mut encoder, dispatch, pipeline, group.as_ref())
                        }
                        Err(err) => log::warn!("Skipping command {start}: {err}"),
                    }
                }
                start += 1;
                continue;
            }

            let end = commands[start..]
                .iter()
                .position(|command| matches!(command, EncodedCommand::Dispatch(_)))
                .map_or(commands.len(), |offset| start + offset);
            {
                let mut pass = Self::begin_render_pass(&mut encoder, view, &state, clear.take());
                for index in start..end {
                    let (EncodedCommand::Draw(draw), Some(group)) =
                        (&commands[index], &bind_groups[index])
                    else {
                        continue;
                    };
                    match DrawHandles::resolve(draw) {
                        Ok(handles) => {
                            Self::encode_draw(&mut pass, draw, handles, group.as_ref(), extent)
                        }
                        Err(err) => log::warn!("Skipping command {index}: {err}"),
                    }
                }
            }
            start = end;
        }

        // Frames without draws still clear the target.
        if clear.is_some() {
            drop(Self::begin_render_pass(&mut encoder, view, &state, clear));
        }
        drop(state);

        self.queue.submit(std::iter::once(encoder.finish()));
        let signal = fence.clone();
        self.queue.on_submitted_work_done(move || signal.signal());
        rendered.store(true, Ordering::Release);
        Ok(())
    }

    fn present(&self, target: GpuFrameTarget) {
        let GpuFrameTarget::Wgpu {
            texture,
            view,
            rendered,
        } = target
        else {
            log::warn!("Ignoring a frame target that does not belong to the wgpu backend");
            return;
        };

        if !rendered.load(Ordering::Acquire) {
            let state = self.state.lock();
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("present clear"),
                });
            drop(Self::begin_render_pass(
                &mut encoder,
                &view,
                &state,
                Some(self.clear_color),
            ));
            drop(state);
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        drop(view);
        texture.present();
    }

    fn wait_fence(&self, fence: &Fence) {
        if fence.is_signaled() {
            return;
        }
        let _ = self.device.poll(wgpu::Maintain::Wait);
        if !fence.wait_timeout(FENCE_TIMEOUT) {
            log::warn!(
                "GPU did not complete a submission within {:?}, continuing",
                FENCE_TIMEOUT
            );
            fence.signal();
        }
    }

    fn wait_idle(&self) {
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }

    fn resize(&self, width: u32, height: u32) -> GraphicsResult<()> {
        if width == 0 || height == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "surface size {width}x{height}"
            )));
        }
        let (width, height) =
            clamp_extent(width, height, self.capabilities.max_texture_dimension_2d);
        let mut state = self.state.lock();
        state.config.width = width;
        state.config.height = height;
        self.configure(&mut state);
        log::debug!("Surface resized to {width}x{height}");
        Ok(())
    }
}

fn create_attachment(
    device: &wgpu::Device,
    config: &wgpu::SurfaceConfiguration,
    format: wgpu::TextureFormat,
    sample_count: u32,
    label: &str,
) -> Attachment {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: config.width,
            height: config.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    Attachment {
        _texture: texture,
        view,
    }
}

/// Scale `(width, height)` down to fit `max` while keeping the aspect ratio.
fn clamp_extent(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width.max(1), height.max(1));
    }
    let scale = (max as f32 / width as f32).min(max as f32 / height as f32);
    (
        ((width as f32 * scale) as u32).clamp(1, max),
        ((height as f32 * scale) as u32).clamp(1, max),
    )
}

/// Intersect an optional scissor rect with the render target.
fn clamp_scissor(scissor: Option<ScissorRect>, width: u32, height: u32) -> ScissorRect {
    let full = ScissorRect {
        x: 0,
        y: 0,
        width,
        height,
    };
    let Some(rect) = scissor else {
        return full;
    };
    let x = rect.x.min(width);
    let y = rect.y.min(height);
    ScissorRect {
        x,
        y,
        width: rect.width.min(width - x),
        height: rect.height.min(height - y),
    }
}

/// Native handles of one draw, resolved before anything is set on the pass
/// so a draw with a foreign handle leaves no partial state behind.
struct DrawHandles<'a> {
    pipeline: &'a wgpu::RenderPipeline,
    vertex_buffers: Vec<(&'a wgpu::Buffer, u64)>,
    index_buffer: Option<&'a wgpu::Buffer>,
}

impl<'a> DrawHandles<'a> {
    fn resolve(draw: &'a EncodedDraw) -> GraphicsResult<Self> {
        Ok(Self {
            pipeline: render_pipeline(&draw.pipeline)?,
            vertex_buffers: draw
                .vertex_buffers
                .iter()
                .map(|(resource, offset)| Ok((buffer(resource)?, *offset)))
                .collect::<GraphicsResult<_>>()?,
            index_buffer: draw
                .index
                .as_ref()
                .map(|index| buffer(&index.buffer))
                .transpose()?,
        })
    }
}

fn foreign_handle(what: &str) -> GraphicsError {
    GraphicsError::InvalidParameter(format!("{what} was not created by the wgpu backend"))
}

fn buffer(resource: &GpuResource) -> GraphicsResult<&wgpu::Buffer> {
    match resource.as_buffer().map(|b| &b.handle) {
        Some(GpuBuffer::Wgpu(buffer)) => Ok(buffer),
        _ => Err(foreign_handle("buffer")),
    }
}

fn render_pipeline(pipeline: &GpuRenderPipeline) -> GraphicsResult<&wgpu::RenderPipeline> {
    match pipeline {
        GpuRenderPipeline::Wgpu(pipeline) => Ok(pipeline),
        GpuRenderPipeline::Dummy(_) => Err(foreign_handle("render pipeline")),
    }
}

fn compute_pipeline(pipeline: &GpuComputePipeline) -> GraphicsResult<&wgpu::ComputePipeline> {
    match pipeline {
        GpuComputePipeline::Wgpu(pipeline) => Ok(pipeline),
        GpuComputePipeline::Dummy(_) => Err(foreign_handle("compute pipeline")),
    }
}

fn binding_resource(resource: &GpuResource) -> GraphicsResult<wgpu::BindingResource<'_>> {
    match resource {
        GpuResource::Buffer(b) => match &b.handle {
            GpuBuffer::Wgpu(buffer) => Ok(buffer.as_entire_binding()),
            GpuBuffer::Dummy(_) => Err(foreign_handle("buffer")),
        },
        GpuResource::Texture(t) => match &t.handle {
            GpuTexture::Wgpu { view, .. } => Ok(wgpu::BindingResource::TextureView(view)),
            GpuTexture::Dummy(_) => Err(foreign_handle("texture")),
        },
        GpuResource::Sampler(s) => match &s.handle {
            GpuSampler::Wgpu(sampler) => Ok(wgpu::BindingResource::Sampler(sampler)),
            GpuSampler::Dummy(_) => Err(foreign_handle("sampler")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(800, 600, 4096, (800, 600))]
    #[case(8192, 4096, 4096, (4096, 2048))]
    #[case(0, 0, 4096, (1, 1))]
    fn test_clamp_extent(
        #[case] width: u32,
        #[case] height: u32,
        #[case] max: u32,
        #[case] expected: (u32, u32),
    ) {
        assert_eq!(clamp_extent(width, height, max), expected);
    }

    fn dummy_draw() -> EncodedDraw {
        let backend = crate::backend::dummy::DummyBackend::new();
        let module = backend.create_shader_module("quad", "").unwrap();
        let pipeline = backend
            .create_render_pipeline(&RenderPipelineDesc {
                label: "quad",
                vertex_module: &module,
                vertex_entry: "vs_main",
                fragment: None,
                vertex_buffers: &[],
                topology: PrimitiveTopology::TriangleList,
                cull_mode: CullMode::default(),
                front_face: FrontFace::default(),
                depth_test: false,
                depth_write: false,
                blend: BlendMode::default(),
            })
            .unwrap();
        EncodedDraw {
            pipeline: Arc::new(pipeline),
            vertex_buffers: Vec::new(),
            index: None,
            bindings: Vec::new(),
            vertices: 0..3,
            instances: 0..1,
            viewport: None,
            scissor: None,
        }
    }

    #[test]
    fn test_draw_with_foreign_pipeline_is_not_resolved() {
        let draw = dummy_draw();
        let result = DrawHandles::resolve(&draw);
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
    }

    #[test]
    fn test_scissor_is_clamped_to_target() {
        let full = clamp_scissor(None, 640, 480);
        assert_eq!((full.width, full.height), (640, 480));

        let rect = ScissorRect {
            x: 600,
            y: 10,
            width: 100,
            height: 100,
        };
        let clamped = clamp_scissor(Some(rect), 640, 480);
        assert_eq!((clamped.x, clamped.width), (600, 40));
        assert_eq!(clamped.height, 100);
    }
}
