//! GPU execution of prepared frames.
//!
//! A [`GpuContext`] owns the wgpu device, the surface (if any) and a cache
//! of render pipelines keyed by material type and batch shape. It executes a
//! [`Frame`] in a single render pass: opaque batches front to back with
//! depth writes, then alpha batches back to front. Stencil clipping wraps
//! batches by diffing each batch's clip stack against the previous one, so
//! shared clips are set up once.

use std::any::TypeId;
use std::num::NonZeroU64;
use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;
use wgpu::util::DeviceExt;
use wgpu::{CompositeAlphaMode, InstanceDescriptor, SurfaceTarget};

use crate::frame::{BatchDrawKind, ClipDraw, Frame};
use crate::geometry::{DrawingMode, IndexData};
use crate::material::{CallbackState, MaterialFlags};
use crate::pipeline::{
    create_clip_pipeline, create_content_pipeline, create_depth_texture, draw_bind_group_layout,
    material_bind_group_layout, ContentPipelineParams, DrawUniforms, DRAW_UNIFORM_STRIDE,
};
use crate::renderer::{BufferStrategy, Renderer};
use crate::scene::{NodeId, Scene};
use crate::shadow::BatchId;
use crate::transform::Mat4;

/// Failures while setting up a [`GpuContext`].
///
/// Presentation failures are reported separately as [`wgpu::SurfaceError`]
/// by [`GpuContext::render`], since callers usually want to reconfigure on
/// `Lost`/`Outdated` rather than treat them as fatal.
#[derive(Debug, thiserror::Error)]
pub enum GpuContextError {
    #[error("no suitable gpu adapter: {0}")]
    NoAdapter(#[from] wgpu::RequestAdapterError),
    #[error("failed to create device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error("failed to create surface: {0}")]
    CreateSurface(#[from] wgpu::CreateSurfaceError),
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    material: TypeId,
    mode: DrawingMode,
    formats: SmallVec<[(wgpu::VertexFormat, bool); 4]>,
    strip_index_format: Option<wgpu::IndexFormat>,
    merged: bool,
    opaque: bool,
    stenciled: bool,
    uniforms: bool,
}

struct PreparedClip {
    vertices: wgpu::Buffer,
    indices: Option<(wgpu::Buffer, wgpu::IndexFormat, u32)>,
    vertex_count: u32,
    uniform_offset: u32,
}

enum PreparedKind {
    Merged {
        buffer: wgpu::Buffer,
        sets: SmallVec<[crate::batch::DrawSet; 1]>,
        uniform_offset: u32,
    },
    Unmerged {
        buffer: wgpu::Buffer,
        elements: Vec<(crate::frame::ElementDraw, u32)>,
    },
    Callback {
        node: NodeId,
        state: CallbackState,
    },
}

struct PreparedBatch {
    pipeline: Option<Arc<wgpu::RenderPipeline>>,
    material_bind_group: Option<wgpu::BindGroup>,
    clips: Vec<NodeId>,
    kind: PreparedKind,
}

/// Owns the wgpu device and executes prepared frames.
pub struct GpuContext {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: Option<wgpu::Surface<'static>>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,

    pipelines: AHashMap<PipelineKey, Option<Arc<wgpu::RenderPipeline>>>,
    clip_increment_pipeline: wgpu::RenderPipeline,
    clip_decrement_pipeline: wgpu::RenderPipeline,
    draw_layout: wgpu::BindGroupLayout,
    material_layout: wgpu::BindGroupLayout,

    uniform_buffer: Option<wgpu::Buffer>,
    uniform_bind_group: Option<wgpu::BindGroup>,
    uniform_capacity: u64,

    depth_texture: Option<wgpu::TextureView>,
    depth_size: (u32, u32),

    /// Clear color of the frame's render pass.
    pub clear_color: wgpu::Color,
}

impl GpuContext {
    pub async fn new(
        window: impl Into<SurfaceTarget<'static>>,
        physical_size: (u32, u32),
        vsync: bool,
    ) -> Result<Self, GpuContextError> {
        let instance = wgpu::Instance::new(&InstanceDescriptor::default());
        let surface = instance.create_surface(window)?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
                trace: Default::default(),
            })
            .await?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            format: wgpu::TextureFormat::Bgra8UnormSrgb,
            width: physical_size.0,
            height: physical_size.1,
            present_mode: if vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            desired_maximum_frame_latency: 2,
            alpha_mode: CompositeAlphaMode::Opaque,
            view_formats: vec![],
        };
        surface.configure(&device, &config);

        Ok(Self::build_from_device(
            instance,
            Some(surface),
            device,
            queue,
            config,
        ))
    }

    /// Creates a headless context without a window surface.
    ///
    /// Use [`GpuContext::render_to_buffer`] to read back rendered pixels.
    /// Returns `None` when no suitable adapter is available, so tests can
    /// skip gracefully on machines without a GPU.
    pub async fn try_new_headless(physical_size: (u32, u32)) -> Option<Self> {
        let instance = wgpu::Instance::new(&InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok()?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
                trace: Default::default(),
            })
            .await
            .ok()?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            width: physical_size.0,
            height: physical_size.1,
            present_mode: wgpu::PresentMode::AutoVsync,
            desired_maximum_frame_latency: 2,
            alpha_mode: CompositeAlphaMode::Opaque,
            view_formats: vec![],
        };

        Some(Self::build_from_device(instance, None, device, queue, config))
    }

    fn build_from_device(
        instance: wgpu::Instance,
        surface: Option<wgpu::Surface<'static>>,
        device: wgpu::Device,
        queue: wgpu::Queue,
        config: wgpu::SurfaceConfiguration,
    ) -> Self {
        let clip_increment_pipeline = create_clip_pipeline(&device, config.format, true);
        let clip_decrement_pipeline = create_clip_pipeline(&device, config.format, false);
        let draw_layout = draw_bind_group_layout(&device);
        let material_layout = material_bind_group_layout(&device);

        Self {
            instance,
            surface,
            device,
            queue,
            config,
            pipelines: AHashMap::new(),
            clip_increment_pipeline,
            clip_decrement_pipeline,
            draw_layout,
            material_layout,
            uniform_buffer: None,
            uniform_bind_group: None,
            uniform_capacity: 0,
            depth_texture: None,
            depth_size: (0, 0),
            clear_color: wgpu::Color::BLACK,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn surface_format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    pub fn resize(&mut self, physical_size: (u32, u32)) {
        if physical_size.0 == 0 || physical_size.1 == 0 {
            return;
        }
        self.config.width = physical_size.0;
        self.config.height = physical_size.1;
        if let Some(surface) = &self.surface {
            surface.configure(&self.device, &self.config);
        }
        self.depth_texture = None;
    }

    /// Renders a frame to the surface.
    ///
    /// Panics on a headless context; use [`GpuContext::render_to_buffer`]
    /// there instead.
    pub fn render(
        &mut self,
        scene: &mut Scene,
        renderer: &mut Renderer,
        frame: &Frame,
    ) -> Result<(), wgpu::SurfaceError> {
        let surface = self
            .surface
            .as_ref()
            .expect("render() requires a surface, use render_to_buffer() on headless contexts");
        let output = surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        self.execute(scene, renderer, frame, &view);
        output.present();
        Ok(())
    }

    /// Renders a frame to a caller-provided texture view in the surface
    /// format.
    pub fn render_to_texture(
        &mut self,
        scene: &mut Scene,
        renderer: &mut Renderer,
        frame: &Frame,
        view: &wgpu::TextureView,
    ) {
        self.execute(scene, renderer, frame, view);
    }

    /// Renders a frame offscreen and reads the pixels back, tightly packed
    /// in the surface format.
    pub fn render_to_buffer(
        &mut self,
        scene: &mut Scene,
        renderer: &mut Renderer,
        frame: &Frame,
    ) -> Vec<u8> {
        let (width, height) = (self.config.width, self.config.height);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("strata offscreen target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.config.format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.execute(scene, renderer, frame, &view);

        let bytes_per_row = (width * 4).next_multiple_of(256);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("strata readback"),
            size: bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("strata readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            if sender.send(result).is_err() {
                log::warn!("readback receiver dropped before map_async completed");
            }
        });
        let _ = self.device.poll(wgpu::MaintainBase::Wait);

        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        match receiver.recv() {
            Ok(Ok(())) => {
                let mapped = slice.get_mapped_range();
                for row in 0..height {
                    let start = (row * bytes_per_row) as usize;
                    pixels.extend_from_slice(&mapped[start..start + (width * 4) as usize]);
                }
            }
            other => log::warn!("failed to map readback buffer: {other:?}"),
        }
        readback.unmap();
        pixels
    }

    fn content_pipeline(
        &mut self,
        scene: &Scene,
        draw: &crate::frame::BatchDraw,
        merged: bool,
    ) -> Option<Arc<wgpu::RenderPipeline>> {
        let material = scene.material(draw.first_node)?;
        let geometry = scene.geometry(draw.first_node)?;
        let layout = geometry.layout();

        let strip_index_format = match draw.mode {
            DrawingMode::TriangleStrip | DrawingMode::LineStrip => Some(if merged {
                wgpu::IndexFormat::Uint16
            } else {
                geometry.indices().format()
            }),
            _ => None,
        };
        let has_uniforms = !material.uniform_data().is_empty();
        let stenciled = !draw.clips.is_empty();

        let key = PipelineKey {
            material: crate::material::material_type(material),
            mode: draw.mode,
            formats: layout
                .attributes()
                .iter()
                .map(|a| (a.format, a.is_position))
                .collect(),
            strip_index_format,
            merged,
            opaque: draw.opaque,
            stenciled,
            uniforms: has_uniforms,
        };
        if let Some(cached) = self.pipelines.get(&key) {
            return cached.clone();
        }

        let shader = material.shader();
        let params = ContentPipelineParams {
            format: self.config.format,
            shader: &shader,
            layout,
            mode: draw.mode,
            strip_index_format,
            merged,
            opaque: draw.opaque,
            stenciled,
            blending: material.flags().contains(MaterialFlags::BLENDING),
            has_material_uniforms: has_uniforms,
        };

        // A broken material shader must not take the whole device down, so
        // pipeline creation runs inside an error scope and failures are
        // cached as holes that render nothing.
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = create_content_pipeline(&self.device, &params);
        let error = pollster::block_on(self.device.pop_error_scope());
        let entry = match error {
            None => Some(Arc::new(pipeline)),
            Some(e) => {
                log::warn!("pipeline for material {:?} failed validation: {e}", shader.label);
                None
            }
        };
        self.pipelines.insert(key, entry.clone());
        entry
    }

    fn sync_batch_buffer(&self, renderer: &mut Renderer, bid: BatchId) -> Option<wgpu::Buffer> {
        let strategy = renderer.buffer_strategy();
        let buffer = renderer.batch_buffer_mut(bid);
        if buffer.data.is_empty() {
            return None;
        }
        let usage = wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::INDEX;

        if buffer.gpu_dirty || buffer.gpu.is_none() {
            let recreate = match (&buffer.gpu, strategy) {
                (_, BufferStrategy::Static) => true,
                (None, _) => true,
                (Some(gpu), _) => gpu.size() != buffer.data.len() as u64,
            };
            if recreate {
                let usage = match strategy {
                    BufferStrategy::Static => usage,
                    _ => usage | wgpu::BufferUsages::COPY_DST,
                };
                buffer.gpu = Some(self.device.create_buffer_init(
                    &wgpu::util::BufferInitDescriptor {
                        label: Some("strata batch"),
                        contents: &buffer.data,
                        usage,
                    },
                ));
            } else if let Some(gpu) = &buffer.gpu {
                self.queue.write_buffer(gpu, 0, &buffer.data);
            }
            buffer.gpu_dirty = false;
        }
        buffer.gpu.clone()
    }

    fn push_uniform(data: &mut Vec<u8>, uniform: DrawUniforms) -> u32 {
        let offset = data.len() as u32;
        data.extend_from_slice(bytemuck::bytes_of(&uniform));
        data.resize(offset as usize + DRAW_UNIFORM_STRIDE as usize, 0);
        offset
    }

    fn prepare_clip(
        &self,
        scene: &Scene,
        clip: &ClipDraw,
        projection: &Mat4,
        uniforms: &mut Vec<u8>,
    ) -> Option<PreparedClip> {
        let geometry = scene.geometry(clip.node)?;
        let layout = geometry.layout();
        if layout.stride() != 8 || layout.position_offset() != Some(0) {
            log::warn!(
                "clip {:?} has a non position-only vertex layout, clipping skipped",
                clip.node
            );
            return None;
        }
        if geometry.mode() != DrawingMode::Triangles {
            log::warn!(
                "clip {:?} is not a triangle list, clipping skipped",
                clip.node
            );
            return None;
        }

        let vertices = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("strata clip vertices"),
                contents: geometry.vertex_data(),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let indices = match geometry.indices() {
            IndexData::None => None,
            other => Some((
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("strata clip indices"),
                        contents: other.bytes(),
                        usage: wgpu::BufferUsages::INDEX,
                    }),
                other.format(),
                other.len() as u32,
            )),
        };

        let uniform_offset = Self::push_uniform(
            uniforms,
            DrawUniforms::new(&(*projection * clip.matrix), 0.0, 1.0),
        );
        Some(PreparedClip {
            vertices,
            indices,
            vertex_count: geometry.vertex_count() as u32,
            uniform_offset,
        })
    }

    /// The buffer always exists, even for frames with no uniforms, so the
    /// clear pass and callback-only frames still have a bind group to set.
    fn ensure_uniform_buffer(&mut self, data: &[u8]) {
        let size = (data.len() as u64).max(DRAW_UNIFORM_STRIDE);
        if self.uniform_buffer.is_none() || self.uniform_capacity < size {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("strata draw uniforms"),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.uniform_bind_group = Some(self.device.create_bind_group(
                &wgpu::BindGroupDescriptor {
                    label: Some("strata draw uniforms"),
                    layout: &self.draw_layout,
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &buffer,
                            offset: 0,
                            size: NonZeroU64::new(DRAW_UNIFORM_STRIDE),
                        }),
                    }],
                },
            ));
            self.uniform_capacity = size;
            self.uniform_buffer = Some(buffer);
        }
        if !data.is_empty() {
            if let Some(buffer) = &self.uniform_buffer {
                self.queue.write_buffer(buffer, 0, data);
            }
        }
    }

    fn ensure_depth_texture(&mut self, size: (u32, u32)) {
        if self.depth_texture.is_none() || self.depth_size != size {
            let texture = create_depth_texture(&self.device, size);
            self.depth_texture =
                Some(texture.create_view(&wgpu::TextureViewDescriptor::default()));
            self.depth_size = size;
        }
    }

    fn prepare_batch(
        &mut self,
        scene: &Scene,
        renderer: &mut Renderer,
        draw: &crate::frame::BatchDraw,
        projection: &Mat4,
        viewport: (u32, u32),
        uniforms: &mut Vec<u8>,
        clip_cache: &mut AHashMap<NodeId, PreparedClip>,
    ) -> Option<PreparedBatch> {
        let mut clips = Vec::with_capacity(draw.clips.len());
        for clip in &draw.clips {
            if !clip_cache.contains_key(&clip.node) {
                match self.prepare_clip(scene, clip, projection, uniforms) {
                    Some(prepared) => {
                        clip_cache.insert(clip.node, prepared);
                    }
                    None => continue,
                }
            }
            clips.push(clip.node);
        }

        let kind = match &draw.kind {
            BatchDrawKind::Callback(cb) => PreparedKind::Callback {
                node: cb.node,
                state: CallbackState {
                    matrix: *projection * cb.matrix,
                    opacity: cb.opacity,
                    z: cb.z,
                    viewport,
                },
            },
            BatchDrawKind::Merged {
                sets, model_view, ..
            } => {
                let buffer = self.sync_batch_buffer(renderer, draw.batch)?;
                let uniform_offset = Self::push_uniform(
                    uniforms,
                    DrawUniforms::new(&(*projection * *model_view), 0.0, draw.opacity),
                );
                PreparedKind::Merged {
                    buffer,
                    sets: sets.clone(),
                    uniform_offset,
                }
            }
            BatchDrawKind::Unmerged { elements } => {
                let buffer = self.sync_batch_buffer(renderer, draw.batch)?;
                let elements = elements
                    .iter()
                    .map(|el| {
                        let offset = Self::push_uniform(
                            uniforms,
                            DrawUniforms::new(
                                &(*projection * el.model_view),
                                el.z,
                                draw.opacity,
                            ),
                        );
                        (el.clone(), offset)
                    })
                    .collect();
                PreparedKind::Unmerged { buffer, elements }
            }
        };

        let (pipeline, material_bind_group) = match &kind {
            PreparedKind::Callback { .. } => (None, None),
            _ => {
                let merged = matches!(kind, PreparedKind::Merged { .. });
                let pipeline = self.content_pipeline(scene, draw, merged);
                pipeline.as_ref()?;
                let material_bind_group = scene.material(draw.first_node).and_then(|m| {
                    let data = m.uniform_data();
                    if data.is_empty() {
                        return None;
                    }
                    let buffer =
                        self.device
                            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                                label: Some("strata material uniforms"),
                                contents: &data,
                                usage: wgpu::BufferUsages::UNIFORM,
                            });
                    Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("strata material uniforms"),
                        layout: &self.material_layout,
                        entries: &[wgpu::BindGroupEntry {
                            binding: 0,
                            resource: buffer.as_entire_binding(),
                        }],
                    }))
                });
                (pipeline, material_bind_group)
            }
        };

        Some(PreparedBatch {
            pipeline,
            material_bind_group,
            clips,
            kind,
        })
    }

    fn execute(
        &mut self,
        scene: &mut Scene,
        renderer: &mut Renderer,
        frame: &Frame,
        view: &wgpu::TextureView,
    ) {
        let size = (self.config.width, self.config.height);
        self.ensure_depth_texture(size);

        let projection = frame.projection;
        let mut uniforms: Vec<u8> = Vec::new();
        let mut clip_cache: AHashMap<NodeId, PreparedClip> = AHashMap::new();
        let mut prepared: Vec<PreparedBatch> = Vec::new();

        for draw in frame.opaque_batches().iter().chain(frame.alpha_batches()) {
            if let Some(batch) = self.prepare_batch(
                scene,
                renderer,
                draw,
                &projection,
                frame.viewport,
                &mut uniforms,
                &mut clip_cache,
            ) {
                prepared.push(batch);
            }
        }

        self.ensure_uniform_buffer(&uniforms);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("strata frame"),
            });

        {
            let depth_view = match &self.depth_texture {
                Some(view) => view,
                None => return,
            };
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("strata frame"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(self.clear_color),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(0),
                        store: wgpu::StoreOp::Store,
                    }),
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let Some(uniform_bind_group) = self.uniform_bind_group.clone() else {
                return;
            };

            let mut active_clips: Vec<NodeId> = Vec::new();
            for batch in &prepared {
                self.transition_clips(
                    &mut pass,
                    &uniform_bind_group,
                    &mut active_clips,
                    &batch.clips,
                    &clip_cache,
                );
                pass.set_stencil_reference(active_clips.len() as u32);

                match &batch.kind {
                    PreparedKind::Callback { node, state } => {
                        if let Some(callback) = scene.callback_mut(*node) {
                            callback.render(&self.device, &self.queue, &mut pass, state);
                        }
                    }
                    PreparedKind::Merged {
                        buffer,
                        sets,
                        uniform_offset,
                    } => {
                        let Some(pipeline) = &batch.pipeline else {
                            continue;
                        };
                        pass.set_pipeline(pipeline);
                        pass.set_bind_group(0, &uniform_bind_group, &[*uniform_offset]);
                        if let Some(bg) = &batch.material_bind_group {
                            pass.set_bind_group(1, bg, &[]);
                        }
                        for set in sets {
                            pass.set_vertex_buffer(0, buffer.slice(set.vertices as u64..));
                            pass.set_vertex_buffer(1, buffer.slice(set.zorders as u64..));
                            pass.set_index_buffer(
                                buffer.slice(set.indices as u64..),
                                wgpu::IndexFormat::Uint16,
                            );
                            pass.draw_indexed(0..set.index_count, 0, 0..1);
                        }
                    }
                    PreparedKind::Unmerged { buffer, elements } => {
                        let Some(pipeline) = &batch.pipeline else {
                            continue;
                        };
                        pass.set_pipeline(pipeline);
                        if let Some(bg) = &batch.material_bind_group {
                            pass.set_bind_group(1, bg, &[]);
                        }
                        for (el, offset) in elements {
                            pass.set_bind_group(0, &uniform_bind_group, &[*offset]);
                            pass.set_vertex_buffer(0, buffer.slice(el.vertex_offset as u64..));
                            match el.index_offset {
                                Some(index_offset) => {
                                    pass.set_index_buffer(
                                        buffer.slice(index_offset as u64..),
                                        el.index_format,
                                    );
                                    pass.draw_indexed(0..el.index_count, 0, 0..1);
                                }
                                None => pass.draw(0..el.vertex_count, 0..1),
                            }
                        }
                    }
                }
            }

            // Unwind any clips still active so the stencil buffer ends the
            // frame zeroed.
            self.transition_clips(
                &mut pass,
                &uniform_bind_group,
                &mut active_clips,
                &[],
                &clip_cache,
            );
        }

        self.queue.submit(Some(encoder.finish()));
    }

    /// Draws stencil increments and decrements to move from the currently
    /// active clip stack to `target`.
    fn transition_clips(
        &self,
        pass: &mut wgpu::RenderPass<'_>,
        uniform_bind_group: &wgpu::BindGroup,
        active: &mut Vec<NodeId>,
        target: &[NodeId],
        clip_cache: &AHashMap<NodeId, PreparedClip>,
    ) {
        let shared = active
            .iter()
            .zip(target.iter())
            .take_while(|(a, b)| a == b)
            .count();

        while active.len() > shared {
            let node = match active.pop() {
                Some(n) => n,
                None => break,
            };
            if let Some(clip) = clip_cache.get(&node) {
                pass.set_stencil_reference(active.len() as u32 + 1);
                pass.set_pipeline(&self.clip_decrement_pipeline);
                Self::draw_clip(pass, uniform_bind_group, clip);
            }
        }

        for node in &target[shared..] {
            if let Some(clip) = clip_cache.get(node) {
                pass.set_stencil_reference(active.len() as u32);
                pass.set_pipeline(&self.clip_increment_pipeline);
                Self::draw_clip(pass, uniform_bind_group, clip);
                active.push(*node);
            }
        }
    }

    fn draw_clip(
        pass: &mut wgpu::RenderPass<'_>,
        uniform_bind_group: &wgpu::BindGroup,
        clip: &PreparedClip,
    ) {
        pass.set_bind_group(0, uniform_bind_group, &[clip.uniform_offset]);
        pass.set_vertex_buffer(0, clip.vertices.slice(..));
        match &clip.indices {
            Some((buffer, format, count)) => {
                pass.set_index_buffer(buffer.slice(..), *format);
                pass.draw_indexed(0..*count, 0, 0..1);
            }
            None => pass.draw(0..clip.vertex_count, 0..1),
        }
    }
}
