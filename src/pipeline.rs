//! Pipeline and depth-stencil state construction.
//!
//! Every content pipeline follows the binding conventions documented on
//! [`ShaderDescriptor`](crate::material::ShaderDescriptor): group 0 holds the
//! per-draw uniforms with a dynamic offset, group 1 the material's own
//! uniforms. Clipping uses the stencil buffer: clip geometry increments the
//! stencil where it covers the target, content draws where the stencil
//! equals the nesting depth, and the clip geometry decrements again on the
//! way out.

use wgpu::{BindGroupLayout, Device, RenderPipeline};

use crate::geometry::{DrawingMode, VertexLayout};
use crate::material::ShaderDescriptor;
use crate::transform::Mat4;

pub(crate) const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

/// Stride between per-draw uniform blocks in the shared uniform buffer.
/// Matches the largest `min_uniform_buffer_offset_alignment` wgpu allows.
pub(crate) const DRAW_UNIFORM_STRIDE: u64 = 256;

/// Per-draw uniforms bound at `@group(0) @binding(0)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct DrawUniforms {
    pub matrix: [[f32; 4]; 4],
    /// `x` is unused by the built-in shaders, `y` is the depth value written
    /// by non-merged draws.
    pub z_params: [f32; 2],
    pub opacity: f32,
    pub pad: f32,
}

impl DrawUniforms {
    pub(crate) fn new(matrix: &Mat4, z: f32, opacity: f32) -> Self {
        Self {
            matrix: matrix.to_cols_array_2d(),
            z_params: [0.0, z],
            opacity,
            pad: 0.0,
        }
    }
}

pub(crate) fn draw_bind_group_layout(device: &Device) -> BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("strata draw uniforms"),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: None,
            },
            count: None,
        }],
    })
}

pub(crate) fn material_bind_group_layout(device: &Device) -> BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("strata material uniforms"),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }],
    })
}

fn equal_stencil(pass_op: wgpu::StencilOperation) -> wgpu::StencilState {
    let face = wgpu::StencilFaceState {
        compare: wgpu::CompareFunction::Equal,
        fail_op: wgpu::StencilOperation::Keep,
        depth_fail_op: wgpu::StencilOperation::Keep,
        pass_op,
    };
    wgpu::StencilState {
        front: face,
        back: face,
        read_mask: 0xff,
        write_mask: 0xff,
    }
}

/// Depth-stencil state for content draws. Opaque draws write depth so later
/// batches can be rejected early; alpha draws only test against it.
pub(crate) fn content_depth_stencil(opaque: bool, stenciled: bool) -> wgpu::DepthStencilState {
    let stencil = if stenciled {
        equal_stencil(wgpu::StencilOperation::Keep)
    } else {
        wgpu::StencilState::default()
    };
    wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: opaque,
        depth_compare: wgpu::CompareFunction::Less,
        stencil,
        bias: wgpu::DepthBiasState::default(),
    }
}

/// Depth-stencil state for drawing clip geometry on the way into a clip.
pub(crate) fn clip_increment_depth_stencil() -> wgpu::DepthStencilState {
    wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: false,
        depth_compare: wgpu::CompareFunction::Always,
        stencil: equal_stencil(wgpu::StencilOperation::IncrementClamp),
        bias: wgpu::DepthBiasState::default(),
    }
}

/// Depth-stencil state for undoing clip geometry on the way out.
pub(crate) fn clip_decrement_depth_stencil() -> wgpu::DepthStencilState {
    wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: false,
        depth_compare: wgpu::CompareFunction::Always,
        stencil: equal_stencil(wgpu::StencilOperation::DecrementClamp),
        bias: wgpu::DepthBiasState::default(),
    }
}

/// Maps a geometry's layout to wgpu vertex attributes at shader locations
/// `0..n`.
pub(crate) fn vertex_attributes(layout: &VertexLayout) -> Vec<wgpu::VertexAttribute> {
    layout
        .attributes()
        .iter()
        .enumerate()
        .map(|(i, a)| wgpu::VertexAttribute {
            format: a.format,
            offset: layout.attribute_offset(i) as u64,
            shader_location: i as u32,
        })
        .collect()
}

/// The per-vertex depth attribute merged pipelines read in buffer slot 1.
pub(crate) const Z_VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![
    ShaderDescriptor::Z_ATTRIBUTE_LOCATION => Float32
];

const ALPHA_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::SrcAlpha,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
};

pub(crate) struct ContentPipelineParams<'a> {
    pub format: wgpu::TextureFormat,
    pub shader: &'a ShaderDescriptor,
    pub layout: &'a VertexLayout,
    pub mode: DrawingMode,
    /// Required for strip topologies that draw indexed.
    pub strip_index_format: Option<wgpu::IndexFormat>,
    pub merged: bool,
    pub opaque: bool,
    pub stenciled: bool,
    pub blending: bool,
    pub has_material_uniforms: bool,
}

pub(crate) fn create_content_pipeline(
    device: &Device,
    params: &ContentPipelineParams<'_>,
) -> RenderPipeline {
    let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(params.shader.label),
        source: wgpu::ShaderSource::Wgsl(params.shader.source.clone()),
    });

    let draw_layout = draw_bind_group_layout(device);
    let material_layout = material_bind_group_layout(device);
    let mut bind_group_layouts: Vec<&BindGroupLayout> = vec![&draw_layout];
    if params.has_material_uniforms {
        bind_group_layouts.push(&material_layout);
    }

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(params.shader.label),
        bind_group_layouts: &bind_group_layouts,
        push_constant_ranges: &[],
    });

    let attributes = vertex_attributes(params.layout);
    let mut buffers = vec![wgpu::VertexBufferLayout {
        array_stride: params.layout.stride() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &attributes,
    }];
    if params.merged {
        buffers.push(wgpu::VertexBufferLayout {
            array_stride: 4,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Z_VERTEX_ATTRIBUTES,
        });
    }

    let entry_point = if params.merged {
        params.shader.vs_merged_entry
    } else {
        params.shader.vs_entry
    };

    let blend = if params.blending || !params.opaque {
        Some(ALPHA_BLEND)
    } else {
        None
    };

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(params.shader.label),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader_module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            buffers: &buffers,
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader_module,
            entry_point: Some(params.shader.fs_entry),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format: params.format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: params.mode.to_wgpu(),
            strip_index_format: params.strip_index_format,
            ..Default::default()
        },
        depth_stencil: Some(content_depth_stencil(params.opaque, params.stenciled)),
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

const CLIP_WGSL: &str = r#"
struct DrawUniforms {
    matrix: mat4x4<f32>,
    z_params: vec2<f32>,
    opacity: f32,
    pad: f32,
};

@group(0) @binding(0) var<uniform> draw: DrawUniforms;

@vertex
fn vs_main(@location(0) pos: vec2<f32>) -> @builtin(position) vec4<f32> {
    return draw.matrix * vec4<f32>(pos, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(0.0);
}
"#;

/// A colorless pipeline drawing clip geometry into the stencil buffer.
pub(crate) fn create_clip_pipeline(
    device: &Device,
    format: wgpu::TextureFormat,
    increment: bool,
) -> RenderPipeline {
    let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("strata clip"),
        source: wgpu::ShaderSource::Wgsl(CLIP_WGSL.into()),
    });
    let draw_layout = draw_bind_group_layout(device);
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("strata clip"),
        bind_group_layouts: &[&draw_layout],
        push_constant_ranges: &[],
    });

    let attributes = wgpu::vertex_attr_array![0 => Float32x2];
    let depth_stencil = if increment {
        clip_increment_depth_stencil()
    } else {
        clip_decrement_depth_stencil()
    };

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("strata clip"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader_module,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: 8,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            }],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader_module,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::empty(),
            })],
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: Some(depth_stencil),
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// Creates the frame's depth-stencil target.
pub(crate) fn create_depth_texture(device: &Device, size: (u32, u32)) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("strata depth"),
        size: wgpu::Extent3d {
            width: size.0.max(1),
            height: size.1.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    })
}
