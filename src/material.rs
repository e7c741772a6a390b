//! Materials describe how batched geometry is shaded.
//!
//! A [`Material`] contributes a WGSL shader, a set of [`MaterialFlags`] that
//! constrain batching, and an equality check used to decide whether two
//! elements can share a draw call. Implementations are compared first by
//! concrete type and then by [`Material::compare`], so a material type maps
//! to a pipeline and `compare` maps to shared uniform state.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::fmt;

use bitflags::bitflags;

use crate::color::Color;
use crate::transform::Mat4;

bitflags! {
    /// Properties of a material the batcher has to respect.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MaterialFlags: u32 {
        /// The material blends with the framebuffer. Geometry using it goes
        /// to the back-to-front alpha pass even at full opacity.
        const BLENDING = 0x01;
        /// The shader reads the determinant of the model matrix, so merging
        /// is only safe when vertices reach the batch root through pure
        /// translations.
        const REQUIRES_DETERMINANT = 0x02;
        /// The shader reads model matrix components beyond a translation.
        const REQUIRES_FULL_MATRIX_EXCEPT_TRANSLATE = 0x04 | 0x02;
        /// The shader reads the full model matrix. Geometry using this
        /// material is never merged.
        const REQUIRES_FULL_MATRIX = 0x08 | 0x04 | 0x02;
        /// Pipeline creation for the material has side effects the renderer
        /// cannot cache across elements, which disables merging.
        const CUSTOM_COMPILE_STEP = 0x10;
    }
}

/// The bit distinguishing `REQUIRES_FULL_MATRIX` from
/// `REQUIRES_FULL_MATRIX_EXCEPT_TRANSLATE`.
pub(crate) const FULL_MATRIX_BIT: MaterialFlags = MaterialFlags::from_bits_retain(0x08);

/// WGSL source plus entry points for a material's pipelines.
///
/// The shader module has to follow the renderer's binding conventions:
///
/// * `@group(0) @binding(0)` is a uniform struct with a `mat4x4<f32>`
///   transform, a `vec2<f32>` of depth parameters and an `f32` opacity.
/// * `@group(1) @binding(0)`, if the material returns uniform data, is a
///   uniform buffer holding exactly [`Material::uniform_data`].
/// * `vs_entry` consumes the geometry's vertex layout at locations
///   `0..n` and writes `position.z = z_params.y * position.w`.
/// * `vs_merged_entry` additionally consumes a per-vertex depth value at
///   [`ShaderDescriptor::Z_ATTRIBUTE_LOCATION`] and uses it instead of
///   `z_params.y`.
#[derive(Clone, Debug)]
pub struct ShaderDescriptor {
    pub label: &'static str,
    pub source: Cow<'static, str>,
    pub vs_entry: &'static str,
    pub vs_merged_entry: &'static str,
    pub fs_entry: &'static str,
}

impl ShaderDescriptor {
    /// Shader location of the injected per-vertex depth attribute in merged
    /// pipelines.
    pub const Z_ATTRIBUTE_LOCATION: u32 = 7;

    pub fn new(label: &'static str, source: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label,
            source: source.into(),
            vs_entry: "vs_main",
            vs_merged_entry: "vs_merged",
            fs_entry: "fs_main",
        }
    }
}

/// Shading state attached to geometry nodes.
pub trait Material: fmt::Debug {
    fn flags(&self) -> MaterialFlags {
        MaterialFlags::empty()
    }

    fn shader(&self) -> ShaderDescriptor;

    /// Raw bytes bound at `@group(1) @binding(0)`. An empty slice means the
    /// material has no uniforms of its own.
    fn uniform_data(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Compares uniform state with another material of the same concrete
    /// type. Elements whose materials compare equal can share a merged
    /// draw call.
    fn compare(&self, other: &dyn Material) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Pipeline cache key for a material.
pub(crate) fn material_type(m: &dyn Material) -> TypeId {
    m.as_any().type_id()
}

/// Checks that two materials have the same type, flags and uniform state.
pub(crate) fn materials_match(a: &dyn Material, b: &dyn Material) -> bool {
    material_type(a) == material_type(b) && a.flags() == b.flags() && a.compare(b)
}

const FLAT_COLOR_WGSL: &str = r#"
struct DrawUniforms {
    matrix: mat4x4<f32>,
    z_params: vec2<f32>,
    opacity: f32,
    pad: f32,
};

struct MaterialUniforms {
    color: vec4<f32>,
};

@group(0) @binding(0) var<uniform> draw: DrawUniforms;
@group(1) @binding(0) var<uniform> material: MaterialUniforms;

struct VsOut {
    @builtin(position) position: vec4<f32>,
};

fn project(pos: vec2<f32>, z: f32) -> vec4<f32> {
    var out = draw.matrix * vec4<f32>(pos, 0.0, 1.0);
    out.z = z * out.w;
    return out;
}

@vertex
fn vs_main(@location(0) pos: vec2<f32>) -> VsOut {
    var out: VsOut;
    out.position = project(pos, draw.z_params.y);
    return out;
}

@vertex
fn vs_merged(@location(0) pos: vec2<f32>, @location(7) z: f32) -> VsOut {
    var out: VsOut;
    out.position = project(pos, z);
    return out;
}

@fragment
fn fs_main(_in: VsOut) -> @location(0) vec4<f32> {
    return material.color * draw.opacity;
}
"#;

/// A solid-color material for position-only geometry.
///
/// Translucent colors set [`MaterialFlags::BLENDING`], which sends the
/// geometry to the alpha pass.
#[derive(Clone, Debug, PartialEq)]
pub struct FlatColorMaterial {
    color: Color,
}

impl FlatColorMaterial {
    pub fn new(color: Color) -> Self {
        Self { color }
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }
}

impl Material for FlatColorMaterial {
    fn flags(&self) -> MaterialFlags {
        if self.color.is_translucent() {
            MaterialFlags::BLENDING
        } else {
            MaterialFlags::empty()
        }
    }

    fn shader(&self) -> ShaderDescriptor {
        ShaderDescriptor::new("strata flat color", FLAT_COLOR_WGSL)
    }

    fn uniform_data(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.color.normalize()).to_vec()
    }

    fn compare(&self, other: &dyn Material) -> bool {
        other
            .as_any()
            .downcast_ref::<FlatColorMaterial>()
            .is_some_and(|o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Per-frame state handed to a [`RenderCallback`].
#[derive(Clone, Debug)]
pub struct CallbackState {
    /// Combined transform from the callback node to clip space.
    pub matrix: Mat4,
    /// Opacity inherited from ancestor opacity nodes.
    pub opacity: f32,
    /// Depth value of the callback's slot in the back-to-front ordering.
    pub z: f32,
    /// Physical size of the render target in pixels.
    pub viewport: (u32, u32),
}

/// Application-provided drawing inserted into the alpha pass.
///
/// Callbacks record directly into the frame's render pass at their position
/// in the painter's order. A callback node always occupies a batch of its
/// own and never merges with surrounding geometry.
pub trait RenderCallback: fmt::Debug {
    fn render(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        pass: &mut wgpu::RenderPass<'_>,
        state: &CallbackState,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_color_blending_follows_alpha() {
        assert!(!FlatColorMaterial::new(Color::rgb(10, 20, 30))
            .flags()
            .contains(MaterialFlags::BLENDING));
        assert!(FlatColorMaterial::new(Color::rgba(10, 20, 30, 200))
            .flags()
            .contains(MaterialFlags::BLENDING));
    }

    #[test]
    fn materials_match_requires_equal_state() {
        let a = FlatColorMaterial::new(Color::rgb(1, 2, 3));
        let b = FlatColorMaterial::new(Color::rgb(1, 2, 3));
        let c = FlatColorMaterial::new(Color::rgb(9, 9, 9));
        assert!(materials_match(&a, &b));
        assert!(!materials_match(&a, &c));
    }

    #[test]
    fn full_matrix_bit_is_the_difference() {
        let full = MaterialFlags::REQUIRES_FULL_MATRIX;
        let except = MaterialFlags::REQUIRES_FULL_MATRIX_EXCEPT_TRANSLATE;
        assert_eq!(full & !except, FULL_MATRIX_BIT);
    }
}
