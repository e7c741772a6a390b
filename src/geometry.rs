//! Vertex geometry attached to scene nodes.
//!
//! A [`Geometry`] owns raw interleaved vertex bytes plus an optional index
//! list, described by a [`VertexLayout`]. The renderer never interprets
//! attributes beyond the position: it copies vertex data verbatim into batch
//! buffers and, for merged batches, rewrites the two position floats in
//! place.

use smallvec::SmallVec;

use lyon::math::Point;

/// Primitive topology of a geometry.
///
/// Only [`Triangles`](DrawingMode::Triangles) and
/// [`TriangleStrip`](DrawingMode::TriangleStrip) geometries are eligible for
/// merged batching; the other modes always draw unmerged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrawingMode {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
}

impl DrawingMode {
    pub(crate) fn to_wgpu(self) -> wgpu::PrimitiveTopology {
        match self {
            DrawingMode::Points => wgpu::PrimitiveTopology::PointList,
            DrawingMode::Lines => wgpu::PrimitiveTopology::LineList,
            DrawingMode::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            DrawingMode::Triangles => wgpu::PrimitiveTopology::TriangleList,
            DrawingMode::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }
}

/// A single interleaved vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VertexAttribute {
    pub format: wgpu::VertexFormat,
    /// Marks the attribute holding 2D vertex coordinates. The first
    /// `Float32x2` attribute with this flag is the one the renderer
    /// transforms when merging.
    pub is_position: bool,
}

impl VertexAttribute {
    pub fn new(format: wgpu::VertexFormat) -> Self {
        Self {
            format,
            is_position: false,
        }
    }

    pub fn position() -> Self {
        Self {
            format: wgpu::VertexFormat::Float32x2,
            is_position: true,
        }
    }
}

/// Describes the interleaved layout of a geometry's vertex data.
///
/// Two geometries can share a batch only if their layouts compare equal.
#[derive(Clone, Debug, PartialEq)]
pub struct VertexLayout {
    attributes: SmallVec<[VertexAttribute; 4]>,
    stride: usize,
}

impl VertexLayout {
    pub fn new(attributes: impl IntoIterator<Item = VertexAttribute>) -> Self {
        let attributes: SmallVec<[VertexAttribute; 4]> = attributes.into_iter().collect();
        let stride = attributes
            .iter()
            .map(|a| a.format.size() as usize)
            .sum();
        Self { attributes, stride }
    }

    /// A layout with a single 2D position attribute.
    pub fn position_only() -> Self {
        Self::new([VertexAttribute::position()])
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn attribute_offset(&self, index: usize) -> usize {
        self.attributes[..index]
            .iter()
            .map(|a| a.format.size() as usize)
            .sum()
    }

    /// Byte offset of the position attribute, if the layout has one the
    /// merger understands.
    pub fn position_offset(&self) -> Option<usize> {
        let mut offset = 0;
        for a in &self.attributes {
            if a.is_position && a.format == wgpu::VertexFormat::Float32x2 {
                return Some(offset);
            }
            offset += a.format.size() as usize;
        }
        None
    }
}

/// Index data of a geometry.
///
/// Merged batches require 16-bit indices (or none at all); 32-bit indexed
/// geometries always draw unmerged.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexData {
    None,
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexData {
    pub fn len(&self) -> usize {
        match self {
            IndexData::None => 0,
            IndexData::U16(v) => v.len(),
            IndexData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn format(&self) -> wgpu::IndexFormat {
        match self {
            IndexData::U32(_) => wgpu::IndexFormat::Uint32,
            _ => wgpu::IndexFormat::Uint16,
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            IndexData::None => &[],
            IndexData::U16(v) => bytemuck::cast_slice(v),
            IndexData::U32(v) => bytemuck::cast_slice(v),
        }
    }
}

/// Raw vertex data plus its layout, topology and indices.
#[derive(Clone, Debug)]
pub struct Geometry {
    layout: VertexLayout,
    vertex_data: Vec<u8>,
    indices: IndexData,
    mode: DrawingMode,
}

impl Geometry {
    pub fn new(layout: VertexLayout, mode: DrawingMode) -> Self {
        Self {
            layout,
            vertex_data: Vec::new(),
            indices: IndexData::None,
            mode,
        }
    }

    /// Builds a geometry from a typed vertex slice.
    pub fn from_vertices<V: bytemuck::Pod>(
        layout: VertexLayout,
        mode: DrawingMode,
        vertices: &[V],
        indices: IndexData,
    ) -> Self {
        debug_assert_eq!(std::mem::size_of::<V>(), layout.stride());
        Self {
            layout,
            vertex_data: bytemuck::cast_slice(vertices).to_vec(),
            indices,
            mode,
        }
    }

    /// A position-only triangle list covering a rectangle.
    pub fn quad(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        let vertices: [[f32; 2]; 4] = [
            [left, top],
            [right, top],
            [right, bottom],
            [left, bottom],
        ];
        Self::from_vertices(
            VertexLayout::position_only(),
            DrawingMode::Triangles,
            &vertices,
            IndexData::U16(vec![0, 1, 2, 2, 3, 0]),
        )
    }

    pub fn layout(&self) -> &VertexLayout {
        &self.layout
    }

    pub fn mode(&self) -> DrawingMode {
        self.mode
    }

    pub fn vertex_data(&self) -> &[u8] {
        &self.vertex_data
    }

    pub fn set_vertex_data(&mut self, data: Vec<u8>) {
        debug_assert_eq!(data.len() % self.layout.stride(), 0);
        self.vertex_data = data;
    }

    pub fn indices(&self) -> &IndexData {
        &self.indices
    }

    pub fn set_indices(&mut self, indices: IndexData) {
        self.indices = indices;
    }

    pub fn vertex_count(&self) -> usize {
        if self.layout.stride() == 0 {
            return 0;
        }
        self.vertex_data.len() / self.layout.stride()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Reads the position of vertex `i`, if the layout exposes one.
    pub(crate) fn position_at(&self, i: usize) -> Option<Point> {
        let offset = self.layout.position_offset()?;
        let stride = self.layout.stride();
        let start = i * stride + offset;
        let bytes = self.vertex_data.get(start..start + 8)?;
        let xy: [f32; 2] = bytemuck::pod_read_unaligned(bytes);
        Some(Point::new(xy[0], xy[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_stride_and_offsets() {
        let layout = VertexLayout::new([
            VertexAttribute::position(),
            VertexAttribute::new(wgpu::VertexFormat::Float32x4),
        ]);
        assert_eq!(layout.stride(), 8 + 16);
        assert_eq!(layout.attribute_offset(1), 8);
        assert_eq!(layout.position_offset(), Some(0));
    }

    #[test]
    fn position_after_other_attributes() {
        let layout = VertexLayout::new([
            VertexAttribute::new(wgpu::VertexFormat::Float32x4),
            VertexAttribute::position(),
        ]);
        assert_eq!(layout.position_offset(), Some(16));
    }

    #[test]
    fn no_position_in_layout() {
        let layout = VertexLayout::new([VertexAttribute::new(wgpu::VertexFormat::Float32x4)]);
        assert_eq!(layout.position_offset(), None);
    }

    #[test]
    fn quad_positions_are_readable() {
        let quad = Geometry::quad(0.0, 0.0, 10.0, 20.0);
        assert_eq!(quad.vertex_count(), 4);
        assert_eq!(quad.index_count(), 6);
        assert_eq!(quad.position_at(2), Some(Point::new(10.0, 20.0)));
        assert_eq!(quad.position_at(4), None);
    }
}
