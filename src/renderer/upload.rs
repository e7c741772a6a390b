//! Packing batch contents into staging buffers and assembling the frame.
//!
//! Merged batches bake root-relative positions and per-vertex depth into a
//! single interleaved stream laid out as `[vertices | z floats | u16
//! indices]`, split into draw sets whenever the 16-bit index space would
//! overflow. Unmerged batches just concatenate each element's raw vertex and
//! index bytes and record per-element offsets.

use super::*;

use crate::batch::DrawSet;
use crate::frame::{BatchDraw, BatchDrawKind, CallbackDraw, ClipDraw, ElementDraw};
use crate::geometry::{DrawingMode, IndexData};
use crate::material::{MaterialFlags, FULL_MATRIX_BIT};
use crate::transform::MatrixKind;

impl Renderer {
    /// Whether every element of the batch can be baked into one vertex
    /// stream.
    fn can_merge(&self, scene: &Scene, bid: BatchId) -> bool {
        let batch = &self.batches[bid];
        let Some(first) = batch.first else {
            return false;
        };
        if batch.position_offset.is_none() {
            return false;
        }

        let node = self.elements[first].node;
        let Some(g) = scene.geometry(node) else {
            return false;
        };
        if !matches!(g.mode(), DrawingMode::Triangles | DrawingMode::TriangleStrip) {
            return false;
        }

        let mut cursor = Some(first);
        while let Some(e) = cursor {
            let el = &self.elements[e];
            if let Some(g) = scene.geometry(el.node) {
                if matches!(g.indices(), IndexData::U32(_)) {
                    return false;
                }
            }
            cursor = el.next_in_batch;
        }

        let Some(material) = scene.material(node) else {
            return false;
        };
        let flags = material.flags();
        if flags.contains(MaterialFlags::CUSTOM_COMPILE_STEP) {
            return false;
        }
        if flags.contains(MaterialFlags::REQUIRES_DETERMINANT) {
            if flags.contains(FULL_MATRIX_BIT) {
                return false;
            }
            if !batch.is_translate_only_to_root(&self.elements) {
                return false;
            }
        }

        batch.is_safe_to_batch(&self.elements)
    }

    pub(super) fn upload_batch(&mut self, scene: &Scene, bid: BatchId) {
        if !self.batches[bid].needs_upload
            || self.batches[bid].first.is_none()
            || self.batches[bid].is_render_node
        {
            return;
        }

        let merged = self.can_merge(scene, bid);
        let strip = self.batches[bid]
            .first
            .and_then(|e| scene.geometry(self.elements[e].node))
            .is_some_and(|g| g.mode() == DrawingMode::TriangleStrip);

        let mut vertex_count: usize = 0;
        let mut index_count: usize = 0;
        let mut index_bytes: usize = 0;
        let mut cursor = self.batches[bid].first;
        while let Some(e) = cursor {
            let el = &self.elements[e];
            if let Some(g) = scene.geometry(el.node) {
                vertex_count += g.vertex_count();
                if merged {
                    let own = if g.index_count() > 0 {
                        g.index_count()
                    } else {
                        g.vertex_count()
                    };
                    // Strips get a leading and trailing degenerate index per
                    // element so consecutive elements stay disconnected.
                    index_count += own + if strip { 2 } else { 0 };
                } else {
                    index_count += g.index_count();
                    index_bytes += g.indices().bytes().len();
                }
            }
            cursor = el.next_in_batch;
        }

        if vertex_count == 0 || (merged && index_count == 0) {
            return;
        }

        let stride = self.batches[bid]
            .first
            .and_then(|e| scene.geometry(self.elements[e].node))
            .map(|g| g.layout().stride())
            .unwrap_or(0);
        if stride == 0 {
            return;
        }

        if merged {
            self.upload_merged(scene, bid, stride, vertex_count, index_count);
        } else {
            self.upload_unmerged(scene, bid, vertex_count, stride, index_bytes);
        }

        let batch = &mut self.batches[bid];
        batch.merged = merged;
        batch.vertex_count = vertex_count as u32;
        batch.index_count = index_count as u32;
        batch.needs_upload = false;
        batch.buffer.gpu_dirty = true;

        log::trace!(
            "uploaded batch {:?}: merged {}, {} vertices, {} indices, {} draw sets",
            bid,
            merged,
            vertex_count,
            index_count,
            self.batches[bid].draw_sets.len(),
        );
    }

    fn upload_merged(
        &mut self,
        scene: &Scene,
        bid: BatchId,
        stride: usize,
        vertex_count: usize,
        index_count: usize,
    ) {
        let z_range = self.z_range;
        let z_base = vertex_count * stride;
        let index_base = z_base + vertex_count * 4;
        let byte_size = index_base + index_count * 2;

        let batches = &mut self.batches;
        let elements = &self.elements;
        let batch = &mut batches[bid];
        batch.buffer.resize(byte_size);
        batch.draw_sets.clear();

        let position_offset = match batch.position_offset {
            Some(o) => o,
            None => return,
        };
        let strip = batch
            .first
            .and_then(|e| scene.geometry(elements[e].node))
            .is_some_and(|g| g.mode() == DrawingMode::TriangleStrip);

        let mut v_cursor = 0usize;
        let mut z_cursor = z_base;
        let mut i_cursor = index_base;

        let mut set = DrawSet {
            vertices: 0,
            zorders: z_base,
            indices: index_base,
            index_count: 0,
        };
        let mut vertices_in_set: usize = 0;
        let mut indices_in_set: u32 = 0;

        let mut cursor = batch.first;
        while let Some(e) = cursor {
            let el = &elements[e];
            let Some(g) = scene.geometry(el.node) else {
                cursor = el.next_in_batch;
                continue;
            };
            let e_vertices = g.vertex_count();

            if vertices_in_set + e_vertices > 0xffff {
                set.index_count = indices_in_set;
                batch.draw_sets.push(set);
                set = DrawSet {
                    vertices: v_cursor,
                    zorders: z_cursor,
                    indices: i_cursor,
                    index_count: 0,
                };
                vertices_in_set = 0;
                indices_in_set = 0;
            }
            let i_base = vertices_in_set as u16;

            // Vertices, copied raw and then repositioned in place.
            let data = &mut batch.buffer.data;
            let src = g.vertex_data();
            data[v_cursor..v_cursor + src.len()].copy_from_slice(src);
            match el.rel_matrix.kind() {
                MatrixKind::Identity => {}
                MatrixKind::Translate => {
                    let tx = el.rel_matrix.tx();
                    let ty = el.rel_matrix.ty();
                    for v in 0..e_vertices {
                        let at = v_cursor + v * stride + position_offset;
                        let xy: [f32; 2] =
                            bytemuck::pod_read_unaligned(&data[at..at + 8]);
                        let moved = [xy[0] + tx, xy[1] + ty];
                        data[at..at + 8].copy_from_slice(bytemuck::cast_slice(&moved));
                    }
                }
                _ => {
                    for v in 0..e_vertices {
                        let at = v_cursor + v * stride + position_offset;
                        let xy: [f32; 2] =
                            bytemuck::pod_read_unaligned(&data[at..at + 8]);
                        let p = el
                            .rel_matrix
                            .map_point(lyon::math::Point::new(xy[0], xy[1]));
                        let moved = [p.x, p.y];
                        data[at..at + 8].copy_from_slice(bytemuck::cast_slice(&moved));
                    }
                }
            }
            v_cursor += e_vertices * stride;

            // One depth value per vertex.
            let z = 1.0 - el.order as f32 * z_range;
            let z_bytes: [u8; 4] = z.to_ne_bytes();
            for _ in 0..e_vertices {
                data[z_cursor..z_cursor + 4].copy_from_slice(&z_bytes);
                z_cursor += 4;
            }

            // Indices, rebased onto the set's vertex range.
            let mut push_index = |data: &mut Vec<u8>, idx: u16| {
                data[i_cursor..i_cursor + 2].copy_from_slice(&idx.to_ne_bytes());
                i_cursor += 2;
                indices_in_set += 1;
            };
            match g.indices() {
                IndexData::U16(src) => {
                    if strip {
                        if let Some(&first) = src.first() {
                            push_index(data, i_base + first);
                        }
                    }
                    for &i in src {
                        push_index(data, i_base + i);
                    }
                    if strip {
                        if let Some(&last) = src.last() {
                            push_index(data, i_base + last);
                        }
                    }
                }
                _ => {
                    if strip && e_vertices > 0 {
                        push_index(data, i_base);
                    }
                    for v in 0..e_vertices {
                        push_index(data, i_base + v as u16);
                    }
                    if strip && e_vertices > 0 {
                        push_index(data, i_base + e_vertices as u16 - 1);
                    }
                }
            }

            vertices_in_set += e_vertices;
            cursor = el.next_in_batch;
        }

        set.index_count = indices_in_set;
        batch.draw_sets.push(set);
    }

    fn upload_unmerged(
        &mut self,
        scene: &Scene,
        bid: BatchId,
        vertex_count: usize,
        stride: usize,
        index_bytes: usize,
    ) {
        let batches = &mut self.batches;
        let elements = &self.elements;
        let batch = &mut batches[bid];
        let vertex_bytes = vertex_count * stride;
        batch.buffer.resize(vertex_bytes + index_bytes);
        batch.draw_sets.clear();

        let mut v_cursor = 0usize;
        let mut i_cursor = vertex_bytes;
        let mut cursor = batch.first;
        while let Some(e) = cursor {
            let el = &elements[e];
            if let Some(g) = scene.geometry(el.node) {
                let src = g.vertex_data();
                batch.buffer.data[v_cursor..v_cursor + src.len()].copy_from_slice(src);
                v_cursor += src.len();
                let idx = g.indices().bytes();
                batch.buffer.data[i_cursor..i_cursor + idx.len()].copy_from_slice(idx);
                i_cursor += idx.len();
            }
            cursor = el.next_in_batch;
        }
    }

    /// The stencil clips enclosing `element`, outermost first.
    fn clip_stack(&self, mut clip: Option<NodeId>) -> Vec<ClipDraw> {
        let mut clips = Vec::new();
        while let Some(node) = clip {
            let Some(&sid) = self.node_to_shadow.get(&node) else {
                break;
            };
            let matrix = self
                .shadow[sid]
                .root_info
                .as_ref()
                .map(|i| i.matrix)
                .unwrap_or(Mat4::IDENTITY);
            clips.push(ClipDraw { node, matrix });
            clip = self.shadow[sid].clip_parent;
        }
        clips.reverse();
        clips
    }

    fn batch_draw(&self, scene: &Scene, bid: BatchId) -> Option<BatchDraw> {
        let batch = &self.batches[bid];
        let first = batch.first?;
        let el = &self.elements[first];
        let root_matrix = self.matrix_for_root(batch.root);
        let clips = self.clip_stack(el.clip);

        if batch.is_render_node {
            return Some(BatchDraw {
                batch: bid,
                first_node: el.node,
                opaque: false,
                mode: DrawingMode::Triangles,
                opacity: el.inherited_opacity,
                clips,
                kind: BatchDrawKind::Callback(CallbackDraw {
                    node: el.node,
                    matrix: root_matrix * el.rel_matrix,
                    opacity: el.inherited_opacity,
                    z: 1.0 - el.order as f32 * self.z_range,
                }),
            });
        }

        let g = scene.geometry(el.node)?;
        let mode = g.mode();
        let stride = g.layout().stride();

        let kind = if batch.merged {
            BatchDrawKind::Merged {
                sets: batch.draw_sets.clone(),
                model_view: root_matrix,
                stride,
            }
        } else {
            // Offsets mirror the order `upload_unmerged` packed the buffer
            // in: all vertices first, then all index data.
            let vertex_bytes = batch.vertex_count as usize * stride;
            let mut draws = Vec::new();
            let mut v_cursor = 0usize;
            let mut i_cursor = vertex_bytes;
            let mut cursor = batch.first;
            while let Some(e) = cursor {
                let el = &self.elements[e];
                if let Some(g) = scene.geometry(el.node) {
                    let index_len = g.indices().bytes().len();
                    draws.push(ElementDraw {
                        node: el.node,
                        model_view: root_matrix * el.rel_matrix,
                        z: 1.0 - el.order as f32 * self.z_range,
                        vertex_offset: v_cursor,
                        index_offset: (index_len > 0).then_some(i_cursor),
                        index_format: g.indices().format(),
                        vertex_count: g.vertex_count() as u32,
                        index_count: g.index_count() as u32,
                    });
                    v_cursor += g.vertex_data().len();
                    i_cursor += index_len;
                }
                cursor = el.next_in_batch;
            }
            BatchDrawKind::Unmerged { elements: draws }
        };

        Some(BatchDraw {
            batch: bid,
            first_node: el.node,
            opaque: batch.is_opaque,
            mode,
            opacity: el.inherited_opacity,
            clips,
            kind,
        })
    }

    pub(super) fn build_frame(&self, scene: &Scene, projection: Mat4) -> Frame {
        let mut frame = Frame::empty(projection, self.viewport);
        frame.z_range = self.z_range;
        for &bid in &self.opaque_batches {
            if let Some(draw) = self.batch_draw(scene, bid) {
                frame.opaque.push(draw);
            }
        }
        for &bid in &self.alpha_batches {
            if let Some(draw) = self.batch_draw(scene, bid) {
                frame.alpha.push(draw);
            }
        }
        frame
    }
}
