//! Batches: groups of compatible elements drawn with a single pipeline.
//!
//! A batch links its elements through the intrusive `next_in_batch` list on
//! [`Element`]. Merged batches additionally own a packed CPU-side buffer
//! holding transformed vertices, per-vertex depth values and rebased
//! indices, split into [`DrawSet`]s whenever the 16-bit index space runs
//! out.

use smallvec::SmallVec;

use crate::material::materials_match;
use crate::scene::Scene;
use crate::shadow::{Arena, Element, ElementId, ShadowId};

/// One `draw_indexed` worth of a merged batch. Byte offsets index into the
/// batch buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawSet {
    pub vertices: usize,
    pub zorders: usize,
    pub indices: usize,
    pub index_count: u32,
}

/// CPU staging data for a batch plus the GPU buffer it was last uploaded
/// to. The GPU buffer is recreated whenever the byte size changes.
#[derive(Default)]
pub(crate) struct BatchBuffer {
    pub data: Vec<u8>,
    pub gpu: Option<wgpu::Buffer>,
    /// Staged data changed since the last GPU sync.
    pub gpu_dirty: bool,
}

impl BatchBuffer {
    /// Sizes the staging data, padded so `Queue::write_buffer` accepts it.
    pub(crate) fn resize(&mut self, byte_size: usize) {
        self.data.clear();
        self.data.resize(byte_size.next_multiple_of(4), 0);
    }
}

pub(crate) struct Batch {
    pub first: Option<ElementId>,
    pub root: Option<ShadowId>,
    pub is_opaque: bool,
    /// Single-element batch wrapping a callback node.
    pub is_render_node: bool,
    /// Whether the last upload packed all elements into shared vertex data.
    pub merged: bool,
    pub needs_upload: bool,

    /// Byte offset of the position attribute in the vertex layout shared by
    /// all elements of the batch, if the layout exposes one.
    pub position_offset: Option<usize>,
    pub vertex_count: u32,
    pub index_count: u32,

    pub draw_sets: SmallVec<[DrawSet; 1]>,
    pub buffer: BatchBuffer,
}

impl Batch {
    pub(crate) fn new() -> Self {
        Self {
            first: None,
            root: None,
            is_opaque: false,
            is_render_node: false,
            merged: false,
            needs_upload: false,
            position_offset: None,
            vertex_count: 0,
            index_count: 0,
            draw_sets: SmallVec::new(),
            buffer: BatchBuffer::default(),
        }
    }

    /// Resets everything except the allocated buffer, so pooled batches
    /// keep their capacity.
    pub(crate) fn reset(&mut self) {
        self.first = None;
        self.root = None;
        self.is_opaque = false;
        self.is_render_node = false;
        self.merged = false;
        self.needs_upload = false;
        self.position_offset = None;
        self.vertex_count = 0;
        self.index_count = 0;
        self.draw_sets.clear();
    }

    /// Unlinks tombstoned elements from the chain.
    pub(crate) fn cleanup_removed_elements(&mut self, elements: &mut Arena<Element>) {
        while let Some(first) = self.first {
            if elements[first].removed {
                self.first = elements[first].next_in_batch;
                elements[first].next_in_batch = None;
            } else {
                break;
            }
        }
        let mut cursor = self.first;
        while let Some(e) = cursor {
            let next = elements[e].next_in_batch;
            if let Some(n) = next {
                if elements[n].removed {
                    elements[e].next_in_batch = elements[n].next_in_batch;
                    elements[n].next_in_batch = None;
                    continue;
                }
            }
            cursor = next;
        }
    }

    /// Detaches every element and empties the batch so it can go back to
    /// the pool.
    pub(crate) fn invalidate(&mut self, elements: &mut Arena<Element>) {
        self.cleanup_removed_elements(elements);
        let mut cursor = self.first;
        while let Some(e) = cursor {
            let next = elements[e].next_in_batch;
            elements[e].batch = None;
            elements[e].next_in_batch = None;
            cursor = next;
        }
        self.first = None;
        self.needs_upload = false;
    }

    /// Whether `candidate`'s material matches the rest of the batch. Only
    /// looks at the first surviving other element; the batcher keeps the
    /// chain homogeneous.
    pub(crate) fn is_material_compatible(
        &self,
        candidate: ElementId,
        elements: &Arena<Element>,
        scene: &Scene,
    ) -> bool {
        let mut cursor = self.first;
        while let Some(e) = cursor {
            if e != candidate && !elements[e].removed {
                let (Some(a), Some(b)) = (
                    scene.material(elements[e].node),
                    scene.material(elements[candidate].node),
                ) else {
                    return false;
                };
                return materials_match(a, b);
            }
            cursor = elements[e].next_in_batch;
        }
        true
    }

    /// True while every element reaches the batch root through a pure
    /// translation.
    pub(crate) fn is_translate_only_to_root(&self, elements: &Arena<Element>) -> bool {
        let mut cursor = self.first;
        while let Some(e) = cursor {
            if !elements[e].translate_only_to_root {
                return false;
            }
            cursor = elements[e].next_in_batch;
        }
        true
    }

    /// Merging bakes transformed positions and depth into vertex data, which
    /// needs finite bounds and transforms that keep geometry in the x/y
    /// plane.
    pub(crate) fn is_safe_to_batch(&self, elements: &Arena<Element>) -> bool {
        let mut cursor = self.first;
        while let Some(e) = cursor {
            let el = &elements[e];
            if el.bounds_outside_float_range || !el.rel_matrix.is_2d_safe() {
                return false;
            }
            cursor = el.next_in_batch;
        }
        true
    }

    /// Paint order of the batch, taken from its first element.
    pub(crate) fn first_order(&self, elements: &Arena<Element>) -> i32 {
        match self.first {
            Some(e) => elements[e].order,
            None => i32::MIN,
        }
    }

    pub(crate) fn element_count(&self, elements: &Arena<Element>) -> usize {
        let mut n = 0;
        let mut cursor = self.first;
        while let Some(e) = cursor {
            n += 1;
            cursor = elements[e].next_in_batch;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::NodeId;

    fn chain(elements: &mut Arena<Element>, n: usize) -> (Batch, Vec<ElementId>) {
        let mut batch = Batch::new();
        let ids: Vec<ElementId> = (0..n)
            .map(|i| ElementId(elements.alloc(Element::new(NodeId(i as u32)))))
            .collect();
        for pair in ids.windows(2) {
            elements[pair[0]].next_in_batch = Some(pair[1]);
        }
        batch.first = ids.first().copied();
        for &id in &ids {
            elements[id].batch = Some(BatchId(0));
        }
        (batch, ids)
    }

    use crate::shadow::BatchId;

    #[test]
    fn resize_pads_for_write_buffer_alignment() {
        let mut buffer = BatchBuffer::default();
        buffer.resize(10);
        assert_eq!(buffer.data.len(), 12);
        buffer.resize(8);
        assert_eq!(buffer.data.len(), 8);
        assert!(buffer.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn cleanup_drops_tombstones_anywhere_in_the_chain() {
        let mut elements = Arena::default();
        let (mut batch, ids) = chain(&mut elements, 4);
        elements[ids[0]].removed = true;
        elements[ids[2]].removed = true;

        batch.cleanup_removed_elements(&mut elements);

        assert_eq!(batch.first, Some(ids[1]));
        assert_eq!(elements[ids[1]].next_in_batch, Some(ids[3]));
        assert_eq!(elements[ids[3]].next_in_batch, None);
        assert_eq!(batch.element_count(&elements), 2);
    }

    #[test]
    fn cleanup_can_empty_the_batch() {
        let mut elements = Arena::default();
        let (mut batch, ids) = chain(&mut elements, 2);
        elements[ids[0]].removed = true;
        elements[ids[1]].removed = true;

        batch.cleanup_removed_elements(&mut elements);
        assert_eq!(batch.first, None);
    }

    #[test]
    fn invalidate_detaches_all_elements() {
        let mut elements = Arena::default();
        let (mut batch, ids) = chain(&mut elements, 3);

        batch.invalidate(&mut elements);

        assert_eq!(batch.first, None);
        for id in ids {
            assert_eq!(elements[id].batch, None);
            assert_eq!(elements[id].next_in_batch, None);
        }
    }

    #[test]
    fn translate_only_and_safety_scan_the_whole_chain() {
        let mut elements = Arena::default();
        let (batch, ids) = chain(&mut elements, 3);
        assert!(batch.is_translate_only_to_root(&elements));
        assert!(batch.is_safe_to_batch(&elements));

        elements[ids[1]].translate_only_to_root = false;
        assert!(!batch.is_translate_only_to_root(&elements));

        elements[ids[2]].bounds_outside_float_range = true;
        assert!(!batch.is_safe_to_batch(&elements));
    }
}
