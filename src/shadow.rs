//! The renderer's shadow copy of the scene tree.
//!
//! Shadow nodes mirror scene nodes one to one and carry everything the
//! renderer tracks between frames: accumulated dirty state, batch-root
//! bookkeeping and, for renderables, the [`Element`] that ends up in the
//! render lists. Shadow nodes, elements and batches all live in slot arenas
//! indexed by small copyable ids, so there are no reference cycles to manage.

use ahash::AHashSet;

use crate::bounds::Rect;
use crate::scene::{DirtyState, NodeId};
use crate::transform::Mat4;

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub(crate) struct $name(pub(crate) u32);

        impl $name {
            pub(crate) fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// Index of a shadow node in the renderer's shadow arena.
    ShadowId
);
arena_id!(
    /// Index of an element in the renderer's element arena.
    ElementId
);
arena_id!(
    /// Index of a batch in the renderer's batch arena.
    BatchId
);

/// A slot arena with id reuse.
pub(crate) struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    pub(crate) fn alloc(&mut self, value: T) -> u32 {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(value);
                slot
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() as u32 - 1
            }
        }
    }

    pub(crate) fn release(&mut self, slot: u32) {
        debug_assert!(self.slots[slot as usize].is_some());
        self.slots[slot as usize] = None;
        self.free.push(slot);
    }

    pub(crate) fn get(&self, slot: u32) -> &T {
        self.slots[slot as usize].as_ref().expect("stale arena id")
    }

    pub(crate) fn get_mut(&mut self, slot: u32) -> &mut T {
        self.slots[slot as usize].as_mut().expect("stale arena id")
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

macro_rules! arena_index {
    ($id:ident, $value:ty) => {
        impl std::ops::Index<$id> for Arena<$value> {
            type Output = $value;

            fn index(&self, id: $id) -> &$value {
                self.get(id.0)
            }
        }

        impl std::ops::IndexMut<$id> for Arena<$value> {
            fn index_mut(&mut self, id: $id) -> &mut $value {
                self.get_mut(id.0)
            }
        }
    };
}

arena_index!(ShadowId, ShadowNode);
arena_index!(ElementId, Element);
arena_index!(BatchId, crate::batch::Batch);

/// Structural kind of a shadow node, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShadowKind {
    Group,
    Transform,
    Opacity,
    Clip,
    Geometry,
    Callback,
}

/// Per-node render state mirrored from the scene.
pub(crate) struct ShadowNode {
    pub node: NodeId,
    pub parent: Option<ShadowId>,
    pub children: Vec<ShadowId>,
    pub kind: ShadowKind,

    /// Changes reported for this node since it was last visited.
    pub dirty: DirtyState,
    /// Union of propagated dirty bits reported anywhere below this node.
    pub descendant_dirty: DirtyState,

    /// Clip nodes and promoted transform nodes anchor their own render-order
    /// window and model-view matrix.
    pub is_batch_root: bool,
    /// Set for one traversal after a transform node is promoted, forcing its
    /// subtree to pick up the new root.
    pub became_batch_root: bool,
    pub root_info: Option<Box<BatchRootInfo>>,

    /// Opacity nodes: whether the combined opacity was above the opaque
    /// threshold after the last traversal.
    pub is_opaque: bool,
    pub combined_opacity: f32,

    /// Clip nodes: the next clip above this one.
    pub clip_parent: Option<NodeId>,

    /// Geometry and callback nodes: their entry in the element arena.
    pub element: Option<ElementId>,
}

impl ShadowNode {
    pub(crate) fn new(node: NodeId, parent: Option<ShadowId>, kind: ShadowKind) -> Self {
        Self {
            node,
            parent,
            children: Vec::new(),
            kind,
            dirty: DirtyState::empty(),
            descendant_dirty: DirtyState::empty(),
            is_batch_root: false,
            became_batch_root: false,
            root_info: None,
            is_opaque: true,
            combined_opacity: 1.0,
            clip_parent: None,
            element: None,
        }
    }
}

/// Bookkeeping for a batch root: the render-order window reserved for its
/// subtree and its model-view matrix.
pub(crate) struct BatchRootInfo {
    /// The batch root this one nests inside.
    pub parent_root: Option<ShadowId>,
    /// Batch roots directly below this one, with no other root in between.
    pub sub_roots: AHashSet<ShadowId>,
    /// Transform from this root to the scene root, including the root's own
    /// matrix for transform roots and the accumulated matrix for clip roots.
    pub matrix: Mat4,
    /// First render order assigned inside this root's subtree.
    pub first_order: i32,
    /// Last order of the window, including slack.
    pub last_order: i32,
    /// Orders still unclaimed at the end of the window. Goes negative when
    /// additions overflow the window.
    pub available_orders: i32,
}

impl Default for BatchRootInfo {
    fn default() -> Self {
        Self {
            parent_root: None,
            sub_roots: AHashSet::new(),
            matrix: Mat4::IDENTITY,
            first_order: -1,
            last_order: -1,
            available_orders: 0,
        }
    }
}

/// A renderable's slot in the render lists.
///
/// Elements survive node removal as tombstones (`removed` set) until the
/// next frame's cleanup pass, so batches can unlink them lazily.
pub(crate) struct Element {
    pub node: NodeId,
    /// Painter's order. Higher orders draw above lower ones.
    pub order: i32,
    pub batch: Option<BatchId>,
    /// Intrusive list linking the elements of a batch in order.
    pub next_in_batch: Option<ElementId>,
    pub root: Option<ShadowId>,

    /// Transform from the node to its batch root.
    pub rel_matrix: Mat4,
    pub inherited_opacity: f32,
    /// Whether the material carried `BLENDING` when last checked. A flip
    /// moves the element between the opaque and alpha passes.
    pub is_material_blended: bool,
    /// Innermost enclosing clip node.
    pub clip: Option<NodeId>,
    /// True while `rel_matrix` is a pure translation.
    pub translate_only_to_root: bool,

    /// Bounds in batch-root space, valid when `bounds_computed`.
    pub bounds: Rect,
    pub bounds_computed: bool,
    pub bounds_outside_float_range: bool,

    pub removed: bool,
    /// Set while the element is parked between a partial render-list rebuild
    /// and being spliced back.
    pub orphaned: bool,
    /// Callback nodes; they form single-element batches.
    pub is_render_node: bool,
}

impl Element {
    pub(crate) fn new(node: NodeId) -> Self {
        Self {
            node,
            order: 0,
            batch: None,
            next_in_batch: None,
            root: None,
            rel_matrix: Mat4::IDENTITY,
            inherited_opacity: 1.0,
            is_material_blended: false,
            clip: None,
            translate_only_to_root: true,
            bounds: Rect::default(),
            bounds_computed: false,
            bounds_outside_float_range: false,
            removed: false,
            orphaned: false,
            is_render_node: false,
        }
    }

    pub(crate) fn render_node(node: NodeId) -> Self {
        let mut e = Self::new(node);
        e.is_render_node = true;
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reuses_released_slots() {
        let mut arena: Arena<u32> = Arena::default();
        let a = arena.alloc(1);
        let b = arena.alloc(2);
        assert_eq!(arena.len(), 2);
        arena.release(a);
        assert_eq!(arena.len(), 1);
        let c = arena.alloc(3);
        assert_eq!(a, c);
        assert_eq!(*arena.get(c), 3);
        assert_eq!(*arena.get(b), 2);
    }
}
