//! The application-facing scene tree.
//!
//! A [`Scene`] is a slot arena of nodes linked by ids, so removing a subtree
//! never leaves dangling references and child order is explicit. The scene
//! itself carries no render state; the [`Renderer`](crate::Renderer) mirrors
//! it into a shadow tree and is told about edits through
//! [`DirtyState`] notifications.

use bitflags::bitflags;

use crate::geometry::Geometry;
use crate::material::{Material, RenderCallback};
use crate::transform::Mat4;

/// Identifies a node in a [`Scene`].
///
/// Ids are slot indices and are reused after removal; holding on to an id
/// across a removal of its node is a logic error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// What changed about a node since the last frame.
    ///
    /// Passed to [`Renderer::node_changed`](crate::Renderer::node_changed)
    /// after editing the scene. `NODE_REMOVED` must be reported before the
    /// node is actually removed from the scene.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DirtyState: u32 {
        const SUBTREE_BLOCKED = 1 << 0;
        const MATRIX = 1 << 1;
        const NODE_ADDED = 1 << 2;
        const NODE_REMOVED = 1 << 3;
        const GEOMETRY = 1 << 4;
        const MATERIAL = 1 << 5;
        const OPACITY = 1 << 6;
        const FORCE_UPDATE = 1 << 7;
    }
}

impl DirtyState {
    /// The subset of flags that is also recorded on every ancestor, so the
    /// per-frame traversal can skip clean subtrees.
    pub(crate) fn propagated(self) -> DirtyState {
        self & (DirtyState::NODE_ADDED
            | DirtyState::OPACITY
            | DirtyState::MATRIX
            | DirtyState::SUBTREE_BLOCKED
            | DirtyState::FORCE_UPDATE)
    }
}

/// The payload of a scene node.
#[derive(Debug)]
pub enum NodeKind {
    /// Pure structure, contributes nothing to rendering.
    Group,
    /// Applies a matrix to everything below it.
    Transform { matrix: Mat4 },
    /// Multiplies the inherited opacity of everything below it.
    Opacity { opacity: f32 },
    /// Restricts everything below it to the interior of a geometry.
    Clip { geometry: Geometry },
    /// A renderable: geometry shaded by a material.
    Geometry {
        geometry: Geometry,
        material: Box<dyn Material>,
    },
    /// Application drawing injected into the frame at this node's position.
    Callback { callback: Box<dyn RenderCallback> },
}

impl NodeKind {
    fn renderable(&self) -> u32 {
        match self {
            NodeKind::Geometry { .. } | NodeKind::Callback { .. } => 1,
            _ => 0,
        }
    }
}

#[derive(Debug)]
struct SceneNode {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
    subtree_renderable_count: u32,
    blocked: bool,
}

/// A tree of nodes stored in a slot arena.
#[derive(Debug, Default)]
pub struct Scene {
    slots: Vec<Option<SceneNode>>,
    free: Vec<u32>,
    root: Option<NodeId>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Replaces the whole tree with a single root node.
    pub fn set_root(&mut self, kind: NodeKind) -> NodeId {
        self.slots.clear();
        self.free.clear();
        let id = self.alloc(None, kind);
        self.root = Some(id);
        id
    }

    /// Appends a child under `parent`. Later siblings render above earlier
    /// ones.
    pub fn add_child(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.alloc(Some(parent), kind);
        self.node_mut(parent).children.push(id);
        self.bump_renderable_counts(Some(parent), self.node(id).subtree_renderable_count as i64);
        id
    }

    /// Inserts a child at a specific position in `parent`'s child list.
    pub fn insert_child(&mut self, parent: NodeId, index: usize, kind: NodeKind) -> NodeId {
        let id = self.alloc(Some(parent), kind);
        self.node_mut(parent).children.insert(index, id);
        self.bump_renderable_counts(Some(parent), self.node(id).subtree_renderable_count as i64);
        id
    }

    /// Removes `id` and its whole subtree, freeing the slots for reuse.
    ///
    /// The renderer must have been notified with
    /// [`DirtyState::NODE_REMOVED`] before this call, while the subtree is
    /// still intact.
    pub fn remove(&mut self, id: NodeId) {
        let parent = self.node(id).parent;
        let count = self.node(id).subtree_renderable_count;
        if let Some(p) = parent {
            self.node_mut(p).children.retain(|c| *c != id);
            self.bump_renderable_counts(Some(p), -(count as i64));
        }
        if self.root == Some(id) {
            self.root = None;
        }
        self.free_subtree(id);
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
        &mut self.node_mut(id).kind
    }

    /// Renderables (geometry and callback nodes) in the subtree rooted at
    /// `id`, including `id` itself.
    pub fn subtree_renderable_count(&self, id: NodeId) -> u32 {
        self.node(id).subtree_renderable_count
    }

    pub fn is_blocked(&self, id: NodeId) -> bool {
        self.node(id).blocked
    }

    /// Blocked subtrees are skipped entirely while building render lists.
    /// Report [`DirtyState::SUBTREE_BLOCKED`] after toggling.
    pub fn set_blocked(&mut self, id: NodeId, blocked: bool) {
        self.node_mut(id).blocked = blocked;
    }

    pub fn matrix(&self, id: NodeId) -> Option<&Mat4> {
        match &self.node(id).kind {
            NodeKind::Transform { matrix } => Some(matrix),
            _ => None,
        }
    }

    pub fn set_matrix(&mut self, id: NodeId, matrix: Mat4) {
        match &mut self.node_mut(id).kind {
            NodeKind::Transform { matrix: m } => *m = matrix,
            _ => debug_assert!(false, "set_matrix on a non-transform node"),
        }
    }

    pub fn opacity(&self, id: NodeId) -> Option<f32> {
        match &self.node(id).kind {
            NodeKind::Opacity { opacity } => Some(*opacity),
            _ => None,
        }
    }

    pub fn set_opacity(&mut self, id: NodeId, opacity: f32) {
        match &mut self.node_mut(id).kind {
            NodeKind::Opacity { opacity: o } => *o = opacity,
            _ => debug_assert!(false, "set_opacity on a non-opacity node"),
        }
    }

    /// The geometry of a geometry or clip node.
    pub fn geometry(&self, id: NodeId) -> Option<&Geometry> {
        match &self.node(id).kind {
            NodeKind::Geometry { geometry, .. } | NodeKind::Clip { geometry } => Some(geometry),
            _ => None,
        }
    }

    pub fn geometry_mut(&mut self, id: NodeId) -> Option<&mut Geometry> {
        match &mut self.node_mut(id).kind {
            NodeKind::Geometry { geometry, .. } | NodeKind::Clip { geometry } => Some(geometry),
            _ => None,
        }
    }

    pub fn material(&self, id: NodeId) -> Option<&dyn Material> {
        match &self.node(id).kind {
            NodeKind::Geometry { material, .. } => Some(material.as_ref()),
            _ => None,
        }
    }

    pub fn set_material(&mut self, id: NodeId, material: Box<dyn Material>) {
        match &mut self.node_mut(id).kind {
            NodeKind::Geometry { material: m, .. } => *m = material,
            _ => debug_assert!(false, "set_material on a non-geometry node"),
        }
    }

    pub(crate) fn callback_mut(&mut self, id: NodeId) -> Option<&mut dyn RenderCallback> {
        match &mut self.node_mut(id).kind {
            NodeKind::Callback { callback } => Some(callback.as_mut()),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|slot| slot.is_some())
    }

    fn alloc(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let node = SceneNode {
            parent,
            children: Vec::new(),
            subtree_renderable_count: kind.renderable(),
            blocked: false,
            kind,
        };
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() as u32 - 1)
            }
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.node_mut(id).children);
        for child in children {
            self.free_subtree(child);
        }
        self.slots[id.index()] = None;
        self.free.push(id.0);
    }

    fn bump_renderable_counts(&mut self, mut at: Option<NodeId>, delta: i64) {
        while let Some(id) = at {
            let node = self.node_mut(id);
            node.subtree_renderable_count =
                (node.subtree_renderable_count as i64 + delta) as u32;
            at = node.parent;
        }
    }

    fn node(&self, id: NodeId) -> &SceneNode {
        self.slots[id.index()].as_ref().expect("stale node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut SceneNode {
        self.slots[id.index()].as_mut().expect("stale node id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::material::FlatColorMaterial;

    fn geometry_node() -> NodeKind {
        NodeKind::Geometry {
            geometry: Geometry::quad(0.0, 0.0, 1.0, 1.0),
            material: Box::new(FlatColorMaterial::new(Color::WHITE)),
        }
    }

    #[test]
    fn renderable_counts_track_inserts_and_removals() {
        let mut scene = Scene::new();
        let root = scene.set_root(NodeKind::Group);
        let group = scene.add_child(root, NodeKind::Group);
        let a = scene.add_child(group, geometry_node());
        let _b = scene.add_child(group, geometry_node());
        scene.add_child(root, geometry_node());

        assert_eq!(scene.subtree_renderable_count(root), 3);
        assert_eq!(scene.subtree_renderable_count(group), 2);

        scene.remove(a);
        assert_eq!(scene.subtree_renderable_count(root), 2);
        assert_eq!(scene.subtree_renderable_count(group), 1);

        scene.remove(group);
        assert_eq!(scene.subtree_renderable_count(root), 1);
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut scene = Scene::new();
        let root = scene.set_root(NodeKind::Group);
        let a = scene.add_child(root, NodeKind::Group);
        scene.remove(a);
        assert!(!scene.contains(a));
        let b = scene.add_child(root, NodeKind::Group);
        assert_eq!(a, b);
        assert!(scene.contains(b));
    }

    #[test]
    fn insert_child_controls_sibling_order() {
        let mut scene = Scene::new();
        let root = scene.set_root(NodeKind::Group);
        let a = scene.add_child(root, NodeKind::Group);
        let c = scene.add_child(root, NodeKind::Group);
        let b = scene.insert_child(root, 1, NodeKind::Group);
        assert_eq!(scene.children(root), &[a, b, c]);
    }

    #[test]
    fn propagated_flags_subset() {
        let all = DirtyState::all();
        let propagated = all.propagated();
        assert!(propagated.contains(DirtyState::MATRIX));
        assert!(!propagated.contains(DirtyState::GEOMETRY));
        assert!(!propagated.contains(DirtyState::NODE_REMOVED));
    }
}
