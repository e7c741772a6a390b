//! The CPU side of the renderer: shadow tree maintenance, render-list
//! construction, batching and buffer packing.
//!
//! The renderer never touches GPU resources. [`Renderer::prepare`] turns the
//! accumulated dirty state and the current [`Scene`] into a [`Frame`], which
//! a [`GpuContext`](crate::GpuContext) then executes. Everything here is
//! driven by [`Renderer::node_changed`] notifications; unreported edits are
//! not picked up.

mod batcher;
pub(crate) mod debug_tools;
mod render_list;
mod updater;
mod upload;

use ahash::{AHashMap, AHashSet};
use bitflags::bitflags;

use crate::batch::Batch;
use crate::frame::Frame;
use crate::material::MaterialFlags;
use crate::scene::{DirtyState, NodeId, Scene};
use crate::shadow::{
    Arena, BatchId, BatchRootInfo, Element, ElementId, ShadowId, ShadowKind, ShadowNode,
};
use crate::transform::Mat4;

/// Inherited opacities above this limit count as fully opaque, which keeps
/// elements eligible for the front-to-back opaque pass.
pub(crate) const OPAQUE_LIMIT: f32 = 0.999;

/// Slack appended to a batch root's render-order window, as a fraction of
/// the orders its subtree claimed. Lets nodes be added under the root
/// without renumbering the whole tree.
pub(crate) fn order_window_slack(span: i32) -> i32 {
    span >> 2
}

/// Whether a node's material sends it to the back-to-front alpha pass.
pub(crate) fn material_blended(scene: &Scene, node: NodeId) -> bool {
    scene
        .material(node)
        .is_some_and(|m| m.flags().contains(MaterialFlags::BLENDING))
}

/// How batch vertex buffers are re-uploaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStrategy {
    /// Recreate the GPU buffer on every upload.
    Static,
    /// Keep the buffer and write into it when the size is unchanged.
    Dynamic,
    /// Like `Dynamic`; kept separate for tuning via the environment.
    Stream,
}

/// Tunables for the batching heuristics.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// A transform node whose subtree holds more renderables than this is
    /// promoted to a batch root when its matrix changes.
    pub batch_node_threshold: u32,
    /// Same promotion, based on the subtree's summed vertex count.
    pub batch_vertex_threshold: u32,
    pub buffer_strategy: BufferStrategy,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            batch_node_threshold: 64,
            batch_vertex_threshold: 1024,
            buffer_strategy: BufferStrategy::Static,
        }
    }
}

impl RendererConfig {
    /// Reads overrides from `STRATA_BATCH_NODE_THRESHOLD`,
    /// `STRATA_BATCH_VERTEX_THRESHOLD` and `STRATA_BUFFER_STRATEGY`
    /// (`static`, `dynamic` or `stream`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("STRATA_BATCH_NODE_THRESHOLD") {
            match v.parse() {
                Ok(n) => config.batch_node_threshold = n,
                Err(_) => log::warn!("ignoring invalid STRATA_BATCH_NODE_THRESHOLD: {v:?}"),
            }
        }
        if let Ok(v) = std::env::var("STRATA_BATCH_VERTEX_THRESHOLD") {
            match v.parse() {
                Ok(n) => config.batch_vertex_threshold = n,
                Err(_) => log::warn!("ignoring invalid STRATA_BATCH_VERTEX_THRESHOLD: {v:?}"),
            }
        }
        if let Ok(v) = std::env::var("STRATA_BUFFER_STRATEGY") {
            match v.as_str() {
                "static" => config.buffer_strategy = BufferStrategy::Static,
                "dynamic" => config.buffer_strategy = BufferStrategy::Dynamic,
                "stream" => config.buffer_strategy = BufferStrategy::Stream,
                _ => log::warn!("ignoring invalid STRATA_BUFFER_STRATEGY: {v:?}"),
            }
        }
        config
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct Rebuild: u32 {
        const BUILD_RENDER_LISTS = 1 << 0;
        const BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS = 1 << 1;
        const BUILD_BATCHES = 1 << 2;
    }
}

impl Rebuild {
    pub(crate) const FULL: Rebuild =
        Rebuild::BUILD_RENDER_LISTS.union(Rebuild::BUILD_BATCHES);
}

/// Retained batching state for one scene.
pub struct Renderer {
    config: RendererConfig,

    node_to_shadow: AHashMap<NodeId, ShadowId>,
    shadow: Arena<ShadowNode>,
    elements: Arena<Element>,
    batches: Arena<Batch>,
    root: Option<ShadowId>,

    /// Render lists hold tombstones (`None`) where elements were deleted.
    opaque_render_list: Vec<Option<ElementId>>,
    alpha_render_list: Vec<Option<ElementId>>,
    next_render_order: i32,
    partial_rebuild: bool,
    partial_rebuild_root: Option<ShadowId>,

    opaque_batches: Vec<BatchId>,
    alpha_batches: Vec<BatchId>,
    batch_pool: Vec<BatchId>,

    elements_to_delete: Vec<ElementId>,
    tmp_opaque_elements: Vec<ElementId>,
    tmp_alpha_elements: Vec<ElementId>,

    tagged_roots: AHashSet<ShadowId>,
    rebuild: Rebuild,
    z_range: f32,
    viewport: (u32, u32),
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(RendererConfig::default())
    }
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Self {
        log::debug!(
            "batch thresholds: nodes {}, vertices {}, buffer strategy {:?}",
            config.batch_node_threshold,
            config.batch_vertex_threshold,
            config.buffer_strategy,
        );
        Self {
            config,
            node_to_shadow: AHashMap::new(),
            shadow: Arena::default(),
            elements: Arena::default(),
            batches: Arena::default(),
            root: None,
            opaque_render_list: Vec::new(),
            alpha_render_list: Vec::new(),
            next_render_order: 0,
            partial_rebuild: false,
            partial_rebuild_root: None,
            opaque_batches: Vec::new(),
            alpha_batches: Vec::new(),
            batch_pool: Vec::new(),
            elements_to_delete: Vec::new(),
            tmp_opaque_elements: Vec::new(),
            tmp_alpha_elements: Vec::new(),
            tagged_roots: AHashSet::new(),
            rebuild: Rebuild::FULL,
            z_range: 0.0,
            viewport: (0, 0),
        }
    }

    /// Physical size of the render target, used for the frame's projection.
    pub fn set_viewport_size(&mut self, size: (u32, u32)) {
        self.viewport = size;
    }

    pub fn viewport_size(&self) -> (u32, u32) {
        self.viewport
    }

    /// Reports a scene edit. `NODE_ADDED` is expected after inserting a
    /// subtree, `NODE_REMOVED` before removing one, and the remaining flags
    /// after mutating a node in place.
    pub fn node_changed(&mut self, scene: &Scene, node: NodeId, state: DirtyState) {
        // Handled first because it recurses into an add or a remove.
        if state.contains(DirtyState::SUBTREE_BLOCKED) {
            let present = self.node_to_shadow.contains_key(&node);
            let blocked = scene.is_blocked(node);
            if blocked && present {
                self.node_changed(scene, node, DirtyState::NODE_REMOVED);
            } else if !blocked && !present {
                self.node_changed(scene, node, DirtyState::NODE_ADDED);
            }
            return;
        }

        if state.contains(DirtyState::NODE_ADDED) {
            if Self::is_node_blocked(scene, node) {
                return;
            }
            let shadow_parent = scene
                .parent(node)
                .and_then(|p| self.node_to_shadow.get(&p).copied());
            self.node_was_added(scene, node, shadow_parent);
            if scene.parent(node).is_none() {
                self.root = self.node_to_shadow.get(&node).copied();
            }
        }

        // Blocked subtrees have no shadow nodes.
        let Some(&sid) = self.node_to_shadow.get(&node) else {
            return;
        };

        self.shadow[sid].dirty |= state;

        if state.contains(DirtyState::MATRIX)
            && !self.shadow[sid].is_batch_root
            && self.shadow[sid].kind == ShadowKind::Transform
        {
            if scene.subtree_renderable_count(node) > self.config.batch_node_threshold {
                self.turn_node_into_batch_root(sid);
            } else {
                let mut vertices = 0;
                self.node_was_transformed(scene, sid, &mut vertices);
                if vertices > self.config.batch_vertex_threshold {
                    self.turn_node_into_batch_root(sid);
                }
            }
        }

        if state.contains(DirtyState::GEOMETRY) && self.shadow[sid].kind == ShadowKind::Geometry {
            if let Some(eid) = self.shadow[sid].element {
                self.elements[eid].bounds_computed = false;
                if let Some(bid) = self.elements[eid].batch {
                    if !self.geometry_was_changed(scene, bid, node) {
                        self.rebuild |= Rebuild::FULL;
                    } else if !self.batches[bid].is_opaque {
                        match self.elements[eid].root {
                            Some(r) => {
                                self.tagged_roots.insert(r);
                                self.rebuild |= Rebuild::BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS;
                            }
                            None => self.rebuild |= Rebuild::FULL,
                        }
                    } else {
                        self.batches[bid].needs_upload = true;
                    }
                }
            }
        }

        if state.contains(DirtyState::MATERIAL) && self.shadow[sid].kind == ShadowKind::Geometry {
            if let Some(eid) = self.shadow[sid].element {
                let blended = material_blended(scene, node);
                if self.elements[eid].is_material_blended != blended {
                    // The element changes passes, which reorders the lists
                    // around it.
                    self.elements[eid].is_material_blended = blended;
                    self.rebuild |= Rebuild::FULL;
                } else {
                    match self.elements[eid].batch {
                        Some(bid) => {
                            if !self.batches[bid].is_material_compatible(eid, &self.elements, scene)
                            {
                                self.rebuild |= Rebuild::FULL;
                            }
                        }
                        None => self.rebuild |= Rebuild::BUILD_BATCHES,
                    }
                }
            }
        }

        let chain = state.propagated();
        if !chain.is_empty() {
            let mut p = self.shadow[sid].parent;
            while let Some(pid) = p {
                self.shadow[pid].descendant_dirty |= chain;
                p = self.shadow[pid].parent;
            }
        }

        // Last, as it frees the shadow node.
        if state.contains(DirtyState::NODE_REMOVED) {
            if let Some(pid) = self.shadow[sid].parent {
                self.shadow[pid].children.retain(|c| *c != sid);
            }
            if self.root == Some(sid) {
                self.root = None;
            }
            self.node_was_removed(sid);
        }
    }

    /// Runs a full frame step: traverses dirty state, rebuilds render lists
    /// and batches as needed, packs vertex buffers and returns the draw
    /// description for the frame.
    pub fn prepare(&mut self, scene: &Scene) -> Frame {
        let projection = if self.viewport.0 > 0 && self.viewport.1 > 0 {
            Mat4::ortho(self.viewport.0 as f32, self.viewport.1 as f32)
        } else {
            Mat4::IDENTITY
        };

        if self.root.is_none() {
            return Frame::empty(projection, self.viewport);
        }

        self.update_states(scene);

        if self.rebuild.intersects(
            Rebuild::BUILD_RENDER_LISTS | Rebuild::BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS,
        ) {
            if self.rebuild.contains(Rebuild::BUILD_RENDER_LISTS) {
                self.build_render_lists_from_scratch(scene);
            } else {
                self.build_render_lists_for_tagged_roots(scene);
            }
            self.rebuild |= Rebuild::BUILD_BATCHES;
        }

        for i in 0..self.opaque_batches.len() {
            let bid = self.opaque_batches[i];
            self.batches[bid].cleanup_removed_elements(&mut self.elements);
        }
        for i in 0..self.alpha_batches.len() {
            let bid = self.alpha_batches[i];
            self.batches[bid].cleanup_removed_elements(&mut self.elements);
        }
        self.delete_removed_elements();

        self.cleanup_batch_list(true);
        self.cleanup_batch_list(false);

        if self.rebuild.contains(Rebuild::BUILD_BATCHES) {
            self.prepare_opaque_batches(scene);
            self.prepare_alpha_batches(scene);
        }

        self.delete_removed_elements();

        // Opaque batches render front to back to make the most of the depth
        // test; alpha batches render back to front.
        self.opaque_batches
            .sort_unstable_by_key(|&b| std::cmp::Reverse(self.batches[b].first_order(&self.elements)));
        self.alpha_batches
            .sort_unstable_by_key(|&b| self.batches[b].first_order(&self.elements));

        self.z_range = if self.next_render_order > 0 {
            1.0 / self.next_render_order as f32
        } else {
            0.0
        };

        for i in 0..self.opaque_batches.len() {
            let bid = self.opaque_batches[i];
            self.upload_batch(scene, bid);
        }
        for i in 0..self.alpha_batches.len() {
            let bid = self.alpha_batches[i];
            self.upload_batch(scene, bid);
        }

        let frame = self.build_frame(scene, projection);
        self.rebuild = Rebuild::empty();
        frame
    }

    pub(crate) fn buffer_strategy(&self) -> BufferStrategy {
        self.config.buffer_strategy
    }

    pub(crate) fn batch_buffer_mut(&mut self, bid: BatchId) -> &mut crate::batch::BatchBuffer {
        &mut self.batches[bid].buffer
    }

    fn is_node_blocked(scene: &Scene, node: NodeId) -> bool {
        let mut n = Some(node);
        while let Some(id) = n {
            if scene.is_blocked(id) {
                return true;
            }
            n = scene.parent(id);
        }
        false
    }

    fn node_was_added(&mut self, scene: &Scene, node: NodeId, shadow_parent: Option<ShadowId>) {
        debug_assert!(!self.node_to_shadow.contains_key(&node));
        if scene.is_blocked(node) {
            return;
        }

        let kind = match scene.kind(node) {
            crate::scene::NodeKind::Group => ShadowKind::Group,
            crate::scene::NodeKind::Transform { .. } => ShadowKind::Transform,
            crate::scene::NodeKind::Opacity { .. } => ShadowKind::Opacity,
            crate::scene::NodeKind::Clip { .. } => ShadowKind::Clip,
            crate::scene::NodeKind::Geometry { .. } => ShadowKind::Geometry,
            crate::scene::NodeKind::Callback { .. } => ShadowKind::Callback,
        };

        let sid = ShadowId(self.shadow.alloc(ShadowNode::new(node, shadow_parent, kind)));
        self.node_to_shadow.insert(node, sid);
        if let Some(p) = shadow_parent {
            self.shadow[p].children.push(sid);
        }

        match kind {
            ShadowKind::Geometry => {
                let mut element = Element::new(node);
                element.is_material_blended = material_blended(scene, node);
                let eid = ElementId(self.elements.alloc(element));
                self.shadow[sid].element = Some(eid);
            }
            ShadowKind::Callback => {
                let eid = ElementId(self.elements.alloc(Element::render_node(node)));
                self.shadow[sid].element = Some(eid);
                self.rebuild |= Rebuild::FULL;
            }
            ShadowKind::Clip => {
                self.shadow[sid].root_info = Some(Box::default());
                self.rebuild |= Rebuild::FULL;
            }
            _ => {}
        }

        for &child in scene.children(node) {
            self.node_was_added(scene, child, Some(sid));
        }
    }

    fn node_was_removed(&mut self, sid: ShadowId) {
        // Children first; batch-root unlinking below walks bottom-up.
        let children = std::mem::take(&mut self.shadow[sid].children);
        for child in children {
            self.node_was_removed(child);
        }

        match self.shadow[sid].kind {
            ShadowKind::Geometry => {
                if let Some(eid) = self.shadow[sid].element {
                    self.elements[eid].removed = true;
                    self.elements_to_delete.push(eid);
                    if let Some(r) = self.elements[eid].root {
                        self.batch_root_info_mut(r).available_orders += 1;
                    }
                    if let Some(bid) = self.elements[eid].batch {
                        self.batches[bid].needs_upload = true;
                    }
                }
            }
            ShadowKind::Callback => {
                if let Some(eid) = self.shadow[sid].element {
                    self.elements[eid].removed = true;
                    self.elements_to_delete.push(eid);
                }
            }
            ShadowKind::Clip => {
                self.remove_batch_root_from_parent(sid);
                self.shadow[sid].root_info = None;
                self.rebuild |= Rebuild::FULL;
                self.tagged_roots.remove(&sid);
            }
            ShadowKind::Transform if self.shadow[sid].is_batch_root => {
                self.remove_batch_root_from_parent(sid);
                self.shadow[sid].root_info = None;
                self.rebuild |= Rebuild::FULL;
                self.tagged_roots.remove(&sid);
            }
            _ => {}
        }

        let node = self.shadow[sid].node;
        self.node_to_shadow.remove(&node);
        self.shadow.release(sid.0);
    }

    fn node_was_transformed(&mut self, scene: &Scene, sid: ShadowId, vertex_count: &mut u32) {
        if self.shadow[sid].kind == ShadowKind::Geometry {
            let node = self.shadow[sid].node;
            if let Some(g) = scene.geometry(node) {
                *vertex_count += g.vertex_count() as u32;
            }
            if let Some(eid) = self.shadow[sid].element {
                self.elements[eid].bounds_computed = false;
                if let Some(bid) = self.elements[eid].batch {
                    if !self.batches[bid].is_opaque {
                        match self.elements[eid].root {
                            Some(r) => {
                                self.tagged_roots.insert(r);
                                self.rebuild |= Rebuild::BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS;
                            }
                            None => self.rebuild |= Rebuild::FULL,
                        }
                    } else if self.batches[bid].merged {
                        self.batches[bid].needs_upload = true;
                    }
                }
            }
        }

        for i in 0..self.shadow[sid].children.len() {
            let child = self.shadow[sid].children[i];
            self.node_was_transformed(scene, child, vertex_count);
        }
    }

    fn turn_node_into_batch_root(&mut self, sid: ShadowId) {
        log::trace!("promoting {:?} to batch root", self.shadow[sid].node);
        self.rebuild |= Rebuild::FULL;
        self.shadow[sid].is_batch_root = true;
        self.shadow[sid].became_batch_root = true;

        let mut p = self.shadow[sid].parent;
        while let Some(pid) = p {
            if self.shadow[pid].kind == ShadowKind::Clip || self.shadow[pid].is_batch_root {
                self.register_batch_root(sid, pid);
                break;
            }
            p = self.shadow[pid].parent;
        }

        for i in 0..self.shadow[sid].children.len() {
            let child = self.shadow[sid].children[i];
            self.node_changed_batch_root(child, sid);
        }
    }

    fn node_changed_batch_root(&mut self, sid: ShadowId, root: ShadowId) {
        if self.shadow[sid].kind == ShadowKind::Clip || self.shadow[sid].is_batch_root {
            // Nested roots keep their own subtree; only their parent link
            // moves.
            self.change_batch_root(sid, root);
            return;
        }
        if self.shadow[sid].kind == ShadowKind::Geometry {
            if let Some(eid) = self.shadow[sid].element {
                self.elements[eid].root = Some(root);
                self.elements[eid].bounds_computed = false;
            }
        }
        for i in 0..self.shadow[sid].children.len() {
            let child = self.shadow[sid].children[i];
            self.node_changed_batch_root(child, root);
        }
    }

    pub(crate) fn batch_root_info_mut(&mut self, sid: ShadowId) -> &mut BatchRootInfo {
        debug_assert!(matches!(
            self.shadow[sid].kind,
            ShadowKind::Clip | ShadowKind::Transform
        ));
        self.shadow[sid]
            .root_info
            .get_or_insert_with(Box::default)
    }

    fn remove_batch_root_from_parent(&mut self, child: ShadowId) {
        let Some(parent) = self.batch_root_info_mut(child).parent_root.take() else {
            return;
        };
        self.batch_root_info_mut(parent).sub_roots.remove(&child);
    }

    pub(crate) fn register_batch_root(&mut self, sub: ShadowId, parent: ShadowId) {
        self.batch_root_info_mut(sub).parent_root = Some(parent);
        self.batch_root_info_mut(parent).sub_roots.insert(sub);
    }

    fn change_batch_root(&mut self, sid: ShadowId, root: ShadowId) -> bool {
        if self.batch_root_info_mut(sid).parent_root == Some(root) {
            return false;
        }
        if let Some(old) = self.batch_root_info_mut(sid).parent_root {
            self.batch_root_info_mut(old).sub_roots.remove(&sid);
        }
        self.batch_root_info_mut(root).sub_roots.insert(sid);
        self.batch_root_info_mut(sid).parent_root = Some(root);
        true
    }

    pub(crate) fn matrix_for_root(&self, root: Option<ShadowId>) -> Mat4 {
        match root {
            Some(r) => self.shadow[r]
                .root_info
                .as_ref()
                .map(|i| i.matrix)
                .unwrap_or(Mat4::IDENTITY),
            None => Mat4::IDENTITY,
        }
    }

    pub(crate) fn new_batch(&mut self) -> BatchId {
        match self.batch_pool.pop() {
            Some(bid) => {
                self.batches[bid].reset();
                bid
            }
            None => BatchId(self.batches.alloc(Batch::new())),
        }
    }

    pub(crate) fn invalidate_and_recycle_batch(&mut self, bid: BatchId) {
        self.batches[bid].invalidate(&mut self.elements);
        if !self.batch_pool.contains(&bid) {
            self.batch_pool.push(bid);
        }
    }

    pub(crate) fn invalidate_alpha_batches_for_root(&mut self, root: Option<ShadowId>) {
        for i in 0..self.alpha_batches.len() {
            let bid = self.alpha_batches[i];
            if root.is_none() || self.batches[bid].root == root {
                self.batches[bid].invalidate(&mut self.elements);
            }
        }
    }

    /// Compacts a batch list, moving emptied batches back to the pool.
    fn cleanup_batch_list(&mut self, opaque: bool) {
        let mut list = std::mem::take(if opaque {
            &mut self.opaque_batches
        } else {
            &mut self.alpha_batches
        });
        list.sort_by_key(|&b| self.batches[b].first.is_none());
        let valid = list
            .iter()
            .take_while(|&&b| self.batches[b].first.is_some())
            .count();
        for i in valid..list.len() {
            self.invalidate_and_recycle_batch(list[i]);
        }
        list.truncate(valid);
        if opaque {
            self.opaque_batches = list;
        } else {
            self.alpha_batches = list;
        }
    }

    /// Whether the changed geometry of `node` still fits its batch. Marks
    /// the batch for re-upload when it does.
    fn geometry_was_changed(&mut self, scene: &Scene, bid: BatchId, node: NodeId) -> bool {
        let mut cursor = self.batches[bid].first;
        while let Some(e) = cursor {
            if self.elements[e].node != node && !self.elements[e].removed {
                break;
            }
            cursor = self.elements[e].next_in_batch;
        }
        let compatible = match cursor {
            None => true,
            Some(e) => match (
                scene.geometry(self.elements[e].node),
                scene.geometry(node),
            ) {
                (Some(a), Some(b)) => a.layout() == b.layout(),
                _ => false,
            },
        };
        if compatible {
            self.batches[bid].needs_upload = true;
        }
        compatible
    }

    fn delete_removed_elements(&mut self) {
        if self.elements_to_delete.is_empty() {
            return;
        }
        for slot in self.opaque_render_list.iter_mut() {
            if slot.is_some_and(|e| self.elements[e].removed) {
                *slot = None;
            }
        }
        for slot in self.alpha_render_list.iter_mut() {
            if slot.is_some_and(|e| self.elements[e].removed) {
                *slot = None;
            }
        }
        for eid in std::mem::take(&mut self.elements_to_delete) {
            self.elements.release(eid.0);
        }
    }
}
