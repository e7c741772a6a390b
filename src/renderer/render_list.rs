//! Render-list construction.
//!
//! Traverses the live scene tree, whose sibling order is authoritative, and
//! fills the opaque and alpha render lists in back-to-front paint order
//! while assigning monotonically increasing render orders. Batch roots
//! reserve an order window with slack so that small additions below them
//! only renumber that window.

use super::*;

fn add_orphaned_elements(
    orphans: &mut Vec<ElementId>,
    list: &[Option<ElementId>],
    elements: &mut Arena<Element>,
) {
    orphans.clear();
    for slot in list {
        if let Some(e) = *slot {
            if !elements[e].removed {
                elements[e].orphaned = true;
                orphans.push(e);
            }
        }
    }
}

fn add_back_orphaned_elements(
    orphans: &mut Vec<ElementId>,
    list: &mut Vec<Option<ElementId>>,
    elements: &Arena<Element>,
) {
    for &e in orphans.iter() {
        if elements[e].orphaned {
            list.push(Some(e));
        }
    }
    orphans.clear();
}

impl Renderer {
    fn build_render_lists(&mut self, scene: &Scene, node: NodeId) {
        if scene.is_blocked(node) {
            return;
        }
        let Some(&sid) = self.node_to_shadow.get(&node) else {
            return;
        };

        let kind = self.shadow[sid].kind;
        if kind == ShadowKind::Geometry {
            if let Some(eid) = self.shadow[sid].element {
                let blending = material_blended(scene, node);
                let opaque = self.elements[eid].inherited_opacity > OPAQUE_LIMIT && !blending;
                if opaque {
                    self.opaque_render_list.push(Some(eid));
                } else {
                    self.alpha_render_list.push(Some(eid));
                }
                self.next_render_order += 1;
                self.elements[eid].order = self.next_render_order;
                if self.partial_rebuild {
                    self.elements[eid].orphaned = false;
                }
            }
        } else if kind == ShadowKind::Clip || self.shadow[sid].is_batch_root {
            if Some(sid) == self.partial_rebuild_root {
                // Rebuilding in place: reuse the window reserved last time.
                self.next_render_order = self.batch_root_info_mut(sid).first_order;
                for &child in scene.children(node) {
                    self.build_render_lists(scene, child);
                }
                self.next_render_order = self.batch_root_info_mut(sid).last_order + 1;
            } else {
                let first = self.next_render_order;
                for &child in scene.children(node) {
                    self.build_render_lists(scene, child);
                }
                let padding = order_window_slack(self.next_render_order - first);
                let last = self.next_render_order + padding;
                let info = self.batch_root_info_mut(sid);
                info.first_order = first;
                info.available_orders = padding;
                info.last_order = last;
                self.next_render_order = last;
            }
            return;
        } else if kind == ShadowKind::Callback {
            if let Some(eid) = self.shadow[sid].element {
                self.alpha_render_list.push(Some(eid));
                self.next_render_order += 1;
                self.elements[eid].order = self.next_render_order;
                if self.partial_rebuild {
                    self.elements[eid].orphaned = false;
                }
            }
        }

        for &child in scene.children(node) {
            self.build_render_lists(scene, child);
        }
    }

    pub(super) fn build_render_lists_from_scratch(&mut self, scene: &Scene) {
        self.opaque_render_list.clear();
        self.alpha_render_list.clear();

        for bid in std::mem::take(&mut self.opaque_batches) {
            self.invalidate_and_recycle_batch(bid);
        }
        for bid in std::mem::take(&mut self.alpha_batches) {
            self.invalidate_and_recycle_batch(bid);
        }

        self.next_render_order = 0;

        if let Some(root) = scene.root() {
            self.build_render_lists(scene, root);
        }
    }

    fn tag_sub_roots(&mut self, sid: ShadowId) {
        self.tagged_roots.insert(sid);
        let subs: Vec<ShadowId> = self
            .batch_root_info_mut(sid)
            .sub_roots
            .iter()
            .copied()
            .collect();
        for sub in subs {
            self.tag_sub_roots(sub);
        }
    }

    /// Rebuilds only the subtrees under the tagged batch roots, reusing each
    /// root's order window, then splices the untouched elements back in and
    /// restores list order by sorting.
    pub(super) fn build_render_lists_for_tagged_roots(&mut self, scene: &Scene) {
        // Everything currently listed is parked as an orphan. Elements under
        // tagged roots are un-orphaned during the rebuild; the rest get
        // added back afterwards so the lists stay complete.
        add_orphaned_elements(
            &mut self.tmp_opaque_elements,
            &self.opaque_render_list,
            &mut self.elements,
        );
        add_orphaned_elements(
            &mut self.tmp_alpha_elements,
            &self.alpha_render_list,
            &mut self.elements,
        );

        // Tagging a root implies its whole nested-root subtree.
        let roots: Vec<ShadowId> = self.tagged_roots.iter().copied().collect();
        for r in roots {
            self.tag_sub_roots(r);
        }

        for i in 0..self.opaque_batches.len() {
            let bid = self.opaque_batches[i];
            if self.batches[bid]
                .root
                .is_some_and(|r| self.tagged_roots.contains(&r))
            {
                self.invalidate_and_recycle_batch(bid);
            }
        }
        for i in 0..self.alpha_batches.len() {
            let bid = self.alpha_batches[i];
            if self.batches[bid]
                .root
                .is_some_and(|r| self.tagged_roots.contains(&r))
            {
                self.invalidate_and_recycle_batch(bid);
            }
        }

        self.opaque_render_list.clear();
        self.alpha_render_list.clear();
        let max_render_order = self.next_render_order;
        self.partial_rebuild = true;

        let tagged: Vec<ShadowId> = self.tagged_roots.iter().copied().collect();
        for r in tagged {
            let parent_root = self
                .shadow[r]
                .root_info
                .as_ref()
                .and_then(|i| i.parent_root);
            let topmost = parent_root.is_none_or(|p| !self.tagged_roots.contains(&p));
            let node = self.shadow[r].node;
            if topmost && !Self::is_node_blocked(scene, node) {
                self.next_render_order = self.batch_root_info_mut(r).first_order;
                self.partial_rebuild_root = Some(r);
                self.build_render_lists(scene, node);
            }
        }

        self.partial_rebuild = false;
        self.partial_rebuild_root = None;
        self.tagged_roots.clear();
        self.next_render_order = self.next_render_order.max(max_render_order);

        add_back_orphaned_elements(
            &mut self.tmp_opaque_elements,
            &mut self.opaque_render_list,
            &self.elements,
        );
        add_back_orphaned_elements(
            &mut self.tmp_alpha_elements,
            &mut self.alpha_render_list,
            &self.elements,
        );

        let elements = &self.elements;
        self.opaque_render_list.sort_unstable_by_key(|slot| {
            std::cmp::Reverse(slot.map_or(i32::MIN, |e| elements[e].order))
        });
        self.alpha_render_list
            .sort_unstable_by_key(|slot| slot.map_or(i32::MIN, |e| elements[e].order));
    }
}
