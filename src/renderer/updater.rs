//! The per-frame dirty-state traversal.
//!
//! Walks the shadow tree top-down once per frame, skipping subtrees with no
//! accumulated dirt, while maintaining stacks of combined matrices,
//! opacities and enclosing batch roots. Geometry elements pick up their
//! root-relative matrix, inherited opacity and clip here; batch roots pick
//! up their model-view matrix.

use super::*;

struct Updater<'a, 'r> {
    r: &'r mut Renderer,
    scene: &'a Scene,
    /// Matrices relative to the innermost batch root.
    matrix_stack: Vec<Mat4>,
    opacity_stack: Vec<f32>,
    roots: Vec<Option<ShadowId>>,
    /// Absolute matrices of the roots on the `roots` stack.
    root_matrices: Vec<Mat4>,
    current_clip: Option<NodeId>,
    added: u32,
    force_update: u32,
    transform_change: u32,
}

impl Renderer {
    pub(crate) fn update_states(&mut self, scene: &Scene) {
        let Some(root) = self.root else {
            return;
        };
        let mut updater = Updater {
            r: self,
            scene,
            matrix_stack: vec![Mat4::IDENTITY],
            opacity_stack: vec![1.0],
            roots: vec![None],
            root_matrices: vec![Mat4::IDENTITY],
            current_clip: None,
            added: 0,
            force_update: 0,
            transform_change: 0,
        };
        updater.visit_node(root);
    }
}

impl Updater<'_, '_> {
    fn rel_matrix(&self) -> Mat4 {
        self.matrix_stack.last().copied().unwrap_or(Mat4::IDENTITY)
    }

    fn root_matrix(&self) -> Mat4 {
        self.root_matrices.last().copied().unwrap_or(Mat4::IDENTITY)
    }

    fn current_root(&self) -> Option<ShadowId> {
        self.roots.last().copied().flatten()
    }

    fn opacity(&self) -> f32 {
        self.opacity_stack.last().copied().unwrap_or(1.0)
    }

    fn visit_node(&mut self, sid: ShadowId) {
        {
            let n = &self.r.shadow[sid];
            if self.added == 0
                && self.force_update == 0
                && self.transform_change == 0
                && n.dirty.is_empty()
                && n.descendant_dirty.is_empty()
            {
                return;
            }
        }

        let added_before = self.added;
        if self.r.shadow[sid].dirty.contains(DirtyState::NODE_ADDED) {
            self.added += 1;
        }
        let force_before = self.force_update;
        if self.r.shadow[sid].dirty.contains(DirtyState::FORCE_UPDATE) {
            self.force_update += 1;
        }

        match self.r.shadow[sid].kind {
            ShadowKind::Opacity => self.visit_opacity_node(sid),
            ShadowKind::Transform => self.visit_transform_node(sid),
            ShadowKind::Geometry => self.visit_geometry_node(sid),
            ShadowKind::Clip => self.visit_clip_node(sid),
            ShadowKind::Callback => {
                if let Some(eid) = self.r.shadow[sid].element {
                    if self.added > 0 {
                        self.r.elements[eid].root = self.current_root();
                    }
                    self.r.elements[eid].rel_matrix = self.rel_matrix();
                    self.r.elements[eid].inherited_opacity = self.opacity();
                    self.r.elements[eid].clip = self.current_clip;
                }
                self.visit_children(sid);
            }
            ShadowKind::Group => self.visit_children(sid),
        }

        self.added = added_before;
        self.force_update = force_before;
        self.r.shadow[sid].dirty = DirtyState::empty();
        self.r.shadow[sid].descendant_dirty = DirtyState::empty();
    }

    fn visit_children(&mut self, sid: ShadowId) {
        for i in 0..self.r.shadow[sid].children.len() {
            let child = self.r.shadow[sid].children[i];
            self.visit_node(child);
        }
    }

    fn visit_clip_node(&mut self, sid: ShadowId) {
        if self.added > 0 {
            if let Some(parent_root) = self.current_root() {
                self.r.register_batch_root(sid, parent_root);
            }
        }

        let node = self.r.shadow[sid].node;
        let clip_before = self.current_clip;
        self.r.shadow[sid].clip_parent = clip_before;
        self.current_clip = Some(node);

        let root_matrix = self.root_matrix() * self.rel_matrix();
        self.r.batch_root_info_mut(sid).matrix = root_matrix;
        self.roots.push(Some(sid));
        self.root_matrices.push(root_matrix);
        self.matrix_stack.push(Mat4::IDENTITY);

        self.visit_children(sid);

        self.current_clip = clip_before;
        self.matrix_stack.pop();
        self.root_matrices.pop();
        self.roots.pop();
    }

    fn visit_opacity_node(&mut self, sid: ShadowId) {
        let node = self.r.shadow[sid].node;
        let own = self.scene.opacity(node).unwrap_or(1.0);
        let combined = self.opacity() * own;
        self.r.shadow[sid].combined_opacity = combined;
        self.opacity_stack.push(combined);

        if self.added == 0 && self.r.shadow[sid].dirty.contains(DirtyState::OPACITY) {
            let was = self.r.shadow[sid].is_opaque;
            let is = own > OPAQUE_LIMIT;
            if was != is {
                self.r.rebuild |= Rebuild::FULL;
                self.r.shadow[sid].is_opaque = is;
            } else if !is {
                // Fading within the translucent range reorders nothing, but
                // alpha batches under this root hold stale opacities.
                let root = self.current_root();
                self.r.invalidate_alpha_batches_for_root(root);
                self.r.rebuild |= Rebuild::BUILD_BATCHES;
            }
            self.force_update += 1;
            self.visit_children(sid);
            self.force_update -= 1;
        } else {
            if self.added > 0 {
                self.r.shadow[sid].is_opaque = own > OPAQUE_LIMIT;
            }
            self.visit_children(sid);
        }

        self.opacity_stack.pop();
    }

    fn visit_transform_node(&mut self, sid: ShadowId) {
        let mut pop_matrix = false;
        let mut pop_root = false;
        let dirty = self.r.shadow[sid].dirty.contains(DirtyState::MATRIX);
        let node = self.r.shadow[sid].node;
        let own = self.scene.matrix(node).copied().unwrap_or(Mat4::IDENTITY);

        if self.r.shadow[sid].is_batch_root {
            if self.added > 0 {
                if let Some(parent_root) = self.current_root() {
                    self.r.register_batch_root(sid, parent_root);
                }
            }
            let combined = self.root_matrix() * self.rel_matrix() * own;
            self.r.batch_root_info_mut(sid).matrix = combined;

            // The only change here is this root's own matrix, so refreshing
            // the nested root matrices covers the whole subtree.
            if !self.r.shadow[sid].became_batch_root
                && self.added == 0
                && self.force_update == 0
                && dirty
                && self.r.shadow[sid].dirty == DirtyState::MATRIX
                && self.r.shadow[sid].descendant_dirty.is_empty()
            {
                let subs: Vec<ShadowId> = self
                    .r
                    .batch_root_info_mut(sid)
                    .sub_roots
                    .iter()
                    .copied()
                    .collect();
                for sub in subs {
                    self.update_root_transforms(sub, sid, combined);
                }
                return;
            }

            self.r.shadow[sid].became_batch_root = false;

            self.matrix_stack.push(Mat4::IDENTITY);
            self.roots.push(Some(sid));
            self.root_matrices.push(combined);
            pop_matrix = true;
            pop_root = true;
        } else if own.kind() != crate::transform::MatrixKind::Identity {
            let combined = self.rel_matrix() * own;
            self.matrix_stack.push(combined);
            pop_matrix = true;
        }

        if dirty {
            self.transform_change += 1;
        }

        self.visit_children(sid);

        if dirty {
            self.transform_change -= 1;
        }
        if pop_matrix {
            self.matrix_stack.pop();
        }
        if pop_root {
            self.roots.pop();
            self.root_matrices.pop();
        }
    }

    fn visit_geometry_node(&mut self, sid: ShadowId) {
        let Some(eid) = self.r.shadow[sid].element else {
            return;
        };
        let rel = self.rel_matrix();
        self.r.elements[eid].rel_matrix = rel;
        self.r.elements[eid].clip = self.current_clip;
        self.r.elements[eid].inherited_opacity = self.opacity();

        if self.added > 0 {
            let root = self.current_root();
            self.r.elements[eid].root = root;
            self.r.elements[eid].translate_only_to_root = rel.is_translate();

            match root {
                Some(r) => {
                    // The new element consumes a slot in every enclosing
                    // root's order window, not just the innermost one.
                    let mut cursor = Some(r);
                    while let Some(c) = cursor {
                        let info = self.r.batch_root_info_mut(c);
                        info.available_orders -= 1;
                        let overflowed = info.available_orders < 0;
                        cursor = info.parent_root;
                        if overflowed {
                            self.r.rebuild |= Rebuild::BUILD_RENDER_LISTS;
                        } else {
                            self.r.rebuild |= Rebuild::BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS;
                            self.r.tagged_roots.insert(r);
                        }
                    }
                }
                None => self.r.rebuild |= Rebuild::FULL,
            }
        } else if self.transform_change > 0 {
            self.r.elements[eid].translate_only_to_root = rel.is_translate();
        }

        self.visit_children(sid);
    }

    /// Recomputes the model-view matrices of the roots nested under
    /// `stop_root` by walking live transform matrices back up to it.
    fn update_root_transforms(&mut self, sid: ShadowId, stop_root: ShadowId, combined: Mat4) {
        let mut m = Mat4::IDENTITY;
        let mut cursor = Some(sid);
        while let Some(n) = cursor {
            if n == stop_root {
                break;
            }
            if self.r.shadow[n].kind == ShadowKind::Transform {
                let node = self.r.shadow[n].node;
                if let Some(own) = self.scene.matrix(node) {
                    m = *own * m;
                }
            }
            cursor = self.r.shadow[n].parent;
        }
        let m = combined * m;
        self.r.batch_root_info_mut(sid).matrix = m;

        let subs: Vec<ShadowId> = self
            .r
            .batch_root_info_mut(sid)
            .sub_roots
            .iter()
            .copied()
            .collect();
        for sub in subs {
            self.update_root_transforms(sub, sid, m);
        }
    }
}
