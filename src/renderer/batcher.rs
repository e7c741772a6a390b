//! Packing render lists into batches.
//!
//! Opaque elements are scanned front to back and grouped greedily; the
//! depth buffer makes their relative order within a batch irrelevant. Alpha
//! elements are scanned back to front and may only jump over elements whose
//! bounds they do not overlap, since reordering overlapping translucent
//! geometry changes the image.

use super::*;

use crate::bounds::Rect;
use crate::material::materials_match;

/// Whether two elements can share a draw call: same clip, topology, vertex
/// layout, inherited opacity and material state.
fn elements_compatible(
    scene: &Scene,
    elements: &Arena<Element>,
    a: ElementId,
    b: ElementId,
) -> bool {
    let ea = &elements[a];
    let eb = &elements[b];
    if ea.clip != eb.clip || ea.inherited_opacity != eb.inherited_opacity {
        return false;
    }
    let (Some(ga), Some(gb)) = (scene.geometry(ea.node), scene.geometry(eb.node)) else {
        return false;
    };
    if ga.mode() != gb.mode() || ga.layout() != gb.layout() {
        return false;
    }
    let (Some(ma), Some(mb)) = (scene.material(ea.node), scene.material(eb.node)) else {
        return false;
    };
    materials_match(ma, mb)
}

impl Renderer {
    pub(super) fn prepare_opaque_batches(&mut self, scene: &Scene) {
        let mut i = self.opaque_render_list.len() as isize - 1;
        while i >= 0 {
            let slot = self.opaque_render_list[i as usize];
            let Some(ei) = slot else {
                i -= 1;
                continue;
            };
            if self.elements[ei].batch.is_some() {
                i -= 1;
                continue;
            }

            let bid = self.new_batch();
            let root = self.elements[ei].root;
            let node = self.elements[ei].node;
            {
                let b = &mut self.batches[bid];
                b.first = Some(ei);
                b.root = root;
                b.is_opaque = true;
                b.needs_upload = true;
            }
            self.batches[bid].position_offset = scene
                .geometry(node)
                .and_then(|g| g.layout().position_offset());
            self.opaque_batches.push(bid);
            self.elements[ei].batch = Some(bid);

            let mut tail = ei;
            for j in (0..i as usize).rev() {
                let Some(ej) = self.opaque_render_list[j] else {
                    continue;
                };
                if self.elements[ej].root != root {
                    break;
                }
                if self.elements[ej].batch.is_some() {
                    continue;
                }
                if elements_compatible(scene, &self.elements, ei, ej) {
                    self.elements[ej].batch = Some(bid);
                    self.elements[tail].next_in_batch = Some(ej);
                    tail = ej;
                }
            }

            i -= 1;
        }
    }

    /// True when any unbatched element in `[first, last]` of the alpha list
    /// overlaps `bounds`.
    fn check_overlap(&self, first: usize, last: usize, bounds: &Rect) -> bool {
        for k in first..=last {
            let Some(e) = self.alpha_render_list[k] else {
                continue;
            };
            if self.elements[e].batch.is_some() {
                continue;
            }
            debug_assert!(self.elements[e].bounds_computed);
            if self.elements[e].bounds.intersects(bounds) {
                return true;
            }
        }
        false
    }

    pub(super) fn prepare_alpha_batches(&mut self, scene: &Scene) {
        for i in 0..self.alpha_render_list.len() {
            let Some(e) = self.alpha_render_list[i] else {
                continue;
            };
            if self.elements[e].is_render_node {
                continue;
            }
            debug_assert!(!self.elements[e].removed);
            if !self.elements[e].bounds_computed {
                self.compute_bounds(scene, e);
            }
        }

        for i in 0..self.alpha_render_list.len() {
            let Some(ei) = self.alpha_render_list[i] else {
                continue;
            };
            if self.elements[ei].batch.is_some() {
                continue;
            }

            if self.elements[ei].is_render_node {
                let bid = self.new_batch();
                let b = &mut self.batches[bid];
                b.first = Some(ei);
                b.root = self.elements[ei].root;
                b.is_opaque = false;
                b.is_render_node = true;
                self.elements[ei].batch = Some(bid);
                self.alpha_batches.push(bid);
                continue;
            }

            let bid = self.new_batch();
            let root = self.elements[ei].root;
            let node = self.elements[ei].node;
            {
                let b = &mut self.batches[bid];
                b.first = Some(ei);
                b.root = root;
                b.is_opaque = false;
                b.needs_upload = true;
            }
            self.batches[bid].position_offset = scene
                .geometry(node)
                .and_then(|g| g.layout().position_offset());
            self.alpha_batches.push(bid);
            self.elements[ei].batch = Some(bid);

            // Union of the bounds of all skipped-over incompatible
            // elements. As long as a candidate misses this union it cannot
            // overlap any of them individually.
            let mut overlap_bounds = Rect::default();
            let mut tail = ei;

            for j in i + 1..self.alpha_render_list.len() {
                let Some(ej) = self.alpha_render_list[j] else {
                    continue;
                };
                if self.elements[ej].root != root || self.elements[ej].is_render_node {
                    break;
                }
                if self.elements[ej].batch.is_some() {
                    continue;
                }

                if elements_compatible(scene, &self.elements, ei, ej) {
                    let ej_bounds = self.elements[ej].bounds;
                    if !overlap_bounds.intersects(&ej_bounds)
                        || !self.check_overlap(i + 1, j - 1, &ej_bounds)
                    {
                        self.elements[ej].batch = Some(bid);
                        self.elements[tail].next_in_batch = Some(ej);
                        tail = ej;
                    } else {
                        // A compatible element that overlaps something in
                        // between has to draw above it, so the batch stops
                        // here.
                        break;
                    }
                } else {
                    let b = self.elements[ej].bounds;
                    overlap_bounds.include_rect(&b);
                }
            }
        }
    }

    /// Computes an element's bounds in batch-root space. Geometry without a
    /// readable position attribute gets infinite bounds and so overlaps
    /// everything.
    fn compute_bounds(&mut self, scene: &Scene, eid: ElementId) {
        debug_assert!(!self.elements[eid].bounds_computed);
        self.elements[eid].bounds_computed = true;

        let node = self.elements[eid].node;
        let infinite = Rect::from_coords(-f32::MAX, -f32::MAX, f32::MAX, f32::MAX);

        let bounds = match scene.geometry(node) {
            Some(g) if g.layout().position_offset().is_some() && g.vertex_count() > 0 => {
                let mut r = Rect::default();
                for i in 0..g.vertex_count() {
                    if let Some(p) = g.position_at(i) {
                        r.include_point(p);
                    }
                }
                let mut r = r.transformed(&self.elements[eid].rel_matrix);
                // Non-finite coordinates snap to the infinite rect, which
                // keeps the invariant tl <= br.
                if !r.tl.x.is_finite() || r.tl.x == f32::MAX {
                    r.tl.x = -f32::MAX;
                }
                if !r.tl.y.is_finite() || r.tl.y == f32::MAX {
                    r.tl.y = -f32::MAX;
                }
                if !r.br.x.is_finite() || r.br.x == -f32::MAX {
                    r.br.x = f32::MAX;
                }
                if !r.br.y.is_finite() || r.br.y == -f32::MAX {
                    r.br.y = f32::MAX;
                }
                r
            }
            _ => infinite,
        };

        let e = &mut self.elements[eid];
        e.bounds = bounds;
        e.bounds_outside_float_range = bounds.is_outside_safe_range();
    }
}
