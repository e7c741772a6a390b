//! Introspection into the renderer's batching decisions.
//!
//! Batching runs entirely on the CPU, so tests and tooling can assert on
//! batch composition through these summaries without creating a GPU device.

use super::*;

/// A read-only snapshot of one batch after [`Renderer::prepare`].
#[derive(Clone, Debug)]
pub struct BatchSummary {
    pub opaque: bool,
    /// Whether the last upload packed the elements into one vertex stream.
    pub merged: bool,
    /// Whether the batch wraps a single callback node.
    pub render_node: bool,
    pub draw_sets: usize,
    /// The batch root's scene node, if the batch sits under one.
    pub root: Option<NodeId>,
    /// Scene nodes of the batch's elements, in batch order.
    pub nodes: Vec<NodeId>,
    /// Totals of the packed buffer. Zero until the batch is first uploaded.
    pub vertex_count: u32,
    pub index_count: u32,
    /// Render order of the batch's first element.
    pub first_order: i32,
}

impl Renderer {
    fn summarize(&self, bid: BatchId) -> BatchSummary {
        let batch = &self.batches[bid];
        let mut nodes = Vec::new();
        let mut cursor = batch.first;
        while let Some(e) = cursor {
            if !self.elements[e].removed {
                nodes.push(self.elements[e].node);
            }
            cursor = self.elements[e].next_in_batch;
        }
        BatchSummary {
            opaque: batch.is_opaque,
            merged: batch.merged,
            render_node: batch.is_render_node,
            draw_sets: batch.draw_sets.len(),
            root: batch.root.map(|r| self.shadow[r].node),
            nodes,
            vertex_count: batch.vertex_count,
            index_count: batch.index_count,
            first_order: batch.first_order(&self.elements),
        }
    }

    /// Summaries of the opaque batches in front-to-back draw order.
    pub fn opaque_batch_summaries(&self) -> Vec<BatchSummary> {
        self.opaque_batches
            .iter()
            .map(|&b| self.summarize(b))
            .collect()
    }

    /// Summaries of the alpha batches in back-to-front draw order.
    pub fn alpha_batch_summaries(&self) -> Vec<BatchSummary> {
        self.alpha_batches
            .iter()
            .map(|&b| self.summarize(b))
            .collect()
    }

    /// The render order assigned to a renderable node in the last prepared
    /// frame.
    pub fn order_of(&self, node: NodeId) -> Option<i32> {
        let sid = self.node_to_shadow.get(&node)?;
        let eid = self.shadow[*sid].element?;
        Some(self.elements[eid].order)
    }

    /// Number of live elements tracked for the scene.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }
}
