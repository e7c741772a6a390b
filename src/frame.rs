//! The output of [`Renderer::prepare`](crate::Renderer::prepare): a flat,
//! ordered description of everything the GPU has to draw.
//!
//! A frame borrows nothing; batch ids inside it refer back into the renderer
//! that produced it, so [`GpuContext::render`](crate::GpuContext) takes the
//! frame together with its renderer and scene.

use smallvec::SmallVec;

use crate::batch::DrawSet;
use crate::geometry::DrawingMode;
use crate::scene::NodeId;
use crate::shadow::BatchId;
use crate::transform::Mat4;

/// A stencil clip to apply around a batch, outermost first.
#[derive(Clone, Debug)]
pub struct ClipDraw {
    /// The clip node whose geometry masks the batch.
    pub node: NodeId,
    /// Transform from the clip's batch root to the scene root.
    pub matrix: Mat4,
}

/// One element of an unmerged batch, drawn with its own model matrix and
/// depth value.
#[derive(Clone, Debug)]
pub struct ElementDraw {
    pub node: NodeId,
    /// Transform from the node to the scene root.
    pub model_view: Mat4,
    /// Depth written for every vertex of the element.
    pub z: f32,
    /// Byte offset of the element's vertices in the batch buffer.
    pub vertex_offset: usize,
    /// Byte offset of the element's indices, when it draws indexed.
    pub index_offset: Option<usize>,
    pub index_format: wgpu::IndexFormat,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// A callback node's slot in the alpha pass.
#[derive(Clone, Debug)]
pub struct CallbackDraw {
    pub node: NodeId,
    /// Transform from the node to the scene root.
    pub matrix: Mat4,
    pub opacity: f32,
    /// Depth of the callback's slot in the painter's order.
    pub z: f32,
}

#[derive(Clone, Debug)]
pub enum BatchDrawKind {
    /// All elements packed into one vertex stream with baked positions and
    /// per-vertex depth, drawn in one `draw_indexed` per [`DrawSet`].
    Merged {
        sets: SmallVec<[DrawSet; 1]>,
        /// Transform from the batch root to the scene root.
        model_view: Mat4,
        stride: usize,
    },
    /// Elements drawn one by one from shared storage.
    Unmerged { elements: Vec<ElementDraw> },
    /// A single callback node.
    Callback(CallbackDraw),
}

/// One batch in frame order.
#[derive(Clone, Debug)]
pub struct BatchDraw {
    /// Arena id of the batch; the GPU context uses it to reach the batch's
    /// staged buffer inside the renderer.
    pub(crate) batch: BatchId,
    /// Node of the batch's first element, for pipeline lookup and debugging.
    pub first_node: NodeId,
    pub opaque: bool,
    pub mode: DrawingMode,
    /// Opacity shared by every element of the batch.
    pub opacity: f32,
    /// Clip stack around the batch, outermost first.
    pub clips: Vec<ClipDraw>,
    pub kind: BatchDrawKind,
}

/// Draw description for one frame.
pub struct Frame {
    /// Orthographic projection for the current viewport, y-down.
    pub projection: Mat4,
    /// Depth spacing between consecutive render orders.
    pub z_range: f32,
    pub viewport: (u32, u32),
    pub(crate) opaque: Vec<BatchDraw>,
    pub(crate) alpha: Vec<BatchDraw>,
}

impl Frame {
    pub(crate) fn empty(projection: Mat4, viewport: (u32, u32)) -> Self {
        Self {
            projection,
            z_range: 0.0,
            viewport,
            opaque: Vec::new(),
            alpha: Vec::new(),
        }
    }

    /// Batches of the front-to-back opaque pass.
    pub fn opaque_batches(&self) -> &[BatchDraw] {
        &self.opaque
    }

    /// Batches of the back-to-front alpha pass.
    pub fn alpha_batches(&self) -> &[BatchDraw] {
        &self.alpha
    }

    pub fn is_empty(&self) -> bool {
        self.opaque.is_empty() && self.alpha.is_empty()
    }
}
