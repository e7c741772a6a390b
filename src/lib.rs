//! Strata is a retained-mode scene-graph renderer for [`wgpu`].
//!
//! Applications build a [`Scene`] out of transform, clip, opacity, geometry and
//! callback nodes, notify the [`Renderer`] about changes through
//! [`Renderer::node_changed`], and call [`Renderer::prepare`] once per frame.
//! The renderer maintains a shadow copy of the tree, assigns render orders,
//! packs compatible geometry nodes into merged GPU batches and produces a
//! [`Frame`] describing the draw calls for that frame. A [`GpuContext`]
//! executes frames against a surface or a headless texture.
//!
//! Batching happens on the CPU and is completely independent of any GPU
//! resources, so its behavior is observable and testable through
//! [`Renderer::opaque_batch_summaries`] and friends without ever creating a
//! device.

pub use wgpu;

mod batch;
mod bounds;
mod color;
mod frame;
mod geometry;
mod gpu;
mod material;
mod pipeline;
mod renderer;
mod scene;
mod shadow;
mod transform;

pub use bounds::Rect;
pub use color::Color;
pub use renderer::debug_tools::BatchSummary;
pub use frame::{BatchDraw, BatchDrawKind, CallbackDraw, ClipDraw, ElementDraw, Frame};
pub use geometry::{DrawingMode, Geometry, IndexData, VertexAttribute, VertexLayout};
pub use gpu::{GpuContext, GpuContextError};
pub use material::{
    CallbackState, FlatColorMaterial, Material, MaterialFlags, RenderCallback, ShaderDescriptor,
};
pub use renderer::{BufferStrategy, Renderer, RendererConfig};
pub use scene::{DirtyState, NodeId, NodeKind, Scene};
pub use transform::{Mat4, MatrixKind};
