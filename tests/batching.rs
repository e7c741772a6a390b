//! End-to-end tests of the CPU batching pipeline, asserted through batch
//! summaries so no GPU device is needed.

use strata::{
    wgpu, CallbackState, Color, DirtyState, DrawingMode, FlatColorMaterial, Geometry, IndexData,
    Mat4, NodeId, NodeKind, RenderCallback, Renderer, RendererConfig, Scene, VertexAttribute,
    VertexLayout,
};

fn quad(color: Color, left: f32, top: f32, right: f32, bottom: f32) -> NodeKind {
    NodeKind::Geometry {
        geometry: Geometry::quad(left, top, right, bottom),
        material: Box::new(FlatColorMaterial::new(color)),
    }
}

fn setup() -> (Scene, Renderer, NodeId) {
    setup_with(RendererConfig::default())
}

fn setup_with(config: RendererConfig) -> (Scene, Renderer, NodeId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut scene = Scene::new();
    let mut renderer = Renderer::new(config);
    renderer.set_viewport_size((800, 600));
    let root = scene.set_root(NodeKind::Group);
    renderer.node_changed(&scene, root, DirtyState::NODE_ADDED);
    (scene, renderer, root)
}

fn add(scene: &mut Scene, renderer: &mut Renderer, parent: NodeId, kind: NodeKind) -> NodeId {
    let id = scene.add_child(parent, kind);
    renderer.node_changed(scene, id, DirtyState::NODE_ADDED);
    id
}

fn remove(scene: &mut Scene, renderer: &mut Renderer, id: NodeId) {
    renderer.node_changed(scene, id, DirtyState::NODE_REMOVED);
    scene.remove(id);
}

#[derive(Debug)]
struct NoopCallback;

impl RenderCallback for NoopCallback {
    fn render(
        &mut self,
        _device: &wgpu::Device,
        _queue: &wgpu::Queue,
        _pass: &mut wgpu::RenderPass<'_>,
        _state: &CallbackState,
    ) {
    }
}

const RED: Color = Color([255, 0, 0, 255]);
const BLUE: Color = Color([0, 0, 255, 255]);
const RED_GLASS: Color = Color([255, 0, 0, 128]);
const BLUE_GLASS: Color = Color([0, 0, 255, 128]);

#[test]
fn compatible_opaque_quads_share_one_merged_batch() {
    let (mut scene, mut renderer, root) = setup();
    let a = add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 10.0, 10.0));
    let b = add(&mut scene, &mut renderer, root, quad(RED, 20.0, 0.0, 30.0, 10.0));
    let c = add(&mut scene, &mut renderer, root, quad(RED, 40.0, 0.0, 50.0, 10.0));

    let frame = renderer.prepare(&scene);

    // The opaque pass batches front to back, so the chain starts at the
    // topmost element.
    let opaque = renderer.opaque_batch_summaries();
    assert_eq!(opaque.len(), 1);
    assert!(opaque[0].merged);
    assert_eq!(opaque[0].nodes, vec![c, b, a]);
    assert_eq!(opaque[0].vertex_count, 12);
    assert_eq!(opaque[0].index_count, 18);
    assert!(renderer.alpha_batch_summaries().is_empty());
    assert_eq!(frame.opaque_batches().len(), 1);
    assert!(frame.alpha_batches().is_empty());
}

#[test]
fn render_orders_follow_sibling_order() {
    let (mut scene, mut renderer, root) = setup();
    let a = add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    let b = add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    let c = add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    renderer.prepare(&scene);

    assert_eq!(renderer.order_of(a), Some(1));
    assert_eq!(renderer.order_of(b), Some(2));
    assert_eq!(renderer.order_of(c), Some(3));
}

#[test]
fn material_state_splits_batches() {
    let (mut scene, mut renderer, root) = setup();
    add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    add(&mut scene, &mut renderer, root, quad(BLUE, 2.0, 0.0, 3.0, 1.0));
    renderer.prepare(&scene);

    assert_eq!(renderer.opaque_batch_summaries().len(), 2);
}

#[test]
fn mixed_topologies_split_batches() {
    let (mut scene, mut renderer, root) = setup();
    let tris: [[f32; 2]; 3] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let strip: [[f32; 2]; 4] = [[2.0, 0.0], [3.0, 0.0], [2.0, 1.0], [3.0, 1.0]];
    for (mode, vertices) in [
        (DrawingMode::Triangles, &tris[..]),
        (DrawingMode::TriangleStrip, &strip[..]),
    ] {
        add(
            &mut scene,
            &mut renderer,
            root,
            NodeKind::Geometry {
                geometry: Geometry::from_vertices(
                    VertexLayout::position_only(),
                    mode,
                    vertices,
                    IndexData::None,
                ),
                material: Box::new(FlatColorMaterial::new(RED)),
            },
        );
    }
    renderer.prepare(&scene);

    assert_eq!(renderer.opaque_batch_summaries().len(), 2);
}

#[test]
fn mixed_vertex_layouts_split_batches() {
    let (mut scene, mut renderer, root) = setup();
    let fat_layout = VertexLayout::new([
        VertexAttribute::position(),
        VertexAttribute::new(wgpu::VertexFormat::Float32x4),
    ]);
    let fat: [[f32; 6]; 3] = [
        [0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0, 0.0, 0.0, 1.0],
        [0.0, 1.0, 1.0, 0.0, 0.0, 1.0],
    ];
    add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Geometry {
            geometry: Geometry::from_vertices(
                fat_layout,
                DrawingMode::Triangles,
                &fat,
                IndexData::None,
            ),
            material: Box::new(FlatColorMaterial::new(RED)),
        },
    );
    add(&mut scene, &mut renderer, root, quad(RED, 2.0, 0.0, 3.0, 1.0));
    renderer.prepare(&scene);

    assert_eq!(renderer.opaque_batch_summaries().len(), 2);
}

#[test]
fn differing_inherited_opacities_split_batches() {
    let (mut scene, mut renderer, root) = setup();
    let half = add(&mut scene, &mut renderer, root, NodeKind::Opacity { opacity: 0.5 });
    let a = add(&mut scene, &mut renderer, half, quad(RED, 0.0, 0.0, 10.0, 10.0));
    let b = add(&mut scene, &mut renderer, half, quad(RED, 20.0, 0.0, 30.0, 10.0));
    let quarter = add(&mut scene, &mut renderer, root, NodeKind::Opacity { opacity: 0.25 });
    let c = add(&mut scene, &mut renderer, quarter, quad(RED, 40.0, 0.0, 50.0, 10.0));
    renderer.prepare(&scene);

    // Same material throughout; only the inherited opacity differs.
    let alpha = renderer.alpha_batch_summaries();
    assert_eq!(alpha.len(), 2);
    assert_eq!(alpha[0].nodes, vec![a, b]);
    assert_eq!(alpha[1].nodes, vec![c]);
}

#[test]
fn elements_under_different_clips_get_separate_batches() {
    let (mut scene, mut renderer, root) = setup();
    let left = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Clip {
            geometry: Geometry::quad(0.0, 0.0, 50.0, 50.0),
        },
    );
    let a = add(&mut scene, &mut renderer, left, quad(RED, 0.0, 0.0, 10.0, 10.0));
    let right = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Clip {
            geometry: Geometry::quad(50.0, 0.0, 100.0, 50.0),
        },
    );
    let b = add(&mut scene, &mut renderer, right, quad(RED, 60.0, 0.0, 70.0, 10.0));
    renderer.prepare(&scene);

    let opaque = renderer.opaque_batch_summaries();
    assert_eq!(opaque.len(), 2);
    let batch_a = opaque.iter().find(|s| s.nodes == vec![a]).unwrap();
    let batch_b = opaque.iter().find(|s| s.nodes == vec![b]).unwrap();
    assert_eq!(batch_a.root, Some(left));
    assert_eq!(batch_b.root, Some(right));
}

#[test]
fn translucent_material_goes_to_the_alpha_pass() {
    let (mut scene, mut renderer, root) = setup();
    add(&mut scene, &mut renderer, root, quad(RED_GLASS, 0.0, 0.0, 1.0, 1.0));
    renderer.prepare(&scene);

    assert!(renderer.opaque_batch_summaries().is_empty());
    assert_eq!(renderer.alpha_batch_summaries().len(), 1);
}

#[test]
fn material_blending_change_moves_elements_between_passes() {
    let (mut scene, mut renderer, root) = setup();
    let a = add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    renderer.prepare(&scene);
    assert_eq!(renderer.opaque_batch_summaries().len(), 1);
    assert!(renderer.alpha_batch_summaries().is_empty());

    scene.set_material(a, Box::new(FlatColorMaterial::new(RED_GLASS)));
    renderer.node_changed(&scene, a, DirtyState::MATERIAL);
    renderer.prepare(&scene);

    assert!(renderer.opaque_batch_summaries().is_empty());
    assert_eq!(renderer.alpha_batch_summaries().len(), 1);

    scene.set_material(a, Box::new(FlatColorMaterial::new(BLUE)));
    renderer.node_changed(&scene, a, DirtyState::MATERIAL);
    renderer.prepare(&scene);

    assert_eq!(renderer.opaque_batch_summaries().len(), 1);
    assert!(renderer.alpha_batch_summaries().is_empty());
}

#[test]
fn callback_nodes_added_after_the_first_frame_enter_the_alpha_pass() {
    let (mut scene, mut renderer, root) = setup();
    add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    renderer.prepare(&scene);
    assert!(renderer.alpha_batch_summaries().is_empty());

    let cb = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Callback {
            callback: Box::new(NoopCallback),
        },
    );
    renderer.prepare(&scene);

    let alpha = renderer.alpha_batch_summaries();
    assert_eq!(alpha.len(), 1);
    assert!(alpha[0].render_node);
    assert_eq!(alpha[0].nodes, vec![cb]);
}

#[test]
fn alpha_elements_jump_over_disjoint_incompatible_elements() {
    let (mut scene, mut renderer, root) = setup();
    let a = add(&mut scene, &mut renderer, root, quad(RED_GLASS, 0.0, 0.0, 10.0, 10.0));
    let b = add(&mut scene, &mut renderer, root, quad(BLUE_GLASS, 5.0, 5.0, 15.0, 15.0));
    let c = add(&mut scene, &mut renderer, root, quad(RED_GLASS, 20.0, 20.0, 30.0, 30.0));
    renderer.prepare(&scene);

    // c misses b entirely, so it can batch with a without changing the image.
    let alpha = renderer.alpha_batch_summaries();
    assert_eq!(alpha.len(), 2);
    assert_eq!(alpha[0].nodes, vec![a, c]);
    assert_eq!(alpha[1].nodes, vec![b]);
}

#[test]
fn alpha_elements_stop_at_overlapping_intermediates() {
    let (mut scene, mut renderer, root) = setup();
    let a = add(&mut scene, &mut renderer, root, quad(RED_GLASS, 0.0, 0.0, 10.0, 10.0));
    let b = add(&mut scene, &mut renderer, root, quad(BLUE_GLASS, 5.0, 5.0, 15.0, 15.0));
    let c = add(&mut scene, &mut renderer, root, quad(RED_GLASS, 12.0, 12.0, 22.0, 22.0));
    renderer.prepare(&scene);

    // c overlaps b, which draws between a and c, so pulling c down into a's
    // batch would reorder blending.
    let alpha = renderer.alpha_batch_summaries();
    assert_eq!(alpha.len(), 3);
    assert_eq!(alpha[0].nodes, vec![a]);
    assert_eq!(alpha[1].nodes, vec![b]);
    assert_eq!(alpha[2].nodes, vec![c]);
}

#[test]
fn preparing_twice_without_changes_is_stable() {
    let (mut scene, mut renderer, root) = setup();
    add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    add(&mut scene, &mut renderer, root, quad(RED_GLASS, 0.0, 20.0, 1.0, 21.0));
    renderer.prepare(&scene);
    let opaque_before = renderer.opaque_batch_summaries();
    let alpha_before = renderer.alpha_batch_summaries();

    renderer.prepare(&scene);
    let opaque_after = renderer.opaque_batch_summaries();
    let alpha_after = renderer.alpha_batch_summaries();

    assert_eq!(opaque_before.len(), opaque_after.len());
    assert_eq!(opaque_before[0].nodes, opaque_after[0].nodes);
    assert_eq!(alpha_before[0].nodes, alpha_after[0].nodes);
}

#[test]
fn removing_and_readding_nodes_round_trips() {
    let (mut scene, mut renderer, root) = setup();
    let _a = add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    let b = add(&mut scene, &mut renderer, root, quad(RED, 2.0, 0.0, 3.0, 1.0));
    let _c = add(&mut scene, &mut renderer, root, quad(RED, 4.0, 0.0, 5.0, 1.0));
    renderer.prepare(&scene);
    assert_eq!(renderer.opaque_batch_summaries()[0].nodes.len(), 3);

    remove(&mut scene, &mut renderer, b);
    renderer.prepare(&scene);
    assert_eq!(renderer.opaque_batch_summaries()[0].nodes.len(), 2);
    assert_eq!(renderer.element_count(), 2);

    add(&mut scene, &mut renderer, root, quad(RED, 6.0, 0.0, 7.0, 1.0));
    renderer.prepare(&scene);
    assert_eq!(renderer.opaque_batch_summaries()[0].nodes.len(), 3);
    assert_eq!(renderer.element_count(), 3);
}

#[test]
fn opacity_nodes_move_subtrees_between_passes() {
    let (mut scene, mut renderer, root) = setup();
    let fade = add(&mut scene, &mut renderer, root, NodeKind::Opacity { opacity: 0.5 });
    add(&mut scene, &mut renderer, fade, quad(RED, 0.0, 0.0, 1.0, 1.0));
    renderer.prepare(&scene);

    assert!(renderer.opaque_batch_summaries().is_empty());
    assert_eq!(renderer.alpha_batch_summaries().len(), 1);

    scene.set_opacity(fade, 1.0);
    renderer.node_changed(&scene, fade, DirtyState::OPACITY);
    renderer.prepare(&scene);

    assert_eq!(renderer.opaque_batch_summaries().len(), 1);
    assert!(renderer.alpha_batch_summaries().is_empty());
}

#[test]
fn clip_nodes_anchor_their_own_batches() {
    let (mut scene, mut renderer, root) = setup();
    let outside = add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    let clip = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Clip {
            geometry: Geometry::quad(0.0, 0.0, 100.0, 100.0),
        },
    );
    let inside = add(&mut scene, &mut renderer, clip, quad(RED, 2.0, 0.0, 3.0, 1.0));
    let frame = renderer.prepare(&scene);

    let opaque = renderer.opaque_batch_summaries();
    assert_eq!(opaque.len(), 2);
    let inner = opaque.iter().find(|b| b.nodes == vec![inside]).unwrap();
    let outer = opaque.iter().find(|b| b.nodes == vec![outside]).unwrap();
    assert_eq!(inner.root, Some(clip));
    assert_eq!(outer.root, None);

    let inner_draw = frame
        .opaque_batches()
        .iter()
        .find(|d| d.first_node == inside)
        .unwrap();
    assert_eq!(inner_draw.clips.len(), 1);
    assert_eq!(inner_draw.clips[0].node, clip);
}

#[test]
fn busy_transform_nodes_get_promoted_to_batch_roots() {
    let config = RendererConfig {
        batch_node_threshold: 2,
        ..RendererConfig::default()
    };
    let (mut scene, mut renderer, root) = setup_with(config);
    let mover = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Transform {
            matrix: Mat4::IDENTITY,
        },
    );
    for i in 0..3 {
        let x = i as f32 * 5.0;
        add(&mut scene, &mut renderer, mover, quad(RED, x, 0.0, x + 1.0, 1.0));
    }
    renderer.prepare(&scene);
    assert_eq!(renderer.opaque_batch_summaries()[0].root, None);

    scene.set_matrix(mover, Mat4::translation(10.0, 0.0));
    renderer.node_changed(&scene, mover, DirtyState::MATRIX);
    renderer.prepare(&scene);

    assert_eq!(renderer.opaque_batch_summaries()[0].root, Some(mover));
}

#[test]
fn sibling_dirt_leaves_promoted_root_batches_alone() {
    let config = RendererConfig {
        batch_node_threshold: 2,
        ..RendererConfig::default()
    };
    let (mut scene, mut renderer, root) = setup_with(config);
    let mover = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Transform {
            matrix: Mat4::IDENTITY,
        },
    );
    let mut moved = Vec::new();
    for i in 0..3 {
        let x = i as f32 * 5.0;
        moved.push(add(&mut scene, &mut renderer, mover, quad(RED, x, 0.0, x + 1.0, 1.0)));
    }
    let clip = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Clip {
            geometry: Geometry::quad(50.0, 0.0, 100.0, 50.0),
        },
    );
    for i in 0..4 {
        let x = 50.0 + i as f32 * 5.0;
        add(&mut scene, &mut renderer, clip, quad(RED, x, 0.0, x + 1.0, 1.0));
    }
    renderer.prepare(&scene);

    scene.set_matrix(mover, Mat4::translation(10.0, 0.0));
    renderer.node_changed(&scene, mover, DirtyState::MATRIX);
    renderer.prepare(&scene);

    let before: Vec<_> = renderer
        .opaque_batch_summaries()
        .into_iter()
        .filter(|s| s.root == Some(mover))
        .collect();
    assert_eq!(before.len(), 1);
    let orders_before: Vec<_> = moved.iter().map(|&n| renderer.order_of(n)).collect();

    // An addition under the sibling clip rebuilds only that clip's window.
    add(&mut scene, &mut renderer, clip, quad(RED, 90.0, 0.0, 91.0, 1.0));
    renderer.prepare(&scene);

    let after: Vec<_> = renderer
        .opaque_batch_summaries()
        .into_iter()
        .filter(|s| s.root == Some(mover))
        .collect();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].nodes, before[0].nodes);
    let orders_after: Vec<_> = moved.iter().map(|&n| renderer.order_of(n)).collect();
    assert_eq!(orders_after, orders_before);
}

#[test]
fn additions_under_a_batch_root_leave_outside_orders_alone() {
    let (mut scene, mut renderer, root) = setup();
    let clip = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Clip {
            geometry: Geometry::quad(0.0, 0.0, 100.0, 100.0),
        },
    );
    for i in 0..8 {
        let x = i as f32 * 5.0;
        add(&mut scene, &mut renderer, clip, quad(RED, x, 0.0, x + 1.0, 1.0));
    }
    let outside = add(&mut scene, &mut renderer, root, quad(BLUE, 0.0, 50.0, 1.0, 51.0));
    renderer.prepare(&scene);
    let outside_order = renderer.order_of(outside).unwrap();

    add(&mut scene, &mut renderer, clip, quad(RED, 90.0, 0.0, 91.0, 1.0));
    renderer.prepare(&scene);

    assert_eq!(renderer.order_of(outside), Some(outside_order));
}

#[test]
fn additions_inside_nested_roots_consume_every_enclosing_window() {
    let (mut scene, mut renderer, root) = setup();
    let outer = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Clip {
            geometry: Geometry::quad(0.0, 0.0, 100.0, 100.0),
        },
    );
    let inner = add(
        &mut scene,
        &mut renderer,
        outer,
        NodeKind::Clip {
            geometry: Geometry::quad(0.0, 0.0, 90.0, 90.0),
        },
    );
    for i in 0..8 {
        let x = i as f32 * 5.0;
        add(&mut scene, &mut renderer, inner, quad(RED, x, 0.0, x + 1.0, 1.0));
    }
    let outside = add(&mut scene, &mut renderer, root, quad(BLUE, 0.0, 95.0, 1.0, 96.0));
    renderer.prepare(&scene);

    // Two additions under the inner clip use up the slack of both windows.
    for i in 0..2 {
        let x = 40.0 + i as f32 * 5.0;
        add(&mut scene, &mut renderer, inner, quad(RED, x, 0.0, x + 1.0, 1.0));
    }
    renderer.prepare(&scene);

    // The outer window is full, so this add renumbers from scratch instead
    // of spilling into the orders reserved for later siblings.
    let straggler = add(&mut scene, &mut renderer, outer, quad(RED, 95.0, 0.0, 96.0, 1.0));
    renderer.prepare(&scene);

    let straggler_order = renderer.order_of(straggler).unwrap();
    let outside_order = renderer.order_of(outside).unwrap();
    assert!(straggler_order < outside_order);
}

#[test]
fn blocked_subtrees_drop_out_and_come_back() {
    let (mut scene, mut renderer, root) = setup();
    let group = add(&mut scene, &mut renderer, root, NodeKind::Group);
    add(&mut scene, &mut renderer, group, quad(RED, 0.0, 0.0, 1.0, 1.0));
    add(&mut scene, &mut renderer, root, quad(BLUE, 2.0, 0.0, 3.0, 1.0));
    renderer.prepare(&scene);
    assert_eq!(renderer.opaque_batch_summaries().len(), 2);

    scene.set_blocked(group, true);
    renderer.node_changed(&scene, group, DirtyState::SUBTREE_BLOCKED);
    renderer.prepare(&scene);
    assert_eq!(renderer.opaque_batch_summaries().len(), 1);

    scene.set_blocked(group, false);
    renderer.node_changed(&scene, group, DirtyState::SUBTREE_BLOCKED);
    renderer.prepare(&scene);
    assert_eq!(renderer.opaque_batch_summaries().len(), 2);
}

#[test]
fn non_triangle_topologies_stay_unmerged() {
    let (mut scene, mut renderer, root) = setup();
    let points: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
    let strip = Geometry::from_vertices(
        VertexLayout::position_only(),
        DrawingMode::LineStrip,
        &points,
        IndexData::None,
    );
    add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Geometry {
            geometry: strip,
            material: Box::new(FlatColorMaterial::new(RED)),
        },
    );
    renderer.prepare(&scene);

    let opaque = renderer.opaque_batch_summaries();
    assert_eq!(opaque.len(), 1);
    assert!(!opaque[0].merged);
}

#[test]
fn merged_batches_split_draw_sets_at_the_u16_limit() {
    let (mut scene, mut renderer, root) = setup();
    // Two elements of 39999 vertices each overflow the 16-bit index space
    // of a single draw set.
    let vertices: Vec<[f32; 2]> = (0..39999).map(|i| [i as f32, 0.0]).collect();
    for _ in 0..2 {
        let geometry = Geometry::from_vertices(
            VertexLayout::position_only(),
            DrawingMode::Triangles,
            &vertices,
            IndexData::None,
        );
        add(
            &mut scene,
            &mut renderer,
            root,
            NodeKind::Geometry {
                geometry,
                material: Box::new(FlatColorMaterial::new(RED)),
            },
        );
    }
    renderer.prepare(&scene);

    let opaque = renderer.opaque_batch_summaries();
    assert_eq!(opaque.len(), 1);
    assert!(opaque[0].merged);
    assert_eq!(opaque[0].draw_sets, 2);
    assert_eq!(opaque[0].vertex_count, 79998);
    assert_eq!(opaque[0].index_count, 79998);
}

#[test]
fn geometry_change_in_a_merged_batch_only_marks_for_upload() {
    let (mut scene, mut renderer, root) = setup();
    let a = add(&mut scene, &mut renderer, root, quad(RED, 0.0, 0.0, 1.0, 1.0));
    let b = add(&mut scene, &mut renderer, root, quad(RED, 2.0, 0.0, 3.0, 1.0));
    renderer.prepare(&scene);

    *scene.geometry_mut(a).unwrap() = Geometry::quad(0.0, 0.0, 5.0, 5.0);
    renderer.node_changed(&scene, a, DirtyState::GEOMETRY);
    renderer.prepare(&scene);

    let opaque = renderer.opaque_batch_summaries();
    assert_eq!(opaque.len(), 1);
    assert_eq!(opaque[0].nodes, vec![b, a]);
}

#[test]
fn nested_clips_stack_in_the_frame() {
    let (mut scene, mut renderer, root) = setup();
    let outer = add(
        &mut scene,
        &mut renderer,
        root,
        NodeKind::Clip {
            geometry: Geometry::quad(0.0, 0.0, 100.0, 100.0),
        },
    );
    let inner = add(
        &mut scene,
        &mut renderer,
        outer,
        NodeKind::Clip {
            geometry: Geometry::quad(10.0, 10.0, 90.0, 90.0),
        },
    );
    add(&mut scene, &mut renderer, inner, quad(RED, 20.0, 20.0, 30.0, 30.0));
    let frame = renderer.prepare(&scene);

    assert_eq!(frame.opaque_batches().len(), 1);
    let clips: Vec<NodeId> = frame.opaque_batches()[0]
        .clips
        .iter()
        .map(|c| c.node)
        .collect();
    assert_eq!(clips, vec![outer, inner]);
}
