//! Headless GPU smoke tests. Skipped when the machine has no adapter.

use futures::executor::block_on;
use strata::{Color, DirtyState, FlatColorMaterial, Geometry, GpuContext, NodeKind, Renderer, RendererConfig, Scene};

const SIZE: (u32, u32) = (64, 64);

fn headless() -> Option<GpuContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    let gpu = block_on(GpuContext::try_new_headless(SIZE));
    if gpu.is_none() {
        eprintln!("no gpu adapter available, skipping");
    }
    gpu
}

#[test]
fn clear_and_full_screen_quad() {
    let Some(mut gpu) = headless() else {
        return;
    };

    let mut scene = Scene::new();
    let mut renderer = Renderer::new(RendererConfig::default());
    renderer.set_viewport_size(SIZE);
    let root = scene.set_root(NodeKind::Group);
    renderer.node_changed(&scene, root, DirtyState::NODE_ADDED);
    let quad = scene.add_child(
        root,
        NodeKind::Geometry {
            geometry: Geometry::quad(0.0, 0.0, SIZE.0 as f32, SIZE.1 as f32),
            material: Box::new(FlatColorMaterial::new(Color::WHITE)),
        },
    );
    renderer.node_changed(&scene, quad, DirtyState::NODE_ADDED);

    let frame = renderer.prepare(&scene);
    let pixels = gpu.render_to_buffer(&mut scene, &mut renderer, &frame);

    assert_eq!(pixels.len(), (SIZE.0 * SIZE.1 * 4) as usize);
    let center = ((SIZE.1 / 2 * SIZE.0 + SIZE.0 / 2) * 4) as usize;
    assert_eq!(&pixels[center..center + 4], &[255, 255, 255, 255]);
}

#[test]
fn empty_scene_renders_the_clear_color() {
    let Some(mut gpu) = headless() else {
        return;
    };
    gpu.clear_color = wgpu::Color::BLACK;

    let mut scene = Scene::new();
    let mut renderer = Renderer::new(RendererConfig::default());
    renderer.set_viewport_size(SIZE);
    let root = scene.set_root(NodeKind::Group);
    renderer.node_changed(&scene, root, DirtyState::NODE_ADDED);

    let frame = renderer.prepare(&scene);
    let pixels = gpu.render_to_buffer(&mut scene, &mut renderer, &frame);

    assert_eq!(pixels.len(), (SIZE.0 * SIZE.1 * 4) as usize);
    assert!(pixels.chunks_exact(4).all(|p| p == [0, 0, 0, 255]));
}
