/// Squall tests
///
/// Everything here runs on the headless backend so the suite works
/// without a GPU.
use crate as sq;
use utils::geom::{Pose, Vec2};

/// Initialize our squall test
fn init_squall() -> sq::Compositor {
    let info = sq::CreateInfo::builder()
        .backend_type(sq::BackendType::Headless)
        .clear_color([0.1, 0.1, 0.1, 1.0])
        .build();

    sq::Compositor::new(&info).unwrap()
}

fn swapchain_info() -> sq::SwapchainCreateInfo {
    sq::SwapchainCreateInfo {
        width: 64,
        height: 64,
        format: sq::ImageFormat::Rgba8,
        array_size: 1,
    }
}

#[test]
fn idle_draw() {
    let mut comp = init_squall();

    // ------------ draw some empty frames -------------
    comp.draw().unwrap();
    comp.draw().unwrap();

    assert_eq!(comp.frames_drawn(), 2);
    assert_eq!(comp.num_layers(), 0);
}

#[test]
fn projection_layer() {
    let mut comp = init_squall();
    let left = comp.create_swapchain(&swapchain_info()).unwrap();
    let right = comp.create_swapchain(&swapchain_info()).unwrap();
    assert_eq!(left.num_images(), 2);

    // ------------ fill one stereo layer -------------
    comp.allocate_layers(1);
    comp.set_projection_layer(
        0,
        left.image(0).unwrap(),
        right.image(0).unwrap(),
        false,
        0,
        0,
    )
    .unwrap();

    comp.draw().unwrap();
    assert_eq!(comp.frames_drawn(), 1);
    assert!(matches!(
        comp.layers()[0],
        Some(sq::Layer::Projection { .. })
    ));
}

#[test]
fn quad_layer() {
    let mut comp = init_squall();
    let sc = comp.create_swapchain(&swapchain_info()).unwrap();

    comp.allocate_layers(1);
    comp.set_quad_layer(
        0,
        sc.image(1).unwrap(),
        Pose::identity(),
        Vec2::new(0.5, 0.5),
        true,
        0,
    )
    .unwrap();

    comp.draw().unwrap();
    assert!(matches!(comp.layers()[0], Some(sq::Layer::Quad { .. })));
}

#[test]
fn layer_index_out_of_bounds() {
    let mut comp = init_squall();
    let sc = comp.create_swapchain(&swapchain_info()).unwrap();

    comp.allocate_layers(1);
    let err = comp.set_quad_layer(
        3,
        sc.image(0).unwrap(),
        Pose::identity(),
        Vec2::new(1.0, 1.0),
        false,
        0,
    );
    assert_eq!(err, Err(sq::SquallError::INVALID_LAYER));
}

#[test]
fn destroyed_swapchain_fails_draw() {
    let mut comp = init_squall();
    let sc = comp.create_swapchain(&swapchain_info()).unwrap();
    let img = sc.image(0).unwrap();

    comp.allocate_layers(1);
    comp.set_quad_layer(0, img, Pose::identity(), Vec2::new(1.0, 1.0), false, 0)
        .unwrap();

    // Destroy the swapchain and let the collector run. The stale
    // layer must now fail the draw instead of sampling freed
    // memory.
    comp.destroy_swapchain(sc);
    comp.garbage_collect();

    assert_eq!(comp.draw(), Err(sq::SquallError::SWAPCHAIN_NOT_FOUND));

    // Rebuilding the stack recovers
    comp.destroy_layers();
    comp.draw().unwrap();
}

#[test]
fn reallocating_layers_clears_slots() {
    let mut comp = init_squall();
    let sc = comp.create_swapchain(&swapchain_info()).unwrap();

    comp.allocate_layers(2);
    comp.set_quad_layer(
        0,
        sc.image(0).unwrap(),
        Pose::identity(),
        Vec2::new(1.0, 1.0),
        false,
        0,
    )
    .unwrap();

    comp.destroy_layers();
    comp.allocate_layers(3);
    assert_eq!(comp.num_layers(), 3);
    assert!(comp.layers().iter().all(|l| l.is_none()));
}
