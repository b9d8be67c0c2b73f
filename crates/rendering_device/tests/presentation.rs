//! Surfaces, swapchains and the resize protocol

mod common;

use common::{driver, graphics, transition, Graphics};
use rendering_device::prelude::*;
use rendering_device::render::{PresentOutcome, SurfaceId, SwapchainFrame, SwapchainId};

fn offscreen(driver: &mut HeadlessDriver, width: u32, height: u32) -> (SurfaceId, SwapchainId) {
    let surface = driver
        .create_surface(&SurfaceTarget::Offscreen { width, height })
        .unwrap();
    let swapchain = driver.create_swapchain(surface).unwrap();
    (surface, swapchain)
}

fn acquire(driver: &mut HeadlessDriver, g: &Graphics, swapchain: SwapchainId) -> SwapchainFrame {
    match driver.acquire_swapchain_framebuffer(g.queue, swapchain).unwrap() {
        AcquireOutcome::Ready(frame) => frame,
        AcquireOutcome::ResizeRequired => panic!("swapchain unexpectedly needs a resize"),
    }
}

/// Clear the frame and hand it to the presentation engine
fn render_and_present(
    driver: &mut HeadlessDriver,
    g: &Graphics,
    swapchain: SwapchainId,
    frame: &SwapchainFrame,
) -> PresentOutcome {
    let image = frame.image;
    driver.begin_command_buffer(g.cb).unwrap();
    transition(driver, g.cb, &image, ImageLayout::Undefined, ImageLayout::TransferDstOptimal).unwrap();
    driver
        .command_clear_color_image(
            g.cb,
            &image,
            ImageLayout::TransferDstOptimal,
            [0.0, 1.0, 0.0, 1.0],
            &ImageSubresourceRange::whole(&image.format),
        )
        .unwrap();
    transition(driver, g.cb, &image, ImageLayout::TransferDstOptimal, ImageLayout::PresentSrc).unwrap();
    driver.end_command_buffer(g.cb).unwrap();

    let fence = driver.create_fence().unwrap();
    let outcome = driver
        .execute_command_queue_and_present(g.queue, &[], &[g.cb], &[], Some(fence), &[swapchain])
        .unwrap();
    driver.wait_on_fence(fence).unwrap();
    driver.destroy_fence(fence);
    outcome
}

#[test]
fn test_new_swapchain_requires_resize() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let (_surface, swapchain) = offscreen(&mut driver, 64, 48);

    assert!(driver
        .acquire_swapchain_framebuffer(g.queue, swapchain)
        .unwrap()
        .resize_required());
    assert_eq!(driver.swapchain_extent(swapchain).unwrap(), (0, 0));

    driver.resize_swapchain(g.queue, swapchain, 3).unwrap();
    assert_eq!(driver.swapchain_extent(swapchain).unwrap(), (64, 48));
    assert_eq!(
        driver.swapchain_format(swapchain).unwrap(),
        DataFormat::B8G8R8A8Unorm
    );
    let frame = acquire(&mut driver, &g, swapchain);
    assert_eq!(frame.index, 0);
    assert_eq!((frame.image.format.width, frame.image.format.height), (64, 48));
}

#[test]
fn test_frames_present_in_rotation() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let (_surface, swapchain) = offscreen(&mut driver, 16, 16);
    driver.resize_swapchain(g.queue, swapchain, 2).unwrap();

    let mut indices = Vec::new();
    for _ in 0..3 {
        let frame = acquire(&mut driver, &g, swapchain);
        indices.push(frame.index);
        let outcome = render_and_present(&mut driver, &g, swapchain, &frame);
        assert!(outcome.out_of_date.is_empty());
        assert_eq!(
            driver.image_layout(frame.image.id, 0, 0),
            Some(ImageLayout::PresentSrc)
        );
    }

    assert_eq!(indices, vec![0, 1, 0]);
    assert_eq!(driver.presented_frames(swapchain), Some(3));
}

#[test]
fn test_present_requires_present_layout() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let (_surface, swapchain) = offscreen(&mut driver, 16, 16);
    driver.resize_swapchain(g.queue, swapchain, 2).unwrap();
    let frame = acquire(&mut driver, &g, swapchain);

    driver.begin_command_buffer(g.cb).unwrap();
    transition(
        &mut driver,
        g.cb,
        &frame.image,
        ImageLayout::Undefined,
        ImageLayout::ColorAttachmentOptimal,
    )
    .unwrap();
    driver.end_command_buffer(g.cb).unwrap();

    assert!(matches!(
        driver.execute_command_queue_and_present(g.queue, &[], &[g.cb], &[], None, &[swapchain]),
        Err(DriverError::ContractViolation(_))
    ));
    assert_eq!(driver.presented_frames(swapchain), Some(0));

    // A second acquire without presenting is a misuse
    assert!(driver.acquire_swapchain_framebuffer(g.queue, swapchain).is_err());
}

#[test]
fn test_surface_resize_drops_one_frame() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let (surface, swapchain) = offscreen(&mut driver, 32, 32);
    driver.resize_swapchain(g.queue, swapchain, 2).unwrap();

    let frame = acquire(&mut driver, &g, swapchain);
    driver.surface_set_size(surface, 40, 24).unwrap();
    let outcome = render_and_present(&mut driver, &g, swapchain, &frame);
    assert_eq!(outcome.out_of_date, vec![swapchain]);
    assert_eq!(driver.presented_frames(swapchain), Some(0));

    assert_eq!(
        driver.acquire_swapchain_framebuffer(g.queue, swapchain).unwrap(),
        AcquireOutcome::ResizeRequired
    );
    driver.resize_swapchain(g.queue, swapchain, 2).unwrap();
    assert_eq!(driver.swapchain_extent(swapchain).unwrap(), (40, 24));

    let frame = acquire(&mut driver, &g, swapchain);
    assert_eq!(frame.index, 0);
    let outcome = render_and_present(&mut driver, &g, swapchain, &frame);
    assert!(outcome.out_of_date.is_empty());
    assert_eq!(driver.presented_frames(swapchain), Some(1));
}

#[test]
fn test_minimized_surface_keeps_requesting_resize() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let (surface, swapchain) = offscreen(&mut driver, 32, 32);
    driver.resize_swapchain(g.queue, swapchain, 2).unwrap();
    let used = driver.memory_used();
    assert_eq!(used, 2 * 32 * 32 * 4);

    driver.surface_set_size(surface, 0, 0).unwrap();
    driver.resize_swapchain(g.queue, swapchain, 2).unwrap();
    assert_eq!(driver.swapchain_extent(swapchain).unwrap(), (0, 0));
    assert_eq!(driver.memory_used(), 0);
    assert!(driver
        .acquire_swapchain_framebuffer(g.queue, swapchain)
        .unwrap()
        .resize_required());
}

#[test]
fn test_swapchain_owns_its_images() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let (surface, swapchain) = offscreen(&mut driver, 8, 8);
    driver.resize_swapchain(g.queue, swapchain, 20).unwrap();
    // Requests are clamped to what the device supports
    assert_eq!(driver.memory_used(), 8 * 8 * 8 * 4);

    let frame = acquire(&mut driver, &g, swapchain);
    driver.destroy_image(frame.image.id);
    assert!(driver.image_layout(frame.image.id, 0, 0).is_some());

    // Destroying a surface with a live swapchain is ignored
    driver.destroy_surface(surface);
    assert!(driver.swapchain_extent(swapchain).is_ok());

    driver.destroy_swapchain(swapchain);
    assert_eq!(driver.memory_used(), 0);
    assert!(driver.swapchain_extent(swapchain).is_err());
    driver.destroy_surface(surface);
    assert!(driver.create_swapchain(surface).is_err());
}
