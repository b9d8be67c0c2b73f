//! Buffers, images and transfer commands on the headless backend

mod common;

use common::{driver, full_region, graphics, submit_and_wait, transition, Graphics};
use rendering_device::prelude::*;
use rendering_device::render::{BufferCopyRegion, ImageCopyRegion, SampleCount, TextureType};

#[test]
fn test_buffer_size_is_count_times_stride() {
    let mut driver = driver();
    let buffer = driver
        .create_buffer(&BufferDescription::new(BufferUsage::VERTEX, 4, 12))
        .unwrap();
    assert_eq!(buffer.size(), 48);

    driver.write_buffer(&buffer, 0, &[7u8; 48]).unwrap();
    let overflow = driver.write_buffer(&buffer, 48, &[0u8; 4]);
    assert!(matches!(
        overflow,
        Err(DriverError::OutOfBounds {
            offset: 48,
            length: 4,
            size: 48
        })
    ));

    // The failed write must not have touched the buffer
    let mut contents = [0u8; 48];
    driver.read_buffer(&buffer, 0, &mut contents).unwrap();
    assert!(contents.iter().all(|&b| b == 7));
}

#[test]
fn test_host_access_straddling_the_end_fails() {
    let mut driver = driver();
    let buffer = driver
        .create_buffer(&BufferDescription::new(BufferUsage::UNIFORM, 4, 12))
        .unwrap();

    assert!(matches!(
        driver.write_buffer(&buffer, 40, &[0u8; 16]),
        Err(DriverError::OutOfBounds { .. })
    ));
    let mut out = [0u8; 16];
    assert!(matches!(
        driver.read_buffer(&buffer, 40, &mut out),
        Err(DriverError::OutOfBounds { .. })
    ));
    assert!(matches!(
        driver.write_buffer(&buffer, u64::MAX, &[0u8; 2]),
        Err(DriverError::OutOfBounds { .. })
    ));
}

#[test]
fn test_copy_and_clear_buffer() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let src = driver
        .create_buffer(&BufferDescription::new(BufferUsage::COPY_SOURCE, 16, 1))
        .unwrap();
    let dst = driver
        .create_buffer(&BufferDescription::new(
            BufferUsage::COPY_DESTINATION | BufferUsage::STORAGE,
            16,
            1,
        ))
        .unwrap();
    let pattern: Vec<u8> = (1..=16).collect();
    driver.write_buffer(&src, 0, &pattern).unwrap();

    driver.begin_command_buffer(g.cb).unwrap();
    driver
        .command_copy_buffer(
            g.cb,
            &src,
            &dst,
            &[BufferCopyRegion {
                src_offset: 0,
                dst_offset: 0,
                size: 16,
            }],
        )
        .unwrap();
    driver
        .command_pipeline_barrier(
            g.cb,
            PipelineStages::TRANSFER,
            PipelineStages::TRANSFER,
            &[],
            &[BufferBarrier::whole(
                &dst,
                BarrierAccess::TRANSFER_WRITE,
                BarrierAccess::TRANSFER_WRITE,
            )],
            &[],
        )
        .unwrap();
    driver.command_clear_buffer(g.cb, &dst, 4, 8).unwrap();
    driver.end_command_buffer(g.cb).unwrap();

    // Nothing executes before submission
    let mut out = [0u8; 16];
    driver.read_buffer(&dst, 0, &mut out).unwrap();
    assert_eq!(out, [0u8; 16]);

    submit_and_wait(&mut driver, &g);
    driver.read_buffer(&dst, 0, &mut out).unwrap();
    assert_eq!(&out[..4], &[1, 2, 3, 4]);
    assert_eq!(&out[4..12], &[0u8; 8]);
    assert_eq!(&out[12..], &[13, 14, 15, 16]);
}

#[test]
fn test_copy_requires_transfer_usage() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let src = driver
        .create_buffer(&BufferDescription::new(BufferUsage::UNIFORM, 16, 1))
        .unwrap();
    let dst = driver
        .create_buffer(&BufferDescription::new(BufferUsage::COPY_DESTINATION, 16, 1))
        .unwrap();

    driver.begin_command_buffer(g.cb).unwrap();
    let region = BufferCopyRegion {
        src_offset: 0,
        dst_offset: 0,
        size: 16,
    };
    assert!(matches!(
        driver.command_copy_buffer(g.cb, &src, &dst, &[region]),
        Err(DriverError::ContractViolation(_))
    ));
}

#[test]
fn test_image_upload_and_read_back() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let format = ImageFormat::new_2d(
        DataFormat::R8G8B8A8Unorm,
        4,
        4,
        ImageUsage::SAMPLING | ImageUsage::COPY_SOURCE | ImageUsage::COPY_DESTINATION,
    );
    let image = driver
        .create_image(&format, &ImageView::new(DataFormat::R8G8B8A8Unorm))
        .unwrap();
    let staging = driver
        .create_buffer(&BufferDescription::new(BufferUsage::COPY_SOURCE, 16, 4))
        .unwrap();
    let readback = driver
        .create_buffer(&BufferDescription::new(BufferUsage::COPY_DESTINATION, 16, 4))
        .unwrap();
    let texels: Vec<u8> = (0..64).collect();
    driver.write_buffer(&staging, 0, &texels).unwrap();

    driver.begin_command_buffer(g.cb).unwrap();
    transition(&mut driver, g.cb, &image, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)
        .unwrap();
    assert_eq!(
        driver.recorded_image_layout(g.cb, image.id, 0, 0),
        Some(ImageLayout::TransferDstOptimal)
    );
    // Recorded transitions only take effect once submitted
    assert_eq!(driver.image_layout(image.id, 0, 0), Some(ImageLayout::Undefined));
    driver
        .command_copy_buffer_to_image(
            g.cb,
            &staging,
            &image,
            ImageLayout::TransferDstOptimal,
            &[full_region(&image)],
        )
        .unwrap();
    transition(
        &mut driver,
        g.cb,
        &image,
        ImageLayout::TransferDstOptimal,
        ImageLayout::TransferSrcOptimal,
    )
    .unwrap();
    driver
        .command_copy_image_to_buffer(
            g.cb,
            &image,
            ImageLayout::TransferSrcOptimal,
            &readback,
            &[full_region(&image)],
        )
        .unwrap();
    driver.end_command_buffer(g.cb).unwrap();
    submit_and_wait(&mut driver, &g);

    let mut out = vec![0u8; 64];
    driver.read_buffer(&readback, 0, &mut out).unwrap();
    assert_eq!(out, texels);
    assert_eq!(
        driver.image_layout(image.id, 0, 0),
        Some(ImageLayout::TransferSrcOptimal)
    );
}

#[test]
fn test_stale_layout_is_a_contract_violation() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let format = ImageFormat::new_2d(
        DataFormat::R8G8B8A8Unorm,
        4,
        4,
        ImageUsage::COPY_SOURCE | ImageUsage::COPY_DESTINATION,
    );
    let image = driver
        .create_image(&format, &ImageView::new(DataFormat::R8G8B8A8Unorm))
        .unwrap();
    let buffer = driver
        .create_buffer(&BufferDescription::new(BufferUsage::COPY_DESTINATION, 16, 4))
        .unwrap();

    driver.begin_command_buffer(g.cb).unwrap();
    transition(&mut driver, g.cb, &image, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)
        .unwrap();

    // The image is still a copy destination
    let copy = driver.command_copy_image_to_buffer(
        g.cb,
        &image,
        ImageLayout::TransferSrcOptimal,
        &buffer,
        &[full_region(&image)],
    );
    assert!(matches!(copy, Err(DriverError::ContractViolation(_))));

    // A barrier lying about the old layout changes nothing
    let barrier = transition(
        &mut driver,
        g.cb,
        &image,
        ImageLayout::ShaderReadOnlyOptimal,
        ImageLayout::TransferSrcOptimal,
    );
    assert!(matches!(barrier, Err(DriverError::ContractViolation(_))));
    assert_eq!(
        driver.recorded_image_layout(g.cb, image.id, 0, 0),
        Some(ImageLayout::TransferDstOptimal)
    );
}

#[test]
fn test_partial_transition_tracks_each_subresource() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let format = ImageFormat::new_2d(DataFormat::R8G8B8A8Unorm, 8, 8, ImageUsage::SAMPLING)
        .with_mipmaps(2)
        .with_layers(2)
        .with_type(TextureType::Type2DArray, 1);
    let image = driver
        .create_image(&format, &ImageView::new(DataFormat::R8G8B8A8Unorm))
        .unwrap();

    let range = ImageSubresourceRange {
        base_mip: 1,
        mip_count: 1,
        base_layer: 1,
        layer_count: 1,
        ..ImageSubresourceRange::whole(&format)
    };
    driver.begin_command_buffer(g.cb).unwrap();
    driver
        .command_pipeline_barrier(
            g.cb,
            PipelineStages::TOP_OF_PIPE,
            PipelineStages::FRAGMENT_SHADER,
            &[],
            &[],
            &[ImageBarrier::transition(
                &image,
                ImageLayout::Undefined,
                ImageLayout::ShaderReadOnlyOptimal,
            )
            .with_range(range)],
        )
        .unwrap();

    assert_eq!(
        driver.recorded_image_layout(g.cb, image.id, 1, 1),
        Some(ImageLayout::ShaderReadOnlyOptimal)
    );
    assert_eq!(
        driver.recorded_image_layout(g.cb, image.id, 0, 0),
        Some(ImageLayout::Undefined)
    );
    assert_eq!(driver.recorded_image_layout(g.cb, image.id, 2, 0), None);

    driver.end_command_buffer(g.cb).unwrap();
    submit_and_wait(&mut driver, &g);
    assert_eq!(
        driver.image_layout(image.id, 1, 1),
        Some(ImageLayout::ShaderReadOnlyOptimal)
    );
    assert_eq!(driver.image_layout(image.id, 0, 0), Some(ImageLayout::Undefined));
    assert_eq!(driver.image_layout(image.id, 1, 0), Some(ImageLayout::Undefined));
    assert_eq!(driver.image_layout(image.id, 2, 0), None);
}

fn transfer_image(driver: &mut HeadlessDriver) -> Image {
    let format = ImageFormat::new_2d(
        DataFormat::R8G8B8A8Unorm,
        4,
        4,
        ImageUsage::SAMPLING | ImageUsage::COPY_SOURCE | ImageUsage::COPY_DESTINATION,
    );
    driver
        .create_image(&format, &ImageView::new(DataFormat::R8G8B8A8Unorm))
        .unwrap()
}

/// Leaves `image` in `TransferDstOptimal` with that layout submitted
fn upload_layout(driver: &mut HeadlessDriver, g: &Graphics, image: &Image) {
    driver.begin_command_buffer(g.cb).unwrap();
    transition(driver, g.cb, image, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)
        .unwrap();
    driver.end_command_buffer(g.cb).unwrap();
    submit_and_wait(driver, g);
}

#[test]
fn test_reset_command_buffer_discards_recorded_transitions() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let image = transfer_image(&mut driver);
    upload_layout(&mut driver, &g, &image);

    driver.begin_command_buffer(g.cb).unwrap();
    transition(
        &mut driver,
        g.cb,
        &image,
        ImageLayout::TransferDstOptimal,
        ImageLayout::TransferSrcOptimal,
    )
    .unwrap();
    driver.reset_command_buffer(g.cb).unwrap();
    assert_eq!(
        driver.image_layout(image.id, 0, 0),
        Some(ImageLayout::TransferDstOptimal)
    );

    driver.begin_command_buffer(g.cb).unwrap();
    transition(
        &mut driver,
        g.cb,
        &image,
        ImageLayout::TransferDstOptimal,
        ImageLayout::ShaderReadOnlyOptimal,
    )
    .unwrap();
    driver.end_command_buffer(g.cb).unwrap();
    submit_and_wait(&mut driver, &g);
    assert_eq!(
        driver.image_layout(image.id, 0, 0),
        Some(ImageLayout::ShaderReadOnlyOptimal)
    );
}

#[test]
fn test_reset_command_pool_discards_recorded_transitions() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let image = transfer_image(&mut driver);
    upload_layout(&mut driver, &g, &image);

    driver.begin_command_buffer(g.cb).unwrap();
    transition(
        &mut driver,
        g.cb,
        &image,
        ImageLayout::TransferDstOptimal,
        ImageLayout::TransferSrcOptimal,
    )
    .unwrap();
    driver.reset_command_pool(g.pool).unwrap();
    assert_eq!(
        driver.command_buffer_state(g.cb).unwrap(),
        CommandBufferState::Invalid
    );
    assert_eq!(
        driver.image_layout(image.id, 0, 0),
        Some(ImageLayout::TransferDstOptimal)
    );

    // Pool reset invalidates its buffers, so record the fix on a new one
    let fresh = Graphics {
        queue: g.queue,
        pool: g.pool,
        cb: driver.create_command_buffer(g.pool).unwrap(),
    };
    driver.begin_command_buffer(fresh.cb).unwrap();
    transition(
        &mut driver,
        fresh.cb,
        &image,
        ImageLayout::TransferDstOptimal,
        ImageLayout::ShaderReadOnlyOptimal,
    )
    .unwrap();
    driver.end_command_buffer(fresh.cb).unwrap();
    submit_and_wait(&mut driver, &fresh);
    assert_eq!(
        driver.image_layout(image.id, 0, 0),
        Some(ImageLayout::ShaderReadOnlyOptimal)
    );
}

#[test]
fn test_batch_entry_layouts_follow_submission_order() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let second = driver.create_command_buffer(g.pool).unwrap();
    let image = transfer_image(&mut driver);
    upload_layout(&mut driver, &g, &image);

    // Both buffers were recorded against the same committed layout
    for cb in [g.cb, second] {
        driver.begin_command_buffer(cb).unwrap();
        transition(
            &mut driver,
            cb,
            &image,
            ImageLayout::TransferDstOptimal,
            ImageLayout::TransferSrcOptimal,
        )
        .unwrap();
        driver.end_command_buffer(cb).unwrap();
    }
    let submit =
        driver.execute_command_queue_and_present(g.queue, &[], &[g.cb, second], &[], None, &[]);
    assert!(matches!(submit, Err(DriverError::ContractViolation(_))));
    assert_eq!(
        driver.image_layout(image.id, 0, 0),
        Some(ImageLayout::TransferDstOptimal)
    );
    assert_eq!(
        driver.command_buffer_state(g.cb).unwrap(),
        CommandBufferState::Executable
    );
}

#[test]
fn test_failed_batch_applies_no_writes() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let second = driver.create_command_buffer(g.pool).unwrap();
    let kept = driver
        .create_buffer(&BufferDescription::new(BufferUsage::COPY_DESTINATION, 16, 1))
        .unwrap();
    let doomed = driver
        .create_buffer(&BufferDescription::new(BufferUsage::COPY_DESTINATION, 16, 1))
        .unwrap();
    driver.write_buffer(&kept, 0, &[9u8; 16]).unwrap();

    for (cb, buffer) in [(g.cb, &kept), (second, &doomed)] {
        driver.begin_command_buffer(cb).unwrap();
        driver.command_clear_buffer(cb, buffer, 0, 16).unwrap();
        driver.end_command_buffer(cb).unwrap();
    }
    driver.destroy_buffer(doomed.id);

    let fence = driver.create_fence().unwrap();
    let submit = driver.execute_command_queue_and_present(
        g.queue,
        &[],
        &[g.cb, second],
        &[],
        Some(fence),
        &[],
    );
    assert!(matches!(
        submit,
        Err(DriverError::InvalidHandle { kind: "buffer" })
    ));

    let mut out = [0u8; 16];
    driver.read_buffer(&kept, 0, &mut out).unwrap();
    assert_eq!(out, [9u8; 16]);
    for cb in [g.cb, second] {
        assert_eq!(
            driver.command_buffer_state(cb).unwrap(),
            CommandBufferState::Executable
        );
    }
    assert!(matches!(driver.wait_on_fence(fence), Err(DriverError::Timeout)));
}

#[test]
fn test_clear_color_image_is_visible_through_mapping() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let format = ImageFormat::new_2d(
        DataFormat::R8G8B8A8Unorm,
        2,
        2,
        ImageUsage::COPY_DESTINATION | ImageUsage::CPU_READ,
    );
    let image = driver
        .create_image(&format, &ImageView::new(DataFormat::R8G8B8A8Unorm))
        .unwrap();

    driver.begin_command_buffer(g.cb).unwrap();
    transition(&mut driver, g.cb, &image, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)
        .unwrap();
    driver
        .command_clear_color_image(
            g.cb,
            &image,
            ImageLayout::TransferDstOptimal,
            [1.0, 0.0, 0.0, 1.0],
            &ImageSubresourceRange::whole(&format),
        )
        .unwrap();
    driver.end_command_buffer(g.cb).unwrap();
    submit_and_wait(&mut driver, &g);

    let mapped = driver.map_image(&image).unwrap();
    assert_eq!(mapped.len(), 16);
    assert!(mapped.chunks_exact(4).all(|texel| texel == [255, 0, 0, 255]));
    driver.unmap_image(&image);
}

#[test]
fn test_resolve_and_image_copy() {
    let mut driver = driver();
    let g = graphics(&mut driver);
    let msaa = ImageFormat::new_2d(
        DataFormat::R8G8B8A8Unorm,
        4,
        4,
        ImageUsage::COLOR_ATTACHMENT | ImageUsage::COPY_SOURCE | ImageUsage::COPY_DESTINATION,
    )
    .with_samples(SampleCount::X4);
    let resolved_format = ImageFormat::new_2d(
        DataFormat::R8G8B8A8Unorm,
        4,
        4,
        ImageUsage::COPY_SOURCE | ImageUsage::COPY_DESTINATION,
    );
    let view = ImageView::new(DataFormat::R8G8B8A8Unorm);
    let source = driver.create_image(&msaa, &view).unwrap();
    let resolved = driver.create_image(&resolved_format, &view).unwrap();
    let copy = driver
        .create_image(
            &ImageFormat::new_2d(
                DataFormat::R8G8B8A8Unorm,
                4,
                4,
                ImageUsage::COPY_DESTINATION | ImageUsage::CPU_READ,
            ),
            &view,
        )
        .unwrap();

    driver.begin_command_buffer(g.cb).unwrap();
    transition(&mut driver, g.cb, &source, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)
        .unwrap();
    driver
        .command_clear_color_image(
            g.cb,
            &source,
            ImageLayout::TransferDstOptimal,
            [0.0, 0.0, 1.0, 1.0],
            &ImageSubresourceRange::whole(&msaa),
        )
        .unwrap();
    transition(
        &mut driver,
        g.cb,
        &source,
        ImageLayout::TransferDstOptimal,
        ImageLayout::TransferSrcOptimal,
    )
    .unwrap();
    transition(&mut driver, g.cb, &resolved, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)
        .unwrap();
    driver
        .command_resolve_image(
            g.cb,
            &source,
            ImageLayout::TransferSrcOptimal,
            0,
            0,
            &resolved,
            ImageLayout::TransferDstOptimal,
            0,
            0,
        )
        .unwrap();

    // Resolving into the multisampled image itself is rejected
    assert!(driver
        .command_resolve_image(
            g.cb,
            &resolved,
            ImageLayout::TransferDstOptimal,
            0,
            0,
            &source,
            ImageLayout::TransferSrcOptimal,
            0,
            0,
        )
        .is_err());

    transition(
        &mut driver,
        g.cb,
        &resolved,
        ImageLayout::TransferDstOptimal,
        ImageLayout::TransferSrcOptimal,
    )
    .unwrap();
    transition(&mut driver, g.cb, &copy, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)
        .unwrap();
    driver
        .command_copy_image(
            g.cb,
            &resolved,
            ImageLayout::TransferSrcOptimal,
            &copy,
            ImageLayout::TransferDstOptimal,
            &[ImageCopyRegion {
                src_subresources: ImageSubresourceLayers::color(0),
                src_offset: [2, 2, 0],
                dst_subresources: ImageSubresourceLayers::color(0),
                dst_offset: [0, 0, 0],
                extent: [2, 2, 1],
            }],
        )
        .unwrap();
    driver.end_command_buffer(g.cb).unwrap();
    submit_and_wait(&mut driver, &g);

    let mapped = driver.map_image(&copy).unwrap();
    let blue = [0u8, 0, 255, 255];
    let untouched = [0u8; 4];
    // Row 0 of the destination holds the copied 2x2 block in its first two texels
    assert_eq!(&mapped[0..4], &blue);
    assert_eq!(&mapped[4..8], &blue);
    assert_eq!(&mapped[8..12], &untouched);
    assert_eq!(&mapped[48..52], &untouched);
    driver.unmap_image(&copy);
}

#[test]
fn test_unsupported_image_is_reported() {
    let mut driver = driver();
    let depth_color = ImageFormat::new_2d(
        DataFormat::D32Sfloat,
        4,
        4,
        ImageUsage::COLOR_ATTACHMENT,
    );
    assert!(matches!(
        driver.create_image(&depth_color, &ImageView::new(DataFormat::D32Sfloat)),
        Err(DriverError::Unsupported { .. })
    ));

    let sampled = ImageFormat::new_2d(DataFormat::R8G8B8A8Unorm, 4, 4, ImageUsage::SAMPLING);
    let image = driver
        .create_image(&sampled, &ImageView::new(DataFormat::R8G8B8A8Unorm))
        .unwrap();
    assert!(matches!(
        driver.map_image(&image),
        Err(DriverError::NotHostVisible)
    ));
}

#[test]
fn test_destroy_returns_memory() {
    let mut driver = driver();
    let buffer = driver
        .create_buffer(&BufferDescription::new(BufferUsage::STORAGE, 64, 16))
        .unwrap();
    let image = driver
        .create_image(
            &ImageFormat::new_2d(DataFormat::R8G8B8A8Unorm, 16, 16, ImageUsage::SAMPLING),
            &ImageView::new(DataFormat::R8G8B8A8Srgb),
        )
        .unwrap();
    assert_eq!(driver.memory_used(), 64 * 16 + 16 * 16 * 4);

    driver.destroy_buffer(buffer.id);
    driver.destroy_image(image.id);
    assert_eq!(driver.memory_used(), 0);
    assert_eq!(driver.image_layout(image.id, 0, 0), None);
    assert!(matches!(
        driver.write_buffer(&buffer, 0, &[0u8; 4]),
        Err(DriverError::InvalidHandle { kind: "buffer" })
    ));
}
