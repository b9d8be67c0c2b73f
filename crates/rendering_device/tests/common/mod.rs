//! Shared setup for the headless driver integration tests

#![allow(dead_code)]

use rendering_device::prelude::*;
use rendering_device::render::{CommandBufferId, CommandPoolId, CommandQueueId};

/// Headless driver with the default two-family device
pub fn driver() -> HeadlessDriver {
    HeadlessDriver::new(&DriverConfig::default()).expect("default config is valid")
}

/// A graphics queue with one pool and one primary command buffer
pub struct Graphics {
    pub queue: CommandQueueId,
    pub pool: CommandPoolId,
    pub cb: CommandBufferId,
}

pub fn graphics(driver: &mut HeadlessDriver) -> Graphics {
    let family = driver
        .get_queue_family(QueueFamilyFlags::GRAPHICS, None)
        .expect("graphics family");
    let queue = driver.create_command_queue(family).expect("queue");
    let pool = driver
        .create_command_pool(family, CommandBufferType::Primary)
        .expect("pool");
    let cb = driver.create_command_buffer(pool).expect("command buffer");
    Graphics { queue, pool, cb }
}

/// Submit one executable buffer and wait for it on a fresh fence
pub fn submit_and_wait(driver: &mut HeadlessDriver, graphics: &Graphics) {
    let fence = driver.create_fence().expect("fence");
    driver
        .execute_command_queue_and_present(graphics.queue, &[], &[graphics.cb], &[], Some(fence), &[])
        .expect("submission");
    driver.wait_on_fence(fence).expect("fence wait");
    driver.destroy_fence(fence);
}

/// Whole-image layout transition recorded on `cb`
pub fn transition(
    driver: &mut HeadlessDriver,
    cb: CommandBufferId,
    image: &Image,
    old_layout: ImageLayout,
    new_layout: ImageLayout,
) -> DriverResult<()> {
    driver.command_pipeline_barrier(
        cb,
        PipelineStages::TOP_OF_PIPE | PipelineStages::TRANSFER,
        PipelineStages::TRANSFER,
        &[],
        &[],
        &[ImageBarrier::transition(image, old_layout, new_layout)],
    )
}

/// Region covering mip 0 of a single-layer image
pub fn full_region(image: &Image) -> BufferImageCopyRegion {
    BufferImageCopyRegion {
        buffer_offset: 0,
        subresources: ImageSubresourceLayers::color(0),
        image_offset: [0; 3],
        image_extent: [image.format.width, image.format.height, 1],
    }
}
