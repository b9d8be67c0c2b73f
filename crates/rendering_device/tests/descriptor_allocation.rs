//! Descriptor layouts, writes and the expanding pool allocator

mod common;

use common::driver;
use rendering_device::config::DescriptorAllocatorConfig;
use rendering_device::prelude::*;
use rendering_device::render::{
    DescriptorResource, DescriptorSetLayoutBuilder, DescriptorSetLayoutId, DescriptorType,
    PoolSizeRatio, ShaderStages,
};

fn uniform_layout(driver: &mut HeadlessDriver) -> DescriptorSetLayoutId {
    DescriptorSetLayoutBuilder::new()
        .add_uniform_buffer(0, ShaderStages::VERTEX)
        .build(driver)
        .unwrap()
}

fn uniform_ratios() -> Vec<PoolSizeRatio> {
    vec![PoolSizeRatio::new(DescriptorType::UniformBuffer, 1.0)]
}

#[test]
fn test_third_allocation_rotates_to_a_grown_pool() {
    let mut driver = driver();
    let layout = uniform_layout(&mut driver);
    let mut allocator = DescriptorPoolExpanding::new(&mut driver, 2, &uniform_ratios()).unwrap();
    assert_eq!(allocator.sets_per_pool(), 3);

    let first = allocator.allocate(&mut driver, layout).unwrap();
    let second = allocator.allocate(&mut driver, layout).unwrap();
    assert_eq!(first.pool, second.pool);
    assert_eq!(driver.descriptor_pool_count(), 1);

    let third = allocator.allocate(&mut driver, layout).unwrap();
    assert_ne!(third.pool, first.pool);
    assert_eq!(driver.descriptor_pool_count(), 2);
    assert_eq!(allocator.full_pool_count(), 1);
    assert_eq!(allocator.ready_pool_count(), 1);
    assert_eq!(allocator.sets_per_pool(), 4);

    allocator.destroy_pools(&mut driver);
    assert_eq!(driver.descriptor_pool_count(), 0);
}

#[test]
fn test_growth_stops_at_the_cap() {
    let mut sets = 2;
    for _ in 0..64 {
        sets = DescriptorPoolExpanding::grow(sets);
    }
    assert_eq!(sets, DescriptorPoolExpanding::MAX_SETS_PER_POOL);
    assert_eq!(DescriptorPoolExpanding::grow(1), 2);
    assert_eq!(DescriptorPoolExpanding::grow(4000), 4092);
}

#[test]
fn test_reset_makes_full_pools_ready() {
    let mut driver = driver();
    let layout = uniform_layout(&mut driver);
    let mut allocator = DescriptorPoolExpanding::new(&mut driver, 1, &uniform_ratios()).unwrap();

    let sets: Vec<_> = (0..4)
        .map(|_| allocator.allocate(&mut driver, layout).unwrap())
        .collect();
    let full = allocator.full_pool_count();
    assert!(full > 0);
    let total = full + allocator.ready_pool_count();

    allocator.reset(&mut driver).unwrap();
    assert_eq!(allocator.full_pool_count(), 0);
    assert_eq!(allocator.ready_pool_count(), total);
    assert_eq!(driver.descriptor_pool_count(), total);

    // Old sets are gone, their slots are free again
    let buffer = driver
        .create_buffer(&BufferDescription::new(BufferUsage::UNIFORM, 1, 64))
        .unwrap();
    assert!(DescriptorSetWriter::new()
        .write_buffer(0, buffer.id, 0, 64)
        .update(&mut driver, &sets[0])
        .is_err());
    for _ in 0..4 {
        allocator.allocate(&mut driver, layout).unwrap();
    }
    assert_eq!(driver.descriptor_pool_count(), total);

    allocator.destroy_pools(&mut driver);
}

#[test]
fn test_layout_larger_than_any_pool_fails_hard() {
    let mut driver = driver();
    let layout = DescriptorSetLayoutBuilder::new()
        .add(0, DescriptorType::UniformBuffer, 5, ShaderStages::FRAGMENT)
        .build(&mut driver)
        .unwrap();
    let mut allocator = DescriptorPoolExpanding::new(&mut driver, 2, &uniform_ratios()).unwrap();

    assert!(matches!(
        allocator.allocate(&mut driver, layout),
        Err(DriverError::DescriptorAllocationExhausted { sets_per_pool: 3 })
    ));
    assert_eq!(allocator.full_pool_count(), 2);
    assert_eq!(allocator.ready_pool_count(), 0);

    allocator.destroy_pools(&mut driver);
}

#[test]
fn test_allocator_from_config() {
    let mut driver = driver();
    let config = DescriptorAllocatorConfig::default();
    let mut allocator = DescriptorPoolExpanding::from_config(&mut driver, &config).unwrap();
    assert_eq!(allocator.ratios(), config.ratios.as_slice());
    assert_eq!(
        allocator.sets_per_pool(),
        DescriptorPoolExpanding::grow(config.initial_sets)
    );

    let layout = DescriptorSetLayoutBuilder::new()
        .add_uniform_buffer(0, ShaderStages::VERTEX | ShaderStages::FRAGMENT)
        .add_combined_image_sampler(1, ShaderStages::FRAGMENT)
        .build(&mut driver)
        .unwrap();
    allocator.allocate(&mut driver, layout).unwrap();
    allocator.destroy_pools(&mut driver);
}

#[test]
fn test_writes_bind_resources() {
    let mut driver = driver();
    let layout = DescriptorSetLayoutBuilder::new()
        .add_uniform_buffer(0, ShaderStages::VERTEX)
        .add_combined_image_sampler(1, ShaderStages::FRAGMENT)
        .build(&mut driver)
        .unwrap();
    let mut allocator = DescriptorPoolExpanding::new(
        &mut driver,
        4,
        &[
            PoolSizeRatio::new(DescriptorType::UniformBuffer, 1.0),
            PoolSizeRatio::new(DescriptorType::CombinedImageSampler, 1.0),
        ],
    )
    .unwrap();
    let set = allocator.allocate(&mut driver, layout).unwrap();

    let uniforms = driver
        .create_buffer(&BufferDescription::new(BufferUsage::UNIFORM, 4, 64))
        .unwrap();
    let texture = driver
        .create_image(
            &ImageFormat::new_2d(DataFormat::R8G8B8A8Srgb, 4, 4, ImageUsage::SAMPLING),
            &ImageView::new(DataFormat::R8G8B8A8Srgb),
        )
        .unwrap();
    let sampler = driver.create_sampler(&SamplerState::linear_repeat()).unwrap();

    DescriptorSetWriter::new()
        .write_buffer(0, uniforms.id, 64, 128)
        .write_image(1, texture.id, sampler, ImageLayout::ShaderReadOnlyOptimal)
        .update(&mut driver, &set)
        .unwrap();

    assert_eq!(
        driver.bound_descriptor(&set, 0, 0),
        Some(DescriptorResource::Buffer {
            buffer: uniforms.id,
            offset: 64,
            range: 128
        })
    );
    assert_eq!(
        driver.bound_descriptor(&set, 1, 0),
        Some(DescriptorResource::CombinedImageSampler {
            image: texture.id,
            sampler,
            layout: ImageLayout::ShaderReadOnlyOptimal
        })
    );
    assert_eq!(driver.bound_descriptor(&set, 2, 0), None);

    allocator.destroy_pools(&mut driver);
}

#[test]
fn test_invalid_writes_leave_the_set_untouched() {
    let mut driver = driver();
    let layout = uniform_layout(&mut driver);
    let mut allocator = DescriptorPoolExpanding::new(&mut driver, 2, &uniform_ratios()).unwrap();
    let set = allocator.allocate(&mut driver, layout).unwrap();

    let uniforms = driver
        .create_buffer(&BufferDescription::new(BufferUsage::UNIFORM, 1, 256))
        .unwrap();
    let storage = driver
        .create_buffer(&BufferDescription::new(BufferUsage::STORAGE, 1, 256))
        .unwrap();

    // Range past the end of the buffer
    assert!(matches!(
        DescriptorSetWriter::new()
            .write_buffer(0, uniforms.id, 128, 256)
            .update(&mut driver, &set),
        Err(DriverError::OutOfBounds { .. })
    ));
    // Missing usage
    assert!(DescriptorSetWriter::new()
        .write_buffer(0, storage.id, 0, 256)
        .update(&mut driver, &set)
        .is_err());
    // One bad write rejects the whole batch
    assert!(DescriptorSetWriter::new()
        .write_buffer(0, uniforms.id, 0, 256)
        .write_buffer(3, uniforms.id, 0, 256)
        .update(&mut driver, &set)
        .is_err());
    assert_eq!(driver.bound_descriptor(&set, 0, 0), None);

    allocator.destroy_pools(&mut driver);
}

#[test]
fn test_duplicate_bindings_are_rejected() {
    let mut driver = driver();
    let duplicate = DescriptorSetLayoutBuilder::new()
        .add_uniform_buffer(0, ShaderStages::VERTEX)
        .add_storage_buffer(0, ShaderStages::COMPUTE)
        .build(&mut driver);
    assert!(matches!(duplicate, Err(DriverError::ContractViolation(_))));
}
