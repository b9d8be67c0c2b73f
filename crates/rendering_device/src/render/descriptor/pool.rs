//! Fixed-capacity descriptor pool

use super::{pool_sizes, DescriptorDevice, DescriptorPoolSize, DescriptorSet, PoolSizeRatio};
use crate::render::error::{DriverError, DriverResult};
use crate::render::handles::{DescriptorPoolId, DescriptorSetLayoutId};

/// One native descriptor pool
///
/// The device that created the pool is passed to every call instead of
/// being stored, so pools can live inside allocators owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPool {
    id: DescriptorPoolId,
    max_sets: u32,
    sizes: Vec<DescriptorPoolSize>,
}

impl DescriptorPool {
    /// Create a pool of `max_sets` sets sized by `ratios`
    pub fn new<D>(device: &mut D, max_sets: u32, ratios: &[PoolSizeRatio]) -> DriverResult<Self>
    where
        D: DescriptorDevice + ?Sized,
    {
        if max_sets == 0 {
            return Err(DriverError::contract("descriptor pool needs at least one set"));
        }
        let sizes = pool_sizes(ratios, max_sets);
        let id = device.create_descriptor_pool(max_sets, &sizes)?;
        log::debug!("Created descriptor pool with {max_sets} sets: {sizes:?}");
        Ok(Self { id, max_sets, sizes })
    }

    /// Allocate one set
    ///
    /// Exhaustion surfaces as [`DriverError::OutOfPoolMemory`] (or
    /// [`DriverError::FragmentedPool`]) so callers can move to another pool.
    pub fn allocate<D>(&self, device: &mut D, layout: DescriptorSetLayoutId) -> DriverResult<DescriptorSet>
    where
        D: DescriptorDevice + ?Sized,
    {
        device.allocate_descriptor_set(self.id, layout)
    }

    /// Release every set allocated from this pool
    pub fn reset<D>(&self, device: &mut D) -> DriverResult<()>
    where
        D: DescriptorDevice + ?Sized,
    {
        device.reset_descriptor_pool(self.id)
    }

    /// Destroy the pool
    pub fn destroy<D>(self, device: &mut D)
    where
        D: DescriptorDevice + ?Sized,
    {
        device.destroy_descriptor_pool(self.id);
    }

    /// Backend handle
    pub const fn id(&self) -> DescriptorPoolId {
        self.id
    }

    /// Set capacity
    pub const fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Per-type descriptor capacity
    pub fn sizes(&self) -> &[DescriptorPoolSize] {
        &self.sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::descriptor::testing::MockDescriptorDevice;
    use crate::render::descriptor::{DescriptorSetLayoutBuilder, DescriptorType};
    use crate::render::flags::ShaderStages;

    #[test]
    fn test_exhaustion_is_distinct() {
        let mut device = MockDescriptorDevice::default();
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, ShaderStages::VERTEX)
            .build(&mut device)
            .unwrap();
        let pool = DescriptorPool::new(
            &mut device,
            2,
            &[PoolSizeRatio::new(DescriptorType::UniformBuffer, 1.0)],
        )
        .unwrap();

        let a = pool.allocate(&mut device, layout).unwrap();
        let b = pool.allocate(&mut device, layout).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.pool, pool.id());

        let err = pool.allocate(&mut device, layout).unwrap_err();
        assert!(err.is_pool_exhaustion());

        pool.reset(&mut device).unwrap();
        assert!(pool.allocate(&mut device, layout).is_ok());

        pool.destroy(&mut device);
        assert!(device.pools.is_empty());
    }

    #[test]
    fn test_zero_sets_rejected() {
        let mut device = MockDescriptorDevice::default();
        assert!(DescriptorPool::new(&mut device, 0, &[]).is_err());
    }
}
