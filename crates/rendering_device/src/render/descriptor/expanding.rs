//! Expanding descriptor pool allocator
//!
//! Keeps a stack of pools believed to have room (`ready`) and a list of pools
//! that failed their last allocation (`full`). Each freshly created pool gets
//! `sets_per_pool` sets, after which the figure grows by 1.5x up to
//! [`DescriptorPoolExpanding::MAX_SETS_PER_POOL`].
//!
//! A pool that serves an allocation goes straight back on the ready stack
//! without probing its remaining capacity; the next allocation that hits an
//! exhausted pool rotates it to `full` and retries once on another pool.
//!
//! The allocator is not thread-safe. Shard one per thread or serialize access.

use super::{DescriptorDevice, DescriptorPool, DescriptorSet, PoolSizeRatio};
use crate::config::DescriptorAllocatorConfig;
use crate::render::error::{DriverError, DriverResult};
use crate::render::handles::DescriptorSetLayoutId;

/// Self-growing working set of descriptor pools
#[derive(Debug)]
pub struct DescriptorPoolExpanding {
    ratios: Vec<PoolSizeRatio>,
    ready_pools: Vec<DescriptorPool>,
    full_pools: Vec<DescriptorPool>,
    sets_per_pool: u32,
}

impl DescriptorPoolExpanding {
    /// Upper bound on the set capacity of any grown pool
    pub const MAX_SETS_PER_POOL: u32 = 4092;

    /// Create the allocator and its first pool of `max_sets` sets
    pub fn new<D>(device: &mut D, max_sets: u32, ratios: &[PoolSizeRatio]) -> DriverResult<Self>
    where
        D: DescriptorDevice + ?Sized,
    {
        if ratios.is_empty() {
            return Err(DriverError::contract("descriptor ratio table is empty"));
        }

        let first = DescriptorPool::new(device, max_sets, ratios)?;
        let sets_per_pool = Self::grow(max_sets);
        log::info!(
            "Descriptor allocator initialized: first pool {max_sets} sets, next pool {sets_per_pool} sets"
        );

        Ok(Self {
            ratios: ratios.to_vec(),
            ready_pools: vec![first],
            full_pools: Vec::new(),
            sets_per_pool,
        })
    }

    /// Create the allocator from configuration
    pub fn from_config<D>(device: &mut D, config: &DescriptorAllocatorConfig) -> DriverResult<Self>
    where
        D: DescriptorDevice + ?Sized,
    {
        Self::new(device, config.initial_sets, &config.ratios)
    }

    /// Next pool capacity after one of `sets` sets was created
    pub fn grow(sets: u32) -> u32 {
        let grown = (f64::from(sets) * 1.5) as u32;
        grown
            .max(sets.saturating_add(1))
            .min(Self::MAX_SETS_PER_POOL)
    }

    /// Allocate one set for `layout`
    ///
    /// On pool exhaustion the pool is moved to the full list and the
    /// allocation is retried exactly once on another (possibly new) pool.
    /// A second exhaustion fails with
    /// [`DriverError::DescriptorAllocationExhausted`].
    pub fn allocate<D>(
        &mut self,
        device: &mut D,
        layout: DescriptorSetLayoutId,
    ) -> DriverResult<DescriptorSet>
    where
        D: DescriptorDevice + ?Sized,
    {
        let pool = self.get_pool(device)?;
        let err = match pool.allocate(device, layout) {
            Ok(set) => {
                self.ready_pools.push(pool);
                return Ok(set);
            }
            Err(err) if err.is_pool_exhaustion() => err,
            Err(err) => {
                self.ready_pools.push(pool);
                return Err(err);
            }
        };

        log::debug!(
            "Descriptor pool with {} sets exhausted ({err}), rotating",
            pool.max_sets()
        );
        self.full_pools.push(pool);

        let retry = self.get_pool(device)?;
        match retry.allocate(device, layout) {
            Ok(set) => {
                self.ready_pools.push(retry);
                Ok(set)
            }
            Err(err) if err.is_pool_exhaustion() => {
                let sets_per_pool = retry.max_sets();
                log::error!(
                    "Descriptor allocation failed twice; layout does not fit a {sets_per_pool}-set pool with ratios {:?}",
                    self.ratios
                );
                self.full_pools.push(retry);
                Err(DriverError::DescriptorAllocationExhausted { sets_per_pool })
            }
            Err(err) => {
                self.ready_pools.push(retry);
                Err(err)
            }
        }
    }

    /// Reset every pool and make all of them ready again
    ///
    /// Every set allocated so far becomes invalid. Call once the GPU work
    /// referencing those sets is known to be complete.
    pub fn reset<D>(&mut self, device: &mut D) -> DriverResult<()>
    where
        D: DescriptorDevice + ?Sized,
    {
        for pool in self.ready_pools.iter().chain(self.full_pools.iter()) {
            pool.reset(device)?;
        }
        let recovered = self.full_pools.len();
        self.ready_pools.append(&mut self.full_pools);
        log::debug!(
            "Descriptor allocator reset: {} ready pools ({recovered} recovered from full)",
            self.ready_pools.len()
        );
        Ok(())
    }

    /// Destroy every pool owned by the allocator
    pub fn destroy_pools<D>(&mut self, device: &mut D)
    where
        D: DescriptorDevice + ?Sized,
    {
        for pool in self.ready_pools.drain(..).chain(self.full_pools.drain(..)) {
            pool.destroy(device);
        }
    }

    /// Pools believed to have spare capacity
    pub fn ready_pool_count(&self) -> usize {
        self.ready_pools.len()
    }

    /// Pools that failed their most recent allocation
    pub fn full_pool_count(&self) -> usize {
        self.full_pools.len()
    }

    /// Capacity the next created pool will get
    pub const fn sets_per_pool(&self) -> u32 {
        self.sets_per_pool
    }

    /// Descriptor type weights used for every pool
    pub fn ratios(&self) -> &[PoolSizeRatio] {
        &self.ratios
    }

    fn get_pool<D>(&mut self, device: &mut D) -> DriverResult<DescriptorPool>
    where
        D: DescriptorDevice + ?Sized,
    {
        if let Some(pool) = self.ready_pools.pop() {
            return Ok(pool);
        }

        let pool = DescriptorPool::new(device, self.sets_per_pool, &self.ratios)?;
        self.sets_per_pool = Self::grow(self.sets_per_pool);
        log::info!(
            "Created descriptor pool with {} sets, next pool will have {}",
            pool.max_sets(),
            self.sets_per_pool
        );
        Ok(pool)
    }
}

impl Drop for DescriptorPoolExpanding {
    fn drop(&mut self) {
        let live = self.ready_pools.len() + self.full_pools.len();
        if live > 0 {
            log::warn!("Descriptor allocator dropped with {live} live pools; call destroy_pools first");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::descriptor::testing::MockDescriptorDevice;
    use crate::render::descriptor::{DescriptorSetLayoutBuilder, DescriptorType};
    use crate::render::flags::ShaderStages;

    fn uniform_layout(device: &mut MockDescriptorDevice) -> DescriptorSetLayoutId {
        DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, ShaderStages::VERTEX)
            .build(device)
            .unwrap()
    }

    fn uniform_ratios() -> Vec<PoolSizeRatio> {
        vec![PoolSizeRatio::new(DescriptorType::UniformBuffer, 1.0)]
    }

    #[test]
    fn test_first_max_sets_allocations_share_one_pool() {
        let mut device = MockDescriptorDevice::default();
        let layout = uniform_layout(&mut device);
        let mut allocator = DescriptorPoolExpanding::new(&mut device, 5, &uniform_ratios()).unwrap();

        let sets: Vec<_> = (0..5)
            .map(|_| allocator.allocate(&mut device, layout).unwrap())
            .collect();

        assert_eq!(device.pools.len(), 1);
        assert!(sets.iter().all(|set| set.pool == sets[0].pool));
        assert_eq!(allocator.full_pool_count(), 0);
        assert_eq!(allocator.ready_pool_count(), 1);
        allocator.destroy_pools(&mut device);
    }

    #[test]
    fn test_exhaustion_rotates_and_grows() {
        let mut device = MockDescriptorDevice::default();
        let layout = uniform_layout(&mut device);
        let mut allocator = DescriptorPoolExpanding::new(&mut device, 2, &uniform_ratios()).unwrap();
        assert_eq!(allocator.sets_per_pool(), 3);

        let first = allocator.allocate(&mut device, layout).unwrap();
        let second = allocator.allocate(&mut device, layout).unwrap();
        let third = allocator.allocate(&mut device, layout).unwrap();

        assert_eq!(first.pool, second.pool);
        assert_ne!(third.pool, first.pool);
        assert_eq!(device.pools[third.pool].max_sets, 3);
        assert_eq!(allocator.full_pool_count(), 1);
        assert_eq!(allocator.ready_pool_count(), 1);
        assert_eq!(allocator.sets_per_pool(), 4);
        allocator.destroy_pools(&mut device);
    }

    #[test]
    fn test_growth_is_capped() {
        assert_eq!(DescriptorPoolExpanding::grow(2), 3);
        assert_eq!(DescriptorPoolExpanding::grow(64), 96);
        assert_eq!(DescriptorPoolExpanding::grow(1), 2);
        assert_eq!(DescriptorPoolExpanding::grow(4000), 4092);
        assert_eq!(DescriptorPoolExpanding::grow(4092), 4092);
    }

    #[test]
    fn test_second_exhaustion_is_a_hard_error() {
        let mut device = MockDescriptorDevice::default();
        let storage_image_layout = DescriptorSetLayoutBuilder::new()
            .add(0, DescriptorType::StorageImage, 1, ShaderStages::COMPUTE)
            .build(&mut device)
            .unwrap();
        let mut allocator = DescriptorPoolExpanding::new(&mut device, 4, &uniform_ratios()).unwrap();

        let err = allocator
            .allocate(&mut device, storage_image_layout)
            .unwrap_err();

        assert!(matches!(
            err,
            DriverError::DescriptorAllocationExhausted { sets_per_pool: 6 }
        ));
        assert_eq!(device.allocation_attempts, 2);
        assert_eq!(allocator.ready_pool_count(), 0);
        assert_eq!(allocator.full_pool_count(), 2);
        allocator.destroy_pools(&mut device);
        assert!(device.pools.is_empty());
    }

    #[test]
    fn test_reset_returns_full_pools_to_ready() {
        let mut device = MockDescriptorDevice::default();
        let uniform = uniform_layout(&mut device);
        let unfit = DescriptorSetLayoutBuilder::new()
            .add(0, DescriptorType::StorageImage, 1, ShaderStages::COMPUTE)
            .build(&mut device)
            .unwrap();
        let mut allocator = DescriptorPoolExpanding::new(&mut device, 2, &uniform_ratios()).unwrap();

        let stale = allocator.allocate(&mut device, uniform).unwrap();
        assert!(allocator.allocate(&mut device, unfit).is_err());
        assert_eq!(allocator.ready_pool_count(), 0);
        assert_eq!(allocator.full_pool_count(), 2);

        allocator.reset(&mut device).unwrap();
        assert_eq!(allocator.ready_pool_count(), 2);
        assert_eq!(allocator.full_pool_count(), 0);
        assert!(device.pools.values().all(|pool| pool.resets == 1 && pool.allocated == 0));
        assert!(device.update_descriptor_set(&stale, &[]).is_err());

        let pools_before = device.pools.len();
        for _ in 0..2 {
            allocator.allocate(&mut device, uniform).unwrap();
        }
        assert_eq!(device.pools.len(), pools_before);
        allocator.destroy_pools(&mut device);
    }

    #[test]
    fn test_non_exhaustion_error_keeps_pool_ready() {
        let mut device = MockDescriptorDevice::default();
        let layout = uniform_layout(&mut device);
        device.destroy_descriptor_set_layout(layout);
        let mut allocator = DescriptorPoolExpanding::new(&mut device, 2, &uniform_ratios()).unwrap();

        assert!(matches!(
            allocator.allocate(&mut device, layout),
            Err(DriverError::InvalidHandle { .. })
        ));
        assert_eq!(allocator.ready_pool_count(), 1);
        assert_eq!(allocator.full_pool_count(), 0);
        assert_eq!(device.allocation_attempts, 1);
        allocator.destroy_pools(&mut device);
    }

    #[test]
    fn test_empty_ratio_table_rejected() {
        let mut device = MockDescriptorDevice::default();
        assert!(DescriptorPoolExpanding::new(&mut device, 2, &[]).is_err());
        assert!(device.pools.is_empty());
    }
}
