//! Descriptor sets and resource binding
//!
//! Descriptor sets bind buffers, images and samplers to shader slots. Raw
//! layout/pool/set operations live on [`DescriptorDevice`], implemented by
//! every backend. [`DescriptorPool`] wraps one fixed-capacity pool and
//! [`DescriptorPoolExpanding`] grows a working set of them on demand.

pub mod expanding;
pub mod pool;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::barrier::ImageLayout;
use super::error::DriverResult;
use super::flags::ShaderStages;
use super::handles::{
    BufferId, DescriptorPoolId, DescriptorSetId, DescriptorSetLayoutId, ImageId, SamplerId,
};

pub use expanding::DescriptorPoolExpanding;
pub use pool::DescriptorPool;

/// Kind of resource a binding slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorType {
    /// Standalone sampler
    Sampler,
    /// Image and sampler pair
    CombinedImageSampler,
    /// Sampled image without sampler
    SampledImage,
    /// Read/write image
    StorageImage,
    /// Read-only formatted buffer view
    UniformTexelBuffer,
    /// Read/write formatted buffer view
    StorageTexelBuffer,
    /// Uniform buffer
    UniformBuffer,
    /// Storage buffer
    StorageBuffer,
    /// Uniform buffer with dynamic offset
    UniformBufferDynamic,
    /// Storage buffer with dynamic offset
    StorageBufferDynamic,
    /// Render pass input attachment
    InputAttachment,
}

impl DescriptorType {
    /// Whether the slot holds a buffer range
    pub const fn is_buffer(self) -> bool {
        matches!(
            self,
            Self::UniformBuffer
                | Self::StorageBuffer
                | Self::UniformBufferDynamic
                | Self::StorageBufferDynamic
        )
    }

    /// Whether the slot holds an image view without a sampler
    pub const fn is_image(self) -> bool {
        matches!(
            self,
            Self::SampledImage | Self::StorageImage | Self::InputAttachment
        )
    }
}

/// Relative demand for one descriptor type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolSizeRatio {
    /// Descriptor type
    pub ty: DescriptorType,
    /// Descriptors of this type reserved per set
    pub weight: f32,
}

impl PoolSizeRatio {
    /// Create a ratio entry
    pub const fn new(ty: DescriptorType, weight: f32) -> Self {
        Self { ty, weight }
    }

    /// Descriptors reserved for a pool of `sets` sets, at least one
    pub fn descriptor_count(&self, sets: u32) -> u32 {
        let count = (self.weight * sets as f32).round();
        if count >= u32::MAX as f32 {
            u32::MAX
        } else {
            (count as u32).max(1)
        }
    }
}

/// Capacity of one descriptor type in a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorPoolSize {
    /// Descriptor type
    pub ty: DescriptorType,
    /// Number of descriptors
    pub count: u32,
}

/// Pool sizes for `sets` sets distributed by `ratios`
pub fn pool_sizes(ratios: &[PoolSizeRatio], sets: u32) -> Vec<DescriptorPoolSize> {
    ratios
        .iter()
        .map(|ratio| DescriptorPoolSize {
            ty: ratio.ty,
            count: ratio.descriptor_count(sets),
        })
        .collect()
}

/// One slot of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutBinding {
    /// Binding slot
    pub binding: u32,
    /// Resource kind
    pub ty: DescriptorType,
    /// Array length
    pub count: u32,
    /// Stages reading the slot
    pub stages: ShaderStages,
}

/// Descriptors a set allocated with `bindings` consumes, per type
pub fn layout_requirements(bindings: &[DescriptorSetLayoutBinding]) -> HashMap<DescriptorType, u32> {
    let mut requirements = HashMap::new();
    for binding in bindings {
        *requirements.entry(binding.ty).or_insert(0) += binding.count;
    }
    requirements
}

/// Descriptor set layout builder for creating reusable layouts
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding of any type
    pub fn add(mut self, binding: u32, ty: DescriptorType, count: u32, stages: ShaderStages) -> Self {
        self.bindings.push(DescriptorSetLayoutBinding {
            binding,
            ty,
            count,
            stages,
        });
        self
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stages: ShaderStages) -> Self {
        self.add(binding, DescriptorType::UniformBuffer, 1, stages)
    }

    /// Add a combined image sampler binding
    pub fn add_combined_image_sampler(self, binding: u32, stages: ShaderStages) -> Self {
        self.add(binding, DescriptorType::CombinedImageSampler, 1, stages)
    }

    /// Add a storage buffer binding
    pub fn add_storage_buffer(self, binding: u32, stages: ShaderStages) -> Self {
        self.add(binding, DescriptorType::StorageBuffer, 1, stages)
    }

    /// Bindings collected so far
    pub fn bindings(&self) -> &[DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// Build the descriptor set layout
    pub fn build<D>(self, device: &mut D) -> DriverResult<DescriptorSetLayoutId>
    where
        D: DescriptorDevice + ?Sized,
    {
        device.create_descriptor_set_layout(&self.bindings)
    }
}

/// A descriptor set allocated from a pool
///
/// Sets are not freed individually; they stay valid until their pool is
/// reset or destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSet {
    /// Backend handle
    pub id: DescriptorSetId,
    /// Pool the set came from
    pub pool: DescriptorPoolId,
    /// Layout the set was allocated with
    pub layout: DescriptorSetLayoutId,
}

/// Resource written into a descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    /// Buffer range for uniform/storage buffer slots
    Buffer {
        /// Buffer bound
        buffer: BufferId,
        /// Start of the range
        offset: u64,
        /// Length of the range
        range: u64,
    },
    /// Image view for sampled/storage/input attachment slots
    Image {
        /// Image bound
        image: ImageId,
        /// Layout the image is in when the shader reads it
        layout: ImageLayout,
    },
    /// Standalone sampler
    Sampler(SamplerId),
    /// Image with its sampler
    CombinedImageSampler {
        /// Image bound
        image: ImageId,
        /// Sampler bound
        sampler: SamplerId,
        /// Layout the image is in when the shader reads it
        layout: ImageLayout,
    },
}

/// One slot update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Binding slot
    pub binding: u32,
    /// Array element within the slot
    pub array_element: u32,
    /// Resource written
    pub resource: DescriptorResource,
}

/// Descriptor set writer for updating descriptor sets
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetWriter {
    writes: Vec<DescriptorWrite>,
}

impl DescriptorSetWriter {
    /// Create a new descriptor set writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a buffer range to a binding
    pub fn write_buffer(mut self, binding: u32, buffer: BufferId, offset: u64, range: u64) -> Self {
        self.writes.push(DescriptorWrite {
            binding,
            array_element: 0,
            resource: DescriptorResource::Buffer {
                buffer,
                offset,
                range,
            },
        });
        self
    }

    /// Write an image sampler to a binding
    pub fn write_image(
        mut self,
        binding: u32,
        image: ImageId,
        sampler: SamplerId,
        layout: ImageLayout,
    ) -> Self {
        self.writes.push(DescriptorWrite {
            binding,
            array_element: 0,
            resource: DescriptorResource::CombinedImageSampler {
                image,
                sampler,
                layout,
            },
        });
        self
    }

    /// Write an arbitrary resource to an array element
    pub fn write(mut self, binding: u32, array_element: u32, resource: DescriptorResource) -> Self {
        self.writes.push(DescriptorWrite {
            binding,
            array_element,
            resource,
        });
        self
    }

    /// Execute all write operations
    pub fn update<D>(self, device: &mut D, set: &DescriptorSet) -> DriverResult<()>
    where
        D: DescriptorDevice + ?Sized,
    {
        device.update_descriptor_set(set, &self.writes)
    }
}

/// Raw descriptor operations every backend provides
pub trait DescriptorDevice {
    /// Create a set layout from its bindings
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> DriverResult<DescriptorSetLayoutId>;

    /// Destroy a set layout
    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutId);

    /// Create a fixed-capacity pool
    fn create_descriptor_pool(
        &mut self,
        max_sets: u32,
        sizes: &[DescriptorPoolSize],
    ) -> DriverResult<DescriptorPoolId>;

    /// Allocate one set
    ///
    /// A pool without room fails with [`DriverError::OutOfPoolMemory`] or
    /// [`DriverError::FragmentedPool`], never a generic error.
    ///
    /// [`DriverError::OutOfPoolMemory`]: super::error::DriverError::OutOfPoolMemory
    /// [`DriverError::FragmentedPool`]: super::error::DriverError::FragmentedPool
    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolId,
        layout: DescriptorSetLayoutId,
    ) -> DriverResult<DescriptorSet>;

    /// Release every set allocated from the pool, keeping the pool
    fn reset_descriptor_pool(&mut self, pool: DescriptorPoolId) -> DriverResult<()>;

    /// Destroy the pool and every set allocated from it
    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId);

    /// Write resources into a set
    fn update_descriptor_set(
        &mut self,
        set: &DescriptorSet,
        writes: &[DescriptorWrite],
    ) -> DriverResult<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Capacity-exact descriptor device for allocator tests

    use super::*;
    use crate::render::error::DriverError;
    use slotmap::SlotMap;

    pub struct MockPool {
        pub max_sets: u32,
        pub allocated: u32,
        pub remaining: HashMap<DescriptorType, u32>,
        pub capacity: HashMap<DescriptorType, u32>,
        pub resets: u32,
    }

    #[derive(Default)]
    pub struct MockDescriptorDevice {
        pub layouts: SlotMap<DescriptorSetLayoutId, Vec<DescriptorSetLayoutBinding>>,
        pub pools: SlotMap<DescriptorPoolId, MockPool>,
        pub sets: SlotMap<DescriptorSetId, DescriptorPoolId>,
        pub allocation_attempts: u32,
    }

    impl DescriptorDevice for MockDescriptorDevice {
        fn create_descriptor_set_layout(
            &mut self,
            bindings: &[DescriptorSetLayoutBinding],
        ) -> DriverResult<DescriptorSetLayoutId> {
            Ok(self.layouts.insert(bindings.to_vec()))
        }

        fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutId) {
            self.layouts.remove(layout);
        }

        fn create_descriptor_pool(
            &mut self,
            max_sets: u32,
            sizes: &[DescriptorPoolSize],
        ) -> DriverResult<DescriptorPoolId> {
            let capacity: HashMap<_, _> = sizes.iter().map(|s| (s.ty, s.count)).collect();
            Ok(self.pools.insert(MockPool {
                max_sets,
                allocated: 0,
                remaining: capacity.clone(),
                capacity,
                resets: 0,
            }))
        }

        fn allocate_descriptor_set(
            &mut self,
            pool: DescriptorPoolId,
            layout: DescriptorSetLayoutId,
        ) -> DriverResult<DescriptorSet> {
            self.allocation_attempts += 1;
            let bindings = self
                .layouts
                .get(layout)
                .ok_or(DriverError::InvalidHandle { kind: "descriptor set layout" })?;
            let requirements = layout_requirements(bindings);
            let state = self
                .pools
                .get_mut(pool)
                .ok_or(DriverError::InvalidHandle { kind: "descriptor pool" })?;

            if state.allocated >= state.max_sets
                || requirements
                    .iter()
                    .any(|(ty, need)| state.remaining.get(ty).copied().unwrap_or(0) < *need)
            {
                return Err(DriverError::OutOfPoolMemory);
            }
            state.allocated += 1;
            for (ty, need) in requirements {
                if let Some(left) = state.remaining.get_mut(&ty) {
                    *left -= need;
                }
            }
            Ok(DescriptorSet {
                id: self.sets.insert(pool),
                pool,
                layout,
            })
        }

        fn reset_descriptor_pool(&mut self, pool: DescriptorPoolId) -> DriverResult<()> {
            let state = self
                .pools
                .get_mut(pool)
                .ok_or(DriverError::InvalidHandle { kind: "descriptor pool" })?;
            state.allocated = 0;
            state.remaining = state.capacity.clone();
            state.resets += 1;
            self.sets.retain(|_, owner| *owner != pool);
            Ok(())
        }

        fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId) {
            self.pools.remove(pool);
            self.sets.retain(|_, owner| *owner != pool);
        }

        fn update_descriptor_set(
            &mut self,
            set: &DescriptorSet,
            _writes: &[DescriptorWrite],
        ) -> DriverResult<()> {
            if self.sets.contains_key(set.id) {
                Ok(())
            } else {
                Err(DriverError::InvalidHandle { kind: "descriptor set" })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_counts_round_and_floor_at_one() {
        let ratio = PoolSizeRatio::new(DescriptorType::UniformBuffer, 1.5);
        assert_eq!(ratio.descriptor_count(3), 5);
        assert_eq!(ratio.descriptor_count(2), 3);

        let sparse = PoolSizeRatio::new(DescriptorType::StorageImage, 0.1);
        assert_eq!(sparse.descriptor_count(2), 1);
    }

    #[test]
    fn test_layout_requirements_sum_per_type() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, ShaderStages::VERTEX)
            .add_uniform_buffer(1, ShaderStages::FRAGMENT)
            .add(2, DescriptorType::CombinedImageSampler, 4, ShaderStages::FRAGMENT);

        let requirements = layout_requirements(builder.bindings());
        assert_eq!(requirements[&DescriptorType::UniformBuffer], 2);
        assert_eq!(requirements[&DescriptorType::CombinedImageSampler], 4);
    }

    #[test]
    fn test_pool_sizes_follow_ratios() {
        let sizes = pool_sizes(
            &[
                PoolSizeRatio::new(DescriptorType::UniformBuffer, 2.0),
                PoolSizeRatio::new(DescriptorType::StorageBuffer, 0.5),
            ],
            10,
        );
        assert_eq!(
            sizes,
            vec![
                DescriptorPoolSize { ty: DescriptorType::UniformBuffer, count: 20 },
                DescriptorPoolSize { ty: DescriptorType::StorageBuffer, count: 5 },
            ]
        );
    }
}
