//! Descriptor layouts, pools and sets on `VkDescriptorPool`

use ash::vk;
use log::{debug, warn};
use slotmap::SlotMap;

use super::{conversions, VulkanDriver};
use crate::render::descriptor::{
    DescriptorDevice, DescriptorPoolSize, DescriptorResource, DescriptorSet,
    DescriptorSetLayoutBinding, DescriptorType, DescriptorWrite,
};
use crate::render::error::{DriverError, DriverResult};
use crate::render::handles::{DescriptorPoolId, DescriptorSetId, DescriptorSetLayoutId};

pub struct LayoutRecord {
    pub raw: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorSetLayoutBinding>,
}

pub struct PoolRecord {
    raw: vk::DescriptorPool,
    sets: Vec<DescriptorSetId>,
}

pub struct SetRecord {
    raw: vk::DescriptorSet,
    pool: DescriptorPoolId,
    layout: DescriptorSetLayoutId,
}

#[derive(Default)]
pub struct DescriptorTables {
    pub layouts: SlotMap<DescriptorSetLayoutId, LayoutRecord>,
    pools: SlotMap<DescriptorPoolId, PoolRecord>,
    sets: SlotMap<DescriptorSetId, SetRecord>,
}

impl DescriptorTables {
    /// Destroy every pool and layout still alive
    pub fn destroy_all(&mut self, device: &ash::Device) {
        self.sets.clear();
        for (_, pool) in self.pools.drain() {
            unsafe { device.destroy_descriptor_pool(pool.raw, None) };
        }
        for (_, layout) in self.layouts.drain() {
            unsafe { device.destroy_descriptor_set_layout(layout.raw, None) };
        }
    }
}

enum ResourceInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

impl VulkanDriver {
    fn resource_info(&self, ty: DescriptorType, resource: &DescriptorResource) -> DriverResult<ResourceInfo> {
        let mismatch = || DriverError::contract(format!("{resource:?} cannot be written to a {ty:?} slot"));

        match *resource {
            DescriptorResource::Buffer {
                buffer,
                offset,
                range,
            } => {
                if !ty.is_buffer() {
                    return Err(match ty {
                        DescriptorType::UniformTexelBuffer | DescriptorType::StorageTexelBuffer => {
                            DriverError::unsupported("texel buffer views")
                        }
                        _ => mismatch(),
                    });
                }
                let record = self
                    .buffers
                    .get(buffer)
                    .ok_or(DriverError::InvalidHandle { kind: "buffer" })?;
                Ok(ResourceInfo::Buffer(vk::DescriptorBufferInfo {
                    buffer: record.raw,
                    offset,
                    range,
                }))
            }
            DescriptorResource::Image { image, layout } => {
                if !ty.is_image() {
                    return Err(mismatch());
                }
                let record = self
                    .images
                    .get(image)
                    .ok_or(DriverError::InvalidHandle { kind: "image" })?;
                Ok(ResourceInfo::Image(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: record.view,
                    image_layout: conversions::image_layout(layout),
                }))
            }
            DescriptorResource::Sampler(sampler) => {
                if ty != DescriptorType::Sampler {
                    return Err(mismatch());
                }
                let raw = self
                    .samplers
                    .get(sampler)
                    .copied()
                    .ok_or(DriverError::InvalidHandle { kind: "sampler" })?;
                Ok(ResourceInfo::Image(vk::DescriptorImageInfo {
                    sampler: raw,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }))
            }
            DescriptorResource::CombinedImageSampler {
                image,
                sampler,
                layout,
            } => {
                if ty != DescriptorType::CombinedImageSampler {
                    return Err(mismatch());
                }
                let record = self
                    .images
                    .get(image)
                    .ok_or(DriverError::InvalidHandle { kind: "image" })?;
                let raw = self
                    .samplers
                    .get(sampler)
                    .copied()
                    .ok_or(DriverError::InvalidHandle { kind: "sampler" })?;
                Ok(ResourceInfo::Image(vk::DescriptorImageInfo {
                    sampler: raw,
                    image_view: record.view,
                    image_layout: conversions::image_layout(layout),
                }))
            }
        }
    }
}

impl DescriptorDevice for VulkanDriver {
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> DriverResult<DescriptorSetLayoutId> {
        let raw_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(conversions::descriptor_type(binding.ty))
                    .descriptor_count(binding.count)
                    .stage_flags(conversions::shader_stages(binding.stages))
                    .build()
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&raw_bindings);
        let raw = unsafe { self.device().create_descriptor_set_layout(&create_info, None) }?;
        Ok(self.descriptors.layouts.insert(LayoutRecord {
            raw,
            bindings: bindings.to_vec(),
        }))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutId) {
        match self.descriptors.layouts.remove(layout) {
            Some(record) => unsafe {
                self.device().destroy_descriptor_set_layout(record.raw, None);
            },
            None => warn!("destroy of unknown descriptor set layout ignored"),
        }
    }

    fn create_descriptor_pool(
        &mut self,
        max_sets: u32,
        sizes: &[DescriptorPoolSize],
    ) -> DriverResult<DescriptorPoolId> {
        if max_sets == 0 {
            return Err(DriverError::contract("descriptor pool needs at least one set"));
        }
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .filter(|size| size.count > 0)
            .map(|size| vk::DescriptorPoolSize {
                ty: conversions::descriptor_type(size.ty),
                descriptor_count: size.count,
            })
            .collect();
        if pool_sizes.is_empty() {
            return Err(DriverError::contract(
                "descriptor pool needs at least one descriptor type",
            ));
        }
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        let raw = unsafe { self.device().create_descriptor_pool(&create_info, None) }?;
        debug!("Created descriptor pool: {max_sets} sets, {sizes:?}");
        Ok(self.descriptors.pools.insert(PoolRecord {
            raw,
            sets: Vec::new(),
        }))
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolId,
        layout: DescriptorSetLayoutId,
    ) -> DriverResult<DescriptorSet> {
        let layout_raw = self
            .descriptors
            .layouts
            .get(layout)
            .ok_or(DriverError::InvalidHandle {
                kind: "descriptor set layout",
            })?
            .raw;
        let pool_raw = self
            .descriptors
            .pools
            .get(pool)
            .ok_or(DriverError::InvalidHandle {
                kind: "descriptor pool",
            })?
            .raw;

        let layouts = [layout_raw];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool_raw)
            .set_layouts(&layouts);
        // Pool exhaustion surfaces as OutOfPoolMemory/FragmentedPool through From<vk::Result>
        let raw = unsafe { self.device().allocate_descriptor_sets(&alloc_info) }?
            .into_iter()
            .next()
            .ok_or(DriverError::OutOfPoolMemory)?;

        let id = self.descriptors.sets.insert(SetRecord { raw, pool, layout });
        if let Some(record) = self.descriptors.pools.get_mut(pool) {
            record.sets.push(id);
        }
        Ok(DescriptorSet { id, pool, layout })
    }

    fn reset_descriptor_pool(&mut self, pool: DescriptorPoolId) -> DriverResult<()> {
        let record = self
            .descriptors
            .pools
            .get_mut(pool)
            .ok_or(DriverError::InvalidHandle {
                kind: "descriptor pool",
            })?;
        unsafe {
            self.context
                .raw()
                .reset_descriptor_pool(record.raw, vk::DescriptorPoolResetFlags::empty())
        }?;
        for set in record.sets.drain(..) {
            self.descriptors.sets.remove(set);
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId) {
        match self.descriptors.pools.remove(pool) {
            Some(record) => {
                for set in record.sets {
                    self.descriptors.sets.remove(set);
                }
                unsafe { self.device().destroy_descriptor_pool(record.raw, None) };
            }
            None => warn!("destroy of unknown descriptor pool ignored"),
        }
    }

    fn update_descriptor_set(
        &mut self,
        set: &DescriptorSet,
        writes: &[DescriptorWrite],
    ) -> DriverResult<()> {
        let record = self
            .descriptors
            .sets
            .get(set.id)
            .ok_or(DriverError::InvalidHandle {
                kind: "descriptor set",
            })?;
        let bindings = &self
            .descriptors
            .layouts
            .get(record.layout)
            .ok_or(DriverError::InvalidHandle {
                kind: "descriptor set layout",
            })?
            .bindings;

        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let slot = bindings
                .iter()
                .find(|binding| binding.binding == write.binding)
                .ok_or_else(|| {
                    DriverError::contract(format!("layout has no binding {}", write.binding))
                })?;
            if write.array_element >= slot.count {
                return Err(DriverError::contract(format!(
                    "array element {} outside binding {} of length {}",
                    write.array_element, write.binding, slot.count
                )));
            }
            infos.push((write, slot.ty, self.resource_info(slot.ty, &write.resource)?));
        }

        let raw_writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(write, ty, info)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(record.raw)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(conversions::descriptor_type(*ty));
                match info {
                    ResourceInfo::Buffer(info) => builder.buffer_info(std::slice::from_ref(info)).build(),
                    ResourceInfo::Image(info) => builder.image_info(std::slice::from_ref(info)).build(),
                }
            })
            .collect();
        unsafe { self.device().update_descriptor_sets(&raw_writes, &[]) };
        Ok(())
    }
}
