//! Descriptor layouts, pools and sets with exact capacity accounting

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use slotmap::SlotMap;

use super::HeadlessDriver;
use crate::render::descriptor::{
    layout_requirements, DescriptorDevice, DescriptorPoolSize, DescriptorResource,
    DescriptorSet, DescriptorSetLayoutBinding, DescriptorType, DescriptorWrite,
};
use crate::render::error::{DriverError, DriverResult};
use crate::render::flags::{BufferUsage, ImageUsage};
use crate::render::handles::{DescriptorPoolId, DescriptorSetId, DescriptorSetLayoutId, ImageId};

pub struct PoolRecord {
    max_sets: u32,
    capacity: HashMap<DescriptorType, u32>,
    remaining: HashMap<DescriptorType, u32>,
    sets: Vec<DescriptorSetId>,
}

pub struct SetRecord {
    pool: DescriptorPoolId,
    layout: Vec<DescriptorSetLayoutBinding>,
    bound: HashMap<(u32, u32), DescriptorResource>,
}

#[derive(Default)]
pub struct DescriptorStore {
    layouts: SlotMap<DescriptorSetLayoutId, Vec<DescriptorSetLayoutBinding>>,
    pools: SlotMap<DescriptorPoolId, PoolRecord>,
    sets: SlotMap<DescriptorSetId, SetRecord>,
}

impl DescriptorStore {
    pub fn bound(&self, set: DescriptorSetId, binding: u32, element: u32) -> Option<DescriptorResource> {
        self.sets.get(set)?.bound.get(&(binding, element)).copied()
    }

    pub fn live_pool_count(&self) -> usize {
        self.pools.len()
    }
}

impl HeadlessDriver {
    fn check_resource(&self, ty: DescriptorType, resource: &DescriptorResource) -> DriverResult<()> {
        let mismatch = || DriverError::contract(format!("{resource:?} cannot be written to a {ty:?} slot"));

        match *resource {
            DescriptorResource::Buffer {
                buffer,
                offset,
                range,
            } => {
                let texel = matches!(
                    ty,
                    DescriptorType::UniformTexelBuffer | DescriptorType::StorageTexelBuffer
                );
                if !ty.is_buffer() && !texel {
                    return Err(mismatch());
                }
                let storage = self
                    .buffers
                    .get(buffer)
                    .ok_or(DriverError::InvalidHandle { kind: "buffer" })?;
                let required = match ty {
                    DescriptorType::UniformBuffer
                    | DescriptorType::UniformBufferDynamic
                    | DescriptorType::UniformTexelBuffer => BufferUsage::UNIFORM,
                    _ => BufferUsage::STORAGE,
                };
                if !storage.buffer.usage.contains(required) {
                    return Err(DriverError::contract(format!(
                        "buffer bound to a {ty:?} slot lacks {required:?} usage"
                    )));
                }
                let size = storage.buffer.size();
                if range == 0 || offset.checked_add(range).map_or(true, |end| end > size) {
                    return Err(DriverError::OutOfBounds {
                        offset,
                        length: range,
                        size,
                    });
                }
            }
            DescriptorResource::Image { image, .. } => {
                let required = match ty {
                    DescriptorType::SampledImage => ImageUsage::SAMPLING,
                    DescriptorType::StorageImage => ImageUsage::STORAGE,
                    DescriptorType::InputAttachment => ImageUsage::INPUT_ATTACHMENT,
                    _ => return Err(mismatch()),
                };
                self.check_image_usage(image, required)?;
            }
            DescriptorResource::Sampler(sampler) => {
                if ty != DescriptorType::Sampler {
                    return Err(mismatch());
                }
                if !self.samplers.contains_key(sampler) {
                    return Err(DriverError::InvalidHandle { kind: "sampler" });
                }
            }
            DescriptorResource::CombinedImageSampler { image, sampler, .. } => {
                if ty != DescriptorType::CombinedImageSampler {
                    return Err(mismatch());
                }
                self.check_image_usage(image, ImageUsage::SAMPLING)?;
                if !self.samplers.contains_key(sampler) {
                    return Err(DriverError::InvalidHandle { kind: "sampler" });
                }
            }
        }
        Ok(())
    }

    fn check_image_usage(
        &self,
        image: ImageId,
        required: ImageUsage,
    ) -> DriverResult<()> {
        let storage = self
            .images
            .get(image)
            .ok_or(DriverError::InvalidHandle { kind: "image" })?;
        if storage.image.usage().contains(required) {
            Ok(())
        } else {
            Err(DriverError::contract(format!(
                "image bound to the slot lacks {required:?} usage"
            )))
        }
    }
}

impl DescriptorDevice for HeadlessDriver {
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> DriverResult<DescriptorSetLayoutId> {
        let mut seen = HashSet::new();
        for binding in bindings {
            if !seen.insert(binding.binding) {
                return Err(DriverError::contract(format!(
                    "binding {} declared twice in one layout",
                    binding.binding
                )));
            }
            if binding.count == 0 || binding.stages.is_empty() {
                return Err(DriverError::contract(format!(
                    "binding {} needs a non-zero count and at least one stage",
                    binding.binding
                )));
            }
        }
        Ok(self.descriptors.layouts.insert(bindings.to_vec()))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutId) {
        if self.descriptors.layouts.remove(layout).is_none() {
            warn!("destroy of unknown descriptor set layout ignored");
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
        let mut capacity = HashMap::new();
        for size in sizes {
            *capacity.entry(size.ty).or_insert(0) += size.count;
        }
        debug!("Created descriptor pool: {max_sets} sets, {sizes:?}");
        Ok(self.descriptors.pools.insert(PoolRecord {
            max_sets,
            remaining: capacity.clone(),
            capacity,
            sets: Vec::new(),
        }))
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolId,
        layout: DescriptorSetLayoutId,
    ) -> DriverResult<DescriptorSet> {
        let bindings = self
            .descriptors
            .layouts
            .get(layout)
            .ok_or(DriverError::InvalidHandle {
                kind: "descriptor set layout",
            })?
            .clone();
        let record = self
            .descriptors
            .pools
            .get_mut(pool)
            .ok_or(DriverError::InvalidHandle {
                kind: "descriptor pool",
            })?;

        if record.sets.len() as u32 >= record.max_sets {
            return Err(DriverError::OutOfPoolMemory);
        }
        let requirements = layout_requirements(&bindings);
        for (ty, count) in &requirements {
            if record.remaining.get(ty).copied().unwrap_or(0) < *count {
                return Err(DriverError::OutOfPoolMemory);
            }
        }
        for (ty, count) in &requirements {
            if let Some(remaining) = record.remaining.get_mut(ty) {
                *remaining -= count;
            }
        }

        let id = self.descriptors.sets.insert(SetRecord {
            pool,
            layout: bindings,
            bound: HashMap::new(),
        });
        record.sets.push(id);
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
        for set in record.sets.drain(..) {
            self.descriptors.sets.remove(set);
        }
        record.remaining = record.capacity.clone();
        Ok(())
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId) {
        match self.descriptors.pools.remove(pool) {
            Some(record) => {
                for set in record.sets {
                    self.descriptors.sets.remove(set);
                }
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
        if record.pool != set.pool {
            return Err(DriverError::InvalidHandle {
                kind: "descriptor set",
            });
        }

        for write in writes {
            let slot = record
                .layout
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
            self.check_resource(slot.ty, &write.resource)?;
        }

        if let Some(record) = self.descriptors.sets.get_mut(set.id) {
            for write in writes {
                record
                    .bound
                    .insert((write.binding, write.array_element), write.resource);
            }
        }
        Ok(())
    }
}
