//! Device memory selection and binding

use ash::{vk, Device};

use crate::render::error::{DriverError, DriverResult};
use crate::render::types::MemoryAccess;

/// Memory properties requested for a placement
pub fn placement_flags(memory: MemoryAccess) -> vk::MemoryPropertyFlags {
    match memory {
        MemoryAccess::HostVisible => {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        }
        MemoryAccess::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
    }
}

/// First memory type allowed by `type_filter` with every `properties` bit
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> DriverResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            type_filter & (1 << i) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or_else(|| DriverError::unsupported(format!("no memory type with {properties:?}")))
}

/// Allocate memory satisfying `requirements`
pub fn allocate(
    device: &Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> DriverResult<vk::DeviceMemory> {
    let memory_type_index =
        find_memory_type(memory_properties, requirements.memory_type_bits, properties)?;
    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe { device.allocate_memory(&alloc_info, None) }.map_err(|e| match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DriverError::OutOfDeviceMemory {
            requested: requirements.size,
        },
        other => other.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    #[test]
    fn test_find_memory_type_respects_filter() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            placement_flags(MemoryAccess::HostVisible),
            placement_flags(MemoryAccess::HostVisible) | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        let host = placement_flags(MemoryAccess::HostVisible);

        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b100, host).unwrap(), 2);
        assert!(matches!(
            find_memory_type(&props, 0b001, host),
            Err(DriverError::Unsupported { .. })
        ));
    }
}
