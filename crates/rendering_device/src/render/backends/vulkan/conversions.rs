//! Driver types to Vulkan types
//!
//! Stage, access, aspect and shader-stage bits share Vulkan's numbering and
//! convert with `from_raw`. Everything else is mapped by hand.

use ash::vk;

use crate::render::barrier::ImageLayout;
use crate::render::descriptor::DescriptorType;
use crate::render::flags::{
    BarrierAccess, BufferUsage, ImageAspect, ImageUsage, PipelineStages, ShaderStages,
};
use crate::render::types::{
    CompareOperator, DataFormat, ImageSubresourceLayers, ImageSubresourceRange, SampleCount,
    SamplerBorderColor, SamplerFilter, SamplerRepeatMode, Swizzle, TextureType,
};

pub fn pipeline_stages(stages: PipelineStages) -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::from_raw(stages.bits())
}

pub fn access(access: BarrierAccess) -> vk::AccessFlags {
    vk::AccessFlags::from_raw(access.bits())
}

pub fn aspect(aspect: ImageAspect) -> vk::ImageAspectFlags {
    vk::ImageAspectFlags::from_raw(aspect.bits())
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::from_raw(stages.bits())
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    let table = [
        (BufferUsage::COPY_SOURCE, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::COPY_DESTINATION, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
    ];
    for (ours, theirs) in table {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

/// `CPU_READ` selects linear tiling instead of a usage bit
pub fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    let table = [
        (ImageUsage::SAMPLING, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (
            ImageUsage::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ),
        (ImageUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (ImageUsage::INPUT_ATTACHMENT, vk::ImageUsageFlags::INPUT_ATTACHMENT),
        (ImageUsage::COPY_SOURCE, vk::ImageUsageFlags::TRANSFER_SRC),
        (ImageUsage::COPY_DESTINATION, vk::ImageUsageFlags::TRANSFER_DST),
    ];
    for (ours, theirs) in table {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub fn format(format: DataFormat) -> vk::Format {
    match format {
        DataFormat::R8Unorm => vk::Format::R8_UNORM,
        DataFormat::R8G8Unorm => vk::Format::R8G8_UNORM,
        DataFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        DataFormat::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        DataFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        DataFormat::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        DataFormat::R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
        DataFormat::R32Uint => vk::Format::R32_UINT,
        DataFormat::R32Sfloat => vk::Format::R32_SFLOAT,
        DataFormat::R32G32Sfloat => vk::Format::R32G32_SFLOAT,
        DataFormat::R32G32B32Sfloat => vk::Format::R32G32B32_SFLOAT,
        DataFormat::R32G32B32A32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
        DataFormat::D16Unorm => vk::Format::D16_UNORM,
        DataFormat::D32Sfloat => vk::Format::D32_SFLOAT,
        DataFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        DataFormat::Bc1RgbaUnormBlock => vk::Format::BC1_RGBA_UNORM_BLOCK,
        DataFormat::Bc3UnormBlock => vk::Format::BC3_UNORM_BLOCK,
    }
}

/// Swapchain formats the driver can describe
pub fn data_format(format: vk::Format) -> Option<DataFormat> {
    match format {
        vk::Format::B8G8R8A8_UNORM => Some(DataFormat::B8G8R8A8Unorm),
        vk::Format::B8G8R8A8_SRGB => Some(DataFormat::B8G8R8A8Srgb),
        vk::Format::R8G8B8A8_UNORM => Some(DataFormat::R8G8B8A8Unorm),
        vk::Format::R8G8B8A8_SRGB => Some(DataFormat::R8G8B8A8Srgb),
        _ => None,
    }
}

pub fn image_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachmentOptimal => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachmentOptimal => {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        }
        ImageLayout::DepthStencilReadOnlyOptimal => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ImageLayout::ShaderReadOnlyOptimal => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrcOptimal => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDstOptimal => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::Preinitialized => vk::ImageLayout::PREINITIALIZED,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

pub fn image_type(texture_type: TextureType) -> vk::ImageType {
    match texture_type {
        TextureType::Type1D | TextureType::Type1DArray => vk::ImageType::TYPE_1D,
        TextureType::Type2D
        | TextureType::Type2DArray
        | TextureType::Cube
        | TextureType::CubeArray => vk::ImageType::TYPE_2D,
        TextureType::Type3D => vk::ImageType::TYPE_3D,
    }
}

pub fn image_view_type(texture_type: TextureType) -> vk::ImageViewType {
    match texture_type {
        TextureType::Type1D => vk::ImageViewType::TYPE_1D,
        TextureType::Type2D => vk::ImageViewType::TYPE_2D,
        TextureType::Type3D => vk::ImageViewType::TYPE_3D,
        TextureType::Cube => vk::ImageViewType::CUBE,
        TextureType::Type1DArray => vk::ImageViewType::TYPE_1D_ARRAY,
        TextureType::Type2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureType::CubeArray => vk::ImageViewType::CUBE_ARRAY,
    }
}

pub fn samples(samples: SampleCount) -> vk::SampleCountFlags {
    match samples {
        SampleCount::X1 => vk::SampleCountFlags::TYPE_1,
        SampleCount::X2 => vk::SampleCountFlags::TYPE_2,
        SampleCount::X4 => vk::SampleCountFlags::TYPE_4,
        SampleCount::X8 => vk::SampleCountFlags::TYPE_8,
        SampleCount::X16 => vk::SampleCountFlags::TYPE_16,
    }
}

pub fn swizzle(swizzle: Swizzle) -> vk::ComponentSwizzle {
    match swizzle {
        Swizzle::Identity => vk::ComponentSwizzle::IDENTITY,
        Swizzle::Zero => vk::ComponentSwizzle::ZERO,
        Swizzle::One => vk::ComponentSwizzle::ONE,
        Swizzle::R => vk::ComponentSwizzle::R,
        Swizzle::G => vk::ComponentSwizzle::G,
        Swizzle::B => vk::ComponentSwizzle::B,
        Swizzle::A => vk::ComponentSwizzle::A,
    }
}

pub fn component_mapping(channels: [Swizzle; 4]) -> vk::ComponentMapping {
    let [r, g, b, a] = channels.map(swizzle);
    vk::ComponentMapping { r, g, b, a }
}

pub fn subresource_range(range: &ImageSubresourceRange) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect(range.aspect),
        base_mip_level: range.base_mip,
        level_count: range.mip_count,
        base_array_layer: range.base_layer,
        layer_count: range.layer_count,
    }
}

pub fn subresource_layers(layers: &ImageSubresourceLayers) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: aspect(layers.aspect),
        mip_level: layers.mip_level,
        base_array_layer: layers.base_layer,
        layer_count: layers.layer_count,
    }
}

pub fn offset(offset: [u32; 3]) -> vk::Offset3D {
    vk::Offset3D {
        x: offset[0] as i32,
        y: offset[1] as i32,
        z: offset[2] as i32,
    }
}

pub fn extent(extent: [u32; 3]) -> vk::Extent3D {
    vk::Extent3D {
        width: extent[0],
        height: extent[1],
        depth: extent[2],
    }
}

pub fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        DescriptorType::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorType::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        DescriptorType::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
    }
}

pub fn filter(filter: SamplerFilter) -> vk::Filter {
    match filter {
        SamplerFilter::Nearest => vk::Filter::NEAREST,
        SamplerFilter::Linear => vk::Filter::LINEAR,
    }
}

pub fn mipmap_mode(filter: SamplerFilter) -> vk::SamplerMipmapMode {
    match filter {
        SamplerFilter::Nearest => vk::SamplerMipmapMode::NEAREST,
        SamplerFilter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn address_mode(mode: SamplerRepeatMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerRepeatMode::Repeat => vk::SamplerAddressMode::REPEAT,
        SamplerRepeatMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        SamplerRepeatMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerRepeatMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        SamplerRepeatMode::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
    }
}

pub fn compare_op(op: CompareOperator) -> vk::CompareOp {
    match op {
        CompareOperator::Never => vk::CompareOp::NEVER,
        CompareOperator::Less => vk::CompareOp::LESS,
        CompareOperator::Equal => vk::CompareOp::EQUAL,
        CompareOperator::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOperator::Greater => vk::CompareOp::GREATER,
        CompareOperator::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOperator::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOperator::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn border_color(color: SamplerBorderColor) -> vk::BorderColor {
    match color {
        SamplerBorderColor::FloatTransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        SamplerBorderColor::IntTransparentBlack => vk::BorderColor::INT_TRANSPARENT_BLACK,
        SamplerBorderColor::FloatOpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        SamplerBorderColor::IntOpaqueBlack => vk::BorderColor::INT_OPAQUE_BLACK,
        SamplerBorderColor::FloatOpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
        SamplerBorderColor::IntOpaqueWhite => vk::BorderColor::INT_OPAQUE_WHITE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_bit_layouts() {
        assert_eq!(
            pipeline_stages(PipelineStages::TRANSFER | PipelineStages::FRAGMENT_SHADER),
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
        assert_eq!(
            access(BarrierAccess::TRANSFER_WRITE | BarrierAccess::SHADER_READ),
            vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::SHADER_READ
        );
        assert_eq!(
            shader_stages(ShaderStages::VERTEX | ShaderStages::FRAGMENT),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            aspect(ImageAspect::DEPTH | ImageAspect::STENCIL),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_usage_translation() {
        assert_eq!(
            buffer_usage(BufferUsage::VERTEX | BufferUsage::COPY_DESTINATION),
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(
            image_usage(ImageUsage::SAMPLING | ImageUsage::CPU_READ),
            vk::ImageUsageFlags::SAMPLED
        );
    }

    #[test]
    fn test_swapchain_format_round_trip() {
        for data in [DataFormat::B8G8R8A8Unorm, DataFormat::R8G8B8A8Srgb] {
            assert_eq!(data_format(format(data)), Some(data));
        }
        assert_eq!(data_format(vk::Format::A2B10G10R10_UNORM_PACK32), None);
    }
}
