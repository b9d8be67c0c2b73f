//! Swapchain creation and per-image synchronization
//!
//! A swapchain record starts without a `VkSwapchainKHR`; the first resize
//! creates it and later resizes recreate it, handing the old one over as
//! `old_swapchain`. Each image gets a render-finished semaphore that the
//! presenting submission signals. Acquire semaphores rotate through a ring one
//! longer than the image count so a semaphore is never reused while the
//! compositor may still hold it.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device};
use log::info;

use super::conversions;
use crate::config::PresentMode;
use crate::render::error::{DriverError, DriverResult};
use crate::render::handles::{FramebufferId, ImageId, SurfaceId};
use crate::render::types::DataFormat;

/// Driver-side state of one swapchain
pub struct SwapchainRecord {
    pub surface: SurfaceId,
    pub raw: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub data_format: DataFormat,
    pub extent: (u32, u32),
    pub render_pass: vk::RenderPass,
    pub images: Vec<ImageId>,
    pub framebuffers: Vec<FramebufferId>,
    pub render_finished: Vec<vk::Semaphore>,
    pub acquire_semaphores: Vec<vk::Semaphore>,
    pub next_semaphore: usize,
    pub acquired: Option<u32>,
    pub resize_required: bool,
}

impl SwapchainRecord {
    /// Record for a swapchain that has not been sized yet
    pub fn r#unsized(surface: SurfaceId) -> Self {
        Self {
            surface,
            raw: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            data_format: DataFormat::B8G8R8A8Unorm,
            extent: (0, 0),
            render_pass: vk::RenderPass::null(),
            images: Vec::new(),
            framebuffers: Vec::new(),
            render_finished: Vec::new(),
            acquire_semaphores: Vec::new(),
            next_semaphore: 0,
            acquired: None,
            resize_required: true,
        }
    }

    /// Next acquire semaphore of the ring
    pub fn take_acquire_semaphore(&mut self) -> Option<vk::Semaphore> {
        let semaphore = *self.acquire_semaphores.get(self.next_semaphore)?;
        self.next_semaphore = (self.next_semaphore + 1) % self.acquire_semaphores.len();
        Some(semaphore)
    }
}

/// Newly created swapchain and its images
pub struct SwapchainBuild {
    pub raw: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub data_format: DataFormat,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub images: Vec<vk::Image>,
}

/// Prefer 8-bit BGRA with sRGB nonlinear color space, else any describable format
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<(vk::SurfaceFormatKHR, DataFormat)> {
    let preferred = available.iter().find(|sf| {
        sf.format == vk::Format::B8G8R8A8_UNORM
            && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    preferred
        .into_iter()
        .chain(available.iter())
        .find_map(|sf| conversions::data_format(sf.format).map(|data| (*sf, data)))
}

/// Configured mode when the surface offers it, FIFO otherwise
pub fn choose_present_mode(preferred: PresentMode, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    let wanted = match preferred {
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
    };
    if available.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, or the requested size clamped to the surface limits
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, size: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: size.0.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: size.1.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Requested count raised to the surface minimum and capped at its maximum
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let count = desired.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Create (or recreate from `old`) a swapchain for `surface`
///
/// Returns `None` when the surface currently has no area.
#[allow(clippy::too_many_arguments)]
pub fn build(
    loader: &SwapchainLoader,
    surface_loader: &Surface,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    old: vk::SwapchainKHR,
    size: (u32, u32),
    desired_image_count: u32,
    present_mode: PresentMode,
) -> DriverResult<Option<SwapchainBuild>> {
    let caps = unsafe {
        surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
    }?;
    let extent = choose_extent(&caps, size);
    if extent.width == 0 || extent.height == 0 {
        return Ok(None);
    }

    let formats =
        unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }?;
    let (format, data_format) = choose_surface_format(&formats)
        .ok_or_else(|| DriverError::unsupported("no supported swapchain surface format"))?;
    let modes = unsafe {
        surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
    }?;
    let present_mode = choose_present_mode(present_mode, &modes);
    let image_count = choose_image_count(&caps, desired_image_count);

    let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
        | (caps.supported_usage_flags
            & (vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST));
    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(usage)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old);

    let raw = unsafe { loader.create_swapchain(&create_info, None) }?;
    let images = match unsafe { loader.get_swapchain_images(raw) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { loader.destroy_swapchain(raw, None) };
            return Err(e.into());
        }
    };
    info!(
        "Swapchain created: {}x{}, {} images, {:?}, {:?}",
        extent.width,
        extent.height,
        images.len(),
        format.format,
        present_mode
    );

    Ok(Some(SwapchainBuild {
        raw,
        format,
        data_format,
        extent,
        usage,
        images,
    }))
}

/// Single color attachment pass the swapchain framebuffers are created against
pub fn create_render_pass(device: &Device, format: vk::Format) -> DriverResult<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();
    let attachments = [color_attachment];

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();
    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .build();
    let subpasses = [subpass];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses);
    Ok(unsafe { device.create_render_pass(&create_info, None) }?)
}

/// `count` binary semaphores, destroying the partial set on failure
pub fn create_semaphores(device: &Device, count: usize) -> DriverResult<Vec<vk::Semaphore>> {
    let info = vk::SemaphoreCreateInfo::builder();
    let mut semaphores = Vec::with_capacity(count);
    for _ in 0..count {
        match unsafe { device.create_semaphore(&info, None) } {
            Ok(semaphore) => semaphores.push(semaphore),
            Err(e) => {
                destroy_semaphores(device, &mut semaphores);
                return Err(e.into());
            }
        }
    }
    Ok(semaphores)
}

pub fn destroy_semaphores(device: &Device, semaphores: &mut Vec<vk::Semaphore>) {
    for semaphore in semaphores.drain(..) {
        unsafe { device.destroy_semaphore(semaphore, None) };
    }
}
