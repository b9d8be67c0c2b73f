//! Vulkan backend
//!
//! [`VulkanDriver`] implements [`RenderingDeviceDriver`] on top of ash. Every
//! driver handle indexes a table of raw Vulkan objects; the driver owns all of
//! them and destroys whatever is still alive when it is dropped.
//!
//! Command buffer lifecycle is always tracked so its state can be queried.
//! Recording-state checks and image layout tracking only run in debug builds;
//! release builds trust the caller and leave detection to the validation
//! layers.

mod context;
mod conversions;
mod descriptor;
mod memory;
mod swapchain;

use std::collections::HashSet;
use std::io::Cursor;
use std::ptr::NonNull;

use ash::vk;
use log::{debug, info, warn};
use raw_window_handle::RawDisplayHandle;
use slotmap::SlotMap;

pub use self::context::VulkanContext;
use self::descriptor::DescriptorTables;
use self::swapchain::{SwapchainBuild, SwapchainRecord};
use crate::config::DriverConfig;
use crate::render::barrier::{
    BufferBarrier, ImageBarrier, ImageLayout, LayoutOverlay, LayoutTracker, LayoutUse, MemoryBarrier,
};
use crate::render::command::{CommandBufferState, CommandBufferTracking, CommandBufferType};
use crate::render::descriptor::DescriptorDevice;
use crate::render::driver::{
    AcquireOutcome, BackendKind, DeviceInfo, PresentOutcome, QueueFamilyInfo,
    RenderingDeviceDriver, SurfaceTarget, SwapchainFrame,
};
use crate::render::error::{DriverError, DriverResult, ShaderError};
use crate::render::flags::{ImageUsage, PipelineStages, QueueFamilyFlags};
use crate::render::handles::{
    BufferId, CommandBufferId, CommandPoolId, CommandQueueId, FenceId, FramebufferId, ImageId,
    QueueFamily, SamplerId, SemaphoreId, ShaderId, SurfaceId, SwapchainId,
};
use crate::render::resources::{Buffer, Image, Mappable, Transferable};
use crate::render::shader::{
    reflect_shader, GlslcCompiler, Shader, ShaderCompiler, ShaderLanguage, ShaderStage,
    ShaderStageSpirv,
};
use crate::render::types::{
    BufferCopyRegion, BufferDescription, BufferImageCopyRegion, DataFormat, ImageCopyRegion,
    ImageFormat, ImageSubresourceLayers, ImageSubresourceRange, ImageView, MemoryAccess,
    SampleCount, SamplerState, TextureType,
};

const CHECKED: bool = cfg!(debug_assertions);

struct BufferRecord {
    buffer: Buffer,
    raw: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: Option<NonNull<u8>>,
}

struct ImageRecord {
    image: Image,
    raw: vk::Image,
    view: vk::ImageView,
    /// `None` for swapchain images, which the swapchain owns
    memory: Option<vk::DeviceMemory>,
    mapped: Option<NonNull<u8>>,
    map_active: bool,
}

struct CommandPoolRecord {
    raw: vk::CommandPool,
    family: QueueFamily,
    kind: CommandBufferType,
    buffers: Vec<CommandBufferId>,
}

struct CommandBufferRecord {
    raw: vk::CommandBuffer,
    tracking: CommandBufferTracking,
    /// Layout changes recorded since the last begin, debug builds only
    layouts: LayoutOverlay,
}

struct QueueRecord {
    raw: vk::Queue,
    family: QueueFamily,
    index: u32,
    /// Acquire semaphores the next submission on this queue waits on
    pending_waits: Vec<vk::Semaphore>,
}

struct SurfaceRecord {
    raw: vk::SurfaceKHR,
    width: u32,
    height: u32,
}

/// Vulkan rendering device
pub struct VulkanDriver {
    context: VulkanContext,
    config: DriverConfig,
    compiler: Option<Box<dyn ShaderCompiler>>,
    buffers: SlotMap<BufferId, BufferRecord>,
    images: SlotMap<ImageId, ImageRecord>,
    samplers: SlotMap<SamplerId, vk::Sampler>,
    shaders: SlotMap<ShaderId, Vec<vk::ShaderModule>>,
    command_pools: SlotMap<CommandPoolId, CommandPoolRecord>,
    command_buffers: SlotMap<CommandBufferId, CommandBufferRecord>,
    queues: SlotMap<CommandQueueId, QueueRecord>,
    fences: SlotMap<FenceId, vk::Fence>,
    semaphores: SlotMap<SemaphoreId, vk::Semaphore>,
    surfaces: SlotMap<SurfaceId, SurfaceRecord>,
    swapchains: SlotMap<SwapchainId, SwapchainRecord>,
    framebuffers: SlotMap<FramebufferId, vk::Framebuffer>,
    layouts: LayoutTracker,
    descriptors: DescriptorTables,
}

// Mapped pointers are only dereferenced through `&mut self`.
unsafe impl Send for VulkanDriver {}

impl VulkanDriver {
    /// Create a driver on the first suitable GPU
    ///
    /// `display` is the display connection of the windowing layer; without
    /// it surfaces cannot be created and the device works offscreen only.
    pub fn new(config: &DriverConfig, display: Option<RawDisplayHandle>) -> DriverResult<Self> {
        config
            .validate()
            .map_err(DriverError::InitializationFailed)?;
        let context = VulkanContext::new(config, display)?;

        Ok(Self {
            context,
            config: config.clone(),
            compiler: Some(Box::new(GlslcCompiler::from_env())),
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            command_pools: SlotMap::with_key(),
            command_buffers: SlotMap::with_key(),
            queues: SlotMap::with_key(),
            fences: SlotMap::with_key(),
            semaphores: SlotMap::with_key(),
            surfaces: SlotMap::with_key(),
            swapchains: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            layouts: LayoutTracker::new(),
            descriptors: DescriptorTables::default(),
        })
    }

    /// Replace the compiler used by `compile_spirv_from_source`
    pub fn with_shader_compiler(mut self, compiler: Box<dyn ShaderCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Instance and device the driver runs on
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    fn device(&self) -> &ash::Device {
        self.context.raw()
    }

    fn family_flags(properties: &vk::QueueFamilyProperties) -> QueueFamilyFlags {
        let mut flags = QueueFamilyFlags::from_bits_truncate(properties.queue_flags.as_raw());
        // Graphics and compute queues accept transfer commands implicitly
        if flags.intersects(QueueFamilyFlags::GRAPHICS | QueueFamilyFlags::COMPUTE) {
            flags |= QueueFamilyFlags::TRANSFER;
        }
        flags
    }

    fn family_properties(&self, family: QueueFamily) -> DriverResult<&vk::QueueFamilyProperties> {
        self.context
            .physical
            .queue_families
            .get(family.index() as usize)
            .ok_or_else(|| DriverError::contract(format!("queue family {} does not exist", family.index())))
    }

    fn queue_record(&self, queue: CommandQueueId) -> DriverResult<&QueueRecord> {
        self.queues
            .get(queue)
            .ok_or(DriverError::InvalidHandle { kind: "command queue" })
    }

    fn surface_loader(&self) -> DriverResult<&ash::extensions::khr::Surface> {
        self.context
            .instance
            .surface_loader
            .as_ref()
            .ok_or_else(|| DriverError::unsupported("presentation: driver was created without a display"))
    }

    fn can_present(&self, family: QueueFamily, surface: vk::SurfaceKHR) -> DriverResult<bool> {
        let loader = self.surface_loader()?;
        Ok(unsafe {
            loader.get_physical_device_surface_support(
                self.context.physical.device,
                family.index(),
                surface,
            )
        }?)
    }

    fn buffer_record(&self, buffer: BufferId) -> DriverResult<&BufferRecord> {
        self.buffers
            .get(buffer)
            .ok_or(DriverError::InvalidHandle { kind: "buffer" })
    }

    fn image_record(&self, image: ImageId) -> DriverResult<&ImageRecord> {
        self.images
            .get(image)
            .ok_or(DriverError::InvalidHandle { kind: "image" })
    }

    fn command_buffer(&self, cb: CommandBufferId) -> DriverResult<&CommandBufferRecord> {
        self.command_buffers
            .get(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })
    }

    fn command_buffer_mut(&mut self, cb: CommandBufferId) -> DriverResult<&mut CommandBufferRecord> {
        self.command_buffers
            .get_mut(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })
    }

    /// Raw buffer to record into, checking its state in debug builds
    fn recording(&self, cb: CommandBufferId, operation: &'static str) -> DriverResult<vk::CommandBuffer> {
        let record = self.command_buffer(cb)?;
        if CHECKED {
            record.tracking.record(operation)?;
        }
        Ok(record.raw)
    }

    fn expect_transfer_layout(
        &self,
        cb: CommandBufferId,
        image: ImageId,
        range: &ImageSubresourceRange,
        layout: ImageLayout,
        source: bool,
        operation: &str,
    ) -> DriverResult<Option<LayoutUse>> {
        if !CHECKED {
            return Ok(None);
        }
        let allowed = if source {
            layout.allows_transfer_source()
        } else {
            layout.allows_transfer_destination()
        };
        if !allowed {
            return Err(DriverError::contract(format!(
                "{operation} cannot use an image in {layout:?}"
            )));
        }
        let overlay = &self.command_buffer(cb)?.layouts;
        self.layouts
            .expect(overlay, image, range, layout, operation)
            .map(Some)
    }

    fn record_layout_uses(
        &mut self,
        cb: CommandBufferId,
        uses: Vec<Option<LayoutUse>>,
    ) -> DriverResult<()> {
        let record = self
            .command_buffers
            .get_mut(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })?;
        for used in uses.into_iter().flatten() {
            record.layouts.record(used);
        }
        Ok(())
    }

    fn create_view(
        &self,
        raw: vk::Image,
        format: &ImageFormat,
        view: &ImageView,
    ) -> DriverResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(raw)
            .view_type(conversions::image_view_type(format.texture_type))
            .format(conversions::format(view.format))
            .components(conversions::component_mapping(view.swizzle))
            .subresource_range(conversions::subresource_range(&ImageSubresourceRange::whole(
                format,
            )));
        Ok(unsafe { self.device().create_image_view(&create_info, None) }?)
    }

    fn create_image_objects(
        &self,
        format: &ImageFormat,
        view: &ImageView,
    ) -> DriverResult<(vk::Image, vk::DeviceMemory, vk::ImageView, Option<NonNull<u8>>)> {
        let host_readable = format.usage.contains(ImageUsage::CPU_READ);
        let tiling = if host_readable {
            vk::ImageTiling::LINEAR
        } else {
            vk::ImageTiling::OPTIMAL
        };
        let mut usage = conversions::image_usage(format.usage);
        if usage.is_empty() {
            usage = vk::ImageUsageFlags::TRANSFER_DST;
        }
        let mut flags = vk::ImageCreateFlags::empty();
        if matches!(format.texture_type, TextureType::Cube | TextureType::CubeArray) {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        if view.format != format.format {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        }
        let image_type = conversions::image_type(format.texture_type);
        let vk_format = conversions::format(format.format);

        // Unsupported combinations come back as ERROR_FORMAT_NOT_SUPPORTED
        unsafe {
            self.context
                .instance
                .instance
                .get_physical_device_image_format_properties(
                    self.context.physical.device,
                    vk_format,
                    image_type,
                    tiling,
                    usage,
                    flags,
                )
        }?;

        let create_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(image_type)
            .format(vk_format)
            .extent(vk::Extent3D {
                width: format.width,
                height: format.height,
                depth: format.depth,
            })
            .mip_levels(format.mipmaps)
            .array_layers(format.array_layers)
            .samples(conversions::samples(format.samples))
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let device = self.device();
        let raw = unsafe { device.create_image(&create_info, None) }?;
        let requirements = unsafe { device.get_image_memory_requirements(raw) };
        let placement = if host_readable {
            MemoryAccess::HostVisible
        } else {
            MemoryAccess::GpuOnly
        };
        let memory = match memory::allocate(
            device,
            &self.context.physical.memory_properties,
            requirements,
            memory::placement_flags(placement),
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(raw, None) };
                return Err(e);
            }
        };

        let bound = unsafe { device.bind_image_memory(raw, memory, 0) }
            .map_err(DriverError::from)
            .and_then(|()| self.create_view(raw, format, view));
        let view = match bound {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(raw, None);
                    device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        let mapped = if host_readable {
            match unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) } {
                Ok(ptr) => NonNull::new(ptr.cast::<u8>()),
                Err(e) => {
                    unsafe {
                        device.destroy_image_view(view, None);
                        device.destroy_image(raw, None);
                        device.free_memory(memory, None);
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        Ok((raw, memory, view, mapped))
    }

    fn release_image(&mut self, image: ImageId) {
        let Some(record) = self.images.remove(image) else {
            return;
        };
        self.layouts.forget(image);
        let device = self.context.raw();
        unsafe {
            device.destroy_image_view(record.view, None);
            if let Some(memory) = record.memory {
                if record.mapped.is_some() {
                    device.unmap_memory(memory);
                }
                device.destroy_image(record.raw, None);
                device.free_memory(memory, None);
            }
        }
    }

    fn wait_idle(&self) {
        if let Err(e) = unsafe { self.device().device_wait_idle() } {
            warn!("device_wait_idle failed: {e:?}");
        }
    }

    /// Destroy everything a resize recreates, including the raw swapchain
    fn destroy_swapchain_resources(&mut self, swapchain: SwapchainId) {
        let Some(record) = self.swapchains.get_mut(swapchain) else {
            return;
        };
        let images = std::mem::take(&mut record.images);
        let framebuffers = std::mem::take(&mut record.framebuffers);
        let mut semaphores = std::mem::take(&mut record.render_finished);
        semaphores.append(&mut record.acquire_semaphores);
        let render_pass = std::mem::replace(&mut record.render_pass, vk::RenderPass::null());
        let raw = std::mem::replace(&mut record.raw, vk::SwapchainKHR::null());
        record.acquired = None;
        record.next_semaphore = 0;

        for framebuffer in framebuffers {
            if let Some(raw) = self.framebuffers.remove(framebuffer) {
                unsafe { self.context.raw().destroy_framebuffer(raw, None) };
            }
        }
        for image in images {
            self.release_image(image);
        }
        for queue in self.queues.values_mut() {
            queue.pending_waits.retain(|semaphore| !semaphores.contains(semaphore));
        }
        let device = self.context.raw();
        swapchain::destroy_semaphores(device, &mut semaphores);
        unsafe {
            if render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(render_pass, None);
            }
        }
        if raw != vk::SwapchainKHR::null() {
            if let Some(loader) = &self.context.device.swapchain_loader {
                unsafe { loader.destroy_swapchain(raw, None) };
            }
        }
    }

    /// Wrap the images of a freshly built swapchain
    fn populate_swapchain(&mut self, swapchain: SwapchainId, build: SwapchainBuild) -> DriverResult<()> {
        let device = self.context.raw().clone();
        let (width, height) = (build.extent.width, build.extent.height);
        let mut usage = ImageUsage::COLOR_ATTACHMENT;
        if build.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
            usage |= ImageUsage::COPY_SOURCE;
        }
        if build.usage.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            usage |= ImageUsage::COPY_DESTINATION;
        }
        let format = ImageFormat::new_2d(build.data_format, width, height, usage);
        let view = ImageView::new(build.data_format);

        let render_pass = swapchain::create_render_pass(&device, build.format.format)?;
        if let Some(record) = self.swapchains.get_mut(swapchain) {
            record.raw = build.raw;
            record.format = build.format;
            record.data_format = build.data_format;
            record.extent = (width, height);
            record.render_pass = render_pass;
        }

        for raw in &build.images {
            let view_raw = self.create_view(*raw, &format, &view)?;
            let id = self.images.insert_with_key(|id| ImageRecord {
                image: Image {
                    id,
                    format,
                    view,
                },
                raw: *raw,
                view: view_raw,
                memory: None,
                mapped: None,
                map_active: false,
            });
            self.layouts.register(id, &format, ImageLayout::Undefined);

            let attachments = [view_raw];
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(width)
                .height(height)
                .layers(1);
            let framebuffer = unsafe { device.create_framebuffer(&create_info, None) };
            let framebuffer = framebuffer.map(|raw| self.framebuffers.insert(raw));
            if let Some(record) = self.swapchains.get_mut(swapchain) {
                record.images.push(id);
                if let Ok(framebuffer) = framebuffer {
                    record.framebuffers.push(framebuffer);
                }
            }
            framebuffer?;
        }

        let count = build.images.len();
        let render_finished = swapchain::create_semaphores(&device, count)?;
        if let Some(record) = self.swapchains.get_mut(swapchain) {
            record.render_finished = render_finished;
        }
        let acquire = swapchain::create_semaphores(&device, count + 1)?;
        if let Some(record) = self.swapchains.get_mut(swapchain) {
            record.acquire_semaphores = acquire;
            record.resize_required = false;
        }
        Ok(())
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        self.wait_idle();

        let swapchains: Vec<SwapchainId> = self.swapchains.keys().collect();
        for swapchain in swapchains {
            self.destroy_swapchain_resources(swapchain);
        }
        self.swapchains.clear();
        let images: Vec<ImageId> = self.images.keys().collect();
        for image in images {
            self.release_image(image);
        }

        let device = self.context.raw();
        unsafe {
            for (_, buffer) in self.buffers.drain() {
                if buffer.mapped.is_some() {
                    device.unmap_memory(buffer.memory);
                }
                device.destroy_buffer(buffer.raw, None);
                device.free_memory(buffer.memory, None);
            }
            for (_, sampler) in self.samplers.drain() {
                device.destroy_sampler(sampler, None);
            }
            for (_, modules) in self.shaders.drain() {
                for module in modules {
                    device.destroy_shader_module(module, None);
                }
            }
            self.command_buffers.clear();
            for (_, pool) in self.command_pools.drain() {
                device.destroy_command_pool(pool.raw, None);
            }
            for (_, fence) in self.fences.drain() {
                device.destroy_fence(fence, None);
            }
            for (_, semaphore) in self.semaphores.drain() {
                device.destroy_semaphore(semaphore, None);
            }
        }
        self.descriptors.destroy_all(device);
        if let Some(loader) = &self.context.instance.surface_loader {
            for (_, surface) in self.surfaces.drain() {
                unsafe { loader.destroy_surface(surface.raw, None) };
            }
        }
        debug!("Vulkan driver resources released");
    }
}

impl RenderingDeviceDriver for VulkanDriver {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            backend: BackendKind::Vulkan,
            name: self.context.physical.name(),
            queue_families: self
                .context
                .physical
                .queue_families
                .iter()
                .enumerate()
                .map(|(index, properties)| QueueFamilyInfo {
                    family: QueueFamily(index as u32),
                    flags: Self::family_flags(properties),
                    queue_count: properties.queue_count,
                })
                .collect(),
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescription) -> DriverResult<Buffer> {
        let size = desc.validated_size()?;
        let device = self.context.raw();
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(conversions::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { device.create_buffer(&create_info, None) }?;
        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };

        let memory = memory::allocate(
            device,
            &self.context.physical.memory_properties,
            requirements,
            memory::placement_flags(desc.memory),
        )
        .and_then(|memory| match unsafe { device.bind_buffer_memory(raw, memory, 0) } {
            Ok(()) => Ok(memory),
            Err(e) => {
                unsafe { device.free_memory(memory, None) };
                Err(e.into())
            }
        });
        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(raw, None) };
                return Err(e);
            }
        };

        let mapped = match desc.memory {
            MemoryAccess::HostVisible => {
                match unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) } {
                    Ok(ptr) => NonNull::new(ptr.cast::<u8>()),
                    Err(e) => {
                        unsafe {
                            device.destroy_buffer(raw, None);
                            device.free_memory(memory, None);
                        }
                        return Err(e.into());
                    }
                }
            }
            MemoryAccess::GpuOnly => None,
        };

        let id = self.buffers.insert_with_key(|id| BufferRecord {
            buffer: Buffer::from_description(id, desc),
            raw,
            memory,
            mapped,
        });
        debug!("Created buffer {id:?}: {:?}, {size} bytes", desc.usage);
        Ok(self.buffers[id].buffer)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let Some(record) = self.buffers.remove(buffer) else {
            warn!("destroy of unknown buffer ignored");
            return;
        };
        let device = self.context.raw();
        unsafe {
            if record.mapped.is_some() {
                device.unmap_memory(record.memory);
            }
            device.destroy_buffer(record.raw, None);
            device.free_memory(record.memory, None);
        }
    }

    fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> DriverResult<()> {
        let record = self.buffer_record(buffer.id)?;
        record.buffer.check_host_range(offset, data.len() as u64)?;
        let ptr = record.mapped.ok_or(DriverError::NotHostVisible)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &Buffer, offset: u64, out: &mut [u8]) -> DriverResult<()> {
        let record = self.buffer_record(buffer.id)?;
        record.buffer.check_host_range(offset, out.len() as u64)?;
        let ptr = record.mapped.ok_or(DriverError::NotHostVisible)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn create_image(&mut self, format: &ImageFormat, view: &ImageView) -> DriverResult<Image> {
        format.validate()?;
        if !format.format.is_view_compatible(view.format) {
            return Err(DriverError::contract(format!(
                "view format {:?} is not compatible with {:?}",
                view.format, format.format
            )));
        }
        if format.usage.contains(ImageUsage::CPU_READ)
            && (format.texture_type != TextureType::Type2D
                || format.mipmaps != 1
                || format.array_layers != 1)
        {
            return Err(DriverError::unsupported(
                "host-readable images must be single-layer, single-mip 2D images",
            ));
        }

        let (raw, memory, view_raw, mapped) = self.create_image_objects(format, view)?;
        let id = self.images.insert_with_key(|id| ImageRecord {
            image: Image {
                id,
                format: *format,
                view: *view,
            },
            raw,
            view: view_raw,
            memory: Some(memory),
            mapped,
            map_active: false,
        });
        self.layouts.register(id, format, ImageLayout::Undefined);
        debug!("Created image {id:?}: {format:?}");
        Ok(self.images[id].image)
    }

    fn map_image(&mut self, image: &Image) -> DriverResult<&mut [u8]> {
        let record = self
            .images
            .get_mut(image.id)
            .ok_or(DriverError::InvalidHandle { kind: "image" })?;
        if !record.image.host_visible() {
            return Err(DriverError::NotHostVisible);
        }
        let ptr = record.mapped.ok_or(DriverError::NotHostVisible)?;
        if record.map_active {
            return Err(DriverError::contract("image is already mapped"));
        }

        let format = record.image.format;
        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe {
            self.context
                .device
                .device
                .get_image_subresource_layout(record.raw, subresource)
        };
        let (block_w, _) = format.format.block_extent();
        let packed_row =
            u64::from(format.width.div_ceil(block_w)) * u64::from(format.format.block_size());
        if format.height > 1 && layout.row_pitch != packed_row {
            return Err(DriverError::unsupported(format!(
                "linear image rows are padded to {} bytes",
                layout.row_pitch
            )));
        }

        record.map_active = true;
        let len = format.total_size() as usize;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().add(layout.offset as usize), len) })
    }

    fn unmap_image(&mut self, image: &Image) {
        match self.images.get_mut(image.id) {
            Some(record) if record.map_active => record.map_active = false,
            Some(_) => warn!("unmap of an image that is not mapped ignored"),
            None => warn!("unmap of unknown image ignored"),
        }
    }

    fn destroy_image(&mut self, image: ImageId) {
        match self.images.get(image) {
            Some(record) if record.memory.is_none() => {
                warn!("swapchain images are destroyed with their swapchain");
            }
            Some(_) => self.release_image(image),
            None => warn!("destroy of unknown image ignored"),
        }
    }

    fn create_sampler(&mut self, state: &SamplerState) -> DriverResult<SamplerId> {
        state.validate()?;
        if state.use_anisotropy {
            let limit = self.context.physical.properties.limits.max_sampler_anisotropy;
            if self.context.physical.features.sampler_anisotropy != vk::TRUE
                || state.anisotropy_max > limit
            {
                return Err(DriverError::unsupported(format!(
                    "anisotropy {} exceeds device limit {limit}",
                    state.anisotropy_max
                )));
            }
        }

        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(conversions::filter(state.mag_filter))
            .min_filter(conversions::filter(state.min_filter))
            .mipmap_mode(conversions::mipmap_mode(state.mip_filter))
            .address_mode_u(conversions::address_mode(state.repeat_u))
            .address_mode_v(conversions::address_mode(state.repeat_v))
            .address_mode_w(conversions::address_mode(state.repeat_w))
            .mip_lod_bias(state.lod_bias)
            .anisotropy_enable(state.use_anisotropy)
            .max_anisotropy(state.anisotropy_max)
            .compare_enable(state.enable_compare)
            .compare_op(conversions::compare_op(state.compare_op))
            .min_lod(state.min_lod)
            .max_lod(state.max_lod)
            .border_color(conversions::border_color(state.border_color))
            .unnormalized_coordinates(state.unnormalized_uvw);
        let raw = unsafe { self.device().create_sampler(&create_info, None) }?;
        Ok(self.samplers.insert(raw))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        match self.samplers.remove(sampler) {
            Some(raw) => unsafe { self.device().destroy_sampler(raw, None) },
            None => warn!("destroy of unknown sampler ignored"),
        }
    }

    fn compile_spirv_from_source(
        &mut self,
        stage: ShaderStage,
        source: &str,
        language: ShaderLanguage,
    ) -> DriverResult<Vec<u8>> {
        let compiler = self
            .compiler
            .as_ref()
            .ok_or(ShaderError::CompilerUnavailable)?;
        Ok(compiler.compile(stage, source, language)?)
    }

    fn create_shader_from_spirv(
        &mut self,
        name: &str,
        stages: &[ShaderStageSpirv],
    ) -> DriverResult<Shader> {
        let reflection = reflect_shader(stages)?;

        let mut modules = Vec::with_capacity(stages.len());
        for stage in stages {
            let created = ash::util::read_spv(&mut Cursor::new(&stage.spirv))
                .map_err(|e| DriverError::from(ShaderError::InvalidSpirv {
                    stage: stage.stage,
                    reason: e.to_string(),
                }))
                .and_then(|words| {
                    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
                    Ok(unsafe { self.device().create_shader_module(&create_info, None) }?)
                });
            match created {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        unsafe { self.device().destroy_shader_module(module, None) };
                    }
                    return Err(e);
                }
            }
        }
        let id = self.shaders.insert(modules);

        let mut created = Vec::new();
        let result = Shader::from_reflection(id, name, reflection, |bindings| {
            let layout = self.create_descriptor_set_layout(bindings)?;
            created.push(layout);
            Ok(layout)
        });

        match result {
            Ok(shader) => {
                debug!(
                    "Created shader '{name}': {:?}, {} sets",
                    shader.stages,
                    shader.uniform_sets.len()
                );
                Ok(shader)
            }
            Err(e) => {
                for layout in created {
                    self.destroy_descriptor_set_layout(layout);
                }
                if let Some(modules) = self.shaders.remove(id) {
                    for module in modules {
                        unsafe { self.device().destroy_shader_module(module, None) };
                    }
                }
                Err(e)
            }
        }
    }

    fn destroy_shader_modules(&mut self, shader: &Shader) {
        let Some(modules) = self.shaders.get_mut(shader.id) else {
            warn!("destroy of modules of unknown shader ignored");
            return;
        };
        let device = self.context.raw();
        for module in modules.drain(..) {
            unsafe { device.destroy_shader_module(module, None) };
        }
    }

    fn destroy_shader(&mut self, shader: Shader) {
        let Some(modules) = self.shaders.remove(shader.id) else {
            warn!("destroy of unknown shader '{}' ignored", shader.name);
            return;
        };
        for module in modules {
            unsafe { self.device().destroy_shader_module(module, None) };
        }
        for layout in shader.descriptor_set_layouts() {
            self.destroy_descriptor_set_layout(layout);
        }
    }

    fn create_command_pool(
        &mut self,
        family: QueueFamily,
        kind: CommandBufferType,
    ) -> DriverResult<CommandPoolId> {
        self.family_properties(family)?;
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family.index());
        let raw = unsafe { self.device().create_command_pool(&create_info, None) }?;
        Ok(self.command_pools.insert(CommandPoolRecord {
            raw,
            family,
            kind,
            buffers: Vec::new(),
        }))
    }

    fn reset_command_pool(&mut self, pool: CommandPoolId) -> DriverResult<()> {
        let record = self
            .command_pools
            .get(pool)
            .ok_or(DriverError::InvalidHandle { kind: "command pool" })?;
        if CHECKED {
            let pending = record.buffers.iter().any(|cb| {
                self.command_buffers
                    .get(*cb)
                    .is_some_and(|buffer| buffer.tracking.state == CommandBufferState::Pending)
            });
            if pending {
                return Err(DriverError::contract(
                    "command pool reset while one of its buffers is pending",
                ));
            }
        }
        unsafe {
            self.device()
                .reset_command_pool(record.raw, vk::CommandPoolResetFlags::empty())
        }?;
        for cb in &record.buffers {
            if let Some(buffer) = self.command_buffers.get_mut(*cb) {
                buffer.tracking.state.invalidate();
                buffer.layouts.clear();
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&mut self, pool: CommandPoolId) {
        let Some(record) = self.command_pools.remove(pool) else {
            warn!("destroy of unknown command pool ignored");
            return;
        };
        for cb in record.buffers {
            self.command_buffers.remove(cb);
        }
        unsafe { self.device().destroy_command_pool(record.raw, None) };
    }

    fn create_command_buffer(&mut self, pool: CommandPoolId) -> DriverResult<CommandBufferId> {
        let record = self
            .command_pools
            .get_mut(pool)
            .ok_or(DriverError::InvalidHandle { kind: "command pool" })?;
        let level = match record.kind {
            CommandBufferType::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferType::Secondary => vk::CommandBufferLevel::SECONDARY,
        };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(record.raw)
            .level(level)
            .command_buffer_count(1);
        let raw = unsafe { self.context.device.device.allocate_command_buffers(&alloc_info) }?
            .into_iter()
            .next()
            .ok_or(DriverError::OutOfHostMemory)?;

        let cb = self.command_buffers.insert(CommandBufferRecord {
            raw,
            tracking: CommandBufferTracking::new(pool, record.kind),
            layouts: LayoutOverlay::new(),
        });
        record.buffers.push(cb);
        Ok(cb)
    }

    fn destroy_command_buffer(&mut self, cb: CommandBufferId) {
        let Some(record) = self.command_buffers.get(cb) else {
            warn!("destroy of unknown command buffer ignored");
            return;
        };
        if record.tracking.state == CommandBufferState::Pending {
            warn!("destroy of a pending command buffer ignored");
            return;
        }
        let pool = record.tracking.pool;
        let raw = record.raw;
        self.command_buffers.remove(cb);
        if let Some(pool) = self.command_pools.get_mut(pool) {
            pool.buffers.retain(|buffer| *buffer != cb);
            unsafe { self.context.device.device.free_command_buffers(pool.raw, &[raw]) };
        }
    }

    fn begin_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self
            .command_buffers
            .get_mut(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })?;
        record.tracking.begin()?;
        record.layouts.clear();
        let inheritance = vk::CommandBufferInheritanceInfo::builder();
        let begin_info = vk::CommandBufferBeginInfo::builder().inheritance_info(&inheritance);
        let result = unsafe {
            self.context
                .device
                .device
                .begin_command_buffer(record.raw, &begin_info)
        };
        if let Err(e) = result {
            record.tracking.state = CommandBufferState::Initial;
            return Err(e.into());
        }
        Ok(())
    }

    fn end_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self
            .command_buffers
            .get_mut(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })?;
        record.tracking.end()?;
        Ok(unsafe { self.context.device.device.end_command_buffer(record.raw) }?)
    }

    fn reset_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self
            .command_buffers
            .get_mut(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })?;
        if record.tracking.state == CommandBufferState::Pending {
            return Err(DriverError::contract(
                "reset of a pending command buffer; wait on it first",
            ));
        }
        record.tracking.reset()?;
        record.layouts.clear();
        Ok(unsafe {
            self.context
                .device
                .device
                .reset_command_buffer(record.raw, vk::CommandBufferResetFlags::empty())
        }?)
    }

    fn wait_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self.command_buffer(cb)?;
        match record.tracking.state {
            CommandBufferState::Invalid => {
                return Err(DriverError::InvalidCommandBufferState {
                    operation: "wait on",
                    state: CommandBufferState::Invalid,
                })
            }
            CommandBufferState::Pending => {}
            _ => return Ok(()),
        }

        let fence = record.tracking.fence.and_then(|fence| self.fences.get(fence).copied());
        let queue = record
            .tracking
            .submitted_to
            .and_then(|queue| self.queues.get(queue))
            .map(|queue| queue.raw);
        match (fence, queue) {
            (Some(fence), _) => unsafe {
                self.device()
                    .wait_for_fences(&[fence], true, self.config.fence_timeout_ns)
            }?,
            (None, Some(queue)) => unsafe { self.device().queue_wait_idle(queue) }?,
            (None, None) => self.wait_idle(),
        }
        self.command_buffer_mut(cb)?.tracking.complete();
        Ok(())
    }

    fn command_buffer_state(&self, cb: CommandBufferId) -> DriverResult<CommandBufferState> {
        Ok(self.command_buffer(cb)?.tracking.state)
    }

    fn get_queue_family(
        &mut self,
        flags: QueueFamilyFlags,
        surface: Option<SurfaceId>,
    ) -> DriverResult<QueueFamily> {
        let surface = match surface {
            Some(surface) => Some(
                self.surfaces
                    .get(surface)
                    .ok_or(DriverError::InvalidHandle { kind: "surface" })?
                    .raw,
            ),
            None => None,
        };
        for (index, properties) in self.context.physical.queue_families.iter().enumerate() {
            let family = QueueFamily(index as u32);
            if properties.queue_count == 0 || !Self::family_flags(properties).contains(flags) {
                continue;
            }
            match surface {
                Some(surface) if !self.can_present(family, surface)? => continue,
                _ => return Ok(family),
            }
        }
        Err(DriverError::NoSuitableQueueFamily { requested: flags })
    }

    fn create_command_queue(&mut self, family: QueueFamily) -> DriverResult<CommandQueueId> {
        let limit = self.family_properties(family)?.queue_count;
        let used: HashSet<u32> = self
            .queues
            .values()
            .filter(|queue| queue.family == family)
            .map(|queue| queue.index)
            .collect();
        let index = (0..limit)
            .find(|index| !used.contains(index))
            .ok_or_else(|| {
                DriverError::unsupported(format!(
                    "queue family {} exposes only {limit} queue(s)",
                    family.index()
                ))
            })?;
        let raw = self.context.device.queues[family.index() as usize][index as usize];
        Ok(self.queues.insert(QueueRecord {
            raw,
            family,
            index,
            pending_waits: Vec::new(),
        }))
    }

    fn destroy_command_queue(&mut self, queue: CommandQueueId) {
        if self.queues.remove(queue).is_none() {
            warn!("destroy of unknown command queue ignored");
        }
    }

    fn execute_command_queue_and_present(
        &mut self,
        queue: CommandQueueId,
        wait_semaphores: &[SemaphoreId],
        command_buffers: &[CommandBufferId],
        signal_semaphores: &[SemaphoreId],
        fence: Option<FenceId>,
        swapchains: &[SwapchainId],
    ) -> DriverResult<PresentOutcome> {
        let queue_record = self.queue_record(queue)?;
        let family = queue_record.family;
        let queue_raw = queue_record.raw;

        let mut seen = HashSet::new();
        let mut raw_buffers = Vec::with_capacity(command_buffers.len());
        for cb in command_buffers {
            let record = self.command_buffer(*cb)?;
            if !seen.insert(*cb) {
                return Err(DriverError::contract("command buffer submitted twice in one batch"));
            }
            if record.tracking.state != CommandBufferState::Executable {
                return Err(DriverError::InvalidCommandBufferState {
                    operation: "submit",
                    state: record.tracking.state,
                });
            }
            if record.tracking.kind == CommandBufferType::Secondary {
                return Err(DriverError::contract(
                    "secondary command buffers cannot be submitted to a queue",
                ));
            }
            if CHECKED {
                let pool_family = self
                    .command_pools
                    .get(record.tracking.pool)
                    .map(|pool| pool.family);
                if pool_family != Some(family) {
                    return Err(DriverError::contract(format!(
                        "command buffer belongs to another queue family than queue family {}",
                        family.index()
                    )));
                }
            }
            raw_buffers.push(record.raw);
        }

        let mut waits = Vec::with_capacity(wait_semaphores.len() + 1);
        for semaphore in wait_semaphores {
            waits.push(
                self.semaphores
                    .get(*semaphore)
                    .copied()
                    .ok_or(DriverError::InvalidHandle { kind: "semaphore" })?,
            );
        }
        let mut signals = Vec::with_capacity(signal_semaphores.len() + swapchains.len());
        for semaphore in signal_semaphores {
            signals.push(
                self.semaphores
                    .get(*semaphore)
                    .copied()
                    .ok_or(DriverError::InvalidHandle { kind: "semaphore" })?,
            );
        }
        let fence_raw = match fence {
            Some(fence) => self
                .fences
                .get(fence)
                .copied()
                .ok_or(DriverError::InvalidHandle { kind: "fence" })?,
            None => vk::Fence::null(),
        };

        let staged = if CHECKED {
            Some(
                self.layouts.stage(
                    command_buffers
                        .iter()
                        .filter_map(|cb| self.command_buffers.get(*cb))
                        .map(|record| &record.layouts),
                )?,
            )
        } else {
            None
        };

        let mut presents = Vec::with_capacity(swapchains.len());
        for swapchain in swapchains {
            let record = self
                .swapchains
                .get(*swapchain)
                .ok_or(DriverError::InvalidHandle { kind: "swapchain" })?;
            let index = record
                .acquired
                .ok_or_else(|| DriverError::contract("present without an acquired image"))?;
            let image = record.images[index as usize];
            if let Some(staged) = &staged {
                let surface = self
                    .surfaces
                    .get(record.surface)
                    .ok_or(DriverError::InvalidHandle { kind: "surface" })?;
                if !self.can_present(family, surface.raw)? {
                    return Err(DriverError::contract(format!(
                        "queue family {} cannot present",
                        family.index()
                    )));
                }
                let format = self.image_record(image)?.image.format;
                self.layouts.expect_staged(
                    staged,
                    image,
                    &ImageSubresourceRange::whole(&format),
                    ImageLayout::PresentSrc,
                    "present",
                )?;
            }
            let render_finished = record.render_finished[index as usize];
            signals.push(render_finished);
            presents.push((*swapchain, record.raw, index, render_finished));
        }

        if let Some(record) = self.queues.get_mut(queue) {
            waits.append(&mut record.pending_waits);
        }
        let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&raw_buffers)
            .signal_semaphores(&signals)
            .build();
        unsafe { self.device().queue_submit(queue_raw, &[submit], fence_raw) }?;

        for cb in command_buffers {
            if let Some(record) = self.command_buffers.get_mut(*cb) {
                record.tracking.submit(queue, fence)?;
                record.layouts.clear();
            }
        }
        if let Some(staged) = staged {
            self.layouts.commit(staged);
        }

        let mut outcome = PresentOutcome::default();
        if presents.is_empty() {
            return Ok(outcome);
        }
        let loader = self
            .context
            .device
            .swapchain_loader
            .as_ref()
            .ok_or_else(|| DriverError::unsupported("presentation: swapchain extension disabled"))?;
        for (swapchain, raw, index, render_finished) in presents {
            let wait = [render_finished];
            let raws = [raw];
            let indices = [index];
            let present_info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&wait)
                .swapchains(&raws)
                .image_indices(&indices);
            let result = unsafe { loader.queue_present(queue_raw, &present_info) };

            let Some(record) = self.swapchains.get_mut(swapchain) else {
                continue;
            };
            record.acquired = None;
            match result {
                Ok(false) if !record.resize_required => {}
                Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    warn!("Swapchain {swapchain:?} is out of date; resize required");
                    record.resize_required = true;
                    outcome.out_of_date.push(swapchain);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(outcome)
    }

    fn command_pipeline_barrier(
        &mut self,
        cb: CommandBufferId,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        memory_barriers: &[MemoryBarrier],
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    ) -> DriverResult<()> {
        let raw = self.recording(cb, "record a pipeline barrier in")?;
        if src_stages.is_empty() || dst_stages.is_empty() {
            return Err(DriverError::contract("barrier stage masks must not be empty"));
        }

        let memory: Vec<vk::MemoryBarrier> = memory_barriers
            .iter()
            .map(|barrier| {
                vk::MemoryBarrier::builder()
                    .src_access_mask(conversions::access(barrier.src_access))
                    .dst_access_mask(conversions::access(barrier.dst_access))
                    .build()
            })
            .collect();

        let mut buffers = Vec::with_capacity(buffer_barriers.len());
        for barrier in buffer_barriers {
            let record = self.buffer_record(barrier.buffer)?;
            if CHECKED {
                record.buffer.check_range(barrier.offset, barrier.size)?;
            }
            buffers.push(
                vk::BufferMemoryBarrier::builder()
                    .src_access_mask(conversions::access(barrier.src_access))
                    .dst_access_mask(conversions::access(barrier.dst_access))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(record.raw)
                    .offset(barrier.offset)
                    .size(barrier.size)
                    .build(),
            );
        }

        let mut images = Vec::with_capacity(image_barriers.len());
        for barrier in image_barriers {
            let record = self.image_record(barrier.image)?;
            if CHECKED {
                barrier.subresources.validate(&record.image.format)?;
            }
            images.push(
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(conversions::access(barrier.src_access))
                    .dst_access_mask(conversions::access(barrier.dst_access))
                    .old_layout(conversions::image_layout(barrier.old_layout))
                    .new_layout(conversions::image_layout(barrier.new_layout))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(record.raw)
                    .subresource_range(conversions::subresource_range(&barrier.subresources))
                    .build(),
            );
        }

        if CHECKED {
            let record = self
                .command_buffers
                .get_mut(cb)
                .ok_or(DriverError::InvalidHandle { kind: "command buffer" })?;
            self.layouts.transition(&mut record.layouts, image_barriers)?;
        }

        unsafe {
            self.device().cmd_pipeline_barrier(
                raw,
                conversions::pipeline_stages(src_stages),
                conversions::pipeline_stages(dst_stages),
                vk::DependencyFlags::empty(),
                &memory,
                &buffers,
                &images,
            );
        }
        Ok(())
    }

    fn command_clear_buffer(
        &mut self,
        cb: CommandBufferId,
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) -> DriverResult<()> {
        let raw = self.recording(cb, "clear a buffer in")?;
        let record = self.buffer_record(buffer.id)?;
        record.buffer.ensure_copy_destination()?;
        if offset % 4 != 0 || size % 4 != 0 {
            return Err(DriverError::contract("buffer clears must be 4-byte aligned"));
        }
        record.buffer.check_range(offset, size)?;
        unsafe { self.device().cmd_fill_buffer(raw, record.raw, offset, size, 0) };
        Ok(())
    }

    fn command_copy_buffer(
        &mut self,
        cb: CommandBufferId,
        src: &Buffer,
        dst: &Buffer,
        regions: &[BufferCopyRegion],
    ) -> DriverResult<()> {
        let raw = self.recording(cb, "copy a buffer in")?;
        let src = self.buffer_record(src.id)?;
        let dst = self.buffer_record(dst.id)?;
        src.buffer.ensure_copy_source()?;
        dst.buffer.ensure_copy_destination()?;
        if regions.is_empty() {
            return Err(DriverError::contract("copy needs at least one region"));
        }
        let mut copies = Vec::with_capacity(regions.len());
        for region in regions {
            src.buffer.check_range(region.src_offset, region.size)?;
            dst.buffer.check_range(region.dst_offset, region.size)?;
            copies.push(vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            });
        }
        unsafe { self.device().cmd_copy_buffer(raw, src.raw, dst.raw, &copies) };
        Ok(())
    }

    fn command_copy_image(
        &mut self,
        cb: CommandBufferId,
        src: &Image,
        src_layout: ImageLayout,
        dst: &Image,
        dst_layout: ImageLayout,
        regions: &[ImageCopyRegion],
    ) -> DriverResult<()> {
        let raw = self.recording(cb, "copy an image in")?;
        let src = self.image_record(src.id)?;
        let dst = self.image_record(dst.id)?;
        src.image.ensure_copy_source()?;
        dst.image.ensure_copy_destination()?;
        src.image.ensure_copyable_format()?;
        dst.image.ensure_copyable_format()?;
        if regions.is_empty() {
            return Err(DriverError::contract("copy needs at least one region"));
        }

        let mut copies = Vec::with_capacity(regions.len());
        let mut uses = Vec::with_capacity(regions.len() * 2);
        for region in regions {
            region
                .src_subresources
                .validate_region(&src.image.format, region.src_offset, region.extent)?;
            region
                .dst_subresources
                .validate_region(&dst.image.format, region.dst_offset, region.extent)?;
            uses.push(self.expect_transfer_layout(
                cb,
                src.image.id,
                &region.src_subresources.as_range(),
                src_layout,
                true,
                "image copy source",
            )?);
            uses.push(self.expect_transfer_layout(
                cb,
                dst.image.id,
                &region.dst_subresources.as_range(),
                dst_layout,
                false,
                "image copy destination",
            )?);
            copies.push(vk::ImageCopy {
                src_subresource: conversions::subresource_layers(&region.src_subresources),
                src_offset: conversions::offset(region.src_offset),
                dst_subresource: conversions::subresource_layers(&region.dst_subresources),
                dst_offset: conversions::offset(region.dst_offset),
                extent: conversions::extent(region.extent),
            });
        }
        unsafe {
            self.device().cmd_copy_image(
                raw,
                src.raw,
                conversions::image_layout(src_layout),
                dst.raw,
                conversions::image_layout(dst_layout),
                &copies,
            );
        }
        self.record_layout_uses(cb, uses)
    }

    fn command_resolve_image(
        &mut self,
        cb: CommandBufferId,
        src: &Image,
        src_layout: ImageLayout,
        src_layer: u32,
        src_mip: u32,
        dst: &Image,
        dst_layout: ImageLayout,
        dst_layer: u32,
        dst_mip: u32,
    ) -> DriverResult<()> {
        let raw = self.recording(cb, "resolve an image in")?;
        let src = self.image_record(src.id)?;
        let dst = self.image_record(dst.id)?;
        src.image.ensure_copy_source()?;
        dst.image.ensure_copy_destination()?;
        if src.image.format.samples == SampleCount::X1 || dst.image.format.samples != SampleCount::X1 {
            return Err(DriverError::contract(
                "resolve needs a multisampled source and a single-sampled destination",
            ));
        }
        if src.image.format.format != dst.image.format.format || src.image.format.format.is_depth() {
            return Err(DriverError::contract("resolve needs matching color formats"));
        }

        let src_layers = ImageSubresourceLayers {
            mip_level: src_mip,
            ..ImageSubresourceLayers::color(src_layer)
        };
        let dst_layers = ImageSubresourceLayers {
            mip_level: dst_mip,
            ..ImageSubresourceLayers::color(dst_layer)
        };
        src_layers.as_range().validate(&src.image.format)?;
        dst_layers.as_range().validate(&dst.image.format)?;
        let extent = src.image.format.mip_extent(src_mip);
        if extent != dst.image.format.mip_extent(dst_mip) {
            return Err(DriverError::contract("resolve needs equal subresource extents"));
        }
        let uses = vec![
            self.expect_transfer_layout(
                cb,
                src.image.id,
                &src_layers.as_range(),
                src_layout,
                true,
                "resolve source",
            )?,
            self.expect_transfer_layout(
                cb,
                dst.image.id,
                &dst_layers.as_range(),
                dst_layout,
                false,
                "resolve destination",
            )?,
        ];

        let region = vk::ImageResolve {
            src_subresource: conversions::subresource_layers(&src_layers),
            src_offset: vk::Offset3D::default(),
            dst_subresource: conversions::subresource_layers(&dst_layers),
            dst_offset: vk::Offset3D::default(),
            extent: conversions::extent(extent),
        };
        unsafe {
            self.device().cmd_resolve_image(
                raw,
                src.raw,
                conversions::image_layout(src_layout),
                dst.raw,
                conversions::image_layout(dst_layout),
                &[region],
            );
        }
        self.record_layout_uses(cb, uses)
    }

    fn command_clear_color_image(
        &mut self,
        cb: CommandBufferId,
        image: &Image,
        layout: ImageLayout,
        color: [f32; 4],
        range: &ImageSubresourceRange,
    ) -> DriverResult<()> {
        let raw = self.recording(cb, "clear an image in")?;
        let record = self.image_record(image.id)?;
        record.image.ensure_copy_destination()?;
        let data_format = record.image.format.format;
        if data_format.is_depth() || data_format.is_compressed() {
            return Err(DriverError::contract(format!(
                "{data_format:?} cannot be cleared as color"
            )));
        }
        range.validate(&record.image.format)?;
        let used = self.expect_transfer_layout(cb, record.image.id, range, layout, false, "color clear")?;

        let value = if data_format == DataFormat::R32Uint {
            vk::ClearColorValue {
                uint32: color.map(|c| c.max(0.0) as u32),
            }
        } else {
            vk::ClearColorValue { float32: color }
        };
        unsafe {
            self.device().cmd_clear_color_image(
                raw,
                record.raw,
                conversions::image_layout(layout),
                &value,
                &[conversions::subresource_range(range)],
            );
        }
        self.record_layout_uses(cb, vec![used])
    }

    fn command_copy_buffer_to_image(
        &mut self,
        cb: CommandBufferId,
        src: &Buffer,
        dst: &Image,
        dst_layout: ImageLayout,
        regions: &[BufferImageCopyRegion],
    ) -> DriverResult<()> {
        let raw = self.recording(cb, "copy a buffer to an image in")?;
        let src = self.buffer_record(src.id)?;
        let dst = self.image_record(dst.id)?;
        src.buffer.ensure_copy_source()?;
        dst.image.ensure_copy_destination()?;
        dst.image.ensure_copyable_format()?;
        if regions.is_empty() {
            return Err(DriverError::contract("copy needs at least one region"));
        }

        let mut copies = Vec::with_capacity(regions.len());
        let mut uses = Vec::with_capacity(regions.len());
        for region in regions {
            region
                .subresources
                .validate_region(&dst.image.format, region.image_offset, region.image_extent)?;
            src.buffer
                .check_range(region.buffer_offset, region.buffer_size(dst.image.format.format))?;
            uses.push(self.expect_transfer_layout(
                cb,
                dst.image.id,
                &region.subresources.as_range(),
                dst_layout,
                false,
                "buffer to image copy",
            )?);
            copies.push(buffer_image_copy(region));
        }
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                raw,
                src.raw,
                dst.raw,
                conversions::image_layout(dst_layout),
                &copies,
            );
        }
        self.record_layout_uses(cb, uses)
    }

    fn command_copy_image_to_buffer(
        &mut self,
        cb: CommandBufferId,
        src: &Image,
        src_layout: ImageLayout,
        dst: &Buffer,
        regions: &[BufferImageCopyRegion],
    ) -> DriverResult<()> {
        let raw = self.recording(cb, "copy an image to a buffer in")?;
        let src = self.image_record(src.id)?;
        let dst = self.buffer_record(dst.id)?;
        src.image.ensure_copy_source()?;
        dst.buffer.ensure_copy_destination()?;
        src.image.ensure_copyable_format()?;
        if regions.is_empty() {
            return Err(DriverError::contract("copy needs at least one region"));
        }

        let mut copies = Vec::with_capacity(regions.len());
        let mut uses = Vec::with_capacity(regions.len());
        for region in regions {
            region
                .subresources
                .validate_region(&src.image.format, region.image_offset, region.image_extent)?;
            dst.buffer
                .check_range(region.buffer_offset, region.buffer_size(src.image.format.format))?;
            uses.push(self.expect_transfer_layout(
                cb,
                src.image.id,
                &region.subresources.as_range(),
                src_layout,
                true,
                "image to buffer copy",
            )?);
            copies.push(buffer_image_copy(region));
        }
        unsafe {
            self.device().cmd_copy_image_to_buffer(
                raw,
                src.raw,
                conversions::image_layout(src_layout),
                dst.raw,
                &copies,
            );
        }
        self.record_layout_uses(cb, uses)
    }

    fn command_begin_label(
        &mut self,
        cb: CommandBufferId,
        name: &str,
        color: [f32; 4],
    ) -> DriverResult<()> {
        let record = self
            .command_buffers
            .get_mut(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })?;
        record.tracking.begin_label()?;

        #[cfg(debug_assertions)]
        if let Some(debug_utils) = &self.context.instance.debug_utils {
            let name = std::ffi::CString::new(name).unwrap_or_default();
            let label = vk::DebugUtilsLabelEXT::builder()
                .label_name(&name)
                .color(color);
            unsafe { debug_utils.cmd_begin_debug_utils_label(record.raw, &label) };
        }
        #[cfg(not(debug_assertions))]
        let _ = (name, color);
        Ok(())
    }

    fn command_end_label(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self
            .command_buffers
            .get_mut(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })?;
        record.tracking.end_label()?;

        #[cfg(debug_assertions)]
        if let Some(debug_utils) = &self.context.instance.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(record.raw) };
        }
        Ok(())
    }

    fn create_surface(&mut self, target: &SurfaceTarget) -> DriverResult<SurfaceId> {
        let SurfaceTarget::Window {
            display,
            window,
            width,
            height,
        } = *target
        else {
            return Err(DriverError::unsupported(
                "offscreen surfaces on the Vulkan backend",
            ));
        };
        self.surface_loader()?;
        let raw = unsafe {
            ash_window::create_surface(
                &self.context.instance.entry,
                &self.context.instance.instance,
                display,
                window,
                None,
            )
        }?;
        info!("Created window surface {width}x{height}");
        Ok(self.surfaces.insert(SurfaceRecord { raw, width, height }))
    }

    fn surface_set_size(&mut self, surface: SurfaceId, width: u32, height: u32) -> DriverResult<()> {
        let record = self
            .surfaces
            .get_mut(surface)
            .ok_or(DriverError::InvalidHandle { kind: "surface" })?;
        if (record.width, record.height) == (width, height) {
            return Ok(());
        }
        record.width = width;
        record.height = height;
        for swapchain in self.swapchains.values_mut() {
            if swapchain.surface == surface {
                swapchain.resize_required = true;
            }
        }
        debug!("Surface {surface:?} resized to {width}x{height}");
        Ok(())
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        if self.swapchains.values().any(|swapchain| swapchain.surface == surface) {
            warn!("destroy of a surface with live swapchains ignored");
            return;
        }
        let Some(record) = self.surfaces.remove(surface) else {
            warn!("destroy of unknown surface ignored");
            return;
        };
        if let Some(loader) = &self.context.instance.surface_loader {
            unsafe { loader.destroy_surface(record.raw, None) };
        }
    }

    fn create_swapchain(&mut self, surface: SurfaceId) -> DriverResult<SwapchainId> {
        if !self.surfaces.contains_key(surface) {
            return Err(DriverError::InvalidHandle { kind: "surface" });
        }
        if self.context.device.swapchain_loader.is_none() {
            return Err(DriverError::unsupported("presentation: swapchain extension disabled"));
        }
        Ok(self.swapchains.insert(SwapchainRecord::r#unsized(surface)))
    }

    fn resize_swapchain(
        &mut self,
        queue: CommandQueueId,
        swapchain: SwapchainId,
        desired_image_count: u32,
    ) -> DriverResult<()> {
        let family = self.queue_record(queue)?.family;
        let record = self
            .swapchains
            .get(swapchain)
            .ok_or(DriverError::InvalidHandle { kind: "swapchain" })?;
        if record.acquired.is_some() {
            return Err(DriverError::contract("swapchain resized while an image is acquired"));
        }
        let old = record.raw;
        let surface = self
            .surfaces
            .get(record.surface)
            .ok_or(DriverError::InvalidHandle { kind: "surface" })?;
        let (surface_raw, size) = (surface.raw, (surface.width, surface.height));
        if CHECKED && !self.can_present(family, surface_raw)? {
            return Err(DriverError::contract(format!(
                "queue family {} cannot present",
                family.index()
            )));
        }

        // Images of the old swapchain may still be in flight
        self.wait_idle();

        let loader = self
            .context
            .device
            .swapchain_loader
            .as_ref()
            .ok_or_else(|| DriverError::unsupported("presentation: swapchain extension disabled"))?;
        let build = swapchain::build(
            loader,
            self.surface_loader()?,
            self.context.physical.device,
            surface_raw,
            old,
            size,
            desired_image_count,
            self.config.swapchain.present_mode,
        )?;

        self.destroy_swapchain_resources(swapchain);
        let Some(build) = build else {
            if let Some(record) = self.swapchains.get_mut(swapchain) {
                record.extent = (0, 0);
                record.resize_required = true;
            }
            debug!("Swapchain {swapchain:?} stays unsized while the surface is empty");
            return Ok(());
        };

        let (width, height) = (build.extent.width, build.extent.height);
        if let Err(e) = self.populate_swapchain(swapchain, build) {
            self.destroy_swapchain_resources(swapchain);
            if let Some(record) = self.swapchains.get_mut(swapchain) {
                record.resize_required = true;
            }
            return Err(e);
        }
        info!("Swapchain {swapchain:?} sized {width}x{height}");
        Ok(())
    }

    fn acquire_swapchain_framebuffer(
        &mut self,
        queue: CommandQueueId,
        swapchain: SwapchainId,
    ) -> DriverResult<AcquireOutcome> {
        self.queue_record(queue)?;
        let loader = self
            .context
            .device
            .swapchain_loader
            .as_ref()
            .ok_or_else(|| DriverError::unsupported("presentation: swapchain extension disabled"))?;
        let record = self
            .swapchains
            .get_mut(swapchain)
            .ok_or(DriverError::InvalidHandle { kind: "swapchain" })?;
        if record.resize_required || record.images.is_empty() {
            return Ok(AcquireOutcome::ResizeRequired);
        }
        if record.acquired.is_some() {
            return Err(DriverError::contract(
                "acquire before the previous image was presented",
            ));
        }
        let semaphore = record
            .take_acquire_semaphore()
            .ok_or_else(|| DriverError::contract("swapchain has no acquire semaphores"))?;

        let index = match unsafe {
            loader.acquire_next_image(record.raw, u64::MAX, semaphore, vk::Fence::null())
        } {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    // Still presentable; report it at present time
                    record.resize_required = true;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                warn!("Swapchain {swapchain:?} is out of date; resize required");
                record.resize_required = true;
                return Ok(AcquireOutcome::ResizeRequired);
            }
            Err(e) => return Err(e.into()),
        };

        record.acquired = Some(index);
        let image = record.images[index as usize];
        let framebuffer = record.framebuffers[index as usize];
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.pending_waits.push(semaphore);
        }
        let image = self.image_record(image)?.image;
        Ok(AcquireOutcome::Ready(SwapchainFrame {
            framebuffer,
            image,
            index,
        }))
    }

    fn swapchain_format(&self, swapchain: SwapchainId) -> DriverResult<DataFormat> {
        self.swapchains
            .get(swapchain)
            .map(|record| record.data_format)
            .ok_or(DriverError::InvalidHandle { kind: "swapchain" })
    }

    fn swapchain_extent(&self, swapchain: SwapchainId) -> DriverResult<(u32, u32)> {
        self.swapchains
            .get(swapchain)
            .map(|record| record.extent)
            .ok_or(DriverError::InvalidHandle { kind: "swapchain" })
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainId) {
        if !self.swapchains.contains_key(swapchain) {
            warn!("destroy of unknown swapchain ignored");
            return;
        }
        self.wait_idle();
        self.destroy_swapchain_resources(swapchain);
        self.swapchains.remove(swapchain);
    }

    fn create_fence(&mut self) -> DriverResult<FenceId> {
        let create_info = vk::FenceCreateInfo::builder();
        let raw = unsafe { self.device().create_fence(&create_info, None) }?;
        Ok(self.fences.insert(raw))
    }

    fn wait_on_fence(&mut self, fence: FenceId) -> DriverResult<()> {
        let raw = self
            .fences
            .get(fence)
            .copied()
            .ok_or(DriverError::InvalidHandle { kind: "fence" })?;
        let device = self.context.raw();
        unsafe {
            device.wait_for_fences(&[raw], true, self.config.fence_timeout_ns)?;
            device.reset_fences(&[raw])?;
        }
        for record in self.command_buffers.values_mut() {
            if record.tracking.fence == Some(fence) {
                record.tracking.complete();
            }
        }
        Ok(())
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        match self.fences.remove(fence) {
            Some(raw) => unsafe { self.device().destroy_fence(raw, None) },
            None => warn!("destroy of unknown fence ignored"),
        }
    }

    fn create_semaphore(&mut self) -> DriverResult<SemaphoreId> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let raw = unsafe { self.device().create_semaphore(&create_info, None) }?;
        Ok(self.semaphores.insert(raw))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreId) {
        match self.semaphores.remove(semaphore) {
            Some(raw) => unsafe { self.device().destroy_semaphore(raw, None) },
            None => warn!("destroy of unknown semaphore ignored"),
        }
    }
}

fn buffer_image_copy(region: &BufferImageCopyRegion) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: region.buffer_offset,
        // Zero means tightly packed rows and layers
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: conversions::subresource_layers(&region.subresources),
        image_offset: conversions::offset(region.image_offset),
        image_extent: conversions::extent(region.image_extent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::flags::BufferUsage;

    #[test]
    fn test_family_flags_add_implicit_transfer() {
        let graphics = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            queue_count: 1,
            ..Default::default()
        };
        assert!(VulkanDriver::family_flags(&graphics).contains(QueueFamilyFlags::TRANSFER));

        let sparse = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::SPARSE_BINDING,
            queue_count: 1,
            ..Default::default()
        };
        assert!(VulkanDriver::family_flags(&sparse).is_empty());
    }

    #[test]
    #[ignore = "requires a Vulkan capable device"]
    fn test_host_visible_buffer_round_trip() {
        let mut driver = VulkanDriver::new(&DriverConfig::default(), None).unwrap();
        let buffer = driver
            .create_buffer(&BufferDescription::new(BufferUsage::UNIFORM, 4, 16))
            .unwrap();
        driver.write_buffer(&buffer, 16, &[7; 16]).unwrap();
        let mut out = [0u8; 16];
        driver.read_buffer(&buffer, 16, &mut out).unwrap();
        assert_eq!(out, [7; 16]);
        assert!(driver.write_buffer(&buffer, 60, &[0; 8]).is_err());
        driver.destroy_buffer(buffer.id);
    }
}
