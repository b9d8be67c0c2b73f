//! Headless backend
//!
//! A complete CPU implementation of [`RenderingDeviceDriver`]. Buffers and
//! images live in host memory, commands are replayed in order when their
//! buffer is submitted, and swapchains present into driver-owned images.
//!
//! Unlike a hardware backend, every precondition the driver contract leaves
//! undefined is checked here and reported as an error: command buffer states,
//! image layouts, usage flags, semaphore readiness and handle validity.

mod descriptor;
mod recording;
mod storage;

use std::collections::HashSet;

use log::{debug, info, warn};
use slotmap::SlotMap;

use self::descriptor::DescriptorStore;
use self::recording::{ExecutionContext, RecordedCommand};
use self::storage::{BufferStorage, ImageStorage, MemoryBudget};
use crate::config::{DriverConfig, QueueFamilyConfig};
use crate::render::barrier::{
    BufferBarrier, ImageBarrier, ImageLayout, LayoutOverlay, LayoutTracker, LayoutUse, MemoryBarrier,
};
use crate::render::command::{CommandBufferState, CommandBufferTracking, CommandBufferType};
use crate::render::descriptor::{DescriptorDevice, DescriptorResource, DescriptorSet};
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
    reflect_shader, Shader, ShaderCompiler, ShaderLanguage, ShaderStage, ShaderStageSpirv,
};
use crate::render::types::{
    BufferCopyRegion, BufferDescription, BufferImageCopyRegion, DataFormat, ImageCopyRegion,
    ImageFormat, ImageSubresourceLayers, ImageSubresourceRange, ImageView, SampleCount,
    SamplerState, TextureType,
};

/// Largest swapchain the headless device creates
const MAX_SWAPCHAIN_IMAGES: u32 = 8;

/// Largest anisotropy level the headless device accepts
const MAX_ANISOTROPY: f32 = 16.0;

const SWAPCHAIN_FORMAT: DataFormat = DataFormat::B8G8R8A8Unorm;

struct ShaderRecord {
    modules_live: bool,
}

struct CommandPoolRecord {
    family: QueueFamily,
    kind: CommandBufferType,
    buffers: Vec<CommandBufferId>,
}

struct CommandBufferRecord {
    tracking: CommandBufferTracking,
    commands: Vec<RecordedCommand>,
    layouts: LayoutOverlay,
}

impl CommandBufferRecord {
    /// Forget everything recorded
    fn discard(&mut self) {
        self.commands.clear();
        self.layouts.clear();
    }
}

struct FenceRecord {
    signaled: bool,
    pending: Vec<CommandBufferId>,
}

struct SurfaceRecord {
    width: u32,
    height: u32,
}

struct SwapchainRecord {
    surface: SurfaceId,
    extent: (u32, u32),
    images: Vec<ImageId>,
    framebuffers: Vec<FramebufferId>,
    next_image: u32,
    acquired: Option<u32>,
    resize_required: bool,
    presented: u64,
}

/// CPU rendering device
pub struct HeadlessDriver {
    device_name: String,
    families: Vec<QueueFamilyConfig>,
    memory: MemoryBudget,
    compiler: Option<Box<dyn ShaderCompiler>>,
    buffers: SlotMap<BufferId, BufferStorage>,
    images: SlotMap<ImageId, ImageStorage>,
    samplers: SlotMap<SamplerId, SamplerState>,
    shaders: SlotMap<ShaderId, ShaderRecord>,
    command_pools: SlotMap<CommandPoolId, CommandPoolRecord>,
    command_buffers: SlotMap<CommandBufferId, CommandBufferRecord>,
    queues: SlotMap<CommandQueueId, QueueFamily>,
    fences: SlotMap<FenceId, FenceRecord>,
    semaphores: SlotMap<SemaphoreId, bool>,
    surfaces: SlotMap<SurfaceId, SurfaceRecord>,
    swapchains: SlotMap<SwapchainId, SwapchainRecord>,
    framebuffers: SlotMap<FramebufferId, ImageId>,
    layouts: LayoutTracker,
    descriptors: DescriptorStore,
}

impl HeadlessDriver {
    /// Create a headless device described by `config.headless`
    pub fn new(config: &DriverConfig) -> DriverResult<Self> {
        config
            .validate()
            .map_err(DriverError::InitializationFailed)?;
        let device = &config.headless;
        info!(
            "Headless device '{}': {} queue families, {} bytes of device memory",
            device.device_name,
            device.queue_families.len(),
            device.memory_budget
        );

        Ok(Self {
            device_name: device.device_name.clone(),
            families: device.queue_families.clone(),
            memory: MemoryBudget::new(device.memory_budget),
            compiler: None,
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
            descriptors: DescriptorStore::default(),
        })
    }

    /// Attach the compiler used by `compile_spirv_from_source`
    pub fn with_shader_compiler(mut self, compiler: Box<dyn ShaderCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Device memory currently reserved by buffers and images
    pub fn memory_used(&self) -> u64 {
        self.memory.used()
    }

    /// Layout of one image subresource once all submitted work has run
    pub fn image_layout(&self, image: ImageId, layer: u32, mip: u32) -> Option<ImageLayout> {
        self.layouts.layout(image, layer, mip)
    }

    /// Layout of one image subresource at the end of what `cb` has recorded
    pub fn recorded_image_layout(
        &self,
        cb: CommandBufferId,
        image: ImageId,
        layer: u32,
        mip: u32,
    ) -> Option<ImageLayout> {
        let record = self.command_buffers.get(cb)?;
        self.layouts.recorded_layout(&record.layouts, image, layer, mip)
    }

    /// Number of images a swapchain has presented successfully
    pub fn presented_frames(&self, swapchain: SwapchainId) -> Option<u64> {
        self.swapchains.get(swapchain).map(|record| record.presented)
    }

    /// Resource last written to a descriptor slot
    pub fn bound_descriptor(
        &self,
        set: &DescriptorSet,
        binding: u32,
        array_element: u32,
    ) -> Option<DescriptorResource> {
        self.descriptors.bound(set.id, binding, array_element)
    }

    /// Number of live descriptor pools
    pub fn descriptor_pool_count(&self) -> usize {
        self.descriptors.live_pool_count()
    }

    fn family(&self, family: QueueFamily) -> DriverResult<&QueueFamilyConfig> {
        self.families
            .get(family.index() as usize)
            .ok_or_else(|| DriverError::contract(format!("queue family {} does not exist", family.index())))
    }

    fn queue(&self, queue: CommandQueueId) -> DriverResult<QueueFamily> {
        self.queues
            .get(queue)
            .copied()
            .ok_or(DriverError::InvalidHandle { kind: "command queue" })
    }

    fn buffer_storage(&self, buffer: BufferId) -> DriverResult<&BufferStorage> {
        self.buffers
            .get(buffer)
            .ok_or(DriverError::InvalidHandle { kind: "buffer" })
    }

    fn image_storage(&self, image: ImageId) -> DriverResult<&ImageStorage> {
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

    fn check_recording(&self, cb: CommandBufferId, operation: &'static str) -> DriverResult<()> {
        self.command_buffer(cb)?.tracking.record(operation)
    }

    fn push(&mut self, cb: CommandBufferId, command: RecordedCommand) -> DriverResult<()> {
        self.command_buffer_mut(cb)?.commands.push(command);
        Ok(())
    }

    /// Record a command together with the layouts it expects
    fn push_using(
        &mut self,
        cb: CommandBufferId,
        uses: Vec<LayoutUse>,
        command: RecordedCommand,
    ) -> DriverResult<()> {
        let record = self.command_buffer_mut(cb)?;
        for used in uses {
            record.layouts.record(used);
        }
        record.commands.push(command);
        Ok(())
    }

    /// Usage/format combinations the headless device refuses
    fn check_image_capabilities(format: &ImageFormat) -> DriverResult<()> {
        let data = format.format;
        let usage = format.usage;
        if data.is_compressed()
            && usage.intersects(
                ImageUsage::COLOR_ATTACHMENT
                    | ImageUsage::DEPTH_STENCIL_ATTACHMENT
                    | ImageUsage::STORAGE,
            )
        {
            return Err(DriverError::unsupported(format!(
                "{data:?} cannot be used as an attachment or storage image"
            )));
        }
        if data.is_depth() && usage.intersects(ImageUsage::COLOR_ATTACHMENT | ImageUsage::STORAGE) {
            return Err(DriverError::unsupported(format!(
                "depth format {data:?} cannot be a color attachment or storage image"
            )));
        }
        if !data.is_depth() && usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
            return Err(DriverError::unsupported(format!(
                "{data:?} cannot be a depth/stencil attachment"
            )));
        }
        if format.samples != SampleCount::X1 {
            if format.texture_type != TextureType::Type2D || format.mipmaps != 1 {
                return Err(DriverError::unsupported(
                    "multisampling needs a single-mip 2D image",
                ));
            }
            if usage.contains(ImageUsage::CPU_READ) || data.is_compressed() {
                return Err(DriverError::unsupported(
                    "multisampled images cannot be compressed or CPU readable",
                ));
            }
        }
        Ok(())
    }

    fn allocate_image(
        &mut self,
        format: &ImageFormat,
        view: &ImageView,
        swapchain_owned: bool,
    ) -> DriverResult<Image> {
        format.validate()?;
        if !format.format.is_view_compatible(view.format) {
            return Err(DriverError::contract(format!(
                "view format {:?} is not compatible with {:?}",
                view.format, format.format
            )));
        }
        Self::check_image_capabilities(format)?;

        let size = format.total_size();
        self.memory.reserve(size)?;
        let data = vec![0u8; size as usize];
        let id = self.images.insert_with_key(|id| ImageStorage {
            image: Image {
                id,
                format: *format,
                view: *view,
            },
            data,
            mapped: false,
            swapchain_owned,
        });
        self.layouts.register(id, format, ImageLayout::Undefined);
        debug!("Created image {id:?}: {format:?}, {size} bytes");

        Ok(self.images[id].image)
    }

    fn release_image(&mut self, image: ImageId) {
        if let Some(storage) = self.images.remove(image) {
            self.memory.release(storage.image.format.total_size());
            self.layouts.forget(image);
        }
    }

    /// Check a layout is usable by a transfer and matches the one `cb` will find
    fn expect_transfer_layout(
        &self,
        cb: CommandBufferId,
        image: ImageId,
        range: &ImageSubresourceRange,
        layout: ImageLayout,
        source: bool,
        operation: &str,
    ) -> DriverResult<LayoutUse> {
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
        self.layouts.expect(overlay, image, range, layout, operation)
    }

    fn destroy_swapchain_images(&mut self, swapchain: SwapchainId) {
        let Some(record) = self.swapchains.get_mut(swapchain) else {
            return;
        };
        let images = std::mem::take(&mut record.images);
        let framebuffers = std::mem::take(&mut record.framebuffers);
        record.acquired = None;
        record.next_image = 0;
        for framebuffer in framebuffers {
            self.framebuffers.remove(framebuffer);
        }
        for image in images {
            self.release_image(image);
        }
    }
}

impl RenderingDeviceDriver for HeadlessDriver {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            backend: BackendKind::Headless,
            name: self.device_name.clone(),
            queue_families: self
                .families
                .iter()
                .enumerate()
                .map(|(index, family)| QueueFamilyInfo {
                    family: QueueFamily(index as u32),
                    flags: family.flags,
                    queue_count: family.queue_count,
                })
                .collect(),
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescription) -> DriverResult<Buffer> {
        let size = desc.validated_size()?;
        self.memory.reserve(size)?;
        let id = self.buffers.insert_with_key(|id| BufferStorage {
            buffer: Buffer::from_description(id, desc),
            data: vec![0u8; size as usize],
        });
        debug!("Created buffer {id:?}: {:?}, {size} bytes", desc.usage);
        Ok(self.buffers[id].buffer)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        match self.buffers.remove(buffer) {
            Some(storage) => self.memory.release(storage.buffer.size()),
            None => warn!("destroy of unknown buffer ignored"),
        }
    }

    fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> DriverResult<()> {
        let storage = self
            .buffers
            .get_mut(buffer.id)
            .ok_or(DriverError::InvalidHandle { kind: "buffer" })?;
        storage.buffer.check_host_range(offset, data.len() as u64)?;
        let start = offset as usize;
        storage.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &Buffer, offset: u64, out: &mut [u8]) -> DriverResult<()> {
        let storage = self.buffer_storage(buffer.id)?;
        storage.buffer.check_host_range(offset, out.len() as u64)?;
        let start = offset as usize;
        out.copy_from_slice(&storage.data[start..start + out.len()]);
        Ok(())
    }

    fn create_image(&mut self, format: &ImageFormat, view: &ImageView) -> DriverResult<Image> {
        self.allocate_image(format, view, false)
    }

    fn map_image(&mut self, image: &Image) -> DriverResult<&mut [u8]> {
        let storage = self
            .images
            .get_mut(image.id)
            .ok_or(DriverError::InvalidHandle { kind: "image" })?;
        if !storage.image.host_visible() {
            return Err(DriverError::NotHostVisible);
        }
        if storage.mapped {
            return Err(DriverError::contract("image is already mapped"));
        }
        storage.mapped = true;
        Ok(&mut storage.data)
    }

    fn unmap_image(&mut self, image: &Image) {
        match self.images.get_mut(image.id) {
            Some(storage) if storage.mapped => storage.mapped = false,
            Some(_) => warn!("unmap of an image that is not mapped ignored"),
            None => warn!("unmap of unknown image ignored"),
        }
    }

    fn destroy_image(&mut self, image: ImageId) {
        match self.images.get(image) {
            Some(storage) if storage.swapchain_owned => {
                warn!("swapchain images are destroyed with their swapchain");
            }
            Some(_) => self.release_image(image),
            None => warn!("destroy of unknown image ignored"),
        }
    }

    fn create_sampler(&mut self, state: &SamplerState) -> DriverResult<SamplerId> {
        state.validate()?;
        if state.use_anisotropy && state.anisotropy_max > MAX_ANISOTROPY {
            return Err(DriverError::unsupported(format!(
                "anisotropy {} exceeds device limit {MAX_ANISOTROPY}",
                state.anisotropy_max
            )));
        }
        Ok(self.samplers.insert(*state))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        if self.samplers.remove(sampler).is_none() {
            warn!("destroy of unknown sampler ignored");
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
        let id = self.shaders.insert(ShaderRecord { modules_live: true });

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
                self.shaders.remove(id);
                Err(e)
            }
        }
    }

    fn destroy_shader_modules(&mut self, shader: &Shader) {
        match self.shaders.get_mut(shader.id) {
            Some(record) => record.modules_live = false,
            None => warn!("destroy of modules of unknown shader ignored"),
        }
    }

    fn destroy_shader(&mut self, shader: Shader) {
        if self.shaders.remove(shader.id).is_none() {
            warn!("destroy of unknown shader '{}' ignored", shader.name);
            return;
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
        self.family(family)?;
        Ok(self.command_pools.insert(CommandPoolRecord {
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
        for cb in &record.buffers {
            if let Some(buffer) = self.command_buffers.get(*cb) {
                if buffer.tracking.state == CommandBufferState::Pending {
                    return Err(DriverError::contract(
                        "command pool reset while one of its buffers is pending",
                    ));
                }
            }
        }
        for cb in &record.buffers {
            if let Some(buffer) = self.command_buffers.get_mut(*cb) {
                buffer.tracking.state.invalidate();
                buffer.discard();
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&mut self, pool: CommandPoolId) {
        match self.command_pools.remove(pool) {
            Some(record) => {
                for cb in record.buffers {
                    self.command_buffers.remove(cb);
                }
            }
            None => warn!("destroy of unknown command pool ignored"),
        }
    }

    fn create_command_buffer(&mut self, pool: CommandPoolId) -> DriverResult<CommandBufferId> {
        let record = self
            .command_pools
            .get_mut(pool)
            .ok_or(DriverError::InvalidHandle { kind: "command pool" })?;
        let cb = self.command_buffers.insert(CommandBufferRecord {
            tracking: CommandBufferTracking::new(pool, record.kind),
            commands: Vec::new(),
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
        self.command_buffers.remove(cb);
        if let Some(pool) = self.command_pools.get_mut(pool) {
            pool.buffers.retain(|buffer| *buffer != cb);
        }
    }

    fn begin_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self.command_buffer_mut(cb)?;
        record.tracking.begin()?;
        record.discard();
        Ok(())
    }

    fn end_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        self.command_buffer_mut(cb)?.tracking.end()
    }

    fn reset_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self.command_buffer_mut(cb)?;
        record.tracking.reset()?;
        record.discard();
        Ok(())
    }

    fn wait_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self.command_buffer_mut(cb)?;
        match record.tracking.state {
            CommandBufferState::Invalid => Err(DriverError::InvalidCommandBufferState {
                operation: "wait on",
                state: CommandBufferState::Invalid,
            }),
            _ => {
                // Execution already happened at submission
                record.tracking.complete();
                Ok(())
            }
        }
    }

    fn command_buffer_state(&self, cb: CommandBufferId) -> DriverResult<CommandBufferState> {
        Ok(self.command_buffer(cb)?.tracking.state)
    }

    fn get_queue_family(
        &mut self,
        flags: QueueFamilyFlags,
        surface: Option<SurfaceId>,
    ) -> DriverResult<QueueFamily> {
        if let Some(surface) = surface {
            if !self.surfaces.contains_key(surface) {
                return Err(DriverError::InvalidHandle { kind: "surface" });
            }
        }
        self.families
            .iter()
            .position(|family| {
                family.flags.contains(flags) && (surface.is_none() || family.present)
            })
            .map(|index| QueueFamily(index as u32))
            .ok_or(DriverError::NoSuitableQueueFamily { requested: flags })
    }

    fn create_command_queue(&mut self, family: QueueFamily) -> DriverResult<CommandQueueId> {
        let limit = self.family(family)?.queue_count;
        let in_use = self.queues.values().filter(|queue| **queue == family).count() as u32;
        if in_use >= limit {
            return Err(DriverError::unsupported(format!(
                "queue family {} exposes only {limit} queue(s)",
                family.index()
            )));
        }
        Ok(self.queues.insert(family))
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
        let family = self.queue(queue)?;

        let mut seen = HashSet::new();
        for cb in command_buffers {
            if !seen.insert(*cb) {
                return Err(DriverError::contract("command buffer submitted twice in one batch"));
            }
            let record = self.command_buffer(*cb)?;
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

        let mut seen = HashSet::new();
        for semaphore in wait_semaphores {
            let signaled = self
                .semaphores
                .get(*semaphore)
                .ok_or(DriverError::InvalidHandle { kind: "semaphore" })?;
            if !seen.insert(*semaphore) || !*signaled {
                return Err(DriverError::contract(
                    "wait on a semaphore that no earlier submission signals",
                ));
            }
        }
        let mut seen = HashSet::new();
        for semaphore in signal_semaphores {
            let signaled = self
                .semaphores
                .get(*semaphore)
                .ok_or(DriverError::InvalidHandle { kind: "semaphore" })?;
            let waited = wait_semaphores.contains(semaphore);
            if !seen.insert(*semaphore) || (*signaled && !waited) {
                return Err(DriverError::contract(
                    "signal of a binary semaphore that is already signaled",
                ));
            }
        }
        if let Some(fence) = fence {
            let record = self
                .fences
                .get(fence)
                .ok_or(DriverError::InvalidHandle { kind: "fence" })?;
            if record.signaled {
                return Err(DriverError::contract("submission with a signaled fence"));
            }
        }
        if !swapchains.is_empty() && !self.family(family)?.present {
            return Err(DriverError::contract(format!(
                "queue family {} cannot present",
                family.index()
            )));
        }

        let submitted: Vec<&CommandBufferRecord> = command_buffers
            .iter()
            .filter_map(|cb| self.command_buffers.get(*cb))
            .collect();
        for command in submitted.iter().flat_map(|record| &record.commands) {
            command.check_handles(&self.buffers, &self.images)?;
        }
        let staged = self
            .layouts
            .stage(submitted.iter().map(|record| &record.layouts))?;

        for swapchain in swapchains {
            let record = self
                .swapchains
                .get(*swapchain)
                .ok_or(DriverError::InvalidHandle { kind: "swapchain" })?;
            let image = record
                .acquired
                .and_then(|index| record.images.get(index as usize))
                .copied()
                .ok_or_else(|| DriverError::contract("present without an acquired image"))?;
            let format = self.image_storage(image)?.image.format;
            self.layouts.expect_staged(
                &staged,
                image,
                &ImageSubresourceRange::whole(&format),
                ImageLayout::PresentSrc,
                "present",
            )?;
        }

        // Everything is checked; from here on the submission cannot fail
        let mut context = ExecutionContext {
            buffers: &mut self.buffers,
            images: &mut self.images,
        };
        for cb in command_buffers {
            if let Some(record) = self.command_buffers.get_mut(*cb) {
                for command in &record.commands {
                    context.execute(command)?;
                }
                record.layouts.clear();
            }
        }
        self.layouts.commit(staged);

        for semaphore in wait_semaphores {
            if let Some(signaled) = self.semaphores.get_mut(*semaphore) {
                *signaled = false;
            }
        }
        for cb in command_buffers {
            if let Some(record) = self.command_buffers.get_mut(*cb) {
                record.tracking.submit(queue, fence)?;
            }
        }
        for semaphore in signal_semaphores {
            if let Some(signaled) = self.semaphores.get_mut(*semaphore) {
                *signaled = true;
            }
        }
        if let Some(record) = fence.and_then(|fence| self.fences.get_mut(fence)) {
            record.signaled = true;
            record.pending.extend_from_slice(command_buffers);
        }

        let mut outcome = PresentOutcome::default();
        for swapchain in swapchains {
            let Some(record) = self.swapchains.get_mut(*swapchain) else {
                continue;
            };
            record.acquired = None;
            let current = self
                .surfaces
                .get(record.surface)
                .map(|surface| (surface.width, surface.height));
            if current == Some(record.extent) && !record.resize_required {
                record.presented += 1;
            } else {
                warn!("Swapchain {swapchain:?} is out of date; resize required");
                record.resize_required = true;
                outcome.out_of_date.push(*swapchain);
            }
        }
        Ok(outcome)
    }

    fn command_pipeline_barrier(
        &mut self,
        cb: CommandBufferId,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        _memory_barriers: &[MemoryBarrier],
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    ) -> DriverResult<()> {
        self.check_recording(cb, "record a pipeline barrier in")?;
        if src_stages.is_empty() || dst_stages.is_empty() {
            return Err(DriverError::contract("barrier stage masks must not be empty"));
        }
        for barrier in buffer_barriers {
            let buffer = self.buffer_storage(barrier.buffer)?.buffer;
            buffer.check_range(barrier.offset, barrier.size)?;
        }
        for barrier in image_barriers {
            let format = self.image_storage(barrier.image)?.image.format;
            barrier.subresources.validate(&format)?;
        }

        let record = self
            .command_buffers
            .get_mut(cb)
            .ok_or(DriverError::InvalidHandle { kind: "command buffer" })?;
        self.layouts.transition(&mut record.layouts, image_barriers)?;
        record.commands.push(RecordedCommand::Barrier);
        Ok(())
    }

    fn command_clear_buffer(
        &mut self,
        cb: CommandBufferId,
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) -> DriverResult<()> {
        self.check_recording(cb, "clear a buffer in")?;
        let buffer = self.buffer_storage(buffer.id)?.buffer;
        buffer.ensure_copy_destination()?;
        if offset % 4 != 0 || size % 4 != 0 {
            return Err(DriverError::contract("buffer clears must be 4-byte aligned"));
        }
        buffer.check_range(offset, size)?;
        self.push(
            cb,
            RecordedCommand::ClearBuffer {
                buffer: buffer.id,
                offset,
                size,
            },
        )
    }

    fn command_copy_buffer(
        &mut self,
        cb: CommandBufferId,
        src: &Buffer,
        dst: &Buffer,
        regions: &[BufferCopyRegion],
    ) -> DriverResult<()> {
        self.check_recording(cb, "copy a buffer in")?;
        let src = self.buffer_storage(src.id)?.buffer;
        let dst = self.buffer_storage(dst.id)?.buffer;
        src.ensure_copy_source()?;
        dst.ensure_copy_destination()?;
        if regions.is_empty() {
            return Err(DriverError::contract("copy needs at least one region"));
        }
        for region in regions {
            src.check_range(region.src_offset, region.size)?;
            dst.check_range(region.dst_offset, region.size)?;
            let overlaps = region.src_offset < region.dst_offset + region.size
                && region.dst_offset < region.src_offset + region.size;
            if src.id == dst.id && overlaps {
                return Err(DriverError::contract("source and destination ranges overlap"));
            }
        }
        self.push(
            cb,
            RecordedCommand::CopyBuffer {
                src: src.id,
                dst: dst.id,
                regions: regions.to_vec(),
            },
        )
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
        self.check_recording(cb, "copy an image in")?;
        let src = self.image_storage(src.id)?.image;
        let dst = self.image_storage(dst.id)?.image;
        src.ensure_copy_source()?;
        dst.ensure_copy_destination()?;
        src.ensure_copyable_format()?;
        dst.ensure_copyable_format()?;
        if src.format.samples != dst.format.samples {
            return Err(DriverError::contract("image copies need equal sample counts"));
        }
        if src.format.format.block_size() != dst.format.format.block_size()
            || src.format.format.block_extent() != dst.format.format.block_extent()
        {
            return Err(DriverError::contract(format!(
                "{:?} and {:?} are not copy compatible",
                src.format.format, dst.format.format
            )));
        }
        if regions.is_empty() {
            return Err(DriverError::contract("copy needs at least one region"));
        }
        let mut uses = Vec::with_capacity(regions.len() * 2);
        for region in regions {
            if region.src_subresources.layer_count != region.dst_subresources.layer_count {
                return Err(DriverError::contract("copy regions need equal layer counts"));
            }
            region
                .src_subresources
                .validate_region(&src.format, region.src_offset, region.extent)?;
            region
                .dst_subresources
                .validate_region(&dst.format, region.dst_offset, region.extent)?;
            uses.push(self.expect_transfer_layout(
                cb,
                src.id,
                &region.src_subresources.as_range(),
                src_layout,
                true,
                "image copy source",
            )?);
            uses.push(self.expect_transfer_layout(
                cb,
                dst.id,
                &region.dst_subresources.as_range(),
                dst_layout,
                false,
                "image copy destination",
            )?);
        }
        self.push_using(
            cb,
            uses,
            RecordedCommand::CopyImage {
                src: src.id,
                dst: dst.id,
                regions: regions.to_vec(),
            },
        )
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
        self.check_recording(cb, "resolve an image in")?;
        let src = self.image_storage(src.id)?.image;
        let dst = self.image_storage(dst.id)?.image;
        src.ensure_copy_source()?;
        dst.ensure_copy_destination()?;
        if src.format.samples == SampleCount::X1 || dst.format.samples != SampleCount::X1 {
            return Err(DriverError::contract(
                "resolve needs a multisampled source and a single-sampled destination",
            ));
        }
        if src.format.format != dst.format.format || src.format.format.is_depth() {
            return Err(DriverError::contract(
                "resolve needs matching color formats",
            ));
        }

        let src_layers = ImageSubresourceLayers {
            mip_level: src_mip,
            ..ImageSubresourceLayers::color(src_layer)
        };
        let dst_layers = ImageSubresourceLayers {
            mip_level: dst_mip,
            ..ImageSubresourceLayers::color(dst_layer)
        };
        src_layers.as_range().validate(&src.format)?;
        dst_layers.as_range().validate(&dst.format)?;
        let extent = src.format.mip_extent(src_mip);
        if extent != dst.format.mip_extent(dst_mip) {
            return Err(DriverError::contract("resolve needs equal subresource extents"));
        }
        let uses = vec![
            self.expect_transfer_layout(
                cb,
                src.id,
                &src_layers.as_range(),
                src_layout,
                true,
                "resolve source",
            )?,
            self.expect_transfer_layout(
                cb,
                dst.id,
                &dst_layers.as_range(),
                dst_layout,
                false,
                "resolve destination",
            )?,
        ];

        // One sample is stored per texel, so resolving is a copy
        self.push_using(
            cb,
            uses,
            RecordedCommand::CopyImage {
                src: src.id,
                dst: dst.id,
                regions: vec![ImageCopyRegion {
                    src_subresources: src_layers,
                    src_offset: [0; 3],
                    dst_subresources: dst_layers,
                    dst_offset: [0; 3],
                    extent,
                }],
            },
        )
    }

    fn command_clear_color_image(
        &mut self,
        cb: CommandBufferId,
        image: &Image,
        layout: ImageLayout,
        color: [f32; 4],
        range: &ImageSubresourceRange,
    ) -> DriverResult<()> {
        self.check_recording(cb, "clear an image in")?;
        let image = self.image_storage(image.id)?.image;
        image.ensure_copy_destination()?;
        if image.format.format.is_depth() || image.format.format.is_compressed() {
            return Err(DriverError::contract(format!(
                "{:?} cannot be cleared as color",
                image.format.format
            )));
        }
        range.validate(&image.format)?;
        let used = self.expect_transfer_layout(cb, image.id, range, layout, false, "color clear")?;
        let texel = image.format.format.encode_color(color).ok_or_else(|| {
            DriverError::unsupported(format!("color clears of {:?}", image.format.format))
        })?;
        self.push_using(
            cb,
            vec![used],
            RecordedCommand::ClearColor {
                image: image.id,
                texel,
                range: *range,
            },
        )
    }

    fn command_copy_buffer_to_image(
        &mut self,
        cb: CommandBufferId,
        src: &Buffer,
        dst: &Image,
        dst_layout: ImageLayout,
        regions: &[BufferImageCopyRegion],
    ) -> DriverResult<()> {
        self.check_recording(cb, "copy a buffer to an image in")?;
        let src = self.buffer_storage(src.id)?.buffer;
        let dst = self.image_storage(dst.id)?.image;
        src.ensure_copy_source()?;
        dst.ensure_copy_destination()?;
        dst.ensure_copyable_format()?;
        if regions.is_empty() {
            return Err(DriverError::contract("copy needs at least one region"));
        }
        let mut uses = Vec::with_capacity(regions.len());
        for region in regions {
            region
                .subresources
                .validate_region(&dst.format, region.image_offset, region.image_extent)?;
            src.check_range(region.buffer_offset, region.buffer_size(dst.format.format))?;
            uses.push(self.expect_transfer_layout(
                cb,
                dst.id,
                &region.subresources.as_range(),
                dst_layout,
                false,
                "buffer to image copy",
            )?);
        }
        self.push_using(
            cb,
            uses,
            RecordedCommand::CopyBufferToImage {
                src: src.id,
                dst: dst.id,
                regions: regions.to_vec(),
            },
        )
    }

    fn command_copy_image_to_buffer(
        &mut self,
        cb: CommandBufferId,
        src: &Image,
        src_layout: ImageLayout,
        dst: &Buffer,
        regions: &[BufferImageCopyRegion],
    ) -> DriverResult<()> {
        self.check_recording(cb, "copy an image to a buffer in")?;
        let src = self.image_storage(src.id)?.image;
        let dst = self.buffer_storage(dst.id)?.buffer;
        src.ensure_copy_source()?;
        dst.ensure_copy_destination()?;
        src.ensure_copyable_format()?;
        if regions.is_empty() {
            return Err(DriverError::contract("copy needs at least one region"));
        }
        let mut uses = Vec::with_capacity(regions.len());
        for region in regions {
            region
                .subresources
                .validate_region(&src.format, region.image_offset, region.image_extent)?;
            dst.check_range(region.buffer_offset, region.buffer_size(src.format.format))?;
            uses.push(self.expect_transfer_layout(
                cb,
                src.id,
                &region.subresources.as_range(),
                src_layout,
                true,
                "image to buffer copy",
            )?);
        }
        self.push_using(
            cb,
            uses,
            RecordedCommand::CopyImageToBuffer {
                src: src.id,
                dst: dst.id,
                regions: regions.to_vec(),
            },
        )
    }

    fn command_begin_label(
        &mut self,
        cb: CommandBufferId,
        name: &str,
        _color: [f32; 4],
    ) -> DriverResult<()> {
        let record = self.command_buffer_mut(cb)?;
        record.tracking.begin_label()?;
        record.commands.push(RecordedCommand::BeginLabel(name.to_string()));
        Ok(())
    }

    fn command_end_label(&mut self, cb: CommandBufferId) -> DriverResult<()> {
        let record = self.command_buffer_mut(cb)?;
        record.tracking.end_label()?;
        record.commands.push(RecordedCommand::EndLabel);
        Ok(())
    }

    fn create_surface(&mut self, target: &SurfaceTarget) -> DriverResult<SurfaceId> {
        let (width, height) = target.size();
        if matches!(target, SurfaceTarget::Window { .. }) {
            debug!("Headless surface ignores the native window handle");
        }
        Ok(self.surfaces.insert(SurfaceRecord { width, height }))
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
        if self.surfaces.remove(surface).is_none() {
            warn!("destroy of unknown surface ignored");
        }
    }

    fn create_swapchain(&mut self, surface: SurfaceId) -> DriverResult<SwapchainId> {
        if !self.surfaces.contains_key(surface) {
            return Err(DriverError::InvalidHandle { kind: "surface" });
        }
        Ok(self.swapchains.insert(SwapchainRecord {
            surface,
            extent: (0, 0),
            images: Vec::new(),
            framebuffers: Vec::new(),
            next_image: 0,
            acquired: None,
            resize_required: true,
            presented: 0,
        }))
    }

    fn resize_swapchain(
        &mut self,
        queue: CommandQueueId,
        swapchain: SwapchainId,
        desired_image_count: u32,
    ) -> DriverResult<()> {
        let family = self.queue(queue)?;
        if !self.family(family)?.present {
            return Err(DriverError::contract(format!(
                "queue family {} cannot present",
                family.index()
            )));
        }
        let record = self
            .swapchains
            .get(swapchain)
            .ok_or(DriverError::InvalidHandle { kind: "swapchain" })?;
        if record.acquired.is_some() {
            return Err(DriverError::contract("swapchain resized while an image is acquired"));
        }
        let (width, height) = self
            .surfaces
            .get(record.surface)
            .map(|surface| (surface.width, surface.height))
            .ok_or(DriverError::InvalidHandle { kind: "surface" })?;

        self.destroy_swapchain_images(swapchain);

        if width == 0 || height == 0 {
            if let Some(record) = self.swapchains.get_mut(swapchain) {
                record.extent = (0, 0);
                record.resize_required = true;
            }
            debug!("Swapchain {swapchain:?} stays unsized while the surface is empty");
            return Ok(());
        }

        let count = desired_image_count.clamp(1, MAX_SWAPCHAIN_IMAGES);
        let format = ImageFormat::new_2d(
            SWAPCHAIN_FORMAT,
            width,
            height,
            ImageUsage::COLOR_ATTACHMENT
                | ImageUsage::COPY_SOURCE
                | ImageUsage::COPY_DESTINATION
                | ImageUsage::CPU_READ,
        );
        let view = ImageView::new(SWAPCHAIN_FORMAT);
        let mut images = Vec::with_capacity(count as usize);
        let mut framebuffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.allocate_image(&format, &view, true) {
                Ok(image) => {
                    images.push(image.id);
                    framebuffers.push(self.framebuffers.insert(image.id));
                }
                Err(e) => {
                    for framebuffer in framebuffers {
                        self.framebuffers.remove(framebuffer);
                    }
                    for image in images {
                        self.release_image(image);
                    }
                    return Err(e);
                }
            }
        }

        if let Some(record) = self.swapchains.get_mut(swapchain) {
            record.images = images;
            record.framebuffers = framebuffers;
            record.extent = (width, height);
            record.resize_required = false;
        }
        info!("Swapchain {swapchain:?} sized {width}x{height} with {count} images");
        Ok(())
    }

    fn acquire_swapchain_framebuffer(
        &mut self,
        queue: CommandQueueId,
        swapchain: SwapchainId,
    ) -> DriverResult<AcquireOutcome> {
        self.queue(queue)?;
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

        let index = record.next_image;
        record.next_image = (index + 1) % record.images.len() as u32;
        record.acquired = Some(index);
        let image = record.images[index as usize];
        let framebuffer = record.framebuffers[index as usize];
        let image = self.image_storage(image)?.image;
        Ok(AcquireOutcome::Ready(SwapchainFrame {
            framebuffer,
            image,
            index,
        }))
    }

    fn swapchain_format(&self, swapchain: SwapchainId) -> DriverResult<DataFormat> {
        if self.swapchains.contains_key(swapchain) {
            Ok(SWAPCHAIN_FORMAT)
        } else {
            Err(DriverError::InvalidHandle { kind: "swapchain" })
        }
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
        self.destroy_swapchain_images(swapchain);
        self.swapchains.remove(swapchain);
    }

    fn create_fence(&mut self) -> DriverResult<FenceId> {
        Ok(self.fences.insert(FenceRecord {
            signaled: false,
            pending: Vec::new(),
        }))
    }

    fn wait_on_fence(&mut self, fence: FenceId) -> DriverResult<()> {
        let record = self
            .fences
            .get_mut(fence)
            .ok_or(DriverError::InvalidHandle { kind: "fence" })?;
        if !record.signaled {
            // Nothing submitted with this fence can ever signal it
            return Err(DriverError::Timeout);
        }
        record.signaled = false;
        let pending = std::mem::take(&mut record.pending);
        for cb in pending {
            if let Some(buffer) = self.command_buffers.get_mut(cb) {
                if buffer.tracking.fence == Some(fence) {
                    buffer.tracking.complete();
                }
            }
        }
        Ok(())
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        if self.fences.remove(fence).is_none() {
            warn!("destroy of unknown fence ignored");
        }
    }

    fn create_semaphore(&mut self) -> DriverResult<SemaphoreId> {
        Ok(self.semaphores.insert(false))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreId) {
        if self.semaphores.remove(semaphore).is_none() {
            warn!("destroy of unknown semaphore ignored");
        }
    }
}
