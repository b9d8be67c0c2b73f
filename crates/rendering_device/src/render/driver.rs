//! The rendering device driver interface
//!
//! [`RenderingDeviceDriver`] is the single point through which GPU resources
//! are created, destroyed and used, and the only place commands are recorded
//! and submitted. Client code is written against `dyn RenderingDeviceDriver`;
//! each graphics API provides one implementation.
//!
//! # Contracts
//!
//! Destroying a resource still referenced by pending GPU work, destroying a
//! handle twice, and recording into a command buffer that is not recording
//! are precondition violations. Checking backends report them as
//! [`DriverError::ContractViolation`] or
//! [`DriverError::InvalidCommandBufferState`]; the Vulkan backend only checks
//! them in debug builds.
//!
//! Image layouts are never corrected implicitly. Every command that touches an
//! image declares the layout it expects, and a preceding barrier must have put
//! the image into it.
//!
//! [`DriverError::ContractViolation`]: super::error::DriverError::ContractViolation
//! [`DriverError::InvalidCommandBufferState`]: super::error::DriverError::InvalidCommandBufferState

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::barrier::{BufferBarrier, ImageBarrier, ImageLayout, MemoryBarrier};
use super::command::{CommandBufferState, CommandBufferType};
use super::descriptor::DescriptorDevice;
use super::error::DriverResult;
use super::flags::{PipelineStages, QueueFamilyFlags};
use super::handles::{
    BufferId, CommandBufferId, CommandPoolId, CommandQueueId, FenceId, FramebufferId, ImageId,
    QueueFamily, SamplerId, SemaphoreId, SurfaceId, SwapchainId,
};
use super::resources::{Buffer, Image};
use super::shader::{Shader, ShaderLanguage, ShaderStage, ShaderStageSpirv};
use super::types::{
    BufferCopyRegion, BufferDescription, BufferImageCopyRegion, DataFormat, ImageCopyRegion,
    ImageFormat, ImageSubresourceRange, ImageView, SamplerState,
};

/// Which implementation is behind a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// CPU reference implementation
    Headless,
    /// Vulkan through ash
    Vulkan,
}

/// Capabilities of one queue family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    /// Family index
    pub family: QueueFamily,
    /// Supported work
    pub flags: QueueFamilyFlags,
    /// Number of queues
    pub queue_count: u32,
}

/// Description of the active device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Implementation kind
    pub backend: BackendKind,
    /// Device name
    pub name: String,
    /// Exposed queue families
    pub queue_families: Vec<QueueFamilyInfo>,
}

/// What a surface presents to
#[derive(Debug, Clone, Copy)]
pub enum SurfaceTarget {
    /// A native window supplied by the windowing layer
    Window {
        /// Display connection
        display: RawDisplayHandle,
        /// Window handle
        window: RawWindowHandle,
        /// Framebuffer width in pixels
        width: u32,
        /// Framebuffer height in pixels
        height: u32,
    },
    /// No window; images are kept by the driver
    Offscreen {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
    },
}

impl SurfaceTarget {
    /// Initial framebuffer size
    pub const fn size(&self) -> (u32, u32) {
        match *self {
            Self::Window { width, height, .. } | Self::Offscreen { width, height } => {
                (width, height)
            }
        }
    }
}

/// The image a frame renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainFrame {
    /// Framebuffer wrapping the image
    pub framebuffer: FramebufferId,
    /// Presentable image
    pub image: Image,
    /// Index of the image in the swapchain
    pub index: u32,
}

/// Result of asking for the next presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready for rendering
    Ready(SwapchainFrame),
    /// The swapchain must be resized before rendering; skip this frame
    ResizeRequired,
}

impl AcquireOutcome {
    /// Whether the caller must resize before the next acquire
    pub const fn resize_required(&self) -> bool {
        matches!(self, Self::ResizeRequired)
    }
}

/// Result of a submission that presented swapchains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentOutcome {
    /// Swapchains the compositor reported out of date or suboptimal
    pub out_of_date: Vec<SwapchainId>,
}

/// Rendering device driver
///
/// All methods take `&mut self`; a driver is owned by one thread at a time.
pub trait RenderingDeviceDriver: DescriptorDevice {
    /// Describe the device
    fn device_info(&self) -> DeviceInfo;

    // Buffers

    /// Create a buffer of `count * stride` bytes
    fn create_buffer(&mut self, desc: &BufferDescription) -> DriverResult<Buffer>;

    /// Destroy a buffer; pending GPU work must no longer reference it
    fn destroy_buffer(&mut self, buffer: BufferId);

    /// Copy `data` into a host-visible buffer at `offset`
    fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> DriverResult<()>;

    /// Copy bytes at `offset` of a host-visible buffer into `out`
    fn read_buffer(&mut self, buffer: &Buffer, offset: u64, out: &mut [u8]) -> DriverResult<()>;

    // Images

    /// Create an image and its view
    fn create_image(&mut self, format: &ImageFormat, view: &ImageView) -> DriverResult<Image>;

    /// Map a CPU-readable image
    ///
    /// The slice holds every subresource, layer-major, tightly packed. Images
    /// created without [`ImageUsage::CPU_READ`] fail with
    /// [`DriverError::NotHostVisible`].
    ///
    /// [`ImageUsage::CPU_READ`]: super::flags::ImageUsage::CPU_READ
    /// [`DriverError::NotHostVisible`]: super::error::DriverError::NotHostVisible
    fn map_image(&mut self, image: &Image) -> DriverResult<&mut [u8]>;

    /// End a mapping started by [`Self::map_image`]
    fn unmap_image(&mut self, image: &Image);

    /// Destroy an image
    fn destroy_image(&mut self, image: ImageId);

    // Samplers

    /// Create a sampler
    fn create_sampler(&mut self, state: &SamplerState) -> DriverResult<SamplerId>;

    /// Destroy a sampler
    fn destroy_sampler(&mut self, sampler: SamplerId);

    // Shaders

    /// Compile one stage to SPIR-V through the attached compiler
    fn compile_spirv_from_source(
        &mut self,
        stage: ShaderStage,
        source: &str,
        language: ShaderLanguage,
    ) -> DriverResult<Vec<u8>>;

    /// Reflect and link per-stage binaries into a shader
    fn create_shader_from_spirv(
        &mut self,
        name: &str,
        stages: &[ShaderStageSpirv],
    ) -> DriverResult<Shader>;

    /// Release the stage modules, keeping the reflected layouts
    fn destroy_shader_modules(&mut self, shader: &Shader);

    /// Destroy a shader and its set layouts
    fn destroy_shader(&mut self, shader: Shader);

    // Command pools and buffers

    /// Create a pool for buffers of `kind` submitted to `family`
    fn create_command_pool(
        &mut self,
        family: QueueFamily,
        kind: CommandBufferType,
    ) -> DriverResult<CommandPoolId>;

    /// Reset the pool; every buffer allocated from it becomes invalid
    fn reset_command_pool(&mut self, pool: CommandPoolId) -> DriverResult<()>;

    /// Destroy the pool and its buffers
    fn destroy_command_pool(&mut self, pool: CommandPoolId);

    /// Allocate a buffer in the initial state
    fn create_command_buffer(&mut self, pool: CommandPoolId) -> DriverResult<CommandBufferId>;

    /// Free a buffer back to its pool; it must not be pending
    fn destroy_command_buffer(&mut self, cb: CommandBufferId);

    /// Start recording
    fn begin_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()>;

    /// Finish recording
    fn end_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()>;

    /// Return the buffer to the initial state without waiting
    fn reset_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()>;

    /// Block until the buffer's pending work completes
    fn wait_command_buffer(&mut self, cb: CommandBufferId) -> DriverResult<()>;

    /// Current lifecycle state
    fn command_buffer_state(&self, cb: CommandBufferId) -> DriverResult<CommandBufferState>;

    // Queues

    /// First family supporting every bit of `flags`, and `surface` if given
    fn get_queue_family(
        &mut self,
        flags: QueueFamilyFlags,
        surface: Option<SurfaceId>,
    ) -> DriverResult<QueueFamily>;

    /// Create a queue on `family`
    fn create_command_queue(&mut self, family: QueueFamily) -> DriverResult<CommandQueueId>;

    /// Destroy a queue
    fn destroy_command_queue(&mut self, queue: CommandQueueId);

    /// Submit buffers in order, then present
    ///
    /// Execution starts once every wait semaphore is signaled. On completion
    /// the signal semaphores and the fence are signaled. Each swapchain then
    /// presents its acquired image; swapchains the compositor rejects are
    /// returned in [`PresentOutcome::out_of_date`] and need a resize.
    fn execute_command_queue_and_present(
        &mut self,
        queue: CommandQueueId,
        wait_semaphores: &[SemaphoreId],
        command_buffers: &[CommandBufferId],
        signal_semaphores: &[SemaphoreId],
        fence: Option<FenceId>,
        swapchains: &[SwapchainId],
    ) -> DriverResult<PresentOutcome>;

    // Recorded commands

    /// Record a pipeline barrier
    ///
    /// Work in `src_stages` recorded before the barrier completes, with
    /// respect to the access masks, before work in `dst_stages` recorded after
    /// it starts. Image barriers also move the image to their new layout.
    fn command_pipeline_barrier(
        &mut self,
        cb: CommandBufferId,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        memory_barriers: &[MemoryBarrier],
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    ) -> DriverResult<()>;

    /// Fill `size` bytes at `offset` with zero
    fn command_clear_buffer(
        &mut self,
        cb: CommandBufferId,
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) -> DriverResult<()>;

    /// Copy byte ranges between buffers
    fn command_copy_buffer(
        &mut self,
        cb: CommandBufferId,
        src: &Buffer,
        dst: &Buffer,
        regions: &[BufferCopyRegion],
    ) -> DriverResult<()>;

    /// Copy texel regions between images
    fn command_copy_image(
        &mut self,
        cb: CommandBufferId,
        src: &Image,
        src_layout: ImageLayout,
        dst: &Image,
        dst_layout: ImageLayout,
        regions: &[ImageCopyRegion],
    ) -> DriverResult<()>;

    /// Resolve one multisampled subresource into a single-sampled one
    #[allow(clippy::too_many_arguments)]
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
    ) -> DriverResult<()>;

    /// Clear color subresources
    fn command_clear_color_image(
        &mut self,
        cb: CommandBufferId,
        image: &Image,
        layout: ImageLayout,
        color: [f32; 4],
        range: &ImageSubresourceRange,
    ) -> DriverResult<()>;

    /// Copy buffer data into image regions
    fn command_copy_buffer_to_image(
        &mut self,
        cb: CommandBufferId,
        src: &Buffer,
        dst: &Image,
        dst_layout: ImageLayout,
        regions: &[BufferImageCopyRegion],
    ) -> DriverResult<()>;

    /// Copy image regions into a buffer
    fn command_copy_image_to_buffer(
        &mut self,
        cb: CommandBufferId,
        src: &Image,
        src_layout: ImageLayout,
        dst: &Buffer,
        regions: &[BufferImageCopyRegion],
    ) -> DriverResult<()>;

    /// Open a debug label scope
    fn command_begin_label(
        &mut self,
        cb: CommandBufferId,
        name: &str,
        color: [f32; 4],
    ) -> DriverResult<()>;

    /// Close the innermost debug label scope
    fn command_end_label(&mut self, cb: CommandBufferId) -> DriverResult<()>;

    // Surfaces and swapchains

    /// Create a presentation surface
    fn create_surface(&mut self, target: &SurfaceTarget) -> DriverResult<SurfaceId>;

    /// Report a framebuffer size change; swapchains on the surface must resize
    fn surface_set_size(&mut self, surface: SurfaceId, width: u32, height: u32)
        -> DriverResult<()>;

    /// Destroy a surface; its swapchains must be destroyed first
    fn destroy_surface(&mut self, surface: SurfaceId);

    /// Create a swapchain for `surface`
    ///
    /// The swapchain has no images until [`Self::resize_swapchain`] is called.
    fn create_swapchain(&mut self, surface: SurfaceId) -> DriverResult<SwapchainId>;

    /// (Re)create the swapchain images at the surface's current size
    fn resize_swapchain(
        &mut self,
        queue: CommandQueueId,
        swapchain: SwapchainId,
        desired_image_count: u32,
    ) -> DriverResult<()>;

    /// Acquire the next presentable image
    ///
    /// [`AcquireOutcome::ResizeRequired`] is not an error: skip the frame,
    /// resize and try again next frame.
    fn acquire_swapchain_framebuffer(
        &mut self,
        queue: CommandQueueId,
        swapchain: SwapchainId,
    ) -> DriverResult<AcquireOutcome>;

    /// Format of the swapchain images
    fn swapchain_format(&self, swapchain: SwapchainId) -> DriverResult<DataFormat>;

    /// Size of the swapchain images
    fn swapchain_extent(&self, swapchain: SwapchainId) -> DriverResult<(u32, u32)>;

    /// Destroy a swapchain and its images
    fn destroy_swapchain(&mut self, swapchain: SwapchainId);

    // Synchronization

    /// Create an unsignaled fence
    fn create_fence(&mut self) -> DriverResult<FenceId>;

    /// Block until the fence signals, then reset it
    fn wait_on_fence(&mut self, fence: FenceId) -> DriverResult<()>;

    /// Destroy a fence
    fn destroy_fence(&mut self, fence: FenceId);

    /// Create a binary semaphore
    fn create_semaphore(&mut self) -> DriverResult<SemaphoreId>;

    /// Destroy a semaphore
    fn destroy_semaphore(&mut self, semaphore: SemaphoreId);
}
