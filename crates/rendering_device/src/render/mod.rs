//! # Rendering Device
//!
//! The API-agnostic driver layer. Everything GPU-facing goes through
//! [`RenderingDeviceDriver`]: resource lifetime, command recording,
//! submission, presentation and synchronization.
//!
//! ## Layout
//!
//! - **Handles and types**: opaque ids plus the plain data describing buffers,
//!   images, samplers and copy regions
//! - **Commands**: the command buffer state machine shared by all backends
//! - **Barriers**: memory dependencies and image layout tracking
//! - **Descriptors**: set layouts, pools and the expanding pool allocator
//! - **Shaders**: SPIR-V compilation hooks and reflection
//! - **Backends**: headless (CPU) and Vulkan implementations

pub mod backends;
pub mod barrier;
pub mod command;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod flags;
pub mod handles;
pub mod resources;
pub mod shader;
pub mod types;

pub use backends::HeadlessDriver;
#[cfg(feature = "vulkan")]
pub use backends::VulkanDriver;
pub use barrier::{BufferBarrier, ImageBarrier, ImageLayout, MemoryBarrier};
pub use command::{CommandBufferState, CommandBufferType};
pub use descriptor::{
    DescriptorDevice, DescriptorPool, DescriptorPoolExpanding, DescriptorResource, DescriptorSet,
    DescriptorSetLayoutBinding, DescriptorSetLayoutBuilder, DescriptorSetWriter, DescriptorType,
    PoolSizeRatio,
};
pub use driver::{
    AcquireOutcome, BackendKind, DeviceInfo, PresentOutcome, QueueFamilyInfo,
    RenderingDeviceDriver, SurfaceTarget, SwapchainFrame,
};
pub use error::{DriverError, DriverResult, ShaderError};
pub use flags::{
    BarrierAccess, BufferUsage, ImageAspect, ImageUsage, PipelineStages, QueueFamilyFlags,
    ShaderStages,
};
pub use handles::*;
pub use resources::{Buffer, Image, Mappable, Transferable};
pub use shader::{Shader, ShaderLanguage, ShaderStage, ShaderStageSpirv};
pub use types::*;
