//! # Rendering Device
//!
//! A backend-agnostic rendering device driver layer. Client code creates
//! buffers, images, samplers and shaders, records transfer work into command
//! buffers, submits them to queues and presents swapchain images, all through
//! one trait: [`RenderingDeviceDriver`](render::RenderingDeviceDriver).
//!
//! ## Features
//!
//! - **Headless backend**: a CPU implementation that checks every contract
//! - **Vulkan backend** (`vulkan`, default): the hardware implementation on ash
//! - **Descriptor allocation**: an expanding pool allocator that grows on demand
//! - **Shader reflection**: descriptor layouts derived from SPIR-V
//! - **OBJ import** (`obj`): triangle meshes through `tobj`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rendering_device::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     rendering_device::foundation::logging::init();
//!     let config = DriverConfig::default();
//!     let mut driver = HeadlessDriver::new(&config)?;
//!
//!     let buffer = driver.create_buffer(&BufferDescription::new(BufferUsage::UNIFORM, 4, 12))?;
//!     driver.write_buffer(&buffer, 0, &[0u8; 48])?;
//!     driver.destroy_buffer(buffer.id);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc
)]

pub mod assets;
pub mod config;
pub mod foundation;
pub mod render;

/// Common imports for driver users
pub mod prelude {
    pub use crate::{
        assets::{upload_mesh, MeshBuffers, MeshCache, MeshData, MeshImporter},
        config::{Config, DriverConfig, PresentMode},
        foundation::KeyedCache,
        render::{
            AcquireOutcome, BarrierAccess, Buffer, BufferBarrier, BufferCopyRegion,
            BufferDescription, BufferImageCopyRegion, BufferUsage, CommandBufferState,
            CommandBufferType, DataFormat, DescriptorDevice, DescriptorPoolExpanding,
            DescriptorSetWriter, DriverError, DriverResult, HeadlessDriver, Image, ImageBarrier,
            ImageFormat, ImageLayout, ImageSubresourceLayers, ImageSubresourceRange, ImageUsage,
            ImageView, Mappable, MemoryBarrier, PipelineStages, QueueFamilyFlags,
            RenderingDeviceDriver, SamplerState, SurfaceTarget, Transferable,
        },
    };

    #[cfg(feature = "vulkan")]
    pub use crate::render::VulkanDriver;
}
