//! Graphics backend implementations
//!
//! [`HeadlessDriver`] runs everything on the CPU and checks every contract.
//! [`VulkanDriver`] is the hardware backend, enabled by the `vulkan` feature.

pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use headless::HeadlessDriver;
#[cfg(feature = "vulkan")]
pub use vulkan::{VulkanContext, VulkanDriver};
