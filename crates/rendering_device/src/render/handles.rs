//! Opaque resource handles
//!
//! Handles are generational keys into per-backend tables, so a stale handle
//! is never confused with a newer resource that reused its slot.

use slotmap::new_key_type;

new_key_type! {
    /// Buffer handle
    pub struct BufferId;
    /// Image handle
    pub struct ImageId;
    /// Sampler handle
    pub struct SamplerId;
    /// Shader handle
    pub struct ShaderId;
    /// Command pool handle
    pub struct CommandPoolId;
    /// Command buffer handle
    pub struct CommandBufferId;
    /// Command queue handle
    pub struct CommandQueueId;
    /// Fence handle
    pub struct FenceId;
    /// Semaphore handle
    pub struct SemaphoreId;
    /// Surface handle
    pub struct SurfaceId;
    /// Swapchain handle
    pub struct SwapchainId;
    /// Framebuffer handle
    pub struct FramebufferId;
    /// Descriptor pool handle
    pub struct DescriptorPoolId;
    /// Descriptor set handle
    pub struct DescriptorSetId;
    /// Descriptor set layout handle
    pub struct DescriptorSetLayoutId;
}

/// Index of a queue family on the active device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueFamily(pub u32);

impl QueueFamily {
    /// Raw family index
    pub const fn index(self) -> u32 {
        self.0
    }
}
