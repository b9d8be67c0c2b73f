//! Driver error types
//!
//! Every fallible driver operation returns [`DriverResult`]. Variants are
//! grouped by how callers are expected to react: capability errors and pool
//! exhaustion are recoverable, device loss and memory exhaustion end the
//! current frame, contract violations are only reported by checking builds.

use thiserror::Error;

#[cfg(feature = "vulkan")]
use ash::vk;

use super::command::CommandBufferState;
use super::flags::QueueFamilyFlags;
use super::shader::ShaderStage;

/// Rendering device driver errors
#[derive(Error, Debug)]
pub enum DriverError {
    /// Requested usage/format/feature combination is not supported
    #[error("Unsupported: {what}")]
    Unsupported {
        /// Description of the missing capability
        what: String,
    },

    /// No queue family satisfies the requested capabilities
    #[error("No suitable queue family for {requested:?}")]
    NoSuitableQueueFamily {
        /// Capabilities that were requested
        requested: QueueFamilyFlags,
    },

    /// Host access to memory that is not host visible
    #[error("Resource memory is not host visible")]
    NotHostVisible,

    /// Device memory allocation failed
    #[error("Out of device memory: {requested} bytes")]
    OutOfDeviceMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Host memory allocation failed
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Descriptor pool has no room for the requested set
    #[error("Descriptor pool out of memory")]
    OutOfPoolMemory,

    /// Descriptor pool is too fragmented for the requested set
    #[error("Descriptor pool fragmented")]
    FragmentedPool,

    /// A freshly grown descriptor pool still could not serve the allocation
    #[error("Descriptor allocation failed after pool rotation ({sets_per_pool} sets per pool)")]
    DescriptorAllocationExhausted {
        /// Capacity of the pool that failed the retry
        sets_per_pool: u32,
    },

    /// The device was lost
    #[error("Device lost")]
    DeviceLost,

    /// Host access outside the resource bounds
    #[error("Access of {length} bytes at offset {offset} exceeds resource size {size}")]
    OutOfBounds {
        /// Start of the access
        offset: u64,
        /// Length of the access
        length: u64,
        /// Size of the resource
        size: u64,
    },

    /// Command recorded or lifecycle call made in the wrong state
    #[error("Cannot {operation} a command buffer in state {state:?}")]
    InvalidCommandBufferState {
        /// Attempted operation
        operation: &'static str,
        /// State the buffer was in
        state: CommandBufferState,
    },

    /// Handle does not refer to a live resource
    #[error("Invalid {kind} handle")]
    InvalidHandle {
        /// Resource kind
        kind: &'static str,
    },

    /// Usage violated a documented precondition
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Shader compilation or reflection failed
    #[error(transparent)]
    Shader(#[from] ShaderError),

    /// Wait did not complete in time
    #[error("Timed out waiting for the device")]
    Timeout,

    /// Backend initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Unmapped Vulkan API error
    #[cfg(feature = "vulkan")]
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),
}

impl DriverError {
    /// Shorthand for [`DriverError::Unsupported`]
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }

    /// Shorthand for [`DriverError::ContractViolation`]
    pub fn contract(message: impl Into<String>) -> Self {
        Self::ContractViolation(message.into())
    }

    /// Whether the error means "this descriptor pool is full"
    ///
    /// The expanding descriptor allocator rotates pools on these and only these.
    pub const fn is_pool_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfPoolMemory | Self::FragmentedPool)
    }

    /// Whether the error ends the current frame
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost | Self::OutOfDeviceMemory { .. } | Self::OutOfHostMemory
        )
    }
}

#[cfg(feature = "vulkan")]
impl From<vk::Result> for DriverError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::OutOfPoolMemory,
            vk::Result::ERROR_FRAGMENTED_POOL => Self::FragmentedPool,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory { requested: 0 },
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::TIMEOUT => Self::Timeout,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Self::unsupported("format"),
            vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::unsupported("device feature"),
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => Self::unsupported("extension"),
            other => Self::Api(other),
        }
    }
}

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Shader compilation and reflection errors
#[derive(Error, Debug)]
pub enum ShaderError {
    /// The compiler rejected the source
    #[error("{stage:?} shader failed to compile:\n{diagnostic}")]
    Compilation {
        /// Stage being compiled
        stage: ShaderStage,
        /// Compiler output
        diagnostic: String,
    },

    /// No compiler is attached to the driver
    #[error("No shader compiler available")]
    CompilerUnavailable,

    /// Bytes are not a SPIR-V module
    #[error("Invalid SPIR-V for {stage:?}: {reason}")]
    InvalidSpirv {
        /// Stage the binary was supplied for
        stage: ShaderStage,
        /// What is wrong with it
        reason: String,
    },

    /// Reflection of a stage failed
    #[error("Reflection failed for {stage:?}: {reason}")]
    Reflection {
        /// Stage being reflected
        stage: ShaderStage,
        /// Reflection library message
        reason: String,
    },

    /// Two stages declare the same binding differently
    #[error("Binding set={set} binding={binding} differs between stages: {detail}")]
    BindingMismatch {
        /// Descriptor set index
        set: u32,
        /// Binding slot
        binding: u32,
        /// Which attribute disagrees
        detail: String,
    },

    /// A binding uses a descriptor type the driver cannot express
    #[error("Unsupported resource '{name}' at set={set} binding={binding}")]
    UnsupportedResource {
        /// Resource name from the binary
        name: String,
        /// Descriptor set index
        set: u32,
        /// Binding slot
        binding: u32,
    },

    /// Stage list is empty or repeats a stage
    #[error("Invalid stage list: {0}")]
    InvalidStages(String),
}
