//! # Driver Configuration
//!
//! Settings consumed when a backend is created: application metadata for the
//! instance, validation, swapchain preferences, descriptor allocator sizing
//! and the device description used by the headless backend.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{Config, ConfigError};
use crate::render::descriptor::{DescriptorType, PoolSizeRatio};
use crate::render::flags::QueueFamilyFlags;

/// Presentation mode preference for swapchains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PresentMode {
    /// Vertical sync, always available
    #[default]
    Fifo,
    /// Triple-buffered low latency, falls back to `Fifo`
    Mailbox,
    /// No synchronization, falls back to `Fifo`
    Immediate,
}

/// # Swapchain Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapchainConfig {
    /// Number of presentable images requested on (re)creation
    pub desired_image_count: u32,
    /// Preferred presentation mode
    pub present_mode: PresentMode,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            desired_image_count: 3,
            present_mode: PresentMode::Fifo,
        }
    }
}

/// # Descriptor Allocator Configuration
///
/// Sizing for the first pool of an expanding descriptor allocator and the
/// relative demand per descriptor type used for every pool it creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorAllocatorConfig {
    /// Set capacity of the first pool
    pub initial_sets: u32,
    /// Descriptor type weights
    pub ratios: Vec<PoolSizeRatio>,
}

impl Default for DescriptorAllocatorConfig {
    fn default() -> Self {
        Self {
            initial_sets: 64,
            ratios: vec![
                PoolSizeRatio::new(DescriptorType::UniformBuffer, 3.0),
                PoolSizeRatio::new(DescriptorType::CombinedImageSampler, 4.0),
                PoolSizeRatio::new(DescriptorType::StorageBuffer, 1.0),
                PoolSizeRatio::new(DescriptorType::StorageImage, 1.0),
            ],
        }
    }
}

/// One queue family exposed by the headless device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueFamilyConfig {
    /// Capabilities of the family
    pub flags: QueueFamilyFlags,
    /// Number of queues in the family
    pub queue_count: u32,
    /// Whether the family can present to surfaces
    pub present: bool,
}

/// # Headless Device Configuration
///
/// Describes the CPU device emulated by the headless backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadlessDeviceConfig {
    /// Reported device name
    pub device_name: String,
    /// Exposed queue families, indexed in order
    pub queue_families: Vec<QueueFamilyConfig>,
    /// Device memory available to buffers and images, in bytes
    pub memory_budget: u64,
}

impl HeadlessDeviceConfig {
    /// Replace the exposed queue families
    pub fn with_queue_families(mut self, families: Vec<QueueFamilyConfig>) -> Self {
        self.queue_families = families;
        self
    }

    /// Set the device memory budget
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }
}

impl Default for HeadlessDeviceConfig {
    fn default() -> Self {
        Self {
            device_name: "Headless Device".to_string(),
            queue_families: vec![
                QueueFamilyConfig {
                    flags: QueueFamilyFlags::GRAPHICS
                        | QueueFamilyFlags::COMPUTE
                        | QueueFamilyFlags::TRANSFER,
                    queue_count: 4,
                    present: true,
                },
                QueueFamilyConfig {
                    flags: QueueFamilyFlags::TRANSFER,
                    queue_count: 1,
                    present: false,
                },
            ],
            memory_budget: 256 * 1024 * 1024,
        }
    }
}

/// # Driver Configuration
///
/// Top-level configuration handed to a backend on creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Application name for instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Whether to enable validation layers (auto-detected when `None`)
    pub enable_validation: Option<bool>,
    /// Upper bound for fence waits, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Log filter passed to `env_logger`
    pub log_level: String,
    /// Swapchain preferences
    pub swapchain: SwapchainConfig,
    /// Descriptor allocator sizing
    pub descriptors: DescriptorAllocatorConfig,
    /// Headless device description
    pub headless: HeadlessDeviceConfig,
}

impl DriverConfig {
    /// Create a new driver configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            enable_validation: None,
            fence_timeout_ns: 5_000_000_000,
            log_level: "info".to_string(),
            swapchain: SwapchainConfig::default(),
            descriptors: DescriptorAllocatorConfig::default(),
            headless: HeadlessDeviceConfig::default(),
        }
    }

    /// Set application version
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the log filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set swapchain preferences
    pub fn with_swapchain(mut self, swapchain: SwapchainConfig) -> Self {
        self.swapchain = swapchain;
        self
    }

    /// Set descriptor allocator sizing
    pub fn with_descriptors(mut self, descriptors: DescriptorAllocatorConfig) -> Self {
        self.descriptors = descriptors;
        self
    }

    /// Set the headless device description
    pub fn with_headless(mut self, headless: HeadlessDeviceConfig) -> Self {
        self.headless = headless;
        self
    }

    /// Validation setting after auto-detection
    ///
    /// Enabled in debug builds and disabled in release builds unless set explicitly.
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Load from file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }

        if self.fence_timeout_ns == 0 {
            return Err("Fence timeout must be non-zero".to_string());
        }

        if self.swapchain.desired_image_count == 0 {
            return Err("Swapchain must request at least one image".to_string());
        }

        if self.descriptors.initial_sets == 0 {
            return Err("Descriptor allocator needs at least one initial set".to_string());
        }

        if self.descriptors.ratios.is_empty() {
            return Err("Descriptor allocator ratio table is empty".to_string());
        }

        if let Some(ratio) = self
            .descriptors
            .ratios
            .iter()
            .find(|ratio| !ratio.weight.is_finite() || ratio.weight <= 0.0)
        {
            return Err(format!(
                "Descriptor ratio for {:?} must be positive, got {}",
                ratio.ty, ratio.weight
            ));
        }

        if self.headless.queue_families.is_empty() {
            return Err("Headless device must expose at least one queue family".to_string());
        }

        if self.headless.memory_budget == 0 {
            return Err("Headless memory budget must be non-zero".to_string());
        }

        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new("Rendering Device Application")
    }
}

impl Config for DriverConfig {}
