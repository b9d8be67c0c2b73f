//! Vulkan instance and device ownership
//!
//! [`VulkanContext`] owns the loader entry, the instance with its optional
//! debug messenger, the selected physical device and the logical device.
//! Every queue of every family is created up front so command queues can be
//! handed out without touching the device again.

use std::ffi::{CStr, CString};

#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use log::{debug, info, warn};
use raw_window_handle::RawDisplayHandle;

use crate::config::DriverConfig;
use crate::render::error::{DriverError, DriverResult};

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Surface extension, present when a display was supplied
    pub surface_loader: Option<Surface>,
    /// Debug utilities extension (debug builds with validation)
    #[cfg(debug_assertions)]
    pub debug_utils: Option<DebugUtils>,
    #[cfg(debug_assertions)]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create an instance, enabling the surface extensions `display` needs
    pub fn new(config: &DriverConfig, display: Option<RawDisplayHandle>) -> DriverResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            DriverError::InitializationFailed(format!("Failed to load Vulkan: {e}"))
        })?;

        let app_name = CString::new(config.application_name.as_str()).map_err(|_| {
            DriverError::InitializationFailed("application name contains a NUL byte".to_string())
        })?;
        let engine_name = CString::new(env!("CARGO_PKG_NAME")).unwrap_or_default();
        let (major, minor, patch) = config.application_version;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        #[allow(unused_mut)] // debug builds append the debug utils extension
        let mut extensions: Vec<*const std::os::raw::c_char> = match display {
            Some(display) => ash_window::enumerate_required_extensions(display)?.to_vec(),
            None => Vec::new(),
        };

        let validation = config.validation_enabled();
        let layer_names = if cfg!(debug_assertions) && validation {
            vec![VALIDATION_LAYER.as_ptr().cast::<std::os::raw::c_char>()]
        } else {
            Vec::new()
        };

        #[cfg(debug_assertions)]
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            DriverError::InitializationFailed(format!("Instance creation failed: {e:?}"))
        })?;

        let surface_loader = display.map(|_| Surface::new(&entry, &instance));

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => (Some(debug_utils), Some(messenger)),
                Err(e) => {
                    warn!("Debug messenger unavailable: {e}");
                    (Some(debug_utils), None)
                }
            }
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            surface_loader,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> DriverResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        Ok(unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?)
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Routes validation messages into `log`
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Available queue families
    pub queue_families: Vec<vk::QueueFamilyProperties>,
}

impl PhysicalDeviceInfo {
    /// First device with a graphics family and, when presenting, swapchain support
    pub fn select_suitable_device(instance: &Instance, presentable: bool) -> DriverResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        for device in devices {
            match Self::evaluate_device(instance, device, presentable) {
                Ok(info) => {
                    info!("Selected GPU: {}", info.name());
                    return Ok(info);
                }
                Err(e) => debug!("Skipping physical device: {e}"),
            }
        }

        Err(DriverError::InitializationFailed(
            "No suitable GPU found".to_string(),
        ))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        presentable: bool,
    ) -> DriverResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        if !queue_families
            .iter()
            .any(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        {
            return Err(DriverError::InitializationFailed(
                "No graphics queue family found".to_string(),
            ));
        }

        if presentable {
            let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
            let has_swapchain = extensions.iter().any(|available| {
                let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                name == SwapchainLoader::name()
            });
            if !has_swapchain {
                return Err(DriverError::InitializationFailed(
                    "Required device extensions not supported".to_string(),
                ));
            }
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            queue_families,
        })
    }

    /// Device name reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Queues per family, indexed by family then queue index
    pub queues: Vec<Vec<vk::Queue>>,
    /// Swapchain extension loader, present when presenting is possible
    pub swapchain_loader: Option<SwapchainLoader>,
}

impl LogicalDevice {
    /// Create a device exposing every queue of every family
    pub fn new(
        instance: &Instance,
        physical: &PhysicalDeviceInfo,
        presentable: bool,
    ) -> DriverResult<Self> {
        let priorities: Vec<Vec<f32>> = physical
            .queue_families
            .iter()
            .map(|family| vec![1.0; family.queue_count as usize])
            .collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = priorities
            .iter()
            .enumerate()
            .filter(|(_, priorities)| !priorities.is_empty())
            .map(|(family, priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family as u32)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect();

        let extensions = if presentable {
            vec![SwapchainLoader::name().as_ptr()]
        } else {
            Vec::new()
        };
        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical.features.sampler_anisotropy == vk::TRUE);
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical.device, &create_info, None) }
            .map_err(|e| DriverError::InitializationFailed(format!("Device creation failed: {e:?}")))?;

        let queues = physical
            .queue_families
            .iter()
            .enumerate()
            .map(|(family, properties)| {
                (0..properties.queue_count)
                    .map(|index| unsafe { device.get_device_queue(family as u32, index) })
                    .collect()
            })
            .collect();
        let swapchain_loader = presentable.then(|| SwapchainLoader::new(instance, &device));

        Ok(Self {
            device,
            queues,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during teardown: {e:?}");
            }
            self.device.destroy_device(None);
        }
    }
}

/// Instance, physical device and logical device of one driver
///
/// Field order matters: the logical device drops before the instance.
pub struct VulkanContext {
    /// Logical device and queues
    pub device: LogicalDevice,
    /// Selected physical device
    pub physical: PhysicalDeviceInfo,
    /// Instance and extension loaders
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Bring up Vulkan for `config`
    ///
    /// Pass the display connection of the windowing layer to enable
    /// presentation; without one the device renders offscreen only.
    pub fn new(config: &DriverConfig, display: Option<RawDisplayHandle>) -> DriverResult<Self> {
        let instance = VulkanInstance::new(config, display)?;
        let presentable = display.is_some();
        let physical = PhysicalDeviceInfo::select_suitable_device(&instance.instance, presentable)?;
        let device = LogicalDevice::new(&instance.instance, &physical, presentable)?;
        info!(
            "Vulkan device ready: {} queue families, presentation {}",
            physical.queue_families.len(),
            if presentable { "enabled" } else { "disabled" }
        );
        Ok(Self {
            device,
            physical,
            instance,
        })
    }

    /// Raw device handle
    pub fn raw(&self) -> &Device {
        &self.device.device
    }
}
