//! Vulkan context: instance, physical device, logical device and queue.

use ash::khr::{acceleration_structure, deferred_host_operations, ray_tracing_pipeline};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use crate::error::{RtError, RtResult};

use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};

/// Ray tracing limits of the selected physical device.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    pub supported: bool,
    pub max_ray_recursion_depth: u32,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub min_scratch_offset_alignment: u32,
}

pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_family: u32,
    pub queue: vk::Queue,

    pub accel_struct_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,

    pub rt_capabilities: RtCapabilities,
    pub device_properties: vk::PhysicalDeviceProperties,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanContext {
    /// Create a context on the best ray-tracing capable GPU.
    ///
    /// # Safety
    /// Loads the Vulkan library and calls into the driver.
    pub unsafe fn new(enable_validation: bool) -> RtResult<Self> {
        let entry = Entry::load().map_err(|e| RtError::Unsupported(format!("failed to load Vulkan: {e}")))?;

        let api_version = entry
            .try_enumerate_instance_version()
            .map_err(|e| RtError::vulkan("enumerate instance version", e))?
            .unwrap_or(vk::API_VERSION_1_0);
        if api_version < REQUIRED_VK_VERSION {
            return Err(RtError::Unsupported(format!(
                "Vulkan 1.3 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, enable_validation)?;
        let (debug_utils_loader, debug_messenger) = if enable_validation {
            Self::setup_debug_messenger(&entry, &instance)?
        } else {
            (None, None)
        };

        let (physical_device, queue_family, rt_capabilities) = Self::pick_physical_device(&instance)?;
        let device_properties = instance.get_physical_device_properties(physical_device);

        let device = Self::create_logical_device(&instance, physical_device, queue_family)?;
        let queue = device.get_device_queue(queue_family, 0);

        let accel_struct_loader = acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
            accel_struct_loader,
            rt_pipeline_loader,
            rt_capabilities,
            device_properties,
            debug_utils_loader,
            debug_messenger,
        })
    }

    unsafe fn create_instance(entry: &Entry, enable_validation: bool) -> RtResult<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry
            .create_instance(&create_info, None)
            .map_err(|e| RtError::vulkan("create instance", e))
    }

    #[allow(clippy::type_complexity)]
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> RtResult<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| RtError::vulkan("create debug messenger", e))?;

        Ok((Some(debug_utils), Some(messenger)))
    }

    /// Highest scoring device with ray tracing and a compute-capable graphics queue.
    unsafe fn pick_physical_device(instance: &Instance) -> RtResult<(vk::PhysicalDevice, u32, RtCapabilities)> {
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|e| RtError::vulkan("enumerate physical devices", e))?;

        let best = devices
            .iter()
            .filter_map(|&device| {
                let queue_family = Self::find_queue_family(instance, device)?;
                let caps = Self::check_rt_support(instance, device);
                caps.supported.then(|| (device, queue_family, caps, Self::rate_device(instance, device)))
            })
            .max_by_key(|candidate| candidate.3);

        let Some((physical_device, queue_family, caps, _)) = best else {
            return Err(RtError::Unsupported("no GPU with hardware ray tracing found".into()));
        };

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        log::info!(
            "Selected GPU: {} (shader group handle {} bytes, max {} instances)",
            name,
            caps.shader_group_handle_size,
            caps.max_instance_count
        );

        Ok((physical_device, queue_family, caps))
    }

    /// Higher is better. Discrete GPUs first, then VRAM size.
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u64 {
        let props = instance.get_physical_device_properties(device);
        let mut score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1_000_000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100_000,
            _ => 0,
        };

        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score += heap.size / (1024 * 1024);
            }
        }
        score
    }

    unsafe fn find_queue_family(instance: &Instance, device: vk::PhysicalDevice) -> Option<u32> {
        instance
            .get_physical_device_queue_family_properties(device)
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .map(|index| index as u32)
    }

    unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice) -> RtCapabilities {
        let Ok(extensions) = instance.enumerate_device_extension_properties(device) else {
            return RtCapabilities::default();
        };
        let has = |wanted: &CStr| {
            extensions.iter().any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };
        let required = [acceleration_structure::NAME, ray_tracing_pipeline::NAME, deferred_host_operations::NAME];
        if !required.into_iter().all(has) {
            return RtCapabilities::default();
        }

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut as_props);
        instance.get_physical_device_properties2(device, &mut props2);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut rt_features)
            .push_next(&mut vulkan_12_features);
        instance.get_physical_device_features2(device, &mut features2);

        RtCapabilities {
            supported: accel_features.acceleration_structure == vk::TRUE
                && rt_features.ray_tracing_pipeline == vk::TRUE
                && vulkan_12_features.buffer_device_address == vk::TRUE,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_geometry_count: as_props.max_geometry_count,
            max_instance_count: as_props.max_instance_count,
            max_primitive_count: as_props.max_primitive_count,
            min_scratch_offset_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
        }
    }

    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> RtResult<Device> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let extensions: Vec<*const c_char> = vec![
            acceleration_structure::NAME.as_ptr(),
            ray_tracing_pipeline::NAME.as_ptr(),
            deferred_host_operations::NAME.as_ptr(),
        ];

        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .maintenance4(true);
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true);
        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_13_features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| RtError::vulkan("create logical device", e))
    }

    pub fn wait_idle(&self) -> RtResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| RtError::vulkan("device wait idle", e))
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.wait_idle() {
                log::warn!("Wait idle on shutdown failed: {e}");
            }
            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Routes validation messages into the log.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK] {message}");
    }

    vk::FALSE
}
