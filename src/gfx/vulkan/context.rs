//! Vulkan 上下文
//!
//! 持有实例、表面、物理设备与逻辑设备。`VulkanContext` 销毁时
//! 按逆序释放它们，其余原生对象必须在此之前销毁。
//!
//! # 初始化流程
//!
//! 1. 加载 Vulkan 库，创建实例（可选验证层）
//! 2. 从窗口句柄创建表面
//! 3. 选择物理设备
//! 4. 创建逻辑设备和队列

use std::ffi::{c_char, CStr, CString};

use ash::vk;
use tracing::{debug, info, warn};

use crate::core::config::DeviceConfig;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::SurfaceTarget;

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// 动态渲染与 synchronization2 需要 1.3
const API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

fn creation_error(what: &str, err: impl std::fmt::Debug) -> GraphicsError {
    GraphicsError::DeviceCreation(format!("Failed to {}: {:?}", what, err))
}

/// Vulkan 上下文
pub struct VulkanContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface_loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub push_descriptor: ash::khr::push_descriptor::Device,
    pub device_name: String,
}

impl VulkanContext {
    pub fn new(config: &DeviceConfig, target: &SurfaceTarget) -> Result<Self> {
        // 1. 加载 Vulkan 库
        let entry = unsafe { ash::Entry::load() }.map_err(|e| creation_error("load Vulkan library", e))?;

        // 2. 创建实例（表面扩展由 ash-window 按窗口系统给出）
        let validation = config.validation && has_validation_layer(&entry);
        if config.validation && !validation {
            warn!("Validation layers requested but not available");
        }

        let app_name = CString::new(config.application_name.as_str()).unwrap_or_default();
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"dist_gfx")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(API_VERSION);

        let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(target.display)
            .map_err(|e| creation_error("query surface extensions", e))?
            .to_vec();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| creation_error("create Vulkan instance", e))?;

        #[cfg(debug_assertions)]
        debug!(validation, "Vulkan instance created");

        let debug_utils = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = create_debug_messenger(&loader)?;
            Some((loader, messenger))
        } else {
            None
        };

        // 3. 创建表面
        let surface = unsafe { ash_window::create_surface(&entry, &instance, target.display, target.window, None) }
            .map_err(|e| creation_error("create Vulkan surface", e))?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        #[cfg(debug_assertions)]
        debug!("Vulkan surface created");

        // 4. 选择物理设备和队列族
        // 优先级：独立显卡 > 集成显卡 > 虚拟显卡 > CPU > 其他
        let (physical_device, queue_family_index) = select_physical_device(&instance, &surface_loader, surface)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        info!(
            device_name = %device_name,
            device_type = ?properties.device_type,
            queue_family_index,
            "Using device"
        );

        // 5. 创建逻辑设备和队列
        let device = create_logical_device(&instance, physical_device, queue_family_index)?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let push_descriptor = ash::khr::push_descriptor::Device::new(&instance, &device);

        #[cfg(debug_assertions)]
        debug!("Vulkan logical device created");

        Ok(Self {
            entry,
            instance,
            debug_utils,
            surface_loader,
            surface,
            physical_device,
            properties,
            memory_properties,
            device,
            queue,
            queue_family_index,
            swapchain_loader,
            push_descriptor,
            device_name,
        })
    }

    /// 找到满足 `type_bits` 且带有 `flags` 属性的内存类型
    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags)
            })
            .map(|(index, _)| index as u32)
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan context destroyed");
    }
}

fn has_validation_layer(entry: &ash::Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER_NAME)
}

fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| creation_error("enumerate physical devices", e))?;

    devices
        .into_iter()
        .filter(|&device| {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            properties.api_version >= API_VERSION
        })
        .filter_map(|device| {
            let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
            families
                .iter()
                .enumerate()
                .position(|(index, family)| {
                    family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                        && unsafe {
                            surface_loader.get_physical_device_surface_support(device, index as u32, surface)
                        }
                        .unwrap_or(false)
                })
                .map(|index| (device, index as u32))
        })
        .min_by_key(|&(device, _)| {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                vk::PhysicalDeviceType::CPU => 3,
                _ => 4,
            }
        })
        .ok_or_else(|| GraphicsError::DeviceCreation("No suitable Vulkan 1.3 device found".to_string()).into())
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<ash::Device> {
    let priorities = [1.0f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities)];

    let extensions = [ash::khr::swapchain::NAME.as_ptr(), ash::khr::push_descriptor::NAME.as_ptr()];

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);
    // 时间线信号量（栅栏值）与资源视图表（更新后绑定的描述符数组）
    let mut features_12 = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true);
    let mut features_13 = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut features_12)
        .push_next(&mut features_13);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(|e| creation_error("create logical device", e).into())
}

fn create_debug_messenger(loader: &ash::ext::debug_utils::Instance) -> Result<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    unsafe { loader.create_debug_utils_messenger(&create_info, None) }
        .map_err(|e| creation_error("create debug messenger", e).into())
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || unsafe { (*callback_data).p_message.is_null() } {
        String::from("(no message)")
    } else {
        unsafe { CStr::from_ptr((*callback_data).p_message) }
            .to_string_lossy()
            .into_owned()
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "dist_gfx::vulkan", kind = ?message_type, "{}", message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "dist_gfx::vulkan", kind = ?message_type, "{}", message)
        }
        _ => tracing::debug!(target: "dist_gfx::vulkan", kind = ?message_type, "{}", message),
    }
    vk::FALSE
}
