//! Vulkan 交换链
//!
//! 每个在途帧一个 `image_available` 信号量（获取图像时发出），
//! 每张图像一个 `render_finished` 信号量（提交完成时发出，呈现等待它）。
//! 后者按图像划分，避免呈现引擎仍持有信号量时被下一帧复用。

use ash::vk;

use super::context::VulkanContext;
use super::conversion;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{AcquireStatus, PresentStatus, SwapchainDescriptor};
use crate::renderer::resource::TextureFormat;

pub struct VulkanSwapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: TextureFormat,
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    /// 上一次获取返回了 suboptimal，下一次呈现报告过期
    suboptimal: bool,
}

impl VulkanSwapchain {
    pub fn new(context: &VulkanContext, descriptor: &SwapchainDescriptor) -> Result<Self> {
        let format = conversion::texture_format(descriptor.format);
        let color_space = unsafe {
            context
                .surface_loader
                .get_physical_device_surface_formats(context.physical_device, context.surface)
        }
        .map_err(|e| GraphicsError::SwapchainError(format!("Failed to query surface formats: {:?}", e)))?
        .into_iter()
        .find(|f| f.format == format)
        .map(|f| f.color_space)
        .unwrap_or(vk::ColorSpaceKHR::SRGB_NONLINEAR);

        let capabilities = unsafe {
            context
                .surface_loader
                .get_physical_device_surface_capabilities(context.physical_device, context.surface)
        }
        .map_err(|e| GraphicsError::SwapchainError(format!("Failed to query surface capabilities: {:?}", e)))?;

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(context.surface)
            .min_image_count(descriptor.image_count)
            .image_format(format)
            .image_color_space(color_space)
            .image_extent(vk::Extent2D {
                width: descriptor.size.width,
                height: descriptor.size.height,
            })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(conversion::present_mode(descriptor.present_mode))
            .clipped(true);

        let swapchain = unsafe { context.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| GraphicsError::SwapchainError(format!("Failed to create swapchain: {:?}", e)))?;
        let images = unsafe { context.swapchain_loader.get_swapchain_images(swapchain) }
            .map_err(|e| GraphicsError::SwapchainError(format!("Failed to get swapchain images: {:?}", e)))?;

        let mut result = Self {
            swapchain,
            images: images.clone(),
            views: Vec::with_capacity(images.len()),
            format: descriptor.format,
            image_available: Vec::new(),
            render_finished: Vec::new(),
            suboptimal: false,
        };

        // 中途失败时 destroy 释放已经创建的部分
        if let Err(err) = result.create_views_and_semaphores(context, descriptor.frames_in_flight) {
            result.destroy(context);
            return Err(err);
        }

        tracing::debug!(
            images = result.images.len(),
            width = descriptor.size.width,
            height = descriptor.size.height,
            "Vulkan swapchain created"
        );
        Ok(result)
    }

    fn create_views_and_semaphores(&mut self, context: &VulkanContext, frames_in_flight: u32) -> Result<()> {
        let device = &context.device;
        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(conversion::texture_format(self.format))
                .subresource_range(color_range(1));
            let view = unsafe { device.create_image_view(&view_info, None) }
                .map_err(|e| GraphicsError::SwapchainError(format!("Failed to create image view: {:?}", e)))?;
            self.views.push(view);
        }

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for _ in 0..frames_in_flight.max(1) {
            let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }
                .map_err(|e| GraphicsError::SwapchainError(format!("Failed to create semaphore: {:?}", e)))?;
            self.image_available.push(semaphore);
        }
        for _ in 0..self.images.len() {
            let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }
                .map_err(|e| GraphicsError::SwapchainError(format!("Failed to create semaphore: {:?}", e)))?;
            self.render_finished.push(semaphore);
        }
        Ok(())
    }

    pub fn image_available(&self, frame: u32) -> vk::Semaphore {
        self.image_available[frame as usize % self.image_available.len()]
    }

    pub fn render_finished(&self, image_index: u32) -> vk::Semaphore {
        self.render_finished[image_index as usize]
    }

    pub fn acquire(&mut self, context: &VulkanContext, frame: u32) -> Result<AcquireStatus> {
        let result = unsafe {
            context.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available(frame),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => {
                self.suboptimal = suboptimal;
                Ok(AcquireStatus::Acquired(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(e) => Err(GraphicsError::SwapchainError(format!("Failed to acquire next image: {:?}", e)).into()),
        }
    }

    pub fn present(&mut self, context: &VulkanContext, image_index: u32) -> Result<PresentStatus> {
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let wait = [self.render_finished(image_index)];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let result = unsafe { context.swapchain_loader.queue_present(context.queue, &present_info) };
        let was_suboptimal = std::mem::take(&mut self.suboptimal);
        match result {
            Ok(false) if !was_suboptimal => Ok(PresentStatus::Presented),
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(GraphicsError::SwapchainError(format!("Failed to present: {:?}", e)).into()),
        }
    }

    /// 调用者保证 GPU 不再使用这些对象
    pub fn destroy(&mut self, context: &VulkanContext) {
        let device = &context.device;
        unsafe {
            for semaphore in self.image_available.drain(..).chain(self.render_finished.drain(..)) {
                device.destroy_semaphore(semaphore, None);
            }
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            context.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
        self.images.clear();
    }
}

pub fn color_range(mip_levels: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: 0,
        layer_count: 1,
    }
}
