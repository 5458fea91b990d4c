//! Vulkan 资源视图表
//!
//! 一个常驻的描述符集，着色器按槽位下标访问资源：
//!
//! | 绑定 | 类型 | 内容 |
//! |------|------|------|
//! | 0 | `COMBINED_IMAGE_SAMPLER[capacity]` | 纹理（默认采样器） |
//! | 1 | `STORAGE_BUFFER[capacity]` | 缓冲区 |
//!
//! 集合以 `UPDATE_AFTER_BIND` 创建，录制中的命令列表不妨碍写入新槽位。
//! 它总是绑定在 set 1，set 0 留给按绘制推送的描述符。

use ash::vk;

use crate::core::error::{GraphicsError, Result};

pub const TEXTURE_BINDING: u32 = 0;
pub const BUFFER_BINDING: u32 = 1;

/// 资源视图表在管线布局中的集合编号
pub const RESOURCE_VIEW_SET: u32 = 1;

pub struct ResourceViewTable {
    pub layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    pub sampler: vk::Sampler,
    capacity: u32,
}

impl ResourceViewTable {
    pub fn new(device: &ash::Device, capacity: u32) -> Result<Self> {
        let capacity = capacity.max(1);

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(TEXTURE_BINDING)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BUFFER_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
        ];
        let flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND; 2];
        let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut binding_flags);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create resource view layout: {:?}", e)))?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: capacity,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create resource view pool: {:?}", e)))?;

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to allocate resource view set: {:?}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| GraphicsError::DeviceCreation("resource view set allocation returned nothing".to_string()))?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }
            .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create default sampler: {:?}", e)))?;

        tracing::debug!(capacity, "Vulkan resource view table created");
        Ok(Self {
            layout,
            pool,
            set,
            sampler,
            capacity,
        })
    }

    pub fn write_texture(&self, device: &ash::Device, slot: u32, view: vk::ImageView) {
        if slot >= self.capacity {
            tracing::error!(slot, capacity = self.capacity, "Resource view slot out of range");
            return;
        }
        let images = [vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(TEXTURE_BINDING)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&images);
        unsafe { device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn write_buffer(&self, device: &ash::Device, slot: u32, buffer: vk::Buffer) {
        if slot >= self.capacity {
            tracing::error!(slot, capacity = self.capacity, "Resource view slot out of range");
            return;
        }
        let buffers = [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(BUFFER_BINDING)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffers);
        unsafe { device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
