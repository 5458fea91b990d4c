//! Vulkan 后端
//!
//! 基于 `ash` 的 [`NativeDevice`] 实现，要求 Vulkan 1.3：
//!
//! - 渲染通道使用动态渲染（`vkCmdBeginRendering`），管线按附件格式缓存
//! - 栅栏是时间线信号量，栅栏值即信号量计数
//! - 按绘制绑定的资源走推送描述符（set 0），资源视图表常驻 set 1
//! - 缓冲区放置在堆（`VkDeviceMemory`）中，纹理使用独立分配
//!
//! 原生句柄直接使用 Vulkan 对象的原始值，对象表按句柄保存附加信息。

pub mod context;
pub mod conversion;
pub mod descriptor;
pub mod pipeline;
pub mod swapchain;

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::ptr::NonNull;

use ash::vk::{self, Handle};

use context::VulkanContext;
use descriptor::{ResourceViewTable, RESOURCE_VIEW_SET};
use pipeline::{AttachmentFormats, BoundPipeline, PipelineCache, VulkanShader};
use swapchain::VulkanSwapchain;

use super::backend::{
    AcquireStatus, BackendInfo, NativeCommand, NativeDevice, NativeRenderPass, NativeSwapchain, NativeTexture,
    PresentStatus, Submission, SurfaceCapabilities, SwapchainDescriptor, ViewResource,
};
use super::SurfaceTarget;
use crate::core::config::{DeviceConfig, GraphicsBackend};
use crate::core::error::{DistGfxError, GraphicsError, Result};
use crate::renderer::heap::align_up;
use crate::renderer::resource::{
    BufferDescriptor, HeapDescriptor, ImTextureId, MemoryRequirements, MemoryType, NativeHandle,
    ShaderResourceIndex, Size, Texture, TextureDescriptor, TextureDimension, TextureFormat,
};
use crate::renderer::shader::{BindingKind, ShaderEntry};
use crate::renderer::transition::{Barrier, TransitionPolicy};

fn to_handle<H: Handle>(object: H) -> NativeHandle {
    NativeHandle(object.as_raw())
}

fn from_handle<H: Handle>(handle: NativeHandle) -> H {
    H::from_raw(handle.raw())
}

fn command_error(what: &str, err: vk::Result) -> DistGfxError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost(format!("{}: {:?}", what, err)).into(),
        _ => GraphicsError::CommandExecution(format!("Failed to {}: {:?}", what, err)).into(),
    }
}

struct VulkanHeap {
    memory: vk::DeviceMemory,
    size: u64,
    mapped: Option<NonNull<u8>>,
    coherent: bool,
}

struct VulkanBuffer {
    buffer: vk::Buffer,
    heap: NativeHandle,
    offset: u64,
    size: u64,
}

struct VulkanTexture {
    image: vk::Image,
    view: vk::ImageView,
    /// 交换链图像没有自己的内存
    memory: Option<vk::DeviceMemory>,
    format: TextureFormat,
    mip_levels: u32,
    layers: u32,
}

impl VulkanTexture {
    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: conversion::aspect_mask(self.format),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    fn level(&self, mip_level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: conversion::aspect_mask(self.format),
            mip_level,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }
}

struct VulkanList {
    buffer: vk::CommandBuffer,
    frame: u32,
    pipeline: Option<BoundPipeline>,
}

/// Vulkan 原生设备
pub struct VulkanDevice {
    info: BackendInfo,
    /// 探测缓冲区得到的可用内存类型位与对齐
    probe_type_bits: u32,
    probe_alignment: u64,
    heaps: HashMap<NativeHandle, VulkanHeap>,
    buffers: HashMap<NativeHandle, VulkanBuffer>,
    textures: HashMap<NativeHandle, VulkanTexture>,
    shaders: HashMap<NativeHandle, VulkanShader>,
    lists: HashMap<NativeHandle, VulkanList>,
    command_pools: HashMap<u32, vk::CommandPool>,
    fences: HashSet<NativeHandle>,
    swapchains: HashMap<NativeHandle, VulkanSwapchain>,
    pipelines: PipelineCache,
    resource_views: ResourceViewTable,
    context: VulkanContext,
}

impl VulkanDevice {
    pub fn new(config: &DeviceConfig, target: &SurfaceTarget) -> Result<Self> {
        let context = VulkanContext::new(config, target)?;
        let resource_views = ResourceViewTable::new(&context.device, config.descriptor_capacity)?;

        let (probe_type_bits, probe_alignment) = probe_buffer_requirements(&context.device)?;

        tracing::info!(
            device_name = %context.device_name,
            descriptor_capacity = config.descriptor_capacity,
            "Vulkan device initialized"
        );

        Ok(Self {
            info: BackendInfo {
                kind: GraphicsBackend::Vulkan,
                device_name: context.device_name.clone(),
                descriptor_stride: 1,
                transition_policy: TransitionPolicy::Exact,
                mipmaps_by_blit: true,
            },
            probe_type_bits,
            probe_alignment,
            heaps: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            lists: HashMap::new(),
            command_pools: HashMap::new(),
            fences: HashSet::new(),
            swapchains: HashMap::new(),
            pipelines: PipelineCache::new(),
            resource_views,
            context,
        })
    }

    fn buffer_alignment(&self) -> u64 {
        let limits = &self.context.properties.limits;
        self.probe_alignment
            .max(limits.min_storage_buffer_offset_alignment)
            .max(limits.min_uniform_buffer_offset_alignment)
    }

    fn list(&self, list: NativeHandle) -> Result<&VulkanList> {
        self.lists
            .get(&list)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown command list {:?}", list)).into())
    }

    fn texture(&self, texture: NativeHandle) -> Result<&VulkanTexture> {
        self.textures
            .get(&texture)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown texture {:?}", texture)).into())
    }

    fn command_pool(&mut self, frame: u32) -> Result<vk::CommandPool> {
        if let Some(pool) = self.command_pools.get(&frame) {
            return Ok(*pool);
        }
        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(self.context.queue_family_index);
        let pool = unsafe { self.context.device.create_command_pool(&pool_info, None) }
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create command pool: {:?}", e)))?;
        self.command_pools.insert(frame, pool);
        Ok(pool)
    }

    fn record_barriers(&self, cmd: vk::CommandBuffer, barriers: &[Barrier]) {
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();
        let mut image_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();

        for barrier in barriers {
            src_stages |= conversion::pipeline_stage(barrier.before);
            dst_stages |= conversion::pipeline_stage(barrier.after);
            if let Some(texture) = self.textures.get(&barrier.resource) {
                image_barriers.push(
                    vk::ImageMemoryBarrier::default()
                        .src_access_mask(conversion::access_mask(barrier.before))
                        .dst_access_mask(conversion::access_mask(barrier.after))
                        .old_layout(conversion::image_layout(barrier.before, true))
                        .new_layout(conversion::image_layout(barrier.after, false))
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(texture.image)
                        .subresource_range(texture.full_range()),
                );
            } else if let Some(buffer) = self.buffers.get(&barrier.resource) {
                buffer_barriers.push(
                    vk::BufferMemoryBarrier::default()
                        .src_access_mask(conversion::access_mask(barrier.before))
                        .dst_access_mask(conversion::access_mask(barrier.after))
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(buffer.buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE),
                );
            } else {
                tracing::warn!(resource = ?barrier.resource, "Barrier on unknown resource skipped");
            }
        }

        if src_stages.is_empty() {
            src_stages = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if dst_stages.is_empty() {
            dst_stages = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }
        unsafe {
            self.context.device.cmd_pipeline_barrier(
                cmd,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &image_barriers,
            );
        }
    }

    fn begin_rendering(&self, cmd: vk::CommandBuffer, pass: &NativeRenderPass) {
        let colors: Vec<vk::RenderingAttachmentInfo> = pass
            .colors
            .iter()
            .map(|color| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(from_handle(color.view))
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(conversion::load_op(color.load))
                    .store_op(conversion::store_op(color.store))
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: color.clear_color },
                    })
            })
            .collect();
        let depth = pass.depth.map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(from_handle(depth.view))
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(conversion::load_op(depth.load))
                .store_op(conversion::store_op(depth.store))
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: depth.clear_depth,
                        stencil: depth.clear_stencil,
                    },
                })
        });
        let has_stencil = pass.depth.is_some_and(|depth| depth.format.has_stencil());

        let mut rendering = vk::RenderingInfo::default()
            .render_area(full_rect(pass.size))
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            rendering = rendering.depth_attachment(depth);
            if has_stencil {
                rendering = rendering.stencil_attachment(depth);
            }
        }

        unsafe {
            self.context.device.cmd_begin_rendering(cmd, &rendering);
        }
        self.set_viewport(cmd, pass.size);
    }

    fn set_viewport(&self, cmd: vk::CommandBuffer, size: Size) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: size.width as f32,
            height: size.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.context.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.context.device.cmd_set_scissor(cmd, 0, &[full_rect(size)]);
        }
    }

    fn bind_pipeline(&mut self, list: NativeHandle, command: &NativeCommand<'_>) -> Result<()> {
        let cmd = self.list(list)?.buffer;
        let device = &self.context.device;
        let shader = |handle: NativeHandle| {
            self.shaders
                .get(&handle)
                .ok_or_else(|| DistGfxError::from(GraphicsError::CommandExecution(format!("unknown shader {:?}", handle))))
        };

        let bound = match *command {
            NativeCommand::BindGraphicsPipeline { state, vertex, fragment, pass } => {
                let color_formats = pass.color_formats();
                let formats = AttachmentFormats {
                    colors: &color_formats,
                    depth: pass.depth_format(),
                    sample_count: pass.sample_count,
                };
                self.pipelines.graphics_pipeline(
                    device,
                    self.resource_views.layout,
                    (vertex.handle(), shader(vertex.handle())?),
                    (fragment.handle(), shader(fragment.handle())?),
                    state,
                    &formats,
                )?
            }
            NativeCommand::BindComputePipeline { compute } => self.pipelines.compute_pipeline(
                device,
                self.resource_views.layout,
                compute.handle(),
                shader(compute.handle())?,
            )?,
            _ => return Ok(()),
        };

        unsafe {
            device.cmd_bind_pipeline(cmd, bound.bind_point, bound.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                bound.bind_point,
                bound.layout,
                RESOURCE_VIEW_SET,
                &[self.resource_views.set],
                &[],
            );
        }
        if let Some(record) = self.lists.get_mut(&list) {
            record.pipeline = Some(bound);
        }
        Ok(())
    }

    fn bound_pipeline(&self, list: NativeHandle, what: &str) -> Result<(vk::CommandBuffer, BoundPipeline)> {
        let record = self.list(list)?;
        let bound = record.pipeline.ok_or_else(|| {
            GraphicsError::CommandExecution(format!("{} recorded before a pipeline was bound", what))
        })?;
        Ok((record.buffer, bound))
    }

    fn blit(&self, cmd: vk::CommandBuffer, src: NativeHandle, src_size: Size, dst: NativeHandle, dst_size: Size) -> Result<()> {
        let src = self.texture(src)?;
        let dst = self.texture(dst)?;
        let region = vk::ImageBlit::default()
            .src_subresource(src.level(0))
            .src_offsets([vk::Offset3D::default(), far_corner(src_size)])
            .dst_subresource(dst.level(0))
            .dst_offsets([vk::Offset3D::default(), far_corner(dst_size)]);
        let filter = if src.format.is_depth_stencil() {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        };
        unsafe {
            self.context.device.cmd_blit_image(
                cmd,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                filter,
            );
        }
        Ok(())
    }

    /// 逐级 blit 生成 mip 链
    ///
    /// 进入时所有层级处于 `TRANSFER_DST_OPTIMAL`，结束时全部处于 `TRANSFER_SRC_OPTIMAL`。
    fn generate_mipmaps(&self, cmd: vk::CommandBuffer, texture: NativeHandle, size: Size, mip_levels: u32) -> Result<()> {
        let texture = self.texture(texture)?;
        let device = &self.context.device;
        let to_source = |level: u32| {
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(texture.image)
                .subresource_range(vk::ImageSubresourceRange {
                    base_mip_level: level,
                    level_count: 1,
                    ..texture.full_range()
                })
        };

        let mut width = size.width.max(1);
        let mut height = size.height.max(1);
        for level in 1..mip_levels {
            let next_width = (width / 2).max(1);
            let next_height = (height / 2).max(1);
            let region = vk::ImageBlit::default()
                .src_subresource(texture.level(level - 1))
                .src_offsets([vk::Offset3D::default(), far_corner(Size::new(width, height))])
                .dst_subresource(texture.level(level))
                .dst_offsets([vk::Offset3D::default(), far_corner(Size::new(next_width, next_height))]);
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_source(level - 1)],
                );
                device.cmd_blit_image(
                    cmd,
                    texture.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    texture.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    vk::Filter::LINEAR,
                );
            }
            width = next_width;
            height = next_height;
        }

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_source(mip_levels.max(1) - 1)],
            );
        }
        Ok(())
    }
}

fn full_rect(size: Size) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent: vk::Extent2D {
            width: size.width,
            height: size.height,
        },
    }
}

fn far_corner(size: Size) -> vk::Offset3D {
    vk::Offset3D {
        x: size.width as i32,
        y: size.height as i32,
        z: 1,
    }
}

/// 用一个覆盖全部用途的小缓冲区探测放置缓冲区的内存类型位与对齐
fn probe_buffer_requirements(device: &ash::Device) -> Result<(u32, u64)> {
    let usage = vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::UNIFORM_BUFFER
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST;
    let info = vk::BufferCreateInfo::default()
        .size(256)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    unsafe {
        let probe = device
            .create_buffer(&info, None)
            .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create probe buffer: {:?}", e)))?;
        let requirements = device.get_buffer_memory_requirements(probe);
        device.destroy_buffer(probe, None);
        Ok((requirements.memory_type_bits, requirements.alignment))
    }
}

fn image_type(dimension: TextureDimension) -> (vk::ImageType, vk::ImageViewType, u32) {
    match dimension {
        TextureDimension::Texture2D => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D, 1),
        TextureDimension::Texture2DArray => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D_ARRAY, 1),
        TextureDimension::Texture3D => (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D, 1),
        TextureDimension::TextureCube => (vk::ImageType::TYPE_2D, vk::ImageViewType::CUBE, 6),
    }
}

impl NativeDevice for VulkanDevice {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn allocate_heap(&mut self, descriptor: &HeapDescriptor) -> Result<NativeHandle> {
        let memory_type_index = conversion::memory_properties(descriptor.memory_type)
            .iter()
            .find_map(|&flags| self.context.find_memory_type(self.probe_type_bits, flags))
            .ok_or_else(|| {
                GraphicsError::ResourceCreation(format!(
                    "No memory type for heap '{}' ({:?})",
                    descriptor.name, descriptor.memory_type
                ))
            })?;
        let flags = self.context.memory_properties.memory_types[memory_type_index as usize].property_flags;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(descriptor.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.context.device.allocate_memory(&allocate_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreation(format!("Failed to allocate heap '{}': {:?}", descriptor.name, e))
        })?;

        let mapped = if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let pointer = unsafe {
                self.context
                    .device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match pointer {
                Ok(pointer) => NonNull::new(pointer.cast::<u8>()),
                Err(e) => {
                    unsafe { self.context.device.free_memory(memory, None) };
                    return Err(GraphicsError::ResourceCreation(format!("Failed to map heap: {:?}", e)).into());
                }
            }
        } else {
            None
        };

        let handle = to_handle(memory);
        self.heaps.insert(
            handle,
            VulkanHeap {
                memory,
                size: descriptor.size,
                mapped,
                coherent: flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            },
        );
        tracing::debug!(
            name = %descriptor.name,
            size = descriptor.size,
            memory_type_index,
            "Vulkan heap allocated"
        );
        Ok(handle)
    }

    fn free_heap(&mut self, heap: NativeHandle) {
        let Some(record) = self.heaps.remove(&heap) else {
            tracing::error!(?heap, "Freeing unknown heap");
            return;
        };
        unsafe {
            if record.mapped.is_some() {
                self.context.device.unmap_memory(record.memory);
            }
            self.context.device.free_memory(record.memory, None);
        }
    }

    fn heap_alignment(&self, memory_type: MemoryType) -> u64 {
        let alignment = self.buffer_alignment();
        if memory_type.is_host_visible() {
            alignment.max(self.context.properties.limits.non_coherent_atom_size)
        } else {
            alignment
        }
    }

    fn memory_requirements(&self, descriptor: &BufferDescriptor) -> MemoryRequirements {
        let alignment = self.buffer_alignment();
        MemoryRequirements {
            size: align_up(descriptor.aligned_size(), alignment),
            alignment,
        }
    }

    fn create_placed_buffer(
        &mut self,
        heap: NativeHandle,
        offset: u64,
        descriptor: &BufferDescriptor,
    ) -> Result<NativeHandle> {
        let Some(record) = self.heaps.get(&heap) else {
            return Err(GraphicsError::ResourceCreation(format!("unknown heap {:?}", heap)).into());
        };
        let size = descriptor.size.max(1);
        if offset + size > record.size {
            return Err(GraphicsError::ResourceCreation(format!(
                "buffer '{}' [{}, {}) exceeds heap of {} bytes",
                descriptor.name,
                offset,
                offset + size,
                record.size
            ))
            .into());
        }

        let device = &self.context.device;
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(conversion::buffer_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&info, None) }
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create buffer: {:?}", e)))?;
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, record.memory, offset) } {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(GraphicsError::ResourceCreation(format!("Failed to bind buffer memory: {:?}", e)).into());
        }

        let handle = to_handle(buffer);
        self.buffers.insert(handle, VulkanBuffer { buffer, heap, offset, size });
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: NativeHandle) {
        match self.buffers.remove(&buffer) {
            Some(record) => unsafe { self.context.device.destroy_buffer(record.buffer, None) },
            None => tracing::error!(?buffer, "Destroying unknown buffer"),
        }
    }

    fn write_buffer(&mut self, buffer: NativeHandle, offset: u64, data: &[u8]) -> Result<()> {
        let record = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown buffer {:?}", buffer)))?;
        if offset + data.len() as u64 > record.size {
            return Err(GraphicsError::CommandExecution(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                record.size
            ))
            .into());
        }
        let heap = self
            .heaps
            .get(&record.heap)
            .ok_or_else(|| GraphicsError::CommandExecution("buffer outlived its heap".to_string()))?;
        let Some(mapped) = heap.mapped else {
            return Err(GraphicsError::CommandExecution("buffer heap is not host visible".to_string()).into());
        };

        unsafe {
            let dst = mapped.as_ptr().add((record.offset + offset) as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            if !heap.coherent {
                let range = vk::MappedMemoryRange::default()
                    .memory(heap.memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                self.context
                    .device
                    .flush_mapped_memory_ranges(&[range])
                    .map_err(|e| command_error("flush mapped memory", e))?;
            }
        }
        Ok(())
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<NativeTexture> {
        if descriptor.size.is_empty() {
            return Err(GraphicsError::ResourceCreation(format!("texture '{}' has zero size", descriptor.name)).into());
        }
        let device = &self.context.device;
        let format = conversion::texture_format(descriptor.format);
        let (image_type, view_type, layers) = image_type(descriptor.dimension);
        let mip_levels = descriptor.mip_levels();

        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(format)
            .extent(vk::Extent3D {
                width: descriptor.size.width,
                height: descriptor.size.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(layers)
            .samples(conversion::sample_count(descriptor.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conversion::texture_usage(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if descriptor.dimension == TextureDimension::TextureCube {
            image_info = image_info.flags(vk::ImageCreateFlags::CUBE_COMPATIBLE);
        }

        let image = unsafe { device.create_image(&image_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreation(format!("Failed to create texture '{}': {:?}", descriptor.name, e))
        })?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let Some(memory_type_index) = self
            .context
            .find_memory_type(requirements.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        else {
            unsafe { device.destroy_image(image, None) };
            return Err(GraphicsError::ResourceCreation("No device local memory for texture".to_string()).into());
        };
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(GraphicsError::ResourceCreation(format!("Failed to allocate texture memory: {:?}", e)).into());
            }
        };

        let range = vk::ImageSubresourceRange {
            aspect_mask: conversion::aspect_mask(descriptor.format),
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: layers,
        };
        let view = unsafe { device.bind_image_memory(image, memory, 0) }.and_then(|_| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(view_type)
                .format(format)
                .subresource_range(range);
            unsafe { device.create_image_view(&view_info, None) }
        });
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(GraphicsError::ResourceCreation(format!("Failed to create texture view: {:?}", e)).into());
            }
        };

        let native = NativeTexture {
            handle: to_handle(image),
            view: to_handle(view),
        };
        self.textures.insert(
            native.handle,
            VulkanTexture {
                image,
                view,
                memory: Some(memory),
                format: descriptor.format,
                mip_levels,
                layers,
            },
        );
        Ok(native)
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        let Some(record) = self.textures.remove(&texture.handle) else {
            tracing::error!(texture = ?texture.handle, "Destroying unknown texture");
            return;
        };
        let Some(memory) = record.memory else {
            tracing::error!(texture = ?texture.handle, "Swapchain images are owned by their swapchain");
            self.textures.insert(texture.handle, record);
            return;
        };
        unsafe {
            self.context.device.destroy_image_view(record.view, None);
            self.context.device.destroy_image(record.image, None);
            self.context.device.free_memory(memory, None);
        }
    }

    fn write_resource_view(&mut self, slot: ShaderResourceIndex, resource: ViewResource<'_>) {
        let device = &self.context.device;
        match resource {
            ViewResource::Buffer(buffer) => match self.buffers.get(&buffer.handle()) {
                Some(record) => self.resource_views.write_buffer(device, slot.index(), record.buffer),
                None => tracing::error!(buffer = ?buffer.handle(), "Resource view for unknown buffer"),
            },
            ViewResource::Texture(texture) => match self.textures.get(&texture.handle()) {
                Some(record) => self.resource_views.write_texture(device, slot.index(), record.view),
                None => tracing::error!(texture = ?texture.handle(), "Resource view for unknown texture"),
            },
        }
    }

    fn im_texture_id(&self, texture: &Texture) -> ImTextureId {
        ImTextureId(texture.view().raw())
    }

    fn create_shader(&mut self, entry: &ShaderEntry, bytecode: &[u8]) -> Result<NativeHandle> {
        let code = ash::util::read_spv(&mut Cursor::new(bytecode)).map_err(|e| {
            GraphicsError::ShaderCompilation(format!("Invalid SPIR-V for '{}': {}", entry.entry_point, e))
        })?;
        let info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { self.context.device.create_shader_module(&info, None) }.map_err(|e| {
            GraphicsError::ShaderCompilation(format!("Failed to create shader '{}': {:?}", entry.entry_point, e))
        })?;

        let handle = to_handle(module);
        self.shaders.insert(
            handle,
            VulkanShader {
                module,
                entry: entry.clone(),
            },
        );
        Ok(handle)
    }

    fn destroy_shader(&mut self, shader: NativeHandle) {
        let Some(record) = self.shaders.remove(&shader) else {
            return;
        };
        self.pipelines.evict_shader(&self.context.device, shader);
        unsafe { self.context.device.destroy_shader_module(record.module, None) };
    }

    fn create_command_list(&mut self, frame: u32) -> Result<NativeHandle> {
        let pool = self.command_pool(frame)?;
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { self.context.device.allocate_command_buffers(&info) }
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to allocate command buffer: {:?}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| GraphicsError::ResourceCreation("command buffer allocation returned nothing".to_string()))?;

        let handle = to_handle(buffer);
        self.lists.insert(handle, VulkanList { buffer, frame, pipeline: None });
        Ok(handle)
    }

    fn reset_command_pool(&mut self, frame: u32) -> Result<()> {
        let Some(pool) = self.command_pools.get(&frame) else {
            return Ok(());
        };
        unsafe {
            self.context
                .device
                .reset_command_pool(*pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| command_error("reset command pool", e))?;
        for list in self.lists.values_mut().filter(|list| list.frame == frame) {
            list.pipeline = None;
        }
        Ok(())
    }

    fn destroy_command_list(&mut self, frame: u32, list: NativeHandle) {
        let Some(record) = self.lists.remove(&list) else {
            return;
        };
        if let Some(pool) = self.command_pools.get(&frame) {
            unsafe { self.context.device.free_command_buffers(*pool, &[record.buffer]) };
        }
    }

    fn begin_command_list(&mut self, list: NativeHandle) -> Result<()> {
        let cmd = self.list(list)?.buffer;
        let info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.context.device.begin_command_buffer(cmd, &info) }
            .map_err(|e| command_error("begin command buffer", e))
    }

    fn record(&mut self, list: NativeHandle, command: NativeCommand<'_>) -> Result<()> {
        let cmd = self.list(list)?.buffer;
        let device = &self.context.device;

        match command {
            NativeCommand::Barriers(barriers) => self.record_barriers(cmd, barriers),
            NativeCommand::BeginRenderPass(pass) => self.begin_rendering(cmd, pass),
            NativeCommand::EndRenderPass => unsafe { device.cmd_end_rendering(cmd) },
            NativeCommand::BindGraphicsPipeline { .. } | NativeCommand::BindComputePipeline { .. } => {
                self.bind_pipeline(list, &command)?
            }
            NativeCommand::SetViewport(size) => self.set_viewport(cmd, size),
            NativeCommand::BindResource {
                binding,
                resource,
                view,
                offset,
                range,
                ..
            } => {
                let (cmd, bound) = self.bound_pipeline(list, command.name())?;
                let buffers = [vk::DescriptorBufferInfo {
                    buffer: from_handle(resource),
                    offset,
                    range: if range == 0 { vk::WHOLE_SIZE } else { range },
                }];
                let image_layout = match binding.kind {
                    BindingKind::StorageTexture => vk::ImageLayout::GENERAL,
                    _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                };
                let images = [vk::DescriptorImageInfo {
                    sampler: self.resource_views.sampler,
                    image_view: from_handle(view),
                    image_layout,
                }];
                let mut write = vk::WriteDescriptorSet::default()
                    .dst_binding(binding.slot)
                    .descriptor_type(conversion::descriptor_type(binding.kind));
                write = if binding.kind.is_buffer() {
                    write.buffer_info(&buffers)
                } else {
                    write.image_info(&images)
                };
                unsafe {
                    self.context
                        .push_descriptor
                        .cmd_push_descriptor_set(cmd, bound.bind_point, bound.layout, 0, &[write]);
                }
            }
            NativeCommand::PushConstants(data) => {
                let (cmd, bound) = self.bound_pipeline(list, command.name())?;
                unsafe { device.cmd_push_constants(cmd, bound.layout, bound.push_stages, 0, data) };
            }
            NativeCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe { device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance) },
            NativeCommand::DrawIndexed {
                index_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                device.cmd_bind_index_buffer(cmd, from_handle(index_buffer), 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cmd, index_count, instance_count, first_index, vertex_offset, first_instance);
            },
            NativeCommand::Dispatch { x, y, z } => unsafe { device.cmd_dispatch(cmd, x, y, z) },
            NativeCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let region = vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                };
                unsafe { device.cmd_copy_buffer(cmd, from_handle(src), from_handle(dst), &[region]) };
            }
            NativeCommand::CopyBufferToTexture {
                src,
                src_offset,
                row_pitch,
                dst,
                size,
            } => {
                let texture = self.texture(dst)?;
                let bytes_per_pixel = texture.format.bytes_per_pixel().max(1);
                let region = vk::BufferImageCopy::default()
                    .buffer_offset(src_offset)
                    .buffer_row_length(row_pitch / bytes_per_pixel)
                    .buffer_image_height(0)
                    .image_subresource(texture.level(0))
                    .image_extent(vk::Extent3D {
                        width: size.width.max(1),
                        height: size.height.max(1),
                        depth: 1,
                    });
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        from_handle(src),
                        texture.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
            NativeCommand::Blit {
                src,
                src_size,
                dst,
                dst_size,
            } => self.blit(cmd, src, src_size, dst, dst_size)?,
            NativeCommand::GenerateMipmaps {
                texture,
                size,
                mip_levels,
            } => self.generate_mipmaps(cmd, texture, size, mip_levels)?,
        }
        Ok(())
    }

    fn end_command_list(&mut self, list: NativeHandle) -> Result<()> {
        let cmd = self.list(list)?.buffer;
        unsafe { self.context.device.end_command_buffer(cmd) }.map_err(|e| command_error("end command buffer", e))
    }

    fn create_fence(&mut self) -> Result<NativeHandle> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.context.device.create_semaphore(&info, None) }
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create timeline semaphore: {:?}", e)))?;
        let handle = to_handle(semaphore);
        self.fences.insert(handle);
        Ok(handle)
    }

    fn destroy_fence(&mut self, fence: NativeHandle) {
        if self.fences.remove(&fence) {
            unsafe {
                self.context
                    .device
                    .destroy_semaphore(from_handle::<vk::Semaphore>(fence), None)
            };
        }
    }

    fn submit(&mut self, submission: &Submission) -> Result<()> {
        let cmd = self.list(submission.command_list)?.buffer;
        let fence: vk::Semaphore = from_handle(submission.fence);

        let mut wait_semaphores = Vec::new();
        let mut wait_stages = Vec::new();
        let mut signal_semaphores = vec![fence];
        let mut signal_values = vec![submission.signal_value];

        if let Some(present) = submission.present {
            let swapchain = self.swapchains.get(&present.swapchain).ok_or_else(|| {
                GraphicsError::SwapchainError(format!("unknown swapchain {:?}", present.swapchain))
            })?;
            wait_semaphores.push(swapchain.image_available(present.frame));
            wait_stages.push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER);
            signal_semaphores.push(swapchain.render_finished(present.image_index));
            signal_values.push(0);
        }

        let command_buffers = [cmd];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.context
                .device
                .queue_submit(self.context.queue, &[submit_info], vk::Fence::null())
        }
        .map_err(|e| command_error("submit command buffer", e))
    }

    fn completed_value(&self, fence: NativeHandle) -> u64 {
        match unsafe { self.context.device.get_semaphore_counter_value(from_handle(fence)) } {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(?fence, error = ?e, "Failed to read fence value");
                0
            }
        }
    }

    fn wait_fence(&mut self, fence: NativeHandle, value: u64) -> Result<()> {
        let semaphores = [from_handle::<vk::Semaphore>(fence)];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        unsafe { self.context.device.wait_semaphores(&info, u64::MAX) }.map_err(|e| command_error("wait for fence", e))
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.context.device.device_wait_idle() }.map_err(|e| command_error("wait for device idle", e))
    }

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities> {
        let loader = &self.context.surface_loader;
        let physical_device = self.context.physical_device;
        let surface = self.context.surface;
        let query_error = |e: vk::Result| GraphicsError::SwapchainError(format!("Failed to query surface: {:?}", e));

        let capabilities =
            unsafe { loader.get_physical_device_surface_capabilities(physical_device, surface) }.map_err(query_error)?;
        let formats = unsafe { loader.get_physical_device_surface_formats(physical_device, surface) }
            .map_err(query_error)?
            .into_iter()
            .filter_map(|format| conversion::surface_format(format.format))
            .collect();
        let present_modes = unsafe { loader.get_physical_device_surface_present_modes(physical_device, surface) }
            .map_err(query_error)?
            .into_iter()
            .filter_map(conversion::from_present_mode)
            .collect();

        // u32::MAX 表示尺寸由交换链决定
        let current_extent = (capabilities.current_extent.width != u32::MAX)
            .then(|| Size::new(capabilities.current_extent.width, capabilities.current_extent.height));

        Ok(SurfaceCapabilities {
            min_image_count: capabilities.min_image_count,
            max_image_count: capabilities.max_image_count,
            formats,
            present_modes,
            current_extent,
        })
    }

    fn create_swapchain(&mut self, descriptor: &SwapchainDescriptor) -> Result<NativeSwapchain> {
        let swapchain = VulkanSwapchain::new(&self.context, descriptor)?;
        let images = swapchain
            .images
            .iter()
            .zip(&swapchain.views)
            .map(|(&image, &view)| {
                self.textures.insert(
                    to_handle(image),
                    VulkanTexture {
                        image,
                        view,
                        memory: None,
                        format: swapchain.format,
                        mip_levels: 1,
                        layers: 1,
                    },
                );
                NativeTexture {
                    handle: to_handle(image),
                    view: to_handle(view),
                }
            })
            .collect();

        let handle = to_handle(swapchain.swapchain);
        self.swapchains.insert(handle, swapchain);
        Ok(NativeSwapchain { handle, images })
    }

    fn destroy_swapchain(&mut self, swapchain: NativeHandle) {
        let Some(mut record) = self.swapchains.remove(&swapchain) else {
            return;
        };
        // 呈现引擎可能仍持有信号量
        if let Err(e) = unsafe { self.context.device.device_wait_idle() } {
            tracing::error!(error = ?e, "Failed to wait idle before destroying swapchain");
        }
        for image in &record.images {
            self.textures.remove(&to_handle(*image));
        }
        record.destroy(&self.context);
    }

    fn acquire_next_image(&mut self, swapchain: NativeHandle, frame: u32) -> Result<AcquireStatus> {
        let record = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("unknown swapchain {:?}", swapchain)))?;
        record.acquire(&self.context, frame)
    }

    fn present(&mut self, swapchain: NativeHandle, image_index: u32, _frame: u32) -> Result<PresentStatus> {
        let record = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("unknown swapchain {:?}", swapchain)))?;
        record.present(&self.context, image_index)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            let _ = device.device_wait_idle();

            self.pipelines.destroy(device);
            self.resource_views.destroy(device);
            for (_, mut swapchain) in self.swapchains.drain() {
                swapchain.destroy(&self.context);
            }
            for (_, texture) in self.textures.drain() {
                if let Some(memory) = texture.memory {
                    device.destroy_image_view(texture.view, None);
                    device.destroy_image(texture.image, None);
                    device.free_memory(memory, None);
                }
            }
            for (_, buffer) in self.buffers.drain() {
                device.destroy_buffer(buffer.buffer, None);
            }
            for (_, heap) in self.heaps.drain() {
                if heap.mapped.is_some() {
                    device.unmap_memory(heap.memory);
                }
                device.free_memory(heap.memory, None);
            }
            for (_, shader) in self.shaders.drain() {
                device.destroy_shader_module(shader.module, None);
            }
            self.lists.clear();
            for (_, pool) in self.command_pools.drain() {
                device.destroy_command_pool(pool, None);
            }
            for fence in self.fences.drain() {
                device.destroy_semaphore(from_handle::<vk::Semaphore>(fence), None);
            }
        }
        tracing::debug!("Vulkan device destroyed");
    }
}
