//! Metal 后端（仅 macOS）
//!
//! 基于 `metal` crate 的 [`NativeDevice`] 实现。Metal 自动跟踪资源依赖，
//! 因此状态转换为空操作（[`TransitionPolicy::Implicit`]）。
//!
//! - 缓冲区放置在 `MTLHeap`（placement 类型）中
//! - 命令列表录制到一次性的 `MTLCommandBuffer`，按命令类别切换编码器
//! - 栅栏是 `MTLSharedEvent`，阻塞等待落在最后提交的命令缓冲区上
//! - 交换链图像是固定数量的槽位，每次获取时绑定到新的 drawable
//!
//! compute 线程组大小固定为 8×8×1，`Dispatch` 的参数是线程组数量。

pub mod context;
pub mod conversion;
pub mod pipeline;

use std::collections::HashMap;

use metal::{
    BlitCommandEncoder, Buffer, CommandBuffer, ComputeCommandEncoder, Heap, MTLBlitOption, MTLClearColor, MTLCommandBufferStatus,
    MTLHeapType, MTLIndexType, MTLOrigin, MTLSamplerAddressMode, MTLSamplerMinMagFilter, MTLSamplerMipFilter,
    MTLScissorRect, MTLSize, MTLStorageMode, MTLViewport, MetalDrawable, RenderCommandEncoder, RenderPassDescriptor,
    SamplerDescriptor, SamplerState, SharedEvent, Texture as MetalTexture,
};
use objc::rc::autoreleasepool;
use core_graphics_types::geometry::CGSize;

use context::MetalContext;
use pipeline::{BoundPipeline, MetalShader, PipelineCache, PUSH_CONSTANT_INDEX};

use super::backend::{
    AcquireStatus, BackendInfo, NativeCommand, NativeDevice, NativeRenderPass, NativeSwapchain, NativeTexture,
    PresentMode, PresentStatus, Submission, SurfaceCapabilities, SwapchainDescriptor, ViewResource,
};
use super::SurfaceTarget;
use crate::core::config::{DeviceConfig, GraphicsBackend};
use crate::core::error::{GraphicsError, Result};
use crate::renderer::resource::{
    BufferDescriptor, HeapDescriptor, ImTextureId, MemoryRequirements, MemoryType, NativeHandle, ShaderResourceIndex,
    Size, Texture, TextureDescriptor, TextureFormat,
};
use crate::renderer::shader::{BindingKind, ShaderEntry, ShaderStage};
use crate::renderer::transition::TransitionPolicy;

const COMPUTE_GROUP_SIZE: MTLSize = MTLSize {
    width: 8,
    height: 8,
    depth: 1,
};
/// 资源视图表项占用的字节数（GPU 资源 ID）
const DESCRIPTOR_STRIDE: u64 = 8;

fn command_error(message: impl Into<String>) -> crate::core::error::DistGfxError {
    GraphicsError::CommandExecution(message.into()).into()
}

struct MetalHeap {
    heap: Heap,
    size: u64,
    memory_type: MemoryType,
}

struct MetalBuffer {
    buffer: Buffer,
    size: u64,
    host_visible: bool,
}

struct MetalTextureRecord {
    /// 交换链槽位在获取到 drawable 之前为空
    texture: Option<MetalTexture>,
    swapchain_image: bool,
}

#[derive(Clone)]
enum ViewEntry {
    Buffer(Buffer),
    Texture(MetalTexture),
}

enum Encoder {
    None,
    Render(RenderCommandEncoder),
    Compute(ComputeCommandEncoder),
    Blit(BlitCommandEncoder),
}

impl Encoder {
    fn end(&mut self) {
        match std::mem::replace(self, Encoder::None) {
            Encoder::None => {}
            Encoder::Render(encoder) => encoder.end_encoding(),
            Encoder::Compute(encoder) => encoder.end_encoding(),
            Encoder::Blit(encoder) => encoder.end_encoding(),
        }
    }
}

struct MetalList {
    frame: u32,
    buffer: Option<CommandBuffer>,
    encoder: Encoder,
    pipeline: Option<BoundPipeline>,
}

impl MetalList {
    fn command_buffer(&self) -> Result<&CommandBuffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| command_error("command list is not recording"))
    }

    fn render_encoder(&self, what: &str) -> Result<&RenderCommandEncoder> {
        match &self.encoder {
            Encoder::Render(encoder) => Ok(encoder),
            _ => Err(command_error(format!("{} recorded outside a render pass", what))),
        }
    }

    fn blit_encoder(&mut self) -> Result<&BlitCommandEncoder> {
        if !matches!(self.encoder, Encoder::Blit(_)) {
            self.encoder.end();
            let encoder = autoreleasepool(|| self.command_buffer().map(|b| b.new_blit_command_encoder().to_owned()))?;
            self.encoder = Encoder::Blit(encoder);
        }
        match &self.encoder {
            Encoder::Blit(encoder) => Ok(encoder),
            _ => Err(command_error("blit encoder unavailable")),
        }
    }

    /// 新建的 compute 编码器会重新设置已绑定的 compute 管线
    fn compute_encoder(&mut self, sampler: &SamplerState) -> Result<&ComputeCommandEncoder> {
        if !matches!(self.encoder, Encoder::Compute(_)) {
            self.encoder.end();
            let encoder =
                autoreleasepool(|| self.command_buffer().map(|b| b.new_compute_command_encoder().to_owned()))?;
            encoder.set_sampler_state(0, Some(sampler));
            if let Some(BoundPipeline::Compute(pipeline)) = &self.pipeline {
                encoder.set_compute_pipeline_state(pipeline);
            }
            self.encoder = Encoder::Compute(encoder);
        }
        match &self.encoder {
            Encoder::Compute(encoder) => Ok(encoder),
            _ => Err(command_error("compute encoder unavailable")),
        }
    }

    fn primitive(&self, what: &str) -> Result<metal::MTLPrimitiveType> {
        match &self.pipeline {
            Some(BoundPipeline::Graphics { primitive, .. }) => Ok(*primitive),
            _ => Err(command_error(format!("{} recorded before a graphics pipeline was bound", what))),
        }
    }
}

struct MetalFence {
    event: SharedEvent,
    /// 已提交、可能未完成的命令缓冲区
    pending: Vec<(u64, CommandBuffer)>,
}

impl MetalFence {
    fn wait(&mut self, value: u64) -> Result<()> {
        let mut lost = false;
        self.pending.retain(|(signal, buffer)| {
            if *signal > value {
                return true;
            }
            buffer.wait_until_completed();
            lost |= matches!(buffer.status(), MTLCommandBufferStatus::Error);
            false
        });
        if lost {
            return Err(GraphicsError::DeviceLost("command buffer execution failed".to_string()).into());
        }
        Ok(())
    }
}

struct SwapchainRecord {
    images: Vec<NativeHandle>,
    drawables: Vec<Option<MetalDrawable>>,
    next: usize,
}

/// Metal 原生设备
pub struct MetalDevice {
    info: BackendInfo,
    next_id: u64,
    heaps: HashMap<NativeHandle, MetalHeap>,
    buffers: HashMap<NativeHandle, MetalBuffer>,
    textures: HashMap<NativeHandle, MetalTextureRecord>,
    shaders: HashMap<NativeHandle, MetalShader>,
    lists: HashMap<NativeHandle, MetalList>,
    fences: HashMap<NativeHandle, MetalFence>,
    swapchains: HashMap<NativeHandle, SwapchainRecord>,
    resource_views: Vec<Option<ViewEntry>>,
    sampler: SamplerState,
    pipelines: PipelineCache,
    context: MetalContext,
}

impl MetalDevice {
    pub fn new(config: &DeviceConfig, target: &SurfaceTarget) -> Result<Self> {
        let context = MetalContext::new(config, target)?;

        let sampler_descriptor = SamplerDescriptor::new();
        sampler_descriptor.set_min_filter(MTLSamplerMinMagFilter::Linear);
        sampler_descriptor.set_mag_filter(MTLSamplerMinMagFilter::Linear);
        sampler_descriptor.set_mip_filter(MTLSamplerMipFilter::Linear);
        sampler_descriptor.set_address_mode_s(MTLSamplerAddressMode::ClampToEdge);
        sampler_descriptor.set_address_mode_t(MTLSamplerAddressMode::ClampToEdge);
        sampler_descriptor.set_address_mode_r(MTLSamplerAddressMode::ClampToEdge);
        let sampler = context.device.new_sampler(&sampler_descriptor);

        tracing::info!(
            device_name = %context.device_name,
            descriptor_capacity = config.descriptor_capacity,
            "Metal device initialized"
        );

        Ok(Self {
            info: BackendInfo {
                kind: GraphicsBackend::Metal,
                device_name: context.device_name.clone(),
                descriptor_stride: DESCRIPTOR_STRIDE,
                transition_policy: TransitionPolicy::Implicit,
                mipmaps_by_blit: false,
            },
            next_id: 0,
            heaps: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            lists: HashMap::new(),
            fences: HashMap::new(),
            swapchains: HashMap::new(),
            resource_views: vec![None; config.descriptor_capacity as usize],
            sampler,
            pipelines: PipelineCache::new(),
            context,
        })
    }

    fn allocate_id(&mut self) -> NativeHandle {
        self.next_id += 1;
        NativeHandle(self.next_id)
    }

    fn texture(&self, texture: NativeHandle) -> Result<&MetalTexture> {
        self.textures
            .get(&texture)
            .and_then(|record| record.texture.as_ref())
            .ok_or_else(|| command_error(format!("unknown or unacquired texture {:?}", texture)))
    }

    fn buffer(&self, buffer: NativeHandle) -> Result<&Buffer> {
        self.buffers
            .get(&buffer)
            .map(|record| &record.buffer)
            .ok_or_else(|| command_error(format!("unknown buffer {:?}", buffer)))
    }

    fn begin_render_pass(&mut self, list: NativeHandle, pass: &NativeRenderPass) -> Result<()> {
        let descriptor = RenderPassDescriptor::new();
        for (index, color) in pass.colors.iter().enumerate() {
            let attachment = descriptor
                .color_attachments()
                .object_at(index as u64)
                .ok_or_else(|| command_error(format!("color attachment {} out of range", index)))?;
            attachment.set_texture(Some(self.texture(color.texture)?));
            attachment.set_load_action(conversion::load_action(color.load));
            attachment.set_store_action(conversion::store_action(color.store));
            let [r, g, b, a] = color.clear_color;
            attachment.set_clear_color(MTLClearColor::new(r as f64, g as f64, b as f64, a as f64));
        }
        if let Some(depth) = &pass.depth {
            let texture = self.texture(depth.texture)?;
            if let Some(attachment) = descriptor.depth_attachment() {
                attachment.set_texture(Some(texture));
                attachment.set_load_action(conversion::load_action(depth.load));
                attachment.set_store_action(conversion::store_action(depth.store));
                attachment.set_clear_depth(depth.clear_depth as f64);
            }
            if depth.format.has_stencil() {
                if let Some(attachment) = descriptor.stencil_attachment() {
                    attachment.set_texture(Some(texture));
                    attachment.set_load_action(conversion::load_action(depth.load));
                    attachment.set_store_action(conversion::store_action(depth.store));
                    attachment.set_clear_stencil(depth.clear_stencil);
                }
            }
        }

        let record = self
            .lists
            .get_mut(&list)
            .ok_or_else(|| command_error(format!("unknown command list {:?}", list)))?;
        record.encoder.end();
        let encoder = record.command_buffer()?.new_render_command_encoder(descriptor).to_owned();
        set_viewport(&encoder, pass.size);
        record.encoder = Encoder::Render(encoder);
        Ok(())
    }

    fn resolve_binding(
        &self,
        kind: BindingKind,
        resource: NativeHandle,
        resource_view: ShaderResourceIndex,
    ) -> Result<ViewEntry> {
        if kind == BindingKind::SampledTexture && resource_view.is_valid() {
            if let Some(Some(entry)) = self.resource_views.get(resource_view.index() as usize) {
                return Ok(entry.clone());
            }
        }
        if kind.is_buffer() {
            Ok(ViewEntry::Buffer(self.buffer(resource)?.clone()))
        } else {
            Ok(ViewEntry::Texture(self.texture(resource)?.clone()))
        }
    }
}

fn set_viewport(encoder: &RenderCommandEncoder, size: Size) {
    encoder.set_viewport(MTLViewport {
        originX: 0.0,
        originY: 0.0,
        width: size.width as f64,
        height: size.height as f64,
        znear: 0.0,
        zfar: 1.0,
    });
    encoder.set_scissor_rect(MTLScissorRect {
        x: 0,
        y: 0,
        width: size.width as u64,
        height: size.height as u64,
    });
}

impl NativeDevice for MetalDevice {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn allocate_heap(&mut self, descriptor: &HeapDescriptor) -> Result<NativeHandle> {
        let heap_descriptor = metal::HeapDescriptor::new();
        heap_descriptor.set_heap_type(MTLHeapType::Placement);
        heap_descriptor.set_storage_mode(conversion::storage_mode(descriptor.memory_type));
        heap_descriptor.set_size(descriptor.size);
        let heap = self.context.device.new_heap(&heap_descriptor);
        heap.set_label(&descriptor.name);

        let handle = self.allocate_id();
        self.heaps.insert(
            handle,
            MetalHeap {
                heap,
                size: descriptor.size,
                memory_type: descriptor.memory_type,
            },
        );
        tracing::debug!(name = %descriptor.name, size = descriptor.size, "Metal heap allocated");
        Ok(handle)
    }

    fn free_heap(&mut self, heap: NativeHandle) {
        if self.heaps.remove(&heap).is_none() {
            tracing::error!(?heap, "Freeing unknown heap");
        }
    }

    fn heap_alignment(&self, memory_type: MemoryType) -> u64 {
        self.context
            .device
            .heap_buffer_size_and_align(1, conversion::resource_options(memory_type))
            .align
    }

    fn memory_requirements(&self, descriptor: &BufferDescriptor) -> MemoryRequirements {
        let native = self
            .context
            .device
            .heap_buffer_size_and_align(descriptor.aligned_size(), conversion::resource_options(MemoryType::Gpu));
        MemoryRequirements {
            size: native.size,
            alignment: native.align,
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
        let buffer = record
            .heap
            .new_buffer_with_offset(size, conversion::resource_options(record.memory_type), offset)
            .ok_or_else(|| GraphicsError::ResourceCreation(format!("Failed to place buffer '{}'", descriptor.name)))?;
        buffer.set_label(&descriptor.name);
        let host_visible = record.memory_type.is_host_visible();

        let handle = self.allocate_id();
        self.buffers.insert(
            handle,
            MetalBuffer {
                buffer,
                size: descriptor.size,
                host_visible,
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: NativeHandle) {
        if self.buffers.remove(&buffer).is_none() {
            tracing::error!(?buffer, "Destroying unknown buffer");
        }
    }

    fn write_buffer(&mut self, buffer: NativeHandle, offset: u64, data: &[u8]) -> Result<()> {
        let record = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| command_error(format!("unknown buffer {:?}", buffer)))?;
        if offset + data.len() as u64 > record.size {
            return Err(command_error(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                record.size
            )));
        }
        if !record.host_visible {
            return Err(command_error("buffer heap is not host visible"));
        }
        let contents = record.buffer.contents() as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), contents.add(offset as usize), data.len()) };
        Ok(())
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<NativeTexture> {
        if descriptor.size.is_empty() {
            return Err(GraphicsError::ResourceCreation(format!("texture '{}' has zero size", descriptor.name)).into());
        }
        let native = metal::TextureDescriptor::new();
        native.set_texture_type(conversion::texture_type(descriptor));
        native.set_pixel_format(conversion::pixel_format(descriptor.format));
        native.set_width(descriptor.size.width as u64);
        native.set_height(descriptor.size.height as u64);
        native.set_depth(1);
        native.set_mipmap_level_count(descriptor.mip_levels() as u64);
        native.set_sample_count(descriptor.sample_count.max(1) as u64);
        native.set_usage(conversion::texture_usage(descriptor.usage));
        native.set_storage_mode(MTLStorageMode::Private);
        let texture = self.context.device.new_texture(&native);
        texture.set_label(&descriptor.name);

        let handle = self.allocate_id();
        self.textures.insert(
            handle,
            MetalTextureRecord {
                texture: Some(texture),
                swapchain_image: false,
            },
        );
        // Metal 纹理即视图
        Ok(NativeTexture { handle, view: handle })
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        match self.textures.get(&texture.handle) {
            Some(record) if record.swapchain_image => {
                tracing::error!(texture = ?texture.handle, "Swapchain images are owned by their swapchain");
            }
            Some(_) => {
                self.textures.remove(&texture.handle);
            }
            None => tracing::error!(texture = ?texture.handle, "Destroying unknown texture"),
        }
    }

    fn write_resource_view(&mut self, slot: ShaderResourceIndex, resource: ViewResource<'_>) {
        let entry = match resource {
            ViewResource::Buffer(buffer) => self.buffers.get(&buffer.handle()).map(|r| ViewEntry::Buffer(r.buffer.clone())),
            ViewResource::Texture(texture) => self
                .textures
                .get(&texture.handle())
                .and_then(|r| r.texture.clone())
                .map(ViewEntry::Texture),
        };
        match self.resource_views.get_mut(slot.index() as usize) {
            Some(view) if entry.is_some() => *view = entry,
            Some(_) => tracing::error!(slot = slot.index(), "Resource view for unknown resource"),
            None => tracing::error!(slot = slot.index(), "Resource view slot out of range"),
        }
    }

    fn im_texture_id(&self, texture: &Texture) -> ImTextureId {
        ImTextureId(texture.resource_view().index() as u64)
    }

    fn create_shader(&mut self, entry: &ShaderEntry, bytecode: &[u8]) -> Result<NativeHandle> {
        let shader = MetalShader::new(&self.context.device, entry, bytecode)?;
        let handle = self.allocate_id();
        self.shaders.insert(handle, shader);
        Ok(handle)
    }

    fn destroy_shader(&mut self, shader: NativeHandle) {
        if self.shaders.remove(&shader).is_some() {
            self.pipelines.evict_shader(shader);
        }
    }

    fn create_command_list(&mut self, frame: u32) -> Result<NativeHandle> {
        let handle = self.allocate_id();
        self.lists.insert(
            handle,
            MetalList {
                frame,
                buffer: None,
                encoder: Encoder::None,
                pipeline: None,
            },
        );
        Ok(handle)
    }

    fn reset_command_pool(&mut self, frame: u32) -> Result<()> {
        for list in self.lists.values_mut().filter(|list| list.frame == frame) {
            list.encoder.end();
            list.buffer = None;
            list.pipeline = None;
        }
        Ok(())
    }

    fn destroy_command_list(&mut self, _frame: u32, list: NativeHandle) {
        if let Some(mut record) = self.lists.remove(&list) {
            record.encoder.end();
        }
    }

    fn begin_command_list(&mut self, list: NativeHandle) -> Result<()> {
        let queue = &self.context.queue;
        let record = self
            .lists
            .get_mut(&list)
            .ok_or_else(|| command_error(format!("unknown command list {:?}", list)))?;
        record.encoder.end();
        record.pipeline = None;
        record.buffer = Some(autoreleasepool(|| queue.new_command_buffer().to_owned()));
        Ok(())
    }

    fn record(&mut self, list: NativeHandle, command: NativeCommand<'_>) -> Result<()> {
        if let NativeCommand::BeginRenderPass(pass) = command {
            return autoreleasepool(|| self.begin_render_pass(list, pass));
        }

        let binding = match command {
            NativeCommand::BindResource {
                binding,
                resource,
                resource_view,
                ..
            } => Some(self.resolve_binding(binding.kind, resource, resource_view)?),
            _ => None,
        };
        let blit = match command {
            NativeCommand::CopyBuffer { src, dst, .. } => {
                Some((ViewEntry::Buffer(self.buffer(src)?.clone()), ViewEntry::Buffer(self.buffer(dst)?.clone())))
            }
            NativeCommand::CopyBufferToTexture { src, dst, .. } => {
                Some((ViewEntry::Buffer(self.buffer(src)?.clone()), ViewEntry::Texture(self.texture(dst)?.clone())))
            }
            NativeCommand::Blit { src, dst, .. } => {
                Some((ViewEntry::Texture(self.texture(src)?.clone()), ViewEntry::Texture(self.texture(dst)?.clone())))
            }
            _ => None,
        };

        let Self {
            ref mut lists,
            ref buffers,
            ref textures,
            ref shaders,
            ref mut pipelines,
            ref sampler,
            ref context,
            ..
        } = *self;
        let record = lists
            .get_mut(&list)
            .ok_or_else(|| command_error(format!("unknown command list {:?}", list)))?;
        let shader = |handle: NativeHandle| {
            shaders
                .get(&handle)
                .ok_or_else(|| command_error(format!("unknown shader {:?}", handle)))
        };

        match command {
            // 依赖由 Metal 自动跟踪
            NativeCommand::Barriers(_) => {}
            NativeCommand::BeginRenderPass(_) => {}
            NativeCommand::EndRenderPass => record.encoder.end(),
            NativeCommand::BindGraphicsPipeline {
                state,
                vertex,
                fragment,
                pass,
            } => {
                let bound = pipelines.graphics_pipeline(
                    &context.device,
                    (vertex.handle(), shader(vertex.handle())?),
                    (fragment.handle(), shader(fragment.handle())?),
                    state,
                    &pass.color_formats(),
                    pass.depth_format(),
                    pass.sample_count,
                )?;
                let encoder = record.render_encoder(command.name())?;
                if let BoundPipeline::Graphics {
                    pipeline,
                    depth_stencil,
                    cull_mode,
                    ..
                } = &bound
                {
                    encoder.set_render_pipeline_state(pipeline);
                    encoder.set_depth_stencil_state(depth_stencil);
                    encoder.set_cull_mode(*cull_mode);
                    encoder.set_vertex_sampler_state(0, Some(sampler));
                    encoder.set_fragment_sampler_state(0, Some(sampler));
                }
                record.pipeline = Some(bound);
            }
            NativeCommand::BindComputePipeline { compute } => {
                let bound = pipelines.compute_pipeline(&context.device, compute.handle(), shader(compute.handle())?)?;
                let state = match &bound {
                    BoundPipeline::Compute(pipeline) => Some(pipeline.clone()),
                    BoundPipeline::Graphics { .. } => None,
                };
                record.pipeline = Some(bound);
                let encoder = record.compute_encoder(sampler)?;
                if let Some(pipeline) = &state {
                    encoder.set_compute_pipeline_state(pipeline);
                }
            }
            NativeCommand::SetViewport(size) => set_viewport(record.render_encoder(command.name())?, size),
            NativeCommand::BindResource {
                stage,
                binding: shader_binding,
                offset,
                ..
            } => {
                let slot = shader_binding.slot as u64;
                let entry = binding.ok_or_else(|| command_error("unresolved binding"))?;
                match (stage, entry) {
                    (ShaderStage::Compute, ViewEntry::Buffer(buffer)) => {
                        record.compute_encoder(sampler)?.set_buffer(slot, Some(&buffer), offset)
                    }
                    (ShaderStage::Compute, ViewEntry::Texture(texture)) => {
                        record.compute_encoder(sampler)?.set_texture(slot, Some(&texture))
                    }
                    (ShaderStage::Vertex, ViewEntry::Buffer(buffer)) => {
                        record.render_encoder(command.name())?.set_vertex_buffer(slot, Some(&buffer), offset)
                    }
                    (ShaderStage::Vertex, ViewEntry::Texture(texture)) => {
                        record.render_encoder(command.name())?.set_vertex_texture(slot, Some(&texture))
                    }
                    (ShaderStage::Fragment, ViewEntry::Buffer(buffer)) => {
                        record.render_encoder(command.name())?.set_fragment_buffer(slot, Some(&buffer), offset)
                    }
                    (ShaderStage::Fragment, ViewEntry::Texture(texture)) => {
                        record.render_encoder(command.name())?.set_fragment_texture(slot, Some(&texture))
                    }
                }
            }
            NativeCommand::PushConstants(data) => {
                let length = data.len() as u64;
                let bytes = data.as_ptr() as *const std::ffi::c_void;
                let compute = match &record.pipeline {
                    Some(bound) => matches!(bound, BoundPipeline::Compute(_)),
                    None => return Err(command_error("push constants recorded before a pipeline was bound")),
                };
                if compute {
                    record.compute_encoder(sampler)?.set_bytes(PUSH_CONSTANT_INDEX, length, bytes);
                } else {
                    let encoder = record.render_encoder(command.name())?;
                    encoder.set_vertex_bytes(PUSH_CONSTANT_INDEX, length, bytes);
                    encoder.set_fragment_bytes(PUSH_CONSTANT_INDEX, length, bytes);
                }
            }
            NativeCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                let primitive = record.primitive(command.name())?;
                record.render_encoder(command.name())?.draw_primitives_instanced_base_instance(
                    primitive,
                    first_vertex as u64,
                    vertex_count as u64,
                    instance_count as u64,
                    first_instance as u64,
                );
            }
            NativeCommand::DrawIndexed {
                index_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                let primitive = record.primitive(command.name())?;
                let index_buffer = &buffers
                    .get(&index_buffer)
                    .ok_or_else(|| command_error(format!("unknown buffer {:?}", index_buffer)))?
                    .buffer;
                record.render_encoder(command.name())?.draw_indexed_primitives_instanced_base_instance(
                    primitive,
                    index_count as u64,
                    MTLIndexType::UInt32,
                    index_buffer,
                    first_index as u64 * 4,
                    instance_count as u64,
                    vertex_offset as i64,
                    first_instance as u64,
                );
            }
            NativeCommand::Dispatch { x, y, z } => {
                if !matches!(record.pipeline, Some(BoundPipeline::Compute(_))) {
                    return Err(command_error("dispatch recorded before a compute pipeline was bound"));
                }
                record.compute_encoder(sampler)?.dispatch_thread_groups(
                    MTLSize {
                        width: x as u64,
                        height: y as u64,
                        depth: z as u64,
                    },
                    COMPUTE_GROUP_SIZE,
                );
            }
            NativeCommand::CopyBuffer {
                src_offset,
                dst_offset,
                size,
                ..
            } => {
                if let Some((ViewEntry::Buffer(src), ViewEntry::Buffer(dst))) = blit {
                    record.blit_encoder()?.copy_from_buffer(&src, src_offset, &dst, dst_offset, size);
                }
            }
            NativeCommand::CopyBufferToTexture {
                src_offset,
                row_pitch,
                size,
                ..
            } => {
                if let Some((ViewEntry::Buffer(src), ViewEntry::Texture(dst))) = blit {
                    let region = MTLSize {
                        width: size.width.max(1) as u64,
                        height: size.height.max(1) as u64,
                        depth: 1,
                    };
                    record.blit_encoder()?.copy_from_buffer_to_texture(
                        &src,
                        src_offset,
                        row_pitch as u64,
                        row_pitch as u64 * region.height,
                        region,
                        &dst,
                        0,
                        0,
                        MTLOrigin { x: 0, y: 0, z: 0 },
                        MTLBlitOption::empty(),
                    );
                }
            }
            NativeCommand::Blit { src_size, dst_size, .. } => {
                if let Some((ViewEntry::Texture(src), ViewEntry::Texture(dst))) = blit {
                    if src_size != dst_size {
                        tracing::debug!(?src_size, ?dst_size, "Metal blit copies the overlapping region without scaling");
                    }
                    let origin = MTLOrigin { x: 0, y: 0, z: 0 };
                    let region = MTLSize {
                        width: src_size.width.min(dst_size.width) as u64,
                        height: src_size.height.min(dst_size.height) as u64,
                        depth: 1,
                    };
                    record
                        .blit_encoder()?
                        .copy_from_texture(&src, 0, 0, origin, region, &dst, 0, 0, origin);
                }
            }
            NativeCommand::GenerateMipmaps { texture, .. } => {
                let texture = textures
                    .get(&texture)
                    .and_then(|r| r.texture.as_ref())
                    .ok_or_else(|| command_error(format!("unknown texture {:?}", texture)))?
                    .clone();
                record.blit_encoder()?.generate_mipmaps(&texture);
            }
        }
        Ok(())
    }

    fn end_command_list(&mut self, list: NativeHandle) -> Result<()> {
        let record = self
            .lists
            .get_mut(&list)
            .ok_or_else(|| command_error(format!("unknown command list {:?}", list)))?;
        record.encoder.end();
        Ok(())
    }

    fn create_fence(&mut self) -> Result<NativeHandle> {
        let event = self.context.device.new_shared_event();
        let handle = self.allocate_id();
        self.fences.insert(
            handle,
            MetalFence {
                event,
                pending: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn destroy_fence(&mut self, fence: NativeHandle) {
        self.fences.remove(&fence);
    }

    fn submit(&mut self, submission: &Submission) -> Result<()> {
        let buffer = self
            .lists
            .get_mut(&submission.command_list)
            .and_then(|record| record.buffer.take())
            .ok_or_else(|| command_error(format!("command list {:?} has nothing to submit", submission.command_list)))?;

        if let Some(present) = &submission.present {
            let drawable = self
                .swapchains
                .get_mut(&present.swapchain)
                .and_then(|record| record.drawables.get_mut(present.image_index as usize))
                .and_then(Option::take);
            match drawable {
                Some(drawable) => buffer.present_drawable(&drawable),
                None => tracing::warn!(image = present.image_index, "Presenting an image that was not acquired"),
            }
        }

        let fence = self
            .fences
            .get_mut(&submission.fence)
            .ok_or_else(|| command_error(format!("unknown fence {:?}", submission.fence)))?;
        buffer.encode_signal_event(&fence.event, submission.signal_value);
        buffer.commit();

        let completed = fence.event.signaled_value();
        fence.pending.retain(|(value, _)| *value > completed);
        fence.pending.push((submission.signal_value, buffer));
        Ok(())
    }

    fn completed_value(&self, fence: NativeHandle) -> u64 {
        match self.fences.get(&fence) {
            Some(fence) => fence.event.signaled_value(),
            None => {
                tracing::error!(?fence, "Reading unknown fence");
                0
            }
        }
    }

    fn wait_fence(&mut self, fence: NativeHandle, value: u64) -> Result<()> {
        self.fences
            .get_mut(&fence)
            .ok_or_else(|| command_error(format!("unknown fence {:?}", fence)))?
            .wait(value)
    }

    fn wait_idle(&mut self) -> Result<()> {
        for fence in self.fences.values_mut() {
            fence.wait(u64::MAX)?;
        }
        Ok(())
    }

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities> {
        Ok(SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 3,
            formats: vec![
                TextureFormat::B8G8R8A8_UNorm,
                TextureFormat::B8G8R8A8_SRGB,
                TextureFormat::R16G16B16A16_SFloat,
            ],
            present_modes: vec![PresentMode::Fifo, PresentMode::Immediate],
            current_extent: None,
        })
    }

    fn create_swapchain(&mut self, descriptor: &SwapchainDescriptor) -> Result<NativeSwapchain> {
        let layer = &self.context.layer;
        layer.set_pixel_format(conversion::pixel_format(descriptor.format));
        layer.set_drawable_size(CGSize::new(descriptor.size.width as f64, descriptor.size.height as f64));
        layer.set_maximum_drawable_count(descriptor.image_count.clamp(2, 3) as u64);
        layer.set_display_sync_enabled(descriptor.present_mode == PresentMode::Fifo);

        let mut images = Vec::with_capacity(descriptor.image_count as usize);
        for _ in 0..descriptor.image_count {
            let handle = self.allocate_id();
            self.textures.insert(
                handle,
                MetalTextureRecord {
                    texture: None,
                    swapchain_image: true,
                },
            );
            images.push(handle);
        }

        let handle = self.allocate_id();
        self.swapchains.insert(
            handle,
            SwapchainRecord {
                drawables: vec![None; images.len()],
                images: images.clone(),
                next: 0,
            },
        );
        tracing::debug!(
            width = descriptor.size.width,
            height = descriptor.size.height,
            images = descriptor.image_count,
            "Metal layer configured"
        );
        Ok(NativeSwapchain {
            handle,
            images: images.into_iter().map(|handle| NativeTexture { handle, view: handle }).collect(),
        })
    }

    fn destroy_swapchain(&mut self, swapchain: NativeHandle) {
        let Some(record) = self.swapchains.remove(&swapchain) else {
            return;
        };
        if let Err(e) = self.wait_idle() {
            tracing::error!(error = %e, "Failed to wait idle before destroying swapchain");
        }
        for image in record.images {
            self.textures.remove(&image);
        }
    }

    fn acquire_next_image(&mut self, swapchain: NativeHandle, _frame: u32) -> Result<AcquireStatus> {
        let layer = &self.context.layer;
        let record = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("unknown swapchain {:?}", swapchain)))?;

        let Some(drawable) = autoreleasepool(|| layer.next_drawable().map(|d| d.to_owned())) else {
            return Ok(AcquireStatus::OutOfDate);
        };
        let slot = record.next;
        record.next = (record.next + 1) % record.images.len().max(1);

        if let Some(image) = self.textures.get_mut(&record.images[slot]) {
            image.texture = Some(drawable.texture().to_owned());
        }
        record.drawables[slot] = Some(drawable);
        Ok(AcquireStatus::Acquired(slot as u32))
    }

    fn present(&mut self, swapchain: NativeHandle, image_index: u32, _frame: u32) -> Result<PresentStatus> {
        let record = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("unknown swapchain {:?}", swapchain)))?;
        // 随命令缓冲区提交的 drawable 已经被取走
        if let Some(drawable) = record.drawables.get_mut(image_index as usize).and_then(Option::take) {
            drawable.present();
        }
        Ok(PresentStatus::Presented)
    }
}

impl Drop for MetalDevice {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::error!(error = %e, "Failed to wait idle before destroying device");
        }
        tracing::debug!("Metal device destroyed");
    }
}
