//! 图形设备
//!
//! `GraphicsDevice` 是本层唯一的入口：在创建时选定原生后端，之后负责
//!
//! - 资源工厂：堆、缓冲区、纹理、着色器、资源视图
//! - 复用：空闲堆池、空闲纹理池、着色器缓存、每帧命令池
//! - 帧延迟销毁：释放请求进入当前帧的队列，等该帧槽位的栅栏被等待后才执行
//! - 交换链与呈现：获取可绘制对象、提交并呈现、推进帧索引
//!
//! ```text
//!  frame_index ──▶ 0 ──present──▶ 1 ──present──▶ 2 ──present──▶ 0 ...
//!                  │                                             │
//!                  └─ 记录栅栏                      等待该栅栏 ◀──┘
//! ```
//!
//! 所有状态都是设备的字段，经 `&mut self` 修改，只能在渲染线程上使用。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::command::{CommandBuffer, CommandPool};
use super::deferred::{FreePools, FrameQueues, PoolContext, PooledObject};
use super::descriptor::DescriptorTable;
use super::heap::Heap;
use super::resource::{
    Buffer, BufferDescriptor, BufferUsage, HeapDescriptor, ImTextureId, MemoryRequirements, MemoryType,
    NativeHandle, ShaderResourceIndex, Size, Texture, TextureDescriptor, INVALID_RESOURCE_INDEX,
};
use super::shader::{Shader, ShaderEntry, ShaderLibrary, ShaderStage};
use super::swapchain::Swapchain;
use super::sync::{FenceValue, FrameFences};
use super::transition::{Barrier, ResourceState, ResourceStateCache};
use crate::core::config::{DeviceConfig, GpuExecution, GraphicsBackend, RendererConfig};
use crate::core::error::{GraphicsError, Result};
use crate::core::event::{EventBus, RendererResizeEvent};
use crate::gfx::backend::{AcquireStatus, NativeDevice, NativeTexture, PresentStatus, PresentSync, ViewResource};
use crate::gfx::{create_native_device, SurfaceTarget};
use crate::{gfx_error, gfx_fatal, gfx_info, gfx_warn, span_trace};

/// 原生分配计数
///
/// 只统计真正到达后端的分配与销毁，池命中单独计数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub heaps_allocated: u64,
    pub heaps_freed: u64,
    pub heap_pool_hits: u64,
    pub textures_allocated: u64,
    pub textures_destroyed: u64,
    pub texture_pool_hits: u64,
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub shaders_created: u64,
    pub shaders_destroyed: u64,
    pub command_lists_created: u64,
    pub command_lists_destroyed: u64,
}

/// 图形设备
pub struct GraphicsDevice {
    native: Box<dyn NativeDevice>,
    config: DeviceConfig,
    renderer_config: RendererConfig,
    /// 窗口系统给出的尺寸，呈现引擎未报告尺寸时使用
    requested_size: Size,
    descriptors: DescriptorTable,
    states: ResourceStateCache,
    pools: FreePools,
    queues: FrameQueues,
    /// 已释放、尚未销毁或仍在空闲池中的纹理与缓冲区
    released: HashSet<NativeHandle>,
    stats: AllocationStats,
    shader_library: ShaderLibrary,
    shaders: HashMap<String, Shader>,
    command_pools: Vec<CommandPool>,
    frame_fences: FrameFences,
    swapchain: Swapchain,
    frame_index: u32,
    events: EventBus,
    is_shut_down: bool,
}

impl GraphicsDevice {
    /// 按配置选择后端并创建设备
    ///
    /// 原生后端需要窗口表面；headless 后端忽略 `surface`。
    pub fn create(config: &DeviceConfig, surface: Option<SurfaceTarget>) -> Result<Self> {
        if !config.backend.is_available() {
            return Err(GraphicsError::DeviceCreation(format!(
                "{} backend is not available on this platform",
                config.backend.name()
            ))
            .into());
        }
        if config.backend == GraphicsBackend::Headless && config.headless.execution == GpuExecution::Manual {
            return Err(GraphicsError::DeviceCreation(
                "manual GPU execution needs a GpuController, build the device with `with_native`".to_string(),
            )
            .into());
        }

        let native = create_native_device(config, surface)?;
        Self::with_native(config, native)
    }

    /// 用现成的原生设备创建（测试中配合 `GpuController` 使用）
    pub fn with_native(config: &DeviceConfig, native: Box<dyn NativeDevice>) -> Result<Self> {
        let info = native.info().clone();
        let shader_library = match &config.shader_library {
            Some(path) => ShaderLibrary::from_file(path)?,
            None => ShaderLibrary::new(),
        };

        let renderer_config = config.renderer;
        let frames = 2;
        let mut device = Self {
            native,
            config: config.clone(),
            renderer_config,
            requested_size: Size::new(config.drawable_size.0, config.drawable_size.1),
            descriptors: DescriptorTable::new(config.descriptor_capacity, info.descriptor_stride),
            states: ResourceStateCache::new(info.transition_policy),
            pools: FreePools::new(),
            queues: FrameQueues::new(frames),
            released: HashSet::new(),
            stats: AllocationStats::default(),
            shader_library,
            shaders: HashMap::new(),
            command_pools: (0..frames).map(|_| CommandPool::new()).collect(),
            frame_fences: FrameFences::new(frames),
            swapchain: Swapchain::new(),
            frame_index: 0,
            events: EventBus::new(),
            is_shut_down: false,
        };
        device.rebuild_swapchain(device.requested_size)?;

        gfx_info!(
            backend = info.kind.name(),
            device = %info.device_name,
            frames_in_flight = device.frames_in_flight(),
            descriptor_capacity = config.descriptor_capacity,
            "Graphics device created"
        );
        Ok(device)
    }

    // ---- 查询 ----

    pub fn native(&self) -> &dyn NativeDevice {
        self.native.as_ref()
    }

    pub fn native_mut(&mut self) -> &mut dyn NativeDevice {
        self.native.as_mut()
    }

    pub fn backend_kind(&self) -> GraphicsBackend {
        self.native.info().kind
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn renderer_config(&self) -> &RendererConfig {
        &self.renderer_config
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// 上一帧的槽位
    pub fn last_frame_index(&self) -> u32 {
        let frames = self.frames_in_flight();
        (self.frame_index + frames - 1) % frames
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.queues.frames()
    }

    pub fn drawable_size(&self) -> Size {
        self.swapchain.size()
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn allocation_stats(&self) -> AllocationStats {
        self.stats
    }

    pub fn free_pools(&self) -> &FreePools {
        &self.pools
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    pub fn resource_states(&self) -> &ResourceStateCache {
        &self.states
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn memory_requirements(&self, descriptor: &BufferDescriptor) -> MemoryRequirements {
        self.native.memory_requirements(descriptor)
    }

    // ---- 堆 ----

    /// 取一个堆：先找空闲池中内存类型相同且足够大的，否则新分配
    pub fn create_heap(&mut self, descriptor: &HeapDescriptor) -> Result<Heap> {
        if let Some(heap) = self.pools.take_heap(descriptor) {
            self.stats.heap_pool_hits += 1;
            tracing::debug!(
                heap = %descriptor.name,
                requested = descriptor.size,
                pooled = heap.size(),
                "Heap reused from pool"
            );
            return Ok(heap);
        }

        let handle = self.native.allocate_heap(descriptor)?;
        let alignment = self.native.heap_alignment(descriptor.memory_type);
        self.stats.heaps_allocated += 1;
        tracing::debug!(
            heap = %descriptor.name,
            memory_type = ?descriptor.memory_type,
            size = descriptor.size,
            alignment,
            "Heap allocated"
        );
        Ok(Heap::new(handle, descriptor.clone(), alignment))
    }

    /// 归还堆：在当前帧槽位下一次被复用时重置并放回空闲池
    pub fn release_heap(&mut self, heap: Heap) {
        self.add_pooled_object(PooledObject::HeapToPool(heap));
    }

    /// 延迟释放原生堆，不经过空闲池
    pub fn dispose_heap(&mut self, heap: Heap) {
        self.add_pooled_object(PooledObject::Heap(heap));
    }

    // ---- 缓冲区 ----

    /// 在堆中线性切出一个缓冲区
    ///
    /// CPU 堆中的缓冲区与暂存缓冲区不分配资源视图。
    ///
    /// # Panics
    ///
    /// 堆空间不足时 panic。
    pub fn create_buffer(&mut self, heap: &mut Heap, descriptor: &BufferDescriptor) -> Result<Buffer> {
        let requirements = self.native.memory_requirements(descriptor);
        let offset = heap.sub_allocate(requirements.size);
        let handle = self.native.create_placed_buffer(heap.handle(), offset, descriptor)?;

        let mut buffer = Buffer {
            handle,
            descriptor: descriptor.clone(),
            resource_view: INVALID_RESOURCE_INDEX,
            heap: heap.handle(),
            offset,
        };
        if heap.memory_type() != MemoryType::Cpu && descriptor.usage != BufferUsage::Staging {
            buffer.resource_view = self.create_resource_view(ViewResource::Buffer(&buffer));
        }
        self.stats.buffers_created += 1;
        Ok(buffer)
    }

    /// 延迟销毁缓冲区并归还其资源视图
    ///
    /// # Panics
    ///
    /// 同一缓冲区释放两次时 panic。
    pub fn release_buffer(&mut self, buffer: Buffer) {
        self.mark_released(buffer.handle, "buffer");
        self.add_pooled_object(PooledObject::Buffer(buffer));
    }

    // ---- 纹理 ----

    /// 取一个纹理：先找空闲池中描述符相等的，否则新建
    pub fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<Texture> {
        if let Some(mut texture) = self.pools.take_texture(descriptor) {
            texture.descriptor.name = descriptor.name.clone();
            self.released.remove(&texture.handle);
            self.stats.texture_pool_hits += 1;
            tracing::debug!(texture = %descriptor.name, size = ?descriptor.size, "Texture reused from pool");
            return Ok(texture);
        }

        let NativeTexture { handle, view } = self.native.create_texture(descriptor)?;
        let mut texture = Texture {
            handle,
            view,
            descriptor: descriptor.clone(),
            resource_view: INVALID_RESOURCE_INDEX,
            mip_levels: descriptor.mip_levels(),
            drawable_index: None,
        };
        if descriptor.needs_resource_view() {
            texture.resource_view = self.create_resource_view(ViewResource::Texture(&texture));
        }
        self.stats.textures_allocated += 1;
        tracing::debug!(
            texture = %descriptor.name,
            size = ?descriptor.size,
            format = ?descriptor.format,
            mip_levels = texture.mip_levels,
            "Texture allocated"
        );
        Ok(texture)
    }

    /// 归还纹理：延迟放回空闲纹理池
    ///
    /// # Panics
    ///
    /// 同一纹理在被重新取出前释放两次时 panic。
    pub fn release_texture(&mut self, texture: Texture) {
        if texture.is_backbuffer() {
            gfx_warn!(texture = ?texture.handle, "Ignoring release of a swapchain image");
            return;
        }
        self.mark_released(texture.handle, "texture");
        self.add_pooled_object(PooledObject::TextureToPool(texture));
    }

    /// 延迟销毁原生纹理，不经过空闲池
    pub fn dispose_texture(&mut self, texture: Texture) {
        if texture.is_backbuffer() {
            gfx_warn!(texture = ?texture.handle, "Ignoring disposal of a swapchain image");
            return;
        }
        self.mark_released(texture.handle, "texture");
        self.add_pooled_object(PooledObject::Texture(texture));
    }

    fn mark_released(&mut self, handle: NativeHandle, kind: &str) {
        if !self.released.insert(handle) {
            gfx_fatal!("{} {:?} released twice", kind, handle);
        }
    }

    // ---- 资源视图 ----

    /// 为资源分配着色器可见槽位并写入描述符表
    ///
    /// # Panics
    ///
    /// 槽位表已满时 panic。
    pub fn create_resource_view(&mut self, resource: ViewResource<'_>) -> ShaderResourceIndex {
        let (slot, _offset) = self.descriptors.allocate();
        self.native.write_resource_view(slot, resource);
        slot
    }

    pub fn release_resource_view(&mut self, slot: ShaderResourceIndex) {
        self.add_pooled_object(PooledObject::View(slot));
    }

    /// 即时模式 UI 用的纹理 id
    pub fn im_texture_id(&self, texture: &Texture) -> ImTextureId {
        self.native.im_texture_id(texture)
    }

    // ---- 着色器 ----

    /// 登记一个着色器清单项（覆盖同名项，已缓存的着色器不受影响）
    pub fn register_shader(&mut self, entry: ShaderEntry) {
        self.shader_library.insert(entry);
    }

    pub fn shader_library(&self) -> &ShaderLibrary {
        &self.shader_library
    }

    /// 按入口点取着色器，首次请求时加载字节码并创建原生对象
    pub fn create_shader(&mut self, entry_point: &str, stage: ShaderStage) -> Result<Shader> {
        if let Some(shader) = self.shaders.get(entry_point) {
            if shader.stage != stage {
                return Err(GraphicsError::ShaderCompilation(format!(
                    "'{}' is a {} shader, requested as {}",
                    entry_point,
                    shader.stage.name(),
                    stage.name()
                ))
                .into());
            }
            return Ok(shader.clone());
        }

        let entry = self.shader_library.get(entry_point).cloned().ok_or_else(|| {
            GraphicsError::ShaderCompilation(format!("no shader named '{}' in the library", entry_point))
        })?;
        if entry.stage != stage {
            return Err(GraphicsError::ShaderCompilation(format!(
                "'{}' is declared as {} but requested as {}",
                entry_point,
                entry.stage.name(),
                stage.name()
            ))
            .into());
        }

        let bytecode = self.shader_library.load_bytecode(&entry)?;
        let handle = self.native.create_shader(&entry, &bytecode)?;
        let shader = Shader {
            handle,
            entry_point: entry.entry_point.clone(),
            stage,
            reflection: Arc::new(entry.reflection()),
        };
        self.stats.shaders_created += 1;
        tracing::debug!(shader = entry_point, stage = stage.name(), bytes = bytecode.len(), "Shader created");

        self.shaders.insert(entry.entry_point, shader.clone());
        Ok(shader)
    }

    // ---- 资源状态 ----

    /// 请求状态转换，需要屏障时返回
    pub fn transition(&mut self, resource: NativeHandle, state: ResourceState) -> Option<Barrier> {
        self.states.transition(resource, state)
    }

    /// 直接改写缓存（后端已在命令中隐式完成转换时）
    pub fn set_resource_state(&mut self, resource: NativeHandle, state: ResourceState) {
        self.states.set_state(resource, state);
    }

    // ---- 延迟销毁 ----

    /// 把释放请求放入当前帧的队列
    pub fn add_pooled_object(&mut self, object: PooledObject) {
        tracing::trace!(frame = self.frame_index, object = ?object, "Pooled object queued");
        self.queues.push(self.frame_index, object);
    }

    pub fn pending_pooled_objects(&self, frame: u32) -> usize {
        self.queues.len(frame)
    }

    /// 执行槽位 `frame` 的全部释放请求
    ///
    /// 调用者负责先等待该槽位的栅栏。
    pub fn destroy_pooled_objects_for_frame(&mut self, frame: u32) {
        let objects = self.queues.take(frame);
        if objects.is_empty() {
            return;
        }
        let count = objects.len();
        let mut ctx = PoolContext {
            native: self.native.as_mut(),
            pools: &mut self.pools,
            descriptors: &mut self.descriptors,
            states: &mut self.states,
            released: &mut self.released,
            stats: &mut self.stats,
        };
        for object in objects {
            object.execute(&mut ctx);
        }
        tracing::trace!(frame, count, "Pooled objects destroyed");
    }

    /// 按槽位顺序执行所有释放请求，之后把空闲堆池按大小升序排列
    ///
    /// 调用者负责先让设备空闲。
    pub fn destroy_pooled_objects(&mut self) {
        let _span = span_trace!("destroy_pooled_objects").entered();
        for frame in 0..self.queues.frames() {
            self.destroy_pooled_objects_for_frame(frame);
        }
        self.pools.sort_heaps();
    }

    /// 销毁空闲纹理池中的全部纹理
    ///
    /// 尺寸变化后池里的渲染目标不会再被命中，在调整尺寸前调用。
    pub fn destroy_size_dependent_resources(&mut self) -> Result<()> {
        self.native.wait_idle()?;
        self.destroy_pooled_objects();

        let textures = self.pools.drain_textures();
        let count = textures.len();
        for texture in textures {
            self.execute_now(PooledObject::Texture(texture));
        }
        tracing::debug!(count, "Size dependent resources destroyed");
        Ok(())
    }

    /// 立即执行一个释放请求，调用者保证 GPU 不再引用该对象
    fn execute_now(&mut self, object: PooledObject) {
        let mut ctx = PoolContext {
            native: self.native.as_mut(),
            pools: &mut self.pools,
            descriptors: &mut self.descriptors,
            states: &mut self.states,
            released: &mut self.released,
            stats: &mut self.stats,
        };
        object.execute(&mut ctx);
    }

    // ---- 命令列表 ----

    /// 从当前帧的命令池取一条命令列表
    ///
    /// 先等待该槽位上一次提交，之后才能重置它的命令池。
    pub(crate) fn acquire_command_list(&mut self) -> Result<NativeHandle> {
        let frame = self.frame_index;
        self.frame_fences.wait(self.native.as_mut(), frame)?;
        let (list, created) = self.command_pools[frame as usize].acquire(self.native.as_mut(), frame)?;
        if created {
            self.stats.command_lists_created += 1;
        }
        Ok(list)
    }

    // ---- 交换链 ----

    /// 本帧已获取的可绘制对象
    pub fn current_backbuffer(&self) -> Option<Texture> {
        self.swapchain.current().cloned()
    }

    /// 获取本帧的可绘制对象
    ///
    /// 先等待当前槽位的上一次提交。表面过期时原地重建交换链并重试一次。
    /// 同一帧内重复调用返回同一个对象。
    pub fn acquire_next_drawable(&mut self) -> Result<Texture> {
        let frame = self.frame_index;
        self.frame_fences.wait(self.native.as_mut(), frame)?;

        for _ in 0..2 {
            match self.swapchain.acquire(self.native.as_mut(), frame)? {
                AcquireStatus::Acquired(_) => {
                    if let Some(drawable) = self.swapchain.current() {
                        return Ok(drawable.clone());
                    }
                }
                AcquireStatus::OutOfDate => self.recreate_swapchain()?,
            }
        }
        Err(GraphicsError::SwapchainError("swapchain is still out of date after recreation".to_string()).into())
    }

    /// 以纹理形式导入当前后备缓冲
    pub fn import_backbuffer(&mut self) -> Result<Texture> {
        self.acquire_next_drawable()
    }

    /// 提交命令缓冲区、呈现本帧获取的图像，并推进帧索引
    pub fn present(&mut self, cmd: &mut CommandBuffer) -> Result<FenceValue> {
        let frame = self.frame_index;
        let sync = self.swapchain.current_index().map(|image_index| PresentSync {
            swapchain: self.swapchain.handle(),
            image_index,
            frame,
        });

        let fence = cmd.submit(self, sync)?;
        self.frame_fences.record(frame, fence);

        if sync.is_some() {
            match self.swapchain.present(self.native.as_mut(), frame)? {
                PresentStatus::Presented => {}
                PresentStatus::OutOfDate => self.recreate_swapchain()?,
            }
        }
        self.swapchain.clear_current();

        let next = (frame + 1) % self.frames_in_flight();
        self.frame_index = next;
        self.command_pools[next as usize].mark_for_reset();
        tracing::trace!(frame, next, value = fence.value.value(), "Frame presented");
        Ok(fence.value)
    }

    /// 应用新的渲染器配置，重建交换链
    pub fn configure(&mut self, config: RendererConfig) -> Result<()> {
        self.renderer_config = config;
        self.rebuild_swapchain(self.requested_size)
    }

    /// 窗口尺寸变化，任一边为 0（最小化）时忽略
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            tracing::debug!(width, height, "Ignoring resize to an empty surface");
            return Ok(());
        }
        self.requested_size = Size::new(width, height);
        self.rebuild_swapchain(self.requested_size)
    }

    /// 完整重建：设备空闲、清空延迟队列与状态缓存、按新的在途帧数重建每帧结构
    ///
    /// 只能在帧之间调用。
    fn rebuild_swapchain(&mut self, size: Size) -> Result<()> {
        self.native.wait_idle()?;
        self.destroy_pooled_objects();
        self.states.clear();
        self.frame_fences.clear();

        self.swapchain
            .configure(self.native.as_mut(), &self.renderer_config, size)?;

        let frames = self.swapchain.frames_in_flight();
        self.resize_frame_slots(frames);
        self.frame_index = 0;

        let drawable = self.swapchain.size();
        self.events
            .publish(RendererResizeEvent::new(drawable.width, drawable.height, frames));
        Ok(())
    }

    fn resize_frame_slots(&mut self, frames: u32) {
        self.queues.resize(frames);
        self.frame_fences.resize(frames);

        while self.command_pools.len() > frames as usize {
            let frame = self.command_pools.len() as u32 - 1;
            if let Some(mut pool) = self.command_pools.pop() {
                for list in pool.drain() {
                    self.execute_now(PooledObject::CommandList { frame, list });
                }
            }
        }
        while self.command_pools.len() < frames as usize {
            self.command_pools.push(CommandPool::new());
        }
        self.command_pools.iter_mut().for_each(CommandPool::mark_for_reset);
    }

    /// 表面过期时原地重建交换链
    ///
    /// 帧中也可能发生（获取图像时），因此不动帧索引、命令池与延迟队列。
    fn recreate_swapchain(&mut self) -> Result<()> {
        self.native.wait_idle()?;
        for drawable in self.swapchain.drawables() {
            self.states.forget(drawable.handle);
        }
        self.swapchain.recreate(self.native.as_mut(), self.requested_size)?;

        let size = self.swapchain.size();
        self.requested_size = size;
        gfx_info!(width = size.width, height = size.height, "Swapchain recreated after surface change");
        self.events
            .publish(RendererResizeEvent::new(size.width, size.height, self.frames_in_flight()));
        Ok(())
    }

    /// 等待所有在途工作
    pub fn wait_idle(&mut self) -> Result<()> {
        self.native.wait_idle()
    }

    // ---- 关闭 ----

    /// 等待设备空闲并销毁本层持有的全部原生对象
    ///
    /// 命令缓冲区需要在此之前交回（`CommandBuffer::destroy`）。
    pub fn shutdown(&mut self) -> Result<()> {
        if self.is_shut_down {
            return Ok(());
        }
        self.native.wait_idle()?;
        self.destroy_pooled_objects();

        for heap in self.pools.drain_heaps() {
            self.native.free_heap(heap.handle());
            self.stats.heaps_freed += 1;
        }
        for texture in self.pools.drain_textures() {
            self.execute_now(PooledObject::Texture(texture));
        }
        let shaders: Vec<NativeHandle> = self.shaders.drain().map(|(_, shader)| shader.handle).collect();
        for shader in shaders {
            self.execute_now(PooledObject::Shader(shader));
        }
        let lists: Vec<(u32, NativeHandle)> = self
            .command_pools
            .iter_mut()
            .enumerate()
            .flat_map(|(frame, pool)| pool.drain().into_iter().map(move |list| (frame as u32, list)))
            .collect();
        for (frame, list) in lists {
            self.execute_now(PooledObject::CommandList { frame, list });
        }
        self.swapchain.destroy(self.native.as_mut());
        self.frame_fences.clear();
        self.states.clear();
        self.descriptors.reset();
        self.is_shut_down = true;

        gfx_info!(
            heaps_allocated = self.stats.heaps_allocated,
            textures_allocated = self.stats.textures_allocated,
            heap_pool_hits = self.stats.heap_pool_hits,
            texture_pool_hits = self.stats.texture_pool_hits,
            "Graphics device shut down"
        );
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            gfx_error!(error = %e, "Graphics device shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::{GpuController, HeadlessDevice};
    use crate::renderer::resource::{TextureFormat, TextureUsage};
    use crate::renderer::shader::BindingKind;

    fn device() -> (GraphicsDevice, GpuController) {
        let config = DeviceConfig {
            drawable_size: (320, 240),
            descriptor_capacity: 64,
            ..DeviceConfig::headless()
        };
        let (native, controller) = HeadlessDevice::new(&config.headless, Size::new(320, 240));
        let device = GraphicsDevice::with_native(&config, Box::new(native)).unwrap();
        (device, controller)
    }

    #[test]
    fn test_create_reports_frames_and_size() {
        let (device, _) = device();
        assert_eq!(device.backend_kind(), GraphicsBackend::Headless);
        assert_eq!(device.frames_in_flight(), 3);
        assert_eq!(device.frame_index(), 0);
        assert_eq!(device.last_frame_index(), 2);
        assert_eq!(device.drawable_size(), Size::new(320, 240));
    }

    #[test]
    fn test_manual_execution_needs_controller() {
        let mut config = DeviceConfig::headless();
        config.headless.execution = GpuExecution::Manual;
        assert!(GraphicsDevice::create(&config, None).is_err());
    }

    #[test]
    fn test_heap_pool_reuses_native_allocation() {
        let (mut device, controller) = device();
        let heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 1 << 20)).unwrap();
        let handle = heap.handle();
        device.release_heap(heap);
        device.destroy_pooled_objects_for_frame(0);

        let heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        assert_eq!(heap.handle(), handle);
        assert_eq!(heap.stack_ptr(), 0);
        assert_eq!(controller.counters().heap_allocations, 1);

        // 内存类型不同不会命中
        let cpu = device.create_heap(&HeapDescriptor::new(MemoryType::Cpu, 4096)).unwrap();
        assert_ne!(cpu.handle(), handle);
        let stats = device.allocation_stats();
        assert_eq!(stats.heaps_allocated, 2);
        assert_eq!(stats.heap_pool_hits, 1);
    }

    #[test]
    fn test_released_heap_is_rewound() {
        let (mut device, _) = device();
        let mut heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        let buffer = device.create_buffer(&mut heap, &BufferDescriptor::new(1000, BufferUsage::Storage)).unwrap();
        assert!(heap.stack_ptr() >= 1000);
        device.release_buffer(buffer);
        device.release_heap(heap);
        device.destroy_pooled_objects_for_frame(0);

        assert_eq!(device.free_pools().heap_count(), 1);
        let heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        assert_eq!(heap.stack_ptr(), 0);
    }

    #[test]
    fn test_texture_pool_reuse() {
        let (mut device, controller) = device();
        let descriptor = TextureDescriptor::texture_2d(512, 512, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED);
        let texture = device.create_texture(&descriptor).unwrap();
        assert!(texture.resource_view().is_valid());
        let handle = texture.handle();
        let slot = texture.resource_view();
        device.release_texture(texture);
        device.destroy_pooled_objects_for_frame(0);

        let texture = device.create_texture(&descriptor.clone().with_name("again")).unwrap();
        assert_eq!(texture.handle(), handle);
        assert_eq!(texture.resource_view(), slot);
        assert_eq!(texture.descriptor().name, "again");
        assert_eq!(controller.counters().texture_creations, 1);
        assert_eq!(device.allocation_stats().texture_pool_hits, 1);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_texture_released_twice_is_fatal() {
        let (mut device, _) = device();
        let descriptor = TextureDescriptor::texture_2d(512, 512, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED);
        let texture = device.create_texture(&descriptor).unwrap();
        device.release_texture(texture.clone());
        device.release_texture(texture);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_pooled_texture_released_again_is_fatal() {
        let (mut device, _) = device();
        let descriptor = TextureDescriptor::texture_2d(64, 64, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED);
        let texture = device.create_texture(&descriptor).unwrap();
        device.release_texture(texture.clone());
        device.destroy_pooled_objects_for_frame(0);
        // 已在空闲池中，旧副本再次释放
        device.dispose_texture(texture);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_buffer_released_twice_is_fatal() {
        let (mut device, _) = device();
        let mut cpu = device.create_heap(&HeapDescriptor::new(MemoryType::Cpu, 4096)).unwrap();
        let buffer = device.create_buffer(&mut cpu, &BufferDescriptor::new(64, BufferUsage::Staging)).unwrap();
        device.release_buffer(buffer.clone());
        device.release_buffer(buffer);
    }

    #[test]
    fn test_reused_texture_can_be_released_again() {
        let (mut device, _) = device();
        let descriptor = TextureDescriptor::texture_2d(64, 64, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED);
        let texture = device.create_texture(&descriptor).unwrap();
        device.release_texture(texture);
        device.destroy_pooled_objects_for_frame(0);

        let first = device.create_texture(&descriptor).unwrap();
        let second = device.create_texture(&descriptor).unwrap();
        assert_ne!(first.handle(), second.handle());
        device.release_texture(first);
        device.dispose_texture(second);
        device.destroy_pooled_objects_for_frame(0);
        assert_eq!(device.free_pools().texture_count(), 1);
    }

    #[test]
    fn test_depth_texture_has_no_view() {
        let (mut device, _) = device();
        let depth = device
            .create_texture(&TextureDescriptor::texture_2d(64, 64, TextureFormat::D32_SFloat, TextureUsage::ATTACHMENT))
            .unwrap();
        assert!(!depth.resource_view().is_valid());
        assert_eq!(device.descriptors().allocator().len(), 0);
    }

    #[test]
    fn test_buffer_views_follow_heap_type() {
        let (mut device, _) = device();
        let mut gpu = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        let mut cpu = device.create_heap(&HeapDescriptor::new(MemoryType::Cpu, 4096)).unwrap();

        let storage = device.create_buffer(&mut gpu, &BufferDescriptor::new(64, BufferUsage::Storage)).unwrap();
        let upload = device.create_buffer(&mut cpu, &BufferDescriptor::new(64, BufferUsage::Storage)).unwrap();
        assert!(storage.resource_view().is_valid());
        assert!(!upload.resource_view().is_valid());
        assert_eq!(storage.heap(), gpu.handle());
        assert_eq!(device.memory_requirements(storage.descriptor()).alignment, 256);

        device.release_buffer(storage);
        assert_eq!(device.descriptors().allocator().len(), 1);
        device.destroy_pooled_objects_for_frame(0);
        assert_eq!(device.descriptors().allocator().len(), 0);
    }

    #[test]
    fn test_pooled_objects_wait_for_their_frame() {
        let (mut device, _) = device();
        let ran = std::rc::Rc::new(std::cell::Cell::new(0));
        for _ in 0..4 {
            let ran = ran.clone();
            device.add_pooled_object(PooledObject::custom(move |_| ran.set(ran.get() + 1)));
        }
        assert_eq!(device.pending_pooled_objects(0), 4);

        device.destroy_pooled_objects_for_frame(1);
        device.destroy_pooled_objects_for_frame(2);
        assert_eq!(ran.get(), 0);

        device.destroy_pooled_objects_for_frame(0);
        assert_eq!(ran.get(), 4);
        device.destroy_pooled_objects_for_frame(0);
        assert_eq!(ran.get(), 4);
    }

    #[test]
    fn test_full_flush_sorts_heap_pool() {
        let (mut device, _) = device();
        for size in [8192u64, 1024, 4096] {
            let heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, size)).unwrap();
            device.release_heap(heap);
        }
        device.destroy_pooled_objects();
        assert_eq!(device.free_pools().heap_sizes(), vec![1024, 4096, 8192]);
    }

    #[test]
    fn test_shader_cache() {
        let (mut device, controller) = device();
        device.register_shader(
            ShaderEntry::new("forwardVertex", ShaderStage::Vertex).with_binding(0, 0, BindingKind::StorageBuffer),
        );

        let a = device.create_shader("forwardVertex", ShaderStage::Vertex).unwrap();
        let b = device.create_shader("forwardVertex", ShaderStage::Vertex).unwrap();
        assert_eq!(a, b);
        assert_eq!(controller.counters().shader_creations, 1);
        assert_eq!(a.reflection().resolve(0).map(|b| b.kind), Some(BindingKind::StorageBuffer));

        assert!(device.create_shader("forwardVertex", ShaderStage::Fragment).is_err());
        assert!(device.create_shader("missing", ShaderStage::Vertex).is_err());
    }

    #[test]
    fn test_backbuffer_release_is_ignored() {
        let (mut device, _) = device();
        let backbuffer = device.import_backbuffer().unwrap();
        assert!(backbuffer.is_backbuffer());
        device.release_texture(backbuffer.clone());
        assert_eq!(device.pending_pooled_objects(0), 0);
        // 同一帧内重复获取返回同一张图像
        assert_eq!(device.import_backbuffer().unwrap(), backbuffer);
    }

    #[test]
    fn test_resize_ignores_empty_surface() {
        let (mut device, controller) = device();
        device.resize(0, 480).unwrap();
        assert_eq!(controller.counters().swapchain_creations, 1);
        assert_eq!(device.drawable_size(), Size::new(320, 240));
    }

    #[test]
    fn test_shaders_and_command_lists_are_destroyed_through_pool_requests() {
        let (mut device, _) = device();
        device.register_shader(ShaderEntry::new("blitVertex", ShaderStage::Vertex));
        device.create_shader("blitVertex", ShaderStage::Vertex).unwrap();
        device.acquire_command_list().unwrap();

        // 关闭三缓冲后槽位 2 的命令池被丢弃
        device
            .configure(RendererConfig {
                triple_buffering_enabled: false,
                ..RendererConfig::default()
            })
            .unwrap();
        assert_eq!(device.frames_in_flight(), 2);
        device.acquire_command_list().unwrap();

        device.shutdown().unwrap();
        let stats = device.allocation_stats();
        assert_eq!(stats.shaders_destroyed, 1);
        assert_eq!(stats.command_lists_destroyed, stats.command_lists_created);
    }

    #[test]
    fn test_shutdown_frees_pools() {
        let (mut device, controller) = device();
        let heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        device.release_heap(heap);
        let texture = device
            .create_texture(&TextureDescriptor::texture_2d(8, 8, TextureFormat::R8_UNorm, TextureUsage::SAMPLED))
            .unwrap();
        device.release_texture(texture);

        device.shutdown().unwrap();
        assert!(device.is_shut_down());
        let counters = controller.counters();
        assert_eq!(counters.heap_frees, 1);
        assert_eq!(counters.texture_destructions, 1);
        // 第二次关闭无事可做
        device.shutdown().unwrap();
    }
}
