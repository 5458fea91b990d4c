//! Headless 后端
//!
//! 在进程内模拟一块 GPU：对象只是带 id 的记录，命令列表只记录命令名，
//! 提交进入一条模拟的 GPU 时间线。时间线与 [`GpuController`] 共享，
//! 测试可以借此精确控制"GPU 何时完成"。
//!
//! # 执行模型
//!
//! | 模式 | 提交的工作何时完成 |
//! |------|-------------------|
//! | `Immediate` | 提交时 |
//! | `OnWait` | CPU 等待其栅栏时（按提交顺序完成到该值为止） |
//! | `Manual` | `GpuController` 显式推进时；CPU 等待会阻塞 |
//!
//! 所有原生分配都被计数，测试用它验证池复用没有产生新的分配。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::backend::{
    AcquireStatus, BackendInfo, NativeCommand, NativeDevice, NativeSwapchain, NativeTexture,
    PresentMode, PresentStatus, Submission, SurfaceCapabilities, SwapchainDescriptor, ViewResource,
};
use crate::core::config::{GpuExecution, GraphicsBackend, HeadlessConfig};
use crate::core::error::{DistGfxError, GraphicsError, Result};
use crate::renderer::heap::align_up;
use crate::renderer::resource::{
    BufferDescriptor, BufferUsage, HeapDescriptor, ImTextureId, MemoryRequirements, MemoryType, NativeHandle,
    ShaderResourceIndex, Size, Texture, TextureDescriptor, TextureFormat,
};
use crate::renderer::shader::ShaderEntry;
use crate::renderer::transition::TransitionPolicy;

const DESCRIPTOR_STRIDE: u64 = 32;
const BUFFER_ALIGNMENT: u64 = 256;
const CONSTANT_ALIGNMENT: u64 = 256;

/// 原生调用计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessCounters {
    pub heap_allocations: u64,
    pub heap_frees: u64,
    pub buffer_creations: u64,
    pub buffer_destructions: u64,
    pub texture_creations: u64,
    pub texture_destructions: u64,
    pub shader_creations: u64,
    pub command_list_creations: u64,
    pub command_pool_resets: u64,
    pub submissions: u64,
    pub presents: u64,
    pub swapchain_creations: u64,
    pub barriers: u64,
    pub draws: u64,
    pub texture_uploads: u64,
}

#[derive(Debug)]
struct PendingWork {
    fence: NativeHandle,
    value: u64,
}

#[derive(Debug)]
struct SharedState {
    pending: VecDeque<PendingWork>,
    fences: HashMap<NativeHandle, u64>,
    counters: HeadlessCounters,
    commands: Vec<&'static str>,
    surface_extent: Size,
    surface_out_of_date: bool,
}

impl SharedState {
    fn complete_front(&mut self) -> bool {
        let Some(work) = self.pending.pop_front() else {
            return false;
        };
        let completed = self.fences.entry(work.fence).or_insert(0);
        *completed = (*completed).max(work.value);
        true
    }

    fn completed(&self, fence: NativeHandle) -> u64 {
        self.fences.get(&fence).copied().unwrap_or(0)
    }

    fn is_pending(&self, fence: NativeHandle, value: u64) -> bool {
        self.pending.iter().any(|work| work.fence == fence && work.value >= value)
    }
}

#[derive(Debug)]
struct Timeline {
    state: Mutex<SharedState>,
    signal: Condvar,
}

/// 从测试线程驱动模拟 GPU
#[derive(Debug, Clone)]
pub struct GpuController {
    timeline: Arc<Timeline>,
}

impl GpuController {
    /// 完成最早的一次提交，没有待完成工作时返回 `false`
    pub fn complete_next(&self) -> bool {
        let mut state = self.timeline.state.lock();
        let completed = state.complete_front();
        self.timeline.signal.notify_all();
        completed
    }

    /// 完成所有待完成的提交，返回完成数
    pub fn complete_all(&self) -> usize {
        let mut state = self.timeline.state.lock();
        let mut count = 0;
        while state.complete_front() {
            count += 1;
        }
        self.timeline.signal.notify_all();
        count
    }

    pub fn pending(&self) -> usize {
        self.timeline.state.lock().pending.len()
    }

    /// 等待直到至少有 `count` 个待完成提交，超时返回 `false`
    pub fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        let mut state = self.timeline.state.lock();
        while state.pending.len() < count {
            if self.timeline.signal.wait_for(&mut state, timeout).timed_out() {
                return state.pending.len() >= count;
            }
        }
        true
    }

    pub fn completed_value(&self, fence: NativeHandle) -> u64 {
        self.timeline.state.lock().completed(fence)
    }

    pub fn counters(&self) -> HeadlessCounters {
        self.timeline.state.lock().counters
    }

    /// 取出自上次调用以来录制的命令名
    pub fn take_commands(&self) -> Vec<&'static str> {
        std::mem::take(&mut self.timeline.state.lock().commands)
    }

    /// 模拟窗口尺寸变化：下一次获取图像返回 `OutOfDate`
    pub fn resize_surface(&self, width: u32, height: u32) {
        let mut state = self.timeline.state.lock();
        state.surface_extent = Size::new(width, height);
        state.surface_out_of_date = true;
    }
}

#[derive(Debug)]
struct HeadlessHeap {
    descriptor: HeapDescriptor,
    /// CPU 可见的堆才有内存
    memory: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct HeadlessBuffer {
    heap: NativeHandle,
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
struct HeadlessList {
    frame: u32,
    state: ListState,
}

#[derive(Debug)]
struct HeadlessSwapchain {
    images: Vec<NativeTexture>,
    next_image: u32,
}

/// 模拟 GPU 设备
#[derive(Debug)]
pub struct HeadlessDevice {
    info: BackendInfo,
    execution: GpuExecution,
    min_image_count: u32,
    max_image_count: u32,
    timeline: Arc<Timeline>,
    next_id: u64,
    heaps: HashMap<NativeHandle, HeadlessHeap>,
    buffers: HashMap<NativeHandle, HeadlessBuffer>,
    textures: HashMap<NativeHandle, TextureDescriptor>,
    shaders: HashMap<NativeHandle, String>,
    lists: HashMap<NativeHandle, HeadlessList>,
    views: HashMap<u32, NativeHandle>,
    swapchains: HashMap<NativeHandle, HeadlessSwapchain>,
}

impl HeadlessDevice {
    pub fn new(config: &HeadlessConfig, surface_extent: Size) -> (Self, GpuController) {
        let timeline = Arc::new(Timeline {
            state: Mutex::new(SharedState {
                pending: VecDeque::new(),
                fences: HashMap::new(),
                counters: HeadlessCounters::default(),
                commands: Vec::new(),
                surface_extent,
                surface_out_of_date: false,
            }),
            signal: Condvar::new(),
        });

        let device = Self {
            info: BackendInfo {
                kind: GraphicsBackend::Headless,
                device_name: "Headless".to_string(),
                descriptor_stride: DESCRIPTOR_STRIDE,
                transition_policy: TransitionPolicy::Exact,
                mipmaps_by_blit: true,
            },
            execution: config.execution,
            min_image_count: config.min_image_count,
            max_image_count: config.max_image_count,
            timeline: timeline.clone(),
            next_id: 0,
            heaps: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            lists: HashMap::new(),
            views: HashMap::new(),
            swapchains: HashMap::new(),
        };

        tracing::debug!(execution = ?config.execution, "Headless device created");
        (device, GpuController { timeline })
    }

    fn allocate_id(&mut self) -> NativeHandle {
        self.next_id += 1;
        NativeHandle(self.next_id)
    }

    fn counters(&self) -> parking_lot::MappedMutexGuard<'_, HeadlessCounters> {
        parking_lot::MutexGuard::map(self.timeline.state.lock(), |state| &mut state.counters)
    }

    /// 读取 CPU 可见缓冲区的内容
    pub fn read_buffer(&self, buffer: NativeHandle) -> Option<Vec<u8>> {
        let record = self.buffers.get(&buffer)?;
        let heap = self.heaps.get(&record.heap)?;
        let start = record.offset as usize;
        let end = start + record.size as usize;
        heap.memory.get(start..end).map(<[u8]>::to_vec)
    }

    /// 资源视图表中 `slot` 指向的资源
    pub fn view_target(&self, slot: ShaderResourceIndex) -> Option<NativeHandle> {
        self.views.get(&slot.index()).copied()
    }

    pub fn live_heaps(&self) -> usize {
        self.heaps.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// 源区域必须整行落在缓冲区内，行距不小于一行像素
    fn check_texture_copy(&self, src: NativeHandle, src_offset: u64, row_pitch: u32, dst: NativeHandle, size: Size) -> Result<()> {
        let buffer = self
            .buffers
            .get(&src)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown buffer {:?}", src)))?;
        let texture = self
            .textures
            .get(&dst)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown texture {:?}", dst)))?;
        if size.width > texture.size.width || size.height > texture.size.height {
            return Err(GraphicsError::CommandExecution(format!(
                "copy of {:?} exceeds texture '{}' of {:?}",
                size, texture.name, texture.size
            ))
            .into());
        }
        let row_bytes = size.width as u64 * texture.format.bytes_per_pixel() as u64;
        let end = src_offset + row_pitch as u64 * (size.height.max(1) as u64 - 1) + row_bytes;
        if (row_pitch as u64) < row_bytes || end > buffer.size {
            return Err(GraphicsError::CommandExecution(format!(
                "texture copy reads [{}, {}) with row pitch {} from a buffer of {} bytes",
                src_offset, end, row_pitch, buffer.size
            ))
            .into());
        }
        Ok(())
    }

    fn list_mut(&mut self, list: NativeHandle) -> Result<&mut HeadlessList> {
        self.lists.get_mut(&list).ok_or_else(|| {
            DistGfxError::Graphics(GraphicsError::CommandExecution(format!("unknown command list {:?}", list)))
        })
    }
}

impl NativeDevice for HeadlessDevice {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn allocate_heap(&mut self, descriptor: &HeapDescriptor) -> Result<NativeHandle> {
        if descriptor.size == 0 {
            return Err(GraphicsError::ResourceCreation(format!("heap '{}' has zero size", descriptor.name)).into());
        }
        let handle = self.allocate_id();
        let memory = if descriptor.memory_type.is_host_visible() {
            vec![0; descriptor.size as usize]
        } else {
            Vec::new()
        };
        self.heaps.insert(handle, HeadlessHeap { descriptor: descriptor.clone(), memory });
        self.counters().heap_allocations += 1;
        Ok(handle)
    }

    fn free_heap(&mut self, heap: NativeHandle) {
        if self.heaps.remove(&heap).is_none() {
            tracing::error!(?heap, "Freeing unknown heap");
            return;
        }
        self.counters().heap_frees += 1;
    }

    fn heap_alignment(&self, _memory_type: MemoryType) -> u64 {
        BUFFER_ALIGNMENT
    }

    fn memory_requirements(&self, descriptor: &BufferDescriptor) -> MemoryRequirements {
        MemoryRequirements {
            size: descriptor.aligned_size(),
            alignment: if descriptor.usage == BufferUsage::Uniform {
                CONSTANT_ALIGNMENT
            } else {
                BUFFER_ALIGNMENT
            },
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
        if offset + descriptor.size > align_up(record.descriptor.size, BUFFER_ALIGNMENT) {
            return Err(GraphicsError::ResourceCreation(format!(
                "buffer '{}' [{}, {}) exceeds heap '{}'",
                descriptor.name,
                offset,
                offset + descriptor.size,
                record.descriptor.name
            ))
            .into());
        }

        let handle = self.allocate_id();
        self.buffers.insert(handle, HeadlessBuffer { heap, offset, size: descriptor.size });
        self.counters().buffer_creations += 1;
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: NativeHandle) {
        if self.buffers.remove(&buffer).is_some() {
            self.counters().buffer_destructions += 1;
        } else {
            tracing::error!(?buffer, "Destroying unknown buffer");
        }
    }

    fn write_buffer(&mut self, buffer: NativeHandle, offset: u64, data: &[u8]) -> Result<()> {
        let record = *self.buffers.get(&buffer).ok_or_else(|| {
            DistGfxError::Graphics(GraphicsError::CommandExecution(format!("unknown buffer {:?}", buffer)))
        })?;
        if offset + data.len() as u64 > record.size {
            return Err(GraphicsError::CommandExecution(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                record.size
            ))
            .into());
        }
        let heap = self.heaps.get_mut(&record.heap).ok_or_else(|| {
            DistGfxError::Graphics(GraphicsError::CommandExecution("buffer outlived its heap".to_string()))
        })?;
        if heap.memory.is_empty() {
            return Err(GraphicsError::CommandExecution(format!(
                "heap '{}' is not host visible",
                heap.descriptor.name
            ))
            .into());
        }
        let start = (record.offset + offset) as usize;
        heap.memory[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<NativeTexture> {
        if descriptor.size.is_empty() {
            return Err(GraphicsError::ResourceCreation(format!("texture '{}' has zero size", descriptor.name)).into());
        }
        let handle = self.allocate_id();
        let view = self.allocate_id();
        self.textures.insert(handle, descriptor.clone());
        self.counters().texture_creations += 1;
        Ok(NativeTexture { handle, view })
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        if self.textures.remove(&texture.handle).is_some() {
            self.counters().texture_destructions += 1;
        } else {
            tracing::error!(texture = ?texture.handle, "Destroying unknown texture");
        }
    }

    fn write_resource_view(&mut self, slot: ShaderResourceIndex, resource: ViewResource<'_>) {
        let handle = match resource {
            ViewResource::Buffer(buffer) => buffer.handle(),
            ViewResource::Texture(texture) => texture.handle(),
        };
        self.views.insert(slot.index(), handle);
    }

    fn im_texture_id(&self, texture: &Texture) -> ImTextureId {
        ImTextureId(texture.resource_view().index() as u64)
    }

    fn create_shader(&mut self, entry: &ShaderEntry, _bytecode: &[u8]) -> Result<NativeHandle> {
        let handle = self.allocate_id();
        self.shaders.insert(handle, entry.entry_point.clone());
        self.counters().shader_creations += 1;
        Ok(handle)
    }

    fn destroy_shader(&mut self, shader: NativeHandle) {
        self.shaders.remove(&shader);
    }

    fn create_command_list(&mut self, frame: u32) -> Result<NativeHandle> {
        let handle = self.allocate_id();
        self.lists.insert(handle, HeadlessList { frame, state: ListState::Initial });
        self.counters().command_list_creations += 1;
        Ok(handle)
    }

    fn reset_command_pool(&mut self, frame: u32) -> Result<()> {
        for list in self.lists.values_mut().filter(|list| list.frame == frame) {
            list.state = ListState::Initial;
        }
        self.counters().command_pool_resets += 1;
        Ok(())
    }

    fn destroy_command_list(&mut self, _frame: u32, list: NativeHandle) {
        self.lists.remove(&list);
    }

    fn begin_command_list(&mut self, list: NativeHandle) -> Result<()> {
        let record = self.list_mut(list)?;
        if record.state == ListState::Recording {
            return Err(GraphicsError::CommandExecution(format!("command list {:?} is already recording", list)).into());
        }
        record.state = ListState::Recording;
        Ok(())
    }

    fn record(&mut self, list: NativeHandle, command: NativeCommand<'_>) -> Result<()> {
        if self.list_mut(list)?.state != ListState::Recording {
            return Err(GraphicsError::CommandExecution(format!(
                "'{}' recorded into command list {:?} outside begin/end",
                command.name(),
                list
            ))
            .into());
        }

        if let NativeCommand::CopyBufferToTexture {
            src,
            src_offset,
            row_pitch,
            dst,
            size,
        } = command
        {
            self.check_texture_copy(src, src_offset, row_pitch, dst, size)?;
        }

        let mut state = self.timeline.state.lock();
        match command {
            NativeCommand::Barriers(barriers) => state.counters.barriers += barriers.len() as u64,
            NativeCommand::Draw { .. } | NativeCommand::DrawIndexed { .. } => state.counters.draws += 1,
            NativeCommand::CopyBufferToTexture { .. } => state.counters.texture_uploads += 1,
            _ => {}
        }
        state.commands.push(command.name());
        Ok(())
    }

    fn end_command_list(&mut self, list: NativeHandle) -> Result<()> {
        let record = self.list_mut(list)?;
        if record.state != ListState::Recording {
            return Err(GraphicsError::CommandExecution(format!("command list {:?} is not recording", list)).into());
        }
        record.state = ListState::Executable;
        Ok(())
    }

    fn create_fence(&mut self) -> Result<NativeHandle> {
        let handle = self.allocate_id();
        self.timeline.state.lock().fences.insert(handle, 0);
        Ok(handle)
    }

    fn destroy_fence(&mut self, fence: NativeHandle) {
        self.timeline.state.lock().fences.remove(&fence);
    }

    fn submit(&mut self, submission: &Submission) -> Result<()> {
        if self.list_mut(submission.command_list)?.state != ListState::Executable {
            return Err(GraphicsError::CommandExecution(format!(
                "command list {:?} submitted before being closed",
                submission.command_list
            ))
            .into());
        }

        let mut state = self.timeline.state.lock();
        state.counters.submissions += 1;
        state.pending.push_back(PendingWork {
            fence: submission.fence,
            value: submission.signal_value,
        });
        if self.execution == GpuExecution::Immediate {
            while state.complete_front() {}
        }
        self.timeline.signal.notify_all();
        Ok(())
    }

    fn completed_value(&self, fence: NativeHandle) -> u64 {
        self.timeline.state.lock().completed(fence)
    }

    fn wait_fence(&mut self, fence: NativeHandle, value: u64) -> Result<()> {
        let mut state = self.timeline.state.lock();
        loop {
            if state.completed(fence) >= value {
                return Ok(());
            }
            if !state.is_pending(fence, value) {
                return Err(GraphicsError::DeviceLost(format!(
                    "waiting for value {} on fence {:?} that was never submitted",
                    value, fence
                ))
                .into());
            }
            match self.execution {
                GpuExecution::Immediate | GpuExecution::OnWait => {
                    state.complete_front();
                }
                GpuExecution::Manual => self.timeline.signal.wait(&mut state),
            }
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        let mut state = self.timeline.state.lock();
        while !state.pending.is_empty() {
            match self.execution {
                GpuExecution::Immediate | GpuExecution::OnWait => {
                    state.complete_front();
                }
                GpuExecution::Manual => self.timeline.signal.wait(&mut state),
            }
        }
        Ok(())
    }

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities> {
        let extent = self.timeline.state.lock().surface_extent;
        Ok(SurfaceCapabilities {
            min_image_count: self.min_image_count,
            max_image_count: self.max_image_count,
            formats: vec![TextureFormat::B8G8R8A8_UNorm, TextureFormat::R8G8B8A8_UNorm],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate],
            current_extent: Some(extent),
        })
    }

    fn create_swapchain(&mut self, descriptor: &SwapchainDescriptor) -> Result<NativeSwapchain> {
        let handle = self.allocate_id();
        let images: Vec<NativeTexture> = (0..descriptor.image_count)
            .map(|_| NativeTexture {
                handle: self.allocate_id(),
                view: self.allocate_id(),
            })
            .collect();
        self.swapchains.insert(handle, HeadlessSwapchain { images: images.clone(), next_image: 0 });
        {
            let mut state = self.timeline.state.lock();
            state.counters.swapchain_creations += 1;
            state.surface_out_of_date = false;
        }
        Ok(NativeSwapchain { handle, images })
    }

    fn destroy_swapchain(&mut self, swapchain: NativeHandle) {
        self.swapchains.remove(&swapchain);
    }

    fn acquire_next_image(&mut self, swapchain: NativeHandle, _frame: u32) -> Result<AcquireStatus> {
        {
            let mut state = self.timeline.state.lock();
            if state.surface_out_of_date {
                state.surface_out_of_date = false;
                return Ok(AcquireStatus::OutOfDate);
            }
        }
        let record = self.swapchains.get_mut(&swapchain).ok_or_else(|| {
            DistGfxError::Graphics(GraphicsError::SwapchainError(format!("unknown swapchain {:?}", swapchain)))
        })?;
        let index = record.next_image;
        record.next_image = (record.next_image + 1) % record.images.len().max(1) as u32;
        Ok(AcquireStatus::Acquired(index))
    }

    fn present(&mut self, swapchain: NativeHandle, image_index: u32, _frame: u32) -> Result<PresentStatus> {
        let record = self.swapchains.get(&swapchain).ok_or_else(|| {
            DistGfxError::Graphics(GraphicsError::SwapchainError(format!("unknown swapchain {:?}", swapchain)))
        })?;
        if image_index as usize >= record.images.len() {
            return Err(GraphicsError::SwapchainError(format!("image index {} out of range", image_index)).into());
        }
        self.counters().presents += 1;
        Ok(PresentStatus::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resource::TextureUsage;

    fn device(execution: GpuExecution) -> (HeadlessDevice, GpuController) {
        let config = HeadlessConfig { execution, ..HeadlessConfig::default() };
        HeadlessDevice::new(&config, Size::new(320, 240))
    }

    fn closed_list(native: &mut HeadlessDevice) -> NativeHandle {
        let list = native.create_command_list(0).unwrap();
        native.begin_command_list(list).unwrap();
        native.end_command_list(list).unwrap();
        list
    }

    #[test]
    fn test_allocation_counters() {
        let (mut native, controller) = device(GpuExecution::Immediate);
        let heap = native.allocate_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        native
            .create_texture(&TextureDescriptor::texture_2d(16, 16, TextureFormat::R8_UNorm, TextureUsage::SAMPLED))
            .unwrap();
        native.free_heap(heap);

        let counters = controller.counters();
        assert_eq!(counters.heap_allocations, 1);
        assert_eq!(counters.heap_frees, 1);
        assert_eq!(counters.texture_creations, 1);
        assert_eq!(native.live_heaps(), 0);
        assert_eq!(native.live_textures(), 1);
    }

    #[test]
    fn test_write_and_read_host_visible_buffer() {
        let (mut native, _) = device(GpuExecution::Immediate);
        let heap = native.allocate_heap(&HeapDescriptor::new(MemoryType::Cpu, 1024)).unwrap();
        let buffer = native
            .create_placed_buffer(heap, 256, &BufferDescriptor::new(8, BufferUsage::Staging))
            .unwrap();
        native.write_buffer(buffer, 2, &[1, 2, 3]).unwrap();
        assert_eq!(native.read_buffer(buffer).unwrap(), vec![0, 0, 1, 2, 3, 0, 0, 0]);

        assert!(native.write_buffer(buffer, 6, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_gpu_only_heap_rejects_cpu_writes() {
        let (mut native, _) = device(GpuExecution::Immediate);
        let heap = native.allocate_heap(&HeapDescriptor::new(MemoryType::Gpu, 1024)).unwrap();
        let buffer = native
            .create_placed_buffer(heap, 0, &BufferDescriptor::new(64, BufferUsage::Storage))
            .unwrap();
        assert!(native.write_buffer(buffer, 0, &[0; 4]).is_err());
    }

    #[test]
    fn test_placed_buffer_must_fit() {
        let (mut native, _) = device(GpuExecution::Immediate);
        let heap = native.allocate_heap(&HeapDescriptor::new(MemoryType::Gpu, 512)).unwrap();
        assert!(native
            .create_placed_buffer(heap, 256, &BufferDescriptor::new(512, BufferUsage::Storage))
            .is_err());
    }

    #[test]
    fn test_recording_outside_begin_is_an_error() {
        let (mut native, _) = device(GpuExecution::Immediate);
        let list = native.create_command_list(0).unwrap();
        assert!(native.record(list, NativeCommand::EndRenderPass).is_err());

        native.begin_command_list(list).unwrap();
        native.record(list, NativeCommand::Dispatch { x: 1, y: 1, z: 1 }).unwrap();
        native.end_command_list(list).unwrap();
        assert!(native.record(list, NativeCommand::EndRenderPass).is_err());
    }

    #[test]
    fn test_on_wait_completes_in_order() {
        let (mut native, controller) = device(GpuExecution::OnWait);
        let fence = native.create_fence().unwrap();
        for value in 1..=3 {
            let list = closed_list(&mut native);
            native
                .submit(&Submission { command_list: list, fence, signal_value: value, present: None })
                .unwrap();
        }
        assert_eq!(controller.pending(), 3);
        assert_eq!(native.completed_value(fence), 0);

        native.wait_fence(fence, 2).unwrap();
        assert_eq!(native.completed_value(fence), 2);
        assert_eq!(controller.pending(), 1);
    }

    #[test]
    fn test_waiting_for_unsubmitted_value_fails() {
        let (mut native, _) = device(GpuExecution::Manual);
        let fence = native.create_fence().unwrap();
        assert!(native.wait_fence(fence, 1).is_err());
    }

    #[test]
    fn test_manual_wait_blocks_until_controller_signals() {
        let (mut native, controller) = device(GpuExecution::Manual);
        let fence = native.create_fence().unwrap();
        let list = closed_list(&mut native);
        native
            .submit(&Submission { command_list: list, fence, signal_value: 1, present: None })
            .unwrap();

        let signaller = controller.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaller.complete_next()
        });
        native.wait_fence(fence, 1).unwrap();
        assert!(handle.join().unwrap());
        assert_eq!(controller.completed_value(fence), 1);
    }

    #[test]
    fn test_swapchain_round_robin_and_out_of_date() {
        let (mut native, controller) = device(GpuExecution::Immediate);
        let swapchain = native
            .create_swapchain(&SwapchainDescriptor {
                size: Size::new(320, 240),
                format: TextureFormat::B8G8R8A8_UNorm,
                image_count: 2,
                present_mode: PresentMode::Fifo,
                frames_in_flight: 2,
            })
            .unwrap();
        assert_eq!(swapchain.images.len(), 2);

        let acquire = |native: &mut HeadlessDevice| native.acquire_next_image(swapchain.handle, 0).unwrap();
        assert_eq!(acquire(&mut native), AcquireStatus::Acquired(0));
        assert_eq!(acquire(&mut native), AcquireStatus::Acquired(1));
        assert_eq!(acquire(&mut native), AcquireStatus::Acquired(0));

        controller.resize_surface(640, 480);
        assert_eq!(acquire(&mut native), AcquireStatus::OutOfDate);
        assert_eq!(native.surface_capabilities().unwrap().current_extent, Some(Size::new(640, 480)));
    }
}
