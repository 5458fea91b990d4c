//! 帧延迟销毁与空闲池
//!
//! 资源在帧 F 被释放时，GPU 可能仍在执行引用它的命令。释放请求因此
//! 先进入帧 F 的队列，等下一次回到槽位 F、其栅栏已经等待过之后才执行。
//!
//! ```text
//!  frame:   0     1     2     0     1
//!  release  ●──────────────────▶ 执行
//! ```
//!
//! 堆和纹理的释放默认回到空闲池而不是真正销毁，后续同规格的请求可以直接复用。

use std::collections::HashSet;
use std::fmt;

use super::descriptor::DescriptorTable;
use super::device::AllocationStats;
use super::heap::Heap;
use super::resource::{Buffer, HeapDescriptor, NativeHandle, ShaderResourceIndex, Texture, TextureDescriptor};
use super::transition::ResourceStateCache;
use crate::gfx::backend::{NativeDevice, NativeTexture};

/// 延迟执行的释放请求
pub enum PooledObject {
    /// 销毁原生堆
    Heap(Heap),
    /// 重置后放回空闲堆池
    HeapToPool(Heap),
    /// 销毁原生纹理及其资源视图
    Texture(Texture),
    /// 放回空闲纹理池（保留资源视图）
    TextureToPool(Texture),
    /// 销毁原生缓冲区及其资源视图
    Buffer(Buffer),
    /// 归还资源视图槽位
    View(ShaderResourceIndex),
    Shader(NativeHandle),
    CommandList { frame: u32, list: NativeHandle },
    /// 任意后端操作
    Custom(Box<dyn FnOnce(&mut dyn NativeDevice)>),
}

impl PooledObject {
    pub fn custom<F>(f: F) -> Self
    where
        F: FnOnce(&mut dyn NativeDevice) + 'static,
    {
        PooledObject::Custom(Box::new(f))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PooledObject::Heap(_) => "heap",
            PooledObject::HeapToPool(_) => "heap_to_pool",
            PooledObject::Texture(_) => "texture",
            PooledObject::TextureToPool(_) => "texture_to_pool",
            PooledObject::Buffer(_) => "buffer",
            PooledObject::View(_) => "view",
            PooledObject::Shader(_) => "shader",
            PooledObject::CommandList { .. } => "command_list",
            PooledObject::Custom(_) => "custom",
        }
    }

    /// 执行释放
    pub fn execute(self, ctx: &mut PoolContext<'_>) {
        match self {
            PooledObject::Heap(heap) => {
                ctx.native.free_heap(heap.handle());
                ctx.stats.heaps_freed += 1;
            }
            PooledObject::HeapToPool(mut heap) => {
                heap.reset();
                ctx.pools.heaps.push(heap);
            }
            PooledObject::Texture(texture) => {
                if texture.resource_view.is_valid() {
                    ctx.descriptors.release(texture.resource_view);
                }
                ctx.states.forget(texture.handle);
                ctx.released.remove(&texture.handle);
                ctx.native.destroy_texture(NativeTexture {
                    handle: texture.handle,
                    view: texture.view,
                });
                ctx.stats.textures_destroyed += 1;
            }
            PooledObject::TextureToPool(texture) => {
                ctx.pools.textures.push(texture);
            }
            PooledObject::Buffer(buffer) => {
                if buffer.resource_view.is_valid() {
                    ctx.descriptors.release(buffer.resource_view);
                }
                ctx.states.forget(buffer.handle);
                ctx.released.remove(&buffer.handle);
                ctx.native.destroy_buffer(buffer.handle);
                ctx.stats.buffers_destroyed += 1;
            }
            PooledObject::View(slot) => ctx.descriptors.release(slot),
            PooledObject::Shader(shader) => {
                ctx.native.destroy_shader(shader);
                ctx.stats.shaders_destroyed += 1;
            }
            PooledObject::CommandList { frame, list } => {
                ctx.native.destroy_command_list(frame, list);
                ctx.stats.command_lists_destroyed += 1;
            }
            PooledObject::Custom(f) => f(ctx.native),
        }
    }
}

impl fmt::Debug for PooledObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PooledObject::Heap(heap) | PooledObject::HeapToPool(heap) => {
                write!(f, "{}({:?})", self.kind(), heap.handle())
            }
            PooledObject::Texture(texture) | PooledObject::TextureToPool(texture) => {
                write!(f, "{}({:?})", self.kind(), texture.handle)
            }
            PooledObject::Buffer(buffer) => write!(f, "buffer({:?})", buffer.handle),
            PooledObject::View(slot) => write!(f, "view({})", slot.index()),
            PooledObject::Shader(shader) => write!(f, "shader({:?})", shader),
            PooledObject::CommandList { frame, list } => write!(f, "command_list({}, {:?})", frame, list),
            PooledObject::Custom(_) => write!(f, "custom"),
        }
    }
}

/// 执行释放请求所需的设备状态
pub struct PoolContext<'a> {
    pub native: &'a mut dyn NativeDevice,
    pub pools: &'a mut FreePools,
    pub descriptors: &'a mut DescriptorTable,
    pub states: &'a mut ResourceStateCache,
    /// 销毁后从中移除，句柄可以被后端重新使用
    pub released: &'a mut HashSet<NativeHandle>,
    pub stats: &'a mut AllocationStats,
}

/// 每个帧槽位一条释放队列
#[derive(Debug)]
pub struct FrameQueues {
    queues: Vec<Vec<PooledObject>>,
}

impl FrameQueues {
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            queues: (0..frames_in_flight).map(|_| Vec::new()).collect(),
        }
    }

    pub fn frames(&self) -> u32 {
        self.queues.len() as u32
    }

    pub fn push(&mut self, frame: u32, object: PooledObject) {
        self.queues[frame as usize].push(object);
    }

    /// 取出槽位的全部请求，按入队顺序
    pub fn take(&mut self, frame: u32) -> Vec<PooledObject> {
        std::mem::take(&mut self.queues[frame as usize])
    }

    pub fn len(&self, frame: u32) -> usize {
        self.queues[frame as usize].len()
    }

    pub fn total_len(&self) -> usize {
        self.queues.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// 改变槽位数，未执行的请求按原顺序并入槽位 0
    pub fn resize(&mut self, frames_in_flight: u32) {
        let pending: Vec<PooledObject> = self.queues.iter_mut().flat_map(std::mem::take).collect();
        *self = Self::new(frames_in_flight.max(1));
        self.queues[0] = pending;
    }
}

/// 空闲堆池与空闲纹理池
#[derive(Debug, Default)]
pub struct FreePools {
    pub(crate) heaps: Vec<Heap>,
    pub(crate) textures: Vec<Texture>,
}

impl FreePools {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出第一个满足请求的堆
    ///
    /// 池按大小升序排列时，这就是能满足请求的最小堆。
    pub fn take_heap(&mut self, descriptor: &HeapDescriptor) -> Option<Heap> {
        let index = self.heaps.iter().position(|heap| heap.descriptor().satisfies(descriptor))?;
        Some(self.heaps.remove(index))
    }

    /// 取出描述符相等的纹理
    pub fn take_texture(&mut self, descriptor: &TextureDescriptor) -> Option<Texture> {
        let index = self.textures.iter().position(|texture| texture.descriptor == *descriptor)?;
        Some(self.textures.swap_remove(index))
    }

    pub fn sort_heaps(&mut self) {
        self.heaps.sort_by_key(|heap| heap.size());
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn heap_sizes(&self) -> Vec<u64> {
        self.heaps.iter().map(Heap::size).collect()
    }

    pub(crate) fn drain_heaps(&mut self) -> Vec<Heap> {
        std::mem::take(&mut self.heaps)
    }

    pub(crate) fn drain_textures(&mut self) -> Vec<Texture> {
        std::mem::take(&mut self.textures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resource::{MemoryType, Size, TextureFormat, TextureUsage};
    use std::cell::Cell;
    use std::rc::Rc;

    fn heap(handle: u64, memory_type: MemoryType, size: u64) -> Heap {
        Heap::new(NativeHandle(handle), HeapDescriptor::new(memory_type, size), 256)
    }

    #[test]
    fn test_queues_are_per_frame() {
        let mut queues = FrameQueues::new(3);
        queues.push(0, PooledObject::View(ShaderResourceIndex(1)));
        queues.push(0, PooledObject::View(ShaderResourceIndex(2)));
        queues.push(2, PooledObject::Shader(NativeHandle(9)));

        assert_eq!(queues.len(0), 2);
        assert_eq!(queues.len(1), 0);
        assert_eq!(queues.total_len(), 3);

        let taken = queues.take(0);
        assert_eq!(taken.len(), 2);
        assert!(matches!(taken[0], PooledObject::View(ShaderResourceIndex(1))));
        assert_eq!(queues.len(0), 0);
        assert_eq!(queues.total_len(), 1);
    }

    #[test]
    fn test_resize_keeps_pending_requests() {
        let mut queues = FrameQueues::new(3);
        queues.push(1, PooledObject::View(ShaderResourceIndex(1)));
        queues.push(2, PooledObject::View(ShaderResourceIndex(2)));
        queues.resize(2);
        assert_eq!(queues.frames(), 2);
        assert_eq!(queues.len(0), 2);
    }

    #[test]
    fn test_take_heap_first_fit() {
        let mut pools = FreePools::new();
        pools.heaps.push(heap(1, MemoryType::Gpu, 4096));
        pools.heaps.push(heap(2, MemoryType::Cpu, 1 << 20));
        pools.heaps.push(heap(3, MemoryType::Gpu, 1 << 20));

        let taken = pools.take_heap(&HeapDescriptor::new(MemoryType::Gpu, 8192)).unwrap();
        assert_eq!(taken.handle(), NativeHandle(3));
        assert!(pools.take_heap(&HeapDescriptor::new(MemoryType::Shared, 16)).is_none());
        assert_eq!(pools.heap_count(), 2);
    }

    #[test]
    fn test_sort_heaps_ascending() {
        let mut pools = FreePools::new();
        for (handle, size) in [(1, 8192u64), (2, 1024), (3, 4096)] {
            pools.heaps.push(heap(handle, MemoryType::Gpu, size));
        }
        pools.sort_heaps();
        assert_eq!(pools.heap_sizes(), vec![1024, 4096, 8192]);

        // 升序后首次命中即为最小可用堆
        let taken = pools.take_heap(&HeapDescriptor::new(MemoryType::Gpu, 2000)).unwrap();
        assert_eq!(taken.size(), 4096);
    }

    #[test]
    fn test_take_texture_by_descriptor() {
        let descriptor = |w| TextureDescriptor::texture_2d(w, w, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED);
        let mut pools = FreePools::new();
        pools.textures.push(Texture {
            handle: NativeHandle(5),
            view: NativeHandle(6),
            descriptor: descriptor(512).with_name("old"),
            resource_view: ShaderResourceIndex(0),
            mip_levels: 1,
            drawable_index: None,
        });

        assert!(pools.take_texture(&descriptor(256)).is_none());
        let texture = pools.take_texture(&descriptor(512).with_name("new")).unwrap();
        assert_eq!(texture.handle, NativeHandle(5));
        assert_eq!(texture.size(), Size::new(512, 512));
    }

    #[test]
    fn test_custom_debug_output() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let object = PooledObject::custom(move |_| flag.set(true));
        assert_eq!(format!("{:?}", object), "custom");
        assert_eq!(object.kind(), "custom");
        assert!(!ran.get());
    }
}
