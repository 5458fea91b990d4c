//! 堆与线性子分配
//!
//! 一个 `Heap` 对应一次后端内存分配。缓冲区按对齐从堆中线性切出，
//! `stack_ptr` 单调递增，只有整个堆被归还（`GraphicsDevice::release_heap`）
//! 并在延迟队列中执行后才会归零。
//!
//! ```text
//!  0          stack_ptr                    align_up(size)
//!  |==========|--------------------------- |
//!   已分配       可用
//! ```
//!
//! 超出容量是致命错误，不会回绕。

use super::resource::{HeapDescriptor, MemoryType, NativeHandle};
use crate::gfx_fatal;

/// 向上对齐到 `alignment` 的整数倍
///
/// `alignment` 为 0 或 1 时原样返回。
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// 后端内存堆
///
/// 由申请者独占持有，不可复制；用完后必须交回设备。
#[derive(Debug, PartialEq, Eq)]
pub struct Heap {
    handle: NativeHandle,
    descriptor: HeapDescriptor,
    alignment: u64,
    stack_ptr: u64,
}

impl Heap {
    pub(crate) fn new(handle: NativeHandle, descriptor: HeapDescriptor, alignment: u64) -> Self {
        Self {
            handle,
            descriptor,
            alignment: alignment.max(1),
            stack_ptr: 0,
        }
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn descriptor(&self) -> &HeapDescriptor {
        &self.descriptor
    }

    pub fn memory_type(&self) -> MemoryType {
        self.descriptor.memory_type
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn stack_ptr(&self) -> u64 {
        self.stack_ptr
    }

    /// 对齐后的容量
    pub fn capacity(&self) -> u64 {
        align_up(self.descriptor.size, self.alignment)
    }

    /// 还能容纳 `size` 字节的缓冲区吗
    pub fn can_allocate(&self, size: u64) -> bool {
        align_up(self.stack_ptr, self.alignment)
            .checked_add(size)
            .is_some_and(|end| end <= self.capacity())
    }

    /// 剩余可用字节数（按当前对齐后的起点计算）
    pub fn remaining(&self) -> u64 {
        self.capacity().saturating_sub(align_up(self.stack_ptr, self.alignment))
    }

    /// 切出 `size` 字节，返回起始偏移
    ///
    /// # Panics
    ///
    /// 堆剩余空间不足或请求大小溢出时 panic。
    pub fn sub_allocate(&mut self, size: u64) -> u64 {
        let offset = align_up(self.stack_ptr, self.alignment);
        let new_stack_ptr = match offset.checked_add(size) {
            Some(end) if end <= self.capacity() => end,
            _ => gfx_fatal!(
                "Heap is full! heap='{}' size={} stack_ptr={} requested={}",
                self.descriptor.name, self.descriptor.size, self.stack_ptr, size
            ),
        };
        self.stack_ptr = new_stack_ptr;
        offset
    }

    /// 回到空堆状态
    pub(crate) fn reset(&mut self) {
        self.stack_ptr = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(size: u64, alignment: u64) -> Heap {
        Heap::new(NativeHandle(1), HeapDescriptor::new(MemoryType::Gpu, size).with_name("test"), alignment)
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 1), 13);
        assert_eq!(align_up(13, 0), 13);
    }

    #[test]
    fn test_sub_allocations_never_overlap() {
        let mut heap = heap(4096, 256);
        let mut ranges = Vec::new();
        for size in [100u64, 256, 1, 700, 12] {
            let offset = heap.sub_allocate(size);
            assert_eq!(offset % 256, 0);
            ranges.push((offset, offset + size));
        }

        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                assert!(a.1 <= b.0, "{:?} overlaps {:?}", a, b);
            }
        }
        assert!(heap.stack_ptr() <= heap.capacity());
    }

    #[test]
    fn test_exact_fit() {
        let mut heap = heap(1000, 256);
        // 容量按对齐向上取整到 1024
        assert_eq!(heap.capacity(), 1024);
        assert_eq!(heap.sub_allocate(512), 0);
        assert_eq!(heap.sub_allocate(512), 512);
        assert!(!heap.can_allocate(1));
        assert_eq!(heap.remaining(), 0);
    }

    #[test]
    #[should_panic(expected = "Heap is full")]
    fn test_overflow_is_fatal() {
        let mut heap = heap(1024, 256);
        heap.sub_allocate(600);
        // 对齐后起点为 768，再放 300 字节超出 1024
        heap.sub_allocate(300);
    }

    #[test]
    #[should_panic(expected = "Heap is full")]
    fn test_wrapping_request_is_fatal() {
        let mut heap = heap(1024, 256);
        heap.sub_allocate(16);
        // 起点 256 加上近乎 u64::MAX 会回绕
        heap.sub_allocate(u64::MAX - 100);
    }

    #[test]
    fn test_wrapping_request_cannot_allocate() {
        let mut heap = heap(1024, 256);
        heap.sub_allocate(16);
        assert!(!heap.can_allocate(u64::MAX));
    }

    #[test]
    fn test_reset_rewinds_stack_ptr() {
        let mut heap = heap(1024, 64);
        heap.sub_allocate(1000);
        heap.reset();
        assert_eq!(heap.stack_ptr(), 0);
        assert_eq!(heap.sub_allocate(1024), 0);
    }
}
