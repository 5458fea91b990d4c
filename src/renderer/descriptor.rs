//! 资源视图槽位管理
//!
//! 着色器通过整数索引访问资源（bindless），索引指向后端持有的一张
//! 固定容量描述符表。本模块只做槽位簿记，不关心资源语义。
//!
//! # 分配器结构
//!
//! 稠密数组 `dense` 的前 `len` 项是已分配槽位，其后是空闲槽位；
//! 稀疏数组 `sparse[slot]` 记录槽位在 `dense` 中的位置。
//! 分配取 `dense[len]`，释放把槽位与最后一个已分配槽位交换，二者都是 O(1)。
//!
//! ```text
//! dense:  [ 4 | 0 | 2 ‖ 1 | 3 | 5 ]
//!                len=3 ┘
//! ```
//!
//! 槽位的生命周期独立于资源：释放必须经由帧延迟队列，
//! 否则旧帧的命令列表可能仍在通过该槽位访问旧资源。

use super::resource::ShaderResourceIndex;
use crate::gfx_fatal;

/// 资源视图槽位分配器
#[derive(Debug, Clone)]
pub struct ResourceViewAllocator {
    dense: Vec<u32>,
    sparse: Vec<u32>,
    len: u32,
}

impl ResourceViewAllocator {
    /// 创建容量为 `capacity` 的分配器
    pub fn new(capacity: u32) -> Self {
        Self {
            dense: (0..capacity).collect(),
            sparse: (0..capacity).collect(),
            len: 0,
        }
    }

    /// 分配一个槽位
    ///
    /// # Panics
    ///
    /// 表已满时 panic：容量在设备配置时确定，运行期不增长。
    pub fn allocate(&mut self) -> ShaderResourceIndex {
        if self.len as usize >= self.dense.len() {
            gfx_fatal!(
                "Resource view table exhausted: {} slots in use",
                self.dense.len()
            );
        }
        let slot = self.dense[self.len as usize];
        self.len += 1;
        ShaderResourceIndex(slot)
    }

    /// 归还槽位
    ///
    /// # Panics
    ///
    /// 槽位越界或未分配（重复释放）时 panic。
    pub fn release(&mut self, slot: ShaderResourceIndex) {
        let index = slot.index();
        if index as usize >= self.sparse.len() {
            gfx_fatal!("Released resource view {} is out of range (capacity {})", index, self.sparse.len());
        }
        if !self.is_allocated(slot) {
            gfx_fatal!("Resource view {} released twice", index);
        }

        let position = self.sparse[index as usize];
        let last_position = self.len - 1;
        let last_slot = self.dense[last_position as usize];

        self.dense.swap(position as usize, last_position as usize);
        self.sparse[last_slot as usize] = position;
        self.sparse[index as usize] = last_position;
        self.len -= 1;
    }

    /// 槽位当前是否已分配
    pub fn is_allocated(&self, slot: ShaderResourceIndex) -> bool {
        match self.sparse.get(slot.index() as usize) {
            Some(&position) => position < self.len,
            None => false,
        }
    }

    /// 释放全部槽位
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// 已分配数量
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> u32 {
        self.dense.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }
}

/// 描述符表
///
/// 槽位分配器加上后端描述符步长：槽位 `i` 在原生描述符堆中的字节偏移
/// 固定为 `i * stride`。
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    allocator: ResourceViewAllocator,
    stride: u64,
}

impl DescriptorTable {
    pub fn new(capacity: u32, stride: u64) -> Self {
        Self {
            allocator: ResourceViewAllocator::new(capacity),
            stride,
        }
    }

    /// 分配槽位，同时返回其在描述符堆中的字节偏移
    pub fn allocate(&mut self) -> (ShaderResourceIndex, u64) {
        let slot = self.allocator.allocate();
        (slot, self.offset_of(slot))
    }

    pub fn release(&mut self, slot: ShaderResourceIndex) {
        self.allocator.release(slot);
    }

    /// 槽位的字节偏移
    pub fn offset_of(&self, slot: ShaderResourceIndex) -> u64 {
        slot.index() as u64 * self.stride
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn allocator(&self) -> &ResourceViewAllocator {
        &self.allocator
    }

    pub fn reset(&mut self) {
        self.allocator.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocate_release_round_trip() {
        let mut allocator = ResourceViewAllocator::new(64);

        let first: HashSet<_> = (0..16).map(|_| allocator.allocate()).collect();
        assert_eq!(first.len(), 16);
        assert_eq!(allocator.len(), 16);

        for slot in &first {
            allocator.release(*slot);
        }
        assert!(allocator.is_empty());

        let second: HashSet<_> = (0..16).map(|_| allocator.allocate()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_release_in_middle_keeps_others_allocated() {
        let mut allocator = ResourceViewAllocator::new(8);
        let a = allocator.allocate();
        let b = allocator.allocate();
        let c = allocator.allocate();

        allocator.release(b);
        assert!(allocator.is_allocated(a));
        assert!(!allocator.is_allocated(b));
        assert!(allocator.is_allocated(c));

        // 刚释放的槽位最先被重新分配
        assert_eq!(allocator.allocate(), b);
    }

    #[test]
    fn test_fill_to_capacity() {
        let mut allocator = ResourceViewAllocator::new(4);
        for _ in 0..4 {
            allocator.allocate();
        }
        assert!(allocator.is_full());
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_exhaustion_is_fatal() {
        let mut allocator = ResourceViewAllocator::new(2);
        allocator.allocate();
        allocator.allocate();
        allocator.allocate();
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_is_fatal() {
        let mut allocator = ResourceViewAllocator::new(2);
        let slot = allocator.allocate();
        allocator.release(slot);
        allocator.release(slot);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_release_out_of_range_is_fatal() {
        let mut allocator = ResourceViewAllocator::new(2);
        allocator.release(ShaderResourceIndex(7));
    }

    #[test]
    fn test_descriptor_table_offsets() {
        let mut table = DescriptorTable::new(16, 32);
        let (a, offset_a) = table.allocate();
        let (b, offset_b) = table.allocate();
        assert_eq!(offset_a, a.index() as u64 * 32);
        assert_eq!(offset_b, b.index() as u64 * 32);
        assert_ne!(offset_a, offset_b);

        table.release(a);
        assert_eq!(table.allocator().len(), 1);
    }
}
