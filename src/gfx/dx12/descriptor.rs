//! DirectX 12 描述符堆
//!
//! 后端用到三个堆：
//!
//! | 堆 | 类型 | 着色器可见 | 用途 |
//! |----|------|-----------|------|
//! | RTV | `RTV` | 否 | 颜色附件 |
//! | DSV | `DSV` | 否 | 深度附件 |
//! | 资源视图 | `CBV_SRV_UAV` | 是 | 资源视图表 + 临时视图环 |
//!
//! 资源视图堆的前 `capacity` 个槽位就是资源视图表，槽位号与
//! `ShaderResourceIndex` 一一对应；其后是按环形复用的临时槽位，
//! 供 mip 生成和存储纹理绑定使用。

use windows::Win32::Graphics::Direct3D12::*;

use crate::core::error::{GraphicsError, Result};

/// 临时视图环的槽位数
pub const SCRATCH_DESCRIPTORS: u32 = 1024;

pub struct DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    increment_size: u32,
    cpu_start: usize,
    gpu_start: Option<u64>,
    capacity: u32,
    /// 空闲槽位（仅 CPU 堆按槽位分配）
    free: Vec<u32>,
    next: u32,
}

impl DescriptorHeap {
    pub fn new(
        device: &ID3D12Device,
        heap_type: D3D12_DESCRIPTOR_HEAP_TYPE,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<Self> {
        unsafe {
            let flags = if shader_visible {
                D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
            } else {
                D3D12_DESCRIPTOR_HEAP_FLAG_NONE
            };
            let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
                Type: heap_type,
                NumDescriptors: capacity.max(1),
                Flags: flags,
                NodeMask: 0,
            };
            let heap: ID3D12DescriptorHeap = device.CreateDescriptorHeap(&heap_desc).map_err(|e| {
                GraphicsError::DeviceCreation(format!("Failed to create {:?} descriptor heap: {:?}", heap_type, e))
            })?;

            let increment_size = device.GetDescriptorHandleIncrementSize(heap_type);
            let cpu_start = heap.GetCPUDescriptorHandleForHeapStart().ptr;
            let gpu_start = shader_visible.then(|| heap.GetGPUDescriptorHandleForHeapStart().ptr);

            Ok(Self {
                heap,
                increment_size,
                cpu_start,
                gpu_start,
                capacity: capacity.max(1),
                free: Vec::new(),
                next: 0,
            })
        }
    }

    pub fn heap(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }

    pub fn increment_size(&self) -> u32 {
        self.increment_size
    }

    pub fn cpu_handle(&self, index: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: self.cpu_start + (index as usize * self.increment_size as usize),
        }
    }

    /// 仅着色器可见的堆有 GPU 句柄
    pub fn gpu_handle(&self, index: u32) -> D3D12_GPU_DESCRIPTOR_HANDLE {
        D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: self.gpu_start.unwrap_or(0) + index as u64 * self.increment_size as u64,
        }
    }

    /// 分配一个槽位，优先复用释放过的
    pub fn allocate(&mut self) -> Result<u32> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        if self.next >= self.capacity {
            return Err(GraphicsError::ResourceCreation(format!(
                "descriptor heap exhausted ({} descriptors)",
                self.capacity
            ))
            .into());
        }
        self.next += 1;
        Ok(self.next - 1)
    }

    pub fn free(&mut self, index: u32) {
        self.free.push(index);
    }
}

/// 资源视图堆尾部的临时槽位环
///
/// 槽位在 `SCRATCH_DESCRIPTORS` 次分配后复用，调用者保证
/// 在此之前引用它的命令已经执行完毕。
pub struct ScratchRing {
    base: u32,
    next: u32,
}

impl ScratchRing {
    pub fn new(base: u32) -> Self {
        Self { base, next: 0 }
    }

    pub fn next(&mut self) -> u32 {
        let index = self.base + self.next;
        self.next = (self.next + 1) % SCRATCH_DESCRIPTORS;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_ring_wraps() {
        let mut ring = ScratchRing::new(64);
        assert_eq!(ring.next(), 64);
        for _ in 1..SCRATCH_DESCRIPTORS {
            ring.next();
        }
        assert_eq!(ring.next(), 64);
    }
}
