//! GPU 同步机制模块
//!
//! CPU 与 GPU 之间只通过单调递增的栅栏值同步：每次提交把栅栏置为下一个值，
//! CPU 等待某个值即等待对应提交完成。
//!
//! # 使用场景
//!
//! 1. **命令缓冲区完成**：`CommandBuffer::wait_until_completed`
//! 2. **帧同步**：复用帧槽位前等待该槽位上一次提交（[`FrameFences`]）
//! 3. **设备空闲**：调整尺寸与关闭前等待所有在途工作

use super::resource::NativeHandle;
use crate::core::error::Result;
use crate::gfx::backend::NativeDevice;

/// Fence 值
///
/// 用于CPU-GPU同步的单调递增值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FenceValue(u64);

impl FenceValue {
    pub const ZERO: FenceValue = FenceValue(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// 下一个Fence值
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// Fence 管理器
///
/// 包装一个原生栅栏：CPU 侧记录最后一次 signal 的值，
/// GPU 侧的完成值按需向后端查询并缓存。
#[derive(Debug)]
pub struct FenceManager {
    fence: NativeHandle,
    /// 最后一次提交时 signal 的值（CPU侧）
    current_value: FenceValue,
    /// 已知完成的值（GPU侧）
    completed_value: FenceValue,
}

impl FenceManager {
    pub fn new(native: &mut dyn NativeDevice) -> Result<Self> {
        Ok(Self {
            fence: native.create_fence()?,
            current_value: FenceValue::ZERO,
            completed_value: FenceValue::ZERO,
        })
    }

    pub fn fence(&self) -> NativeHandle {
        self.fence
    }

    pub fn current_value(&self) -> FenceValue {
        self.current_value
    }

    pub fn completed_value(&self) -> FenceValue {
        self.completed_value
    }

    /// 获取下一个Fence值并递增计数器
    pub fn next_value(&mut self) -> FenceValue {
        self.current_value = self.current_value.next();
        self.current_value
    }

    /// 撤回最近一次 `next_value`（提交失败时）
    pub(crate) fn rollback(&mut self) {
        self.current_value = FenceValue::new(self.current_value.value().saturating_sub(1));
    }

    /// 是否有已提交但未确认完成的工作
    pub fn has_pending(&self) -> bool {
        self.completed_value < self.current_value
    }

    /// 向后端查询完成值，返回 `value` 是否已完成
    pub fn poll(&mut self, native: &dyn NativeDevice, value: FenceValue) -> bool {
        if self.completed_value >= value {
            return true;
        }
        let completed = FenceValue::new(native.completed_value(self.fence));
        self.completed_value = self.completed_value.max(completed);
        self.completed_value >= value
    }

    /// 阻塞直到 `value` 完成
    pub fn wait_for_value(&mut self, native: &mut dyn NativeDevice, value: FenceValue) -> Result<()> {
        if self.poll(native, value) {
            return Ok(());
        }
        native.wait_fence(self.fence, value.value())?;
        self.completed_value = self.completed_value.max(value);
        Ok(())
    }

    /// 等待所有已提交的工作
    pub fn flush(&mut self, native: &mut dyn NativeDevice) -> Result<()> {
        let current = self.current_value;
        self.wait_for_value(native, current)
    }

    /// 销毁原生栅栏
    pub fn destroy(self, native: &mut dyn NativeDevice) {
        native.destroy_fence(self.fence);
    }
}

/// 一次帧提交在栅栏上的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFence {
    pub fence: NativeHandle,
    pub value: FenceValue,
}

/// 每个帧槽位最近一次提交的记录
///
/// 呈现时记录，槽位下一次被复用前等待。
#[derive(Debug, Clone)]
pub struct FrameFences {
    in_flight: Vec<Option<FrameFence>>,
}

impl FrameFences {
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            in_flight: vec![None; frames_in_flight as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.in_flight.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn record(&mut self, frame: u32, fence: FrameFence) {
        self.in_flight[frame as usize] = Some(fence);
    }

    pub fn get(&self, frame: u32) -> Option<FrameFence> {
        self.in_flight.get(frame as usize).copied().flatten()
    }

    /// 等待槽位 `frame` 的上一次提交完成
    ///
    /// 返回是否真正发生了等待（槽位为空时不等待）。
    pub fn wait(&mut self, native: &mut dyn NativeDevice, frame: u32) -> Result<bool> {
        let Some(record) = self.in_flight.get_mut(frame as usize).and_then(Option::take) else {
            return Ok(false);
        };
        if native.completed_value(record.fence) < record.value.value() {
            native.wait_fence(record.fence, record.value.value())?;
        }
        Ok(true)
    }

    /// 丢弃所有记录（设备空闲之后）
    pub fn clear(&mut self) {
        self.in_flight.iter_mut().for_each(|slot| *slot = None);
    }

    /// 按新的在途帧数重建
    pub fn resize(&mut self, frames_in_flight: u32) {
        self.in_flight = vec![None; frames_in_flight as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{GpuExecution, HeadlessConfig};
    use crate::gfx::headless::HeadlessDevice;
    use crate::gfx::backend::Submission;
    use crate::renderer::resource::Size;

    fn device(execution: GpuExecution) -> HeadlessDevice {
        let config = HeadlessConfig { execution, ..HeadlessConfig::default() };
        HeadlessDevice::new(&config, Size::new(64, 64)).0
    }

    fn submit(native: &mut HeadlessDevice, fence: NativeHandle, value: FenceValue) {
        let list = native.create_command_list(0).unwrap();
        native.begin_command_list(list).unwrap();
        native.end_command_list(list).unwrap();
        native
            .submit(&Submission { command_list: list, fence, signal_value: value.value(), present: None })
            .unwrap();
    }

    #[test]
    fn test_fence_value() {
        let fence = FenceValue::new(1);
        assert_eq!(fence.next().value(), 2);
        assert!(FenceValue::new(1) < FenceValue::new(2));
        assert_eq!(FenceValue::default(), FenceValue::ZERO);
    }

    #[test]
    fn test_fence_manager_counts() {
        let mut native = device(GpuExecution::OnWait);
        let mut manager = FenceManager::new(&mut native).unwrap();
        assert!(!manager.has_pending());

        let v1 = manager.next_value();
        assert_eq!(v1.value(), 1);
        submit(&mut native, manager.fence(), v1);
        assert!(manager.has_pending());
        assert!(!manager.poll(&native, v1));

        manager.wait_for_value(&mut native, v1).unwrap();
        assert!(!manager.has_pending());
        assert_eq!(manager.completed_value(), v1);
    }

    #[test]
    fn test_immediate_execution_completes_on_submit() {
        let mut native = device(GpuExecution::Immediate);
        let mut manager = FenceManager::new(&mut native).unwrap();
        let v1 = manager.next_value();
        submit(&mut native, manager.fence(), v1);
        assert!(manager.poll(&native, v1));
    }

    #[test]
    fn test_frame_fences() {
        let mut native = device(GpuExecution::OnWait);
        let mut manager = FenceManager::new(&mut native).unwrap();
        let mut frames = FrameFences::new(2);

        // 空槽位不等待
        assert!(!frames.wait(&mut native, 0).unwrap());

        let value = manager.next_value();
        submit(&mut native, manager.fence(), value);
        frames.record(1, FrameFence { fence: manager.fence(), value });
        assert_eq!(frames.get(1).map(|f| f.value), Some(value));

        assert!(frames.wait(&mut native, 1).unwrap());
        assert!(native.completed_value(manager.fence()) >= value.value());
        assert_eq!(frames.get(1), None);
    }
}
