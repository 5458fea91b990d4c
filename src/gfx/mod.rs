//! 图形后端模块
//!
//! 本模块封装了不同图形 API 的底层实现，包括：
//! - Vulkan：跨平台的现代图形 API（`ash`）
//! - DirectX 12：Windows 平台的高性能图形 API（`windows`）
//! - Metal：Apple 平台图形 API（`metal`）
//! - Headless：进程内模拟的 GPU，用于测试与无显卡环境
//!
//! 所有后端都实现了统一的 [`NativeDevice`] trait，
//! 由 [`create_native_device`] 按配置选出一个。

pub mod backend;
pub mod headless;
pub mod vulkan;
#[cfg(target_os = "windows")]
pub mod dx12;
#[cfg(target_os = "macos")]
pub mod metal;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use winit::window::Window;

pub use backend::NativeDevice;

use crate::core::config::{DeviceConfig, GraphicsBackend};
use crate::core::error::{GraphicsError, Result};
use crate::renderer::resource::Size;

/// 呈现目标窗口
///
/// 只保存原始句柄，调用者保证窗口比设备活得久。
#[derive(Debug, Clone, Copy)]
pub struct SurfaceTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
    /// 窗口内部尺寸（物理像素）
    pub size: Size,
}

impl SurfaceTarget {
    pub fn from_window(window: &Window) -> Result<Self> {
        let display = window
            .display_handle()
            .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to get display handle: {}", e)))?
            .as_raw();
        let handle = window
            .window_handle()
            .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to get window handle: {}", e)))?
            .as_raw();
        let size = window.inner_size();
        Ok(Self {
            display,
            window: handle,
            size: Size::new(size.width, size.height),
        })
    }
}

/// 按配置创建原生设备
///
/// 除 headless 外的后端都需要窗口表面。
pub fn create_native_device(config: &DeviceConfig, surface: Option<SurfaceTarget>) -> Result<Box<dyn NativeDevice>> {
    let (width, height) = config.drawable_size;

    if config.backend == GraphicsBackend::Headless {
        // 控制器只在测试中有用，这里直接丢弃
        let (device, _controller) = headless::HeadlessDevice::new(&config.headless, Size::new(width, height));
        return Ok(Box::new(device));
    }

    let surface = surface.ok_or_else(|| {
        GraphicsError::DeviceCreation(format!("{} backend requires a window surface", config.backend.name()))
    })?;

    match config.backend {
        GraphicsBackend::Vulkan => Ok(Box::new(vulkan::VulkanDevice::new(config, &surface)?)),
        #[cfg(target_os = "windows")]
        GraphicsBackend::Dx12 => Ok(Box::new(dx12::Dx12Device::new(config, &surface)?)),
        #[cfg(target_os = "macos")]
        GraphicsBackend::Metal => Ok(Box::new(metal::MetalDevice::new(config, &surface)?)),
        other => Err(GraphicsError::DeviceCreation(format!(
            "{} backend is not available on this platform",
            other.name()
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_needs_no_surface() {
        let native = create_native_device(&DeviceConfig::headless(), None).unwrap();
        assert_eq!(native.info().kind, GraphicsBackend::Headless);
    }

    #[test]
    fn test_windowed_backend_requires_surface() {
        let config = DeviceConfig {
            backend: GraphicsBackend::Vulkan,
            ..DeviceConfig::headless()
        };
        let err = create_native_device(&config, None).err().unwrap();
        assert!(err.to_string().contains("requires a window surface"));
    }
}
