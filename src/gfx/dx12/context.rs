//! DirectX 12 上下文
//!
//! 持有 DXGI 工厂、D3D12 设备、直接命令队列和目标窗口。
//!
//! # 初始化流程
//!
//! 1. 启用调试层（配置开启验证时）
//! 2. 创建 DXGI 工厂
//! 3. 选择适配器并创建 D3D12 设备
//! 4. 创建命令队列

use tracing::{debug, info, warn};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE};
use raw_window_handle::RawWindowHandle;

use crate::core::config::DeviceConfig;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::SurfaceTarget;

fn creation_error(what: &str, err: impl std::fmt::Debug) -> GraphicsError {
    GraphicsError::DeviceCreation(format!("Failed to {}: {:?}", what, err))
}

pub struct Dx12Context {
    pub factory: IDXGIFactory4,
    pub device: ID3D12Device,
    pub queue: ID3D12CommandQueue,
    pub hwnd: HWND,
    pub device_name: String,
    /// 等待栅栏用的事件
    pub fence_event: HANDLE,
    idle_fence: ID3D12Fence,
    idle_value: u64,
}

impl Dx12Context {
    pub fn new(config: &DeviceConfig, target: &SurfaceTarget) -> Result<Self> {
        let hwnd = match target.window {
            RawWindowHandle::Win32(handle) => HWND(handle.hwnd.get() as *mut core::ffi::c_void),
            other => {
                return Err(GraphicsError::DeviceCreation(format!(
                    "DirectX 12 needs a Win32 window handle, got {:?}",
                    other
                ))
                .into())
            }
        };

        unsafe {
            // 1. 调试层
            if config.validation {
                let mut debug: Option<ID3D12Debug> = None;
                match D3D12GetDebugInterface(&mut debug) {
                    Ok(()) => {
                        if let Some(debug) = debug {
                            debug.EnableDebugLayer();
                            debug!("DX12 Debug Layer enabled");
                        }
                    }
                    Err(_) => warn!("Failed to enable DX12 Debug Layer"),
                }
            }

            // 2. DXGI 工厂
            let factory_flags = if config.validation {
                DXGI_CREATE_FACTORY_DEBUG
            } else {
                DXGI_CREATE_FACTORY_FLAGS(0)
            };
            let factory: IDXGIFactory4 =
                CreateDXGIFactory2(factory_flags).map_err(|e| creation_error("create DXGI factory", e))?;

            // 3. 适配器与设备：跳过软件适配器
            let (device, device_name) = create_device(&factory)?;
            info!(device_name = %device_name, "Using device");

            // 4. 命令队列
            let queue_desc = D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                ..Default::default()
            };
            let queue: ID3D12CommandQueue = device
                .CreateCommandQueue(&queue_desc)
                .map_err(|e| creation_error("create command queue", e))?;

            let fence_event =
                CreateEventA(None, false, false, None).map_err(|e| creation_error("create fence event", e))?;
            let idle_fence: ID3D12Fence = device
                .CreateFence(0, D3D12_FENCE_FLAG_NONE)
                .map_err(|e| creation_error("create idle fence", e))?;

            #[cfg(debug_assertions)]
            debug!("DX12 context created");

            Ok(Self {
                factory,
                device,
                queue,
                hwnd,
                device_name,
                fence_event,
                idle_fence,
                idle_value: 0,
            })
        }
    }

    /// 阻塞直到 `fence` 到达 `value`
    pub fn wait(&self, fence: &ID3D12Fence, value: u64) -> Result<()> {
        unsafe {
            let completed = fence.GetCompletedValue();
            // 设备移除后栅栏值变为 u64::MAX
            if completed == u64::MAX {
                return Err(GraphicsError::DeviceLost(format!("{:?}", self.device.GetDeviceRemovedReason())).into());
            }
            if completed < value {
                fence
                    .SetEventOnCompletion(value, self.fence_event)
                    .map_err(|e| GraphicsError::CommandExecution(format!("Failed to set fence event: {:?}", e)))?;
                WaitForSingleObject(self.fence_event, INFINITE);
            }
        }
        Ok(())
    }

    /// 等待队列中的所有工作完成
    pub fn wait_idle(&mut self) -> Result<()> {
        self.idle_value += 1;
        unsafe { self.queue.Signal(&self.idle_fence, self.idle_value) }
            .map_err(|e| GraphicsError::CommandExecution(format!("Failed to signal idle fence: {:?}", e)))?;
        self.wait(&self.idle_fence, self.idle_value)
    }
}

impl Drop for Dx12Context {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            warn!(error = %e, "Failed to drain queue before shutdown");
        }
        unsafe {
            let _ = CloseHandle(self.fence_event);
        }
        debug!("DX12 context destroyed");
    }
}

unsafe fn create_device(factory: &IDXGIFactory4) -> Result<(ID3D12Device, String)> {
    let mut index = 0;
    while let Ok(adapter) = factory.EnumAdapters1(index) {
        index += 1;
        let Ok(desc) = adapter.GetDesc1() else {
            continue;
        };
        if (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) != 0 {
            continue;
        }
        let mut device: Option<ID3D12Device> = None;
        if D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device).is_ok() {
            if let Some(device) = device {
                let len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
                return Ok((device, String::from_utf16_lossy(&desc.Description[..len])));
            }
        }
    }

    // 没有硬件适配器时退回默认适配器
    let mut device: Option<ID3D12Device> = None;
    D3D12CreateDevice(None, D3D_FEATURE_LEVEL_11_0, &mut device).map_err(|e| creation_error("create D3D12 device", e))?;
    device
        .map(|device| (device, "Default adapter".to_string()))
        .ok_or_else(|| GraphicsError::DeviceCreation("D3D12CreateDevice returned no device".to_string()).into())
}
