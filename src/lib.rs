//! dist_gfx - 跨后端 GPU 资源生命周期与命令提交层
//!
//! 在 Vulkan、DirectX 12 和 Metal 之上提供统一的资源与命令接口：
//! 堆上的线性子分配、缓冲区与纹理、资源视图表、按帧延迟销毁、
//! 带栅栏的命令缓冲区状态机、资源状态转换缓存以及交换链呈现。
//!
//! # 模块结构
//!
//! - `core`: 日志、配置、错误处理、事件
//! - `renderer`: 与后端无关的资源与命令层
//! - `gfx`: 原生后端（Vulkan / DX12 / Metal / headless）
//!
//! # 使用示例
//!
//! ```no_run
//! use dist_gfx::core::config::DeviceConfig;
//! use dist_gfx::renderer::device::GraphicsDevice;
//! use dist_gfx::renderer::render_system::RenderSystem;
//!
//! let device = GraphicsDevice::create(&DeviceConfig::headless(), None)?;
//! let mut system = RenderSystem::new(device)?;
//! system.render_frame()?;
//! system.shutdown()?;
//! # Ok::<(), dist_gfx::core::error::DistGfxError>(())
//! ```

pub mod core;
pub mod gfx;
pub mod renderer;
