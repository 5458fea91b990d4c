//! 与后端无关的资源与命令层
//!
//! - `resource` / `heap` / `descriptor`：资源类型、堆子分配、资源视图表
//! - `sync` / `deferred`：栅栏值与按帧延迟销毁
//! - `transition`：资源状态缓存
//! - `shader` / `command`：着色器库与命令缓冲区
//! - `swapchain` / `device` / `render_system`：呈现、设备与帧循环
//!
//! 原生调用都经由 [`crate::gfx::NativeDevice`]。

pub mod command;
pub mod deferred;
pub mod descriptor;
pub mod device;
pub mod heap;
pub mod render_system;
pub mod resource;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod transition;
