//! 核心功能模块
//!
//! 与具体图形 API 无关的基础设施：日志、配置、错误处理、事件。
//!
//! # 模块组织
//!
//! - `log`：日志系统，提供结构化的日志记录功能
//! - `config`：配置管理，支持从 TOML 文件加载设置
//! - `error`：错误处理，定义统一的错误类型
//! - `event`：事件系统，窗口与渲染器尺寸变化的分发

pub mod log;
pub mod config;
pub mod error;
pub mod event;

pub use error::{Result, DistGfxError, GraphicsError, ConfigError};
pub use config::{Config, DeviceConfig, GraphicsBackend, GpuExecution, HeadlessConfig, RendererConfig};
pub use event::{
    Event, EventType, EventDispatcher, EventHandler, EventBus,
    WindowResizeEvent, WindowCloseEvent, RendererResizeEvent,
};
