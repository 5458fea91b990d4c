//! 错误处理模块
//!
//! 定义了 GPU 资源层使用的统一错误类型。
//!
//! # 设计原则
//!
//! - 手写 `Display` / `Error` / `From`，不引入额外的派生宏
//! - 后端调用失败时保留原生 API 返回的错误字符串
//! - 容量耗尽与契约违背（槽位表已满、重复释放、着色器反射中不存在的绑定）
//!   不走 `Result`，直接断言终止
//! - 易于模式匹配和错误处理

use std::fmt;

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, DistGfxError>;

/// dist_gfx 的错误类型
#[derive(Debug)]
pub enum DistGfxError {
    /// 配置错误
    Config(ConfigError),

    /// 图形 API 错误
    Graphics(GraphicsError),

    /// IO 错误
    Io(std::io::Error),

    /// 日志系统错误
    Log(String),

    /// 初始化错误
    Initialization(String),

    /// 运行时错误
    Runtime(String),
}

/// 配置相关的错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),

    /// 配置文件解析失败
    ParseError(String),

    /// 配置项缺失
    MissingField(String),

    /// 配置值无效
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
///
/// 字符串负载是后端原生错误信息（`VkResult`、`HRESULT`、Metal 错误描述等）。
#[derive(Debug)]
pub enum GraphicsError {
    /// 设备创建失败
    DeviceCreation(String),

    /// 交换链错误
    SwapchainError(String),

    /// 着色器加载失败
    ShaderCompilation(String),

    /// 资源创建失败
    ResourceCreation(String),

    /// 命令录制或提交失败（包括在错误状态下调用 CommandBuffer）
    CommandExecution(String),

    /// 设备丢失
    DeviceLost(String),
}

impl fmt::Display for DistGfxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistGfxError::Config(e) => write!(f, "Configuration error: {}", e),
            DistGfxError::Graphics(e) => write!(f, "Graphics error: {}", e),
            DistGfxError::Io(e) => write!(f, "IO error: {}", e),
            DistGfxError::Log(msg) => write!(f, "Log error: {}", msg),
            DistGfxError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
            DistGfxError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::MissingField(field) => write!(f, "Missing required field: {}", field),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsError::DeviceCreation(msg) => write!(f, "Device creation failed: {}", msg),
            GraphicsError::SwapchainError(msg) => write!(f, "Swapchain error: {}", msg),
            GraphicsError::ShaderCompilation(msg) => write!(f, "Shader loading failed: {}", msg),
            GraphicsError::ResourceCreation(msg) => write!(f, "Resource creation failed: {}", msg),
            GraphicsError::CommandExecution(msg) => write!(f, "Command execution failed: {}", msg),
            GraphicsError::DeviceLost(msg) => write!(f, "Device lost: {}", msg),
        }
    }
}

impl std::error::Error for DistGfxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DistGfxError::Io(e) => Some(e),
            DistGfxError::Config(e) => Some(e),
            DistGfxError::Graphics(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for GraphicsError {}

// 实现 From trait 以便于错误转换
impl From<std::io::Error> for DistGfxError {
    fn from(err: std::io::Error) -> Self {
        DistGfxError::Io(err)
    }
}

impl From<ConfigError> for DistGfxError {
    fn from(err: ConfigError) -> Self {
        DistGfxError::Config(err)
    }
}

impl From<GraphicsError> for DistGfxError {
    fn from(err: GraphicsError) -> Self {
        DistGfxError::Graphics(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graphics_error_keeps_backend_message() {
        let err: DistGfxError = GraphicsError::ResourceCreation("VK_ERROR_OUT_OF_DEVICE_MEMORY".into()).into();
        let text = err.to_string();
        assert!(text.contains("Resource creation failed"));
        assert!(text.contains("VK_ERROR_OUT_OF_DEVICE_MEMORY"));
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error;

        let err: DistGfxError = ConfigError::MissingField("graphics.backend".into()).into();
        assert!(err.source().is_some());

        let err = DistGfxError::Runtime("boom".into());
        assert!(err.source().is_none());
    }
}
