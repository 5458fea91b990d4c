//! 配置管理模块
//!
//! 提供配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [window]
//! width = 1280
//! height = 720
//! title = "DistGfx"
//! resizable = true
//!
//! [graphics]
//! backend = "vulkan"          # vulkan / dx12 / metal / headless
//! vsync = true
//! msaa_samples = 1
//! triple_buffering = true
//! descriptor_capacity = 4096
//! validation = false
//!
//! [headless]
//! min_image_count = 2
//! max_image_count = 3
//! execution = "immediate"     # immediate / on_wait / manual
//! frames = 240
//!
//! [shaders]
//! library = "assets/shaders/library.{backend}.toml"
//!
//! [logging]
//! level = "info"              # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::{ConfigError, Result};

/// 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 窗口配置
    #[serde(default)]
    pub window: WindowConfig,

    /// 图形配置
    #[serde(default)]
    pub graphics: GraphicsConfig,

    /// headless 后端配置
    #[serde(default)]
    pub headless: HeadlessConfig,

    /// 着色器库配置
    #[serde(default)]
    pub shaders: ShaderConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 窗口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// 窗口宽度
    #[serde(default = "default_width")]
    pub width: u32,

    /// 窗口高度
    #[serde(default = "default_height")]
    pub height: u32,

    /// 窗口标题
    #[serde(default = "default_title")]
    pub title: String,

    /// 是否可调整大小
    #[serde(default = "default_resizable")]
    pub resizable: bool,
}

/// 图形配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// 图形后端选择
    #[serde(default = "default_backend")]
    pub backend: GraphicsBackend,

    /// 垂直同步
    #[serde(default = "default_vsync")]
    pub vsync: bool,

    /// MSAA 采样数
    #[serde(default = "default_msaa")]
    pub msaa_samples: u32,

    /// 请求三缓冲（呈现引擎不支持 3 张图像时回退到双缓冲）
    #[serde(default = "default_triple_buffering")]
    pub triple_buffering: bool,

    /// 着色器可见资源视图表的容量
    #[serde(default = "default_descriptor_capacity")]
    pub descriptor_capacity: u32,

    /// 启用后端验证层
    #[serde(default)]
    pub validation: bool,
}

/// 图形后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackend {
    /// Vulkan 后端
    Vulkan,
    /// DirectX 12 后端（仅 Windows）
    Dx12,
    /// Metal 后端（仅 macOS）
    Metal,
    /// 进程内模拟 GPU，不需要显卡
    Headless,
}

/// headless 后端的 GPU 执行模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuExecution {
    /// 提交即完成
    Immediate,
    /// 提交的工作在 CPU 等待其栅栏时才完成
    OnWait,
    /// 仅在 `GpuController` 显式推进时完成
    Manual,
}

/// headless 后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadlessConfig {
    /// 呈现引擎支持的最小图像数
    #[serde(default = "default_min_images")]
    pub min_image_count: u32,

    /// 呈现引擎支持的最大图像数（0 表示无上限）
    #[serde(default = "default_max_images")]
    pub max_image_count: u32,

    /// GPU 执行模型
    #[serde(default = "default_execution")]
    pub execution: GpuExecution,

    /// 演示程序运行的帧数
    #[serde(default = "default_frames")]
    pub frames: u32,
}

/// 着色器库配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShaderConfig {
    /// 着色器清单路径（TOML），`{backend}` 会替换为后端名
    #[serde(default)]
    pub library: Option<PathBuf>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// 渲染器运行时配置
///
/// 对应 `GraphicsDevice::configure`，窗口尺寸之外所有影响交换链的参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererConfig {
    /// 后备缓冲的采样数
    pub sample_count: u32,
    /// 垂直同步
    pub vsync: bool,
    /// 请求三缓冲
    pub triple_buffering_enabled: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            sample_count: 1,
            vsync: true,
            triple_buffering_enabled: true,
        }
    }
}

/// 设备创建参数
///
/// 由 [`Config::device_config`] 生成，也可以在测试中直接构造。
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// 后端
    pub backend: GraphicsBackend,
    /// 应用名（写入原生实例 / 调试名）
    pub application_name: String,
    /// 初始可绘制尺寸
    pub drawable_size: (u32, u32),
    /// 资源视图表容量
    pub descriptor_capacity: u32,
    /// 验证层
    pub validation: bool,
    /// headless 参数
    pub headless: HeadlessConfig,
    /// 着色器清单
    pub shader_library: Option<PathBuf>,
    /// 初始渲染器配置
    pub renderer: RendererConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            application_name: default_title(),
            drawable_size: (default_width(), default_height()),
            descriptor_capacity: default_descriptor_capacity(),
            validation: false,
            headless: HeadlessConfig::default(),
            shader_library: None,
            renderer: RendererConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// headless 后端的默认参数
    pub fn headless() -> Self {
        Self {
            backend: GraphicsBackend::Headless,
            ..Self::default()
        }
    }
}

// 默认值函数
fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_title() -> String { "DistGfx".to_string() }
fn default_resizable() -> bool { true }
fn default_backend() -> GraphicsBackend { GraphicsBackend::Vulkan }
fn default_vsync() -> bool { true }
fn default_msaa() -> u32 { 1 }
fn default_triple_buffering() -> bool { true }
fn default_descriptor_capacity() -> u32 { 4096 }
fn default_min_images() -> u32 { 2 }
fn default_max_images() -> u32 { 3 }
fn default_execution() -> GpuExecution { GpuExecution::Immediate }
fn default_frames() -> u32 { 240 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "dist_gfx.log".to_string() }

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            title: default_title(),
            resizable: default_resizable(),
        }
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            vsync: default_vsync(),
            msaa_samples: default_msaa(),
            triple_buffering: default_triple_buffering(),
            descriptor_capacity: default_descriptor_capacity(),
            validation: false,
        }
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            min_image_count: default_min_images(),
            max_image_count: default_max_images(),
            execution: default_execution(),
            frames: default_frames(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    ///
    /// # 参数
    ///
    /// * `path` - 配置文件路径
    ///
    /// # 返回值
    ///
    /// 成功返回 `Config` 实例，失败返回错误
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在或无法解析则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--vulkan` / `--dx12` / `--metal` / `--headless`: 选择后端
    /// - `--width <value>` / `--height <value>`: 窗口尺寸
    /// - `--no-vsync`: 关闭垂直同步
    /// - `--double-buffering`: 关闭三缓冲
    /// - `--frames <value>`: headless 模式下运行的帧数
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        for (flag, backend) in [
            ("--vulkan", GraphicsBackend::Vulkan),
            ("--dx12", GraphicsBackend::Dx12),
            ("--metal", GraphicsBackend::Metal),
            ("--headless", GraphicsBackend::Headless),
        ] {
            if args.iter().any(|a| a == flag) {
                self.graphics.backend = backend;
            }
        }

        if args.iter().any(|a| a == "--no-vsync") {
            self.graphics.vsync = false;
        }

        if args.iter().any(|a| a == "--double-buffering") {
            self.graphics.triple_buffering = false;
        }

        if let Some(width) = parse_value(&args, "--width") {
            self.window.width = width;
        }

        if let Some(height) = parse_value(&args, "--height") {
            self.window.height = height;
        }

        if let Some(frames) = parse_value(&args, "--frames") {
            self.headless.frames = frames;
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::InvalidValue {
                field: "window.width/height".to_string(),
                reason: "Window dimensions must be greater than 0".to_string(),
            }.into());
        }

        if !matches!(self.graphics.msaa_samples, 1 | 2 | 4 | 8 | 16) {
            return Err(ConfigError::InvalidValue {
                field: "graphics.msaa_samples".to_string(),
                reason: "MSAA samples must be 1, 2, 4, 8, or 16".to_string(),
            }.into());
        }

        if self.graphics.descriptor_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "graphics.descriptor_capacity".to_string(),
                reason: "Descriptor table needs at least one slot".to_string(),
            }.into());
        }

        let headless = &self.headless;
        if headless.min_image_count == 0
            || (headless.max_image_count != 0 && headless.max_image_count < headless.min_image_count)
        {
            return Err(ConfigError::InvalidValue {
                field: "headless.min_image_count/max_image_count".to_string(),
                reason: "Image count range is empty".to_string(),
            }.into());
        }

        Ok(())
    }

    /// 渲染器运行时配置
    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            sample_count: self.graphics.msaa_samples,
            vsync: self.graphics.vsync,
            triple_buffering_enabled: self.graphics.triple_buffering,
        }
    }

    /// 设备创建参数
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            backend: self.graphics.backend,
            application_name: self.window.title.clone(),
            drawable_size: (self.window.width, self.window.height),
            descriptor_capacity: self.graphics.descriptor_capacity,
            validation: self.graphics.validation,
            headless: self.headless.clone(),
            shader_library: self.shader_library_path(),
            renderer: self.renderer_config(),
        }
    }

    /// 当前后端的着色器清单
    ///
    /// headless 不加载字节码，忽略按后端区分的清单。
    pub fn shader_library_path(&self) -> Option<PathBuf> {
        let path = self.shaders.library.as_ref()?.to_string_lossy().into_owned();
        if !path.contains(BACKEND_PLACEHOLDER) {
            return Some(PathBuf::from(path));
        }
        if self.graphics.backend == GraphicsBackend::Headless {
            return None;
        }
        Some(PathBuf::from(path.replace(BACKEND_PLACEHOLDER, self.graphics.backend.key())))
    }
}

const BACKEND_PLACEHOLDER: &str = "{backend}";

fn parse_value<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    let idx = args.iter().position(|a| a == flag)?;
    args.get(idx + 1)?.parse().ok()
}

impl GraphicsBackend {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            GraphicsBackend::Vulkan => "Vulkan",
            GraphicsBackend::Dx12 => "DirectX 12",
            GraphicsBackend::Metal => "Metal",
            GraphicsBackend::Headless => "Headless",
        }
    }

    /// 配置文件与清单路径中使用的小写名
    pub fn key(&self) -> &'static str {
        match self {
            GraphicsBackend::Vulkan => "vulkan",
            GraphicsBackend::Dx12 => "dx12",
            GraphicsBackend::Metal => "metal",
            GraphicsBackend::Headless => "headless",
        }
    }

    /// 当前平台是否编译了该后端
    pub fn is_available(&self) -> bool {
        match self {
            GraphicsBackend::Vulkan | GraphicsBackend::Headless => true,
            GraphicsBackend::Dx12 => cfg!(target_os = "windows"),
            GraphicsBackend::Metal => cfg!(target_os = "macos"),
        }
    }

    /// 是否需要窗口表面才能呈现
    pub fn needs_window(&self) -> bool {
        !matches!(self, GraphicsBackend::Headless)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.backend, GraphicsBackend::Vulkan);
        assert!(config.graphics.triple_buffering);
        assert_eq!(config.graphics.descriptor_capacity, 4096);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.window.width = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.graphics.msaa_samples = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.headless.min_image_count = 4;
        config.headless.max_image_count = 3;
        assert!(config.validate().is_err());

        // max == 0 表示无上限
        config.headless.max_image_count = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(["dist_gfx", "--headless", "--no-vsync", "--double-buffering", "--frames", "12", "--width", "640"]);

        assert_eq!(config.graphics.backend, GraphicsBackend::Headless);
        assert!(!config.graphics.vsync);
        assert!(!config.graphics.triple_buffering);
        assert_eq!(config.headless.frames, 12);
        assert_eq!(config.window.width, 640);
        // 未给出的参数保持原值
        assert_eq!(config.window.height, 720);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            backend = "headless"
            triple_buffering = false

            [headless]
            execution = "on_wait"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.backend, GraphicsBackend::Headless);
        assert_eq!(config.headless.execution, GpuExecution::OnWait);
        assert_eq!(config.window.width, 1280);

        let renderer = config.renderer_config();
        assert!(!renderer.triple_buffering_enabled);
        assert!(renderer.vsync);

        let device = config.device_config();
        assert_eq!(device.backend, GraphicsBackend::Headless);
        assert_eq!(device.drawable_size, (1280, 720));
    }

    #[test]
    fn test_shader_library_backend_placeholder() {
        let mut config = Config::default();
        config.shaders.library = Some(PathBuf::from("assets/shaders/library.{backend}.toml"));

        config.graphics.backend = GraphicsBackend::Dx12;
        assert_eq!(config.shader_library_path(), Some(PathBuf::from("assets/shaders/library.dx12.toml")));

        config.graphics.backend = GraphicsBackend::Headless;
        assert_eq!(config.shader_library_path(), None);

        config.shaders.library = Some(PathBuf::from("shaders.toml"));
        assert_eq!(config.device_config().shader_library, Some(PathBuf::from("shaders.toml")));
    }
}
