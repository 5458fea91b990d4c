//! 日志系统模块
//!
//! 基于 `tracing` 提供结构化的日志记录功能。
//!
//! # 特性
//!
//! - 结构化日志：资源分配、池命中、帧回收等事件都以键值对输出
//! - 灵活输出：支持控制台和按天滚动的文件输出
//! - 日志级别：trace, debug, info, warn, error
//!
//! 帧循环中的高频事件（延迟销毁的执行、状态缓存命中）只在 `trace` 级别输出。

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use std::path::Path;

use super::config::LogLevel;
use super::error::{DistGfxError, Result};

/// 初始化日志系统
///
/// 在程序开始时调用一次。重复调用返回 `DistGfxError::Log`，不会 panic，
/// 因此测试可以随意调用。
///
/// # 参数
///
/// * `level` - 日志级别（`RUST_LOG` 环境变量优先）
/// * `file_output` - 是否输出到文件
/// * `log_file_path` - 日志文件路径（可选，默认为 "dist_gfx.log"）
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let result = if file_output {
        let log_path = log_file_path.unwrap_or("dist_gfx.log");
        let path = Path::new(log_path);
        let directory = path.parent().unwrap_or(Path::new("."));
        let filename = path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("dist_gfx.log");

        // 每天滚动
        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_ansi(true);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
    };

    result.map_err(|e| DistGfxError::Log(e.to_string()))
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// 设备层日志 - Info 级别
#[macro_export]
macro_rules! gfx_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "dist_gfx::device", $($arg)*)
    };
}

/// 设备层日志 - Warn 级别
#[macro_export]
macro_rules! gfx_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "dist_gfx::device", $($arg)*)
    };
}

/// 设备层日志 - Error 级别
#[macro_export]
macro_rules! gfx_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "dist_gfx::device", $($arg)*)
    };
}

/// 致命断言：先写错误日志，再 panic
///
/// 用于容量耗尽与契约违背，这两类错误在本层没有恢复路径。
#[macro_export]
macro_rules! gfx_fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(target: "dist_gfx::device", "{}", message);
        panic!("{}", message);
    }};
}

/// 日志级别转换
impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// 性能追踪宏
///
/// ```ignore
/// let _span = span_trace!("destroy_pooled_objects").entered();
/// ```
#[macro_export]
macro_rules! span_trace {
    ($name:expr) => {
        tracing::span!(tracing::Level::TRACE, $name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(level_directive(LogLevel::Trace), "trace");
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let _ = init_logger(LogLevel::Warn, false, None);
        assert!(init_logger(LogLevel::Warn, false, None).is_err());
    }
}
