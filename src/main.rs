//! dist_gfx 演示程序
//!
//! 打开一个窗口，每帧清屏；着色器库提供 `triangle_vs` / `triangle_fs`
//! 时再画一个三角形。`--headless` 模式不开窗口，渲染固定帧数后退出。
//!
//! ```bash
//! cargo run                      # 按 config.toml 选择后端
//! cargo run -- --dx12            # 命令行覆盖后端
//! cargo run -- --headless --frames 120
//! ```

mod demo;

use std::cell::Cell;
use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use winit::dpi::LogicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::WindowBuilder;

use dist_gfx::core::config::Config;
use dist_gfx::core::event::{EventType, WindowCloseEvent};
use dist_gfx::core::log;
use dist_gfx::gfx::SurfaceTarget;
use dist_gfx::renderer::device::GraphicsDevice;
use dist_gfx::renderer::render_system::RenderSystem;

fn main() {
    if let Err(e) = run() {
        error!("{:#}", e);
        eprintln!("dist_gfx failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    // 配置在日志之前加载
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args().skip(1));
    config.validate().context("invalid configuration")?;

    let log_file = config.logging.file_output.then_some(config.logging.log_file.as_str());
    log::init_logger(config.logging.level, config.logging.file_output, log_file)?;
    info!(version = env!("CARGO_PKG_VERSION"), backend = config.graphics.backend.name(), "dist_gfx starting");

    if config.graphics.backend.needs_window() {
        run_windowed(config)
    } else {
        run_headless(config)
    }
}

fn build_system(device: GraphicsDevice) -> Result<RenderSystem> {
    let mut system = RenderSystem::new(device)?;
    system.add_pass(Box::new(demo::ClearPass::new()));
    match demo::TrianglePass::new(system.device_mut()) {
        Ok(pass) => system.add_pass(Box::new(pass)),
        Err(e) => warn!(error = %e, "Triangle shaders unavailable, clearing only"),
    }
    Ok(system)
}

fn run_headless(config: Config) -> Result<()> {
    let device = GraphicsDevice::create(&config.device_config(), None).context("failed to create headless device")?;
    let mut system = build_system(device)?;

    for _ in 0..config.headless.frames {
        system.render_frame()?;
    }
    let stats = system.device().allocation_stats();
    info!(frames = system.frame_count(), ?stats, "Headless run finished");
    system.shutdown()?;
    Ok(())
}

fn run_windowed(config: Config) -> Result<()> {
    if !config.graphics.backend.is_available() {
        anyhow::bail!("{} backend is not available on this platform", config.graphics.backend.name());
    }

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    let window = WindowBuilder::new()
        .with_title(&config.window.title)
        .with_inner_size(LogicalSize::new(config.window.width, config.window.height))
        .with_resizable(config.window.resizable)
        .build(&event_loop)
        .context("failed to create window")?;

    let mut device_config = config.device_config();
    let size = window.inner_size();
    device_config.drawable_size = (size.width, size.height);

    let surface = SurfaceTarget::from_window(&window)?;
    let device = GraphicsDevice::create(&device_config, Some(surface))
        .with_context(|| format!("failed to create {} device", config.graphics.backend.name()))?;
    let mut system = build_system(device)?;

    // 关闭请求经事件总线分发，订阅者决定是否退出
    let close_requested = Rc::new(Cell::new(false));
    let flag = close_requested.clone();
    system.device_mut().events_mut().subscribe(EventType::WindowClose, move |_| {
        flag.set(true);
        true
    });
    info!("Entering main loop");

    event_loop.run(move |event, target| match event {
        Event::WindowEvent { event, .. } => match event {
            WindowEvent::CloseRequested => {
                let events = system.device_mut().events_mut();
                events.publish(WindowCloseEvent::new());
                events.dispatch_pending();
                if close_requested.get() {
                    info!("Close requested, shutting down");
                    target.exit();
                }
            }
            WindowEvent::Resized(size) => {
                debug!(width = size.width, height = size.height, "Window resized");
                if let Err(e) = system.resize(size.width, size.height) {
                    error!(error = %e, "Resize failed");
                    target.exit();
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = system.render_frame() {
                    error!(error = %e, "Frame failed");
                    target.exit();
                }
            }
            _ => {}
        },
        Event::AboutToWait => window.request_redraw(),
        Event::LoopExiting => {
            if let Err(e) = system.shutdown() {
                error!(error = %e, "Shutdown failed");
            }
        }
        _ => {}
    })?;
    Ok(())
}
