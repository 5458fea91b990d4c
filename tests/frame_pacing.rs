//! 在途帧节流与呈现重试（headless 后端）

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dist_gfx::core::config::{DeviceConfig, GpuExecution};
use dist_gfx::core::error::Result;
use dist_gfx::gfx::headless::{GpuController, HeadlessDevice};
use dist_gfx::renderer::command::{ColorAttachment, CommandBuffer, RenderPassDescriptor};
use dist_gfx::renderer::device::GraphicsDevice;
use dist_gfx::renderer::render_system::{RenderPass, RenderSystem};
use dist_gfx::renderer::resource::Size;

struct Clear;

impl RenderPass for Clear {
    fn name(&self) -> &str {
        "clear"
    }

    fn execute(&mut self, device: &mut GraphicsDevice, cmd: &mut CommandBuffer) -> Result<()> {
        cmd.begin_render_pass(device, &RenderPassDescriptor::new().with_color(ColorAttachment::backbuffer().clear([0.0; 4])))?;
        cmd.end_render_pass(device)
    }
}

fn system(execution: GpuExecution) -> (RenderSystem, GpuController) {
    let mut config = DeviceConfig {
        drawable_size: (128, 128),
        ..DeviceConfig::headless()
    };
    config.headless.execution = execution;
    let (native, controller) = HeadlessDevice::new(&config.headless, Size::new(128, 128));
    let device = GraphicsDevice::with_native(&config, Box::new(native)).unwrap();
    let mut system = RenderSystem::new(device).unwrap();
    system.add_pass(Box::new(Clear));
    (system, controller)
}

#[test]
fn fourth_frame_waits_for_the_first() {
    let (mut system, controller) = system(GpuExecution::Manual);
    assert_eq!(system.device().frames_in_flight(), 3);

    for _ in 0..3 {
        system.render_frame().unwrap();
    }
    assert_eq!(controller.pending(), 3);

    let released = Arc::new(AtomicBool::new(false));
    let gpu = {
        let controller = controller.clone();
        let released = released.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            controller.complete_next();
        })
    };

    // 槽位 0 的工作完成之前不会返回
    system.render_frame().unwrap();
    assert!(released.load(Ordering::SeqCst));
    gpu.join().unwrap();

    assert_eq!(controller.pending(), 3);
    controller.complete_all();
    system.shutdown().unwrap();
}

#[test]
fn deferred_execution_completes_on_wait() {
    let (mut system, controller) = system(GpuExecution::OnWait);
    for _ in 0..6 {
        system.render_frame().unwrap();
    }
    // 最多三帧在途
    assert!(controller.pending() <= 3);
    assert_eq!(controller.counters().submissions, 6);
    system.shutdown().unwrap();
    assert_eq!(controller.pending(), 0);
}

#[test]
fn out_of_date_surface_is_recreated_and_retried() {
    let (mut system, controller) = system(GpuExecution::Immediate);
    system.render_frame().unwrap();
    let swapchains = controller.counters().swapchain_creations;

    controller.resize_surface(200, 100);
    system.render_frame().unwrap();

    let counters = controller.counters();
    assert_eq!(counters.swapchain_creations, swapchains + 1);
    // 重试后本帧照常呈现
    assert_eq!(counters.presents, 2);
    assert_eq!(system.device().drawable_size(), Size::new(200, 100));
}

#[test]
fn double_buffering_limits_frames_in_flight() {
    let mut config = DeviceConfig {
        drawable_size: (64, 64),
        ..DeviceConfig::headless()
    };
    config.renderer.triple_buffering_enabled = false;
    config.headless.execution = GpuExecution::OnWait;
    let (native, controller) = HeadlessDevice::new(&config.headless, Size::new(64, 64));
    let device = GraphicsDevice::with_native(&config, Box::new(native)).unwrap();
    let mut system = RenderSystem::new(device).unwrap();
    system.add_pass(Box::new(Clear));

    assert_eq!(system.command_buffers().len(), 2);
    for _ in 0..5 {
        system.render_frame().unwrap();
        assert!(controller.pending() <= 2);
    }
}
