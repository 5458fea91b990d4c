//! 渲染系统
//!
//! 驱动每一帧：
//!
//! 1. 等待当前帧槽位上一次使用的命令缓冲区完成
//! 2. 执行该槽位积累的延迟释放请求
//! 3. 录制所有渲染通道
//! 4. 提交并呈现，帧索引前进
//!
//! 每个帧槽位一个命令缓冲区，第 N 帧开始前第 N − frames_in_flight 帧必已完成。

use super::command::CommandBuffer;
use super::device::GraphicsDevice;
use super::resource::Size;
use super::sync::FenceValue;
use crate::core::config::RendererConfig;
use crate::core::error::Result;
use crate::gfx_info;

/// 一个渲染通道
///
/// 由渲染系统在每帧的录制阶段按添加顺序调用。
pub trait RenderPass {
    fn name(&self) -> &str;

    /// 录制本通道的命令
    fn execute(&mut self, device: &mut GraphicsDevice, cmd: &mut CommandBuffer) -> Result<()>;

    /// 可绘制尺寸变化后调用，用于重建尺寸相关的资源
    fn on_resize(&mut self, _device: &mut GraphicsDevice, _size: Size) -> Result<()> {
        Ok(())
    }

    /// 关闭前交回持有的资源
    fn release(&mut self, _device: &mut GraphicsDevice) {}
}

/// 渲染系统
pub struct RenderSystem {
    device: GraphicsDevice,
    command_buffers: Vec<CommandBuffer>,
    passes: Vec<Box<dyn RenderPass>>,
    frame_count: u64,
    drawable_size: Size,
}

impl RenderSystem {
    pub fn new(mut device: GraphicsDevice) -> Result<Self> {
        let frames = device.frames_in_flight();
        let command_buffers = (0..frames)
            .map(|frame| CommandBuffer::new(&mut device, format!("frame {}", frame)))
            .collect::<Result<Vec<_>>>()?;
        let drawable_size = device.drawable_size();

        gfx_info!(frames_in_flight = frames, "Render system created");
        Ok(Self {
            device,
            command_buffers,
            passes: Vec::new(),
            frame_count: 0,
            drawable_size,
        })
    }

    pub fn device(&self) -> &GraphicsDevice {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut GraphicsDevice {
        &mut self.device
    }

    pub fn add_pass(&mut self, pass: Box<dyn RenderPass>) {
        tracing::debug!(pass = pass.name(), "Render pass added");
        self.passes.push(pass);
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// 已呈现的帧数
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn command_buffers(&self) -> &[CommandBuffer] {
        &self.command_buffers
    }

    /// 渲染一帧，返回本帧提交的栅栏值
    pub fn render_frame(&mut self) -> Result<FenceValue> {
        let frame = self.device.frame_index();
        let device = &mut self.device;
        let cmd = &mut self.command_buffers[frame as usize];

        cmd.wait_until_completed(device)?;
        device.destroy_pooled_objects_for_frame(frame);

        cmd.begin(device)?;
        for pass in self.passes.iter_mut() {
            let _span = tracing::trace_span!("render_pass", pass = pass.name()).entered();
            pass.execute(device, cmd)?;
        }
        cmd.end(device)?;
        let value = device.present(cmd)?;

        self.frame_count += 1;
        self.after_frame()?;
        Ok(value)
    }

    /// 呈现之后：交换链可能被原地重建，通知通道并分发事件
    fn after_frame(&mut self) -> Result<()> {
        let size = self.device.drawable_size();
        if size != self.drawable_size {
            self.drawable_size = size;
            self.notify_resize(size)?;
        }
        self.device.events_mut().dispatch_pending();
        Ok(())
    }

    fn notify_resize(&mut self, size: Size) -> Result<()> {
        for pass in self.passes.iter_mut() {
            pass.on_resize(&mut self.device, size)?;
        }
        Ok(())
    }

    fn wait_all(&mut self) -> Result<()> {
        for cmd in self.command_buffers.iter_mut() {
            cmd.wait_until_completed(&mut self.device)?;
        }
        Ok(())
    }

    /// 按新的在途帧数增减命令缓冲区
    fn sync_command_buffers(&mut self) -> Result<()> {
        let frames = self.device.frames_in_flight() as usize;
        while self.command_buffers.len() > frames {
            if let Some(cmd) = self.command_buffers.pop() {
                cmd.destroy(&mut self.device);
            }
        }
        while self.command_buffers.len() < frames {
            let name = format!("frame {}", self.command_buffers.len());
            let cmd = CommandBuffer::new(&mut self.device, name)?;
            self.command_buffers.push(cmd);
        }
        Ok(())
    }

    /// 窗口尺寸变化
    ///
    /// 任一边为 0 时忽略。
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.wait_all()?;
        self.device.destroy_size_dependent_resources()?;
        self.device.resize(width, height)?;
        self.sync_command_buffers()?;

        self.drawable_size = self.device.drawable_size();
        self.notify_resize(self.drawable_size)?;
        self.device.events_mut().dispatch_pending();
        Ok(())
    }

    /// 应用新的渲染器配置（垂直同步、三缓冲）
    pub fn configure(&mut self, config: RendererConfig) -> Result<()> {
        self.wait_all()?;
        self.device.configure(config)?;
        self.sync_command_buffers()?;

        self.drawable_size = self.device.drawable_size();
        self.notify_resize(self.drawable_size)?;
        self.device.events_mut().dispatch_pending();
        Ok(())
    }

    /// 等待所有在途帧，交回通道与命令缓冲区的资源，关闭设备
    pub fn shutdown(&mut self) -> Result<()> {
        if self.device.is_shut_down() {
            return Ok(());
        }
        self.wait_all()?;
        for pass in self.passes.iter_mut() {
            pass.release(&mut self.device);
        }
        for cmd in self.command_buffers.drain(..) {
            cmd.destroy(&mut self.device);
        }
        self.device.shutdown()?;
        gfx_info!(frames = self.frame_count, "Render system shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DeviceConfig;
    use crate::gfx::headless::{GpuController, HeadlessDevice};
    use crate::renderer::command::{ColorAttachment, RenderPassDescriptor};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        executed: u32,
        resized: Vec<Size>,
        released: bool,
    }

    struct ClearPass(Rc<RefCell<Log>>);

    impl RenderPass for ClearPass {
        fn name(&self) -> &str {
            "clear"
        }

        fn execute(&mut self, device: &mut GraphicsDevice, cmd: &mut CommandBuffer) -> Result<()> {
            self.0.borrow_mut().executed += 1;
            let pass = RenderPassDescriptor::new().with_color(ColorAttachment::backbuffer().clear([0.0, 0.0, 0.0, 1.0]));
            cmd.begin_render_pass(device, &pass)?;
            cmd.end_render_pass(device)
        }

        fn on_resize(&mut self, _device: &mut GraphicsDevice, size: Size) -> Result<()> {
            self.0.borrow_mut().resized.push(size);
            Ok(())
        }

        fn release(&mut self, _device: &mut GraphicsDevice) {
            self.0.borrow_mut().released = true;
        }
    }

    fn system() -> (RenderSystem, GpuController, Rc<RefCell<Log>>) {
        let config = DeviceConfig {
            drawable_size: (256, 256),
            ..DeviceConfig::headless()
        };
        let (native, controller) = HeadlessDevice::new(&config.headless, Size::new(256, 256));
        let device = GraphicsDevice::with_native(&config, Box::new(native)).unwrap();
        let mut system = RenderSystem::new(device).unwrap();
        let log = Rc::new(RefCell::new(Log::default()));
        system.add_pass(Box::new(ClearPass(log.clone())));
        (system, controller, log)
    }

    #[test]
    fn test_frames_cycle_through_slots() {
        let (mut system, controller, log) = system();
        assert_eq!(system.command_buffers().len(), 3);

        for expected in [1u32, 2, 0, 1] {
            system.render_frame().unwrap();
            assert_eq!(system.device().frame_index(), expected);
        }
        assert_eq!(system.frame_count(), 4);
        assert_eq!(log.borrow().executed, 4);

        let counters = controller.counters();
        assert_eq!(counters.submissions, 4);
        assert_eq!(counters.presents, 4);
        // 每个槽位一条命令列表
        assert_eq!(counters.command_list_creations, 3);
    }

    #[test]
    fn test_surface_change_notifies_passes() {
        let (mut system, controller, log) = system();
        system.render_frame().unwrap();

        controller.resize_surface(300, 200);
        system.render_frame().unwrap();
        assert_eq!(system.device().drawable_size(), Size::new(300, 200));
        assert_eq!(log.borrow().resized, vec![Size::new(300, 200)]);
    }

    #[test]
    fn test_resize_and_configure_rebuild_frame_slots() {
        let (mut system, _, log) = system();
        system.render_frame().unwrap();

        system.configure(RendererConfig {
            triple_buffering_enabled: false,
            ..RendererConfig::default()
        })
        .unwrap();
        assert_eq!(system.device().frames_in_flight(), 2);
        assert_eq!(system.command_buffers().len(), 2);
        assert_eq!(system.device().frame_index(), 0);

        system.resize(0, 100).unwrap();
        assert_eq!(log.borrow().resized.len(), 1);

        system.render_frame().unwrap();
        system.render_frame().unwrap();
        assert_eq!(system.device().frame_index(), 0);
    }

    #[test]
    fn test_shutdown_releases_passes() {
        let (mut system, _, log) = system();
        system.render_frame().unwrap();
        system.shutdown().unwrap();
        assert!(log.borrow().released);
        assert!(system.device().is_shut_down());
        system.shutdown().unwrap();
    }
}
