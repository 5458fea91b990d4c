//! 演示用渲染通道

use dist_gfx::core::config::GraphicsBackend;
use dist_gfx::core::error::Result;
use dist_gfx::renderer::command::{ColorAttachment, CommandBuffer, PipelineStateDescriptor, RenderPassDescriptor};
use dist_gfx::renderer::device::GraphicsDevice;
use dist_gfx::renderer::render_system::RenderPass;
use dist_gfx::renderer::shader::{Shader, ShaderEntry, ShaderStage};

const TRIANGLE_VS: &str = "triangle_vs";
const TRIANGLE_FS: &str = "triangle_fs";
const TINT_SIZE: u32 = 16;

/// 用随时间变化的颜色清屏
#[derive(Default)]
pub struct ClearPass {
    frame: u64,
}

impl ClearPass {
    pub fn new() -> Self {
        Self::default()
    }

    fn color(&self) -> [f32; 4] {
        let t = self.frame as f32 * 0.02;
        [0.1 + 0.1 * t.sin().abs(), 0.1, 0.2 + 0.1 * t.cos().abs(), 1.0]
    }
}

impl RenderPass for ClearPass {
    fn name(&self) -> &str {
        "clear"
    }

    fn execute(&mut self, device: &mut GraphicsDevice, cmd: &mut CommandBuffer) -> Result<()> {
        let descriptor = RenderPassDescriptor::new().with_color(ColorAttachment::backbuffer().clear(self.color()));
        cmd.begin_render_pass(device, &descriptor)?;
        cmd.end_render_pass(device)?;
        self.frame += 1;
        Ok(())
    }
}

/// 全屏顶点生成的三角形，颜色来自推送常量
pub struct TrianglePass {
    vertex: Shader,
    fragment: Shader,
    state: PipelineStateDescriptor,
    frame: u64,
}

impl TrianglePass {
    pub fn new(device: &mut GraphicsDevice) -> Result<Self> {
        // headless 不需要字节码，直接登记入口点
        if device.backend_kind() == GraphicsBackend::Headless && device.shader_library().get(TRIANGLE_VS).is_none() {
            device.register_shader(ShaderEntry::new(TRIANGLE_VS, ShaderStage::Vertex));
            device.register_shader(ShaderEntry::new(TRIANGLE_FS, ShaderStage::Fragment).with_push_constants(TINT_SIZE));
        }
        let vertex = device.create_shader(TRIANGLE_VS, ShaderStage::Vertex)?;
        let fragment = device.create_shader(TRIANGLE_FS, ShaderStage::Fragment)?;
        Ok(Self {
            vertex,
            fragment,
            state: PipelineStateDescriptor::default(),
            frame: 0,
        })
    }
}

impl RenderPass for TrianglePass {
    fn name(&self) -> &str {
        "triangle"
    }

    fn execute(&mut self, device: &mut GraphicsDevice, cmd: &mut CommandBuffer) -> Result<()> {
        let size = device.drawable_size();
        cmd.begin_render_pass(device, &RenderPassDescriptor::new().with_color(ColorAttachment::backbuffer()))?;
        cmd.bind_graphics_pipeline(device, &self.state, &self.vertex, &self.fragment)?;
        cmd.set_viewport(device, size)?;

        let pulse = (self.frame as f32 * 0.05).sin() * 0.5 + 0.5;
        let tint = [1.0, pulse, 1.0 - pulse, 1.0f32];
        cmd.set_push_constant(device, bytemuck::cast_slice(&tint))?;
        cmd.draw(device, 3, 1, 0, 0)?;
        cmd.end_render_pass(device)?;
        self.frame += 1;
        Ok(())
    }
}
