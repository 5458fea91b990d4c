//! 帧内临时资源的回收与复用、命令流（headless 后端）

use dist_gfx::core::config::DeviceConfig;
use dist_gfx::core::error::Result;
use dist_gfx::gfx::headless::{GpuController, HeadlessDevice};
use dist_gfx::renderer::command::{
    BlitTarget, ColorAttachment, CommandBuffer, PipelineStateDescriptor, RenderPassDescriptor,
};
use dist_gfx::renderer::device::GraphicsDevice;
use dist_gfx::renderer::heap::align_up;
use dist_gfx::renderer::render_system::{RenderPass, RenderSystem};
use dist_gfx::renderer::resource::{
    BufferDescriptor, BufferUsage, HeapDescriptor, MemoryType, Size, TextureDescriptor, TextureFormat, TextureUsage,
};
use dist_gfx::renderer::shader::{ShaderEntry, ShaderStage};

/// 每帧创建一张带 mip 的纹理，生成 mip 后拷到后备缓冲，再交回
struct TransientTexturePass;

impl RenderPass for TransientTexturePass {
    fn name(&self) -> &str {
        "transient"
    }

    fn execute(&mut self, device: &mut GraphicsDevice, cmd: &mut CommandBuffer) -> Result<()> {
        let descriptor = TextureDescriptor::texture_2d(
            128,
            128,
            TextureFormat::R8G8B8A8_UNorm,
            TextureUsage::SAMPLED | TextureUsage::ATTACHMENT,
        )
        .with_mip_map(true);
        let texture = device.create_texture(&descriptor)?;
        cmd.generate_mipmaps(device, &texture)?;
        cmd.blit(device, &texture, BlitTarget::Backbuffer)?;
        device.release_texture(texture);
        Ok(())
    }
}

/// 上传常量并画一个三角形
struct TrianglePass;

impl RenderPass for TrianglePass {
    fn name(&self) -> &str {
        "triangle"
    }

    fn execute(&mut self, device: &mut GraphicsDevice, cmd: &mut CommandBuffer) -> Result<()> {
        let vertex = device.create_shader("triangle_vs", ShaderStage::Vertex)?;
        let fragment = device.create_shader("triangle_fs", ShaderStage::Fragment)?;
        let size = device.drawable_size();

        cmd.begin_render_pass(device, &RenderPassDescriptor::new().with_color(ColorAttachment::backbuffer()))?;
        cmd.bind_graphics_pipeline(device, &PipelineStateDescriptor::default(), &vertex, &fragment)?;
        cmd.set_viewport(device, size)?;
        cmd.set_push_constant(device, &[0u8; 16])?;
        cmd.draw(device, 3, 1, 0, 0)?;
        cmd.end_render_pass(device)
    }
}

fn system(passes: Vec<Box<dyn RenderPass>>) -> (RenderSystem, GpuController) {
    let config = DeviceConfig {
        drawable_size: (256, 256),
        ..DeviceConfig::headless()
    };
    let (native, controller) = HeadlessDevice::new(&config.headless, Size::new(256, 256));
    let mut device = GraphicsDevice::with_native(&config, Box::new(native)).unwrap();
    device.register_shader(ShaderEntry::new("triangle_vs", ShaderStage::Vertex));
    device.register_shader(ShaderEntry::new("triangle_fs", ShaderStage::Fragment).with_push_constants(16));

    let mut system = RenderSystem::new(device).unwrap();
    for pass in passes {
        system.add_pass(pass);
    }
    (system, controller)
}

#[test]
fn transient_textures_are_recycled_once_their_frame_returns() {
    let (mut system, controller) = system(vec![Box::new(TransientTexturePass)]);

    // 三个槽位各自持有一张纹理，之后每帧都命中池
    for _ in 0..3 {
        system.render_frame().unwrap();
    }
    let warm = controller.counters().texture_creations;
    for _ in 0..9 {
        system.render_frame().unwrap();
    }

    assert_eq!(controller.counters().texture_creations, warm);
    assert_eq!(system.device().allocation_stats().texture_pool_hits, 9);
    assert_eq!(controller.counters().texture_destructions, 0);

    let commands = controller.take_commands();
    assert!(commands.contains(&"generate_mipmaps"));
    assert!(commands.contains(&"blit"));

    system.shutdown().unwrap();
    let counters = controller.counters();
    assert_eq!(counters.texture_creations, counters.texture_destructions);
}

#[test]
fn triangle_pass_records_a_draw() {
    let (mut system, controller) = system(vec![Box::new(TrianglePass)]);
    system.render_frame().unwrap();
    system.render_frame().unwrap();

    let commands = controller.take_commands();
    let draw = commands.iter().position(|c| *c == "draw").unwrap();
    let bind = commands.iter().position(|c| *c == "bind_graphics_pipeline").unwrap();
    let push = commands.iter().position(|c| *c == "push_constants").unwrap();
    assert!(bind < push && push < draw);
    assert_eq!(controller.counters().draws, 2);
    // 着色器只创建一次
    assert_eq!(system.device().allocation_stats().shaders_created, 2);
}

#[test]
fn uploads_land_in_gpu_buffers() {
    let config = DeviceConfig {
        drawable_size: (64, 64),
        ..DeviceConfig::headless()
    };
    let (native, controller) = HeadlessDevice::new(&config.headless, Size::new(64, 64));
    let mut device = GraphicsDevice::with_native(&config, Box::new(native)).unwrap();

    let mut heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 1 << 16)).unwrap();
    let a = device.create_buffer(&mut heap, &BufferDescriptor::new(100, BufferUsage::Storage)).unwrap();
    let b = device.create_buffer(&mut heap, &BufferDescriptor::new(100, BufferUsage::Storage)).unwrap();
    // 线性分配，偏移按对齐推进
    assert_eq!(a.offset(), 0);
    assert_eq!(b.offset(), align_up(100, heap.alignment()));
    assert_eq!(heap.stack_ptr(), b.offset() + 100);

    let mut cmd = CommandBuffer::new(&mut device, "upload").unwrap();
    cmd.begin(&mut device).unwrap();
    cmd.set_buffer_data(&mut device, &a, 0, &[7u8; 100]).unwrap();
    cmd.copy_buffer(&mut device, &a, 0, &b, 0, 100).unwrap();
    assert!(cmd.copy_buffer(&mut device, &a, 50, &b, 0, 100).is_err());
    cmd.end(&mut device).unwrap();
    cmd.commit(&mut device).unwrap();
    cmd.wait_until_completed(&mut device).unwrap();

    let commands = controller.take_commands();
    assert_eq!(commands.iter().filter(|c| **c == "copy_buffer").count(), 2);

    device.release_buffer(a);
    device.release_buffer(b);
    device.release_heap(heap);
    cmd.destroy(&mut device);
    device.shutdown().unwrap();
    assert_eq!(controller.counters().heap_allocations, controller.counters().heap_frees);
}
