//! 原生设备接口
//!
//! 所有图形后端（Vulkan、DirectX 12、Metal、headless）都实现 [`NativeDevice`]。
//! `GraphicsDevice` 在创建时选定一个后端，以 `Box<dyn NativeDevice>` 持有，
//! 之后上层代码不再区分后端。
//!
//! # 句柄
//!
//! 原生对象由后端自己的对象表持有，接口只传递 [`NativeHandle`]。
//! 句柄在对应的 `destroy_*` / `free_*` 调用之前保持有效。
//!
//! # 命令录制
//!
//! 命令以 [`NativeCommand`] 的形式逐条交给 `record`，后端把它翻译成
//! 原生调用。资源状态转换已经由上层解析为显式的 [`Barrier`]，
//! 后端只需按自身规则执行。

use crate::core::config::GraphicsBackend;
use crate::core::error::Result;
use crate::renderer::command::{LoadAction, PipelineStateDescriptor, StoreAction};
use crate::renderer::resource::{
    Buffer, BufferDescriptor, HeapDescriptor, ImTextureId, MemoryRequirements, MemoryType,
    NativeHandle, ShaderResourceIndex, Size, Texture, TextureDescriptor, TextureFormat,
};
use crate::renderer::shader::{Shader, ShaderBinding, ShaderEntry, ShaderStage};
use crate::renderer::transition::{Barrier, TransitionPolicy};

/// 后端的静态信息
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub kind: GraphicsBackend,
    /// 适配器名称
    pub device_name: String,
    /// 描述符表中相邻槽位的字节距离
    pub descriptor_stride: u64,
    pub transition_policy: TransitionPolicy,
    /// mip 链是否通过逐级 blit 生成（需要上层做状态转换）
    pub mipmaps_by_blit: bool,
}

/// 原生纹理：图像本体与其默认视图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeTexture {
    pub handle: NativeHandle,
    pub view: NativeHandle,
}

/// 写入描述符表的资源
#[derive(Debug, Clone, Copy)]
pub enum ViewResource<'a> {
    Buffer(&'a Buffer),
    Texture(&'a Texture),
}

/// 呈现模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
}

/// 呈现引擎的能力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// 0 表示无上限
    pub max_image_count: u32,
    pub formats: Vec<TextureFormat>,
    pub present_modes: Vec<PresentMode>,
    /// 呈现引擎给出的当前尺寸，未知时为 `None`
    pub current_extent: Option<Size>,
}

/// 交换链创建参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDescriptor {
    pub size: Size,
    pub format: TextureFormat,
    pub image_count: u32,
    pub present_mode: PresentMode,
    /// 每个在途帧一套同步对象
    pub frames_in_flight: u32,
}

/// 原生交换链
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSwapchain {
    pub handle: NativeHandle,
    pub images: Vec<NativeTexture>,
}

/// 获取图像的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Acquired(u32),
    /// 交换链与表面不再匹配（含 suboptimal），需要重建
    OutOfDate,
}

/// 呈现的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    OutOfDate,
}

/// 提交时附带的呈现同步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentSync {
    pub swapchain: NativeHandle,
    pub image_index: u32,
    pub frame: u32,
}

/// 一次队列提交
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub command_list: NativeHandle,
    pub fence: NativeHandle,
    /// 执行完成后栅栏被置为该值
    pub signal_value: u64,
    pub present: Option<PresentSync>,
}

/// 解析后的颜色附件
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeColorAttachment {
    pub texture: NativeHandle,
    pub view: NativeHandle,
    pub format: TextureFormat,
    pub load: LoadAction,
    pub store: StoreAction,
    pub clear_color: [f32; 4],
}

/// 解析后的深度附件
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeDepthAttachment {
    pub texture: NativeHandle,
    pub view: NativeHandle,
    pub format: TextureFormat,
    pub load: LoadAction,
    pub store: StoreAction,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

/// 解析后的渲染通道
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRenderPass {
    pub colors: Vec<NativeColorAttachment>,
    pub depth: Option<NativeDepthAttachment>,
    pub size: Size,
    pub sample_count: u32,
}

impl NativeRenderPass {
    pub fn color_formats(&self) -> Vec<TextureFormat> {
        self.colors.iter().map(|c| c.format).collect()
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.depth.map(|d| d.format)
    }
}

/// 录制到命令列表中的一条命令
#[derive(Debug, Clone, Copy)]
pub enum NativeCommand<'a> {
    Barriers(&'a [Barrier]),
    BeginRenderPass(&'a NativeRenderPass),
    EndRenderPass,
    BindGraphicsPipeline {
        state: &'a PipelineStateDescriptor,
        vertex: &'a Shader,
        fragment: &'a Shader,
        pass: &'a NativeRenderPass,
    },
    BindComputePipeline {
        compute: &'a Shader,
    },
    SetViewport(Size),
    BindResource {
        stage: ShaderStage,
        binding: ShaderBinding,
        resource: NativeHandle,
        /// 纹理的图像视图，缓冲区为空句柄
        view: NativeHandle,
        resource_view: ShaderResourceIndex,
        offset: u64,
        range: u64,
    },
    PushConstants(&'a [u8]),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_buffer: NativeHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: NativeHandle,
        src_offset: u64,
        dst: NativeHandle,
        dst_offset: u64,
        size: u64,
    },
    /// 把缓冲区中逐行排列的像素拷贝到纹理第 0 级
    CopyBufferToTexture {
        src: NativeHandle,
        src_offset: u64,
        /// 源数据每行字节数
        row_pitch: u32,
        dst: NativeHandle,
        size: Size,
    },
    Blit {
        src: NativeHandle,
        src_size: Size,
        dst: NativeHandle,
        dst_size: Size,
    },
    GenerateMipmaps {
        texture: NativeHandle,
        size: Size,
        mip_levels: u32,
    },
}

impl NativeCommand<'_> {
    /// 调试输出用的命令名
    pub fn name(&self) -> &'static str {
        match self {
            NativeCommand::Barriers(_) => "barriers",
            NativeCommand::BeginRenderPass(_) => "begin_render_pass",
            NativeCommand::EndRenderPass => "end_render_pass",
            NativeCommand::BindGraphicsPipeline { .. } => "bind_graphics_pipeline",
            NativeCommand::BindComputePipeline { .. } => "bind_compute_pipeline",
            NativeCommand::SetViewport(_) => "set_viewport",
            NativeCommand::BindResource { .. } => "bind_resource",
            NativeCommand::PushConstants(_) => "push_constants",
            NativeCommand::Draw { .. } => "draw",
            NativeCommand::DrawIndexed { .. } => "draw_indexed",
            NativeCommand::Dispatch { .. } => "dispatch",
            NativeCommand::CopyBuffer { .. } => "copy_buffer",
            NativeCommand::CopyBufferToTexture { .. } => "copy_buffer_to_texture",
            NativeCommand::Blit { .. } => "blit",
            NativeCommand::GenerateMipmaps { .. } => "generate_mipmaps",
        }
    }
}

/// 原生设备
///
/// 失败的后端调用返回 `GraphicsError`，负载是原生错误信息。
/// 销毁类调用不返回错误：它们在延迟队列中执行，没有调用者可以处理失败。
pub trait NativeDevice {
    fn info(&self) -> &BackendInfo;

    // ---- 内存 ----

    fn allocate_heap(&mut self, descriptor: &HeapDescriptor) -> Result<NativeHandle>;

    fn free_heap(&mut self, heap: NativeHandle);

    /// 在该类内存堆中放置缓冲区所需的对齐
    fn heap_alignment(&self, memory_type: MemoryType) -> u64;

    fn memory_requirements(&self, descriptor: &BufferDescriptor) -> MemoryRequirements;

    // ---- 资源 ----

    fn create_placed_buffer(
        &mut self,
        heap: NativeHandle,
        offset: u64,
        descriptor: &BufferDescriptor,
    ) -> Result<NativeHandle>;

    fn destroy_buffer(&mut self, buffer: NativeHandle);

    /// 写入 CPU 可见内存中的缓冲区
    fn write_buffer(&mut self, buffer: NativeHandle, offset: u64, data: &[u8]) -> Result<()>;

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<NativeTexture>;

    fn destroy_texture(&mut self, texture: NativeTexture);

    /// 把资源写入描述符表的 `slot`
    fn write_resource_view(&mut self, slot: ShaderResourceIndex, resource: ViewResource<'_>);

    fn im_texture_id(&self, texture: &Texture) -> ImTextureId;

    fn create_shader(&mut self, entry: &ShaderEntry, bytecode: &[u8]) -> Result<NativeHandle>;

    fn destroy_shader(&mut self, shader: NativeHandle);

    // ---- 命令列表 ----

    /// 从帧 `frame` 的命令池分配新的命令列表
    fn create_command_list(&mut self, frame: u32) -> Result<NativeHandle>;

    /// 重置帧 `frame` 的命令池，池中所有命令列表回到初始状态
    fn reset_command_pool(&mut self, frame: u32) -> Result<()>;

    fn destroy_command_list(&mut self, frame: u32, list: NativeHandle);

    fn begin_command_list(&mut self, list: NativeHandle) -> Result<()>;

    fn record(&mut self, list: NativeHandle, command: NativeCommand<'_>) -> Result<()>;

    fn end_command_list(&mut self, list: NativeHandle) -> Result<()>;

    // ---- 同步 ----

    fn create_fence(&mut self) -> Result<NativeHandle>;

    fn destroy_fence(&mut self, fence: NativeHandle);

    fn submit(&mut self, submission: &Submission) -> Result<()>;

    /// GPU 已经到达的栅栏值
    fn completed_value(&self, fence: NativeHandle) -> u64;

    /// 阻塞直到栅栏到达 `value`
    fn wait_fence(&mut self, fence: NativeHandle, value: u64) -> Result<()>;

    fn wait_idle(&mut self) -> Result<()>;

    // ---- 呈现 ----

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities>;

    fn create_swapchain(&mut self, descriptor: &SwapchainDescriptor) -> Result<NativeSwapchain>;

    fn destroy_swapchain(&mut self, swapchain: NativeHandle);

    fn acquire_next_image(&mut self, swapchain: NativeHandle, frame: u32) -> Result<AcquireStatus>;

    fn present(&mut self, swapchain: NativeHandle, image_index: u32, frame: u32) -> Result<PresentStatus>;
}
