//! 命令缓冲区管理模块
//!
//! `CommandBuffer` 把一条原生命令列表的录制、提交与完成等待封装成状态机：
//!
//! ```text
//!   Idle ──begin──▶ Recording ──end──▶ Closed ──commit──▶ Submitted
//!    ▲                                                       │
//!    └──────────── Completed ◀──wait_until_completed─────────┘
//! ```
//!
//! 在错误状态下调用任何操作都返回 `GraphicsError::CommandExecution`，
//! 不会改变状态。对 `Submitted` 的缓冲区调用 `begin` 会先等待其完成。
//!
//! 命令列表本身由 [`CommandPool`] 按帧槽位分配，槽位下一次被复用时整池重置。
//! 每个命令缓冲区另有一块 CPU 暂存堆，堆里只放一个上传缓冲区；常量、
//! 缓冲区数据与纹理数据都按偏移线性写入其中，提交时游标回绕。
//!
//! 需要精确屏障的后端（Vulkan）不允许在渲染通道内录制屏障。通道内绑定的
//! 资源要先用 [`CommandBuffer::use_buffer`] / [`CommandBuffer::use_texture`]
//! 转换到位，否则在通道内需要屏障时直接 panic。

use std::sync::Arc;

use super::device::GraphicsDevice;
use super::heap::{align_up, Heap};
use super::resource::{
    Buffer, BufferDescriptor, BufferUsage, HeapDescriptor, MemoryType, NativeHandle, Size, Texture,
};
use super::shader::{BindingKind, Shader, ShaderBinding, ShaderReflection, ShaderStage};
use super::sync::{FenceManager, FenceValue, FrameFence};
use super::transition::{ResourceState, TransitionPolicy};
use crate::core::error::{DistGfxError, GraphicsError, Result};
use crate::gfx::backend::{
    NativeColorAttachment, NativeCommand, NativeDepthAttachment, NativeDevice, NativeRenderPass, PresentSync,
    Submission,
};
use crate::gfx_fatal;

/// 每个命令缓冲区的上传缓冲区大小
pub const STAGING_HEAP_SIZE: u64 = 4 * 1024 * 1024;

/// 常量与缓冲区上传的起点对齐
pub const UPLOAD_ALIGNMENT: u64 = 256;

/// 纹理上传的起点对齐（`D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT`）
const TEXTURE_UPLOAD_ALIGNMENT: u64 = 512;

/// 纹理上传的行距对齐（`D3D12_TEXTURE_DATA_PITCH_ALIGNMENT`）
pub const TEXTURE_ROW_ALIGNMENT: u64 = 256;

/// 命令缓冲区状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// 初始状态
    Idle,
    /// 正在记录
    Recording,
    /// 已完成记录
    Closed,
    /// 已提交，GPU 可能仍在执行
    Submitted,
    /// 已确认执行完毕
    Completed,
}

/// 附件加载动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadAction {
    DontCare,
    #[default]
    Load,
    Clear,
}

/// 附件存储动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreAction {
    DontCare,
    #[default]
    Store,
}

/// 颜色附件的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentTarget {
    Texture(Texture),
    /// 本帧的交换链图像
    Backbuffer,
}

/// 颜色附件
#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    pub target: AttachmentTarget,
    pub load: LoadAction,
    pub store: StoreAction,
    pub clear_color: [f32; 4],
}

impl ColorAttachment {
    pub fn new(target: AttachmentTarget) -> Self {
        Self {
            target,
            load: LoadAction::Load,
            store: StoreAction::Store,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn backbuffer() -> Self {
        Self::new(AttachmentTarget::Backbuffer)
    }

    pub fn texture(texture: &Texture) -> Self {
        Self::new(AttachmentTarget::Texture(texture.clone()))
    }

    /// 以指定颜色清除
    pub fn clear(mut self, color: [f32; 4]) -> Self {
        self.load = LoadAction::Clear;
        self.clear_color = color;
        self
    }

    pub fn with_store(mut self, store: StoreAction) -> Self {
        self.store = store;
        self
    }
}

/// 深度附件
#[derive(Debug, Clone, PartialEq)]
pub struct DepthAttachment {
    pub texture: Texture,
    pub load: LoadAction,
    pub store: StoreAction,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl DepthAttachment {
    pub fn new(texture: &Texture) -> Self {
        Self {
            texture: texture.clone(),
            load: LoadAction::Clear,
            store: StoreAction::DontCare,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }

    pub fn with_load(mut self, load: LoadAction) -> Self {
        self.load = load;
        self
    }

    pub fn with_store(mut self, store: StoreAction) -> Self {
        self.store = store;
        self
    }
}

/// 渲染通道描述
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassDescriptor {
    pub colors: Vec<ColorAttachment>,
    pub depth: Option<DepthAttachment>,
    /// 渲染区域，为零时取第一个附件的尺寸
    pub size: Size,
    pub sample_count: u32,
}

impl RenderPassDescriptor {
    pub fn new() -> Self {
        Self {
            sample_count: 1,
            ..Self::default()
        }
    }

    pub fn with_color(mut self, attachment: ColorAttachment) -> Self {
        self.colors.push(attachment);
        self
    }

    pub fn with_depth(mut self, attachment: DepthAttachment) -> Self {
        self.depth = Some(attachment);
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = size;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }
}

/// 比较函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunction {
    Disabled,
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// 混合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// `src * a + dst * (1 - a)`
    Alpha,
    /// `src + dst`
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    Off,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    Points,
    Lines,
    LineStrip,
    #[default]
    Triangles,
}

/// 固定功能管线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipelineStateDescriptor {
    pub blend: BlendMode,
    pub depth_compare: CompareFunction,
    pub depth_write: bool,
    pub cull_mode: CullMode,
    pub topology: PrimitiveTopology,
}

/// 绑定的访问方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAccess {
    Read,
    Write,
}

/// blit 的目标
#[derive(Debug, Clone, Copy)]
pub enum BlitTarget<'a> {
    Texture(&'a Texture),
    Backbuffer,
}

/// 绑定所需的原生状态
fn binding_state(stage: ShaderStage, binding: &ShaderBinding, access: ResourceAccess) -> ResourceState {
    match (access, binding.kind) {
        (ResourceAccess::Write, BindingKind::StorageBuffer | BindingKind::StorageTexture) => {
            ResourceState::UNORDERED_ACCESS
        }
        (ResourceAccess::Write, kind) => {
            gfx_fatal!("Binding {} of kind {:?} is read-only but was bound for writing", binding.index, kind)
        }
        (ResourceAccess::Read, BindingKind::UniformBuffer) => ResourceState::VERTEX_AND_CONSTANT_BUFFER,
        (ResourceAccess::Read, _) if stage == ShaderStage::Fragment => ResourceState::PIXEL_SHADER_RESOURCE,
        (ResourceAccess::Read, _) => ResourceState::NON_PIXEL_SHADER_RESOURCE,
    }
}

/// 通道内的只读绑定：资源已处于包含该状态的只读状态时不需要屏障
fn already_readable(current: Option<ResourceState>, state: ResourceState) -> bool {
    matches!(current, Some(current) if current.is_read_only() && state.is_read_only() && current.contains(state))
}

/// 单个帧槽位的命令列表池
#[derive(Debug, Default)]
pub struct CommandPool {
    free: Vec<NativeHandle>,
    used: Vec<NativeHandle>,
    needs_reset: bool,
}

impl CommandPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取一条命令列表：先复用已重置的，再新建
    pub fn acquire(&mut self, native: &mut dyn NativeDevice, frame: u32) -> Result<(NativeHandle, bool)> {
        if self.needs_reset {
            native.reset_command_pool(frame)?;
            self.free.append(&mut self.used);
            self.needs_reset = false;
        }

        let (list, created) = match self.free.pop() {
            Some(list) => (list, false),
            None => (native.create_command_list(frame)?, true),
        };
        self.used.push(list);
        Ok((list, created))
    }

    /// 标记下一次获取前重置
    pub fn mark_for_reset(&mut self) {
        if !self.used.is_empty() {
            self.needs_reset = true;
        }
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub fn len(&self) -> usize {
        self.free.len() + self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 交出全部命令列表（设备空闲后销毁）
    pub fn drain(&mut self) -> Vec<NativeHandle> {
        self.needs_reset = false;
        let mut lists = std::mem::take(&mut self.free);
        lists.append(&mut self.used);
        lists
    }
}

/// 命令缓冲区
///
/// 持有原生对象（栅栏、暂存堆），不实现 `Drop`：
/// 不再使用时调用 [`CommandBuffer::destroy`] 交回设备。
#[derive(Debug)]
pub struct CommandBuffer {
    name: String,
    state: CommandBufferState,
    list: NativeHandle,
    fence: FenceManager,
    staging: Heap,
    upload: Buffer,
    upload_cursor: u64,
    pass: Option<NativeRenderPass>,
    graphics_program: Option<(Shader, Shader)>,
    compute_program: Option<Shader>,
    uses_backbuffer: bool,
}

impl CommandBuffer {
    pub fn new(device: &mut GraphicsDevice, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let fence = FenceManager::new(device.native_mut())?;
        let descriptor = BufferDescriptor::new(STAGING_HEAP_SIZE, BufferUsage::Staging).with_name(format!("{} upload", name));
        let requirements = device.memory_requirements(&descriptor);
        let mut staging = device.create_heap(
            &HeapDescriptor::new(MemoryType::Cpu, requirements.size).with_name(format!("{} staging", name)),
        )?;
        let upload = device.create_buffer(&mut staging, &descriptor)?;

        tracing::debug!(command_buffer = %name, "Command buffer created");
        Ok(Self {
            name,
            state: CommandBufferState::Idle,
            list: NativeHandle::NULL,
            fence,
            staging,
            upload,
            upload_cursor: 0,
            pass: None,
            graphics_program: None,
            compute_program: None,
            uses_backbuffer: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.pass.is_some()
    }

    /// 最后一次提交 signal 的栅栏值
    pub fn last_committed_value(&self) -> FenceValue {
        self.fence.current_value()
    }

    /// 上传缓冲区已用字节
    pub fn staging_used(&self) -> u64 {
        self.upload_cursor
    }

    pub fn upload_buffer(&self) -> &Buffer {
        &self.upload
    }

    fn state_error(&self, operation: &str, expected: &str) -> DistGfxError {
        GraphicsError::CommandExecution(format!(
            "{}: '{}' called in state {:?}, expected {}",
            self.name, operation, self.state, expected
        ))
        .into()
    }

    fn ensure_recording(&self, operation: &str) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            return Err(self.state_error(operation, "Recording"));
        }
        Ok(())
    }

    fn ensure_outside_pass(&self, operation: &str) -> Result<()> {
        self.ensure_recording(operation)?;
        if self.pass.is_some() {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: '{}' is not allowed inside a render pass",
                self.name, operation
            ))
            .into());
        }
        Ok(())
    }

    fn record(&self, device: &mut GraphicsDevice, command: NativeCommand<'_>) -> Result<()> {
        device.native_mut().record(self.list, command)
    }

    /// 把一组资源转换到目标状态，需要时录制屏障
    ///
    /// # Panics
    ///
    /// 精确屏障策略下，渲染通道内需要屏障时 panic。
    fn transition(&self, device: &mut GraphicsDevice, requests: &[(NativeHandle, ResourceState)]) -> Result<()> {
        let in_pass = self.pass.is_some();
        let barriers: Vec<_> = requests
            .iter()
            .filter_map(|&(resource, state)| {
                if in_pass && already_readable(device.resource_states().state_of(resource), state) {
                    return None;
                }
                device.transition(resource, state)
            })
            .collect();
        if barriers.is_empty() {
            return Ok(());
        }
        if in_pass && device.resource_states().policy() == TransitionPolicy::Exact {
            let barrier = barriers[0];
            gfx_fatal!(
                "{}: resource {:?} needs a barrier {:?} -> {:?} inside a render pass, transition it with use_buffer/use_texture before begin_render_pass",
                self.name,
                barrier.resource,
                barrier.before,
                barrier.after
            );
        }
        self.record(device, NativeCommand::Barriers(&barriers))
    }

    // ---- 生命周期 ----

    /// 开始录制
    pub fn begin(&mut self, device: &mut GraphicsDevice) -> Result<()> {
        match self.state {
            CommandBufferState::Idle | CommandBufferState::Completed => {}
            CommandBufferState::Submitted => self.wait_until_completed(device)?,
            _ => return Err(self.state_error("begin", "Idle, Submitted or Completed")),
        }

        self.list = device.acquire_command_list()?;
        device.native_mut().begin_command_list(self.list)?;

        self.pass = None;
        self.graphics_program = None;
        self.compute_program = None;
        self.uses_backbuffer = false;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// 结束录制
    ///
    /// 本次录制用到过后备缓冲时，在这里把它转换到 `PRESENT`。
    pub fn end(&mut self, device: &mut GraphicsDevice) -> Result<()> {
        self.ensure_recording("end")?;
        if self.pass.is_some() {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: 'end' called inside a render pass",
                self.name
            ))
            .into());
        }

        if self.uses_backbuffer {
            if let Some(backbuffer) = device.current_backbuffer() {
                self.transition(device, &[(backbuffer.handle(), ResourceState::PRESENT)])?;
            }
        }

        device.native_mut().end_command_list(self.list)?;
        self.state = CommandBufferState::Closed;
        Ok(())
    }

    /// 提交执行
    pub fn commit(&mut self, device: &mut GraphicsDevice) -> Result<FenceValue> {
        self.submit(device, None).map(|fence| fence.value)
    }

    /// 提交，可附带交换链同步
    pub(crate) fn submit(&mut self, device: &mut GraphicsDevice, present: Option<PresentSync>) -> Result<FrameFence> {
        if self.state != CommandBufferState::Closed {
            return Err(self.state_error("commit", "Closed"));
        }

        let value = self.fence.next_value();
        let submission = Submission {
            command_list: self.list,
            fence: self.fence.fence(),
            signal_value: value.value(),
            present,
        };
        if let Err(e) = device.native_mut().submit(&submission) {
            // 未提交的值不能留在计数器里，否则之后的等待永远不会返回
            self.fence.rollback();
            return Err(e);
        }

        // 上传缓冲区在下一次 begin（会先等待完成）之前不会再写入
        self.upload_cursor = 0;

        self.state = CommandBufferState::Submitted;
        tracing::trace!(command_buffer = %self.name, value = value.value(), "Command buffer committed");
        Ok(FrameFence {
            fence: self.fence.fence(),
            value,
        })
    }

    /// 阻塞直到最后一次提交执行完毕；从未提交过时立即返回
    pub fn wait_until_completed(&mut self, device: &mut GraphicsDevice) -> Result<()> {
        if self.fence.current_value() == FenceValue::ZERO {
            return Ok(());
        }
        self.fence.flush(device.native_mut())?;
        if self.state == CommandBufferState::Submitted {
            self.state = CommandBufferState::Completed;
        }
        Ok(())
    }

    /// GPU 是否已执行完最后一次提交（不阻塞）
    pub fn is_completed(&mut self, device: &GraphicsDevice) -> bool {
        let current = self.fence.current_value();
        self.fence.poll(device.native(), current)
    }

    /// 交回原生对象
    ///
    /// 栅栏与暂存堆走延迟队列，调用前不需要等待完成。
    pub fn destroy(self, device: &mut GraphicsDevice) {
        device.release_buffer(self.upload);
        device.dispose_heap(self.staging);
        let fence = self.fence.fence();
        device.add_pooled_object(super::deferred::PooledObject::custom(move |native| {
            native.destroy_fence(fence)
        }));
    }

    // ---- 状态转换 ----

    /// 在渲染通道开始前把缓冲区转换到通道内要用的状态
    ///
    /// 通道内以同一状态（或它包含的只读状态）绑定时不再产生屏障。
    pub fn use_buffer(&mut self, device: &mut GraphicsDevice, buffer: &Buffer, state: ResourceState) -> Result<()> {
        self.ensure_outside_pass("use_buffer")?;
        self.transition(device, &[(buffer.handle(), state)])
    }

    /// 在渲染通道开始前把纹理转换到通道内要用的状态
    ///
    /// 顶点与片元阶段都要读取时传入两者的并集。
    pub fn use_texture(&mut self, device: &mut GraphicsDevice, texture: &Texture, state: ResourceState) -> Result<()> {
        self.ensure_outside_pass("use_texture")?;
        self.transition(device, &[(texture.handle(), state)])
    }

    // ---- 渲染通道 ----

    pub fn begin_render_pass(&mut self, device: &mut GraphicsDevice, descriptor: &RenderPassDescriptor) -> Result<()> {
        self.ensure_outside_pass("begin_render_pass")?;
        if descriptor.colors.is_empty() && descriptor.depth.is_none() {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: render pass has no attachments",
                self.name
            ))
            .into());
        }

        let mut transitions = Vec::with_capacity(descriptor.colors.len() + 1);
        let mut colors = Vec::with_capacity(descriptor.colors.len());
        for attachment in &descriptor.colors {
            let texture = match &attachment.target {
                AttachmentTarget::Texture(texture) => texture.clone(),
                AttachmentTarget::Backbuffer => {
                    self.uses_backbuffer = true;
                    device.import_backbuffer()?
                }
            };
            transitions.push((texture.handle(), ResourceState::RENDER_TARGET));
            colors.push(NativeColorAttachment {
                texture: texture.handle(),
                view: texture.view(),
                format: texture.descriptor().format,
                load: attachment.load,
                store: attachment.store,
                clear_color: attachment.clear_color,
            });
        }

        let depth = descriptor.depth.as_ref().map(|attachment| {
            let texture = &attachment.texture;
            transitions.push((texture.handle(), ResourceState::DEPTH_WRITE));
            NativeDepthAttachment {
                texture: texture.handle(),
                view: texture.view(),
                format: texture.descriptor().format,
                load: attachment.load,
                store: attachment.store,
                clear_depth: attachment.clear_depth,
                clear_stencil: attachment.clear_stencil,
            }
        });

        let size = if descriptor.size.is_empty() {
            let first_color = descriptor.colors.first().map(|attachment| match &attachment.target {
                AttachmentTarget::Texture(texture) => texture.size(),
                AttachmentTarget::Backbuffer => device.drawable_size(),
            });
            first_color
                .or_else(|| descriptor.depth.as_ref().map(|d| d.texture.size()))
                .unwrap_or(Size::ZERO)
        } else {
            descriptor.size
        };

        self.transition(device, &transitions)?;

        let pass = NativeRenderPass {
            colors,
            depth,
            size,
            sample_count: descriptor.sample_count.max(1),
        };
        self.record(device, NativeCommand::BeginRenderPass(&pass))?;
        self.pass = Some(pass);
        self.graphics_program = None;
        Ok(())
    }

    pub fn end_render_pass(&mut self, device: &mut GraphicsDevice) -> Result<()> {
        self.ensure_recording("end_render_pass")?;
        if self.pass.is_none() {
            return Err(GraphicsError::CommandExecution(format!("{}: not in a render pass", self.name)).into());
        }
        self.record(device, NativeCommand::EndRenderPass)?;
        self.pass = None;
        self.graphics_program = None;
        Ok(())
    }

    // ---- 管线与绑定 ----

    pub fn bind_graphics_pipeline(
        &mut self,
        device: &mut GraphicsDevice,
        state: &PipelineStateDescriptor,
        vertex: &Shader,
        fragment: &Shader,
    ) -> Result<()> {
        self.ensure_recording("bind_graphics_pipeline")?;
        if vertex.stage() != ShaderStage::Vertex || fragment.stage() != ShaderStage::Fragment {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: graphics pipeline needs vertex + fragment, got {} + {}",
                self.name,
                vertex.stage().name(),
                fragment.stage().name()
            ))
            .into());
        }
        let Some(pass) = &self.pass else {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: graphics pipeline bound outside a render pass",
                self.name
            ))
            .into());
        };

        self.record(
            device,
            NativeCommand::BindGraphicsPipeline {
                state,
                vertex,
                fragment,
                pass,
            },
        )?;
        self.graphics_program = Some((vertex.clone(), fragment.clone()));
        Ok(())
    }

    pub fn bind_compute_pipeline(&mut self, device: &mut GraphicsDevice, compute: &Shader) -> Result<()> {
        self.ensure_outside_pass("bind_compute_pipeline")?;
        if compute.stage() != ShaderStage::Compute {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: '{}' is not a compute shader",
                self.name,
                compute.entry_point()
            ))
            .into());
        }
        self.record(device, NativeCommand::BindComputePipeline { compute })?;
        self.compute_program = Some(compute.clone());
        Ok(())
    }

    /// 当前阶段绑定的着色器反射
    fn reflection(&self, stage: ShaderStage) -> Result<Arc<ShaderReflection>> {
        let shader = match (stage, &self.graphics_program, &self.compute_program) {
            (ShaderStage::Vertex, Some((vertex, _)), _) => vertex,
            (ShaderStage::Fragment, Some((_, fragment)), _) => fragment,
            (ShaderStage::Compute, _, Some(compute)) if self.pass.is_none() => compute,
            _ => {
                return Err(GraphicsError::CommandExecution(format!(
                    "{}: no {} shader is bound",
                    self.name,
                    stage.name()
                ))
                .into())
            }
        };
        Ok(shader.reflection.clone())
    }

    fn resolve_binding(&self, stage: ShaderStage, index: u32) -> Result<ShaderBinding> {
        let reflection = self.reflection(stage)?;
        match reflection.resolve(index) {
            Some(binding) => Ok(*binding),
            None => gfx_fatal!(
                "{}: {} shader has no binding with index {}",
                self.name,
                stage.name(),
                index
            ),
        }
    }

    pub fn set_viewport(&mut self, device: &mut GraphicsDevice, size: Size) -> Result<()> {
        self.ensure_recording("set_viewport")?;
        self.record(device, NativeCommand::SetViewport(size))
    }

    pub fn bind_buffer(
        &mut self,
        device: &mut GraphicsDevice,
        stage: ShaderStage,
        index: u32,
        buffer: &Buffer,
        access: ResourceAccess,
    ) -> Result<()> {
        self.ensure_recording("bind_buffer")?;
        let binding = self.resolve_binding(stage, index)?;
        if !binding.kind.is_buffer() {
            gfx_fatal!("{}: binding {} expects a texture, got a buffer", self.name, index);
        }
        self.transition(device, &[(buffer.handle(), binding_state(stage, &binding, access))])?;
        self.record(
            device,
            NativeCommand::BindResource {
                stage,
                binding,
                resource: buffer.handle(),
                view: NativeHandle::NULL,
                resource_view: buffer.resource_view(),
                offset: 0,
                range: buffer.size(),
            },
        )
    }

    pub fn bind_texture(
        &mut self,
        device: &mut GraphicsDevice,
        stage: ShaderStage,
        index: u32,
        texture: &Texture,
        access: ResourceAccess,
    ) -> Result<()> {
        self.ensure_recording("bind_texture")?;
        let binding = self.resolve_binding(stage, index)?;
        if binding.kind.is_buffer() {
            gfx_fatal!("{}: binding {} expects a buffer, got a texture", self.name, index);
        }
        self.transition(device, &[(texture.handle(), binding_state(stage, &binding, access))])?;
        self.record(
            device,
            NativeCommand::BindResource {
                stage,
                binding,
                resource: texture.handle(),
                view: texture.view(),
                resource_view: texture.resource_view(),
                offset: 0,
                range: 0,
            },
        )
    }

    /// 设置推送常量
    ///
    /// # Panics
    ///
    /// 数据超过已绑定着色器声明的推送常量大小时 panic。
    pub fn set_push_constant(&mut self, device: &mut GraphicsDevice, data: &[u8]) -> Result<()> {
        self.ensure_recording("set_push_constant")?;
        let declared = match (&self.graphics_program, &self.compute_program, &self.pass) {
            (Some((vertex, fragment)), _, Some(_)) => {
                vertex.reflection().push_constant_size.max(fragment.reflection().push_constant_size)
            }
            (_, Some(compute), None) => compute.reflection().push_constant_size,
            _ => {
                return Err(GraphicsError::CommandExecution(format!(
                    "{}: push constants set without a bound pipeline",
                    self.name
                ))
                .into())
            }
        };
        if data.len() as u32 > declared {
            gfx_fatal!(
                "{}: {} bytes of push constants exceed the declared {} bytes",
                self.name,
                data.len(),
                declared
            );
        }
        self.record(device, NativeCommand::PushConstants(data))
    }

    /// 在上传缓冲区中预留 `size` 字节，返回起始偏移
    ///
    /// # Panics
    ///
    /// 本次录制的上传超过缓冲区大小时 panic。
    fn reserve(&mut self, size: u64, alignment: u64) -> u64 {
        let offset = align_up(self.upload_cursor, alignment);
        match offset.checked_add(size) {
            Some(end) if end <= self.upload.size() => {
                self.upload_cursor = end;
                offset
            }
            _ => gfx_fatal!(
                "{}: upload buffer is full, {} of {} bytes used, {} requested",
                self.name,
                self.upload_cursor,
                self.upload.size(),
                size
            ),
        }
    }

    /// 把数据写入上传缓冲区，返回偏移
    fn stage(&mut self, device: &mut GraphicsDevice, data: &[u8], reserved: u64) -> Result<u64> {
        let offset = self.reserve(reserved, UPLOAD_ALIGNMENT);
        device.native_mut().write_buffer(self.upload.handle(), offset, data)?;
        Ok(offset)
    }

    /// 上传一块常量数据并绑定到 `index`
    pub fn set_constant_buffer(
        &mut self,
        device: &mut GraphicsDevice,
        stage: ShaderStage,
        index: u32,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_recording("set_constant_buffer")?;
        let binding = self.resolve_binding(stage, index)?;
        if binding.kind != BindingKind::UniformBuffer {
            gfx_fatal!("{}: binding {} is not a uniform buffer", self.name, index);
        }
        let range = align_up(data.len() as u64, UPLOAD_ALIGNMENT);
        let offset = self.stage(device, data, range)?;
        self.record(
            device,
            NativeCommand::BindResource {
                stage,
                binding,
                resource: self.upload.handle(),
                view: NativeHandle::NULL,
                resource_view: self.upload.resource_view(),
                offset,
                range,
            },
        )
    }

    // ---- 绘制与调度 ----

    fn ensure_can_draw(&self, operation: &str) -> Result<()> {
        self.ensure_recording(operation)?;
        if self.pass.is_none() || self.graphics_program.is_none() {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: '{}' needs an active render pass and a bound graphics pipeline",
                self.name, operation
            ))
            .into());
        }
        Ok(())
    }

    pub fn draw(
        &mut self,
        device: &mut GraphicsDevice,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.ensure_can_draw("draw")?;
        self.record(
            device,
            NativeCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed(
        &mut self,
        device: &mut GraphicsDevice,
        index_buffer: &Buffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.ensure_can_draw("draw_indexed")?;
        self.transition(device, &[(index_buffer.handle(), ResourceState::INDEX_BUFFER)])?;
        self.record(
            device,
            NativeCommand::DrawIndexed {
                index_buffer: index_buffer.handle(),
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        )
    }

    pub fn dispatch(&mut self, device: &mut GraphicsDevice, x: u32, y: u32, z: u32) -> Result<()> {
        self.ensure_outside_pass("dispatch")?;
        if self.compute_program.is_none() {
            return Err(GraphicsError::CommandExecution(format!("{}: dispatch without a compute pipeline", self.name)).into());
        }
        self.record(device, NativeCommand::Dispatch { x, y, z })
    }

    // ---- 传输 ----

    pub fn copy_buffer(
        &mut self,
        device: &mut GraphicsDevice,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.ensure_outside_pass("copy_buffer")?;
        let fits = |offset: u64, len: u64| offset.checked_add(size).is_some_and(|end| end <= len);
        if !fits(src_offset, src.size()) || !fits(dst_offset, dst.size()) {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: copy of {} bytes is out of bounds ({} -> {})",
                self.name,
                size,
                src.size(),
                dst.size()
            ))
            .into());
        }
        self.transition(
            device,
            &[
                (src.handle(), ResourceState::COPY_SOURCE),
                (dst.handle(), ResourceState::COPY_DEST),
            ],
        )?;
        self.record(
            device,
            NativeCommand::CopyBuffer {
                src: src.handle(),
                src_offset,
                dst: dst.handle(),
                dst_offset,
                size,
            },
        )
    }

    /// 经上传缓冲区把数据写入任意缓冲区
    pub fn set_buffer_data(&mut self, device: &mut GraphicsDevice, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_outside_pass("set_buffer_data")?;
        let staged = self.stage(device, data, data.len() as u64)?;
        let upload = self.upload.clone();
        self.copy_buffer(device, &upload, staged, buffer, offset, data.len() as u64)
    }

    /// 经上传缓冲区填充纹理第 0 级
    ///
    /// `data` 按行紧密排列；写入上传缓冲区时每行补齐到 [`TEXTURE_ROW_ALIGNMENT`]。
    /// 结束时纹理处于 `COPY_DEST`，之后可以直接生成 mip。
    pub fn set_texture_data(&mut self, device: &mut GraphicsDevice, texture: &Texture, data: &[u8]) -> Result<()> {
        self.ensure_outside_pass("set_texture_data")?;
        let format = texture.descriptor().format;
        if format.is_depth_stencil() || texture.is_backbuffer() {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: texture '{}' cannot be filled from the CPU",
                self.name,
                texture.descriptor().name
            ))
            .into());
        }

        let size = texture.size();
        let row_bytes = size.width as u64 * format.bytes_per_pixel() as u64;
        let expected = row_bytes * size.height as u64;
        if data.len() as u64 != expected {
            return Err(GraphicsError::CommandExecution(format!(
                "{}: texture '{}' of {:?} needs {} bytes, got {}",
                self.name,
                texture.descriptor().name,
                size,
                expected,
                data.len()
            ))
            .into());
        }
        if expected == 0 {
            return Ok(());
        }

        let row_pitch = align_up(row_bytes, TEXTURE_ROW_ALIGNMENT);
        let offset = self.reserve(row_pitch * size.height as u64, TEXTURE_UPLOAD_ALIGNMENT);
        let upload = self.upload.handle();
        if row_pitch == row_bytes {
            device.native_mut().write_buffer(upload, offset, data)?;
        } else {
            for (row, pixels) in data.chunks(row_bytes as usize).enumerate() {
                device.native_mut().write_buffer(upload, offset + row as u64 * row_pitch, pixels)?;
            }
        }

        self.transition(
            device,
            &[
                (upload, ResourceState::COPY_SOURCE),
                (texture.handle(), ResourceState::COPY_DEST),
            ],
        )?;
        self.record(
            device,
            NativeCommand::CopyBufferToTexture {
                src: upload,
                src_offset: offset,
                row_pitch: row_pitch as u32,
                dst: texture.handle(),
                size,
            },
        )
    }

    /// 整图拷贝（带缩放）
    pub fn blit(&mut self, device: &mut GraphicsDevice, src: &Texture, dst: BlitTarget<'_>) -> Result<()> {
        self.ensure_outside_pass("blit")?;
        let dst = match dst {
            BlitTarget::Texture(texture) => texture.clone(),
            BlitTarget::Backbuffer => {
                self.uses_backbuffer = true;
                device.import_backbuffer()?
            }
        };
        self.transition(
            device,
            &[
                (src.handle(), ResourceState::COPY_SOURCE),
                (dst.handle(), ResourceState::COPY_DEST),
            ],
        )?;
        self.record(
            device,
            NativeCommand::Blit {
                src: src.handle(),
                src_size: src.size(),
                dst: dst.handle(),
                dst_size: dst.size(),
            },
        )
    }

    /// 生成完整 mip 链
    ///
    /// 逐级 blit 的后端结束时所有层级都处于 `COPY_SOURCE`。
    pub fn generate_mipmaps(&mut self, device: &mut GraphicsDevice, texture: &Texture) -> Result<()> {
        self.ensure_outside_pass("generate_mipmaps")?;
        if texture.mip_levels() <= 1 {
            return Ok(());
        }
        let by_blit = device.native().info().mipmaps_by_blit;
        if by_blit {
            self.transition(device, &[(texture.handle(), ResourceState::COPY_DEST)])?;
        }
        self.record(
            device,
            NativeCommand::GenerateMipmaps {
                texture: texture.handle(),
                size: texture.size(),
                mip_levels: texture.mip_levels(),
            },
        )?;
        if by_blit {
            device.set_resource_state(texture.handle(), ResourceState::COPY_SOURCE);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{DeviceConfig, GpuExecution};
    use crate::gfx::headless::{GpuController, HeadlessDevice};
    use crate::renderer::resource::{TextureDescriptor, TextureFormat, TextureUsage};
    use crate::renderer::shader::ShaderEntry;

    fn device() -> (GraphicsDevice, GpuController) {
        let mut config = DeviceConfig::headless();
        config.headless.execution = GpuExecution::OnWait;
        config.drawable_size = (64, 64);
        let (native, controller) = HeadlessDevice::new(&config.headless, Size::new(64, 64));
        let mut device = GraphicsDevice::with_native(&config, Box::new(native)).unwrap();
        device.register_shader(
            ShaderEntry::new("vs", ShaderStage::Vertex)
                .with_push_constants(16)
                .with_binding(0, 0, BindingKind::StorageBuffer)
                .with_binding(1, 1, BindingKind::UniformBuffer),
        );
        device.register_shader(
            ShaderEntry::new("fs", ShaderStage::Fragment).with_binding(0, 2, BindingKind::SampledTexture),
        );
        device.register_shader(
            ShaderEntry::new("cs", ShaderStage::Compute).with_binding(0, 0, BindingKind::StorageTexture),
        );
        (device, controller)
    }

    fn color_target(device: &mut GraphicsDevice) -> Texture {
        device
            .create_texture(&TextureDescriptor::texture_2d(
                64,
                64,
                TextureFormat::R8G8B8A8_UNorm,
                TextureUsage::ATTACHMENT | TextureUsage::SAMPLED,
            ))
            .unwrap()
    }

    #[test]
    fn test_state_machine() {
        let (mut device, _) = device();
        let mut cmd = CommandBuffer::new(&mut device, "main").unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Idle);

        // 未录制时不能结束或提交
        assert!(cmd.end(&mut device).is_err());
        assert!(cmd.commit(&mut device).is_err());

        cmd.begin(&mut device).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
        assert!(cmd.begin(&mut device).is_err());

        cmd.end(&mut device).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Closed);
        assert!(cmd.set_viewport(&mut device, Size::new(1, 1)).is_err());

        let value = cmd.commit(&mut device).unwrap();
        assert_eq!(value.value(), 1);
        assert_eq!(cmd.state(), CommandBufferState::Submitted);

        cmd.wait_until_completed(&mut device).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Completed);
        assert!(cmd.is_completed(&device));
    }

    #[test]
    fn test_wait_without_commit_is_noop() {
        let (mut device, _) = device();
        let mut cmd = CommandBuffer::new(&mut device, "idle").unwrap();
        cmd.wait_until_completed(&mut device).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Idle);
    }

    #[test]
    fn test_begin_on_submitted_waits_first() {
        let (mut device, controller) = device();
        let mut cmd = CommandBuffer::new(&mut device, "reuse").unwrap();
        cmd.begin(&mut device).unwrap();
        cmd.end(&mut device).unwrap();
        cmd.commit(&mut device).unwrap();
        assert_eq!(controller.pending(), 1);

        cmd.begin(&mut device).unwrap();
        assert_eq!(controller.pending(), 0);
        assert_eq!(cmd.state(), CommandBufferState::Recording);
    }

    #[test]
    fn test_render_pass_rules() {
        let (mut device, controller) = device();
        let target = color_target(&mut device);
        let vs = device.create_shader("vs", ShaderStage::Vertex).unwrap();
        let fs = device.create_shader("fs", ShaderStage::Fragment).unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "pass").unwrap();
        cmd.begin(&mut device).unwrap();

        // 没有渲染通道时不能绑定图形管线或绘制
        assert!(cmd.bind_graphics_pipeline(&mut device, &PipelineStateDescriptor::default(), &vs, &fs).is_err());
        assert!(cmd.draw(&mut device, 3, 1, 0, 0).is_err());

        let pass = RenderPassDescriptor::new().with_color(ColorAttachment::texture(&target).clear([0.1, 0.2, 0.3, 1.0]));
        cmd.begin_render_pass(&mut device, &pass).unwrap();
        assert!(cmd.begin_render_pass(&mut device, &pass).is_err());
        assert!(cmd.end(&mut device).is_err());
        assert!(cmd.copy_buffer(&mut device, &dummy_buffer(), 0, &dummy_buffer(), 0, 0).is_err());

        cmd.bind_graphics_pipeline(&mut device, &PipelineStateDescriptor::default(), &vs, &fs).unwrap();
        cmd.set_push_constant(&mut device, &[0; 16]).unwrap();
        cmd.draw(&mut device, 3, 1, 0, 0).unwrap();
        cmd.end_render_pass(&mut device).unwrap();
        cmd.end(&mut device).unwrap();

        let commands = controller.take_commands();
        assert_eq!(
            commands,
            vec![
                "barriers",
                "begin_render_pass",
                "bind_graphics_pipeline",
                "push_constants",
                "draw",
                "end_render_pass"
            ]
        );
    }

    fn dummy_buffer() -> Buffer {
        Buffer {
            handle: NativeHandle(999),
            descriptor: BufferDescriptor::new(16, BufferUsage::Storage),
            resource_view: crate::renderer::resource::INVALID_RESOURCE_INDEX,
            heap: NativeHandle::NULL,
            offset: 0,
        }
    }

    #[test]
    fn test_repeated_bind_emits_single_barrier() {
        let (mut device, controller) = device();
        let cs = device.create_shader("cs", ShaderStage::Compute).unwrap();
        let storage = device
            .create_texture(&TextureDescriptor::texture_2d(8, 8, TextureFormat::R32_SFloat, TextureUsage::STORAGE))
            .unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "compute").unwrap();
        cmd.begin(&mut device).unwrap();
        cmd.bind_compute_pipeline(&mut device, &cs).unwrap();
        cmd.bind_texture(&mut device, ShaderStage::Compute, 0, &storage, ResourceAccess::Write).unwrap();
        cmd.bind_texture(&mut device, ShaderStage::Compute, 0, &storage, ResourceAccess::Write).unwrap();
        cmd.dispatch(&mut device, 1, 1, 1).unwrap();
        cmd.end(&mut device).unwrap();

        assert_eq!(controller.counters().barriers, 1);
    }

    #[test]
    #[should_panic(expected = "no binding with index 7")]
    fn test_unknown_binding_index_is_fatal() {
        let (mut device, _) = device();
        let cs = device.create_shader("cs", ShaderStage::Compute).unwrap();
        let storage = device
            .create_texture(&TextureDescriptor::texture_2d(8, 8, TextureFormat::R32_SFloat, TextureUsage::STORAGE))
            .unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "compute").unwrap();
        cmd.begin(&mut device).unwrap();
        cmd.bind_compute_pipeline(&mut device, &cs).unwrap();
        let _ = cmd.bind_texture(&mut device, ShaderStage::Compute, 7, &storage, ResourceAccess::Read);
    }

    #[test]
    #[should_panic(expected = "exceed the declared")]
    fn test_oversized_push_constants_are_fatal() {
        let (mut device, _) = device();
        let target = color_target(&mut device);
        let vs = device.create_shader("vs", ShaderStage::Vertex).unwrap();
        let fs = device.create_shader("fs", ShaderStage::Fragment).unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "pc").unwrap();
        cmd.begin(&mut device).unwrap();
        cmd.begin_render_pass(&mut device, &RenderPassDescriptor::new().with_color(ColorAttachment::texture(&target)))
            .unwrap();
        cmd.bind_graphics_pipeline(&mut device, &PipelineStateDescriptor::default(), &vs, &fs).unwrap();
        let _ = cmd.set_push_constant(&mut device, &[0; 32]);
    }

    #[test]
    fn test_staging_rewinds_on_commit() {
        let (mut device, _) = device();
        let target = color_target(&mut device);
        let vs = device.create_shader("vs", ShaderStage::Vertex).unwrap();
        let fs = device.create_shader("fs", ShaderStage::Fragment).unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "upload").unwrap();

        cmd.begin(&mut device).unwrap();
        cmd.begin_render_pass(&mut device, &RenderPassDescriptor::new().with_color(ColorAttachment::texture(&target)))
            .unwrap();
        cmd.bind_graphics_pipeline(&mut device, &PipelineStateDescriptor::default(), &vs, &fs).unwrap();
        cmd.set_constant_buffer(&mut device, ShaderStage::Vertex, 1, &[7; 64]).unwrap();
        cmd.end_render_pass(&mut device).unwrap();
        assert_eq!(cmd.staging_used(), UPLOAD_ALIGNMENT);

        cmd.end(&mut device).unwrap();
        cmd.commit(&mut device).unwrap();
        assert_eq!(cmd.staging_used(), 0);
        // 上传缓冲区随命令缓冲区常驻，提交不产生释放请求
        assert_eq!(device.pending_pooled_objects(device.frame_index()), 0);
    }

    #[test]
    fn test_constant_uploads_share_one_buffer() {
        let (mut device, controller) = device();
        let target = color_target(&mut device);
        let vs = device.create_shader("vs", ShaderStage::Vertex).unwrap();
        let fs = device.create_shader("fs", ShaderStage::Fragment).unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "constants").unwrap();
        let buffers_before = controller.counters().buffer_creations;

        cmd.begin(&mut device).unwrap();
        cmd.begin_render_pass(&mut device, &RenderPassDescriptor::new().with_color(ColorAttachment::texture(&target)))
            .unwrap();
        cmd.bind_graphics_pipeline(&mut device, &PipelineStateDescriptor::default(), &vs, &fs).unwrap();
        for draw in 0..150u8 {
            cmd.set_constant_buffer(&mut device, ShaderStage::Vertex, 1, &[draw; 64]).unwrap();
            cmd.draw(&mut device, 3, 1, 0, 0).unwrap();
        }
        cmd.end_render_pass(&mut device).unwrap();
        cmd.end(&mut device).unwrap();

        assert_eq!(cmd.staging_used(), 150 * UPLOAD_ALIGNMENT);
        assert_eq!(controller.counters().buffer_creations, buffers_before);
        assert_eq!(controller.counters().draws, 150);
    }

    #[test]
    #[should_panic(expected = "upload buffer is full")]
    fn test_upload_overflow_is_fatal() {
        let (mut device, _) = device();
        let mut heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        let target = device.create_buffer(&mut heap, &BufferDescriptor::new(256, BufferUsage::Storage)).unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "overflow").unwrap();
        cmd.begin(&mut device).unwrap();
        cmd.set_buffer_data(&mut device, &target, 0, &[1; 256]).unwrap();
        let _ = cmd.set_buffer_data(&mut device, &target, 0, &vec![0u8; STAGING_HEAP_SIZE as usize]);
    }

    #[test]
    fn test_texture_upload_pads_rows() {
        let (mut device, controller) = device();
        let texture = device
            .create_texture(&TextureDescriptor::texture_2d(3, 2, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED))
            .unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "texture upload").unwrap();
        cmd.begin(&mut device).unwrap();

        // 长度与纹理不符
        assert!(cmd.set_texture_data(&mut device, &texture, &[0; 20]).is_err());

        let pixels: Vec<u8> = (0..24).collect();
        cmd.set_texture_data(&mut device, &texture, &pixels).unwrap();
        // 两行，每行 12 字节补齐到 256
        assert_eq!(cmd.staging_used(), 2 * TEXTURE_ROW_ALIGNMENT);
        assert_eq!(
            device.resource_states().state_of(texture.handle()),
            Some(ResourceState::COPY_DEST)
        );
        cmd.end(&mut device).unwrap();

        assert_eq!(controller.take_commands(), vec!["barriers", "copy_buffer_to_texture"]);
        assert_eq!(controller.counters().texture_uploads, 1);
    }

    #[test]
    fn test_depth_texture_upload_is_rejected() {
        let (mut device, _) = device();
        let depth = device
            .create_texture(&TextureDescriptor::texture_2d(4, 4, TextureFormat::D32_SFloat, TextureUsage::ATTACHMENT))
            .unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "depth upload").unwrap();
        cmd.begin(&mut device).unwrap();
        assert!(cmd.set_texture_data(&mut device, &depth, &[0; 64]).is_err());
    }

    #[test]
    #[should_panic(expected = "inside a render pass")]
    fn test_barrier_inside_render_pass_is_fatal() {
        let (mut device, _) = device();
        let target = color_target(&mut device);
        let sampled = color_target(&mut device);
        let vs = device.create_shader("vs", ShaderStage::Vertex).unwrap();
        let fs = device.create_shader("fs", ShaderStage::Fragment).unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "late barrier").unwrap();
        cmd.begin(&mut device).unwrap();
        cmd.begin_render_pass(&mut device, &RenderPassDescriptor::new().with_color(ColorAttachment::texture(&target)))
            .unwrap();
        cmd.bind_graphics_pipeline(&mut device, &PipelineStateDescriptor::default(), &vs, &fs).unwrap();
        let _ = cmd.bind_texture(&mut device, ShaderStage::Fragment, 0, &sampled, ResourceAccess::Read);
    }

    #[test]
    fn test_resources_used_in_a_pass_are_transitioned_before_it() {
        let (mut device, controller) = device();
        let shadow = color_target(&mut device);
        let target = color_target(&mut device);
        let mut heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        let indices = device.create_buffer(&mut heap, &BufferDescriptor::new(64, BufferUsage::Index)).unwrap();
        let vs = device.create_shader("vs", ShaderStage::Vertex).unwrap();
        let fs = device.create_shader("fs", ShaderStage::Fragment).unwrap();
        let mut cmd = CommandBuffer::new(&mut device, "two passes").unwrap();
        cmd.begin(&mut device).unwrap();

        // 第一个通道写 shadow
        cmd.begin_render_pass(&mut device, &RenderPassDescriptor::new().with_color(ColorAttachment::texture(&shadow)))
            .unwrap();
        cmd.end_render_pass(&mut device).unwrap();

        let read_anywhere = ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE;
        cmd.use_texture(&mut device, &shadow, read_anywhere).unwrap();
        cmd.use_buffer(&mut device, &indices, ResourceState::INDEX_BUFFER).unwrap();
        cmd.begin_render_pass(&mut device, &RenderPassDescriptor::new().with_color(ColorAttachment::texture(&target)))
            .unwrap();
        controller.take_commands();

        cmd.bind_graphics_pipeline(&mut device, &PipelineStateDescriptor::default(), &vs, &fs).unwrap();
        cmd.bind_texture(&mut device, ShaderStage::Fragment, 0, &shadow, ResourceAccess::Read).unwrap();
        cmd.draw_indexed(&mut device, &indices, 3, 1, 0, 0, 0).unwrap();
        cmd.end_render_pass(&mut device).unwrap();
        assert!(cmd.use_texture(&mut device, &shadow, ResourceState::COPY_SOURCE).is_ok());
        cmd.end(&mut device).unwrap();

        let commands = controller.take_commands();
        let pass = &commands[..commands.iter().position(|c| *c == "end_render_pass").unwrap()];
        assert!(!pass.contains(&"barriers"), "{:?}", pass);
        assert_eq!(device.resource_states().state_of(shadow.handle()), Some(ResourceState::COPY_SOURCE));
    }

    #[test]
    fn test_copy_bounds_checked() {
        let (mut device, _) = device();
        let mut heap = device.create_heap(&HeapDescriptor::new(MemoryType::Gpu, 4096)).unwrap();
        let a = device.create_buffer(&mut heap, &BufferDescriptor::new(128, BufferUsage::Storage)).unwrap();
        let b = device.create_buffer(&mut heap, &BufferDescriptor::new(64, BufferUsage::Storage)).unwrap();

        let mut cmd = CommandBuffer::new(&mut device, "copy").unwrap();
        cmd.begin(&mut device).unwrap();
        assert!(cmd.copy_buffer(&mut device, &a, 0, &b, 0, 128).is_err());
        // 偏移加大小回绕也算越界
        assert!(cmd.copy_buffer(&mut device, &a, u64::MAX - 8, &b, 0, 64).is_err());
        cmd.copy_buffer(&mut device, &a, 64, &b, 0, 64).unwrap();
        cmd.set_buffer_data(&mut device, &b, 0, &[1, 2, 3, 4]).unwrap();
        cmd.end(&mut device).unwrap();
    }

    #[test]
    fn test_command_pool_reuses_lists_after_reset() {
        let (mut device, controller) = device();
        let mut cmd = CommandBuffer::new(&mut device, "pool").unwrap();
        let frames = device.frames_in_flight();

        // 跑两圈帧，每个槽位只应创建一条命令列表
        for _ in 0..frames * 2 {
            cmd.begin(&mut device).unwrap();
            cmd.end(&mut device).unwrap();
            device.present(&mut cmd).unwrap();
        }
        assert_eq!(controller.counters().command_list_creations, frames as u64);
    }
}
