//! 通用类型到 Vulkan 类型的转换

use ash::vk;

use crate::gfx::backend::PresentMode;
use crate::renderer::command::{
    BlendMode, CompareFunction, CullMode, LoadAction, PrimitiveTopology, StoreAction,
};
use crate::renderer::resource::{BufferUsage, MemoryType, TextureFormat, TextureUsage};
use crate::renderer::shader::{BindingKind, ShaderStage};
use crate::renderer::transition::ResourceState;

pub fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8_UNorm => vk::Format::R8_UNORM,
        TextureFormat::R8G8_UNorm => vk::Format::R8G8_UNORM,
        TextureFormat::R8G8B8A8_UNorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::R8G8B8A8_SRGB => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::B8G8R8A8_UNorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::B8G8R8A8_SRGB => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::R16G16B16A16_SFloat => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::R32_SFloat => vk::Format::R32_SFLOAT,
        TextureFormat::R32G32_SFloat => vk::Format::R32G32_SFLOAT,
        TextureFormat::R32G32B32A32_SFloat => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::D32_SFloat => vk::Format::D32_SFLOAT,
        TextureFormat::D24_UNorm_S8_UInt => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::D32_SFloat_S8_UInt => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// 表面格式反向映射，不认识的格式丢弃
pub fn surface_format(format: vk::Format) -> Option<TextureFormat> {
    match format {
        vk::Format::B8G8R8A8_UNORM => Some(TextureFormat::B8G8R8A8_UNorm),
        vk::Format::B8G8R8A8_SRGB => Some(TextureFormat::B8G8R8A8_SRGB),
        vk::Format::R8G8B8A8_UNORM => Some(TextureFormat::R8G8B8A8_UNorm),
        vk::Format::R8G8B8A8_SRGB => Some(TextureFormat::R8G8B8A8_SRGB),
        vk::Format::R16G16B16A16_SFLOAT => Some(TextureFormat::R16G16B16A16_SFloat),
        _ => None,
    }
}

pub fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth_stencil() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn texture_usage(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    // blit 与 mip 生成总是可用
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::ATTACHMENT) {
        flags |= if format.is_depth_stencil() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
    }
    flags
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let transfer = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    match usage {
        BufferUsage::Vertex | BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER | transfer,
        BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | transfer,
        BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER | transfer,
        // 命令缓冲区的上传环同时作为常量缓冲区绑定
        BufferUsage::Staging => vk::BufferUsageFlags::UNIFORM_BUFFER | transfer,
    }
}

/// 堆的内存属性，按优先级排列
pub fn memory_properties(memory_type: MemoryType) -> &'static [vk::MemoryPropertyFlags] {
    const GPU: &[vk::MemoryPropertyFlags] = &[vk::MemoryPropertyFlags::DEVICE_LOCAL];
    const SHARED: &[vk::MemoryPropertyFlags] = &[
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::DEVICE_LOCAL.as_raw()
                | vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
                | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
        ),
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
        ),
    ];
    const CPU: &[vk::MemoryPropertyFlags] = &[vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    )];
    const TRANSIENT: &[vk::MemoryPropertyFlags] = &[
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::DEVICE_LOCAL.as_raw() | vk::MemoryPropertyFlags::LAZILY_ALLOCATED.as_raw(),
        ),
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    ];

    match memory_type {
        MemoryType::Gpu => GPU,
        MemoryType::Shared => SHARED,
        MemoryType::Cpu => CPU,
        MemoryType::Transient => TRANSIENT,
    }
}

pub fn sample_count(count: u32) -> vk::SampleCountFlags {
    match count {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
    }
}

pub fn from_present_mode(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        _ => None,
    }
}

pub fn load_op(action: LoadAction) -> vk::AttachmentLoadOp {
    match action {
        LoadAction::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        LoadAction::Load => vk::AttachmentLoadOp::LOAD,
        LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
    }
}

pub fn store_op(action: StoreAction) -> vk::AttachmentStoreOp {
    match action {
        StoreAction::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        StoreAction::Store => vk::AttachmentStoreOp::STORE,
    }
}

pub fn compare_op(function: CompareFunction) -> vk::CompareOp {
    match function {
        CompareFunction::Disabled | CompareFunction::Always => vk::CompareOp::ALWAYS,
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::Off => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::Points => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::Lines => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
    }
}

pub fn blend_attachment(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
    match mode {
        BlendMode::Opaque => state.blend_enable(false),
        BlendMode::Alpha => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
}

pub fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

pub fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::SampledTexture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BindingKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
    }
}

/// 资源状态对应的图像布局
///
/// `COMMON` 作为旧状态时表示内容可丢弃。
pub fn image_layout(state: ResourceState, is_old: bool) -> vk::ImageLayout {
    if state.contains(ResourceState::PRESENT) {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else if state.contains(ResourceState::RENDER_TARGET) {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else if state.contains(ResourceState::DEPTH_WRITE) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if state.contains(ResourceState::UNORDERED_ACCESS) {
        vk::ImageLayout::GENERAL
    } else if state.contains(ResourceState::COPY_DEST) {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else if state.contains(ResourceState::COPY_SOURCE) {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    } else if state.contains(ResourceState::DEPTH_READ) {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else if state.intersects(ResourceState::SHADER_RESOURCE) {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else if is_old {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::GENERAL
    }
}

pub fn access_mask(state: ResourceState) -> vk::AccessFlags {
    let mut access = vk::AccessFlags::empty();
    if state.contains(ResourceState::VERTEX_AND_CONSTANT_BUFFER) {
        access |= vk::AccessFlags::UNIFORM_READ | vk::AccessFlags::SHADER_READ;
    }
    if state.contains(ResourceState::INDEX_BUFFER) {
        access |= vk::AccessFlags::INDEX_READ;
    }
    if state.contains(ResourceState::RENDER_TARGET) {
        access |= vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if state.contains(ResourceState::UNORDERED_ACCESS) {
        access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if state.contains(ResourceState::DEPTH_WRITE) {
        access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if state.contains(ResourceState::DEPTH_READ) {
        access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
    }
    if state.intersects(ResourceState::SHADER_RESOURCE) {
        access |= vk::AccessFlags::SHADER_READ;
    }
    if state.contains(ResourceState::COPY_DEST) {
        access |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if state.contains(ResourceState::COPY_SOURCE) {
        access |= vk::AccessFlags::TRANSFER_READ;
    }
    access
}

pub fn pipeline_stage(state: ResourceState) -> vk::PipelineStageFlags {
    let mut stages = vk::PipelineStageFlags::empty();
    if state.intersects(ResourceState::VERTEX_AND_CONSTANT_BUFFER | ResourceState::NON_PIXEL_SHADER_RESOURCE) {
        stages |= vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if state.contains(ResourceState::INDEX_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if state.contains(ResourceState::RENDER_TARGET) {
        stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    if state.contains(ResourceState::UNORDERED_ACCESS) {
        stages |= vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if state.intersects(ResourceState::DEPTH_WRITE | ResourceState::DEPTH_READ) {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    }
    if state.contains(ResourceState::PIXEL_SHADER_RESOURCE) {
        stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if state.intersects(ResourceState::COPY_DEST | ResourceState::COPY_SOURCE) {
        stages |= vk::PipelineStageFlags::TRANSFER;
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_discards_contents() {
        assert_eq!(image_layout(ResourceState::COMMON, true), vk::ImageLayout::UNDEFINED);
        assert_eq!(image_layout(ResourceState::COMMON, false), vk::ImageLayout::GENERAL);
        assert_eq!(pipeline_stage(ResourceState::COMMON), vk::PipelineStageFlags::empty());
    }

    #[test]
    fn test_layouts_follow_states() {
        assert_eq!(image_layout(ResourceState::PRESENT, false), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            image_layout(ResourceState::PIXEL_SHADER_RESOURCE, false),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(image_layout(ResourceState::COPY_DEST, true), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn test_depth_formats_use_depth_aspect() {
        assert_eq!(aspect_mask(TextureFormat::D32_SFloat), vk::ImageAspectFlags::DEPTH);
        assert!(aspect_mask(TextureFormat::D24_UNorm_S8_UInt).contains(vk::ImageAspectFlags::STENCIL));
        assert!(texture_usage(TextureUsage::ATTACHMENT, TextureFormat::D32_SFloat)
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
    }

    #[test]
    fn test_surface_formats_round_trip() {
        for format in [TextureFormat::B8G8R8A8_UNorm, TextureFormat::R8G8B8A8_SRGB] {
            assert_eq!(surface_format(texture_format(format)), Some(format));
        }
        assert_eq!(surface_format(vk::Format::A2B10G10R10_UNORM_PACK32), None);
    }
}
