//! 通用类型到 Metal 枚举的转换

use metal::{
    MTLBlendFactor, MTLBlendOperation, MTLCompareFunction, MTLCullMode, MTLLoadAction, MTLPixelFormat,
    MTLPrimitiveTopologyClass, MTLPrimitiveType, MTLResourceOptions, MTLStorageMode, MTLStoreAction,
    MTLTextureType, MTLTextureUsage, RenderPipelineColorAttachmentDescriptorRef,
};

use crate::renderer::command::{BlendMode, CompareFunction, CullMode, LoadAction, PrimitiveTopology, StoreAction};
use crate::renderer::resource::{MemoryType, TextureDescriptor, TextureDimension, TextureFormat, TextureUsage};

pub fn pixel_format(format: TextureFormat) -> MTLPixelFormat {
    match format {
        TextureFormat::R8_UNorm => MTLPixelFormat::R8Unorm,
        TextureFormat::R8G8_UNorm => MTLPixelFormat::RG8Unorm,
        TextureFormat::R8G8B8A8_UNorm => MTLPixelFormat::RGBA8Unorm,
        TextureFormat::R8G8B8A8_SRGB => MTLPixelFormat::RGBA8Unorm_sRGB,
        TextureFormat::B8G8R8A8_UNorm => MTLPixelFormat::BGRA8Unorm,
        TextureFormat::B8G8R8A8_SRGB => MTLPixelFormat::BGRA8Unorm_sRGB,
        TextureFormat::R16G16B16A16_SFloat => MTLPixelFormat::RGBA16Float,
        TextureFormat::R32_SFloat => MTLPixelFormat::R32Float,
        TextureFormat::R32G32_SFloat => MTLPixelFormat::RG32Float,
        TextureFormat::R32G32B32A32_SFloat => MTLPixelFormat::RGBA32Float,
        TextureFormat::D32_SFloat => MTLPixelFormat::Depth32Float,
        // Apple GPU 不支持 D24S8
        TextureFormat::D24_UNorm_S8_UInt | TextureFormat::D32_SFloat_S8_UInt => MTLPixelFormat::Depth32Float_Stencil8,
    }
}

pub fn storage_mode(memory_type: MemoryType) -> MTLStorageMode {
    if memory_type.is_host_visible() {
        MTLStorageMode::Shared
    } else {
        MTLStorageMode::Private
    }
}

/// 放置在堆中的缓冲区选项，存储模式必须与堆一致
pub fn resource_options(memory_type: MemoryType) -> MTLResourceOptions {
    let storage = if memory_type.is_host_visible() {
        MTLResourceOptions::StorageModeShared
    } else {
        MTLResourceOptions::StorageModePrivate
    };
    storage | MTLResourceOptions::HazardTrackingModeTracked
}

pub fn texture_type(descriptor: &TextureDescriptor) -> MTLTextureType {
    match descriptor.dimension {
        TextureDimension::Texture2D if descriptor.sample_count > 1 => MTLTextureType::D2Multisample,
        TextureDimension::Texture2D => MTLTextureType::D2,
        TextureDimension::Texture2DArray => MTLTextureType::D2Array,
        TextureDimension::Texture3D => MTLTextureType::D3,
        TextureDimension::TextureCube => MTLTextureType::Cube,
    }
}

pub fn texture_usage(usage: TextureUsage) -> MTLTextureUsage {
    let mut native = MTLTextureUsage::Unknown;
    if usage.contains(TextureUsage::SAMPLED) {
        native |= MTLTextureUsage::ShaderRead;
    }
    if usage.contains(TextureUsage::STORAGE) {
        native |= MTLTextureUsage::ShaderRead | MTLTextureUsage::ShaderWrite;
    }
    if usage.contains(TextureUsage::ATTACHMENT) {
        native |= MTLTextureUsage::RenderTarget;
    }
    native
}

pub fn load_action(load: LoadAction) -> MTLLoadAction {
    match load {
        LoadAction::DontCare => MTLLoadAction::DontCare,
        LoadAction::Load => MTLLoadAction::Load,
        LoadAction::Clear => MTLLoadAction::Clear,
    }
}

pub fn store_action(store: StoreAction) -> MTLStoreAction {
    match store {
        StoreAction::DontCare => MTLStoreAction::DontCare,
        StoreAction::Store => MTLStoreAction::Store,
    }
}

pub fn compare_function(function: CompareFunction) -> MTLCompareFunction {
    match function {
        CompareFunction::Disabled => MTLCompareFunction::Always,
        CompareFunction::Never => MTLCompareFunction::Never,
        CompareFunction::Less => MTLCompareFunction::Less,
        CompareFunction::Equal => MTLCompareFunction::Equal,
        CompareFunction::LessEqual => MTLCompareFunction::LessEqual,
        CompareFunction::Greater => MTLCompareFunction::Greater,
        CompareFunction::NotEqual => MTLCompareFunction::NotEqual,
        CompareFunction::GreaterEqual => MTLCompareFunction::GreaterEqual,
        CompareFunction::Always => MTLCompareFunction::Always,
    }
}

pub fn cull_mode(mode: CullMode) -> MTLCullMode {
    match mode {
        CullMode::Off => MTLCullMode::None,
        CullMode::Front => MTLCullMode::Front,
        CullMode::Back => MTLCullMode::Back,
    }
}

pub fn primitive_type(topology: PrimitiveTopology) -> MTLPrimitiveType {
    match topology {
        PrimitiveTopology::Points => MTLPrimitiveType::Point,
        PrimitiveTopology::Lines => MTLPrimitiveType::Line,
        PrimitiveTopology::LineStrip => MTLPrimitiveType::LineStrip,
        PrimitiveTopology::Triangles => MTLPrimitiveType::Triangle,
    }
}

pub fn topology_class(topology: PrimitiveTopology) -> MTLPrimitiveTopologyClass {
    match topology {
        PrimitiveTopology::Points => MTLPrimitiveTopologyClass::Point,
        PrimitiveTopology::Lines | PrimitiveTopology::LineStrip => MTLPrimitiveTopologyClass::Line,
        PrimitiveTopology::Triangles => MTLPrimitiveTopologyClass::Triangle,
    }
}

pub fn apply_blend(attachment: &RenderPipelineColorAttachmentDescriptorRef, mode: BlendMode) {
    match mode {
        BlendMode::Opaque => attachment.set_blending_enabled(false),
        BlendMode::Alpha => {
            attachment.set_blending_enabled(true);
            attachment.set_rgb_blend_operation(MTLBlendOperation::Add);
            attachment.set_alpha_blend_operation(MTLBlendOperation::Add);
            attachment.set_source_rgb_blend_factor(MTLBlendFactor::SourceAlpha);
            attachment.set_destination_rgb_blend_factor(MTLBlendFactor::OneMinusSourceAlpha);
            attachment.set_source_alpha_blend_factor(MTLBlendFactor::One);
            attachment.set_destination_alpha_blend_factor(MTLBlendFactor::OneMinusSourceAlpha);
        }
        BlendMode::Additive => {
            attachment.set_blending_enabled(true);
            attachment.set_rgb_blend_operation(MTLBlendOperation::Add);
            attachment.set_alpha_blend_operation(MTLBlendOperation::Add);
            attachment.set_source_rgb_blend_factor(MTLBlendFactor::One);
            attachment.set_destination_rgb_blend_factor(MTLBlendFactor::One);
            attachment.set_source_alpha_blend_factor(MTLBlendFactor::One);
            attachment.set_destination_alpha_blend_factor(MTLBlendFactor::One);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stencil_formats_map_to_combined_depth() {
        assert_eq!(pixel_format(TextureFormat::D24_UNorm_S8_UInt), MTLPixelFormat::Depth32Float_Stencil8);
        assert_eq!(pixel_format(TextureFormat::D32_SFloat), MTLPixelFormat::Depth32Float);
    }

    #[test]
    fn test_host_visible_memory_is_shared() {
        assert_eq!(storage_mode(MemoryType::Shared), MTLStorageMode::Shared);
        assert_eq!(storage_mode(MemoryType::Gpu), MTLStorageMode::Private);
    }
}
