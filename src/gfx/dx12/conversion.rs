//! 通用类型到 D3D12 / DXGI 类型的转换

use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::renderer::command::{BlendMode, CompareFunction, CullMode, PrimitiveTopology};
use crate::renderer::resource::{MemoryType, TextureFormat, TextureUsage};
use crate::renderer::transition::ResourceState;

pub fn dxgi_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::R8_UNorm => DXGI_FORMAT_R8_UNORM,
        TextureFormat::R8G8_UNorm => DXGI_FORMAT_R8G8_UNORM,
        TextureFormat::R8G8B8A8_UNorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::R8G8B8A8_SRGB => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        TextureFormat::B8G8R8A8_UNorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        TextureFormat::B8G8R8A8_SRGB => DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        TextureFormat::R16G16B16A16_SFloat => DXGI_FORMAT_R16G16B16A16_FLOAT,
        TextureFormat::R32_SFloat => DXGI_FORMAT_R32_FLOAT,
        TextureFormat::R32G32_SFloat => DXGI_FORMAT_R32G32_FLOAT,
        TextureFormat::R32G32B32A32_SFloat => DXGI_FORMAT_R32G32B32A32_FLOAT,
        TextureFormat::D32_SFloat => DXGI_FORMAT_D32_FLOAT,
        TextureFormat::D24_UNorm_S8_UInt => DXGI_FORMAT_D24_UNORM_S8_UINT,
        TextureFormat::D32_SFloat_S8_UInt => DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
    }
}

/// 深度格式采样时使用的视图格式
pub fn srv_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::D32_SFloat => DXGI_FORMAT_R32_FLOAT,
        TextureFormat::D24_UNorm_S8_UInt => DXGI_FORMAT_R24_UNORM_X8_TYPELESS,
        TextureFormat::D32_SFloat_S8_UInt => DXGI_FORMAT_R32_FLOAT_X8X24_TYPELESS,
        other => dxgi_format(other),
    }
}

/// 格式能否作为类型化 UAV（compute 生成 mip 链所需）
pub fn supports_typed_uav(format: TextureFormat) -> bool {
    !format.is_depth_stencil() && !format.is_srgb()
}

pub fn heap_type(memory_type: MemoryType) -> D3D12_HEAP_TYPE {
    match memory_type {
        MemoryType::Gpu | MemoryType::Transient => D3D12_HEAP_TYPE_DEFAULT,
        MemoryType::Shared | MemoryType::Cpu => D3D12_HEAP_TYPE_UPLOAD,
    }
}

pub fn texture_flags(usage: TextureUsage, format: TextureFormat, use_mip_map: bool) -> D3D12_RESOURCE_FLAGS {
    let mut flags = D3D12_RESOURCE_FLAG_NONE;
    if usage.contains(TextureUsage::ATTACHMENT) {
        flags |= if format.is_depth_stencil() {
            D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL
        } else {
            D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET
        };
    }
    if usage.contains(TextureUsage::STORAGE) || (use_mip_map && supports_typed_uav(format)) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }
    if format.is_depth_stencil() && !usage.contains(TextureUsage::SAMPLED) {
        flags |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
    }
    flags
}

pub fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    let mut result = D3D12_RESOURCE_STATE_COMMON;
    let table = [
        (ResourceState::VERTEX_AND_CONSTANT_BUFFER, D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER),
        (ResourceState::INDEX_BUFFER, D3D12_RESOURCE_STATE_INDEX_BUFFER),
        (ResourceState::RENDER_TARGET, D3D12_RESOURCE_STATE_RENDER_TARGET),
        (ResourceState::UNORDERED_ACCESS, D3D12_RESOURCE_STATE_UNORDERED_ACCESS),
        (ResourceState::DEPTH_WRITE, D3D12_RESOURCE_STATE_DEPTH_WRITE),
        (ResourceState::DEPTH_READ, D3D12_RESOURCE_STATE_DEPTH_READ),
        (ResourceState::NON_PIXEL_SHADER_RESOURCE, D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE),
        (ResourceState::PIXEL_SHADER_RESOURCE, D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE),
        (ResourceState::COPY_DEST, D3D12_RESOURCE_STATE_COPY_DEST),
        (ResourceState::COPY_SOURCE, D3D12_RESOURCE_STATE_COPY_SOURCE),
        (ResourceState::PRESENT, D3D12_RESOURCE_STATE_PRESENT),
    ];
    for (flag, native) in table {
        if state.contains(flag) {
            result |= native;
        }
    }
    result
}

pub fn compare_func(function: CompareFunction) -> D3D12_COMPARISON_FUNC {
    match function {
        CompareFunction::Disabled | CompareFunction::Always => D3D12_COMPARISON_FUNC_ALWAYS,
        CompareFunction::Never => D3D12_COMPARISON_FUNC_NEVER,
        CompareFunction::Less => D3D12_COMPARISON_FUNC_LESS,
        CompareFunction::Equal => D3D12_COMPARISON_FUNC_EQUAL,
        CompareFunction::LessEqual => D3D12_COMPARISON_FUNC_LESS_EQUAL,
        CompareFunction::Greater => D3D12_COMPARISON_FUNC_GREATER,
        CompareFunction::NotEqual => D3D12_COMPARISON_FUNC_NOT_EQUAL,
        CompareFunction::GreaterEqual => D3D12_COMPARISON_FUNC_GREATER_EQUAL,
    }
}

pub fn cull_mode(mode: CullMode) -> D3D12_CULL_MODE {
    match mode {
        CullMode::Off => D3D12_CULL_MODE_NONE,
        CullMode::Front => D3D12_CULL_MODE_FRONT,
        CullMode::Back => D3D12_CULL_MODE_BACK,
    }
}

pub fn topology_type(topology: PrimitiveTopology) -> D3D12_PRIMITIVE_TOPOLOGY_TYPE {
    match topology {
        PrimitiveTopology::Points => D3D12_PRIMITIVE_TOPOLOGY_TYPE_POINT,
        PrimitiveTopology::Lines | PrimitiveTopology::LineStrip => D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
        PrimitiveTopology::Triangles => D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
    }
}

pub fn primitive_topology(topology: PrimitiveTopology) -> D3D_PRIMITIVE_TOPOLOGY {
    match topology {
        PrimitiveTopology::Points => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        PrimitiveTopology::Lines => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        PrimitiveTopology::LineStrip => D3D_PRIMITIVE_TOPOLOGY_LINESTRIP,
        PrimitiveTopology::Triangles => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
    }
}

pub fn render_target_blend(mode: BlendMode) -> D3D12_RENDER_TARGET_BLEND_DESC {
    let write_mask = D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8;
    match mode {
        BlendMode::Opaque => D3D12_RENDER_TARGET_BLEND_DESC {
            BlendEnable: false.into(),
            LogicOpEnable: false.into(),
            RenderTargetWriteMask: write_mask,
            ..Default::default()
        },
        BlendMode::Alpha => D3D12_RENDER_TARGET_BLEND_DESC {
            BlendEnable: true.into(),
            LogicOpEnable: false.into(),
            SrcBlend: D3D12_BLEND_SRC_ALPHA,
            DestBlend: D3D12_BLEND_INV_SRC_ALPHA,
            BlendOp: D3D12_BLEND_OP_ADD,
            SrcBlendAlpha: D3D12_BLEND_ONE,
            DestBlendAlpha: D3D12_BLEND_INV_SRC_ALPHA,
            BlendOpAlpha: D3D12_BLEND_OP_ADD,
            LogicOp: D3D12_LOGIC_OP_NOOP,
            RenderTargetWriteMask: write_mask,
        },
        BlendMode::Additive => D3D12_RENDER_TARGET_BLEND_DESC {
            BlendEnable: true.into(),
            LogicOpEnable: false.into(),
            SrcBlend: D3D12_BLEND_ONE,
            DestBlend: D3D12_BLEND_ONE,
            BlendOp: D3D12_BLEND_OP_ADD,
            SrcBlendAlpha: D3D12_BLEND_ONE,
            DestBlendAlpha: D3D12_BLEND_ONE,
            BlendOpAlpha: D3D12_BLEND_OP_ADD,
            LogicOp: D3D12_LOGIC_OP_NOOP,
            RenderTargetWriteMask: write_mask,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_state_combines_read_states() {
        let state = resource_state(ResourceState::SHADER_RESOURCE);
        assert_eq!(
            state,
            D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE | D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE
        );
        assert_eq!(resource_state(ResourceState::COMMON), D3D12_RESOURCE_STATE_COMMON);
    }

    #[test]
    fn test_mip_textures_get_uav_when_format_allows() {
        let flags = texture_flags(TextureUsage::SAMPLED, TextureFormat::R8G8B8A8_UNorm, true);
        assert!(flags.contains(D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS));
        let flags = texture_flags(TextureUsage::SAMPLED, TextureFormat::R8G8B8A8_SRGB, true);
        assert!(!flags.contains(D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS));
    }
}
