//! DirectX 12 根签名与管线状态缓存
//!
//! 根签名由着色器反射推导，每个绑定占一个根参数：
//!
//! | 绑定类型 | 根参数 | 寄存器 |
//! |----------|--------|--------|
//! | 常量缓冲区 | 根 CBV | `b{slot}` |
//! | 存储缓冲区 | 根 UAV | `u{slot}` |
//! | 采样纹理 | 单项 SRV 表 | `t{slot}` |
//! | 存储纹理 | 单项 UAV 表 | `u{slot}` |
//!
//! 推送常量是 `space1` 的根常量，资源视图表是 `space2` 的 SRV 表，
//! 静态采样器固定在 `s0`。

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::rc::Rc;

use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::conversion;
use crate::core::error::{GraphicsError, Result};
use crate::renderer::command::{CompareFunction, PipelineStateDescriptor};
use crate::renderer::resource::{NativeHandle, TextureFormat};
use crate::renderer::shader::{BindingKind, ShaderEntry};

pub const PUSH_CONSTANT_SPACE: u32 = 1;
pub const RESOURCE_VIEW_SPACE: u32 = 2;

pub struct Dx12Shader {
    pub entry: ShaderEntry,
    pub bytecode: Vec<u8>,
}

/// 根签名及其参数布局
pub struct RootLayout {
    pub signature: ID3D12RootSignature,
    /// (绑定槽位, 根参数下标)
    pub bindings: Vec<(u32, u32)>,
    pub push_constants: Option<u32>,
    pub resource_views: u32,
}

impl RootLayout {
    pub fn parameter(&self, slot: u32) -> Option<u32> {
        self.bindings.iter().find(|(s, _)| *s == slot).map(|(_, index)| *index)
    }
}

#[derive(Clone)]
pub struct BoundPipeline {
    pub pso: ID3D12PipelineState,
    pub layout: Rc<RootLayout>,
    pub compute: bool,
    pub topology: D3D_PRIMITIVE_TOPOLOGY,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LayoutKey {
    bindings: Vec<(u32, BindingKind)>,
    push_constant_size: u32,
    compute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GraphicsKey {
    vertex: NativeHandle,
    fragment: NativeHandle,
    state: PipelineStateDescriptor,
    colors: Vec<TextureFormat>,
    depth: Option<TextureFormat>,
    sample_count: u32,
}

pub struct PipelineCache {
    resource_view_capacity: u32,
    layouts: HashMap<LayoutKey, Rc<RootLayout>>,
    graphics: HashMap<GraphicsKey, BoundPipeline>,
    compute: HashMap<NativeHandle, BoundPipeline>,
}

fn bytecode(shader: &Dx12Shader) -> D3D12_SHADER_BYTECODE {
    D3D12_SHADER_BYTECODE {
        pShaderBytecode: shader.bytecode.as_ptr() as *const _,
        BytecodeLength: shader.bytecode.len(),
    }
}

/// 序列化并创建根签名
pub fn create_root_signature(device: &ID3D12Device, desc: &D3D12_ROOT_SIGNATURE_DESC) -> Result<ID3D12RootSignature> {
    unsafe {
        let mut signature = None;
        let mut error = None;
        if let Err(e) = D3D12SerializeRootSignature(desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut signature, Some(&mut error)) {
            let message = error
                .map(|blob: ID3DBlob| {
                    String::from_utf8_lossy(std::slice::from_raw_parts(
                        blob.GetBufferPointer() as *const u8,
                        blob.GetBufferSize(),
                    ))
                    .into_owned()
                })
                .unwrap_or_else(|| format!("{:?}", e));
            return Err(GraphicsError::ResourceCreation(format!("Failed to serialize root signature: {}", message)).into());
        }
        let signature = signature
            .ok_or_else(|| GraphicsError::ResourceCreation("root signature serialization returned nothing".to_string()))?;
        device
            .CreateRootSignature(
                0,
                std::slice::from_raw_parts(signature.GetBufferPointer() as *const u8, signature.GetBufferSize()),
            )
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create root signature: {:?}", e)).into())
    }
}

pub fn linear_sampler(register: u32) -> D3D12_STATIC_SAMPLER_DESC {
    D3D12_STATIC_SAMPLER_DESC {
        Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
        AddressU: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressV: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressW: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        MipLODBias: 0.0,
        MaxAnisotropy: 1,
        ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
        BorderColor: D3D12_STATIC_BORDER_COLOR_OPAQUE_BLACK,
        MinLOD: 0.0,
        MaxLOD: D3D12_FLOAT32_MAX,
        ShaderRegister: register,
        RegisterSpace: 0,
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
    }
}

pub fn descriptor_range(range_type: D3D12_DESCRIPTOR_RANGE_TYPE, count: u32, register: u32, space: u32) -> D3D12_DESCRIPTOR_RANGE {
    D3D12_DESCRIPTOR_RANGE {
        RangeType: range_type,
        NumDescriptors: count,
        BaseShaderRegister: register,
        RegisterSpace: space,
        OffsetInDescriptorsFromTableStart: 0,
    }
}

pub fn table_parameter(range: &D3D12_DESCRIPTOR_RANGE) -> D3D12_ROOT_PARAMETER {
    D3D12_ROOT_PARAMETER {
        ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
        Anonymous: D3D12_ROOT_PARAMETER_0 {
            DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                NumDescriptorRanges: 1,
                pDescriptorRanges: range,
            },
        },
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
    }
}

pub fn constants_parameter(count: u32, register: u32, space: u32) -> D3D12_ROOT_PARAMETER {
    D3D12_ROOT_PARAMETER {
        ParameterType: D3D12_ROOT_PARAMETER_TYPE_32BIT_CONSTANTS,
        Anonymous: D3D12_ROOT_PARAMETER_0 {
            Constants: D3D12_ROOT_CONSTANTS {
                ShaderRegister: register,
                RegisterSpace: space,
                Num32BitValues: count,
            },
        },
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
    }
}

fn root_descriptor(parameter_type: D3D12_ROOT_PARAMETER_TYPE, register: u32) -> D3D12_ROOT_PARAMETER {
    D3D12_ROOT_PARAMETER {
        ParameterType: parameter_type,
        Anonymous: D3D12_ROOT_PARAMETER_0 {
            Descriptor: D3D12_ROOT_DESCRIPTOR {
                ShaderRegister: register,
                RegisterSpace: 0,
            },
        },
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
    }
}

impl PipelineCache {
    pub fn new(resource_view_capacity: u32) -> Self {
        Self {
            resource_view_capacity,
            layouts: HashMap::new(),
            graphics: HashMap::new(),
            compute: HashMap::new(),
        }
    }

    fn layout_for(&mut self, device: &ID3D12Device, shaders: &[&Dx12Shader], compute: bool) -> Result<Rc<RootLayout>> {
        let mut bindings: Vec<(u32, BindingKind)> = Vec::new();
        for shader in shaders {
            for binding in &shader.entry.bindings {
                if !bindings.iter().any(|(slot, _)| *slot == binding.slot) {
                    bindings.push((binding.slot, binding.kind));
                }
            }
        }
        bindings.sort_by_key(|(slot, _)| *slot);
        let push_constant_size = shaders.iter().map(|s| s.entry.push_constant_size).max().unwrap_or(0);
        let key = LayoutKey {
            bindings,
            push_constant_size,
            compute,
        };
        if let Some(layout) = self.layouts.get(&key) {
            return Ok(layout.clone());
        }

        // 描述符范围必须在序列化前保持存活
        let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = key
            .bindings
            .iter()
            .map(|&(slot, kind)| match kind {
                BindingKind::StorageTexture => descriptor_range(D3D12_DESCRIPTOR_RANGE_TYPE_UAV, 1, slot, 0),
                _ => descriptor_range(D3D12_DESCRIPTOR_RANGE_TYPE_SRV, 1, slot, 0),
            })
            .collect();
        let table_range = descriptor_range(D3D12_DESCRIPTOR_RANGE_TYPE_SRV, self.resource_view_capacity, 0, RESOURCE_VIEW_SPACE);

        let mut parameters = Vec::new();
        let mut parameter_of_slot = Vec::new();
        for (index, &(slot, kind)) in key.bindings.iter().enumerate() {
            parameter_of_slot.push((slot, parameters.len() as u32));
            parameters.push(match kind {
                BindingKind::UniformBuffer => root_descriptor(D3D12_ROOT_PARAMETER_TYPE_CBV, slot),
                BindingKind::StorageBuffer => root_descriptor(D3D12_ROOT_PARAMETER_TYPE_UAV, slot),
                BindingKind::SampledTexture | BindingKind::StorageTexture => table_parameter(&ranges[index]),
            });
        }
        let push_constants = (push_constant_size > 0).then(|| {
            parameters.push(constants_parameter(push_constant_size.div_ceil(4), 0, PUSH_CONSTANT_SPACE));
            parameters.len() as u32 - 1
        });
        parameters.push(table_parameter(&table_range));
        let resource_views = parameters.len() as u32 - 1;

        let samplers = [linear_sampler(0)];
        let desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            NumStaticSamplers: samplers.len() as u32,
            pStaticSamplers: samplers.as_ptr(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_NONE,
        };
        let signature = create_root_signature(device, &desc)?;

        let layout = Rc::new(RootLayout {
            signature,
            bindings: parameter_of_slot,
            push_constants,
            resource_views,
        });
        self.layouts.insert(key, layout.clone());
        Ok(layout)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn graphics_pipeline(
        &mut self,
        device: &ID3D12Device,
        (vertex_handle, vertex): (NativeHandle, &Dx12Shader),
        (fragment_handle, fragment): (NativeHandle, &Dx12Shader),
        state: &PipelineStateDescriptor,
        colors: &[TextureFormat],
        depth: Option<TextureFormat>,
        sample_count: u32,
    ) -> Result<BoundPipeline> {
        let key = GraphicsKey {
            vertex: vertex_handle,
            fragment: fragment_handle,
            state: *state,
            colors: colors.to_vec(),
            depth,
            sample_count,
        };
        if let Some(bound) = self.graphics.get(&key) {
            return Ok(bound.clone());
        }

        let layout = self.layout_for(device, &[vertex, fragment], false)?;

        let blend = conversion::render_target_blend(state.blend);
        let depth_enabled = depth.is_some() && state.depth_compare != CompareFunction::Disabled;
        let mut desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            pRootSignature: ManuallyDrop::new(Some(layout.signature.clone())),
            VS: bytecode(vertex),
            PS: bytecode(fragment),
            BlendState: D3D12_BLEND_DESC {
                AlphaToCoverageEnable: false.into(),
                IndependentBlendEnable: false.into(),
                RenderTarget: [blend; 8],
            },
            SampleMask: u32::MAX,
            RasterizerState: D3D12_RASTERIZER_DESC {
                FillMode: D3D12_FILL_MODE_SOLID,
                CullMode: conversion::cull_mode(state.cull_mode),
                FrontCounterClockwise: true.into(),
                DepthClipEnable: true.into(),
                ..Default::default()
            },
            DepthStencilState: D3D12_DEPTH_STENCIL_DESC {
                DepthEnable: depth_enabled.into(),
                DepthWriteMask: if depth_enabled && state.depth_write {
                    D3D12_DEPTH_WRITE_MASK_ALL
                } else {
                    D3D12_DEPTH_WRITE_MASK_ZERO
                },
                DepthFunc: conversion::compare_func(state.depth_compare),
                StencilEnable: false.into(),
                StencilReadMask: 0xFF,
                StencilWriteMask: 0xFF,
                FrontFace: D3D12_DEPTH_STENCILOP_DESC::default(),
                BackFace: D3D12_DEPTH_STENCILOP_DESC::default(),
            },
            PrimitiveTopologyType: conversion::topology_type(state.topology),
            NumRenderTargets: colors.len().min(8) as u32,
            DSVFormat: depth.map(conversion::dxgi_format).unwrap_or(DXGI_FORMAT_UNKNOWN),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: sample_count.max(1),
                Quality: 0,
            },
            ..Default::default()
        };
        for (slot, &format) in desc.RTVFormats.iter_mut().zip(colors) {
            *slot = conversion::dxgi_format(format);
        }

        let pso = unsafe { device.CreateGraphicsPipelineState(&desc) };
        unsafe { ManuallyDrop::drop(&mut desc.pRootSignature) };
        let pso: ID3D12PipelineState =
            pso.map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create graphics PSO: {:?}", e)))?;

        tracing::debug!(
            vertex = %vertex.entry.entry_point,
            fragment = %fragment.entry.entry_point,
            cached = self.graphics.len() + 1,
            "Graphics pipeline created"
        );

        let bound = BoundPipeline {
            pso,
            layout,
            compute: false,
            topology: conversion::primitive_topology(state.topology),
        };
        self.graphics.insert(key, bound.clone());
        Ok(bound)
    }

    pub fn compute_pipeline(&mut self, device: &ID3D12Device, handle: NativeHandle, shader: &Dx12Shader) -> Result<BoundPipeline> {
        if let Some(bound) = self.compute.get(&handle) {
            return Ok(bound.clone());
        }
        let layout = self.layout_for(device, &[shader], true)?;
        let mut desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: ManuallyDrop::new(Some(layout.signature.clone())),
            CS: bytecode(shader),
            ..Default::default()
        };
        let pso = unsafe { device.CreateComputePipelineState(&desc) };
        unsafe { ManuallyDrop::drop(&mut desc.pRootSignature) };
        let pso: ID3D12PipelineState =
            pso.map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create compute PSO: {:?}", e)))?;

        let bound = BoundPipeline {
            pso,
            layout,
            compute: true,
            topology: D3D_PRIMITIVE_TOPOLOGY_UNDEFINED,
        };
        self.compute.insert(handle, bound.clone());
        Ok(bound)
    }

    /// 丢弃引用了 `shader` 的管线
    pub fn evict_shader(&mut self, shader: NativeHandle) {
        self.graphics.retain(|key, _| key.vertex != shader && key.fragment != shader);
        self.compute.remove(&shader);
    }
}
