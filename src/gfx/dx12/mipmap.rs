//! compute 着色器生成 mip 链
//!
//! D3D12 没有 blit，逐级下采样由一个内置的 compute 着色器完成。
//! 着色器在设备创建时用 `D3DCompile` 编译。

use std::mem::ManuallyDrop;

use windows::core::s;
use windows::Win32::Graphics::Direct3D::Fxc::D3DCompile;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;

use super::pipeline::{constants_parameter, create_root_signature, descriptor_range, linear_sampler, table_parameter};
use crate::core::error::{GraphicsError, Result};

const DOWNSAMPLE_HLSL: &str = r#"
cbuffer Params : register(b0) { float2 texel_size; };
Texture2D<float4> source : register(t0);
RWTexture2D<float4> destination : register(u0);
SamplerState bilinear : register(s0);

[numthreads(8, 8, 1)]
void CSMain(uint3 id : SV_DispatchThreadID)
{
    float2 uv = texel_size * (float2(id.xy) + 0.5);
    destination[id.xy] = source.SampleLevel(bilinear, uv, 0);
}
"#;

pub const GROUP_SIZE: u32 = 8;

pub struct MipGenerator {
    pub signature: ID3D12RootSignature,
    pub pso: ID3D12PipelineState,
}

impl MipGenerator {
    /// 根参数：0 = 纹素尺寸常量，1 = 源 SRV 表，2 = 目标 UAV 表
    pub fn new(device: &ID3D12Device) -> Result<Self> {
        let srv = descriptor_range(D3D12_DESCRIPTOR_RANGE_TYPE_SRV, 1, 0, 0);
        let uav = descriptor_range(D3D12_DESCRIPTOR_RANGE_TYPE_UAV, 1, 0, 0);
        let parameters = [constants_parameter(2, 0, 0), table_parameter(&srv), table_parameter(&uav)];
        let samplers = [linear_sampler(0)];
        let desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            NumStaticSamplers: samplers.len() as u32,
            pStaticSamplers: samplers.as_ptr(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_NONE,
        };
        let signature = create_root_signature(device, &desc)?;

        let blob = compile_downsample()?;
        let mut pso_desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: ManuallyDrop::new(Some(signature.clone())),
            CS: unsafe {
                D3D12_SHADER_BYTECODE {
                    pShaderBytecode: blob.GetBufferPointer(),
                    BytecodeLength: blob.GetBufferSize(),
                }
            },
            ..Default::default()
        };
        let pso = unsafe { device.CreateComputePipelineState(&pso_desc) };
        unsafe { ManuallyDrop::drop(&mut pso_desc.pRootSignature) };
        let pso: ID3D12PipelineState =
            pso.map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create mip generation PSO: {:?}", e)))?;

        Ok(Self { signature, pso })
    }
}

fn compile_downsample() -> Result<ID3DBlob> {
    unsafe {
        let mut code = None;
        let mut error_blob = None;
        let result = D3DCompile(
            DOWNSAMPLE_HLSL.as_ptr() as _,
            DOWNSAMPLE_HLSL.len(),
            None,
            None,
            None,
            s!("CSMain"),
            s!("cs_5_0"),
            0,
            0,
            &mut code,
            Some(&mut error_blob),
        );
        if let Err(e) = result {
            let message = error_blob
                .map(|error: ID3DBlob| {
                    String::from_utf8_lossy(std::slice::from_raw_parts(
                        error.GetBufferPointer() as *const u8,
                        error.GetBufferSize(),
                    ))
                    .into_owned()
                })
                .unwrap_or_else(|| format!("{:?}", e));
            return Err(GraphicsError::ShaderCompilation(format!("Mip generation shader: {}", message)).into());
        }
        code.ok_or_else(|| GraphicsError::ShaderCompilation("D3DCompile returned no bytecode".to_string()).into())
    }
}
