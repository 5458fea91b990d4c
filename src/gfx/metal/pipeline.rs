//! Metal 着色器库与管线状态缓存
//!
//! Metal 没有管线布局，绑定槽位直接对应各阶段的参数表：缓冲区槽位
//! 是 `[[buffer(n)]]`，纹理槽位是 `[[texture(n)]]`。推送常量固定在
//! `[[buffer(30)]]`，默认线性采样器在 `[[sampler(0)]]`。

use std::collections::HashMap;

use metal::{
    CompileOptions, ComputePipelineState, DepthStencilDescriptor, DepthStencilState, Device, Function, Library,
    MTLCullMode, MTLPixelFormat, MTLPrimitiveType, RenderPipelineDescriptor, RenderPipelineState,
};

use super::conversion;
use crate::core::error::{GraphicsError, Result};
use crate::renderer::command::{CompareFunction, PipelineStateDescriptor};
use crate::renderer::resource::{NativeHandle, TextureFormat};
use crate::renderer::shader::ShaderEntry;

pub const PUSH_CONSTANT_INDEX: u64 = 30;

/// metallib 文件头
const METALLIB_MAGIC: &[u8] = b"MTLB";

pub struct MetalShader {
    pub entry: ShaderEntry,
    /// 持有库以保证函数有效
    _library: Library,
    pub function: Function,
}

impl MetalShader {
    /// 字节码可以是 metallib，也可以是 MSL 源码（运行时编译）
    pub fn new(device: &Device, entry: &ShaderEntry, bytecode: &[u8]) -> Result<Self> {
        let library = if bytecode.starts_with(METALLIB_MAGIC) {
            device.new_library_with_data(bytecode)
        } else {
            let source = std::str::from_utf8(bytecode).map_err(|e| {
                GraphicsError::ShaderCompilation(format!("'{}' is neither metallib nor UTF-8 MSL: {}", entry.entry_point, e))
            })?;
            device.new_library_with_source(source, &CompileOptions::new())
        }
        .map_err(|e| GraphicsError::ShaderCompilation(format!("'{}': {}", entry.entry_point, e)))?;

        let function = library
            .get_function(&entry.entry_point, None)
            .map_err(|e| GraphicsError::ShaderCompilation(format!("entry point '{}' not found: {}", entry.entry_point, e)))?;

        Ok(Self {
            entry: entry.clone(),
            _library: library,
            function,
        })
    }
}

#[derive(Clone)]
pub enum BoundPipeline {
    Graphics {
        pipeline: RenderPipelineState,
        depth_stencil: DepthStencilState,
        cull_mode: MTLCullMode,
        primitive: MTLPrimitiveType,
    },
    Compute(ComputePipelineState),
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

#[derive(Default)]
pub struct PipelineCache {
    graphics: HashMap<GraphicsKey, BoundPipeline>,
    compute: HashMap<NativeHandle, BoundPipeline>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn graphics_pipeline(
        &mut self,
        device: &Device,
        (vertex_handle, vertex): (NativeHandle, &MetalShader),
        (fragment_handle, fragment): (NativeHandle, &MetalShader),
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

        let descriptor = RenderPipelineDescriptor::new();
        descriptor.set_vertex_function(Some(&vertex.function));
        descriptor.set_fragment_function(Some(&fragment.function));
        descriptor.set_sample_count(sample_count.max(1) as u64);
        descriptor.set_input_primitive_topology(conversion::topology_class(state.topology));
        for (index, format) in colors.iter().enumerate() {
            let attachment = descriptor.color_attachments().object_at(index as u64).ok_or_else(|| {
                GraphicsError::ResourceCreation(format!("color attachment {} out of range", index))
            })?;
            attachment.set_pixel_format(conversion::pixel_format(*format));
            conversion::apply_blend(attachment, state.blend);
        }
        if let Some(format) = depth {
            let native = conversion::pixel_format(format);
            descriptor.set_depth_attachment_pixel_format(native);
            if native == MTLPixelFormat::Depth32Float_Stencil8 {
                descriptor.set_stencil_attachment_pixel_format(native);
            }
        }

        let pipeline = device
            .new_render_pipeline_state(&descriptor)
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create render pipeline: {}", e)))?;

        let depth_descriptor = DepthStencilDescriptor::new();
        if depth.is_some() && state.depth_compare != CompareFunction::Disabled {
            depth_descriptor.set_depth_compare_function(conversion::compare_function(state.depth_compare));
            depth_descriptor.set_depth_write_enabled(state.depth_write);
        }
        let depth_stencil = device.new_depth_stencil_state(&depth_descriptor);

        let bound = BoundPipeline::Graphics {
            pipeline,
            depth_stencil,
            cull_mode: conversion::cull_mode(state.cull_mode),
            primitive: conversion::primitive_type(state.topology),
        };
        tracing::debug!(pipelines = self.graphics.len() + 1, "Metal render pipeline created");
        self.graphics.insert(key, bound.clone());
        Ok(bound)
    }

    pub fn compute_pipeline(&mut self, device: &Device, handle: NativeHandle, shader: &MetalShader) -> Result<BoundPipeline> {
        if let Some(bound) = self.compute.get(&handle) {
            return Ok(bound.clone());
        }
        let pipeline = device
            .new_compute_pipeline_state_with_function(&shader.function)
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create compute pipeline: {}", e)))?;
        let bound = BoundPipeline::Compute(pipeline);
        self.compute.insert(handle, bound.clone());
        Ok(bound)
    }

    /// 丢弃引用了 `shader` 的管线
    pub fn evict_shader(&mut self, shader: NativeHandle) {
        self.graphics.retain(|key, _| key.vertex != shader && key.fragment != shader);
        self.compute.remove(&shader);
    }
}
