//! Vulkan 管线缓存
//!
//! 管线在第一次绑定时按（着色器, 固定功能状态, 附件格式）创建并缓存。
//! 管线布局由着色器反射推导：
//!
//! - set 0：推送描述符，绑定位置取自反射的 `slot`
//! - set 1：资源视图表
//! - 推送常量：所有阶段中声明的最大值

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;

use super::conversion;
use crate::core::error::{GraphicsError, Result};
use crate::renderer::command::{CompareFunction, PipelineStateDescriptor};
use crate::renderer::resource::{NativeHandle, TextureFormat};
use crate::renderer::shader::{BindingKind, ShaderEntry};

/// 已创建的着色器模块及其反射
pub struct VulkanShader {
    pub module: vk::ShaderModule,
    pub entry: ShaderEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LayoutKey {
    bindings: Vec<(u32, BindingKind, u32)>,
    push_constant_size: u32,
    stages: u32,
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

/// 绑定一条管线需要的全部信息
#[derive(Debug, Clone, Copy)]
pub struct BoundPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    /// 推送常量覆盖的阶段
    pub push_stages: vk::ShaderStageFlags,
}

/// 图形管线的附件格式
pub struct AttachmentFormats<'a> {
    pub colors: &'a [TextureFormat],
    pub depth: Option<TextureFormat>,
    pub sample_count: u32,
}

struct CachedLayout {
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
}

pub struct PipelineCache {
    layouts: HashMap<LayoutKey, CachedLayout>,
    graphics: HashMap<GraphicsKey, BoundPipeline>,
    compute: HashMap<NativeHandle, BoundPipeline>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self {
            layouts: HashMap::new(),
            graphics: HashMap::new(),
            compute: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.graphics.len() + self.compute.len()
    }

    fn layout_for(
        &mut self,
        device: &ash::Device,
        resource_view_layout: vk::DescriptorSetLayout,
        shaders: &[&VulkanShader],
        stages: vk::ShaderStageFlags,
    ) -> Result<vk::PipelineLayout> {
        let mut bindings: Vec<(u32, BindingKind, u32)> = Vec::new();
        for shader in shaders {
            let stage = conversion::shader_stage(shader.entry.stage).as_raw();
            for binding in &shader.entry.bindings {
                match bindings.iter_mut().find(|(slot, _, _)| *slot == binding.slot) {
                    Some(existing) => existing.2 |= stage,
                    None => bindings.push((binding.slot, binding.kind, stage)),
                }
            }
        }
        bindings.sort_by_key(|(slot, _, _)| *slot);
        let push_constant_size = shaders.iter().map(|s| s.entry.push_constant_size).max().unwrap_or(0);

        let key = LayoutKey {
            bindings,
            push_constant_size,
            stages: stages.as_raw(),
        };
        if let Some(cached) = self.layouts.get(&key) {
            return Ok(cached.layout);
        }

        let set_bindings: Vec<vk::DescriptorSetLayoutBinding> = key
            .bindings
            .iter()
            .map(|&(slot, kind, stage)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(slot)
                    .descriptor_type(conversion::descriptor_type(kind))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::from_raw(stage))
            })
            .collect();
        let set_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&set_bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&set_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreation(format!("Failed to create descriptor set layout: {:?}", e))
        })?;

        let set_layouts = [set_layout, resource_view_layout];
        let ranges = [vk::PushConstantRange::default()
            .stage_flags(stages)
            .offset(0)
            .size(push_constant_size)];
        let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(&ranges);
        }
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create pipeline layout: {:?}", e)))?;

        self.layouts.insert(key, CachedLayout { set_layout, layout });
        Ok(layout)
    }

    pub fn graphics_pipeline(
        &mut self,
        device: &ash::Device,
        resource_view_layout: vk::DescriptorSetLayout,
        (vertex_handle, vertex): (NativeHandle, &VulkanShader),
        (fragment_handle, fragment): (NativeHandle, &VulkanShader),
        state: &PipelineStateDescriptor,
        formats: &AttachmentFormats<'_>,
    ) -> Result<BoundPipeline> {
        let key = GraphicsKey {
            vertex: vertex_handle,
            fragment: fragment_handle,
            state: *state,
            colors: formats.colors.to_vec(),
            depth: formats.depth,
            sample_count: formats.sample_count,
        };
        if let Some(bound) = self.graphics.get(&key) {
            return Ok(*bound);
        }

        let push_stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let layout = self.layout_for(device, resource_view_layout, &[vertex, fragment], push_stages)?;

        let vertex_name = entry_name(&vertex.entry)?;
        let fragment_name = entry_name(&fragment.entry)?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex.module)
                .name(&vertex_name),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment.module)
                .name(&fragment_name),
        ];

        // 顶点数据从存储缓冲区拉取，没有顶点输入
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(conversion::topology(state.topology));
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(conversion::cull_mode(state.cull_mode))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(conversion::sample_count(formats.sample_count));
        let depth_enabled = formats.depth.is_some() && state.depth_compare != CompareFunction::Disabled;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_enabled)
            .depth_write_enable(depth_enabled && state.depth_write)
            .depth_compare_op(conversion::compare_op(state.depth_compare));
        let attachments: Vec<_> = formats
            .colors
            .iter()
            .map(|_| conversion::blend_attachment(state.blend))
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> = formats.colors.iter().map(|&f| conversion::texture_format(f)).collect();
        let mut rendering = vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
        if let Some(depth) = formats.depth {
            rendering = rendering.depth_attachment_format(conversion::texture_format(depth));
            if depth.has_stencil() {
                rendering = rendering.stencil_attachment_format(conversion::texture_format(depth));
            }
        }

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .push_next(&mut rendering);

        let pipeline = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None) }
            .map_err(|(_, e)| GraphicsError::ResourceCreation(format!("Failed to create graphics pipeline: {:?}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| GraphicsError::ResourceCreation("graphics pipeline creation returned nothing".to_string()))?;

        tracing::debug!(
            vertex = %vertex.entry.entry_point,
            fragment = %fragment.entry.entry_point,
            cached = self.graphics.len() + 1,
            "Graphics pipeline created"
        );

        let bound = BoundPipeline {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_stages,
        };
        self.graphics.insert(key, bound);
        Ok(bound)
    }

    pub fn compute_pipeline(
        &mut self,
        device: &ash::Device,
        resource_view_layout: vk::DescriptorSetLayout,
        handle: NativeHandle,
        shader: &VulkanShader,
    ) -> Result<BoundPipeline> {
        if let Some(bound) = self.compute.get(&handle) {
            return Ok(*bound);
        }

        let push_stages = vk::ShaderStageFlags::COMPUTE;
        let layout = self.layout_for(device, resource_view_layout, &[shader], push_stages)?;
        let name = entry_name(&shader.entry)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(&name);
        let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

        let pipeline = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None) }
            .map_err(|(_, e)| GraphicsError::ResourceCreation(format!("Failed to create compute pipeline: {:?}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| GraphicsError::ResourceCreation("compute pipeline creation returned nothing".to_string()))?;

        let bound = BoundPipeline {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            push_stages,
        };
        self.compute.insert(handle, bound);
        Ok(bound)
    }

    /// 销毁引用了 `shader` 的管线
    pub fn evict_shader(&mut self, device: &ash::Device, shader: NativeHandle) {
        self.graphics.retain(|key, bound| {
            let keep = key.vertex != shader && key.fragment != shader;
            if !keep {
                unsafe { device.destroy_pipeline(bound.pipeline, None) };
            }
            keep
        });
        if let Some(bound) = self.compute.remove(&shader) {
            unsafe { device.destroy_pipeline(bound.pipeline, None) };
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            let graphics = self.graphics.drain().map(|(_, bound)| bound);
            let compute = self.compute.drain().map(|(_, bound)| bound);
            for bound in graphics.chain(compute) {
                device.destroy_pipeline(bound.pipeline, None);
            }
            for (_, cached) in self.layouts.drain() {
                device.destroy_pipeline_layout(cached.layout, None);
                device.destroy_descriptor_set_layout(cached.set_layout, None);
            }
        }
    }
}

fn entry_name(entry: &ShaderEntry) -> Result<CString> {
    CString::new(entry.entry_point.as_str()).map_err(|e| {
        GraphicsError::ShaderCompilation(format!("Invalid entry point '{}': {}", entry.entry_point, e)).into()
    })
}
