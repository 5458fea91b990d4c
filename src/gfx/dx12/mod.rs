//! DirectX 12 后端
//!
//! 基于 `windows` crate 的 [`NativeDevice`] 实现：
//!
//! - 缓冲区放置在 `ID3D12Heap` 中，纹理使用提交资源
//! - 每个栅栏是一个 `ID3D12Fence`，等待通过事件完成
//! - 每帧一个命令分配器，命令列表在其上重置
//! - 资源视图表位于着色器可见的 `CBV_SRV_UAV` 堆
//!
//! blit 只复制源与目标的重叠区域（不缩放），两者格式必须兼容。

pub mod context;
pub mod conversion;
pub mod descriptor;
pub mod mipmap;
pub mod pipeline;
pub mod swapchain;

use std::collections::HashMap;
use std::mem::ManuallyDrop;

use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use context::Dx12Context;
use descriptor::{DescriptorHeap, ScratchRing, SCRATCH_DESCRIPTORS};
use mipmap::{MipGenerator, GROUP_SIZE};
use pipeline::{BoundPipeline, Dx12Shader, PipelineCache};
use swapchain::Dx12Swapchain;

use super::backend::{
    AcquireStatus, BackendInfo, NativeCommand, NativeDevice, NativeRenderPass, NativeSwapchain, NativeTexture,
    PresentMode, PresentStatus, Submission, SurfaceCapabilities, SwapchainDescriptor, ViewResource,
};
use super::SurfaceTarget;
use crate::core::config::{DeviceConfig, GraphicsBackend};
use crate::core::error::{DistGfxError, GraphicsError, Result};
use crate::renderer::command::LoadAction;
use crate::renderer::heap::align_up;
use crate::renderer::resource::{
    BufferDescriptor, BufferUsage, HeapDescriptor, ImTextureId, MemoryRequirements, MemoryType, NativeHandle,
    ShaderResourceIndex, Size, Texture, TextureDescriptor, TextureDimension, TextureFormat, TextureUsage,
};
use crate::renderer::shader::{BindingKind, ShaderEntry};
use crate::renderer::transition::{Barrier, TransitionPolicy};

/// 缓冲区放置对齐（`D3D12_DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT`）
const PLACEMENT_ALIGNMENT: u64 = 65536;
/// 常量缓冲区视图对齐
const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;
const MAX_ATTACHMENTS: u32 = 1024;

fn command_error(what: &str, err: windows::core::Error) -> DistGfxError {
    GraphicsError::CommandExecution(format!("Failed to {}: {:?}", what, err)).into()
}

fn transition(resource: &ID3D12Resource, subresource: u32, before: D3D12_RESOURCE_STATES, after: D3D12_RESOURCE_STATES) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: ManuallyDrop::new(Some(resource.clone())),
                Subresource: subresource,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

/// 记录屏障并释放其中持有的资源引用
unsafe fn resource_barrier(list: &ID3D12GraphicsCommandList, barriers: Vec<D3D12_RESOURCE_BARRIER>) {
    if barriers.is_empty() {
        return;
    }
    list.ResourceBarrier(&barriers);
    for barrier in barriers {
        let mut transition = ManuallyDrop::into_inner(barrier.Anonymous.Transition);
        ManuallyDrop::drop(&mut transition.pResource);
    }
}

fn copy_location(resource: &ID3D12Resource) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: ManuallyDrop::new(Some(resource.clone())),
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: 0 },
    }
}

struct Dx12Heap {
    heap: ID3D12Heap,
    size: u64,
    memory_type: MemoryType,
}

struct Dx12Buffer {
    resource: ID3D12Resource,
    size: u64,
    gpu_address: u64,
    /// UPLOAD 堆上的缓冲区持久映射，且不能转换状态
    mapped: Option<*mut u8>,
}

struct Dx12Texture {
    resource: ID3D12Resource,
    format: TextureFormat,
    dimension: TextureDimension,
    mip_levels: u32,
    rtv: Option<u32>,
    dsv: Option<u32>,
    swapchain_image: bool,
}

struct Dx12List {
    list: ID3D12GraphicsCommandList,
    frame: u32,
    pipeline: Option<BoundPipeline>,
}

struct SwapchainRecord {
    swapchain: Dx12Swapchain,
    images: Vec<NativeHandle>,
}

/// DirectX 12 原生设备
pub struct Dx12Device {
    info: BackendInfo,
    next_id: u64,
    heaps: HashMap<NativeHandle, Dx12Heap>,
    buffers: HashMap<NativeHandle, Dx12Buffer>,
    textures: HashMap<NativeHandle, Dx12Texture>,
    shaders: HashMap<NativeHandle, Dx12Shader>,
    allocators: HashMap<u32, ID3D12CommandAllocator>,
    lists: HashMap<NativeHandle, Dx12List>,
    fences: HashMap<NativeHandle, ID3D12Fence>,
    swapchains: HashMap<NativeHandle, SwapchainRecord>,
    rtv_heap: DescriptorHeap,
    dsv_heap: DescriptorHeap,
    resource_heap: DescriptorHeap,
    scratch: ScratchRing,
    pipelines: PipelineCache,
    mips: MipGenerator,
    context: Dx12Context,
}

impl Dx12Device {
    pub fn new(config: &DeviceConfig, target: &SurfaceTarget) -> Result<Self> {
        let context = Dx12Context::new(config, target)?;
        let device = &context.device;
        let capacity = config.descriptor_capacity.max(1);

        let rtv_heap = DescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_RTV, MAX_ATTACHMENTS, false)?;
        let dsv_heap = DescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_DSV, MAX_ATTACHMENTS, false)?;
        let resource_heap =
            DescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV, capacity + SCRATCH_DESCRIPTORS, true)?;
        let mips = MipGenerator::new(device)?;

        tracing::info!(
            device_name = %context.device_name,
            descriptor_capacity = capacity,
            "DX12 device initialized"
        );

        Ok(Self {
            info: BackendInfo {
                kind: GraphicsBackend::Dx12,
                device_name: context.device_name.clone(),
                descriptor_stride: resource_heap.increment_size() as u64,
                transition_policy: TransitionPolicy::ReadCombinable,
                mipmaps_by_blit: true,
            },
            next_id: 0,
            heaps: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            allocators: HashMap::new(),
            lists: HashMap::new(),
            fences: HashMap::new(),
            swapchains: HashMap::new(),
            rtv_heap,
            dsv_heap,
            scratch: ScratchRing::new(capacity),
            resource_heap,
            pipelines: PipelineCache::new(capacity),
            mips,
            context,
        })
    }

    fn allocate_id(&mut self) -> NativeHandle {
        self.next_id += 1;
        NativeHandle(self.next_id)
    }

    fn list(&self, list: NativeHandle) -> Result<&Dx12List> {
        self.lists
            .get(&list)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown command list {:?}", list)).into())
    }

    fn texture(&self, texture: NativeHandle) -> Result<&Dx12Texture> {
        self.textures
            .get(&texture)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown texture {:?}", texture)).into())
    }

    fn buffer(&self, buffer: NativeHandle) -> Result<&Dx12Buffer> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown buffer {:?}", buffer)).into())
    }

    fn allocator(&mut self, frame: u32) -> Result<ID3D12CommandAllocator> {
        if let Some(allocator) = self.allocators.get(&frame) {
            return Ok(allocator.clone());
        }
        let allocator: ID3D12CommandAllocator =
            unsafe { self.context.device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create command allocator: {:?}", e)))?;
        self.allocators.insert(frame, allocator.clone());
        Ok(allocator)
    }

    fn record_barriers(&self, list: &ID3D12GraphicsCommandList, barriers: &[Barrier]) {
        let mut native = Vec::with_capacity(barriers.len());
        for barrier in barriers {
            let before = conversion::resource_state(barrier.before);
            let after = conversion::resource_state(barrier.after);
            if before == after {
                continue;
            }
            if let Some(texture) = self.textures.get(&barrier.resource) {
                native.push(transition(&texture.resource, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES, before, after));
            } else if let Some(buffer) = self.buffers.get(&barrier.resource) {
                if buffer.mapped.is_none() {
                    native.push(transition(&buffer.resource, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES, before, after));
                }
            } else {
                tracing::warn!(resource = ?barrier.resource, "Barrier on unknown resource skipped");
            }
        }
        unsafe { resource_barrier(list, native) };
    }

    fn begin_render_pass(&self, list: &ID3D12GraphicsCommandList, pass: &NativeRenderPass) -> Result<()> {
        let mut rtvs = Vec::with_capacity(pass.colors.len());
        for color in &pass.colors {
            let texture = self.texture(color.texture)?;
            let rtv = texture.rtv.ok_or_else(|| {
                GraphicsError::CommandExecution(format!("texture {:?} is not a color attachment", color.texture))
            })?;
            let handle = self.rtv_heap.cpu_handle(rtv);
            if color.load == LoadAction::Clear {
                unsafe { list.ClearRenderTargetView(handle, &color.clear_color, None) };
            }
            rtvs.push(handle);
        }

        let dsv = match pass.depth {
            Some(depth) => {
                let texture = self.texture(depth.texture)?;
                let dsv = texture.dsv.ok_or_else(|| {
                    GraphicsError::CommandExecution(format!("texture {:?} is not a depth attachment", depth.texture))
                })?;
                let handle = self.dsv_heap.cpu_handle(dsv);
                if depth.load == LoadAction::Clear {
                    let mut flags = D3D12_CLEAR_FLAG_DEPTH;
                    if depth.format.has_stencil() {
                        flags |= D3D12_CLEAR_FLAG_STENCIL;
                    }
                    unsafe {
                        list.ClearDepthStencilView(handle, flags, depth.clear_depth, depth.clear_stencil as u8, None)
                    };
                }
                Some(handle)
            }
            None => None,
        };

        unsafe {
            list.OMSetRenderTargets(
                rtvs.len() as u32,
                (!rtvs.is_empty()).then_some(rtvs.as_ptr()),
                false,
                dsv.as_ref().map(|handle| handle as *const _),
            );
        }
        set_viewport(list, pass.size);
        Ok(())
    }

    fn bind_pipeline(&mut self, list_handle: NativeHandle, command: &NativeCommand<'_>) -> Result<()> {
        let list = self.list(list_handle)?.list.clone();
        let device = &self.context.device;
        let shader = |handle: NativeHandle| {
            self.shaders
                .get(&handle)
                .ok_or_else(|| DistGfxError::from(GraphicsError::CommandExecution(format!("unknown shader {:?}", handle))))
        };

        let bound = match *command {
            NativeCommand::BindGraphicsPipeline { state, vertex, fragment, pass } => self.pipelines.graphics_pipeline(
                device,
                (vertex.handle(), shader(vertex.handle())?),
                (fragment.handle(), shader(fragment.handle())?),
                state,
                &pass.color_formats(),
                pass.depth_format(),
                pass.sample_count,
            )?,
            NativeCommand::BindComputePipeline { compute } => {
                self.pipelines
                    .compute_pipeline(device, compute.handle(), shader(compute.handle())?)?
            }
            _ => return Ok(()),
        };

        let table = self.resource_heap.gpu_handle(0);
        unsafe {
            list.SetPipelineState(&bound.pso);
            if bound.compute {
                list.SetComputeRootSignature(&bound.layout.signature);
                list.SetComputeRootDescriptorTable(bound.layout.resource_views, table);
            } else {
                list.SetGraphicsRootSignature(&bound.layout.signature);
                list.SetGraphicsRootDescriptorTable(bound.layout.resource_views, table);
                list.IASetPrimitiveTopology(bound.topology);
            }
        }
        if let Some(record) = self.lists.get_mut(&list_handle) {
            record.pipeline = Some(bound);
        }
        Ok(())
    }

    fn bound_pipeline(&self, list: NativeHandle, what: &str) -> Result<(ID3D12GraphicsCommandList, BoundPipeline)> {
        let record = self.list(list)?;
        let bound = record.pipeline.clone().ok_or_else(|| {
            GraphicsError::CommandExecution(format!("{} recorded before a pipeline was bound", what))
        })?;
        Ok((record.list.clone(), bound))
    }

    #[allow(clippy::too_many_arguments)]
    fn bind_resource(
        &mut self,
        list_handle: NativeHandle,
        kind: BindingKind,
        slot: u32,
        resource: NativeHandle,
        resource_view: ShaderResourceIndex,
        offset: u64,
    ) -> Result<()> {
        let (list, bound) = self.bound_pipeline(list_handle, "bind_resource")?;
        let parameter = bound.layout.parameter(slot).ok_or_else(|| {
            GraphicsError::CommandExecution(format!("binding slot {} is not part of the root signature", slot))
        })?;

        unsafe {
            match kind {
                BindingKind::UniformBuffer | BindingKind::StorageBuffer => {
                    let address = self.buffer(resource)?.gpu_address + offset;
                    match (kind, bound.compute) {
                        (BindingKind::UniformBuffer, false) => list.SetGraphicsRootConstantBufferView(parameter, address),
                        (BindingKind::UniformBuffer, true) => list.SetComputeRootConstantBufferView(parameter, address),
                        (_, false) => list.SetGraphicsRootUnorderedAccessView(parameter, address),
                        (_, true) => list.SetComputeRootUnorderedAccessView(parameter, address),
                    }
                }
                BindingKind::SampledTexture | BindingKind::StorageTexture => {
                    let index = if kind == BindingKind::SampledTexture && resource_view.is_valid() {
                        resource_view.index()
                    } else {
                        let texture = self.texture(resource)?.resource.clone();
                        let index = self.scratch.next();
                        let handle = self.resource_heap.cpu_handle(index);
                        if kind == BindingKind::StorageTexture {
                            self.context.device.CreateUnorderedAccessView(&texture, None::<&ID3D12Resource>, None, handle);
                        } else {
                            self.context.device.CreateShaderResourceView(&texture, None, handle);
                        }
                        index
                    };
                    let table = self.resource_heap.gpu_handle(index);
                    if bound.compute {
                        list.SetComputeRootDescriptorTable(parameter, table);
                    } else {
                        list.SetGraphicsRootDescriptorTable(parameter, table);
                    }
                }
            }
        }
        Ok(())
    }

    fn blit(&self, list: &ID3D12GraphicsCommandList, src: NativeHandle, src_size: Size, dst: NativeHandle, dst_size: Size) -> Result<()> {
        let src = self.texture(src)?;
        let dst = self.texture(dst)?;
        if src_size != dst_size {
            tracing::debug!(?src_size, ?dst_size, "DX12 blit copies the overlapping region without scaling");
        }
        let region = D3D12_BOX {
            left: 0,
            top: 0,
            front: 0,
            right: src_size.width.min(dst_size.width),
            bottom: src_size.height.min(dst_size.height),
            back: 1,
        };
        let mut dst_location = copy_location(&dst.resource);
        let mut src_location = copy_location(&src.resource);
        unsafe {
            list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, Some(&region));
            ManuallyDrop::drop(&mut dst_location.pResource);
            ManuallyDrop::drop(&mut src_location.pResource);
        }
        Ok(())
    }

    /// 行距与起始偏移由调用者按 `D3D12_TEXTURE_DATA_PITCH_ALIGNMENT` / `PLACEMENT_ALIGNMENT` 对齐
    fn copy_buffer_to_texture(
        &self,
        list: &ID3D12GraphicsCommandList,
        src: NativeHandle,
        src_offset: u64,
        row_pitch: u32,
        dst: NativeHandle,
        size: Size,
    ) -> Result<()> {
        let buffer = self.buffer(src)?;
        let texture = self.texture(dst)?;
        let mut src_location = D3D12_TEXTURE_COPY_LOCATION {
            pResource: ManuallyDrop::new(Some(buffer.resource.clone())),
            Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                    Offset: src_offset,
                    Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                        Format: conversion::dxgi_format(texture.format),
                        Width: size.width.max(1),
                        Height: size.height.max(1),
                        Depth: 1,
                        RowPitch: row_pitch,
                    },
                },
            },
        };
        let mut dst_location = copy_location(&texture.resource);
        unsafe {
            list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None);
            ManuallyDrop::drop(&mut dst_location.pResource);
            ManuallyDrop::drop(&mut src_location.pResource);
        }
        Ok(())
    }

    /// 逐级下采样
    ///
    /// 进入时所有层级处于 `COPY_DEST`，结束时全部处于 `COPY_SOURCE`。
    fn generate_mipmaps(&mut self, list: &ID3D12GraphicsCommandList, texture: NativeHandle, size: Size, mip_levels: u32) -> Result<()> {
        let record = self.texture(texture)?;
        let resource = record.resource.clone();
        let format = record.format;
        let can_downsample =
            conversion::supports_typed_uav(format) && record.dimension == TextureDimension::Texture2D;

        if !can_downsample {
            tracing::warn!(?format, dimension = ?record.dimension, "Mip generation unsupported for texture, levels left undefined");
            unsafe {
                resource_barrier(
                    list,
                    vec![transition(
                        &resource,
                        D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                        D3D12_RESOURCE_STATE_COPY_DEST,
                        D3D12_RESOURCE_STATE_COPY_SOURCE,
                    )],
                )
            };
            return Ok(());
        }

        let dxgi_format = conversion::dxgi_format(format);
        unsafe {
            list.SetComputeRootSignature(&self.mips.signature);
            list.SetPipelineState(&self.mips.pso);
        }

        let mut width = size.width.max(1);
        let mut height = size.height.max(1);
        for level in 1..mip_levels {
            width = (width / 2).max(1);
            height = (height / 2).max(1);

            let srv_index = self.scratch.next();
            let uav_index = self.scratch.next();
            let srv_desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                Format: dxgi_format,
                ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture2D: D3D12_TEX2D_SRV {
                        MostDetailedMip: level - 1,
                        MipLevels: 1,
                        PlaneSlice: 0,
                        ResourceMinLODClamp: 0.0,
                    },
                },
            };
            let uav_desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                Format: dxgi_format,
                ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
                Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture2D: D3D12_TEX2D_UAV {
                        MipSlice: level,
                        PlaneSlice: 0,
                    },
                },
            };
            let texel_size = [(1.0 / width as f32).to_bits(), (1.0 / height as f32).to_bits()];

            unsafe {
                let device = &self.context.device;
                device.CreateShaderResourceView(&resource, Some(&srv_desc), self.resource_heap.cpu_handle(srv_index));
                device.CreateUnorderedAccessView(&resource, None::<&ID3D12Resource>, Some(&uav_desc), self.resource_heap.cpu_handle(uav_index));

                resource_barrier(
                    list,
                    vec![
                        transition(&resource, level - 1, D3D12_RESOURCE_STATE_COPY_DEST, D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE),
                        transition(&resource, level, D3D12_RESOURCE_STATE_COPY_DEST, D3D12_RESOURCE_STATE_UNORDERED_ACCESS),
                    ],
                );
                list.SetComputeRoot32BitConstants(0, 2, texel_size.as_ptr() as *const _, 0);
                list.SetComputeRootDescriptorTable(1, self.resource_heap.gpu_handle(srv_index));
                list.SetComputeRootDescriptorTable(2, self.resource_heap.gpu_handle(uav_index));
                list.Dispatch(width.div_ceil(GROUP_SIZE), height.div_ceil(GROUP_SIZE), 1);
                resource_barrier(
                    list,
                    vec![
                        transition(&resource, level - 1, D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE, D3D12_RESOURCE_STATE_COPY_SOURCE),
                        transition(&resource, level, D3D12_RESOURCE_STATE_UNORDERED_ACCESS, D3D12_RESOURCE_STATE_COPY_DEST),
                    ],
                );
            }
        }

        unsafe {
            resource_barrier(
                list,
                vec![transition(
                    &resource,
                    mip_levels.max(1) - 1,
                    D3D12_RESOURCE_STATE_COPY_DEST,
                    D3D12_RESOURCE_STATE_COPY_SOURCE,
                )],
            );
        }
        Ok(())
    }

    fn release_texture(&mut self, record: Dx12Texture) {
        if let Some(rtv) = record.rtv {
            self.rtv_heap.free(rtv);
        }
        if let Some(dsv) = record.dsv {
            self.dsv_heap.free(dsv);
        }
    }
}

fn set_viewport(list: &ID3D12GraphicsCommandList, size: Size) {
    let viewport = D3D12_VIEWPORT {
        TopLeftX: 0.0,
        TopLeftY: 0.0,
        Width: size.width as f32,
        Height: size.height as f32,
        MinDepth: 0.0,
        MaxDepth: 1.0,
    };
    let scissor = RECT {
        left: 0,
        top: 0,
        right: size.width as i32,
        bottom: size.height as i32,
    };
    unsafe {
        list.RSSetViewports(&[viewport]);
        list.RSSetScissorRects(&[scissor]);
    }
}

impl NativeDevice for Dx12Device {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn allocate_heap(&mut self, descriptor: &HeapDescriptor) -> Result<NativeHandle> {
        let desc = D3D12_HEAP_DESC {
            SizeInBytes: align_up(descriptor.size, PLACEMENT_ALIGNMENT),
            Properties: D3D12_HEAP_PROPERTIES {
                Type: conversion::heap_type(descriptor.memory_type),
                ..Default::default()
            },
            Alignment: PLACEMENT_ALIGNMENT,
            Flags: D3D12_HEAP_FLAG_ALLOW_ONLY_BUFFERS,
        };
        let mut heap: Option<ID3D12Heap> = None;
        unsafe { self.context.device.CreateHeap(&desc, &mut heap) }.map_err(|e| {
            GraphicsError::ResourceCreation(format!("Failed to allocate heap '{}': {:?}", descriptor.name, e))
        })?;
        let heap = heap.ok_or_else(|| GraphicsError::ResourceCreation("CreateHeap returned nothing".to_string()))?;

        let handle = self.allocate_id();
        self.heaps.insert(
            handle,
            Dx12Heap {
                heap,
                size: desc.SizeInBytes,
                memory_type: descriptor.memory_type,
            },
        );
        tracing::debug!(name = %descriptor.name, size = desc.SizeInBytes, "DX12 heap allocated");
        Ok(handle)
    }

    fn free_heap(&mut self, heap: NativeHandle) {
        if self.heaps.remove(&heap).is_none() {
            tracing::error!(?heap, "Freeing unknown heap");
        }
    }

    fn heap_alignment(&self, _memory_type: MemoryType) -> u64 {
        PLACEMENT_ALIGNMENT
    }

    fn memory_requirements(&self, descriptor: &BufferDescriptor) -> MemoryRequirements {
        MemoryRequirements {
            size: align_up(descriptor.aligned_size(), CONSTANT_BUFFER_ALIGNMENT),
            alignment: PLACEMENT_ALIGNMENT,
        }
    }

    fn create_placed_buffer(
        &mut self,
        heap: NativeHandle,
        offset: u64,
        descriptor: &BufferDescriptor,
    ) -> Result<NativeHandle> {
        let Some(record) = self.heaps.get(&heap) else {
            return Err(GraphicsError::ResourceCreation(format!("unknown heap {:?}", heap)).into());
        };
        let size = align_up(descriptor.size.max(1), CONSTANT_BUFFER_ALIGNMENT);
        if offset + size > record.size {
            return Err(GraphicsError::ResourceCreation(format!(
                "buffer '{}' [{}, {}) exceeds heap of {} bytes",
                descriptor.name,
                offset,
                offset + size,
                record.size
            ))
            .into());
        }

        let host_visible = record.memory_type.is_host_visible();
        let flags = if !host_visible && matches!(descriptor.usage, BufferUsage::Storage | BufferUsage::Vertex) {
            D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
        } else {
            D3D12_RESOURCE_FLAG_NONE
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: flags,
        };
        let initial_state = if host_visible {
            D3D12_RESOURCE_STATE_GENERIC_READ
        } else {
            D3D12_RESOURCE_STATE_COMMON
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.context
                .device
                .CreatePlacedResource(&record.heap, offset, &desc, initial_state, None, &mut resource)
        }
        .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create buffer '{}': {:?}", descriptor.name, e)))?;
        let resource =
            resource.ok_or_else(|| GraphicsError::ResourceCreation("CreatePlacedResource returned nothing".to_string()))?;

        let mapped = if host_visible {
            let mut pointer = std::ptr::null_mut();
            // 空读取范围：CPU 只写
            let read_range = D3D12_RANGE { Begin: 0, End: 0 };
            unsafe { resource.Map(0, Some(&read_range), Some(&mut pointer)) }
                .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to map buffer: {:?}", e)))?;
            Some(pointer as *mut u8)
        } else {
            None
        };

        let gpu_address = unsafe { resource.GetGPUVirtualAddress() };
        let handle = self.allocate_id();
        self.buffers.insert(
            handle,
            Dx12Buffer {
                resource,
                size: descriptor.size,
                gpu_address,
                mapped,
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: NativeHandle) {
        match self.buffers.remove(&buffer) {
            Some(record) => {
                if record.mapped.is_some() {
                    unsafe { record.resource.Unmap(0, None) };
                }
            }
            None => tracing::error!(?buffer, "Destroying unknown buffer"),
        }
    }

    fn write_buffer(&mut self, buffer: NativeHandle, offset: u64, data: &[u8]) -> Result<()> {
        let record = self.buffer(buffer)?;
        if offset + data.len() as u64 > record.size {
            return Err(GraphicsError::CommandExecution(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                record.size
            ))
            .into());
        }
        let Some(mapped) = record.mapped else {
            return Err(GraphicsError::CommandExecution("buffer heap is not host visible".to_string()).into());
        };
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len()) };
        Ok(())
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<NativeTexture> {
        if descriptor.size.is_empty() {
            return Err(GraphicsError::ResourceCreation(format!("texture '{}' has zero size", descriptor.name)).into());
        }
        let mip_levels = descriptor.mip_levels();
        let (dimension, layers) = match descriptor.dimension {
            TextureDimension::Texture3D => (D3D12_RESOURCE_DIMENSION_TEXTURE3D, 1),
            TextureDimension::TextureCube => (D3D12_RESOURCE_DIMENSION_TEXTURE2D, 6),
            _ => (D3D12_RESOURCE_DIMENSION_TEXTURE2D, 1),
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: dimension,
            Alignment: 0,
            Width: descriptor.size.width as u64,
            Height: descriptor.size.height,
            DepthOrArraySize: layers,
            MipLevels: mip_levels as u16,
            Format: conversion::dxgi_format(descriptor.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: descriptor.sample_count.max(1),
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: conversion::texture_flags(descriptor.usage, descriptor.format, descriptor.use_mip_map),
        };
        let properties = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.context.device.CreateCommittedResource(
                &properties,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                D3D12_RESOURCE_STATE_COMMON,
                None,
                &mut resource,
            )
        }
        .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create texture '{}': {:?}", descriptor.name, e)))?;
        let resource =
            resource.ok_or_else(|| GraphicsError::ResourceCreation("CreateCommittedResource returned nothing".to_string()))?;

        let attachment = descriptor.usage.contains(TextureUsage::ATTACHMENT);
        let rtv = if attachment && !descriptor.format.is_depth_stencil() {
            let index = self.rtv_heap.allocate()?;
            unsafe {
                self.context
                    .device
                    .CreateRenderTargetView(&resource, None, self.rtv_heap.cpu_handle(index))
            };
            Some(index)
        } else {
            None
        };
        let dsv = if attachment && descriptor.format.is_depth_stencil() {
            let index = self.dsv_heap.allocate()?;
            unsafe {
                self.context
                    .device
                    .CreateDepthStencilView(&resource, None, self.dsv_heap.cpu_handle(index))
            };
            Some(index)
        } else {
            None
        };

        let handle = self.allocate_id();
        let view = self.allocate_id();
        self.textures.insert(
            handle,
            Dx12Texture {
                resource,
                format: descriptor.format,
                dimension: descriptor.dimension,
                mip_levels,
                rtv,
                dsv,
                swapchain_image: false,
            },
        );
        Ok(NativeTexture { handle, view })
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        match self.textures.remove(&texture.handle) {
            Some(record) if record.swapchain_image => {
                tracing::error!(texture = ?texture.handle, "Swapchain images are owned by their swapchain");
                self.textures.insert(texture.handle, record);
            }
            Some(record) => self.release_texture(record),
            None => tracing::error!(texture = ?texture.handle, "Destroying unknown texture"),
        }
    }

    fn write_resource_view(&mut self, slot: ShaderResourceIndex, resource: ViewResource<'_>) {
        let handle = self.resource_heap.cpu_handle(slot.index());
        let device = &self.context.device;
        match resource {
            ViewResource::Buffer(buffer) => {
                let Some(record) = self.buffers.get(&buffer.handle()) else {
                    tracing::error!(buffer = ?buffer.handle(), "Resource view for unknown buffer");
                    return;
                };
                let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: DXGI_FORMAT_R32_TYPELESS,
                    ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
                    Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                    Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Buffer: D3D12_BUFFER_SRV {
                            FirstElement: 0,
                            NumElements: (record.size / 4) as u32,
                            StructureByteStride: 0,
                            Flags: D3D12_BUFFER_SRV_FLAG_RAW,
                        },
                    },
                };
                unsafe { device.CreateShaderResourceView(&record.resource, Some(&desc), handle) };
            }
            ViewResource::Texture(texture) => {
                let Some(record) = self.textures.get(&texture.handle()) else {
                    tracing::error!(texture = ?texture.handle(), "Resource view for unknown texture");
                    return;
                };
                let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: conversion::srv_format(record.format),
                    ViewDimension: match record.dimension {
                        TextureDimension::Texture3D => D3D12_SRV_DIMENSION_TEXTURE3D,
                        TextureDimension::TextureCube => D3D12_SRV_DIMENSION_TEXTURECUBE,
                        _ => D3D12_SRV_DIMENSION_TEXTURE2D,
                    },
                    Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                    Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_SRV {
                            MostDetailedMip: 0,
                            MipLevels: record.mip_levels,
                            PlaneSlice: 0,
                            ResourceMinLODClamp: 0.0,
                        },
                    },
                };
                unsafe { device.CreateShaderResourceView(&record.resource, Some(&desc), handle) };
            }
        }
    }

    fn im_texture_id(&self, texture: &Texture) -> ImTextureId {
        ImTextureId(self.resource_heap.gpu_handle(texture.resource_view().index()).ptr)
    }

    fn create_shader(&mut self, entry: &ShaderEntry, bytecode: &[u8]) -> Result<NativeHandle> {
        if bytecode.is_empty() {
            return Err(GraphicsError::ShaderCompilation(format!("empty bytecode for '{}'", entry.entry_point)).into());
        }
        let handle = self.allocate_id();
        self.shaders.insert(
            handle,
            Dx12Shader {
                entry: entry.clone(),
                bytecode: bytecode.to_vec(),
            },
        );
        Ok(handle)
    }

    fn destroy_shader(&mut self, shader: NativeHandle) {
        if self.shaders.remove(&shader).is_some() {
            self.pipelines.evict_shader(shader);
        }
    }

    fn create_command_list(&mut self, frame: u32) -> Result<NativeHandle> {
        let allocator = self.allocator(frame)?;
        let list: ID3D12GraphicsCommandList = unsafe {
            self.context
                .device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
        }
        .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create command list: {:?}", e)))?;
        // 新建的命令列表处于录制状态
        unsafe { list.Close() }.map_err(|e| command_error("close new command list", e))?;

        let handle = self.allocate_id();
        self.lists.insert(handle, Dx12List { list, frame, pipeline: None });
        Ok(handle)
    }

    fn reset_command_pool(&mut self, frame: u32) -> Result<()> {
        let Some(allocator) = self.allocators.get(&frame) else {
            return Ok(());
        };
        unsafe { allocator.Reset() }.map_err(|e| command_error("reset command allocator", e))?;
        for list in self.lists.values_mut().filter(|list| list.frame == frame) {
            list.pipeline = None;
        }
        Ok(())
    }

    fn destroy_command_list(&mut self, _frame: u32, list: NativeHandle) {
        self.lists.remove(&list);
    }

    fn begin_command_list(&mut self, list: NativeHandle) -> Result<()> {
        let record = self.list(list)?;
        let frame = record.frame;
        let native = record.list.clone();
        let allocator = self.allocator(frame)?;
        unsafe {
            native
                .Reset(&allocator, None)
                .map_err(|e| command_error("reset command list", e))?;
            native.SetDescriptorHeaps(&[Some(self.resource_heap.heap().clone())]);
        }
        Ok(())
    }

    fn record(&mut self, list: NativeHandle, command: NativeCommand<'_>) -> Result<()> {
        let native = self.list(list)?.list.clone();

        match command {
            NativeCommand::Barriers(barriers) => self.record_barriers(&native, barriers),
            NativeCommand::BeginRenderPass(pass) => self.begin_render_pass(&native, pass)?,
            NativeCommand::EndRenderPass => {}
            NativeCommand::BindGraphicsPipeline { .. } | NativeCommand::BindComputePipeline { .. } => {
                self.bind_pipeline(list, &command)?
            }
            NativeCommand::SetViewport(size) => set_viewport(&native, size),
            NativeCommand::BindResource {
                binding,
                resource,
                resource_view,
                offset,
                ..
            } => self.bind_resource(list, binding.kind, binding.slot, resource, resource_view, offset)?,
            NativeCommand::PushConstants(data) => {
                let (native, bound) = self.bound_pipeline(list, command.name())?;
                let Some(parameter) = bound.layout.push_constants else {
                    return Err(GraphicsError::CommandExecution("pipeline declares no push constants".to_string()).into());
                };
                let mut words = vec![0u32; data.len().div_ceil(4)];
                for (word, chunk) in words.iter_mut().zip(data.chunks(4)) {
                    let mut bytes = [0u8; 4];
                    bytes[..chunk.len()].copy_from_slice(chunk);
                    *word = u32::from_le_bytes(bytes);
                }
                unsafe {
                    if bound.compute {
                        native.SetComputeRoot32BitConstants(parameter, words.len() as u32, words.as_ptr() as *const _, 0);
                    } else {
                        native.SetGraphicsRoot32BitConstants(parameter, words.len() as u32, words.as_ptr() as *const _, 0);
                    }
                }
            }
            NativeCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe { native.DrawInstanced(vertex_count, instance_count, first_vertex, first_instance) },
            NativeCommand::DrawIndexed {
                index_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                let buffer = self.buffer(index_buffer)?;
                let view = D3D12_INDEX_BUFFER_VIEW {
                    BufferLocation: buffer.gpu_address,
                    SizeInBytes: buffer.size as u32,
                    Format: DXGI_FORMAT_R32_UINT,
                };
                unsafe {
                    native.IASetIndexBuffer(Some(&view));
                    native.DrawIndexedInstanced(index_count, instance_count, first_index, vertex_offset, first_instance);
                }
            }
            NativeCommand::Dispatch { x, y, z } => unsafe { native.Dispatch(x, y, z) },
            NativeCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src = &self.buffer(src)?.resource;
                let dst = &self.buffer(dst)?.resource;
                unsafe { native.CopyBufferRegion(dst, dst_offset, src, src_offset, size) };
            }
            NativeCommand::CopyBufferToTexture {
                src,
                src_offset,
                row_pitch,
                dst,
                size,
            } => self.copy_buffer_to_texture(&native, src, src_offset, row_pitch, dst, size)?,
            NativeCommand::Blit {
                src,
                src_size,
                dst,
                dst_size,
            } => self.blit(&native, src, src_size, dst, dst_size)?,
            NativeCommand::GenerateMipmaps {
                texture,
                size,
                mip_levels,
            } => {
                self.generate_mipmaps(&native, texture, size, mip_levels)?;
                // 内置管线替换了 compute 根签名
                if let Some(record) = self.lists.get_mut(&list) {
                    record.pipeline = None;
                }
            }
        }
        Ok(())
    }

    fn end_command_list(&mut self, list: NativeHandle) -> Result<()> {
        let native = &self.list(list)?.list;
        unsafe { native.Close() }.map_err(|e| command_error("close command list", e))
    }

    fn create_fence(&mut self) -> Result<NativeHandle> {
        let fence: ID3D12Fence = unsafe { self.context.device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create fence: {:?}", e)))?;
        let handle = self.allocate_id();
        self.fences.insert(handle, fence);
        Ok(handle)
    }

    fn destroy_fence(&mut self, fence: NativeHandle) {
        self.fences.remove(&fence);
    }

    fn submit(&mut self, submission: &Submission) -> Result<()> {
        let list = self.list(submission.command_list)?.list.clone();
        let fence = self
            .fences
            .get(&submission.fence)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown fence {:?}", submission.fence)))?;
        unsafe {
            self.context.queue.ExecuteCommandLists(&[Some(list.into())]);
            self.context
                .queue
                .Signal(fence, submission.signal_value)
                .map_err(|e| command_error("signal fence", e))
        }
    }

    fn completed_value(&self, fence: NativeHandle) -> u64 {
        match self.fences.get(&fence) {
            Some(fence) => unsafe { fence.GetCompletedValue() },
            None => {
                tracing::error!(?fence, "Reading unknown fence");
                0
            }
        }
    }

    fn wait_fence(&mut self, fence: NativeHandle, value: u64) -> Result<()> {
        let fence = self
            .fences
            .get(&fence)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("unknown fence {:?}", fence)))?;
        self.context.wait(fence, value)
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.context.wait_idle()
    }

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities> {
        Ok(SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: DXGI_MAX_SWAP_CHAIN_BUFFERS,
            formats: vec![
                TextureFormat::B8G8R8A8_UNorm,
                TextureFormat::R8G8B8A8_UNorm,
                TextureFormat::R16G16B16A16_SFloat,
            ],
            present_modes: vec![PresentMode::Fifo, PresentMode::Immediate],
            current_extent: None,
        })
    }

    fn create_swapchain(&mut self, descriptor: &SwapchainDescriptor) -> Result<NativeSwapchain> {
        let swapchain = Dx12Swapchain::new(&self.context, descriptor)?;

        let mut images = Vec::with_capacity(swapchain.images.len());
        let mut handles = Vec::with_capacity(swapchain.images.len());
        for resource in &swapchain.images {
            let rtv = self.rtv_heap.allocate()?;
            unsafe {
                self.context
                    .device
                    .CreateRenderTargetView(resource, None, self.rtv_heap.cpu_handle(rtv))
            };
            let handle = self.allocate_id();
            let view = self.allocate_id();
            self.textures.insert(
                handle,
                Dx12Texture {
                    resource: resource.clone(),
                    format: swapchain.format,
                    dimension: TextureDimension::Texture2D,
                    mip_levels: 1,
                    rtv: Some(rtv),
                    dsv: None,
                    swapchain_image: true,
                },
            );
            images.push(NativeTexture { handle, view });
            handles.push(handle);
        }

        let handle = self.allocate_id();
        self.swapchains.insert(handle, SwapchainRecord { swapchain, images: handles });
        Ok(NativeSwapchain { handle, images })
    }

    fn destroy_swapchain(&mut self, swapchain: NativeHandle) {
        let Some(record) = self.swapchains.remove(&swapchain) else {
            return;
        };
        // 缓冲区引用必须全部释放后才能在同一窗口上创建新交换链
        if let Err(e) = self.context.wait_idle() {
            tracing::error!(error = %e, "Failed to wait idle before destroying swapchain");
        }
        for image in record.images {
            if let Some(texture) = self.textures.remove(&image) {
                self.release_texture(texture);
            }
        }
    }

    fn acquire_next_image(&mut self, swapchain: NativeHandle, _frame: u32) -> Result<AcquireStatus> {
        let record = self
            .swapchains
            .get(&swapchain)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("unknown swapchain {:?}", swapchain)))?;
        Ok(AcquireStatus::Acquired(record.swapchain.current_index()))
    }

    fn present(&mut self, swapchain: NativeHandle, _image_index: u32, _frame: u32) -> Result<PresentStatus> {
        let record = self
            .swapchains
            .get(&swapchain)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("unknown swapchain {:?}", swapchain)))?;
        record.swapchain.present()
    }
}

impl Drop for Dx12Device {
    fn drop(&mut self) {
        // 其余 COM 对象随字段释放，必须先等 GPU 空闲
        if let Err(e) = self.context.wait_idle() {
            tracing::error!(error = %e, "Failed to wait idle before destroying device");
        }
        for (_, buffer) in self.buffers.drain() {
            if buffer.mapped.is_some() {
                unsafe { buffer.resource.Unmap(0, None) };
            }
        }
        tracing::debug!("DX12 device destroyed");
    }
}
