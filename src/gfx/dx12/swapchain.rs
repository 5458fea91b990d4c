//! DXGI 交换链
//!
//! 使用 flip 模型。DXGI 不会报告交换链过期，窗口尺寸变化由上层的
//! resize 事件驱动重建。

use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use super::context::Dx12Context;
use super::conversion;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{PresentMode, PresentStatus, SwapchainDescriptor};
use crate::renderer::resource::TextureFormat;

pub struct Dx12Swapchain {
    pub swapchain: IDXGISwapChain3,
    pub images: Vec<ID3D12Resource>,
    pub format: TextureFormat,
    sync_interval: u32,
}

impl Dx12Swapchain {
    pub fn new(context: &Dx12Context, descriptor: &SwapchainDescriptor) -> Result<Self> {
        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: descriptor.size.width,
            Height: descriptor.size.height,
            Format: conversion::dxgi_format(descriptor.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                ..Default::default()
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: descriptor.image_count,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            ..Default::default()
        };

        unsafe {
            let swapchain: IDXGISwapChain1 = context
                .factory
                .CreateSwapChainForHwnd(&context.queue, context.hwnd, &desc, None, None)
                .map_err(|e| GraphicsError::SwapchainError(format!("Failed to create swap chain: {:?}", e)))?;
            let swapchain: IDXGISwapChain3 = windows::core::Interface::cast(&swapchain)
                .map_err(|e| GraphicsError::SwapchainError(format!("Failed to cast swap chain: {:?}", e)))?;

            let images = (0..descriptor.image_count)
                .map(|index| swapchain.GetBuffer::<ID3D12Resource>(index))
                .collect::<windows::core::Result<Vec<_>>>()
                .map_err(|e| GraphicsError::SwapchainError(format!("Failed to get swap chain buffer: {:?}", e)))?;

            tracing::debug!(
                width = descriptor.size.width,
                height = descriptor.size.height,
                buffers = descriptor.image_count,
                "Swap chain created"
            );

            Ok(Self {
                swapchain,
                images,
                format: descriptor.format,
                sync_interval: if descriptor.present_mode == PresentMode::Fifo { 1 } else { 0 },
            })
        }
    }

    pub fn current_index(&self) -> u32 {
        unsafe { self.swapchain.GetCurrentBackBufferIndex() }
    }

    pub fn present(&self) -> Result<PresentStatus> {
        let result = unsafe { self.swapchain.Present(self.sync_interval, DXGI_PRESENT(0)) };
        if result == DXGI_ERROR_DEVICE_REMOVED || result == DXGI_ERROR_DEVICE_RESET {
            return Err(GraphicsError::DeviceLost(format!("Present failed: {:?}", result)).into());
        }
        result
            .ok()
            .map_err(|e| GraphicsError::SwapchainError(format!("Failed to present: {:?}", e)))?;
        Ok(PresentStatus::Presented)
    }
}
