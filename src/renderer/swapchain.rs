//! 交换链与呈现
//!
//! 负责从呈现引擎的能力中选出缓冲数量、呈现模式与格式，创建原生交换链，
//! 并把每张交换链图像包装成一个 [`Texture`]（`drawable_index` 为图像索引）。
//!
//! 帧内第一次获取可绘制对象时向后端请求下一张图像，之后同一帧内的请求
//! 返回同一张图像，直到呈现为止。

use super::resource::{NativeHandle, Size, Texture, TextureDescriptor, TextureFormat, TextureUsage, INVALID_RESOURCE_INDEX};
use crate::core::config::RendererConfig;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{
    AcquireStatus, NativeDevice, NativeSwapchain, PresentMode, PresentStatus, SurfaceCapabilities,
    SwapchainDescriptor,
};

/// 三缓冲的图像数
const TRIPLE_BUFFERING: u32 = 3;
/// 双缓冲的图像数
const DOUBLE_BUFFERING: u32 = 2;

/// 在途帧数：请求三缓冲且呈现引擎支持 3 张图像时为 3，否则为 2
pub fn select_frames_in_flight(capabilities: &SurfaceCapabilities, triple_buffering: bool) -> u32 {
    let supports_three = capabilities.min_image_count <= TRIPLE_BUFFERING
        && (capabilities.max_image_count == 0 || TRIPLE_BUFFERING <= capabilities.max_image_count);
    if triple_buffering && supports_three {
        TRIPLE_BUFFERING
    } else {
        DOUBLE_BUFFERING
    }
}

/// 关闭垂直同步时用 `Immediate`，否则优先 `Mailbox`，最后 `Fifo`
pub fn select_present_mode(capabilities: &SurfaceCapabilities, vsync: bool) -> PresentMode {
    if !vsync && capabilities.present_modes.contains(&PresentMode::Immediate) {
        return PresentMode::Immediate;
    }
    if vsync && capabilities.present_modes.contains(&PresentMode::Mailbox) {
        return PresentMode::Mailbox;
    }
    PresentMode::Fifo
}

/// 优先 `B8G8R8A8_UNorm`，其次 `R8G8B8A8_UNorm`，否则取第一个
pub fn select_format(capabilities: &SurfaceCapabilities) -> Option<TextureFormat> {
    [TextureFormat::B8G8R8A8_UNorm, TextureFormat::R8G8B8A8_UNorm]
        .into_iter()
        .find(|format| capabilities.formats.contains(format))
        .or_else(|| capabilities.formats.first().copied())
}

/// 交换链图像数：不少于在途帧数，且落在呈现引擎允许的区间内
fn select_image_count(capabilities: &SurfaceCapabilities, frames_in_flight: u32) -> u32 {
    let count = frames_in_flight.max(capabilities.min_image_count);
    if capabilities.max_image_count == 0 {
        count
    } else {
        count.min(capabilities.max_image_count)
    }
}

/// 交换链
#[derive(Debug, Default)]
pub struct Swapchain {
    native: Option<NativeSwapchain>,
    descriptor: Option<SwapchainDescriptor>,
    drawables: Vec<Texture>,
    /// 本帧已获取的图像索引
    current: Option<u32>,
}

impl Swapchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.native.is_some()
    }

    pub fn handle(&self) -> NativeHandle {
        self.native.as_ref().map_or(NativeHandle::NULL, |native| native.handle)
    }

    pub fn descriptor(&self) -> Option<&SwapchainDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn size(&self) -> Size {
        self.descriptor.map_or(Size::ZERO, |descriptor| descriptor.size)
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.descriptor.map_or(DOUBLE_BUFFERING, |descriptor| descriptor.frames_in_flight)
    }

    pub fn image_count(&self) -> u32 {
        self.drawables.len() as u32
    }

    pub fn drawables(&self) -> &[Texture] {
        &self.drawables
    }

    /// 本帧已获取的可绘制对象
    pub fn current(&self) -> Option<&Texture> {
        self.current.and_then(|index| self.drawables.get(index as usize))
    }

    pub fn current_index(&self) -> Option<u32> {
        self.current
    }

    /// 按渲染器配置与期望尺寸（重新）创建交换链
    ///
    /// 调用者负责先让设备空闲。呈现引擎给出当前尺寸时以它为准。
    pub fn configure(
        &mut self,
        native: &mut dyn NativeDevice,
        config: &RendererConfig,
        requested_size: Size,
    ) -> Result<()> {
        let capabilities = native.surface_capabilities()?;
        let frames_in_flight = select_frames_in_flight(&capabilities, config.triple_buffering_enabled);
        let present_mode = select_present_mode(&capabilities, config.vsync);
        self.build(native, &capabilities, frames_in_flight, present_mode, requested_size)
    }

    /// 以相同的在途帧数与呈现模式按新尺寸重建（表面过期时）
    pub fn recreate(&mut self, native: &mut dyn NativeDevice, requested_size: Size) -> Result<()> {
        let Some(previous) = self.descriptor else {
            return Err(GraphicsError::SwapchainError("swapchain was never configured".to_string()).into());
        };
        let capabilities = native.surface_capabilities()?;
        self.build(native, &capabilities, previous.frames_in_flight, previous.present_mode, requested_size)
    }

    fn build(
        &mut self,
        native: &mut dyn NativeDevice,
        capabilities: &SurfaceCapabilities,
        frames_in_flight: u32,
        present_mode: PresentMode,
        requested_size: Size,
    ) -> Result<()> {
        let format = select_format(capabilities)
            .ok_or_else(|| GraphicsError::SwapchainError("surface reports no formats".to_string()))?;
        let size = capabilities.current_extent.unwrap_or(requested_size);
        let descriptor = SwapchainDescriptor {
            size,
            format,
            image_count: select_image_count(capabilities, frames_in_flight),
            present_mode,
            frames_in_flight,
        };

        self.destroy(native);
        let swapchain = native.create_swapchain(&descriptor)?;

        let texture_descriptor =
            TextureDescriptor::texture_2d(size.width, size.height, format, TextureUsage::ATTACHMENT).with_name("backbuffer");
        self.drawables = swapchain
            .images
            .iter()
            .enumerate()
            .map(|(index, image)| Texture {
                handle: image.handle,
                view: image.view,
                descriptor: texture_descriptor.clone(),
                resource_view: INVALID_RESOURCE_INDEX,
                mip_levels: 1,
                drawable_index: Some(index as u32),
            })
            .collect();

        tracing::info!(
            width = size.width,
            height = size.height,
            format = ?format,
            present_mode = ?present_mode,
            images = self.drawables.len(),
            frames_in_flight,
            "Swapchain configured"
        );

        self.native = Some(swapchain);
        self.descriptor = Some(descriptor);
        Ok(())
    }

    /// 获取下一张图像；本帧已获取过时直接返回
    pub fn acquire(&mut self, native: &mut dyn NativeDevice, frame: u32) -> Result<AcquireStatus> {
        if let Some(index) = self.current {
            return Ok(AcquireStatus::Acquired(index));
        }
        let handle = self.handle();
        if handle.is_null() {
            return Err(GraphicsError::SwapchainError("no swapchain to acquire from".to_string()).into());
        }
        let status = native.acquire_next_image(handle, frame)?;
        if let AcquireStatus::Acquired(index) = status {
            self.current = Some(index);
        }
        Ok(status)
    }

    /// 呈现本帧获取的图像；没有获取过时什么也不做
    pub fn present(&mut self, native: &mut dyn NativeDevice, frame: u32) -> Result<PresentStatus> {
        let Some(index) = self.current.take() else {
            return Ok(PresentStatus::Presented);
        };
        native.present(self.handle(), index, frame)
    }

    /// 丢弃本帧的获取记录
    pub fn clear_current(&mut self) {
        self.current = None;
    }

    /// 销毁原生交换链，调用者负责设备空闲
    pub fn destroy(&mut self, native: &mut dyn NativeDevice) {
        if let Some(swapchain) = self.native.take() {
            native.destroy_swapchain(swapchain.handle);
        }
        self.drawables.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::HeadlessConfig;
    use crate::gfx::headless::HeadlessDevice;

    fn capabilities(min: u32, max: u32) -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: min,
            max_image_count: max,
            formats: vec![TextureFormat::R8G8B8A8_SRGB, TextureFormat::R8G8B8A8_UNorm],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
            current_extent: None,
        }
    }

    #[test]
    fn test_frames_in_flight_selection() {
        assert_eq!(select_frames_in_flight(&capabilities(2, 3), true), 3);
        assert_eq!(select_frames_in_flight(&capabilities(2, 3), false), 2);
        // 上限为 2 时回退双缓冲
        assert_eq!(select_frames_in_flight(&capabilities(1, 2), true), 2);
        // 0 表示无上限
        assert_eq!(select_frames_in_flight(&capabilities(2, 0), true), 3);
        assert_eq!(select_frames_in_flight(&capabilities(4, 8), true), 2);
    }

    #[test]
    fn test_present_mode_selection() {
        let caps = capabilities(2, 3);
        assert_eq!(select_present_mode(&caps, true), PresentMode::Mailbox);
        // 不支持 Immediate 时关闭 vsync 也回到 Fifo
        assert_eq!(select_present_mode(&caps, false), PresentMode::Fifo);

        let mut caps = caps;
        caps.present_modes.push(PresentMode::Immediate);
        assert_eq!(select_present_mode(&caps, false), PresentMode::Immediate);

        caps.present_modes = vec![PresentMode::Fifo];
        assert_eq!(select_present_mode(&caps, true), PresentMode::Fifo);
    }

    #[test]
    fn test_format_selection() {
        let mut caps = capabilities(2, 3);
        assert_eq!(select_format(&caps), Some(TextureFormat::R8G8B8A8_UNorm));
        caps.formats.push(TextureFormat::B8G8R8A8_UNorm);
        assert_eq!(select_format(&caps), Some(TextureFormat::B8G8R8A8_UNorm));
        caps.formats = vec![TextureFormat::R16G16B16A16_SFloat];
        assert_eq!(select_format(&caps), Some(TextureFormat::R16G16B16A16_SFloat));
        caps.formats.clear();
        assert_eq!(select_format(&caps), None);
    }

    #[test]
    fn test_configure_and_acquire_once_per_frame() {
        let (mut native, controller) = HeadlessDevice::new(&HeadlessConfig::default(), Size::new(800, 600));
        let mut swapchain = Swapchain::new();
        swapchain.configure(&mut native, &RendererConfig::default(), Size::new(1, 1)).unwrap();

        assert_eq!(swapchain.frames_in_flight(), 3);
        assert_eq!(swapchain.image_count(), 3);
        // 呈现引擎给出的尺寸优先
        assert_eq!(swapchain.size(), Size::new(800, 600));
        assert!(swapchain.drawables().iter().all(Texture::is_backbuffer));

        assert_eq!(swapchain.acquire(&mut native, 0).unwrap(), AcquireStatus::Acquired(0));
        assert_eq!(swapchain.acquire(&mut native, 0).unwrap(), AcquireStatus::Acquired(0));
        swapchain.present(&mut native, 0).unwrap();
        assert_eq!(swapchain.acquire(&mut native, 1).unwrap(), AcquireStatus::Acquired(1));
        assert_eq!(controller.counters().presents, 1);
    }

    #[test]
    fn test_recreate_keeps_frame_count() {
        let (mut native, controller) = HeadlessDevice::new(&HeadlessConfig::default(), Size::new(800, 600));
        let mut swapchain = Swapchain::new();
        let config = RendererConfig {
            triple_buffering_enabled: false,
            ..RendererConfig::default()
        };
        swapchain.configure(&mut native, &config, Size::ZERO).unwrap();
        assert_eq!(swapchain.frames_in_flight(), 2);

        controller.resize_surface(1024, 768);
        assert_eq!(swapchain.acquire(&mut native, 0).unwrap(), AcquireStatus::OutOfDate);
        swapchain.recreate(&mut native, Size::ZERO).unwrap();
        assert_eq!(swapchain.frames_in_flight(), 2);
        assert_eq!(swapchain.size(), Size::new(1024, 768));
        assert_eq!(controller.counters().swapchain_creations, 2);
    }
}
