//! Metal 设备与 `CAMetalLayer`

use core_graphics_types::geometry::CGSize;
use metal::{CommandQueue, Device, MTLPixelFormat, MetalLayer};
use objc::runtime::YES;
use raw_window_handle::RawWindowHandle;

use crate::core::config::DeviceConfig;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::SurfaceTarget;

pub struct MetalContext {
    pub device: Device,
    pub queue: CommandQueue,
    pub layer: MetalLayer,
    pub device_name: String,
}

impl MetalContext {
    pub fn new(config: &DeviceConfig, target: &SurfaceTarget) -> Result<Self> {
        let device = Device::system_default()
            .ok_or_else(|| GraphicsError::DeviceCreation("No Metal device available".to_string()))?;
        let device_name = device.name().to_string();
        tracing::info!(device = %device_name, application = %config.application_name, "Metal device selected");

        let queue = device.new_command_queue();

        let layer = MetalLayer::new();
        layer.set_device(&device);
        layer.set_pixel_format(MTLPixelFormat::BGRA8Unorm);
        layer.set_presents_with_transaction(false);
        layer.set_drawable_size(CGSize::new(target.size.width as f64, target.size.height as f64));

        match target.window {
            RawWindowHandle::AppKit(handle) => unsafe {
                use cocoa::appkit::NSView;
                let view = handle.ns_view.as_ptr() as cocoa::base::id;
                view.setWantsLayer(YES);
                view.setLayer(layer.as_ref() as *const _ as _);
            },
            other => {
                return Err(GraphicsError::DeviceCreation(format!(
                    "Metal requires an AppKit window, got {:?}",
                    other
                ))
                .into())
            }
        }

        Ok(Self {
            device,
            queue,
            layer,
            device_name,
        })
    }
}
