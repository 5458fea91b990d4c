//! 资源描述与句柄
//!
//! 定义堆、缓冲区、纹理的描述符，以及交给调用者的轻量句柄。
//!
//! # 所有权
//!
//! 原生对象始终由后端持有；`Buffer` / `Texture` 只是可以随意复制的值，
//! 记录原生句柄、描述符和资源视图槽位。销毁一律经由
//! `GraphicsDevice::release_*` 进入帧延迟队列，句柄本身没有 `Drop` 行为。

use bitflags::bitflags;

/// 不透明的原生句柄
///
/// Vulkan 下是对象的 `as_raw()`，DX12 / Metal 下是后端对象表的键，
/// headless 后端是自增 id。0 表示空句柄。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// 着色器可见资源视图槽位
///
/// 资源视图表中的整数索引，着色器通过它访问资源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderResourceIndex(pub u32);

/// 未绑定的资源视图
pub const INVALID_RESOURCE_INDEX: ShaderResourceIndex = ShaderResourceIndex(u32::MAX);

impl ShaderResourceIndex {
    pub fn is_valid(&self) -> bool {
        *self != INVALID_RESOURCE_INDEX
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl Default for ShaderResourceIndex {
    fn default() -> Self {
        INVALID_RESOURCE_INDEX
    }
}

/// 堆的内存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// 仅 GPU 可访问
    Gpu,
    /// CPU 与 GPU 共享（统一内存 / 可映射显存）
    Shared,
    /// CPU 可写，用于上传暂存
    Cpu,
    /// 帧内临时附件（tile memory / lazily allocated）
    Transient,
}

impl MemoryType {
    /// 后端是否允许 CPU 映射写入
    pub fn is_host_visible(&self) -> bool {
        matches!(self, MemoryType::Shared | MemoryType::Cpu)
    }
}

/// 堆描述信息
///
/// 相等只比较内存类型与大小，名称不参与。
#[derive(Debug, Clone)]
pub struct HeapDescriptor {
    /// 调试名称
    pub name: String,
    /// 内存类型
    pub memory_type: MemoryType,
    /// 大小（字节）
    pub size: u64,
}

impl PartialEq for HeapDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.memory_type == other.memory_type && self.size == other.size
    }
}

impl Eq for HeapDescriptor {}

impl HeapDescriptor {
    pub fn new(memory_type: MemoryType, size: u64) -> Self {
        Self {
            name: String::new(),
            memory_type,
            size,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 空闲池中的堆能否满足请求：内存类型相同且容量不小于请求
    pub fn satisfies(&self, requested: &HeapDescriptor) -> bool {
        self.memory_type == requested.memory_type && self.size >= requested.size
    }
}

/// 内存需求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

/// 缓冲区用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// 顶点数据（按存储缓冲区方式拉取）
    Vertex,
    /// 索引缓冲区
    Index,
    /// 常量缓冲区
    Uniform,
    /// 存储缓冲区
    Storage,
    /// 上传暂存，不创建资源视图
    Staging,
}

/// 缓冲区描述信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// 调试名称
    pub name: String,
    /// 大小（字节）
    pub size: u64,
    /// 用途
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            name: String::new(),
            size,
            usage,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 计算对齐后的大小（常量缓冲区要求 256 字节对齐）
    pub fn aligned_size(&self) -> u64 {
        if self.usage == BufferUsage::Uniform {
            (self.size + 255) & !255
        } else {
            self.size
        }
    }
}

/// 二维尺寸（像素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const ZERO: Size = Size { width: 0, height: 0 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// 纹理格式
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8_UNorm,
    R8G8_UNorm,
    R8G8B8A8_UNorm,
    R8G8B8A8_SRGB,
    B8G8R8A8_UNorm,
    B8G8R8A8_SRGB,
    R16G16B16A16_SFloat,
    R32_SFloat,
    R32G32_SFloat,
    R32G32B32A32_SFloat,
    D32_SFloat,
    D24_UNorm_S8_UInt,
    D32_SFloat_S8_UInt,
}

impl TextureFormat {
    /// 是否为深度（或深度模板）格式
    pub fn is_depth_stencil(&self) -> bool {
        matches!(
            self,
            TextureFormat::D32_SFloat | TextureFormat::D24_UNorm_S8_UInt | TextureFormat::D32_SFloat_S8_UInt
        )
    }

    /// 是否带模板分量
    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::D24_UNorm_S8_UInt | TextureFormat::D32_SFloat_S8_UInt)
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self, TextureFormat::R8G8B8A8_SRGB | TextureFormat::B8G8R8A8_SRGB)
    }

    /// 每像素字节数
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R8_UNorm => 1,
            TextureFormat::R8G8_UNorm => 2,
            TextureFormat::R8G8B8A8_UNorm
            | TextureFormat::R8G8B8A8_SRGB
            | TextureFormat::B8G8R8A8_UNorm
            | TextureFormat::B8G8R8A8_SRGB
            | TextureFormat::R32_SFloat
            | TextureFormat::D32_SFloat
            | TextureFormat::D24_UNorm_S8_UInt => 4,
            TextureFormat::R16G16B16A16_SFloat
            | TextureFormat::R32G32_SFloat
            | TextureFormat::D32_SFloat_S8_UInt => 8,
            TextureFormat::R32G32B32A32_SFloat => 16,
        }
    }
}

bitflags! {
    /// 纹理用途位集
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// 着色器采样
        const SAMPLED = 1 << 0;
        /// 着色器读写
        const STORAGE = 1 << 1;
        /// 渲染目标 / 深度附件
        const ATTACHMENT = 1 << 2;
    }
}

/// 纹理维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    Texture2D,
    Texture2DArray,
    Texture3D,
    TextureCube,
}

/// 纹理描述信息
///
/// 除 `name` 外所有字段参与相等比较，作为空闲纹理池的键：
/// 结构相等的两个描述符对应的纹理可以互换。
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    /// 调试名称（不参与比较）
    pub name: String,
    /// 尺寸
    pub size: Size,
    /// 格式
    pub format: TextureFormat,
    /// 用途
    pub usage: TextureUsage,
    /// 维度
    pub dimension: TextureDimension,
    /// 采样数
    pub sample_count: u32,
    /// 是否生成完整 mip 链
    pub use_mip_map: bool,
}

impl PartialEq for TextureDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
            && self.format == other.format
            && self.usage == other.usage
            && self.dimension == other.dimension
            && self.sample_count == other.sample_count
            && self.use_mip_map == other.use_mip_map
    }
}

impl Eq for TextureDescriptor {}

impl TextureDescriptor {
    /// 单采样、无 mip 的 2D 纹理
    pub fn texture_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            name: String::new(),
            size: Size::new(width, height),
            format,
            usage,
            dimension: TextureDimension::Texture2D,
            sample_count: 1,
            use_mip_map: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_mip_map(mut self, use_mip_map: bool) -> Self {
        self.use_mip_map = use_mip_map;
        self
    }

    /// mip 层数：`floor(log2(max(w, h))) + 1`，未启用时为 1
    pub fn mip_levels(&self) -> u32 {
        if self.use_mip_map {
            calculate_mip_levels(self.size)
        } else {
            1
        }
    }

    /// 是否需要着色器可见的资源视图
    ///
    /// 仅用作深度模板目标的纹理不分配槽位。
    pub fn needs_resource_view(&self) -> bool {
        if self.format.is_depth_stencil() && !self.usage.contains(TextureUsage::SAMPLED) {
            return false;
        }
        self.usage.intersects(TextureUsage::SAMPLED | TextureUsage::STORAGE)
    }
}

/// 完整 mip 链的层数
pub fn calculate_mip_levels(size: Size) -> u32 {
    let largest = size.width.max(size.height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// 缓冲区句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub(crate) handle: NativeHandle,
    pub(crate) descriptor: BufferDescriptor,
    pub(crate) resource_view: ShaderResourceIndex,
    pub(crate) heap: NativeHandle,
    pub(crate) offset: u64,
}

impl Buffer {
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn resource_view(&self) -> ShaderResourceIndex {
        self.resource_view
    }

    /// 所在堆的原生句柄
    pub fn heap(&self) -> NativeHandle {
        self.heap
    }

    /// 在堆内的字节偏移
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_valid(&self) -> bool {
        !self.handle.is_null()
    }
}

/// 纹理句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    pub(crate) handle: NativeHandle,
    /// 渲染目标 / 图像视图（RTV、DSV、VkImageView）
    pub(crate) view: NativeHandle,
    pub(crate) descriptor: TextureDescriptor,
    pub(crate) resource_view: ShaderResourceIndex,
    pub(crate) mip_levels: u32,
    /// 交换链图像索引，普通纹理为 `None`
    pub(crate) drawable_index: Option<u32>,
}

impl Texture {
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn view(&self) -> NativeHandle {
        self.view
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> Size {
        self.descriptor.size
    }

    pub fn resource_view(&self) -> ShaderResourceIndex {
        self.resource_view
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// 是否为交换链后备缓冲
    pub fn is_backbuffer(&self) -> bool {
        self.drawable_index.is_some()
    }

    pub fn is_valid(&self) -> bool {
        !self.handle.is_null()
    }
}

/// 即时模式 UI 使用的纹理 id
///
/// DX12 下是 GPU 描述符句柄地址，Vulkan 下是资源视图槽位，
/// Metal 下是 `MTLTexture` 指针。在资源视图存活期间保持不变。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImTextureId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_descriptor_alignment() {
        let desc = BufferDescriptor::new(100, BufferUsage::Uniform);
        assert_eq!(desc.aligned_size(), 256);

        let desc = BufferDescriptor::new(300, BufferUsage::Uniform);
        assert_eq!(desc.aligned_size(), 512);

        // 其它用途不需要对齐
        let desc = BufferDescriptor::new(100, BufferUsage::Vertex);
        assert_eq!(desc.aligned_size(), 100);
    }

    #[test]
    fn test_heap_descriptor_satisfies() {
        let pooled = HeapDescriptor::new(MemoryType::Gpu, 1 << 20);
        assert!(pooled.satisfies(&HeapDescriptor::new(MemoryType::Gpu, 1 << 20)));
        assert!(pooled.satisfies(&HeapDescriptor::new(MemoryType::Gpu, 4096)));
        assert!(!pooled.satisfies(&HeapDescriptor::new(MemoryType::Gpu, (1 << 20) + 1)));
        assert!(!pooled.satisfies(&HeapDescriptor::new(MemoryType::Cpu, 4096)));
    }

    #[test]
    fn test_heap_descriptor_equality_ignores_name() {
        let a = HeapDescriptor::new(MemoryType::Gpu, 4096).with_name("shadow");
        let b = HeapDescriptor::new(MemoryType::Gpu, 4096).with_name("gbuffer");
        assert_eq!(a, b);
        assert_ne!(a, HeapDescriptor::new(MemoryType::Shared, 4096));
        assert_ne!(a, HeapDescriptor::new(MemoryType::Gpu, 8192));
    }

    #[test]
    fn test_texture_descriptor_equality_ignores_name() {
        let a = TextureDescriptor::texture_2d(512, 512, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED)
            .with_name("albedo");
        let b = TextureDescriptor::texture_2d(512, 512, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED)
            .with_name("normal");
        assert_eq!(a, b);

        let c = b.clone().with_sample_count(4);
        assert_ne!(a, c);

        let d = TextureDescriptor::texture_2d(512, 512, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED | TextureUsage::ATTACHMENT);
        assert_ne!(a, d);
    }

    #[test]
    fn test_mip_levels() {
        assert_eq!(calculate_mip_levels(Size::new(1, 1)), 1);
        assert_eq!(calculate_mip_levels(Size::new(512, 512)), 10);
        assert_eq!(calculate_mip_levels(Size::new(1920, 1080)), 11);
        assert_eq!(calculate_mip_levels(Size::new(0, 0)), 1);

        let desc = TextureDescriptor::texture_2d(256, 64, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED);
        assert_eq!(desc.mip_levels(), 1);
        assert_eq!(desc.with_mip_map(true).mip_levels(), 9);
    }

    #[test]
    fn test_depth_targets_have_no_resource_view() {
        let depth = TextureDescriptor::texture_2d(64, 64, TextureFormat::D32_SFloat, TextureUsage::ATTACHMENT);
        assert!(!depth.needs_resource_view());

        let sampled_depth = TextureDescriptor::texture_2d(64, 64, TextureFormat::D32_SFloat, TextureUsage::ATTACHMENT | TextureUsage::SAMPLED);
        assert!(sampled_depth.needs_resource_view());

        let color = TextureDescriptor::texture_2d(64, 64, TextureFormat::R8G8B8A8_UNorm, TextureUsage::SAMPLED);
        assert!(color.needs_resource_view());
    }

    #[test]
    fn test_invalid_resource_index() {
        assert!(!INVALID_RESOURCE_INDEX.is_valid());
        assert!(ShaderResourceIndex(0).is_valid());
        assert_eq!(ShaderResourceIndex::default(), INVALID_RESOURCE_INDEX);
    }
}
