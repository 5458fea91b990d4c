//! 着色器与着色器库
//!
//! 本层不编译着色器。字节码（SPIR-V / DXIL / metallib）由构建工具离线生成，
//! 连同反射信息一起登记在一份 TOML 清单中：
//!
//! ```toml
//! [[shader]]
//! entry_point = "forwardVertex"
//! stage = "vertex"
//! path = "forward.vert.spv"
//! push_constant_size = 64
//!
//! [[shader.binding]]
//! index = 0
//! slot = 0
//! kind = "storage_buffer"
//! ```
//!
//! `index` 是调用者使用的逻辑索引，`slot` 是后端实际的绑定位置。
//! `path` 相对清单所在目录解析，可以省略（headless 后端不需要字节码）。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::resource::NativeHandle;
use crate::core::error::{ConfigError, DistGfxError, GraphicsError, Result};

/// 着色器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn name(&self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }
}

/// 绑定的资源类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    SampledTexture,
    StorageTexture,
}

impl BindingKind {
    pub fn is_buffer(&self) -> bool {
        matches!(self, BindingKind::UniformBuffer | BindingKind::StorageBuffer)
    }
}

/// 反射得到的一个绑定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderBinding {
    /// 逻辑索引
    pub index: u32,
    /// 后端绑定位置
    pub slot: u32,
    pub kind: BindingKind,
}

/// 着色器反射信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    pub bindings: Vec<ShaderBinding>,
    pub push_constant_size: u32,
}

impl ShaderReflection {
    /// 按逻辑索引查找绑定
    pub fn resolve(&self, index: u32) -> Option<&ShaderBinding> {
        self.bindings.iter().find(|binding| binding.index == index)
    }
}

/// 着色器
///
/// 由 `GraphicsDevice::create_shader` 按入口点缓存，克隆只复制句柄。
#[derive(Debug, Clone)]
pub struct Shader {
    pub(crate) handle: NativeHandle,
    pub(crate) entry_point: String,
    pub(crate) stage: ShaderStage,
    pub(crate) reflection: Arc<ShaderReflection>,
}

impl Shader {
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }
}

impl PartialEq for Shader {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Shader {}

/// 清单中的一项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaderEntry {
    pub entry_point: String,
    pub stage: ShaderStage,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub push_constant_size: u32,
    #[serde(default, rename = "binding")]
    pub bindings: Vec<ShaderBinding>,
}

impl ShaderEntry {
    pub fn new(entry_point: impl Into<String>, stage: ShaderStage) -> Self {
        Self {
            entry_point: entry_point.into(),
            stage,
            path: None,
            push_constant_size: 0,
            bindings: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    pub fn with_binding(mut self, index: u32, slot: u32, kind: BindingKind) -> Self {
        self.bindings.push(ShaderBinding { index, slot, kind });
        self
    }

    pub fn reflection(&self) -> ShaderReflection {
        ShaderReflection {
            bindings: self.bindings.clone(),
            push_constant_size: self.push_constant_size,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShaderManifest {
    #[serde(default, rename = "shader")]
    shaders: Vec<ShaderEntry>,
}

/// 着色器库
#[derive(Debug, Clone, Default)]
pub struct ShaderLibrary {
    base_dir: PathBuf,
    entries: HashMap<String, ShaderEntry>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取清单文件
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|_| {
            DistGfxError::Config(ConfigError::FileNotFound(path.display().to_string()))
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_manifest(&contents, base_dir)
    }

    /// 解析清单文本，`path` 相对 `base_dir`
    pub fn from_manifest(contents: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let manifest: ShaderManifest = toml::from_str(contents)
            .map_err(|e| DistGfxError::Config(ConfigError::ParseError(e.to_string())))?;

        let mut library = Self {
            base_dir: base_dir.into(),
            entries: HashMap::new(),
        };
        for entry in manifest.shaders {
            if library.entries.contains_key(&entry.entry_point) {
                return Err(DistGfxError::Config(ConfigError::InvalidValue {
                    field: "shader.entry_point".to_string(),
                    reason: format!("'{}' is declared twice", entry.entry_point),
                }));
            }
            library.insert(entry);
        }

        tracing::debug!(shaders = library.entries.len(), "Shader library loaded");
        Ok(library)
    }

    /// 登记或替换一项
    pub fn insert(&mut self, entry: ShaderEntry) {
        self.entries.insert(entry.entry_point.clone(), entry);
    }

    pub fn get(&self, entry_point: &str) -> Option<&ShaderEntry> {
        self.entries.get(entry_point)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 读取字节码，没有 `path` 的项返回空
    pub fn load_bytecode(&self, entry: &ShaderEntry) -> Result<Vec<u8>> {
        let Some(relative) = &entry.path else {
            return Ok(Vec::new());
        };
        let full_path = self.base_dir.join(relative);
        fs::read(&full_path).map_err(|e| {
            DistGfxError::Graphics(GraphicsError::ShaderCompilation(format!(
                "{}: failed to read '{}': {}",
                entry.entry_point,
                full_path.display(),
                e
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[[shader]]
entry_point = "forwardVertex"
stage = "vertex"
push_constant_size = 64

[[shader.binding]]
index = 0
slot = 0
kind = "storage_buffer"

[[shader.binding]]
index = 1
slot = 3
kind = "uniform_buffer"

[[shader]]
entry_point = "forwardFragment"
stage = "fragment"

[[shader.binding]]
index = 0
slot = 1
kind = "sampled_texture"
"#;

    #[test]
    fn test_manifest_parsing() {
        let library = ShaderLibrary::from_manifest(MANIFEST, ".").unwrap();
        assert_eq!(library.len(), 2);

        let vertex = library.get("forwardVertex").unwrap();
        assert_eq!(vertex.stage, ShaderStage::Vertex);
        assert_eq!(vertex.push_constant_size, 64);
        assert_eq!(vertex.bindings.len(), 2);

        let reflection = vertex.reflection();
        assert_eq!(reflection.resolve(1).map(|b| b.slot), Some(3));
        assert_eq!(reflection.resolve(1).map(|b| b.kind), Some(BindingKind::UniformBuffer));
        assert!(reflection.resolve(2).is_none());

        let fragment = library.get("forwardFragment").unwrap();
        assert_eq!(fragment.bindings[0].kind, BindingKind::SampledTexture);
    }

    #[test]
    fn test_duplicate_entry_point_rejected() {
        let manifest = r#"
[[shader]]
entry_point = "main"
stage = "compute"

[[shader]]
entry_point = "main"
stage = "compute"
"#;
        assert!(ShaderLibrary::from_manifest(manifest, ".").is_err());
    }

    #[test]
    fn test_bytecode_without_path_is_empty() {
        let library = ShaderLibrary::from_manifest(MANIFEST, ".").unwrap();
        let entry = library.get("forwardVertex").unwrap();
        assert!(library.load_bytecode(entry).unwrap().is_empty());
    }

    #[test]
    fn test_missing_bytecode_file_is_shader_error() {
        let library = ShaderLibrary::new();
        let entry = ShaderEntry::new("blur", ShaderStage::Compute).with_path("does/not/exist.spv");
        match library.load_bytecode(&entry) {
            Err(DistGfxError::Graphics(GraphicsError::ShaderCompilation(msg))) => {
                assert!(msg.contains("blur"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_builder() {
        let entry = ShaderEntry::new("cull", ShaderStage::Compute)
            .with_push_constants(16)
            .with_binding(0, 2, BindingKind::StorageTexture);
        assert_eq!(entry.reflection().push_constant_size, 16);
        assert!(!entry.bindings[0].kind.is_buffer());
    }
}
