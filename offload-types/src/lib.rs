use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Vulkan,
    Metal,
    Dx12,
    Gl,
    OpenCl,
    Host,
}

impl Platform {
    /// Preference order used when a selector lists no platforms.
    pub const ALL: [Platform; 6] = [
        Platform::Vulkan,
        Platform::Metal,
        Platform::Dx12,
        Platform::Gl,
        Platform::OpenCl,
        Platform::Host,
    ];
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Any,
    Gpu,
    Cpu,
    Accelerator,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceSelector {
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub platform_index: usize,
    #[serde(default)]
    pub device_index: usize,
}

impl DeviceSelector {
    pub fn platforms(&self) -> &[Platform] {
        if self.platforms.is_empty() {
            &Platform::ALL
        } else {
            &self.platforms
        }
    }

    pub fn allows(&self, platform: Platform) -> bool {
        self.platforms().contains(&platform)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Wgsl,
    OpenClC,
    SpirV,
    ClBinary,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Source,
    Binary,
}

impl Dialect {
    pub fn load_mode(self) -> LoadMode {
        match self {
            Dialect::Wgsl | Dialect::OpenClC => LoadMode::Source,
            Dialect::SpirV | Dialect::ClBinary => LoadMode::Binary,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProgramSource {
    pub dialect: Dialect,
    pub mode: LoadMode,
    pub path: PathBuf,
    #[serde(default)]
    pub build_options: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    U8,
    I32,
    U32,
    F32,
    I64,
    F64,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    HostWrite,
    ReadWrite,
    WriteOnly,
}

impl AccessMode {
    pub fn kernel_reads(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn kernel_writes(self) -> bool {
        matches!(self, AccessMode::ReadWrite | AccessMode::WriteOnly)
    }

    /// Whether the loop re-uploads the buffer before every dispatch,
    /// independent of hook activity.
    pub fn upload_each_iteration(self) -> bool {
        matches!(self, AccessMode::HostWrite | AccessMode::ReadWrite)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BufferSpec {
    pub name: String,
    pub element: ElementType,
    pub len: usize,
    pub access: AccessMode,
    #[serde(default)]
    pub reference: bool,
    #[serde(default)]
    pub tolerance: Option<f64>,
}

impl BufferSpec {
    pub fn byte_len(&self) -> usize {
        self.len * self.element.size()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarValue {
    I32(i32),
    U32(u32),
    F32(f32),
    I64(i64),
    U64(u64),
    F64(f64),
}

impl ScalarValue {
    pub fn size(&self) -> usize {
        match self {
            ScalarValue::I32(_) | ScalarValue::U32(_) | ScalarValue::F32(_) => 4,
            ScalarValue::I64(_) | ScalarValue::U64(_) | ScalarValue::F64(_) => 8,
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match *self {
            ScalarValue::I32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::U32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::F32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::I64(v) => v.to_le_bytes().to_vec(),
            ScalarValue::U64(v) => v.to_le_bytes().to_vec(),
            ScalarValue::F64(v) => v.to_le_bytes().to_vec(),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::I32(v) => write!(f, "{v}i32"),
            ScalarValue::U32(v) => write!(f, "{v}u32"),
            ScalarValue::F32(v) => write!(f, "{v}f32"),
            ScalarValue::I64(v) => write!(f, "{v}i64"),
            ScalarValue::U64(v) => write!(f, "{v}u64"),
            ScalarValue::F64(v) => write!(f, "{v}f64"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScalarSpec {
    pub name: String,
    pub value: ScalarValue,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ArgSpec {
    Buffer { name: String },
    Scalar { name: String },
    Local { bytes: usize },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkShape {
    pub global: Vec<usize>,
    #[serde(default)]
    pub local: Option<Vec<usize>>,
}

impl WorkShape {
    pub fn linear(global: usize, local: Option<usize>) -> Self {
        Self {
            global: vec![global],
            local: local.map(|l| vec![l]),
        }
    }

    pub fn dims(&self) -> usize {
        self.global.len()
    }

    /// Work-group size per dimension, 1 where none was declared.
    pub fn local_or_unit(&self) -> Vec<usize> {
        match &self.local {
            Some(local) => local.clone(),
            None => vec![1; self.global.len()],
        }
    }

    /// Number of work-groups per dimension, padded to three dimensions.
    pub fn groups(&self) -> [u32; 3] {
        let local = self.local_or_unit();
        let mut out = [1u32; 3];
        for (d, (&g, &l)) in self.global.iter().zip(local.iter()).enumerate().take(3) {
            out[d] = g.div_ceil(l.max(1)) as u32;
        }
        out
    }

    pub fn invocations(&self) -> usize {
        self.global.iter().product()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KernelSpec {
    pub name: String,
    pub args: Vec<ArgSpec>,
    pub work: WorkShape,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    SingleShot,
    Iterative,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KernelDescriptor {
    pub name: String,
    #[serde(default)]
    pub device: DeviceSelector,
    pub program: Vec<ProgramSource>,
    pub kernels: Vec<KernelSpec>,
    pub buffers: Vec<BufferSpec>,
    #[serde(default)]
    pub scalars: Vec<ScalarSpec>,
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl KernelDescriptor {
    pub fn buffer(&self, name: &str) -> Option<&BufferSpec> {
        self.buffers.iter().find(|b| b.name == name)
    }

    pub fn scalar(&self, name: &str) -> Option<&ScalarSpec> {
        self.scalars.iter().find(|s| s.name == name)
    }
}
