//! Device identification and placement types.

use serde::{Deserialize, Serialize};

/// Index of a device within its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Cpu,
    Gpu,
    Tpu,
}

impl Platform {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Tpu => "tpu",
        }
    }

    /// Platforms whose executables may reuse a donated input buffer for an
    /// output.
    #[must_use]
    pub fn supports_input_output_aliasing(&self) -> bool {
        matches!(self, Self::Gpu | Self::Tpu)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, comparable handle to one device. The platform doubles as the
/// owning backend's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub platform: Platform,
    pub id: DeviceId,
}

impl Device {
    #[must_use]
    pub fn new(platform: Platform, id: u32) -> Self {
        Self {
            platform,
            id: DeviceId(id),
        }
    }

    #[must_use]
    pub fn cpu(id: u32) -> Self {
        Self::new(Platform::Cpu, id)
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.platform.as_str()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.id.0)
    }
}

/// Metadata about a specific device, as reported by `Backend::devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device: Device,
    /// Host index (0 for single-host setups).
    pub host_id: u32,
    /// Owning process in a multi-process setup.
    pub process_index: u32,
}
