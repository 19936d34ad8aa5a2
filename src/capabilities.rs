//! Device capability probe

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuCapabilities {
    pub supports_webgl: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCapabilities {
    /// Total device memory in MB
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub gpu: GpuCapabilities,
    pub memory: MemoryCapabilities,
    #[serde(default)]
    pub is_mobile: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            gpu: GpuCapabilities { supports_webgl: true },
            memory: MemoryCapabilities { total: 8192 },
            is_mobile: false,
        }
    }
}

/// Synchronous, side-effect-free
pub trait CapabilityProbe: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;
}

/// Probe that reports a fixed capability set
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    capabilities: DeviceCapabilities,
}

impl StaticProbe {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self { capabilities }
    }

    pub fn low_end() -> Self {
        Self::new(DeviceCapabilities {
            gpu: GpuCapabilities { supports_webgl: false },
            memory: MemoryCapabilities { total: 1024 },
            is_mobile: true,
        })
    }
}

impl CapabilityProbe for StaticProbe {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }
}
