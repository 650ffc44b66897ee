//! Client property queries and device requests.

use serde::Serialize;

/// Id reported for the 3D core.
pub const DEVICE_3D0_ID: u32 = 1;

/// `ShadowProp::flags` bit set once the shared status block is mapped.
pub const SHADOW_FLAGS_INITIALIZED: u32 = 0x0000_0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyRequest {
    DeviceInfo,
    DeviceShadow,
    MmuEnable,
    InterruptWaits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub chip_id: u32,
    pub mmu_enabled: bool,
    /// Numeric core revision, e.g. 225.
    pub gpu_id: u32,
    pub gmem_gpubaseaddr: u32,
    pub gmem_sizebytes: u32,
}

/// Where clients can read the shared status block directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ShadowProp {
    pub gpuaddr: u64,
    pub size: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Property {
    DeviceInfo(DeviceInfo),
    DeviceShadow(ShadowProp),
    MmuEnable(bool),
    InterruptWaits(bool),
}

/// Device-specific requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    SetBinBaseOffset { context_id: u32, offset: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_serialize_with_a_type_tag() {
        let json = serde_json::to_value(Property::MmuEnable(true)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "mmu_enable", "value": true}));
    }
}
