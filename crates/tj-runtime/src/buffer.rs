//! Device-resident byte buffers.

use crate::device::Device;
use tj_core::AbstractValue;

/// A contiguous memory region on a specific device, tagged with the abstract
/// type its bytes encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    aval: AbstractValue,
    device: Device,
}

impl Buffer {
    #[must_use]
    pub fn new(data: Vec<u8>, aval: AbstractValue, device: Device) -> Self {
        Self { data, aval, device }
    }

    /// Zero-byte sequencing marker.
    #[must_use]
    pub fn token(device: Device) -> Self {
        Self::new(Vec::new(), AbstractValue::Token, device)
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn aval(&self) -> &AbstractValue {
        &self.aval
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Same bytes, owned by `device`.
    #[must_use]
    pub fn relocated(&self, device: Device) -> Self {
        Self::new(self.data.clone(), self.aval.clone(), device)
    }
}
