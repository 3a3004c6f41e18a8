//! Runtime values: host values and device-resident arrays.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::BackendError;
use crate::buffer::Buffer;
use crate::device::Device;
use crate::marshal::value_from_bytes;
use tj_core::{AbstractValue, Value};

/// An array living in a device buffer.
///
/// Clones share the buffer and the deletion flag, so deleting one handle
/// (for example after its buffer was donated) invalidates every clone.
#[derive(Debug, Clone)]
pub struct DeviceArray {
    aval: AbstractValue,
    /// Device the array is committed to, if placement was explicit.
    sticky_device: Option<Device>,
    buffer: Arc<Buffer>,
    deleted: Arc<AtomicBool>,
}

impl DeviceArray {
    #[must_use]
    pub fn new(aval: AbstractValue, sticky_device: Option<Device>, buffer: Buffer) -> Self {
        Self {
            aval,
            sticky_device,
            buffer: Arc::new(buffer),
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn aval(&self) -> &AbstractValue {
        &self.aval
    }

    #[must_use]
    pub fn sticky_device(&self) -> Option<Device> {
        self.sticky_device
    }

    /// Device that physically holds the buffer.
    #[must_use]
    pub fn device(&self) -> Device {
        self.buffer.device()
    }

    pub fn buffer(&self) -> Result<&Buffer, BackendError> {
        if self.is_deleted() {
            return Err(BackendError::DeletedBuffer {
                detail: format!("{} array on {} was deleted or donated", self.aval, self.device()),
            });
        }
        Ok(&self.buffer)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn delete(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Copies the buffer contents back to a host value.
    pub fn to_host(&self) -> Result<Value, BackendError> {
        let buffer = self.buffer()?;
        value_from_bytes(&self.aval, buffer.as_bytes()).map_err(|err| BackendError::TransferFailed {
            source: buffer.device(),
            target: None,
            detail: err.to_string(),
        })
    }
}

/// Runtime kind of a value, used to look up abstraction and transfer rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Scalar,
    Tensor,
    Unit,
    Token,
    DeviceArray,
}

impl ValueKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "Scalar",
            Self::Tensor => "Tensor",
            Self::Unit => "Unit",
            Self::Token => "Token",
            Self::DeviceArray => "DeviceArray",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value passed to or returned from dispatch.
#[derive(Debug, Clone)]
pub enum RuntimeValue {
    Host(Value),
    Device(DeviceArray),
}

impl RuntimeValue {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Host(Value::Scalar(_)) => ValueKind::Scalar,
            Self::Host(Value::Tensor(_)) => ValueKind::Tensor,
            Self::Host(Value::Unit) => ValueKind::Unit,
            Self::Host(Value::Token) => ValueKind::Token,
            Self::Device(_) => ValueKind::DeviceArray,
        }
    }

    #[must_use]
    pub fn is_token(&self) -> bool {
        matches!(self, Self::Host(Value::Token))
    }

    #[must_use]
    pub fn as_device_array(&self) -> Option<&DeviceArray> {
        match self {
            Self::Device(array) => Some(array),
            Self::Host(_) => None,
        }
    }

    /// Host copy of the value; device arrays are read back.
    pub fn to_host(&self) -> Result<Value, BackendError> {
        match self {
            Self::Host(value) => Ok(value.clone()),
            Self::Device(array) => array.to_host(),
        }
    }
}

impl From<Value> for RuntimeValue {
    fn from(value: Value) -> Self {
        Self::Host(value)
    }
}

impl From<DeviceArray> for RuntimeValue {
    fn from(array: DeviceArray) -> Self {
        Self::Device(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::value_to_bytes;

    fn array_of(value: &Value) -> DeviceArray {
        let buffer = Buffer::new(value_to_bytes(value), value.aval(), Device::cpu(0));
        DeviceArray::new(value.aval(), None, buffer)
    }

    #[test]
    fn clones_share_deletion() {
        let array = array_of(&Value::scalar_f32(2.0));
        let alias = array.clone();
        array.delete();
        assert!(alias.is_deleted());
        assert!(matches!(alias.buffer(), Err(BackendError::DeletedBuffer { .. })));
        assert!(alias.to_host().is_err());
    }

    #[test]
    fn reads_back_host_value() {
        let value = Value::vector_i64(&[4, 5]).expect("vector");
        let array = array_of(&value);
        assert_eq!(RuntimeValue::from(array).to_host().expect("read back"), value);
    }

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(RuntimeValue::from(Value::Token).kind(), ValueKind::Token);
        assert_eq!(RuntimeValue::from(Value::scalar_i32(1)).kind(), ValueKind::Scalar);
        assert_eq!(
            RuntimeValue::from(array_of(&Value::scalar_i32(1))).kind(),
            ValueKind::DeviceArray
        );
    }
}
