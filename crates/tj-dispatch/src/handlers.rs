//! Result marshaling and host-to-device transfer registries.
//!
//! Result handlers turn the raw output buffers of an execution back into
//! user-visible values; they are chosen per abstract-type family at compile
//! time. Device-put handlers turn user arguments into device buffers; they
//! are chosen per runtime value kind at call time.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tj_core::{AbstractValue, AvalKind, DType, Value};
use tj_runtime::{Backend, BackendError, Buffer, Device, DeviceArray, RuntimeValue, ValueKind};

use crate::error::{DispatchError, TypeError};

/// Converts the buffers of one output into a value.
pub type ResultHandler =
    Arc<dyn Fn(Vec<Buffer>) -> Result<RuntimeValue, DispatchError> + Send + Sync>;

/// Builds the handler for outputs of a given type placed on a given device.
pub type ResultHandlerFactory =
    Arc<dyn Fn(Option<Device>, &AbstractValue) -> ResultHandler + Send + Sync>;

/// Transfers one argument to `device`, returning its flattened buffers.
pub type DevicePutFn = Arc<
    dyn Fn(&RuntimeValue, &dyn Backend, Device) -> Result<Vec<Buffer>, DispatchError>
        + Send
        + Sync,
>;

/// Number of device buffers an output of type `aval` occupies.
#[must_use]
pub fn aval_to_num_buffers(aval: &AbstractValue) -> usize {
    match aval {
        AbstractValue::Unit => 0,
        AbstractValue::Token | AbstractValue::Shaped(_) => 1,
    }
}

#[derive(Clone)]
pub struct ResultHandlerRegistry {
    factories: FxHashMap<AvalKind, ResultHandlerFactory>,
}

impl ResultHandlerRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(AvalKind::Unit, Arc::new(unit_result_handler));
        registry.register(AvalKind::Token, Arc::new(token_result_handler));
        registry.register(AvalKind::ShapedArray, Arc::new(array_result_handler));
        registry
    }

    pub fn register(&mut self, kind: AvalKind, factory: ResultHandlerFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn unregister(&mut self, kind: AvalKind) -> Option<ResultHandlerFactory> {
        self.factories.remove(&kind)
    }

    pub fn handler_for(
        &self,
        device: Option<Device>,
        aval: &AbstractValue,
    ) -> Result<ResultHandler, TypeError> {
        let kind = aval.kind();
        self.factories
            .get(&kind)
            .map(|factory| factory(device, aval))
            .ok_or(TypeError::NoResultHandler { kind })
    }
}

impl Default for ResultHandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ResultHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort();
        f.debug_struct("ResultHandlerRegistry").field("kinds", &kinds).finish()
    }
}

fn unit_result_handler(_device: Option<Device>, _aval: &AbstractValue) -> ResultHandler {
    Arc::new(|_buffers: Vec<Buffer>| Ok(RuntimeValue::Host(Value::Unit)))
}

fn token_result_handler(_device: Option<Device>, _aval: &AbstractValue) -> ResultHandler {
    Arc::new(|_buffers: Vec<Buffer>| Ok(RuntimeValue::Host(Value::Token)))
}

fn array_result_handler(device: Option<Device>, aval: &AbstractValue) -> ResultHandler {
    let aval = aval.clone();
    if aval.as_shaped().is_some_and(|shaped| shaped.dtype == DType::Float0) {
        // Zero-width values carry no data; the buffers are never read.
        return Arc::new(move |_buffers: Vec<Buffer>| -> Result<RuntimeValue, DispatchError> {
            Ok(RuntimeValue::Host(Value::zeros(&aval).map_err(value_error)?))
        });
    }
    Arc::new(move |buffers: Vec<Buffer>| -> Result<RuntimeValue, DispatchError> {
        let buffer = buffers.into_iter().next().ok_or_else(|| BackendError::ExecutionFailed {
            detail: format!("no buffer produced for {aval} output"),
        })?;
        Ok(RuntimeValue::Device(DeviceArray::new(aval.clone(), device, buffer)))
    })
}

fn value_error(err: tj_core::ValueError) -> DispatchError {
    DispatchError::Backend(BackendError::ExecutionFailed {
        detail: err.to_string(),
    })
}

#[derive(Clone)]
pub struct DevicePutRegistry {
    handlers: FxHashMap<ValueKind, DevicePutFn>,
}

impl DevicePutRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(ValueKind::Scalar, Arc::new(put_host_array));
        registry.register(ValueKind::Tensor, Arc::new(put_host_array));
        registry.register(ValueKind::Unit, Arc::new(put_unit));
        registry.register(ValueKind::Token, Arc::new(put_token));
        registry.register(ValueKind::DeviceArray, Arc::new(put_device_array));
        registry
    }

    pub fn register(&mut self, kind: ValueKind, handler: DevicePutFn) {
        self.handlers.insert(kind, handler);
    }

    pub fn unregister(&mut self, kind: ValueKind) -> Option<DevicePutFn> {
        self.handlers.remove(&kind)
    }

    pub fn device_put(
        &self,
        value: &RuntimeValue,
        backend: &dyn Backend,
        device: Device,
    ) -> Result<Vec<Buffer>, DispatchError> {
        let kind = value.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or(TypeError::NoDevicePutHandler { kind })?;
        handler(value, backend, device)
    }
}

impl Default for DevicePutRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for DevicePutRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        f.debug_struct("DevicePutRegistry").field("kinds", &kinds).finish()
    }
}

fn put_host_array(
    value: &RuntimeValue,
    backend: &dyn Backend,
    device: Device,
) -> Result<Vec<Buffer>, DispatchError> {
    match value {
        RuntimeValue::Host(host) => Ok(vec![backend.buffer_from_value(host, device)?]),
        RuntimeValue::Device(array) => Ok(vec![copy_buffer_to_device(array, backend, device)?]),
    }
}

fn put_unit(
    _value: &RuntimeValue,
    _backend: &dyn Backend,
    _device: Device,
) -> Result<Vec<Buffer>, DispatchError> {
    Ok(Vec::new())
}

fn put_token(
    _value: &RuntimeValue,
    _backend: &dyn Backend,
    device: Device,
) -> Result<Vec<Buffer>, DispatchError> {
    Ok(vec![Buffer::token(device)])
}

fn put_device_array(
    value: &RuntimeValue,
    backend: &dyn Backend,
    device: Device,
) -> Result<Vec<Buffer>, DispatchError> {
    let array = value
        .as_device_array()
        .ok_or(TypeError::NoDevicePutHandler { kind: value.kind() })?;
    Ok(vec![copy_buffer_to_device(array, backend, device)?])
}

/// The buffer of `array` as it should be seen on `device`: shared when it is
/// already there, transferred within a backend, or round-tripped through the
/// host across backends.
pub fn copy_buffer_to_device(
    array: &DeviceArray,
    backend: &dyn Backend,
    device: Device,
) -> Result<Buffer, BackendError> {
    let buffer = array.buffer()?;
    if buffer.device() == device {
        return Ok(buffer.clone());
    }
    if buffer.device().platform == backend.platform() {
        return backend.transfer(buffer, device);
    }
    backend.buffer_from_value(&array.to_host()?, device)
}

/// `array` placed on `device`, keeping its abstract type and sticky device.
pub fn copy_device_array_to_device(
    array: &DeviceArray,
    backend: &dyn Backend,
    device: Device,
) -> Result<DeviceArray, BackendError> {
    if array.device() == device && !array.is_deleted() {
        return Ok(array.clone());
    }
    let buffer = copy_buffer_to_device(array, backend, device)?;
    Ok(DeviceArray::new(array.aval().clone(), array.sticky_device(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tj_backend_cpu::CpuBackend;
    use tj_core::Shape;
    use tj_runtime::Platform;

    #[test]
    fn buffer_counts_follow_type_family() {
        assert_eq!(aval_to_num_buffers(&AbstractValue::Unit), 0);
        assert_eq!(aval_to_num_buffers(&AbstractValue::Token), 1);
        assert_eq!(aval_to_num_buffers(&AbstractValue::scalar(DType::F32)), 1);
    }

    #[test]
    fn unit_handler_ignores_buffers() {
        let handler = ResultHandlerRegistry::with_defaults()
            .handler_for(None, &AbstractValue::Unit)
            .expect("unit handler");
        assert!(matches!(handler(Vec::new()), Ok(RuntimeValue::Host(Value::Unit))));
    }

    #[test]
    fn array_handler_wraps_buffer_with_sticky_device() {
        let backend = CpuBackend::new();
        let buffer = backend
            .buffer_from_value(&Value::scalar_i32(5), Device::cpu(0))
            .expect("put");
        let handler = ResultHandlerRegistry::with_defaults()
            .handler_for(Some(Device::cpu(0)), &AbstractValue::scalar(DType::I32))
            .expect("array handler");
        let value = handler(vec![buffer]).expect("handle");
        let array = value.as_device_array().expect("device array");
        assert_eq!(array.sticky_device(), Some(Device::cpu(0)));
        assert_eq!(array.to_host().expect("host"), Value::scalar_i32(5));
    }

    #[test]
    fn float0_handler_returns_zeros_without_buffers() {
        let aval = AbstractValue::shaped(DType::Float0, Shape::vector(3));
        let handler = ResultHandlerRegistry::with_defaults()
            .handler_for(None, &aval)
            .expect("float0 handler");
        let value = handler(Vec::new()).expect("zeros");
        assert_eq!(value.to_host().expect("host").aval(), aval);
    }

    #[test]
    fn missing_result_handler_is_a_type_error() {
        let mut registry = ResultHandlerRegistry::with_defaults();
        registry.unregister(AvalKind::Token);
        assert!(matches!(
            registry.handler_for(None, &AbstractValue::Token),
            Err(TypeError::NoResultHandler {
                kind: AvalKind::Token
            })
        ));
    }

    #[test]
    fn device_put_moves_arrays_between_devices() {
        let backend = CpuBackend::with_device_count(2);
        let registry = DevicePutRegistry::with_defaults();
        let host = RuntimeValue::from(Value::vector_f64(&[1.0, 2.0]).expect("vector"));
        let on_zero = registry.device_put(&host, &backend, Device::cpu(0)).expect("put");
        assert_eq!(on_zero.len(), 1);

        let array =
            DeviceArray::new(host.to_host().expect("host").aval(), None, on_zero[0].clone());
        let moved = registry
            .device_put(&array.into(), &backend, Device::cpu(1))
            .expect("transfer");
        assert_eq!(moved[0].device(), Device::cpu(1));
        assert!(
            registry
                .device_put(&Value::Unit.into(), &backend, Device::cpu(0))
                .expect("unit")
                .is_empty()
        );
    }

    #[test]
    fn arrays_cross_backends_through_the_host() {
        let cpu = CpuBackend::new();
        let gpu = CpuBackend::new().with_platform(Platform::Gpu);
        let buffer = cpu
            .buffer_from_value(&Value::scalar_f32(1.5), Device::cpu(0))
            .expect("put");
        let array = DeviceArray::new(AbstractValue::scalar(DType::F32), None, buffer);
        let gpu0 = Device::new(Platform::Gpu, 0);
        let copied = copy_device_array_to_device(&array, &gpu, gpu0).expect("copy");
        assert_eq!(copied.device(), gpu0);
        assert_eq!(copied.to_host().expect("host"), Value::scalar_f32(1.5));
    }

    #[test]
    fn deleted_arrays_cannot_be_put() {
        let backend = CpuBackend::new();
        let buffer = backend
            .buffer_from_value(&Value::scalar_f32(1.0), Device::cpu(0))
            .expect("put");
        let array = DeviceArray::new(AbstractValue::scalar(DType::F32), None, buffer);
        array.delete();
        let err = DevicePutRegistry::with_defaults()
            .device_put(&array.into(), &backend, Device::cpu(0))
            .expect_err("deleted");
        assert!(matches!(err, DispatchError::Backend(BackendError::DeletedBuffer { .. })));
    }
}
