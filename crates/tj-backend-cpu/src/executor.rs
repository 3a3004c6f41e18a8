use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tj_core::{Primitive, Value};
use tj_runtime::marshal::value_to_bytes;
use tj_runtime::{
    Backend, BackendError, Buffer, CompileOptions, Computation, Device, DeviceInfo, Executable,
    Instruction, Platform,
};

use crate::executable::CpuExecutable;

/// Host backend exposing `device_count` logical devices per process.
///
/// The platform tag is configurable so that accelerator-only behavior (buffer
/// donation) can be exercised on the host. Only process 0 is local.
#[derive(Debug)]
pub struct CpuBackend {
    platform: Platform,
    device_count: u32,
    process_count: u32,
    version_string: String,
    compile_count: AtomicU64,
}

impl CpuBackend {
    /// A backend with a single device.
    #[must_use]
    pub fn new() -> Self {
        Self::with_device_count(1)
    }

    /// A backend exposing multiple logical devices. Useful for exercising
    /// replicated execution without accelerator hardware.
    #[must_use]
    pub fn with_device_count(count: u32) -> Self {
        Self {
            platform: Platform::Cpu,
            device_count: count.max(1),
            process_count: 1,
            version_string: format!("tj-backend-cpu/{}", env!("CARGO_PKG_VERSION")),
            compile_count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_process_count(mut self, count: u32) -> Self {
        self.process_count = count.max(1);
        self
    }

    /// Number of `compile` calls that reached this backend.
    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::Relaxed)
    }

    fn total_devices(&self) -> u32 {
        self.device_count * self.process_count
    }

    fn owns(&self, device: Device) -> bool {
        device.platform == self.platform && device.id.0 < self.total_devices()
    }

    fn check_executable(
        &self,
        computation: &Computation,
        options: &CompileOptions,
    ) -> Result<Vec<Device>, BackendError> {
        if options.num_partitions != 1 {
            return Err(BackendError::CompilationFailed {
                detail: format!(
                    "{} partitions requested; only 1 is supported",
                    options.num_partitions
                ),
            });
        }
        for instruction in computation.instructions() {
            if let Instruction::Op { equation, .. } = instruction
                && equation.primitive == Primitive::XlaPmap
                && equation.axis_size().is_none()
            {
                return Err(BackendError::CompilationFailed {
                    detail: "xla_pmap without a valid axis_size".to_owned(),
                });
            }
        }

        let devices = match &options.device_assignment {
            Some(assignment) => assignment.clone(),
            None => self.default_device_assignment(options.num_replicas)?,
        };
        if devices.len() != options.num_replicas.max(1) {
            return Err(BackendError::CompilationFailed {
                detail: format!(
                    "device assignment lists {} devices for {} replicas",
                    devices.len(),
                    options.num_replicas
                ),
            });
        }
        if let Some(foreign) = devices.iter().find(|device| !self.owns(**device)) {
            return Err(BackendError::CompilationFailed {
                detail: format!("{foreign} does not belong to the {} backend", self.name()),
            });
        }
        Ok(devices)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        self.platform.as_str()
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        (0..self.total_devices())
            .map(|id| {
                let process_index = id / self.device_count;
                DeviceInfo {
                    device: Device::new(self.platform, id),
                    host_id: process_index,
                    process_index,
                }
            })
            .collect()
    }

    fn local_devices(&self) -> Vec<Device> {
        (0..self.device_count)
            .map(|id| Device::new(self.platform, id))
            .collect()
    }

    fn process_count(&self) -> usize {
        self.process_count as usize
    }

    fn default_device_assignment(&self, num_replicas: usize) -> Result<Vec<Device>, BackendError> {
        let available = self.total_devices() as usize;
        if num_replicas > available {
            return Err(BackendError::CompilationFailed {
                detail: format!(
                    "{num_replicas} replicas requested but only {available} devices exist"
                ),
            });
        }
        Ok((0..num_replicas.max(1) as u32)
            .map(|id| Device::new(self.platform, id))
            .collect())
    }

    fn buffer_from_value(&self, value: &Value, device: Device) -> Result<Buffer, BackendError> {
        if !self.owns(device) {
            return Err(BackendError::AllocationFailed {
                device,
                detail: format!("device not available on the {} backend", self.name()),
            });
        }
        Ok(Buffer::new(value_to_bytes(value), value.aval(), device))
    }

    fn transfer(&self, buffer: &Buffer, target: Device) -> Result<Buffer, BackendError> {
        if !self.owns(target) {
            return Err(BackendError::TransferFailed {
                source: buffer.device(),
                target: Some(target),
                detail: "target device not available".to_owned(),
            });
        }
        // All logical devices share host memory.
        Ok(buffer.relocated(target))
    }

    fn compile(
        &self,
        computation: &Computation,
        options: &CompileOptions,
    ) -> Result<Arc<dyn Executable>, BackendError> {
        let devices = self.check_executable(computation, options)?;
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            computation = computation.name(),
            replicas = devices.len(),
            ops = computation.op_count(),
            "cpu backend compiled computation"
        );
        Ok(Arc::new(CpuExecutable::new(
            computation.clone(),
            options.clone(),
            devices,
        )))
    }

    fn deserialize_executable(&self, bytes: &[u8]) -> Result<Arc<dyn Executable>, BackendError> {
        let executable: CpuExecutable =
            serde_json::from_slice(bytes).map_err(|err| BackendError::CompilationFailed {
                detail: format!("cannot deserialize executable: {err}"),
            })?;
        self.check_executable(executable.computation(), executable.options())?;
        Ok(Arc::new(executable))
    }

    fn version(&self) -> &str {
        &self.version_string
    }
}
