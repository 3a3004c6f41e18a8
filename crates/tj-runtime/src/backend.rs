//! Backend service traits.
//!
//! A backend discovers devices, moves values in and out of device buffers and
//! compiles `Computation`s into `Executable`s. Platform-specific behavior stays
//! behind the trait boundary.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::computation::{CompileOptions, Computation};
use crate::device::{Device, DeviceInfo, Platform};
use tj_core::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Requested backend is not registered.
    Unavailable { backend: String },
    AllocationFailed { device: Device, detail: String },
    /// `target` is `None` for device-to-host reads.
    TransferFailed {
        source: Device,
        target: Option<Device>,
        detail: String,
    },
    CompilationFailed { detail: String },
    ExecutionFailed { detail: String },
    /// A buffer was used after deletion or donation.
    DeletedBuffer { detail: String },
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { backend } => write!(f, "backend unavailable: {backend}"),
            Self::AllocationFailed { device, detail } => {
                write!(f, "allocation failed on {device}: {detail}")
            }
            Self::TransferFailed {
                source,
                target: Some(target),
                detail,
            } => {
                write!(f, "transfer {source} -> {target} failed: {detail}")
            }
            Self::TransferFailed {
                source,
                target: None,
                detail,
            } => {
                write!(f, "transfer {source} -> host failed: {detail}")
            }
            Self::CompilationFailed { detail } => write!(f, "compilation failed: {detail}"),
            Self::ExecutionFailed { detail } => write!(f, "execution failed: {detail}"),
            Self::DeletedBuffer { detail } => write!(f, "invalid buffer: {detail}"),
        }
    }
}

impl std::error::Error for BackendError {}

pub trait Backend: Send + Sync {
    /// Registry name; equal to the platform name.
    fn name(&self) -> &str;

    fn platform(&self) -> Platform;

    /// Every device of this backend across all processes.
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Devices owned by the calling process.
    fn local_devices(&self) -> Vec<Device>;

    fn device_count(&self) -> usize {
        self.devices().len()
    }

    fn process_count(&self) -> usize;

    /// Default placement for `num_replicas` replicas, one device each.
    fn default_device_assignment(&self, num_replicas: usize) -> Result<Vec<Device>, BackendError>;

    fn buffer_from_value(&self, value: &Value, device: Device) -> Result<Buffer, BackendError>;

    fn transfer(&self, buffer: &Buffer, target: Device) -> Result<Buffer, BackendError>;

    fn compile(
        &self,
        computation: &Computation,
        options: &CompileOptions,
    ) -> Result<Arc<dyn Executable>, BackendError>;

    /// Restores an executable produced by `Executable::serialize`.
    fn deserialize_executable(&self, bytes: &[u8]) -> Result<Arc<dyn Executable>, BackendError>;

    /// Platform version string, part of persistent cache keys.
    fn version(&self) -> &str;

    fn supports_buffer_donation(&self) -> bool {
        self.platform().supports_input_output_aliasing()
    }
}

pub trait Executable: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Devices the executable runs on, one per replica.
    fn local_devices(&self) -> &[Device];

    /// Runs a single-replica executable on its only device.
    fn execute(&self, args: &[Buffer]) -> Result<Vec<Buffer>, BackendError>;

    /// Runs every replica; the outer index is the replica.
    fn execute_sharded(
        &self,
        per_device_args: &[Vec<Buffer>],
    ) -> Result<Vec<Vec<Buffer>>, BackendError>;

    fn serialize(&self) -> Result<Vec<u8>, BackendError>;
}

/// Named backends available to a dispatcher. The first registered backend is
/// the default.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new(default_backend: Arc<dyn Backend>) -> Self {
        Self {
            backends: vec![default_backend],
        }
    }

    /// Adds a backend. A backend with the same name replaces the earlier one.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        if let Some(slot) = self
            .backends
            .iter_mut()
            .find(|existing| existing.name() == backend.name())
        {
            *slot = backend;
        } else {
            self.backends.push(backend);
        }
    }

    #[must_use]
    pub fn default_backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backends[0])
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, BackendError> {
        self.backends
            .iter()
            .find(|backend| backend.name() == name)
            .cloned()
            .ok_or_else(|| BackendError::Unavailable {
                backend: name.to_owned(),
            })
    }

    pub fn backend_for_device(&self, device: Device) -> Result<Arc<dyn Backend>, BackendError> {
        self.get(device.backend_name())
    }

    /// `name` if given, otherwise the default backend.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn Backend>, BackendError> {
        match name {
            Some(name) => self.get(name),
            None => Ok(self.default_backend()),
        }
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}
