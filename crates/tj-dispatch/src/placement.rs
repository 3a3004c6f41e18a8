//! Device/replica resolution for a computation about to be compiled.

use std::collections::BTreeSet;

use tj_runtime::{Backend, BackendRegistry, Device};

use crate::error::{ConfigurationError, DispatchError};

/// The single device all committed arguments share, if any.
///
/// Uncommitted arguments (`None`) never conflict.
pub fn device_from_arg_devices(
    arg_devices: &[Option<Device>],
) -> Result<Option<Device>, ConfigurationError> {
    let distinct: BTreeSet<Device> = arg_devices.iter().flatten().copied().collect();
    match distinct.len() {
        0 => Ok(None),
        1 => Ok(distinct.into_iter().next()),
        _ => Err(ConfigurationError::ArgumentsNotColocated {
            devices: distinct.into_iter().collect(),
        }),
    }
}

/// Chooses where a computation with `replicas` replicas runs.
///
/// Replicated computations are never pinned: the backend picks the
/// assignment. Otherwise an explicit device wins, then an explicit backend's
/// first default device, then the device the arguments agree on. `None`
/// leaves the choice to the default backend.
pub fn resolve_device(
    device: Option<Device>,
    backend: Option<&str>,
    arg_devices: &[Option<Device>],
    replicas: usize,
    backends: &BackendRegistry,
) -> Result<Option<Device>, DispatchError> {
    if let (Some(device), Some(backend)) = (device, backend) {
        return Err(ConfigurationError::DeviceAndBackend {
            device,
            backend: backend.to_owned(),
        }
        .into());
    }
    if replicas > 1 {
        if device.is_some() || backend.is_some() {
            return Err(ConfigurationError::PinnedReplicatedComputation { replicas }.into());
        }
        return Ok(None);
    }
    match (device, backend) {
        (Some(device), _) => Ok(Some(device)),
        (None, Some(name)) => {
            let backend = backends.get(name)?;
            Ok(backend.default_device_assignment(1)?.first().copied())
        }
        (None, None) => Ok(device_from_arg_devices(arg_devices)?),
    }
}

/// Backend owning `device`, or the named/default backend when unpinned.
pub fn backend_for(
    device: Option<Device>,
    backend: Option<&str>,
    backends: &BackendRegistry,
) -> Result<std::sync::Arc<dyn Backend>, DispatchError> {
    let resolved = match device {
        Some(device) => backends.backend_for_device(device)?,
        None => backends.resolve(backend)?,
    };
    Ok(resolved)
}

/// Refuses computations that cannot be placed on `backend`.
pub fn check_replicas(
    name: &str,
    replicas: usize,
    has_pmap: bool,
    backend: &dyn Backend,
) -> Result<(), DispatchError> {
    let available = backend.device_count();
    if replicas > available {
        return Err(ConfigurationError::InsufficientDevices {
            name: name.to_owned(),
            replicas,
            available,
        }
        .into());
    }
    if backend.process_count() > 1 && (replicas > 1 || has_pmap) {
        return Err(DispatchError::Unimplemented {
            detail: format!(
                "jit of multi-host pmap is not supported (`{name}` needs {replicas} replicas across {} processes)",
                backend.process_count()
            ),
        });
    }
    Ok(())
}
