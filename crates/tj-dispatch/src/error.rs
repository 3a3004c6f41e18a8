use tj_core::{AbstractValue, AvalKind, JaxprValidationError, Primitive};
use tj_interpreters::InterpreterError;
use tj_runtime::{BackendError, Device, ValueKind};

use crate::config::LoweringPath;

/// Inconsistent placement or unsupported configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    DeviceAndBackend {
        device: Device,
        backend: String,
    },
    PinnedReplicatedComputation {
        replicas: usize,
    },
    ArgumentsNotColocated {
        devices: Vec<Device>,
    },
    InsufficientDevices {
        name: String,
        replicas: usize,
        available: usize,
    },
    UnknownBackend {
        backend: String,
    },
    UnsupportedLowering {
        path: LoweringPath,
    },
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceAndBackend { device, backend } => write!(
                f,
                "can't specify both a device and a backend for jit, got device={device} and backend={backend}"
            ),
            Self::PinnedReplicatedComputation { replicas } => write!(
                f,
                "can't pin a computation with {replicas} replicas to a single device or backend"
            ),
            Self::ArgumentsNotColocated { devices } => {
                f.write_str("primitive arguments must be colocated on the same device, got ")?;
                write_list(f, devices)
            }
            Self::InsufficientDevices {
                name,
                replicas,
                available,
            } => write!(
                f,
                "compiling computation `{name}` that requires {replicas} replicas, but only {available} devices are available"
            ),
            Self::UnknownBackend { backend } => write!(f, "unknown backend `{backend}`"),
            Self::UnsupportedLowering { path } => {
                write!(f, "the {path} lowering path is not available in this runtime")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// An argument or output type the dispatch layer cannot handle, or a call
/// that does not match the signature a computation was compiled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    NoAbstraction {
        kind: ValueKind,
    },
    NoResultHandler {
        kind: AvalKind,
    },
    NoDevicePutHandler {
        kind: ValueKind,
    },
    InputArity {
        expected: usize,
        actual: usize,
    },
    InputTypes {
        expected: Vec<AbstractValue>,
        actual: Vec<AbstractValue>,
    },
}

impl std::fmt::Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAbstraction { kind } => {
                write!(f, "argument of type {kind} is not a valid array type")
            }
            Self::NoResultHandler { kind } => write!(f, "no result handler for type: {kind}"),
            Self::NoDevicePutHandler { kind } => {
                write!(f, "no device_put handler for type: {kind}")
            }
            Self::InputArity { expected, actual } => write!(
                f,
                "computation compiled for {expected} inputs but called with {actual}"
            ),
            Self::InputTypes { expected, actual } => {
                f.write_str("computation compiled for input types:\n  ")?;
                write_list(f, expected)?;
                f.write_str("\ncalled with:\n  ")?;
                write_list(f, actual)
            }
        }
    }
}

impl std::error::Error for TypeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatingPointKind {
    Nan,
    Inf,
}

impl FloatingPointKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nan => "nan",
            Self::Inf => "inf",
        }
    }
}

impl std::fmt::Display for FloatingPointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A NaN or infinity found by the numerical-health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingPointError {
    pub name: String,
    pub kind: FloatingPointKind,
    /// First primitive seen producing the value, when a deoptimized re-run
    /// located it.
    pub primitive: Option<Primitive>,
}

impl std::fmt::Display for FloatingPointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value ({}) encountered in {}", self.kind, self.name)?;
        if let Some(primitive) = self.primitive {
            write!(f, " (first produced by `{primitive}`)")?;
        }
        Ok(())
    }
}

impl std::error::Error for FloatingPointError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Configuration(ConfigurationError),
    Type(TypeError),
    Backend(BackendError),
    FloatingPoint(FloatingPointError),
    Unimplemented { detail: String },
    InvalidProgram(JaxprValidationError),
    Interpreter(InterpreterError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(err) => write!(f, "configuration error: {err}"),
            Self::Type(err) => write!(f, "type error: {err}"),
            Self::Backend(err) => write!(f, "backend error: {err}"),
            Self::FloatingPoint(err) => write!(f, "floating point error: {err}"),
            Self::Unimplemented { detail } => write!(f, "not implemented: {detail}"),
            Self::InvalidProgram(err) => write!(f, "invalid program: {err}"),
            Self::Interpreter(err) => write!(f, "interpreter error: {err}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Configuration(err) => Some(err),
            Self::Type(err) => Some(err),
            Self::Backend(err) => Some(err),
            Self::FloatingPoint(err) => Some(err),
            Self::InvalidProgram(err) => Some(err),
            Self::Interpreter(err) => Some(err),
            Self::Unimplemented { .. } => None,
        }
    }
}

impl From<ConfigurationError> for DispatchError {
    fn from(value: ConfigurationError) -> Self {
        Self::Configuration(value)
    }
}

impl From<TypeError> for DispatchError {
    fn from(value: TypeError) -> Self {
        Self::Type(value)
    }
}

impl From<BackendError> for DispatchError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Unavailable { backend } => {
                Self::Configuration(ConfigurationError::UnknownBackend { backend })
            }
            other => Self::Backend(other),
        }
    }
}

impl From<FloatingPointError> for DispatchError {
    fn from(value: FloatingPointError) -> Self {
        Self::FloatingPoint(value)
    }
}

impl From<JaxprValidationError> for DispatchError {
    fn from(value: JaxprValidationError) -> Self {
        Self::InvalidProgram(value)
    }
}

impl From<InterpreterError> for DispatchError {
    fn from(value: InterpreterError) -> Self {
        Self::Interpreter(value)
    }
}

fn write_list<T: std::fmt::Display>(
    f: &mut std::fmt::Formatter<'_>,
    items: &[T],
) -> std::fmt::Result {
    f.write_str("[")?;
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str("]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tj_core::DType;

    #[test]
    fn colocation_error_names_devices() {
        let err = DispatchError::from(ConfigurationError::ArgumentsNotColocated {
            devices: vec![Device::cpu(0), Device::cpu(1)],
        });
        let message = err.to_string();
        assert!(message.contains("colocated"));
        assert!(message.contains("[cpu:0, cpu:1]"));
    }

    #[test]
    fn input_type_mismatch_lists_both_signatures() {
        let err = TypeError::InputTypes {
            expected: vec![AbstractValue::scalar(DType::F32)],
            actual: vec![AbstractValue::scalar(DType::I32)],
        };
        assert_eq!(
            err.to_string(),
            "computation compiled for input types:\n  [ShapedArray(f32[])]\ncalled with:\n  [ShapedArray(i32[])]"
        );
    }

    #[test]
    fn unavailable_backend_becomes_configuration_error() {
        let err = DispatchError::from(BackendError::Unavailable {
            backend: "tpu".to_owned(),
        });
        assert_eq!(
            err,
            DispatchError::Configuration(ConfigurationError::UnknownBackend {
                backend: "tpu".to_owned()
            })
        );
    }

    #[test]
    fn floating_point_error_mentions_primitive_when_known() {
        let mut err = FloatingPointError {
            name: "jit(f)".to_owned(),
            kind: FloatingPointKind::Nan,
            primitive: None,
        };
        assert_eq!(err.to_string(), "invalid value (nan) encountered in jit(f)");
        err.primitive = Some(Primitive::Log);
        assert!(err.to_string().ends_with("(first produced by `log`)"));
    }
}
