//! Argument fingerprinting: the abstract type and committed device of every
//! runtime argument.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tj_core::{AbstractValue, typematch};
use tj_runtime::{Device, RuntimeValue, ValueKind};

use crate::error::TypeError;

/// Cache-key component describing one argument.
///
/// Derived equality is exact and is what cache keys use. `compatible` is the
/// looser relation where an unset device matches any device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgSpec {
    pub aval: AbstractValue,
    pub device: Option<Device>,
}

impl ArgSpec {
    #[must_use]
    pub fn compatible(&self, other: &Self) -> bool {
        let devices_agree = match (self.device, other.device) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        devices_agree && typematch(&self.aval, &other.aval)
    }
}

impl std::fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.device {
            Some(device) => write!(f, "{}@{device}", self.aval),
            None => write!(f, "{}", self.aval),
        }
    }
}

pub type AbstractifyFn = Arc<dyn Fn(&RuntimeValue) -> Option<AbstractValue> + Send + Sync>;

/// Maps each runtime value kind to the function computing its abstract type.
#[derive(Clone)]
pub struct AbstractionRegistry {
    handlers: FxHashMap<ValueKind, AbstractifyFn>,
}

impl AbstractionRegistry {
    /// An empty registry: every argument is rejected.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for kind in [
            ValueKind::Scalar,
            ValueKind::Tensor,
            ValueKind::Unit,
            ValueKind::Token,
        ] {
            registry.register(
                kind,
                Arc::new(|value: &RuntimeValue| match value {
                    RuntimeValue::Host(host) => Some(host.aval()),
                    RuntimeValue::Device(_) => None,
                }),
            );
        }
        registry.register(
            ValueKind::DeviceArray,
            Arc::new(|value: &RuntimeValue| {
                value.as_device_array().map(|array| array.aval().clone())
            }),
        );
        registry
    }

    pub fn register(&mut self, kind: ValueKind, handler: AbstractifyFn) {
        self.handlers.insert(kind, handler);
    }

    pub fn unregister(&mut self, kind: ValueKind) -> Option<AbstractifyFn> {
        self.handlers.remove(&kind)
    }

    pub fn abstractify(&self, value: &RuntimeValue) -> Result<AbstractValue, TypeError> {
        let kind = value.kind();
        self.handlers
            .get(&kind)
            .and_then(|handler| handler(value))
            .ok_or(TypeError::NoAbstraction { kind })
    }

    /// Fingerprint of one argument. Only device arrays committed to a device
    /// report one.
    pub fn arg_spec(&self, value: &RuntimeValue) -> Result<ArgSpec, TypeError> {
        Ok(ArgSpec {
            aval: self.abstractify(value)?,
            device: value.as_device_array().and_then(|array| array.sticky_device()),
        })
    }

    pub fn arg_specs(&self, values: &[RuntimeValue]) -> Result<Vec<ArgSpec>, TypeError> {
        values.iter().map(|value| self.arg_spec(value)).collect()
    }
}

impl Default for AbstractionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for AbstractionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        f.debug_struct("AbstractionRegistry").field("kinds", &kinds).finish()
    }
}
