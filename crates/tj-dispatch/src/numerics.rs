//! NaN/Inf detection for debug mode.

use tj_core::{ClosedJaxpr, Primitive, Value};
use tj_interpreters::{InterpreterError, eval_jaxpr_with_observer};
use tj_runtime::marshal::value_from_bytes;
use tj_runtime::{BackendError, Buffer};

use crate::config::DispatchConfig;
use crate::error::{DispatchError, FloatingPointError, FloatingPointKind};

/// The kind of invalid element `value` holds, if the config watches for it.
#[must_use]
pub fn first_special(value: &Value, config: &DispatchConfig) -> Option<FloatingPointKind> {
    if !value.aval().as_shaped().is_some_and(|shaped| shaped.dtype.is_inexact()) {
        return None;
    }
    value.literals().iter().find_map(|lit| {
        if config.debug_nans && lit.is_nan() {
            Some(FloatingPointKind::Nan)
        } else if config.debug_infs && lit.is_infinite() {
            Some(FloatingPointKind::Inf)
        } else {
            None
        }
    })
}

pub fn check_values<'a>(
    name: &str,
    config: &DispatchConfig,
    values: impl IntoIterator<Item = &'a Value>,
) -> Result<(), FloatingPointError> {
    if !config.checks_numerics() {
        return Ok(());
    }
    match values.into_iter().find_map(|value| first_special(value, config)) {
        Some(kind) => Err(FloatingPointError {
            name: name.to_owned(),
            kind,
            primitive: None,
        }),
        None => Ok(()),
    }
}

/// Reads back every floating-point output buffer and checks it.
pub fn check_buffers(
    name: &str,
    config: &DispatchConfig,
    buffers: &[Buffer],
) -> Result<(), DispatchError> {
    if !config.checks_numerics() {
        return Ok(());
    }
    for buffer in buffers {
        let inexact = buffer
            .aval()
            .as_shaped()
            .is_some_and(|shaped| shaped.dtype.is_inexact());
        if !inexact {
            continue;
        }
        let value = value_from_bytes(buffer.aval(), buffer.as_bytes()).map_err(|err| {
            BackendError::TransferFailed {
                source: buffer.device(),
                target: None,
                detail: err.to_string(),
            }
        })?;
        check_values(name, config, [&value])?;
    }
    Ok(())
}

/// Re-evaluates `program` one equation at a time on the host and returns the
/// first primitive whose output holds an invalid value.
pub fn locate_special(
    program: &ClosedJaxpr,
    args: &[Value],
    config: &DispatchConfig,
) -> Option<(Primitive, FloatingPointKind)> {
    let mut found = None;
    let outcome = eval_jaxpr_with_observer(
        &program.jaxpr,
        &program.consts,
        args,
        &mut |eqn, outputs| {
            match outputs.iter().find_map(|value| first_special(value, config)) {
                Some(kind) => {
                    found = Some((eqn.primitive, kind));
                    Err(InterpreterError::Rejected {
                        primitive: eqn.primitive,
                        detail: format!("produced {kind}"),
                    })
                }
                None => Ok(()),
            }
        },
    );
    if let Err(err) = outcome
        && found.is_none()
    {
        tracing::debug!(error = %err, "deoptimized re-run failed before finding an invalid value");
    }
    found
}
