//! The cached artifact of one dispatch: a compiled executable or a trivial
//! forwarding program, together with everything needed to call it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tj_core::{AbstractValue, Atom, Jaxpr, Value, VarId, typematch};
use tj_interpreters::InterpreterError;
use tj_runtime::{Backend, BackendError, Buffer, Device, Executable, RuntimeValue};

use crate::config::DispatchConfig;
use crate::error::{DispatchError, TypeError};
use crate::fingerprint::AbstractionRegistry;
use crate::handlers::{
    DevicePutRegistry, ResultHandler, ResultHandlerRegistry, copy_device_array_to_device,
};
use crate::numerics::{check_buffers, check_values};

/// Handler tables shared by a dispatcher and every artifact it builds.
#[derive(Debug, Default)]
pub struct Registries {
    pub abstraction: RwLock<AbstractionRegistry>,
    pub results: RwLock<ResultHandlerRegistry>,
    pub device_put: RwLock<DevicePutRegistry>,
}

pub(crate) enum Strategy {
    /// No equations: outputs are read straight from inputs, constants and
    /// literals without touching a backend executable.
    Trivial {
        jaxpr: Jaxpr,
        consts: Vec<Value>,
        device: Option<Device>,
        backend: Arc<dyn Backend>,
    },
    Compiled {
        executable: Arc<dyn Executable>,
        backend: Arc<dyn Backend>,
        handlers: Vec<ResultHandler>,
        buffer_counts: Vec<usize>,
        replicas: usize,
        /// Original argument positions whose buffers an output aliases.
        donated_args: BTreeSet<usize>,
    },
}

pub struct CompiledComputation {
    pub(crate) name: String,
    pub(crate) num_args: usize,
    pub(crate) kept_var_idx: BTreeSet<usize>,
    pub(crate) in_avals: Vec<AbstractValue>,
    pub(crate) out_avals: Vec<AbstractValue>,
    pub(crate) unused_donations: Vec<AbstractValue>,
    pub(crate) config: DispatchConfig,
    pub(crate) registries: Arc<Registries>,
    pub(crate) strategy: Strategy,
}

impl CompiledComputation {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Types of the arguments the computation reads, in argument order.
    #[must_use]
    pub fn in_avals(&self) -> &[AbstractValue] {
        &self.in_avals
    }

    #[must_use]
    pub fn out_avals(&self) -> &[AbstractValue] {
        &self.out_avals
    }

    /// Positions of the arguments that survived pruning.
    #[must_use]
    pub fn kept_var_idx(&self) -> &BTreeSet<usize> {
        &self.kept_var_idx
    }

    /// Types of donated arguments whose buffers no output reuses.
    #[must_use]
    pub fn unused_donations(&self) -> &[AbstractValue] {
        &self.unused_donations
    }

    #[must_use]
    pub fn is_trivial(&self) -> bool {
        matches!(self.strategy, Strategy::Trivial { .. })
    }

    #[must_use]
    pub fn replicas(&self) -> usize {
        match &self.strategy {
            Strategy::Trivial { .. } => 1,
            Strategy::Compiled { replicas, .. } => *replicas,
        }
    }

    #[must_use]
    pub fn executable(&self) -> Option<&Arc<dyn Executable>> {
        match &self.strategy {
            Strategy::Trivial { .. } => None,
            Strategy::Compiled { executable, .. } => Some(executable),
        }
    }

    /// Runs the computation on `args`, which must match the signature it was
    /// compiled for.
    pub fn call(&self, args: &[RuntimeValue]) -> Result<Vec<RuntimeValue>, DispatchError> {
        if args.len() != self.num_args {
            return Err(TypeError::InputArity {
                expected: self.num_args,
                actual: args.len(),
            }
            .into());
        }
        let kept: Vec<&RuntimeValue> = args
            .iter()
            .enumerate()
            .filter(|(index, _)| self.kept_var_idx.contains(index))
            .map(|(_, arg)| arg)
            .collect();
        self.check_arg_avals(&kept)?;

        match &self.strategy {
            Strategy::Trivial {
                jaxpr,
                consts,
                device,
                backend,
            } => self.execute_trivial(jaxpr, consts, *device, backend.as_ref(), &kept),
            Strategy::Compiled {
                executable,
                backend,
                handlers,
                buffer_counts,
                replicas,
                donated_args,
            } => {
                let outputs = if *replicas > 1 {
                    self.execute_replicated(executable.as_ref(), backend.as_ref(), &kept)?
                } else {
                    self.execute_single(executable.as_ref(), backend.as_ref(), &kept)?
                };
                // A failed check leaves donated arguments readable for the
                // deoptimized re-run.
                check_buffers(&self.name, &self.config, &outputs)?;
                mark_donated(args, donated_args);
                self.handle_outputs(handlers, buffer_counts, outputs)
            }
        }
    }

    fn check_arg_avals(&self, kept: &[&RuntimeValue]) -> Result<(), DispatchError> {
        let actual = {
            let registry = self.registries.abstraction.read();
            kept.iter()
                .map(|arg| registry.abstractify(arg))
                .collect::<Result<Vec<_>, _>>()?
        };
        let matches = actual.len() == self.in_avals.len()
            && self
                .in_avals
                .iter()
                .zip(&actual)
                .all(|(expected, actual)| typematch(expected, actual));
        if !matches {
            return Err(TypeError::InputTypes {
                expected: self.in_avals.clone(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    fn put_args(
        &self,
        kept: &[&RuntimeValue],
        backend: &dyn Backend,
        device: Device,
    ) -> Result<Vec<Buffer>, DispatchError> {
        let registry = self.registries.device_put.read();
        let mut buffers = Vec::with_capacity(kept.len());
        for arg in kept.iter().filter(|arg| !arg.is_token()) {
            buffers.extend(registry.device_put(arg, backend, device)?);
        }
        Ok(buffers)
    }

    fn execute_single(
        &self,
        executable: &dyn Executable,
        backend: &dyn Backend,
        kept: &[&RuntimeValue],
    ) -> Result<Vec<Buffer>, DispatchError> {
        let device = executable
            .local_devices()
            .first()
            .copied()
            .ok_or_else(|| no_device(&self.name))?;
        let args = self.put_args(kept, backend, device)?;
        Ok(executable.execute(&args)?)
    }

    /// Runs every replica and keeps the first replica's outputs.
    fn execute_replicated(
        &self,
        executable: &dyn Executable,
        backend: &dyn Backend,
        kept: &[&RuntimeValue],
    ) -> Result<Vec<Buffer>, DispatchError> {
        let per_device = executable
            .local_devices()
            .iter()
            .map(|device| self.put_args(kept, backend, *device))
            .collect::<Result<Vec<_>, _>>()?;
        let mut per_replica = executable.execute_sharded(&per_device)?;
        if per_replica.is_empty() {
            return Err(no_device(&self.name).into());
        }
        Ok(per_replica.swap_remove(0))
    }

    fn handle_outputs(
        &self,
        handlers: &[ResultHandler],
        buffer_counts: &[usize],
        buffers: Vec<Buffer>,
    ) -> Result<Vec<RuntimeValue>, DispatchError> {
        let expected: usize = buffer_counts.iter().sum();
        if buffers.len() != expected {
            return Err(BackendError::ExecutionFailed {
                detail: format!(
                    "`{}` produced {} buffers, expected {expected}",
                    self.name,
                    buffers.len()
                ),
            }
            .into());
        }
        let mut buffers = buffers.into_iter();
        let mut outputs = Vec::with_capacity(handlers.len());
        for (handler, count) in handlers.iter().zip(buffer_counts) {
            outputs.push(handler(buffers.by_ref().take(*count).collect())?);
        }
        Ok(outputs)
    }

    fn execute_trivial(
        &self,
        jaxpr: &Jaxpr,
        consts: &[Value],
        device: Option<Device>,
        backend: &dyn Backend,
        kept: &[&RuntimeValue],
    ) -> Result<Vec<RuntimeValue>, DispatchError> {
        let mut env: BTreeMap<VarId, RuntimeValue> = BTreeMap::new();
        for (var, value) in jaxpr.constvars.iter().zip(consts) {
            env.insert(*var, RuntimeValue::Host(value.clone()));
        }
        for (var, arg) in jaxpr.invars.iter().zip(kept) {
            env.insert(*var, (*arg).clone());
        }

        let mut outputs = Vec::with_capacity(jaxpr.outvars.len());
        for (atom, aval) in jaxpr.outvars.iter().zip(&self.out_avals) {
            let value = match atom {
                Atom::Var(var) => env
                    .get(var)
                    .cloned()
                    .ok_or(InterpreterError::MissingVariable(*var))?,
                Atom::Lit(lit) => RuntimeValue::Host(Value::Scalar(*lit)),
            };
            let output = match (value, device) {
                (RuntimeValue::Device(array), Some(device)) => {
                    RuntimeValue::Device(copy_device_array_to_device(&array, backend, device)?)
                }
                (RuntimeValue::Device(array), None) => RuntimeValue::Device(array),
                (RuntimeValue::Host(value), _) => {
                    check_values(&self.name, &self.config, [&value])?;
                    let host = RuntimeValue::Host(value);
                    let target = match device {
                        Some(device) => device,
                        None => backend
                            .local_devices()
                            .first()
                            .copied()
                            .ok_or_else(|| no_device(&self.name))?,
                    };
                    let buffers =
                        self.registries.device_put.read().device_put(&host, backend, target)?;
                    let handler = self.registries.results.read().handler_for(device, aval)?;
                    handler(buffers)?
                }
            };
            outputs.push(output);
        }
        Ok(outputs)
    }
}

fn no_device(name: &str) -> BackendError {
    BackendError::ExecutionFailed {
        detail: format!("no local device available to run `{name}`"),
    }
}

/// Invalidates donated arrays whose buffers an output now owns.
fn mark_donated(args: &[RuntimeValue], donated_args: &BTreeSet<usize>) {
    for index in donated_args {
        if let Some(RuntimeValue::Device(array)) = args.get(*index) {
            tracing::trace!(argument = *index, "donated buffer consumed");
            array.delete();
        }
    }
}

impl std::fmt::Debug for CompiledComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledComputation")
            .field("name", &self.name)
            .field("in_avals", &self.in_avals)
            .field("out_avals", &self.out_avals)
            .field("trivial", &self.is_trivial())
            .field("replicas", &self.replicas())
            .finish_non_exhaustive()
    }
}
