#![forbid(unsafe_code)]

//! Dispatch core: turns a traced program plus runtime arguments into results
//! by fingerprinting the arguments, compiling at most once per distinct
//! signature, choosing devices and replicas, and executing.

pub mod compiled;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod handlers;
pub mod lower;
pub mod numerics;
pub mod placement;
pub mod prune;

pub use compiled::{CompiledComputation, Registries};
pub use config::{DispatchConfig, LoweringPath};
pub use error::{
    ConfigurationError, DispatchError, FloatingPointError, FloatingPointKind, TypeError,
};
pub use fingerprint::{AbstractifyFn, AbstractionRegistry, ArgSpec};
pub use handlers::{
    DevicePutFn, DevicePutRegistry, ResultHandler, ResultHandlerFactory, ResultHandlerRegistry,
    aval_to_num_buffers,
};
pub use prune::{
    jaxpr_has_pmap, jaxpr_literals, jaxpr_replicas, jaxpr_uses_outfeed, prune_unused_inputs,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tj_cache::{CacheStats, CompilationCache, PersistentCache, PersistentCacheKey, program_digest};
use tj_core::{AbstractValue, Atom, ClosedJaxpr, Equation, Jaxpr, Primitive, Value, VarId};
use tj_interpreters::abstract_eval_jaxpr;
use tj_runtime::{
    Backend, BackendError, BackendRegistry, CompileOptions, Computation, Device, Executable,
    RuntimeValue,
};

use crate::compiled::Strategy;
use crate::handlers::copy_device_array_to_device;
use crate::lower::{LoweringRequest, lower_jaxpr};
use crate::placement::{backend_for, check_replicas, resolve_device};
use crate::prune::{is_trivial, keep};

/// Rewrites a pruned program before compilation, e.g. to thread outfeed
/// tokens.
pub type OutfeedRewriter = Arc<dyn Fn(Jaxpr) -> Jaxpr + Send + Sync>;

/// A jit-compiled call of a closed program.
#[derive(Debug, Clone)]
pub struct XlaCallRequest {
    pub program: ClosedJaxpr,
    pub args: Vec<RuntimeValue>,
    pub device: Option<Device>,
    pub backend: Option<String>,
    pub name: String,
    /// Per argument: whether the caller gives up its buffer. Missing entries
    /// count as not donated.
    pub donated_invars: Vec<bool>,
}

impl XlaCallRequest {
    #[must_use]
    pub fn new(name: impl Into<String>, program: ClosedJaxpr, args: Vec<RuntimeValue>) -> Self {
        Self {
            program,
            args,
            device: None,
            backend: None,
            name: name.into(),
            donated_invars: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    #[must_use]
    pub fn with_donated_invars(mut self, donated: Vec<bool>) -> Self {
        self.donated_invars = donated;
        self
    }

    fn donated(&self) -> Vec<bool> {
        (0..self.args.len())
            .map(|index| self.donated_invars.get(index).copied().unwrap_or(false))
            .collect()
    }
}

/// Identity of a jit artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub program: String,
    pub arg_specs: Vec<ArgSpec>,
    pub device: Option<Device>,
    pub backend: Option<String>,
    pub name: String,
    pub donated_invars: Vec<bool>,
}

/// Identity of a single-primitive artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimitiveCacheKey {
    pub primitive: Primitive,
    pub arg_specs: Vec<ArgSpec>,
    pub params: BTreeMap<String, String>,
}

/// Compilation inputs shared by jit and single-primitive dispatch.
struct BuildRequest<'a> {
    name: &'a str,
    program: &'a ClosedJaxpr,
    arg_specs: &'a [ArgSpec],
    device: Option<Device>,
    backend: Option<&'a str>,
    donated: &'a [bool],
}

pub struct Dispatcher {
    config: DispatchConfig,
    backends: BackendRegistry,
    registries: Arc<Registries>,
    jit_cache: CompilationCache<CacheKey, CompiledComputation>,
    primitive_cache: CompilationCache<PrimitiveCacheKey, CompiledComputation>,
    persistent_cache: Option<Arc<dyn PersistentCache>>,
    outfeed_rewriter: Option<OutfeedRewriter>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(backends: BackendRegistry) -> Self {
        Self {
            config: DispatchConfig::default(),
            backends,
            registries: Arc::new(Registries::default()),
            jit_cache: CompilationCache::new("jit"),
            primitive_cache: CompilationCache::new("primitive"),
            persistent_cache: None,
            outfeed_rewriter: None,
        }
    }

    /// A dispatcher whose only (and default) backend is `backend`.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self::new(BackendRegistry::new(backend))
    }

    #[must_use]
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_persistent_cache(mut self, cache: Arc<dyn PersistentCache>) -> Self {
        self.persistent_cache = Some(cache);
        self
    }

    pub fn set_outfeed_rewriter(&mut self, rewriter: Option<OutfeedRewriter>) {
        self.outfeed_rewriter = rewriter;
    }

    /// Adds or replaces a backend. Cached artifacts are kept.
    pub fn register_backend(&mut self, backend: Arc<dyn Backend>) {
        self.backends.register(backend);
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Handler tables. Changes apply to later fingerprinting and transfers;
    /// result handlers are bound when an artifact is built.
    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn clear_caches(&self) {
        self.jit_cache.clear();
        self.primitive_cache.clear();
    }

    #[must_use]
    pub fn jit_cache_stats(&self) -> CacheStats {
        self.jit_cache.stats()
    }

    #[must_use]
    pub fn primitive_cache_stats(&self) -> CacheStats {
        self.primitive_cache.stats()
    }

    /// Runs a closed program compiled for the signature of `request.args`,
    /// compiling it on first use.
    pub fn xla_call(&self, request: &XlaCallRequest) -> Result<Vec<RuntimeValue>, DispatchError> {
        let compiled = self.xla_callable(request)?;
        match compiled.call(&request.args) {
            Err(DispatchError::FloatingPoint(err)) => {
                tracing::warn!(
                    computation = %request.name,
                    kind = %err.kind,
                    "invalid value in the output of a jit computation; re-running it deoptimized"
                );
                Err(DispatchError::FloatingPoint(self.deoptimized_rerun(request, err)))
            }
            other => other,
        }
    }

    /// The artifact `xla_call` would run for `request`, built on a cache miss.
    pub fn xla_callable(
        &self,
        request: &XlaCallRequest,
    ) -> Result<Arc<CompiledComputation>, DispatchError> {
        self.check_lowering()?;
        let arg_specs = self.registries.abstraction.read().arg_specs(&request.args)?;
        let donated = request.donated();
        let key = CacheKey {
            program: program_digest(&request.program),
            arg_specs,
            device: request.device,
            backend: request.backend.clone(),
            name: request.name.clone(),
            donated_invars: donated.clone(),
        };
        self.jit_cache.get_or_build(&key, || {
            self.build(&BuildRequest {
                name: &request.name,
                program: &request.program,
                arg_specs: &key.arg_specs,
                device: request.device,
                backend: request.backend.as_deref(),
                donated: &donated,
            })
        })
    }

    /// Applies a single primitive to `args`, compiling a one-equation
    /// program per distinct argument signature and parameter set.
    pub fn apply_primitive(
        &self,
        primitive: Primitive,
        args: &[RuntimeValue],
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<RuntimeValue>, DispatchError> {
        self.check_lowering()?;
        if primitive.requires_subprograms() {
            return Err(DispatchError::Unimplemented {
                detail: format!(
                    "`{primitive}` carries nested programs; dispatch it through xla_call"
                ),
            });
        }
        let arg_specs = self.registries.abstraction.read().arg_specs(args)?;
        let key = PrimitiveCacheKey {
            primitive,
            arg_specs,
            params: params.clone(),
        };
        let compiled = self.primitive_cache.get_or_build(&key, || {
            let program = ClosedJaxpr::open(single_equation_program(primitive, args.len(), params));
            let donated = vec![false; args.len()];
            self.build(&BuildRequest {
                name: primitive.as_str(),
                program: &program,
                arg_specs: &key.arg_specs,
                device: None,
                backend: None,
                donated: &donated,
            })
        })?;
        compiled.call(args)
    }

    /// Places `value` on `device` (or the default backend's first device)
    /// and returns it as a device array. Arrays already there are returned
    /// unchanged.
    pub fn device_put(
        &self,
        value: &RuntimeValue,
        device: Option<Device>,
    ) -> Result<RuntimeValue, DispatchError> {
        let backend = backend_for(device, None, &self.backends)?;
        let target = match device {
            Some(device) => device,
            None => match value.as_device_array() {
                Some(_) => return Ok(value.clone()),
                None => backend.local_devices().first().copied().ok_or_else(|| {
                    BackendError::AllocationFailed {
                        device: Device::new(backend.platform(), 0),
                        detail: "backend has no local devices".to_owned(),
                    }
                })?,
            },
        };
        if let Some(array) = value.as_device_array() {
            return Ok(RuntimeValue::Device(copy_device_array_to_device(
                array,
                backend.as_ref(),
                target,
            )?));
        }

        let aval = self.registries.abstraction.read().abstractify(value)?;
        let buffers = self
            .registries
            .device_put
            .read()
            .device_put(value, backend.as_ref(), target)?;
        let handler = self.registries.results.read().handler_for(device, &aval)?;
        handler(buffers)
    }

    fn check_lowering(&self) -> Result<(), DispatchError> {
        match self.config.lowering {
            LoweringPath::Classic => Ok(()),
            path => Err(ConfigurationError::UnsupportedLowering { path }.into()),
        }
    }

    /// Builds the artifact for one cache miss.
    fn build(&self, request: &BuildRequest<'_>) -> Result<CompiledComputation, DispatchError> {
        if let (Some(device), Some(backend)) = (request.device, request.backend) {
            return Err(ConfigurationError::DeviceAndBackend {
                device,
                backend: backend.to_owned(),
            }
            .into());
        }
        let program = request.program;
        program.jaxpr.validate_well_formed()?;
        if request.arg_specs.len() != program.jaxpr.invars.len() {
            return Err(TypeError::InputArity {
                expected: program.jaxpr.invars.len(),
                actual: request.arg_specs.len(),
            }
            .into());
        }

        let pruned = prune_unused_inputs(&program.jaxpr);
        let consts = keep(&program.consts, &pruned.kept_const_idx);
        let kept_specs = keep(request.arg_specs, &pruned.kept_var_idx);
        let in_avals: Vec<AbstractValue> =
            kept_specs.iter().map(|spec| spec.aval.clone()).collect();
        let arg_devices: Vec<Option<Device>> = kept_specs.iter().map(|spec| spec.device).collect();
        let donated = keep(request.donated, &pruned.kept_var_idx);

        let jaxpr = match &self.outfeed_rewriter {
            Some(rewrite) => rewrite(pruned.jaxpr),
            None => pruned.jaxpr,
        };
        if jaxpr_uses_outfeed(&jaxpr) {
            tracing::debug!(computation = request.name, "computation uses outfeed");
        }

        let replicas = jaxpr_replicas(&jaxpr);
        let device = resolve_device(
            request.device,
            request.backend,
            &arg_devices,
            replicas,
            &self.backends,
        )?;
        let backend = backend_for(device, request.backend, &self.backends)?;
        check_replicas(request.name, replicas, jaxpr_has_pmap(&jaxpr), backend.as_ref())?;

        let const_avals: Vec<AbstractValue> = consts.iter().map(Value::aval).collect();
        let out_avals = abstract_eval_jaxpr(&jaxpr, &const_avals, &in_avals)?;

        if is_trivial(&jaxpr) {
            tracing::debug!(
                computation = request.name,
                "trivial computation; skipping compilation"
            );
            return Ok(CompiledComputation {
                name: request.name.to_owned(),
                num_args: request.arg_specs.len(),
                kept_var_idx: pruned.kept_var_idx,
                in_avals,
                out_avals,
                unused_donations: Vec::new(),
                config: self.config.clone(),
                registries: Arc::clone(&self.registries),
                strategy: Strategy::Trivial {
                    jaxpr,
                    consts,
                    device,
                    backend,
                },
            });
        }

        let arg_list: Vec<String> = in_avals.iter().map(ToString::to_string).collect();
        if self.config.log_compiles {
            tracing::warn!(
                computation = request.name,
                args = ?arg_list,
                replicas,
                "compiling computation"
            );
        } else {
            tracing::debug!(
                computation = request.name,
                args = ?arg_list,
                replicas,
                "compiling computation"
            );
        }
        if replicas > 1 {
            tracing::warn!(
                computation = request.name,
                replicas,
                "jit-compiling a computation that contains pmap; arguments are replicated to every device and only the first replica's outputs are kept"
            );
        }
        let tuple_args = in_avals.len() > self.config.tuple_args_threshold;
        let lowered = lower_jaxpr(&LoweringRequest {
            name: request.name,
            jaxpr: &jaxpr,
            consts: &consts,
            in_avals: &in_avals,
            out_avals: &out_avals,
            donated: &donated,
            tuple_args,
            alias_donations: backend.supports_buffer_donation(),
        })?;
        let options = CompileOptions {
            num_replicas: replicas,
            num_partitions: 1,
            device_assignment: device.map(|device| vec![device]),
            parameter_is_tupled_arguments: tuple_args,
        };
        let executable =
            self.compile_or_get_cached(backend.as_ref(), &lowered.computation, &options)?;

        let handlers = {
            let results = self.registries.results.read();
            out_avals
                .iter()
                .map(|aval| results.handler_for(device, aval))
                .collect::<Result<Vec<_>, _>>()?
        };
        let buffer_counts = out_avals.iter().map(aval_to_num_buffers).collect();
        let kept_positions: Vec<usize> = pruned.kept_var_idx.iter().copied().collect();
        let donated_args: BTreeSet<usize> = lowered
            .aliased_inputs
            .iter()
            .filter_map(|input| kept_positions.get(*input).copied())
            .collect();

        Ok(CompiledComputation {
            name: request.name.to_owned(),
            num_args: request.arg_specs.len(),
            kept_var_idx: pruned.kept_var_idx,
            in_avals,
            out_avals,
            unused_donations: lowered.unused_donations,
            config: self.config.clone(),
            registries: Arc::clone(&self.registries),
            strategy: Strategy::Compiled {
                executable,
                backend,
                handlers,
                buffer_counts,
                replicas,
                donated_args,
            },
        })
    }

    /// Compiles `computation`, consulting the persistent cache first when
    /// one is configured.
    fn compile_or_get_cached(
        &self,
        backend: &dyn Backend,
        computation: &Computation,
        options: &CompileOptions,
    ) -> Result<Arc<dyn Executable>, DispatchError> {
        let Some(store) = &self.persistent_cache else {
            return Ok(backend.compile(computation, options)?);
        };
        let key = PersistentCacheKey::new(computation, options, backend.version()).map_err(
            |err| BackendError::CompilationFailed {
                detail: format!(
                    "cannot key `{}` for the persistent cache: {err}",
                    computation.name()
                ),
            },
        )?;
        if let Some(bytes) = store.get(&key) {
            match backend.deserialize_executable(&bytes) {
                Ok(executable) => {
                    tracing::info!(
                        computation = computation.name(),
                        key = %key.as_string(),
                        "persistent compilation cache hit"
                    );
                    return Ok(executable);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "discarding unreadable persistent cache entry");
                }
            }
        }
        let executable = backend.compile(computation, options)?;
        match executable.serialize() {
            Ok(bytes) => store.put(&key, bytes),
            Err(err) => {
                tracing::debug!(error = %err, "executable not stored in the persistent cache");
            }
        }
        Ok(executable)
    }

    /// Re-evaluates the original program on the host to find which primitive
    /// first produced the invalid value.
    fn deoptimized_rerun(
        &self,
        request: &XlaCallRequest,
        err: FloatingPointError,
    ) -> FloatingPointError {
        let host_args = match request
            .args
            .iter()
            .map(RuntimeValue::to_host)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(args) => args,
            Err(read_err) => {
                tracing::debug!(
                    error = %read_err,
                    "arguments unavailable for the deoptimized re-run"
                );
                return err;
            }
        };
        match numerics::locate_special(&request.program, &host_args, &self.config) {
            Some((primitive, kind)) => FloatingPointError {
                name: err.name,
                kind,
                primitive: Some(primitive),
            },
            None => err,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("backends", &self.backends)
            .field("jit_cache", &self.jit_cache)
            .field("primitive_cache", &self.primitive_cache)
            .field("persistent_cache", &self.persistent_cache.is_some())
            .finish_non_exhaustive()
    }
}

/// `outs = primitive(in_0, .., in_{n-1})` over fresh variables.
fn single_equation_program(
    primitive: Primitive,
    arity: usize,
    params: &BTreeMap<String, String>,
) -> Jaxpr {
    let invars: Vec<VarId> = (1..=arity as u32).map(VarId).collect();
    let out = VarId(arity as u32 + 1);
    let inputs: Vec<Atom> = invars.iter().copied().map(Atom::Var).collect();
    let mut eqn = Equation::new(primitive, &inputs, &[out]);
    eqn.params = params.clone();
    Jaxpr::new(invars, vec![], vec![Atom::Var(out)], vec![eqn])
}
