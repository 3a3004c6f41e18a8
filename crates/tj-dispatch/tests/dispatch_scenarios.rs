#![forbid(unsafe_code)]

//! End-to-end dispatch scenarios against the host backend: compile-once
//! caching, placement, trivial programs, replication, donation, numerics
//! checks and the persistent compilation cache.

use std::sync::Arc;

use tj_backend_cpu::{CpuBackend, CpuExecutable};
use tj_cache::InMemoryPersistentCache;
use tj_core::{
    AbstractValue, Atom, ClosedJaxpr, DType, Equation, Jaxpr, Literal, Primitive, ProgramSpec,
    Shape, Value, VarId, build_program,
};
use tj_dispatch::{
    ConfigurationError, DispatchConfig, DispatchError, Dispatcher, FloatingPointKind, TypeError,
    XlaCallRequest,
};
use tj_runtime::{BackendError, Device, Executable, Platform, RuntimeValue};
use tj_test_utils::{TEST_LOG_SCHEMA_VERSION, TestLogV1, TestResult, fixture_id_from_json, test_id};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn log_scenario(name: &str, fixture: &impl serde::Serialize, compile_count: u64) {
    let fixture_id = fixture_id_from_json(fixture).expect("fixture digest");
    let log = TestLogV1::unit(test_id(module_path!(), name), fixture_id, TestResult::Pass)
        .with_compile_count(compile_count);
    assert_eq!(log.schema_version, TEST_LOG_SCHEMA_VERSION);
    let encoded = serde_json::to_string(&log).expect("log serializes");
    assert!(encoded.contains(name));
}

fn host(value: Value) -> RuntimeValue {
    RuntimeValue::Host(value)
}

fn read(values: &[RuntimeValue]) -> Vec<Value> {
    values.iter().map(|value| value.to_host().expect("readable")).collect()
}

fn program(spec: ProgramSpec) -> ClosedJaxpr {
    ClosedJaxpr::open(build_program(spec))
}

fn pmap_square(axis_size: usize) -> ClosedJaxpr {
    ClosedJaxpr::open(Jaxpr::new(
        vec![VarId(1)],
        vec![],
        vec![Atom::Var(VarId(2))],
        vec![
            Equation::new(Primitive::XlaPmap, &[Atom::Var(VarId(1))], &[VarId(2)])
                .with_param("axis_size", axis_size)
                .with_sub_jaxpr(build_program(ProgramSpec::Square)),
        ],
    ))
}

#[test]
fn cache_compiles_once_per_signature() {
    init_tracing();
    let backend = Arc::new(CpuBackend::new());
    let dispatcher = Dispatcher::with_backend(backend.clone());
    let add = program(ProgramSpec::Add2);

    let calls = [
        (Value::scalar_f32(1.0), Value::scalar_f32(2.0)),
        (Value::scalar_f32(3.0), Value::scalar_f32(4.0)),
        (Value::scalar_i32(1), Value::scalar_i32(2)),
    ];
    let mut results = Vec::new();
    for (x, y) in calls {
        let request = XlaCallRequest::new("add", add.clone(), vec![host(x), host(y)]);
        results.extend(read(&dispatcher.xla_call(&request).expect("add runs")));
    }

    assert_eq!(
        results,
        vec![Value::scalar_f32(3.0), Value::scalar_f32(7.0), Value::scalar_i32(3)]
    );
    let stats = dispatcher.jit_cache_stats();
    assert_eq!(stats.builds, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 2);
    assert_eq!(backend.compile_count(), 2);
    log_scenario("cache_compiles_once_per_signature", &["f32,f32", "f32,f32", "i32,i32"], 2);
}

#[test]
fn shape_changes_miss_the_cache() {
    let backend = Arc::new(CpuBackend::new());
    let dispatcher = Dispatcher::with_backend(backend.clone());
    let square = program(ProgramSpec::Square);
    let inputs: [&[f32]; 3] = [&[1.0, 2.0], &[3.0, 4.0], &[1.0, 2.0, 3.0]];
    for values in inputs {
        let request = XlaCallRequest::new(
            "square",
            square.clone(),
            vec![host(Value::vector_f32(values).expect("vector"))],
        );
        dispatcher.xla_call(&request).expect("square runs");
    }
    assert_eq!(backend.compile_count(), 2);
}

#[test]
fn committed_arguments_pin_the_computation() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::with_device_count(2)));
    let committed = dispatcher
        .device_put(&host(Value::scalar_i64(40)), Some(Device::cpu(1)))
        .expect("put");

    let request = XlaCallRequest::new(
        "add",
        program(ProgramSpec::Add2),
        vec![committed, host(Value::scalar_i64(2))],
    );
    let outputs = dispatcher.xla_call(&request).expect("colocated call");
    let array = outputs[0].as_device_array().expect("device output");
    assert_eq!(array.device(), Device::cpu(1));
    assert_eq!(array.sticky_device(), Some(Device::cpu(1)));
    assert_eq!(read(&outputs), vec![Value::scalar_i64(42)]);
}

#[test]
fn arguments_committed_to_different_devices_are_rejected() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::with_device_count(2)));
    let on_first = dispatcher
        .device_put(&host(Value::scalar_i64(1)), Some(Device::cpu(0)))
        .expect("put");
    let on_second = dispatcher
        .device_put(&host(Value::scalar_i64(2)), Some(Device::cpu(1)))
        .expect("put");

    let request = XlaCallRequest::new("add", program(ProgramSpec::Add2), vec![on_first, on_second]);
    let err = dispatcher.xla_call(&request).expect_err("not colocated");
    match err {
        DispatchError::Configuration(ConfigurationError::ArgumentsNotColocated { devices }) => {
            assert_eq!(devices, vec![Device::cpu(0), Device::cpu(1)]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn device_and_backend_together_are_rejected() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::new()));
    let request = XlaCallRequest::new(
        "sq",
        program(ProgramSpec::Square),
        vec![host(Value::scalar_f32(2.0))],
    )
    .with_device(Device::cpu(0))
    .with_backend("cpu");
    assert!(matches!(
        dispatcher.xla_call(&request),
        Err(DispatchError::Configuration(ConfigurationError::DeviceAndBackend { .. }))
    ));
}

#[test]
fn unknown_backends_are_configuration_errors() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::new()));
    let request = XlaCallRequest::new(
        "sq",
        program(ProgramSpec::Square),
        vec![host(Value::scalar_f32(2.0))],
    )
    .with_backend("tpu");
    assert!(matches!(
        dispatcher.xla_call(&request),
        Err(DispatchError::Configuration(ConfigurationError::UnknownBackend { .. }))
    ));
}

#[test]
fn trivial_programs_skip_compilation() {
    let backend = Arc::new(CpuBackend::new());
    let dispatcher = Dispatcher::with_backend(backend.clone());

    let identity = XlaCallRequest::new(
        "identity",
        program(ProgramSpec::Identity),
        vec![host(Value::scalar_f64(2.5))],
    );
    let compiled = dispatcher.xla_callable(&identity).expect("build");
    assert!(compiled.is_trivial());
    let outputs = dispatcher.xla_call(&identity).expect("identity");
    assert_eq!(read(&outputs), vec![Value::scalar_f64(2.5)]);

    let constant = XlaCallRequest::new(
        "constant",
        ClosedJaxpr::open(Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![Atom::Lit(Literal::I64(7))],
            vec![],
        )),
        vec![host(Value::scalar_i64(0))],
    );
    let outputs = dispatcher.xla_call(&constant).expect("constant");
    assert_eq!(read(&outputs), vec![Value::scalar_i64(7)]);
    assert!(outputs[0].as_device_array().is_some());

    assert_eq!(backend.compile_count(), 0);
    log_scenario("trivial_programs_skip_compilation", &["identity", "constant"], 0);
}

#[test]
fn constant_outputs_skip_compilation() {
    let backend = Arc::new(CpuBackend::new());
    let dispatcher = Dispatcher::with_backend(backend.clone());
    let jaxpr = Jaxpr::new(vec![VarId(1)], vec![VarId(2)], vec![Atom::Var(VarId(2))], vec![]);
    let constant = Value::vector_f32(&[1.0, 2.0]).expect("vector");
    let closed = ClosedJaxpr::new(jaxpr, vec![constant.clone()]).expect("closed");

    let request = XlaCallRequest::new("const_out", closed, vec![host(Value::scalar_f32(0.0))]);
    let compiled = dispatcher.xla_callable(&request).expect("build");
    assert!(compiled.is_trivial());
    let outputs = dispatcher.xla_call(&request).expect("constant output");
    assert_eq!(read(&outputs), vec![constant]);
    assert!(outputs[0].as_device_array().is_some());
    assert_eq!(backend.compile_count(), 0);
}

#[test]
fn unused_arguments_are_pruned() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::new()));
    let request = XlaCallRequest::new(
        "ignore_second",
        program(ProgramSpec::IgnoreSecond),
        vec![host(Value::scalar_i64(3)), host(Value::scalar_f32(9.0))],
    );
    let compiled = dispatcher.xla_callable(&request).expect("build");
    assert_eq!(compiled.kept_var_idx().iter().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(compiled.in_avals(), &[AbstractValue::scalar(DType::I64)]);
    assert_eq!(read(&dispatcher.xla_call(&request).expect("runs")), vec![Value::scalar_i64(6)]);
}

#[test]
fn called_with_wrong_types_reports_both_signatures() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::new()));
    let request = XlaCallRequest::new(
        "sq",
        program(ProgramSpec::Square),
        vec![host(Value::scalar_f32(2.0))],
    );
    let compiled = dispatcher.xla_callable(&request).expect("build");
    let err = compiled
        .call(&[host(Value::scalar_i32(2))])
        .expect_err("type mismatch");
    match err {
        DispatchError::Type(TypeError::InputTypes { expected, actual }) => {
            assert_eq!(expected, vec![AbstractValue::scalar(DType::F32)]);
            assert_eq!(actual, vec![AbstractValue::scalar(DType::I32)]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        compiled.call(&[]),
        Err(DispatchError::Type(TypeError::InputArity { expected: 1, actual: 0 }))
    ));
}

/// `x_0 + x_1 + .. + x_{arity-1}` over i64 scalars.
fn chained_sum(arity: u32) -> ClosedJaxpr {
    let invars: Vec<VarId> = (1..=arity).map(VarId).collect();
    let mut acc = invars[0];
    let mut equations = Vec::new();
    for (offset, var) in invars.iter().skip(1).enumerate() {
        let out = VarId(arity + 1 + offset as u32);
        equations.push(Equation::new(Primitive::Add, &[Atom::Var(acc), Atom::Var(*var)], &[out]));
        acc = out;
    }
    ClosedJaxpr::open(Jaxpr::new(invars, vec![], vec![Atom::Var(acc)], equations))
}

#[test]
fn wide_signatures_pass_arguments_as_one_tuple() {
    let backend = Arc::new(CpuBackend::new());
    let dispatcher = Dispatcher::with_backend(backend.clone());
    let args = (0..150).map(|value| host(Value::scalar_i64(value))).collect();
    let request = XlaCallRequest::new("wide_sum", chained_sum(150), args);

    let compiled = dispatcher.xla_callable(&request).expect("build");
    let bytes = compiled
        .executable()
        .expect("compiled strategy")
        .serialize()
        .expect("serializable");
    let executable: CpuExecutable = serde_json::from_slice(&bytes).expect("cpu executable");
    assert!(executable.computation().tupled_params());
    assert!(executable.options().parameter_is_tupled_arguments);

    let outputs = dispatcher.xla_call(&request).expect("wide call");
    assert_eq!(read(&outputs), vec![Value::scalar_i64(11175)]);
    assert_eq!(backend.compile_count(), 1);

    let narrow = XlaCallRequest::new(
        "narrow_sum",
        chained_sum(3),
        vec![host(Value::scalar_i64(1)), host(Value::scalar_i64(2)), host(Value::scalar_i64(3))],
    );
    let compiled = dispatcher.xla_callable(&narrow).expect("build");
    let bytes = compiled.executable().expect("compiled").serialize().expect("serializable");
    let executable: CpuExecutable = serde_json::from_slice(&bytes).expect("cpu executable");
    assert!(!executable.computation().tupled_params());
    log_scenario(
        "wide_signatures_pass_arguments_as_one_tuple",
        &[150_u32, 3],
        backend.compile_count(),
    );
}

#[test]
fn tokens_and_units_pass_through_compiled_programs() {
    let backend = Arc::new(CpuBackend::new());
    let dispatcher = Dispatcher::with_backend(backend.clone());
    let jaxpr = Jaxpr::new(
        vec![VarId(1), VarId(2), VarId(3), VarId(4)],
        vec![],
        vec![
            Atom::Var(VarId(1)),
            Atom::Var(VarId(5)),
            Atom::Var(VarId(3)),
            Atom::Var(VarId(4)),
        ],
        vec![Equation::new(
            Primitive::Mul,
            &[Atom::Var(VarId(2)), Atom::Var(VarId(2))],
            &[VarId(5)],
        )],
    );
    let request = XlaCallRequest::new(
        "effects",
        ClosedJaxpr::open(jaxpr),
        vec![
            host(Value::Token),
            host(Value::scalar_f32(3.0)),
            host(Value::Unit),
            host(Value::scalar_i64(5)),
        ],
    );

    let compiled = dispatcher.xla_callable(&request).expect("build");
    assert!(!compiled.is_trivial());
    assert_eq!(
        compiled.in_avals(),
        &[
            AbstractValue::Token,
            AbstractValue::scalar(DType::F32),
            AbstractValue::Unit,
            AbstractValue::scalar(DType::I64),
        ]
    );
    let outputs = dispatcher.xla_call(&request).expect("compiled call");
    assert_eq!(
        read(&outputs),
        vec![Value::Token, Value::scalar_f32(9.0), Value::Unit, Value::scalar_i64(5)]
    );
    assert_eq!(backend.compile_count(), 1);
}

#[test]
fn pmap_inside_jit_runs_replicated() {
    init_tracing();
    let backend = Arc::new(CpuBackend::with_device_count(4));
    let dispatcher = Dispatcher::with_backend(backend.clone());
    let request = XlaCallRequest::new(
        "jit_of_pmap",
        pmap_square(4),
        vec![host(Value::vector_f32(&[1.0, 2.0, 3.0, 4.0]).expect("vector"))],
    );
    let compiled = dispatcher.xla_callable(&request).expect("build");
    assert_eq!(compiled.replicas(), 4);
    let outputs = dispatcher.xla_call(&request).expect("replicated call");
    assert_eq!(
        read(&outputs),
        vec![Value::vector_f32(&[1.0, 4.0, 9.0, 16.0]).expect("vector")]
    );
    log_scenario("pmap_inside_jit_runs_replicated", &[4_u32], backend.compile_count());
}

#[test]
fn replicated_computations_need_enough_devices() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::with_device_count(2)));
    let request = XlaCallRequest::new(
        "jit_of_pmap",
        pmap_square(4),
        vec![host(Value::vector_f32(&[1.0, 2.0, 3.0, 4.0]).expect("vector"))],
    );
    match dispatcher.xla_call(&request).expect_err("too few devices") {
        DispatchError::Configuration(ConfigurationError::InsufficientDevices {
            replicas, available, ..
        }) => assert_eq!((replicas, available), (4, 2)),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn replica_counts_past_the_address_space_are_rejected() {
    let huge = 1_usize << 33;
    let inner = pmap_square(huge).jaxpr;
    let outer = ClosedJaxpr::open(Jaxpr::new(
        vec![VarId(1)],
        vec![],
        vec![Atom::Var(VarId(2))],
        vec![
            Equation::new(Primitive::XlaPmap, &[Atom::Var(VarId(1))], &[VarId(2)])
                .with_param("axis_size", huge)
                .with_sub_jaxpr(inner),
        ],
    ));
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::with_device_count(2)));
    let request = XlaCallRequest::new(
        "nested_pmap",
        outer,
        vec![host(Value::vector_f32(&[1.0, 2.0]).expect("vector"))],
    );
    match dispatcher.xla_call(&request).expect_err("too many replicas") {
        DispatchError::Configuration(ConfigurationError::InsufficientDevices {
            replicas, available, ..
        }) => assert_eq!((replicas, available), (usize::MAX, 2)),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn replicated_computations_cannot_be_pinned() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::with_device_count(4)));
    let request = XlaCallRequest::new(
        "jit_of_pmap",
        pmap_square(4),
        vec![host(Value::vector_f32(&[1.0, 2.0, 3.0, 4.0]).expect("vector"))],
    )
    .with_device(Device::cpu(0));
    assert!(matches!(
        dispatcher.xla_call(&request),
        Err(DispatchError::Configuration(
            ConfigurationError::PinnedReplicatedComputation { replicas: 4 }
        ))
    ));
}

#[test]
fn multi_host_pmap_is_unimplemented() {
    let backend = CpuBackend::with_device_count(4).with_process_count(2);
    let dispatcher = Dispatcher::with_backend(Arc::new(backend));
    let request = XlaCallRequest::new(
        "jit_of_pmap",
        pmap_square(4),
        vec![host(Value::vector_f32(&[1.0, 2.0, 3.0, 4.0]).expect("vector"))],
    );
    assert!(matches!(
        dispatcher.xla_call(&request),
        Err(DispatchError::Unimplemented { .. })
    ));
}

#[test]
fn donated_buffers_are_consumed_on_aliasing_platforms() {
    let backend = Arc::new(CpuBackend::new().with_platform(Platform::Gpu));
    let dispatcher = Dispatcher::with_backend(backend);
    let x = dispatcher
        .device_put(&host(Value::vector_f32(&[1.0, 2.0]).expect("vector")), None)
        .expect("put");
    assert_eq!(x.as_device_array().expect("array").device(), Device::new(Platform::Gpu, 0));

    let request = XlaCallRequest::new("square", program(ProgramSpec::Square), vec![x.clone()])
        .with_donated_invars(vec![true]);
    let compiled = dispatcher.xla_callable(&request).expect("build");
    assert!(compiled.unused_donations().is_empty());

    let outputs = dispatcher.xla_call(&request).expect("first call");
    assert_eq!(read(&outputs), vec![Value::vector_f32(&[1.0, 4.0]).expect("vector")]);
    assert!(x.as_device_array().expect("array").is_deleted());

    assert!(matches!(
        dispatcher.xla_call(&request),
        Err(DispatchError::Backend(BackendError::DeletedBuffer { .. }))
    ));
}

#[test]
fn donations_are_unused_without_aliasing_support() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::new()));
    let x = dispatcher
        .device_put(&host(Value::vector_f32(&[1.0, 2.0]).expect("vector")), None)
        .expect("put");
    let request = XlaCallRequest::new("square", program(ProgramSpec::Square), vec![x.clone()])
        .with_donated_invars(vec![true]);
    let compiled = dispatcher.xla_callable(&request).expect("build");
    assert_eq!(
        compiled.unused_donations(),
        &[AbstractValue::shaped(DType::F32, Shape::vector(2))]
    );
    dispatcher.xla_call(&request).expect("call");
    assert!(!x.as_device_array().expect("array").is_deleted());
    dispatcher.xla_call(&request).expect("donation was not consumed");
}

#[test]
fn nan_outputs_name_the_offending_primitive() {
    init_tracing();
    let dispatcher =
        Dispatcher::with_backend(Arc::new(CpuBackend::new())).with_config(DispatchConfig {
            debug_nans: true,
            ..DispatchConfig::default()
        });
    let log_then_double = ClosedJaxpr::open(Jaxpr::new(
        vec![VarId(1)],
        vec![],
        vec![Atom::Var(VarId(3))],
        vec![
            Equation::new(Primitive::Log, &[Atom::Var(VarId(1))], &[VarId(2)]),
            Equation::new(Primitive::Add, &[Atom::Var(VarId(2)), Atom::Var(VarId(2))], &[VarId(3)]),
        ],
    ));

    let ok = XlaCallRequest::new("f", log_then_double.clone(), vec![host(Value::scalar_f64(1.0))]);
    assert_eq!(read(&dispatcher.xla_call(&ok).expect("finite")), vec![Value::scalar_f64(0.0)]);

    let bad = XlaCallRequest::new("f", log_then_double, vec![host(Value::scalar_f64(-1.0))]);
    match dispatcher.xla_call(&bad).expect_err("nan") {
        DispatchError::FloatingPoint(err) => {
            assert_eq!(err.name, "f");
            assert_eq!(err.kind, FloatingPointKind::Nan);
            assert_eq!(err.primitive, Some(Primitive::Log));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn nan_reruns_can_read_donated_arguments() {
    let backend = Arc::new(CpuBackend::new().with_platform(Platform::Gpu));
    let dispatcher = Dispatcher::with_backend(backend).with_config(DispatchConfig {
        debug_nans: true,
        ..DispatchConfig::default()
    });
    let x = dispatcher
        .device_put(&host(Value::vector_f64(&[-1.0, 1.0]).expect("vector")), None)
        .expect("put");
    let log = ClosedJaxpr::open(Jaxpr::new(
        vec![VarId(1)],
        vec![],
        vec![Atom::Var(VarId(2))],
        vec![Equation::new(Primitive::Log, &[Atom::Var(VarId(1))], &[VarId(2)])],
    ));
    let request = XlaCallRequest::new("log", log, vec![x.clone()]).with_donated_invars(vec![true]);
    assert!(dispatcher.xla_callable(&request).expect("build").unused_donations().is_empty());

    match dispatcher.xla_call(&request).expect_err("nan") {
        DispatchError::FloatingPoint(err) => {
            assert_eq!(err.kind, FloatingPointKind::Nan);
            assert_eq!(err.primitive, Some(Primitive::Log));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!x.as_device_array().expect("array").is_deleted());
}

#[test]
fn nan_checks_are_off_by_default() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::new()));
    let request = XlaCallRequest::new(
        "log",
        ClosedJaxpr::open(Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![Atom::Var(VarId(2))],
            vec![Equation::new(Primitive::Log, &[Atom::Var(VarId(1))], &[VarId(2)])],
        )),
        vec![host(Value::scalar_f64(-1.0))],
    );
    let outputs = read(&dispatcher.xla_call(&request).expect("runs"));
    assert!(matches!(&outputs[0], Value::Scalar(lit) if lit.is_nan()));
}

#[test]
fn persistent_cache_is_shared_across_dispatchers() {
    let backend = Arc::new(CpuBackend::new());
    let store = Arc::new(InMemoryPersistentCache::new());
    let request = XlaCallRequest::new(
        "mul",
        program(ProgramSpec::Mul2),
        vec![host(Value::scalar_i64(6)), host(Value::scalar_i64(7))],
    );

    let first = Dispatcher::with_backend(backend.clone()).with_persistent_cache(store.clone());
    assert_eq!(read(&first.xla_call(&request).expect("compile")), vec![Value::scalar_i64(42)]);
    assert_eq!(backend.compile_count(), 1);
    assert_eq!(store.len(), 1);

    let second = Dispatcher::with_backend(backend.clone()).with_persistent_cache(store.clone());
    assert_eq!(read(&second.xla_call(&request).expect("restore")), vec![Value::scalar_i64(42)]);
    assert_eq!(backend.compile_count(), 1);
    assert_eq!(second.jit_cache_stats().builds, 1);
    log_scenario("persistent_cache_is_shared_across_dispatchers", &["mul", "i64"], 1);
}

#[test]
fn device_arrays_move_between_devices() {
    let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::with_device_count(2)));
    let uncommitted = dispatcher
        .device_put(&host(Value::vector_i64(&[1, 2, 3]).expect("vector")), None)
        .expect("put");
    let array = uncommitted.as_device_array().expect("array");
    assert_eq!(array.device(), Device::cpu(0));
    assert_eq!(array.sticky_device(), None);

    let moved = dispatcher.device_put(&uncommitted, Some(Device::cpu(1))).expect("move");
    let moved_array = moved.as_device_array().expect("array");
    assert_eq!(moved_array.device(), Device::cpu(1));
    assert_eq!(
        moved.to_host().expect("read"),
        Value::vector_i64(&[1, 2, 3]).expect("vector")
    );
}

#[test]
fn primitives_apply_through_their_own_cache() {
    let backend = Arc::new(CpuBackend::new());
    let dispatcher = Dispatcher::with_backend(backend.clone());
    let params = std::collections::BTreeMap::new();
    let out = dispatcher
        .apply_primitive(
            Primitive::Sub,
            &[host(Value::scalar_i64(10)), host(Value::scalar_i64(4))],
            &params,
        )
        .expect("sub");
    assert_eq!(read(&out), vec![Value::scalar_i64(6)]);
    dispatcher
        .apply_primitive(
            Primitive::Sub,
            &[host(Value::scalar_i64(1)), host(Value::scalar_i64(1))],
            &params,
        )
        .expect("sub again");
    assert_eq!(dispatcher.primitive_cache_stats().builds, 1);
    assert_eq!(dispatcher.jit_cache_stats().builds, 0);
    assert_eq!(backend.compile_count(), 1);
}
