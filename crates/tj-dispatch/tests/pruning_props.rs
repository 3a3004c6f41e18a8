#![forbid(unsafe_code)]

//! Pruning unused inputs never changes what a program computes.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use tj_backend_cpu::CpuBackend;
use tj_core::{Atom, ClosedJaxpr, Equation, Jaxpr, Primitive, Value, VarId};
use tj_dispatch::{Dispatcher, XlaCallRequest, prune_unused_inputs};
use tj_interpreters::eval_jaxpr;
use tj_runtime::RuntimeValue;
use tj_test_utils::property_test_case_count;

/// Sums the inputs selected by `used` with a chain of adds.
fn sum_of(arity: usize, used: &BTreeSet<usize>) -> Jaxpr {
    let invars: Vec<VarId> = (1..=arity as u32).map(VarId).collect();
    let mut selected = used.iter().map(|index| invars[*index]);
    let mut acc = selected.next().expect("at least one input is used");
    let mut next = arity as u32 + 1;
    let mut equations = Vec::new();
    for var in selected {
        let out = VarId(next);
        next += 1;
        equations.push(Equation::new(Primitive::Add, &[Atom::Var(acc), Atom::Var(var)], &[out]));
        acc = out;
    }
    Jaxpr::new(invars, vec![], vec![Atom::Var(acc)], equations)
}

fn case() -> impl Strategy<Value = (Vec<i64>, BTreeSet<usize>)> {
    (1_usize..6).prop_flat_map(|arity| {
        (
            proptest::collection::vec(-1000_i64..1000, arity),
            proptest::collection::btree_set(0..arity, 1..=arity),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(property_test_case_count()))]

    #[test]
    fn pruning_keeps_exactly_the_used_inputs((values, used) in case()) {
        let jaxpr = sum_of(values.len(), &used);
        let pruned = prune_unused_inputs(&jaxpr);
        prop_assert_eq!(&pruned.kept_var_idx, &used);
        prop_assert_eq!(pruned.jaxpr.invars.len(), used.len());
    }

    #[test]
    fn pruned_dispatch_matches_full_evaluation((values, used) in case()) {
        let jaxpr = sum_of(values.len(), &used);
        let host: Vec<Value> = values.iter().copied().map(Value::scalar_i64).collect();
        let expected = eval_jaxpr(&jaxpr, &host).expect("reference evaluation");

        let dispatcher = Dispatcher::with_backend(Arc::new(CpuBackend::new()));
        let args = host.into_iter().map(RuntimeValue::Host).collect();
        let request = XlaCallRequest::new("sum", ClosedJaxpr::open(jaxpr), args);
        let outputs: Vec<Value> = dispatcher
            .xla_call(&request)
            .expect("dispatch")
            .iter()
            .map(|value| value.to_host().expect("readable"))
            .collect();
        prop_assert_eq!(outputs, expected);
    }
}
