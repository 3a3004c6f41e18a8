use crate::{Atom, DType, Equation, Jaxpr, Literal, Primitive, Shape, VarId};
use proptest::prelude::*;

pub fn arb_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::F32),
        Just(DType::F64),
        Just(DType::I32),
        Just(DType::I64),
        Just(DType::Bool),
    ]
}

pub fn arb_literal() -> impl Strategy<Value = Literal> {
    prop_oneof![
        any::<i32>().prop_map(Literal::I32),
        any::<i64>().prop_map(Literal::I64),
        any::<bool>().prop_map(Literal::Bool),
        (-1.0e6_f32..1.0e6).prop_map(Literal::from_f32),
        (-1.0e12_f64..1.0e12).prop_map(Literal::from_f64),
    ]
}

pub fn arb_shape() -> impl Strategy<Value = Shape> {
    proptest::collection::vec(1_u32..5, 0..4).prop_map(|dims| Shape { dims })
}

fn arb_elementwise() -> impl Strategy<Value = Primitive> {
    prop_oneof![
        Just(Primitive::Add),
        Just(Primitive::Sub),
        Just(Primitive::Mul),
        Just(Primitive::Max),
        Just(Primitive::Min),
    ]
}

/// Well-formed straight-line programs of binary elementwise equations.
/// Every equation reads only vars bound earlier.
pub fn arb_jaxpr() -> impl Strategy<Value = Jaxpr> {
    (1_u32..4, proptest::collection::vec((arb_elementwise(), any::<u32>(), any::<u32>()), 0..8))
        .prop_map(|(n_inputs, eqn_specs)| {
            let invars = (1..=n_inputs).map(VarId).collect::<Vec<_>>();
            let mut bound = invars.clone();
            let mut next = n_inputs + 1;
            let mut equations = Vec::with_capacity(eqn_specs.len());
            for (primitive, lhs, rhs) in eqn_specs {
                let lhs = bound[lhs as usize % bound.len()];
                let rhs = bound[rhs as usize % bound.len()];
                let out = VarId(next);
                next += 1;
                equations.push(Equation::new(
                    primitive,
                    &[Atom::Var(lhs), Atom::Var(rhs)],
                    &[out],
                ));
                bound.push(out);
            }
            let last = bound[bound.len() - 1];
            Jaxpr::new(invars, vec![], vec![Atom::Var(last)], equations)
        })
}
