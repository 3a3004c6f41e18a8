#![forbid(unsafe_code)]

mod typing;

pub use typing::abstract_eval_jaxpr;

use std::collections::BTreeMap;
use tj_core::{Atom, ClosedJaxpr, Equation, Jaxpr, Primitive, TensorValue, Value, ValueError, VarId};
use tj_lax::{EvalError, eval_primitive};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    ConstArity {
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    UnexpectedOutputArity {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    InvalidParam {
        primitive: Primitive,
        detail: String,
    },
    /// An equation observer refused to let evaluation continue.
    Rejected {
        primitive: Primitive,
        detail: String,
    },
    Primitive(EvalError),
    Value(ValueError),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(f, "input arity mismatch: expected {expected}, got {actual}")
            }
            Self::ConstArity { expected, actual } => {
                write!(f, "const arity mismatch: expected {expected}, got {actual}")
            }
            Self::MissingVariable(var) => write!(f, "missing variable {var}"),
            Self::UnexpectedOutputArity {
                primitive,
                expected,
                actual,
            } => write!(
                f,
                "{primitive} produced {actual} outputs but the equation binds {expected}"
            ),
            Self::InvalidParam { primitive, detail } => {
                write!(f, "invalid {primitive} equation: {detail}")
            }
            Self::Rejected { primitive, detail } => {
                write!(f, "evaluation stopped at {primitive}: {detail}")
            }
            Self::Primitive(err) => write!(f, "primitive eval failed: {err}"),
            Self::Value(err) => write!(f, "invalid value: {err}"),
        }
    }
}

impl std::error::Error for InterpreterError {}

impl From<EvalError> for InterpreterError {
    fn from(value: EvalError) -> Self {
        Self::Primitive(value)
    }
}

impl From<ValueError> for InterpreterError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

/// Callback run after every evaluated equation, nested ones included.
pub type EquationObserver<'a> = dyn FnMut(&Equation, &[Value]) -> Result<(), InterpreterError> + 'a;

pub fn eval_jaxpr(jaxpr: &Jaxpr, args: &[Value]) -> Result<Vec<Value>, InterpreterError> {
    eval_jaxpr_with_consts(jaxpr, &[], args)
}

pub fn eval_closed_jaxpr(
    closed: &ClosedJaxpr,
    args: &[Value],
) -> Result<Vec<Value>, InterpreterError> {
    eval_jaxpr_with_consts(&closed.jaxpr, &closed.consts, args)
}

pub fn eval_jaxpr_with_consts(
    jaxpr: &Jaxpr,
    consts: &[Value],
    args: &[Value],
) -> Result<Vec<Value>, InterpreterError> {
    eval_jaxpr_with_observer(jaxpr, consts, args, &mut |_, _| Ok(()))
}

pub fn eval_jaxpr_with_observer(
    jaxpr: &Jaxpr,
    consts: &[Value],
    args: &[Value],
    observer: &mut EquationObserver<'_>,
) -> Result<Vec<Value>, InterpreterError> {
    if args.len() != jaxpr.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: jaxpr.invars.len(),
            actual: args.len(),
        });
    }
    if consts.len() != jaxpr.constvars.len() {
        return Err(InterpreterError::ConstArity {
            expected: jaxpr.constvars.len(),
            actual: consts.len(),
        });
    }

    let mut env: BTreeMap<VarId, Value> = BTreeMap::new();
    for (var, value) in jaxpr.constvars.iter().zip(consts) {
        env.insert(*var, value.clone());
    }
    for (var, value) in jaxpr.invars.iter().zip(args) {
        env.insert(*var, value.clone());
    }

    for eqn in &jaxpr.equations {
        let resolved = eqn
            .inputs
            .iter()
            .map(|atom| read_atom(&env, atom))
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = eval_equation(eqn, &resolved, observer)?;
        if outputs.len() != eqn.outputs.len() {
            return Err(InterpreterError::UnexpectedOutputArity {
                primitive: eqn.primitive,
                expected: eqn.outputs.len(),
                actual: outputs.len(),
            });
        }
        observer(eqn, &outputs)?;
        for (var, value) in eqn.outputs.iter().zip(outputs) {
            env.insert(*var, value);
        }
    }

    jaxpr
        .outvars
        .iter()
        .map(|atom| read_atom(&env, atom))
        .collect()
}

fn read_atom(env: &BTreeMap<VarId, Value>, atom: &Atom) -> Result<Value, InterpreterError> {
    match atom {
        Atom::Var(var) => env
            .get(var)
            .cloned()
            .ok_or(InterpreterError::MissingVariable(*var)),
        Atom::Lit(lit) => Ok(Value::Scalar(*lit)),
    }
}

/// Evaluates a single equation on already-resolved operands.
pub fn eval_equation(
    eqn: &Equation,
    inputs: &[Value],
    observer: &mut EquationObserver<'_>,
) -> Result<Vec<Value>, InterpreterError> {
    match eqn.primitive {
        Primitive::XlaCall => {
            let body = nested_body(eqn, 0)?;
            eval_jaxpr_with_observer(body, &[], inputs, observer)
        }
        Primitive::XlaPmap => eval_pmap(eqn, inputs, observer),
        Primitive::Cond => {
            let Some((selector, operands)) = inputs.split_first() else {
                return Err(InterpreterError::InvalidParam {
                    primitive: eqn.primitive,
                    detail: "missing branch index operand".to_owned(),
                });
            };
            let index = selector
                .as_i64_scalar()
                .ok_or_else(|| InterpreterError::InvalidParam {
                    primitive: eqn.primitive,
                    detail: "branch index must be an integer scalar".to_owned(),
                })?;
            // Out-of-range indices clamp to the nearest branch.
            let last = eqn.sub_jaxprs.len().saturating_sub(1);
            let branch = usize::try_from(index.max(0)).unwrap_or(usize::MAX).min(last);
            let body = nested_body(eqn, branch)?;
            eval_jaxpr_with_observer(body, &[], operands, observer)
        }
        Primitive::Outfeed => match inputs.first() {
            Some(Value::Token) => Ok(vec![Value::Token]),
            _ => Err(InterpreterError::InvalidParam {
                primitive: eqn.primitive,
                detail: "first operand must be a token".to_owned(),
            }),
        },
        primitive => Ok(vec![eval_primitive(primitive, inputs, &eqn.params)?]),
    }
}

fn nested_body(eqn: &Equation, index: usize) -> Result<&Jaxpr, InterpreterError> {
    let body = eqn
        .sub_jaxprs
        .get(index)
        .ok_or_else(|| InterpreterError::InvalidParam {
            primitive: eqn.primitive,
            detail: format!("missing nested program {index}"),
        })?;
    if !body.constvars.is_empty() {
        return Err(InterpreterError::InvalidParam {
            primitive: eqn.primitive,
            detail: "nested programs must not close over constants".to_owned(),
        });
    }
    Ok(body)
}

fn eval_pmap(
    eqn: &Equation,
    inputs: &[Value],
    observer: &mut EquationObserver<'_>,
) -> Result<Vec<Value>, InterpreterError> {
    let body = nested_body(eqn, 0)?;
    let axis_size = eqn.axis_size().ok_or_else(|| InterpreterError::InvalidParam {
        primitive: eqn.primitive,
        detail: "axis_size must be a non-negative integer".to_owned(),
    })?;

    let mut tensors = Vec::with_capacity(inputs.len());
    for input in inputs {
        match input {
            Value::Tensor(tensor)
                if tensor
                    .leading_dim()
                    .is_some_and(|dim| usize::try_from(dim).is_ok_and(|dim| dim == axis_size)) =>
            {
                tensors.push(tensor);
            }
            _ => {
                return Err(InterpreterError::InvalidParam {
                    primitive: eqn.primitive,
                    detail: format!("every operand must have leading axis {axis_size}"),
                });
            }
        }
    }

    let mut per_replica: Vec<Vec<Value>> = Vec::with_capacity(axis_size);
    for replica in 0..axis_size {
        let slices = tensors
            .iter()
            .map(|tensor| tensor.slice_axis0(replica))
            .collect::<Result<Vec<_>, _>>()?;
        per_replica.push(eval_jaxpr_with_observer(body, &[], &slices, observer)?);
    }

    let n_outputs = body.outvars.len();
    (0..n_outputs)
        .map(|out_idx| {
            let column = per_replica
                .iter()
                .map(|outs| outs[out_idx].clone())
                .collect::<Vec<_>>();
            Ok(Value::Tensor(TensorValue::stack_axis0(&column)?))
        })
        .collect()
}
