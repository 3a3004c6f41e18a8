use std::collections::BTreeMap;
use tj_core::{AbstractValue, Atom, Equation, Jaxpr, Primitive, Shape, ShapedArray, VarId};
use tj_lax::abstract_eval;

use crate::InterpreterError;

/// Infers the output types of `jaxpr` from the types of its constants and
/// inputs without touching any data.
pub fn abstract_eval_jaxpr(
    jaxpr: &Jaxpr,
    const_avals: &[AbstractValue],
    in_avals: &[AbstractValue],
) -> Result<Vec<AbstractValue>, InterpreterError> {
    if in_avals.len() != jaxpr.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: jaxpr.invars.len(),
            actual: in_avals.len(),
        });
    }
    if const_avals.len() != jaxpr.constvars.len() {
        return Err(InterpreterError::ConstArity {
            expected: jaxpr.constvars.len(),
            actual: const_avals.len(),
        });
    }

    let mut env: BTreeMap<VarId, AbstractValue> = BTreeMap::new();
    env.extend(jaxpr.constvars.iter().copied().zip(const_avals.iter().cloned()));
    env.extend(jaxpr.invars.iter().copied().zip(in_avals.iter().cloned()));

    for eqn in &jaxpr.equations {
        let inputs = eqn
            .inputs
            .iter()
            .map(|atom| read_aval(&env, atom))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = abstract_eval_equation(eqn, &inputs)?;
        if outputs.len() != eqn.outputs.len() {
            return Err(InterpreterError::UnexpectedOutputArity {
                primitive: eqn.primitive,
                expected: eqn.outputs.len(),
                actual: outputs.len(),
            });
        }
        env.extend(eqn.outputs.iter().copied().zip(outputs));
    }

    jaxpr
        .outvars
        .iter()
        .map(|atom| read_aval(&env, atom))
        .collect()
}

fn read_aval(
    env: &BTreeMap<VarId, AbstractValue>,
    atom: &Atom,
) -> Result<AbstractValue, InterpreterError> {
    match atom {
        Atom::Var(var) => env
            .get(var)
            .cloned()
            .ok_or(InterpreterError::MissingVariable(*var)),
        Atom::Lit(lit) => Ok(AbstractValue::scalar(lit.dtype())),
    }
}

fn abstract_eval_equation(
    eqn: &Equation,
    inputs: &[AbstractValue],
) -> Result<Vec<AbstractValue>, InterpreterError> {
    let invalid = |detail: &str| InterpreterError::InvalidParam {
        primitive: eqn.primitive,
        detail: detail.to_owned(),
    };
    match eqn.primitive {
        Primitive::XlaCall => {
            let body = eqn.sub_jaxprs.first().ok_or_else(|| invalid("missing call body"))?;
            abstract_eval_jaxpr(body, &[], inputs)
        }
        Primitive::XlaPmap => {
            let body = eqn.sub_jaxprs.first().ok_or_else(|| invalid("missing call body"))?;
            let axis_size = eqn
                .axis_size()
                .and_then(|size| u32::try_from(size).ok())
                .ok_or_else(|| invalid("axis_size must be a non-negative 32-bit integer"))?;
            let inner = inputs
                .iter()
                .map(|aval| match aval {
                    AbstractValue::Shaped(shaped)
                        if shaped.shape.dims.first() == Some(&axis_size) =>
                    {
                        Ok(AbstractValue::Shaped(ShapedArray::new(
                            shaped.dtype,
                            Shape {
                                dims: shaped.shape.dims[1..].to_vec(),
                            },
                        )))
                    }
                    _ => Err(invalid("every operand must carry the mapped leading axis")),
                })
                .collect::<Result<Vec<_>, _>>()?;
            abstract_eval_jaxpr(body, &[], &inner)?
                .into_iter()
                .map(|aval| match aval {
                    AbstractValue::Shaped(shaped) => {
                        let mut dims = Vec::with_capacity(shaped.shape.rank() + 1);
                        dims.push(axis_size);
                        dims.extend_from_slice(&shaped.shape.dims);
                        Ok(AbstractValue::Shaped(ShapedArray::new(shaped.dtype, Shape { dims })))
                    }
                    AbstractValue::Unit | AbstractValue::Token => {
                        Err(invalid("mapped outputs must be arrays"))
                    }
                })
                .collect()
        }
        Primitive::Cond => {
            let (_, operands) = inputs
                .split_first()
                .ok_or_else(|| invalid("missing branch index operand"))?;
            let mut branch_types = eqn
                .sub_jaxprs
                .iter()
                .map(|branch| abstract_eval_jaxpr(branch, &[], operands));
            let first = branch_types
                .next()
                .ok_or_else(|| invalid("cond needs at least one branch"))??;
            for other in branch_types {
                if other? != first {
                    return Err(invalid("branches disagree on output types"));
                }
            }
            Ok(first)
        }
        Primitive::Outfeed => match inputs.first() {
            Some(AbstractValue::Token) => Ok(vec![AbstractValue::Token]),
            _ => Err(invalid("first operand must be a token")),
        },
        primitive => Ok(vec![abstract_eval(primitive, inputs)?]),
    }
}
