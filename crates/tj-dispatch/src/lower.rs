//! Lowering of a pruned program into a backend build request.

use std::collections::{BTreeMap, BTreeSet};

use tj_core::{AbstractValue, Atom, Jaxpr, Value, VarId};
use tj_interpreters::InterpreterError;
use tj_runtime::{Computation, ComputationBuilder, NodeId};

use crate::error::DispatchError;

/// Everything needed to lower one program. Slices run parallel to the
/// program's constvars, invars and outvars.
#[derive(Debug, Clone, Copy)]
pub struct LoweringRequest<'a> {
    pub name: &'a str,
    pub jaxpr: &'a Jaxpr,
    pub consts: &'a [Value],
    pub in_avals: &'a [AbstractValue],
    pub out_avals: &'a [AbstractValue],
    pub donated: &'a [bool],
    /// Pass every argument inside one tuple parameter.
    pub tuple_args: bool,
    /// Whether the target platform can alias inputs to outputs.
    pub alias_donations: bool,
}

#[derive(Debug, Clone)]
pub struct Lowered {
    pub computation: Computation,
    /// Input positions whose donated buffer an output reuses.
    pub aliased_inputs: BTreeSet<usize>,
    /// Types of donated inputs no output could reuse.
    pub unused_donations: Vec<AbstractValue>,
}

/// Builds the computation for `request`.
///
/// Constants are embedded. Token inputs become fresh tokens and unit inputs
/// become unit constants, so only array inputs are parameters. Unit outputs
/// are dropped; the root is the single remaining output or a tuple of them.
pub fn lower_jaxpr(request: &LoweringRequest<'_>) -> Result<Lowered, DispatchError> {
    let jaxpr = request.jaxpr;
    if request.in_avals.len() != jaxpr.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: jaxpr.invars.len(),
            actual: request.in_avals.len(),
        }
        .into());
    }
    if request.consts.len() != jaxpr.constvars.len() {
        return Err(InterpreterError::ConstArity {
            expected: jaxpr.constvars.len(),
            actual: request.consts.len(),
        }
        .into());
    }

    let mut builder = ComputationBuilder::new(request.name);
    let mut env: BTreeMap<VarId, NodeId> = BTreeMap::new();
    for (var, value) in jaxpr.constvars.iter().zip(request.consts) {
        let node = builder.constant(value.clone());
        env.insert(*var, node);
    }

    let param_avals: Vec<AbstractValue> = request
        .in_avals
        .iter()
        .filter(|aval| matches!(aval, AbstractValue::Shaped(_)))
        .cloned()
        .collect();
    let param_nodes: Vec<NodeId> = if request.tuple_args {
        builder.tupled_parameters(param_avals)
    } else {
        param_avals
            .into_iter()
            .map(|aval| builder.parameter(aval))
            .collect()
    };
    let mut param_nodes = param_nodes.into_iter();

    let mut param_of_input: Vec<Option<usize>> = Vec::with_capacity(jaxpr.invars.len());
    let mut next_param = 0;
    for (var, aval) in jaxpr.invars.iter().zip(request.in_avals) {
        let node = match aval {
            AbstractValue::Token => {
                param_of_input.push(None);
                builder.create_token()
            }
            AbstractValue::Unit => {
                param_of_input.push(None);
                builder.constant(Value::Unit)
            }
            AbstractValue::Shaped(_) => {
                param_of_input.push(Some(next_param));
                next_param += 1;
                param_nodes
                    .next()
                    .ok_or(InterpreterError::MissingVariable(*var))?
            }
        };
        env.insert(*var, node);
    }

    for eqn in &jaxpr.equations {
        let operands = eqn
            .inputs
            .iter()
            .map(|atom| lower_atom(&mut builder, &env, atom))
            .collect::<Result<Vec<_>, _>>()?;
        let node = builder.op(eqn.clone(), operands);
        if eqn.primitive.multiple_results() {
            for (index, var) in eqn.outputs.iter().enumerate() {
                let element = builder.get_tuple_element(node, index);
                env.insert(*var, element);
            }
        } else if let Some(var) = eqn.outputs.first() {
            env.insert(*var, node);
        }
    }

    let mut out_nodes = Vec::with_capacity(jaxpr.outvars.len());
    let mut out_buffer_avals = Vec::with_capacity(jaxpr.outvars.len());
    for (atom, aval) in jaxpr.outvars.iter().zip(request.out_avals) {
        if matches!(aval, AbstractValue::Unit) {
            continue;
        }
        out_nodes.push(lower_atom(&mut builder, &env, atom)?);
        out_buffer_avals.push(aval);
    }
    let root = match out_nodes.as_slice() {
        [single] => *single,
        _ => builder.tuple(out_nodes),
    };

    let donated_inputs = request
        .donated
        .iter()
        .zip(request.in_avals)
        .enumerate()
        .filter(|(_, (donated, _))| **donated);
    let mut aliased_inputs = BTreeSet::new();
    let mut unused_donations = Vec::new();
    if request.alias_donations {
        // (input position, parameter index, type) in argument order.
        let mut available: Vec<(usize, usize, &AbstractValue)> = donated_inputs
            .filter_map(|(input, (_, aval))| {
                param_of_input[input].map(|param| (input, param, aval))
            })
            .collect();
        for (output_index, aval) in out_buffer_avals.iter().enumerate() {
            if let Some(position) = available.iter().position(|(_, _, donated)| donated == aval) {
                let (input, param, _) = available.remove(position);
                builder.setup_alias(output_index, param);
                aliased_inputs.insert(input);
            }
        }
        unused_donations.extend(available.into_iter().map(|(_, _, aval)| aval.clone()));
    } else {
        unused_donations.extend(donated_inputs.map(|(_, (_, aval))| aval.clone()));
    }

    if !unused_donations.is_empty() {
        let shapes: Vec<String> = unused_donations.iter().map(ToString::to_string).collect();
        tracing::warn!(
            computation = request.name,
            unused = ?shapes,
            "some donated buffers were not usable"
        );
    }

    Ok(Lowered {
        computation: builder.build(root)?,
        aliased_inputs,
        unused_donations,
    })
}

fn lower_atom(
    builder: &mut ComputationBuilder,
    env: &BTreeMap<VarId, NodeId>,
    atom: &Atom,
) -> Result<NodeId, DispatchError> {
    match atom {
        Atom::Var(var) => env
            .get(var)
            .copied()
            .ok_or_else(|| InterpreterError::MissingVariable(*var).into()),
        Atom::Lit(lit) => Ok(builder.constant(Value::Scalar(*lit))),
    }
}
