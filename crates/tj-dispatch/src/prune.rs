//! Program reduction and whole-program queries.

use std::collections::BTreeSet;

use tj_core::visit::{JaxprVisitor, any_equation, walk_jaxpr};
use tj_core::{Atom, Equation, Jaxpr, Literal, Primitive, VarId};

/// A program with unreferenced constants and inputs removed, plus the
/// original positions of what was kept.
#[derive(Debug, Clone, PartialEq)]
pub struct PrunedProgram {
    pub jaxpr: Jaxpr,
    pub kept_const_idx: BTreeSet<usize>,
    pub kept_var_idx: BTreeSet<usize>,
}

/// Drops constvars and invars that no top-level equation or output reads.
///
/// Only the top level is inspected: a variable is used if an equation lists
/// it as an operand, which covers everything a nested program receives.
#[must_use]
pub fn prune_unused_inputs(jaxpr: &Jaxpr) -> PrunedProgram {
    let used: BTreeSet<VarId> = jaxpr
        .equations
        .iter()
        .flat_map(|eqn| eqn.inputs.iter())
        .chain(jaxpr.outvars.iter())
        .filter_map(Atom::as_var)
        .collect();

    let kept_const_idx: BTreeSet<usize> = jaxpr
        .constvars
        .iter()
        .enumerate()
        .filter(|(_, var)| used.contains(var))
        .map(|(index, _)| index)
        .collect();
    let kept_var_idx: BTreeSet<usize> = jaxpr
        .invars
        .iter()
        .enumerate()
        .filter(|(_, var)| used.contains(var))
        .map(|(index, _)| index)
        .collect();

    let pruned = Jaxpr::new(
        keep(&jaxpr.invars, &kept_var_idx),
        keep(&jaxpr.constvars, &kept_const_idx),
        jaxpr.outvars.clone(),
        jaxpr.equations.clone(),
    );
    PrunedProgram {
        jaxpr: pruned,
        kept_const_idx,
        kept_var_idx,
    }
}

/// Elements of `items` at the positions in `kept`, in order.
pub(crate) fn keep<T: Clone>(items: &[T], kept: &BTreeSet<usize>) -> Vec<T> {
    items
        .iter()
        .enumerate()
        .filter(|(index, _)| kept.contains(index))
        .map(|(_, item)| item.clone())
        .collect()
}

/// A program with no equations forwards inputs, constants or literals
/// straight to its outputs.
#[must_use]
pub fn is_trivial(jaxpr: &Jaxpr) -> bool {
    jaxpr.equations.is_empty()
}

struct ReplicaCount;

impl JaxprVisitor for ReplicaCount {
    type Output = usize;

    fn visit_equation(&mut self, eqn: &Equation, nested: Vec<usize>) -> usize {
        let inner = nested.into_iter().max().unwrap_or(1);
        if eqn.primitive.introduces_replicas() {
            eqn.axis_size().unwrap_or(1).max(1).saturating_mul(inner)
        } else {
            inner
        }
    }

    fn combine(&mut self, per_equation: Vec<usize>) -> usize {
        per_equation.into_iter().max().unwrap_or(1)
    }
}

/// Number of replicas `jaxpr` needs: each replica-introducing equation
/// multiplies its axis size into the count of its body, and sibling
/// equations take the maximum. An empty program needs one. Counts that do
/// not fit in a `usize` saturate, so device checks still reject them.
#[must_use]
pub fn jaxpr_replicas(jaxpr: &Jaxpr) -> usize {
    walk_jaxpr(&mut ReplicaCount, jaxpr)
}

#[must_use]
pub fn jaxpr_has_pmap(jaxpr: &Jaxpr) -> bool {
    any_equation(jaxpr, |eqn| eqn.primitive.introduces_replicas())
}

#[must_use]
pub fn jaxpr_uses_outfeed(jaxpr: &Jaxpr) -> bool {
    any_equation(jaxpr, |eqn| eqn.primitive == Primitive::Outfeed)
}

struct CollectLiterals;

impl JaxprVisitor for CollectLiterals {
    type Output = Vec<Literal>;

    fn visit_equation(&mut self, eqn: &Equation, nested: Vec<Vec<Literal>>) -> Vec<Literal> {
        let mut out: Vec<Literal> = eqn
            .inputs
            .iter()
            .filter_map(|atom| match atom {
                Atom::Lit(lit) => Some(*lit),
                Atom::Var(_) => None,
            })
            .collect();
        out.extend(nested.into_iter().flatten());
        out
    }

    fn combine(&mut self, per_equation: Vec<Vec<Literal>>) -> Vec<Literal> {
        per_equation.into_iter().flatten().collect()
    }
}

/// Every literal operand of every equation, nested programs included, in
/// program order.
#[must_use]
pub fn jaxpr_literals(jaxpr: &Jaxpr) -> Vec<Literal> {
    walk_jaxpr(&mut CollectLiterals, jaxpr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tj_core::{ProgramSpec, build_program};

    fn pmap_eqn(axis_size: usize, body: Option<Jaxpr>) -> Equation {
        let eqn = Equation::new(Primitive::XlaPmap, &[Atom::Var(VarId(1))], &[VarId(2)])
            .with_param("axis_size", axis_size);
        match body {
            Some(body) => eqn.with_sub_jaxpr(body),
            None => eqn,
        }
    }

    fn wrap(eqn: Equation) -> Jaxpr {
        Jaxpr::new(vec![VarId(1)], vec![], vec![Atom::Var(VarId(2))], vec![eqn])
    }

    #[test]
    fn unused_inputs_and_constants_are_dropped() {
        let jaxpr = Jaxpr::new(
            vec![VarId(1), VarId(2), VarId(3)],
            vec![VarId(10), VarId(11)],
            vec![Atom::Var(VarId(4))],
            vec![Equation::new(
                Primitive::Add,
                &[Atom::Var(VarId(3)), Atom::Var(VarId(11))],
                &[VarId(4)],
            )],
        );
        let pruned = prune_unused_inputs(&jaxpr);
        assert_eq!(pruned.kept_var_idx, BTreeSet::from([2]));
        assert_eq!(pruned.kept_const_idx, BTreeSet::from([1]));
        assert_eq!(pruned.jaxpr.invars, vec![VarId(3)]);
        assert_eq!(pruned.jaxpr.constvars, vec![VarId(11)]);
        assert_eq!(pruned.jaxpr.equations, jaxpr.equations);
    }

    #[test]
    fn inputs_forwarded_to_outputs_are_kept() {
        let pruned = prune_unused_inputs(&build_program(ProgramSpec::Identity));
        assert_eq!(pruned.kept_var_idx, BTreeSet::from([0]));
        assert!(is_trivial(&pruned.jaxpr));
    }

    #[test]
    fn ignored_argument_is_pruned() {
        let pruned = prune_unused_inputs(&build_program(ProgramSpec::IgnoreSecond));
        assert_eq!(pruned.kept_var_idx, BTreeSet::from([0]));
        assert!(!is_trivial(&pruned.jaxpr));
    }

    #[test]
    fn empty_program_needs_one_replica() {
        let empty = Jaxpr::new(vec![], vec![], vec![], vec![]);
        assert_eq!(jaxpr_replicas(&empty), 1);
        assert_eq!(jaxpr_replicas(&build_program(ProgramSpec::Add2)), 1);
    }

    #[test]
    fn axis_size_sets_replica_count() {
        assert_eq!(jaxpr_replicas(&wrap(pmap_eqn(4, None))), 4);
    }

    #[test]
    fn nested_replicas_multiply() {
        let inner = wrap(pmap_eqn(3, Some(build_program(ProgramSpec::Square))));
        let outer = wrap(pmap_eqn(2, Some(inner)));
        assert_eq!(jaxpr_replicas(&outer), 6);
        assert!(jaxpr_has_pmap(&outer));
    }

    #[test]
    fn oversized_nested_replicas_saturate() {
        let huge = 1_usize << 33;
        let inner = wrap(pmap_eqn(huge, Some(build_program(ProgramSpec::Square))));
        let outer = wrap(pmap_eqn(huge, Some(inner)));
        assert_eq!(jaxpr_replicas(&outer), usize::MAX);
    }

    #[test]
    fn sibling_equations_take_the_maximum() {
        let jaxpr = Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![Atom::Var(VarId(3))],
            vec![
                pmap_eqn(2, Some(build_program(ProgramSpec::Square))),
                Equation::new(Primitive::XlaPmap, &[Atom::Var(VarId(2))], &[VarId(3)])
                    .with_param("axis_size", 5)
                    .with_sub_jaxpr(build_program(ProgramSpec::Square)),
            ],
        );
        assert_eq!(jaxpr_replicas(&jaxpr), 5);
    }

    #[test]
    fn call_bodies_are_searched_for_pmap_and_outfeed() {
        let body = Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![Atom::Var(VarId(3))],
            vec![Equation::new(
                Primitive::Outfeed,
                &[Atom::Var(VarId(1)), Atom::Var(VarId(2))],
                &[VarId(3)],
            )],
        );
        let call = Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![Atom::Var(VarId(3))],
            vec![
                Equation::new(
                    Primitive::XlaCall,
                    &[Atom::Var(VarId(1)), Atom::Var(VarId(2))],
                    &[VarId(3)],
                )
                .with_sub_jaxpr(body),
            ],
        );
        assert!(jaxpr_uses_outfeed(&call));
        assert!(!jaxpr_has_pmap(&call));
        assert!(!jaxpr_uses_outfeed(&build_program(ProgramSpec::Add2)));
    }

    #[test]
    fn literals_are_collected_in_program_order() {
        let literals = jaxpr_literals(&build_program(ProgramSpec::SquarePlusLinear));
        assert_eq!(literals, vec![Literal::I64(2)]);
        let nested = wrap(pmap_eqn(2, Some(build_program(ProgramSpec::AddOne))));
        assert_eq!(jaxpr_literals(&nested), vec![Literal::I64(1)]);
    }
}
