//! Bottom-up traversal of programs and their nested sub-programs.

use crate::{Equation, Jaxpr};

/// Folds a program into a summary. Nested programs are summarized first and
/// handed to `visit_equation`; per-equation results are then merged by
/// `combine`.
pub trait JaxprVisitor {
    type Output;

    fn visit_equation(&mut self, eqn: &Equation, nested: Vec<Self::Output>) -> Self::Output;

    fn combine(&mut self, per_equation: Vec<Self::Output>) -> Self::Output;
}

pub fn walk_jaxpr<V: JaxprVisitor>(visitor: &mut V, jaxpr: &Jaxpr) -> V::Output {
    let mut per_equation = Vec::with_capacity(jaxpr.equations.len());
    for eqn in &jaxpr.equations {
        let mut nested = Vec::with_capacity(eqn.sub_jaxprs.len());
        for sub in &eqn.sub_jaxprs {
            nested.push(walk_jaxpr(visitor, sub));
        }
        per_equation.push(visitor.visit_equation(eqn, nested));
    }
    visitor.combine(per_equation)
}

struct AnyEquation<F> {
    predicate: F,
}

impl<F: FnMut(&Equation) -> bool> JaxprVisitor for AnyEquation<F> {
    type Output = bool;

    fn visit_equation(&mut self, eqn: &Equation, nested: Vec<bool>) -> bool {
        (self.predicate)(eqn) || nested.into_iter().any(|hit| hit)
    }

    fn combine(&mut self, per_equation: Vec<bool>) -> bool {
        per_equation.into_iter().any(|hit| hit)
    }
}

/// True if any equation, at any nesting depth, satisfies `predicate`.
pub fn any_equation(jaxpr: &Jaxpr, predicate: impl FnMut(&Equation) -> bool) -> bool {
    walk_jaxpr(&mut AnyEquation { predicate }, jaxpr)
}
