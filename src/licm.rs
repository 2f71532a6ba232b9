//! Loop-invariant code motion planning.
//!
//! The analyzer finds invariant candidates; this module decides which of
//! them are worth hoisting. Emission happens in the loop lowering code,
//! which computes each selected expression into a pinned register ahead of
//! the loop header and replaces structurally equal occurrences in the body
//! with that register.

use crate::ast::{BinOp, ExprKind};
use crate::loop_analysis::{InvariantExpr, LoopAnalysis};

/// Minimum number of body occurrences that makes a hoist profitable on its
/// own. Expensive expressions are hoisted regardless.
pub const MIN_HOIST_USES: u32 = 1;

/// Is the expression expensive enough to hoist even at low use counts?
/// Division, remainder, and calls qualify.
pub fn is_expensive(e: &crate::ast::Expr) -> bool {
    match &e.kind {
        ExprKind::Literal(_) | ExprKind::Ident(_) => false,
        ExprKind::Binary { op, lhs, rhs } => {
            matches!(op, BinOp::Div | BinOp::Rem) || is_expensive(lhs) || is_expensive(rhs)
        }
        ExprKind::Unary { operand, .. } => is_expensive(operand),
        ExprKind::Cast { operand, .. } => is_expensive(operand),
        ExprKind::Ternary {
            cond,
            then_val,
            else_val,
        } => is_expensive(cond) || is_expensive(then_val) || is_expensive(else_val),
        ExprKind::Call { .. } => true,
        ExprKind::ArrayLit(elems) => elems.iter().any(is_expensive),
        ExprKind::Index { base, index } => is_expensive(base) || is_expensive(index),
    }
}

/// Should this candidate be hoisted?
pub fn is_profitable(inv: &InvariantExpr) -> bool {
    inv.can_hoist && (inv.use_count >= MIN_HOIST_USES || is_expensive(inv.expr.source))
}

/// Indices into `analysis.invariants` of the candidates selected for
/// hoisting, in discovery order.
pub fn plan_hoists(analysis: &LoopAnalysis) -> Vec<usize> {
    analysis
        .invariants
        .iter()
        .enumerate()
        .filter(|(_, inv)| is_profitable(inv))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Builder;

    #[test]
    fn division_is_expensive() {
        let mut b = Builder::new();
        let x = b.ident("x");
        let y = b.ident("y");
        let div = b.binary(BinOp::Div, x, y);
        assert!(is_expensive(&div));

        let x = b.ident("x");
        let y = b.ident("y");
        let add = b.binary(BinOp::Add, x, y);
        assert!(!is_expensive(&add));
    }

    #[test]
    fn calls_are_expensive() {
        let mut b = Builder::new();
        let f = b.ident("f");
        let call = b.call(f, vec![]);
        assert!(is_expensive(&call));
    }
}
