//! Loop analysis.
//!
//! For every counted loop the analyzer works out, before any lowering
//! happens: whether the range is a compile-time constant and how many
//! iterations it covers, whether the body contains `break`/`continue`,
//! which expressions in the body are loop-invariant, and which multiplies
//! are strength-reduction candidates. The analysis is pure: it borrows the
//! typed tree and writes nothing back, so running it twice over the same
//! loop yields the same plan.

use crate::ast::{BinOp, ExprKind, UnOp};
use crate::fx::FxHashSet;
use crate::typed_ast::{typed_exprs_equal, TypedExpr, TypedStmt, TypedStmtKind};
use crate::value::Value;

/// Upper bound on the iteration count of a loop considered unrollable.
pub const MAX_CONSTANT_ITERATIONS: i64 = 64;

/// Upper bound on the iteration count the unroller will actually expand.
pub const MAX_UNROLL_FACTOR: i64 = 16;

/// A loop-invariant expression found in a loop body.
#[derive(Debug)]
pub struct InvariantExpr<'p, 'a> {
    /// The representative occurrence in the body.
    pub expr: &'p TypedExpr<'a>,
    /// Number of structural occurrences in the body.
    pub use_count: u32,
    /// Whether hoisting is legal for this expression.
    pub can_hoist: bool,
}

/// A `induction_var * constant-power-of-two` multiply in a loop body.
#[derive(Debug)]
pub struct StrengthReduction<'p, 'a> {
    /// The multiply node.
    pub expr: &'p TypedExpr<'a>,
    /// The constant factor.
    pub multiplier: i64,
    /// `log2(multiplier)`.
    pub shift_amount: u32,
    /// Whether the rewrite is legal for this node.
    pub can_optimize: bool,
}

/// Everything the optimizer needs to know about one counted loop.
#[derive(Debug)]
pub struct LoopAnalysis<'p, 'a> {
    /// Constant start bound, when known.
    pub start: Option<i64>,
    /// Constant end bound, when known.
    pub end: Option<i64>,
    /// Constant step, when known (`Some(1)` for an absent step).
    pub step: Option<i64>,
    /// Iteration count for a constant range; zero for empty or unknown
    /// ranges.
    pub iteration_count: i64,
    /// All three bounds are compile-time constants.
    pub is_constant_range: bool,
    /// Unrolling is legal (small constant count, no break/continue).
    pub can_unroll: bool,
    /// At least one strength-reduction candidate exists.
    pub can_strength_reduce: bool,
    /// At least one invariant candidate exists.
    pub can_apply_licm: bool,
    /// Bounds checks on induction-variable indexing may be elided.
    pub can_eliminate_bounds: bool,
    /// The body breaks or continues this loop.
    pub has_break_continue: bool,
    /// Deduplicated loop-invariant candidates.
    pub invariants: Vec<InvariantExpr<'p, 'a>>,
    /// Strength-reduction candidates.
    pub reductions: Vec<StrengthReduction<'p, 'a>>,
}

/// Analyze one `for var in start..end [step]: body` loop.
pub fn analyze_for_range<'p, 'a>(
    var: &str,
    start: &'p TypedExpr<'a>,
    end: &'p TypedExpr<'a>,
    step: Option<&'p TypedExpr<'a>>,
    body: &'p [TypedStmt<'a>],
) -> LoopAnalysis<'p, 'a> {
    let has_break_continue = body_has_break_continue(body);

    let start_c = const_int_value(start);
    let end_c = const_int_value(end);
    let step_c = match step {
        Some(s) => const_int_value(s),
        None => Some(1),
    };

    let (is_constant_range, iteration_count) = match (start_c, end_c, step_c) {
        (Some(s), Some(e), Some(st)) => (true, iteration_count(s, e, st)),
        _ => (false, 0),
    };

    let can_unroll = iteration_count > 0
        && iteration_count <= MAX_CONSTANT_ITERATIONS
        && !has_break_continue;

    let mut mutated = FxHashSet::default();
    collect_assigned_names(body, &mut mutated);

    let invariants = find_invariants(var, &mutated, body);
    let reductions = find_reductions(var, body);

    let analysis = LoopAnalysis {
        start: start_c,
        end: end_c,
        step: step_c,
        iteration_count,
        is_constant_range,
        can_unroll,
        can_strength_reduce: !reductions.is_empty(),
        can_apply_licm: !invariants.is_empty(),
        can_eliminate_bounds: is_constant_range,
        has_break_continue,
        invariants,
        reductions,
    };
    log::debug!(
        "loop over `{}`: const_range={} count={} unroll={} licm={} sr={} break/continue={}",
        var,
        analysis.is_constant_range,
        analysis.iteration_count,
        analysis.can_unroll,
        analysis.invariants.len(),
        analysis.reductions.len(),
        analysis.has_break_continue
    );
    analysis
}

/// Iteration count of a half-open constant range.
fn iteration_count(start: i64, end: i64, step: i64) -> i64 {
    if step > 0 && end > start {
        (end - start + step - 1) / step
    } else if step < 0 && end < start {
        let step = -step;
        (start - end + step - 1) / step
    } else {
        0
    }
}

/// Evaluate an expression to a constant integer, if it is built from
/// integer literals and arithmetic over them.
pub fn const_int_value(e: &TypedExpr) -> Option<i64> {
    match &e.kind {
        crate::typed_ast::TypedExprKind::Literal(v) => v.as_int(),
        crate::typed_ast::TypedExprKind::Unary { op, operand } => {
            let v = const_int_value(operand)?;
            match op {
                UnOp::Neg => v.checked_neg(),
                UnOp::Plus => Some(v),
                UnOp::Not => None,
            }
        }
        crate::typed_ast::TypedExprKind::Binary { op, lhs, rhs } => {
            let l = const_int_value(lhs)?;
            let r = const_int_value(rhs)?;
            match op {
                BinOp::Add => l.checked_add(r),
                BinOp::Sub => l.checked_sub(r),
                BinOp::Mul => l.checked_mul(r),
                BinOp::Div if r != 0 => l.checked_div(r),
                BinOp::Rem if r != 0 => l.checked_rem(r),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Does the body contain a `break` or `continue` belonging to this loop?
/// Nested loops capture their own, so the scan does not descend into them.
fn body_has_break_continue(body: &[TypedStmt]) -> bool {
    body.iter().any(|s| match &s.kind {
        TypedStmtKind::Break | TypedStmtKind::Continue => true,
        TypedStmtKind::If {
            then_body,
            else_body,
            ..
        } => {
            body_has_break_continue(then_body)
                || else_body
                    .as_ref()
                    .map_or(false, |b| body_has_break_continue(b))
        }
        TypedStmtKind::Block(inner) => body_has_break_continue(inner),
        // While/ForRange/ForIter own any break/continue inside them;
        // functions cannot break across their boundary.
        _ => false,
    })
}

/// Collect every name assigned or re-declared anywhere in the body,
/// including inside nested loops and blocks.
fn collect_assigned_names<'a>(body: &[TypedStmt<'a>], out: &mut FxHashSet<&'a str>) {
    for s in body {
        match &s.kind {
            TypedStmtKind::Assign { name, .. } => {
                out.insert(name);
            }
            TypedStmtKind::VarDecl { name, .. } => {
                // A shadowing declaration makes the name unreliable for
                // invariance within this body.
                out.insert(name);
            }
            TypedStmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                collect_assigned_names(then_body, out);
                if let Some(else_body) = else_body {
                    collect_assigned_names(else_body, out);
                }
            }
            TypedStmtKind::While { body, .. } => collect_assigned_names(body, out),
            TypedStmtKind::ForRange { var, body, .. }
            | TypedStmtKind::ForIter { var, body, .. } => {
                out.insert(var);
                collect_assigned_names(body, out);
            }
            TypedStmtKind::Block(inner) => collect_assigned_names(inner, out),
            _ => {}
        }
    }
}

/// Is `e` invariant across iterations of the loop over `var`?
fn is_invariant(e: &TypedExpr, var: &str, mutated: &FxHashSet<&str>) -> bool {
    is_invariant_src(e.source, var, mutated)
}

fn is_invariant_src(e: &crate::ast::Expr, var: &str, mutated: &FxHashSet<&str>) -> bool {
    match &e.kind {
        ExprKind::Literal(_) => true,
        ExprKind::Ident(name) => name != var && !mutated.contains(name.as_str()),
        ExprKind::Unary { operand, .. } => is_invariant_src(operand, var, mutated),
        ExprKind::Binary { lhs, rhs, .. } => {
            is_invariant_src(lhs, var, mutated) && is_invariant_src(rhs, var, mutated)
        }
        ExprKind::Cast { operand, .. } => is_invariant_src(operand, var, mutated),
        ExprKind::Ternary {
            cond,
            then_val,
            else_val,
        } => {
            is_invariant_src(cond, var, mutated)
                && is_invariant_src(then_val, var, mutated)
                && is_invariant_src(else_val, var, mutated)
        }
        // Calls are conservatively impure; array construction and indexing
        // observe state the analysis doesn't track.
        ExprKind::Call { .. } | ExprKind::ArrayLit(_) | ExprKind::Index { .. } => false,
    }
}

/// Is this expression worth hoisting at all? Bare leaves already live in a
/// register or the constant pool.
fn is_compound(e: &TypedExpr) -> bool {
    matches!(
        e.kind,
        crate::typed_ast::TypedExprKind::Binary { .. }
            | crate::typed_ast::TypedExprKind::Unary { .. }
            | crate::typed_ast::TypedExprKind::Cast { .. }
            | crate::typed_ast::TypedExprKind::Ternary { .. }
    )
}

fn find_invariants<'p, 'a>(
    var: &str,
    mutated: &FxHashSet<&str>,
    body: &'p [TypedStmt<'a>],
) -> Vec<InvariantExpr<'p, 'a>> {
    let mut candidates: Vec<&'p TypedExpr<'a>> = Vec::new();

    // Explicit work list; loop bodies can be deep.
    let mut stack: Vec<&'p TypedExpr<'a>> = Vec::new();
    collect_stmt_exprs(body, &mut stack);
    while let Some(e) = stack.pop() {
        if is_invariant(e, var, mutated) && is_compound(e) {
            if !candidates.iter().any(|c| typed_exprs_equal(c, e)) {
                candidates.push(e);
            }
            // A matched subtree is hoisted whole; its pieces don't count.
            continue;
        }
        push_children(e, &mut stack);
    }

    candidates
        .into_iter()
        .map(|expr| {
            let mut count = 0;
            count_occurrences(body, expr, &mut count);
            InvariantExpr {
                expr,
                use_count: count,
                can_hoist: true,
            }
        })
        .collect()
}

/// Push the root expressions of every statement onto the work list. The
/// scan covers nested control flow: an expression invariant with respect to
/// the outer loop may be hoisted out of it no matter how deep it sits.
fn collect_stmt_exprs<'p, 'a>(body: &'p [TypedStmt<'a>], out: &mut Vec<&'p TypedExpr<'a>>) {
    for s in body {
        match &s.kind {
            TypedStmtKind::VarDecl { init, .. } => {
                if let Some(e) = init {
                    out.push(e);
                }
            }
            TypedStmtKind::Assign { value, .. } => out.push(value),
            TypedStmtKind::Print { args, .. } => out.extend(args.iter()),
            TypedStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                out.push(cond);
                collect_stmt_exprs(then_body, out);
                if let Some(else_body) = else_body {
                    collect_stmt_exprs(else_body, out);
                }
            }
            TypedStmtKind::While { cond, body } => {
                out.push(cond);
                collect_stmt_exprs(body, out);
            }
            TypedStmtKind::ForRange {
                start,
                end,
                step,
                body,
                ..
            } => {
                out.push(start);
                out.push(end);
                if let Some(step) = step {
                    out.push(step);
                }
                collect_stmt_exprs(body, out);
            }
            TypedStmtKind::ForIter { iterable, body, .. } => {
                out.push(iterable);
                collect_stmt_exprs(body, out);
            }
            TypedStmtKind::Return(Some(e)) => out.push(e),
            TypedStmtKind::Expr(e) => out.push(e),
            TypedStmtKind::Block(inner) => collect_stmt_exprs(inner, out),
            TypedStmtKind::Break
            | TypedStmtKind::Continue
            | TypedStmtKind::Return(None)
            | TypedStmtKind::Function(_) => {}
        }
    }
}

fn push_children<'p, 'a>(e: &'p TypedExpr<'a>, stack: &mut Vec<&'p TypedExpr<'a>>) {
    use crate::typed_ast::TypedExprKind::*;
    match &e.kind {
        Literal(_) | Ident(_) => {}
        Binary { lhs, rhs, .. } => {
            stack.push(lhs);
            stack.push(rhs);
        }
        Unary { operand, .. } => stack.push(operand),
        Ternary {
            cond,
            then_val,
            else_val,
        } => {
            stack.push(cond);
            stack.push(then_val);
            stack.push(else_val);
        }
        Cast { operand, .. } => stack.push(operand),
        Call { callee, args } => {
            stack.push(callee);
            stack.extend(args.iter());
        }
        ArrayLit(elems) => stack.extend(elems.iter()),
        Index { base, index } => {
            stack.push(base);
            stack.push(index);
        }
    }
}

/// Count structural occurrences of `needle` in the body. A match terminates
/// recursion into that subtree.
fn count_occurrences(body: &[TypedStmt], needle: &TypedExpr, count: &mut u32) {
    let mut roots = Vec::new();
    collect_stmt_exprs(body, &mut roots);
    let mut stack = roots;
    while let Some(e) = stack.pop() {
        if typed_exprs_equal(e, needle) {
            *count += 1;
            continue;
        }
        push_children(e, &mut stack);
    }
}

fn find_reductions<'p, 'a>(var: &str, body: &'p [TypedStmt<'a>]) -> Vec<StrengthReduction<'p, 'a>> {
    let mut out: Vec<StrengthReduction<'p, 'a>> = Vec::new();
    let mut stack = Vec::new();
    collect_stmt_exprs(body, &mut stack);
    while let Some(e) = stack.pop() {
        if let crate::typed_ast::TypedExprKind::Binary { op, lhs, rhs } = &e.kind {
            if *op == BinOp::Mul {
                if let Some(m) = reduction_multiplier(var, lhs, rhs) {
                    if !out.iter().any(|r| typed_exprs_equal(r.expr, e)) {
                        out.push(StrengthReduction {
                            expr: e,
                            multiplier: m,
                            shift_amount: m.trailing_zeros(),
                            can_optimize: true,
                        });
                    }
                }
            }
        }
        push_children(e, &mut stack);
    }
    out
}

/// If one operand is the induction variable and the other a positive
/// power-of-two integer constant, return the constant.
fn reduction_multiplier(var: &str, lhs: &TypedExpr, rhs: &TypedExpr) -> Option<i64> {
    let is_var = |e: &TypedExpr| matches!(&e.kind, crate::typed_ast::TypedExprKind::Ident(n) if *n == var);
    let pow2 = |e: &TypedExpr| match &e.kind {
        crate::typed_ast::TypedExprKind::Literal(Value::I32(v)) if *v > 0 => {
            let v = i64::from(*v);
            if v.count_ones() == 1 {
                Some(v)
            } else {
                None
            }
        }
        crate::typed_ast::TypedExprKind::Literal(Value::I64(v)) if *v > 0 => {
            if v.count_ones() == 1 {
                Some(*v)
            } else {
                None
            }
        }
        _ => None,
    };
    if is_var(lhs) {
        pow2(rhs)
    } else if is_var(rhs) {
        pow2(lhs)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Builder};
    use crate::diagnostic::Diagnostics;
    use crate::infer::infer_program;
    use crate::typed_ast::TypedProgram;
    use crate::types::TypeArena;

    fn typed(program: &crate::ast::Program) -> (TypeArena, TypedProgram) {
        let mut arena = TypeArena::new();
        let mut diags = Diagnostics::new();
        let t = infer_program(&mut arena, program, &mut diags).expect("inference failed");
        (arena, t)
    }

    fn analyze<'p, 'a>(stmt: &'p crate::typed_ast::TypedStmt<'a>) -> LoopAnalysis<'p, 'a> {
        match &stmt.kind {
            TypedStmtKind::ForRange {
                var,
                start,
                end,
                step,
                body,
                ..
            } => analyze_for_range(var, start, end, step.as_ref(), body),
            _ => panic!("expected for-range"),
        }
    }

    #[test]
    fn constant_range_counts() {
        assert_eq!(iteration_count(0, 4, 1), 4);
        assert_eq!(iteration_count(0, 10, 3), 4);
        assert_eq!(iteration_count(10, 0, -1), 10);
        assert_eq!(iteration_count(10, 0, -3), 4);
        assert_eq!(iteration_count(4, 4, 1), 0);
        assert_eq!(iteration_count(4, 0, 1), 0);
        assert_eq!(iteration_count(0, 4, 0), 0);
    }

    #[test]
    fn simple_constant_loop_unrolls() {
        let mut b = Builder::new();
        let start = b.int(0);
        let end = b.int(4);
        let i = b.ident("i");
        let two = b.int(2);
        let prod = b.binary(BinOp::Mul, i, two);
        let body = vec![b.print(vec![prod])];
        let lp = b.for_range("i", start, end, body);
        let program = b.program(vec![lp]);
        let (_arena, t) = typed(&program);
        let analysis = analyze(&t.stmts[0]);
        assert!(analysis.is_constant_range);
        assert_eq!(analysis.iteration_count, 4);
        assert!(analysis.can_unroll);
        // `i * 2` is not a power-of-two-times-induction-var? It is: 2 == 2^1.
        assert!(analysis.can_strength_reduce);
        assert_eq!(analysis.reductions[0].multiplier, 2);
        assert_eq!(analysis.reductions[0].shift_amount, 1);
    }

    #[test]
    fn break_disables_unrolling() {
        let mut b = Builder::new();
        let start = b.int(0);
        let end = b.int(4);
        let brk = b.stmt(crate::ast::StmtKind::Break);
        let lp = b.for_range("i", start, end, vec![brk]);
        let program = b.program(vec![lp]);
        let (_arena, t) = typed(&program);
        let analysis = analyze(&t.stmts[0]);
        assert!(analysis.has_break_continue);
        assert!(!analysis.can_unroll);
    }

    #[test]
    fn nested_loop_break_does_not_leak_out() {
        let mut b = Builder::new();
        let brk = b.stmt(crate::ast::StmtKind::Break);
        let js = b.int(0);
        let je = b.int(3);
        let inner = b.for_range("j", js, je, vec![brk]);
        let is_ = b.int(0);
        let ie = b.int(4);
        let outer = b.for_range("i", is_, ie, vec![inner]);
        let program = b.program(vec![outer]);
        let (_arena, t) = typed(&program);
        let analysis = analyze(&t.stmts[0]);
        assert!(!analysis.has_break_continue);
        assert!(analysis.can_unroll);
    }

    #[test]
    fn invariant_discovery_and_use_count() {
        // let k = 10; mut s = 0; for i in 0..100: s = s + (k * k + 7)
        let mut b = Builder::new();
        let k_init = b.int(10);
        let k = b.let_("k", k_init);
        let s_init = b.int(0);
        let s = b.mut_("s", s_init);
        let start = b.int(0);
        let end = b.int(100);
        let k1 = b.ident("k");
        let k2 = b.ident("k");
        let kk = b.binary(BinOp::Mul, k1, k2);
        let seven = b.int(7);
        let inv = b.binary(BinOp::Add, kk, seven);
        let s_ref = b.ident("s");
        let sum = b.binary(BinOp::Add, s_ref, inv);
        let assign = b.assign("s", sum);
        let lp = b.for_range("i", start, end, vec![assign]);
        let program = b.program(vec![k, s, lp]);
        let (_arena, t) = typed(&program);
        let analysis = analyze(&t.stmts[2]);
        assert!(analysis.can_apply_licm);
        assert_eq!(analysis.invariants.len(), 1);
        assert_eq!(analysis.invariants[0].use_count, 1);
        // `s + (...)` is not invariant: `s` is assigned in the body.
        // `k * k + 7` is the maximal invariant subtree.
    }

    #[test]
    fn loop_var_uses_are_not_invariant() {
        let mut b = Builder::new();
        let start = b.int(0);
        let end = b.int(8);
        let i1 = b.ident("i");
        let one = b.int(1);
        let e = b.binary(BinOp::Add, i1, one);
        let body = vec![b.print(vec![e])];
        let lp = b.for_range("i", start, end, body);
        let program = b.program(vec![lp]);
        let (_arena, t) = typed(&program);
        let analysis = analyze(&t.stmts[0]);
        assert!(analysis.invariants.is_empty());
        assert!(!analysis.can_apply_licm);
    }

    #[test]
    fn non_power_of_two_is_not_reduced() {
        let mut b = Builder::new();
        let start = b.int(0);
        let end = b.int(8);
        let i = b.ident("i");
        let three = b.int(3);
        let prod = b.binary(BinOp::Mul, i, three);
        let body = vec![b.print(vec![prod])];
        let lp = b.for_range("i", start, end, body);
        let program = b.program(vec![lp]);
        let (_arena, t) = typed(&program);
        let analysis = analyze(&t.stmts[0]);
        assert!(analysis.reductions.is_empty());
    }
}
