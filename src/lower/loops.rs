//! Loop lowering.
//!
//! This is where the analyzer's plans become code. The order of
//! application for a counted loop:
//!
//! 1. hoist selected invariants into pinned registers ahead of the header
//!    (for unrolled loops this is the pre-unroll LICM pass);
//! 2. if the trip count is a small compile-time constant and the body has
//!    no `break`/`continue`, unroll: the body is re-lowered once per
//!    iteration with the loop variable rebound to that iteration's
//!    constant, and the loop disappears entirely;
//! 3. otherwise emit the conventional header/body/backedge shape, with
//!    strength reductions and bounds elision active while the body lowers.
//!
//! Optimizations that cannot secure their resources (for example a hoist
//! that would land in the spill tier) roll their allocations back and the
//! loop compiles unoptimized; nothing here is a user-visible error.

use crate::ast::Span;
use crate::bytecode::{Opcode, TypeTag};
use crate::licm;
use crate::loop_analysis::{analyze_for_range, LoopAnalysis, MAX_UNROLL_FACTOR};
use crate::regalloc::{Reg, RegTier};
use crate::result::CodegenResult;
use crate::typed_ast::{TypedExpr, TypedStmt};
use crate::types::Type;
use crate::value::Value;

use super::{int_value, CodeGen, ConstBinding};

/// Lower `while cond: body`.
pub(crate) fn lower_while<'p, 'a>(
    gen: &mut CodeGen<'_, 'p, 'a>,
    cond: &'p TypedExpr<'a>,
    body: &'p [TypedStmt<'a>],
) -> CodegenResult<()> {
    let span = cond.span();
    let header = gen.buf.new_label();
    let exit = gen.buf.new_label();
    gen.buf.bind_label(header)?;

    let cond_rv = gen.lower_expr(cond)?;
    let cond_rv = gen.as_byte_reg(cond_rv, span)?;
    gen.buf
        .emit_jump(Opcode::JumpIfNotR, Some(cond_rv.reg.byte()), exit)?;
    gen.free_rvalue(cond_rv);

    // `continue` re-tests the condition.
    gen.push_loop(exit, header);
    let result = gen.lower_block(body);
    gen.pop_loop();
    result?;

    gen.buf.emit_jump(Opcode::Jump, None, header)?;
    gen.buf.bind_label(exit)?;
    Ok(())
}

/// Lower `for var in start..end [step]: body`.
pub(crate) fn lower_for_range<'p, 'a>(
    gen: &mut CodeGen<'_, 'p, 'a>,
    var: &'a str,
    var_ty: Type,
    start: &'p TypedExpr<'a>,
    end: &'p TypedExpr<'a>,
    step: Option<&'p TypedExpr<'a>>,
    body: &'p [TypedStmt<'a>],
) -> CodegenResult<()> {
    let analysis = if gen.optimize() {
        Some(analyze_for_range(var, start, end, step, body))
    } else {
        None
    };

    if let Some(a) = &analysis {
        if a.can_unroll && a.iteration_count <= MAX_UNROLL_FACTOR {
            return unroll(gen, var, var_ty, a, body);
        }
    }
    lower_counted_loop(gen, var, var_ty, start, end, step, body, analysis.as_ref())
}

/// Fully expand a small constant-range loop. Replaces the loop: no header,
/// no back-edge, no iterator register surviving.
///
/// The loop variable is bound to each iteration's value as a compile-time
/// constant substitution, so arithmetic over it folds and the variable only
/// materializes in a register where it is used as a plain value.
fn unroll<'p, 'a>(
    gen: &mut CodeGen<'_, 'p, 'a>,
    var: &'a str,
    var_ty: Type,
    analysis: &LoopAnalysis<'p, 'a>,
    body: &'p [TypedStmt<'a>],
) -> CodegenResult<()> {
    let start = analysis.start.expect("unrollable loop has constant start");
    let step = analysis.step.expect("unrollable loop has constant step");
    let count = analysis.iteration_count;
    let tag = gen.tag_of(var_ty);
    log::debug!(
        "unrolling loop over `{}`: {} iteration(s) from {} step {}",
        var,
        count,
        start,
        step
    );

    // Pre-unroll LICM: invariants feed every expanded copy.
    let hoists = hoist_invariants(gen, analysis)?;

    let depth = gen.symbols.depth();
    gen.const_vars.push(ConstBinding {
        name: var,
        value: start,
        tag,
        depth,
    });
    let mut result = Ok(());
    for i in 0..count {
        let value = start + i * step;
        if let Some(binding) = gen.const_vars.last_mut() {
            binding.value = value;
        }
        gen.symbols.begin_scope();
        let body_result = gen.lower_stmts(body);
        gen.symbols.end_scope(&mut gen.regs);
        if let Err(e) = body_result {
            result = Err(e);
            break;
        }
    }
    gen.const_vars.pop();
    release_hoists(gen, hoists);
    if result.is_ok() {
        gen.stats.loops_unrolled += 1;
    }
    result
}

/// The conventional loop shape, with whatever optimizations the analysis
/// supports.
fn lower_counted_loop<'p, 'a>(
    gen: &mut CodeGen<'_, 'p, 'a>,
    var: &'a str,
    var_ty: Type,
    start: &'p TypedExpr<'a>,
    end: &'p TypedExpr<'a>,
    step: Option<&'p TypedExpr<'a>>,
    body: &'p [TypedStmt<'a>],
    analysis: Option<&LoopAnalysis<'p, 'a>>,
) -> CodegenResult<()> {
    let span = start.span();
    let tag = gen.tag_of(var_ty);

    let hoists = match analysis {
        Some(a) if a.can_apply_licm => hoist_invariants(gen, a)?,
        _ => Vec::new(),
    };

    let reductions_pushed = match analysis {
        Some(a) if a.can_strength_reduce && tag_supports_shift(tag) => {
            let mut n = 0;
            for r in &a.reductions {
                if r.can_optimize {
                    gen.reductions.push((r.expr, r.shift_amount));
                    n += 1;
                }
            }
            n
        }
        _ => 0,
    };

    let bounds_pushed = match analysis {
        Some(a) if a.can_eliminate_bounds => {
            gen.elided_bounds_vars.push(var);
            true
        }
        _ => false,
    };

    gen.symbols.begin_scope();
    let result = emit_counted_loop(gen, var, tag, start, end, step, body, span);
    gen.symbols.end_scope(&mut gen.regs);

    if bounds_pushed {
        gen.elided_bounds_vars.pop();
    }
    for _ in 0..reductions_pushed {
        gen.reductions.pop();
    }
    release_hoists(gen, hoists);
    result
}

fn tag_supports_shift(tag: TypeTag) -> bool {
    matches!(tag, TypeTag::I32 | TypeTag::I64)
}

#[allow(clippy::too_many_arguments)]
fn emit_counted_loop<'p, 'a>(
    gen: &mut CodeGen<'_, 'p, 'a>,
    var: &'a str,
    tag: TypeTag,
    start: &'p TypedExpr<'a>,
    end: &'p TypedExpr<'a>,
    step: Option<&'p TypedExpr<'a>>,
    body: &'p [TypedStmt<'a>],
    span: Span,
) -> CodegenResult<()> {
    // Iterator register, pinned for the duration of the loop. The range
    // expressions all lower before the loop variable is declared; they see
    // the enclosing scope, exactly as inference did.
    let start_rv = gen.lower_expr(start)?;
    let iter = gen.alloc_temp(tag, span)?;
    let iter = gen.require_byte(iter, span)?;
    gen.emit_move(iter, start_rv.reg);
    gen.free_rvalue(start_rv);
    gen.regs.pin(iter);
    gen.regs.set_name(iter, var);

    // The limit is captured in a hidden register so assignments in the
    // body cannot clobber it.
    let end_rv = gen.lower_expr(end)?;
    let limit = gen.alloc_temp(tag, span)?;
    let limit = gen.require_byte(limit, span)?;
    gen.emit_move(limit, end_rv.reg);
    gen.free_rvalue(end_rv);
    gen.regs.pin(limit);

    // Step handling: the common `step 1` i32 loop increments in place;
    // anything else keeps the step in a pinned register and adds. The
    // step's constness is checked here, not in the analysis, so the loop
    // direction comes out the same at every optimization level.
    let step_const = match step {
        Some(s) => crate::loop_analysis::const_int_value(s),
        None => Some(1),
    };
    let simple_inc = tag == TypeTag::I32 && step_const == Some(1);
    let step_reg = if simple_inc {
        None
    } else {
        let rv = match step {
            Some(s) => gen.lower_expr(s)?,
            None => gen.load_const(int_value(tag, 1), tag, span)?,
        };
        let reg = gen.alloc_temp(tag, span)?;
        let reg = gen.require_byte(reg, span)?;
        gen.emit_move(reg, rv.reg);
        gen.free_rvalue(rv);
        gen.regs.pin(reg);
        Some(reg)
    };

    gen.symbols
        .declare(var, crate::symtab::SymbolRef::from_reg(iter), tag, false);

    // Downward ranges flip the exit comparison.
    let descending = step_const.map_or(false, |s| s < 0);
    let cmp_op = match (tag, descending) {
        (TypeTag::I32, false) => Opcode::LtI32,
        (TypeTag::I32, true) => Opcode::GtI32,
        (_, false) => Opcode::CmpLt,
        (_, true) => Opcode::CmpGt,
    };

    let header = gen.buf.new_label();
    let exit = gen.buf.new_label();
    let continue_label = gen.buf.new_label();
    gen.buf.bind_label(header)?;

    let cond = gen.alloc_temp(TypeTag::Bool, span)?;
    let cond = gen.require_byte(cond, span)?;
    gen.buf
        .emit(cmp_op, &[cond.byte(), iter.byte(), limit.byte()]);
    gen.buf.emit_jump(Opcode::JumpIfNotR, Some(cond.byte()), exit)?;
    gen.regs.free(cond);

    gen.push_loop(exit, continue_label);
    let body_result = gen.lower_block(body);
    gen.pop_loop();
    body_result?;

    gen.buf.bind_label(continue_label)?;
    match step_reg {
        None => gen.buf.emit(Opcode::IncI32, &[iter.byte()]),
        Some(step_reg) => {
            let add = Opcode::for_binary(crate::ast::BinOp::Add, tag)
                .expect("loop variables are numeric");
            gen.buf
                .emit(add, &[iter.byte(), iter.byte(), step_reg.byte()]);
        }
    }
    gen.buf.emit_jump(Opcode::Jump, None, header)?;
    gen.buf.bind_label(exit)?;

    // The symbol scope frees the iterator; the hidden registers are ours.
    gen.regs.unpin(limit);
    gen.regs.free(limit);
    if let Some(step_reg) = step_reg {
        gen.regs.unpin(step_reg);
        gen.regs.free(step_reg);
    }
    Ok(())
}

/// Lower `for var in iterable: body` over an array.
pub(crate) fn lower_for_iter<'p, 'a>(
    gen: &mut CodeGen<'_, 'p, 'a>,
    var: &'a str,
    var_ty: Type,
    iterable: &'p TypedExpr<'a>,
    body: &'p [TypedStmt<'a>],
) -> CodegenResult<()> {
    let span = iterable.span();
    let elem_tag = gen.tag_of(var_ty);

    let arr_rv = gen.lower_expr(iterable)?;
    let arr_rv = gen.as_byte_reg(arr_rv, span)?;
    if arr_rv.temp {
        gen.regs.pin(arr_rv.reg);
    }

    let len = gen.alloc_temp(TypeTag::I32, span)?;
    let len = gen.require_byte(len, span)?;
    gen.buf.emit(Opcode::ArrayLen, &[len.byte(), arr_rv.reg.byte()]);
    gen.regs.pin(len);

    let idx = gen.alloc_temp(TypeTag::I32, span)?;
    let idx = gen.require_byte(idx, span)?;
    gen.load_const_into(idx, Value::I32(0), TypeTag::I32, span)?;
    gen.regs.pin(idx);

    let header = gen.buf.new_label();
    let exit = gen.buf.new_label();
    let continue_label = gen.buf.new_label();
    gen.buf.bind_label(header)?;

    let cond = gen.alloc_temp(TypeTag::Bool, span)?;
    let cond = gen.require_byte(cond, span)?;
    gen.buf
        .emit(Opcode::LtI32, &[cond.byte(), idx.byte(), len.byte()]);
    gen.buf.emit_jump(Opcode::JumpIfNotR, Some(cond.byte()), exit)?;
    gen.regs.free(cond);

    gen.symbols.begin_scope();
    let elem = gen.alloc_temp(elem_tag, span).and_then(|r| gen.require_byte(r, span));
    let body_result = elem.and_then(|elem| {
        // The induction range is the array length, so the per-element
        // check is always elidable here.
        gen.buf.emit(
            Opcode::ArrayGetFast,
            &[elem.byte(), arr_rv.reg.byte(), idx.byte()],
        );
        gen.symbols
            .declare(var, crate::symtab::SymbolRef::from_reg(elem), elem_tag, false);
        gen.push_loop(exit, continue_label);
        let r = gen.lower_stmts(body);
        gen.pop_loop();
        r
    });
    gen.symbols.end_scope(&mut gen.regs);
    body_result?;
    if gen.optimize() {
        gen.stats.bounds_checks_eliminated += 1;
    }

    gen.buf.bind_label(continue_label)?;
    gen.buf.emit(Opcode::IncI32, &[idx.byte()]);
    gen.buf.emit_jump(Opcode::Jump, None, header)?;
    gen.buf.bind_label(exit)?;

    gen.regs.unpin(idx);
    gen.regs.free(idx);
    gen.regs.unpin(len);
    gen.regs.free(len);
    if arr_rv.temp {
        gen.regs.unpin(arr_rv.reg);
    }
    gen.free_rvalue(arr_rv);
    Ok(())
}

// ---- LICM application ----------------------------------------------------

/// Compute each planned invariant into a pinned register ahead of the loop
/// and activate the replacement. A hoist that cannot secure a non-spill
/// register is abandoned; the expression simply recomputes in the body.
fn hoist_invariants<'p, 'a>(
    gen: &mut CodeGen<'_, 'p, 'a>,
    analysis: &LoopAnalysis<'p, 'a>,
) -> CodegenResult<Vec<Reg>> {
    let mut pinned = Vec::new();
    for idx in licm::plan_hoists(analysis) {
        let inv = &analysis.invariants[idx];
        let tag = gen.tag_of(inv.expr.ty);
        let at = gen.here();
        let reg = match gen.regs.allocate(tag, at) {
            Ok(reg) if reg.tier() != RegTier::Spill && reg.is_byte_addressable() => reg,
            Ok(reg) => {
                // Roll back: hoisted values must stay resident.
                gen.regs.free(reg);
                log::debug!("skipping hoist: no resident register available");
                continue;
            }
            Err(_) => {
                log::debug!("skipping hoist: register pressure");
                continue;
            }
        };
        gen.regs.pin(reg);
        let rv = gen.lower_expr(inv.expr)?;
        gen.emit_move(reg, rv.reg);
        gen.free_rvalue(rv);
        gen.hoisted.push((inv.expr, reg));
        pinned.push(reg);
        gen.stats.invariants_hoisted += 1;
        log::debug!(
            "hoisted invariant (uses={}) into {}",
            inv.use_count,
            reg
        );
    }
    Ok(pinned)
}

fn release_hoists(gen: &mut CodeGen, pinned: Vec<Reg>) {
    for reg in pinned.into_iter().rev() {
        gen.hoisted.pop();
        gen.regs.unpin(reg);
        gen.regs.free(reg);
    }
}
