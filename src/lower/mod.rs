//! Lowering: typed AST to bytecode.
//!
//! The code generator walks the typed tree in program order, allocating
//! registers as values materialize and emitting typed opcodes selected by
//! operand type. Expressions evaluate into an `RValue` that knows whether
//! its register is a scratch temp (freed by the consumer) or a variable's
//! home (left alone). Control flow lowers to forward jump placeholders
//! patched when their target binds; loops get the full treatment in the
//! `loops` submodule, where the analyzer's plans for unrolling, LICM,
//! strength reduction, and bounds elision are applied.
//!
//! Typed ALU instructions address registers with one byte. Values living in
//! the extended tiers are staged through byte-addressable temps with
//! `MOVE_EXT`; `emit_move` picks the wide form whenever either side needs
//! it.

pub mod loops;

use crate::ast::Span;
use crate::bytecode::buffer::{BytecodeBuffer, Label};
use crate::bytecode::pool::ConstantPool;
use crate::bytecode::{Chunk, CompiledUnit, Opcode, TypeTag};
use crate::context::Stats;
use crate::diagnostic::{Diagnostic, ErrorCode, Reporter};
use crate::regalloc::{PressureExhausted, Reg, RegTier, RegisterAllocator};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::{Flags, OptLevel};
use crate::symtab::{SymbolRef, SymbolTable};
use crate::typed_ast::{
    typed_exprs_equal, TypedExpr, TypedExprKind, TypedFunction, TypedProgram, TypedStmt,
    TypedStmtKind,
};
use crate::types::{Type, TypeArena};
use crate::value::{FuncId, Value};

/// The register an expression evaluated into, and whether the consumer owns
/// (and must free) it.
#[derive(Clone, Copy, Debug)]
pub struct RValue {
    /// Where the value lives.
    pub reg: Reg,
    /// True for scratch registers the consumer frees after use.
    pub temp: bool,
}

/// Jump targets of the innermost enclosing loop.
struct LoopFrame {
    break_label: Label,
    continue_label: Label,
}

/// A name bound to a compile-time constant while an unrolled iteration's
/// body lowers. Shadowable by declarations inside the body.
pub(crate) struct ConstBinding<'a> {
    pub(crate) name: &'a str,
    pub(crate) value: i64,
    pub(crate) tag: TypeTag,
    /// Scope depth the binding was created at; symbols declared deeper
    /// shadow it.
    pub(crate) depth: u32,
}

/// Lower a typed program into a compiled unit.
pub fn lower_program<'p, 'a>(
    arena: &TypeArena,
    flags: &Flags,
    stats: &mut Stats,
    reporter: &mut dyn Reporter,
    program: &'p TypedProgram<'a>,
) -> CodegenResult<CompiledUnit> {
    let mut pool = ConstantPool::new();
    let mut functions = Vec::new();
    let mut gen = CodeGen {
        arena,
        flags,
        stats,
        reporter,
        pool: &mut pool,
        functions: &mut functions,
        regs: RegisterAllocator::new(),
        symbols: SymbolTable::new(),
        buf: BytecodeBuffer::new(),
        loops: Vec::new(),
        hoisted: Vec::new(),
        reductions: Vec::new(),
        elided_bounds_vars: Vec::new(),
        const_vars: Vec::new(),
    };

    for stmt in &program.stmts {
        gen.lower_stmt(stmt)?;
    }
    gen.buf.emit_op(Opcode::Halt);

    let main = gen.buf.finalize("<main>", 0)?;
    log::debug!(
        "lowered <main>: {} bytes, {} function(s), {} constant(s)",
        main.code.len(),
        functions.len(),
        pool.len()
    );
    Ok(CompiledUnit {
        main,
        functions,
        pool,
    })
}

pub(crate) struct CodeGen<'ctx, 'p, 'a> {
    pub(crate) arena: &'ctx TypeArena,
    pub(crate) flags: &'ctx Flags,
    pub(crate) stats: &'ctx mut Stats,
    reporter: &'ctx mut dyn Reporter,
    pool: &'ctx mut ConstantPool,
    functions: &'ctx mut Vec<Chunk>,
    pub(crate) regs: RegisterAllocator,
    pub(crate) symbols: SymbolTable,
    pub(crate) buf: BytecodeBuffer,
    loops: Vec<LoopFrame>,
    /// Active LICM replacements: hoisted expression and its register.
    pub(crate) hoisted: Vec<(&'p TypedExpr<'a>, Reg)>,
    /// Active strength reductions: the multiply node and its shift amount.
    pub(crate) reductions: Vec<(&'p TypedExpr<'a>, u32)>,
    /// Loop variables with a proven constant range, for bounds elision.
    pub(crate) elided_bounds_vars: Vec<&'a str>,
    /// Constant substitutions for unrolled loop variables.
    pub(crate) const_vars: Vec<ConstBinding<'a>>,
}

impl<'ctx, 'p, 'a> CodeGen<'ctx, 'p, 'a> {
    pub(crate) fn optimize(&self) -> bool {
        self.flags.opt_level != OptLevel::None
    }

    pub(crate) fn here(&self) -> u32 {
        self.buf.offset()
    }

    pub(crate) fn tag_of(&self, ty: Type) -> TypeTag {
        TypeTag::from_type(self.arena, ty)
    }

    /// Report a fatal lowering diagnostic and produce the error to
    /// propagate.
    pub(crate) fn fatal(
        &mut self,
        code: ErrorCode,
        span: Span,
        message: impl Into<String>,
    ) -> CodegenError {
        let diag = Diagnostic::error(code, span, message);
        self.reporter.report(diag.clone());
        CodegenError::Lowering(diag)
    }

    fn pressure(&mut self, span: Span, _: PressureExhausted) -> CodegenError {
        self.fatal(
            ErrorCode::RegisterPressureExhausted,
            span,
            "expression needs more registers than the VM provides",
        )
    }

    pub(crate) fn alloc_temp(&mut self, tag: TypeTag, span: Span) -> CodegenResult<Reg> {
        let at = self.here();
        self.regs
            .allocate(tag, at)
            .map_err(|e| self.pressure(span, e))
    }

    pub(crate) fn free_rvalue(&mut self, rv: RValue) {
        if rv.temp {
            self.regs.free(rv.reg);
        }
    }

    /// Stage a value into a byte-addressable register if it isn't in one.
    pub(crate) fn as_byte_reg(&mut self, rv: RValue, span: Span) -> CodegenResult<RValue> {
        if rv.reg.is_byte_addressable() {
            return Ok(rv);
        }
        let tag = self
            .regs
            .lifetime(rv.reg)
            .map(|lt| lt.type_tag)
            .unwrap_or(TypeTag::Any);
        let tmp = self.alloc_temp(tag, span)?;
        if !tmp.is_byte_addressable() {
            self.regs.free(tmp);
            return Err(self.fatal(
                ErrorCode::RegisterPressureExhausted,
                span,
                "no byte-addressable register available for staging",
            ));
        }
        self.buf.emit_move_ext(tmp.0, rv.reg.0);
        self.free_rvalue(rv);
        Ok(RValue {
            reg: tmp,
            temp: true,
        })
    }

    /// Emit a register-to-register move, extended when either side needs
    /// it. Self-moves emit nothing.
    pub(crate) fn emit_move(&mut self, dst: Reg, src: Reg) {
        if dst == src {
            return;
        }
        if dst.is_byte_addressable() && src.is_byte_addressable() {
            self.buf.emit(Opcode::Move, &[dst.byte(), src.byte()]);
        } else {
            self.buf.emit_move_ext(dst.0, src.0);
        }
    }

    /// Intern `value` and load it into a fresh temp.
    pub(crate) fn load_const(
        &mut self,
        value: Value,
        tag: TypeTag,
        span: Span,
    ) -> CodegenResult<RValue> {
        let reg = self.alloc_temp(tag, span)?;
        self.load_const_into(reg, value, tag, span)?;
        Ok(RValue { reg, temp: true })
    }

    /// Intern `value` and load it into a specific register.
    pub(crate) fn load_const_into(
        &mut self,
        reg: Reg,
        value: Value,
        tag: TypeTag,
        span: Span,
    ) -> CodegenResult<()> {
        let idx = self.pool.insert(value).ok_or_else(|| {
            self.fatal(
                ErrorCode::CompilerBug,
                span,
                "constant pool exceeds 65536 entries",
            )
        })?;
        if reg.is_byte_addressable() {
            self.buf
                .emit_load_const(Opcode::load_const_for(tag), reg.byte(), idx);
        } else {
            self.buf.emit_load_const_ext(reg.0, idx);
        }
        Ok(())
    }

    // ---- constant substitution and folding -------------------------------

    /// The active constant binding for `name`, unless a symbol declared in
    /// a deeper scope shadows it.
    fn const_binding(&self, name: &str) -> Option<&ConstBinding<'a>> {
        let binding = self.const_vars.iter().rev().find(|b| b.name == name)?;
        if let Some(sym) = self.symbols.resolve(name) {
            if sym.depth > binding.depth {
                return None;
            }
        }
        Some(binding)
    }

    /// Evaluate an integer expression to a compile-time constant, seeing
    /// through unrolled loop variables.
    fn eval_const_int(&self, e: &TypedExpr) -> Option<(i64, TypeTag)> {
        let tag = self.tag_of(e.ty);
        if !tag.is_integer() {
            return None;
        }
        self.eval_int(e).map(|v| (v, tag))
    }

    fn eval_int(&self, e: &TypedExpr) -> Option<i64> {
        use crate::ast::{BinOp, UnOp};
        match &e.kind {
            TypedExprKind::Literal(v) => v.as_int(),
            TypedExprKind::Ident(name) => self.const_binding(name).map(|b| b.value),
            TypedExprKind::Unary { op, operand } => {
                let v = self.eval_int(operand)?;
                match op {
                    UnOp::Neg => v.checked_neg(),
                    UnOp::Plus => Some(v),
                    UnOp::Not => None,
                }
            }
            TypedExprKind::Binary { op, lhs, rhs } => {
                let l = self.eval_int(lhs)?;
                let r = self.eval_int(rhs)?;
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

    /// The zero value used to initialize annotation-only declarations.
    fn default_value(&self, tag: TypeTag) -> Value {
        match tag {
            TypeTag::I32 => Value::I32(0),
            TypeTag::I64 => Value::I64(0),
            TypeTag::U32 => Value::U32(0),
            TypeTag::U64 => Value::U64(0),
            TypeTag::F64 => Value::F64(0.0),
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Str => Value::Str("".into()),
            TypeTag::Array | TypeTag::Func | TypeTag::Any => Value::Nil,
        }
    }

    // ---- expressions -----------------------------------------------------

    pub(crate) fn lower_expr(&mut self, e: &'p TypedExpr<'a>) -> CodegenResult<RValue> {
        let span = e.span();
        self.buf.set_span(span);

        // A hoisted loop invariant lowers to its register, not a
        // recomputation.
        if let Some(&(_, reg)) = self
            .hoisted
            .iter()
            .find(|(h, _)| typed_exprs_equal(h, e))
        {
            let at = self.here();
            self.regs.touch(reg, at);
            return Ok(RValue { reg, temp: false });
        }

        match &e.kind {
            TypedExprKind::Literal(v) => {
                let tag = self.tag_of(e.ty);
                self.load_const((*v).clone(), tag, span)
            }

            TypedExprKind::Ident(name) => {
                if let Some(binding) = self.const_binding(name) {
                    let (value, tag) = (binding.value, binding.tag);
                    return self.load_const(int_value(tag, value), tag, span);
                }
                match self.symbols.resolve(name) {
                    Some(sym) => {
                        let reg = sym.storage.reg();
                        let at = self.here();
                        self.regs.touch(reg, at);
                        Ok(RValue { reg, temp: false })
                    }
                    None => Err(self.fatal(
                        ErrorCode::CompilerBug,
                        span,
                        format!("symbol `{}` missing during lowering", name),
                    )),
                }
            }

            TypedExprKind::Binary { op, lhs, rhs } => self.lower_binary(e, *op, lhs, rhs),

            TypedExprKind::Unary { op, operand } => self.lower_unary(e, *op, operand),

            TypedExprKind::Ternary {
                cond,
                then_val,
                else_val,
            } => {
                let result_tag = self.tag_of(e.ty);
                let cond_rv = self.lower_expr(cond)?;
                let cond_rv = self.as_byte_reg(cond_rv, span)?;
                let result = self.alloc_temp(result_tag, span)?;
                let else_label = self.buf.new_label();
                let end_label = self.buf.new_label();
                self.buf
                    .emit_jump(Opcode::JumpIfNotR, Some(cond_rv.reg.byte()), else_label)?;
                self.free_rvalue(cond_rv);

                let then_rv = self.lower_expr(then_val)?;
                self.emit_move(result, then_rv.reg);
                self.free_rvalue(then_rv);
                self.buf.emit_jump(Opcode::Jump, None, end_label)?;

                self.buf.bind_label(else_label)?;
                let else_rv = self.lower_expr(else_val)?;
                self.emit_move(result, else_rv.reg);
                self.free_rvalue(else_rv);
                self.buf.bind_label(end_label)?;

                Ok(RValue {
                    reg: result,
                    temp: true,
                })
            }

            TypedExprKind::Cast { operand, target } => self.lower_cast(operand, *target, span),

            TypedExprKind::Call { callee, args } => self.lower_call(e, callee, args),

            TypedExprKind::ArrayLit(elems) => {
                let count = elems.len();
                if count > u8::MAX as usize {
                    return Err(self.fatal(
                        ErrorCode::TooManyLocals,
                        span,
                        "array literal has too many elements",
                    ));
                }
                let first = self.alloc_window(count as u16, span)?;
                for (i, elem) in elems.iter().enumerate() {
                    let rv = self.lower_expr(elem)?;
                    self.emit_move(Reg(first.0 + i as u16), rv.reg);
                    self.free_rvalue(rv);
                }
                let dst = self.alloc_temp(TypeTag::Array, span)?;
                let dst = self.require_byte(dst, span)?;
                self.buf
                    .emit(Opcode::NewArray, &[dst.byte(), first.byte(), count as u8]);
                self.free_window(first, count as u16);
                Ok(RValue {
                    reg: dst,
                    temp: true,
                })
            }

            TypedExprKind::Index { base, index } => {
                let elem_tag = self.tag_of(e.ty);
                let elide = self.optimize() && self.index_bounds_elidable(index);
                let base_rv = self.lower_expr(base)?;
                let base_rv = self.as_byte_reg(base_rv, span)?;
                let idx_rv = self.lower_expr(index)?;
                let idx_rv = self.as_byte_reg(idx_rv, span)?;
                let dst = self.alloc_temp(elem_tag, span)?;
                let dst = self.require_byte(dst, span)?;
                let op = if elide {
                    self.stats.bounds_checks_eliminated += 1;
                    Opcode::ArrayGetFast
                } else {
                    Opcode::ArrayGet
                };
                self.buf
                    .emit(op, &[dst.byte(), base_rv.reg.byte(), idx_rv.reg.byte()]);
                self.free_rvalue(idx_rv);
                self.free_rvalue(base_rv);
                Ok(RValue {
                    reg: dst,
                    temp: true,
                })
            }
        }
    }

    /// Is this index expression the induction variable of an enclosing
    /// loop with a proven constant range?
    fn index_bounds_elidable(&self, index: &TypedExpr) -> bool {
        match &index.kind {
            TypedExprKind::Ident(name) => {
                self.elided_bounds_vars.iter().any(|v| v == name)
            }
            _ => false,
        }
    }

    fn lower_binary(
        &mut self,
        e: &'p TypedExpr<'a>,
        op: crate::ast::BinOp,
        lhs: &'p TypedExpr<'a>,
        rhs: &'p TypedExpr<'a>,
    ) -> CodegenResult<RValue> {
        let span = e.span();

        // Arithmetic over compile-time constants (including unrolled loop
        // variables) folds to a single load.
        if self.optimize() {
            if let Some((v, tag)) = self.eval_const_int(e) {
                return self.load_const(int_value(tag, v), tag, span);
            }
        }

        // An applied strength reduction turns the multiply into a shift.
        if let Some(shift) = self.matching_reduction(e) {
            return self.lower_shift(e, lhs, rhs, shift);
        }

        let operand_tag = self.tag_of(lhs.ty);
        let result_tag = self.tag_of(e.ty);
        let opcode = Opcode::for_binary(op, operand_tag).ok_or_else(|| {
            self.fatal(
                ErrorCode::CompilerBug,
                span,
                format!("no opcode for `{}` on {:?}", op, operand_tag),
            )
        })?;

        let lhs_rv = self.lower_expr(lhs)?;
        let lhs_rv = self.as_byte_reg(lhs_rv, span)?;
        let rhs_rv = self.lower_expr(rhs)?;
        let rhs_rv = self.as_byte_reg(rhs_rv, span)?;
        let dst = self.alloc_temp(result_tag, span)?;
        let dst = self.require_byte(dst, span)?;
        self.buf.set_span(span);
        self.buf.emit(
            opcode,
            &[dst.byte(), lhs_rv.reg.byte(), rhs_rv.reg.byte()],
        );
        self.free_rvalue(rhs_rv);
        self.free_rvalue(lhs_rv);
        Ok(RValue {
            reg: dst,
            temp: true,
        })
    }

    fn matching_reduction(&self, e: &TypedExpr) -> Option<u32> {
        self.reductions
            .iter()
            .find(|(r, _)| typed_exprs_equal(r, e))
            .map(|&(_, shift)| shift)
    }

    fn lower_shift(
        &mut self,
        e: &'p TypedExpr<'a>,
        lhs: &'p TypedExpr<'a>,
        rhs: &'p TypedExpr<'a>,
        shift: u32,
    ) -> CodegenResult<RValue> {
        let span = e.span();
        let tag = self.tag_of(e.ty);
        let opcode = match tag {
            TypeTag::I32 => Opcode::ShlI32,
            TypeTag::I64 => Opcode::ShlI64,
            _ => {
                return Err(self.fatal(
                    ErrorCode::CompilerBug,
                    span,
                    format!("shift rewrite on {:?} operand", tag),
                ))
            }
        };
        // The non-literal side is the induction variable.
        let var_side = if matches!(lhs.kind, TypedExprKind::Literal(_)) {
            rhs
        } else {
            lhs
        };
        let src = self.lower_expr(var_side)?;
        let src = self.as_byte_reg(src, span)?;
        let dst = self.alloc_temp(tag, span)?;
        let dst = self.require_byte(dst, span)?;
        self.buf.set_span(span);
        self.buf
            .emit(opcode, &[dst.byte(), src.reg.byte(), shift as u8]);
        self.free_rvalue(src);
        self.stats.strength_reductions_applied += 1;
        Ok(RValue {
            reg: dst,
            temp: true,
        })
    }

    fn lower_unary(
        &mut self,
        e: &'p TypedExpr<'a>,
        op: crate::ast::UnOp,
        operand: &'p TypedExpr<'a>,
    ) -> CodegenResult<RValue> {
        use crate::ast::UnOp;
        let span = e.span();
        if self.optimize() {
            if let Some((v, tag)) = self.eval_const_int(e) {
                return self.load_const(int_value(tag, v), tag, span);
            }
        }
        let rv = self.lower_expr(operand)?;
        let opcode = match op {
            // Unary plus is the identity on numbers.
            UnOp::Plus => return Ok(rv),
            UnOp::Not => Opcode::BoolNot,
            UnOp::Neg => match self.tag_of(operand.ty) {
                TypeTag::I32 => Opcode::NegI32,
                TypeTag::I64 => Opcode::NegI64,
                TypeTag::F64 => Opcode::NegF64,
                tag => {
                    return Err(self.fatal(
                        ErrorCode::CompilerBug,
                        span,
                        format!("negation of {:?} operand", tag),
                    ))
                }
            },
        };
        let rv = self.as_byte_reg(rv, span)?;
        let dst = self.alloc_temp(self.tag_of(e.ty), span)?;
        let dst = self.require_byte(dst, span)?;
        self.buf.emit(opcode, &[dst.byte(), rv.reg.byte()]);
        self.free_rvalue(rv);
        Ok(RValue {
            reg: dst,
            temp: true,
        })
    }

    fn lower_cast(
        &mut self,
        operand: &'p TypedExpr<'a>,
        target: Type,
        span: Span,
    ) -> CodegenResult<RValue> {
        let from = self.tag_of(operand.ty);
        let to = self.tag_of(target);
        let rv = self.lower_expr(operand)?;

        if from == to || from == TypeTag::Any || to == TypeTag::Any {
            return Ok(rv);
        }

        // Boolean to wide integers goes through i32.
        if from == TypeTag::Bool && to.is_integer() && to != TypeTag::I32 {
            let rv = self.as_byte_reg(rv, span)?;
            let mid = self.alloc_temp(TypeTag::I32, span)?;
            let mid = self.require_byte(mid, span)?;
            self.buf
                .emit(Opcode::BoolToI32, &[mid.byte(), rv.reg.byte()]);
            self.free_rvalue(rv);
            let widen = Opcode::for_conversion(TypeTag::I32, to).ok_or_else(|| {
                self.fatal(ErrorCode::CompilerBug, span, "missing integer widening op")
            })?;
            let dst = self.alloc_temp(to, span)?;
            let dst = self.require_byte(dst, span)?;
            self.buf.emit(widen, &[dst.byte(), mid.byte()]);
            self.regs.free(mid);
            return Ok(RValue {
                reg: dst,
                temp: true,
            });
        }

        match Opcode::for_conversion(from, to) {
            Some(opcode) => {
                let rv = self.as_byte_reg(rv, span)?;
                let dst = self.alloc_temp(to, span)?;
                let dst = self.require_byte(dst, span)?;
                self.buf.emit(opcode, &[dst.byte(), rv.reg.byte()]);
                self.free_rvalue(rv);
                Ok(RValue {
                    reg: dst,
                    temp: true,
                })
            }
            None => Err(self.fatal(
                ErrorCode::CompilerBug,
                span,
                format!("no conversion from {:?} to {:?}", from, to),
            )),
        }
    }

    fn lower_call(
        &mut self,
        e: &'p TypedExpr<'a>,
        callee: &'p TypedExpr<'a>,
        args: &'p [TypedExpr<'a>],
    ) -> CodegenResult<RValue> {
        let span = e.span();
        if args.len() > u8::MAX as usize {
            return Err(self.fatal(
                ErrorCode::ArityMismatch,
                span,
                "call has more than 255 arguments",
            ));
        }
        let callee_rv = self.lower_expr(callee)?;
        let callee_rv = self.as_byte_reg(callee_rv, span)?;

        // Arguments go into a contiguous window.
        let argc = args.len() as u16;
        let first = self.alloc_window(argc, span)?;
        for (i, arg) in args.iter().enumerate() {
            let rv = self.lower_expr(arg)?;
            self.emit_move(Reg(first.0 + i as u16), rv.reg);
            self.free_rvalue(rv);
        }

        let result = self.alloc_temp(self.tag_of(e.ty), span)?;
        let result = self.require_byte(result, span)?;
        self.buf.set_span(span);
        self.buf.emit(
            Opcode::Call,
            &[
                callee_rv.reg.byte(),
                first.byte(),
                argc as u8,
                result.byte(),
            ],
        );
        self.free_window(first, argc);
        self.free_rvalue(callee_rv);
        Ok(RValue {
            reg: result,
            temp: true,
        })
    }

    /// Allocate a contiguous, byte-addressable argument window.
    fn alloc_window(&mut self, count: u16, span: Span) -> CodegenResult<Reg> {
        let at = self.here();
        let first = self
            .regs
            .allocate_block(count, TypeTag::Any, at)
            .map_err(|e| self.pressure(span, e))?;
        if count > 0 && !Reg(first.0 + count - 1).is_byte_addressable() {
            self.free_window(first, count);
            return Err(self.fatal(
                ErrorCode::RegisterPressureExhausted,
                span,
                "argument window does not fit in byte-addressable registers",
            ));
        }
        Ok(first)
    }

    fn free_window(&mut self, first: Reg, count: u16) {
        for i in 0..count {
            self.regs.free(Reg(first.0 + i));
        }
    }

    fn require_byte(&mut self, reg: Reg, span: Span) -> CodegenResult<Reg> {
        if reg.is_byte_addressable() {
            Ok(reg)
        } else {
            self.regs.free(reg);
            Err(self.fatal(
                ErrorCode::RegisterPressureExhausted,
                span,
                "no byte-addressable register available for a result",
            ))
        }
    }

    // ---- statements ------------------------------------------------------

    pub(crate) fn lower_stmt(&mut self, s: &'p TypedStmt<'a>) -> CodegenResult<()> {
        let span = s.span();
        self.buf.set_span(span);
        match &s.kind {
            TypedStmtKind::VarDecl {
                name,
                mutable,
                ty,
                init,
            } => self.lower_var_decl(name, *mutable, *ty, init.as_ref(), span),

            TypedStmtKind::Assign {
                name,
                declares,
                value,
            } => {
                if *declares {
                    return self.lower_var_decl(name, true, value.ty, Some(value), span);
                }
                let dst = match self.symbols.resolve(name) {
                    Some(sym) => sym.storage.reg(),
                    None => {
                        return Err(self.fatal(
                            ErrorCode::CompilerBug,
                            span,
                            format!("assignment target `{}` missing during lowering", name),
                        ))
                    }
                };
                let rv = self.lower_expr(value)?;
                self.emit_move(dst, rv.reg);
                self.free_rvalue(rv);
                let at = self.here();
                self.regs.touch(dst, at);
                Ok(())
            }

            TypedStmtKind::Print { args, newline } => self.lower_print(args, *newline, span),

            TypedStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond_rv = self.lower_expr(cond)?;
                let cond_rv = self.as_byte_reg(cond_rv, span)?;
                let else_label = self.buf.new_label();
                self.buf
                    .emit_jump(Opcode::JumpIfNotR, Some(cond_rv.reg.byte()), else_label)?;
                self.free_rvalue(cond_rv);

                self.lower_block(then_body)?;
                match else_body {
                    Some(else_body) => {
                        let end_label = self.buf.new_label();
                        self.buf.emit_jump(Opcode::Jump, None, end_label)?;
                        self.buf.bind_label(else_label)?;
                        self.lower_block(else_body)?;
                        self.buf.bind_label(end_label)?;
                    }
                    None => {
                        self.buf.bind_label(else_label)?;
                    }
                }
                Ok(())
            }

            TypedStmtKind::While { cond, body } => loops::lower_while(self, cond, body),

            TypedStmtKind::ForRange {
                var,
                var_ty,
                start,
                end,
                step,
                body,
            } => loops::lower_for_range(self, var, *var_ty, start, end, step.as_ref(), body),

            TypedStmtKind::ForIter {
                var,
                var_ty,
                iterable,
                body,
            } => loops::lower_for_iter(self, var, *var_ty, iterable, body),

            TypedStmtKind::Break => match self.loops.last() {
                Some(frame) => {
                    let label = frame.break_label;
                    self.buf.emit_jump(Opcode::Jump, None, label)
                }
                None => Err(self.fatal(
                    ErrorCode::ControlFlowOutsideLoop,
                    span,
                    "`break` outside of a loop",
                )),
            },

            TypedStmtKind::Continue => match self.loops.last() {
                Some(frame) => {
                    let label = frame.continue_label;
                    self.buf.emit_jump(Opcode::Jump, None, label)
                }
                None => Err(self.fatal(
                    ErrorCode::ControlFlowOutsideLoop,
                    span,
                    "`continue` outside of a loop",
                )),
            },

            TypedStmtKind::Function(decl) => self.lower_function(decl, span),

            TypedStmtKind::Return(value) => {
                match value {
                    Some(v) => {
                        let rv = self.lower_expr(v)?;
                        let rv = self.as_byte_reg(rv, span)?;
                        self.buf.set_span(span);
                        self.buf.emit(Opcode::ReturnR, &[rv.reg.byte()]);
                        self.free_rvalue(rv);
                    }
                    None => self.buf.emit_op(Opcode::ReturnVoid),
                }
                Ok(())
            }

            TypedStmtKind::Block(body) => self.lower_block(body),

            TypedStmtKind::Expr(e) => {
                let rv = self.lower_expr(e)?;
                self.free_rvalue(rv);
                Ok(())
            }
        }
    }

    /// Lower statements inside a fresh scope.
    pub(crate) fn lower_block(&mut self, body: &'p [TypedStmt<'a>]) -> CodegenResult<()> {
        self.symbols.begin_scope();
        let result = self.lower_stmts(body);
        self.symbols.end_scope(&mut self.regs);
        result
    }

    pub(crate) fn lower_stmts(&mut self, body: &'p [TypedStmt<'a>]) -> CodegenResult<()> {
        for st in body {
            self.lower_stmt(st)?;
        }
        Ok(())
    }

    fn lower_var_decl(
        &mut self,
        name: &'a str,
        mutable: bool,
        ty: Type,
        init: Option<&'p TypedExpr<'a>>,
        span: Span,
    ) -> CodegenResult<()> {
        let tag = self.tag_of(ty);
        let at = self.here();
        let reg = self
            .regs
            .allocate(tag, at)
            .map_err(|e| self.pressure(span, e))?;
        if reg.tier() == RegTier::Spill {
            return Err(self.fatal(
                ErrorCode::TooManyLocals,
                span,
                format!("no register left for variable `{}`", name),
            ));
        }
        self.regs.set_name(reg, name);
        match init {
            Some(init) => {
                let rv = self.lower_expr(init)?;
                self.emit_move(reg, rv.reg);
                self.free_rvalue(rv);
            }
            None => {
                let zero = self.default_value(tag);
                self.load_const_into(reg, zero, tag, span)?;
            }
        }
        self.symbols
            .declare(name, SymbolRef::from_reg(reg), tag, mutable);
        Ok(())
    }

    fn lower_print(
        &mut self,
        args: &'p [TypedExpr<'a>],
        newline: bool,
        span: Span,
    ) -> CodegenResult<()> {
        if args.len() == 1 && newline {
            let rv = self.lower_expr(&args[0])?;
            let rv = self.as_byte_reg(rv, span)?;
            self.buf.set_span(span);
            self.buf.emit(Opcode::PrintR, &[rv.reg.byte()]);
            self.free_rvalue(rv);
            return Ok(());
        }
        if args.len() > u8::MAX as usize {
            return Err(self.fatal(
                ErrorCode::TooManyLocals,
                span,
                "print has too many arguments",
            ));
        }
        let count = args.len() as u16;
        let first = self.alloc_window(count, span)?;
        for (i, arg) in args.iter().enumerate() {
            let rv = self.lower_expr(arg)?;
            self.emit_move(Reg(first.0 + i as u16), rv.reg);
            self.free_rvalue(rv);
        }
        self.buf.set_span(span);
        self.buf.emit(
            Opcode::PrintMultiR,
            &[first.byte(), count as u8, newline as u8],
        );
        self.free_window(first, count);
        Ok(())
    }

    fn lower_function(&mut self, decl: &'p TypedFunction<'a>, span: Span) -> CodegenResult<()> {
        if decl.params.len() > u8::MAX as usize {
            return Err(self.fatal(
                ErrorCode::ArityMismatch,
                span,
                format!("function `{}` has more than 255 parameters", decl.name),
            ));
        }
        let arity = decl.params.len() as u8;
        log::debug!("lowering function `{}` (arity {})", decl.name, arity);

        // Functions compile into their own chunk with a fresh register
        // window; the enclosing state is parked and restored afterwards.
        let saved_regs = core::mem::replace(&mut self.regs, RegisterAllocator::new());
        let saved_symbols = core::mem::replace(&mut self.symbols, SymbolTable::new());
        let saved_buf = core::mem::replace(&mut self.buf, BytecodeBuffer::new());
        let saved_loops = core::mem::take(&mut self.loops);
        let saved_hoisted = core::mem::take(&mut self.hoisted);
        let saved_reductions = core::mem::take(&mut self.reductions);
        let saved_bounds = core::mem::take(&mut self.elided_bounds_vars);
        let saved_const_vars = core::mem::take(&mut self.const_vars);

        let body_result = (|| {
            self.symbols.begin_scope();
            for (i, (pname, pty)) in decl.params.iter().enumerate() {
                let tag = self.tag_of(*pty);
                let reg = self
                    .regs
                    .allocate(tag, 0)
                    .map_err(|e| self.pressure(span, e))?;
                debug_assert_eq!(reg, Reg(i as u16), "parameters occupy r0..arity");
                self.regs.set_name(reg, pname);
                self.symbols
                    .declare(pname, SymbolRef::from_reg(reg), tag, false);
            }
            self.lower_stmts(&decl.body)?;
            // Fall-through terminator; unreachable when every path returns.
            self.buf.emit_op(Opcode::ReturnVoid);
            self.symbols.end_scope(&mut self.regs);
            Ok(())
        })();

        let chunk_result = body_result
            .and_then(|()| core::mem::replace(&mut self.buf, BytecodeBuffer::new()).finalize(decl.name, arity));

        self.regs = saved_regs;
        self.symbols = saved_symbols;
        self.buf = saved_buf;
        self.loops = saved_loops;
        self.hoisted = saved_hoisted;
        self.reductions = saved_reductions;
        self.elided_bounds_vars = saved_bounds;
        self.const_vars = saved_const_vars;

        let chunk = chunk_result?;
        let func_id = FuncId(self.functions.len() as u32);
        self.functions.push(chunk);
        self.stats.functions_compiled += 1;

        // Bind the function value to a module-tier register.
        let at = self.here();
        let reg = self
            .regs
            .allocate_module(TypeTag::Func, at)
            .map_err(|e| self.pressure(span, e))?;
        self.load_const_into(reg, Value::Function(func_id), TypeTag::Func, span)?;
        self.symbols
            .declare(decl.name, SymbolRef::from_reg(reg), TypeTag::Func, false);
        Ok(())
    }

    // ---- loop support ----------------------------------------------------

    pub(crate) fn push_loop(&mut self, break_label: Label, continue_label: Label) {
        self.loops.push(LoopFrame {
            break_label,
            continue_label,
        });
    }

    pub(crate) fn pop_loop(&mut self) {
        self.loops.pop();
    }
}

/// Build the integer `Value` of the right width for a register tag.
pub(crate) fn int_value(tag: TypeTag, v: i64) -> Value {
    match tag {
        TypeTag::I64 => Value::I64(v),
        TypeTag::U32 => Value::U32(v as u32),
        TypeTag::U64 => Value::U64(v as u64),
        _ => Value::I32(v as i32),
    }
}
