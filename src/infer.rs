//! Type inference.
//!
//! A syntax-directed Algorithm W over the untyped AST. The engine walks the
//! program once, unifying as it goes and recording every expression's type
//! in a side table keyed by node id; a second walk builds the typed tree
//! from those tables. Errors are collected rather than thrown so the user
//! sees every type error in one run; if any were recorded, no typed tree is
//! built and compilation halts.
//!
//! Two rules beyond textbook W:
//!
//! - **Literal adaptation**: in a binary operation, annotated declaration,
//!   argument position, or return, a literal operand facing a concrete
//!   numeric type of a different width adopts that type instead of forcing
//!   unification to fail. `let x: i64 = 1` means what it says. The rule is
//!   asymmetric on purpose: only syntactic literals adapt.
//! - **Recovery typing**: a reported error yields the `Error` primitive,
//!   which unifies with anything, so a single mistake produces a single
//!   diagnostic.

use crate::ast::{
    BinOp, Expr, ExprKind, NodeId, Program, Span, Stmt, StmtKind, TypeAnnotation, TypeExpr, UnOp,
};
use crate::diagnostic::{Diagnostic, ErrorCode, Reporter};
use crate::fx::{FxHashMap, FxHashSet};
use crate::typed_ast::{
    TypedExpr, TypedExprKind, TypedFunction, TypedProgram, TypedStmt, TypedStmtKind,
};
use crate::types::env::TypeEnv;
use crate::types::unify::{prune, unify, UnifyErrorKind};
use crate::types::{generalize, instantiate, PrimType, Type, TypeArena};
use crate::value::Value;

/// Infer types for `program`.
///
/// On success returns the typed tree. On failure every collected diagnostic
/// is delivered to `reporter` and the error count is returned.
pub fn infer_program<'a>(
    arena: &mut TypeArena,
    program: &'a Program,
    reporter: &mut dyn Reporter,
) -> Result<TypedProgram<'a>, usize> {
    let mut engine = InferenceEngine::new(arena);
    for stmt in &program.stmts {
        engine.infer_stmt(stmt);
    }

    if !engine.errors.is_empty() {
        let count = engine.errors.len();
        log::debug!("inference found {} error(s); halting", count);
        for d in engine.errors.drain(..) {
            reporter.report(d);
        }
        return Err(count);
    }

    log::debug!(
        "inference succeeded; {} types in arena",
        engine.arena.len()
    );
    let stmts = program.stmts.iter().map(|s| engine.build_stmt(s)).collect();
    Ok(TypedProgram { stmts })
}

struct InferenceEngine<'e> {
    arena: &'e mut TypeArena,
    env: TypeEnv,
    errors: Vec<Diagnostic>,
    /// Resolved type per expression node.
    expr_types: FxHashMap<NodeId, Type>,
    /// Resolved type of the name introduced by a declaring statement
    /// (`VarDecl`, declaring `Assign`, `ForRange`, `ForIter`).
    decl_types: FxHashMap<NodeId, Type>,
    /// Signatures of function declarations.
    fn_sigs: FxHashMap<NodeId, (Vec<Type>, Type)>,
    /// `Assign` statements that implicitly declared their target.
    assign_declares: FxHashSet<NodeId>,
    /// Declared return types of the enclosing functions, innermost last.
    ret_stack: Vec<Type>,
}

impl<'e> InferenceEngine<'e> {
    fn new(arena: &'e mut TypeArena) -> Self {
        Self {
            arena,
            env: TypeEnv::new(),
            errors: Vec::new(),
            expr_types: FxHashMap::default(),
            decl_types: FxHashMap::default(),
            fn_sigs: FxHashMap::default(),
            assign_declares: FxHashSet::default(),
            ret_stack: Vec::new(),
        }
    }

    fn error_ty(&self) -> Type {
        self.arena.prim(PrimType::Error)
    }

    fn report(&mut self, diagnostic: Diagnostic) -> Type {
        self.errors.push(diagnostic);
        self.error_ty()
    }

    fn resolve_annotation(&mut self, ann: &TypeAnnotation) -> Type {
        self.resolve_type_expr(&ann.ty)
    }

    fn resolve_type_expr(&mut self, te: &TypeExpr) -> Type {
        match te {
            TypeExpr::I32 => self.arena.prim(PrimType::I32),
            TypeExpr::I64 => self.arena.prim(PrimType::I64),
            TypeExpr::U32 => self.arena.prim(PrimType::U32),
            TypeExpr::U64 => self.arena.prim(PrimType::U64),
            TypeExpr::F64 => self.arena.prim(PrimType::F64),
            TypeExpr::Bool => self.arena.prim(PrimType::Bool),
            TypeExpr::Str => self.arena.prim(PrimType::Str),
            TypeExpr::Void => self.arena.prim(PrimType::Void),
            TypeExpr::Array(elem) => {
                let elem = self.resolve_type_expr(elem);
                self.arena.array(elem)
            }
        }
    }

    fn literal_type(&self, v: &Value) -> Type {
        let p = match v {
            Value::Bool(_) => PrimType::Bool,
            Value::I32(_) => PrimType::I32,
            Value::I64(_) => PrimType::I64,
            Value::U32(_) => PrimType::U32,
            Value::U64(_) => PrimType::U64,
            Value::F64(_) => PrimType::F64,
            Value::Str(_) => PrimType::Str,
            Value::Nil => PrimType::Void,
            // Array and function literals don't occur in `Literal` nodes;
            // arrays have their own expression form.
            Value::Array(_) | Value::Function(_) => PrimType::Any,
        };
        self.arena.prim(p)
    }

    /// If `expr` is a syntactic literal of a numeric type and `target` is a
    /// concrete numeric primitive, re-type the literal as `target` and
    /// return it; otherwise return `ty` unchanged.
    fn adapt_literal(&mut self, expr: &Expr, ty: Type, target: Type) -> Type {
        if !matches!(expr.kind, ExprKind::Literal(_)) {
            return ty;
        }
        let ty = prune(self.arena, ty);
        let target = prune(self.arena, target);
        let from = self.arena.as_prim(ty);
        let to = self.arena.as_prim(target);
        match (from, to) {
            (Some(f), Some(t)) if f.is_numeric() && t.is_numeric() && f != t => {
                log::trace!(
                    "adapting literal at {} from {} to {}",
                    expr.span,
                    f,
                    t
                );
                self.expr_types.insert(expr.id, target);
                target
            }
            _ => ty,
        }
    }

    /// Unify, converting failure into a diagnostic. Returns the pruned
    /// unified type, or the recovery type after reporting.
    fn unify_or_report(&mut self, a: Type, b: Type, span: Span) -> Type {
        match unify(self.arena, a, b) {
            Ok(()) => prune(self.arena, a),
            Err(err) => {
                let left = self.arena.display(err.left).to_string();
                let right = self.arena.display(err.right).to_string();
                let diag = match err.kind {
                    UnifyErrorKind::Occurs => Diagnostic::error(
                        ErrorCode::OccursCheck,
                        span,
                        format!(
                            "cannot construct infinite type: `{}` occurs in `{}`",
                            left, right
                        ),
                    ),
                    UnifyErrorKind::ArityMismatch => Diagnostic::error(
                        ErrorCode::ArityMismatch,
                        span,
                        format!(
                            "function types have different arities: `{}` vs `{}`",
                            left, right
                        ),
                    ),
                    UnifyErrorKind::HeadMismatch => Diagnostic::error(
                        ErrorCode::TypeMismatch,
                        span,
                        format!("type mismatch: expected `{}`, found `{}`", left, right),
                    ),
                };
                self.report(diag)
            }
        }
    }

    fn infer_expr(&mut self, e: &Expr) -> Type {
        let ty = self.infer_expr_kind(e);
        self.expr_types.insert(e.id, ty);
        ty
    }

    fn infer_expr_kind(&mut self, e: &Expr) -> Type {
        match &e.kind {
            ExprKind::Literal(v) => self.literal_type(v),

            ExprKind::Ident(name) => match self.env.lookup(name) {
                Some(binding) => {
                    let scheme = binding.scheme.clone();
                    instantiate(self.arena, &scheme)
                }
                None => self.report(
                    Diagnostic::error(
                        ErrorCode::UnboundVariable,
                        e.span,
                        format!("undefined variable `{}`", name),
                    )
                    .with_help("declare it with `let` or `mut` before use"),
                ),
            },

            ExprKind::Binary { op, lhs, rhs } => self.infer_binary(e, *op, lhs, rhs),

            ExprKind::Unary { op, operand } => {
                let ty = self.infer_expr(operand);
                match op {
                    UnOp::Not => {
                        let bool_ty = self.arena.prim(PrimType::Bool);
                        self.unify_or_report(ty, bool_ty, operand.span);
                        bool_ty
                    }
                    UnOp::Neg | UnOp::Plus => {
                        let pruned = prune(self.arena, ty);
                        if let Some(p) = self.arena.as_prim(pruned) {
                            let signed_ok = p.is_numeric()
                                && !(*op == UnOp::Neg
                                    && matches!(p, PrimType::U32 | PrimType::U64));
                            if !signed_ok && p != PrimType::Error && p != PrimType::Any {
                                return self.report(Diagnostic::error(
                                    ErrorCode::UnsupportedOperation,
                                    e.span,
                                    format!("unary `{}` is not defined for `{}`", op, p),
                                ));
                            }
                        }
                        pruned
                    }
                }
            }

            ExprKind::Ternary {
                cond,
                then_val,
                else_val,
            } => {
                let cond_ty = self.infer_expr(cond);
                let bool_ty = self.arena.prim(PrimType::Bool);
                self.unify_or_report(cond_ty, bool_ty, cond.span);
                let then_ty = self.infer_expr(then_val);
                let else_ty = self.infer_expr(else_val);
                let else_ty = self.adapt_literal(else_val, else_ty, then_ty);
                let then_ty = self.adapt_literal(then_val, then_ty, else_ty);
                self.unify_or_report(then_ty, else_ty, e.span)
            }

            ExprKind::Cast { operand, target } => {
                let from = self.infer_expr(operand);
                let to = self.resolve_annotation(target);
                self.check_castable(from, to, e.span);
                to
            }

            ExprKind::Call { callee, args } => self.infer_call(e, callee, args),

            ExprKind::ArrayLit(elems) => {
                let elem = self.arena.fresh_var();
                for el in elems {
                    let ty = self.infer_expr(el);
                    let ty = self.adapt_literal(el, ty, elem);
                    self.unify_or_report(ty, elem, el.span);
                }
                self.arena.array(elem)
            }

            ExprKind::Index { base, index } => {
                let base_ty = self.infer_expr(base);
                let elem = self.arena.fresh_var();
                let arr = self.arena.array(elem);
                self.unify_or_report(base_ty, arr, base.span);
                let idx_ty = self.infer_expr(index);
                let idx = prune(self.arena, idx_ty);
                match self.arena.as_prim(idx) {
                    Some(p) if p.is_integer() || p == PrimType::Error || p == PrimType::Any => {}
                    Some(p) => {
                        self.report(Diagnostic::error(
                            ErrorCode::TypeMismatch,
                            index.span,
                            format!("array index must be an integer, found `{}`", p),
                        ));
                    }
                    None => {
                        // Unconstrained index defaults to i32.
                        let i32_ty = self.arena.prim(PrimType::I32);
                        self.unify_or_report(idx, i32_ty, index.span);
                    }
                }
                prune(self.arena, elem)
            }
        }
    }

    fn infer_binary(&mut self, e: &Expr, op: BinOp, lhs: &Expr, rhs: &Expr) -> Type {
        let lt = self.infer_expr(lhs);
        let rt = self.infer_expr(rhs);

        if op.is_logical() {
            let bool_ty = self.arena.prim(PrimType::Bool);
            self.unify_or_report(lt, bool_ty, lhs.span);
            self.unify_or_report(rt, bool_ty, rhs.span);
            return bool_ty;
        }

        // Literal adaptation: when exactly one operand is a syntactic
        // literal, it adopts the other operand's concrete numeric type.
        let lhs_is_lit = matches!(lhs.kind, ExprKind::Literal(_));
        let rhs_is_lit = matches!(rhs.kind, ExprKind::Literal(_));
        let (lt, rt) = if lhs_is_lit != rhs_is_lit {
            if lhs_is_lit {
                (self.adapt_literal(lhs, lt, rt), rt)
            } else {
                (lt, self.adapt_literal(rhs, rt, lt))
            }
        } else {
            (lt, rt)
        };

        let unified = self.unify_or_report(lt, rt, e.span);

        if op.is_comparison() {
            return self.arena.prim(PrimType::Bool);
        }

        // Arithmetic requires a numeric operand type once it is concrete.
        if let Some(p) = self.arena.as_prim(unified) {
            if !p.is_numeric() && p != PrimType::Error && p != PrimType::Any {
                return self.report(Diagnostic::error(
                    ErrorCode::UnsupportedOperation,
                    e.span,
                    format!("operator `{}` is not defined for `{}`", op, p),
                ));
            }
        }
        unified
    }

    fn infer_call(&mut self, e: &Expr, callee: &Expr, args: &[Expr]) -> Type {
        let arg_types: Vec<Type> = args.iter().map(|a| self.infer_expr(a)).collect();

        let callee_ty = self.infer_expr(callee);
        let callee_ty = prune(self.arena, callee_ty);

        if let Some((params, ret)) = self
            .arena
            .as_function(callee_ty)
            .map(|(p, r)| (p.to_vec(), r))
        {
            if params.len() != args.len() {
                let name = match &callee.kind {
                    ExprKind::Ident(n) => n.as_str(),
                    _ => "function",
                };
                return self.report(Diagnostic::error(
                    ErrorCode::ArityMismatch,
                    e.span,
                    format!(
                        "`{}` expects {} argument(s), found {}",
                        name,
                        params.len(),
                        args.len()
                    ),
                ));
            }
            for ((arg, &arg_ty), &param) in args.iter().zip(&arg_types).zip(&params) {
                let arg_ty = self.adapt_literal(arg, arg_ty, param);
                self.unify_or_report(arg_ty, param, arg.span);
            }
            return prune(self.arena, ret);
        }

        // Callee is not (yet) a known function type: constrain it.
        let ret = self.arena.fresh_var();
        let want = self.arena.function(&arg_types, ret);
        self.unify_or_report(callee_ty, want, callee.span);
        prune(self.arena, ret)
    }

    fn check_castable(&mut self, from: Type, to: Type, span: Span) {
        let from = prune(self.arena, from);
        let to = prune(self.arena, to);
        let (fp, tp) = match (self.arena.as_prim(from), self.arena.as_prim(to)) {
            (Some(f), Some(t)) => (f, t),
            // Unresolved operand or a non-primitive: arrays and functions
            // cast to nothing.
            (None, _) => {
                if matches!(
                    self.arena.data(from),
                    crate::types::TypeData::Array { .. } | crate::types::TypeData::Function { .. }
                ) {
                    let fd = self.arena.display(from).to_string();
                    let td = self.arena.display(to).to_string();
                    self.report(Diagnostic::error(
                        ErrorCode::UnsupportedOperation,
                        span,
                        format!("cannot cast `{}` to `{}`", fd, td),
                    ));
                }
                return;
            }
            (_, None) => return,
        };
        if fp == tp || fp == PrimType::Error || fp == PrimType::Any {
            return;
        }
        let ok = (fp.is_numeric() && tp.is_numeric())
            || (fp == PrimType::Bool && tp.is_integer())
            || ((fp.is_numeric() || fp == PrimType::Bool) && tp == PrimType::Str);
        if !ok {
            self.report(Diagnostic::error(
                ErrorCode::UnsupportedOperation,
                span,
                format!("cannot cast `{}` to `{}`", fp, tp),
            ));
        }
    }

    fn infer_stmt(&mut self, s: &Stmt) {
        match &s.kind {
            StmtKind::VarDecl {
                name,
                mutable,
                annotation,
                init,
            } => {
                let ty = match (annotation, init) {
                    (Some(ann), Some(init)) => {
                        let declared = self.resolve_annotation(ann);
                        let init_ty = self.infer_expr(init);
                        // The declared type wins for literal initializers.
                        let init_ty = self.adapt_literal(init, init_ty, declared);
                        self.unify_or_report(init_ty, declared, init.span);
                        declared
                    }
                    (None, Some(init)) => self.infer_expr(init),
                    (Some(ann), None) => self.resolve_annotation(ann),
                    (None, None) => self.report(
                        Diagnostic::error(
                            ErrorCode::TypeAnnotationRequired,
                            s.span,
                            format!(
                                "declaration of `{}` needs a type annotation or initializer",
                                name
                            ),
                        )
                        .with_help("write `let x: i32` or `let x = value`"),
                    ),
                };
                self.decl_types.insert(s.id, ty);
                let scheme = generalize(self.arena, ty);
                self.env.define(name, scheme, *mutable);
            }

            StmtKind::Assign { name, value } => match self.env.lookup(name) {
                Some(binding) => {
                    let mutable = binding.mutable;
                    let var_ty = binding.scheme.body;
                    if !mutable {
                        self.report(
                            Diagnostic::error(
                                ErrorCode::ImmutableAssignment,
                                s.span,
                                format!("cannot assign to immutable variable `{}`", name),
                            )
                            .with_help(format!("declare it as `mut {}`", name)),
                        );
                    }
                    let val_ty = self.infer_expr(value);
                    let val_ty = self.adapt_literal(value, val_ty, var_ty);
                    self.unify_or_report(val_ty, var_ty, value.span);
                }
                None => {
                    // Assignment to an undeclared name declares it mutable.
                    let ty = self.infer_expr(value);
                    self.decl_types.insert(s.id, ty);
                    self.assign_declares.insert(s.id);
                    let scheme = generalize(self.arena, ty);
                    self.env.define(name, scheme, true);
                }
            },

            StmtKind::Print { args, .. } => {
                for a in args {
                    self.infer_expr(a);
                }
            }

            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond_ty = self.infer_expr(cond);
                let bool_ty = self.arena.prim(PrimType::Bool);
                self.unify_or_report(cond_ty, bool_ty, cond.span);
                self.env.push_scope();
                for st in then_body {
                    self.infer_stmt(st);
                }
                self.env.pop_scope();
                if let Some(else_body) = else_body {
                    self.env.push_scope();
                    for st in else_body {
                        self.infer_stmt(st);
                    }
                    self.env.pop_scope();
                }
            }

            StmtKind::While { cond, body } => {
                let cond_ty = self.infer_expr(cond);
                let bool_ty = self.arena.prim(PrimType::Bool);
                self.unify_or_report(cond_ty, bool_ty, cond.span);
                self.env.push_scope();
                for st in body {
                    self.infer_stmt(st);
                }
                self.env.pop_scope();
            }

            StmtKind::ForRange {
                var,
                start,
                end,
                step,
                body,
            } => {
                let start_ty = self.infer_expr(start);
                let end_ty = self.infer_expr(end);
                let end_ty = self.adapt_literal(end, end_ty, start_ty);
                let start_ty = self.adapt_literal(start, start_ty, end_ty);
                let mut t = self.unify_or_report(start_ty, end_ty, s.span);
                if let Some(step) = step {
                    let step_ty = self.infer_expr(step);
                    let step_ty = self.adapt_literal(step, step_ty, t);
                    t = self.unify_or_report(step_ty, t, step.span);
                }
                let t = prune(self.arena, t);
                let var_ty = match self.arena.as_prim(t) {
                    Some(p) if p.is_integer() || p == PrimType::Error => t,
                    Some(p) => self.report(Diagnostic::error(
                        ErrorCode::TypeMismatch,
                        s.span,
                        format!("loop bounds must be integers, found `{}`", p),
                    )),
                    None => {
                        // Unconstrained bounds default to i32.
                        let i32_ty = self.arena.prim(PrimType::I32);
                        self.unify_or_report(t, i32_ty, s.span)
                    }
                };
                self.decl_types.insert(s.id, var_ty);
                self.env.push_scope();
                let scheme = generalize(self.arena, var_ty);
                self.env.define(var, scheme, false);
                for st in body {
                    self.infer_stmt(st);
                }
                self.env.pop_scope();
            }

            StmtKind::ForIter {
                var,
                iterable,
                body,
            } => {
                let it_ty = self.infer_expr(iterable);
                let elem = self.arena.fresh_var();
                let arr = self.arena.array(elem);
                self.unify_or_report(it_ty, arr, iterable.span);
                let var_ty = prune(self.arena, elem);
                self.decl_types.insert(s.id, var_ty);
                self.env.push_scope();
                let scheme = generalize(self.arena, var_ty);
                self.env.define(var, scheme, false);
                for st in body {
                    self.infer_stmt(st);
                }
                self.env.pop_scope();
            }

            StmtKind::Break | StmtKind::Continue => {}

            StmtKind::Function(decl) => {
                let params: Vec<Type> = decl
                    .params
                    .iter()
                    .map(|p| match &p.annotation {
                        Some(ann) => self.resolve_annotation(ann),
                        None => self.arena.prim(PrimType::I32),
                    })
                    .collect();
                let ret = match &decl.ret {
                    Some(ann) => self.resolve_annotation(ann),
                    None => self.arena.prim(PrimType::Void),
                };
                let fn_ty = self.arena.function(&params, ret);
                // Registered before the body so recursion resolves.
                let scheme = generalize(self.arena, fn_ty);
                self.env.define(&decl.name, scheme, false);
                self.fn_sigs.insert(s.id, (params.clone(), ret));

                self.env.push_scope();
                for (p, &ty) in decl.params.iter().zip(&params) {
                    let scheme = generalize(self.arena, ty);
                    self.env.define(&p.name, scheme, false);
                }
                self.ret_stack.push(ret);
                for st in &decl.body {
                    self.infer_stmt(st);
                }
                self.ret_stack.pop();
                self.env.pop_scope();
            }

            StmtKind::Return(value) => {
                let val_ty = match value {
                    Some(v) => self.infer_expr(v),
                    None => self.arena.prim(PrimType::Void),
                };
                if let Some(&ret) = self.ret_stack.last() {
                    let val_ty = match value {
                        Some(v) => self.adapt_literal(v, val_ty, ret),
                        None => val_ty,
                    };
                    let span = value.as_ref().map(|v| v.span).unwrap_or(s.span);
                    self.unify_or_report(val_ty, ret, span);
                }
            }

            StmtKind::Block(body) => {
                self.env.push_scope();
                for st in body {
                    self.infer_stmt(st);
                }
                self.env.pop_scope();
            }

            StmtKind::Expr(e) => {
                self.infer_expr(e);
            }
        }
    }

    // Construction pass: build the typed tree from the side tables. Only
    // reached when zero errors were recorded, so missing table entries are
    // compiler bugs.

    fn resolved(&mut self, id: NodeId) -> Type {
        let ty = *self
            .expr_types
            .get(&id)
            .expect("expression was not visited by inference");
        prune(self.arena, ty)
    }

    fn build_expr<'a>(&mut self, e: &'a Expr) -> TypedExpr<'a> {
        let ty = self.resolved(e.id);
        let kind = match &e.kind {
            ExprKind::Literal(v) => TypedExprKind::Literal(v),
            ExprKind::Ident(name) => TypedExprKind::Ident(name),
            ExprKind::Binary { op, lhs, rhs } => TypedExprKind::Binary {
                op: *op,
                lhs: Box::new(self.build_expr(lhs)),
                rhs: Box::new(self.build_expr(rhs)),
            },
            ExprKind::Unary { op, operand } => TypedExprKind::Unary {
                op: *op,
                operand: Box::new(self.build_expr(operand)),
            },
            ExprKind::Ternary {
                cond,
                then_val,
                else_val,
            } => TypedExprKind::Ternary {
                cond: Box::new(self.build_expr(cond)),
                then_val: Box::new(self.build_expr(then_val)),
                else_val: Box::new(self.build_expr(else_val)),
            },
            ExprKind::Cast { operand, .. } => TypedExprKind::Cast {
                operand: Box::new(self.build_expr(operand)),
                // The node's own resolved type is the cast target.
                target: ty,
            },
            ExprKind::Call { callee, args } => TypedExprKind::Call {
                callee: Box::new(self.build_expr(callee)),
                args: args.iter().map(|a| self.build_expr(a)).collect(),
            },
            ExprKind::ArrayLit(elems) => {
                TypedExprKind::ArrayLit(elems.iter().map(|el| self.build_expr(el)).collect())
            }
            ExprKind::Index { base, index } => TypedExprKind::Index {
                base: Box::new(self.build_expr(base)),
                index: Box::new(self.build_expr(index)),
            },
        };
        TypedExpr {
            source: e,
            ty,
            kind,
        }
    }

    fn build_body<'a>(&mut self, body: &'a [Stmt]) -> Vec<TypedStmt<'a>> {
        body.iter().map(|s| self.build_stmt(s)).collect()
    }

    fn build_stmt<'a>(&mut self, s: &'a Stmt) -> TypedStmt<'a> {
        let kind = match &s.kind {
            StmtKind::VarDecl {
                name,
                mutable,
                init,
                ..
            } => {
                let ty = *self
                    .decl_types
                    .get(&s.id)
                    .expect("declaration was not visited by inference");
                let ty = prune(self.arena, ty);
                TypedStmtKind::VarDecl {
                    name,
                    mutable: *mutable,
                    ty,
                    init: init.as_ref().map(|e| self.build_expr(e)),
                }
            }
            StmtKind::Assign { name, value } => TypedStmtKind::Assign {
                name,
                declares: self.assign_declares.contains(&s.id),
                value: self.build_expr(value),
            },
            StmtKind::Print { args, newline } => TypedStmtKind::Print {
                args: args.iter().map(|a| self.build_expr(a)).collect(),
                newline: *newline,
            },
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => TypedStmtKind::If {
                cond: self.build_expr(cond),
                then_body: self.build_body(then_body),
                else_body: else_body.as_ref().map(|b| self.build_body(b)),
            },
            StmtKind::While { cond, body } => TypedStmtKind::While {
                cond: self.build_expr(cond),
                body: self.build_body(body),
            },
            StmtKind::ForRange {
                var,
                start,
                end,
                step,
                body,
            } => {
                let var_ty = *self
                    .decl_types
                    .get(&s.id)
                    .expect("loop variable was not visited by inference");
                let var_ty = prune(self.arena, var_ty);
                TypedStmtKind::ForRange {
                    var,
                    var_ty,
                    start: self.build_expr(start),
                    end: self.build_expr(end),
                    step: step.as_ref().map(|e| self.build_expr(e)),
                    body: self.build_body(body),
                }
            }
            StmtKind::ForIter {
                var,
                iterable,
                body,
            } => {
                let var_ty = *self
                    .decl_types
                    .get(&s.id)
                    .expect("loop variable was not visited by inference");
                let var_ty = prune(self.arena, var_ty);
                TypedStmtKind::ForIter {
                    var,
                    var_ty,
                    iterable: self.build_expr(iterable),
                    body: self.build_body(body),
                }
            }
            StmtKind::Break => TypedStmtKind::Break,
            StmtKind::Continue => TypedStmtKind::Continue,
            StmtKind::Function(decl) => {
                let (params, ret) = self
                    .fn_sigs
                    .get(&s.id)
                    .cloned()
                    .expect("function was not visited by inference");
                TypedStmtKind::Function(TypedFunction {
                    name: &decl.name,
                    params: decl
                        .params
                        .iter()
                        .zip(params)
                        .map(|(p, ty)| (p.name.as_str(), ty))
                        .collect(),
                    ret,
                    body: self.build_body(&decl.body),
                })
            }
            StmtKind::Return(value) => {
                TypedStmtKind::Return(value.as_ref().map(|e| self.build_expr(e)))
            }
            StmtKind::Block(body) => TypedStmtKind::Block(self.build_body(body)),
            StmtKind::Expr(e) => TypedStmtKind::Expr(self.build_expr(e)),
        };
        TypedStmt { source: s, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Builder;
    use crate::diagnostic::Diagnostics;

    fn infer_ok(program: &Program) -> (TypeArena, TypedProgram) {
        let mut arena = TypeArena::new();
        let mut diags = Diagnostics::new();
        let typed = infer_program(&mut arena, program, &mut diags)
            .expect("expected inference to succeed");
        (arena, typed)
    }

    fn infer_errors(program: &Program) -> Vec<Diagnostic> {
        let mut arena = TypeArena::new();
        let mut diags = Diagnostics::new();
        let res = infer_program(&mut arena, program, &mut diags);
        assert!(res.is_err(), "expected inference to fail");
        diags.into_vec()
    }

    #[test]
    fn unbound_variable() {
        let mut b = Builder::new();
        let undef = b.at(1, 7).ident("undef");
        let print = b.print(vec![undef]);
        let program = b.program(vec![print]);
        let errs = infer_errors(&program);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code, ErrorCode::UnboundVariable);
        assert_eq!(errs[0].span.line, 1);
        assert_eq!(errs[0].span.column, 7);
    }

    #[test]
    fn mixed_arithmetic_is_a_type_mismatch() {
        let mut b = Builder::new();
        let x_init = b.int(1);
        let x = b.let_("x", x_init);
        let y_init = b.lit(Value::F64(2.0));
        let y = b.let_("y", y_init);
        let xr = b.ident("x");
        let yr = b.ident("y");
        let sum = b.at(3, 9).binary(BinOp::Add, xr, yr);
        let print = b.print(vec![sum]);
        let program = b.program(vec![x, y, print]);
        let errs = infer_errors(&program);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code, ErrorCode::TypeMismatch);
        assert!(errs[0].message.contains("i32"));
        assert!(errs[0].message.contains("f64"));
        assert_eq!(errs[0].span.line, 3);
    }

    #[test]
    fn literal_adapts_to_annotated_type() {
        let mut b = Builder::new();
        let init = b.int(1);
        let ann = b.annotation(TypeExpr::I64);
        let decl = b.stmt(StmtKind::VarDecl {
            name: "x".to_string(),
            mutable: false,
            annotation: Some(ann),
            init: Some(init),
        });
        let xr = b.ident("x");
        let one = b.int(1);
        let sum = b.binary(BinOp::Add, xr, one);
        let stmt = b.stmt(StmtKind::Expr(sum));
        let program = b.program(vec![decl, stmt]);
        let (arena, typed) = infer_ok(&program);
        // `x + 1` types as i64: the bare i32 literal adapted.
        match &typed.stmts[1].kind {
            TypedStmtKind::Expr(e) => {
                assert_eq!(e.ty, arena.prim(PrimType::I64));
            }
            _ => panic!("expected expression statement"),
        }
    }

    #[test]
    fn immutable_assignment_rejected() {
        let mut b = Builder::new();
        let init = b.int(1);
        let decl = b.let_("x", init);
        let two = b.int(2);
        let assign = b.at(2, 1).assign("x", two);
        let program = b.program(vec![decl, assign]);
        let errs = infer_errors(&program);
        assert_eq!(errs[0].code, ErrorCode::ImmutableAssignment);
    }

    #[test]
    fn call_arity_checked() {
        let mut b = Builder::new();
        let body = vec![];
        let f = b.stmt(StmtKind::Function(crate::ast::FunctionDecl {
            name: "f".to_string(),
            params: vec![crate::ast::Param {
                name: "a".to_string(),
                annotation: None,
                span: Span::none(),
            }],
            ret: None,
            body,
        }));
        let callee = b.ident("f");
        let call = b.call(callee, vec![]);
        let stmt = b.stmt(StmtKind::Expr(call));
        let program = b.program(vec![f, stmt]);
        let errs = infer_errors(&program);
        assert_eq!(errs[0].code, ErrorCode::ArityMismatch);
    }

    #[test]
    fn annotation_or_initializer_required() {
        let mut b = Builder::new();
        let decl = b.stmt(StmtKind::VarDecl {
            name: "x".to_string(),
            mutable: true,
            annotation: None,
            init: None,
        });
        let program = b.program(vec![decl]);
        let errs = infer_errors(&program);
        assert_eq!(errs[0].code, ErrorCode::TypeAnnotationRequired);
    }

    #[test]
    fn multiple_errors_collected() {
        let mut b = Builder::new();
        let a = b.ident("a");
        let p1 = b.print(vec![a]);
        let c = b.ident("c");
        let p2 = b.print(vec![c]);
        let program = b.program(vec![p1, p2]);
        let errs = infer_errors(&program);
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn for_range_var_is_integer() {
        let mut b = Builder::new();
        let start = b.int(0);
        let end = b.int(10);
        let i = b.ident("i");
        let body = vec![b.print(vec![i])];
        let lp = b.for_range("i", start, end, body);
        let program = b.program(vec![lp]);
        let (arena, typed) = infer_ok(&program);
        match &typed.stmts[0].kind {
            TypedStmtKind::ForRange { var_ty, .. } => {
                assert_eq!(*var_ty, arena.prim(PrimType::I32));
            }
            _ => panic!("expected for-range"),
        }
    }
}
