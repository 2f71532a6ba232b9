//! End-to-end compilation scenarios: source-shaped ASTs in, observable
//! bytecode or diagnostics out.

use capstan_codegen::ast::{BinOp, Builder, Program, StmtKind};
use capstan_codegen::bytecode::{CompiledUnit, InstIter, Opcode};
use capstan_codegen::value::Value;
use capstan_codegen::{Context, Diagnostics, ErrorCode, Flags, OptLevel};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compile(program: &Program) -> CompiledUnit {
    init_logging();
    let mut ctx = Context::new();
    let mut diags = Diagnostics::new();
    ctx.compile(program, &mut diags)
        .expect("program should compile")
}

fn compile_err(program: &Program) -> Vec<capstan_codegen::Diagnostic> {
    init_logging();
    let mut ctx = Context::new();
    let mut diags = Diagnostics::new();
    let result = ctx.compile(program, &mut diags);
    assert!(result.is_err(), "expected compilation to fail");
    diags.into_vec()
}

fn ops_of(code: &[u8]) -> Vec<(usize, Opcode, Vec<u8>)> {
    InstIter::new(code)
        .map(|i| (i.offset, i.op, i.operands.to_vec()))
        .collect()
}

fn count_op(code: &[u8], op: Opcode) -> usize {
    InstIter::new(code).filter(|i| i.op == op).count()
}

/// `for i in 0..4: print(i * 2)` unrolls into four constant prints.
#[test]
fn constant_folded_unroll() {
    let mut b = Builder::new();
    let start = b.int(0);
    let end = b.int(4);
    let i = b.ident("i");
    let two = b.int(2);
    let prod = b.binary(BinOp::Mul, i, two);
    let body = vec![b.print(vec![prod])];
    let lp = b.for_range("i", start, end, body);
    let program = b.program(vec![lp]);

    let unit = compile(&program);
    let insts = ops_of(&unit.main.code);

    // No loop machinery survives.
    assert_eq!(count_op(&unit.main.code, Opcode::Loop), 0);
    assert_eq!(count_op(&unit.main.code, Opcode::JumpIfNotR), 0);
    assert_eq!(count_op(&unit.main.code, Opcode::MulI32), 0);

    // Four load+print pairs with the folded values, then HALT.
    assert_eq!(insts.len(), 9);
    let mut printed = Vec::new();
    for pair in insts.chunks(2).take(4) {
        assert_eq!(pair[0].1, Opcode::LoadI32Const);
        assert_eq!(pair[1].1, Opcode::PrintR);
        let idx = u16::from_be_bytes([pair[0].2[1], pair[0].2[2]]);
        printed.push(unit.pool.get(idx).clone());
    }
    assert_eq!(
        printed,
        vec![Value::I32(0), Value::I32(2), Value::I32(4), Value::I32(6)]
    );
    assert_eq!(insts.last().unwrap().1, Opcode::Halt);
}

/// `let k = 10; mut s = 0; for i in 0..100: s = s + (k * k + 7)` hoists
/// the invariant ahead of the loop.
#[test]
fn licm_hoists_invariant() {
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

    let mut ctx = Context::new();
    let mut diags = Diagnostics::new();
    let unit = ctx.compile(&program, &mut diags).expect("compiles");
    assert_eq!(ctx.stats().invariants_hoisted, 1);
    assert_eq!(ctx.stats().loops_unrolled, 0);

    let insts = ops_of(&unit.main.code);

    // The multiply happens exactly once, before the back edge region; the
    // body recomputes nothing.
    assert_eq!(count_op(&unit.main.code, Opcode::MulI32), 1);
    let mul_at = insts.iter().find(|i| i.1 == Opcode::MulI32).unwrap().0;
    let loop_at = insts.iter().find(|i| i.1 == Opcode::Loop).unwrap().0;
    let header_cmp_at = insts.iter().find(|i| i.1 == Opcode::LtI32).unwrap().0;
    assert!(mul_at < header_cmp_at);
    assert!(header_cmp_at < loop_at);

    // Exactly one load of the constant 7 in the whole stream.
    let seven_loads = InstIter::new(&unit.main.code)
        .filter(|i| {
            i.op.is_load_const() && {
                let idx = u16::from_be_bytes([i.operands[1], i.operands[2]]);
                *unit.pool.get(idx) == Value::I32(7)
            }
        })
        .count();
    assert_eq!(seven_loads, 1);
}

/// `print(undef)` reports `UnboundVariable` and emits nothing.
#[test]
fn unbound_variable_no_bytecode() {
    let mut b = Builder::new();
    let undef = b.at(1, 7).ident("undef");
    let print = b.print(vec![undef]);
    let program = b.program(vec![print]);

    let errs = compile_err(&program);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].code, ErrorCode::UnboundVariable);
    assert_eq!(errs[0].span.line, 1);
    assert_eq!(errs[0].span.column, 7);
}

/// `let x: i32 = 1; let y: f64 = 2.0; print(x + y)` is a type mismatch at
/// the `+`.
#[test]
fn mixed_types_rejected() {
    use capstan_codegen::ast::TypeExpr;
    let mut b = Builder::new();
    let one = b.int(1);
    let ann_i32 = b.annotation(TypeExpr::I32);
    let x = b.stmt(StmtKind::VarDecl {
        name: "x".to_string(),
        mutable: false,
        annotation: Some(ann_i32),
        init: Some(one),
    });
    let two = b.lit(Value::F64(2.0));
    let ann_f64 = b.annotation(TypeExpr::F64);
    let y = b.stmt(StmtKind::VarDecl {
        name: "y".to_string(),
        mutable: false,
        annotation: Some(ann_f64),
        init: Some(two),
    });
    let xr = b.ident("x");
    let yr = b.ident("y");
    let sum = b.at(3, 11).binary(BinOp::Add, xr, yr);
    let print = b.print(vec![sum]);
    let program = b.program(vec![x, y, print]);

    let errs = compile_err(&program);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].code, ErrorCode::TypeMismatch);
    assert!(errs[0].message.contains("i32"));
    assert!(errs[0].message.contains("f64"));
    assert_eq!((errs[0].span.line, errs[0].span.column), (3, 11));
}

/// `mut i = 0; while i < 10: { if i == 5: break; i = i + 1 }` patches the
/// break to the instruction just past the backward LOOP.
#[test]
fn break_patches_past_loop_back_edge() {
    let mut b = Builder::new();
    let zero = b.int(0);
    let i_decl = b.mut_("i", zero);
    let i1 = b.ident("i");
    let ten = b.int(10);
    let cond = b.binary(BinOp::Lt, i1, ten);
    let i2 = b.ident("i");
    let five = b.int(5);
    let is_five = b.binary(BinOp::Eq, i2, five);
    let brk = b.stmt(StmtKind::Break);
    let if_break = b.stmt(StmtKind::If {
        cond: is_five,
        then_body: vec![brk],
        else_body: None,
    });
    let i3 = b.ident("i");
    let one = b.int(1);
    let next = b.binary(BinOp::Add, i3, one);
    let bump = b.assign("i", next);
    let wl = b.stmt(StmtKind::While {
        cond,
        body: vec![if_break, bump],
    });
    let program = b.program(vec![i_decl, wl]);

    let unit = compile(&program);
    let insts = ops_of(&unit.main.code);

    // Exactly one backward edge.
    assert_eq!(count_op(&unit.main.code, Opcode::Loop), 1);
    let loop_off = insts.iter().find(|i| i.1 == Opcode::Loop).unwrap().0;
    let exit = loop_off + Opcode::Loop.size();

    // The break is an unconditional JUMP landing exactly at the exit.
    let jumps: Vec<_> = insts.iter().filter(|i| i.1 == Opcode::Jump).collect();
    assert_eq!(jumps.len(), 1);
    let rel = u16::from_be_bytes([jumps[0].2[0], jumps[0].2[1]]) as usize;
    assert_eq!(jumps[0].0 + Opcode::Jump.size() + rel, exit);

    // The while condition exits to the same place.
    let exits_to: Vec<usize> = insts
        .iter()
        .filter(|i| i.1 == Opcode::JumpIfNotR)
        .map(|i| i.0 + i.1.size() + u16::from_be_bytes([i.2[1], i.2[2]]) as usize)
        .collect();
    assert!(exits_to.contains(&exit));
}

/// Strength reduction rewrites `i * 8` into a shift inside a loop that is
/// too long to unroll.
#[test]
fn strength_reduction_emits_shift() {
    let mut b = Builder::new();
    let zero = b.int(0);
    let s_decl = b.mut_("s", zero);
    let start = b.int(0);
    let end = b.int(1000);
    let i = b.ident("i");
    let eight = b.int(8);
    let prod = b.binary(BinOp::Mul, i, eight);
    let s_ref = b.ident("s");
    let sum = b.binary(BinOp::Add, s_ref, prod);
    let assign = b.assign("s", sum);
    let lp = b.for_range("i", start, end, vec![assign]);
    let program = b.program(vec![s_decl, lp]);

    let mut ctx = Context::new();
    let mut diags = Diagnostics::new();
    let unit = ctx.compile(&program, &mut diags).expect("compiles");

    assert_eq!(ctx.stats().strength_reductions_applied, 1);
    assert_eq!(count_op(&unit.main.code, Opcode::MulI32), 0);
    let shl = InstIter::new(&unit.main.code)
        .find(|i| i.op == Opcode::ShlI32)
        .expect("shift emitted");
    assert_eq!(shl.operands[2], 3, "8 == 1 << 3");
}

/// Functions: declaration produces a chunk, calls marshal arguments into a
/// contiguous window.
#[test]
fn function_declaration_and_call() {
    use capstan_codegen::ast::{FunctionDecl, Param, Span, TypeExpr};
    let mut b = Builder::new();
    let a1 = b.ident("a");
    let b1 = b.ident("b");
    let sum = b.binary(BinOp::Add, a1, b1);
    let ret = b.stmt(StmtKind::Return(Some(sum)));
    let ret_ann = b.annotation(TypeExpr::I32);
    let f = b.stmt(StmtKind::Function(FunctionDecl {
        name: "add".to_string(),
        params: vec![
            Param {
                name: "a".to_string(),
                annotation: None,
                span: Span::none(),
            },
            Param {
                name: "b".to_string(),
                annotation: None,
                span: Span::none(),
            },
        ],
        ret: Some(ret_ann),
        body: vec![ret],
    }));
    let callee = b.ident("add");
    let two = b.int(2);
    let three = b.int(3);
    let call = b.call(callee, vec![two, three]);
    let print = b.print(vec![call]);
    let program = b.program(vec![f, print]);

    let unit = compile(&program);
    assert_eq!(unit.functions.len(), 1);
    let chunk = &unit.functions[0];
    assert_eq!(chunk.name, "add");
    assert_eq!(chunk.arity, 2);
    // The body adds the two parameter registers and returns.
    assert_eq!(count_op(&chunk.code, Opcode::AddI32), 1);
    assert!(count_op(&chunk.code, Opcode::ReturnR) >= 1);

    // The caller emits one CALL with argc 2 and a function-value load.
    let call_inst = InstIter::new(&unit.main.code)
        .find(|i| i.op == Opcode::Call)
        .expect("call emitted");
    assert_eq!(call_inst.operands[2], 2);
    assert!(unit
        .pool
        .iter()
        .any(|v| matches!(v, Value::Function(id) if id.0 == 0)));
}

/// Compilation is deterministic: the same program compiles to identical
/// bytes every time.
#[test]
fn deterministic_output() {
    let build = || {
        let mut b = Builder::new();
        let k_init = b.int(3);
        let k = b.let_("k", k_init);
        let start = b.int(0);
        let end = b.int(50);
        let kr = b.ident("k");
        let k2 = b.ident("k");
        let kk = b.binary(BinOp::Mul, kr, k2);
        let i = b.ident("i");
        let sum = b.binary(BinOp::Add, kk, i);
        let body = vec![b.print(vec![sum])];
        let lp = b.for_range("i", start, end, body);
        b.program(vec![k, lp])
    };
    let p1 = build();
    let p2 = build();
    let u1 = compile(&p1);
    let u2 = compile(&p2);
    assert_eq!(u1.main.code, u2.main.code);
    assert_eq!(u1.functions.len(), u2.functions.len());
}

/// The source maps stay aligned with the code through peephole.
#[test]
fn line_maps_cover_every_byte() {
    let mut b = Builder::new();
    let five = b.at(2, 5).int(5);
    let x = b.at(2, 1).let_("x", five);
    let xr = b.at(3, 9).ident("x");
    let print = b.at(3, 1).print(vec![xr]);
    let program = b.program(vec![x, print]);

    let unit = compile(&program);
    assert_eq!(unit.main.line_map.len(), unit.main.code.len());
    assert_eq!(unit.main.col_map.len(), unit.main.code.len());
    assert_eq!(unit.main.file_map.len(), unit.main.code.len());
    // The load that survives fusion carries a real line number.
    assert!(unit.main.line_map[0] > 0);
}

/// No placeholder operands survive: every decoded jump lands on an
/// instruction boundary inside the chunk.
#[test]
fn all_jumps_resolve_inside_chunk() {
    let mut b = Builder::new();
    let zero = b.int(0);
    let i_decl = b.mut_("i", zero);
    let i1 = b.ident("i");
    let hundred = b.int(100);
    let cond = b.binary(BinOp::Lt, i1, hundred);
    let i2 = b.ident("i");
    let one = b.int(1);
    let next = b.binary(BinOp::Add, i2, one);
    let bump = b.assign("i", next);
    let cont = b.stmt(StmtKind::Continue);
    let i3 = b.ident("i");
    let fifty = b.int(50);
    let gate = b.binary(BinOp::Eq, i3, fifty);
    let skip = b.stmt(StmtKind::If {
        cond: gate,
        then_body: vec![cont],
        else_body: None,
    });
    let wl = b.stmt(StmtKind::While {
        cond,
        body: vec![bump, skip],
    });
    let program = b.program(vec![i_decl, wl]);

    let unit = compile(&program);
    let boundaries: Vec<usize> = InstIter::new(&unit.main.code).map(|i| i.offset).collect();
    let len = unit.main.code.len();
    for inst in InstIter::new(&unit.main.code) {
        let next_ip = inst.offset + inst.op.size();
        let target = match inst.op {
            Opcode::Jump => Some(next_ip + u16::from_be_bytes([inst.operands[0], inst.operands[1]]) as usize),
            Opcode::JumpIfNotR => Some(next_ip + u16::from_be_bytes([inst.operands[1], inst.operands[2]]) as usize),
            Opcode::Loop => Some(next_ip - u16::from_be_bytes([inst.operands[0], inst.operands[1]]) as usize),
            _ => None,
        };
        if let Some(t) = target {
            assert!(
                t == len || boundaries.contains(&t),
                "jump at {} targets {} which is not an instruction boundary",
                inst.offset,
                t
            );
        }
    }
}

/// Disabling optimization leaves a plain loop in place.
#[test]
fn opt_level_none_keeps_loops() {
    let mut b = Builder::new();
    let start = b.int(0);
    let end = b.int(4);
    let i = b.ident("i");
    let body = vec![b.print(vec![i])];
    let lp = b.for_range("i", start, end, body);
    let program = b.program(vec![lp]);

    let mut ctx = Context::with_flags(Flags {
        opt_level: OptLevel::None,
        ..Flags::default()
    });
    let mut diags = Diagnostics::new();
    let unit = ctx.compile(&program, &mut diags).expect("compiles");
    assert_eq!(count_op(&unit.main.code, Opcode::Loop), 1);
    assert_eq!(ctx.stats().loops_unrolled, 0);
}

/// `break` outside a loop is a lowering error with its own code.
#[test]
fn break_outside_loop_rejected() {
    let mut b = Builder::new();
    let brk = b.at(1, 1).stmt(StmtKind::Break);
    let program = b.program(vec![brk]);
    let errs = compile_err(&program);
    assert_eq!(errs[0].code, ErrorCode::ControlFlowOutsideLoop);
}

/// Arrays: literals construct, indexing in a constant-range loop skips the
/// bounds check.
#[test]
fn array_indexing_with_bounds_elision() {
    let mut b = Builder::new();
    let e0 = b.int(10);
    let e1 = b.int(20);
    let e2 = b.int(30);
    let arr = b.expr(capstan_codegen::ast::ExprKind::ArrayLit(vec![e0, e1, e2]));
    let a_decl = b.let_("a", arr);
    let start = b.int(0);
    let end = b.int(3);
    let a_ref = b.ident("a");
    let i = b.ident("i");
    let elem = b.expr(capstan_codegen::ast::ExprKind::Index {
        base: Box::new(a_ref),
        index: Box::new(i),
    });
    let body = vec![b.print(vec![elem])];
    let lp = b.for_range("i", start, end, body);
    let program = b.program(vec![a_decl, lp]);

    let unit = compile(&program);
    assert_eq!(count_op(&unit.main.code, Opcode::NewArray), 1);
    // The loop unrolls (3 iterations), but the index is a constant each
    // time, so the accesses still go through the array ops.
    let fast = count_op(&unit.main.code, Opcode::ArrayGetFast);
    let checked = count_op(&unit.main.code, Opcode::ArrayGet);
    assert_eq!(fast + checked, 3);
}
