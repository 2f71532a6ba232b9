//! Peephole optimization.
//!
//! A post-codegen pass over the finished instruction stream. Three
//! rewrites:
//!
//! 1. `LOAD_CONST rt, k; MOVE rd, rt` fuses to `LOAD_CONST rd, k` when
//!    `rt` is dead afterwards and neither instruction is a jump target;
//! 2. `MOVE r, r` disappears;
//! 3. reloading a constant a register is already known to hold disappears
//!    (a tiny abstract interpretation tracks the last constant index per
//!    register, with a conservative full reset at control flow, at jump
//!    targets, and at any opcode the tracker doesn't model).
//!
//! Deleting bytes shifts every later offset, so the pass works on a
//! decoded instruction list: jumps are resolved to instruction indices up
//! front and re-encoded against the compacted layout afterwards, and the
//! line/column/file maps are rebuilt alongside. Passes repeat until
//! nothing changes, which also makes the whole pass idempotent.

use crate::bytecode::{Chunk, InstIter, Opcode};
use crate::context::Stats;
use crate::fx::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Run the peephole pass over one chunk until it reaches a fixed point.
pub fn run(chunk: &mut Chunk, stats: &mut Stats) {
    let before = chunk.code.len();
    while pass(chunk, stats) {}
    if chunk.code.len() != before {
        log::debug!(
            "peephole: {} shrank {} -> {} bytes",
            chunk.name,
            before,
            chunk.code.len()
        );
    }
}

struct PInst {
    op: Opcode,
    operands: SmallVec<[u8; 5]>,
    /// Resolved jump target as an instruction index, for control transfers.
    target: Option<usize>,
    line: i32,
    col: i32,
    file: u32,
}

/// One rewrite pass. Returns true if anything changed.
fn pass(chunk: &mut Chunk, stats: &mut Stats) -> bool {
    let mut insts = decode(chunk);
    let targets = match resolve_targets(&mut insts, &chunk.code) {
        Some(targets) => targets,
        None => return false,
    };

    let mut keep = vec![true; insts.len()];
    let mut changed = false;

    // Constant-load tracking: register -> pool index it currently holds.
    let mut known: FxHashMap<u8, u16> = FxHashMap::default();

    let mut i = 0;
    while i < insts.len() {
        if targets.contains(&i) {
            known.clear();
        }
        let op = insts[i].op;
        let ops: SmallVec<[u8; 5]> = insts[i].operands.clone();

        // Self-move elimination.
        if op == Opcode::Move && ops[0] == ops[1] {
            keep[i] = false;
            changed = true;
            stats.moves_eliminated += 1;
            i += 1;
            continue;
        }

        // Load+move fusion.
        if op.is_load_const() {
            let rt = ops[0];
            let idx = u16::from_be_bytes([ops[1], ops[2]]);

            // Redundant reload of a known constant.
            if known.get(&rt) == Some(&idx) {
                keep[i] = false;
                changed = true;
                stats.redundant_loads_elided += 1;
                i += 1;
                continue;
            }

            let fuse_into = match insts.get(i + 1) {
                Some(next)
                    if next.op == Opcode::Move
                        && next.operands[1] == rt
                        && next.operands[0] != rt
                        && !targets.contains(&(i + 1))
                        && !targets.contains(&i) =>
                {
                    Some(next.operands[0])
                }
                _ => None,
            };
            if let Some(rd) = fuse_into {
                if temp_dead_after(&insts, i + 2, rt) {
                    insts[i].operands[0] = rd;
                    keep[i + 1] = false;
                    changed = true;
                    stats.loads_fused += 1;
                    stats.moves_eliminated += 1;
                    known.remove(&rt);
                    known.insert(rd, idx);
                    i += 2;
                    continue;
                }
            }
            known.insert(rt, idx);
            i += 1;
            continue;
        }

        track(op, &ops, &mut known);
        i += 1;
    }

    if !changed {
        return false;
    }
    encode(chunk, &insts, &keep);
    true
}

/// Is the scratch register dead from `from` onwards (no read before the
/// next write)?
fn temp_dead_after(insts: &[PInst], from: usize, reg: u8) -> bool {
    for inst in &insts[from..] {
        if reads_reg(inst.op, &inst.operands, reg) {
            return false;
        }
        if writes_reg(inst.op, &inst.operands) == Some(reg) {
            return true;
        }
    }
    true
}

/// Update the constant-tracking state for one modeled instruction.
fn track(op: Opcode, ops: &[u8], known: &mut FxHashMap<u8, u16>) {
    match op {
        Opcode::Move => {
            match known.get(&ops[1]).copied() {
                Some(idx) => {
                    known.insert(ops[0], idx);
                }
                None => {
                    known.remove(&ops[0]);
                }
            }
        }
        _ if op.is_control_flow() => known.clear(),
        _ => match writes_reg(op, ops) {
            Some(dst) => {
                known.remove(&dst);
            }
            // Not modeled: conservative reset.
            None if writes_anything(op) => known.clear(),
            None => {}
        },
    }
}

/// The byte register written by this instruction, when it writes exactly
/// one byte-addressable register.
fn writes_reg(op: Opcode, ops: &[u8]) -> Option<u8> {
    use Opcode::*;
    match op {
        _ if op.is_load_const() => Some(ops[0]),
        Move => Some(ops[0]),
        LoadConstExt => {
            let dst = u16::from_be_bytes([ops[0], ops[1]]);
            if dst <= 0xff {
                Some(dst as u8)
            } else {
                None
            }
        }
        MoveExt => {
            let dst = u16::from_be_bytes([ops[0], ops[1]]);
            if dst <= 0xff {
                Some(dst as u8)
            } else {
                None
            }
        }
        AddI32 | SubI32 | MulI32 | DivI32 | RemI32 | ShlI32 | AddI64 | SubI64 | MulI64
        | DivI64 | RemI64 | ShlI64 | AddU32 | SubU32 | MulU32 | DivU32 | RemU32 | AddU64
        | SubU64 | MulU64 | DivU64 | RemU64 | AddF64 | SubF64 | MulF64 | DivF64 | CmpEq
        | CmpNe | CmpLt | CmpLe | CmpGt | CmpGe | LtI32 | LeI32 | GtI32 | GeI32 | BoolAnd
        | BoolOr | NewArray | ArrayGet | ArrayGetFast => Some(ops[0]),
        NegI32 | NegI64 | NegF64 | BoolNot | ArrayLen | I32ToI64 | I32ToU32 | I32ToU64
        | I32ToF64 | I64ToI32 | I64ToU32 | I64ToU64 | I64ToF64 | U32ToI32 | U32ToI64
        | U32ToU64 | U32ToF64 | U64ToI32 | U64ToI64 | U64ToU32 | U64ToF64 | F64ToI32
        | F64ToI64 | F64ToU32 | F64ToU64 | BoolToI32 | I32ToStr | I64ToStr | U32ToStr
        | U64ToStr | F64ToStr | BoolToStr => Some(ops[0]),
        IncI32 => Some(ops[0]),
        Call => Some(ops[3]),
        _ => None,
    }
}

/// Does the instruction write any register at all? Used to decide between
/// "invalidate one register" and "leave state alone" for unmodeled ops.
fn writes_anything(op: Opcode) -> bool {
    !matches!(
        op,
        Opcode::Jump
            | Opcode::JumpShort
            | Opcode::JumpIfNotR
            | Opcode::JumpIfNotShortR
            | Opcode::Loop
            | Opcode::ReturnR
            | Opcode::ReturnVoid
            | Opcode::PrintR
            | Opcode::PrintMultiR
            | Opcode::Halt
    )
}

/// Does the instruction read byte register `r`?
fn reads_reg(op: Opcode, ops: &[u8], r: u8) -> bool {
    use Opcode::*;
    let in_window = |first: u8, count: u8| r >= first && (r as u16) < first as u16 + count as u16;
    match op {
        _ if op.is_load_const() => false,
        LoadConstExt => false,
        Move => ops[1] == r,
        MoveExt => {
            let src = u16::from_be_bytes([ops[2], ops[3]]);
            src == u16::from(r)
        }
        AddI32 | SubI32 | MulI32 | DivI32 | RemI32 | AddI64 | SubI64 | MulI64 | DivI64
        | RemI64 | AddU32 | SubU32 | MulU32 | DivU32 | RemU32 | AddU64 | SubU64 | MulU64
        | DivU64 | RemU64 | AddF64 | SubF64 | MulF64 | DivF64 | CmpEq | CmpNe | CmpLt
        | CmpLe | CmpGt | CmpGe | LtI32 | LeI32 | GtI32 | GeI32 | BoolAnd | BoolOr
        | ArrayGet | ArrayGetFast => ops[1] == r || ops[2] == r,
        ShlI32 | ShlI64 => ops[1] == r,
        NegI32 | NegI64 | NegF64 | BoolNot | ArrayLen | I32ToI64 | I32ToU32 | I32ToU64
        | I32ToF64 | I64ToI32 | I64ToU32 | I64ToU64 | I64ToF64 | U32ToI32 | U32ToI64
        | U32ToU64 | U32ToF64 | U64ToI32 | U64ToI64 | U64ToU32 | U64ToF64 | F64ToI32
        | F64ToI64 | F64ToU32 | F64ToU64 | BoolToI32 | I32ToStr | I64ToStr | U32ToStr
        | U64ToStr | F64ToStr | BoolToStr => ops[1] == r,
        IncI32 => ops[0] == r,
        NewArray => in_window(ops[1], ops[2]),
        JumpIfNotR | JumpIfNotShortR => ops[0] == r,
        Call => ops[0] == r || in_window(ops[1], ops[2]),
        ReturnR | PrintR => ops[0] == r,
        PrintMultiR => in_window(ops[0], ops[1]),
        _ => false,
    }
}

fn decode(chunk: &Chunk) -> Vec<PInst> {
    InstIter::new(&chunk.code)
        .map(|inst| PInst {
            op: inst.op,
            operands: SmallVec::from_slice(inst.operands),
            target: None,
            line: chunk.line_map[inst.offset],
            col: chunk.col_map[inst.offset],
            file: chunk.file_map[inst.offset],
        })
        .collect()
}

/// Resolve every jump operand to an instruction index and collect the set
/// of target indices. Bails out (`None`) if a target doesn't land on an
/// instruction boundary; such a stream is left untouched.
fn resolve_targets(insts: &mut [PInst], code: &[u8]) -> Option<FxHashSet<usize>> {
    let mut index_of: FxHashMap<usize, usize> = FxHashMap::default();
    let mut offset = 0usize;
    for (i, inst) in insts.iter().enumerate() {
        index_of.insert(offset, i);
        offset += inst.op.size();
    }
    // Jumps may target the end of the stream.
    index_of.insert(offset, insts.len());

    let mut targets = FxHashSet::default();
    let mut offset = 0usize;
    for inst in insts.iter_mut() {
        let size = inst.op.size();
        let next_ip = offset + size;
        let target_offset = match inst.op {
            Opcode::Jump => Some(next_ip + u16::from_be_bytes([inst.operands[0], inst.operands[1]]) as usize),
            Opcode::JumpShort => Some(next_ip + inst.operands[0] as usize),
            Opcode::JumpIfNotR => Some(next_ip + u16::from_be_bytes([inst.operands[1], inst.operands[2]]) as usize),
            Opcode::JumpIfNotShortR => Some(next_ip + inst.operands[1] as usize),
            Opcode::Loop => {
                let dist = u16::from_be_bytes([inst.operands[0], inst.operands[1]]) as usize;
                next_ip.checked_sub(dist)
            }
            _ => None,
        };
        if let Some(t) = target_offset {
            let idx = *index_of.get(&t)?;
            inst.target = Some(idx);
            targets.insert(idx);
        }
        offset = next_ip;
    }
    debug_assert_eq!(offset, code.len());
    Some(targets)
}

/// Re-encode the kept instructions, rewriting jump operands against the
/// compacted layout and rebuilding the source maps.
fn encode(chunk: &mut Chunk, insts: &[PInst], keep: &[bool]) {
    // New offset of each instruction index; deleted instructions forward
    // to the next kept one.
    let mut new_offset = vec![0u32; insts.len() + 1];
    let mut off = 0u32;
    for (i, inst) in insts.iter().enumerate() {
        new_offset[i] = off;
        if keep[i] {
            off += inst.op.size() as u32;
        }
    }
    new_offset[insts.len()] = off;
    // Forward deleted instructions to the next kept offset (already the
    // case: a deleted instruction contributes no size, so its offset
    // equals its successor's).

    let mut code = Vec::with_capacity(off as usize);
    let mut line_map = Vec::with_capacity(off as usize);
    let mut col_map = Vec::with_capacity(off as usize);
    let mut file_map = Vec::with_capacity(off as usize);

    for (i, inst) in insts.iter().enumerate() {
        if !keep[i] {
            continue;
        }
        let mut operands: SmallVec<[u8; 5]> = inst.operands.clone();
        if let Some(target_idx) = inst.target {
            let target = new_offset[target_idx];
            let next_ip = new_offset[i] + inst.op.size() as u32;
            match inst.op {
                Opcode::Jump => {
                    let [hi, lo] = ((target - next_ip) as u16).to_be_bytes();
                    operands[0] = hi;
                    operands[1] = lo;
                }
                Opcode::JumpShort => {
                    operands[0] = (target - next_ip) as u8;
                }
                Opcode::JumpIfNotR => {
                    let [hi, lo] = ((target - next_ip) as u16).to_be_bytes();
                    operands[1] = hi;
                    operands[2] = lo;
                }
                Opcode::JumpIfNotShortR => {
                    operands[1] = (target - next_ip) as u8;
                }
                Opcode::Loop => {
                    let [hi, lo] = ((next_ip - target) as u16).to_be_bytes();
                    operands[0] = hi;
                    operands[1] = lo;
                }
                _ => {}
            }
        }
        let size = inst.op.size();
        code.push(inst.op as u8);
        code.extend_from_slice(&operands);
        for _ in 0..size {
            line_map.push(inst.line);
            col_map.push(inst.col);
            file_map.push(inst.file);
        }
    }

    chunk.code = code;
    chunk.line_map = line_map;
    chunk.col_map = col_map;
    chunk.file_map = file_map;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(code: Vec<u8>) -> Chunk {
        let n = code.len();
        Chunk {
            name: "<test>".to_string(),
            arity: 0,
            line_map: vec![1; n],
            col_map: vec![1; n],
            file_map: vec![0; n],
            code,
        }
    }

    #[test]
    fn fuses_load_then_move() {
        // LOAD_I32_CONST r192, #0 ; MOVE r64, r192 ; HALT
        let mut chunk = chunk_of(vec![
            Opcode::LoadI32Const as u8,
            192,
            0,
            0,
            Opcode::Move as u8,
            64,
            192,
            Opcode::Halt as u8,
        ]);
        let before = chunk.code.len();
        let mut stats = Stats::default();
        run(&mut chunk, &mut stats);
        assert_eq!(
            chunk.code,
            vec![Opcode::LoadI32Const as u8, 64, 0, 0, Opcode::Halt as u8]
        );
        assert_eq!(before - chunk.code.len(), Opcode::Move.size());
        assert_eq!(stats.loads_fused, 1);
        assert_eq!(chunk.line_map.len(), chunk.code.len());
    }

    #[test]
    fn does_not_fuse_when_temp_is_read_later() {
        // The temp feeds an add after the move; fusing would break it.
        let mut chunk = chunk_of(vec![
            Opcode::LoadI32Const as u8,
            9,
            0,
            0,
            Opcode::Move as u8,
            1,
            9,
            Opcode::AddI32 as u8,
            2,
            9,
            1,
            Opcode::Halt as u8,
        ]);
        let original = chunk.code.clone();
        let mut stats = Stats::default();
        run(&mut chunk, &mut stats);
        assert_eq!(chunk.code, original);
    }

    #[test]
    fn removes_self_moves() {
        let mut chunk = chunk_of(vec![
            Opcode::Move as u8,
            5,
            5,
            Opcode::Move as u8,
            1,
            2,
            Opcode::Halt as u8,
        ]);
        let mut stats = Stats::default();
        run(&mut chunk, &mut stats);
        assert_eq!(
            chunk.code,
            vec![Opcode::Move as u8, 1, 2, Opcode::Halt as u8]
        );
        assert_eq!(stats.moves_eliminated, 1);
    }

    #[test]
    fn elides_redundant_constant_reload() {
        let mut chunk = chunk_of(vec![
            Opcode::LoadI32Const as u8,
            3,
            0,
            7,
            Opcode::LoadI32Const as u8,
            3,
            0,
            7,
            Opcode::Halt as u8,
        ]);
        let mut stats = Stats::default();
        run(&mut chunk, &mut stats);
        assert_eq!(
            chunk.code,
            vec![Opcode::LoadI32Const as u8, 3, 0, 7, Opcode::Halt as u8]
        );
        assert_eq!(stats.redundant_loads_elided, 1);
    }

    #[test]
    fn keeps_reload_after_clobber() {
        let mut chunk = chunk_of(vec![
            Opcode::LoadI32Const as u8,
            3,
            0,
            7,
            Opcode::IncI32 as u8,
            3,
            Opcode::LoadI32Const as u8,
            3,
            0,
            7,
            Opcode::Halt as u8,
        ]);
        let original = chunk.code.clone();
        let mut stats = Stats::default();
        run(&mut chunk, &mut stats);
        assert_eq!(chunk.code, original);
    }

    #[test]
    fn jump_offsets_survive_deletion() {
        // JUMP over a self-move to the HALT; deleting the self-move must
        // shrink the jump offset.
        let mut chunk = chunk_of(vec![
            Opcode::Jump as u8,
            0,
            3,
            Opcode::Move as u8,
            5,
            5,
            Opcode::Halt as u8,
        ]);
        let mut stats = Stats::default();
        run(&mut chunk, &mut stats);
        assert_eq!(chunk.code, vec![Opcode::Jump as u8, 0, 0, Opcode::Halt as u8]);
    }

    #[test]
    fn idempotent() {
        let mut chunk = chunk_of(vec![
            Opcode::LoadI32Const as u8,
            192,
            0,
            0,
            Opcode::Move as u8,
            64,
            192,
            Opcode::Move as u8,
            9,
            9,
            Opcode::Halt as u8,
        ]);
        let mut stats = Stats::default();
        run(&mut chunk, &mut stats);
        let once = chunk.code.clone();
        run(&mut chunk, &mut stats);
        assert_eq!(chunk.code, once);
    }

    #[test]
    fn loop_back_edges_are_retargeted() {
        // header: INC r1 ; self-move ; LOOP -> header ; HALT
        let mut chunk = chunk_of(vec![
            Opcode::IncI32 as u8,
            1,
            Opcode::Move as u8,
            4,
            4,
            Opcode::Loop as u8,
            0,
            8,
            Opcode::Halt as u8,
        ]);
        let mut stats = Stats::default();
        run(&mut chunk, &mut stats);
        assert_eq!(
            chunk.code,
            vec![
                Opcode::IncI32 as u8,
                1,
                Opcode::Loop as u8,
                0,
                5,
                Opcode::Halt as u8,
            ]
        );
    }
}
