//! Bytecode disassembler.
//!
//! Produces the textual listing behind the `dump_bytecode` flag. Tests also
//! lean on it to assert on emitted code shape without hand-decoding bytes.

use crate::bytecode::pool::ConstantPool;
use crate::bytecode::{Chunk, Inst, InstIter, Opcode};
use core::fmt::Write;

/// Disassemble one instruction into `out`.
fn write_inst(out: &mut String, inst: &Inst, pool: &ConstantPool) {
    let _ = write!(out, "{:04x}  {:<18}", inst.offset, inst.op.mnemonic());
    let ops = inst.operands;
    match inst.op {
        op if op.is_load_const() => {
            let idx = u16::from_be_bytes([ops[1], ops[2]]);
            let _ = write!(out, "r{}, #{}", ops[0], idx);
            if (idx as usize) < pool.len() {
                let _ = write!(out, " ; {}", pool.get(idx));
            }
        }
        Opcode::LoadConstExt => {
            let reg = u16::from_be_bytes([ops[0], ops[1]]);
            let idx = u16::from_be_bytes([ops[2], ops[3]]);
            let _ = write!(out, "r{}, #{}", reg, idx);
            if (idx as usize) < pool.len() {
                let _ = write!(out, " ; {}", pool.get(idx));
            }
        }
        Opcode::Move => {
            let _ = write!(out, "r{}, r{}", ops[0], ops[1]);
        }
        Opcode::MoveExt => {
            let dst = u16::from_be_bytes([ops[0], ops[1]]);
            let src = u16::from_be_bytes([ops[2], ops[3]]);
            let _ = write!(out, "r{}, r{}", dst, src);
        }
        Opcode::IncI32 | Opcode::PrintR | Opcode::ReturnR => {
            let _ = write!(out, "r{}", ops[0]);
        }
        Opcode::ReturnVoid | Opcode::Halt => {}
        Opcode::Jump | Opcode::JumpShort => {
            let off = jump_offset(inst.op, ops, 0);
            let target = inst.offset + inst.op.size() + off;
            let _ = write!(out, "{:04x}", target);
        }
        Opcode::JumpIfNotR | Opcode::JumpIfNotShortR => {
            let off = jump_offset(inst.op, ops, 1);
            let target = inst.offset + inst.op.size() + off;
            let _ = write!(out, "r{}, {:04x}", ops[0], target);
        }
        Opcode::Loop => {
            let off = u16::from_be_bytes([ops[0], ops[1]]) as usize;
            let target = (inst.offset + inst.op.size()).wrapping_sub(off);
            let _ = write!(out, "{:04x}", target);
        }
        Opcode::Call => {
            let _ = write!(
                out,
                "r{}, r{}, {}, r{}",
                ops[0], ops[1], ops[2], ops[3]
            );
        }
        Opcode::PrintMultiR => {
            let _ = write!(out, "r{}, {}, nl={}", ops[0], ops[1], ops[2]);
        }
        _ => {
            // Register-only layouts: print each operand as a register.
            for (i, b) in ops.iter().enumerate() {
                if i > 0 {
                    let _ = write!(out, ", ");
                }
                let _ = write!(out, "r{}", b);
            }
        }
    }
    out.push('\n');
}

fn jump_offset(op: Opcode, ops: &[u8], skip: usize) -> usize {
    match op {
        Opcode::Jump | Opcode::JumpIfNotR => {
            u16::from_be_bytes([ops[skip], ops[skip + 1]]) as usize
        }
        _ => ops[skip] as usize,
    }
}

/// Disassemble a whole chunk against its pool.
pub fn disassemble(chunk: &Chunk, pool: &ConstantPool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} (arity {}) ==", chunk.name, chunk.arity);
    for inst in InstIter::new(&chunk.code) {
        write_inst(&mut out, &inst, pool);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn listing_shape() {
        let mut pool = ConstantPool::new();
        let idx = pool.insert(Value::I32(5)).unwrap();
        let mut chunk = Chunk::default();
        chunk.name = "<main>".to_string();
        chunk.code = vec![
            Opcode::LoadI32Const as u8,
            2,
            (idx >> 8) as u8,
            idx as u8,
            Opcode::PrintR as u8,
            2,
            Opcode::Halt as u8,
        ];
        let text = disassemble(&chunk, &pool);
        assert!(text.contains("LOAD_I32_CONST"));
        assert!(text.contains("r2, #0 ; 5"));
        assert!(text.contains("PRINT_R"));
        assert!(text.contains("HALT"));
    }
}
