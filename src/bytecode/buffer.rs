//! Bytecode emission, labels, and jump patching.
//!
//! Forward jumps are emitted with `0xff` placeholder operands and a
//! `JumpPatch` recording where the operand lives; binding the target label
//! patches every pending referrer. A jump emitted as forward that turns out
//! to land behind the emission point is rewritten in place to the `LOOP`
//! backward-edge opcode. Offsets are unsigned: forward offsets are
//! `target - next_ip`, backward distances `next_ip - target`, and either
//! overflowing its operand width is a compile error.
//!
//! Every emitted byte is tagged with the current source span so the VM can
//! map a faulting instruction back to a line and column.

use crate::ast::Span;
use crate::bytecode::{Chunk, Opcode};
use crate::diagnostic::{Diagnostic, ErrorCode};
use crate::result::{CodegenError, CodegenResult};
use smallvec::SmallVec;

/// A position in the instruction stream that jumps can target. Created
/// unbound; bound once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Default)]
struct LabelData {
    offset: Option<u32>,
    pending: SmallVec<[JumpPatch; 4]>,
}

/// An unresolved jump operand.
#[derive(Clone, Copy, Debug)]
pub struct JumpPatch {
    /// The opcode as emitted (before any backward rewrite).
    pub opcode: Opcode,
    /// Offset of the opcode byte.
    pub opcode_offset: u32,
    /// Offset of the first operand byte to patch.
    pub operand_offset: u32,
    /// Operand width in bytes: 1 or 2.
    pub operand_size: u8,
}

/// An append-only instruction stream with source maps and jump patching.
pub struct BytecodeBuffer {
    code: Vec<u8>,
    line_map: Vec<i32>,
    col_map: Vec<i32>,
    file_map: Vec<u32>,
    labels: Vec<LabelData>,
    unbound: usize,
    cur: Span,
}

impl BytecodeBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            line_map: Vec::new(),
            col_map: Vec::new(),
            file_map: Vec::new(),
            labels: Vec::new(),
            unbound: 0,
            cur: Span::none(),
        }
    }

    /// Set the source span tagged onto subsequently emitted bytes.
    pub fn set_span(&mut self, span: Span) {
        self.cur = span;
    }

    /// Current end-of-stream offset.
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn push_byte(&mut self, byte: u8) {
        self.code.push(byte);
        self.line_map.push(self.cur.line as i32);
        self.col_map.push(self.cur.column as i32);
        self.file_map.push(self.cur.file.0);
    }

    /// Emit an instruction with its operand bytes.
    pub fn emit(&mut self, op: Opcode, operands: &[u8]) {
        debug_assert_eq!(
            operands.len() + 1,
            op.size(),
            "wrong operand count for {}",
            op.mnemonic()
        );
        self.push_byte(op as u8);
        for &b in operands {
            self.push_byte(b);
        }
    }

    /// Emit an operand-less instruction.
    pub fn emit_op(&mut self, op: Opcode) {
        self.emit(op, &[]);
    }

    /// Emit a constant load with a 16-bit pool index.
    pub fn emit_load_const(&mut self, op: Opcode, reg: u8, idx: u16) {
        debug_assert!(op.is_load_const());
        let [hi, lo] = idx.to_be_bytes();
        self.emit(op, &[reg, hi, lo]);
    }

    /// Emit an extended-register constant load.
    pub fn emit_load_const_ext(&mut self, reg: u16, idx: u16) {
        let [rh, rl] = reg.to_be_bytes();
        let [ih, il] = idx.to_be_bytes();
        self.emit(Opcode::LoadConstExt, &[rh, rl, ih, il]);
    }

    /// Emit an extended-register move.
    pub fn emit_move_ext(&mut self, dst: u16, src: u16) {
        let [dh, dl] = dst.to_be_bytes();
        let [sh, sl] = src.to_be_bytes();
        self.emit(Opcode::MoveExt, &[dh, dl, sh, sl]);
    }

    /// Create an unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelData::default());
        self.unbound += 1;
        label
    }

    /// Bind `label` to the current offset, patching every pending jump.
    pub fn bind_label(&mut self, label: Label) -> CodegenResult<()> {
        let target = self.offset();
        let data = &mut self.labels[label.0 as usize];
        debug_assert!(data.offset.is_none(), "label bound twice");
        data.offset = Some(target);
        self.unbound -= 1;
        let pending = core::mem::take(&mut self.labels[label.0 as usize].pending);
        for patch in pending {
            self.patch(patch, target)?;
        }
        Ok(())
    }

    /// Emit a jump to `label`. Bound labels produce a backward edge
    /// immediately; unbound labels get a placeholder operand and a patch
    /// recorded against the label.
    pub fn emit_jump(&mut self, op: Opcode, cond: Option<u8>, label: Label) -> CodegenResult<()> {
        let operand_size: u8 = match op {
            Opcode::Jump | Opcode::JumpIfNotR | Opcode::Loop => 2,
            Opcode::JumpShort | Opcode::JumpIfNotShortR => 1,
            _ => {
                return Err(CodegenError::Bug(format!(
                    "{} is not a jump opcode",
                    op.mnemonic()
                )))
            }
        };

        if let Some(target) = self.labels[label.0 as usize].offset {
            // Backward edge: emit the loop variant directly.
            let loop_op = match op {
                Opcode::Loop => Opcode::Loop,
                _ => op.loop_variant().ok_or_else(|| {
                    CodegenError::Bug(format!(
                        "{} cannot encode a backward edge",
                        op.mnemonic()
                    ))
                })?,
            };
            debug_assert!(cond.is_none(), "conditional backward edges unsupported");
            let operand_offset = self.offset() + 1;
            let next_ip = operand_offset + 2;
            let distance = next_ip - target;
            if distance > u16::MAX as u32 {
                return Err(self.jump_out_of_range(distance));
            }
            let [hi, lo] = (distance as u16).to_be_bytes();
            self.emit(loop_op, &[hi, lo]);
            return Ok(());
        }

        let opcode_offset = self.offset();
        self.push_byte(op as u8);
        if let Some(c) = cond {
            self.push_byte(c);
        }
        let operand_offset = self.offset();
        for _ in 0..operand_size {
            self.push_byte(0xff);
        }
        let patch = JumpPatch {
            opcode: op,
            opcode_offset,
            operand_offset,
            operand_size,
        };
        self.labels[label.0 as usize].pending.push(patch);
        Ok(())
    }

    /// Resolve one patch against a now-known target offset.
    pub fn patch(&mut self, patch: JumpPatch, target: u32) -> CodegenResult<()> {
        let operand_end = patch.operand_offset + u32::from(patch.operand_size);
        if target >= operand_end {
            // Forward.
            let rel = target - operand_end;
            let max = if patch.operand_size == 1 {
                u32::from(u8::MAX)
            } else {
                u32::from(u16::MAX)
            };
            if rel > max {
                return Err(self.jump_out_of_range(rel));
            }
            let at = patch.operand_offset as usize;
            if patch.operand_size == 1 {
                self.code[at] = rel as u8;
            } else {
                let [hi, lo] = (rel as u16).to_be_bytes();
                self.code[at] = hi;
                self.code[at + 1] = lo;
            }
            log::trace!(
                "patched {} at {:#06x} -> {:#06x} (+{})",
                patch.opcode.mnemonic(),
                patch.opcode_offset,
                target,
                rel
            );
        } else {
            // The jump resolved behind its own operand: rewrite the opcode
            // in place to the backward-edge variant.
            let loop_op = patch.opcode.loop_variant().ok_or_else(|| {
                CodegenError::Bug(format!(
                    "{} cannot encode a backward edge",
                    patch.opcode.mnemonic()
                ))
            })?;
            debug_assert_eq!(patch.operand_size, 2);
            let distance = operand_end - target;
            if distance > u32::from(u16::MAX) {
                return Err(self.jump_out_of_range(distance));
            }
            let at = patch.operand_offset as usize;
            self.code[patch.opcode_offset as usize] = loop_op as u8;
            let [hi, lo] = (distance as u16).to_be_bytes();
            self.code[at] = hi;
            self.code[at + 1] = lo;
            log::trace!(
                "rewrote {} at {:#06x} to {} (-{})",
                patch.opcode.mnemonic(),
                patch.opcode_offset,
                loop_op.mnemonic(),
                distance
            );
        }
        Ok(())
    }

    fn jump_out_of_range(&self, distance: u32) -> CodegenError {
        CodegenError::Lowering(Diagnostic::error(
            ErrorCode::JumpOutOfRange,
            self.cur,
            format!("jump distance {} does not fit the operand", distance),
        ))
    }

    /// Finish the stream: verify every label is bound and every jump
    /// patched, then package the code and maps as a `Chunk`.
    pub fn finalize(self, name: &str, arity: u8) -> CodegenResult<Chunk> {
        if self.unbound > 0 || self.labels.iter().any(|l| !l.pending.is_empty()) {
            return Err(CodegenError::Lowering(Diagnostic::error(
                ErrorCode::UndefinedLabel,
                self.cur,
                "a jump target was never defined",
            )));
        }
        debug_assert_eq!(self.code.len(), self.line_map.len());
        debug_assert_eq!(self.code.len(), self.col_map.len());
        debug_assert_eq!(self.code.len(), self.file_map.len());
        Ok(Chunk {
            name: name.to_string(),
            arity,
            code: self.code,
            line_map: self.line_map,
            col_map: self.col_map,
            file_map: self.file_map,
        })
    }
}

impl Default for BytecodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_is_patched() {
        let mut buf = BytecodeBuffer::new();
        let exit = buf.new_label();
        buf.emit_jump(Opcode::JumpIfNotR, Some(3), exit).unwrap();
        buf.emit(Opcode::Move, &[1, 2]);
        buf.bind_label(exit).unwrap();
        let chunk = buf.finalize("<main>", 0).unwrap();
        // JUMP_IF_NOT_R cond=3, offset over the MOVE (3 bytes).
        assert_eq!(
            chunk.code,
            vec![Opcode::JumpIfNotR as u8, 3, 0, 3, Opcode::Move as u8, 1, 2]
        );
    }

    #[test]
    fn jump_to_bound_label_becomes_loop() {
        let mut buf = BytecodeBuffer::new();
        let header = buf.new_label();
        buf.bind_label(header).unwrap();
        buf.emit(Opcode::Move, &[1, 2]);
        buf.emit_jump(Opcode::Jump, None, header).unwrap();
        let chunk = buf.finalize("<main>", 0).unwrap();
        // LOOP distance covers the MOVE plus itself: next_ip(6) - 0 = 6.
        assert_eq!(
            chunk.code,
            vec![Opcode::Move as u8, 1, 2, Opcode::Loop as u8, 0, 6]
        );
    }

    #[test]
    fn forward_jump_resolving_backward_is_rewritten() {
        let mut buf = BytecodeBuffer::new();
        buf.emit(Opcode::Move, &[1, 2]);
        // A patch created as a forward jump, resolved to an earlier offset.
        let opcode_offset = buf.offset();
        buf.emit(Opcode::Jump, &[0xff, 0xff]);
        let patch = JumpPatch {
            opcode: Opcode::Jump,
            opcode_offset,
            operand_offset: opcode_offset + 1,
            operand_size: 2,
        };
        buf.patch(patch, 0).unwrap();
        // Opcode rewritten in place; distance = operand_end(6) - 0.
        assert_eq!(buf.code[opcode_offset as usize], Opcode::Loop as u8);
        assert_eq!(&buf.code[opcode_offset as usize + 1..], &[0, 6]);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut buf = BytecodeBuffer::new();
        let label = buf.new_label();
        buf.emit_jump(Opcode::Jump, None, label).unwrap();
        let err = buf.finalize("<main>", 0).unwrap_err();
        match err {
            CodegenError::Lowering(d) => assert_eq!(d.code, ErrorCode::UndefinedLabel),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn short_jump_range_checked() {
        let mut buf = BytecodeBuffer::new();
        let far = buf.new_label();
        buf.emit_jump(Opcode::JumpShort, None, far).unwrap();
        for _ in 0..200 {
            buf.emit(Opcode::Move, &[1, 2]);
        }
        // 600 bytes of moves exceeds the 8-bit range.
        let err = buf.bind_label(far).unwrap_err();
        match err {
            CodegenError::Lowering(d) => assert_eq!(d.code, ErrorCode::JumpOutOfRange),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn maps_track_every_byte() {
        let mut buf = BytecodeBuffer::new();
        buf.set_span(crate::ast::Span {
            file: crate::ast::FileId(0),
            line: 12,
            column: 3,
        });
        buf.emit(Opcode::AddI32, &[0, 1, 2]);
        let chunk = buf.finalize("<main>", 0).unwrap();
        assert_eq!(chunk.line_map, vec![12, 12, 12, 12]);
        assert_eq!(chunk.col_map, vec![3, 3, 3, 3]);
    }
}
