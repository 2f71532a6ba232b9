//! Bytecode definitions.
//!
//! The instruction stream is a flat byte array: one opcode byte followed by
//! a fixed number of operand bytes determined by the opcode. Registers are
//! one byte except in the `*Ext` forms, which address the extended tiers
//! with two. Constant pool indices and jump offsets are two bytes,
//! big-endian. Jump offsets are unsigned and relative to the end of the
//! operand; backward edges use the distinct `LOOP` opcode.

pub mod buffer;
pub mod disasm;
pub mod pool;

use crate::types::{PrimType, Type, TypeArena, TypeData};
use crate::ast::BinOp;

/// The kind of value a register holds, as far as opcode selection cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TypeTag {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
    Str,
    Array,
    Func,
    /// Statically unknown; handled by generic opcodes.
    Any,
}

impl TypeTag {
    /// Derive the tag from a resolved type. `t` must be pruned.
    pub fn from_type(arena: &TypeArena, t: Type) -> Self {
        match arena.data(t) {
            TypeData::Prim(p) => match p {
                PrimType::I32 => Self::I32,
                PrimType::I64 => Self::I64,
                PrimType::U32 => Self::U32,
                PrimType::U64 => Self::U64,
                PrimType::F64 => Self::F64,
                PrimType::Bool => Self::Bool,
                PrimType::Str => Self::Str,
                PrimType::Void | PrimType::Unknown | PrimType::Error | PrimType::Any => Self::Any,
            },
            TypeData::Function { .. } => Self::Func,
            TypeData::Array { .. } => Self::Array,
            TypeData::Var(_) => Self::Any,
        }
    }

    /// Is this an integer tag?
    pub fn is_integer(self) -> bool {
        matches!(self, Self::I32 | Self::I64 | Self::U32 | Self::U64)
    }
}

macro_rules! opcodes {
    ( $( $name:ident = $code:literal, $size:literal, $mnemonic:literal; )* ) => {
        /// One instruction opcode.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
        #[repr(u8)]
        pub enum Opcode {
            $( #[allow(missing_docs)] $name = $code, )*
        }

        impl Opcode {
            /// Decode an opcode byte.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $( $code => Some(Self::$name), )*
                    _ => None,
                }
            }

            /// Total instruction size in bytes, opcode included.
            pub fn size(self) -> usize {
                match self {
                    $( Self::$name => $size, )*
                }
            }

            /// Textual mnemonic used by the disassembler.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Self::$name => $mnemonic, )*
                }
            }
        }
    };
}

opcodes! {
    // Constants and moves.
    LoadConst     = 0x01, 4, "LOAD_CONST";        // op, reg, idx16
    LoadI32Const  = 0x02, 4, "LOAD_I32_CONST";
    LoadI64Const  = 0x03, 4, "LOAD_I64_CONST";
    LoadU32Const  = 0x04, 4, "LOAD_U32_CONST";
    LoadU64Const  = 0x05, 4, "LOAD_U64_CONST";
    LoadF64Const  = 0x06, 4, "LOAD_F64_CONST";
    LoadBoolConst = 0x07, 4, "LOAD_BOOL_CONST";
    LoadStrConst  = 0x08, 4, "LOAD_STR_CONST";
    LoadConstExt  = 0x09, 6, "LOAD_CONST_EXT";    // op, reg16, idx16
    Move          = 0x0a, 3, "MOVE";              // op, dst, src
    MoveExt       = 0x0b, 5, "MOVE_EXT";          // op, dst16, src16

    // 32-bit signed integer arithmetic: op, dst, lhs, rhs.
    AddI32 = 0x10, 4, "ADD_I32";
    SubI32 = 0x11, 4, "SUB_I32";
    MulI32 = 0x12, 4, "MUL_I32";
    DivI32 = 0x13, 4, "DIV_I32";
    RemI32 = 0x14, 4, "REM_I32";
    NegI32 = 0x15, 3, "NEG_I32";                  // op, dst, src
    IncI32 = 0x16, 2, "INC_I32";                  // op, reg
    ShlI32 = 0x17, 4, "SHL_I32";                  // op, dst, src, amount

    // 64-bit signed.
    AddI64 = 0x18, 4, "ADD_I64";
    SubI64 = 0x19, 4, "SUB_I64";
    MulI64 = 0x1a, 4, "MUL_I64";
    DivI64 = 0x1b, 4, "DIV_I64";
    RemI64 = 0x1c, 4, "REM_I64";
    NegI64 = 0x1d, 3, "NEG_I64";
    ShlI64 = 0x1e, 4, "SHL_I64";

    // 32-bit unsigned.
    AddU32 = 0x20, 4, "ADD_U32";
    SubU32 = 0x21, 4, "SUB_U32";
    MulU32 = 0x22, 4, "MUL_U32";
    DivU32 = 0x23, 4, "DIV_U32";
    RemU32 = 0x24, 4, "REM_U32";

    // 64-bit unsigned.
    AddU64 = 0x28, 4, "ADD_U64";
    SubU64 = 0x29, 4, "SUB_U64";
    MulU64 = 0x2a, 4, "MUL_U64";
    DivU64 = 0x2b, 4, "DIV_U64";
    RemU64 = 0x2c, 4, "REM_U64";

    // 64-bit float.
    AddF64 = 0x30, 4, "ADD_F64";
    SubF64 = 0x31, 4, "SUB_F64";
    MulF64 = 0x32, 4, "MUL_F64";
    DivF64 = 0x33, 4, "DIV_F64";
    NegF64 = 0x34, 3, "NEG_F64";

    // Generic comparisons producing bool: op, dst, lhs, rhs.
    CmpEq = 0x40, 4, "CMP_EQ";
    CmpNe = 0x41, 4, "CMP_NE";
    CmpLt = 0x42, 4, "CMP_LT";
    CmpLe = 0x43, 4, "CMP_LE";
    CmpGt = 0x44, 4, "CMP_GT";
    CmpGe = 0x45, 4, "CMP_GE";
    // Typed comparisons used by loop headers.
    LtI32 = 0x46, 4, "LT_I32";
    LeI32 = 0x47, 4, "LE_I32";
    GtI32 = 0x48, 4, "GT_I32";
    GeI32 = 0x49, 4, "GE_I32";

    // Boolean connectives.
    BoolAnd = 0x4a, 4, "BOOL_AND";
    BoolOr  = 0x4b, 4, "BOOL_OR";
    BoolNot = 0x4c, 3, "BOOL_NOT";                // op, dst, src

    // Numeric conversions: op, dst, src.
    I32ToI64 = 0x50, 3, "I32_TO_I64";
    I32ToU32 = 0x51, 3, "I32_TO_U32";
    I32ToU64 = 0x52, 3, "I32_TO_U64";
    I32ToF64 = 0x53, 3, "I32_TO_F64";
    I64ToI32 = 0x54, 3, "I64_TO_I32";
    I64ToU32 = 0x55, 3, "I64_TO_U32";
    I64ToU64 = 0x56, 3, "I64_TO_U64";
    I64ToF64 = 0x57, 3, "I64_TO_F64";
    U32ToI32 = 0x58, 3, "U32_TO_I32";
    U32ToI64 = 0x59, 3, "U32_TO_I64";
    U32ToU64 = 0x5a, 3, "U32_TO_U64";
    U32ToF64 = 0x5b, 3, "U32_TO_F64";
    U64ToI32 = 0x5c, 3, "U64_TO_I32";
    U64ToI64 = 0x5d, 3, "U64_TO_I64";
    U64ToU32 = 0x5e, 3, "U64_TO_U32";
    U64ToF64 = 0x5f, 3, "U64_TO_F64";
    F64ToI32 = 0x60, 3, "F64_TO_I32";
    F64ToI64 = 0x61, 3, "F64_TO_I64";
    F64ToU32 = 0x62, 3, "F64_TO_U32";
    F64ToU64 = 0x63, 3, "F64_TO_U64";
    BoolToI32 = 0x64, 3, "BOOL_TO_I32";
    // String conversions.
    I32ToStr  = 0x68, 3, "I32_TO_STR";
    I64ToStr  = 0x69, 3, "I64_TO_STR";
    U32ToStr  = 0x6a, 3, "U32_TO_STR";
    U64ToStr  = 0x6b, 3, "U64_TO_STR";
    F64ToStr  = 0x6c, 3, "F64_TO_STR";
    BoolToStr = 0x6d, 3, "BOOL_TO_STR";

    // Arrays.
    NewArray     = 0x70, 4, "NEW_ARRAY";          // op, dst, first, count
    ArrayLen     = 0x71, 3, "ARRAY_LEN";          // op, dst, arr
    ArrayGet     = 0x72, 4, "ARRAY_GET";          // op, dst, arr, idx
    ArrayGetFast = 0x73, 4, "ARRAY_GET_FAST";     // op, dst, arr, idx

    // Control flow. Offsets are unsigned and relative to the first byte
    // after the operand.
    Jump            = 0x80, 3, "JUMP";            // op, off16
    JumpShort       = 0x81, 2, "JUMP_SHORT";      // op, off8
    JumpIfNotR      = 0x82, 4, "JUMP_IF_NOT_R";   // op, cond, off16
    JumpIfNotShortR = 0x83, 3, "JUMP_IF_NOT_SHORT_R";
    Loop            = 0x84, 3, "LOOP";            // op, off16, backward

    // Calls and returns.
    Call       = 0x90, 5, "CALL";                 // op, callee, first_arg, argc, result
    ReturnR    = 0x91, 2, "RETURN_R";             // op, reg
    ReturnVoid = 0x92, 1, "RETURN_VOID";

    // I/O.
    PrintR      = 0xa0, 2, "PRINT_R";             // op, reg
    PrintMultiR = 0xa1, 4, "PRINT_MULTI_R";       // op, first, count, newline

    Halt = 0xf0, 1, "HALT";
}

impl Opcode {
    /// The typed constant load for values of the given tag.
    pub fn load_const_for(tag: TypeTag) -> Self {
        match tag {
            TypeTag::I32 => Self::LoadI32Const,
            TypeTag::I64 => Self::LoadI64Const,
            TypeTag::U32 => Self::LoadU32Const,
            TypeTag::U64 => Self::LoadU64Const,
            TypeTag::F64 => Self::LoadF64Const,
            TypeTag::Bool => Self::LoadBoolConst,
            TypeTag::Str => Self::LoadStrConst,
            TypeTag::Array | TypeTag::Func | TypeTag::Any => Self::LoadConst,
        }
    }

    /// Is this one of the constant load opcodes (8-bit register form)?
    pub fn is_load_const(self) -> bool {
        matches!(
            self,
            Self::LoadConst
                | Self::LoadI32Const
                | Self::LoadI64Const
                | Self::LoadU32Const
                | Self::LoadU64Const
                | Self::LoadF64Const
                | Self::LoadBoolConst
                | Self::LoadStrConst
        )
    }

    /// Does this opcode transfer control?
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Self::Jump
                | Self::JumpShort
                | Self::JumpIfNotR
                | Self::JumpIfNotShortR
                | Self::Loop
                | Self::Call
                | Self::ReturnR
                | Self::ReturnVoid
                | Self::Halt
        )
    }

    /// The backward-edge variant of a forward jump, if one exists.
    pub fn loop_variant(self) -> Option<Self> {
        match self {
            Self::Jump => Some(Self::Loop),
            _ => None,
        }
    }

    /// Select the typed binary ALU or comparison opcode. Comparisons use
    /// the generic compare forms regardless of the operand tag.
    pub fn for_binary(op: BinOp, tag: TypeTag) -> Option<Self> {
        use TypeTag::*;
        let selected = match op {
            BinOp::Add => match tag {
                I32 => Self::AddI32,
                I64 => Self::AddI64,
                U32 => Self::AddU32,
                U64 => Self::AddU64,
                F64 => Self::AddF64,
                _ => return None,
            },
            BinOp::Sub => match tag {
                I32 => Self::SubI32,
                I64 => Self::SubI64,
                U32 => Self::SubU32,
                U64 => Self::SubU64,
                F64 => Self::SubF64,
                _ => return None,
            },
            BinOp::Mul => match tag {
                I32 => Self::MulI32,
                I64 => Self::MulI64,
                U32 => Self::MulU32,
                U64 => Self::MulU64,
                F64 => Self::MulF64,
                _ => return None,
            },
            BinOp::Div => match tag {
                I32 => Self::DivI32,
                I64 => Self::DivI64,
                U32 => Self::DivU32,
                U64 => Self::DivU64,
                F64 => Self::DivF64,
                _ => return None,
            },
            BinOp::Rem => match tag {
                I32 => Self::RemI32,
                I64 => Self::RemI64,
                U32 => Self::RemU32,
                U64 => Self::RemU64,
                _ => return None,
            },
            BinOp::Eq => Self::CmpEq,
            BinOp::Ne => Self::CmpNe,
            BinOp::Lt => Self::CmpLt,
            BinOp::Le => Self::CmpLe,
            BinOp::Gt => Self::CmpGt,
            BinOp::Ge => Self::CmpGe,
            BinOp::And => Self::BoolAnd,
            BinOp::Or => Self::BoolOr,
        };
        Some(selected)
    }

    /// Select the conversion opcode for a cast between two tags. Identity
    /// casts have no opcode; the caller emits a move.
    pub fn for_conversion(from: TypeTag, to: TypeTag) -> Option<Self> {
        use TypeTag::*;
        let op = match (from, to) {
            (I32, I64) => Self::I32ToI64,
            (I32, U32) => Self::I32ToU32,
            (I32, U64) => Self::I32ToU64,
            (I32, F64) => Self::I32ToF64,
            (I32, Str) => Self::I32ToStr,
            (I64, I32) => Self::I64ToI32,
            (I64, U32) => Self::I64ToU32,
            (I64, U64) => Self::I64ToU64,
            (I64, F64) => Self::I64ToF64,
            (I64, Str) => Self::I64ToStr,
            (U32, I32) => Self::U32ToI32,
            (U32, I64) => Self::U32ToI64,
            (U32, U64) => Self::U32ToU64,
            (U32, F64) => Self::U32ToF64,
            (U32, Str) => Self::U32ToStr,
            (U64, I32) => Self::U64ToI32,
            (U64, I64) => Self::U64ToI64,
            (U64, U32) => Self::U64ToU32,
            (U64, F64) => Self::U64ToF64,
            (U64, Str) => Self::U64ToStr,
            (F64, I32) => Self::F64ToI32,
            (F64, I64) => Self::F64ToI64,
            (F64, U32) => Self::F64ToU32,
            (F64, U64) => Self::F64ToU64,
            (F64, Str) => Self::F64ToStr,
            (Bool, I32) => Self::BoolToI32,
            (Bool, Str) => Self::BoolToStr,
            _ => return None,
        };
        Some(op)
    }
}

/// One executable code unit: a function body or the top-level script.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Chunk {
    /// Function name; `"<main>"` for the top-level chunk.
    pub name: String,
    /// Parameter count; parameters arrive in registers `0..arity`.
    pub arity: u8,
    /// The instruction stream.
    pub code: Vec<u8>,
    /// Source line per code byte; operand bytes repeat their instruction's
    /// entry.
    pub line_map: Vec<i32>,
    /// Source column per code byte.
    pub col_map: Vec<i32>,
    /// Source file id per code byte.
    pub file_map: Vec<u32>,
}

/// The output of compiling one unit: the top-level chunk, the function
/// table it refers to, and the shared constant pool.
#[derive(Debug, Default)]
pub struct CompiledUnit {
    /// Top-level code; ends with `HALT`.
    pub main: Chunk,
    /// Function chunks, indexed by `FuncId`.
    pub functions: Vec<Chunk>,
    /// Deduplicated literal pool shared by all chunks.
    pub pool: pool::ConstantPool,
}

/// A decoded instruction reference into a byte stream.
#[derive(Clone, Copy, Debug)]
pub struct Inst<'a> {
    /// Byte offset of the opcode.
    pub offset: usize,
    /// The opcode.
    pub op: Opcode,
    /// The operand bytes.
    pub operands: &'a [u8],
}

/// Iterator over the instructions of a byte stream.
pub struct InstIter<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> InstIter<'a> {
    /// Iterate over `code` from the beginning.
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pos: 0 }
    }
}

impl<'a> Iterator for InstIter<'a> {
    type Item = Inst<'a>;

    fn next(&mut self) -> Option<Inst<'a>> {
        if self.pos >= self.code.len() {
            return None;
        }
        let offset = self.pos;
        let op = match Opcode::from_u8(self.code[offset]) {
            Some(op) => op,
            None => {
                debug_assert!(false, "invalid opcode byte {:#04x}", self.code[offset]);
                return None;
            }
        };
        let size = op.size();
        if offset + size > self.code.len() {
            debug_assert!(false, "truncated instruction at offset {}", offset);
            return None;
        }
        self.pos += size;
        Some(Inst {
            offset,
            op,
            operands: &self.code[offset + 1..offset + size],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_opcode_bytes() {
        for byte in 0..=255u8 {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
                assert!(op.size() >= 1);
            }
        }
    }

    #[test]
    fn binary_selection() {
        assert_eq!(
            Opcode::for_binary(BinOp::Add, TypeTag::I32),
            Some(Opcode::AddI32)
        );
        assert_eq!(
            Opcode::for_binary(BinOp::Mul, TypeTag::F64),
            Some(Opcode::MulF64)
        );
        // Comparisons are generic whatever the operand type.
        assert_eq!(
            Opcode::for_binary(BinOp::Lt, TypeTag::F64),
            Some(Opcode::CmpLt)
        );
        // No float remainder.
        assert_eq!(Opcode::for_binary(BinOp::Rem, TypeTag::F64), None);
    }

    #[test]
    fn conversion_selection() {
        assert_eq!(
            Opcode::for_conversion(TypeTag::I32, TypeTag::F64),
            Some(Opcode::I32ToF64)
        );
        assert_eq!(Opcode::for_conversion(TypeTag::I32, TypeTag::I32), None);
        assert_eq!(Opcode::for_conversion(TypeTag::Str, TypeTag::I32), None);
    }

    #[test]
    fn inst_iter_walks_fixed_sizes() {
        let code = vec![
            Opcode::LoadI32Const as u8,
            7,
            0,
            1,
            Opcode::Move as u8,
            3,
            7,
            Opcode::Halt as u8,
        ];
        let insts: Vec<_> = InstIter::new(&code).collect();
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0].op, Opcode::LoadI32Const);
        assert_eq!(insts[0].operands, &[7, 0, 1]);
        assert_eq!(insts[1].offset, 4);
        assert_eq!(insts[2].op, Opcode::Halt);
    }
}
