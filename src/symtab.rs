//! The symbol table.
//!
//! A scope-stacked list of name bindings used during lowering. Resolution
//! scans innermost-out; ending a scope frees the registers of every symbol
//! declared in it. A symbol refers to storage through `SymbolRef`, which
//! keeps the "local slot vs direct register" distinction explicit: spill-
//! backed variables hold their slot index, everything else binds a register
//! directly. Loop optimizations temporarily rebind a name to a different
//! register (unrolled iteration values, hoisted invariants) and restore the
//! old binding afterwards.

use crate::bytecode::TypeTag;
use crate::regalloc::{Reg, RegTier, RegisterAllocator};

/// Where a symbol's value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolRef {
    /// A spill slot index.
    Local(u16),
    /// A directly bound register.
    Register(Reg),
}

impl SymbolRef {
    /// Classify a freshly allocated register.
    pub fn from_reg(reg: Reg) -> Self {
        if reg.tier() == RegTier::Spill {
            let (base, _) = RegTier::Spill.range();
            Self::Local(reg.0 - base)
        } else {
            Self::Register(reg)
        }
    }

    /// The underlying register id, whichever representation is used.
    pub fn reg(self) -> Reg {
        match self {
            Self::Register(r) => r,
            Self::Local(slot) => {
                let (base, _) = RegTier::Spill.range();
                Reg(base + slot)
            }
        }
    }
}

/// One symbol binding.
#[derive(Clone, Debug)]
pub struct Symbol {
    /// The name.
    pub name: String,
    /// Storage location.
    pub storage: SymbolRef,
    /// Value type.
    pub tag: TypeTag,
    /// Whether assignment is allowed.
    pub mutable: bool,
    /// Scope depth the symbol was declared at.
    pub depth: u32,
}

/// Scope-stacked name bindings.
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    depth: u32,
}

impl SymbolTable {
    /// An empty table at depth zero.
    pub fn new() -> Self {
        Self {
            symbols: Vec::new(),
            depth: 0,
        }
    }

    /// Current scope depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Enter a scope.
    pub fn begin_scope(&mut self) {
        self.depth += 1;
    }

    /// Leave the current scope, freeing the registers of the symbols it
    /// declared.
    pub fn end_scope(&mut self, regs: &mut RegisterAllocator) {
        debug_assert!(self.depth > 0, "unbalanced scope exit");
        while let Some(sym) = self.symbols.last() {
            if sym.depth < self.depth {
                break;
            }
            let sym = self.symbols.pop().expect("just peeked");
            let reg = sym.storage.reg();
            if regs.is_pinned(reg) {
                regs.unpin(reg);
            }
            regs.free(reg);
        }
        self.depth -= 1;
    }

    /// Declare a symbol in the current scope.
    pub fn declare(&mut self, name: &str, storage: SymbolRef, tag: TypeTag, mutable: bool) {
        log::trace!("declare `{}` at depth {} in {:?}", name, self.depth, storage);
        self.symbols.push(Symbol {
            name: name.to_string(),
            storage,
            tag,
            mutable,
            depth: self.depth,
        });
    }

    /// Resolve a name, innermost binding first.
    pub fn resolve(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().rev().find(|s| s.name == name)
    }

    /// Rebind the innermost binding of `name` to different storage,
    /// returning the previous storage. Used by the unroller to point a
    /// loop variable at each iteration's constant register and restore it
    /// afterwards.
    pub fn rebind(&mut self, name: &str, storage: SymbolRef) -> Option<SymbolRef> {
        let sym = self.symbols.iter_mut().rev().find(|s| s.name == name)?;
        let old = sym.storage;
        sym.storage = storage;
        Some(old)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_innermost_first() {
        let mut regs = RegisterAllocator::new();
        let mut syms = SymbolTable::new();
        let a = regs.allocate(TypeTag::I32, 0).unwrap();
        syms.declare("x", SymbolRef::from_reg(a), TypeTag::I32, false);
        syms.begin_scope();
        let b = regs.allocate(TypeTag::F64, 0).unwrap();
        syms.declare("x", SymbolRef::from_reg(b), TypeTag::F64, true);
        assert_eq!(syms.resolve("x").unwrap().storage.reg(), b);
        syms.end_scope(&mut regs);
        assert_eq!(syms.resolve("x").unwrap().storage.reg(), a);
    }

    #[test]
    fn end_scope_frees_registers() {
        let mut regs = RegisterAllocator::new();
        let mut syms = SymbolTable::new();
        syms.begin_scope();
        let a = regs.allocate(TypeTag::I32, 0).unwrap();
        syms.declare("x", SymbolRef::from_reg(a), TypeTag::I32, false);
        syms.end_scope(&mut regs);
        assert!(syms.resolve("x").is_none());
        // The register is back in the pool: same-typed allocation reuses it.
        let b = regs.allocate(TypeTag::I32, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rebind_returns_previous_storage() {
        let mut regs = RegisterAllocator::new();
        let mut syms = SymbolTable::new();
        let a = regs.allocate(TypeTag::I32, 0).unwrap();
        let b = regs.allocate(TypeTag::I32, 0).unwrap();
        syms.declare("i", SymbolRef::from_reg(a), TypeTag::I32, false);
        let old = syms.rebind("i", SymbolRef::from_reg(b)).unwrap();
        assert_eq!(old.reg(), a);
        assert_eq!(syms.resolve("i").unwrap().storage.reg(), b);
        syms.rebind("i", old);
        assert_eq!(syms.resolve("i").unwrap().storage.reg(), a);
    }

    #[test]
    fn spill_backed_symbols_use_local_slots() {
        let reg = Reg(483);
        let storage = SymbolRef::from_reg(reg);
        assert_eq!(storage, SymbolRef::Local(3));
        assert_eq!(storage.reg(), reg);
    }
}
