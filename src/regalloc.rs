//! Tiered register allocation.
//!
//! Virtual registers are 16-bit ids partitioned into tiers. The first 256
//! ids are addressable by ordinary one-byte operands; the extended tiers
//! are reachable only through the `*_EXT` move and load forms; spill ids
//! are backed by VM memory. Allocation cascades through the tiers in order,
//! preferring to reuse a freed register of the same type before advancing
//! the tier's high-water mark.
//!
//! A lifetime record is kept per allocated register (birth, last use, type,
//! activity) so freed registers can be recycled. Registers holding hoisted
//! loop invariants or induction variables are pinned: a pinned register is
//! excluded from reuse and from spilling until it is explicitly unpinned.

use crate::bytecode::TypeTag;
use crate::fx::{FxHashMap, FxHashSet};
use core::fmt;

/// A virtual register id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u16);

impl Reg {
    /// Can this register be named by a one-byte operand?
    pub fn is_byte_addressable(self) -> bool {
        self.0 <= 0xff
    }

    /// The low byte of the id; only meaningful when byte-addressable.
    pub fn byte(self) -> u8 {
        debug_assert!(self.is_byte_addressable());
        self.0 as u8
    }

    /// The tier this id belongs to.
    pub fn tier(self) -> RegTier {
        RegTier::of(self)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Register tiers, in allocation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegTier {
    /// Bytecode-addressable registers.
    Global,
    /// First extended tier.
    Frame,
    /// Scratch tier; type-flexible on reuse.
    Temp,
    /// Module-scope bindings (function values).
    Module,
    /// VM-memory backed.
    Spill,
}

impl RegTier {
    const CASCADE: [RegTier; 4] = [RegTier::Global, RegTier::Frame, RegTier::Temp, RegTier::Module];

    /// Half-open id range of the tier. `Spill` is unbounded above.
    pub fn range(self) -> (u16, u16) {
        match self {
            Self::Global => (0, 256),
            Self::Frame => (256, 320),
            Self::Temp => (320, 352),
            Self::Module => (352, 480),
            Self::Spill => (480, u16::MAX),
        }
    }

    /// The tier containing `reg`.
    pub fn of(reg: Reg) -> Self {
        match reg.0 {
            0..=255 => Self::Global,
            256..=319 => Self::Frame,
            320..=351 => Self::Temp,
            352..=479 => Self::Module,
            _ => Self::Spill,
        }
    }

    fn cascade_index(self) -> usize {
        match self {
            Self::Global => 0,
            Self::Frame => 1,
            Self::Temp => 2,
            Self::Module => 3,
            Self::Spill => 4,
        }
    }
}

/// Lifetime record for one allocated register.
#[derive(Clone, Debug)]
pub struct RegisterLifetime {
    /// The register.
    pub reg: Reg,
    /// Instruction offset at allocation time.
    pub birth_instr: u32,
    /// Instruction offset of the most recent use.
    pub last_use_instr: u32,
    /// The type of value the register holds.
    pub type_tag: TypeTag,
    /// Currently holding a live value?
    pub is_active: bool,
    /// Eligible for reuse?
    pub is_reusable: bool,
    /// Variable bound to the register, if any.
    pub variable_name: Option<String>,
}

/// Raised when even the spill id space is exhausted.
#[derive(Debug)]
pub struct PressureExhausted;

/// The tiered allocator.
pub struct RegisterAllocator {
    /// Freed registers available for reuse, per non-spill tier.
    free: [Vec<Reg>; 4],
    /// High-water mark per non-spill tier.
    next: [u16; 4],
    /// Next spill id.
    next_spill: u16,
    lifetimes: FxHashMap<Reg, RegisterLifetime>,
    pinned: FxHashSet<Reg>,
}

impl RegisterAllocator {
    /// A fresh allocator with every register available.
    pub fn new() -> Self {
        let mut next = [0u16; 4];
        for tier in RegTier::CASCADE.iter() {
            next[tier.cascade_index()] = tier.range().0;
        }
        Self {
            free: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
            next,
            next_spill: RegTier::Spill.range().0,
            lifetimes: FxHashMap::default(),
            pinned: FxHashSet::default(),
        }
    }

    /// Allocate a register for a value of type `tag`, cascading from the
    /// `Global` tier. `at` is the current instruction offset.
    pub fn allocate(&mut self, tag: TypeTag, at: u32) -> Result<Reg, PressureExhausted> {
        self.allocate_from(RegTier::Global, tag, at)
    }

    /// Allocate starting at the `Module` tier; used for module-scope
    /// bindings so they stay clear of expression traffic.
    pub fn allocate_module(&mut self, tag: TypeTag, at: u32) -> Result<Reg, PressureExhausted> {
        self.allocate_from(RegTier::Module, tag, at)
    }

    fn allocate_from(
        &mut self,
        first: RegTier,
        tag: TypeTag,
        at: u32,
    ) -> Result<Reg, PressureExhausted> {
        for tier in RegTier::CASCADE[first.cascade_index()..].iter() {
            let idx = tier.cascade_index();

            // Reuse a compatible freed register first. The Temp tier is
            // type-flexible: any freed register qualifies and its tag is
            // rewritten.
            let found = if *tier == RegTier::Temp {
                self.free[idx].pop()
            } else {
                let lifetimes = &self.lifetimes;
                self.free[idx]
                    .iter()
                    .rposition(|r| {
                        lifetimes.get(r).map_or(false, |lt| lt.type_tag == tag)
                    })
                    .map(|pos| self.free[idx].remove(pos))
            };
            if let Some(reg) = found {
                debug_assert!(!self.pinned.contains(&reg));
                let lt = self.lifetimes.get_mut(&reg).expect("pooled register has a lifetime");
                lt.birth_instr = at;
                lt.last_use_instr = at;
                lt.type_tag = tag;
                lt.is_active = true;
                lt.is_reusable = false;
                lt.variable_name = None;
                log::trace!("reuse {} ({:?}) in {:?}", reg, tag, tier);
                return Ok(reg);
            }

            // Advance the high-water mark.
            let (_, end) = tier.range();
            if self.next[idx] < end {
                let reg = Reg(self.next[idx]);
                self.next[idx] += 1;
                self.record_birth(reg, tag, at);
                log::trace!("alloc {} ({:?}) in {:?}", reg, tag, tier);
                return Ok(reg);
            }
        }
        self.allocate_spill(tag, at)
    }

    fn allocate_spill(&mut self, tag: TypeTag, at: u32) -> Result<Reg, PressureExhausted> {
        if self.next_spill == u16::MAX {
            return Err(PressureExhausted);
        }
        let reg = Reg(self.next_spill);
        self.next_spill += 1;
        self.record_birth(reg, tag, at);
        log::trace!("spill alloc {} ({:?})", reg, tag);
        Ok(reg)
    }

    /// Allocate `count` contiguous registers (for call argument windows and
    /// multi-value prints). Contiguity comes from the high-water mark, so
    /// the pool is bypassed.
    pub fn allocate_block(
        &mut self,
        count: u16,
        tag: TypeTag,
        at: u32,
    ) -> Result<Reg, PressureExhausted> {
        if count == 0 {
            return Ok(Reg(0));
        }
        for tier in RegTier::CASCADE.iter() {
            let idx = tier.cascade_index();
            let (_, end) = tier.range();
            if self.next[idx].saturating_add(count) <= end {
                let first = Reg(self.next[idx]);
                for i in 0..count {
                    let reg = Reg(first.0 + i);
                    self.record_birth(reg, tag, at);
                }
                self.next[idx] += count;
                log::trace!("block alloc {}..{} in {:?}", first, Reg(first.0 + count - 1), tier);
                return Ok(first);
            }
        }
        if u32::from(self.next_spill) + u32::from(count) >= u32::from(u16::MAX) {
            return Err(PressureExhausted);
        }
        let first = Reg(self.next_spill);
        for i in 0..count {
            self.record_birth(Reg(first.0 + i), tag, at);
        }
        self.next_spill += count;
        Ok(first)
    }

    fn record_birth(&mut self, reg: Reg, tag: TypeTag, at: u32) {
        self.lifetimes.insert(
            reg,
            RegisterLifetime {
                reg,
                birth_instr: at,
                last_use_instr: at,
                type_tag: tag,
                is_active: true,
                is_reusable: false,
                variable_name: None,
            },
        );
    }

    /// Record a use of `reg` at instruction offset `at`.
    pub fn touch(&mut self, reg: Reg, at: u32) {
        if let Some(lt) = self.lifetimes.get_mut(&reg) {
            lt.last_use_instr = lt.last_use_instr.max(at);
        }
    }

    /// Return `reg` to its tier's free pool. Pinned registers must be
    /// unpinned first; spill ids are retired rather than recycled.
    pub fn free(&mut self, reg: Reg) {
        debug_assert!(!self.pinned.contains(&reg), "freeing pinned {}", reg);
        if let Some(lt) = self.lifetimes.get_mut(&reg) {
            lt.is_active = false;
            lt.is_reusable = true;
        }
        let tier = reg.tier();
        if tier != RegTier::Spill {
            let pool = &mut self.free[tier.cascade_index()];
            debug_assert!(!pool.contains(&reg), "double free of {}", reg);
            pool.push(reg);
        }
        log::trace!("free {}", reg);
    }

    /// Exclude `reg` from reuse until `unpin`.
    pub fn pin(&mut self, reg: Reg) {
        self.pinned.insert(reg);
    }

    /// Release a pinned register for normal management again.
    pub fn unpin(&mut self, reg: Reg) {
        self.pinned.remove(&reg);
    }

    /// Is `reg` currently pinned?
    pub fn is_pinned(&self, reg: Reg) -> bool {
        self.pinned.contains(&reg)
    }

    /// Attach a variable name to the register's lifetime record.
    pub fn set_name(&mut self, reg: Reg, name: &str) {
        if let Some(lt) = self.lifetimes.get_mut(&reg) {
            lt.variable_name = Some(name.to_string());
        }
    }

    /// The lifetime record of `reg`, if it was ever allocated.
    pub fn lifetime(&self, reg: Reg) -> Option<&RegisterLifetime> {
        self.lifetimes.get(&reg)
    }
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocation_starts_at_zero() {
        let mut regs = RegisterAllocator::new();
        let a = regs.allocate(TypeTag::I32, 0).unwrap();
        let b = regs.allocate(TypeTag::I32, 0).unwrap();
        assert_eq!(a, Reg(0));
        assert_eq!(b, Reg(1));
        assert_eq!(a.tier(), RegTier::Global);
    }

    #[test]
    fn freed_register_of_same_type_is_reused() {
        let mut regs = RegisterAllocator::new();
        let a = regs.allocate(TypeTag::I32, 0).unwrap();
        regs.free(a);
        let b = regs.allocate(TypeTag::I32, 4).unwrap();
        assert_eq!(a, b);
        let lt = regs.lifetime(b).unwrap();
        assert!(lt.is_active);
        assert_eq!(lt.birth_instr, 4);
    }

    #[test]
    fn freed_register_of_other_type_is_not_reused_in_global() {
        let mut regs = RegisterAllocator::new();
        let a = regs.allocate(TypeTag::I32, 0).unwrap();
        regs.free(a);
        let b = regs.allocate(TypeTag::F64, 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn pinned_register_is_not_reused() {
        let mut regs = RegisterAllocator::new();
        let a = regs.allocate(TypeTag::I32, 0).unwrap();
        regs.pin(a);
        assert!(regs.is_pinned(a));
        let b = regs.allocate(TypeTag::I32, 0).unwrap();
        assert_ne!(a, b);
        regs.unpin(a);
        regs.free(a);
        let c = regs.allocate(TypeTag::I32, 0).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn module_allocation_lands_in_module_tier() {
        let mut regs = RegisterAllocator::new();
        let m = regs.allocate_module(TypeTag::Func, 0).unwrap();
        assert_eq!(m.tier(), RegTier::Module);
        assert_eq!(m, Reg(352));
    }

    #[test]
    fn exhausting_global_overflows_into_frame() {
        let mut regs = RegisterAllocator::new();
        let mut last = Reg(0);
        for _ in 0..257 {
            last = regs.allocate(TypeTag::I32, 0).unwrap();
        }
        assert_eq!(last, Reg(256));
        assert_eq!(last.tier(), RegTier::Frame);
    }

    #[test]
    fn cascade_reaches_spill() {
        let mut regs = RegisterAllocator::new();
        // Exhaust Global + Frame + Temp + Module = 480 registers.
        let mut last = Reg(0);
        for _ in 0..481 {
            last = regs.allocate(TypeTag::I32, 0).unwrap();
        }
        assert_eq!(last.tier(), RegTier::Spill);
        assert_eq!(last, Reg(480));
    }

    #[test]
    fn block_allocation_is_contiguous() {
        let mut regs = RegisterAllocator::new();
        let _ = regs.allocate(TypeTag::I32, 0).unwrap();
        let first = regs.allocate_block(3, TypeTag::Any, 0).unwrap();
        assert_eq!(first, Reg(1));
        // The block advanced the high-water mark past its last member.
        let next = regs.allocate(TypeTag::I32, 0).unwrap();
        assert_eq!(next, Reg(4));
    }

    #[test]
    fn temp_tier_reuse_is_type_flexible() {
        let mut regs = RegisterAllocator::new();
        // Land an allocation in the Temp tier by filling earlier tiers.
        for _ in 0..320 {
            let _ = regs.allocate(TypeTag::I32, 0).unwrap();
        }
        let t = regs.allocate(TypeTag::I32, 0).unwrap();
        assert_eq!(t.tier(), RegTier::Temp);
        regs.free(t);
        let u = regs.allocate(TypeTag::F64, 0).unwrap();
        // Freed temp reused even though the type differs; earlier tiers are
        // exhausted and their pools hold no f64.
        assert_eq!(u, t);
        assert_eq!(regs.lifetime(u).unwrap().type_tag, TypeTag::F64);
    }
}
