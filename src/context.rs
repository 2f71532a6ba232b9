//! Compilation context and main entry point.
//!
//! A `Context` holds the flags and statistics that survive across
//! compilations; everything else (type arena, environments, register
//! state) is created per unit and dropped when `compile` returns. The
//! pipeline is strictly staged: inference decorates and checks, lowering
//! emits, peephole cleans up. A unit either produces a complete
//! `CompiledUnit` or produces nothing beyond diagnostics.

use crate::ast::Program;
use crate::bytecode::disasm::disassemble;
use crate::bytecode::{CompiledUnit, InstIter};
use crate::diagnostic::Reporter;
use crate::infer::infer_program;
use crate::lower::lower_program;
use crate::peephole;
use crate::result::{CodegenError, CodegenResult};
use crate::settings::{Flags, OptLevel};
use crate::types::TypeArena;

/// Optimization and emission counters for one context.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Loops fully expanded by the unroller.
    pub loops_unrolled: u64,
    /// Invariant expressions hoisted ahead of a loop header.
    pub invariants_hoisted: u64,
    /// Multiplies rewritten as shifts.
    pub strength_reductions_applied: u64,
    /// Array accesses emitted without a runtime bounds check.
    pub bounds_checks_eliminated: u64,
    /// Moves removed by the peephole pass (self-moves and fusions).
    pub moves_eliminated: u64,
    /// Constant loads fused into their destination.
    pub loads_fused: u64,
    /// Constant reloads proven redundant and dropped.
    pub redundant_loads_elided: u64,
    /// Functions compiled into the unit's function table.
    pub functions_compiled: u64,
    /// Instructions in the finished unit, all chunks included.
    pub instructions_emitted: u64,
}

/// Persistent compilation state and the pipeline driver.
pub struct Context {
    /// Compiler flags.
    pub flags: Flags,
    stats: Stats,
}

impl Context {
    /// A context with default flags.
    pub fn new() -> Self {
        Self::with_flags(Flags::default())
    }

    /// A context with the given flags.
    pub fn with_flags(flags: Flags) -> Self {
        Self {
            flags,
            stats: Stats::default(),
        }
    }

    /// Counters accumulated by this context so far.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Compile one program.
    ///
    /// All diagnostics go to `reporter`. On success the returned unit is
    /// complete and executable; on error no bytecode exists at all.
    pub fn compile(
        &mut self,
        program: &Program,
        reporter: &mut dyn Reporter,
    ) -> CodegenResult<CompiledUnit> {
        if self.flags.dump_ast {
            log::debug!("AST:\n{:#?}", program);
        }

        let mut arena = TypeArena::new();
        let typed = match infer_program(&mut arena, program, reporter) {
            Ok(typed) => typed,
            Err(count) => return Err(CodegenError::TypeCheck(count)),
        };

        let mut unit = lower_program(
            &arena,
            &self.flags,
            &mut self.stats,
            reporter,
            &typed,
        )?;

        if self.flags.opt_level != OptLevel::None {
            peephole::run(&mut unit.main, &mut self.stats);
            for chunk in &mut unit.functions {
                peephole::run(chunk, &mut self.stats);
            }
        }

        self.stats.instructions_emitted += InstIter::new(&unit.main.code).count() as u64;
        for chunk in &unit.functions {
            self.stats.instructions_emitted += InstIter::new(&chunk.code).count() as u64;
        }

        if self.flags.dump_bytecode {
            log::debug!("{}", disassemble(&unit.main, &unit.pool));
            for chunk in &unit.functions {
                log::debug!("{}", disassemble(chunk, &unit.pool));
            }
        }
        if self.flags.print_stats {
            log::debug!("stats: {:?}", self.stats);
        }
        Ok(unit)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
