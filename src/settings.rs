//! Compiler settings.
//!
//! A small, flat `Flags` value stands in for a full settings system. The
//! dump flags only affect what gets logged; the emitted bytecode is
//! identical whichever way they are set.

/// Optimization level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptLevel {
    /// Lower the typed tree as-is.
    None,
    /// Run the loop optimizer and the peephole pass.
    Speed,
}

/// Per-context compiler flags.
#[derive(Clone, Debug)]
pub struct Flags {
    /// Optimization level.
    pub opt_level: OptLevel,
    /// Log the AST before inference.
    pub dump_ast: bool,
    /// Log a disassembly of every emitted chunk.
    pub dump_bytecode: bool,
    /// Log optimization statistics after compilation.
    pub print_stats: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            dump_ast: false,
            dump_bytecode: false,
            print_stats: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_optimize() {
        assert_eq!(Flags::default().opt_level, OptLevel::Speed);
    }
}
