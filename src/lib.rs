//! Capstan bytecode generation library.
//!
//! This crate is the compiler backend of the Capstan language: it consumes
//! a parsed AST (see [`ast`]), runs Hindley–Milner type inference over it,
//! applies a loop-centric optimizer (unrolling, loop-invariant code motion,
//! strength reduction, bounds-check elision), and lowers the result to
//! bytecode for the Capstan register VM, finishing with a peephole pass.
//!
//! The scanner/parser, the VM interpreter loop, and diagnostic rendering
//! live elsewhere; the seams are the [`ast`] input contract, the
//! [`bytecode::CompiledUnit`] output, and the [`diagnostic::Reporter`]
//! trait.
//!
//! Typical embedding:
//!
//! ```
//! use capstan_codegen::{ast, Context, Diagnostics};
//!
//! let mut b = ast::Builder::new();
//! let one = b.int(1);
//! let decl = b.let_("x", one);
//! let x = b.ident("x");
//! let print = b.print(vec![x]);
//! let program = b.program(vec![decl, print]);
//!
//! let mut ctx = Context::new();
//! let mut diags = Diagnostics::new();
//! let unit = ctx.compile(&program, &mut diags).expect("compiles");
//! assert!(!unit.main.code.is_empty());
//! ```

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod ast;
pub mod bytecode;
pub mod diagnostic;
pub mod infer;
pub mod licm;
pub mod loop_analysis;
pub mod regalloc;
pub mod settings;
pub mod symtab;
pub mod typed_ast;
pub mod types;
pub mod value;

mod context;
mod fx;
mod lower;
mod peephole;
mod result;

pub use crate::context::{Context, Stats};
pub use crate::diagnostic::{Diagnostic, Diagnostics, ErrorCode, Reporter, Severity};
pub use crate::result::{CodegenError, CodegenResult};
pub use crate::settings::{Flags, OptLevel};
pub use crate::value::Value;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
