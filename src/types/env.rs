//! The type environment.
//!
//! A stack of lexical scopes mapping names to schemes. Lookup walks from
//! the innermost scope outwards; definition always inserts into the
//! innermost scope, shadowing any outer binding of the same name.

use super::TypeScheme;
use crate::fx::FxHashMap;

/// One name binding.
#[derive(Clone, Debug)]
pub struct Binding {
    /// The bound scheme.
    pub scheme: TypeScheme,
    /// Can the name be assigned after declaration?
    pub mutable: bool,
}

/// Lexically nested name → scheme bindings.
pub struct TypeEnv {
    scopes: Vec<FxHashMap<String, Binding>>,
}

impl TypeEnv {
    /// A fresh environment with one (module) scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![FxHashMap::default()],
        }
    }

    /// Enter a nested scope.
    pub fn push_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    /// Leave the innermost scope, dropping its bindings.
    pub fn pop_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "cannot pop the module scope");
        self.scopes.pop();
    }

    /// Current nesting depth; the module scope is depth 0.
    pub fn depth(&self) -> usize {
        self.scopes.len() - 1
    }

    /// Bind `name` in the innermost scope.
    pub fn define(&mut self, name: &str, scheme: TypeScheme, mutable: bool) {
        self.scopes
            .last_mut()
            .expect("environment always has a scope")
            .insert(name.to_string(), Binding { scheme, mutable });
    }

    /// Look `name` up, innermost scope first.
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }
}

impl Default for TypeEnv {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PrimType, TypeArena, TypeScheme};

    #[test]
    fn shadowing_and_scope_exit() {
        let arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);
        let f64_ty = arena.prim(PrimType::F64);

        let mut env = TypeEnv::new();
        env.define("x", TypeScheme::mono(i32_ty), false);
        env.push_scope();
        env.define("x", TypeScheme::mono(f64_ty), true);
        assert_eq!(env.lookup("x").unwrap().scheme.body, f64_ty);
        assert!(env.lookup("x").unwrap().mutable);
        env.pop_scope();
        assert_eq!(env.lookup("x").unwrap().scheme.body, i32_ty);
        assert!(!env.lookup("x").unwrap().mutable);
    }

    #[test]
    fn missing_name() {
        let env = TypeEnv::new();
        assert!(env.lookup("nope").is_none());
    }
}
