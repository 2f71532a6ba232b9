//! Type representation.
//!
//! All types used during inference live in a `TypeArena` and are addressed
//! by the `Type` entity ref. The arena is the ownership story: type graphs
//! are cyclic through union-find links, so individual nodes are never freed;
//! the whole arena drops at the end of a compilation unit and nothing
//! referencing its types may outlive it.
//!
//! The eleven primitive types are interned at fixed indices when the arena
//! is created, so `TypeArena::prim` is an array lookup and primitives can be
//! compared by entity id alone.

pub mod env;
pub mod unify;

use smallvec::SmallVec;
use core::fmt;

/// An entity ref to a type in a `TypeArena`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Type(u32);

impl Type {
    /// The index of this type in its arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn new(index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize);
        Self(index as u32)
    }
}

/// The primitive types.
///
/// The discriminant order is load-bearing: `TypeArena::new` interns the
/// primitives in this order so that `prim` can index by discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PrimType {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
    Str,
    Void,
    /// Not yet determined; distinct from a fresh inference variable.
    Unknown,
    /// The recovery type produced after a reported error. Unifies with
    /// anything so one mistake doesn't cascade.
    Error,
    /// The dynamic top type.
    Any,
}

impl PrimType {
    const ALL: [PrimType; 11] = [
        PrimType::I32,
        PrimType::I64,
        PrimType::U32,
        PrimType::U64,
        PrimType::F64,
        PrimType::Bool,
        PrimType::Str,
        PrimType::Void,
        PrimType::Unknown,
        PrimType::Error,
        PrimType::Any,
    ];

    /// The source-syntax name of the primitive.
    pub fn name(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F64 => "f64",
            Self::Bool => "bool",
            Self::Str => "string",
            Self::Void => "void",
            Self::Unknown => "unknown",
            Self::Error => "<error>",
            Self::Any => "any",
        }
    }

    /// Is this a numeric type?
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::I32 | Self::I64 | Self::U32 | Self::U64 | Self::F64
        )
    }

    /// Is this an integer type?
    pub fn is_integer(self) -> bool {
        matches!(self, Self::I32 | Self::I64 | Self::U32 | Self::U64)
    }
}

impl fmt::Display for PrimType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The payload of one arena cell.
#[derive(Clone, Debug)]
pub(crate) enum TypeData {
    /// A primitive.
    Prim(PrimType),
    /// A function type.
    Function {
        params: SmallVec<[Type; 4]>,
        ret: Type,
    },
    /// An array type.
    Array { elem: Type },
    /// An inference variable: a union-find node.
    Var(VarData),
}

/// Union-find node state for an inference variable.
///
/// `parent` is the variable's union-find parent (itself when the variable is
/// a class root); `instance` is only meaningful on roots and, when set,
/// points at the type the class is bound to. Path compression rewrites both
/// fields.
#[derive(Clone, Debug)]
pub(crate) struct VarData {
    /// Stable id, used for display and for scheme binding.
    pub id: u32,
    /// Union-find parent; always another `Var` cell.
    pub parent: Type,
    /// The bound type, if the class has been unified with one.
    pub instance: Option<Type>,
}

/// Arena owning every type of one compilation unit.
pub struct TypeArena {
    cells: Vec<TypeData>,
    next_var_id: u32,
}

impl TypeArena {
    /// Create an arena with the primitives interned.
    pub fn new() -> Self {
        let mut arena = Self {
            cells: Vec::with_capacity(64),
            next_var_id: 0,
        };
        for p in PrimType::ALL.iter() {
            arena.cells.push(TypeData::Prim(*p));
        }
        arena
    }

    /// The interned primitive type `p`.
    pub fn prim(&self, p: PrimType) -> Type {
        let t = Type::new(p as usize);
        debug_assert!(matches!(self.cells[t.index()], TypeData::Prim(q) if q == p));
        t
    }

    /// Allocate a fresh, unbound inference variable.
    pub fn fresh_var(&mut self) -> Type {
        let id = self.next_var_id;
        self.next_var_id += 1;
        let t = Type::new(self.cells.len());
        self.cells.push(TypeData::Var(VarData {
            id,
            parent: t,
            instance: None,
        }));
        t
    }

    /// Allocate a function type.
    pub fn function(&mut self, params: &[Type], ret: Type) -> Type {
        let t = Type::new(self.cells.len());
        self.cells.push(TypeData::Function {
            params: SmallVec::from_slice(params),
            ret,
        });
        t
    }

    /// Allocate an array type.
    pub fn array(&mut self, elem: Type) -> Type {
        let t = Type::new(self.cells.len());
        self.cells.push(TypeData::Array { elem });
        t
    }

    /// Number of cells allocated, primitives included.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Is the arena empty? Never true: the primitives are always interned.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub(crate) fn data(&self, t: Type) -> &TypeData {
        &self.cells[t.index()]
    }

    pub(crate) fn data_mut(&mut self, t: Type) -> &mut TypeData {
        &mut self.cells[t.index()]
    }

    /// The primitive kind of `t`, which must already be pruned.
    pub fn as_prim(&self, t: Type) -> Option<PrimType> {
        match self.data(t) {
            TypeData::Prim(p) => Some(*p),
            _ => None,
        }
    }

    /// Element type of `t` if it is an array. `t` must already be pruned.
    pub fn array_elem(&self, t: Type) -> Option<Type> {
        match self.data(t) {
            TypeData::Array { elem } => Some(*elem),
            _ => None,
        }
    }

    /// Parameter and return types of `t` if it is a function. `t` must
    /// already be pruned.
    pub fn as_function(&self, t: Type) -> Option<(&[Type], Type)> {
        match self.data(t) {
            TypeData::Function { params, ret } => Some((params.as_slice(), *ret)),
            _ => None,
        }
    }

    /// An object displaying `t` without mutating the arena. Bound variables
    /// are followed read-only.
    pub fn display(&self, t: Type) -> DisplayType {
        DisplayType { arena: self, ty: t }
    }

    /// Follow parent and instance links read-only, without compression.
    /// Returns a representative suitable for display and inspection.
    pub(crate) fn resolve_shallow(&self, mut t: Type) -> Type {
        loop {
            match self.data(t) {
                TypeData::Var(v) => {
                    if v.parent != t {
                        t = v.parent;
                    } else if let Some(inst) = v.instance {
                        t = inst;
                    } else {
                        return t;
                    }
                }
                _ => return t,
            }
        }
    }
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Displays a type by walking the arena read-only.
pub struct DisplayType<'a> {
    arena: &'a TypeArena,
    ty: Type,
}

impl<'a> fmt::Display for DisplayType<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let t = self.arena.resolve_shallow(self.ty);
        match self.arena.data(t) {
            TypeData::Prim(p) => write!(f, "{}", p),
            TypeData::Function { params, ret } => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", self.arena.display(*p))?;
                }
                write!(f, ") -> {}", self.arena.display(*ret))
            }
            TypeData::Array { elem } => write!(f, "[{}]", self.arena.display(*elem)),
            TypeData::Var(v) => write!(f, "t{}", v.id),
        }
    }
}

/// A possibly-quantified type.
///
/// Generalization is currently trivial (no quantification happens; see
/// DESIGN.md), but schemes and instantiation are kept so the environment
/// has one shape for plain bindings and for functions.
#[derive(Clone, Debug)]
pub struct TypeScheme {
    /// Ids of the quantified variables.
    pub bound: Vec<u32>,
    /// The scheme body.
    pub body: Type,
}

impl TypeScheme {
    /// A monomorphic scheme.
    pub fn mono(body: Type) -> Self {
        Self {
            bound: Vec::new(),
            body,
        }
    }
}

/// Generalize `ty` in the given environment.
///
/// Deliberately trivial: no variables are quantified, so `let` bindings are
/// monomorphic.
pub fn generalize(_arena: &TypeArena, ty: Type) -> TypeScheme {
    TypeScheme::mono(ty)
}

/// Instantiate a scheme: produce a monotype with every bound variable
/// replaced by a fresh one. Monomorphic schemes instantiate to their body
/// unchanged.
pub fn instantiate(arena: &mut TypeArena, scheme: &TypeScheme) -> Type {
    if scheme.bound.is_empty() {
        return scheme.body;
    }
    let mut subst = crate::fx::FxHashMap::default();
    for &id in &scheme.bound {
        let fresh = arena.fresh_var();
        subst.insert(id, fresh);
    }
    copy_with_subst(arena, scheme.body, &subst)
}

fn copy_with_subst(
    arena: &mut TypeArena,
    t: Type,
    subst: &crate::fx::FxHashMap<u32, Type>,
) -> Type {
    let t = unify::prune(arena, t);
    match arena.data(t).clone() {
        TypeData::Var(v) => subst.get(&v.id).copied().unwrap_or(t),
        TypeData::Prim(_) => t,
        TypeData::Function { params, ret } => {
            let new_params: Vec<Type> = params
                .iter()
                .map(|p| copy_with_subst(arena, *p, subst))
                .collect();
            let new_ret = copy_with_subst(arena, ret, subst);
            if new_ret == ret && new_params.as_slice() == params.as_slice() {
                t
            } else {
                arena.function(&new_params, new_ret)
            }
        }
        TypeData::Array { elem } => {
            let new_elem = copy_with_subst(arena, elem, subst);
            if new_elem == elem {
                t
            } else {
                arena.array(new_elem)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_interned() {
        let arena = TypeArena::new();
        assert_eq!(arena.prim(PrimType::I32), arena.prim(PrimType::I32));
        assert_ne!(arena.prim(PrimType::I32), arena.prim(PrimType::I64));
        assert_eq!(arena.as_prim(arena.prim(PrimType::Bool)), Some(PrimType::Bool));
    }

    #[test]
    fn display() {
        let mut arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);
        let f64_ty = arena.prim(PrimType::F64);
        let bool_ty = arena.prim(PrimType::Bool);
        let f = arena.function(&[i32_ty, f64_ty], bool_ty);
        assert_eq!(arena.display(f).to_string(), "fn(i32, f64) -> bool");
        let a = arena.array(i32_ty);
        assert_eq!(arena.display(a).to_string(), "[i32]");
    }

    #[test]
    fn instantiate_monomorphic_is_identity() {
        let mut arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);
        let scheme = generalize(&arena, i32_ty);
        assert!(scheme.bound.is_empty());
        assert_eq!(instantiate(&mut arena, &scheme), i32_ty);
    }

    #[test]
    fn instantiate_replaces_bound_vars() {
        let mut arena = TypeArena::new();
        let v = arena.fresh_var();
        let id = match arena.data(v) {
            TypeData::Var(var) => var.id,
            _ => unreachable!(),
        };
        let i32_ty = arena.prim(PrimType::I32);
        let body = arena.function(&[v], i32_ty);
        let scheme = TypeScheme {
            bound: vec![id],
            body,
        };
        let inst1 = instantiate(&mut arena, &scheme);
        let inst2 = instantiate(&mut arena, &scheme);
        assert_ne!(inst1, inst2);
        let (p1, _) = arena.as_function(inst1).unwrap();
        let (p2, _) = arena.as_function(inst2).unwrap();
        assert_ne!(p1[0], p2[0]);
    }
}
