//! Union-find unification.
//!
//! Variables form disjoint sets through their `parent` links; `find` returns
//! the class root and compresses the path it walked. A root that has been
//! unified with a non-variable records it in `instance`; `prune` chases
//! instance links to the representative type and compresses those too.
//!
//! `unify` is the only entry point that mutates bindings. It never partially
//! succeeds observably for the error cases callers care about: mismatches
//! are reported before the caller continues, and the recovery `Error`
//! primitive absorbs any type so one reported mismatch doesn't fan out.

use super::{PrimType, Type, TypeArena, TypeData};

/// Why unification failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnifyErrorKind {
    /// Function types with different parameter counts.
    ArityMismatch,
    /// The occurs check rejected an infinite type.
    Occurs,
    /// Different type constructors.
    HeadMismatch,
}

/// A failed unification, with the two offending (pruned) types.
#[derive(Clone, Copy, Debug)]
pub struct UnifyError {
    /// What went wrong.
    pub kind: UnifyErrorKind,
    /// Left-hand type, pruned.
    pub left: Type,
    /// Right-hand type, pruned.
    pub right: Type,
}

/// Find the union-find root of variable `v`, compressing the path.
fn find(arena: &mut TypeArena, v: Type) -> Type {
    debug_assert!(matches!(arena.data(v), TypeData::Var(_)));
    let parent = match arena.data(v) {
        TypeData::Var(var) => var.parent,
        _ => v,
    };
    if parent == v {
        return v;
    }
    let root = find(arena, parent);
    if let TypeData::Var(var) = arena.data_mut(v) {
        var.parent = root;
    }
    root
}

/// Follow instance chains to the representative of `t`, compressing as we
/// go. The result is either a non-variable type or an unbound class root.
pub fn prune(arena: &mut TypeArena, t: Type) -> Type {
    match arena.data(t) {
        TypeData::Var(_) => {
            let root = find(arena, t);
            let instance = match arena.data(root) {
                TypeData::Var(var) => var.instance,
                _ => None,
            };
            match instance {
                Some(inst) => {
                    let rep = prune(arena, inst);
                    if let TypeData::Var(var) = arena.data_mut(root) {
                        var.instance = Some(rep);
                    }
                    rep
                }
                None => root,
            }
        }
        _ => t,
    }
}

/// Does the variable class rooted at `var_root` occur in `t`?
pub fn occurs_in(arena: &mut TypeArena, var_root: Type, t: Type) -> bool {
    let t = prune(arena, t);
    match arena.data(t).clone() {
        TypeData::Var(_) => find(arena, t) == var_root,
        TypeData::Prim(_) => false,
        TypeData::Function { params, ret } => {
            params.iter().any(|p| occurs_in(arena, var_root, *p))
                || occurs_in(arena, var_root, ret)
        }
        TypeData::Array { elem } => occurs_in(arena, var_root, elem),
    }
}

/// Unify two types, binding variables as needed.
pub fn unify(arena: &mut TypeArena, a: Type, b: Type) -> Result<(), UnifyError> {
    let a = prune(arena, a);
    let b = prune(arena, b);
    if a == b {
        return Ok(());
    }

    match (arena.data(a).clone(), arena.data(b).clone()) {
        (TypeData::Var(_), _) => {
            let ra = find(arena, a);
            if let TypeData::Var(_) = arena.data(b) {
                let rb = find(arena, b);
                if ra == rb {
                    return Ok(());
                }
                // Union two unbound classes: point one root at the other.
                if let TypeData::Var(var) = arena.data_mut(ra) {
                    var.parent = rb;
                }
                return Ok(());
            }
            if occurs_in(arena, ra, b) {
                return Err(UnifyError {
                    kind: UnifyErrorKind::Occurs,
                    left: a,
                    right: b,
                });
            }
            if let TypeData::Var(var) = arena.data_mut(ra) {
                var.instance = Some(b);
            }
            Ok(())
        }
        (_, TypeData::Var(_)) => unify(arena, b, a),
        // The recovery type absorbs anything.
        (TypeData::Prim(PrimType::Error), _) | (_, TypeData::Prim(PrimType::Error)) => Ok(()),
        // So does the dynamic top type.
        (TypeData::Prim(PrimType::Any), _) | (_, TypeData::Prim(PrimType::Any)) => Ok(()),
        (TypeData::Prim(pa), TypeData::Prim(pb)) => {
            if pa == pb {
                Ok(())
            } else {
                Err(UnifyError {
                    kind: UnifyErrorKind::HeadMismatch,
                    left: a,
                    right: b,
                })
            }
        }
        (
            TypeData::Function {
                params: pa,
                ret: ra,
            },
            TypeData::Function {
                params: pb,
                ret: rb,
            },
        ) => {
            if pa.len() != pb.len() {
                return Err(UnifyError {
                    kind: UnifyErrorKind::ArityMismatch,
                    left: a,
                    right: b,
                });
            }
            for (x, y) in pa.iter().zip(pb.iter()) {
                unify(arena, *x, *y)?;
            }
            unify(arena, ra, rb)
        }
        (TypeData::Array { elem: ea }, TypeData::Array { elem: eb }) => unify(arena, ea, eb),
        _ => Err(UnifyError {
            kind: UnifyErrorKind::HeadMismatch,
            left: a,
            right: b,
        }),
    }
}

/// Structural equality after pruning. Unbound variables are equal only to
/// their own class.
pub fn types_equal(arena: &mut TypeArena, a: Type, b: Type) -> bool {
    let a = prune(arena, a);
    let b = prune(arena, b);
    if a == b {
        return true;
    }
    match (arena.data(a).clone(), arena.data(b).clone()) {
        (TypeData::Prim(pa), TypeData::Prim(pb)) => pa == pb,
        (
            TypeData::Function {
                params: pa,
                ret: ra,
            },
            TypeData::Function {
                params: pb,
                ret: rb,
            },
        ) => {
            pa.len() == pb.len()
                && pa
                    .iter()
                    .zip(pb.iter())
                    .all(|(x, y)| types_equal(arena, *x, *y))
                && types_equal(arena, ra, rb)
        }
        (TypeData::Array { elem: ea }, TypeData::Array { elem: eb }) => {
            types_equal(arena, ea, eb)
        }
        (TypeData::Var(_), TypeData::Var(_)) => find(arena, a) == find(arena, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unify_identical() {
        let mut arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);
        assert!(unify(&mut arena, i32_ty, i32_ty).is_ok());

        let bool_ty = arena.prim(PrimType::Bool);
        let f1 = arena.function(&[i32_ty], bool_ty);
        let f2 = arena.function(&[i32_ty], bool_ty);
        assert!(unify(&mut arena, f1, f2).is_ok());
    }

    #[test]
    fn unify_binds_var_both_directions() {
        let mut arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);

        let v = arena.fresh_var();
        assert!(unify(&mut arena, v, i32_ty).is_ok());
        assert_eq!(prune(&mut arena, v), i32_ty);

        let w = arena.fresh_var();
        assert!(unify(&mut arena, i32_ty, w).is_ok());
        assert_eq!(prune(&mut arena, w), i32_ty);
    }

    #[test]
    fn unified_types_prune_equal() {
        let mut arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);
        let v = arena.fresh_var();
        let w = arena.fresh_var();
        let f1 = arena.function(&[v], w);
        let bool_ty = arena.prim(PrimType::Bool);
        let f2 = arena.function(&[i32_ty], bool_ty);
        assert!(unify(&mut arena, f1, f2).is_ok());
        assert!(types_equal(&mut arena, f1, f2));
        assert_eq!(prune(&mut arena, v), i32_ty);
        assert_eq!(prune(&mut arena, w), bool_ty);
    }

    #[test]
    fn var_var_union_then_bind() {
        let mut arena = TypeArena::new();
        let v = arena.fresh_var();
        let w = arena.fresh_var();
        assert!(unify(&mut arena, v, w).is_ok());
        let i32_ty = arena.prim(PrimType::I32);
        assert!(unify(&mut arena, w, i32_ty).is_ok());
        // Binding one member of the class binds both.
        assert_eq!(prune(&mut arena, v), i32_ty);
    }

    #[test]
    fn occurs_check_rejects_infinite_function() {
        let mut arena = TypeArena::new();
        let v = arena.fresh_var();
        let i32_ty = arena.prim(PrimType::I32);
        let f = arena.function(&[v], i32_ty);
        let err = unify(&mut arena, v, f).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::Occurs);
    }

    #[test]
    fn occurs_check_rejects_infinite_array() {
        let mut arena = TypeArena::new();
        let v = arena.fresh_var();
        let a = arena.array(v);
        let err = unify(&mut arena, v, a).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::Occurs);
    }

    #[test]
    fn head_mismatch() {
        let mut arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);
        let f64_ty = arena.prim(PrimType::F64);
        let err = unify(&mut arena, i32_ty, f64_ty).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::HeadMismatch);

        let arr = arena.array(i32_ty);
        let err = unify(&mut arena, arr, i32_ty).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::HeadMismatch);
    }

    #[test]
    fn arity_mismatch() {
        let mut arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);
        let bool_ty = arena.prim(PrimType::Bool);
        let f1 = arena.function(&[i32_ty], bool_ty);
        let f2 = arena.function(&[i32_ty, i32_ty], bool_ty);
        let err = unify(&mut arena, f1, f2).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::ArityMismatch);
    }

    #[test]
    fn error_type_absorbs() {
        let mut arena = TypeArena::new();
        let err_ty = arena.prim(PrimType::Error);
        let i32_ty = arena.prim(PrimType::I32);
        let arr = arena.array(i32_ty);
        assert!(unify(&mut arena, err_ty, arr).is_ok());
        assert!(unify(&mut arena, i32_ty, err_ty).is_ok());
    }

    #[test]
    fn generalize_then_instantiate_monomorphic() {
        use super::super::{generalize, instantiate};
        let mut arena = TypeArena::new();
        let i32_ty = arena.prim(PrimType::I32);
        let bool_ty = arena.prim(PrimType::Bool);
        let f = arena.function(&[i32_ty], bool_ty);
        let scheme = generalize(&arena, f);
        let inst = instantiate(&mut arena, &scheme);
        assert!(types_equal(&mut arena, inst, f));
    }
}
