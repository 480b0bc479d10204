//! Global type recomputation after in-place rewrites, and the
//! exception-handling pop fixup.
//!
//! Rewrites that insert traps or replace casts change static types; rather
//! than threading exact type updates through every rewrite, passes mark
//! themselves dirty and this module recomputes every expression type
//! bottom-up, including block types determined by branch values.

use std::collections::HashMap;

use crate::{
    Builder, ExprArena, ExprId, ExprKind, Function, Module, Name, Type, TypeDefKind, TypeStore,
};

/// Recompute every expression type in `func` bottom-up.
pub fn function(func: &mut Function, types: &TypeStore) {
    let Some(body) = func.body else { return };
    let params = func.params.clone();
    let vars = func.vars.clone();
    let mut finalizer = Refinalizer {
        types,
        params,
        vars,
        sent: HashMap::new(),
    };
    finalizer.walk(&mut func.arena, body);
}

/// Recompute every expression type in every defined function of `module`.
pub fn module(module: &mut Module) {
    let Module {
        functions, types, ..
    } = module;
    for func in functions.iter_mut() {
        if func.body.is_some() {
            function(func, types);
        }
    }
}

struct Refinalizer<'a> {
    types: &'a TypeStore,
    params: Vec<Type>,
    vars: Vec<Type>,
    /// Types of values sent to each label by branches seen so far. Branches
    /// appear before their target scope in postorder, so a scope can
    /// consume its entries when it is finalized.
    sent: HashMap<Name, Vec<Type>>,
}

impl Refinalizer<'_> {
    fn local_type(&self, index: u32) -> Type {
        let index = index as usize;
        if index < self.params.len() {
            self.params[index]
        } else {
            self.vars[index - self.params.len()]
        }
    }

    fn walk(&mut self, arena: &mut ExprArena, id: ExprId) {
        for child in arena[id].kind.children() {
            self.walk(arena, child);
        }
        let ty = self.compute_type(arena, id);
        arena[id].ty = ty;
    }

    fn any_unreachable(&self, arena: &ExprArena, ids: &[ExprId]) -> bool {
        ids.iter().any(|id| arena[*id].ty == Type::Unreachable)
    }

    fn compute_type(&mut self, arena: &ExprArena, id: ExprId) -> Type {
        let current = arena[id].ty;
        match &arena[id].kind {
            ExprKind::Nop => Type::None,
            ExprKind::Unreachable | ExprKind::Return { .. } => Type::Unreachable,
            ExprKind::Pop => current,
            ExprKind::Const { value } => value.ty(),
            ExprKind::Binary { op, left, right } => {
                if self.any_unreachable(arena, &[*left, *right]) {
                    Type::Unreachable
                } else {
                    op.result_type()
                }
            }
            ExprKind::Drop { value } => {
                if arena[*value].ty == Type::Unreachable {
                    Type::Unreachable
                } else {
                    Type::None
                }
            }
            ExprKind::Block { name, children } => {
                let base = children.last().map_or(Type::None, |last| arena[*last].ty);
                let branch_tys = name
                    .as_ref()
                    .and_then(|n| self.sent.remove(n))
                    .unwrap_or_default();
                if branch_tys.is_empty() {
                    return base;
                }
                let mut tys = branch_tys;
                if base != Type::Unreachable {
                    tys.push(base);
                }
                tys.into_iter()
                    .reduce(|a, b| self.types.lub(a, b))
                    .unwrap_or(Type::Unreachable)
            }
            ExprKind::Loop { name, body } => {
                // Branches to a loop re-enter at the top and carry no value
                // out of it.
                if let Some(n) = name {
                    self.sent.remove(n);
                }
                arena[*body].ty
            }
            ExprKind::If {
                condition,
                if_true,
                if_false,
            } => {
                if arena[*condition].ty == Type::Unreachable {
                    return Type::Unreachable;
                }
                match if_false {
                    None => Type::None,
                    Some(f) => {
                        let t_ty = arena[*if_true].ty;
                        let f_ty = arena[*f].ty;
                        match (t_ty, f_ty) {
                            (Type::Unreachable, Type::Unreachable) => Type::Unreachable,
                            (Type::Unreachable, other) | (other, Type::Unreachable) => other,
                            (a, b) => self.types.lub(a, b),
                        }
                    }
                }
            }
            ExprKind::Try {
                name,
                body,
                catches,
            } => {
                if let Some(n) = name {
                    self.sent.remove(n);
                }
                let mut ty = Type::Unreachable;
                for arm in std::iter::once(*body).chain(catches.iter().map(|c| c.body)) {
                    let arm_ty = arena[arm].ty;
                    if arm_ty != Type::Unreachable {
                        ty = if ty == Type::Unreachable {
                            arm_ty
                        } else {
                            self.types.lub(ty, arm_ty)
                        };
                    }
                }
                ty
            }
            ExprKind::TryTable { body, .. } => arena[*body].ty,
            ExprKind::Break {
                target,
                value,
                condition,
            } => {
                let sent_ty = value.map_or(Type::None, |v| arena[v].ty);
                self.sent.entry(target.clone()).or_default().push(sent_ty);
                match condition {
                    None => Type::Unreachable,
                    Some(c) => {
                        if arena[*c].ty == Type::Unreachable || sent_ty == Type::Unreachable {
                            Type::Unreachable
                        } else {
                            sent_ty
                        }
                    }
                }
            }
            ExprKind::Switch {
                targets,
                default,
                value,
                ..
            } => {
                let sent_ty = value.map_or(Type::None, |v| arena[v].ty);
                for t in targets.iter().chain(std::iter::once(default)) {
                    self.sent.entry(t.clone()).or_default().push(sent_ty);
                }
                Type::Unreachable
            }
            ExprKind::BrOn {
                target, reference, ..
            } => {
                let ref_ty = arena[*reference].ty;
                self.sent.entry(target.clone()).or_default().push(ref_ty);
                if ref_ty == Type::Unreachable {
                    Type::Unreachable
                } else {
                    current
                }
            }
            ExprKind::Call {
                operands,
                result_ty,
                ..
            } => {
                if self.any_unreachable(arena, operands) {
                    Type::Unreachable
                } else {
                    *result_ty
                }
            }
            ExprKind::LocalGet { .. } => current,
            ExprKind::LocalSet {
                index,
                value,
                is_tee,
            } => {
                if arena[*value].ty == Type::Unreachable {
                    Type::Unreachable
                } else if *is_tee {
                    self.local_type(*index)
                } else {
                    Type::None
                }
            }
            ExprKind::RefNull { .. } => current,
            ExprKind::RefIsNull { value } => {
                if arena[*value].ty == Type::Unreachable {
                    Type::Unreachable
                } else {
                    Type::I32
                }
            }
            ExprKind::RefEq { left, right } => {
                if self.any_unreachable(arena, &[*left, *right]) {
                    Type::Unreachable
                } else {
                    Type::I32
                }
            }
            ExprKind::RefAsNonNull { value } => match arena[*value].ty {
                Type::Unreachable => Type::Unreachable,
                Type::Ref(_, heap) => Type::non_nullable(heap),
                _ => current,
            },
            ExprKind::RefTest { reference, .. } => {
                if arena[*reference].ty == Type::Unreachable {
                    Type::Unreachable
                } else {
                    Type::I32
                }
            }
            ExprKind::RefCast {
                reference,
                descriptor,
            } => {
                let mut operands = vec![*reference];
                operands.extend(*descriptor);
                if self.any_unreachable(arena, &operands) {
                    Type::Unreachable
                } else {
                    current
                }
            }
            ExprKind::RefGetDesc { reference } => {
                if arena[*reference].ty == Type::Unreachable {
                    Type::Unreachable
                } else {
                    current
                }
            }
            ExprKind::StructNew {
                operands,
                descriptor,
            } => {
                let mut all = operands.clone();
                all.extend(*descriptor);
                if self.any_unreachable(arena, &all) {
                    Type::Unreachable
                } else {
                    current
                }
            }
            ExprKind::StructGet {
                reference, field, ..
            } => match arena[*reference].ty {
                Type::Unreachable => Type::Unreachable,
                Type::Ref(_, crate::HeapType::Defined(idx)) => {
                    match self.types.def(idx).kind {
                        TypeDefKind::Struct { fields } => {
                            fields[*field as usize].storage.unpacked()
                        }
                        TypeDefKind::Array { .. } => current,
                    }
                }
                _ => current,
            },
            ExprKind::StructSet {
                reference, value, ..
            } => {
                if self.any_unreachable(arena, &[*reference, *value]) {
                    Type::Unreachable
                } else {
                    Type::None
                }
            }
            ExprKind::StructRmw {
                reference, value, ..
            } => {
                if self.any_unreachable(arena, &[*reference, *value]) {
                    Type::Unreachable
                } else {
                    current
                }
            }
            ExprKind::StructCmpxchg {
                reference,
                expected,
                replacement,
                ..
            } => {
                if self.any_unreachable(arena, &[*reference, *expected, *replacement]) {
                    Type::Unreachable
                } else {
                    current
                }
            }
            ExprKind::ArrayNew { init, size } => {
                let mut all = vec![*size];
                all.extend(*init);
                if self.any_unreachable(arena, &all) {
                    Type::Unreachable
                } else {
                    current
                }
            }
            ExprKind::ArrayNewFixed { values } => {
                if self.any_unreachable(arena, values) {
                    Type::Unreachable
                } else {
                    current
                }
            }
            ExprKind::ArrayGet {
                reference, index, ..
            } => match (arena[*reference].ty, arena[*index].ty) {
                (Type::Unreachable, _) | (_, Type::Unreachable) => Type::Unreachable,
                (Type::Ref(_, crate::HeapType::Defined(idx)), _) => {
                    match self.types.def(idx).kind {
                        TypeDefKind::Array { element } => element.storage.unpacked(),
                        TypeDefKind::Struct { .. } => current,
                    }
                }
                _ => current,
            },
            ExprKind::ArraySet {
                reference,
                index,
                value,
                ..
            } => {
                if self.any_unreachable(arena, &[*reference, *index, *value]) {
                    Type::Unreachable
                } else {
                    Type::None
                }
            }
        }
    }
}

/// Hoist any `Pop` that a rewrite buried inside a freshly created block
/// back to the top of its catch body, threading the value through a new
/// local. Catch handlers require their pop before any other structure.
pub fn fix_nested_pops(func: &mut Function) {
    let Some(body) = func.body else { return };
    let tries: Vec<ExprId> = func
        .arena
        .descendants(body)
        .into_iter()
        .filter(|id| matches!(func.arena[*id].kind, ExprKind::Try { .. }))
        .collect();
    for try_id in tries {
        let ExprKind::Try { catches, .. } = &func.arena[try_id].kind else {
            unreachable!();
        };
        let catch_bodies: Vec<(usize, ExprId)> =
            catches.iter().enumerate().map(|(i, c)| (i, c.body)).collect();
        for (catch_idx, catch_body) in catch_bodies {
            let Some(pop) = find_pop(&func.arena, catch_body) else {
                continue;
            };
            if pop_is_at_top(&func.arena, catch_body, pop) {
                continue;
            }
            let pop_ty = func.arena[pop].ty;
            let local = func.add_var(pop_ty);
            let mut builder = Builder::new(func);
            let get = builder.make_local_get(local, pop_ty);
            replace_child(&mut func.arena, catch_body, pop, get);
            let fresh_pop = func.arena.alloc(ExprKind::Pop, pop_ty);
            let mut builder = Builder::new(func);
            let set = builder.make_local_set(local, fresh_pop);
            let new_body = builder.make_sequence(set, catch_body);
            let ExprKind::Try { catches, .. } = &mut func.arena[try_id].kind else {
                unreachable!();
            };
            catches[catch_idx].body = new_body;
        }
    }
}

fn find_pop(arena: &ExprArena, root: ExprId) -> Option<ExprId> {
    arena
        .descendants(root)
        .into_iter()
        .find(|id| matches!(arena[*id].kind, ExprKind::Pop))
}

fn pop_is_at_top(arena: &ExprArena, body: ExprId, pop: ExprId) -> bool {
    if body == pop {
        return true;
    }
    match &arena[body].kind {
        ExprKind::Block { children, .. } => children.first() == Some(&pop),
        ExprKind::LocalSet { value, .. } => *value == pop,
        _ => false,
    }
}

fn replace_child(arena: &mut ExprArena, root: ExprId, old: ExprId, new: ExprId) {
    for id in arena.descendants(root) {
        if let Some(nth) = arena[id].kind.children().iter().position(|k| *k == old) {
            arena.set_child(id, nth, new);
            return;
        }
    }
    unreachable!("child to replace not found in subtree");
}
