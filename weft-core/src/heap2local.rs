//! Find heap allocations that never escape the current function, and lower
//! the allocation's data into locals. That is, avoid allocating a GC
//! object, and instead use one local for each of its fields.
//!
//! For us to replace an allocation with locals, we need to prove two
//! things:
//!
//! * It must not escape from the function. If it escapes, we must pass out
//!   a reference anyhow.
//! * It must be used "exclusively", without overlap. That is, we cannot
//!   handle the case where a `local.get` might return our allocation, but
//!   might also get some other value.
//!
//! Arrays of a fixed, small size whose accesses all use constant indexes
//! are first lowered into structs, so the struct lowering handles both
//! shapes uniformly.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use anyhow::Result;
use rayon::prelude::*;

use crate::analysis::{
    branches_sent_by_parent, defined_name, immediate_fallthrough, sent_value, BranchTargets,
    LazyLocalGraph, Parents,
};
use crate::{
    refinalize, BinaryOp, Builder, ExprArena, ExprId, ExprKind, Field, Function, HeapType,
    Literal, Module, Nullability, RmwOp, Type, TypeDef, TypeDefKind, TypeIdx, TypeStore,
};

/// Each function is an independent unit of work; the pass runner may
/// distribute functions across workers.
pub const IS_FUNCTION_PARALLEL: bool = true;

/// Arrays at least this large stay on the heap. Valid wasm can contain
/// things like `(array.new (i32.const -1))` which would fail at runtime on
/// a VM limitation anyway, and turning a large heap allocation into that
/// many locals is a poor trade.
const MAX_ARRAY_SIZE: u64 = 20;

/// How a parent expression receives its child operand, with regard to the
/// behavior of a candidate allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interaction {
    /// The parent lets the child escape, e.g. a call argument.
    Escapes,
    /// The parent consumes the child terminally and safely; nothing remains
    /// to flow onward, e.g. a `struct.get` of the reference.
    FullyConsumes,
    /// The child is the single value that can flow out of the parent, e.g.
    /// the final value of a block with no branches.
    Flows,
    /// The child's value continues through the parent but mixed with other
    /// possible values, so the allocation is not used exclusively.
    Mixes,
    /// Not relevant to the analysis.
    None,
}

/// Core analysis that decides whether an allocation escapes, recording the
/// expressions the allocation reaches as it goes so the lowerings can fix
/// them up afterwards.
struct EscapeAnalysis<'a> {
    graph: &'a LazyLocalGraph,
    parents: &'a Parents,
    branch_targets: &'a BranchTargets,
    types: &'a TypeStore,
    /// Every `local.set` written with the allocation; exclusivity of their
    /// gets is verified once the flow drains.
    sets: HashSet<ExprId>,
    /// Every expression the allocation reaches, with its interaction.
    /// Absence means `Interaction::None`.
    reached: HashMap<ExprId, Interaction>,
}

impl<'a> EscapeAnalysis<'a> {
    fn new(
        graph: &'a LazyLocalGraph,
        parents: &'a Parents,
        branch_targets: &'a BranchTargets,
        types: &'a TypeStore,
    ) -> EscapeAnalysis<'a> {
        EscapeAnalysis {
            graph,
            parents,
            branch_targets,
            types,
            sets: HashSet::new(),
            reached: HashMap::new(),
        }
    }

    /// Whether `allocation` escapes `func`. On `false`, [`reached`] holds
    /// every expression the allocation flows through.
    ///
    /// [`reached`]: EscapeAnalysis::reached
    fn escapes(&mut self, func: &Function, allocation: ExprId) -> bool {
        let arena = &func.arena;
        // A queue of flows from children to parents. An entry means the
        // child has already been cleared; what remains is to check the
        // parent and the flow into it.
        let mut queue: VecDeque<(ExprId, Option<ExprId>)> = VecDeque::new();
        let mut seen: HashSet<(ExprId, Option<ExprId>)> = HashSet::new();

        let start = (allocation, self.parents.parent_of(allocation));
        seen.insert(start);
        queue.push_back(start);

        while let Some((child, parent)) = queue.pop_front() {
            let interaction = self.classify(func, allocation, parent, child);
            match interaction {
                Interaction::Escapes | Interaction::Mixes => return true,
                Interaction::FullyConsumes | Interaction::Flows => {}
                Interaction::None => unreachable!("classification is never None"),
            }
            let parent = parent.expect("a non-escaping interaction has a parent");

            if interaction == Interaction::Flows {
                // The value flows through the parent; look further at the
                // grandparent.
                let item = (parent, self.parents.parent_of(parent));
                if seen.insert(item) {
                    queue.push_back(item);
                }
            }

            if matches!(arena[parent].kind, ExprKind::LocalSet { .. }) {
                // One of the sets we are written to; verify exclusivity of
                // its gets at the end, and follow the flow out of them now.
                self.sets.insert(parent);
                for get in self.graph.set_influences(func, parent) {
                    let item = (get, self.parents.parent_of(get));
                    if seen.insert(item) {
                        queue.push_back(item);
                    }
                }
            }

            // If the parent sends us on a branch, follow the flow to the
            // branch target.
            for name in branches_sent_by_parent(arena, child, parent) {
                if let Some(scope) = self.branch_targets.target_of(&name) {
                    let item = (child, Some(scope));
                    if seen.insert(item) {
                        queue.push_back(item);
                    }
                }
            }

            self.reached.insert(child, Interaction::Flows);
            self.reached.insert(parent, interaction);
        }

        !self.gets_are_exclusive_to_sets(func)
    }

    fn classify(
        &self,
        func: &Function,
        allocation: ExprId,
        parent: Option<ExprId>,
        child: ExprId,
    ) -> Interaction {
        let arena = &func.arena;
        // No parent means we are the function body, flowing to the caller.
        let Some(parent) = parent else {
            return Interaction::Escapes;
        };
        let alloc_ty = arena[allocation].ty;

        // Assume escaping unless we are certain otherwise; separately note
        // whether the parent terminally consumes the value.
        let mut escapes = true;
        let mut fully_consumes = false;
        match &arena[parent].kind {
            ExprKind::Block { .. } => escapes = false,
            // If is not listed: for a value to flow through one there must
            // be two arms, so there is no single value falling through.
            ExprKind::Loop { .. } => escapes = false,
            ExprKind::Drop { .. } => {
                escapes = false;
                fully_consumes = true;
            }
            ExprKind::Break { .. } | ExprKind::Switch { .. } => escapes = false,
            ExprKind::LocalGet { .. } | ExprKind::LocalSet { .. } => escapes = false,
            ExprKind::RefIsNull { .. }
            | ExprKind::RefEq { .. }
            | ExprKind::RefTest { .. }
            | ExprKind::RefGetDesc { .. } => {
                escapes = false;
                fully_consumes = true;
            }
            // Our allocation is what flows in, so it is not null and the
            // check cannot trap.
            ExprKind::RefAsNonNull { .. } => escapes = false,
            ExprKind::RefCast { reference, .. } => {
                escapes = false;
                if *reference == child {
                    // A failing cast traps, consuming the value.
                    if !self.types.is_sub_type(alloc_ty, arena[parent].ty) {
                        fully_consumes = true;
                    }
                } else {
                    // The child is the descriptor operand.
                    fully_consumes = true;
                }
            }
            ExprKind::StructSet { reference, .. } => {
                // The reference does not escape (the stored value is
                // another operand and might).
                if *reference == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::StructGet { .. } => {
                escapes = false;
                fully_consumes = true;
            }
            ExprKind::StructRmw { reference, .. } => {
                if *reference == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::StructCmpxchg {
                reference,
                expected,
                ..
            } => {
                if *reference == child || *expected == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::ArraySet {
                reference, index, ..
            } => {
                // Nonconstant indexes escape our ability to analyze them.
                if is_const(arena, *index) && *reference == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::ArrayGet { index, .. } => {
                if is_const(arena, *index) {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            _ => {}
        }

        if escapes {
            return Interaction::Escapes;
        }

        // A parent of non-reference type consumes the value by definition:
        // it does not flow our allocation onward.
        if fully_consumes || !arena[parent].ty.is_ref() {
            return Interaction::FullyConsumes;
        }

        // No other value can be mixed in if the child is the parent's
        // immediate fallthrough.
        if immediate_fallthrough(arena, parent, self.branch_targets) == Some(child) {
            return Interaction::Flows;
        }

        // Likewise if the child reaches the parent scope on its sole
        // branch, with no final value flowing out of the scope's end.
        if let Some(name) = defined_name(arena, parent) {
            let branches = self.branch_targets.branches_to(&name);
            if branches.len() == 1 && sent_value(arena, branches[0]) == Some(child) {
                if let ExprKind::Block { children, .. } = &arena[parent].kind {
                    if let Some(last) = children.last() {
                        if arena[*last].ty == Type::Unreachable {
                            return Interaction::Flows;
                        }
                    }
                }
            }
        }

        Interaction::Mixes
    }

    /// Assuming every recorded set writes exactly our allocation, check
    /// that the gets reading those sets cannot observe any other set.
    fn gets_are_exclusive_to_sets(&self, func: &Function) -> bool {
        let mut gets: BTreeSet<ExprId> = BTreeSet::new();
        for set in &self.sets {
            gets.extend(self.graph.set_influences(func, *set));
        }
        for get in gets {
            for def in self.graph.get_sets(func, get) {
                match def {
                    // The get may observe the local's entry value.
                    None => return false,
                    Some(set) => {
                        if !self.sets.contains(&set) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    fn interaction(&self, id: ExprId) -> Interaction {
        self.reached.get(&id).copied().unwrap_or(Interaction::None)
    }

    /// A replacement stands in for the expression it replaces and inherits
    /// its interaction — unless the replacement is unreachable, in which
    /// case the code traps before the allocation could interact with it.
    fn apply_old_interaction(&mut self, arena: &ExprArena, old: ExprId, replacement: ExprId) {
        debug_assert!(self.reached.contains_key(&old));
        if arena[replacement].ty != Type::Unreachable {
            if let Some(interaction) = self.reached.get(&old).copied() {
                self.reached.insert(replacement, interaction);
            }
        }
    }
}

fn is_const(arena: &ExprArena, id: ExprId) -> bool {
    matches!(arena[id].kind, ExprKind::Const { .. })
}

fn const_index(arena: &ExprArena, id: ExprId) -> u64 {
    match arena[id].kind {
        ExprKind::Const {
            value: Literal::I32(v),
        } => v as u32 as u64,
        ExprKind::Const {
            value: Literal::I64(v),
        } => v as u64,
        _ => unreachable!("expected a constant index"),
    }
}

/// Locals holding references must be defaultable.
fn local_storage_type(ty: Type) -> Type {
    match ty {
        Type::Ref(_, heap) => Type::Ref(Nullability::Nullable, heap),
        other => other,
    }
}

fn rmw_binary(ty: Type, op: RmwOp) -> BinaryOp {
    match (ty, op) {
        (Type::I32, RmwOp::Add) => BinaryOp::AddI32,
        (Type::I32, RmwOp::Sub) => BinaryOp::SubI32,
        (Type::I32, RmwOp::And) => BinaryOp::AndI32,
        (Type::I32, RmwOp::Or) => BinaryOp::OrI32,
        (Type::I32, RmwOp::Xor) => BinaryOp::XorI32,
        (Type::I64, RmwOp::Add) => BinaryOp::AddI64,
        (Type::I64, RmwOp::Sub) => BinaryOp::SubI64,
        (Type::I64, RmwOp::And) => BinaryOp::AndI64,
        (Type::I64, RmwOp::Or) => BinaryOp::OrI64,
        (Type::I64, RmwOp::Xor) => BinaryOp::XorI64,
        _ => unreachable!("no binary operator for {ty:?} {op:?}"),
    }
}

fn eq_binary(ty: Type) -> BinaryOp {
    match ty {
        Type::I32 => BinaryOp::EqI32,
        Type::I64 => BinaryOp::EqI64,
        _ => unreachable!("no equality operator for {ty:?}"),
    }
}

/// Rewrites a proven-non-escaping struct allocation into locals: one local
/// per field (plus one for the descriptor), a null reference standing in
/// for the allocation itself, and every reached use redirected at the
/// locals.
struct StructToLocals<'a, 'b> {
    allocation: ExprId,
    analysis: &'b mut EscapeAnalysis<'a>,
    func: &'b mut Function,
    types: &'a TypeStore,
    fields: Vec<Field>,
    /// One local per field, plus the descriptor local at the end if the
    /// allocation carries one.
    local_indexes: Vec<u32>,
    local_types: Vec<Type>,
    alloc_ty: Type,
    desc_ty: Option<Type>,
    needs_refinalize: bool,
}

impl<'a, 'b> StructToLocals<'a, 'b> {
    fn new(
        allocation: ExprId,
        analysis: &'b mut EscapeAnalysis<'a>,
        func: &'b mut Function,
        types: &'a TypeStore,
    ) -> StructToLocals<'a, 'b> {
        let alloc_ty = func.arena[allocation].ty;
        let HeapType::Defined(idx) = alloc_ty.heap_type() else {
            unreachable!("allocation of an abstract heap type");
        };
        let fields = types.fields_of(idx);
        let desc = match &func.arena[allocation].kind {
            ExprKind::StructNew { descriptor, .. } => *descriptor,
            _ => unreachable!("expected a struct allocation"),
        };
        let desc_ty = desc.map(|d| func.arena[d].ty);

        let mut local_indexes = Vec::new();
        let mut local_types = Vec::new();
        for field in &fields {
            let ty = local_storage_type(field.storage.unpacked());
            local_indexes.push(func.add_var(ty));
            local_types.push(ty);
        }
        if let Some(d_ty) = desc_ty {
            let ty = local_storage_type(d_ty);
            local_indexes.push(func.add_var(ty));
            local_types.push(ty);
        }

        StructToLocals {
            allocation,
            analysis,
            func,
            types,
            fields,
            local_indexes,
            local_types,
            alloc_ty,
            desc_ty,
            needs_refinalize: false,
        }
    }

    fn run(mut self) {
        let body = self.func.body.expect("lowering an imported function");
        let new_body = self.rewrite(body);
        self.func.body = Some(new_body);
        if self.needs_refinalize {
            refinalize::function(self.func, self.types);
        }
    }

    fn rewrite(&mut self, id: ExprId) -> ExprId {
        let children = self.func.arena[id].kind.children();
        for (nth, child) in children.iter().enumerate() {
            let replacement = self.rewrite(*child);
            if replacement != *child {
                self.func.arena.set_child(id, nth, replacement);
            }
        }
        match self.post_visit(id) {
            Some(replacement) => {
                self.analysis
                    .apply_old_interaction(&self.func.arena, id, replacement);
                replacement
            }
            None => id,
        }
    }

    fn interaction(&self, id: ExprId) -> Interaction {
        self.analysis.interaction(id)
    }

    fn post_visit(&mut self, id: ExprId) -> Option<ExprId> {
        let kind = self.func.arena[id].kind.clone();
        match kind {
            ExprKind::Block { .. } | ExprKind::Loop { .. } => {
                self.adjust_type_flowing_through(id);
                None
            }
            ExprKind::Break {
                value, condition, ..
            } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                // A break the allocation flows through now carries a
                // nullable value; recompute its type.
                if condition.is_some() {
                    let ty = value.map_or(Type::None, |v| self.func.arena[v].ty);
                    self.func.arena[id].ty = ty;
                }
                None
            }
            ExprKind::LocalSet { value, is_tee, .. } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                // No sets of the reference are needed anymore.
                if is_tee {
                    Some(value)
                } else {
                    Some(Builder::new(self.func).make_drop(value))
                }
            }
            ExprKind::LocalGet { .. } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                // Every use of this get is dropped or rewritten away, so
                // the value does not matter; a null avoids reading a
                // non-nullable local whose set we just removed.
                let heap = self.func.arena[id].ty.heap_type();
                Some(Builder::new(self.func).make_ref_null(heap))
            }
            ExprKind::StructNew { .. } => {
                if id != self.allocation {
                    return None;
                }
                Some(self.rewrite_allocation(id))
            }
            ExprKind::RefIsNull { .. } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                // The allocation is never null.
                let mut b = Builder::new(self.func);
                let dropped = b.make_drop(id);
                let zero = b.make_const(Literal::I32(0));
                Some(b.make_sequence(dropped, zero))
            }
            ExprKind::RefEq { left, right } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                if self.func.arena[id].ty == Type::Unreachable {
                    return None;
                }
                // Compared to itself the result is 1; our reference does
                // not escape, so against anything else it is 0.
                let result = (self.interaction(left) == Interaction::Flows
                    && self.interaction(right) == Interaction::Flows)
                    as i32;
                let mut b = Builder::new(self.func);
                let d1 = b.make_drop(left);
                let d2 = b.make_drop(right);
                let c = b.make_const(Literal::I32(result));
                Some(b.make_block(vec![d1, d2, c]))
            }
            ExprKind::RefAsNonNull { value } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                // Proven to contain our allocation, so it cannot trap.
                Some(value)
            }
            ExprKind::RefTest { reference, cast_ty } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                // We know the tested value precisely, so the outcome is
                // static.
                let result = self.types.is_sub_type(self.alloc_ty, cast_ty) as i32;
                let mut b = Builder::new(self.func);
                let dropped = b.make_drop(reference);
                let c = b.make_const(Literal::I32(result));
                Some(b.make_sequence(dropped, c))
            }
            ExprKind::RefCast {
                reference,
                descriptor,
            } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                Some(self.rewrite_cast(id, reference, descriptor))
            }
            ExprKind::RefGetDesc { reference } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                let desc_local = self.local_indexes[self.fields.len()];
                let desc_local_ty = self.local_types[self.fields.len()];
                if desc_local_ty != self.func.arena[id].ty {
                    // We know the exact descriptor, which may be more
                    // precise than this expression's static type.
                    self.needs_refinalize = true;
                }
                let mut b = Builder::new(self.func);
                let dropped = b.make_drop(reference);
                let value = b.make_local_get(desc_local, desc_local_ty);
                Some(b.make_sequence(dropped, value))
            }
            ExprKind::StructSet {
                reference,
                field,
                value,
                ..
            } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                // Write the local instead of the heap. The object never
                // escapes this function, so no fence is needed.
                let local = self.local_indexes[field as usize];
                let mut b = Builder::new(self.func);
                let dropped = b.make_drop(reference);
                let set = b.make_local_set(local, value);
                Some(b.make_sequence(dropped, set))
            }
            ExprKind::StructGet {
                reference,
                field,
                signed,
                ..
            } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                let field_decl = self.fields[field as usize];
                let local = self.local_indexes[field as usize];
                let local_ty = self.local_types[field as usize];
                if local_ty != self.func.arena[id].ty {
                    // The get's static type may be less refined than the
                    // reference that actually arrives here.
                    self.needs_refinalize = true;
                }
                let mut b = Builder::new(self.func);
                let dropped = b.make_drop(reference);
                let value = b.make_local_get(local, local_ty);
                let value = b.make_packed_field_get(value, &field_decl, signed);
                Some(b.make_sequence(dropped, value))
            }
            ExprKind::StructRmw {
                op,
                reference,
                field,
                value,
                ..
            } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                Some(self.rewrite_rmw(id, op, reference, field, value))
            }
            ExprKind::StructCmpxchg {
                reference,
                field,
                expected,
                replacement,
                ..
            } => {
                // The allocation may flow in as `expected`, in which case
                // the cmpxchg still operates on a real struct; only a ref
                // being replaced with locals needs rewriting.
                if self.interaction(reference) != Interaction::Flows {
                    return None;
                }
                Some(self.rewrite_cmpxchg(id, reference, field, expected, replacement))
            }
            _ => None,
        }
    }

    /// Our allocation passes through this expression, and rewrites like
    /// removing a `ref.as_non_null` mean the input may now be nullable;
    /// make the flowing type nullable so the result still validates. Only
    /// safe consumers (drops, gets) end up using the value.
    fn adjust_type_flowing_through(&mut self, id: ExprId) {
        if self.interaction(id) != Interaction::Flows {
            return;
        }
        let ty = self.func.arena[id].ty;
        debug_assert!(ty.is_ref());
        self.func.arena[id].ty = Type::nullable(ty.heap_type());
    }

    fn rewrite_allocation(&mut self, id: ExprId) -> ExprId {
        let ExprKind::StructNew {
            operands,
            descriptor,
        } = self.func.arena[id].kind.clone()
        else {
            unreachable!("expected the struct allocation");
        };
        let fields = self.fields.clone();
        let with_default = operands.is_empty() && !fields.is_empty();
        let mut contents = Vec::new();

        // The locals representing the fields may already hold values (we
        // might be in a loop), and computing a later field value may read
        // an earlier field. Evaluate all the operands into temporaries
        // first, and copy into the field locals only afterwards.
        let mut temp_indexes = Vec::new();
        if !with_default {
            for (i, field) in fields.iter().enumerate() {
                let ty = local_storage_type(field.storage.unpacked());
                let temp = self.func.add_var(ty);
                temp_indexes.push(temp);
                let set = Builder::new(self.func).make_local_set(temp, operands[i]);
                contents.push(set);
            }
        }
        let mut desc_temp = None;
        if let Some(desc) = descriptor {
            let d_ty = self.func.arena[desc].ty;
            let temp = self.func.add_var(local_storage_type(d_ty));
            desc_temp = Some(temp);
            let mut b = Builder::new(self.func);
            // Preserve the trap on a null descriptor.
            let desc_value = if d_ty.is_nullable() {
                b.make_ref_as_non_null(desc)
            } else {
                desc
            };
            contents.push(b.make_local_set(temp, desc_value));
        }

        for (i, field) in fields.iter().enumerate() {
            let mut b = Builder::new(self.func);
            let value = if with_default {
                b.make_zero(local_storage_type(field.storage.unpacked()))
            } else {
                b.make_local_get(temp_indexes[i], local_storage_type(field.storage.unpacked()))
            };
            contents.push(b.make_local_set(self.local_indexes[i], value));
        }
        if let Some(temp) = desc_temp {
            let d_ty = self.local_types[fields.len()];
            let mut b = Builder::new(self.func);
            let value = b.make_local_get(temp, d_ty);
            contents.push(b.make_local_set(self.local_indexes[fields.len()], value));
        }

        // The allocation itself becomes a null reference; the code that
        // would consume it is rewritten away before validation.
        let mut b = Builder::new(self.func);
        let null = b.make_ref_null(self.alloc_ty.heap_type());
        contents.push(null);
        b.make_block(contents)
    }

    fn rewrite_cast(
        &mut self,
        id: ExprId,
        reference: ExprId,
        descriptor: Option<ExprId>,
    ) -> ExprId {
        self.needs_refinalize = true;
        let cast_ty = self.func.arena[id].ty;
        match descriptor {
            Some(desc) => {
                let alloc_is_ref = self.interaction(reference) == Interaction::Flows;
                let alloc_is_desc = self.interaction(desc) == Interaction::Flows;
                if self.desc_ty.is_none() || alloc_is_desc {
                    // Casting with our allocation as the descriptor (or
                    // against an allocation that has none) cannot succeed
                    // on a non-null value: the cast value would have had to
                    // escape into the allocation.
                    if alloc_is_desc && !alloc_is_ref && cast_ty.is_nullable() {
                        // A null value could still legally pass. Re-form as
                        // a cast to null, moving the reference past the
                        // dropped descriptor through a scratch local.
                        let ref_ty = self.func.arena[reference].ty;
                        let scratch = self.func.add_var(local_storage_type(ref_ty));
                        let mut b = Builder::new(self.func);
                        let stash = b.make_local_set(scratch, reference);
                        let dropped = b.make_drop(desc);
                        let restored = b.make_local_get(scratch, local_storage_type(ref_ty));
                        let null_cast = b.make_ref_cast(
                            restored,
                            None,
                            cast_ty.with_heap(self.types.bottom(cast_ty.heap_type())),
                        );
                        if let Some(interaction) = self.analysis.reached.get(&id).copied() {
                            self.analysis.reached.insert(null_cast, interaction);
                        }
                        b.make_block(vec![stash, dropped, null_cast])
                    } else {
                        // The cast certainly fails.
                        let mut b = Builder::new(self.func);
                        let d1 = b.make_drop(reference);
                        let d2 = b.make_drop(desc);
                        let u = b.make_unreachable();
                        b.make_block(vec![d1, d2, u])
                    }
                } else {
                    debug_assert!(alloc_is_ref);
                    // The cast succeeds iff the given descriptor is the
                    // allocation's descriptor, and traps otherwise.
                    let desc_local = self.local_indexes[self.fields.len()];
                    let desc_local_ty = self.local_types[self.fields.len()];
                    let heap = self.alloc_ty.heap_type();
                    let mut b = Builder::new(self.func);
                    let dropped = b.make_drop(reference);
                    let stored = b.make_local_get(desc_local, desc_local_ty);
                    let eq = b.make_ref_eq(desc, stored);
                    let null = b.make_ref_null(heap);
                    let trap = b.make_unreachable();
                    let iff = b.make_if(eq, null, Some(trap));
                    b.make_sequence(dropped, iff)
                }
            }
            None => {
                // We know the cast receives our allocation, so its outcome
                // is static.
                if self.types.is_sub_type(self.alloc_ty, cast_ty) {
                    reference
                } else {
                    let mut b = Builder::new(self.func);
                    let dropped = b.make_drop(reference);
                    let u = b.make_unreachable();
                    b.make_sequence(dropped, u)
                }
            }
        }
    }

    fn rewrite_rmw(
        &mut self,
        id: ExprId,
        op: RmwOp,
        reference: ExprId,
        field: u32,
        value: ExprId,
    ) -> ExprId {
        let ty = self.func.arena[id].ty;
        let local = self.local_indexes[field as usize];
        // Hold the unmodified field value while the local is updated, and
        // the evaluated operand while the old value is stashed, in case
        // evaluating the operand changes the field.
        let old_scratch = self.func.add_var(local_storage_type(ty));
        let value_scratch = self.func.add_var(local_storage_type(ty));

        let mut b = Builder::new(self.func);
        let dropped = b.make_drop(reference);
        let stash_value = b.make_local_set(value_scratch, value);
        let old = b.make_local_get(local, ty);
        let stash_old = b.make_local_set(old_scratch, old);
        let new_value = match op {
            RmwOp::Xchg => b.make_local_get(value_scratch, ty),
            _ => {
                let lhs = b.make_local_get(local, ty);
                let rhs = b.make_local_get(value_scratch, ty);
                b.make_binary(rmw_binary(ty, op), lhs, rhs)
            }
        };
        let store = b.make_local_set(local, new_value);
        let unstash = b.make_local_get(old_scratch, ty);
        b.make_block(vec![dropped, stash_value, stash_old, store, unstash])
    }

    fn rewrite_cmpxchg(
        &mut self,
        id: ExprId,
        reference: ExprId,
        field: u32,
        expected: ExprId,
        replacement: ExprId,
    ) -> ExprId {
        let ty = self.func.arena[id].ty;
        let local = self.local_indexes[field as usize];
        let old_scratch = self.func.add_var(local_storage_type(ty));
        let expected_scratch = self.func.add_var(local_storage_type(ty));
        let replacement_scratch = self.func.add_var(local_storage_type(ty));

        let mut b = Builder::new(self.func);
        let dropped = b.make_drop(reference);
        let stash_expected = b.make_local_set(expected_scratch, expected);
        let stash_replacement = b.make_local_set(replacement_scratch, replacement);
        let old = b.make_local_get(local, ty);
        let stash_old = b.make_local_set(old_scratch, old);

        let lhs = b.make_local_get(local, ty);
        let rhs = b.make_local_get(expected_scratch, ty);
        let pred = if ty.is_ref() {
            b.make_ref_eq(lhs, rhs)
        } else {
            b.make_binary(eq_binary(ty), lhs, rhs)
        };
        let new_value = b.make_local_get(replacement_scratch, ty);
        let exchange = b.make_local_set(local, new_value);
        let iff = b.make_if(pred, exchange, None);
        let unstash = b.make_local_get(old_scratch, ty);
        b.make_block(vec![
            dropped,
            stash_expected,
            stash_replacement,
            stash_old,
            iff,
            unstash,
        ])
    }
}

/// Rewrites a non-escaping fixed-size array allocation into an equivalent
/// struct allocation, so [`StructToLocals`] handles both shapes uniformly.
/// Only arrays of fixed size accessed with constant indexes get here, so
/// they are effectively structs already.
struct ArrayToStruct<'a, 'b> {
    allocation: ExprId,
    analysis: &'b mut EscapeAnalysis<'a>,
    func: &'b mut Function,
    types: &'a TypeStore,
    original_ty: Type,
    num_fields: u64,
    struct_new: ExprId,
    replacement: ExprId,
    needs_refinalize: bool,
}

impl<'a, 'b> ArrayToStruct<'a, 'b> {
    fn new(
        allocation: ExprId,
        analysis: &'b mut EscapeAnalysis<'a>,
        func: &'b mut Function,
        types: &'a TypeStore,
    ) -> ArrayToStruct<'a, 'b> {
        let original_ty = func.arena[allocation].ty;
        let HeapType::Defined(array_idx) = original_ty.heap_type() else {
            unreachable!("array allocation of an abstract heap type");
        };
        let element = types.array_element(array_idx);
        let num_fields = array_new_size(&func.arena, allocation);

        // As many fields as the array has slots, all of the element type.
        let struct_idx = types.define(TypeDef {
            kind: TypeDefKind::Struct {
                fields: vec![element; num_fields as usize],
            },
            supertype: None,
            descriptor: None,
        });

        let (struct_new, replacement) =
            build_struct_new(func, allocation, struct_idx, element, num_fields);

        // Inform the analysis about the code we created: the struct
        // lowering only processes expressions the analysis says the
        // allocation flowed through.
        analysis.reached.insert(struct_new, Interaction::Flows);
        analysis.reached.insert(replacement, Interaction::Flows);

        let mut this = ArrayToStruct {
            allocation,
            analysis,
            func,
            types,
            original_ty,
            num_fields,
            struct_new,
            replacement,
            needs_refinalize: false,
        };
        this.retype_reached(array_idx, struct_idx);
        this
    }

    /// Update types along the path the allocation reaches: wherever the
    /// array type (or a supertype of it) appears, the struct type should.
    /// Casts are skipped; they are judged against the original array type
    /// during the walk.
    fn retype_reached(&mut self, array_idx: TypeIdx, struct_idx: TypeIdx) {
        let array_heap = HeapType::Defined(array_idx);
        let struct_heap = HeapType::Defined(struct_idx);
        let reached: Vec<ExprId> = self.analysis.reached.keys().copied().collect();
        for id in reached {
            if matches!(self.func.arena[id].kind, ExprKind::RefCast { .. }) {
                continue;
            }
            let ty = self.func.arena[id].ty;
            if !ty.is_ref() {
                continue;
            }
            let heap = ty.heap_type();
            if self.types.heap_is_sub(array_heap, heap) {
                if heap != array_heap {
                    // The type was generalized as it flowed; we are
                    // refining here.
                    self.needs_refinalize = true;
                }
                self.func.arena[id].ty = ty.with_heap(struct_heap);
            }
        }
    }

    /// Rewrite the allocation and every reached array operation, returning
    /// the `struct.new` for the struct lowering to consume.
    fn run(mut self) -> ExprId {
        let body = self.func.body.expect("lowering an imported function");
        let new_body = self.rewrite(body);
        self.func.body = Some(new_body);
        if self.needs_refinalize {
            refinalize::function(self.func, self.types);
        }
        self.struct_new
    }

    fn rewrite(&mut self, id: ExprId) -> ExprId {
        let children = self.func.arena[id].kind.children();
        for (nth, child) in children.iter().enumerate() {
            let replacement = self.rewrite(*child);
            if replacement != *child {
                self.func.arena.set_child(id, nth, replacement);
            }
        }
        match self.post_visit(id) {
            Some(replacement) => {
                self.analysis
                    .apply_old_interaction(&self.func.arena, id, replacement);
                replacement
            }
            None => id,
        }
    }

    fn interaction(&self, id: ExprId) -> Interaction {
        self.analysis.interaction(id)
    }

    fn post_visit(&mut self, id: ExprId) -> Option<ExprId> {
        let kind = self.func.arena[id].kind.clone();
        match kind {
            ExprKind::ArrayNew { .. } | ExprKind::ArrayNewFixed { .. } => {
                if id != self.allocation {
                    return None;
                }
                Some(self.replacement)
            }
            ExprKind::ArraySet {
                reference,
                index,
                value,
                order,
            } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                let slot = const_index(&self.func.arena, index);
                if slot >= self.num_fields {
                    // An out-of-bounds access traps.
                    let mut b = Builder::new(self.func);
                    let d1 = b.make_drop(reference);
                    let d2 = b.make_drop(value);
                    let u = b.make_unreachable();
                    self.needs_refinalize = true;
                    return Some(b.make_block(vec![d1, d2, u]));
                }
                let mut b = Builder::new(self.func);
                Some(b.make_struct_set(reference, slot as u32, value, order))
            }
            ExprKind::ArrayGet {
                reference,
                index,
                signed,
                order,
            } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                let slot = const_index(&self.func.arena, index);
                if slot >= self.num_fields {
                    let mut b = Builder::new(self.func);
                    let dropped = b.make_drop(reference);
                    let u = b.make_unreachable();
                    self.needs_refinalize = true;
                    return Some(b.make_sequence(dropped, u));
                }
                let ty = self.func.arena[id].ty;
                let mut b = Builder::new(self.func);
                Some(b.make_struct_get(reference, slot as u32, ty, signed, order))
            }
            ExprKind::RefTest { cast_ty, .. } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                // The test must behave as if the value were still an
                // array, so judge it against the original array type.
                let result = self.types.is_sub_type(self.original_ty, cast_ty) as i32;
                let mut b = Builder::new(self.func);
                let dropped = b.make_drop(id);
                let c = b.make_const(Literal::I32(result));
                Some(b.make_sequence(dropped, c))
            }
            ExprKind::RefCast { .. } => {
                if self.interaction(id) == Interaction::None {
                    return None;
                }
                let cast_ty = self.func.arena[id].ty;
                self.needs_refinalize = true;
                if !self.types.is_sub_type(self.original_ty, cast_ty) {
                    // The cast fails; trap.
                    let mut b = Builder::new(self.func);
                    let dropped = b.make_drop(id);
                    let u = b.make_unreachable();
                    Some(b.make_sequence(dropped, u))
                } else {
                    // The cast succeeds. The reference is being removed by
                    // the struct lowering later, so the non-nullable
                    // struct type is fine here.
                    let struct_heap = self.func.arena[self.struct_new].ty.heap_type();
                    self.func.arena[id].ty = Type::non_nullable(struct_heap);
                    None
                }
            }
            _ => None,
        }
    }
}

fn array_new_size(arena: &ExprArena, allocation: ExprId) -> u64 {
    match &arena[allocation].kind {
        ExprKind::ArrayNew { size, .. } => const_index(arena, *size),
        ExprKind::ArrayNewFixed { values } => values.len() as u64,
        _ => unreachable!("bad allocation"),
    }
}

fn build_struct_new(
    func: &mut Function,
    allocation: ExprId,
    struct_idx: TypeIdx,
    element: Field,
    num_fields: u64,
) -> (ExprId, ExprId) {
    match func.arena[allocation].kind.clone() {
        ExprKind::ArrayNew { init: None, .. } => {
            let struct_new = Builder::new(func).make_struct_new(struct_idx, vec![], None);
            (struct_new, struct_new)
        }
        ExprKind::ArrayNew {
            init: Some(init), ..
        } => {
            // The array repeats one value into every slot; evaluate it
            // once into a local and read it per field.
            let elem_ty = local_storage_type(element.storage.unpacked());
            let local = func.add_var(elem_ty);
            let mut b = Builder::new(func);
            let set = b.make_local_set(local, init);
            let gets: Vec<ExprId> = (0..num_fields)
                .map(|_| b.make_local_get(local, elem_ty))
                .collect();
            let struct_new = b.make_struct_new(struct_idx, gets, None);
            let replacement = b.make_sequence(set, struct_new);
            (struct_new, replacement)
        }
        ExprKind::ArrayNewFixed { values } => {
            let struct_new = Builder::new(func).make_struct_new(struct_idx, values, None);
            (struct_new, struct_new)
        }
        _ => unreachable!("bad allocation"),
    }
}

/// Per-function driver: build the shared analysis context once, analyze
/// every candidate allocation against it, and lower the ones that do not
/// escape.
fn optimize_function(func: &mut Function, types: &TypeStore) {
    let Some(body) = func.body else { return };

    let mut struct_news = Vec::new();
    let mut array_news = Vec::new();
    let mut has_pop = false;
    for id in func.arena.descendants(body) {
        let expr = &func.arena[id];
        match &expr.kind {
            ExprKind::StructNew { .. } => {
                // Unreachable allocations are left for dead-code removal.
                if expr.ty != Type::Unreachable {
                    struct_news.push(id);
                }
            }
            ExprKind::ArrayNew { size, .. } => {
                if expr.ty != Type::Unreachable
                    && is_const(&func.arena, *size)
                    && const_index(&func.arena, *size) < MAX_ARRAY_SIZE
                {
                    array_news.push(id);
                }
            }
            ExprKind::ArrayNewFixed { values } => {
                if expr.ty != Type::Unreachable && (values.len() as u64) < MAX_ARRAY_SIZE {
                    array_news.push(id);
                }
            }
            ExprKind::Pop => has_pop = true,
            _ => {}
        }
    }
    if struct_news.is_empty() && array_news.is_empty() {
        return;
    }

    let parents = Parents::new(&func.arena, body);
    let branch_targets = BranchTargets::new(&func.arena, body);
    let graph = LazyLocalGraph::new();
    let mut optimized = false;

    // Lower non-escaping arrays into structs first, so everything below
    // works on structs.
    for allocation in array_news {
        if !can_handle_as_locals(func.arena[allocation].ty, types) {
            continue;
        }
        let mut analysis = EscapeAnalysis::new(&graph, &parents, &branch_targets, types);
        if !analysis.escapes(func, allocation) {
            let struct_new = ArrayToStruct::new(allocation, &mut analysis, func, types).run();
            StructToLocals::new(struct_new, &mut analysis, func, types).run();
            optimized = true;
        }
    }

    for allocation in struct_news {
        if !can_handle_as_locals(func.arena[allocation].ty, types) {
            continue;
        }
        let mut analysis = EscapeAnalysis::new(&graph, &parents, &branch_targets, types);
        if !analysis.escapes(func, allocation) {
            StructToLocals::new(allocation, &mut analysis, func, types).run();
            optimized = true;
        }
    }

    // Every rewrite above creates blocks, which may have buried a pop.
    if has_pop && optimized {
        refinalize::fix_nested_pops(func);
    }
}

/// Whether the allocation's data can live in locals at all.
fn can_handle_as_locals(ty: Type, types: &TypeStore) -> bool {
    if ty == Type::Unreachable {
        return false;
    }
    let HeapType::Defined(idx) = ty.heap_type() else {
        return false;
    };
    // Every storage type the IR models unpacks to a local-storable value
    // type; the check is structured per field so exotic storage can opt
    // out later.
    match types.def(idx).kind {
        TypeDefKind::Struct { fields } => fields
            .iter()
            .all(|f| f.storage.unpacked().is_concrete()),
        TypeDefKind::Array { element } => element.storage.unpacked().is_concrete(),
    }
}

/// Run Heap2Local on every defined function of `module`.
///
/// A single round only: once an allocation is lowered, the residue it
/// leaves (dropped nulls, dead sets) is other passes' concern, and lowering
/// nested allocations needs that residue removed first.
pub fn run(module: &mut Module) -> Result<()> {
    let Module {
        functions, types, ..
    } = module;
    let types: &TypeStore = types;
    functions
        .par_iter_mut()
        .for_each(|func| optimize_function(func, types));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryOrder;

    fn count_kind(func: &Function, pred: impl Fn(&ExprKind) -> bool) -> usize {
        let body = func.body.unwrap();
        func.arena
            .descendants(body)
            .into_iter()
            .filter(|id| pred(&func.arena[*id].kind))
            .count()
    }

    #[test]
    fn test_simple_struct_is_lowered() {
        let mut module = Module::new();
        let boxed = module.types.add_struct(vec![Field::mutable(Type::I32)]);
        let mut func = Function::new("f", vec![], vec![Type::I32]);
        let mut b = Builder::new(&mut func);
        let init = b.make_const(Literal::I32(42));
        let alloc = b.make_struct_new(boxed, vec![init], None);
        let get = b.make_struct_get(alloc, 0, Type::I32, false, MemoryOrder::Unordered);
        func.body = Some(get);
        module.add_function(func);

        run(&mut module).unwrap();

        let func = module.get_function("f").unwrap();
        assert_eq!(
            count_kind(func, |k| matches!(k, ExprKind::StructNew { .. })),
            0
        );
        assert_eq!(
            count_kind(func, |k| matches!(k, ExprKind::StructGet { .. })),
            0
        );
        // One field local plus one operand temporary.
        assert_eq!(func.vars.len(), 2);
    }

    #[test]
    fn test_call_argument_escapes() {
        let mut module = Module::new();
        let boxed = module.types.add_struct(vec![Field::mutable(Type::I32)]);
        module.add_function(Function::new(
            "sink",
            vec![Type::nullable(HeapType::Defined(boxed))],
            vec![],
        ));
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let init = b.make_const(Literal::I32(1));
        let alloc = b.make_struct_new(boxed, vec![init], None);
        let call = b.make_call("sink", vec![alloc], Type::None);
        func.body = Some(call);
        module.add_function(func);

        run(&mut module).unwrap();

        let func = module.get_function("f").unwrap();
        assert_eq!(
            count_kind(func, |k| matches!(k, ExprKind::StructNew { .. })),
            1
        );
        assert!(func.vars.is_empty());
    }

    #[test]
    fn test_mixed_local_bails_on_exclusivity() {
        // local $r is written the allocation on one path and a null on the
        // other; the get cannot be rewritten.
        let mut module = Module::new();
        let boxed = module.types.add_struct(vec![Field::mutable(Type::I32)]);
        let ref_ty = Type::nullable(HeapType::Defined(boxed));
        let mut func = Function::new("f", vec![Type::I32], vec![]);
        func.add_var(ref_ty);
        let mut b = Builder::new(&mut func);
        let cond = b.make_local_get(0, Type::I32);
        let init = b.make_const(Literal::I32(1));
        let alloc = b.make_struct_new(boxed, vec![init], None);
        let set_alloc = b.make_local_set(1, alloc);
        let null = b.make_ref_null(HeapType::Defined(boxed));
        let set_null = b.make_local_set(1, null);
        let iff = b.make_if(cond, set_alloc, Some(set_null));
        let get = b.make_local_get(1, ref_ty);
        let field = b.make_struct_get(get, 0, Type::I32, false, MemoryOrder::Unordered);
        let dropped = b.make_drop(field);
        let block = b.make_block(vec![iff, dropped]);
        func.body = Some(block);
        module.add_function(func);

        run(&mut module).unwrap();

        let func = module.get_function("f").unwrap();
        assert_eq!(
            count_kind(func, |k| matches!(k, ExprKind::StructNew { .. })),
            1
        );
        assert_eq!(
            count_kind(func, |k| matches!(k, ExprKind::StructGet { .. })),
            1
        );
    }
}
