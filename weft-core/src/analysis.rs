//! Analysis queries over function bodies.
//!
//! These are built once per function and shared by every allocation the
//! escape analysis considers: a parent map, a branch-target index, and a
//! lazy local dataflow graph that is populated in full on first query and
//! memoized afterwards.

use std::cell::OnceCell;
use std::collections::{BTreeSet, HashMap};

use crate::{ExprArena, ExprId, ExprKind, Function, Name, Type};

/// Total map from every expression reachable in a body to its parent.
/// The root has no entry.
#[derive(Debug, Default)]
pub struct Parents {
    map: HashMap<ExprId, ExprId>,
}

impl Parents {
    /// Build the parent map for the tree rooted at `root`.
    pub fn new(arena: &ExprArena, root: ExprId) -> Parents {
        let mut map = HashMap::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            for child in arena[id].kind.children() {
                map.insert(child, id);
                stack.push(child);
            }
        }
        Parents { map }
    }

    /// The parent of `id`, or `None` at the root.
    pub fn parent_of(&self, id: ExprId) -> Option<ExprId> {
        self.map.get(&id).copied()
    }
}

/// For each named scope, the scope expression and the branch expressions
/// targeting it.
#[derive(Debug, Default)]
pub struct BranchTargets {
    targets: HashMap<Name, ExprId>,
    branches: HashMap<Name, Vec<ExprId>>,
}

impl BranchTargets {
    /// Index the tree rooted at `root`.
    pub fn new(arena: &ExprArena, root: ExprId) -> BranchTargets {
        let mut out = BranchTargets::default();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(name) = defined_name(arena, id) {
                out.targets.insert(name, id);
            }
            match &arena[id].kind {
                ExprKind::Break { target, .. } => {
                    out.branches.entry(target.clone()).or_default().push(id);
                }
                ExprKind::Switch {
                    targets, default, ..
                } => {
                    let mut seen = BTreeSet::new();
                    for t in targets.iter().chain(std::iter::once(default)) {
                        if seen.insert(t.clone()) {
                            out.branches.entry(t.clone()).or_default().push(id);
                        }
                    }
                }
                ExprKind::BrOn { target, .. } => {
                    out.branches.entry(target.clone()).or_default().push(id);
                }
                ExprKind::TryTable { catches, .. } => {
                    for c in catches {
                        out.branches.entry(c.target.clone()).or_default().push(id);
                    }
                }
                _ => {}
            }
            stack.extend(arena[id].kind.children());
        }
        out
    }

    /// The scope expression named `name`.
    pub fn target_of(&self, name: &str) -> Option<ExprId> {
        self.targets.get(name).copied()
    }

    /// Every branch expression targeting `name`.
    pub fn branches_to(&self, name: &str) -> &[ExprId] {
        self.branches.get(name).map_or(&[], |v| v.as_slice())
    }
}

/// The label an expression defines as a branch target, if any.
pub fn defined_name(arena: &ExprArena, id: ExprId) -> Option<Name> {
    match &arena[id].kind {
        ExprKind::Block { name, .. }
        | ExprKind::Loop { name, .. }
        | ExprKind::Try { name, .. } => name.clone(),
        _ => None,
    }
}

/// The value a branch carries to its target, if any.
pub fn sent_value(arena: &ExprArena, branch: ExprId) -> Option<ExprId> {
    match &arena[branch].kind {
        ExprKind::Break { value, .. } => *value,
        ExprKind::Switch { value, .. } => *value,
        ExprKind::BrOn { reference, .. } => Some(*reference),
        _ => None,
    }
}

/// The labels `parent` branches to while carrying exactly `child` as the
/// sent value.
pub fn branches_sent_by_parent(arena: &ExprArena, child: ExprId, parent: ExprId) -> Vec<Name> {
    match &arena[parent].kind {
        ExprKind::Break {
            target,
            value: Some(v),
            ..
        } if *v == child => vec![target.clone()],
        ExprKind::Switch {
            targets,
            default,
            value: Some(v),
            ..
        } if *v == child => {
            let mut out: Vec<Name> = Vec::new();
            for t in targets.iter().chain(std::iter::once(default)) {
                if !out.contains(t) {
                    out.push(t.clone());
                }
            }
            out
        }
        ExprKind::BrOn {
            target, reference, ..
        } if *reference == child => vec![target.clone()],
        _ => Vec::new(),
    }
}

/// The single value that falls through `id` in one step, if any.
///
/// A block only falls through its final child when no branch targets its
/// label; an `if` never has a single fallthrough.
pub fn immediate_fallthrough(
    arena: &ExprArena,
    id: ExprId,
    branch_targets: &BranchTargets,
) -> Option<ExprId> {
    if arena[id].ty == Type::Unreachable {
        return None;
    }
    match &arena[id].kind {
        ExprKind::Block { name, children } => {
            let branched = name
                .as_ref()
                .is_some_and(|n| !branch_targets.branches_to(n).is_empty());
            if branched {
                None
            } else {
                children.last().copied()
            }
        }
        ExprKind::Loop { body, .. } => Some(*body),
        ExprKind::LocalSet {
            value,
            is_tee: true,
            ..
        } => Some(*value),
        ExprKind::Break {
            value: Some(v),
            condition: Some(_),
            ..
        } => Some(*v),
        ExprKind::RefCast { reference, .. } => Some(*reference),
        ExprKind::RefAsNonNull { value } => Some(*value),
        _ => None,
    }
}

/// The sets that may define a `local.get`. `None` denotes the value the
/// local has on function entry (a parameter value or the default).
pub type DefSet = BTreeSet<Option<ExprId>>;

#[derive(Debug, Default)]
struct GraphData {
    sets_of_get: HashMap<ExprId, DefSet>,
    gets_of_set: HashMap<ExprId, BTreeSet<ExprId>>,
}

/// Demand-driven local dataflow: which `local.set`s may be observed by
/// each `local.get`, and conversely. Populated in full on the first query
/// and memoized; querying more never changes prior answers.
#[derive(Debug, Default)]
pub struct LazyLocalGraph {
    data: OnceCell<GraphData>,
}

impl LazyLocalGraph {
    /// An unpopulated graph.
    pub fn new() -> LazyLocalGraph {
        LazyLocalGraph::default()
    }

    fn data(&self, func: &Function) -> &GraphData {
        self.data.get_or_init(|| compute_graph(func))
    }

    /// The sets that may define `get`.
    pub fn get_sets(&self, func: &Function, get: ExprId) -> DefSet {
        self.data(func)
            .sets_of_get
            .get(&get)
            .cloned()
            .unwrap_or_default()
    }

    /// The gets that may observe `set`.
    pub fn set_influences(&self, func: &Function, set: ExprId) -> BTreeSet<ExprId> {
        self.data(func)
            .gets_of_set
            .get(&set)
            .cloned()
            .unwrap_or_default()
    }
}

/// Reaching-definitions environment: per local, the sets that may have
/// written its current value.
type Env = HashMap<u32, DefSet>;

struct FlowState<'f> {
    func: &'f Function,
    data: GraphData,
    /// Environments recorded at branches, keyed by target label.
    pending: HashMap<Name, Env>,
}

fn compute_graph(func: &Function) -> GraphData {
    let mut state = FlowState {
        func,
        data: GraphData::default(),
        pending: HashMap::new(),
    };
    let mut env: Option<Env> = Some(entry_env(func));
    if let Some(body) = func.body {
        state.walk(body, &mut env);
    }
    for (get, sets) in &state.data.sets_of_get {
        for set in sets.iter().flatten() {
            state.data.gets_of_set.entry(*set).or_default().insert(*get);
        }
    }
    state.data
}

fn entry_env(func: &Function) -> Env {
    (0..func.num_locals())
        .map(|i| (i, BTreeSet::from([Option::<ExprId>::None])))
        .collect()
}

fn merge_env(a: Option<Env>, b: Option<Env>) -> Option<Env> {
    match (a, b) {
        (None, x) | (x, None) => x,
        (Some(mut a), Some(b)) => {
            for (local, defs) in b {
                a.entry(local).or_default().extend(defs);
            }
            Some(a)
        }
    }
}

impl FlowState<'_> {
    fn arena(&self) -> &ExprArena {
        &self.func.arena
    }

    fn record_pending(&mut self, target: &Name, env: &Option<Env>) {
        if let Some(env) = env {
            let merged = merge_env(self.pending.remove(target), Some(env.clone()));
            self.pending.insert(target.clone(), merged.unwrap());
        }
    }

    /// Every `local.set` in the subtree at `id`, grouped by local. Used as
    /// the conservative may-have-run set for exception handlers.
    fn sets_in_subtree(&self, id: ExprId) -> HashMap<u32, BTreeSet<Option<ExprId>>> {
        let mut out: HashMap<u32, BTreeSet<Option<ExprId>>> = HashMap::new();
        for e in self.arena().descendants(id) {
            if let ExprKind::LocalSet { index, .. } = self.arena()[e].kind {
                out.entry(index).or_default().insert(Some(e));
            }
        }
        out
    }

    fn handler_env(&self, entry: &Env, body: ExprId) -> Env {
        let mut env = entry.clone();
        for (local, defs) in self.sets_in_subtree(body) {
            env.entry(local).or_default().extend(defs);
        }
        env
    }

    fn walk(&mut self, id: ExprId, env: &mut Option<Env>) {
        let kind = self.arena()[id].kind.clone();
        match kind {
            ExprKind::LocalGet { index } => {
                if let Some(env) = env {
                    let defs = env.get(&index).cloned().unwrap_or_default();
                    self.data.sets_of_get.entry(id).or_default().extend(defs);
                }
            }
            ExprKind::LocalSet { index, value, .. } => {
                self.walk(value, env);
                if let Some(env) = env {
                    env.insert(index, BTreeSet::from([Some(id)]));
                }
            }
            ExprKind::Block { name, children } => {
                for c in children {
                    self.walk(c, env);
                }
                if let Some(name) = name {
                    let breaks = self.pending.remove(&name);
                    *env = merge_env(env.take(), breaks);
                }
            }
            ExprKind::Loop { name, body } => match name {
                None => self.walk(body, env),
                Some(name) => {
                    let entry = env.clone();
                    loop {
                        let continues = self.pending.get(&name).cloned();
                        let mut head = merge_env(entry.clone(), continues.clone());
                        self.walk(body, &mut head);
                        if self.pending.get(&name) == continues.as_ref() {
                            self.pending.remove(&name);
                            *env = head;
                            break;
                        }
                    }
                }
            },
            ExprKind::If {
                condition,
                if_true,
                if_false,
            } => {
                self.walk(condition, env);
                let mut then_env = env.clone();
                self.walk(if_true, &mut then_env);
                match if_false {
                    Some(f) => {
                        let mut else_env = env.clone();
                        self.walk(f, &mut else_env);
                        *env = merge_env(then_env, else_env);
                    }
                    None => *env = merge_env(then_env, env.take()),
                }
            }
            ExprKind::Break {
                target,
                value,
                condition,
            } => {
                if let Some(v) = value {
                    self.walk(v, env);
                }
                if let Some(c) = condition {
                    self.walk(c, env);
                }
                self.record_pending(&target, env);
                if condition.is_none() {
                    *env = None;
                }
            }
            ExprKind::Switch {
                targets,
                default,
                value,
                condition,
            } => {
                if let Some(v) = value {
                    self.walk(v, env);
                }
                self.walk(condition, env);
                for t in targets.iter().chain(std::iter::once(&default)) {
                    let t = t.clone();
                    self.record_pending(&t, env);
                }
                *env = None;
            }
            ExprKind::BrOn {
                target, reference, ..
            } => {
                self.walk(reference, env);
                self.record_pending(&target, env);
            }
            ExprKind::Return { value } => {
                if let Some(v) = value {
                    self.walk(v, env);
                }
                *env = None;
            }
            ExprKind::Unreachable => *env = None,
            ExprKind::Try { body, catches, .. } => {
                let handler = env
                    .as_ref()
                    .map(|entry| self.handler_env(entry, body));
                self.walk(body, env);
                let mut exits = env.take();
                for c in catches {
                    let mut catch_env = handler.clone();
                    self.walk(c.body, &mut catch_env);
                    exits = merge_env(exits, catch_env);
                }
                *env = exits;
            }
            ExprKind::TryTable { body, catches } => {
                let handler = env
                    .as_ref()
                    .map(|entry| self.handler_env(entry, body));
                for c in &catches {
                    self.record_pending(&c.target, &handler);
                }
                self.walk(body, env);
            }
            other => {
                for c in other.children() {
                    self.walk(c, env);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Builder, Literal};

    fn body(func: &mut Function, id: ExprId) {
        func.body = Some(id);
    }

    #[test]
    fn test_parents_total_over_tree() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let c = b.make_const(Literal::I32(1));
        let d = b.make_drop(c);
        let block = b.make_block(vec![d]);
        body(&mut func, block);
        let parents = Parents::new(&func.arena, block);
        assert_eq!(parents.parent_of(c), Some(d));
        assert_eq!(parents.parent_of(d), Some(block));
        assert_eq!(parents.parent_of(block), None);
    }

    #[test]
    fn test_branch_targets_index_breaks() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let br = b.make_break("exit", None, None);
        let block = b.make_named_block("exit", vec![br], Type::None);
        body(&mut func, block);
        let targets = BranchTargets::new(&func.arena, block);
        assert_eq!(targets.target_of("exit"), Some(block));
        assert_eq!(targets.branches_to("exit"), &[br]);
    }

    #[test]
    fn test_fallthrough_of_branched_block_is_none() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let c1 = b.make_const(Literal::I32(1));
        let cond = b.make_local_get(0, Type::I32);
        let br = b.make_break("out", Some(c1), Some(cond));
        let c2 = b.make_const(Literal::I32(2));
        let block = b.make_named_block("out", vec![br, c2], Type::I32);
        body(&mut func, block);
        let targets = BranchTargets::new(&func.arena, block);
        assert_eq!(immediate_fallthrough(&func.arena, block, &targets), None);

        let plain = {
            let mut b = Builder::new(&mut func);
            let x = b.make_const(Literal::I32(5));
            b.make_block(vec![x])
        };
        assert!(immediate_fallthrough(&func.arena, plain, &targets).is_some());
    }

    #[test]
    fn test_local_graph_straight_line() {
        let mut func = Function::new("f", vec![Type::I32], vec![]);
        let mut b = Builder::new(&mut func);
        let v = b.make_const(Literal::I32(1));
        let set = b.make_local_set(0, v);
        let get = b.make_local_get(0, Type::I32);
        let drop = b.make_drop(get);
        let block = b.make_block(vec![set, drop]);
        body(&mut func, block);

        let graph = LazyLocalGraph::new();
        assert_eq!(graph.get_sets(&func, get), BTreeSet::from([Some(set)]));
        assert_eq!(graph.set_influences(&func, set), BTreeSet::from([get]));
    }

    #[test]
    fn test_local_graph_if_join_sees_both_sets() {
        let mut func = Function::new("f", vec![Type::I32], vec![]);
        func.add_var(Type::I32);
        let mut b = Builder::new(&mut func);
        let cond = b.make_local_get(0, Type::I32);
        let v1 = b.make_const(Literal::I32(1));
        let set1 = b.make_local_set(1, v1);
        let v2 = b.make_const(Literal::I32(2));
        let set2 = b.make_local_set(1, v2);
        let iff = b.make_if(cond, set1, Some(set2));
        let get = b.make_local_get(1, Type::I32);
        let drop = b.make_drop(get);
        let block = b.make_block(vec![iff, drop]);
        body(&mut func, block);

        let graph = LazyLocalGraph::new();
        assert_eq!(
            graph.get_sets(&func, get),
            BTreeSet::from([Some(set1), Some(set2)])
        );
    }

    #[test]
    fn test_local_graph_if_without_else_keeps_entry_def() {
        let mut func = Function::new("f", vec![Type::I32], vec![]);
        func.add_var(Type::I32);
        let mut b = Builder::new(&mut func);
        let cond = b.make_local_get(0, Type::I32);
        let v1 = b.make_const(Literal::I32(1));
        let set1 = b.make_local_set(1, v1);
        let iff = b.make_if(cond, set1, None);
        let get = b.make_local_get(1, Type::I32);
        let drop = b.make_drop(get);
        let block = b.make_block(vec![iff, drop]);
        body(&mut func, block);

        let graph = LazyLocalGraph::new();
        assert_eq!(
            graph.get_sets(&func, get),
            BTreeSet::from([None, Some(set1)])
        );
    }

    #[test]
    fn test_local_graph_loop_back_edge() {
        // loop $l { local.set $x ..; br_if $l .. } — the set in the body
        // reaches gets at the loop head on the next iteration.
        let mut func = Function::new("f", vec![Type::I32], vec![]);
        func.add_var(Type::I32);
        let mut b = Builder::new(&mut func);
        let get_head = b.make_local_get(1, Type::I32);
        let drop_head = b.make_drop(get_head);
        let v = b.make_const(Literal::I32(7));
        let set = b.make_local_set(1, v);
        let cond = b.make_local_get(0, Type::I32);
        let br = b.make_break("l", None, Some(cond));
        let loop_body = b.make_block(vec![drop_head, set, br]);
        let looped = b.make_loop(Some("l".into()), loop_body);
        body(&mut func, looped);

        let graph = LazyLocalGraph::new();
        assert_eq!(
            graph.get_sets(&func, get_head),
            BTreeSet::from([None, Some(set)])
        );
    }
}
