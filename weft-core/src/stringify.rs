//! Module linearization for outlining.
//!
//! Walks an entire module into a sequence of 32-bit symbols: every concrete
//! expression contributes one symbol shared by all structurally equal
//! expressions, while control-flow scope boundaries contribute symbols that
//! are unique in the whole program, so no repeated substring can span a
//! scope boundary. The contents of control-flow structures are deferred and
//! emitted between their own boundary symbols, breadth-first.
//!
//! Alongside the symbols the walker records a replayable event list; the
//! outlining rewriter drives function reconstruction from it.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Range;

use crate::suffix_tree::RepeatedSubstring;
use crate::{ExprArena, ExprId, ExprKind, Function, HeapType, Module, Type};

/// A control-flow boundary in the linearized program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// Start of a defined function's code; the sole reset point for
    /// per-function instruction counting.
    FuncStart(usize),
    /// Start of a block's contents.
    BlockStart(ExprId),
    /// Start of a loop's contents.
    LoopStart(ExprId),
    /// Start of an `if`'s taken arm.
    IfStart(ExprId),
    /// Start of an `if`'s other arm.
    ElseStart(ExprId),
    /// Start of a `try`'s protected body.
    TryStart(ExprId),
    /// Start of a tagged catch handler (try id, catch index).
    Catch(ExprId, usize),
    /// Start of a catch-all handler (try id, catch index).
    CatchAll(ExprId, usize),
    /// Start of a `try_table`'s body.
    TryTableStart(ExprId),
    /// End of the innermost open scope.
    End,
}

/// One step of the linearized program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A concrete expression, visited shallowly.
    Expr(ExprId),
    /// A scope boundary.
    Separator(Separator),
}

/// The linearization of a module.
#[derive(Debug, Default)]
pub struct Stringified {
    /// One symbol per program step; structurally equal expressions share a
    /// symbol, separators never repeat.
    pub symbols: Vec<u32>,
    /// The expression behind each symbol as (function index, expression),
    /// or `None` at separators.
    pub exprs: Vec<Option<(usize, ExprId)>>,
    /// The replayable step list, index-aligned with `symbols`.
    pub events: Vec<Event>,
    /// Program index and function index of each function-start separator.
    func_starts: Vec<(usize, usize)>,
}

impl Stringified {
    /// Map a program-wide index to the instruction index within its
    /// enclosing function (the function-start separator is relative index
    /// 0) and that function's index.
    pub fn make_relative(&self, program_idx: usize) -> (u32, usize) {
        let at = self
            .func_starts
            .partition_point(|(start, _)| *start <= program_idx);
        debug_assert!(at > 0, "index before the first function");
        let (start, func_idx) = self.func_starts[at - 1];
        ((program_idx - start) as u32, func_idx)
    }

    /// The event range belonging to function `func_idx`.
    pub fn function_events(&self, func_idx: usize) -> Range<usize> {
        let at = self
            .func_starts
            .iter()
            .position(|(_, f)| *f == func_idx)
            .expect("function was not stringified");
        let start = self.func_starts[at].0;
        let end = self
            .func_starts
            .get(at + 1)
            .map_or(self.events.len(), |(s, _)| *s);
        start..end
    }
}

/// Linearize every defined function of `module`.
pub fn stringify_module(module: &Module) -> Stringified {
    let mut walker = Stringifier {
        out: Stringified::default(),
        interner: HashMap::new(),
        next_symbol: 0,
    };
    for (func_idx, func) in module.functions.iter().enumerate() {
        let Some(body) = func.body else { continue };
        walker
            .out
            .func_starts
            .push((walker.out.symbols.len(), func_idx));
        walker.separator(Separator::FuncStart(func_idx));
        let mut deferred = VecDeque::new();
        walker.shallow_walk(func, func_idx, body, &mut deferred);
        walker.separator(Separator::End);
        while let Some(scope) = deferred.pop_front() {
            walker.walk_scope(func, func_idx, scope, &mut deferred);
        }
    }
    walker.out
}

struct Stringifier {
    out: Stringified,
    interner: HashMap<Vec<u64>, u32>,
    next_symbol: u32,
}

impl Stringifier {
    fn fresh_symbol(&mut self) -> u32 {
        let s = self.next_symbol;
        self.next_symbol += 1;
        s
    }

    fn separator(&mut self, sep: Separator) {
        let symbol = self.fresh_symbol();
        self.out.symbols.push(symbol);
        self.out.exprs.push(None);
        self.out.events.push(Event::Separator(sep));
    }

    fn emit_expr(&mut self, func: &Function, func_idx: usize, id: ExprId) {
        let key = symbol_key(&func.arena, id);
        let symbol = match self.interner.get(&key) {
            Some(s) => *s,
            None => {
                let s = self.fresh_symbol();
                self.interner.insert(key, s);
                s
            }
        };
        self.out.symbols.push(symbol);
        self.out.exprs.push(Some((func_idx, id)));
        self.out.events.push(Event::Expr(id));
    }

    /// Emit the expressions of one scope in stack-machine order, deferring
    /// the contents of nested control flow. An `if`'s condition belongs to
    /// the enclosing scope.
    fn shallow_walk(
        &mut self,
        func: &Function,
        func_idx: usize,
        id: ExprId,
        deferred: &mut VecDeque<ExprId>,
    ) {
        match &func.arena[id].kind {
            ExprKind::If { condition, .. } => {
                self.shallow_walk(func, func_idx, *condition, deferred);
                deferred.push_back(id);
                self.emit_expr(func, func_idx, id);
            }
            kind if kind.is_control_flow() => {
                deferred.push_back(id);
                self.emit_expr(func, func_idx, id);
            }
            kind => {
                for child in kind.children() {
                    self.shallow_walk(func, func_idx, child, deferred);
                }
                self.emit_expr(func, func_idx, id);
            }
        }
    }

    fn walk_scope(
        &mut self,
        func: &Function,
        func_idx: usize,
        scope: ExprId,
        deferred: &mut VecDeque<ExprId>,
    ) {
        match func.arena[scope].kind.clone() {
            ExprKind::Block { children, .. } => {
                self.separator(Separator::BlockStart(scope));
                for child in children {
                    self.shallow_walk(func, func_idx, child, deferred);
                }
                self.separator(Separator::End);
            }
            ExprKind::Loop { body, .. } => {
                self.separator(Separator::LoopStart(scope));
                self.shallow_walk(func, func_idx, body, deferred);
                self.separator(Separator::End);
            }
            ExprKind::If {
                if_true, if_false, ..
            } => {
                self.separator(Separator::IfStart(scope));
                self.shallow_walk(func, func_idx, if_true, deferred);
                if let Some(f) = if_false {
                    self.separator(Separator::ElseStart(scope));
                    self.shallow_walk(func, func_idx, f, deferred);
                }
                self.separator(Separator::End);
            }
            ExprKind::Try { body, catches, .. } => {
                self.separator(Separator::TryStart(scope));
                self.shallow_walk(func, func_idx, body, deferred);
                for (i, catch) in catches.iter().enumerate() {
                    if catch.tag.is_some() {
                        self.separator(Separator::Catch(scope, i));
                    } else {
                        self.separator(Separator::CatchAll(scope, i));
                    }
                    self.shallow_walk(func, func_idx, catch.body, deferred);
                }
                self.separator(Separator::End);
            }
            ExprKind::TryTable { body, .. } => {
                self.separator(Separator::TryTableStart(scope));
                self.shallow_walk(func, func_idx, body, deferred);
                self.separator(Separator::End);
            }
            _ => unreachable!("deferred a non-scope expression"),
        }
    }
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

fn push_type(out: &mut Vec<u64>, ty: Type) {
    match ty {
        Type::None => out.push(0),
        Type::Unreachable => out.push(1),
        Type::I32 => out.push(2),
        Type::I64 => out.push(3),
        Type::F32 => out.push(4),
        Type::F64 => out.push(5),
        Type::Ref(nullability, heap) => {
            out.push(6 + nullability as u64);
            match heap {
                HeapType::Any => out.push(0),
                HeapType::Eq => out.push(1),
                HeapType::Struct => out.push(2),
                HeapType::Array => out.push(3),
                HeapType::None => out.push(4),
                HeapType::Defined(idx) => out.push(5 + idx.0 as u64),
            }
        }
    }
}

/// The interning key for one program symbol.
///
/// Plain expressions use a shallow content key: operator, immediates,
/// operand arity and operand types, so two shallow-equal expressions share
/// a symbol. Control-flow structures are keyed over their full deferred
/// contents (minus an `if`'s condition, which is walked in the enclosing
/// scope): their contents move wholesale when an occurrence is outlined, so
/// symbol equality must imply content equality.
fn symbol_key(arena: &ExprArena, id: ExprId) -> Vec<u64> {
    let mut out = Vec::new();
    if arena[id].kind.is_control_flow() {
        out.push(u64::MAX); // distinguish deep keys from shallow ones
        push_deep(arena, id, &mut out);
    } else {
        push_shallow(arena, id, &mut out);
        out.push(arena[id].kind.operand_children().len() as u64);
        for child in arena[id].kind.operand_children() {
            push_type(&mut out, arena[child].ty);
        }
    }
    out
}

/// Operator, type, and immediates — no children.
fn push_shallow(arena: &ExprArena, id: ExprId, out: &mut Vec<u64>) {
    let expr = &arena[id];
    let disc = |n: u64| n << 32;
    match &expr.kind {
        ExprKind::Nop => out.push(disc(0)),
        ExprKind::Unreachable => out.push(disc(1)),
        ExprKind::Pop => out.push(disc(2)),
        ExprKind::Const { value } => {
            out.push(disc(3));
            match value {
                crate::Literal::I32(v) => {
                    out.push(0);
                    out.push(*v as u32 as u64);
                }
                crate::Literal::I64(v) => {
                    out.push(1);
                    out.push(*v as u64);
                }
                crate::Literal::F32(bits) => {
                    out.push(2);
                    out.push(*bits as u64);
                }
                crate::Literal::F64(bits) => {
                    out.push(3);
                    out.push(*bits);
                }
            }
        }
        ExprKind::Binary { op, .. } => {
            out.push(disc(4));
            out.push(*op as u64);
        }
        ExprKind::Drop { .. } => out.push(disc(5)),
        // Scope labels are binding-internal and excluded; branches to them
        // appear with the label in their own keys.
        ExprKind::Block { .. } => out.push(disc(6)),
        ExprKind::Loop { .. } => out.push(disc(7)),
        ExprKind::If { if_false, .. } => {
            out.push(disc(8));
            out.push(if_false.is_some() as u64);
        }
        ExprKind::Try { catches, .. } => {
            out.push(disc(9));
            out.push(catches.len() as u64);
            for catch in catches {
                out.push(catch.tag.as_deref().map_or(0, hash_name));
            }
        }
        ExprKind::TryTable { catches, .. } => {
            out.push(disc(10));
            out.push(catches.len() as u64);
            for catch in catches {
                out.push(catch.tag.as_deref().map_or(0, hash_name));
                out.push(hash_name(&catch.target));
            }
        }
        ExprKind::Break {
            target,
            value,
            condition,
        } => {
            out.push(disc(11));
            out.push(hash_name(target));
            out.push(value.is_some() as u64);
            out.push(condition.is_some() as u64);
        }
        ExprKind::Switch {
            targets,
            default,
            value,
            ..
        } => {
            out.push(disc(12));
            out.push(targets.len() as u64);
            for t in targets {
                out.push(hash_name(t));
            }
            out.push(hash_name(default));
            out.push(value.is_some() as u64);
        }
        ExprKind::BrOn {
            op,
            target,
            cast_ty,
            ..
        } => {
            out.push(disc(13));
            out.push(*op as u64);
            out.push(hash_name(target));
            push_type(out, *cast_ty);
        }
        ExprKind::Return { value } => {
            out.push(disc(14));
            out.push(value.is_some() as u64);
        }
        ExprKind::Call {
            target, operands, ..
        } => {
            out.push(disc(15));
            out.push(hash_name(target));
            out.push(operands.len() as u64);
        }
        ExprKind::LocalGet { index } => {
            out.push(disc(16));
            out.push(*index as u64);
        }
        ExprKind::LocalSet { index, is_tee, .. } => {
            out.push(disc(17));
            out.push(*index as u64);
            out.push(*is_tee as u64);
        }
        ExprKind::RefNull { heap } => {
            out.push(disc(18));
            push_type(out, Type::nullable(*heap));
        }
        ExprKind::RefIsNull { .. } => out.push(disc(19)),
        ExprKind::RefEq { .. } => out.push(disc(20)),
        ExprKind::RefAsNonNull { .. } => out.push(disc(21)),
        ExprKind::RefTest { cast_ty, .. } => {
            out.push(disc(22));
            push_type(out, *cast_ty);
        }
        ExprKind::RefCast { descriptor, .. } => {
            out.push(disc(23));
            out.push(descriptor.is_some() as u64);
        }
        ExprKind::RefGetDesc { .. } => out.push(disc(24)),
        ExprKind::StructNew {
            operands,
            descriptor,
        } => {
            out.push(disc(25));
            out.push(operands.len() as u64);
            out.push(descriptor.is_some() as u64);
        }
        ExprKind::StructGet { field, signed, order, .. } => {
            out.push(disc(26));
            out.push(*field as u64);
            out.push(*signed as u64);
            out.push(*order as u64);
        }
        ExprKind::StructSet { field, order, .. } => {
            out.push(disc(27));
            out.push(*field as u64);
            out.push(*order as u64);
        }
        ExprKind::StructRmw { op, field, order, .. } => {
            out.push(disc(28));
            out.push(*op as u64);
            out.push(*field as u64);
            out.push(*order as u64);
        }
        ExprKind::StructCmpxchg { field, order, .. } => {
            out.push(disc(29));
            out.push(*field as u64);
            out.push(*order as u64);
        }
        ExprKind::ArrayNew { init, .. } => {
            out.push(disc(30));
            out.push(init.is_some() as u64);
        }
        ExprKind::ArrayNewFixed { values } => {
            out.push(disc(31));
            out.push(values.len() as u64);
        }
        ExprKind::ArrayGet { signed, order, .. } => {
            out.push(disc(32));
            out.push(*signed as u64);
            out.push(*order as u64);
        }
        ExprKind::ArraySet { order, .. } => {
            out.push(disc(33));
            out.push(*order as u64);
        }
    }
    push_type(out, expr.ty);
}

/// Full-subtree key: the node plus all of its children, recursively. Used
/// for control-flow contents, where an `if` condition at the top level is
/// excluded (it is linearized in the enclosing scope).
fn push_deep(arena: &ExprArena, id: ExprId, out: &mut Vec<u64>) {
    push_shallow(arena, id, out);
    let children = match &arena[id].kind {
        kind @ ExprKind::If { .. } => kind.content_children(),
        kind => kind.children(),
    };
    out.push(children.len() as u64);
    for child in children {
        push_deep_all(arena, child, out);
    }
}

fn push_deep_all(arena: &ExprArena, id: ExprId, out: &mut Vec<u64>) {
    push_shallow(arena, id, out);
    let children = arena[id].kind.children();
    out.push(children.len() as u64);
    for child in children {
        push_deep_all(arena, child, out);
    }
}

// ---------------------------------------------------------------------------
// Substring filters
// ---------------------------------------------------------------------------

/// Drop any substring whose symbol sequence occurs inside a longer kept
/// substring. The result is sorted longest-first.
pub fn dedupe(symbols: &[u32], mut substrings: Vec<RepeatedSubstring>) -> Vec<RepeatedSubstring> {
    substrings.sort_by(|a, b| {
        b.length
            .cmp(&a.length)
            .then_with(|| a.start_indices.cmp(&b.start_indices))
    });
    let mut kept: Vec<RepeatedSubstring> = Vec::new();
    for substring in substrings {
        let window = &symbols[substring.start_indices[0]..][..substring.length];
        let subsumed = kept.iter().any(|longer| {
            let longer_window = &symbols[longer.start_indices[0]..][..longer.length];
            longer_window
                .windows(window.len())
                .any(|w| w == window)
        });
        if !subsumed {
            kept.push(substring);
        }
    }
    kept
}

/// Drop occurrences that overlap an earlier kept occurrence — both within
/// a substring's own start set and across substrings, longer substrings
/// claiming their ranges first. Substrings left with fewer than two
/// occurrences are dropped entirely, keeping the repeat-only invariant.
pub fn filter_overlaps(mut substrings: Vec<RepeatedSubstring>) -> Vec<RepeatedSubstring> {
    substrings.sort_by(|a, b| {
        b.length
            .cmp(&a.length)
            .then_with(|| a.start_indices.cmp(&b.start_indices))
    });
    let mut claimed: Vec<(usize, usize)> = Vec::new();
    let mut out = Vec::new();
    for mut substring in substrings {
        let mut kept_starts = Vec::new();
        for &start in &substring.start_indices {
            let end = start + substring.length;
            let overlaps = claimed.iter().any(|(s, e)| start < *e && *s < end);
            if !overlaps {
                claimed.push((start, end));
                kept_starts.push(start);
            }
        }
        if kept_starts.len() >= 2 {
            substring.start_indices = kept_starts;
            out.push(substring);
        } else {
            // Release anything a dying substring claimed.
            for &start in &kept_starts {
                claimed.retain(|(s, _)| *s != start);
            }
        }
    }
    out
}

fn filter_exprs(
    substrings: Vec<RepeatedSubstring>,
    stringified: &Stringified,
    module: &Module,
    reject: impl Fn(&ExprKind) -> bool,
) -> Vec<RepeatedSubstring> {
    substrings
        .into_iter()
        .filter(|substring| {
            // All occurrences carry the same symbols, so one suffices.
            let start = substring.start_indices[0];
            for idx in start..start + substring.length {
                let Some((func_idx, id)) = stringified.exprs[idx] else {
                    unreachable!("separators never repeat");
                };
                let arena = &module.functions[func_idx].arena;
                if reject(&arena[id].kind) {
                    return false;
                }
                // Control-flow contents move wholesale with the symbol, so
                // scan them in full.
                if arena[id].kind.is_control_flow() {
                    for content in arena[id].kind.content_children() {
                        for nested in arena.descendants(content) {
                            if reject(&arena[nested].kind) {
                                return false;
                            }
                        }
                    }
                }
            }
            true
        })
        .collect()
}

/// Reject substrings containing instructions whose target may lie outside
/// the extracted range: branches, returns, `try_table`, and pops (which
/// are tied to their enclosing catch).
pub fn filter_branches(
    substrings: Vec<RepeatedSubstring>,
    stringified: &Stringified,
    module: &Module,
) -> Vec<RepeatedSubstring> {
    filter_exprs(substrings, stringified, module, |kind| {
        matches!(
            kind,
            ExprKind::Break { .. }
                | ExprKind::Switch { .. }
                | ExprKind::BrOn { .. }
                | ExprKind::Return { .. }
                | ExprKind::TryTable { .. }
                | ExprKind::Pop
        )
    })
}

/// Reject substrings containing `local.set`: the written value would have
/// to be returned from the outlined function and written back.
pub fn filter_local_sets(
    substrings: Vec<RepeatedSubstring>,
    stringified: &Stringified,
    module: &Module,
) -> Vec<RepeatedSubstring> {
    filter_exprs(substrings, stringified, module, |kind| {
        matches!(kind, ExprKind::LocalSet { .. })
    })
}

/// Reject substrings containing `local.get`: the read value would have to
/// be passed into the outlined function as an extra argument.
pub fn filter_local_gets(
    substrings: Vec<RepeatedSubstring>,
    stringified: &Stringified,
    module: &Module,
) -> Vec<RepeatedSubstring> {
    filter_exprs(substrings, stringified, module, |kind| {
        matches!(kind, ExprKind::LocalGet { .. })
    })
}
