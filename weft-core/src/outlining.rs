//! Outlining: find repeated instruction subsequences across the whole
//! module, extract each into a fresh function, and replace every
//! occurrence with a call.
//!
//! The module is first linearized (see [`crate::stringify`]); repeated
//! substrings of the symbol sequence are mined and filtered (see
//! [`crate::suffix_tree`]); the surviving substrings become per-function
//! instruction ranges; finally each affected function is reconstructed by
//! replaying its linearized events, diverting in-range instructions into
//! the outlined function's body.
//!
//! Because reconstruction follows the linearized rather than the nested
//! order, scope types may be under-computed along the way; a module-wide
//! refinalize runs at the end.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::stack::StackSignature;
use crate::stringify::{self, Event, Separator, Stringified};
use crate::suffix_tree::{self, RepeatedSubstring};
use crate::{refinalize, Builder, ExprId, ExprKind, Function, Module, Name, Type};

/// A half-open instruction range of one function, destined for an
/// outlined function.
#[derive(Debug, Clone)]
pub struct OutliningSequence {
    /// First instruction index (relative to the function start).
    pub start_idx: u32,
    /// One past the last instruction index.
    pub end_idx: u32,
    /// The outlined function replacing the range.
    pub func: Name,
    /// Whether the range's final expression is unreachable; the call then
    /// gets a trailing `unreachable` to keep the surrounding scope typed
    /// as before.
    pub ends_unreachable: bool,
}

/// Run Outlining over the whole module.
pub fn run(module: &mut Module) -> Result<()> {
    let stringified = stringify::stringify_module(module);
    let substrings = suffix_tree::repeat_substrings(&stringified.symbols);
    // Remove substrings that are substrings of longer repeats.
    let substrings = stringify::dedupe(&stringified.symbols, substrings);
    // Remove overlapping occurrences; longer substrings claim first.
    let substrings = stringify::filter_overlaps(substrings);
    // Remove substrings whose control flow or locals cross the boundary.
    let substrings = stringify::filter_branches(substrings, &stringified, module);
    let substrings = stringify::filter_local_sets(substrings, &stringified, module);
    let substrings = stringify::filter_local_gets(substrings, &stringified, module);

    let (mut by_func, outlined_count) = make_sequences(module, &substrings, &stringified);

    let mut populated: HashSet<Name> = HashSet::new();
    let mut func_indices: Vec<usize> = by_func.keys().copied().collect();
    func_indices.sort_unstable();
    for func_idx in func_indices {
        let mut sequences = by_func.remove(&func_idx).unwrap();
        // The replay counts instructions upward, so it must meet the
        // sequences smallest start first.
        sequences.sort_by_key(|s| s.start_idx);
        Reconstructor {
            module: &mut *module,
            stringified: &stringified,
            func_idx,
            sequences,
            state: State::NotInSeq,
            seq_counter: 0,
            instr_counter: 0,
            existing: ScopeBuilder::default(),
            outlined: ScopeBuilder::default(),
            pending: Vec::new(),
            populated: &mut populated,
            new_body: None,
        }
        .run();
    }

    // Outlined functions first, for readability of the output.
    move_outlined_to_front(module, outlined_count);
    refinalize::module(module);
    Ok(())
}

/// Mint one function per substring and map each occurrence to a
/// function-relative sequence. The function's signature is the summed
/// stack effect of the range.
fn make_sequences(
    module: &mut Module,
    substrings: &[RepeatedSubstring],
    stringified: &Stringified,
) -> (HashMap<usize, Vec<OutliningSequence>>, usize) {
    let mut by_func: HashMap<usize, Vec<OutliningSequence>> = HashMap::new();
    let mut outlined_count = 0;
    for substring in substrings {
        let start = substring.start_indices[0];
        let mut sig = StackSignature::empty();
        for idx in start..start + substring.length {
            let (func_idx, id) = stringified.exprs[idx].expect("separators never repeat");
            sig.append(&StackSignature::of_expr(
                &module.functions[func_idx].arena,
                id,
            ));
        }
        if sig.results.len() > 1 {
            // TODO: support multi-value results by writing them back
            // through scratch locals at the call site.
            continue;
        }

        let name = module.valid_function_name("outline$");
        module.add_function(Function::new(
            name.clone(),
            sig.params.clone(),
            sig.results.clone(),
        ));
        outlined_count += 1;

        for &program_idx in &substring.start_indices {
            let (relative_idx, func_idx) = stringified.make_relative(program_idx);
            let (last_func, last_expr) = stringified.exprs[program_idx + substring.length - 1]
                .expect("separators never repeat");
            let ends_unreachable =
                module.functions[last_func].arena[last_expr].ty == Type::Unreachable;
            by_func.entry(func_idx).or_default().push(OutliningSequence {
                start_idx: relative_idx,
                end_idx: relative_idx + substring.length as u32,
                func: name.clone(),
                ends_unreachable,
            });
        }
    }
    (by_func, outlined_count)
}

fn move_outlined_to_front(module: &mut Module, outlined_count: usize) {
    if outlined_count == 0 {
        return;
    }
    let split = module.functions.len() - outlined_count;
    let mut outlined = module.functions.split_off(split);
    let existing = std::mem::take(&mut module.functions);
    outlined.extend(existing);
    module.functions = outlined;
    module.update_function_index();
}

/// Reconstruction state per occurrence: outside any sequence, inside the
/// occurrence that populates the outlined body, or inside a later
/// occurrence that is skipped and replaced by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotInSeq,
    InSeq,
    InSkipSeq,
}

/// Which node an open scope frame assembles into when it ends.
#[derive(Debug, Clone, Copy)]
enum FrameTarget {
    Func,
    Block(ExprId),
    Loop(ExprId),
    IfThen(ExprId),
    IfElse(ExprId),
    TryBody(ExprId),
    TryCatch(ExprId, usize),
    TryTableBody(ExprId),
}

#[derive(Debug)]
struct Frame {
    target: FrameTarget,
    stack: Vec<ExprId>,
}

/// A stack-machine rebuilder. Scope contents buffer on the frame's value
/// stack; the matching end event assembles them into the target node in
/// place. Node identity does the rest: whichever tree holds the node sees
/// the assembled contents, so deferred scopes repair themselves no matter
/// where their node ended up.
#[derive(Debug, Default)]
struct ScopeBuilder {
    frame: Option<Frame>,
}

impl ScopeBuilder {
    fn open(&mut self, target: FrameTarget) {
        debug_assert!(self.frame.is_none(), "scope frames never nest in replay");
        self.frame = Some(Frame {
            target,
            stack: Vec::new(),
        });
    }

    fn push_raw(&mut self, id: ExprId) {
        self.frame
            .as_mut()
            .expect("no open scope to push into")
            .stack
            .push(id);
    }

    fn pop_or_unreachable(&mut self, func: &mut Function) -> ExprId {
        let frame = self.frame.as_mut().expect("no open scope to pop from");
        match frame.stack.pop() {
            Some(id) => id,
            // Only reachable beneath an unreachable prefix, where operands
            // are arbitrary.
            None => func.arena.alloc(ExprKind::Unreachable, Type::Unreachable),
        }
    }

    /// Visit one expression shallowly: pop its stack operands, reattach
    /// them, push the expression.
    fn push_expr(&mut self, func: &mut Function, id: ExprId) {
        let count = func.arena[id].kind.operand_children().len();
        let mut operands = Vec::with_capacity(count);
        for _ in 0..count {
            operands.push(self.pop_or_unreachable(func));
        }
        operands.reverse();
        for (slot, operand) in func.arena[id]
            .kind
            .operand_children_mut()
            .into_iter()
            .zip(operands)
        {
            *slot = operand;
        }
        self.push_raw(id);
    }

    /// Close the then-arm of `if_id` and open the else-arm.
    fn transition_else(&mut self, func: &mut Function, if_id: ExprId) {
        let frame = self.frame.take().expect("else outside an if scope");
        debug_assert!(matches!(frame.target, FrameTarget::IfThen(i) if i == if_id));
        let arm = blockify_stack(func, frame.stack);
        let ExprKind::If { if_true, .. } = &mut func.arena[if_id].kind else {
            unreachable!("else on a non-if");
        };
        *if_true = arm;
        self.open(FrameTarget::IfElse(if_id));
    }

    /// Close the current part of `try_id` (its body or previous catch) and
    /// open catch number `catch_idx`.
    fn transition_catch(&mut self, func: &mut Function, try_id: ExprId, catch_idx: usize) {
        let frame = self.frame.take().expect("catch outside a try scope");
        let part = blockify_stack(func, frame.stack);
        match frame.target {
            FrameTarget::TryBody(t) => {
                debug_assert_eq!(t, try_id);
                let ExprKind::Try { body, .. } = &mut func.arena[try_id].kind else {
                    unreachable!("catch on a non-try");
                };
                *body = part;
            }
            FrameTarget::TryCatch(t, prev) => {
                debug_assert_eq!(t, try_id);
                let ExprKind::Try { catches, .. } = &mut func.arena[try_id].kind else {
                    unreachable!("catch on a non-try");
                };
                catches[prev].body = part;
            }
            _ => unreachable!("catch outside a try scope"),
        }
        self.open(FrameTarget::TryCatch(try_id, catch_idx));
    }

    /// Close the innermost scope, assembling its contents into the target
    /// node. Returns the assembled body for a function-level frame.
    fn end(&mut self, func: &mut Function) -> Option<ExprId> {
        let frame = self.frame.take().expect("end without an open scope");
        let contents = frame.stack;
        match frame.target {
            FrameTarget::Func => {
                return Some(blockify_stack(func, contents));
            }
            FrameTarget::Block(b) => {
                let ExprKind::Block { children, .. } = &mut func.arena[b].kind else {
                    unreachable!("block frame on a non-block");
                };
                *children = contents;
            }
            FrameTarget::Loop(l) => {
                let body = blockify_stack(func, contents);
                let ExprKind::Loop { body: slot, .. } = &mut func.arena[l].kind else {
                    unreachable!("loop frame on a non-loop");
                };
                *slot = body;
            }
            FrameTarget::IfThen(i) => {
                let arm = blockify_stack(func, contents);
                let ExprKind::If { if_true, .. } = &mut func.arena[i].kind else {
                    unreachable!("if frame on a non-if");
                };
                *if_true = arm;
            }
            FrameTarget::IfElse(i) => {
                let arm = blockify_stack(func, contents);
                let ExprKind::If { if_false, .. } = &mut func.arena[i].kind else {
                    unreachable!("if frame on a non-if");
                };
                *if_false = Some(arm);
            }
            FrameTarget::TryBody(t) => {
                let part = blockify_stack(func, contents);
                let ExprKind::Try { body, .. } = &mut func.arena[t].kind else {
                    unreachable!("try frame on a non-try");
                };
                *body = part;
            }
            FrameTarget::TryCatch(t, idx) => {
                let part = blockify_stack(func, contents);
                let ExprKind::Try { catches, .. } = &mut func.arena[t].kind else {
                    unreachable!("try frame on a non-try");
                };
                catches[idx].body = part;
            }
            FrameTarget::TryTableBody(t) => {
                let part = blockify_stack(func, contents);
                let ExprKind::TryTable { body, .. } = &mut func.arena[t].kind else {
                    unreachable!("try_table frame on a non-try_table");
                };
                *body = part;
            }
        }
        None
    }
}

fn blockify_stack(func: &mut Function, stack: Vec<ExprId>) -> ExprId {
    match stack.len() {
        0 => func.arena.alloc(ExprKind::Nop, Type::None),
        1 => stack[0],
        _ => Builder::new(func).make_block(stack),
    }
}

/// Replays one host function's linearized events, rebuilding its body
/// while diverting matching ranges into outlined functions.
struct Reconstructor<'a> {
    module: &'a mut Module,
    stringified: &'a Stringified,
    func_idx: usize,
    /// The sequences of this function, sorted by start index.
    sequences: Vec<OutliningSequence>,
    state: State,
    /// The sequence the replay is about to outline or currently outlining.
    seq_counter: usize,
    /// Instructions seen since the function start; matches the indices in
    /// the sequences.
    instr_counter: u32,
    existing: ScopeBuilder,
    outlined: ScopeBuilder,
    /// Completed outlined bodies, still as host-arena roots; copied into
    /// the outlined functions once the whole replay is done and every
    /// deferred scope has been assembled in place.
    pending: Vec<(Name, Vec<ExprId>)>,
    populated: &'a mut HashSet<Name>,
    new_body: Option<ExprId>,
}

impl Reconstructor<'_> {
    fn run(mut self) {
        let range = self.stringified.function_events(self.func_idx);
        let events: Vec<Event> = self.stringified.events[range].to_vec();
        for event in events {
            match event {
                Event::Separator(sep) => self.on_separator(sep),
                Event::Expr(id) => self.on_expr(id),
            }
        }

        let body = self.new_body.take().expect("function scope never closed");
        self.module.functions[self.func_idx].body = Some(body);

        for (name, roots) in std::mem::take(&mut self.pending) {
            let target_idx = self
                .module
                .function_index(&name)
                .expect("outlined function disappeared");
            let (host, outlined) =
                two_functions(&mut self.module.functions, self.func_idx, target_idx);
            let copies: Vec<ExprId> = roots
                .iter()
                .map(|root| host.arena.deep_copy_into(*root, &mut outlined.arena))
                .collect();
            let outlined_body = blockify_stack(outlined, copies);
            outlined.body = Some(outlined_body);
        }
    }

    fn on_separator(&mut self, sep: Separator) {
        if let Separator::FuncStart(func_idx) = sep {
            debug_assert_eq!(func_idx, self.func_idx);
            self.instr_counter = 0;
            self.seq_counter = 0;
            self.state = State::NotInSeq;
            self.existing.open(FrameTarget::Func);
            return;
        }
        self.instr_counter += 1;
        debug_assert_eq!(
            self.state,
            State::NotInSeq,
            "separators never repeat, so sequences cannot contain them"
        );
        let host = &mut self.module.functions[self.func_idx];
        match sep {
            Separator::FuncStart(_) => unreachable!(),
            Separator::BlockStart(b) => self.existing.open(FrameTarget::Block(b)),
            Separator::LoopStart(l) => self.existing.open(FrameTarget::Loop(l)),
            Separator::IfStart(i) => self.existing.open(FrameTarget::IfThen(i)),
            Separator::ElseStart(i) => self.existing.transition_else(host, i),
            Separator::TryStart(t) => self.existing.open(FrameTarget::TryBody(t)),
            Separator::Catch(t, idx) | Separator::CatchAll(t, idx) => {
                self.existing.transition_catch(host, t, idx)
            }
            Separator::TryTableStart(t) => self.existing.open(FrameTarget::TryTableBody(t)),
            Separator::End => {
                if let Some(body) = self.existing.end(host) {
                    self.new_body = Some(body);
                }
            }
        }
    }

    fn on_expr(&mut self, id: ExprId) {
        self.instr_counter += 1;
        self.update_state();
        match self.state {
            State::InSkipSeq => {
                // The populating occurrence already moved this code; the
                // call was emitted on entry.
            }
            State::InSeq => {
                let host = &mut self.module.functions[self.func_idx];
                self.outlined.push_expr(host, id);
            }
            State::NotInSeq => {
                let host = &mut self.module.functions[self.func_idx];
                self.existing.push_expr(host, id);
            }
        }
        if self.state != State::NotInSeq {
            self.maybe_end_seq();
        }
    }

    fn update_state(&mut self) {
        let current = match self.sequences.get(self.seq_counter) {
            Some(seq) if self.instr_counter >= seq.start_idx && self.instr_counter < seq.end_idx => {
                debug_assert!(
                    self.state != State::NotInSeq || self.instr_counter == seq.start_idx,
                    "sequences never overlap, so entry is exact"
                );
                if self.populated.contains(&seq.func) {
                    State::InSkipSeq
                } else {
                    State::InSeq
                }
            }
            _ => State::NotInSeq,
        };
        if current != self.state {
            match current {
                State::NotInSeq => {}
                State::InSeq => self.begin_outline(),
                State::InSkipSeq => self.begin_skip(),
            }
        }
        self.state = current;
    }

    /// First occurrence: emit the call in the host and seed the outlined
    /// body with a `local.get` per parameter.
    fn begin_outline(&mut self) {
        let seq = self.sequences[self.seq_counter].clone();
        let params = self
            .module
            .get_function(&seq.func)
            .expect("outlined function disappeared")
            .params
            .clone();
        self.emit_call(&seq);
        self.outlined.open(FrameTarget::Func);
        let host = &mut self.module.functions[self.func_idx];
        for (i, ty) in params.iter().enumerate() {
            let get = Builder::new(host).make_local_get(i as u32, *ty);
            self.outlined.push_raw(get);
        }
    }

    /// Later occurrence: the body exists, only the call is emitted.
    fn begin_skip(&mut self) {
        let seq = self.sequences[self.seq_counter].clone();
        self.emit_call(&seq);
    }

    fn emit_call(&mut self, seq: &OutliningSequence) {
        let outlined_fn = self
            .module
            .get_function(&seq.func)
            .expect("outlined function disappeared");
        let param_count = outlined_fn.params.len();
        let result_ty = outlined_fn.results.first().copied().unwrap_or(Type::None);

        let host = &mut self.module.functions[self.func_idx];
        let mut operands = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            operands.push(self.existing.pop_or_unreachable(host));
        }
        operands.reverse();
        let call = Builder::new(host).make_call(seq.func.clone(), operands, result_ty);
        self.existing.push_raw(call);
        // Keep the surrounding scope typed as before when the moved code
        // ended in unreachable.
        if seq.ends_unreachable {
            let trap = Builder::new(host).make_unreachable();
            self.existing.push_raw(trap);
        }
    }

    fn maybe_end_seq(&mut self) {
        let seq = &self.sequences[self.seq_counter];
        if self.instr_counter + 1 == seq.end_idx {
            if self.state == State::InSeq {
                let frame = self
                    .outlined
                    .frame
                    .take()
                    .expect("outlined scope never opened");
                self.pending.push((seq.func.clone(), frame.stack));
                // Later occurrences, this function's included, now skip.
                self.populated.insert(seq.func.clone());
            }
            self.seq_counter += 1;
            self.state = State::NotInSeq;
        }
    }
}

fn two_functions(
    functions: &mut [Function],
    a: usize,
    b: usize,
) -> (&mut Function, &mut Function) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = functions.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = functions.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, Literal};

    #[test]
    fn test_two_functions_split() {
        let mut funcs = vec![
            Function::new("a", vec![], vec![]),
            Function::new("b", vec![], vec![]),
            Function::new("c", vec![], vec![]),
        ];
        let (x, y) = two_functions(&mut funcs, 2, 0);
        assert_eq!(x.name, "c");
        assert_eq!(y.name, "a");
    }

    #[test]
    fn test_sequences_are_function_relative() {
        let mut module = Module::new();
        for name in ["f", "g"] {
            let mut func = Function::new(name, vec![], vec![]);
            let mut b = Builder::new(&mut func);
            let c1 = b.make_const(Literal::I32(10));
            let c2 = b.make_const(Literal::I32(20));
            let add = b.make_binary(BinaryOp::AddI32, c1, c2);
            let dropped = b.make_drop(add);
            func.body = Some(dropped);
            module.add_function(func);
        }
        let stringified = stringify::stringify_module(&module);
        let substrings = suffix_tree::repeat_substrings(&stringified.symbols);
        let substrings = stringify::dedupe(&stringified.symbols, substrings);
        let substrings = stringify::filter_overlaps(substrings);
        let (by_func, count) = make_sequences(&mut module, &substrings, &stringified);
        assert_eq!(count, 1);
        let f_seqs = &by_func[&0];
        let g_seqs = &by_func[&1];
        assert_eq!(f_seqs.len(), 1);
        assert_eq!(g_seqs.len(), 1);
        // Identical bodies produce identical relative ranges.
        assert_eq!(f_seqs[0].start_idx, g_seqs[0].start_idx);
        assert_eq!(f_seqs[0].end_idx, g_seqs[0].end_idx);
        assert!(!f_seqs[0].ends_unreachable);
    }
}
