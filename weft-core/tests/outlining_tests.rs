//! End-to-end tests for the Outlining pass.
//!
//! Modules with repeated instruction subsequences must gain a fresh
//! function per repeat, with every occurrence replaced by a call;
//! sequences touching locals or control flow leaving the range must be
//! left alone.

use weft_core::{
    outlining, BinaryOp, Builder, ExprId, ExprKind, Function, Literal, Module, Type,
};

fn count_kind(func: &Function, pred: impl Fn(&ExprKind) -> bool) -> usize {
    let Some(body) = func.body else { return 0 };
    func.arena
        .descendants(body)
        .into_iter()
        .filter(|id| pred(&func.arena[*id].kind))
        .count()
}

fn calls_to(func: &Function, target: &str) -> Vec<ExprId> {
    let Some(body) = func.body else {
        return Vec::new();
    };
    func.arena
        .descendants(body)
        .into_iter()
        .filter(|id| {
            matches!(&func.arena[*id].kind, ExprKind::Call { target: t, .. } if t == target)
        })
        .collect()
}

/// Build `(i32.const 1) (i32.const 2) (i32.add)` into `func` and return
/// the `add` expression.
fn build_add_pattern(func: &mut Function) -> ExprId {
    let mut b = Builder::new(func);
    let c1 = b.make_const(Literal::I32(1));
    let c2 = b.make_const(Literal::I32(2));
    b.make_binary(BinaryOp::AddI32, c1, c2)
}

/// The identical three-instruction pattern in two functions becomes one
/// outlined function with two call sites.
#[test]
fn test_repeated_pattern_is_outlined() {
    let mut module = Module::new();

    let mut f = Function::new("f", vec![], vec![]);
    let add = build_add_pattern(&mut f);
    let dropped = Builder::new(&mut f).make_drop(add);
    f.body = Some(dropped);
    module.add_function(f);

    let mut g = Function::new("g", vec![], vec![Type::I32]);
    let add = build_add_pattern(&mut g);
    let ret = Builder::new(&mut g).make_return(Some(add));
    g.body = Some(ret);
    module.add_function(g);

    outlining::run(&mut module).unwrap();

    assert_eq!(module.functions.len(), 3);
    // Outlined functions move to the front.
    let outlined = &module.functions[0];
    assert!(outlined.name.starts_with("outline$"));
    assert!(outlined.params.is_empty());
    assert_eq!(outlined.results, vec![Type::I32]);
    assert_eq!(
        count_kind(
            outlined,
            |k| matches!(
                k,
                ExprKind::Binary {
                    op: BinaryOp::AddI32,
                    ..
                }
            )
        ),
        1,
        "the outlined body computes the sum"
    );

    let name = outlined.name.clone();
    for host in ["f", "g"] {
        let host = module.get_function(host).unwrap();
        assert_eq!(calls_to(host, &name).len(), 1);
        assert_eq!(
            count_kind(host, |k| matches!(k, ExprKind::Const { .. })),
            0,
            "the host no longer carries the constants"
        );
    }

    // The host that returned the sum now returns the call's value.
    let g = module.get_function("g").unwrap();
    let ExprKind::Return { value: Some(v) } = &g.arena[g.body.unwrap()].kind else {
        panic!("expected a return");
    };
    assert!(matches!(&g.arena[*v].kind, ExprKind::Call { .. }));
}

/// A sequence ending in `local.set` is rejected; nothing is outlined.
#[test]
fn test_sequence_with_local_set_is_not_outlined() {
    let mut module = Module::new();
    for name in ["f", "g"] {
        let mut func = Function::new(name, vec![], vec![]);
        func.add_var(Type::I32);
        let add = build_add_pattern(&mut func);
        let set = Builder::new(&mut func).make_local_set(0, add);
        func.body = Some(set);
        module.add_function(func);
    }

    outlining::run(&mut module).unwrap();

    assert_eq!(module.functions.len(), 2, "no function was added");
    assert!(module
        .functions
        .iter()
        .all(|f| !f.name.starts_with("outline$")));
}

/// A sequence reading a local is rejected too.
#[test]
fn test_sequence_with_local_get_is_not_outlined() {
    let mut module = Module::new();
    for name in ["f", "g"] {
        let mut func = Function::new(name, vec![Type::I32], vec![]);
        let mut b = Builder::new(&mut func);
        let x = b.make_local_get(0, Type::I32);
        let c = b.make_const(Literal::I32(2));
        let add = b.make_binary(BinaryOp::AddI32, x, c);
        let dropped = b.make_drop(add);
        func.body = Some(dropped);
        module.add_function(func);
    }

    outlining::run(&mut module).unwrap();

    assert_eq!(module.functions.len(), 2);
}

/// A sequence containing a branch is rejected: its target may lie outside
/// the extracted range.
#[test]
fn test_sequence_with_branch_is_not_outlined() {
    let mut module = Module::new();
    for name in ["f", "g"] {
        let mut func = Function::new(name, vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let c1 = b.make_const(Literal::I32(1));
        let br = b.make_break("out", None, Some(c1));
        let c2 = b.make_const(Literal::I32(9));
        let dropped = b.make_drop(c2);
        let block = b.make_named_block("out", vec![br, dropped], Type::None);
        func.body = Some(block);
        module.add_function(func);
    }

    outlining::run(&mut module).unwrap();

    assert_eq!(module.functions.len(), 2);
}

/// A repeated tail ending in `unreachable` is outlined with a trailing
/// `unreachable` after each call, keeping the hosts typed as before.
#[test]
fn test_unreachable_tail_keeps_host_polymorphism() {
    let mut module = Module::new();
    for name in ["f", "g"] {
        let mut func = Function::new(name, vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let add = {
            let c1 = b.make_const(Literal::I32(1));
            let c2 = b.make_const(Literal::I32(2));
            b.make_binary(BinaryOp::AddI32, c1, c2)
        };
        let dropped = b.make_drop(add);
        let trap = b.make_unreachable();
        let block = b.make_block(vec![dropped, trap]);
        func.body = Some(block);
        module.add_function(func);
    }

    outlining::run(&mut module).unwrap();

    assert_eq!(module.functions.len(), 3);
    let outlined_name = module.functions[0].name.clone();
    assert!(outlined_name.starts_with("outline$"));
    for host in ["f", "g"] {
        let host = module.get_function(host).unwrap();
        assert_eq!(calls_to(host, &outlined_name).len(), 1);
        assert!(
            count_kind(host, |k| matches!(k, ExprKind::Unreachable)) >= 1,
            "the call site keeps an explicit unreachable"
        );
    }
}

/// Three occurrences of a pattern all route through one function.
#[test]
fn test_three_occurrences_share_one_function() {
    let mut module = Module::new();
    for name in ["f", "g", "h"] {
        let mut func = Function::new(name, vec![], vec![]);
        let add = build_add_pattern(&mut func);
        let dropped = Builder::new(&mut func).make_drop(add);
        func.body = Some(dropped);
        module.add_function(func);
    }

    outlining::run(&mut module).unwrap();

    assert_eq!(module.functions.len(), 4);
    let outlined_name = module.functions[0].name.clone();
    let mut total_calls = 0;
    for host in ["f", "g", "h"] {
        total_calls += calls_to(module.get_function(host).unwrap(), &outlined_name).len();
    }
    assert_eq!(total_calls, 3);
}

/// Two occurrences inside one function work the same as across functions.
#[test]
fn test_two_occurrences_in_one_function() {
    let mut module = Module::new();
    let mut func = Function::new("f", vec![], vec![]);
    let add1 = build_add_pattern(&mut func);
    let mut b = Builder::new(&mut func);
    let d1 = b.make_drop(add1);
    let marker = b.make_const(Literal::I32(77));
    let dm = b.make_drop(marker);
    drop(b);
    let add2 = build_add_pattern(&mut func);
    let mut b = Builder::new(&mut func);
    let d2 = b.make_drop(add2);
    let body = b.make_block(vec![d1, dm, d2]);
    func.body = Some(body);
    module.add_function(func);

    outlining::run(&mut module).unwrap();

    assert_eq!(module.functions.len(), 2);
    let outlined_name = module.functions[0].name.clone();
    let host = module.get_function("f").unwrap();
    assert_eq!(calls_to(host, &outlined_name).len(), 2);
    // The marker between the occurrences survives in place.
    assert_eq!(
        count_kind(host, |k| matches!(
            k,
            ExprKind::Const {
                value: Literal::I32(77)
            }
        )),
        1
    );
}

/// A pattern needing a value from outside the range turns it into a
/// parameter of the outlined function.
#[test]
fn test_partial_subtree_becomes_parameter() {
    let mut module = Module::new();
    // (i64.const N) differs per function, so only the tail
    // (i64.const 5) (i64.add) (drop) repeats.
    for (name, n) in [("f", 100i64), ("g", 200i64)] {
        let mut func = Function::new(name, vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let differing = b.make_const(Literal::I64(n));
        let five = b.make_const(Literal::I64(5));
        let add = b.make_binary(BinaryOp::AddI64, differing, five);
        let dropped = b.make_drop(add);
        func.body = Some(dropped);
        module.add_function(func);
    }

    outlining::run(&mut module).unwrap();

    assert_eq!(module.functions.len(), 3);
    let outlined = &module.functions[0];
    assert_eq!(
        outlined.params,
        vec![Type::I64],
        "the differing prefix value is passed in"
    );
    assert!(outlined.results.is_empty());
    // The outlined body reads its parameter.
    assert!(count_kind(outlined, |k| matches!(k, ExprKind::LocalGet { index: 0 })) >= 1);
    let name = outlined.name.clone();
    for host in ["f", "g"] {
        let host = module.get_function(host).unwrap();
        let calls = calls_to(host, &name);
        assert_eq!(calls.len(), 1);
        let ExprKind::Call { operands, .. } = &host.arena[calls[0]].kind else {
            unreachable!();
        };
        assert_eq!(operands.len(), 1, "the call passes the differing value");
    }
}
