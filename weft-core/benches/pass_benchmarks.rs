//! Micro-benchmarks for the outlining front half: module linearization
//! and repeated-substring mining.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use weft_core::{
    outlining, stringify, suffix_tree, BinaryOp, Builder, Function, Literal, Module,
};

/// A module of `n` functions, each repeating a handful of shared
/// arithmetic patterns.
fn synthetic_module(n: usize) -> Module {
    let mut module = Module::new();
    for i in 0..n {
        let mut func = Function::new(format!("f{i}"), vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let mut stmts = Vec::new();
        for round in 0..4 {
            let c1 = b.make_const(Literal::I32(round));
            let c2 = b.make_const(Literal::I32(7));
            let add = b.make_binary(BinaryOp::AddI32, c1, c2);
            let c3 = b.make_const(Literal::I32(3));
            let mul = b.make_binary(BinaryOp::MulI32, add, c3);
            stmts.push(b.make_drop(mul));
        }
        let unique = b.make_const(Literal::I32(i as i32 + 1_000_000));
        stmts.push(b.make_drop(unique));
        let body = b.make_block(stmts);
        func.body = Some(body);
        module.add_function(func);
    }
    module
}

fn bench_stringify(c: &mut Criterion) {
    let module = synthetic_module(64);
    c.bench_function("stringify_module_64_funcs", |b| {
        b.iter(|| stringify::stringify_module(black_box(&module)))
    });
}

fn bench_mine(c: &mut Criterion) {
    let module = synthetic_module(64);
    let stringified = stringify::stringify_module(&module);
    c.bench_function("repeat_substrings_64_funcs", |b| {
        b.iter(|| suffix_tree::repeat_substrings(black_box(&stringified.symbols)))
    });
}

fn bench_outline(c: &mut Criterion) {
    c.bench_function("outline_16_funcs", |b| {
        b.iter_batched(
            || synthetic_module(16),
            |mut module| outlining::run(&mut module).unwrap(),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_stringify, bench_mine, bench_outline);
criterion_main!(benches);
