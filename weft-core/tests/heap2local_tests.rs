//! End-to-end tests for the Heap2Local pass.
//!
//! Modules are built through the builder API and checked structurally
//! after the pass: lowered allocations must leave no heap operations
//! behind, escaping allocations must be left alone, and trap behavior
//! must be preserved.

use weft_core::{
    heap2local, BinaryOp, Builder, ExprKind, Field, Function, HeapType, Literal, MemoryOrder,
    Module, Type,
};

fn count_kind(func: &Function, pred: impl Fn(&ExprKind) -> bool) -> usize {
    let body = func.body.expect("function has no body");
    func.arena
        .descendants(body)
        .into_iter()
        .filter(|id| pred(&func.arena[*id].kind))
        .count()
}

fn heap_op_count(func: &Function) -> usize {
    count_kind(func, |k| {
        matches!(
            k,
            ExprKind::StructNew { .. }
                | ExprKind::StructGet { .. }
                | ExprKind::StructSet { .. }
                | ExprKind::ArrayNew { .. }
                | ExprKind::ArrayNewFixed { .. }
                | ExprKind::ArrayGet { .. }
                | ExprKind::ArraySet { .. }
        )
    })
}

/// A boxed mutable counter read, incremented, and written in a loop, with
/// the loop condition coming from an imported call. The entire struct
/// must become a single i32 local.
#[test]
fn test_boxed_counter_becomes_local() {
    let mut module = Module::new();
    let boxed = module.types.add_struct(vec![Field::mutable(Type::I32)]);
    let ref_ty = Type::nullable(HeapType::Defined(boxed));

    module.add_function(Function::new("import", vec![Type::I32], vec![Type::I32]));

    let mut func = Function::new("example", vec![], vec![]);
    func.add_var(ref_ty);
    let mut b = Builder::new(&mut func);

    let init = b.make_const(Literal::I32(42));
    let alloc = b.make_struct_new(boxed, vec![init], None);
    let store_ref = b.make_local_set(0, alloc);

    let get_for_read = b.make_local_get(0, ref_ty);
    let read = b.make_struct_get(get_for_read, 0, Type::I32, false, MemoryOrder::Unordered);
    let one = b.make_const(Literal::I32(1));
    let bumped = b.make_binary(BinaryOp::AddI32, read, one);
    let get_for_write = b.make_local_get(0, ref_ty);
    let write = b.make_struct_set(get_for_write, 0, bumped, MemoryOrder::Unordered);

    let get_for_cond = b.make_local_get(0, ref_ty);
    let cond_read = b.make_struct_get(get_for_cond, 0, Type::I32, false, MemoryOrder::Unordered);
    let call = b.make_call("import", vec![cond_read], Type::I32);
    let repeat = b.make_break("loop", None, Some(call));

    let loop_body = b.make_block(vec![write, repeat]);
    let counter_loop = b.make_loop(Some("loop".into()), loop_body);
    let body = b.make_block(vec![store_ref, counter_loop]);
    func.body = Some(body);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("example").unwrap();
    assert_eq!(heap_op_count(func), 0, "all heap operations are lowered");
    assert_eq!(
        count_kind(func, |k| matches!(k, ExprKind::Loop { .. })),
        1,
        "the loop survives"
    );
    assert!(
        func.vars.contains(&Type::I32),
        "an i32 local now holds the counter"
    );
    // The loop body still increments through the local.
    assert!(count_kind(func, |k| matches!(k, ExprKind::Binary { .. })) >= 1);
    assert_eq!(
        count_kind(func, |k| matches!(k, ExprKind::Call { .. })),
        1,
        "the import call survives"
    );
}

/// A fixed-size array of three i32s with in-bounds constant reads lowers
/// to three locals.
#[test]
fn test_fixed_array_of_three_lowers_to_locals() {
    let mut module = Module::new();
    let arr3 = module.types.add_array(Field::mutable(Type::I32));
    let ref_ty = Type::nullable(HeapType::Defined(arr3));

    let mut func = Function::new("f", vec![], vec![]);
    func.add_var(ref_ty);
    let mut b = Builder::new(&mut func);

    let v1 = b.make_const(Literal::I32(1));
    let v2 = b.make_const(Literal::I32(2));
    let v3 = b.make_const(Literal::I32(3));
    let alloc = b.make_array_new_fixed(arr3, vec![v1, v2, v3]);
    let store = b.make_local_set(0, alloc);

    let mut reads = vec![store];
    for i in 0..3 {
        let r = b.make_local_get(0, ref_ty);
        let idx = b.make_const(Literal::I32(i));
        let get = b.make_array_get(r, idx, Type::I32, false);
        reads.push(b.make_drop(get));
    }
    let body = b.make_block(reads);
    func.body = Some(body);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert_eq!(heap_op_count(func), 0);
    assert!(
        func.vars.iter().filter(|t| **t == Type::I32).count() >= 3,
        "one local per array slot"
    );
    assert_eq!(
        count_kind(func, |k| matches!(k, ExprKind::Unreachable)),
        0,
        "in-bounds accesses introduce no traps"
    );
}

/// A constant out-of-bounds read of a lowered array becomes an explicit
/// trap.
#[test]
fn test_constant_oob_read_becomes_trap() {
    let mut module = Module::new();
    let arr3 = module.types.add_array(Field::mutable(Type::I32));
    let ref_ty = Type::nullable(HeapType::Defined(arr3));

    let mut func = Function::new("f", vec![], vec![]);
    func.add_var(ref_ty);
    let mut b = Builder::new(&mut func);

    let v1 = b.make_const(Literal::I32(1));
    let v2 = b.make_const(Literal::I32(2));
    let v3 = b.make_const(Literal::I32(3));
    let alloc = b.make_array_new_fixed(arr3, vec![v1, v2, v3]);
    let store = b.make_local_set(0, alloc);

    let r = b.make_local_get(0, ref_ty);
    let idx = b.make_const(Literal::I32(5));
    let get = b.make_array_get(r, idx, Type::I32, false);
    let dropped = b.make_drop(get);
    let body = b.make_block(vec![store, dropped]);
    func.body = Some(body);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert_eq!(heap_op_count(func), 0);
    assert!(
        count_kind(func, |k| matches!(k, ExprKind::Unreachable)) >= 1,
        "the out-of-bounds access traps"
    );
}

/// A struct passed as a call argument escapes; nothing changes.
#[test]
fn test_escaping_via_call_is_untouched() {
    let mut module = Module::new();
    let boxed = module.types.add_struct(vec![Field::mutable(Type::I32)]);
    module.add_function(Function::new(
        "sink",
        vec![Type::nullable(HeapType::Defined(boxed))],
        vec![],
    ));

    let mut func = Function::new("f", vec![], vec![]);
    let mut b = Builder::new(&mut func);
    let init = b.make_const(Literal::I32(7));
    let alloc = b.make_struct_new(boxed, vec![init], None);
    let call = b.make_call("sink", vec![alloc], Type::None);
    func.body = Some(call);
    module.add_function(func);

    let vars_before = module.get_function("f").unwrap().vars.len();
    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert_eq!(
        count_kind(func, |k| matches!(k, ExprKind::StructNew { .. })),
        1,
        "the escaping allocation survives"
    );
    assert_eq!(func.vars.len(), vars_before, "no locals were added");
}

/// A cast that must succeed is erased along with the allocation; no trap
/// appears.
#[test]
fn test_statically_successful_cast_is_erased() {
    let mut module = Module::new();
    let a = module.types.add_struct(vec![Field::mutable(Type::I32)]);

    let mut func = Function::new("f", vec![], vec![]);
    let mut b = Builder::new(&mut func);
    let init = b.make_const(Literal::I32(1));
    let alloc = b.make_struct_new(a, vec![init], None);
    let cast = b.make_ref_cast(alloc, None, Type::non_nullable(HeapType::Defined(a)));
    let dropped = b.make_drop(cast);
    func.body = Some(dropped);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert_eq!(
        count_kind(func, |k| matches!(k, ExprKind::RefCast { .. })),
        0,
        "the cast is erased"
    );
    assert_eq!(heap_op_count(func), 0);
    assert_eq!(
        count_kind(func, |k| matches!(k, ExprKind::Unreachable)),
        0,
        "no trap is introduced"
    );
}

/// A cast that must fail becomes an explicit trap, preserving semantics.
#[test]
fn test_statically_failing_cast_traps() {
    let mut module = Module::new();
    let a = module.types.add_struct(vec![Field::mutable(Type::I32)]);
    let unrelated = module.types.add_struct(vec![Field::mutable(Type::I64)]);

    let mut func = Function::new("f", vec![], vec![]);
    let mut b = Builder::new(&mut func);
    let init = b.make_const(Literal::I32(1));
    let alloc = b.make_struct_new(a, vec![init], None);
    let cast = b.make_ref_cast(alloc, None, Type::non_nullable(HeapType::Defined(unrelated)));
    let dropped = b.make_drop(cast);
    func.body = Some(dropped);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert!(
        count_kind(func, |k| matches!(k, ExprKind::Unreachable)) >= 1,
        "the failing cast still traps"
    );
}

/// `ref.eq` of the allocation against itself folds to 1; against anything
/// else it folds to 0.
#[test]
fn test_ref_eq_against_self_folds_to_one() {
    let mut module = Module::new();
    let boxed = module.types.add_struct(vec![Field::mutable(Type::I32)]);
    let ref_ty = Type::nullable(HeapType::Defined(boxed));

    let mut func = Function::new("f", vec![], vec![]);
    func.add_var(ref_ty);
    let mut b = Builder::new(&mut func);
    let init = b.make_const(Literal::I32(1));
    let alloc = b.make_struct_new(boxed, vec![init], None);
    let store = b.make_local_set(0, alloc);
    let lhs = b.make_local_get(0, ref_ty);
    let rhs = b.make_local_get(0, ref_ty);
    let eq = b.make_ref_eq(lhs, rhs);
    let dropped = b.make_drop(eq);
    let body = b.make_block(vec![store, dropped]);
    func.body = Some(body);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert_eq!(heap_op_count(func), 0);
    assert_eq!(
        count_kind(func, |k| matches!(k, ExprKind::RefEq { .. })),
        0,
        "the identity comparison is folded"
    );
    assert!(
        count_kind(func, |k| matches!(
            k,
            ExprKind::Const {
                value: Literal::I32(1)
            }
        )) >= 1,
        "comparison against itself is 1"
    );
}

/// `ref.is_null` of the allocation folds to 0.
#[test]
fn test_ref_is_null_folds_to_zero() {
    let mut module = Module::new();
    let boxed = module.types.add_struct(vec![Field::mutable(Type::I32)]);

    let mut func = Function::new("f", vec![], vec![]);
    let mut b = Builder::new(&mut func);
    let init = b.make_const(Literal::I32(3));
    let alloc = b.make_struct_new(boxed, vec![init], None);
    let test = b.make_ref_is_null(alloc);
    let dropped = b.make_drop(test);
    func.body = Some(dropped);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert_eq!(heap_op_count(func), 0);
    assert!(count_kind(func, |k| matches!(
        k,
        ExprKind::Const {
            value: Literal::I32(0)
        }
    )) >= 1);
}

/// `struct.new_default` seeds the field locals with zeros.
#[test]
fn test_default_allocation_uses_zero_values() {
    let mut module = Module::new();
    let pair = module
        .types
        .add_struct(vec![Field::mutable(Type::I32), Field::mutable(Type::I64)]);

    let mut func = Function::new("f", vec![], vec![]);
    let mut b = Builder::new(&mut func);
    let alloc = b.make_struct_new(pair, vec![], None);
    let get = b.make_struct_get(alloc, 1, Type::I64, false, MemoryOrder::Unordered);
    let dropped = b.make_drop(get);
    func.body = Some(dropped);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert_eq!(heap_op_count(func), 0);
    assert!(func.vars.contains(&Type::I64));
    assert!(count_kind(func, |k| matches!(
        k,
        ExprKind::Const {
            value: Literal::I64(0)
        }
    )) >= 1);
}

/// Packed fields sign- or zero-extend at reads.
#[test]
fn test_packed_field_get_masks() {
    let mut module = Module::new();
    let packed = module.types.add_struct(vec![Field {
        storage: weft_core::StorageType::I8,
        mutable: true,
    }]);

    let mut func = Function::new("f", vec![], vec![]);
    let mut b = Builder::new(&mut func);
    let init = b.make_const(Literal::I32(0x1ff));
    let alloc = b.make_struct_new(packed, vec![init], None);
    let get = b.make_struct_get(alloc, 0, Type::I32, false, MemoryOrder::Unordered);
    let dropped = b.make_drop(get);
    func.body = Some(dropped);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();

    let func = module.get_function("f").unwrap();
    assert_eq!(heap_op_count(func), 0);
    assert!(
        count_kind(func, |k| matches!(
            k,
            ExprKind::Binary {
                op: BinaryOp::AndI32,
                ..
            }
        )) >= 1,
        "the unsigned packed read is masked"
    );
}

/// Running the pass twice is the same as running it once: the first run
/// removes every candidate, the second finds nothing.
#[test]
fn test_idempotent_on_second_run() {
    let mut module = Module::new();
    let boxed = module.types.add_struct(vec![Field::mutable(Type::I32)]);
    let mut func = Function::new("f", vec![], vec![]);
    let mut b = Builder::new(&mut func);
    let init = b.make_const(Literal::I32(42));
    let alloc = b.make_struct_new(boxed, vec![init], None);
    let get = b.make_struct_get(alloc, 0, Type::I32, false, MemoryOrder::Unordered);
    let dropped = b.make_drop(get);
    func.body = Some(dropped);
    module.add_function(func);

    heap2local::run(&mut module).unwrap();
    let vars_after_first = module.get_function("f").unwrap().vars.len();
    let body_after_first = module.get_function("f").unwrap().body;

    heap2local::run(&mut module).unwrap();
    let func = module.get_function("f").unwrap();
    assert_eq!(func.vars.len(), vars_after_first);
    assert_eq!(func.body, body_after_first);
}
