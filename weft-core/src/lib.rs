//! WEFT Core Library
//!
//! Core functionality for the WEFT WebAssembly optimizer including:
//! - A typed, tree-structured WebAssembly IR with GC heap types
//! - Analysis queries (parents, branch targets, lazy local dataflow)
//! - The Heap2Local escape-analysis pass
//! - The module-wide Outlining pass
//!
//! Expressions are arena-allocated per function and addressed by [`ExprId`],
//! so analyses can key maps by node identity without cyclic ownership.

#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::RwLock;

pub mod analysis;
pub mod builder;
pub mod heap2local;
pub mod outlining;
pub mod refinalize;
pub mod stack;
pub mod stringify;
pub mod suffix_tree;

pub use builder::Builder;

/// Identifier names for functions and labeled scopes.
pub type Name = String;

/// Whether a reference type admits null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nullability {
    /// The reference is never null.
    NonNullable,
    /// The reference may be null.
    Nullable,
}

/// Index of a defined (struct or array) heap type in a [`TypeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIdx(pub u32);

/// A heap type: either one of the abstract types of the `any` hierarchy or
/// a defined struct/array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// The top of the hierarchy.
    Any,
    /// Comparable references.
    Eq,
    /// The abstract supertype of all struct types.
    Struct,
    /// The abstract supertype of all array types.
    Array,
    /// The bottom type (`none`); only null references inhabit it.
    None,
    /// A defined struct or array type.
    Defined(TypeIdx),
}

/// The static type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// No value (statements).
    None,
    /// The bottom type of code that never completes.
    Unreachable,
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// A reference into the GC heap.
    Ref(Nullability, HeapType),
}

impl Type {
    /// A nullable reference to `heap`.
    pub fn nullable(heap: HeapType) -> Type {
        Type::Ref(Nullability::Nullable, heap)
    }

    /// A non-nullable reference to `heap`.
    pub fn non_nullable(heap: HeapType) -> Type {
        Type::Ref(Nullability::NonNullable, heap)
    }

    /// Whether this is a reference type.
    pub fn is_ref(&self) -> bool {
        matches!(self, Type::Ref(..))
    }

    /// Whether this type is a concrete value type (not `none`/`unreachable`).
    pub fn is_concrete(&self) -> bool {
        !matches!(self, Type::None | Type::Unreachable)
    }

    /// Whether this is a nullable reference.
    pub fn is_nullable(&self) -> bool {
        matches!(self, Type::Ref(Nullability::Nullable, _))
    }

    /// The heap type of a reference.
    ///
    /// # Panics
    ///
    /// Panics if the type is not a reference.
    pub fn heap_type(&self) -> HeapType {
        match self {
            Type::Ref(_, heap) => *heap,
            other => unreachable!("not a reference type: {other:?}"),
        }
    }

    /// The nullability of a reference.
    ///
    /// # Panics
    ///
    /// Panics if the type is not a reference.
    pub fn nullability(&self) -> Nullability {
        match self {
            Type::Ref(nullability, _) => *nullability,
            other => unreachable!("not a reference type: {other:?}"),
        }
    }

    /// The same reference type pointing at a different heap type.
    pub fn with_heap(self, heap: HeapType) -> Type {
        Type::Ref(self.nullability(), heap)
    }
}

/// Storage type of a struct field or array element. Packed fields occupy
/// less than 32 bits in the heap but read and write as `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    /// A full value type.
    Val(Type),
    /// A packed 8-bit integer field.
    I8,
    /// A packed 16-bit integer field.
    I16,
}

impl StorageType {
    /// The value type this storage reads and writes as.
    pub fn unpacked(&self) -> Type {
        match self {
            StorageType::Val(ty) => *ty,
            StorageType::I8 | StorageType::I16 => Type::I32,
        }
    }

    /// Whether this storage is a packed integer.
    pub fn is_packed(&self) -> bool {
        matches!(self, StorageType::I8 | StorageType::I16)
    }
}

/// A struct field or array element declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field {
    /// How the value is stored in the heap.
    pub storage: StorageType,
    /// Whether the field may be mutated after allocation.
    pub mutable: bool,
}

impl Field {
    /// An immutable field of value type `ty`.
    pub fn immutable(ty: Type) -> Field {
        Field {
            storage: StorageType::Val(ty),
            mutable: false,
        }
    }

    /// A mutable field of value type `ty`.
    pub fn mutable(ty: Type) -> Field {
        Field {
            storage: StorageType::Val(ty),
            mutable: true,
        }
    }
}

/// A constant value. Floats are stored as raw bits so literals hash and
/// compare structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Literal {
    /// 32-bit integer constant.
    I32(i32),
    /// 64-bit integer constant.
    I64(i64),
    /// 32-bit float constant (raw bits).
    F32(u32),
    /// 64-bit float constant (raw bits).
    F64(u64),
}

impl Literal {
    /// The type of this literal.
    pub fn ty(&self) -> Type {
        match self {
            Literal::I32(_) => Type::I32,
            Literal::I64(_) => Type::I64,
            Literal::F32(_) => Type::F32,
            Literal::F64(_) => Type::F64,
        }
    }

    /// The zero value of a numeric type, or `None` for references.
    pub fn zero(ty: Type) -> Option<Literal> {
        match ty {
            Type::I32 => Some(Literal::I32(0)),
            Type::I64 => Some(Literal::I64(0)),
            Type::F32 => Some(Literal::F32(0)),
            Type::F64 => Some(Literal::F64(0)),
            _ => None,
        }
    }
}

/// Binary operators. Only the operators the rewrites and tests need are
/// modeled; the set extends mechanically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BinaryOp {
    AddI32,
    SubI32,
    MulI32,
    AndI32,
    OrI32,
    XorI32,
    ShlI32,
    ShrSI32,
    ShrUI32,
    EqI32,
    AddI64,
    SubI64,
    MulI64,
    AndI64,
    OrI64,
    XorI64,
    EqI64,
}

impl BinaryOp {
    /// The result type of this operator.
    pub fn result_type(&self) -> Type {
        use BinaryOp::*;
        match self {
            AddI32 | SubI32 | MulI32 | AndI32 | OrI32 | XorI32 | ShlI32 | ShrSI32 | ShrUI32
            | EqI32 => Type::I32,
            AddI64 | SubI64 | MulI64 | AndI64 | OrI64 | XorI64 => Type::I64,
            EqI64 => Type::I32,
        }
    }
}

/// Memory ordering for struct accesses. Non-escaping allocations never
/// synchronize, so the rewrites may drop the ordering without a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOrder {
    /// No ordering constraints.
    Unordered,
    /// Sequentially consistent.
    SeqCst,
    /// Acquire on loads, release on stores.
    AcqRel,
}

/// Read-modify-write operators for `struct.atomic.rmw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

/// The `br_on_*` family of branching reference tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BrOnOp {
    Null,
    NonNull,
    Cast,
    CastFail,
}

/// Identity of an expression inside its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// A `catch` clause of a legacy `try` expression. A clause without a tag is
/// the `catch_all`.
#[derive(Debug, Clone, PartialEq)]
pub struct Catch {
    /// The tag this clause catches, or `None` for `catch_all`.
    pub tag: Option<Name>,
    /// The handler body. A caught exception's payload surfaces as a `Pop`
    /// at the start of this body.
    pub body: ExprId,
}

/// A catch clause of a `try_table`, branching to a label on catch.
#[derive(Debug, Clone, PartialEq)]
pub struct TableCatch {
    /// The tag this clause catches, or `None` for `catch_all`.
    pub tag: Option<Name>,
    /// The label the exception branches to.
    pub target: Name,
}

/// The operator and operands of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// No operation.
    Nop,
    /// Trap unconditionally.
    Unreachable,
    /// The implicit value at the start of a catch handler.
    Pop,
    /// A constant.
    Const {
        /// The literal value.
        value: Literal,
    },
    /// A binary operation.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        left: ExprId,
        /// Right operand.
        right: ExprId,
    },
    /// Evaluate and discard a value.
    Drop {
        /// The discarded operand.
        value: ExprId,
    },
    /// A sequence of expressions, optionally labeled as a branch target.
    Block {
        /// Branch-target label, if any.
        name: Option<Name>,
        /// The expressions in order; the last may yield the block's value.
        children: Vec<ExprId>,
    },
    /// A loop whose label branches re-enter from the top.
    Loop {
        /// Branch-target label, if any.
        name: Option<Name>,
        /// The loop body.
        body: ExprId,
    },
    /// A two-armed conditional.
    If {
        /// The `i32` condition.
        condition: ExprId,
        /// Taken when the condition is non-zero.
        if_true: ExprId,
        /// Taken otherwise, if present.
        if_false: Option<ExprId>,
    },
    /// Legacy exception-handling `try`.
    Try {
        /// Branch-target label, if any.
        name: Option<Name>,
        /// The protected body.
        body: ExprId,
        /// Handlers, in matching order.
        catches: Vec<Catch>,
    },
    /// Exception-handling `try_table`; catches branch to labels.
    TryTable {
        /// The protected body.
        body: ExprId,
        /// The catch clauses.
        catches: Vec<TableCatch>,
    },
    /// A `br` / `br_if` to a labeled scope.
    Break {
        /// The target label.
        target: Name,
        /// The value carried to the target, if any.
        value: Option<ExprId>,
        /// The condition for `br_if`; `None` for an unconditional `br`.
        condition: Option<ExprId>,
    },
    /// A `br_table`.
    Switch {
        /// The table of target labels.
        targets: Vec<Name>,
        /// The default label.
        default: Name,
        /// The value carried to the target, if any.
        value: Option<ExprId>,
        /// The selector.
        condition: ExprId,
    },
    /// A branching reference test (`br_on_null`, `br_on_cast`, ...).
    BrOn {
        /// Which test.
        op: BrOnOp,
        /// The target label.
        target: Name,
        /// The tested reference.
        reference: ExprId,
        /// The cast type for the cast variants.
        cast_ty: Type,
    },
    /// Return from the function.
    Return {
        /// The returned value, if any.
        value: Option<ExprId>,
    },
    /// A direct call.
    Call {
        /// Callee name.
        target: Name,
        /// Arguments in order.
        operands: Vec<ExprId>,
        /// The callee's declared result type.
        result_ty: Type,
    },
    /// Read a local.
    LocalGet {
        /// The local index.
        index: u32,
    },
    /// Write (or tee) a local.
    LocalSet {
        /// The local index.
        index: u32,
        /// The stored value.
        value: ExprId,
        /// Whether the value also flows out (`local.tee`).
        is_tee: bool,
    },
    /// A null reference of a given heap type.
    RefNull {
        /// The heap type of the null.
        heap: HeapType,
    },
    /// Test a reference for null.
    RefIsNull {
        /// The tested reference.
        value: ExprId,
    },
    /// Compare two references for identity.
    RefEq {
        /// Left operand.
        left: ExprId,
        /// Right operand.
        right: ExprId,
    },
    /// Trap if the reference is null, else pass it through non-nullable.
    RefAsNonNull {
        /// The checked reference.
        value: ExprId,
    },
    /// Test whether a reference is of a given type.
    RefTest {
        /// The tested reference.
        reference: ExprId,
        /// The tested-for type.
        cast_ty: Type,
    },
    /// Cast a reference, trapping on failure. The expression's static type
    /// is the cast target. With a descriptor operand this is
    /// `ref.cast_desc`, which additionally requires the value's descriptor
    /// to be identical to the operand.
    RefCast {
        /// The cast reference.
        reference: ExprId,
        /// The required descriptor, for descriptor casts.
        descriptor: Option<ExprId>,
    },
    /// Read the descriptor of a reference.
    RefGetDesc {
        /// The described reference.
        reference: ExprId,
    },
    /// Allocate a struct. An empty operand list on a struct with fields is
    /// `struct.new_default`.
    StructNew {
        /// The field initializers, in field order.
        operands: Vec<ExprId>,
        /// The descriptor value, if the type has one.
        descriptor: Option<ExprId>,
    },
    /// Read a struct field.
    StructGet {
        /// The struct reference.
        reference: ExprId,
        /// The field index.
        field: u32,
        /// Sign-extend packed fields.
        signed: bool,
        /// Memory ordering.
        order: MemoryOrder,
    },
    /// Write a struct field.
    StructSet {
        /// The struct reference.
        reference: ExprId,
        /// The field index.
        field: u32,
        /// The stored value.
        value: ExprId,
        /// Memory ordering.
        order: MemoryOrder,
    },
    /// Atomic read-modify-write of a struct field.
    StructRmw {
        /// The modification operator.
        op: RmwOp,
        /// The struct reference.
        reference: ExprId,
        /// The field index.
        field: u32,
        /// The modification operand.
        value: ExprId,
        /// Memory ordering.
        order: MemoryOrder,
    },
    /// Atomic compare-exchange of a struct field.
    StructCmpxchg {
        /// The struct reference.
        reference: ExprId,
        /// The field index.
        field: u32,
        /// The expected current value.
        expected: ExprId,
        /// The replacement value.
        replacement: ExprId,
        /// Memory ordering.
        order: MemoryOrder,
    },
    /// Allocate an array of a dynamic size. `init` of `None` is
    /// `array.new_default`.
    ArrayNew {
        /// The repeated initial element value, if any.
        init: Option<ExprId>,
        /// The element count.
        size: ExprId,
    },
    /// Allocate an array from a fixed list of values.
    ArrayNewFixed {
        /// The element values in order.
        values: Vec<ExprId>,
    },
    /// Read an array element.
    ArrayGet {
        /// The array reference.
        reference: ExprId,
        /// The element index.
        index: ExprId,
        /// Sign-extend packed elements.
        signed: bool,
        /// Memory ordering.
        order: MemoryOrder,
    },
    /// Write an array element.
    ArraySet {
        /// The array reference.
        reference: ExprId,
        /// The element index.
        index: ExprId,
        /// The stored value.
        value: ExprId,
        /// Memory ordering.
        order: MemoryOrder,
    },
}

impl ExprKind {
    /// Whether this expression opens nested scopes (its contents are
    /// deferred by the stringifying walker).
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            ExprKind::Block { .. }
                | ExprKind::Loop { .. }
                | ExprKind::If { .. }
                | ExprKind::Try { .. }
                | ExprKind::TryTable { .. }
        )
    }

    /// All child expressions in execution order, including the contents of
    /// control-flow structures.
    pub fn children(&self) -> Vec<ExprId> {
        let mut out = Vec::new();
        self.for_children(|id| out.push(id));
        out
    }

    fn for_children(&self, mut push: impl FnMut(ExprId)) {
        match self {
            ExprKind::Nop
            | ExprKind::Unreachable
            | ExprKind::Pop
            | ExprKind::Const { .. }
            | ExprKind::LocalGet { .. }
            | ExprKind::RefNull { .. } => {}
            ExprKind::Binary { left, right, .. } => {
                push(*left);
                push(*right);
            }
            ExprKind::Drop { value } => push(*value),
            ExprKind::Block { children, .. } => {
                for c in children {
                    push(*c);
                }
            }
            ExprKind::Loop { body, .. } => push(*body),
            ExprKind::If {
                condition,
                if_true,
                if_false,
            } => {
                push(*condition);
                push(*if_true);
                if let Some(f) = if_false {
                    push(*f);
                }
            }
            ExprKind::Try { body, catches, .. } => {
                push(*body);
                for c in catches {
                    push(c.body);
                }
            }
            ExprKind::TryTable { body, .. } => push(*body),
            ExprKind::Break {
                value, condition, ..
            } => {
                if let Some(v) = value {
                    push(*v);
                }
                if let Some(c) = condition {
                    push(*c);
                }
            }
            ExprKind::Switch {
                value, condition, ..
            } => {
                if let Some(v) = value {
                    push(*v);
                }
                push(*condition);
            }
            ExprKind::BrOn { reference, .. } => push(*reference),
            ExprKind::Return { value } => {
                if let Some(v) = value {
                    push(*v);
                }
            }
            ExprKind::Call { operands, .. } => {
                for o in operands {
                    push(*o);
                }
            }
            ExprKind::LocalSet { value, .. } => push(*value),
            ExprKind::RefIsNull { value } | ExprKind::RefAsNonNull { value } => push(*value),
            ExprKind::RefEq { left, right } => {
                push(*left);
                push(*right);
            }
            ExprKind::RefTest { reference, .. } | ExprKind::RefGetDesc { reference } => {
                push(*reference)
            }
            ExprKind::RefCast {
                reference,
                descriptor,
            } => {
                push(*reference);
                if let Some(d) = descriptor {
                    push(*d);
                }
            }
            ExprKind::StructNew {
                operands,
                descriptor,
            } => {
                for o in operands {
                    push(*o);
                }
                if let Some(d) = descriptor {
                    push(*d);
                }
            }
            ExprKind::StructGet { reference, .. } => push(*reference),
            ExprKind::StructSet {
                reference, value, ..
            } => {
                push(*reference);
                push(*value);
            }
            ExprKind::StructRmw {
                reference, value, ..
            } => {
                push(*reference);
                push(*value);
            }
            ExprKind::StructCmpxchg {
                reference,
                expected,
                replacement,
                ..
            } => {
                push(*reference);
                push(*expected);
                push(*replacement);
            }
            ExprKind::ArrayNew { init, size } => {
                if let Some(i) = init {
                    push(*i);
                }
                push(*size);
            }
            ExprKind::ArrayNewFixed { values } => {
                for v in values {
                    push(*v);
                }
            }
            ExprKind::ArrayGet {
                reference, index, ..
            } => {
                push(*reference);
                push(*index);
            }
            ExprKind::ArraySet {
                reference,
                index,
                value,
                ..
            } => {
                push(*reference);
                push(*index);
                push(*value);
            }
        }
    }

    /// Mutable slots for every child, in the same order as [`children`].
    ///
    /// [`children`]: ExprKind::children
    pub fn children_mut(&mut self) -> Vec<&mut ExprId> {
        let mut out: Vec<&mut ExprId> = Vec::new();
        match self {
            ExprKind::Nop
            | ExprKind::Unreachable
            | ExprKind::Pop
            | ExprKind::Const { .. }
            | ExprKind::LocalGet { .. }
            | ExprKind::RefNull { .. } => {}
            ExprKind::Binary { left, right, .. } => {
                out.push(left);
                out.push(right);
            }
            ExprKind::Drop { value } => out.push(value),
            ExprKind::Block { children, .. } => out.extend(children.iter_mut()),
            ExprKind::Loop { body, .. } => out.push(body),
            ExprKind::If {
                condition,
                if_true,
                if_false,
            } => {
                out.push(condition);
                out.push(if_true);
                if let Some(f) = if_false {
                    out.push(f);
                }
            }
            ExprKind::Try { body, catches, .. } => {
                out.push(body);
                for c in catches {
                    out.push(&mut c.body);
                }
            }
            ExprKind::TryTable { body, .. } => out.push(body),
            ExprKind::Break {
                value, condition, ..
            } => {
                if let Some(v) = value {
                    out.push(v);
                }
                if let Some(c) = condition {
                    out.push(c);
                }
            }
            ExprKind::Switch {
                value, condition, ..
            } => {
                if let Some(v) = value {
                    out.push(v);
                }
                out.push(condition);
            }
            ExprKind::BrOn { reference, .. } => out.push(reference),
            ExprKind::Return { value } => {
                if let Some(v) = value {
                    out.push(v);
                }
            }
            ExprKind::Call { operands, .. } => out.extend(operands.iter_mut()),
            ExprKind::LocalSet { value, .. } => out.push(value),
            ExprKind::RefIsNull { value } | ExprKind::RefAsNonNull { value } => out.push(value),
            ExprKind::RefEq { left, right } => {
                out.push(left);
                out.push(right);
            }
            ExprKind::RefTest { reference, .. } | ExprKind::RefGetDesc { reference } => {
                out.push(reference)
            }
            ExprKind::RefCast {
                reference,
                descriptor,
            } => {
                out.push(reference);
                if let Some(d) = descriptor {
                    out.push(d);
                }
            }
            ExprKind::StructNew {
                operands,
                descriptor,
            } => {
                out.extend(operands.iter_mut());
                if let Some(d) = descriptor {
                    out.push(d);
                }
            }
            ExprKind::StructGet { reference, .. } => out.push(reference),
            ExprKind::StructSet {
                reference, value, ..
            } => {
                out.push(reference);
                out.push(value);
            }
            ExprKind::StructRmw {
                reference, value, ..
            } => {
                out.push(reference);
                out.push(value);
            }
            ExprKind::StructCmpxchg {
                reference,
                expected,
                replacement,
                ..
            } => {
                out.push(reference);
                out.push(expected);
                out.push(replacement);
            }
            ExprKind::ArrayNew { init, size } => {
                if let Some(i) = init {
                    out.push(i);
                }
                out.push(size);
            }
            ExprKind::ArrayNewFixed { values } => out.extend(values.iter_mut()),
            ExprKind::ArrayGet {
                reference, index, ..
            } => {
                out.push(reference);
                out.push(index);
            }
            ExprKind::ArraySet {
                reference,
                index,
                value,
                ..
            } => {
                out.push(reference);
                out.push(index);
                out.push(value);
            }
        }
        out
    }

    /// The children that are stack operands in the enclosing scope. For
    /// control-flow structures these exclude the deferred contents: a block
    /// or loop consumes nothing, an `if` consumes only its condition.
    pub fn operand_children(&self) -> Vec<ExprId> {
        match self {
            ExprKind::Block { .. }
            | ExprKind::Loop { .. }
            | ExprKind::Try { .. }
            | ExprKind::TryTable { .. } => Vec::new(),
            ExprKind::If { condition, .. } => vec![*condition],
            _ => self.children(),
        }
    }

    /// Mutable slots for the stack operands, in [`operand_children`]
    /// order.
    ///
    /// [`operand_children`]: ExprKind::operand_children
    pub fn operand_children_mut(&mut self) -> Vec<&mut ExprId> {
        match self {
            ExprKind::Block { .. }
            | ExprKind::Loop { .. }
            | ExprKind::Try { .. }
            | ExprKind::TryTable { .. } => Vec::new(),
            ExprKind::If { condition, .. } => vec![condition],
            _ => self.children_mut(),
        }
    }

    /// The contents of a control-flow structure: the children that are
    /// *not* stack operands of the enclosing scope.
    pub fn content_children(&self) -> Vec<ExprId> {
        match self {
            ExprKind::If {
                if_true, if_false, ..
            } => {
                let mut out = vec![*if_true];
                if let Some(f) = if_false {
                    out.push(*f);
                }
                out
            }
            ExprKind::Block { .. }
            | ExprKind::Loop { .. }
            | ExprKind::Try { .. }
            | ExprKind::TryTable { .. } => self.children(),
            _ => Vec::new(),
        }
    }
}

/// An expression node: an operator plus its static type.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// The operator and operands.
    pub kind: ExprKind,
    /// The static type.
    pub ty: Type,
}

/// Arena of expression nodes owned by one function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExprArena {
    nodes: Vec<Expr>,
}

impl ExprArena {
    /// An empty arena.
    pub fn new() -> ExprArena {
        ExprArena::default()
    }

    /// Allocate a node and return its id.
    pub fn alloc(&mut self, kind: ExprKind, ty: Type) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(Expr { kind, ty });
        id
    }

    /// Number of nodes ever allocated (including rewritten-away residue).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replace the `nth` child (in [`ExprKind::children`] order) of
    /// `parent`.
    pub fn set_child(&mut self, parent: ExprId, nth: usize, child: ExprId) {
        let mut slots = self[parent].kind.children_mut();
        *slots[nth] = child;
    }

    /// All expressions reachable from `root`, in preorder.
    pub fn descendants(&self, root: ExprId) -> Vec<ExprId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            let mut kids = self[id].kind.children();
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    /// Deep-copy the subtree at `root` into `dest`, returning the new root.
    pub fn deep_copy_into(&self, root: ExprId, dest: &mut ExprArena) -> ExprId {
        let mut expr = self[root].clone();
        let kids = expr.kind.children();
        let copies: Vec<ExprId> = kids
            .iter()
            .map(|k| self.deep_copy_into(*k, dest))
            .collect();
        for (slot, copy) in expr.kind.children_mut().into_iter().zip(copies) {
            *slot = copy;
        }
        let id = ExprId(dest.nodes.len() as u32);
        dest.nodes.push(expr);
        id
    }
}

impl std::ops::Index<ExprId> for ExprArena {
    type Output = Expr;

    fn index(&self, id: ExprId) -> &Expr {
        &self.nodes[id.0 as usize]
    }
}

impl std::ops::IndexMut<ExprId> for ExprArena {
    fn index_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.nodes[id.0 as usize]
    }
}

/// A function: signature, locals, and an arena-allocated body.
///
/// Locals are addressed densely: parameters first, then appended vars.
/// A function without a body is an import.
#[derive(Debug, Clone)]
pub struct Function {
    /// The function's name, unique within its module.
    pub name: Name,
    /// Parameter types.
    pub params: Vec<Type>,
    /// Appended local variable types.
    pub vars: Vec<Type>,
    /// Result types.
    pub results: Vec<Type>,
    /// The expression arena owning every node of the body.
    pub arena: ExprArena,
    /// The root of the body, or `None` for an import.
    pub body: Option<ExprId>,
}

impl Function {
    /// A new function with no locals and no body.
    pub fn new(name: impl Into<Name>, params: Vec<Type>, results: Vec<Type>) -> Function {
        Function {
            name: name.into(),
            params,
            vars: Vec::new(),
            results,
            arena: ExprArena::new(),
            body: None,
        }
    }

    /// Whether this function is an import.
    pub fn is_import(&self) -> bool {
        self.body.is_none()
    }

    /// Total number of locals (parameters plus vars).
    pub fn num_locals(&self) -> u32 {
        (self.params.len() + self.vars.len()) as u32
    }

    /// The type of local `index`.
    pub fn local_type(&self, index: u32) -> Type {
        let index = index as usize;
        if index < self.params.len() {
            self.params[index]
        } else {
            self.vars[index - self.params.len()]
        }
    }

    /// Append a var of type `ty`, returning its fresh dense index.
    pub fn add_var(&mut self, ty: Type) -> u32 {
        self.vars.push(ty);
        self.num_locals() - 1
    }
}

/// Definition of a struct or array heap type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    /// The shape of the type.
    pub kind: TypeDefKind,
    /// The declared supertype, if any.
    pub supertype: Option<TypeIdx>,
    /// The descriptor type attached to this type, if any.
    pub descriptor: Option<TypeIdx>,
}

/// The shape of a defined heap type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDefKind {
    /// A struct with ordered fields.
    Struct {
        /// The fields in order.
        fields: Vec<Field>,
    },
    /// An array with a single element declaration.
    Array {
        /// The element declaration.
        element: Field,
    },
}

/// The module's heap types. Internally synchronized so function-parallel
/// passes can mint types (the array lowering does) while other workers
/// query subtyping.
#[derive(Debug, Default)]
pub struct TypeStore {
    defs: RwLock<Vec<TypeDef>>,
}

impl Clone for TypeStore {
    fn clone(&self) -> TypeStore {
        TypeStore {
            defs: RwLock::new(self.defs.read().unwrap().clone()),
        }
    }
}

impl TypeStore {
    /// An empty store.
    pub fn new() -> TypeStore {
        TypeStore::default()
    }

    /// Register a type definition, returning its index.
    pub fn define(&self, def: TypeDef) -> TypeIdx {
        let mut defs = self.defs.write().unwrap();
        defs.push(def);
        TypeIdx(defs.len() as u32 - 1)
    }

    /// Register a plain struct type with no supertype or descriptor.
    pub fn add_struct(&self, fields: Vec<Field>) -> TypeIdx {
        self.define(TypeDef {
            kind: TypeDefKind::Struct { fields },
            supertype: None,
            descriptor: None,
        })
    }

    /// Register a plain array type.
    pub fn add_array(&self, element: Field) -> TypeIdx {
        self.define(TypeDef {
            kind: TypeDefKind::Array { element },
            supertype: None,
            descriptor: None,
        })
    }

    /// The definition at `idx`.
    pub fn def(&self, idx: TypeIdx) -> TypeDef {
        self.defs.read().unwrap()[idx.0 as usize].clone()
    }

    /// Whether `idx` defines a struct.
    pub fn is_struct(&self, idx: TypeIdx) -> bool {
        matches!(self.def(idx).kind, TypeDefKind::Struct { .. })
    }

    /// The fields of a struct type.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not a struct.
    pub fn fields_of(&self, idx: TypeIdx) -> Vec<Field> {
        match self.def(idx).kind {
            TypeDefKind::Struct { fields } => fields,
            TypeDefKind::Array { .. } => unreachable!("expected a struct type"),
        }
    }

    /// The element declaration of an array type.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not an array.
    pub fn array_element(&self, idx: TypeIdx) -> Field {
        match self.def(idx).kind {
            TypeDefKind::Array { element } => element,
            TypeDefKind::Struct { .. } => unreachable!("expected an array type"),
        }
    }

    /// The descriptor type of `idx`, if declared.
    pub fn descriptor_of(&self, idx: TypeIdx) -> Option<TypeIdx> {
        self.def(idx).descriptor
    }

    /// The bottom of the hierarchy a heap type belongs to.
    pub fn bottom(&self, _heap: HeapType) -> HeapType {
        HeapType::None
    }

    fn abstract_of(&self, idx: TypeIdx) -> HeapType {
        match self.def(idx).kind {
            TypeDefKind::Struct { .. } => HeapType::Struct,
            TypeDefKind::Array { .. } => HeapType::Array,
        }
    }

    /// Heap subtyping: declared supertype chains plus the abstract layers
    /// of the `any` hierarchy.
    pub fn heap_is_sub(&self, a: HeapType, b: HeapType) -> bool {
        if a == b || a == HeapType::None {
            return true;
        }
        match b {
            HeapType::Any => true,
            HeapType::Eq => a != HeapType::Any,
            HeapType::Struct => match a {
                HeapType::Defined(idx) => self.is_struct(idx),
                _ => false,
            },
            HeapType::Array => match a {
                HeapType::Defined(idx) => !self.is_struct(idx),
                _ => false,
            },
            HeapType::Defined(want) => match a {
                HeapType::Defined(mut cur) => loop {
                    if cur == want {
                        return true;
                    }
                    match self.def(cur).supertype {
                        Some(next) => cur = next,
                        None => return false,
                    }
                },
                _ => false,
            },
            HeapType::None => false,
        }
    }

    /// Value-type subtyping. `unreachable` is the bottom of every type.
    pub fn is_sub_type(&self, a: Type, b: Type) -> bool {
        if a == b || a == Type::Unreachable {
            return true;
        }
        match (a, b) {
            (Type::Ref(an, ah), Type::Ref(bn, bh)) => {
                let null_ok = an == Nullability::NonNullable || bn == Nullability::Nullable;
                null_ok && self.heap_is_sub(ah, bh)
            }
            _ => false,
        }
    }

    /// Least upper bound of two heap types.
    pub fn heap_lub(&self, a: HeapType, b: HeapType) -> HeapType {
        if self.heap_is_sub(a, b) {
            return b;
        }
        if self.heap_is_sub(b, a) {
            return a;
        }
        if let (HeapType::Defined(x), HeapType::Defined(y)) = (a, b) {
            let mut ancestors = std::collections::HashSet::new();
            let mut cur = x;
            loop {
                ancestors.insert(cur);
                match self.def(cur).supertype {
                    Some(next) => cur = next,
                    None => break,
                }
            }
            let mut cur = y;
            loop {
                if ancestors.contains(&cur) {
                    return HeapType::Defined(cur);
                }
                match self.def(cur).supertype {
                    Some(next) => cur = next,
                    None => break,
                }
            }
        }
        let kind_of = |h: HeapType| match h {
            HeapType::Defined(idx) => self.abstract_of(idx),
            other => other,
        };
        match (kind_of(a), kind_of(b)) {
            (HeapType::Struct, HeapType::Struct) => HeapType::Struct,
            (HeapType::Array, HeapType::Array) => HeapType::Array,
            (HeapType::Any, _) | (_, HeapType::Any) => HeapType::Any,
            _ => HeapType::Eq,
        }
    }

    /// Least upper bound of two value types.
    ///
    /// # Panics
    ///
    /// Panics on types with no upper bound; callers only merge types that
    /// arose from a validated program.
    pub fn lub(&self, a: Type, b: Type) -> Type {
        if a == b || b == Type::Unreachable {
            return a;
        }
        if a == Type::Unreachable {
            return b;
        }
        match (a, b) {
            (Type::Ref(an, ah), Type::Ref(bn, bh)) => {
                let nullability = if an == Nullability::Nullable || bn == Nullability::Nullable {
                    Nullability::Nullable
                } else {
                    Nullability::NonNullable
                };
                Type::Ref(nullability, self.heap_lub(ah, bh))
            }
            _ => unreachable!("no upper bound for {a:?} and {b:?}"),
        }
    }
}

/// A module: an ordered set of functions addressable by name, plus the
/// heap type store.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// The functions in order.
    pub functions: Vec<Function>,
    /// The module's heap types.
    pub types: TypeStore,
    name_index: HashMap<Name, usize>,
}

impl Module {
    /// An empty module.
    pub fn new() -> Module {
        Module::default()
    }

    /// Add a function, returning its index.
    ///
    /// # Panics
    ///
    /// Panics if a function of the same name already exists.
    pub fn add_function(&mut self, func: Function) -> usize {
        let idx = self.functions.len();
        let prev = self.name_index.insert(func.name.clone(), idx);
        assert!(prev.is_none(), "duplicate function name {}", func.name);
        self.functions.push(func);
        idx
    }

    /// The index of the function named `name`.
    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    /// The function named `name`.
    pub fn get_function(&self, name: &str) -> Option<&Function> {
        self.function_index(name).map(|i| &self.functions[i])
    }

    /// The function named `name`, mutably.
    pub fn get_function_mut(&mut self, name: &str) -> Option<&mut Function> {
        let idx = self.function_index(name)?;
        Some(&mut self.functions[idx])
    }

    /// A function name starting with `prefix` that is not yet taken.
    pub fn valid_function_name(&self, prefix: &str) -> Name {
        let mut n = 0usize;
        loop {
            let candidate = format!("{prefix}{n}");
            if !self.name_index.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Rebuild the name-to-index map after reordering `functions` directly.
    pub fn update_function_index(&mut self) {
        self.name_index = self
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_chain() -> (TypeStore, TypeIdx, TypeIdx) {
        let types = TypeStore::new();
        let parent = types.add_struct(vec![Field::immutable(Type::I32)]);
        let child = types.define(TypeDef {
            kind: TypeDefKind::Struct {
                fields: vec![Field::immutable(Type::I32), Field::immutable(Type::I64)],
            },
            supertype: Some(parent),
            descriptor: None,
        });
        (types, parent, child)
    }

    #[test]
    fn test_heap_subtyping_chain() {
        let (types, parent, child) = store_with_chain();
        assert!(types.heap_is_sub(HeapType::Defined(child), HeapType::Defined(parent)));
        assert!(!types.heap_is_sub(HeapType::Defined(parent), HeapType::Defined(child)));
        assert!(types.heap_is_sub(HeapType::Defined(child), HeapType::Struct));
        assert!(types.heap_is_sub(HeapType::Defined(child), HeapType::Eq));
        assert!(types.heap_is_sub(HeapType::Defined(child), HeapType::Any));
        assert!(types.heap_is_sub(HeapType::None, HeapType::Defined(child)));
    }

    #[test]
    fn test_ref_subtyping_nullability() {
        let (types, parent, child) = store_with_chain();
        let non_null_child = Type::non_nullable(HeapType::Defined(child));
        let nullable_parent = Type::nullable(HeapType::Defined(parent));
        assert!(types.is_sub_type(non_null_child, nullable_parent));
        assert!(!types.is_sub_type(nullable_parent, non_null_child));
        assert!(types.is_sub_type(Type::Unreachable, non_null_child));
    }

    #[test]
    fn test_heap_lub_meets_at_common_ancestor() {
        let (types, parent, child) = store_with_chain();
        let other = types.define(TypeDef {
            kind: TypeDefKind::Struct {
                fields: vec![Field::immutable(Type::I32), Field::immutable(Type::F64)],
            },
            supertype: Some(parent),
            descriptor: None,
        });
        assert_eq!(
            types.heap_lub(HeapType::Defined(child), HeapType::Defined(other)),
            HeapType::Defined(parent)
        );
        let array = types.add_array(Field::mutable(Type::I32));
        assert_eq!(
            types.heap_lub(HeapType::Defined(child), HeapType::Defined(array)),
            HeapType::Eq
        );
    }

    #[test]
    fn test_children_and_slots_agree() {
        let mut arena = ExprArena::new();
        let a = arena.alloc(
            ExprKind::Const {
                value: Literal::I32(1),
            },
            Type::I32,
        );
        let b = arena.alloc(
            ExprKind::Const {
                value: Literal::I32(2),
            },
            Type::I32,
        );
        let add = arena.alloc(
            ExprKind::Binary {
                op: BinaryOp::AddI32,
                left: a,
                right: b,
            },
            Type::I32,
        );
        assert_eq!(arena[add].kind.children(), vec![a, b]);
        let c = arena.alloc(
            ExprKind::Const {
                value: Literal::I32(3),
            },
            Type::I32,
        );
        arena.set_child(add, 1, c);
        assert_eq!(arena[add].kind.children(), vec![a, c]);
    }

    #[test]
    fn test_add_var_indices_follow_params() {
        let mut func = Function::new("f", vec![Type::I32, Type::I64], vec![]);
        assert_eq!(func.add_var(Type::F32), 2);
        assert_eq!(func.add_var(Type::F64), 3);
        assert_eq!(func.local_type(0), Type::I32);
        assert_eq!(func.local_type(3), Type::F64);
    }

    #[test]
    fn test_valid_function_name_skips_taken() {
        let mut module = Module::new();
        module.add_function(Function::new("outline$0", vec![], vec![]));
        assert_eq!(module.valid_function_name("outline$"), "outline$1");
    }

    #[test]
    fn test_deep_copy_preserves_shape() {
        let mut arena = ExprArena::new();
        let a = arena.alloc(
            ExprKind::Const {
                value: Literal::I32(7),
            },
            Type::I32,
        );
        let d = arena.alloc(ExprKind::Drop { value: a }, Type::None);
        let block = arena.alloc(
            ExprKind::Block {
                name: None,
                children: vec![d],
            },
            Type::None,
        );
        let mut dest = ExprArena::new();
        let copy = arena.deep_copy_into(block, &mut dest);
        assert_eq!(dest.descendants(copy).len(), 3);
        let ExprKind::Block { children, .. } = &dest[copy].kind else {
            panic!("expected a block");
        };
        let ExprKind::Drop { value } = dest[children[0]].kind else {
            panic!("expected a drop");
        };
        assert_eq!(
            dest[value].kind,
            ExprKind::Const {
                value: Literal::I32(7)
            }
        );
    }
}
