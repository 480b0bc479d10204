//! Expression construction helpers.
//!
//! Wraps the boilerplate of allocating correctly-typed nodes in a
//! function's arena. Rewrites and tests go through this instead of calling
//! [`ExprArena::alloc`] with hand-computed types.

use crate::{
    BinaryOp, BrOnOp, ExprId, ExprKind, Field, Function, HeapType, Literal, MemoryOrder, Name,
    StorageType, Type, TypeIdx,
};

/// Builds expressions into one function's arena.
pub struct Builder<'a> {
    func: &'a mut Function,
}

impl<'a> Builder<'a> {
    /// A builder for `func`.
    pub fn new(func: &'a mut Function) -> Builder<'a> {
        Builder { func }
    }

    fn alloc(&mut self, kind: ExprKind, ty: Type) -> ExprId {
        self.func.arena.alloc(kind, ty)
    }

    fn ty(&self, id: ExprId) -> Type {
        self.func.arena[id].ty
    }

    /// Append a var to the function, returning its index.
    pub fn add_var(&mut self, ty: Type) -> u32 {
        self.func.add_var(ty)
    }

    /// `nop`.
    pub fn make_nop(&mut self) -> ExprId {
        self.alloc(ExprKind::Nop, Type::None)
    }

    /// `unreachable`.
    pub fn make_unreachable(&mut self) -> ExprId {
        self.alloc(ExprKind::Unreachable, Type::Unreachable)
    }

    /// A constant.
    pub fn make_const(&mut self, value: Literal) -> ExprId {
        self.alloc(ExprKind::Const { value }, value.ty())
    }

    /// The zero value of `ty`: a numeric zero, or a null for references.
    pub fn make_zero(&mut self, ty: Type) -> ExprId {
        match Literal::zero(ty) {
            Some(lit) => self.make_const(lit),
            None => self.make_ref_null(ty.heap_type()),
        }
    }

    /// A binary operation.
    pub fn make_binary(&mut self, op: BinaryOp, left: ExprId, right: ExprId) -> ExprId {
        let ty = if self.ty(left) == Type::Unreachable || self.ty(right) == Type::Unreachable {
            Type::Unreachable
        } else {
            op.result_type()
        };
        self.alloc(ExprKind::Binary { op, left, right }, ty)
    }

    /// Evaluate and discard `value`.
    pub fn make_drop(&mut self, value: ExprId) -> ExprId {
        let ty = if self.ty(value) == Type::Unreachable {
            Type::Unreachable
        } else {
            Type::None
        };
        self.alloc(ExprKind::Drop { value }, ty)
    }

    /// An unnamed block of `children`, typed by its final expression.
    pub fn make_block(&mut self, children: Vec<ExprId>) -> ExprId {
        let ty = children.last().map_or(Type::None, |last| self.ty(*last));
        self.alloc(
            ExprKind::Block {
                name: None,
                children,
            },
            ty,
        )
    }

    /// A labeled block. The type must be supplied since branches may
    /// determine it.
    pub fn make_named_block(&mut self, name: impl Into<Name>, children: Vec<ExprId>, ty: Type) -> ExprId {
        self.alloc(
            ExprKind::Block {
                name: Some(name.into()),
                children,
            },
            ty,
        )
    }

    /// A two-expression sequence typed by the second expression.
    pub fn make_sequence(&mut self, first: ExprId, second: ExprId) -> ExprId {
        self.make_block(vec![first, second])
    }

    /// Append `rest` to `first`, reusing `first` if it is already an
    /// unnamed block.
    pub fn blockify(&mut self, first: ExprId, rest: Vec<ExprId>) -> ExprId {
        if let ExprKind::Block { name: None, .. } = &self.func.arena[first].kind {
            let ty = rest.last().map_or(self.ty(first), |last| self.ty(*last));
            let ExprKind::Block { children, .. } = &mut self.func.arena[first].kind else {
                unreachable!();
            };
            children.extend(rest);
            self.func.arena[first].ty = ty;
            return first;
        }
        let mut children = vec![first];
        children.extend(rest);
        self.make_block(children)
    }

    /// A labeled loop around `body`.
    pub fn make_loop(&mut self, name: Option<Name>, body: ExprId) -> ExprId {
        let ty = self.ty(body);
        self.alloc(ExprKind::Loop { name, body }, ty)
    }

    /// An `if`, with the simple type rule for freshly built arms (matching
    /// arms, or one arm `unreachable`).
    pub fn make_if(&mut self, condition: ExprId, if_true: ExprId, if_false: Option<ExprId>) -> ExprId {
        let ty = match if_false {
            None => Type::None,
            Some(f) => {
                let t_ty = self.ty(if_true);
                let f_ty = self.ty(f);
                if t_ty == Type::Unreachable {
                    f_ty
                } else {
                    t_ty
                }
            }
        };
        let ty = if self.ty(condition) == Type::Unreachable {
            Type::Unreachable
        } else {
            ty
        };
        self.alloc(
            ExprKind::If {
                condition,
                if_true,
                if_false,
            },
            ty,
        )
    }

    /// A `br` / `br_if` to `target`.
    pub fn make_break(
        &mut self,
        target: impl Into<Name>,
        value: Option<ExprId>,
        condition: Option<ExprId>,
    ) -> ExprId {
        let ty = match condition {
            None => Type::Unreachable,
            Some(_) => value.map_or(Type::None, |v| self.ty(v)),
        };
        self.alloc(
            ExprKind::Break {
                target: target.into(),
                value,
                condition,
            },
            ty,
        )
    }

    /// A `return`.
    pub fn make_return(&mut self, value: Option<ExprId>) -> ExprId {
        self.alloc(ExprKind::Return { value }, Type::Unreachable)
    }

    /// A direct call with the callee's declared result type.
    pub fn make_call(&mut self, target: impl Into<Name>, operands: Vec<ExprId>, result_ty: Type) -> ExprId {
        self.alloc(
            ExprKind::Call {
                target: target.into(),
                operands,
                result_ty,
            },
            result_ty,
        )
    }

    /// Read local `index`, which has type `ty`.
    pub fn make_local_get(&mut self, index: u32, ty: Type) -> ExprId {
        self.alloc(ExprKind::LocalGet { index }, ty)
    }

    /// Write local `index`.
    pub fn make_local_set(&mut self, index: u32, value: ExprId) -> ExprId {
        let ty = if self.ty(value) == Type::Unreachable {
            Type::Unreachable
        } else {
            Type::None
        };
        self.alloc(
            ExprKind::LocalSet {
                index,
                value,
                is_tee: false,
            },
            ty,
        )
    }

    /// Tee local `index`, flowing the value out with the local's type.
    pub fn make_local_tee(&mut self, index: u32, value: ExprId, ty: Type) -> ExprId {
        let ty = if self.ty(value) == Type::Unreachable {
            Type::Unreachable
        } else {
            ty
        };
        self.alloc(
            ExprKind::LocalSet {
                index,
                value,
                is_tee: true,
            },
            ty,
        )
    }

    /// A null reference of `heap`.
    pub fn make_ref_null(&mut self, heap: HeapType) -> ExprId {
        self.alloc(ExprKind::RefNull { heap }, Type::nullable(heap))
    }

    /// `ref.is_null`.
    pub fn make_ref_is_null(&mut self, value: ExprId) -> ExprId {
        self.alloc(ExprKind::RefIsNull { value }, Type::I32)
    }

    /// `ref.eq`.
    pub fn make_ref_eq(&mut self, left: ExprId, right: ExprId) -> ExprId {
        self.alloc(ExprKind::RefEq { left, right }, Type::I32)
    }

    /// `ref.as_non_null`.
    pub fn make_ref_as_non_null(&mut self, value: ExprId) -> ExprId {
        let ty = match self.ty(value) {
            Type::Ref(_, heap) => Type::non_nullable(heap),
            Type::Unreachable => Type::Unreachable,
            other => unreachable!("ref.as_non_null of {other:?}"),
        };
        self.alloc(ExprKind::RefAsNonNull { value }, ty)
    }

    /// `ref.test` against `cast_ty`.
    pub fn make_ref_test(&mut self, reference: ExprId, cast_ty: Type) -> ExprId {
        self.alloc(ExprKind::RefTest { reference, cast_ty }, Type::I32)
    }

    /// `ref.cast` to `ty`, optionally with a descriptor operand.
    pub fn make_ref_cast(&mut self, reference: ExprId, descriptor: Option<ExprId>, ty: Type) -> ExprId {
        self.alloc(
            ExprKind::RefCast {
                reference,
                descriptor,
            },
            ty,
        )
    }

    /// `ref.get_desc`, yielding a reference to the descriptor type.
    pub fn make_ref_get_desc(&mut self, reference: ExprId, desc_ty: Type) -> ExprId {
        self.alloc(ExprKind::RefGetDesc { reference }, desc_ty)
    }

    /// `struct.new` of the defined type `ty`. An empty operand list on a
    /// struct with fields is `struct.new_default`.
    pub fn make_struct_new(
        &mut self,
        ty: TypeIdx,
        operands: Vec<ExprId>,
        descriptor: Option<ExprId>,
    ) -> ExprId {
        self.alloc(
            ExprKind::StructNew {
                operands,
                descriptor,
            },
            Type::non_nullable(HeapType::Defined(ty)),
        )
    }

    /// `struct.get` of field `field`, yielding `ty`.
    pub fn make_struct_get(
        &mut self,
        reference: ExprId,
        field: u32,
        ty: Type,
        signed: bool,
        order: MemoryOrder,
    ) -> ExprId {
        self.alloc(
            ExprKind::StructGet {
                reference,
                field,
                signed,
                order,
            },
            ty,
        )
    }

    /// `struct.set` of field `field`.
    pub fn make_struct_set(
        &mut self,
        reference: ExprId,
        field: u32,
        value: ExprId,
        order: MemoryOrder,
    ) -> ExprId {
        self.alloc(
            ExprKind::StructSet {
                reference,
                field,
                value,
                order,
            },
            Type::None,
        )
    }

    /// `array.new_fixed` of the defined array type `ty`.
    pub fn make_array_new_fixed(&mut self, ty: TypeIdx, values: Vec<ExprId>) -> ExprId {
        self.alloc(
            ExprKind::ArrayNewFixed { values },
            Type::non_nullable(HeapType::Defined(ty)),
        )
    }

    /// `array.get`, yielding `ty`.
    pub fn make_array_get(
        &mut self,
        reference: ExprId,
        index: ExprId,
        ty: Type,
        signed: bool,
    ) -> ExprId {
        self.alloc(
            ExprKind::ArrayGet {
                reference,
                index,
                signed,
                order: MemoryOrder::Unordered,
            },
            ty,
        )
    }

    /// `array.set`.
    pub fn make_array_set(&mut self, reference: ExprId, index: ExprId, value: ExprId) -> ExprId {
        self.alloc(
            ExprKind::ArraySet {
                reference,
                index,
                value,
                order: MemoryOrder::Unordered,
            },
            Type::None,
        )
    }

    /// A `br_on_*` to `target`.
    pub fn make_br_on(
        &mut self,
        op: BrOnOp,
        target: impl Into<Name>,
        reference: ExprId,
        cast_ty: Type,
    ) -> ExprId {
        let ty = match op {
            BrOnOp::Null => match self.ty(reference) {
                Type::Ref(_, heap) => Type::non_nullable(heap),
                other => other,
            },
            _ => self.ty(reference),
        };
        self.alloc(
            ExprKind::BrOn {
                op,
                target: target.into(),
                reference,
                cast_ty,
            },
            ty,
        )
    }

    /// Read a field value out of a local, fixing up packed storage: packed
    /// reads mask (unsigned) or shift-pair (signed) the stored `i32`.
    pub fn make_packed_field_get(&mut self, value: ExprId, field: &Field, signed: bool) -> ExprId {
        let bits = match field.storage {
            StorageType::Val(_) => return value,
            StorageType::I8 => 8,
            StorageType::I16 => 16,
        };
        if signed {
            let shift = self.make_const(Literal::I32(32 - bits));
            let shifted = self.make_binary(BinaryOp::ShlI32, value, shift);
            let shift = self.make_const(Literal::I32(32 - bits));
            self.make_binary(BinaryOp::ShrSI32, shifted, shift)
        } else {
            let mask = self.make_const(Literal::I32(if bits == 8 { 0xff } else { 0xffff }));
            self.make_binary(BinaryOp::AndI32, value, mask)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blockify_reuses_unnamed_block() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let x = b.make_nop();
        let block = b.make_block(vec![x]);
        let c = b.make_const(Literal::I32(3));
        let combined = b.blockify(block, vec![c]);
        assert_eq!(combined, block);
        assert_eq!(func.arena[block].ty, Type::I32);
    }

    #[test]
    fn test_blockify_wraps_non_block() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let x = b.make_const(Literal::I32(1));
        let d = b.make_drop(x);
        let c = b.make_const(Literal::I32(2));
        let combined = b.blockify(d, vec![c]);
        assert_ne!(combined, d);
        let ExprKind::Block { children, .. } = &func.arena[combined].kind else {
            panic!("expected a block");
        };
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_packed_field_get_masks_unsigned() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let v = b.make_local_get(0, Type::I32);
        let field = Field {
            storage: StorageType::I8,
            mutable: true,
        };
        let fixed = b.make_packed_field_get(v, &field, false);
        let ExprKind::Binary { op, .. } = func.arena[fixed].kind else {
            panic!("expected a mask");
        };
        assert_eq!(op, BinaryOp::AndI32);
    }

    #[test]
    fn test_packed_field_get_passes_unpacked_through() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let v = b.make_local_get(0, Type::I64);
        let field = Field::mutable(Type::I64);
        assert_eq!(b.make_packed_field_get(v, &field, true), v);
    }
}
