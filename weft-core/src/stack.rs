//! Compositional stack type analysis.
//!
//! A [`StackSignature`] characterizes how an instruction sequence interacts
//! with the value stack:
//! - `params`: types consumed from the stack (innermost first)
//! - `results`: types produced on the stack (innermost first)
//! - `kind`: whether the signature is `Fixed` (deterministic) or
//!   `Polymorphic` (includes unreachable code, which matches any outer
//!   stack)
//!
//! The outlining pass sums the shallow signatures of a linear instruction
//! range to compute the signature of the function it extracts.

use crate::{ExprArena, ExprId, Type};

/// Kind of stack signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// Fixed (deterministic, all paths reachable).
    Fixed,
    /// Polymorphic (contains unreachable code that can match any outer
    /// stack).
    Polymorphic,
}

/// Stack signature: describes how an instruction sequence affects the
/// value stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSignature {
    /// Types consumed from the outer stack.
    pub params: Vec<Type>,
    /// Types produced to the outer stack.
    pub results: Vec<Type>,
    /// Whether this signature includes polymorphic behavior.
    pub kind: SignatureKind,
}

impl StackSignature {
    /// Create a new stack signature.
    pub fn new(params: Vec<Type>, results: Vec<Type>, kind: SignatureKind) -> StackSignature {
        StackSignature {
            params,
            results,
            kind,
        }
    }

    /// Empty signature: `[] -> []`.
    pub fn empty() -> StackSignature {
        StackSignature {
            params: vec![],
            results: vec![],
            kind: SignatureKind::Fixed,
        }
    }

    /// The shallow signature of a single expression: it pops its stack
    /// operands and pushes its own value. Contents of control-flow
    /// structures do not appear — a block consumes nothing and produces
    /// its type, an `if` consumes only its condition.
    pub fn of_expr(arena: &ExprArena, id: ExprId) -> StackSignature {
        let params: Vec<Type> = arena[id]
            .kind
            .operand_children()
            .iter()
            .map(|c| arena[*c].ty)
            .filter(|ty| ty.is_concrete())
            .collect();
        match arena[id].ty {
            Type::Unreachable => StackSignature::new(params, vec![], SignatureKind::Polymorphic),
            Type::None => StackSignature::new(params, vec![], SignatureKind::Fixed),
            ty => StackSignature::new(params, vec![ty], SignatureKind::Fixed),
        }
    }

    /// Check if two signatures compose exactly: the outputs of `self` are
    /// precisely the inputs of `next`.
    pub fn composes(&self, next: &StackSignature) -> bool {
        self.results == next.params
    }

    /// Compose two exactly-matching signatures.
    ///
    /// # Panics
    ///
    /// Panics if the signatures don't compose. Use [`composes`] to check,
    /// or [`append`] for the general sequential sum.
    ///
    /// [`composes`]: StackSignature::composes
    /// [`append`]: StackSignature::append
    pub fn compose(&self, next: &StackSignature) -> StackSignature {
        assert!(
            self.composes(next),
            "signatures don't compose: {:?} != {:?}",
            self.results,
            next.params
        );
        let kind = if self.kind == SignatureKind::Polymorphic
            || next.kind == SignatureKind::Polymorphic
        {
            SignatureKind::Polymorphic
        } else {
            SignatureKind::Fixed
        };
        StackSignature {
            params: self.params.clone(),
            results: next.results.clone(),
            kind,
        }
    }

    /// Sequentially sum `next` onto `self`: `next` pops from `self`'s
    /// results; params it still needs come from deeper in the outer stack
    /// and are prepended to the composite's params. A polymorphic `next`
    /// absorbs whatever results remain beneath it.
    pub fn append(&mut self, next: &StackSignature) {
        for param in next.params.iter().rev() {
            match self.results.pop() {
                Some(produced) => {
                    debug_assert!(
                        produced == *param
                            || produced == Type::Unreachable
                            || *param == Type::Unreachable,
                        "stack mismatch: produced {produced:?}, consumed {param:?}"
                    );
                }
                None => {
                    if self.kind == SignatureKind::Fixed {
                        self.params.insert(0, *param);
                    }
                    // A polymorphic prefix supplies arbitrarily many
                    // values; nothing to record.
                }
            }
        }
        if next.kind == SignatureKind::Polymorphic {
            self.results = next.results.clone();
            self.kind = SignatureKind::Polymorphic;
        } else {
            self.results.extend(next.results.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, Builder, Function, Literal};

    #[test]
    fn test_const_then_add_composes_to_one_param() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let c = b.make_const(Literal::I32(1));
        let x = b.make_local_get(0, Type::I32);
        let add = b.make_binary(BinaryOp::AddI32, x, c);

        let mut sig = StackSignature::empty();
        sig.append(&StackSignature::of_expr(&func.arena, c));
        sig.append(&StackSignature::of_expr(&func.arena, add));
        // The add needs a second i32 from outside the range.
        assert_eq!(sig.params, vec![Type::I32]);
        assert_eq!(sig.results, vec![Type::I32]);
        assert_eq!(sig.kind, SignatureKind::Fixed);
    }

    #[test]
    fn test_self_contained_range_has_no_params() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let c1 = b.make_const(Literal::I32(1));
        let c2 = b.make_const(Literal::I32(2));
        let add = b.make_binary(BinaryOp::AddI32, c1, c2);

        let mut sig = StackSignature::empty();
        for id in [c1, c2, add] {
            sig.append(&StackSignature::of_expr(&func.arena, id));
        }
        assert_eq!(sig.params, Vec::<Type>::new());
        assert_eq!(sig.results, vec![Type::I32]);
    }

    #[test]
    fn test_unreachable_makes_polymorphic() {
        let mut func = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut func);
        let c = b.make_const(Literal::I32(1));
        let u = b.make_unreachable();

        let mut sig = StackSignature::empty();
        sig.append(&StackSignature::of_expr(&func.arena, c));
        sig.append(&StackSignature::of_expr(&func.arena, u));
        assert_eq!(sig.kind, SignatureKind::Polymorphic);
        // The const's result is swallowed by the polymorphic tail.
        assert_eq!(sig.results, Vec::<Type>::new());
    }

    #[test]
    fn test_exact_compose() {
        let a = StackSignature::new(vec![], vec![Type::I32], SignatureKind::Fixed);
        let b = StackSignature::new(vec![Type::I32], vec![Type::I64], SignatureKind::Fixed);
        assert!(a.composes(&b));
        let c = a.compose(&b);
        assert_eq!(c.params, Vec::<Type>::new());
        assert_eq!(c.results, vec![Type::I64]);
    }
}
