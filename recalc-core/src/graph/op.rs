//! Operation Kinds
//!
//! The closed set of evaluators an operation node can carry. Every variant
//! except [`OpKind::Generic`] writes into the node's existing cache, so once
//! the cache has been sized by the first evaluation, recomputing allocates
//! nothing.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use parking_lot::MappedRwLockReadGuard;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::kernels;
use super::node::NodeRef;
use crate::error::{EvalError, EvalResult};
use crate::reactive::Parameter;
use crate::value::{arith, Value};

/// Evaluator of a generic node: takes the child values, returns a new value.
pub type GenericFn = Arc<dyn Fn(&[&Value]) -> EvalResult<Value> + Send + Sync>;

/// Position selected by an indexing node. Positions are zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Index {
    /// One element of a vector.
    Element(usize),
    /// Elements `start..end` of a vector.
    Range { start: usize, end: usize },
    /// Entry `(row, col)` of a matrix.
    Entry(usize, usize),
}

/// A named fallback evaluator that allocates its result.
#[derive(Clone)]
pub struct GenericOp {
    name: Cow<'static, str>,
    eval: GenericFn,
}

impl GenericOp {
    pub fn new(name: impl Into<Cow<'static, str>>, eval: GenericFn) -> Self {
        Self {
            name: name.into(),
            eval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the evaluator on plain values.
    pub fn call(&self, args: &[&Value]) -> EvalResult<Value> {
        (self.eval)(args)
    }

    fn evaluate_into(&self, out: &mut Value, children: &[NodeRef]) -> EvalResult<()> {
        let guards: SmallVec<[MappedRwLockReadGuard<'_, Value>; 4]> =
            children.iter().map(|c| c.value()).collect();
        let args: SmallVec<[&Value; 4]> = guards.iter().map(|g| &**g).collect();
        *out = self.call(&args)?;
        Ok(())
    }
}

impl fmt::Debug for GenericOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GenericOp").field(&self.name).finish()
    }
}

/// The evaluator carried by a node.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// A fixed value.
    Constant,
    /// A caller-updated value.
    Parameter(Parameter<Value>),
    /// `a + b`, elementwise.
    Add,
    /// `a - b`, elementwise.
    Sub,
    /// `-a`
    Neg,
    /// `s * a` for a numeric scalar `s` (first child).
    Scale,
    /// `a / s` for a numeric scalar `s` (second child).
    Div,
    /// Matrix times vector, matrix, or vector of affine functions.
    MatMul,
    /// Inner product.
    Dot,
    /// `x' * A * y` without materializing `A * y`.
    Bilinear,
    /// Vertical concatenation of any number of scalars and vectors.
    Concat,
    Index(Index),
    Transpose,
    Generic(GenericOp),
}

impl OpKind {
    /// Short name used in logs and diagnostics.
    pub fn label(&self) -> &str {
        match self {
            OpKind::Constant => "constant",
            OpKind::Parameter(_) => "parameter",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Neg => "neg",
            OpKind::Scale => "scale",
            OpKind::Div => "div",
            OpKind::MatMul => "matmul",
            OpKind::Dot => "dot",
            OpKind::Bilinear => "bilinear",
            OpKind::Concat => "concat",
            OpKind::Index(_) => "index",
            OpKind::Transpose => "transpose",
            OpKind::Generic(op) => op.name(),
        }
    }

    /// Number of children the evaluator reads, if fixed.
    pub fn arity(&self) -> Option<usize> {
        match self {
            OpKind::Constant | OpKind::Parameter(_) => Some(0),
            OpKind::Neg | OpKind::Index(_) | OpKind::Transpose => Some(1),
            OpKind::Add
            | OpKind::Sub
            | OpKind::Scale
            | OpKind::Div
            | OpKind::MatMul
            | OpKind::Dot => Some(2),
            OpKind::Bilinear => Some(3),
            OpKind::Concat | OpKind::Generic(_) => None,
        }
    }

    /// Whether the evaluator writes in place.
    pub fn is_specialized(&self) -> bool {
        !matches!(self, OpKind::Generic(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, OpKind::Constant | OpKind::Parameter(_))
    }

    /// The allocating evaluator that computes the same result. `None` for
    /// leaves.
    pub fn to_generic(&self) -> Option<GenericOp> {
        let eval: GenericFn = match self {
            OpKind::Constant | OpKind::Parameter(_) => return None,
            OpKind::Generic(op) => return Some(op.clone()),
            OpKind::Add => Arc::new(|args: &[&Value]| arith::add(args[0], args[1])),
            OpKind::Sub => Arc::new(|args: &[&Value]| arith::sub(args[0], args[1])),
            OpKind::Neg => Arc::new(|args: &[&Value]| arith::neg(args[0])),
            OpKind::Scale | OpKind::MatMul => {
                Arc::new(|args: &[&Value]| arith::mul(args[0], args[1]))
            }
            OpKind::Div => Arc::new(|args: &[&Value]| arith::div(args[0], args[1])),
            OpKind::Dot => Arc::new(|args: &[&Value]| arith::dot(args[0], args[1])),
            OpKind::Bilinear => Arc::new(|args: &[&Value]| {
                arith::dot(args[0], &arith::mul(args[1], args[2])?)
            }),
            OpKind::Concat => Arc::new(|args: &[&Value]| arith::concat(args)),
            OpKind::Index(index) => {
                let index = *index;
                Arc::new(move |args: &[&Value]| {
                    let a = args[0];
                    match index {
                        Index::Element(i) if a.shape().is_vector_like() => arith::element(a, i)
                            .ok_or(EvalError::IndexOutOfBounds {
                                index: i,
                                shape: a.shape(),
                            }),
                        Index::Element(_) => Err(EvalError::Unsupported {
                            op: "index",
                            shape: a.shape(),
                        }),
                        Index::Range { start, end } => arith::range(a, start, end),
                        Index::Entry(i, j) => arith::entry(a, i, j),
                    }
                })
            }
            OpKind::Transpose => Arc::new(|args: &[&Value]| arith::transpose(args[0])),
        };
        Some(GenericOp::new(self.label().to_string(), eval))
    }

    /// Recompute `out` from the current cached values of `children`.
    ///
    /// Children are read, not refreshed.
    pub(crate) fn evaluate_into(&self, out: &mut Value, children: &[NodeRef]) -> EvalResult<()> {
        match self {
            OpKind::Constant | OpKind::Parameter(_) => Ok(()),
            OpKind::Add => kernels::add_into(out, &children[0].value(), &children[1].value(), 1.0),
            OpKind::Sub => kernels::add_into(out, &children[0].value(), &children[1].value(), -1.0),
            OpKind::Neg => kernels::scale_into(out, &children[0].value(), -1.0),
            OpKind::Scale => {
                let s = kernels::numeric_scalar("scale", &children[0].value())?;
                kernels::scale_into(out, &children[1].value(), s)
            }
            OpKind::Div => {
                let s = kernels::numeric_scalar("div", &children[1].value())?;
                kernels::scale_into(out, &children[0].value(), 1.0 / s)
            }
            OpKind::MatMul => kernels::matmul_into(out, &children[0].value(), &children[1].value()),
            OpKind::Dot => kernels::dot_into(out, &children[0].value(), &children[1].value()),
            OpKind::Bilinear => kernels::bilinear_into(
                out,
                &children[0].value(),
                &children[1].value(),
                &children[2].value(),
            ),
            OpKind::Concat => kernels::concat_into(out, children),
            OpKind::Index(index) => kernels::index_into(out, &children[0].value(), index),
            OpKind::Transpose => kernels::transpose_into(out, &children[0].value()),
            OpKind::Generic(op) => op.evaluate_into(out, children),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::value::Matrix;

    #[test]
    fn generic_equivalents_match_kernels() {
        let a = Value::Matrix(Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.0]]));
        let x = Value::Vector(vec![1.0, -1.0]);

        for kind in [OpKind::MatMul, OpKind::Dot, OpKind::Add] {
            let (lhs, rhs) = match kind {
                OpKind::MatMul => (a.clone(), x.clone()),
                _ => (x.clone(), x.clone()),
            };
            let generic = kind.to_generic().unwrap();
            let expected = generic.call(&[&lhs, &rhs]).unwrap();

            let node = Node::infer(kind, [Node::constant(lhs), Node::constant(rhs)]).unwrap();
            assert_eq!(*node.value(), expected, "{}", generic.name());
        }
    }

    #[test]
    fn leaves_have_no_generic_form() {
        assert!(OpKind::Constant.to_generic().is_none());
        assert_eq!(OpKind::Transpose.arity(), Some(1));
        assert_eq!(OpKind::Concat.arity(), None);
    }
}
