//! Wrapped Expressions
//!
//! A [`WrappedExpression<T>`] hides the graph behind a fixed result type, so
//! a caller can keep expressions of unrelated structure in one collection,
//! e.g. a map from constraint id to its right-hand side.
//!
//! The result type is checked once, when the wrapper is created. Evaluation
//! then borrows the underlying cache directly, without copying.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::MappedRwLockReadGuard;

use super::{Cacheable, Parameter};
use crate::error::{BuildError, BuildResult, EvalError, EvalResult};
use crate::graph::{Expression, NodeRef};
use crate::value::{Value, ValueType};

/// Anything a wrapped expression can sit on.
trait ErasedSource<T: ?Sized>: Send + Sync {
    fn evaluate(&self) -> EvalResult<MappedRwLockReadGuard<'_, T>>;
    fn mark_dirty(&self);
    fn is_dirty(&self) -> bool;
}

struct NodeSource<T> {
    node: NodeRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ValueType> ErasedSource<T> for NodeSource<T> {
    fn evaluate(&self) -> EvalResult<MappedRwLockReadGuard<'_, T>> {
        let value = self.node.evaluate()?;
        MappedRwLockReadGuard::try_map(value, T::project).map_err(|value| EvalError::TypeMismatch {
            expected: T::NAME,
            found: value.shape(),
        })
    }

    fn mark_dirty(&self) {
        self.node.mark_dirty();
    }

    fn is_dirty(&self) -> bool {
        self.node.is_dirty()
    }
}

impl<T: Send + Sync + 'static> ErasedSource<T> for Parameter<T> {
    fn evaluate(&self) -> EvalResult<MappedRwLockReadGuard<'_, T>> {
        Cacheable::evaluate(self)
    }

    fn mark_dirty(&self) {
        Cacheable::mark_dirty(self);
    }

    fn is_dirty(&self) -> bool {
        Cacheable::is_dirty(self)
    }
}

/// A type-erased expression producing a `T`.
///
/// Cloning yields another handle to the same graph; marking either dirty is
/// seen by both.
pub struct WrappedExpression<T> {
    source: Arc<dyn ErasedSource<T>>,
}

impl<T: ValueType> WrappedExpression<T> {
    /// Wrap a compiled expression.
    ///
    /// Fails if the expression's result cannot be viewed as `T`.
    pub fn new(expression: &Expression) -> BuildResult<Self> {
        Self::from_node(expression.root().clone())
    }

    /// Wrap any node.
    pub fn from_node(node: NodeRef) -> BuildResult<Self> {
        let shape = node.shape();
        if !T::accepts(shape) {
            return Err(BuildError::TypeMismatch {
                expected: T::NAME,
                found: shape,
            });
        }
        Ok(Self {
            source: Arc::new(NodeSource::<T> {
                node,
                _marker: PhantomData,
            }),
        })
    }
}

impl<T: Send + Sync + 'static> WrappedExpression<T> {
    /// Wrap a parameter directly. Its type is already `T`.
    pub fn from_parameter(parameter: Parameter<T>) -> Self {
        Self {
            source: Arc::new(parameter),
        }
    }
}

impl<T> Cacheable for WrappedExpression<T> {
    type Output = T;

    fn evaluate(&self) -> EvalResult<MappedRwLockReadGuard<'_, T>> {
        self.source.evaluate()
    }

    fn mark_dirty(&self) {
        self.source.mark_dirty();
    }

    fn is_dirty(&self) -> bool {
        self.source.is_dirty()
    }
}

impl<T> Clone for WrappedExpression<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T> fmt::Debug for WrappedExpression<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedExpression")
            .field("dirty", &self.source.is_dirty())
            .finish()
    }
}

impl TryFrom<&Expression> for WrappedExpression<Value> {
    type Error = BuildError;

    fn try_from(expression: &Expression) -> BuildResult<Self> {
        Self::new(expression)
    }
}
