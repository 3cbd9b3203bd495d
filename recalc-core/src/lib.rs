//! Recalc Core
//!
//! This crate provides lazy, cached expression graphs for models that are
//! rebuilt from the same structure over and over, such as the constraint
//! matrices of a receding-horizon controller. It implements:
//!
//! - Cacheable values with dirty flags, parameters and a parameter registry
//! - An expression builder that shares common sub-expressions and picks
//!   in-place evaluators for common operation shapes
//! - Affine and quadratic functions of decision variables as values
//! - Typed, type-erased handles over compiled expressions
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: Values, shapes, matrices and affine/quadratic functions
//! - `reactive`: Cacheable values, parameters and the registry
//! - `graph`: Compiled node graphs and their evaluators
//! - `expr`: Expression syntax, the builder and serialized traces
//!
//! # Example
//!
//! ```rust,ignore
//! use recalc_core::prelude::*;
//!
//! let registry = Registry::new();
//! let a = Parameter::matrix(2, 2, |m| m.set(0, 0, read_gain()));
//! let b = Parameter::vector(2, |v| v.fill(1.0));
//! registry.register(&a);
//! registry.register(&b);
//!
//! let x = variables(2);
//! let e = Expr::from(&a) * Expr::from(x.as_slice()) - Expr::from(&b);
//! let constraints = ExprBuilder::new().build(&e)?;
//!
//! loop {
//!     registry.mark_all_dirty();
//!     let rows = constraints.evaluate()?;   // recomputes what changed
//!     solve(&rows);
//! }
//! ```

pub mod error;
pub mod expr;
pub mod graph;
pub mod reactive;
pub mod value;

pub use error::{BuildError, BuildResult, EvalError, EvalResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::error::{BuildError, EvalError};
    pub use crate::expr::{
        bracket, call, conditional, dot, vcat, BuildOptions, ConcatPolicy, Expr, ExprBuilder,
        Function,
    };
    pub use crate::graph::Expression;
    pub use crate::reactive::{Cacheable, Parameter, Registry, WrappedExpression};
    pub use crate::value::{
        variables, AffineFunction, Matrix, QuadraticFunction, Shape, Value, Variable,
    };
}
