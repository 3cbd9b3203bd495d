//! Error types.
//!
//! Errors are split by phase. A [`BuildError`] means the expression itself is
//! wrong and has to be fixed at its source; an [`EvalError`] is raised when
//! concrete values seen during evaluation do not fit the operation. Neither is
//! retried by the engine.

use thiserror::Error;

use crate::value::Shape;

/// Errors raised while turning an expression into a node graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("shape mismatch in {op}: {lhs} and {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    #[error("{op} is not defined for {shape}")]
    Unsupported { op: &'static str, shape: Shape },

    #[error("index {index} out of bounds for {shape}")]
    IndexOutOfBounds { index: usize, shape: Shape },

    #[error("concatenation needs at least one operand")]
    EmptyConcat,

    #[error("conditional requires a scalar condition, found {0}")]
    NonScalarCondition(Shape),

    #[error("conditional branches have different types: {then} and {otherwise}")]
    IllTypedConditional { then: Shape, otherwise: Shape },

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("`{name}` expects {expected} argument(s), found {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("expression produces {found}, which cannot be viewed as {expected}")]
    TypeMismatch { expected: &'static str, found: Shape },

    #[error("unbound input `{0}`")]
    UnboundInput(String),

    #[error("reference to undefined value %{0}")]
    UndefinedRef(usize),

    #[error("invalid trace: {0}")]
    InvalidTrace(String),

    #[error("invalid build options: {0}")]
    InvalidOptions(String),

    #[error("evaluation failed during construction: {0}")]
    Evaluation(EvalError),
}

/// Errors raised by `evaluate()`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("shape mismatch in {op}: {lhs} and {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    #[error("{op} is not defined for {shape}")]
    Unsupported { op: &'static str, shape: Shape },

    #[error("index {index} out of bounds for {shape}")]
    IndexOutOfBounds { index: usize, shape: Shape },

    #[error("value {found} cannot be viewed as {expected}")]
    TypeMismatch { expected: &'static str, found: Shape },

    #[error("function `{name}` failed: {message}")]
    Function { name: String, message: String },

    #[error("{what} {id} is still borrowed by an earlier evaluation result")]
    Busy { what: &'static str, id: u64 },
}

impl From<EvalError> for BuildError {
    /// Shape inference runs evaluators on zero values; their failures are
    /// construction-time errors.
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::ShapeMismatch { op, lhs, rhs } => BuildError::ShapeMismatch { op, lhs, rhs },
            EvalError::Unsupported { op, shape } => BuildError::Unsupported { op, shape },
            EvalError::IndexOutOfBounds { index, shape } => {
                BuildError::IndexOutOfBounds { index, shape }
            }
            EvalError::TypeMismatch { expected, found } => {
                BuildError::TypeMismatch { expected, found }
            }
            other => BuildError::Evaluation(other),
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;
pub type EvalResult<T> = Result<T, EvalError>;
