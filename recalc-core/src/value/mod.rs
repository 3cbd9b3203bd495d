//! Values
//!
//! Every node in an expression graph caches a [`Value`]. The set of value
//! kinds is closed: numeric scalars, vectors and matrices, plus the symbolic
//! affine and quadratic functions that appear once decision variables take
//! part in an expression.
//!
//! The [`Shape`] of a value is what the expression builder reasons about at
//! construction time. It is known statically from the initial value of each
//! parameter, so most shape errors surface before the first evaluation.

mod function;
mod matrix;
pub mod arith;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use function::{
    variables, AffineFunction, LinearTerm, QuadraticFunction, QuadraticTerm, Variable,
};
pub use matrix::Matrix;

/// A cached node value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
    Matrix(Matrix),
    Affine(AffineFunction),
    AffineVector(Vec<AffineFunction>),
    Quadratic(QuadraticFunction),
}

/// The static shape of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Scalar,
    Vector(usize),
    Matrix(usize, usize),
    Affine,
    AffineVector(usize),
    Quadratic,
}

impl Shape {
    /// Number of scalar slots for vector-like shapes, 1 for scalar-like.
    pub fn len(&self) -> usize {
        match *self {
            Shape::Scalar | Shape::Affine | Shape::Quadratic => 1,
            Shape::Vector(n) | Shape::AffineVector(n) => n,
            Shape::Matrix(r, c) => r * c,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scalar, affine or quadratic.
    pub fn is_scalar_like(&self) -> bool {
        matches!(self, Shape::Scalar | Shape::Affine | Shape::Quadratic)
    }

    /// Numeric or affine vector.
    pub fn is_vector_like(&self) -> bool {
        matches!(self, Shape::Vector(_) | Shape::AffineVector(_))
    }

    /// Whether values of this shape mention decision variables.
    pub fn is_symbolic(&self) -> bool {
        matches!(
            self,
            Shape::Affine | Shape::AffineVector(_) | Shape::Quadratic
        )
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Scalar => write!(f, "scalar"),
            Shape::Vector(n) => write!(f, "vector[{n}]"),
            Shape::Matrix(r, c) => write!(f, "matrix[{r}x{c}]"),
            Shape::Affine => write!(f, "affine"),
            Shape::AffineVector(n) => write!(f, "affine vector[{n}]"),
            Shape::Quadratic => write!(f, "quadratic"),
        }
    }
}

impl Value {
    /// A zero value of the given shape, with storage sized for it.
    pub fn zeros(shape: Shape) -> Self {
        match shape {
            Shape::Scalar => Value::Scalar(0.0),
            Shape::Vector(n) => Value::Vector(vec![0.0; n]),
            Shape::Matrix(r, c) => Value::Matrix(Matrix::zeros(r, c)),
            Shape::Affine => Value::Affine(AffineFunction::default()),
            Shape::AffineVector(n) => Value::AffineVector(vec![AffineFunction::default(); n]),
            Shape::Quadratic => Value::Quadratic(QuadraticFunction::default()),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Scalar(_) => Shape::Scalar,
            Value::Vector(v) => Shape::Vector(v.len()),
            Value::Matrix(m) => Shape::Matrix(m.rows(), m.cols()),
            Value::Affine(_) => Shape::Affine,
            Value::AffineVector(v) => Shape::AffineVector(v.len()),
            Value::Quadratic(_) => Shape::Quadratic,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&Matrix> {
        match self {
            Value::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_affine(&self) -> Option<&AffineFunction> {
        match self {
            Value::Affine(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_affine_vector(&self) -> Option<&[AffineFunction]> {
        match self {
            Value::AffineVector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_quadratic(&self) -> Option<&QuadraticFunction> {
        match self {
            Value::Quadratic(q) => Some(q),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Scalar(0.0)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(x)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

impl From<&[f64]> for Value {
    fn from(v: &[f64]) -> Self {
        Value::Vector(v.to_vec())
    }
}

impl From<Matrix> for Value {
    fn from(m: Matrix) -> Self {
        Value::Matrix(m)
    }
}

impl From<AffineFunction> for Value {
    fn from(f: AffineFunction) -> Self {
        Value::Affine(f)
    }
}

impl From<QuadraticFunction> for Value {
    fn from(q: QuadraticFunction) -> Self {
        Value::Quadratic(q)
    }
}

impl From<Variable> for Value {
    fn from(var: Variable) -> Self {
        Value::Affine(AffineFunction::from_variable(var))
    }
}

impl From<&[Variable]> for Value {
    fn from(vars: &[Variable]) -> Self {
        Value::AffineVector(vars.iter().map(|v| AffineFunction::from_variable(*v)).collect())
    }
}

/// A Rust type that a [`Value`] of a fixed kind can be viewed as.
///
/// Used by typed handles to project a node's cached value without copying.
pub trait ValueType: Send + Sync + 'static {
    /// Human-readable name for error messages.
    const NAME: &'static str;

    /// Whether values of `shape` project to this type.
    fn accepts(shape: Shape) -> bool;

    /// Borrow the value as this type.
    fn project(value: &Value) -> Option<&Self>;
}

impl ValueType for f64 {
    const NAME: &'static str = "f64";

    fn accepts(shape: Shape) -> bool {
        shape == Shape::Scalar
    }

    fn project(value: &Value) -> Option<&Self> {
        match value {
            Value::Scalar(x) => Some(x),
            _ => None,
        }
    }
}

impl ValueType for Vec<f64> {
    const NAME: &'static str = "Vec<f64>";

    fn accepts(shape: Shape) -> bool {
        matches!(shape, Shape::Vector(_))
    }

    fn project(value: &Value) -> Option<&Self> {
        match value {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl ValueType for Matrix {
    const NAME: &'static str = "Matrix";

    fn accepts(shape: Shape) -> bool {
        matches!(shape, Shape::Matrix(..))
    }

    fn project(value: &Value) -> Option<&Self> {
        match value {
            Value::Matrix(m) => Some(m),
            _ => None,
        }
    }
}

impl ValueType for AffineFunction {
    const NAME: &'static str = "AffineFunction";

    fn accepts(shape: Shape) -> bool {
        shape == Shape::Affine
    }

    fn project(value: &Value) -> Option<&Self> {
        match value {
            Value::Affine(f) => Some(f),
            _ => None,
        }
    }
}

impl ValueType for Vec<AffineFunction> {
    const NAME: &'static str = "Vec<AffineFunction>";

    fn accepts(shape: Shape) -> bool {
        matches!(shape, Shape::AffineVector(_))
    }

    fn project(value: &Value) -> Option<&Self> {
        match value {
            Value::AffineVector(v) => Some(v),
            _ => None,
        }
    }
}

impl ValueType for QuadraticFunction {
    const NAME: &'static str = "QuadraticFunction";

    fn accepts(shape: Shape) -> bool {
        shape == Shape::Quadratic
    }

    fn project(value: &Value) -> Option<&Self> {
        match value {
            Value::Quadratic(q) => Some(q),
            _ => None,
        }
    }
}

impl ValueType for Value {
    const NAME: &'static str = "Value";

    fn accepts(_shape: Shape) -> bool {
        true
    }

    fn project(value: &Value) -> Option<&Self> {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_has_requested_shape() {
        for shape in [
            Shape::Scalar,
            Shape::Vector(3),
            Shape::Matrix(2, 4),
            Shape::Affine,
            Shape::AffineVector(5),
            Shape::Quadratic,
        ] {
            assert_eq!(Value::zeros(shape).shape(), shape);
        }
    }

    #[test]
    fn projection_respects_kind() {
        let v = Value::Vector(vec![1.0, 2.0]);
        assert!(<Vec<f64>>::project(&v).is_some());
        assert!(f64::project(&v).is_none());
        assert!(<Vec<f64>>::accepts(v.shape()));
        assert!(!Matrix::accepts(v.shape()));
        assert!(Value::accepts(v.shape()));
    }

    #[test]
    fn variables_become_affine() {
        let xs = variables(3);
        let v = Value::from(xs.as_slice());
        assert_eq!(v.shape(), Shape::AffineVector(3));
        assert!(v.shape().is_symbolic());
    }

    #[test]
    fn shape_display() {
        assert_eq!(Shape::Matrix(2, 3).to_string(), "matrix[2x3]");
        assert_eq!(Shape::AffineVector(4).to_string(), "affine vector[4]");
    }
}
