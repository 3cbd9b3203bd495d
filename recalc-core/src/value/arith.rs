//! Allocating arithmetic on [`Value`]s.
//!
//! These functions back the generic evaluator: they accept every combination
//! of value kinds the engine understands and return a freshly allocated
//! result. The specialized kernels in `graph::kernels` compute the same
//! results in place for the common shapes.
//!
//! The builder also runs them on zero values to infer the result shape of a
//! generic node, so any combination rejected here is rejected at
//! construction time.

use crate::error::{EvalError, EvalResult};

use super::{AffineFunction, Matrix, QuadraticFunction, QuadraticTerm, Shape, Value};

fn mismatch(op: &'static str, a: &Value, b: &Value) -> EvalError {
    EvalError::ShapeMismatch {
        op,
        lhs: a.shape(),
        rhs: b.shape(),
    }
}

/// Scalar-like value as an affine function, if it has no quadratic part.
fn to_affine(value: &Value) -> Option<AffineFunction> {
    match value {
        Value::Scalar(x) => Some(AffineFunction::constant(*x)),
        Value::Affine(f) => Some(f.clone()),
        _ => None,
    }
}

fn to_quadratic(value: &Value) -> Option<QuadraticFunction> {
    match value {
        Value::Quadratic(q) => Some(q.clone()),
        other => to_affine(other).map(QuadraticFunction::from),
    }
}

/// Element `i` of a vector-like value.
pub fn element(value: &Value, i: usize) -> Option<Value> {
    match value {
        Value::Vector(v) => v.get(i).map(|x| Value::Scalar(*x)),
        Value::AffineVector(v) => v.get(i).map(|f| Value::Affine(f.clone())),
        _ => None,
    }
}

fn affine_sum(mut lhs: AffineFunction, rhs: &AffineFunction, sign: f64) -> AffineFunction {
    lhs.linear
        .extend(rhs.linear.iter().map(|t| t.scaled(sign)));
    lhs.constant += sign * rhs.constant;
    lhs
}

fn combine(a: &Value, b: &Value, sign: f64, op: &'static str) -> EvalResult<Value> {
    match (a, b) {
        (Value::Scalar(x), Value::Scalar(y)) => return Ok(Value::Scalar(x + sign * y)),
        (Value::Vector(x), Value::Vector(y)) if x.len() == y.len() => {
            return Ok(Value::Vector(
                x.iter().zip(y).map(|(x, y)| x + sign * y).collect(),
            ));
        }
        (Value::Matrix(x), Value::Matrix(y))
            if x.rows() == y.rows() && x.cols() == y.cols() =>
        {
            let data = x
                .as_slice()
                .iter()
                .zip(y.as_slice())
                .map(|(x, y)| x + sign * y)
                .collect();
            return Ok(Value::Matrix(Matrix::from_row_major(x.rows(), x.cols(), data)));
        }
        _ => {}
    }

    let (sa, sb) = (a.shape(), b.shape());
    if sa.is_scalar_like() && sb.is_scalar_like() {
        if sa == Shape::Quadratic || sb == Shape::Quadratic {
            let mut lhs = to_quadratic(a).ok_or_else(|| mismatch(op, a, b))?;
            let rhs = to_quadratic(b).ok_or_else(|| mismatch(op, a, b))?;
            lhs.quadratic
                .extend(rhs.quadratic.iter().map(|t| t.scaled(sign)));
            lhs.affine = affine_sum(lhs.affine, &rhs.affine, sign);
            return Ok(Value::Quadratic(lhs));
        }
        let lhs = to_affine(a).ok_or_else(|| mismatch(op, a, b))?;
        let rhs = to_affine(b).ok_or_else(|| mismatch(op, a, b))?;
        return Ok(Value::Affine(affine_sum(lhs, &rhs, sign)));
    }

    if sa.is_vector_like() && sb.is_vector_like() && sa.len() == sb.len() {
        let mut out = Vec::with_capacity(sa.len());
        for i in 0..sa.len() {
            let x = element(a, i).and_then(|v| to_affine(&v));
            let y = element(b, i).and_then(|v| to_affine(&v));
            match (x, y) {
                (Some(x), Some(y)) => out.push(affine_sum(x, &y, sign)),
                _ => return Err(mismatch(op, a, b)),
            }
        }
        return Ok(Value::AffineVector(out));
    }

    Err(mismatch(op, a, b))
}

/// `a + b`
pub fn add(a: &Value, b: &Value) -> EvalResult<Value> {
    combine(a, b, 1.0, "add")
}

/// `a - b`
pub fn sub(a: &Value, b: &Value) -> EvalResult<Value> {
    combine(a, b, -1.0, "sub")
}

/// `s * value` for a numeric scalar `s`.
pub fn scale(value: &Value, s: f64) -> Value {
    match value {
        Value::Scalar(x) => Value::Scalar(s * x),
        Value::Vector(v) => Value::Vector(v.iter().map(|x| s * x).collect()),
        Value::Matrix(m) => {
            let data = m.as_slice().iter().map(|x| s * x).collect();
            Value::Matrix(Matrix::from_row_major(m.rows(), m.cols(), data))
        }
        Value::Affine(f) => {
            let mut f = f.clone();
            f.scale_in_place(s);
            Value::Affine(f)
        }
        Value::AffineVector(v) => Value::AffineVector(
            v.iter()
                .map(|f| {
                    let mut f = f.clone();
                    f.scale_in_place(s);
                    f
                })
                .collect(),
        ),
        Value::Quadratic(q) => {
            let mut q = q.clone();
            q.scale_in_place(s);
            Value::Quadratic(q)
        }
    }
}

/// `-a`
pub fn neg(a: &Value) -> EvalResult<Value> {
    Ok(scale(a, -1.0))
}

fn affine_product(x: &AffineFunction, y: &AffineFunction) -> QuadraticFunction {
    let mut quadratic = Vec::with_capacity(x.linear.len() * y.linear.len());
    for tx in &x.linear {
        for ty in &y.linear {
            quadratic.push(QuadraticTerm::new(tx.coeff * ty.coeff, tx.var, ty.var));
        }
    }
    let mut affine = AffineFunction::constant(x.constant * y.constant);
    affine
        .linear
        .extend(x.linear.iter().map(|t| t.scaled(y.constant)));
    affine
        .linear
        .extend(y.linear.iter().map(|t| t.scaled(x.constant)));
    QuadraticFunction::new(quadratic, affine)
}

fn scalar_product(a: &Value, b: &Value) -> EvalResult<Value> {
    match (a, b) {
        (Value::Scalar(s), other) | (other, Value::Scalar(s)) => Ok(scale(other, *s)),
        (Value::Affine(x), Value::Affine(y)) => Ok(Value::Quadratic(affine_product(x, y))),
        _ => Err(mismatch("mul", a, b)),
    }
}

/// `a * b`: scalar scaling, matrix products, and products of affine functions.
pub fn mul(a: &Value, b: &Value) -> EvalResult<Value> {
    match (a, b) {
        (Value::Scalar(_), _) | (_, Value::Scalar(_)) => scalar_product(a, b),
        (Value::Matrix(m), Value::Vector(x)) if m.cols() == x.len() => Ok(Value::Vector(
            (0..m.rows())
                .map(|i| m.row(i).iter().zip(x).map(|(a, b)| a * b).sum())
                .collect(),
        )),
        (Value::Matrix(m), Value::Matrix(n)) if m.cols() == n.rows() => {
            let mut out = Matrix::zeros(m.rows(), n.cols());
            for i in 0..m.rows() {
                for k in 0..m.cols() {
                    let aik = m.get(i, k);
                    for j in 0..n.cols() {
                        out.set(i, j, out.get(i, j) + aik * n.get(k, j));
                    }
                }
            }
            Ok(Value::Matrix(out))
        }
        (Value::Matrix(m), Value::AffineVector(x)) if m.cols() == x.len() => {
            let mut out = Vec::with_capacity(m.rows());
            for i in 0..m.rows() {
                let mut f = AffineFunction::default();
                for (a, xj) in m.row(i).iter().zip(x) {
                    f.linear.extend(xj.linear.iter().map(|t| t.scaled(*a)));
                    f.constant += a * xj.constant;
                }
                out.push(f);
            }
            Ok(Value::AffineVector(out))
        }
        (Value::Affine(f), Value::Vector(v)) | (Value::Vector(v), Value::Affine(f)) => {
            Ok(Value::AffineVector(
                v.iter()
                    .map(|x| {
                        let mut g = f.clone();
                        g.scale_in_place(*x);
                        g
                    })
                    .collect(),
            ))
        }
        (Value::Affine(_), Value::Affine(_)) => scalar_product(a, b),
        _ => Err(mismatch("mul", a, b)),
    }
}

/// `a / b` for a numeric scalar `b`.
pub fn div(a: &Value, b: &Value) -> EvalResult<Value> {
    match b {
        Value::Scalar(s) => Ok(scale(a, 1.0 / s)),
        other => Err(EvalError::Unsupported {
            op: "div",
            shape: other.shape(),
        }),
    }
}

/// Inner product of two equal-length vector-like values.
pub fn dot(a: &Value, b: &Value) -> EvalResult<Value> {
    if let (Value::Vector(x), Value::Vector(y)) = (a, b) {
        if x.len() == y.len() {
            return Ok(Value::Scalar(x.iter().zip(y).map(|(x, y)| x * y).sum()));
        }
    }
    let (sa, sb) = (a.shape(), b.shape());
    if !(sa.is_vector_like() && sb.is_vector_like() && sa.len() == sb.len()) {
        return Err(mismatch("dot", a, b));
    }
    let mut acc = Value::Scalar(0.0);
    for i in 0..sa.len() {
        let (x, y) = match (element(a, i), element(b, i)) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(mismatch("dot", a, b)),
        };
        acc = add(&acc, &scalar_product(&x, &y)?)?;
    }
    Ok(acc)
}

/// Transpose; vectors become `1 x n` matrices.
pub fn transpose(a: &Value) -> EvalResult<Value> {
    match a {
        Value::Scalar(x) => Ok(Value::Scalar(*x)),
        Value::Vector(v) => Ok(Value::Matrix(Matrix::from_row_major(1, v.len(), v.clone()))),
        Value::Matrix(m) => Ok(Value::Matrix(m.transpose())),
        other => Err(EvalError::Unsupported {
            op: "transpose",
            shape: other.shape(),
        }),
    }
}

/// Vertical concatenation; matrices are flattened row-major.
pub fn concat(parts: &[&Value]) -> EvalResult<Value> {
    let symbolic = parts.iter().any(|p| p.shape().is_symbolic());
    if !symbolic {
        let mut out = Vec::new();
        for part in parts {
            match part {
                Value::Scalar(x) => out.push(*x),
                Value::Vector(v) => out.extend_from_slice(v),
                Value::Matrix(m) => out.extend_from_slice(m.as_slice()),
                _ => unreachable!("non-symbolic values are numeric"),
            }
        }
        return Ok(Value::Vector(out));
    }

    let mut out = Vec::new();
    for part in parts {
        match part {
            Value::Scalar(x) => out.push(AffineFunction::constant(*x)),
            Value::Vector(v) => out.extend(v.iter().map(|x| AffineFunction::constant(*x))),
            Value::Matrix(m) => out.extend(
                m.as_slice()
                    .iter()
                    .map(|x| AffineFunction::constant(*x)),
            ),
            Value::Affine(f) => out.push(f.clone()),
            Value::AffineVector(v) => out.extend(v.iter().cloned()),
            Value::Quadratic(_) => {
                return Err(EvalError::Unsupported {
                    op: "concat",
                    shape: Shape::Quadratic,
                })
            }
        }
    }
    Ok(Value::AffineVector(out))
}

/// Elements `start..end` of a vector-like value.
pub fn range(a: &Value, start: usize, end: usize) -> EvalResult<Value> {
    let len = a.shape().len();
    if start > end || end > len {
        return Err(EvalError::IndexOutOfBounds {
            index: end,
            shape: a.shape(),
        });
    }
    match a {
        Value::Vector(v) => Ok(Value::Vector(v[start..end].to_vec())),
        Value::AffineVector(v) => Ok(Value::AffineVector(v[start..end].to_vec())),
        other => Err(EvalError::Unsupported {
            op: "index",
            shape: other.shape(),
        }),
    }
}

/// Entry `(i, j)` of a matrix.
pub fn entry(a: &Value, i: usize, j: usize) -> EvalResult<Value> {
    match a {
        Value::Matrix(m) if i < m.rows() && j < m.cols() => Ok(Value::Scalar(m.get(i, j))),
        Value::Matrix(m) => Err(EvalError::IndexOutOfBounds {
            index: i * m.cols() + j,
            shape: a.shape(),
        }),
        other => Err(EvalError::Unsupported {
            op: "index",
            shape: other.shape(),
        }),
    }
}

/// `then` if `condition` is non-zero, `otherwise` if it is zero.
pub fn select(condition: &Value, then: &Value, otherwise: &Value) -> EvalResult<Value> {
    match condition {
        Value::Scalar(c) if *c != 0.0 => Ok(then.clone()),
        Value::Scalar(_) => Ok(otherwise.clone()),
        other => Err(EvalError::Unsupported {
            op: "select",
            shape: other.shape(),
        }),
    }
}

/// Sum of all elements.
pub fn sum(a: &Value) -> EvalResult<Value> {
    match a {
        Value::Scalar(_) | Value::Affine(_) | Value::Quadratic(_) => Ok(a.clone()),
        Value::Vector(v) => Ok(Value::Scalar(v.iter().sum())),
        Value::Matrix(m) => Ok(Value::Scalar(m.as_slice().iter().sum())),
        Value::AffineVector(v) => Ok(Value::Affine(
            v.iter()
                .fold(AffineFunction::default(), |acc, f| affine_sum(acc, f, 1.0)),
        )),
    }
}

/// Apply `f` to every element of a numeric value.
pub fn map_numeric(a: &Value, name: &'static str, f: fn(f64) -> f64) -> EvalResult<Value> {
    match a {
        Value::Scalar(x) => Ok(Value::Scalar(f(*x))),
        Value::Vector(v) => Ok(Value::Vector(v.iter().map(|x| f(*x)).collect())),
        Value::Matrix(m) => {
            let data = m.as_slice().iter().map(|x| f(*x)).collect();
            Ok(Value::Matrix(Matrix::from_row_major(m.rows(), m.cols(), data)))
        }
        other => Err(EvalError::Unsupported {
            op: name,
            shape: other.shape(),
        }),
    }
}
