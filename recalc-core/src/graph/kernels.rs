//! In-place Kernels
//!
//! Each kernel recomputes a node's cached [`Value`] from its inputs, writing
//! into the storage that is already there. The first call sizes the cache;
//! afterwards a kernel only allocates if an input changed length.
//!
//! # Symbolic Results
//!
//! Affine and quadratic outputs are rebuilt term by term into buffers that
//! are cleared, not dropped. A kernel always emits the same terms in the same
//! order for inputs of the same shape, including terms whose coefficient is
//! currently zero, so the term buffers reach their final size once.

use crate::error::{EvalError, EvalResult};
use crate::value::{AffineFunction, Matrix, QuadraticFunction, QuadraticTerm, Value};

use super::node::NodeRef;
use super::op::Index;

// ----------------------------------------------------------------------------
// Output slots
// ----------------------------------------------------------------------------

fn scalar_slot(out: &mut Value) -> &mut f64 {
    if !matches!(out, Value::Scalar(_)) {
        *out = Value::Scalar(0.0);
    }
    match out {
        Value::Scalar(x) => x,
        _ => unreachable!("slot was just set to a scalar"),
    }
}

fn vector_slot(out: &mut Value, len: usize) -> &mut Vec<f64> {
    if !matches!(out, Value::Vector(_)) {
        *out = Value::Vector(Vec::with_capacity(len));
    }
    match out {
        Value::Vector(v) => {
            v.resize(len, 0.0);
            v
        }
        _ => unreachable!("slot was just set to a vector"),
    }
}

fn matrix_slot(out: &mut Value, rows: usize, cols: usize) -> &mut Matrix {
    if !matches!(out, Value::Matrix(_)) {
        *out = Value::Matrix(Matrix::zeros(rows, cols));
    }
    match out {
        Value::Matrix(m) => {
            if m.rows() != rows || m.cols() != cols {
                m.reshape_zeroed(rows, cols);
            }
            m
        }
        _ => unreachable!("slot was just set to a matrix"),
    }
}

/// Cleared affine slot.
fn affine_slot(out: &mut Value) -> &mut AffineFunction {
    if !matches!(out, Value::Affine(_)) {
        *out = Value::Affine(AffineFunction::default());
    }
    match out {
        Value::Affine(f) => {
            f.clear();
            f
        }
        _ => unreachable!("slot was just set to an affine function"),
    }
}

/// Affine vector slot of `len` cleared functions.
fn affine_vector_slot(out: &mut Value, len: usize) -> &mut Vec<AffineFunction> {
    if !matches!(out, Value::AffineVector(_)) {
        *out = Value::AffineVector(Vec::with_capacity(len));
    }
    match out {
        Value::AffineVector(v) => {
            v.resize_with(len, AffineFunction::default);
            for f in v.iter_mut() {
                f.clear();
            }
            v
        }
        _ => unreachable!("slot was just set to an affine vector"),
    }
}

/// Cleared quadratic slot.
fn quadratic_slot(out: &mut Value) -> &mut QuadraticFunction {
    if !matches!(out, Value::Quadratic(_)) {
        *out = Value::Quadratic(QuadraticFunction::default());
    }
    match out {
        Value::Quadratic(q) => {
            q.quadratic.clear();
            q.affine.clear();
            q
        }
        _ => unreachable!("slot was just set to a quadratic function"),
    }
}

// ----------------------------------------------------------------------------
// Input views
// ----------------------------------------------------------------------------

/// A scalar-like input without a quadratic part.
#[derive(Clone, Copy)]
enum Term<'a> {
    Number(f64),
    Affine(&'a AffineFunction),
}

impl<'a> Term<'a> {
    fn of(value: &'a Value) -> Option<Self> {
        match value {
            Value::Scalar(x) => Some(Term::Number(*x)),
            Value::Affine(f) => Some(Term::Affine(f)),
            _ => None,
        }
    }
}

/// A vector-like input.
#[derive(Clone, Copy)]
enum Elements<'a> {
    Numbers(&'a [f64]),
    Affine(&'a [AffineFunction]),
}

impl<'a> Elements<'a> {
    fn of(value: &'a Value) -> Option<Self> {
        match value {
            Value::Vector(v) => Some(Elements::Numbers(v)),
            Value::AffineVector(v) => Some(Elements::Affine(v)),
            _ => None,
        }
    }

    fn len(&self) -> usize {
        match self {
            Elements::Numbers(v) => v.len(),
            Elements::Affine(v) => v.len(),
        }
    }

    fn get(&self, i: usize) -> Term<'a> {
        match *self {
            Elements::Numbers(v) => Term::Number(v[i]),
            Elements::Affine(v) => Term::Affine(&v[i]),
        }
    }
}

/// `f += factor * term`
fn accumulate(f: &mut AffineFunction, term: Term<'_>, factor: f64) {
    match term {
        Term::Number(x) => f.constant += factor * x,
        Term::Affine(g) => {
            f.linear.extend(g.linear.iter().map(|t| t.scaled(factor)));
            f.constant += factor * g.constant;
        }
    }
}

/// `q += factor * x * y`
fn accumulate_product(q: &mut QuadraticFunction, x: Term<'_>, y: Term<'_>, factor: f64) {
    match (x, y) {
        (Term::Number(a), Term::Number(b)) => q.affine.constant += factor * a * b,
        (Term::Number(a), term) | (term, Term::Number(a)) => {
            accumulate(&mut q.affine, term, factor * a)
        }
        (Term::Affine(f), Term::Affine(g)) => {
            for tf in &f.linear {
                for tg in &g.linear {
                    q.quadratic.push(QuadraticTerm::new(
                        factor * tf.coeff * tg.coeff,
                        tf.var,
                        tg.var,
                    ));
                }
            }
            accumulate(&mut q.affine, Term::Affine(f), factor * g.constant);
            q.affine
                .linear
                .extend(g.linear.iter().map(|t| t.scaled(factor * f.constant)));
        }
    }
}

/// `q += factor * value` for a scalar-like value. Other values are ignored.
fn accumulate_quadratic(q: &mut QuadraticFunction, value: &Value, factor: f64) {
    if let Value::Quadratic(p) = value {
        q.quadratic
            .extend(p.quadratic.iter().map(|t| t.scaled(factor)));
        accumulate(&mut q.affine, Term::Affine(&p.affine), factor);
    } else if let Some(term) = Term::of(value) {
        accumulate(&mut q.affine, term, factor);
    }
}

fn mismatch(op: &'static str, a: &Value, b: &Value) -> EvalError {
    EvalError::ShapeMismatch {
        op,
        lhs: a.shape(),
        rhs: b.shape(),
    }
}

/// The value of a numeric scalar operand.
pub(crate) fn numeric_scalar(op: &'static str, value: &Value) -> EvalResult<f64> {
    value.as_scalar().ok_or(EvalError::Unsupported {
        op,
        shape: value.shape(),
    })
}

// ----------------------------------------------------------------------------
// Kernels
// ----------------------------------------------------------------------------

/// `out = a + sign * b`
pub(crate) fn add_into(out: &mut Value, a: &Value, b: &Value, sign: f64) -> EvalResult<()> {
    let op = if sign < 0.0 { "sub" } else { "add" };
    match (a, b) {
        (Value::Scalar(x), Value::Scalar(y)) => {
            *scalar_slot(out) = x + sign * y;
            return Ok(());
        }
        (Value::Vector(x), Value::Vector(y)) if x.len() == y.len() => {
            let slot = vector_slot(out, x.len());
            for ((o, x), y) in slot.iter_mut().zip(x).zip(y) {
                *o = x + sign * y;
            }
            return Ok(());
        }
        (Value::Matrix(x), Value::Matrix(y)) if x.rows() == y.rows() && x.cols() == y.cols() => {
            let slot = matrix_slot(out, x.rows(), x.cols());
            let pairs = x.as_slice().iter().zip(y.as_slice());
            for (o, (x, y)) in slot.as_mut_slice().iter_mut().zip(pairs) {
                *o = x + sign * y;
            }
            return Ok(());
        }
        _ => {}
    }

    let (sa, sb) = (a.shape(), b.shape());
    if sa.is_scalar_like() && sb.is_scalar_like() {
        if let (Some(x), Some(y)) = (Term::of(a), Term::of(b)) {
            let f = affine_slot(out);
            accumulate(f, x, 1.0);
            accumulate(f, y, sign);
            return Ok(());
        }
        let q = quadratic_slot(out);
        accumulate_quadratic(q, a, 1.0);
        accumulate_quadratic(q, b, sign);
        return Ok(());
    }

    if let (Some(x), Some(y)) = (Elements::of(a), Elements::of(b)) {
        if x.len() == y.len() {
            let slot = affine_vector_slot(out, x.len());
            for (i, f) in slot.iter_mut().enumerate() {
                accumulate(f, x.get(i), 1.0);
                accumulate(f, y.get(i), sign);
            }
            return Ok(());
        }
    }

    Err(mismatch(op, a, b))
}

/// `out = s * a`
pub(crate) fn scale_into(out: &mut Value, a: &Value, s: f64) -> EvalResult<()> {
    match a {
        Value::Scalar(x) => *scalar_slot(out) = s * x,
        Value::Vector(v) => {
            let slot = vector_slot(out, v.len());
            for (o, x) in slot.iter_mut().zip(v) {
                *o = s * x;
            }
        }
        Value::Matrix(m) => {
            let slot = matrix_slot(out, m.rows(), m.cols());
            for (o, x) in slot.as_mut_slice().iter_mut().zip(m.as_slice()) {
                *o = s * x;
            }
        }
        Value::Affine(f) => accumulate(affine_slot(out), Term::Affine(f), s),
        Value::AffineVector(v) => {
            let slot = affine_vector_slot(out, v.len());
            for (o, f) in slot.iter_mut().zip(v) {
                accumulate(o, Term::Affine(f), s);
            }
        }
        Value::Quadratic(_) => accumulate_quadratic(quadratic_slot(out), a, s),
    }
    Ok(())
}

/// Matrix times vector, matrix, or affine vector.
pub(crate) fn matmul_into(out: &mut Value, a: &Value, b: &Value) -> EvalResult<()> {
    let m = match a {
        Value::Matrix(m) => m,
        _ => return Err(mismatch("matmul", a, b)),
    };
    match b {
        Value::Vector(x) if m.cols() == x.len() => {
            let slot = vector_slot(out, m.rows());
            for (i, o) in slot.iter_mut().enumerate() {
                *o = m.row(i).iter().zip(x).map(|(a, x)| a * x).sum();
            }
        }
        Value::Matrix(n) if m.cols() == n.rows() => {
            let slot = matrix_slot(out, m.rows(), n.cols());
            slot.as_mut_slice().fill(0.0);
            for i in 0..m.rows() {
                for k in 0..m.cols() {
                    let aik = m.get(i, k);
                    for j in 0..n.cols() {
                        slot.set(i, j, slot.get(i, j) + aik * n.get(k, j));
                    }
                }
            }
        }
        Value::AffineVector(x) if m.cols() == x.len() => {
            let slot = affine_vector_slot(out, m.rows());
            for (i, f) in slot.iter_mut().enumerate() {
                for (a, xj) in m.row(i).iter().zip(x) {
                    accumulate(f, Term::Affine(xj), *a);
                }
            }
        }
        _ => return Err(mismatch("matmul", a, b)),
    }
    Ok(())
}

/// Inner product of two equal-length vector-like values.
pub(crate) fn dot_into(out: &mut Value, a: &Value, b: &Value) -> EvalResult<()> {
    let (x, y) = match (Elements::of(a), Elements::of(b)) {
        (Some(x), Some(y)) if x.len() == y.len() => (x, y),
        _ => return Err(mismatch("dot", a, b)),
    };
    match (x, y) {
        (Elements::Numbers(x), Elements::Numbers(y)) => {
            *scalar_slot(out) = x.iter().zip(y).map(|(x, y)| x * y).sum();
        }
        (Elements::Numbers(c), Elements::Affine(f)) | (Elements::Affine(f), Elements::Numbers(c)) => {
            let slot = affine_slot(out);
            for (c, f) in c.iter().zip(f) {
                accumulate(slot, Term::Affine(f), *c);
            }
        }
        (Elements::Affine(_), Elements::Affine(_)) => {
            let q = quadratic_slot(out);
            for i in 0..x.len() {
                accumulate_product(q, x.get(i), y.get(i), 1.0);
            }
        }
    }
    Ok(())
}

/// `x' * A * y` without materializing `A * y`.
pub(crate) fn bilinear_into(out: &mut Value, x: &Value, a: &Value, y: &Value) -> EvalResult<()> {
    let m = match a {
        Value::Matrix(m) => m,
        _ => return Err(mismatch("bilinear", x, a)),
    };
    let (ex, ey) = match (Elements::of(x), Elements::of(y)) {
        (Some(ex), Some(ey)) => (ex, ey),
        (None, _) => return Err(mismatch("bilinear", x, a)),
        (_, None) => return Err(mismatch("bilinear", a, y)),
    };
    if ex.len() != m.rows() {
        return Err(mismatch("bilinear", x, a));
    }
    if m.cols() != ey.len() {
        return Err(mismatch("bilinear", a, y));
    }

    match (ex, ey) {
        (Elements::Numbers(x), Elements::Numbers(y)) => {
            *scalar_slot(out) = x
                .iter()
                .enumerate()
                .map(|(i, xi)| xi * m.row(i).iter().zip(y).map(|(a, y)| a * y).sum::<f64>())
                .sum();
        }
        (Elements::Numbers(x), Elements::Affine(y)) => {
            let f = affine_slot(out);
            for (j, yj) in y.iter().enumerate() {
                let c: f64 = x.iter().enumerate().map(|(i, xi)| xi * m.get(i, j)).sum();
                accumulate(f, Term::Affine(yj), c);
            }
        }
        (Elements::Affine(x), Elements::Numbers(y)) => {
            let f = affine_slot(out);
            for (i, xi) in x.iter().enumerate() {
                let c: f64 = m.row(i).iter().zip(y).map(|(a, y)| a * y).sum();
                accumulate(f, Term::Affine(xi), c);
            }
        }
        (Elements::Affine(_), Elements::Affine(_)) => {
            let q = quadratic_slot(out);
            for i in 0..m.rows() {
                for j in 0..m.cols() {
                    accumulate_product(q, ex.get(i), ey.get(j), m.get(i, j));
                }
            }
        }
    }
    Ok(())
}

/// Vertical concatenation of scalars and vectors, read straight from the
/// child caches.
pub(crate) fn concat_into(out: &mut Value, children: &[NodeRef]) -> EvalResult<()> {
    let mut len = 0;
    let mut symbolic = false;
    for child in children {
        let value = child.value();
        match &*value {
            Value::Scalar(_) | Value::Affine(_) => len += 1,
            Value::Vector(v) => len += v.len(),
            Value::AffineVector(v) => len += v.len(),
            other => {
                return Err(EvalError::Unsupported {
                    op: "concat",
                    shape: other.shape(),
                })
            }
        }
        symbolic |= value.shape().is_symbolic();
    }

    if !symbolic {
        let slot = vector_slot(out, len);
        let mut offset = 0;
        for child in children {
            match &*child.value() {
                Value::Scalar(x) => {
                    slot[offset] = *x;
                    offset += 1;
                }
                Value::Vector(v) => {
                    slot[offset..offset + v.len()].copy_from_slice(v);
                    offset += v.len();
                }
                _ => unreachable!("operands were checked above"),
            }
        }
        return Ok(());
    }

    let slot = affine_vector_slot(out, len);
    let mut offset = 0;
    for child in children {
        let value = child.value();
        match Elements::of(&value) {
            Some(elements) => {
                for i in 0..elements.len() {
                    accumulate(&mut slot[offset + i], elements.get(i), 1.0);
                }
                offset += elements.len();
            }
            None => {
                if let Some(term) = Term::of(&value) {
                    accumulate(&mut slot[offset], term, 1.0);
                }
                offset += 1;
            }
        }
    }
    Ok(())
}

/// Copy the selected element, range or entry into the cache.
pub(crate) fn index_into(out: &mut Value, a: &Value, index: &Index) -> EvalResult<()> {
    let out_of_bounds = |index| EvalError::IndexOutOfBounds {
        index,
        shape: a.shape(),
    };
    match (index, a) {
        (Index::Element(i), Value::Vector(v)) => {
            *scalar_slot(out) = *v.get(*i).ok_or_else(|| out_of_bounds(*i))?;
        }
        (Index::Element(i), Value::AffineVector(v)) => {
            let f = v.get(*i).ok_or_else(|| out_of_bounds(*i))?;
            affine_slot(out).assign(f);
        }
        (Index::Range { start, end }, value) if Elements::of(value).is_some() => {
            let len = value.shape().len();
            if start > end || *end > len {
                return Err(out_of_bounds(*end));
            }
            match value {
                Value::Vector(v) => vector_slot(out, end - start).copy_from_slice(&v[*start..*end]),
                Value::AffineVector(v) => {
                    let slot = affine_vector_slot(out, end - start);
                    for (o, f) in slot.iter_mut().zip(&v[*start..*end]) {
                        o.assign(f);
                    }
                }
                _ => unreachable!("vector-like operand"),
            }
        }
        (Index::Entry(i, j), Value::Matrix(m)) => {
            if *i >= m.rows() || *j >= m.cols() {
                return Err(out_of_bounds(i * m.cols() + j));
            }
            *scalar_slot(out) = m.get(*i, *j);
        }
        (_, other) => {
            return Err(EvalError::Unsupported {
                op: "index",
                shape: other.shape(),
            })
        }
    }
    Ok(())
}

/// Transpose into the cache; vectors become `1 x n` matrices.
pub(crate) fn transpose_into(out: &mut Value, a: &Value) -> EvalResult<()> {
    match a {
        Value::Scalar(x) => *scalar_slot(out) = *x,
        Value::Vector(v) => {
            matrix_slot(out, 1, v.len())
                .as_mut_slice()
                .copy_from_slice(v);
        }
        Value::Matrix(m) => {
            let slot = matrix_slot(out, m.cols(), m.rows());
            for i in 0..m.rows() {
                for j in 0..m.cols() {
                    slot.set(j, i, m.get(i, j));
                }
            }
        }
        other => {
            return Err(EvalError::Unsupported {
                op: "transpose",
                shape: other.shape(),
            })
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{arith, variables, LinearTerm, Shape};

    #[test]
    fn add_reuses_vector_storage() {
        let a = Value::Vector(vec![1.0, 2.0, 3.0]);
        let b = Value::Vector(vec![10.0, 20.0, 30.0]);
        let mut out = Value::zeros(Shape::Vector(3));
        let ptr = out.as_vector().unwrap().as_ptr();

        add_into(&mut out, &a, &b, -1.0).unwrap();
        assert_eq!(out, Value::Vector(vec![-9.0, -18.0, -27.0]));
        assert_eq!(out.as_vector().unwrap().as_ptr(), ptr);
    }

    #[test]
    fn add_rejects_mismatched_lengths() {
        let mut out = Value::default();
        let err = add_into(
            &mut out,
            &Value::Vector(vec![1.0]),
            &Value::Vector(vec![1.0, 2.0]),
            1.0,
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::ShapeMismatch { op: "add", .. }));
    }

    #[test]
    fn matmul_matches_generic_product() {
        let m = Value::Matrix(Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]));
        let x = Value::Vector(vec![1.0, -1.0]);
        let mut out = Value::default();
        matmul_into(&mut out, &m, &x).unwrap();
        assert_eq!(out, arith::mul(&m, &x).unwrap());

        let n = Value::Matrix(Matrix::from_rows(&[[1.0, 0.0, 2.0], [0.0, 1.0, 0.0]]));
        matmul_into(&mut out, &m, &n).unwrap();
        assert_eq!(out, arith::mul(&m, &n).unwrap());
    }

    #[test]
    fn symbolic_matmul_keeps_zero_terms() {
        let xs = variables(2);
        let m = Value::Matrix(Matrix::from_rows(&[[1.0, 0.0], [0.0, 2.0]]));
        let x = Value::from(xs.as_slice());
        let mut out = Value::default();
        matmul_into(&mut out, &m, &x).unwrap();

        let rows = out.as_affine_vector().unwrap();
        assert_eq!(rows[0].linear.len(), 2);
        assert_eq!(rows[0].linear[1], LinearTerm::new(0.0, xs[1]));
        assert_eq!(rows[1].canonical().linear, vec![LinearTerm::new(2.0, xs[1])]);
    }

    #[test]
    fn dot_numbers_with_variables_is_affine() {
        let xs = variables(3);
        let c = Value::Vector(vec![1.0, 2.0, 3.0]);
        let mut out = Value::default();
        dot_into(&mut out, &c, &Value::from(xs.as_slice())).unwrap();

        let f = out.as_affine().unwrap();
        assert_eq!(f.value(|v| if v == xs[2] { 1.0 } else { 0.0 }), 3.0);
    }

    #[test]
    fn bilinear_matches_two_step_product() {
        let x = Value::Vector(vec![1.0, 2.0]);
        let a = Value::Matrix(Matrix::from_rows(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
        let y = Value::Vector(vec![1.0, 0.0, -1.0]);
        let mut out = Value::default();
        bilinear_into(&mut out, &x, &a, &y).unwrap();

        let ay = arith::mul(&a, &y).unwrap();
        assert_eq!(out, arith::dot(&x, &ay).unwrap());
    }

    #[test]
    fn bilinear_with_variables_on_both_sides_is_quadratic() {
        let xs = variables(2);
        let vars = Value::from(xs.as_slice());
        let a = Value::Matrix(Matrix::identity(2));
        let mut out = Value::default();
        bilinear_into(&mut out, &vars, &a, &vars).unwrap();

        let q = out.as_quadratic().unwrap();
        assert_eq!(q.value(|_| 3.0), 18.0);
    }

    #[test]
    fn index_checks_bounds() {
        let v = Value::Vector(vec![1.0, 2.0, 3.0]);
        let mut out = Value::default();
        index_into(&mut out, &v, &Index::Range { start: 1, end: 3 }).unwrap();
        assert_eq!(out, Value::Vector(vec![2.0, 3.0]));

        let err = index_into(&mut out, &v, &Index::Element(3)).unwrap_err();
        assert_eq!(
            err,
            EvalError::IndexOutOfBounds {
                index: 3,
                shape: Shape::Vector(3)
            }
        );
    }

    #[test]
    fn transpose_of_vector_is_row() {
        let mut out = Value::default();
        transpose_into(&mut out, &Value::Vector(vec![1.0, 2.0])).unwrap();
        assert_eq!(out.shape(), Shape::Matrix(1, 2));
    }

    #[test]
    fn divisor_must_be_numeric() {
        let xs = variables(1);
        let err = numeric_scalar("div", &Value::from(xs[0])).unwrap_err();
        assert!(matches!(err, EvalError::Unsupported { op: "div", .. }));
    }
}
