//! Symbolic Functions of Decision Variables
//!
//! Variables have no numeric value inside the engine. Arithmetic on them
//! produces affine or quadratic functions whose coefficients may depend on
//! parameters; these are what a solver backend consumes.
//!
//! # Term Layout
//!
//! Terms are stored as flat lists and may repeat a variable. The in-place
//! kernels rely on this: as long as the shape of the expression does not
//! change, every evaluation writes the same number of terms in the same order,
//! only the coefficients move. Call [`AffineFunction::canonical`] to get the
//! merged form.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// An opaque decision variable.
///
/// Variables are immutable and compared/ordered by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variable(u64);

impl Variable {
    /// Create a new variable with a process-unique identifier.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an identifier assigned by an external model.
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw identifier.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for Variable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Create `n` fresh variables.
pub fn variables(n: usize) -> Vec<Variable> {
    (0..n).map(|_| Variable::new()).collect()
}

/// `coeff * var`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearTerm {
    pub coeff: f64,
    pub var: Variable,
}

impl LinearTerm {
    pub fn new(coeff: f64, var: Variable) -> Self {
        Self { coeff, var }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            coeff: self.coeff * factor,
            var: self.var,
        }
    }
}

/// `coeff * row * col`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuadraticTerm {
    pub coeff: f64,
    pub row: Variable,
    pub col: Variable,
}

impl QuadraticTerm {
    pub fn new(coeff: f64, row: Variable, col: Variable) -> Self {
        Self { coeff, row, col }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            coeff: self.coeff * factor,
            ..self
        }
    }
}

/// `sum(linear) + constant`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AffineFunction {
    pub linear: Vec<LinearTerm>,
    pub constant: f64,
}

impl AffineFunction {
    pub fn new(linear: Vec<LinearTerm>, constant: f64) -> Self {
        Self { linear, constant }
    }

    /// A function with no linear terms.
    pub fn constant(constant: f64) -> Self {
        Self {
            linear: Vec::new(),
            constant,
        }
    }

    /// `1.0 * var`
    pub fn from_variable(var: Variable) -> Self {
        Self {
            linear: vec![LinearTerm::new(1.0, var)],
            constant: 0.0,
        }
    }

    /// Overwrite `self` with `other`, reusing the term buffer.
    pub fn assign(&mut self, other: &AffineFunction) {
        self.linear.clear();
        self.linear.extend_from_slice(&other.linear);
        self.constant = other.constant;
    }

    /// Reset to the zero function, keeping the term buffer.
    pub fn clear(&mut self) {
        self.linear.clear();
        self.constant = 0.0;
    }

    pub fn scale_in_place(&mut self, factor: f64) {
        for term in &mut self.linear {
            term.coeff *= factor;
        }
        self.constant *= factor;
    }

    /// Evaluate at a variable assignment.
    pub fn value<F>(&self, assignment: F) -> f64
    where
        F: Fn(Variable) -> f64,
    {
        self.linear
            .iter()
            .fold(self.constant, |acc, t| acc + t.coeff * assignment(t.var))
    }

    /// Merge repeated variables, drop zero coefficients and sort by variable.
    pub fn canonical(&self) -> AffineFunction {
        let mut merged: BTreeMap<Variable, f64> = BTreeMap::new();
        for term in &self.linear {
            *merged.entry(term.var).or_insert(0.0) += term.coeff;
        }
        AffineFunction {
            linear: merged
                .into_iter()
                .filter(|(_, c)| *c != 0.0)
                .map(|(var, coeff)| LinearTerm { coeff, var })
                .collect(),
            constant: self.constant,
        }
    }
}

impl From<Variable> for AffineFunction {
    fn from(var: Variable) -> Self {
        Self::from_variable(var)
    }
}

/// `sum(quadratic) + affine`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuadraticFunction {
    pub quadratic: Vec<QuadraticTerm>,
    pub affine: AffineFunction,
}

impl QuadraticFunction {
    pub fn new(quadratic: Vec<QuadraticTerm>, affine: AffineFunction) -> Self {
        Self { quadratic, affine }
    }

    pub fn scale_in_place(&mut self, factor: f64) {
        for term in &mut self.quadratic {
            term.coeff *= factor;
        }
        self.affine.scale_in_place(factor);
    }

    /// Evaluate at a variable assignment.
    pub fn value<F>(&self, assignment: F) -> f64
    where
        F: Fn(Variable) -> f64,
    {
        let quad: f64 = self
            .quadratic
            .iter()
            .map(|t| t.coeff * assignment(t.row) * assignment(t.col))
            .sum();
        quad + self.affine.value(assignment)
    }

    /// Merge repeated pairs, treating `(a, b)` and `(b, a)` as the same pair.
    ///
    /// Pairs are stored with `row <= col`.
    pub fn canonical(&self) -> QuadraticFunction {
        let mut merged: BTreeMap<(Variable, Variable), f64> = BTreeMap::new();
        for term in &self.quadratic {
            let key = if term.row <= term.col {
                (term.row, term.col)
            } else {
                (term.col, term.row)
            };
            *merged.entry(key).or_insert(0.0) += term.coeff;
        }
        QuadraticFunction {
            quadratic: merged
                .into_iter()
                .filter(|(_, c)| *c != 0.0)
                .map(|((row, col), coeff)| QuadraticTerm { coeff, row, col })
                .collect(),
            affine: self.affine.canonical(),
        }
    }
}

impl From<AffineFunction> for QuadraticFunction {
    fn from(affine: AffineFunction) -> Self {
        Self {
            quadratic: Vec::new(),
            affine,
        }
    }
}
