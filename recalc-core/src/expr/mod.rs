//! Expressions
//!
//! An [`Expr`] is the syntax a caller writes: a tree of literals, parameters,
//! variables and operations, put together with ordinary Rust operators. It
//! computes nothing. [`ExprBuilder::build`] turns it into a node graph once;
//! the graph is what gets evaluated in the loop.
//!
//! # Sharing
//!
//! Sub-expressions are reference counted. Cloning an `Expr` and using it in
//! two places makes both places refer to the same sub-expression, and the
//! builder compiles it into a single shared node:
//!
//! ```rust,ignore
//! let ax = Expr::from(&a) * Expr::from(&x);   // built once
//! let e = &ax + &ax.dot(&ax);
//! ```
//!
//! Two sub-expressions that merely look alike are different sub-expressions.
//! Parameters and variables are the exception: every mention of the same
//! parameter or variable refers to the same node.

mod builder;
mod trace;

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

use crate::graph::Index;
use crate::reactive::Parameter;
use crate::value::{Matrix, Value, Variable};

pub use builder::{BuildOptions, ConcatPolicy, ExprBuilder, Function, ShapeRule};
pub use trace::{Bindings, Op, OpCode, Operand, Trace};

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// The syntactic forms of an expression.
pub enum ExprKind {
    Literal(Value),
    Parameter(Parameter<Value>),
    Variable(Variable),
    /// A vector of decision variables.
    Variables(Vec<Variable>),
    Neg(Expr),
    /// `x'`
    Transpose(Expr),
    Binary {
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
    },
    Dot(Expr, Expr),
    /// `vcat(a, b, ...)`
    Concat(Vec<Expr>),
    /// `[a; b; ...]`
    Bracket(Vec<Expr>),
    Index {
        operand: Expr,
        index: Index,
    },
    /// A named function from the builder's function table.
    Call {
        function: String,
        args: Vec<Expr>,
    },
    /// `condition != 0 ? then : otherwise`
    Conditional {
        condition: Expr,
        then: Expr,
        otherwise: Expr,
    },
}

/// A shared handle to an expression tree.
#[derive(Clone)]
pub struct Expr(Arc<ExprKind>);

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self(Arc::new(kind))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::new(ExprKind::Literal(value.into()))
    }

    pub fn parameter(parameter: &Parameter<Value>) -> Self {
        Self::new(ExprKind::Parameter(parameter.clone()))
    }

    pub fn variable(variable: Variable) -> Self {
        Self::new(ExprKind::Variable(variable))
    }

    pub fn variables(variables: &[Variable]) -> Self {
        Self::new(ExprKind::Variables(variables.to_vec()))
    }

    /// Whether `self` and `other` are the same sub-expression.
    pub fn same(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity key used for sharing while the tree is alive.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Transpose, written `x'` in mathematical notation.
    pub fn t(&self) -> Expr {
        Self::new(ExprKind::Transpose(self.clone()))
    }

    /// Inner product with `other`.
    pub fn dot(&self, other: impl Into<Expr>) -> Expr {
        dot(self.clone(), other)
    }

    /// Element `i` of a vector.
    pub fn at(&self, i: usize) -> Expr {
        self.index(Index::Element(i))
    }

    /// Elements `start..end` of a vector.
    pub fn slice(&self, start: usize, end: usize) -> Expr {
        self.index(Index::Range { start, end })
    }

    /// Entry `(i, j)` of a matrix.
    pub fn entry(&self, i: usize, j: usize) -> Expr {
        self.index(Index::Entry(i, j))
    }

    pub fn index(&self, index: Index) -> Expr {
        Self::new(ExprKind::Index {
            operand: self.clone(),
            index,
        })
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Self::new(ExprKind::Binary { op, lhs, rhs })
    }
}

/// `vcat(parts...)`
pub fn vcat<I>(parts: I) -> Expr
where
    I: IntoIterator,
    I::Item: Into<Expr>,
{
    Expr::new(ExprKind::Concat(parts.into_iter().map(Into::into).collect()))
}

/// `[parts...]`, a literal bracket.
///
/// Nested brackets are spliced one level, so `[[x; y]; z]` is `[x; y; z]`.
pub fn bracket<I>(parts: I) -> Expr
where
    I: IntoIterator,
    I::Item: Into<Expr>,
{
    Expr::new(ExprKind::Bracket(parts.into_iter().map(Into::into).collect()))
}

/// Inner product.
pub fn dot(lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Expr {
    Expr::new(ExprKind::Dot(lhs.into(), rhs.into()))
}

/// Call a function registered on the builder.
pub fn call<I>(function: impl Into<String>, args: I) -> Expr
where
    I: IntoIterator,
    I::Item: Into<Expr>,
{
    Expr::new(ExprKind::Call {
        function: function.into(),
        args: args.into_iter().map(Into::into).collect(),
    })
}

/// `condition != 0 ? then : otherwise`
pub fn conditional(
    condition: impl Into<Expr>,
    then: impl Into<Expr>,
    otherwise: impl Into<Expr>,
) -> Expr {
    Expr::new(ExprKind::Conditional {
        condition: condition.into(),
        then: then.into(),
        otherwise: otherwise.into(),
    })
}

impl From<&Expr> for Expr {
    fn from(expr: &Expr) -> Self {
        expr.clone()
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::literal(value)
    }
}

impl From<f64> for Expr {
    fn from(x: f64) -> Self {
        Expr::literal(x)
    }
}

impl From<Vec<f64>> for Expr {
    fn from(v: Vec<f64>) -> Self {
        Expr::literal(v)
    }
}

impl From<Matrix> for Expr {
    fn from(m: Matrix) -> Self {
        Expr::literal(m)
    }
}

impl From<Variable> for Expr {
    fn from(v: Variable) -> Self {
        Expr::variable(v)
    }
}

impl From<&[Variable]> for Expr {
    fn from(vs: &[Variable]) -> Self {
        Expr::variables(vs)
    }
}

impl From<&Parameter<Value>> for Expr {
    fn from(p: &Parameter<Value>) -> Self {
        Expr::parameter(p)
    }
}

impl From<Parameter<Value>> for Expr {
    fn from(p: Parameter<Value>) -> Self {
        Expr::new(ExprKind::Parameter(p))
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }

        impl $trait<&Expr> for Expr {
            type Output = Expr;

            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, self, rhs.clone())
            }
        }

        impl $trait<Expr> for &Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs)
            }
        }

        impl $trait for &Expr {
            type Output = Expr;

            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs.clone())
            }
        }

        impl $trait<f64> for Expr {
            type Output = Expr;

            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($op, self, Expr::literal(rhs))
            }
        }

        impl $trait<f64> for &Expr {
            type Output = Expr;

            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($op, self.clone(), Expr::literal(rhs))
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, Expr::literal(self), rhs)
            }
        }

        impl $trait<&Expr> for f64 {
            type Output = Expr;

            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, Expr::literal(self), rhs.clone())
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::new(ExprKind::Neg(self))
    }
}

impl Neg for &Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::new(ExprKind::Neg(self.clone()))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Literal(value) => match value {
                Value::Scalar(x) => write!(f, "{x}"),
                other => write!(f, "<{}>", other.shape()),
            },
            ExprKind::Parameter(p) => match p.name() {
                Some(name) => write!(f, "{name}"),
                None => write!(f, "p{}", p.id().raw()),
            },
            ExprKind::Variable(v) => write!(f, "{v}"),
            ExprKind::Variables(vs) => write!(f, "<{} variables>", vs.len()),
            ExprKind::Neg(a) => write!(f, "-({a})"),
            ExprKind::Transpose(a) => write!(f, "({a})'"),
            ExprKind::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            ExprKind::Dot(a, b) => write!(f, "dot({a}, {b})"),
            ExprKind::Concat(parts) => write_list(f, "vcat(", parts, ", ", ")"),
            ExprKind::Bracket(parts) => write_list(f, "[", parts, "; ", "]"),
            ExprKind::Index { operand, index } => match index {
                Index::Element(i) => write!(f, "{operand}[{i}]"),
                Index::Range { start, end } => write!(f, "{operand}[{start}..{end}]"),
                Index::Entry(i, j) => write!(f, "{operand}[{i}, {j}]"),
            },
            ExprKind::Call { function, args } => {
                write_list(f, &format!("{function}("), args, ", ", ")")
            }
            ExprKind::Conditional {
                condition,
                then,
                otherwise,
            } => write!(f, "({condition} ? {then} : {otherwise})"),
        }
    }
}

fn write_list(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    parts: &[Expr],
    separator: &str,
    close: &str,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{part}")?;
    }
    f.write_str(close)
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({self})")
    }
}
