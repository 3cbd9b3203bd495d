//! Serialized Expressions
//!
//! A [`Trace`] is a flat list of operations in SSA form, as produced by a
//! recording front end. Each op defines one value id; later ops refer back to
//! it. [`Trace::to_expr`] rebuilds the [`Expr`] tree, and every reference to
//! the same id becomes the same sub-expression, so the builder shares it.
//!
//! ```json
//! {
//!   "output": 4,
//!   "ops": [
//!     {"op": "load", "result": 1, "operands": ["x"]},
//!     {"op": "load", "result": 2, "operands": ["A"]},
//!     {"op": "transpose", "result": 3, "operands": [1]},
//!     {"op": "mul", "result": 5, "operands": [3, 2]},
//!     {"op": "mul", "result": 4, "operands": [5, 1]}
//!   ]
//! }
//! ```
//!
//! Integer operands are value references, except where an op expects a
//! literal (`const`, the positions of `index` and `slice`).

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{call, conditional, dot, vcat, Expr};
use crate::error::{BuildError, BuildResult};

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpCode {
    // Inputs
    Load,
    Const,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Dot,

    // Structure
    Vcat,
    Transpose,
    Index,
    Slice,

    // Other
    Call,
    Select,
}

/// A single operation in the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub op: OpCode,
    /// Value id defined by this op.
    pub result: usize,
    pub operands: Vec<Operand>,
}

/// An operand can be a value reference or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    /// Reference to a value by id, or an integer literal.
    Ref(usize),
    Float(f64),
    /// Input or function name.
    String(String),
}

/// A recorded expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Value id of the result.
    pub output: usize,
    pub ops: Vec<Op>,
}

/// Expressions that `load` ops resolve to, by name.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    inputs: IndexMap<String, Expr>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing any earlier binding.
    pub fn bind(&mut self, name: impl Into<String>, expr: impl Into<Expr>) -> &mut Self {
        self.inputs.insert(name.into(), expr.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.inputs.get(name)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

impl Trace {
    /// Parse a trace from JSON.
    pub fn from_json(json: &str) -> BuildResult<Self> {
        serde_json::from_str(json).map_err(|e| BuildError::InvalidTrace(e.to_string()))
    }

    pub fn to_json(&self) -> BuildResult<String> {
        serde_json::to_string(self).map_err(|e| BuildError::InvalidTrace(e.to_string()))
    }

    /// Parse a trace from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> BuildResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| BuildError::InvalidTrace(e.to_string()))
    }

    pub fn to_msgpack(&self) -> BuildResult<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| BuildError::InvalidTrace(e.to_string()))
    }

    /// Every value id defined by the trace, in op order.
    pub fn value_ids(&self) -> Vec<usize> {
        self.ops.iter().map(|op| op.result).collect()
    }

    /// Rebuild the expression, resolving `load` ops through `bindings`.
    pub fn to_expr(&self, bindings: &Bindings) -> BuildResult<Expr> {
        let mut values: HashMap<usize, Expr> = HashMap::with_capacity(self.ops.len());
        for op in &self.ops {
            let expr = op.lower(&values, bindings)?;
            if values.insert(op.result, expr).is_some() {
                return Err(BuildError::InvalidTrace(format!(
                    "value %{} is defined twice",
                    op.result
                )));
            }
        }
        values
            .remove(&self.output)
            .ok_or(BuildError::UndefinedRef(self.output))
    }
}

impl Op {
    fn lower(&self, values: &HashMap<usize, Expr>, bindings: &Bindings) -> BuildResult<Expr> {
        let expr = match self.op {
            OpCode::Load => {
                self.arity(1)?;
                let name = self.name(0)?;
                bindings
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BuildError::UnboundInput(name.to_string()))?
            }
            OpCode::Const => {
                self.arity(1)?;
                Expr::from(self.number(0)?)
            }
            OpCode::Add => {
                self.arity(2)?;
                self.value(0, values)? + self.value(1, values)?
            }
            OpCode::Sub => {
                self.arity(2)?;
                self.value(0, values)? - self.value(1, values)?
            }
            OpCode::Mul => {
                self.arity(2)?;
                self.value(0, values)? * self.value(1, values)?
            }
            OpCode::Div => {
                self.arity(2)?;
                self.value(0, values)? / self.value(1, values)?
            }
            OpCode::Neg => {
                self.arity(1)?;
                -self.value(0, values)?
            }
            OpCode::Dot => {
                self.arity(2)?;
                dot(self.value(0, values)?, self.value(1, values)?)
            }
            OpCode::Vcat => {
                let parts = (0..self.operands.len())
                    .map(|i| self.value(i, values))
                    .collect::<BuildResult<Vec<_>>>()?;
                vcat(parts)
            }
            OpCode::Transpose => {
                self.arity(1)?;
                self.value(0, values)?.t()
            }
            OpCode::Index => match self.operands.len() {
                2 => self.value(0, values)?.at(self.position(1)?),
                3 => self
                    .value(0, values)?
                    .entry(self.position(1)?, self.position(2)?),
                n => return Err(self.invalid(format!("expects 2 or 3 operands, found {n}"))),
            },
            OpCode::Slice => {
                self.arity(3)?;
                self.value(0, values)?
                    .slice(self.position(1)?, self.position(2)?)
            }
            OpCode::Call => {
                if self.operands.is_empty() {
                    return Err(self.invalid("missing function name".to_string()));
                }
                let args = (1..self.operands.len())
                    .map(|i| self.value(i, values))
                    .collect::<BuildResult<Vec<_>>>()?;
                call(self.name(0)?, args)
            }
            OpCode::Select => {
                self.arity(3)?;
                conditional(
                    self.value(0, values)?,
                    self.value(1, values)?,
                    self.value(2, values)?,
                )
            }
        };
        Ok(expr)
    }

    fn arity(&self, expected: usize) -> BuildResult<()> {
        if self.operands.len() != expected {
            return Err(self.invalid(format!(
                "expects {expected} operand(s), found {}",
                self.operands.len()
            )));
        }
        Ok(())
    }

    fn value(&self, i: usize, values: &HashMap<usize, Expr>) -> BuildResult<Expr> {
        match &self.operands[i] {
            Operand::Ref(id) => values.get(id).cloned().ok_or(BuildError::UndefinedRef(*id)),
            other => Err(self.invalid(format!("operand {i} is not a reference: {other:?}"))),
        }
    }

    fn number(&self, i: usize) -> BuildResult<f64> {
        match &self.operands[i] {
            Operand::Float(x) => Ok(*x),
            Operand::Ref(n) => Ok(*n as f64),
            other => Err(self.invalid(format!("operand {i} is not a number: {other:?}"))),
        }
    }

    fn position(&self, i: usize) -> BuildResult<usize> {
        match &self.operands[i] {
            Operand::Ref(n) => Ok(*n),
            Operand::Float(x) if x.fract() == 0.0 && *x >= 0.0 => Ok(*x as usize),
            other => Err(self.invalid(format!("operand {i} is not a position: {other:?}"))),
        }
    }

    fn name(&self, i: usize) -> BuildResult<&str> {
        match &self.operands[i] {
            Operand::String(name) => Ok(name),
            other => Err(self.invalid(format!("operand {i} is not a name: {other:?}"))),
        }
    }

    fn invalid(&self, message: String) -> BuildError {
        BuildError::InvalidTrace(format!("{:?} %{}: {message}", self.op, self.result))
    }
}
