//! Expression Builder
//!
//! Compiles an [`Expr`] into an [`Expression`] graph in a single pass.
//!
//! # How It Works
//!
//! 1. Every distinct sub-expression becomes one node. Sub-expressions are
//!    compared by identity, so a clone used twice is compiled once.
//!
//! 2. Each compound form is matched against a table of rules, most specific
//!    first. The first rule that recognizes the operand shapes creates the
//!    node with an in-place evaluator; if none does, the node gets the
//!    allocating generic evaluator.
//!
//! 3. New nodes run their evaluator once on the children's initial values.
//!    That sizes the cache and turns shape errors into construction errors.
//!
//! # Product Rules
//!
//! | pattern            | node                                 |
//! |--------------------|--------------------------------------|
//! | `x' * A * y`       | bilinear (or dot of matmul, unfused) |
//! | `x' * y`           | dot                                  |
//! | `x' * A`           | row of `A' * x`                      |
//! | `A * x`, `A * B`   | matmul                               |
//! | `s * x`, `x * s`   | scale                                |
//! | anything else      | generic multiply                     |
//!
//! A transposed vector is lowered as a row: the vector node itself, flagged.
//! Scaling, negation, division and row-plus-row keep it a row, so
//! `(2 * x') * y` is still an inner product. Where a row meets anything else
//! it becomes a `1 x n` matrix, which only numeric vectors have.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use super::{BinaryOp, Expr, ExprKind};
use crate::error::{BuildError, BuildResult, EvalResult};
use crate::graph::{Expression, GenericFn, GenericOp, Node, NodeId, NodeRef, OpKind};
use crate::reactive::ParameterId;
use crate::value::{arith, Shape, Value, Variable};

type Children = SmallVec<[NodeRef; 4]>;

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

/// What to do with matrix operands of a concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcatPolicy {
    /// Reject them when the expression is built.
    #[default]
    Reject,
    /// Flatten them row-major with the allocating generic evaluator.
    Generic,
}

/// Builder configuration.
///
/// Every field has a default, so a partial JSON object is enough:
///
/// ```rust,ignore
/// let options = BuildOptions::from_json(r#"{ "fuse_bilinear": false }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Use in-place evaluators where a rule matches. When off, every node
    /// uses the generic evaluator.
    pub specialize: bool,
    /// Compile a sub-expression used several times into one node.
    pub share_subexpressions: bool,
    /// Evaluate `x' * A * y` without materializing `A * y`.
    pub fuse_bilinear: bool,
    pub concat_policy: ConcatPolicy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            specialize: true,
            share_subexpressions: true,
            fuse_bilinear: true,
            concat_policy: ConcatPolicy::Reject,
        }
    }
}

impl BuildOptions {
    /// Parse options from JSON.
    pub fn from_json(json: &str) -> BuildResult<Self> {
        serde_json::from_str(json).map_err(|e| BuildError::InvalidOptions(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Computes a function's result shape from its argument shapes.
pub type ShapeRule = Arc<dyn Fn(&[Shape]) -> BuildResult<Shape> + Send + Sync>;

/// A named function callable from expressions.
///
/// Calls always use the generic evaluator. The shape rule lets the builder
/// check the call and size the result without running the function.
#[derive(Clone)]
pub struct Function {
    name: String,
    arity: usize,
    shape: ShapeRule,
    eval: GenericFn,
}

impl Function {
    pub fn new<S, E>(name: impl Into<String>, arity: usize, shape: S, eval: E) -> Self
    where
        S: Fn(&[Shape]) -> BuildResult<Shape> + Send + Sync + 'static,
        E: Fn(&[&Value]) -> EvalResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            shape: Arc::new(shape),
            eval: Arc::new(eval),
        }
    }

    /// A one-argument function applied to every element of a numeric value.
    pub fn elementwise(name: &'static str, f: fn(f64) -> f64) -> Self {
        Self::new(
            name,
            1,
            move |shapes: &[Shape]| match shapes[0] {
                shape if shape.is_symbolic() => Err(BuildError::Unsupported { op: name, shape }),
                shape => Ok(shape),
            },
            move |args: &[&Value]| arith::map_numeric(args[0], name, f),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Result shape for the given argument shapes.
    pub fn result_shape(&self, args: &[Shape]) -> BuildResult<Shape> {
        (self.shape)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

fn builtins() -> [Function; 7] {
    [
        Function::elementwise("sqrt", f64::sqrt),
        Function::elementwise("exp", f64::exp),
        Function::elementwise("ln", f64::ln),
        Function::elementwise("sin", f64::sin),
        Function::elementwise("cos", f64::cos),
        Function::elementwise("abs", f64::abs),
        Function::new(
            "sum",
            1,
            |shapes: &[Shape]| {
                Ok(match shapes[0] {
                    Shape::Scalar | Shape::Vector(_) | Shape::Matrix(..) => Shape::Scalar,
                    Shape::Affine | Shape::AffineVector(_) => Shape::Affine,
                    Shape::Quadratic => Shape::Quadratic,
                })
            },
            |args: &[&Value]| arith::sum(args[0]),
        ),
    ]
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Compiles expressions into node graphs.
///
/// # Example
///
/// ```rust,ignore
/// let a = Parameter::matrix(3, 2, |m| read_coefficients(m));
/// let x = variables(2);
/// let e = Expr::from(&a) * Expr::from(x.as_slice());
///
/// let constraints = ExprBuilder::new().build(&e)?;
/// let rows = constraints.evaluate()?;
/// ```
#[derive(Clone)]
pub struct ExprBuilder {
    options: BuildOptions,
    functions: IndexMap<String, Function>,
}

impl ExprBuilder {
    /// A builder with default options and the built-in functions.
    pub fn new() -> Self {
        Self::with_options(BuildOptions::default())
    }

    pub fn with_options(options: BuildOptions) -> Self {
        let mut builder = Self {
            options,
            functions: IndexMap::new(),
        };
        for function in builtins() {
            builder.register(function);
        }
        builder
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Add a function, replacing any function with the same name.
    pub fn register(&mut self, function: Function) -> &mut Self {
        self.functions.insert(function.name.clone(), function);
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Compile `expr` into a node graph.
    ///
    /// A transposed vector at the root comes out as a `1 x n` matrix.
    pub fn build(&self, expr: &Expr) -> BuildResult<Expression> {
        let mut cx = self.context();
        let root = cx.node(expr)?;
        let root = cx.materialize(root)?;
        let expression = Expression::new(root);

        debug!(
            nodes = expression.node_count(),
            created = cx.created,
            reused = cx.reused,
            shape = %expression.shape(),
            "built expression"
        );
        Ok(expression)
    }

    fn context(&self) -> BuildContext<'_> {
        BuildContext {
            options: &self.options,
            functions: &self.functions,
            by_expr: HashMap::new(),
            by_parameter: HashMap::new(),
            by_variable: HashMap::new(),
            materialized: HashMap::new(),
            spare: HashMap::new(),
            created: 0,
            reused: 0,
        }
    }
}

impl Default for ExprBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExprBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExprBuilder")
            .field("options", &self.options)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Lowering
// ----------------------------------------------------------------------------

/// A lowered sub-expression.
///
/// `row` marks a vector that stands for its own transpose. It stays a vector
/// node until an operation needs the `1 x n` matrix.
#[derive(Clone)]
struct Lowered {
    node: NodeRef,
    row: bool,
}

impl Lowered {
    fn column(node: NodeRef) -> Self {
        Self { node, row: false }
    }

    fn row(node: NodeRef, row: bool) -> Self {
        Self { node, row }
    }

    fn shape(&self) -> Shape {
        self.node.shape()
    }
}

struct BuildContext<'b> {
    options: &'b BuildOptions,
    functions: &'b IndexMap<String, Function>,
    /// Nodes by sub-expression identity. Keys stay valid because the
    /// expression being built keeps every sub-expression alive.
    by_expr: HashMap<usize, Lowered>,
    by_parameter: HashMap<ParameterId, NodeRef>,
    by_variable: HashMap<Variable, NodeRef>,
    /// `1 x n` matrices built for rows, by vector node.
    materialized: HashMap<NodeId, NodeRef>,
    /// Operands lowered for a rule that did not match, taken by the next
    /// lowering of the same sub-expression.
    spare: HashMap<usize, Vec<Lowered>>,
    created: usize,
    reused: usize,
}

/// A product rule: returns `None` when it does not recognize the operands.
type MulRule = fn(&mut BuildContext<'_>, &Lowered, &Lowered) -> BuildResult<Option<Lowered>>;

/// Product rules on lowered operands, most specific first. The bilinear form
/// is matched on the syntax before the operands are lowered.
const MUL_RULES: &[MulRule] = &[
    inner_product,
    row_product,
    matrix_product,
    scalar_product,
];

impl BuildContext<'_> {
    fn node(&mut self, expr: &Expr) -> BuildResult<Lowered> {
        let key = expr.key();
        if let Some(lowered) = self.spare.get_mut(&key).and_then(Vec::pop) {
            return Ok(lowered);
        }
        let share = self.options.share_subexpressions;
        if share {
            if let Some(lowered) = self.by_expr.get(&key) {
                self.reused += 1;
                return Ok(lowered.clone());
            }
        }
        let lowered = self.lower(expr)?;
        if share {
            self.by_expr.insert(key, lowered.clone());
        }
        Ok(lowered)
    }

    /// Keep an operand for the next lowering of `expr`. With sharing on, the
    /// identity table already has it.
    fn give_back(&mut self, expr: &Expr, lowered: Lowered) {
        if !self.options.share_subexpressions {
            self.spare.entry(expr.key()).or_default().push(lowered);
        }
    }

    /// Lower `expr` for an operation that does not know rows.
    fn operand(&mut self, expr: &Expr) -> BuildResult<NodeRef> {
        let lowered = self.node(expr)?;
        self.materialize(lowered)
    }

    /// The node itself, or for a row the `1 x n` matrix.
    fn materialize(&mut self, lowered: Lowered) -> BuildResult<NodeRef> {
        if !lowered.row {
            return Ok(lowered.node);
        }
        let share = self.options.share_subexpressions;
        if share {
            if let Some(node) = self.materialized.get(&lowered.node.id()) {
                self.reused += 1;
                return Ok(node.clone());
            }
        }
        let node = match lowered.shape() {
            Shape::Vector(_) => self.apply("row", OpKind::Transpose, smallvec![lowered.node.clone()])?,
            shape => {
                return Err(BuildError::Unsupported {
                    op: "transpose",
                    shape,
                })
            }
        };
        if share {
            self.materialized.insert(lowered.node.id(), node.clone());
        }
        Ok(node)
    }

    fn leaf(&mut self, node: NodeRef) -> NodeRef {
        self.created += 1;
        node
    }

    fn lower(&mut self, expr: &Expr) -> BuildResult<Lowered> {
        match expr.kind() {
            ExprKind::Literal(value) => Ok(Lowered::column(self.leaf(Node::constant(value.clone())))),
            ExprKind::Parameter(p) => {
                let node = match self.by_parameter.get(&p.id()).cloned() {
                    Some(node) => node,
                    None => {
                        let node = self.leaf(Node::parameter(p.clone()));
                        self.by_parameter.insert(p.id(), node.clone());
                        node
                    }
                };
                Ok(Lowered::column(node))
            }
            ExprKind::Variable(v) => {
                let node = match self.by_variable.get(v).cloned() {
                    Some(node) => node,
                    None => {
                        let node = self.leaf(Node::constant(*v));
                        self.by_variable.insert(*v, node.clone());
                        node
                    }
                };
                Ok(Lowered::column(node))
            }
            ExprKind::Variables(vs) => Ok(Lowered::column(self.leaf(Node::constant(vs.as_slice())))),
            ExprKind::Neg(a) => {
                let a = self.node(a)?;
                let node = self.apply("negate", OpKind::Neg, smallvec![a.node])?;
                Ok(Lowered::row(node, a.row))
            }
            ExprKind::Transpose(a) => self.lower_transpose(a),
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinaryOp::Add => self.lower_elementwise("add", OpKind::Add, lhs, rhs),
                BinaryOp::Sub => self.lower_elementwise("sub", OpKind::Sub, lhs, rhs),
                BinaryOp::Mul => self.lower_mul(lhs, rhs),
                BinaryOp::Div => self.lower_div(lhs, rhs),
            },
            ExprKind::Dot(a, b) => self.lower_dot(a, b).map(Lowered::column),
            ExprKind::Concat(parts) | ExprKind::Bracket(parts) => {
                self.lower_concat(parts).map(Lowered::column)
            }
            ExprKind::Index { operand, index } => {
                let a = self.operand(operand)?;
                self.apply("index", OpKind::Index(*index), smallvec![a])
                    .map(Lowered::column)
            }
            ExprKind::Call { function, args } => self.lower_call(function, args).map(Lowered::column),
            ExprKind::Conditional {
                condition,
                then,
                otherwise,
            } => self
                .lower_conditional(condition, then, otherwise)
                .map(Lowered::column),
        }
    }

    /// Create a node for `kind`, or for its generic equivalent when
    /// specialization is off.
    fn apply(&mut self, rule: &'static str, kind: OpKind, children: Children) -> BuildResult<NodeRef> {
        let kind = match kind.to_generic() {
            Some(generic) if !self.options.specialize => OpKind::Generic(generic),
            _ => kind,
        };
        let node = Node::infer(kind, children)?;
        self.created += 1;
        debug!(
            rule,
            op = node.label(),
            node = node.id().raw(),
            in_place = node.kind().is_specialized(),
            "lowered"
        );
        Ok(node)
    }

    fn generic(&mut self, rule: &'static str, name: &'static str, eval: GenericFn, children: Children) -> BuildResult<NodeRef> {
        self.apply(rule, OpKind::Generic(GenericOp::new(name, eval)), children)
    }

    /// Vectors turn into rows and back without a node. Scalar functions are
    /// their own transpose.
    fn lower_transpose(&mut self, operand: &Expr) -> BuildResult<Lowered> {
        let a = self.node(operand)?;
        match a.shape() {
            Shape::Vector(_) | Shape::AffineVector(_) => Ok(Lowered::row(a.node, !a.row)),
            Shape::Affine | Shape::Quadratic => Ok(a),
            Shape::Scalar | Shape::Matrix(..) => self
                .apply("transpose", OpKind::Transpose, smallvec![a.node])
                .map(Lowered::column),
        }
    }

    /// Rows combine with rows; anything else sees the `1 x n` matrix.
    fn lower_elementwise(&mut self, op: &'static str, kind: OpKind, lhs: &Expr, rhs: &Expr) -> BuildResult<Lowered> {
        let (a, b) = (self.node(lhs)?, self.node(rhs)?);
        let row = a.row && b.row;
        let (a, b) = if row {
            (a.node, b.node)
        } else {
            (self.materialize(a)?, self.materialize(b)?)
        };
        let (sa, sb) = (a.shape(), b.shape());
        let compatible = (sa == sb && !sa.is_symbolic())
            || (sa.is_scalar_like() && sb.is_scalar_like())
            || (sa.is_vector_like() && sb.is_vector_like() && sa.len() == sb.len());
        if !compatible {
            return Err(BuildError::ShapeMismatch {
                op,
                lhs: sa,
                rhs: sb,
            });
        }
        let node = self.apply("elementwise", kind, smallvec![a, b])?;
        Ok(Lowered::row(node, row))
    }

    fn lower_mul(&mut self, lhs: &Expr, rhs: &Expr) -> BuildResult<Lowered> {
        if let Some(node) = bilinear_product(self, lhs, rhs)? {
            return Ok(Lowered::column(node));
        }
        let (a, b) = (self.node(lhs)?, self.node(rhs)?);
        for rule in MUL_RULES {
            if let Some(product) = rule(self, &a, &b)? {
                return Ok(product);
            }
        }
        let (a, b) = (self.materialize(a)?, self.materialize(b)?);
        debug!(lhs = %a.shape(), rhs = %b.shape(), "no product rule matched");
        self.generic(
            "generic product",
            "mul",
            Arc::new(|args: &[&Value]| arith::mul(args[0], args[1])),
            smallvec![a, b],
        )
        .map(Lowered::column)
    }

    fn lower_div(&mut self, lhs: &Expr, rhs: &Expr) -> BuildResult<Lowered> {
        let (a, b) = (self.node(lhs)?, self.operand(rhs)?);
        match b.shape() {
            Shape::Scalar => {
                let node = self.apply("scale", OpKind::Div, smallvec![a.node, b])?;
                Ok(Lowered::row(node, a.row))
            }
            shape => Err(BuildError::Unsupported { op: "div", shape }),
        }
    }

    /// Inner product. A row operand reads as the vector it transposes.
    fn lower_dot(&mut self, lhs: &Expr, rhs: &Expr) -> BuildResult<NodeRef> {
        if self.options.fuse_bilinear {
            if let ExprKind::Binary {
                op: BinaryOp::Mul,
                lhs: a,
                rhs: y,
            } = rhs.kind()
            {
                if let Some(node) = self.bilinear(lhs, a, y)? {
                    return Ok(node);
                }
            }
        }
        let (x, y) = (self.node(lhs)?.node, self.node(rhs)?.node);
        let (sx, sy) = (x.shape(), y.shape());
        if sx.is_vector_like() && sy.is_vector_like() && sx.len() == sy.len() {
            return self.apply("inner product", OpKind::Dot, smallvec![x, y]);
        }
        Err(BuildError::ShapeMismatch {
            op: "dot",
            lhs: sx,
            rhs: sy,
        })
    }

    /// `x' * A * y`, if the shapes line up. Otherwise the lowered operands
    /// are kept for the caller's fallback.
    fn bilinear(&mut self, x: &Expr, a: &Expr, y: &Expr) -> BuildResult<Option<NodeRef>> {
        let (lx, la, ly) = (self.node(x)?, self.node(a)?, self.node(y)?);
        let fits = match la.shape() {
            Shape::Matrix(rows, cols) => {
                let (sx, sy) = (lx.shape(), ly.shape());
                !lx.row
                    && !ly.row
                    && sx.is_vector_like()
                    && sy.is_vector_like()
                    && sx.len() == rows
                    && sy.len() == cols
            }
            _ => false,
        };
        if !fits {
            self.give_back(y, ly);
            self.give_back(a, la);
            self.give_back(x, lx);
            return Ok(None);
        }
        let (x, a, y) = (lx.node, la.node, ly.node);
        if self.options.fuse_bilinear {
            return self.apply("bilinear", OpKind::Bilinear, smallvec![x, a, y]).map(Some);
        }
        let ay = self.apply("matmul", OpKind::MatMul, smallvec![a, y])?;
        self.apply("inner product", OpKind::Dot, smallvec![x, ay]).map(Some)
    }

    fn lower_concat(&mut self, parts: &[Expr]) -> BuildResult<NodeRef> {
        let mut flat: SmallVec<[&Expr; 8]> = SmallVec::new();
        for part in parts {
            match part.kind() {
                ExprKind::Bracket(inner) => flat.extend(inner.iter()),
                _ => flat.push(part),
            }
        }
        if flat.is_empty() {
            return Err(BuildError::EmptyConcat);
        }

        let mut children = Children::new();
        let mut matrix = None;
        for part in flat {
            let child = self.operand(part)?;
            match child.shape() {
                shape @ Shape::Matrix(..) => matrix = matrix.or(Some(shape)),
                Shape::Quadratic => {
                    return Err(BuildError::Unsupported {
                        op: "concat",
                        shape: Shape::Quadratic,
                    })
                }
                _ => {}
            }
            children.push(child);
        }

        match (matrix, self.options.concat_policy) {
            (None, _) => self.apply("concat", OpKind::Concat, children),
            (Some(shape), ConcatPolicy::Reject) => Err(BuildError::Unsupported { op: "concat", shape }),
            (Some(_), ConcatPolicy::Generic) => self.generic(
                "generic concat",
                "concat",
                Arc::new(|args: &[&Value]| arith::concat(args)),
                children,
            ),
        }
    }

    fn lower_call(&mut self, name: &str, args: &[Expr]) -> BuildResult<NodeRef> {
        let functions = self.functions;
        let function = functions
            .get(name)
            .ok_or_else(|| BuildError::UnknownFunction(name.to_string()))?;
        if args.len() != function.arity() {
            return Err(BuildError::Arity {
                name: name.to_string(),
                expected: function.arity(),
                found: args.len(),
            });
        }

        let children = args
            .iter()
            .map(|arg| self.operand(arg))
            .collect::<BuildResult<Children>>()?;
        let shapes: SmallVec<[Shape; 4]> = children.iter().map(|c| c.shape()).collect();
        let shape = function.result_shape(&shapes)?;

        let op = GenericOp::new(function.name.clone(), function.eval.clone());
        let node = Node::operation(OpKind::Generic(op), children, Value::zeros(shape))?;
        self.created += 1;
        debug!(rule = "call", function = name, node = node.id().raw(), shape = %shape, "lowered");
        Ok(node)
    }

    fn lower_conditional(&mut self, condition: &Expr, then: &Expr, otherwise: &Expr) -> BuildResult<NodeRef> {
        let c = self.operand(condition)?;
        if c.shape() != Shape::Scalar {
            return Err(BuildError::NonScalarCondition(c.shape()));
        }
        let (a, b) = (self.operand(then)?, self.operand(otherwise)?);
        if a.shape() != b.shape() {
            return Err(BuildError::IllTypedConditional {
                then: a.shape(),
                otherwise: b.shape(),
            });
        }
        self.generic(
            "conditional",
            "select",
            Arc::new(|args: &[&Value]| arith::select(args[0], args[1], args[2])),
            smallvec![c, a, b],
        )
    }
}

// ----------------------------------------------------------------------------
// Product rules
// ----------------------------------------------------------------------------

/// `(x' * A) * y` and `x' * (A * y)`, matched before the operands are
/// lowered so that `x' * A` is never built.
fn bilinear_product(cx: &mut BuildContext<'_>, lhs: &Expr, rhs: &Expr) -> BuildResult<Option<NodeRef>> {
    if let ExprKind::Binary {
        op: BinaryOp::Mul,
        lhs: xt,
        rhs: a,
    } = lhs.kind()
    {
        if let ExprKind::Transpose(x) = xt.kind() {
            return cx.bilinear(x, a, rhs);
        }
    }
    // Unfused, `x' * (A * y)` is left to the inner product rule so that
    // `A * y` stays a shared sub-expression.
    if !cx.options.fuse_bilinear {
        return Ok(None);
    }
    if let (
        ExprKind::Transpose(x),
        ExprKind::Binary {
            op: BinaryOp::Mul,
            lhs: a,
            rhs: y,
        },
    ) = (lhs.kind(), rhs.kind())
    {
        return cx.bilinear(x, a, y);
    }
    Ok(None)
}

/// A row times a vector of equal length.
fn inner_product(cx: &mut BuildContext<'_>, a: &Lowered, b: &Lowered) -> BuildResult<Option<Lowered>> {
    let (sa, sb) = (a.shape(), b.shape());
    if !a.row || b.row || !sb.is_vector_like() || sa.len() != sb.len() {
        return Ok(None);
    }
    let node = cx.apply("inner product", OpKind::Dot, smallvec![a.node.clone(), b.node.clone()])?;
    Ok(Some(Lowered::column(node)))
}

/// A row times a matrix: `x' * A` is the row of `A' * x`.
fn row_product(cx: &mut BuildContext<'_>, a: &Lowered, b: &Lowered) -> BuildResult<Option<Lowered>> {
    match b.shape() {
        Shape::Matrix(rows, _) if a.row && a.shape().len() == rows => {
            let at = cx.apply("transpose", OpKind::Transpose, smallvec![b.node.clone()])?;
            let node = cx.apply("matmul", OpKind::MatMul, smallvec![at, a.node.clone()])?;
            Ok(Some(Lowered::row(node, true)))
        }
        _ => Ok(None),
    }
}

/// Matrix times vector, matrix or vector of affine functions.
fn matrix_product(cx: &mut BuildContext<'_>, a: &Lowered, b: &Lowered) -> BuildResult<Option<Lowered>> {
    let fits = !b.row
        && match (a.shape(), b.shape()) {
            (Shape::Matrix(_, k), Shape::Vector(n) | Shape::AffineVector(n)) => k == n,
            (Shape::Matrix(_, k), Shape::Matrix(n, _)) => k == n,
            _ => false,
        };
    if !fits {
        return Ok(None);
    }
    let node = cx.apply("matmul", OpKind::MatMul, smallvec![a.node.clone(), b.node.clone()])?;
    Ok(Some(Lowered::column(node)))
}

/// A numeric scalar times anything. A scaled row is still a row.
fn scalar_product(cx: &mut BuildContext<'_>, a: &Lowered, b: &Lowered) -> BuildResult<Option<Lowered>> {
    let (s, other) = match (a.shape(), b.shape()) {
        (Shape::Scalar, _) => (a, b),
        (_, Shape::Scalar) => (b, a),
        _ => return Ok(None),
    };
    let node = cx.apply("scale", OpKind::Scale, smallvec![s.node.clone(), other.node.clone()])?;
    Ok(Some(Lowered::row(node, other.row)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{bracket, call, conditional, dot, vcat};
    use crate::reactive::{Cacheable, Parameter};
    use crate::value::{variables, Matrix};

    fn vector(values: &[f64]) -> Parameter<Value> {
        let values = values.to_vec();
        Parameter::vector(values.len(), move |v| v.copy_from_slice(&values))
    }

    fn matrix(rows: &[[f64; 2]]) -> Parameter<Value> {
        let m = Matrix::from_rows(rows);
        Parameter::matrix(m.rows(), m.cols(), move |out| out.clone_from(&m))
    }

    #[test]
    fn bilinear_form_is_fused() {
        let x = Expr::from(vector(&[1.0, 2.0]));
        let a = Expr::from(matrix(&[[1.0, 0.0], [0.0, 3.0]]));
        let y = Expr::from(vector(&[5.0, 7.0]));

        let e = x.t() * &a * &y;
        let built = ExprBuilder::new().build(&e).unwrap();
        assert_eq!(built.root().label(), "bilinear");
        assert_eq!(*built.evaluate().unwrap(), Value::Scalar(5.0 + 42.0));

        let e = x.t() * (&a * &y);
        assert_eq!(ExprBuilder::new().build(&e).unwrap().root().label(), "bilinear");
        assert_eq!(ExprBuilder::new().build(&dot(&x, &a * &y)).unwrap().root().label(), "bilinear");
    }

    #[test]
    fn unfused_bilinear_is_dot_of_matmul() {
        let options = BuildOptions {
            fuse_bilinear: false,
            ..BuildOptions::default()
        };
        let x = Expr::from(vector(&[1.0, 2.0]));
        let a = Expr::from(matrix(&[[1.0, 0.0], [0.0, 3.0]]));
        let y = Expr::from(vector(&[5.0, 7.0]));

        let built = ExprBuilder::with_options(options).build(&(x.t() * a * y)).unwrap();
        let root = built.root();
        assert_eq!(root.label(), "dot");
        assert_eq!(root.children()[1].label(), "matmul");
        assert_eq!(*built.evaluate().unwrap(), Value::Scalar(47.0));
    }

    #[test]
    fn product_rules_pick_in_place_kernels() {
        let builder = ExprBuilder::new();
        let x = Expr::from(vector(&[1.0, 2.0]));
        let a = Expr::from(matrix(&[[1.0, 2.0], [3.0, 4.0]]));

        assert_eq!(builder.build(&(&a * &x)).unwrap().root().label(), "matmul");
        assert_eq!(builder.build(&(&a * &a)).unwrap().root().label(), "matmul");
        assert_eq!(builder.build(&(2.0 * &x)).unwrap().root().label(), "scale");
        assert_eq!(builder.build(&(&x * 2.0)).unwrap().root().label(), "scale");
        assert_eq!(builder.build(&(x.t() * &x)).unwrap().root().label(), "dot");
    }

    #[test]
    fn scaled_rows_are_inner_products() {
        let builder = ExprBuilder::new();
        let v = Expr::from(vector(&[1.0, 2.0]));
        let a = Expr::from(matrix(&[[1.0, 2.0], [3.0, 4.0]]));
        let eval = |e: &Expr| builder.build(e).unwrap().evaluate().unwrap().clone();

        assert_eq!(eval(&(v.t() * &v)), Value::Scalar(5.0));
        assert_eq!(eval(&((2.0 * v.t()) * &v)), eval(&(2.0 * (v.t() * &v))));
        assert_eq!(eval(&((v.t() * 2.0) * &v)), Value::Scalar(10.0));
        assert_eq!(eval(&(-v.t() * &v)), Value::Scalar(-5.0));
        assert_eq!(eval(&((v.t() / 2.0) * &v)), Value::Scalar(2.5));
        assert_eq!(eval(&((v.t() + v.t()) * &v)), Value::Scalar(10.0));

        // v' * A = [7, 10]
        let e = (2.0 * v.t()) * &a * &v;
        let built = builder.build(&e).unwrap();
        assert_eq!(built.root().label(), "dot");
        assert_eq!(*built.evaluate().unwrap(), Value::Scalar(54.0));
    }

    #[test]
    fn rows_outside_products_are_matrices() {
        let builder = ExprBuilder::new();
        let v = Expr::from(vector(&[1.0, 2.0]));
        let a = Expr::from(matrix(&[[1.0, 2.0], [3.0, 4.0]]));

        let built = builder.build(&v.t()).unwrap();
        assert_eq!(built.shape(), Shape::Matrix(1, 2));
        let built = builder.build(&(v.t() * &a)).unwrap();
        assert_eq!(
            *built.evaluate().unwrap(),
            Value::Matrix(Matrix::from_rows(&[[7.0, 10.0]]))
        );
        assert!(matches!(
            builder.build(&(v.t() + &v)),
            Err(BuildError::ShapeMismatch { op: "add", .. })
        ));

        let xs = variables(2);
        assert_eq!(
            builder.build(&Expr::from(xs.as_slice()).t()).unwrap_err(),
            BuildError::Unsupported {
                op: "transpose",
                shape: Shape::AffineVector(2)
            }
        );
    }

    #[test]
    fn quadratic_objective_with_variables() {
        let xs = variables(2);
        let x = Expr::from(xs.as_slice());
        let q = Expr::from(matrix(&[[1.0, 0.0], [0.0, 3.0]]));
        let at = |v: Variable| if v == xs[0] { 1.0 } else { 2.0 };

        let full = ExprBuilder::new().build(&(x.t() * &q * &x)).unwrap();
        assert_eq!(full.root().label(), "bilinear");
        assert_eq!(full.evaluate().unwrap().as_quadratic().unwrap().value(at), 13.0);

        let e = 0.5 * x.t() * &q * &x;
        for options in [
            BuildOptions::default(),
            BuildOptions {
                specialize: false,
                ..BuildOptions::default()
            },
        ] {
            let half = ExprBuilder::with_options(options).build(&e).unwrap();
            assert_eq!(half.shape(), Shape::Quadratic);
            assert_eq!(half.evaluate().unwrap().as_quadratic().unwrap().value(at), 6.5);
        }
    }

    #[test]
    fn unshared_operands_are_lowered_once() {
        let builder = ExprBuilder::with_options(BuildOptions {
            share_subexpressions: false,
            ..BuildOptions::default()
        });

        let mut e = Expr::from(vector(&[1.0, 2.0]));
        for _ in 0..20 {
            e = e * 2.0;
        }
        let mut cx = builder.context();
        let root = cx.node(&e).unwrap();
        let built = Expression::new(root.node);
        assert_eq!(built.node_count(), 41);
        assert_eq!(cx.created, built.node_count());

        // Looks like a bilinear form, but the middle factor is a scalar
        let x = Expr::from(vector(&[1.0, 2.0]));
        let y = Expr::from(vector(&[3.0, 4.0]));
        let e = (x.t() * 3.0) * &y;
        let mut cx = builder.context();
        let root = cx.node(&e).unwrap();
        let built = Expression::new(root.node);
        assert_eq!(cx.created, built.node_count());
        assert_eq!(built.node_count(), 5);
        assert_eq!(*built.evaluate().unwrap(), Value::Scalar(33.0));
    }

    #[test]
    fn unmatched_product_falls_back_to_generic() {
        let xs = variables(1);
        let f = Expr::from(xs[0]) + 1.0;
        let built = ExprBuilder::new().build(&(&f * &f)).unwrap();

        assert!(!built.root().kind().is_specialized());
        assert_eq!(built.shape(), Shape::Quadratic);
    }

    #[test]
    fn shared_subexpression_is_one_node() {
        let x = Expr::from(vector(&[1.0, 2.0]));
        let sum = &x + &x;
        let e = dot(&sum, &sum);

        let built = ExprBuilder::new().build(&e).unwrap();
        assert_eq!(built.node_count(), 3);
        assert_eq!(*built.evaluate().unwrap(), Value::Scalar(20.0));
        assert_eq!(built.nodes()[1].evaluation_count(), 1);

        let options = BuildOptions {
            share_subexpressions: false,
            ..BuildOptions::default()
        };
        let unshared = ExprBuilder::with_options(options).build(&e).unwrap();
        assert_eq!(unshared.node_count(), 4);
    }

    #[test]
    fn same_parameter_is_one_node() {
        let p = vector(&[1.0, 2.0]);
        let e = Expr::from(&p) + Expr::from(&p);
        assert_eq!(ExprBuilder::new().build(&e).unwrap().node_count(), 2);
    }

    #[test]
    fn generic_mode_uses_no_kernels() {
        let options = BuildOptions {
            specialize: false,
            ..BuildOptions::default()
        };
        let x = Expr::from(vector(&[1.0, 2.0]));
        let a = Expr::from(matrix(&[[1.0, 2.0], [3.0, 4.0]]));
        let e = vcat([&a * &x, 2.0 * &x]);

        let built = ExprBuilder::with_options(options).build(&e).unwrap();
        assert!(built
            .nodes()
            .iter()
            .filter(|n| !n.kind().is_leaf())
            .all(|n| !n.kind().is_specialized()));
        assert_eq!(*built.evaluate().unwrap(), Value::Vector(vec![5.0, 11.0, 2.0, 4.0]));
    }

    #[test]
    fn nested_brackets_are_spliced() {
        let x = Expr::from(vector(&[1.0, 2.0]));
        let y = Expr::from(3.0);
        let e = vcat([bracket([&x, &y]), x.clone()]);

        let built = ExprBuilder::new().build(&e).unwrap();
        assert_eq!(built.root().children().len(), 3);
        assert_eq!(*built.evaluate().unwrap(), Value::Vector(vec![1.0, 2.0, 3.0, 1.0, 2.0]));
    }

    #[test]
    fn matrix_concat_follows_policy() {
        let a = Expr::from(matrix(&[[1.0, 2.0], [3.0, 4.0]]));
        let e = vcat([a.clone(), Expr::from(5.0)]);

        let err = ExprBuilder::new().build(&e).unwrap_err();
        assert_eq!(
            err,
            BuildError::Unsupported {
                op: "concat",
                shape: Shape::Matrix(2, 2)
            }
        );

        let options = BuildOptions::from_json(r#"{ "concat_policy": "generic" }"#).unwrap();
        let built = ExprBuilder::with_options(options).build(&e).unwrap();
        assert_eq!(
            *built.evaluate().unwrap(),
            Value::Vector(vec![1.0, 2.0, 3.0, 4.0, 5.0])
        );
    }

    #[test]
    fn empty_concat_is_rejected() {
        let e = vcat(Vec::<Expr>::new());
        assert_eq!(ExprBuilder::new().build(&e).unwrap_err(), BuildError::EmptyConcat);
    }

    #[test]
    fn shape_errors_surface_at_build() {
        let x = Expr::from(vector(&[1.0, 2.0]));
        let y = Expr::from(vector(&[1.0, 2.0, 3.0]));
        let builder = ExprBuilder::new();

        assert!(matches!(
            builder.build(&(&x + &y)),
            Err(BuildError::ShapeMismatch { op: "add", .. })
        ));
        assert!(matches!(
            builder.build(&dot(&x, &y)),
            Err(BuildError::ShapeMismatch { op: "dot", .. })
        ));
        assert!(matches!(
            builder.build(&x.at(2)),
            Err(BuildError::IndexOutOfBounds { index: 2, .. })
        ));
        assert!(matches!(
            builder.build(&(&x / &x)),
            Err(BuildError::Unsupported { op: "div", .. })
        ));
    }

    #[test]
    fn functions_are_checked() {
        let builder = ExprBuilder::new();
        let x = Expr::from(vector(&[4.0, 9.0]));

        let built = builder.build(&call("sqrt", [&x])).unwrap();
        assert_eq!(*built.evaluate().unwrap(), Value::Vector(vec![2.0, 3.0]));
        assert_eq!(
            *builder.build(&call("sum", [&x])).unwrap().evaluate().unwrap(),
            Value::Scalar(13.0)
        );

        assert_eq!(
            builder.build(&call("nope", [&x])).unwrap_err(),
            BuildError::UnknownFunction("nope".into())
        );
        assert!(matches!(
            builder.build(&call("exp", [&x, &x])),
            Err(BuildError::Arity { expected: 1, found: 2, .. })
        ));
        let xs = variables(1);
        assert!(matches!(
            builder.build(&call("sqrt", [Expr::from(xs[0])])),
            Err(BuildError::Unsupported { op: "sqrt", .. })
        ));
    }

    #[test]
    fn user_functions_declare_their_shape() {
        let mut builder = ExprBuilder::new();
        builder.register(Function::new(
            "norm",
            1,
            |shapes: &[Shape]| match shapes[0] {
                Shape::Vector(_) => Ok(Shape::Scalar),
                shape => Err(BuildError::Unsupported { op: "norm", shape }),
            },
            |args: &[&Value]| {
                let v = args[0].as_vector().unwrap_or_default();
                Ok(Value::Scalar(v.iter().map(|x| x * x).sum::<f64>().sqrt()))
            },
        ));

        assert_eq!(builder.function("norm").map(Function::arity), Some(1));

        let built = builder.build(&call("norm", [vector(&[3.0, 4.0])])).unwrap();
        assert_eq!(built.shape(), Shape::Scalar);
        assert_eq!(*built.evaluate().unwrap(), Value::Scalar(5.0));
    }

    #[test]
    fn conditionals_are_type_checked() {
        let builder = ExprBuilder::new();
        let flag = Parameter::scalar(|| 1.0);
        let x = Expr::from(vector(&[1.0, 2.0]));
        let y = Expr::from(vector(&[3.0, 4.0]));

        let built = builder.build(&conditional(&flag, &x, &y)).unwrap();
        assert_eq!(*built.evaluate().unwrap(), Value::Vector(vec![1.0, 2.0]));

        assert!(matches!(
            builder.build(&conditional(&x, &x, &y)),
            Err(BuildError::NonScalarCondition(Shape::Vector(2)))
        ));
        assert!(matches!(
            builder.build(&conditional(&flag, &x, 1.0)),
            Err(BuildError::IllTypedConditional { .. })
        ));
    }

    #[test]
    fn options_parse_with_defaults() {
        let options = BuildOptions::from_json(r#"{ "specialize": false }"#).unwrap();
        assert!(!options.specialize);
        assert!(options.share_subexpressions);
        assert_eq!(options.concat_policy, ConcatPolicy::Reject);

        assert!(matches!(
            BuildOptions::from_json("{ not json"),
            Err(BuildError::InvalidOptions(_))
        ));
    }
}
