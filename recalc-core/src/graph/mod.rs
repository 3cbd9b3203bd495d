//! Expression Graph
//!
//! This module implements the node graph an expression is compiled into.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Leaves are constants and parameters
//! - Every other node applies one [`OpKind`] to its children
//! - A node referenced from several places is one shared node, so it is
//!   computed at most once per evaluation
//!
//! # Design Decisions
//!
//! 1. Operation kinds form a closed enum. The set of in-place evaluators is
//!    fixed, and the builder picks one when it creates the node.
//!
//! 2. Nodes are reference counted. Parents own their children; the
//!    [`Expression`] owns the root and a flat list of every node for
//!    diagnostics and bulk invalidation.
//!
//! 3. Invalidation pulls (see [`Node`]): marking a parameter
//!    dirty touches nothing else, and ancestors discover the change through
//!    version stamps the next time they are evaluated.

mod kernels;
mod node;
mod op;

use std::collections::HashSet;

use parking_lot::MappedRwLockReadGuard;

use crate::error::{BuildResult, EvalResult};
use crate::reactive::{Cacheable, WrappedExpression};
use crate::value::{Shape, Value, ValueType};

pub use node::{Node, NodeId, NodeRef};
pub use op::{GenericFn, GenericOp, Index, OpKind};

/// A compiled expression: the root of a node graph plus every node in it.
#[derive(Debug, Clone)]
pub struct Expression {
    root: NodeRef,
    /// Every node reachable from the root, children before parents.
    nodes: Vec<NodeRef>,
}

impl Expression {
    /// Take ownership of the graph below `root`.
    pub fn new(root: NodeRef) -> Self {
        let mut nodes = Vec::new();
        let mut visited = HashSet::new();
        collect(&root, &mut visited, &mut nodes);
        Self { root, nodes }
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// Every node, children before parents. Shared nodes appear once.
    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Shape of the result.
    pub fn shape(&self) -> Shape {
        self.root.shape()
    }

    /// Mark every operation node dirty. Parameters are left alone.
    pub fn mark_all_dirty(&self) {
        for node in self.nodes.iter().filter(|n| !n.kind().is_leaf()) {
            node.mark_dirty();
        }
    }

    /// A typed handle over this expression.
    pub fn wrap<T: ValueType>(&self) -> BuildResult<WrappedExpression<T>> {
        WrappedExpression::new(self)
    }
}

impl Cacheable for Expression {
    type Output = Value;

    fn evaluate(&self) -> EvalResult<MappedRwLockReadGuard<'_, Value>> {
        self.root.evaluate()
    }

    fn mark_dirty(&self) {
        self.root.mark_dirty();
    }

    fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }
}

/// Post-order walk that visits each shared node once.
fn collect(node: &NodeRef, visited: &mut HashSet<NodeId>, out: &mut Vec<NodeRef>) {
    if !visited.insert(node.id()) {
        return;
    }
    for child in node.children() {
        collect(child, visited, out);
    }
    out.push(node.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Parameter;

    #[test]
    fn shared_nodes_are_listed_once() {
        let x = Node::parameter(Parameter::vector(2, |v| v.copy_from_slice(&[1.0, 2.0])));
        let sum = Node::infer(OpKind::Add, [x.clone(), x.clone()]).unwrap();
        let expr = Expression::new(Node::infer(OpKind::Dot, [sum.clone(), x.clone()]).unwrap());

        assert_eq!(expr.node_count(), 3);
        assert_eq!(expr.nodes()[0].id(), x.id());
        assert_eq!(expr.nodes()[1].id(), sum.id());
        assert_eq!(expr.shape(), Shape::Scalar);
        assert_eq!(*expr.evaluate().unwrap(), Value::Scalar(10.0));
    }

    #[test]
    fn mark_all_dirty_skips_parameters() {
        let p = Parameter::scalar(|| 3.0);
        let expr = Expression::new(Node::infer(OpKind::Neg, [Node::parameter(p.clone())]).unwrap());
        expr.evaluate().unwrap();

        expr.mark_all_dirty();
        assert!(expr.is_dirty());
        assert!(!p.is_dirty());
        expr.evaluate().unwrap();
        assert_eq!(p.version(), 1);
        assert_eq!(expr.root().evaluation_count(), 2);
    }
}
