//! Graph Nodes
//!
//! A node is one cacheable unit of an expression graph: a constant, a
//! parameter, or an operation over child nodes.
//!
//! # Propagation
//!
//! Evaluation pulls. Every node carries a version that is bumped each time
//! its value is recomputed, and every operation node remembers the versions
//! of its children it last consumed. Evaluating a node first evaluates its
//! children, then recomputes only if it was marked dirty or some child
//! reports a version it has not seen.
//!
//! Comparing versions instead of asking "was the child recomputed during this
//! call" matters once a child is shared: the first parent to reach it
//! triggers the recomputation, and the second parent must still notice it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};
use smallvec::SmallVec;
use tracing::trace;

use super::op::OpKind;
use crate::error::{BuildError, BuildResult, EvalError, EvalResult};
use crate::reactive::{Cacheable, DirtyFlag, Parameter};
use crate::value::{Shape, Value};

/// Shared handle to a node. A node may have several parents.
pub type NodeRef = Arc<Node>;

/// Unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

struct NodeState {
    value: Value,
    version: u64,
    /// Child versions consumed by the last recomputation.
    seen: SmallVec<[u64; 4]>,
}

/// A cacheable node in an expression graph.
pub struct Node {
    id: NodeId,
    kind: OpKind,
    children: SmallVec<[NodeRef; 4]>,
    dirty: DirtyFlag,
    state: RwLock<NodeState>,
    /// Number of times the evaluator ran.
    evaluations: AtomicU64,
}

impl Node {
    fn with_state(kind: OpKind, children: SmallVec<[NodeRef; 4]>, value: Value, version: u64) -> NodeRef {
        let seen = SmallVec::from_elem(0, children.len());
        Arc::new(Node {
            id: NodeId::new(),
            kind,
            children,
            dirty: DirtyFlag::new(),
            state: RwLock::new(NodeState {
                value,
                version,
                seen,
            }),
            evaluations: AtomicU64::new(0),
        })
    }

    /// A node that always holds `value`.
    pub fn constant(value: impl Into<Value>) -> NodeRef {
        let node = Self::with_state(OpKind::Constant, SmallVec::new(), value.into(), 1);
        node.dirty.clear();
        node
    }

    /// A node backed by a parameter. The parameter keeps its own cache.
    pub fn parameter(parameter: Parameter<Value>) -> NodeRef {
        Self::with_state(OpKind::Parameter(parameter), SmallVec::new(), Value::default(), 0)
    }

    /// An operation node whose cache starts as `initial`.
    pub fn operation<I>(kind: OpKind, children: I, initial: Value) -> BuildResult<NodeRef>
    where
        I: IntoIterator<Item = NodeRef>,
    {
        let children: SmallVec<[NodeRef; 4]> = children.into_iter().collect();
        if kind.is_leaf() {
            return Err(BuildError::Unsupported {
                op: "operation",
                shape: initial.shape(),
            });
        }
        if let Some(expected) = kind.arity() {
            if expected != children.len() {
                return Err(BuildError::Arity {
                    name: kind.label().to_string(),
                    expected,
                    found: children.len(),
                });
            }
        }
        Ok(Self::with_state(kind, children, initial, 0))
    }

    /// An operation node whose cache is sized by running its evaluator once on
    /// the children's current values.
    ///
    /// Shape errors surface here, at construction.
    pub fn infer<I>(kind: OpKind, children: I) -> BuildResult<NodeRef>
    where
        I: IntoIterator<Item = NodeRef>,
    {
        let node = Self::operation(kind, children, Value::default())?;
        {
            let mut state = node.state.write();
            node.kind.evaluate_into(&mut state.value, &node.children)?;
        }
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn label(&self) -> &str {
        self.kind.label()
    }

    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    /// Shape of the cached value.
    pub fn shape(&self) -> Shape {
        self.value().shape()
    }

    /// Number of times this node's value was computed.
    ///
    /// For a parameter node this counts runs of the update function.
    pub fn evaluation_count(&self) -> u64 {
        match &self.kind {
            OpKind::Parameter(p) => p.version(),
            _ => self.evaluations.load(Ordering::Relaxed),
        }
    }

    /// Current version of the cached value.
    pub fn version(&self) -> u64 {
        match &self.kind {
            OpKind::Parameter(p) => p.version(),
            _ => self.state.read_recursive().version,
        }
    }

    /// Borrow the cached value without refreshing it.
    pub fn value(&self) -> MappedRwLockReadGuard<'_, Value> {
        match &self.kind {
            OpKind::Parameter(p) => p.read(),
            _ => RwLockReadGuard::map(self.state.read_recursive(), |s| &s.value),
        }
    }

    /// Bring this node and its inputs up to date; returns the new version.
    pub(crate) fn refresh(&self) -> EvalResult<u64> {
        match &self.kind {
            OpKind::Parameter(p) => return p.refresh(),
            OpKind::Constant => {
                self.dirty.clear();
                return Ok(self.state.read_recursive().version);
            }
            _ => {}
        }

        let state = self.state.upgradable_read();
        let mut stale = self.dirty.is_set();
        for (child, seen) in self.children.iter().zip(&state.seen) {
            stale |= child.refresh()? != *seen;
        }
        if !stale {
            return Ok(state.version);
        }

        let mut state = RwLockUpgradableReadGuard::try_upgrade(state).map_err(|_| EvalError::Busy {
            what: "node",
            id: self.id.raw(),
        })?;
        self.dirty.clear();

        let NodeState {
            value,
            version,
            seen,
        } = &mut *state;
        for (child, seen) in self.children.iter().zip(seen.iter_mut()) {
            *seen = child.version();
        }
        if let Err(err) = self.kind.evaluate_into(value, &self.children) {
            self.dirty.mark();
            return Err(err);
        }
        *version += 1;
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        trace!(node = self.id.raw(), op = self.kind.label(), version = *version, "recomputed");
        Ok(*version)
    }
}

impl Cacheable for Node {
    type Output = Value;

    fn evaluate(&self) -> EvalResult<MappedRwLockReadGuard<'_, Value>> {
        self.refresh()?;
        Ok(self.value())
    }

    fn mark_dirty(&self) {
        match &self.kind {
            OpKind::Parameter(p) => p.mark_dirty(),
            _ => self.dirty.mark(),
        }
    }

    fn is_dirty(&self) -> bool {
        match &self.kind {
            OpKind::Parameter(p) => p.is_dirty(),
            _ => self.dirty.is_set(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id.raw())
            .field("op", &self.kind.label())
            .field("children", &self.children.iter().map(|c| c.id.raw()).collect::<Vec<_>>())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
