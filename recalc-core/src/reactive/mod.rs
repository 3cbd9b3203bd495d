//! Cacheable Values
//!
//! This module holds the leaf side of the engine: cacheable values with a
//! dirty flag, the parameters that pull their value from outside the graph,
//! and the registry that invalidates parameters in bulk.
//!
//! # Concepts
//!
//! ## Cacheable
//!
//! Anything with a cached value and a dirty flag. `evaluate()` returns the
//! cached value, recomputing it first if the value is dirty. Two calls with no
//! dirty-mark in between return the same cached value and run no computation.
//!
//! ## Parameters
//!
//! A [`Parameter`] owns an update function supplied by the caller ("read the
//! current sensor value into this buffer"). Marking it dirty does not run the
//! function; the next evaluation does.
//!
//! ## Registry
//!
//! A [`Registry`] tracks parameters through weak handles so that a control
//! loop can invalidate all of them with one call per cycle.
//!
//! ## Wrapped expressions
//!
//! A [`WrappedExpression`] is a typed handle over any graph, used when the
//! caller stores expressions of different structure side by side.
//!
//! # Threading
//!
//! Values are `Send + Sync` so a graph can be moved to the thread that runs the
//! loop, but evaluating one graph from several threads at once is not
//! supported: callers serialize access themselves.

mod parameter;
mod registry;
mod wrapped;

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::MappedRwLockReadGuard;

use crate::error::EvalResult;

pub use parameter::{Parameter, ParameterId};
pub use registry::Registry;
pub use wrapped::WrappedExpression;

/// A value with a dirty flag and a cache.
pub trait Cacheable {
    /// The cached value type.
    type Output: ?Sized;

    /// Return the cached value, recomputing it first if it is stale.
    ///
    /// The returned guard borrows the cache. Drop it before the next call that
    /// may recompute this value.
    fn evaluate(&self) -> EvalResult<MappedRwLockReadGuard<'_, Self::Output>>;

    /// Force recomputation on the next evaluation. Idempotent.
    fn mark_dirty(&self);

    /// Whether the next evaluation recomputes this value.
    fn is_dirty(&self) -> bool;
}

/// A dirty flag that can be shared with a registry.
///
/// Starts dirty so the first evaluation always computes.
#[derive(Debug)]
pub struct DirtyFlag(AtomicBool);

impl DirtyFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for DirtyFlag {
    fn default() -> Self {
        Self::new()
    }
}
