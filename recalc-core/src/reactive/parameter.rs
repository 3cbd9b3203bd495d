//! Parameter Implementation
//!
//! A Parameter is a cacheable value whose content comes from outside the
//! expression graph, through an update function supplied by the caller.
//!
//! # How Parameters Work
//!
//! 1. A parameter starts dirty, holding the initial value it was created with.
//!    The initial value fixes its shape for the expression builder.
//!
//! 2. On evaluation, a dirty parameter runs its update function, bumps its
//!    version and clears the flag.
//!
//! 3. Operation nodes remember the version they last consumed, which is how
//!    they find out that a parameter changed underneath them.
//!
//! # Update Styles
//!
//! - In place (`FnMut(&mut T)`): writes into the existing value. This is the
//!   only style that keeps container-valued parameters allocation free.
//! - Replace (`FnMut() -> T`): produces a fresh value each time.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use super::registry::RegistryInner;
use super::{Cacheable, DirtyFlag};
use crate::error::{EvalError, EvalResult};
use crate::value::{Matrix, Value};

/// Unique identifier for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(u64);

impl ParameterId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

type InPlace<T> = Box<dyn FnMut(&mut T) + Send>;
type Replace<T> = Box<dyn FnMut() -> T + Send>;

enum Update<T> {
    InPlace(InPlace<T>),
    Replace(Replace<T>),
}

struct ParameterState<T> {
    value: T,
    /// Bumped every time the update function runs.
    version: u64,
}

struct ParameterInner<T> {
    id: ParameterId,
    name: OnceLock<String>,
    dirty: Arc<DirtyFlag>,
    state: RwLock<ParameterState<T>>,
    update: Mutex<Update<T>>,
    /// Back-reference to the owning registry; does not keep it alive.
    registry: Mutex<Option<Weak<RegistryInner>>>,
}

impl<T> Drop for ParameterInner<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.get_mut().take().and_then(|r| r.upgrade()) {
            registry.remove(self.id);
        }
    }
}

/// A cacheable value produced by a caller-supplied update function.
///
/// Cloning a parameter yields another handle to the same value.
///
/// # Example
///
/// ```rust,ignore
/// let registry = Registry::new();
/// let gain = Parameter::scalar(move || sensor.read());
/// registry.register(&gain);
///
/// registry.mark_all_dirty();
/// let g = *gain.evaluate()?;
/// ```
pub struct Parameter<T> {
    inner: Arc<ParameterInner<T>>,
}

impl<T> Parameter<T>
where
    T: Send + Sync + 'static,
{
    fn with_update(initial: T, update: Update<T>) -> Self {
        Self {
            inner: Arc::new(ParameterInner {
                id: ParameterId::new(),
                name: OnceLock::new(),
                dirty: Arc::new(DirtyFlag::new()),
                state: RwLock::new(ParameterState {
                    value: initial,
                    version: 0,
                }),
                update: Mutex::new(update),
                registry: Mutex::new(None),
            }),
        }
    }

    /// Create a parameter that updates its value in place.
    pub fn new<F>(initial: T, update: F) -> Self
    where
        F: FnMut(&mut T) + Send + 'static,
    {
        Self::with_update(initial, Update::InPlace(Box::new(update)))
    }

    /// Create a parameter whose update function produces a new value.
    pub fn from_fn<F>(initial: T, produce: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::with_update(initial, Update::Replace(Box::new(produce)))
    }

    /// Attach a name used in diagnostics. Only the first name sticks.
    pub fn named(self, name: impl Into<String>) -> Self {
        let _ = self.inner.name.set(name.into());
        self
    }

    pub fn id(&self) -> ParameterId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.get().map(String::as_str)
    }

    /// Number of times the update function has run.
    pub fn version(&self) -> u64 {
        self.inner.state.read_recursive().version
    }

    /// Run the update function if dirty and return the current version.
    pub(crate) fn refresh(&self) -> EvalResult<u64> {
        let inner = &*self.inner;
        if !inner.dirty.is_set() {
            return Ok(inner.state.read_recursive().version);
        }

        let mut state = inner.state.try_write().ok_or(EvalError::Busy {
            what: "parameter",
            id: inner.id.raw(),
        })?;
        inner.dirty.clear();

        let ParameterState { value, version } = &mut *state;
        match &mut *inner.update.lock() {
            Update::InPlace(update) => update(value),
            Update::Replace(produce) => *value = produce(),
        }
        *version += 1;
        Ok(*version)
    }

    /// Borrow the cached value without refreshing it.
    pub(crate) fn read(&self) -> MappedRwLockReadGuard<'_, T> {
        RwLockReadGuard::map(self.inner.state.read_recursive(), |s| &s.value)
    }

    pub(crate) fn dirty_flag(&self) -> &Arc<DirtyFlag> {
        &self.inner.dirty
    }

    /// Replace the registry back-reference, returning the previous one.
    pub(crate) fn set_registry(&self, registry: Weak<RegistryInner>) -> Option<Weak<RegistryInner>> {
        self.inner.registry.lock().replace(registry)
    }
}

impl Parameter<Value> {
    /// A scalar parameter.
    pub fn scalar<F>(mut produce: F) -> Self
    where
        F: FnMut() -> f64 + Send + 'static,
    {
        Self::new(Value::Scalar(0.0), move |value| {
            *value = Value::Scalar(produce());
        })
    }

    /// A vector parameter of length `len`, filled in place.
    ///
    /// The closure receives the whole buffer. If something else replaced the
    /// value with another kind, the buffer is recreated at `len`.
    pub fn vector<F>(len: usize, mut fill: F) -> Self
    where
        F: FnMut(&mut [f64]) + Send + 'static,
    {
        Self::new(Value::Vector(vec![0.0; len]), move |value| match value {
            Value::Vector(v) => fill(v),
            other => {
                let mut v = vec![0.0; len];
                fill(&mut v);
                *other = Value::Vector(v);
            }
        })
    }

    /// A `rows x cols` matrix parameter, filled in place.
    pub fn matrix<F>(rows: usize, cols: usize, mut fill: F) -> Self
    where
        F: FnMut(&mut Matrix) + Send + 'static,
    {
        Self::new(Value::Matrix(Matrix::zeros(rows, cols)), move |value| match value {
            Value::Matrix(m) => fill(m),
            other => {
                let mut m = Matrix::zeros(rows, cols);
                fill(&mut m);
                *other = Value::Matrix(m);
            }
        })
    }
}

impl<T> Cacheable for Parameter<T>
where
    T: Send + Sync + 'static,
{
    type Output = T;

    fn evaluate(&self) -> EvalResult<MappedRwLockReadGuard<'_, T>> {
        self.refresh()?;
        Ok(self.read())
    }

    fn mark_dirty(&self) {
        self.inner.dirty.mark();
    }

    fn is_dirty(&self) -> bool {
        self.inner.dirty.is_set()
    }
}

impl<T> Clone for Parameter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Parameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("id", &self.inner.id.raw())
            .field("name", &self.inner.name.get())
            .field("dirty", &self.inner.dirty.is_set())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
