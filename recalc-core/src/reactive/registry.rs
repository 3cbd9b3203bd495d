//! Parameter Registry
//!
//! The registry is the model-side owner of "everything that must be refreshed
//! once per cycle". It holds weak handles to the dirty flags of its
//! parameters, never the parameters themselves, so it neither keeps them alive
//! nor is kept alive by them.
//!
//! # How It Works
//!
//! 1. `register` records the parameter's dirty flag and gives the parameter a
//!    weak back-reference to the registry.
//!
//! 2. `mark_all_dirty` sets every live flag. Operation nodes are not touched;
//!    they notice the new parameter versions the next time they are evaluated.
//!
//! 3. When the last handle of a parameter is dropped, it removes itself.

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use super::parameter::{Parameter, ParameterId};
use super::DirtyFlag;

#[derive(Default)]
pub(crate) struct RegistryInner {
    parameters: Mutex<IndexMap<ParameterId, Weak<DirtyFlag>>>,
}

impl RegistryInner {
    pub(crate) fn remove(&self, id: ParameterId) {
        self.parameters.lock().shift_remove(&id);
    }
}

/// A set of parameters that can be invalidated together.
///
/// Cloning a registry yields another handle to the same set.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter to this registry.
    ///
    /// A parameter belongs to at most one registry; registering it here
    /// removes it from the previous one.
    pub fn register<T>(&self, parameter: &Parameter<T>)
    where
        T: Send + Sync + 'static,
    {
        let id = parameter.id();
        let previous = parameter.set_registry(Arc::downgrade(&self.inner));
        if let Some(previous) = previous.and_then(|r| r.upgrade()) {
            if !Arc::ptr_eq(&previous, &self.inner) {
                previous.remove(id);
            }
        }

        self.inner
            .parameters
            .lock()
            .insert(id, Arc::downgrade(parameter.dirty_flag()));

        debug!(parameter = id.raw(), name = parameter.name(), "registered parameter");
    }

    /// Mark every registered parameter dirty.
    ///
    /// Returns the number of live parameters marked. Entries of dropped
    /// parameters are pruned.
    pub fn mark_all_dirty(&self) -> usize {
        let mut parameters = self.inner.parameters.lock();
        parameters.retain(|_, flag| match flag.upgrade() {
            Some(flag) => {
                flag.mark();
                true
            }
            None => false,
        });
        let count = parameters.len();
        drop(parameters);

        debug!(count, "marked parameters dirty");
        count
    }

    /// Whether the parameter is registered here.
    pub fn contains(&self, id: ParameterId) -> bool {
        self.inner.parameters.lock().contains_key(&id)
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.inner.parameters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("parameters", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Cacheable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_parameter(calls: &Arc<AtomicUsize>) -> Parameter<f64> {
        let calls = calls.clone();
        Parameter::from_fn(0.0, move || calls.fetch_add(1, Ordering::SeqCst) as f64)
    }

    #[test]
    fn registry_marks_all_parameters() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = counting_parameter(&calls);
        let b = counting_parameter(&calls);
        registry.register(&a);
        registry.register(&b);

        a.evaluate().unwrap();
        b.evaluate().unwrap();
        assert!(!a.is_dirty() && !b.is_dirty());

        assert_eq!(registry.mark_all_dirty(), 2);
        assert!(a.is_dirty() && b.is_dirty());

        a.evaluate().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dropped_parameter_unregisters() {
        let registry = Registry::new();
        let p = Parameter::from_fn(0.0, || 1.0);
        let id = p.id();
        registry.register(&p);
        assert!(registry.contains(id));

        let clone = p.clone();
        drop(p);
        assert!(registry.contains(id));

        drop(clone);
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_does_not_keep_parameters_alive() {
        let p = Parameter::from_fn(0.0, || 1.0);
        {
            let registry = Registry::new();
            registry.register(&p);
        }
        // The registry is gone; the parameter still works and can be dirtied.
        p.mark_dirty();
        assert_eq!(*p.evaluate().unwrap(), 1.0);
    }

    #[test]
    fn reregistering_moves_parameter() {
        let first = Registry::new();
        let second = Registry::new();
        let p = Parameter::from_fn(0.0, || 1.0);

        first.register(&p);
        second.register(&p);

        assert!(!first.contains(p.id()));
        assert!(second.contains(p.id()));
        assert_eq!(first.mark_all_dirty(), 0);
    }

    #[test]
    fn unregistered_parameter_is_valid() {
        let registry = Registry::new();
        let p = Parameter::from_fn(0.0, || 3.0);
        assert_eq!(*p.evaluate().unwrap(), 3.0);
        registry.mark_all_dirty();
        assert!(!p.is_dirty());
    }
}
