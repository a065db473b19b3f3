//! DIContainer — lazy, cached service registry.
//!
//! Services are registered as factories and built on first [`DiContainer::get`],
//! then cached for the container's lifetime. Grounded verbatim on
//! `core_runtime/di_container.py`: `register`/`get`/`get_or_none`/`has`/
//! `registered_names`/`reset`/`reset_all`/`set_instance` all carry over with
//! the same semantics, adapted to Rust's static typing via `Any` downcasting.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

type Factory = Box<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

enum Entry {
    Factory(Factory),
    Cached(Arc<dyn Any + Send + Sync>),
}

/// A lazily-instantiated, process-wide service registry.
///
/// Unlike a typed DI framework, entries are registered and fetched by
/// string name; callers downcast via [`DiContainer::get`]'s type parameter.
/// A single internal lock serializes registration and instantiation, which
/// is sufficient because factories here are cheap constructors, not
/// long-running work.
pub struct DiContainer {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for DiContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl DiContainer {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Register a factory under `name`. Overwrites any previous
    /// registration (and drops its cached instance, if any).
    pub fn register<T, F>(&self, name: impl Into<String>, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let boxed: Factory = Box::new(move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>);
        self.entries.lock().insert(name.into(), Entry::Factory(boxed));
    }

    /// Fetch (building and caching on first call) the service registered
    /// under `name`. Errors if nothing is registered or the cached value's
    /// concrete type doesn't match `T`.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let mut entries = self.entries.lock();
        let instance = match entries.get(name) {
            Some(Entry::Cached(v)) => v.clone(),
            Some(Entry::Factory(f)) => {
                let built = f();
                entries.insert(name.to_string(), Entry::Cached(built.clone()));
                built
            }
            None => return Err(Error::Internal(format!("no service registered under '{name}'"))),
        };
        instance
            .downcast::<T>()
            .map_err(|_| Error::Internal(format!("service '{name}' is not of the requested type")))
    }

    /// Like [`Self::get`], but returns `None` on any failure instead of an
    /// error — mirrors `get_or_none`'s fail-soft downstream-safety role.
    pub fn get_or_none<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).ok()
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop a single entry's registration (and any cached instance).
    pub fn reset(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    pub fn reset_all(&self) {
        self.entries.lock().clear();
    }

    /// Register a pre-built instance directly, bypassing the factory and
    /// lazy-construction path. Primarily used in tests to inject fakes.
    pub fn set_instance<T: Send + Sync + 'static>(&self, name: impl Into<String>, instance: T) {
        self.entries
            .lock()
            .insert(name.into(), Entry::Cached(Arc::new(instance)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn get_builds_once_and_caches() {
        let container = DiContainer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        container.register("widget", move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            42u32
        });

        let a = container.get::<u32>("widget").unwrap();
        let b = container.get::<u32>("widget").unwrap();
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_missing_is_error_but_get_or_none_is_none() {
        let container = DiContainer::new();
        assert!(container.get::<u32>("missing").is_err());
        assert!(container.get_or_none::<u32>("missing").is_none());
    }

    #[test]
    fn reset_drops_cached_instance_and_rebuilds() {
        let container = DiContainer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        container.register("widget", move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            calls_clone.load(Ordering::SeqCst)
        });

        assert_eq!(*container.get::<usize>("widget").unwrap(), 1);
        container.reset("widget");
        assert_eq!(*container.get::<usize>("widget").unwrap(), 2);
    }

    #[test]
    fn set_instance_bypasses_factory() {
        let container = DiContainer::new();
        container.set_instance("widget", 7u32);
        assert_eq!(*container.get::<u32>("widget").unwrap(), 7);
    }

    #[test]
    fn registered_names_is_sorted() {
        let container = DiContainer::new();
        container.register("b", || 1u32);
        container.register("a", || 1u32);
        assert_eq!(container.registered_names(), vec!["a".to_string(), "b".to_string()]);
        assert!(container.has("a"));
        assert!(!container.has("z"));
    }
}
