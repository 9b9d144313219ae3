//! Method registry
//!
//! A bounded name-to-handler table guarded by a mutex. Lookup clones the
//! handler reference out so the caller invokes it after the lock is
//! released; a handler therefore never runs with its slot concurrently
//! being replaced or freed.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use log::warn;
use serde_json::Value;

/// Maximum number of registered methods. Registrations of new names beyond
/// this are silently ignored; replacing an existing name always succeeds.
pub const MAX_METHODS: usize = 100;

/// A user-supplied method implementation.
///
/// The handler receives ownership of the request `params` and returns either
/// an owned result value or `None`, the explicit "no result" sentinel
/// (distinct from `Some(Value::Null)`). Handlers may be invoked concurrently
/// on distinct worker threads.
pub type Handler = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;

struct Method {
    name: String,
    handler: Handler,
}

pub(crate) struct Registry {
    methods: Mutex<Vec<Method>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            methods: Mutex::new(Vec::new()),
        }
    }

    /// Insert-or-replace. Safe to call before or after server start, from
    /// any thread. A registration that completes before a request arrives is
    /// visible to the dispatching worker (happens-before via this mutex).
    pub(crate) fn register(&self, name: &str, handler: Handler) {
        if name.is_empty() {
            warn!("ignoring registration with empty method name");
            return;
        }
        let mut methods = self.methods.lock().unwrap();
        if let Some(method) = methods.iter_mut().find(|m| m.name == name) {
            method.handler = handler;
            return;
        }
        if methods.len() >= MAX_METHODS {
            warn!("method table full ({MAX_METHODS} entries), ignoring {name:?}");
            return;
        }
        methods.push(Method {
            name: name.to_owned(),
            handler,
        });
    }

    /// Linear scan under the lock; byte-exact name comparison. The returned
    /// clone is usable without holding the lock.
    pub(crate) fn lookup(&self, name: &str) -> Option<Handler> {
        let methods = self.methods.lock().unwrap();
        methods
            .iter()
            .find(|m| m.name == name)
            .map(|m| Arc::clone(&m.handler))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.methods.lock().unwrap().len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = self.methods.lock().unwrap();
        f.debug_struct("Registry")
            .field("methods", &methods.len())
            .finish()
    }
}
