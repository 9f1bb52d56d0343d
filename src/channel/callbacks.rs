use std::sync::Arc;

use parking_lot::RwLock;

/// Observer list with copy-on-write snapshots.
///
/// Fan-out iterates a snapshot taken before delivery, so listeners may register or
/// unregister concurrently (or from inside a callback) without double delivery.
pub struct ThreadSafeCallbacks<C: ?Sized> {
    callbacks: RwLock<Arc<Vec<Arc<C>>>>,
}

impl<C: ?Sized> ThreadSafeCallbacks<C> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Adds `callback`; returns `false` if this exact instance is already registered.
    pub fn register(&self, callback: Arc<C>) -> bool {
        let mut guard = self.callbacks.write();
        if guard.iter().any(|existing| same(existing, &callback)) {
            return false;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(callback);
        *guard = Arc::new(next);
        true
    }

    pub fn unregister(&self, callback: &Arc<C>) -> bool {
        let mut guard = self.callbacks.write();
        if !guard.iter().any(|existing| same(existing, callback)) {
            return false;
        }
        let next: Vec<Arc<C>> = guard
            .iter()
            .filter(|existing| !same(existing, callback))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<C>>> {
        self.callbacks.read().clone()
    }

    pub fn for_each(&self, mut f: impl FnMut(&C)) {
        for callback in self.snapshot().iter() {
            f(callback.as_ref());
        }
    }

    pub fn clear(&self) {
        *self.callbacks.write() = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: ?Sized> Default for ThreadSafeCallbacks<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn same<C: ?Sized>(a: &Arc<C>, b: &Arc<C>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}
