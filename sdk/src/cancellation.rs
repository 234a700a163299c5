//! Cancellation scopes.
//!
//! A scope owns the cancellation handles of the operations created within
//! it. Cancelling the scope fires each handle exactly once and cascades to
//! child scopes; the cancellation surfaces in workflow code as cancelled
//! failures at the next suspension point. The root scope of a workflow is
//! cancelled when the execution receives a cancel request.

use crate::promise::CancelOnce;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Default)]
struct ScopeInner {
    canceled: AtomicBool,
    handles: Mutex<Vec<Arc<CancelOnce>>>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
}

/// A cancellation scope. Cloning shares the scope.
#[derive(Clone, Default)]
pub struct CancellationScope {
    inner: Arc<ScopeInner>,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A child scope that is cancelled when this scope is cancelled.
    pub fn new_child(&self) -> Self {
        let child = Self::new();
        if self.is_cancel_requested() {
            child.cancel();
        } else {
            self.inner
                .children
                .lock()
                .push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Own a cancellation handle. Registration after cancellation fires the
    /// handle immediately.
    pub(crate) fn register(&self, handle: Arc<CancelOnce>) {
        if self.is_cancel_requested() {
            handle.invoke();
            return;
        }
        self.inner.handles.lock().push(handle);
    }

    /// Cancel every owned operation and cascade to children. Idempotent.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            handle.invoke();
        }
        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                CancellationScope { inner: child }.cancel();
            }
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }
}
