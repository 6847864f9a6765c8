//! Per-backend liveness state.
//!
//! Each backend is represented by a [`Backend`] holding its URI, the
//! [`Forwarder`] bound to it, and a liveness flag behind its own
//! [`RwLock`]. Locking is per backend, so a write to one flag never
//! delays reads of another.

use std::sync::{Arc, PoisonError, RwLock};

use crate::Forwarder;

/// Runtime state for a single backend. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    url: hyper::Uri,
    alive: RwLock<bool>,
    forwarder: Forwarder,
}

impl Backend {
    /// Creates a backend that starts out alive.
    pub fn new(forwarder: Forwarder) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: forwarder.target().clone(),
                alive: RwLock::new(true),
                forwarder,
            }),
        }
    }

    /// Returns the backend URI.
    pub fn url(&self) -> &hyper::Uri {
        &self.inner.url
    }

    /// Returns the forwarder bound to this backend.
    pub fn forwarder(&self) -> &Forwarder {
        &self.inner.forwarder
    }

    /// Overwrites the liveness flag.
    pub fn set_alive(&self, alive: bool) {
        // A bool cannot be left half-written, so a poisoned lock is still usable.
        *self
            .inner
            .alive
            .write()
            .unwrap_or_else(PoisonError::into_inner) = alive;
    }

    /// Returns `true` if the last probe (or startup) saw this backend reachable.
    pub fn is_alive(&self) -> bool {
        *self
            .inner
            .alive
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
