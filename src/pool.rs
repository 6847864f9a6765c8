//! Round-robin backend pool.
//!
//! Distributes requests across alive backends in configuration order using
//! a single shared [`AtomicUsize`] cursor for lock-free selection. The
//! cursor holds the index of the last dispatched backend; each selection
//! increments it and scans forward from the result, skipping dead
//! backends.
//!
//! When the incremented candidate is dead and a later backend is chosen,
//! the cursor is overwritten with the chosen index so that the next caller
//! starts past the dead span instead of walking it again. That store is
//! not synchronized with concurrent increments. The cursor is only a hint;
//! correctness comes from the scan, which always checks every backend and
//! always reduces modulo the pool length.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::{BalancerError, Backend, Forwarder, HttpClient, Result};

/// A fixed, ordered set of backends plus the shared rotation cursor.
///
/// Cloning is cheap and clones share both the backends and the cursor, so
/// the dispatcher and the prober can each hold one.
#[derive(Debug, Clone)]
pub struct ServerPool {
    backends: Arc<Vec<Backend>>,
    /// Index of the last dispatched backend, interpreted modulo the length.
    current: Arc<AtomicUsize>,
}

impl ServerPool {
    /// Creates a pool over `backends`, in the given order.
    ///
    /// Fails with [`BalancerError::Config`] if `backends` is empty.
    pub fn new(backends: Vec<Backend>) -> Result<Self> {
        if backends.is_empty() {
            return Err(BalancerError::Config(
                "please provide one or more backends to load balance".into(),
            ));
        }

        Ok(Self {
            backends: Arc::new(backends),
            current: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Builds one alive [`Backend`] per URI, all sharing `client`.
    pub fn from_urls(
        urls: &[hyper::Uri],
        client: &HttpClient,
        forward_timeout: Option<Duration>,
    ) -> Result<Self> {
        let backends = urls
            .iter()
            .map(|url| {
                info!(backend = %url, "configured server");
                Backend::new(Forwarder::new(url.clone(), client.clone(), forward_timeout))
            })
            .collect();
        Self::new(backends)
    }

    /// Selects the next alive backend, or `None` if every backend is dead.
    pub fn next_peer(&self) -> Option<Backend> {
        let len = self.backends.len();
        if len == 0 {
            return None;
        }

        let next = self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % len;

        (next..next + len)
            .map(|i| i % len)
            .find(|&idx| self.backends[idx].is_alive())
            .map(|idx| {
                if idx != next {
                    self.current.store(idx, Ordering::Relaxed);
                }
                self.backends[idx].clone()
            })
    }

    /// Sets the liveness of every backend whose URI equals `url`. This is
    /// how probe results reach the pool.
    ///
    /// Returns `false` if no such backend is configured.
    pub fn mark_backend_status(&self, url: &hyper::Uri, alive: bool) -> bool {
        let mut found = false;
        for backend in self.backends.iter().filter(|b| b.url() == url) {
            backend.set_alive(alive);
            found = true;
        }
        found
    }

    /// Returns all backends in configuration order.
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Returns the number of backends currently marked alive.
    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    /// Returns the raw cursor value (last dispatched index, unreduced).
    pub fn cursor(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Returns the number of configured backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always `false` for a successfully constructed pool.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
