//! Active liveness probing.
//!
//! A [`HealthChecker`] sweeps the pool on a fixed interval, opening a TCP
//! connection to every backend and closing it immediately. The outcome of
//! the latest probe is written back through the pool: one failure
//! marks it dead, one success marks it alive again. There is no hysteresis,
//! so a backend on a flaky network can flap between sweeps.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{HealthCheckSettings, ProbeMode};
use crate::ServerPool;

/// Periodically refreshes the liveness of every backend in a pool.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    pool: ServerPool,
    settings: HealthCheckSettings,
}

impl HealthChecker {
    /// Creates a checker over `pool`.
    pub fn new(pool: ServerPool, settings: HealthCheckSettings) -> Self {
        Self { pool, settings }
    }

    /// Runs sweeps every interval until `shutdown` receives a message or
    /// its sender is dropped. The first sweep happens one full interval
    /// after start; until then every backend keeps its initial state.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval = ?self.settings.interval,
            timeout = ?self.settings.timeout,
            mode = ?self.settings.mode,
            "health checker starting"
        );

        let start = time::Instant::now() + self.settings.interval;
        let mut ticker = time::interval_at(start, self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.recv() => {
                    info!("health checker received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Performs one sweep over the whole pool.
    pub async fn check_all(&self) {
        info!("starting health check");
        match self.settings.mode {
            ProbeMode::Sequential => self.check_sequential().await,
            ProbeMode::Concurrent => self.check_concurrent().await,
        }
        info!(
            alive = self.pool.alive_count(),
            total = self.pool.len(),
            "health check completed"
        );
    }

    async fn check_sequential(&self) {
        for backend in self.pool.backends() {
            let alive = is_backend_alive(backend.url(), self.settings.timeout).await;
            record(&self.pool, backend.url(), alive);
        }
    }

    async fn check_concurrent(&self) {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_probes.max(1)));
        let mut probes = JoinSet::new();

        for backend in self.pool.backends() {
            let url = backend.url().clone();
            let pool = self.pool.clone();
            let permits = Arc::clone(&permits);
            let timeout = self.settings.timeout;
            probes.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                let alive = is_backend_alive(&url, timeout).await;
                record(&pool, &url, alive);
            });
        }

        while let Some(result) = probes.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "health probe task failed");
            }
        }
    }
}

fn record(pool: &ServerPool, url: &hyper::Uri, alive: bool) {
    if !pool.mark_backend_status(url, alive) {
        warn!(backend = %url, "probed backend is not in the pool");
        return;
    }
    let status = if alive { "up" } else { "down" };
    info!(backend = %url, status, "backend status");
}

/// Spawns a [`HealthChecker`] as a background task.
pub fn spawn_health_checker(
    pool: ServerPool,
    settings: HealthCheckSettings,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(HealthChecker::new(pool, settings).run(shutdown))
}

/// Attempts a TCP connection to the host and port of `url`, closing it
/// straight away. Returns `false` on any error or if `timeout` elapses.
pub async fn is_backend_alive(url: &hyper::Uri, timeout: Duration) -> bool {
    let Some(host) = url.host() else {
        warn!(backend = %url, "backend has no host to probe");
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port_u16().unwrap_or(80);

    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            warn!(backend = %url, error = %e, "site unreachable");
            false
        }
        Err(_) => {
            warn!(backend = %url, timeout = ?timeout, "site unreachable, probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn probe_succeeds_against_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap())
            .parse::<hyper::Uri>()
            .unwrap();
        assert!(is_backend_alive(&url, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn probe_fails_against_closed_port() {
        let port = closed_port().await;
        let url = format!("http://127.0.0.1:{port}").parse::<hyper::Uri>().unwrap();
        assert!(!is_backend_alive(&url, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn probe_handles_bracketed_ipv6_host() {
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            return;
        };
        let url = format!("http://{}", listener.local_addr().unwrap())
            .parse::<hyper::Uri>()
            .unwrap();
        assert!(is_backend_alive(&url, Duration::from_secs(2)).await);
    }
}
