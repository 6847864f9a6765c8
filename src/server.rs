//! Server accept loop and shutdown signalling.
//!
//! Sits between the TCP listener and [`handle_request`]. Kept out of
//! `main()` so the serving path can be driven from tests without process
//! level concerns like signal handling or `std::process::exit`.

use std::future::Future;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{handle_request, BoxBody, ServerPool};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay between retries after `accept` fails, e.g. when the process is
/// out of file descriptors. Doubles on each consecutive failure.
#[derive(Debug, Default)]
struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self
            .delay
            .map_or(ACCEPT_BACKOFF_MIN, |d| (d * 2).min(ACCEPT_BACKOFF_MAX));
        self.delay = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.delay = None;
    }
}

/// Accepts connections on `listener` and dispatches every request through
/// the balancer.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently.
pub async fn serve(listener: TcpListener, pool: ServerPool, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    let mut backoff = AcceptBackoff::default();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => {
                        backoff.reset();
                        conn
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(%e, retry_in = ?delay, "failed to accept connection");
                        let stopped = tokio::select! {
                            _ = tokio::time::sleep(delay) => false,
                            () = &mut shutdown => true,
                        };
                        if stopped {
                            info!("shutting down, no longer accepting connections");
                            break;
                        }
                        continue;
                    }
                };

                let pool = pool.clone();

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let pool = pool.clone();
                        async move {
                            let resp = handle_request(req, pool, client_addr)
                                .await
                                .unwrap_or_else(|e| e.into_response());
                            Ok::<Response<BoxBody>, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .with_upgrades()
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
                }
            }
            Err(e) => {
                warn!(%e, "failed to register SIGTERM handler, waiting for Ctrl+C only");
                let _ = ctrl_c.await;
                info!("received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!(%e, "failed to listen for Ctrl+C");
        }
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
