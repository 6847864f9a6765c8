//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backends, pool builders, and small helpers
//! used across all integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use roundabout::{BoxBody, HttpClient, ServerPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

pub fn test_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Builds a pool over plain `http://` backends at the given addresses.
pub fn test_pool(addrs: &[SocketAddr]) -> ServerPool {
    test_pool_with_timeout(addrs, None)
}

/// Like [`test_pool`], with a forwarding deadline.
pub fn test_pool_with_timeout(addrs: &[SocketAddr], timeout: Option<Duration>) -> ServerPool {
    let urls = addrs
        .iter()
        .map(|addr| format!("http://{addr}").parse().unwrap())
        .collect::<Vec<hyper::Uri>>();
    ServerPool::from_urls(&urls, &test_client(), timeout).expect("test pool must be valid")
}

/// Returns an address on localhost with nothing listening on it.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind probe port");
    listener.local_addr().unwrap()
}

/// Serves every accepted connection on `listener` with `handler` until
/// `rx` fires. Also counts accepted connections in `accepted`.
fn spawn_backend<F, Fut>(
    listener: TcpListener,
    rx: oneshot::Receiver<()>,
    accepted: Arc<AtomicUsize>,
    handler: F,
) where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let handler = handler.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move { Ok::<_, std::convert::Infallible>(handler(req).await) }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });
}

async fn bind_local() -> TcpListener {
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend")
}

/// Starts a local HTTP server that responds to every request with the given
/// status and plain-text body. Returns the server address and a handle
/// to shut it down.
pub async fn start_backend(
    status: StatusCode,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (addr, tx, _) = start_counting_backend(status, body).await;
    (addr, tx)
}

/// Like [`start_backend`], also returning a counter of accepted TCP
/// connections.
pub async fn start_counting_backend(
    status: StatusCode,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>, Arc<AtomicUsize>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = bind_local().await;
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    spawn_backend(listener, rx, Arc::clone(&accepted), move |_req| async move {
        Response::builder()
            .status(status)
            .header("content-type", "text/plain")
            .header("x-backend", "fixed")
            .body(Full::new(Bytes::from(body)))
            .expect("test response must build")
    });

    (addr, tx, accepted)
}

/// Starts a backend that echoes the method, URI, sorted headers, and body
/// of each request. Used to verify that forwarding is transparent.
pub async fn start_echo_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = bind_local().await;
    let addr = listener.local_addr().unwrap();

    spawn_backend(listener, rx, Arc::new(AtomicUsize::new(0)), |req| async move {
        let (parts, body) = req.into_parts();
        let mut lines = vec![format!("{} {}", parts.method, parts.uri)];
        let mut headers = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| format!("{}: {}", name.as_str(), v))
            })
            .collect::<Vec<_>>();
        headers.sort();
        lines.extend(headers);
        let body = body
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();
        lines.push(String::from_utf8_lossy(&body).into_owned());

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(lines.join("\n"))))
            .expect("test response must build")
    });

    (addr, tx)
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(delay: Duration) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = bind_local().await;
    let addr = listener.local_addr().unwrap();

    spawn_backend(listener, rx, Arc::new(AtomicUsize::new(0)), move |_req| async move {
        tokio::time::sleep(delay).await;
        Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("slow")))
            .expect("test response must build")
    });

    (addr, tx)
}

/// Starts a backend that accepts any `Upgrade` request with
/// `101 Switching Protocols` and then echoes raw bytes on the upgraded
/// connection. Requests without an upgrade get `400`.
pub async fn start_upgrade_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = bind_local().await;
    let addr = listener.local_addr().unwrap();

    spawn_backend(listener, rx, Arc::new(AtomicUsize::new(0)), |mut req| async move {
        let Some(proto) = req.headers().get(UPGRADE).cloned() else {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from("expected an upgrade")))
                .expect("test response must build");
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            let Ok(upgraded) = on_upgrade.await else {
                return;
            };
            let mut io = TokioIo::new(upgraded);
            let mut buf = [0u8; 1024];
            loop {
                match io.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if io.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, proto)
            .body(Full::new(Bytes::new()))
            .expect("test response must build")
    });

    (addr, tx)
}
