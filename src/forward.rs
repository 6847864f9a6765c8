//! Transparent request forwarding to a single backend.
//!
//! A [`Forwarder`] is bound to one backend URI when the pool is built and
//! never changes afterwards. It rewrites the request target onto the
//! backend, drops connection-scoped headers (RFC 7230 Section 6.1), records
//! the client address in `X-Forwarded-For`, and streams both bodies through
//! without buffering.
//!
//! Protocol upgrades (`Connection: upgrade`, e.g. WebSocket) are the one
//! exception to hop-by-hop stripping: the `Upgrade` token is carried to the
//! backend, and once it answers `101 Switching Protocols` the client and
//! backend connections are spliced together byte for byte.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

use crate::{BalancerError, BoxBody, Result, RuntimeConfig, StdError};

/// The HTTP client type shared by every backend's forwarder.
pub type HttpClient = Client<HttpConnector, BoxBody>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Constructs the pooled upstream client used by all forwarders.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(HttpConnector::new())
}

/// Relays requests to one fixed backend.
#[derive(Debug, Clone)]
pub struct Forwarder {
    target: Uri,
    client: HttpClient,
    timeout: Option<Duration>,
}

impl Forwarder {
    /// Binds a forwarder to `target`. When `timeout` is `None` the
    /// round-trip is bounded only by the backend itself.
    pub fn new(target: Uri, client: HttpClient, timeout: Option<Duration>) -> Self {
        Self {
            target,
            client,
            timeout,
        }
    }

    /// The backend URI this forwarder relays to.
    pub fn target(&self) -> &Uri {
        &self.target
    }

    /// Relays `req` to the backend and returns its response verbatim,
    /// apart from hop-by-hop headers.
    ///
    /// An upgrade request keeps its `Upgrade` header. If the backend
    /// switches protocols, a background task tunnels the two upgraded
    /// connections until either side closes.
    pub async fn forward<B>(
        &self,
        mut req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<StdError>,
    {
        let client_upgrade =
            requested_upgrade(req.headers()).map(|proto| (proto, hyper::upgrade::on(&mut req)));
        let (mut parts, body) = req.into_parts();

        parts.uri = rewrite_uri(&parts.uri, &self.target)?;
        strip_hop_by_hop(&mut parts.headers);
        if let Some((proto, _)) = &client_upgrade {
            restore_upgrade(&mut parts.headers, proto.clone());
        }
        append_forwarded_for(&mut parts.headers, client_addr);

        debug!(upstream_uri = %parts.uri, headers = ?parts.headers, "forwarding request");

        let proxy_req = Request::from_parts(parts, body.map_err(|e| e.into()).boxed());
        let start = Instant::now();
        let pending = self.client.request(proxy_req);

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    warn!(
                        timeout = ?limit,
                        upstream = %self.target,
                        "upstream request timed out"
                    );
                    return Err(BalancerError::Timeout(limit));
                }
            },
            None => pending.await,
        };

        let mut resp = result.map_err(|e| {
            warn!(
                error = %e,
                latency_ms = start.elapsed().as_millis() as u64,
                upstream = %self.target,
                "upstream request failed"
            );
            BalancerError::Upstream(e)
        })?;

        debug!(
            status = resp.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            upstream = %self.target,
            "upstream responded"
        );

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some((requested, downstream)) = client_upgrade else {
                warn!(upstream = %self.target, "backend switched protocols unasked");
                return Err(BalancerError::UnrequestedUpgrade);
            };
            let proto = resp.headers().get(UPGRADE).cloned().unwrap_or(requested);
            let upstream = hyper::upgrade::on(&mut resp);
            strip_hop_by_hop(resp.headers_mut());
            restore_upgrade(resp.headers_mut(), proto);
            spawn_tunnel(downstream, upstream, self.target.clone());
        } else {
            strip_hop_by_hop(resp.headers_mut());
        }

        Ok(resp.map(|body| body.map_err(|e| -> StdError { Box::new(e) }).boxed()))
    }
}

/// Returns the `Upgrade` value when `Connection` carries the `upgrade`
/// token.
fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|val| val.to_str().ok())
        .flat_map(|val| val.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn restore_upgrade(headers: &mut HeaderMap, proto: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, proto);
}

/// Copies bytes both ways between the client and the backend once both
/// halves of the handshake have completed.
fn spawn_tunnel(downstream: OnUpgrade, upstream: OnUpgrade, target: Uri) {
    tokio::spawn(async move {
        let (client, backend) = match tokio::try_join!(downstream, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, upstream = %target, "protocol upgrade failed");
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut backend = TokioIo::new(backend);
        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok((sent, received)) => {
                debug!(upstream = %target, sent, received, "upgraded connection closed")
            }
            Err(e) => debug!(error = %e, upstream = %target, "upgraded connection aborted"),
        }
    });
}

/// Maps an inbound request URI onto `target`: scheme and authority come
/// from the backend, the path is the backend base path joined to the
/// request path, and both query strings are kept.
fn rewrite_uri(original: &Uri, target: &Uri) -> Result<Uri> {
    let authority = target
        .authority()
        .ok_or_else(|| BalancerError::InvalidBackend(format!("{target} has no authority")))?;
    let scheme = target
        .scheme()
        .ok_or_else(|| BalancerError::InvalidBackend(format!("{target} has no scheme")))?;

    let path = join_paths(target.path(), original.path());
    let path_and_query = match (target.query(), original.query()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => format!("{path}?{a}&{b}"),
        (Some(q), _) | (_, Some(q)) if !q.is_empty() => format!("{path}?{q}"),
        _ => path,
    };

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| BalancerError::Internal(format!("failed to build upstream URI: {e}")))
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Removes hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let declared = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|val| val.to_str().ok())
        .flat_map(|val| val.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect::<Vec<_>>();

    for name in declared {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Appends the client IP to `X-Forwarded-For`, folding any prior values
/// into a single comma-separated header.
fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let prior = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");

    let value = if prior.is_empty() {
        client_ip
    } else {
        format!("{prior}, {client_ip}")
    };

    if let Ok(val) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, val);
    }
}
