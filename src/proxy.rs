//! Request dispatch: pick a backend, forward, or report exhaustion.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`] carrying structured fields for
//! observability. Dispatch only reads pool state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use hyper::{Request, Response};
use tracing::{info, warn, Instrument};

use crate::{BalancerError, BoxBody, Result, ServerPool, StdError};

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Dispatches a single inbound request.
///
/// Asks the pool for the next alive backend and relays the request through
/// that backend's forwarder. When no backend is alive, returns
/// [`BalancerError::NoAliveBackend`] without contacting any upstream.
/// Forwarding failures are returned as-is and never retried on another
/// backend.
pub async fn handle_request<B>(
    req: Request<B>,
    pool: ServerPool,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
    );

    async move {
        let Some(peer) = pool.next_peer() else {
            warn!("no alive backend, rejecting request");
            return Err(BalancerError::NoAliveBackend);
        };

        info!(upstream = %peer.url(), "dispatching request");
        peer.forwarder().forward(req, client_addr).await
    }
    .instrument(span)
    .await
}
