//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use hyper::{Response, StatusCode};

use crate::{BoxBody, StdError};

/// Body returned to clients when every backend is believed dead.
pub const SERVICE_UNAVAILABLE_BODY: &str = "Service not available";

/// Every failure the balancer can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum BalancerError {
    /// The configuration file could not be loaded, parsed, or validated.
    Config(String),
    /// A configured backend URL is malformed or unusable.
    InvalidBackend(String),
    /// No backend in the pool is currently alive.
    NoAliveBackend,
    /// The selected backend failed while relaying the request.
    Upstream(hyper_util::client::legacy::Error),
    /// The upstream round-trip exceeded the configured forwarding timeout.
    Timeout(Duration),
    /// The backend answered `101 Switching Protocols` to a request that did
    /// not ask for an upgrade.
    UnrequestedUpgrade,
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidBackend(msg) => write!(f, "invalid backend: {msg}"),
            Self::NoAliveBackend => f.write_str(SERVICE_UNAVAILABLE_BODY),
            Self::Upstream(err) => write!(f, "upstream error: {err}"),
            Self::Timeout(limit) => write!(f, "upstream timed out after {limit:?}"),
            Self::UnrequestedUpgrade => f.write_str("upstream switched protocols unrequested"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for BalancerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upstream(err) => Some(err),
            _ => None,
        }
    }
}

impl BalancerError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidBackend(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NoAliveBackend => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) | Self::UnrequestedUpgrade => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Converts this error into a plain-text HTTP response.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();
        let body = Full::new(Bytes::from(format!("{self}\n")))
            .map_err(|never| -> StdError { match never {} })
            .boxed();

        let mut response = Response::new(body);
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        response
    }
}
