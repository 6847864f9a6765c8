//!
//! A round-robin HTTP load balancer built on [Hyper].
//!
//! Requests are spread across a fixed pool of backends, skipping any the
//! background [`HealthChecker`] last found unreachable, and relayed to the
//! chosen backend unmodified.
//!
//! [Hyper]: https://hyper.rs/

pub mod backend;
pub mod config;
pub mod error;
pub mod forward;
pub mod pool;
pub mod prober;
pub mod proxy;
pub mod server;

pub use backend::Backend;
pub use config::{Config, HealthCheckConfig, HealthCheckSettings, ProbeMode, RuntimeConfig};
pub use error::BalancerError;
pub use forward::{build_client, Forwarder, HttpClient};
pub use pool::ServerPool;
pub use prober::{is_backend_alive, spawn_health_checker, HealthChecker};
pub use proxy::handle_request;
pub use server::{serve, shutdown_signal};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
pub type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for both request forwarding and response streaming.
///
/// Lets the dispatcher accept requests with arbitrary body types
/// (e.g. `Incoming`, `Full<Bytes>`, `Empty<Bytes>`) and return a uniform
/// response type whether it came from a backend or was built locally.
pub type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, StdError>;

/// A specialized `Result` type for balancer operations.
pub type Result<T> = std::result::Result<T, BalancerError>;
