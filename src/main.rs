use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use roundabout::{build_client, serve, shutdown_signal, spawn_health_checker, Config, ServerPool};

const CONFIG_FILE_PATH: &str = "./Config.yml";

fn fatal(msg: impl std::fmt::Display) -> ! {
    error!("fatal: {msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_FILE_PATH.into());
    let config = Config::load_from_file(&config_path)
        .and_then(|c| c.into_runtime())
        .unwrap_or_else(|e| fatal(e));

    let client = build_client(&config);
    let pool = ServerPool::from_urls(&config.backends, &client, config.forward_timeout)
        .unwrap_or_else(|e| fatal(e));

    let listener = TcpListener::bind(config.listen)
        .await
        .unwrap_or_else(|e| fatal(format!("failed to bind {}: {e}", config.listen)));

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let prober = spawn_health_checker(pool.clone(), config.health_check.clone(), stop_rx);

    info!(listen = %config.listen, backends = pool.len(), "load balancer started");

    serve(listener, pool, shutdown_signal()).await;

    let _ = stop_tx.send(());
    if let Err(e) = prober.await {
        warn!(%e, "health checker task ended abnormally");
    }
}
