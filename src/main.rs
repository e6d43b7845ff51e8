use std::sync::Arc;

use gatekeeper::{AppState, Config, build_client, serve, shutdown_signal, spawn_sweeper};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Config.yml";
const CONFIG_ENV: &str = "GATEKEEPER_CONFIG";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| CONFIG_FILE_PATH.into());

    let config = Config::load_from_file(&path)
        .and_then(|c| c.into_runtime())
        .unwrap_or_else(|e| {
            error!(%e, %path, "fatal: invalid configuration");
            std::process::exit(1);
        });

    let listen = config.listen;
    let state = Arc::new(AppState::new(config));
    let client = build_client(state.pool_idle_timeout);

    if let Some(interval) = state.sweep_interval {
        spawn_sweeper(state.violations.clone(), Arc::clone(&state.counter), interval);
    }

    let listener = match TcpListener::bind(listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%e, %listen, "failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(
        %listen,
        upstream = %state.upstream,
        max_concurrent_requests = state.max_concurrent_requests,
        "gatekeeper listening"
    );

    serve(listener, client, state, shutdown_signal()).await;
}
