use std::path::PathBuf;

use ipsaur::server::{serve, shutdown_signal, spawn_rate_limit_cleanup};
use ipsaur::{AppState, Config, Result, ServiceError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./Config.yml";
const CONFIG_PATH_ENV: &str = "IPSAUR_CONFIG";

/// Reads the configuration file named by `IPSAUR_CONFIG`, or `./Config.yml`.
///
/// A missing file at the default path means built-in defaults; an explicit
/// path must exist.
fn load_config() -> Result<Config> {
    let explicit = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if explicit.is_none() && !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    info!(path = %path.display(), "loading configuration");
    Config::load_from_file(&path)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("This is IPsaur!");

    let config = load_config()
        .and_then(|mut c| {
            c.apply_env(|name| std::env::var(name).ok())?;
            c.into_runtime()
        })
        .unwrap_or_else(|e| {
            error!(%e, "fatal configuration error");
            std::process::exit(1);
        });

    let listen = config.listen;
    let sweep_interval = config.rate_limit_sweep_interval;
    let state = AppState::load(config);

    if state.rate_limiter.threshold_ms() > 0 {
        spawn_rate_limit_cleanup(state.rate_limiter.clone(), sweep_interval);
    } else {
        info!("rate limiting disabled");
    }

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| ServiceError::Config(format!("failed to bind {listen}: {e}")))
        .unwrap_or_else(|e| {
            error!(%e, "fatal startup error");
            std::process::exit(1);
        });

    info!(%listen, "listening");
    serve(listener, state, shutdown_signal()).await;
}
