//! Server accept loop, background tasks, and graceful shutdown.
//!
//! Sits between the TCP listener and the per-request pipeline in
//! [`handler`](crate::handler). Kept apart from `main()` so that the server
//! logic stays testable without signal handling or `std::process::exit`.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::{GeoResolver, RateLimiter, RuntimeConfig, StaticAssets, Templates, respond};

/// State shared by every connection. Only the rate limiter is mutable.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Validated configuration.
    pub config: Arc<RuntimeConfig>,
    /// Per-route inter-arrival gate.
    pub rate_limiter: RateLimiter,
    /// Geolocation databases opened at startup.
    pub geo: Arc<GeoResolver>,
    /// Static files served verbatim.
    pub assets: Arc<StaticAssets>,
    /// HTML page templates.
    pub templates: Arc<Templates>,
}

impl AppState {
    /// Builds state with no geolocation databases, assets or templates.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::from_config(&config),
            config: Arc::new(config),
            geo: Arc::new(GeoResolver::empty()),
            assets: Arc::new(StaticAssets::default()),
            templates: Arc::new(Templates::default()),
        }
    }

    /// Builds state and loads databases, static files and templates from the
    /// paths in `config`.
    pub fn load(config: RuntimeConfig) -> Self {
        let geo = GeoResolver::load(&config.geoip);
        let assets = StaticAssets::load(&config.static_dir);
        let templates = Templates::load(&config.templates_dir);
        info!(
            databases = geo.loaded().len(),
            assets = assets.len(),
            templates = templates.len(),
            "loaded resources"
        );
        Self::new(config)
            .with_geo(geo)
            .with_assets(assets)
            .with_templates(templates)
    }

    pub fn with_geo(mut self, geo: GeoResolver) -> Self {
        self.geo = Arc::new(geo);
        self
    }

    pub fn with_assets(mut self, assets: StaticAssets) -> Self {
        self.assets = Arc::new(assets);
        self
    }

    pub fn with_templates(mut self, templates: Templates) -> Self {
        self.templates = Arc::new(templates);
        self
    }
}

/// Accepts connections on `listener` and serves each one over HTTP/1.1
/// with [`respond`].
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let state = state.clone();
                        async move {
                            let resp = respond(req, &state, client_addr).await;
                            Ok::<_, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
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

/// Spawns a background task that periodically prunes stale entries from the
/// rate limiter, preventing unbounded memory growth.
pub fn spawn_rate_limit_cleanup(
    limiter: RateLimiter,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let before = limiter.tracked_key_count();
            limiter.retain_recent();
            let after = limiter.tracked_key_count();
            if before != after {
                info!(
                    before,
                    after,
                    pruned = before - after,
                    "rate limiter cleanup completed"
                );
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
                }
            }
            Err(e) => {
                error!(%e, "failed to register SIGTERM handler");
                ctrl_c.await;
                info!("received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_prunes_stale_keys() {
        let limiter = RateLimiter::new(10);
        limiter.check_at("10.0.0.1 get ", 1_000).unwrap();
        assert_eq!(limiter.tracked_key_count(), 1);

        let handle = spawn_rate_limit_cleanup(limiter.clone(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.tracked_key_count(), 0);
        handle.abort();
    }

    #[test]
    fn state_uses_configured_threshold() {
        let config = Config {
            rate_limit_threshold_ms: Some(250),
            ..Default::default()
        }
        .into_runtime()
        .unwrap();
        let state = AppState::new(config);
        assert_eq!(state.rate_limiter.threshold_ms(), 250);
        assert!(state.geo.loaded().is_empty());
        assert!(state.templates.is_empty());
    }
}
