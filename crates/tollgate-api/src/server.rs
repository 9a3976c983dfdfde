use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use tollgate_core::config::Config;
use tollgate_core::error::Result;
use tollgate_core::flow::{FlowCoordinator, FlowSettings};
use tollgate_core::outcome::OutcomeLogger;
use tollgate_core::provider::ProviderRegistry;
use tollgate_core::session::SessionKeys;

use crate::metrics::http_metrics_middleware;
use crate::routes;

/// Cookie names derived from the configurable prefix.
#[derive(Clone, Debug)]
pub struct CookieNames {
    pub session: String,
    /// Binds an in-flight login to the browser that started it.
    pub state: String,
}

impl CookieNames {
    pub fn from_prefix(prefix: &str) -> Self {
        Self {
            session: format!("{prefix}_session"),
            state: format!("{prefix}_state"),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub flow: Arc<FlowCoordinator>,
    pub sessions: Arc<SessionKeys>,
    pub cookie_names: CookieNames,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    /// Resolve providers (running discovery where needed) and wire up the
    /// login coordinator.
    pub async fn build(config: Config, metrics_handle: Option<PrometheusHandle>) -> Result<Self> {
        let logger = Arc::new(OutcomeLogger::new(config.observability.expected_ids()?));
        let registry = Arc::new(ProviderRegistry::build(&config.providers, &config.transport).await?);
        let flow = Arc::new(FlowCoordinator::new(
            FlowSettings::from_config(&config),
            registry,
            logger,
        ));
        let sessions = Arc::new(SessionKeys::from_config(&config.session)?);
        let cookie_names = CookieNames::from_prefix(&config.server.cookie_prefix);

        Ok(Self {
            config: Arc::new(config),
            flow,
            sessions,
            cookie_names,
            metrics_handle,
        })
    }
}

/// The full router with tracing and request metrics.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::router(&state.config.resources))
        .layer(middleware::from_fn(http_metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: Config, metrics_handle: Option<PrometheusHandle>) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let sweep_every = config.flow.sweep_interval();

    let state = AppState::build(config, metrics_handle).await?;
    let flow = state.flow.clone();
    let sweeper = spawn_sweeper(flow.clone(), sweep_every);

    tracing::info!(%addr, providers = flow.providers().len(), "starting server");
    let listener = TcpListener::bind(addr).await?;

    let result = axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            flow.logger().quiesce();
        })
        .await;

    sweeper.abort();
    result?;
    Ok(())
}

/// Periodically drop login flows whose callback never arrived.
pub fn spawn_sweeper(flow: Arc<FlowCoordinator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let swept = flow.sweep_expired();
            if swept > 0 {
                tracing::debug!(swept, "expired login flows removed");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received CTRL+C"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler, waiting for CTRL+C only");
                ctrl_c.await.ok();
                tracing::info!("received CTRL+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received CTRL+C");
    }
}
