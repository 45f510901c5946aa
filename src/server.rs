use crate::api_keys::{ApiKeyValidator, StaticApiKeyValidator};
use crate::blocklist::Blocklist;
use crate::clock::{system_clock, SharedClock};
use crate::config::Config;
use crate::config_validator::ConfigValidator;
use crate::error::Result;
use crate::handlers::{
    block_target, check_rate_limit, delete_rate_limit, get_rate_limit, health_check, metrics,
    readiness_check, unblock_target, AppState, SharedState,
};
use crate::metrics::MetricsCollector;
use crate::middleware::{admission_middleware, logging_middleware};
use crate::policy::AdmissionPolicy;
use crate::rate_limiter::{RateLimiter, RateLimiterOptions};
use crate::store::{CounterStore, InMemoryStore, RedisStore};
use crate::throttler::{Throttler, ThrottlerSettings};
use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const STARTUP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    state: SharedState,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let policy_config = config.load_policy()?;
        ConfigValidator::validate_policy(&policy_config)?;

        let store: Arc<dyn CounterStore> = if config.redis_url.is_empty() {
            info!("REDIS_URL not set, using the in-process counter store");
            Arc::new(InMemoryStore::new())
        } else {
            Arc::new(RedisStore::new(&config.redis_url)?)
        };

        let api_keys: Arc<dyn ApiKeyValidator> = Arc::new(StaticApiKeyValidator::from_records(
            policy_config.api_keys.clone(),
        ));
        let policy = AdmissionPolicy::new(policy_config, config.whitelist_ips.iter().copied())?;

        let throttler = build_throttler(
            store,
            system_clock(),
            config.limiter_options(),
            policy,
            api_keys,
            config.throttler_settings(),
        );

        Ok(Self {
            state: Arc::new(AppState::new(throttler)),
            bind_addr: config.bind_addr,
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let limiter = self.state.throttler.limiter();
        match tokio::time::timeout(STARTUP_CONNECT_TIMEOUT, limiter.store().connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Counter store unreachable at startup, requests will fail open")
            }
            Err(_) => warn!(
                timeout = ?STARTUP_CONNECT_TIMEOUT,
                "Counter store connect still pending, requests will fail open until it completes"
            ),
        }

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        info!(
            strategy = %limiter.strategy(),
            backend = limiter.store().backend_name(),
            "Throttler server listening on {}",
            self.bind_addr
        );
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        let app = create_app(self.state);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

/// Wire the limiter, blocklist and admission policy over one store.
pub fn build_throttler(
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    options: RateLimiterOptions,
    policy: AdmissionPolicy,
    api_keys: Arc<dyn ApiKeyValidator>,
    settings: ThrottlerSettings,
) -> Arc<Throttler> {
    let blocklist = Blocklist::new(store.clone(), &options.key_prefix, options.store_timeout);
    let limiter = RateLimiter::with_clock(store, options, clock);

    Arc::new(Throttler::new(
        limiter,
        blocklist,
        api_keys,
        Arc::new(policy),
        MetricsCollector::new(),
        settings,
    ))
}

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        // Limiter admin endpoints
        .route(
            "/rate-limit/:identifier",
            get(get_rate_limit).delete(delete_rate_limit),
        )
        .route("/rate-limit/:identifier/check", post(check_rate_limit))
        .route("/blocklist/:target", put(block_target).delete(unblock_target))
        .route("/metrics", get(metrics))
        // Health and readiness endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(middleware::from_fn_with_state(
            state.throttler.clone(),
            admission_middleware,
        ))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
