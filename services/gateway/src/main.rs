//! Switchboard gateway
//!
//! Single-binary HTTP service that fronts a pool of browser-driven
//! backend sessions:
//! 1. Serves three API dialects (native, OpenAI, Claude)
//! 2. Relays each request over the active session's WebSocket channel
//! 3. Rotates accounts on usage and failure thresholds
//! 4. Streams responses verbatim or as a buffered pseudo-stream

mod channel;
mod config;
mod dialect;
mod driver_impl;
mod error;
mod handler;
mod metrics;
mod queue;
mod registry;
mod stream;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::driver_impl::ChannelDriver;
use crate::handler::AppState;
use crate::metrics::ServiceMetrics;
use crate::registry::Registry;
use driver::{PassthroughTranslator, SessionDriver};
use rotation::{Switcher, SwitcherConfig};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/api/generate", post(handler::native_handler))
        .route("/api/generate/stream", post(handler::native_stream_handler))
        .route("/v1/chat/completions", post(handler::openai_handler))
        .route("/v1/messages", post(handler::claude_handler))
        .route("/api/log-level", post(handler::log_level_handler))
        .route("/api/channel", get(channel::channel_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting switchboard-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        accounts = config.pool.accounts.len(),
        usage_threshold = config.pool.usage_threshold,
        failure_threshold = config.pool.failure_threshold,
        delivery_mode = ?config.delivery.mode,
        "configuration loaded"
    );

    let config = Arc::new(config);
    let registry = Arc::new(Registry::new(config.timeouts.grace_period()));
    let driver: Arc<dyn SessionDriver> = Arc::new(ChannelDriver::new(
        Arc::clone(&registry),
        config.pool.accounts.clone(),
    ));
    let switcher = Arc::new(Switcher::new(
        Arc::clone(&driver),
        SwitcherConfig {
            usage_threshold: config.pool.usage_threshold,
            failure_threshold: config.pool.failure_threshold,
            immediate_switch_statuses: config.pool.immediate_switch_statuses.clone(),
        },
    ));
    let service_metrics = Arc::new(ServiceMetrics::new());

    let app_state = AppState {
        registry,
        switcher,
        driver,
        translator: Arc::new(PassthroughTranslator::new()),
        config: Arc::clone(&config),
        metrics: Arc::clone(&service_metrics),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT keeps a slow client from blocking process exit
    //
    // The drain timer starts when the signal fires, not when the server
    // starts, so the server is notified first and the drain raced second.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = service_metrics.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 when the active account's channel is open, 503
/// otherwise. The body carries rotation state and request counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.switcher.current_index();
    let channel_open = current >= 0 && state.registry.has_open_connection(current as usize);

    let status_code = if channel_open {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if channel_open { "healthy" } else { "degraded" },
        "channel_open": channel_open,
        "reconnecting": state.registry.is_reconnecting(),
        "driver": state.driver.id(),
        "rotation": state.switcher.health(),
        "service": state.metrics.snapshot(),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::{Reply, spawn_peer, test_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_degraded_without_channel() {
        let state = test_state("verbatim");
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["channel_open"], false);
        assert_eq!(json["rotation"]["current_index"], -1);
    }

    #[tokio::test]
    async fn health_endpoint_healthy_with_active_channel() {
        let state = test_state("verbatim");
        spawn_peer(&state, 0, vec![]);
        state.switcher.switch_to_next().await;

        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["driver"], "channel");
        assert_eq!(json["rotation"]["current_index"], 0);
        assert!(json["service"].get("uptime_secs").is_some());
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_state("verbatim");
        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(
            content_type.contains("text/plain"),
            "metrics endpoint must return text/plain Prometheus format"
        );
    }

    #[tokio::test]
    async fn generate_route_returns_buffered_completion() {
        let state = test_state("verbatim");
        spawn_peer(&state, 0, vec![Reply::Chunks(vec!["routed"])]);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(post_json(
                "/api/generate",
                serde_json::json!({"prompt": "hi"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["content"], "routed");
    }

    #[tokio::test]
    async fn generate_stream_route_returns_event_stream() {
        let state = test_state("verbatim");
        spawn_peer(&state, 0, vec![Reply::Chunks(vec!["streamed"])]);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(post_json(
                "/api/generate/stream",
                serde_json::json!({"prompt": "hi"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/event-stream"));
    }

    #[tokio::test]
    async fn generate_route_streams_on_accept_header() {
        let state = test_state("verbatim");
        spawn_peer(&state, 0, vec![Reply::Chunks(vec!["negotiated"])]);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/generate")
                    .method("POST")
                    .header("content-type", "application/json")
                    .header("accept", "text/event-stream")
                    .body(Body::from(r#"{"prompt":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/event-stream"));
    }

    #[tokio::test]
    async fn openai_route_with_stream_flag_returns_event_stream() {
        let state = test_state("verbatim");
        spawn_peer(&state, 0, vec![Reply::Chunks(vec!["chat"])]);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                serde_json::json!({"messages": [], "stream": true}),
            ))
            .await
            .unwrap();

        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/event-stream"));
    }

    #[tokio::test]
    async fn claude_route_without_stream_flag_is_buffered() {
        let state = test_state("verbatim");
        spawn_peer(&state, 0, vec![Reply::Chunks(vec!["claude says"])]);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(post_json(
                "/v1/messages",
                serde_json::json!({"messages": []}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["content"], "claude says");
    }

    #[tokio::test]
    async fn log_level_route_validates_level() {
        let state = test_state("verbatim");
        let app = build_router(state.clone(), 1000);

        let response = app
            .oneshot(post_json(
                "/api/log-level",
                serde_json::json!({"level": "verbose"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(post_json(
                "/api/log-level",
                serde_json::json!({"level": "debug"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["delivered"], 0);
    }

    #[tokio::test]
    async fn log_level_broadcast_reaches_connected_channels() {
        let state = test_state("verbatim");
        spawn_peer(&state, 0, vec![]);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(post_json(
                "/api/log-level",
                serde_json::json!({"level": "warn"}),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["delivered"], 1);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let state = test_state("verbatim");
        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
