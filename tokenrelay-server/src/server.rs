//! Process wiring for the three TokenRelay roles: the delivery server, the ingest bridge
//! and the origin proxy.

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::PrometheusHandle;
use shared::config::server::{Config, LogFormat};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    bus::{self, FanoutBus},
    metrics::{StreamMetrics, prometheus_handle},
    middleware::request_context::{self, RequestIdState},
    routes,
    services::{DedupeWindow, GenerationOrigin, HttpOrigin, IngestBridge, OriginProxy},
    tracer,
};

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
///
/// Returns the configured level. A second call in the same process is ignored.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates the CORS layer for the stream routes.
///
/// An empty `allowed_origins` list admits any origin.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let methods = vec![Method::GET, Method::POST, Method::OPTIONS];

    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any())
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors.allow_origin(AllowOrigin::any())
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// Creates the delivery server router: stream routes, health probes and, when a
/// Prometheus handle is supplied, `GET /metrics`.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: Option<PrometheusHandle>) -> Router {
    let config = Arc::clone(state.config());
    let cors = create_cors_layer(&config);
    let request_id_state = RequestIdState::from_config(&config);

    let mut router = Router::new()
        .merge(routes::stream::create_stream_router())
        .merge(routes::health::create_health_router())
        .with_state(state);

    if let Some(handle) = metrics_handle {
        router = router.merge(
            Router::new()
                .route("/metrics", get(metrics_endpoint))
                .layer(Extension(handle)),
        );
    }

    router
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
}

/// Creates the origin proxy router with the same request logging as the delivery server.
pub fn create_origin_app(config: &Config, proxy: OriginProxy) -> Router {
    routes::origin::create_origin_router(proxy)
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            RequestIdState::from_config(config),
            request_context::assign_request_id,
        ))
}

/// Resolves once SIGINT or SIGTERM is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutting down...");
}

async fn bind(port: u16) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    Ok((listener, addr))
}

fn generation_origin(config: &Config) -> anyhow::Result<Option<Arc<dyn GenerationOrigin>>> {
    let Some(url) = config.origin.url.as_deref() else {
        warn!("no origin configured; POST /chat will answer 503");
        return Ok(None);
    };
    let origin = HttpOrigin::new(url).context("failed to build origin client")?;
    Ok(Some(Arc::new(origin)))
}

/// Runs the delivery server until a shutdown signal arrives.
///
/// Open streams are cancelled on shutdown so the graceful drain does not wait on them.
///
/// # Errors
/// Returns an error if the bus connection, origin client or listener cannot be set up.
pub async fn run_serve(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!("Starting delivery server...");

    let config = Arc::new(config);
    let metrics_handle = if config.metrics.enabled {
        prometheus_handle()
    } else {
        None
    };

    let bus: Arc<dyn FanoutBus> = bus::connect_bus(&config.bus)
        .await
        .context("failed to connect to the fan-out bus")?;
    let origin = generation_origin(&config)?;
    let metrics = Arc::new(StreamMetrics::default());

    let state = Arc::new(AppState::new(
        bus,
        origin,
        Arc::clone(&config),
        Arc::clone(&metrics),
    ));
    let streams = state.shutdown_token();
    let app = create_app_router(state, metrics_handle);

    let (listener, addr) = bind(config.server.port).await?;
    info!(%addr, "Listening");

    serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            streams.cancel();
        })
        .await
        .context("server error")?;

    let snapshot = metrics.snapshot();
    info!(
        connections_opened = snapshot.connections_opened,
        messages_delivered = snapshot.messages_delivered,
        messages_dropped = snapshot.messages_dropped,
        "delivery server stopped"
    );
    Ok(())
}

/// Runs the ingest bridge until a shutdown signal arrives or the source fails.
///
/// # Errors
/// Returns an error if either side cannot be connected, or if the source subscription
/// fails or ends while running.
pub async fn run_bridge(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);

    let instance_id = config
        .bridge
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("bridge-{}", Uuid::new_v4().simple()));
    info!(instance_id = %instance_id, pattern = %config.source.pattern, "Starting ingest bridge...");

    let source = bus::open_source(&config.source).context("failed to open the token source")?;
    let fanout = bus::connect_bus(&config.bus)
        .await
        .context("failed to connect to the fan-out bus")?;

    let bridge = IngestBridge::new(
        source,
        fanout,
        config.source.pattern.clone(),
        DedupeWindow::new(config.bridge.dedupe_window()),
        Arc::new(StreamMetrics::default()),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let stats = bridge.run(cancel).await.context("ingest bridge failed")?;
    info!(
        instance_id = %instance_id,
        processed = stats.processed,
        forwarded = stats.forwarded,
        duplicates = stats.duplicates,
        malformed = stats.malformed,
        publish_failures = stats.publish_failures,
        "ingest bridge stopped"
    );
    Ok(())
}

/// Runs the origin proxy in front of the inference engine.
///
/// # Errors
/// Returns an error if the source publisher or the listener cannot be set up.
pub async fn run_origin(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!(inference = %config.inference.url, "Starting origin proxy...");

    let publisher = bus::connect_publisher(&config.source)
        .await
        .context("failed to connect to the token source")?;
    let proxy = OriginProxy::new(config.inference.clone(), publisher);
    let app = create_origin_app(&config, proxy);

    let (listener, addr) = bind(config.server.port).await?;
    info!(%addr, "Listening");

    serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
