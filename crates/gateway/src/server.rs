use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::{Path, State},
        response::IntoResponse,
        routing::{get, post},
    },
    serde::Serialize,
    serde_json::Value,
    sqlx::sqlite::SqlitePoolOptions,
    switchboard_auto_reply::{HandoverCoordinator, InboundPipeline, ReplyEngine, ReplySettings},
    switchboard_channels::{FileCredentialStore, LoopbackTransport, Transport},
    switchboard_config::{StoreConfig, SwitchboardConfig, TransportKind, validate_config},
    switchboard_store::{SqliteStore, Store},
    switchboard_whatsapp::{SidecarSettings, SidecarTransport},
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use crate::{
    Result,
    device_watch::spawn_device_watch,
    outbound::{DispatcherSettings, OutboundDispatcher},
    qr::qr_data_url,
    state::GatewayState,
    supervisor::{PairingOutcome, Supervisor, SupervisorSettings},
    webhook::{WebhookPayload, ingest},
};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the control API router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/scan/{device_id}", get(scan_handler))
        .route("/pair-code/{device_id}", get(pair_code_handler))
        .route("/reset/{device_id}", post(reset_handler))
        .route("/sessions", get(sessions_handler))
        .route("/webhook/inbound", post(webhook_handler));

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(prometheus_metrics_handler));

    #[cfg(feature = "metrics")]
    let router = router.route_layer(axum::middleware::from_fn(
        crate::metrics_middleware::http_metrics_middleware,
    ));

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Open the SQLite pool and bring the schema up to date.
pub async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    switchboard_store::run_migrations(&pool).await?;
    Ok(Arc::new(SqliteStore::with_pool(pool).await?))
}

/// Run the worker: sessions for every device, the outbound dispatcher and
/// the control API, until Ctrl-C.
pub async fn start_gateway(config: SwitchboardConfig) -> anyhow::Result<()> {
    let validation = validate_config(&config, None);
    for diagnostic in &validation.diagnostics {
        warn!(%diagnostic, "config");
    }
    if validation.has_errors() {
        anyhow::bail!("configuration has errors, refusing to start");
    }

    #[cfg(feature = "metrics")]
    let metrics_handle = {
        let recorder = switchboard_metrics::MetricsRecorderConfig {
            enabled: config.metrics.enabled,
            global_labels: Vec::new(),
        };
        switchboard_metrics::init_metrics(recorder)?
    };

    let shutdown = CancellationToken::new();

    let sqlite = connect_store(&config.store).await?;
    sqlite.spawn_change_poller(config.store.poll_interval(), shutdown.child_token());
    let store: Arc<dyn Store> = sqlite;

    let providers = switchboard_providers::from_config(&config.ai)?;
    info!(
        embedding = providers.embedder.model_name(),
        generation = providers.generator.model_name(),
        "AI providers ready"
    );
    let engine = ReplyEngine::new(
        Arc::clone(&store),
        providers.embedder,
        providers.generator,
        ReplySettings::from_config(&config.reply, config.ai.request_timeout()),
    );
    let handover = HandoverCoordinator::new(
        Arc::clone(&store),
        &config.handover,
        config.whatsapp.default_country_code.clone(),
    );
    let pipeline = Arc::new(InboundPipeline::new(
        Arc::clone(&store),
        engine,
        handover,
        config.reply.presence_updates,
    ));

    let mut sidecar = None;
    let transport: Arc<dyn Transport> = match config.whatsapp.transport {
        TransportKind::Sidecar => {
            let transport = Arc::new(SidecarTransport::new(SidecarSettings {
                port: config.whatsapp.sidecar_port,
                sidecar_dir: config.whatsapp.sidecar_dir.clone(),
                spawn_sidecar: config.whatsapp.spawn_sidecar,
                send_timeout: config.supervisor.send_timeout(),
            }));
            sidecar = Some(Arc::clone(&transport));
            transport
        },
        TransportKind::Loopback => {
            warn!("loopback transport selected, no messages will reach WhatsApp");
            Arc::new(LoopbackTransport::new())
        },
    };

    let auth_dir = config.supervisor.auth_dir();
    info!(path = %auth_dir.display(), "session credentials directory");
    let supervisor = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::new(FileCredentialStore::new(auth_dir)),
        pipeline,
        SupervisorSettings::from_config(&config),
    );

    OutboundDispatcher::new(
        Arc::clone(&store),
        Arc::new(supervisor.clone()),
        DispatcherSettings {
            send_timeout: config.supervisor.send_timeout(),
            ..DispatcherSettings::default()
        },
    )
    .spawn(shutdown.child_token());
    spawn_device_watch(Arc::clone(&store), supervisor.clone(), shutdown.child_token());

    #[cfg(feature = "metrics")]
    let state = GatewayState::with_metrics(Arc::clone(&store), supervisor.clone(), metrics_handle);
    #[cfg(not(feature = "metrics"))]
    let state = GatewayState::new(Arc::clone(&store), supervisor.clone());

    let app = build_gateway_app(state);
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, transport = transport.name(), "switchboard listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                () = signal.cancelled() => {},
            }
        })
        .await?;

    shutdown.cancel();
    supervisor.shutdown().await;
    if let Some(sidecar) = sidecar {
        sidecar.shutdown().await;
    }
    info!("switchboard stopped");
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let sessions = state.supervisor.sessions().await.len();
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "sessions": sessions,
    }))
}

#[derive(Serialize)]
struct ScanResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr_image: Option<String>,
}

async fn scan_handler(
    State(state): State<Arc<GatewayState>>,
    Path(device_id): Path<String>,
) -> Result<Json<ScanResponse>> {
    let session = state.supervisor.scan(&device_id).await?;
    let qr_string = session.qr().map(str::to_string);
    let qr_image = qr_string.as_deref().and_then(|qr| {
        qr_data_url(qr)
            .inspect_err(|e| warn!(device_id, error = %e, "failed to render QR image"))
            .ok()
    });
    Ok(Json(ScanResponse {
        status: session.status().as_str(),
        qr_string,
        qr_image,
    }))
}

#[derive(Serialize)]
struct PairCodeResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

async fn pair_code_handler(
    State(state): State<Arc<GatewayState>>,
    Path(device_id): Path<String>,
) -> Result<Json<PairCodeResponse>> {
    let response = match state.supervisor.request_pairing_code(&device_id).await? {
        PairingOutcome::Connected => PairCodeResponse {
            status: "connected",
            code: None,
        },
        PairingOutcome::CodeReady(code) => PairCodeResponse {
            status: "code_ready",
            code: Some(code),
        },
        PairingOutcome::Timeout => PairCodeResponse {
            status: "timeout",
            code: None,
        },
    };
    Ok(Json(response))
}

async fn reset_handler(
    State(state): State<Arc<GatewayState>>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>> {
    state.supervisor.reset(&device_id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn sessions_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "devices": state.supervisor.sessions().await }))
}

async fn webhook_handler(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let outcome = ingest(
        state.store.as_ref(),
        &state.country_code,
        WebhookPayload::from_json(&body),
    )
    .await?;
    Ok(Json(outcome))
}

/// Prometheus text exposition; 503 when metrics are disabled.
#[cfg(feature = "prometheus")]
async fn prometheus_metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    use axum::http::{StatusCode, header};

    match state.metrics_handle.as_ref() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not enabled".to_string(),
        ),
    }
}
