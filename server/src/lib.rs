//! ============================================================================
//! Campaign Dialer - HTTP host
//! ============================================================================
//! Owns the store and gateway client for the life of the process and exposes:
//! - POST /tick                 run one dispatch pass
//! - POST /webhooks/:gateway    ingest a gateway status delivery
//! - GET  /health, GET /        liveness and banner
//! Scheduling ticks is left to an external timer hitting /tick.
//! ============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use dialer_core::{
    db, DialerConfig, DialerDb, DialerError, Dispatcher, HttpVoiceGateway, Reconciler,
    VoiceGateway,
};

/// Header carrying the webhook shared secret
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DialerDb>,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(
        db: Arc<DialerDb>,
        gateway: Arc<dyn VoiceGateway>,
        webhook_secret: Option<String>,
        campaign_parallelism: usize,
    ) -> Self {
        let dispatcher =
            Dispatcher::new(db.clone(), gateway).with_parallelism(campaign_parallelism);
        let reconciler = Reconciler::new(db.clone(), webhook_secret);
        Self {
            db,
            dispatcher: Arc::new(dispatcher),
            reconciler: Arc::new(reconciler),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/tick", post(tick))
        .route("/webhooks/:gateway", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// `{ok: false, error}` with a status code
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DialerError> for ApiError {
    fn from(err: DialerError) -> Self {
        let status = match &err {
            DialerError::Authentication(_) => StatusCode::UNAUTHORIZED,
            DialerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DialerError::Configuration(_)
            | DialerError::Gateway(_)
            | DialerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "ok": false, "error": self.message }))).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn banner() -> Json<serde_json::Value> {
    Json(json!({
        "service": "campaign-dialer",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    match db::blocking(&state.db, |db| db.ping()).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => {
            warn!("Health check failed: {}", e);
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TickRequest {
    #[serde(default)]
    campaign_id: Option<String>,
}

async fn tick(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request = if body.iter().all(|b| b.is_ascii_whitespace()) {
        TickRequest::default()
    } else {
        serde_json::from_slice::<TickRequest>(&body).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("invalid tick request: {}", e))
        })?
    };

    let campaign_id = request
        .campaign_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let report = state.dispatcher.tick(campaign_id).await.map_err(|e| {
        error!("Tick failed: {}", e);
        ApiError::from(e)
    })?;

    Ok(Json(report).into_response())
}

async fn webhook(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let secret = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    let ack = state
        .reconciler
        .ingest(&gateway, secret, &body)
        .await
        .map_err(|e| {
            warn!("Webhook from {} rejected: {}", gateway, e);
            ApiError::from(e)
        })?;

    Ok(Json(ack).into_response())
}

// ============================================================================
// Entry Point
// ============================================================================

pub async fn run() -> anyhow::Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("campaign_dialer=debug".parse()?)
                .add_directive("dialer_core=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("Starting campaign dialer");

    let config = DialerConfig::from_env();

    let db_path = config.db_path.clone();
    let db = tokio::task::spawn_blocking(move || DialerDb::open(db_path.as_deref())).await??;

    if config.gateway.require().is_err() {
        warn!("Voice gateway is not fully configured - dispatch attempts will fail");
    }
    if config.webhook_secret.is_none() {
        warn!("WEBHOOK_SECRET not set - webhook deliveries are not authenticated");
    }

    let gateway = HttpVoiceGateway::new(config.gateway.clone())?;
    let state = AppState::new(
        Arc::new(db),
        Arc::new(gateway),
        config.webhook_secret.clone(),
        config.campaign_parallelism,
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Campaign dialer stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
