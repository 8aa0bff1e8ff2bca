//! HTTP table API: deduplicating writes and filtered reads over the
//! document store.

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, instrument};

use stream_sync::tables::{stage, ReadTableRequest, WriteTableRequest};
use stream_sync::telemetry::init_telemetry;
use stream_sync::{load_config, SurrealStore, SyncMetrics, TableService, Trace, WriteOutcome};

mod error;
pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub tables: TableService,
    /// Bearer token required on every route when set.
    pub auth_secret: Option<Arc<str>>,
}

/// Status for a request that was understood but had nothing to write or
/// nothing to return.
pub fn nothing_to_do() -> StatusCode {
    StatusCode::from_u16(560).unwrap_or(StatusCode::NOT_FOUND)
}

/// Response body shared by every table endpoint.
pub(crate) fn envelope(status: StatusCode, message: &str, trace: &Trace, data: Option<Value>) -> Response {
    let mut body = json!({
        "message": message,
        "debug_values": trace,
    });
    if let Some(data) = data {
        body["data"] = data;
    }
    (status, Json(body)).into_response()
}

fn parse<T: DeserializeOwned>(body: &[u8], trace: &mut Trace) -> Result<T, ApiError> {
    let parsed = serde_json::from_slice(body).map_err(|e| ApiError::Malformed {
        reason: e.to_string(),
        trace: trace.clone(),
    })?;
    trace.record(stage::REQUEST_PARSED);
    Ok(parsed)
}

// --- Router Setup ---

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/write", post(write_handler))
        .route("/read", post(read_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let telemetry = init_telemetry("store-api", "store_api=info,stream_sync=info")
        .context("Failed to initialize telemetry")?;

    info!("Starting store-api...");

    let config = load_config();
    let store = SurrealStore::connect(config.store.clone())
        .await
        .context("Failed to connect to SurrealDB")?;

    let state = AppState {
        tables: TableService::new(
            Arc::new(store),
            config.store.database.clone(),
            config.consumer.operation_timeout,
            SyncMetrics::global(),
        ),
        auth_secret: config.auth_secret.map(Arc::from),
    };

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("Failed to bind port")?;
    info!(addr = %config.listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    telemetry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Signal received, starting graceful shutdown");
}

async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(secret) = state.auth_secret.as_deref() else {
        return next.run(req).await;
    };

    let authorized = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == secret);

    if authorized {
        next.run(req).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

// --- Handlers ---

#[instrument(skip(state, body))]
async fn write_handler(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let mut trace = Trace::new();
    let request: WriteTableRequest = parse(&body, &mut trace)?;
    debug!(table = %request.meta.table, rows = request.data.len(), "Received write request");

    let outcome = state
        .tables
        .write(request, &mut trace)
        .await
        .map_err(|e| ApiError::store(e, &trace))?;

    Ok(match outcome {
        WriteOutcome::Created { .. } => envelope(StatusCode::OK, "Table created", &trace, None),
        WriteOutcome::Appended { rows } => envelope(
            StatusCode::OK,
            "Table updated",
            &trace,
            Some(json!({ "inserted_rows": rows })),
        ),
        WriteOutcome::UpToDate => envelope(nothing_to_do(), "Data already up to date", &trace, None),
    })
}

#[instrument(skip(state, body))]
async fn read_handler(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let mut trace = Trace::new();
    let request: ReadTableRequest = parse(&body, &mut trace)?;
    debug!(table = %request.table, "Received read request");

    let rows = state
        .tables
        .read(request, &mut trace)
        .await
        .map_err(|e| ApiError::store(e, &trace))?;

    Ok(if rows.is_empty() {
        envelope(nothing_to_do(), "No data found", &trace, None)
    } else {
        envelope(StatusCode::OK, "Data found", &trace, Some(Value::Array(rows)))
    })
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
