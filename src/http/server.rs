use crate::config::Config;
use crate::error::{ModeldError, Result};
use crate::http::{ErrorReply, Reply, StatsReport, DONE};
use crate::latency::{self, LatencyRecorder};
use crate::models::{
    ArtifactVersion, LoadRequest, ModelDetails, ModelRecord, Orchestrator, TrainRequest, Upload,
};
use crate::telemetry::Telemetry;
use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

/// Shared handler state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    latency: Arc<LatencyRecorder>,
    telemetry: Arc<Telemetry>,
}

/// HTTP front end for the orchestrator
pub struct HttpServer {
    bind_addr: String,
    max_upload_bytes: usize,
    cors: bool,
    state: AppState,
    ready_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl HttpServer {
    /// Create new HTTP server
    ///
    /// # Arguments
    /// * `orchestrator` - Lifecycle operations the routes call into
    /// * `config` - Bind address, upload limit, CORS and latency capacity
    pub fn new(orchestrator: Arc<Orchestrator>, config: &Config) -> Result<Self> {
        let telemetry = Telemetry::new(orchestrator.store().root())?;
        Ok(Self {
            bind_addr: config.server.bind.clone(),
            max_upload_bytes: config.server.max_upload_mb.saturating_mul(1024 * 1024),
            cors: config.server.cors,
            state: AppState {
                orchestrator,
                latency: Arc::new(LatencyRecorder::new(config.latency.capacity)),
                telemetry: Arc::new(telemetry),
            },
            ready_tx: None,
        })
    }

    /// Set ready signal channel, receives the bound address (for testing)
    #[must_use]
    pub fn with_ready_signal(mut self, ready_tx: oneshot::Sender<SocketAddr>) -> Self {
        self.ready_tx = Some(ready_tx);
        self
    }

    /// Override bind address (for testing)
    #[must_use]
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    /// Recorder fed by every request
    #[must_use]
    pub fn latency(&self) -> Arc<LatencyRecorder> {
        self.state.latency.clone()
    }

    /// Build the router with all routes and layers
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/load/:key", post(load))
            .route("/train/:key", post(train))
            .route("/eval/:key", post(eval))
            .route("/models", get(list_models))
            .route("/models/:key", get(model_status).delete(delete_model))
            .route("/export/:key", get(export))
            .route("/import/:key", post(import))
            .route("/stats", get(stats))
            .route("/test", get(liveness))
            .layer(DefaultBodyLimit::max(self.max_upload_bytes))
            .layer(middleware::from_fn_with_state(
                self.state.latency.clone(),
                record_latency,
            ));

        if self.cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        router.with_state(self.state.clone())
    }

    /// Start HTTP server
    ///
    /// Binds the listener and serves until Ctrl-C.
    pub async fn start(mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            ModeldError::Http(format!("Failed to bind {}: {e}", self.bind_addr))
        })?;
        let local_addr = listener.local_addr()?;
        let router = self.router();

        tracing::info!("HTTP server listening on {local_addr}");

        // Signal ready if channel provided (for testing)
        if let Some(ready_tx) = self.ready_tx.take() {
            ready_tx.send(local_addr).ok();
        }

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutdown signal received");
            })
            .await
            .map_err(|e| ModeldError::Http(format!("Server error: {e}")))
    }
}

impl IntoResponse for ModeldError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if self.is_user_error() {
            tracing::debug!(status = status.as_u16(), "Request rejected: {self}");
        } else {
            tracing::error!(status = status.as_u16(), "Request failed: {self}");
        }

        let body = ErrorReply {
            status: status.as_u16(),
            error: self.kind().to_string(),
            msg: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// HTTP status for an error
fn status_for(error: &ModeldError) -> StatusCode {
    match error {
        ModeldError::OperationInProgress { .. } | ModeldError::VersionConflict { .. } => {
            StatusCode::CONFLICT
        }
        ModeldError::NoVersions(_) => StatusCode::NOT_FOUND,
        e if e.is_user_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn record_latency(
    State(latency): State<Arc<LatencyRecorder>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    latency.record(elapsed);
    tracing::debug!(
        "{method} {path} -> {} in {elapsed:?}",
        response.status().as_u16()
    );
    response
}

/// Collect named multipart parts; unknown parts are ignored
async fn read_parts(
    multipart: std::result::Result<Multipart, MultipartRejection>,
    names: &[&str],
) -> Result<Vec<(String, Upload)>> {
    let mut multipart = multipart
        .map_err(|e| ModeldError::MissingInput(format!("Expected a multipart form: {e}")))?;

    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ModeldError::MissingInput(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if !names.contains(&name.as_str()) {
            continue;
        }
        let file_name = field.file_name().unwrap_or(&name).to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ModeldError::MissingInput(format!("Failed to read part '{name}': {e}")))?;
        parts.push((name, Upload::new(file_name, bytes.to_vec())));
    }
    Ok(parts)
}

fn take_part(parts: &mut Vec<(String, Upload)>, name: &str) -> Option<Upload> {
    parts
        .iter()
        .position(|(n, _)| n == name)
        .map(|i| parts.swap_remove(i).1)
}

async fn load(
    State(state): State<AppState>,
    Path(key): Path<String>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<Reply<&'static str>>> {
    let mut parts = read_parts(multipart, &["model", "metadata", "io_params"]).await?;
    let request = LoadRequest {
        model: take_part(&mut parts, "model"),
        metadata: take_part(&mut parts, "metadata"),
        io_params: take_part(&mut parts, "io_params"),
    };

    let version = state.orchestrator.load(&key, request).await?;
    Ok(Json(Reply::ok(DONE).with_version(version.version)))
}

async fn train(
    State(state): State<AppState>,
    Path(key): Path<String>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<Reply<&'static str>>> {
    let mut parts = read_parts(multipart, &["training_data", "io_params"]).await?;
    let request = TrainRequest {
        training_data: take_part(&mut parts, "training_data"),
        io_params: take_part(&mut parts, "io_params"),
    };

    let version = state.orchestrator.train(&key, request).await?;
    Ok(Json(Reply::ok(DONE).with_version(version.version)))
}

async fn eval(
    State(state): State<AppState>,
    Path(key): Path<String>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Reply<Value>>> {
    let Json(payload) = payload
        .map_err(|e| ModeldError::MissingInput(format!("Expected a JSON body: {e}")))?;
    let output = state.orchestrator.eval(&key, &payload).await?;
    Ok(Json(Reply::ok(output)))
}

async fn list_models(State(state): State<AppState>) -> Json<Reply<Vec<ModelRecord>>> {
    Json(Reply::ok(state.orchestrator.list()))
}

async fn model_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Reply<ModelDetails>>> {
    Ok(Json(Reply::ok(state.orchestrator.status(&key).await?)))
}

async fn delete_model(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Reply<&'static str>>> {
    state.orchestrator.delete(&key).await?;
    Ok(Json(Reply::ok(DONE)))
}

async fn export(State(state): State<AppState>, Path(key): Path<String>) -> Result<Response> {
    let bytes = state.orchestrator.package(&key).await?;
    let disposition = format!("attachment; filename=\"{key}.zip\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn import(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<Reply<Vec<ArtifactVersion>>>> {
    let versions = state.orchestrator.import(&key, body.to_vec()).await?;
    Ok(Json(Reply::ok(versions)))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Reply<StatsReport>>> {
    let process = state.telemetry.sample()?;
    let samples = state.latency.snapshot();
    Ok(Json(Reply::ok(StatsReport {
        engine: state.orchestrator.engine_name().to_string(),
        models: state.orchestrator.registry().len(),
        process,
        latency: latency::summarize(&samples),
        samples,
    })))
}

async fn liveness() -> Json<Value> {
    Json(json!({"hello": "world"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ModeldError::MissingInput("model".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ModeldError::OperationInProgress {
                key: "k".to_string(),
                status: "training".to_string()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ModeldError::NoVersions("k".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ModeldError::ArtifactCorrupt("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
