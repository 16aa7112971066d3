//! REST API for the record server using Axum (port 3000 by default).
//!
//! Handlers are thin: they decode the JSON body, call the shared [`Engine`]
//! and encode the result. Failures travel as `{code, message}` bodies with an
//! HTTP status derived from the error code.

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{DbError, ErrorCode};
use crate::models::{Batch, Bin, CursorId, IndexSpec, Key, Record, Statement, TaskStatus, UdfCall};

/// Shared app state for REST handlers
#[derive(Clone)]
pub struct AppState {
    engine: Engine,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterUdfRest {
    pub file_name: String,
    pub source: String,
}

#[derive(Serialize, Deserialize)]
pub struct PutRecordRest {
    pub key: Key,
    pub bins: Vec<Bin>,
}

#[derive(Serialize, Deserialize)]
pub struct AggregateRest {
    pub statement: Statement,
    pub call: UdfCall,
}

#[derive(Serialize, Deserialize)]
pub struct CursorOpened {
    pub cursor: CursorId,
}

#[derive(Serialize, Deserialize)]
pub struct FetchParams {
    pub max: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct DeleteResponse {
    pub existed: bool,
}

#[derive(Serialize, Deserialize)]
pub struct InfoResponse {
    pub command: String,
    pub response: String,
}

/// Generic acknowledgement
#[derive(Serialize, Deserialize)]
pub struct RestResponse {
    pub success: bool,
    pub message: String,
}

impl RestResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidKey
        | ErrorCode::InvalidBin
        | ErrorCode::InvalidCommand
        | ErrorCode::UdfCompile
        | ErrorCode::UdfArity => StatusCode::BAD_REQUEST,
        ErrorCode::IndexNotFound | ErrorCode::UdfNotFound | ErrorCode::CursorNotFound => StatusCode::NOT_FOUND,
        ErrorCode::IndexAlreadyExists | ErrorCode::IndexNotReadable | ErrorCode::UdfNotReady => StatusCode::CONFLICT,
        ErrorCode::IndexBuildFailed | ErrorCode::UdfRuntime => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::CursorClosed => StatusCode::GONE,
        ErrorCode::Connection | ErrorCode::Protocol => StatusCode::BAD_GATEWAY,
        ErrorCode::Io | ErrorCode::Storage | ErrorCode::Serialization | ErrorCode::InvalidConfig => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub struct ApiError(DbError);

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = status_for(code);
        if status.is_server_error() {
            warn!(%code, error = %self.0, "request failed");
        } else {
            debug!(%code, error = %self.0, "request rejected");
        }
        let body = ErrorBody {
            code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn trace_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();
    let response = next.run(req).await;
    debug!(
        %method,
        %uri,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Create the Axum router over a shared engine.
pub fn create_router(engine: Engine) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health_handler))
        .route("/udfs", post(register_udf_handler))
        .route("/udfs/:file_name", get(udf_status_handler).delete(remove_udf_handler))
        .route("/indexes", post(create_index_handler))
        .route(
            "/indexes/:namespace/:name",
            get(index_status_handler).delete(drop_index_handler),
        )
        .route("/records", post(put_record_handler))
        .route("/records/get", post(get_record_handler))
        .route("/records/delete", post(delete_record_handler))
        .route("/queries", post(open_query_handler))
        .route("/aggregates", post(open_aggregate_handler))
        .route("/cursors/:id", get(fetch_handler).delete(close_cursor_handler))
        .route("/info/:command", get(info_handler))
        .layer(middleware::from_fn(trace_request))
        .with_state(state)
}

async fn health_handler() -> Json<RestResponse> {
    RestResponse::ok(format!("profiledb {} healthy", env!("CARGO_PKG_VERSION")))
}

async fn register_udf_handler(
    State(state): State<AppState>,
    Json(payload): Json<RegisterUdfRest>,
) -> ApiResult<RestResponse> {
    state.engine.register_udf(&payload.file_name, &payload.source)?;
    Ok(RestResponse::ok(format!("udf {} registering", payload.file_name)))
}

async fn udf_status_handler(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> ApiResult<TaskStatus> {
    Ok(Json(state.engine.udf_status(&file_name)?))
}

async fn remove_udf_handler(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> ApiResult<RestResponse> {
    state.engine.remove_udf(&file_name)?;
    Ok(RestResponse::ok(format!("udf {file_name} removed")))
}

async fn create_index_handler(
    State(state): State<AppState>,
    Json(spec): Json<IndexSpec>,
) -> ApiResult<RestResponse> {
    state.engine.create_index(&spec)?;
    Ok(RestResponse::ok(format!("index {} building", spec.name)))
}

async fn index_status_handler(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<TaskStatus> {
    Ok(Json(state.engine.index_status(&namespace, &name)?))
}

async fn drop_index_handler(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<RestResponse> {
    state.engine.drop_index(&namespace, &name)?;
    Ok(RestResponse::ok(format!("index {name} dropped")))
}

async fn put_record_handler(
    State(state): State<AppState>,
    Json(payload): Json<PutRecordRest>,
) -> ApiResult<RestResponse> {
    state.engine.put(&payload.key, &payload.bins)?;
    Ok(RestResponse::ok(format!("record {} written", payload.key)))
}

async fn get_record_handler(
    State(state): State<AppState>,
    Json(key): Json<Key>,
) -> ApiResult<Option<Record>> {
    Ok(Json(state.engine.get(&key)?))
}

async fn delete_record_handler(
    State(state): State<AppState>,
    Json(key): Json<Key>,
) -> ApiResult<DeleteResponse> {
    let existed = state.engine.delete(&key)?;
    Ok(Json(DeleteResponse { existed }))
}

async fn open_query_handler(
    State(state): State<AppState>,
    Json(stmt): Json<Statement>,
) -> ApiResult<CursorOpened> {
    let cursor = state.engine.open_query(&stmt)?;
    Ok(Json(CursorOpened { cursor }))
}

async fn open_aggregate_handler(
    State(state): State<AppState>,
    Json(payload): Json<AggregateRest>,
) -> ApiResult<CursorOpened> {
    let cursor = state.engine.open_aggregate(&payload.statement, &payload.call)?;
    Ok(Json(CursorOpened { cursor }))
}

async fn fetch_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<FetchParams>,
) -> ApiResult<Batch> {
    let max = params.max.unwrap_or(crate::config::DEFAULT_BATCH_SIZE);
    Ok(Json(state.engine.fetch(CursorId(id), max)?))
}

async fn close_cursor_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Json<RestResponse> {
    state.engine.close_cursor(CursorId(id));
    RestResponse::ok(format!("cursor {id} closed"))
}

async fn info_handler(
    State(state): State<AppState>,
    Path(command): Path<String>,
) -> ApiResult<InfoResponse> {
    let response = state.engine.info(&command)?;
    Ok(Json(InfoResponse { command, response }))
}
