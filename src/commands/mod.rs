//! HTTP surface over [`Workbench`]. Every handler authenticates from the
//! two session cookies and maps failures onto `{code, message}` bodies.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::credentials::{LoginRequest, Principal};
use crate::error::WorkbenchError;
use crate::models::{QueryResult, RoleMetadata, RowEdit, RowInsert, SessionLifetime, TransactionId, TransactionState};
use crate::session::cookie::SessionCookie;
use crate::state::{QueryRequest, QueryResponse, StartTransactionRequest, TablePageRequest, Workbench};

type AppState = Arc<Workbench>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, HeaderMap, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

pub fn router(workbench: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/login", post(login))
        .route("/v1/logout", post(logout))
        .route("/v1/resources", get(resources))
        .route("/v1/tables/page", post(read_table_page))
        .route("/v1/query", post(execute_query))
        .route("/v1/transactions", post(start_transaction))
        .route("/v1/transactions/current", get(current_transaction))
        .route("/v1/transactions/{id}", get(get_transaction))
        .route("/v1/transactions/{id}/edits", post(buffer_edit))
        .route("/v1/transactions/{id}/deletes", post(buffer_delete))
        .route("/v1/transactions/{id}/inserts", post(buffer_insert))
        .route("/v1/transactions/{id}/commit", post(commit))
        .route("/v1/transactions/{id}/rollback", post(rollback))
        .route("/v1/metadata/refresh", post(refresh_metadata))
        .with_state(workbench)
}

async fn healthz() -> &'static str {
    "ok"
}

fn status_for(err: &WorkbenchError) -> StatusCode {
    match err {
        WorkbenchError::InputInvalid(_) | WorkbenchError::MultiStatementForbidden | WorkbenchError::MalformedHash => {
            StatusCode::BAD_REQUEST
        }
        WorkbenchError::AuthFailed(_)
        | WorkbenchError::TamperDetected
        | WorkbenchError::SessionExpired
        | WorkbenchError::SessionNotFound => StatusCode::UNAUTHORIZED,
        WorkbenchError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        WorkbenchError::NotFound(_) | WorkbenchError::Miss(_) => StatusCode::NOT_FOUND,
        WorkbenchError::Conflict(_) => StatusCode::CONFLICT,
        WorkbenchError::TransactionExpired(_) => StatusCode::GONE,
        WorkbenchError::QueryFailed { transient: true, .. } => StatusCode::SERVICE_UNAVAILABLE,
        WorkbenchError::QueryFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        WorkbenchError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        WorkbenchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn append_cookies(headers: &mut HeaderMap, cookies: [String; 2]) {
    for cookie in cookies {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "dropping unencodable Set-Cookie header"),
        }
    }
}

/// A cookie that cannot authenticate its session is useless to the browser,
/// so these errors also expire it.
fn error_headers(err: &WorkbenchError, secure_cookies: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if matches!(
        err,
        WorkbenchError::TamperDetected
            | WorkbenchError::SessionExpired
            | WorkbenchError::SessionNotFound
            | WorkbenchError::AuthFailed(_)
    ) {
        append_cookies(&mut headers, SessionCookie::clear_headers(secure_cookies));
    }
    headers
}

fn api_error(workbench: &Workbench, err: WorkbenchError) -> ApiError {
    let status = status_for(&err);
    let headers = error_headers(&err, workbench.config().secure_cookies);
    if status.is_server_error() {
        warn!(code = err.code(), error = %err, "request failed");
    } else {
        debug!(code = err.code(), error = %err, "request rejected");
    }
    (
        status,
        headers,
        Json(ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    )
}

fn body<T>(workbench: &Workbench, req: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    req.map(|Json(inner)| inner)
        .map_err(|rejection| api_error(workbench, WorkbenchError::InputInvalid(rejection.body_text())))
}

fn cookie_from(headers: &HeaderMap) -> Result<SessionCookie, WorkbenchError> {
    let mut joined = String::new();
    for value in headers.get_all(header::COOKIE) {
        let value = value
            .to_str()
            .map_err(|_| WorkbenchError::InputInvalid("Cookie header is not visible ASCII".to_string()))?;
        if !joined.is_empty() {
            joined.push_str("; ");
        }
        joined.push_str(value);
    }
    SessionCookie::from_header(&joined)
}

async fn principal(workbench: &Workbench, headers: &HeaderMap) -> ApiResult<Principal> {
    let cookie = cookie_from(headers).map_err(|e| api_error(workbench, e))?;
    workbench
        .authenticate(&cookie)
        .await
        .map_err(|e| api_error(workbench, e))
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    session_id: String,
    username: String,
    expires_at: chrono::DateTime<chrono::Utc>,
    resources: Arc<RoleMetadata>,
}

async fn login(
    State(workbench): State<AppState>,
    req: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<(HeaderMap, Json<LoginResponse>)> {
    let req = body(&workbench, req)?;
    let cancel = CancelToken::new();
    let _guard = cancel.drop_guard();
    let outcome = workbench
        .login(&req, &cancel)
        .await
        .map_err(|e| api_error(&workbench, e))?;

    let max_age = match outcome.session.lifetime {
        SessionLifetime::Long => Some(workbench.credentials().policy().ttl(SessionLifetime::Long)),
        SessionLifetime::Short => None,
    };
    let mut headers = HeaderMap::new();
    append_cookies(
        &mut headers,
        outcome.cookie.set_cookie_headers(workbench.config().secure_cookies, max_age),
    );
    Ok((
        headers,
        Json(LoginResponse {
            session_id: outcome.session.id.clone(),
            username: outcome.session.username.clone(),
            expires_at: outcome.session.expires_at,
            resources: outcome.metadata,
        }),
    ))
}

async fn logout(State(workbench): State<AppState>, headers: HeaderMap) -> ApiResult<(StatusCode, HeaderMap)> {
    let cookie = cookie_from(&headers).map_err(|e| api_error(&workbench, e))?;
    workbench.logout(&cookie).await.map_err(|e| api_error(&workbench, e))?;
    let mut out = HeaderMap::new();
    append_cookies(&mut out, SessionCookie::clear_headers(workbench.config().secure_cookies));
    Ok((StatusCode::NO_CONTENT, out))
}

async fn resources(State(workbench): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Arc<RoleMetadata>>> {
    let principal = principal(&workbench, &headers).await?;
    workbench
        .resources(&principal)
        .await
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

async fn read_table_page(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<TablePageRequest>, JsonRejection>,
) -> ApiResult<Json<QueryResult>> {
    let principal = principal(&workbench, &headers).await?;
    let req = body(&workbench, req)?;
    let cancel = CancelToken::new();
    let _guard = cancel.drop_guard();
    workbench
        .read_table_page(&principal, &req, &cancel)
        .await
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

async fn execute_query(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<Json<QueryResponse>> {
    let principal = principal(&workbench, &headers).await?;
    let req = body(&workbench, req)?;
    let cancel = CancelToken::new();
    let _guard = cancel.drop_guard();
    workbench
        .execute_query(&principal, &req, &cancel)
        .await
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

async fn start_transaction(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<StartTransactionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TransactionState>)> {
    let principal = principal(&workbench, &headers).await?;
    let req = body(&workbench, req)?;
    workbench
        .start_transaction(&principal, &req)
        .await
        .map(|state| (StatusCode::CREATED, Json(state)))
        .map_err(|e| api_error(&workbench, e))
}

async fn current_transaction(
    State(workbench): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Option<TransactionState>>> {
    let principal = principal(&workbench, &headers).await?;
    workbench
        .transaction_status(&principal)
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

async fn get_transaction(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TransactionState>> {
    let principal = principal(&workbench, &headers).await?;
    workbench
        .transaction(&principal, TransactionId(id))
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

async fn buffer_edit(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    req: Result<Json<RowEdit>, JsonRejection>,
) -> ApiResult<Json<TransactionState>> {
    let principal = principal(&workbench, &headers).await?;
    let edit = body(&workbench, req)?;
    workbench
        .buffer_edit(&principal, TransactionId(id), edit)
        .await
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    row_index: String,
}

async fn buffer_delete(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    req: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<Json<TransactionState>> {
    let principal = principal(&workbench, &headers).await?;
    let req = body(&workbench, req)?;
    workbench
        .buffer_delete(&principal, TransactionId(id), req.row_index)
        .await
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

async fn buffer_insert(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    req: Result<Json<RowInsert>, JsonRejection>,
) -> ApiResult<Json<TransactionState>> {
    let principal = principal(&workbench, &headers).await?;
    let insert = body(&workbench, req)?;
    workbench
        .buffer_insert(&principal, TransactionId(id), insert)
        .await
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

#[derive(Debug, Serialize)]
struct CommitResponse {
    success: bool,
    transaction: TransactionState,
    affected_rows: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorResponse>,
}

async fn commit(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let principal = principal(&workbench, &headers).await?;
    let cancel = CancelToken::new();
    let _guard = cancel.drop_guard();
    let outcome = workbench
        .commit(&principal, TransactionId(id), &cancel)
        .await
        .map_err(|e| api_error(&workbench, e))?;

    let status = match &outcome.error {
        None => StatusCode::OK,
        Some(err) => status_for(err),
    };
    Ok((
        status,
        Json(CommitResponse {
            success: outcome.is_success(),
            error: outcome.error.map(|err| ErrorResponse {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
            transaction: outcome.state,
            affected_rows: outcome.affected_rows,
        }),
    ))
}

async fn rollback(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TransactionState>> {
    let principal = principal(&workbench, &headers).await?;
    workbench
        .rollback(&principal, TransactionId(id))
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}

#[derive(Debug, Default, Deserialize)]
struct RefreshRequest {
    #[serde(default)]
    role: Option<String>,
}

async fn refresh_metadata(
    State(workbench): State<AppState>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult<Json<Arc<RoleMetadata>>> {
    let principal = principal(&workbench, &headers).await?;
    // an empty body refreshes the caller's own role
    let req: RefreshRequest = if raw.iter().all(u8::is_ascii_whitespace) {
        RefreshRequest::default()
    } else {
        serde_json::from_slice(&raw)
            .map_err(|e| api_error(&workbench, WorkbenchError::InputInvalid(format!("invalid JSON body: {e}"))))?
    };
    let cancel = CancelToken::new();
    let _guard = cancel.drop_guard();
    workbench
        .refresh_metadata(&principal, req.role.as_deref(), &cancel)
        .await
        .map(Json)
        .map_err(|e| api_error(&workbench, e))
}
