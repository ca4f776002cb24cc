//! Web server entrypoints live here.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, Request, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    add_extension::AddExtensionLayer,
    classify::ServerErrorsFailureClass,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::services::auth::{AuthError, AuthService};
use crate::services::call_stats::CallReportSet;
use crate::services::feed::{CallFeed, SourceRecord};
use crate::services::reconcile::{ReconcileEngine, ReconcileError};
use crate::services::store::AnalysisReport;

const HEALTHZ_PATH: &str = "/healthz";
const LOGIN_PATH: &str = "/login";
const REPORTS_PATH: &str = "/reports";
const REPORT_PATH: &str = "/reports/{key}";
const ANALYZE_PATH: &str = "/reports/analyze/{key}";
const CALL_REPORTS_PATH: &str = "/call-reports";
const CALL_REPORT_STATS_PATH: &str = "/call-reports/stats";
const CALL_REPORT_PATH: &str = "/call-reports/{id}";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_UNAUTHORIZED: &str = "unauthorized";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_METHOD_NOT_ALLOWED: &str = "method_not_allowed";
const ERROR_INTERNAL: &str = "internal_server_error";
const REQUEST_ID_HEADER: &str = "x-request-id";
const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

pub type AppStateHandle = Arc<AppState>;

pub struct AppState {
    pub engine: ReconcileEngine,
    pub feed: Arc<dyn CallFeed>,
    pub auth: Arc<AuthService>,
    pub call_reports: CallReportSet,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Default)]
struct AnalyzeQuery {
    #[serde(default)]
    force: bool,
}

/// One feed record with its reconciliation status. Every feed record is
/// listed whether or not a report exists for it yet.
#[derive(Debug, Serialize)]
struct ReportSummary {
    key: String,
    store_name: String,
    recording_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
    is_converted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_date: Option<String>,
    analyzed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<AnalysisReport>,
}

impl ReportSummary {
    fn new(record: SourceRecord, analysis: Option<AnalysisReport>) -> Self {
        debug_assert!(analysis.as_ref().is_none_or(|report| report.key == record.key));
        Self {
            key: record.key,
            store_name: record.store_name,
            recording_url: record.recording_url,
            duration: record.duration,
            is_converted: record.is_converted,
            call_date: record.call_date,
            analyzed: analysis.is_some(),
            analysis,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    key: String,
    deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                field: None,
                request_id: None,
            },
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        debug_assert!(!field.is_empty());
        self.body.field = Some(field.to_string());
        self
    }

    fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        if let Some(id) = request_id {
            debug_assert!(!id.is_empty());
            self.body.request_id = Some(id.to_string());
        }
        self
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::UNAUTHORIZED, ERROR_UNAUTHORIZED, message)
    }

    fn not_found(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, message).with_field(field)
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::NOT_FOUND,
            ERROR_NOT_FOUND,
            format!("resource `{path}` not found"),
        )
    }

    fn method_not_allowed(method: &str, path: &str) -> Self {
        debug_assert!(!method.is_empty());
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ERROR_METHOD_NOT_ALLOWED,
            format!("method `{method}` not allowed for `{path}`"),
        )
    }
}

impl From<ReconcileError> for ApiError {
    fn from(error: ReconcileError) -> Self {
        match error {
            ReconcileError::RecordNotFound { key } => {
                ApiError::not_found("key", format!("no record with key `{key}`"))
            }
            ReconcileError::Feed(inner) => {
                tracing::error!(event = "api.feed_error", error = %inner);
                ApiError::internal()
            }
            ReconcileError::Storage(inner) => {
                tracing::error!(event = "api.storage_error", error = %inner);
                ApiError::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn build_api_router() -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with('/'));
    debug_assert!(ANALYZE_PATH.starts_with(REPORTS_PATH));

    Router::new()
        .route(HEALTHZ_PATH, get(healthz).fallback(method_not_allowed_handler))
        .route(LOGIN_PATH, post(login).fallback(method_not_allowed_handler))
        .route(REPORTS_PATH, get(list_reports).fallback(method_not_allowed_handler))
        .route(
            REPORT_PATH,
            get(get_report)
                .delete(delete_report)
                .fallback(method_not_allowed_handler),
        )
        .route(ANALYZE_PATH, post(analyze_report).fallback(method_not_allowed_handler))
        .route(
            CALL_REPORTS_PATH,
            get(list_call_reports).fallback(method_not_allowed_handler),
        )
        .route(
            CALL_REPORT_STATS_PATH,
            get(call_report_stats).fallback(method_not_allowed_handler),
        )
        .route(
            CALL_REPORT_PATH,
            get(get_call_report).fallback(method_not_allowed_handler),
        )
}

pub async fn serve(listen_addr: &str, state: AppStateHandle) -> Result<(), ServerError> {
    debug_assert!(listen_addr.len() <= 128);
    debug_assert!(!listen_addr.contains('\n'));

    let listen_addr = parse_listen_addr(listen_addr)?;

    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "callsight server listening");

    spawn_warm_pass(state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);

    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_app_router(state);

    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });
    debug_assert!(DRAIN_TIMEOUT.as_secs() == 10);

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

/// Converge the store against the feed in the background so the API serves
/// cached reports while the first pass runs.
fn spawn_warm_pass(state: AppStateHandle) {
    tokio::spawn(async move {
        let feed = state.feed.clone();
        match state.engine.reconcile_all(feed.as_ref()).await {
            Ok(report) => tracing::info!(
                event = "server.warm_pass_finished",
                newly_processed = report.newly_processed,
                already_reconciled = report.already_reconciled,
                failed = report.failed,
            ),
            Err(error) => tracing::error!(event = "server.warm_pass_failed", error = %error),
        }
    });
}

pub fn build_app_router(state: AppStateHandle) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with('/'));
    debug_assert_eq!(HEALTHZ_STATUS, "ok");

    let auth = state.auth.clone();
    let mut router = Router::new()
        .merge(build_api_router())
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(auth, auth_middleware));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %request.uri().path(),
                request_id = %request_id
            )
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );

    // The admin UI is served from arbitrary origins during rollout.
    router = router.layer(CorsLayer::permissive());
    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    let make_request_id = MakeRequestUuid;
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, make_request_id));

    router.layer(AddExtensionLayer::new(state))
}

fn is_public_path(path: &str) -> bool {
    path == HEALTHZ_PATH || path == LOGIN_PATH
}

async fn auth_middleware(
    State(auth): State<Arc<AuthService>>,
    req: Request<Body>,
    next: Next,
) -> axum::response::Response {
    let path = req.uri().path();
    if is_public_path(path) {
        return next.run(req).await;
    }

    let request_id = header_request_id(req.headers());
    let token = bearer_token(req.headers());
    match token {
        Some(token) if auth.validate(token) => next.run(req).await,
        Some(_) => ApiError::unauthorized("token is invalid or expired")
            .with_request_id(request_id.as_deref())
            .into_response(),
        None => ApiError::unauthorized("missing bearer token")
            .with_request_id(request_id.as_deref())
            .into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn healthz() -> impl IntoResponse {
    debug_assert_eq!(HEALTHZ_STATUS, "ok");

    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn login(
    Extension(state): Extension<AppStateHandle>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    match state.auth.login(&request.email, &request.password) {
        Ok(session) => Ok(Json(LoginResponse {
            token: session.token,
            expires_at: session.expires_at,
        })),
        Err(AuthError::InvalidCredentials) => {
            Err(ApiError::unauthorized("invalid email or password"))
        }
        Err(AuthError::NotConfigured) => {
            tracing::warn!(event = "api.login_unconfigured");
            Err(ApiError::unauthorized("authentication is not configured"))
        }
    }
}

async fn list_reports(
    Extension(state): Extension<AppStateHandle>,
) -> Result<Json<Vec<ReportSummary>>, ApiError> {
    let records = state.feed.records().map_err(|error| {
        tracing::error!(event = "api.feed_error", error = %error);
        ApiError::internal()
    })?;

    let store = state.engine.store();
    let summaries = records
        .into_iter()
        .map(|record| {
            let analysis = store.get(&record.key);
            ReportSummary::new(record, analysis)
        })
        .collect();
    Ok(Json(summaries))
}

async fn get_report(
    Extension(state): Extension<AppStateHandle>,
    Path(key): Path<String>,
) -> Result<Json<AnalysisReport>, ApiError> {
    state
        .engine
        .store()
        .get(&key)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("key", format!("no report for key `{key}`")))
}

async fn delete_report(
    Extension(state): Extension<AppStateHandle>,
    Path(key): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let deleted = state.engine.store().remove(&key).map_err(|error| {
        tracing::error!(event = "api.storage_error", error = %error);
        ApiError::internal()
    })?;
    if !deleted {
        return Err(ApiError::not_found("key", format!("no report for key `{key}`")));
    }
    tracing::info!(event = "api.report_deleted", key = %key);
    Ok(Json(DeletedResponse { key, deleted: true }))
}

async fn analyze_report(
    Extension(state): Extension<AppStateHandle>,
    Path(key): Path<String>,
    Query(query): Query<AnalyzeQuery>,
) -> Result<Json<AnalysisReport>, ApiError> {
    let report = state
        .engine
        .reconcile_one(state.feed.as_ref(), &key, query.force)
        .await?;
    Ok(Json(report))
}

async fn list_call_reports(
    Extension(state): Extension<AppStateHandle>,
) -> Result<Json<Vec<crate::services::call_stats::CallReport>>, ApiError> {
    state.call_reports.all().map(Json).map_err(|error| {
        tracing::error!(event = "api.call_reports_failed", error = %error);
        ApiError::internal()
    })
}

async fn get_call_report(
    Extension(state): Extension<AppStateHandle>,
    Path(id): Path<String>,
) -> Result<Json<crate::services::call_stats::CallReport>, ApiError> {
    let report = state.call_reports.by_id(&id).map_err(|error| {
        tracing::error!(event = "api.call_reports_failed", error = %error);
        ApiError::internal()
    })?;
    report
        .map(Json)
        .ok_or_else(|| ApiError::not_found("id", format!("no call report with id `{id}`")))
}

async fn call_report_stats(
    Extension(state): Extension<AppStateHandle>,
) -> Result<Json<crate::services::call_stats::CallStats>, ApiError> {
    state.call_reports.stats().map(Json).map_err(|error| {
        tracing::error!(event = "api.call_reports_failed", error = %error);
        ApiError::internal()
    })
}

async fn method_not_allowed_handler(request: Request<Body>) -> axum::response::Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::method_not_allowed(&method, &path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

async fn not_found_handler(request: Request<Body>) -> axum::response::Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::resource_not_found(&path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

async fn wait_for_shutdown() -> ShutdownEvent {
    debug_assert!(DRAIN_TIMEOUT >= Duration::from_secs(1));

    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    debug_assert!(addr.len() <= 128);
    debug_assert!(!addr.contains('\n'));

    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    debug_assert!(addr.port() > 0);
    debug_assert!(addr.ip().is_ipv4() || addr.ip().is_ipv6());

    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(!sender.is_closed());
    debug_assert!(DRAIN_TIMEOUT.as_secs() <= 10);
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(DRAIN_TIMEOUT.as_secs() >= 1);
    debug_assert!(DRAIN_TIMEOUT.as_secs() <= 60);
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            debug_assert!(event != ShutdownEvent::Pending);
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_parses_header_forms() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc-123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc-123"));

        headers.insert(AUTHORIZATION, "Bearer   ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn public_paths_skip_auth() {
        assert!(is_public_path(HEALTHZ_PATH));
        assert!(is_public_path(LOGIN_PATH));
        assert!(!is_public_path(REPORTS_PATH));
        assert!(!is_public_path(CALL_REPORTS_PATH));
    }

    #[test]
    fn parse_listen_addr_rejects_blank_and_garbage() {
        assert!(matches!(
            parse_listen_addr("  "),
            Err(ServerError::EmptyListenAddr)
        ));
        assert!(matches!(
            parse_listen_addr("not-an-addr"),
            Err(ServerError::InvalidListenAddr { .. })
        ));
        assert!(parse_listen_addr("127.0.0.1:8080").is_ok());
    }
}
