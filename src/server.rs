//! HTTP binding of the admission protocol.
//!
//! ```text
//! POST /allocate            generic route, withReport from the body
//! POST /allocate/report     implies withReport = true
//! GET  /jobs/:job_id        job status board entry
//! GET  /decisions/:id       stored decision record
//! GET  /healthz             liveness
//! GET  /metrics             admission counters
//! ```
//!
//! Every error body is an [`ErrorResponse`]; rate-limited responses also
//! carry a `Retry-After` header.

use crate::admission::{AdmissionHandler, AdmissionOutcome};
use crate::allocation::{
    AdmissionStatus, AllocateRequest, DecisionId, ErrorResponse, JobId, RouteKind, ALLOCATE_PATH,
    ALLOCATE_REPORT_PATH, IDEMPOTENCY_KEY_HEADER, JOB_STATUS_PREFIX, PAYMENT_HEADER,
};
use crate::error::Error;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

/// Header carrying the client address when behind a proxy.
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Clone)]
struct AppState {
    handler: Arc<AdmissionHandler>,
    trust_forwarded_for: bool,
}

/// Build the gateway router.
///
/// Needs `ConnectInfo<SocketAddr>`: serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(handler: Arc<AdmissionHandler>, trust_forwarded_for: bool) -> Router {
    Router::new()
        .route(ALLOCATE_PATH, post(allocate))
        .route(ALLOCATE_REPORT_PATH, post(allocate_report))
        .route(&format!("{JOB_STATUS_PREFIX}/:job_id"), get(job_status))
        .route("/decisions/:decision_id", get(decision))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(AppState {
            handler,
            trust_forwarded_for,
        })
}

// =============================================================================
// Error mapping
// =============================================================================

/// An error ready to be sent as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorResponse {
                error: "not_found".to_string(),
                message: format!("{what} not found"),
                retry_after_secs: None,
            },
        }
    }

    /// HTTP status of the response.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// HTTP status for an error.
#[must_use]
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::InvalidPaymentProof(_) | Error::PaymentNotConfirmed(_) => {
            StatusCode::PAYMENT_REQUIRED
        }
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::UpstreamUnavailable(_)
        | Error::PipelinePhaseFailed { .. }
        | Error::PhaseTimeout { .. }
        | Error::JobTimeout { .. } => StatusCode::BAD_GATEWAY,
        Error::Config(_)
        | Error::Startup(_)
        | Error::InvalidState(_)
        | Error::Io(_)
        | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self {
            status: status_for(&e),
            body: ErrorResponse::from(&e),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Error::Validation(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("{} {}: {}", self.status, self.body.error, self.body.message);
        }
        let retry_after = self.body.retry_after_secs;
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

fn outcome_response(outcome: AdmissionOutcome) -> Response {
    match outcome {
        AdmissionOutcome::PaymentRequired(body) => {
            (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
        }
        AdmissionOutcome::Admitted(body) => {
            let status = if body.status == AdmissionStatus::AlreadyComplete {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            (status, Json(body)).into_response()
        }
    }
}

// =============================================================================
// Request metadata
// =============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, Error> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| Error::Validation(format!("{name} header is not valid text")))
        })
        .transpose()
}

/// Client address: the socket peer, or the first `X-Forwarded-For` entry
/// when the proxy is trusted and the entry parses.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

// =============================================================================
// Handlers
// =============================================================================

async fn allocate(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<AllocateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    submit(&state, RouteKind::Generic, peer, &headers, body).await
}

async fn allocate_report(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<AllocateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    submit(&state, RouteKind::WithReport, peer, &headers, body).await
}

async fn submit(
    state: &AppState,
    route: RouteKind,
    peer: SocketAddr,
    headers: &HeaderMap,
    body: Result<Json<AllocateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let ip = client_ip(headers, peer, state.trust_forwarded_for);
    let request = body.resolve(
        route,
        header_str(headers, IDEMPOTENCY_KEY_HEADER)?,
        header_str(headers, PAYMENT_HEADER)?,
        ip,
    )?;
    debug!("Submit {} from {} ({:?})", request.decision_id, ip, route);

    let outcome = state.handler.admit(request).await?;
    Ok(outcome_response(outcome))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = JobId::new(job_id);
    let progress = state
        .handler
        .job(&job)
        .ok_or_else(|| ApiError::not_found("job"))?;
    Ok(Json(progress).into_response())
}

async fn decision(
    State(state): State<AppState>,
    Path(decision_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = DecisionId::parse(&decision_id)?;
    let record = state
        .handler
        .decision(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("decision"))?;
    Ok(Json(record).into_response())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.handler.metrics().snapshot()).into_response()
}
