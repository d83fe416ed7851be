use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::{
        HeaderMap, StatusCode,
        header::{ACCEPT_LANGUAGE, USER_AGENT},
    },
};
use records::FormKind;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::CacheCounts,
    client::{SubmissionContext, email_registered},
    error::{AppError, FormError},
    guard::BotSignals,
    notify::Notification,
    persistence::check_health,
    pipeline::SubmissionRequest,
    state::State as AppState,
    validator::RawFields,
};

#[derive(Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub csrf_token: String,
}

#[derive(Deserialize, Debug)]
pub struct FormPayload {
    pub session_id: Uuid,
    pub csrf_token: String,
    #[serde(flatten)]
    pub fields: RawFields,
    #[serde(default)]
    pub signals: BotSignals,
}

#[derive(Deserialize)]
pub struct ExistsQuery {
    email: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

pub async fn session_handler(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    let (session_id, csrf_token) = state.sessions.create(Instant::now().into_std());
    debug!(session = %session_id, "Session issued");

    Json(SessionResponse {
        session_id,
        csrf_token,
    })
}

pub async fn beta_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<FormPayload>, JsonRejection>,
) -> Result<Json<Notification>, AppError> {
    submit_form(FormKind::Beta, &state, &headers, payload).await
}

pub async fn contact_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<FormPayload>, JsonRejection>,
) -> Result<Json<Notification>, AppError> {
    submit_form(FormKind::Contact, &state, &headers, payload).await
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<CacheCounts> {
    Json(state.cache.counts().await)
}

pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    match check_health(state.persistence.as_ref()).await {
        Ok(latency) => (
            StatusCode::OK,
            Json(HealthResponse {
                healthy: true,
                latency_ms: Some(latency.as_millis() as u64),
                error: None,
            }),
        ),
        Err(e) => {
            warn!("Health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    healthy: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn exists_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExistsQuery>,
) -> Result<Json<ExistsResponse>, AppError> {
    let exists = email_registered(state.persistence.as_ref(), &query.email)
        .await
        .map_err(|e| {
            warn!("Email lookup failed: {e}");
            FormError::Transient(e.to_string())
        })?;

    Ok(Json(ExistsResponse { exists }))
}

fn header<'a>(headers: &'a HeaderMap, name: impl axum::http::header::AsHeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn submit_form(
    kind: FormKind,
    state: &AppState,
    headers: &HeaderMap,
    payload: Result<Json<FormPayload>, JsonRejection>,
) -> Result<Json<Notification>, AppError> {
    let Json(payload) = payload.map_err(|e| {
        warn!("Rejected {kind} payload: {e}");
        AppError::MalformedPayload
    })?;

    let Some(_pressed) = state.buttons.press(payload.session_id, kind) else {
        info!(session = %payload.session_id, "{kind} submission already in flight");
        return Err(AppError::InFlight);
    };

    let user_agent = header(headers, USER_AGENT);
    let context = SubmissionContext {
        session_id: payload.session_id.to_string(),
        fingerprint: state
            .fingerprint
            .fingerprint(user_agent, header(headers, ACCEPT_LANGUAGE)),
        user_agent: user_agent.to_string(),
    };

    let request = SubmissionRequest {
        kind,
        session_id: payload.session_id,
        csrf_token: payload.csrf_token,
        fields: payload.fields,
        signals: payload.signals,
        context,
    };

    let cancel = state.shutdown.child_token();
    let result = state.pipeline.submit(request, &cancel).await;
    let notification = Notification::for_result(&result);
    let receipt = result?;
    info!(
        client_id = %receipt.client_id,
        server_id = %receipt.server_id,
        "{kind} submission stored"
    );

    Ok(Json(notification.unwrap_or_else(|| Notification::success(receipt.message))))
}
