//! REST API handlers for the campaign control API and operational endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use campaign_core::types::Lead;
use campaign_core::{CampaignError, ValidationError};
use campaign_flow::types::{CampaignStatus, CampaignSummary, FlowDocument, RecipientCursor};
use campaign_flow::FlowEngine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Maximum nodes accepted in one flow document.
const MAX_FLOW_NODES: usize = 500;

/// Maximum lead id / email length.
const MAX_FIELD_LEN: usize = 256;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: FlowEngine,
    pub node_id: String,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: FlowEngine, node_id: impl Into<String>) -> Self {
        Self {
            engine,
            node_id: node_id.into(),
            start_time: Instant::now(),
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ValidationError>,
}

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: "bad_request".to_string(),
                message: message.into(),
                details: None,
            },
        }
    }
}

impl From<CampaignError> for ApiError {
    fn from(err: CampaignError) -> Self {
        let (status, code) = match &err {
            CampaignError::InvalidFlow(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_flow"),
            CampaignError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CampaignError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            CampaignError::CampaignHalted(_) => (StatusCode::SERVICE_UNAVAILABLE, "campaign_halted"),
            CampaignError::Serialization(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            CampaignError::Config(_) | CampaignError::Io(_) | CampaignError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %err, "Request failed");
            metrics::counter!("api.errors").increment(1);
        }

        let details = match &err {
            CampaignError::InvalidFlow(v) => Some(v.clone()),
            _ => None,
        };
        Self {
            status,
            body: ErrorResponse {
                error: code.to_string(),
                message: err.to_string(),
                details,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ─── Control API ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivationResponse {
    pub campaign_id: Uuid,
    pub flow_id: Uuid,
    pub version: u32,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    #[serde(default)]
    pub canceled_cursors: usize,
}

/// POST /v1/campaigns/:id/flows: Validate and activate a new flow version.
pub async fn activate_flow(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Json(document): Json<FlowDocument>,
) -> ApiResult<(StatusCode, Json<ActivationResponse>)> {
    if document.nodes.len() > MAX_FLOW_NODES {
        metrics::counter!("api.validation_errors").increment(1);
        return Err(ApiError::bad_request("flow exceeds maximum number of nodes"));
    }

    let graph = state.engine.activate_flow(campaign_id, document, Utc::now())?;
    Ok((
        StatusCode::CREATED,
        Json(ActivationResponse {
            campaign_id,
            flow_id: graph.id(),
            version: graph.version(),
            activated_at: graph.definition().activated_at,
        }),
    ))
}

/// POST /v1/campaigns/:id/enroll: Enroll a lead into the active flow.
pub async fn enroll_lead(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Json(lead): Json<Lead>,
) -> ApiResult<(StatusCode, Json<RecipientCursor>)> {
    if lead.id.trim().is_empty() || lead.id.len() > MAX_FIELD_LEN {
        return Err(ApiError::bad_request("lead 'id' must be 1-256 characters"));
    }
    if lead.email.len() > MAX_FIELD_LEN || !lead.email.contains('@') {
        return Err(ApiError::bad_request("lead 'email' is not a valid address"));
    }

    let cursor = state.engine.enroll(campaign_id, lead, Utc::now()).await?;
    metrics::counter!("api.enrollments").increment(1);
    Ok((StatusCode::CREATED, Json(cursor)))
}

/// POST /v1/campaigns/:id/pause
pub async fn pause_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<ControlResponse>> {
    let canceled = state.engine.pause_campaign(campaign_id, Utc::now())?;
    info!(campaign_id = %campaign_id, canceled, "Pause requested via API");
    Ok(Json(ControlResponse {
        campaign_id,
        status: state.engine.status(&campaign_id),
        canceled_cursors: canceled,
    }))
}

/// POST /v1/campaigns/:id/cancel
pub async fn cancel_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<ControlResponse>> {
    let canceled = state.engine.cancel_campaign(campaign_id, Utc::now())?;
    warn!(campaign_id = %campaign_id, canceled, "Cancel requested via API");
    Ok(Json(ControlResponse {
        campaign_id,
        status: state.engine.status(&campaign_id),
        canceled_cursors: canceled,
    }))
}

/// POST /v1/campaigns/:id/resume
pub async fn resume_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<ControlResponse>> {
    state.engine.resume_campaign(campaign_id)?;
    Ok(Json(ControlResponse {
        campaign_id,
        status: state.engine.status(&campaign_id),
        canceled_cursors: 0,
    }))
}

/// GET /v1/campaigns/:id: Status, totals and cursor state counts.
pub async fn campaign_summary(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignSummary>> {
    Ok(Json(state.engine.campaign_summary(&campaign_id)?))
}

/// GET /v1/campaigns/:id/leads/:lead_id: The lead's cursors in the campaign.
pub async fn lead_cursors(
    State(state): State<AppState>,
    Path((campaign_id, lead_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<Vec<RecipientCursor>>> {
    let cursors = state.engine.cursors_for_lead(&campaign_id, &lead_id);
    if cursors.is_empty() {
        return Err(CampaignError::NotFound(format!(
            "lead {} is not enrolled in campaign {}",
            lead_id, campaign_id
        ))
        .into());
    }
    Ok(Json(cursors))
}

// ─── Operational ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub cursors: usize,
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cursors: state.engine.cursor_count(),
    })
}

/// GET /live: Liveness probe for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
