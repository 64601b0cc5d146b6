//! Engagement tracking endpoints (open pixel, click redirect) and provider
//! webhooks (reply, bounce, unsubscribe).

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use campaign_core::types::BounceKind;
use campaign_flow::{IngestReport, SignalKind, TrackingSignal};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::rest::{ApiError, ApiResult, AppState};

/// Transparent 1x1 GIF.
const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Query string carried by tracking links embedded in sent email.
#[derive(Debug, Deserialize)]
pub struct TrackQuery {
    #[serde(rename = "c")]
    pub campaign_id: Uuid,
    #[serde(rename = "l")]
    pub lead_id: String,
    #[serde(rename = "m", default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl TrackQuery {
    fn signal(&self, kind: SignalKind, headers: &HeaderMap) -> TrackingSignal {
        let mut signal = TrackingSignal::new(kind, self.campaign_id, self.lead_id.clone());
        signal.message_id = self.message_id.clone();
        signal.ip = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string());
        signal.user_agent = header_str(headers, header::USER_AGENT.as_str()).map(str::to_string);
        signal
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// GET /t/open: Open-tracking pixel. The GIF is served even when the hit
/// cannot be recorded.
pub async fn track_open(
    State(state): State<AppState>,
    Query(query): Query<TrackQuery>,
    headers: HeaderMap,
) -> Response {
    let signal = query.signal(SignalKind::PixelHit, &headers);
    if let Err(e) = state.engine.ingest_signal(&signal, Utc::now()).await {
        warn!(campaign_id = %query.campaign_id, lead_id = %query.lead_id, error = %e, "Open hit not recorded");
    }
    metrics::counter!("api.tracking.opens").increment(1);

    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        PIXEL_GIF,
    )
        .into_response()
}

/// GET /t/click: Records the click and answers with a 302 to the target URL.
pub async fn track_click(
    State(state): State<AppState>,
    Query(query): Query<TrackQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let url = match query.url.as_deref() {
        Some(url) if url.starts_with("https://") || url.starts_with("http://") => url.to_string(),
        _ => return Err(ApiError::bad_request("click target must be an http(s) URL")),
    };

    let signal = query.signal(SignalKind::ClickRedirect { url: url.clone() }, &headers);
    if let Err(e) = state.engine.ingest_signal(&signal, Utc::now()).await {
        warn!(campaign_id = %query.campaign_id, lead_id = %query.lead_id, error = %e, "Click not recorded");
    }
    metrics::counter!("api.tracking.clicks").increment(1);
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

/// Body of provider webhooks.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub campaign_id: Uuid,
    pub lead_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bounce_kind: Option<BounceKind>,
}

impl WebhookPayload {
    fn signal(&self, kind: SignalKind) -> TrackingSignal {
        let mut signal = TrackingSignal::new(kind, self.campaign_id, self.lead_id.clone());
        signal.message_id = self.message_id.clone();
        signal.idempotency_key = self.idempotency_key.clone();
        signal.at = self.occurred_at;
        signal
    }
}

async fn ingest_webhook(
    state: &AppState,
    signal: TrackingSignal,
) -> ApiResult<(StatusCode, Json<IngestReport>)> {
    if signal.lead_id.trim().is_empty() {
        return Err(ApiError::bad_request("'lead_id' must not be empty"));
    }
    let report = state.engine.ingest_signal(&signal, Utc::now()).await?;
    metrics::counter!("api.webhooks", "signal" => signal.kind.event_type().as_str()).increment(1);
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// POST /v1/webhooks/reply
pub async fn webhook_reply(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> ApiResult<(StatusCode, Json<IngestReport>)> {
    ingest_webhook(&state, payload.signal(SignalKind::ReplyDetected)).await
}

/// POST /v1/webhooks/bounce: `bounce_kind` defaults to hard.
pub async fn webhook_bounce(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> ApiResult<(StatusCode, Json<IngestReport>)> {
    let kind = payload.bounce_kind.unwrap_or_default();
    ingest_webhook(&state, payload.signal(SignalKind::Bounce { kind })).await
}

/// POST /v1/webhooks/unsubscribe
pub async fn webhook_unsubscribe(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> ApiResult<(StatusCode, Json<IngestReport>)> {
    ingest_webhook(&state, payload.signal(SignalKind::Unsubscribe)).await
}
