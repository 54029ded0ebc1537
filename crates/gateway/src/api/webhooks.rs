//! Inbound webhook route: the HTTP front door for webhook-type channel
//! integrations.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

use hearth_channels::webhook::WebhookInbound;
use hearth_domain::error::Error;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "x-hearth-signature";

pub async fn inbound(
    State(state): State<AppState>,
    Path(integration_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let adapter = state
        .webhooks
        .read()
        .get(&integration_id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("webhook integration {integration_id}")))?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    adapter.verify_signature(&body, signature)?;

    let inbound: WebhookInbound = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::InvalidInput(format!("webhook body: {e}"))))?;

    let accepted = adapter.handle_inbound(inbound).await?;
    Ok(Json(serde_json::json!({
        "accepted": true,
        "deduped": !accepted,
    })))
}
