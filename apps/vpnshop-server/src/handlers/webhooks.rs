use std::net::SocketAddr;

use axum::Json;
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Path, Request, State};
use serde_json::{Value, json};
use tracing::{debug, warn};
use vpnshop_db::models::enums::PaymentGatewayType;

use crate::error::WebhookError;
use crate::services::payment::WebhookRequest;
use crate::state::AppState;

pub const MAX_WEBHOOK_BODY: usize = 64 * 1024;

/// `POST /webhooks/{gateway}`. Answers 200 once the notification is
/// authenticated, whether or not it changed anything.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    request: Request,
) -> Result<Json<Value>, WebhookError> {
    let gateway_type: PaymentGatewayType = slug
        .parse()
        .map_err(|_| WebhookError::UnknownGateway(slug.clone()))?;

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_WEBHOOK_BODY)
        .await
        .map_err(|e| WebhookError::Malformed(format!("unreadable body: {}", e)))?;

    let outcome = state
        .payments
        .handle_webhook(
            gateway_type,
            WebhookRequest {
                headers: parts.headers,
                body,
                remote_addr,
            },
        )
        .await
        .inspect_err(|e| warn!("Webhook from {} rejected: {}", slug, e))?;

    debug!(
        "Webhook from {} for payment {} -> {}",
        slug, outcome.payment_id, outcome.status
    );
    Ok(Json(json!({ "ok": true })))
}
