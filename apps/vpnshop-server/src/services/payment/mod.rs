use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use reqwest::RequestBuilder;
use serde_json::Value;
use uuid::Uuid;
use vpnshop_db::models::enums::{Currency, PaymentGatewayType, TransactionStatus};

use crate::config::AppConfig;
use crate::context::{CallContext, Interrupted};
use crate::error::GatewayError;

pub mod cryptopay;
pub mod heleket;
pub mod pal24;
pub mod platega;
pub mod stars;
pub mod wata;
pub mod yookassa;

/// Invoice request; `payment_id` is chosen by the caller and travels to the
/// gateway as the correlation field.
#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    pub payment_id: Uuid,
    /// Minor units of `currency`.
    pub amount: i64,
    pub currency: Currency,
    pub description: String,
    pub return_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLink {
    pub url: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub payment_id: Uuid,
    /// One of COMPLETED, CANCELED or PENDING.
    pub status: TransactionStatus,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn gateway_type(&self) -> PaymentGatewayType;

    async fn create_payment(
        &self,
        ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError>;

    /// Authenticates and decodes one notification. Never touches storage.
    async fn handle_webhook(
        &self,
        ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError>;
}

/// Configured adapters keyed by gateway type; shared across requests.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentGatewayType, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every adapter whose credentials are present.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        let http = reqwest::Client::new();
        let gateways = &config.gateways;

        registry.insert(Arc::new(stars::StarsGateway::new(
            http.clone(),
            config.bot.token.clone(),
            config.bot.webhook_secret.clone(),
        )));
        if let Some(cfg) = &gateways.yookassa {
            registry.insert(Arc::new(yookassa::YookassaGateway::new(http.clone(), cfg.clone())));
        }
        if let Some(cfg) = &gateways.pal24 {
            registry.insert(Arc::new(pal24::Pal24Gateway::new(http.clone(), cfg.clone())));
        }
        if let Some(cfg) = &gateways.wata {
            registry.insert(Arc::new(wata::WataGateway::new(http.clone(), cfg.clone())));
        }
        if let Some(cfg) = &gateways.platega {
            registry.insert(Arc::new(platega::PlategaGateway::new(http.clone(), cfg.clone())));
        }
        if let Some(cfg) = &gateways.cryptopay {
            registry.insert(Arc::new(cryptopay::CryptopayGateway::new(http.clone(), cfg.clone())));
        }
        if let Some(cfg) = &gateways.heleket {
            let callback = format!("{}/webhooks/heleket", config.public_url.trim_end_matches('/'));
            registry.insert(Arc::new(heleket::HeleketGateway::new(http, cfg.clone(), callback)));
        }

        tracing::info!("Payment gateways configured: {:?}", registry.configured());
        registry
    }

    pub fn insert(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.gateway_type(), gateway);
    }

    pub fn get(&self, gateway_type: PaymentGatewayType) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        self.gateways
            .get(&gateway_type)
            .cloned()
            .ok_or_else(|| GatewayError::NotConfigured(gateway_type.to_string()))
    }

    pub fn is_configured(&self, gateway_type: PaymentGatewayType) -> bool {
        self.gateways.contains_key(&gateway_type)
    }

    pub fn configured(&self) -> Vec<PaymentGatewayType> {
        let mut types: Vec<_> = self.gateways.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

pub(crate) fn interrupted(reason: Interrupted) -> GatewayError {
    match reason {
        Interrupted::DeadlineExceeded => GatewayError::Timeout,
        Interrupted::Canceled => GatewayError::Canceled,
    }
}

/// Sends under the context deadline and decodes a JSON body from a 2xx response.
pub(crate) async fn send_json(ctx: &CallContext, request: RequestBuilder) -> Result<Value, GatewayError> {
    let response = ctx
        .run(request.timeout(ctx.remaining()).send())
        .await
        .map_err(interrupted)??;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::Http {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| GatewayError::Malformed(e.to_string()))
}

pub(crate) fn json_body(request: &WebhookRequest) -> Result<Value, GatewayError> {
    serde_json::from_slice(&request.body).map_err(|e| GatewayError::InvalidWebhook(format!("body is not JSON: {}", e)))
}

pub(crate) fn header<'a>(request: &'a WebhookRequest, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn parse_payment_id(raw: Option<&str>) -> Result<Uuid, GatewayError> {
    let raw = raw.ok_or_else(|| GatewayError::InvalidWebhook("payment id missing".into()))?;
    Uuid::parse_str(raw.trim()).map_err(|_| GatewayError::InvalidWebhook(format!("invalid payment id '{}'", raw)))
}

pub(crate) fn unknown_status(status: &str) -> GatewayError {
    GatewayError::InvalidWebhook(format!("unknown status '{}'", status))
}

/// Comparison whose duration does not depend on where the inputs differ.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Truncates to at most `max` bytes without splitting a UTF-8 sequence.
pub(crate) fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    pub fn webhook(headers: &[(&str, &str)], body: impl Into<Bytes>) -> WebhookRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        WebhookRequest {
            headers: map,
            body: body.into(),
            remote_addr: None,
        }
    }

    pub fn ctx() -> CallContext {
        CallContext::with_timeout(std::time::Duration::from_secs(5))
    }

    pub fn request(currency: Currency, amount: i64) -> CreatePaymentRequest {
        CreatePaymentRequest {
            payment_id: Uuid::new_v4(),
            amount,
            currency,
            description: "Premium, 30 days".into(),
            return_url: "https://t.me/vpnshop_bot".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "Подписка";
        let cut = truncate_utf8(text, 5);
        assert_eq!(cut, "По");
        assert_eq!(truncate_utf8("short", 64), "short");
    }

    #[test]
    fn rejects_garbage_payment_ids() {
        assert!(parse_payment_id(Some("not-a-uuid")).is_err());
        assert!(parse_payment_id(None).is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_payment_id(Some(&id.to_string())).unwrap(), id);
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn unconfigured_gateway_is_reported() {
        let registry = GatewayRegistry::new();
        assert!(matches!(
            registry.get(PaymentGatewayType::Wata),
            Err(GatewayError::NotConfigured(_))
        ));
    }
}
