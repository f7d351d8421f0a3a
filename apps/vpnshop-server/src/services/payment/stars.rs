use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use vpnshop_db::models::enums::{Currency, PaymentGatewayType, TransactionStatus};

use super::{
    CreatePaymentRequest, PaymentGateway, PaymentLink, WebhookOutcome, WebhookRequest, constant_time_eq, header,
    json_body, parse_payment_id, send_json,
};
use crate::context::CallContext;
use crate::error::GatewayError;

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Telegram Stars invoices through the Bot API. Webhooks are the bot's own
/// updates carrying `successful_payment`.
pub struct StarsGateway {
    http: Client,
    token: String,
    webhook_secret: Option<String>,
    api_base: String,
}

impl StarsGateway {
    pub fn new(http: Client, token: String, webhook_secret: Option<String>) -> Self {
        Self {
            http,
            token,
            webhook_secret,
            api_base: "https://api.telegram.org".to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl PaymentGateway for StarsGateway {
    fn gateway_type(&self) -> PaymentGatewayType {
        PaymentGatewayType::TelegramStars
    }

    async fn create_payment(
        &self,
        ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError> {
        if request.currency != Currency::Xtr {
            return Err(GatewayError::Malformed(format!("stars cannot bill in {}", request.currency)));
        }

        let body = json!({
            "title": request.description,
            "description": request.description,
            "payload": request.payment_id.to_string(),
            "provider_token": "",
            "currency": "XTR",
            "prices": [{ "label": request.description, "amount": request.amount }],
        });
        let url = format!("{}/bot{}/createInvoiceLink", self.api_base, self.token);
        let response = send_json(ctx, self.http.post(url).json(&body)).await?;

        if response["ok"].as_bool() != Some(true) {
            return Err(GatewayError::Malformed(format!("createInvoiceLink failed: {}", response)));
        }
        let link = response["result"]
            .as_str()
            .ok_or_else(|| GatewayError::Malformed("invoice link missing".into()))?;

        Ok(PaymentLink {
            url: Some(link.to_string()),
            external_id: None,
        })
    }

    async fn handle_webhook(
        &self,
        _ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError> {
        let expected = self.webhook_secret.as_deref().ok_or(GatewayError::SignatureMismatch)?;
        let received = header(request, SECRET_HEADER).ok_or(GatewayError::SignatureMismatch)?;
        if !constant_time_eq(expected.as_bytes(), received.as_bytes()) {
            return Err(GatewayError::SignatureMismatch);
        }

        let update = json_body(request)?;
        let payment = &update["message"]["successful_payment"];
        if payment.is_null() {
            return Err(GatewayError::InvalidWebhook("update carries no successful_payment".into()));
        }

        Ok(WebhookOutcome {
            payment_id: parse_payment_id(payment["invoice_payload"].as_str())?,
            status: TransactionStatus::Completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::payment::test_support::{ctx, request, webhook};
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway() -> StarsGateway {
        StarsGateway::new(Client::new(), "123:abc".into(), Some("s3cret".into()))
    }

    #[tokio::test]
    async fn creates_invoice_link_in_whole_stars() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/createInvoiceLink"))
            .and(body_partial_json(json!({ "currency": "XTR", "prices": [{ "amount": 900 }] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": "https://t.me/$invoice"
            })))
            .mount(&server)
            .await;

        let gateway = gateway().with_api_base(server.uri());
        let link = gateway.create_payment(&ctx(), &request(Currency::Xtr, 900)).await.unwrap();
        assert_eq!(link.url.as_deref(), Some("https://t.me/$invoice"));
    }

    #[tokio::test]
    async fn successful_payment_update_completes() {
        let pid = Uuid::new_v4();
        let body = json!({
            "update_id": 1,
            "message": { "successful_payment": { "currency": "XTR", "total_amount": 900, "invoice_payload": pid.to_string() } }
        });
        let request = webhook(&[(SECRET_HEADER, "s3cret")], body.to_string());
        let outcome = gateway().handle_webhook(&ctx(), &request).await.unwrap();
        assert_eq!(outcome.payment_id, pid);
        assert_eq!(outcome.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let request = webhook(&[(SECRET_HEADER, "guess")], "{}");
        let err = gateway().handle_webhook(&ctx(), &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::SignatureMismatch));
    }
}
