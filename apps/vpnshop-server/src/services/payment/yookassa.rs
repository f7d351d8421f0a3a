use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use vpnshop_db::models::enums::{PaymentGatewayType, TransactionStatus};

use super::{
    CreatePaymentRequest, PaymentGateway, PaymentLink, WebhookOutcome, WebhookRequest, json_body, parse_payment_id,
    send_json, truncate_utf8, unknown_status,
};
use crate::config::YookassaConfig;
use crate::context::CallContext;
use crate::error::GatewayError;

const DEFAULT_BASE_URL: &str = "https://api.yookassa.ru/v3";

/// YooKassa notifications are unsigned, so the referenced payment is
/// fetched back from the API and only that answer is trusted.
pub struct YookassaGateway {
    http: Client,
    config: YookassaConfig,
    base_url: String,
}

impl YookassaGateway {
    pub fn new(http: Client, config: YookassaConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self { http, config, base_url }
    }

    fn decode_status(status: &str) -> Result<TransactionStatus, GatewayError> {
        match status {
            "succeeded" => Ok(TransactionStatus::Completed),
            "canceled" => Ok(TransactionStatus::Canceled),
            "pending" | "waiting_for_capture" => Ok(TransactionStatus::Pending),
            other => Err(unknown_status(other)),
        }
    }

    async fn fetch_payment(&self, ctx: &CallContext, id: &str) -> Result<Value, GatewayError> {
        let request = self
            .http
            .get(format!("{}/payments/{}", self.base_url, id))
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key));
        send_json(ctx, request).await
    }
}

#[async_trait]
impl PaymentGateway for YookassaGateway {
    fn gateway_type(&self) -> PaymentGatewayType {
        PaymentGatewayType::Yookassa
    }

    async fn create_payment(
        &self,
        ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError> {
        let body = json!({
            "amount": {
                "value": request.currency.format_major(request.amount),
                "currency": request.currency.as_str(),
            },
            "confirmation": { "type": "redirect", "return_url": request.return_url },
            "capture": true,
            "description": truncate_utf8(&request.description, 128),
            "metadata": { "payment_id": request.payment_id.to_string() },
        });

        let response = send_json(
            ctx,
            self.http
                .post(format!("{}/payments", self.base_url))
                .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
                .header("Idempotence-Key", request.payment_id.to_string())
                .json(&body),
        )
        .await?;

        let url = response["confirmation"]["confirmation_url"]
            .as_str()
            .ok_or_else(|| GatewayError::Malformed(format!("confirmation_url missing: {}", response)))?;

        Ok(PaymentLink {
            url: Some(url.to_string()),
            external_id: response["id"].as_str().map(str::to_string),
        })
    }

    async fn handle_webhook(
        &self,
        ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError> {
        let notification = json_body(request)?;
        let id = notification["object"]["id"]
            .as_str()
            .ok_or_else(|| GatewayError::InvalidWebhook("object.id missing".into()))?;

        let payment = self.fetch_payment(ctx, id).await.map_err(|e| match e {
            GatewayError::Http { status: 404, .. } => GatewayError::InvalidWebhook(format!("unknown payment {}", id)),
            other => other,
        })?;

        let status = payment["status"]
            .as_str()
            .ok_or_else(|| GatewayError::Malformed("payment status missing".into()))?;

        Ok(WebhookOutcome {
            payment_id: parse_payment_id(payment["metadata"]["payment_id"].as_str())?,
            status: Self::decode_status(status)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::payment::test_support::{ctx, request, webhook};
    use uuid::Uuid;
    use vpnshop_db::models::enums::Currency;
    use wiremock::matchers::{body_partial_json, header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(base_url: String) -> YookassaGateway {
        YookassaGateway::new(
            Client::new(),
            YookassaConfig {
                shop_id: "shop".into(),
                secret_key: "key".into(),
                base_url: Some(base_url),
            },
        )
    }

    #[tokio::test]
    async fn create_sends_idempotence_key_and_major_units() {
        let server = MockServer::start().await;
        let req = request(Currency::Rub, 50_000);
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(header_matcher("Idempotence-Key", req.payment_id.to_string().as_str()))
            .and(body_partial_json(json!({ "amount": { "value": "500.00", "currency": "RUB" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "2d4b",
                "status": "pending",
                "confirmation": { "confirmation_url": "https://yoomoney.ru/checkout/2d4b" }
            })))
            .mount(&server)
            .await;

        let link = gateway(server.uri()).create_payment(&ctx(), &req).await.unwrap();
        assert_eq!(link.url.as_deref(), Some("https://yoomoney.ru/checkout/2d4b"));
        assert_eq!(link.external_id.as_deref(), Some("2d4b"));
    }

    #[tokio::test]
    async fn webhook_trusts_the_fetched_status() {
        let server = MockServer::start().await;
        let pid = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/payments/2d4b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "2d4b",
                "status": "succeeded",
                "metadata": { "payment_id": pid.to_string() }
            })))
            .mount(&server)
            .await;

        // The notification claims canceled; the API says succeeded.
        let body = json!({ "event": "payment.canceled", "object": { "id": "2d4b", "status": "canceled" } });
        let outcome = gateway(server.uri())
            .handle_webhook(&ctx(), &webhook(&[], body.to_string()))
            .await
            .unwrap();
        assert_eq!(outcome.payment_id, pid);
        assert_eq!(outcome.status, TransactionStatus::Completed);
    }

    #[test]
    fn status_table() {
        assert_eq!(YookassaGateway::decode_status("waiting_for_capture").unwrap(), TransactionStatus::Pending);
        assert_eq!(YookassaGateway::decode_status("canceled").unwrap(), TransactionStatus::Canceled);
        assert!(YookassaGateway::decode_status("refunded").is_err());
    }
}
