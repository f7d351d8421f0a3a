use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::json;
use vpnshop_db::models::enums::{PaymentGatewayType, TransactionStatus};

use super::{
    CreatePaymentRequest, PaymentGateway, PaymentLink, WebhookOutcome, WebhookRequest, constant_time_eq, header,
    json_body, parse_payment_id, send_json, unknown_status,
};
use crate::config::HeleketConfig;
use crate::context::CallContext;
use crate::error::GatewayError;

const DEFAULT_BASE_URL: &str = "https://api.heleket.com";

pub struct HeleketGateway {
    http: Client,
    config: HeleketConfig,
    base_url: String,
    callback_url: String,
}

impl HeleketGateway {
    pub fn new(http: Client, config: HeleketConfig, callback_url: String) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            http,
            config,
            base_url,
            callback_url,
        }
    }

    /// `md5(base64(body) + api_key)`, used both for requests and notifications.
    fn generate_signature(&self, body: &[u8]) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(body);
        let to_hash = format!("{}{}", encoded, self.config.api_key);
        format!("{:x}", md5::compute(to_hash.as_bytes()))
    }

    fn decode_status(status: &str) -> Result<TransactionStatus, GatewayError> {
        match status {
            "paid" | "paid_over" => Ok(TransactionStatus::Completed),
            "cancel" | "fail" | "system_fail" | "refund_process" | "refund_fail" | "refund_paid" => {
                Ok(TransactionStatus::Canceled)
            }
            "wrong_amount" | "wrong_amount_waiting" => Ok(TransactionStatus::Pending),
            other => Err(unknown_status(other)),
        }
    }
}

#[async_trait]
impl PaymentGateway for HeleketGateway {
    fn gateway_type(&self) -> PaymentGatewayType {
        PaymentGatewayType::Heleket
    }

    async fn create_payment(
        &self,
        ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError> {
        let body = json!({
            "amount": request.currency.format_major(request.amount),
            "currency": request.currency.as_str(),
            "order_id": request.payment_id.to_string(),
            "url_return": request.return_url,
            "url_callback": self.callback_url,
        });
        let body = serde_json::to_vec(&body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let sign = self.generate_signature(&body);

        let response = send_json(
            ctx,
            self.http
                .post(format!("{}/v1/payment", self.base_url))
                .header("merchant", &self.config.merchant_id)
                .header("sign", sign)
                .header("Content-Type", "application/json")
                .body(body),
        )
        .await?;

        let result = &response["result"];
        let url = result["url"]
            .as_str()
            .ok_or_else(|| GatewayError::Malformed(format!("Heleket error: {}", response)))?;

        Ok(PaymentLink {
            url: Some(url.to_string()),
            external_id: result["uuid"].as_str().map(str::to_string),
        })
    }

    async fn handle_webhook(
        &self,
        _ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError> {
        let signature = header(request, "sign")
            .or_else(|| header(request, "x-signature"))
            .ok_or(GatewayError::SignatureMismatch)?;
        let expected = self.generate_signature(&request.body);
        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            return Err(GatewayError::SignatureMismatch);
        }

        let data = json_body(request)?;
        let status = data["status"].as_str().unwrap_or_default();
        Ok(WebhookOutcome {
            payment_id: parse_payment_id(data["order_id"].as_str())?,
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
    use wiremock::matchers::{header as header_matcher, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(base_url: Option<String>) -> HeleketGateway {
        HeleketGateway::new(
            Client::new(),
            HeleketConfig {
                merchant_id: "merchant".into(),
                api_key: "key".into(),
                base_url,
            },
            "https://shop.example.com/webhooks/heleket".into(),
        )
    }

    #[test]
    fn signature_matches_reference_vector() {
        // base64("{}") = "e30=", md5("e30=key")
        let expected = format!("{:x}", md5::compute(b"e30=key"));
        assert_eq!(gateway(None).generate_signature(b"{}"), expected);
    }

    #[tokio::test]
    async fn create_signs_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment"))
            .and(header_matcher("merchant", "merchant"))
            .and(header_exists("sign"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": 0,
                "result": { "uuid": "h-1", "url": "https://pay.heleket.com/h-1" }
            })))
            .mount(&server)
            .await;

        let link = gateway(Some(server.uri()))
            .create_payment(&ctx(), &request(Currency::Usd, 500))
            .await
            .unwrap();
        assert_eq!(link.url.as_deref(), Some("https://pay.heleket.com/h-1"));
    }

    #[tokio::test]
    async fn webhook_statuses() {
        let gateway = gateway(None);
        let pid = Uuid::new_v4();
        for (status, expected) in [
            ("paid_over", TransactionStatus::Completed),
            ("refund_paid", TransactionStatus::Canceled),
            ("wrong_amount_waiting", TransactionStatus::Pending),
        ] {
            let body = json!({ "order_id": pid.to_string(), "status": status }).to_string();
            let sign = gateway.generate_signature(body.as_bytes());
            let outcome = gateway
                .handle_webhook(&ctx(), &webhook(&[("sign", &sign)], body))
                .await
                .unwrap();
            assert_eq!(outcome.status, expected);
        }
    }

    #[tokio::test]
    async fn unsigned_webhook_is_rejected() {
        let body = json!({ "order_id": Uuid::new_v4().to_string(), "status": "paid" }).to_string();
        assert!(matches!(
            gateway(None).handle_webhook(&ctx(), &webhook(&[], body)).await,
            Err(GatewayError::SignatureMismatch)
        ));
    }
}
