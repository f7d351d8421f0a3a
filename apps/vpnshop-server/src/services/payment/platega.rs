use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use vpnshop_db::models::enums::{PaymentGatewayType, TransactionStatus};

use super::{
    CreatePaymentRequest, PaymentGateway, PaymentLink, WebhookOutcome, WebhookRequest, constant_time_eq, header,
    json_body, parse_payment_id, send_json, truncate_utf8, unknown_status,
};
use crate::config::PlategaConfig;
use crate::context::CallContext;
use crate::error::GatewayError;

const DEFAULT_BASE_URL: &str = "https://app.platega.io";
const DESCRIPTION_MAX_BYTES: usize = 64;

pub struct PlategaGateway {
    http: Client,
    config: PlategaConfig,
    base_url: String,
}

impl PlategaGateway {
    pub fn new(http: Client, config: PlategaConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self { http, config, base_url }
    }

    fn decode_status(status: &str) -> Result<TransactionStatus, GatewayError> {
        match status.to_ascii_lowercase().as_str() {
            "completed" | "success" => Ok(TransactionStatus::Completed),
            "failed" | "cancelled" | "expired" => Ok(TransactionStatus::Canceled),
            "pending" | "processing" => Ok(TransactionStatus::Pending),
            _ => Err(unknown_status(status)),
        }
    }

    fn authenticate(&self, request: &WebhookRequest) -> Result<(), GatewayError> {
        let merchant = header(request, "x-merchantid").unwrap_or_default();
        let secret = header(request, "x-secret").unwrap_or_default();
        let merchant_ok = constant_time_eq(merchant.as_bytes(), self.config.merchant_id.as_bytes());
        let secret_ok = constant_time_eq(secret.as_bytes(), self.config.secret.as_bytes());
        if merchant_ok && secret_ok {
            Ok(())
        } else {
            Err(GatewayError::SignatureMismatch)
        }
    }
}

#[async_trait]
impl PaymentGateway for PlategaGateway {
    fn gateway_type(&self) -> PaymentGatewayType {
        PaymentGatewayType::Platega
    }

    async fn create_payment(
        &self,
        ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError> {
        let body = json!({
            "paymentMethod": self.config.payment_method,
            "paymentDetails": {
                "amount": request.currency.format_major(request.amount),
                "currency": request.currency.as_str(),
            },
            "description": truncate_utf8(request.description.trim(), DESCRIPTION_MAX_BYTES),
            "payload": request.payment_id.to_string(),
            "return": request.return_url,
            "failedUrl": request.return_url,
        });

        let response = send_json(
            ctx,
            self.http
                .post(format!("{}/transaction/process", self.base_url))
                .header("X-MerchantId", &self.config.merchant_id)
                .header("X-Secret", &self.config.secret)
                .json(&body),
        )
        .await?;

        let url = response["paymentUrl"]
            .as_str()
            .or_else(|| response["url"].as_str())
            .ok_or_else(|| GatewayError::Malformed(format!("paymentUrl missing: {}", response)))?;

        Ok(PaymentLink {
            url: Some(url.to_string()),
            external_id: response["transactionId"].as_str().map(str::to_string),
        })
    }

    async fn handle_webhook(
        &self,
        _ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError> {
        self.authenticate(request)?;
        let data = json_body(request)?;
        let status = data["status"].as_str().unwrap_or_default();
        Ok(WebhookOutcome {
            payment_id: parse_payment_id(data["payload"].as_str())?,
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

    fn gateway(base_url: Option<String>) -> PlategaGateway {
        PlategaGateway::new(
            Client::new(),
            PlategaConfig {
                merchant_id: "m-1".into(),
                secret: "shh".into(),
                payment_method: 2,
                base_url,
            },
        )
    }

    #[tokio::test]
    async fn create_truncates_description() {
        let server = MockServer::start().await;
        let mut req = request(Currency::Rub, 30_000);
        req.description = "Подписка ".repeat(20);
        let expected = truncate_utf8(req.description.trim(), DESCRIPTION_MAX_BYTES).to_string();

        Mock::given(method("POST"))
            .and(path("/transaction/process"))
            .and(header_matcher("X-MerchantId", "m-1"))
            .and(body_partial_json(json!({ "paymentMethod": 2, "description": expected })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transactionId": "t-9",
                "paymentUrl": "https://pay.platega.io/t-9"
            })))
            .mount(&server)
            .await;

        let link = gateway(Some(server.uri())).create_payment(&ctx(), &req).await.unwrap();
        assert_eq!(link.external_id.as_deref(), Some("t-9"));
        assert!(expected.len() <= DESCRIPTION_MAX_BYTES);
    }

    #[tokio::test]
    async fn webhook_requires_merchant_headers() {
        let pid = Uuid::new_v4();
        let body = json!({ "payload": pid.to_string(), "status": "CONFIRMED" }).to_string();

        let unsigned = webhook(&[], body.clone());
        assert!(matches!(
            gateway(None).handle_webhook(&ctx(), &unsigned).await,
            Err(GatewayError::SignatureMismatch)
        ));

        let body = json!({ "payload": pid.to_string(), "status": "Success" }).to_string();
        let signed = webhook(&[("X-MerchantId", "m-1"), ("X-Secret", "shh")], body);
        let outcome = gateway(None).handle_webhook(&ctx(), &signed).await.unwrap();
        assert_eq!(outcome.status, TransactionStatus::Completed);
    }

    #[test]
    fn status_is_case_insensitive() {
        assert_eq!(PlategaGateway::decode_status("PROCESSING").unwrap(), TransactionStatus::Pending);
        assert_eq!(PlategaGateway::decode_status("Expired").unwrap(), TransactionStatus::Canceled);
        assert!(PlategaGateway::decode_status("chargeback").is_err());
    }
}
