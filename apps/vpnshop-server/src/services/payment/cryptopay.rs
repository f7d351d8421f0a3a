use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use vpnshop_db::models::enums::{PaymentGatewayType, TransactionStatus};

use super::{
    CreatePaymentRequest, PaymentGateway, PaymentLink, WebhookOutcome, WebhookRequest, header, json_body,
    parse_payment_id, send_json, truncate_utf8, unknown_status,
};
use crate::config::CryptopayConfig;
use crate::context::CallContext;
use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://pay.crypt.bot/api";
const INVOICE_TTL_SECS: u64 = 3600;

/// Crypto Pay (@CryptoBot) invoices billed in USDT.
pub struct CryptopayGateway {
    http: Client,
    config: CryptopayConfig,
    base_url: String,
}

impl CryptopayGateway {
    pub fn new(http: Client, config: CryptopayConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self { http, config, base_url }
    }

    fn mac(&self) -> Result<HmacSha256, GatewayError> {
        let key = Sha256::digest(self.config.api_token.as_bytes());
        HmacSha256::new_from_slice(&key).map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    fn verify(&self, body: &[u8], signature: &str) -> Result<(), GatewayError> {
        let expected = hex::decode(signature.trim()).map_err(|_| GatewayError::SignatureMismatch)?;
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| GatewayError::SignatureMismatch)
    }

    fn decode_status(status: &str) -> Result<TransactionStatus, GatewayError> {
        match status {
            "paid" => Ok(TransactionStatus::Completed),
            "expired" => Ok(TransactionStatus::Canceled),
            other => Err(unknown_status(other)),
        }
    }
}

#[async_trait]
impl PaymentGateway for CryptopayGateway {
    fn gateway_type(&self) -> PaymentGatewayType {
        PaymentGatewayType::Cryptopay
    }

    async fn create_payment(
        &self,
        ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError> {
        let body = json!({
            "currency_type": "crypto",
            "asset": request.currency.as_str(),
            "amount": request.currency.format_major(request.amount),
            "description": truncate_utf8(&request.description, 1024),
            "payload": request.payment_id.to_string(),
            "paid_btn_name": "callback",
            "paid_btn_url": request.return_url,
            "expires_in": INVOICE_TTL_SECS,
        });

        let response = send_json(
            ctx,
            self.http
                .post(format!("{}/createInvoice", self.base_url))
                .header("Crypto-Pay-API-Token", &self.config.api_token)
                .json(&body),
        )
        .await?;

        if response["ok"].as_bool() != Some(true) {
            return Err(GatewayError::Malformed(format!("createInvoice failed: {}", response)));
        }
        let result = &response["result"];
        let url = result["bot_invoice_url"]
            .as_str()
            .or_else(|| result["pay_url"].as_str())
            .ok_or_else(|| GatewayError::Malformed("invoice url missing".into()))?;

        Ok(PaymentLink {
            url: Some(url.to_string()),
            external_id: match &result["invoice_id"] {
                Value::Null => None,
                Value::String(id) => Some(id.clone()),
                other => Some(other.to_string()),
            },
        })
    }

    async fn handle_webhook(
        &self,
        _ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError> {
        let signature = header(request, "crypto-pay-api-signature").ok_or(GatewayError::SignatureMismatch)?;
        self.verify(&request.body, signature)?;

        let update = json_body(request)?;
        let update_type = update["update_type"].as_str().unwrap_or_default();
        if update_type != "invoice_paid" {
            return Err(GatewayError::InvalidWebhook(format!("unsupported update type '{}'", update_type)));
        }

        let invoice = &update["payload"];
        let status = invoice["status"].as_str().unwrap_or_default();
        Ok(WebhookOutcome {
            payment_id: parse_payment_id(invoice["payload"].as_str())?,
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

    fn gateway(base_url: Option<String>) -> CryptopayGateway {
        CryptopayGateway::new(
            Client::new(),
            CryptopayConfig {
                api_token: "1234:AAA".into(),
                base_url,
            },
        )
    }

    fn sign(gateway: &CryptopayGateway, body: &str) -> String {
        let mut mac = gateway.mac().unwrap();
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn creates_usdt_invoice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createInvoice"))
            .and(header_matcher("Crypto-Pay-API-Token", "1234:AAA"))
            .and(body_partial_json(json!({ "asset": "USDT", "amount": "9.00" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "invoice_id": 77, "bot_invoice_url": "https://t.me/CryptoBot?start=IV77" }
            })))
            .mount(&server)
            .await;

        let link = gateway(Some(server.uri()))
            .create_payment(&ctx(), &request(Currency::Usdt, 900))
            .await
            .unwrap();
        assert_eq!(link.url.as_deref(), Some("https://t.me/CryptoBot?start=IV77"));
        assert_eq!(link.external_id.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn verifies_hmac_over_raw_body() {
        let gateway = gateway(None);
        let pid = Uuid::new_v4();
        let body = json!({
            "update_type": "invoice_paid",
            "payload": { "invoice_id": 77, "status": "paid", "payload": pid.to_string() }
        })
        .to_string();

        let good = webhook(&[("crypto-pay-api-signature", &sign(&gateway, &body))], body.clone());
        let outcome = gateway.handle_webhook(&ctx(), &good).await.unwrap();
        assert_eq!(outcome.payment_id, pid);
        assert_eq!(outcome.status, TransactionStatus::Completed);

        let bad = webhook(&[("crypto-pay-api-signature", "00ff")], body);
        assert!(matches!(
            gateway.handle_webhook(&ctx(), &bad).await,
            Err(GatewayError::SignatureMismatch)
        ));
    }

    #[tokio::test]
    async fn ignores_other_update_types() {
        let gateway = gateway(None);
        let body = json!({ "update_type": "invoice_created", "payload": {} }).to_string();
        let request = webhook(&[("crypto-pay-api-signature", &sign(&gateway, &body))], body);
        assert!(matches!(
            gateway.handle_webhook(&ctx(), &request).await,
            Err(GatewayError::InvalidWebhook(_))
        ));
    }
}
