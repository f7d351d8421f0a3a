use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use vpnshop_db::models::enums::{PaymentGatewayType, TransactionStatus};

use super::{
    CreatePaymentRequest, PaymentGateway, PaymentLink, WebhookOutcome, WebhookRequest, constant_time_eq, header,
    json_body, parse_payment_id, send_json, truncate_utf8, unknown_status,
};
use crate::config::Pal24Config;
use crate::context::CallContext;
use crate::error::GatewayError;

const DEFAULT_BASE_URL: &str = "https://paypalych.com/api/v1";

pub struct Pal24Gateway {
    http: Client,
    config: Pal24Config,
    base_url: String,
}

impl Pal24Gateway {
    pub fn new(http: Client, config: Pal24Config) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self { http, config, base_url }
    }

    fn signature(&self, data: &Value) -> String {
        let field = |name: &str| match &data[name] {
            Value::String(s) => s.clone(),
            Value::Null => "None".to_string(),
            other => other.to_string(),
        };
        let line = format!(
            "{}:{}:{}:{}",
            field("order_id"),
            field("bill_id"),
            field("status"),
            self.config.api_key
        );
        hex::encode(Sha256::digest(line.as_bytes()))
    }

    fn decode_status(status: &str) -> Result<TransactionStatus, GatewayError> {
        match status {
            "PAID" | "paid" => Ok(TransactionStatus::Completed),
            "REJECTED" | "rejected" | "EXPIRED" | "expired" => Ok(TransactionStatus::Canceled),
            other => Err(unknown_status(other)),
        }
    }
}

#[async_trait]
impl PaymentGateway for Pal24Gateway {
    fn gateway_type(&self) -> PaymentGatewayType {
        PaymentGatewayType::Pal24
    }

    async fn create_payment(
        &self,
        ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError> {
        let body = json!({
            "amount": request.currency.format_major(request.amount),
            "order_id": request.payment_id.to_string(),
            "description": truncate_utf8(&request.description, 255),
            "type": "normal",
            "shop_id": self.config.shop_id,
            "currency_in": request.currency.as_str(),
            "success_url": request.return_url,
            "fail_url": request.return_url,
        });

        let response = send_json(
            ctx,
            self.http
                .post(format!("{}/bills/create", self.base_url))
                .bearer_auth(&self.config.api_key)
                .json(&body),
        )
        .await?;

        if !matches!(&response["success"], Value::Bool(true)) && response["success"] != "true" {
            return Err(GatewayError::Malformed(format!("bill was not created: {}", response)));
        }

        let url = response["link_url"]
            .as_str()
            .or_else(|| response["link_page_url"].as_str())
            .ok_or_else(|| GatewayError::Malformed("bill link missing".into()))?;

        Ok(PaymentLink {
            url: Some(url.to_string()),
            external_id: response["bill_id"].as_str().map(str::to_string),
        })
    }

    async fn handle_webhook(
        &self,
        _ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError> {
        let data = json_body(request)?;
        if !data.is_object() {
            return Err(GatewayError::InvalidWebhook("payload is not an object".into()));
        }

        let signature = header(request, "x-signature").ok_or(GatewayError::SignatureMismatch)?;
        if !constant_time_eq(signature.as_bytes(), self.signature(&data).as_bytes()) {
            return Err(GatewayError::SignatureMismatch);
        }

        let status = data["status"].as_str().unwrap_or_default();
        Ok(WebhookOutcome {
            payment_id: parse_payment_id(data["order_id"].as_str())?,
            status: Self::decode_status(status)?,
        })
    }
}
