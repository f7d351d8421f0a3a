use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::{Value, json};
use uuid::Uuid;
use vpnshop_db::models::enums::{PaymentGatewayType, TransactionStatus};

use super::{
    CreatePaymentRequest, PaymentGateway, PaymentLink, WebhookOutcome, WebhookRequest, json_body, parse_payment_id,
    send_json, unknown_status,
};
use crate::config::WataConfig;
use crate::context::CallContext;
use crate::error::GatewayError;

const DEFAULT_BASE_URL: &str = "https://api.wata.pro/api/h2h";
const LINK_LIFETIME_MINUTES: i64 = 60;

/// WATA H2H links. The notification only names the order; its status is
/// re-read from the transaction search before being trusted.
pub struct WataGateway {
    http: Client,
    config: WataConfig,
    base_url: String,
}

impl WataGateway {
    pub fn new(http: Client, config: WataConfig) -> Self {
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
            "Completed" | "completed" | "Success" | "success" => Ok(TransactionStatus::Completed),
            "Failed" | "failed" | "Cancelled" | "cancelled" | "Expired" | "expired" => Ok(TransactionStatus::Canceled),
            "Pending" | "pending" | "Processing" | "processing" => Ok(TransactionStatus::Pending),
            other => Err(unknown_status(other)),
        }
    }

    /// Status of the most recent gateway transaction for the order.
    async fn confirmed_status(&self, ctx: &CallContext, order_id: Uuid) -> Result<String, GatewayError> {
        let url = format!(
            "{}/transactions?orderId={}&skipCount=0&maxResultCount=5",
            self.base_url, order_id
        );
        let response = send_json(ctx, self.http.get(url).bearer_auth(&self.config.access_token)).await?;
        let items = response["items"].as_array().cloned().unwrap_or_default();

        items
            .iter()
            .find(|item| item["orderId"].as_str() == Some(order_id.to_string().as_str()))
            .or_else(|| items.first())
            .and_then(|item| item["status"].as_str())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidWebhook(format!("no WATA transaction for order {}", order_id)))
    }
}

#[async_trait]
impl PaymentGateway for WataGateway {
    fn gateway_type(&self) -> PaymentGatewayType {
        PaymentGatewayType::Wata
    }

    async fn create_payment(
        &self,
        ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError> {
        let expires = (Utc::now() + Duration::minutes(LINK_LIFETIME_MINUTES)).to_rfc3339_opts(SecondsFormat::Secs, true);
        let body = json!({
            "amount": request.currency.format_major(request.amount),
            "currency": request.currency.as_str(),
            "description": request.description,
            "orderId": request.payment_id.to_string(),
            "type": "OneTime",
            "expirationDateTime": expires,
            "successRedirectUrl": request.return_url,
            "failRedirectUrl": request.return_url,
        });

        let response = send_json(
            ctx,
            self.http
                .post(format!("{}/links", self.base_url))
                .bearer_auth(&self.config.access_token)
                .json(&body),
        )
        .await?;

        let url = response["url"]
            .as_str()
            .or_else(|| response["paymentUrl"].as_str())
            .ok_or_else(|| GatewayError::Malformed(format!("link url missing: {}", response)))?;

        Ok(PaymentLink {
            url: Some(url.to_string()),
            external_id: match &response["id"] {
                Value::String(id) => Some(id.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            },
        })
    }

    async fn handle_webhook(
        &self,
        ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError> {
        let data = json_body(request)?;
        let payment_id = parse_payment_id(data["orderId"].as_str())?;
        let claimed = data["status"].as_str().unwrap_or_default();
        Self::decode_status(claimed)?;

        let confirmed = self.confirmed_status(ctx, payment_id).await?;
        if confirmed != claimed {
            tracing::warn!(
                "WATA webhook for {} claimed '{}' but API reports '{}'",
                payment_id,
                claimed,
                confirmed
            );
        }

        Ok(WebhookOutcome {
            payment_id,
            status: Self::decode_status(&confirmed)?,
        })
    }
}
