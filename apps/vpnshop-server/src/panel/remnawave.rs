use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;
use vpnshop_db::models::enums::SubscriptionStatus;

use super::{InternalSquad, PanelApi, PanelUser, PanelUserSpec};
use crate::context::{CallContext, Interrupted};
use crate::error::PanelError;

/// Remnawave REST client. The panel treats `0` as unlimited where the store uses `-1`.
#[derive(Clone)]
pub struct RemnawaveClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    response: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDto {
    uuid: Uuid,
    username: String,
    status: String,
    expire_at: DateTime<Utc>,
    #[serde(default)]
    subscription_url: String,
    #[serde(default)]
    traffic_limit_bytes: i64,
    #[serde(default)]
    hwid_device_limit: Option<i32>,
    #[serde(default)]
    active_internal_squads: Vec<SquadRef>,
    #[serde(default)]
    external_squad_uuid: Option<Uuid>,
}

#[derive(Deserialize)]
struct SquadRef {
    uuid: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SquadList {
    internal_squads: Vec<InternalSquad>,
}

impl From<UserDto> for PanelUser {
    fn from(dto: UserDto) -> Self {
        Self {
            uuid: dto.uuid,
            username: dto.username,
            status: parse_status(&dto.status),
            expire_at: dto.expire_at,
            subscription_url: dto.subscription_url,
            traffic_limit: if dto.traffic_limit_bytes <= 0 { -1 } else { dto.traffic_limit_bytes },
            device_limit: match dto.hwid_device_limit {
                Some(limit) if limit > 0 => limit,
                _ => -1,
            },
            internal_squads: dto.active_internal_squads.into_iter().map(|s| s.uuid).collect(),
            external_squad: dto.external_squad_uuid,
        }
    }
}

fn parse_status(raw: &str) -> SubscriptionStatus {
    raw.parse().unwrap_or_else(|_| {
        tracing::warn!("Unknown panel user status '{}', treating as DISABLED", raw);
        SubscriptionStatus::Disabled
    })
}

fn panel_status(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Active => "ACTIVE",
        SubscriptionStatus::Limited => "LIMITED",
        SubscriptionStatus::Expired => "EXPIRED",
        SubscriptionStatus::Disabled | SubscriptionStatus::Deleted => "DISABLED",
    }
}

fn user_body(spec: &PanelUserSpec) -> Value {
    json!({
        "username": spec.username,
        "status": panel_status(spec.status),
        "telegramId": spec.telegram_id,
        "expireAt": spec.expire_at.to_rfc3339(),
        "trafficLimitBytes": spec.traffic_limit.max(0),
        "trafficLimitStrategy": "NO_RESET",
        "hwidDeviceLimit": spec.device_limit.max(0),
        "activeInternalSquads": spec.internal_squads,
        "externalSquadUuid": spec.external_squad,
        "description": spec.description,
    })
}

impl RemnawaveClient {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        request: RequestBuilder,
    ) -> Result<Option<T>, PanelError> {
        let response = ctx
            .run(request.timeout(ctx.remaining()).send())
            .await
            .map_err(interrupted)??;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PanelError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| PanelError::Malformed(e.to_string()))?;
        Ok(Some(envelope.response))
    }
}

fn interrupted(reason: Interrupted) -> PanelError {
    match reason {
        Interrupted::DeadlineExceeded => PanelError::Timeout,
        Interrupted::Canceled => PanelError::Canceled,
    }
}

#[async_trait]
impl PanelApi for RemnawaveClient {
    async fn create_user(&self, ctx: &CallContext, spec: &PanelUserSpec) -> Result<PanelUser, PanelError> {
        let request = self.request(Method::POST, "/api/users").json(&user_body(spec));
        match self.send::<UserDto>(ctx, request).await {
            Ok(Some(dto)) => Ok(dto.into()),
            Ok(None) => Err(PanelError::Malformed("create returned 404".into())),
            Err(PanelError::Http { status: 400 | 409, body }) if body.contains("already exists") => {
                Err(PanelError::UsernameTaken(spec.username.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn update_user(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        spec: &PanelUserSpec,
        reset_traffic: bool,
    ) -> Result<PanelUser, PanelError> {
        if reset_traffic {
            let reset = self.request(Method::POST, &format!("/api/users/{}/actions/reset-traffic", uuid));
            self.send::<Value>(ctx, reset).await?;
        }

        let mut body = user_body(spec);
        body["uuid"] = json!(uuid);
        if let Some(object) = body.as_object_mut() {
            object.remove("username");
        }
        let request = self.request(Method::PATCH, "/api/users").json(&body);
        self.send::<UserDto>(ctx, request)
            .await?
            .map(PanelUser::from)
            .ok_or_else(|| PanelError::NotFound(uuid.to_string()))
    }

    async fn delete_user(&self, ctx: &CallContext, uuid: Uuid) -> Result<(), PanelError> {
        let request = self.request(Method::DELETE, &format!("/api/users/{}", uuid));
        self.send::<Value>(ctx, request).await?;
        Ok(())
    }

    async fn get_user(&self, ctx: &CallContext, uuid: Uuid) -> Result<Option<PanelUser>, PanelError> {
        let request = self.request(Method::GET, &format!("/api/users/{}", uuid));
        Ok(self.send::<UserDto>(ctx, request).await?.map(PanelUser::from))
    }

    async fn get_user_by_username(&self, ctx: &CallContext, username: &str) -> Result<Option<PanelUser>, PanelError> {
        let request = self.request(Method::GET, &format!("/api/users/by-username/{}", username));
        Ok(self.send::<UserDto>(ctx, request).await?.map(PanelUser::from))
    }

    async fn list_internal_squads(&self, ctx: &CallContext) -> Result<Vec<InternalSquad>, PanelError> {
        let request = self.request(Method::GET, "/api/internal-squads");
        Ok(self
            .send::<SquadList>(ctx, request)
            .await?
            .map(|list| list.internal_squads)
            .unwrap_or_default())
    }
}
