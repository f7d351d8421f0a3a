use std::collections::BTreeSet;
use std::fmt::Display;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{debug, warn};
use vpnshop_db::Repositories;
use vpnshop_db::models::enums::UserRole;

/// A localizable message: a key understood by the chat UI plus named values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: String,
    pub params: Vec<(String, String)>,
}

impl Notification {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Display) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Plain HTML rendering used until the chat UI resolves the key.
    pub fn render(&self) -> String {
        let mut text = format!("<b>{}</b>", escape(&self.key));
        for (name, value) in &self.params {
            text.push_str(&format!("\n{}: <code>{}</code>", escape(name), escape(value)));
        }
        text
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Outbound messages to users and operators. Delivery failures are logged,
/// never propagated into the commerce flow.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, telegram_id: i64, notification: Notification);
    async fn notify_operators(&self, notification: Notification);
}

pub struct TelegramNotifier {
    bot: Bot,
    repos: Repositories,
    developer_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, repos: Repositories, developer_ids: Vec<i64>) -> Self {
        Self {
            bot,
            repos,
            developer_ids,
        }
    }

    async fn operator_ids(&self) -> BTreeSet<i64> {
        let mut ids: BTreeSet<i64> = self.developer_ids.iter().copied().collect();
        match self.repos.users.list_by_min_role(UserRole::Admin).await {
            Ok(admins) => ids.extend(admins.into_iter().map(|u| u.telegram_id)),
            Err(e) => warn!("Failed to load operator list: {:#}", e),
        }
        ids
    }

    async fn send(&self, telegram_id: i64, text: &str) {
        match self
            .bot
            .send_message(ChatId(telegram_id), text)
            .parse_mode(ParseMode::Html)
            .await
        {
            Ok(_) => debug!("Notification delivered to {}", telegram_id),
            Err(e) => warn!("Failed to notify {}: {}", telegram_id, e),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_user(&self, telegram_id: i64, notification: Notification) {
        self.send(telegram_id, &notification.render()).await;
    }

    async fn notify_operators(&self, notification: Notification) {
        let text = notification.render();
        for id in self.operator_ids().await {
            self.send(id, &text).await;
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}
