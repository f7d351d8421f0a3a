use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use super::enums::JobStatus;

/// Identifier-only message for a durable side effect. Workers re-load the
/// rows they need; nothing live crosses the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Provision { payment_id: Uuid },
    PartnerAccrual { payment_id: Uuid },
    ReferralAccrual { payment_id: Uuid },
    PanelSync { subscription_id: i64 },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Provision { .. } => "provision",
            JobPayload::PartnerAccrual { .. } => "partner_accrual",
            JobPayload::ReferralAccrual { .. } => "referral_accrual",
            JobPayload::PanelSync { .. } => "panel_sync",
        }
    }

    /// Ledger key; a second enqueue with the same key is a no-op.
    pub fn dedupe_key(&self) -> String {
        match self {
            JobPayload::Provision { payment_id }
            | JobPayload::PartnerAccrual { payment_id }
            | JobPayload::ReferralAccrual { payment_id } => {
                format!("{}:{}", self.kind(), payment_id)
            }
            JobPayload::PanelSync { subscription_id } => {
                format!("{}:{}:{}", self.kind(), subscription_id, Uuid::new_v4())
            }
        }
    }

    /// The three effects fired by a completed payment.
    pub fn payment_effects(payment_id: Uuid) -> Vec<JobPayload> {
        vec![
            JobPayload::Provision { payment_id },
            JobPayload::PartnerAccrual { payment_id },
            JobPayload::ReferralAccrual { payment_id },
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: i64,
    pub kind: String,
    pub dedupe_key: String,
    pub payload: Json<JobPayload>,
    pub status: JobStatus,
    pub attempts: i32,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub dedupe_key: String,
    pub payload: JobPayload,
}

impl From<JobPayload> for NewJob {
    fn from(payload: JobPayload) -> Self {
        Self {
            dedupe_key: payload.dedupe_key(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_effect_keys_are_stable() {
        let pid = Uuid::new_v4();
        let first: Vec<String> = JobPayload::payment_effects(pid)
            .iter()
            .map(JobPayload::dedupe_key)
            .collect();
        let second: Vec<String> = JobPayload::payment_effects(pid)
            .iter()
            .map(JobPayload::dedupe_key)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first[0], format!("provision:{pid}"));
    }

    #[test]
    fn panel_sync_keys_never_collide() {
        let payload = JobPayload::PanelSync { subscription_id: 7 };
        assert_ne!(payload.dedupe_key(), payload.dedupe_key());
    }

    #[test]
    fn payload_is_tagged_json() {
        let payload = JobPayload::PanelSync { subscription_id: 7 };
        let raw = serde_json::to_value(&payload).unwrap();
        assert_eq!(raw["kind"], "panel_sync");
        assert_eq!(raw["subscription_id"], 7);
    }
}
