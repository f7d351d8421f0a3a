use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::services::notification_service::{Notification, Notifier};
use crate::services::subscription_service::{CleanupReport, SubscriptionService};

pub const CLEANUP_HOUR_UTC: u32 = 3;

/// Next 03:00 UTC strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(CLEANUP_HOUR_UTC, 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now { today } else { today + Duration::days(1) }
}

pub struct CleanupScheduler {
    subscriptions: SubscriptionService,
    notifier: Arc<dyn Notifier>,
}

impl CleanupScheduler {
    pub fn new(subscriptions: SubscriptionService, notifier: Arc<dyn Notifier>) -> Self {
        Self { subscriptions, notifier }
    }

    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting cleanup scheduler (daily at {:02}:00 UTC)", CLEANUP_HOUR_UTC);
        loop {
            let next = next_run_after(Utc::now());
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            self.run(&cancel).await;
        }
        info!("Cleanup scheduler stopped");
    }

    /// One pass over expired subscriptions; alerts operators on failures.
    pub async fn run(&self, cancel: &CancellationToken) -> Option<CleanupReport> {
        match self.subscriptions.cleanup_expired(cancel).await {
            Ok(report) => {
                if report.failed > 0 {
                    self.notifier
                        .notify_operators(
                            Notification::new("ntf-event-error-cleanup")
                                .with("deleted", report.deleted)
                                .with("failed", report.failed),
                        )
                        .await;
                }
                Some(report)
            }
            Err(e) => {
                error!("Cleanup run failed: {}", e);
                self.notifier
                    .notify_operators(Notification::new("ntf-event-error-cleanup").with("error", &e))
                    .await;
                None
            }
        }
    }
}
