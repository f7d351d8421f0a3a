pub mod cleanup;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vpnshop_db::Repositories;
use vpnshop_db::models::job::{Job, JobPayload};

use crate::config::WorkerConfig;
use crate::error::{CommerceError, CommerceResult};
use crate::services::notification_service::{Notification, Notifier};
use crate::services::partner_service::PartnerService;
use crate::services::referral_service::ReferralService;
use crate::services::subscription_service::{ProvisionOutcome, SubscriptionService};

const BASE_BACKOFF_SECS: i64 = 5;
const MAX_BACKOFF_SECS: i64 = 3600;

/// Delay before the next attempt of a job that has failed `attempts` times.
pub fn backoff(attempts: i32) -> chrono::Duration {
    let exp = attempts.clamp(0, 20) as u32;
    let secs = BASE_BACKOFF_SECS.saturating_mul(2_i64.saturating_pow(exp));
    chrono::Duration::seconds(secs.min(MAX_BACKOFF_SECS))
}

/// Drains the `jobs` table: provisioning, accruals and panel re-syncs.
pub struct JobWorker {
    repos: Repositories,
    subscriptions: SubscriptionService,
    partners: PartnerService,
    referrals: ReferralService,
    notifier: Arc<dyn Notifier>,
    config: WorkerConfig,
    wake: Arc<Notify>,
}

impl JobWorker {
    pub fn new(
        repos: Repositories,
        subscriptions: SubscriptionService,
        partners: PartnerService,
        referrals: ReferralService,
        notifier: Arc<dyn Notifier>,
        config: WorkerConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            repos,
            subscriptions,
            partners,
            referrals,
            notifier,
            config,
            wake,
        }
    }

    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Starting job worker (concurrency {}, max attempts {})",
            self.config.concurrency, self.config.max_attempts
        );
        let poll = Duration::from_secs(self.config.poll_interval_secs.max(1));

        while !cancel.is_cancelled() {
            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Job claim failed: {}", e);
                    0
                }
            };
            if processed > 0 {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => debug!("Job worker woken"),
                _ = tokio::time::sleep(poll) => {}
            }
        }
        info!("Job worker stopped");
    }

    /// Claims one batch of due jobs and runs it to completion.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let jobs = self
            .repos
            .jobs
            .claim(self.config.concurrency.max(1) as i64, self.config.lease_secs)
            .await?;
        let count = jobs.len();
        join_all(jobs.into_iter().map(|job| self.process(job))).await;
        Ok(count)
    }

    async fn process(&self, job: Job) {
        let payload = job.payload.0.clone();
        debug!("Running job {} ({}) attempt {}", job.id, job.dedupe_key, job.attempts);

        let result = self.dispatch(&payload).await;
        let outcome = match result {
            Ok(()) => self.repos.jobs.complete(job.id).await,
            Err(e) if job.attempts >= self.config.max_attempts => self.give_up(&job, &payload, e).await,
            Err(e) => {
                let run_at = Utc::now() + backoff(job.attempts);
                warn!(
                    "Job {} ({}) failed on attempt {}: {}; retrying at {}",
                    job.id, job.dedupe_key, job.attempts, e, run_at
                );
                self.repos.jobs.reschedule(job.id, &e.to_string(), run_at).await
            }
        };
        if let Err(e) = outcome {
            // The lease expires and another claim picks the job up again.
            error!("Could not record result of job {}: {}", job.id, e);
        }
    }

    async fn give_up(&self, job: &Job, payload: &JobPayload, err: CommerceError) -> anyhow::Result<()> {
        error!(
            "Job {} ({}) is dead after {} attempts: {}",
            job.id, job.dedupe_key, job.attempts, err
        );
        self.repos.jobs.bury(job.id, &err.to_string()).await?;

        if let JobPayload::Provision { payment_id } = payload {
            if let Err(e) = self.subscriptions.fail_provisioning(*payment_id, &err).await {
                error!("Could not mark payment {} as failed: {}", payment_id, e);
            }
        }
        self.notifier
            .notify_operators(
                Notification::new("ntf-event-error-job")
                    .with("job", &job.dedupe_key)
                    .with("attempts", job.attempts)
                    .with("error", &err),
            )
            .await;
        Ok(())
    }

    async fn dispatch(&self, payload: &JobPayload) -> CommerceResult<()> {
        match payload {
            JobPayload::Provision { payment_id } => {
                match self.subscriptions.provision(*payment_id).await? {
                    ProvisionOutcome::Failed(reason) => {
                        warn!("Provisioning {} failed permanently: {}", payment_id, reason);
                    }
                    ProvisionOutcome::Skipped(reason) => debug!("Provisioning {} skipped: {}", payment_id, reason),
                    _ => {}
                }
                Ok(())
            }
            JobPayload::PartnerAccrual { payment_id } => {
                let credited = self.partners.accrue_for_payment(*payment_id).await?;
                debug!("Partner accrual for {}: {} credit(s)", payment_id, credited);
                Ok(())
            }
            JobPayload::ReferralAccrual { payment_id } => {
                let rewarded = self.referrals.accrue_for_payment(*payment_id).await?;
                debug!("Referral accrual for {}: {} reward(s)", payment_id, rewarded);
                Ok(())
            }
            JobPayload::PanelSync { subscription_id } => self.subscriptions.sync_subscription(*subscription_id).await,
        }
    }
}
