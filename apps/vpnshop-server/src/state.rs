use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use teloxide::Bot;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vpnshop_db::Repositories;

use crate::config::AppConfig;
use crate::panel::{PanelApi, RemnawaveClient};
use crate::services::notification_service::{Notifier, TelegramNotifier};
use crate::services::partner_service::PartnerService;
use crate::services::payment::GatewayRegistry;
use crate::services::payment_service::PaymentService;
use crate::services::plan_service::PlanService;
use crate::services::promo_service::PromoService;
use crate::services::pubsub_service::PubSubService;
use crate::services::referral_service::ReferralService;
use crate::services::settings_service::SettingsService;
use crate::services::subscription_service::SubscriptionService;
use crate::services::user_service::UserService;
use crate::worker::JobWorker;
use crate::worker::cleanup::CleanupScheduler;

/// External collaborators; production wires real clients, tests wire fakes.
pub struct Backends {
    pub repos: Repositories,
    pub panel: Arc<dyn PanelApi>,
    pub gateways: GatewayRegistry,
    pub notifier: Arc<dyn Notifier>,
    pub pubsub: Option<Arc<PubSubService>>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repos: Repositories,
    pub settings: SettingsService,
    pub plans: PlanService,
    pub users: UserService,
    pub subscriptions: SubscriptionService,
    pub payments: PaymentService,
    pub promocodes: PromoService,
    pub referrals: ReferralService,
    pub partners: PartnerService,
    pub notifier: Arc<dyn Notifier>,
    pub pubsub: Option<Arc<PubSubService>>,
    pub wake: Arc<Notify>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Connects PostgreSQL, Redis, the panel and the configured gateways.
    pub async fn connect(config: AppConfig, shutdown: CancellationToken) -> Result<Self> {
        let (_pool, repos) = vpnshop_db::connect(&config.database_url, config.database_max_connections).await?;
        repos.gateways.ensure_defaults().await?;

        let pubsub = match &config.redis_url {
            Some(url) => match PubSubService::new(url.clone()).await {
                Ok(pubsub) => Some(pubsub),
                Err(e) => {
                    warn!("Redis unavailable, falling back to polling: {}", e);
                    None
                }
            },
            None => None,
        };

        let bot = Bot::new(config.bot.token.clone());
        let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(
            bot,
            repos.clone(),
            config.bot.developer_ids.clone(),
        ));
        let panel: Arc<dyn PanelApi> = Arc::new(RemnawaveClient::new(
            config.panel.url.clone(),
            config.panel.token.clone(),
        ));
        let gateways = GatewayRegistry::from_config(&config);

        Ok(Self::build(
            config,
            Backends {
                repos,
                panel,
                gateways,
                notifier,
                pubsub,
            },
            shutdown,
        ))
    }

    pub fn build(config: AppConfig, backends: Backends, shutdown: CancellationToken) -> Self {
        let Backends {
            repos,
            panel,
            gateways,
            notifier,
            pubsub,
        } = backends;
        let wake = Arc::new(Notify::new());

        let settings = SettingsService::new(
            repos.clone(),
            Duration::from_secs(config.settings_cache_ttl_secs),
            pubsub.clone(),
        );
        let plans = PlanService::new(repos.clone());
        let subscriptions = SubscriptionService::new(
            repos.clone(),
            settings.clone(),
            plans.clone(),
            panel,
            notifier.clone(),
            config.panel.username_prefix.clone(),
            shutdown.clone(),
        );
        let referrals = ReferralService::new(
            repos.clone(),
            settings.clone(),
            plans.clone(),
            subscriptions.clone(),
            notifier.clone(),
        );
        let partners = PartnerService::new(repos.clone(), settings.clone(), notifier.clone());
        let users = UserService::new(
            repos.clone(),
            settings.clone(),
            referrals.clone(),
            partners.clone(),
            notifier.clone(),
            config.bot.developer_ids.clone(),
        );
        let payments = PaymentService::new(
            repos.clone(),
            settings.clone(),
            plans.clone(),
            subscriptions.clone(),
            users.clone(),
            Arc::new(gateways),
            notifier.clone(),
            pubsub.clone(),
            wake.clone(),
            config.public_url.clone(),
            shutdown.clone(),
        );
        let promocodes = PromoService::new(repos.clone(), settings.clone(), subscriptions.clone(), notifier.clone());

        Self {
            config: Arc::new(config),
            repos,
            settings,
            plans,
            users,
            subscriptions,
            payments,
            promocodes,
            referrals,
            partners,
            notifier,
            pubsub,
            wake,
            shutdown,
        }
    }

    pub fn job_worker(&self) -> JobWorker {
        JobWorker::new(
            self.repos.clone(),
            self.subscriptions.clone(),
            self.partners.clone(),
            self.referrals.clone(),
            self.notifier.clone(),
            self.config.worker.clone(),
            self.wake.clone(),
        )
    }

    pub fn cleanup_scheduler(&self) -> CleanupScheduler {
        CleanupScheduler::new(self.subscriptions.clone(), self.notifier.clone())
    }

    /// Spawns the job worker, cleanup scheduler and pub/sub listener.
    pub fn spawn_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let worker = Arc::new(self.job_worker());
        handles.push(tokio::spawn(worker.start(self.shutdown.clone())));

        let scheduler = Arc::new(self.cleanup_scheduler());
        handles.push(tokio::spawn(scheduler.start(self.shutdown.clone())));

        if let Some(pubsub) = &self.pubsub {
            handles.push(tokio::spawn(pubsub.clone().listen(
                self.wake.clone(),
                self.settings.clone(),
                self.shutdown.clone(),
            )));
        }
        info!("Background tasks started ({})", handles.len());
        handles
    }
}
