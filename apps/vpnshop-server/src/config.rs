use std::env;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL the gateways redirect back to after checkout.
    pub public_url: String,
    pub bot: BotConfig,
    pub panel: PanelConfig,
    #[serde(default)]
    pub gateways: GatewaysConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default = "default_settings_ttl")]
    pub settings_cache_ttl_secs: u64,
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub token: String,
    pub username: String,
    pub support_username: Option<String>,
    /// Always receive operator alerts, regardless of their stored role.
    #[serde(default)]
    pub developer_ids: Vec<i64>,
    /// Shared secret Telegram echoes in `X-Telegram-Bot-Api-Secret-Token`.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub url: String,
    pub token: String,
    #[serde(default = "default_username_prefix")]
    pub username_prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaysConfig {
    pub yookassa: Option<YookassaConfig>,
    pub pal24: Option<Pal24Config>,
    pub wata: Option<WataConfig>,
    pub platega: Option<PlategaConfig>,
    pub cryptopay: Option<CryptopayConfig>,
    pub heleket: Option<HeleketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YookassaConfig {
    pub shop_id: String,
    pub secret_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pal24Config {
    pub api_key: String,
    pub shop_id: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WataConfig {
    pub access_token: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlategaConfig {
    pub merchant_id: String,
    pub secret: String,
    #[serde(default = "default_platega_method")]
    pub payment_method: i32,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptopayConfig {
    pub api_token: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeleketConfig {
    pub merchant_id: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_secs: u64,
    pub max_attempts: i32,
    pub lease_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_secs: 5,
            max_attempts: 8,
            lease_secs: 120,
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_settings_ttl() -> u64 {
    60
}

fn default_username_prefix() -> String {
    "tg_".to_string()
}

fn default_platega_method() -> i32 {
    1
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_paths = ["/etc/vpnshop/vpnshop.toml", "./vpnshop.toml"];

        for path in config_paths {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                return Self::from_toml(&contents).with_context(|| format!("Invalid config file {}", path));
            }
        }

        tracing::info!("Loading config from environment");
        Self::from_env()
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_env() -> Result<Self> {
        fn required(key: &str) -> Result<String> {
            env::var(key).with_context(|| format!("{} must be set", key))
        }
        fn optional(key: &str) -> Option<String> {
            env::var(key).ok().filter(|v| !v.is_empty())
        }
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            optional(key).and_then(|v| v.parse().ok())
        }

        let gateways = GatewaysConfig {
            yookassa: match (optional("YOOKASSA_SHOP_ID"), optional("YOOKASSA_SECRET_KEY")) {
                (Some(shop_id), Some(secret_key)) => Some(YookassaConfig {
                    shop_id,
                    secret_key,
                    base_url: optional("YOOKASSA_BASE_URL"),
                }),
                _ => None,
            },
            pal24: match (optional("PAL24_API_KEY"), optional("PAL24_SHOP_ID")) {
                (Some(api_key), Some(shop_id)) => Some(Pal24Config {
                    api_key,
                    shop_id,
                    base_url: optional("PAL24_BASE_URL"),
                }),
                _ => None,
            },
            wata: optional("WATA_ACCESS_TOKEN").map(|access_token| WataConfig {
                access_token,
                base_url: optional("WATA_BASE_URL"),
            }),
            platega: match (optional("PLATEGA_MERCHANT_ID"), optional("PLATEGA_SECRET")) {
                (Some(merchant_id), Some(secret)) => Some(PlategaConfig {
                    merchant_id,
                    secret,
                    payment_method: parsed("PLATEGA_PAYMENT_METHOD").unwrap_or_else(default_platega_method),
                    base_url: optional("PLATEGA_BASE_URL"),
                }),
                _ => None,
            },
            cryptopay: optional("CRYPTOPAY_API_TOKEN").map(|api_token| CryptopayConfig {
                api_token,
                base_url: optional("CRYPTOPAY_BASE_URL"),
            }),
            heleket: match (optional("HELEKET_MERCHANT_ID"), optional("HELEKET_API_KEY")) {
                (Some(merchant_id), Some(api_key)) => Some(HeleketConfig {
                    merchant_id,
                    api_key,
                    base_url: optional("HELEKET_BASE_URL"),
                }),
                _ => None,
            },
        };

        let worker_defaults = WorkerConfig::default();
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS").unwrap_or_else(default_max_connections),
            redis_url: optional("REDIS_URL"),
            listen_addr: optional("LISTEN_ADDR").unwrap_or_else(default_listen_addr),
            public_url: required("PUBLIC_URL")?,
            bot: BotConfig {
                token: required("BOT_TOKEN")?,
                username: required("BOT_USERNAME")?,
                support_username: optional("BOT_SUPPORT_USERNAME"),
                developer_ids: optional("BOT_DEV_IDS")
                    .map(|raw| {
                        raw.split(',')
                            .filter_map(|id| id.trim().parse().ok())
                            .collect()
                    })
                    .unwrap_or_default(),
                webhook_secret: optional("BOT_WEBHOOK_SECRET"),
            },
            panel: PanelConfig {
                url: required("PANEL_URL")?,
                token: required("PANEL_TOKEN")?,
                username_prefix: optional("PANEL_USERNAME_PREFIX").unwrap_or_else(default_username_prefix),
            },
            gateways,
            worker: WorkerConfig {
                concurrency: parsed("WORKER_CONCURRENCY").unwrap_or(worker_defaults.concurrency),
                poll_interval_secs: parsed("WORKER_POLL_INTERVAL_SECS").unwrap_or(worker_defaults.poll_interval_secs),
                max_attempts: parsed("WORKER_MAX_ATTEMPTS").unwrap_or(worker_defaults.max_attempts),
                lease_secs: parsed("WORKER_LEASE_SECS").unwrap_or(worker_defaults.lease_secs),
            },
            settings_cache_ttl_secs: parsed("SETTINGS_CACHE_TTL_SECS").unwrap_or_else(default_settings_ttl),
            log_dir: optional("LOG_DIR"),
        })
    }
}
