use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Reasons a user-initiated operation is refused by policy; never mutates state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("subscription limit reached ({max})")]
    SubscriptionLimit { max: i32 },
    #[error("withdrawal below minimum of {min}")]
    WithdrawalBelowMinimum { min: i64 },
    #[error("insufficient balance {balance}")]
    InsufficientBalance { balance: i64 },
    #[error("insufficient points {balance}")]
    InsufficientPoints { balance: i64 },
    #[error("registration is closed")]
    RegistrationClosed,
    #[error("an invite is required to register")]
    InviteRequired,
    #[error("purchases are disabled")]
    PurchasesBlocked,
    #[error("access is restricted")]
    AccessRestricted,
    #[error("user is blocked")]
    UserBlocked,
    #[error("trial already used")]
    TrialAlreadyUsed,
    #[error("partner is inactive")]
    PartnerInactive,
    #[error("exchange type is disabled")]
    ExchangeDisabled,
}

impl PolicyViolation {
    pub fn message_key(&self) -> &'static str {
        match self {
            PolicyViolation::SubscriptionLimit { .. } => "ntf-subscription-limit-exceeded",
            PolicyViolation::WithdrawalBelowMinimum { .. } => "ntf-partner-withdraw-min",
            PolicyViolation::InsufficientBalance { .. } => "ntf-partner-withdraw-insufficient",
            PolicyViolation::InsufficientPoints { .. } => "ntf-exchange-insufficient-points",
            PolicyViolation::RegistrationClosed => "ntf-access-reg-blocked",
            PolicyViolation::InviteRequired => "ntf-access-invited-only",
            PolicyViolation::PurchasesBlocked => "ntf-access-purchase-blocked",
            PolicyViolation::AccessRestricted => "ntf-access-restricted",
            PolicyViolation::UserBlocked => "ntf-user-blocked",
            PolicyViolation::TrialAlreadyUsed => "ntf-trial-already-used",
            PolicyViolation::PartnerInactive => "ntf-partner-inactive",
            PolicyViolation::ExchangeDisabled => "ntf-exchange-disabled",
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway {0} is not configured")]
    NotConfigured(String),
    #[error("gateway HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed gateway response: {0}")]
    Malformed(String),
    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),
    #[error("webhook signature mismatch")]
    SignatureMismatch,
    #[error("gateway call timed out")]
    Timeout,
    #[error("gateway call canceled")]
    Canceled,
}

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("panel HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("panel request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed panel response: {0}")]
    Malformed(String),
    #[error("panel user {0} not found")]
    NotFound(String),
    #[error("panel username {0} already exists")]
    UsernameTaken(String),
    #[error("panel call timed out")]
    Timeout,
    #[error("panel call canceled")]
    Canceled,
}

/// Failure taxonomy of every Commerce Core operation.
#[derive(Debug, Error)]
pub enum CommerceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Panel(#[from] PanelError),
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommerceError {
    pub fn validation(message: impl Into<String>) -> Self {
        CommerceError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CommerceError::NotFound(what.into())
    }

    /// Localization key shown to the chat user.
    pub fn message_key(&self) -> &'static str {
        match self {
            CommerceError::Validation(_) => "ntf-invalid-input",
            CommerceError::NotFound(_) => "ntf-not-found",
            CommerceError::Conflict(_) => "ntf-conflict",
            CommerceError::Policy(violation) => violation.message_key(),
            CommerceError::Gateway(_) => "ntf-payment-creation-failed",
            CommerceError::Panel(_) => "ntf-subscription-failed",
            CommerceError::SignatureMismatch => "ntf-invalid-input",
            CommerceError::Internal(_) => "ntf-error",
        }
    }

    /// Worth retrying from the job queue: the remote side may recover.
    pub fn is_transient(&self) -> bool {
        match self {
            CommerceError::Panel(PanelError::Timeout | PanelError::Transport(_)) => true,
            CommerceError::Panel(PanelError::Http { status, .. }) => *status >= 500 || *status == 429,
            CommerceError::Gateway(GatewayError::Timeout | GatewayError::Transport(_)) => true,
            CommerceError::Internal(_) => true,
            _ => false,
        }
    }
}

pub type CommerceResult<T> = Result<T, CommerceError>;

/// Why a code was available in principle but could not be applied for this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotAvailableReason {
    Availability,
    NoEligibleSubscription,
    SubscriptionLimit,
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("promocode not found")]
    NotFound,
    #[error("promocode is inactive")]
    Inactive,
    #[error("promocode expired")]
    Expired,
    #[error("promocode depleted")]
    Depleted,
    #[error("promocode already activated")]
    AlreadyActivated,
    #[error("promocode not available: {0:?}")]
    NotAvailable(NotAvailableReason),
    /// Several subscriptions qualify; the caller must pick one.
    #[error("a target subscription must be chosen")]
    TargetRequired { candidates: Vec<i64> },
    #[error(transparent)]
    Commerce(#[from] CommerceError),
}

impl From<anyhow::Error> for ActivationError {
    fn from(err: anyhow::Error) -> Self {
        ActivationError::Commerce(CommerceError::Internal(err))
    }
}

impl ActivationError {
    pub fn message_key(&self) -> &'static str {
        match self {
            ActivationError::NotFound => "ntf-promocode-not-found",
            ActivationError::Inactive => "ntf-promocode-inactive",
            ActivationError::Expired => "ntf-promocode-expired",
            ActivationError::Depleted => "ntf-promocode-depleted",
            ActivationError::AlreadyActivated => "ntf-promocode-already-activated",
            ActivationError::NotAvailable(NotAvailableReason::Availability) => "ntf-promocode-not-available",
            ActivationError::NotAvailable(NotAvailableReason::NoEligibleSubscription) => {
                "ntf-promocode-no-eligible-subscription"
            }
            ActivationError::NotAvailable(NotAvailableReason::SubscriptionLimit) => "ntf-promocode-subscription-limit",
            ActivationError::TargetRequired { .. } => "ntf-promocode-choose-subscription",
            ActivationError::Commerce(err) => err.message_key(),
        }
    }
}

/// Response mapping for gateway notifications. Application rejections are
/// always 4xx so the gateway retries or drops, never 5xx.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown gateway {0}")]
    UnknownGateway(String),
    #[error("malformed webhook: {0}")]
    Malformed(String),
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("webhook handling exceeded its deadline")]
    Timeout,
}

impl From<GatewayError> for WebhookError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::SignatureMismatch => WebhookError::SignatureMismatch,
            GatewayError::Timeout | GatewayError::Canceled => WebhookError::Timeout,
            GatewayError::NotConfigured(name) => WebhookError::UnknownGateway(name),
            other => WebhookError::Malformed(other.to_string()),
        }
    }
}

impl From<CommerceError> for WebhookError {
    fn from(err: CommerceError) -> Self {
        match err {
            CommerceError::SignatureMismatch => WebhookError::SignatureMismatch,
            CommerceError::Gateway(gateway) => gateway.into(),
            other => WebhookError::Malformed(other.to_string()),
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            WebhookError::UnknownGateway(_) => StatusCode::NOT_FOUND,
            WebhookError::Malformed(_) => StatusCode::BAD_REQUEST,
            WebhookError::SignatureMismatch => StatusCode::UNAUTHORIZED,
            WebhookError::Timeout => StatusCode::REQUEST_TIMEOUT,
        };
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}
