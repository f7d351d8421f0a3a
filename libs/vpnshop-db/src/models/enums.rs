use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a TEXT-backed enum persisted in SCREAMING_SNAKE_CASE, with
/// `as_str`, `Display` and `FromStr` generated from the same table.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        #[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

text_enum! {
    pub enum Currency {
        Usd => "USD",
        Xtr => "XTR",
        Rub => "RUB",
        Usdt => "USDT",
        Ton => "TON",
        Btc => "BTC",
        Eth => "ETH",
        Ltc => "LTC",
    }
}

impl Currency {
    pub fn symbol(&self) -> &'static str {
        match self {
            Currency::Usd => "$",
            Currency::Xtr => "★",
            Currency::Rub => "₽",
            Currency::Usdt => "₮",
            Currency::Ton => "💎",
            Currency::Btc => "₿",
            Currency::Eth => "Ξ",
            Currency::Ltc => "Ł",
        }
    }

    /// Number of minor units in one major unit. Stars have no fractional part.
    pub fn minor_units(&self) -> i64 {
        match self {
            Currency::Xtr => 1,
            _ => 100,
        }
    }

    /// Renders a minor-unit amount as a decimal string in major units ("500.00").
    pub fn format_major(&self, amount: i64) -> String {
        let scale = self.minor_units();
        if scale == 1 {
            return amount.to_string();
        }
        let sign = if amount < 0 { "-" } else { "" };
        let abs = amount.unsigned_abs();
        format!("{}{}.{:02}", sign, abs / scale as u64, abs % scale as u64)
    }
}

text_enum! {
    pub enum PaymentGatewayType {
        TelegramStars => "TELEGRAM_STARS",
        Yookassa => "YOOKASSA",
        Yoomoney => "YOOMONEY",
        Cryptomus => "CRYPTOMUS",
        Heleket => "HELEKET",
        Cryptopay => "CRYPTOPAY",
        Robokassa => "ROBOKASSA",
        Pal24 => "PAL24",
        Wata => "WATA",
        Platega => "PLATEGA",
    }
}

impl PaymentGatewayType {
    /// Currency every invoice on this gateway is issued in.
    pub fn currency(&self) -> Currency {
        match self {
            PaymentGatewayType::TelegramStars => Currency::Xtr,
            PaymentGatewayType::Yookassa
            | PaymentGatewayType::Yoomoney
            | PaymentGatewayType::Robokassa
            | PaymentGatewayType::Pal24
            | PaymentGatewayType::Wata
            | PaymentGatewayType::Platega => Currency::Rub,
            PaymentGatewayType::Cryptomus | PaymentGatewayType::Heleket => Currency::Usd,
            PaymentGatewayType::Cryptopay => Currency::Usdt,
        }
    }

    /// Path segment used by webhook routes (`/webhooks/telegram_stars`).
    pub fn slug(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

text_enum! {
    pub enum AccessMode {
        Public => "PUBLIC",
        Invited => "INVITED",
        PurchaseBlocked => "PURCHASE_BLOCKED",
        RegBlocked => "REG_BLOCKED",
        Restricted => "RESTRICTED",
    }
}

text_enum! {
    /// Declaration order is privilege order: USER < ADMIN < DEV.
    #[derive(PartialOrd, Ord)]
    pub enum UserRole {
        User => "USER",
        Admin => "ADMIN",
        Dev => "DEV",
    }
}

text_enum! {
    pub enum PurchaseType {
        New => "NEW",
        Renew => "RENEW",
        Additional => "ADDITIONAL",
    }
}

text_enum! {
    pub enum TransactionStatus {
        Pending => "PENDING",
        Completed => "COMPLETED",
        Canceled => "CANCELED",
        Refunded => "REFUNDED",
        Failed => "FAILED",
    }
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

text_enum! {
    pub enum SubscriptionStatus {
        Active => "ACTIVE",
        Disabled => "DISABLED",
        Limited => "LIMITED",
        Expired => "EXPIRED",
        Deleted => "DELETED",
    }
}

text_enum! {
    pub enum DeviceType {
        Android => "ANDROID",
        Iphone => "IPHONE",
        Windows => "WINDOWS",
        Mac => "MAC",
    }
}

text_enum! {
    pub enum PlanType {
        Traffic => "TRAFFIC",
        Devices => "DEVICES",
        Both => "BOTH",
        Unlimited => "UNLIMITED",
    }
}

text_enum! {
    pub enum PlanAvailability {
        All => "ALL",
        New => "NEW",
        Existing => "EXISTING",
        Invited => "INVITED",
        Allowed => "ALLOWED",
        Trial => "TRIAL",
    }
}

text_enum! {
    pub enum PromocodeAvailability {
        All => "ALL",
        New => "NEW",
        Existing => "EXISTING",
        Invited => "INVITED",
        Allowed => "ALLOWED",
    }
}

text_enum! {
    pub enum PromocodeRewardType {
        Duration => "DURATION",
        Traffic => "TRAFFIC",
        Devices => "DEVICES",
        Subscription => "SUBSCRIPTION",
        PersonalDiscount => "PERSONAL_DISCOUNT",
        PurchaseDiscount => "PURCHASE_DISCOUNT",
    }
}

text_enum! {
    pub enum ReferralRewardType {
        Points => "POINTS",
        ExtraDays => "EXTRA_DAYS",
    }
}

text_enum! {
    pub enum AccrualStrategy {
        OnFirstPayment => "ON_FIRST_PAYMENT",
        OnEachPayment => "ON_EACH_PAYMENT",
    }
}

text_enum! {
    pub enum ReferralRewardStrategy {
        Amount => "AMOUNT",
        Percent => "PERCENT",
    }
}

text_enum! {
    pub enum PartnerRewardType {
        Percent => "PERCENT",
        FixedAmount => "FIXED_AMOUNT",
    }
}

text_enum! {
    pub enum WithdrawalStatus {
        Pending => "PENDING",
        Completed => "COMPLETED",
        Rejected => "REJECTED",
        Canceled => "CANCELED",
    }
}

text_enum! {
    pub enum PointsExchangeType {
        SubscriptionDays => "SUBSCRIPTION_DAYS",
        GiftSubscription => "GIFT_SUBSCRIPTION",
        Discount => "DISCOUNT",
        Traffic => "TRAFFIC",
    }
}

text_enum! {
    pub enum JobStatus {
        Pending => "PENDING",
        Running => "RUNNING",
        Done => "DONE",
        Dead => "DEAD",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_currency_table() {
        assert_eq!(PaymentGatewayType::TelegramStars.currency(), Currency::Xtr);
        assert_eq!(PaymentGatewayType::Platega.currency(), Currency::Rub);
        assert_eq!(PaymentGatewayType::Cryptopay.currency(), Currency::Usdt);
        assert_eq!(PaymentGatewayType::Heleket.currency(), Currency::Usd);
    }

    #[test]
    fn roles_are_ordered() {
        assert!(UserRole::Dev > UserRole::Admin);
        assert!(UserRole::Admin > UserRole::User);
    }

    #[test]
    fn parses_slugs_case_insensitively() {
        assert_eq!(
            "telegram_stars".parse::<PaymentGatewayType>().ok(),
            Some(PaymentGatewayType::TelegramStars)
        );
        assert!("paypal".parse::<PaymentGatewayType>().is_err());
    }

    #[test]
    fn formats_major_units() {
        assert_eq!(Currency::Rub.format_major(50000), "500.00");
        assert_eq!(Currency::Rub.format_major(105), "1.05");
        assert_eq!(Currency::Xtr.format_major(900), "900");
    }
}
