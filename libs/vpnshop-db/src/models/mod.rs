pub mod enums;
pub mod gateway;
pub mod grant;
pub mod job;
pub mod partner;
pub mod plan;
pub mod promocode;
pub mod referral;
pub mod settings;
pub mod subscription;
pub mod transaction;
pub mod user;
