//! Grant application on an open PostgreSQL transaction. Shared by the
//! promocode, referral and subscription repositories so every grant runs
//! inside the unit that records why it was granted.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::PgConnection;
use sqlx::types::Json;

use crate::models::grant::{Grant, GrantApplied, GrantRejection};
use crate::models::promocode::{NewPromocode, Promocode};
use crate::models::subscription::{NewSubscription, Subscription};

pub(crate) async fn apply_grant(
    conn: &mut PgConnection,
    telegram_id: i64,
    grant: Grant,
) -> Result<Result<GrantApplied, GrantRejection>> {
    match grant {
        Grant::SetPersonalDiscount { percent } => {
            let rows = sqlx::query(
                "UPDATE users SET personal_discount = $1, updated_at = NOW() WHERE telegram_id = $2",
            )
            .bind(percent.clamp(0, 100))
            .bind(telegram_id)
            .execute(&mut *conn)
            .await
            .context("Failed to set personal discount")?;
            Ok(user_touched(rows.rows_affected()))
        }
        Grant::SetPurchaseDiscount { percent } => {
            let rows = sqlx::query(
                "UPDATE users SET purchase_discount = $1, updated_at = NOW() WHERE telegram_id = $2",
            )
            .bind(percent.clamp(0, 100))
            .bind(telegram_id)
            .execute(&mut *conn)
            .await
            .context("Failed to set purchase discount")?;
            Ok(user_touched(rows.rows_affected()))
        }
        Grant::AddPurchaseDiscount { percent } => {
            let rows = sqlx::query(
                "UPDATE users SET purchase_discount = LEAST(100, purchase_discount + $1), updated_at = NOW() WHERE telegram_id = $2",
            )
            .bind(percent.max(0))
            .bind(telegram_id)
            .execute(&mut *conn)
            .await
            .context("Failed to add purchase discount")?;
            Ok(user_touched(rows.rows_affected()))
        }
        Grant::AddPoints { points } => {
            let rows = sqlx::query(
                "UPDATE users SET points = points + $1, updated_at = NOW() WHERE telegram_id = $2",
            )
            .bind(points)
            .bind(telegram_id)
            .execute(&mut *conn)
            .await
            .context("Failed to add points")?;
            Ok(user_touched(rows.rows_affected()))
        }
        Grant::ExtendSubscription {
            subscription_id,
            days,
        } => {
            let Some(mut sub) = lock_owned_subscription(conn, subscription_id, telegram_id).await? else {
                return Ok(Err(GrantRejection::SubscriptionUnavailable));
            };
            if sub.is_lifetime() {
                return Ok(Err(GrantRejection::SubscriptionUnavailable));
            }
            sub.expire_at = sub.expire_at.max(Utc::now()) + Duration::days(days as i64);
            sqlx::query("UPDATE subscriptions SET expire_at = $1, updated_at = NOW() WHERE id = $2")
                .bind(sub.expire_at)
                .bind(sub.id)
                .execute(&mut *conn)
                .await
                .context("Failed to extend subscription")?;
            Ok(Ok(GrantApplied {
                subscription: Some(sub),
                promocode: None,
            }))
        }
        Grant::AddTraffic {
            subscription_id,
            bytes,
        } => {
            let Some(mut sub) = lock_owned_subscription(conn, subscription_id, telegram_id).await? else {
                return Ok(Err(GrantRejection::SubscriptionUnavailable));
            };
            if sub.traffic_limit < 0 {
                return Ok(Err(GrantRejection::SubscriptionUnavailable));
            }
            sub.traffic_limit += bytes;
            sub.plan.traffic_limit = sub.traffic_limit;
            sqlx::query(
                "UPDATE subscriptions SET traffic_limit = $1, plan = $2, updated_at = NOW() WHERE id = $3",
            )
            .bind(sub.traffic_limit)
            .bind(&sub.plan)
            .bind(sub.id)
            .execute(&mut *conn)
            .await
            .context("Failed to add traffic")?;
            Ok(Ok(GrantApplied {
                subscription: Some(sub),
                promocode: None,
            }))
        }
        Grant::AddDevices {
            subscription_id,
            count,
        } => {
            let Some(mut sub) = lock_owned_subscription(conn, subscription_id, telegram_id).await? else {
                return Ok(Err(GrantRejection::SubscriptionUnavailable));
            };
            if sub.device_limit < 0 {
                return Ok(Err(GrantRejection::SubscriptionUnavailable));
            }
            sub.device_limit += count;
            sub.plan.device_limit = sub.device_limit;
            sqlx::query(
                "UPDATE subscriptions SET device_limit = $1, plan = $2, updated_at = NOW() WHERE id = $3",
            )
            .bind(sub.device_limit)
            .bind(&sub.plan)
            .bind(sub.id)
            .execute(&mut *conn)
            .await
            .context("Failed to add devices")?;
            Ok(Ok(GrantApplied {
                subscription: Some(sub),
                promocode: None,
            }))
        }
        Grant::CreateSubscription {
            subscription,
            max_subscriptions,
            make_current,
        } => {
            let created =
                insert_subscription_within_limit(conn, &subscription, max_subscriptions, None, make_current)
                    .await?;
            Ok(match created {
                Some(sub) => Ok(GrantApplied {
                    subscription: Some(sub),
                    promocode: None,
                }),
                None => Err(GrantRejection::SubscriptionLimit),
            })
        }
        Grant::CreatePromocode { promocode } => {
            Ok(match insert_promocode(conn, &promocode).await? {
                Some(code) => Ok(GrantApplied {
                    subscription: None,
                    promocode: Some(code),
                }),
                None => Err(GrantRejection::CodeConflict),
            })
        }
    }
}

fn user_touched(rows: u64) -> Result<GrantApplied, GrantRejection> {
    if rows == 0 {
        Err(GrantRejection::UserMissing)
    } else {
        Ok(GrantApplied::default())
    }
}

async fn lock_owned_subscription(
    conn: &mut PgConnection,
    subscription_id: i64,
    telegram_id: i64,
) -> Result<Option<Subscription>> {
    sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE id = $1 AND user_telegram_id = $2 AND status <> 'DELETED' FOR UPDATE",
    )
    .bind(subscription_id)
    .bind(telegram_id)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to lock subscription")
}

pub(crate) async fn insert_subscription_within_limit(
    conn: &mut PgConnection,
    new: &NewSubscription,
    max_subscriptions: i32,
    replacing: Option<i64>,
    make_current: bool,
) -> Result<Option<Subscription>> {
    // Serializes concurrent purchases of the same user.
    sqlx::query("SELECT telegram_id FROM users WHERE telegram_id = $1 FOR UPDATE")
        .bind(new.user_telegram_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock user")?;

    if max_subscriptions >= 0 {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM subscriptions WHERE user_telegram_id = $1 AND status <> 'DELETED' AND id IS DISTINCT FROM $2",
        )
        .bind(new.user_telegram_id)
        .bind(replacing)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to count subscriptions")?;

        if count + 1 > max_subscriptions as i64 {
            return Ok(None);
        }
    }

    let sub = sqlx::query_as::<_, Subscription>(
        "INSERT INTO subscriptions (user_telegram_id, panel_uuid, panel_username, status, is_trial, traffic_limit, device_limit, internal_squads, external_squad, expire_at, url, device_type, plan, source_payment_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         RETURNING *",
    )
    .bind(new.user_telegram_id)
    .bind(new.panel_uuid)
    .bind(&new.panel_username)
    .bind(new.status)
    .bind(new.is_trial)
    .bind(new.traffic_limit)
    .bind(new.device_limit)
    .bind(&new.internal_squads)
    .bind(new.external_squad)
    .bind(new.expire_at)
    .bind(&new.url)
    .bind(new.device_type)
    .bind(Json(&new.plan))
    .bind(new.source_payment_id)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to insert subscription")?;

    if let Some(replaced) = replacing {
        sqlx::query(
            "UPDATE subscriptions SET status = 'DELETED', updated_at = NOW() WHERE id = $1 AND user_telegram_id = $2",
        )
        .bind(replaced)
        .bind(sub.user_telegram_id)
        .execute(&mut *conn)
        .await
        .context("Failed to retire replaced subscription")?;
    }

    if make_current {
        sqlx::query(
            "UPDATE users SET current_subscription_id = $1, updated_at = NOW() WHERE telegram_id = $2",
        )
        .bind(sub.id)
        .bind(sub.user_telegram_id)
        .execute(&mut *conn)
        .await
        .context("Failed to set current subscription")?;
    }

    Ok(Some(sub))
}

pub(crate) async fn insert_promocode(
    conn: &mut PgConnection,
    new: &NewPromocode,
) -> Result<Option<Promocode>> {
    sqlx::query_as::<_, Promocode>(
        "INSERT INTO promocodes (code, reward_type, availability, allowed_user_ids, reward, plan, lifetime, max_activations, is_active)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (code) DO NOTHING
         RETURNING *",
    )
    .bind(Promocode::normalize_code(&new.code))
    .bind(new.reward_type)
    .bind(new.availability)
    .bind(&new.allowed_user_ids)
    .bind(new.reward)
    .bind(new.plan.as_ref().map(Json))
    .bind(new.lifetime)
    .bind(new.max_activations)
    .bind(new.is_active)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to insert promocode")
}
