//! Plans and subscriptions. A customer holds at most one non-expired
//! subscription at a time, enforced by a partial unique index; replaced
//! subscriptions are flagged expired and kept forever.

pub(crate) mod lifecycle;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::account::UserId;

/// Subscriptions run for one year from the moment they are created.
pub(crate) const SUBSCRIPTION_TERM_DAYS: i64 = 365;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub(crate) struct PlanId(pub i64);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub(crate) struct SubscriptionId(pub i64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Plan {
    pub(crate) id: PlanId,
    pub(crate) name: String,
    pub(crate) price: Decimal,
    /// Redemptions granted per partner when this plan starts or replaces
    /// another subscription.
    pub(crate) offer_allotment: i64,
    pub(crate) created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    #[serde(rename = "customerID")]
    pub(crate) customer_id: UserId,
    #[serde(rename = "planID")]
    pub(crate) plan_id: PlanId,
    #[serde(rename = "remainingPool")]
    pub(crate) remaining_pool: i64,
    #[serde(rename = "expiresAt")]
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) expired: bool,
    #[serde(rename = "startedAt")]
    pub(crate) started_at: DateTime<Utc>,
}

impl Subscription {
    /// Expired either by the lifecycle flag or by running past its term.
    pub(crate) fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired || self.expires_at <= now
    }
}

fn plan_from_row(row: &SqliteRow) -> Result<Plan, sqlx::Error> {
    let price_text: String = row.try_get("price")?;
    let price = Decimal::from_str(&price_text).map_err(|e| sqlx::Error::ColumnDecode {
        index: "price".into(),
        source: Box::new(e),
    })?;
    let created_at: NaiveDateTime = row.try_get("created_at")?;

    Ok(Plan {
        id: PlanId(row.try_get("id")?),
        name: row.try_get("name")?,
        price,
        offer_allotment: row.try_get("offer_allotment")?,
        created_at: created_at.and_utc(),
    })
}

pub(crate) fn subscription_from_row(row: &SqliteRow) -> Result<Subscription, sqlx::Error> {
    let expires_at: NaiveDateTime = row.try_get("expires_at")?;
    let started_at: NaiveDateTime = row.try_get("started_at")?;

    Ok(Subscription {
        id: SubscriptionId(row.try_get("id")?),
        customer_id: UserId(row.try_get("customer_id")?),
        plan_id: PlanId(row.try_get("plan_id")?),
        remaining_pool: row.try_get("remaining_pool")?,
        expires_at: expires_at.and_utc(),
        expired: row.try_get("expired")?,
        started_at: started_at.and_utc(),
    })
}

pub(crate) async fn create_plan(
    pool: &SqlitePool,
    name: &str,
    price: Decimal,
    offer_allotment: i64,
) -> Result<Plan, sqlx::Error> {
    let result = sqlx::query("INSERT INTO plans (name, price, offer_allotment) VALUES (?1, ?2, ?3)")
        .bind(name)
        .bind(price.to_string())
        .bind(offer_allotment)
        .execute(pool)
        .await?;

    let id = PlanId(result.last_insert_rowid());
    find_plan(pool, id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub(crate) async fn find_plan(pool: &SqlitePool, id: PlanId) -> Result<Option<Plan>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, price, offer_allotment, created_at FROM plans WHERE id = ?1")
        .bind(id.0)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(plan_from_row).transpose()
}

pub(crate) async fn find_subscription(
    pool: &SqlitePool,
    id: SubscriptionId,
) -> Result<Option<Subscription>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, customer_id, plan_id, remaining_pool, expires_at, expired, started_at
         FROM subscriptions WHERE id = ?1",
    )
    .bind(id.0)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(subscription_from_row).transpose()
}

/// Latest subscription for the customer that has not been flag-expired.
/// Date expiry is the caller's concern; a lapsed-by-date subscription is
/// still returned so it can be renewed.
pub(crate) async fn active_subscription(
    pool: &SqlitePool,
    customer_id: UserId,
) -> Result<Option<Subscription>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, customer_id, plan_id, remaining_pool, expires_at, expired, started_at
         FROM subscriptions
         WHERE customer_id = ?1 AND expired = 0
         ORDER BY id DESC LIMIT 1",
    )
    .bind(customer_id.0)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(subscription_from_row).transpose()
}
