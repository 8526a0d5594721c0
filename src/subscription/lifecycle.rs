//! Subscription state transitions. A customer holds at most one live
//! subscription; renewals and upgrades never edit it in place but replace it
//! inside a single transaction, carrying unused balances into the new term.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use super::{
    Plan, PlanId, SUBSCRIPTION_TERM_DAYS, Subscription, SubscriptionId, active_subscription,
    find_plan, find_subscription,
};
use crate::account::{User, UserId};
use crate::entitlement::{self, CounterKey};
use crate::error::SubscriptionError;

/// Starts a first subscription on the given plan. The offer pool opens at the
/// plan's allotment and the term runs [`SUBSCRIPTION_TERM_DAYS`] from now.
pub(crate) async fn subscribe(
    pool: &SqlitePool,
    customer_id: UserId,
    plan_id: PlanId,
) -> Result<Subscription, SubscriptionError> {
    let plan = find_plan(pool, plan_id)
        .await?
        .ok_or(SubscriptionError::PlanNotFound)?;
    let expires_at = (Utc::now() + Duration::days(SUBSCRIPTION_TERM_DAYS)).naive_utc();

    let result = sqlx::query(
        "INSERT INTO subscriptions (customer_id, plan_id, remaining_pool, expires_at)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(customer_id.0)
    .bind(plan.id.0)
    .bind(plan.offer_allotment)
    .bind(expires_at)
    .execute(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            SubscriptionError::AlreadySubscribed
        }
        other => SubscriptionError::Database(other),
    })?;

    find_subscription(pool, SubscriptionId(result.last_insert_rowid()))
        .await?
        .ok_or(SubscriptionError::Database(sqlx::Error::RowNotFound))
}

/// Renews the current subscription on its existing plan, folding the unused
/// pool and per-partner balances into the new term.
pub(crate) async fn renew(
    pool: &SqlitePool,
    customer_id: UserId,
) -> Result<Subscription, SubscriptionError> {
    let current = active_subscription(pool, customer_id)
        .await?
        .ok_or(SubscriptionError::NoActiveSubscription)?;
    let plan = find_plan(pool, current.plan_id)
        .await?
        .ok_or(SubscriptionError::PlanNotFound)?;

    replace_subscription(pool, &current, &plan).await
}

/// Moves the customer onto a new plan. Works exactly like a renewal except
/// the replacement subscription references the new plan.
pub(crate) async fn upgrade(
    pool: &SqlitePool,
    customer_id: UserId,
    new_plan_id: PlanId,
) -> Result<Subscription, SubscriptionError> {
    let current = active_subscription(pool, customer_id)
        .await?
        .ok_or(SubscriptionError::NoActiveSubscription)?;
    let plan = find_plan(pool, new_plan_id)
        .await?
        .ok_or(SubscriptionError::PlanNotFound)?;

    replace_subscription(pool, &current, &plan).await
}

/// Upgrade on behalf of a customer, restricted to admin accounts.
pub(crate) async fn admin_upgrade(
    pool: &SqlitePool,
    acting: &User,
    customer_id: UserId,
    plan_id: PlanId,
) -> Result<Subscription, SubscriptionError> {
    if !acting.is_admin() {
        return Err(SubscriptionError::NotAdmin);
    }

    upgrade(pool, customer_id, plan_id).await
}

/// Retires `current` and installs a replacement on `plan` in one transaction.
///
/// Carry-forward rule: the new pool is the old pool plus the plan allotment,
/// and every counter under the old subscription reappears under the new one
/// at its old balance plus the plan allotment. Old rows are kept expired for
/// history, never deleted.
async fn replace_subscription(
    pool: &SqlitePool,
    current: &Subscription,
    plan: &Plan,
) -> Result<Subscription, SubscriptionError> {
    let expires_at = (Utc::now() + Duration::days(SUBSCRIPTION_TERM_DAYS)).naive_utc();

    let mut tx = pool.begin().await?;

    let carried =
        entitlement::list_for_subscription_within_transaction(&mut tx, current.id).await?;

    // The partial unique index permits one live row per customer, so the old
    // subscription must be expired before the replacement is inserted.
    sqlx::query("UPDATE subscriptions SET expired = 1 WHERE id = ?1")
        .bind(current.id.0)
        .execute(tx.as_mut())
        .await?;

    let result = sqlx::query(
        "INSERT INTO subscriptions (customer_id, plan_id, remaining_pool, expires_at)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(current.customer_id.0)
    .bind(plan.id.0)
    .bind(current.remaining_pool + plan.offer_allotment)
    .bind(expires_at)
    .execute(tx.as_mut())
    .await?;
    let new_id = SubscriptionId(result.last_insert_rowid());

    for counter in &carried {
        let key = CounterKey {
            subscription_id: new_id,
            ..counter.key
        };
        entitlement::create_within_transaction(&mut tx, key, counter.remaining + plan.offer_allotment)
            .await?;
    }

    tx.commit().await?;

    find_subscription(pool, new_id)
        .await?
        .ok_or(SubscriptionError::Database(sqlx::Error::RowNotFound))
}
