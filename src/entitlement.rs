//! Per-(customer, partner, subscription) redemption balances, independent of
//! the subscription's own pool. Counters are created lazily on first access
//! behind a uniqueness constraint, mutated only through a conditional
//! decrement, and never deleted; a plan change supersedes them with fresh
//! rows under the new subscription id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex, RwLock};

use crate::account::UserId;
use crate::subscription::SubscriptionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CounterKey {
    pub(crate) customer_id: UserId,
    pub(crate) partner_id: UserId,
    pub(crate) subscription_id: SubscriptionId,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EntitlementCounter {
    pub(crate) id: i64,
    pub(crate) key: CounterKey,
    pub(crate) remaining: i64,
    pub(crate) created_at: DateTime<Utc>,
}

fn counter_from_row(row: &SqliteRow) -> Result<EntitlementCounter, sqlx::Error> {
    let created_at: NaiveDateTime = row.try_get("created_at")?;

    Ok(EntitlementCounter {
        id: row.try_get("id")?,
        key: CounterKey {
            customer_id: UserId(row.try_get("customer_id")?),
            partner_id: UserId(row.try_get("partner_id")?),
            subscription_id: SubscriptionId(row.try_get("subscription_id")?),
        },
        remaining: row.try_get("remaining")?,
        created_at: created_at.and_utc(),
    })
}

/// Returns the counter for the key, creating it with `initial` on first
/// access. The unique index makes concurrent first access converge on a
/// single row; later callers see the stored value, not their own `initial`.
pub(crate) async fn fetch_or_create(
    pool: &SqlitePool,
    key: CounterKey,
    initial: i64,
) -> Result<EntitlementCounter, sqlx::Error> {
    sqlx::query(
        "INSERT INTO entitlement_counters (customer_id, partner_id, subscription_id, remaining)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(customer_id, partner_id, subscription_id) DO NOTHING",
    )
    .bind(key.customer_id.0)
    .bind(key.partner_id.0)
    .bind(key.subscription_id.0)
    .bind(initial)
    .execute(pool)
    .await?;

    fetch(pool, key).await?.ok_or(sqlx::Error::RowNotFound)
}

pub(crate) async fn fetch(
    pool: &SqlitePool,
    key: CounterKey,
) -> Result<Option<EntitlementCounter>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, customer_id, partner_id, subscription_id, remaining, created_at
         FROM entitlement_counters
         WHERE customer_id = ?1 AND partner_id = ?2 AND subscription_id = ?3",
    )
    .bind(key.customer_id.0)
    .bind(key.partner_id.0)
    .bind(key.subscription_id.0)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(counter_from_row).transpose()
}

/// Burns one redemption if any remain. Returns `false` when the counter is
/// already at zero or missing, without touching the row; the guard in the
/// WHERE clause is what keeps the balance from ever going negative.
pub(crate) async fn decrement_if_positive(
    pool: &SqlitePool,
    key: CounterKey,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE entitlement_counters
         SET remaining = remaining - 1
         WHERE customer_id = ?1 AND partner_id = ?2 AND subscription_id = ?3 AND remaining > 0",
    )
    .bind(key.customer_id.0)
    .bind(key.partner_id.0)
    .bind(key.subscription_id.0)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn list_for_subscription_within_transaction(
    tx: &mut Transaction<'_, Sqlite>,
    subscription_id: SubscriptionId,
) -> Result<Vec<EntitlementCounter>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, customer_id, partner_id, subscription_id, remaining, created_at
         FROM entitlement_counters
         WHERE subscription_id = ?1
         ORDER BY id",
    )
    .bind(subscription_id.0)
    .fetch_all(tx.as_mut())
    .await?;

    rows.iter().map(counter_from_row).collect()
}

pub(crate) async fn create_within_transaction(
    tx: &mut Transaction<'_, Sqlite>,
    key: CounterKey,
    remaining: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO entitlement_counters (customer_id, partner_id, subscription_id, remaining)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(key.customer_id.0)
    .bind(key.partner_id.0)
    .bind(key.subscription_id.0)
    .bind(remaining)
    .execute(tx.as_mut())
    .await?;

    Ok(())
}

/// Per-key async locks serializing the read-then-decrement section of the
/// redemption workflow. Two redemptions for the same counter take turns; the
/// second re-reads the balance the first left behind.
///
/// Entries are never removed: the keyspace is bounded by the
/// (customer, partner, subscription) triples actually redeemed against, and
/// each entry is a single `Arc<Mutex<()>>`.
#[derive(Clone, Default)]
pub(crate) struct EntitlementLocks {
    locks: Arc<RwLock<HashMap<CounterKey, Arc<Mutex<()>>>>>,
}

impl EntitlementLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn acquire(&self, key: CounterKey) -> Arc<Mutex<()>> {
        // Fast path: the lock usually exists already.
        {
            let locks_read = self.locks.read().await;
            if let Some(lock) = locks_read.get(&key) {
                return lock.clone();
            }
        }

        let mut locks_write = self.locks.write().await;
        locks_write
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
