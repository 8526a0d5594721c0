//! Redeemed offers. Each row is a receipt for one redemption: the gross
//! amount presented by the partner, the discount percentage applied and the
//! net total the customer pays. Monetary values are stored as text and
//! handled as [`Decimal`] end to end.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::account::UserId;
use crate::subscription::SubscriptionId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub(crate) struct OfferId(pub i64);

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Purchase amount before the discount. Zero is a valid purchase; negative
/// amounts are rejected at construction so they cannot reach the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GrossAmount(Decimal);

#[derive(Debug, thiserror::Error)]
#[error("amount must not be negative, got {0}")]
pub(crate) struct InvalidAmountError(pub(crate) Decimal);

impl GrossAmount {
    pub(crate) fn new(amount: Decimal) -> Result<Self, InvalidAmountError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(InvalidAmountError(amount));
        }
        Ok(Self(amount))
    }

    pub(crate) const fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for GrossAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Offer {
    pub(crate) id: OfferId,
    #[serde(rename = "customerID")]
    pub(crate) customer_id: UserId,
    #[serde(rename = "partnerID")]
    pub(crate) partner_id: UserId,
    #[serde(rename = "subscriptionID")]
    pub(crate) subscription_id: SubscriptionId,
    pub(crate) amount: Decimal,
    pub(crate) discount: Decimal,
    pub(crate) total: Decimal,
    #[serde(rename = "createdAt")]
    pub(crate) created_at: DateTime<Utc>,
}

pub(crate) struct NewOffer {
    pub(crate) customer_id: UserId,
    pub(crate) partner_id: UserId,
    pub(crate) subscription_id: SubscriptionId,
    pub(crate) amount: Decimal,
    pub(crate) discount: Decimal,
    pub(crate) total: Decimal,
}

fn decimal_column(row: &SqliteRow, column: &'static str) -> Result<Decimal, sqlx::Error> {
    let text: String = row.try_get(column)?;
    Decimal::from_str(&text).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.into(),
        source: Box::new(e),
    })
}

fn offer_from_row(row: &SqliteRow) -> Result<Offer, sqlx::Error> {
    let created_at: NaiveDateTime = row.try_get("created_at")?;

    Ok(Offer {
        id: OfferId(row.try_get("id")?),
        customer_id: UserId(row.try_get("customer_id")?),
        partner_id: UserId(row.try_get("partner_id")?),
        subscription_id: SubscriptionId(row.try_get("subscription_id")?),
        amount: decimal_column(row, "amount")?,
        discount: decimal_column(row, "discount")?,
        total: decimal_column(row, "total")?,
        created_at: created_at.and_utc(),
    })
}

pub(crate) async fn insert_offer(pool: &SqlitePool, offer: &NewOffer) -> Result<Offer, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO offers (customer_id, partner_id, subscription_id, amount, discount, total)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(offer.customer_id.0)
    .bind(offer.partner_id.0)
    .bind(offer.subscription_id.0)
    .bind(offer.amount.to_string())
    .bind(offer.discount.to_string())
    .bind(offer.total.to_string())
    .execute(pool)
    .await?;

    find_offer(pool, OfferId(result.last_insert_rowid()))
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub(crate) async fn find_offer(
    pool: &SqlitePool,
    id: OfferId,
) -> Result<Option<Offer>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, customer_id, partner_id, subscription_id, amount, discount, total, created_at
         FROM offers WHERE id = ?1",
    )
    .bind(id.0)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(offer_from_row).transpose()
}

/// Offers redeemed by a customer, newest first.
pub(crate) async fn offers_for_customer(
    pool: &SqlitePool,
    customer_id: UserId,
) -> Result<Vec<Offer>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, customer_id, partner_id, subscription_id, amount, discount, total, created_at
         FROM offers WHERE customer_id = ?1 ORDER BY id DESC",
    )
    .bind(customer_id.0)
    .fetch_all(pool)
    .await?;

    rows.iter().map(offer_from_row).collect()
}

/// Offers redeemed at a partner, newest first.
pub(crate) async fn offers_for_partner(
    pool: &SqlitePool,
    partner_id: UserId,
) -> Result<Vec<Offer>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, customer_id, partner_id, subscription_id, amount, discount, total, created_at
         FROM offers WHERE partner_id = ?1 ORDER BY id DESC",
    )
    .bind(partner_id.0)
    .fetch_all(pool)
    .await?;

    rows.iter().map(offer_from_row).collect()
}
