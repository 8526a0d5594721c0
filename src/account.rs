//! Users, partner profiles, and share records. A user is a single row with a
//! tagged account kind; partners carry an extra profile row with the discount
//! they grant and the flags the redemption gates check.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::AccountError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub(crate) struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccountKind {
    Customer,
    Partner,
    Admin,
}

impl AccountKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Partner => "partner",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown account kind: {0}")]
pub(crate) struct ParseAccountKindError(String);

impl FromStr for AccountKind {
    type Err = ParseAccountKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "partner" => Ok(Self::Partner),
            "admin" => Ok(Self::Admin),
            other => Err(ParseAccountKindError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct User {
    pub(crate) id: UserId,
    pub(crate) email: String,
    pub(crate) kind: AccountKind,
    pub(crate) verified: bool,
    pub(crate) created_at: DateTime<Utc>,
}

impl User {
    pub(crate) const fn is_customer(&self) -> bool {
        matches!(self.kind, AccountKind::Customer)
    }

    pub(crate) const fn is_partner(&self) -> bool {
        matches!(self.kind, AccountKind::Partner)
    }

    pub(crate) const fn is_admin(&self) -> bool {
        matches!(self.kind, AccountKind::Admin)
    }
}

/// Percentage a partner knocks off the gross amount, 0 to 100 inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DiscountPercent(Decimal);

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("discount percent must be between 0 and 100, got {0}")]
pub(crate) struct InvalidDiscountError(Decimal);

impl DiscountPercent {
    pub(crate) fn new(value: Decimal) -> Result<Self, InvalidDiscountError> {
        if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
            return Err(InvalidDiscountError(value));
        }
        Ok(Self(value))
    }

    pub(crate) const fn value(self) -> Decimal {
        self.0
    }

    /// Net amount after the discount: `gross - gross * percent / 100`.
    pub(crate) fn apply_to(self, gross: Decimal) -> Decimal {
        gross - gross * self.0 / Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PartnerProfile {
    pub(crate) approved: bool,
    pub(crate) discount: DiscountPercent,
    pub(crate) sharable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Partner {
    pub(crate) user: User,
    pub(crate) profile: PartnerProfile,
}

impl Partner {
    pub(crate) const fn id(&self) -> UserId {
        self.user.id
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, sqlx::Error> {
    let kind_text: String = row.try_get("account_kind")?;
    let kind = kind_text
        .parse::<AccountKind>()
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: "account_kind".into(),
            source: Box::new(e),
        })?;
    let created_at: NaiveDateTime = row.try_get("created_at")?;

    Ok(User {
        id: UserId(row.try_get("id")?),
        email: row.try_get("email")?,
        kind,
        verified: row.try_get("verified")?,
        created_at: created_at.and_utc(),
    })
}

fn profile_from_row(row: &SqliteRow) -> Result<PartnerProfile, sqlx::Error> {
    let discount_text: String = row.try_get("discount_percent")?;
    let discount = Decimal::from_str(&discount_text)
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: "discount_percent".into(),
            source: Box::new(e),
        })
        .and_then(|value| {
            DiscountPercent::new(value).map_err(|e| sqlx::Error::ColumnDecode {
                index: "discount_percent".into(),
                source: Box::new(e),
            })
        })?;

    Ok(PartnerProfile {
        approved: row.try_get("approved")?,
        discount,
        sharable: row.try_get("sharable")?,
    })
}

pub(crate) async fn create_user(
    pool: &SqlitePool,
    email: &str,
    kind: AccountKind,
    verified: bool,
) -> Result<User, sqlx::Error> {
    let result = sqlx::query("INSERT INTO users (email, account_kind, verified) VALUES (?1, ?2, ?3)")
        .bind(email)
        .bind(kind.as_str())
        .bind(verified)
        .execute(pool)
        .await?;

    let id = UserId(result.last_insert_rowid());
    find_user(pool, id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub(crate) async fn find_user(
    pool: &SqlitePool,
    id: UserId,
) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query("SELECT id, email, account_kind, verified, created_at FROM users WHERE id = ?1")
        .bind(id.0)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(user_from_row).transpose()
}

pub(crate) async fn create_partner(
    pool: &SqlitePool,
    email: &str,
    verified: bool,
    profile: PartnerProfile,
) -> Result<Partner, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query("INSERT INTO users (email, account_kind, verified) VALUES (?1, ?2, ?3)")
        .bind(email)
        .bind(AccountKind::Partner.as_str())
        .bind(verified)
        .execute(tx.as_mut())
        .await?;
    let id = UserId(result.last_insert_rowid());

    sqlx::query(
        "INSERT INTO partner_profiles (partner_id, approved, discount_percent, sharable)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(id.0)
    .bind(profile.approved)
    .bind(profile.discount.value().to_string())
    .bind(profile.sharable)
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;

    find_partner(pool, id).await?.ok_or(sqlx::Error::RowNotFound)
}

/// Fetches a partner user together with its profile. `None` when the id does
/// not exist, is not a partner account, or has no profile row.
pub(crate) async fn find_partner(
    pool: &SqlitePool,
    id: UserId,
) -> Result<Option<Partner>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT u.id, u.email, u.account_kind, u.verified, u.created_at,
                p.approved, p.discount_percent, p.sharable
         FROM users u
         JOIN partner_profiles p ON p.partner_id = u.id
         WHERE u.id = ?1 AND u.account_kind = 'partner'",
    )
    .bind(id.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(Partner {
        user: user_from_row(&row)?,
        profile: profile_from_row(&row)?,
    }))
}

/// Records the one-time share action that unlocks the sharable-partner bonus.
pub(crate) async fn record_share(
    pool: &SqlitePool,
    customer_id: UserId,
) -> Result<(), AccountError> {
    let result = sqlx::query("INSERT INTO shares (customer_id) VALUES (?1)")
        .bind(customer_id.0)
        .execute(pool)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(AccountError::AlreadyShared)
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn has_share(
    pool: &SqlitePool,
    customer_id: UserId,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM shares WHERE customer_id = ?1)")
        .bind(customer_id.0)
        .fetch_one(pool)
        .await
}
