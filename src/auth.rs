//! Opaque bearer tokens. A token is 32 random bytes in URL-safe base64,
//! stored alongside its owner and expiry; resolving one never reveals whether
//! it was unknown or merely expired.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, NaiveDateTime, Utc};
use rand::RngCore;
use sqlx::{Row, SqlitePool};

use crate::account::UserId;
use crate::error::AuthError;

pub(crate) const TOKEN_TTL_DAYS: i64 = 7;

const TOKEN_BYTES: usize = 32;

/// Mints a token for the user, valid for `ttl` from now.
pub(crate) async fn issue_token(
    pool: &SqlitePool,
    user_id: UserId,
    ttl: Duration,
) -> Result<String, AuthError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);

    sqlx::query("INSERT INTO auth_tokens (token, user_id, expires_at) VALUES (?1, ?2, ?3)")
        .bind(&token)
        .bind(user_id.0)
        .bind((Utc::now() + ttl).naive_utc())
        .execute(pool)
        .await?;

    Ok(token)
}

/// Maps a presented token back to its owner. Unknown and expired tokens both
/// come back as [`AuthError::InvalidToken`].
pub(crate) async fn resolve_token(pool: &SqlitePool, token: &str) -> Result<UserId, AuthError> {
    let row = sqlx::query("SELECT user_id, expires_at FROM auth_tokens WHERE token = ?1")
        .bind(token)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Err(AuthError::InvalidToken);
    };

    let expires_at: NaiveDateTime = row.try_get("expires_at")?;
    if expires_at.and_utc() <= Utc::now() {
        return Err(AuthError::InvalidToken);
    }

    Ok(UserId(row.try_get("user_id")?))
}
