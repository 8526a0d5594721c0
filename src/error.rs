//! Domain error types, one enum per subsystem. HTTP status mapping lives in
//! `api`, close-frame mapping for the WebSocket bootstrap lives in
//! `hub::socket`; these enums carry only the business meaning.

/// Terminal outcomes of the offer-consumption workflow. Each validation gate
/// maps to exactly one variant; the first failing gate wins and nothing after
/// it runs.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RedemptionError {
    #[error("claimed partner id does not match the authenticated partner")]
    IdentityMismatch,
    #[error("customer has no subscription")]
    NoSubscription,
    #[error("customer subscription has expired")]
    SubscriptionExpired,
    #[error("customer is not connected")]
    NotConnected,
    #[error("partner is not approved")]
    NotApproved,
    #[error("customer account is not verified")]
    NotVerified,
    #[error("no remaining offers for this partner")]
    NoRemainingOffers,
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("receipt delivery failed: {0}")]
    Delivery(#[source] HubError),
}

/// Failures surfaced by the connection registry to its callers. Ping failures
/// inside the loop are never reported here; dead peers are reaped silently.
#[derive(Debug, thiserror::Error)]
pub(crate) enum HubError {
    #[error("customer is not connected")]
    NotConnected,
    #[error("write to the customer connection failed")]
    SendFailed,
    #[error("failed to encode receipt frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection registry is no longer running")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SubscriptionError {
    #[error("customer already has an active subscription")]
    AlreadySubscribed,
    #[error("customer has no active subscription")]
    NoActiveSubscription,
    #[error("plan not found")]
    PlanNotFound,
    #[error("acting user is not an admin")]
    NotAdmin,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AccountError {
    #[error("customer already shared")]
    AlreadyShared,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
