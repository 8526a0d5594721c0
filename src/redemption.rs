//! The offer consumption workflow. A partner submits a purchase on behalf of
//! a connected customer; the workflow checks identity, subscription state,
//! connectivity and approval in a fixed order, burns one entitlement, writes
//! the receipt and pushes it down the customer's socket.
//!
//! The balance check and the decrement run under a per-counter lock, so two
//! requests against the same counter take turns and the loser sees the
//! balance the winner left behind. The receipt push happens outside the
//! lock; a failed push reports [`RedemptionError::Delivery`] but never rolls
//! back the committed redemption.

use sqlx::SqlitePool;

use crate::account::{User, UserId, find_partner, find_user, has_share};
use crate::entitlement::{CounterKey, EntitlementLocks, decrement_if_positive, fetch_or_create};
use crate::error::RedemptionError;
use crate::hub::Hub;
use crate::offer::{GrossAmount, NewOffer, Offer, insert_offer};
use crate::subscription::active_subscription;

#[derive(Debug, Clone)]
pub(crate) struct RedemptionRequest {
    pub(crate) customer_id: UserId,
    pub(crate) partner_id: UserId,
    pub(crate) amount: GrossAmount,
}

#[derive(Clone)]
pub(crate) struct RedemptionService {
    pool: SqlitePool,
    hub: Hub,
    locks: EntitlementLocks,
}

impl RedemptionService {
    pub(crate) fn new(pool: SqlitePool, hub: Hub) -> Self {
        Self {
            pool,
            hub,
            locks: EntitlementLocks::new(),
        }
    }

    /// Runs one redemption end to end and returns the stored receipt.
    ///
    /// `acting` is the authenticated account submitting the request; it must
    /// be the partner named in the request itself.
    #[tracing::instrument(
        skip_all,
        fields(customer_id = %request.customer_id, partner_id = %request.partner_id)
    )]
    pub(crate) async fn consume_offer(
        &self,
        acting: &User,
        request: RedemptionRequest,
    ) -> Result<Offer, RedemptionError> {
        if request.partner_id != acting.id {
            return Err(RedemptionError::IdentityMismatch);
        }

        let customer = find_user(&self.pool, request.customer_id)
            .await?
            .ok_or(RedemptionError::NoSubscription)?;
        let subscription = active_subscription(&self.pool, customer.id)
            .await?
            .ok_or(RedemptionError::NoSubscription)?;
        if subscription.is_expired_at(chrono::Utc::now()) {
            return Err(RedemptionError::SubscriptionExpired);
        }

        let partner = find_partner(&self.pool, request.partner_id).await?;

        // A sharable partner grants one extra redemption to customers who
        // have shared the platform, applied once when the counter is first
        // created.
        let bonus = match &partner {
            Some(partner) if partner.profile.sharable => {
                i64::from(has_share(&self.pool, customer.id).await?)
            }
            _ => 0,
        };

        let key = CounterKey {
            customer_id: customer.id,
            partner_id: request.partner_id,
            subscription_id: subscription.id,
        };

        let offer = {
            let lock = self.locks.acquire(key).await;
            let _guard = lock.lock().await;

            let counter = fetch_or_create(&self.pool, key, subscription.remaining_pool + bonus)
                .await?;

            let connected = self
                .hub
                .is_registered(customer.id)
                .await
                .map_err(RedemptionError::Delivery)?;
            if !connected {
                return Err(RedemptionError::NotConnected);
            }

            let partner = match &partner {
                Some(partner) if partner.profile.approved => partner,
                _ => return Err(RedemptionError::NotApproved),
            };
            if !customer.verified {
                return Err(RedemptionError::NotVerified);
            }
            if counter.remaining <= 0 {
                return Err(RedemptionError::NoRemainingOffers);
            }

            let gross = request.amount.value();
            let total = partner.profile.discount.apply_to(gross);

            let offer = insert_offer(
                &self.pool,
                &NewOffer {
                    customer_id: customer.id,
                    partner_id: partner.id(),
                    subscription_id: subscription.id,
                    amount: gross,
                    discount: partner.profile.discount.value(),
                    total,
                },
            )
            .await?;

            if !decrement_if_positive(&self.pool, key).await? {
                return Err(RedemptionError::NoRemainingOffers);
            }

            tracing::info!(offer_id = %offer.id, total = %offer.total, "offer redeemed");
            offer
        };

        self.hub
            .send_receipt(customer.id, offer.clone())
            .await
            .map_err(RedemptionError::Delivery)?;

        Ok(offer)
    }
}
