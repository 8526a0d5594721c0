//! Shared test fixtures: database setup, a scriptable hub connection and
//! helpers that seed the accounts, plans and subscriptions the workflows
//! expect to find.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use sqlx::SqlitePool;

use crate::account::{
    AccountKind, DiscountPercent, Partner, PartnerProfile, User, create_partner, create_user,
};
use crate::auth::{TOKEN_TTL_DAYS, issue_token};
use crate::entitlement::CounterKey;
use crate::hub::ClientConnection;
use crate::subscription::{Plan, Subscription, create_plan, lifecycle};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SentFrame {
    Text(String),
    Ping,
}

/// In-memory stand-in for a socket write half. Records every frame and can
/// be flipped into a failing state to simulate a dead peer.
#[derive(Clone, Default)]
pub(crate) struct MockConnection {
    frames: Arc<Mutex<Vec<SentFrame>>>,
    pub(crate) fail_text: Arc<AtomicBool>,
    pub(crate) fail_ping: Arc<AtomicBool>,
}

impl MockConnection {
    pub(crate) fn frames(&self) -> Vec<SentFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                SentFrame::Text(text) => Some(text),
                SentFrame::Ping => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClientConnection for MockConnection {
    async fn send_text(&mut self, payload: String) -> Result<(), rocket_ws::result::Error> {
        if self.fail_text.load(Ordering::Relaxed) {
            return Err(rocket_ws::result::Error::ConnectionClosed);
        }
        self.frames.lock().unwrap().push(SentFrame::Text(payload));
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), rocket_ws::result::Error> {
        if self.fail_ping.load(Ordering::Relaxed) {
            return Err(rocket_ws::result::Error::ConnectionClosed);
        }
        self.frames.lock().unwrap().push(SentFrame::Ping);
        Ok(())
    }
}

/// Centralized test database setup to eliminate duplication across test
/// files. Creates an in-memory SQLite database with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub(crate) async fn create_test_customer(pool: &SqlitePool, email: &str) -> User {
    create_user(pool, email, AccountKind::Customer, true)
        .await
        .unwrap()
}

pub(crate) async fn create_unverified_customer(pool: &SqlitePool, email: &str) -> User {
    create_user(pool, email, AccountKind::Customer, false)
        .await
        .unwrap()
}

pub(crate) async fn create_test_partner(
    pool: &SqlitePool,
    email: &str,
    discount: Decimal,
) -> Partner {
    TestPartnerBuilder::new(email)
        .with_discount(discount)
        .create(pool)
        .await
}

/// Issues a fresh bearer token for the user with the standard lifetime.
pub(crate) async fn bearer_token(pool: &SqlitePool, user: &User) -> String {
    issue_token(pool, user.id, Duration::days(TOKEN_TTL_DAYS))
        .await
        .unwrap()
}

/// Builder for partner fixtures with sensible defaults: verified, approved,
/// 25% discount, not sharable.
pub(crate) struct TestPartnerBuilder {
    email: String,
    approved: bool,
    discount: Decimal,
    sharable: bool,
}

impl TestPartnerBuilder {
    pub(crate) fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            approved: true,
            discount: Decimal::from(25),
            sharable: false,
        }
    }

    #[must_use]
    pub(crate) fn unapproved(mut self) -> Self {
        self.approved = false;
        self
    }

    #[must_use]
    pub(crate) fn sharable(mut self) -> Self {
        self.sharable = true;
        self
    }

    #[must_use]
    pub(crate) fn with_discount(mut self, discount: Decimal) -> Self {
        self.discount = discount;
        self
    }

    pub(crate) async fn create(self, pool: &SqlitePool) -> Partner {
        let profile = PartnerProfile {
            approved: self.approved,
            discount: DiscountPercent::new(self.discount).unwrap(),
            sharable: self.sharable,
        };

        create_partner(pool, &self.email, true, profile)
            .await
            .unwrap()
    }
}

/// One verified customer subscribed to a five-offer plan, plus an approved
/// partner. Covers the setup most workflow tests start from.
pub(crate) struct TestWorld {
    pub(crate) customer: User,
    pub(crate) partner: Partner,
    pub(crate) plan: Plan,
    pub(crate) subscription: Subscription,
}

impl TestWorld {
    pub(crate) async fn seed(pool: &SqlitePool) -> Self {
        let customer = create_test_customer(pool, "customer@example.com").await;
        let partner = create_test_partner(pool, "partner@example.com", Decimal::from(25)).await;
        let plan = create_plan(pool, "starter", Decimal::new(1999, 2), 5)
            .await
            .unwrap();
        let subscription = lifecycle::subscribe(pool, customer.id, plan.id)
            .await
            .unwrap();

        Self {
            customer,
            partner,
            plan,
            subscription,
        }
    }

    pub(crate) fn counter_key(&self) -> CounterKey {
        CounterKey {
            customer_id: self.customer.id,
            partner_id: self.partner.id(),
            subscription_id: self.subscription.id,
        }
    }
}
