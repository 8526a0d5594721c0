//! HTTP surface. Requests authenticate with an opaque bearer token resolved
//! through the [`Principal`] request guard; domain errors are mapped onto
//! `{error, message}` JSON bodies with a matching status code.

use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Catcher, Route, State, catch, catchers, get, post, routes};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::warn;

use crate::account::{User, UserId, find_user, record_share};
use crate::auth::resolve_token;
use crate::error::{AccountError, AuthError, RedemptionError, SubscriptionError};
use crate::offer::{GrossAmount, Offer, offers_for_customer, offers_for_partner};
use crate::redemption::{RedemptionRequest, RedemptionService};
use crate::subscription::{PlanId, Subscription, active_subscription, lifecycle};

/// The authenticated account behind the `Authorization: Bearer` header.
pub(crate) struct Principal(pub(crate) User);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Principal {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(pool) = req.rocket().state::<SqlitePool>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };

        let token = req
            .headers()
            .get_one("Authorization")
            .and_then(|header| header.strip_prefix("Bearer "));
        let Some(token) = token else {
            return Outcome::Error((Status::Unauthorized, ()));
        };

        let user_id = match resolve_token(pool, token).await {
            Ok(user_id) => user_id,
            Err(AuthError::InvalidToken) => {
                return Outcome::Error((Status::Unauthorized, ()));
            }
            Err(AuthError::Database(e)) => {
                warn!(error = %e, "token lookup failed");
                return Outcome::Error((Status::InternalServerError, ()));
            }
        };

        match find_user(pool, user_id).await {
            Ok(Some(user)) => Outcome::Success(Self(user)),
            Ok(None) => Outcome::Error((Status::Unauthorized, ())),
            Err(e) => {
                warn!(error = %e, "user lookup failed");
                Outcome::Error((Status::InternalServerError, ()))
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// Wire form of every route failure: a status code plus a stable error code
/// and a human-readable message.
pub(crate) struct ApiError {
    status: Status,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: Status, error: &'static str, message: String) -> Self {
        Self {
            status,
            error,
            message,
        }
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'static> {
        let body = Json(ErrorBody {
            error: self.error.to_string(),
            message: self.message,
        });
        (self.status, body).respond_to(req)
    }
}

impl From<RedemptionError> for ApiError {
    fn from(e: RedemptionError) -> Self {
        let message = e.to_string();
        let (status, error) = match e {
            RedemptionError::IdentityMismatch => (Status::Forbidden, "identity_mismatch"),
            RedemptionError::NoSubscription => (Status::BadRequest, "no_subscription"),
            RedemptionError::SubscriptionExpired => (Status::BadRequest, "subscription_expired"),
            RedemptionError::NotConnected => (Status::Conflict, "not_connected"),
            RedemptionError::NotApproved => (Status::Forbidden, "not_approved"),
            RedemptionError::NotVerified => (Status::Forbidden, "not_verified"),
            RedemptionError::NoRemainingOffers => (Status::Conflict, "no_remaining_offers"),
            RedemptionError::Persistence(_) => {
                (Status::InternalServerError, "persistence_failure")
            }
            RedemptionError::Delivery(_) => (Status::BadGateway, "delivery_failure"),
        };
        Self::new(status, error, message)
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        let message = e.to_string();
        let (status, error) = match e {
            SubscriptionError::AlreadySubscribed => (Status::Conflict, "already_subscribed"),
            SubscriptionError::NoActiveSubscription => (Status::BadRequest, "no_subscription"),
            SubscriptionError::PlanNotFound => (Status::NotFound, "plan_not_found"),
            SubscriptionError::NotAdmin => (Status::Forbidden, "not_admin"),
            SubscriptionError::Database(_) => (Status::InternalServerError, "persistence_failure"),
        };
        Self::new(status, error, message)
    }
}

impl From<AccountError> for ApiError {
    fn from(e: AccountError) -> Self {
        let message = e.to_string();
        let (status, error) = match e {
            AccountError::AlreadyShared => (Status::Conflict, "already_shared"),
            AccountError::Database(_) => (Status::InternalServerError, "persistence_failure"),
        };
        Self::new(status, error, message)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        Self::new(
            Status::InternalServerError,
            "persistence_failure",
            e.to_string(),
        )
    }
}

// Failures that never reach a handler (guard rejections, unknown routes,
// body parse errors) still have to come back as `{error, message}` JSON
// rather than rocket's default error page.
#[catch(401)]
fn unauthorized() -> ApiError {
    ApiError::new(
        Status::Unauthorized,
        "unauthorized",
        "missing or invalid bearer token".to_string(),
    )
}

#[catch(default)]
fn fallback(status: Status, _request: &Request) -> ApiError {
    ApiError::new(
        status,
        "request_failed",
        format!("request failed: {}", status.reason_lossy()),
    )
}

pub(crate) fn catchers() -> Vec<Catcher> {
    catchers![unauthorized, fallback]
}

fn not_a_customer() -> ApiError {
    ApiError::new(
        Status::Forbidden,
        "not_customer",
        "acting account is not a customer".to_string(),
    )
}

#[derive(Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
}

#[get("/health")]
fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

#[derive(Deserialize)]
struct OfferRequest {
    amount: Decimal,
    #[serde(rename = "customerID")]
    customer_id: UserId,
    #[serde(rename = "partnerID")]
    partner_id: UserId,
}

#[derive(Serialize)]
struct ReceiptResponse {
    receipt: Offer,
}

#[post("/offer", format = "json", data = "<request>")]
async fn redeem_offer(
    principal: Principal,
    request: Json<OfferRequest>,
    service: &State<RedemptionService>,
) -> Result<Json<ReceiptResponse>, ApiError> {
    let request = request.into_inner();
    let amount = GrossAmount::new(request.amount)
        .map_err(|e| ApiError::new(Status::BadRequest, "invalid_amount", e.to_string()))?;

    let receipt = service
        .consume_offer(
            &principal.0,
            RedemptionRequest {
                customer_id: request.customer_id,
                partner_id: request.partner_id,
                amount,
            },
        )
        .await?;

    Ok(Json(ReceiptResponse { receipt }))
}

#[derive(Serialize)]
struct OffersResponse {
    offers: Vec<Offer>,
}

/// Redemption history for the caller: the offers they redeemed as a customer,
/// or the offers redeemed at their venue as a partner.
#[get("/offers")]
async fn list_offers(
    principal: Principal,
    pool: &State<SqlitePool>,
) -> Result<Json<OffersResponse>, ApiError> {
    let offers = if principal.0.is_partner() {
        offers_for_partner(pool, principal.0.id).await?
    } else {
        offers_for_customer(pool, principal.0.id).await?
    };

    Ok(Json(OffersResponse { offers }))
}

#[post("/share")]
async fn share(principal: Principal, pool: &State<SqlitePool>) -> Result<Status, ApiError> {
    if !principal.0.is_customer() {
        return Err(not_a_customer());
    }

    record_share(pool, principal.0.id).await?;
    Ok(Status::Created)
}

#[derive(Serialize)]
struct SubscriptionResponse {
    subscription: Subscription,
}

#[get("/subscription")]
async fn current_subscription(
    principal: Principal,
    pool: &State<SqlitePool>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let subscription = active_subscription(pool, principal.0.id)
        .await?
        .ok_or_else(|| {
            ApiError::new(
                Status::NotFound,
                "no_subscription",
                "customer has no subscription".to_string(),
            )
        })?;

    Ok(Json(SubscriptionResponse { subscription }))
}

#[derive(Deserialize)]
struct SubscribeRequest {
    #[serde(rename = "planID")]
    plan_id: PlanId,
}

#[post("/subscriptions", format = "json", data = "<request>")]
async fn subscribe(
    principal: Principal,
    request: Json<SubscribeRequest>,
    pool: &State<SqlitePool>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    if !principal.0.is_customer() {
        return Err(not_a_customer());
    }

    let subscription = lifecycle::subscribe(pool, principal.0.id, request.plan_id).await?;
    Ok(Json(SubscriptionResponse { subscription }))
}

#[post("/subscriptions/renew")]
async fn renew(
    principal: Principal,
    pool: &State<SqlitePool>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    if !principal.0.is_customer() {
        return Err(not_a_customer());
    }

    let subscription = lifecycle::renew(pool, principal.0.id).await?;
    Ok(Json(SubscriptionResponse { subscription }))
}

#[post("/subscriptions/upgrade", format = "json", data = "<request>")]
async fn upgrade(
    principal: Principal,
    request: Json<SubscribeRequest>,
    pool: &State<SqlitePool>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    if !principal.0.is_customer() {
        return Err(not_a_customer());
    }

    let subscription = lifecycle::upgrade(pool, principal.0.id, request.plan_id).await?;
    Ok(Json(SubscriptionResponse { subscription }))
}

#[derive(Deserialize)]
struct AdminUpgradeRequest {
    #[serde(rename = "customerID")]
    customer_id: UserId,
    #[serde(rename = "planID")]
    plan_id: PlanId,
}

#[post("/subscriptions/admin-upgrade", format = "json", data = "<request>")]
async fn admin_upgrade(
    principal: Principal,
    request: Json<AdminUpgradeRequest>,
    pool: &State<SqlitePool>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let subscription =
        lifecycle::admin_upgrade(pool, &principal.0, request.customer_id, request.plan_id).await?;
    Ok(Json(SubscriptionResponse { subscription }))
}

pub(crate) fn routes() -> Vec<Route> {
    routes![
        health,
        redeem_offer,
        list_offers,
        share,
        current_subscription,
        subscribe,
        renew,
        upgrade,
        admin_upgrade,
    ]
}

#[cfg(test)]
mod tests {
    use rocket::http::{ContentType, Header};
    use rocket::local::asynchronous::Client;
    use serde_json::{Value, json};

    use super::*;
    use crate::account::AccountKind;
    use crate::hub::{Hub, HubConfig, next_epoch};
    use crate::test_utils::{
        MockConnection, TestWorld, bearer_token, create_test_customer, setup_test_db,
    };

    async fn test_client() -> (Client, SqlitePool, Hub) {
        let pool = setup_test_db().await;
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let client = Client::tracked(crate::build_rocket(pool.clone(), hub.clone()))
            .await
            .expect("valid rocket instance");

        (client, pool, hub)
    }

    fn bearer(token: &str) -> Header<'static> {
        Header::new("Authorization", format!("Bearer {token}"))
    }

    async fn connect_customer(hub: &Hub, customer_id: UserId) -> MockConnection {
        let connection = MockConnection::default();
        hub.register(customer_id, next_epoch(), Box::new(connection.clone()));
        assert!(hub.is_registered(customer_id).await.unwrap());
        connection
    }

    async fn json_body(response: rocket::local::asynchronous::LocalResponse<'_>) -> Value {
        let body = response.into_string().await.expect("response body");
        serde_json::from_str(&body).expect("valid JSON response")
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (client, _pool, _hub) = test_client().await;

        let response = client.get("/health").dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn offer_requires_a_bearer_token() {
        let (client, _pool, _hub) = test_client().await;

        let missing = client
            .post("/offer")
            .header(ContentType::JSON)
            .body(json!({"amount": 10, "customerID": 1, "partnerID": 2}).to_string())
            .dispatch()
            .await;
        assert_eq!(missing.status(), Status::Unauthorized);
        let body = json_body(missing).await;
        assert_eq!(body["error"], "unauthorized");
        assert!(body["message"].as_str().unwrap().contains("bearer token"));

        let bogus = client
            .post("/offer")
            .header(ContentType::JSON)
            .header(bearer("not-a-token"))
            .body(json!({"amount": 10, "customerID": 1, "partnerID": 2}).to_string())
            .dispatch()
            .await;
        assert_eq!(bogus.status(), Status::Unauthorized);
        let body = json_body(bogus).await;
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn unhandled_requests_still_answer_in_json() {
        let (client, _pool, _hub) = test_client().await;

        let unknown = client.get("/no-such-route").dispatch().await;
        assert_eq!(unknown.status(), Status::NotFound);
        let body = json_body(unknown).await;
        assert_eq!(body["error"], "request_failed");
        assert!(body["message"].as_str().unwrap().contains("Not Found"));
    }

    #[tokio::test]
    async fn offer_redeems_and_pushes_the_receipt() {
        let (client, pool, hub) = test_client().await;
        let world = TestWorld::seed(&pool).await;
        let connection = connect_customer(&hub, world.customer.id).await;
        let token = bearer_token(&pool, &world.partner.user).await;

        let response = client
            .post("/offer")
            .header(ContentType::JSON)
            .header(bearer(&token))
            .body(
                json!({
                    "amount": 100,
                    "customerID": world.customer.id.0,
                    "partnerID": world.partner.id().0,
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let body = json_body(response).await;
        assert_eq!(body["receipt"]["customerID"], world.customer.id.0);
        assert_eq!(body["receipt"]["partnerID"], world.partner.id().0);
        assert_eq!(body["receipt"]["amount"], "100");
        assert_eq!(body["receipt"]["total"], "75");

        let pushed: Value = serde_json::from_str(&connection.texts()[1]).unwrap();
        assert_eq!(pushed["receipt"]["total"], "75");
    }

    #[tokio::test]
    async fn offer_for_a_disconnected_customer_conflicts() {
        let (client, pool, _hub) = test_client().await;
        let world = TestWorld::seed(&pool).await;
        let token = bearer_token(&pool, &world.partner.user).await;

        let response = client
            .post("/offer")
            .header(ContentType::JSON)
            .header(bearer(&token))
            .body(
                json!({
                    "amount": 100,
                    "customerID": world.customer.id.0,
                    "partnerID": world.partner.id().0,
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);

        let body = json_body(response).await;
        assert_eq!(body["error"], "not_connected");
        assert!(body["message"].as_str().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn offer_naming_another_partner_is_forbidden() {
        let (client, pool, hub) = test_client().await;
        let world = TestWorld::seed(&pool).await;
        connect_customer(&hub, world.customer.id).await;
        let token = bearer_token(&pool, &world.partner.user).await;

        let response = client
            .post("/offer")
            .header(ContentType::JSON)
            .header(bearer(&token))
            .body(
                json!({
                    "amount": 100,
                    "customerID": world.customer.id.0,
                    "partnerID": world.partner.id().0 + 1,
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let body = json_body(response).await;
        assert_eq!(body["error"], "identity_mismatch");
    }

    #[tokio::test]
    async fn negative_amount_is_rejected_before_the_workflow() {
        let (client, pool, hub) = test_client().await;
        let world = TestWorld::seed(&pool).await;
        connect_customer(&hub, world.customer.id).await;
        let token = bearer_token(&pool, &world.partner.user).await;

        let response = client
            .post("/offer")
            .header(ContentType::JSON)
            .header(bearer(&token))
            .body(
                json!({
                    "amount": -5,
                    "customerID": world.customer.id.0,
                    "partnerID": world.partner.id().0,
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let body = json_body(response).await;
        assert_eq!(body["error"], "invalid_amount");
    }

    #[tokio::test]
    async fn offers_history_is_scoped_to_the_caller_role() {
        let (client, pool, hub) = test_client().await;
        let world = TestWorld::seed(&pool).await;
        connect_customer(&hub, world.customer.id).await;
        let partner_token = bearer_token(&pool, &world.partner.user).await;
        let customer_token = bearer_token(&pool, &world.customer).await;

        let redeemed = client
            .post("/offer")
            .header(ContentType::JSON)
            .header(bearer(&partner_token))
            .body(
                json!({
                    "amount": 40,
                    "customerID": world.customer.id.0,
                    "partnerID": world.partner.id().0,
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(redeemed.status(), Status::Ok);

        for token in [&customer_token, &partner_token] {
            let response = client
                .get("/offers")
                .header(bearer(token))
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::Ok);

            let body = json_body(response).await;
            let offers = body["offers"].as_array().unwrap();
            assert_eq!(offers.len(), 1);
            assert_eq!(offers[0]["amount"], "40");
        }
    }

    #[tokio::test]
    async fn share_is_recorded_once() {
        let (client, pool, _hub) = test_client().await;
        let customer = create_test_customer(&pool, "sharer@example.com").await;
        let token = bearer_token(&pool, &customer).await;

        let first = client.post("/share").header(bearer(&token)).dispatch().await;
        assert_eq!(first.status(), Status::Created);

        let second = client.post("/share").header(bearer(&token)).dispatch().await;
        assert_eq!(second.status(), Status::Conflict);
        let body = json_body(second).await;
        assert_eq!(body["error"], "already_shared");
    }

    #[tokio::test]
    async fn share_by_a_partner_is_forbidden() {
        let (client, pool, _hub) = test_client().await;
        let world = TestWorld::seed(&pool).await;
        let token = bearer_token(&pool, &world.partner.user).await;

        let response = client.post("/share").header(bearer(&token)).dispatch().await;
        assert_eq!(response.status(), Status::Forbidden);
    }

    #[tokio::test]
    async fn subscription_lifecycle_over_http() {
        let (client, pool, _hub) = test_client().await;
        let customer = create_test_customer(&pool, "subscriber@example.com").await;
        let token = bearer_token(&pool, &customer).await;
        let starter = crate::subscription::create_plan(&pool, "starter", Decimal::new(1999, 2), 5)
            .await
            .unwrap();
        let premium = crate::subscription::create_plan(&pool, "premium", Decimal::new(4999, 2), 10)
            .await
            .unwrap();

        let none_yet = client
            .get("/subscription")
            .header(bearer(&token))
            .dispatch()
            .await;
        assert_eq!(none_yet.status(), Status::NotFound);

        let subscribed = client
            .post("/subscriptions")
            .header(ContentType::JSON)
            .header(bearer(&token))
            .body(json!({"planID": starter.id.0}).to_string())
            .dispatch()
            .await;
        assert_eq!(subscribed.status(), Status::Ok);
        let body = json_body(subscribed).await;
        assert_eq!(body["subscription"]["remainingPool"], 5);

        let upgraded = client
            .post("/subscriptions/upgrade")
            .header(ContentType::JSON)
            .header(bearer(&token))
            .body(json!({"planID": premium.id.0}).to_string())
            .dispatch()
            .await;
        assert_eq!(upgraded.status(), Status::Ok);
        let body = json_body(upgraded).await;
        assert_eq!(body["subscription"]["planID"], premium.id.0);
        assert_eq!(body["subscription"]["remainingPool"], 15);

        let current = client
            .get("/subscription")
            .header(bearer(&token))
            .dispatch()
            .await;
        assert_eq!(current.status(), Status::Ok);
        let body = json_body(current).await;
        assert_eq!(body["subscription"]["planID"], premium.id.0);

        let missing_plan = client
            .post("/subscriptions/upgrade")
            .header(ContentType::JSON)
            .header(bearer(&token))
            .body(json!({"planID": 404}).to_string())
            .dispatch()
            .await;
        assert_eq!(missing_plan.status(), Status::NotFound);
    }

    #[tokio::test]
    async fn admin_upgrade_requires_an_admin_token() {
        let (client, pool, _hub) = test_client().await;
        let world = TestWorld::seed(&pool).await;
        let premium = crate::subscription::create_plan(&pool, "premium", Decimal::new(4999, 2), 10)
            .await
            .unwrap();
        let admin =
            crate::account::create_user(&pool, "admin@example.com", AccountKind::Admin, true)
                .await
                .unwrap();
        let customer_token = bearer_token(&pool, &world.customer).await;
        let admin_token = bearer_token(&pool, &admin).await;

        let request_body = json!({
            "customerID": world.customer.id.0,
            "planID": premium.id.0,
        })
        .to_string();

        let denied = client
            .post("/subscriptions/admin-upgrade")
            .header(ContentType::JSON)
            .header(bearer(&customer_token))
            .body(&request_body)
            .dispatch()
            .await;
        assert_eq!(denied.status(), Status::Forbidden);
        let body = json_body(denied).await;
        assert_eq!(body["error"], "not_admin");

        let upgraded = client
            .post("/subscriptions/admin-upgrade")
            .header(ContentType::JSON)
            .header(bearer(&admin_token))
            .body(&request_body)
            .dispatch()
            .await;
        assert_eq!(upgraded.status(), Status::Ok);
        let body = json_body(upgraded).await;
        assert_eq!(body["subscription"]["planID"], premium.id.0);
    }

    #[test]
    fn all_routes_are_mounted() {
        assert_eq!(routes().len(), 9);
    }
}
