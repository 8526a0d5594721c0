//! WebSocket entry point for customer connections. The socket authenticates
//! with a single token frame, hands its write half to the hub and then only
//! drains the read side until the peer goes away.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rocket::{Route, State, get, routes};
use rocket_ws::frame::{CloseCode, CloseFrame};
use rocket_ws::stream::DuplexStream;
use rocket_ws::{Channel, Message, WebSocket};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use super::{ClientConnection, Hub, next_epoch};
use crate::account::{User, find_user};
use crate::auth::resolve_token;
use crate::error::AuthError;

const CLOSE_REASON_EMPTY_TOKEN: &str = "empty token";
const CLOSE_REASON_INVALID_TOKEN: &str = "invalid token";

/// First frame a client must send after the upgrade.
#[derive(Deserialize)]
struct AuthFrame {
    token: String,
}

#[async_trait]
impl ClientConnection for SplitSink<DuplexStream, Message> {
    async fn send_text(&mut self, payload: String) -> Result<(), rocket_ws::result::Error> {
        self.send(Message::Text(payload)).await
    }

    async fn send_ping(&mut self) -> Result<(), rocket_ws::result::Error> {
        self.send(Message::Ping(Vec::new())).await
    }
}

#[get("/connect")]
fn connect<'a>(
    ws: WebSocket,
    hub: &'a State<Hub>,
    pool: &'a State<SqlitePool>,
) -> Channel<'a> {
    let hub = hub.inner().clone();
    let pool = pool.inner().clone();

    ws.channel(move |mut stream| {
        Box::pin(async move {
            let Some(customer) = authenticate(&mut stream, &pool).await else {
                return Ok(());
            };

            let epoch = next_epoch();
            let (sink, mut reader) = stream.split();
            hub.register(customer.id, epoch, Box::new(sink));

            // Inbound frames carry nothing after the handshake; the loop only
            // exists to notice when the peer hangs up.
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            hub.unregister(customer.id, epoch);
            debug!(customer_id = %customer.id, "socket closed");
            Ok(())
        })
    })
}

/// Runs the first-frame token handshake. Returns the authenticated customer,
/// or closes the socket with a policy close frame and returns `None`.
async fn authenticate(stream: &mut DuplexStream, pool: &SqlitePool) -> Option<User> {
    let token = match stream.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<AuthFrame>(&text) {
            Ok(frame) => frame.token,
            Err(_) => return close_with(stream, CLOSE_REASON_INVALID_TOKEN).await,
        },
        _ => return close_with(stream, CLOSE_REASON_INVALID_TOKEN).await,
    };

    if token.is_empty() {
        return close_with(stream, CLOSE_REASON_EMPTY_TOKEN).await;
    }

    let user_id = match resolve_token(pool, &token).await {
        Ok(user_id) => user_id,
        Err(AuthError::InvalidToken) => {
            return close_with(stream, CLOSE_REASON_INVALID_TOKEN).await;
        }
        Err(AuthError::Database(e)) => {
            warn!(error = %e, "token lookup failed during socket auth");
            return close_with(stream, CLOSE_REASON_INVALID_TOKEN).await;
        }
    };

    match find_user(pool, user_id).await {
        Ok(Some(user)) if user.is_customer() => Some(user),
        Ok(_) => close_with(stream, CLOSE_REASON_INVALID_TOKEN).await,
        Err(e) => {
            warn!(error = %e, "user lookup failed during socket auth");
            close_with(stream, CLOSE_REASON_INVALID_TOKEN).await
        }
    }
}

async fn close_with(stream: &mut DuplexStream, reason: &'static str) -> Option<User> {
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into(),
    };
    if let Err(e) = stream.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame write failed");
    }
    None
}

pub(crate) fn routes() -> Vec<Route> {
    routes![connect]
}
