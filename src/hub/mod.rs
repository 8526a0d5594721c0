//! Connection hub. A single registry task owns every live customer socket;
//! the rest of the system talks to it through [`Hub`] handles backed by a
//! command channel, so connection state never needs shared locking.

pub(crate) mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};

use crate::account::UserId;
use crate::error::HubError;
use crate::offer::Offer;

/// Text frame acknowledging a successful socket authentication. Clients wait
/// for this exact string before treating the connection as live.
pub(crate) const AUTH_SUCCESS_MESSAGE: &str = "success: authenticated successfully";

/// Upper bound on any single socket write, keepalives included. A peer that
/// cannot accept a frame within this window is treated as gone.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static EPOCH: AtomicU64 = AtomicU64::new(0);

/// Monotonic tag for connection lifetimes. A socket registers and
/// unregisters with the same epoch, which lets the registry ignore teardown
/// from a connection that was never the registered one.
pub(crate) fn next_epoch() -> u64 {
    EPOCH.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HubConfig {
    pub(crate) peer_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(60),
        }
    }
}

impl HubConfig {
    /// Keepalive interval, kept inside the peer timeout so a healthy but
    /// quiet connection is always pinged before the peer gives up on us.
    pub(crate) fn ping_period(&self) -> Duration {
        self.peer_timeout * 9 / 10
    }
}

/// Write half of a customer socket as the registry sees it.
#[async_trait]
pub(crate) trait ClientConnection: Send {
    async fn send_text(&mut self, payload: String) -> Result<(), rocket_ws::result::Error>;

    async fn send_ping(&mut self) -> Result<(), rocket_ws::result::Error>;
}

pub(crate) enum HubCommand {
    Register {
        customer_id: UserId,
        epoch: u64,
        connection: Box<dyn ClientConnection>,
    },
    Unregister {
        customer_id: UserId,
        epoch: u64,
    },
    IsRegistered {
        customer_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    SendReceipt {
        customer_id: UserId,
        receipt: Offer,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
}

#[derive(Serialize)]
struct ReceiptFrame<'a> {
    receipt: &'a Offer,
}

/// Cloneable handle to the registry task.
#[derive(Clone)]
pub(crate) struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Starts the registry task and returns a handle to it. The task runs
    /// until every handle is dropped.
    pub(crate) fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry {
            config,
            connections: HashMap::new(),
        };
        let handle = tokio::spawn(registry.run(rx));

        (Self { tx }, handle)
    }

    pub(crate) fn register(&self, customer_id: UserId, epoch: u64, connection: Box<dyn ClientConnection>) {
        let command = HubCommand::Register {
            customer_id,
            epoch,
            connection,
        };
        if self.tx.send(command).is_err() {
            tracing::warn!(customer_id = %customer_id, "hub is gone, registration dropped");
        }
    }

    pub(crate) fn unregister(&self, customer_id: UserId, epoch: u64) {
        let command = HubCommand::Unregister { customer_id, epoch };
        if self.tx.send(command).is_err() {
            tracing::debug!(customer_id = %customer_id, "hub is gone, unregistration dropped");
        }
    }

    pub(crate) async fn is_registered(&self, customer_id: UserId) -> Result<bool, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::IsRegistered { customer_id, reply })
            .map_err(|_| HubError::Closed)?;

        rx.await.map_err(|_| HubError::Closed)
    }

    /// Pushes a receipt frame to the customer's socket and waits for the
    /// write to complete.
    pub(crate) async fn send_receipt(
        &self,
        customer_id: UserId,
        receipt: Offer,
    ) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::SendReceipt {
                customer_id,
                receipt,
                reply,
            })
            .map_err(|_| HubError::Closed)?;

        rx.await.map_err(|_| HubError::Closed)?
    }
}

struct Registration {
    epoch: u64,
    connection: Box<dyn ClientConnection>,
}

struct ConnectionRegistry {
    config: HubConfig,
    connections: HashMap<UserId, Registration>,
}

impl ConnectionRegistry {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        let mut keepalive = tokio::time::interval(self.config.ping_period());
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = keepalive.tick() => self.ping_all().await,
            }
        }

        tracing::debug!("connection registry stopped");
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                customer_id,
                epoch,
                connection,
            } => self.handle_register(customer_id, epoch, connection).await,
            HubCommand::Unregister { customer_id, epoch } => {
                let registered = self
                    .connections
                    .get(&customer_id)
                    .is_some_and(|r| r.epoch == epoch);
                if registered {
                    self.connections.remove(&customer_id);
                    tracing::debug!(customer_id = %customer_id, epoch, "customer disconnected");
                }
            }
            HubCommand::IsRegistered { customer_id, reply } => {
                let _ = reply.send(self.connections.contains_key(&customer_id));
            }
            HubCommand::SendReceipt {
                customer_id,
                receipt,
                reply,
            } => {
                let _ = reply.send(self.deliver(customer_id, &receipt).await);
            }
        }
    }

    async fn handle_register(
        &mut self,
        customer_id: UserId,
        epoch: u64,
        mut connection: Box<dyn ClientConnection>,
    ) {
        // The ack goes out on the new connection in every case; a client that
        // got its frame in is entitled to the confirmation even when the
        // connection itself is not kept.
        let ack = timeout(
            WRITE_TIMEOUT,
            connection.send_text(AUTH_SUCCESS_MESSAGE.to_string()),
        )
        .await;
        if !matches!(ack, Ok(Ok(()))) {
            tracing::debug!(customer_id = %customer_id, "ack write failed, connection dropped");
            return;
        }

        if self.connections.contains_key(&customer_id) {
            tracing::debug!(
                customer_id = %customer_id,
                "duplicate registration, keeping the existing connection"
            );
            return;
        }

        self.connections
            .insert(customer_id, Registration { epoch, connection });
        tracing::debug!(customer_id = %customer_id, epoch, "customer connected");
    }

    async fn deliver(&mut self, customer_id: UserId, receipt: &Offer) -> Result<(), HubError> {
        let Some(registration) = self.connections.get_mut(&customer_id) else {
            return Err(HubError::NotConnected);
        };

        let frame = serde_json::to_string(&ReceiptFrame { receipt })?;

        match timeout(WRITE_TIMEOUT, registration.connection.send_text(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(customer_id = %customer_id, error = %e, "receipt write failed");
                self.connections.remove(&customer_id);
                Err(HubError::SendFailed)
            }
            Err(_) => {
                tracing::warn!(customer_id = %customer_id, "receipt write timed out");
                self.connections.remove(&customer_id);
                Err(HubError::SendFailed)
            }
        }
    }

    async fn ping_all(&mut self) {
        let mut dead = Vec::new();
        for (customer_id, registration) in &mut self.connections {
            let outcome = timeout(WRITE_TIMEOUT, registration.connection.send_ping()).await;
            if !matches!(outcome, Ok(Ok(()))) {
                dead.push(*customer_id);
            }
        }

        for customer_id in dead {
            self.connections.remove(&customer_id);
            tracing::debug!(customer_id = %customer_id, "connection reaped, keepalive failed");
        }
    }
}
