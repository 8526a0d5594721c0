//! Discount-redemption platform. Customers subscribe to plans, connect over a
//! WebSocket, and partners redeem discounted offers against them; every
//! successful redemption is pushed back to the customer in real time.

use rocket::{Build, Ignite, Rocket};
use sqlx::SqlitePool;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{error, info, info_span};

mod account;
mod api;
mod auth;
pub mod config;
mod entitlement;
mod error;
mod hub;
mod offer;
mod redemption;
mod subscription;

#[cfg(test)]
pub(crate) mod test_utils;

use crate::config::Config;
use crate::hub::Hub;
use crate::redemption::RedemptionService;

/// Runs migrations, starts the connection registry and serves HTTP and
/// WebSocket traffic until ctrl-c or a task failure.
pub async fn launch(config: Config) -> anyhow::Result<()> {
    let launch_span = info_span!("launch");
    let _enter = launch_span.enter();

    let pool = config.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let (hub, hub_task) = Hub::spawn(config.hub_config());
    let server_task = spawn_server_task(&config, &pool, hub);

    await_shutdown(server_task, hub_task).await;

    info!("Shutdown complete");
    Ok(())
}

fn spawn_server_task(
    config: &Config,
    pool: &SqlitePool,
    hub: Hub,
) -> JoinHandle<Result<Rocket<Ignite>, rocket::Error>> {
    let figment = rocket::Config::figment()
        .merge(("port", config.server_port))
        .merge(("address", "0.0.0.0"));

    tokio::spawn(build_rocket(pool.clone(), hub).configure(figment).launch())
}

fn build_rocket(pool: SqlitePool, hub: Hub) -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .mount("/", hub::socket::routes())
        .register("/", api::catchers())
        .manage(RedemptionService::new(pool.clone(), hub.clone()))
        .manage(pool)
        .manage(hub)
}

async fn await_shutdown(
    server_task: JoinHandle<Result<Rocket<Ignite>, rocket::Error>>,
    hub_task: JoinHandle<()>,
) {
    let server_abort = server_task.abort_handle();
    let hub_abort = hub_task.abort_handle();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
            abort_task("server", &server_abort);
            abort_task("hub", &hub_abort);
        }
        result = server_task => {
            log_server_result(result);
            abort_task("hub", &hub_abort);
        }
        result = hub_task => {
            log_hub_result(result);
            abort_task("server", &server_abort);
        }
    }
}

fn abort_task(name: &str, handle: &AbortHandle) {
    info!("Aborting {name} task");
    handle.abort();
}

fn log_server_result(result: Result<Result<Rocket<Ignite>, rocket::Error>, JoinError>) {
    match result {
        Ok(Ok(_)) => info!("Server completed successfully"),
        Ok(Err(e)) => error!("Server failed: {e}"),
        Err(e) => error!("Server task panicked: {e}"),
    }
}

fn log_hub_result(result: Result<(), JoinError>) {
    match result {
        Ok(()) => info!("Hub task completed"),
        Err(e) => error!("Hub task panicked: {e}"),
    }
}
