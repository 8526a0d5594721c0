use clap::Parser;
use perkd::config::{Env, setup_tracing};
use perkd::launch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Env::parse().into_config();
    setup_tracing(&config.log_level);

    launch(config).await
}
