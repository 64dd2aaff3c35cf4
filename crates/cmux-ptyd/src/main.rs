use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cmux_ptyd::{run, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::parse();
    config.validate()?;
    config.log_startup();

    run(config).await
}
