use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use text_relay::{
    cli::{Cli, Command},
    client,
    config::ServerConfig,
    server::RelayServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = RelayServer::bind(ServerConfig::from(&args))
                .await
                .context("couldn't start the relay server")?;
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err.into());
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
