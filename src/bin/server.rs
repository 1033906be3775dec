use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use user_rpc::app;
use user_rpc::config::{Config, DEFAULT_CONFIG_PATH};

/// Serve the user.User RPC service.
#[derive(Parser, Debug)]
#[command(name = "user-rpc-server", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short = 'f', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    config.validate()?;

    app::run(config, CancellationToken::new()).await
}
