//! Air node binary.

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use air_node::cli::{Cli, Command, ConfigCommand, DiscoveryCommand, LockCommand};
use air_node::commands::{self, Context};
use air_node::env::EnvVars;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Set up logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let env = cli.env_vars(EnvVars::from_process());
    let ctx = Context::new(cli.paths(&env), env);

    match cli.command() {
        Command::Start => {
            tracing::info!("Air v{}", env!("CARGO_PKG_VERSION"));
            commands::start(&ctx).await?;
        }
        Command::Connect { peers } => commands::connect(&ctx, peers).await?,
        Command::Auto => {
            tracing::info!("Air v{}", env!("CARGO_PKG_VERSION"));
            commands::auto(&ctx).await?;
        }
        Command::Status => print(&commands::status(&ctx).await)?,
        Command::Config { action } => match action {
            ConfigCommand::Show => print(&commands::config_show(&ctx).await)?,
            ConfigCommand::Reset => print(&commands::config_reset(&ctx).await?)?,
        },
        Command::Discovery { action } => match action {
            DiscoveryCommand::Status => print(&commands::discovery_status(&ctx).await)?,
            DiscoveryCommand::Start => print(&commands::discovery_start(&ctx).await)?,
            DiscoveryCommand::Add { addr } => {
                if commands::discovery_add(&ctx, &addr).await? {
                    println!("Added peer {}", addr);
                } else {
                    println!("Peer {} already known", addr);
                }
            }
        },
        Command::Lock { action } => match action {
            LockCommand::Clean => print(&commands::lock_clean(&ctx)?)?,
        },
    }

    Ok(())
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
