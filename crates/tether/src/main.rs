use clap::Parser;
use eyre::Result;

use tether::cli::config::{CliConfig, load_env};
use tether::cli::{Cli, Commands};
use tether::commands::{Command, send::SendCommand, sessions::SessionCommand, show::ShowCommand};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    // Install color-eyre for better error reports
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load .env file if it exists
    load_env()?;

    let config = CliConfig::load(cli.config.as_deref())?.with_flags(&cli);

    // Logging stays off unless TETHER_LOG is set
    tether_core::utils::tracing::init_tracing(config.log_dir.as_deref())?;
    debug!(?config, "Resolved configuration");

    let setup = tether::open_local(&config).await?;
    let client = setup.client();

    let result = match cli.command {
        Commands::Send {
            session,
            show_reasoning,
            text,
        } => {
            SendCommand {
                session,
                text,
                show_reasoning,
            }
            .execute(&client)
            .await
        }
        Commands::Show { session, json } => {
            ShowCommand {
                session_id: session,
                json,
            }
            .execute(&client)
            .await
        }
        Commands::Sessions { command } => SessionCommand { command }.execute(&client).await,
    };

    setup.shutdown().await;
    result
}
