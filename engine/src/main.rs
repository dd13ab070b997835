// Atrium assistant runtime
// Main entry point for the atrium binary

use atrium_engine::cli::{Cli, Command, ConfigAction};
use atrium_engine::config::Config;
use atrium_engine::handlers::{
    handle_chat, handle_config_show, handle_list, handle_show, OutputFormat,
};
use atrium_engine::telemetry::{init_telemetry, init_telemetry_with_level};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize basic telemetry first (before config is loaded)
    init_telemetry();

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Atrium v{} ({} - {})", version, commit, timestamp);

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    match cli.command {
        Command::List { tag } => handle_list(tag, &config, format).await,

        Command::Show { id } => handle_show(id, &config, format).await,

        Command::Chat {
            id,
            message,
            chat,
            no_search,
        } => {
            tracing::info!("Chatting with '{}'", id);
            handle_chat(id, message, chat, no_search, &config, format).await
        }

        Command::Config { action } => match action {
            ConfigAction::Show => handle_config_show(&config, format),
        },
    }
}
