mod app;
mod chatbot;
mod config;
mod error;
mod export;
mod llm;
mod mailer;
mod prompting;
mod routes;
mod scheduler;
#[cfg(test)]
mod testing;
mod types;
mod whatsapp;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// HeyHey WhatsApp Business backend.
#[derive(Parser)]
#[command(name = "heyhey", version, about = "Multi-tenant WhatsApp Business API server")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run migrations and serve the HTTP API (default).
    Serve,
    /// Create the demo admin and client accounts.
    Seed,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},tower_http=info,sqlx=warn"))),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::from_env();
    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => app::run(config).await,
        Command::Seed => app::seed(config).await,
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}
