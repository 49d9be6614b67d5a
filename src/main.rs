use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logferry")]
#[command(about = "Telemetry agent running plugin pipelines", long_about = None)]
struct Cli {
    /// Agent config file (defaults to ~/.config/logferry/config.yml, then /etc/logferry)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every pipeline and run until Ctrl-C (the default)
    Run,
    /// Manage the agent config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Validate a pipeline document without running it
    Check { document: PathBuf },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config and a sample pipeline
    Init {
        /// Print the config instead of writing it
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logferry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = logferry::config::resolve_config_path(cli.config.as_deref());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => logferry::cli::run::run(config_path).await?,
        Commands::Config {
            action: ConfigAction::Init { stdout },
        } => logferry::cli::config::init(stdout)?,
        Commands::Check { document } => {
            if !logferry::cli::config::check(config_path, &document)? {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}
