//! infergate - Load-balancing proxy for OpenAI-compatible inference backends
//!
//! Spreads chat-completion traffic over several backends by load, health,
//! and latency, retrying on another backend when one fails before the
//! caller has seen any output.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infergate::config::Config;

#[derive(Parser)]
#[command(name = "infergate")]
#[command(about = "Load-balancing proxy for OpenAI-compatible inference backends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Show configured backends and how their keys were resolved
    Backends {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("infergate={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut loaded, key_sources) = Config::from_file_with_env(&config)?;
            init_tracing(&loaded.logging.level);
            tracing::info!(config = %config.display(), "Loaded configuration");

            for (id, source) in &key_sources {
                tracing::debug!(backend = %id, key_source = %source, "Resolved backend key");
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                loaded.server.listen = addr;
            }

            infergate::proxy::run_server(loaded, Some(config)).await
        }

        Commands::Check { config } => {
            init_tracing("info");
            let (loaded, _) = Config::from_file_with_env(&config)?;
            println!(
                "{}: OK ({} backends, listen {})",
                config.display(),
                loaded.backends.len(),
                loaded.server.listen
            );
            Ok(())
        }

        Commands::Backends { config } => {
            init_tracing("warn");
            let (loaded, key_sources) = Config::from_file_with_env(&config)?;
            for backend in &loaded.backends {
                let source = key_sources
                    .iter()
                    .find(|(id, _)| id == &backend.id)
                    .map(|(_, source)| source.to_string())
                    .unwrap_or_else(|| "none".to_string());
                let key = backend
                    .api_key
                    .as_ref()
                    .map(|k| k.masked())
                    .unwrap_or_else(|| "-".to_string());
                let limit = backend
                    .rate_limit
                    .map(|r| format!("{}/min", r))
                    .unwrap_or_else(|| "unlimited".to_string());
                println!("{}", backend.id);
                println!("  url:        {}", backend.url);
                println!("  models:     {}", backend.models.join(", "));
                for (public, local) in &backend.model_map {
                    println!("  model_map:  {} -> {}", public, local);
                }
                println!("  key:        {} ({})", key, source);
                println!("  rate_limit: {}", limit);
            }
            Ok(())
        }
    }
}
