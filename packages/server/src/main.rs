// ABOUTME: coderun binary entry point
// ABOUTME: Serves the execution API, lists languages or pre-pulls language images

use clap::{Parser, Subcommand};
use coderun_sandbox::ImagePreparer;
use coderun_server::config::Config;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "coderun")]
#[command(about = "Run untrusted code in sandboxed containers and stream its output")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server (default)
    Serve {
        /// Override PORT from the environment
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the configured language catalog
    Languages,
    /// Verify and pull every language image, then exit
    PullImages,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    coderun_server::init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            coderun_server::run_server(config).await
        }
        Commands::Languages => {
            let registry = config.load_registry()?;
            for profile in registry.profiles() {
                let steps = if profile.has_compile_step() {
                    "compile + run"
                } else {
                    "run"
                };
                println!(
                    "{:<10} {:<28} {:<12} {}",
                    profile.id, profile.image, profile.source_file, steps
                );
            }
            Ok(())
        }
        Commands::PullImages => {
            let registry = Arc::new(config.load_registry()?);
            let provider = coderun_server::docker_provider(&config)?;
            ImagePreparer::new(provider, registry).prepare().await?;
            println!("All language images are ready");
            Ok(())
        }
    }
}
