use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "promptreel")]
#[command(version, about = "Prompt-to-animation studio server")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = promptreel::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Dev mode: permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// Validate a scene file without rendering it
    Validate {
        /// Python source file to check
        file: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = promptreel::config::StudioToml::resolve(&cli.config)?;
    let telemetry = promptreel::telemetry::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve { host, port, db_path, dev } => {
            cmd::cmd_serve(config, cmd::ServeOverrides { host, port, db_path, dev }).await?;
        }
        Commands::Validate { file } => {
            let valid = cmd::cmd_validate(&config, &file).await?;
            if !valid {
                drop(telemetry);
                std::process::exit(1);
            }
        }
        Commands::Config => {
            cmd::cmd_config(&cli.config, &config)?;
        }
    }

    Ok(())
}
