#![cfg_attr(not(test), forbid(unsafe_code))]

//! Main entry point for the `TokenRelay` CLI.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;
use std::path::PathBuf;

/// Main CLI structure for `TokenRelay`
#[derive(Parser)]
#[command(name = "tokenrelay")]
#[command(about = "Token streaming delivery engine, ingest bridge and origin proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the SSE delivery server
    Serve {
        #[arg(
            long,
            short,
            help = "The port number to bind the server to (e.g., 8080). Overrides the configuration file."
        )]
        port: Option<u16>,

        #[arg(
            long,
            short,
            help = "Path to the configuration file (e.g., config.yaml or config.json). If not provided, defaults will be used."
        )]
        config: Option<PathBuf>,
    },
    /// Drain the token source onto the fan-out bus
    Bridge {
        #[arg(long, short, help = "Path to the configuration file.")]
        config: Option<PathBuf>,
    },
    /// Proxy prompts to the inference engine and publish its tokens
    Origin {
        #[arg(long, short, help = "The port number to bind the origin proxy to.")]
        port: Option<u16>,

        #[arg(long, short, help = "Path to the configuration file.")]
        config: Option<PathBuf>,
    },
}

fn load(config: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<Config> {
    Config::load_config(config, port).context("failed to load configuration")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => server::server::run_serve(load(config, port)?).await,
        Commands::Bridge { config } => server::server::run_bridge(load(config, None)?).await,
        Commands::Origin { port, config } => {
            server::server::run_origin(load(config, port)?).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_accepts_port_and_config() {
        let cli = Cli::parse_from(["tokenrelay", "serve", "--port", "9090", "-c", "relay.yaml"]);
        match cli.command {
            Commands::Serve { port, config } => {
                assert_eq!(port, Some(9090));
                assert_eq!(config, Some(PathBuf::from("relay.yaml")));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn bridge_and_origin_parse_without_arguments() {
        assert!(matches!(
            Cli::parse_from(["tokenrelay", "bridge"]).command,
            Commands::Bridge { config: None }
        ));
        assert!(matches!(
            Cli::parse_from(["tokenrelay", "origin"]).command,
            Commands::Origin {
                port: None,
                config: None
            }
        ));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["tokenrelay"]).is_err());
    }
}
