//! rollgatectl - command line companion to the rollgate controller

use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::{Api, Client};
use rollgate::cli::{lint, restart, server};
use rollgate::crd::rollout::Rollout;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Inspect and operate rollgate rollouts.
#[derive(Debug, Parser)]
#[command(name = "rollgatectl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate rollouts in a manifest file against the resources it references.
    Lint {
        /// Manifest file (multi-document YAML).
        #[arg(short, long)]
        filename: PathBuf,
    },

    /// Restart the pods of a rollout.
    Restart {
        /// Rollout name.
        rollout: String,

        /// Delay before the restart, e.g. 30s or 5m.
        #[arg(short = 'i', long = "in", default_value = restart::DEFAULT_DELAY)]
        delay: String,

        /// Namespace of the rollout (defaults to the kubeconfig namespace).
        #[arg(short, long, env = "ROLLGATE_NAMESPACE")]
        namespace: Option<String>,
    },

    /// Serve a read-only rollouts API.
    Server {
        #[arg(long, default_value_t = server::DEFAULT_PORT)]
        port: u16,

        /// Namespace to list rollouts from (defaults to the kubeconfig namespace).
        #[arg(short, long, env = "ROLLGATE_NAMESPACE")]
        namespace: Option<String>,
    },
}

impl Cli {
    async fn run(self) -> Result<()> {
        match self.command {
            Commands::Lint { filename } => {
                let errors = lint::lint_file(&filename)?;
                for error in &errors {
                    println!("{}", error);
                }
                lint::outcome(&filename, &errors)?;
                Ok(())
            }
            Commands::Restart {
                rollout,
                delay,
                namespace,
            } => {
                let api = rollouts(namespace).await?;
                let message =
                    restart::restart_rollout(&api, &rollout, &delay, chrono::Utc::now()).await?;
                println!("{}", message);
                Ok(())
            }
            Commands::Server { port, namespace } => {
                let api = rollouts(namespace).await?;
                server::run_forever(port, Arc::new(server::KubeRolloutSource::new(api))).await;
                Ok(())
            }
        }
    }
}

async fn rollouts(namespace: Option<String>) -> Result<Api<Rollout>> {
    let client = Client::try_default().await?;
    Ok(match namespace {
        Some(ns) => Api::namespaced(client, &ns),
        None => Api::default_namespaced(client),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli.run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
