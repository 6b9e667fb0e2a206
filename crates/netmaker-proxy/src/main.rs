//! Netmaker Kubernetes proxy binary

use clap::{Parser, Subcommand};
use netmaker_common::telemetry::{init_telemetry, TelemetryConfig};
use netmaker_common::{shutdown_token, OsEnv};
use netmaker_proxy::credentials::CredentialSource;
use netmaker_proxy::interface::InterfaceLocator;
use netmaker_proxy::{runner, Settings};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "netmaker-k8s-proxy", version, about = "Kubernetes API proxy for Netmaker overlay networks")]
struct Cli {
    /// Use in-cluster service account credentials (detected from the pod environment when unset)
    #[arg(long, env = "IN_CLUSTER")]
    in_cluster: Option<bool>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy and management API (default)
    Run,
    /// Wait for the overlay interface and print its IPv4 address
    Locate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(TelemetryConfig::default())?;

    let settings = Settings::from_env(&OsEnv)?;
    let cancel = shutdown_token();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let source = CredentialSource::select(cli.in_cluster, &OsEnv, settings.kubeconfig.clone())?;
            if let Err(e) = runner::run(settings, source, cancel).await {
                error!(error = %e, "Proxy exited with error");
                return Err(e.into());
            }
        }
        Commands::Locate => {
            let locator = InterfaceLocator::new(settings.interface.backoff.clone());
            match locator.locate(&settings.interface.name, &cancel).await {
                Some(addr) => println!("{addr}"),
                None => std::process::exit(1),
            }
        }
    }

    Ok(())
}
