//! netcontour - Knative ingress controller for Contour

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use netcontour_common::config::{DEFAULT_CLUSTER_DOMAIN, DEFAULT_SYSTEM_NAMESPACE};
use netcontour_common::crd::{HttpProxy, Ingress};
use netcontour_common::telemetry::{init_telemetry, LogFormat};
use netcontour_common::{ConfigStore, ContourConfig};
use netcontour_operator::controller_runner::{build_controllers, load_config};

/// netcontour - programs Contour HTTPProxies from Knative Ingresses
#[derive(Parser, Debug)]
#[command(name = "netcontour", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace holding config-contour and config-network
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    system_namespace: String,

    /// Cluster DNS domain
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    cluster_domain: String,

    /// Log output format: json or plain
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let ingress = serde_yaml::to_string(&Ingress::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Ingress CRD: {}", e))?;
        let proxy = serde_yaml::to_string(&HttpProxy::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize HTTPProxy CRD: {}", e))?;
        println!("{ingress}---\n{proxy}");
        return Ok(());
    }

    init_telemetry(cli.log_format)?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli).await,
    }
}

async fn run_controller(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!(
        system_namespace = %cli.system_namespace,
        cluster_domain = %cli.cluster_domain,
        "netcontour controller starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config = Arc::new(ConfigStore::new(ContourConfig::for_cluster(
        cli.cluster_domain.clone(),
        cli.system_namespace.clone(),
    )));
    let config_maps = Api::namespaced(client.clone(), &cli.system_namespace);
    load_config(&config_maps, &config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load controller config: {}", e))?;

    let controllers = build_controllers(client, config_maps, config);
    tracing::info!(count = controllers.len(), "controllers running");

    // The config watcher never ends on its own; stop once the controller does
    futures::future::select_all(controllers).await;
    tracing::info!("netcontour controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_knative_install() {
        let cli = Cli::try_parse_from(["netcontour"]).unwrap();
        assert!(!cli.crd);
        assert_eq!(cli.system_namespace, "knative-serving");
        assert_eq!(cli.cluster_domain, "cluster.local");
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.command.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "netcontour",
            "--system-namespace",
            "serving",
            "--cluster-domain",
            "corp.internal",
            "--log-format",
            "plain",
            "controller",
        ])
        .unwrap();
        assert_eq!(cli.system_namespace, "serving");
        assert_eq!(cli.cluster_domain, "corp.internal");
        assert_eq!(cli.log_format, LogFormat::Plain);
        assert!(matches!(cli.command, Some(Commands::Controller)));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["netcontour", "--log-format", "xml"]).is_err());
    }
}
