use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use preview_slots::build::BuildMachine;
use preview_slots::cluster::{ClusterApi, KubeCluster};
use preview_slots::config::Config;
use preview_slots::cycle::CycleRunner;
use preview_slots::github::OrgClient;
use preview_slots::notify::Notifier;
use preview_slots::scheduler::SlotScheduler;

/// Secret consulted for the GitHub token when `GITHUB_TOKEN` is unset.
const GITHUB_TOKEN_SECRET: &str = "github-token";

/// Assigns open pull requests to preview deployment slots and rebuilds them.
#[derive(Debug, Parser)]
#[command(name = "preview-slots", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Service account the privileged pipeline tasks run under.
    #[arg(long, default_value = "pipeline")]
    privileged_service_account: String,

    /// Service account the unprivileged preparation task runs under.
    #[arg(long, default_value = "preview-builder")]
    unprivileged_service_account: String,

    /// Seconds between scheduling cycles.
    #[arg(long, default_value_t = 300)]
    interval_secs: u64,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let default_filter = if config.debug {
        "preview_slots=debug"
    } else {
        "preview_slots=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        config = %cli.config.display(),
        repositories = config.repositories.len(),
        namespace = %config.namespace,
        org = %config.github_org,
        "Loaded configuration"
    );

    let cluster = Arc::new(KubeCluster::from_default_config().await?);
    let token = github_token(&cluster, &config.namespace).await?;
    let source = Arc::new(OrgClient::from_token(token, &config.github_org)?);

    let machine = BuildMachine::new(
        Arc::clone(&cluster),
        &config.namespace,
        cli.privileged_service_account,
        cli.unprivileged_service_account,
    );
    let notifier = Notifier::new(Arc::clone(&source), &config.github_org);
    let scheduler = SlotScheduler::new(machine, notifier, &config.preview_domain);
    let cycle = CycleRunner::new(
        cluster,
        source,
        scheduler,
        config.repositories.clone(),
        &config.namespace,
        &config.bot_login,
    );

    if cli.once {
        cycle.run_cycle().await?;
    } else {
        cycle.run_forever(Duration::from_secs(cli.interval_secs)).await;
    }
    Ok(())
}

/// Resolves the GitHub token from the environment, falling back to the
/// namespace's token secret.
async fn github_token(
    cluster: &KubeCluster,
    namespace: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        return Ok(token);
    }
    let mut secret = cluster.read_secret(namespace, GITHUB_TOKEN_SECRET).await?;
    secret.remove("token").ok_or_else(|| {
        format!("secret {GITHUB_TOKEN_SECRET} has no `token` key and GITHUB_TOKEN is unset").into()
    })
}
