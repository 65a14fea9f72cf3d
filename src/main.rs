//! Node relabeler entry point
//!
//! Compiles the `--relabel` rules, connects to the cluster, and runs the
//! reconciliation loop until a termination signal arrives.

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use node_relabeler::{cluster::KubeNodeDirectory, Reconciler, RuleSet};

/// Relabel cluster nodes according to a declarative rule set.
#[derive(Parser)]
#[command(name = "node-relabeler")]
#[command(about = "Relabel nodes according to a declarative rule set")]
#[command(version)]
struct Cli {
    /// Relabeling rules in the form old/label=value:new/label=newvalue
    #[arg(long = "relabel", value_name = "RULE")]
    relabel: Vec<String>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.directive().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rules = RuleSet::parse(&cli.relabel)?;
    info!("Starting node relabeler v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .context("failed to connect to the Kubernetes cluster")?;
    let mut directory = KubeNodeDirectory::new(client);

    let stop = CancellationToken::new();
    let sync_cancel = stop.child_token();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            let signal = shutdown_signal().await;
            info!(signal, "Received signal, exiting");
            stop.cancel();
        }
    });

    let reconciler = Reconciler::new(rules);
    reconciler.run(&mut directory, stop, sync_cancel).await?;
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives; returns the signal's name.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::error!(error = %err, "Failed to install SIGTERM handler");
            // Fall back to SIGINT only.
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}
