//! # Terraform Workspace Controller
//!
//! A Kubernetes controller that reconciles `Workspace` resources by driving
//! the Terraform CLI against per-workspace working directories.
//!
//! ## Overview
//!
//! This controller provides declarative Terraform management by:
//!
//! 1. **Watching Workspaces** - Monitors `Workspace` resources across all namespaces
//! 2. **Materializing modules** - Writes inline HCL or fetches remote modules
//!    into one working directory per workspace external name
//! 3. **Driving terraform** - Runs `init`/`plan`/`apply`/`destroy` with
//!    per-run deadlines and process-group cleanup
//! 4. **Surfacing outputs** - Writes every output to the connection secret
//!    and mirrors non-sensitive ones into resource status
//!
//! ## Usage
//!
//! See the [README.md](../README.md) for detailed usage instructions and examples.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use kube::{Api, Client};
use kube_runtime::{controller, watcher, Controller};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use terraform_workspace_controller::config::ControllerConfig;
use terraform_workspace_controller::reconciler::{self, Reconciler};
use terraform_workspace_controller::server::{start_server, ServerState};
use terraform_workspace_controller::{metrics, Workspace};

/// Terraform support for Kubernetes workspaces
#[derive(Debug, Parser)]
#[command(name = "terraform-workspace-controller", version)]
struct Args {
    /// Run with debug logging
    #[arg(short, long)]
    debug: bool,

    /// How often all workspaces will be re-queued for drift detection,
    /// in seconds
    #[arg(long = "sync", default_value_t = 3600)]
    sync_interval_secs: u64,

    /// How often an individual workspace should be checked for drift,
    /// in seconds
    #[arg(long = "poll", default_value_t = 600)]
    poll_interval_secs: u64,

    /// How long a terraform process may run before it is killed, in seconds
    #[arg(long = "timeout", default_value_t = 1200)]
    run_timeout_secs: u64,

    /// The maximum number of concurrent reconciliation operations
    #[arg(long = "max-reconcile-rate", default_value_t = 1)]
    max_reconcile_rate: u16,

    /// Terraform binary to execute
    #[arg(long = "terraform-binary", default_value = "terraform")]
    terraform_binary: PathBuf,

    /// Root directory holding one working directory per workspace
    #[arg(long = "workdir", default_value = "/tf")]
    workdir_root: PathBuf,

    /// HTTP port for metrics and probes
    #[arg(long = "metrics-port", default_value_t = 8080)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "terraform_workspace_controller=debug"
    } else {
        "terraform_workspace_controller=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("BUILD_GIT_HASH"),
        "starting terraform workspace controller"
    );

    // Fail fast when the binary is missing rather than on the first
    // reconcile, where it would only surface as a per-resource SpawnFailed.
    let terraform_binary = which::which(&args.terraform_binary).with_context(|| {
        format!(
            "terraform binary {} not found",
            args.terraform_binary.display()
        )
    })?;
    info!(binary = %terraform_binary.display(), "resolved terraform binary");

    let config = ControllerConfig {
        sync_interval: Duration::from_secs(args.sync_interval_secs),
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        run_timeout: Duration::from_secs(args.run_timeout_secs),
        max_reconcile_rate: args.max_reconcile_rate,
        terraform_binary,
        workdir_root: args.workdir_root,
        ..ControllerConfig::default()
    };
    tokio::fs::create_dir_all(&config.workdir_root)
        .await
        .with_context(|| {
            format!(
                "cannot create workdir root {}",
                config.workdir_root.display()
            )
        })?;

    metrics::register_metrics()?;

    let server_state = ServerState::new();
    let probe_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = start_server(args.metrics_port, probe_state).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    // Watch Workspace resources across all namespaces.
    let workspaces: Api<Workspace> = Api::all(client.clone());
    let ctx = Arc::new(Reconciler::new(client, config.clone()));

    server_state.mark_ready();

    // Periodic resync: every workspace is re-queued at the sync interval
    // even when no watch event arrived, so drift is eventually noticed.
    let mut resync = tokio::time::interval(config.sync_interval);
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let resync_stream = futures::stream::poll_fn(move |cx| resync.poll_tick(cx).map(|_| Some(())));

    Controller::new(workspaces, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.max_reconcile_rate))
        .reconcile_all_on(resync_stream)
        .shutdown_on_signal()
        .run(Reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|_| std::future::ready(()))
        .await;

    info!("controller stopped");

    Ok(())
}
