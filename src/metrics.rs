//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `terraform_workspace_reconciliations_total` - Total number of reconciliations
//! - `terraform_workspace_reconciliation_errors_total` - Total number of reconciliation errors
//! - `terraform_workspace_reconciliation_duration_seconds` - Duration of reconciliation operations
//! - `terraform_workspace_runs_total` - Terraform runs by subcommand and result
//! - `terraform_workspace_run_duration_seconds` - Duration of terraform runs by subcommand

use anyhow::Result;
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;
use std::time::Duration;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "terraform_workspace_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "terraform_workspace_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "terraform_workspace_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1200.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static TERRAFORM_RUNS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "terraform_workspace_runs_total",
            "Terraform runs by subcommand and result",
        ),
        &["subcommand", "result"],
    )
    .expect("Failed to create TERRAFORM_RUNS_TOTAL metric - this should never happen")
});

static TERRAFORM_RUN_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "terraform_workspace_run_duration_seconds",
            "Duration of terraform runs in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1200.0]),
        &["subcommand"],
    )
    .expect("Failed to create TERRAFORM_RUN_DURATION metric - this should never happen")
});

/// Register all metrics with the controller registry. Call once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(TERRAFORM_RUNS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TERRAFORM_RUN_DURATION.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(seconds: f64) {
    RECONCILIATION_DURATION.observe(seconds);
}

pub fn observe_terraform_run(subcommand: &str, elapsed: Duration, success: bool) {
    let result = if success { "success" } else { "failure" };
    TERRAFORM_RUNS_TOTAL
        .with_label_values(&[subcommand, result])
        .inc();
    TERRAFORM_RUN_DURATION
        .with_label_values(&[subcommand])
        .observe(elapsed.as_secs_f64());
}
