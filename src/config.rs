//! # Controller configuration
//!
//! Runtime knobs consumed by the reconciler. The bootstrap layer (CLI flags
//! in `main.rs`) builds one of these and threads it into the reconciler
//! constructor; nothing here is process-global.

use std::path::PathBuf;
use std::time::Duration;

/// Default interval at which every workspace is re-checked for drift
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default interval at which an individual workspace is polled
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default wall-clock deadline for a single terraform run
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Default requeue interval after a reconciliation error
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Default number of concurrently active reconciliations
pub const DEFAULT_MAX_RECONCILE_RATE: u16 = 1;

/// Default root under which per-workspace directories are created
pub const DEFAULT_WORKDIR_ROOT: &str = "/tf";

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often all workspaces are double checked for drift
    pub sync_interval: Duration,
    /// How often an individual workspace is requeued after success
    pub poll_interval: Duration,
    /// How long a terraform run may take before its process group is killed
    pub run_timeout: Duration,
    /// Requeue delay after a failed reconcile
    pub error_requeue: Duration,
    /// Maximum number of concurrently active reconciliations
    pub max_reconcile_rate: u16,
    /// Terraform binary to invoke
    pub terraform_binary: PathBuf,
    /// Root directory holding one subdirectory per workspace external name.
    /// Not guaranteed durable: losing it without a remote state backend
    /// loses the ability to manage existing infrastructure.
    pub workdir_root: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            error_requeue: DEFAULT_ERROR_REQUEUE,
            max_reconcile_rate: DEFAULT_MAX_RECONCILE_RATE,
            terraform_binary: PathBuf::from("terraform"),
            workdir_root: PathBuf::from(DEFAULT_WORKDIR_ROOT),
        }
    }
}
