//! # Error taxonomy
//!
//! Every failure mode of a workspace reconcile maps to one variant here, and
//! every variant carries enough context to be surfaced as a status condition
//! with the failing phase identified. None of these crash the controller
//! process; the error policy requeues and the condition tells the operator
//! what went wrong.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A module source or variable reference could not be resolved. This is
    /// a configuration problem: it is resurfaced every cycle rather than
    /// retried blindly, and the reconcile never reaches process execution.
    #[error("cannot resolve {what}: {reason}")]
    Resolution { what: String, reason: String },

    /// Another reconcile holds the workspace lock. Always transient unless
    /// the lock was stranded by a killed run.
    #[error("workspace {0} is locked by another reconcile")]
    Busy(String),

    /// A terraform run exceeded its deadline (or the controller shut down)
    /// and the whole process group was killed. The workspace lock may be
    /// left stranded; see [`crate::locks`].
    #[error("terraform {subcommand} was killed after exceeding its {timeout:?} deadline")]
    Killed {
        subcommand: String,
        timeout: Duration,
    },

    /// The terraform binary could not be started at all. Fatal until an
    /// operator fixes the deployment.
    #[error("cannot spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// `terraform output -json` produced something unparseable. Does not
    /// roll back an already-successful apply.
    #[error("cannot parse terraform outputs: {0}")]
    Parse(String),

    /// `terraform plan` exited non-zero with a code other than the
    /// detailed-exitcode drift signal.
    #[error("terraform plan failed (exit {code}): {stderr}")]
    Plan { code: i32, stderr: String },

    /// `terraform apply` exited non-zero. Surfaced verbatim and requeued.
    #[error("terraform apply failed (exit {code}): {stderr}")]
    Apply { code: i32, stderr: String },

    /// `terraform destroy` exited non-zero. Blocks deletion until destroy
    /// eventually succeeds, so no infrastructure is silently orphaned.
    #[error("terraform destroy failed (exit {code}): {stderr}")]
    Destroy { code: i32, stderr: String },

    /// Filesystem trouble in the workspace directory
    #[error("workspace directory i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Kubernetes API errors other than missing references
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

impl WorkspaceError {
    /// Short phase identifier used as the condition reason
    pub fn phase(&self) -> &'static str {
        match self {
            WorkspaceError::Resolution { .. } => "ResolutionFailed",
            WorkspaceError::Busy(_) => "WorkspaceBusy",
            WorkspaceError::Killed { .. } => "RunKilled",
            WorkspaceError::Spawn { .. } => "SpawnFailed",
            WorkspaceError::Parse(_) => "OutputParseFailed",
            WorkspaceError::Plan { .. } => "PlanFailed",
            WorkspaceError::Apply { .. } => "ApplyFailed",
            WorkspaceError::Destroy { .. } => "DestroyFailed",
            WorkspaceError::Io(_) => "IoFailed",
            WorkspaceError::Kube(_) => "KubeApiFailed",
        }
    }

    /// Shorthand for a resolution failure
    pub fn resolution(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        WorkspaceError::Resolution {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_identify_the_failing_step() {
        let err = WorkspaceError::resolution("varFile secret default/tfvars", "not found");
        assert_eq!(err.phase(), "ResolutionFailed");

        let err = WorkspaceError::Apply {
            code: 1,
            stderr: "provider error".to_string(),
        };
        assert_eq!(err.phase(), "ApplyFailed");

        let err = WorkspaceError::Busy("ws-a".to_string());
        assert_eq!(err.phase(), "WorkspaceBusy");
    }

    #[test]
    fn killed_reports_subcommand_and_deadline() {
        let err = WorkspaceError::Killed {
            subcommand: "apply".to_string(),
            timeout: Duration::from_secs(1200),
        };
        let msg = err.to_string();
        assert!(msg.contains("apply"), "message should name the subcommand: {msg}");
        assert!(msg.contains("1200"), "message should carry the deadline: {msg}");
    }
}
