//! # Terraform CLI integration
//!
//! Executes the terraform binary as a child process rooted at a workspace
//! directory and parses its machine-readable output.
//!
//! Every run is bounded by a hard wall-clock deadline. Terraform spawns
//! helper processes (providers, provisioners), so on expiry the whole
//! process group is killed, not just the top-level child. Controller
//! shutdown takes the same path: a guard held across the run delivers the
//! same group kill when a cancelled reconcile future is dropped mid-run.
//!
//! Captured stdout is the sole channel for structured output parsing;
//! stderr is diagnostic only and never drives control decisions.

use crate::error::WorkspaceError;
use crate::metrics;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// One extracted terraform output value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub value: String,
    pub sensitive: bool,
}

/// Raw entry shape of `terraform output -json`
#[derive(Debug, Deserialize)]
struct RawOutput {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

/// Captured result of a completed terraform run
#[derive(Debug)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Handle on the terraform binary, bound to a per-run deadline.
///
/// No internal retry: a single invocation either completes, times out, or
/// fails to spawn. Retry policy belongs to the reconcile scheduler.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: PathBuf,
    timeout: Duration,
}

impl TerraformCli {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// `terraform init -input=false`, refreshing providers and modules
    pub async fn init(&self, dir: &Path) -> Result<(), WorkspaceError> {
        let run = self.run(dir, "init", &["-input=false".to_string()]).await?;
        if run.success() {
            Ok(())
        } else {
            Err(WorkspaceError::resolution(
                "module initialization",
                run.stderr.trim(),
            ))
        }
    }

    /// `terraform init -from-module=<reference>`, fetching a remote module
    /// (archive, VCS, or registry reference) into the workspace directory
    pub async fn init_from_module(
        &self,
        dir: &Path,
        reference: &str,
    ) -> Result<(), WorkspaceError> {
        let args = vec![
            "-input=false".to_string(),
            format!("-from-module={reference}"),
        ];
        let run = self.run(dir, "init", &args).await?;
        if run.success() {
            Ok(())
        } else {
            Err(WorkspaceError::resolution(
                format!("remote module {reference}"),
                run.stderr.trim(),
            ))
        }
    }

    /// Non-mutating drift check via `terraform plan -detailed-exitcode`.
    /// Exit 0 means in sync, exit 2 means the plan found changes.
    pub async fn plan_has_drift(
        &self,
        dir: &Path,
        vars: &[(String, String)],
    ) -> Result<bool, WorkspaceError> {
        let mut args = vec![
            "-input=false".to_string(),
            "-detailed-exitcode".to_string(),
        ];
        args.extend(var_args(vars));
        let run = self.run(dir, "plan", &args).await?;
        match run.code {
            0 => Ok(false),
            2 => Ok(true),
            code => Err(WorkspaceError::Plan {
                code,
                stderr: run.stderr.trim().to_string(),
            }),
        }
    }

    /// `terraform apply -auto-approve` with the resolved variables
    pub async fn apply(
        &self,
        dir: &Path,
        vars: &[(String, String)],
    ) -> Result<(), WorkspaceError> {
        let mut args = vec!["-auto-approve".to_string(), "-input=false".to_string()];
        args.extend(var_args(vars));
        let run = self.run(dir, "apply", &args).await?;
        if run.success() {
            Ok(())
        } else {
            Err(WorkspaceError::Apply {
                code: run.code,
                stderr: run.stderr.trim().to_string(),
            })
        }
    }

    /// `terraform destroy -auto-approve` with the resolved variables
    pub async fn destroy(
        &self,
        dir: &Path,
        vars: &[(String, String)],
    ) -> Result<(), WorkspaceError> {
        let mut args = vec!["-auto-approve".to_string(), "-input=false".to_string()];
        args.extend(var_args(vars));
        let run = self.run(dir, "destroy", &args).await?;
        if run.success() {
            Ok(())
        } else {
            Err(WorkspaceError::Destroy {
                code: run.code,
                stderr: run.stderr.trim().to_string(),
            })
        }
    }

    /// `terraform output -json`, parsed into named values
    pub async fn outputs(&self, dir: &Path) -> Result<BTreeMap<String, Output>, WorkspaceError> {
        let run = self.run(dir, "output", &["-json".to_string()]).await?;
        if !run.success() {
            return Err(WorkspaceError::Parse(run.stderr.trim().to_string()));
        }
        parse_outputs(&run.stdout)
    }

    /// Spawn `terraform <subcommand> <args>` in `dir` and wait for it under
    /// the configured deadline. A non-zero exit is reported in the returned
    /// [`RunOutput`]; only spawn failures and kills are errors here.
    pub async fn run(
        &self,
        dir: &Path,
        subcommand: &str,
        args: &[String],
    ) -> Result<RunOutput, WorkspaceError> {
        let start = Instant::now();
        debug!(
            binary = %self.binary.display(),
            subcommand,
            dir = %dir.display(),
            "running terraform"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.arg(subcommand)
            .args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Run in its own process group so that deadline expiry can take out
        // provider plugins and other grandchildren as well.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| WorkspaceError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                group.disarm();
                output
            }
            Ok(Err(source)) => return Err(WorkspaceError::Io(source)),
            Err(_elapsed) => {
                // The guard kills the group on the way out.
                warn!(
                    subcommand,
                    timeout = ?self.timeout,
                    "terraform run exceeded its deadline, process group killed"
                );
                metrics::observe_terraform_run(subcommand, start.elapsed(), false);
                return Err(WorkspaceError::Killed {
                    subcommand: subcommand.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        let run = RunOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            subcommand,
            code = run.code,
            elapsed = ?start.elapsed(),
            "terraform run finished"
        );
        metrics::observe_terraform_run(subcommand, start.elapsed(), run.success());
        Ok(run)
    }
}

/// Kills the whole process group on drop unless disarmed after a normal
/// completion. Deadline expiry and a dropped reconcile future (controller
/// shutdown cancelling the run mid-flight) both pass through here, so every
/// abnormal exit takes the same group-kill path.
#[derive(Debug)]
struct ProcessGroupGuard {
    pid: Option<u32>,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Some(pid) = self.pid {
                kill_process_group(pid);
            }
        }
    }
}

/// Kill the entire process group rooted at `pid`. The dropped child future
/// already delivers SIGKILL to the immediate child; this sweeps up helper
/// processes terraform forked underneath it.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(-(pid as i32));
    if let Err(e) = kill(pgid, Signal::SIGKILL) {
        warn!(pid, error = %e, "failed to kill terraform process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Repeated `-var key=value` arguments in declaration order
pub fn var_args(vars: &[(String, String)]) -> Vec<String> {
    let mut args = Vec::with_capacity(vars.len() * 2);
    for (key, value) in vars {
        args.push("-var".to_string());
        args.push(format!("{key}={value}"));
    }
    args
}

/// Parse the JSON report of `terraform output -json` into named outputs.
///
/// Non-string values keep their JSON text form. An empty or malformed
/// report is a [`WorkspaceError::Parse`]; the caller decides how much that
/// matters (it never rolls back an apply).
pub fn parse_outputs(stdout: &str) -> Result<BTreeMap<String, Output>, WorkspaceError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(WorkspaceError::Parse(
            "terraform produced no output report".to_string(),
        ));
    }
    let raw: BTreeMap<String, RawOutput> =
        serde_json::from_str(trimmed).map_err(|e| WorkspaceError::Parse(e.to_string()))?;

    let mut outputs = BTreeMap::new();
    for (key, entry) in raw {
        let value = match entry.value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        outputs.insert(
            key,
            Output {
                value,
                sensitive: entry.sensitive,
            },
        );
    }
    Ok(outputs)
}
