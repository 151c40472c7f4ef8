//! # Reconciler
//!
//! Core reconciliation logic for `Workspace` resources.
//!
//! ## Reconciliation Flow
//!
//! 1. Resolve variables (literal vars + var files) — a dangling reference
//!    fails here, before any terraform process runs
//! 2. Fingerprint the desired configuration and compare against the last
//!    successfully applied fingerprint in status
//! 3. Up to date: lightweight drift check via `plan -detailed-exitcode`
//! 4. Needs apply: lock the workspace, materialize the module source, then
//!    `init` → `apply` → `output -json`
//! 5. Write every output to the connection secret, mirror non-sensitive
//!    ones into status, persist the applied fingerprint
//! 6. On deletion: lock, `destroy`, remove the working directory and the
//!    finalizer only after destroy succeeds
//!
//! The Ready condition flips to True only after a successful apply — never
//! after init or plan — so observers cannot mistake partial progress for
//! success. A failed step before apply leaves the working directory and the
//! fingerprint untouched; the next reconcile resumes from the same on-disk
//! state.

use crate::config::ControllerConfig;
use crate::error::WorkspaceError;
use crate::locks::{WorkspaceGuard, WorkspaceLockManager};
use crate::source::{self, SourceResolver};
use crate::terraform::{Output, TerraformCli};
use crate::vars::VariableLoader;
use crate::{
    external_name, metrics, Condition, ModuleSource, Workspace, WorkspaceStatus,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Finalizer blocking resource removal until destroy succeeds
pub const FINALIZER: &str = "terraform.workspaces.octopilot.io/finalizer";

const FIELD_MANAGER: &str = "terraform-workspace-controller";

const CONDITION_READY: &str = "Ready";
const CONDITION_OUTPUTS: &str = "OutputsAvailable";

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("reconciliation failed: {0}")]
    Failed(#[from] WorkspaceError),
}

/// What a non-mutating observation of the desired spec concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Desired fingerprint matches the last applied one
    UpToDate,
    /// Fingerprint differs (or nothing was ever applied)
    NeedsApply,
}

/// Compare the desired fingerprint against the last successfully applied
/// one recorded in status. Purely computational: invokes nothing.
pub fn observe(desired_fingerprint: &str, status: Option<&WorkspaceStatus>) -> Observation {
    let applied = status
        .and_then(|s| s.at_provider.as_ref())
        .and_then(|a| a.applied_fingerprint.as_deref());
    match applied {
        Some(applied) if applied == desired_fingerprint => Observation::UpToDate,
        _ => Observation::NeedsApply,
    }
}

/// Deterministic fingerprint of the desired configuration: source mode,
/// module payload, and the resolved variables in order.
pub fn fingerprint(source: ModuleSource, module: &str, vars: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(match source {
        ModuleSource::Inline => b"inline".as_slice(),
        ModuleSource::Remote => b"remote".as_slice(),
    });
    hasher.update([0x00]);
    hasher.update(module.as_bytes());
    hasher.update([0x00]);
    for (key, value) in vars {
        hasher.update(key.as_bytes());
        hasher.update([0x1e]);
        hasher.update(value.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

/// Non-sensitive outputs as plain strings for resource status
pub fn status_outputs(outputs: &BTreeMap<String, Output>) -> BTreeMap<String, String> {
    outputs
        .iter()
        .filter(|(_, output)| !output.sensitive)
        .map(|(key, output)| (key.clone(), output.value.clone()))
        .collect()
}

/// All outputs, sensitive included, as connection secret data
pub fn connection_secret_data(outputs: &BTreeMap<String, Output>) -> BTreeMap<String, ByteString> {
    outputs
        .iter()
        .map(|(key, output)| (key.clone(), ByteString(output.value.clone().into_bytes())))
        .collect()
}

/// Replace the condition of the same type, or append. The transition time
/// only moves when the status actually transitions; refreshing a condition
/// with the same status keeps the original timestamp.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

/// Ready condition for a successful cycle: a fresh apply vs an up-to-date
/// poll that mutated nothing
fn ready_condition(applied: bool) -> Condition {
    if applied {
        Condition::new(
            CONDITION_READY,
            true,
            "ApplySucceeded",
            "workspace matches the desired configuration".to_string(),
        )
    } else {
        Condition::new(
            CONDITION_READY,
            true,
            "UpToDate",
            "no changes since the last apply".to_string(),
        )
    }
}

pub struct Reconciler {
    client: Client,
    config: ControllerConfig,
    terraform: TerraformCli,
    source: SourceResolver,
    vars: VariableLoader,
    locks: Arc<WorkspaceLockManager>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        let terraform = TerraformCli::new(&config.terraform_binary, config.run_timeout);
        Self {
            source: SourceResolver::new(terraform.clone()),
            vars: VariableLoader::new(client.clone()),
            locks: WorkspaceLockManager::new(),
            terraform,
            client,
            config,
        }
    }

    /// The lock registry, exposed so operators (or an admin endpoint) can
    /// clear a lock stranded by a killed run.
    pub fn locks(&self) -> &Arc<WorkspaceLockManager> {
        &self.locks
    }

    pub fn error_requeue(&self) -> std::time::Duration {
        self.config.error_requeue
    }

    pub async fn reconcile(
        workspace: Arc<Workspace>,
        ctx: Arc<Reconciler>,
    ) -> Result<Action, ReconcilerError> {
        let start = Instant::now();
        let name = workspace.name_any();
        let external = external_name(&workspace);
        metrics::increment_reconciliations();

        let deleting = workspace.meta().deletion_timestamp.is_some();
        info!(workspace = %name, external_name = %external, deleting, "reconciling workspace");

        let result = if deleting {
            ctx.delete(&workspace, &external).await
        } else {
            ctx.create_or_update(&workspace, &external).await
        };

        metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

        match result {
            Ok(action) => Ok(action),
            Err(e) => {
                metrics::increment_reconciliation_errors();
                error!(workspace = %name, phase = e.phase(), error = %e, "reconciliation failed");
                if let Err(status_err) = ctx.record_failure(&workspace, &e).await {
                    warn!(workspace = %name, error = %status_err, "failed to record failure in status");
                }
                Err(ReconcilerError::Failed(e))
            }
        }
    }

    async fn create_or_update(
        &self,
        workspace: &Workspace,
        external: &str,
    ) -> Result<Action, WorkspaceError> {
        self.ensure_finalizer(workspace).await?;

        // Variables resolve before anything else so that a dangling
        // reference never reaches process execution.
        let vars = self.vars.load(workspace).await?;
        let desired = fingerprint(workspace.spec.source, &workspace.spec.module, &vars);
        let dir = source::workspace_dir(&self.config.workdir_root, external);

        if observe(&desired, workspace.status.as_ref()) == Observation::UpToDate && dir.exists() {
            let guard = self.locks.acquire(external)?;
            match self.terraform.plan_has_drift(&dir, &vars).await {
                Ok(false) => {
                    drop(guard);
                    info!(workspace = %workspace.name_any(), "workspace is up to date");
                    self.record_synced(workspace, &desired, None).await?;
                    return Ok(Action::requeue(self.config.poll_interval));
                }
                Ok(true) => {
                    info!(workspace = %workspace.name_any(), "drift detected, re-applying");
                    self.apply_locked(workspace, external, &dir, &vars, &desired, guard)
                        .await
                }
                Err(e) => Err(strand_if_killed(guard, e)),
            }
        } else {
            let guard = self.locks.acquire(external)?;
            let dir = source::ensure_workspace_dir(&self.config.workdir_root, external).await?;
            self.apply_locked(workspace, external, &dir, &vars, &desired, guard)
                .await
        }
    }

    /// init + apply + output extraction while holding the workspace lock
    async fn apply_locked(
        &self,
        workspace: &Workspace,
        external: &str,
        dir: &Path,
        vars: &[(String, String)],
        desired: &str,
        guard: WorkspaceGuard,
    ) -> Result<Action, WorkspaceError> {
        let outputs = match self.run_apply(workspace, dir, vars).await {
            Ok(outputs) => outputs,
            Err(e) => return Err(strand_if_killed(guard, e)),
        };
        drop(guard);

        info!(workspace = %workspace.name_any(), external_name = %external, "apply succeeded");

        match outputs {
            Ok(outputs) => {
                if let Some(dest) = &workspace.spec.write_connection_secret_to_ref {
                    self.write_connection_secret(dest, &outputs).await?;
                }
                self.record_synced(workspace, desired, Some(&outputs)).await?;
            }
            Err(parse_err) => {
                // The infrastructure changed; never hide that behind a
                // parse failure. Applied state is recorded and the parse
                // failure becomes a secondary condition.
                warn!(
                    workspace = %workspace.name_any(),
                    error = %parse_err,
                    "apply succeeded but outputs could not be extracted"
                );
                self.record_synced_without_outputs(workspace, desired, &parse_err)
                    .await?;
            }
        }
        Ok(Action::requeue(self.config.poll_interval))
    }

    /// The mutating sequence. The outer error means the apply itself failed
    /// (fingerprint must not be persisted); the inner result carries the
    /// output extraction, which is allowed to fail independently.
    async fn run_apply(
        &self,
        workspace: &Workspace,
        dir: &Path,
        vars: &[(String, String)],
    ) -> Result<Result<BTreeMap<String, Output>, WorkspaceError>, WorkspaceError> {
        self.source.resolve(&workspace.spec, dir).await?;
        self.terraform.init(dir).await?;
        self.terraform.apply(dir, vars).await?;
        Ok(self.terraform.outputs(dir).await)
    }

    async fn delete(&self, workspace: &Workspace, external: &str) -> Result<Action, WorkspaceError> {
        if !workspace.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(Action::await_change());
        }

        let dir = source::workspace_dir(&self.config.workdir_root, external);
        if !dir.exists() {
            // Nothing was ever applied under this external name.
            self.remove_finalizer(workspace).await?;
            return Ok(Action::await_change());
        }

        let vars = self.vars.load(workspace).await?;
        let guard = self.locks.acquire(external)?;
        match destroy_workspace(&self.terraform, &dir, &vars).await {
            Ok(()) => {
                drop(guard);
                self.remove_finalizer(workspace).await?;
                info!(
                    workspace = %workspace.name_any(),
                    external_name = %external,
                    "workspace destroyed and directory removed"
                );
                Ok(Action::await_change())
            }
            // A failed destroy keeps the finalizer set: the resource cannot
            // be removed until destroy eventually succeeds.
            Err(e) => Err(strand_if_killed(guard, e)),
        }
    }

    async fn ensure_finalizer(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        if workspace.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let mut finalizers = workspace.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(workspace, finalizers).await
    }

    async fn remove_finalizer(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let finalizers: Vec<String> = workspace
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(workspace, finalizers).await
    }

    async fn patch_finalizers(
        &self,
        workspace: &Workspace,
        finalizers: Vec<String>,
    ) -> Result<(), WorkspaceError> {
        let api = self.workspace_api(workspace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            &workspace.name_any(),
            &PatchParams::default(),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }

    /// Create or update the connection secret with every extracted output
    async fn write_connection_secret(
        &self,
        dest: &crate::ConnectionSecretRef,
        outputs: &BTreeMap<String, Output>,
    ) -> Result<(), WorkspaceError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &dest.namespace);
        let data = connection_secret_data(outputs);

        match api.get(&dest.name).await {
            Ok(_) => {
                let patch = serde_json::json!({ "data": data });
                api.patch(&dest.name, &PatchParams::default(), &Patch::Merge(patch))
                    .await?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(dest.name.clone()),
                        namespace: Some(dest.namespace.clone()),
                        ..ObjectMeta::default()
                    },
                    data: Some(data),
                    ..Secret::default()
                };
                api.create(&PostParams::default(), &secret).await?;
            }
            Err(e) => return Err(WorkspaceError::Kube(e)),
        }
        Ok(())
    }

    /// Persist the applied fingerprint and a Ready=True condition. Only
    /// called after a successful apply (or an up-to-date observation).
    async fn record_synced(
        &self,
        workspace: &Workspace,
        desired: &str,
        outputs: Option<&BTreeMap<String, Output>>,
    ) -> Result<(), WorkspaceError> {
        let mut status = self.base_status(workspace);
        let mut at_provider = status.at_provider.take().unwrap_or_default();
        at_provider.applied_fingerprint = Some(desired.to_string());
        if let Some(outputs) = outputs {
            at_provider.outputs = status_outputs(outputs);
            upsert_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_OUTPUTS,
                    true,
                    "OutputsExtracted",
                    format!("{} outputs extracted", outputs.len()),
                ),
            );
        }
        status.at_provider = Some(at_provider);
        upsert_condition(&mut status.conditions, ready_condition(outputs.is_some()));
        self.patch_status(workspace, status).await
    }

    /// Apply succeeded but the output report was unusable: mark applied,
    /// surface the parse failure as a secondary condition.
    async fn record_synced_without_outputs(
        &self,
        workspace: &Workspace,
        desired: &str,
        parse_err: &WorkspaceError,
    ) -> Result<(), WorkspaceError> {
        let mut status = self.base_status(workspace);
        let mut at_provider = status.at_provider.take().unwrap_or_default();
        at_provider.applied_fingerprint = Some(desired.to_string());
        status.at_provider = Some(at_provider);
        upsert_condition(&mut status.conditions, ready_condition(true));
        upsert_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_OUTPUTS,
                false,
                parse_err.phase(),
                parse_err.to_string(),
            ),
        );
        self.patch_status(workspace, status).await
    }

    /// Attach the failure to status with the failing phase as reason. The
    /// fingerprint and directory are left untouched so the next attempt
    /// resumes from the same on-disk state.
    async fn record_failure(
        &self,
        workspace: &Workspace,
        err: &WorkspaceError,
    ) -> Result<(), WorkspaceError> {
        let mut status = self.base_status(workspace);
        upsert_condition(
            &mut status.conditions,
            Condition::new(CONDITION_READY, false, err.phase(), err.to_string()),
        );
        self.patch_status(workspace, status).await
    }

    fn base_status(&self, workspace: &Workspace) -> WorkspaceStatus {
        let mut status = workspace.status.clone().unwrap_or_default();
        status.observed_generation = workspace.meta().generation;
        status.last_reconcile_time = Some(chrono::Utc::now().to_rfc3339());
        status
    }

    async fn patch_status(
        &self,
        workspace: &Workspace,
        status: WorkspaceStatus,
    ) -> Result<(), WorkspaceError> {
        let api = self.workspace_api(workspace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &workspace.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }

    fn workspace_api(&self, workspace: &Workspace) -> Api<Workspace> {
        let namespace = workspace.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }
}

/// Tear down the managed infrastructure, then the working directory. A
/// failed destroy leaves the directory (and its state blob) intact so the
/// next attempt resumes where this one stopped.
async fn destroy_workspace(
    terraform: &TerraformCli,
    dir: &Path,
    vars: &[(String, String)],
) -> Result<(), WorkspaceError> {
    terraform.destroy(dir, vars).await?;
    tokio::fs::remove_dir_all(dir).await?;
    Ok(())
}

/// A killed run leaves the directory in an unknown state: strand the lock
/// instead of releasing it. Every other error releases normally.
fn strand_if_killed(guard: WorkspaceGuard, err: WorkspaceError) -> WorkspaceError {
    if matches!(err, WorkspaceError::Killed { .. }) {
        guard.strand();
    }
    err
}

/// Requeue policy for failed reconciles, driven by the external scheduler
pub fn error_policy(
    workspace: Arc<Workspace>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    warn!(
        workspace = %workspace.name_any(),
        error = %error,
        "requeueing after reconciliation error"
    );
    Action::requeue(ctx.error_requeue())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    mod fingerprint_tests {
        use super::*;

        #[test]
        fn stable_for_identical_configuration() {
            let v = vars(&[("region", "eu-west-2")]);
            assert_eq!(
                fingerprint(ModuleSource::Inline, "module \"x\" {}", &v),
                fingerprint(ModuleSource::Inline, "module \"x\" {}", &v),
            );
        }

        #[test]
        fn changes_when_module_content_changes() {
            let v = vars(&[]);
            assert_ne!(
                fingerprint(ModuleSource::Inline, "a", &v),
                fingerprint(ModuleSource::Inline, "b", &v),
            );
        }

        #[test]
        fn changes_when_any_var_changes() {
            let module = "module";
            assert_ne!(
                fingerprint(ModuleSource::Inline, module, &vars(&[("a", "1")])),
                fingerprint(ModuleSource::Inline, module, &vars(&[("a", "2")])),
            );
            assert_ne!(
                fingerprint(ModuleSource::Inline, module, &vars(&[("a", "1")])),
                fingerprint(
                    ModuleSource::Inline,
                    module,
                    &vars(&[("a", "1"), ("b", "2")])
                ),
            );
        }

        #[test]
        fn distinguishes_source_modes() {
            // The same string means different things as inline HCL vs a
            // remote reference.
            assert_ne!(
                fingerprint(ModuleSource::Inline, "git::https://x", &[]),
                fingerprint(ModuleSource::Remote, "git::https://x", &[]),
            );
        }

        #[test]
        fn key_value_boundaries_are_unambiguous() {
            assert_ne!(
                fingerprint(ModuleSource::Inline, "m", &vars(&[("ab", "c")])),
                fingerprint(ModuleSource::Inline, "m", &vars(&[("a", "bc")])),
            );
        }
    }

    mod observe_tests {
        use super::*;
        use crate::WorkspaceObservation;

        fn status_with_fingerprint(fp: &str) -> WorkspaceStatus {
            WorkspaceStatus {
                at_provider: Some(WorkspaceObservation {
                    applied_fingerprint: Some(fp.to_string()),
                    outputs: BTreeMap::new(),
                }),
                ..WorkspaceStatus::default()
            }
        }

        #[test]
        fn matching_fingerprint_is_up_to_date() {
            let status = status_with_fingerprint("abc");
            assert_eq!(observe("abc", Some(&status)), Observation::UpToDate);
        }

        #[test]
        fn changed_fingerprint_needs_apply() {
            let status = status_with_fingerprint("abc");
            assert_eq!(observe("def", Some(&status)), Observation::NeedsApply);
        }

        #[test]
        fn never_applied_needs_apply() {
            assert_eq!(observe("abc", None), Observation::NeedsApply);
            assert_eq!(
                observe("abc", Some(&WorkspaceStatus::default())),
                Observation::NeedsApply
            );
        }
    }

    mod output_mapping_tests {
        use super::*;

        fn sample_outputs() -> BTreeMap<String, Output> {
            BTreeMap::from([
                (
                    "url".to_string(),
                    Output {
                        value: "https://x".to_string(),
                        sensitive: false,
                    },
                ),
                (
                    "password".to_string(),
                    Output {
                        value: "hunter2".to_string(),
                        sensitive: true,
                    },
                ),
            ])
        }

        #[test]
        fn status_only_carries_non_sensitive_outputs() {
            let status = status_outputs(&sample_outputs());
            assert_eq!(status.get("url").map(String::as_str), Some("https://x"));
            assert!(!status.contains_key("password"));
        }

        #[test]
        fn connection_secret_carries_every_output() {
            let data = connection_secret_data(&sample_outputs());
            assert_eq!(data["url"].0, b"https://x".to_vec());
            assert_eq!(data["password"].0, b"hunter2".to_vec());
        }
    }

    mod destroy_tests {
        use super::*;
        use std::time::Duration;

        async fn workspace_dir_with_state(root: &Path) -> std::path::PathBuf {
            let dir = root.join("ws-a");
            tokio::fs::create_dir_all(&dir).await.expect("create dir");
            tokio::fs::write(dir.join("terraform.tfstate"), "{}")
                .await
                .expect("write state");
            dir
        }

        #[tokio::test]
        async fn failed_destroy_keeps_the_directory() {
            let root = tempfile::tempdir().expect("tempdir");
            let dir = workspace_dir_with_state(root.path()).await;

            let cli = TerraformCli::new("false", Duration::from_secs(5));
            let err = destroy_workspace(&cli, &dir, &[])
                .await
                .expect_err("destroy fails");
            assert!(matches!(err, WorkspaceError::Destroy { .. }));
            assert!(
                dir.join("terraform.tfstate").is_file(),
                "state must survive a failed destroy"
            );
        }

        #[tokio::test]
        async fn successful_destroy_removes_the_directory() {
            let root = tempfile::tempdir().expect("tempdir");
            let dir = workspace_dir_with_state(root.path()).await;

            let cli = TerraformCli::new("true", Duration::from_secs(5));
            destroy_workspace(&cli, &dir, &[])
                .await
                .expect("destroy succeeds");
            assert!(!dir.exists());
        }
    }

    mod lock_handoff_tests {
        use super::*;
        use std::time::Duration;

        #[test]
        fn killed_run_strands_the_lock() {
            let locks = WorkspaceLockManager::new();
            let guard = locks.acquire("ws-a").expect("acquire");
            let err = strand_if_killed(
                guard,
                WorkspaceError::Killed {
                    subcommand: "destroy".to_string(),
                    timeout: Duration::from_secs(1200),
                },
            );
            assert!(matches!(err, WorkspaceError::Killed { .. }));
            // Stranded: stays busy until an operator clears it.
            assert!(locks.acquire("ws-a").is_err());
            assert!(locks.clear_stranded("ws-a"));
            locks.acquire("ws-a").expect("acquire after clear");
        }

        #[test]
        fn ordinary_failures_release_the_lock() {
            let locks = WorkspaceLockManager::new();
            let guard = locks.acquire("ws-a").expect("acquire");
            let err = strand_if_killed(
                guard,
                WorkspaceError::Destroy {
                    code: 1,
                    stderr: "in use".to_string(),
                },
            );
            assert!(matches!(err, WorkspaceError::Destroy { .. }));
            locks
                .acquire("ws-a")
                .expect("released after a non-killed failure");
        }
    }

    mod condition_tests {
        use super::*;

        #[test]
        fn upsert_replaces_matching_type_in_place() {
            let mut conditions = vec![
                Condition::new(CONDITION_READY, false, "ApplyFailed", "boom".to_string()),
                Condition::new(CONDITION_OUTPUTS, true, "OutputsExtracted", "2".to_string()),
            ];
            upsert_condition(
                &mut conditions,
                Condition::new(CONDITION_READY, true, "ApplySucceeded", "ok".to_string()),
            );
            assert_eq!(conditions.len(), 2);
            assert_eq!(conditions[0].status, "True");
            assert_eq!(conditions[0].reason.as_deref(), Some("ApplySucceeded"));
        }

        #[test]
        fn transition_time_survives_same_status_refresh() {
            let mut original =
                Condition::new(CONDITION_READY, true, "ApplySucceeded", "ok".to_string());
            original.last_transition_time = Some("2026-01-01T00:00:00+00:00".to_string());
            let mut conditions = vec![original];

            // An up-to-date poll refreshes the condition without a status
            // change; the transition time must not move.
            upsert_condition(&mut conditions, ready_condition(false));
            assert_eq!(conditions[0].reason.as_deref(), Some("UpToDate"));
            assert_eq!(
                conditions[0].last_transition_time.as_deref(),
                Some("2026-01-01T00:00:00+00:00")
            );

            // An actual transition stamps a new time.
            upsert_condition(
                &mut conditions,
                Condition::new(CONDITION_READY, false, "ApplyFailed", "boom".to_string()),
            );
            assert_ne!(
                conditions[0].last_transition_time.as_deref(),
                Some("2026-01-01T00:00:00+00:00")
            );
        }

        #[test]
        fn up_to_date_poll_gets_its_own_reason() {
            assert_eq!(ready_condition(true).reason.as_deref(), Some("ApplySucceeded"));
            assert_eq!(ready_condition(false).reason.as_deref(), Some("UpToDate"));
            assert_eq!(ready_condition(false).status, "True");
        }

        #[test]
        fn upsert_appends_new_types() {
            let mut conditions = Vec::new();
            upsert_condition(
                &mut conditions,
                Condition::new(CONDITION_READY, true, "ApplySucceeded", "ok".to_string()),
            );
            assert_eq!(conditions.len(), 1);
        }
    }
}
