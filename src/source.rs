//! # Source resolver
//!
//! Materializes a workspace's module configuration into its working
//! directory.
//!
//! Inline mode writes the literal HCL into `main.tf`, but only when the
//! content actually differs, so an unchanged module does not invalidate
//! terraform's caches for unrelated sub-steps. Remote mode fetches the
//! module with `terraform init -from-module`, re-fetching whenever the
//! reference string changes or the directory has no checkout yet. Even with
//! an unchanged reference, providers may still need re-initialization every
//! reconcile — the state machine runs a plain `init` regardless.

use crate::error::WorkspaceError;
use crate::terraform::TerraformCli;
use crate::{ModuleSource, WorkspaceSpec};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Primary configuration file for inline modules
pub const MODULE_FILE: &str = "main.tf";

/// Marker recording which remote reference the checkout came from
const MODULE_REF_MARKER: &str = ".module-ref";

#[derive(Debug, Clone)]
pub struct SourceResolver {
    cli: TerraformCli,
}

impl SourceResolver {
    pub fn new(cli: TerraformCli) -> Self {
        Self { cli }
    }

    /// Bring the module files in `dir` in line with the desired spec
    pub async fn resolve(&self, spec: &WorkspaceSpec, dir: &Path) -> Result<(), WorkspaceError> {
        match spec.source {
            ModuleSource::Inline => {
                let wrote = write_module_if_changed(dir, &spec.module).await?;
                if wrote {
                    debug!(dir = %dir.display(), "inline module content updated");
                }
                Ok(())
            }
            ModuleSource::Remote => {
                if needs_fetch(dir, &spec.module).await {
                    info!(reference = %spec.module, "fetching remote module");
                    self.cli.init_from_module(dir, &spec.module).await?;
                    record_fetched(dir, &spec.module).await?;
                }
                Ok(())
            }
        }
    }
}

/// Create (or reuse) the working directory for `external_name`. One
/// directory per external name; it survives failed runs and is only removed
/// after a successful destroy.
pub async fn ensure_workspace_dir(
    root: &Path,
    external_name: &str,
) -> Result<PathBuf, WorkspaceError> {
    let dir = root.join(external_name);
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Path of the working directory for `external_name`, without creating it
pub fn workspace_dir(root: &Path, external_name: &str) -> PathBuf {
    root.join(external_name)
}

/// Write `main.tf` only when the desired content differs from what is on
/// disk. Returns whether anything was written.
pub async fn write_module_if_changed(
    dir: &Path,
    content: &str,
) -> Result<bool, WorkspaceError> {
    let path = dir.join(MODULE_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(WorkspaceError::Io(e)),
    }
    tokio::fs::write(&path, content).await?;
    Ok(true)
}

/// Whether the remote module must be (re-)fetched: no recorded checkout, or
/// the reference string changed since the last fetch
pub async fn needs_fetch(dir: &Path, reference: &str) -> bool {
    match tokio::fs::read_to_string(dir.join(MODULE_REF_MARKER)).await {
        Ok(recorded) => recorded.trim() != reference,
        Err(_) => true,
    }
}

async fn record_fetched(dir: &Path, reference: &str) -> Result<(), WorkspaceError> {
    tokio::fs::write(dir.join(MODULE_REF_MARKER), reference).await?;
    Ok(())
}
