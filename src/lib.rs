//! Terraform Workspace Controller Library
//!
//! This library provides the core functionality for the Terraform Workspace
//! Controller: the `Workspace` CRD types plus the reconciliation engine that
//! drives the Terraform CLI against per-workspace working directories.
//! Tests are included in the module files (e.g., reconciler.rs).

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod config;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod reconciler;
pub mod server;
pub mod source;
pub mod terraform;
pub mod vars;

/// Annotation that overrides the workspace external name. When absent the
/// resource name is used. The external name keys the on-disk working
/// directory, so it must never be shared between two resources.
pub const EXTERNAL_NAME_ANNOTATION: &str = "terraform.workspaces.octopilot.io/external-name";

/// Workspace Custom Resource Definition
///
/// A `Workspace` declares a Terraform module (inline HCL or a remote module
/// reference), the variables to apply it with, and where to write the
/// resulting outputs.
///
/// # Example
///
/// ```yaml
/// apiVersion: terraform.workspaces.octopilot.io/v1alpha1
/// kind: Workspace
/// metadata:
///   name: example-bucket
///   namespace: default
/// spec:
///   source: Inline
///   module: |
///     resource "random_id" "example" { byte_length = 4 }
///     output "id" { value = random_id.example.hex }
///   vars:
///     - key: region
///       value: eu-west-2
///   writeConnectionSecretToRef:
///     namespace: default
///     name: example-bucket-conn
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Workspace",
    group = "terraform.workspaces.octopilot.io",
    version = "v1alpha1",
    namespaced,
    status = "WorkspaceStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// How the module payload is interpreted: literal HCL (`Inline`) or a
    /// module reference fetched by `terraform init -from-module` (`Remote`).
    #[serde(default)]
    pub source: ModuleSource,
    /// The module payload. Inline mode: HCL written verbatim to `main.tf`.
    /// Remote mode: any module source terraform understands (git, registry,
    /// archive URL, ...).
    pub module: String,
    /// Literal variables, applied before any var file entries.
    #[serde(default)]
    pub vars: Vec<Var>,
    /// Variable files resolved at reconcile time, in declaration order.
    /// Earlier declarations win on duplicate keys.
    #[serde(default)]
    pub var_files: Vec<VarFileRef>,
    /// Destination secret for all extracted outputs, sensitive ones included.
    #[serde(default)]
    pub write_connection_secret_to_ref: Option<ConnectionSecretRef>,
}

/// Module source mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ModuleSource {
    /// `spec.module` is literal HCL content
    #[default]
    Inline,
    /// `spec.module` is a remote module reference
    Remote,
}

/// A literal key/value variable assignment
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Var {
    pub key: String,
    pub value: String,
}

/// A variable file reference, resolved fresh on every reconcile
///
/// Reference kinds read a named key out of a ConfigMap or Secret; the value
/// is parsed as `KEY=VALUE` lines. The referenced object changing between
/// reconciles is expected and picked up on the next reconcile.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", tag = "source")]
pub enum VarFileRef {
    /// Inline `KEY=VALUE` lines
    Literal { content: String },
    /// A key in a ConfigMap
    ConfigMapKey {
        namespace: String,
        name: String,
        key: String,
    },
    /// A key in a Secret
    SecretKey {
        namespace: String,
        name: String,
        key: String,
    },
}

/// Namespaced secret destination for connection details
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSecretRef {
    pub namespace: String,
    pub name: String,
}

/// Status of the Workspace resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Last reconciliation time
    #[serde(default)]
    pub last_reconcile_time: Option<String>,
    /// Observed state of the managed workspace
    #[serde(default)]
    pub at_provider: Option<WorkspaceObservation>,
}

/// Observed state persisted across reconciles
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceObservation {
    /// Fingerprint of the last successfully applied configuration
    #[serde(default)]
    pub applied_fingerprint: Option<String>,
    /// Non-sensitive outputs of the last successful apply. Sensitive outputs
    /// only appear in the connection secret.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Condition represents a status condition for the resource
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing condition
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(r#type: &str, status: bool, reason: &str, message: String) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message),
        }
    }
}

/// The stable identity keying the on-disk working directory. Defaults to the
/// resource name, overridable via the external-name annotation.
pub fn external_name(workspace: &Workspace) -> String {
    workspace
        .annotations()
        .get(EXTERNAL_NAME_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| workspace.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(name: &str) -> Workspace {
        let mut ws = Workspace::new(
            name,
            WorkspaceSpec {
                source: ModuleSource::Inline,
                module: String::new(),
                vars: vec![],
                var_files: vec![],
                write_connection_secret_to_ref: None,
            },
        );
        ws.metadata.namespace = Some("default".to_string());
        ws
    }

    #[test]
    fn external_name_defaults_to_resource_name() {
        let ws = workspace("my-workspace");
        assert_eq!(external_name(&ws), "my-workspace");
    }

    #[test]
    fn external_name_annotation_overrides_resource_name() {
        let mut ws = workspace("my-workspace");
        ws.annotations_mut().insert(
            EXTERNAL_NAME_ANNOTATION.to_string(),
            "legacy-name".to_string(),
        );
        assert_eq!(external_name(&ws), "legacy-name");
    }

    #[test]
    fn var_file_ref_deserializes_tagged_source() {
        let yaml = r#"
source: SecretKey
namespace: default
name: tfvars
key: prod.env
"#;
        let parsed: VarFileRef = serde_yaml::from_str(yaml).expect("valid var file ref");
        match parsed {
            VarFileRef::SecretKey {
                namespace,
                name,
                key,
            } => {
                assert_eq!(namespace, "default");
                assert_eq!(name, "tfvars");
                assert_eq!(key, "prod.env");
            }
            other => panic!("expected SecretKey, got {other:?}"),
        }
    }
}
