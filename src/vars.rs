//! # Variable loader
//!
//! Merges literal variables and var-file references into one ordered set of
//! `(key, value)` pairs for a terraform run.
//!
//! Order: literal vars first, then var-file entries in declaration order.
//! Duplicate keys: first occurrence wins — later declarations never override
//! earlier ones. Reference kinds (ConfigMapKey, SecretKey) are read from the
//! Kubernetes API on every reconcile and never cached, so edits to the
//! referenced objects take effect on the next cycle.
//!
//! A missing object or key is a resolution failure and the reconcile must
//! not proceed to process execution.

use crate::error::WorkspaceError;
use crate::{Var, VarFileRef, Workspace};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use std::collections::HashSet;
use tracing::debug;

#[derive(Clone)]
pub struct VariableLoader {
    client: Client,
}

impl std::fmt::Debug for VariableLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableLoader").finish_non_exhaustive()
    }
}

impl VariableLoader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve every var source of `workspace` into one ordered list
    pub async fn load(
        &self,
        workspace: &Workspace,
    ) -> Result<Vec<(String, String)>, WorkspaceError> {
        let mut file_texts = Vec::with_capacity(workspace.spec.var_files.len());
        for var_file in &workspace.spec.var_files {
            file_texts.push(self.resolve_var_file(var_file).await?);
        }
        let merged = merge(&workspace.spec.vars, &file_texts);
        debug!(vars = merged.len(), "resolved workspace variables");
        Ok(merged)
    }

    async fn resolve_var_file(&self, var_file: &VarFileRef) -> Result<String, WorkspaceError> {
        match var_file {
            VarFileRef::Literal { content } => Ok(content.clone()),
            VarFileRef::ConfigMapKey {
                namespace,
                name,
                key,
            } => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let cm = get_or_resolution_error(api.get(name).await, "configMap", namespace, name)?;
                value_from_config_map(&cm, namespace, name, key)
            }
            VarFileRef::SecretKey {
                namespace,
                name,
                key,
            } => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let secret =
                    get_or_resolution_error(api.get(name).await, "secret", namespace, name)?;
                value_from_secret(&secret, namespace, name, key)
            }
        }
    }
}

fn get_or_resolution_error<T>(
    result: Result<T, kube::Error>,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<T, WorkspaceError> {
    match result {
        Ok(obj) => Ok(obj),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Err(WorkspaceError::resolution(
            format!("varFile {kind} {namespace}/{name}"),
            "referenced object not found",
        )),
        Err(e) => Err(WorkspaceError::Kube(e)),
    }
}

/// Read one key out of a ConfigMap's data
pub fn value_from_config_map(
    cm: &ConfigMap,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, WorkspaceError> {
    cm.data
        .as_ref()
        .and_then(|data| data.get(key))
        .cloned()
        .ok_or_else(|| {
            WorkspaceError::resolution(
                format!("varFile configMap {namespace}/{name}"),
                format!("key {key} not present"),
            )
        })
}

/// Read one key out of a Secret's data and decode it as UTF-8
pub fn value_from_secret(
    secret: &Secret,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, WorkspaceError> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| {
            WorkspaceError::resolution(
                format!("varFile secret {namespace}/{name}"),
                format!("key {key} not present"),
            )
        })?;
    String::from_utf8(bytes.0.clone()).map_err(|e| {
        WorkspaceError::resolution(
            format!("varFile secret {namespace}/{name}"),
            format!("key {key} is not valid UTF-8: {e}"),
        )
    })
}

/// Merge literal vars and var-file texts into one ordered set, first
/// occurrence wins
pub fn merge(vars: &[Var], var_file_texts: &[String]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for var in vars {
        if seen.insert(var.key.clone()) {
            merged.push((var.key.clone(), var.value.clone()));
        }
    }
    for text in var_file_texts {
        for (key, value) in parse_env_pairs(text) {
            if seen.insert(key.clone()) {
                merged.push((key, value));
            }
        }
    }
    merged
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped; the
/// value keeps everything after the first `=`.
pub fn parse_env_pairs(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn var(key: &str, value: &str) -> Var {
        Var {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn parse_env_pairs_skips_comments_and_blanks() {
        let text = "# comment\n\nDB_URL=postgres://x\nTOKEN=a=b=c\n";
        let pairs = parse_env_pairs(text);
        assert_eq!(
            pairs,
            vec![
                ("DB_URL".to_string(), "postgres://x".to_string()),
                ("TOKEN".to_string(), "a=b=c".to_string()),
            ]
        );
    }

    #[test]
    fn merge_orders_literals_before_file_entries() {
        let vars = vec![var("region", "eu-west-2")];
        let texts = vec!["size=large\nregion=us-east-1".to_string()];
        let merged = merge(&vars, &texts);
        assert_eq!(
            merged,
            vec![
                ("region".to_string(), "eu-west-2".to_string()),
                ("size".to_string(), "large".to_string()),
            ]
        );
    }

    #[test]
    fn merge_first_occurrence_wins_across_files() {
        let texts = vec![
            "a=first".to_string(),
            "a=second\nb=only".to_string(),
        ];
        let merged = merge(&[], &texts);
        assert_eq!(
            merged,
            vec![
                ("a".to_string(), "first".to_string()),
                ("b".to_string(), "only".to_string()),
            ]
        );
    }

    #[test]
    fn missing_secret_key_is_a_resolution_error() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "present".to_string(),
                ByteString(b"x=1".to_vec()),
            )])),
            ..Secret::default()
        };
        let err = value_from_secret(&secret, "default", "tfvars", "absent")
            .expect_err("absent key must fail");
        assert!(matches!(err, WorkspaceError::Resolution { .. }));
        assert_eq!(err.phase(), "ResolutionFailed");
    }

    #[test]
    fn secret_key_decodes_utf8_value() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "prod.env".to_string(),
                ByteString(b"password=hunter2".to_vec()),
            )])),
            ..Secret::default()
        };
        let text = value_from_secret(&secret, "default", "tfvars", "prod.env").expect("decodes");
        assert_eq!(text, "password=hunter2");
    }

    #[test]
    fn missing_config_map_key_is_a_resolution_error() {
        let cm = ConfigMap::default();
        let err = value_from_config_map(&cm, "default", "tfvars", "any")
            .expect_err("empty configmap must fail");
        assert!(matches!(err, WorkspaceError::Resolution { .. }));
    }
}
