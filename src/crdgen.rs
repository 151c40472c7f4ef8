//! # CRD Generator
//!
//! Generates the Kubernetes CustomResourceDefinition YAML for the
//! `Workspace` resource from the Rust type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > config/crd/workspace.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use terraform_workspace_controller::Workspace;

fn main() {
    match serde_yaml::to_string(&Workspace::crd()) {
        Ok(yaml) => print!("{yaml}"),
        Err(e) => {
            eprintln!("failed to serialize Workspace CRD: {e}");
            std::process::exit(1);
        }
    }
}
