//! Kubernetes API access for cluster snapshots.

pub mod client;
pub mod extended;
pub mod metrics;
pub mod pdb;
pub mod workloads;

use crate::error::AkupError;

/// Wrap a kube error with what was being read.
pub(crate) fn api_error(what: &'static str) -> impl FnOnce(kube::Error) -> AkupError {
    move |e| AkupError::KubernetesApi(format!("Failed to {what}: {e}"))
}
