//! PodDisruptionBudget headroom.
//!
//! For each PDB, which nodes its protected pods run on, so drain feasibility
//! can be judged per node pool.

use std::collections::BTreeMap;

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use super::api_error;
use crate::cluster::PdbHeadroom;

pub async fn list_pdbs(client: &kube::Client) -> Result<Vec<PodDisruptionBudget>> {
    let api: Api<PodDisruptionBudget> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(api_error("list PDBs"))?;
    debug!("Found {} PDBs in cluster", list.items.len());
    Ok(list.items)
}

/// Whether `labels` satisfy a label selector. An empty selector matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_ok = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    let expressions_ok = selector.match_expressions.iter().flatten().all(|req| {
        let values = req.values.as_deref().unwrap_or_default();
        let value = labels.get(&req.key);
        match req.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.is_none_or(|v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    });

    labels_ok && expressions_ok
}

fn is_active(pod: &Pod) -> bool {
    !matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// Headroom of every PDB that has a status, with its pods placed on nodes.
pub fn headroom(pdbs: &[PodDisruptionBudget], pods: &[Pod]) -> Vec<PdbHeadroom> {
    pdbs.iter()
        .filter_map(|pdb| {
            let status = pdb.status.as_ref()?;
            let namespace = pdb.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
            let spec = pdb.spec.as_ref();

            let mut pods_per_node = BTreeMap::new();
            if let Some(selector) = spec.and_then(|s| s.selector.as_ref()) {
                let empty = BTreeMap::new();
                for pod in pods.iter().filter(|p| {
                    p.metadata.namespace.as_deref() == Some(namespace.as_str()) && is_active(p)
                }) {
                    let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
                    let node = pod.spec.as_ref().and_then(|s| s.node_name.as_ref());
                    if let Some(node) = node
                        && selector_matches(selector, labels)
                    {
                        *pods_per_node.entry(node.clone()).or_insert(0u32) += 1;
                    }
                }
            }

            Some(PdbHeadroom {
                name: pdb.metadata.name.clone().unwrap_or_else(|| "unknown".to_string()),
                namespace,
                min_available: spec
                    .and_then(|s| s.min_available.as_ref())
                    .map(format_int_or_string),
                max_unavailable: spec
                    .and_then(|s| s.max_unavailable.as_ref())
                    .map(format_int_or_string),
                current_healthy: status.current_healthy,
                expected_pods: status.expected_pods,
                disruptions_allowed: status.disruptions_allowed,
                pods_per_node,
            })
        })
        .collect()
}

fn format_int_or_string(value: &IntOrString) -> String {
    match value {
        IntOrString::Int(i) => i.to_string(),
        IntOrString::String(s) => s.clone(),
    }
}
