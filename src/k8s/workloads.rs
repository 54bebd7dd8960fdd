//! Nodes, pods and platform deployments.

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use super::api_error;
use crate::cluster::{FailingPod, NodeState, ServiceHealth};

/// Labels AKS puts on nodes naming their agent pool, newest first.
pub const POOL_LABELS: [&str; 2] = ["kubernetes.azure.com/agentpool", "agentpool"];

/// Container waiting reasons counted as failing.
const FAILING_REASONS: [&str; 4] = [
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
];

pub async fn list_nodes(client: &kube::Client) -> Result<Vec<Node>> {
    let api: Api<Node> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(api_error("list nodes"))?;
    debug!("Found {} nodes", list.items.len());
    Ok(list.items)
}

pub async fn list_pods(client: &kube::Client) -> Result<Vec<Pod>> {
    let api: Api<Pod> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(api_error("list pods"))?;
    debug!("Found {} pods", list.items.len());
    Ok(list.items)
}

pub fn node_state(node: &Node) -> NodeState {
    let labels = node.metadata.labels.as_ref();
    let pool = POOL_LABELS
        .iter()
        .find_map(|key| labels.and_then(|l| l.get(*key)))
        .cloned();

    let status = node.status.as_ref();
    let ready_condition = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"));

    NodeState {
        name: node.metadata.name.clone().unwrap_or_default(),
        pool,
        ready: ready_condition.is_some_and(|c| c.status == "True"),
        kubelet_version: status
            .and_then(|s| s.node_info.as_ref())
            .map(|info| info.kubelet_version.clone())
            .unwrap_or_default(),
        ready_since: ready_condition
            .and_then(|c| c.last_transition_time.as_ref())
            .map(|t| t.0),
    }
}

fn owned_by_job(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "Job"))
}

/// Why a pod counts as failing, if it does.
pub fn failure_reason(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;

    if status.phase.as_deref() == Some("Failed") && !owned_by_job(pod) {
        return Some(status.reason.clone().unwrap_or_else(|| "Failed".to_string()));
    }

    status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .find(|reason| FAILING_REASONS.contains(reason))
        .map(str::to_string)
}

pub fn failing_pods(pods: &[Pod]) -> Vec<FailingPod> {
    pods.iter()
        .filter_map(|pod| {
            let reason = failure_reason(pod)?;
            Some(FailingPod {
                namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                name: pod.metadata.name.clone().unwrap_or_default(),
                node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
                reason,
            })
        })
        .collect()
}

/// Readiness of each `namespace/name` deployment. Missing ones are reported, not errors.
pub async fn service_health(client: &kube::Client, services: &[String]) -> Result<Vec<ServiceHealth>> {
    let mut health = Vec::with_capacity(services.len());

    for service in services {
        let (namespace, name) = service.split_once('/').unwrap_or(("default", service.as_str()));
        let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        let deployment = api
            .get_opt(name)
            .await
            .map_err(api_error("read critical deployment"))?;

        health.push(match deployment {
            Some(d) => ServiceHealth {
                namespace: namespace.to_string(),
                name: name.to_string(),
                found: true,
                desired: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
                ready: d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
            },
            None => ServiceHealth {
                namespace: namespace.to_string(),
                name: name.to_string(),
                found: false,
                desired: 0,
                ready: 0,
            },
        });
    }

    Ok(health)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_node_state_from_aks_labels() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "aks-user-12345678-vmss000000",
                "labels": {"kubernetes.azure.com/agentpool": "user"}
            },
            "status": {
                "conditions": [
                    {"type": "MemoryPressure", "status": "False"},
                    {"type": "Ready", "status": "False", "lastTransitionTime": "2026-10-19T08:00:00Z"}
                ],
                "nodeInfo": {
                    "architecture": "amd64", "bootID": "", "containerRuntimeVersion": "",
                    "kernelVersion": "", "kubeProxyVersion": "", "kubeletVersion": "v1.29.0",
                    "machineID": "", "operatingSystem": "linux", "osImage": "", "systemUUID": ""
                }
            }
        }))
        .unwrap();

        let state = node_state(&node);
        assert_eq!(state.pool.as_deref(), Some("user"));
        assert!(!state.ready);
        assert_eq!(state.kubelet_version, "v1.29.0");
        assert!(state.ready_since.is_some());
    }

    #[test]
    fn test_failing_pod_detection() {
        let crashing = pod(serde_json::json!({
            "metadata": {"name": "web-1", "namespace": "apps"},
            "spec": {"containers": [], "nodeName": "aks-user-0"},
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "web", "image": "web:1", "imageID": "", "ready": false, "restartCount": 7,
                    "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                }]
            }
        }));
        let failed_job = pod(serde_json::json!({
            "metadata": {
                "name": "backup-x", "namespace": "ops",
                "ownerReferences": [{"apiVersion": "batch/v1", "kind": "Job", "name": "backup", "uid": "1"}]
            },
            "status": {"phase": "Failed"}
        }));
        let evicted = pod(serde_json::json!({
            "metadata": {"name": "api-2", "namespace": "apps"},
            "status": {"phase": "Failed", "reason": "Evicted"}
        }));

        let failing = failing_pods(&[crashing, failed_job, evicted]);
        assert_eq!(failing.len(), 2);
        assert_eq!(failing[0].reason, "CrashLoopBackOff");
        assert_eq!(failing[0].node.as_deref(), Some("aks-user-0"));
        assert_eq!(failing[1].reason, "Evicted");
    }
}
