//! Test fixtures and fakes shared by unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::azure::{CommandOutput, CommandRunner};
use crate::backend::{Backend, BackendState, PlanDiff};
use crate::cluster::{
    ClusterHealthSnapshot, ClusterQuery, CoreUsage, ExtendedHealth, NodePoolState, NodeState,
    PoolMode, ProvisioningState, QuotaHeadroom, ServiceHealth,
};
use crate::error::AkupError;
use crate::upgrade::{BackendHandle, BackendKind, UpgradePlan};
use crate::version::KubeVersion;

pub fn pool(name: &str, mode: PoolMode, version: &str, nodes: u32) -> NodePoolState {
    NodePoolState {
        name: name.to_string(),
        mode,
        vm_size: match mode {
            PoolMode::System => "Standard_D4s_v5".to_string(),
            PoolMode::User => "Standard_D8s_v5".to_string(),
        },
        node_count: nodes,
        current_version: KubeVersion::parse(version).unwrap(),
        target_version: None,
        node_image_version: Some("AKSUbuntu-2204gen2containerd-202409.01.0".to_string()),
        latest_node_image_version: Some("AKSUbuntu-2204gen2containerd-202409.01.0".to_string()),
        max_surge: Some(match mode {
            PoolMode::System => "1".to_string(),
            PoolMode::User => "33%".to_string(),
        }),
        provisioning_state: ProvisioningState::Succeeded,
    }
}

pub fn node(name: &str, pool: &str, version: &str, ready: bool) -> NodeState {
    NodeState {
        name: name.to_string(),
        pool: Some(pool.to_string()),
        ready,
        kubelet_version: format!("v{version}"),
        ready_since: Some(Utc::now() - chrono::Duration::hours(1)),
    }
}

/// Healthy cluster with a 3-node `system` pool and a 3-node `user` pool.
pub fn snapshot(control_plane: &str, pools: &str) -> ClusterHealthSnapshot {
    let mut nodes = Vec::new();
    for p in ["system", "user"] {
        for i in 0..3 {
            nodes.push(node(&format!("aks-{p}-{i}"), p, pools, true));
        }
    }

    ClusterHealthSnapshot {
        captured_at: Utc::now(),
        control_plane_version: KubeVersion::parse(control_plane).unwrap(),
        provisioning_state: ProvisioningState::Succeeded,
        node_pools: vec![
            pool("system", PoolMode::System, pools, 3),
            pool("user", PoolMode::User, pools, 3),
        ],
        nodes,
        failing_pods: Vec::new(),
        pdbs: Vec::new(),
        deprecated_apis: Vec::new(),
        quota: Some(QuotaHeadroom {
            region: "koreacentral".to_string(),
            cores_limit: 200,
            cores_used: 48,
            vcpus_per_size: BTreeMap::from([
                ("Standard_D4s_v5".to_string(), 4),
                ("Standard_D8s_v5".to_string(), 8),
            ]),
            family_per_size: BTreeMap::from([
                ("Standard_D4s_v5".to_string(), "standardDSv5Family".to_string()),
                ("Standard_D8s_v5".to_string(), "standardDSv5Family".to_string()),
            ]),
            families: BTreeMap::from([(
                "standardDSv5Family".to_string(),
                CoreUsage { limit: 100, used: 24 },
            )]),
        }),
        critical_services: ["ingress-nginx/ingress-nginx-controller", "argocd/argocd-server", "kube-system/coredns"]
            .iter()
            .filter_map(|s| s.split_once('/'))
            .map(|(ns, name)| ServiceHealth {
                namespace: ns.to_string(),
                name: name.to_string(),
                found: true,
                desired: 2,
                ready: 2,
            })
            .collect(),
    }
}

/// Snapshot of an upgrade in flight: provisioning `Upgrading`, pools converging.
pub fn upgrading(from: &str, to: &str) -> ClusterHealthSnapshot {
    let mut snap = snapshot(to, from);
    snap.provisioning_state = ProvisioningState::InProgress("Upgrading".to_string());
    for p in &mut snap.node_pools {
        p.target_version = Some(KubeVersion::parse(to).unwrap());
        p.provisioning_state = ProvisioningState::InProgress("Upgrading".to_string());
    }
    snap
}

/// Records every command line and answers from substring-matched rules.
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn respond_with(&self, pattern: &str, output: CommandOutput) {
        self.rules.lock().unwrap().push((pattern.to_string(), output));
    }

    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.respond_with(
            pattern,
            CommandOutput {
                code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn fail(&self, pattern: &str, stderr: &str) {
        self.respond_with(
            pattern,
            CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _cwd: Option<PathBuf>,
    ) -> Result<CommandOutput> {
        let line = format!("{program} {}", args.join(" "));
        self.calls.lock().unwrap().push(line.clone());

        let rules = self.rules.lock().unwrap();
        Ok(rules
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or(CommandOutput {
                code: Some(0),
                stdout: "{}".to_string(),
                stderr: String::new(),
            }))
    }
}

/// Scripted cluster: each capture pops the next entry, the last one repeats.
pub struct FakeCluster {
    script: Mutex<VecDeque<Result<ClusterHealthSnapshot, String>>>,
    last: Mutex<Option<ClusterHealthSnapshot>>,
    captures: AtomicUsize,
    samples: AtomicUsize,
    pub extended: Mutex<ExtendedHealth>,
}

impl FakeCluster {
    pub fn new<I>(snapshots: I) -> Self
    where
        I: IntoIterator<Item = ClusterHealthSnapshot>,
    {
        Self::scripted(snapshots.into_iter().map(Ok))
    }

    /// `Err` entries surface as transient Kubernetes API errors.
    pub fn scripted<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Result<ClusterHealthSnapshot, String>>,
    {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            captures: AtomicUsize::new(0),
            samples: AtomicUsize::new(0),
            extended: Mutex::new(ExtendedHealth {
                dns_ready_endpoints: 2,
                ..Default::default()
            }),
        }
    }

    /// Every scripted read, full captures and progress samples alike.
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterQuery for FakeCluster {
    async fn capture(&self) -> Result<ClusterHealthSnapshot> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(snap)) => {
                *self.last.lock().unwrap() = Some(snap.clone());
                Ok(ClusterHealthSnapshot {
                    captured_at: Utc::now(),
                    ..snap
                })
            }
            Some(Err(msg)) => Err(AkupError::KubernetesApi(msg).into()),
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("fake cluster has no snapshots")),
        }
    }

    async fn sample(&self) -> Result<ClusterHealthSnapshot> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        self.capture().await
    }

    async fn extended_health(&self) -> Result<ExtendedHealth> {
        Ok(self.extended.lock().unwrap().clone())
    }
}

/// Backend that counts calls and optionally fails or delays `apply`.
pub struct FakeBackend {
    kind: BackendKind,
    apply_error: Option<String>,
    apply_delay: Duration,
    pub plan_calls: AtomicUsize,
    pub apply_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            apply_error: None,
            apply_delay: Duration::ZERO,
            plan_calls: AtomicUsize::new(0),
            apply_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(kind: BackendKind, output: &str) -> Self {
        Self {
            apply_error: Some(output.to_string()),
            ..Self::new(kind)
        }
    }

    /// Accepts the call only after `delay`, like a Terraform init and plan.
    pub fn slow(kind: BackendKind, delay: Duration) -> Self {
        Self {
            apply_delay: delay,
            ..Self::new(kind)
        }
    }

    pub fn applies(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn plans(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn plan(&self, plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Result<PlanDiff> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        Ok(PlanDiff {
            backend: Some(self.kind),
            entries: crate::backend::DesiredState::compose(plan, snapshot).diff(snapshot),
            commands: Vec::new(),
        })
    }

    async fn apply(&self, plan: &UpgradePlan, _snapshot: &ClusterHealthSnapshot) -> Result<BackendHandle> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        if let Some(output) = &self.apply_error {
            return Err(AkupError::backend(&self.kind.to_string(), output).into());
        }
        Ok(BackendHandle {
            backend: self.kind,
            operation: format!("fake upgrade to {}", plan.target_version()),
            issued_at: Utc::now(),
        })
    }

    async fn query_state(&self) -> Result<BackendState> {
        Ok(BackendState {
            backend: self.kind,
            provisioning_state: ProvisioningState::Succeeded,
            control_plane_version: "unknown".to_string(),
        })
    }
}
