//! Upgrade plan construction and validation.
//!
//! A plan is built once from caller input through [`UpgradePlanBuilder`] and is
//! read-only afterwards: fields are private and only exposed through getters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterHealthSnapshot, ClusterTarget, NodePoolState, PoolMode};
use crate::error::AkupError;
use crate::version::KubeVersion;

/// Estimated minutes for a control plane upgrade.
const CONTROL_PLANE_MINUTES: u64 = 10;
/// Estimated minutes per node pool rolling upgrade.
const NODE_POOL_MINUTES: u64 = 20;

/// What part of the cluster a plan changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UpgradeScope {
    ControlPlane,
    NodePool(String),
    NodeImage,
    Full,
}

impl UpgradeScope {
    /// Whether the control plane version changes.
    pub const fn includes_control_plane(&self) -> bool {
        matches!(self, Self::ControlPlane | Self::Full)
    }

    /// Names of the pools this scope rolls, given the current pool set.
    pub fn pools_in_scope(&self, snapshot: &ClusterHealthSnapshot) -> Vec<String> {
        match self {
            Self::ControlPlane => Vec::new(),
            Self::NodePool(name) => vec![name.clone()],
            Self::NodeImage | Self::Full => {
                snapshot.node_pools.iter().map(|p| p.name.clone()).collect()
            }
        }
    }
}

impl FromStr for UpgradeScope {
    type Err = AkupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "control-plane" => Ok(Self::ControlPlane),
            "node-image" => Ok(Self::NodeImage),
            "full" => Ok(Self::Full),
            other => match other.strip_prefix("node-pool:") {
                Some(name) if !name.is_empty() => Ok(Self::NodePool(name.to_string())),
                _ => Err(AkupError::InvalidScope(s.to_string())),
            },
        }
    }
}

impl TryFrom<String> for UpgradeScope {
    type Error = AkupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UpgradeScope> for String {
    fn from(value: UpgradeScope) -> Self {
        value.to_string()
    }
}

impl fmt::Display for UpgradeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::NodePool(name) => write!(f, "node-pool:{name}"),
            Self::NodeImage => write!(f, "node-image"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Which execution backend applies the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Terraform: compose desired state and apply.
    Declarative,
    /// Azure CLI: scoped direct mutation calls.
    Imperative,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declarative => write!(f, "declarative"),
            Self::Imperative => write!(f, "imperative"),
        }
    }
}

/// Rolling upgrade surge for one pool: a node count or a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SurgePolicy {
    Count(u32),
    Percent(u32),
}

impl SurgePolicy {
    /// Conservative for the system pool, wider for user and accelerator pools.
    pub const fn default_for(pool: &NodePoolState) -> Self {
        match pool.mode {
            PoolMode::System => Self::Count(1),
            PoolMode::User => Self::Percent(33),
        }
    }

    /// Extra nodes added per wave for a pool of `node_count` nodes. Never below one.
    pub fn surge_nodes(&self, node_count: u32) -> u32 {
        let nodes = match *self {
            Self::Count(n) => n,
            Self::Percent(p) => (u64::from(p) * u64::from(node_count)).div_ceil(100) as u32,
        };
        nodes.max(1)
    }
}

impl FromStr for SurgePolicy {
    type Err = AkupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || AkupError::InvalidSurge(s.to_string());

        if let Some(pct) = s.strip_suffix('%') {
            let value: u32 = pct.parse().map_err(|_| invalid())?;
            if value == 0 || value > 100 {
                return Err(invalid());
            }
            Ok(Self::Percent(value))
        } else {
            let value: u32 = s.parse().map_err(|_| invalid())?;
            if value == 0 {
                return Err(invalid());
            }
            Ok(Self::Count(value))
        }
    }
}

impl TryFrom<String> for SurgePolicy {
    type Error = AkupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SurgePolicy> for String {
    fn from(value: SurgePolicy) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SurgePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::Percent(p) => write!(f, "{p}%"),
        }
    }
}

/// A validated, frozen upgrade plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradePlan {
    cluster: ClusterTarget,
    target_version: KubeVersion,
    scope: UpgradeScope,
    backend: BackendKind,
    surge_overrides: BTreeMap<String, SurgePolicy>,
    dry_run: bool,
}

impl UpgradePlan {
    pub const fn cluster(&self) -> &ClusterTarget {
        &self.cluster
    }

    pub const fn target_version(&self) -> &KubeVersion {
        &self.target_version
    }

    pub const fn scope(&self) -> &UpgradeScope {
        &self.scope
    }

    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    pub const fn surge_overrides(&self) -> &BTreeMap<String, SurgePolicy> {
        &self.surge_overrides
    }

    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Effective surge for a pool: the override, else the mode default.
    pub fn surge_for(&self, pool: &NodePoolState) -> SurgePolicy {
        self.surge_overrides
            .get(&pool.name)
            .copied()
            .unwrap_or_else(|| SurgePolicy::default_for(pool))
    }

    /// Components in scope that have not reached the plan's target yet.
    ///
    /// Empty means the scope's target is reached.
    pub fn unmet_targets(&self, snapshot: &ClusterHealthSnapshot) -> Vec<String> {
        let target = &self.target_version;
        let mut unmet = Vec::new();

        if self.scope.includes_control_plane() && snapshot.control_plane_version != *target {
            unmet.push(format!(
                "control plane at {} (want {target})",
                snapshot.control_plane_version
            ));
        }

        for name in self.scope.pools_in_scope(snapshot) {
            let Some(pool) = snapshot.pool(&name) else {
                unmet.push(format!("node pool {name} not found"));
                continue;
            };
            if self.scope == UpgradeScope::NodeImage {
                if !pool.node_image_current() {
                    unmet.push(format!(
                        "node pool {name} image {} (latest {})",
                        pool.node_image_version.as_deref().unwrap_or("unknown"),
                        pool.latest_node_image_version.as_deref().unwrap_or("unknown")
                    ));
                }
            } else if pool.current_version != *target || pool.target_version.is_some() {
                unmet.push(format!(
                    "node pool {name} at {} (want {target})",
                    pool.current_version
                ));
            }
        }

        unmet
    }

    /// Estimated duration in minutes.
    pub fn estimated_minutes(&self, snapshot: &ClusterHealthSnapshot) -> u64 {
        let cp = if self.scope.includes_control_plane() {
            CONTROL_PLANE_MINUTES
        } else {
            0
        };
        cp + self.scope.pools_in_scope(snapshot).len() as u64 * NODE_POOL_MINUTES
    }
}

/// Builds an [`UpgradePlan`] from raw caller input.
#[derive(Debug, Clone)]
pub struct UpgradePlanBuilder {
    cluster: ClusterTarget,
    target: String,
    scope: String,
    backend: BackendKind,
    surge: Vec<String>,
    dry_run: bool,
}

impl UpgradePlanBuilder {
    pub fn new(cluster: ClusterTarget, target: impl Into<String>) -> Self {
        Self {
            cluster,
            target: target.into(),
            scope: "full".to_string(),
            backend: BackendKind::Declarative,
            surge: Vec::new(),
            dry_run: false,
        }
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub const fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Add `pool=value` surge overrides.
    pub fn surge<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.surge.extend(entries.into_iter().map(Into::into));
        self
    }

    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn build(self) -> Result<UpgradePlan, AkupError> {
        let target_version = KubeVersion::parse(&self.target)?;
        let scope: UpgradeScope = self.scope.parse()?;

        let mut surge_overrides = BTreeMap::new();
        for entry in &self.surge {
            let (pool, value) = entry
                .split_once('=')
                .filter(|(pool, _)| !pool.trim().is_empty())
                .ok_or_else(|| {
                    AkupError::InvalidSurge(format!("{entry} (expected POOL=VALUE)"))
                })?;
            surge_overrides.insert(pool.trim().to_string(), value.parse::<SurgePolicy>()?);
        }

        if scope == UpgradeScope::NodeImage && self.backend == BackendKind::Declarative {
            return Err(AkupError::InvalidPlan(
                "node-image scope requires the imperative backend".to_string(),
            ));
        }

        match &scope {
            UpgradeScope::ControlPlane if !surge_overrides.is_empty() => {
                return Err(AkupError::InvalidPlan(
                    "surge overrides do not apply to a control-plane scoped plan".to_string(),
                ));
            }
            UpgradeScope::NodePool(name) => {
                if let Some(other) = surge_overrides.keys().find(|k| *k != name) {
                    return Err(AkupError::InvalidPlan(format!(
                        "surge override for pool '{other}' is outside scope node-pool:{name}"
                    )));
                }
            }
            _ => {}
        }

        Ok(UpgradePlan {
            cluster: self.cluster,
            target_version,
            scope,
            backend: self.backend,
            surge_overrides,
            dry_run: self.dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool, snapshot};

    fn target() -> ClusterTarget {
        ClusterTarget::resolve("aks-platform", "dev", None, None)
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("control-plane".parse::<UpgradeScope>().unwrap(), UpgradeScope::ControlPlane);
        assert_eq!(
            "node-pool:user".parse::<UpgradeScope>().unwrap(),
            UpgradeScope::NodePool("user".into())
        );
        assert_eq!("full".parse::<UpgradeScope>().unwrap(), UpgradeScope::Full);
        assert!("node-pool:".parse::<UpgradeScope>().is_err());
        assert!("everything".parse::<UpgradeScope>().is_err());
    }

    #[test]
    fn test_surge_parse_and_nodes() {
        assert_eq!("1".parse::<SurgePolicy>().unwrap(), SurgePolicy::Count(1));
        assert_eq!("33%".parse::<SurgePolicy>().unwrap(), SurgePolicy::Percent(33));
        assert!("0".parse::<SurgePolicy>().is_err());
        assert!("150%".parse::<SurgePolicy>().is_err());
        assert!("abc".parse::<SurgePolicy>().is_err());

        assert_eq!(SurgePolicy::Percent(33).surge_nodes(3), 1);
        assert_eq!(SurgePolicy::Percent(33).surge_nodes(10), 4);
        assert_eq!(SurgePolicy::Percent(33).surge_nodes(0), 1);
        assert_eq!(SurgePolicy::Count(2).surge_nodes(10), 2);
    }

    #[test]
    fn test_default_surge_per_pool_mode() {
        let system = pool("system", PoolMode::System, "1.28.5", 3);
        let user = pool("user", PoolMode::User, "1.28.5", 3);
        assert_eq!(SurgePolicy::default_for(&system), SurgePolicy::Count(1));
        assert_eq!(SurgePolicy::default_for(&user), SurgePolicy::Percent(33));
    }

    #[test]
    fn test_builder_defaults_and_overrides() {
        let plan = UpgradePlanBuilder::new(target(), "1.29")
            .scope("full")
            .surge(["user=50%"])
            .build()
            .unwrap();

        assert_eq!(plan.target_version().to_string(), "1.29.0");
        assert_eq!(plan.backend(), BackendKind::Declarative);
        let user = pool("user", PoolMode::User, "1.28.5", 4);
        let system = pool("system", PoolMode::System, "1.28.5", 3);
        assert_eq!(plan.surge_for(&user), SurgePolicy::Percent(50));
        assert_eq!(plan.surge_for(&system), SurgePolicy::Count(1));
    }

    #[test]
    fn test_builder_rejects_bad_input() {
        assert!(matches!(
            UpgradePlanBuilder::new(target(), "latest").build(),
            Err(AkupError::InvalidVersion(_))
        ));
        assert!(matches!(
            UpgradePlanBuilder::new(target(), "1.29").surge(["user"]).build(),
            Err(AkupError::InvalidSurge(_))
        ));
        assert!(matches!(
            UpgradePlanBuilder::new(target(), "1.29")
                .scope("node-image")
                .backend(BackendKind::Declarative)
                .build(),
            Err(AkupError::InvalidPlan(_))
        ));
        assert!(matches!(
            UpgradePlanBuilder::new(target(), "1.29")
                .scope("control-plane")
                .surge(["user=1"])
                .build(),
            Err(AkupError::InvalidPlan(_))
        ));
        assert!(matches!(
            UpgradePlanBuilder::new(target(), "1.29")
                .scope("node-pool:user")
                .surge(["system=1"])
                .build(),
            Err(AkupError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_pools_in_scope() {
        let snap = snapshot("1.28.5", "1.28.5");
        assert!(UpgradeScope::ControlPlane.pools_in_scope(&snap).is_empty());
        assert_eq!(
            UpgradeScope::NodePool("user".into()).pools_in_scope(&snap),
            vec!["user".to_string()]
        );
        assert_eq!(UpgradeScope::Full.pools_in_scope(&snap).len(), 2);
    }

    #[test]
    fn test_estimated_minutes() {
        let snap = snapshot("1.28.5", "1.28.5");
        let full = UpgradePlanBuilder::new(target(), "1.29").build().unwrap();
        assert_eq!(full.estimated_minutes(&snap), 50);

        let cp = UpgradePlanBuilder::new(target(), "1.29")
            .scope("control-plane")
            .build()
            .unwrap();
        assert_eq!(cp.estimated_minutes(&snap), 10);
    }

    #[test]
    fn test_unmet_targets_per_scope() {
        let before = snapshot("1.28.5", "1.28.5");
        let after = snapshot("1.29.0", "1.29.0");
        let full = UpgradePlanBuilder::new(target(), "1.29.0").build().unwrap();
        assert_eq!(full.unmet_targets(&before).len(), 3);
        assert!(full.unmet_targets(&after).is_empty());

        // Control plane done, pools still behind: only a control-plane plan is satisfied.
        let cp_only = snapshot("1.29.0", "1.28.5");
        let cp = UpgradePlanBuilder::new(target(), "1.29.0")
            .scope("control-plane")
            .build()
            .unwrap();
        assert!(cp.unmet_targets(&cp_only).is_empty());
        assert_eq!(full.unmet_targets(&cp_only).len(), 2);

        let missing = UpgradePlanBuilder::new(target(), "1.29.0")
            .scope("node-pool:gpu")
            .build()
            .unwrap();
        assert_eq!(
            missing.unmet_targets(&after),
            vec!["node pool gpu not found".to_string()]
        );
    }

    #[test]
    fn test_plan_serde_roundtrip_keeps_scope_string() {
        let plan = UpgradePlanBuilder::new(target(), "1.29.0")
            .scope("node-pool:user")
            .backend(BackendKind::Imperative)
            .surge(["user=33%"])
            .build()
            .unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["scope"], "node-pool:user");
        assert_eq!(json["surge_overrides"]["user"], "33%");
        let back: UpgradePlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }
}
