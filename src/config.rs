//! CLI configuration and argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use crate::cluster::ClusterTarget;
use crate::error::AkupError;
use crate::output::OutputFormat;
use crate::upgrade::BackendKind;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Platform services that must stay healthy across an upgrade.
pub const DEFAULT_CRITICAL_SERVICES: [&str; 3] = [
    "ingress-nginx/ingress-nginx-controller",
    "argocd/argocd-server",
    "kube-system/coredns",
];

/// AKS cluster upgrade orchestrator.
///
/// Gates control plane, node pool and node image upgrades behind preflight
/// checks, holds a per-cluster lease while an upgrade is live, and validates
/// the cluster once the control plane reports a terminal state.
#[derive(Parser, Debug, Clone)]
#[command(name = "akup")]
#[command(about = "AKS cluster upgrade orchestrator")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Environment identifier (dev, staging, prod)
    #[arg(short, long = "env", env = "AKUP_ENV", global = true)]
    pub environment: Option<String>,

    /// Project prefix used to derive resource names
    #[arg(long, default_value = "aks-platform", env = "AKUP_PROJECT", global = true)]
    pub project: String,

    /// Cluster name [default: <project>-<env>-aks]
    #[arg(long, global = true)]
    pub cluster_name: Option<String>,

    /// Resource group [default: <project>-<env>-rg]
    #[arg(long, global = true)]
    pub resource_group: Option<String>,

    /// Azure subscription id or name
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", global = true)]
    pub subscription: Option<String>,

    /// Kubeconfig context [default: current context]
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "human", global = true)]
    pub output: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "AKUP_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Directory for leases and run artifacts
    #[arg(long, default_value = ".akup", env = "AKUP_STATE_DIR", global = true)]
    pub state_dir: PathBuf,

    /// Where run leases are kept
    #[arg(long, value_enum, default_value = "file", global = true)]
    pub lease_backend: LeaseBackend,

    /// Where run artifacts are written
    #[arg(long, value_enum, default_value = "file", global = true)]
    pub artifact_sink: ArtifactSink,

    /// Storage account for the blob artifact sink
    #[arg(long, env = "AKUP_BLOB_ACCOUNT", global = true)]
    pub blob_account: Option<String>,

    /// Container for the blob artifact sink
    #[arg(long, env = "AKUP_BLOB_CONTAINER", global = true)]
    pub blob_container: Option<String>,

    /// Terraform root for the declarative backend
    #[arg(long, default_value = "terraform", global = true)]
    pub terraform_dir: PathBuf,

    /// Skip confirmation prompts
    #[arg(short, long, default_value = "false", global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LeaseBackend {
    /// Lease files under the state directory
    #[default]
    File,
    /// coordination.k8s.io Lease in kube-system
    Kubernetes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ArtifactSink {
    #[default]
    File,
    /// Azure Blob Storage, staged under the state directory
    Blob,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run preflight checks without changing anything
    Preflight(PreflightArgs),
    /// Upgrade the cluster
    Upgrade(UpgradeArgs),
    /// Watch a run until the control plane reports a terminal state
    Monitor(MonitorArgs),
    /// Validate a run after its terminal state was observed
    Validate(ValidateArgs),
    /// Show the lease holder and a run summary
    Status(StatusArgs),
    /// Lease maintenance
    #[command(subcommand)]
    Lease(LeaseCommand),
}

/// Target and scope shared by `preflight` and `upgrade`.
#[derive(ClapArgs, Debug, Clone)]
pub struct PlanArgs {
    /// Target Kubernetes version (e.g., 1.31 or 1.31.2)
    #[arg(short, long)]
    pub target: String,

    /// control-plane, node-pool:<name>, node-image or full
    #[arg(short, long, default_value = "full")]
    pub scope: String,

    /// Per-pool surge override (format: POOL=VALUE, e.g., user=50%)
    #[arg(long = "surge", value_name = "POOL=VALUE")]
    pub surge: Vec<String>,

    /// Failing pods tolerated by workload health
    #[arg(long, default_value = "5")]
    pub max_failing_pods: usize,

    /// Critical deployment as NAMESPACE/NAME (repeatable, replaces the defaults)
    #[arg(long = "critical-service", value_name = "NAMESPACE/NAME")]
    pub critical_services: Vec<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PreflightArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Backend the plan would use
    #[arg(long, value_enum, default_value = "declarative")]
    pub backend: BackendKind,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct UpgradeArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Execution backend
    #[arg(long, value_enum)]
    pub backend: BackendKind,

    /// Show the effective diff without executing
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Run only the version skew check before executing
    #[arg(long, default_value = "false")]
    pub skip_preflight: bool,

    /// Proceed despite a NO-GO health preflight (version skew is never overridable)
    #[arg(long, default_value = "false")]
    pub force: bool,

    /// Finish the run on terminal success without post-validation
    #[arg(long, default_value = "false")]
    pub skip_validation: bool,

    /// Add DNS, storage, route and certificate checks to post-validation
    #[arg(long, default_value = "false")]
    pub extended_validation: bool,

    /// Do not write cluster snapshots as artifacts
    #[arg(long, default_value = "false")]
    pub no_snapshot_backup: bool,

    /// Exit after the backend accepted the upgrade; finish with `monitor` and `validate`
    #[arg(long, default_value = "false")]
    pub detach: bool,

    #[command(flatten)]
    pub monitor: MonitorTiming,

    /// How long an upgraded node may stay NotReady
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    pub node_grace: Duration,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct MonitorTiming {
    /// Interval between samples (e.g., 30s, 1m)
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// Give up waiting after this long (e.g., 90m, 2h)
    #[arg(long, default_value = "90m", value_parser = parse_duration)]
    pub max_duration: Duration,

    /// Consecutive identical terminal samples required (minimum 2)
    #[arg(long, default_value = "2")]
    pub stable_samples: u32,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct MonitorArgs {
    /// Run to observe
    #[arg(long)]
    pub run_id: String,

    #[command(flatten)]
    pub timing: MonitorTiming,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ValidateArgs {
    /// Run to validate
    #[arg(long)]
    pub run_id: String,

    /// Add DNS, storage, route and certificate checks
    #[arg(long, default_value = "false")]
    pub extended_validation: bool,

    /// How long an upgraded node may stay NotReady
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    pub node_grace: Duration,

    /// Failing pods tolerated by workload health
    #[arg(long, default_value = "5")]
    pub max_failing_pods: usize,

    /// Critical deployment as NAMESPACE/NAME (repeatable, replaces the defaults)
    #[arg(long = "critical-service", value_name = "NAMESPACE/NAME")]
    pub critical_services: Vec<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct StatusArgs {
    /// Run to show [default: latest run for the cluster]
    #[arg(long)]
    pub run_id: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum LeaseCommand {
    /// Release a lease left behind by a crashed orchestrator
    Release(LeaseReleaseArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LeaseReleaseArgs {
    /// Only release if this run holds the lease
    #[arg(long, required_unless_present = "force")]
    pub run_id: Option<String>,

    /// Release whoever holds the lease
    #[arg(long, default_value = "false")]
    pub force: bool,
}

/// Parse `30s`, `10m`, `2h` or bare seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let (digits, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => input.split_at(idx),
        None => (input, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{input}' (expected e.g. 30s, 10m, 2h)"))?;

    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => return Err(format!("unknown duration unit '{other}' in '{input}'")),
    };
    if secs == 0 {
        return Err(format!("duration '{input}' must be positive"));
    }
    Ok(Duration::from_secs(secs))
}

/// Where artifacts go, resolved from the sink flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    File,
    Blob { account: String, container: String },
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub cluster: ClusterTarget,
    pub subscription: Option<String>,
    pub context: Option<String>,
    pub output: OutputFormat,
    pub log_level: String,
    pub log_format: LogFormat,
    pub state_dir: PathBuf,
    pub lease_backend: LeaseBackend,
    pub sink: SinkConfig,
    pub terraform_dir: PathBuf,
    pub yes: bool,
    pub command: Command,
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Result<Self, AkupError> {
        let environment = args.environment.ok_or_else(|| {
            AkupError::InvalidArgument("--env is required (or set AKUP_ENV)".to_string())
        })?;

        let sink = match args.artifact_sink {
            ArtifactSink::File => SinkConfig::File,
            ArtifactSink::Blob => match (args.blob_account, args.blob_container) {
                (Some(account), Some(container)) => SinkConfig::Blob { account, container },
                _ => {
                    return Err(AkupError::InvalidArgument(
                        "--artifact-sink blob requires --blob-account and --blob-container"
                            .to_string(),
                    ));
                }
            },
        };

        if let Command::Upgrade(ref up) = args.command
            && args.output == OutputFormat::Json
            && !up.dry_run
            && !args.yes
        {
            return Err(AkupError::InvalidArgument(
                "--output json cannot prompt for confirmation; pass --yes".to_string(),
            ));
        }

        Ok(Self {
            cluster: ClusterTarget::resolve(
                &args.project,
                &environment,
                args.cluster_name.as_deref(),
                args.resource_group.as_deref(),
            ),
            subscription: args.subscription,
            context: args.context,
            output: args.output,
            log_level: args.log_level,
            log_format: args.log_format,
            state_dir: args.state_dir,
            lease_backend: args.lease_backend,
            sink,
            terraform_dir: args.terraform_dir,
            yes: args.yes,
            command: args.command,
        })
    }

    /// Critical services for a command: explicit ones, else the defaults.
    pub fn critical_services(&self) -> Vec<String> {
        let explicit = match &self.command {
            Command::Preflight(p) => p.plan.critical_services.as_slice(),
            Command::Upgrade(u) => u.plan.critical_services.as_slice(),
            Command::Validate(v) => v.critical_services.as_slice(),
            _ => &[],
        };
        if explicit.is_empty() {
            DEFAULT_CRITICAL_SERVICES.iter().map(|s| (*s).to_string()).collect()
        } else {
            explicit.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, AkupError> {
        let mut argv = vec!["akup"];
        argv.extend_from_slice(args);
        Config::from_args(Args::parse_from(argv))
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn test_upgrade_args_and_defaults() {
        let config = parse(&[
            "--env", "prod", "upgrade", "--target", "1.31", "--scope", "node-pool:user",
            "--backend", "imperative", "--surge", "user=50%", "--poll-interval", "15s",
        ])
        .unwrap();

        assert_eq!(config.cluster.name, "aks-platform-prod-aks");
        assert_eq!(config.cluster.resource_group, "aks-platform-prod-rg");
        assert_eq!(config.state_dir, PathBuf::from(".akup"));
        assert_eq!(config.sink, SinkConfig::File);
        match &config.command {
            Command::Upgrade(up) => {
                assert_eq!(up.plan.target, "1.31");
                assert_eq!(up.backend, BackendKind::Imperative);
                assert_eq!(up.plan.surge, vec!["user=50%".to_string()]);
                assert_eq!(up.monitor.poll_interval, Duration::from_secs(15));
                assert_eq!(up.monitor.max_duration, Duration::from_secs(90 * 60));
                assert_eq!(up.node_grace, Duration::from_secs(600));
                assert!(!up.detach);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(config.critical_services().len(), 3);
    }

    #[test]
    fn test_env_is_required() {
        let err = parse(&["status"]).unwrap_err();
        assert!(matches!(err, AkupError::InvalidArgument(_)));
    }

    #[test]
    fn test_blob_sink_requires_location() {
        let err = parse(&["--env", "dev", "--artifact-sink", "blob", "status"]).unwrap_err();
        assert!(err.to_string().contains("--blob-account"));

        let config = parse(&[
            "--env", "dev", "--artifact-sink", "blob", "--blob-account", "akupstate",
            "--blob-container", "runs", "status",
        ])
        .unwrap();
        assert_eq!(
            config.sink,
            SinkConfig::Blob {
                account: "akupstate".into(),
                container: "runs".into()
            }
        );
    }

    #[test]
    fn test_json_upgrade_requires_yes() {
        let args = ["--env", "dev", "-o", "json", "upgrade", "-t", "1.31", "--backend", "declarative"];
        assert!(parse(&args).is_err());

        let mut with_yes = args.to_vec();
        with_yes.insert(0, "--yes");
        assert!(parse(&with_yes).is_ok());

        let mut dry = args.to_vec();
        dry.push("--dry-run");
        assert!(parse(&dry).is_ok());
    }

    #[test]
    fn test_critical_service_override() {
        let config = parse(&[
            "--env", "dev", "preflight", "-t", "1.31", "--critical-service", "istio-system/istiod",
        ])
        .unwrap();
        assert_eq!(config.critical_services(), vec!["istio-system/istiod".to_string()]);
    }

    #[test]
    fn test_lease_release_needs_run_id_or_force() {
        let argv = ["akup", "--env", "dev", "lease", "release"];
        assert!(Args::try_parse_from(argv).is_err());
        let argv = ["akup", "--env", "dev", "lease", "release", "--force"];
        assert!(Args::try_parse_from(argv).is_ok());
    }
}
