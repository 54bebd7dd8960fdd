//! akup - AKS cluster upgrade orchestrator.
//!
//! Upgrades the control plane, node pools or node images of an AKS cluster:
//! - Preflight gating (version skew, node and workload health, PDBs, quota)
//! - Declarative (Terraform) or imperative (Azure CLI) execution
//! - One live run per cluster, guarded by a lease
//! - Progress monitoring with stable terminal detection
//! - Post-upgrade validation

mod azure;
mod backend;
mod cluster;
mod config;
mod error;
mod k8s;
mod lease;
mod monitor;
mod output;
mod preflight;
mod report;
mod store;
mod upgrade;
mod validate;
mod version;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use azure::{AzCli, ProcessRunner};
use cluster::ClusterQuery;
use cluster::live::LiveCluster;
use config::{
    Args, Command, Config, LeaseBackend, LeaseCommand, LeaseReleaseArgs, LogFormat, MonitorArgs,
    PlanArgs, PreflightArgs, SinkConfig, StatusArgs, UpgradeArgs, ValidateArgs,
};
use error::{AkupError, ExitStatus, exit_status_of};
use lease::LeaseStore;
use lease::file::FileLeaseStore;
use lease::kubernetes::KubeLeaseStore;
use monitor::{MonitorOptions, MonitorVerdict, ProgressMonitor};
use output::{OutputFormat, TerminalObserver, print_json};
use preflight::{PreflightOptions, PreflightValidator};
use report::Decision;
use store::{ArtifactStore, BlobArtifactStore, FileArtifactStore};
use upgrade::{
    BackendKind, Executor, ExecutorDeps, ExecutorOptions, RunObserver, RunOptions, RunPhase,
    UpgradePlan, UpgradePlanBuilder, UpgradeRun,
};
use validate::ValidationOptions;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_status().code());
        }
    };

    // Initialize logging
    if let Err(e) = init_tracing(&config.log_level, config.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(ExitStatus::PreflightNoGo.code());
    }

    debug!(
        "Starting akup v{} (commit: {}, build: {})",
        config::VERSION,
        config::COMMIT,
        config::BUILD_DATE
    );

    let status = match run(&config).await {
        Ok(status) => status,
        Err(e) => {
            error!("{:#}", e);
            exit_status_of(&e)
        }
    };
    std::process::exit(status.code());
}

/// Initialize tracing subscriber. Logs go to stderr; stdout carries results.
fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    match format {
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .init(),
    }

    Ok(())
}

/// Main application logic.
async fn run(config: &Config) -> Result<ExitStatus> {
    match &config.command {
        Command::Preflight(args) => run_preflight(config, args).await,
        Command::Upgrade(args) => run_upgrade(config, args).await,
        Command::Monitor(args) => run_monitor(config, args).await,
        Command::Validate(args) => run_validate(config, args).await,
        Command::Status(args) => run_status(config, args).await,
        Command::Lease(LeaseCommand::Release(args)) => run_lease_release(config, args).await,
    }
}

fn az(config: &Config) -> AzCli {
    AzCli::new(Arc::new(ProcessRunner), config.subscription.clone())
}

async fn live_cluster(config: &Config) -> Result<Arc<dyn ClusterQuery>> {
    let client = k8s::client::build_client(config.context.as_deref()).await?;
    info!(
        "Using cluster {} (context: {})",
        config.cluster,
        k8s::client::current_context(config.context.as_deref())
    );
    Ok(Arc::new(LiveCluster::new(
        client,
        az(config),
        config.cluster.clone(),
        config.critical_services(),
    )))
}

async fn lease_store(config: &Config) -> Result<Arc<dyn LeaseStore>> {
    Ok(match config.lease_backend {
        LeaseBackend::File => Arc::new(FileLeaseStore::new(&config.state_dir)),
        LeaseBackend::Kubernetes => {
            let client = k8s::client::build_client(config.context.as_deref()).await?;
            Arc::new(KubeLeaseStore::new(client))
        }
    })
}

fn artifact_store(config: &Config) -> Arc<dyn ArtifactStore> {
    match &config.sink {
        SinkConfig::File => Arc::new(FileArtifactStore::new(&config.state_dir)),
        SinkConfig::Blob { account, container } => Arc::new(BlobArtifactStore::new(
            &config.state_dir,
            az(config),
            account.clone(),
            container.clone(),
        )),
    }
}

async fn executor(
    config: &Config,
    kind: BackendKind,
    options: ExecutorOptions,
) -> Result<Executor> {
    let deps = ExecutorDeps {
        cluster: live_cluster(config).await?,
        backend: backend::create(kind, &config.cluster, az(config), config.terraform_dir.clone()),
        leases: lease_store(config).await?,
        store: artifact_store(config),
    };
    Ok(Executor::new(deps, options))
}

fn build_plan(config: &Config, args: &PlanArgs, backend: BackendKind, dry_run: bool) -> Result<UpgradePlan> {
    Ok(UpgradePlanBuilder::new(config.cluster.clone(), args.target.clone())
        .scope(args.scope.clone())
        .backend(backend)
        .surge(args.surge.iter().cloned())
        .dry_run(dry_run)
        .build()?)
}

/// Cancel on the first Ctrl-C. A second one exits; the operation itself
/// keeps running in the control plane either way.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if child.is_cancelled() {
                std::process::exit(ExitStatus::AmbiguousTimeout.code());
            }
            warn!("Interrupted; stopping observation. Press Ctrl-C again to exit immediately");
            child.cancel();
        }
    });
    token
}

fn print_run(config: &Config, run: &UpgradeRun) -> Result<()> {
    match config.output {
        OutputFormat::Human => output::print_run(run),
        OutputFormat::Json => print_json(&json!({ "run": run.record() }))?,
    }
    Ok(())
}

async fn run_preflight(config: &Config, args: &PreflightArgs) -> Result<ExitStatus> {
    let plan = build_plan(config, &args.plan, args.backend, true)?;
    let cluster = live_cluster(config).await?;

    let options = PreflightOptions {
        max_failing_pods: args.plan.max_failing_pods,
        skip_health_checks: false,
    };
    let outcome = PreflightValidator::new(cluster.as_ref(), options)
        .assess(&plan, false)
        .await?;

    match config.output {
        OutputFormat::Human => output::print_preflight(&outcome),
        OutputFormat::Json => print_json(&json!({
            "cluster": config.cluster,
            "target": plan.target_version().to_string(),
            "scope": plan.scope(),
            "decision": outcome.decision,
            "failed_checks": outcome.report.failed_labels(),
            "report": outcome.report,
        }))?,
    }

    Ok(match outcome.decision {
        Decision::Go => ExitStatus::Success,
        Decision::NoGo => ExitStatus::PreflightNoGo,
    })
}

async fn run_upgrade(config: &Config, args: &UpgradeArgs) -> Result<ExitStatus> {
    let plan = build_plan(config, &args.plan, args.backend, args.dry_run)?;

    let options = ExecutorOptions {
        preflight: PreflightOptions {
            max_failing_pods: args.plan.max_failing_pods,
            skip_health_checks: args.skip_preflight,
        },
        monitor: MonitorOptions::new(
            args.monitor.poll_interval,
            args.monitor.max_duration,
            args.monitor.stable_samples,
        ),
        validation: ValidationOptions {
            node_grace: args.node_grace,
            max_failing_pods: args.plan.max_failing_pods,
            extended: args.extended_validation,
        },
        detach: args.detach,
    };
    let run_options = RunOptions {
        skip_preflight: args.skip_preflight,
        force: args.force,
        skip_validation: args.skip_validation,
        extended_validation: args.extended_validation,
        no_snapshot_backup: args.no_snapshot_backup,
    };

    let executor = executor(config, args.backend, options).await?;
    let mut observer = TerminalObserver::new(config.output, config.yes);
    let outcome = executor
        .execute(plan, run_options, cancel_on_ctrl_c(), &mut observer)
        .await?;

    match config.output {
        OutputFormat::Human => output::print_run(&outcome.run),
        OutputFormat::Json => print_json(&json!({
            "run": outcome.run.record(),
            "diff": outcome.diff,
        }))?,
    }

    if let Some(e) = outcome.error() {
        error!("{}", e);
    }
    Ok(outcome.exit_status())
}

async fn run_monitor(config: &Config, args: &MonitorArgs) -> Result<ExitStatus> {
    let store = artifact_store(config);
    let mut run = store.load_run(&args.run_id).await?;

    let monitor_options = MonitorOptions::new(
        args.timing.poll_interval,
        args.timing.max_duration,
        args.timing.stable_samples,
    );
    let options = ExecutorOptions {
        monitor: monitor_options,
        ..Default::default()
    };
    let executor = executor(config, run.plan().backend(), options).await?;

    let monitor = ProgressMonitor::new(live_cluster(config).await?, monitor_options);
    info!(
        "Monitoring run {} every {}s for up to {} min",
        run.id(),
        monitor.options().poll_interval.as_secs(),
        monitor.options().max_duration.as_secs() / 60
    );
    let events = monitor
        .observe(&args.run_id, store.as_ref(), cancel_on_ctrl_c())
        .await?;
    let mut observer = TerminalObserver::for_plan(config.output, run.plan().clone());
    let verdict = monitor::drive(events, |event| observer.monitor_event(event)).await;

    executor.complete(&mut run, &verdict, false).await?;
    if config.output == OutputFormat::Human {
        output::print_run(&run);
    }

    Ok(match verdict {
        MonitorVerdict::Succeeded { .. } => ExitStatus::Success,
        MonitorVerdict::Failed { .. } => ExitStatus::ExecutionFailure,
        MonitorVerdict::TimedOut { .. } | MonitorVerdict::Cancelled => {
            error!(
                "{}",
                AkupError::TimeoutAmbiguous {
                    run_id: run.id().to_string(),
                    elapsed_secs: (chrono::Utc::now() - run.started_at).num_seconds().max(0) as u64,
                }
            );
            ExitStatus::AmbiguousTimeout
        }
    })
}

async fn run_validate(config: &Config, args: &ValidateArgs) -> Result<ExitStatus> {
    let store = artifact_store(config);
    let mut run = store.load_run(&args.run_id).await?;

    let options = ExecutorOptions {
        validation: ValidationOptions {
            node_grace: args.node_grace,
            max_failing_pods: args.max_failing_pods,
            extended: args.extended_validation,
        },
        ..Default::default()
    };
    let executor = executor(config, run.plan().backend(), options).await?;
    let report = executor.validate_run(&mut run).await?;

    match config.output {
        OutputFormat::Human => {
            output::print_report("Post-upgrade validation", &report);
            println!();
            println!("Run {}: {}", run.id(), output::phase_label(run.phase()));
        }
        OutputFormat::Json => print_json(&json!({
            "run_id": run.id(),
            "phase": run.phase(),
            "report": report,
        }))?,
    }

    if report.has_failures() || run.phase() == RunPhase::FailedPostValidation {
        error!("{}", AkupError::PostValidationFailure(report.failed_names()));
        return Ok(ExitStatus::PostValidationFailure);
    }
    Ok(ExitStatus::Success)
}

async fn run_status(config: &Config, args: &StatusArgs) -> Result<ExitStatus> {
    let key = config.cluster.key();
    let leases = lease_store(config).await?;
    let store = artifact_store(config);

    let lease = leases.current(&key).await?;
    let run = match &args.run_id {
        Some(id) => Some(store.load_run(id).await?),
        None => store.latest_run(&key).await?,
    };

    match config.output {
        OutputFormat::Human => output::print_status(
            &config.cluster,
            (leases.name(), store.name()),
            lease.as_ref(),
            run.as_ref(),
        ),
        OutputFormat::Json => print_json(&json!({
            "cluster": config.cluster,
            "lease_store": leases.name(),
            "artifact_store": store.name(),
            "lease": lease,
            "run": run.as_ref().map(UpgradeRun::record),
        }))?,
    }
    Ok(ExitStatus::Success)
}

async fn run_lease_release(config: &Config, args: &LeaseReleaseArgs) -> Result<ExitStatus> {
    let key = config.cluster.key();
    let leases = lease_store(config).await?;

    let released = if args.force {
        warn!("Force-releasing lease for {}", key);
        leases.force_release(&key).await?
    } else {
        match leases.current(&key).await? {
            Some(lease) if args.run_id.as_deref() == Some(lease.holder.as_str()) => {
                leases.release(&lease).await?;
                Some(lease)
            }
            Some(lease) => {
                return Err(AkupError::LeaseConflict {
                    cluster: key,
                    holder: lease.holder,
                    acquired_at: lease.acquired_at.to_rfc3339(),
                }
                .into());
            }
            None => None,
        }
    };

    match config.output {
        OutputFormat::Human => match &released {
            Some(lease) => println!("Released lease for {} held by run {}", key, lease.holder),
            None => println!("No lease held for {}", key),
        },
        OutputFormat::Json => print_json(&json!({ "cluster_key": key, "released": released }))?,
    }

    // A released run that never saw a terminal state stays on record as such.
    if let Some(lease) = &released
        && let Ok(run) = artifact_store(config).load_run(&lease.holder).await
        && !run.phase().is_terminal()
    {
        print_run(config, &run)?;
    }

    Ok(ExitStatus::Success)
}
