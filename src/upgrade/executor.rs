//! Upgrade executor.
//!
//! Drives one run through its phases:
//!
//! ```text
//! Pending -> Preflight -> Aborted
//!                      -> Executing -> Monitoring -> Validating -> Succeeded
//!                                                              -> Failed-PostValidation
//!                                   -> Failed
//! ```
//!
//! The lease is taken before anything is read from the cluster and released
//! on every terminal phase. A run that stops observing without a terminal
//! signal keeps its lease: the operation is still owned by the control plane.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::plan::UpgradePlan;
use super::run::{BackendHandle, RunFailure, RunOptions, RunPhase, UpgradeRun};
use crate::backend::{Backend, PlanDiff};
use crate::cluster::ClusterQuery;
use crate::error::{AkupError, ExitStatus, FailureCategory};
use crate::lease::LeaseStore;
use crate::monitor::{MonitorEvent, MonitorOptions, MonitorVerdict, ProgressMonitor};
use crate::preflight::{PreflightOptions, PreflightOutcome, PreflightValidator};
use crate::report::ValidationReport;
use crate::store::{Artifact, ArtifactStore};
use crate::validate::{PostUpgradeValidator, ValidationOptions};

/// Collaborators of the executor.
pub struct ExecutorDeps {
    pub cluster: Arc<dyn ClusterQuery>,
    pub backend: Arc<dyn Backend>,
    pub leases: Arc<dyn LeaseStore>,
    pub store: Arc<dyn ArtifactStore>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorOptions {
    pub preflight: PreflightOptions,
    pub monitor: MonitorOptions,
    pub validation: ValidationOptions,
    /// Return once the backend accepted the call. The run stays `Monitoring`.
    pub detach: bool,
}

/// Hooks into a run for presentation and operator confirmation.
pub trait RunObserver {
    fn preflight(&mut self, _outcome: &PreflightOutcome) {}

    fn diff(&mut self, _run: &UpgradeRun, _diff: &PlanDiff) {}

    /// Last chance to stop before the mutating call.
    fn confirm(&mut self, _run: &UpgradeRun, _diff: &PlanDiff) -> Result<bool> {
        Ok(true)
    }

    fn monitor_event(&mut self, _event: &MonitorEvent) {}
}

/// Final state of an `execute` call.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: UpgradeRun,
    pub diff: Option<PlanDiff>,
    pub verdict: Option<MonitorVerdict>,
}

impl RunOutcome {
    /// The error this outcome reports to the caller, if any.
    pub fn error(&self) -> Option<AkupError> {
        let run = &self.run;
        match run.phase() {
            RunPhase::Aborted => Some(AkupError::ValidationFailure(
                run.preflight_report
                    .as_ref()
                    .map(ValidationReport::failed_names)
                    .unwrap_or_else(|| "preflight aborted".to_string()),
            )),
            RunPhase::Failed => {
                let failure = run.failure.as_ref();
                Some(AkupError::BackendInvocation {
                    backend: run.plan().backend().to_string(),
                    category: failure.map_or(FailureCategory::Other, |f| f.category),
                    message: failure.map_or_else(|| "run failed".to_string(), |f| f.message.clone()),
                })
            }
            RunPhase::FailedPostValidation => Some(AkupError::PostValidationFailure(
                run.post_report
                    .as_ref()
                    .map(ValidationReport::failed_names)
                    .unwrap_or_default(),
            )),
            RunPhase::Monitoring => match &self.verdict {
                Some(MonitorVerdict::TimedOut { elapsed }) => Some(AkupError::TimeoutAmbiguous {
                    run_id: run.id().to_string(),
                    elapsed_secs: elapsed.as_secs(),
                }),
                Some(MonitorVerdict::Cancelled) => Some(AkupError::TimeoutAmbiguous {
                    run_id: run.id().to_string(),
                    elapsed_secs: (chrono::Utc::now() - run.started_at).num_seconds().max(0) as u64,
                }),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.error()
            .map_or(ExitStatus::Success, |e| e.exit_status())
    }
}

pub struct Executor {
    deps: ExecutorDeps,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(deps: ExecutorDeps, options: ExecutorOptions) -> Self {
        Self { deps, options }
    }

    /// Run a plan end to end.
    ///
    /// Fails fast with `LeaseConflict` before reading anything from the cluster.
    /// Dry-runs take no lease and persist nothing.
    pub async fn execute(
        &self,
        plan: UpgradePlan,
        options: RunOptions,
        cancel: CancellationToken,
        observer: &mut dyn RunObserver,
    ) -> Result<RunOutcome> {
        if self.deps.backend.kind() != plan.backend() {
            return Err(AkupError::InvalidArgument(format!(
                "plan targets the {} backend but the executor was built with {}",
                plan.backend(),
                self.deps.backend.kind()
            ))
            .into());
        }

        let mut run = UpgradeRun::new(plan, options);
        info!(
            "Starting run {} ({} to {} via {} backend{})",
            run.id(),
            run.plan().scope(),
            run.plan().target_version(),
            run.plan().backend(),
            if run.is_dry_run() { ", dry-run" } else { "" }
        );

        if !run.is_dry_run() {
            let lease = self
                .deps
                .leases
                .acquire(&run.plan().cluster().key(), run.id())
                .await?;
            run.lease = Some(lease);
        }

        match self.drive(&mut run, cancel, observer).await {
            Ok((diff, verdict)) => Ok(RunOutcome { run, diff, verdict }),
            Err(e) => {
                // Nothing was issued, so nothing is left for the lease to protect.
                if run.backend_handle.is_none() {
                    self.release(&run).await;
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut UpgradeRun,
        cancel: CancellationToken,
        observer: &mut dyn RunObserver,
    ) -> Result<(Option<PlanDiff>, Option<MonitorVerdict>)> {
        run.transition(RunPhase::Preflight)?;

        let preflight_options = PreflightOptions {
            skip_health_checks: run.options.skip_preflight,
            ..self.options.preflight
        };
        let validator = PreflightValidator::new(self.deps.cluster.as_ref(), preflight_options);
        let outcome = validator.assess(run.plan(), run.options.force).await?;
        observer.preflight(&outcome);

        run.preflight_report = Some(outcome.report.clone());
        run.preflight_overridden = outcome.overridden;
        run.pre_snapshot = Some(outcome.snapshot.clone());

        let persist = !run.is_dry_run();
        if persist {
            self.deps
                .store
                .save_report(run.id(), Artifact::PreflightReport, &outcome.report)
                .await?;
            if !run.options.no_snapshot_backup {
                self.deps
                    .store
                    .save_snapshot(run.id(), Artifact::PreSnapshot, &outcome.snapshot)
                    .await?;
            }
        }

        if !outcome.may_proceed() {
            warn!(
                "Run {} aborted by preflight: {}",
                run.id(),
                outcome.report.failed_names()
            );
            run.transition(RunPhase::Aborted)?;
            if persist {
                self.deps.store.save_run(run).await?;
                self.release(run).await;
            }
            return Ok((None, None));
        }

        let diff = self.deps.backend.plan(run.plan(), &outcome.snapshot).await?;
        observer.diff(run, &diff);

        if run.is_dry_run() {
            info!(
                "Dry-run complete: {} change(s), backend not invoked",
                diff.entries.len()
            );
            run.transition(RunPhase::Succeeded)?;
            return Ok((Some(diff), None));
        }

        if !observer.confirm(run, &diff)? {
            run.transition(RunPhase::Aborted)?;
            self.deps.store.save_run(run).await?;
            return Err(AkupError::UserCancelled.into());
        }

        // Plan, lease and pre-snapshot are on disk before anything is mutated.
        run.transition(RunPhase::Executing)?;
        self.deps.store.save_run(run).await?;

        let plan = run.plan().clone();
        let pre = outcome.snapshot;
        info!("Invoking {} backend for run {}", self.deps.backend.kind(), run.id());

        if self.options.detach {
            match self.deps.backend.apply(&plan, &pre).await {
                Ok(handle) => {
                    self.accepted(run, handle).await?;
                    info!(
                        "Detached from run {}; follow with `akup monitor --run-id {}`",
                        run.id(),
                        run.id()
                    );
                }
                Err(e) => self.failed(run, &e).await?,
            }
            return Ok((Some(diff), None));
        }

        let monitor = ProgressMonitor::new(Arc::clone(&self.deps.cluster), self.options.monitor);
        let monitor_cancel = cancel.child_token();
        // Samples taken before the backend accepts the call are shown but never
        // decide the run. Acceptance starts a fresh stream with its own streak.
        let mut events = monitor.observe_plan(plan.clone(), monitor_cancel.clone());
        let mut watching = true;

        let apply = self.deps.backend.apply(&plan, &pre);
        tokio::pin!(apply);

        let mut accepted = false;
        let mut verdict = None;
        while !accepted || verdict.is_none() {
            tokio::select! {
                biased;

                result = &mut apply, if !accepted => match result {
                    Ok(handle) => {
                        self.accepted(run, handle).await?;
                        accepted = true;
                        events = monitor.observe_plan(plan.clone(), monitor_cancel.clone());
                        watching = true;
                    }
                    Err(e) => {
                        monitor_cancel.cancel();
                        self.failed(run, &e).await?;
                        return Ok((Some(diff), None));
                    }
                },
                event = events.next(), if watching && verdict.is_none() => match event {
                    Some(MonitorEvent::Terminal(v)) if !accepted => {
                        info!("Ignoring {:?} observed before the backend accepted run {}", v, run.id());
                        watching = false;
                    }
                    Some(event) => {
                        observer.monitor_event(&event);
                        if let MonitorEvent::Terminal(v) = event {
                            verdict = Some(v);
                        }
                    }
                    None if accepted => verdict = Some(MonitorVerdict::Cancelled),
                    None => watching = false,
                },
            }
        }

        let verdict = verdict.unwrap_or(MonitorVerdict::Cancelled);
        self.complete(run, &verdict, true).await?;
        Ok((Some(diff), Some(verdict)))
    }

    async fn accepted(&self, run: &mut UpgradeRun, handle: BackendHandle) -> Result<()> {
        info!("{} backend accepted: {}", handle.backend, handle.operation);
        run.backend_handle = Some(handle);
        run.transition(RunPhase::Monitoring)?;
        self.deps.store.save_run(run).await
    }

    /// Record a failed mutating call. Never retried.
    async fn failed(&self, run: &mut UpgradeRun, err: &anyhow::Error) -> Result<()> {
        let failure = match err.chain().find_map(|e| e.downcast_ref::<AkupError>()) {
            Some(AkupError::BackendInvocation {
                category, message, ..
            }) => RunFailure::new(*category, message.clone()),
            _ => RunFailure::new(FailureCategory::classify(&format!("{err:#}")), format!("{err:#}")),
        };
        error!(
            "Backend invocation failed for run {} ({}): {}",
            run.id(),
            failure.category,
            failure.message
        );
        run.fail(failure)?;
        self.deps.store.save_run(run).await?;
        self.release(run).await;
        Ok(())
    }

    /// Apply a monitor verdict to a run in `Monitoring`.
    ///
    /// With `validate`, a success goes straight through post-validation.
    /// Otherwise the run stays `Monitoring` until `validate_run`, unless it
    /// was started with validation skipped.
    ///
    /// A terminal stored record wins over `run`, which may have been loaded
    /// long before: only a missing terminal observation is added to it.
    pub async fn complete(
        &self,
        run: &mut UpgradeRun,
        verdict: &MonitorVerdict,
        validate: bool,
    ) -> Result<()> {
        let stored = self.deps.store.load_run(run.id()).await?;
        if stored.phase().is_terminal() {
            info!(
                "Run {} was moved to {} by another process; keeping its record",
                run.id(),
                stored.phase()
            );
            let observed = verdict.observation().filter(|_| stored.terminal_observation.is_none());
            *run = stored;
            if let Some(observation) = observed {
                run.terminal_observation = Some(observation);
                self.deps.store.save_run(run).await?;
            }
            return Ok(());
        }

        if let Some(observation) = verdict.observation() {
            run.terminal_observation = Some(observation);
        }

        if run.phase() != RunPhase::Monitoring {
            info!("Run {} is already {}; verdict recorded only", run.id(), run.phase());
            return self.deps.store.save_run(run).await;
        }

        match verdict {
            MonitorVerdict::Succeeded { samples, .. } => {
                info!(
                    "Run {} reached its target ({} stable samples)",
                    run.id(),
                    samples
                );
                if run.options.skip_validation {
                    run.transition(RunPhase::Succeeded)?;
                    self.deps.store.save_run(run).await?;
                    self.release(run).await;
                } else if validate {
                    self.validate_run(run).await?;
                } else {
                    self.deps.store.save_run(run).await?;
                }
            }
            MonitorVerdict::Failed { state, .. } => {
                run.fail(RunFailure::new(
                    FailureCategory::StuckProvisioning,
                    format!("control plane reported provisioning state {state}"),
                ))?;
                self.deps.store.save_run(run).await?;
                self.release(run).await;
            }
            MonitorVerdict::TimedOut { elapsed } => {
                warn!(
                    "Run {} not terminal after {}s; lease kept, re-check the cluster",
                    run.id(),
                    elapsed.as_secs()
                );
                match self.deps.backend.query_state().await {
                    Ok(state) => warn!(
                        "{} backend last reported {} at control plane {}",
                        state.backend, state.provisioning_state, state.control_plane_version
                    ),
                    Err(e) => warn!("Could not query backend state: {e:#}"),
                }
                self.deps.store.save_run(run).await?;
            }
            MonitorVerdict::Cancelled => {
                warn!(
                    "Monitoring of run {} cancelled; the upgrade continues in the control plane",
                    run.id()
                );
                self.deps.store.save_run(run).await?;
            }
        }
        Ok(())
    }

    /// Post-validate a run with an observed terminal state.
    ///
    /// Moves a `Monitoring` run to its final phase. Validating a run that is
    /// already final only records a fresh report.
    pub async fn validate_run(&self, run: &mut UpgradeRun) -> Result<ValidationReport> {
        let validator = PostUpgradeValidator::new(self.deps.cluster.as_ref(), self.options.validation);
        let (report, post) = validator.validate(run).await?;

        let finalize = run.phase() == RunPhase::Monitoring;
        if finalize {
            run.transition(RunPhase::Validating)?;
        }

        self.deps
            .store
            .save_report(run.id(), Artifact::PostValidationReport, &report)
            .await?;
        if !run.options.no_snapshot_backup {
            self.deps
                .store
                .save_snapshot(run.id(), Artifact::PostSnapshot, &post)
                .await?;
        }
        run.post_report = Some(report.clone());
        run.post_snapshot = Some(post);

        if finalize {
            if report.has_failures() {
                warn!(
                    "Post-upgrade validation failed for run {}: {}",
                    run.id(),
                    report.failed_names()
                );
                run.transition(RunPhase::FailedPostValidation)?;
            } else {
                run.transition(RunPhase::Succeeded)?;
            }
        }
        self.deps.store.save_run(run).await?;
        if finalize {
            self.release(run).await;
        }
        Ok(report)
    }

    async fn release(&self, run: &UpgradeRun) {
        let Some(lease) = &run.lease else {
            return;
        };
        match self.deps.leases.release(lease).await {
            Ok(()) => info!(
                "Released lease for {} held by run {}",
                lease.cluster_key, lease.holder
            ),
            Err(e) => warn!("Failed to release lease for {}: {:#}", lease.cluster_key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterHealthSnapshot, ClusterTarget, ProvisioningState};
    use crate::error::exit_status_of;
    use crate::lease::file::FileLeaseStore;
    use crate::preflight::checks;
    use crate::report::CheckStatus;
    use crate::store::FileArtifactStore;
    use crate::testing::{FakeBackend, FakeCluster, snapshot, upgrading};
    use crate::upgrade::{BackendKind, UpgradePlanBuilder};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        cluster: Arc<FakeCluster>,
        backend: Arc<FakeBackend>,
        leases: Arc<FileLeaseStore>,
        store: Arc<FileArtifactStore>,
    }

    impl Harness {
        fn new(cluster: FakeCluster, backend: FakeBackend) -> Self {
            let dir = TempDir::new().unwrap();
            Self {
                leases: Arc::new(FileLeaseStore::new(dir.path())),
                store: Arc::new(FileArtifactStore::new(dir.path())),
                _dir: dir,
                cluster: Arc::new(cluster),
                backend: Arc::new(backend),
            }
        }

        fn executor(&self, detach: bool) -> Executor {
            Executor::new(
                ExecutorDeps {
                    cluster: self.cluster.clone(),
                    backend: self.backend.clone(),
                    leases: self.leases.clone(),
                    store: self.store.clone(),
                },
                ExecutorOptions {
                    monitor: MonitorOptions::new(
                        Duration::from_secs(30),
                        Duration::from_secs(30 * 60),
                        2,
                    ),
                    detach,
                    ..Default::default()
                },
            )
        }

        async fn run(&self, plan: UpgradePlan) -> Result<RunOutcome> {
            self.executor(false)
                .execute(plan, RunOptions::default(), CancellationToken::new(), &mut Unattended)
                .await
        }

        async fn lease_holder(&self) -> Option<String> {
            self.leases
                .current(&target().key())
                .await
                .unwrap()
                .map(|l| l.holder)
        }
    }

    fn target() -> ClusterTarget {
        ClusterTarget::resolve("aks-platform", "dev", None, None)
    }

    fn plan(version: &str, scope: &str) -> UpgradePlanBuilder {
        UpgradePlanBuilder::new(target(), version)
            .scope(scope)
            .backend(BackendKind::Imperative)
    }

    /// Approves every run without output.
    struct Unattended;

    impl RunObserver for Unattended {}

    struct Decline;

    impl RunObserver for Decline {
        fn confirm(&mut self, _run: &UpgradeRun, _diff: &PlanDiff) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_a_full_upgrade_succeeds() {
        let h = Harness::new(
            FakeCluster::new([
                snapshot("1.28.5", "1.28.5"),
                upgrading("1.28.5", "1.29.0"),
                snapshot("1.29.0", "1.29.0"),
            ]),
            FakeBackend::new(BackendKind::Imperative),
        );

        let outcome = h.run(plan("1.29.0", "full").build().unwrap()).await.unwrap();
        let run = &outcome.run;

        assert_eq!(run.phase(), RunPhase::Succeeded);
        assert_eq!(h.backend.applies(), 1);
        assert_eq!(outcome.exit_status(), ExitStatus::Success);
        assert!(matches!(outcome.verdict, Some(MonitorVerdict::Succeeded { .. })));

        let post = run.post_report.as_ref().unwrap();
        assert_eq!(post.overall, CheckStatus::Pass);
        assert!(run.post_snapshot.as_ref().unwrap().node_pools.iter().all(|p| p.current_version.to_string() == "1.29.0"));

        assert_eq!(h.lease_holder().await, None);
        let stored = h.store.load_run(run.id()).await.unwrap();
        assert_eq!(stored.phase(), RunPhase::Succeeded);
        assert!(h.store.path(run.id(), Artifact::PostValidationReport).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_skew_aborts_without_backend_call() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.29.2", "1.29.2")]),
            FakeBackend::new(BackendKind::Imperative),
        );

        let outcome = h.run(plan("1.31.0", "full").build().unwrap()).await.unwrap();

        assert_eq!(outcome.run.phase(), RunPhase::Aborted);
        assert_eq!(h.backend.applies(), 0);
        assert_eq!(h.backend.plans(), 0);
        assert_eq!(outcome.exit_status(), ExitStatus::PreflightNoGo);

        let report = outcome.run.preflight_report.as_ref().unwrap();
        let skew = report.check(checks::VERSION_SKEW).unwrap();
        assert_eq!(skew.reason.as_deref(), Some("version-skew-exceeded"));
        assert_eq!(h.lease_holder().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_held_lease_fails_fast() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5")]),
            FakeBackend::new(BackendKind::Imperative),
        );
        h.leases
            .acquire(&target().key(), "aks-platform-dev-rg--aks-platform-dev-aks-20260101T000000Z")
            .await
            .unwrap();

        let err = h.run(plan("1.29.0", "full").build().unwrap()).await.unwrap_err();

        assert_eq!(exit_status_of(&err), ExitStatus::LeaseConflict);
        assert_eq!(h.cluster.captures(), 0);
        assert_eq!(h.backend.applies(), 0);
        assert!(h.store.run_ids().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_d_not_ready_node_fails_post_validation() {
        let mut done = snapshot("1.29.0", "1.29.0");
        done.nodes[4].ready = false; // aks-user-1
        done.nodes[4].ready_since = Some(chrono::Utc::now() - chrono::Duration::minutes(20));

        let h = Harness::new(
            FakeCluster::new([snapshot("1.29.0", "1.28.5"), upgrading("1.28.5", "1.29.0"), done]),
            FakeBackend::new(BackendKind::Imperative),
        );

        let p = plan("1.29.0", "node-pool:user").surge(["user=33%"]).build().unwrap();
        let outcome = h.run(p).await.unwrap();
        let run = &outcome.run;

        assert_eq!(run.phase(), RunPhase::FailedPostValidation);
        assert_eq!(outcome.exit_status(), ExitStatus::PostValidationFailure);
        assert!(run.post_report.as_ref().unwrap().check(checks::NODE_READINESS).unwrap().is_fail());
        assert!(h.store.path(run.id(), Artifact::PreSnapshot).exists());
        assert!(h.store.path(run.id(), Artifact::PostSnapshot).exists());
        assert!(h.store.path(run.id(), Artifact::PostValidationReport).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_never_applies() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5")]),
            FakeBackend::new(BackendKind::Imperative),
        );

        let outcome = h
            .run(plan("1.29.0", "full").dry_run(true).build().unwrap())
            .await
            .unwrap();

        assert_eq!(outcome.run.phase(), RunPhase::Succeeded);
        assert_eq!(h.backend.applies(), 0);
        assert_eq!(h.backend.plans(), 1);
        assert!(!outcome.diff.unwrap().is_empty());
        assert!(outcome.run.lease.is_none());
        assert!(h.store.run_ids().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_marks_failed_with_remediation() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5")]),
            FakeBackend::failing(
                BackendKind::Imperative,
                "ERROR: (QuotaExceeded) Operation results in exceeding approved standardDSv5Family Cores quota",
            ),
        );

        let outcome = h.run(plan("1.29.0", "full").build().unwrap()).await.unwrap();
        let run = &outcome.run;

        assert_eq!(run.phase(), RunPhase::Failed);
        assert_eq!(h.backend.applies(), 1);
        assert_eq!(outcome.exit_status(), ExitStatus::ExecutionFailure);
        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.category, FailureCategory::QuotaExceeded);
        assert!(failure.remediation.contains("quota"));
        assert!(h.store.path(run.id(), Artifact::PreSnapshot).exists());
        assert_eq!(h.lease_holder().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_failure_is_execution_failure() {
        let mut failed = upgrading("1.28.5", "1.29.0");
        failed.provisioning_state = ProvisioningState::Failed;
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5"), failed]),
            FakeBackend::new(BackendKind::Imperative),
        );

        let outcome = h.run(plan("1.29.0", "full").build().unwrap()).await.unwrap();

        assert_eq!(outcome.run.phase(), RunPhase::Failed);
        assert_eq!(
            outcome.run.failure.as_ref().unwrap().category,
            FailureCategory::StuckProvisioning
        );
        assert_eq!(outcome.exit_status(), ExitStatus::ExecutionFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_ambiguous_and_keeps_lease() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5"), upgrading("1.28.5", "1.29.0")]),
            FakeBackend::new(BackendKind::Imperative),
        );

        let outcome = h.run(plan("1.29.0", "full").build().unwrap()).await.unwrap();

        assert_eq!(outcome.run.phase(), RunPhase::Monitoring);
        assert_eq!(outcome.exit_status(), ExitStatus::AmbiguousTimeout);
        assert_eq!(h.lease_holder().await.as_deref(), Some(outcome.run.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_run_finished_by_monitor_and_validate() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5"), snapshot("1.29.0", "1.29.0")]),
            FakeBackend::new(BackendKind::Imperative),
        );
        let executor = h.executor(true);

        let outcome = executor
            .execute(
                plan("1.29.0", "full").build().unwrap(),
                RunOptions::default(),
                CancellationToken::new(),
                &mut Unattended,
            )
            .await
            .unwrap();
        assert_eq!(outcome.run.phase(), RunPhase::Monitoring);
        assert_eq!(outcome.exit_status(), ExitStatus::Success);
        let run_id = outcome.run.id().to_string();
        assert_eq!(h.lease_holder().await.as_deref(), Some(run_id.as_str()));

        // A separate process validating too early is refused.
        let mut run = h.store.load_run(&run_id).await.unwrap();
        let err = executor.validate_run(&mut run).await.unwrap_err();
        assert_eq!(exit_status_of(&err), ExitStatus::AmbiguousTimeout);

        let monitor = ProgressMonitor::new(h.cluster.clone(), MonitorOptions::default());
        let events = monitor
            .observe(&run_id, h.store.as_ref(), CancellationToken::new())
            .await
            .unwrap();
        let verdict = crate::monitor::drive(events, |_| {}).await;
        executor.complete(&mut run, &verdict, false).await.unwrap();
        assert_eq!(run.phase(), RunPhase::Monitoring);
        assert!(run.terminal_observation.is_some());

        let mut run = h.store.load_run(&run_id).await.unwrap();
        let report = executor.validate_run(&mut run).await.unwrap();
        assert!(!report.has_failures());
        assert_eq!(run.phase(), RunPhase::Succeeded);
        assert_eq!(h.lease_holder().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_confirmation_releases_lease() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5")]),
            FakeBackend::new(BackendKind::Imperative),
        );

        let err = h
            .executor(false)
            .execute(
                plan("1.29.0", "full").build().unwrap(),
                RunOptions::default(),
                CancellationToken::new(),
                &mut Decline,
            )
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<AkupError>(), Some(AkupError::UserCancelled)));
        assert_eq!(h.backend.applies(), 0);
        assert_eq!(h.lease_holder().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_run_records_override() {
        let mut unhealthy: ClusterHealthSnapshot = snapshot("1.28.5", "1.28.5");
        unhealthy.critical_services[0].ready = 0;
        let h = Harness::new(
            FakeCluster::new([unhealthy, snapshot("1.29.0", "1.29.0")]),
            FakeBackend::new(BackendKind::Imperative),
        );

        let options = RunOptions {
            force: true,
            skip_validation: true,
            ..Default::default()
        };
        let outcome = h
            .executor(false)
            .execute(
                plan("1.29.0", "full").build().unwrap(),
                options,
                CancellationToken::new(),
                &mut Unattended,
            )
            .await
            .unwrap();

        assert!(outcome.run.preflight_overridden);
        assert_eq!(outcome.run.phase(), RunPhase::Succeeded);
        assert!(outcome.run.post_report.is_none());
        assert_eq!(h.backend.applies(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_get_one_lease() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5")]),
            FakeBackend::new(BackendKind::Imperative),
        );
        let a = h.executor(true);
        let b = h.executor(true);
        let p = plan("1.29.0", "full").build().unwrap();

        let (mut a_obs, mut b_obs) = (Unattended, Unattended);
        let (ra, rb) = tokio::join!(
            a.execute(p.clone(), RunOptions::default(), CancellationToken::new(), &mut a_obs),
            b.execute(p, RunOptions::default(), CancellationToken::new(), &mut b_obs),
        );

        let conflicts = [&ra, &rb]
            .iter()
            .filter(|r| {
                r.as_ref()
                    .err()
                    .is_some_and(|e| exit_status_of(e) == ExitStatus::LeaseConflict)
            })
            .count();
        assert_eq!(conflicts, 1);
        assert_eq!(h.backend.applies(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_observer_keeps_finished_record() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5"), snapshot("1.29.0", "1.29.0")]),
            FakeBackend::new(BackendKind::Imperative),
        );
        let executor = h.executor(true);
        let outcome = executor
            .execute(
                plan("1.29.0", "full").build().unwrap(),
                RunOptions::default(),
                CancellationToken::new(),
                &mut Unattended,
            )
            .await
            .unwrap();
        let run_id = outcome.run.id().to_string();

        // Two observers load the run while it is still Monitoring.
        let mut early = h.store.load_run(&run_id).await.unwrap();
        let mut late = h.store.load_run(&run_id).await.unwrap();

        let monitor = ProgressMonitor::new(h.cluster.clone(), MonitorOptions::default());
        let events = monitor
            .observe(&run_id, h.store.as_ref(), CancellationToken::new())
            .await
            .unwrap();
        let verdict = crate::monitor::drive(events, |_| {}).await;

        executor.complete(&mut early, &verdict, false).await.unwrap();
        executor.validate_run(&mut early).await.unwrap();
        assert_eq!(early.phase(), RunPhase::Succeeded);
        assert_eq!(h.lease_holder().await, None);

        executor.complete(&mut late, &verdict, false).await.unwrap();
        assert_eq!(late.phase(), RunPhase::Succeeded);
        assert!(late.post_report.is_some());

        let stored = h.store.load_run(&run_id).await.unwrap();
        assert_eq!(stored.phase(), RunPhase::Succeeded);
        assert!(stored.post_report.is_some());
        assert!(stored.terminal_observation.is_some());
        assert_eq!(h.lease_holder().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_before_acceptance_do_not_decide_the_run() {
        // The previous operation left the cluster Canceled; the backend takes
        // several poll intervals to accept the call.
        let mut canceled = snapshot("1.28.5", "1.28.5");
        canceled.provisioning_state = ProvisioningState::Canceled;
        let h = Harness::new(
            FakeCluster::new([
                canceled.clone(),
                canceled.clone(),
                canceled,
                upgrading("1.28.5", "1.29.0"),
                snapshot("1.29.0", "1.29.0"),
            ]),
            FakeBackend::slow(BackendKind::Imperative, Duration::from_secs(120)),
        );

        let outcome = h.run(plan("1.29.0", "full").build().unwrap()).await.unwrap();
        let run = &outcome.run;

        assert_eq!(run.phase(), RunPhase::Succeeded, "failure: {:?}", run.failure);
        assert!(run.failure.is_none());
        assert!(matches!(outcome.verdict, Some(MonitorVerdict::Succeeded { .. })));
        assert_eq!(h.backend.applies(), 1);
        assert_eq!(h.lease_holder().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_kind_must_match_plan() {
        let h = Harness::new(
            FakeCluster::new([snapshot("1.28.5", "1.28.5")]),
            FakeBackend::new(BackendKind::Declarative),
        );

        let err = h.run(plan("1.29.0", "full").build().unwrap()).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<AkupError>(), Some(AkupError::InvalidArgument(_))));
        assert_eq!(h.cluster.captures(), 0);
        assert_eq!(h.lease_holder().await, None);
    }
}
