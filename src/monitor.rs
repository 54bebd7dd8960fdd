//! Progress monitor.
//!
//! Polls the cluster for an in-flight run and yields one [`MonitorEvent`] per
//! step. The monitor is an observer only: cancelling it or letting it time out
//! never touches the operation running in the control plane. Any number of
//! monitors may watch the same run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterHealthSnapshot, ClusterQuery, ProvisioningState};
use crate::store::ArtifactStore;
use crate::upgrade::{TerminalObservation, TerminalState, UpgradePlan};

/// Lowest accepted number of consecutive stable samples.
pub const MIN_STABLE_SAMPLES: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub poll_interval: Duration,
    pub max_duration: Duration,
    /// Consecutive identical terminal samples required. Never below 2.
    pub stable_samples: u32,
    /// Retries of a failing query before a monitor-level warning.
    pub max_retries: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_duration: Duration::from_secs(90 * 60),
            stable_samples: MIN_STABLE_SAMPLES,
            max_retries: 3,
            retry_initial_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

impl MonitorOptions {
    pub fn new(poll_interval: Duration, max_duration: Duration, stable_samples: u32) -> Self {
        Self {
            poll_interval,
            max_duration,
            stable_samples,
            ..Default::default()
        }
        .normalized()
    }

    fn normalized(mut self) -> Self {
        if self.stable_samples < MIN_STABLE_SAMPLES {
            warn!(
                "Stable sample count {} raised to {}",
                self.stable_samples, MIN_STABLE_SAMPLES
            );
            self.stable_samples = MIN_STABLE_SAMPLES;
        }
        self
    }

    /// Delay before retry `attempt` (1-based): doubles from the initial delay, capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_initial_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// How a single sample reads against the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleState {
    InProgress,
    Succeeded,
    Failed,
}

impl SampleState {
    /// Classify a sample. Succeeded needs the provisioning signal and the
    /// scope's target reached. Node readiness is judged after, with a grace period.
    pub fn classify(plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Self {
        if snapshot.provisioning_state.is_failed() {
            return Self::Failed;
        }
        if snapshot.provisioning_state.is_succeeded() && plan.unmet_targets(snapshot).is_empty() {
            Self::Succeeded
        } else {
            Self::InProgress
        }
    }

    const fn terminal(self) -> Option<TerminalState> {
        match self {
            Self::InProgress => None,
            Self::Succeeded => Some(TerminalState::Succeeded),
            Self::Failed => Some(TerminalState::Failed),
        }
    }
}

/// Counts consecutive identical terminal samples.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    required: u32,
    current: Option<TerminalState>,
    streak: u32,
}

impl StabilityTracker {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(MIN_STABLE_SAMPLES),
            current: None,
            streak: 0,
        }
    }

    /// Feed one sample. Returns the terminal state once it has held for
    /// `required` consecutive samples.
    pub fn observe(&mut self, state: SampleState) -> Option<TerminalState> {
        match state.terminal() {
            None => self.reset(),
            Some(terminal) if self.current == Some(terminal) => self.streak += 1,
            Some(terminal) => {
                self.current = Some(terminal);
                self.streak = 1;
            }
        }
        self.current.filter(|_| self.streak >= self.required)
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.streak = 0;
    }

    pub const fn streak(&self) -> u32 {
        self.streak
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorVerdict {
    Succeeded { samples: u32, observed_at: DateTime<Utc> },
    Failed { samples: u32, observed_at: DateTime<Utc>, state: ProvisioningState },
    /// Max duration elapsed without a confirmed terminal state. Ambiguous.
    TimedOut { elapsed: Duration },
    Cancelled,
}

impl MonitorVerdict {
    pub fn observation(&self) -> Option<TerminalObservation> {
        match self {
            Self::Succeeded { samples, observed_at } => Some(TerminalObservation {
                state: TerminalState::Succeeded,
                observed_at: *observed_at,
                samples: *samples,
            }),
            Self::Failed {
                samples,
                observed_at,
                ..
            } => Some(TerminalObservation {
                state: TerminalState::Failed,
                observed_at: *observed_at,
                samples: *samples,
            }),
            Self::TimedOut { .. } | Self::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Sample {
        snapshot: Box<ClusterHealthSnapshot>,
        state: SampleState,
        streak: u32,
    },
    /// A query failed and will be retried.
    TransientError { attempt: u32, message: String },
    /// Retries exhausted. Observation continues with degraded confidence.
    Warning(String),
    Terminal(MonitorVerdict),
}

struct PollState {
    cluster: Arc<dyn ClusterQuery>,
    plan: UpgradePlan,
    options: MonitorOptions,
    cancel: CancellationToken,
    tracker: StabilityTracker,
    started: Instant,
    deadline: Instant,
    wait: Duration,
    failures: u32,
    last_state: ProvisioningState,
    queued: VecDeque<MonitorEvent>,
    done: bool,
}

impl PollState {
    fn finish(&mut self, verdict: MonitorVerdict) -> MonitorEvent {
        info!("Monitor verdict: {:?}", verdict);
        self.done = true;
        MonitorEvent::Terminal(verdict)
    }

    fn timed_out(&mut self) -> MonitorEvent {
        let elapsed = self.started.elapsed();
        self.finish(MonitorVerdict::TimedOut { elapsed })
    }

    async fn step(&mut self) -> Option<MonitorEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            return Some(self.finish(MonitorVerdict::Cancelled));
        }

        if !self.wait.is_zero() {
            let wake = (Instant::now() + self.wait).min(self.deadline);
            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Some(self.finish(MonitorVerdict::Cancelled));
                }
                () = tokio::time::sleep_until(wake) => {}
            }
        }
        if Instant::now() >= self.deadline {
            return Some(self.timed_out());
        }

        let captured = tokio::select! {
            () = self.cancel.cancelled() => {
                return Some(self.finish(MonitorVerdict::Cancelled));
            }
            captured = self.cluster.sample() => captured,
        };

        match captured {
            Ok(snapshot) => {
                self.failures = 0;
                self.wait = self.options.poll_interval;

                let state = SampleState::classify(&self.plan, &snapshot);
                let terminal = self.tracker.observe(state);
                let streak = self.tracker.streak();
                self.last_state = snapshot.provisioning_state.clone();
                debug!(
                    "Sample: provisioning={} state={:?} streak={}",
                    snapshot.provisioning_state, state, streak
                );

                if let Some(terminal) = terminal {
                    let observed_at = snapshot.captured_at;
                    let verdict = match terminal {
                        TerminalState::Succeeded => MonitorVerdict::Succeeded {
                            samples: streak,
                            observed_at,
                        },
                        TerminalState::Failed => MonitorVerdict::Failed {
                            samples: streak,
                            observed_at,
                            state: self.last_state.clone(),
                        },
                    };
                    let event = self.finish(verdict);
                    self.queued.push_back(event);
                }

                Some(MonitorEvent::Sample {
                    snapshot: Box::new(snapshot),
                    state,
                    streak,
                })
            }
            Err(e) => {
                self.tracker.reset();
                self.failures += 1;

                if self.failures <= self.options.max_retries {
                    self.wait = self.options.retry_delay(self.failures);
                    warn!(
                        "Cluster query failed (attempt {}/{}), retrying in {:?}: {}",
                        self.failures, self.options.max_retries, self.wait, e
                    );
                    Some(MonitorEvent::TransientError {
                        attempt: self.failures,
                        message: e.to_string(),
                    })
                } else {
                    let message = format!(
                        "cluster state unavailable after {} retries: {e}; observation continues",
                        self.options.max_retries
                    );
                    warn!("{}", message);
                    self.failures = 0;
                    self.wait = self.options.poll_interval;
                    Some(MonitorEvent::Warning(message))
                }
            }
        }
    }
}

pub struct ProgressMonitor {
    cluster: Arc<dyn ClusterQuery>,
    options: MonitorOptions,
}

impl ProgressMonitor {
    pub fn new(cluster: Arc<dyn ClusterQuery>, options: MonitorOptions) -> Self {
        Self {
            cluster,
            options: options.normalized(),
        }
    }

    pub const fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// Stream samples for `plan` until terminal, cancelled or timed out.
    /// The last event is always [`MonitorEvent::Terminal`].
    pub fn observe_plan(
        &self,
        plan: UpgradePlan,
        cancel: CancellationToken,
    ) -> BoxStream<'static, MonitorEvent> {
        let started = Instant::now();
        let state = PollState {
            cluster: Arc::clone(&self.cluster),
            plan,
            options: self.options,
            cancel,
            tracker: StabilityTracker::new(self.options.stable_samples),
            started,
            deadline: started + self.options.max_duration,
            wait: Duration::ZERO,
            failures: 0,
            last_state: ProvisioningState::InProgress("Unknown".to_string()),
            queued: VecDeque::new(),
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            let event = state.step().await?;
            Some((event, state))
        })
        .boxed()
    }

    /// Stream samples for a persisted run.
    pub async fn observe(
        &self,
        run_id: &str,
        store: &dyn ArtifactStore,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, MonitorEvent>> {
        let run = store.load_run(run_id).await?;
        info!(
            "Observing run {} ({} -> {}, phase {})",
            run.id(),
            run.plan().scope(),
            run.plan().target_version(),
            run.phase()
        );
        Ok(self.observe_plan(run.plan().clone(), cancel))
    }
}

/// Drive a monitor stream to its verdict, handing every event to `on_event`.
pub async fn drive<F>(mut events: BoxStream<'static, MonitorEvent>, mut on_event: F) -> MonitorVerdict
where
    F: FnMut(&MonitorEvent),
{
    while let Some(event) = events.next().await {
        on_event(&event);
        if let MonitorEvent::Terminal(verdict) = event {
            return verdict;
        }
    }
    MonitorVerdict::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterTarget;
    use crate::testing::{FakeCluster, snapshot, upgrading};
    use crate::upgrade::{BackendKind, UpgradePlanBuilder};

    fn plan() -> UpgradePlan {
        UpgradePlanBuilder::new(ClusterTarget::resolve("p", "dev", None, None), "1.29.0")
            .backend(BackendKind::Imperative)
            .build()
            .unwrap()
    }

    fn monitor(cluster: Arc<FakeCluster>, max: Duration) -> ProgressMonitor {
        ProgressMonitor::new(cluster, MonitorOptions::new(Duration::from_secs(30), max, 2))
    }

    async fn collect(m: &ProgressMonitor, cancel: CancellationToken) -> (Vec<MonitorEvent>, MonitorVerdict) {
        let mut events = Vec::new();
        let verdict = drive(m.observe_plan(plan(), cancel), |e| events.push(e.clone())).await;
        (events, verdict)
    }

    fn samples(events: &[MonitorEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::Sample { .. }))
            .count()
    }

    #[test]
    fn test_stable_samples_floor() {
        let options = MonitorOptions::new(Duration::from_secs(1), Duration::from_secs(10), 1);
        assert_eq!(options.stable_samples, 2);
        assert_eq!(StabilityTracker::new(0).required, 2);
    }

    #[test]
    fn test_retry_delay_backoff() {
        let options = MonitorOptions::default();
        assert_eq!(options.retry_delay(1), Duration::from_secs(2));
        assert_eq!(options.retry_delay(2), Duration::from_secs(4));
        assert_eq!(options.retry_delay(3), Duration::from_secs(8));
        assert_eq!(options.retry_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_tracker_needs_consecutive_samples() {
        let mut t = StabilityTracker::new(2);
        assert_eq!(t.observe(SampleState::Succeeded), None);
        assert_eq!(t.observe(SampleState::InProgress), None);
        assert_eq!(t.observe(SampleState::Succeeded), None);
        assert_eq!(t.observe(SampleState::Failed), None);
        assert_eq!(t.observe(SampleState::Succeeded), None);
        assert_eq!(t.observe(SampleState::Succeeded), Some(TerminalState::Succeeded));
    }

    #[test]
    fn test_classify() {
        let p = plan();
        assert_eq!(SampleState::classify(&p, &upgrading("1.28.5", "1.29.0")), SampleState::InProgress);
        assert_eq!(SampleState::classify(&p, &snapshot("1.29.0", "1.29.0")), SampleState::Succeeded);
        // Provisioning says Succeeded but pools still on the old version.
        assert_eq!(SampleState::classify(&p, &snapshot("1.29.0", "1.28.5")), SampleState::InProgress);

        let mut failed = upgrading("1.28.5", "1.29.0");
        failed.provisioning_state = ProvisioningState::Failed;
        assert_eq!(SampleState::classify(&p, &failed), SampleState::Failed);

        let mut pool_upgrading = snapshot("1.29.0", "1.29.0");
        pool_upgrading.node_pools[1].target_version = Some(p.target_version().clone());
        assert_eq!(SampleState::classify(&p, &pool_upgrading), SampleState::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_succeeded_sample_is_not_terminal() {
        let done = snapshot("1.29.0", "1.29.0");
        let cluster = Arc::new(FakeCluster::new([
            upgrading("1.28.5", "1.29.0"),
            done.clone(),
            upgrading("1.28.5", "1.29.0"),
            done.clone(),
            done,
        ]));
        let m = monitor(cluster.clone(), Duration::from_secs(3600));
        let (events, verdict) = collect(&m, CancellationToken::new()).await;

        assert!(matches!(verdict, MonitorVerdict::Succeeded { samples: 2, .. }));
        assert_eq!(samples(&events), 5);
        assert_eq!(cluster.captures(), 5);
        assert_eq!(cluster.samples(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_provisioning_needs_confirmation() {
        let mut failed = upgrading("1.28.5", "1.29.0");
        failed.provisioning_state = ProvisioningState::Failed;
        let cluster = Arc::new(FakeCluster::new([upgrading("1.28.5", "1.29.0"), failed]));
        let m = monitor(cluster, Duration::from_secs(3600));
        let (events, verdict) = collect(&m, CancellationToken::new()).await;

        match verdict {
            MonitorVerdict::Failed { samples, state, .. } => {
                assert_eq!(samples, 2);
                assert_eq!(state, ProvisioningState::Failed);
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        assert_eq!(samples(&events), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_terminal_signal() {
        let cluster = Arc::new(FakeCluster::new([upgrading("1.28.5", "1.29.0")]));
        let m = monitor(cluster.clone(), Duration::from_secs(5 * 60));
        let (_, verdict) = collect(&m, CancellationToken::new()).await;

        assert!(matches!(verdict, MonitorVerdict::TimedOut { .. }));
        assert!(verdict.observation().is_none());
        // One immediate sample plus one per 30s interval before the deadline.
        assert_eq!(cluster.captures(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_and_reset_streak() {
        let done = snapshot("1.29.0", "1.29.0");
        let cluster = Arc::new(FakeCluster::scripted([
            Ok(done.clone()),
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
            Ok(done.clone()),
            Ok(done),
        ]));
        let m = monitor(cluster, Duration::from_secs(3600));
        let (events, verdict) = collect(&m, CancellationToken::new()).await;

        let retries: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::TransientError { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);
        // The first success does not count toward the streak after errors.
        assert!(matches!(verdict, MonitorVerdict::Succeeded { samples: 2, .. }));
        assert_eq!(samples(&events), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_warn_and_continue() {
        let mut script: Vec<Result<ClusterHealthSnapshot, String>> =
            (0..4).map(|_| Err("503 Service Unavailable".to_string())).collect();
        script.push(Ok(snapshot("1.29.0", "1.29.0")));
        let cluster = Arc::new(FakeCluster::scripted(script));
        let m = monitor(cluster, Duration::from_secs(3600));
        let (events, verdict) = collect(&m, CancellationToken::new()).await;

        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, MonitorEvent::Warning(_)))
                .count(),
            1
        );
        assert!(matches!(verdict, MonitorVerdict::Succeeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_observation() {
        let cluster = Arc::new(FakeCluster::new([upgrading("1.28.5", "1.29.0")]));
        let m = monitor(cluster.clone(), Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let mut events = m.observe_plan(plan(), cancel.clone());
        assert!(matches!(events.next().await, Some(MonitorEvent::Sample { .. })));
        cancel.cancel();
        assert!(matches!(
            events.next().await,
            Some(MonitorEvent::Terminal(MonitorVerdict::Cancelled))
        ));
        assert!(events.next().await.is_none());
        assert_eq!(cluster.captures(), 1);
    }
}
