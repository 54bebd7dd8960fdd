//! Interactive run observer: report printing, typed confirmation and a
//! spinner while the monitor samples.

use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use dialoguer::Input;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

use super::{OutputFormat, print_json, table};
use crate::backend::PlanDiff;
use crate::monitor::{MonitorEvent, MonitorVerdict, SampleState};
use crate::preflight::PreflightOutcome;
use crate::upgrade::{RunObserver, UpgradePlan, UpgradeRun};

pub struct TerminalObserver {
    format: OutputFormat,
    assume_yes: bool,
    /// Plan being observed, for sample lines.
    plan: Option<UpgradePlan>,
    spinner: Option<ProgressBar>,
}

impl TerminalObserver {
    pub fn new(format: OutputFormat, assume_yes: bool) -> Self {
        Self {
            format,
            assume_yes,
            plan: None,
            spinner: None,
        }
    }

    /// Observer for a standalone monitor of `plan`.
    pub fn for_plan(format: OutputFormat, plan: UpgradePlan) -> Self {
        Self {
            plan: Some(plan),
            ..Self::new(format, true)
        }
    }

    fn spinner(&mut self) -> &ProgressBar {
        self.spinner.get_or_insert_with(|| {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} [{elapsed_precise}] {msg}") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        })
    }

    fn human_event(&mut self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Sample {
                snapshot,
                state,
                streak,
            } => {
                let line = match &self.plan {
                    Some(plan) => table::sample_line(plan, snapshot, *state, *streak),
                    None => format!("provisioning {}", snapshot.provisioning_state),
                };
                let pb = self.spinner();
                pb.println(&line);
                pb.set_message(format!("waiting for a stable terminal state (streak {streak})"));
            }
            MonitorEvent::TransientError { attempt, message } => {
                let pb = self.spinner();
                pb.println(format!("{} query failed (attempt {attempt}): {message}", "⚠".yellow()));
            }
            MonitorEvent::Warning(message) => {
                let pb = self.spinner();
                pb.println(format!("{} {message}", "⚠".yellow()));
            }
            MonitorEvent::Terminal(verdict) => {
                if let Some(pb) = self.spinner.take() {
                    pb.finish_and_clear();
                }
                table::print_verdict(verdict);
            }
        }
    }

    fn json_event(&self, event: &MonitorEvent) -> Result<()> {
        let value = match event {
            MonitorEvent::Sample {
                snapshot,
                state,
                streak,
            } => json!({
                "event": "sample",
                "captured_at": snapshot.captured_at,
                "provisioning_state": snapshot.provisioning_state,
                "control_plane_version": snapshot.control_plane_version.to_string(),
                "state": sample_state_name(*state),
                "streak": streak,
                "unmet": self.plan.as_ref().map(|p| p.unmet_targets(snapshot)).unwrap_or_default(),
            }),
            MonitorEvent::TransientError { attempt, message } => json!({
                "event": "transient-error",
                "attempt": attempt,
                "message": message,
            }),
            MonitorEvent::Warning(message) => json!({"event": "warning", "message": message}),
            MonitorEvent::Terminal(verdict) => verdict_json(verdict),
        };
        print_json(&value)
    }
}

const fn sample_state_name(state: SampleState) -> &'static str {
    match state {
        SampleState::InProgress => "in-progress",
        SampleState::Succeeded => "succeeded",
        SampleState::Failed => "failed",
    }
}

pub fn verdict_json(verdict: &MonitorVerdict) -> serde_json::Value {
    match verdict {
        MonitorVerdict::Succeeded {
            samples,
            observed_at,
        } => json!({"event": "terminal", "verdict": "succeeded", "samples": samples, "observed_at": observed_at}),
        MonitorVerdict::Failed {
            samples,
            observed_at,
            state,
        } => json!({
            "event": "terminal",
            "verdict": "failed",
            "samples": samples,
            "observed_at": observed_at,
            "provisioning_state": state,
        }),
        MonitorVerdict::TimedOut { elapsed } => {
            json!({"event": "terminal", "verdict": "timed-out", "elapsed_secs": elapsed.as_secs()})
        }
        MonitorVerdict::Cancelled => json!({"event": "terminal", "verdict": "cancelled"}),
    }
}

impl RunObserver for TerminalObserver {
    fn preflight(&mut self, outcome: &PreflightOutcome) {
        if self.format == OutputFormat::Human {
            table::print_preflight(outcome);
        }
    }

    fn diff(&mut self, run: &UpgradeRun, diff: &PlanDiff) {
        self.plan = Some(run.plan().clone());
        if self.format == OutputFormat::Human {
            table::print_plan(run, diff);
        }
    }

    fn confirm(&mut self, run: &UpgradeRun, diff: &PlanDiff) -> Result<bool> {
        if self.assume_yes || run.is_dry_run() {
            return Ok(true);
        }
        if self.format == OutputFormat::Json {
            // Structured output never prompts.
            return Ok(false);
        }
        if diff.is_empty() {
            println!("{}", "Nothing to change; the run will only confirm the current state.".dimmed());
        }

        println!();
        println!(
            "{}",
            "This will upgrade the cluster. Kubernetes versions cannot be downgraded."
                .yellow()
                .bold()
        );
        let confirmation: String = Input::new()
            .with_prompt(format!("Type {} to confirm", "Yes".green().bold()))
            .interact_text()?;

        if confirmation != "Yes" {
            println!("{}", "Upgrade cancelled. You must type 'Yes' to proceed.".red());
            return Ok(false);
        }
        Ok(true)
    }

    fn monitor_event(&mut self, event: &MonitorEvent) {
        match self.format {
            OutputFormat::Human => self.human_event(event),
            OutputFormat::Json => {
                if let Err(e) = self.json_event(event) {
                    tracing::warn!("Failed to write monitor event: {e:#}");
                }
            }
        }
    }
}
