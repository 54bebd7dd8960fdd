//! Report, plan and run rendering for human output.
//!
//! Tables are kubectl-style: no borders, two spaces between columns.

use colored::{ColoredString, Colorize};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::backend::PlanDiff;
use crate::cluster::{ClusterHealthSnapshot, ClusterTarget};
use crate::lease::Lease;
use crate::monitor::{MonitorVerdict, SampleState};
use crate::preflight::PreflightOutcome;
use crate::report::{CheckStatus, Decision, ValidationReport};
use crate::upgrade::{RunPhase, UpgradePlan, UpgradeRun};

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "CHECK")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

#[derive(Tabled)]
struct PoolRow {
    #[tabled(rename = "POOL")]
    name: String,
    #[tabled(rename = "MODE")]
    mode: String,
    #[tabled(rename = "VM SIZE")]
    vm_size: String,
    #[tabled(rename = "NODES")]
    nodes: u32,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "SURGE")]
    surge: String,
    #[tabled(rename = "IN SCOPE")]
    in_scope: String,
}

#[derive(Tabled)]
struct DiffRow {
    #[tabled(rename = "RESOURCE")]
    resource: String,
    #[tabled(rename = "ATTRIBUTE")]
    attribute: String,
    #[tabled(rename = "FROM")]
    from: String,
    #[tabled(rename = "TO")]
    to: String,
}

fn status_label(status: CheckStatus) -> ColoredString {
    match status {
        CheckStatus::Pass => "PASS".green(),
        CheckStatus::Warn => "WARN".yellow(),
        CheckStatus::Fail => "FAIL".red().bold(),
    }
}

pub fn phase_label(phase: RunPhase) -> ColoredString {
    let text = phase.to_string();
    match phase {
        RunPhase::Succeeded => text.green().bold(),
        RunPhase::Failed | RunPhase::FailedPostValidation | RunPhase::Aborted => text.red().bold(),
        RunPhase::Executing | RunPhase::Monitoring | RunPhase::Validating => text.cyan(),
        RunPhase::Pending | RunPhase::Preflight => text.normal(),
    }
}

/// Print a check table under `title`.
pub fn print_report(title: &str, report: &ValidationReport) {
    println!();
    println!("{} ({})", title.bold(), status_label(report.overall));

    let rows: Vec<CheckRow> = report
        .checks
        .iter()
        .map(|c| CheckRow {
            name: c.label(),
            status: status_label(c.status).to_string(),
            detail: c.detail.clone(),
        })
        .collect();

    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{table}");
}

pub fn print_preflight(outcome: &PreflightOutcome) {
    print_report("Preflight checks", &outcome.report);
    println!();

    let warnings = outcome.report.warnings().count();
    if warnings > 0 {
        println!("{} {} warning(s), review before upgrading", "⚠".yellow(), warnings);
    }

    match outcome.decision {
        Decision::Go => println!("Decision: {}", "GO".green().bold()),
        Decision::NoGo if outcome.overridden => {
            println!(
                "Decision: {} {}",
                "NO-GO".red().bold(),
                "(overridden with --force)".yellow()
            );
        }
        Decision::NoGo => {
            println!("Decision: {}", "NO-GO".red().bold());
            for reason in outcome.report.failure_reasons() {
                println!("  {} {}", "✗".red(), reason);
            }
        }
    }
}

/// Print the plan header, pool table and effective diff.
pub fn print_plan(run: &UpgradeRun, diff: &PlanDiff) {
    let plan = run.plan();
    println!();
    println!("{}", "Upgrade plan:".bold());
    println!("  Run:      {}", run.id());
    println!("  Cluster:  {}", plan.cluster());
    println!("  Target:   {} ({})", plan.target_version().to_string().cyan(), plan.scope());
    println!("  Backend:  {}", plan.backend());

    if let Some(snapshot) = &run.pre_snapshot {
        println!("  Current:  control plane {}", snapshot.control_plane_version);
        println!(
            "  Estimate: ~{} min",
            plan.estimated_minutes(snapshot)
        );
        print_pools(plan, snapshot);
    }

    println!();
    if diff.is_empty() {
        println!("{}", "No changes. Cluster already matches the target.".green());
        return;
    }

    println!("{}", "Changes:".bold());
    let rows: Vec<DiffRow> = diff
        .entries
        .iter()
        .map(|e| DiffRow {
            resource: e.resource.clone(),
            attribute: e.attribute.clone(),
            from: e.from.clone(),
            to: e.to.yellow().to_string(),
        })
        .collect();
    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{table}");

    if !diff.commands.is_empty() {
        println!();
        println!("{}", "Commands:".bold());
        for cmd in &diff.commands {
            println!("  {}", cmd.dimmed());
        }
    }
}

fn print_pools(plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) {
    let in_scope = plan.scope().pools_in_scope(snapshot);
    let rows: Vec<PoolRow> = snapshot
        .node_pools
        .iter()
        .map(|p| {
            let targeted = in_scope.contains(&p.name);
            PoolRow {
                name: p.name.clone(),
                mode: format!("{:?}", p.mode),
                vm_size: p.vm_size.clone(),
                nodes: p.node_count,
                version: p.current_version.to_string(),
                surge: if targeted {
                    plan.surge_for(p).to_string()
                } else {
                    "-".to_string()
                },
                in_scope: if targeted { "yes".green().to_string() } else { "no".dimmed().to_string() },
            }
        })
        .collect();

    if rows.is_empty() {
        return;
    }
    println!();
    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{table}");
}

/// One line per monitor sample.
pub fn sample_line(plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot, state: SampleState, streak: u32) -> String {
    let unmet = plan.unmet_targets(snapshot);
    let state = match state {
        SampleState::InProgress => "in progress".cyan(),
        SampleState::Succeeded => "succeeded".green(),
        SampleState::Failed => "failed".red(),
    };
    let not_ready = snapshot.not_ready_nodes().count();

    format!(
        "[{}] {} control plane {} ({}), {} pending, {} NotReady nodes, streak {}",
        snapshot.captured_at.format("%H:%M:%S"),
        state,
        snapshot.control_plane_version,
        snapshot.provisioning_state,
        unmet.len(),
        not_ready,
        streak
    )
}

pub fn print_verdict(verdict: &MonitorVerdict) {
    match verdict {
        MonitorVerdict::Succeeded { samples, .. } => println!(
            "{} provisioning succeeded ({} stable samples)",
            "✓".green(),
            samples
        ),
        MonitorVerdict::Failed { state, samples, .. } => println!(
            "{} provisioning {} ({} stable samples)",
            "✗".red(),
            state.to_string().red().bold(),
            samples
        ),
        MonitorVerdict::TimedOut { elapsed } => println!(
            "{} no terminal state after {} min; the operation may still be running",
            "⚠".yellow(),
            elapsed.as_secs() / 60
        ),
        MonitorVerdict::Cancelled => println!(
            "{} monitoring cancelled; the operation continues in the control plane",
            "⚠".yellow()
        ),
    }
}

/// Run summary with failure remediation.
pub fn print_run(run: &UpgradeRun) {
    println!();
    println!("Run {}: {}", run.id().bold(), phase_label(run.phase()));
    println!("  Cluster:  {}", run.plan().cluster());
    println!(
        "  Target:   {} ({}, {} backend)",
        run.plan().target_version(),
        run.plan().scope(),
        run.plan().backend()
    );
    println!("  Started:  {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if run.is_dry_run() {
        println!("  {}", "[DRY RUN] no changes were made".yellow());
    }
    if run.preflight_overridden {
        println!("  {}", "Preflight NO-GO was overridden".yellow());
    }
    if let Some(handle) = &run.backend_handle {
        println!(
            "  Issued:   {} at {}",
            handle.operation,
            handle.issued_at.format("%H:%M:%S UTC")
        );
    }
    if let Some(obs) = &run.terminal_observation {
        println!(
            "  Observed: {:?} at {} ({} samples)",
            obs.state,
            obs.observed_at.format("%H:%M:%S UTC"),
            obs.samples
        );
    }
    if let Some(failure) = &run.failure {
        println!();
        println!("  {} {}: {}", "✗".red(), failure.category.to_string().red().bold(), failure.message);
        println!("  {}", failure.remediation.dimmed());
    }
    if let Some(report) = &run.post_report {
        print_report("Post-upgrade validation", report);
    }
    if run.phase() == RunPhase::Monitoring && run.backend_handle.is_some() {
        println!();
        println!(
            "Follow with: akup monitor --run-id {}",
            run.id().cyan()
        );
    }
}

pub fn print_status(
    cluster: &ClusterTarget,
    stores: (&str, &str),
    lease: Option<&Lease>,
    run: Option<&UpgradeRun>,
) {
    println!("{} {}", "Cluster:".bold(), cluster);
    println!("{} lease {} / artifacts {}", "Stores:".bold(), stores.0, stores.1);
    match lease {
        Some(l) => println!(
            "{} held by {} ({}) since {}",
            "Lease:".bold(),
            l.holder.yellow(),
            l.owner,
            l.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("{} {}", "Lease:".bold(), "free".green()),
    }
    match run {
        Some(r) => print_run(r),
        None => println!("No runs recorded."),
    }
}

fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}
