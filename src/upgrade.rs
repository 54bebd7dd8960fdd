//! Upgrade plans, runs and the executor that drives them.

pub mod executor;
pub mod plan;
pub mod run;

pub use executor::{Executor, ExecutorDeps, ExecutorOptions, RunObserver};
pub use plan::{BackendKind, UpgradePlan, UpgradePlanBuilder, UpgradeScope};
pub use run::{BackendHandle, RunOptions, RunPhase, TerminalObservation, TerminalState, UpgradeRun};
