//! Thin wrapper around external CLIs (`az`, `terraform`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::AkupError;

/// Captured result of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Runs external programs. Swapped for a recording fake in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], cwd: Option<PathBuf>)
    -> Result<CommandOutput>;
}

/// Runs commands with `tokio::process`.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<PathBuf>,
    ) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!("Running: {} {}", program, args.join(" "));

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute '{program}'. Is it installed?"))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Azure CLI client.
#[derive(Clone)]
pub struct AzCli {
    runner: Arc<dyn CommandRunner>,
    subscription: Option<String>,
}

impl AzCli {
    pub fn new(runner: Arc<dyn CommandRunner>, subscription: Option<String>) -> Self {
        Self {
            runner,
            subscription,
        }
    }

    fn full_args(&self, args: &[&str]) -> Vec<String> {
        let mut full: Vec<String> = args.iter().map(|s| (*s).to_string()).collect();
        if let Some(sub) = &self.subscription {
            full.extend(["--subscription".to_string(), sub.clone()]);
        }
        full.extend(["--output".to_string(), "json".to_string()]);
        full
    }

    /// Run a read-only `az` query and deserialize its JSON output.
    ///
    /// `component` names the call in errors (e.g. `aks show`).
    pub async fn query<T: DeserializeOwned>(&self, component: &str, args: &[&str]) -> Result<T> {
        let output = self.runner.run("az", &self.full_args(args), None).await?;

        if !output.success() {
            return Err(
                AkupError::AzureCli(component.to_string(), output.stderr.trim().to_string()).into(),
            );
        }

        serde_json::from_str(&output.stdout)
            .with_context(|| format!("Failed to parse 'az {component}' output"))
    }

    /// Run a mutating `az` call. Failures are classified, never retried.
    pub async fn mutate(&self, args: &[&str]) -> Result<String> {
        let output = self.runner.run("az", &self.full_args(args), None).await?;

        if !output.success() {
            let combined = format!("{}\n{}", output.stderr, output.stdout);
            return Err(AkupError::backend("imperative", &combined).into());
        }

        Ok(output.stdout)
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }
}
