//! Shell lifecycle driver.
//!
//! Provisions clusters by running the provider's user-defined lifecycle
//! scripts. Scripts can call any external tool (`kind`, `terraform`, cloud
//! CLIs); the driver only cares about exit codes and, for `config`, stdout.
//!
//! # Script Protocol
//!
//! | Script | When | Required |
//! |--------|------|----------|
//! | `config` | First step of creation; last stdout line is the connection info | No |
//! | `start` | Creates the cluster | Yes |
//! | `prepare` | After `start`, skipped with `no_prepare` | No |
//! | `install` | After `prepare`, skipped with `no_install` | No |
//! | `stop` | Teardown | No |
//!
//! Every script runs in the instance's temporary directory with the
//! instance's resolved `env` on top of the process environment.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    ClusterDriver, ExecResult, InstanceContext, LifecycleScript, ProviderError, ProviderResult,
    ScriptRunner,
};
use crate::config::{InstanceOptions, ProviderConfig, ProviderKind};

/// Variable used as connection info when no `config` script prints one.
const DEFAULT_CONNECTION_VAR: &str = "KUBECONFIG";

/// Driver for `kind = "shell"` providers.
pub struct ShellDriver {
    config: ProviderConfig,
    runner: Arc<dyn ScriptRunner>,
}

impl ShellDriver {
    pub fn new(config: ProviderConfig, runner: Arc<dyn ScriptRunner>) -> Self {
        Self { config, runner }
    }

    fn script(&self, script: LifecycleScript) -> Option<&str> {
        self.config
            .scripts
            .get(script.as_str())
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

#[async_trait]
impl ClusterDriver for ShellDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Shell
    }

    fn validate(&self) -> ProviderResult<()> {
        match self.script(LifecycleScript::Start) {
            Some(_) => Ok(()),
            None => Err(ProviderError::InvalidStartScript),
        }
    }

    async fn create(
        &self,
        ctx: &InstanceContext,
        options: &InstanceOptions,
    ) -> ProviderResult<String> {
        self.validate()?;
        info!("Starting cluster {}", ctx.id);

        let mut connection = None;
        for script in LifecycleScript::CREATION_ORDER {
            let skipped = match script {
                LifecycleScript::Prepare => options.no_prepare,
                LifecycleScript::Install => options.no_install,
                _ => false,
            };
            if skipped {
                debug!("Skipping {} script for {}", script, ctx.id);
                continue;
            }

            let result = self.run_lifecycle_script(script, ctx).await?;
            if script == LifecycleScript::Config {
                connection = result
                    .as_ref()
                    .and_then(ExecResult::last_line)
                    .map(str::to_string);
            }
        }

        let connection = connection
            .or_else(|| ctx.var(DEFAULT_CONNECTION_VAR).map(str::to_string))
            .unwrap_or_else(|| ctx.workdir.join("config").display().to_string());

        info!("Cluster {} is ready", ctx.id);
        Ok(connection)
    }

    async fn run_lifecycle_script(
        &self,
        script: LifecycleScript,
        ctx: &InstanceContext,
    ) -> ProviderResult<Option<ExecResult>> {
        let Some(command) = self.script(script) else {
            return Ok(None);
        };

        debug!("Running {} script for {}: {}", script, ctx.id, command);
        let result = self.runner.execute(command, &ctx.env, &ctx.workdir).await?;

        if !result.success() {
            return Err(ProviderError::ScriptFailed {
                script,
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }

        Ok(Some(result))
    }

    async fn destroy(&self, ctx: &InstanceContext) -> ProviderResult<()> {
        self.run_lifecycle_script(LifecycleScript::Stop, ctx)
            .await
            .map(|_| ())
    }
}
