//! Provider traits and implementations for cluster lifecycle management.
//!
//! This module defines the abstractions the scheduling core uses to create
//! and destroy cluster instances. The core never talks to a concrete cloud:
//! it only sees a [`ClusterDriver`] selected from the provider's `kind`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ClusterDriver                           │
//! │  (one implementation per provider kind)                      │
//! │                                                              │
//! │  validate()                                                  │
//! │  create(ctx) ─────────► connection info                      │
//! │  run_lifecycle_script(script, ctx)                           │
//! │  destroy(ctx)                                                │
//! └────────────────────────────────┬────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ScriptRunner                           │
//! │  execute(script, env, workdir) ───► ExecResult               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Drivers
//!
//! | Kind | Module | Description |
//! |------|--------|-------------|
//! | `shell` | [`shell`] | Lifecycle scripts run through a [`ScriptRunner`] |

pub mod process;
pub mod shell;
pub mod template;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{InstanceOptions, ProviderConfig, ProviderKind};

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur while driving a cluster lifecycle.
///
/// - **Configuration**: `InvalidStartScript`, `Template` - retrying cannot help
/// - **Execution**: `ScriptFailed`, `ExecFailed`, `Timeout` - an attempt failed,
///   the pool may retry
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The mandatory `start` script is missing or blank.
    #[error("invalid start script")]
    InvalidStartScript,

    /// A lifecycle script ran and exited with a non-zero code.
    #[error("{script} script failed with exit code {exit_code}: {stderr}")]
    ScriptFailed {
        script: LifecycleScript,
        exit_code: i32,
        stderr: String,
    },

    /// The script could not be started at all.
    #[error("Failed to execute script: {0}")]
    ExecFailed(String),

    /// A creation attempt exceeded its budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An environment template could not be resolved.
    #[error(transparent)]
    Template(#[from] template::TemplateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Returns `true` when another creation attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderError::InvalidStartScript | ProviderError::Template(_)
        )
    }
}

/// Named lifecycle scripts of a provider, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleScript {
    Config,
    Start,
    Prepare,
    Install,
    Stop,
}

impl LifecycleScript {
    /// Scripts run, in order, when an instance is created.
    pub const CREATION_ORDER: [LifecycleScript; 4] = [
        LifecycleScript::Config,
        LifecycleScript::Start,
        LifecycleScript::Prepare,
        LifecycleScript::Install,
    ];

    /// The key of this script in [`ProviderConfig::scripts`].
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleScript::Config => "config",
            LifecycleScript::Start => "start",
            LifecycleScript::Prepare => "prepare",
            LifecycleScript::Install => "install",
            LifecycleScript::Stop => "stop",
        }
    }
}

impl fmt::Display for LifecycleScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running a script.
///
/// # Example
///
/// ```
/// use cloudtest::provider::ExecResult;
/// use std::time::Duration;
///
/// let result = ExecResult {
///     exit_code: 0,
///     stdout: "started\n".to_string(),
///     stderr: String::new(),
///     duration: Duration::from_millis(20),
/// };
/// assert!(result.success());
/// assert_eq!(result.last_line(), Some("started"));
/// ```
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the script. 0 indicates success.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the script took to execute.
    pub duration: std::time::Duration,
}

impl ExecResult {
    /// Returns `true` if the script succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stdout, trimmed.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|line| !line.is_empty())
    }
}

/// The Lifecycle Script Runner: executes a script with extra environment
/// variables in a working directory.
///
/// Implementations must stop the underlying process when the returned future
/// is dropped, since cancellation is expressed by dropping futures.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Runs `script` with `env` layered over the process environment.
    async fn execute(
        &self,
        script: &str,
        env: &[(String, String)],
        workdir: &Path,
    ) -> ProviderResult<ExecResult>;
}

/// Everything a driver needs to know about the instance it operates on.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    /// Instance id, `<provider>-<ordinal>`.
    pub id: String,

    /// Owning provider name.
    pub provider: String,

    /// Per-instance temporary directory; scripts run here.
    pub workdir: PathBuf,

    /// Resolved environment templates, in declaration order.
    pub env: Vec<(String, String)>,
}

impl InstanceContext {
    /// Looks up a resolved environment variable of this instance.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Polymorphic capability to provision clusters of one provider kind.
///
/// The pool depends only on this trait; [`driver_for`] picks the
/// implementation from [`ProviderConfig::kind`].
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// The provider kind this driver serves.
    fn kind(&self) -> ProviderKind;

    /// Static checks run before any instance is created.
    ///
    /// # Errors
    ///
    /// - `ProviderError::InvalidStartScript` - no usable `start` script
    fn validate(&self) -> ProviderResult<()>;

    /// Creates the cluster for `ctx` and returns its connection info.
    async fn create(&self, ctx: &InstanceContext, options: &InstanceOptions)
    -> ProviderResult<String>;

    /// Runs a single lifecycle script. Absent optional scripts succeed
    /// without running anything and yield `None`.
    async fn run_lifecycle_script(
        &self,
        script: LifecycleScript,
        ctx: &InstanceContext,
    ) -> ProviderResult<Option<ExecResult>>;

    /// Tears the cluster for `ctx` down.
    async fn destroy(&self, ctx: &InstanceContext) -> ProviderResult<()>;
}

/// Selects the driver implementation for a provider.
pub fn driver_for(
    config: &ProviderConfig,
    runner: Arc<dyn ScriptRunner>,
) -> Arc<dyn ClusterDriver> {
    match config.kind {
        ProviderKind::Shell => Arc::new(shell::ShellDriver::new(config.clone(), runner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_line_skips_trailing_blank_lines() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "first\n./.tests/config\n\n  \n".into(),
            stderr: String::new(),
            duration: std::time::Duration::ZERO,
        };
        assert_eq!(result.last_line(), Some("./.tests/config"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(!ProviderError::InvalidStartScript.is_retryable());
        assert!(ProviderError::Timeout("slow".into()).is_retryable());
        assert!(
            ProviderError::ScriptFailed {
                script: LifecycleScript::Start,
                exit_code: 1,
                stderr: String::new(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_instance_context_var_prefers_latest() {
        let ctx = InstanceContext {
            id: "p-1".into(),
            provider: "p".into(),
            workdir: PathBuf::from("/tmp"),
            env: vec![("A".into(), "1".into()), ("A".into(), "2".into())],
        };
        assert_eq!(ctx.var("A"), Some("2"));
        assert_eq!(ctx.var("B"), None);
    }
}
