//! Configuration schema definitions for cloudtest.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Providers describe how cluster instances are
//! provisioned, executions describe the test workloads that run on them.
//!
//! # Schema Overview
//!
//! ```text
//! CloudTestConfig (root)
//! ├── timeout / config_root / fairness   - Global run settings
//! ├── [[providers]] ProviderConfig       - Cluster provisioning templates
//! ├── [[executions]] ExecutionConfig     - Test workloads
//! ├── [framework] CommandFrameworkConfig - How the binary finds and runs tests
//! └── [reporting] ReportingConfig        - Report sink settings
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for cloudtest.
///
/// # TOML Structure
///
/// ```toml
/// timeout = 3600
/// config_root = ".tests/cloud_test"
///
/// [[providers]]
/// name = "kind"
/// kind = "shell"
/// instances = 2
/// retry_count = 1
/// env = ["CLUSTER_NAME=$(cluster-name)", "KUBECONFIG=$(tempdir)/config"]
///
/// [providers.scripts]
/// start = "kind create cluster --name $CLUSTER_NAME"
/// stop = "kind delete cluster --name $CLUSTER_NAME"
///
/// [[executions]]
/// name = "basic"
/// package_root = "./tests/basic"
/// tags = ["basic"]
/// ```
///
/// # Example
///
/// ```
/// use cloudtest::config::CloudTestConfig;
///
/// let config: CloudTestConfig = toml::from_str(r#"
///     timeout = 60
///
///     [[providers]]
///     name = "local"
///     kind = "shell"
///     scripts = { start = "echo started" }
/// "#).unwrap();
/// assert_eq!(config.providers[0].instances, 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudTestConfig {
    /// Global timeout for the whole run, in seconds.
    ///
    /// Once elapsed, every in-flight task is cancelled and the run ends with
    /// a partial report.
    ///
    /// Default: 7200 (2 hours)
    #[serde(default = "default_global_timeout")]
    pub timeout: u64,

    /// Scratch directory. Every cluster instance gets its own temporary
    /// directory below `config_root/<provider>/<instance-id>`.
    ///
    /// Default: `.tests/cloud_test`
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,

    /// How waiters compete for instances of the same provider.
    #[serde(default)]
    pub fairness: FairnessPolicy,

    /// Cluster providers, in declaration order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Test executions, in declaration order.
    #[serde(default)]
    pub executions: Vec<ExecutionConfig>,

    /// Test discovery and run commands used by the `cloudtest` binary.
    pub framework: Option<CommandFrameworkConfig>,

    /// Report sink configuration.
    #[serde(default)]
    pub reporting: ReportingConfig,
}

fn default_global_timeout() -> u64 {
    7200 // 2 hours
}

fn default_config_root() -> PathBuf {
    PathBuf::from(".tests/cloud_test")
}

impl Default for CloudTestConfig {
    fn default() -> Self {
        Self {
            timeout: default_global_timeout(),
            config_root: default_config_root(),
            fairness: FairnessPolicy::default(),
            providers: Vec::new(),
            executions: Vec::new(),
            framework: None,
            reporting: ReportingConfig::default(),
        }
    }
}

/// Policy deciding which waiter gets a freed cluster instance.
///
/// | Policy | Behavior |
/// |--------|----------|
/// | `greedy` | Any waiter whose demand fits takes the instances. Single-cluster tasks may keep a provider busy while a multi-cluster task waits. |
/// | `fifo` | Waiters on a provider are served in arrival order, so multi-cluster tasks cannot be starved. |
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FairnessPolicy {
    #[default]
    Greedy,
    Fifo,
}

/// Kind of a cluster provider, selecting the driver used to provision it.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Lifecycle driven by user supplied shell scripts.
    #[default]
    Shell,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Shell => "shell",
        }
    }
}

/// A cluster provider: a named template for provisioning cluster instances.
///
/// # Example
///
/// ```toml
/// [[providers]]
/// name = "packet"
/// kind = "shell"
/// instances = 2
/// node_count = 2
/// retry_count = 2
/// timeout = 900
/// test_delay = 30
/// env_check = ["PACKET_AUTH_TOKEN", "PACKET_PROJECT_ID"]
/// env = [
///     "CLUSTER_NAME=$(cluster-name)-$(uuid)",
///     "KUBECONFIG=$(tempdir)/config",
///     "TF_VAR_auth_token=${PACKET_AUTH_TOKEN}",
/// ]
///
/// [providers.scripts]
/// config = "echo $KUBECONFIG"
/// start = "./scripts/packet/create.sh"
/// install = "./scripts/install-components.sh"
/// stop = "./scripts/packet/destroy.sh"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Unique provider name.
    pub name: String,

    /// Driver kind.
    #[serde(default)]
    pub kind: ProviderKind,

    /// Maximum number of instances alive at the same time.
    ///
    /// Default: 1
    #[serde(default = "default_one")]
    pub instances: usize,

    /// Number of nodes per cluster instance, exported to every lifecycle
    /// script as `NODE_COUNT`.
    ///
    /// Default: 1
    #[serde(default = "default_one")]
    pub node_count: usize,

    /// Additional creation attempts after the first one fails.
    ///
    /// Default: 0
    #[serde(default)]
    pub retry_count: usize,

    /// Budget for a single creation attempt, in seconds.
    ///
    /// Default: 600 (10 minutes)
    #[serde(default = "default_creation_timeout")]
    pub timeout: u64,

    /// Delay before idle instances are torn down once all tasks of their
    /// cluster group are complete, in seconds.
    ///
    /// Default: 0
    #[serde(default)]
    pub test_delay: u64,

    /// Lifecycle scripts keyed by name: `config`, `start`, `prepare`,
    /// `install`, `stop`. Only `start` is mandatory.
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,

    /// `KEY=VALUE` environment templates, resolved per instance.
    #[serde(default)]
    pub env: Vec<String>,

    /// Environment variables that must be set in the process environment.
    #[serde(default)]
    pub env_check: Vec<String>,

    /// Disabled providers are never selected.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProviderConfig {
    /// Creates an enabled shell provider with default limits and no scripts.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::Shell,
            instances: 1,
            node_count: 1,
            retry_count: 0,
            timeout: default_creation_timeout(),
            test_delay: 0,
            scripts: BTreeMap::new(),
            env: Vec::new(),
            env_check: Vec::new(),
            enabled: true,
        }
    }

    /// Adds or replaces a lifecycle script.
    pub fn with_script(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.scripts.insert(name.into(), command.into());
        self
    }
}

fn default_one() -> usize {
    1
}

fn default_creation_timeout() -> u64 {
    600 // 10 minutes
}

fn default_true() -> bool {
    true
}

/// What an execution runs on its clusters.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    /// Discover test cases below `package_root` and run each one.
    #[default]
    Package,
    /// Run the inline `run` script once per cluster group.
    Shell,
}

/// A declared test workload.
///
/// # Example
///
/// ```toml
/// [[executions]]
/// name = "interdomain"
/// timeout = 600
/// package_root = "./tests/interdomain"
/// tags = ["interdomain"]
/// cluster_count = 2
/// cluster_env = ["KUBECONFIG_CLUSTER_1", "KUBECONFIG_CLUSTER_2"]
/// cluster_selector = ["aws", "gke"]
///
/// [[executions]]
/// name = "smoke"
/// kind = "shell"
/// run = """
/// kubectl get nodes
/// kubectl get pods -A
/// """
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Unique execution name, also the name of its report suite.
    pub name: String,

    #[serde(default)]
    pub kind: ExecutionKind,

    /// Per-task timeout, in seconds.
    ///
    /// Default: 600 (10 minutes)
    #[serde(default = "default_execution_timeout")]
    pub timeout: u64,

    /// Root of the test package (package executions).
    pub package_root: Option<PathBuf>,

    /// Inline script (shell executions).
    pub run: Option<String>,

    /// Tag filter. Empty selects every discovered test.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Provider names to run on. Empty selects every enabled provider.
    #[serde(default)]
    pub cluster_selector: Vec<String>,

    /// Number of clusters each task needs at the same time.
    ///
    /// Default: 1
    #[serde(default = "default_one")]
    pub cluster_count: usize,

    /// One variable name per required cluster, receiving that cluster's
    /// connection info.
    #[serde(default)]
    pub cluster_env: Vec<String>,

    /// Disabled executions are not planned.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_execution_timeout() -> u64 {
    600 // 10 minutes
}

impl ExecutionConfig {
    /// Creates a package execution rooted at `package_root`.
    pub fn package(name: impl Into<String>, package_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: ExecutionKind::Package,
            timeout: default_execution_timeout(),
            package_root: Some(package_root.into()),
            run: None,
            tags: Vec::new(),
            cluster_selector: Vec::new(),
            cluster_count: 1,
            cluster_env: Vec::new(),
            enabled: true,
        }
    }

    /// Creates a shell execution running `script`.
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            kind: ExecutionKind::Shell,
            package_root: None,
            run: Some(script.into()),
            ..Self::package(name, "")
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_selector<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cluster_selector = providers.into_iter().map(Into::into).collect();
        self
    }

    /// Requires `names.len()` clusters per task, exposed under `names`.
    pub fn with_cluster_env<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cluster_env = names.into_iter().map(Into::into).collect();
        self.cluster_count = self.cluster_env.len().max(1);
        self
    }
}

/// Commands used by the binary's built-in test runner.
///
/// # Protocol
///
/// - **discover_command**: prints one test per line as `name [tag...]`;
///   blank lines and lines starting with `#` are ignored
/// - **run_command**: runs a single test, `{test}` is replaced by its name;
///   exit code 0 means the test passed
///
/// Both run from the execution's `package_root`.
///
/// # Example: Go tests
///
/// ```toml
/// [framework]
/// discover_command = "go test -list '.*' ./... | grep '^Test'"
/// run_command = "go test -count=1 -run '^{test}$' ./..."
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandFrameworkConfig {
    pub discover_command: String,
    pub run_command: String,
}

impl Default for CommandFrameworkConfig {
    fn default() -> Self {
        Self {
            discover_command: "go test -list '.*' ./... | grep '^Test'".to_string(),
            run_command: "go test -count=1 -v -run '^{test}$' ./...".to_string(),
        }
    }
}

/// Report sink configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportingConfig {
    /// Path of the JUnit XML report. No report file is written when unset.
    pub junit_report_file: Option<PathBuf>,
}

/// Options applied to every instance created during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceOptions {
    /// Leave instances running when the run ends.
    pub no_stop: bool,
    /// Skip the `prepare` script.
    pub no_prepare: bool,
    /// Skip the `install` script.
    pub no_install: bool,
}

/// Runtime arguments supplied by the caller of a run.
#[derive(Debug, Clone, Default)]
pub struct RunArguments {
    /// Only use these providers (all enabled providers when empty).
    pub providers: Vec<String>,

    /// Replaces every execution's tag filter when non-empty.
    pub tags: Vec<String>,

    /// Maximum number of tasks planned per execution.
    pub count: Option<usize>,

    pub instance_options: InstanceOptions,

    /// Overrides [`CloudTestConfig::fairness`].
    pub fairness: Option<FairnessPolicy>,
}

/// A configuration problem detected by [`CloudTestConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate provider name: {0}")]
    DuplicateProvider(String),

    #[error("duplicate execution name: {0}")]
    DuplicateExecution(String),

    #[error("provider {provider}: {field} must be at least 1")]
    ZeroLimit {
        provider: String,
        field: &'static str,
    },

    #[error("execution {0}: cluster_count must be at least 1")]
    ZeroClusterCount(String),

    #[error("execution {0}: shell executions require a run script")]
    MissingRunScript(String),

    #[error("execution {0}: package executions require a package_root")]
    MissingPackageRoot(String),
}

impl CloudTestConfig {
    /// Checks cross-field invariants that serde cannot express.
    ///
    /// Returns the first problem found, in declaration order.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if !provider_names.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            if provider.instances == 0 {
                return Err(ConfigError::ZeroLimit {
                    provider: provider.name.clone(),
                    field: "instances",
                });
            }
            if provider.node_count == 0 {
                return Err(ConfigError::ZeroLimit {
                    provider: provider.name.clone(),
                    field: "node_count",
                });
            }
        }

        let mut execution_names = HashSet::new();
        for execution in &self.executions {
            if !execution_names.insert(execution.name.as_str()) {
                return Err(ConfigError::DuplicateExecution(execution.name.clone()));
            }
            if execution.cluster_count == 0 {
                return Err(ConfigError::ZeroClusterCount(execution.name.clone()));
            }
            match execution.kind {
                ExecutionKind::Shell if execution.run.is_none() => {
                    return Err(ConfigError::MissingRunScript(execution.name.clone()));
                }
                ExecutionKind::Package if execution.package_root.is_none() => {
                    return Err(ConfigError::MissingPackageRoot(execution.name.clone()));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Returns the provider with the given name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}
