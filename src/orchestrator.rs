//! Test run orchestration.
//!
//! This module ties discovery, planning, cluster pools, scheduling and
//! aggregation together into one run.
//!
//! # Architecture
//!
//! ```text
//!   TestFramework            Planner              ClusterPool(s)
//!        │                      │                       │
//!        │ discover()           │                       │
//!        ▼                      │                       │
//!   Discovered ────────────────►│ plan()                │
//!                               ▼                       │
//!                       Vec<Task> + PlanErrors          │
//!                               │                       │
//!                               │   pre-flight ────────►│ validate / env_check
//!                               ▼                       │
//!                         TaskScheduler ── acquire ────►│
//!                               │                       │
//!                         TaskRunner                    │
//!                               │                       │
//!                       ResultAggregator   IdleMonitor ─┘ destroy_all
//!                               │
//!                               ▼
//!                            Report
//! ```
//!
//! # Outcome
//!
//! | Result | Report | Meaning |
//! |--------|--------|---------|
//! | `Ok(report)` | full | Every test passed |
//! | `TestingError::TestsFailed` | full | At least one test failed |
//! | `TestingError::GlobalTimeout` | partial | The run hit the global `timeout` |
//! | `TestingError::Precondition` | none | Nothing could run |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudtest::config::{load_config, RunArguments};
//! use cloudtest::framework::command::CommandFramework;
//! use cloudtest::orchestrator::perform_testing;
//! use cloudtest::provider::process::ProcessScriptRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("cloudtest.toml"))?;
//!     let framework = CommandFramework::new(
//!         config.framework.clone().unwrap_or_default(),
//!         Arc::new(ProcessScriptRunner::default()),
//!     );
//!
//!     match perform_testing(config, Arc::new(framework), RunArguments::default()).await {
//!         Ok(report) => println!("{} tests passed", report.tests()),
//!         Err(err) => eprintln!("{err}"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod planner;
pub mod runner;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cluster::{ClusterPool, IdleMonitor};
use crate::config::{CloudTestConfig, ExecutionKind, RunArguments};
use crate::framework::TestFramework;
use crate::provider::process::ProcessScriptRunner;
use crate::provider::{ScriptRunner, driver_for};
use crate::report::{Report, ResultAggregator};

pub use planner::{Discovered, Plan, PlanError, Task, TaskBody, TaskStatus, plan};
pub use runner::TaskRunner;
pub use scheduler::{SchedulerOutcome, TaskScheduler};

/// Why a run did not succeed.
///
/// Every variant except `Precondition` carries the report of the run.
#[derive(Debug, thiserror::Error)]
pub enum TestingError {
    /// The run could not start, or no cluster could ever be created.
    #[error("{0}")]
    Precondition(String),

    /// The global deadline elapsed; the report holds what finished or was
    /// running at that point.
    #[error("global timeout elapsed: {seconds} seconds")]
    GlobalTimeout { seconds: u64, report: Report },

    #[error("there is failed tests {count}")]
    TestsFailed { count: usize, report: Report },
}

impl TestingError {
    /// The report of the run, `None` for precondition errors.
    pub fn report(&self) -> Option<&Report> {
        match self {
            TestingError::Precondition(_) => None,
            TestingError::GlobalTimeout { report, .. } | TestingError::TestsFailed { report, .. } => {
                Some(report)
            }
        }
    }

    /// Process exit code for this error.
    ///
    /// | Code | Meaning |
    /// |------|---------|
    /// | 1 | Tests failed |
    /// | 2 | Precondition error |
    /// | 3 | Global timeout |
    pub fn exit_code(&self) -> i32 {
        match self {
            TestingError::TestsFailed { .. } => 1,
            TestingError::Precondition(_) => 2,
            TestingError::GlobalTimeout { .. } => 3,
        }
    }
}

fn creation_error(cause: impl std::fmt::Display) -> TestingError {
    TestingError::Precondition(format!("Failed to create cluster instance. Error {cause}"))
}

/// Runs every execution of `config` with lifecycle scripts executed as
/// local processes.
pub async fn perform_testing(
    config: CloudTestConfig,
    framework: Arc<dyn TestFramework>,
    args: RunArguments,
) -> Result<Report, TestingError> {
    Orchestrator::new(config, framework).run(args).await
}

/// Coordinates a complete test run.
pub struct Orchestrator {
    config: CloudTestConfig,
    framework: Arc<dyn TestFramework>,
    scripts: Arc<dyn ScriptRunner>,
}

impl Orchestrator {
    pub fn new(config: CloudTestConfig, framework: Arc<dyn TestFramework>) -> Self {
        Self {
            config,
            framework,
            scripts: Arc::new(ProcessScriptRunner::default()),
        }
    }

    /// Replaces the runner used for lifecycle scripts and shell executions.
    pub fn with_script_runner(mut self, scripts: Arc<dyn ScriptRunner>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn config(&self) -> &CloudTestConfig {
        &self.config
    }

    /// Discovers tests and plans the run without creating any cluster.
    pub async fn plan(&self, args: &RunArguments) -> Plan {
        let discovered = self.discover().await;
        planner::plan(
            &self.config.executions,
            &self.config.providers,
            &discovered,
            args,
        )
    }

    async fn discover(&self) -> Discovered {
        let mut discovered = Discovered::new();
        for execution in &self.config.executions {
            if !execution.enabled || execution.kind != ExecutionKind::Package {
                continue;
            }
            let tests = self
                .framework
                .discover(execution)
                .await
                .map_err(|e| e.to_string());
            if let Ok(tests) = &tests {
                info!("Discovered {} tests for {}", tests.len(), execution.name);
            }
            discovered.insert(execution.name.clone(), tests);
        }
        discovered
    }

    /// Creates a pool for every selected provider after checking its
    /// driver and required environment.
    fn build_pools(
        &self,
        args: &RunArguments,
    ) -> Result<HashMap<String, Arc<ClusterPool>>, TestingError> {
        let fairness = args.fairness.unwrap_or(self.config.fairness);
        let mut pools = HashMap::new();

        for provider in &self.config.providers {
            if !provider.enabled
                || !(args.providers.is_empty() || args.providers.contains(&provider.name))
            {
                continue;
            }

            let driver = driver_for(provider, Arc::clone(&self.scripts));
            driver.validate().map_err(creation_error)?;

            let pool = ClusterPool::new(provider.clone(), driver, &self.config.config_root)
                .with_options(args.instance_options)
                .with_fairness(fairness);
            pool.check_required_env(|key| std::env::var(key).ok())
                .map_err(creation_error)?;

            pools.insert(provider.name.clone(), Arc::new(pool));
        }

        Ok(pools)
    }

    /// Runs the whole configuration.
    pub async fn run(&self, args: RunArguments) -> Result<Report, TestingError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout);

        self.config
            .validate()
            .map_err(|e| TestingError::Precondition(format!("invalid configuration: {e}")))?;

        let pools = self.build_pools(&args)?;
        let plan = self.plan(&args).await;

        let aggregator = Arc::new(ResultAggregator::new());
        for error in &plan.errors {
            warn!("{}", error);
            aggregator.record_plan_error(error);
        }

        let monitor = Arc::new(IdleMonitor::new(pools.clone()));
        let runner = TaskRunner::new(
            Arc::clone(&self.framework),
            Arc::clone(&self.scripts),
            &self.config.config_root,
        );
        let scheduler = TaskScheduler::new(pools.clone(), Arc::clone(&monitor), runner, Arc::clone(&aggregator));

        info!(
            "Starting test execution: {} tasks on providers {:?}",
            plan.tasks.len(),
            plan.providers()
        );
        let outcome = scheduler.run(plan.tasks, deadline).await;

        monitor
            .shutdown(matches!(outcome, SchedulerOutcome::Completed))
            .await;
        let mut remaining: Vec<_> = pools.values().collect();
        remaining.sort_by(|a, b| a.provider().cmp(b.provider()));
        join_all(remaining.into_iter().map(|pool| pool.destroy_all())).await;
        info!("Finished test execution");

        let report = aggregator.finalize();
        match outcome {
            SchedulerOutcome::Fatal(err) => Err(TestingError::Precondition(err.to_string())),
            SchedulerOutcome::GlobalTimeout => Err(TestingError::GlobalTimeout {
                seconds: self.config.timeout,
                report,
            }),
            SchedulerOutcome::Completed if report.failures() > 0 => Err(TestingError::TestsFailed {
                count: report.failures(),
                report,
            }),
            SchedulerOutcome::Completed => Ok(report),
        }
    }
}
