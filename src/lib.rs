//! cloudtest: runs test suites against pooled, lazily provisioned clusters.
//!
//! Providers describe how to create and destroy cluster instances with a
//! set of lifecycle scripts. Executions describe the tests to run and which
//! providers they may run on. A run discovers the tests, plans one task per
//! test and cluster group, and schedules the tasks concurrently on pooled
//! instances, creating clusters only when demand requires them and tearing
//! them down once their groups go idle.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Config**: TOML schema for providers, executions and run options
//! - **Provider**: Lifecycle script drivers and the environment template
//! - **Cluster**: Instance state machine, per-provider pools, idle teardown
//! - **Framework**: Test discovery and execution inside a package
//! - **Orchestrator**: Planning, scheduling and the run entry point
//! - **Report**: Result aggregation, JUnit XML, console summary
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudtest::config::{load_config, RunArguments};
//! use cloudtest::framework::command::CommandFramework;
//! use cloudtest::provider::process::ProcessScriptRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("cloudtest.toml"))?;
//!     let framework = CommandFramework::new(
//!         config.framework.clone().unwrap_or_default(),
//!         Arc::new(ProcessScriptRunner::default()),
//!     );
//!     let result = cloudtest::perform_testing(config, Arc::new(framework), RunArguments::default()).await;
//!     println!("{:?}", result.map(|report| report.tests()));
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod framework;
pub mod orchestrator;
pub mod provider;
pub mod report;

// Re-export commonly used types
pub use cluster::{ClusterGroup, ClusterPool, IdleMonitor};
pub use config::{CloudTestConfig, RunArguments, load_config};
pub use framework::{TestCase, TestFramework, TestResult};
pub use orchestrator::{Orchestrator, TestingError, perform_testing};
pub use provider::{ClusterDriver, ScriptRunner};
pub use report::{Report, ResultAggregator};
