//! Test framework abstraction.
//!
//! The scheduler never interprets test code. A [`TestFramework`] finds the
//! test cases of a package execution and runs one of them against the
//! clusters bound to its task.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TestFramework                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  discover(&execution) ──────────► Vec<TestCase>               │
//! │                                         │                     │
//! │                                         ▼ (one task per case) │
//! │  run(&execution, &case, &env) ──► TestResult                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Frameworks
//!
//! | Implementation | Discovery Method |
//! |----------------|------------------|
//! | [`command::CommandFramework`] | User supplied discover and run commands |
//!
//! # Custom Frameworks
//!
//! ```no_run
//! use async_trait::async_trait;
//! use cloudtest::config::ExecutionConfig;
//! use cloudtest::framework::*;
//!
//! struct GoFramework;
//!
//! #[async_trait]
//! impl TestFramework for GoFramework {
//!     async fn discover(&self, execution: &ExecutionConfig) -> FrameworkResult<Vec<TestCase>> {
//!         Ok(vec![TestCase::new("TestSingleCluster").with_tags(["basic"])])
//!     }
//!
//!     async fn run(
//!         &self,
//!         execution: &ExecutionConfig,
//!         test: &TestCase,
//!         env: &[(String, String)],
//!     ) -> FrameworkResult<TestResult> {
//!         Ok(TestResult::passed(&test.name))
//!     }
//! }
//! ```

pub mod command;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ExecutionConfig;

/// Result type for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    /// Test discovery command failed.
    #[error("Failed to discover tests: {0}")]
    DiscoveryFailed(String),

    /// Failed to execute a test.
    #[error("Command execution failed: {0}")]
    ExecFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A discovered test case of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,

    /// Declared tags, matched against an execution's tag filter.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `true` if the test is selected by `filter`.
    ///
    /// An empty filter selects every test.
    pub fn matches(&self, filter: &[String]) -> bool {
        filter.is_empty() || self.tags.iter().any(|tag| filter.contains(tag))
    }
}

/// Outcome of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
}

/// Result of running one test case or shell task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub outcome: TestOutcome,

    /// Wall-clock time the test took to execute.
    pub duration: Duration,

    /// Failure description, or captured output worth keeping.
    pub message: Option<String>,
}

impl TestResult {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: TestOutcome::Passed,
            duration: Duration::ZERO,
            message: None,
        }
    }

    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: TestOutcome::Failed,
            duration: Duration::ZERO,
            message: Some(message.into()),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_passed(&self) -> bool {
        self.outcome == TestOutcome::Passed
    }
}

/// Finds and runs the test cases of package executions.
#[async_trait]
pub trait TestFramework: Send + Sync {
    /// Lists the test cases below `execution.package_root`.
    async fn discover(&self, execution: &ExecutionConfig) -> FrameworkResult<Vec<TestCase>>;

    /// Runs one test with the task's cluster bindings in `env`.
    ///
    /// A failing test is an `Ok` result with [`TestOutcome::Failed`];
    /// `Err` means the test could not be run at all.
    async fn run(
        &self,
        execution: &ExecutionConfig,
        test: &TestCase,
        env: &[(String, String)],
    ) -> FrameworkResult<TestResult>;
}
