//! Result aggregation and console output.
//!
//! Task results are folded into a three level suite tree as they arrive:
//!
//! ```text
//! All tests                      (root suite)
//! ├── <execution>                (suite, declaration order)
//! │   ├── <cluster group>        (suite, group order of the plan)
//! │   │   └── <test case>        (task order)
//! │   └── planning               (test case, only when the execution failed to plan)
//! └── ...
//! ```
//!
//! A planning failure is a test case owned directly by the execution suite,
//! next to its group suites.
//!
//! The tree is keyed by plan positions rather than arrival order, so the
//! finalized report is identical for identical input regardless of which
//! task completes first.

pub mod junit;

pub use junit::write_report;

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::framework::TestResult;
use crate::orchestrator::planner::{PlanError, Task, TaskStatus};

/// Name of the report root suite.
pub const ROOT_SUITE: &str = "All tests";

/// Name of the test case recording a planning error.
pub const PLANNING_CASE: &str = "planning";

#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestCaseReport {
    pub name: String,
    pub time: Duration,
    pub failure: Option<Failure>,
}

impl TestCaseReport {
    fn from_result(result: &TestResult) -> Self {
        Self {
            name: result.name.clone(),
            time: result.duration,
            failure: (!result.is_passed()).then(|| Failure {
                message: result.message.clone().unwrap_or_default(),
            }),
        }
    }
}

/// A node of the report tree.
///
/// `tests` and `failures` always equal the sum over `suites` plus the
/// suite's own `test_cases`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Suite {
    pub name: String,
    pub tests: usize,
    pub failures: usize,
    pub time: Duration,
    pub suites: Vec<Suite>,
    pub test_cases: Vec<TestCaseReport>,
}

impl Suite {
    fn new(name: impl Into<String>, suites: Vec<Suite>, test_cases: Vec<TestCaseReport>) -> Self {
        let tests = suites.iter().map(|s| s.tests).sum::<usize>() + test_cases.len();
        let failures = suites.iter().map(|s| s.failures).sum::<usize>()
            + test_cases.iter().filter(|c| c.failure.is_some()).count();
        let time = suites.iter().map(|s| s.time).sum::<Duration>()
            + test_cases.iter().map(|c| c.time).sum::<Duration>();
        Self {
            name: name.into(),
            tests,
            failures,
            time,
            suites,
            test_cases,
        }
    }

    /// Child suite with the given name.
    pub fn suite(&self, name: &str) -> Option<&Suite> {
        self.suites.iter().find(|s| s.name == name)
    }

    /// Own test case with the given name.
    pub fn test_case(&self, name: &str) -> Option<&TestCaseReport> {
        self.test_cases.iter().find(|c| c.name == name)
    }
}

/// Finalized result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub root: Suite,
    pub started_at: DateTime<Utc>,
    /// Failed test cases whose task hit its execution timeout.
    pub timed_out: usize,
}

impl Report {
    pub fn tests(&self) -> usize {
        self.root.tests
    }

    pub fn failures(&self) -> usize {
        self.root.failures
    }
}

#[derive(Default)]
struct CaseNode {
    name: String,
    cases: BTreeMap<usize, TestCaseReport>,
}

#[derive(Default)]
struct ExecutionNode {
    name: String,
    groups: BTreeMap<usize, CaseNode>,
    cases: Vec<TestCaseReport>,
}

#[derive(Default)]
struct Tree {
    executions: BTreeMap<usize, ExecutionNode>,
    tests: usize,
    failures: usize,
    timed_out: usize,
}

/// Collects task results into the report tree.
///
/// All mutation goes through one mutex, so concurrent folds never
/// interleave updates of the same suite.
pub struct ResultAggregator {
    tree: Mutex<Tree>,
    started_at: DateTime<Utc>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Tree::default()),
            started_at: Utc::now(),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds the result of `task` below its execution and group suites.
    pub fn fold(&self, task: &Task, result: &TestResult) {
        let mut tree = self.tree();
        let execution = tree
            .executions
            .entry(task.execution_index)
            .or_insert_with(|| ExecutionNode {
                name: task.execution.name.clone(),
                ..Default::default()
            });
        let group = execution
            .groups
            .entry(task.group_index)
            .or_insert_with(|| CaseNode {
                name: task.group.key(),
                ..Default::default()
            });
        group.cases.insert(task.id, TestCaseReport::from_result(result));

        tree.tests += 1;
        if !result.is_passed() {
            tree.failures += 1;
        }
        if task.status == TaskStatus::TimedOut {
            tree.timed_out += 1;
        }

        let status = match task.status {
            TaskStatus::TimedOut => "timed out",
            _ if result.is_passed() => "passed",
            _ => "failed",
        };
        info!(
            "[{}] {} on {}: {} ({} tests, {} failed so far)",
            task.execution.name,
            task.case_name(),
            task.group,
            status,
            tree.tests,
            tree.failures
        );
    }

    /// Records an execution that could not be planned as a failed suite.
    pub fn record_plan_error(&self, error: &PlanError) {
        let mut tree = self.tree();
        let execution = tree
            .executions
            .entry(error.execution_index)
            .or_insert_with(|| ExecutionNode {
                name: error.execution.clone(),
                ..Default::default()
            });
        execution.cases.push(TestCaseReport {
            name: PLANNING_CASE.to_string(),
            time: Duration::ZERO,
            failure: Some(Failure {
                message: error.message.clone(),
            }),
        });

        tree.tests += 1;
        tree.failures += 1;
    }

    /// Number of failures folded so far.
    pub fn failures(&self) -> usize {
        self.tree().failures
    }

    /// Builds the report, recounting every suite from its leaves.
    pub fn finalize(&self) -> Report {
        let tree = self.tree();
        let executions = tree
            .executions
            .values()
            .map(|execution| {
                let groups = execution
                    .groups
                    .values()
                    .map(|group| Suite::new(&group.name, Vec::new(), group.cases.values().cloned().collect()))
                    .collect();
                Suite::new(&execution.name, groups, execution.cases.clone())
            })
            .collect();

        Report {
            root: Suite::new(ROOT_SUITE, executions, Vec::new()),
            started_at: self.started_at,
            timed_out: tree.timed_out,
        }
    }
}

/// Prints a summary of the report to the console.
pub fn print_summary(report: &Report) {
    println!();
    println!("Test Results:");
    for execution in &report.root.suites {
        let status = if execution.failures == 0 {
            console::style("ok").green()
        } else {
            console::style("FAILED").red()
        };
        println!(
            "  {:<30} {:>4} tests  {:>4} failed  {}",
            execution.name, execution.tests, execution.failures, status
        );
    }
    println!("  Total:   {}", report.root.tests);
    println!(
        "  Passed:  {}",
        console::style(report.root.tests - report.root.failures).green()
    );
    println!("  Failed:  {}", console::style(report.root.failures).red());
    if report.timed_out > 0 {
        println!("  Timed out: {}", console::style(report.timed_out).yellow());
    }
    println!("  Duration: {:?}", report.root.time);

    println!();
    if report.root.failures == 0 {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}
