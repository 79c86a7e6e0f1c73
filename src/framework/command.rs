//! Command-driven test framework.
//!
//! Lets users plug in any test tool through two shell commands, both run
//! from the execution's `package_root`:
//!
//! - `discover_command` prints one test per line: `name [tag...]`
//! - `run_command` runs a single test; `{test}` is replaced by the quoted
//!   test name and the task's cluster bindings are exported

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{FrameworkError, FrameworkResult, TestCase, TestFramework, TestResult};
use crate::config::{CommandFrameworkConfig, ExecutionConfig};
use crate::provider::ScriptRunner;

/// Lines of output kept in a failure message.
const FAILURE_TAIL_LINES: usize = 20;

pub struct CommandFramework {
    config: CommandFrameworkConfig,
    runner: Arc<dyn ScriptRunner>,
}

impl CommandFramework {
    pub fn new(config: CommandFrameworkConfig, runner: Arc<dyn ScriptRunner>) -> Self {
        Self { config, runner }
    }

    fn package_root(execution: &ExecutionConfig) -> PathBuf {
        execution
            .package_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Parses discovery output, one `name [tag...]` entry per line.
    fn parse_discover_output(output: &str) -> Vec<TestCase> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let name = fields.next()?;
                Some(TestCase::new(name).with_tags(fields))
            })
            .collect()
    }

    fn substitute_test(&self, test: &TestCase) -> String {
        self.config
            .run_command
            .replace("{test}", &shell_words::quote(&test.name))
    }
}

fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl TestFramework for CommandFramework {
    async fn discover(&self, execution: &ExecutionConfig) -> FrameworkResult<Vec<TestCase>> {
        let root = Self::package_root(execution);
        let result = self
            .runner
            .execute(&self.config.discover_command, &[], &root)
            .await
            .map_err(|e| FrameworkError::DiscoveryFailed(e.to_string()))?;

        if !result.success() {
            return Err(FrameworkError::DiscoveryFailed(format!(
                "discovery command exited with code {} in {}: {}",
                result.exit_code,
                root.display(),
                result.stderr.trim()
            )));
        }

        let tests = Self::parse_discover_output(&result.stdout);
        if tests.is_empty() {
            warn!("No tests discovered for execution {}", execution.name);
        }
        Ok(tests)
    }

    async fn run(
        &self,
        execution: &ExecutionConfig,
        test: &TestCase,
        env: &[(String, String)],
    ) -> FrameworkResult<TestResult> {
        let root = Self::package_root(execution);
        let command = self.substitute_test(test);
        debug!("Running {} in {}: {}", test.name, root.display(), command);

        let result = self
            .runner
            .execute(&command, env, &root)
            .await
            .map_err(|e| FrameworkError::ExecFailed(e.to_string()))?;

        let outcome = if result.success() {
            TestResult::passed(&test.name)
        } else {
            let output = if result.stderr.trim().is_empty() {
                &result.stdout
            } else {
                &result.stderr
            };
            TestResult::failed(
                &test.name,
                format!(
                    "exit code {}\n{}",
                    result.exit_code,
                    tail(output, FAILURE_TAIL_LINES)
                ),
            )
        };

        Ok(outcome.with_duration(result.duration))
    }
}
