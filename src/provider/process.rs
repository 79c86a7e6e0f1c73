//! Local process script runner.
//!
//! Runs lifecycle scripts and inline execution scripts as child processes
//! of cloudtest, through `sh -ec` so that multi-line scripts stop at the
//! first failing line.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecResult, ProviderError, ProviderResult, ScriptRunner};

/// Script runner that spawns a local shell per script.
pub struct ProcessScriptRunner {
    shell: String,
}

impl ProcessScriptRunner {
    /// Creates a runner using the given shell binary.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ProcessScriptRunner {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn execute(
        &self,
        script: &str,
        env: &[(String, String)],
        workdir: &Path,
    ) -> ProviderResult<ExecResult> {
        let start = Instant::now();

        tokio::fs::create_dir_all(workdir).await?;

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-ec").arg(script);
        process.current_dir(workdir);

        // Set environment variables
        for (key, value) in env {
            process.env(key, value);
        }

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        // Cancellation drops this future; the child must not outlive it.
        process.kill_on_drop(true);

        let output = process
            .output()
            .await
            .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        let result = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };

        for line in result.stdout.lines() {
            debug!("[{}] {}", workdir.display(), line);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_captures_output_and_env() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ProcessScriptRunner::default();

        let result = runner
            .execute(
                "echo \"value=$CLOUDTEST_VALUE\"",
                &[("CLOUDTEST_VALUE".to_string(), "42".to_string())],
                dir.path(),
            )
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.last_line(), Some("value=42"));
    }

    #[tokio::test]
    async fn test_execute_stops_at_first_failing_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ProcessScriptRunner::default();

        let result = runner
            .execute("echo one\nexit 3\necho never", &[], dir.path())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.stdout.contains("never"));
    }

    #[tokio::test]
    async fn test_execute_creates_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let workdir = dir.path().join("nested/instance-1");
        let runner = ProcessScriptRunner::default();

        let result = runner.execute("pwd", &[], &workdir).await.unwrap();

        assert!(result.success());
        assert!(workdir.is_dir());
    }
}
