//! Child process execution with console capture.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// Shell used for `run:` steps without a `shell:` key.
pub const DEFAULT_SHELL: &str = "bash -xe {0}";

/// Result of a finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Exit code, `-1` if the process was terminated by a signal.
    pub exit_code: i32,

    /// Interleaved stdout and stderr as written to the console file.
    pub console_output: String,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command template for a step's `shell:` value.
///
/// Named shells expand to their standard invocations; any other value is
/// used as written with ` {0}` appended when it has no placeholder.
pub fn shell_template(shell: Option<&str>) -> String {
    match shell.map(str::trim) {
        None | Some("") => DEFAULT_SHELL.to_string(),
        Some("bash") => "bash --noprofile --norc -eo pipefail {0}".to_string(),
        Some("sh") => "sh -e {0}".to_string(),
        Some("python") => "python {0}".to_string(),
        Some(custom) if custom.contains("{0}") => custom.to_string(),
        Some(custom) => format!("{} {{0}}", custom),
    }
}

/// Argument vector running `script` under `shell`.
pub fn shell_command(shell: Option<&str>, script: &Path) -> Vec<String> {
    let script = script.display().to_string();
    shell_template(shell)
        .split_whitespace()
        .map(|part| part.replace("{0}", &script))
        .collect()
}

/// Run `argv` to completion in `cwd`.
///
/// The child inherits the process environment overlaid with `env`, reads
/// from an empty stdin, and has stdout and stderr appended line by line to
/// `console_path`. Cancelling `cancel` kills the child.
pub async fn run_process(
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    console_path: &Path,
    cancel: &CancellationToken,
) -> EngineResult<ProcessOutcome> {
    let start = std::time::Instant::now();

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| EngineError::NotImplemented("empty command line".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(program = %program, args = ?args, cwd = %cwd.display(), "Spawning step process");

    let mut child = cmd.spawn().map_err(|e| EngineError::StepExecution {
        message: format!("Failed to spawn '{}': {}", program, e),
        console_output: String::new(),
    })?;

    let console = Arc::new(Mutex::new(
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(console_path)
            .await?,
    ));

    let stdout_handle = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(tee_lines(stdout, Arc::clone(&console))));
    let stderr_handle = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(tee_lines(stderr, Arc::clone(&console))));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            tracing::warn!(program = %program, "Cancellation requested, killing step process");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill step process");
            }
            return Err(EngineError::Cancelled);
        }
    };

    for handle in [stdout_handle, stderr_handle].into_iter().flatten() {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Console reader task failed");
        }
    }
    console.lock().await.flush().await?;

    let console_output = tokio::fs::read_to_string(console_path).await?;
    let exit_code = status.code().unwrap_or(-1);
    let duration_ms = elapsed_ms(start.elapsed());

    tracing::debug!(program = %program, exit_code, duration_ms, "Step process exited");

    Ok(ProcessOutcome {
        exit_code,
        console_output,
    })
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

async fn tee_lines<R>(stream: R, console: Arc<Mutex<File>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        tracing::debug!(target: "policy_engine::console", "{}", line);
        let mut file = console.lock().await;
        if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
            tracing::warn!(error = %e, "Failed to write console output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bash(script: &str) -> Vec<String> {
        vec!["bash".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_elapsed_ms_saturates() {
        assert_eq!(elapsed_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(elapsed_ms(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_shell_templates() {
        let script = Path::new("/tmp/run.sh");
        assert_eq!(shell_command(None, script), vec!["bash", "-xe", "/tmp/run.sh"]);
        assert_eq!(
            shell_command(Some("bash"), script),
            vec!["bash", "--noprofile", "--norc", "-eo", "pipefail", "/tmp/run.sh"]
        );
        assert_eq!(shell_command(Some("sh"), script), vec!["sh", "-e", "/tmp/run.sh"]);
        assert_eq!(
            shell_command(Some("node --trace"), script),
            vec!["node", "--trace", "/tmp/run.sh"]
        );
        assert_eq!(
            shell_command(Some("perl {0} extra"), script),
            vec!["perl", "/tmp/run.sh", "extra"]
        );
    }

    #[tokio::test]
    async fn test_console_captures_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.txt");
        let outcome = run_process(
            &bash("echo out; echo err >&2"),
            dir.path(),
            &BTreeMap::new(),
            &console,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.is_success());
        assert!(outcome.console_output.contains("out\n"));
        assert!(outcome.console_output.contains("err\n"));
    }

    #[tokio::test]
    async fn test_exit_code_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([("MY_VAR".to_string(), "my_value".to_string())]);
        let outcome = run_process(
            &bash("echo $MY_VAR; exit 3"),
            dir.path(),
            &env,
            &dir.path().join("console.txt"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.console_output, "my_value\n");
    }

    #[tokio::test]
    async fn test_stdin_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_process(
            &bash("cat; echo done"),
            dir.path(),
            &BTreeMap::new(),
            &dir.path().join("console.txt"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.console_output, "done\n");
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let result = run_process(
            &bash("sleep 10"),
            dir.path(),
            &BTreeMap::new(),
            &dir.path().join("console.txt"),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_process(
            &["definitely-not-a-real-binary-xyz".to_string()],
            dir.path(),
            &BTreeMap::new(),
            &dir.path().join("console.txt"),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(EngineError::StepExecution { .. })));
    }
}
