//! Production invoker: spawns a configured CLI per agent kind.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::{AgentInvoker, AgentKind, InvocationOutput};
use crate::config::EngineConfig;

/// Grace period for the pipe reader threads after process exit.
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on captured agent output (10MB).
const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Invokes agents by running the command line configured for their kind,
/// with the prompt appended as the final argument.
pub struct CliInvoker {
    config: EngineConfig,
}

impl CliInvoker {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Verify the configured binaries exist on PATH. Called once at startup
    /// so a typo in `warp.toml` fails before any work is done.
    pub fn check_binaries(&self) -> Result<()> {
        for (kind, command) in &self.config.agent_commands {
            let program = command
                .split_whitespace()
                .next()
                .with_context(|| format!("Empty command configured for agent kind '{kind}'"))?;
            which::which(program).with_context(|| {
                format!("Agent binary '{program}' (kind '{kind}') not found on PATH")
            })?;
        }
        Ok(())
    }

    fn build_command(&self, kind: AgentKind, prompt: &str, cwd: &Path) -> Result<Command> {
        let Some(template) = self.config.agent_command(kind.as_str()) else {
            bail!("No command configured for agent kind '{kind}'");
        };
        let mut parts = template.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("Empty command configured for agent kind '{kind}'");
        };
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg(prompt)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd)
    }
}

impl AgentInvoker for CliInvoker {
    fn invoke(
        &self,
        kind: AgentKind,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<InvocationOutput> {
        let start = Instant::now();
        let mut child = self
            .build_command(kind, prompt, cwd)?
            .spawn()
            .with_context(|| format!("Failed to spawn {kind} agent"))?;

        debug!(kind = %kind, pid = child.id(), "agent invocation started");

        // Drain the pipes BEFORE waiting. If we wait first, the child may
        // block on write() once the pipe buffer fills (~64KB on Linux).
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();

        let (stdout_tx, stdout_rx) = mpsc::channel();
        let (stderr_tx, stderr_rx) = mpsc::channel();

        if let Some(stdout) = stdout_handle {
            thread::spawn(move || {
                let _ = stdout_tx.send(read_stream_to_string(stdout));
            });
        } else {
            let _ = stdout_tx.send(String::new());
        }

        if let Some(stderr) = stderr_handle {
            thread::spawn(move || {
                let _ = stderr_tx.send(read_stream_to_string(stderr));
            });
        } else {
            let _ = stderr_tx.send(String::new());
        }

        let wait_result = child
            .wait_timeout(timeout)
            .with_context(|| format!("Failed to wait for {kind} agent"))?;

        // Kill before collecting: a timed-out child still holds its pipes
        // open, and the reader threads only finish once it is dead.
        if wait_result.is_none() {
            warn!(kind = %kind, "agent invocation exceeded {}s, killing", timeout.as_secs());
            kill_child(&mut child);
        }

        let duration = start.elapsed();

        let stdout = stdout_rx
            .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
            .unwrap_or_else(|_| "[output collection timed out]".to_string());
        let stderr = stderr_rx
            .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
            .unwrap_or_default();

        match wait_result {
            Some(status) => {
                let text = if stdout.trim().is_empty() && !status.success() {
                    // Some CLIs report errors only on stderr.
                    stderr
                } else {
                    stdout
                };
                Ok(InvocationOutput {
                    text,
                    exit_code: status.code(),
                    duration,
                    timed_out: false,
                })
            }
            None => Ok(InvocationOutput {
                text: stdout,
                exit_code: None,
                duration,
                timed_out: true,
            }),
        }
    }
}

/// Read a stream to string, truncating at the size cap and draining the
/// remainder so the child never hits a broken pipe.
fn read_stream_to_string<R: Read>(mut stream: R) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let remaining = MAX_OUTPUT_SIZE.saturating_sub(buf.len());
                let to_copy = n.min(remaining);
                buf.extend_from_slice(&chunk[..to_copy]);
                if to_copy < n {
                    let mut discard = [0u8; 8192];
                    while stream.read(&mut discard).unwrap_or(0) > 0 {}
                    buf.extend_from_slice(b"\n[output truncated at 10MB]");
                    break;
                }
            }
            Err(_) => break,
        }
    }

    String::from_utf8_lossy(&buf).to_string()
}

fn kill_child(child: &mut Child) {
    // The process may have already exited; ignore errors and reap.
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_invoker() -> CliInvoker {
        let mut config = EngineConfig::default();
        config
            .agent_commands
            .insert("reasoner".to_string(), "sh -c".to_string());
        config
            .agent_commands
            .insert("coder".to_string(), "sh -c".to_string());
        CliInvoker::new(config)
    }

    #[test]
    fn test_read_stream_small_input() {
        assert_eq!(read_stream_to_string(Cursor::new(b"hello")), "hello");
    }

    #[test]
    fn test_read_stream_truncates_at_limit() {
        let data = vec![b'x'; MAX_OUTPUT_SIZE + 1000];
        let result = read_stream_to_string(Cursor::new(data));
        assert!(result.contains("[output truncated at 10MB]"));
    }

    #[test]
    fn test_invoke_captures_stdout() {
        let temp = tempfile::tempdir().unwrap();
        let invoker = test_invoker();
        let out = invoker
            .invoke(
                AgentKind::Reasoner,
                "echo analysis-done",
                temp.path(),
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(out.success());
        assert_eq!(out.text.trim(), "analysis-done");
    }

    #[test]
    fn test_invoke_nonzero_exit_is_not_success() {
        let temp = tempfile::tempdir().unwrap();
        let invoker = test_invoker();
        let out = invoker
            .invoke(
                AgentKind::Coder,
                "echo boom >&2; exit 3",
                temp.path(),
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert!(out.text.contains("boom"));
    }

    #[test]
    fn test_invoke_timeout_kills_process() {
        let temp = tempfile::tempdir().unwrap();
        let invoker = test_invoker();
        let start = Instant::now();
        let out = invoker
            .invoke(
                AgentKind::Coder,
                "sleep 30",
                temp.path(),
                Duration::from_millis(200),
            )
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        // The child is killed as soon as the deadline passes; the call must
        // not linger in output collection afterwards.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_check_binaries_rejects_missing_program() {
        let mut config = EngineConfig::default();
        config.agent_commands.insert(
            "reasoner".to_string(),
            "definitely-not-a-real-binary-xyz".to_string(),
        );
        let invoker = CliInvoker::new(config);
        assert!(invoker.check_binaries().is_err());
    }
}
