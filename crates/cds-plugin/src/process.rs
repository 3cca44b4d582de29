use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::types::{Method, PluginRef, Ready, Request, Response, RunAction};
use crate::types::{CALLBACK_ENV, INSTANCE_ENV};
use crate::{PluginError, Result};

/// Stderr kept per plugin process; older output is dropped first.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

// ─── PluginProcess ────────────────────────────────────────────────────────

/// A running plugin subprocess speaking JSON lines on stdin/stdout.
///
/// Stderr is drained by a background task and attached to transport errors
/// so a crashing plugin leaves a trace. The child is spawned with
/// `kill_on_drop`, so dropping the process value terminates it.
pub(crate) struct PluginProcess {
    plugin: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stdin: ChildStdin,
    stderr_buf: Arc<Mutex<String>>,
    next_id: u64,
}

impl PluginProcess {
    /// Start the plugin executable inside its installation directory.
    pub(crate) fn spawn(plugin: &PluginRef, instance: &str, callback: &str) -> Result<Self> {
        let mut cmd = Command::new(&plugin.program);
        cmd.args(&plugin.args)
            .current_dir(&plugin.dir)
            .env(INSTANCE_ENV, instance)
            .env(CALLBACK_ENV, callback);
        Self::from_command(&plugin.name, cmd)
    }

    fn from_command(plugin: &str, mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PluginError::Spawn {
            plugin: plugin.to_string(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| PluginError::Spawn {
            plugin: plugin.to_string(),
            reason: "stdout not captured".into(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| PluginError::Spawn {
            plugin: plugin.to_string(),
            reason: "stdin not captured".into(),
        })?;

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Ok(mut b) = buf.lock() {
                        push_tail(&mut b, &line, STDERR_TAIL_BYTES);
                    }
                }
            });
        }

        Ok(Self {
            plugin: plugin.to_string(),
            child,
            lines: BufReader::new(stdout).lines(),
            stdin,
            stderr_buf,
            next_id: 1,
        })
    }

    /// Wait for the ready line, bounded by `timeout`.
    ///
    /// The plugin must echo the instance token it was started with.
    pub(crate) async fn handshake(&mut self, instance: &str, timeout: Duration) -> Result<()> {
        let line = match tokio::time::timeout(timeout, self.read_line()).await {
            Err(_) => {
                return Err(PluginError::HandshakeTimeout {
                    plugin: self.plugin.clone(),
                    timeout,
                })
            }
            Ok(line) => line?,
        };

        let ready: Ready = serde_json::from_str(&line).map_err(|e| PluginError::Protocol {
            line: line.clone(),
            source: e,
        })?;
        if !ready.ready {
            return Err(PluginError::Handshake(format!(
                "plugin '{}' reported not ready",
                self.plugin
            )));
        }
        if ready.instance != instance {
            return Err(PluginError::Handshake(format!(
                "instance token mismatch: expected '{instance}', got '{}'",
                ready.instance
            )));
        }
        debug!(plugin = %self.plugin, instance, "plugin ready");
        Ok(())
    }

    /// Issue one request and wait for its response.
    pub(crate) async fn call(
        &mut self,
        method: Method,
        params: Option<&RunAction>,
    ) -> Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;

        let mut buf = serde_json::to_vec(&Request { id, method, params }).map_err(|e| {
            PluginError::Transport(format!("failed to serialize request: {e}"))
        })?;
        buf.push(b'\n');
        debug!(plugin = %self.plugin, id, ?method, "plugin call");

        self.stdin
            .write_all(&buf)
            .await
            .map_err(|e| PluginError::Transport(format!("write failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| PluginError::Transport(format!("flush failed: {e}")))?;

        let line = self.read_line().await?;
        let response: Response =
            serde_json::from_str(&line).map_err(|e| PluginError::Protocol {
                line: line.clone(),
                source: e,
            })?;

        if response.id != id {
            return Err(PluginError::Transport(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(err) = response.error {
            return Err(PluginError::Remote(err));
        }
        response
            .result
            .ok_or_else(|| PluginError::Transport(format!("response {id} carries no result")))
    }

    /// Next non-empty stdout line. EOF is a transport failure.
    async fn read_line(&mut self) -> Result<String> {
        loop {
            match self.lines.next_line().await {
                Err(e) => return Err(PluginError::Transport(format!("read failed: {e}"))),
                Ok(None) => {
                    let stderr = self.stderr();
                    let msg = if stderr.is_empty() {
                        format!("plugin '{}' closed its output", self.plugin)
                    } else {
                        format!(
                            "plugin '{}' closed its output\nstderr: {stderr}",
                            self.plugin
                        )
                    };
                    return Err(PluginError::Transport(msg));
                }
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Ok(trimmed.to_owned());
                }
            }
        }
    }

    fn stderr(&self) -> String {
        self.stderr_buf
            .lock()
            .ok()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Kill the subprocess and reap it (best-effort; errors are ignored).
    pub(crate) async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Append `line` to `buf`, then drop whole leading lines until `buf` fits
/// in `cap` bytes. A single oversized line keeps its last `cap` bytes.
fn push_tail(buf: &mut String, line: &str, cap: usize) {
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
    if buf.len() <= cap {
        return;
    }
    let mut start = buf.len() - cap;
    while !buf.is_char_boundary(start) {
        start += 1;
    }
    let cut = buf[start..].find('\n').map_or(start, |nl| start + nl + 1);
    buf.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_drops_oldest_lines() {
        let mut buf = String::new();
        for i in 0..1000 {
            push_tail(&mut buf, &format!("line {i}"), 64);
        }
        assert!(buf.len() <= 64, "{}", buf.len());
        assert!(buf.ends_with("line 999"));
        assert!(!buf.contains("line 0\n"));
        assert!(!buf.starts_with('\n'));
    }

    #[test]
    fn stderr_tail_truncates_one_long_line() {
        let mut buf = String::new();
        push_tail(&mut buf, &"é".repeat(100), 31);
        assert!(buf.len() <= 31);
        assert!(buf.chars().all(|c| c == 'é'));
    }
}
