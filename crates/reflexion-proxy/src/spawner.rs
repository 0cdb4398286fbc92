use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::{CallConfig, ProxyError};

/// Output captured from a spawned collaborator process
#[derive(Debug, Clone)]
pub struct SpawnedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl SpawnedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Utility for spawning collaborator processes
pub struct ProcessSpawner;

impl ProcessSpawner {
    /// Spawn a process, feed `payload` on stdin and capture its output.
    ///
    /// Honors `config.timeout`; on expiry the child is killed and the call
    /// fails with `ProxyError::Timeout`.
    pub async fn spawn(
        program: &Path,
        args: &[String],
        payload: &str,
        config: &CallConfig,
    ) -> Result<SpawnedOutput, ProxyError> {
        let start = Instant::now();

        debug!(
            program = %program.display(),
            args = ?args,
            working_dir = %config.working_dir.display(),
            "Spawning collaborator process"
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &config.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;

        // Write the payload and close stdin so the child sees EOF
        let mut stdin = child.stdin.take().ok_or_else(|| {
            ProxyError::CallFailed("stdin not captured for collaborator process".into())
        })?;
        let payload = payload.to_string();
        let writer = tokio::spawn(async move {
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let stdout_handle = child.stdout.take().ok_or_else(|| {
            ProxyError::CallFailed("stdout not captured for collaborator process".into())
        })?;
        let stderr_handle = child.stderr.take().ok_or_else(|| {
            ProxyError::CallFailed("stderr not captured for collaborator process".into())
        })?;

        let run = async {
            let (stdout, stderr) = tokio::join!(
                Self::read_stream(stdout_handle, "stdout"),
                Self::read_stream(stderr_handle, "stderr"),
            );
            let status = child.wait().await?;
            Ok::<_, ProxyError>((stdout?, stderr?, status))
        };

        let (stdout, stderr, status) = match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!(limit_secs = limit.as_secs(), "Collaborator call timed out");
                    return Err(ProxyError::Timeout(limit));
                }
            },
            None => run.await?,
        };

        let _ = writer.await;
        let duration = start.elapsed();

        debug!(
            exit_code = status.code().unwrap_or(-1),
            duration_ms = duration.as_millis(),
            "Collaborator process completed"
        );

        Ok(SpawnedOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            duration,
        })
    }

    async fn read_stream<R>(handle: R, name: &'static str) -> Result<String, ProxyError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(handle).lines();
        let mut buf = String::new();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    trace!(line = %line, stream = name);
                    if !buf.is_empty() {
                        buf.push('\n');
                    }
                    buf.push_str(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(ProxyError::CallFailed(format!(
                        "Failed to read {}: {}",
                        name, e
                    )));
                }
            }
        }
        Ok(buf)
    }
}
