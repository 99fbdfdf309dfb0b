//! WR-010: Local script execution with cancellation.
//!
//! The script is fed to the shell on stdin. Stdout and stderr are captured
//! and, when an output log is configured, appended to it line by line while
//! the script runs. The child is killed when the cancellation token fires or
//! the future is dropped; output logged up to that point is kept.

use super::{ExecError, ExecOutput};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// One script invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Shell binary, e.g. `bash`
    pub shell: String,
    pub script: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// File that stdout and stderr are appended to
    pub output_log: Option<PathBuf>,
}

impl ExecRequest {
    pub fn new(shell: &str, script: &str, cwd: &Path) -> Self {
        Self {
            shell: shell.to_string(),
            script: script.to_string(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
            output_log: None,
        }
    }
}

/// Run a script to completion or until `cancel` fires.
pub async fn exec_script(
    request: &ExecRequest,
    cancel: &CancellationToken,
) -> Result<ExecOutput, ExecError> {
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }

    let mut child = Command::new(&request.shell)
        .current_dir(&request.cwd)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            shell: request.shell.clone(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(request.script.as_bytes())
            .await
            .map_err(|e| ExecError::Io(format!("stdin write error: {}", e)))?;
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let log = request.output_log.as_deref();
    let run = async {
        let (stdout, stderr, status) = tokio::join!(
            pump(stdout, log),
            pump(stderr, log),
            child.wait()
        );
        let status = status.map_err(|e| ExecError::Io(format!("wait error: {}", e)))?;
        Ok::<_, ExecError>(ExecOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout?,
            stderr: stderr?,
        })
    };

    tokio::select! {
        result = run => result,
        _ = cancel.cancelled() => {
            tracing::debug!(shell = %request.shell, "script cancelled, killing child");
            Err(ExecError::Cancelled)
        }
    }
}

/// Drain one pipe, appending each line to `log` as soon as it arrives.
async fn pump<R: AsyncRead + Unpin>(
    pipe: Option<R>,
    log: Option<&Path>,
) -> Result<String, ExecError> {
    let Some(pipe) = pipe else {
        return Ok(String::new());
    };
    let mut file = match log {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| ExecError::Io(format!("cannot open {}: {}", path.display(), e)))?,
        ),
        None => None,
    };

    let mut reader = BufReader::new(pipe);
    let mut captured = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| ExecError::Io(format!("read error: {}", e)))?;
        if n == 0 {
            break;
        }
        if let Some(ref mut file) = file {
            file.write_all(&line)
                .await
                .map_err(|e| ExecError::Io(format!("log write error: {}", e)))?;
            file.flush()
                .await
                .map_err(|e| ExecError::Io(format!("log write error: {}", e)))?;
        }
        captured.extend_from_slice(&line);
    }
    Ok(String::from_utf8_lossy(&captured).into_owned())
}
