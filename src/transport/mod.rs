//! WR-010: Script execution transport.

pub mod local;

use thiserror::Error;

/// Output from executing a script.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Io(String),

    /// The cancellation token fired; the child was killed.
    #[error("execution cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wr010_exec_output_success() {
        let ok = ExecOutput {
            exit_code: 0,
            stdout: "ok".into(),
            stderr: "".into(),
        };
        assert!(ok.success());
        let sig = ExecOutput {
            exit_code: -1,
            stdout: "".into(),
            stderr: "killed".into(),
        };
        assert!(!sig.success());
    }

    #[test]
    fn test_wr010_error_display() {
        let e = ExecError::Spawn {
            shell: "nosuchshell".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(e.to_string().contains("nosuchshell"));
        assert_eq!(ExecError::Cancelled.to_string(), "execution cancelled");
    }
}
