//! Command descriptions and outcomes for the exec action.

use bytes::Bytes;

/// A command to run via an entry's `exec` capability.
#[derive(Debug, Clone, Default)]
pub struct ExecCommand {
    /// The program to run on the remote side.
    pub command: String,
    /// Arguments, passed through verbatim.
    pub args: Vec<String>,
    /// Bytes to feed the remote process on stdin.
    pub stdin: Option<Bytes>,
    /// Request a TTY on the remote side.
    pub tty: bool,
}

impl ExecCommand {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            stdin: None,
            tty: false,
        }
    }
}

/// What came back from an exec invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutcome {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_ok() {
        assert!(ExecOutcome::default().ok());
        let failed = ExecOutcome {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!failed.ok());
    }
}
