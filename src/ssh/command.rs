use crate::listing::shell_quote;
use std::time::Duration;

/// A single remote command invocation
#[derive(Debug, Clone)]
pub struct CommandRequest {
    command: String,
    working_dir: Option<String>,
    input: Option<Vec<u8>>,
    timeout: Duration,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            input: None,
            timeout,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Bytes written to the command's stdin, followed by EOF.
    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    pub fn input(&self) -> Option<&[u8]> {
        self.input.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The line handed to the remote shell.
    pub fn command_line(&self) -> String {
        match self.working_dir() {
            Some(dir) => format!("cd {} && {}", shell_quote(dir), self.command),
            None => self.command.clone(),
        }
    }
}

/// Output of a finished remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_status: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Stdout exactly as received, for callers that must not alter line endings.
    pub stdout_raw: Vec<u8>,
}

impl CommandResult {
    pub fn from_output(exit_status: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            exit_status,
            stdout: split_lines(stdout),
            stderr: split_lines(stderr),
            stdout_raw: stdout.to_vec(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    /// The whole of stdout decoded as UTF-8, byte for byte when valid.
    pub fn stdout_verbatim(&self) -> String {
        String::from_utf8_lossy(&self.stdout_raw).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

fn split_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw).lines().map(String::from).collect()
}
