//! Scripted in-memory [`Connector`] for tests and offline runs.
//!
//! The fake emulates just enough of a remote shell for the operations this
//! crate issues (`cat`, `mv`, `rm` over an in-memory file map) and answers any
//! other command from canned responses registered with [`FakeConnector::respond`].
//!
//! ```ignore
//! let fake = FakeConnector::new();
//! fake.respond("ls -la", 0, &["total 0"], &[]);
//! let pool = SessionPool::new(Arc::new(fake.clone()), SessionOptions::default());
//! ```

use super::{CommandRequest, CommandResult, ConnectionTarget, Connector, Transport};
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Failure to inject into the next connect, execute or transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Auth,
    Transport,
}

impl FakeFailure {
    fn into_error(self, target: &str, operation: &str) -> AppError {
        match self {
            FakeFailure::Auth => AppError::auth(target, operation, "Permission denied (fake)"),
            FakeFailure::Transport => AppError::transport(target, operation, "Connection reset (fake)"),
        }
    }
}

#[derive(Default)]
struct FakeState {
    connect_failures: VecDeque<FakeFailure>,
    execute_failures: VecDeque<FakeFailure>,
    transfer_failures: VecDeque<FakeFailure>,
    stalls: HashMap<String, VecDeque<Duration>>,
    responses: HashMap<String, CommandResult>,
    files: BTreeMap<String, Vec<u8>>,
    fail_renames: bool,
    connects: usize,
    closes: usize,
    executed: Vec<String>,
    transfers: Vec<(String, Vec<u8>)>,
}

/// Handle shared between the test and every transport the fake hands out
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canned result for an exact command line.
    pub fn respond(&self, command_line: &str, exit_status: i32, stdout: &[&str], stderr: &[&str]) {
        let result = CommandResult::from_output(exit_status, &join_lines(stdout), &join_lines(stderr));
        self.state.lock().responses.insert(command_line.to_string(), result);
    }

    pub fn fail_next_connect(&self, failure: FakeFailure) {
        self.state.lock().connect_failures.push_back(failure);
    }

    pub fn fail_next_execute(&self, failure: FakeFailure) {
        self.state.lock().execute_failures.push_back(failure);
    }

    pub fn fail_next_transfer(&self, failure: FakeFailure) {
        self.state.lock().transfer_failures.push_back(failure);
    }

    /// Block the next run of `command_line` for `duration` before answering.
    pub fn stall_once(&self, command_line: &str, duration: Duration) {
        self.state
            .lock()
            .stalls
            .entry(command_line.to_string())
            .or_default()
            .push_back(duration);
    }

    /// Make every `mv` exit non-zero, like a permission problem on the directory.
    pub fn fail_renames(&self) {
        self.state.lock().fail_renames = true;
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.state.lock().files.insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn closed_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Command lines in the order the transports ran them.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn transfers(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().transfers.clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, target: &ConnectionTarget) -> AppResult<Box<dyn Transport>> {
        let mut state = self.state.lock();
        state.connects += 1;
        if let Some(failure) = state.connect_failures.pop_front() {
            return Err(failure.into_error(&target.to_string(), "connect"));
        }
        Ok(Box::new(FakeTransport {
            state: Arc::clone(&self.state),
            label: target.to_string(),
            closed: false,
        }))
    }
}

struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    label: String,
    closed: bool,
}

impl FakeTransport {
    fn ensure_open(&self, operation: &str) -> AppResult<()> {
        if self.closed {
            return Err(AppError::transport(&self.label, operation, "Transport already closed"));
        }
        Ok(())
    }
}

impl Transport for FakeTransport {
    fn execute(&mut self, request: &CommandRequest) -> AppResult<CommandResult> {
        self.ensure_open("execute")?;
        let command_line = request.command_line();

        let stall = {
            let mut state = self.state.lock();
            state.executed.push(command_line.clone());
            state.stalls.get_mut(&command_line).and_then(VecDeque::pop_front)
        };
        if let Some(duration) = stall {
            std::thread::sleep(duration);
        }

        let mut state = self.state.lock();
        if let Some(failure) = state.execute_failures.pop_front() {
            return Err(failure.into_error(&self.label, "execute"));
        }
        if let Some(result) = state.responses.get(&command_line) {
            return Ok(result.clone());
        }
        Ok(run_builtin(&mut state, &command_line))
    }

    fn transfer_file(&mut self, remote_path: &str, content: &[u8]) -> AppResult<()> {
        self.ensure_open("transfer_file")?;
        let mut state = self.state.lock();
        if let Some(failure) = state.transfer_failures.pop_front() {
            return Err(failure.into_error(&self.label, "transfer_file"));
        }
        state.transfers.push((remote_path.to_string(), content.to_vec()));
        state.files.insert(remote_path.to_string(), content.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().closes += 1;
        }
    }
}

fn run_builtin(state: &mut FakeState, command_line: &str) -> CommandResult {
    let words = split_words(command_line);
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    fn ok(stdout: &[u8]) -> CommandResult {
        CommandResult::from_output(0, stdout, b"")
    }
    fn fail(status: i32, message: String) -> CommandResult {
        CommandResult::from_output(status, b"", message.as_bytes())
    }

    match words.as_slice() {
        ["cat", "--", path] => match state.files.get(*path) {
            Some(content) => ok(content),
            None => fail(1, format!("cat: {}: No such file or directory", path)),
        },
        ["mv", "-f", "--", from, to] => {
            if state.fail_renames {
                return fail(1, format!("mv: cannot move '{}' to '{}': Permission denied", from, to));
            }
            match state.files.remove(*from) {
                Some(content) => {
                    state.files.insert(to.to_string(), content);
                    ok(b"")
                }
                None => fail(1, format!("mv: cannot stat '{}': No such file or directory", from)),
            }
        }
        ["rm", "-f", "--", path] => {
            state.files.remove(*path);
            ok(b"")
        }
        _ => fail(127, format!("sh: {}: command not found", words.first().unwrap_or(&""))),
    }
}

fn join_lines(lines: &[&str]) -> Vec<u8> {
    lines.iter().flat_map(|line| format!("{}\n", line).into_bytes()).collect()
}

/// Split a POSIX shell line into words, honouring single quotes and backslashes.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_quote = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                in_word = true;
            }
            '\\' if !in_quote => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            c if c.is_whitespace() && !in_quote => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
