//! Capability seam between the session state machine and whatever actually
//! moves bytes to the remote host.
//!
//! Both traits are blocking; [`RemoteSession`](super::RemoteSession) runs them
//! on tokio's blocking pool and enforces timeouts from the outside.

use super::{CommandRequest, CommandResult, ConnectionTarget};
use crate::error::AppResult;

/// An authenticated connection to one remote host.
///
/// A transport is owned by exactly one session. After any transport-class
/// error the session discards it and connects afresh.
pub trait Transport: Send {
    /// Run a command to completion and collect its output.
    fn execute(&mut self, request: &CommandRequest) -> AppResult<CommandResult>;

    /// Write `content` to `remote_path`, replacing anything already there.
    fn transfer_file(&mut self, remote_path: &str, content: &[u8]) -> AppResult<()>;

    /// Release the underlying connection.
    fn close(&mut self) {}
}

/// Opens transports. Errors are `AppError::Auth`/`HostKey` for credential
/// problems and `AppError::Transport`/`Timeout` for everything else.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &ConnectionTarget) -> AppResult<Box<dyn Transport>>;
}
