//! Directory listing, file reads and file writes against pooled sessions.

use crate::error::{AppError, AppResult};
use crate::listing::{self, shell_quote, FileEntry};
use crate::logging::sanitize_error_message;
use crate::ssh::{CommandRequest, CommandResult, ConnectionTarget, SessionPool};
use std::sync::Arc;
use std::time::Duration;

/// File operations exposed to the presentation layer
pub struct RemoteFs {
    pool: Arc<SessionPool>,
    command_timeout: Duration,
}

impl RemoteFs {
    pub fn new(pool: Arc<SessionPool>, command_timeout: Duration) -> Self {
        Self {
            pool,
            command_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// List `path`, or the login directory when no path is given.
    pub async fn list_directory(&self, target: &ConnectionTarget, path: Option<&str>) -> AppResult<Vec<FileEntry>> {
        tracing::info!("List directory: target={}, path={}", target, path.unwrap_or("~"));
        let request = CommandRequest::new(listing::listing_command(path), self.command_timeout);
        let result = self.run(target, "list_directory", request).await?;
        Ok(listing::parse(&result.stdout))
    }

    /// Read a text file exactly as stored; invalid UTF-8 is replaced.
    pub async fn read_file(&self, target: &ConnectionTarget, path: &str) -> AppResult<String> {
        tracing::info!("Read file: target={}, path={}", target, path);
        let request = CommandRequest::new(format!("cat -- {}", shell_quote(path)), self.command_timeout);
        let result = self.run(target, "read_file", request).await?;
        Ok(result.stdout_verbatim())
    }

    /// Atomically replace `path` with `content`. Empty content is refused
    /// before any connection is made.
    pub async fn write_file(&self, target: &ConnectionTarget, path: &str, content: &str) -> AppResult<()> {
        if content.is_empty() {
            return Err(AppError::Validation(format!(
                "Refusing to write empty content to {}",
                path
            )));
        }
        tracing::info!("Write file: target={}, path={}, {} bytes", target, path, content.len());

        let session = self.pool.acquire(target).await;
        let result = session.upload_content(path, content.as_bytes().to_vec()).await;
        self.pool.release(&session);
        result.map_err(|e| e.with_context(target, "write_file"))
    }

    async fn run(&self, target: &ConnectionTarget, operation: &str, request: CommandRequest) -> AppResult<CommandResult> {
        let session = self.pool.acquire(target).await;
        let result = session.execute(request).await;
        self.pool.release(&session);

        let result = result.map_err(|e| e.with_context(target, operation))?;
        if !result.success() {
            return Err(AppError::RemoteCommand {
                target: target.to_string(),
                operation: operation.to_string(),
                exit_status: result.exit_status,
                message: sanitize_error_message(&result.stderr_text()),
            });
        }
        Ok(result)
    }
}
