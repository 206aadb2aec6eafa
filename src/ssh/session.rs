use super::{CommandRequest, CommandResult, ConnectionTarget, Connector, Transport};
use crate::error::{AppError, AppResult};
use crate::listing::shell_quote;
use crate::logging::{sanitize, sanitize_error_message};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

/// Session info for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub target: String,
    pub state: SessionState,
    pub connected_at: Option<i64>,
    pub last_activity: i64,
    pub failed_reconnects: u32,
    pub exhausted: bool,
}

/// Timeouts and retry budget shared by all sessions of a pool
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub transfer_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(60),
            max_reconnect_attempts: 3,
        }
    }
}

type TransportSlot = Option<Box<dyn Transport>>;

/// One recoverable connection to a target.
///
/// The transport lives behind a fair async mutex: holding it is what makes a
/// command "in flight", so commands run one at a time in submission order.
pub struct RemoteSession {
    id: String,
    target: ConnectionTarget,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    state: RwLock<SessionState>,
    transport: Mutex<TransportSlot>,
    last_activity: RwLock<Instant>,
    last_activity_ts: RwLock<i64>,
    connected_at: RwLock<Option<i64>>,
    /// Bumped on every transition into `Failed`
    failure_epoch: AtomicU64,
    failed_reconnects: AtomicU32,
    connect_attempts: AtomicU64,
    exhausted: AtomicBool,
    closed: AtomicBool,
}

impl RemoteSession {
    pub fn new(target: ConnectionTarget, connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            connector,
            options,
            state: RwLock::new(SessionState::Disconnected),
            transport: Mutex::new(None),
            last_activity: RwLock::new(Instant::now()),
            last_activity_ts: RwLock::new(chrono::Utc::now().timestamp()),
            connected_at: RwLock::new(None),
            failure_epoch: AtomicU64::new(0),
            failed_reconnects: AtomicU32::new(0),
            connect_attempts: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!("Session {} ({}): {:?} -> {:?}", self.id, self.target, previous, state);
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            target: self.target.to_string(),
            state: self.state(),
            connected_at: *self.connected_at.read(),
            last_activity: *self.last_activity_ts.read(),
            failed_reconnects: self.failed_reconnects.load(Ordering::SeqCst),
            exhausted: self.is_exhausted(),
        }
    }

    /// Number of connection attempts made so far, including the first.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Terminally failed: bad credentials or the reconnect budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.write() = Instant::now();
        *self.last_activity_ts.write() = chrono::Utc::now().timestamp();
    }

    fn mark_failed(&self) {
        self.set_state(SessionState::Failed);
        self.failure_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Connect and authenticate. No-op when already `Ready`.
    pub async fn connect(&self) -> AppResult<()> {
        let mut slot = self.transport.lock().await;
        self.ensure_connected(&mut slot).await
    }

    /// Run a command, connecting first if needed.
    pub async fn execute(&self, request: CommandRequest) -> AppResult<CommandResult> {
        let mut slot = self.lock_for("execute").await?;
        self.ensure_connected(&mut slot).await?;

        let timeout = request.timeout();
        tracing::debug!("Session {} executing: {}", self.id, sanitize(request.command()));
        self.run_on_transport(&mut slot, "execute", timeout, move |transport| {
            transport.execute(&request)
        })
        .await
    }

    /// Replace `path` with `content` atomically: upload to a temporary sibling,
    /// then rename over the destination.
    pub async fn upload_content(&self, path: &str, content: Vec<u8>) -> AppResult<()> {
        if content.is_empty() {
            return Err(AppError::Validation(format!(
                "Refusing to write empty content to {}",
                path
            )));
        }
        if path.is_empty() || path.ends_with('/') {
            return Err(AppError::Validation(format!("Not a file path: '{}'", path)));
        }

        let mut slot = self.lock_for("upload").await?;
        self.ensure_connected(&mut slot).await?;

        let timeout = self.options.transfer_timeout;
        let temp_path = temp_sibling_path(path);
        tracing::debug!(
            "Session {} uploading {} bytes to {} via {}",
            self.id,
            content.len(),
            path,
            temp_path
        );

        let upload_to = temp_path.clone();
        self.run_on_transport(&mut slot, "upload", timeout, move |transport| {
            transport.transfer_file(&upload_to, &content)
        })
        .await?;

        let rename = CommandRequest::new(
            format!("mv -f -- {} {}", shell_quote(&temp_path), shell_quote(path)),
            timeout,
        );
        let renamed = self
            .run_on_transport(&mut slot, "upload", timeout, move |transport| {
                transport.execute(&rename)
            })
            .await?;
        if renamed.success() {
            return Ok(());
        }

        let cleanup = CommandRequest::new(format!("rm -f -- {}", shell_quote(&temp_path)), timeout);
        if let Err(e) = self
            .run_on_transport(&mut slot, "upload", timeout, move |transport| {
                transport.execute(&cleanup)
            })
            .await
        {
            tracing::warn!("Could not remove temporary upload {}: {}", temp_path, e);
        }

        Err(AppError::RemoteCommand {
            target: self.target.to_string(),
            operation: "upload".to_string(),
            exit_status: renamed.exit_status,
            message: sanitize_error_message(&renamed.stderr_text()),
        })
    }

    /// Mark the session closed without waiting for in-flight work. Every
    /// later operation fails; the transport is released by [`close`](Self::close).
    pub fn retire(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Release the transport and retire the session. Safe to call repeatedly.
    pub async fn close(&self) {
        self.retire();
        let mut slot = self.transport.lock().await;
        if let Some(transport) = slot.take() {
            release_transport(transport).await;
            tracing::info!("Closed session {} ({})", self.id, self.target);
        }
        *self.connected_at.write() = None;
        self.set_state(SessionState::Disconnected);
    }

    /// Wait for our turn on the transport. Callers that were queued when the
    /// session failed fail fast instead of triggering a reconnect.
    async fn lock_for(&self, operation: &str) -> AppResult<tokio::sync::MutexGuard<'_, TransportSlot>> {
        let seen_epoch = self.failure_epoch.load(Ordering::SeqCst);
        let slot = self.transport.lock().await;
        if self.failure_epoch.load(Ordering::SeqCst) != seen_epoch && self.state() == SessionState::Failed {
            return Err(AppError::transport(
                &self.target,
                operation,
                "Session failed while the request was queued",
            ));
        }
        Ok(slot)
    }

    async fn ensure_connected(&self, slot: &mut TransportSlot) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::transport(
                &self.target,
                "connect",
                "Session was closed; acquire a new session",
            ));
        }
        if slot.is_some() && self.state() == SessionState::Ready {
            return Ok(());
        }
        if self.is_exhausted() {
            return Err(AppError::transport(
                &self.target,
                "connect",
                "Session gave up reconnecting; acquire a new session",
            ));
        }
        if let Some(stale) = slot.take() {
            release_transport(stale).await;
        }

        self.set_state(SessionState::Connecting);
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > 1 {
            tracing::info!("Reconnecting session {} ({}), attempt {}", self.id, self.target, attempt);
        }

        let connector = Arc::clone(&self.connector);
        let target = self.target.clone();
        let timeout = self.options.connect_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || connector.connect(&target)),
        )
        .await;

        let result = match outcome {
            Err(_) => Err(AppError::Timeout {
                target: self.target.to_string(),
                operation: "connect".to_string(),
                after: timeout,
            }),
            Ok(Err(join_error)) => Err(AppError::transport(
                &self.target,
                "connect",
                format!("Connect task failed: {}", join_error),
            )),
            Ok(Ok(result)) => result.map_err(|e| e.with_context(&self.target, "connect")),
        };

        match result {
            Ok(transport) if self.is_closed() => {
                // Retired while the handshake was in flight.
                release_transport(transport).await;
                self.set_state(SessionState::Disconnected);
                Err(AppError::transport(
                    &self.target,
                    "connect",
                    "Session was closed while connecting",
                ))
            }
            Ok(transport) => {
                *slot = Some(transport);
                self.failed_reconnects.store(0, Ordering::SeqCst);
                *self.connected_at.write() = Some(chrono::Utc::now().timestamp());
                self.touch();
                self.set_state(SessionState::Ready);
                tracing::info!("Session {} ready ({})", self.id, self.target);
                Ok(())
            }
            Err(e) => {
                self.mark_failed();
                if e.is_terminal() {
                    // Retrying with the same credentials cannot succeed.
                    self.exhausted.store(true, Ordering::SeqCst);
                    tracing::error!("Session {} authentication failed ({})", self.id, self.target);
                } else {
                    let failures = self.failed_reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= self.options.max_reconnect_attempts {
                        self.exhausted.store(true, Ordering::SeqCst);
                    }
                    tracing::warn!(
                        "Session {} connect failed ({} consecutive): {}",
                        self.id,
                        failures,
                        e
                    );
                }
                Err(e)
            }
        }
    }

    /// Hand the transport to the blocking pool for one call. On timeout the
    /// transport is abandoned with the blocked call and never reused.
    async fn run_on_transport<T, F>(
        &self,
        slot: &mut TransportSlot,
        operation: &str,
        timeout: Duration,
        call: F,
    ) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn Transport>) -> AppResult<T> + Send + 'static,
    {
        let mut transport = slot.take().ok_or_else(|| {
            AppError::transport(&self.target, operation, "Session has no open transport")
        })?;

        let outcome = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || {
                let result = call(&mut transport);
                (transport, result)
            }),
        )
        .await;

        match outcome {
            Err(_) => {
                self.mark_failed();
                tracing::warn!("Session {} {} timed out after {:?}", self.id, operation, timeout);
                Err(AppError::Timeout {
                    target: self.target.to_string(),
                    operation: operation.to_string(),
                    after: timeout,
                })
            }
            Ok(Err(join_error)) => {
                self.mark_failed();
                Err(AppError::transport(
                    &self.target,
                    operation,
                    format!("Transport task failed: {}", join_error),
                ))
            }
            Ok(Ok((transport, Ok(value)))) => {
                *slot = Some(transport);
                self.touch();
                Ok(value)
            }
            Ok(Ok((transport, Err(e)))) if e.is_transport() => {
                self.mark_failed();
                release_transport(transport).await;
                tracing::warn!("Session {} {} failed: {}", self.id, operation, e);
                Err(e.with_context(&self.target, operation))
            }
            Ok(Ok((transport, Err(e)))) => {
                *slot = Some(transport);
                self.touch();
                Err(e.with_context(&self.target, operation))
            }
        }
    }
}

async fn release_transport(mut transport: Box<dyn Transport>) {
    let _ = tokio::task::spawn_blocking(move || transport.close()).await;
}

/// `/dir/name` -> `/dir/.name.<random>.tmp`, on the same filesystem as the target.
fn temp_sibling_path(path: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let suffix = &suffix[..12];
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{}/.{}.{}.tmp", dir, name, suffix),
        None => format!(".{}.{}.tmp", path, suffix),
    }
}
