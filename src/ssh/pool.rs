use super::{ConnectionTarget, Connector, PoolKey, RemoteSession, SessionInfo, SessionOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct PoolEntry {
    session: Arc<RemoteSession>,
    /// Callers between `acquire` and `release`; only unleased sessions are evicted.
    leases: usize,
}

/// Manages all remote sessions, one per host, port and user
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    sessions: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            connector,
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the session for `target`, creating it if there is none or the
    /// existing one can no longer be used.
    ///
    /// A session that is `Ready` is shared whatever credentials the caller
    /// brings. One that has not authenticated yet is only shared with callers
    /// presenting the same credentials; otherwise it is replaced.
    pub async fn acquire(&self, target: &ConnectionTarget) -> Arc<RemoteSession> {
        let key = target.pool_key();
        let (session, replaced) = {
            let mut sessions = self.sessions.lock();
            if let Some(entry) = sessions.get_mut(&key) {
                if is_reusable(&entry.session, target) {
                    entry.leases += 1;
                    return Arc::clone(&entry.session);
                }
            }

            let session = Arc::new(RemoteSession::new(
                target.clone(),
                Arc::clone(&self.connector),
                self.options.clone(),
            ));
            let replaced = sessions.insert(
                key,
                PoolEntry {
                    session: Arc::clone(&session),
                    leases: 1,
                },
            );
            (session, replaced)
        };

        tracing::info!("Created remote session {} for {}", session.id(), target);
        if let Some(old) = replaced {
            tracing::debug!("Replacing session {} for {}", old.session.id(), target);
            // Retired right away so no holder can reconnect it; the transport
            // is released once queued work has drained.
            old.session.retire();
            tokio::spawn(async move { old.session.close().await });
        }
        session
    }

    /// Return a session obtained from [`acquire`](Self::acquire); once every
    /// caller has released it the session becomes eligible for eviction.
    /// Releasing a session that has since been replaced leaves the table alone.
    pub fn release(&self, session: &Arc<RemoteSession>) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(&session.target().pool_key()) {
            if Arc::ptr_eq(&entry.session, session) {
                entry.leases = entry.leases.saturating_sub(1);
            }
        }
    }

    /// Close and remove released sessions idle for at least `max_idle`, along
    /// with released sessions that are already closed or gave up reconnecting.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let evicted: Vec<Arc<RemoteSession>> = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<PoolKey> = sessions
                .iter()
                .filter(|(_, entry)| {
                    entry.leases == 0
                        && (entry.session.idle_for() >= max_idle
                            || entry.session.is_closed()
                            || entry.session.is_exhausted())
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| sessions.remove(key))
                .map(|entry| entry.session)
                .collect()
        };

        for session in &evicted {
            session.close().await;
            tracing::info!("Evicted idle session {} ({})", session.id(), session.target());
        }
        evicted.len()
    }

    /// List all sessions
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .values()
            .map(|entry| entry.session.info())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close every session and empty the table.
    pub async fn close_all(&self) {
        let drained: Vec<PoolEntry> = self.sessions.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.session.close().await;
        }
    }

    /// Periodically evict idle sessions in the background. The task never
    /// reconnects anything; abort the handle to stop it.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = self.evict_idle(max_idle).await;
                if evicted > 0 {
                    tracing::debug!("Reaper evicted {} session(s)", evicted);
                }
            }
        })
    }
}

fn is_reusable(session: &RemoteSession, target: &ConnectionTarget) -> bool {
    if session.is_closed() || session.is_exhausted() {
        return false;
    }
    session.state() == super::SessionState::Ready || session.target().auth() == target.auth()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::{FakeConnector, FakeFailure};
    use crate::ssh::{AuthMaterial, CommandRequest, SessionState};

    fn target(host: &str) -> ConnectionTarget {
        ConnectionTarget::new(host, 22, "alice", AuthMaterial::Password("pw".into())).unwrap()
    }

    fn pool(fake: &FakeConnector) -> SessionPool {
        let options = SessionOptions {
            connect_timeout: Duration::from_secs(2),
            transfer_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 1,
        };
        SessionPool::new(Arc::new(fake.clone()), options)
    }

    #[tokio::test]
    async fn test_acquire_dedups_by_target() {
        let fake = FakeConnector::new();
        let pool = pool(&fake);

        let a = pool.acquire(&target("box.local")).await;
        let b = pool.acquire(&target("BOX.local")).await;
        let other = pool.acquire(&target("other.local")).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_session_is_replaced() {
        let fake = FakeConnector::new();
        fake.fail_next_connect(FakeFailure::Auth);
        let pool = pool(&fake);

        let first = pool.acquire(&target("box.local")).await;
        assert!(first.connect().await.is_err());
        assert!(first.is_exhausted());

        let second = pool.acquire(&target("box.local")).await;
        assert!(!Arc::ptr_eq(&first, &second));
        second.connect().await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let fake = FakeConnector::new();
        let pool = pool(&fake);

        let first = pool.acquire(&target("box.local")).await;
        first.close().await;
        let second = pool.acquire(&target("box.local")).await;
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unauthenticated_session_not_shared_across_credentials() {
        let fake = FakeConnector::new();
        let pool = pool(&fake);

        let with_password = pool.acquire(&target("box.local")).await;
        let agent = ConnectionTarget::new("box.local", 22, "alice", AuthMaterial::Agent).unwrap();
        let with_agent = pool.acquire(&agent).await;
        assert!(!Arc::ptr_eq(&with_password, &with_agent));

        with_agent.connect().await.unwrap();
        let again = pool.acquire(&target("box.local")).await;
        assert!(Arc::ptr_eq(&with_agent, &again));
    }

    #[tokio::test]
    async fn test_replaced_session_cannot_reconnect() {
        let fake = FakeConnector::new();
        let pool = pool(&fake);

        let stale = pool.acquire(&target("box.local")).await;
        let agent = ConnectionTarget::new("box.local", 22, "alice", AuthMaterial::Agent).unwrap();
        let current = pool.acquire(&agent).await;

        // The old holder must not open a second connection behind the pool's back.
        assert!(stale.execute(CommandRequest::new("true", Duration::from_secs(1))).await.is_err());
        current.connect().await.unwrap();

        assert_eq!(pool.len(), 1);
        assert_eq!(fake.connect_count(), 1);
        assert!(stale.is_closed());
        assert_eq!(current.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_release_of_replaced_session_keeps_new_lease() {
        let fake = FakeConnector::new();
        let pool = pool(&fake);

        let stale = pool.acquire(&target("box.local")).await;
        let agent = ConnectionTarget::new("box.local", 22, "alice", AuthMaterial::Agent).unwrap();
        let held = pool.acquire(&agent).await;
        held.connect().await.unwrap();

        pool.release(&stale);
        assert_eq!(pool.evict_idle(Duration::ZERO).await, 0);
        assert!(!held.is_closed());

        pool.release(&held);
        assert_eq!(pool.evict_idle(Duration::ZERO).await, 1);
        assert!(held.is_closed());
    }

    #[tokio::test]
    async fn test_evict_idle_skips_leased_sessions() {
        let fake = FakeConnector::new();
        let pool = pool(&fake);

        let busy = pool.acquire(&target("busy.local")).await;
        let idle = pool.acquire(&target("idle.local")).await;
        busy.connect().await.unwrap();
        idle.connect().await.unwrap();
        pool.release(&idle);

        assert_eq!(pool.evict_idle(Duration::ZERO).await, 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.list_sessions()[0].target, busy.target().to_string());
        assert_eq!(fake.closed_count(), 1);

        // Nothing has been idle for an hour.
        pool.release(&busy);
        assert_eq!(pool.evict_idle(Duration::from_secs(3600)).await, 0);
    }

    #[tokio::test]
    async fn test_close_all_empties_pool() {
        let fake = FakeConnector::new();
        let pool = pool(&fake);
        pool.acquire(&target("a.local")).await.connect().await.unwrap();
        pool.acquire(&target("b.local")).await.connect().await.unwrap();

        pool.close_all().await;
        assert!(pool.is_empty());
        assert_eq!(fake.closed_count(), 2);
    }

    #[tokio::test]
    async fn test_reaper_evicts_released_sessions() {
        let fake = FakeConnector::new();
        let pool = Arc::new(pool(&fake));
        let session = pool.acquire(&target("box.local")).await;
        pool.release(&session);

        let reaper = Arc::clone(&pool).spawn_reaper(Duration::from_millis(50), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.is_empty());
        reaper.abort();
    }
}
