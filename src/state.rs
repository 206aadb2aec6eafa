use crate::config::{get_config_dir, known_hosts_path, AppSettings};
use crate::error::AppResult;
use crate::remote_fs::RemoteFs;
use crate::ssh::{Connector, SessionOptions, SessionPool, Ssh2Connector};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Global application state
pub struct AppState {
    pub config_dir: PathBuf,
    pub settings: AppSettings,
    pub pool: Arc<SessionPool>,
    pub fs: RemoteFs,
}

impl AppState {
    pub fn new() -> AppResult<Self> {
        let config_dir = get_config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        tracing::debug!("Config dir: {:?}", config_dir);

        let settings = AppSettings::load(&config_dir)?;
        let connector = Ssh2Connector::new(settings.ssh.clone(), known_hosts_path(&config_dir));
        Ok(Self::with_connector(config_dir, settings, Arc::new(connector)))
    }

    /// Build the state around any connector, e.g. a fake one in tests.
    pub fn with_connector(config_dir: PathBuf, settings: AppSettings, connector: Arc<dyn Connector>) -> Self {
        let options = SessionOptions {
            connect_timeout: settings.ssh.connect_timeout(),
            transfer_timeout: settings.ssh.command_timeout(),
            max_reconnect_attempts: settings.pool.max_reconnect_attempts,
        };
        let pool = Arc::new(SessionPool::new(connector, options));
        let fs = RemoteFs::new(Arc::clone(&pool), settings.ssh.command_timeout());

        Self {
            config_dir,
            settings,
            pool,
            fs,
        }
    }

    /// Start idle eviction with the configured interval and idle timeout.
    pub fn start_reaper(&self) -> JoinHandle<()> {
        Arc::clone(&self.pool).spawn_reaper(self.settings.pool.reap_interval(), self.settings.pool.idle_timeout())
    }
}
