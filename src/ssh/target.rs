use crate::error::{AppError, AppResult};
use std::fmt;
use std::path::PathBuf;

/// Credential material used to authenticate against a target
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMaterial::Password(_) => f.write_str("Password([REDACTED])"),
            AuthMaterial::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            AuthMaterial::Agent => f.write_str("Agent"),
        }
    }
}

/// Identity used for pooling: one session per host, port and user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

/// A remote endpoint plus the credentials to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    host: String,
    port: u16,
    username: String,
    auth: AuthMaterial,
}

impl ConnectionTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMaterial,
    ) -> AppResult<Self> {
        let host = host.into();
        let username = username.into();
        if host.trim().is_empty() {
            return Err(AppError::Validation("Host must not be empty".to_string()));
        }
        if username.trim().is_empty() {
            return Err(AppError::Validation("Username must not be empty".to_string()));
        }
        if port == 0 {
            return Err(AppError::Validation("Port must not be 0".to_string()));
        }
        Ok(Self {
            host,
            port,
            username,
            auth,
        })
    }

    /// Parse `user@host`, `user@host:port` or `user@[v6addr]:port`.
    pub fn from_connection_string(
        connection_string: &str,
        default_port: u16,
        auth: AuthMaterial,
    ) -> AppResult<Self> {
        let invalid = || {
            AppError::Validation(format!(
                "Invalid connection string '{}'. Use the format username@host[:port]",
                connection_string
            ))
        };

        let (username, rest) = connection_string.trim().split_once('@').ok_or_else(invalid)?;
        if rest.contains('@') {
            return Err(invalid());
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            match after.strip_prefix(':') {
                Some(port) => (host, port.parse::<u16>().map_err(|_| invalid())?),
                None if after.is_empty() => (host, default_port),
                None => return Err(invalid()),
            }
        } else {
            match rest.rsplit_once(':') {
                // A bare IPv6 address has several colons and no port.
                Some((host, port)) if !host.contains(':') => {
                    (host, port.parse::<u16>().map_err(|_| invalid())?)
                }
                _ => (rest, default_port),
            }
        };

        Self::new(host, port, username, auth).map_err(|_| invalid())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth(&self) -> &AuthMaterial {
        &self.auth
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            host: self.host.to_ascii_lowercase(),
            port: self.port,
            username: self.username.clone(),
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}", self.username, self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.username, self.host, self.port)
        }
    }
}
