use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error ({operation} on {target}): {message}")]
    Auth {
        target: String,
        operation: String,
        message: String,
    },

    #[error("Host key rejected for {target}: {message}")]
    HostKey { target: String, message: String },

    #[error("Transport error ({operation} on {target}): {message}")]
    Transport {
        target: String,
        operation: String,
        message: String,
    },

    #[error("Timed out after {after:?} ({operation} on {target})")]
    Timeout {
        target: String,
        operation: String,
        after: Duration,
    },

    #[error("Remote command failed ({operation} on {target}, exit {exit_status}): {message}")]
    RemoteCommand {
        target: String,
        operation: String,
        exit_status: i32,
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    pub fn auth(target: impl ToString, operation: &str, message: impl Into<String>) -> Self {
        AppError::Auth {
            target: target.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn transport(target: impl ToString, operation: &str, message: impl Into<String>) -> Self {
        AppError::Transport {
            target: target.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Connection drops and timeouts; the session must reconnect before reuse.
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Transport { .. } | AppError::Timeout { .. })
    }

    /// Failures that retrying with the same credentials cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppError::Auth { .. } | AppError::HostKey { .. })
    }

    /// Stamp a target and operation onto an error raised below the session layer.
    pub fn with_context(self, target: impl ToString, operation: &str) -> Self {
        let target = target.to_string();
        match self {
            AppError::Auth { message, .. } => AppError::Auth {
                target,
                operation: operation.to_string(),
                message,
            },
            AppError::HostKey { message, .. } => AppError::HostKey { target, message },
            AppError::Transport { message, .. } => AppError::Transport {
                target,
                operation: operation.to_string(),
                message,
            },
            AppError::Timeout { after, .. } => AppError::Timeout {
                target,
                operation: operation.to_string(),
                after,
            },
            AppError::RemoteCommand {
                exit_status,
                message,
                ..
            } => AppError::RemoteCommand {
                target,
                operation: operation.to_string(),
                exit_status,
                message,
            },
            other => other,
        }
    }
}

/// Serializable error for the presentation layer
#[derive(Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (code, message, details) = match err {
            AppError::Auth { message, .. } => (
                "AUTH_ERROR",
                "Authentication failed".to_string(),
                Some(message.clone()),
            ),
            AppError::HostKey { .. } => ("HOST_KEY_REJECTED", err.to_string(), None),
            AppError::Transport { .. } => ("TRANSPORT_ERROR", err.to_string(), None),
            AppError::Timeout { .. } => ("TIMEOUT", err.to_string(), None),
            AppError::RemoteCommand { message, .. } => (
                "REMOTE_COMMAND_FAILED",
                err.to_string(),
                Some(message.clone()),
            ),
            AppError::Validation(msg) => ("VALIDATION_ERROR", msg.clone(), None),
            AppError::Config(msg) => ("CONFIG_ERROR", msg.clone(), None),
            AppError::Io(e) => ("IO_ERROR", e.to_string(), None),
            AppError::Serialization(msg) => ("SERIALIZATION_ERROR", msg.clone(), None),
        };

        SerializableError {
            code: code.to_string(),
            message,
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(AppError::transport("u@h:22", "execute", "reset").is_transport());
        let timeout = AppError::Timeout {
            target: "u@h:22".into(),
            operation: "execute".into(),
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_transport());
        assert!(!timeout.is_terminal());
        assert!(AppError::auth("u@h:22", "connect", "denied").is_terminal());
        assert!(!AppError::Validation("empty".into()).is_transport());
    }

    #[test]
    fn test_context_is_replaced() {
        let err = AppError::transport("", "", "broken pipe").with_context("alice@box:22", "read_file");
        let text = err.to_string();
        assert!(text.contains("alice@box:22"));
        assert!(text.contains("read_file"));
        assert!(text.contains("broken pipe"));
    }

    #[test]
    fn test_serialized_auth_hides_details_in_message() {
        let err = AppError::auth("u@h:22", "connect", "Password authentication failed");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "AUTH_ERROR");
        assert_eq!(json["message"], "Authentication failed");
        assert_eq!(json["details"], "Password authentication failed");
    }
}
