//! Log setup and redaction of secrets in anything that reaches a log line or
//! an error surfaced to the caller.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum line length before truncation
const MAX_LINE_LENGTH: usize = 2048;

/// Maximum length of remote stderr carried inside an error
const MAX_ERROR_LENGTH: usize = 200;

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // SSH private key blocks
        Regex::new(r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----").unwrap(),
        // sshpass style inline passwords
        Regex::new(r"sshpass\s+-p\s*\S+").unwrap(),
        // Authorization headers
        Regex::new(r"(?i)authorization\s*:\s*(bearer|basic)\s+[^\s]+").unwrap(),
        // Generic secrets by key name (key=value patterns)
        Regex::new(r#"(?i)(password|passwd|pwd|secret|token|api[_-]?key|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#).unwrap(),
    ]
});

/// Install the global `tracing` subscriber, honouring `RUST_LOG` when set.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Sanitize a string by removing sensitive information
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.len() > MAX_LINE_LENGTH {
        result = format!("{}... [truncated]", truncate_at_boundary(&result, MAX_LINE_LENGTH));
    }

    result
}

/// Sanitize remote output that becomes part of an error message
pub fn sanitize_error_message(msg: &str) -> String {
    let msg = sanitize(msg.trim());
    if msg.len() > MAX_ERROR_LENGTH {
        format!("{}...", truncate_at_boundary(&msg, MAX_ERROR_LENGTH))
    } else {
        msg
    }
}

fn truncate_at_boundary(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
