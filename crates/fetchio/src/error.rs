use std::path::PathBuf;

/// Unified error type for the download engine.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("DNS resolution failed for `{host}`: {reason}")]
    Dns { host: String, reason: String },

    #[error("connection to {host}:{port} failed: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        operation: &'static str,
    },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("write to {path} failed: {reason}")]
    FileWrite { path: PathBuf, reason: String },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("repository not found: {id}")]
    NotFound { id: String },

    #[error("authentication required for {id}")]
    AuthRequired { id: String },

    #[error("listing parse error: {reason}")]
    Parse { reason: String },

    #[error("insufficient disk space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn connection_failed(
        host: impl Into<String>,
        port: u16,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConnectionFailed {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: u16, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn file_write(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::FileWrite {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Whether a failed preferred-protocol attempt should make the selector
    /// evict the host's cache entry and fall through to the next protocol.
    ///
    /// Only connection-level failures and protocol violations demote a host;
    /// an HTTP status error means the origin spoke the protocol fine.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::Protocol { .. } | Self::Dns { .. }
        )
    }

    /// Remap a status error on a metadata request to the registry-level kind.
    pub fn remap_registry_status(self, id: &str) -> Self {
        match self {
            Self::HttpStatus { status: 404, .. } => Self::NotFound { id: id.to_string() },
            Self::HttpStatus {
                status: 401 | 403, ..
            } => Self::AuthRequired { id: id.to_string() },
            other => other,
        }
    }
}

pub type Result<T, E = FetchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_only_on_connection_level_failures() {
        assert!(FetchError::connection_failed("h", 443, "refused").triggers_fallback());
        assert!(FetchError::protocol("reset").triggers_fallback());
        assert!(!FetchError::http_status(404, "https://x/", "metadata").triggers_fallback());
        assert!(!FetchError::timeout("idle").triggers_fallback());
        assert!(!FetchError::Cancelled.triggers_fallback());
    }

    #[test]
    fn registry_remap_covers_auth_and_missing() {
        let e = FetchError::http_status(404, "https://x/", "metadata").remap_registry_status("org/m");
        assert!(matches!(e, FetchError::NotFound { ref id } if id == "org/m"));

        let e = FetchError::http_status(401, "https://x/", "metadata").remap_registry_status("org/m");
        assert!(matches!(e, FetchError::AuthRequired { .. }));

        let e = FetchError::http_status(500, "https://x/", "metadata").remap_registry_status("org/m");
        assert!(matches!(e, FetchError::HttpStatus { status: 500, .. }));
    }
}
