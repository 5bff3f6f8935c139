use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::domain::Source;

/// User-facing classification of every failure the tool can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotConfigured,
    AuthFailed,
    QuotaExceeded,
    Unavailable,
    Invalid,
    Io,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Io => 1,
            ErrorKind::Invalid => 2,
            ErrorKind::NotConfigured => 3,
            ErrorKind::AuthFailed => 4,
            ErrorKind::QuotaExceeded => 5,
            ErrorKind::Unavailable => 6,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum BookError {
    #[error("{backend} is not configured: {message}")]
    NotConfigured {
        backend: Source,
        message: String,
        hint: String,
    },

    #[error("{backend} rejected the configured credentials")]
    AuthFailed {
        backend: Source,
        detail: Option<String>,
    },

    #[error("{backend} daily download limit reached")]
    QuotaExceeded {
        backend: Source,
        detail: Option<String>,
    },

    #[error("{backend} is unavailable: {message}")]
    Unavailable {
        backend: Source,
        message: String,
        detail: Option<String>,
    },

    #[error("no backend could serve the request")]
    NoBackendAvailable { attempts: Vec<String> },

    #[error("invalid arguments: {0}")]
    Invalid(String),

    #[error("failed to parse config file: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl BookError {
    pub fn unavailable(backend: Source, message: impl Into<String>) -> Self {
        BookError::Unavailable {
            backend,
            message: message.into(),
            detail: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BookError::NotConfigured { .. } | BookError::NoBackendAvailable { .. } => {
                ErrorKind::NotConfigured
            }
            BookError::AuthFailed { .. } => ErrorKind::AuthFailed,
            BookError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            BookError::Unavailable { .. } => ErrorKind::Unavailable,
            BookError::Invalid(_) => ErrorKind::Invalid,
            BookError::ConfigParse(_) | BookError::Filesystem(_) => ErrorKind::Io,
        }
    }

    pub fn hint(&self) -> String {
        match self {
            BookError::NotConfigured { hint, .. } => hint.clone(),
            BookError::AuthFailed { .. } => {
                "check credentials: book config set --zlib-email <email> --zlib-password <password>"
                    .to_string()
            }
            BookError::QuotaExceeded { .. } => {
                "the daily download limit resets after 24h; try again later or use --source annas"
                    .to_string()
            }
            BookError::Unavailable { .. } => {
                "the service or tool did not respond; retry later or try another source".to_string()
            }
            BookError::NoBackendAvailable { .. } => [
                "configure at least one source:",
                "  book config set --zlib-email <email> --zlib-password <password>",
                "  book config set --annas-key <key>",
            ]
            .join("\n"),
            BookError::Invalid(_) => "run with --help to see the expected arguments".to_string(),
            BookError::ConfigParse(_) => {
                "fix or remove the config file (book config reset)".to_string()
            }
            BookError::Filesystem(_) => {
                "check that the target directory exists and is writable".to_string()
            }
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            BookError::AuthFailed { detail, .. }
            | BookError::QuotaExceeded { detail, .. }
            | BookError::Unavailable { detail, .. } => detail.clone(),
            BookError::NoBackendAvailable { attempts } if !attempts.is_empty() => {
                Some(attempts.join("; "))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let kinds = [
            ErrorKind::Io,
            ErrorKind::Invalid,
            ErrorKind::NotConfigured,
            ErrorKind::AuthFailed,
            ErrorKind::QuotaExceeded,
            ErrorKind::Unavailable,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|kind| kind.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn quota_is_not_auth() {
        let err = BookError::QuotaExceeded {
            backend: Source::Zlib,
            detail: Some("limit".to_string()),
        };
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(err.detail().as_deref(), Some("limit"));
    }
}
