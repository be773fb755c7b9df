// src/error.rs
//! Unified error type for templar
//!
//! Every fallible operation in the crate funnels into `TemplarError`.
//! The variants map to recovery scopes: `Config` and `Fatal` abort the
//! scan, `Cancelled` drains it, everything else is recovered at the
//! narrowest scope that can continue useful work.

use std::fmt;

/// Main error type for all templar operations
#[derive(Debug)]
pub enum TemplarError {
    /// Invalid user options, fatal at startup
    Config(String),

    /// Unreadable or malformed template file, counted and skipped
    Load(String),

    /// Syntactically valid but semantically suspect input
    Warning(String),

    /// Host unreachable, TLS failure, timeout; feeds the host error cache
    Network(NetworkErrorKind, String),

    /// Matcher/extractor failure isolated to one (template, target) pair
    Execution(String),

    /// Scan-wide stop requested
    Cancelled,

    /// Unrecoverable, aborts the scan
    Fatal(String),

    /// I/O error (file operations)
    Io(std::io::Error),

    /// Parsing error (URL, JSON, YAML)
    Parse(String),
}

/// Classification of network failures for the host error cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionRefused,
    TlsHandshake,
    Timeout,
    Dns,
    Other,
}

impl NetworkErrorKind {
    /// Kinds counted against a host by default
    pub fn is_tracked_by_default(&self) -> bool {
        matches!(
            self,
            NetworkErrorKind::ConnectionRefused
                | NetworkErrorKind::TlsHandshake
                | NetworkErrorKind::Timeout
        )
    }
}

impl std::error::Error for TemplarError {}

impl fmt::Display for TemplarError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TemplarError::Config(s) => write!(f, "Configuration error: {}", s),
            TemplarError::Load(s) => write!(f, "Template load error: {}", s),
            TemplarError::Warning(s) => write!(f, "Warning: {}", s),
            TemplarError::Network(kind, s) => write!(f, "Network error ({:?}): {}", kind, s),
            TemplarError::Execution(s) => write!(f, "Execution error: {}", s),
            TemplarError::Cancelled => write!(f, "Scan cancelled"),
            TemplarError::Fatal(s) => write!(f, "Fatal error: {}", s),
            TemplarError::Io(e) => write!(f, "I/O error: {}", e),
            TemplarError::Parse(s) => write!(f, "Parse error: {}", s),
        }
    }
}

// Automatic conversion from std::io::Error
impl From<std::io::Error> for TemplarError {
    fn from(e: std::io::Error) -> Self {
        TemplarError::Io(e)
    }
}

// Automatic conversion from reqwest::Error, classifying the failure
impl From<reqwest::Error> for TemplarError {
    fn from(e: reqwest::Error) -> Self {
        let message = e.to_string();
        let lowered = message.to_lowercase();
        let kind = if e.is_timeout() {
            NetworkErrorKind::Timeout
        } else if lowered.contains("certificate")
            || lowered.contains("tls")
            || lowered.contains("ssl")
        {
            NetworkErrorKind::TlsHandshake
        } else if lowered.contains("dns") {
            NetworkErrorKind::Dns
        } else if e.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else {
            NetworkErrorKind::Other
        };
        TemplarError::Network(kind, message)
    }
}

// Automatic conversion from url::ParseError
impl From<url::ParseError> for TemplarError {
    fn from(e: url::ParseError) -> Self {
        TemplarError::Parse(e.to_string())
    }
}

// Automatic conversion from serde_json::Error
impl From<serde_json::Error> for TemplarError {
    fn from(e: serde_json::Error) -> Self {
        TemplarError::Parse(format!("JSON parse error: {}", e))
    }
}

// Automatic conversion from serde_yaml::Error
impl From<serde_yaml::Error> for TemplarError {
    fn from(e: serde_yaml::Error) -> Self {
        TemplarError::Parse(format!("YAML parse error: {}", e))
    }
}

impl TemplarError {
    /// The network error kind, if this is a network failure
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            TemplarError::Network(kind, _) => Some(*kind),
            _ => None,
        }
    }
}
