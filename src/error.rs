//! Error types for campaign execution

use std::time::Duration;
use thiserror::Error;

/// How an error should be treated by the wait engine and the campaign runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid flag, unparseable variable bag, malformed manifest or template
    Config,
    /// Connectivity, throttling or conflicts; polling continues
    ClusterTransient,
    /// Failed resource, exceeded deadline, unexpected object shape
    ClusterTerminal,
    /// An assess step observed a wrong value
    Assertion,
    /// A teardown step failed; recorded, never fatal
    TeardownWarning,
    /// The campaign was interrupted
    Cancelled,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ClusterTransient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::ClusterTransient => write!(f, "cluster-transient"),
            ErrorKind::ClusterTerminal => write!(f, "cluster-terminal"),
            ErrorKind::Assertion => write!(f, "assertion"),
            ErrorKind::TeardownWarning => write!(f, "teardown-warning"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Main error type for argus operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error, classified by response code
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("transient cluster error: {0}")]
    Transient(String),

    #[error("terminal cluster error: {0}")]
    Terminal(String),

    /// A wait exceeded its deadline; carries the last thing the predicate saw
    #[error("timed out after {elapsed:?} waiting for {what}: {last_observation}")]
    Timeout {
        what: String,
        elapsed: Duration,
        last_observation: String,
    },

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("teardown warning: {0}")]
    TeardownWarning(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A manifest document failed to apply or delete
    #[error("{document}: {source}")]
    Manifest {
        document: String,
        #[source]
        source: Box<Error>,
    },

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn assertion(msg: impl Into<String>) -> Self {
        Self::Assertion(msg.into())
    }

    pub fn teardown(msg: impl Into<String>) -> Self {
        Self::TeardownWarning(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Attach the identity of the manifest document an error came from
    pub fn in_document(self, document: impl Into<String>) -> Self {
        Self::Manifest {
            document: document.into(),
            source: Box::new(self),
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Classify this error for retry and reporting decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube(kube::Error::Api(resp)) => classify_status_code(resp.code),
            // transport, TLS and decode failures against a live API server are retried
            Error::Kube(_) => ErrorKind::ClusterTransient,
            Error::NotFound { .. } | Error::Transient(_) => ErrorKind::ClusterTransient,
            Error::Terminal(_) | Error::Timeout { .. } => ErrorKind::ClusterTerminal,
            Error::Assertion(_) => ErrorKind::Assertion,
            Error::TeardownWarning(_) => ErrorKind::TeardownWarning,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Config(_) | Error::Template(_) | Error::Yaml(_) | Error::Json(_) => {
                ErrorKind::Config
            }
            Error::Io(_) => ErrorKind::ClusterTerminal,
            Error::Manifest { source, .. } => source.kind(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// True for a missing object, whether reported by the API server or by a lookup
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Error::Manifest { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409 && resp.reason == "AlreadyExists")
    }
}

/// Map an API server response code onto an error kind
pub fn classify_status_code(code: u16) -> ErrorKind {
    match code {
        404 | 409 | 429 => ErrorKind::ClusterTransient,
        500..=599 => ErrorKind::ClusterTransient,
        _ => ErrorKind::ClusterTerminal,
    }
}
