//! Error types for the seedlet agent
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context it happened in (seed name, phase,
//! resource kind) alongside the message, so log lines stay searchable.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for seedlet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid or incomplete component configuration
    #[error("configuration error [{field}]: {message}")]
    Config {
        /// Offending field path (e.g. "gardenClientConnection.kubeconfig")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Credential bootstrap or rotation failure
    #[error("bootstrap error [{context}]: {message}")]
    Bootstrap {
        /// Description of what failed
        message: String,
        /// Stage of the handshake (e.g. "csr", "kubeconfig", "cleanup")
        context: String,
        /// Denied or failed CSRs are terminal; everything else may be retried
        retryable: bool,
    },

    /// Seed registration failure
    #[error("registration error for seed {seed}: {message}")]
    Registration {
        /// Name of the seed being registered
        seed: String,
        /// Description of what failed
        message: String,
    },

    /// Informer caches did not become ready in time
    #[error("cache sync error: {message}")]
    CacheSync {
        /// Description of what failed
        message: String,
        /// Kinds that were still unsynced when the deadline passed
        pending: Vec<String>,
    },

    /// Misuse of the scoped cache (e.g. listing a single-object kind)
    #[error("cache error [{kind}]: {message}")]
    Cache {
        /// Resource kind the call was made for
        kind: String,
        /// Description of what's wrong
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A maintenance routine found state it refuses to touch automatically
    #[error("manual intervention required for {resource}: {message}")]
    ManualIntervention {
        /// Resource that needs an operator's attention
        resource: String,
        /// What the operator must do
        message: String,
    },

    /// One or more tasks in a parallel flow failed
    #[error("flow {name} failed: {message}")]
    Flow {
        /// Name of the flow
        name: String,
        /// Aggregated task failures
        message: String,
        /// Number of individual task errors
        failures: usize,
    },

    /// The operation was interrupted by cancellation
    #[error("cancelled: {context}")]
    Cancelled {
        /// What was running when cancellation arrived
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "lifecycle", "probes", "heartbeat")
        context: String,
    },
}

impl Error {
    /// Create a configuration error for a field path
    pub fn config(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable bootstrap error
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
            retryable: true,
        }
    }

    /// Create a retryable bootstrap error with context
    pub fn bootstrap_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: msg.into(),
            context: context.into(),
            retryable: true,
        }
    }

    /// Create a terminal bootstrap error (denied or failed certificate request)
    pub fn bootstrap_permanent(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: msg.into(),
            context: context.into(),
            retryable: false,
        }
    }

    /// Create a registration error for a seed
    pub fn registration(seed: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            seed: seed.into(),
            message: msg.into(),
        }
    }

    /// Create a cache sync error listing the kinds that never synced
    pub fn cache_sync(msg: impl Into<String>, pending: Vec<String>) -> Self {
        Self::CacheSync {
            message: msg.into(),
            pending,
        }
    }

    /// Create a cache usage error
    pub fn cache(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cache {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a manual-intervention error
    pub fn manual_intervention(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ManualIntervention {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, serialization and manual-intervention errors need a
    /// human to fix something first. Kubernetes errors are retryable unless
    /// the API server answered with a 4xx; request timeouts, throttling and
    /// update conflicts are the exceptions.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => {
                    matches!(ae.code, 408 | 429) || self.is_conflict()
                }
                _ => true,
            },
            Error::Config { .. } => false,
            Error::Bootstrap { retryable, .. } => *retryable,
            Error::Registration { .. } => true,
            Error::CacheSync { .. } => true,
            Error::Cache { .. } => false,
            Error::Serialization { .. } => false,
            Error::ManualIntervention { .. } => false,
            Error::Flow { .. } => true,
            Error::Cancelled { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True if this error means the requested object does not exist
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// True if the API server refused the request for lack of permissions
    pub fn is_forbidden(&self) -> bool {
        self.api_code() == Some(403)
    }

    /// True if a create raced with another writer
    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_status(), Some((409, "AlreadyExists")))
    }

    /// True if an update lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self.api_status(), Some((409, reason)) if reason != "AlreadyExists")
    }

    /// True if this error came from cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Bootstrap { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            Error::Cancelled { context } => Some(context),
            _ => None,
        }
    }

    fn api_code(&self) -> Option<u16> {
        self.api_status().map(|(code, _)| code)
    }

    fn api_status(&self) -> Option<(u16, &str)> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some((ae.code, ae.reason.as_str())),
            _ => None,
        }
    }

}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Build a kube API error response, used by tests across the workspace
pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    })
}
