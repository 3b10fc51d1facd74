//! Error types for the registry-cache monitoring reconciler
//!
//! Errors carry the identity of the object that failed (kind, namespace,
//! name) and the operation that was attempted, so a failed pass can be
//! diagnosed from a single log line.

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Cluster operation that failed on a specific object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Fetching the object by identity
    Get,
    /// Creating the object after it was not found
    Create,
    /// Merge-patching an existing object
    Patch,
    /// Deleting the object
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Patch => "patch",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Main error type for monitoring reconciliation
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster read or write failed for a specific object
    #[error("failed to {operation} {kind} {namespace}/{name}: {source}")]
    Object {
        /// Resource kind (e.g., "ConfigMap", "PrometheusRule")
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// Operation that failed
        operation: Operation,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// Removing the legacy aggregated ConfigMap failed; the pass must stop
    #[error("failed deleting legacy ConfigMap {namespace}/{name}: {source}")]
    LegacyCleanup {
        /// Namespace of the legacy ConfigMap
        namespace: String,
        /// Name of the legacy ConfigMap
        name: String,
        /// The failure reported by the delete
        #[source]
        source: Box<Error>,
    },

    /// Looking up the schema sentinel failed with something other than 404
    #[error("failed looking up sentinel StatefulSet {namespace}/{name}: {source}")]
    SchemaDetection {
        /// Namespace being reconciled
        namespace: String,
        /// Name of the sentinel StatefulSet
        name: String,
        /// The failure reported by the lookup
        #[source]
        source: Box<Error>,
    },

    /// An object could not be encoded or decoded
    #[error("serialization error on {kind} {namespace}/{name}: {message}")]
    Serialization {
        /// Resource kind (e.g., "PrometheusRule")
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration supplied on the command line or environment
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// The offending setting (e.g., "namespace")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client", "telemetry")
        context: String,
    },
}

impl Error {
    /// Wrap a kube-rs error with the identity of the object it concerns
    pub fn object(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        operation: Operation,
        source: kube::Error,
    ) -> Self {
        Self::Object {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            operation,
            source,
        }
    }

    /// Wrap a deletion failure of the legacy ConfigMap
    pub fn legacy_cleanup(
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::LegacyCleanup {
            namespace: namespace.into(),
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a failed sentinel lookup
    pub fn schema_detection(
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::SchemaDetection {
            namespace: namespace.into(),
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error for a specific object
    pub fn serialization(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Serialization {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for a specific setting
    pub fn config_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
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

    /// Check if this error is worth another reconcile pass
    ///
    /// Transport failures, 5xx responses, conflicts and throttling are
    /// transient, as is any failed sentinel lookup. Other 4xx responses and
    /// serialization or configuration problems need a fix before a retry can
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Object { source, .. } => kube_error_retryable(source),
            Error::LegacyCleanup { source, .. } => source.is_retryable(),
            Error::SchemaDetection { .. } => true,
            Error::Serialization { .. } => false,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the (kind, name) of the object this error is associated with
    pub fn object_ref(&self) -> Option<(&str, &str)> {
        match self {
            Error::Object { kind, name, .. } => Some((kind, name)),
            Error::LegacyCleanup { name, .. } => Some(("ConfigMap", name)),
            Error::SchemaDetection { name, .. } => Some(("StatefulSet", name)),
            Error::Serialization { kind, name, .. } => Some((kind, name)),
            _ => None,
        }
    }
}

/// Check if a kube-rs error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn kube_error_retryable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => {
            !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
        }
        _ => true,
    }
}
