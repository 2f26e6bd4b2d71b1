//! Reconciler error type

use thiserror::Error;

use bindings_common::Error;

/// Errors surfaced by the reconcilers to the controller runtime
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A binding-level failure (validation, projection, template, resolution)
    #[error(transparent)]
    Binding(#[from] Error),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON (de)serialization of a resource failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Whether the controller should retry with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Binding(e) => e.is_retryable(),
            Self::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 404 && ae.code != 409
            ),
            Self::Serialization(_) => false,
        }
    }

    /// Machine-readable reason for conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Binding(e) => e.reason(),
            Self::Kube(_) => "KubernetesError",
            Self::Serialization(_) => "SerializationFailed",
        }
    }
}
