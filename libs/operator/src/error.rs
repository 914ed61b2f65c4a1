use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the reconcilers. Retries are never performed inline;
/// returning an error hands the key back to the work queue, which re-enqueues
/// with exponential backoff.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    #[error("serialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    /// Object named by a spec field does not exist yet. The watch on that
    /// kind re-triggers the reconcile once it appears.
    #[error("missing {kind} {name}")]
    MissingObject { kind: &'static str, name: String },

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("invalid trace ID")]
    InvalidTraceId,
}

impl Error {
    /// Low-cardinality label for failure counters.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError { source: kube::Error::Api(ae) } => format!("api_{}", ae.code),
            Error::KubeError { .. } => "kube".to_string(),
            Error::SerializationError { .. } => "serialization".to_string(),
            Error::MissingObject { kind, .. } => format!("missing_{}", kind.to_lowercase()),
            Error::InvalidResource(_) => "invalid_resource".to_string(),
            Error::InvalidTraceId => "invalid_trace_id".to_string(),
        }
    }

    /// Conflicts are expected under compare-and-set; callers requeue soon
    /// instead of counting a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError { source: kube::Error::Api(ae) } if ae.code == 409)
    }
}
