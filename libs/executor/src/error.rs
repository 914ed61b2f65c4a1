use std::time::Duration;

use thiserror::Error;

use eno_api::{ResultEntry, ResultSeverity};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("Kubernetes reported error: {0}")]
    Kube(#[from] kube::Error),

    #[error("discovery failed for {gvk}: {source}")]
    Discovery { gvk: String, source: kube::Error },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("invalid synthesizer: {0}")]
    InvalidSynthesizer(String),

    #[error("invalid composition: {0}")]
    InvalidComposition(String),

    #[error("no binding for ref key {key}")]
    MissingBinding { key: String },

    #[error("input {key} ({name}) does not exist")]
    MissingInput { key: String, name: String },

    #[error("synthesizer timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("synthesizer exited with code {code}")]
    UserProcess { code: i32, stderr: String },

    #[error("synthesizer wrote an invalid ResourceList: {source}")]
    InvalidOutput { source: serde_json::Error },

    #[error("synthesizer reported an error result")]
    SynthesizerError,

    #[error("gave up writing synthesis status after repeated conflicts")]
    StatusConflict,
}

impl Error {
    /// Terminal errors are the synthesizer's own doing and are recorded on
    /// the attempt; everything else (missing inputs, API hiccups) makes the
    /// pod fail without a result so the attempt is retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::UserProcess { .. }
                | Error::InvalidOutput { .. }
                | Error::Timeout { .. }
                | Error::InvalidSynthesizer(_)
                | Error::SynthesizerError
        )
    }

    /// Diagnostic entries recorded on the attempt for terminal errors.
    pub fn result_entries(&self) -> Vec<ResultEntry> {
        let message = match self {
            Error::UserProcess { code, stderr } if !stderr.is_empty() => {
                format!("synthesizer exited with code {code}: {stderr}")
            }
            other => other.to_string(),
        };
        vec![ResultEntry {
            message,
            severity: ResultSeverity::Error,
        }]
    }
}
