use std::fmt::Display;

use thiserror::Error;

use crate::state::Stage;

/// Errors that cross the pipeline boundary. Everything a stage produces is
/// folded into one of these before the controller decides what to do with it.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Bad input. Never retried, and raised before any mutating stage runs.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// An external privileged tool failed while a stage was running.
    #[error("stage {stage} failed")]
    ToolInvocation {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    /// Persisted pipeline state no longer matches the observed system.
    /// Requires `archstrap reset` before another attempt.
    #[error("persisted state does not match this system: {0}")]
    StateInconsistency(String),

    /// An external abort was requested; teardown has already run.
    #[error("installation cancelled")]
    Cancelled,
}

impl InstallError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}

/// A non-fatal failure during best-effort teardown. Logged, never propagated,
/// and never changes the recorded outcome of earlier stages.
#[derive(Debug)]
pub struct TeardownWarning {
    pub what: String,
    pub detail: String,
}

impl TeardownWarning {
    pub fn new(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            detail: detail.into(),
        }
    }
}

impl Display for TeardownWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "teardown of {}: {}", self.what, self.detail)
    }
}
