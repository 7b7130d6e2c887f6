use thiserror::Error;

/// Named error kinds surfaced by the core, per the error handling design.
///
/// Every `ProtocolCommands` function returns `Result<T, CoreError>`. The CLI
/// boundary wraps these in `anyhow::Error` for human-facing messages; library
/// callers match on the variant, not on a formatted string.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("state transition denied: {from} -> {to}")]
    StateTransitionDenied { from: String, to: String },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("lock timeout acquiring {path}")]
    LockTimeout { path: String },

    #[error("bubble not found: {0}")]
    BubbleNotFound(String),

    #[error("workspace resolution failed: {0}")]
    WorkspaceResolution(String),

    #[error("convergence denied: {0}")]
    ConvergenceDenied(Vec<String>),

    #[error("external failure ({collaborator}): {message}")]
    ExternalFailure {
        collaborator: String,
        message: String,
    },

    #[error("transcript continuity violation: {0}")]
    TranscriptContinuityViolation(String),

    #[error(
        "state write failed after transcript append ({0}); transcript is canonical, recover state from transcript tail"
    )]
    PostAppendStateDivergence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn schema(msg: impl Into<String>) -> Self {
        CoreError::SchemaValidation(msg.into())
    }

    /// Stable, lower_snake_case name for metrics/CLI surfacing, independent
    /// of the Display message (which may embed dynamic detail).
    pub fn kind_name(&self) -> &'static str {
        match self {
            CoreError::SchemaValidation(_) => "schema_validation",
            CoreError::StateTransitionDenied { .. } => "state_transition_denied",
            CoreError::StateConflict(_) => "state_conflict",
            CoreError::LockTimeout { .. } => "lock_timeout",
            CoreError::BubbleNotFound(_) => "bubble_not_found",
            CoreError::WorkspaceResolution(_) => "workspace_resolution",
            CoreError::ConvergenceDenied(_) => "convergence_denied",
            CoreError::ExternalFailure { .. } => "external_failure",
            CoreError::TranscriptContinuityViolation(_) => "transcript_continuity_violation",
            CoreError::PostAppendStateDivergence(_) => "post_append_state_divergence",
            CoreError::Io(_) => "io",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
