use thiserror::Error;

use crate::state_machine::{FailureKind, State};

pub use crate::anthropic::AnthropicError;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: String,
        from: State,
        to: State,
    },

    #[error("Job {job_id} is in state {state}, not awaiting approval")]
    NotAwaitingApproval { job_id: String, state: State },

    #[error("{0}")]
    Collaborator(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    ApplyConflict(String),

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FlowError {
    /// Classifies the error for the job record.
    pub fn kind(&self) -> FailureKind {
        match self {
            FlowError::JobNotFound(_)
            | FlowError::DuplicateJob(_)
            | FlowError::MissingField(_)
            | FlowError::InvalidInput(_)
            | FlowError::IllegalTransition { .. }
            | FlowError::NotAwaitingApproval { .. }
            | FlowError::Config(_) => FailureKind::Input,
            FlowError::Validation(_) => FailureKind::Validation,
            FlowError::Timeout(_) => FailureKind::Timeout,
            FlowError::ApplyConflict(_) => FailureKind::ApplyConflict,
            FlowError::Cancelled(_) => FailureKind::Cancelled,
            FlowError::Collaborator(_)
            | FlowError::Store(_)
            | FlowError::Anthropic(_)
            | FlowError::Git(_)
            | FlowError::Http(_)
            | FlowError::Io(_)
            | FlowError::Json(_)
            | FlowError::Toml(_) => FailureKind::Collaborator,
        }
    }

    /// Wraps any displayable failure from an external dependency.
    pub fn collaborator(context: &str, err: impl std::fmt::Display) -> Self {
        FlowError::Collaborator(format!("{context}: {err}"))
    }
}
