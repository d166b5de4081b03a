use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobKind, State};
use crate::collaborators::ReviewReport;
use crate::error::FlowError;
use crate::scanner::ArchitectureMap;

/// Classification recorded alongside `error_message` when a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Job unknown, or a required input/accumulated field is missing.
    Input,
    /// An external dependency raised or returned a failure.
    Collaborator,
    /// The dependency ran but returned a negative verdict.
    Validation,
    /// A bounded operation exceeded its budget.
    Timeout,
    /// A diff could not be applied cleanly.
    ApplyConflict,
    /// An operator cancelled the job.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Input => write!(f, "InputError"),
            FailureKind::Collaborator => write!(f, "CollaboratorError"),
            FailureKind::Validation => write!(f, "ValidationFailure"),
            FailureKind::Timeout => write!(f, "Timeout"),
            FailureKind::ApplyConflict => write!(f, "ApplyConflict"),
            FailureKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Retry policy for re-delivering a stage whose handler failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of redeliveries before giving up.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1), saturating at `u64::MAX`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1));
        factor.map_or(u64::MAX, |f| self.base_delay_ms.saturating_mul(f))
    }
}

/// Immutable creation-time payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobInputs {
    Modify {
        #[serde(default)]
        user_id: String,
        #[serde(default)]
        project_id: String,
        #[serde(default)]
        prompt: String,
    },
    Transform {
        #[serde(default)]
        repo_url: String,
        #[serde(default)]
        prompt: String,
    },
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, FlowError> {
    if value.trim().is_empty() {
        Err(FlowError::MissingField(field))
    } else {
        Ok(value)
    }
}

impl JobInputs {
    pub fn modify(
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        JobInputs::Modify {
            user_id: user_id.into(),
            project_id: project_id.into(),
            prompt: prompt.into(),
        }
    }

    pub fn transform(repo_url: impl Into<String>, prompt: impl Into<String>) -> Self {
        JobInputs::Transform {
            repo_url: repo_url.into(),
            prompt: prompt.into(),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobInputs::Modify { .. } => JobKind::Modify,
            JobInputs::Transform { .. } => JobKind::Transform,
        }
    }

    /// Checks that every field the pipeline needs is present and non-blank.
    pub fn validate(&self) -> Result<(), FlowError> {
        match self {
            JobInputs::Modify { .. } => {
                self.user_id()?;
                self.project_id()?;
                self.prompt()?;
            }
            JobInputs::Transform { .. } => {
                self.repo_url()?;
                self.prompt()?;
            }
        }
        Ok(())
    }

    pub fn prompt(&self) -> Result<&str, FlowError> {
        match self {
            JobInputs::Modify { prompt, .. } | JobInputs::Transform { prompt, .. } => {
                required(prompt, "prompt")
            }
        }
    }

    pub fn user_id(&self) -> Result<&str, FlowError> {
        match self {
            JobInputs::Modify { user_id, .. } => required(user_id, "user_id"),
            JobInputs::Transform { .. } => Err(FlowError::MissingField("user_id")),
        }
    }

    pub fn project_id(&self) -> Result<&str, FlowError> {
        match self {
            JobInputs::Modify { project_id, .. } => required(project_id, "project_id"),
            JobInputs::Transform { .. } => Err(FlowError::MissingField("project_id")),
        }
    }

    pub fn repo_url(&self) -> Result<&str, FlowError> {
        match self {
            JobInputs::Transform { repo_url, .. } => required(repo_url, "repo_url"),
            JobInputs::Modify { .. } => Err(FlowError::MissingField("repo_url")),
        }
    }
}

/// Stage-produced fields. Each is written by exactly one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulated {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_feedback: Option<ReviewReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloned_repo_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture_map: Option<ArchitectureMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refactored_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
}

/// A partial update: `Some` fields overwrite, `None` fields are left alone.
pub type JobPatch = Accumulated;

macro_rules! merge_fields {
    ($dst:expr, $src:expr, $($field:ident),+) => {
        $(if let Some(v) = $src.$field { $dst.$field = Some(v); })+
    };
}

impl Accumulated {
    /// Merges `patch` in without ever clearing an existing field.
    pub fn merge(&mut self, patch: JobPatch) {
        merge_fields!(
            self,
            patch,
            context,
            diff_patch,
            review_feedback,
            cloned_repo_path,
            architecture_map,
            refactored_files,
            validation_log,
            pull_request_branch,
            pull_request_url
        );
    }

    pub fn context(&self) -> Result<&BTreeMap<String, String>, FlowError> {
        self.context.as_ref().ok_or(FlowError::MissingField("context"))
    }

    pub fn diff_patch(&self) -> Result<&str, FlowError> {
        self.diff_patch
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or(FlowError::MissingField("diff_patch"))
    }

    pub fn cloned_repo_path(&self) -> Result<&PathBuf, FlowError> {
        self.cloned_repo_path
            .as_ref()
            .ok_or(FlowError::MissingField("cloned_repo_path"))
    }

    pub fn architecture_map(&self) -> Result<&ArchitectureMap, FlowError> {
        self.architecture_map
            .as_ref()
            .ok_or(FlowError::MissingField("architecture_map"))
    }
}

/// One workflow instance; also the job-status read surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub state: State,
    pub inputs: JobInputs,
    #[serde(flatten)]
    pub accumulated: Accumulated,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub state_history: Vec<State>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(inputs: JobInputs, initial: State) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: inputs.kind(),
            state: initial,
            inputs,
            accumulated: Accumulated::default(),
            error_message: None,
            failure_kind: None,
            state_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records the move to `next`. Legality is checked by the caller.
    pub fn transition(&mut self, next: State) {
        self.state_history.push(self.state);
        self.state = next;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, err: &FlowError) {
        self.transition(State::Error);
        self.error_message = Some(err.to_string());
        self.failure_kind = Some(err.kind());
    }

    /// Every state the job has been in, current one last.
    pub fn states_seen(&self) -> Vec<State> {
        let mut seen = self.state_history.clone();
        seen.push(self.state);
        seen
    }
}
