//! Contracts for the external systems the stage executors depend on.
//!
//! Every trait here is object safe so executors can hold `Arc<dyn _>` and
//! tests can swap in doubles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Gathers the project files relevant to a prompt, keyed by relative path.
#[async_trait]
pub trait ContextCollector: Send + Sync {
    async fn build(
        &self,
        user_id: &str,
        project_id: &str,
        prompt: &str,
    ) -> Result<BTreeMap<String, String>, FlowError>;
}

pub trait PromptEnrichment: Send + Sync {
    fn enrich(&self, prompt: &str) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// The reply must be a single JSON object.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub format: ResponseFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    Json(serde_json::Value),
}

impl Completion {
    pub fn into_text(self) -> String {
        match self {
            Completion::Text(text) => text,
            Completion::Json(value) => value.to_string(),
        }
    }
}

#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, FlowError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub message: String,
}

/// Lint and test findings for a proposed diff.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReviewReport {
    pub success: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait ReviewAgent: Send + Sync {
    async fn review(
        &self,
        user_id: &str,
        project_id: &str,
        diff: &str,
    ) -> Result<ReviewReport, FlowError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApplyReport {
    pub fn applied() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Applies a unified diff atomically: every hunk lands or none does.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    async fn apply(
        &self,
        user_id: &str,
        project_id: &str,
        diff: &str,
    ) -> Result<ApplyReport, FlowError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub repo_url: String,
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait SourceHosting: Send + Sync {
    /// Clones `url` into a fresh scratch directory and returns its path.
    async fn clone_repo(&self, url: &str) -> Result<PathBuf, FlowError>;

    /// Creates `branch`, stages every change, commits and pushes to origin.
    async fn commit_and_push(
        &self,
        checkout: &Path,
        branch: &str,
        message: &str,
    ) -> Result<(), FlowError>;

    /// Opens a pull request and returns its URL.
    async fn open_pull_request(&self, request: &PullRequest) -> Result<String, FlowError>;
}

/// Removes a surrounding markdown code fence (with or without a language tag)
/// from a model reply.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    format!("{}\n", body.trim_end_matches('\n'))
}
