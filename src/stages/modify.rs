use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::ModelSettings;
use crate::collaborators::{
    ChatMessage, CompletionRequest, ContextCollector, PatchApplier, PromptEnrichment,
    ResponseFormat, ReviewAgent, TextCompletion, strip_code_fences,
};
use crate::error::FlowError;
use crate::orchestrator::{StageContext, StageExecutor};
use crate::state_machine::{Job, JobPatch, Stage};

/// Replies starting with this are the model refusing or failing.
const ERROR_SENTINEL: &str = "Error:";

const PATCH_SYSTEM_PROMPT: &str = "You are a senior software engineer editing an existing \
project. Answer with a single unified diff and nothing else: no prose, no markdown fences. \
Every file section starts with `--- a/<path>` and `+++ b/<path>` headers (use /dev/null for \
created or deleted files), paths are relative to the project root, and every hunk header \
carries correct line counts. Only touch files that need to change.";

pub struct BuildContext {
    collector: Arc<dyn ContextCollector>,
}

impl BuildContext {
    pub fn new(collector: Arc<dyn ContextCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl StageExecutor for BuildContext {
    fn stage(&self) -> Stage {
        Stage::BuildContext
    }

    async fn execute(&self, job: &Job, _ctx: &StageContext) -> Result<JobPatch, FlowError> {
        let user_id = job.inputs.user_id()?;
        let project_id = job.inputs.project_id()?;
        let prompt = job.inputs.prompt()?;

        let context = self.collector.build(user_id, project_id, prompt).await?;
        info!(job_id = %job.id, files = context.len(), "context collected");
        Ok(JobPatch {
            context: Some(context),
            ..Default::default()
        })
    }
}

fn render_context(context: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (path, content) in context {
        out.push_str(&format!("--- {path} ---\n{content}"));
        if !content.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// Asks the model for a unified diff implementing the prompt.
pub struct GeneratePatch {
    enricher: Arc<dyn PromptEnrichment>,
    completion: Arc<dyn TextCompletion>,
    model: ModelSettings,
}

impl GeneratePatch {
    pub fn new(
        enricher: Arc<dyn PromptEnrichment>,
        completion: Arc<dyn TextCompletion>,
        model: ModelSettings,
    ) -> Self {
        Self {
            enricher,
            completion,
            model,
        }
    }
}

#[async_trait]
impl StageExecutor for GeneratePatch {
    fn stage(&self) -> Stage {
        Stage::GeneratePatch
    }

    async fn execute(&self, job: &Job, _ctx: &StageContext) -> Result<JobPatch, FlowError> {
        let prompt = job.inputs.prompt()?;
        let context = job.accumulated.context()?;
        if context.is_empty() {
            return Err(FlowError::InvalidInput(
                "Invalid or empty context provided.".into(),
            ));
        }

        let enriched = self.enricher.enrich(prompt);
        let message = format!(
            "Request:\n{enriched}\n\nProject files:\n\n{}",
            render_context(context)
        );
        debug!(job_id = %job.id, chars = message.len(), "requesting patch");

        let reply = self
            .completion
            .complete(CompletionRequest {
                model: self.model.model.clone(),
                max_tokens: self.model.max_tokens,
                system: Some(PATCH_SYSTEM_PROMPT.to_string()),
                messages: vec![ChatMessage::user(message)],
                format: ResponseFormat::Text,
            })
            .await?
            .into_text();

        let mut diff = strip_code_fences(&reply);
        if diff.trim().is_empty() {
            return Err(FlowError::Collaborator(
                "Model returned an empty patch".into(),
            ));
        }
        if diff.starts_with(ERROR_SENTINEL) {
            warn!(job_id = %job.id, "model reported an error instead of a patch");
            return Err(FlowError::Collaborator(diff.trim().to_string()));
        }
        if !diff.ends_with('\n') {
            diff.push('\n');
        }

        info!(job_id = %job.id, bytes = diff.len(), "patch generated");
        Ok(JobPatch {
            diff_patch: Some(diff),
            ..Default::default()
        })
    }
}

pub struct ReviewPatch {
    reviewer: Arc<dyn ReviewAgent>,
}

impl ReviewPatch {
    pub fn new(reviewer: Arc<dyn ReviewAgent>) -> Self {
        Self { reviewer }
    }
}

#[async_trait]
impl StageExecutor for ReviewPatch {
    fn stage(&self) -> Stage {
        Stage::ReviewPatch
    }

    async fn execute(&self, job: &Job, _ctx: &StageContext) -> Result<JobPatch, FlowError> {
        let user_id = job.inputs.user_id()?;
        let project_id = job.inputs.project_id()?;
        let diff = job.accumulated.diff_patch()?;

        let report = self.reviewer.review(user_id, project_id, diff).await?;
        info!(
            job_id = %job.id,
            success = report.success,
            warnings = report.warnings.len(),
            issues = report.issues.len(),
            "review finished, awaiting approval"
        );
        Ok(JobPatch {
            review_feedback: Some(report),
            ..Default::default()
        })
    }
}

/// The gated stage: writes the reviewed diff into the live project.
pub struct ApplyPatch {
    applier: Arc<dyn PatchApplier>,
}

impl ApplyPatch {
    pub fn new(applier: Arc<dyn PatchApplier>) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl StageExecutor for ApplyPatch {
    fn stage(&self) -> Stage {
        Stage::ApplyPatch
    }

    async fn execute(&self, job: &Job, _ctx: &StageContext) -> Result<JobPatch, FlowError> {
        let user_id = job.inputs.user_id()?;
        let project_id = job.inputs.project_id()?;
        let diff = job.accumulated.diff_patch()?;

        let report = self.applier.apply(user_id, project_id, diff).await?;
        if !report.success {
            return Err(FlowError::ApplyConflict(
                report.error.unwrap_or_else(|| "patch was rejected".into()),
            ));
        }
        info!(job_id = %job.id, "patch applied");
        Ok(JobPatch::default())
    }
}
