//! Wires both pipelines to their executors and routes work between them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::anthropic::AnthropicClient;
use crate::collaborators::{
    ContextCollector, PatchApplier, PromptEnrichment, ReviewAgent, SourceHosting, TextCompletion,
};
use crate::config::PatchwrightConfig;
use crate::diff::{DiffReviewer, WorkspacePatchApplier};
use crate::error::FlowError;
use crate::git::GitHubHosting;
use crate::orchestrator::Orchestrator;
use crate::queue::{StageHandler, TaskQueue};
use crate::stages::{
    ApplyPatch, BuildContext, CloneAndScan, CreatePr, GeneratePatch, Refactor, ReviewPatch,
    Validate,
};
use crate::state_machine::{Job, JobInputs, JobKind, MODIFY, Stage, TRANSFORM};
use crate::store::JobStore;
use crate::workspace::{GuidelineEnricher, ProjectPaths, WorkspaceContextCollector};

/// Everything the stage executors talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub context: Arc<dyn ContextCollector>,
    pub enrichment: Arc<dyn PromptEnrichment>,
    pub completion: Arc<dyn TextCompletion>,
    pub reviewer: Arc<dyn ReviewAgent>,
    pub applier: Arc<dyn PatchApplier>,
    pub hosting: Arc<dyn SourceHosting>,
}

impl Collaborators {
    /// The production set: local project workspaces, Anthropic and GitHub.
    pub fn from_config(config: &PatchwrightConfig) -> Result<Self, FlowError> {
        if config.api_key.is_empty() {
            warn!("no Anthropic API key configured, completion calls will fail");
        }
        let paths = ProjectPaths::new(&config.projects_root);
        let mut reviewer = DiffReviewer::new(paths.clone());
        if let Some(command) = &config.review_test_command {
            reviewer = reviewer.with_tests(command.clone(), config.review_timeout());
        }
        let hosting = GitHubHosting::new(&config.scratch_root, config.github_token())?
            .with_api_url(&config.github_api_url);

        Ok(Self {
            context: Arc::new(WorkspaceContextCollector::new(paths.clone())),
            enrichment: Arc::new(GuidelineEnricher::default()),
            completion: Arc::new(
                AnthropicClient::new(config.api_key.clone())?.with_retry(config.retry()),
            ),
            reviewer: Arc::new(reviewer),
            applier: Arc::new(WorkspacePatchApplier::new(paths)),
            hosting: Arc::new(hosting),
        })
    }
}

/// The MODIFY and TRANSFORM orchestrators behind one surface.
pub struct Workflows {
    modify: Arc<Orchestrator>,
    transform: Arc<Orchestrator>,
}

impl Workflows {
    pub fn new(modify: Orchestrator, transform: Orchestrator) -> Result<Self, FlowError> {
        if modify.pipeline().kind != JobKind::Modify
            || transform.pipeline().kind != JobKind::Transform
        {
            return Err(FlowError::Config(
                "orchestrators given in the wrong order".into(),
            ));
        }
        Ok(Self {
            modify: Arc::new(modify),
            transform: Arc::new(transform),
        })
    }

    /// Registers every stage executor on a shared store and queue.
    pub fn build(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        collaborators: Collaborators,
        config: &PatchwrightConfig,
    ) -> Result<Self, FlowError> {
        let model = config.model_settings();
        let modify = Orchestrator::new(&MODIFY, store.clone(), queue.clone())
            .with_executor(Arc::new(BuildContext::new(collaborators.context)))
            .with_executor(Arc::new(GeneratePatch::new(
                collaborators.enrichment,
                collaborators.completion.clone(),
                model.clone(),
            )))
            .with_executor(Arc::new(ReviewPatch::new(collaborators.reviewer)))
            .with_executor(Arc::new(ApplyPatch::new(collaborators.applier)));
        let transform = Orchestrator::new(&TRANSFORM, store, queue)
            .with_executor(Arc::new(CloneAndScan::new(collaborators.hosting.clone())))
            .with_executor(Arc::new(Refactor::new(
                collaborators.completion,
                model,
                config.refactor_file_limit,
            )))
            .with_executor(Arc::new(Validate::new(
                config.test_command.clone(),
                config.validate_timeout(),
            )))
            .with_executor(Arc::new(CreatePr::new(
                collaborators.hosting,
                config.base_branch.clone(),
                config.branch_prefix.clone(),
            )));
        Self::new(modify, transform)
    }

    pub fn orchestrator(&self, kind: JobKind) -> &Arc<Orchestrator> {
        match kind {
            JobKind::Modify => &self.modify,
            JobKind::Transform => &self.transform,
        }
    }

    pub async fn start_workflow(&self, inputs: JobInputs) -> Result<String, FlowError> {
        self.orchestrator(inputs.kind()).start_workflow(inputs).await
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<Job, FlowError> {
        match self.modify.get_job_status(job_id).await {
            Err(FlowError::JobNotFound(_)) => self.transform.get_job_status(job_id).await,
            found => found,
        }
    }

    pub async fn approve(&self, job_id: &str) -> Result<Job, FlowError> {
        let job = self.get_job_status(job_id).await?;
        self.orchestrator(job.kind).approve(job_id).await
    }

    pub async fn cancel(&self, job_id: &str, reason: &str) -> Result<Job, FlowError> {
        let job = self.get_job_status(job_id).await?;
        self.orchestrator(job.kind).cancel(job_id, reason).await
    }

    pub async fn wait_until_settled(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Job, FlowError> {
        let job = self.get_job_status(job_id).await?;
        self.orchestrator(job.kind)
            .wait_until_settled(job_id, timeout)
            .await
    }
}

#[async_trait]
impl StageHandler for Workflows {
    async fn handle(&self, stage: Stage, job_id: &str) -> Result<(), FlowError> {
        self.orchestrator(stage.kind()).handle(stage, job_id).await
    }
}
