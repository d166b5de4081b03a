use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use patchwright::cli::{Cli, Command};
use patchwright::config::PatchwrightConfig;
use patchwright::queue::{LocalQueue, WorkerPool};
use patchwright::state_machine::{Job, JobInputs, Pipeline, State};
use patchwright::store::FileStore;
use patchwright::ui::{JobProgress, print_job};
use patchwright::workflows::{Collaborators, Workflows};

const FOLLOW_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = PatchwrightConfig::load().context("failed to load patchwright.toml")?;
    if let Some(model) = cli.model {
        config.model = model.api_name().to_string();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }
    if let Some(dir) = cli.store_dir {
        config.store_dir = dir;
    }

    let store = Arc::new(
        FileStore::open(&config.store_dir)
            .with_context(|| format!("failed to open job store {}", config.store_dir.display()))?,
    );
    let (queue, deliveries) = LocalQueue::channel();
    let collaborators = Collaborators::from_config(&config)?;
    let workflows = Arc::new(Workflows::build(
        store,
        Arc::new(queue),
        collaborators,
        &config,
    )?);
    WorkerPool::spawn(deliveries, workflows.clone(), config.workers, config.retry());

    let job = match cli.command {
        Command::Modify {
            user,
            project,
            prompt,
        } => {
            let id = workflows
                .start_workflow(JobInputs::modify(user, project, prompt))
                .await?;
            info!(job_id = %id, "modify job started");
            follow(&workflows, &id, "modify").await?
        }
        Command::Transform { repo_url, prompt } => {
            let id = workflows
                .start_workflow(JobInputs::transform(repo_url, prompt))
                .await?;
            info!(job_id = %id, "transform job started");
            follow(&workflows, &id, "transform").await?
        }
        Command::Status { job_id } => {
            let job = workflows.get_job_status(&job_id).await?;
            print_job(&job);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Apply { job_id } => {
            let progress = JobProgress::start("applying patch");
            progress.update_state(State::ApplyingPatch);
            let job = workflows.approve(&job_id).await?;
            progress.complete(&job);
            job
        }
        Command::Cancel { job_id, reason } => {
            let job = workflows.cancel(&job_id, &reason).await?;
            print_job(&job);
            return Ok(ExitCode::SUCCESS);
        }
    };

    Ok(if job.state == State::Error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Shows the job's state on a spinner until it is terminal or at the gate.
async fn follow(workflows: &Workflows, job_id: &str, description: &str) -> Result<Job> {
    let progress = JobProgress::start(description);
    loop {
        let job = workflows.get_job_status(job_id).await?;
        if Pipeline::for_kind(job.kind).is_settled(job.state) {
            progress.complete(&job);
            return Ok(job);
        }
        progress.update_state(job.state);
        tokio::time::sleep(FOLLOW_POLL).await;
    }
}
