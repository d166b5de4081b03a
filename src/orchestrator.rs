use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::error::FlowError;
use crate::queue::{StageHandler, TaskQueue};
use crate::state_machine::{Job, JobInputs, JobPatch, Pipeline, Stage, State};
use crate::store::JobStore;

const SETTLE_POLL: Duration = Duration::from_millis(25);

/// One pipeline step. Executors read the job, talk to their collaborators and
/// return the fields they produced; the orchestrator decides the transition
/// and what runs next.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(&self, job: &Job, ctx: &StageContext) -> Result<JobPatch, FlowError>;
}

/// Handle given to a running executor for recording intermediate progress.
#[derive(Clone)]
pub struct StageContext {
    job_id: String,
    pipeline: &'static Pipeline,
    store: Arc<dyn JobStore>,
}

impl StageContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Moves the job forward to an intermediate `state` before the stage has
    /// finished, merging `patch`.
    pub async fn checkpoint(&self, state: State, patch: JobPatch) -> Result<Job, FlowError> {
        let job = transition(self.store.as_ref(), self.pipeline, &self.job_id, state, patch).await?;
        info!(job_id = %self.job_id, %state, "checkpoint recorded");
        Ok(job)
    }
}

async fn transition(
    store: &dyn JobStore,
    pipeline: &'static Pipeline,
    job_id: &str,
    new_state: State,
    patch: JobPatch,
) -> Result<Job, FlowError> {
    store
        .update(
            job_id,
            Box::new(move |job: &mut Job| {
                if !pipeline.is_legal(job.state, new_state) {
                    return Err(FlowError::IllegalTransition {
                        job_id: job.id.clone(),
                        from: job.state,
                        to: new_state,
                    });
                }
                job.accumulated.merge(patch);
                job.transition(new_state);
                Ok(())
            }),
        )
        .await
}

/// What a single stage delivery ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageRun {
    Completed(State),
    Failed(String),
    /// Nothing was done: stale or duplicate delivery.
    Skipped(String),
}

/// Removes the job from the in-flight set when the stage run ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    job_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.job_id);
        }
    }
}

/// Drives jobs of one pipeline through its state table and stage graph.
pub struct Orchestrator {
    pipeline: &'static Pipeline,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(
        pipeline: &'static Pipeline,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            pipeline,
            store,
            queue,
            executors: HashMap::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Registers the executor for one of the pipeline's stages.
    pub fn with_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(executor.stage(), executor);
        self
    }

    pub fn pipeline(&self) -> &'static Pipeline {
        self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Creates a job in the pipeline's entry state, dispatches its first
    /// stage and returns the job id without waiting for any stage.
    pub async fn start_workflow(&self, inputs: JobInputs) -> Result<String, FlowError> {
        inputs.validate()?;
        if inputs.kind() != self.pipeline.kind {
            return Err(FlowError::InvalidInput(format!(
                "{} inputs given to the {} pipeline",
                inputs.kind(),
                self.pipeline.kind
            )));
        }
        let first = self
            .pipeline
            .stage_for_state(self.pipeline.entry)
            .ok_or_else(|| {
                FlowError::Config(format!(
                    "{} pipeline has no stage for its entry state",
                    self.pipeline.kind
                ))
            })?;

        let mut job = Job::new(inputs, self.pipeline.initial);
        if self.pipeline.entry != self.pipeline.initial {
            job.transition(self.pipeline.entry);
        }
        let job_id = job.id.clone();
        self.store.insert(job).await?;
        info!(job_id = %job_id, kind = %self.pipeline.kind, "workflow started");

        if let Err(e) = self.queue.dispatch(first.stage, &job_id).await {
            error!(job_id = %job_id, stage = %first.stage, "failed to dispatch first stage: {e}");
            self.fail_job(&job_id, &e).await?;
            return Err(e);
        }
        Ok(job_id)
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<Job, FlowError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| FlowError::JobNotFound(job_id.to_string()))
    }

    /// Merges `patch` into the job and moves it to `new_state`.
    ///
    /// Unknown jobs and moves the state table forbids are logged and rejected
    /// without touching the record.
    pub async fn update_job_state(
        &self,
        job_id: &str,
        new_state: State,
        patch: JobPatch,
    ) -> Result<Job, FlowError> {
        match transition(self.store.as_ref(), self.pipeline, job_id, new_state, patch).await {
            Ok(job) => {
                info!(job_id, state = %new_state, "job state updated");
                Ok(job)
            }
            Err(e) => {
                warn!(job_id, state = %new_state, "job state update rejected: {e}");
                Err(e)
            }
        }
    }

    async fn fail_job(&self, job_id: &str, err: &FlowError) -> Result<Job, FlowError> {
        let job = self
            .store
            .update(
                job_id,
                Box::new(|job: &mut Job| {
                    if job.state.is_terminal() {
                        return Err(FlowError::IllegalTransition {
                            job_id: job.id.clone(),
                            from: job.state,
                            to: State::Error,
                        });
                    }
                    job.fail(err);
                    Ok(())
                }),
            )
            .await?;
        error!(job_id, kind = %err.kind(), "job failed: {err}");
        Ok(job)
    }

    fn enter_in_flight(&self, job_id: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(job_id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            job_id: job_id.to_string(),
        })
    }

    /// Runs one delivery of `stage` for `job_id`.
    ///
    /// The job must be in the stage's pre-state; anything else is treated as a
    /// duplicate or stale delivery and skipped, as is a run whose checkpoint
    /// was refused. Other executor failures become a single ERROR transition. `Err` is only returned when the store itself
    /// could not be reached.
    pub async fn run_stage(&self, stage: Stage, job_id: &str) -> Result<StageRun, FlowError> {
        let def = self.pipeline.stage_def(stage).ok_or_else(|| {
            FlowError::InvalidInput(format!(
                "stage {stage} is not part of the {} pipeline",
                self.pipeline.kind
            ))
        })?;

        let Some(job) = self.store.get(job_id).await? else {
            warn!(job_id, %stage, "stage delivered for unknown job");
            return Ok(StageRun::Skipped(format!("job {job_id} not found")));
        };
        if job.state != def.pre_state {
            warn!(
                job_id,
                %stage,
                state = %job.state,
                expected = %def.pre_state,
                "duplicate or stale delivery, skipping"
            );
            return Ok(StageRun::Skipped(format!(
                "job is in {}, expected {}",
                job.state, def.pre_state
            )));
        }
        let Some(_in_flight) = self.enter_in_flight(job_id) else {
            warn!(job_id, %stage, "job already has a stage in flight, skipping");
            return Ok(StageRun::Skipped("stage already in flight".into()));
        };

        let job = match def.running {
            Some(running) => {
                let pre_state = def.pre_state;
                let claimed = self
                    .store
                    .update(
                        job_id,
                        Box::new(move |job: &mut Job| {
                            if job.state != pre_state {
                                return Err(FlowError::IllegalTransition {
                                    job_id: job.id.clone(),
                                    from: job.state,
                                    to: running,
                                });
                            }
                            job.transition(running);
                            Ok(())
                        }),
                    )
                    .await;
                match claimed {
                    Ok(job) => job,
                    Err(FlowError::IllegalTransition { from, .. }) => {
                        warn!(job_id, %stage, state = %from, "lost claim race, skipping");
                        return Ok(StageRun::Skipped(format!("job moved to {from}")));
                    }
                    Err(e) => return Err(e),
                }
            }
            None => job,
        };

        let Some(executor) = self.executors.get(&stage).cloned() else {
            let err = FlowError::Config(format!("no executor registered for stage {stage}"));
            self.fail_job(job_id, &err).await?;
            return Ok(StageRun::Failed(err.to_string()));
        };

        info!(job_id, %stage, "stage started");
        let ctx = StageContext {
            job_id: job_id.to_string(),
            pipeline: self.pipeline,
            store: self.store.clone(),
        };
        let outcome = tokio::spawn(async move { executor.execute(&job, &ctx).await })
            .await
            .unwrap_or_else(|join| {
                Err(FlowError::Collaborator(format!(
                    "stage {stage} aborted: {join}"
                )))
            });

        match outcome {
            Ok(patch) => {
                let job = match self.update_job_state(job_id, def.on_success, patch).await {
                    Ok(job) => job,
                    Err(FlowError::IllegalTransition { from, .. }) => {
                        return Ok(StageRun::Skipped(format!(
                            "completion discarded, job is in {from}"
                        )));
                    }
                    Err(e) => return Err(e),
                };
                info!(job_id, %stage, state = %job.state, "stage completed");
                if let Some(next) = def.next
                    && let Err(e) = self.queue.dispatch(next, job_id).await
                {
                    error!(job_id, stage = %next, "failed to dispatch next stage: {e}");
                    self.fail_job(job_id, &e).await?;
                    return Ok(StageRun::Failed(e.to_string()));
                }
                Ok(StageRun::Completed(job.state))
            }
            // Another delivery got to a checkpoint first; the job is healthy.
            Err(FlowError::IllegalTransition { from, .. }) => {
                warn!(job_id, %stage, state = %from, "checkpoint rejected, skipping");
                Ok(StageRun::Skipped(format!("checkpoint rejected, job is in {from}")))
            }
            Err(err) => match self.fail_job(job_id, &err).await {
                Ok(_) => Ok(StageRun::Failed(err.to_string())),
                Err(FlowError::IllegalTransition { from, .. }) => Ok(StageRun::Skipped(format!(
                    "failure discarded, job is in {from}"
                ))),
                Err(e) => Err(e),
            },
        }
    }

    /// Runs the pipeline's gated stage for a job parked at the gate.
    ///
    /// Rejects without mutating the job when it is anywhere else, including a
    /// job the gated stage already finished.
    pub async fn approve(&self, job_id: &str) -> Result<Job, FlowError> {
        let gate = self.pipeline.gate().ok_or_else(|| {
            FlowError::InvalidInput(format!(
                "the {} pipeline has no approval gate",
                self.pipeline.kind
            ))
        })?;
        let job = self.get_job_status(job_id).await?;
        if job.state != gate.pre_state {
            warn!(job_id, state = %job.state, "approval rejected");
            return Err(FlowError::NotAwaitingApproval {
                job_id: job_id.to_string(),
                state: job.state,
            });
        }
        info!(job_id, stage = %gate.stage, "approval received");
        if let StageRun::Skipped(_) = self.run_stage(gate.stage, job_id).await? {
            let job = self.get_job_status(job_id).await?;
            return Err(FlowError::NotAwaitingApproval {
                job_id: job_id.to_string(),
                state: job.state,
            });
        }
        self.get_job_status(job_id).await
    }

    /// Moves a non-terminal job to ERROR. A stage already running finishes,
    /// but its result is discarded and nothing else is dispatched.
    pub async fn cancel(&self, job_id: &str, reason: &str) -> Result<Job, FlowError> {
        self.fail_job(job_id, &FlowError::Cancelled(reason.to_string()))
            .await
    }

    /// Polls until the job is terminal or parked at the approval gate.
    pub async fn wait_until_settled(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Job, FlowError> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.get_job_status(job_id).await?;
            if self.pipeline.is_settled(job.state) {
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(FlowError::Timeout(format!(
                    "job {job_id} still in {} after {}s",
                    job.state,
                    timeout.as_secs()
                )));
            }
            sleep(SETTLE_POLL).await;
        }
    }
}

#[async_trait]
impl StageHandler for Orchestrator {
    async fn handle(&self, stage: Stage, job_id: &str) -> Result<(), FlowError> {
        self.run_stage(stage, job_id).await.map(|_| ())
    }
}
