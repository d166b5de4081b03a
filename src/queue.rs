//! Task dispatch: the seam between the orchestrator and whatever runs stages.
//!
//! [`LocalQueue`] plus [`WorkerPool`] run stages on the tokio runtime of the
//! current process. A distributed broker only needs to implement [`TaskQueue`]
//! on the producing side and call a [`StageHandler`] on the consuming side.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::FlowError;
use crate::state_machine::{RetryConfig, Stage};

/// Fire-and-forget dispatch of a stage for a job. Delivery is at-least-once.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn dispatch(&self, stage: Stage, job_id: &str) -> Result<(), FlowError>;
}

/// Consumer side: executes one delivered stage.
///
/// Job-logic failures are recorded on the job and reported as `Ok`. An `Err`
/// means the delivery itself failed (e.g. the store was unreachable) and is
/// worth redelivering.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, stage: Stage, job_id: &str) -> Result<(), FlowError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stage: Stage,
    pub job_id: String,
}

pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// In-process queue backed by an unbounded channel.
#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl LocalQueue {
    pub fn channel() -> (Self, DeliveryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn dispatch(&self, stage: Stage, job_id: &str) -> Result<(), FlowError> {
        debug!(%stage, job_id, "dispatching stage");
        self.tx
            .send(Delivery {
                stage,
                job_id: job_id.to_string(),
            })
            .map_err(|_| FlowError::Store("task queue is closed".into()))
    }
}

/// Pulls deliveries off a [`LocalQueue`] and runs them with bounded concurrency.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawns the dispatcher loop. It ends once every `LocalQueue` sender is
    /// dropped and all in-flight deliveries have finished.
    pub fn spawn(
        mut rx: DeliveryReceiver,
        handler: Arc<dyn StageHandler>,
        workers: usize,
        retry: RetryConfig,
    ) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        tokio::spawn(async move {
            let mut running = Vec::new();
            while let Some(delivery) = rx.recv().await {
                let permit = match permits.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let handler = handler.clone();
                let retry = retry.clone();
                running.push(tokio::spawn(async move {
                    deliver(handler.as_ref(), &delivery, &retry).await;
                    drop(permit);
                }));
                running.retain(|h: &JoinHandle<()>| !h.is_finished());
            }
            for handle in running {
                let _ = handle.await;
            }
        })
    }
}

async fn deliver(handler: &dyn StageHandler, delivery: &Delivery, retry: &RetryConfig) {
    let mut attempt = 0;
    loop {
        match handler.handle(delivery.stage, &delivery.job_id).await {
            Ok(()) => return,
            Err(e) if attempt < retry.max_retries => {
                attempt += 1;
                let delay_ms = retry.delay_for_attempt(attempt);
                warn!(
                    stage = %delivery.stage,
                    job_id = %delivery.job_id,
                    attempt,
                    max = retry.max_retries,
                    delay_ms,
                    "stage delivery failed, retrying: {e}"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => {
                error!(
                    stage = %delivery.stage,
                    job_id = %delivery.job_id,
                    "stage delivery failed after {attempt} retries: {e}"
                );
                return;
            }
        }
    }
}

/// Queue that only records dispatches. Lets callers step a pipeline by hand.
#[derive(Default)]
pub struct RecordingQueue {
    dispatched: Mutex<Vec<Delivery>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<Delivery> {
        self.dispatched
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Removes and returns the oldest recorded dispatch.
    pub fn pop(&self) -> Option<Delivery> {
        let mut dispatched = self.dispatched.lock().ok()?;
        if dispatched.is_empty() {
            None
        } else {
            Some(dispatched.remove(0))
        }
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn dispatch(&self, stage: Stage, job_id: &str) -> Result<(), FlowError> {
        let mut dispatched = self
            .dispatched
            .lock()
            .map_err(|_| FlowError::Store("recording queue lock poisoned".into()))?;
        dispatched.push(Delivery {
            stage,
            job_id: job_id.to_string(),
        });
        Ok(())
    }
}
