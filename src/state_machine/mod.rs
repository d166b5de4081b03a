mod job;
mod state;

pub use job::{Accumulated, FailureKind, Job, JobInputs, JobPatch, RetryConfig};
pub use state::{JobKind, MODIFY, Pipeline, Stage, StageDef, State, TRANSFORM};
