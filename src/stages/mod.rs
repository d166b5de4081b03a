//! Stage executors for both pipelines.
//!
//! Each executor reads what it needs from the job, calls its collaborators and
//! returns the fields it produced. Transitions and dispatching belong to the
//! orchestrator.

mod modify;
mod transform;

pub use modify::{ApplyPatch, BuildContext, GeneratePatch, ReviewPatch};
pub use transform::{CloneAndScan, CreatePr, Refactor, Validate};

/// Model name and output budget for completion calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: u32,
}
