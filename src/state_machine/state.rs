use std::fmt;

use serde::{Deserialize, Serialize};

/// Every state a job can occupy, across both pipelines.
///
/// Each pipeline only uses a subset; the [`Pipeline`] table decides which
/// states belong to it and in which order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Idle,
    ContextBuilding,
    CodePatching,
    Reviewing,
    AwaitingApproval,
    ApplyingPatch,
    Cloning,
    Scanning,
    Refactoring,
    Validating,
    CreatingPr,
    Done,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "IDLE",
            State::ContextBuilding => "CONTEXT_BUILDING",
            State::CodePatching => "CODE_PATCHING",
            State::Reviewing => "REVIEWING",
            State::AwaitingApproval => "AWAITING_APPROVAL",
            State::ApplyingPatch => "APPLYING_PATCH",
            State::Cloning => "CLONING",
            State::Scanning => "SCANNING",
            State::Refactoring => "REFACTORING",
            State::Validating => "VALIDATING",
            State::CreatingPr => "CREATING_PR",
            State::Done => "DONE",
            State::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Modify,
    Transform,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Modify => write!(f, "MODIFY"),
            JobKind::Transform => write!(f, "TRANSFORM"),
        }
    }
}

/// A named unit of work that the task queue dispatches for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BuildContext,
    GeneratePatch,
    ReviewPatch,
    ApplyPatch,
    CloneAndScan,
    Refactor,
    Validate,
    CreatePr,
}

impl Stage {
    pub fn kind(self) -> JobKind {
        match self {
            Stage::BuildContext | Stage::GeneratePatch | Stage::ReviewPatch | Stage::ApplyPatch => {
                JobKind::Modify
            }
            Stage::CloneAndScan | Stage::Refactor | Stage::Validate | Stage::CreatePr => {
                JobKind::Transform
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::BuildContext => "build_context",
            Stage::GeneratePatch => "generate_patch",
            Stage::ReviewPatch => "review_patch",
            Stage::ApplyPatch => "apply_patch",
            Stage::CloneAndScan => "clone_and_scan",
            Stage::Refactor => "refactor",
            Stage::Validate => "validate",
            Stage::CreatePr => "create_pr",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One node of a pipeline's stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDef {
    pub stage: Stage,
    /// The job must be in this state for the stage to act.
    pub pre_state: State,
    /// State claimed atomically before the executor runs, if any.
    pub running: Option<State>,
    pub on_success: State,
    /// Stage dispatched after a successful transition.
    pub next: Option<Stage>,
    /// Only an explicit approval may start this stage.
    pub gated: bool,
}

/// A state-machine table plus the stage graph interpreted by the orchestrator.
#[derive(Debug)]
pub struct Pipeline {
    pub kind: JobKind,
    /// Total order of the non-error states.
    pub order: &'static [State],
    pub initial: State,
    /// State persisted by `start_workflow`; its stage is dispatched first.
    pub entry: State,
    pub stages: &'static [StageDef],
}

pub static MODIFY: Pipeline = Pipeline {
    kind: JobKind::Modify,
    order: &[
        State::Idle,
        State::ContextBuilding,
        State::CodePatching,
        State::Reviewing,
        State::AwaitingApproval,
        State::ApplyingPatch,
        State::Done,
    ],
    initial: State::Idle,
    entry: State::ContextBuilding,
    stages: &[
        StageDef {
            stage: Stage::BuildContext,
            pre_state: State::ContextBuilding,
            running: None,
            on_success: State::CodePatching,
            next: Some(Stage::GeneratePatch),
            gated: false,
        },
        StageDef {
            stage: Stage::GeneratePatch,
            pre_state: State::CodePatching,
            running: None,
            on_success: State::Reviewing,
            next: Some(Stage::ReviewPatch),
            gated: false,
        },
        StageDef {
            stage: Stage::ReviewPatch,
            pre_state: State::Reviewing,
            running: None,
            on_success: State::AwaitingApproval,
            next: None,
            gated: false,
        },
        StageDef {
            stage: Stage::ApplyPatch,
            pre_state: State::AwaitingApproval,
            running: Some(State::ApplyingPatch),
            on_success: State::Done,
            next: None,
            gated: true,
        },
    ],
};

pub static TRANSFORM: Pipeline = Pipeline {
    kind: JobKind::Transform,
    order: &[
        State::Cloning,
        State::Scanning,
        State::Refactoring,
        State::Validating,
        State::CreatingPr,
        State::Done,
    ],
    initial: State::Cloning,
    entry: State::Cloning,
    stages: &[
        StageDef {
            stage: Stage::CloneAndScan,
            pre_state: State::Cloning,
            running: None,
            on_success: State::Refactoring,
            next: Some(Stage::Refactor),
            gated: false,
        },
        StageDef {
            stage: Stage::Refactor,
            pre_state: State::Refactoring,
            running: None,
            on_success: State::Validating,
            next: Some(Stage::Validate),
            gated: false,
        },
        StageDef {
            stage: Stage::Validate,
            pre_state: State::Validating,
            running: None,
            on_success: State::CreatingPr,
            next: Some(Stage::CreatePr),
            gated: false,
        },
        StageDef {
            stage: Stage::CreatePr,
            pre_state: State::CreatingPr,
            running: None,
            on_success: State::Done,
            next: None,
            gated: false,
        },
    ],
};

impl Pipeline {
    pub fn for_kind(kind: JobKind) -> &'static Pipeline {
        match kind {
            JobKind::Modify => &MODIFY,
            JobKind::Transform => &TRANSFORM,
        }
    }

    pub fn position(&self, state: State) -> Option<usize> {
        self.order.iter().position(|s| *s == state)
    }

    /// Whether `from -> to` moves strictly forward, or into ERROR from a
    /// non-terminal state.
    pub fn is_legal(&self, from: State, to: State) -> bool {
        if from.is_terminal() {
            return false;
        }
        if to == State::Error {
            return true;
        }
        match (self.position(from), self.position(to)) {
            (Some(a), Some(b)) => b > a,
            _ => false,
        }
    }

    pub fn stage_def(&self, stage: Stage) -> Option<&'static StageDef> {
        self.stages.iter().find(|d| d.stage == stage)
    }

    /// The stage whose `pre_state` is `state`, i.e. the next one to run.
    pub fn stage_for_state(&self, state: State) -> Option<&'static StageDef> {
        self.stages.iter().find(|d| d.pre_state == state)
    }

    pub fn gate(&self) -> Option<&'static StageDef> {
        self.stages.iter().find(|d| d.gated)
    }

    /// Terminal, or parked in front of a gated stage.
    pub fn is_settled(&self, state: State) -> bool {
        state.is_terminal() || self.gate().is_some_and(|g| g.pre_state == state)
    }
}
