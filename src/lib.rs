//! Patchwright drives AI-assisted code changes through two staged pipelines.
//!
//! MODIFY builds context from a local project, asks a model for a unified
//! diff, reviews it and waits for approval before applying it. TRANSFORM
//! clones a repository, refactors it, runs its tests and opens a pull request.
//! Both are interpreted by one table-driven [`orchestrator::Orchestrator`].

pub mod anthropic;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod diff;
pub mod error;
pub mod git;
pub mod orchestrator;
pub mod process;
pub mod queue;
pub mod scanner;
pub mod stages;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod workflows;
pub mod workspace;

pub use error::FlowError;
