//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Patchwright: AI-assisted code modification and repository transformation.
#[derive(Debug, Parser)]
#[command(name = "patchwright", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Model to use for this session.
    #[arg(long, global = true)]
    pub model: Option<ModelArg>,

    /// Concurrent stage deliveries.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Directory holding the job records.
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModelArg {
    /// Fast and cheap, for small edits.
    Haiku,
    /// Balanced default.
    Sonnet,
    /// Most capable, for large refactors.
    Opus,
}

impl ModelArg {
    pub fn api_name(self) -> &'static str {
        match self {
            ModelArg::Haiku => "claude-haiku-4-5-20251001",
            ModelArg::Sonnet => "claude-sonnet-4-5-20250929",
            ModelArg::Opus => "claude-opus-4-6",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate and review a patch for a local project, then stop for approval.
    Modify {
        /// Owner of the project (UUID).
        #[arg(long)]
        user: String,

        /// Project to modify (UUID).
        #[arg(long)]
        project: String,

        /// What to change.
        prompt: String,
    },

    /// Clone a repository, refactor it, run its tests and open a pull request.
    Transform {
        /// Clone URL of the repository.
        repo_url: String,

        /// Refactoring goal.
        prompt: String,
    },

    /// Print a job record as JSON.
    Status { job_id: String },

    /// Approve a reviewed patch and apply it.
    Apply { job_id: String },

    /// Stop a job before its next stage runs.
    Cancel {
        job_id: String,

        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
}
